// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Profile, tier and level selection (H.265 Annex A).

use thiserror::Error;

use crate::codec::h265::parser::Level;
use crate::codec::h265::parser::ProfileInfo;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PtlError {
    #[error("unsupported chroma format {0}")]
    UnsupportedChromaFormat(u8),
    #[error("no allowed profile supports the requested format")]
    UnsupportedProfile,
    #[error("no level accommodates the requested stream")]
    UnsupportedLevel,
}

/// H.265 profiles the encoder can signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Profile {
    Main,
    Main10,
    MainStillPicture,
    Main12,
    Main422_10,
    Main444,
    Main444_10,
    ScreenExtendedMain,
    ScreenExtendedMain10,
    ScreenExtendedMain444,
    ScreenExtendedMain444_10,
}

/// General constraint flags of Table A.2 (range extensions) and Table A.5
/// (screen content coding), in syntax order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct ConstraintFlags {
    max_14bit: bool,
    max_12bit: bool,
    max_10bit: bool,
    max_8bit: bool,
    max_422chroma: bool,
    max_420chroma: bool,
    max_monochrome: bool,
    intra: bool,
    one_picture_only: bool,
    lower_bit_rate: bool,
}

impl Profile {
    /// general_profile_idc.
    pub fn profile_idc(&self) -> u8 {
        match self {
            Profile::Main => 1,
            Profile::Main10 => 2,
            Profile::MainStillPicture => 3,
            Profile::Main12 | Profile::Main422_10 | Profile::Main444 | Profile::Main444_10 => 4,
            Profile::ScreenExtendedMain
            | Profile::ScreenExtendedMain10
            | Profile::ScreenExtendedMain444
            | Profile::ScreenExtendedMain444_10 => 9,
        }
    }

    /// Maximum luma bit depth.
    pub fn max_bit_depth(&self) -> u8 {
        match self {
            Profile::Main | Profile::Main444 | Profile::ScreenExtendedMain
            | Profile::ScreenExtendedMain444 => 8,
            Profile::Main12 => 12,
            _ => 10,
        }
    }

    /// Whether the profile only admits intra coded streams.
    pub fn is_intra_only(&self) -> bool {
        matches!(self, Profile::MainStillPicture)
    }

    fn constraint_flags(&self) -> Option<ConstraintFlags> {
        let flags = |bits: [bool; 9]| ConstraintFlags {
            max_14bit: self.profile_idc() == 9,
            max_12bit: bits[0],
            max_10bit: bits[1],
            max_8bit: bits[2],
            max_422chroma: bits[3],
            max_420chroma: bits[4],
            max_monochrome: bits[5],
            intra: bits[6],
            one_picture_only: bits[7],
            lower_bit_rate: bits[8],
        };

        let flags = match self {
            Profile::Main | Profile::Main10 | Profile::MainStillPicture => return None,
            Profile::Main12 => flags([true, false, false, true, true, false, false, false, true]),
            Profile::Main422_10 => {
                flags([true, true, false, true, false, false, false, false, true])
            }
            Profile::Main444 => flags([true, true, true, false, false, false, false, false, true]),
            Profile::Main444_10 => {
                flags([true, true, false, false, false, false, false, false, true])
            }
            Profile::ScreenExtendedMain => {
                flags([true, true, true, true, true, false, false, false, true])
            }
            Profile::ScreenExtendedMain10 => {
                flags([true, true, false, true, true, false, false, false, true])
            }
            Profile::ScreenExtendedMain444 => {
                flags([true, true, true, false, false, false, false, false, true])
            }
            Profile::ScreenExtendedMain444_10 => {
                flags([true, true, false, false, false, false, false, false, true])
            }
        };

        Some(flags)
    }

    /// Fills in the profile part of a general profile_tier_level() for this
    /// profile, for progressive frame-only content.
    pub fn profile_info(&self, high_tier: bool) -> ProfileInfo {
        let idc = self.profile_idc();

        let mut info = ProfileInfo {
            tier_flag: high_tier,
            profile_idc: idc,
            progressive_source_flag: true,
            frame_only_constraint_flag: true,
            ..Default::default()
        };

        info.profile_compatibility_flag[usize::from(idc)] = true;
        // A Main stream is also decodable by Main 10 decoders.
        if matches!(self, Profile::Main) {
            info.profile_compatibility_flag[2] = true;
        }

        if matches!(self, Profile::MainStillPicture) {
            info.one_picture_only_constraint_flag = true;
        }

        if let Some(flags) = self.constraint_flags() {
            info.max_14bit_constraint_flag = flags.max_14bit;
            info.max_12bit_constraint_flag = flags.max_12bit;
            info.max_10bit_constraint_flag = flags.max_10bit;
            info.max_8bit_constraint_flag = flags.max_8bit;
            info.max_422chroma_constraint_flag = flags.max_422chroma;
            info.max_420chroma_constraint_flag = flags.max_420chroma;
            info.max_monochrome_constraint_flag = flags.max_monochrome;
            info.intra_constraint_flag = flags.intra;
            info.one_picture_only_constraint_flag = flags.one_picture_only;
            info.lower_bit_rate_constraint_flag = flags.lower_bit_rate;
        }

        info
    }
}

/// Picks the first profile, in preference order, that can carry
/// `chroma_format_idc` at `bit_depth` and is part of `allowed`. An empty
/// `allowed` admits every profile.
pub fn select_profile(
    chroma_format_idc: u8,
    bit_depth: u8,
    intra_only: bool,
    allowed: &[Profile],
) -> Result<Profile, PtlError> {
    let candidates: &[Profile] = match chroma_format_idc {
        3 => &[
            Profile::Main444,
            Profile::Main444_10,
            Profile::ScreenExtendedMain444,
            Profile::ScreenExtendedMain444_10,
        ],
        2 => &[Profile::Main422_10],
        0 | 1 => &[
            Profile::Main,
            Profile::Main10,
            Profile::Main12,
            Profile::MainStillPicture,
            Profile::ScreenExtendedMain,
            Profile::ScreenExtendedMain10,
        ],
        _ => return Err(PtlError::UnsupportedChromaFormat(chroma_format_idc)),
    };

    let profile = candidates
        .iter()
        .filter(|p| bit_depth <= p.max_bit_depth())
        .filter(|p| intra_only || !p.is_intra_only())
        .find(|p| allowed.is_empty() || allowed.contains(*p))
        .copied()
        .ok_or(PtlError::UnsupportedProfile)?;

    log::debug!(
        "Selected profile {:?} for chroma format {} at {} bits",
        profile,
        chroma_format_idc,
        bit_depth
    );

    Ok(profile)
}

/// One row of Table A.8, general tier and level limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LevelLimits {
    pub level: Level,
    /// MaxLumaPs, in samples.
    pub max_luma_ps: u32,
    /// MaxCPB for the Main and High tiers, in units of 1000 bits.
    pub max_cpb_main: u32,
    pub max_cpb_high: Option<u32>,
    pub max_slice_segments_per_picture: u32,
    pub max_tile_rows: u32,
    pub max_tile_cols: u32,
    /// MaxLumaSr, in samples per second.
    pub max_luma_sr: u64,
    /// MaxBR for the Main and High tiers, in units of 1000 bits/s.
    pub max_br_main: u32,
    pub max_br_high: Option<u32>,
}

const fn limits(
    level: Level,
    max_luma_ps: u32,
    max_cpb: (u32, Option<u32>),
    max_slice_segments_per_picture: u32,
    max_tile_rows: u32,
    max_tile_cols: u32,
    max_luma_sr: u64,
    max_br: (u32, Option<u32>),
) -> LevelLimits {
    LevelLimits {
        level,
        max_luma_ps,
        max_cpb_main: max_cpb.0,
        max_cpb_high: max_cpb.1,
        max_slice_segments_per_picture,
        max_tile_rows,
        max_tile_cols,
        max_luma_sr,
        max_br_main: max_br.0,
        max_br_high: max_br.1,
    }
}

/// Table A.8 and Table A.9.
#[rustfmt::skip]
pub static LEVEL_LIMITS: [LevelLimits; 13] = [
    limits(Level::L1, 36864, (350, None), 16, 1, 1, 552960, (128, None)),
    limits(Level::L2, 122880, (1500, None), 16, 1, 1, 3686400, (1500, None)),
    limits(Level::L2_1, 245760, (3000, None), 20, 1, 1, 7372800, (3000, None)),
    limits(Level::L3, 552960, (6000, None), 30, 2, 2, 16588800, (6000, None)),
    limits(Level::L3_1, 983040, (10000, None), 40, 3, 3, 33177600, (10000, None)),
    limits(Level::L4, 2228224, (12000, Some(30000)), 75, 5, 5, 66846720, (12000, Some(30000))),
    limits(Level::L4_1, 2228224, (20000, Some(50000)), 75, 5, 5, 133693440, (20000, Some(50000))),
    limits(Level::L5, 8912896, (25000, Some(100000)), 200, 11, 10, 267386880, (25000, Some(100000))),
    limits(Level::L5_1, 8912896, (40000, Some(160000)), 200, 11, 10, 534773760, (40000, Some(160000))),
    limits(Level::L5_2, 8912896, (60000, Some(240000)), 200, 11, 10, 1069547520, (60000, Some(240000))),
    limits(Level::L6, 35651584, (60000, Some(240000)), 600, 22, 20, 1069547520, (60000, Some(240000))),
    limits(Level::L6_1, 35651584, (120000, Some(480000)), 600, 22, 20, 2139095040, (120000, Some(480000))),
    limits(Level::L6_2, 35651584, (240000, Some(800000)), 600, 22, 20, 4278190080, (240000, Some(800000))),
];

impl LevelLimits {
    /// Looks up the row for `level`.
    pub fn for_level(level: Level) -> Option<&'static LevelLimits> {
        LEVEL_LIMITS.iter().find(|l| l.level == level)
    }

    /// general_level_idc for this row.
    pub fn level_idc(&self) -> u8 {
        self.level as u8
    }

    fn fits(&self, pic_size_in_samples: u32, luma_sr: u64, tiles: Option<(u32, u32)>) -> bool {
        pic_size_in_samples <= self.max_luma_ps
            && luma_sr <= self.max_luma_sr
            && tiles.map_or(true, |(cols, rows)| {
                cols <= self.max_tile_cols && rows <= self.max_tile_rows
            })
    }
}

/// Result of the level and tier selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LevelSelection {
    pub limits: &'static LevelLimits,
    pub high_tier: bool,
}

/// Picks the lowest level whose picture size, luma sample rate and tile
/// limits hold, in the Main tier if `bitrate_kbps` is within its MaxBR and in
/// the High tier otherwise. `tiles` is (columns, rows). Fails when no level
/// allows the bitrate.
pub fn select_level(
    pic_size_in_samples: u32,
    luma_sr: u64,
    tiles: Option<(u32, u32)>,
    bitrate_kbps: u32,
) -> Result<LevelSelection, PtlError> {
    let mut candidates = LEVEL_LIMITS
        .iter()
        .filter(|l| l.fits(pic_size_in_samples, luma_sr, tiles))
        .peekable();

    if candidates.peek().is_none() {
        return Err(PtlError::UnsupportedLevel);
    }

    for limits in candidates {
        if bitrate_kbps <= limits.max_br_main {
            log::debug!("Selected level {:?}, main tier", limits.level);
            return Ok(LevelSelection {
                limits,
                high_tier: false,
            });
        }

        if limits.max_br_high.is_some_and(|max| bitrate_kbps <= max) {
            log::debug!("Selected level {:?}, high tier", limits.level);
            return Ok(LevelSelection {
                limits,
                high_tier: true,
            });
        }
    }

    log::warn!("Bitrate of {} kbps exceeds every level's MaxBR", bitrate_kbps);
    Err(PtlError::UnsupportedLevel)
}
