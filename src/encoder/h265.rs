// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.265 encoder context. Turns input frames into per-picture requests holding
//! the parameter sets, slice headers and reference lists a hardware backend
//! needs, along with the packed headers to prepend to its output.

pub mod ref_pool;
pub mod reorder;
pub mod slices;

use std::rc::Rc;

use crate::codec::h265::hvcc::HvccBox;
use crate::codec::h265::level::select_level;
use crate::codec::h265::level::select_profile;
use crate::codec::h265::level::LevelSelection;
use crate::codec::h265::level::Profile;
use crate::codec::h265::parser::ceil_log2;
use crate::codec::h265::parser::NaluType;
use crate::codec::h265::parser::Pps;
use crate::codec::h265::parser::ProfileTierLevel;
use crate::codec::h265::parser::ShortTermRefPicSet;
use crate::codec::h265::parser::SliceHeader;
use crate::codec::h265::parser::SliceType;
use crate::codec::h265::parser::Sps;
use crate::codec::h265::parser::Vps;
use crate::codec::h265::synthesizer::Synthesizer;
use crate::encoder::h265::ref_pool::RefLists;
use crate::encoder::h265::ref_pool::ReferencePool;
use crate::encoder::h265::reorder::EncoderPicture;
use crate::encoder::h265::reorder::GopStructure;
use crate::encoder::h265::reorder::PictureType;
use crate::encoder::h265::reorder::ReorderScheduler;
use crate::encoder::h265::slices::partition;
use crate::encoder::h265::slices::SliceRounding;
use crate::encoder::h265::slices::SliceSegment;
use crate::encoder::h265::slices::TileGrid;
use crate::encoder::CodedBitstreamBuffer;
use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;
use crate::encoder::FrameMetadata;
use crate::encoder::RateControl;
use crate::Resolution;

/// Extended Sample Aspect Ratio - H.265 Table E-1
const EXTENDED_SAR: u8 = 255;

/// Bitrate and CPB size granularity in the HRD, as 6 + bit_rate_scale and
/// 4 + cpb_size_scale (E.3.3).
const BITRATE_SHIFT: u32 = 6;
const CPB_SIZE_SHIFT: u32 = 4;

const MAX_QP: u32 = 51;

/// Largest number of reference frames that still leaves room in the DPB for
/// the current picture and a B-frame reference.
const MAX_REF_FRAMES: u32 = 14;

const NANOS_PER_SECOND: u64 = 1_000_000_000;

#[derive(Clone, Debug)]
pub struct EncoderConfig {
    pub resolution: Resolution,
    /// Frame rate as (numerator, denominator).
    pub framerate: (u32, u32),
    pub pixel_aspect_ratio: (u32, u32),
    pub chroma_format_idc: u8,
    pub bit_depth_luma: u8,
    pub bit_depth_chroma: u8,
    /// Distance between I frames.
    pub keyframe_period: u32,
    /// Distance between IDR frames. Raised to `keyframe_period` if lower,
    /// twice `keyframe_period` when 0.
    pub idr_period: u32,
    pub num_bframes: u32,
    pub num_ref_frames: u32,
    pub init_qp: u32,
    pub min_qp: u32,
    pub max_qp: u32,
    /// QP difference of P frames with I frames, in CQP mode.
    pub qp_ip: i32,
    /// QP difference of B frames with I frames, in CQP mode.
    pub qp_ib: i32,
    pub rate_control: RateControl,
    /// Target bitrate. Estimated from the resolution when 0 and the rate
    /// control needs one.
    pub bitrate_kbps: u32,
    pub cpb_length_ms: u32,
    pub num_slices: u32,
    pub num_tile_cols: u32,
    pub num_tile_rows: u32,
    /// Whether a slice may cover several whole tiles. Otherwise each tile
    /// gets its own slices.
    pub slice_spans_tiles: bool,
    pub slice_rounding: SliceRounding,
    /// CTU size in luma samples: 16, 32 or 64.
    pub ctu_size: u32,
    /// Profiles the stream may use. Empty allows any.
    pub allowed_profiles: Vec<Profile>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        // Artificially encoder configuration with intent to be widely supported.
        Self {
            resolution: Resolution {
                width: 320,
                height: 240,
            },
            framerate: (30, 1),
            pixel_aspect_ratio: (1, 1),
            chroma_format_idc: 1,
            bit_depth_luma: 8,
            bit_depth_chroma: 8,
            keyframe_period: 30,
            idr_period: 0,
            num_bframes: 0,
            num_ref_frames: 1,
            init_qp: 26,
            min_qp: 1,
            max_qp: MAX_QP,
            qp_ip: 0,
            qp_ib: 0,
            rate_control: RateControl::Cqp,
            bitrate_kbps: 0,
            cpb_length_ms: 1500,
            num_slices: 1,
            num_tile_cols: 1,
            num_tile_rows: 1,
            slice_spans_tiles: false,
            slice_rounding: SliceRounding::RowAligned,
            ctu_size: 32,
            allowed_profiles: vec![],
        }
    }
}

fn invalid(msg: impl Into<String>) -> EncodeError {
    EncodeError::InvalidConfig(msg.into())
}

/// Stream properties computed from an [`EncoderConfig`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DerivedProperties {
    pub profile: Profile,
    pub level: LevelSelection,
    pub keyframe_period: u32,
    pub idr_period: u32,
    pub num_bframes: u32,
    pub init_qp: u32,
    pub min_qp: u32,
    pub max_qp: u32,
    pub ctu_width: u32,
    pub ctu_height: u32,
    pub max_dec_pic_buffering: u32,
    pub max_num_reorder: u32,
    pub max_reflist0: usize,
    pub max_reflist1: usize,
    pub log2_max_poc: u32,
    pub max_poc: u32,
    /// Presentation delay introduced by reordering, in nanoseconds.
    pub cts_offset: u64,
    pub bitrate_kbps: u32,
    /// HRD bitrate in bits per second, 0 when the HRD is not signalled.
    pub hrd_bitrate: u32,
    /// HRD CPB size in bits.
    pub hrd_cpb_size: u32,
    pub num_slices: u32,
    pub tiles: Option<TileGrid>,
}

impl DerivedProperties {
    pub fn new(config: &EncoderConfig) -> EncodeResult<Self> {
        let Resolution { width, height } = config.resolution;
        if width == 0 || height == 0 {
            return Err(invalid("empty resolution"));
        }

        let (fps_n, fps_d) = config.framerate;
        if fps_n == 0 || fps_d == 0 {
            return Err(invalid(format!("invalid frame rate {}/{}", fps_n, fps_d)));
        }

        if !matches!(config.ctu_size, 16 | 32 | 64) {
            return Err(invalid(format!("unsupported CTU size {}", config.ctu_size)));
        }

        if config.keyframe_period == 0 {
            return Err(invalid("keyframe period must be at least 1"));
        }

        if config.min_qp > config.max_qp || config.max_qp > MAX_QP {
            return Err(invalid(format!(
                "invalid QP range {}..={}",
                config.min_qp, config.max_qp
            )));
        }

        let depth_range = 8..=16;
        if !depth_range.contains(&config.bit_depth_luma)
            || !depth_range.contains(&config.bit_depth_chroma)
        {
            return Err(invalid("bit depths must be within 8..=16"));
        }

        let profile = select_profile(
            config.chroma_format_idc,
            std::cmp::max(config.bit_depth_luma, config.bit_depth_chroma),
            config.keyframe_period == 1,
            &config.allowed_profiles,
        )?;

        // Table 6-1
        let (sub_width_c, sub_height_c) = match config.chroma_format_idc {
            1 => (2, 2),
            2 => (2, 1),
            _ => (1, 1),
        };
        if width % sub_width_c != 0 || height % sub_height_c != 0 {
            return Err(invalid(format!(
                "{}x{} is not a multiple of the chroma subsampling",
                width, height
            )));
        }

        if width > u32::from(u16::MAX) || height > u32::from(u16::MAX) {
            return Err(invalid(format!("resolution {}x{} too large", width, height)));
        }

        let aligned = config.resolution.round_up(config.ctu_size);
        let ctu_width = aligned.width / config.ctu_size;
        let ctu_height = aligned.height / config.ctu_size;
        let luma_width = u64::from(aligned.width);
        let luma_height = u64::from(aligned.height);
        if luma_width > u64::from(u16::MAX) || luma_height > u64::from(u16::MAX) {
            return Err(invalid(format!("resolution {}x{} too large", width, height)));
        }

        let bitrate_kbps = if !config.rate_control.has_bitrate() {
            0
        } else if config.bitrate_kbps == 0 {
            // 12 bits per pixel for 4:2:0, compressed by 6.
            let factor = luma_width * luma_height * 12 / 6;
            let kbps = factor * u64::from(fps_n) / u64::from(fps_d) / 1000;
            let kbps = u32::try_from(kbps).unwrap_or(u32::MAX);
            log::info!("Target bitrate computed to {} kbps", kbps);
            kbps
        } else {
            config.bitrate_kbps
        };

        let hrd_bitrate = u32::try_from(u64::from(bitrate_kbps) * 1000)
            .map_err(|_| invalid(format!("bitrate of {} kbps too high", bitrate_kbps)))?
            & !((1u32 << BITRATE_SHIFT) - 1);
        let hrd_cpb_size = (u64::from(hrd_bitrate) * u64::from(config.cpb_length_ms) / 1000)
            .min(u64::from(u32::MAX)) as u32
            & !((1u32 << CPB_SIZE_SHIFT) - 1);

        if config.num_tile_cols == 0 || config.num_tile_rows == 0 {
            return Err(invalid("tile columns and rows must be at least 1"));
        }
        let tiles_enabled = config.num_tile_cols > 1 || config.num_tile_rows > 1;

        if ctu_width < config.num_tile_cols || ctu_height < config.num_tile_rows {
            return Err(invalid(format!(
                "{}x{} CTUs cannot be split into {}x{} tiles",
                ctu_width, ctu_height, config.num_tile_cols, config.num_tile_rows
            )));
        }

        let pic_size = (luma_width * luma_height) as u32;
        let luma_sr = u64::from(pic_size) * u64::from(fps_n) / u64::from(fps_d);
        let level = select_level(
            pic_size,
            luma_sr,
            tiles_enabled.then_some((config.num_tile_cols, config.num_tile_rows)),
            bitrate_kbps,
        )?;

        let keyframe_period = config.keyframe_period;
        let idr_period = match config.idr_period {
            0 => keyframe_period.saturating_mul(2),
            idr_period => std::cmp::max(idr_period, keyframe_period),
        };

        let max_bframes = (keyframe_period + 1) / 2;
        let num_bframes = if config.num_bframes > max_bframes {
            log::warn!(
                "Lowering the number of B-frames from {} to {}",
                config.num_bframes,
                max_bframes
            );
            max_bframes
        } else {
            config.num_bframes
        };

        let num_ref_frames = config.num_ref_frames.clamp(1, MAX_REF_FRAMES);
        if num_ref_frames != config.num_ref_frames {
            log::warn!("Using {} reference frames", num_ref_frames);
        }

        let (max_dec_pic_buffering, max_num_reorder) = if num_bframes > 0 {
            (num_ref_frames + 2, 1)
        } else {
            (num_ref_frames + 1, 0)
        };

        let init_qp = config.init_qp.clamp(config.min_qp, config.max_qp);
        if init_qp != config.init_qp {
            log::warn!("Clamping initial QP {} to {}", config.init_qp, init_qp);
        }

        // Consecutive P pictures are num_bframes + 1 apart, which must stay
        // below MaxPicOrderCntLsb / 2 for the decoder to recover the MSBs.
        let min_max_poc = num_bframes.saturating_add(1).saturating_mul(2).saturating_add(1);
        let log2_max_poc =
            (ceil_log2(std::cmp::max(idr_period, min_max_poc)) as u32).clamp(4, 16);

        let cts_offset = if num_bframes > 0 {
            NANOS_PER_SECOND * u64::from(fps_d) / u64::from(fps_n)
        } else {
            0
        };

        let ctu_count = ctu_width * ctu_height;
        let tiles = tiles_enabled.then(|| {
            TileGrid::uniform(
                ctu_width,
                ctu_height,
                config.num_tile_cols,
                config.num_tile_rows,
            )
        });

        let max_slices = std::cmp::min(
            (ctu_count + 1) / 2,
            level.limits.max_slice_segments_per_picture,
        )
        .max(1);

        let num_slices = match &tiles {
            Some(grid) => grid.num_slices(config.num_slices, config.slice_spans_tiles),
            None => config.num_slices.max(1),
        };

        let num_slices = if num_slices <= max_slices {
            num_slices
        } else if tiles.is_some() && !config.slice_spans_tiles {
            return Err(invalid(format!(
                "the tiles need {} slices, but at most {} are allowed",
                num_slices, max_slices
            )));
        } else {
            log::warn!("Lowering the number of slices from {} to {}", num_slices, max_slices);
            max_slices
        };

        Ok(Self {
            profile,
            level,
            keyframe_period,
            idr_period,
            num_bframes,
            init_qp,
            min_qp: config.min_qp,
            max_qp: config.max_qp,
            ctu_width,
            ctu_height,
            max_dec_pic_buffering,
            max_num_reorder,
            max_reflist0: num_ref_frames as usize,
            max_reflist1: usize::from(num_bframes > 0),
            log2_max_poc,
            max_poc: 1 << log2_max_poc,
            cts_offset,
            bitrate_kbps,
            hrd_bitrate,
            hrd_cpb_size,
            num_slices,
            tiles,
        })
    }

    /// Capacity of the reference pool.
    pub fn max_ref_frames(&self) -> usize {
        self.max_reflist0 + self.max_reflist1
    }

    fn gop_structure(&self) -> GopStructure {
        GopStructure {
            keyframe_period: self.keyframe_period,
            idr_period: self.idr_period,
            num_bframes: self.num_bframes,
            cts_offset: self.cts_offset,
        }
    }

    fn profile_tier_level(&self) -> ProfileTierLevel {
        ProfileTierLevel {
            general: self.profile.profile_info(self.level.high_tier),
            general_level_idc: self.level.limits.level_idc(),
            ..Default::default()
        }
    }
}

fn build_vps(props: &DerivedProperties) -> Vps {
    let mut vps = Vps {
        video_parameter_set_id: 0,
        base_layer_internal_flag: true,
        base_layer_available_flag: true,
        temporal_id_nesting_flag: true,
        profile_tier_level: props.profile_tier_level(),
        ..Default::default()
    };

    vps.max_dec_pic_buffering_minus1[0] = props.max_dec_pic_buffering - 1;
    vps.max_num_reorder_pics[0] = props.max_num_reorder;

    vps
}

fn build_sps(config: &EncoderConfig, props: &DerivedProperties) -> Sps {
    let ctu_log2 = config.ctu_size.trailing_zeros();
    let luma_width = props.ctu_width * config.ctu_size;
    let luma_height = props.ctu_height * config.ctu_size;

    let mut sps = Sps {
        video_parameter_set_id: 0,
        temporal_id_nesting_flag: true,
        profile_tier_level: props.profile_tier_level(),
        seq_parameter_set_id: 0,
        chroma_format_idc: config.chroma_format_idc,
        pic_width_in_luma_samples: luma_width as u16,
        pic_height_in_luma_samples: luma_height as u16,
        bit_depth_luma_minus8: config.bit_depth_luma - 8,
        bit_depth_chroma_minus8: config.bit_depth_chroma - 8,
        log2_max_pic_order_cnt_lsb_minus4: (props.log2_max_poc - 4) as u8,
        log2_min_luma_coding_block_size_minus3: 0,
        log2_diff_max_min_luma_coding_block_size: (ctu_log2 - 3) as u8,
        log2_min_luma_transform_block_size_minus2: 0,
        // MaxTbLog2SizeY may not exceed Min(CtbLog2SizeY, 5).
        log2_diff_max_min_luma_transform_block_size: (std::cmp::min(ctu_log2, 5) - 2) as u8,
        max_transform_hierarchy_depth_inter: 2,
        max_transform_hierarchy_depth_intra: 2,
        amp_enabled_flag: true,
        sample_adaptive_offset_enabled_flag: false,
        pcm_enabled_flag: false,
        num_short_term_ref_pic_sets: 0,
        long_term_ref_pics_present_flag: false,
        temporal_mvp_enabled_flag: true,
        strong_intra_smoothing_enabled_flag: true,
        vui_parameters_present_flag: true,
        ..Default::default()
    };

    sps.max_dec_pic_buffering_minus1[0] = (props.max_dec_pic_buffering - 1) as u8;
    sps.max_num_reorder_pics[0] = props.max_num_reorder as u8;

    sps.update_derived();

    let pad_width = luma_width - config.resolution.width;
    let pad_height = luma_height - config.resolution.height;
    if pad_width > 0 || pad_height > 0 {
        sps.conformance_window_flag = true;
        sps.conf_win_right_offset = pad_width / sps.sub_width_c();
        sps.conf_win_bottom_offset = pad_height / sps.sub_height_c();
    }

    let vui = &mut sps.vui_parameters;
    vui.aspect_ratio_info_present_flag = true;
    vui.aspect_ratio_idc = EXTENDED_SAR;
    vui.sar_width = config.pixel_aspect_ratio.0.min(u32::from(u16::MAX)) as u16;
    vui.sar_height = config.pixel_aspect_ratio.1.min(u32::from(u16::MAX)) as u16;
    vui.timing_info_present_flag = true;
    vui.num_units_in_tick = config.framerate.1;
    vui.time_scale = config.framerate.0;

    if props.hrd_bitrate > 0 {
        vui.hrd_parameters_present_flag = true;
        let hrd = &mut vui.hrd;
        hrd.nal_hrd_parameters_present_flag = true;
        hrd.bit_rate_scale = (BITRATE_SHIFT - 6) as u8;
        hrd.cpb_size_scale = (CPB_SIZE_SHIFT - 4) as u8;
        hrd.low_delay_hrd_flag[0] = true;
        hrd.nal_hrd[0].bit_rate_value_minus1[0] = (props.hrd_bitrate >> BITRATE_SHIFT) - 1;
        hrd.nal_hrd[0].cpb_size_value_minus1[0] =
            (props.hrd_cpb_size >> CPB_SIZE_SHIFT).saturating_sub(1);
        hrd.nal_hrd[0].cbr_flag[0] = config.rate_control == RateControl::Cbr;
    }

    sps
}

fn build_pps(config: &EncoderConfig, props: &DerivedProperties, sps: &Sps) -> Pps {
    let mut pps = Pps {
        pic_parameter_set_id: 0,
        seq_parameter_set_id: sps.seq_parameter_set_id,
        init_qp_minus26: (props.init_qp as i32 - 26) as i8,
        num_ref_idx_l0_default_active_minus1: (props.max_reflist0 - 1) as u8,
        num_ref_idx_l1_default_active_minus1: (std::cmp::max(props.max_reflist1, 1) - 1) as u8,
        transform_skip_enabled_flag: true,
        cu_qp_delta_enabled_flag: config.rate_control != RateControl::Cqp,
        sign_data_hiding_enabled_flag: false,
        loop_filter_across_slices_enabled_flag: true,
        qp_bd_offset_y: 6 * u32::from(sps.bit_depth_luma_minus8),
        ..Default::default()
    };

    if let Some(grid) = &props.tiles {
        pps.tiles_enabled_flag = true;
        pps.uniform_spacing_flag = true;
        pps.num_tile_columns_minus1 = (grid.column_widths.len() - 1) as u8;
        pps.num_tile_rows_minus1 = (grid.row_heights.len() - 1) as u8;
        pps.loop_filter_across_tiles_enabled_flag = true;
        pps.update_uniform_tiles(sps);
    }

    pps
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PackedHeaderKind {
    Vps,
    Sps,
    Pps,
    Slice,
}

/// An Annex B NAL unit for the backend to write ahead of its own output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackedHeader {
    pub kind: PackedHeaderKind,
    pub data: Vec<u8>,
}

/// Everything a backend needs to code one picture.
pub struct BackendRequest<P> {
    /// Input frame to be encoded
    pub input: P,
    /// Input frame metadata, with the reordering delay applied.
    pub input_meta: FrameMetadata,
    pub poc: u32,
    pub type_: PictureType,
    pub is_idr: bool,
    pub nalu_type: NaluType,
    pub vps: Rc<Vps>,
    pub sps: Rc<Sps>,
    pub pps: Rc<Pps>,
    /// CTU ranges of the slices, matching `slice_headers`.
    pub slice_segments: Vec<SliceSegment>,
    pub slice_headers: Vec<SliceHeader>,
    /// POCs of the reference pictures.
    pub ref_lists: RefLists,
    /// Parameter sets (IDR only) followed by one header per slice.
    pub packed_headers: Vec<PackedHeader>,
}

impl<P> BackendRequest<P> {
    /// The packed headers as one Annex B buffer. The backend completes each
    /// slice NAL unit with its slice data.
    pub fn packed_bitstream(&self) -> CodedBitstreamBuffer {
        let bitstream = self
            .packed_headers
            .iter()
            .flat_map(|h| h.data.iter().copied())
            .collect();

        CodedBitstreamBuffer::new(self.input_meta.clone(), bitstream)
    }
}

pub struct EncoderContext<P> {
    config: EncoderConfig,
    props: DerivedProperties,
    vps: Rc<Vps>,
    sps: Rc<Sps>,
    pps: Rc<Pps>,
    slice_segments: Vec<SliceSegment>,
    scheduler: ReorderScheduler<P>,
    ref_pool: ReferencePool,
}

impl<P> EncoderContext<P> {
    /// Validates `config` and prepares the parameter sets. Configuration
    /// errors are reported here, before any frame is accepted.
    pub fn new(config: EncoderConfig) -> EncodeResult<Self> {
        let props = DerivedProperties::new(&config)?;

        let vps = build_vps(&props);
        let sps = build_sps(&config, &props);
        let pps = build_pps(&config, &props, &sps);

        let slice_segments = match &props.tiles {
            Some(grid) => grid.partition(props.num_slices, config.slice_spans_tiles),
            None => partition(
                props.ctu_width,
                props.ctu_height,
                props.num_slices,
                config.slice_rounding,
            ),
        };

        log::debug!(
            "New H.265 sequence: {:?} level {:?}{}, {}x{} CTUs in {} slices, {} B-frames",
            props.profile,
            props.level.limits.level,
            if props.level.high_tier { " high tier" } else { "" },
            props.ctu_width,
            props.ctu_height,
            slice_segments.len(),
            props.num_bframes
        );

        Ok(Self {
            scheduler: ReorderScheduler::new(props.gop_structure()),
            ref_pool: ReferencePool::new(props.max_reflist0, props.max_reflist1),
            config,
            props,
            vps: Rc::new(vps),
            sps: Rc::new(sps),
            pps: Rc::new(pps),
            slice_segments,
        })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn props(&self) -> &DerivedProperties {
        &self.props
    }

    pub fn vps(&self) -> &Rc<Vps> {
        &self.vps
    }

    pub fn sps(&self) -> &Rc<Sps> {
        &self.sps
    }

    pub fn pps(&self) -> &Rc<Pps> {
        &self.pps
    }

    pub fn slice_segments(&self) -> &[SliceSegment] {
        &self.slice_segments
    }

    pub fn ref_pool(&self) -> &ReferencePool {
        &self.ref_pool
    }

    /// Queues `input` for encoding and returns the requests for every picture
    /// that can be coded now, in coding order.
    pub fn encode(&mut self, input: P, meta: FrameMetadata) -> EncodeResult<Vec<BackendRequest<P>>> {
        let mut requests = Vec::new();

        let mut next = self.scheduler.reorder(Some((input, meta)));
        while let Some(pic) = next {
            requests.push(self.request(pic)?);
            next = self.scheduler.reorder(None);
        }

        Ok(requests)
    }

    /// Codes the frames held for reordering and restarts the GOP.
    pub fn drain(&mut self) -> EncodeResult<Vec<BackendRequest<P>>> {
        let requests = self
            .scheduler
            .drain()
            .into_iter()
            .map(|pic| self.request(pic))
            .collect::<EncodeResult<Vec<_>>>();

        self.flush();
        requests
    }

    /// Drops the held frames and the references, so that the next frame
    /// starts a new coded video sequence. Returns the dropped inputs.
    pub fn flush(&mut self) -> Vec<P> {
        self.ref_pool.clear();
        self.scheduler.flush()
    }

    /// Switches to `config`. The frames held so far are coded with the
    /// current parameters and returned, and the next frame is an IDR.
    /// On error the current configuration stays in effect.
    pub fn reconfigure(&mut self, config: EncoderConfig) -> EncodeResult<Vec<BackendRequest<P>>> {
        let next = Self::new(config)?;
        let requests = self.drain()?;
        *self = next;

        Ok(requests)
    }

    /// The VPS, SPS and PPS as packed headers.
    fn packed_parameter_sets(&self) -> EncodeResult<Vec<PackedHeader>> {
        let mut vps = Vec::new();
        Synthesizer::<Vps, &mut Vec<u8>>::synthesize(&self.vps, &mut vps, true)?;
        let mut sps = Vec::new();
        Synthesizer::<Sps, &mut Vec<u8>>::synthesize(&self.sps, &mut sps, true)?;
        let mut pps = Vec::new();
        Synthesizer::<Pps, &mut Vec<u8>>::synthesize(&self.pps, &mut pps, true)?;

        Ok(vec![
            PackedHeader {
                kind: PackedHeaderKind::Vps,
                data: vps,
            },
            PackedHeader {
                kind: PackedHeaderKind::Sps,
                data: sps,
            },
            PackedHeader {
                kind: PackedHeaderKind::Pps,
                data: pps,
            },
        ])
    }

    /// The VPS, SPS and PPS as an Annex B stream.
    pub fn parameter_sets(&self) -> EncodeResult<Vec<u8>> {
        Ok(self
            .packed_parameter_sets()?
            .into_iter()
            .flat_map(|h| h.data)
            .collect())
    }

    /// The hvcC decoder configuration record of the stream.
    pub fn codec_data(&self) -> EncodeResult<Vec<u8>> {
        let parameter_sets = self.parameter_sets()?;
        let hvcc = HvccBox::new(&self.sps, &self.pps, &parameter_sets)?;

        Ok(hvcc.to_bytes()?)
    }

    fn slice_qp_delta(&self, type_: PictureType) -> i8 {
        if self.config.rate_control != RateControl::Cqp {
            return 0;
        }

        let delta = match type_ {
            PictureType::P => self.config.qp_ip,
            PictureType::B => self.config.qp_ib,
            _ => 0,
        };

        let init_qp = self.props.init_qp as i32;
        let qp = (init_qp + delta).clamp(self.props.min_qp as i32, self.props.max_qp as i32);

        (qp - init_qp) as i8
    }

    fn slice_headers(
        &self,
        pic: &EncoderPicture<P>,
        slice_type: SliceType,
        lists: &RefLists,
        rps: &ShortTermRefPicSet,
    ) -> Vec<SliceHeader> {
        let pps = &self.pps;
        let sps = &self.sps;

        let num_l0 = lists.list0.len().max(1);
        let num_l1 = if slice_type.is_b() {
            lists.list1.len().max(1)
        } else {
            1
        };

        let default_l0 = usize::from(pps.num_ref_idx_l0_default_active_minus1) + 1;
        let default_l1 = usize::from(pps.num_ref_idx_l1_default_active_minus1) + 1;
        let override_flag = match slice_type {
            SliceType::P => num_l0 != default_l0,
            SliceType::B => num_l0 != default_l0 || num_l1 != default_l1,
            SliceType::I => false,
        };

        let qp_delta = self.slice_qp_delta(pic.type_);
        let sao = sps.sample_adaptive_offset_enabled_flag;

        self.slice_segments
            .iter()
            .enumerate()
            .map(|(i, segment)| SliceHeader {
                first_slice_segment_in_pic_flag: i == 0,
                pic_parameter_set_id: pps.pic_parameter_set_id,
                segment_address: segment.address,
                type_: slice_type,
                pic_order_cnt_lsb: (pic.poc % self.props.max_poc) as u16,
                short_term_ref_pic_set_sps_flag: false,
                short_term_ref_pic_set: rps.clone(),
                temporal_mvp_enabled_flag: sps.temporal_mvp_enabled_flag && !pic.is_idr,
                sao_luma_flag: sao,
                sao_chroma_flag: sao && sps.chroma_array_type != 0,
                num_ref_idx_active_override_flag: override_flag,
                num_ref_idx_l0_active_minus1: (num_l0 - 1) as u8,
                num_ref_idx_l1_active_minus1: (num_l1 - 1) as u8,
                five_minus_max_num_merge_cand: 0,
                qp_delta,
                loop_filter_across_slices_enabled_flag: true,
                num_entry_point_offsets: 0,
                ..Default::default()
            })
            .collect()
    }

    fn request(&mut self, pic: EncoderPicture<P>) -> EncodeResult<BackendRequest<P>> {
        let slice_type = match pic.type_ {
            PictureType::I => SliceType::I,
            PictureType::P => SliceType::P,
            PictureType::B => SliceType::B,
            PictureType::None => return Err(EncodeError::InvalidInternalState),
        };

        let nalu_type = if pic.is_idr {
            NaluType::IdrWRadl
        } else if slice_type.is_b() {
            NaluType::TrailN
        } else {
            NaluType::TrailR
        };

        let ref_lists = self.ref_pool.ref_lists(pic.poc, pic.type_);
        if !slice_type.is_i() && ref_lists.list0.is_empty() && ref_lists.list1.is_empty() {
            return Err(EncodeError::InvalidInternalState);
        }

        let rps = if pic.is_idr {
            ShortTermRefPicSet::default()
        } else {
            self.ref_pool.short_term_rps(pic.poc, &ref_lists)
        };

        let slice_headers = self.slice_headers(&pic, slice_type, &ref_lists, &rps);

        let mut packed_headers = if pic.is_idr {
            self.packed_parameter_sets()?
        } else {
            Vec::new()
        };

        for hdr in &slice_headers {
            let mut data = Vec::new();
            Synthesizer::<SliceHeader, &mut Vec<u8>>::synthesize(
                nalu_type, hdr, &self.sps, &self.pps, &mut data, true,
            )?;

            packed_headers.push(PackedHeader {
                kind: PackedHeaderKind::Slice,
                data,
            });
        }

        log::trace!(
            "Request for POC {}: list0 {:?}, list1 {:?}",
            pic.poc,
            ref_lists.list0,
            ref_lists.list1
        );

        self.ref_pool.update(pic.poc, pic.type_, pic.is_idr);

        Ok(BackendRequest {
            input: pic.input,
            input_meta: pic.meta,
            poc: pic.poc,
            type_: pic.type_,
            is_idr: pic.is_idr,
            nalu_type,
            vps: Rc::clone(&self.vps),
            sps: Rc::clone(&self.sps),
            pps: Rc::clone(&self.pps),
            slice_segments: self.slice_segments.clone(),
            slice_headers,
            ref_lists,
            packed_headers,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::codec::h265::parser::Level;
    use crate::codec::h265::parser::Nalu;
    use crate::codec::h265::parser::Parser;
    use crate::decoder::h265::dummy::DummyBackend;
    use crate::decoder::h265::DecoderContext;

    fn config_1080p() -> EncoderConfig {
        EncoderConfig {
            resolution: Resolution {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        }
    }

    /// Parses the VPS, SPS and PPS of `ctx` back.
    fn parse_parameter_sets(ctx: &EncoderContext<u64>) -> (Rc<Sps>, Rc<Pps>) {
        let bytes = ctx.parameter_sets().unwrap();
        let mut cursor = Cursor::new(&bytes[..]);
        let mut parser = Parser::default();

        parser.parse_vps(&Nalu::next(&mut cursor).unwrap()).unwrap();
        let sps = parser
            .parse_sps(&Nalu::next(&mut cursor).unwrap())
            .unwrap()
            .clone();
        let pps = parser
            .parse_pps(&Nalu::next(&mut cursor).unwrap())
            .unwrap()
            .clone();

        (sps, pps)
    }

    #[test]
    fn ctu_aligned_geometry() {
        let ctx = EncoderContext::<u64>::new(config_1080p()).unwrap();
        assert_eq!(ctx.props().ctu_width, 60);
        assert_eq!(ctx.props().ctu_height, 34);

        let sps = ctx.sps();
        assert_eq!(sps.pic_width_in_luma_samples, 1920);
        assert_eq!(sps.pic_height_in_luma_samples, 1088);
        assert!(sps.conformance_window_flag);
        assert_eq!(sps.conf_win_right_offset, 0);
        assert_eq!(sps.conf_win_bottom_offset, (34 * 32 - 1080) / 2);
        assert_eq!(sps.width(), 1920);
        assert_eq!(sps.height(), 1080);

        // Aligned sizes need no cropping.
        let ctx = EncoderContext::<u64>::new(EncoderConfig {
            resolution: Resolution {
                width: 256,
                height: 128,
            },
            ..Default::default()
        })
        .unwrap();
        assert!(!ctx.sps().conformance_window_flag);
    }

    #[test]
    fn poc_lsb_size_follows_idr_period() {
        let log2 = |keyframe_period, idr_period| {
            let config = EncoderConfig {
                keyframe_period,
                idr_period,
                ..Default::default()
            };
            EncoderContext::<u64>::new(config)
                .unwrap()
                .sps()
                .log2_max_pic_order_cnt_lsb_minus4
        };

        assert_eq!(log2(16, 16), 0);
        assert_eq!(log2(8, 0), 0);
        assert_eq!(log2(30, 1000), 6);
        assert_eq!(log2(30, 1 << 20), 12);
    }

    #[test]
    fn derived_properties() {
        let props = DerivedProperties::new(&EncoderConfig {
            keyframe_period: 8,
            num_bframes: 2,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(props.idr_period, 16);
        assert_eq!(props.max_dec_pic_buffering, 3);
        assert_eq!(props.max_num_reorder, 1);
        assert_eq!(props.max_reflist0, 1);
        assert_eq!(props.max_reflist1, 1);
        assert_eq!(props.max_ref_frames(), 2);
        assert_eq!(props.cts_offset, 33_333_333);

        let props = DerivedProperties::new(&EncoderConfig {
            keyframe_period: 2,
            num_bframes: 5,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(props.num_bframes, 1);

        let props = DerivedProperties::new(&EncoderConfig {
            num_ref_frames: 2,
            init_qp: 10,
            min_qp: 20,
            max_qp: 40,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(props.max_dec_pic_buffering, 3);
        assert_eq!(props.max_num_reorder, 0);
        assert_eq!(props.max_reflist1, 0);
        assert_eq!(props.cts_offset, 0);
        assert_eq!(props.init_qp, 20);
        assert_eq!(props.profile, Profile::Main);
        assert_eq!(props.level.limits.level, Level::L2);

        // 320x256 CTU-aligned CQP stream: no HRD.
        assert_eq!(props.bitrate_kbps, 0);
        assert_eq!(props.hrd_bitrate, 0);
    }

    #[test]
    fn configuration_errors() {
        let check = |config: EncoderConfig| EncoderContext::<u64>::new(config).err();

        assert!(matches!(
            check(EncoderConfig {
                ctu_size: 24,
                ..Default::default()
            }),
            Some(EncodeError::InvalidConfig(_))
        ));
        assert!(matches!(
            check(EncoderConfig {
                chroma_format_idc: 7,
                ..Default::default()
            }),
            Some(EncodeError::UnsupportedChromaFormat(7))
        ));
        assert!(matches!(
            check(EncoderConfig {
                allowed_profiles: vec![Profile::Main444],
                ..Default::default()
            }),
            Some(EncodeError::UnsupportedProfile)
        ));
        assert!(matches!(
            check(EncoderConfig {
                resolution: Resolution {
                    width: 16384,
                    height: 16384,
                },
                ..Default::default()
            }),
            Some(EncodeError::UnsupportedLevel)
        ));
        assert!(matches!(
            check(EncoderConfig {
                num_tile_cols: 11,
                ..Default::default()
            }),
            Some(EncodeError::InvalidConfig(_))
        ));
        assert!(matches!(
            check(EncoderConfig {
                rate_control: RateControl::Cbr,
                bitrate_kbps: 5_000_000,
                ..Default::default()
            }),
            Some(EncodeError::InvalidConfig(_))
        ));
        // Representable, but above the MaxBR of every level.
        assert!(matches!(
            check(EncoderConfig {
                rate_control: RateControl::Vbr,
                bitrate_kbps: 1_000_000,
                ..Default::default()
            }),
            Some(EncodeError::UnsupportedLevel)
        ));
        assert!(matches!(
            check(EncoderConfig {
                keyframe_period: 0,
                ..Default::default()
            }),
            Some(EncodeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn parameter_sets_with_hrd() {
        let ctx = EncoderContext::<u64>::new(EncoderConfig {
            rate_control: RateControl::Cbr,
            bitrate_kbps: 5000,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(ctx.props().hrd_bitrate, 5_000_000);
        assert_eq!(ctx.props().hrd_cpb_size, 7_500_000);

        let (sps, pps) = parse_parameter_sets(&ctx);
        assert_eq!(sps.profile_tier_level.general.profile_idc, 1);
        // Level 2 fits the picture, but not the bitrate.
        assert_eq!(sps.profile_tier_level.level(), Some(Level::L3));
        // IDR period of 60.
        assert_eq!(sps.log2_max_pic_order_cnt_lsb_minus4, 2);
        assert_eq!(sps.max_dec_pic_buffering_minus1[0], 1);

        let vui = &sps.vui_parameters;
        assert_eq!(vui.sar_width, 1);
        assert_eq!(vui.time_scale, 30);
        assert_eq!(vui.num_units_in_tick, 1);
        assert!(vui.hrd_parameters_present_flag);
        assert_eq!(vui.hrd.nal_hrd[0].bit_rate_value_minus1[0], 78124);
        assert_eq!(vui.hrd.nal_hrd[0].cpb_size_value_minus1[0], 468749);
        assert!(vui.hrd.nal_hrd[0].cbr_flag[0]);

        assert_eq!(pps.init_qp_minus26, 0);
        assert!(pps.cu_qp_delta_enabled_flag);
        assert!(pps.transform_skip_enabled_flag);
        assert!(!pps.tiles_enabled_flag);
    }

    #[test]
    fn tiles_and_slices() {
        let ctx = EncoderContext::<u64>::new(EncoderConfig {
            num_tile_cols: 2,
            num_tile_rows: 2,
            num_slices: 1,
            slice_spans_tiles: false,
            ..config_1080p()
        })
        .unwrap();

        // One slice per tile at least.
        assert_eq!(ctx.props().num_slices, 4);
        let addresses: Vec<u32> = ctx.slice_segments().iter().map(|s| s.address).collect();
        assert_eq!(addresses, vec![0, 30, 17 * 60, 17 * 60 + 30]);
        assert_eq!(ctx.slice_segments().iter().map(|s| s.num_ctus).sum::<u32>(), 2040);

        let (_, pps) = parse_parameter_sets(&ctx);
        assert!(pps.tiles_enabled_flag);
        assert_eq!(pps.num_tile_columns_minus1, 1);
        assert_eq!(pps.num_tile_rows_minus1, 1);
        assert_eq!(&pps.column_width_minus1[..2], &[29, 29]);
        assert_eq!(&pps.row_height_minus1[..2], &[16, 16]);
    }

    #[test]
    fn slices_follow_tile_boundaries() {
        // 8x2 CTUs in two 4x2 tile columns.
        let config = EncoderConfig {
            resolution: Resolution {
                width: 256,
                height: 64,
            },
            num_tile_cols: 2,
            ..Default::default()
        };
        let segments = |num_slices, slice_spans_tiles| {
            let ctx = EncoderContext::<u64>::new(EncoderConfig {
                num_slices,
                slice_spans_tiles,
                ..config.clone()
            })
            .unwrap();
            ctx.slice_segments()
                .iter()
                .map(|s| (s.address, s.num_ctus))
                .collect::<Vec<_>>()
        };

        assert_eq!(segments(1, false), vec![(0, 8), (4, 8)]);
        assert_eq!(segments(1, true), vec![(0, 16)]);
        // The second slice starts on the second CTU row of the first tile.
        assert_eq!(segments(3, true), vec![(0, 4), (8, 4), (4, 8)]);
        assert_eq!(segments(3, false), segments(3, true));
    }

    #[test]
    fn fourteen_references_within_a_small_poc_lsb_range() {
        // MaxPicOrderCntLsb of 16 with references up to 14 pictures back.
        let mut encoder = EncoderContext::new(EncoderConfig {
            keyframe_period: 16,
            idr_period: 16,
            num_ref_frames: 14,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(encoder.sps().log2_max_pic_order_cnt_lsb_minus4, 0);

        let mut requests = vec![];
        for i in 0..32u64 {
            requests.extend(encoder.encode(i, FrameMetadata::default()).unwrap());
        }
        requests.extend(encoder.drain().unwrap());
        assert_eq!(requests.len(), 32);

        for request in &requests {
            let rps = &request.slice_headers[0].short_term_ref_pic_set;
            assert_eq!(rps.num_positive_pics, 0, "POC {}", request.poc);
            assert!(request.ref_lists.list0.iter().all(|&r| r < request.poc));
            assert!(request.ref_lists.list1.is_empty());
            assert_eq!(
                request.slice_headers[0].pic_order_cnt_lsb,
                (request.poc % 16) as u16
            );
        }

        let last = &requests[15];
        assert_eq!(last.poc, 15);
        assert_eq!(last.ref_lists.list0, (1..15).rev().collect::<Vec<_>>());
        let rps = &last.slice_headers[0].short_term_ref_pic_set;
        assert_eq!(rps.num_negative_pics, 14);
        assert_eq!(rps.delta_poc_s0[13], -14);

        let mut decoder = DecoderContext::new(DummyBackend::default());
        for request in &requests {
            let coded = request.packed_bitstream();
            let mut stream = &coded.bitstream[..];
            while !stream.is_empty() {
                let consumed = decoder.decode(coded.metadata.timestamp, stream).unwrap();
                stream = &stream[consumed..];
            }
        }
        decoder.flush().unwrap();

        for slice in &decoder.backend().slices {
            if slice.slice_type == SliceType::P {
                assert_eq!(slice.ref_pic_list0[0], Some(slice.poc - 1));
            }
        }
        let output: Vec<i32> = std::iter::from_fn(|| decoder.next_output())
            .map(|p| p.poc)
            .collect();
        assert_eq!(output, (0..16).chain(0..16).collect::<Vec<_>>());
    }

    #[test]
    fn codec_data_record() {
        let ctx = EncoderContext::<u64>::new(config_1080p()).unwrap();
        let record = ctx.codec_data().unwrap();

        let hvcc = HvccBox::parse(&record).unwrap();
        assert_eq!(hvcc.general_profile.profile_idc, 1);
        assert_eq!(hvcc.general_level_idc, ctx.props().level.limits.level_idc());
        assert_eq!(hvcc.chroma_format_idc, 1);
        assert_eq!(hvcc.arrays.len(), 3);
        assert_eq!(hvcc.to_annexb(), ctx.parameter_sets().unwrap());
    }

    #[test]
    fn encoded_stream_decodes_in_presentation_order() {
        let _ = env_logger::try_init();

        use PictureType::B;
        use PictureType::I;
        use PictureType::P;

        let config = EncoderConfig {
            keyframe_period: 8,
            idr_period: 32,
            num_bframes: 2,
            num_slices: 2,
            ..Default::default()
        };
        let mut encoder = EncoderContext::new(config).unwrap();
        let cts_offset = encoder.props().cts_offset;

        let mut requests = vec![];
        for i in 0..10u64 {
            let meta = FrameMetadata {
                timestamp: i * 1000,
                force_keyframe: false,
            };
            requests.extend(encoder.encode(i, meta).unwrap());
            assert!(encoder.ref_pool().len() <= encoder.ref_pool().max_ref_frames());
        }
        requests.extend(encoder.drain().unwrap());
        assert!(encoder.ref_pool().is_empty());

        let coded: Vec<(u32, PictureType)> = requests.iter().map(|r| (r.poc, r.type_)).collect();
        assert_eq!(
            coded,
            vec![
                (0, I),
                (3, P),
                (1, B),
                (2, B),
                (6, P),
                (4, B),
                (5, B),
                (7, P),
                (8, I),
                (9, P)
            ]
        );
        assert_eq!(requests.iter().map(|r| r.input).collect::<Vec<_>>(), [0, 3, 1, 2, 6, 4, 5, 7, 8, 9]);

        // Parameter sets and two slices for the IDR, slices only afterwards.
        assert!(requests[0].is_idr);
        assert_eq!(requests[0].nalu_type, NaluType::IdrWRadl);
        assert_eq!(requests[0].packed_headers.len(), 5);
        assert_eq!(requests[1].packed_headers.len(), 2);
        assert_eq!(requests[2].nalu_type, NaluType::TrailN);
        assert_eq!(requests[8].nalu_type, NaluType::TrailR);
        assert_eq!(
            requests[2].ref_lists,
            RefLists {
                list0: vec![0],
                list1: vec![3]
            }
        );

        let mut decoder = DecoderContext::new(DummyBackend::default());
        for request in &requests {
            let coded = request.packed_bitstream();
            let mut stream = &coded.bitstream[..];
            while !stream.is_empty() {
                let consumed = decoder.decode(coded.metadata.timestamp, stream).unwrap();
                assert!(decoder.dpb().len() <= decoder.dpb().max_num_pics());
                stream = &stream[consumed..];
            }
        }
        decoder.flush().unwrap();

        let output: Vec<_> = std::iter::from_fn(|| decoder.next_output()).collect();
        assert_eq!(
            output.iter().map(|p| p.poc).collect::<Vec<_>>(),
            (0..10).collect::<Vec<_>>()
        );
        assert_eq!(output[1].timestamp, 1000 + cts_offset);
        assert_eq!(decoder.num_dropped(), 0);

        let backend = decoder.backend();
        assert_eq!(backend.submitted, vec![0, 3, 1, 2, 6, 4, 5, 7, 8, 9]);
        assert_eq!(backend.slices.len(), 20);
        let b1 = backend.slices.iter().find(|s| s.poc == 1).unwrap();
        assert_eq!(b1.slice_type, SliceType::B);
        assert_eq!(b1.ref_pic_list0[0], Some(0));
        assert_eq!(b1.ref_pic_list1[0], Some(3));
    }

    #[test]
    fn one_idr_in_the_first_two_keyframe_periods() {
        let mut encoder = EncoderContext::new(EncoderConfig {
            keyframe_period: 8,
            num_bframes: 2,
            ..Default::default()
        })
        .unwrap();

        let mut requests = vec![];
        for i in 0..16u64 {
            requests.extend(encoder.encode(i, FrameMetadata::default()).unwrap());
        }
        requests.extend(encoder.drain().unwrap());

        assert_eq!(requests.len(), 16);
        assert_eq!(requests.iter().filter(|r| r.is_idr).count(), 1);
        assert_eq!(
            requests
                .iter()
                .filter(|r| r.type_ == PictureType::I)
                .map(|r| r.poc)
                .collect::<Vec<_>>(),
            vec![0, 8]
        );
    }

    #[test]
    fn qp_deltas_in_cqp() {
        let mut encoder = EncoderContext::new(EncoderConfig {
            keyframe_period: 4,
            num_bframes: 1,
            init_qp: 30,
            max_qp: 32,
            qp_ip: 1,
            qp_ib: 4,
            ..Default::default()
        })
        .unwrap();

        let mut requests = vec![];
        for i in 0..3u64 {
            requests.extend(encoder.encode(i, FrameMetadata::default()).unwrap());
        }

        let deltas: Vec<(PictureType, i8)> = requests
            .iter()
            .map(|r| (r.type_, r.slice_headers[0].qp_delta))
            .collect();
        assert_eq!(
            deltas,
            vec![
                (PictureType::I, 0),
                (PictureType::P, 1),
                (PictureType::B, 2)
            ]
        );
    }

    #[test]
    fn flush_and_reconfigure() {
        let _ = env_logger::try_init();

        let mut encoder = EncoderContext::new(EncoderConfig {
            num_bframes: 2,
            ..Default::default()
        })
        .unwrap();

        assert!(encoder.flush().is_empty());
        assert!(encoder.flush().is_empty());

        assert_eq!(encoder.encode(0u64, FrameMetadata::default()).unwrap().len(), 1);
        assert!(encoder.encode(1, FrameMetadata::default()).unwrap().is_empty());

        // A bad configuration changes nothing.
        let bad = EncoderConfig {
            ctu_size: 8,
            ..Default::default()
        };
        assert!(encoder.reconfigure(bad).is_err());
        assert_eq!(encoder.config().num_bframes, 2);

        let requests = encoder.reconfigure(config_1080p()).unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].type_, PictureType::P);
        assert_eq!(encoder.props().ctu_width, 60);

        let requests = encoder.encode(2, FrameMetadata::default()).unwrap();
        assert!(requests[0].is_idr);
        assert_eq!(requests[0].sps.pic_width_in_luma_samples, 1920);
    }
}
