// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! HEVC decoder configuration record ("hvcC", ISO/IEC 14496-15 8.3.3).

use std::io::Cursor;
use std::io::Read;
use std::io::Write;

use byteorder::BigEndian;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;
use thiserror::Error;

use crate::bitstream_utils::BitReader;
use crate::codec::h265::nalu_writer::START_CODE;
use crate::codec::h265::parser::Nalu;
use crate::codec::h265::parser::NaluType;
use crate::codec::h265::parser::Parser;
use crate::codec::h265::parser::Pps;
use crate::codec::h265::parser::ProfileInfo;
use crate::codec::h265::parser::Sps;
use crate::codec::h265::synthesizer::SynthesizerError;
use crate::codec::h265::synthesizer::Synthesizer;

/// Size in bytes of the general profile information block.
const PROFILE_INFO_LEN: usize = 11;

/// Parameter set arrays carried by the record, in the order they are written.
const ARRAY_TYPES: [NaluType; 3] = [NaluType::VpsNut, NaluType::SpsNut, NaluType::PpsNut];

#[derive(Error, Debug)]
pub enum HvccError {
    #[error("no {0:?} NAL unit in the parameter sets")]
    MissingParameterSet(NaluType),
    #[error("unsupported configurationVersion {0}")]
    InvalidVersion(u8),
    #[error("invalid NAL unit type {0} in array")]
    InvalidNaluType(u8),
    #[error("NAL unit of {0} bytes does not fit a 16-bit length")]
    NaluTooLarge(usize),
    #[error("too many NAL units or arrays")]
    TooManyEntries,
    #[error(transparent)]
    Synthesizer(#[from] SynthesizerError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Parser(#[from] anyhow::Error),
}

pub type HvccResult<T> = Result<T, HvccError>;

/// One array of NAL units of a single type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NaluArray {
    /// All NAL units of this type are in the array and none in the stream.
    pub array_completeness: bool,
    pub nal_unit_type: NaluType,
    /// NAL header plus escaped payload, without start code.
    pub nalus: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HvccBox {
    pub general_profile: ProfileInfo,
    pub general_level_idc: u8,
    pub min_spatial_segmentation_idc: u16,
    /// 0: unknown or mixed, 1: slice based, 2: tile based, 3: wavefront.
    pub parallelism_type: u8,
    pub chroma_format_idc: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    /// Frames per 256 seconds, 0 when unknown.
    pub avg_frame_rate: u16,
    pub constant_frame_rate: u8,
    pub num_temporal_layers: u8,
    pub temporal_id_nested: bool,
    pub length_size_minus_one: u8,
    pub arrays: Vec<NaluArray>,
}

impl HvccBox {
    /// Builds the record for `sps` and `pps`. `parameter_sets` is the Annex B
    /// stream holding the VPS, SPS and PPS NAL units.
    pub fn new(sps: &Sps, pps: &Pps, parameter_sets: &[u8]) -> HvccResult<Self> {
        let mut arrays: Vec<NaluArray> = ARRAY_TYPES
            .iter()
            .map(|&nal_unit_type| NaluArray {
                array_completeness: true,
                nal_unit_type,
                nalus: vec![],
            })
            .collect();

        let mut cursor = Cursor::new(parameter_sets);
        while let Ok(nalu) = Nalu::next(&mut cursor) {
            if let Some(array) = arrays
                .iter_mut()
                .find(|a| a.nal_unit_type == nalu.header.type_)
            {
                array.nalus.push(nalu.data.to_vec());
            }
        }

        if let Some(array) = arrays.iter().find(|a| a.nalus.is_empty()) {
            return Err(HvccError::MissingParameterSet(array.nal_unit_type));
        }

        let tiles = pps.tiles_enabled_flag;
        let wavefront = pps.entropy_coding_sync_enabled_flag;
        let parallelism_type = match (tiles, wavefront) {
            (true, true) => 0,
            (true, false) => 2,
            (false, true) => 3,
            (false, false) => 1,
        };

        let vui = &sps.vui_parameters;
        let avg_frame_rate = if sps.vui_parameters_present_flag
            && vui.timing_info_present_flag
            && vui.num_units_in_tick > 0
        {
            let rate = u64::from(vui.time_scale) * 256 / u64::from(vui.num_units_in_tick);
            u16::try_from(rate).unwrap_or(u16::MAX)
        } else {
            0
        };

        let min_spatial_segmentation_idc = if sps.vui_parameters_present_flag {
            vui.min_spatial_segmentation_idc
        } else {
            0
        };

        Ok(Self {
            general_profile: sps.profile_tier_level.general,
            general_level_idc: sps.profile_tier_level.general_level_idc,
            min_spatial_segmentation_idc,
            parallelism_type,
            chroma_format_idc: sps.chroma_format_idc,
            bit_depth_luma_minus8: sps.bit_depth_luma_minus8,
            bit_depth_chroma_minus8: sps.bit_depth_chroma_minus8,
            avg_frame_rate,
            constant_frame_rate: 0,
            num_temporal_layers: sps.max_sub_layers_minus1 + 1,
            temporal_id_nested: sps.temporal_id_nesting_flag,
            length_size_minus_one: 3,
            arrays,
        })
    }

    /// Serializes the record.
    pub fn to_bytes(&self) -> HvccResult<Vec<u8>> {
        let mut out = Vec::new();

        out.write_u8(1)?;
        Synthesizer::<ProfileInfo, _>::synthesize(&self.general_profile, &mut out)?;
        out.write_u8(self.general_level_idc)?;
        out.write_u16::<BigEndian>(0xf000 | (self.min_spatial_segmentation_idc & 0x0fff))?;
        out.write_u8(0xfc | (self.parallelism_type & 0x3))?;
        out.write_u8(0xfc | (self.chroma_format_idc & 0x3))?;
        out.write_u8(0xf8 | (self.bit_depth_luma_minus8 & 0x7))?;
        out.write_u8(0xf8 | (self.bit_depth_chroma_minus8 & 0x7))?;
        out.write_u16::<BigEndian>(self.avg_frame_rate)?;
        out.write_u8(
            (self.constant_frame_rate & 0x3) << 6
                | (self.num_temporal_layers & 0x7) << 3
                | u8::from(self.temporal_id_nested) << 2
                | (self.length_size_minus_one & 0x3),
        )?;

        let num_arrays =
            u8::try_from(self.arrays.len()).map_err(|_| HvccError::TooManyEntries)?;
        out.write_u8(num_arrays)?;

        for array in &self.arrays {
            out.write_u8(
                u8::from(array.array_completeness) << 7 | (array.nal_unit_type as u8 & 0x3f),
            )?;

            let num_nalus =
                u16::try_from(array.nalus.len()).map_err(|_| HvccError::TooManyEntries)?;
            out.write_u16::<BigEndian>(num_nalus)?;

            for nalu in &array.nalus {
                let len =
                    u16::try_from(nalu.len()).map_err(|_| HvccError::NaluTooLarge(nalu.len()))?;
                out.write_u16::<BigEndian>(len)?;
                out.write_all(nalu)?;
            }
        }

        Ok(out)
    }

    /// Reads a record back, e.g. the codec data of an MP4 track.
    pub fn parse(data: &[u8]) -> HvccResult<Self> {
        let mut r = Cursor::new(data);

        let version = r.read_u8()?;
        if version != 1 {
            return Err(HvccError::InvalidVersion(version));
        }

        let mut profile = [0u8; PROFILE_INFO_LEN];
        r.read_exact(&mut profile)?;
        let mut general_profile = ProfileInfo::default();
        Parser::parse_profile_info(&mut general_profile, &mut BitReader::new(&profile, false))?;

        let general_level_idc = r.read_u8()?;
        let min_spatial_segmentation_idc = r.read_u16::<BigEndian>()? & 0x0fff;
        let parallelism_type = r.read_u8()? & 0x3;
        let chroma_format_idc = r.read_u8()? & 0x3;
        let bit_depth_luma_minus8 = r.read_u8()? & 0x7;
        let bit_depth_chroma_minus8 = r.read_u8()? & 0x7;
        let avg_frame_rate = r.read_u16::<BigEndian>()?;

        let byte = r.read_u8()?;
        let constant_frame_rate = byte >> 6;
        let num_temporal_layers = (byte >> 3) & 0x7;
        let temporal_id_nested = (byte >> 2) & 0x1 == 1;
        let length_size_minus_one = byte & 0x3;

        let num_arrays = r.read_u8()?;
        let mut arrays = Vec::with_capacity(usize::from(num_arrays));
        for _ in 0..num_arrays {
            let byte = r.read_u8()?;
            let nal_unit_type =
                NaluType::n(byte & 0x3f).ok_or(HvccError::InvalidNaluType(byte & 0x3f))?;

            let num_nalus = r.read_u16::<BigEndian>()?;
            let mut nalus = Vec::with_capacity(usize::from(num_nalus));
            for _ in 0..num_nalus {
                let len = r.read_u16::<BigEndian>()?;
                let mut nalu = vec![0u8; usize::from(len)];
                r.read_exact(&mut nalu)?;
                nalus.push(nalu);
            }

            arrays.push(NaluArray {
                array_completeness: byte >> 7 == 1,
                nal_unit_type,
                nalus,
            });
        }

        Ok(Self {
            general_profile,
            general_level_idc,
            min_spatial_segmentation_idc,
            parallelism_type,
            chroma_format_idc,
            bit_depth_luma_minus8,
            bit_depth_chroma_minus8,
            avg_frame_rate,
            constant_frame_rate,
            num_temporal_layers,
            temporal_id_nested,
            length_size_minus_one,
            arrays,
        })
    }

    /// Returns the NAL units of all arrays as an Annex B stream.
    pub fn to_annexb(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for nalu in self.arrays.iter().flat_map(|a| a.nalus.iter()) {
            out.extend_from_slice(&START_CODE);
            out.extend_from_slice(nalu);
        }

        out
    }
}
