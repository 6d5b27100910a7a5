// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! An Annex B h.265 header parser.
//!
//! Parses VPSs, SPSs, PPSs and slice segment headers from NALUs.

// Syntax elements are kept whether or not this crate reads them back.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::anyhow;
use anyhow::Context;
use enumn::N;

use crate::bitstream_utils::BitReader;
use crate::utils::nalu;
use crate::utils::nalu::Header;

// Given the max VPS id.
pub const MAX_VPS_COUNT: usize = 16;
// Given the max SPS id.
pub const MAX_SPS_COUNT: usize = 16;
// Given the max PPS id.
pub const MAX_PPS_COUNT: usize = 64;
/// Upper bound of the `sps_max_sub_layers_minus1 + 1` range.
pub const MAX_SUB_LAYERS: usize = 7;
/// Maximum number of pictures in a DPB, whatever the level.
pub const MAX_DPB_SIZE: usize = 16;
// 7.4.7.1
const MAX_REF_IDX_ACTIVE: usize = 15;
// 7.4.3.2.1
const MAX_SHORT_TERM_REF_PIC_SETS: usize = 64;
const MAX_LONG_TERM_REF_PICS_SPS: usize = 32;
// Table A.8, at level 6.2.
const MAX_TILE_COLUMNS: usize = 20;
const MAX_TILE_ROWS: usize = 22;

// From table 7-5.
const DEFAULT_SCALING_LIST_0: [u8; 16] = [16; 16];

// From Table 7-6, intra.
const DEFAULT_SCALING_LIST_1: [u8; 64] = [
    16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 17, 16, 17, 16, 17, 18, 17, 18, 18, 17, 18, 21, 19, 20,
    21, 20, 19, 21, 24, 22, 22, 24, 24, 22, 22, 24, 25, 25, 27, 30, 27, 25, 25, 29, 31, 35, 35, 31,
    29, 36, 41, 44, 41, 36, 47, 54, 54, 47, 65, 70, 65, 88, 88, 115,
];

// From Table 7-6, inter.
const DEFAULT_SCALING_LIST_2: [u8; 64] = [
    16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 17, 17, 17, 17, 17, 18, 18, 18, 18, 18, 18, 20, 20, 20,
    20, 20, 20, 20, 24, 24, 24, 24, 24, 24, 24, 24, 25, 25, 25, 25, 25, 25, 25, 28, 28, 28, 28, 28,
    28, 33, 33, 33, 33, 33, 41, 41, 41, 41, 54, 54, 54, 71, 71, 91,
];

/// Table 7-1 – NAL unit type codes and NAL unit type classes
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum NaluType {
    #[default]
    TrailN = 0,
    TrailR = 1,
    TsaN = 2,
    TsaR = 3,
    StsaN = 4,
    StsaR = 5,
    RadlN = 6,
    RadlR = 7,
    RaslN = 8,
    RaslR = 9,
    RsvVclN10 = 10,
    RsvVclR11 = 11,
    RsvVclN12 = 12,
    RsvVclR13 = 13,
    RsvVclN14 = 14,
    RsvVclR15 = 15,
    BlaWLp = 16,
    BlaWRadl = 17,
    BlaNLp = 18,
    IdrWRadl = 19,
    IdrNLp = 20,
    CraNut = 21,
    RsvIrapVcl22 = 22,
    RsvIrapVcl23 = 23,
    RsvVcl24 = 24,
    RsvVcl25 = 25,
    RsvVcl26 = 26,
    RsvVcl27 = 27,
    RsvVcl28 = 28,
    RsvVcl29 = 29,
    RsvVcl30 = 30,
    RsvVcl31 = 31,
    VpsNut = 32,
    SpsNut = 33,
    PpsNut = 34,
    AudNut = 35,
    EosNut = 36,
    EobNut = 37,
    FdNut = 38,
    PrefixSeiNut = 39,
    SuffixSeiNut = 40,
    RsvNvcl41 = 41,
    RsvNvcl42 = 42,
    RsvNvcl43 = 43,
    RsvNvcl44 = 44,
    RsvNvcl45 = 45,
    RsvNvcl46 = 46,
    RsvNvcl47 = 47,
    Unspec48 = 48,
    Unspec49 = 49,
    Unspec50 = 50,
    Unspec51 = 51,
    Unspec52 = 52,
    Unspec53 = 53,
    Unspec54 = 54,
    Unspec55 = 55,
    Unspec56 = 56,
    Unspec57 = 57,
    Unspec58 = 58,
    Unspec59 = 59,
    Unspec60 = 60,
    Unspec61 = 61,
    Unspec62 = 62,
    Unspec63 = 63,
}

impl NaluType {
    pub fn is_idr(&self) -> bool {
        matches!(self, Self::IdrWRadl | Self::IdrNLp)
    }

    /// BLA, IDR, CRA or a reserved IRAP type (16..=23).
    pub fn is_irap(&self) -> bool {
        (Self::BlaWLp..=Self::RsvIrapVcl23).contains(self)
    }

    pub fn is_bla(&self) -> bool {
        (Self::BlaWLp..=Self::BlaNLp).contains(self)
    }

    pub fn is_cra(&self) -> bool {
        matches!(self, Self::CraNut)
    }

    /// Random access decodable leading picture.
    pub fn is_radl(&self) -> bool {
        matches!(self, Self::RadlN | Self::RadlR)
    }

    /// Random access skipped leading picture.
    pub fn is_rasl(&self) -> bool {
        matches!(self, Self::RaslN | Self::RaslR)
    }

    /// Whether this is a sub-layer non-reference picture.
    pub fn is_slnr(&self) -> bool {
        matches!(
            self,
            Self::TrailN
                | Self::TsaN
                | Self::StsaN
                | Self::RadlN
                | Self::RaslN
                | Self::RsvVclN10
                | Self::RsvVclN12
                | Self::RsvVclN14
        )
    }

    /// Whether this NALU carries a slice segment we know how to parse.
    pub fn is_slice(&self) -> bool {
        (Self::TrailN..=Self::RaslR).contains(self) || (Self::BlaWLp..=Self::CraNut).contains(self)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NaluHeader {
    pub type_: NaluType,
    /// Always 0 in the streams written here.
    pub nuh_layer_id: u8,
    /// Never 0.
    pub nuh_temporal_id_plus1: u8,
}

impl NaluHeader {
    /// TemporalId, as per (7-1).
    pub fn temporal_id(&self) -> u8 {
        self.nuh_temporal_id_plus1.saturating_sub(1)
    }
}

impl Header for NaluHeader {
    fn parse(data: &[u8]) -> anyhow::Result<Self> {
        let data = data
            .get(0..2)
            .ok_or_else(|| anyhow!("NAL unit header needs two bytes"))?;
        let mut r = bitreader::BitReader::new(data);

        if r.read_bool()? {
            return Err(anyhow!("forbidden_zero_bit is set"));
        }

        let hdr = Self {
            type_: NaluType::n(r.read_u8(6)?).ok_or(anyhow!("Invalid NALU type"))?,
            nuh_layer_id: r.read_u8(6)?,
            nuh_temporal_id_plus1: r.read_u8(3)?,
        };

        if hdr.nuh_temporal_id_plus1 == 0 {
            return Err(anyhow!("nuh_temporal_id_plus1 is zero"));
        }

        Ok(hdr)
    }

    fn is_end(&self) -> bool {
        matches!(self.type_, NaluType::EosNut | NaluType::EobNut)
    }

    fn len(&self) -> usize {
        // 7.3.1.2
        2
    }
}

pub type Nalu<'a> = nalu::Nalu<'a, NaluHeader>;

/// general_level_idc values: 30 times the level number of table A.8.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    #[default]
    L1 = 30,
    L2 = 60,
    L2_1 = 63,
    L3 = 90,
    L3_1 = 93,
    L4 = 120,
    L4_1 = 123,
    L5 = 150,
    L5_1 = 153,
    L5_2 = 156,
    L6 = 180,
    L6_1 = 183,
    L6_2 = 186,
}

/// The profile part of a profile_tier_level() structure, shared between the
/// general and the sub-layer syntax. Its 88 bits are also stored verbatim in
/// the hvcC box.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProfileInfo {
    pub profile_space: u8,
    pub tier_flag: bool,
    pub profile_idc: u8,
    pub profile_compatibility_flag: [bool; 32],
    pub progressive_source_flag: bool,
    pub interlaced_source_flag: bool,
    pub non_packed_constraint_flag: bool,
    pub frame_only_constraint_flag: bool,
    pub max_12bit_constraint_flag: bool,
    pub max_10bit_constraint_flag: bool,
    pub max_8bit_constraint_flag: bool,
    pub max_422chroma_constraint_flag: bool,
    pub max_420chroma_constraint_flag: bool,
    pub max_monochrome_constraint_flag: bool,
    pub intra_constraint_flag: bool,
    pub one_picture_only_constraint_flag: bool,
    pub lower_bit_rate_constraint_flag: bool,
    pub max_14bit_constraint_flag: bool,
    pub inbld_flag: bool,
}

impl ProfileInfo {
    /// Whether `profile_idc` names `idc`, or the compatibility flag for `idc` is
    /// set.
    pub fn conforms_to(&self, idc: u8) -> bool {
        self.profile_idc == idc
            || self
                .profile_compatibility_flag
                .get(usize::from(idc))
                .copied()
                .unwrap_or(false)
    }

    /// Whether the nine range extension constraint flags are present.
    pub fn has_extension_constraint_flags(&self) -> bool {
        (4..=11).any(|idc| self.conforms_to(idc))
    }

    /// Whether `max_14bit_constraint_flag` is present.
    pub fn has_max_14bit_flag(&self) -> bool {
        [5, 9, 10, 11].into_iter().any(|idc| self.conforms_to(idc))
    }

    /// Whether the syntax carries `inbld_flag` rather than a reserved bit.
    pub fn has_inbld_flag(&self) -> bool {
        [1, 2, 3, 4, 5, 9, 11]
            .into_iter()
            .any(|idc| self.conforms_to(idc))
    }

    /// The 32 compatibility flags, flag 0 being the most significant bit.
    pub fn compatibility_mask(&self) -> u32 {
        self.profile_compatibility_flag
            .iter()
            .fold(0, |mask, flag| (mask << 1) | u32::from(*flag))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProfileTierLevel {
    pub general: ProfileInfo,
    pub general_level_idc: u8,
    pub sub_layer_profile_present_flag: [bool; MAX_SUB_LAYERS - 1],
    pub sub_layer_level_present_flag: [bool; MAX_SUB_LAYERS - 1],
    pub sub_layer: [ProfileInfo; MAX_SUB_LAYERS - 1],
    pub sub_layer_level_idc: [u8; MAX_SUB_LAYERS - 1],
}

impl ProfileTierLevel {
    pub fn level(&self) -> Option<Level> {
        Level::n(self.general_level_idc)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SublayerHrdParameters {
    // NOTE: The value of CpbCnt is cpb_cnt_minus1[i] + 1, and cpb_cnt_minus1
    // ranges from 0..=31
    pub bit_rate_value_minus1: [u32; 32],
    pub cpb_size_value_minus1: [u32; 32],
    pub cpb_size_du_value_minus1: [u32; 32],
    pub bit_rate_du_value_minus1: [u32; 32],
    pub cbr_flag: [bool; 32],
}

/// E.2.2 hrd_parameters().
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HrdParams {
    pub nal_hrd_parameters_present_flag: bool,
    pub vcl_hrd_parameters_present_flag: bool,
    pub sub_pic_hrd_params_present_flag: bool,
    pub tick_divisor_minus2: u8,
    pub du_cpb_removal_delay_increment_length_minus1: u8,
    pub sub_pic_cpb_params_in_pic_timing_sei_flag: bool,
    pub dpb_output_delay_du_length_minus1: u8,
    pub bit_rate_scale: u8,
    pub cpb_size_scale: u8,
    pub cpb_size_du_scale: u8,
    pub initial_cpb_removal_delay_length_minus1: u8,
    pub au_cpb_removal_delay_length_minus1: u8,
    pub dpb_output_delay_length_minus1: u8,
    pub fixed_pic_rate_general_flag: [bool; MAX_SUB_LAYERS],
    pub fixed_pic_rate_within_cvs_flag: [bool; MAX_SUB_LAYERS],
    pub elemental_duration_in_tc_minus1: [u32; MAX_SUB_LAYERS],
    pub low_delay_hrd_flag: [bool; MAX_SUB_LAYERS],
    pub cpb_cnt_minus1: [u32; MAX_SUB_LAYERS],
    pub nal_hrd: [SublayerHrdParameters; MAX_SUB_LAYERS],
    pub vcl_hrd: [SublayerHrdParameters; MAX_SUB_LAYERS],
}

impl Default for HrdParams {
    fn default() -> Self {
        Self {
            nal_hrd_parameters_present_flag: false,
            vcl_hrd_parameters_present_flag: false,
            sub_pic_hrd_params_present_flag: false,
            tick_divisor_minus2: 0,
            du_cpb_removal_delay_increment_length_minus1: 0,
            sub_pic_cpb_params_in_pic_timing_sei_flag: false,
            dpb_output_delay_du_length_minus1: 0,
            bit_rate_scale: 0,
            cpb_size_scale: 0,
            cpb_size_du_scale: 0,
            initial_cpb_removal_delay_length_minus1: 23,
            au_cpb_removal_delay_length_minus1: 23,
            dpb_output_delay_length_minus1: 23,
            fixed_pic_rate_general_flag: Default::default(),
            fixed_pic_rate_within_cvs_flag: Default::default(),
            elemental_duration_in_tc_minus1: Default::default(),
            low_delay_hrd_flag: Default::default(),
            cpb_cnt_minus1: Default::default(),
            nal_hrd: Default::default(),
            vcl_hrd: Default::default(),
        }
    }
}

/// E.2.1 vui_parameters().
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VuiParams {
    pub aspect_ratio_info_present_flag: bool,
    pub aspect_ratio_idc: u8,
    pub sar_width: u16,
    pub sar_height: u16,
    pub overscan_info_present_flag: bool,
    pub overscan_appropriate_flag: bool,
    pub video_signal_type_present_flag: bool,
    pub video_format: u8,
    pub video_full_range_flag: bool,
    pub colour_description_present_flag: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coeffs: u8,
    pub chroma_loc_info_present_flag: bool,
    pub chroma_sample_loc_type_top_field: u8,
    pub chroma_sample_loc_type_bottom_field: u8,
    pub neutral_chroma_indication_flag: bool,
    pub field_seq_flag: bool,
    pub frame_field_info_present_flag: bool,
    pub default_display_window_flag: bool,
    pub def_disp_win_left_offset: u32,
    pub def_disp_win_right_offset: u32,
    pub def_disp_win_top_offset: u32,
    pub def_disp_win_bottom_offset: u32,
    pub timing_info_present_flag: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub poc_proportional_to_timing_flag: bool,
    pub num_ticks_poc_diff_one_minus1: u32,
    pub hrd_parameters_present_flag: bool,
    pub hrd: HrdParams,
    pub bitstream_restriction_flag: bool,
    pub tiles_fixed_structure_flag: bool,
    pub motion_vectors_over_pic_boundaries_flag: bool,
    pub restricted_ref_pic_lists_flag: bool,
    pub min_spatial_segmentation_idc: u16,
    pub max_bytes_per_pic_denom: u32,
    pub max_bits_per_min_cu_denom: u32,
    pub log2_max_mv_length_horizontal: u32,
    pub log2_max_mv_length_vertical: u32,
}

impl Default for VuiParams {
    fn default() -> Self {
        Self {
            aspect_ratio_info_present_flag: false,
            aspect_ratio_idc: 0,
            sar_width: 0,
            sar_height: 0,
            overscan_info_present_flag: false,
            overscan_appropriate_flag: false,
            video_signal_type_present_flag: false,
            // Unspecified video format and colour description (E.3.1).
            video_format: 5,
            video_full_range_flag: false,
            colour_description_present_flag: false,
            colour_primaries: 2,
            transfer_characteristics: 2,
            matrix_coeffs: 2,
            chroma_loc_info_present_flag: false,
            chroma_sample_loc_type_top_field: 0,
            chroma_sample_loc_type_bottom_field: 0,
            neutral_chroma_indication_flag: false,
            field_seq_flag: false,
            frame_field_info_present_flag: false,
            default_display_window_flag: false,
            def_disp_win_left_offset: 0,
            def_disp_win_right_offset: 0,
            def_disp_win_top_offset: 0,
            def_disp_win_bottom_offset: 0,
            timing_info_present_flag: false,
            num_units_in_tick: 0,
            time_scale: 0,
            poc_proportional_to_timing_flag: false,
            num_ticks_poc_diff_one_minus1: 0,
            hrd_parameters_present_flag: false,
            hrd: Default::default(),
            bitstream_restriction_flag: false,
            tiles_fixed_structure_flag: false,
            motion_vectors_over_pic_boundaries_flag: true,
            restricted_ref_pic_lists_flag: false,
            min_spatial_segmentation_idc: 0,
            max_bytes_per_pic_denom: 2,
            max_bits_per_min_cu_denom: 1,
            log2_max_mv_length_horizontal: 15,
            log2_max_mv_length_vertical: 15,
        }
    }
}

/// A H.265 Video Parameter Set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Vps {
    /// Identifies the VPS for reference by other syntax elements.
    pub video_parameter_set_id: u8,
    pub base_layer_internal_flag: bool,
    pub base_layer_available_flag: bool,
    pub max_layers_minus1: u8,
    pub max_sub_layers_minus1: u8,
    pub temporal_id_nesting_flag: bool,
    pub profile_tier_level: ProfileTierLevel,
    pub sub_layer_ordering_info_present_flag: bool,
    pub max_dec_pic_buffering_minus1: [u32; MAX_SUB_LAYERS],
    pub max_num_reorder_pics: [u32; MAX_SUB_LAYERS],
    pub max_latency_increase_plus1: [u32; MAX_SUB_LAYERS],
    pub max_layer_id: u8,
    pub num_layer_sets_minus1: u32,
    pub timing_info_present_flag: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub poc_proportional_to_timing_flag: bool,
    pub num_ticks_poc_diff_one_minus1: u32,
    pub num_hrd_parameters: u32,
    pub hrd_layer_set_idx: Vec<u32>,
    pub cprms_present_flag: Vec<bool>,
    pub hrd_parameters: Vec<HrdParams>,
    pub extension_flag: bool,
}

/// Scaling lists in the order they are coded, i.e. up-right diagonal scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScalingLists {
    pub scaling_list_4x4: [[u8; 16]; 6],
    pub scaling_list_8x8: [[u8; 64]; 6],
    pub scaling_list_16x16: [[u8; 64]; 6],
    pub scaling_list_32x32: [[u8; 64]; 6],
    pub scaling_list_dc_coef_minus8_16x16: [i16; 6],
    pub scaling_list_dc_coef_minus8_32x32: [i16; 6],
}

impl Default for ScalingLists {
    fn default() -> Self {
        let mut sl = Self {
            scaling_list_4x4: [DEFAULT_SCALING_LIST_0; 6],
            scaling_list_8x8: [[0; 64]; 6],
            scaling_list_16x16: [[0; 64]; 6],
            scaling_list_32x32: [[0; 64]; 6],
            scaling_list_dc_coef_minus8_16x16: [8; 6],
            scaling_list_dc_coef_minus8_32x32: [8; 6],
        };

        for matrix_id in 0..6 {
            let list = if matrix_id < 3 {
                DEFAULT_SCALING_LIST_1
            } else {
                DEFAULT_SCALING_LIST_2
            };

            sl.scaling_list_8x8[matrix_id] = list;
            sl.scaling_list_16x16[matrix_id] = list;
            sl.scaling_list_32x32[matrix_id] = list;
        }

        sl
    }
}

impl ScalingLists {
    fn fill_default(&mut self, size_id: usize, matrix_id: usize) {
        let defaults = Self::default();
        match size_id {
            0 => self.scaling_list_4x4[matrix_id] = defaults.scaling_list_4x4[matrix_id],
            1 => self.scaling_list_8x8[matrix_id] = defaults.scaling_list_8x8[matrix_id],
            2 => {
                self.scaling_list_16x16[matrix_id] = defaults.scaling_list_16x16[matrix_id];
                self.scaling_list_dc_coef_minus8_16x16[matrix_id] = 8;
            }
            _ => {
                self.scaling_list_32x32[matrix_id] = defaults.scaling_list_32x32[matrix_id];
                self.scaling_list_dc_coef_minus8_32x32[matrix_id] = 8;
            }
        }
    }

    fn list_mut(&mut self, size_id: usize, matrix_id: usize) -> &mut [u8] {
        match size_id {
            0 => &mut self.scaling_list_4x4[matrix_id][..],
            1 => &mut self.scaling_list_8x8[matrix_id][..],
            2 => &mut self.scaling_list_16x16[matrix_id][..],
            _ => &mut self.scaling_list_32x32[matrix_id][..],
        }
    }

    fn copy(&mut self, size_id: usize, matrix_id: usize, ref_matrix_id: usize) {
        match size_id {
            0 => self.scaling_list_4x4[matrix_id] = self.scaling_list_4x4[ref_matrix_id],
            1 => self.scaling_list_8x8[matrix_id] = self.scaling_list_8x8[ref_matrix_id],
            2 => {
                self.scaling_list_16x16[matrix_id] = self.scaling_list_16x16[ref_matrix_id];
                self.scaling_list_dc_coef_minus8_16x16[matrix_id] =
                    self.scaling_list_dc_coef_minus8_16x16[ref_matrix_id];
            }
            _ => {
                self.scaling_list_32x32[matrix_id] = self.scaling_list_32x32[ref_matrix_id];
                self.scaling_list_dc_coef_minus8_32x32[matrix_id] =
                    self.scaling_list_dc_coef_minus8_32x32[ref_matrix_id];
            }
        }
    }
}

/// A short-term reference picture set, stored in its derived form
/// (DeltaPocS0/S1 and UsedByCurrPicS0/S1, 7.4.8).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShortTermRefPicSet {
    /// When set, the set was predicted from another candidate set. Only the
    /// derived values below are kept.
    pub inter_ref_pic_set_prediction_flag: bool,
    pub delta_idx_minus1: u8,
    pub delta_rps_sign: bool,
    pub abs_delta_rps_minus1: u16,
    pub num_negative_pics: u8,
    pub num_positive_pics: u8,
    /// Negative POC deltas, closest first.
    pub delta_poc_s0: [i32; MAX_DPB_SIZE],
    pub used_by_curr_pic_s0: [bool; MAX_DPB_SIZE],
    /// Positive POC deltas, closest first.
    pub delta_poc_s1: [i32; MAX_DPB_SIZE],
    pub used_by_curr_pic_s1: [bool; MAX_DPB_SIZE],
}

impl ShortTermRefPicSet {
    /// NumDeltaPocs.
    pub fn num_delta_pocs(&self) -> usize {
        usize::from(self.num_negative_pics) + usize::from(self.num_positive_pics)
    }

    /// Number of pictures of this set that the current picture may reference.
    pub fn num_used_by_curr(&self) -> usize {
        let s0 = &self.used_by_curr_pic_s0[..usize::from(self.num_negative_pics)];
        let s1 = &self.used_by_curr_pic_s1[..usize::from(self.num_positive_pics)];
        s0.iter().chain(s1).filter(|used| **used).count()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpsRangeExtension {
    pub transform_skip_rotation_enabled_flag: bool,
    pub transform_skip_context_enabled_flag: bool,
    pub implicit_rdpcm_enabled_flag: bool,
    pub explicit_rdpcm_enabled_flag: bool,
    pub extended_precision_processing_flag: bool,
    pub intra_smoothing_disabled_flag: bool,
    pub high_precision_offsets_enabled_flag: bool,
    pub persistent_rice_adaptation_enabled_flag: bool,
    pub cabac_bypass_alignment_enabled_flag: bool,
}

/// A H.265 Sequence Parameter Set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    pub video_parameter_set_id: u8,
    pub max_sub_layers_minus1: u8,
    pub temporal_id_nesting_flag: bool,
    pub profile_tier_level: ProfileTierLevel,
    pub seq_parameter_set_id: u8,
    pub chroma_format_idc: u8,
    pub separate_colour_plane_flag: bool,
    pub pic_width_in_luma_samples: u16,
    pub pic_height_in_luma_samples: u16,
    pub conformance_window_flag: bool,
    pub conf_win_left_offset: u32,
    pub conf_win_right_offset: u32,
    pub conf_win_top_offset: u32,
    pub conf_win_bottom_offset: u32,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub sub_layer_ordering_info_present_flag: bool,
    pub max_dec_pic_buffering_minus1: [u8; MAX_SUB_LAYERS],
    pub max_num_reorder_pics: [u8; MAX_SUB_LAYERS],
    pub max_latency_increase_plus1: [u32; MAX_SUB_LAYERS],
    pub log2_min_luma_coding_block_size_minus3: u8,
    pub log2_diff_max_min_luma_coding_block_size: u8,
    pub log2_min_luma_transform_block_size_minus2: u8,
    pub log2_diff_max_min_luma_transform_block_size: u8,
    pub max_transform_hierarchy_depth_inter: u8,
    pub max_transform_hierarchy_depth_intra: u8,
    pub scaling_list_enabled_flag: bool,
    pub scaling_list_data_present_flag: bool,
    pub scaling_list: ScalingLists,
    pub amp_enabled_flag: bool,
    pub sample_adaptive_offset_enabled_flag: bool,
    pub pcm_enabled_flag: bool,
    pub pcm_sample_bit_depth_luma_minus1: u8,
    pub pcm_sample_bit_depth_chroma_minus1: u8,
    pub log2_min_pcm_luma_coding_block_size_minus3: u8,
    pub log2_diff_max_min_pcm_luma_coding_block_size: u8,
    pub pcm_loop_filter_disabled_flag: bool,
    pub num_short_term_ref_pic_sets: u8,
    pub short_term_ref_pic_set: Vec<ShortTermRefPicSet>,
    pub long_term_ref_pics_present_flag: bool,
    pub num_long_term_ref_pics_sps: u8,
    pub lt_ref_pic_poc_lsb_sps: [u16; MAX_LONG_TERM_REF_PICS_SPS],
    pub used_by_curr_pic_lt_sps_flag: [bool; MAX_LONG_TERM_REF_PICS_SPS],
    pub temporal_mvp_enabled_flag: bool,
    pub strong_intra_smoothing_enabled_flag: bool,
    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,
    pub extension_present_flag: bool,
    pub range_extension_flag: bool,
    pub range_extension: SpsRangeExtension,

    // Derived values, see update_derived().
    pub chroma_array_type: u8,
    pub min_cb_log2_size_y: u32,
    pub ctb_log2_size_y: u32,
    pub ctb_size_y: u32,
    pub pic_width_in_ctbs_y: u32,
    pub pic_height_in_ctbs_y: u32,
    pub pic_size_in_ctbs_y: u32,
    pub max_tb_log2_size_y: u32,
    pub wp_offset_half_range_y: u32,
    pub wp_offset_half_range_c: u32,
}

impl Sps {
    /// Computes the variables that the syntax derives from the coded values.
    pub fn update_derived(&mut self) {
        self.chroma_array_type = if self.separate_colour_plane_flag {
            0
        } else {
            self.chroma_format_idc
        };

        // (7-10)
        self.min_cb_log2_size_y = u32::from(self.log2_min_luma_coding_block_size_minus3) + 3;
        // (7-11)
        self.ctb_log2_size_y =
            self.min_cb_log2_size_y + u32::from(self.log2_diff_max_min_luma_coding_block_size);
        // (7-12)
        self.ctb_size_y = 1 << self.ctb_log2_size_y;
        // (7-15)
        self.pic_width_in_ctbs_y =
            u32::from(self.pic_width_in_luma_samples).div_ceil(self.ctb_size_y);
        // (7-17)
        self.pic_height_in_ctbs_y =
            u32::from(self.pic_height_in_luma_samples).div_ceil(self.ctb_size_y);
        // (7-19)
        self.pic_size_in_ctbs_y = self.pic_width_in_ctbs_y * self.pic_height_in_ctbs_y;

        self.max_tb_log2_size_y = u32::from(self.log2_min_luma_transform_block_size_minus2)
            + 2
            + u32::from(self.log2_diff_max_min_luma_transform_block_size);

        let high_precision = self.range_extension.high_precision_offsets_enabled_flag;
        let shift_y = if high_precision {
            u32::from(self.bit_depth_luma_minus8) + 7
        } else {
            7
        };
        let shift_c = if high_precision {
            u32::from(self.bit_depth_chroma_minus8) + 7
        } else {
            7
        };

        self.wp_offset_half_range_y = 1 << shift_y;
        self.wp_offset_half_range_c = 1 << shift_c;
    }

    /// MaxPicOrderCntLsb (7-8).
    pub fn max_pic_order_cnt_lsb(&self) -> i32 {
        1 << (u32::from(self.log2_max_pic_order_cnt_lsb_minus4) + 4)
    }

    /// SubWidthC from Table 6-1.
    pub fn sub_width_c(&self) -> u32 {
        match self.chroma_array_type {
            1 | 2 => 2,
            _ => 1,
        }
    }

    /// SubHeightC from Table 6-1.
    pub fn sub_height_c(&self) -> u32 {
        match self.chroma_array_type {
            1 => 2,
            _ => 1,
        }
    }

    /// The DPB capacity for the highest temporal sub-layer.
    pub fn max_dpb_size(&self) -> usize {
        let highest_tid = usize::from(self.max_sub_layers_minus1);
        std::cmp::min(
            usize::from(self.max_dec_pic_buffering_minus1[highest_tid]) + 1,
            MAX_DPB_SIZE,
        )
    }

    /// Cropped width, i.e. after applying the conformance window.
    pub fn width(&self) -> u32 {
        let crop = self.sub_width_c() * (self.conf_win_left_offset + self.conf_win_right_offset);
        u32::from(self.pic_width_in_luma_samples).saturating_sub(crop)
    }

    /// Cropped height, i.e. after applying the conformance window.
    pub fn height(&self) -> u32 {
        let crop = self.sub_height_c() * (self.conf_win_top_offset + self.conf_win_bottom_offset);
        u32::from(self.pic_height_in_luma_samples).saturating_sub(crop)
    }

    pub fn bit_depth_luma(&self) -> u32 {
        u32::from(self.bit_depth_luma_minus8) + 8
    }

    pub fn bit_depth_chroma(&self) -> u32 {
        u32::from(self.bit_depth_chroma_minus8) + 8
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PpsRangeExtension {
    pub log2_max_transform_skip_block_size_minus2: u32,
    pub cross_component_prediction_enabled_flag: bool,
    pub chroma_qp_offset_list_enabled_flag: bool,
    pub diff_cu_chroma_qp_offset_depth: u32,
    pub chroma_qp_offset_list_len_minus1: u32,
    pub cb_qp_offset_list: [i32; 6],
    pub cr_qp_offset_list: [i32; 6],
    pub log2_sao_offset_scale_luma: u32,
    pub log2_sao_offset_scale_chroma: u32,
}

/// A H.265 Picture Parameter Set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub dependent_slice_segments_enabled_flag: bool,
    pub output_flag_present_flag: bool,
    pub num_extra_slice_header_bits: u8,
    pub sign_data_hiding_enabled_flag: bool,
    pub cabac_init_present_flag: bool,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub init_qp_minus26: i8,
    pub constrained_intra_pred_flag: bool,
    pub transform_skip_enabled_flag: bool,
    pub cu_qp_delta_enabled_flag: bool,
    pub diff_cu_qp_delta_depth: u8,
    pub cb_qp_offset: i8,
    pub cr_qp_offset: i8,
    pub slice_chroma_qp_offsets_present_flag: bool,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_flag: bool,
    pub transquant_bypass_enabled_flag: bool,
    pub tiles_enabled_flag: bool,
    pub entropy_coding_sync_enabled_flag: bool,
    pub num_tile_columns_minus1: u8,
    pub num_tile_rows_minus1: u8,
    pub uniform_spacing_flag: bool,
    /// Tile column widths, either coded or derived through (6-3).
    pub column_width_minus1: [u32; MAX_TILE_COLUMNS],
    /// Tile row heights, either coded or derived through (6-4).
    pub row_height_minus1: [u32; MAX_TILE_ROWS],
    pub loop_filter_across_tiles_enabled_flag: bool,
    pub loop_filter_across_slices_enabled_flag: bool,
    pub deblocking_filter_control_present_flag: bool,
    pub deblocking_filter_override_enabled_flag: bool,
    pub deblocking_filter_disabled_flag: bool,
    pub beta_offset_div2: i8,
    pub tc_offset_div2: i8,
    pub scaling_list_data_present_flag: bool,
    pub scaling_list: ScalingLists,
    pub lists_modification_present_flag: bool,
    pub log2_parallel_merge_level_minus2: u8,
    pub slice_segment_header_extension_present_flag: bool,
    pub extension_present_flag: bool,
    pub range_extension_flag: bool,
    pub range_extension: PpsRangeExtension,

    /// QpBdOffsetY (7-5).
    pub qp_bd_offset_y: u32,
    /// TemporalId of the NAL unit that carried this PPS.
    pub temporal_id: u8,
}

impl Default for Pps {
    fn default() -> Self {
        Self {
            pic_parameter_set_id: 0,
            seq_parameter_set_id: 0,
            dependent_slice_segments_enabled_flag: false,
            output_flag_present_flag: false,
            num_extra_slice_header_bits: 0,
            sign_data_hiding_enabled_flag: false,
            cabac_init_present_flag: false,
            num_ref_idx_l0_default_active_minus1: 0,
            num_ref_idx_l1_default_active_minus1: 0,
            init_qp_minus26: 0,
            constrained_intra_pred_flag: false,
            transform_skip_enabled_flag: false,
            cu_qp_delta_enabled_flag: false,
            diff_cu_qp_delta_depth: 0,
            cb_qp_offset: 0,
            cr_qp_offset: 0,
            slice_chroma_qp_offsets_present_flag: false,
            weighted_pred_flag: false,
            weighted_bipred_flag: false,
            transquant_bypass_enabled_flag: false,
            tiles_enabled_flag: false,
            entropy_coding_sync_enabled_flag: false,
            num_tile_columns_minus1: 0,
            num_tile_rows_minus1: 0,
            uniform_spacing_flag: true,
            column_width_minus1: [0; MAX_TILE_COLUMNS],
            row_height_minus1: [0; MAX_TILE_ROWS],
            loop_filter_across_tiles_enabled_flag: true,
            loop_filter_across_slices_enabled_flag: false,
            deblocking_filter_control_present_flag: false,
            deblocking_filter_override_enabled_flag: false,
            deblocking_filter_disabled_flag: false,
            beta_offset_div2: 0,
            tc_offset_div2: 0,
            scaling_list_data_present_flag: false,
            scaling_list: Default::default(),
            lists_modification_present_flag: false,
            log2_parallel_merge_level_minus2: 0,
            slice_segment_header_extension_present_flag: false,
            extension_present_flag: false,
            range_extension_flag: false,
            range_extension: Default::default(),
            qp_bd_offset_y: 0,
            temporal_id: 0,
        }
    }
}

impl Pps {
    /// Fills in the tile column widths and row heights for uniformly spaced
    /// tiles, as per (6-3) and (6-4).
    pub fn update_uniform_tiles(&mut self, sps: &Sps) {
        let cols = uniform_tile_sizes(
            sps.pic_width_in_ctbs_y,
            u32::from(self.num_tile_columns_minus1) + 1,
        );
        for (dst, size) in self.column_width_minus1.iter_mut().zip(cols) {
            *dst = size.saturating_sub(1);
        }

        let rows = uniform_tile_sizes(
            sps.pic_height_in_ctbs_y,
            u32::from(self.num_tile_rows_minus1) + 1,
        );
        for (dst, size) in self.row_height_minus1.iter_mut().zip(rows) {
            *dst = size.saturating_sub(1);
        }
    }
}

/// Splits `num_ctbs` CTBs into `num_tiles` uniformly spaced tiles (6-3).
pub fn uniform_tile_sizes(num_ctbs: u32, num_tiles: u32) -> Vec<u32> {
    if num_tiles == 0 {
        return vec![];
    }

    (0..num_tiles)
        .map(|i| ((i + 1) * num_ctbs) / num_tiles - (i * num_ctbs) / num_tiles)
        .collect()
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicListModification {
    pub ref_pic_list_modification_flag_l0: bool,
    pub list_entry_l0: Vec<u32>,
    pub ref_pic_list_modification_flag_l1: bool,
    pub list_entry_l1: Vec<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PredWeightTable {
    pub luma_log2_weight_denom: u8,
    pub delta_chroma_log2_weight_denom: i8,
    pub chroma_log2_weight_denom: u8,
    pub luma_weight_l0_flag: [bool; MAX_REF_IDX_ACTIVE],
    pub chroma_weight_l0_flag: [bool; MAX_REF_IDX_ACTIVE],
    pub delta_luma_weight_l0: [i8; MAX_REF_IDX_ACTIVE],
    pub luma_offset_l0: [i16; MAX_REF_IDX_ACTIVE],
    pub delta_chroma_weight_l0: [[i8; 2]; MAX_REF_IDX_ACTIVE],
    pub delta_chroma_offset_l0: [[i16; 2]; MAX_REF_IDX_ACTIVE],
    pub luma_weight_l1_flag: [bool; MAX_REF_IDX_ACTIVE],
    pub chroma_weight_l1_flag: [bool; MAX_REF_IDX_ACTIVE],
    pub delta_luma_weight_l1: [i8; MAX_REF_IDX_ACTIVE],
    pub luma_offset_l1: [i16; MAX_REF_IDX_ACTIVE],
    pub delta_chroma_weight_l1: [[i8; 2]; MAX_REF_IDX_ACTIVE],
    pub delta_chroma_offset_l1: [[i16; 2]; MAX_REF_IDX_ACTIVE],
}

/// slice_type, table 7-7.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SliceType {
    B = 0,
    #[default]
    P = 1,
    I = 2,
}

impl SliceType {
    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P)
    }

    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }

    pub fn is_i(&self) -> bool {
        matches!(self, SliceType::I)
    }
}

/// A slice segment header (7.3.6.1).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SliceHeader {
    pub first_slice_segment_in_pic_flag: bool,
    pub no_output_of_prior_pics_flag: bool,
    pub pic_parameter_set_id: u8,
    pub dependent_slice_segment_flag: bool,
    pub segment_address: u32,
    pub type_: SliceType,
    pub pic_output_flag: bool,
    pub colour_plane_id: u8,
    pub pic_order_cnt_lsb: u16,
    pub short_term_ref_pic_set_sps_flag: bool,
    /// The set coded in the slice header, if any.
    pub short_term_ref_pic_set: ShortTermRefPicSet,
    pub short_term_ref_pic_set_idx: u8,
    pub num_long_term_sps: u8,
    pub num_long_term_pics: u8,
    pub lt_idx_sps: [u8; MAX_DPB_SIZE],
    /// PocLsbLt, i.e. already resolved through lt_idx_sps when needed.
    pub poc_lsb_lt: [u16; MAX_DPB_SIZE],
    /// UsedByCurrPicLt, resolved the same way as `poc_lsb_lt`.
    pub used_by_curr_pic_lt: [bool; MAX_DPB_SIZE],
    pub delta_poc_msb_present_flag: [bool; MAX_DPB_SIZE],
    pub delta_poc_msb_cycle_lt: [u32; MAX_DPB_SIZE],
    pub temporal_mvp_enabled_flag: bool,
    pub sao_luma_flag: bool,
    pub sao_chroma_flag: bool,
    pub num_ref_idx_active_override_flag: bool,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
    pub ref_pic_list_modification: RefPicListModification,
    pub mvd_l1_zero_flag: bool,
    pub cabac_init_flag: bool,
    pub collocated_from_l0_flag: bool,
    pub collocated_ref_idx: u8,
    pub pred_weight_table: PredWeightTable,
    pub five_minus_max_num_merge_cand: u8,
    pub qp_delta: i8,
    pub cb_qp_offset: i8,
    pub cr_qp_offset: i8,
    pub cu_chroma_qp_offset_enabled_flag: bool,
    pub deblocking_filter_override_flag: bool,
    pub deblocking_filter_disabled_flag: bool,
    pub beta_offset_div2: i8,
    pub tc_offset_div2: i8,
    pub loop_filter_across_slices_enabled_flag: bool,
    pub num_entry_point_offsets: u32,
    pub offset_len_minus1: u8,
    pub entry_point_offset_minus1: Vec<u32>,

    /// CurrRpsIdx.
    pub curr_rps_idx: u8,
    /// NumPicTotalCurr (7-55).
    pub num_pic_total_curr: u32,
    /// Size of the slice segment header in bits, counted from the start of the
    /// RBSP and up to the end of byte_alignment().
    pub header_bit_size: u32,
    /// Number of emulation prevention bytes found in the slice segment header.
    pub n_emulation_prevention_bytes: u32,
}

impl Default for SliceHeader {
    fn default() -> Self {
        Self {
            first_slice_segment_in_pic_flag: false,
            no_output_of_prior_pics_flag: false,
            pic_parameter_set_id: 0,
            dependent_slice_segment_flag: false,
            segment_address: 0,
            type_: Default::default(),
            pic_output_flag: true,
            colour_plane_id: 0,
            pic_order_cnt_lsb: 0,
            short_term_ref_pic_set_sps_flag: false,
            short_term_ref_pic_set: Default::default(),
            short_term_ref_pic_set_idx: 0,
            num_long_term_sps: 0,
            num_long_term_pics: 0,
            lt_idx_sps: [0; MAX_DPB_SIZE],
            poc_lsb_lt: [0; MAX_DPB_SIZE],
            used_by_curr_pic_lt: [false; MAX_DPB_SIZE],
            delta_poc_msb_present_flag: [false; MAX_DPB_SIZE],
            delta_poc_msb_cycle_lt: [0; MAX_DPB_SIZE],
            temporal_mvp_enabled_flag: false,
            sao_luma_flag: false,
            sao_chroma_flag: false,
            num_ref_idx_active_override_flag: false,
            num_ref_idx_l0_active_minus1: 0,
            num_ref_idx_l1_active_minus1: 0,
            ref_pic_list_modification: Default::default(),
            mvd_l1_zero_flag: false,
            cabac_init_flag: false,
            collocated_from_l0_flag: true,
            collocated_ref_idx: 0,
            pred_weight_table: Default::default(),
            five_minus_max_num_merge_cand: 0,
            qp_delta: 0,
            cb_qp_offset: 0,
            cr_qp_offset: 0,
            cu_chroma_qp_offset_enabled_flag: false,
            deblocking_filter_override_flag: false,
            deblocking_filter_disabled_flag: false,
            beta_offset_div2: 0,
            tc_offset_div2: 0,
            loop_filter_across_slices_enabled_flag: false,
            num_entry_point_offsets: 0,
            offset_len_minus1: 0,
            entry_point_offset_minus1: vec![],
            curr_rps_idx: 0,
            num_pic_total_curr: 0,
            header_bit_size: 0,
            n_emulation_prevention_bytes: 0,
        }
    }
}

impl SliceHeader {
    /// The short-term RPS in effect for this slice: either the one coded in the
    /// header or the SPS candidate it selects.
    pub fn st_rps<'a>(&'a self, sps: &'a Sps) -> Option<&'a ShortTermRefPicSet> {
        if self.short_term_ref_pic_set_sps_flag {
            sps.short_term_ref_pic_set
                .get(usize::from(self.short_term_ref_pic_set_idx))
        } else {
            Some(&self.short_term_ref_pic_set)
        }
    }

    /// Number of long-term entries signalled in the header.
    pub fn num_long_term(&self) -> usize {
        usize::from(self.num_long_term_sps) + usize::from(self.num_long_term_pics)
    }
}

/// A H265 slice segment.
pub struct Slice<'a> {
    /// The slice segment header.
    pub header: SliceHeader,
    /// The NAL unit backing this slice segment.
    pub nalu: Nalu<'a>,
}

/// Ceil(Log2(`value`)), with Ceil(Log2(1)) == 0.
pub(crate) fn ceil_log2(value: u32) -> usize {
    if value <= 1 {
        0
    } else {
        (32 - (value - 1).leading_zeros()) as usize
    }
}

/// Parses H.265 header NAL units and keeps the parameter sets they activate.
#[derive(Debug, Default)]
pub struct Parser {
    active_vpses: BTreeMap<u8, Rc<Vps>>,
    active_spses: BTreeMap<u8, Rc<Sps>>,
    active_ppses: BTreeMap<u8, Rc<Pps>>,
    /// The last independent slice segment header, to fill in dependent ones.
    last_independent_header: Option<SliceHeader>,
}

impl Parser {
    fn check_type(nalu: &Nalu, expected: NaluType) -> anyhow::Result<()> {
        if nalu.header.type_ != expected {
            return Err(anyhow!(
                "Expected a {:?} NAL unit, got {:?}",
                expected,
                nalu.header.type_
            ));
        }

        Ok(())
    }

    pub(crate) fn parse_profile_info(
        info: &mut ProfileInfo,
        r: &mut BitReader,
    ) -> anyhow::Result<()> {
        info.profile_space = r.read_bits(2)?;
        info.tier_flag = r.read_bit()?;
        info.profile_idc = r.read_bits(5)?;

        for flag in info.profile_compatibility_flag.iter_mut() {
            *flag = r.read_bit()?;
        }

        info.progressive_source_flag = r.read_bit()?;
        info.interlaced_source_flag = r.read_bit()?;
        info.non_packed_constraint_flag = r.read_bit()?;
        info.frame_only_constraint_flag = r.read_bit()?;

        // 43 bits of constraint flags or reserved bits.
        if info.has_extension_constraint_flags() {
            info.max_12bit_constraint_flag = r.read_bit()?;
            info.max_10bit_constraint_flag = r.read_bit()?;
            info.max_8bit_constraint_flag = r.read_bit()?;
            info.max_422chroma_constraint_flag = r.read_bit()?;
            info.max_420chroma_constraint_flag = r.read_bit()?;
            info.max_monochrome_constraint_flag = r.read_bit()?;
            info.intra_constraint_flag = r.read_bit()?;
            info.one_picture_only_constraint_flag = r.read_bit()?;
            info.lower_bit_rate_constraint_flag = r.read_bit()?;
            if info.has_max_14bit_flag() {
                info.max_14bit_constraint_flag = r.read_bit()?;
                r.skip_bits(33)?;
            } else {
                r.skip_bits(34)?;
            }
        } else if info.conforms_to(2) {
            r.skip_bits(7)?;
            info.one_picture_only_constraint_flag = r.read_bit()?;
            r.skip_bits(35)?;
        } else {
            r.skip_bits(43)?;
        }

        if info.has_inbld_flag() {
            info.inbld_flag = r.read_bit()?;
        } else {
            r.skip_bits(1)?;
        }

        Ok(())
    }

    fn parse_profile_tier_level(
        ptl: &mut ProfileTierLevel,
        r: &mut BitReader,
        profile_present_flag: bool,
        max_sub_layers_minus1: u8,
    ) -> anyhow::Result<()> {
        if profile_present_flag {
            Self::parse_profile_info(&mut ptl.general, r)?;
        }

        ptl.general_level_idc = r.read_bits(8)?;

        let num_sub_layers = usize::from(max_sub_layers_minus1);
        for i in 0..num_sub_layers {
            ptl.sub_layer_profile_present_flag[i] = r.read_bit()?;
            ptl.sub_layer_level_present_flag[i] = r.read_bit()?;
        }

        if num_sub_layers > 0 {
            for _ in num_sub_layers..8 {
                r.skip_bits(2)?; // reserved_zero_2bits
            }
        }

        for i in 0..num_sub_layers {
            if ptl.sub_layer_profile_present_flag[i] {
                Self::parse_profile_info(&mut ptl.sub_layer[i], r)?;
            }

            if ptl.sub_layer_level_present_flag[i] {
                ptl.sub_layer_level_idc[i] = r.read_bits(8)?;
            }
        }

        Ok(())
    }

    fn parse_scaling_list_data(sl: &mut ScalingLists, r: &mut BitReader) -> anyhow::Result<()> {
        // 7.3.4
        for size_id in 0..4 {
            let step = if size_id == 3 { 3 } else { 1 };
            for matrix_id in (0..6).step_by(step) {
                let scaling_list_pred_mode_flag = r.read_bit()?;
                if !scaling_list_pred_mode_flag {
                    let delta: usize = r.read_ue_max(matrix_id as u32 / step as u32)?;
                    if delta == 0 {
                        sl.fill_default(size_id, matrix_id);
                    } else {
                        // (7-42)
                        sl.copy(size_id, matrix_id, matrix_id - delta * step);
                    }
                } else {
                    let mut next_coef = 8i32;
                    let coef_num = std::cmp::min(64, 1 << (4 + (size_id << 1)));

                    if size_id > 1 {
                        let dc: i16 = r.read_se_bounded(-7, 247)?;
                        if size_id == 2 {
                            sl.scaling_list_dc_coef_minus8_16x16[matrix_id] = dc;
                        } else {
                            sl.scaling_list_dc_coef_minus8_32x32[matrix_id] = dc;
                        }

                        next_coef = i32::from(dc) + 8;
                    }

                    let list = sl.list_mut(size_id, matrix_id);
                    for coef in list.iter_mut().take(coef_num) {
                        let delta: i32 = r.read_se_bounded(-128, 127)?;
                        next_coef = (next_coef + delta + 256) % 256;
                        *coef = next_coef as u8;
                    }
                }
            }
        }

        // 4:2:0 32x32 chroma lists are copied from the 16x16 ones (7.3.4).
        for matrix_id in [1, 2, 4, 5] {
            sl.scaling_list_32x32[matrix_id] = sl.scaling_list_16x16[matrix_id];
            sl.scaling_list_dc_coef_minus8_32x32[matrix_id] =
                sl.scaling_list_dc_coef_minus8_16x16[matrix_id];
        }

        Ok(())
    }

    /// Parses st_ref_pic_set(`st_rps_idx`) into `st`. `sets` holds the sets
    /// parsed so far from the SPS.
    fn parse_short_term_ref_pic_set(
        sps: &Sps,
        sets: &[ShortTermRefPicSet],
        st: &mut ShortTermRefPicSet,
        r: &mut BitReader,
        st_rps_idx: u8,
    ) -> anyhow::Result<()> {
        if st_rps_idx != 0 {
            st.inter_ref_pic_set_prediction_flag = r.read_bit()?;
        }

        let max_dec_pic_buffering =
            u32::from(sps.max_dec_pic_buffering_minus1[usize::from(sps.max_sub_layers_minus1)]);

        if st.inter_ref_pic_set_prediction_flag {
            if st_rps_idx == sps.num_short_term_ref_pic_sets {
                st.delta_idx_minus1 = r.read_ue_max(u32::from(st_rps_idx) - 1)?;
            }

            st.delta_rps_sign = r.read_bit()?;
            st.abs_delta_rps_minus1 = r.read_ue_max(32767)?;

            let ref_rps_idx = st_rps_idx
                .checked_sub(st.delta_idx_minus1 + 1)
                .ok_or(anyhow!("Invalid delta_idx_minus1"))?;
            let ref_st = sets
                .get(usize::from(ref_rps_idx))
                .ok_or(anyhow!("Invalid RefRpsIdx {}", ref_rps_idx))?;

            // (7-60)
            let abs_delta_rps = i32::from(st.abs_delta_rps_minus1) + 1;
            let delta_rps = if st.delta_rps_sign {
                -abs_delta_rps
            } else {
                abs_delta_rps
            };

            let num_ref_deltas = ref_st.num_delta_pocs();
            let mut used_by_curr_pic_flag = [false; MAX_DPB_SIZE + 1];
            let mut use_delta_flag = [true; MAX_DPB_SIZE + 1];
            for j in 0..=num_ref_deltas {
                used_by_curr_pic_flag[j] = r.read_bit()?;
                if !used_by_curr_pic_flag[j] {
                    use_delta_flag[j] = r.read_bit()?;
                }
            }

            let ref_neg = usize::from(ref_st.num_negative_pics);
            let ref_pos = usize::from(ref_st.num_positive_pics);

            let mut s0 = vec![];
            let mut s1 = vec![];

            // (7-61)
            for j in (0..ref_pos).rev() {
                let d_poc = ref_st.delta_poc_s1[j] + delta_rps;
                if d_poc < 0 && use_delta_flag[ref_neg + j] {
                    s0.push((d_poc, used_by_curr_pic_flag[ref_neg + j]));
                }
            }
            if delta_rps < 0 && use_delta_flag[num_ref_deltas] {
                s0.push((delta_rps, used_by_curr_pic_flag[num_ref_deltas]));
            }
            for j in 0..ref_neg {
                let d_poc = ref_st.delta_poc_s0[j] + delta_rps;
                if d_poc < 0 && use_delta_flag[j] {
                    s0.push((d_poc, used_by_curr_pic_flag[j]));
                }
            }

            // (7-62)
            for j in (0..ref_neg).rev() {
                let d_poc = ref_st.delta_poc_s0[j] + delta_rps;
                if d_poc > 0 && use_delta_flag[j] {
                    s1.push((d_poc, used_by_curr_pic_flag[j]));
                }
            }
            if delta_rps > 0 && use_delta_flag[num_ref_deltas] {
                s1.push((delta_rps, used_by_curr_pic_flag[num_ref_deltas]));
            }
            for j in 0..ref_pos {
                let d_poc = ref_st.delta_poc_s1[j] + delta_rps;
                if d_poc > 0 && use_delta_flag[ref_neg + j] {
                    s1.push((d_poc, used_by_curr_pic_flag[ref_neg + j]));
                }
            }

            if s0.len() + s1.len() > max_dec_pic_buffering as usize {
                return Err(anyhow!(
                    "Predicted RPS holds {} pictures, more than the DPB allows",
                    s0.len() + s1.len()
                ));
            }

            for (i, (d_poc, used)) in s0.iter().enumerate() {
                st.delta_poc_s0[i] = *d_poc;
                st.used_by_curr_pic_s0[i] = *used;
            }
            for (i, (d_poc, used)) in s1.iter().enumerate() {
                st.delta_poc_s1[i] = *d_poc;
                st.used_by_curr_pic_s1[i] = *used;
            }

            st.num_negative_pics = s0.len() as u8;
            st.num_positive_pics = s1.len() as u8;
        } else {
            st.num_negative_pics = r.read_ue_max(max_dec_pic_buffering)?;
            st.num_positive_pics =
                r.read_ue_max(max_dec_pic_buffering - u32::from(st.num_negative_pics))?;

            // (7-63), (7-65)
            let mut poc = 0;
            for i in 0..usize::from(st.num_negative_pics) {
                let delta_poc_s0_minus1: i32 = r.read_ue_max(32767)?;
                poc -= delta_poc_s0_minus1 + 1;
                st.delta_poc_s0[i] = poc;
                st.used_by_curr_pic_s0[i] = r.read_bit()?;
            }

            // (7-64), (7-66)
            let mut poc = 0;
            for i in 0..usize::from(st.num_positive_pics) {
                let delta_poc_s1_minus1: i32 = r.read_ue_max(32767)?;
                poc += delta_poc_s1_minus1 + 1;
                st.delta_poc_s1[i] = poc;
                st.used_by_curr_pic_s1[i] = r.read_bit()?;
            }
        }

        Ok(())
    }

    fn parse_sublayer_hrd_parameters(
        h: &mut SublayerHrdParameters,
        cpb_cnt: u32,
        sub_pic_hrd_params_present_flag: bool,
        r: &mut BitReader,
    ) -> anyhow::Result<()> {
        for i in 0..cpb_cnt as usize {
            h.bit_rate_value_minus1[i] = r.read_ue_max(u32::MAX - 1)?;
            h.cpb_size_value_minus1[i] = r.read_ue_max(u32::MAX - 1)?;
            if sub_pic_hrd_params_present_flag {
                h.cpb_size_du_value_minus1[i] = r.read_ue_max(u32::MAX - 1)?;
                h.bit_rate_du_value_minus1[i] = r.read_ue_max(u32::MAX - 1)?;
            }

            h.cbr_flag[i] = r.read_bit()?;
        }

        Ok(())
    }

    fn parse_hrd_parameters(
        common_inf_present_flag: bool,
        max_sub_layers_minus1: u8,
        hrd: &mut HrdParams,
        r: &mut BitReader,
    ) -> anyhow::Result<()> {
        if common_inf_present_flag {
            hrd.nal_hrd_parameters_present_flag = r.read_bit()?;
            hrd.vcl_hrd_parameters_present_flag = r.read_bit()?;
            if hrd.nal_hrd_parameters_present_flag || hrd.vcl_hrd_parameters_present_flag {
                hrd.sub_pic_hrd_params_present_flag = r.read_bit()?;
                if hrd.sub_pic_hrd_params_present_flag {
                    hrd.tick_divisor_minus2 = r.read_bits(8)?;
                    hrd.du_cpb_removal_delay_increment_length_minus1 = r.read_bits(5)?;
                    hrd.sub_pic_cpb_params_in_pic_timing_sei_flag = r.read_bit()?;
                    hrd.dpb_output_delay_du_length_minus1 = r.read_bits(5)?;
                }
                hrd.bit_rate_scale = r.read_bits(4)?;
                hrd.cpb_size_scale = r.read_bits(4)?;
                if hrd.sub_pic_hrd_params_present_flag {
                    hrd.cpb_size_du_scale = r.read_bits(4)?;
                }
                hrd.initial_cpb_removal_delay_length_minus1 = r.read_bits(5)?;
                hrd.au_cpb_removal_delay_length_minus1 = r.read_bits(5)?;
                hrd.dpb_output_delay_length_minus1 = r.read_bits(5)?;
            }
        }

        for i in 0..=usize::from(max_sub_layers_minus1) {
            hrd.fixed_pic_rate_general_flag[i] = r.read_bit()?;
            if !hrd.fixed_pic_rate_general_flag[i] {
                hrd.fixed_pic_rate_within_cvs_flag[i] = r.read_bit()?;
            } else {
                hrd.fixed_pic_rate_within_cvs_flag[i] = true;
            }

            if hrd.fixed_pic_rate_within_cvs_flag[i] {
                hrd.elemental_duration_in_tc_minus1[i] = r.read_ue_max(2047)?;
            } else {
                hrd.low_delay_hrd_flag[i] = r.read_bit()?;
            }

            if !hrd.low_delay_hrd_flag[i] {
                hrd.cpb_cnt_minus1[i] = r.read_ue_max(31)?;
            }

            if hrd.nal_hrd_parameters_present_flag {
                Self::parse_sublayer_hrd_parameters(
                    &mut hrd.nal_hrd[i],
                    hrd.cpb_cnt_minus1[i] + 1,
                    hrd.sub_pic_hrd_params_present_flag,
                    r,
                )?;
            }

            if hrd.vcl_hrd_parameters_present_flag {
                Self::parse_sublayer_hrd_parameters(
                    &mut hrd.vcl_hrd[i],
                    hrd.cpb_cnt_minus1[i] + 1,
                    hrd.sub_pic_hrd_params_present_flag,
                    r,
                )?;
            }
        }

        Ok(())
    }

    fn read_u32(r: &mut BitReader) -> anyhow::Result<u32> {
        let high = r.read_bits::<u32>(16)?;
        let low = r.read_bits::<u32>(16)?;
        Ok((high << 16) | low)
    }

    fn parse_vui_parameters(sps: &mut Sps, r: &mut BitReader) -> anyhow::Result<()> {
        let vui = &mut sps.vui_parameters;

        vui.aspect_ratio_info_present_flag = r.read_bit()?;
        if vui.aspect_ratio_info_present_flag {
            vui.aspect_ratio_idc = r.read_bits(8)?;
            const EXTENDED_SAR: u8 = 255;
            if vui.aspect_ratio_idc == EXTENDED_SAR {
                vui.sar_width = r.read_bits(16)?;
                vui.sar_height = r.read_bits(16)?;
            }
        }

        vui.overscan_info_present_flag = r.read_bit()?;
        if vui.overscan_info_present_flag {
            vui.overscan_appropriate_flag = r.read_bit()?;
        }

        vui.video_signal_type_present_flag = r.read_bit()?;
        if vui.video_signal_type_present_flag {
            vui.video_format = r.read_bits(3)?;
            vui.video_full_range_flag = r.read_bit()?;
            vui.colour_description_present_flag = r.read_bit()?;
            if vui.colour_description_present_flag {
                vui.colour_primaries = r.read_bits(8)?;
                vui.transfer_characteristics = r.read_bits(8)?;
                vui.matrix_coeffs = r.read_bits(8)?;
            }
        }

        vui.chroma_loc_info_present_flag = r.read_bit()?;
        if vui.chroma_loc_info_present_flag {
            vui.chroma_sample_loc_type_top_field = r.read_ue_max(5)?;
            vui.chroma_sample_loc_type_bottom_field = r.read_ue_max(5)?;
        }

        vui.neutral_chroma_indication_flag = r.read_bit()?;
        vui.field_seq_flag = r.read_bit()?;
        vui.frame_field_info_present_flag = r.read_bit()?;
        vui.default_display_window_flag = r.read_bit()?;

        if vui.default_display_window_flag {
            vui.def_disp_win_left_offset = r.read_ue()?;
            vui.def_disp_win_right_offset = r.read_ue()?;
            vui.def_disp_win_top_offset = r.read_ue()?;
            vui.def_disp_win_bottom_offset = r.read_ue()?;
        }

        vui.timing_info_present_flag = r.read_bit()?;
        if vui.timing_info_present_flag {
            vui.num_units_in_tick = Self::read_u32(r)?;
            vui.time_scale = Self::read_u32(r)?;

            vui.poc_proportional_to_timing_flag = r.read_bit()?;
            if vui.poc_proportional_to_timing_flag {
                vui.num_ticks_poc_diff_one_minus1 = r.read_ue_max(u32::MAX - 1)?;
            }

            vui.hrd_parameters_present_flag = r.read_bit()?;
            if vui.hrd_parameters_present_flag {
                Self::parse_hrd_parameters(true, sps.max_sub_layers_minus1, &mut vui.hrd, r)?;
            }
        }

        vui.bitstream_restriction_flag = r.read_bit()?;
        if vui.bitstream_restriction_flag {
            vui.tiles_fixed_structure_flag = r.read_bit()?;
            vui.motion_vectors_over_pic_boundaries_flag = r.read_bit()?;
            vui.restricted_ref_pic_lists_flag = r.read_bit()?;

            vui.min_spatial_segmentation_idc = r.read_ue_max(4095)?;
            vui.max_bytes_per_pic_denom = r.read_ue_max(16)?;
            vui.max_bits_per_min_cu_denom = r.read_ue_max(16)?;
            vui.log2_max_mv_length_horizontal = r.read_ue_max(15)?;
            vui.log2_max_mv_length_vertical = r.read_ue_max(15)?;
        }

        Ok(())
    }

    /// Parse a VPS NALU.
    pub fn parse_vps(&mut self, nalu: &Nalu) -> anyhow::Result<&Rc<Vps>> {
        Self::check_type(nalu, NaluType::VpsNut)?;

        let mut r = BitReader::new(nalu.payload(), true);

        let mut vps = Vps {
            video_parameter_set_id: r.read_bits(4)?,
            base_layer_internal_flag: r.read_bit()?,
            base_layer_available_flag: r.read_bit()?,
            max_layers_minus1: r.read_bits(6)?,
            max_sub_layers_minus1: r.read_bits(3)?,
            temporal_id_nesting_flag: r.read_bit()?,
            ..Default::default()
        };

        if usize::from(vps.max_sub_layers_minus1) >= MAX_SUB_LAYERS {
            return Err(anyhow!(
                "Invalid vps_max_sub_layers_minus1 {}",
                vps.max_sub_layers_minus1
            ));
        }

        r.skip_bits(16)?; // vps_reserved_0xffff_16bits

        Self::parse_profile_tier_level(
            &mut vps.profile_tier_level,
            &mut r,
            true,
            vps.max_sub_layers_minus1,
        )?;

        vps.sub_layer_ordering_info_present_flag = r.read_bit()?;

        let max_sub_layers = usize::from(vps.max_sub_layers_minus1);
        let start = if vps.sub_layer_ordering_info_present_flag {
            0
        } else {
            max_sub_layers
        };

        for i in start..=max_sub_layers {
            vps.max_dec_pic_buffering_minus1[i] = r.read_ue_max(MAX_DPB_SIZE as u32 - 1)?;
            vps.max_num_reorder_pics[i] = r.read_ue_max(vps.max_dec_pic_buffering_minus1[i])?;
            vps.max_latency_increase_plus1[i] = r.read_ue_max(u32::MAX - 1)?;

            if i > 0 {
                if vps.max_dec_pic_buffering_minus1[i] < vps.max_dec_pic_buffering_minus1[i - 1] {
                    return Err(anyhow!(
                        "Invalid max_dec_pic_buffering_minus1[{}]: {}",
                        i,
                        vps.max_dec_pic_buffering_minus1[i]
                    ));
                }

                if vps.max_num_reorder_pics[i] < vps.max_num_reorder_pics[i - 1] {
                    return Err(anyhow!(
                        "Invalid max_num_reorder_pics[{}]: {}",
                        i,
                        vps.max_num_reorder_pics[i]
                    ));
                }
            }
        }

        // When only the highest sub-layer is signalled, its values apply to
        // all of them.
        if !vps.sub_layer_ordering_info_present_flag {
            for i in 0..max_sub_layers {
                vps.max_dec_pic_buffering_minus1[i] = vps.max_dec_pic_buffering_minus1[max_sub_layers];
                vps.max_num_reorder_pics[i] = vps.max_num_reorder_pics[max_sub_layers];
                vps.max_latency_increase_plus1[i] = vps.max_latency_increase_plus1[max_sub_layers];
            }
        }

        vps.max_layer_id = r.read_bits(6)?;
        if vps.max_layer_id > 62 {
            return Err(anyhow!("Invalid max_layer_id {}", vps.max_layer_id));
        }

        vps.num_layer_sets_minus1 = r.read_ue_max(1023)?;

        for _ in 1..=vps.num_layer_sets_minus1 {
            // layer_id_included_flag[i][j]
            r.skip_bits(usize::from(vps.max_layer_id) + 1)?;
        }

        vps.timing_info_present_flag = r.read_bit()?;

        if vps.timing_info_present_flag {
            vps.num_units_in_tick = Self::read_u32(&mut r)?;
            vps.time_scale = Self::read_u32(&mut r)?;

            vps.poc_proportional_to_timing_flag = r.read_bit()?;
            if vps.poc_proportional_to_timing_flag {
                vps.num_ticks_poc_diff_one_minus1 = r.read_ue_max(u32::MAX - 1)?;
            }

            vps.num_hrd_parameters = r.read_ue_max(vps.num_layer_sets_minus1 + 1)?;

            for i in 0..vps.num_hrd_parameters as usize {
                vps.hrd_layer_set_idx.push(r.read_ue_max(vps.num_layer_sets_minus1)?);
                // cprms_present_flag[0] is inferred to be 1.
                let cprms_present_flag = if i > 0 { r.read_bit()? } else { true };
                vps.cprms_present_flag.push(cprms_present_flag);

                let mut hrd = HrdParams::default();
                Self::parse_hrd_parameters(
                    cprms_present_flag,
                    vps.max_sub_layers_minus1,
                    &mut hrd,
                    &mut r,
                )?;

                vps.hrd_parameters.push(hrd);
            }
        }

        vps.extension_flag = r.read_bit()?;

        let key = vps.video_parameter_set_id;
        self.active_vpses.insert(key, Rc::new(vps));

        if self.active_vpses.len() > MAX_VPS_COUNT {
            return Err(anyhow!("Broken data: Number of active VPSs > MAX_VPS_COUNT"));
        }

        self.get_vps(key)
            .ok_or(anyhow!("VPS {} vanished after insertion", key))
    }

    fn parse_sps_range_extension(sps: &mut Sps, r: &mut BitReader) -> anyhow::Result<()> {
        let ext = &mut sps.range_extension;

        ext.transform_skip_rotation_enabled_flag = r.read_bit()?;
        ext.transform_skip_context_enabled_flag = r.read_bit()?;
        ext.implicit_rdpcm_enabled_flag = r.read_bit()?;
        ext.explicit_rdpcm_enabled_flag = r.read_bit()?;
        ext.extended_precision_processing_flag = r.read_bit()?;
        ext.intra_smoothing_disabled_flag = r.read_bit()?;
        ext.high_precision_offsets_enabled_flag = r.read_bit()?;
        ext.persistent_rice_adaptation_enabled_flag = r.read_bit()?;
        ext.cabac_bypass_alignment_enabled_flag = r.read_bit()?;

        Ok(())
    }

    /// Parse a SPS NALU.
    pub fn parse_sps(&mut self, nalu: &Nalu) -> anyhow::Result<&Rc<Sps>> {
        Self::check_type(nalu, NaluType::SpsNut)?;

        let mut r = BitReader::new(nalu.payload(), true);

        let mut sps = Sps {
            video_parameter_set_id: r.read_bits(4)?,
            max_sub_layers_minus1: r.read_bits(3)?,
            temporal_id_nesting_flag: r.read_bit()?,
            ..Default::default()
        };

        if usize::from(sps.max_sub_layers_minus1) >= MAX_SUB_LAYERS {
            return Err(anyhow!(
                "Invalid sps_max_sub_layers_minus1 {}",
                sps.max_sub_layers_minus1
            ));
        }

        Self::parse_profile_tier_level(
            &mut sps.profile_tier_level,
            &mut r,
            true,
            sps.max_sub_layers_minus1,
        )?;

        sps.seq_parameter_set_id = r.read_ue_max(MAX_SPS_COUNT as u32 - 1)?;
        sps.chroma_format_idc = r.read_ue_max(3)?;

        if sps.chroma_format_idc == 3 {
            sps.separate_colour_plane_flag = r.read_bit()?;
        }

        sps.pic_width_in_luma_samples = r.read_ue_bounded(1, 16888)?;
        sps.pic_height_in_luma_samples = r.read_ue_bounded(1, 16888)?;

        sps.conformance_window_flag = r.read_bit()?;
        if sps.conformance_window_flag {
            sps.conf_win_left_offset = r.read_ue()?;
            sps.conf_win_right_offset = r.read_ue()?;
            sps.conf_win_top_offset = r.read_ue()?;
            sps.conf_win_bottom_offset = r.read_ue()?;
        }

        sps.bit_depth_luma_minus8 = r.read_ue_max(8)?;
        sps.bit_depth_chroma_minus8 = r.read_ue_max(8)?;
        sps.log2_max_pic_order_cnt_lsb_minus4 = r.read_ue_max(12)?;
        sps.sub_layer_ordering_info_present_flag = r.read_bit()?;

        let max_sub_layers = usize::from(sps.max_sub_layers_minus1);
        let start = if sps.sub_layer_ordering_info_present_flag {
            0
        } else {
            max_sub_layers
        };

        for i in start..=max_sub_layers {
            sps.max_dec_pic_buffering_minus1[i] = r.read_ue_max(MAX_DPB_SIZE as u32 - 1)?;
            sps.max_num_reorder_pics[i] =
                r.read_ue_max(u32::from(sps.max_dec_pic_buffering_minus1[i]))?;
            sps.max_latency_increase_plus1[i] = r.read_ue_max(u32::MAX - 1)?;
        }

        if !sps.sub_layer_ordering_info_present_flag {
            for i in 0..max_sub_layers {
                sps.max_dec_pic_buffering_minus1[i] = sps.max_dec_pic_buffering_minus1[max_sub_layers];
                sps.max_num_reorder_pics[i] = sps.max_num_reorder_pics[max_sub_layers];
                sps.max_latency_increase_plus1[i] = sps.max_latency_increase_plus1[max_sub_layers];
            }
        }

        sps.log2_min_luma_coding_block_size_minus3 = r.read_ue_max(3)?;
        sps.log2_diff_max_min_luma_coding_block_size = r.read_ue_max(3)?;
        sps.log2_min_luma_transform_block_size_minus2 = r.read_ue_max(3)?;
        sps.log2_diff_max_min_luma_transform_block_size = r.read_ue_max(3)?;

        sps.update_derived();

        if sps.ctb_log2_size_y > 6 {
            return Err(anyhow!("Invalid CtbLog2SizeY: {}", sps.ctb_log2_size_y));
        }

        if sps.max_tb_log2_size_y > std::cmp::min(sps.ctb_log2_size_y, 5) {
            return Err(anyhow!(
                "Invalid value for MaxTbLog2SizeY: {}",
                sps.max_tb_log2_size_y
            ));
        }

        sps.max_transform_hierarchy_depth_inter = r.read_ue_max(sps.ctb_log2_size_y)?;
        sps.max_transform_hierarchy_depth_intra = r.read_ue_max(sps.ctb_log2_size_y)?;

        sps.scaling_list_enabled_flag = r.read_bit()?;
        if sps.scaling_list_enabled_flag {
            sps.scaling_list_data_present_flag = r.read_bit()?;
            if sps.scaling_list_data_present_flag {
                Self::parse_scaling_list_data(&mut sps.scaling_list, &mut r)?;
            }
        }

        sps.amp_enabled_flag = r.read_bit()?;
        sps.sample_adaptive_offset_enabled_flag = r.read_bit()?;

        sps.pcm_enabled_flag = r.read_bit()?;
        if sps.pcm_enabled_flag {
            sps.pcm_sample_bit_depth_luma_minus1 = r.read_bits(4)?;
            sps.pcm_sample_bit_depth_chroma_minus1 = r.read_bits(4)?;
            sps.log2_min_pcm_luma_coding_block_size_minus3 = r.read_ue_max(2)?;
            sps.log2_diff_max_min_pcm_luma_coding_block_size = r.read_ue_max(2)?;
            sps.pcm_loop_filter_disabled_flag = r.read_bit()?;
        }

        sps.num_short_term_ref_pic_sets = r.read_ue_max(MAX_SHORT_TERM_REF_PIC_SETS as u32)?;

        let mut sets = Vec::with_capacity(usize::from(sps.num_short_term_ref_pic_sets));
        for i in 0..sps.num_short_term_ref_pic_sets {
            let mut st = ShortTermRefPicSet::default();
            Self::parse_short_term_ref_pic_set(&sps, &sets, &mut st, &mut r, i)?;
            sets.push(st);
        }
        sps.short_term_ref_pic_set = sets;

        sps.long_term_ref_pics_present_flag = r.read_bit()?;
        if sps.long_term_ref_pics_present_flag {
            sps.num_long_term_ref_pics_sps = r.read_ue_max(MAX_LONG_TERM_REF_PICS_SPS as u32)?;
            let num_bits = usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4;
            for i in 0..usize::from(sps.num_long_term_ref_pics_sps) {
                sps.lt_ref_pic_poc_lsb_sps[i] = r.read_bits(num_bits)?;
                sps.used_by_curr_pic_lt_sps_flag[i] = r.read_bit()?;
            }
        }

        sps.temporal_mvp_enabled_flag = r.read_bit()?;
        sps.strong_intra_smoothing_enabled_flag = r.read_bit()?;

        sps.vui_parameters_present_flag = r.read_bit()?;
        if sps.vui_parameters_present_flag {
            Self::parse_vui_parameters(&mut sps, &mut r)?;
        }

        sps.extension_present_flag = r.read_bit()?;
        if sps.extension_present_flag {
            sps.range_extension_flag = r.read_bit()?;
            let multilayer_extension_flag = r.read_bit()?;
            let three_d_extension_flag = r.read_bit()?;
            let scc_extension_flag = r.read_bit()?;
            r.skip_bits(4)?; // sps_extension_4bits

            if sps.range_extension_flag {
                Self::parse_sps_range_extension(&mut sps, &mut r)?;
            }

            if multilayer_extension_flag || three_d_extension_flag || scc_extension_flag {
                log::warn!("Ignoring unsupported SPS extensions");
            }
        }

        // The range extension may change the weighted prediction ranges.
        sps.update_derived();

        let key = sps.seq_parameter_set_id;
        self.active_spses.insert(key, Rc::new(sps));

        if self.active_spses.len() > MAX_SPS_COUNT {
            return Err(anyhow!("Broken data: Number of active SPSs > MAX_SPS_COUNT"));
        }

        self.get_sps(key)
            .ok_or(anyhow!("SPS {} vanished after insertion", key))
    }

    fn parse_pps_range_extension(pps: &mut Pps, sps: &Sps, r: &mut BitReader) -> anyhow::Result<()> {
        let rext = &mut pps.range_extension;

        if pps.transform_skip_enabled_flag {
            rext.log2_max_transform_skip_block_size_minus2 =
                r.read_ue_max(sps.max_tb_log2_size_y.saturating_sub(2))?;
        }

        rext.cross_component_prediction_enabled_flag = r.read_bit()?;
        rext.chroma_qp_offset_list_enabled_flag = r.read_bit()?;
        if rext.chroma_qp_offset_list_enabled_flag {
            rext.diff_cu_chroma_qp_offset_depth = r.read_ue()?;
            rext.chroma_qp_offset_list_len_minus1 = r.read_ue_max(5)?;
            for i in 0..=rext.chroma_qp_offset_list_len_minus1 as usize {
                rext.cb_qp_offset_list[i] = r.read_se_bounded(-12, 12)?;
                rext.cr_qp_offset_list[i] = r.read_se_bounded(-12, 12)?;
            }
        }

        let max = sps.bit_depth_luma().saturating_sub(10);
        rext.log2_sao_offset_scale_luma = r.read_ue_max(max)?;
        let max = sps.bit_depth_chroma().saturating_sub(10);
        rext.log2_sao_offset_scale_chroma = r.read_ue_max(max)?;

        Ok(())
    }

    /// Parse a PPS NALU.
    pub fn parse_pps(&mut self, nalu: &Nalu) -> anyhow::Result<&Rc<Pps>> {
        Self::check_type(nalu, NaluType::PpsNut)?;

        let mut r = BitReader::new(nalu.payload(), true);

        let mut pps = Pps {
            pic_parameter_set_id: r.read_ue_max(MAX_PPS_COUNT as u32 - 1)?,
            seq_parameter_set_id: r.read_ue_max(MAX_SPS_COUNT as u32 - 1)?,
            ..Default::default()
        };

        let sps = self.get_sps(pps.seq_parameter_set_id).context(
            "PPS refers to a missing SPS",
        )?;

        pps.dependent_slice_segments_enabled_flag = r.read_bit()?;
        pps.output_flag_present_flag = r.read_bit()?;
        pps.num_extra_slice_header_bits = r.read_bits(3)?;
        pps.sign_data_hiding_enabled_flag = r.read_bit()?;
        pps.cabac_init_present_flag = r.read_bit()?;

        // 7.4.3.3.1
        pps.num_ref_idx_l0_default_active_minus1 = r.read_ue_max(MAX_REF_IDX_ACTIVE as u32 - 1)?;
        pps.num_ref_idx_l1_default_active_minus1 = r.read_ue_max(MAX_REF_IDX_ACTIVE as u32 - 1)?;

        // (7-5)
        let qp_bd_offset_y = 6 * i32::from(sps.bit_depth_luma_minus8);

        pps.init_qp_minus26 = r.read_se_bounded(-(26 + qp_bd_offset_y), 25)?;
        pps.qp_bd_offset_y = qp_bd_offset_y as u32;
        pps.constrained_intra_pred_flag = r.read_bit()?;
        pps.transform_skip_enabled_flag = r.read_bit()?;
        pps.cu_qp_delta_enabled_flag = r.read_bit()?;

        if pps.cu_qp_delta_enabled_flag {
            pps.diff_cu_qp_delta_depth =
                r.read_ue_max(u32::from(sps.log2_diff_max_min_luma_coding_block_size))?;
        }

        pps.cb_qp_offset = r.read_se_bounded(-12, 12)?;
        pps.cr_qp_offset = r.read_se_bounded(-12, 12)?;

        pps.slice_chroma_qp_offsets_present_flag = r.read_bit()?;
        pps.weighted_pred_flag = r.read_bit()?;
        pps.weighted_bipred_flag = r.read_bit()?;
        pps.transquant_bypass_enabled_flag = r.read_bit()?;
        pps.tiles_enabled_flag = r.read_bit()?;
        pps.entropy_coding_sync_enabled_flag = r.read_bit()?;

        if pps.tiles_enabled_flag {
            let max_cols = std::cmp::min(sps.pic_width_in_ctbs_y, MAX_TILE_COLUMNS as u32);
            let max_rows = std::cmp::min(sps.pic_height_in_ctbs_y, MAX_TILE_ROWS as u32);
            pps.num_tile_columns_minus1 = r.read_ue_max(max_cols - 1)?;
            pps.num_tile_rows_minus1 = r.read_ue_max(max_rows - 1)?;
            pps.uniform_spacing_flag = r.read_bit()?;

            if pps.uniform_spacing_flag {
                pps.update_uniform_tiles(sps);
            } else {
                // The last column and row take whatever is left (6-3, 6-4).
                let num_cols = usize::from(pps.num_tile_columns_minus1);
                let mut remaining = sps.pic_width_in_ctbs_y;
                for i in 0..num_cols {
                    pps.column_width_minus1[i] = r.read_ue_max(remaining.saturating_sub(2))?;
                    remaining = remaining
                        .checked_sub(pps.column_width_minus1[i] + 1)
                        .ok_or(anyhow!("Tile columns exceed the picture width"))?;
                }
                pps.column_width_minus1[num_cols] = remaining
                    .checked_sub(1)
                    .ok_or(anyhow!("Tile columns exceed the picture width"))?;

                let num_rows = usize::from(pps.num_tile_rows_minus1);
                let mut remaining = sps.pic_height_in_ctbs_y;
                for i in 0..num_rows {
                    pps.row_height_minus1[i] = r.read_ue_max(remaining.saturating_sub(2))?;
                    remaining = remaining
                        .checked_sub(pps.row_height_minus1[i] + 1)
                        .ok_or(anyhow!("Tile rows exceed the picture height"))?;
                }
                pps.row_height_minus1[num_rows] = remaining
                    .checked_sub(1)
                    .ok_or(anyhow!("Tile rows exceed the picture height"))?;
            }

            pps.loop_filter_across_tiles_enabled_flag = r.read_bit()?;
        }

        pps.loop_filter_across_slices_enabled_flag = r.read_bit()?;
        pps.deblocking_filter_control_present_flag = r.read_bit()?;

        if pps.deblocking_filter_control_present_flag {
            pps.deblocking_filter_override_enabled_flag = r.read_bit()?;
            pps.deblocking_filter_disabled_flag = r.read_bit()?;
            if !pps.deblocking_filter_disabled_flag {
                pps.beta_offset_div2 = r.read_se_bounded(-6, 6)?;
                pps.tc_offset_div2 = r.read_se_bounded(-6, 6)?;
            }
        }

        pps.scaling_list_data_present_flag = r.read_bit()?;
        if pps.scaling_list_data_present_flag {
            Self::parse_scaling_list_data(&mut pps.scaling_list, &mut r)?;
        } else {
            // Inherit the lists from the SPS.
            pps.scaling_list = sps.scaling_list.clone();
        }

        pps.lists_modification_present_flag = r.read_bit()?;
        pps.log2_parallel_merge_level_minus2 = r.read_ue_max(sps.ctb_log2_size_y - 2)?;
        pps.slice_segment_header_extension_present_flag = r.read_bit()?;

        pps.extension_present_flag = r.read_bit()?;
        if pps.extension_present_flag {
            pps.range_extension_flag = r.read_bit()?;
            let multilayer_extension_flag = r.read_bit()?;
            let three_d_extension_flag = r.read_bit()?;
            let scc_extension_flag = r.read_bit()?;
            r.skip_bits(4)?; // pps_extension_4bits

            if pps.range_extension_flag {
                Self::parse_pps_range_extension(&mut pps, sps, &mut r)?;
            }

            if multilayer_extension_flag || three_d_extension_flag || scc_extension_flag {
                log::warn!("Ignoring unsupported PPS extensions");
            }
        }

        pps.temporal_id = nalu.header.temporal_id();

        let key = pps.pic_parameter_set_id;
        self.active_ppses.insert(key, Rc::new(pps));

        if self.active_ppses.len() > MAX_PPS_COUNT {
            return Err(anyhow!("Broken Data: number of active PPSs > MAX_PPS_COUNT"));
        }

        self.get_pps(key)
            .ok_or(anyhow!("PPS {} vanished after insertion", key))
    }

    fn parse_pred_weight_table(
        hdr: &mut SliceHeader,
        r: &mut BitReader,
        sps: &Sps,
    ) -> anyhow::Result<()> {
        let pwt = &mut hdr.pred_weight_table;

        pwt.luma_log2_weight_denom = r.read_ue_max(7)?;
        if sps.chroma_array_type != 0 {
            let min = -i32::from(pwt.luma_log2_weight_denom);
            pwt.delta_chroma_log2_weight_denom = r.read_se_bounded(min, 7 + min)?;
            pwt.chroma_log2_weight_denom = (i32::from(pwt.luma_log2_weight_denom)
                + i32::from(pwt.delta_chroma_log2_weight_denom))
            .try_into()?;
        }

        let half_y = sps.wp_offset_half_range_y as i32;
        let half_c = sps.wp_offset_half_range_c as i32;

        let num_l0 = usize::from(hdr.num_ref_idx_l0_active_minus1) + 1;
        for i in 0..num_l0 {
            pwt.luma_weight_l0_flag[i] = r.read_bit()?;
        }

        if sps.chroma_array_type != 0 {
            for i in 0..num_l0 {
                pwt.chroma_weight_l0_flag[i] = r.read_bit()?;
            }
        }

        for i in 0..num_l0 {
            if pwt.luma_weight_l0_flag[i] {
                pwt.delta_luma_weight_l0[i] = r.read_se_bounded(-128, 127)?;
                pwt.luma_offset_l0[i] = r.read_se_bounded(-half_y, half_y - 1)?;
            }

            if pwt.chroma_weight_l0_flag[i] {
                for j in 0..2 {
                    pwt.delta_chroma_weight_l0[i][j] = r.read_se_bounded(-128, 127)?;
                    pwt.delta_chroma_offset_l0[i][j] =
                        r.read_se_bounded(-4 * half_c, 4 * half_c - 1)?;
                }
            }
        }

        if hdr.type_.is_b() {
            let num_l1 = usize::from(hdr.num_ref_idx_l1_active_minus1) + 1;
            for i in 0..num_l1 {
                pwt.luma_weight_l1_flag[i] = r.read_bit()?;
            }

            if sps.chroma_array_type != 0 {
                for i in 0..num_l1 {
                    pwt.chroma_weight_l1_flag[i] = r.read_bit()?;
                }
            }

            for i in 0..num_l1 {
                if pwt.luma_weight_l1_flag[i] {
                    pwt.delta_luma_weight_l1[i] = r.read_se_bounded(-128, 127)?;
                    pwt.luma_offset_l1[i] = r.read_se_bounded(-half_y, half_y - 1)?;
                }

                if pwt.chroma_weight_l1_flag[i] {
                    for j in 0..2 {
                        pwt.delta_chroma_weight_l1[i][j] = r.read_se_bounded(-128, 127)?;
                        pwt.delta_chroma_offset_l1[i][j] =
                            r.read_se_bounded(-4 * half_c, 4 * half_c - 1)?;
                    }
                }
            }
        }

        Ok(())
    }

    fn parse_list_entries(
        num_entries: usize,
        num_pic_total_curr: u32,
        r: &mut BitReader,
    ) -> anyhow::Result<Vec<u32>> {
        let num_bits = ceil_log2(num_pic_total_curr);
        (0..num_entries)
            .map(|_| {
                let entry: u32 = r.read_bits(num_bits)?;
                if entry >= num_pic_total_curr {
                    return Err(anyhow!(
                        "Invalid list_entry {}, expected at most NumPicTotalCurr - 1: {}",
                        entry,
                        num_pic_total_curr - 1
                    ));
                }
                Ok(entry)
            })
            .collect()
    }

    fn parse_ref_pic_lists_modification(
        hdr: &mut SliceHeader,
        r: &mut BitReader,
    ) -> anyhow::Result<()> {
        let rplm = &mut hdr.ref_pic_list_modification;

        rplm.ref_pic_list_modification_flag_l0 = r.read_bit()?;
        if rplm.ref_pic_list_modification_flag_l0 {
            rplm.list_entry_l0 = Self::parse_list_entries(
                usize::from(hdr.num_ref_idx_l0_active_minus1) + 1,
                hdr.num_pic_total_curr,
                r,
            )?;
        }

        if hdr.type_.is_b() {
            rplm.ref_pic_list_modification_flag_l1 = r.read_bit()?;
            if rplm.ref_pic_list_modification_flag_l1 {
                rplm.list_entry_l1 = Self::parse_list_entries(
                    usize::from(hdr.num_ref_idx_l1_active_minus1) + 1,
                    hdr.num_pic_total_curr,
                    r,
                )?;
            }
        }

        Ok(())
    }

    /// Values inferred when absent from the slice header.
    fn slice_header_set_defaults(hdr: &mut SliceHeader, sps: &Sps, pps: &Pps) {
        hdr.deblocking_filter_disabled_flag = pps.deblocking_filter_disabled_flag;
        hdr.beta_offset_div2 = pps.beta_offset_div2;
        hdr.tc_offset_div2 = pps.tc_offset_div2;
        hdr.loop_filter_across_slices_enabled_flag = pps.loop_filter_across_slices_enabled_flag;
        hdr.curr_rps_idx = sps.num_short_term_ref_pic_sets;
        hdr.num_ref_idx_l0_active_minus1 = pps.num_ref_idx_l0_default_active_minus1;
        hdr.num_ref_idx_l1_active_minus1 = pps.num_ref_idx_l1_default_active_minus1;
    }

    fn parse_long_term_pics(
        hdr: &mut SliceHeader,
        sps: &Sps,
        r: &mut BitReader,
    ) -> anyhow::Result<()> {
        if sps.num_long_term_ref_pics_sps > 0 {
            hdr.num_long_term_sps = r.read_ue_max(u32::from(sps.num_long_term_ref_pics_sps))?;
        }

        let max = MAX_DPB_SIZE as u32 - u32::from(hdr.num_long_term_sps);
        hdr.num_long_term_pics = r.read_ue_max(max)?;

        let lsb_bits = usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4;
        for i in 0..hdr.num_long_term() {
            if i < usize::from(hdr.num_long_term_sps) {
                if sps.num_long_term_ref_pics_sps > 1 {
                    let num_bits = ceil_log2(u32::from(sps.num_long_term_ref_pics_sps));
                    hdr.lt_idx_sps[i] = r.read_bits(num_bits)?;

                    if hdr.lt_idx_sps[i] >= sps.num_long_term_ref_pics_sps {
                        return Err(anyhow!("Invalid lt_idx_sps[{}] {}", i, hdr.lt_idx_sps[i]));
                    }
                }

                // (7-52): PocLsbLt and UsedByCurrPicLt come from the SPS.
                let idx = usize::from(hdr.lt_idx_sps[i]);
                hdr.poc_lsb_lt[i] = sps.lt_ref_pic_poc_lsb_sps[idx];
                hdr.used_by_curr_pic_lt[i] = sps.used_by_curr_pic_lt_sps_flag[idx];
            } else {
                hdr.poc_lsb_lt[i] = r.read_bits(lsb_bits)?;
                hdr.used_by_curr_pic_lt[i] = r.read_bit()?;
            }

            hdr.delta_poc_msb_present_flag[i] = r.read_bit()?;
            if hdr.delta_poc_msb_present_flag[i] {
                hdr.delta_poc_msb_cycle_lt[i] = r.read_ue_max(1u32 << (32 - lsb_bits))?;
            }
        }

        Ok(())
    }

    /// Parses a slice segment header from a slice NALU.
    pub fn parse_slice_header<'a>(&mut self, nalu: Nalu<'a>) -> anyhow::Result<Slice<'a>> {
        if !nalu.header.type_.is_slice() {
            return Err(anyhow!(
                "{:?} does not carry a slice segment",
                nalu.header.type_
            ));
        }

        let nalu_type = nalu.header.type_;
        let mut r = BitReader::new(nalu.payload(), true);

        let mut hdr = SliceHeader {
            first_slice_segment_in_pic_flag: r.read_bit()?,
            ..Default::default()
        };

        if nalu_type.is_irap() {
            hdr.no_output_of_prior_pics_flag = r.read_bit()?;
        }

        hdr.pic_parameter_set_id = r.read_ue_max(MAX_PPS_COUNT as u32 - 1)?;

        let pps = self.get_pps(hdr.pic_parameter_set_id).context(
            "Slice refers to a missing PPS",
        )?;

        let sps = self.get_sps(pps.seq_parameter_set_id).context(
            "Slice PPS refers to a missing SPS",
        )?;

        Self::slice_header_set_defaults(&mut hdr, sps, pps);

        if !hdr.first_slice_segment_in_pic_flag {
            if pps.dependent_slice_segments_enabled_flag {
                hdr.dependent_slice_segment_flag = r.read_bit()?;
            }

            let num_bits = ceil_log2(sps.pic_size_in_ctbs_y);
            hdr.segment_address = r.read_bits(num_bits)?;

            if hdr.segment_address >= sps.pic_size_in_ctbs_y {
                return Err(anyhow!(
                    "Invalid slice_segment_address {}",
                    hdr.segment_address
                ));
            }
        }

        if hdr.dependent_slice_segment_flag {
            // Everything but the segment address comes from the previous
            // independent slice segment.
            let prev = self
                .last_independent_header
                .as_ref()
                .ok_or(anyhow!("Dependent slice segment without a preceding slice"))?;

            hdr = SliceHeader {
                first_slice_segment_in_pic_flag: false,
                dependent_slice_segment_flag: true,
                segment_address: hdr.segment_address,
                num_entry_point_offsets: 0,
                offset_len_minus1: 0,
                entry_point_offset_minus1: vec![],
                ..prev.clone()
            };
        } else {
            r.skip_bits(usize::from(pps.num_extra_slice_header_bits))?;

            let slice_type: u32 = r.read_ue()?;
            hdr.type_ = SliceType::n(slice_type).ok_or(anyhow!("Invalid slice type"))?;

            if pps.output_flag_present_flag {
                hdr.pic_output_flag = r.read_bit()?;
            }

            if sps.separate_colour_plane_flag {
                hdr.colour_plane_id = r.read_bits(2)?;
            }

            if !nalu_type.is_idr() {
                let num_bits = usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4;
                hdr.pic_order_cnt_lsb = r.read_bits(num_bits)?;

                hdr.short_term_ref_pic_set_sps_flag = r.read_bit()?;

                if !hdr.short_term_ref_pic_set_sps_flag {
                    Self::parse_short_term_ref_pic_set(
                        sps,
                        &sps.short_term_ref_pic_set,
                        &mut hdr.short_term_ref_pic_set,
                        &mut r,
                        sps.num_short_term_ref_pic_sets,
                    )?;
                } else {
                    if sps.num_short_term_ref_pic_sets == 0 {
                        return Err(anyhow!("Slice selects an RPS but the SPS has none"));
                    }

                    if sps.num_short_term_ref_pic_sets > 1 {
                        let num_bits = ceil_log2(u32::from(sps.num_short_term_ref_pic_sets));
                        hdr.short_term_ref_pic_set_idx = r.read_bits(num_bits)?;

                        if hdr.short_term_ref_pic_set_idx >= sps.num_short_term_ref_pic_sets {
                            return Err(anyhow!(
                                "Invalid short_term_ref_pic_set_idx {}",
                                hdr.short_term_ref_pic_set_idx
                            ));
                        }
                    }

                    hdr.curr_rps_idx = hdr.short_term_ref_pic_set_idx;
                }

                if sps.long_term_ref_pics_present_flag {
                    Self::parse_long_term_pics(&mut hdr, sps, &mut r)?;
                }

                if sps.temporal_mvp_enabled_flag {
                    hdr.temporal_mvp_enabled_flag = r.read_bit()?;
                }
            }

            if sps.sample_adaptive_offset_enabled_flag {
                hdr.sao_luma_flag = r.read_bit()?;
                if sps.chroma_array_type != 0 {
                    hdr.sao_chroma_flag = r.read_bit()?;
                }
            }

            if hdr.type_.is_p() || hdr.type_.is_b() {
                hdr.num_ref_idx_active_override_flag = r.read_bit()?;
                if hdr.num_ref_idx_active_override_flag {
                    hdr.num_ref_idx_l0_active_minus1 =
                        r.read_ue_max(MAX_REF_IDX_ACTIVE as u32 - 1)?;
                    if hdr.type_.is_b() {
                        hdr.num_ref_idx_l1_active_minus1 =
                            r.read_ue_max(MAX_REF_IDX_ACTIVE as u32 - 1)?;
                    }
                }

                // (7-55)
                let st_rps = hdr.st_rps(sps).ok_or(anyhow!("Invalid RPS index"))?;
                let num_lt_used = hdr.used_by_curr_pic_lt[..hdr.num_long_term()]
                    .iter()
                    .filter(|used| **used)
                    .count();
                hdr.num_pic_total_curr = (st_rps.num_used_by_curr() + num_lt_used) as u32;

                if pps.lists_modification_present_flag && hdr.num_pic_total_curr > 1 {
                    Self::parse_ref_pic_lists_modification(&mut hdr, &mut r)?;
                }

                if hdr.type_.is_b() {
                    hdr.mvd_l1_zero_flag = r.read_bit()?;
                }

                if pps.cabac_init_present_flag {
                    hdr.cabac_init_flag = r.read_bit()?;
                }

                if hdr.temporal_mvp_enabled_flag {
                    if hdr.type_.is_b() {
                        hdr.collocated_from_l0_flag = r.read_bit()?;
                    }

                    let max = if hdr.collocated_from_l0_flag {
                        hdr.num_ref_idx_l0_active_minus1
                    } else {
                        hdr.num_ref_idx_l1_active_minus1
                    };

                    if max > 0 {
                        hdr.collocated_ref_idx = r.read_ue_max(u32::from(max))?;
                    }
                }

                if (pps.weighted_pred_flag && hdr.type_.is_p())
                    || (pps.weighted_bipred_flag && hdr.type_.is_b())
                {
                    Self::parse_pred_weight_table(&mut hdr, &mut r, sps)?;
                }

                hdr.five_minus_max_num_merge_cand = r.read_ue_max(4)?;
            }

            hdr.qp_delta = r.read_se_bounded(-87, 77)?;

            let slice_qp_y = 26 + i32::from(pps.init_qp_minus26) + i32::from(hdr.qp_delta);
            if slice_qp_y < -(pps.qp_bd_offset_y as i32) || slice_qp_y > 51 {
                return Err(anyhow!("Invalid slice_qp_delta: {}", hdr.qp_delta));
            }

            if pps.slice_chroma_qp_offsets_present_flag {
                hdr.cb_qp_offset = r.read_se_bounded(-12, 12)?;

                let qp_offset = pps.cb_qp_offset + hdr.cb_qp_offset;
                if !(-12..=12).contains(&qp_offset) {
                    return Err(anyhow!(
                        "Invalid value for slice_cb_qp_offset: {}",
                        hdr.cb_qp_offset
                    ));
                }

                hdr.cr_qp_offset = r.read_se_bounded(-12, 12)?;

                let qp_offset = pps.cr_qp_offset + hdr.cr_qp_offset;
                if !(-12..=12).contains(&qp_offset) {
                    return Err(anyhow!(
                        "Invalid value for slice_cr_qp_offset: {}",
                        hdr.cr_qp_offset
                    ));
                }
            }

            if pps.range_extension.chroma_qp_offset_list_enabled_flag {
                hdr.cu_chroma_qp_offset_enabled_flag = r.read_bit()?;
            }

            if pps.deblocking_filter_override_enabled_flag {
                hdr.deblocking_filter_override_flag = r.read_bit()?;
            }

            if hdr.deblocking_filter_override_flag {
                hdr.deblocking_filter_disabled_flag = r.read_bit()?;
                if !hdr.deblocking_filter_disabled_flag {
                    hdr.beta_offset_div2 = r.read_se_bounded(-6, 6)?;
                    hdr.tc_offset_div2 = r.read_se_bounded(-6, 6)?;
                }
            }

            if pps.loop_filter_across_slices_enabled_flag
                && (hdr.sao_luma_flag
                    || hdr.sao_chroma_flag
                    || !hdr.deblocking_filter_disabled_flag)
            {
                hdr.loop_filter_across_slices_enabled_flag = r.read_bit()?;
            }
        }

        if pps.tiles_enabled_flag || pps.entropy_coding_sync_enabled_flag {
            let max = if !pps.tiles_enabled_flag {
                sps.pic_height_in_ctbs_y - 1
            } else if !pps.entropy_coding_sync_enabled_flag {
                (u32::from(pps.num_tile_columns_minus1) + 1)
                    * (u32::from(pps.num_tile_rows_minus1) + 1)
                    - 1
            } else {
                (u32::from(pps.num_tile_columns_minus1) + 1) * sps.pic_height_in_ctbs_y - 1
            };

            hdr.num_entry_point_offsets = r.read_ue_max(max)?;
            if hdr.num_entry_point_offsets > 0 {
                hdr.offset_len_minus1 = r.read_ue_max(31)?;
                let num_bits = usize::from(hdr.offset_len_minus1) + 1;
                for _ in 0..hdr.num_entry_point_offsets {
                    let offset = if num_bits == 32 {
                        Self::read_u32(&mut r)?
                    } else {
                        r.read_bits(num_bits)?
                    };
                    hdr.entry_point_offset_minus1.push(offset);
                }
            }
        }

        if pps.slice_segment_header_extension_present_flag {
            let segment_header_extension_length: usize = r.read_ue_max(256)?;
            // slice_segment_header_extension_data_byte[i]
            r.skip_bits(segment_header_extension_length * 8)?;
        }

        // byte_alignment()
        if !r.read_bit()? {
            return Err(anyhow!("Missing alignment_bit_equal_to_one"));
        }
        while !r.is_aligned() {
            r.skip_bits(1)?;
        }

        hdr.header_bit_size = r.position() as u32;
        hdr.n_emulation_prevention_bytes = r.num_epb() as u32;

        if !hdr.dependent_slice_segment_flag {
            self.last_independent_header = Some(hdr.clone());
        }

        Ok(Slice { header: hdr, nalu })
    }

    /// The last VPS parsed with `vps_id`.
    pub fn get_vps(&self, vps_id: u8) -> Option<&Rc<Vps>> {
        self.active_vpses.get(&vps_id)
    }

    pub fn get_sps(&self, sps_id: u8) -> Option<&Rc<Sps>> {
        self.active_spses.get(&sps_id)
    }

    pub fn get_pps(&self, pps_id: u8) -> Option<&Rc<Pps>> {
        self.active_ppses.get(&pps_id)
    }
}
