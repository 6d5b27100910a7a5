// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Writes H.265 parameter sets and slice segment headers as Annex B NAL units.

use std::io::Write;

use thiserror::Error;

use crate::codec::h265::nalu_writer::NaluWriter;
use crate::codec::h265::nalu_writer::NaluWriterError;
use crate::codec::h265::parser::ceil_log2;
use crate::codec::h265::parser::HrdParams;
use crate::codec::h265::parser::NaluType;
use crate::codec::h265::parser::Pps;
use crate::codec::h265::parser::ProfileInfo;
use crate::codec::h265::parser::ProfileTierLevel;
use crate::codec::h265::parser::ScalingLists;
use crate::codec::h265::parser::ShortTermRefPicSet;
use crate::codec::h265::parser::SliceHeader;
use crate::codec::h265::parser::Sps;
use crate::codec::h265::parser::SublayerHrdParameters;
use crate::codec::h265::parser::Vps;

mod private {
    pub trait NaluStruct {}
}

impl private::NaluStruct for Vps {}

impl private::NaluStruct for Sps {}

impl private::NaluStruct for Pps {}

impl private::NaluStruct for SliceHeader {}

impl private::NaluStruct for ProfileInfo {}

#[derive(Error, Debug)]
pub enum SynthesizerError {
    #[error("tried to synthesize unsupported settings")]
    Unsupported,
    #[error(transparent)]
    NaluWriter(#[from] NaluWriterError),
}

impl SynthesizerError {
    /// Whether the output buffer ran out of space.
    pub fn is_overflow(&self) -> bool {
        matches!(self, SynthesizerError::NaluWriter(e) if e.is_overflow())
    }
}

pub type SynthesizerResult<T> = Result<T, SynthesizerError>;

/// A helper to output typed NALUs to [`std::io::Write`] using [`NaluWriter`].
pub struct Synthesizer<'n, N: private::NaluStruct, W: Write> {
    writer: NaluWriter<W>,
    nalu: &'n N,
}

/// Extended Sample Aspect Ratio - H.265 Table E-1
const EXTENDED_SAR: u8 = 255;

impl<N: private::NaluStruct, W: Write> Synthesizer<'_, N, W> {
    fn u<T: Into<u32>>(&mut self, bits: usize, value: T) -> SynthesizerResult<()> {
        self.writer.write_u(bits, value)?;
        Ok(())
    }

    fn f<T: Into<u32>>(&mut self, bits: usize, value: T) -> SynthesizerResult<()> {
        self.writer.write_f(bits, value)?;
        Ok(())
    }

    fn ue<T: Into<u32>>(&mut self, value: T) -> SynthesizerResult<()> {
        self.writer.write_ue(value)?;
        Ok(())
    }

    fn se<T: Into<i32>>(&mut self, value: T) -> SynthesizerResult<()> {
        self.writer.write_se(value)?;
        Ok(())
    }

    /// Writes `bits` zero bits, e.g. reserved fields wider than 32 bits.
    fn zeros(&mut self, mut bits: usize) -> SynthesizerResult<()> {
        while bits > 0 {
            let n = std::cmp::min(bits, 32);
            self.f(n, 0u32)?;
            bits -= n;
        }

        Ok(())
    }

    fn rbsp_trailing_bits(&mut self) -> SynthesizerResult<()> {
        self.writer.rbsp_trailing_bits()?;
        Ok(())
    }

    fn profile_info(&mut self, info: &ProfileInfo) -> SynthesizerResult<()> {
        self.u(2, info.profile_space)?;
        self.u(1, info.tier_flag)?;
        self.u(5, info.profile_idc)?;

        for flag in info.profile_compatibility_flag {
            self.u(1, flag)?;
        }

        self.u(1, info.progressive_source_flag)?;
        self.u(1, info.interlaced_source_flag)?;
        self.u(1, info.non_packed_constraint_flag)?;
        self.u(1, info.frame_only_constraint_flag)?;

        if info.has_extension_constraint_flags() {
            self.u(1, info.max_12bit_constraint_flag)?;
            self.u(1, info.max_10bit_constraint_flag)?;
            self.u(1, info.max_8bit_constraint_flag)?;
            self.u(1, info.max_422chroma_constraint_flag)?;
            self.u(1, info.max_420chroma_constraint_flag)?;
            self.u(1, info.max_monochrome_constraint_flag)?;
            self.u(1, info.intra_constraint_flag)?;
            self.u(1, info.one_picture_only_constraint_flag)?;
            self.u(1, info.lower_bit_rate_constraint_flag)?;
            if info.has_max_14bit_flag() {
                self.u(1, info.max_14bit_constraint_flag)?;
                self.zeros(33)?;
            } else {
                self.zeros(34)?;
            }
        } else if info.conforms_to(2) {
            self.zeros(7)?;
            self.u(1, info.one_picture_only_constraint_flag)?;
            self.zeros(35)?;
        } else {
            self.zeros(43)?;
        }

        if info.has_inbld_flag() {
            self.u(1, info.inbld_flag)?;
        } else {
            self.zeros(1)?;
        }

        Ok(())
    }

    fn profile_tier_level(
        &mut self,
        ptl: &ProfileTierLevel,
        profile_present_flag: bool,
        max_sub_layers_minus1: u8,
    ) -> SynthesizerResult<()> {
        // H.265 7.3.3
        if profile_present_flag {
            self.profile_info(&ptl.general)?;
        }

        self.u(8, ptl.general_level_idc)?;

        let num_sub_layers = usize::from(max_sub_layers_minus1);
        for i in 0..num_sub_layers {
            self.u(1, ptl.sub_layer_profile_present_flag[i])?;
            self.u(1, ptl.sub_layer_level_present_flag[i])?;
        }

        if num_sub_layers > 0 {
            for _ in num_sub_layers..8 {
                self.u(2, 0u32)?;
            }
        }

        for i in 0..num_sub_layers {
            if ptl.sub_layer_profile_present_flag[i] {
                self.profile_info(&ptl.sub_layer[i])?;
            }

            if ptl.sub_layer_level_present_flag[i] {
                self.u(8, ptl.sub_layer_level_idc[i])?;
            }
        }

        Ok(())
    }

    fn sub_layer_hrd_parameters(
        &mut self,
        hrd: &SublayerHrdParameters,
        cpb_cnt: u32,
        sub_pic_hrd_params_present_flag: bool,
    ) -> SynthesizerResult<()> {
        // H.265 E.2.3
        for i in 0..cpb_cnt as usize {
            self.ue(hrd.bit_rate_value_minus1[i])?;
            self.ue(hrd.cpb_size_value_minus1[i])?;
            if sub_pic_hrd_params_present_flag {
                self.ue(hrd.cpb_size_du_value_minus1[i])?;
                self.ue(hrd.bit_rate_du_value_minus1[i])?;
            }

            self.u(1, hrd.cbr_flag[i])?;
        }

        Ok(())
    }

    fn hrd_parameters(
        &mut self,
        common_inf_present_flag: bool,
        max_sub_layers_minus1: u8,
        hrd: &HrdParams,
    ) -> SynthesizerResult<()> {
        // H.265 E.2.2
        if common_inf_present_flag {
            self.u(1, hrd.nal_hrd_parameters_present_flag)?;
            self.u(1, hrd.vcl_hrd_parameters_present_flag)?;
            if hrd.nal_hrd_parameters_present_flag || hrd.vcl_hrd_parameters_present_flag {
                self.u(1, hrd.sub_pic_hrd_params_present_flag)?;
                if hrd.sub_pic_hrd_params_present_flag {
                    self.u(8, hrd.tick_divisor_minus2)?;
                    self.u(5, hrd.du_cpb_removal_delay_increment_length_minus1)?;
                    self.u(1, hrd.sub_pic_cpb_params_in_pic_timing_sei_flag)?;
                    self.u(5, hrd.dpb_output_delay_du_length_minus1)?;
                }

                self.u(4, hrd.bit_rate_scale)?;
                self.u(4, hrd.cpb_size_scale)?;
                if hrd.sub_pic_hrd_params_present_flag {
                    self.u(4, hrd.cpb_size_du_scale)?;
                }

                self.u(5, hrd.initial_cpb_removal_delay_length_minus1)?;
                self.u(5, hrd.au_cpb_removal_delay_length_minus1)?;
                self.u(5, hrd.dpb_output_delay_length_minus1)?;
            }
        }

        for i in 0..=usize::from(max_sub_layers_minus1) {
            self.u(1, hrd.fixed_pic_rate_general_flag[i])?;
            if !hrd.fixed_pic_rate_general_flag[i] {
                self.u(1, hrd.fixed_pic_rate_within_cvs_flag[i])?;
            }

            // Inferred to be 1 when fixed_pic_rate_general_flag is set.
            let within_cvs =
                hrd.fixed_pic_rate_general_flag[i] || hrd.fixed_pic_rate_within_cvs_flag[i];
            if within_cvs {
                self.ue(hrd.elemental_duration_in_tc_minus1[i])?;
            } else {
                self.u(1, hrd.low_delay_hrd_flag[i])?;
            }

            if !hrd.low_delay_hrd_flag[i] {
                self.ue(hrd.cpb_cnt_minus1[i])?;
            }

            if hrd.nal_hrd_parameters_present_flag {
                self.sub_layer_hrd_parameters(
                    &hrd.nal_hrd[i],
                    hrd.cpb_cnt_minus1[i] + 1,
                    hrd.sub_pic_hrd_params_present_flag,
                )?;
            }

            if hrd.vcl_hrd_parameters_present_flag {
                self.sub_layer_hrd_parameters(
                    &hrd.vcl_hrd[i],
                    hrd.cpb_cnt_minus1[i] + 1,
                    hrd.sub_pic_hrd_params_present_flag,
                )?;
            }
        }

        Ok(())
    }

    fn scaling_list_data(&mut self, sl: &ScalingLists) -> SynthesizerResult<()> {
        // H.265 7.3.4
        let defaults = ScalingLists::default();

        for size_id in 0..4 {
            let step = if size_id == 3 { 3 } else { 1 };
            for matrix_id in (0..6).step_by(step) {
                let (list, default, dc): (&[u8], &[u8], Option<i16>) = match size_id {
                    0 => (
                        &sl.scaling_list_4x4[matrix_id],
                        &defaults.scaling_list_4x4[matrix_id],
                        None,
                    ),
                    1 => (
                        &sl.scaling_list_8x8[matrix_id],
                        &defaults.scaling_list_8x8[matrix_id],
                        None,
                    ),
                    2 => (
                        &sl.scaling_list_16x16[matrix_id],
                        &defaults.scaling_list_16x16[matrix_id],
                        Some(sl.scaling_list_dc_coef_minus8_16x16[matrix_id]),
                    ),
                    _ => (
                        &sl.scaling_list_32x32[matrix_id],
                        &defaults.scaling_list_32x32[matrix_id],
                        Some(sl.scaling_list_dc_coef_minus8_32x32[matrix_id]),
                    ),
                };

                if list == default && dc.map_or(true, |dc| dc == 8) {
                    // scaling_list_pred_mode_flag = 0, scaling_list_pred_matrix_id_delta = 0
                    self.u(1, false)?;
                    self.ue(0u32)?;
                    continue;
                }

                self.u(1, true)?;

                let mut next_coef = 8i32;
                if let Some(dc) = dc {
                    self.se(dc)?;
                    next_coef = i32::from(dc) + 8;
                }

                for coef in list {
                    let mut delta = i32::from(*coef) - next_coef;
                    // Keep the delta in -128..=127, the decoder wraps modulo 256.
                    if delta > 127 {
                        delta -= 256;
                    } else if delta < -128 {
                        delta += 256;
                    }

                    self.se(delta)?;
                    next_coef = i32::from(*coef);
                }
            }
        }

        Ok(())
    }

    /// Writes st_ref_pic_set(`st_rps_idx`). Only explicitly coded sets are
    /// supported.
    fn st_ref_pic_set(
        &mut self,
        st: &ShortTermRefPicSet,
        st_rps_idx: u8,
    ) -> SynthesizerResult<()> {
        // H.265 7.3.7
        if st_rps_idx != 0 {
            self.u(1, st.inter_ref_pic_set_prediction_flag)?;
        }

        if st.inter_ref_pic_set_prediction_flag {
            return Err(SynthesizerError::Unsupported);
        }

        self.ue(st.num_negative_pics)?;
        self.ue(st.num_positive_pics)?;

        let mut prev = 0;
        for i in 0..usize::from(st.num_negative_pics) {
            let delta_poc_s0_minus1 = prev - st.delta_poc_s0[i] - 1;
            if delta_poc_s0_minus1 < 0 {
                return Err(SynthesizerError::Unsupported);
            }

            self.ue(delta_poc_s0_minus1 as u32)?;
            self.u(1, st.used_by_curr_pic_s0[i])?;
            prev = st.delta_poc_s0[i];
        }

        let mut prev = 0;
        for i in 0..usize::from(st.num_positive_pics) {
            let delta_poc_s1_minus1 = st.delta_poc_s1[i] - prev - 1;
            if delta_poc_s1_minus1 < 0 {
                return Err(SynthesizerError::Unsupported);
            }

            self.ue(delta_poc_s1_minus1 as u32)?;
            self.u(1, st.used_by_curr_pic_s1[i])?;
            prev = st.delta_poc_s1[i];
        }

        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, ProfileInfo, W> {
    /// Writes the 88 bits of general profile information, e.g. for a
    /// decoder configuration record. No NAL header, no emulation prevention.
    pub fn synthesize(info: &'n ProfileInfo, writer: W) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, false),
            nalu: info,
        };

        s.profile_info(s.nalu)
    }
}

impl<'n, W: Write> Synthesizer<'n, Vps, W> {
    pub fn synthesize(vps: &'n Vps, writer: W, ep_enabled: bool) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: vps,
        };

        s.writer.write_header(NaluType::VpsNut)?;
        s.video_parameter_set_rbsp()?;
        s.rbsp_trailing_bits()
    }

    fn video_parameter_set_rbsp(&mut self) -> SynthesizerResult<()> {
        // H.265 7.3.2.1
        let vps = self.nalu;

        self.u(4, vps.video_parameter_set_id)?;
        self.u(1, vps.base_layer_internal_flag)?;
        self.u(1, vps.base_layer_available_flag)?;
        self.u(6, vps.max_layers_minus1)?;
        self.u(3, vps.max_sub_layers_minus1)?;
        self.u(1, vps.temporal_id_nesting_flag)?;
        self.u(16, 0xffffu32)?;

        self.profile_tier_level(&vps.profile_tier_level, true, vps.max_sub_layers_minus1)?;

        self.u(1, vps.sub_layer_ordering_info_present_flag)?;
        let max_sub_layers = usize::from(vps.max_sub_layers_minus1);
        let start = if vps.sub_layer_ordering_info_present_flag {
            0
        } else {
            max_sub_layers
        };

        for i in start..=max_sub_layers {
            self.ue(vps.max_dec_pic_buffering_minus1[i])?;
            self.ue(vps.max_num_reorder_pics[i])?;
            self.ue(vps.max_latency_increase_plus1[i])?;
        }

        self.u(6, vps.max_layer_id)?;
        self.ue(vps.num_layer_sets_minus1)?;
        for _ in 1..=vps.num_layer_sets_minus1 {
            // layer_id_included_flag: only the base layer.
            self.u(1, true)?;
            self.zeros(usize::from(vps.max_layer_id))?;
        }

        self.u(1, vps.timing_info_present_flag)?;
        if vps.timing_info_present_flag {
            self.u(32, vps.num_units_in_tick)?;
            self.u(32, vps.time_scale)?;
            self.u(1, vps.poc_proportional_to_timing_flag)?;
            if vps.poc_proportional_to_timing_flag {
                self.ue(vps.num_ticks_poc_diff_one_minus1)?;
            }

            self.ue(vps.num_hrd_parameters)?;
            for i in 0..vps.num_hrd_parameters as usize {
                let layer_set_idx = vps.hrd_layer_set_idx.get(i).copied().unwrap_or(0);
                self.ue(layer_set_idx)?;

                let cprms_present_flag = vps.cprms_present_flag.get(i).copied().unwrap_or(true);
                if i > 0 {
                    self.u(1, cprms_present_flag)?;
                }

                let hrd = vps
                    .hrd_parameters
                    .get(i)
                    .ok_or(SynthesizerError::Unsupported)?;
                self.hrd_parameters(cprms_present_flag, vps.max_sub_layers_minus1, hrd)?;
            }
        }

        // vps_extension_flag
        self.u(1, false)
    }
}

impl<'n, W: Write> Synthesizer<'n, Sps, W> {
    pub fn synthesize(sps: &'n Sps, writer: W, ep_enabled: bool) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: sps,
        };

        s.writer.write_header(NaluType::SpsNut)?;
        s.seq_parameter_set_rbsp()?;
        s.rbsp_trailing_bits()
    }

    fn vui_parameters(&mut self) -> SynthesizerResult<()> {
        // H.265 E.2.1
        let sps = self.nalu;
        let vui = &sps.vui_parameters;

        self.u(1, vui.aspect_ratio_info_present_flag)?;
        if vui.aspect_ratio_info_present_flag {
            self.u(8, vui.aspect_ratio_idc)?;
            if vui.aspect_ratio_idc == EXTENDED_SAR {
                self.u(16, vui.sar_width)?;
                self.u(16, vui.sar_height)?;
            }
        }

        self.u(1, vui.overscan_info_present_flag)?;
        if vui.overscan_info_present_flag {
            self.u(1, vui.overscan_appropriate_flag)?;
        }

        self.u(1, vui.video_signal_type_present_flag)?;
        if vui.video_signal_type_present_flag {
            self.u(3, vui.video_format)?;
            self.u(1, vui.video_full_range_flag)?;
            self.u(1, vui.colour_description_present_flag)?;
            if vui.colour_description_present_flag {
                self.u(8, vui.colour_primaries)?;
                self.u(8, vui.transfer_characteristics)?;
                self.u(8, vui.matrix_coeffs)?;
            }
        }

        self.u(1, vui.chroma_loc_info_present_flag)?;
        if vui.chroma_loc_info_present_flag {
            self.ue(vui.chroma_sample_loc_type_top_field)?;
            self.ue(vui.chroma_sample_loc_type_bottom_field)?;
        }

        self.u(1, vui.neutral_chroma_indication_flag)?;
        self.u(1, vui.field_seq_flag)?;
        self.u(1, vui.frame_field_info_present_flag)?;

        self.u(1, vui.default_display_window_flag)?;
        if vui.default_display_window_flag {
            self.ue(vui.def_disp_win_left_offset)?;
            self.ue(vui.def_disp_win_right_offset)?;
            self.ue(vui.def_disp_win_top_offset)?;
            self.ue(vui.def_disp_win_bottom_offset)?;
        }

        self.u(1, vui.timing_info_present_flag)?;
        if vui.timing_info_present_flag {
            self.u(32, vui.num_units_in_tick)?;
            self.u(32, vui.time_scale)?;
            self.u(1, vui.poc_proportional_to_timing_flag)?;
            if vui.poc_proportional_to_timing_flag {
                self.ue(vui.num_ticks_poc_diff_one_minus1)?;
            }

            self.u(1, vui.hrd_parameters_present_flag)?;
            if vui.hrd_parameters_present_flag {
                self.hrd_parameters(true, sps.max_sub_layers_minus1, &vui.hrd)?;
            }
        }

        self.u(1, vui.bitstream_restriction_flag)?;
        if vui.bitstream_restriction_flag {
            self.u(1, vui.tiles_fixed_structure_flag)?;
            self.u(1, vui.motion_vectors_over_pic_boundaries_flag)?;
            self.u(1, vui.restricted_ref_pic_lists_flag)?;
            self.ue(vui.min_spatial_segmentation_idc)?;
            self.ue(vui.max_bytes_per_pic_denom)?;
            self.ue(vui.max_bits_per_min_cu_denom)?;
            self.ue(vui.log2_max_mv_length_horizontal)?;
            self.ue(vui.log2_max_mv_length_vertical)?;
        }

        Ok(())
    }

    fn seq_parameter_set_rbsp(&mut self) -> SynthesizerResult<()> {
        // H.265 7.3.2.2.1
        let sps = self.nalu;

        self.u(4, sps.video_parameter_set_id)?;
        self.u(3, sps.max_sub_layers_minus1)?;
        self.u(1, sps.temporal_id_nesting_flag)?;

        self.profile_tier_level(&sps.profile_tier_level, true, sps.max_sub_layers_minus1)?;

        self.ue(sps.seq_parameter_set_id)?;
        self.ue(sps.chroma_format_idc)?;
        if sps.chroma_format_idc == 3 {
            self.u(1, sps.separate_colour_plane_flag)?;
        }

        self.ue(sps.pic_width_in_luma_samples)?;
        self.ue(sps.pic_height_in_luma_samples)?;

        self.u(1, sps.conformance_window_flag)?;
        if sps.conformance_window_flag {
            self.ue(sps.conf_win_left_offset)?;
            self.ue(sps.conf_win_right_offset)?;
            self.ue(sps.conf_win_top_offset)?;
            self.ue(sps.conf_win_bottom_offset)?;
        }

        self.ue(sps.bit_depth_luma_minus8)?;
        self.ue(sps.bit_depth_chroma_minus8)?;
        self.ue(sps.log2_max_pic_order_cnt_lsb_minus4)?;

        self.u(1, sps.sub_layer_ordering_info_present_flag)?;
        let max_sub_layers = usize::from(sps.max_sub_layers_minus1);
        let start = if sps.sub_layer_ordering_info_present_flag {
            0
        } else {
            max_sub_layers
        };

        for i in start..=max_sub_layers {
            self.ue(sps.max_dec_pic_buffering_minus1[i])?;
            self.ue(sps.max_num_reorder_pics[i])?;
            self.ue(sps.max_latency_increase_plus1[i])?;
        }

        self.ue(sps.log2_min_luma_coding_block_size_minus3)?;
        self.ue(sps.log2_diff_max_min_luma_coding_block_size)?;
        self.ue(sps.log2_min_luma_transform_block_size_minus2)?;
        self.ue(sps.log2_diff_max_min_luma_transform_block_size)?;
        self.ue(sps.max_transform_hierarchy_depth_inter)?;
        self.ue(sps.max_transform_hierarchy_depth_intra)?;

        self.u(1, sps.scaling_list_enabled_flag)?;
        if sps.scaling_list_enabled_flag {
            self.u(1, sps.scaling_list_data_present_flag)?;
            if sps.scaling_list_data_present_flag {
                self.scaling_list_data(&sps.scaling_list)?;
            }
        }

        self.u(1, sps.amp_enabled_flag)?;
        self.u(1, sps.sample_adaptive_offset_enabled_flag)?;

        self.u(1, sps.pcm_enabled_flag)?;
        if sps.pcm_enabled_flag {
            self.u(4, sps.pcm_sample_bit_depth_luma_minus1)?;
            self.u(4, sps.pcm_sample_bit_depth_chroma_minus1)?;
            self.ue(sps.log2_min_pcm_luma_coding_block_size_minus3)?;
            self.ue(sps.log2_diff_max_min_pcm_luma_coding_block_size)?;
            self.u(1, sps.pcm_loop_filter_disabled_flag)?;
        }

        self.ue(sps.num_short_term_ref_pic_sets)?;
        for (i, st) in sps
            .short_term_ref_pic_set
            .iter()
            .take(usize::from(sps.num_short_term_ref_pic_sets))
            .enumerate()
        {
            self.st_ref_pic_set(st, i as u8)?;
        }

        self.u(1, sps.long_term_ref_pics_present_flag)?;
        if sps.long_term_ref_pics_present_flag {
            self.ue(sps.num_long_term_ref_pics_sps)?;
            let num_bits = usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4;
            for i in 0..usize::from(sps.num_long_term_ref_pics_sps) {
                self.u(num_bits, sps.lt_ref_pic_poc_lsb_sps[i])?;
                self.u(1, sps.used_by_curr_pic_lt_sps_flag[i])?;
            }
        }

        self.u(1, sps.temporal_mvp_enabled_flag)?;
        self.u(1, sps.strong_intra_smoothing_enabled_flag)?;

        self.u(1, sps.vui_parameters_present_flag)?;
        if sps.vui_parameters_present_flag {
            self.vui_parameters()?;
        }

        self.u(1, sps.extension_present_flag)?;
        if sps.extension_present_flag {
            self.u(1, sps.range_extension_flag)?;
            // multilayer, 3d, scc and sps_extension_4bits
            self.u(7, 0u32)?;

            if sps.range_extension_flag {
                let ext = &sps.range_extension;
                self.u(1, ext.transform_skip_rotation_enabled_flag)?;
                self.u(1, ext.transform_skip_context_enabled_flag)?;
                self.u(1, ext.implicit_rdpcm_enabled_flag)?;
                self.u(1, ext.explicit_rdpcm_enabled_flag)?;
                self.u(1, ext.extended_precision_processing_flag)?;
                self.u(1, ext.intra_smoothing_disabled_flag)?;
                self.u(1, ext.high_precision_offsets_enabled_flag)?;
                self.u(1, ext.persistent_rice_adaptation_enabled_flag)?;
                self.u(1, ext.cabac_bypass_alignment_enabled_flag)?;
            }
        }

        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, Pps, W> {
    pub fn synthesize(pps: &'n Pps, writer: W, ep_enabled: bool) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: pps,
        };

        s.writer.write_header(NaluType::PpsNut)?;
        s.pic_parameter_set_rbsp()?;
        s.rbsp_trailing_bits()
    }

    fn pic_parameter_set_rbsp(&mut self) -> SynthesizerResult<()> {
        // H.265 7.3.2.3.1
        let pps = self.nalu;

        self.ue(pps.pic_parameter_set_id)?;
        self.ue(pps.seq_parameter_set_id)?;
        self.u(1, pps.dependent_slice_segments_enabled_flag)?;
        self.u(1, pps.output_flag_present_flag)?;
        self.u(3, pps.num_extra_slice_header_bits)?;
        self.u(1, pps.sign_data_hiding_enabled_flag)?;
        self.u(1, pps.cabac_init_present_flag)?;
        self.ue(pps.num_ref_idx_l0_default_active_minus1)?;
        self.ue(pps.num_ref_idx_l1_default_active_minus1)?;
        self.se(pps.init_qp_minus26)?;
        self.u(1, pps.constrained_intra_pred_flag)?;
        self.u(1, pps.transform_skip_enabled_flag)?;

        self.u(1, pps.cu_qp_delta_enabled_flag)?;
        if pps.cu_qp_delta_enabled_flag {
            self.ue(pps.diff_cu_qp_delta_depth)?;
        }

        self.se(pps.cb_qp_offset)?;
        self.se(pps.cr_qp_offset)?;
        self.u(1, pps.slice_chroma_qp_offsets_present_flag)?;
        self.u(1, pps.weighted_pred_flag)?;
        self.u(1, pps.weighted_bipred_flag)?;
        self.u(1, pps.transquant_bypass_enabled_flag)?;
        self.u(1, pps.tiles_enabled_flag)?;
        self.u(1, pps.entropy_coding_sync_enabled_flag)?;

        if pps.tiles_enabled_flag {
            self.ue(pps.num_tile_columns_minus1)?;
            self.ue(pps.num_tile_rows_minus1)?;
            self.u(1, pps.uniform_spacing_flag)?;
            if !pps.uniform_spacing_flag {
                for i in 0..usize::from(pps.num_tile_columns_minus1) {
                    self.ue(pps.column_width_minus1[i])?;
                }

                for i in 0..usize::from(pps.num_tile_rows_minus1) {
                    self.ue(pps.row_height_minus1[i])?;
                }
            }

            self.u(1, pps.loop_filter_across_tiles_enabled_flag)?;
        }

        self.u(1, pps.loop_filter_across_slices_enabled_flag)?;

        self.u(1, pps.deblocking_filter_control_present_flag)?;
        if pps.deblocking_filter_control_present_flag {
            self.u(1, pps.deblocking_filter_override_enabled_flag)?;
            self.u(1, pps.deblocking_filter_disabled_flag)?;
            if !pps.deblocking_filter_disabled_flag {
                self.se(pps.beta_offset_div2)?;
                self.se(pps.tc_offset_div2)?;
            }
        }

        self.u(1, pps.scaling_list_data_present_flag)?;
        if pps.scaling_list_data_present_flag {
            self.scaling_list_data(&pps.scaling_list)?;
        }

        self.u(1, pps.lists_modification_present_flag)?;
        self.ue(pps.log2_parallel_merge_level_minus2)?;
        self.u(1, pps.slice_segment_header_extension_present_flag)?;

        self.u(1, pps.extension_present_flag)?;
        if pps.extension_present_flag {
            self.u(1, pps.range_extension_flag)?;
            // multilayer, 3d, scc and pps_extension_4bits
            self.u(7, 0u32)?;

            if pps.range_extension_flag {
                let rext = &pps.range_extension;
                if pps.transform_skip_enabled_flag {
                    self.ue(rext.log2_max_transform_skip_block_size_minus2)?;
                }

                self.u(1, rext.cross_component_prediction_enabled_flag)?;
                self.u(1, rext.chroma_qp_offset_list_enabled_flag)?;
                if rext.chroma_qp_offset_list_enabled_flag {
                    self.ue(rext.diff_cu_chroma_qp_offset_depth)?;
                    self.ue(rext.chroma_qp_offset_list_len_minus1)?;
                    for i in 0..=rext.chroma_qp_offset_list_len_minus1 as usize {
                        self.se(rext.cb_qp_offset_list[i])?;
                        self.se(rext.cr_qp_offset_list[i])?;
                    }
                }

                self.ue(rext.log2_sao_offset_scale_luma)?;
                self.ue(rext.log2_sao_offset_scale_chroma)?;
            }
        }

        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, SliceHeader, W> {
    /// Writes a slice segment NAL unit holding `hdr` only, i.e. everything up
    /// to and including byte_alignment(). The slice data is left to the caller.
    pub fn synthesize(
        nalu_type: NaluType,
        hdr: &'n SliceHeader,
        sps: &Sps,
        pps: &Pps,
        writer: W,
        ep_enabled: bool,
    ) -> SynthesizerResult<()> {
        if !nalu_type.is_slice() {
            return Err(SynthesizerError::Unsupported);
        }

        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: hdr,
        };

        s.writer.write_header(nalu_type)?;
        s.slice_segment_header(nalu_type, sps, pps)?;
        // byte_alignment()
        s.rbsp_trailing_bits()
    }

    fn pred_weight_table(&mut self, sps: &Sps) -> SynthesizerResult<()> {
        // H.265 7.3.6.3
        let hdr = self.nalu;
        let pwt = &hdr.pred_weight_table;

        self.ue(pwt.luma_log2_weight_denom)?;
        if sps.chroma_array_type != 0 {
            self.se(pwt.delta_chroma_log2_weight_denom)?;
        }

        let num_l0 = usize::from(hdr.num_ref_idx_l0_active_minus1) + 1;
        for i in 0..num_l0 {
            self.u(1, pwt.luma_weight_l0_flag[i])?;
        }

        if sps.chroma_array_type != 0 {
            for i in 0..num_l0 {
                self.u(1, pwt.chroma_weight_l0_flag[i])?;
            }
        }

        for i in 0..num_l0 {
            if pwt.luma_weight_l0_flag[i] {
                self.se(pwt.delta_luma_weight_l0[i])?;
                self.se(pwt.luma_offset_l0[i])?;
            }

            if pwt.chroma_weight_l0_flag[i] {
                for j in 0..2 {
                    self.se(pwt.delta_chroma_weight_l0[i][j])?;
                    self.se(pwt.delta_chroma_offset_l0[i][j])?;
                }
            }
        }

        if hdr.type_.is_b() {
            let num_l1 = usize::from(hdr.num_ref_idx_l1_active_minus1) + 1;
            for i in 0..num_l1 {
                self.u(1, pwt.luma_weight_l1_flag[i])?;
            }

            if sps.chroma_array_type != 0 {
                for i in 0..num_l1 {
                    self.u(1, pwt.chroma_weight_l1_flag[i])?;
                }
            }

            for i in 0..num_l1 {
                if pwt.luma_weight_l1_flag[i] {
                    self.se(pwt.delta_luma_weight_l1[i])?;
                    self.se(pwt.luma_offset_l1[i])?;
                }

                if pwt.chroma_weight_l1_flag[i] {
                    for j in 0..2 {
                        self.se(pwt.delta_chroma_weight_l1[i][j])?;
                        self.se(pwt.delta_chroma_offset_l1[i][j])?;
                    }
                }
            }
        }

        Ok(())
    }

    fn list_entries(&mut self, entries: &[u32], num_pic_total_curr: u32) -> SynthesizerResult<()> {
        let num_bits = ceil_log2(num_pic_total_curr);
        for entry in entries {
            self.u(num_bits, *entry)?;
        }

        Ok(())
    }

    fn slice_segment_header(
        &mut self,
        nalu_type: NaluType,
        sps: &Sps,
        pps: &Pps,
    ) -> SynthesizerResult<()> {
        // H.265 7.3.6.1
        let hdr = self.nalu;

        self.u(1, hdr.first_slice_segment_in_pic_flag)?;
        if nalu_type.is_irap() {
            self.u(1, hdr.no_output_of_prior_pics_flag)?;
        }

        self.ue(hdr.pic_parameter_set_id)?;

        if !hdr.first_slice_segment_in_pic_flag {
            if pps.dependent_slice_segments_enabled_flag {
                self.u(1, hdr.dependent_slice_segment_flag)?;
            }

            self.u(ceil_log2(sps.pic_size_in_ctbs_y), hdr.segment_address)?;
        }

        if !hdr.dependent_slice_segment_flag {
            self.zeros(usize::from(pps.num_extra_slice_header_bits))?;
            self.ue(hdr.type_ as u32)?;

            if pps.output_flag_present_flag {
                self.u(1, hdr.pic_output_flag)?;
            }

            if sps.separate_colour_plane_flag {
                self.u(2, hdr.colour_plane_id)?;
            }

            if !nalu_type.is_idr() {
                let num_bits = usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4;
                self.u(num_bits, hdr.pic_order_cnt_lsb)?;

                self.u(1, hdr.short_term_ref_pic_set_sps_flag)?;
                if !hdr.short_term_ref_pic_set_sps_flag {
                    self.st_ref_pic_set(
                        &hdr.short_term_ref_pic_set,
                        sps.num_short_term_ref_pic_sets,
                    )?;
                } else if sps.num_short_term_ref_pic_sets > 1 {
                    let num_bits = ceil_log2(u32::from(sps.num_short_term_ref_pic_sets));
                    self.u(num_bits, hdr.short_term_ref_pic_set_idx)?;
                }

                if sps.long_term_ref_pics_present_flag {
                    if sps.num_long_term_ref_pics_sps > 0 {
                        self.ue(hdr.num_long_term_sps)?;
                    }

                    self.ue(hdr.num_long_term_pics)?;

                    for i in 0..hdr.num_long_term() {
                        if i < usize::from(hdr.num_long_term_sps) {
                            if sps.num_long_term_ref_pics_sps > 1 {
                                let num_bits =
                                    ceil_log2(u32::from(sps.num_long_term_ref_pics_sps));
                                self.u(num_bits, hdr.lt_idx_sps[i])?;
                            }
                        } else {
                            self.u(num_bits, hdr.poc_lsb_lt[i])?;
                            self.u(1, hdr.used_by_curr_pic_lt[i])?;
                        }

                        self.u(1, hdr.delta_poc_msb_present_flag[i])?;
                        if hdr.delta_poc_msb_present_flag[i] {
                            self.ue(hdr.delta_poc_msb_cycle_lt[i])?;
                        }
                    }
                }

                if sps.temporal_mvp_enabled_flag {
                    self.u(1, hdr.temporal_mvp_enabled_flag)?;
                }
            }

            if sps.sample_adaptive_offset_enabled_flag {
                self.u(1, hdr.sao_luma_flag)?;
                if sps.chroma_array_type != 0 {
                    self.u(1, hdr.sao_chroma_flag)?;
                }
            }

            if hdr.type_.is_p() || hdr.type_.is_b() {
                self.u(1, hdr.num_ref_idx_active_override_flag)?;
                if hdr.num_ref_idx_active_override_flag {
                    self.ue(hdr.num_ref_idx_l0_active_minus1)?;
                    if hdr.type_.is_b() {
                        self.ue(hdr.num_ref_idx_l1_active_minus1)?;
                    }
                }

                let st_rps = hdr.st_rps(sps).ok_or(SynthesizerError::Unsupported)?;
                let num_lt_used = hdr.used_by_curr_pic_lt[..hdr.num_long_term()]
                    .iter()
                    .filter(|used| **used)
                    .count();
                let num_pic_total_curr = (st_rps.num_used_by_curr() + num_lt_used) as u32;

                if pps.lists_modification_present_flag && num_pic_total_curr > 1 {
                    let rplm = &hdr.ref_pic_list_modification;
                    self.u(1, rplm.ref_pic_list_modification_flag_l0)?;
                    if rplm.ref_pic_list_modification_flag_l0 {
                        self.list_entries(&rplm.list_entry_l0, num_pic_total_curr)?;
                    }

                    if hdr.type_.is_b() {
                        self.u(1, rplm.ref_pic_list_modification_flag_l1)?;
                        if rplm.ref_pic_list_modification_flag_l1 {
                            self.list_entries(&rplm.list_entry_l1, num_pic_total_curr)?;
                        }
                    }
                }

                if hdr.type_.is_b() {
                    self.u(1, hdr.mvd_l1_zero_flag)?;
                }

                if pps.cabac_init_present_flag {
                    self.u(1, hdr.cabac_init_flag)?;
                }

                if hdr.temporal_mvp_enabled_flag {
                    if hdr.type_.is_b() {
                        self.u(1, hdr.collocated_from_l0_flag)?;
                    }

                    let max = if hdr.collocated_from_l0_flag {
                        hdr.num_ref_idx_l0_active_minus1
                    } else {
                        hdr.num_ref_idx_l1_active_minus1
                    };

                    if max > 0 {
                        self.ue(hdr.collocated_ref_idx)?;
                    }
                }

                if (pps.weighted_pred_flag && hdr.type_.is_p())
                    || (pps.weighted_bipred_flag && hdr.type_.is_b())
                {
                    self.pred_weight_table(sps)?;
                }

                self.ue(hdr.five_minus_max_num_merge_cand)?;
            }

            self.se(hdr.qp_delta)?;

            if pps.slice_chroma_qp_offsets_present_flag {
                self.se(hdr.cb_qp_offset)?;
                self.se(hdr.cr_qp_offset)?;
            }

            if pps.range_extension.chroma_qp_offset_list_enabled_flag {
                self.u(1, hdr.cu_chroma_qp_offset_enabled_flag)?;
            }

            if pps.deblocking_filter_override_enabled_flag {
                self.u(1, hdr.deblocking_filter_override_flag)?;
            }

            if hdr.deblocking_filter_override_flag {
                self.u(1, hdr.deblocking_filter_disabled_flag)?;
                if !hdr.deblocking_filter_disabled_flag {
                    self.se(hdr.beta_offset_div2)?;
                    self.se(hdr.tc_offset_div2)?;
                }
            }

            if pps.loop_filter_across_slices_enabled_flag
                && (hdr.sao_luma_flag
                    || hdr.sao_chroma_flag
                    || !hdr.deblocking_filter_disabled_flag)
            {
                self.u(1, hdr.loop_filter_across_slices_enabled_flag)?;
            }
        }

        if pps.tiles_enabled_flag || pps.entropy_coding_sync_enabled_flag {
            self.ue(hdr.num_entry_point_offsets)?;
            if hdr.num_entry_point_offsets > 0 {
                self.ue(hdr.offset_len_minus1)?;
                let num_bits = usize::from(hdr.offset_len_minus1) + 1;
                for offset in &hdr.entry_point_offset_minus1 {
                    self.u(num_bits, *offset)?;
                }
            }
        }

        if pps.slice_segment_header_extension_present_flag {
            // slice_segment_header_extension_length
            self.ue(0u32)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::codec::h265::parser::Nalu;
    use crate::codec::h265::parser::Parser;
    use crate::codec::h265::parser::SliceType;

    fn test_sps() -> Sps {
        let mut sps = Sps {
            chroma_format_idc: 1,
            pic_width_in_luma_samples: 1920,
            pic_height_in_luma_samples: 1088,
            conformance_window_flag: true,
            conf_win_bottom_offset: 4,
            log2_max_pic_order_cnt_lsb_minus4: 4,
            log2_diff_max_min_luma_coding_block_size: 2,
            log2_diff_max_min_luma_transform_block_size: 3,
            max_transform_hierarchy_depth_inter: 2,
            max_transform_hierarchy_depth_intra: 2,
            amp_enabled_flag: true,
            sample_adaptive_offset_enabled_flag: true,
            temporal_mvp_enabled_flag: true,
            strong_intra_smoothing_enabled_flag: true,
            vui_parameters_present_flag: true,
            ..Default::default()
        };

        // Only the highest sub-layer is signalled.
        sps.max_dec_pic_buffering_minus1[0] = 3;
        sps.max_num_reorder_pics[0] = 1;

        sps.profile_tier_level.general.profile_idc = 1;
        sps.profile_tier_level.general.profile_compatibility_flag[1] = true;
        sps.profile_tier_level.general.profile_compatibility_flag[2] = true;
        sps.profile_tier_level.general.progressive_source_flag = true;
        sps.profile_tier_level.general.frame_only_constraint_flag = true;
        sps.profile_tier_level.general_level_idc = 123;

        let vui = &mut sps.vui_parameters;
        vui.aspect_ratio_info_present_flag = true;
        vui.aspect_ratio_idc = EXTENDED_SAR;
        vui.sar_width = 1;
        vui.sar_height = 1;
        vui.timing_info_present_flag = true;
        vui.num_units_in_tick = 1;
        vui.time_scale = 30;
        vui.hrd_parameters_present_flag = true;
        vui.hrd.nal_hrd_parameters_present_flag = true;
        vui.hrd.bit_rate_scale = 6;
        vui.hrd.cpb_size_scale = 4;
        vui.hrd.fixed_pic_rate_general_flag[0] = true;
        vui.hrd.fixed_pic_rate_within_cvs_flag[0] = true;
        vui.hrd.nal_hrd[0].bit_rate_value_minus1[0] = 78124;
        vui.hrd.nal_hrd[0].cpb_size_value_minus1[0] = 312499;
        vui.hrd.nal_hrd[0].cbr_flag[0] = true;

        sps.update_derived();
        sps
    }

    fn parse_one<T>(
        data: &[u8],
        parse: impl FnOnce(&Nalu) -> anyhow::Result<T>,
    ) -> T {
        let mut cursor = Cursor::new(data);
        let nalu = Nalu::next(&mut cursor).unwrap();
        parse(&nalu).unwrap()
    }

    #[test]
    fn vps_round_trip() {
        let mut vps = Vps {
            base_layer_internal_flag: true,
            base_layer_available_flag: true,
            temporal_id_nesting_flag: true,
            ..Default::default()
        };
        vps.max_dec_pic_buffering_minus1[0] = 4;
        vps.max_num_reorder_pics[0] = 2;
        vps.profile_tier_level.general.profile_idc = 2;
        vps.profile_tier_level.general.profile_compatibility_flag[2] = true;
        vps.profile_tier_level.general_level_idc = 93;

        let mut buf = Vec::new();
        Synthesizer::<Vps, &mut Vec<u8>>::synthesize(&vps, &mut buf, true).unwrap();

        let mut parser = Parser::default();
        let parsed = parse_one(&buf, |nalu| parser.parse_vps(nalu).cloned());
        assert_eq!(*parsed, vps);
    }

    #[test]
    fn sps_pps_round_trip() {
        let sps = test_sps();

        let mut buf = Vec::new();
        Synthesizer::<Sps, &mut Vec<u8>>::synthesize(&sps, &mut buf, true).unwrap();

        let mut parser = Parser::default();
        let parsed = parse_one(&buf, |nalu| parser.parse_sps(nalu).cloned());
        assert_eq!(*parsed, sps);
        assert_eq!(parsed.width(), 1920);
        assert_eq!(parsed.height(), 1080);
        assert_eq!(parsed.pic_width_in_ctbs_y, 60);
        assert_eq!(parsed.pic_height_in_ctbs_y, 34);

        let mut pps = Pps {
            init_qp_minus26: -4,
            cu_qp_delta_enabled_flag: true,
            diff_cu_qp_delta_depth: 1,
            transform_skip_enabled_flag: true,
            cb_qp_offset: -2,
            tiles_enabled_flag: true,
            num_tile_columns_minus1: 2,
            num_tile_rows_minus1: 1,
            loop_filter_across_slices_enabled_flag: true,
            deblocking_filter_control_present_flag: true,
            beta_offset_div2: 2,
            tc_offset_div2: -1,
            ..Default::default()
        };
        pps.update_uniform_tiles(&sps);

        let mut buf = Vec::new();
        Synthesizer::<Pps, &mut Vec<u8>>::synthesize(&pps, &mut buf, true).unwrap();

        let parsed = parse_one(&buf, |nalu| parser.parse_pps(nalu).cloned());
        assert_eq!(parsed.init_qp_minus26, -4);
        assert_eq!(parsed.cb_qp_offset, -2);
        assert_eq!(parsed.num_tile_columns_minus1, 2);
        assert_eq!(parsed.num_tile_rows_minus1, 1);
        assert_eq!(&parsed.column_width_minus1[..3], &[19, 19, 19]);
        assert_eq!(&parsed.row_height_minus1[..2], &[16, 16]);
        assert_eq!(parsed.beta_offset_div2, 2);
        assert_eq!(parsed.tc_offset_div2, -1);
        assert_eq!(*parsed, pps);
    }

    #[test]
    fn explicit_tile_sizes() {
        let sps = test_sps();
        let mut pps = Pps {
            tiles_enabled_flag: true,
            uniform_spacing_flag: false,
            num_tile_columns_minus1: 1,
            num_tile_rows_minus1: 1,
            ..Default::default()
        };
        pps.column_width_minus1[0] = 9;
        pps.row_height_minus1[0] = 4;

        let mut buf = Vec::new();
        Synthesizer::<Sps, &mut Vec<u8>>::synthesize(&sps, &mut buf, true).unwrap();
        Synthesizer::<Pps, &mut Vec<u8>>::synthesize(&pps, &mut buf, true).unwrap();

        let mut parser = Parser::default();
        let mut cursor = Cursor::new(&buf[..]);
        parser
            .parse_sps(&Nalu::next(&mut cursor).unwrap())
            .unwrap();
        let parsed = parser
            .parse_pps(&Nalu::next(&mut cursor).unwrap())
            .unwrap();

        // The last column and row take the remaining CTBs.
        assert_eq!(&parsed.column_width_minus1[..2], &[9, 49]);
        assert_eq!(&parsed.row_height_minus1[..2], &[4, 28]);
    }

    #[test]
    fn scaling_list_round_trip() {
        let mut sps = test_sps();
        sps.scaling_list_enabled_flag = true;
        sps.scaling_list_data_present_flag = true;
        sps.scaling_list.scaling_list_4x4[1] = [
            6, 7, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 255,
        ];
        sps.scaling_list.scaling_list_16x16[0][5] = 40;
        sps.scaling_list.scaling_list_dc_coef_minus8_16x16[0] = 12;
        sps.scaling_list.scaling_list_32x32[3][0] = 1;
        sps.scaling_list.scaling_list_dc_coef_minus8_32x32[3] = -7;

        let mut buf = Vec::new();
        Synthesizer::<Sps, &mut Vec<u8>>::synthesize(&sps, &mut buf, true).unwrap();

        let mut parser = Parser::default();
        let parsed = parse_one(&buf, |nalu| parser.parse_sps(nalu).cloned());
        assert_eq!(parsed.scaling_list, sps.scaling_list);
    }

    #[test]
    fn slice_header_round_trip() {
        let sps = test_sps();
        let pps = Pps {
            num_ref_idx_l0_default_active_minus1: 1,
            loop_filter_across_slices_enabled_flag: true,
            ..Default::default()
        };

        let mut hdr = SliceHeader {
            type_: SliceType::B,
            pic_order_cnt_lsb: 5,
            num_ref_idx_active_override_flag: true,
            num_ref_idx_l0_active_minus1: 1,
            num_ref_idx_l1_active_minus1: 0,
            temporal_mvp_enabled_flag: true,
            sao_luma_flag: true,
            sao_chroma_flag: true,
            qp_delta: -3,
            loop_filter_across_slices_enabled_flag: true,
            segment_address: 120,
            ..Default::default()
        };
        hdr.short_term_ref_pic_set.num_negative_pics = 2;
        hdr.short_term_ref_pic_set.delta_poc_s0[0] = -1;
        hdr.short_term_ref_pic_set.delta_poc_s0[1] = -5;
        hdr.short_term_ref_pic_set.used_by_curr_pic_s0[..2].copy_from_slice(&[true, true]);
        hdr.short_term_ref_pic_set.num_positive_pics = 1;
        hdr.short_term_ref_pic_set.delta_poc_s1[0] = 3;
        hdr.short_term_ref_pic_set.used_by_curr_pic_s1[0] = true;

        let mut buf = Vec::new();
        Synthesizer::<Sps, &mut Vec<u8>>::synthesize(&sps, &mut buf, true).unwrap();
        Synthesizer::<Pps, &mut Vec<u8>>::synthesize(&pps, &mut buf, true).unwrap();
        Synthesizer::<SliceHeader, &mut Vec<u8>>::synthesize(
            NaluType::TrailN,
            &hdr,
            &sps,
            &pps,
            &mut buf,
            true,
        )
        .unwrap();

        let mut parser = Parser::default();
        let mut cursor = Cursor::new(&buf[..]);
        parser
            .parse_sps(&Nalu::next(&mut cursor).unwrap())
            .unwrap();
        parser
            .parse_pps(&Nalu::next(&mut cursor).unwrap())
            .unwrap();
        let slice = parser
            .parse_slice_header(Nalu::next(&mut cursor).unwrap())
            .unwrap();

        let parsed = slice.header;
        assert_eq!(parsed.type_, SliceType::B);
        assert_eq!(parsed.segment_address, 120);
        assert_eq!(parsed.pic_order_cnt_lsb, 5);
        assert_eq!(parsed.short_term_ref_pic_set, hdr.short_term_ref_pic_set);
        assert_eq!(parsed.num_ref_idx_l0_active_minus1, 1);
        assert_eq!(parsed.num_ref_idx_l1_active_minus1, 0);
        assert_eq!(parsed.num_pic_total_curr, 3);
        assert!(parsed.temporal_mvp_enabled_flag);
        assert!(parsed.sao_luma_flag);
        assert_eq!(parsed.qp_delta, -3);
        assert!(parsed.loop_filter_across_slices_enabled_flag);
        assert_eq!(parsed.header_bit_size % 8, 0);
    }

    #[test]
    fn inter_rps_unsupported() {
        let mut sps = test_sps();
        sps.num_short_term_ref_pic_sets = 2;
        sps.short_term_ref_pic_set = vec![
            ShortTermRefPicSet::default(),
            ShortTermRefPicSet {
                inter_ref_pic_set_prediction_flag: true,
                ..Default::default()
            },
        ];

        let mut buf = Vec::new();
        let err = Synthesizer::<Sps, &mut Vec<u8>>::synthesize(&sps, &mut buf, true).unwrap_err();
        assert!(matches!(err, SynthesizerError::Unsupported));
    }

    #[test]
    fn overflow_is_reported() {
        let sps = test_sps();
        let mut storage = [0u8; 8];
        let err =
            Synthesizer::<Sps, &mut [u8]>::synthesize(&sps, &mut storage[..], true).unwrap_err();
        assert!(err.is_overflow());
    }
}
