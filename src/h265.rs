// This file is part of Moonfire Remux, a media container remuxing toolkit.
// Copyright (C) 2024 The Moonfire Remux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! H.265/HEVC parameter parsing: NAL headers, VPS/SPS/PPS decoding (ISO/IEC
//! 23008-2 section 7.3), and the `HEVCDecoderConfigurationRecord` of ISO/IEC
//! 14496-15 section 8.3.3.1.2.
//!
//! Unlike H.264, the record aggregates fields across all stored parameter
//! sets: profile/tier/level fold upward, compatibility flags AND together,
//! and `parallelismType` is derived from PPS tile/wavefront flags. The
//! `update_*` operations below recompute those aggregates on every accepted
//! parameter set, the same way ffmpeg's `hevc.c` does when building `hvcC`.

use crate::bitio::{BitReader, BitWriter};
use crate::nal;
use base::{bail, Error};

// ISO/IEC 23008-2 table 7-1.
pub const NAL_TRAIL_N: u8 = 0;
pub const NAL_TRAIL_R: u8 = 1;
pub const NAL_TSA_N: u8 = 2;
pub const NAL_TSA_R: u8 = 3;
pub const NAL_STSA_N: u8 = 4;
pub const NAL_STSA_R: u8 = 5;
pub const NAL_RADL_N: u8 = 6;
pub const NAL_RADL_R: u8 = 7;
pub const NAL_RASL_N: u8 = 8;
pub const NAL_RASL_R: u8 = 9;
pub const NAL_BLA_W_LP: u8 = 16;
pub const NAL_BLA_W_RADL: u8 = 17;
pub const NAL_BLA_N_LP: u8 = 18;
pub const NAL_IDR_W_RADL: u8 = 19;
pub const NAL_IDR_N_LP: u8 = 20;
pub const NAL_CRA: u8 = 21;
pub const NAL_VPS: u8 = 32;
pub const NAL_SPS: u8 = 33;
pub const NAL_PPS: u8 = 34;
pub const NAL_AUD: u8 = 35;
pub const NAL_SEI_PREFIX: u8 = 39;
pub const NAL_SEI_SUFFIX: u8 = 40;

/// An access unit delimiter NAL (`pic_type` = B/P/I), as ffmpeg writes.
pub const AUD_NAL: [u8; 7] = [0x00, 0x00, 0x00, 0x01, 0x46, 0x01, 0x50];

/// NAL type of a unit that does not begin with a start code.
pub fn nal_type(unit: &[u8]) -> u8 {
    unit.first().map(|b| (b >> 1) & 0x3f).unwrap_or(0xff)
}

/// NAL type of a buffer that may or may not begin with a start code.
pub fn nal_type_skipping_start_code(data: &[u8]) -> u8 {
    match nal::next_start_code(data, 0) {
        Some((0, sc)) => nal_type(&data[sc..]),
        _ => nal_type(data),
    }
}

pub fn is_vcl(nal_type: u8) -> bool {
    nal_type <= NAL_CRA
}

/// IRAP pictures (BLA/IDR/CRA), the H.265 analogue of an H.264 IDR.
pub fn is_irap(nal_type: u8) -> bool {
    (NAL_BLA_W_LP..=NAL_CRA).contains(&nal_type)
}

/// True iff the Annex B buffer contains an IRAP slice.
pub fn is_irap_frame(annexb: &[u8]) -> bool {
    let mut irap = false;
    let _ = nal::split_annex_b(annexb, |unit| {
        if is_irap(nal_type(unit)) {
            irap = true;
        }
        Ok(())
    });
    irap
}

/// `first_slice_segment_in_pic_flag` is the bit immediately after the 2-byte
/// NAL header.
pub fn first_slice_segment_in_pic(unit: &[u8]) -> bool {
    unit.len() > 2 && unit[2] & 0x80 != 0
}

/// Access-unit boundary predicate: parameter sets/SEI/AUD open a new AU; a
/// VCL NAL opens one iff it's the first slice segment of its picture.
pub fn is_new_access_unit(unit: &[u8]) -> bool {
    match nal_type(unit) {
        NAL_AUD | NAL_VPS | NAL_SPS | NAL_PPS | NAL_SEI_PREFIX => true,
        t if is_vcl(t) => first_slice_segment_in_pic(unit),
        _ => false,
    }
}

/// nal_unit_header(), ISO/IEC 23008-2 section 7.3.1.2.
#[derive(Clone, Debug, Default)]
pub struct NalHeader {
    pub nal_unit_type: u8,
    pub nuh_layer_id: u8,
    pub nuh_temporal_id_plus1: u8,
}

impl NalHeader {
    fn decode(r: &mut BitReader) -> Result<Self, Error> {
        let forbidden = r.read_bit()?;
        if forbidden != 0 {
            bail!(DataLoss, msg("forbidden_zero_bit set in NAL header"));
        }
        Ok(NalHeader {
            nal_unit_type: r.read_u8(6)?,
            nuh_layer_id: r.read_u8(6)?,
            nuh_temporal_id_plus1: r.read_u8(3)?,
        })
    }
}

/// profile_tier_level(), ISO/IEC 23008-2 section 7.3.3.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ProfileTierLevel {
    pub general_profile_space: u8,
    pub general_tier_flag: u8,
    pub general_profile_idc: u8,
    pub general_profile_compatibility_flags: u32,
    pub general_constraint_indicator_flags: u64,
    pub general_level_idc: u8,
}

impl ProfileTierLevel {
    fn parse(r: &mut BitReader, max_sub_layers_minus1: u8) -> Result<Self, Error> {
        let ptl = ProfileTierLevel {
            general_profile_space: r.read_u8(2)?,
            general_tier_flag: r.read_u8(1)?,
            general_profile_idc: r.read_u8(5)?,
            general_profile_compatibility_flags: r.read_u32(32)?,
            general_constraint_indicator_flags: r.read_bits(48)?,
            general_level_idc: r.read_u8(8)?,
        };
        let mut profile_present = [0u8; 8];
        let mut level_present = [0u8; 8];
        for i in 0..max_sub_layers_minus1 as usize {
            profile_present[i] = r.read_bit()?;
            level_present[i] = r.read_bit()?;
        }
        if max_sub_layers_minus1 > 0 {
            for _ in max_sub_layers_minus1..8 {
                r.skip(2)?; // reserved_zero_2bits
            }
        }
        for i in 0..max_sub_layers_minus1 as usize {
            if profile_present[i] == 1 {
                // sub_layer profile space/tier/idc/compatibility/constraints.
                r.skip(88)?;
            }
            if level_present[i] == 1 {
                r.skip(8)?; // sub_layer_level_idc
            }
        }
        Ok(ptl)
    }
}

/// Decoded video parameter set fields of interest.
#[derive(Clone, Debug, Default)]
pub struct Vps {
    pub id: u8,
    pub max_layers_minus1: u8,
    pub max_sub_layers_minus1: u8,
    pub temporal_id_nesting: u8,
    pub ptl: ProfileTierLevel,
}

impl Vps {
    /// Parses an encoded VPS NAL unit (2-byte header first, no start code).
    pub fn parse(unit: &[u8]) -> Result<Self, Error> {
        let rbsp = nal::decode_rbsp(unit);
        let mut r = BitReader::new(&rbsp);
        let hdr = NalHeader::decode(&mut r)?;
        if hdr.nal_unit_type != NAL_VPS {
            bail!(DataLoss, msg("not a VPS: nal type {}", hdr.nal_unit_type));
        }
        let id = r.read_u8(4)?;
        r.skip(1)?; // vps_base_layer_internal_flag
        r.skip(1)?; // vps_base_layer_available_flag
        let max_layers_minus1 = r.read_u8(6)?;
        let max_sub_layers_minus1 = r.read_u8(3)?;
        let temporal_id_nesting = r.read_bit()?;
        r.skip(16)?; // vps_reserved_0xffff_16bits
        let ptl = ProfileTierLevel::parse(&mut r, max_sub_layers_minus1)?;
        // The remaining syntax (DPB sizes, layer sets, timing) doesn't affect
        // the record; parse enough of it to validate structure.
        let ordering_present = r.read_bit()?;
        let start = if ordering_present == 1 {
            0
        } else {
            max_sub_layers_minus1
        };
        for _ in start..=max_sub_layers_minus1 {
            r.read_ue()?; // vps_max_dec_pic_buffering_minus1
            r.read_ue()?; // vps_max_num_reorder_pics
            r.read_ue()?; // vps_max_latency_increase_plus1
        }
        let max_layer_id = r.read_u8(6)?;
        let num_layer_sets_minus1 = r.read_ue()?;
        for _ in 1..=num_layer_sets_minus1 {
            for _ in 0..=max_layer_id {
                r.skip(1)?; // layer_id_included_flag
            }
        }
        Ok(Vps {
            id,
            max_layers_minus1,
            max_sub_layers_minus1,
            temporal_id_nesting,
            ptl,
        })
    }
}

/// VUI fields of interest (subset of ISO/IEC 23008-2 annex E).
#[derive(Clone, Debug, Default)]
pub struct Vui {
    /// Present only when the SPS carried a bitstream restriction block.
    pub min_spatial_segmentation_idc: Option<u64>,
}

/// Decoded sequence parameter set fields of interest.
#[derive(Clone, Debug, Default)]
pub struct Sps {
    pub id: u64,
    pub max_sub_layers_minus1: u8,
    pub temporal_id_nesting: u8,
    pub ptl: ProfileTierLevel,
    pub chroma_format_idc: u64,
    pub width: u32,
    pub height: u32,
    pub bit_depth_luma_minus8: u64,
    pub bit_depth_chroma_minus8: u64,
    pub vui: Vui,
}

impl Sps {
    /// Parses an encoded SPS NAL unit (2-byte header first, no start code).
    pub fn parse(unit: &[u8]) -> Result<Self, Error> {
        let rbsp = nal::decode_rbsp(unit);
        let mut r = BitReader::new(&rbsp);
        let hdr = NalHeader::decode(&mut r)?;
        if hdr.nal_unit_type != NAL_SPS {
            bail!(DataLoss, msg("not an SPS: nal type {}", hdr.nal_unit_type));
        }
        r.skip(4)?; // sps_video_parameter_set_id
        let max_sub_layers_minus1 = r.read_u8(3)?;
        let temporal_id_nesting = r.read_bit()?;
        let ptl = ProfileTierLevel::parse(&mut r, max_sub_layers_minus1)?;
        let id = r.read_ue()?;
        let chroma_format_idc = r.read_ue()?;
        if chroma_format_idc == 3 {
            r.skip(1)?; // separate_colour_plane_flag
        }
        let width = r.read_ue()? as u32;
        let height = r.read_ue()? as u32;
        if r.read_bit()? == 1 {
            // conformance_window_flag
            r.read_ue()?; // left
            r.read_ue()?; // right
            r.read_ue()?; // top
            r.read_ue()?; // bottom
        }
        let bit_depth_luma_minus8 = r.read_ue()?;
        let bit_depth_chroma_minus8 = r.read_ue()?;
        let log2_max_poc_lsb_minus4 = r.read_ue()?;
        let ordering_present = r.read_bit()?;
        let start = if ordering_present == 1 {
            0
        } else {
            max_sub_layers_minus1
        };
        for _ in start..=max_sub_layers_minus1 {
            r.read_ue()?; // sps_max_dec_pic_buffering_minus1
            r.read_ue()?; // sps_max_num_reorder_pics
            r.read_ue()?; // sps_max_latency_increase_plus1
        }
        r.read_ue()?; // log2_min_luma_coding_block_size_minus3
        r.read_ue()?; // log2_diff_max_min_luma_coding_block_size
        r.read_ue()?; // log2_min_transform_block_size_minus2
        r.read_ue()?; // log2_diff_max_min_transform_block_size
        r.read_ue()?; // max_transform_hierarchy_depth_inter
        r.read_ue()?; // max_transform_hierarchy_depth_intra
        if r.read_bit()? == 1 {
            // scaling_list_enabled_flag
            if r.read_bit()? == 1 {
                scaling_list_data(&mut r)?;
            }
        }
        r.skip(1)?; // amp_enabled_flag
        r.skip(1)?; // sample_adaptive_offset_enabled_flag
        if r.read_bit()? == 1 {
            // pcm_enabled_flag
            r.skip(4)?; // pcm_sample_bit_depth_luma_minus1
            r.skip(4)?; // pcm_sample_bit_depth_chroma_minus1
            r.read_ue()?; // log2_min_pcm_luma_coding_block_size_minus3
            r.read_ue()?; // log2_diff_max_min_pcm_luma_coding_block_size
            r.skip(1)?; // pcm_loop_filter_disabled_flag
        }
        let num_short_term_ref_pic_sets = r.read_ue()?;
        if num_short_term_ref_pic_sets > 64 {
            bail!(
                DataLoss,
                msg("num_short_term_ref_pic_sets {} > 64", num_short_term_ref_pic_sets)
            );
        }
        let mut num_delta_pocs = [0u32; 64];
        for i in 0..num_short_term_ref_pic_sets as usize {
            parse_st_ref_pic_set(&mut r, i, num_short_term_ref_pic_sets, &mut num_delta_pocs)?;
        }
        if r.read_bit()? == 1 {
            // long_term_ref_pics_present_flag
            let n = r.read_ue()?;
            for _ in 0..n {
                let len = std::cmp::min(log2_max_poc_lsb_minus4 + 4, 16) as usize;
                r.skip(len)?; // lt_ref_pic_poc_lsb_sps
                r.skip(1)?; // used_by_curr_pic_lt_sps_flag
            }
        }
        r.skip(1)?; // sps_temporal_mvp_enabled_flag
        r.skip(1)?; // strong_intra_smoothing_enabled_flag
        let mut vui = Vui::default();
        if r.read_bit()? == 1 {
            vui = parse_vui(&mut r, max_sub_layers_minus1)?;
        }
        Ok(Sps {
            id,
            max_sub_layers_minus1,
            temporal_id_nesting,
            ptl,
            chroma_format_idc,
            width,
            height,
            bit_depth_luma_minus8,
            bit_depth_chroma_minus8,
            vui,
        })
    }
}

/// Decoded picture parameter set fields of interest.
#[derive(Clone, Debug, Default)]
pub struct Pps {
    pub id: u64,
    pub sps_id: u64,
    pub tiles_enabled: bool,
    pub entropy_coding_sync_enabled: bool,
}

impl Pps {
    /// Parses an encoded PPS NAL unit (2-byte header first, no start code).
    pub fn parse(unit: &[u8]) -> Result<Self, Error> {
        let rbsp = nal::decode_rbsp(unit);
        let mut r = BitReader::new(&rbsp);
        let hdr = NalHeader::decode(&mut r)?;
        if hdr.nal_unit_type != NAL_PPS {
            bail!(DataLoss, msg("not a PPS: nal type {}", hdr.nal_unit_type));
        }
        let id = r.read_ue()?;
        let sps_id = r.read_ue()?;
        r.skip(1)?; // dependent_slice_segments_enabled_flag
        r.skip(1)?; // output_flag_present_flag
        r.skip(3)?; // num_extra_slice_header_bits
        r.skip(1)?; // sign_data_hiding_enabled_flag
        r.skip(1)?; // cabac_init_present_flag
        r.read_ue()?; // num_ref_idx_l0_default_active_minus1
        r.read_ue()?; // num_ref_idx_l1_default_active_minus1
        r.read_se()?; // init_qp_minus26
        r.skip(1)?; // constrained_intra_pred_flag
        r.skip(1)?; // transform_skip_enabled_flag
        if r.read_bit()? == 1 {
            // cu_qp_delta_enabled_flag
            r.read_ue()?; // diff_cu_qp_delta_depth
        }
        r.read_se()?; // pps_cb_qp_offset
        r.read_se()?; // pps_cr_qp_offset
        r.skip(1)?; // pps_slice_chroma_qp_offsets_present_flag
        r.skip(1)?; // weighted_pred_flag
        r.skip(1)?; // weighted_bipred_flag
        r.skip(1)?; // transquant_bypass_enabled_flag
        let tiles_enabled = r.read_bit()? == 1;
        let entropy_coding_sync_enabled = r.read_bit()? == 1;
        Ok(Pps {
            id,
            sps_id,
            tiles_enabled,
            entropy_coding_sync_enabled,
        })
    }
}

fn scaling_list_data(r: &mut BitReader) -> Result<(), Error> {
    for size_id in 0..4 {
        let matrices = if size_id == 3 { 2 } else { 6 };
        for _ in 0..matrices {
            if r.read_bit()? == 0 {
                r.read_ue()?; // scaling_list_pred_matrix_id_delta
            } else {
                let coeffs = std::cmp::min(64, 1 << (4 + (size_id << 1)));
                if size_id > 1 {
                    r.read_se()?; // scaling_list_dc_coef_minus8
                }
                for _ in 0..coeffs {
                    r.read_se()?; // scaling_list_delta_coef
                }
            }
        }
    }
    Ok(())
}

// st_ref_pic_set(), ISO/IEC 23008-2 section 7.3.7.
fn parse_st_ref_pic_set(
    r: &mut BitReader,
    idx: usize,
    num_sets: u64,
    num_delta_pocs: &mut [u32; 64],
) -> Result<(), Error> {
    if idx > 0 && r.read_bit()? == 1 {
        // inter_ref_pic_set_prediction_flag
        if idx > num_sets as usize {
            bail!(DataLoss, msg("st_ref_pic_set index out of range"));
        }
        r.skip(1)?; // delta_rps_sign
        r.read_ue()?; // abs_delta_rps_minus1
        let mut count = 0;
        for _ in 0..=num_delta_pocs[idx - 1] {
            let used_by_curr_pic = r.read_bit()?;
            let mut use_delta = 0;
            if used_by_curr_pic == 0 {
                use_delta = r.read_bit()?;
            }
            if used_by_curr_pic == 1 || use_delta == 1 {
                count += 1;
            }
        }
        num_delta_pocs[idx] = count;
    } else {
        let num_negative = r.read_ue()?;
        let num_positive = r.read_ue()?;
        if (num_negative + num_positive) * 2 > r.remaining_bits() as u64 {
            bail!(DataLoss, msg("st_ref_pic_set counts overflow buffer"));
        }
        for _ in 0..num_negative {
            r.read_ue()?; // delta_poc_s0_minus1
            r.skip(1)?; // used_by_curr_pic_s0_flag
        }
        for _ in 0..num_positive {
            r.read_ue()?; // delta_poc_s1_minus1
            r.skip(1)?; // used_by_curr_pic_s1_flag
        }
        num_delta_pocs[idx] = (num_negative + num_positive) as u32;
    }
    Ok(())
}

fn parse_vui(r: &mut BitReader, max_sub_layers_minus1: u8) -> Result<Vui, Error> {
    let mut vui = Vui::default();
    if r.read_bit()? == 1 {
        // aspect_ratio_info_present_flag
        if r.read_u8(8)? == 255 {
            r.skip(32)?; // sar_width + sar_height
        }
    }
    if r.read_bit()? == 1 {
        r.skip(1)?; // overscan_appropriate_flag
    }
    if r.read_bit()? == 1 {
        // video_signal_type_present_flag
        r.skip(4)?; // video_format + video_full_range_flag
        if r.read_bit()? == 1 {
            r.skip(24)?; // colour primaries/transfer/matrix
        }
    }
    if r.read_bit()? == 1 {
        // chroma_loc_info_present_flag
        r.read_ue()?;
        r.read_ue()?;
    }
    r.skip(1)?; // neutral_chroma_indication_flag
    r.skip(1)?; // field_seq_flag
    r.skip(1)?; // frame_field_info_present_flag
    if r.read_bit()? == 1 {
        // default_display_window_flag
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
    }
    if r.read_bit()? == 1 {
        // vui_timing_info_present_flag
        r.skip(32)?; // vui_num_units_in_tick
        r.skip(32)?; // vui_time_scale
        if r.read_bit()? == 1 {
            r.read_ue()?; // vui_num_ticks_poc_diff_one_minus1
        }
        if r.read_bit()? == 1 {
            skip_hrd_parameters(r, max_sub_layers_minus1)?;
        }
    }
    if r.read_bit()? == 1 {
        // bitstream_restriction_flag
        r.skip(1)?; // tiles_fixed_structure_flag
        r.skip(1)?; // motion_vectors_over_pic_boundaries_flag
        r.skip(1)?; // restricted_ref_pic_lists_flag
        vui.min_spatial_segmentation_idc = Some(r.read_ue()?);
        r.read_ue()?; // max_bytes_per_pic_denom
        r.read_ue()?; // max_bits_per_min_cu_denom
        r.read_ue()?; // log2_max_mv_length_horizontal
        r.read_ue()?; // log2_max_mv_length_vertical
    }
    Ok(vui)
}

fn skip_hrd_parameters(r: &mut BitReader, max_sub_layers_minus1: u8) -> Result<(), Error> {
    let nal_hrd = r.read_bit()?;
    let vcl_hrd = r.read_bit()?;
    let mut sub_pic_hrd = 0;
    if nal_hrd == 1 || vcl_hrd == 1 {
        sub_pic_hrd = r.read_bit()?;
        if sub_pic_hrd == 1 {
            r.skip(19)?; // tick_divisor .. dpb_output_delay_du_length
        }
        r.skip(8)?; // bit_rate_scale + cpb_size_scale
        if sub_pic_hrd == 1 {
            r.skip(4)?; // cpb_size_du_scale
        }
        r.skip(15)?; // initial/au/dpb delay lengths
    }
    for _ in 0..=max_sub_layers_minus1 {
        let fixed_rate_general = r.read_bit()?;
        let mut fixed_rate_cvs = 0;
        if fixed_rate_general == 0 {
            fixed_rate_cvs = r.read_bit()?;
        }
        let mut low_delay = 0;
        if fixed_rate_cvs == 1 {
            r.read_ue()?; // elemental_duration_in_tc_minus1
        } else {
            low_delay = r.read_bit()?;
        }
        let mut cpb_cnt_minus1 = 0;
        if low_delay == 0 {
            cpb_cnt_minus1 = r.read_ue()?;
            if cpb_cnt_minus1 > 31 {
                bail!(DataLoss, msg("cpb_cnt_minus1 {} > 31", cpb_cnt_minus1));
            }
        }
        let skip_sub_layer = |r: &mut BitReader| -> Result<(), Error> {
            for _ in 0..=cpb_cnt_minus1 {
                r.read_ue()?; // bit_rate_value_minus1
                r.read_ue()?; // cpb_size_value_minus1
                if sub_pic_hrd == 1 {
                    r.read_ue()?;
                    r.read_ue()?;
                }
                r.skip(1)?; // cbr_flag
            }
            Ok(())
        };
        if nal_hrd == 1 {
            skip_sub_layer(r)?;
        }
        if vcl_hrd == 1 {
            skip_sub_layer(r)?;
        }
    }
    Ok(())
}

/// Returns `vps_video_parameter_set_id` of an encoded VPS NAL unit.
pub fn vps_id(unit: &[u8]) -> Result<u8, Error> {
    if unit.len() < 3 {
        bail!(OutOfRange, msg("VPS too short"));
    }
    Ok(unit[2] >> 4)
}

/// Returns `sps_seq_parameter_set_id`; requires a full parse because the id
/// sits after the variable-length profile_tier_level.
pub fn sps_id(unit: &[u8]) -> Result<u64, Error> {
    Ok(Sps::parse(unit)?.id)
}

/// Returns `pps_pic_parameter_set_id` of an encoded PPS NAL unit.
pub fn pps_id(unit: &[u8]) -> Result<u64, Error> {
    if unit.len() < 3 {
        bail!(OutOfRange, msg("PPS too short"));
    }
    let rbsp = nal::decode_rbsp(unit);
    let mut r = BitReader::new(&rbsp);
    r.skip(16)?;
    r.read_ue()
}

/// One NAL-unit array inside the record, keyed by NAL type.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NalUnitArray {
    pub array_completeness: u8,
    pub nal_unit_type: u8,
    pub units: Vec<Vec<u8>>,
}

/// An `HEVCDecoderConfigurationRecord`, ISO/IEC 14496-15 section 8.3.3.1.2.
#[derive(Clone, Debug)]
pub struct HevcDecoderConfigurationRecord {
    pub configuration_version: u8,
    pub general_profile_space: u8,
    pub general_tier_flag: u8,
    pub general_profile_idc: u8,
    pub general_profile_compatibility_flags: u32,
    pub general_constraint_indicator_flags: u64,
    pub general_level_idc: u8,
    pub min_spatial_segmentation_idc: u16,
    pub parallelism_type: u8,
    pub chroma_format: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub avg_frame_rate: u16,
    pub constant_frame_rate: u8,
    pub num_temporal_layers: u8,
    pub temporal_id_nested: u8,
    pub length_size_minus_one: u8,
    pub arrays: Vec<NalUnitArray>,
}

impl Default for HevcDecoderConfigurationRecord {
    fn default() -> Self {
        HevcDecoderConfigurationRecord {
            configuration_version: 1,
            general_profile_space: 0,
            general_tier_flag: 0,
            general_profile_idc: 0,
            general_profile_compatibility_flags: 0xffff_ffff,
            general_constraint_indicator_flags: 0xffff_ffff_ffff,
            general_level_idc: 0,
            min_spatial_segmentation_idc: 4097,
            parallelism_type: 0,
            chroma_format: 0,
            bit_depth_luma_minus8: 0,
            bit_depth_chroma_minus8: 0,
            avg_frame_rate: 0,
            constant_frame_rate: 0,
            num_temporal_layers: 0,
            temporal_id_nested: 0,
            length_size_minus_one: 3,
            arrays: Vec::new(),
        }
    }
}

impl HevcDecoderConfigurationRecord {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }

    /// Stores or replaces a unit in the array for `nal_unit_type`, matching
    /// by parameter-set id. Returns true if stored bytes changed.
    fn update_unit<F>(&mut self, nal_unit_type: u8, unit: &[u8], same_id: F) -> Result<bool, Error>
    where
        F: Fn(&[u8]) -> Result<bool, Error>,
    {
        for array in &mut self.arrays {
            if array.nal_unit_type != nal_unit_type {
                continue;
            }
            for existing in &mut array.units {
                if !same_id(existing)? {
                    continue;
                }
                if existing.as_slice() == unit {
                    return Ok(false);
                }
                *existing = unit.to_vec();
                return Ok(true);
            }
            array.units.push(unit.to_vec());
            return Ok(true);
        }
        // First unit of this type: the array is created complete, as all
        // parameter sets of the stream land in the record.
        self.arrays.push(NalUnitArray {
            array_completeness: 1,
            nal_unit_type,
            units: vec![unit.to_vec()],
        });
        Ok(true)
    }

    /// Returns true if the stored bytes changed.
    pub fn update_vps(&mut self, unit: &[u8]) -> Result<bool, Error> {
        let vps = Vps::parse(unit)?;
        let changed = self.update_unit(NAL_VPS, unit, |u| Ok(vps_id(u)? == vps.id))?;
        if changed {
            self.num_temporal_layers =
                std::cmp::max(self.num_temporal_layers, vps.max_layers_minus1 + 1);
            self.update_ptl(&vps.ptl);
        }
        Ok(changed)
    }

    /// Returns true if the stored bytes changed.
    pub fn update_sps(&mut self, unit: &[u8]) -> Result<bool, Error> {
        let sps = Sps::parse(unit)?;
        let changed = self.update_unit(NAL_SPS, unit, |u| Ok(sps_id(u)? == sps.id))?;
        if changed {
            self.num_temporal_layers =
                std::cmp::max(self.num_temporal_layers, sps.max_sub_layers_minus1 + 1);
            self.temporal_id_nested = sps.temporal_id_nesting;
            self.chroma_format = sps.chroma_format_idc as u8;
            self.bit_depth_luma_minus8 = sps.bit_depth_luma_minus8 as u8;
            self.bit_depth_chroma_minus8 = sps.bit_depth_chroma_minus8 as u8;
            self.update_ptl(&sps.ptl);
            if let Some(msi) = sps.vui.min_spatial_segmentation_idc {
                self.min_spatial_segmentation_idc =
                    std::cmp::min(self.min_spatial_segmentation_idc, msi as u16);
            }
        }
        Ok(changed)
    }

    /// Returns true if the stored bytes changed.
    pub fn update_pps(&mut self, unit: &[u8]) -> Result<bool, Error> {
        let pps = Pps::parse(unit)?;
        let changed = self.update_unit(NAL_PPS, unit, |u| Ok(pps_id(u)? == pps.id))?;
        if changed {
            // ffmpeg hevc.c: derive parallelismType from the PPS tools.
            self.parallelism_type = match (pps.tiles_enabled, pps.entropy_coding_sync_enabled) {
                (true, true) => 0,  // mixed
                (false, true) => 3, // wavefront
                (true, false) => 2, // tile
                (false, false) => 1, // slice
            };
        }
        Ok(changed)
    }

    fn update_ptl(&mut self, ptl: &ProfileTierLevel) {
        self.general_profile_space = ptl.general_profile_space;
        if self.general_tier_flag < ptl.general_tier_flag {
            // A higher tier dominates whatever level we'd seen at the lower
            // one.
            self.general_level_idc = ptl.general_level_idc;
        } else {
            self.general_level_idc =
                std::cmp::max(self.general_level_idc, ptl.general_level_idc);
        }
        self.general_tier_flag = std::cmp::max(self.general_tier_flag, ptl.general_tier_flag);
        self.general_profile_idc =
            std::cmp::max(self.general_profile_idc, ptl.general_profile_idc);
        self.general_profile_compatibility_flags &= ptl.general_profile_compatibility_flags;
        self.general_constraint_indicator_flags &= ptl.general_constraint_indicator_flags;
    }

    /// Encodes the record; needs at least the three parameter-set arrays.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        if self.arrays.len() < 3 {
            bail!(
                FailedPrecondition,
                msg("record needs VPS, SPS, and PPS; have {} arrays", self.arrays.len())
            );
        }
        let mut w = BitWriter::with_capacity(512);
        w.put_u8(self.configuration_version);
        w.put_bits(self.general_profile_space as u64, 2);
        w.put_bits(self.general_tier_flag as u64, 1);
        w.put_bits(self.general_profile_idc as u64, 5);
        w.put_bits(self.general_profile_compatibility_flags as u64, 32);
        w.put_bits(self.general_constraint_indicator_flags, 48);
        w.put_u8(self.general_level_idc);
        w.put_bits(0x0f, 4);
        // parallelismType only means something under a spatial-segmentation
        // bound; without one, declare it unknown.
        let parallelism = if self.min_spatial_segmentation_idc == 0 {
            0
        } else {
            self.parallelism_type
        };
        w.put_bits(self.min_spatial_segmentation_idc as u64, 12);
        w.put_bits(0x3f, 6);
        w.put_bits(parallelism as u64, 2);
        w.put_bits(0x3f, 6);
        w.put_bits(self.chroma_format as u64, 2);
        w.put_bits(0x1f, 5);
        w.put_bits(self.bit_depth_luma_minus8 as u64, 3);
        w.put_bits(0x1f, 5);
        w.put_bits(self.bit_depth_chroma_minus8 as u64, 3);
        w.put_bits(self.avg_frame_rate as u64, 16);
        w.put_bits(self.constant_frame_rate as u64, 2);
        w.put_bits(self.num_temporal_layers as u64, 3);
        w.put_bits(self.temporal_id_nested as u64, 1);
        w.put_bits(self.length_size_minus_one as u64, 2);
        w.put_u8(self.arrays.len() as u8);
        for array in &self.arrays {
            w.put_bits(array.array_completeness as u64, 1);
            w.put_bits(0, 1);
            w.put_bits(array.nal_unit_type as u64, 6);
            w.put_bits(array.units.len() as u64, 16);
            for unit in &array.units {
                w.put_bits(unit.len() as u64, 16);
                w.put_bytes(unit);
            }
        }
        Ok(w.into_vec())
    }

    /// Parses a stored record, e.g. from an `hvcC` box or FLV sequence
    /// header.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let mut r = BitReader::new(data);
        let mut record = HevcDecoderConfigurationRecord {
            configuration_version: r.read_u8(8)?,
            general_profile_space: r.read_u8(2)?,
            general_tier_flag: r.read_u8(1)?,
            general_profile_idc: r.read_u8(5)?,
            general_profile_compatibility_flags: r.read_u32(32)?,
            general_constraint_indicator_flags: r.read_bits(48)?,
            general_level_idc: r.read_u8(8)?,
            ..Default::default()
        };
        r.skip(4)?;
        record.min_spatial_segmentation_idc = r.read_u16(12)?;
        r.skip(6)?;
        record.parallelism_type = r.read_u8(2)?;
        r.skip(6)?;
        record.chroma_format = r.read_u8(2)?;
        r.skip(5)?;
        record.bit_depth_luma_minus8 = r.read_u8(3)?;
        r.skip(5)?;
        record.bit_depth_chroma_minus8 = r.read_u8(3)?;
        record.avg_frame_rate = r.read_u16(16)?;
        record.constant_frame_rate = r.read_u8(2)?;
        record.num_temporal_layers = r.read_u8(3)?;
        record.temporal_id_nested = r.read_u8(1)?;
        record.length_size_minus_one = r.read_u8(2)?;
        let num_arrays = r.read_u8(8)?;
        for _ in 0..num_arrays {
            let array_completeness = r.read_bit()?;
            r.skip(1)?;
            let nal_unit_type = r.read_u8(6)?;
            let num_units = r.read_u16(16)?;
            let mut units = Vec::with_capacity(num_units as usize);
            for _ in 0..num_units {
                let len = r.read_u16(16)? as usize;
                units.push(r.read_bytes(len)?.to_vec());
            }
            record.arrays.push(NalUnitArray {
                array_completeness,
                nal_unit_type,
                units,
            });
        }
        Ok(record)
    }

    /// Flattens all stored NAL units to Annex B, in VPS, SPS, PPS order.
    pub fn to_annex_b(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for want in [NAL_VPS, NAL_SPS, NAL_PPS] {
            for array in &self.arrays {
                if array.nal_unit_type != want {
                    continue;
                }
                for unit in &array.units {
                    out.extend_from_slice(&[0, 0, 0, 1]);
                    out.extend_from_slice(unit);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, h265};

    #[test]
    fn parse_vps() {
        testutil::init();
        let vps = Vps::parse(&h265::vps()).unwrap();
        assert_eq!(vps.id, 0);
        assert_eq!(vps.max_layers_minus1, 0);
        assert_eq!(vps.ptl.general_profile_idc, 1);
        assert_eq!(vps.ptl.general_level_idc, 93);
        assert_eq!(vps_id(&h265::vps()).unwrap(), 0);
    }

    #[test]
    fn parse_sps() {
        testutil::init();
        let sps = Sps::parse(&h265::sps()).unwrap();
        assert_eq!(sps.id, 0);
        assert_eq!((sps.width, sps.height), (1920, 1080));
        assert_eq!(sps.chroma_format_idc, 1);
        assert_eq!(sps.bit_depth_luma_minus8, 0);
        assert_eq!(sps.ptl.general_profile_idc, 1);
        assert_eq!(sps.vui.min_spatial_segmentation_idc, None);
    }

    #[test]
    fn parse_pps() {
        testutil::init();
        let pps = Pps::parse(&h265::pps(true, false)).unwrap();
        assert_eq!(pps.id, 0);
        assert_eq!(pps.sps_id, 0);
        assert!(pps.tiles_enabled);
        assert!(!pps.entropy_coding_sync_enabled);
        assert_eq!(pps_id(&h265::pps(true, false)).unwrap(), 0);
    }

    #[test]
    fn record_update_and_encode() {
        testutil::init();
        let mut record = HevcDecoderConfigurationRecord::new();
        record.update_vps(&h265::vps()).unwrap();
        record.update_sps(&h265::sps()).unwrap();
        record.update_pps(&h265::pps(true, false)).unwrap();

        let types: Vec<u8> = record.arrays.iter().map(|a| a.nal_unit_type).collect();
        assert_eq!(types, vec![NAL_VPS, NAL_SPS, NAL_PPS]);
        assert!(record.arrays.iter().all(|a| a.array_completeness == 1));
        assert_eq!(record.parallelism_type, 2); // tiles only
        assert_eq!(record.num_temporal_layers, 1);
        assert_eq!(record.chroma_format, 1);

        let encoded = record.encode().unwrap();
        let parsed = HevcDecoderConfigurationRecord::parse(&encoded).unwrap();
        assert_eq!(parsed.parallelism_type, 2);
        assert_eq!(parsed.general_level_idc, 93);
        assert_eq!(parsed.length_size_minus_one, 3);
        assert_eq!(parsed.arrays.len(), 3);
        assert_eq!(parsed.arrays[0].units[0], h265::vps());
    }

    #[test]
    fn record_needs_all_three_sets() {
        let mut record = HevcDecoderConfigurationRecord::new();
        record.update_sps(&h265::sps()).unwrap();
        let e = record.encode().unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::FailedPrecondition);
    }

    #[test]
    fn record_to_annex_b_orders_sets() {
        let mut record = HevcDecoderConfigurationRecord::new();
        // Insert out of order; flattening still yields VPS, SPS, PPS.
        record.update_pps(&h265::pps(false, false)).unwrap();
        record.update_sps(&h265::sps()).unwrap();
        record.update_vps(&h265::vps()).unwrap();
        let annexb = record.to_annex_b();
        let mut types = Vec::new();
        crate::nal::split_annex_b(&annexb, |unit| {
            types.push(nal_type(unit));
            Ok(())
        })
        .unwrap();
        assert_eq!(types, vec![NAL_VPS, NAL_SPS, NAL_PPS]);
    }

    #[test]
    fn parallelism_variants() {
        for (tiles, sync, want) in
            [(true, true, 0), (false, true, 3), (true, false, 2), (false, false, 1)]
        {
            let mut record = HevcDecoderConfigurationRecord::new();
            record.update_pps(&h265::pps(tiles, sync)).unwrap();
            assert_eq!(record.parallelism_type, want, "tiles={tiles} sync={sync}");
        }
    }

    #[test]
    fn au_boundaries() {
        // IDR_W_RADL with first_slice_segment_in_pic_flag set.
        let idr = [0x26, 0x01, 0xaf, 0x00];
        assert_eq!(nal_type(&idr), NAL_IDR_W_RADL);
        assert!(is_irap(nal_type(&idr)));
        assert!(first_slice_segment_in_pic(&idr));
        assert!(is_new_access_unit(&idr));
        // Same type, continuation slice segment.
        let cont = [0x26, 0x01, 0x2f, 0x00];
        assert!(!first_slice_segment_in_pic(&cont));
        assert!(!is_new_access_unit(&cont));
    }
}
