// This file is part of Moonfire Remux, a media container remuxing toolkit.
// Copyright (C) 2024 The Moonfire Remux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use std::sync::Once;

static INIT: Once = Once::new();

/// Performs global initialization for tests:
///
/// * set up logging. (Note the output can be confusing unless
///   `RUST_TEST_THREADS=1` is set in the program's environment prior to
///   running.)
pub(crate) fn init() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A 1280x720 H.264 SPS captured from a Dahua camera stream.
#[rustfmt::skip]
pub(crate) const H264_SPS: [u8; 23] = [
    0x67, 0x4d, 0x00, 0x1f, 0x9a, 0x66, 0x02, 0x80,
    0x2d, 0xff, 0x35, 0x01, 0x01, 0x01, 0x40, 0x00,
    0x00, 0xfa, 0x00, 0x00, 0x1d, 0x4c, 0x01,
];

#[rustfmt::skip]
pub(crate) const H264_PPS: [u8; 4] = [0x68, 0xee, 0x3c, 0x80];

/// A (truncated) H.264 IDR slice; enough for NAL-type and slice-header
/// probing.
#[rustfmt::skip]
pub(crate) const H264_IDR: [u8; 20] = [
    0x65, 0x88, 0x80, 0x10, 0x00, 0x08, 0x7f, 0x00,
    0x5d, 0x27, 0xb5, 0xc1, 0xff, 0x8c, 0xd6, 0x35,
    0x0e, 0x11, 0x8a, 0x40,
];

/// A (truncated) H.264 non-IDR slice with `first_mb_in_slice` == 0.
#[rustfmt::skip]
pub(crate) const H264_NON_IDR: [u8; 12] = [
    0x41, 0x9a, 0x02, 0x04, 0x51, 0x3b, 0x1c, 0x40,
    0x9d, 0x22, 0x60, 0x35,
];

/// Synthetic H.265 parameter sets: 1920x1080 Main profile, level 3.1, and a
/// PPS with configurable tile/wavefront flags. Built bit-by-bit following
/// ISO/IEC 23008-2 section 7.3 so parser tests have known field values.
pub(crate) mod h265 {
    use crate::bitio::BitWriter;

    fn write_ue(w: &mut BitWriter, v: u64) {
        let code = v + 1;
        let bits = 64 - code.leading_zeros() as usize;
        for _ in 0..bits - 1 {
            w.put_bit(0);
        }
        w.put_bits(code, bits);
    }

    fn write_se(w: &mut BitWriter, v: i64) {
        let ue = if v <= 0 {
            (-v as u64) * 2
        } else {
            (v as u64) * 2 - 1
        };
        write_ue(w, ue);
    }

    fn finish_rbsp(mut w: BitWriter) -> Vec<u8> {
        w.put_bit(1); // rbsp_stop_one_bit
        while w.bits_since_mark() % 8 != 0 {
            w.put_bit(0);
        }
        w.into_vec()
    }

    fn write_ptl(w: &mut BitWriter) {
        w.put_bits(0, 2); // general_profile_space
        w.put_bit(0); // general_tier_flag
        w.put_bits(1, 5); // general_profile_idc = Main
        w.put_bits(0x6000_0000, 32); // compatibility flags
        w.put_bits(0xb000_0000_0000, 48); // constraint flags
        w.put_bits(93, 8); // general_level_idc = 3.1
    }

    pub(crate) fn vps() -> Vec<u8> {
        let mut w = BitWriter::new();
        w.mark();
        w.put_bytes(&[0x40, 0x01]); // nal header: type 32
        w.put_bits(0, 4); // vps_video_parameter_set_id
        w.put_bit(1); // vps_base_layer_internal_flag
        w.put_bit(1); // vps_base_layer_available_flag
        w.put_bits(0, 6); // vps_max_layers_minus1
        w.put_bits(0, 3); // vps_max_sub_layers_minus1
        w.put_bit(1); // vps_temporal_id_nesting_flag
        w.put_bits(0xffff, 16);
        write_ptl(&mut w);
        w.put_bit(1); // vps_sub_layer_ordering_info_present_flag
        write_ue(&mut w, 4); // vps_max_dec_pic_buffering_minus1
        write_ue(&mut w, 2); // vps_max_num_reorder_pics
        write_ue(&mut w, 0); // vps_max_latency_increase_plus1
        w.put_bits(0, 6); // vps_max_layer_id
        write_ue(&mut w, 0); // vps_num_layer_sets_minus1
        w.put_bit(0); // vps_timing_info_present_flag
        finish_rbsp(w)
    }

    pub(crate) fn sps() -> Vec<u8> {
        let mut w = BitWriter::new();
        w.mark();
        w.put_bytes(&[0x42, 0x01]); // nal header: type 33
        w.put_bits(0, 4); // sps_video_parameter_set_id
        w.put_bits(0, 3); // sps_max_sub_layers_minus1
        w.put_bit(1); // sps_temporal_id_nesting_flag
        write_ptl(&mut w);
        write_ue(&mut w, 0); // sps_seq_parameter_set_id
        write_ue(&mut w, 1); // chroma_format_idc = 4:2:0
        write_ue(&mut w, 1920); // pic_width_in_luma_samples
        write_ue(&mut w, 1080); // pic_height_in_luma_samples
        w.put_bit(0); // conformance_window_flag
        write_ue(&mut w, 0); // bit_depth_luma_minus8
        write_ue(&mut w, 0); // bit_depth_chroma_minus8
        write_ue(&mut w, 4); // log2_max_pic_order_cnt_lsb_minus4
        w.put_bit(1); // sps_sub_layer_ordering_info_present_flag
        write_ue(&mut w, 4);
        write_ue(&mut w, 2);
        write_ue(&mut w, 0);
        write_ue(&mut w, 0); // log2_min_luma_coding_block_size_minus3
        write_ue(&mut w, 3); // log2_diff_max_min_luma_coding_block_size
        write_ue(&mut w, 0); // log2_min_transform_block_size_minus2
        write_ue(&mut w, 3); // log2_diff_max_min_transform_block_size
        write_ue(&mut w, 0); // max_transform_hierarchy_depth_inter
        write_ue(&mut w, 0); // max_transform_hierarchy_depth_intra
        w.put_bit(0); // scaling_list_enabled_flag
        w.put_bit(0); // amp_enabled_flag
        w.put_bit(0); // sample_adaptive_offset_enabled_flag
        w.put_bit(0); // pcm_enabled_flag
        write_ue(&mut w, 0); // num_short_term_ref_pic_sets
        w.put_bit(0); // long_term_ref_pics_present_flag
        w.put_bit(0); // sps_temporal_mvp_enabled_flag
        w.put_bit(0); // strong_intra_smoothing_enabled_flag
        w.put_bit(1); // vui_parameters_present_flag
        w.put_bit(0); // aspect_ratio_info_present_flag
        w.put_bit(0); // overscan_info_present_flag
        w.put_bit(0); // video_signal_type_present_flag
        w.put_bit(0); // chroma_loc_info_present_flag
        w.put_bit(0); // neutral_chroma_indication_flag
        w.put_bit(0); // field_seq_flag
        w.put_bit(0); // frame_field_info_present_flag
        w.put_bit(0); // default_display_window_flag
        w.put_bit(0); // vui_timing_info_present_flag
        w.put_bit(0); // bitstream_restriction_flag
        finish_rbsp(w)
    }

    pub(crate) fn pps(tiles: bool, sync: bool) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.mark();
        w.put_bytes(&[0x44, 0x01]); // nal header: type 34
        write_ue(&mut w, 0); // pps_pic_parameter_set_id
        write_ue(&mut w, 0); // pps_seq_parameter_set_id
        w.put_bit(0); // dependent_slice_segments_enabled_flag
        w.put_bit(0); // output_flag_present_flag
        w.put_bits(0, 3); // num_extra_slice_header_bits
        w.put_bit(0); // sign_data_hiding_enabled_flag
        w.put_bit(0); // cabac_init_present_flag
        write_ue(&mut w, 0); // num_ref_idx_l0_default_active_minus1
        write_ue(&mut w, 0); // num_ref_idx_l1_default_active_minus1
        write_se(&mut w, 0); // init_qp_minus26
        w.put_bit(0); // constrained_intra_pred_flag
        w.put_bit(0); // transform_skip_enabled_flag
        w.put_bit(0); // cu_qp_delta_enabled_flag
        write_se(&mut w, 0); // pps_cb_qp_offset
        write_se(&mut w, 0); // pps_cr_qp_offset
        w.put_bit(0); // pps_slice_chroma_qp_offsets_present_flag
        w.put_bit(0); // weighted_pred_flag
        w.put_bit(0); // weighted_bipred_flag
        w.put_bit(0); // transquant_bypass_enabled_flag
        w.put_bit(tiles as u8); // tiles_enabled_flag
        w.put_bit(sync as u8); // entropy_coding_sync_enabled_flag
        finish_rbsp(w)
    }

    /// A minimal IDR_W_RADL slice fragment: first_slice_segment_in_pic set.
    pub(crate) fn idr_slice() -> Vec<u8> {
        vec![0x26, 0x01, 0xaf, 0x1b, 0x80, 0x00, 0x40]
    }
}
