// This file is part of Moonfire Remux, a media container remuxing toolkit.
// Copyright (C) 2024 The Moonfire Remux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! H.264 parameter parsing.
//!
//! The containers mostly don't try to understand the video codec, but H.264
//! has two byte stream encodings: ISO/IEC 14496-10 Annex B, and ISO/IEC
//! 14496-15 AVC access units. FLV, `.mp4`, and the parameter-set caches need
//! conversion between them, plus just enough SPS/PPS decoding to build an
//! `AVCDecoderConfigurationRecord` (ISO/IEC 14496-15 section 5.2.4.1) and to
//! find access-unit boundaries.

use crate::bitio::BitReader;
use crate::nal;
use base::{bail, Error};
use smallvec::SmallVec;

// See ISO/IEC 14496-10 table 7-1 - NAL unit type codes, syntax element
// categories, and NAL unit type classes.
pub const NAL_SLICE: u8 = 1;
pub const NAL_DPA: u8 = 2;
pub const NAL_DPB: u8 = 3;
pub const NAL_DPC: u8 = 4;
pub const NAL_IDR_SLICE: u8 = 5;
pub const NAL_SEI: u8 = 6;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;

const NAL_UNIT_TYPE_MASK: u8 = 0x1F; // bottom 5 bits of first byte of unit.

/// An access unit delimiter NAL with `primary_pic_type` = anything, as ffmpeg
/// writes when the encoder didn't supply one.
pub const AUD_NAL: [u8; 6] = [0x00, 0x00, 0x00, 0x01, 0x09, 0xF0];

/// NAL type of a unit that does not begin with a start code.
pub fn nal_type(unit: &[u8]) -> u8 {
    unit.first().map(|b| b & NAL_UNIT_TYPE_MASK).unwrap_or(0)
}

/// NAL type of a buffer that may or may not begin with a start code.
pub fn nal_type_skipping_start_code(data: &[u8]) -> u8 {
    match nal::next_start_code(data, 0) {
        Some((0, sc)) => nal_type(&data[sc..]),
        _ => nal_type(data),
    }
}

pub fn is_vcl(nal_type: u8) -> bool {
    (NAL_SLICE..=NAL_IDR_SLICE).contains(&nal_type)
}

/// True iff the Annex B buffer contains an IDR slice.
pub fn is_idr_frame(annexb: &[u8]) -> bool {
    let mut idr = false;
    let _ = nal::split_annex_b(annexb, |unit| {
        if nal_type(unit) == NAL_IDR_SLICE {
            idr = true;
        }
        Ok(())
    });
    idr
}

/// Reads `first_mb_in_slice` from a slice NAL unit (without start code).
///
/// A value of zero means the slice starts a new access unit; see ISO/IEC
/// 14496-10 section 7.4.1.2.4.
pub fn first_mb_in_slice(unit: &[u8]) -> Result<u64, Error> {
    if unit.len() < 2 {
        bail!(OutOfRange, msg("slice NAL too short"));
    }
    let mut r = BitReader::new(&unit[1..]);
    r.read_ue()
}

/// The "new access unit starts here" predicate of ISO/IEC 14496-10 section
/// 7.4.1.2.3, reduced to what's detectable without decoding: parameter
/// sets/SEI/AUD always open a new AU; a VCL NAL opens one iff its
/// `first_mb_in_slice` is zero.
pub fn is_new_access_unit(unit: &[u8]) -> bool {
    match nal_type(unit) {
        NAL_AUD | NAL_SPS | NAL_PPS | NAL_SEI => true,
        t if is_vcl(t) => matches!(first_mb_in_slice(unit), Ok(0)),
        _ => false,
    }
}

/// A few fields of a decoded sequence parameter set; see ISO/IEC 14496-10
/// section 7.3.2.1.1.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Sps {
    pub profile_idc: u8,
    pub constraint_flags: u8,
    pub level_idc: u8,
    pub id: u64,
    pub width: u32,
    pub height: u32,
}

impl Sps {
    /// Parses from an encoded SPS NAL unit (header byte first, no start
    /// code). Emulation-prevention bytes are stripped here.
    pub fn parse(unit: &[u8]) -> Result<Self, Error> {
        if unit.len() < 4 {
            bail!(OutOfRange, msg("SPS shorter than fixed header"));
        }
        if nal_type(unit) != NAL_SPS {
            bail!(DataLoss, msg("not an SPS: nal type {}", nal_type(unit)));
        }
        let rbsp = nal::decode_rbsp(&unit[1..]);
        let mut r = BitReader::new(&rbsp);
        let profile_idc = r.read_u8(8)?;
        let constraint_flags = r.read_u8(8)?;
        let level_idc = r.read_u8(8)?;
        let id = r.read_ue()?;

        let mut chroma_format_idc = 1; // 4:2:0 unless the profile says otherwise
        let mut separate_colour_plane = false;
        if matches!(
            profile_idc,
            100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
        ) {
            chroma_format_idc = r.read_ue()?;
            if chroma_format_idc == 3 {
                separate_colour_plane = r.read_bit()? == 1;
            }
            r.read_ue()?; // bit_depth_luma_minus8
            r.read_ue()?; // bit_depth_chroma_minus8
            r.skip(1)?; // qpprime_y_zero_transform_bypass_flag
            if r.read_bit()? == 1 {
                // seq_scaling_matrix_present_flag
                let lists = if chroma_format_idc == 3 { 12 } else { 8 };
                for i in 0..lists {
                    if r.read_bit()? == 1 {
                        skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                    }
                }
            }
        }

        r.read_ue()?; // log2_max_frame_num_minus4
        let pic_order_cnt_type = r.read_ue()?;
        if pic_order_cnt_type == 0 {
            r.read_ue()?; // log2_max_pic_order_cnt_lsb_minus4
        } else if pic_order_cnt_type == 1 {
            r.skip(1)?; // delta_pic_order_always_zero_flag
            r.read_se()?; // offset_for_non_ref_pic
            r.read_se()?; // offset_for_top_to_bottom_field
            let n = r.read_ue()?;
            for _ in 0..n {
                r.read_se()?; // offset_for_ref_frame
            }
        }
        r.read_ue()?; // max_num_ref_frames
        r.skip(1)?; // gaps_in_frame_num_value_allowed_flag
        let pic_width_in_mbs_minus1 = r.read_ue()?;
        let pic_height_in_map_units_minus1 = r.read_ue()?;
        let frame_mbs_only = r.read_bit()?;
        if frame_mbs_only == 0 {
            r.skip(1)?; // mb_adaptive_frame_field_flag
        }
        r.skip(1)?; // direct_8x8_inference_flag

        let mut width = (pic_width_in_mbs_minus1 as u32 + 1) * 16;
        let mut height =
            (2 - frame_mbs_only as u32) * (pic_height_in_map_units_minus1 as u32 + 1) * 16;
        if r.read_bit()? == 1 {
            // frame_cropping_flag; crop units per ISO/IEC 14496-10 table 6-1.
            let left = r.read_ue()? as u32;
            let right = r.read_ue()? as u32;
            let top = r.read_ue()? as u32;
            let bottom = r.read_ue()? as u32;
            let chroma_array_type = if separate_colour_plane {
                0
            } else {
                chroma_format_idc
            };
            let (sub_w, sub_h) = match chroma_array_type {
                0 => (1, 1),
                1 => (2, 2),
                2 => (2, 1),
                _ => (1, 1),
            };
            let unit_y = sub_h * (2 - frame_mbs_only as u32);
            width = width.saturating_sub((left + right) * sub_w);
            height = height.saturating_sub((top + bottom) * unit_y);
        }

        Ok(Sps {
            profile_idc,
            constraint_flags,
            level_idc,
            id,
            width,
            height,
        })
    }
}

fn skip_scaling_list(r: &mut BitReader, size: usize) -> Result<(), Error> {
    let mut last: i64 = 8;
    let mut next: i64 = 8;
    for _ in 0..size {
        if next != 0 {
            next = (last + r.read_se()? + 256) % 256;
        }
        if next != 0 {
            last = next;
        }
    }
    Ok(())
}

/// Returns `seq_parameter_set_id` of an encoded SPS NAL unit.
pub fn sps_id(unit: &[u8]) -> Result<u64, Error> {
    if unit.len() < 4 {
        bail!(OutOfRange, msg("SPS shorter than fixed header"));
    }
    let rbsp = nal::decode_rbsp(&unit[1..]);
    let mut r = BitReader::new(&rbsp);
    r.skip(24)?; // profile_idc, constraint flags, level_idc
    r.read_ue()
}

/// Returns `(pic_parameter_set_id, seq_parameter_set_id)` of an encoded PPS
/// NAL unit.
pub fn pps_id(unit: &[u8]) -> Result<(u64, u64), Error> {
    if unit.len() < 2 {
        bail!(OutOfRange, msg("PPS too short"));
    }
    let rbsp = nal::decode_rbsp(&unit[1..]);
    let mut r = BitReader::new(&rbsp);
    let pps = r.read_ue()?;
    let sps = r.read_ue()?;
    Ok((pps, sps))
}

/// An `AVCDecoderConfigurationRecord`, ISO/IEC 14496-15 section 5.2.4.1.
///
/// `sps`/`pps` hold encoded NAL units (header byte first, emulation
/// prevention intact), copied at insert time so nothing aliases an input
/// buffer.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AvcDecoderConfigurationRecord {
    pub sps: SmallVec<[Vec<u8>; 1]>,
    pub pps: SmallVec<[Vec<u8>; 1]>,
}

impl AvcDecoderConfigurationRecord {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn from_parameter_sets(sps: &[&[u8]], pps: &[&[u8]]) -> Self {
        AvcDecoderConfigurationRecord {
            sps: sps.iter().map(|s| s.to_vec()).collect(),
            pps: pps.iter().map(|p| p.to_vec()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sps.is_empty() && self.pps.is_empty()
    }

    /// Inserts or replaces by `seq_parameter_set_id`. Returns true if the
    /// record changed.
    pub fn update_sps(&mut self, unit: &[u8]) -> Result<bool, Error> {
        let id = sps_id(unit)?;
        for existing in &mut self.sps {
            if sps_id(existing)? == id {
                if existing.as_slice() == unit {
                    return Ok(false);
                }
                *existing = unit.to_vec();
                return Ok(true);
            }
        }
        self.sps.push(unit.to_vec());
        Ok(true)
    }

    /// Inserts or replaces by `pic_parameter_set_id`. Returns true if the
    /// record changed.
    pub fn update_pps(&mut self, unit: &[u8]) -> Result<bool, Error> {
        let (id, _) = pps_id(unit)?;
        for existing in &mut self.pps {
            if pps_id(existing)?.0 == id {
                if existing.as_slice() == unit {
                    return Ok(false);
                }
                *existing = unit.to_vec();
                return Ok(true);
            }
        }
        self.pps.push(unit.to_vec());
        Ok(true)
    }

    /// Encodes the record. The profile/compatibility/level bytes are taken
    /// from the first SPS, matching ffmpeg's `ff_isom_write_avcc`.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let first = match self.sps.first() {
            Some(s) if s.len() >= 4 && !self.pps.is_empty() => s,
            _ => bail!(FailedPrecondition, msg("no SPS/PPS to encode")),
        };
        let mut out = Vec::with_capacity(64);
        out.push(1); // configurationVersion
        out.push(first[1]); // AVCProfileIndication
        out.push(first[2]); // profile_compatibility
        out.push(first[3]); // AVCLevelIndication
        out.push(0xff); // reserved + lengthSizeMinusOne=3, matching 4-byte sample lengths
        out.push(0xe0 | (self.sps.len() as u8 & 0x1f));
        for s in &self.sps {
            out.extend_from_slice(&(s.len() as u16).to_be_bytes());
            out.extend_from_slice(s);
        }
        out.push(self.pps.len() as u8);
        for p in &self.pps {
            out.extend_from_slice(&(p.len() as u16).to_be_bytes());
            out.extend_from_slice(p);
        }
        Ok(out)
    }

    /// Parses a stored record, e.g. from an `avcC` box or FLV sequence header.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 7 {
            bail!(OutOfRange, msg("AVCDecoderConfigurationRecord too short"));
        }
        if data[0] != 1 {
            bail!(DataLoss, msg("bad configurationVersion {}", data[0]));
        }
        let mut record = AvcDecoderConfigurationRecord::new();
        let num_sps = (data[5] & 0x1f) as usize;
        let mut pos = 6;
        let mut take = |pos: &mut usize| -> Result<Vec<u8>, Error> {
            if data.len() < *pos + 2 {
                bail!(OutOfRange, msg("truncated parameter set length"));
            }
            let len = u16::from_be_bytes([data[*pos], data[*pos + 1]]) as usize;
            *pos += 2;
            if data.len() < *pos + len {
                bail!(OutOfRange, msg("truncated parameter set"));
            }
            let v = data[*pos..*pos + len].to_vec();
            *pos += len;
            Ok(v)
        };
        for _ in 0..num_sps {
            record.sps.push(take(&mut pos)?);
        }
        if data.len() < pos + 1 {
            bail!(OutOfRange, msg("missing PPS count"));
        }
        let num_pps = data[pos] as usize;
        pos += 1;
        for _ in 0..num_pps {
            record.pps.push(take(&mut pos)?);
        }
        Ok(record)
    }

    /// Flattens stored parameter sets to Annex B, SPS first.
    pub fn to_annex_b(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for unit in self.sps.iter().chain(self.pps.iter()) {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(unit);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[rustfmt::skip]
    const TEST_SPS: [u8; 23] = [
        0x67, 0x4d, 0x00, 0x1f, 0x9a, 0x66, 0x02, 0x80,
        0x2d, 0xff, 0x35, 0x01, 0x01, 0x01, 0x40, 0x00,
        0x00, 0xfa, 0x00, 0x00, 0x1d, 0x4c, 0x01,
    ];

    #[rustfmt::skip]
    const TEST_PPS: [u8; 4] = [0x68, 0xee, 0x3c, 0x80];

    #[rustfmt::skip]
    const TEST_RECORD: [u8; 38] = [
        0x01, 0x4d, 0x00, 0x1f, 0xff, 0xe1, 0x00, 0x17,
        0x67, 0x4d, 0x00, 0x1f, 0x9a, 0x66, 0x02, 0x80,
        0x2d, 0xff, 0x35, 0x01, 0x01, 0x01, 0x40, 0x00,
        0x00, 0xfa, 0x00, 0x00, 0x1d, 0x4c, 0x01, 0x01,
        0x00, 0x04, 0x68, 0xee, 0x3c, 0x80,
    ];

    #[test]
    fn parse_sps() {
        testutil::init();
        let sps = Sps::parse(&TEST_SPS).unwrap();
        assert_eq!(sps.profile_idc, 0x4d);
        assert_eq!(sps.constraint_flags, 0x00);
        assert_eq!(sps.level_idc, 0x1f);
        assert_eq!(sps.id, 0);
        assert_eq!((sps.width, sps.height), (1280, 720));
    }

    #[test]
    fn parse_sps_matches_h264_reader() {
        testutil::init();
        // h264-reader does its own emulation-prevention removal, so hand it
        // the encoded payload rather than our unescaped RBSP.
        let theirs = h264_reader::nal::sps::SeqParameterSet::from_bits(
            h264_reader::rbsp::BitReader::new(&TEST_SPS[1..]),
        )
        .unwrap();
        let ours = Sps::parse(&TEST_SPS).unwrap();
        assert_eq!(ours.level_idc, theirs.level_idc);
        assert_eq!(u64::from(theirs.seq_parameter_set_id.id()), ours.id);
        let dims = theirs.pixel_dimensions().unwrap();
        assert_eq!((ours.width, ours.height), dims);
    }

    #[test]
    fn ids() {
        assert_eq!(sps_id(&TEST_SPS).unwrap(), 0);
        assert_eq!(pps_id(&TEST_PPS).unwrap(), (0, 0));
    }

    #[test]
    fn record_encode() {
        let record =
            AvcDecoderConfigurationRecord::from_parameter_sets(&[&TEST_SPS], &[&TEST_PPS]);
        assert_eq!(record.encode().unwrap(), &TEST_RECORD[..]);
    }

    #[test]
    fn record_parse_round_trip() {
        let record = AvcDecoderConfigurationRecord::parse(&TEST_RECORD).unwrap();
        assert_eq!(&record.sps[..], &[TEST_SPS.to_vec()][..]);
        assert_eq!(&record.pps[..], &[TEST_PPS.to_vec()][..]);
        assert_eq!(record.encode().unwrap(), &TEST_RECORD[..]);
    }

    #[test]
    fn record_update_replaces_by_id() {
        let mut record = AvcDecoderConfigurationRecord::new();
        assert!(record.update_sps(&TEST_SPS).unwrap());
        assert!(!record.update_sps(&TEST_SPS).unwrap()); // identical bytes
        let mut changed = TEST_SPS.to_vec();
        *changed.last_mut().unwrap() ^= 0x40;
        assert!(record.update_sps(&changed).unwrap()); // same id, new bytes
        assert_eq!(record.sps.len(), 1);
        assert_eq!(record.sps[0], changed);
    }

    #[test]
    fn au_boundaries() {
        // IDR slice with first_mb_in_slice == 0 (first bit of the slice
        // header is 1).
        let idr = [0x65, 0x88, 0x80, 0x10];
        assert_eq!(first_mb_in_slice(&idr).unwrap(), 0);
        assert!(is_new_access_unit(&idr));
        // first_mb_in_slice == 1 -> continuation of the same AU.
        let cont = [0x41, 0x40, 0x80, 0x10];
        assert_eq!(first_mb_in_slice(&cont).unwrap(), 1);
        assert!(!is_new_access_unit(&cont));
        assert!(is_new_access_unit(&TEST_SPS));
    }
}
