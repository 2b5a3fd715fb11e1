// This file is part of Moonfire Remux, a media container remuxing toolkit.
// Copyright (C) 2024 The Moonfire Remux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! MPEG-2 Transport Stream framing (ISO/IEC 13818-1): the 188-byte packet
//! header, adaptation fields, and the PAT/PMT program-specific information
//! sections with their CRC-32/MPEG-2 footers.

mod demux;
mod mux;

pub use demux::Demuxer;
pub use mux::Muxer;

use crate::bitio::{BitReader, BitWriter};
use crate::codec::CodecId;
use crate::crc::crc32_mpeg2;
use base::{bail, Error};
use tracing::warn;

pub(crate) const PACKET_SIZE: usize = 188;
pub(crate) const SYNC_BYTE: u8 = 0x47;
pub(crate) const PID_PAT: u16 = 0x0000;
pub(crate) const PID_NULL: u16 = 0x1fff;
pub(crate) const TABLE_ID_PAT: u8 = 0x00;
pub(crate) const TABLE_ID_PMT: u8 = 0x02;

// ISO/IEC 13818-1 table 2-29 stream types.
pub(crate) const STREAM_TYPE_AUDIO_MPEG1: u8 = 0x03;
pub(crate) const STREAM_TYPE_AUDIO_MPEG2: u8 = 0x04;
pub(crate) const STREAM_TYPE_AAC: u8 = 0x0f;
pub(crate) const STREAM_TYPE_H264: u8 = 0x1b;
pub(crate) const STREAM_TYPE_H265: u8 = 0x24;

pub(crate) fn codec_to_stream_type(codec: CodecId) -> Result<u8, Error> {
    Ok(match codec {
        CodecId::H264 => STREAM_TYPE_H264,
        CodecId::H265 => STREAM_TYPE_H265,
        CodecId::Aac => STREAM_TYPE_AAC,
        CodecId::Mp3 => STREAM_TYPE_AUDIO_MPEG2,
        c => bail!(Unimplemented, msg("transport streams can't carry {:?}", c)),
    })
}

pub(crate) fn stream_type_to_codec(stream_type: u8) -> Option<CodecId> {
    match stream_type {
        STREAM_TYPE_H264 => Some(CodecId::H264),
        STREAM_TYPE_H265 => Some(CodecId::H265),
        STREAM_TYPE_AAC => Some(CodecId::Aac),
        STREAM_TYPE_AUDIO_MPEG1 | STREAM_TYPE_AUDIO_MPEG2 => Some(CodecId::Mp3),
        _ => None,
    }
}

/// transport_packet() header fields, ISO/IEC 13818-1 section 2.4.3.2.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct PacketHeader {
    pub payload_unit_start: bool,
    pub pid: u16,
    pub adaptation_field_control: u8,
    pub continuity_counter: u8,
}

impl PacketHeader {
    pub fn decode(r: &mut BitReader) -> Result<Self, Error> {
        let sync = r.read_u8(8)?;
        if sync != SYNC_BYTE {
            bail!(DataLoss, msg("packet starts with {:#04x}, not 0x47", sync));
        }
        let transport_error = r.read_bit()?;
        if transport_error != 0 {
            bail!(DataLoss, msg("transport_error_indicator set"));
        }
        let payload_unit_start = r.read_bit()? == 1;
        r.skip(1)?; // transport_priority
        let pid = r.read_u16(13)?;
        r.skip(2)?; // transport_scrambling_control
        let adaptation_field_control = r.read_u8(2)?;
        let continuity_counter = r.read_u8(4)?;
        Ok(PacketHeader {
            payload_unit_start,
            pid,
            adaptation_field_control,
            continuity_counter,
        })
    }

    pub fn encode(&self, w: &mut BitWriter) {
        w.put_u8(SYNC_BYTE);
        w.put_bit(0); // transport_error_indicator
        w.put_bit(self.payload_unit_start as u8);
        w.put_bit(0); // transport_priority
        w.put_bits(self.pid as u64, 13);
        w.put_bits(0, 2); // transport_scrambling_control
        w.put_bits(self.adaptation_field_control as u64, 2);
        w.put_bits(self.continuity_counter as u64, 4);
    }
}

/// The subset of the adaptation field this crate reads and writes. On read
/// the remaining syntax (OPCR, splice countdown, private data, extensions)
/// is decoded far enough to skip correctly.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct AdaptationField {
    pub random_access: bool,
    pub pcr: Option<u64>, // 27 MHz: base * 300 + extension
}

impl AdaptationField {
    /// Decodes and consumes the whole field, returning the parsed subset.
    pub fn decode(r: &mut BitReader) -> Result<Self, Error> {
        let len = r.read_u8(8)? as usize;
        if len == 0 {
            return Ok(AdaptationField::default());
        }
        if r.remaining_bytes() < len {
            bail!(DataLoss, msg("adaptation_field_length {} overflows packet", len));
        }
        r.mark();
        r.skip(1)?; // discontinuity_indicator
        let random_access = r.read_bit()? == 1;
        r.skip(1)?; // elementary_stream_priority_indicator
        let pcr_flag = r.read_bit()? == 1;
        let opcr_flag = r.read_bit()? == 1;
        let splicing_flag = r.read_bit()? == 1;
        let private_flag = r.read_bit()? == 1;
        let extension_flag = r.read_bit()? == 1;
        let mut pcr = None;
        if pcr_flag {
            let base = r.read_bits(33)?;
            r.skip(6)?;
            let ext = r.read_bits(9)?;
            pcr = Some(base * 300 + ext);
        }
        if opcr_flag {
            r.skip(48)?;
        }
        if splicing_flag {
            r.skip(8)?;
        }
        if private_flag {
            let n = r.read_u8(8)? as usize;
            r.skip(n * 8)?;
        }
        if extension_flag {
            let ext_len = r.read_u8(8)? as usize;
            r.skip(ext_len * 8)?;
        }
        let consumed = r.bits_since_mark() / 8;
        if consumed > len {
            bail!(DataLoss, msg("adaptation field fields overflow its length"));
        }
        r.skip((len - consumed) * 8)?; // stuffing
        Ok(AdaptationField {
            random_access,
            pcr,
        })
    }

    /// Minimum serialized length when the field carries flags or a PCR.
    pub fn min_len(&self) -> usize {
        2 + if self.pcr.is_some() { 6 } else { 0 }
    }

    /// Serializes to exactly `total` bytes, padding with 0xff stuffing. A
    /// field carrying nothing serializes to the single length byte 0 when
    /// `total` is 1.
    pub fn encode_to_len(&self, total: usize) -> Vec<u8> {
        if total == 1 && !self.random_access && self.pcr.is_none() {
            return vec![0u8];
        }
        assert!(total >= self.min_len(), "adaptation field needs {} bytes", self.min_len());
        let mut w = BitWriter::with_capacity(total);
        w.put_u8((total - 1) as u8);
        w.put_bit(0); // discontinuity_indicator
        w.put_bit(self.random_access as u8);
        w.put_bit(0); // elementary_stream_priority_indicator
        w.put_bit(self.pcr.is_some() as u8);
        w.put_bits(0, 4); // opcr/splicing/private/extension
        if let Some(pcr) = self.pcr {
            w.put_bits(pcr / 300, 33);
            w.put_bits(0x3f, 6); // reserved
            w.put_bits(pcr % 300, 9);
        }
        w.put_repeated(0xff, total - self.min_len());
        w.into_vec()
    }
}

/// A program association section, ISO/IEC 13818-1 section 2.4.4.3.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct Pat {
    pub version: u8,
    /// (program_number, program_map_PID); program 0 entries are network PIDs
    /// and are not produced by the muxer.
    pub programs: Vec<(u16, u16)>,
}

impl Pat {
    /// Parses a section starting at `table_id` (pointer field already
    /// skipped). The CRC is verified best-effort: a mismatch is logged, not
    /// fatal.
    pub fn decode(section: &[u8]) -> Result<Self, Error> {
        let (payload, _) = check_section(section, TABLE_ID_PAT)?;
        let mut r = BitReader::new(payload);
        r.skip(16)?; // transport_stream_id
        r.skip(2)?; // reserved
        let version = r.read_u8(5)?;
        r.skip(1)?; // current_next_indicator
        r.skip(16)?; // section_number + last_section_number
        let mut programs = Vec::new();
        while r.remaining_bytes() >= 4 {
            let program_number = r.read_u16(16)?;
            r.skip(3)?;
            let pid = r.read_u16(13)?;
            programs.push((program_number, pid));
        }
        Ok(Pat { version, programs })
    }

    pub fn encode(&self, w: &mut BitWriter) {
        encode_section(w, TABLE_ID_PAT, |w| {
            w.put_bits(1, 16); // transport_stream_id
            w.put_bits(0b11, 2);
            w.put_bits(self.version as u64, 5);
            w.put_bit(1); // current_next_indicator
            w.put_u8(0); // section_number
            w.put_u8(0); // last_section_number
            for &(program_number, pid) in &self.programs {
                w.put_bits(program_number as u64, 16);
                w.put_bits(0b111, 3);
                w.put_bits(pid as u64, 13);
            }
        });
    }
}

/// A program map section, section 2.4.4.8.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct Pmt {
    pub program_number: u16,
    pub version: u8,
    pub pcr_pid: u16,
    /// (stream_type, elementary_PID).
    pub streams: Vec<(u8, u16)>,
}

impl Pmt {
    pub fn decode(section: &[u8]) -> Result<Self, Error> {
        let (payload, _) = check_section(section, TABLE_ID_PMT)?;
        let mut r = BitReader::new(payload);
        let program_number = r.read_u16(16)?;
        r.skip(2)?;
        let version = r.read_u8(5)?;
        r.skip(1)?; // current_next_indicator
        r.skip(16)?; // section_number + last_section_number
        r.skip(3)?;
        let pcr_pid = r.read_u16(13)?;
        r.skip(4)?;
        let program_info_length = r.read_u16(12)? as usize;
        r.skip(program_info_length * 8)?; // descriptors
        let mut streams = Vec::new();
        while r.remaining_bytes() >= 5 {
            let stream_type = r.read_u8(8)?;
            r.skip(3)?;
            let pid = r.read_u16(13)?;
            r.skip(4)?;
            let es_info_length = r.read_u16(12)? as usize;
            r.skip(es_info_length * 8)?; // descriptors
            streams.push((stream_type, pid));
        }
        Ok(Pmt {
            program_number,
            version,
            pcr_pid,
            streams,
        })
    }

    pub fn encode(&self, w: &mut BitWriter) {
        encode_section(w, TABLE_ID_PMT, |w| {
            w.put_bits(self.program_number as u64, 16);
            w.put_bits(0b11, 2);
            w.put_bits(self.version as u64, 5);
            w.put_bit(1); // current_next_indicator
            w.put_u8(0); // section_number
            w.put_u8(0); // last_section_number
            w.put_bits(0b111, 3);
            w.put_bits(self.pcr_pid as u64, 13);
            w.put_bits(0b1111, 4);
            w.put_bits(0, 12); // program_info_length
            for &(stream_type, pid) in &self.streams {
                w.put_u8(stream_type);
                w.put_bits(0b111, 3);
                w.put_bits(pid as u64, 13);
                w.put_bits(0b1111, 4);
                w.put_bits(0, 12); // ES_info_length
            }
        });
    }
}

/// Validates a section's framing and CRC, returning the body between the
/// fixed header and the CRC along with the total section length.
fn check_section(section: &[u8], want_table_id: u8) -> Result<(&[u8], usize), Error> {
    if section.len() < 12 {
        bail!(OutOfRange, msg("section shorter than fixed header"));
    }
    if section[0] != want_table_id {
        bail!(
            DataLoss,
            msg("table_id {:#04x}, want {:#04x}", section[0], want_table_id)
        );
    }
    let section_length = (u16::from(section[1] & 0x0f) << 8 | u16::from(section[2])) as usize;
    let total = 3 + section_length;
    if section.len() < total {
        bail!(OutOfRange, msg("section_length {} overflows input", section_length));
    }
    if section_length < 9 {
        bail!(DataLoss, msg("section_length {} too small", section_length));
    }
    let crc_stored = u32::from_be_bytes([
        section[total - 4],
        section[total - 3],
        section[total - 2],
        section[total - 1],
    ]);
    let crc_computed = crc32_mpeg2(&section[..total - 4]);
    if crc_stored != crc_computed {
        warn!(
            "section table_id {:#04x} CRC mismatch: stored {:#010x}, computed {:#010x}",
            want_table_id, crc_stored, crc_computed
        );
    }
    Ok((&section[3..total - 4], total))
}

/// Writes `table_id`, a backpatched `section_length`, the body from `f`, and
/// the CRC over everything before it.
fn encode_section(w: &mut BitWriter, table_id: u8, f: impl FnOnce(&mut BitWriter)) {
    let section_start = w.byte_offset();
    w.put_u8(table_id);
    let len_pos = w.byte_offset();
    w.put_bit(1); // section_syntax_indicator
    w.put_bit(0);
    w.put_bits(0b11, 2);
    w.put_bits(0, 12); // section_length, patched below
    f(w);
    let body_len = w.byte_offset() - len_pos - 2;
    let section_length = (body_len + 4) as u16; // + CRC
    w.patch_u16(len_pos, 0x8000 | 0x3000 | (section_length & 0x0fff));
    let crc = crc32_mpeg2(&w.as_slice()[section_start..]);
    w.put_bytes(&crc.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pat_round_trip_with_crc() {
        let pat = Pat {
            version: 3,
            programs: vec![(1, 0x200)],
        };
        let mut w = BitWriter::new();
        pat.encode(&mut w);
        let bytes = w.into_vec();
        // Property: the stored CRC matches CRC-32/MPEG-2 over the section.
        let section_length = ((bytes[1] as usize & 0x0f) << 8) | bytes[2] as usize;
        let total = 3 + section_length;
        let crc = u32::from_be_bytes(bytes[total - 4..total].try_into().unwrap());
        assert_eq!(crc, crc32_mpeg2(&bytes[..total - 4]));
        assert_eq!(Pat::decode(&bytes).unwrap(), pat);
    }

    #[test]
    fn pmt_round_trip() {
        let pmt = Pmt {
            program_number: 1,
            version: 0,
            pcr_pid: 0x100,
            streams: vec![(STREAM_TYPE_H264, 0x100), (STREAM_TYPE_AAC, 0x101)],
        };
        let mut w = BitWriter::new();
        pmt.encode(&mut w);
        assert_eq!(Pmt::decode(&w.into_vec()).unwrap(), pmt);
    }

    #[test]
    fn packet_header_round_trip() {
        let hdr = PacketHeader {
            payload_unit_start: true,
            pid: 0x1234 & 0x1fff,
            adaptation_field_control: 0b11,
            continuity_counter: 9,
        };
        let mut w = BitWriter::new();
        hdr.encode(&mut w);
        let v = w.into_vec();
        assert_eq!(v.len(), 4);
        let mut r = BitReader::new(&v);
        let parsed = PacketHeader::decode(&mut r).unwrap();
        assert_eq!(parsed.pid, hdr.pid);
        assert!(parsed.payload_unit_start);
        assert_eq!(parsed.adaptation_field_control, 0b11);
        assert_eq!(parsed.continuity_counter, 9);
    }

    #[test]
    fn adaptation_field_pcr_round_trip() {
        let af = AdaptationField {
            random_access: true,
            pcr: Some(90_000 * 300 + 123),
        };
        let bytes = af.encode_to_len(af.min_len());
        assert_eq!(bytes.len(), 8);
        let mut r = BitReader::new(&bytes);
        let parsed = AdaptationField::decode(&mut r).unwrap();
        assert!(parsed.random_access);
        assert_eq!(parsed.pcr, Some(90_000 * 300 + 123));
    }

    #[test]
    fn adaptation_field_stuffing() {
        let af = AdaptationField::default();
        assert_eq!(af.encode_to_len(1), vec![0]);
        let b = af.encode_to_len(5);
        assert_eq!(b.len(), 5);
        assert_eq!(b[0], 4); // adaptation_field_length
        let mut r = BitReader::new(&b);
        AdaptationField::decode(&mut r).unwrap();
        assert_eq!(r.remaining_bits(), 0);
    }
}
