// This file is part of Moonfire Remux, a media container remuxing toolkit.
// Copyright (C) 2024 The Moonfire Remux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! MPEG-2 Program Stream framing (ISO/IEC 13818-1 section 2.5): pack
//! headers (with the MPEG-1 compatibility layout of ISO/IEC 11172-1),
//! system headers, and the program stream map with its CRC-32 footer.

mod demux;
mod mux;

pub use demux::Demuxer;
pub use mux::Muxer;

use crate::bitio::{BitReader, BitWriter};
use crate::codec::CodecId;
use crate::crc::crc32_mpeg2;
use base::{bail, Error};
use tracing::warn;

// Program-stream stream types; the G.711 assignments follow the GB28181
// surveillance-camera convention.
pub(crate) const STREAM_TYPE_AAC: u8 = 0x0f;
pub(crate) const STREAM_TYPE_H264: u8 = 0x1b;
pub(crate) const STREAM_TYPE_H265: u8 = 0x24;
pub(crate) const STREAM_TYPE_G711A: u8 = 0x90;
pub(crate) const STREAM_TYPE_G711U: u8 = 0x91;

pub(crate) fn codec_to_stream_type(codec: CodecId) -> Result<u8, Error> {
    Ok(match codec {
        CodecId::H264 => STREAM_TYPE_H264,
        CodecId::H265 => STREAM_TYPE_H265,
        CodecId::Aac => STREAM_TYPE_AAC,
        CodecId::G711A => STREAM_TYPE_G711A,
        CodecId::G711U => STREAM_TYPE_G711U,
        c => bail!(Unimplemented, msg("program streams can't carry {:?}", c)),
    })
}

pub(crate) fn stream_type_to_codec(stream_type: u8) -> Option<CodecId> {
    match stream_type {
        STREAM_TYPE_H264 => Some(CodecId::H264),
        STREAM_TYPE_H265 => Some(CodecId::H265),
        STREAM_TYPE_AAC => Some(CodecId::Aac),
        STREAM_TYPE_G711A => Some(CodecId::G711A),
        STREAM_TYPE_G711U => Some(CodecId::G711U),
        _ => None,
    }
}

/// pack_header(), ISO/IEC 13818-1 table 2-33, or the MPEG-1 pack layout
/// distinguishable by the 2-bit/4-bit prefix after the start code.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct PackHeader {
    pub is_mpeg1: bool,
    pub scr_base: u64,
    pub scr_ext: u16,
    pub mux_rate: u32,
}

impl PackHeader {
    /// Parses from `00 00 01 BA`, returning the header and bytes consumed.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), Error> {
        if data.len() < 5 {
            bail!(OutOfRange, msg("pack header needs 5 bytes"));
        }
        debug_assert_eq!(&data[..4], &[0, 0, 1, 0xba]);
        if data[4] >> 6 == 0b01 {
            // MPEG-2: 10 bytes after the start code plus stuffing.
            if data.len() < 14 {
                bail!(OutOfRange, msg("MPEG-2 pack header needs 14 bytes"));
            }
            let mut r = BitReader::new(&data[4..]);
            r.skip(2)?;
            let mut scr_base = r.read_bits(3)?;
            r.skip(1)?;
            scr_base = scr_base << 15 | r.read_bits(15)?;
            r.skip(1)?;
            scr_base = scr_base << 15 | r.read_bits(15)?;
            r.skip(1)?;
            let scr_ext = r.read_u16(9)?;
            r.skip(1)?;
            let mux_rate = r.read_u32(22)?;
            r.skip(2)?; // marker bits
            r.skip(5)?; // reserved
            let stuffing = r.read_u8(3)? as usize;
            if data.len() < 14 + stuffing {
                bail!(OutOfRange, msg("pack header stuffing needs {} bytes", stuffing));
            }
            Ok((
                PackHeader {
                    is_mpeg1: false,
                    scr_base,
                    scr_ext,
                    mux_rate,
                },
                14 + stuffing,
            ))
        } else if data[4] >> 4 == 0b0010 {
            // MPEG-1: fixed 12 bytes.
            if data.len() < 12 {
                bail!(OutOfRange, msg("MPEG-1 pack header needs 12 bytes"));
            }
            let mut r = BitReader::new(&data[4..]);
            r.skip(4)?;
            let mut scr_base = r.read_bits(3)?;
            r.skip(1)?;
            scr_base = scr_base << 15 | r.read_bits(15)?;
            r.skip(1)?;
            scr_base = scr_base << 15 | r.read_bits(15)?;
            r.skip(1)?;
            r.skip(1)?; // marker
            let mut mux_rate = r.read_u32(7)?;
            r.skip(1)?;
            mux_rate = mux_rate << 15 | r.read_u32(15)?;
            r.skip(1)?;
            Ok((
                PackHeader {
                    is_mpeg1: true,
                    scr_base,
                    scr_ext: 1,
                    mux_rate,
                },
                12,
            ))
        } else {
            bail!(DataLoss, msg("pack header prefix {:#04x} is neither MPEG-1 nor MPEG-2", data[4]));
        }
    }

    /// Writes the MPEG-2 layout with no stuffing.
    pub fn encode(&self, w: &mut BitWriter) {
        w.put_bytes(&[0x00, 0x00, 0x01, 0xba]);
        w.put_bits(0b01, 2);
        w.put_bits(self.scr_base >> 30, 3);
        w.put_bit(1);
        w.put_bits(self.scr_base >> 15 & 0x7fff, 15);
        w.put_bit(1);
        w.put_bits(self.scr_base & 0x7fff, 15);
        w.put_bit(1);
        w.put_bits(self.scr_ext as u64, 9);
        w.put_bit(1);
        w.put_bits(self.mux_rate as u64, 22);
        w.put_bit(1);
        w.put_bit(1);
        w.put_bits(0x1f, 5); // reserved
        w.put_bits(0, 3); // pack_stuffing_length
    }
}

/// One elementary-stream declaration in the system header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct ElementaryStream {
    pub stream_id: u8,
    pub buffer_bound_scale: u8,
    pub buffer_size_bound: u16,
}

/// system_header(), ISO/IEC 13818-1 section 2.5.3.5.
#[derive(Clone, Debug, Default)]
pub(crate) struct SystemHeader {
    pub rate_bound: u32,
    pub audio_bound: u8,
    pub video_bound: u8,
    pub streams: Vec<ElementaryStream>,
}

impl SystemHeader {
    pub fn parse(data: &[u8]) -> Result<(Self, usize), Error> {
        if data.len() < 6 {
            bail!(OutOfRange, msg("system header needs 6 bytes"));
        }
        debug_assert_eq!(&data[..4], &[0, 0, 1, 0xbb]);
        let header_length = u16::from_be_bytes([data[4], data[5]]) as usize;
        if data.len() < 6 + header_length {
            bail!(OutOfRange, msg("system header needs {} bytes", 6 + header_length));
        }
        if header_length < 6 || (header_length - 6) % 3 != 0 {
            bail!(DataLoss, msg("bad system header length {}", header_length));
        }
        let mut r = BitReader::new(&data[6..6 + header_length]);
        r.skip(1)?;
        let rate_bound = r.read_u32(22)?;
        r.skip(1)?;
        let audio_bound = r.read_u8(6)?;
        r.skip(4)?; // fixed, CSPS, audio lock, video lock
        r.skip(1)?; // marker
        let video_bound = r.read_u8(5)?;
        r.skip(8)?; // packet_rate_restriction_flag + reserved
        let mut streams = Vec::new();
        for _ in 0..(header_length - 6) / 3 {
            let stream_id = r.read_u8(8)?;
            r.skip(2)?;
            streams.push(ElementaryStream {
                stream_id,
                buffer_bound_scale: r.read_bit()?,
                buffer_size_bound: r.read_u16(13)?,
            });
        }
        Ok((
            SystemHeader {
                rate_bound,
                audio_bound,
                video_bound,
                streams,
            },
            6 + header_length,
        ))
    }

    pub fn encode(&self, w: &mut BitWriter) {
        w.put_bytes(&[0x00, 0x00, 0x01, 0xbb]);
        w.put_bits(6 + 3 * self.streams.len() as u64, 16);
        w.put_bit(1);
        w.put_bits(self.rate_bound as u64, 22);
        w.put_bit(1);
        w.put_bits(self.audio_bound as u64, 6);
        w.put_bit(0); // fixed_flag
        w.put_bit(0); // CSPS_flag
        w.put_bit(0); // system_audio_lock_flag
        w.put_bit(0); // system_video_lock_flag
        w.put_bit(1);
        w.put_bits(self.video_bound as u64, 5);
        w.put_bit(0); // packet_rate_restriction_flag
        w.put_bits(0x7f, 7); // reserved
        for s in &self.streams {
            w.put_u8(s.stream_id);
            w.put_bits(0b11, 2);
            w.put_bit(s.buffer_bound_scale);
            w.put_bits(s.buffer_size_bound as u64, 13);
        }
    }
}

/// program_stream_map(), ISO/IEC 13818-1 section 2.5.4.1.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct ProgramStreamMap {
    pub version: u8,
    /// (stream_type, elementary_stream_id).
    pub entries: Vec<(u8, u8)>,
}

impl ProgramStreamMap {
    pub fn parse(data: &[u8]) -> Result<(Self, usize), Error> {
        if data.len() < 6 {
            bail!(OutOfRange, msg("program stream map needs 6 bytes"));
        }
        debug_assert_eq!(&data[..4], &[0, 0, 1, 0xbc]);
        let map_length = u16::from_be_bytes([data[4], data[5]]) as usize;
        let total = 6 + map_length;
        if data.len() < total {
            bail!(OutOfRange, msg("program stream map needs {} bytes", total));
        }
        if map_length < 10 {
            bail!(DataLoss, msg("program_stream_map_length {} too small", map_length));
        }
        let version = data[6] & 0x1f;
        let info_length = u16::from_be_bytes([data[8], data[9]]) as usize;
        if 10 + info_length + 2 > total {
            bail!(DataLoss, msg("program_stream_info_length overflows map"));
        }
        let es_map_start = 10 + info_length;
        let es_map_length =
            u16::from_be_bytes([data[es_map_start], data[es_map_start + 1]]) as usize;
        if es_map_start + 2 + es_map_length + 4 > total {
            bail!(DataLoss, msg("elementary_stream_map_length overflows map"));
        }
        let mut entries = Vec::new();
        let mut pos = es_map_start + 2;
        let es_end = pos + es_map_length;
        while pos + 4 <= es_end {
            let stream_type = data[pos];
            let stream_id = data[pos + 1];
            let es_info = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
            pos += 4 + es_info;
            if pos > es_end {
                bail!(DataLoss, msg("elementary_stream_info_length overflows map"));
            }
            entries.push((stream_type, stream_id));
        }
        let crc_stored =
            u32::from_be_bytes([data[total - 4], data[total - 3], data[total - 2], data[total - 1]]);
        let crc_computed = crc32_mpeg2(&data[..total - 4]);
        if crc_stored != crc_computed {
            warn!(
                "program stream map CRC mismatch: stored {:#010x}, computed {:#010x}",
                crc_stored, crc_computed
            );
        }
        Ok((ProgramStreamMap { version, entries }, total))
    }

    pub fn encode(&self, w: &mut BitWriter) {
        let start = w.byte_offset();
        w.put_bytes(&[0x00, 0x00, 0x01, 0xbc]);
        let map_length = 10 + 4 * self.entries.len();
        w.put_bits(map_length as u64, 16);
        w.put_bit(1); // current_next_indicator
        w.put_bits(0b11, 2);
        w.put_bits(self.version as u64, 5);
        w.put_bits(0x7f, 7); // reserved
        w.put_bit(1); // marker
        w.put_bits(0, 16); // program_stream_info_length
        w.put_bits(4 * self.entries.len() as u64, 16);
        for &(stream_type, stream_id) in &self.entries {
            w.put_u8(stream_type);
            w.put_u8(stream_id);
            w.put_bits(0, 16); // elementary_stream_info_length
        }
        let crc = crc32_mpeg2(&w.as_slice()[start..]);
        w.put_bytes(&crc.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_header_round_trip() {
        let hdr = PackHeader {
            is_mpeg1: false,
            scr_base: 90_000 * 7,
            scr_ext: 0,
            mux_rate: 6106,
        };
        let mut w = BitWriter::new();
        hdr.encode(&mut w);
        let bytes = w.into_vec();
        assert_eq!(bytes.len(), 14);
        let (parsed, consumed) = PackHeader::parse(&bytes).unwrap();
        assert_eq!(consumed, 14);
        assert!(!parsed.is_mpeg1);
        assert_eq!(parsed.scr_base, 90_000 * 7);
        assert_eq!(parsed.mux_rate, 6106);
    }

    #[test]
    fn mpeg1_pack_header() {
        let mut w = BitWriter::new();
        w.put_bytes(&[0x00, 0x00, 0x01, 0xba]);
        w.put_bits(0b0010, 4);
        w.put_bits(123456 >> 30, 3);
        w.put_bit(1);
        w.put_bits(123456 >> 15 & 0x7fff, 15);
        w.put_bit(1);
        w.put_bits(123456 & 0x7fff, 15);
        w.put_bit(1);
        w.put_bit(1);
        w.put_bits(3000 >> 15, 7);
        w.put_bit(1);
        w.put_bits(3000 & 0x7fff, 15);
        w.put_bit(1);
        let bytes = w.into_vec();
        assert_eq!(bytes.len(), 12);
        let (parsed, consumed) = PackHeader::parse(&bytes).unwrap();
        assert_eq!(consumed, 12);
        assert!(parsed.is_mpeg1);
        assert_eq!(parsed.scr_base, 123456);
        assert_eq!(parsed.mux_rate, 3000);
    }

    #[test]
    fn system_header_round_trip() {
        let sh = SystemHeader {
            rate_bound: 26234,
            audio_bound: 1,
            video_bound: 1,
            streams: vec![
                ElementaryStream {
                    stream_id: 0xe0,
                    buffer_bound_scale: 1,
                    buffer_size_bound: 400,
                },
                ElementaryStream {
                    stream_id: 0xc0,
                    buffer_bound_scale: 0,
                    buffer_size_bound: 32,
                },
            ],
        };
        let mut w = BitWriter::new();
        sh.encode(&mut w);
        let (parsed, consumed) = SystemHeader::parse(&w.as_slice()).unwrap();
        assert_eq!(consumed, w.len());
        assert_eq!(parsed.rate_bound, 26234);
        assert_eq!(parsed.streams, sh.streams);
    }

    #[test]
    fn psm_round_trip_with_crc() {
        let psm = ProgramStreamMap {
            version: 1,
            entries: vec![(STREAM_TYPE_H264, 0xe0), (STREAM_TYPE_G711A, 0xc0)],
        };
        let mut w = BitWriter::new();
        psm.encode(&mut w);
        let bytes = w.into_vec();
        let stored = u32::from_be_bytes(bytes[bytes.len() - 4..].try_into().unwrap());
        assert_eq!(stored, crc32_mpeg2(&bytes[..bytes.len() - 4]));
        let (parsed, consumed) = ProgramStreamMap::parse(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed, psm);
    }
}
