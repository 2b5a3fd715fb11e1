// This file is part of Moonfire Remux, a media container remuxing toolkit.
// Copyright (C) 2024 The Moonfire Remux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Packetized Elementary Stream headers (ISO/IEC 13818-1 section 2.4.3.6),
//! shared by the transport-stream and program-stream engines. The MPEG-1
//! system stream variant (ISO/IEC 11172-1) is also handled here.

use crate::bitio::{BitReader, BitWriter};
use base::{bail, Error};

pub(crate) const STREAM_ID_PROGRAM_END: u8 = 0xB9;
pub(crate) const STREAM_ID_PACK_START: u8 = 0xBA;
pub(crate) const STREAM_ID_SYSTEM_HEADER: u8 = 0xBB;
pub(crate) const STREAM_ID_PSM: u8 = 0xBC;
pub(crate) const STREAM_ID_PRIVATE_1: u8 = 0xBD;
pub(crate) const STREAM_ID_PADDING: u8 = 0xBE;
pub(crate) const STREAM_ID_PRIVATE_2: u8 = 0xBF;
pub(crate) const STREAM_ID_AUDIO_BASE: u8 = 0xC0;
pub(crate) const STREAM_ID_VIDEO_BASE: u8 = 0xE0;
pub(crate) const STREAM_ID_DIRECTORY: u8 = 0xFF;

pub(crate) fn is_audio_stream_id(id: u8) -> bool {
    (0xC0..=0xDF).contains(&id)
}

pub(crate) fn is_video_stream_id(id: u8) -> bool {
    (0xE0..=0xEF).contains(&id)
}

/// A parsed PES header. `header_len` counts everything up to the first
/// payload byte, including the `00 00 01` prefix.
#[derive(Clone, Debug, Default)]
pub(crate) struct PesHeader {
    pub stream_id: u8,
    /// Zero means unbounded (allowed for video elementary streams).
    pub packet_length: u16,
    pub data_alignment_indicator: bool,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    pub header_len: usize,
}

impl PesHeader {
    /// Effective decode timestamp: the DTS if present, else the PTS.
    pub fn dts_or_pts(&self) -> Option<u64> {
        self.dts.or(self.pts)
    }

    /// Parses an MPEG-2 PES header from the start of `data`. Fails with
    /// `OutOfRange` when `data` ends mid-header; nothing is consumed then.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 9 {
            bail!(OutOfRange, msg("PES header needs 9 bytes, have {}", data.len()));
        }
        if data[0] != 0 || data[1] != 0 || data[2] != 1 {
            bail!(DataLoss, msg("bad PES start code prefix"));
        }
        let stream_id = data[3];
        let packet_length = u16::from_be_bytes([data[4], data[5]]);
        if data[6] >> 6 != 0b10 {
            bail!(DataLoss, msg("bad PES marker bits {:#04x}", data[6]));
        }
        let data_alignment_indicator = data[6] & 0x04 != 0;
        let pts_dts_flags = data[7] >> 6;
        let header_data_length = data[8] as usize;
        if data.len() < 9 + header_data_length {
            bail!(
                OutOfRange,
                msg("PES header data needs {} bytes", header_data_length)
            );
        }
        let mut r = BitReader::new(&data[9..9 + header_data_length]);
        let mut pts = None;
        let mut dts = None;
        if pts_dts_flags & 0b10 != 0 {
            r.skip(4)?;
            pts = Some(read_timestamp(&mut r)?);
        }
        if pts_dts_flags == 0b11 {
            r.skip(4)?;
            dts = Some(read_timestamp(&mut r)?);
        }
        Ok(PesHeader {
            stream_id,
            packet_length,
            data_alignment_indicator,
            pts,
            dts,
            header_len: 9 + header_data_length,
        })
    }

    /// Parses the MPEG-1 variant: stuffing `0xff` bytes, optional STD buffer
    /// size, then `0010`/`0011`-prefixed timestamps. PTS and DTS accumulate
    /// independently.
    pub fn parse_mpeg1(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 6 {
            bail!(OutOfRange, msg("PES header needs 6 bytes, have {}", data.len()));
        }
        if data[0] != 0 || data[1] != 0 || data[2] != 1 {
            bail!(DataLoss, msg("bad PES start code prefix"));
        }
        let stream_id = data[3];
        let packet_length = u16::from_be_bytes([data[4], data[5]]);
        let mut pos = 6;
        while pos < data.len() && data[pos] == 0xff {
            pos += 1;
        }
        if pos + 1 >= data.len() {
            bail!(OutOfRange, msg("PES header ends mid-stuffing"));
        }
        if data[pos] >> 6 == 0b01 {
            pos += 2; // STD buffer scale + size
        }
        if pos >= data.len() {
            bail!(OutOfRange, msg("PES header ends before timestamps"));
        }
        let mut pts = None;
        let mut dts = None;
        match data[pos] >> 4 {
            0x02 => {
                if data.len() < pos + 5 {
                    bail!(OutOfRange, msg("truncated MPEG-1 PTS"));
                }
                let mut r = BitReader::new(&data[pos..]);
                r.skip(4)?;
                pts = Some(read_timestamp(&mut r)?);
                pos += 5;
            }
            0x03 => {
                if data.len() < pos + 10 {
                    bail!(OutOfRange, msg("truncated MPEG-1 PTS+DTS"));
                }
                let mut r = BitReader::new(&data[pos..]);
                r.skip(4)?;
                pts = Some(read_timestamp(&mut r)?);
                r.skip(4)?;
                dts = Some(read_timestamp(&mut r)?);
                pos += 10;
            }
            _ => {
                if data[pos] != 0x0f {
                    bail!(DataLoss, msg("bad MPEG-1 PES flags byte {:#04x}", data[pos]));
                }
                pos += 1;
            }
        }
        Ok(PesHeader {
            stream_id,
            packet_length,
            data_alignment_indicator: false,
            pts,
            dts,
            header_len: pos,
        })
    }

    /// Payload length implied by `packet_length`, or `None` when unbounded.
    pub fn payload_len(&self) -> Option<usize> {
        if self.packet_length == 0 {
            return None;
        }
        // packet_length counts from the byte after itself.
        Some((self.packet_length as usize + 6).saturating_sub(self.header_len))
    }

    /// Bytes the encoded header will occupy.
    pub fn encoded_len(&self) -> usize {
        9 + match (self.pts, self.dts) {
            (Some(_), Some(_)) => 10,
            (Some(_), None) => 5,
            (None, _) => 0,
        }
    }

    /// Writes the header followed by `payload`. PTS/DTS are included as
    /// present; a timestamp-less header is legal for continuation packets of
    /// an oversized payload.
    pub fn encode(&self, w: &mut BitWriter, payload: &[u8]) {
        let (flags, header_data_length) = match (self.pts, self.dts) {
            (Some(_), Some(_)) => (0b11u8, 10u8),
            (Some(_), None) => (0b10, 5),
            (None, _) => (0, 0),
        };
        w.put_bytes(&[0x00, 0x00, 0x01, self.stream_id]);
        w.put_bits(self.packet_length as u64, 16);
        w.put_bits(0b10, 2);
        w.put_bits(0, 2); // PES_scrambling_control
        w.put_bit(0); // PES_priority
        w.put_bit(self.data_alignment_indicator as u8);
        w.put_bit(0); // copyright
        w.put_bit(0); // original_or_copy
        w.put_bits(flags as u64, 2); // PTS_DTS_flags
        w.put_bits(0, 6); // remaining indicator flags
        w.put_u8(header_data_length);
        match (self.pts, self.dts) {
            (Some(pts), Some(dts)) => {
                write_timestamp(w, 0b0011, pts);
                write_timestamp(w, 0b0001, dts);
            }
            (Some(pts), None) => write_timestamp(w, 0b0010, pts),
            (None, _) => {}
        }
        w.put_bytes(payload);
    }
}

/// 33 bits split 3/15/15 with marker bits.
fn read_timestamp(r: &mut BitReader) -> Result<u64, Error> {
    let mut v = r.read_bits(3)?;
    r.skip(1)?;
    v = v << 15 | r.read_bits(15)?;
    r.skip(1)?;
    v = v << 15 | r.read_bits(15)?;
    r.skip(1)?;
    Ok(v)
}

fn write_timestamp(w: &mut BitWriter, prefix: u8, v: u64) {
    w.put_bits(prefix as u64, 4);
    w.put_bits(v >> 30, 3);
    w.put_bit(1);
    w.put_bits(v >> 15 & 0x7fff, 15);
    w.put_bit(1);
    w.put_bits(v & 0x7fff, 15);
    w.put_bit(1);
}
