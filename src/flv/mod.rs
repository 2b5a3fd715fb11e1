// This file is part of Moonfire Remux, a media container remuxing toolkit.
// Copyright (C) 2024 The Moonfire Remux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! FLV tag framing and the per-codec tag payloads, per the Adobe Flash Video
//! File Format Specification v10.1, extended by the enhanced-RTMP v1 video
//! header for HEVC.
//!
//! Timestamps cross this module in milliseconds. Video tags carry a signed
//! 24-bit composition-time offset, so `pts = dts + cts`.

mod demux;
mod mux;

pub use demux::Demuxer;
pub use mux::Muxer;

use crate::codec::CodecId;
use base::{bail, Error};

pub(crate) const TAG_TYPE_AUDIO: u8 = 8;
pub(crate) const TAG_TYPE_VIDEO: u8 = 9;
pub(crate) const TAG_TYPE_SCRIPT: u8 = 18;

/// The 9-byte file header (signature, version 1, audio+video flags, header
/// size) followed by the first zero `PreviousTagSize`.
pub(crate) const FILE_HEADER: [u8; 13] = [
    b'F', b'L', b'V', 0x01, 0x05, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00,
];

pub(crate) const FRAME_TYPE_KEY: u8 = 1;
pub(crate) const FRAME_TYPE_INTER: u8 = 2;

// VideoTagHeader codec ids.
pub(crate) const VIDEO_CODEC_AVC: u8 = 7;
pub(crate) const VIDEO_CODEC_HEVC: u8 = 12;

// AVCVideoPacket / AACAudioPacket types.
pub(crate) const PACKET_SEQUENCE_HEADER: u8 = 0;
pub(crate) const PACKET_NALU: u8 = 1;

// enhanced-rtmp v1 table 4 video packet types.
pub(crate) const EX_PACKET_SEQUENCE_START: u8 = 0;
pub(crate) const EX_PACKET_CODED_FRAMES: u8 = 1;
pub(crate) const EX_PACKET_SEQUENCE_END: u8 = 2;
pub(crate) const EX_PACKET_CODED_FRAMES_X: u8 = 3;

// SoundFormat values.
pub(crate) const SOUND_FORMAT_MP3: u8 = 2;
pub(crate) const SOUND_FORMAT_G711A: u8 = 7;
pub(crate) const SOUND_FORMAT_G711U: u8 = 8;
pub(crate) const SOUND_FORMAT_AAC: u8 = 10;

// SoundRate values; AAC tags always declare "44 kHz" regardless of the
// actual rate, which rides in the AudioSpecificConfig.
pub(crate) const SOUND_RATE_5500: u8 = 0;
pub(crate) const SOUND_RATE_11000: u8 = 1;
pub(crate) const SOUND_RATE_22000: u8 = 2;
pub(crate) const SOUND_RATE_44000: u8 = 3;

pub(crate) fn sound_format_to_codec(format: u8) -> Result<CodecId, Error> {
    Ok(match format {
        SOUND_FORMAT_MP3 => CodecId::Mp3,
        SOUND_FORMAT_G711A => CodecId::G711A,
        SOUND_FORMAT_G711U => CodecId::G711U,
        SOUND_FORMAT_AAC => CodecId::Aac,
        f => bail!(Unimplemented, msg("unsupported FLV sound format {}", f)),
    })
}

pub(crate) fn codec_to_sound_format(codec: CodecId) -> Result<u8, Error> {
    Ok(match codec {
        CodecId::Mp3 => SOUND_FORMAT_MP3,
        CodecId::G711A => SOUND_FORMAT_G711A,
        CodecId::G711U => SOUND_FORMAT_G711U,
        CodecId::Aac => SOUND_FORMAT_AAC,
        c => bail!(Unimplemented, msg("no FLV sound format for {:?}", c)),
    })
}

pub(crate) fn video_codec_to_codec(id: u8) -> Result<CodecId, Error> {
    Ok(match id {
        VIDEO_CODEC_AVC => CodecId::H264,
        VIDEO_CODEC_HEVC => CodecId::H265,
        c => bail!(Unimplemented, msg("unsupported FLV video codec id {}", c)),
    })
}

/// The 11-byte tag header: type, u24 data size, u24+u8 timestamp,
/// u24 stream id (always zero).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct TagHeader {
    pub tag_type: u8,
    pub data_size: u32,
    pub timestamp: u32,
}

impl TagHeader {
    pub fn decode(data: &[u8; 11]) -> Self {
        TagHeader {
            tag_type: data[0],
            data_size: u32::from(data[1]) << 16 | u32::from(data[2]) << 8 | u32::from(data[3]),
            timestamp: u32::from(data[7]) << 24
                | u32::from(data[4]) << 16
                | u32::from(data[5]) << 8
                | u32::from(data[6]),
        }
    }

    pub fn encode(&self) -> [u8; 11] {
        [
            self.tag_type,
            (self.data_size >> 16) as u8,
            (self.data_size >> 8) as u8,
            self.data_size as u8,
            (self.timestamp >> 16) as u8,
            (self.timestamp >> 8) as u8,
            self.timestamp as u8,
            (self.timestamp >> 24) as u8,
            0,
            0,
            0, // stream id
        ]
    }
}

/// Reads a signed 24-bit composition time offset.
pub(crate) fn cts_from_be24(b: &[u8]) -> i32 {
    let v = i32::from(b[0]) << 16 | i32::from(b[1]) << 8 | i32::from(b[2]);
    // Sign-extend.
    (v << 8) >> 8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_header_round_trip() {
        let hdr = TagHeader {
            tag_type: TAG_TYPE_VIDEO,
            data_size: 0x012345,
            timestamp: 0x01fffffe, // exercises the extension byte
        };
        assert_eq!(TagHeader::decode(&hdr.encode()), hdr);
    }

    #[test]
    fn cts_sign_extension() {
        assert_eq!(cts_from_be24(&[0x00, 0x00, 0x28]), 40);
        assert_eq!(cts_from_be24(&[0xff, 0xff, 0xd8]), -40);
    }
}
