// This file is part of Moonfire Remux, a media container remuxing toolkit.
// Copyright (C) 2024 The Moonfire Remux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `.mp4` (ISO base media file format) demuxing and muxing, progressive and
//! fragmented. See ISO/IEC 14496-12 for the box grammar and ISO/IEC 14496-15
//! for the AVC/HEVC sample entries. This code won't make much sense without
//! them!
//!
//! Frames cross this module in milliseconds; tracks are written with a
//! 1000-unit timescale and arbitrary input timescales are rescaled on read.

mod boxes;
mod demux;
mod mux;

pub use demux::{Demuxer, TrackInfo};
pub use mux::Muxer;

use crate::codec::CodecId;
use crate::h264::AvcDecoderConfigurationRecord;
use crate::h265::HevcDecoderConfigurationRecord;
use base::{bail, Error};

/// Sample-entry fourcc per codec, matching ffmpeg's `isom.c` muxing tables.
pub(crate) fn sample_entry_fourcc(codec: CodecId) -> &'static [u8; 4] {
    match codec {
        CodecId::H264 => b"avc1",
        CodecId::H265 => b"hvc1",
        CodecId::Aac | CodecId::Mp3 => b"mp4a",
        CodecId::G711A => b"alaw",
        CodecId::G711U => b"ulaw",
        CodecId::Opus => b"Opus",
    }
}

/// MPEG-4 systems `objectTypeIndication` for the `esds` descriptor
/// (ffmpeg `ff_mp4_obj_type`).
pub(crate) fn object_type(codec: CodecId) -> u8 {
    match codec {
        CodecId::H264 => 0x21,
        CodecId::H265 => 0x23,
        CodecId::Aac => 0x40,
        CodecId::Mp3 => 0x69,
        CodecId::G711A => 0xfd,
        CodecId::G711U => 0xfe,
        CodecId::Opus => 0xff, // not signalled via esds
    }
}

pub(crate) fn codec_from_object_type(object_type: u8) -> Result<CodecId, Error> {
    Ok(match object_type {
        0x21 => CodecId::H264,
        0x23 => CodecId::H265,
        0x40 => CodecId::Aac,
        0x69 | 0x6b => CodecId::Mp3,
        0xfd => CodecId::G711A,
        0xfe => CodecId::G711U,
        t => bail!(Unimplemented, msg("unsupported esds object type {:#x}", t)),
    })
}

/// Decoded track extradata, kept alongside the verbatim stored bytes.
#[derive(Clone, Debug)]
pub(crate) enum Extradata {
    Avc(AvcDecoderConfigurationRecord),
    Hevc(HevcDecoderConfigurationRecord),
    /// AAC `AudioSpecificConfig` bytes.
    Asc(Vec<u8>),
    /// Opaque codec config (e.g. `dOps`), passed through untouched.
    Raw(Vec<u8>),
}

/// One entry of a materialized sample table.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Sample {
    pub dts: u64,
    pub cts_offset: i32,
    pub size: u32,
    pub offset: u64,
    pub is_sync: bool,
}
