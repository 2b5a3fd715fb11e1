// This file is part of Moonfire Remux, a media container remuxing toolkit.
// Copyright (C) 2024 The Moonfire Remux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use bytes::Bytes;

/// The closed set of codecs the engines understand.
///
/// Anything else is rejected with `Unimplemented` at stream registration, so
/// downstream code may treat the enumeration as exhaustive.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CodecId {
    H264,
    H265,
    Aac,
    G711A,
    G711U,
    Mp3,
    Opus,
}

impl CodecId {
    pub fn is_video(self) -> bool {
        matches!(self, CodecId::H264 | CodecId::H265)
    }

    pub fn is_audio(self) -> bool {
        !self.is_video()
    }
}

/// The unit of demux/mux exchange.
///
/// `data` is Annex B for H.264/H.265 and ADTS for AAC; other audio codecs are
/// raw. Timestamp units depend on the container: 90 kHz for MPEG-2 TS/PS,
/// milliseconds for FLV, and the track's timescale for `.mp4`.
#[derive(Clone, Debug)]
pub struct Frame {
    pub codec: CodecId,
    pub data: Bytes,
    pub pts: i64,
    pub dts: i64,
    pub is_key: bool,
}

impl Frame {
    pub fn new(codec: CodecId, data: Bytes, pts: i64, dts: i64) -> Self {
        Frame {
            codec,
            data,
            pts,
            dts,
            is_key: false,
        }
    }
}
