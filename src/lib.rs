// This file is part of Moonfire Remux, a media container remuxing toolkit.
// Copyright (C) 2024 The Moonfire Remux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Container remuxing without transcoding.
//!
//! The crate is layered leaves-first:
//!
//! * [`bitio`]: bit-oriented reading/writing over byte buffers.
//! * [`nal`], [`h264`], [`h265`], [`aac`], [`mp3`]: codec-parameter parsing
//!   and extradata canonicalization.
//! * [`flv`], [`mp4`], [`mpegts`], [`mpegps`]: container demux/mux engines.
//!
//! Data flow is symmetric: demuxers consume container bytes and yield
//! [`Frame`]s (Annex B for H.264/H.265, ADTS for AAC); muxers consume
//! [`Frame`]-shaped writes and produce container bytes. Everything is
//! synchronous; instances own their buffers and share nothing.

pub mod aac;
mod au;
pub mod bitio;
mod codec;
pub mod crc;
pub mod flv;
pub mod h264;
pub mod h265;
pub mod mp3;
pub mod mp4;
pub mod mpegps;
pub mod mpegts;
pub mod nal;
mod pes;
pub mod timestamp;

#[cfg(test)]
mod testutil;

pub use base::{Error, ErrorKind, ResultExt};
pub use codec::{CodecId, Frame};
