// This file is part of Moonfire Remux, a media container remuxing toolkit.
// Copyright (C) 2024 The Moonfire Remux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use super::*;
use crate::au::AuSplitter;
use crate::codec::{CodecId, Frame};
use crate::pes::{self, PesHeader};
use crate::{h264, h265, nal};
use base::ErrorKind;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace, warn};

/// How many NAL-type points a PSM-less MPEG-1 video stream must score
/// before its codec is decided.
const GUESS_THRESHOLD: i32 = 4;

/// No pack-layer structure legitimately needs more than a maximal PES
/// (0xFFFF + 6 bytes) to parse; anything still incomplete past this is a
/// corrupt length field.
const MAX_STRUCTURE_LEN: usize = 0x1_0000 + 6;

/// A push-driven program-stream demuxer.
///
/// Feed byte chunks to [`Demuxer::input`]. Pack/system/PSM headers are
/// tracked; PES packets reassemble into access units (video) or
/// PTS-delimited frames (audio). MPEG-1 system streams lack a PSM, so each
/// stream's codec is guessed by scoring the NAL types it carries. On a
/// malformed byte the scanner advances one byte and resumes its start-code
/// search. Timestamps are 90 kHz.
pub struct Demuxer {
    cache: Vec<u8>,
    mpeg1: bool,
    streams: HashMap<u8, Stream>,
    frames: VecDeque<Frame>,
}

struct Stream {
    stream_id: u8,
    /// `None` until a PSM names the codec or the guesser reaches its
    /// threshold.
    codec: Option<CodecId>,
    splitter: Option<AuSplitter>,
    buf: Vec<u8>,
    pts: u64,
    dts: u64,
    pes_pts: u64,
    pes_dts: u64,
}

impl Stream {
    fn new(stream_id: u8, codec: Option<CodecId>) -> Self {
        Stream {
            stream_id,
            codec,
            splitter: codec
                .filter(|c| c.is_video())
                .map(AuSplitter::new),
            buf: Vec::with_capacity(4096),
            pts: 0,
            dts: 0,
            pes_pts: 0,
            pes_dts: 0,
        }
    }

    fn set_codec(&mut self, codec: CodecId) {
        self.codec = Some(codec);
        if codec.is_video() && self.splitter.is_none() {
            self.splitter = Some(AuSplitter::new(codec));
        }
    }
}

impl Default for Demuxer {
    fn default() -> Self {
        Demuxer::new()
    }
}

impl Demuxer {
    pub fn new() -> Self {
        Demuxer {
            cache: Vec::new(),
            mpeg1: false,
            streams: HashMap::new(),
            frames: VecDeque::new(),
        }
    }

    pub fn next_frame(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }

    /// Consumes a chunk of the stream; incomplete structures are kept for
    /// the next call.
    pub fn input(&mut self, data: &[u8]) -> Result<(), Error> {
        self.cache.extend_from_slice(data);
        let mut pos = 0;
        loop {
            let rest_len = self.cache.len() - pos;
            if rest_len < 4 {
                break;
            }
            if self.cache[pos] != 0 || self.cache[pos + 1] != 0 || self.cache[pos + 2] != 1 {
                // Not at a start code; resume the search one byte on.
                pos += 1;
                continue;
            }
            let code = self.cache[pos + 3];
            let rest = self.cache[pos..].to_vec(); // own it so handlers can borrow self
            let consumed = match self.handle_structure(code, &rest) {
                Ok(None) => {
                    // Needs more input. A structure that claims more than any
                    // legal one can hold is a corrupt length field; skip a
                    // byte instead of buffering forever.
                    if rest.len() > MAX_STRUCTURE_LEN {
                        warn!(
                            "start code {:#04x} still incomplete after {} bytes; skipping",
                            code,
                            rest.len()
                        );
                        pos += 1;
                        continue;
                    }
                    break;
                }
                Ok(Some(n)) => n,
                Err(e) if e.kind() == ErrorKind::DataLoss => {
                    warn!("skipping byte after parse error: {}", e);
                    1
                }
                Err(e) => {
                    self.cache.drain(..pos);
                    return Err(e);
                }
            };
            pos += consumed;
        }
        self.cache.drain(..pos);
        Ok(())
    }

    /// Emits any frames still being assembled. Call at end of stream.
    pub fn flush(&mut self) {
        let mut emitted = Vec::new();
        for stream in self.streams.values_mut() {
            let payload = match &mut stream.splitter {
                Some(splitter) => splitter.flush(),
                None if !stream.buf.is_empty() => Some(std::mem::take(&mut stream.buf)),
                None => None,
            };
            if let (Some(payload), Some(codec)) = (payload, stream.codec) {
                emitted.push(build_frame(codec, payload, stream.pts, stream.dts));
            }
        }
        self.frames.extend(emitted);
    }

    /// Dispatches one `00 00 01 <code>` structure. `Ok(None)` means the
    /// cache ends mid-structure.
    fn handle_structure(&mut self, code: u8, data: &[u8]) -> Result<Option<usize>, Error> {
        let need_more =
            |e: Error| -> Result<Option<usize>, Error> {
                if e.kind() == ErrorKind::OutOfRange {
                    Ok(None)
                } else {
                    Err(e)
                }
            };
        match code {
            pes::STREAM_ID_PACK_START => {
                let (hdr, consumed) = match PackHeader::parse(data) {
                    Ok(v) => v,
                    Err(e) => return need_more(e),
                };
                self.mpeg1 = hdr.is_mpeg1;
                Ok(Some(consumed))
            }
            pes::STREAM_ID_SYSTEM_HEADER => {
                let (_, consumed) = match SystemHeader::parse(data) {
                    Ok(v) => v,
                    Err(e) => return need_more(e),
                };
                Ok(Some(consumed))
            }
            pes::STREAM_ID_PSM => {
                let (psm, consumed) = match ProgramStreamMap::parse(data) {
                    Ok(v) => v,
                    Err(e) => return need_more(e),
                };
                for &(stream_type, stream_id) in &psm.entries {
                    match stream_type_to_codec(stream_type) {
                        Some(codec) => {
                            self.streams
                                .entry(stream_id)
                                .or_insert_with(|| Stream::new(stream_id, Some(codec)))
                                .set_codec(codec);
                            debug!("stream {:#04x}: {:?}", stream_id, codec);
                        }
                        None => {
                            warn!("ignoring stream type {:#04x} in PSM", stream_type)
                        }
                    }
                }
                Ok(Some(consumed))
            }
            pes::STREAM_ID_PROGRAM_END => Ok(Some(4)),
            pes::STREAM_ID_PRIVATE_1
            | pes::STREAM_ID_PADDING
            | pes::STREAM_ID_PRIVATE_2
            | pes::STREAM_ID_DIRECTORY
            | 0xf0..=0xfb => {
                // Skip by declared length.
                if data.len() < 6 {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([data[4], data[5]]) as usize;
                if data.len() < 6 + len {
                    return Ok(None);
                }
                Ok(Some(6 + len))
            }
            id if pes::is_audio_stream_id(id) || pes::is_video_stream_id(id) => {
                let pes = match if self.mpeg1 {
                    PesHeader::parse_mpeg1(data)
                } else {
                    PesHeader::parse(data)
                } {
                    Ok(h) => h,
                    Err(e) => return need_more(e),
                };
                let (payload, consumed) = match pes.payload_len() {
                    Some(len) => {
                        if data.len() < pes.header_len + len {
                            return Ok(None);
                        }
                        (&data[pes.header_len..pes.header_len + len], pes.header_len + len)
                    }
                    None => (&data[pes.header_len..], data.len()),
                };
                self.handle_pes(&pes, payload);
                Ok(Some(consumed))
            }
            _ => {
                trace!("skipping unknown start code {:#04x}", code);
                Ok(Some(1))
            }
        }
    }

    fn handle_pes(&mut self, pes: &PesHeader, payload: &[u8]) {
        if !self.streams.contains_key(&pes.stream_id) {
            if !self.mpeg1 {
                trace!("ignoring PES for undeclared stream {:#04x}", pes.stream_id);
                return;
            }
            // MPEG-1 streams carry no PSM; register the stream and guess its
            // codec from content.
            self.streams
                .insert(pes.stream_id, Stream::new(pes.stream_id, None));
        }
        let stream = self.streams.get_mut(&pes.stream_id).unwrap();
        if let Some(pts) = pes.pts {
            stream.pes_pts = pts;
        }
        if let Some(dts) = pes.dts_or_pts() {
            stream.pes_dts = dts;
        }
        if stream.codec.is_none() {
            stream.buf.extend_from_slice(payload);
            stream.pts = stream.pes_pts;
            stream.dts = stream.pes_dts;
            if let Some(codec) = guess_codec(stream.stream_id, &stream.buf) {
                debug!("guessed {:?} for stream {:#04x}", codec, stream.stream_id);
                stream.set_codec(codec);
                if codec.is_video() {
                    // Replay the accumulated bytes through the splitter.
                    let buf = std::mem::take(&mut stream.buf);
                    let codec_frames = drive_video(stream, &buf);
                    self.frames.extend(codec_frames);
                }
            }
            return;
        }
        let out: Vec<Frame> = if stream.codec.unwrap().is_video() {
            drive_video(stream, payload)
        } else {
            drive_audio(stream, payload)
        };
        self.frames.extend(out);
    }
}

fn drive_video(stream: &mut Stream, payload: &[u8]) -> Vec<Frame> {
    let codec = stream.codec.expect("video stream has a codec");
    if stream.splitter.as_ref().map(|s| s.is_empty()).unwrap_or(true) {
        stream.pts = stream.pes_pts;
        stream.dts = stream.pes_dts;
    }
    let (pts, dts) = (stream.pts, stream.dts);
    let splitter = stream.splitter.as_mut().expect("video stream has a splitter");
    let mut frames = Vec::new();
    let emitted = splitter.push(payload, |frame| {
        frames.push(build_frame(codec, frame, pts, dts));
    });
    if emitted {
        stream.pts = stream.pes_pts;
        stream.dts = stream.pes_dts;
    }
    frames
}

fn drive_audio(stream: &mut Stream, payload: &[u8]) -> Vec<Frame> {
    let codec = stream.codec.expect("audio stream has a codec");
    let mut out = Vec::new();
    if !stream.buf.is_empty() && stream.pes_pts != stream.pts {
        let buf = std::mem::take(&mut stream.buf);
        out.push(build_frame(codec, buf, stream.pts, stream.dts));
    }
    if stream.buf.is_empty() {
        stream.pts = stream.pes_pts;
        stream.dts = stream.pes_dts;
    }
    stream.buf.extend_from_slice(payload);
    out
}

fn build_frame(codec: CodecId, payload: Vec<u8>, pts: u64, dts: u64) -> Frame {
    let mut f = Frame::new(codec, Bytes::from(payload), pts as i64, dts as i64);
    f.is_key = match codec {
        CodecId::H264 => h264::is_idr_frame(&f.data),
        CodecId::H265 => h265::is_irap_frame(&f.data),
        _ => true,
    };
    f
}

/// Scores the NAL types observed so far; H.264 parameter sets and IDR
/// slices count double, plainly-invalid types count against. A stream stays
/// unknown until one codec reaches the threshold.
fn guess_codec(stream_id: u8, buf: &[u8]) -> Option<CodecId> {
    if pes::is_audio_stream_id(stream_id) {
        return Some(CodecId::Aac);
    }
    if !pes::is_video_stream_id(stream_id) {
        return None;
    }
    let mut h264_score = 0i32;
    let mut h265_score = 0i32;
    let mut decided = None;
    let _ = nal::split_annex_b(buf, |unit| {
        let t264 = h264::nal_type(unit);
        if matches!(t264, h264::NAL_SPS | h264::NAL_PPS | h264::NAL_IDR_SLICE) {
            h264_score += 2;
        } else if t264 < h264::NAL_IDR_SLICE {
            h264_score += 1;
        } else if t264 > 20 {
            h264_score -= 1;
        }
        let t265 = h265::nal_type(unit);
        if matches!(t265, h265::NAL_VPS | h265::NAL_SPS | h265::NAL_PPS) || h265::is_irap(t265) {
            h265_score += 2;
        } else if t265 <= h265::NAL_RASL_R {
            h265_score += 1;
        } else if t265 > 40 {
            h265_score -= 1;
        }
        if h264_score > h265_score && h264_score >= GUESS_THRESHOLD {
            decided = Some(CodecId::H264);
        } else if h265_score > h264_score && h265_score >= GUESS_THRESHOLD {
            decided = Some(CodecId::H265);
        }
        Ok(())
    });
    decided
}

#[cfg(test)]
mod tests {
    // Round-trip and MPEG-1 coverage lives in `super::mux::tests`.
}
