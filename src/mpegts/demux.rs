// This file is part of Moonfire Remux, a media container remuxing toolkit.
// Copyright (C) 2024 The Moonfire Remux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use super::*;
use crate::au::AuSplitter;
use crate::codec::{CodecId, Frame};
use crate::pes::PesHeader;
use crate::{h264, h265};
use base::ErrorKind;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace, warn};

/// A push-driven transport-stream demuxer.
///
/// Feed byte chunks to [`Demuxer::input`]; alignment is recovered by finding
/// two sync bytes 188 apart. PAT and PMT sections build the program map;
/// elementary PES packets reassemble into access units (video, split by the
/// Annex B boundary rules with AUDs stripped) or PTS-delimited frames
/// (audio). Call [`Demuxer::flush`] at end of stream to drain the last
/// partially-observed frames. Timestamps are 90 kHz.
pub struct Demuxer {
    residual: Vec<u8>,
    synced: bool,
    /// PMT PID -> program state, learned from the PAT.
    programs: HashMap<u16, Program>,
    frames: VecDeque<Frame>,
}

#[derive(Default)]
struct Program {
    program_number: u16,
    /// elementary PID -> stream state.
    streams: HashMap<u16, Stream>,
}

struct Stream {
    codec: CodecId,
    /// Access-unit reassembly for video streams.
    splitter: Option<AuSplitter>,
    /// Reassembly buffer for audio runs.
    buf: Vec<u8>,
    pts: u64,
    dts: u64,
    /// Timestamps of the most recent PES header on this PID.
    pes_pts: u64,
    pes_dts: u64,
    saw_pes: bool,
}

impl Stream {
    fn new(codec: CodecId) -> Self {
        Stream {
            codec,
            splitter: codec.is_video().then(|| AuSplitter::new(codec)),
            buf: Vec::with_capacity(1024),
            pts: 0,
            dts: 0,
            pes_pts: 0,
            pes_dts: 0,
            saw_pes: false,
        }
    }

    fn assembling(&self) -> bool {
        match &self.splitter {
            Some(s) => !s.is_empty(),
            None => !self.buf.is_empty(),
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
            residual: Vec::new(),
            synced: false,
            programs: HashMap::new(),
            frames: VecDeque::new(),
        }
    }

    /// Returns the next decoded frame, if any are buffered.
    pub fn next_frame(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }

    /// Consumes a chunk of the stream; a partial trailing packet is kept for
    /// the next call. A malformed packet is dropped and alignment
    /// re-acquired rather than failing the stream.
    pub fn input(&mut self, data: &[u8]) -> Result<(), Error> {
        self.residual.extend_from_slice(data);
        let mut pos = 0;
        loop {
            if !self.synced {
                match sync_offset(&self.residual[pos..]) {
                    Some(skip) => {
                        if skip > 0 {
                            debug!("skipped {} bytes acquiring sync", skip);
                        }
                        pos += skip;
                        self.synced = true;
                    }
                    None => break,
                }
            }
            if self.residual.len() - pos < PACKET_SIZE {
                break;
            }
            let packet: &[u8] = &self.residual[pos..pos + PACKET_SIZE];
            if packet[0] != SYNC_BYTE {
                // Lost alignment mid-stream; rescan.
                self.synced = false;
                continue;
            }
            // Copy so frame assembly may borrow `self` freely.
            let packet = packet.to_vec();
            pos += PACKET_SIZE;
            if let Err(e) = self.handle_packet(&packet) {
                // A structure that doesn't fit its packet is as unusable as
                // one that's outright corrupt; drop it and realign.
                if matches!(e.kind(), ErrorKind::DataLoss | ErrorKind::OutOfRange) {
                    warn!("dropping malformed TS packet: {}", e);
                    continue;
                }
                self.residual.drain(..pos);
                return Err(e);
            }
        }
        self.residual.drain(..pos);
        Ok(())
    }

    /// Emits any frames still being assembled. Call at end of stream.
    pub fn flush(&mut self) {
        let mut emitted = Vec::new();
        for program in self.programs.values_mut() {
            for stream in program.streams.values_mut() {
                let payload = match &mut stream.splitter {
                    Some(splitter) => splitter.flush(),
                    None if !stream.buf.is_empty() => Some(std::mem::take(&mut stream.buf)),
                    None => None,
                };
                if let Some(payload) = payload {
                    emitted.push(make_frame(stream, payload));
                }
            }
        }
        self.frames.extend(emitted);
    }

    fn handle_packet(&mut self, packet: &[u8]) -> Result<(), Error> {
        let mut r = BitReader::new(packet);
        let hdr = PacketHeader::decode(&mut r)?;
        if hdr.pid == PID_NULL {
            return Ok(());
        }
        if hdr.adaptation_field_control & 0b10 != 0 {
            AdaptationField::decode(&mut r)?;
        }
        if hdr.adaptation_field_control & 0b01 == 0 {
            return Ok(());
        }
        let payload = r.remaining_data();
        if hdr.pid == PID_PAT {
            let section = section_payload(payload, hdr.payload_unit_start)?;
            let pat = Pat::decode(section)?;
            for &(program_number, pid) in &pat.programs {
                if program_number == 0 {
                    continue; // network PID
                }
                self.programs.entry(pid).or_default();
            }
            return Ok(());
        }
        if self.programs.contains_key(&hdr.pid) {
            let section = section_payload(payload, hdr.payload_unit_start)?;
            let pmt = Pmt::decode(section)?;
            let program = self.programs.get_mut(&hdr.pid).unwrap();
            program.program_number = pmt.program_number;
            for &(stream_type, pid) in &pmt.streams {
                if program.streams.contains_key(&pid) {
                    continue;
                }
                match stream_type_to_codec(stream_type) {
                    Some(codec) => {
                        debug!(
                            "program {}: pid {:#06x} is {:?} (stream type {:#04x})",
                            program.program_number, pid, codec, stream_type
                        );
                        program.streams.insert(pid, Stream::new(codec));
                    }
                    None => warn!("ignoring stream type {:#04x} on pid {:#06x}", stream_type, pid),
                }
            }
            return Ok(());
        }
        // Elementary stream?
        let Some(stream) = self
            .programs
            .values_mut()
            .find_map(|p| p.streams.get_mut(&hdr.pid))
        else {
            trace!("ignoring packet on unmapped pid {:#06x}", hdr.pid);
            return Ok(());
        };
        let es_payload: &[u8] = if hdr.payload_unit_start {
            let pes = PesHeader::parse(payload)?;
            stream.pes_pts = pes.pts.unwrap_or(stream.pes_pts);
            stream.pes_dts = pes.dts_or_pts().unwrap_or(stream.pes_dts);
            stream.saw_pes = true;
            &payload[pes.header_len..]
        } else {
            if !stream.saw_pes {
                return Ok(()); // mid-PES join; wait for a unit start
            }
            payload
        };
        let mut out = Vec::new();
        if stream.codec.is_video() {
            do_video(stream, es_payload, &mut out);
        } else {
            do_audio(stream, es_payload, hdr.payload_unit_start, &mut out);
        }
        self.frames.extend(out);
        Ok(())
    }
}

/// Finds the offset of a sync byte confirmed by a second one 188 bytes
/// later, per the usual two-packet heuristic.
fn sync_offset(data: &[u8]) -> Option<usize> {
    if data.len() < PACKET_SIZE + 1 {
        return data.first().and_then(|&b| if b == SYNC_BYTE { Some(0) } else { None });
    }
    (0..data.len() - PACKET_SIZE)
        .find(|&i| data[i] == SYNC_BYTE && data[i + PACKET_SIZE] == SYNC_BYTE)
}

/// A PSI payload starts with a pointer field when the unit-start flag is
/// set; 0xff bytes before the table id are padding.
fn section_payload(payload: &[u8], unit_start: bool) -> Result<&[u8], Error> {
    let mut rest = payload;
    if unit_start {
        if rest.is_empty() {
            bail!(DataLoss, msg("empty section payload"));
        }
        let pointer = rest[0] as usize;
        if rest.len() < 1 + pointer {
            bail!(DataLoss, msg("pointer_field {} overflows packet", pointer));
        }
        rest = &rest[1 + pointer..];
    }
    while let [0xff, tail @ ..] = rest {
        rest = tail;
    }
    Ok(rest)
}

fn make_frame(stream: &Stream, payload: Vec<u8>) -> Frame {
    build_frame(stream.codec, payload, stream.pts, stream.dts)
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

/// Appends PES payload bytes and emits every completed access unit: a new
/// unit begins at an AUD/parameter-set/SEI NAL or at a VCL NAL whose first
/// slice-header bit says it opens a picture.
fn do_video(stream: &mut Stream, payload: &[u8], out: &mut Vec<Frame>) {
    if !stream.assembling() {
        stream.pts = stream.pes_pts;
        stream.dts = stream.pes_dts;
    }
    let codec = stream.codec;
    let (pts, dts) = (stream.pts, stream.dts);
    let splitter = stream.splitter.as_mut().expect("video stream has a splitter");
    let mut frames = Vec::new();
    let emitted = splitter.push(payload, |frame| frames.push(frame));
    for frame in frames {
        out.push(build_frame(codec, frame, pts, dts));
    }
    if emitted {
        stream.pts = stream.pes_pts;
        stream.dts = stream.pes_dts;
    }
}

/// Audio frames are delimited by a new PES unit start or a PTS change.
fn do_audio(stream: &mut Stream, payload: &[u8], unit_start: bool, out: &mut Vec<Frame>) {
    if stream.buf.is_empty() {
        stream.pts = stream.pes_pts;
        stream.dts = stream.pes_dts;
    } else if unit_start || stream.pes_pts != stream.pts {
        let buf = std::mem::take(&mut stream.buf);
        out.push(make_frame(stream, buf));
        stream.pts = stream.pes_pts;
        stream.dts = stream.pes_dts;
    }
    stream.buf.extend_from_slice(payload);
}

#[cfg(test)]
mod tests {
    // Round-trip coverage lives in `super::mux::tests`.
}
