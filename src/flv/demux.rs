// This file is part of Moonfire Remux, a media container remuxing toolkit.
// Copyright (C) 2024 The Moonfire Remux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use super::*;
use crate::codec::{CodecId, Frame};
use crate::h264::AvcDecoderConfigurationRecord;
use crate::h265::HevcDecoderConfigurationRecord;
use crate::{aac, h264, h265, nal};
use base::{bail, Error};
use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};
use tracing::warn;

/// A push-driven FLV file/stream demuxer.
///
/// Feed arbitrary byte chunks to [`Demuxer::input`] and drain decoded frames
/// with [`Demuxer::next_frame`]. Video frames come out in Annex B form with
/// cached SPS/PPS (and VPS for HEVC) prepended to IDR frames that lack
/// inline parameter sets; AAC comes out as ADTS frames. Timestamps are in
/// milliseconds.
pub struct Demuxer {
    buf: Vec<u8>,
    past_file_header: bool,
    poisoned: bool,
    avc: AvcTagDemuxer,
    hevc: HevcTagDemuxer,
    aac: AacTagDemuxer,
    frames: VecDeque<Frame>,
}

impl Default for Demuxer {
    fn default() -> Self {
        Demuxer::new()
    }
}

impl Demuxer {
    pub fn new() -> Self {
        Demuxer {
            buf: Vec::new(),
            past_file_header: false,
            poisoned: false,
            avc: AvcTagDemuxer::default(),
            hevc: HevcTagDemuxer::default(),
            aac: AacTagDemuxer::default(),
            frames: VecDeque::new(),
        }
    }

    /// Consumes a chunk of the stream. Partial tags are buffered until the
    /// next call.
    pub fn input(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.poisoned {
            bail!(FailedPrecondition, msg("demuxer previously failed"));
        }
        self.buf.extend_from_slice(data);
        match self.run() {
            Ok(consumed) => {
                self.buf.drain(..consumed);
                Ok(())
            }
            Err(e) => {
                self.poisoned = true;
                Err(e)
            }
        }
    }

    /// Returns the next decoded frame, if any are buffered.
    pub fn next_frame(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }

    fn run(&mut self) -> Result<usize, Error> {
        let mut pos = 0;
        if !self.past_file_header {
            if self.buf.len() < 13 {
                return Ok(0);
            }
            if &self.buf[0..3] != b"FLV" {
                bail!(DataLoss, msg("missing FLV signature"));
            }
            let header_size = u32::from_be_bytes([self.buf[5], self.buf[6], self.buf[7], self.buf[8]]) as usize;
            if header_size < 9 {
                bail!(DataLoss, msg("FLV header size {} < 9", header_size));
            }
            // header + first PreviousTagSize.
            if self.buf.len() < header_size + 4 {
                return Ok(0);
            }
            pos = header_size + 4;
            self.past_file_header = true;
        }
        loop {
            if self.buf.len() - pos < 11 {
                return Ok(pos);
            }
            let hdr = TagHeader::decode(self.buf[pos..pos + 11].try_into().unwrap());
            let total = 11 + hdr.data_size as usize + 4;
            if self.buf.len() - pos < total {
                return Ok(pos);
            }
            let body_range = pos + 11..pos + 11 + hdr.data_size as usize;
            let prev_size = u32::from_be_bytes(
                self.buf[pos + total - 4..pos + total].try_into().unwrap(),
            );
            if prev_size != 11 + hdr.data_size {
                warn!(
                    "tag at offset {} has PreviousTagSize {} (expected {})",
                    pos,
                    prev_size,
                    11 + hdr.data_size
                );
            }
            // Move the body out of the way so the tag decoders can borrow it
            // while pushing frames.
            let body = self.buf[body_range].to_vec();
            let dts = hdr.timestamp as i64;
            match hdr.tag_type {
                TAG_TYPE_VIDEO => self.decode_video_tag(&body, dts)?,
                TAG_TYPE_AUDIO => self.decode_audio_tag(&body, dts)?,
                TAG_TYPE_SCRIPT => {}
                t => bail!(DataLoss, msg("unknown FLV tag type {}", t)),
            }
            pos += total;
        }
    }

    fn decode_video_tag(&mut self, body: &[u8], dts: i64) -> Result<(), Error> {
        if body.is_empty() {
            return Ok(());
        }
        let is_ex_header = body[0] & 0x80 != 0;
        if is_ex_header || body[0] & 0x0f == VIDEO_CODEC_HEVC {
            self.hevc.decode(body, dts, &mut self.frames)
        } else {
            match video_codec_to_codec(body[0] & 0x0f)? {
                CodecId::H264 => self.avc.decode(body, dts, &mut self.frames),
                _ => unreachable!(),
            }
        }
    }

    fn decode_audio_tag(&mut self, body: &[u8], dts: i64) -> Result<(), Error> {
        if body.is_empty() {
            return Ok(());
        }
        let codec = sound_format_to_codec(body[0] >> 4)?;
        match codec {
            CodecId::Aac => self.aac.decode(body, dts, &mut self.frames),
            CodecId::G711A | CodecId::G711U | CodecId::Mp3 => {
                let mut f = Frame::new(codec, Bytes::copy_from_slice(&body[1..]), dts, dts);
                f.is_key = true;
                self.frames.push_back(f);
                Ok(())
            }
            _ => unreachable!(),
        }
    }
}

/// AVC tag decoding: an `AVCDecoderConfigurationRecord` sequence header
/// populates the SPS/PPS caches; NALU packets convert to Annex B.
#[derive(Default)]
struct AvcTagDemuxer {
    /// Keyed by parameter-set id, stored with a 4-byte start code so they can
    /// be prepended to an outgoing frame directly.
    sps: BTreeMap<u64, Vec<u8>>,
    pps: BTreeMap<u64, Vec<u8>>,
}

impl AvcTagDemuxer {
    fn decode(&mut self, data: &[u8], dts: i64, out: &mut VecDeque<Frame>) -> Result<(), Error> {
        if data.len() < 5 {
            bail!(DataLoss, msg("AVC tag shorter than 5 bytes"));
        }
        let frame_type = data[0] >> 4;
        let packet_type = data[1];
        let cts = cts_from_be24(&data[2..5]) as i64;
        let body = &data[5..];
        if packet_type == PACKET_SEQUENCE_HEADER {
            let record = AvcDecoderConfigurationRecord::parse(body)?;
            for sps in &record.sps {
                let mut v = vec![0, 0, 0, 1];
                v.extend_from_slice(sps);
                self.sps.insert(h264::sps_id(sps)?, v);
            }
            for pps in &record.pps {
                let mut v = vec![0, 0, 0, 1];
                v.extend_from_slice(pps);
                self.pps.insert(h264::pps_id(pps)?.0, v);
            }
            return Ok(());
        }

        let mut annexb = Vec::with_capacity(body.len() + 32);
        nal::length_prefixed_to_annex_b(body, &mut annexb)?;
        let (mut has_sps, mut has_pps, mut has_idr) = (false, false, false);
        nal::split_annex_b(&annexb, |unit| {
            match h264::nal_type(unit) {
                h264::NAL_SPS => has_sps = true,
                h264::NAL_PPS => has_pps = true,
                h264::NAL_IDR_SLICE => has_idr = true,
                _ => {}
            }
            Ok(())
        })?;

        let payload = if has_idr && (!has_sps || !has_pps) {
            let mut v = Vec::with_capacity(annexb.len() + 256);
            for sps in self.sps.values() {
                v.extend_from_slice(sps);
            }
            for pps in self.pps.values() {
                v.extend_from_slice(pps);
            }
            v.extend_from_slice(&annexb);
            v
        } else {
            annexb
        };
        if payload.is_empty() {
            return Ok(());
        }
        let mut f = Frame::new(CodecId::H264, payload.into(), dts + cts, dts);
        f.is_key = frame_type == FRAME_TYPE_KEY;
        out.push_back(f);
        Ok(())
    }
}

/// HEVC tag decoding, accepting both the legacy layout and the enhanced-RTMP
/// layout (bit 0x80 of the first byte set, fourcc `hvc1`).
#[derive(Default)]
struct HevcTagDemuxer {
    /// Cached VPS/SPS/PPS in Annex B form, from the last sequence header.
    sps_pps_vps: Vec<u8>,
}

impl HevcTagDemuxer {
    fn decode(&mut self, data: &[u8], dts: i64, out: &mut VecDeque<Frame>) -> Result<(), Error> {
        if data.len() < 5 {
            bail!(DataLoss, msg("HEVC tag shorter than 5 bytes"));
        }
        let frame_type = (data[0] >> 4) & 0x07;
        let is_key = frame_type == FRAME_TYPE_KEY;
        if data[0] & 0x80 != 0 {
            // enhanced-rtmp layout: packet type in the low nibble, then the
            // fourcc.
            let packet_type = data[0] & 0x0f;
            if &data[1..5] != b"hvc1" {
                bail!(
                    Unimplemented,
                    msg("unsupported enhanced-flv fourcc {:?}", &data[1..5])
                );
            }
            match packet_type {
                EX_PACKET_SEQUENCE_START => {
                    let record = HevcDecoderConfigurationRecord::parse(&data[5..])?;
                    self.sps_pps_vps = record.to_annex_b();
                    Ok(())
                }
                EX_PACKET_CODED_FRAMES => {
                    if data.len() < 8 {
                        bail!(DataLoss, msg("CodedFrames packet shorter than 8 bytes"));
                    }
                    let cts = cts_from_be24(&data[5..8]) as i64;
                    self.decode_nalus(&data[8..], dts, cts, is_key, out)
                }
                EX_PACKET_CODED_FRAMES_X => self.decode_nalus(&data[5..], dts, 0, is_key, out),
                EX_PACKET_SEQUENCE_END => Ok(()),
                t => {
                    warn!("ignoring enhanced-flv packet type {}", t);
                    Ok(())
                }
            }
        } else {
            let packet_type = data[1];
            let cts = cts_from_be24(&data[2..5]) as i64;
            if packet_type == PACKET_SEQUENCE_HEADER {
                let record = HevcDecoderConfigurationRecord::parse(&data[5..])?;
                self.sps_pps_vps = record.to_annex_b();
                Ok(())
            } else {
                self.decode_nalus(&data[5..], dts, cts, is_key, out)
            }
        }
    }

    fn decode_nalus(
        &mut self,
        body: &[u8],
        dts: i64,
        cts: i64,
        is_key: bool,
        out: &mut VecDeque<Frame>,
    ) -> Result<(), Error> {
        let mut annexb = Vec::with_capacity(body.len() + 32);
        nal::length_prefixed_to_annex_b(body, &mut annexb)?;
        let (mut has_vps, mut has_sps, mut has_pps, mut has_irap) = (false, false, false, false);
        nal::split_annex_b(&annexb, |unit| {
            match h265::nal_type(unit) {
                h265::NAL_VPS => has_vps = true,
                h265::NAL_SPS => has_sps = true,
                h265::NAL_PPS => has_pps = true,
                t if h265::is_irap(t) => has_irap = true,
                _ => {}
            }
            Ok(())
        })?;
        let payload = if has_irap && (!has_vps || !has_sps || !has_pps) {
            let mut v = Vec::with_capacity(self.sps_pps_vps.len() + annexb.len());
            v.extend_from_slice(&self.sps_pps_vps);
            v.extend_from_slice(&annexb);
            v
        } else {
            annexb
        };
        if payload.is_empty() {
            return Ok(());
        }
        let mut f = Frame::new(CodecId::H265, payload.into(), dts + cts, dts);
        f.is_key = is_key;
        out.push_back(f);
        Ok(())
    }
}

/// AAC tag decoding: the sequence header caches the `AudioSpecificConfig`;
/// raw packets are re-framed as ADTS.
#[derive(Default)]
struct AacTagDemuxer {
    asc: Option<aac::AudioSpecificConfig>,
}

impl AacTagDemuxer {
    fn decode(&mut self, data: &[u8], dts: i64, out: &mut VecDeque<Frame>) -> Result<(), Error> {
        if data.len() < 2 {
            bail!(DataLoss, msg("AAC tag shorter than 2 bytes"));
        }
        let packet_type = data[1];
        let body = &data[2..];
        if packet_type == PACKET_SEQUENCE_HEADER {
            self.asc = Some(aac::AudioSpecificConfig::decode(body)?);
            return Ok(());
        }
        let asc = match &self.asc {
            Some(asc) => asc,
            None => {
                // No sequence header yet; nothing to build an ADTS header
                // from. Drop the frame rather than failing the stream.
                warn!("dropping AAC frame that arrived before the AudioSpecificConfig");
                return Ok(());
            }
        };
        let hdr = aac::asc_to_adts(asc, body.len() + 7)?;
        let mut frame = hdr.encode();
        frame.extend_from_slice(body);
        let mut f = Frame::new(CodecId::Aac, frame.into(), dts, dts);
        f.is_key = true;
        out.push_back(f);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // Most demuxer coverage lives in `super::mux::tests`, which round-trips
    // muxer output back through the demuxer. The enhanced-RTMP layout has no
    // muxer counterpart, so it's driven directly here.
    use super::*;
    use crate::h265::HevcDecoderConfigurationRecord;
    use crate::testutil::{self, h265 as h265_data};

    fn tag(tag_type: u8, timestamp: u32, body: &[u8]) -> Vec<u8> {
        let hdr = TagHeader {
            tag_type,
            data_size: body.len() as u32,
            timestamp,
        };
        let mut v = hdr.encode().to_vec();
        v.extend_from_slice(body);
        v.extend_from_slice(&(11 + body.len() as u32).to_be_bytes());
        v
    }

    fn avcc(units: &[&[u8]]) -> Vec<u8> {
        let mut v = Vec::new();
        for u in units {
            v.extend_from_slice(&(u.len() as u32).to_be_bytes());
            v.extend_from_slice(u);
        }
        v
    }

    #[test]
    fn enhanced_hevc_layout() {
        testutil::init();
        let vps = h265_data::vps();
        let sps = h265_data::sps();
        let pps = h265_data::pps(false, false);
        let idr = h265_data::idr_slice();
        let mut record = HevcDecoderConfigurationRecord::new();
        record.update_vps(&vps).unwrap();
        record.update_sps(&sps).unwrap();
        record.update_pps(&pps).unwrap();

        let mut stream = FILE_HEADER.to_vec();
        // SequenceStart: keyframe | ex-header, packet type 0, fourcc, record.
        let mut body = vec![0x80 | FRAME_TYPE_KEY << 4 | EX_PACKET_SEQUENCE_START];
        body.extend_from_slice(b"hvc1");
        body.extend_from_slice(&record.encode().unwrap());
        stream.extend_from_slice(&tag(TAG_TYPE_VIDEO, 0, &body));
        // CodedFrames: 3-byte cts then AVCC NALs, no inline parameter sets.
        let mut body = vec![0x80 | FRAME_TYPE_KEY << 4 | EX_PACKET_CODED_FRAMES];
        body.extend_from_slice(b"hvc1");
        body.extend_from_slice(&[0x00, 0x00, 0x28]); // cts = 40
        body.extend_from_slice(&avcc(&[&idr]));
        stream.extend_from_slice(&tag(TAG_TYPE_VIDEO, 1000, &body));
        // CodedFramesX: implicit zero cts.
        let mut body = vec![0x80 | 2 << 4 | EX_PACKET_CODED_FRAMES_X];
        body.extend_from_slice(b"hvc1");
        body.extend_from_slice(&avcc(&[&idr]));
        stream.extend_from_slice(&tag(TAG_TYPE_VIDEO, 1040, &body));

        let mut demuxer = Demuxer::new();
        demuxer.input(&stream).unwrap();
        let f1 = demuxer.next_frame().unwrap();
        assert_eq!(f1.codec, CodecId::H265);
        assert!(f1.is_key);
        assert_eq!((f1.pts, f1.dts), (1040, 1000));
        // The cached VPS/SPS/PPS are prepended before the bare IDR.
        let mut expected = record.to_annex_b();
        expected.extend_from_slice(&[0, 0, 0, 1]);
        expected.extend_from_slice(&idr);
        assert_eq!(&f1.data[..], &expected[..]);
        let f2 = demuxer.next_frame().unwrap();
        assert!(!f2.is_key);
        assert_eq!((f2.pts, f2.dts), (1040, 1040));
        assert!(demuxer.next_frame().is_none());
    }
}
