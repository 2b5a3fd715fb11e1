// This file is part of Moonfire Remux, a media container remuxing toolkit.
// Copyright (C) 2024 The Moonfire Remux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use super::*;
use crate::codec::CodecId;
use crate::pes::{self, PesHeader};
use crate::{h264, h265, nal};
use std::io::Write;

/// A PES (header included) may declare at most this many bytes after its
/// length field.
const MAX_PES_LENGTH: usize = 0xffff;

/// A program-stream muxer over any byte sink.
///
/// Register streams, then feed frames (Annex B video / ADTS AAC / raw G.711,
/// 90 kHz timestamps). Every frame gets a pack header; the system header and
/// program stream map reappear on the first frame and on every video key
/// frame. Oversized payloads split into multiple PES packets of at most
/// 0xFFFF declared bytes, with the continuation packets carrying no
/// timestamps.
pub struct Muxer<W: Write> {
    w: W,
    system: SystemHeader,
    psm: ProgramStreamMap,
    first_frame: bool,
    failed: bool,
}

impl<W: Write> Muxer<W> {
    pub fn new(w: W) -> Self {
        Muxer {
            w,
            system: SystemHeader {
                rate_bound: 26234,
                ..Default::default()
            },
            psm: ProgramStreamMap {
                version: 1,
                ..Default::default()
            },
            first_frame: true,
            failed: false,
        }
    }

    /// Registers an elementary stream, returning its stream id
    /// (0xE0.. video, 0xC0.. audio).
    pub fn add_stream(&mut self, codec: CodecId) -> Result<u8, Error> {
        let stream_type = codec_to_stream_type(codec)?;
        let stream_id;
        if codec.is_video() {
            stream_id = pes::STREAM_ID_VIDEO_BASE + self.system.video_bound;
            self.system.streams.push(ElementaryStream {
                stream_id,
                buffer_bound_scale: 1,
                buffer_size_bound: 400,
            });
            self.system.video_bound += 1;
        } else {
            stream_id = pes::STREAM_ID_AUDIO_BASE + self.system.audio_bound;
            self.system.streams.push(ElementaryStream {
                stream_id,
                buffer_bound_scale: 0,
                buffer_size_bound: 32,
            });
            self.system.audio_bound += 1;
        }
        self.psm.entries.push((stream_type, stream_id));
        self.psm.version = self.psm.version.wrapping_add(1) & 0x1f;
        Ok(stream_id)
    }

    /// Writes one frame. Timestamps are in 90 kHz units.
    pub fn write_frame(
        &mut self,
        stream_id: u8,
        data: &[u8],
        pts: i64,
        dts: i64,
    ) -> Result<(), Error> {
        if self.failed {
            bail!(FailedPrecondition, msg("muxer previously failed"));
        }
        let Some(&(stream_type, _)) = self
            .psm
            .entries
            .iter()
            .find(|&&(_, sid)| sid == stream_id)
        else {
            bail!(InvalidArgument, msg("unknown stream id {:#04x}", stream_id));
        };
        if data.is_empty() {
            return Ok(());
        }
        let codec = stream_type_to_codec(stream_type).expect("muxer only registers known types");

        let mut with_aud = false;
        let mut idr = false;
        let mut vcl = false;
        if codec.is_video() {
            nal::split_annex_b(data, |unit| {
                match codec {
                    CodecId::H264 => {
                        let t = h264::nal_type(unit);
                        with_aud |= t == h264::NAL_AUD;
                        idr |= t == h264::NAL_IDR_SLICE;
                        vcl |= h264::is_vcl(t);
                    }
                    _ => {
                        let t = h265::nal_type(unit);
                        with_aud |= t == h265::NAL_AUD;
                        idr |= h265::is_irap(t);
                        vcl |= h265::is_vcl(t);
                    }
                }
                Ok(())
            })?;
        }

        let mut out = BitWriter::with_capacity(data.len() + 64);
        // SCR slightly behind the frame's dts, as a real multiplexer's
        // schedule would put it.
        PackHeader {
            is_mpeg1: false,
            scr_base: dts.max(3600) as u64 - 3600,
            scr_ext: 0,
            mux_rate: 6106,
        }
        .encode(&mut out);
        if self.first_frame || idr {
            self.system.encode(&mut out);
            self.psm.encode(&mut out);
            self.first_frame = false;
        }

        let payload: Vec<u8> = match codec {
            CodecId::H264 if !with_aud && vcl => {
                let mut v = Vec::with_capacity(data.len() + h264::AUD_NAL.len());
                v.extend_from_slice(&h264::AUD_NAL);
                v.extend_from_slice(data);
                v
            }
            CodecId::H265 if !with_aud && vcl => {
                let mut v = Vec::with_capacity(data.len() + h265::AUD_NAL.len());
                v.extend_from_slice(&h265::AUD_NAL);
                v.extend_from_slice(data);
                v
            }
            _ => data.to_vec(),
        };

        // First PES carries the timestamps; continuations only the payload.
        let mut first = true;
        let mut rem = &payload[..];
        while !rem.is_empty() {
            let hdr = PesHeader {
                stream_id,
                packet_length: 0, // fixed up below
                data_alignment_indicator: idr && first,
                pts: if first { Some(pts as u64) } else { None },
                dts: if first { Some(dts as u64) } else { None },
                header_len: 0,
            };
            let overhead = hdr.encoded_len() - 6; // bytes counted by packet_length
            let chunk = std::cmp::min(rem.len(), MAX_PES_LENGTH - overhead);
            let hdr = PesHeader {
                packet_length: (overhead + chunk) as u16,
                ..hdr
            };
            hdr.encode(&mut out, &rem[..chunk]);
            rem = &rem[chunk..];
            first = false;
        }

        if let Err(e) = self.w.write_all(out.as_slice()) {
            self.failed = true;
            return Err(base::err!(Unknown, msg("pack write failed"), source(e)));
        }
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.w
    }
}

#[cfg(test)]
mod tests {
    use super::super::Demuxer;
    use super::*;
    use crate::bitio::BitWriter;
    use crate::testutil::{self, H264_IDR, H264_NON_IDR, H264_PPS, H264_SPS};

    fn annexb(units: &[&[u8]]) -> Vec<u8> {
        let mut v = Vec::new();
        for u in units {
            v.extend_from_slice(&[0, 0, 0, 1]);
            v.extend_from_slice(u);
        }
        v
    }

    #[test]
    fn round_trip_h264_g711() {
        testutil::init();
        let frame1 = annexb(&[&H264_SPS, &H264_PPS, &H264_IDR]);
        let frame2 = annexb(&[&H264_NON_IDR]);
        let audio1 = vec![0x55u8; 160];
        let audio2 = vec![0xaau8; 160];
        let mut muxer = Muxer::new(Vec::new());
        let video = muxer.add_stream(CodecId::H264).unwrap();
        let audio = muxer.add_stream(CodecId::G711A).unwrap();
        assert_eq!(video, 0xe0);
        assert_eq!(audio, 0xc0);
        muxer.write_frame(video, &frame1, 9000, 9000).unwrap();
        muxer.write_frame(audio, &audio1, 9000, 9000).unwrap();
        muxer.write_frame(video, &frame2, 12600, 12600).unwrap();
        muxer.write_frame(audio, &audio2, 12600, 12600).unwrap();
        let bytes = muxer.into_inner();
        assert_eq!(&bytes[..4], &[0, 0, 1, 0xba]);

        let mut demuxer = Demuxer::new();
        demuxer.input(&bytes).unwrap();
        demuxer.flush();
        let mut video_frames = Vec::new();
        let mut audio_frames = Vec::new();
        while let Some(f) = demuxer.next_frame() {
            assert!(f.pts >= f.dts);
            match f.codec {
                CodecId::H264 => video_frames.push(f),
                CodecId::G711A => audio_frames.push(f),
                c => panic!("unexpected codec {c:?}"),
            }
        }
        assert_eq!(video_frames.len(), 2);
        assert_eq!(&video_frames[0].data[..], &frame1[..]);
        assert!(video_frames[0].is_key);
        assert_eq!((video_frames[0].pts, video_frames[0].dts), (9000, 9000));
        assert_eq!(&video_frames[1].data[..], &frame2[..]);
        assert_eq!(audio_frames.len(), 2);
        assert_eq!(&audio_frames[0].data[..], &audio1[..]);
        assert_eq!(&audio_frames[1].data[..], &audio2[..]);
    }

    #[test]
    fn oversized_frame_splits_pes_and_reassembles() {
        testutil::init();
        // One NAL large enough to need two PES packets.
        let mut big_idr = H264_IDR.to_vec();
        big_idr.resize(80_000, 0x5a);
        let frame = annexb(&[&H264_SPS, &H264_PPS, &big_idr]);
        let mut muxer = Muxer::new(Vec::new());
        let video = muxer.add_stream(CodecId::H264).unwrap();
        muxer.write_frame(video, &frame, 0, 0).unwrap();
        let bytes = muxer.into_inner();

        let mut demuxer = Demuxer::new();
        demuxer.input(&bytes).unwrap();
        demuxer.flush();
        let f = demuxer.next_frame().unwrap();
        assert_eq!(&f.data[..], &frame[..]);
        assert!(demuxer.next_frame().is_none());
    }

    #[test]
    fn mpeg1_stream_codec_guess() {
        testutil::init();
        // An MPEG-1 system stream: pack header, then PSM-less video PES
        // packets carrying H.264 SPS, PPS, and IDR.
        let mut w = BitWriter::new();
        w.put_bytes(&[0x00, 0x00, 0x01, 0xba]);
        w.put_bits(0b0010, 4);
        w.put_bits(0, 3);
        w.put_bit(1);
        w.put_bits(0, 15);
        w.put_bit(1);
        w.put_bits(0, 15);
        w.put_bit(1);
        w.put_bit(1);
        w.put_bits(3000 >> 15, 7);
        w.put_bit(1);
        w.put_bits(3000 & 0x7fff, 15);
        w.put_bit(1);
        for unit in [&H264_SPS[..], &H264_PPS[..], &H264_IDR[..]] {
            let payload = annexb(&[unit]);
            // MPEG-1 PES: length, no stuffing, '0010' + PTS.
            w.put_bytes(&[0x00, 0x00, 0x01, 0xe0]);
            w.put_bits(5 + payload.len() as u64, 16);
            w.put_bits(0b0010, 4);
            w.put_bits(9000 >> 30, 3);
            w.put_bit(1);
            w.put_bits(9000 >> 15 & 0x7fff, 15);
            w.put_bit(1);
            w.put_bits(9000 & 0x7fff, 15);
            w.put_bit(1);
            w.put_bytes(&payload);
        }
        let bytes = w.into_vec();

        let mut demuxer = Demuxer::new();
        demuxer.input(&bytes).unwrap();
        demuxer.flush();
        let f = demuxer.next_frame().expect("codec should be guessed");
        assert_eq!(f.codec, CodecId::H264);
        assert_eq!(&f.data[..], &annexb(&[&H264_SPS, &H264_PPS, &H264_IDR])[..]);
        assert_eq!((f.pts, f.dts), (9000, 9000));
        assert!(demuxer.next_frame().is_none());
    }
}
