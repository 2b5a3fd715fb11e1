// This file is part of Moonfire Remux, a media container remuxing toolkit.
// Copyright (C) 2024 The Moonfire Remux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use super::*;
use crate::pes::{self, PesHeader};
use crate::{h264, h265, nal};
use crate::codec::CodecId;
use std::io::Write;

/// How often the PAT and PMT are repeated, in 90 kHz units (400 ms).
const PSI_INTERVAL: i64 = 400 * 90;

/// A single-program transport-stream muxer over any byte sink; exactly one
/// `write_all` per 188-byte packet.
///
/// Register streams, then feed frames (Annex B video / ADTS AAC / MP3, 90 kHz
/// timestamps). The PAT and PMT are emitted at stream start and every 400 ms
/// of dts; the PCR rides the first packet of each video frame on the PCR PID.
pub struct Muxer<W: Write> {
    w: W,
    streams: Vec<MuxStream>,
    pat_cc: u8,
    pmt_cc: u8,
    pmt_pid: u16,
    next_pid: u16,
    pcr_pid: u16,
    last_psi_dts: Option<i64>,
    failed: bool,
}

struct MuxStream {
    pid: u16,
    codec: CodecId,
    stream_type: u8,
    cc: u8,
}

impl<W: Write> Muxer<W> {
    pub fn new(w: W) -> Self {
        Muxer {
            w,
            streams: Vec::new(),
            pat_cc: 0,
            pmt_cc: 0,
            pmt_pid: 0x0200,
            next_pid: 0x0100,
            pcr_pid: 0,
            last_psi_dts: None,
            failed: false,
        }
    }

    /// Registers an elementary stream, returning its PID.
    pub fn add_stream(&mut self, codec: CodecId) -> Result<u16, Error> {
        let stream_type = codec_to_stream_type(codec)?;
        let pid = self.next_pid;
        self.next_pid += 1;
        self.streams.push(MuxStream {
            pid,
            codec,
            stream_type,
            cc: 0,
        });
        Ok(pid)
    }

    /// Writes one frame as a PES packet split over TS packets. Timestamps
    /// are in 90 kHz units.
    pub fn write_frame(&mut self, pid: u16, data: &[u8], pts: i64, dts: i64) -> Result<(), Error> {
        if self.failed {
            bail!(FailedPrecondition, msg("muxer previously failed"));
        }
        let Some(idx) = self.streams.iter().position(|s| s.pid == pid) else {
            bail!(InvalidArgument, msg("unknown pid {:#06x}", pid));
        };
        let codec = self.streams[idx].codec;
        // The PCR rides the video stream when there is one.
        if self.pcr_pid == 0 || (codec.is_video() && self.pcr_pid != pid) {
            self.pcr_pid = pid;
        }

        let mut with_aud = false;
        let mut idr = false;
        if codec.is_video() {
            nal::split_annex_b(data, |unit| {
                match codec {
                    CodecId::H264 => {
                        let t = h264::nal_type(unit);
                        with_aud |= t == h264::NAL_AUD;
                        idr |= t == h264::NAL_IDR_SLICE;
                    }
                    _ => {
                        let t = h265::nal_type(unit);
                        with_aud |= t == h265::NAL_AUD;
                        idr |= h265::is_irap(t);
                    }
                }
                Ok(())
            })?;
        }

        if self
            .last_psi_dts
            .map(|last| last + PSI_INTERVAL < dts)
            .unwrap_or(true)
        {
            self.last_psi_dts = Some(dts);
            self.write_psi()?;
        }

        // ffmpeg mpegtsenc.c: supply an access unit delimiter when the
        // encoder didn't.
        let payload: Vec<u8> = match codec {
            CodecId::H264 if !with_aud => {
                let mut v = Vec::with_capacity(data.len() + h264::AUD_NAL.len());
                v.extend_from_slice(&h264::AUD_NAL);
                v.extend_from_slice(data);
                v
            }
            CodecId::H265 if !with_aud => {
                let mut v = Vec::with_capacity(data.len() + h265::AUD_NAL.len());
                v.extend_from_slice(&h265::AUD_NAL);
                v.extend_from_slice(data);
                v
            }
            _ => data.to_vec(),
        };
        self.write_pes(idx, &payload, pts, dts, idr)
    }

    pub fn into_inner(self) -> W {
        self.w
    }

    fn write_psi(&mut self) -> Result<(), Error> {
        let pat = Pat {
            version: 0,
            programs: vec![(1, self.pmt_pid)],
        };
        let mut w = BitWriter::with_capacity(PACKET_SIZE);
        PacketHeader {
            payload_unit_start: true,
            pid: PID_PAT,
            adaptation_field_control: 0b01,
            continuity_counter: self.pat_cc,
        }
        .encode(&mut w);
        self.pat_cc = (self.pat_cc + 1) % 16;
        w.put_u8(0); // pointer_field
        pat.encode(&mut w);
        w.fill_to(PACKET_SIZE, 0xff);
        self.write_packet(w.into_vec())?;

        let pmt = Pmt {
            program_number: 1,
            version: 0,
            pcr_pid: self.pcr_pid,
            streams: self.streams.iter().map(|s| (s.stream_type, s.pid)).collect(),
        };
        let mut w = BitWriter::with_capacity(PACKET_SIZE);
        PacketHeader {
            payload_unit_start: true,
            pid: self.pmt_pid,
            adaptation_field_control: 0b01,
            continuity_counter: self.pmt_cc,
        }
        .encode(&mut w);
        self.pmt_cc = (self.pmt_cc + 1) % 16;
        w.put_u8(0); // pointer_field
        pmt.encode(&mut w);
        w.fill_to(PACKET_SIZE, 0xff);
        self.write_packet(w.into_vec())
    }

    fn write_pes(
        &mut self,
        idx: usize,
        payload: &[u8],
        pts: i64,
        dts: i64,
        idr: bool,
    ) -> Result<(), Error> {
        let pid = self.streams[idx].pid;
        let is_video = self.streams[idx].codec.is_video();
        // PES_packet_length counts from the byte after itself; zero
        // (unbounded) is only allowed for video elementary streams.
        let total = payload.len() + 13;
        let packet_length = if total > 0xffff {
            if !is_video {
                bail!(InvalidArgument, msg("{}-byte audio PES overflows", total));
            }
            0
        } else {
            total as u16
        };
        let hdr = PesHeader {
            stream_id: if is_video {
                pes::STREAM_ID_VIDEO_BASE
            } else {
                pes::STREAM_ID_AUDIO_BASE
            },
            packet_length,
            data_alignment_indicator: idr,
            pts: Some(pts as u64),
            dts: Some(dts as u64),
            header_len: 0,
        };
        let pes_header = {
            let mut w = BitWriter::with_capacity(19);
            hdr.encode(&mut w, &[]);
            w.into_vec()
        };

        let mut first = true;
        let mut rem = payload;
        loop {
            let cc = self.streams[idx].cc;
            self.streams[idx].cc = (cc + 1) % 16;

            let mut af = AdaptationField::default();
            let mut af_present = false;
            if first && idr {
                af.random_access = true;
                af_present = true;
            }
            if first && pid == self.pcr_pid {
                // PCR base is the 90 kHz dts; the 27 MHz extension is zero.
                af.pcr = Some(dts.max(0) as u64 * 300);
                af_present = true;
            }
            let hdr_len = if first { pes_header.len() } else { 0 };
            let af_min = if af_present { af.min_len() } else { 0 };
            let available = PACKET_SIZE - 4 - af_min - hdr_len;
            let (chunk_len, af_total) = if rem.len() >= available {
                (available, af_min)
            } else {
                // Short payload: grow the adaptation field with stuffing so
                // the packet still comes out at exactly 188 bytes.
                let af_total = PACKET_SIZE - 4 - hdr_len - rem.len();
                af_present = af_present || af_total > 0;
                (rem.len(), af_total)
            };

            let mut w = BitWriter::with_capacity(PACKET_SIZE);
            PacketHeader {
                payload_unit_start: first,
                pid,
                adaptation_field_control: if af_present { 0b11 } else { 0b01 },
                continuity_counter: cc,
            }
            .encode(&mut w);
            if af_present {
                w.put_bytes(&af.encode_to_len(af_total));
            }
            if first {
                w.put_bytes(&pes_header);
            }
            w.put_bytes(&rem[..chunk_len]);
            rem = &rem[chunk_len..];
            let packet = w.into_vec();
            assert_eq!(packet.len(), PACKET_SIZE, "TS packetization is broken");
            self.write_packet(packet)?;
            first = false;
            if rem.is_empty() {
                return Ok(());
            }
        }
    }

    fn write_packet(&mut self, packet: Vec<u8>) -> Result<(), Error> {
        if let Err(e) = self.w.write_all(&packet) {
            self.failed = true;
            return Err(base::err!(Unknown, msg("packet write failed"), source(e)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::Demuxer;
    use super::*;
    use crate::aac::AdtsHeader;
    use crate::testutil::{self, H264_IDR, H264_NON_IDR, H264_PPS, H264_SPS};
    use std::collections::HashMap;

    fn annexb(units: &[&[u8]]) -> Vec<u8> {
        let mut v = Vec::new();
        for u in units {
            v.extend_from_slice(&[0, 0, 0, 1]);
            v.extend_from_slice(u);
        }
        v
    }

    fn adts_frame(payload: &[u8]) -> Vec<u8> {
        let hdr = AdtsHeader {
            profile: 1,
            sampling_frequency_index: 4,
            channel_configuration: 2,
            buffer_fullness: 0x3f,
            frame_length: (7 + payload.len()) as u16,
            ..Default::default()
        };
        let mut v = hdr.encode();
        v.extend_from_slice(payload);
        v
    }

    #[test]
    fn packets_are_188_bytes_with_monotonic_cc() {
        testutil::init();
        let mut muxer = Muxer::new(Vec::new());
        let video = muxer.add_stream(CodecId::H264).unwrap();
        let audio = muxer.add_stream(CodecId::Aac).unwrap();
        muxer
            .write_frame(video, &annexb(&[&H264_SPS, &H264_PPS, &H264_IDR]), 9000, 9000)
            .unwrap();
        muxer
            .write_frame(audio, &adts_frame(&[0xaa; 100]), 9000, 9000)
            .unwrap();
        muxer
            .write_frame(video, &annexb(&[&H264_NON_IDR]), 12600, 12600)
            .unwrap();
        let bytes = muxer.into_inner();
        assert_eq!(bytes.len() % PACKET_SIZE, 0);

        let mut last_cc: HashMap<u16, u8> = HashMap::new();
        for packet in bytes.chunks(PACKET_SIZE) {
            assert_eq!(packet[0], SYNC_BYTE);
            let pid = u16::from(packet[1] & 0x1f) << 8 | u16::from(packet[2]);
            let cc = packet[3] & 0x0f;
            if let Some(&prev) = last_cc.get(&pid) {
                assert_eq!(cc, (prev + 1) % 16, "pid {:#06x}", pid);
            }
            last_cc.insert(pid, cc);
        }
        // PAT first, then PMT.
        assert_eq!(u16::from(bytes[1] & 0x1f) << 8 | u16::from(bytes[2]), PID_PAT);
        let second = &bytes[PACKET_SIZE..];
        assert_eq!(u16::from(second[1] & 0x1f) << 8 | u16::from(second[2]), 0x0200);
    }

    #[test]
    fn pat_section_crc_is_valid() {
        testutil::init();
        let mut muxer = Muxer::new(Vec::new());
        let video = muxer.add_stream(CodecId::H264).unwrap();
        muxer
            .write_frame(video, &annexb(&[&H264_SPS, &H264_PPS, &H264_IDR]), 0, 0)
            .unwrap();
        let bytes = muxer.into_inner();
        let pat_packet = &bytes[..PACKET_SIZE];
        // Skip the 4-byte header and pointer field.
        let section = &pat_packet[5..];
        let section_length = ((section[1] as usize & 0x0f) << 8) | section[2] as usize;
        let total = 3 + section_length;
        let stored = u32::from_be_bytes(section[total - 4..total].try_into().unwrap());
        assert_eq!(stored, crate::crc::crc32_mpeg2(&section[..total - 4]));
    }

    #[test]
    fn round_trip_h264_aac() {
        testutil::init();
        let frame1 = annexb(&[&H264_SPS, &H264_PPS, &H264_IDR]);
        let frame2 = annexb(&[&H264_NON_IDR]);
        let audio1 = adts_frame(&[0xab; 37]);
        let mut muxer = Muxer::new(Vec::new());
        let video = muxer.add_stream(CodecId::H264).unwrap();
        let audio = muxer.add_stream(CodecId::Aac).unwrap();
        muxer.write_frame(video, &frame1, 9000, 9000).unwrap();
        muxer.write_frame(audio, &audio1, 9000, 9000).unwrap();
        muxer.write_frame(video, &frame2, 12600, 12600).unwrap();
        let bytes = muxer.into_inner();

        let mut demuxer = Demuxer::new();
        demuxer.input(&bytes).unwrap();
        demuxer.flush();
        let mut video_frames = Vec::new();
        let mut audio_frames = Vec::new();
        while let Some(f) = demuxer.next_frame() {
            assert!(f.pts >= f.dts);
            match f.codec {
                CodecId::H264 => video_frames.push(f),
                CodecId::Aac => audio_frames.push(f),
                c => panic!("unexpected codec {c:?}"),
            }
        }
        assert_eq!(video_frames.len(), 2);
        // The muxer prepended an AUD; the demuxer strips it again.
        assert_eq!(&video_frames[0].data[..], &frame1[..]);
        assert!(video_frames[0].is_key);
        assert_eq!((video_frames[0].pts, video_frames[0].dts), (9000, 9000));
        assert_eq!(&video_frames[1].data[..], &frame2[..]);
        assert_eq!((video_frames[1].pts, video_frames[1].dts), (12600, 12600));
        assert_eq!(audio_frames.len(), 1);
        assert_eq!(&audio_frames[0].data[..], &audio1[..]);
        assert_eq!((audio_frames[0].pts, audio_frames[0].dts), (9000, 9000));
    }

    #[test]
    fn access_unit_split_without_flush() {
        testutil::init();
        // The first frame must be emitted as soon as the second one's
        // access-unit start is observed, without waiting for a flush.
        let frame1 = annexb(&[&H264_SPS, &H264_PPS, &H264_IDR]);
        let frame2 = annexb(&[&H264_NON_IDR]);
        let mut muxer = Muxer::new(Vec::new());
        let video = muxer.add_stream(CodecId::H264).unwrap();
        muxer.write_frame(video, &frame1, 9000, 9000).unwrap();
        muxer.write_frame(video, &frame2, 12600, 12600).unwrap();
        let bytes = muxer.into_inner();
        let mut demuxer = Demuxer::new();
        demuxer.input(&bytes).unwrap();
        let f = demuxer.next_frame().expect("first AU should be complete");
        assert_eq!(&f.data[..], &frame1[..]);
        assert_eq!((f.pts, f.dts), (9000, 9000));
    }

    #[test]
    fn byte_at_a_time_input_resyncs() {
        testutil::init();
        let frame = annexb(&[&H264_SPS, &H264_PPS, &H264_IDR]);
        let mut muxer = Muxer::new(Vec::new());
        let video = muxer.add_stream(CodecId::H264).unwrap();
        muxer.write_frame(video, &frame, 0, 0).unwrap();
        muxer.write_frame(video, &annexb(&[&H264_NON_IDR]), 3600, 3600).unwrap();
        let bytes = muxer.into_inner();
        let mut demuxer = Demuxer::new();
        // Prepend garbage so the demuxer has to find alignment, then feed
        // one byte at a time.
        demuxer.input(&[0x00, 0x12, 0x34]).unwrap();
        for b in &bytes {
            demuxer.input(std::slice::from_ref(b)).unwrap();
        }
        demuxer.flush();
        let f = demuxer.next_frame().unwrap();
        assert_eq!(&f.data[..], &frame[..]);
    }
}
