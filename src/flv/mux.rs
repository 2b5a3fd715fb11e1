// This file is part of Moonfire Remux, a media container remuxing toolkit.
// Copyright (C) 2024 The Moonfire Remux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use super::*;
use crate::codec::CodecId;
use crate::h264::{self, AvcDecoderConfigurationRecord};
use crate::h265::{self, HevcDecoderConfigurationRecord};
use crate::{aac, mp3, nal};
use base::{bail, Error, ErrorKind, ResultExt};
use std::io::Write;

/// An FLV muxer over any byte sink. One `write_all` per tag.
///
/// Video input is Annex B, audio input is ADTS for AAC and raw for
/// G.711/MP3; timestamps are milliseconds. The muxer emits a sequence-header
/// tag (decoder configuration record / `AudioSpecificConfig`) before the
/// first frame and again whenever the cached parameter sets change.
pub struct Muxer<W: Write> {
    w: W,
    video: Option<VideoMux>,
    audio: Option<AudioMux>,
    failed: bool,
}

enum VideoMux {
    Avc {
        record: AvcDecoderConfigurationRecord,
        cache: Vec<u8>,
        config_dirty: bool,
    },
    Hevc {
        record: HevcDecoderConfigurationRecord,
        cache: Vec<u8>,
        config_dirty: bool,
    },
}

enum AudioMux {
    Aac { sent_asc: bool },
    G711 { format: u8 },
    Mp3,
}

impl<W: Write> Muxer<W> {
    /// Creates a muxer and writes the file header. Codecs outside the closed
    /// set supported by FLV are rejected here.
    pub fn new(mut w: W, video: Option<CodecId>, audio: Option<CodecId>) -> Result<Self, Error> {
        let video = match video {
            None => None,
            Some(CodecId::H264) => Some(VideoMux::Avc {
                record: AvcDecoderConfigurationRecord::new(),
                cache: Vec::new(),
                config_dirty: false,
            }),
            Some(CodecId::H265) => Some(VideoMux::Hevc {
                record: HevcDecoderConfigurationRecord::new(),
                cache: Vec::new(),
                config_dirty: false,
            }),
            Some(c) => bail!(Unimplemented, msg("FLV can't carry video codec {:?}", c)),
        };
        let audio = match audio {
            None => None,
            Some(CodecId::Aac) => Some(AudioMux::Aac { sent_asc: false }),
            Some(CodecId::Mp3) => Some(AudioMux::Mp3),
            Some(c @ (CodecId::G711A | CodecId::G711U)) => Some(AudioMux::G711 {
                format: codec_to_sound_format(c)?,
            }),
            Some(c) => bail!(Unimplemented, msg("FLV can't carry audio codec {:?}", c)),
        };
        w.write_all(&FILE_HEADER).err_kind(ErrorKind::Unknown)?;
        Ok(Muxer {
            w,
            video,
            audio,
            failed: false,
        })
    }

    /// Writes one video frame (Annex B, possibly several NAL units).
    pub fn write_video(&mut self, data: &[u8], pts: i64, dts: i64) -> Result<(), Error> {
        self.check_ok()?;
        let mut tags: Vec<Vec<u8>> = Vec::new();
        let cts = (pts - dts) as i32;
        match &mut self.video {
            None => bail!(FailedPrecondition, msg("muxer has no video stream")),
            Some(VideoMux::Avc {
                record,
                cache,
                config_dirty,
            }) => {
                let mut vcl = false;
                let mut is_key = false;
                nal::split_annex_b(data, |unit| {
                    match h264::nal_type(unit) {
                        h264::NAL_SPS => {
                            if record.update_sps(unit)? {
                                *config_dirty = true;
                                append_avcc(cache, unit);
                            }
                        }
                        h264::NAL_PPS => {
                            if record.update_pps(unit)? {
                                *config_dirty = true;
                                append_avcc(cache, unit);
                            }
                        }
                        t => {
                            if h264::is_vcl(t) {
                                vcl = true;
                                if t == h264::NAL_IDR_SLICE {
                                    is_key = true;
                                }
                            }
                            append_avcc(cache, unit);
                        }
                    }
                    Ok(())
                })?;
                if *config_dirty && !record.sps.is_empty() && !record.pps.is_empty() {
                    let mut body = video_tag_header(true, VIDEO_CODEC_AVC, PACKET_SEQUENCE_HEADER, 0);
                    body.extend_from_slice(&record.encode()?);
                    tags.push(body);
                    *config_dirty = false;
                }
                if vcl {
                    let mut body =
                        video_tag_header(is_key, VIDEO_CODEC_AVC, PACKET_NALU, cts);
                    body.append(cache);
                    tags.push(body);
                }
            }
            Some(VideoMux::Hevc {
                record,
                cache,
                config_dirty,
            }) => {
                let mut vcl = false;
                let mut is_key = false;
                nal::split_annex_b(data, |unit| {
                    let t = h265::nal_type(unit);
                    match t {
                        h265::NAL_VPS => *config_dirty |= record.update_vps(unit)?,
                        h265::NAL_SPS => *config_dirty |= record.update_sps(unit)?,
                        h265::NAL_PPS => *config_dirty |= record.update_pps(unit)?,
                        _ => {
                            if h265::is_irap(t) {
                                is_key = true;
                            }
                            vcl |= h265::is_vcl(t);
                        }
                    }
                    // Unlike AVC, parameter sets stay in the coded frame too;
                    // the record is rebuilt from scratch either way.
                    append_avcc(cache, unit);
                    Ok(())
                })?;
                if *config_dirty && record.arrays.len() >= 3 {
                    let mut body =
                        video_tag_header(true, VIDEO_CODEC_HEVC, PACKET_SEQUENCE_HEADER, 0);
                    body.extend_from_slice(&record.encode()?);
                    tags.push(body);
                    *config_dirty = false;
                }
                if vcl {
                    let mut body = video_tag_header(is_key, VIDEO_CODEC_HEVC, PACKET_NALU, cts);
                    body.append(cache);
                    tags.push(body);
                }
            }
        }
        for body in tags {
            self.write_tag(TAG_TYPE_VIDEO, dts as u32, &body)?;
        }
        Ok(())
    }

    /// Writes audio: ADTS frames for AAC, raw frames otherwise.
    pub fn write_audio(&mut self, data: &[u8], _pts: i64, dts: i64) -> Result<(), Error> {
        self.check_ok()?;
        let mut tags: Vec<Vec<u8>> = Vec::new();
        match &mut self.audio {
            None => bail!(FailedPrecondition, msg("muxer has no audio stream")),
            Some(AudioMux::Aac { sent_asc }) => {
                aac::split_frames(data, |hdr, frame| {
                    if !*sent_asc {
                        if let Ok(asc) = aac::adts_to_asc(frame) {
                            let mut body =
                                vec![audio_tag_byte(SOUND_FORMAT_AAC, SOUND_RATE_44000, true)];
                            body.push(PACKET_SEQUENCE_HEADER);
                            body.extend_from_slice(&asc.encode());
                            tags.push(body);
                            *sent_asc = true;
                        }
                    }
                    let mut body = vec![audio_tag_byte(SOUND_FORMAT_AAC, SOUND_RATE_44000, true)];
                    body.push(PACKET_NALU);
                    body.extend_from_slice(&frame[hdr.header_len()..]);
                    tags.push(body);
                })?;
            }
            Some(AudioMux::G711 { format }) => {
                // G.711 in FLV is pinned to 5.5 kHz mono by convention; the
                // actual clock rides on the tag timestamps.
                let mut body = vec![audio_tag_byte(*format, SOUND_RATE_5500, false)];
                body.extend_from_slice(data);
                tags.push(body);
            }
            Some(AudioMux::Mp3) => {
                let mut rate = SOUND_RATE_44000;
                let mut stereo = true;
                if let Ok(hdr) = mp3::FrameHeader::decode(data) {
                    rate = match hdr.sample_rate() {
                        5500 => SOUND_RATE_5500,
                        11025 => SOUND_RATE_11000,
                        22050 => SOUND_RATE_22000,
                        _ => SOUND_RATE_44000,
                    };
                    stereo = hdr.channel_count() > 1;
                }
                let mut body = vec![audio_tag_byte(SOUND_FORMAT_MP3, rate, stereo)];
                body.extend_from_slice(data);
                tags.push(body);
            }
        }
        for body in tags {
            self.write_tag(TAG_TYPE_AUDIO, dts as u32, &body)?;
        }
        Ok(())
    }

    /// Returns the underlying writer.
    pub fn into_inner(self) -> W {
        self.w
    }

    fn check_ok(&self) -> Result<(), Error> {
        if self.failed {
            bail!(FailedPrecondition, msg("muxer previously failed"));
        }
        Ok(())
    }

    fn write_tag(&mut self, tag_type: u8, timestamp: u32, body: &[u8]) -> Result<(), Error> {
        let hdr = TagHeader {
            tag_type,
            data_size: body.len() as u32,
            timestamp,
        };
        let mut tag = Vec::with_capacity(11 + body.len() + 4);
        tag.extend_from_slice(&hdr.encode());
        tag.extend_from_slice(body);
        tag.extend_from_slice(&(11 + body.len() as u32).to_be_bytes());
        if let Err(e) = self.w.write_all(&tag) {
            self.failed = true;
            return Err(base::err!(Unknown, msg("tag write failed"), source(e)));
        }
        Ok(())
    }
}

fn append_avcc(cache: &mut Vec<u8>, unit: &[u8]) {
    cache.extend_from_slice(&(unit.len() as u32).to_be_bytes());
    cache.extend_from_slice(unit);
}

fn video_tag_header(is_key: bool, codec: u8, packet_type: u8, cts: i32) -> Vec<u8> {
    let frame_type = if is_key { FRAME_TYPE_KEY } else { FRAME_TYPE_INTER };
    vec![
        frame_type << 4 | codec,
        packet_type,
        (cts >> 16) as u8,
        (cts >> 8) as u8,
        cts as u8,
    ]
}

fn audio_tag_byte(format: u8, rate: u8, stereo: bool) -> u8 {
    // sound size is always written as "16-bit".
    format << 4 | rate << 2 | 1 << 1 | stereo as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecId;
    use crate::flv::Demuxer;
    use crate::testutil::{self, h265 as h265_data, H264_IDR, H264_NON_IDR, H264_PPS, H264_SPS};

    fn annexb(units: &[&[u8]]) -> Vec<u8> {
        let mut v = Vec::new();
        for u in units {
            v.extend_from_slice(&[0, 0, 0, 1]);
            v.extend_from_slice(u);
        }
        v
    }

    #[test]
    fn h264_round_trip() {
        testutil::init();
        let frame1 = annexb(&[&H264_SPS, &H264_PPS, &H264_IDR]);
        let frame2 = annexb(&[&H264_NON_IDR]);
        let mut muxer = Muxer::new(Vec::new(), Some(CodecId::H264), None).unwrap();
        muxer.write_video(&frame1, 0, 0).unwrap();
        muxer.write_video(&frame2, 40, 40).unwrap();
        let bytes = muxer.into_inner();
        assert_eq!(&bytes[..5], b"FLV\x01\x05");

        let mut demuxer = Demuxer::new();
        demuxer.input(&bytes).unwrap();
        let f1 = demuxer.next_frame().unwrap();
        assert_eq!(f1.codec, CodecId::H264);
        assert!(f1.is_key);
        assert_eq!((f1.pts, f1.dts), (0, 0));
        use pretty_hex::PrettyHex;
        assert_eq!(
            &f1.data[..],
            &frame1[..],
            "demuxed frame:\n{:?}",
            f1.data.hex_dump()
        );
        let f2 = demuxer.next_frame().unwrap();
        assert!(!f2.is_key);
        assert_eq!((f2.pts, f2.dts), (40, 40));
        assert_eq!(&f2.data[..], &frame2[..]);
        assert!(demuxer.next_frame().is_none());
    }

    #[test]
    fn h264_sequence_header_emitted_once() {
        testutil::init();
        let frame1 = annexb(&[&H264_SPS, &H264_PPS, &H264_IDR]);
        let frame2 = annexb(&[&H264_SPS, &H264_PPS, &H264_IDR]); // same sets again
        let mut muxer = Muxer::new(Vec::new(), Some(CodecId::H264), None).unwrap();
        muxer.write_video(&frame1, 0, 0).unwrap();
        muxer.write_video(&frame2, 40, 40).unwrap();
        let bytes = muxer.into_inner();
        // Tags: one sequence header + two frames.
        let mut tag_count = 0;
        let mut pos = 13;
        while pos + 11 <= bytes.len() {
            let size = u32::from(bytes[pos + 1]) << 16
                | u32::from(bytes[pos + 2]) << 8
                | u32::from(bytes[pos + 3]);
            tag_count += 1;
            pos += 11 + size as usize + 4;
        }
        assert_eq!(tag_count, 3);
    }

    #[test]
    fn h264_demuxer_prepends_cached_parameter_sets() {
        testutil::init();
        // Sequence header followed by an IDR frame with no inline SPS/PPS.
        let mut muxer = Muxer::new(Vec::new(), Some(CodecId::H264), None).unwrap();
        muxer
            .write_video(&annexb(&[&H264_SPS, &H264_PPS, &H264_IDR]), 0, 0)
            .unwrap();
        muxer.write_video(&annexb(&[&H264_IDR]), 80, 80).unwrap();
        let bytes = muxer.into_inner();
        let mut demuxer = Demuxer::new();
        demuxer.input(&bytes).unwrap();
        demuxer.next_frame().unwrap();
        let f = demuxer.next_frame().unwrap();
        // The bare IDR gained the cached SPS and PPS.
        assert_eq!(&f.data[..], &annexb(&[&H264_SPS, &H264_PPS, &H264_IDR])[..]);
    }

    #[test]
    fn h265_round_trip() {
        testutil::init();
        let vps = h265_data::vps();
        let sps = h265_data::sps();
        let pps = h265_data::pps(false, false);
        let idr = h265_data::idr_slice();
        let frame = annexb(&[&vps, &sps, &pps, &idr]);
        let mut muxer = Muxer::new(Vec::new(), Some(CodecId::H265), None).unwrap();
        muxer.write_video(&frame, 1000, 960).unwrap();
        let bytes = muxer.into_inner();

        let mut demuxer = Demuxer::new();
        demuxer.input(&bytes).unwrap();
        let f = demuxer.next_frame().unwrap();
        assert_eq!(f.codec, CodecId::H265);
        assert!(f.is_key);
        assert_eq!((f.pts, f.dts), (1000, 960));
        assert_eq!(&f.data[..], &frame[..]);
        assert!(demuxer.next_frame().is_none());
    }

    #[test]
    fn aac_round_trip() {
        testutil::init();
        let mut adts = crate::aac::AdtsHeader {
            profile: 1,
            sampling_frequency_index: 4,
            channel_configuration: 2,
            buffer_fullness: 0x3f,
            ..Default::default()
        };
        adts.frame_length = 7 + 4;
        let mut frame = adts.encode();
        frame.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);

        let mut muxer = Muxer::new(Vec::new(), None, Some(CodecId::Aac)).unwrap();
        muxer.write_audio(&frame, 20, 20).unwrap();
        let bytes = muxer.into_inner();

        let mut demuxer = Demuxer::new();
        demuxer.input(&bytes).unwrap();
        let f = demuxer.next_frame().unwrap();
        assert_eq!(f.codec, CodecId::Aac);
        assert_eq!((f.pts, f.dts), (20, 20));
        assert_eq!(&f.data[..], &frame[..]);
    }

    #[test]
    fn pts_never_below_dts() {
        testutil::init();
        let frame = annexb(&[&H264_SPS, &H264_PPS, &H264_IDR]);
        let mut muxer = Muxer::new(Vec::new(), Some(CodecId::H264), None).unwrap();
        muxer.write_video(&frame, 120, 80).unwrap();
        let bytes = muxer.into_inner();
        let mut demuxer = Demuxer::new();
        demuxer.input(&bytes).unwrap();
        while let Some(f) = demuxer.next_frame() {
            assert!(f.pts >= f.dts);
        }
    }

    #[test]
    fn split_input_across_calls() {
        testutil::init();
        let frame = annexb(&[&H264_SPS, &H264_PPS, &H264_IDR]);
        let mut muxer = Muxer::new(Vec::new(), Some(CodecId::H264), None).unwrap();
        muxer.write_video(&frame, 0, 0).unwrap();
        let bytes = muxer.into_inner();
        let mut demuxer = Demuxer::new();
        // One byte at a time; the demuxer must buffer partial tags.
        for b in &bytes {
            demuxer.input(std::slice::from_ref(b)).unwrap();
        }
        let f = demuxer.next_frame().unwrap();
        assert_eq!(&f.data[..], &frame[..]);
    }
}
