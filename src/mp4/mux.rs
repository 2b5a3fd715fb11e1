// This file is part of Moonfire Remux, a media container remuxing toolkit.
// Copyright (C) 2024 The Moonfire Remux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `.mp4` muxing. Boxes are arranged in the order suggested by ISO/IEC
//! 14496-12 section 6.2.3 (Table 1): `ftyp`, `moov` (before the media for
//! fast start), then `mdat`; or for fragmented output `ftyp` + `moov` with
//! `mvex`, then per fragment `styp`, `moof`, `mdat`.

use super::{object_type, sample_entry_fourcc};
use crate::codec::CodecId;
use crate::h264::{self, AvcDecoderConfigurationRecord};
use crate::h265::{self, HevcDecoderConfigurationRecord};
use crate::{aac, nal};
use base::{bail, Error};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use std::io::Write;

/// Movie and track timescale; frames arrive in milliseconds.
const TIMESCALE: u32 = 1000;

// Sample flags as in the Independent and Disposable Samples box
// (ISO/IEC 14496-12 section 8.6.4) / ffmpeg isom.h.
const SAMPLE_FLAGS_SYNC: u32 = 0x0200_0000; // sample_depends_on = no
const SAMPLE_FLAGS_NON_SYNC: u32 = 0x0101_0000; // depends + is_non_sync

// tfhd / trun flag bits used on the write path.
const TFHD_SAMPLE_DESCRIPTION_INDEX: u32 = 0x0000_0002;
const TFHD_DEFAULT_DURATION: u32 = 0x0000_0008;
const TFHD_DEFAULT_SIZE: u32 = 0x0000_0010;
const TFHD_DEFAULT_FLAGS: u32 = 0x0000_0020;
const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x0002_0000;
const TRUN_DATA_OFFSET: u32 = 0x0000_0001;
const TRUN_SAMPLE_DURATION: u32 = 0x0000_0100;
const TRUN_SAMPLE_SIZE: u32 = 0x0000_0200;
const TRUN_SAMPLE_FLAGS: u32 = 0x0000_0400;
const TRUN_SAMPLE_CTS: u32 = 0x0000_0800;

/// Writes a box length for everything appended in the supplied scope.
macro_rules! write_box {
    ($buf:expr, $typ:expr, $b:block) => {{
        let len_pos = $buf.len();
        $buf.extend_from_slice(&[0u8; 4]); // length placeholder
        $buf.extend_from_slice($typ);
        {
            $b
        }
        let len = $buf.len() - len_pos;
        BigEndian::write_u32(&mut $buf[len_pos..len_pos + 4], len as u32);
    }};
}

/// As `write_box!` with a leading version + flags word.
macro_rules! write_full_box {
    ($buf:expr, $typ:expr, $version:expr, $flags:expr, $b:block) => {
        write_box!($buf, $typ, {
            $buf.write_u32::<BigEndian>(($version as u32) << 24 | ($flags as u32 & 0xff_ffff))
                .unwrap();
            $b
        })
    };
}

struct PendingSample {
    data: Vec<u8>,
    pts: i64,
    dts: i64,
    is_sync: bool,
    has_vcl: bool,
}

enum TrackConfig {
    Avc(AvcDecoderConfigurationRecord),
    Hevc(HevcDecoderConfigurationRecord),
    Aac { asc: Option<Vec<u8>> },
    Raw { extradata: Option<Vec<u8>> },
}

struct MuxTrack {
    track_id: u32,
    codec: CodecId,
    config: TrackConfig,
    width: u32,
    height: u32,
    channels: u16,
    sample_rate: u32,
    /// Committed samples of the current fragment (or, flat, the whole file).
    samples: Vec<PendingSample>,
    /// The access unit being accumulated across `write_frame` calls.
    pending: Option<PendingSample>,
}

impl MuxTrack {
    fn commit_pending(&mut self) {
        if let Some(p) = self.pending.take() {
            if !p.data.is_empty() {
                self.samples.push(p);
            }
        }
    }

    /// Per-sample durations; the final sample reuses the preceding delta.
    fn durations(&self) -> Vec<u32> {
        let n = self.samples.len();
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let d = if i + 1 < n {
                (self.samples[i + 1].dts - self.samples[i].dts).max(0) as u32
            } else if n >= 2 {
                (self.samples[n - 1].dts - self.samples[n - 2].dts).max(0) as u32
            } else {
                0
            };
            out.push(d);
        }
        out
    }
}

/// A progressive or fragmented `.mp4` muxer over any byte sink.
///
/// Register tracks up front, feed frames (Annex B video / ADTS AAC / raw
/// audio, millisecond timestamps), and call [`Muxer::write_trailer`] when
/// done. In fragmented mode [`Muxer::flush_fragment`] cuts a fragment; the
/// caller decides the policy (typically on each key frame or a time limit).
/// Dropping the muxer without `write_trailer` leaves the output truncated.
pub struct Muxer<W: Write> {
    w: W,
    fragmented: bool,
    tracks: Vec<MuxTrack>,
    wrote_init: bool,
    wrote_anything: bool,
    fragment_seq: u32,
    failed: bool,
    finished: bool,
}

impl<W: Write> Muxer<W> {
    pub fn new(w: W, fragmented: bool) -> Self {
        Muxer {
            w,
            fragmented,
            tracks: Vec::new(),
            wrote_init: false,
            wrote_anything: false,
            fragment_seq: 0,
            failed: false,
            finished: false,
        }
    }

    /// Registers a stream before the first `write_frame`, returning its
    /// track id.
    pub fn add_track(&mut self, codec: CodecId) -> Result<u32, Error> {
        if self.wrote_anything || self.wrote_init {
            bail!(FailedPrecondition, msg("add_track after first write"));
        }
        let config = match codec {
            CodecId::H264 => TrackConfig::Avc(AvcDecoderConfigurationRecord::new()),
            CodecId::H265 => TrackConfig::Hevc(HevcDecoderConfigurationRecord::new()),
            CodecId::Aac => TrackConfig::Aac { asc: None },
            CodecId::G711A | CodecId::G711U | CodecId::Mp3 | CodecId::Opus => {
                TrackConfig::Raw { extradata: None }
            }
        };
        let track_id = self.tracks.len() as u32 + 1;
        self.tracks.push(MuxTrack {
            track_id,
            codec,
            config,
            width: 0,
            height: 0,
            channels: if codec.is_audio() { 1 } else { 0 },
            sample_rate: 8000,
            samples: Vec::new(),
            pending: None,
        });
        Ok(track_id)
    }

    /// Supplies opaque codec configuration (e.g. `dOps` payload for Opus)
    /// for codecs this muxer doesn't derive one itself.
    pub fn set_track_extradata(&mut self, track_id: u32, data: &[u8]) -> Result<(), Error> {
        let track = self.track_mut(track_id)?;
        match &mut track.config {
            TrackConfig::Raw { extradata } => {
                *extradata = Some(data.to_vec());
                Ok(())
            }
            _ => bail!(
                FailedPrecondition,
                msg("track {} derives its own configuration", track_id)
            ),
        }
    }

    fn track_mut(&mut self, track_id: u32) -> Result<&mut MuxTrack, Error> {
        match self.tracks.iter_mut().find(|t| t.track_id == track_id) {
            Some(t) => Ok(t),
            None => bail!(InvalidArgument, msg("unknown track id {}", track_id)),
        }
    }

    /// Buffers one frame. Video may be split across calls mid-access-unit;
    /// NAL buffers are regrouped by the access-unit boundary rules.
    pub fn write_frame(
        &mut self,
        track_id: u32,
        data: &[u8],
        pts: i64,
        dts: i64,
    ) -> Result<(), Error> {
        if self.failed || self.finished {
            bail!(FailedPrecondition, msg("muxer is closed"));
        }
        self.wrote_anything = true;
        let track = self.track_mut(track_id)?;
        match track.codec {
            CodecId::H264 | CodecId::H265 => write_video(track, data, pts, dts),
            CodecId::Aac => write_aac(track, data, pts, dts),
            _ => {
                track.samples.push(PendingSample {
                    data: data.to_vec(),
                    pts,
                    dts,
                    is_sync: true,
                    has_vcl: false,
                });
                Ok(())
            }
        }
    }

    /// Fragmented mode: writes the buffered samples as one `styp` + `moof` +
    /// `mdat` triple, emitting the init segment first if it hasn't been.
    pub fn flush_fragment(&mut self) -> Result<(), Error> {
        if !self.fragmented {
            bail!(FailedPrecondition, msg("flush_fragment on a progressive muxer"));
        }
        if self.failed || self.finished {
            bail!(FailedPrecondition, msg("muxer is closed"));
        }
        for t in &mut self.tracks {
            t.commit_pending();
        }
        if !self.wrote_init {
            let mut init = Vec::with_capacity(1024);
            write_ftyp(&mut init, true);
            build_moov_init(&mut init, &self.tracks)?;
            self.write_all(&init)?;
            self.wrote_init = true;
        }
        if self.tracks.iter().all(|t| t.samples.is_empty()) {
            return Ok(());
        }
        self.fragment_seq += 1;
        let mut out = Vec::with_capacity(4096);
        write_box!(out, b"styp", {
            out.extend_from_slice(b"msdh");
            out.write_u32::<BigEndian>(0).unwrap(); // minor_version
            out.extend_from_slice(b"msdh");
            out.extend_from_slice(b"msix");
        });

        // moof, remembering each trun's data-offset position for patching
        // once the box length (and so the mdat payload position) is known.
        let moof_start = out.len();
        let mut data_offset_positions: Vec<(usize, usize)> = Vec::new(); // (pos, track idx)
        write_box!(out, b"moof", {
            write_full_box!(out, b"mfhd", 0u8, 0u32, {
                out.write_u32::<BigEndian>(self.fragment_seq).unwrap();
            });
            for (i, track) in self.tracks.iter().enumerate() {
                if track.samples.is_empty() {
                    continue;
                }
                let durations = track.durations();
                write_box!(out, b"traf", {
                    let tfhd_flags = TFHD_SAMPLE_DESCRIPTION_INDEX
                        | TFHD_DEFAULT_DURATION
                        | TFHD_DEFAULT_SIZE
                        | TFHD_DEFAULT_FLAGS
                        | TFHD_DEFAULT_BASE_IS_MOOF;
                    write_full_box!(out, b"tfhd", 0u8, tfhd_flags, {
                        out.write_u32::<BigEndian>(track.track_id).unwrap();
                        out.write_u32::<BigEndian>(1).unwrap(); // sample_description_index
                        out.write_u32::<BigEndian>(durations.first().copied().unwrap_or(0))
                            .unwrap();
                        out.write_u32::<BigEndian>(track.samples[0].data.len() as u32)
                            .unwrap();
                        let default_flags = if track.codec.is_video() {
                            SAMPLE_FLAGS_NON_SYNC
                        } else {
                            SAMPLE_FLAGS_SYNC
                        };
                        out.write_u32::<BigEndian>(default_flags).unwrap();
                    });
                    write_full_box!(out, b"tfdt", 1u8, 0u32, {
                        out.write_u64::<BigEndian>(track.samples[0].dts.max(0) as u64)
                            .unwrap();
                    });
                    let trun_flags = TRUN_DATA_OFFSET
                        | TRUN_SAMPLE_DURATION
                        | TRUN_SAMPLE_SIZE
                        | TRUN_SAMPLE_FLAGS
                        | TRUN_SAMPLE_CTS;
                    write_full_box!(out, b"trun", 1u8, trun_flags, {
                        out.write_u32::<BigEndian>(track.samples.len() as u32).unwrap();
                        data_offset_positions.push((out.len(), i));
                        out.write_i32::<BigEndian>(0).unwrap(); // patched below
                        for (s, dur) in track.samples.iter().zip(&durations) {
                            out.write_u32::<BigEndian>(*dur).unwrap();
                            out.write_u32::<BigEndian>(s.data.len() as u32).unwrap();
                            out.write_u32::<BigEndian>(if s.is_sync {
                                SAMPLE_FLAGS_SYNC
                            } else {
                                SAMPLE_FLAGS_NON_SYNC
                            })
                            .unwrap();
                            out.write_i32::<BigEndian>((s.pts - s.dts) as i32).unwrap();
                        }
                    });
                });
            }
        });
        let moof_len = out.len() - moof_start;

        // Per default-base-is-moof, trun offsets are relative to the moof's
        // first byte; the payload begins after the mdat header.
        let mut running = moof_len + 8;
        let mut track_payload_start = vec![0usize; self.tracks.len()];
        for (i, track) in self.tracks.iter().enumerate() {
            if track.samples.is_empty() {
                continue;
            }
            track_payload_start[i] = running;
            running += track.samples.iter().map(|s| s.data.len()).sum::<usize>();
        }
        for (pos, track_idx) in data_offset_positions {
            BigEndian::write_i32(
                &mut out[pos..pos + 4],
                track_payload_start[track_idx] as i32,
            );
        }

        let mdat_payload: usize = running - moof_len - 8;
        let mut mdat = Vec::with_capacity(8 + mdat_payload);
        write_box!(mdat, b"mdat", {
            for track in &self.tracks {
                for s in &track.samples {
                    mdat.extend_from_slice(&s.data);
                }
            }
        });
        out.extend_from_slice(&mdat);
        self.write_all(&out)?;
        for t in &mut self.tracks {
            t.samples.clear();
        }
        Ok(())
    }

    /// Finishes the stream: flat output writes `ftyp` + `moov` + `mdat` now;
    /// fragmented output flushes the final fragment.
    pub fn write_trailer(&mut self) -> Result<(), Error> {
        if self.failed || self.finished {
            bail!(FailedPrecondition, msg("muxer is closed"));
        }
        if self.fragmented {
            self.flush_fragment()?;
            self.finished = true;
            return Ok(());
        }
        for t in &mut self.tracks {
            t.commit_pending();
        }
        // Interleave samples by dts for the mdat payload.
        let mut order: Vec<(usize, usize)> = Vec::new(); // (track idx, sample idx)
        for (i, t) in self.tracks.iter().enumerate() {
            for j in 0..t.samples.len() {
                order.push((i, j));
            }
        }
        order.sort_by_key(|&(i, j)| (self.tracks[i].samples[j].dts, i));
        let mdat_payload_len: usize = order
            .iter()
            .map(|&(i, j)| self.tracks[i].samples[j].data.len())
            .sum();

        let mut ftyp = Vec::with_capacity(40);
        write_ftyp(&mut ftyp, false);

        // co64 values depend on the moov length, but the moov length doesn't
        // depend on the values; build once to measure, once for real.
        let mut rel = vec![vec![0u64; 0]; self.tracks.len()];
        for (i, t) in self.tracks.iter().enumerate() {
            rel[i] = vec![0u64; t.samples.len()];
        }
        let mut off = 0u64;
        for &(i, j) in &order {
            rel[i][j] = off;
            off += self.tracks[i].samples[j].data.len() as u64;
        }
        let mut probe = Vec::new();
        build_moov_flat(&mut probe, &self.tracks, &rel)?;
        let base = (ftyp.len() + probe.len() + 8) as u64;
        let mut abs = rel;
        for track_offsets in &mut abs {
            for o in track_offsets.iter_mut() {
                *o += base;
            }
        }
        let mut moov = Vec::with_capacity(probe.len());
        build_moov_flat(&mut moov, &self.tracks, &abs)?;
        debug_assert_eq!(probe.len(), moov.len());

        let mut mdat = Vec::with_capacity(8 + mdat_payload_len);
        mdat.write_u32::<BigEndian>(8 + mdat_payload_len as u32)
            .unwrap();
        mdat.extend_from_slice(b"mdat");
        for &(i, j) in &order {
            mdat.extend_from_slice(&self.tracks[i].samples[j].data);
        }
        self.write_all(&ftyp)?;
        self.write_all(&moov)?;
        self.write_all(&mdat)?;
        self.finished = true;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.w
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
        if let Err(e) = self.w.write_all(data) {
            self.failed = true;
            return Err(base::err!(Unknown, msg("mp4 write failed"), source(e)));
        }
        Ok(())
    }
}

/// Splits Annex B input into length-prefixed sample data, folding parameter
/// sets into the track's decoder configuration and dropping AUDs. Buffers
/// are grouped into access units across calls: a unit that opens a new
/// access unit while slice data is pending commits the pending sample first.
fn write_video(track: &mut MuxTrack, data: &[u8], pts: i64, dts: i64) -> Result<(), Error> {
    let codec = track.codec;
    let MuxTrack {
        config,
        pending,
        samples,
        ..
    } = track;
    nal::split_annex_b(data, |unit| {
        let nal_type = match codec {
            CodecId::H264 => h264::nal_type(unit),
            _ => h265::nal_type(unit),
        };
        match config {
            TrackConfig::Avc(record) => match nal_type {
                h264::NAL_AUD => return Ok(()),
                h264::NAL_SPS => {
                    record.update_sps(unit)?;
                    return Ok(());
                }
                h264::NAL_PPS => {
                    record.update_pps(unit)?;
                    return Ok(());
                }
                _ => {}
            },
            TrackConfig::Hevc(record) => match nal_type {
                h265::NAL_AUD => return Ok(()),
                h265::NAL_VPS => {
                    record.update_vps(unit)?;
                    return Ok(());
                }
                h265::NAL_SPS => {
                    record.update_sps(unit)?;
                    return Ok(());
                }
                h265::NAL_PPS => {
                    record.update_pps(unit)?;
                    return Ok(());
                }
                _ => {}
            },
            _ => unreachable!(),
        }
        let (is_vcl, is_key, new_au) = match codec {
            CodecId::H264 => (
                h264::is_vcl(nal_type),
                nal_type == h264::NAL_IDR_SLICE,
                h264::is_new_access_unit(unit),
            ),
            _ => (
                h265::is_vcl(nal_type),
                h265::is_irap(nal_type),
                h265::is_new_access_unit(unit),
            ),
        };
        if new_au {
            if let Some(p) = pending.take() {
                if p.has_vcl {
                    samples.push(p);
                } else {
                    *pending = Some(p);
                }
            }
        }
        let p = pending.get_or_insert_with(|| PendingSample {
            data: Vec::with_capacity(unit.len() + 4),
            pts,
            dts,
            is_sync: false,
            has_vcl: false,
        });
        p.data.extend_from_slice(&(unit.len() as u32).to_be_bytes());
        p.data.extend_from_slice(unit);
        p.has_vcl |= is_vcl;
        p.is_sync |= is_key;
        Ok(())
    })?;
    // Dimensions come from the first SPS seen.
    if track.width == 0 {
        match &track.config {
            TrackConfig::Avc(record) => {
                if let Some(sps) = record.sps.first() {
                    let parsed = h264::Sps::parse(sps)?;
                    track.width = parsed.width;
                    track.height = parsed.height;
                }
            }
            TrackConfig::Hevc(record) => {
                if let Some(array) = record
                    .arrays
                    .iter()
                    .find(|a| a.nal_unit_type == h265::NAL_SPS)
                {
                    if let Some(sps) = array.units.first() {
                        let parsed = h265::Sps::parse(sps)?;
                        track.width = parsed.width;
                        track.height = parsed.height;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Strips ADTS headers, caching the AudioSpecificConfig; each ADTS frame
/// becomes one sample.
fn write_aac(track: &mut MuxTrack, data: &[u8], pts: i64, dts: i64) -> Result<(), Error> {
    let TrackConfig::Aac { asc } = &mut track.config else {
        unreachable!();
    };
    let samples = &mut track.samples;
    let channels = &mut track.channels;
    let sample_rate = &mut track.sample_rate;
    aac::split_frames(data, |hdr, frame| {
        if asc.is_none() {
            if let Ok(parsed) = aac::adts_to_asc(frame) {
                *channels = parsed.channel_configuration as u16;
                *sample_rate = parsed.sample_rate().unwrap_or(44100);
                *asc = Some(parsed.encode().to_vec());
            }
        }
        samples.push(PendingSample {
            data: frame[hdr.header_len()..].to_vec(),
            pts,
            dts,
            is_sync: true,
            has_vcl: false,
        });
    })?;
    Ok(())
}

fn write_ftyp(out: &mut Vec<u8>, fragmented: bool) {
    write_box!(out, b"ftyp", {
        out.extend_from_slice(b"isom"); // major_brand
        out.write_u32::<BigEndian>(0x200).unwrap(); // minor_version
        out.extend_from_slice(b"isom");
        out.extend_from_slice(b"iso2");
        out.extend_from_slice(b"avc1");
        out.extend_from_slice(b"mp41");
        if fragmented {
            out.extend_from_slice(b"iso5");
            out.extend_from_slice(b"iso6");
            out.extend_from_slice(b"msdh");
            out.extend_from_slice(b"msix");
            out.extend_from_slice(b"dash");
        }
    });
}

/// `moov` for fragmented output: empty sample tables plus `mvex`.
fn build_moov_init(out: &mut Vec<u8>, tracks: &[MuxTrack]) -> Result<(), Error> {
    write_box!(out, b"moov", {
        write_mvhd(out, 0);
        for track in tracks {
            write_trak(out, track, None)?;
        }
        write_box!(out, b"mvex", {
            for track in tracks {
                write_full_box!(out, b"trex", 0u8, 0u32, {
                    out.write_u32::<BigEndian>(track.track_id).unwrap();
                    out.write_u32::<BigEndian>(1).unwrap(); // default_sample_description_index
                    out.write_u32::<BigEndian>(0).unwrap(); // default_sample_duration
                    out.write_u32::<BigEndian>(0).unwrap(); // default_sample_size
                    out.write_u32::<BigEndian>(0).unwrap(); // default_sample_flags
                });
            }
        });
    });
    Ok(())
}

/// `moov` for flat output with full sample tables; `offsets` holds one co64
/// value per sample per track.
fn build_moov_flat(out: &mut Vec<u8>, tracks: &[MuxTrack], offsets: &[Vec<u64>]) -> Result<(), Error> {
    let duration = tracks
        .iter()
        .filter_map(|t| t.samples.last().map(|s| s.dts.max(0) as u64))
        .max()
        .unwrap_or(0);
    write_box!(out, b"moov", {
        write_mvhd(out, duration);
        for (i, track) in tracks.iter().enumerate() {
            write_trak(out, track, Some(&offsets[i]))?;
        }
    });
    Ok(())
}

fn write_mvhd(out: &mut Vec<u8>, duration: u64) {
    write_full_box!(out, b"mvhd", 0u8, 0u32, {
        out.write_u32::<BigEndian>(0).unwrap(); // creation_time
        out.write_u32::<BigEndian>(0).unwrap(); // modification_time
        out.write_u32::<BigEndian>(TIMESCALE).unwrap();
        out.write_u32::<BigEndian>(duration as u32).unwrap();
        out.write_u32::<BigEndian>(0x0001_0000).unwrap(); // rate 1.0
        out.write_u16::<BigEndian>(0x0100).unwrap(); // volume 1.0
        out.write_u16::<BigEndian>(0).unwrap(); // reserved
        out.write_u64::<BigEndian>(0).unwrap(); // reserved
        for v in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
            out.write_u32::<BigEndian>(v).unwrap(); // unity matrix
        }
        for _ in 0..6 {
            out.write_u32::<BigEndian>(0).unwrap(); // pre_defined
        }
        out.write_u32::<BigEndian>(0xffff_ffff).unwrap(); // next_track_ID
    });
}

/// One `trak`; `offsets` present means full (flat) sample tables.
fn write_trak(out: &mut Vec<u8>, track: &MuxTrack, offsets: Option<&[u64]>) -> Result<(), Error> {
    let duration = track
        .samples
        .last()
        .map(|s| s.dts.max(0) as u64)
        .unwrap_or(0);
    write_box!(out, b"trak", {
        write_full_box!(out, b"tkhd", 0u8, 7u32, {
            out.write_u32::<BigEndian>(0).unwrap(); // creation_time
            out.write_u32::<BigEndian>(0).unwrap(); // modification_time
            out.write_u32::<BigEndian>(track.track_id).unwrap();
            out.write_u32::<BigEndian>(0).unwrap(); // reserved
            out.write_u32::<BigEndian>(duration as u32).unwrap();
            out.write_u64::<BigEndian>(0).unwrap(); // reserved
            out.write_u16::<BigEndian>(0).unwrap(); // layer
            out.write_u16::<BigEndian>(0).unwrap(); // alternate_group
            out.write_u16::<BigEndian>(if track.codec.is_audio() { 0x0100 } else { 0 })
                .unwrap(); // volume
            out.write_u16::<BigEndian>(0).unwrap(); // reserved
            for v in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
                out.write_u32::<BigEndian>(v).unwrap();
            }
            out.write_u32::<BigEndian>(track.width << 16).unwrap();
            out.write_u32::<BigEndian>(track.height << 16).unwrap();
        });
        write_box!(out, b"mdia", {
            write_full_box!(out, b"mdhd", 0u8, 0u32, {
                out.write_u32::<BigEndian>(0).unwrap();
                out.write_u32::<BigEndian>(0).unwrap();
                out.write_u32::<BigEndian>(TIMESCALE).unwrap();
                out.write_u32::<BigEndian>(duration as u32).unwrap();
                out.write_u16::<BigEndian>(0x55c4).unwrap(); // language: und
                out.write_u16::<BigEndian>(0).unwrap();
            });
            write_full_box!(out, b"hdlr", 0u8, 0u32, {
                out.write_u32::<BigEndian>(0).unwrap(); // pre_defined
                out.extend_from_slice(if track.codec.is_video() {
                    b"vide"
                } else {
                    b"soun"
                });
                out.extend_from_slice(&[0; 12]); // reserved
                out.extend_from_slice(b"\0"); // name
            });
            write_box!(out, b"minf", {
                if track.codec.is_video() {
                    write_full_box!(out, b"vmhd", 0u8, 1u32, {
                        out.extend_from_slice(&[0; 8]); // graphicsmode + opcolor
                    });
                } else {
                    write_full_box!(out, b"smhd", 0u8, 0u32, {
                        out.extend_from_slice(&[0; 4]); // balance + reserved
                    });
                }
                write_box!(out, b"dinf", {
                    write_full_box!(out, b"dref", 0u8, 0u32, {
                        out.write_u32::<BigEndian>(1).unwrap(); // entry_count
                        write_full_box!(out, b"url ", 0u8, 1u32, {}); // self-contained
                    });
                });
                write_stbl(out, track, offsets)?;
            });
        });
    });
    Ok(())
}

fn write_stbl(out: &mut Vec<u8>, track: &MuxTrack, offsets: Option<&[u64]>) -> Result<(), Error> {
    write_box!(out, b"stbl", {
        write_full_box!(out, b"stsd", 0u8, 0u32, {
            out.write_u32::<BigEndian>(1).unwrap(); // entry_count
            write_sample_entry(out, track)?;
        });
        match offsets {
            None => {
                // Fragmented: empty tables; real samples come in truns.
                for typ in [b"stts", b"stsc", b"stco"] {
                    write_full_box!(out, typ, 0u8, 0u32, {
                        out.write_u32::<BigEndian>(0).unwrap();
                    });
                }
                write_full_box!(out, b"stsz", 0u8, 0u32, {
                    out.write_u32::<BigEndian>(0).unwrap(); // sample_size
                    out.write_u32::<BigEndian>(0).unwrap(); // sample_count
                });
            }
            Some(offsets) => {
                let durations = track.durations();
                write_full_box!(out, b"stts", 0u8, 0u32, {
                    // Run-length encode the deltas.
                    let mut runs: Vec<(u32, u32)> = Vec::new();
                    for &d in &durations {
                        match runs.last_mut() {
                            Some((n, delta)) if *delta == d => *n += 1,
                            _ => runs.push((1, d)),
                        }
                    }
                    out.write_u32::<BigEndian>(runs.len() as u32).unwrap();
                    for (n, delta) in runs {
                        out.write_u32::<BigEndian>(n).unwrap();
                        out.write_u32::<BigEndian>(delta).unwrap();
                    }
                });
                if track.samples.iter().any(|s| s.pts != s.dts) {
                    write_full_box!(out, b"ctts", 1u8, 0u32, {
                        out.write_u32::<BigEndian>(track.samples.len() as u32).unwrap();
                        for s in &track.samples {
                            out.write_u32::<BigEndian>(1).unwrap();
                            out.write_i32::<BigEndian>((s.pts - s.dts) as i32).unwrap();
                        }
                    });
                }
                write_full_box!(out, b"stsc", 0u8, 0u32, {
                    out.write_u32::<BigEndian>(1).unwrap(); // entry_count
                    out.write_u32::<BigEndian>(1).unwrap(); // first_chunk
                    out.write_u32::<BigEndian>(1).unwrap(); // samples_per_chunk
                    out.write_u32::<BigEndian>(1).unwrap(); // sample_description_index
                });
                write_full_box!(out, b"stsz", 0u8, 0u32, {
                    out.write_u32::<BigEndian>(0).unwrap(); // sample_size: per-sample
                    out.write_u32::<BigEndian>(track.samples.len() as u32).unwrap();
                    for s in &track.samples {
                        out.write_u32::<BigEndian>(s.data.len() as u32).unwrap();
                    }
                });
                write_full_box!(out, b"co64", 0u8, 0u32, {
                    out.write_u32::<BigEndian>(offsets.len() as u32).unwrap();
                    for &o in offsets {
                        out.write_u64::<BigEndian>(o).unwrap();
                    }
                });
                if track.codec.is_video() && track.samples.iter().any(|s| !s.is_sync) {
                    write_full_box!(out, b"stss", 0u8, 0u32, {
                        let sync: Vec<u32> = track
                            .samples
                            .iter()
                            .enumerate()
                            .filter(|(_, s)| s.is_sync)
                            .map(|(i, _)| i as u32 + 1)
                            .collect();
                        out.write_u32::<BigEndian>(sync.len() as u32).unwrap();
                        for s in sync {
                            out.write_u32::<BigEndian>(s).unwrap();
                        }
                    });
                }
            }
        }
    });
    Ok(())
}

fn write_sample_entry(out: &mut Vec<u8>, track: &MuxTrack) -> Result<(), Error> {
    let fourcc = sample_entry_fourcc(track.codec);
    write_box!(out, fourcc, {
        out.extend_from_slice(&[0; 6]); // reserved
        out.write_u16::<BigEndian>(1).unwrap(); // data_reference_index
        if track.codec.is_video() {
            // VisualSampleEntry, ISO/IEC 14496-12 section 12.1.3.
            out.extend_from_slice(&[0; 16]); // pre_defined + reserved
            out.write_u16::<BigEndian>(track.width as u16).unwrap();
            out.write_u16::<BigEndian>(track.height as u16).unwrap();
            out.write_u32::<BigEndian>(0x0048_0000).unwrap(); // horizresolution
            out.write_u32::<BigEndian>(0x0048_0000).unwrap(); // vertresolution
            out.write_u32::<BigEndian>(0).unwrap(); // reserved
            out.write_u16::<BigEndian>(1).unwrap(); // frame_count
            out.extend_from_slice(&[0; 32]); // compressorname
            out.write_u16::<BigEndian>(0x18).unwrap(); // depth
            out.write_u16::<BigEndian>(0xffff).unwrap(); // pre_defined
            match &track.config {
                TrackConfig::Avc(record) => {
                    write_box!(out, b"avcC", {
                        out.extend_from_slice(&record.encode()?);
                    });
                }
                TrackConfig::Hevc(record) => {
                    write_box!(out, b"hvcC", {
                        out.extend_from_slice(&record.encode()?);
                    });
                }
                _ => unreachable!(),
            }
        } else {
            // AudioSampleEntry, section 12.2.3.
            out.extend_from_slice(&[0; 8]); // reserved
            out.write_u16::<BigEndian>(track.channels.max(1)).unwrap();
            out.write_u16::<BigEndian>(16).unwrap(); // samplesize
            out.write_u16::<BigEndian>(0).unwrap(); // pre_defined
            out.write_u16::<BigEndian>(0).unwrap(); // reserved
            out.write_u32::<BigEndian>(track.sample_rate << 16).unwrap();
            match &track.config {
                TrackConfig::Aac { asc } => {
                    let Some(asc) = asc else {
                        bail!(FailedPrecondition, msg("AAC track saw no ADTS frame"));
                    };
                    write_full_box!(out, b"esds", 0u8, 0u32, {
                        write_esds(out, object_type(track.codec), asc);
                    });
                }
                TrackConfig::Raw { extradata } => match track.codec {
                    CodecId::Mp3 => {
                        write_full_box!(out, b"esds", 0u8, 0u32, {
                            write_esds(out, object_type(track.codec), &[]);
                        });
                    }
                    CodecId::Opus => {
                        if let Some(dops) = extradata {
                            write_box!(out, b"dOps", {
                                out.extend_from_slice(dops);
                            });
                        }
                    }
                    _ => {} // G.711 carries no configuration box
                },
                _ => unreachable!(),
            }
        }
    });
    Ok(())
}

/// ES descriptor chain (ISO/IEC 14496-1 section 7.2.6) with single-byte
/// sizes; `dsi` is the DecoderSpecificInfo payload (empty to omit).
fn write_esds(out: &mut Vec<u8>, object_type: u8, dsi: &[u8]) {
    let dcd_len = 13 + if dsi.is_empty() { 0 } else { 2 + dsi.len() };
    let es_len = 3 + 2 + dcd_len + 3;
    out.push(0x03); // ES_DescrTag
    out.push(es_len as u8);
    out.extend_from_slice(&[0, 0]); // ES_ID
    out.push(0); // flags
    out.push(0x04); // DecoderConfigDescrTag
    out.push(dcd_len as u8);
    out.push(object_type);
    out.push(0x15); // streamType audio, upStream 0, reserved 1
    out.extend_from_slice(&[0, 0, 0]); // bufferSizeDB
    out.extend_from_slice(&0u32.to_be_bytes()); // maxBitrate
    out.extend_from_slice(&0u32.to_be_bytes()); // avgBitrate
    if !dsi.is_empty() {
        out.push(0x05); // DecSpecificInfoTag
        out.push(dsi.len() as u8);
        out.extend_from_slice(dsi);
    }
    out.push(0x06); // SLConfigDescrTag
    out.push(1);
    out.push(0x02); // predefined: MP4
}

#[cfg(test)]
mod tests {
    use super::super::boxes::{full_box, BoxIter, Cursor};
    use super::*;
    use crate::codec::CodecId;
    use crate::mp4::Demuxer;
    use crate::testutil::{self, h265 as h265_data, H264_IDR, H264_NON_IDR, H264_PPS, H264_SPS};
    use std::io::Cursor as IoCursor;

    fn annexb(units: &[&[u8]]) -> Vec<u8> {
        let mut v = Vec::new();
        for u in units {
            v.extend_from_slice(&[0, 0, 0, 1]);
            v.extend_from_slice(u);
        }
        v
    }

    fn adts_frame(payload: &[u8]) -> Vec<u8> {
        let hdr = aac::AdtsHeader {
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

    /// Walks top-level boxes of `data`, returning (type, payload) pairs.
    fn top_level(data: &[u8]) -> Vec<([u8; 4], Vec<u8>)> {
        BoxIter::new(data)
            .map(|b| b.map(|b| (b.typ, b.payload.to_vec())))
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn fragmented_remux_layout() {
        testutil::init();
        let mut muxer = Muxer::new(Vec::new(), true);
        let video = muxer.add_track(CodecId::H264).unwrap();
        muxer
            .write_frame(video, &annexb(&[&H264_SPS, &H264_PPS, &H264_IDR]), 0, 0)
            .unwrap();
        muxer
            .write_frame(video, &annexb(&[&H264_NON_IDR]), 40, 40)
            .unwrap();
        muxer.write_trailer().unwrap();
        let bytes = muxer.into_inner();

        let boxes = top_level(&bytes);
        let types: Vec<&[u8; 4]> = boxes.iter().map(|(t, _)| t).collect();
        assert_eq!(types, vec![b"ftyp", b"moov", b"styp", b"moof", b"mdat"]);

        // Brands for a fragmented file.
        let ftyp = &boxes[0].1;
        for brand in [&b"isom"[..], b"iso5", b"iso6", b"mp41", b"dash"] {
            assert!(
                ftyp.windows(4).any(|w| w == brand),
                "missing brand {:?}",
                String::from_utf8_lossy(brand)
            );
        }

        // moov carries an mvex.
        let moov_children: Vec<[u8; 4]> = BoxIter::new(&boxes[1].1)
            .map(|b| b.unwrap().typ)
            .collect();
        assert!(moov_children.contains(&*b"mvex"));

        // One trun with two samples: sync then non-sync, AVCC payloads.
        let moof = &boxes[3].1;
        let traf = BoxIter::new(moof)
            .map(|b| b.unwrap())
            .find(|b| &b.typ == b"traf")
            .unwrap();
        let trun = BoxIter::new(traf.payload)
            .map(|b| b.unwrap())
            .find(|b| &b.typ == b"trun")
            .unwrap();
        let (_, _, rest) = full_box(trun.payload).unwrap();
        let mut c = Cursor::new(rest);
        assert_eq!(c.u32().unwrap(), 2); // sample_count
        c.i32().unwrap(); // data_offset
        let (_d1, s1, f1, _cts1) = (
            c.u32().unwrap(),
            c.u32().unwrap(),
            c.u32().unwrap(),
            c.i32().unwrap(),
        );
        let (_d2, _s2, f2, _cts2) = (
            c.u32().unwrap(),
            c.u32().unwrap(),
            c.u32().unwrap(),
            c.i32().unwrap(),
        );
        assert_eq!(f1, SAMPLE_FLAGS_SYNC);
        assert_eq!(f2, SAMPLE_FLAGS_NON_SYNC);
        // Sample 1 is the IDR in 4-byte length-prefixed form (the SPS and PPS
        // moved into the avcC box).
        assert_eq!(s1 as usize, 4 + H264_IDR.len());
    }

    #[test]
    fn fragmented_trun_durations_cover_span() {
        testutil::init();
        let mut muxer = Muxer::new(Vec::new(), true);
        let video = muxer.add_track(CodecId::H264).unwrap();
        let frames = [(0i64, true), (40, false), (80, false), (120, false)];
        for (dts, key) in frames {
            let data = if key {
                annexb(&[&H264_SPS, &H264_PPS, &H264_IDR])
            } else {
                annexb(&[&H264_NON_IDR])
            };
            muxer.write_frame(video, &data, dts, dts).unwrap();
        }
        muxer.write_trailer().unwrap();
        let bytes = muxer.into_inner();
        let boxes = top_level(&bytes);
        let moof = boxes.iter().find(|(t, _)| t == b"moof").unwrap();
        let traf = BoxIter::new(&moof.1)
            .map(|b| b.unwrap())
            .find(|b| &b.typ == b"traf")
            .unwrap();
        let trun = BoxIter::new(traf.payload)
            .map(|b| b.unwrap())
            .find(|b| &b.typ == b"trun")
            .unwrap();
        let (_, _, rest) = full_box(trun.payload).unwrap();
        let mut c = Cursor::new(rest);
        let n = c.u32().unwrap();
        c.i32().unwrap();
        let mut sum = 0u64;
        for _ in 0..n {
            sum += c.u32().unwrap() as u64; // duration
            c.u32().unwrap();
            c.u32().unwrap();
            c.i32().unwrap();
        }
        // dts(last) - dts(first) + last_sample_duration.
        assert_eq!(sum, 120 - 0 + 40);
    }

    #[test]
    fn flat_round_trip_h264_aac() {
        testutil::init();
        let mut muxer = Muxer::new(Vec::new(), false);
        let video = muxer.add_track(CodecId::H264).unwrap();
        let audio = muxer.add_track(CodecId::Aac).unwrap();
        let f1 = annexb(&[&H264_SPS, &H264_PPS, &H264_IDR]);
        let f2 = annexb(&[&H264_NON_IDR]);
        let a1 = adts_frame(&[0x11, 0x22, 0x33]);
        muxer.write_frame(video, &f1, 0, 0).unwrap();
        muxer.write_frame(audio, &a1, 10, 10).unwrap();
        muxer.write_frame(video, &f2, 60, 40).unwrap();
        muxer.write_trailer().unwrap();
        let bytes = muxer.into_inner();

        let types: Vec<[u8; 4]> = top_level(&bytes).iter().map(|(t, _)| *t).collect();
        assert_eq!(types, vec![*b"ftyp", *b"moov", *b"mdat"]);

        let mut demuxer = Demuxer::new(IoCursor::new(bytes)).unwrap();
        let tracks = demuxer.tracks();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].codec, CodecId::H264);
        assert_eq!((tracks[0].width, tracks[0].height), (1280, 720));
        assert_eq!(tracks[1].codec, CodecId::Aac);

        let mut video_frames = Vec::new();
        let mut audio_frames = Vec::new();
        while let Some(f) = demuxer.read_frame().unwrap() {
            assert!(f.pts >= f.dts);
            match f.codec {
                CodecId::H264 => video_frames.push(f),
                CodecId::Aac => audio_frames.push(f),
                _ => panic!("unexpected codec"),
            }
        }
        assert_eq!(video_frames.len(), 2);
        assert_eq!(audio_frames.len(), 1);
        // The IDR sample regains the parameter sets from the avcC box.
        assert_eq!(&video_frames[0].data[..], &f1[..]);
        assert!(video_frames[0].is_key);
        assert_eq!((video_frames[0].pts, video_frames[0].dts), (0, 0));
        assert_eq!(&video_frames[1].data[..], &f2[..]);
        assert!(!video_frames[1].is_key);
        assert_eq!((video_frames[1].pts, video_frames[1].dts), (60, 40));
        // ADTS framing is reconstructed byte-exactly.
        assert_eq!(&audio_frames[0].data[..], &a1[..]);
        assert_eq!((audio_frames[0].pts, audio_frames[0].dts), (10, 10));
    }

    #[test]
    fn flat_round_trip_h265() {
        testutil::init();
        let vps = h265_data::vps();
        let sps = h265_data::sps();
        let pps = h265_data::pps(false, false);
        let idr = h265_data::idr_slice();
        let frame = annexb(&[&vps, &sps, &pps, &idr]);
        let mut muxer = Muxer::new(Vec::new(), false);
        let video = muxer.add_track(CodecId::H265).unwrap();
        muxer.write_frame(video, &frame, 0, 0).unwrap();
        muxer.write_trailer().unwrap();
        let bytes = muxer.into_inner();

        let mut demuxer = Demuxer::new(IoCursor::new(bytes)).unwrap();
        let tracks = demuxer.tracks();
        assert_eq!(tracks[0].codec, CodecId::H265);
        assert_eq!((tracks[0].width, tracks[0].height), (1920, 1080));
        let f = demuxer.read_frame().unwrap().unwrap();
        assert!(f.is_key);
        // Parameter sets come back via the hvcC record, in VPS/SPS/PPS order,
        // followed by the slice.
        assert_eq!(&f.data[..], &frame[..]);
        assert!(demuxer.read_frame().unwrap().is_none());
    }

    #[test]
    fn access_unit_grouping_across_writes() {
        testutil::init();
        let mut muxer = Muxer::new(Vec::new(), false);
        let video = muxer.add_track(CodecId::H264).unwrap();
        // The caller frames NAL-by-NAL; slices with first_mb_in_slice == 0
        // open access units, so this is all one sample.
        muxer.write_frame(video, &annexb(&[&H264_SPS]), 0, 0).unwrap();
        muxer.write_frame(video, &annexb(&[&H264_PPS]), 0, 0).unwrap();
        muxer.write_frame(video, &annexb(&[&H264_IDR]), 0, 0).unwrap();
        muxer.write_trailer().unwrap();
        let bytes = muxer.into_inner();
        let mut demuxer = Demuxer::new(IoCursor::new(bytes)).unwrap();
        let f = demuxer.read_frame().unwrap().unwrap();
        assert!(f.is_key);
        assert_eq!(&f.data[..], &annexb(&[&H264_SPS, &H264_PPS, &H264_IDR])[..]);
        assert!(demuxer.read_frame().unwrap().is_none());
    }

    #[test]
    fn flv_to_fragmented_mp4_remux() {
        testutil::init();
        // FLV in: one H.264 IDR access unit at 0, one non-IDR at 40 ms.
        let mut flv = crate::flv::Muxer::new(Vec::new(), Some(CodecId::H264), None).unwrap();
        flv.write_video(&annexb(&[&H264_SPS, &H264_PPS, &H264_IDR]), 0, 0)
            .unwrap();
        flv.write_video(&annexb(&[&H264_NON_IDR]), 40, 40).unwrap();
        let flv_bytes = flv.into_inner();

        let mut flv_demuxer = crate::flv::Demuxer::new();
        flv_demuxer.input(&flv_bytes).unwrap();
        let mut mp4 = Muxer::new(Vec::new(), true);
        let video = mp4.add_track(CodecId::H264).unwrap();
        while let Some(f) = flv_demuxer.next_frame() {
            mp4.write_frame(video, &f.data, f.pts, f.dts).unwrap();
        }
        mp4.write_trailer().unwrap();
        let bytes = mp4.into_inner();

        let types: Vec<[u8; 4]> = top_level(&bytes).iter().map(|(t, _)| *t).collect();
        assert_eq!(
            types,
            vec![*b"ftyp", *b"moov", *b"styp", *b"moof", *b"mdat"]
        );
        // And it reads back as the same two frames.
        let mut demuxer = Demuxer::new(IoCursor::new(bytes)).unwrap();
        let f1 = demuxer.read_frame().unwrap().unwrap();
        assert!(f1.is_key);
        assert_eq!(&f1.data[..], &annexb(&[&H264_SPS, &H264_PPS, &H264_IDR])[..]);
        let f2 = demuxer.read_frame().unwrap().unwrap();
        assert!(!f2.is_key);
        assert_eq!((f2.pts, f2.dts), (40, 40));
        assert!(demuxer.read_frame().unwrap().is_none());
    }

    #[test]
    fn aud_is_stripped() {
        testutil::init();
        let mut with_aud = h264::AUD_NAL.to_vec();
        with_aud.extend_from_slice(&annexb(&[&H264_SPS, &H264_PPS, &H264_IDR]));
        let mut muxer = Muxer::new(Vec::new(), false);
        let video = muxer.add_track(CodecId::H264).unwrap();
        muxer.write_frame(video, &with_aud, 0, 0).unwrap();
        muxer.write_trailer().unwrap();
        let mut demuxer = Demuxer::new(IoCursor::new(muxer.into_inner())).unwrap();
        let f = demuxer.read_frame().unwrap().unwrap();
        assert_eq!(&f.data[..], &annexb(&[&H264_SPS, &H264_PPS, &H264_IDR])[..]);
    }
}
