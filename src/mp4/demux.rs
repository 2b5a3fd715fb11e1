// This file is part of Moonfire Remux, a media container remuxing toolkit.
// Copyright (C) 2024 The Moonfire Remux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use super::boxes::{full_box, BoxIter, ChildBox, Cursor};
use super::{codec_from_object_type, Extradata, Sample};
use crate::codec::{CodecId, Frame};
use crate::h264::AvcDecoderConfigurationRecord;
use crate::h265::HevcDecoderConfigurationRecord;
use crate::{aac, h264, h265, nal};
use base::{bail, Error, ErrorKind, ResultExt};
use std::io::{Read, Seek, SeekFrom};
use tracing::{debug, warn};

// tfhd flags, ISO/IEC 14496-12 section 8.8.7.
const TFHD_BASE_DATA_OFFSET: u32 = 0x0000_0001;
const TFHD_SAMPLE_DESCRIPTION_INDEX: u32 = 0x0000_0002;
const TFHD_DEFAULT_DURATION: u32 = 0x0000_0008;
const TFHD_DEFAULT_SIZE: u32 = 0x0000_0010;
const TFHD_DEFAULT_FLAGS: u32 = 0x0000_0020;

// trun flags, section 8.8.8.
const TRUN_DATA_OFFSET: u32 = 0x0000_0001;
const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x0000_0004;
const TRUN_SAMPLE_DURATION: u32 = 0x0000_0100;
const TRUN_SAMPLE_SIZE: u32 = 0x0000_0200;
const TRUN_SAMPLE_FLAGS: u32 = 0x0000_0400;
const TRUN_SAMPLE_CTS: u32 = 0x0000_0800;

/// `sample_is_non_sync_sample` within sample flags (section 8.8.3.1).
const SAMPLE_FLAG_IS_NON_SYNC: u32 = 0x0001_0000;

/// Per-track facts exposed to callers.
#[derive(Clone, Debug)]
pub struct TrackInfo {
    pub track_id: u32,
    pub codec: CodecId,
    pub timescale: u32,
    /// In timescale units.
    pub duration: u64,
    pub width: u32,
    pub height: u32,
}

struct DemuxTrack {
    info: TrackInfo,
    extradata: Option<Extradata>,
    /// Parameter sets flattened to Annex B, for prepending to sync samples.
    extradata_annex_b: Vec<u8>,
    samples: Vec<Sample>,
    next: usize,
    // trex defaults, used when a fragment's tfhd omits them.
    trex_duration: u32,
    trex_size: u32,
    trex_flags: u32,
}

/// A pull-based `.mp4` demuxer over a seekable byte source.
///
/// Construction walks the whole file: `moov` yields per-track sample tables,
/// each `moof` appends its fragment's samples, and `mdat` payloads are
/// skipped (they're read back on demand). [`Demuxer::read_frame`] then
/// returns frames ordered by file offset, converted to Annex B/ADTS delivery
/// form with millisecond timestamps.
pub struct Demuxer<R: Read + Seek> {
    r: R,
    tracks: Vec<DemuxTrack>,
}

impl<R: Read + Seek> Demuxer<R> {
    pub fn new(mut r: R) -> Result<Self, Error> {
        let mut tracks: Vec<DemuxTrack> = Vec::new();
        let mut pos = r.seek(SeekFrom::Start(0)).err_kind(ErrorKind::Unknown)?;
        loop {
            let mut hdr = [0u8; 8];
            match read_fully(&mut r, &mut hdr)? {
                0 => break,
                8 => {}
                n => bail!(DataLoss, msg("{}-byte trailing garbage at offset {}", n, pos)),
            }
            let size32 = u32::from_be_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
            let typ = [hdr[4], hdr[5], hdr[6], hdr[7]];
            let (size, header_len) = match size32 {
                0 => {
                    // Box extends to end of file.
                    let end = r.seek(SeekFrom::End(0)).err_kind(ErrorKind::Unknown)?;
                    r.seek(SeekFrom::Start(pos + 8)).err_kind(ErrorKind::Unknown)?;
                    (end - pos, 8u64)
                }
                1 => {
                    let mut large = [0u8; 8];
                    r.read_exact(&mut large).err_kind(ErrorKind::OutOfRange)?;
                    (u64::from_be_bytes(large), 16u64)
                }
                s => (s as u64, 8u64),
            };
            if size < header_len {
                bail!(DataLoss, msg("box size {} smaller than its header", size));
            }
            let payload_len = size - header_len;
            match &typ {
                b"moov" => {
                    let payload = read_payload(&mut r, payload_len)?;
                    parse_moov(&payload, &mut tracks)?;
                }
                b"moof" => {
                    let payload = read_payload(&mut r, payload_len)?;
                    parse_moof(&payload, pos, &mut tracks)?;
                }
                _ => {
                    // ftyp/styp/free/sidx/mdat/mfra: skip; mdat is revisited
                    // by offset from the sample tables.
                    r.seek(SeekFrom::Current(payload_len as i64))
                        .err_kind(ErrorKind::OutOfRange)?;
                }
            }
            pos += size;
            r.seek(SeekFrom::Start(pos)).err_kind(ErrorKind::OutOfRange)?;
        }
        if tracks.is_empty() {
            bail!(DataLoss, msg("no moov box found"));
        }
        for t in &tracks {
            debug!(
                "track {}: {:?}, {} samples, timescale {}",
                t.info.track_id,
                t.info.codec,
                t.samples.len(),
                t.info.timescale
            );
        }
        Ok(Demuxer { r, tracks })
    }

    pub fn tracks(&self) -> Vec<TrackInfo> {
        self.tracks.iter().map(|t| t.info.clone()).collect()
    }

    /// Returns the next frame in file-offset order, or `None` at end of
    /// stream.
    pub fn read_frame(&mut self) -> Result<Option<Frame>, Error> {
        let mut best: Option<usize> = None;
        for (i, t) in self.tracks.iter().enumerate() {
            if t.next >= t.samples.len() {
                continue;
            }
            let off = t.samples[t.next].offset;
            if best.is_none() || off < self.tracks[best.unwrap()].samples[self.tracks[best.unwrap()].next].offset {
                best = Some(i);
            }
        }
        let Some(i) = best else {
            return Ok(None);
        };
        let track = &mut self.tracks[i];
        let sample = track.samples[track.next];
        track.next += 1;
        self.r
            .seek(SeekFrom::Start(sample.offset))
            .err_kind(ErrorKind::OutOfRange)?;
        let mut data = vec![0u8; sample.size as usize];
        self.r.read_exact(&mut data).err_kind(ErrorKind::OutOfRange)?;

        let timescale = track.info.timescale.max(1) as u64;
        let dts_ms = (sample.dts * 1000 / timescale) as i64;
        let pts_ms =
            ((sample.dts as i64 + sample.cts_offset as i64) * 1000 / timescale as i64) as i64;
        let payload = match track.info.codec {
            CodecId::H264 | CodecId::H265 => {
                let mut annexb = Vec::with_capacity(data.len() + 32);
                nal::length_prefixed_to_annex_b(&data, &mut annexb)?;
                let mut has_parameter_sets = false;
                nal::split_annex_b(&annexb, |u| {
                    has_parameter_sets |= match track.info.codec {
                        CodecId::H264 => h264::nal_type(u) == h264::NAL_SPS,
                        _ => h265::nal_type(u) == h265::NAL_SPS,
                    };
                    Ok(())
                })?;
                if sample.is_sync && !has_parameter_sets {
                    if track.extradata_annex_b.is_empty() {
                        bail!(
                            FailedPrecondition,
                            msg("sync sample without parameter sets or track extradata")
                        );
                    }
                    let mut v =
                        Vec::with_capacity(track.extradata_annex_b.len() + annexb.len());
                    v.extend_from_slice(&track.extradata_annex_b);
                    v.extend_from_slice(&annexb);
                    v
                } else {
                    annexb
                }
            }
            CodecId::Aac => {
                let asc_bytes = match &track.extradata {
                    Some(Extradata::Asc(b)) => b,
                    _ => bail!(FailedPrecondition, msg("AAC track without esds config")),
                };
                let asc = aac::AudioSpecificConfig::decode(asc_bytes)?;
                let hdr = aac::asc_to_adts(&asc, data.len() + 7)?;
                let mut v = hdr.encode();
                v.extend_from_slice(&data);
                v
            }
            _ => data,
        };
        let mut f = Frame::new(track.info.codec, payload.into(), pts_ms, dts_ms);
        f.is_key = sample.is_sync;
        Ok(Some(f))
    }
}

/// Reads as much of `buf` as the source can fill; `Ok(0)` at clean EOF.
fn read_fully<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<usize, Error> {
    let mut n = 0;
    while n < buf.len() {
        match r.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(m) => n += m,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(base::err!(Unknown, msg("read failed"), source(e))),
        }
    }
    Ok(n)
}

fn read_payload<R: Read>(r: &mut R, len: u64) -> Result<Vec<u8>, Error> {
    if len > 256 << 20 {
        bail!(DataLoss, msg("implausible {}-byte metadata box", len));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).err_kind(ErrorKind::OutOfRange)?;
    Ok(payload)
}

fn parse_moov(payload: &[u8], tracks: &mut Vec<DemuxTrack>) -> Result<(), Error> {
    for child in BoxIter::new(payload) {
        let child = child?;
        match &child.typ {
            b"trak" => {
                let t = parse_trak(child.payload)?;
                tracks.push(t);
            }
            b"mvex" => {
                for m in BoxIter::new(child.payload) {
                    let m = m?;
                    if &m.typ == b"trex" {
                        let (_, _, rest) = full_box(m.payload)?;
                        let mut c = Cursor::new(rest);
                        let track_id = c.u32()?;
                        c.skip(4)?; // default_sample_description_index
                        let duration = c.u32()?;
                        let size = c.u32()?;
                        let flags = c.u32()?;
                        if let Some(t) = tracks.iter_mut().find(|t| t.info.track_id == track_id) {
                            t.trex_duration = duration;
                            t.trex_size = size;
                            t.trex_flags = flags;
                        }
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_trak(payload: &[u8]) -> Result<DemuxTrack, Error> {
    let mut track = DemuxTrack {
        info: TrackInfo {
            track_id: 0,
            codec: CodecId::H264,
            timescale: 0,
            duration: 0,
            width: 0,
            height: 0,
        },
        extradata: None,
        extradata_annex_b: Vec::new(),
        samples: Vec::new(),
        next: 0,
        trex_duration: 0,
        trex_size: 0,
        trex_flags: 0,
    };
    let mut codec = None;
    for child in BoxIter::new(payload) {
        let child = child?;
        match &child.typ {
            b"tkhd" => {
                let (version, _, rest) = full_box(child.payload)?;
                let mut c = Cursor::new(rest);
                if version == 1 {
                    c.skip(16)?; // creation_time + modification_time
                } else {
                    c.skip(8)?;
                }
                track.info.track_id = c.u32()?;
                c.skip(4)?; // reserved
                if version == 1 {
                    c.skip(8)?; // duration
                } else {
                    c.skip(4)?;
                }
                c.skip(8)?; // reserved
                c.skip(8)?; // layer, alternate_group, volume, reserved
                c.skip(36)?; // matrix
                track.info.width = c.u32()? >> 16;
                track.info.height = c.u32()? >> 16;
            }
            b"mdia" => parse_mdia(child.payload, &mut track, &mut codec)?,
            _ => {}
        }
    }
    match codec {
        Some(c) => track.info.codec = c,
        None => bail!(Unimplemented, msg("track {} has no recognized codec", track.info.track_id)),
    }
    Ok(track)
}

fn parse_mdia(
    payload: &[u8],
    track: &mut DemuxTrack,
    codec: &mut Option<CodecId>,
) -> Result<(), Error> {
    for child in BoxIter::new(payload) {
        let child = child?;
        match &child.typ {
            b"mdhd" => {
                let (version, _, rest) = full_box(child.payload)?;
                let mut c = Cursor::new(rest);
                if version == 1 {
                    c.skip(16)?;
                    track.info.timescale = c.u32()?;
                    track.info.duration = c.u64()?;
                } else {
                    c.skip(8)?;
                    track.info.timescale = c.u32()?;
                    track.info.duration = c.u32()? as u64;
                }
            }
            b"minf" => {
                for m in BoxIter::new(child.payload) {
                    let m = m?;
                    if &m.typ == b"stbl" {
                        parse_stbl(m.payload, track, codec)?;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_stbl(
    payload: &[u8],
    track: &mut DemuxTrack,
    codec: &mut Option<CodecId>,
) -> Result<(), Error> {
    let mut stts: Vec<(u32, u32)> = Vec::new();
    let mut ctts: Vec<(u32, i32)> = Vec::new();
    let mut stsc: Vec<(u32, u32)> = Vec::new();
    let mut sizes: Vec<u32> = Vec::new();
    let mut chunk_offsets: Vec<u64> = Vec::new();
    let mut stss: Option<Vec<u32>> = None;

    for child in BoxIter::new(payload) {
        let child = child?;
        let (_, _, rest) = match &child.typ {
            b"stsd" | b"stts" | b"ctts" | b"stsc" | b"stsz" | b"stco" | b"co64" | b"stss" => {
                full_box(child.payload)?
            }
            _ => continue,
        };
        let mut c = Cursor::new(rest);
        match &child.typ {
            b"stsd" => {
                let n = c.u32()?;
                if n >= 1 {
                    let entries = c.take(c.remaining())?;
                    if let Some(entry) = BoxIter::new(entries).next() {
                        parse_sample_entry(entry?, track, codec)?;
                    }
                }
            }
            b"stts" => {
                let n = c.u32()?;
                for _ in 0..n {
                    stts.push((c.u32()?, c.u32()?));
                }
            }
            b"ctts" => {
                let (version, _, _) = full_box(child.payload)?;
                let n = c.u32()?;
                for _ in 0..n {
                    let count = c.u32()?;
                    let offset = if version == 1 { c.i32()? } else { c.u32()? as i32 };
                    ctts.push((count, offset));
                }
            }
            b"stsc" => {
                let n = c.u32()?;
                for _ in 0..n {
                    let first_chunk = c.u32()?;
                    let samples_per_chunk = c.u32()?;
                    c.skip(4)?; // sample_description_index
                    stsc.push((first_chunk, samples_per_chunk));
                }
            }
            b"stsz" => {
                let uniform = c.u32()?;
                let n = c.u32()?;
                if uniform != 0 {
                    sizes = vec![uniform; n as usize];
                } else {
                    sizes.reserve(n as usize);
                    for _ in 0..n {
                        sizes.push(c.u32()?);
                    }
                }
            }
            b"stco" => {
                let n = c.u32()?;
                for _ in 0..n {
                    chunk_offsets.push(c.u32()? as u64);
                }
            }
            b"co64" => {
                let n = c.u32()?;
                for _ in 0..n {
                    chunk_offsets.push(c.u64()?);
                }
            }
            b"stss" => {
                let n = c.u32()?;
                let mut v = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    v.push(c.u32()?);
                }
                stss = Some(v);
            }
            _ => unreachable!(),
        }
    }

    track.samples = materialize(&stts, &ctts, &stsc, &sizes, &chunk_offsets, stss.as_deref())?;
    Ok(())
}

/// Interleaves the five tables into one flat sample vector.
fn materialize(
    stts: &[(u32, u32)],
    ctts: &[(u32, i32)],
    stsc: &[(u32, u32)],
    sizes: &[u32],
    chunk_offsets: &[u64],
    stss: Option<&[u32]>,
) -> Result<Vec<Sample>, Error> {
    let count = sizes.len();
    let mut samples = Vec::with_capacity(count);

    // Decode times.
    let mut dts = 0u64;
    let mut deltas = Vec::with_capacity(count);
    for &(n, delta) in stts {
        for _ in 0..n {
            if deltas.len() == count {
                break;
            }
            deltas.push(dts);
            dts += delta as u64;
        }
    }
    if deltas.len() != count {
        bail!(DataLoss, msg("stts covers {} samples, stsz {}", deltas.len(), count));
    }

    // Composition offsets.
    let mut cts = vec![0i32; count];
    let mut i = 0;
    for &(n, offset) in ctts {
        for _ in 0..n {
            if i == count {
                break;
            }
            cts[i] = offset;
            i += 1;
        }
    }

    // File offsets via chunk maps.
    let mut offsets = vec![0u64; count];
    let mut sample = 0usize;
    for (run, &(first_chunk, per_chunk)) in stsc.iter().enumerate() {
        let end_chunk = stsc
            .get(run + 1)
            .map(|&(f, _)| f)
            .unwrap_or(chunk_offsets.len() as u32 + 1);
        if first_chunk == 0 || end_chunk < first_chunk {
            bail!(DataLoss, msg("bad stsc run at index {}", run));
        }
        for chunk in first_chunk..end_chunk {
            let Some(&base) = chunk_offsets.get(chunk as usize - 1) else {
                bail!(DataLoss, msg("stsc names chunk {} beyond stco", chunk));
            };
            let mut off = base;
            for _ in 0..per_chunk {
                if sample == count {
                    break;
                }
                offsets[sample] = off;
                off += sizes[sample] as u64;
                sample += 1;
            }
        }
    }
    if sample != count {
        bail!(DataLoss, msg("chunk map covers {} of {} samples", sample, count));
    }

    for i in 0..count {
        samples.push(Sample {
            dts: deltas[i],
            cts_offset: cts[i],
            size: sizes[i],
            offset: offsets[i],
            is_sync: match stss {
                None => true,
                Some(table) => table.binary_search(&(i as u32 + 1)).is_ok(),
            },
        });
    }
    Ok(samples)
}

fn parse_sample_entry(
    entry: ChildBox,
    track: &mut DemuxTrack,
    codec: &mut Option<CodecId>,
) -> Result<(), Error> {
    match &entry.typ {
        b"avc1" | b"hvc1" | b"hev1" => {
            let mut c = Cursor::new(entry.payload);
            c.skip(6 + 2)?; // reserved + data_reference_index
            c.skip(16)?; // pre_defined + reserved
            let width = c.u16()? as u32;
            let height = c.u16()? as u32;
            c.skip(4 + 4 + 4 + 2 + 32 + 2 + 2)?; // resolutions..pre_defined
            if track.info.width == 0 {
                track.info.width = width;
                track.info.height = height;
            }
            let children = c.take(c.remaining())?;
            for b in BoxIter::new(children) {
                let b = b?;
                match &b.typ {
                    b"avcC" => {
                        let record = AvcDecoderConfigurationRecord::parse(b.payload)?;
                        track.extradata_annex_b = record.to_annex_b();
                        track.extradata = Some(Extradata::Avc(record));
                        *codec = Some(CodecId::H264);
                    }
                    b"hvcC" => {
                        let record = HevcDecoderConfigurationRecord::parse(b.payload)?;
                        track.extradata_annex_b = record.to_annex_b();
                        track.extradata = Some(Extradata::Hevc(record));
                        *codec = Some(CodecId::H265);
                    }
                    _ => {}
                }
            }
            if codec.is_none() {
                // No decoder configuration; fall back on the entry fourcc.
                *codec = Some(if &entry.typ == b"avc1" {
                    CodecId::H264
                } else {
                    CodecId::H265
                });
            }
        }
        b"mp4a" | b"alaw" | b"ulaw" | b"Opus" | b"opus" => {
            let mut c = Cursor::new(entry.payload);
            c.skip(6 + 2)?; // reserved + data_reference_index
            c.skip(8)?; // reserved
            c.skip(2 + 2 + 2 + 2)?; // channelcount, samplesize, pre_defined, reserved
            c.skip(4)?; // samplerate (16.16)
            let children = c.take(c.remaining())?;
            match &entry.typ {
                b"mp4a" => {
                    for b in BoxIter::new(children) {
                        let b = b?;
                        if &b.typ == b"esds" {
                            let (object_type, asc) = parse_esds(b.payload)?;
                            *codec = Some(codec_from_object_type(object_type)?);
                            if let Some(asc) = asc {
                                track.extradata = Some(Extradata::Asc(asc));
                            }
                        }
                    }
                    if codec.is_none() {
                        warn!("mp4a entry without esds; assuming AAC");
                        *codec = Some(CodecId::Aac);
                    }
                }
                b"alaw" => *codec = Some(CodecId::G711A),
                b"ulaw" => *codec = Some(CodecId::G711U),
                _ => {
                    *codec = Some(CodecId::Opus);
                    for b in BoxIter::new(children) {
                        let b = b?;
                        if &b.typ == b"dOps" {
                            track.extradata = Some(Extradata::Raw(b.payload.to_vec()));
                        }
                    }
                }
            }
        }
        _ => bail!(
            Unimplemented,
            msg("unsupported sample entry {:?}", String::from_utf8_lossy(&entry.typ))
        ),
    }
    Ok(())
}

/// Pulls `objectTypeIndication` and the DecoderSpecificInfo out of an `esds`
/// box (ISO/IEC 14496-1 section 7.2.6).
fn parse_esds(payload: &[u8]) -> Result<(u8, Option<Vec<u8>>), Error> {
    let (_, _, mut rest) = full_box(payload)?;
    let mut object_type = 0u8;
    let mut asc = None;
    while !rest.is_empty() {
        let (tag, body, remainder) = read_descriptor(rest)?;
        match tag {
            0x03 => {
                // ES_Descriptor: es_id + flags, then nested descriptors.
                if body.len() < 3 {
                    bail!(DataLoss, msg("short ES descriptor"));
                }
                let flags = body[2];
                let mut skip = 3;
                if flags & 0x80 != 0 {
                    skip += 2; // dependsOn_ES_ID
                }
                if flags & 0x40 != 0 {
                    // URL descriptor.
                    if body.len() < skip + 1 {
                        bail!(DataLoss, msg("short ES URL descriptor"));
                    }
                    skip += 1 + body[skip] as usize;
                }
                if flags & 0x20 != 0 {
                    skip += 2; // OCR_ES_Id
                }
                if body.len() < skip {
                    bail!(DataLoss, msg("short ES descriptor"));
                }
                rest = &body[skip..];
                continue;
            }
            0x04 => {
                // DecoderConfigDescriptor.
                if body.len() < 13 {
                    bail!(DataLoss, msg("short DecoderConfigDescriptor"));
                }
                object_type = body[0];
                rest = &body[13..];
                continue;
            }
            0x05 => {
                asc = Some(body.to_vec());
            }
            _ => {}
        }
        rest = remainder;
    }
    if object_type == 0 {
        bail!(DataLoss, msg("esds without DecoderConfigDescriptor"));
    }
    Ok((object_type, asc))
}

/// Reads one `(tag, body, rest)` descriptor with its variable-length size.
fn read_descriptor(data: &[u8]) -> Result<(u8, &[u8], &[u8]), Error> {
    if data.len() < 2 {
        bail!(DataLoss, msg("truncated descriptor"));
    }
    let tag = data[0];
    let mut len = 0usize;
    let mut i = 1;
    loop {
        if i >= data.len() || i > 4 {
            bail!(DataLoss, msg("bad descriptor length"));
        }
        let b = data[i];
        i += 1;
        len = len << 7 | (b & 0x7f) as usize;
        if b & 0x80 == 0 {
            break;
        }
    }
    if data.len() < i + len {
        bail!(DataLoss, msg("descriptor length {} overflows box", len));
    }
    Ok((tag, &data[i..i + len], &data[i + len..]))
}

fn parse_moof(payload: &[u8], moof_offset: u64, tracks: &mut Vec<DemuxTrack>) -> Result<(), Error> {
    for child in BoxIter::new(payload) {
        let child = child?;
        if &child.typ != b"traf" {
            continue;
        }
        parse_traf(child.payload, moof_offset, tracks)?;
    }
    Ok(())
}

fn parse_traf(payload: &[u8], moof_offset: u64, tracks: &mut Vec<DemuxTrack>) -> Result<(), Error> {
    // First pass: tfhd + tfdt establish the defaults and baseline.
    let mut track: Option<usize> = None;
    let mut base_data_offset = moof_offset;
    let mut default_duration = 0u32;
    let mut default_size = 0u32;
    let mut default_flags = 0u32;
    let mut dts = 0u64;
    let mut next_offset: Option<u64> = None;

    for child in BoxIter::new(payload) {
        let child = child?;
        match &child.typ {
            b"tfhd" => {
                let (_, flags, rest) = full_box(child.payload)?;
                let mut c = Cursor::new(rest);
                let track_id = c.u32()?;
                let Some(idx) = tracks.iter().position(|t| t.info.track_id == track_id) else {
                    bail!(DataLoss, msg("moof references unknown track {}", track_id));
                };
                track = Some(idx);
                // ISO/IEC 14496-12: with neither base-data-offset-present nor
                // default-base-is-moof, the base is the moof's first byte.
                if flags & TFHD_BASE_DATA_OFFSET != 0 {
                    base_data_offset = c.u64()?;
                }
                if flags & TFHD_SAMPLE_DESCRIPTION_INDEX != 0 {
                    c.skip(4)?;
                }
                let t = &tracks[idx];
                default_duration = if flags & TFHD_DEFAULT_DURATION != 0 {
                    c.u32()?
                } else {
                    t.trex_duration
                };
                default_size = if flags & TFHD_DEFAULT_SIZE != 0 {
                    c.u32()?
                } else {
                    t.trex_size
                };
                default_flags = if flags & TFHD_DEFAULT_FLAGS != 0 {
                    c.u32()?
                } else {
                    t.trex_flags
                };
            }
            b"tfdt" => {
                let (version, _, rest) = full_box(child.payload)?;
                let mut c = Cursor::new(rest);
                dts = if version == 1 { c.u64()? } else { c.u32()? as u64 };
            }
            b"trun" => {
                let Some(idx) = track else {
                    bail!(DataLoss, msg("trun before tfhd"));
                };
                let (version, flags, rest) = full_box(child.payload)?;
                let mut c = Cursor::new(rest);
                let sample_count = c.u32()?;
                let mut offset = if flags & TRUN_DATA_OFFSET != 0 {
                    (base_data_offset as i64 + c.i32()? as i64) as u64
                } else {
                    // Contiguous with the previous run, or the base itself.
                    next_offset.unwrap_or(base_data_offset)
                };
                let first_sample_flags = if flags & TRUN_FIRST_SAMPLE_FLAGS != 0 {
                    Some(c.u32()?)
                } else {
                    None
                };
                let t = &mut tracks[idx];
                for i in 0..sample_count {
                    let duration = if flags & TRUN_SAMPLE_DURATION != 0 {
                        c.u32()?
                    } else {
                        default_duration
                    };
                    let size = if flags & TRUN_SAMPLE_SIZE != 0 {
                        c.u32()?
                    } else {
                        default_size
                    };
                    let sample_flags = if flags & TRUN_SAMPLE_FLAGS != 0 {
                        c.u32()?
                    } else if i == 0 {
                        first_sample_flags.unwrap_or(default_flags)
                    } else {
                        default_flags
                    };
                    let cts = if flags & TRUN_SAMPLE_CTS != 0 {
                        if version == 0 {
                            c.u32()? as i32
                        } else {
                            c.i32()?
                        }
                    } else {
                        0
                    };
                    t.samples.push(Sample {
                        dts,
                        cts_offset: cts,
                        size,
                        offset,
                        is_sync: sample_flags & SAMPLE_FLAG_IS_NON_SYNC == 0,
                    });
                    dts += duration as u64;
                    offset += size as u64;
                }
                next_offset = Some(offset);
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    // End-to-end coverage (mux then demux) lives in `super::mux::tests`.
}
