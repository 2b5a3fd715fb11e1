// This file is part of Moonfire Remux, a media container remuxing toolkit.
// Copyright (C) 2024 The Moonfire Remux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Access-unit reassembly over Annex B byte streams, shared by the MPEG-2
//! transport- and program-stream demuxers. PES payloads accumulate in a
//! buffer; a completed access unit is recognized when a delimiter-class NAL
//! (AUD, parameter set, SEI) or a VCL NAL opening a new picture arrives
//! after slice data, and is emitted with any leading AUD stripped.

use crate::codec::CodecId;
use crate::{h264, h265, nal};

pub(crate) struct AuSplitter {
    codec: CodecId,
    buf: Vec<u8>,
    vcl: usize,
}

impl AuSplitter {
    pub fn new(codec: CodecId) -> Self {
        debug_assert!(codec.is_video());
        AuSplitter {
            codec,
            buf: Vec::with_capacity(1024),
            vcl: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Appends payload bytes and calls `f` with each completed access unit.
    /// Returns true if at least one unit was emitted.
    pub fn push<F: FnMut(Vec<u8>)>(&mut self, payload: &[u8], mut f: F) -> bool {
        self.buf.extend_from_slice(payload);
        let data = std::mem::take(&mut self.buf);
        let is_h264 = self.codec == CodecId::H264;
        let hdr_len = if is_h264 { 1 } else { 2 };
        let mut frame_beg = 0usize;
        let mut emitted = false;
        let Some((mut start, mut sc)) = nal::next_start_code(&data, 0) else {
            self.buf = data;
            return false;
        };
        loop {
            if data.len() - start <= sc + hdr_len {
                break;
            }
            let unit = &data[start + sc..];
            let (boundary_nal, vcl_nal, opens_picture) = if is_h264 {
                let t = h264::nal_type(unit);
                (
                    matches!(
                        t,
                        h264::NAL_AUD | h264::NAL_SPS | h264::NAL_PPS | h264::NAL_SEI
                    ),
                    h264::is_vcl(t),
                    // first_mb_in_slice == 0 iff its Exp-Golomb code starts
                    // with a 1 bit.
                    unit.len() > 1 && unit[1] & 0x80 != 0,
                )
            } else {
                let t = h265::nal_type(unit);
                (
                    matches!(
                        t,
                        h265::NAL_AUD
                            | h265::NAL_VPS
                            | h265::NAL_SPS
                            | h265::NAL_PPS
                            | h265::NAL_SEI_PREFIX
                    ),
                    h265::is_vcl(t),
                    h265::first_slice_segment_in_pic(unit),
                )
            };
            let mut emit = false;
            if boundary_nal {
                if self.vcl > 0 {
                    emit = true;
                    self.vcl = 0;
                }
            } else if vcl_nal {
                if self.vcl > 0 && opens_picture {
                    emit = true;
                    self.vcl = 1; // this slice opens the retained access unit
                } else {
                    self.vcl += 1;
                }
            }
            if emit {
                let frame = strip_leading_aud(&data[frame_beg..start], self.codec);
                if !frame.is_empty() {
                    f(frame.to_vec());
                    emitted = true;
                }
                frame_beg = start;
            }
            match nal::next_start_code(&data, start + 3) {
                Some((next, next_sc)) => {
                    start = next;
                    sc = next_sc;
                }
                None => break,
            }
        }
        self.buf = data[frame_beg..].to_vec();
        emitted
    }

    /// Takes whatever is buffered as a final access unit.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        self.vcl = 0;
        let buf = std::mem::take(&mut self.buf);
        let frame = strip_leading_aud(&buf, self.codec);
        if frame.is_empty() {
            None
        } else {
            Some(frame.to_vec())
        }
    }
}

/// Offset past a leading access-unit delimiter, if any.
pub(crate) fn strip_leading_aud(frame: &[u8], codec: CodecId) -> &[u8] {
    let Some((0, sc)) = nal::next_start_code(frame, 0) else {
        return frame;
    };
    let is_aud = match codec {
        CodecId::H264 => h264::nal_type(&frame[sc..]) == h264::NAL_AUD,
        _ => h265::nal_type(&frame[sc..]) == h265::NAL_AUD,
    };
    if !is_aud {
        return frame;
    }
    match nal::next_start_code(frame, sc) {
        Some((next, _)) => &frame[next..],
        None => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{H264_IDR, H264_NON_IDR, H264_PPS, H264_SPS};

    fn annexb(units: &[&[u8]]) -> Vec<u8> {
        let mut v = Vec::new();
        for u in units {
            v.extend_from_slice(&[0, 0, 0, 1]);
            v.extend_from_slice(u);
        }
        v
    }

    #[test]
    fn splits_on_next_access_unit() {
        let mut s = AuSplitter::new(CodecId::H264);
        let mut frames = Vec::new();
        let mut input = crate::h264::AUD_NAL.to_vec();
        input.extend_from_slice(&annexb(&[&H264_SPS, &H264_PPS, &H264_IDR]));
        assert!(!s.push(&input, |f| frames.push(f)));
        // The next frame's SPS closes the first access unit.
        assert!(s.push(&annexb(&[&H264_NON_IDR]), |f| frames.push(f)));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], annexb(&[&H264_SPS, &H264_PPS, &H264_IDR]));
        assert_eq!(s.flush().unwrap(), annexb(&[&H264_NON_IDR]));
        assert!(s.flush().is_none());
    }

    #[test]
    fn consecutive_slices_with_first_mb_zero() {
        let mut s = AuSplitter::new(CodecId::H264);
        let mut frames = Vec::new();
        s.push(&annexb(&[&H264_NON_IDR]), |f| frames.push(f));
        s.push(&annexb(&[&H264_NON_IDR]), |f| frames.push(f));
        s.push(&annexb(&[&H264_NON_IDR]), |f| frames.push(f));
        assert_eq!(frames.len(), 2);
        assert_eq!(s.flush().unwrap(), annexb(&[&H264_NON_IDR]));
    }
}
