// This file is part of Moonfire Remux, a media container remuxing toolkit.
// Copyright (C) 2024 The Moonfire Remux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! ISO/IEC 14496-12 box plumbing: iteration over child boxes of an in-memory
//! payload, full-box headers, and a bounds-checked big-endian cursor. Box
//! *writing* is in `mux.rs`, which builds boxes with a length-backpatching
//! macro instead.

use base::{bail, Error};

/// A child box borrowed from its parent's payload.
#[derive(Clone, Copy)]
pub(crate) struct ChildBox<'a> {
    pub typ: [u8; 4],
    pub payload: &'a [u8],
}

impl std::fmt::Debug for ChildBox<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} ({} bytes)",
            String::from_utf8_lossy(&self.typ),
            self.payload.len()
        )
    }
}

/// Iterates over the boxes laid end-to-end in `data`.
pub(crate) struct BoxIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BoxIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        BoxIter { data, pos: 0 }
    }
}

impl<'a> Iterator for BoxIter<'a> {
    type Item = Result<ChildBox<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos == self.data.len() {
            return None;
        }
        let rest = &self.data[self.pos..];
        if rest.len() < 8 {
            self.pos = self.data.len();
            return Some(Err(base::err!(
                DataLoss,
                msg("{}-byte tail is too short for a box header", rest.len())
            )));
        }
        let size32 = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
        let typ = [rest[4], rest[5], rest[6], rest[7]];
        let (size, header_len) = match size32 {
            0 => (rest.len() as u64, 8), // box extends to end of enclosing scope
            1 => {
                if rest.len() < 16 {
                    self.pos = self.data.len();
                    return Some(Err(base::err!(DataLoss, msg("truncated 64-bit box size"))));
                }
                let large = u64::from_be_bytes([
                    rest[8], rest[9], rest[10], rest[11], rest[12], rest[13], rest[14], rest[15],
                ]);
                (large, 16)
            }
            s => (s as u64, 8),
        };
        if size < header_len as u64 || size > rest.len() as u64 {
            self.pos = self.data.len();
            return Some(Err(base::err!(
                DataLoss,
                msg(
                    "box {} size {} overflows parent ({} bytes left)",
                    String::from_utf8_lossy(&typ),
                    size,
                    rest.len()
                )
            )));
        }
        self.pos += size as usize;
        Some(Ok(ChildBox {
            typ,
            payload: &rest[header_len..size as usize],
        }))
    }
}

/// Splits a full-box payload into `(version, flags, rest)`.
pub(crate) fn full_box(payload: &[u8]) -> Result<(u8, u32, &[u8]), Error> {
    if payload.len() < 4 {
        bail!(DataLoss, msg("full box shorter than version+flags"));
    }
    let flags =
        u32::from(payload[1]) << 16 | u32::from(payload[2]) << 8 | u32::from(payload[3]);
    Ok((payload[0], flags, &payload[4..]))
}

/// Bounds-checked big-endian reads over a byte slice.
pub(crate) struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.remaining() < n {
            bail!(
                DataLoss,
                msg("need {} bytes at offset {}, have {}", n, self.pos, self.remaining())
            );
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), Error> {
        self.take(n).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, Error> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, Error> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64, Error> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    pub fn i32(&mut self) -> Result<i32, Error> {
        Ok(self.u32()? as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iterate_children() {
        let mut data = Vec::new();
        data.extend_from_slice(&12u32.to_be_bytes());
        data.extend_from_slice(b"ftyp");
        data.extend_from_slice(b"isom");
        data.extend_from_slice(&9u32.to_be_bytes());
        data.extend_from_slice(b"free");
        data.push(0xaa);
        let boxes: Vec<_> = BoxIter::new(&data).collect::<Result<_, _>>().unwrap();
        assert_eq!(boxes.len(), 2);
        assert_eq!(&boxes[0].typ, b"ftyp");
        assert_eq!(boxes[0].payload, b"isom");
        assert_eq!(&boxes[1].typ, b"free");
        assert_eq!(boxes[1].payload, &[0xaa]);
    }

    #[test]
    fn size_overflow_is_rejected() {
        let mut data = Vec::new();
        data.extend_from_slice(&100u32.to_be_bytes());
        data.extend_from_slice(b"moov");
        let err = BoxIter::new(&data).next().unwrap().unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::DataLoss);
    }

    #[test]
    fn largesize() {
        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&17u64.to_be_bytes());
        data.push(0x42);
        let b = BoxIter::new(&data).next().unwrap().unwrap();
        assert_eq!(&b.typ, b"mdat");
        assert_eq!(b.payload, &[0x42]);
    }
}
