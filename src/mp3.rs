// This file is part of Moonfire Remux, a media container remuxing toolkit.
// Copyright (C) 2024 The Moonfire Remux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! MPEG audio (layer I–III) frame headers, ISO/IEC 11172-3 section 2.4.1.3.
//! Only the header is understood; payloads pass through containers verbatim.
//! The FLV muxer uses this to fill in sample-rate/channel fields.

use base::{bail, Error};

/// `(MPEG1, MPEG2, MPEG2.5)` rows by `sampling_frequency` index.
const SAMPLE_RATES: [[u32; 3]; 3] = [
    [44100, 22050, 11025],
    [48000, 24000, 12000],
    [32000, 16000, 8000],
];

/// kbit/s for MPEG-1 by layer (I, II, III); index 0 is "free format".
const BITRATES_V1: [[u32; 15]; 3] = [
    [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448],
    [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384],
    [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320],
];

/// kbit/s for MPEG-2/2.5: layer I then layers II+III.
const BITRATES_V2: [[u32; 15]; 2] = [
    [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256],
    [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],
];

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Version {
    Mpeg1,
    Mpeg2,
    Mpeg25,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FrameHeader {
    pub version: Version,
    /// 1, 2, or 3.
    pub layer: u8,
    pub bitrate_index: u8,
    pub sampling_frequency: u8,
    pub padding: u8,
    /// 0 stereo, 1 joint stereo, 2 dual channel, 3 single channel.
    pub mode: u8,
}

impl FrameHeader {
    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 4 {
            bail!(OutOfRange, msg("MPEG audio header needs 4 bytes"));
        }
        if data[0] != 0xff || data[1] & 0xe0 != 0xe0 {
            bail!(DataLoss, msg("bad MPEG audio sync word"));
        }
        let version = match data[1] >> 3 & 0x03 {
            0 => Version::Mpeg25,
            2 => Version::Mpeg2,
            3 => Version::Mpeg1,
            v => bail!(DataLoss, msg("reserved MPEG audio version id {}", v)),
        };
        let layer = match data[1] >> 1 & 0x03 {
            1 => 3,
            2 => 2,
            3 => 1,
            _ => bail!(DataLoss, msg("reserved MPEG audio layer")),
        };
        let bitrate_index = data[2] >> 4;
        if bitrate_index == 0x0f {
            bail!(DataLoss, msg("bad MPEG audio bitrate index"));
        }
        let sampling_frequency = data[2] >> 2 & 0x03;
        if sampling_frequency == 3 {
            bail!(DataLoss, msg("reserved MPEG audio sampling frequency"));
        }
        Ok(FrameHeader {
            version,
            layer,
            bitrate_index,
            sampling_frequency,
            padding: data[2] >> 1 & 0x01,
            mode: data[3] >> 6,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        let col = match self.version {
            Version::Mpeg1 => 0,
            Version::Mpeg2 => 1,
            Version::Mpeg25 => 2,
        };
        SAMPLE_RATES[self.sampling_frequency as usize][col]
    }

    pub fn channel_count(&self) -> u8 {
        if self.mode == 3 {
            1
        } else {
            2
        }
    }

    pub fn bitrate(&self) -> u32 {
        let i = self.bitrate_index as usize;
        1000 * match (self.version, self.layer) {
            (Version::Mpeg1, l) => BITRATES_V1[l as usize - 1][i],
            (_, 1) => BITRATES_V2[0][i],
            (_, _) => BITRATES_V2[1][i],
        }
    }

    /// Whole-frame length in bytes, header included.
    pub fn frame_len(&self) -> usize {
        let bitrate = self.bitrate();
        if bitrate == 0 {
            return 0; // free-format; caller must find the next sync itself
        }
        let (coeff, slot) = if self.layer == 1 {
            (12, 4)
        } else if self.layer == 3 && self.version != Version::Mpeg1 {
            (72, 1)
        } else {
            (144, 1)
        };
        ((coeff * bitrate / self.sample_rate() + self.padding as u32) as usize) * slot
    }
}

/// Calls `f` with each complete `(header, whole frame)` in the buffer,
/// resynchronizing past garbage. Returns bytes consumed.
pub fn split_frames<F>(data: &[u8], mut f: F) -> Result<usize, Error>
where
    F: FnMut(&FrameHeader, &[u8]),
{
    let mut pos = 0;
    while data.len() - pos >= 4 {
        let hdr = match FrameHeader::decode(&data[pos..]) {
            Ok(h) => h,
            Err(_) => {
                pos += 1;
                continue;
            }
        };
        let len = hdr.frame_len();
        if len == 0 {
            bail!(Unimplemented, msg("free-format MPEG audio stream"));
        }
        if data.len() - pos < len {
            break;
        }
        f(&hdr, &data[pos..pos + len]);
        pos += len;
    }
    Ok(pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typical_mp3_header() {
        // MPEG-1 layer III, 128 kbit/s, 44.1 kHz, joint stereo: ff fb 90 64.
        let hdr = FrameHeader::decode(&[0xff, 0xfb, 0x90, 0x64]).unwrap();
        assert_eq!(hdr.version, Version::Mpeg1);
        assert_eq!(hdr.layer, 3);
        assert_eq!(hdr.bitrate(), 128_000);
        assert_eq!(hdr.sample_rate(), 44100);
        assert_eq!(hdr.channel_count(), 2);
        assert_eq!(hdr.frame_len(), 417); // 144 * 128000 / 44100, no padding
    }

    #[test]
    fn split_with_resync() {
        let mut buf = vec![0x00, 0x12]; // leading garbage
        let hdr = [0xff, 0xfb, 0x90, 0x64];
        buf.extend_from_slice(&hdr);
        buf.resize(2 + 417, 0xab);
        let mut n = 0;
        let consumed = split_frames(&buf, |h, f| {
            n += 1;
            assert_eq!(h.sample_rate(), 44100);
            assert_eq!(f.len(), 417);
        })
        .unwrap();
        assert_eq!(n, 1);
        assert_eq!(consumed, buf.len());
    }
}
