// This file is part of Moonfire Remux, a media container remuxing toolkit.
// Copyright (C) 2024 The Moonfire Remux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! AAC framing: the ADTS header used outside `.mp4` (ISO/IEC 13818-7 section
//! 6.2) and the `AudioSpecificConfig` used inside it (ISO/IEC 14496-3 section
//! 1.6.2.1), plus the conversions between them. The containers never look at
//! raw AAC payloads; they only reframe them.

use base::{bail, Error};

/// Sampling frequencies by `sampling_frequency_index`, ISO/IEC 14496-3 table
/// 1.18.
pub const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Returns the `sampling_frequency_index` for an exact rate.
pub fn sample_rate_index(rate: u32) -> Result<u8, Error> {
    match SAMPLE_RATES.iter().position(|&r| r == rate) {
        Some(i) => Ok(i as u8),
        None => bail!(InvalidArgument, msg("no ADTS index for sample rate {}", rate)),
    }
}

/// An ADTS frame header: fixed plus variable parts. 7 bytes on the wire when
/// `protection_absent`, 9 when a CRC follows.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AdtsHeader {
    pub id: u8,
    pub layer: u8,
    pub protection_absent: u8,
    /// ISO/IEC 13818-7 table 31: 0 Main, 1 LC, 2 SSR.
    pub profile: u8,
    pub sampling_frequency_index: u8,
    pub private_bit: u8,
    pub channel_configuration: u8,
    pub original_copy: u8,
    pub home: u8,
    pub copyright_identification_bit: u8,
    pub copyright_identification_start: u8,
    /// Total frame length including this header.
    pub frame_length: u16,
    pub buffer_fullness: u16,
    pub number_of_raw_data_blocks_in_frame: u8,
}

impl Default for AdtsHeader {
    fn default() -> Self {
        AdtsHeader {
            id: 0,
            layer: 0,
            protection_absent: 1,
            profile: 1,
            sampling_frequency_index: 4, // 44100
            private_bit: 0,
            channel_configuration: 0,
            original_copy: 0,
            home: 0,
            copyright_identification_bit: 0,
            copyright_identification_start: 0,
            frame_length: 0,
            buffer_fullness: 0,
            number_of_raw_data_blocks_in_frame: 0,
        }
    }
}

impl AdtsHeader {
    /// Parses the 7-byte header (the CRC, if any, is not read).
    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 7 {
            bail!(OutOfRange, msg("ADTS header needs 7 bytes, have {}", data.len()));
        }
        if data[0] != 0xff || data[1] & 0xf0 != 0xf0 {
            bail!(
                DataLoss,
                msg("bad ADTS sync word {:02x} {:02x}", data[0], data[1])
            );
        }
        Ok(AdtsHeader {
            id: data[1] >> 3 & 0x01,
            layer: data[1] >> 1 & 0x03,
            protection_absent: data[1] & 0x01,
            profile: data[2] >> 6 & 0x03,
            sampling_frequency_index: data[2] >> 2 & 0x0f,
            private_bit: data[2] >> 1 & 0x01,
            channel_configuration: (data[2] & 0x01) << 2 | data[3] >> 6,
            original_copy: data[3] >> 5 & 0x01,
            home: data[3] >> 4 & 0x01,
            copyright_identification_bit: data[3] >> 3 & 0x01,
            copyright_identification_start: data[3] >> 2 & 0x01,
            frame_length: u16::from(data[3] & 0x03) << 11
                | u16::from(data[4]) << 3
                | u16::from(data[5] >> 5),
            buffer_fullness: u16::from(data[5] & 0x1f) << 6 | u16::from(data[6] >> 2),
            number_of_raw_data_blocks_in_frame: data[6] & 0x03,
        })
    }

    /// Size this header occupies on the wire.
    pub fn header_len(&self) -> usize {
        if self.protection_absent == 1 {
            7
        } else {
            9
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut hdr = vec![0u8; self.header_len()];
        hdr[0] = 0xff;
        hdr[1] = 0xf0 | self.id << 3 | self.layer << 1 | self.protection_absent;
        hdr[2] = self.profile << 6
            | self.sampling_frequency_index << 2
            | self.private_bit << 1
            | self.channel_configuration >> 2;
        hdr[3] = self.channel_configuration << 6
            | self.original_copy << 5
            | self.home << 4
            | self.copyright_identification_start << 3
            | self.copyright_identification_bit << 2
            | (self.frame_length >> 11) as u8;
        hdr[4] = (self.frame_length >> 3) as u8;
        hdr[5] = ((self.frame_length & 0x07) << 5) as u8 | (self.buffer_fullness >> 6) as u8;
        hdr[6] = ((self.buffer_fullness & 0x3f) << 2) as u8 | self.number_of_raw_data_blocks_in_frame;
        // When protection is present the two CRC bytes are left zero; we never
        // generate them ourselves.
        hdr
    }
}

/// The 2-byte MPEG-4 `AudioSpecificConfig`: 5-bit audio object type, 4-bit
/// sampling-frequency index, 4-bit channel configuration, and the three
/// GASpecificConfig flags.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AudioSpecificConfig {
    pub audio_object_type: u8,
    pub sampling_frequency_index: u8,
    pub channel_configuration: u8,
    pub frame_length_flag: u8,
    pub depends_on_core_coder: u8,
    pub extension_flag: u8,
}

impl AudioSpecificConfig {
    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 2 {
            bail!(OutOfRange, msg("AudioSpecificConfig needs 2 bytes"));
        }
        Ok(AudioSpecificConfig {
            audio_object_type: data[0] >> 3,
            sampling_frequency_index: (data[0] & 0x07) << 1 | data[1] >> 7,
            channel_configuration: data[1] >> 3 & 0x0f,
            frame_length_flag: data[1] >> 2 & 0x01,
            depends_on_core_coder: data[1] >> 1 & 0x01,
            extension_flag: data[1] & 0x01,
        })
    }

    pub fn encode(&self) -> [u8; 2] {
        [
            (self.audio_object_type & 0x1f) << 3 | (self.sampling_frequency_index & 0x0f) >> 1,
            (self.sampling_frequency_index & 0x01) << 7
                | (self.channel_configuration & 0x0f) << 3
                | (self.frame_length_flag & 0x01) << 2
                | (self.depends_on_core_coder & 0x01) << 1
                | self.extension_flag & 0x01,
        ]
    }

    pub fn sample_rate(&self) -> Option<u32> {
        SAMPLE_RATES.get(self.sampling_frequency_index as usize).copied()
    }
}

/// Derives an `AudioSpecificConfig` from an ADTS frame. The ADTS `profile`
/// is the audio object type minus one (ISO/IEC 14496-3 section 1.6.2.1).
pub fn adts_to_asc(frame: &[u8]) -> Result<AudioSpecificConfig, Error> {
    let adts = AdtsHeader::decode(frame)?;
    Ok(AudioSpecificConfig {
        audio_object_type: adts.profile + 1,
        sampling_frequency_index: adts.sampling_frequency_index,
        channel_configuration: adts.channel_configuration,
        ..Default::default()
    })
}

/// Builds an ADTS header for a frame whose total length (header included) is
/// `frame_length`.
pub fn asc_to_adts(asc: &AudioSpecificConfig, frame_length: usize) -> Result<AdtsHeader, Error> {
    if asc.audio_object_type == 0 {
        bail!(InvalidArgument, msg("audio object type 0 has no ADTS profile"));
    }
    if frame_length > 0x1fff {
        bail!(InvalidArgument, msg("ADTS frame length {} overflows 13 bits", frame_length));
    }
    Ok(AdtsHeader {
        profile: asc.audio_object_type - 1,
        sampling_frequency_index: asc.sampling_frequency_index,
        channel_configuration: asc.channel_configuration,
        protection_absent: 1,
        buffer_fullness: 0x3f,
        frame_length: frame_length as u16,
        ..Default::default()
    })
}

/// Calls `f` with each complete `(header, whole frame)` pair in a buffer of
/// concatenated ADTS frames, resynchronizing on garbage. Returns the number
/// of bytes consumed; a trailing partial frame is left for the caller.
pub fn split_frames<F>(data: &[u8], mut f: F) -> Result<usize, Error>
where
    F: FnMut(&AdtsHeader, &[u8]),
{
    let mut pos = 0;
    while data.len() - pos >= 7 {
        let hdr = match AdtsHeader::decode(&data[pos..]) {
            Ok(h) => h,
            Err(_) => {
                pos += 1; // resync
                continue;
            }
        };
        let frame_len = hdr.frame_length as usize;
        if frame_len < hdr.header_len() {
            bail!(DataLoss, msg("ADTS frame_length {} shorter than header", frame_len));
        }
        if data.len() - pos < frame_len {
            break;
        }
        f(&hdr, &data[pos..pos + frame_len]);
        pos += frame_len;
    }
    Ok(pos)
}
