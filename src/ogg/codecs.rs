// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Identification headers of the codecs Ogg usually carries.

use super::reassembler::PacketConsumer;
use crate::properties::{kbps, ticks_to_duration, Codec, CodecFact};
use crate::source::{le_i32, le_u16, le_u32, skip_slice};
use crate::{Error, Result};
use bitreader::BitReader;
use byteorder::ReadBytesExt;
use log::debug;
use std::time::Duration;

/// How a stream's granule position counts time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Clock {
    /// Samples at `rate`; the first `pre_skip` are not played.
    Samples { rate: u32, pre_skip: u64 },
    /// Keyframe number shifted left by `shift`, plus frames since it.
    Frames {
        shift: u8,
        rate_num: u32,
        rate_den: u32,
        /// Theora 3.2.1 and later count the first frame as 1.
        one_based: bool,
    },
}

impl Clock {
    pub(crate) fn duration(&self, granule: u64) -> Option<Duration> {
        match *self {
            Self::Samples { rate, pre_skip } => ticks_to_duration(granule.saturating_sub(pre_skip), rate.into()),
            Self::Frames {
                shift,
                rate_num,
                rate_den,
                one_based,
            } => {
                let keyframe = granule.checked_shr(shift.into()).unwrap_or(0);
                let since = granule & 1u64.checked_shl(shift.into()).map_or(u64::MAX, |bit| bit - 1);
                let frames = keyframe.saturating_add(since).saturating_add(u64::from(!one_based));
                ticks_to_duration(frames.checked_mul(rate_den.into())?, rate_num.into())
            },
        }
    }
}

/// What the identification header of a stream says.
#[derive(Debug, Clone)]
pub(crate) struct Recognized {
    pub fact: CodecFact,
    pub clock: Clock,
}

type Recognizer = fn(&[u8]) -> Result<Recognized>;

/// Identification header magic to recognizer.
const RECOGNIZERS: &[(&[u8], Recognizer)] = &[
    (b"\x01vorbis", vorbis),
    (b"OpusHead", opus),
    (b"\x80theora", theora),
    (b"Speex   ", speex),
    (b"\x7fFLAC", flac),
];

/// Recognize the first packet of a stream. Unknown codecs give `None`.
pub(crate) fn recognize(packet: &[u8]) -> Result<Option<Recognized>> {
    for (magic, recognizer) in RECOGNIZERS {
        if packet.starts_with(magic) {
            return recognizer(packet).map(Some);
        }
    }
    Ok(None)
}

fn positive_kbps(bits_per_second: i32) -> u32 {
    u64::try_from(bits_per_second).map_or(0, kbps)
}

/// See the Vorbis I specification § 4.2.2.
fn vorbis(packet: &[u8]) -> Result<Recognized> {
    let mut data = packet.get(7..).ok_or(Error::UnexpectedEOF)?;
    if le_u32(&mut data)? != 0 {
        return Err(Error::Unsupported("unknown Vorbis version"));
    }
    let channels = data.read_u8()?;
    let rate = le_u32(&mut data)?;
    let maximum = le_i32(&mut data)?;
    let nominal = le_i32(&mut data)?;
    if channels == 0 || rate == 0 {
        return Err(Error::InvalidData("Vorbis stream without channels or rate"));
    }
    let bitrate = match positive_kbps(nominal) {
        0 => positive_kbps(maximum),
        nominal => nominal,
    };
    Ok(Recognized {
        fact: CodecFact::audio(Codec::Vorbis)
            .with_sample_rate(rate)
            .with_channels(channels)
            .with_bitrate(bitrate),
        clock: Clock::Samples { rate, pre_skip: 0 },
    })
}

/// See RFC 7845 § 5.1.
fn opus(packet: &[u8]) -> Result<Recognized> {
    const OPUS_CLOCK: u32 = 48_000;
    let mut data = packet.get(8..).ok_or(Error::UnexpectedEOF)?;
    let version = data.read_u8()?;
    if version >> 4 != 0 {
        return Err(Error::Unsupported("unknown Opus major version"));
    }
    let channels = data.read_u8()?;
    let pre_skip = le_u16(&mut data)?;
    let input_rate = le_u32(&mut data)?;
    if channels == 0 {
        return Err(Error::InvalidData("Opus stream without channels"));
    }
    let rate = if input_rate == 0 { OPUS_CLOCK } else { input_rate };
    Ok(Recognized {
        fact: CodecFact::audio(Codec::Opus).with_sample_rate(rate).with_channels(channels),
        clock: Clock::Samples {
            rate: OPUS_CLOCK,
            pre_skip: pre_skip.into(),
        },
    })
}

/// See the Theora specification § 6.2.
fn theora(packet: &[u8]) -> Result<Recognized> {
    let mut bits = BitReader::new(packet.get(7..).ok_or(Error::UnexpectedEOF)?);
    let version = (bits.read_u8(8)?, bits.read_u8(8)?, bits.read_u8(8)?);
    if version.0 != 3 {
        return Err(Error::Unsupported("unknown Theora major version"));
    }
    // Frame size in macroblocks
    bits.skip(32)?;
    let width = bits.read_u32(24)?;
    let height = bits.read_u32(24)?;
    // Picture offset
    bits.skip(16)?;
    let rate_num = bits.read_u32(32)?;
    let rate_den = bits.read_u32(32)?;
    // Pixel aspect ratio and colour space
    bits.skip(56)?;
    let nominal = bits.read_u32(24)?;
    let _quality = bits.read_u8(6)?;
    let shift = bits.read_u8(5)?;
    if rate_num == 0 || rate_den == 0 {
        return Err(Error::InvalidData("Theora stream without a frame rate"));
    }
    Ok(Recognized {
        fact: CodecFact::video(Codec::Theora)
            .with_dimensions(width, height)
            .with_bitrate(kbps(nominal.into())),
        clock: Clock::Frames {
            shift,
            rate_num,
            rate_den,
            one_based: version >= (3, 2, 1),
        },
    })
}

/// Speex header, 80 bytes, fields little-endian.
fn speex(packet: &[u8]) -> Result<Recognized> {
    // Magic and the version string
    let mut data = packet.get(28..).ok_or(Error::UnexpectedEOF)?;
    // Version id and header size
    skip_slice(&mut data, 8)?;
    let rate = le_u32(&mut data)?;
    // Mode and mode bitstream version
    skip_slice(&mut data, 8)?;
    let channels = le_u32(&mut data)?;
    let bitrate = le_i32(&mut data)?;
    if rate == 0 || channels == 0 {
        return Err(Error::InvalidData("Speex stream without channels or rate"));
    }
    Ok(Recognized {
        fact: CodecFact::audio(Codec::Speex)
            .with_sample_rate(rate)
            .with_channels(u8::try_from(channels)?)
            .with_bitrate(positive_kbps(bitrate)),
        clock: Clock::Samples { rate, pre_skip: 0 },
    })
}

/// FLAC mapping header followed by the STREAMINFO metadata block.
fn flac(packet: &[u8]) -> Result<Recognized> {
    // Mapping version and header count
    let rest = packet.get(9..).ok_or(Error::UnexpectedEOF)?;
    if !rest.starts_with(b"fLaC") {
        return Err(Error::InvalidData("FLAC mapping without fLaC signature"));
    }
    let mut bits = BitReader::new(rest.get(8..).ok_or(Error::UnexpectedEOF)?);
    // Block and frame size bounds
    bits.skip(80)?;
    let rate = bits.read_u32(20)?;
    let channels = bits.read_u8(3)? + 1;
    let bits_per_sample = bits.read_u8(5)? + 1;
    let total_samples = bits.read_u64(36)?;
    if rate == 0 {
        return Err(Error::InvalidData("FLAC stream without a sample rate"));
    }
    let mut fact = CodecFact::audio(Codec::Flac)
        .with_sample_rate(rate)
        .with_channels(channels)
        .with_bits_per_sample(bits_per_sample);
    if let Some(duration) = ticks_to_duration(total_samples, rate.into()).filter(|d| !d.is_zero()) {
        fact = fact.with_duration(duration);
    }
    Ok(Recognized {
        fact,
        clock: Clock::Samples { rate, pre_skip: 0 },
    })
}

/// Recognizes a stream from its first packet, then wants no more.
#[derive(Debug, Default)]
pub(crate) struct StreamRecognizer {
    pub recognized: Option<Recognized>,
}

impl PacketConsumer for StreamRecognizer {
    fn consume(&mut self, packet: &[u8]) -> Result<bool> {
        self.recognized = recognize(packet)?;
        match &self.recognized {
            Some(recognized) => debug!("Ogg stream carries {:?}", recognized.fact.codec),
            None => debug!("unrecognized Ogg stream, first bytes {:02x?}", &packet[..packet.len().min(8)]),
        }
        Ok(true)
    }
}

#[cfg(test)]
pub(crate) fn vorbis_header(channels: u8, rate: u32, nominal: i32) -> std::vec::Vec<u8> {
    let mut out = b"\x01vorbis".to_vec();
    out.extend_from_slice(&0u32.to_le_bytes());
    out.push(channels);
    out.extend_from_slice(&rate.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&nominal.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&[0xB8, 0x01]);
    out
}

#[cfg(test)]
pub(crate) fn opus_header(channels: u8, pre_skip: u16, input_rate: u32) -> std::vec::Vec<u8> {
    let mut out = b"OpusHead".to_vec();
    out.push(1);
    out.push(channels);
    out.extend_from_slice(&pre_skip.to_le_bytes());
    out.extend_from_slice(&input_rate.to_le_bytes());
    out.extend_from_slice(&[0, 0, 0]);
    out
}

#[test]
fn vorbis_identification() {
    let recognized = recognize(&vorbis_header(2, 44100, 128_000)).unwrap().unwrap();
    assert_eq!(recognized.fact, CodecFact::audio(Codec::Vorbis).with_sample_rate(44100).with_channels(2).with_bitrate(128));
    assert_eq!(recognized.clock.duration(441_000), Some(Duration::from_secs(10)));
    assert!(recognize(&vorbis_header(0, 44100, 0)).is_err());
}

#[test]
fn opus_pre_skip() {
    let recognized = recognize(&opus_header(2, 312, 44100)).unwrap().unwrap();
    assert_eq!(recognized.fact.sample_rate, 44100);
    assert_eq!(recognized.clock.duration(48_312), Some(Duration::from_secs(1)));
    assert_eq!(recognized.clock.duration(100), Some(Duration::ZERO));
}

#[test]
fn theora_granule() {
    let mut header = b"\x80theora".to_vec();
    header.extend_from_slice(&[3, 2, 1]);
    header.extend_from_slice(&[0, 20, 0, 15]);
    header.extend_from_slice(&[0, 1, 64, 0, 0, 240]);
    header.extend_from_slice(&[0, 0]);
    header.extend_from_slice(&25u32.to_be_bytes());
    header.extend_from_slice(&1u32.to_be_bytes());
    header.extend_from_slice(&[0, 0, 1, 0, 0, 1, 0]);
    header.extend_from_slice(&[0, 0, 0]);
    // Quality 0, keyframe shift 6
    header.extend_from_slice(&[0b0000_0000, 0b1100_0000]);
    let recognized = recognize(&header).unwrap().unwrap();
    assert_eq!((recognized.fact.width, recognized.fact.height), (320, 240));
    // Keyframe 48, two frames after it: 50 frames at 25 fps
    assert_eq!(recognized.clock.duration(48 << 6 | 2), Some(Duration::from_secs(2)));
}

#[test]
fn unknown_streams_are_not_errors() {
    assert!(recognize(b"\x00some other codec").unwrap().is_none());
    assert!(recognize(b"").unwrap().is_none());
    assert!(recognize(b"OpusHead").is_err());
}
