// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{Result, TryVec};
use bitflags::bitflags;
use std::time::Duration;

bitflags! {
    /// What kind of media a stream carries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MediaKind: u8 {
        const AUDIO = 1;
        const VIDEO = 1 << 1;
    }
}

/// Codecs recognized inside the supported containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Codec {
    Aac,
    Alac,
    Ac3,
    Eac3,
    Dts,
    Mp3,
    Mp2,
    Flac,
    Vorbis,
    Opus,
    Speex,
    /// Integer or float PCM, any endianness
    Pcm,
    WmaV1,
    WmaV2,
    WmaPro,
    WmaLossless,
    WmaVoice,
    Avc,
    Hevc,
    Av1,
    Vp8,
    Vp9,
    /// MPEG-4 Part 2, including DivX and Xvid
    Mpeg4Visual,
    Mpeg2Video,
    Theora,
    Wmv,
    Mjpeg,
    RawVideo,
    Unknown,
}

impl Codec {
    /// Matroska `CodecID` strings.
    pub(crate) fn from_matroska_id(id: &[u8]) -> Self {
        match id {
            b"A_ALAC" => Self::Alac,
            b"A_AC3" => Self::Ac3,
            b"A_EAC3" => Self::Eac3,
            b"A_MPEG/L3" => Self::Mp3,
            b"A_MPEG/L2" => Self::Mp2,
            b"A_FLAC" => Self::Flac,
            b"A_VORBIS" => Self::Vorbis,
            b"A_OPUS" => Self::Opus,
            b"V_MPEG4/ISO/AVC" => Self::Avc,
            b"V_MPEGH/ISO/HEVC" => Self::Hevc,
            b"V_AV1" => Self::Av1,
            b"V_VP8" => Self::Vp8,
            b"V_VP9" => Self::Vp9,
            b"V_MPEG2" => Self::Mpeg2Video,
            b"V_THEORA" => Self::Theora,
            b"V_MJPEG" => Self::Mjpeg,
            b"V_UNCOMPRESSED" => Self::RawVideo,
            _ if id.starts_with(b"A_AAC") => Self::Aac,
            _ if id.starts_with(b"A_DTS") => Self::Dts,
            _ if id.starts_with(b"A_PCM/") => Self::Pcm,
            _ if id.starts_with(b"V_MPEG4/ISO/") => Self::Mpeg4Visual,
            _ => Self::Unknown,
        }
    }

    /// WAVEFORMATEX format tags, shared by RIFF and ASF.
    pub(crate) fn from_wave_format_tag(tag: u16) -> Self {
        match tag {
            0x0001 | 0x0003 => Self::Pcm,
            0x0050 => Self::Mp2,
            0x0055 => Self::Mp3,
            0x00FF | 0x1600 | 0x1610 | 0x706D => Self::Aac,
            0x0160 => Self::WmaV1,
            0x0161 => Self::WmaV2,
            0x0162 => Self::WmaPro,
            0x0163 => Self::WmaLossless,
            0x000A => Self::WmaVoice,
            0x2000 => Self::Ac3,
            0x2001 => Self::Dts,
            0xF1AC => Self::Flac,
            0x6750 | 0x674F | 0x6751 => Self::Vorbis,
            0x704F => Self::Opus,
            0xA109 => Self::Speex,
            _ => Self::Unknown,
        }
    }

    /// BITMAPINFOHEADER compression and AVI stream handler codes.
    pub(crate) fn from_video_fourcc(fourcc: [u8; 4]) -> Self {
        match &fourcc.map(|b| b.to_ascii_uppercase()) {
            b"\0\0\0\0" | b"DIB " | b"RAW " => Self::RawVideo,
            b"H264" | b"X264" | b"AVC1" | b"DAVC" => Self::Avc,
            b"HEVC" | b"H265" | b"HVC1" | b"HEV1" => Self::Hevc,
            b"AV01" => Self::Av1,
            b"VP80" => Self::Vp8,
            b"VP90" => Self::Vp9,
            b"XVID" | b"DIVX" | b"DX50" | b"MP4V" | b"FMP4" | b"M4S2" => Self::Mpeg4Visual,
            b"MPG2" | b"MPEG" | b"MP2V" => Self::Mpeg2Video,
            b"MJPG" | b"AVRN" | b"LJPG" => Self::Mjpeg,
            b"WMV1" | b"WMV2" | b"WMV3" | b"WVC1" | b"WMVA" => Self::Wmv,
            b"THEO" => Self::Theora,
            _ => Self::Unknown,
        }
    }
}

/// Everything one stream says about itself.
///
/// Zero means "not declared" for every numeric field.
#[derive(Debug, Clone, PartialEq)]
pub struct CodecFact {
    pub media_kind: MediaKind,
    pub codec: Codec,
    /// Stream duration, when the stream declares one of its own.
    pub duration: Option<Duration>,
    pub sample_rate: u32,
    pub channels: u8,
    /// Kilobits per second.
    pub bitrate: u32,
    pub bits_per_sample: u8,
    pub width: u32,
    pub height: u32,
}

impl CodecFact {
    pub fn new(media_kind: MediaKind, codec: Codec) -> Self {
        Self {
            media_kind,
            codec,
            duration: None,
            sample_rate: 0,
            channels: 0,
            bitrate: 0,
            bits_per_sample: 0,
            width: 0,
            height: 0,
        }
    }

    pub fn audio(codec: Codec) -> Self {
        Self::new(MediaKind::AUDIO, codec)
    }

    pub fn video(codec: Codec) -> Self {
        Self::new(MediaKind::VIDEO, codec)
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_channels(mut self, channels: u8) -> Self {
        self.channels = channels;
        self
    }

    /// Set the bitrate in kilobits per second
    pub fn with_bitrate(mut self, kbps: u32) -> Self {
        self.bitrate = kbps;
        self
    }

    pub fn with_bits_per_sample(mut self, bits: u8) -> Self {
        self.bits_per_sample = bits;
        self
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }
}

/// Convert a bits-per-second figure to whole kilobits per second.
pub(crate) fn kbps(bits_per_second: u64) -> u32 {
    u32::try_from(bits_per_second / 1000).unwrap_or(u32::MAX)
}

/// Average kilobits per second of `bytes` spread over `duration`.
pub(crate) fn average_kbps(bytes: u64, duration: Duration) -> u32 {
    let millis = duration.as_millis();
    if millis == 0 {
        return 0;
    }
    // bytes * 8 / 1000 per second, with millis in the denominator.
    u32::try_from(u128::from(bytes) * 8 / millis).unwrap_or(u32::MAX)
}

/// Duration of `units` ticks of a `timescale` Hz clock.
pub(crate) fn ticks_to_duration(units: u64, timescale: u64) -> Option<Duration> {
    if timescale == 0 {
        return None;
    }
    let secs = units / timescale;
    let nanos = u128::from(units % timescale) * 1_000_000_000 / u128::from(timescale);
    Some(Duration::new(secs, u32::try_from(nanos).ok()?))
}

/// A float seconds figure as a duration; negative and non-finite values give `None`.
pub(crate) fn seconds_to_duration(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}

fn first_nonzero<T: Copy + Default + PartialEq>(facts: &[CodecFact], kind: MediaKind, field: impl Fn(&CodecFact) -> T) -> T {
    facts
        .iter()
        .filter(|f| f.media_kind.contains(kind))
        .map(field)
        .find(|v| *v != T::default())
        .unwrap_or_default()
}

/// The merged view of one file.
#[derive(Debug)]
pub struct Properties {
    duration: Duration,
    streams: TryVec<CodecFact>,
    codecs: TryVec<Codec>,
    sample_rate: u32,
    channels: u8,
    bits_per_sample: u8,
    bitrate: u32,
    width: u32,
    height: u32,
}

impl Properties {
    /// Merge per-stream facts into one set of properties.
    ///
    /// Each numeric field takes the first non-zero value among facts of the
    /// media kind it describes, in stream order: audio fields and bitrate
    /// from audio streams, frame size from video streams. The container's
    /// own duration wins; without one the longest stream duration is used.
    pub fn aggregate(container_duration: Option<Duration>, facts: &[CodecFact]) -> Result<Self> {
        let mut streams = TryVec::new();
        let mut codecs = TryVec::new();
        for fact in facts {
            streams.push(fact.clone())?;
            if !codecs.contains(&fact.codec) {
                codecs.push(fact.codec)?;
            }
        }

        let duration = container_duration
            .filter(|d| !d.is_zero())
            .or_else(|| facts.iter().filter_map(|f| f.duration).max())
            .unwrap_or_default();

        Ok(Self {
            duration,
            streams,
            codecs,
            sample_rate: first_nonzero(facts, MediaKind::AUDIO, |f| f.sample_rate),
            channels: first_nonzero(facts, MediaKind::AUDIO, |f| f.channels),
            bits_per_sample: first_nonzero(facts, MediaKind::AUDIO, |f| f.bits_per_sample),
            bitrate: first_nonzero(facts, MediaKind::AUDIO, |f| f.bitrate),
            width: first_nonzero(facts, MediaKind::VIDEO, |f| f.width),
            height: first_nonzero(facts, MediaKind::VIDEO, |f| f.height),
        })
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Every stream's own facts, in the order the streams were found. This
    /// is the full per-stream sequence; use it when two streams may share a
    /// codec.
    pub fn streams(&self) -> &[CodecFact] {
        &self.streams
    }

    /// Distinct codecs in stream order.
    ///
    /// Unlike [`Properties::streams`] this is deduplicated: a file with two
    /// AAC tracks lists `Codec::Aac` once.
    pub fn codecs(&self) -> &[Codec] {
        &self.codecs
    }

    /// Audio sample rate in Hz
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn bits_per_sample(&self) -> u8 {
        self.bits_per_sample
    }

    /// Audio bitrate in kilobits per second
    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    /// Video frame width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Video frame height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }
}

#[test]
fn first_nonzero_per_kind() {
    let facts = [
        CodecFact::audio(Codec::Aac).with_channels(2),
        CodecFact::video(Codec::Avc).with_dimensions(1920, 1080).with_bitrate(4000),
        CodecFact::audio(Codec::Opus).with_sample_rate(48000).with_channels(6).with_bitrate(128),
    ];
    let props = Properties::aggregate(None, &facts).unwrap();
    assert_eq!(props.sample_rate(), 48000);
    assert_eq!(props.channels(), 2);
    assert_eq!(props.bitrate(), 128);
    assert_eq!((props.width(), props.height()), (1920, 1080));
    assert_eq!(props.codecs(), [Codec::Aac, Codec::Avc, Codec::Opus]);
    assert_eq!(props.streams(), facts);
}

#[test]
fn shared_codec_listed_once() {
    let facts = [
        CodecFact::audio(Codec::Aac).with_sample_rate(48000).with_channels(2),
        CodecFact::audio(Codec::Aac).with_sample_rate(44100).with_channels(6),
    ];
    let props = Properties::aggregate(None, &facts).unwrap();
    assert_eq!(props.codecs(), [Codec::Aac]);
    assert_eq!(props.streams().len(), 2);
    assert_eq!(props.streams()[1].channels, 6);
}

#[test]
fn duration_precedence() {
    let facts = [
        CodecFact::audio(Codec::Vorbis).with_duration(Duration::from_secs(3)),
        CodecFact::video(Codec::Theora).with_duration(Duration::from_secs(5)),
    ];
    let container = Some(Duration::from_millis(4200));
    assert_eq!(Properties::aggregate(container, &facts).unwrap().duration(), Duration::from_millis(4200));
    assert_eq!(Properties::aggregate(None, &facts).unwrap().duration(), Duration::from_secs(5));
    assert_eq!(Properties::aggregate(Some(Duration::ZERO), &facts).unwrap().duration(), Duration::from_secs(5));
    assert_eq!(Properties::aggregate(None, &[]).unwrap().duration(), Duration::ZERO);
}

#[test]
fn unit_conversions() {
    assert_eq!(ticks_to_duration(44100, 44100), Some(Duration::from_secs(1)));
    assert_eq!(ticks_to_duration(1500, 1000), Some(Duration::from_millis(1500)));
    assert_eq!(ticks_to_duration(1, 0), None);
    assert_eq!(average_kbps(16_000, Duration::from_secs(1)), 128);
    assert_eq!(average_kbps(16_000, Duration::ZERO), 0);
    assert_eq!(kbps(320_999), 320);
    assert_eq!(seconds_to_duration(-1.0), None);
}

#[test]
fn codec_tables() {
    assert_eq!(Codec::from_matroska_id(b"A_AAC/MPEG4/LC"), Codec::Aac);
    assert_eq!(Codec::from_matroska_id(b"V_MPEG4/ISO/AVC"), Codec::Avc);
    assert_eq!(Codec::from_matroska_id(b"V_MPEG4/ISO/ASP"), Codec::Mpeg4Visual);
    assert_eq!(Codec::from_wave_format_tag(0x0161), Codec::WmaV2);
    assert_eq!(Codec::from_video_fourcc(*b"xvid"), Codec::Mpeg4Visual);
}
