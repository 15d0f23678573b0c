// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RIFF containers: WAVE audio and AVI video.

use crate::boxes::FourCC;
use crate::element::{read_payload, Dialect};
use crate::properties::{kbps, ticks_to_duration, Codec, CodecFact, Properties};
use crate::source::{le_i32, le_u16, le_u32, skip_slice};
use crate::walker::{walk, walk_clamped, Action};
use crate::{Error, Result, Session, TryVec};
use log::debug;
use std::io::{Read, Seek};
use std::time::Duration;

const RIFF: FourCC = FourCC::new(b"RIFF");
const WAVE: FourCC = FourCC::new(b"WAVE");
const AVI: FourCC = FourCC::new(b"AVI ");

const LIST: FourCC = FourCC::new(b"LIST");
const FMT: FourCC = FourCC::new(b"fmt ");
const FACT: FourCC = FourCC::new(b"fact");
const DATA: FourCC = FourCC::new(b"data");

const HDRL: FourCC = FourCC::new(b"hdrl");
const STRL: FourCC = FourCC::new(b"strl");
const ODML: FourCC = FourCC::new(b"odml");
const MOVI: FourCC = FourCC::new(b"movi");
const AVIH: FourCC = FourCC::new(b"avih");
const STRH: FourCC = FourCC::new(b"strh");
const STRF: FourCC = FourCC::new(b"strf");
const DMLH: FourCC = FourCC::new(b"dmlh");

const VIDS: FourCC = FourCC::new(b"vids");
const AUDS: FourCC = FourCC::new(b"auds");

/// Format chunks are small; anything past this is not read.
const MAX_CHUNK_READ: u64 = 64 * 1024;

const WAVE_FORMAT_EXTENSIBLE: u16 = 0xFFFE;

/// WAVEFORMATEX, shared by WAVE `fmt ` chunks, AVI audio `strf` chunks and
/// ASF audio stream properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WaveFormat {
    pub format_tag: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub avg_bytes_per_sec: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
}

impl WaveFormat {
    pub(crate) fn parse(mut data: &[u8]) -> Result<Self> {
        let mut format_tag = le_u16(&mut data)?;
        let channels = le_u16(&mut data)?;
        let sample_rate = le_u32(&mut data)?;
        let avg_bytes_per_sec = le_u32(&mut data)?;
        let block_align = le_u16(&mut data)?;
        // The original WAVEFORMAT ends here; bits per sample came later.
        let bits_per_sample = le_u16(&mut data).unwrap_or(0);

        if format_tag == WAVE_FORMAT_EXTENSIBLE {
            let extra = le_u16(&mut data)?;
            if extra >= 22 {
                let _valid_bits = le_u16(&mut data)?;
                let _channel_mask = le_u32(&mut data)?;
                // The sub-format GUID starts with the real format tag.
                format_tag = le_u16(&mut data)?;
            }
        }

        Ok(Self {
            format_tag,
            channels,
            sample_rate,
            avg_bytes_per_sec,
            block_align,
            bits_per_sample,
        })
    }

    fn bytes_per_second(&self) -> u64 {
        match self.avg_bytes_per_sec {
            0 => u64::from(self.sample_rate) * u64::from(self.block_align),
            n => n.into(),
        }
    }

    pub(crate) fn fact(&self) -> CodecFact {
        CodecFact::audio(Codec::from_wave_format_tag(self.format_tag))
            .with_sample_rate(self.sample_rate)
            .with_channels(u8::try_from(self.channels).unwrap_or(u8::MAX))
            .with_bits_per_sample(u8::try_from(self.bits_per_sample).unwrap_or(0))
            .with_bitrate(kbps(self.bytes_per_second() * 8))
    }
}

/// The fields of BITMAPINFOHEADER that describe the picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BitmapInfo {
    pub width: i32,
    /// Negative for top-down bitmaps
    pub height: i32,
    pub compression: [u8; 4],
}

impl BitmapInfo {
    pub(crate) fn parse(mut data: &[u8]) -> Result<Self> {
        let _size = le_u32(&mut data)?;
        let width = le_i32(&mut data)?;
        let height = le_i32(&mut data)?;
        let _planes = le_u16(&mut data)?;
        let _bit_count = le_u16(&mut data)?;
        let mut compression = [0u8; 4];
        compression.copy_from_slice(data.get(..4).ok_or(Error::UnexpectedEOF)?);
        Ok(Self { width, height, compression })
    }

    pub(crate) fn fact(&self) -> CodecFact {
        CodecFact::video(Codec::from_video_fourcc(self.compression))
            .with_dimensions(self.width.unsigned_abs(), self.height.unsigned_abs())
    }
}

pub(crate) fn read<R: Read + Seek>(session: &mut Session<'_, R>) -> Result<Properties> {
    session.src.seek(0)?;
    let id = FourCC::from(session.src.read_array::<4>()?);
    let declared = le_u32(&mut session.src)?;
    let form = FourCC::from(session.src.read_array::<4>()?);
    if id != RIFF {
        return Err(Error::Unsupported("RIFF signature missing"));
    }

    let declared_end = u64::from(declared) + 8;
    if declared_end > session.src.len() {
        session.ledger.record(session.src.len(), "RIFF chunk extends past the end of the file");
    }
    let body = 12..declared_end.min(session.src.len());

    match &form.value {
        b"WAVE" => read_wave(session, body),
        b"AVI " => read_avi(session, body),
        _ => {
            debug!("RIFF form {form} is neither {WAVE} nor {AVI}");
            Err(Error::Unsupported("unknown RIFF form type"))
        },
    }
}

/// `fmt ` chunk and `fact` frame count of a WAVE file.
#[derive(Default)]
struct WaveState {
    format: Option<WaveFormat>,
    frames: Option<u32>,
    data_size: Option<u64>,
}

fn read_wave<R: Read + Seek>(session: &mut Session<'_, R>, body: std::ops::Range<u64>) -> Result<Properties> {
    let mut state = WaveState::default();
    // A cut-short data chunk still gives a duration for what is there
    walk_clamped(session, Dialect::Riff, None, body, |session, visit| {
        match visit.header.fourcc() {
            Some(FMT) => {
                let data = read_payload(&mut session.src, &visit.header, MAX_CHUNK_READ)?;
                state.format = Some(WaveFormat::parse(&data)?);
            },
            Some(FACT) => {
                let data = read_payload(&mut session.src, &visit.header, 4)?;
                state.frames = Some(le_u32(&mut &data[..])?);
            },
            Some(DATA) => state.data_size = Some(visit.header.data_size),
            _ => {},
        }
        Ok(Action::Skip)
    })?;

    let Some(format) = state.format else {
        session.ledger.record(0, "WAVE file without a fmt chunk");
        return Properties::aggregate(None, &[]);
    };
    let fact = format.fact();
    let duration = match (state.frames, state.data_size) {
        (Some(frames), _) if frames != 0 && format.sample_rate != 0 => {
            ticks_to_duration(frames.into(), format.sample_rate.into())
        },
        (_, Some(bytes)) => ticks_to_duration(bytes, format.bytes_per_second()),
        _ => None,
    };
    Properties::aggregate(duration, &[fact])
}

#[derive(Debug)]
struct AviStream {
    kind: FourCC,
    handler: [u8; 4],
    scale: u32,
    rate: u32,
    length: u32,
    fact: Option<CodecFact>,
}

#[derive(Default)]
struct AviState {
    micros_per_frame: u32,
    total_frames: u32,
    odml_total_frames: u32,
    width: u32,
    height: u32,
    streams: TryVec<AviStream>,
}

fn list_type<R: Read + Seek>(session: &mut Session<'_, R>, data_offset: u64) -> Result<FourCC> {
    session.src.seek(data_offset)?;
    Ok(FourCC::from(session.src.read_array::<4>()?))
}

fn read_avi<R: Read + Seek>(session: &mut Session<'_, R>, body: std::ops::Range<u64>) -> Result<Properties> {
    let mut state = AviState::default();
    walk(session, Dialect::Riff, None, body, |session, visit| {
        let header = &visit.header;
        Ok(match header.fourcc() {
            Some(LIST) => match list_type(session, header.data_offset)? {
                HDRL | ODML => visit.children_after(4),
                STRL => {
                    state.streams.push(AviStream {
                        kind: FourCC::default(),
                        handler: [0; 4],
                        scale: 0,
                        rate: 0,
                        length: 0,
                        fact: None,
                    })?;
                    visit.children_after(4)
                },
                MOVI => Action::Stop,
                _ => Action::Skip,
            },
            Some(AVIH) => {
                let data = read_payload(&mut session.src, header, 40)?;
                let mut data = &data[..];
                state.micros_per_frame = le_u32(&mut data)?;
                // max bytes per second, padding granularity, flags
                skip_slice(&mut data, 12)?;
                state.total_frames = le_u32(&mut data)?;
                // initial frames, stream count, suggested buffer size
                skip_slice(&mut data, 12)?;
                state.width = le_u32(&mut data)?;
                state.height = le_u32(&mut data)?;
                Action::Skip
            },
            Some(DMLH) => {
                let data = read_payload(&mut session.src, header, 4)?;
                state.odml_total_frames = le_u32(&mut &data[..])?;
                Action::Skip
            },
            Some(STRH) => {
                let stream = state.streams.last_mut().ok_or(Error::InvalidData("strh outside a stream list"))?;
                let data = read_payload(&mut session.src, header, 48)?;
                let mut data = &data[..];
                stream.kind = FourCC::from(take_four(&mut data)?);
                stream.handler = take_four(&mut data)?;
                // flags, priority, language, initial frames
                skip_slice(&mut data, 12)?;
                stream.scale = le_u32(&mut data)?;
                stream.rate = le_u32(&mut data)?;
                let _start = le_u32(&mut data)?;
                stream.length = le_u32(&mut data)?;
                Action::Skip
            },
            Some(STRF) => {
                let stream = state.streams.last_mut().ok_or(Error::InvalidData("strf outside a stream list"))?;
                let data = read_payload(&mut session.src, header, MAX_CHUNK_READ)?;
                stream.fact = match stream.kind {
                    VIDS => Some(BitmapInfo::parse(&data)?.fact()),
                    AUDS => Some(WaveFormat::parse(&data)?.fact()),
                    other => {
                        debug!("ignoring AVI stream type {other}");
                        None
                    },
                };
                Action::Skip
            },
            _ => Action::Skip,
        })
    })?;

    let mut facts = TryVec::new();
    for stream in state.streams.iter() {
        let Some(fact) = &stream.fact else { continue };
        let mut fact = fact.clone();
        if stream.kind == VIDS {
            if fact.codec == Codec::Unknown {
                fact.codec = Codec::from_video_fourcc(stream.handler);
            }
            if fact.width == 0 || fact.height == 0 {
                fact = fact.with_dimensions(state.width, state.height);
            }
        }
        // scale / rate is the duration of one unit of `length`
        if let Some(duration) = ticks_to_duration(u64::from(stream.length) * u64::from(stream.scale), stream.rate.into()) {
            if !duration.is_zero() {
                fact = fact.with_duration(duration);
            }
        }
        facts.push(fact)?;
    }

    let frames = match state.odml_total_frames {
        0 => state.total_frames,
        n => n,
    };
    let duration = Duration::from_micros(u64::from(frames) * u64::from(state.micros_per_frame));
    Properties::aggregate(Some(duration), &facts)
}

fn take_four(data: &mut &[u8]) -> Result<[u8; 4]> {
    let mut out = [0u8; 4];
    out.copy_from_slice(data.get(..4).ok_or(Error::UnexpectedEOF)?);
    skip_slice(data, 4)?;
    Ok(out)
}

#[test]
fn wave_format_extensible() {
    let mut fmt = std::vec::Vec::new();
    fmt.extend_from_slice(&WAVE_FORMAT_EXTENSIBLE.to_le_bytes());
    fmt.extend_from_slice(&6u16.to_le_bytes());
    fmt.extend_from_slice(&48000u32.to_le_bytes());
    fmt.extend_from_slice(&(48000u32 * 18).to_le_bytes());
    fmt.extend_from_slice(&18u16.to_le_bytes());
    fmt.extend_from_slice(&24u16.to_le_bytes());
    fmt.extend_from_slice(&22u16.to_le_bytes());
    fmt.extend_from_slice(&24u16.to_le_bytes());
    fmt.extend_from_slice(&0x3Fu32.to_le_bytes());
    fmt.extend_from_slice(&[0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00]);
    fmt.extend_from_slice(&[0x80, 0x00, 0x00, 0xAA, 0x00, 0x38, 0x9B, 0x71]);

    let format = WaveFormat::parse(&fmt).unwrap();
    assert_eq!(format.format_tag, 1);
    let fact = format.fact();
    assert_eq!(fact.codec, Codec::Pcm);
    assert_eq!((fact.sample_rate, fact.channels, fact.bits_per_sample), (48000, 6, 24));
    assert_eq!(fact.bitrate, 6912);
}

#[test]
fn bitmap_info_top_down() {
    let mut bih = std::vec::Vec::new();
    bih.extend_from_slice(&40u32.to_le_bytes());
    bih.extend_from_slice(&640i32.to_le_bytes());
    bih.extend_from_slice(&(-480i32).to_le_bytes());
    bih.extend_from_slice(&1u16.to_le_bytes());
    bih.extend_from_slice(&24u16.to_le_bytes());
    bih.extend_from_slice(b"XVID");
    let fact = BitmapInfo::parse(&bih).unwrap().fact();
    assert_eq!(fact.codec, Codec::Mpeg4Visual);
    assert_eq!((fact.width, fact.height), (640, 480));
}
