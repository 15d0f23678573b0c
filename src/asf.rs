// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Advanced Systems Format (WMA, WMV).

use crate::element::{read_payload, Dialect};
use crate::properties::{kbps, CodecFact, Properties};
use crate::riff::{BitmapInfo, WaveFormat};
use crate::source::{le_u16, le_u32, le_u64, skip_slice};
use crate::walker::{walk, Action, WalkEnd};
use crate::{Error, Result, Session, ToUsize, TryVec};
use log::debug;
use std::fmt;
use std::io::{Read, Seek};
use std::time::Duration;

/// A GUID as stored on disk: the first three groups little-endian.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Guid([u8; 16]);

impl Guid {
    pub(crate) const fn new(d1: u32, d2: u16, d3: u16, d4: [u8; 8]) -> Self {
        let a = d1.to_le_bytes();
        let b = d2.to_le_bytes();
        let c = d3.to_le_bytes();
        Self([
            a[0], a[1], a[2], a[3], b[0], b[1], c[0], c[1], d4[0], d4[1], d4[2], d4[3], d4[4], d4[5], d4[6], d4[7],
        ])
    }

    pub(crate) const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub(crate) const fn to_bytes(self) -> [u8; 16] {
        self.0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            u16::from_le_bytes([b[4], b[5]]),
            u16::from_le_bytes([b[6], b[7]]),
            b[8],
            b[9],
            b[10],
            b[11],
            b[12],
            b[13],
            b[14],
            b[15]
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

pub(crate) const HEADER_OBJECT: Guid = Guid::new(0x75B2_2630, 0x668E, 0x11CF, [0xA6, 0xD9, 0x00, 0xAA, 0x00, 0x62, 0xCE, 0x6C]);
pub(crate) const DATA_OBJECT: Guid = Guid::new(0x75B2_2636, 0x668E, 0x11CF, [0xA6, 0xD9, 0x00, 0xAA, 0x00, 0x62, 0xCE, 0x6C]);
pub(crate) const FILE_PROPERTIES_OBJECT: Guid = Guid::new(0x8CAB_DCA1, 0xA947, 0x11CF, [0x8E, 0xE4, 0x00, 0xC0, 0x0C, 0x20, 0x53, 0x65]);
pub(crate) const STREAM_PROPERTIES_OBJECT: Guid = Guid::new(0xB7DC_0791, 0xA9B7, 0x11CF, [0x8E, 0xE6, 0x00, 0xC0, 0x0C, 0x20, 0x53, 0x65]);
pub(crate) const HEADER_EXTENSION_OBJECT: Guid = Guid::new(0x5FBF_03B5, 0xA92E, 0x11CF, [0x8E, 0xE3, 0x00, 0xC0, 0x0C, 0x20, 0x53, 0x65]);
pub(crate) const EXTENDED_STREAM_PROPERTIES_OBJECT: Guid = Guid::new(0x14E6_A5CB, 0xC672, 0x4332, [0x83, 0x99, 0xA9, 0x69, 0x52, 0x06, 0x5B, 0x5A]);
pub(crate) const STREAM_BITRATE_PROPERTIES_OBJECT: Guid = Guid::new(0x7BF8_75CE, 0x468D, 0x11D1, [0x8D, 0x82, 0x00, 0x60, 0x97, 0xC9, 0xA2, 0xB2]);
pub(crate) const AUDIO_MEDIA: Guid = Guid::new(0xF869_9E40, 0x5B4D, 0x11CF, [0xA8, 0xFD, 0x00, 0x80, 0x5F, 0x5C, 0x44, 0x2B]);
pub(crate) const VIDEO_MEDIA: Guid = Guid::new(0xBC19_EFC0, 0x5B4D, 0x11CF, [0xA8, 0xFD, 0x00, 0x80, 0x5F, 0x5C, 0x44, 0x2B]);

/// Objects this reader acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectKind {
    Header,
    Data,
    FileProperties,
    StreamProperties,
    HeaderExtension,
    ExtendedStreamProperties,
    StreamBitrateProperties,
    Other,
}

const OBJECT_KINDS: [(Guid, ObjectKind); 7] = [
    (HEADER_OBJECT, ObjectKind::Header),
    (DATA_OBJECT, ObjectKind::Data),
    (FILE_PROPERTIES_OBJECT, ObjectKind::FileProperties),
    (STREAM_PROPERTIES_OBJECT, ObjectKind::StreamProperties),
    (HEADER_EXTENSION_OBJECT, ObjectKind::HeaderExtension),
    (EXTENDED_STREAM_PROPERTIES_OBJECT, ObjectKind::ExtendedStreamProperties),
    (STREAM_BITRATE_PROPERTIES_OBJECT, ObjectKind::StreamBitrateProperties),
];

impl ObjectKind {
    fn of(guid: Guid) -> Self {
        OBJECT_KINDS
            .iter()
            .find(|(g, _)| *g == guid)
            .map_or(Self::Other, |&(_, kind)| kind)
    }
}

/// Header object: object count (u32) and two reserved bytes.
const HEADER_PREFIX: u64 = 6;
/// Header extension object: reserved GUID, reserved u16 and data size.
const HEADER_EXTENSION_PREFIX: u64 = 22;
/// Fixed part of the Stream Properties object.
const STREAM_PROPERTIES_FIXED: usize = 54;
/// Fixed part of the Extended Stream Properties object.
const EXTENDED_STREAM_PROPERTIES_FIXED: usize = 64;
/// Header objects are small; anything past this is not read.
const MAX_OBJECT_READ: u64 = 1 << 20;

/// File Properties: play duration minus preroll, zero for live broadcasts.
#[derive(Debug, Default, Clone, Copy)]
struct FileProperties {
    duration: Option<Duration>,
    max_bitrate: u32,
}

fn parse_file_properties(mut data: &[u8]) -> Result<FileProperties> {
    // file id, file size, creation date, data packets count
    skip_slice(&mut data, 16 + 8 + 8 + 8)?;
    let play_duration = le_u64(&mut data)?;
    let _send_duration = le_u64(&mut data)?;
    let preroll_ms = le_u64(&mut data)?;
    let flags = le_u32(&mut data)?;
    let _min_packet_size = le_u32(&mut data)?;
    let _max_packet_size = le_u32(&mut data)?;
    let max_bitrate = le_u32(&mut data)?;

    let broadcast = flags & 1 != 0;
    let duration = if broadcast {
        None
    } else {
        // play duration is in 100 ns units, preroll in milliseconds
        let play = Duration::from_nanos(play_duration.saturating_mul(100));
        Some(play.saturating_sub(Duration::from_millis(preroll_ms)))
    };
    Ok(FileProperties { duration, max_bitrate })
}

/// Recognize the type-specific data of a Stream Properties object.
///
/// Returns the stream number and, for audio and video streams, a fact.
fn parse_stream_properties(mut data: &[u8]) -> Result<(u16, Option<CodecFact>)> {
    if data.len() < STREAM_PROPERTIES_FIXED {
        return Err(Error::UnexpectedEOF);
    }
    let mut stream_type = [0u8; 16];
    stream_type.copy_from_slice(&data[..16]);
    let stream_type = Guid::from_bytes(stream_type);
    // error correction type, time offset
    skip_slice(&mut data, 16 + 16 + 8)?;
    let type_specific_len = le_u32(&mut data)?.to_usize();
    let _error_correction_len = le_u32(&mut data)?;
    let flags = le_u16(&mut data)?;
    let _reserved = le_u32(&mut data)?;
    let stream_number = flags & 0x7F;
    let type_specific = data.get(..type_specific_len).ok_or(Error::InvalidData("stream type data overruns its object"))?;

    let fact = match stream_type {
        AUDIO_MEDIA => Some(WaveFormat::parse(type_specific)?.fact()),
        VIDEO_MEDIA => {
            let mut video = type_specific;
            let width = le_u32(&mut video)?;
            let height = le_u32(&mut video)?;
            let _reserved_flags = video.first().ok_or(Error::UnexpectedEOF)?;
            skip_slice(&mut video, 1 + 2)?;
            let bitmap = BitmapInfo::parse(video)?;
            let mut fact = bitmap.fact();
            if fact.width == 0 || fact.height == 0 {
                fact = fact.with_dimensions(width, height);
            }
            Some(fact)
        },
        other => {
            debug!("stream {stream_number}: ignoring stream type {other}");
            None
        },
    };
    Ok((stream_number, fact))
}

/// Extended Stream Properties: stream number, data bitrate, and where an
/// embedded Stream Properties object would start.
fn parse_extended_stream_properties(mut data: &[u8]) -> Result<(u16, u32, u64)> {
    let total = data.len();
    // start time, end time
    skip_slice(&mut data, 8 + 8)?;
    let data_bitrate = le_u32(&mut data)?;
    // buffer size and fullness, alternates, max object size, flags
    skip_slice(&mut data, 4 * 7)?;
    let stream_number = le_u16(&mut data)?;
    let _language_index = le_u16(&mut data)?;
    let _avg_time_per_frame = le_u64(&mut data)?;
    let name_count = le_u16(&mut data)?;
    let payload_extension_count = le_u16(&mut data)?;
    debug_assert_eq!(total - data.len(), EXTENDED_STREAM_PROPERTIES_FIXED);

    for _ in 0..name_count {
        let _language_index = le_u16(&mut data)?;
        let len = le_u16(&mut data)?;
        skip_slice(&mut data, len.into())?;
    }
    for _ in 0..payload_extension_count {
        skip_slice(&mut data, 16 + 2)?;
        let len = le_u32(&mut data)?;
        skip_slice(&mut data, len.to_usize())?;
    }
    let consumed = (total - data.len()) as u64;
    Ok((stream_number, data_bitrate, consumed))
}

/// Per-stream average bitrates from the Stream Bitrate Properties object.
fn parse_stream_bitrates(mut data: &[u8], into: &mut TryVec<(u16, u32)>) -> Result<()> {
    let count = le_u16(&mut data)?;
    for _ in 0..count {
        let flags = le_u16(&mut data)?;
        let bitrate = le_u32(&mut data)?;
        into.push((flags & 0x7F, bitrate))?;
    }
    Ok(())
}

#[derive(Default)]
struct AsfState {
    file: FileProperties,
    streams: TryVec<(u16, CodecFact)>,
    bitrates: TryVec<(u16, u32)>,
}

pub(crate) fn read<R: Read + Seek>(session: &mut Session<'_, R>) -> Result<Properties> {
    session.src.seek(0)?;
    let first = Guid::from_bytes(session.src.read_array()?);
    if first != HEADER_OBJECT {
        return Err(Error::Unsupported("ASF header object missing"));
    }

    let mut state = AsfState::default();
    let end = session.src.len();
    let walked = walk(session, Dialect::Asf, None, 0..end, |session, visit| {
        let guid = visit.header.guid().ok_or(Error::InvalidData("not an ASF object"))?;
        let kind = ObjectKind::of(guid);
        Ok(match kind {
            ObjectKind::Header if visit.depth == 0 => visit.children_after(HEADER_PREFIX),
            ObjectKind::Data => Action::Stop,
            ObjectKind::FileProperties => {
                let data = read_payload(&mut session.src, &visit.header, MAX_OBJECT_READ)?;
                state.file = parse_file_properties(&data)?;
                Action::Skip
            },
            ObjectKind::StreamProperties => {
                let data = read_payload(&mut session.src, &visit.header, MAX_OBJECT_READ)?;
                let (number, fact) = parse_stream_properties(&data)?;
                if let Some(fact) = fact {
                    debug!("stream {number}: {:?}", fact.codec);
                    if !state.streams.iter().any(|(n, _)| *n == number) {
                        state.streams.push((number, fact))?;
                    }
                }
                Action::Skip
            },
            ObjectKind::HeaderExtension => visit.children_after(HEADER_EXTENSION_PREFIX),
            ObjectKind::ExtendedStreamProperties => {
                let data = read_payload(&mut session.src, &visit.header, MAX_OBJECT_READ)?;
                let (number, bitrate, consumed) = parse_extended_stream_properties(&data)?;
                state.bitrates.push((number, bitrate))?;
                // An embedded Stream Properties object may follow.
                visit.children_after(consumed)
            },
            ObjectKind::StreamBitrateProperties => {
                let data = read_payload(&mut session.src, &visit.header, MAX_OBJECT_READ)?;
                parse_stream_bitrates(&data, &mut state.bitrates)?;
                Action::Skip
            },
            ObjectKind::Header | ObjectKind::Other => Action::Skip,
        })
    })?;
    if walked == WalkEnd::Truncated {
        debug!("ASF header walk was cut short");
    }

    let mut facts = TryVec::new();
    for (number, fact) in state.streams.iter() {
        let mut fact = fact.clone();
        if fact.bitrate == 0 {
            if let Some(&(_, bps)) = state.bitrates.iter().find(|(n, bps)| n == number && *bps != 0) {
                fact.bitrate = kbps(bps.into());
            }
        }
        facts.push(fact)?;
    }
    if let [only] = &mut facts[..] {
        if only.bitrate == 0 && state.file.max_bitrate != 0 {
            only.bitrate = kbps(state.file.max_bitrate.into());
        }
    }
    Properties::aggregate(state.file.duration, &facts)
}
