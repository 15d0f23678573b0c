// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Matroska and WebM. See RFC 8794 (EBML) and RFC 9559 (Matroska).

mod ids;
mod seek_head;

use self::ids::{ElementId, DEFAULT_TIMESTAMP_SCALE, TRACK_TYPE_AUDIO, TRACK_TYPE_VIDEO};
use crate::element::{read_payload, Dialect, Element, ElementArena, ElementIndex, Header, TypeId};
use crate::properties::{seconds_to_duration, Codec, CodecFact, Properties};
use crate::walker::{walk, Action, Visit, WalkEnd};
use crate::{Error, ReadStyle, Result, Session, TryVec};
use byteorder::{BigEndian, ByteOrder};
use log::debug;
use std::io::{Read, Seek};

pub(crate) const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

/// Longest string element we bother to read.
const MAX_STRING_READ: u64 = 256;

fn element_id(header: &Header) -> ElementId {
    header.ebml_id().map_or(ElementId::Unknown(0), ElementId::from)
}

/// Parent type of a walk over the children of `id`.
fn within(id: ElementId) -> Option<TypeId> {
    Some(TypeId::Ebml(id.into()))
}

fn parent_id(visit: &Visit) -> Option<ElementId> {
    match visit.parent_type {
        Some(TypeId::Ebml(id)) => Some(id.into()),
        _ => None,
    }
}

/// Big-endian unsigned integer of 0 to 8 bytes.
fn read_uint<R: Read + Seek>(session: &mut Session<'_, R>, header: &Header) -> Result<u64> {
    if header.data_size > 8 {
        return Err(Error::InvalidData("unsigned integer wider than 8 bytes"));
    }
    let data = read_payload(&mut session.src, header, 8)?;
    Ok(data.iter().fold(0, |acc, &b| acc << 8 | u64::from(b)))
}

/// IEEE float of 0, 4 or 8 bytes. An empty float is 0.
fn read_float<R: Read + Seek>(session: &mut Session<'_, R>, header: &Header) -> Result<f64> {
    let data = read_payload(&mut session.src, header, 8)?;
    match (header.data_size, data.len()) {
        (0, _) => Ok(0.),
        (4, 4) => Ok(f64::from(BigEndian::read_f32(&data))),
        (8, 8) => Ok(BigEndian::read_f64(&data)),
        _ => Err(Error::InvalidData("float must be 4 or 8 bytes")),
    }
}

/// Strings may be padded with trailing zero bytes.
fn trim_nul(data: &[u8]) -> &[u8] {
    let len = data.iter().rposition(|&b| b != 0).map_or(0, |last| last + 1);
    &data[..len]
}

#[derive(Debug)]
struct Track {
    track_type: u64,
    codec: Codec,
    sampling_frequency: f64,
    output_sampling_frequency: f64,
    channels: u64,
    bit_depth: u64,
    width: u64,
    height: u64,
}

impl Default for Track {
    fn default() -> Self {
        Self {
            track_type: 0,
            codec: Codec::Unknown,
            sampling_frequency: 0.,
            output_sampling_frequency: 0.,
            // Matroska's default for an absent Channels element
            channels: 1,
            bit_depth: 0,
            width: 0,
            height: 0,
        }
    }
}

impl Track {
    fn fact(&self) -> Option<CodecFact> {
        match self.track_type {
            TRACK_TYPE_AUDIO => {
                // SBR streams store the output rate separately
                let rate = if self.output_sampling_frequency > 0. {
                    self.output_sampling_frequency
                } else {
                    self.sampling_frequency
                };
                Some(
                    CodecFact::audio(self.codec)
                        .with_sample_rate(rate as u32)
                        .with_channels(u8::try_from(self.channels).unwrap_or(u8::MAX))
                        .with_bits_per_sample(u8::try_from(self.bit_depth).unwrap_or(0)),
                )
            },
            TRACK_TYPE_VIDEO => Some(CodecFact::video(self.codec).with_dimensions(
                u32::try_from(self.width).unwrap_or(0),
                u32::try_from(self.height).unwrap_or(0),
            )),
            other => {
                debug!("ignoring track of type {other}");
                None
            },
        }
    }
}

/// What has been learned from the `Info` and `Tracks` elements of a segment.
#[derive(Debug, Default)]
struct SegmentState {
    timestamp_scale: Option<u64>,
    /// In timestamp ticks
    duration: Option<f64>,
    tracks: TryVec<Track>,
    saw_info: bool,
    saw_tracks: bool,
}

impl SegmentState {
    fn complete(&self) -> bool {
        self.saw_info && self.saw_tracks
    }

    fn track(&mut self) -> Result<&mut Track> {
        self.tracks.last_mut().ok_or(Error::InvalidData("track field outside a TrackEntry"))
    }

    fn visit<R: Read + Seek>(&mut self, session: &mut Session<'_, R>, visit: &Visit) -> Result<Action> {
        use self::ElementId::*;

        let header = &visit.header;
        Ok(match (element_id(header), parent_id(visit)) {
            (Info, _) => {
                self.saw_info = true;
                visit.children()
            },
            (Tracks, _) => {
                self.saw_tracks = true;
                visit.children()
            },
            (Cluster, _) if session.read_style() == ReadStyle::Accurate && !self.complete() => {
                debug!("Cluster before Info or Tracks @ {}, continuing", header.header_offset);
                Action::Skip
            },
            (Cluster, _) => Action::Stop,
            (TimestampScale, Some(Info)) => {
                self.timestamp_scale = Some(read_uint(session, header)?);
                Action::Skip
            },
            (Duration, Some(Info)) => {
                self.duration = Some(read_float(session, header)?);
                Action::Skip
            },
            (TrackEntry, Some(Tracks)) => {
                self.tracks.push(Track::default())?;
                visit.children()
            },
            (Video | Audio, Some(TrackEntry)) => visit.children(),
            (TrackType, Some(TrackEntry)) => {
                self.track()?.track_type = read_uint(session, header)?;
                Action::Skip
            },
            (CodecId, Some(TrackEntry)) => {
                let id = read_payload(&mut session.src, header, MAX_STRING_READ)?;
                self.track()?.codec = Codec::from_matroska_id(trim_nul(&id));
                Action::Skip
            },
            (PixelWidth, Some(Video)) => {
                self.track()?.width = read_uint(session, header)?;
                Action::Skip
            },
            (PixelHeight, Some(Video)) => {
                self.track()?.height = read_uint(session, header)?;
                Action::Skip
            },
            (SamplingFrequency, Some(Audio)) => {
                self.track()?.sampling_frequency = read_float(session, header)?;
                Action::Skip
            },
            (OutputSamplingFrequency, Some(Audio)) => {
                self.track()?.output_sampling_frequency = read_float(session, header)?;
                Action::Skip
            },
            (Channels, Some(Audio)) => {
                self.track()?.channels = read_uint(session, header)?;
                Action::Skip
            },
            (BitDepth, Some(Audio)) => {
                self.track()?.bit_depth = read_uint(session, header)?;
                Action::Skip
            },
            _ => Action::Skip,
        })
    }

    fn properties(&self) -> Result<Properties> {
        let scale = self.timestamp_scale.filter(|&scale| scale != 0).unwrap_or(DEFAULT_TIMESTAMP_SCALE);
        let duration = self
            .duration
            .and_then(|ticks| seconds_to_duration(ticks * scale as f64 / 1_000_000_000.));
        let mut facts = TryVec::new();
        for track in self.tracks.iter() {
            if let Some(fact) = track.fact() {
                facts.push(fact)?;
            }
        }
        Properties::aggregate(duration, &facts)
    }
}

pub(crate) fn read<R: Read + Seek>(session: &mut Session<'_, R>) -> Result<Properties> {
    let mut arena = ElementArena::default();
    let len = session.src.len();
    let ebml = Dialect::Ebml.read_header(&mut session.src, 0, len)?;
    if element_id(&ebml) != ElementId::Ebml {
        return Err(Error::Unsupported("missing EBML header"));
    }

    let mut doc_type = None;
    walk(session, Dialect::Ebml, within(ElementId::Ebml), ebml.data_range(), |session, visit| {
        if element_id(&visit.header) == ElementId::DocType {
            doc_type = Some(read_payload(&mut session.src, &visit.header, MAX_STRING_READ)?);
        }
        Ok(Action::Skip)
    })?;
    // An absent DocType means "matroska"
    match doc_type.as_deref().map(trim_nul) {
        None | Some(b"matroska") | Some(b"webm") => {},
        Some(other) => {
            debug!("DocType {:?}", std::string::String::from_utf8_lossy(other));
            return Err(Error::Unsupported("DocType is neither matroska nor webm"));
        },
    }

    let Some(segment) = find_segment(session, &mut arena, ebml.end_offset)? else {
        session.ledger.record(ebml.end_offset, "no Segment after the EBML header");
        return Properties::aggregate(None, &[]);
    };
    let state = read_segment(session, &mut arena, segment)?;
    if !state.complete() {
        debug!("segment without Info or Tracks: {state:?}");
    }
    state.properties()
}

/// Find the first top-level Segment. A Segment whose size reaches past the
/// end of the file is cut down to what is there.
fn find_segment<R: Read + Seek>(
    session: &mut Session<'_, R>,
    arena: &mut ElementArena,
    start: u64,
) -> Result<Option<ElementIndex>> {
    let len = session.src.len();
    let mut offset = start;
    while offset < len {
        session.check_stop()?;
        session.count_element()?;
        let (header, clamped) = Dialect::Ebml.read_header_clamped(&mut session.src, offset, len)?;
        if element_id(&header) == ElementId::Segment {
            if clamped {
                session.ledger.record(offset, "Segment extends past the end of the file");
            }
            return Ok(Some(arena.push_materialized(None, header)?));
        }
        offset = header.end_offset;
    }
    Ok(None)
}

/// The SeekHead, if it is the first element of the segment that is neither
/// `Void` nor `CRC-32`.
fn first_seek_head<R: Read + Seek>(
    session: &mut Session<'_, R>,
    arena: &mut ElementArena,
    segment: ElementIndex,
    segment_header: &Header,
) -> Result<Option<ElementIndex>> {
    let mut offset = segment_header.data_offset;
    while offset < segment_header.data_end() {
        let child = match Dialect::Ebml.read_header(&mut session.src, offset, segment_header.data_end()) {
            Ok(child) => child,
            // The linear scan will report it
            Err(err) if err.is_recoverable() => return Ok(None),
            Err(err) => return Err(err),
        };
        match element_id(&child) {
            ElementId::Void | ElementId::Crc32 => offset = child.end_offset,
            ElementId::SeekHead => return Ok(Some(arena.push_materialized(Some(segment), child)?)),
            _ => return Ok(None),
        }
    }
    Ok(None)
}

fn read_segment<R: Read + Seek>(
    session: &mut Session<'_, R>,
    arena: &mut ElementArena,
    segment: ElementIndex,
) -> Result<SegmentState> {
    let header = *arena
        .get(segment)
        .and_then(Element::header)
        .ok_or(Error::Inconsistent("segment is not materialized"))?;

    if let Some(seek_head) = first_seek_head(session, arena, segment, &header)? {
        match read_indexed(session, arena, segment, &header, seek_head) {
            Ok(state) if state.complete() => return Ok(state),
            Ok(_) => debug!("SeekHead does not list both Info and Tracks, scanning the segment"),
            Err(err) if err.is_recoverable() => {
                let offset = arena.get(seek_head).map_or(header.data_offset, |e| e.offset);
                session.ledger.record(offset, format_args!("SeekHead index dropped: {err}"));
            },
            Err(err) => return Err(err),
        }
    }
    scan_segment(session, &header)
}

/// Read `Info` and `Tracks` through the SeekHead.
fn read_indexed<R: Read + Seek>(
    session: &mut Session<'_, R>,
    arena: &mut ElementArena,
    segment: ElementIndex,
    segment_header: &Header,
    seek_head: ElementIndex,
) -> Result<SegmentState> {
    let entries = seek_head::resolve(session, arena, segment, segment_header, seek_head)?;
    let mut state = SegmentState::default();
    let mut last_read = None;
    for &index in entries.iter() {
        let Some(header) = arena.get(index).and_then(Element::header).copied() else {
            continue;
        };
        if !matches!(element_id(&header), ElementId::Info | ElementId::Tracks) {
            continue;
        }
        // Entries are sorted, so a verified repeat follows its first listing
        if last_read.replace(header.header_offset) == Some(header.header_offset) {
            continue;
        }
        let range = header.header_offset..header.end_offset;
        let end = walk(session, Dialect::Ebml, within(ElementId::Segment), range, |session, visit| {
            state.visit(session, visit)
        })?;
        if end == WalkEnd::Truncated {
            return Err(Error::Inconsistent("indexed element is damaged"));
        }
    }
    Ok(state)
}

/// Walk the top level of the segment from its start. Runs at most once per
/// segment.
fn scan_segment<R: Read + Seek>(session: &mut Session<'_, R>, segment_header: &Header) -> Result<SegmentState> {
    let mut state = SegmentState::default();
    let end = walk(session, Dialect::Ebml, within(ElementId::Segment), segment_header.data_range(), |session, visit| {
        state.visit(session, visit)
    })?;
    debug!("linear scan of the segment ended with {end:?}");
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sizes::{encode_ebml_id, encode_ebml_size};
    use crate::{ParseConfig, Unstoppable};
    use std::time::Duration as StdDuration;

    fn el(id: u32, payload: &[u8]) -> std::vec::Vec<u8> {
        let mut out = encode_ebml_id(id).unwrap().to_vec();
        out.extend_from_slice(&encode_ebml_size(payload.len() as u64).unwrap());
        out.extend_from_slice(payload);
        out
    }

    fn concat(parts: &[std::vec::Vec<u8>]) -> std::vec::Vec<u8> {
        parts.concat()
    }

    fn ebml_header(doc_type: &[u8]) -> std::vec::Vec<u8> {
        el(0x1A45_DFA3, &el(0x4282, doc_type))
    }

    fn info(duration_ms: f64) -> std::vec::Vec<u8> {
        el(0x1549_A966, &concat(&[
            el(0x2A_D7B1, &[0x0F, 0x42, 0x40]),
            el(0x4489, &duration_ms.to_be_bytes()),
        ]))
    }

    fn tracks() -> std::vec::Vec<u8> {
        let audio = el(0xE1, &concat(&[
            el(0xB5, &24000f32.to_be_bytes()),
            el(0x78B5, &48000f32.to_be_bytes()),
            el(0x9F, &[2]),
        ]));
        let video = el(0xE0, &concat(&[el(0xB0, &[0x07, 0x80]), el(0xBA, &[0x04, 0x38])]));
        el(0x1654_AE6B, &concat(&[
            el(0xAE, &concat(&[el(0x83, &[1]), el(0x86, b"V_VP9"), video])),
            el(0xAE, &concat(&[el(0x83, &[2]), el(0x86, b"A_AAC/MPEG4/LC/SBR\0"), audio])),
        ]))
    }

    fn seek(id: u32, position: u64) -> std::vec::Vec<u8> {
        el(0x4DBB, &concat(&[
            el(0x53AB, &encode_ebml_id(id).unwrap()),
            el(0x53AC, &position.to_be_bytes()),
        ]))
    }

    fn read_bytes(bytes: std::vec::Vec<u8>, config: &ParseConfig) -> (Properties, usize) {
        let mut cursor = std::io::Cursor::new(bytes);
        let mut session = Session::new(&mut cursor, config, &Unstoppable).unwrap();
        let properties = read(&mut session).unwrap();
        (properties, session.ledger.len())
    }

    fn check_tracks(properties: &Properties) {
        assert_eq!(properties.duration(), StdDuration::from_millis(2500));
        assert_eq!(properties.codecs(), &[Codec::Vp9, Codec::Aac]);
        assert_eq!(properties.sample_rate(), 48000);
        assert_eq!(properties.channels(), 2);
        assert_eq!((properties.width(), properties.height()), (1920, 1080));
    }

    /// A segment whose SeekHead lists Info and Tracks at the given
    /// positions. Each SeekHead entry is 21 bytes and the SeekHead header 5.
    fn indexed_segment(info_at: u64, tracks_at: u64) -> std::vec::Vec<u8> {
        let head = el(0x114D_9B74, &concat(&[seek(0x1549_A966, info_at), seek(0x1654_AE6B, tracks_at)]));
        assert_eq!(head.len(), 47);
        let body = concat(&[head, el(0xEC, &[0; 3]), info(2500.), tracks(), el(0x1F43_B675, &[0xE7, 0x81, 0x00])]);
        concat(&[ebml_header(b"webm"), el(0x1853_8067, &body)])
    }

    #[test]
    fn indexed_segment_is_read() {
        // Void is 5 bytes, Info follows it
        let info_len = info(2500.).len() as u64;
        let (properties, corrupt) = read_bytes(indexed_segment(52, 52 + info_len), &ParseConfig::default());
        check_tracks(&properties);
        assert_eq!(corrupt, 0);
    }

    #[test]
    fn unreadable_index_target_falls_back_to_scan() {
        // Tracks points into the middle of Info
        let (properties, corrupt) = read_bytes(indexed_segment(52, 55), &ParseConfig::default());
        check_tracks(&properties);
        assert_eq!(corrupt, 1);
    }

    #[test]
    fn wrong_element_at_index_position_falls_back_to_scan() {
        // Tracks points at the Void, a well-formed element with another id
        let (properties, corrupt) = read_bytes(indexed_segment(52, 47), &ParseConfig::default());
        check_tracks(&properties);
        assert_eq!(corrupt, 1);
    }

    #[test]
    fn two_ids_at_one_position_fall_back_to_scan() {
        // Info and Tracks both claim the position of Info
        let (properties, corrupt) = read_bytes(indexed_segment(52, 52), &ParseConfig::default());
        check_tracks(&properties);
        assert_eq!(corrupt, 1);
    }

    /// A segment whose SeekHead holds `entries`, followed by a 3-byte Void,
    /// Info and Tracks. Returns the file and the offset of Info.
    fn segment_with_entries(entries: impl Fn(u64) -> std::vec::Vec<std::vec::Vec<u8>>) -> std::vec::Vec<u8> {
        // Every entry has the same length, so measure with a dummy position
        let head_len = el(0x114D_9B74, &concat(&entries(0))).len() as u64;
        let info_at = head_len + 5;
        let head = el(0x114D_9B74, &concat(&entries(info_at)));
        let body = concat(&[head, el(0xEC, &[0; 3]), info(2500.), tracks()]);
        concat(&[ebml_header(b"webm"), el(0x1853_8067, &body)])
    }

    #[test]
    fn element_listed_twice_is_read_once() {
        let info_len = info(2500.).len() as u64;
        let file = segment_with_entries(|info_at| {
            vec![
                seek(0x1549_A966, info_at),
                seek(0x1654_AE6B, info_at + info_len),
                seek(0x1654_AE6B, info_at + info_len),
            ]
        });
        let (properties, corrupt) = read_bytes(file, &ParseConfig::default());
        check_tracks(&properties);
        assert_eq!(properties.streams().len(), 2);
        assert_eq!(corrupt, 0);
    }

    #[test]
    fn self_listing_seek_head_hits_the_depth_bound() {
        let info_len = info(2500.).len() as u64;
        let file = segment_with_entries(|info_at| {
            vec![
                seek(0x114D_9B74, 0),
                seek(0x1549_A966, info_at),
                seek(0x1654_AE6B, info_at + info_len),
            ]
        });
        let (properties, corrupt) = read_bytes(file, &ParseConfig::default().with_max_seek_head_depth(2));
        check_tracks(&properties);
        assert_eq!(corrupt, 1);
    }

    #[test]
    fn seek_position_past_segment_falls_back() {
        let (properties, corrupt) = read_bytes(indexed_segment(52, 1 << 40), &ParseConfig::default());
        check_tracks(&properties);
        assert_eq!(corrupt, 1);
    }

    #[test]
    fn unindexed_segment_is_scanned() {
        let body = concat(&[info(2500.), el(0xBF, &[0; 4]), tracks()]);
        let (properties, corrupt) =
            read_bytes(concat(&[ebml_header(b"matroska"), el(0x1853_8067, &body)]), &ParseConfig::default());
        check_tracks(&properties);
        assert_eq!(corrupt, 0);
    }

    #[test]
    fn tracks_after_cluster_need_accurate() {
        let cluster = el(0x1F43_B675, &el(0xE7, &[0]));
        let body = concat(&[info(2500.), cluster, tracks()]);
        let file = concat(&[ebml_header(b"webm"), el(0x1853_8067, &body)]);

        let (fast, _) = read_bytes(file.clone(), &ParseConfig::default());
        assert!(fast.codecs().is_empty());
        assert_eq!(fast.duration(), StdDuration::from_millis(2500));

        let (accurate, corrupt) = read_bytes(file, &ParseConfig::default().with_read_style(ReadStyle::Accurate));
        check_tracks(&accurate);
        assert_eq!(corrupt, 0);
    }

    #[test]
    fn truncated_segment_keeps_what_is_there() {
        let body = concat(&[info(2500.), tracks()]);
        let mut file = concat(&[ebml_header(b"webm"), encode_ebml_id(0x1853_8067).unwrap().to_vec()]);
        // Declares 4 KiB more than the file holds
        file.extend_from_slice(&encode_ebml_size(body.len() as u64 + 4096).unwrap());
        file.extend(body);
        let (properties, corrupt) = read_bytes(file, &ParseConfig::default());
        check_tracks(&properties);
        assert_eq!(corrupt, 1);
    }

    #[test]
    fn unknown_doc_type_is_unsupported() {
        let file = concat(&[ebml_header(b"bogus"), el(0x1853_8067, &[])]);
        let mut cursor = std::io::Cursor::new(file);
        let config = ParseConfig::default();
        let mut session = Session::new(&mut cursor, &config, &Unstoppable).unwrap();
        assert!(matches!(read(&mut session), Err(Error::Unsupported(_))));
    }

    #[test]
    fn floats_and_uints() {
        assert_eq!(trim_nul(b"webm\0\0"), b"webm");
        assert_eq!(trim_nul(b"\0"), b"");
        let file = concat(&[el(0x4489, &1.5f32.to_be_bytes()), el(0x4489, &[0; 3]), el(0x83, &[1, 0, 0])]);
        let mut cursor = std::io::Cursor::new(file);
        let config = ParseConfig::default();
        let mut session = Session::new(&mut cursor, &config, &Unstoppable).unwrap();
        let f32_header = Dialect::Ebml.read_header(&mut session.src, 0, u64::MAX).unwrap();
        assert_eq!(read_float(&mut session, &f32_header).unwrap(), 1.5);
        let bad = Dialect::Ebml.read_header(&mut session.src, f32_header.end_offset, u64::MAX).unwrap();
        assert!(read_float(&mut session, &bad).is_err());
        let uint = Dialect::Ebml.read_header(&mut session.src, bad.end_offset, u64::MAX).unwrap();
        assert_eq!(read_uint(&mut session, &uint).unwrap(), 0x10000);
    }
}
