// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ISO base media files: MP4, M4A, MOV.

use crate::boxes::{BoxType, FourCC};
use crate::element::{read_payload, Dialect, Header, TypeId};
use crate::properties::{average_kbps, kbps, ticks_to_duration, Codec, CodecFact, MediaKind, Properties};
use crate::sizes::decode_descriptor_size;
use crate::source::{be_f64, be_u16, be_u32, be_u64, skip_slice, Source};
use crate::walker::{walk, Action, Visit};
use crate::{Error, ReadStyle, Result, Session, ToUsize, TryVec};
use bitreader::BitReader;
use byteorder::ReadBytesExt;
use log::debug;
use std::io::{Read, Seek};
use std::time::Duration;

/// Header boxes are small; anything past this is not read.
const MAX_HEADER_BOX_READ: u64 = 4096;

const SOUND_HANDLER: FourCC = FourCC::new(b"soun");
const VIDEO_HANDLER: FourCC = FourCC::new(b"vide");

/// Sample entry, then QuickTime version, revision level and vendor, then
/// channels, sample size, compression id, packet size and rate.
const AUDIO_ENTRY_FIXED: u64 = 28;
/// QuickTime sound description version 1 adds four 32-bit fields.
const AUDIO_ENTRY_V1_FIXED: u64 = AUDIO_ENTRY_FIXED + 16;
/// QuickTime sound description version 2 adds 36 bytes.
const AUDIO_ENTRY_V2_FIXED: u64 = AUDIO_ENTRY_FIXED + 36;
/// See ISO 14496-12:2015 § 12.1.3
const VISUAL_ENTRY_FIXED: u64 = 78;

/// Parse the extra header fields for a full box.
fn read_fullbox_extra<T: ReadBytesExt>(src: &mut T) -> Result<(u8, u32)> {
    let version = src.read_u8()?;
    let flags_a = src.read_u8()?;
    let flags_b = src.read_u8()?;
    let flags_c = src.read_u8()?;
    Ok((
        version,
        u32::from(flags_a) << 16 | u32::from(flags_b) << 8 | u32::from(flags_c),
    ))
}

/// Movie or media timescale and duration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Timing {
    timescale: u32,
    duration: u64,
}

impl Timing {
    fn duration(&self) -> Option<Duration> {
        // All ones means "unknown"
        if self.duration == 0 || self.duration == u64::from(u32::MAX) || self.duration == u64::MAX {
            return None;
        }
        ticks_to_duration(self.duration, self.timescale.into())
    }
}

/// Parse a Movie Header box (mvhd) or Media Header box (mdhd); both start
/// with the same timing fields.
/// See ISO/IEC 14496-12:2015 § 8.2.2 and § 8.4.2
fn read_timing(mut src: &[u8]) -> Result<Timing> {
    let (version, _flags) = read_fullbox_extra(&mut src)?;
    let (timescale, duration) = if version == 1 {
        let _creation_time = be_u64(&mut src)?;
        let _modification_time = be_u64(&mut src)?;
        let timescale = be_u32(&mut src)?;
        let duration = be_u64(&mut src)?;
        (timescale, duration)
    } else {
        let _creation_time = be_u32(&mut src)?;
        let _modification_time = be_u32(&mut src)?;
        let timescale = be_u32(&mut src)?;
        let duration = be_u32(&mut src)?;
        (timescale, u64::from(duration))
    };
    Ok(Timing { timescale, duration })
}

/// Parse a Movie Extends Header box (mehd)
/// See ISO/IEC 14496-12:2015 § 8.8.2
fn read_mehd(mut src: &[u8]) -> Result<u64> {
    let (version, _flags) = read_fullbox_extra(&mut src)?;
    Ok(match version {
        1 => be_u64(&mut src)?,
        _ => be_u32(&mut src)?.into(),
    })
}

/// Parse the presentation size of a Track Header box (tkhd)
/// See ISO/IEC 14496-12:2015 § 8.3.2
fn read_tkhd(mut src: &[u8]) -> Result<(u32, u32)> {
    let (version, _flags) = read_fullbox_extra(&mut src)?;
    // creation time, modification time, track id, reserved, duration
    let times = if version == 1 { 8 + 8 + 4 + 4 + 8 } else { 4 * 5 };
    // reserved, layer, alternate group, volume, reserved, matrix
    skip_slice(&mut src, times + 8 + 2 + 2 + 2 + 2 + 36)?;
    // 16.16 fixed point
    let width = be_u32(&mut src)? >> 16;
    let height = be_u32(&mut src)? >> 16;
    Ok((width, height))
}

/// Parse the handler type of a Handler Reference box (hdlr)
/// See ISO/IEC 14496-12:2015 § 8.4.3
fn read_hdlr(mut src: &[u8]) -> Result<FourCC> {
    let (_version, _flags) = read_fullbox_extra(&mut src)?;
    let _pre_defined = be_u32(&mut src)?;
    Ok(FourCC::from(be_u32(&mut src)?))
}

/// Sum the Sample Size box (stsz) without keeping the table.
/// See ISO/IEC 14496-12:2015 § 8.7.3
fn sum_sample_sizes<R: Read + Seek>(src: &mut Source<'_, R>, header: &Header) -> Result<u64> {
    src.seek(header.data_offset)?;
    let (_version, _flags) = read_fullbox_extra(src)?;
    let sample_size = be_u32(src)?;
    let sample_count = be_u32(src)?;
    if sample_size != 0 {
        return Ok(u64::from(sample_size) * u64::from(sample_count));
    }

    let mut left = u64::from(sample_count) * 4;
    if left > header.data_size.saturating_sub(12) {
        return Err(Error::InvalidData("stsz sample count exceeds its box"));
    }
    let mut buf = [0u8; 4096];
    let mut total = 0u64;
    while left > 0 {
        let chunk = left.min(buf.len() as u64) as usize;
        src.read_exact(&mut buf[..chunk])?;
        total += buf[..chunk]
            .chunks_exact(4)
            .map(|b| u64::from(u32::from_be_bytes([b[0], b[1], b[2], b[3]])))
            .sum::<u64>();
        left -= chunk as u64;
    }
    Ok(total)
}

/// What a sample entry says about its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SampleEntry {
    codec: Codec,
    sample_rate: u32,
    channels: u16,
    sample_size: u16,
    width: u16,
    height: u16,
    /// Where child boxes (esds, btrt, ...) start, relative to the entry data.
    children_offset: u64,
}

fn audio_codec(format: FourCC) -> Codec {
    match &format.value {
        b"mp4a" => Codec::Aac,
        b"alac" => Codec::Alac,
        b"ac-3" => Codec::Ac3,
        b"ec-3" => Codec::Eac3,
        b"dtsc" | b"dtsh" | b"dtsl" | b"dtse" => Codec::Dts,
        b".mp3" => Codec::Mp3,
        b"fLaC" => Codec::Flac,
        b"Opus" => Codec::Opus,
        b"lpcm" | b"sowt" | b"twos" | b"in24" | b"in32" | b"fl32" | b"fl64" | b"raw " | b"ipcm" | b"fpcm" => {
            Codec::Pcm
        },
        _ => Codec::Unknown,
    }
}

fn visual_codec(format: FourCC) -> Codec {
    match &format.value {
        b"avc1" | b"avc3" => Codec::Avc,
        b"hvc1" | b"hev1" => Codec::Hevc,
        b"av01" => Codec::Av1,
        b"vp08" => Codec::Vp8,
        b"vp09" => Codec::Vp9,
        b"mp4v" => Codec::Mpeg4Visual,
        b"jpeg" | b"mjpa" | b"mjpb" => Codec::Mjpeg,
        b"raw " => Codec::RawVideo,
        _ => Codec::Unknown,
    }
}

/// Parse an audio sample entry, including QuickTime sound description
/// versions 1 and 2.
///
/// QuickTime layouts only occur in a version 0 `stsd`. A version 1 `stsd`
/// holds ISO AudioSampleEntryV1, whose fixed part is the same size as
/// version 0.
/// See ISO/IEC 14496-12:2015 § 12.2.3
fn read_audio_entry(format: FourCC, stsd_version: u8, mut src: &[u8]) -> Result<SampleEntry> {
    // reserved, data reference index
    skip_slice(&mut src, 6 + 2)?;
    let version = be_u16(&mut src)?;
    // revision level, vendor
    skip_slice(&mut src, 2 + 4)?;
    let mut channels = be_u16(&mut src)?;
    let sample_size = be_u16(&mut src)?;
    // compression id, packet size
    skip_slice(&mut src, 2 + 2)?;
    let mut sample_rate = be_u32(&mut src)? >> 16;

    let children_offset = match version {
        _ if stsd_version != 0 => AUDIO_ENTRY_FIXED,
        1 => AUDIO_ENTRY_V1_FIXED,
        2 => {
            let _size_of_struct = be_u32(&mut src)?;
            let rate = be_f64(&mut src)?;
            channels = u16::try_from(be_u32(&mut src)?).unwrap_or(u16::MAX);
            if rate.is_finite() && rate >= 1.0 && rate <= f64::from(u32::MAX) {
                sample_rate = rate as u32;
            }
            AUDIO_ENTRY_V2_FIXED
        },
        _ => AUDIO_ENTRY_FIXED,
    };
    Ok(SampleEntry {
        codec: audio_codec(format),
        sample_rate,
        channels,
        sample_size,
        width: 0,
        height: 0,
        children_offset,
    })
}

/// Parse a visual sample entry.
/// See ISO/IEC 14496-12:2015 § 12.1.3
fn read_visual_entry(format: FourCC, mut src: &[u8]) -> Result<SampleEntry> {
    // reserved, data reference index, pre_defined, reserved, pre_defined
    skip_slice(&mut src, 6 + 2 + 2 + 2 + 12)?;
    let width = be_u16(&mut src)?;
    let height = be_u16(&mut src)?;
    Ok(SampleEntry {
        codec: visual_codec(format),
        sample_rate: 0,
        channels: 0,
        sample_size: 0,
        width,
        height,
        children_offset: VISUAL_ENTRY_FIXED,
    })
}

/// The parts of an `esds` box that describe the stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct EsDescriptor {
    object_type: u8,
    avg_bitrate: u32,
    sample_rate: Option<u32>,
    channels: Option<u8>,
}

const ES_DESCRIPTOR_TAG: u8 = 0x03;
const DECODER_CONFIG_DESCRIPTOR_TAG: u8 = 0x04;
const DECODER_SPECIFIC_DESCRIPTOR_TAG: u8 = 0x05;

/// Sampling frequencies by index.
/// See ISO 14496-3:2009 § 1.6.3.4
const AUDIO_SAMPLING_FREQUENCIES: [u32; 13] = [96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350];

impl EsDescriptor {
    fn codec(&self) -> Codec {
        match self.object_type {
            0x40 | 0x66 | 0x67 | 0x68 => Codec::Aac,
            0x69 | 0x6B => Codec::Mp3,
            0xA5 => Codec::Ac3,
            0xA6 => Codec::Eac3,
            0xA9 | 0xAC => Codec::Dts,
            0xAD => Codec::Opus,
            0xDD => Codec::Vorbis,
            0x20 => Codec::Mpeg4Visual,
            0x21 => Codec::Avc,
            0x60..=0x65 => Codec::Mpeg2Video,
            0x6C => Codec::Mjpeg,
            _ => Codec::Unknown,
        }
    }
}

/// Parse the descriptors of an Elementary Stream Descriptor box (esds).
/// See ISO 14496-14:2003 § 5.6 and ISO 14496-1:2010 § 7.2.6
fn read_esds(mut src: &[u8]) -> Result<EsDescriptor> {
    let (_version, _flags) = read_fullbox_extra(&mut src)?;
    let mut esds = EsDescriptor::default();
    read_descriptors(src, &mut esds, 0)?;
    Ok(esds)
}

fn read_descriptors(mut src: &[u8], esds: &mut EsDescriptor, depth: u8) -> Result<()> {
    if depth > 4 {
        return Err(Error::InvalidData("esds descriptors nested too deeply"));
    }
    while let Some(&tag) = src.first() {
        let (len, width) = decode_descriptor_size(&src[1..])?;
        skip_slice(&mut src, 1 + width)?;
        let len = len.to_usize();
        let body = src.get(..len).ok_or(Error::InvalidData("descriptor overruns esds"))?;
        match tag {
            ES_DESCRIPTOR_TAG => read_es_descriptor(body, esds, depth)?,
            DECODER_CONFIG_DESCRIPTOR_TAG => read_decoder_config(body, esds, depth)?,
            DECODER_SPECIFIC_DESCRIPTOR_TAG => read_audio_specific_config(body, esds)?,
            _ => debug!("skipping descriptor tag {tag:#x}"),
        }
        skip_slice(&mut src, len)?;
    }
    Ok(())
}

fn read_es_descriptor(mut src: &[u8], esds: &mut EsDescriptor, depth: u8) -> Result<()> {
    let _es_id = be_u16(&mut src)?;
    let flags = src.read_u8()?;
    if flags & 0x80 != 0 {
        let _depends_on_es_id = be_u16(&mut src)?;
    }
    if flags & 0x40 != 0 {
        let url_len = src.read_u8()?;
        skip_slice(&mut src, url_len.into())?;
    }
    if flags & 0x20 != 0 {
        let _ocr_es_id = be_u16(&mut src)?;
    }
    read_descriptors(src, esds, depth + 1)
}

fn read_decoder_config(mut src: &[u8], esds: &mut EsDescriptor, depth: u8) -> Result<()> {
    esds.object_type = src.read_u8()?;
    // stream type, buffer size
    skip_slice(&mut src, 1 + 3)?;
    let _max_bitrate = be_u32(&mut src)?;
    esds.avg_bitrate = be_u32(&mut src)?;
    read_descriptors(src, esds, depth + 1)
}

/// Parse the start of an AudioSpecificConfig.
/// See ISO 14496-3:2009 § 1.6.2.1
fn read_audio_specific_config(src: &[u8], esds: &mut EsDescriptor) -> Result<()> {
    if !matches!(esds.object_type, 0x40 | 0x66 | 0x67 | 0x68) {
        return Ok(());
    }
    let mut bits = BitReader::new(src);
    let audio_object_type = match bits.read_u8(5)? {
        31 => 32 + bits.read_u8(6)?,
        aot => aot,
    };
    let sample_rate = match bits.read_u8(4)? {
        0x0F => bits.read_u32(24)?,
        index => AUDIO_SAMPLING_FREQUENCIES.get(usize::from(index)).copied().unwrap_or(0),
    };
    let channel_config = bits.read_u8(4)?;
    debug!("AudioSpecificConfig: object type {audio_object_type}, {sample_rate} Hz, channel config {channel_config}");

    if sample_rate != 0 {
        esds.sample_rate = Some(sample_rate);
    }
    esds.channels = match channel_config {
        0 => None,
        1..=6 => Some(channel_config),
        7 => Some(8),
        _ => None,
    };
    Ok(())
}

/// Parse an ALAC specific config box (alac inside the alac sample entry).
fn read_alac_config(mut src: &[u8]) -> Result<(u32, u8, u8, u32)> {
    let (_version, _flags) = read_fullbox_extra(&mut src)?;
    let _frame_length = be_u32(&mut src)?;
    let _compatible_version = src.read_u8()?;
    let bit_depth = src.read_u8()?;
    // rice history mult, initial history, limit
    skip_slice(&mut src, 3)?;
    let channels = src.read_u8()?;
    let _max_run = be_u16(&mut src)?;
    let _max_frame_bytes = be_u32(&mut src)?;
    let avg_bitrate = be_u32(&mut src)?;
    let sample_rate = be_u32(&mut src)?;
    Ok((avg_bitrate, bit_depth, channels, sample_rate))
}

/// Parse the average bitrate of a Bit Rate box (btrt)
/// See ISO/IEC 14496-12:2015 § 8.5.2.2
fn read_btrt(mut src: &[u8]) -> Result<u32> {
    let _buffer_size_db = be_u32(&mut src)?;
    let _max_bitrate = be_u32(&mut src)?;
    be_u32(&mut src)
}

#[derive(Debug, Default)]
struct TrackBuilder {
    handler: Option<FourCC>,
    kind: Option<MediaKind>,
    media: Timing,
    tkhd_size: (u32, u32),
    stsd_version: u8,
    entry: Option<SampleEntry>,
    /// Sample entries seen; only the first describes the track.
    entries_seen: u32,
    esds: Option<EsDescriptor>,
    alac: Option<(u32, u8, u8, u32)>,
    btrt_avg_bitrate: u32,
    sample_bytes: u64,
}

impl TrackBuilder {
    /// Track kind from the handler, or failing that from the sample entry format.
    fn media_kind(&self, format: FourCC) -> Option<MediaKind> {
        match self.handler {
            Some(SOUND_HANDLER) => Some(MediaKind::AUDIO),
            Some(VIDEO_HANDLER) => Some(MediaKind::VIDEO),
            Some(_) => None,
            None if audio_codec(format) != Codec::Unknown => Some(MediaKind::AUDIO),
            None if visual_codec(format) != Codec::Unknown => Some(MediaKind::VIDEO),
            None => None,
        }
    }

    fn fact(&self) -> Option<CodecFact> {
        let kind = self.kind?;
        let entry = self.entry?;
        let mut codec = entry.codec;
        let mut sample_rate = entry.sample_rate;
        let mut channels = u8::try_from(entry.channels).unwrap_or(u8::MAX);
        let mut bits_per_sample = u8::try_from(entry.sample_size).unwrap_or(0);
        let mut declared_bitrate = self.btrt_avg_bitrate;

        if let Some(esds) = self.esds {
            if esds.codec() != Codec::Unknown {
                codec = esds.codec();
            }
            // The AudioSpecificConfig is authoritative for AAC; sample
            // entries in MP4 files often carry placeholders.
            sample_rate = esds.sample_rate.unwrap_or(sample_rate);
            channels = esds.channels.unwrap_or(channels);
            if declared_bitrate == 0 {
                declared_bitrate = esds.avg_bitrate;
            }
        }
        if let Some((avg_bitrate, bit_depth, alac_channels, alac_rate)) = self.alac {
            bits_per_sample = bit_depth;
            channels = alac_channels;
            if alac_rate != 0 {
                sample_rate = alac_rate;
            }
            if declared_bitrate == 0 {
                declared_bitrate = avg_bitrate;
            }
        }

        let duration = self.media.duration();
        let bitrate = match (declared_bitrate, duration) {
            (0, Some(duration)) if self.sample_bytes != 0 => average_kbps(self.sample_bytes, duration),
            (bps, _) => kbps(bps.into()),
        };

        let mut fact = CodecFact::new(kind, codec).with_bitrate(bitrate);
        if let Some(duration) = duration {
            fact = fact.with_duration(duration);
        }
        if kind == MediaKind::AUDIO {
            fact = fact
                .with_sample_rate(sample_rate)
                .with_channels(channels)
                .with_bits_per_sample(bits_per_sample);
        } else {
            let (w, h) = match (entry.width, entry.height) {
                (0, _) | (_, 0) => self.tkhd_size,
                (w, h) => (w.into(), h.into()),
            };
            fact = fact.with_dimensions(w, h);
        }
        Some(fact)
    }
}

#[derive(Default)]
struct Mp4State {
    movie: Timing,
    fragment_duration: Option<u64>,
    saw_moov: bool,
    tracks: TryVec<TrackBuilder>,
}

impl Mp4State {
    fn track(&mut self) -> Result<&mut TrackBuilder> {
        self.tracks.last_mut().ok_or(Error::InvalidData("track box expected"))
    }

    fn visit<R: Read + Seek>(&mut self, session: &mut Session<'_, R>, visit: &Visit) -> Result<Action> {
        let header = &visit.header;
        let stsd = TypeId::FourCC(BoxType::SampleDescriptionBox.into());
        if visit.parent_type == Some(stsd) {
            return self.sample_entry(session, visit);
        }

        Ok(match header.box_type() {
            BoxType::MovieBox => {
                self.saw_moov = true;
                visit.children()
            },
            BoxType::TrackBox => {
                self.tracks.push(TrackBuilder::default())?;
                visit.children()
            },
            BoxType::MovieExtendsBox | BoxType::MediaBox | BoxType::MediaInformationBox | BoxType::SampleTableBox => {
                visit.children()
            },
            BoxType::MovieHeaderBox => {
                self.movie = read_timing(&read_payload(&mut session.src, header, MAX_HEADER_BOX_READ)?)?;
                Action::Skip
            },
            BoxType::MovieExtendsHeaderBox => {
                self.fragment_duration = Some(read_mehd(&read_payload(&mut session.src, header, MAX_HEADER_BOX_READ)?)?);
                Action::Skip
            },
            BoxType::TrackHeaderBox => {
                let size = read_tkhd(&read_payload(&mut session.src, header, MAX_HEADER_BOX_READ)?)?;
                self.track()?.tkhd_size = size;
                Action::Skip
            },
            BoxType::MediaHeaderBox => {
                let timing = read_timing(&read_payload(&mut session.src, header, MAX_HEADER_BOX_READ)?)?;
                self.track()?.media = timing;
                Action::Skip
            },
            BoxType::HandlerBox => {
                let handler = read_hdlr(&read_payload(&mut session.src, header, MAX_HEADER_BOX_READ)?)?;
                // hdlr also appears inside meta; only the one in mdia names the track kind
                if let Some(track) = self.tracks.last_mut() {
                    if track.handler.is_none() && track.entry.is_none() {
                        track.handler = Some(handler);
                    }
                }
                Action::Skip
            },
            BoxType::SampleDescriptionBox => {
                let data = read_payload(&mut session.src, header, 4)?;
                let (version, _flags) = read_fullbox_extra(&mut &data[..])?;
                self.track()?.stsd_version = version;
                // full box header and entry count
                visit.children_after(8)
            },
            BoxType::SampleSizeBox => {
                if session.read_style() != ReadStyle::Fast {
                    let bytes = sum_sample_sizes(&mut session.src, header)?;
                    self.track()?.sample_bytes = bytes;
                }
                Action::Skip
            },
            BoxType::ESDBox | BoxType::ALACSpecificBox | BoxType::BitRateBox => {
                self.sample_entry_child(session, header)?;
                Action::Skip
            },
            BoxType::MediaDataBox if self.saw_moov => Action::Stop,
            _ => Action::Skip,
        })
    }

    fn sample_entry<R: Read + Seek>(&mut self, session: &mut Session<'_, R>, visit: &Visit) -> Result<Action> {
        let header = &visit.header;
        let format = header.fourcc().unwrap_or_default();
        let track = self.track()?;
        track.entries_seen += 1;
        if track.entries_seen > 1 {
            return Ok(Action::Skip);
        }
        let data = read_payload(&mut session.src, header, AUDIO_ENTRY_V2_FIXED)?;
        let kind = track.media_kind(format);
        let entry = match kind {
            Some(MediaKind::AUDIO) => read_audio_entry(format, track.stsd_version, &data)?,
            Some(MediaKind::VIDEO) => read_visual_entry(format, &data)?,
            _ => {
                debug!("sample entry {format} in a track that is neither sound nor video");
                return Ok(Action::Skip);
            },
        };
        debug!("sample entry {format}: {:?}", entry.codec);
        track.kind = kind;
        track.entry = Some(entry);
        Ok(visit.children_after(entry.children_offset))
    }

    fn sample_entry_child<R: Read + Seek>(&mut self, session: &mut Session<'_, R>, header: &Header) -> Result<()> {
        let Some(track) = self.tracks.last_mut() else { return Ok(()) };
        if track.entry.is_none() || track.entries_seen > 1 {
            return Ok(());
        }
        let data = read_payload(&mut session.src, header, MAX_HEADER_BOX_READ)?;
        match header.box_type() {
            BoxType::ESDBox => track.esds = Some(read_esds(&data)?),
            BoxType::ALACSpecificBox => track.alac = Some(read_alac_config(&data)?),
            BoxType::BitRateBox => track.btrt_avg_bitrate = read_btrt(&data)?,
            _ => {},
        }
        Ok(())
    }
}

pub(crate) fn read<R: Read + Seek>(session: &mut Session<'_, R>) -> Result<Properties> {
    let end = session.src.len();
    let first = Dialect::Bmff.read_header(&mut session.src, 0, end)?;
    if first.box_type() != BoxType::FileTypeBox {
        return Err(Error::Unsupported("first box is not ftyp"));
    }

    let mut state = Mp4State::default();
    walk(session, Dialect::Bmff, None, 0..end, |session, visit| state.visit(session, visit))?;

    if !state.saw_moov {
        session.ledger.record(end, "no moov box");
    }
    let container_duration = state.movie.duration().or_else(|| {
        let fragment = Timing { timescale: state.movie.timescale, duration: state.fragment_duration? };
        fragment.duration()
    });

    let mut facts = TryVec::new();
    for track in state.tracks.iter() {
        if let Some(fact) = track.fact() {
            facts.push(fact)?;
        }
    }
    Properties::aggregate(container_duration, &facts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_versions() {
        let mut v0 = vec![0u8; 4];
        v0.extend_from_slice(&[0; 8]);
        v0.extend_from_slice(&600u32.to_be_bytes());
        v0.extend_from_slice(&1500u32.to_be_bytes());
        assert_eq!(read_timing(&v0).unwrap().duration(), Some(Duration::from_millis(2500)));

        let mut v1 = vec![1u8, 0, 0, 0];
        v1.extend_from_slice(&[0; 16]);
        v1.extend_from_slice(&1000u32.to_be_bytes());
        v1.extend_from_slice(&u64::MAX.to_be_bytes());
        assert_eq!(read_timing(&v1).unwrap().duration(), None);
    }

    #[test]
    fn esds_with_audio_specific_config() {
        // AAC LC, 44100 Hz (index 4), stereo
        let asc = [0x12, 0x10];
        let mut dcd = vec![0x40, 0x15, 0, 0, 0];
        dcd.extend_from_slice(&256_000u32.to_be_bytes());
        dcd.extend_from_slice(&128_000u32.to_be_bytes());
        dcd.extend_from_slice(&[DECODER_SPECIFIC_DESCRIPTOR_TAG, asc.len() as u8]);
        dcd.extend_from_slice(&asc);
        let mut es = vec![0, 1, 0];
        // expandable size, written long-form
        es.extend_from_slice(&[DECODER_CONFIG_DESCRIPTOR_TAG, 0x80, 0x80, dcd.len() as u8]);
        es.extend_from_slice(&dcd);
        let mut esds = vec![0, 0, 0, 0, ES_DESCRIPTOR_TAG, es.len() as u8];
        esds.extend_from_slice(&es);

        let parsed = read_esds(&esds).unwrap();
        assert_eq!(parsed.codec(), Codec::Aac);
        assert_eq!(parsed.avg_bitrate, 128_000);
        assert_eq!(parsed.sample_rate, Some(44100));
        assert_eq!(parsed.channels, Some(2));
    }

    #[test]
    fn quicktime_v2_sound_description() {
        let mut entry = vec![0u8; 8];
        entry.extend_from_slice(&2u16.to_be_bytes());
        entry.extend_from_slice(&[0; 6]);
        entry.extend_from_slice(&3u16.to_be_bytes());
        entry.extend_from_slice(&16u16.to_be_bytes());
        entry.extend_from_slice(&[0xFF, 0xFE, 0, 0]);
        entry.extend_from_slice(&0x0001_0000u32.to_be_bytes());
        entry.extend_from_slice(&72u32.to_be_bytes());
        entry.extend_from_slice(&96000f64.to_be_bytes());
        entry.extend_from_slice(&6u32.to_be_bytes());
        let parsed = read_audio_entry(FourCC::new(b"lpcm"), 0, &entry).unwrap();
        assert_eq!(parsed.codec, Codec::Pcm);
        assert_eq!((parsed.sample_rate, parsed.channels), (96000, 6));
        assert_eq!(parsed.children_offset, AUDIO_ENTRY_V2_FIXED);
    }

    /// Version 1 audio sample entry: 44.1 kHz stereo, 16 bits.
    fn audio_entry_v1() -> std::vec::Vec<u8> {
        let mut entry = vec![0u8; 8];
        entry.extend_from_slice(&1u16.to_be_bytes());
        entry.extend_from_slice(&[0; 6]);
        entry.extend_from_slice(&2u16.to_be_bytes());
        entry.extend_from_slice(&16u16.to_be_bytes());
        entry.extend_from_slice(&[0; 4]);
        entry.extend_from_slice(&(44100u32 << 16).to_be_bytes());
        entry
    }

    #[test]
    fn sound_description_v1_depends_on_stsd_version() {
        let mut quicktime = audio_entry_v1();
        // samples per packet, bytes per packet, bytes per frame, bytes per sample
        quicktime.extend_from_slice(&[0; 16]);
        let parsed = read_audio_entry(FourCC::new(b"mp4a"), 0, &quicktime).unwrap();
        assert_eq!(parsed.children_offset, AUDIO_ENTRY_V1_FIXED);

        let parsed = read_audio_entry(FourCC::new(b"mp4a"), 1, &audio_entry_v1()).unwrap();
        assert_eq!(parsed.children_offset, AUDIO_ENTRY_FIXED);
        assert_eq!((parsed.sample_rate, parsed.channels), (44100, 2));
    }

    #[test]
    fn iso_v1_entry_children_are_found() {
        fn bmff(name: &[u8; 4], payload: &[u8]) -> std::vec::Vec<u8> {
            let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
            out.extend_from_slice(name);
            out.extend_from_slice(payload);
            out
        }
        let mut btrt = 0u32.to_be_bytes().to_vec();
        btrt.extend_from_slice(&320_000u32.to_be_bytes());
        btrt.extend_from_slice(&192_000u32.to_be_bytes());
        let mp4a = bmff(b"mp4a", &[audio_entry_v1(), bmff(b"btrt", &btrt)].concat());
        // stsd version 1, one entry
        let stsd = bmff(b"stsd", &[&[1, 0, 0, 0, 0, 0, 0, 1][..], &mp4a].concat());
        let mut hdlr = vec![0u8; 8];
        hdlr.extend_from_slice(b"soun");
        hdlr.extend_from_slice(&[0; 13]);
        let mut mdhd = vec![0u8; 12];
        mdhd.extend_from_slice(&1000u32.to_be_bytes());
        mdhd.extend_from_slice(&2000u32.to_be_bytes());
        mdhd.extend_from_slice(&[0; 4]);
        let minf = bmff(b"minf", &bmff(b"stbl", &stsd));
        let mdia = bmff(b"mdia", &[bmff(b"mdhd", &mdhd), bmff(b"hdlr", &hdlr), minf].concat());
        let moov = bmff(b"moov", &bmff(b"trak", &mdia));
        let file = [bmff(b"ftyp", b"iso8\0\0\0\0iso8"), moov].concat();

        let mut cursor = std::io::Cursor::new(file);
        let config = crate::ParseConfig::default();
        let mut session = Session::new(&mut cursor, &config, &crate::Unstoppable).unwrap();
        let properties = read(&mut session).unwrap();
        assert_eq!(properties.codecs(), [Codec::Aac]);
        assert_eq!(properties.sample_rate(), 44100);
        assert_eq!(properties.bitrate(), 192);
        assert_eq!(properties.duration(), Duration::from_secs(2));
    }
}
