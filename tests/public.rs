// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use mediaprops::sizes::{encode_ebml_id, encode_ebml_size};
use mediaprops::{Codec, ContainerFormat, Error, MediaKind, ParseConfig, Probe, ReadStyle, StopReason, Unstoppable};
use std::io::Cursor;
use std::time::Duration;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).filter_level(log::LevelFilter::max()).try_init();
}

fn parse(bytes: Vec<u8>, config: &ParseConfig) -> Probe {
    init_logger();
    mediaprops::read_properties(&mut Cursor::new(bytes), config, &Unstoppable).expect("read_properties failed")
}

struct ImmediatelyCancelled;

impl mediaprops::Stop for ImmediatelyCancelled {
    fn check(&self) -> std::result::Result<(), mediaprops::StopReason> {
        Err(mediaprops::StopReason::Cancelled)
    }
}

// ============================================================================
// ISO-BMFF
// ============================================================================

fn bmff(name: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
    out.extend_from_slice(name);
    out.extend_from_slice(payload);
    out
}

/// Version 0 mvhd or mdhd timing fields.
fn timing(timescale: u32, duration: u32, rest: usize) -> Vec<u8> {
    let mut out = vec![0u8; 12];
    out.extend_from_slice(&timescale.to_be_bytes());
    out.extend_from_slice(&duration.to_be_bytes());
    out.resize(out.len() + rest, 0);
    out
}

/// One second of stereo AAC at 44.1 kHz, 16 samples of 1000 bytes each.
fn m4a_moov() -> Vec<u8> {
    let mut mp4a = vec![0u8; 6];
    mp4a.extend_from_slice(&1u16.to_be_bytes());
    mp4a.extend_from_slice(&[0; 8]);
    mp4a.extend_from_slice(&2u16.to_be_bytes());
    mp4a.extend_from_slice(&16u16.to_be_bytes());
    mp4a.extend_from_slice(&[0; 4]);
    mp4a.extend_from_slice(&(44100u32 << 16).to_be_bytes());

    let mut stsd = vec![0, 0, 0, 0, 0, 0, 0, 1];
    stsd.extend(bmff(b"mp4a", &mp4a));
    let mut stsz = vec![0u8; 4];
    stsz.extend_from_slice(&1000u32.to_be_bytes());
    stsz.extend_from_slice(&16u32.to_be_bytes());
    let stbl = bmff(b"stbl", &[bmff(b"stsd", &stsd), bmff(b"stsz", &stsz)].concat());

    let mut hdlr = vec![0u8; 8];
    hdlr.extend_from_slice(b"soun");
    hdlr.extend_from_slice(&[0; 13]);
    let mdia = bmff(
        b"mdia",
        &[bmff(b"mdhd", &timing(44100, 44100, 4)), bmff(b"hdlr", &hdlr), bmff(b"minf", &stbl)].concat(),
    );
    let trak = bmff(b"trak", &[bmff(b"tkhd", &[0; 84]), mdia].concat());
    bmff(b"moov", &[bmff(b"mvhd", &timing(1000, 1000, 80)), trak].concat())
}

fn ftyp() -> Vec<u8> {
    bmff(b"ftyp", b"M4A \0\0\0\0isomM4A ")
}

#[test]
fn mp4_audio_track() {
    let file = [ftyp(), m4a_moov(), bmff(b"mdat", &[0; 64])].concat();
    let parsed = parse(file, &ParseConfig::default());
    assert_eq!(parsed.format, Some(ContainerFormat::Mp4));
    assert!(!parsed.is_possibly_corrupt(), "{:?}", parsed.ledger);
    let props = parsed.properties.unwrap();
    assert_eq!(props.duration(), Duration::from_secs(1));
    assert_eq!(props.codecs(), [Codec::Aac]);
    assert_eq!(props.sample_rate(), 44100);
    assert_eq!(props.channels(), 2);
    assert_eq!(props.bits_per_sample(), 16);
    // 16000 bytes over one second
    assert_eq!(props.bitrate(), 128);

    let [stream] = props.streams() else { panic!("{:?}", props.streams()) };
    assert_eq!(stream.media_kind, MediaKind::AUDIO);
    assert_eq!((stream.sample_rate, stream.channels), (44100, 2));
    assert_eq!(stream.duration, Some(Duration::from_secs(1)));
}

#[test]
fn mp4_fast_skips_sample_tables() {
    let file = [ftyp(), m4a_moov()].concat();
    let parsed = parse(file, &ParseConfig::default().with_read_style(ReadStyle::Fast));
    let props = parsed.properties.unwrap();
    assert_eq!(props.sample_rate(), 44100);
    assert_eq!(props.bitrate(), 0);
}

#[test]
fn mp4_truncated_media_data() {
    let mut mdat = bmff(b"mdat", &[0; 16]);
    mdat[..4].copy_from_slice(&(1u32 << 20).to_be_bytes());

    let moov_first = [ftyp(), m4a_moov(), mdat.clone()].concat();
    let parsed_moov_first = parse(moov_first, &ParseConfig::default());
    assert_eq!(parsed_moov_first.ledger.len(), 1);
    let props = parsed_moov_first.properties.unwrap();
    assert_eq!(props.codecs(), [Codec::Aac]);
    assert_eq!(props.duration(), Duration::from_secs(1));

    // Media data first: its header overruns the file before moov is reached
    let mdat_first = [ftyp(), mdat, m4a_moov()].concat();
    let parsed = parse(mdat_first, &ParseConfig::default());
    assert_eq!(parsed.ledger.len(), 2, "{:?}", parsed.ledger);
    assert_eq!(parsed.ledger.entries()[0].offset, ftyp().len() as u64);
    assert!(parsed.properties.unwrap().codecs().is_empty());
}

#[test]
fn mp4_depth_limit() {
    let file = [ftyp(), m4a_moov()].concat();
    let parsed = parse(file, &ParseConfig::default().with_max_depth(2));
    assert_eq!(parsed.ledger.len(), 1);
    let props = parsed.properties.unwrap();
    // The movie header is still read; the track is not
    assert_eq!(props.duration(), Duration::from_secs(1));
    assert!(props.codecs().is_empty());
}

#[test]
fn mp4_element_limit() {
    let file = [ftyp(), m4a_moov()].concat();
    let parsed = parse(file, &ParseConfig::default().with_max_elements(3));
    assert_eq!(parsed.ledger.len(), 1);
    assert!(parsed.ledger.entries()[0].reason.contains("limit"));
    assert_eq!(parsed.properties.unwrap().duration(), Duration::from_secs(1));
}

#[test]
fn mp4_without_ftyp_is_unsupported() {
    init_logger();
    let file = [m4a_moov()].concat();
    let result = mediaprops::read_properties(&mut Cursor::new(file), &ParseConfig::default(), &Unstoppable);
    assert!(matches!(result, Err(Error::Unsupported(_))));
}

// ============================================================================
// Matroska
// ============================================================================

fn el(id: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = encode_ebml_id(id).unwrap().to_vec();
    out.extend_from_slice(&encode_ebml_size(payload.len() as u64).unwrap());
    out.extend_from_slice(payload);
    out
}

fn mkv_info() -> Vec<u8> {
    el(0x1549_A966, &[el(0x2A_D7B1, &[0x0F, 0x42, 0x40]), el(0x4489, &1500f64.to_be_bytes())].concat())
}

fn mkv_tracks() -> Vec<u8> {
    let audio = el(0xE1, &[el(0xB5, &44100f64.to_be_bytes()), el(0x9F, &[6])].concat());
    el(0x1654_AE6B, &el(0xAE, &[el(0x83, &[2]), el(0x86, b"A_OPUS"), audio].concat()))
}

fn seek(id: u32, position: u64) -> Vec<u8> {
    el(0x4DBB, &[el(0x53AB, &encode_ebml_id(id).unwrap()), el(0x53AC, &position.to_be_bytes())].concat())
}

fn mkv(seek_head: Option<(u64, u64)>) -> Vec<u8> {
    let head = match seek_head {
        Some((info_at, tracks_at)) => el(0x114D_9B74, &[seek(0x1549_A966, info_at), seek(0x1654_AE6B, tracks_at)].concat()),
        None => Vec::new(),
    };
    let body = [head, mkv_info(), mkv_tracks(), el(0x1F43_B675, &[0xE7, 0x81, 0x00])].concat();
    [el(0x1A45_DFA3, &el(0x4282, b"matroska")), el(0x1853_8067, &body)].concat()
}

fn check_opus(parsed: Probe) {
    assert_eq!(parsed.format, Some(ContainerFormat::Matroska));
    let props = parsed.properties.unwrap();
    assert_eq!(props.duration(), Duration::from_millis(1500));
    assert_eq!(props.codecs(), [Codec::Opus]);
    assert_eq!(props.sample_rate(), 44100);
    assert_eq!(props.channels(), 6);
}

#[test]
fn matroska_seek_head() {
    // The SeekHead holds two 21-byte entries behind a 5-byte header
    let info_at = 47;
    let tracks_at = info_at + mkv_info().len() as u64;
    let parsed = parse(mkv(Some((info_at, tracks_at))), &ParseConfig::default());
    assert!(!parsed.is_possibly_corrupt(), "{:?}", parsed.ledger);
    check_opus(parsed);
}

#[test]
fn matroska_bad_seek_head_falls_back_to_scan() {
    let parsed = parse(mkv(Some((47, 49))), &ParseConfig::default());
    assert_eq!(parsed.ledger.len(), 1);
    assert!(parsed.ledger.entries()[0].reason.contains("SeekHead"));
    check_opus(parsed);
}

#[test]
fn matroska_seek_head_names_the_wrong_element() {
    // Info and Tracks swapped: both positions hold well-formed elements
    let parsed = parse(mkv(Some((70, 47))), &ParseConfig::default());
    assert_eq!(parsed.ledger.len(), 1);
    assert!(parsed.ledger.entries()[0].reason.contains("different id"));
    check_opus(parsed);
}

#[test]
fn matroska_without_seek_head() {
    let parsed = parse(mkv(None), &ParseConfig::default());
    assert!(!parsed.is_possibly_corrupt());
    check_opus(parsed);
}

#[test]
fn matroska_cut_short() {
    let mut file = mkv(None);
    // Drop the cluster and half the tracks
    file.truncate(file.len() - 4 - mkv_tracks().len() / 2);
    let parsed = parse(file, &ParseConfig::default());
    assert!(parsed.is_possibly_corrupt());
    let props = parsed.properties.unwrap();
    assert_eq!(props.duration(), Duration::from_millis(1500));
}

// ============================================================================
// ASF
// ============================================================================

fn guid(d1: u32, d2: u16, d3: u16, d4: [u8; 8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..4].copy_from_slice(&d1.to_le_bytes());
    out[4..6].copy_from_slice(&d2.to_le_bytes());
    out[6..8].copy_from_slice(&d3.to_le_bytes());
    out[8..].copy_from_slice(&d4);
    out
}

const ASF_HEADER: (u32, u16, u16, [u8; 8]) = (0x75B2_2630, 0x668E, 0x11CF, [0xA6, 0xD9, 0x00, 0xAA, 0x00, 0x62, 0xCE, 0x6C]);
const ASF_DATA: (u32, u16, u16, [u8; 8]) = (0x75B2_2636, 0x668E, 0x11CF, [0xA6, 0xD9, 0x00, 0xAA, 0x00, 0x62, 0xCE, 0x6C]);
const ASF_FILE_PROPERTIES: (u32, u16, u16, [u8; 8]) = (0x8CAB_DCA1, 0xA947, 0x11CF, [0x8E, 0xE4, 0x00, 0xC0, 0x0C, 0x20, 0x53, 0x65]);
const ASF_STREAM_PROPERTIES: (u32, u16, u16, [u8; 8]) = (0xB7DC_0791, 0xA9B7, 0x11CF, [0x8E, 0xE6, 0x00, 0xC0, 0x0C, 0x20, 0x53, 0x65]);
const ASF_AUDIO_MEDIA: (u32, u16, u16, [u8; 8]) = (0xF869_9E40, 0x5B4D, 0x11CF, [0xA8, 0xFD, 0x00, 0x80, 0x5F, 0x5C, 0x44, 0x2B]);

fn asf_object(id: (u32, u16, u16, [u8; 8]), payload: &[u8]) -> Vec<u8> {
    let mut out = guid(id.0, id.1, id.2, id.3).to_vec();
    out.extend_from_slice(&(payload.len() as u64 + 24).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

fn wave_format(tag: u16, channels: u16, rate: u32, bytes_per_sec: u32) -> Vec<u8> {
    let mut out = tag.to_le_bytes().to_vec();
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&rate.to_le_bytes());
    out.extend_from_slice(&bytes_per_sec.to_le_bytes());
    out.extend_from_slice(&4u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

fn asf_audio_stream(number: u16, format: &[u8]) -> Vec<u8> {
    let mut out = guid(ASF_AUDIO_MEDIA.0, ASF_AUDIO_MEDIA.1, ASF_AUDIO_MEDIA.2, ASF_AUDIO_MEDIA.3).to_vec();
    out.extend_from_slice(&[0; 16 + 8]);
    out.extend_from_slice(&(format.len() as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&number.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(format);
    asf_object(ASF_STREAM_PROPERTIES, &out)
}

#[test]
fn asf_first_declared_audio_fields_win() {
    let mut file_properties = vec![0u8; 40];
    // Three seconds of play time, one second of preroll
    file_properties.extend_from_slice(&30_000_000u64.to_le_bytes());
    file_properties.extend_from_slice(&0u64.to_le_bytes());
    file_properties.extend_from_slice(&1000u64.to_le_bytes());
    file_properties.extend_from_slice(&[0; 16]);

    let children = [
        asf_object(ASF_FILE_PROPERTIES, &file_properties),
        asf_audio_stream(1, &wave_format(0x0161, 0, 0, 0)),
        asf_audio_stream(2, &wave_format(0x0161, 2, 44100, 16000)),
    ]
    .concat();
    let mut header = 3u32.to_le_bytes().to_vec();
    header.extend_from_slice(&[1, 2]);
    header.extend(children);
    let file = [asf_object(ASF_HEADER, &header), asf_object(ASF_DATA, &[0; 26])].concat();

    let parsed = parse(file, &ParseConfig::default());
    assert_eq!(parsed.format, Some(ContainerFormat::Asf));
    assert!(!parsed.is_possibly_corrupt(), "{:?}", parsed.ledger);
    let props = parsed.properties.unwrap();
    assert_eq!(props.duration(), Duration::from_secs(2));
    assert_eq!(props.codecs(), [Codec::WmaV2]);
    assert_eq!(props.sample_rate(), 44100);
    assert_eq!(props.channels(), 2);
    assert_eq!(props.bitrate(), 128);
}

// ============================================================================
// Ogg
// ============================================================================

const OGG_CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::Algorithm {
    width: 32,
    poly: 0x04c1_1db7,
    init: 0,
    refin: false,
    refout: false,
    xorout: 0,
    check: 0x89a1_897f,
    residue: 0,
});

fn ogg_page(flags: u8, granule: u64, sequence: u32, lacing: &[u8], body: &[u8]) -> Vec<u8> {
    let mut out = b"OggS\0".to_vec();
    out.push(flags);
    out.extend_from_slice(&granule.to_le_bytes());
    out.extend_from_slice(&0x5EED_u32.to_le_bytes());
    out.extend_from_slice(&sequence.to_le_bytes());
    out.extend_from_slice(&[0; 4]);
    out.push(lacing.len() as u8);
    out.extend_from_slice(lacing);
    out.extend_from_slice(body);
    let crc = OGG_CRC.checksum(&out);
    out[22..26].copy_from_slice(&crc.to_le_bytes());
    out
}

/// A Vorbis identification packet padded to 300 bytes.
fn vorbis_identification(channels: u8, rate: u32, nominal: i32) -> Vec<u8> {
    let mut out = b"\x01vorbis".to_vec();
    out.extend_from_slice(&0u32.to_le_bytes());
    out.push(channels);
    out.extend_from_slice(&rate.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&nominal.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&[0xB8, 0x01]);
    out.resize(300, 0);
    out
}

fn ogg_vorbis() -> Vec<u8> {
    let id = vorbis_identification(2, 44100, 128_000);
    [
        ogg_page(0x02, u64::MAX, 0, &[255], &id[..255]),
        ogg_page(0x01, 0, 1, &[45], &id[255..]),
        ogg_page(0x00, 44100, 2, &[4], &[0; 4]),
        ogg_page(0x04, 88200, 3, &[4], &[0; 4]),
    ]
    .concat()
}

#[test]
fn ogg_split_identification_header() {
    let parsed = parse(ogg_vorbis(), &ParseConfig::default());
    assert_eq!(parsed.format, Some(ContainerFormat::Ogg));
    assert!(!parsed.is_possibly_corrupt(), "{:?}", parsed.ledger);
    let props = parsed.properties.unwrap();
    assert_eq!(props.codecs(), [Codec::Vorbis]);
    assert_eq!(props.duration(), Duration::from_secs(2));
    assert_eq!(props.sample_rate(), 44100);
    assert_eq!(props.channels(), 2);
    assert_eq!(props.bitrate(), 128);
}

#[test]
fn ogg_accurate_catches_bad_checksums() {
    let mut file = ogg_vorbis();
    let last = file.len() - 1;
    file[last] ^= 0xFF;

    let average = parse(file.clone(), &ParseConfig::default());
    // The damaged last page is skipped, so the granule before it is used
    assert_eq!(average.properties.unwrap().duration(), Duration::from_secs(1));

    let accurate = parse(file, &ParseConfig::default().with_read_style(ReadStyle::Accurate));
    assert_eq!(accurate.ledger.len(), 1);
    assert_eq!(accurate.properties.unwrap().duration(), Duration::from_secs(2));
}

#[test]
fn ogg_packet_size_limit() {
    let parsed = parse(ogg_vorbis(), &ParseConfig::default().with_max_packet_size(256));
    assert_eq!(parsed.ledger.len(), 1);
    assert!(parsed.properties.unwrap().codecs().is_empty());
}

// ============================================================================
// RIFF
// ============================================================================

fn riff_chunk(id: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = id.to_vec();
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    if payload.len() % 2 == 1 {
        out.push(0);
    }
    out
}

fn wave(data_len: usize) -> Vec<u8> {
    let mut fmt = 1u16.to_le_bytes().to_vec();
    fmt.extend_from_slice(&1u16.to_le_bytes());
    fmt.extend_from_slice(&8000u32.to_le_bytes());
    fmt.extend_from_slice(&8000u32.to_le_bytes());
    fmt.extend_from_slice(&1u16.to_le_bytes());
    fmt.extend_from_slice(&8u16.to_le_bytes());
    let mut body = b"WAVE".to_vec();
    body.extend(riff_chunk(b"fmt ", &fmt));
    body.extend(riff_chunk(b"data", &vec![0x80; data_len]));
    riff_chunk(b"RIFF", &body)
}

#[test]
fn riff_wave_pcm() {
    let parsed = parse(wave(4000), &ParseConfig::default());
    assert_eq!(parsed.format, Some(ContainerFormat::Riff));
    assert!(!parsed.is_possibly_corrupt());
    let props = parsed.properties.unwrap();
    assert_eq!(props.codecs(), [Codec::Pcm]);
    assert_eq!(props.duration(), Duration::from_millis(500));
    assert_eq!(props.sample_rate(), 8000);
    assert_eq!(props.channels(), 1);
    assert_eq!(props.bits_per_sample(), 8);
    assert_eq!(props.bitrate(), 64);
}

#[test]
fn riff_wave_cut_short() {
    let mut file = wave(4000);
    file.truncate(file.len() - 2000);
    let parsed = parse(file, &ParseConfig::default());
    // The RIFF chunk and the data chunk both overrun the file
    assert_eq!(parsed.ledger.len(), 2, "{:?}", parsed.ledger);
    let props = parsed.properties.unwrap();
    assert_eq!(props.sample_rate(), 8000);
    // 2000 of the 4000 data bytes at 8000 bytes per second
    assert_eq!(props.duration(), Duration::from_millis(250));
}

// ============================================================================
// Detection and cancellation
// ============================================================================

#[test]
fn unknown_signature() {
    let id3 = parse(b"ID3\x04\0\0\0\0\0\0 not a container".to_vec(), &ParseConfig::default());
    assert_eq!(id3.format, None);
    assert!(id3.properties.is_none());
    assert_eq!(id3.ledger.len(), 1);

    let empty = parse(Vec::new(), &ParseConfig::default());
    assert_eq!(empty.format, None);
}

#[test]
fn detect_format_from_prefix() {
    assert_eq!(mediaprops::detect_format(&ftyp()), Some(ContainerFormat::Mp4));
    assert_eq!(mediaprops::detect_format(&mkv(None)[..16]), Some(ContainerFormat::Matroska));
    assert_eq!(mediaprops::detect_format(&ogg_vorbis()), Some(ContainerFormat::Ogg));
    assert_eq!(mediaprops::detect_format(&wave(2)), Some(ContainerFormat::Riff));
    assert_eq!(mediaprops::detect_format(b"fLaC"), None);
}

#[test]
fn read_as_named_format() {
    init_logger();
    let parsed =
        mediaprops::read_properties_as(&mut Cursor::new(wave(4000)), ContainerFormat::Riff, &ParseConfig::default(), &Unstoppable)
            .unwrap();
    assert_eq!(parsed.properties.unwrap().sample_rate(), 8000);
}

#[test]
fn cancellation() {
    init_logger();
    let files = [[ftyp(), m4a_moov()].concat(), mkv(None), ogg_vorbis(), wave(16)];
    for file in files {
        let result = mediaprops::read_properties(&mut Cursor::new(file), &ParseConfig::default(), &ImmediatelyCancelled);
        assert!(matches!(result, Err(Error::Stopped(StopReason::Cancelled))), "{result:?}");
    }
}

#[test]
fn unlimited_config() {
    let config = ParseConfig::unlimited().with_read_style(ReadStyle::Accurate);
    assert_eq!(config.max_elements, None);
    let parsed = parse(mkv(None), &config);
    check_opus(parsed);
}
