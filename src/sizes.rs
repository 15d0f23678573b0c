// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Length and identifier field codecs for every supported container.
//!
//! Decoders work on byte slices and return the decoded value together with
//! the number of bytes it occupied, so callers can advance their own cursor.

use crate::{Error, Result};
use arrayvec::ArrayVec;

/// Widest EBML element identifier, in bytes.
pub const EBML_MAX_ID_WIDTH: usize = 4;
/// Widest EBML data size, in bytes.
pub const EBML_MAX_SIZE_WIDTH: usize = 8;

/// A decoded EBML data size.
///
/// The reserved all-ones pattern of any width means the element runs until
/// the end of whatever contains it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EbmlSize {
    Known(u64),
    Unknown,
}

/// Width of an EBML variable-length integer, from its first byte.
///
/// The width is one more than the number of leading zero bits; a zero first
/// byte would need more than 8 bytes and is never valid.
pub fn ebml_vint_width(first: u8) -> Option<usize> {
    match first.leading_zeros() {
        8 => None,
        n => Some(n as usize + 1),
    }
}

/// Decode an EBML element id. The marker bit is kept as part of the id.
pub fn decode_ebml_id(bytes: &[u8]) -> Result<(u32, usize)> {
    let first = *bytes.first().ok_or(Error::UnexpectedEOF)?;
    let width = ebml_vint_width(first).ok_or(Error::InvalidData("invalid EBML id marker"))?;
    if width > EBML_MAX_ID_WIDTH {
        return Err(Error::InvalidData("EBML id wider than 4 bytes"));
    }
    let raw = bytes.get(..width).ok_or(Error::UnexpectedEOF)?;
    let id = raw.iter().fold(0u32, |acc, &b| acc << 8 | u32::from(b));
    Ok((id, width))
}

/// Decode an EBML data size, stripping the marker bit.
pub fn decode_ebml_size(bytes: &[u8]) -> Result<(EbmlSize, usize)> {
    let first = *bytes.first().ok_or(Error::UnexpectedEOF)?;
    let width = ebml_vint_width(first).ok_or(Error::InvalidData("EBML size wider than 8 bytes"))?;
    let raw = bytes.get(..width).ok_or(Error::UnexpectedEOF)?;

    let mask = 0xFFu8.checked_shr(width as u32).unwrap_or(0);
    let value = raw[1..]
        .iter()
        .fold(u64::from(first & mask), |acc, &b| acc << 8 | u64::from(b));

    if value == ebml_max_value(width) {
        return Ok((EbmlSize::Unknown, width));
    }
    Ok((EbmlSize::Known(value), width))
}

/// Largest value representable in a size vint of `width` bytes. It is also
/// the reserved "unknown size" pattern for that width.
const fn ebml_max_value(width: usize) -> u64 {
    (1u64 << (7 * width)) - 1
}

/// Smallest width that can carry `value` as a known EBML size.
pub fn ebml_size_width(value: u64) -> Result<usize> {
    (1..=EBML_MAX_SIZE_WIDTH)
        .find(|&w| value < ebml_max_value(w))
        .ok_or(Error::Unsupported("value too large for an EBML size"))
}

/// Encode a known EBML size in its canonical (shortest) width.
pub fn encode_ebml_size(value: u64) -> Result<ArrayVec<u8, EBML_MAX_SIZE_WIDTH>> {
    encode_ebml_size_with_width(value, ebml_size_width(value)?)
}

/// Encode a known EBML size using exactly `width` bytes.
pub fn encode_ebml_size_with_width(value: u64, width: usize) -> Result<ArrayVec<u8, EBML_MAX_SIZE_WIDTH>> {
    if !(1..=EBML_MAX_SIZE_WIDTH).contains(&width) {
        return Err(Error::InvalidData("EBML size width out of range"));
    }
    if value >= ebml_max_value(width) {
        return Err(Error::InvalidData("value does not fit the requested EBML width"));
    }
    let marked = value | 1u64 << (7 * width);
    Ok(marked.to_be_bytes()[8 - width..].iter().copied().collect())
}

/// Encode the reserved "unknown size" pattern of the given width.
pub fn encode_ebml_unknown_size(width: usize) -> Result<ArrayVec<u8, EBML_MAX_SIZE_WIDTH>> {
    if !(1..=EBML_MAX_SIZE_WIDTH).contains(&width) {
        return Err(Error::InvalidData("EBML size width out of range"));
    }
    let marked = ebml_max_value(width) | 1u64 << (7 * width);
    Ok(marked.to_be_bytes()[8 - width..].iter().copied().collect())
}

/// Render an EBML id back to its bytes. Ids carry their own marker bit, so
/// the width is fixed by the id itself.
pub fn encode_ebml_id(id: u32) -> Result<ArrayVec<u8, EBML_MAX_ID_WIDTH>> {
    let bytes = id.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    let out: ArrayVec<u8, EBML_MAX_ID_WIDTH> = bytes[skip.min(3)..].iter().copied().collect();
    match decode_ebml_id(&out) {
        Ok((decoded, width)) if decoded == id && width == out.len() => Ok(out),
        _ => Err(Error::InvalidData("not a valid EBML id")),
    }
}

/// The 32-bit size field of an ISO-BMFF box header.
///
/// See ISO 14496-12:2015 § 4.2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxSize {
    /// The total box size, header included.
    Compact(u64),
    /// The real size follows the type as a 64-bit field.
    Extended,
    /// The box extends to the end of its container (normally the file).
    ToEnd,
}

pub fn decode_box_size(size32: u32) -> BoxSize {
    match size32 {
        0 => BoxSize::ToEnd,
        1 => BoxSize::Extended,
        n => BoxSize::Compact(u64::from(n)),
    }
}

/// Render a total box size as the 32-bit field plus the optional 64-bit one.
pub fn encode_box_size(total: u64) -> (u32, Option<u64>) {
    match u32::try_from(total) {
        Ok(n) if n > 1 => (n, None),
        _ => (1, Some(total)),
    }
}

/// ASF object sizes are plain 64-bit little-endian integers covering the
/// 24-byte GUID + size header.
pub fn decode_asf_size(bytes: &[u8]) -> Result<u64> {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes.get(..8).ok_or(Error::UnexpectedEOF)?);
    Ok(u64::from_le_bytes(raw))
}

pub fn encode_asf_size(total: u64) -> [u8; 8] {
    total.to_le_bytes()
}

/// Expandable size field of an MPEG-4 descriptor: up to four bytes, seven
/// value bits each, high bit set on every byte but the last.
///
/// See ISO 14496-1:2010 § 8.3.3
pub fn decode_descriptor_size(bytes: &[u8]) -> Result<(u32, usize)> {
    let mut value = 0u32;
    for (i, &b) in bytes.iter().take(4).enumerate() {
        value = value << 7 | u32::from(b & 0x7F);
        if b & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    if bytes.len() < 4 {
        Err(Error::UnexpectedEOF)
    } else {
        Err(Error::InvalidData("descriptor size wider than 4 bytes"))
    }
}

/// One packet (or packet fragment) described by an Ogg segment table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LacedPacket {
    pub len: usize,
    /// False when the last lacing value was 255, i.e. the packet carries on
    /// in the next page.
    pub complete: bool,
}

/// Iterator over the packets described by an Ogg segment table.
pub struct LacingPackets<'a> {
    values: &'a [u8],
}

impl Iterator for LacingPackets<'_> {
    type Item = LacedPacket;

    fn next(&mut self) -> Option<LacedPacket> {
        if self.values.is_empty() {
            return None;
        }
        let mut len = 0usize;
        for (i, &v) in self.values.iter().enumerate() {
            len += usize::from(v);
            if v < 255 {
                self.values = &self.values[i + 1..];
                return Some(LacedPacket { len, complete: true });
            }
        }
        self.values = &[];
        Some(LacedPacket { len, complete: false })
    }
}

/// Split a segment table into packet lengths.
pub fn packet_lengths(lacing: &[u8]) -> LacingPackets<'_> {
    LacingPackets { values: lacing }
}

/// Build the segment table for packets laid out on one page.
///
/// Every packet that ends on this page is terminated by a lacing value below
/// 255, so a packet whose length is a multiple of 255 gets a trailing zero.
/// When `last_continues` is set, the final packet carries on in the next
/// page and gets no terminator.
pub fn lacing_values(packet_lens: &[usize], last_continues: bool) -> Result<ArrayVec<u8, 255>> {
    let mut out = ArrayVec::new();
    for (i, &len) in packet_lens.iter().enumerate() {
        for _ in 0..len / 255 {
            out.try_push(255).map_err(|_| Error::InvalidData("too many lacing values for one page"))?;
        }
        let is_last = i + 1 == packet_lens.len();
        if is_last && last_continues {
            if len % 255 != 0 {
                return Err(Error::InvalidData("a continued packet must fill whole segments"));
            }
            continue;
        }
        out.try_push((len % 255) as u8)
            .map_err(|_| Error::InvalidData("too many lacing values for one page"))?;
    }
    Ok(out)
}

#[test]
fn ebml_size_round_trip_canonical() {
    for width in 1..=EBML_MAX_SIZE_WIDTH {
        for value in [0, 1, ebml_max_value(width) - 1, ebml_max_value(width) / 2] {
            let encoded = encode_ebml_size_with_width(value, width).unwrap();
            assert_eq!(encoded.len(), width);
            let (decoded, used) = decode_ebml_size(&encoded).unwrap();
            assert_eq!(decoded, EbmlSize::Known(value));
            assert_eq!(used, width);

            let canonical = encode_ebml_size(value).unwrap();
            assert!(canonical.len() <= width);
            assert_eq!(decode_ebml_size(&canonical).unwrap().0, EbmlSize::Known(value));
            if canonical.len() == width {
                assert_eq!(canonical, encoded);
            }
        }
    }
}

#[test]
fn ebml_unknown_size_every_width() {
    for width in 1..=EBML_MAX_SIZE_WIDTH {
        let encoded = encode_ebml_unknown_size(width).unwrap();
        assert_eq!(decode_ebml_size(&encoded).unwrap(), (EbmlSize::Unknown, width));
    }
    assert_eq!(decode_ebml_size(&[0xFF]).unwrap(), (EbmlSize::Unknown, 1));
    assert_eq!(decode_ebml_size(&[0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]).unwrap().0, EbmlSize::Unknown);
}

#[test]
fn ebml_widths_rejected() {
    assert!(decode_ebml_size(&[0x00, 1, 2, 3, 4, 5, 6, 7, 8]).is_err());
    assert!(matches!(decode_ebml_id(&[0x08, 0, 0, 0, 0]), Err(Error::InvalidData(_))));
    assert!(matches!(decode_ebml_id(&[0x1A, 0x45]), Err(Error::UnexpectedEOF)));
    assert_eq!(decode_ebml_id(&[0x1A, 0x45, 0xDF, 0xA3]).unwrap(), (0x1A45_DFA3, 4));
    assert_eq!(decode_ebml_id(&[0xEC]).unwrap(), (0xEC, 1));
}

#[test]
fn ebml_id_render() {
    for id in [0x1A45_DFA3u32, 0x1853_8067, 0x4DBB, 0x53AB, 0xEC, 0x2AD7B1] {
        let bytes = encode_ebml_id(id).unwrap();
        assert_eq!(decode_ebml_id(&bytes).unwrap(), (id, bytes.len()));
    }
    assert!(encode_ebml_id(0x0000_1234).is_err());
}

#[test]
fn box_sizes() {
    assert_eq!(decode_box_size(0), BoxSize::ToEnd);
    assert_eq!(decode_box_size(1), BoxSize::Extended);
    assert_eq!(decode_box_size(24), BoxSize::Compact(24));
    assert_eq!(encode_box_size(24), (24, None));
    assert_eq!(encode_box_size(1 << 33), (1, Some(1 << 33)));
}

#[test]
fn descriptor_sizes() {
    assert_eq!(decode_descriptor_size(&[0x22]).unwrap(), (0x22, 1));
    assert_eq!(decode_descriptor_size(&[0x80, 0x80, 0x80, 0x22]).unwrap(), (0x22, 4));
    assert_eq!(decode_descriptor_size(&[0x81, 0x00]).unwrap(), (128, 2));
    assert!(decode_descriptor_size(&[0x80, 0x80, 0x80, 0x80, 0x01]).is_err());
}

#[test]
fn lacing_multiples_of_255_get_terminator() {
    for n in 1..=3usize {
        let sizes = [255 * n, 255 * n];
        let table = lacing_values(&sizes, false).unwrap();
        assert_eq!(table.len(), 2 * (n + 1));
        assert_eq!(table[n], 0);
        assert_eq!(*table.last().unwrap(), 0);

        let open = lacing_values(&sizes, true).unwrap();
        assert_eq!(open.len(), 2 * n + 1);
        assert_eq!(*open.last().unwrap(), 255);
    }
}

#[test]
fn lacing_split_back_into_packets() {
    let table = lacing_values(&[300, 0, 510], false).unwrap();
    let packets: std::vec::Vec<_> = packet_lengths(&table).collect();
    assert_eq!(packets, [
        LacedPacket { len: 300, complete: true },
        LacedPacket { len: 0, complete: true },
        LacedPacket { len: 510, complete: true },
    ]);

    let packets: std::vec::Vec<_> = packet_lengths(&[10, 255, 255]).collect();
    assert_eq!(packets, [LacedPacket { len: 10, complete: true }, LacedPacket { len: 510, complete: false }]);
}
