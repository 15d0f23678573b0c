// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ogg page headers. See RFC 3533 § 6.

use crate::sizes::{packet_lengths, LacingPackets};
use crate::source::{le_u32, le_u64, Source};
use crate::{Error, Result, ToU64};
use arrayvec::ArrayVec;
use bitflags::bitflags;
use byteorder::ReadBytesExt;
use crc::{Algorithm, Crc};
use std::io::{Read, Seek};

pub(crate) const CAPTURE: [u8; 4] = *b"OggS";

/// Capture pattern through segment count.
const FIXED_HEADER_LEN: usize = 27;

/// CRC-32 with polynomial 0x04c11db7, no reflection, zero initial value and
/// no final xor.
const OGG_CRC_ALGORITHM: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x04c1_1db7,
    init: 0,
    refin: false,
    refout: false,
    xorout: 0,
    check: 0x89a1_897f,
    residue: 0,
};
const PAGE_CRC: Crc<u32> = Crc::<u32>::new(&OGG_CRC_ALGORITHM);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct PageFlags: u8 {
        /// The first packet carries on from the previous page of the stream.
        const CONTINUED = 1;
        const FIRST = 1 << 1;
        const LAST = 1 << 2;
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Page {
    pub offset: u64,
    pub flags: PageFlags,
    /// All ones when no packet ends on this page.
    pub granule: u64,
    pub serial: u32,
    pub sequence: u32,
    pub checksum: u32,
    pub lacing: ArrayVec<u8, 255>,
}

impl Page {
    pub(crate) fn header_len(&self) -> u64 {
        (FIXED_HEADER_LEN + self.lacing.len()).to_u64()
    }

    pub(crate) fn body_offset(&self) -> u64 {
        self.offset + self.header_len()
    }

    pub(crate) fn body_len(&self) -> u64 {
        self.lacing.iter().map(|&v| u64::from(v)).sum()
    }

    pub(crate) fn end_offset(&self) -> u64 {
        self.body_offset() + self.body_len()
    }

    pub(crate) fn continued(&self) -> bool {
        self.flags.contains(PageFlags::CONTINUED)
    }

    pub(crate) fn granule(&self) -> Option<u64> {
        (self.granule != u64::MAX).then_some(self.granule)
    }

    pub(crate) fn packets(&self) -> LacingPackets<'_> {
        packet_lengths(&self.lacing)
    }

    /// The fixed part of the header as written, checksum field zeroed.
    fn fixed_header(&self) -> [u8; FIXED_HEADER_LEN] {
        let mut out = [0u8; FIXED_HEADER_LEN];
        out[..4].copy_from_slice(&CAPTURE);
        out[5] = self.flags.bits();
        out[6..14].copy_from_slice(&self.granule.to_le_bytes());
        out[14..18].copy_from_slice(&self.serial.to_le_bytes());
        out[18..22].copy_from_slice(&self.sequence.to_le_bytes());
        out[26] = self.lacing.len() as u8;
        out
    }

    /// The checksum this page should carry for `body`.
    pub(crate) fn compute_checksum(&self, body: &[u8]) -> u32 {
        let mut digest = PAGE_CRC.digest();
        digest.update(&self.fixed_header());
        digest.update(&self.lacing);
        digest.update(body);
        digest.finalize()
    }
}

/// Read the page header at `offset`. The page body must lie inside the source.
pub(crate) fn read_page<R: Read + Seek>(src: &mut Source<'_, R>, offset: u64) -> Result<Page> {
    src.seek(offset)?;
    let fixed = src.read_array::<FIXED_HEADER_LEN>()?;
    if fixed[..4] != CAPTURE {
        return Err(Error::InvalidData("missing Ogg capture pattern"));
    }
    let mut data = &fixed[4..];
    if data.read_u8()? != 0 {
        return Err(Error::InvalidData("unknown Ogg page version"));
    }
    let flags = PageFlags::from_bits(data.read_u8()?).ok_or(Error::InvalidData("unknown Ogg page flags"))?;
    let granule = le_u64(&mut data)?;
    let serial = le_u32(&mut data)?;
    let sequence = le_u32(&mut data)?;
    let checksum = le_u32(&mut data)?;
    let segments = usize::from(data.read_u8()?);

    let mut table = [0u8; 255];
    src.read_exact(&mut table[..segments])?;
    let mut lacing = ArrayVec::new();
    lacing
        .try_extend_from_slice(&table[..segments])
        .map_err(|_| Error::InvalidData("too many lacing values"))?;

    let page = Page {
        offset,
        flags,
        granule,
        serial,
        sequence,
        checksum,
        lacing,
    };
    if page.end_offset() > src.len() {
        return Err(Error::OutOfBounds("Ogg page body past the end of the file"));
    }
    Ok(page)
}

/// Offset of the next capture pattern in `from..end`.
pub(crate) fn find_capture<R: Read + Seek>(src: &mut Source<'_, R>, from: u64, end: u64) -> Result<Option<u64>> {
    const CHUNK: usize = 4096;
    let end = end.min(src.len());
    let mut buf = [0u8; CHUNK];
    let mut offset = from;
    while end.saturating_sub(offset) >= CAPTURE.len().to_u64() {
        let n = (end - offset).min(CHUNK.to_u64()) as usize;
        src.seek(offset)?;
        src.read_exact(&mut buf[..n])?;
        if let Some(at) = buf[..n].windows(CAPTURE.len()).position(|w| w == CAPTURE) {
            return Ok(Some(offset + at.to_u64()));
        }
        // Keep the last three bytes in case the pattern straddles chunks
        offset += (n - (CAPTURE.len() - 1)).to_u64();
    }
    Ok(None)
}

#[cfg(test)]
pub(crate) fn build_page(flags: PageFlags, granule: u64, serial: u32, sequence: u32, lacing: &[u8], body: &[u8]) -> std::vec::Vec<u8> {
    let mut table = ArrayVec::new();
    table.try_extend_from_slice(lacing).unwrap();
    let page = Page {
        offset: 0,
        flags,
        granule,
        serial,
        sequence,
        checksum: 0,
        lacing: table,
    };
    let mut out = page.fixed_header().to_vec();
    out.extend_from_slice(&page.lacing);
    out[22..26].copy_from_slice(&page.compute_checksum(body).to_le_bytes());
    out.extend_from_slice(body);
    out
}

#[test]
fn crc_catalog_check() {
    assert_eq!(PAGE_CRC.checksum(b"123456789"), OGG_CRC_ALGORITHM.check);
}

#[test]
fn page_header_round_trip() {
    let bytes = build_page(PageFlags::FIRST, 0, 0x1234, 0, &[255, 10, 3], &[7; 268]);
    let mut cursor = std::io::Cursor::new(bytes);
    let mut src = Source::new(&mut cursor).unwrap();
    let page = read_page(&mut src, 0).unwrap();
    assert_eq!(page.serial, 0x1234);
    assert_eq!((page.header_len(), page.body_len(), page.end_offset()), (30, 268, 298));
    let lens: std::vec::Vec<_> = page.packets().map(|p| p.len).collect();
    assert_eq!(lens, [265, 3]);
    let body = src.read_try_vec(page.body_len()).unwrap();
    assert_eq!(page.compute_checksum(&body), page.checksum);
}

#[test]
fn capture_search_crosses_chunks() {
    let mut bytes = vec![0u8; 4094];
    bytes.extend_from_slice(b"OggS");
    let mut cursor = std::io::Cursor::new(bytes);
    let mut src = Source::new(&mut cursor).unwrap();
    assert_eq!(find_capture(&mut src, 0, u64::MAX).unwrap(), Some(4094));
    assert_eq!(find_capture(&mut src, 4095, u64::MAX).unwrap(), None);
    assert!(matches!(read_page(&mut src, 0), Err(Error::InvalidData(_))));
}
