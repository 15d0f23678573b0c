// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{Error, Result, ToU64, TryVec};
use byteorder::ReadBytesExt;
use std::io::{Read, Seek, SeekFrom};

/// Wraps the caller's seekable stream, tracking the current offset and the
/// total length so that no read can run past the end of the source.
pub(crate) struct Source<'a, R> {
    inner: &'a mut R,
    pos: u64,
    len: u64,
}

impl<'a, R: Read + Seek> Source<'a, R> {
    pub(crate) fn new(inner: &'a mut R) -> Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self { inner, pos: 0, len })
    }

    /// Total length of the source in bytes.
    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    /// Current absolute offset.
    pub(crate) fn tell(&self) -> u64 {
        self.pos
    }

    pub(crate) fn remaining(&self) -> u64 {
        self.len - self.pos
    }

    pub(crate) fn seek(&mut self, offset: u64) -> Result<()> {
        if offset > self.len {
            return Err(Error::OutOfBounds("seek past the end of the source"));
        }
        if offset != self.pos {
            self.inner.seek(SeekFrom::Start(offset))?;
            self.pos = offset;
        }
        Ok(())
    }

    pub(crate) fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Read `len` bytes into a fallibly allocated buffer.
    ///
    /// Fails with `UnexpectedEOF` before allocating anything when fewer than
    /// `len` bytes remain.
    pub(crate) fn read_try_vec(&mut self, len: u64) -> Result<TryVec<u8>> {
        if len > self.remaining() {
            return Err(Error::UnexpectedEOF);
        }
        let mut vec = std::vec::Vec::new();
        vec.try_reserve_exact(usize::try_from(len)?).map_err(|_| Error::OutOfMemory)?;
        (&mut *self).take(len).read_to_end(&mut vec)?;
        if vec.len().to_u64() != len {
            return Err(Error::UnexpectedEOF);
        }
        Ok(vec.into())
    }

    /// Read at most `limit` bytes of the `len` bytes starting at `offset`.
    pub(crate) fn read_prefix_at(&mut self, offset: u64, len: u64, limit: u64) -> Result<TryVec<u8>> {
        self.seek(offset)?;
        self.read_try_vec(len.min(limit))
    }
}

impl<R: Read> Read for Source<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let left = usize::try_from(self.len - self.pos).unwrap_or(usize::MAX);
        let max = buf.len().min(left);
        let bytes_read = self.inner.read(&mut buf[..max])?;
        self.pos += bytes_read.to_u64();
        Ok(bytes_read)
    }
}

pub(crate) fn be_u16<T: ReadBytesExt>(src: &mut T) -> Result<u16> {
    src.read_u16::<byteorder::BigEndian>().map_err(From::from)
}

pub(crate) fn be_u32<T: ReadBytesExt>(src: &mut T) -> Result<u32> {
    src.read_u32::<byteorder::BigEndian>().map_err(From::from)
}

pub(crate) fn be_u64<T: ReadBytesExt>(src: &mut T) -> Result<u64> {
    src.read_u64::<byteorder::BigEndian>().map_err(From::from)
}

pub(crate) fn be_f64<T: ReadBytesExt>(src: &mut T) -> Result<f64> {
    src.read_f64::<byteorder::BigEndian>().map_err(From::from)
}

pub(crate) fn le_u16<T: ReadBytesExt>(src: &mut T) -> Result<u16> {
    src.read_u16::<byteorder::LittleEndian>().map_err(From::from)
}

pub(crate) fn le_u32<T: ReadBytesExt>(src: &mut T) -> Result<u32> {
    src.read_u32::<byteorder::LittleEndian>().map_err(From::from)
}

pub(crate) fn le_i32<T: ReadBytesExt>(src: &mut T) -> Result<i32> {
    src.read_i32::<byteorder::LittleEndian>().map_err(From::from)
}

pub(crate) fn le_u64<T: ReadBytesExt>(src: &mut T) -> Result<u64> {
    src.read_u64::<byteorder::LittleEndian>().map_err(From::from)
}

/// Skip a number of bytes of an in-memory reader.
pub(crate) fn skip_slice(src: &mut &[u8], bytes: usize) -> Result<()> {
    *src = src.get(bytes..).ok_or(Error::UnexpectedEOF)?;
    Ok(())
}

#[test]
fn source_never_reads_past_end() {
    let mut cursor = std::io::Cursor::new(b"0123456789".to_vec());
    let mut src = Source::new(&mut cursor).unwrap();
    assert_eq!(src.len(), 10);
    src.seek(8).unwrap();
    assert!(matches!(src.read_array::<4>(), Err(Error::UnexpectedEOF)));
    assert!(matches!(src.seek(11), Err(Error::OutOfBounds(_))));
    src.seek(2).unwrap();
    assert!(matches!(src.read_try_vec(9), Err(Error::UnexpectedEOF)));
    assert_eq!(src.read_try_vec(3).unwrap(), b"234".as_ref());
    assert_eq!(src.tell(), 5);
}
