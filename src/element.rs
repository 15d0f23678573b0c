// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Element headers for the four tree-shaped containers, and the arena that
//! holds both read and predicted elements.

use crate::asf::Guid;
use crate::boxes::{BoxType, FourCC};
use crate::sizes::{self, BoxSize, EbmlSize};
use crate::source::{be_u32, be_u64, le_u32, Source};
use crate::{Error, Result, ToU64, TryVec};
use std::io::{Read, Seek};
use std::ops::Range;

/// What an element is, in its container's own vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TypeId {
    Ebml(u32),
    FourCC(FourCC),
    Guid(Guid),
}

/// A header that has been read from the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub type_id: TypeId,
    pub header_offset: u64,
    pub data_offset: u64,
    pub data_size: u64,
    /// Where the next sibling starts. Past the data end only for RIFF pad bytes.
    pub end_offset: u64,
    /// The size field said "until the end of the parent".
    pub unknown_size: bool,
}

impl Header {
    pub(crate) fn data_end(&self) -> u64 {
        self.data_offset + self.data_size
    }

    pub(crate) fn data_range(&self) -> Range<u64> {
        self.data_offset..self.data_end()
    }

    pub(crate) fn ebml_id(&self) -> Option<u32> {
        match self.type_id {
            TypeId::Ebml(id) => Some(id),
            _ => None,
        }
    }

    pub(crate) fn fourcc(&self) -> Option<FourCC> {
        match self.type_id {
            TypeId::FourCC(fourcc) => Some(fourcc),
            _ => None,
        }
    }

    pub(crate) fn box_type(&self) -> BoxType {
        match self.type_id {
            TypeId::FourCC(fourcc) => fourcc.into(),
            _ => BoxType::UnknownBox(0),
        }
    }

    pub(crate) fn guid(&self) -> Option<Guid> {
        match self.type_id {
            TypeId::Guid(guid) => Some(guid),
            _ => None,
        }
    }
}

/// Header layouts of the length-prefixed container families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dialect {
    /// vint id + vint size
    Ebml,
    /// 32-bit big-endian size + fourcc, optional 64-bit size.
    /// See ISO 14496-12:2015 § 4.2
    Bmff,
    /// 16-byte GUID + 64-bit little-endian size covering the header
    Asf,
    /// fourcc + 32-bit little-endian size, data padded to an even length
    Riff,
}

impl Dialect {
    /// Read the header at `offset` of an element that must end by `bound`.
    ///
    /// Sizes meaning "until the end of the container" resolve against
    /// `bound`. A header cut short by the end of the source is
    /// `UnexpectedEOF`; a size reaching past `bound` is `OutOfBounds`.
    pub(crate) fn read_header<R: Read + Seek>(self, src: &mut Source<'_, R>, offset: u64, bound: u64) -> Result<Header> {
        self.read_header_inner(src, offset, bound, false).map(|(header, _)| header)
    }

    /// Like [`Dialect::read_header`], but a size reaching past `bound` is cut
    /// down to it. The flag is set when that happened.
    pub(crate) fn read_header_clamped<R: Read + Seek>(
        self,
        src: &mut Source<'_, R>,
        offset: u64,
        bound: u64,
    ) -> Result<(Header, bool)> {
        self.read_header_inner(src, offset, bound, true)
    }

    fn read_header_inner<R: Read + Seek>(
        self,
        src: &mut Source<'_, R>,
        offset: u64,
        bound: u64,
        clamp: bool,
    ) -> Result<(Header, bool)> {
        let bound = bound.min(src.len());
        src.seek(offset)?;
        let (type_id, header_width, declared) = match self {
            Self::Ebml => {
                let mut buf = [0u8; sizes::EBML_MAX_ID_WIDTH + sizes::EBML_MAX_SIZE_WIDTH];
                let available = src.remaining().min(buf.len().to_u64()) as usize;
                src.read_exact(&mut buf[..available])?;
                let (id, id_width) = sizes::decode_ebml_id(&buf[..available])?;
                let (size, size_width) = sizes::decode_ebml_size(&buf[id_width..available])?;
                let declared = match size {
                    EbmlSize::Known(size) => Some(size),
                    EbmlSize::Unknown => None,
                };
                (TypeId::Ebml(id), (id_width + size_width).to_u64(), declared)
            },
            Self::Bmff => {
                let size32 = be_u32(src)?;
                let fourcc = FourCC::from(be_u32(src)?);
                match sizes::decode_box_size(size32) {
                    BoxSize::Compact(total) if total < 8 => return Err(Error::InvalidData("malformed size")),
                    BoxSize::Compact(total) => (TypeId::FourCC(fourcc), 8, Some(total - 8)),
                    BoxSize::Extended => {
                        let total = be_u64(src)?;
                        if total < 16 {
                            return Err(Error::InvalidData("malformed wide size"));
                        }
                        (TypeId::FourCC(fourcc), 16, Some(total - 16))
                    },
                    BoxSize::ToEnd => (TypeId::FourCC(fourcc), 8, None),
                }
            },
            Self::Asf => {
                let guid = Guid::from_bytes(src.read_array()?);
                let total = sizes::decode_asf_size(&src.read_array::<8>()?)?;
                if total < 24 {
                    return Err(Error::InvalidData("object smaller than its header"));
                }
                (TypeId::Guid(guid), 24, Some(total - 24))
            },
            Self::Riff => {
                let fourcc = FourCC::from(src.read_array::<4>()?);
                let size = le_u32(src)?;
                (TypeId::FourCC(fourcc), 8, Some(u64::from(size)))
            },
        };

        let data_offset = offset + header_width;
        if data_offset > bound {
            return Err(Error::OutOfBounds("element header crosses its container"));
        }
        let mut clamped = false;
        let data_size = match declared {
            Some(size) if size > bound - data_offset => {
                if !clamp {
                    return Err(Error::OutOfBounds("element size exceeds its container"));
                }
                clamped = true;
                bound - data_offset
            },
            Some(size) => size,
            None => bound - data_offset,
        };
        let data_end = data_offset + data_size;
        let end_offset = match self {
            Self::Riff if data_size % 2 == 1 => (data_end + 1).min(bound),
            _ => data_end,
        };
        let header = Header {
            type_id,
            header_offset: offset,
            data_offset,
            data_size,
            end_offset,
            unknown_size: declared.is_none(),
        };
        Ok((header, clamped))
    }
}

/// Index of an element in its [`ElementArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ElementIndex(usize);

/// Either a header read from the source, or what an index claims is there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ElementState {
    Unmaterialized {
        predicted: TypeId,
        predicted_size: Option<u64>,
    },
    Materialized(Header),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Element {
    pub offset: u64,
    pub parent: Option<ElementIndex>,
    pub state: ElementState,
}

impl Element {
    pub(crate) fn type_id(&self) -> TypeId {
        match self.state {
            ElementState::Unmaterialized { predicted, .. } => predicted,
            ElementState::Materialized(header) => header.type_id,
        }
    }

    pub(crate) fn header(&self) -> Option<&Header> {
        match &self.state {
            ElementState::Materialized(header) => Some(header),
            ElementState::Unmaterialized { .. } => None,
        }
    }
}

/// Flat storage for elements; parents are referred to by index.
#[derive(Debug, Default)]
pub(crate) struct ElementArena {
    elements: TryVec<Element>,
}

impl ElementArena {
    pub(crate) fn get(&self, index: ElementIndex) -> Option<&Element> {
        self.elements.get(index.0)
    }

    fn push(&mut self, element: Element) -> Result<ElementIndex> {
        let index = ElementIndex(self.elements.len());
        self.elements.push(element)?;
        Ok(index)
    }

    pub(crate) fn push_materialized(&mut self, parent: Option<ElementIndex>, header: Header) -> Result<ElementIndex> {
        self.push(Element {
            offset: header.header_offset,
            parent,
            state: ElementState::Materialized(header),
        })
    }

    /// Record a placeholder for an element known only from an index.
    pub(crate) fn as_abstract(
        &mut self,
        parent: Option<ElementIndex>,
        offset: u64,
        predicted: TypeId,
        predicted_size: Option<u64>,
    ) -> Result<ElementIndex> {
        self.push(Element {
            offset,
            parent,
            state: ElementState::Unmaterialized { predicted, predicted_size },
        })
    }

    /// Read the header of a placeholder and check it against the prediction.
    ///
    /// The element must fit inside its parent's data. Already materialized
    /// elements are returned as they are.
    pub(crate) fn materialize<R: Read + Seek>(
        &mut self,
        index: ElementIndex,
        dialect: Dialect,
        src: &mut Source<'_, R>,
    ) -> Result<Header> {
        let element = *self.get(index).ok_or(Error::Inconsistent("no such element"))?;
        let (predicted, predicted_size) = match element.state {
            ElementState::Materialized(header) => return Ok(header),
            ElementState::Unmaterialized { predicted, predicted_size } => (predicted, predicted_size),
        };
        let bound = element
            .parent
            .and_then(|p| self.get(p))
            .and_then(Element::header)
            .map_or(src.len(), Header::data_end);
        let header = dialect.read_header(src, element.offset, bound)?;
        if header.type_id != predicted {
            return Err(Error::Inconsistent("indexed element has a different id"));
        }
        if predicted_size.is_some_and(|size| size != header.data_size) {
            return Err(Error::Inconsistent("indexed element has a different size"));
        }
        if let Some(slot) = self.elements.get_mut(index.0) {
            slot.state = ElementState::Materialized(header);
        }
        Ok(header)
    }
}

/// Read the payload of an element, up to `limit` bytes of it.
pub(crate) fn read_payload<R: Read + Seek>(src: &mut Source<'_, R>, header: &Header, limit: u64) -> Result<TryVec<u8>> {
    src.read_prefix_at(header.data_offset, header.data_size, limit)
}

#[cfg(test)]
fn source_over(bytes: &[u8]) -> std::io::Cursor<std::vec::Vec<u8>> {
    std::io::Cursor::new(bytes.to_vec())
}

#[test]
fn ebml_header_widths() {
    // Segment id, 1-byte size of 2, then two payload bytes
    let mut cursor = source_over(&[0x18, 0x53, 0x80, 0x67, 0x82, 0xAA, 0xBB]);
    let mut src = Source::new(&mut cursor).unwrap();
    let header = Dialect::Ebml.read_header(&mut src, 0, u64::MAX).unwrap();
    assert_eq!(header.ebml_id(), Some(0x1853_8067));
    assert_eq!((header.data_offset, header.data_size, header.end_offset), (5, 2, 7));
    assert!(!header.unknown_size);
}

#[test]
fn ebml_unknown_size_resolves_to_bound() {
    let mut cursor = source_over(&[0x1F, 0x43, 0xB6, 0x75, 0xFF, 1, 2, 3, 4, 5]);
    let mut src = Source::new(&mut cursor).unwrap();
    let header = Dialect::Ebml.read_header(&mut src, 0, 8).unwrap();
    assert!(header.unknown_size);
    assert_eq!(header.data_range(), 5..8);
}

#[test]
fn oversized_elements_are_out_of_bounds() {
    let mut cursor = source_over(b"\0\0\0\x20moov\0\0\0\0");
    let mut src = Source::new(&mut cursor).unwrap();
    assert!(matches!(Dialect::Bmff.read_header(&mut src, 0, u64::MAX), Err(Error::OutOfBounds(_))));
    assert!(matches!(Dialect::Bmff.read_header(&mut src, 8, u64::MAX), Err(Error::UnexpectedEOF)));
}

#[test]
fn clamped_header_keeps_what_is_there() {
    let mut cursor = source_over(&[0x18, 0x53, 0x80, 0x67, 0x90, 1, 2, 3]);
    let mut src = Source::new(&mut cursor).unwrap();
    assert!(Dialect::Ebml.read_header(&mut src, 0, u64::MAX).is_err());
    let (header, clamped) = Dialect::Ebml.read_header_clamped(&mut src, 0, u64::MAX).unwrap();
    assert!(clamped);
    assert_eq!(header.data_range(), 5..8);
}

#[test]
fn bmff_extended_and_to_end_sizes() {
    let mut bytes = b"\0\0\0\x01mdat\0\0\0\0\0\0\0\x12".to_vec();
    bytes.extend_from_slice(&[0; 2]);
    bytes.extend_from_slice(b"\0\0\0\0free1234");
    let mut cursor = std::io::Cursor::new(bytes);
    let mut src = Source::new(&mut cursor).unwrap();
    let mdat = Dialect::Bmff.read_header(&mut src, 0, u64::MAX).unwrap();
    assert_eq!(mdat.box_type(), BoxType::MediaDataBox);
    assert_eq!((mdat.data_offset, mdat.end_offset), (16, 18));
    let free = Dialect::Bmff.read_header(&mut src, 18, u64::MAX).unwrap();
    assert!(free.unknown_size);
    assert_eq!(free.data_range(), 26..30);
}

#[test]
fn riff_pad_byte() {
    let mut cursor = source_over(b"abcd\x03\0\0\0xyz\0next");
    let mut src = Source::new(&mut cursor).unwrap();
    let header = Dialect::Riff.read_header(&mut src, 0, u64::MAX).unwrap();
    assert_eq!(header.fourcc(), Some(FourCC::new(b"abcd")));
    assert_eq!((header.data_size, header.end_offset), (3, 12));
}

#[test]
fn materialize_checks_prediction() {
    let mut cursor = source_over(&[0x15, 0x49, 0xA9, 0x66, 0x81, 0x00, 0xEC, 0x80]);
    let mut src = Source::new(&mut cursor).unwrap();
    let mut arena = ElementArena::default();
    let info = arena.as_abstract(None, 0, TypeId::Ebml(0x1549_A966), Some(1)).unwrap();
    let wrong = arena.as_abstract(None, 6, TypeId::Ebml(0x1654_AE6B), None).unwrap();
    let header = arena.materialize(info, Dialect::Ebml, &mut src).unwrap();
    assert_eq!(header.data_size, 1);
    assert!(arena.get(info).unwrap().header().is_some());
    assert!(matches!(arena.materialize(wrong, Dialect::Ebml, &mut src), Err(Error::Inconsistent(_))));
    assert_eq!(arena.get(wrong).unwrap().type_id(), TypeId::Ebml(0x1654_AE6B));
}
