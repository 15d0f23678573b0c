// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::element::{Dialect, Header, TypeId};
use crate::{Error, Result, Session};
use log::debug;
use std::io::{Read, Seek};
use std::ops::Range;

/// What the walker should do after visiting an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Action {
    /// Walk the children found in this range. It is clamped to the
    /// element's own data.
    Recurse(Range<u64>),
    Skip,
    /// End the whole walk.
    Stop,
}

/// How a walk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WalkEnd {
    /// Every requested range was covered.
    Exhausted,
    /// The visitor returned [`Action::Stop`].
    Stopped,
    /// Damage cut at least one level short; see the corruption ledger.
    Truncated,
}

/// One element as seen by a visitor.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Visit {
    pub header: Header,
    /// 0 for elements of the range the walk started with.
    pub depth: u32,
    pub parent_type: Option<TypeId>,
}

impl Visit {
    /// Recurse into the whole payload.
    pub(crate) fn children(&self) -> Action {
        Action::Recurse(self.header.data_range())
    }

    /// Recurse into the payload after a fixed-size prefix.
    pub(crate) fn children_after(&self, prefix: u64) -> Action {
        Action::Recurse(self.header.data_offset.saturating_add(prefix)..self.header.data_end())
    }
}

struct Frame {
    next: u64,
    end: u64,
    parent_type: Option<TypeId>,
}

/// Visit every element in `range` and, on request, their children.
///
/// Nesting is tracked with an explicit stack capped at
/// `ParseConfig::max_depth`. A header that cannot be read, or a visitor
/// error that is recoverable, is recorded in the corruption ledger and ends
/// the current level; the enclosing level carries on with its next sibling.
/// Unrecoverable errors, cancellation included, are returned.
///
/// Visited elements are not kept; a visitor that needs one later copies
/// its header.
pub(crate) fn walk<'a, R, F>(
    session: &mut Session<'a, R>,
    dialect: Dialect,
    parent_type: Option<TypeId>,
    range: Range<u64>,
    visitor: F,
) -> Result<WalkEnd>
where
    R: Read + Seek,
    F: FnMut(&mut Session<'a, R>, &Visit) -> Result<Action>,
{
    walk_inner(session, dialect, parent_type, range, false, visitor)
}

/// Like [`walk`], but an element whose size reaches past its container is
/// recorded in the ledger and visited with the size cut down to what is
/// there. For formats whose payload size is itself a property, such as the
/// WAVE `data` chunk.
pub(crate) fn walk_clamped<'a, R, F>(
    session: &mut Session<'a, R>,
    dialect: Dialect,
    parent_type: Option<TypeId>,
    range: Range<u64>,
    visitor: F,
) -> Result<WalkEnd>
where
    R: Read + Seek,
    F: FnMut(&mut Session<'a, R>, &Visit) -> Result<Action>,
{
    walk_inner(session, dialect, parent_type, range, true, visitor)
}

fn walk_inner<'a, R, F>(
    session: &mut Session<'a, R>,
    dialect: Dialect,
    parent_type: Option<TypeId>,
    range: Range<u64>,
    clamp: bool,
    mut visitor: F,
) -> Result<WalkEnd>
where
    R: Read + Seek,
    F: FnMut(&mut Session<'a, R>, &Visit) -> Result<Action>,
{
    let mut stack = std::vec::Vec::new();
    stack.try_reserve(8).map_err(|_| Error::OutOfMemory)?;
    stack.push(Frame {
        next: range.start,
        end: range.end.min(session.src.len()),
        parent_type,
    });
    let mut truncated = false;

    while let Some(frame) = stack.last() {
        session.check_stop()?;
        if frame.next >= frame.end {
            stack.pop();
            continue;
        }
        let offset = frame.next;
        let bound = frame.end;
        let frame_parent_type = frame.parent_type;
        let depth = (stack.len() - 1) as u32;

        if let Err(err) = session.count_element() {
            session.ledger.record(offset, &err);
            return Ok(WalkEnd::Truncated);
        }

        let header = if clamp {
            dialect.read_header_clamped(&mut session.src, offset, bound)
        } else {
            dialect.read_header(&mut session.src, offset, bound).map(|header| (header, false))
        };
        let header = match session.recover(offset, header)? {
            Some((header, cut)) => {
                if cut {
                    session.ledger.record(offset, "element extends past its container");
                    truncated = true;
                }
                header
            },
            None => {
                stack.pop();
                truncated = true;
                continue;
            },
        };
        if header.end_offset <= offset {
            session.ledger.record(offset, "zero-size element");
            stack.pop();
            truncated = true;
            continue;
        }
        if let Some(frame) = stack.last_mut() {
            frame.next = header.end_offset;
        }

        let visit = Visit {
            header,
            depth,
            parent_type: frame_parent_type,
        };
        let action = visitor(session, &visit);
        match session.recover(offset, action)? {
            None => {
                stack.pop();
                truncated = true;
            },
            Some(Action::Stop) => return Ok(WalkEnd::Stopped),
            Some(Action::Skip) => {},
            Some(Action::Recurse(sub)) => {
                if depth + 1 >= session.config.max_depth {
                    session.ledger.record(offset, "elements nested deeper than the depth limit");
                    truncated = true;
                    continue;
                }
                let start = sub.start.max(header.data_offset);
                let end = sub.end.min(header.data_end());
                if start < end {
                    stack.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
                    stack.push(Frame {
                        next: start,
                        end,
                        parent_type: Some(header.type_id),
                    });
                } else {
                    debug!("nothing to walk inside {:?} @ {offset}", header.type_id);
                }
            },
        }
    }

    debug!("walk of {}..{} visited {} elements so far", range.start, range.end, session.elements_visited);
    Ok(if truncated { WalkEnd::Truncated } else { WalkEnd::Exhausted })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::{BoxType, FourCC};
    use crate::{ParseConfig, Unstoppable};

    fn bmff_box(name: &[u8; 4], payload: &[u8]) -> std::vec::Vec<u8> {
        let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
        out.extend_from_slice(name);
        out.extend_from_slice(payload);
        out
    }

    fn visit_all(bytes: std::vec::Vec<u8>, config: &ParseConfig) -> (std::vec::Vec<(u32, FourCC)>, WalkEnd, usize) {
        let mut cursor = std::io::Cursor::new(bytes);
        let mut session = Session::new(&mut cursor, config, &Unstoppable).unwrap();
        let mut seen = std::vec::Vec::new();
        let end = walk(&mut session, Dialect::Bmff, None, 0..u64::MAX, |_, visit| {
            seen.push((visit.depth, visit.header.fourcc().unwrap()));
            Ok(match visit.header.box_type() {
                BoxType::MovieBox | BoxType::TrackBox => visit.children(),
                BoxType::MediaDataBox => Action::Stop,
                _ => Action::Skip,
            })
        })
        .unwrap();
        (seen, end, session.ledger.len())
    }

    #[test]
    fn nested_walk_in_order() {
        let trak = bmff_box(b"trak", &bmff_box(b"tkhd", &[0; 4]));
        let mut moov_payload = bmff_box(b"mvhd", &[0; 4]);
        moov_payload.extend(trak);
        let mut file = bmff_box(b"ftyp", b"isom");
        file.extend(bmff_box(b"moov", &moov_payload));
        file.extend(bmff_box(b"mdat", &[1, 2, 3]));
        file.extend(bmff_box(b"free", &[]));

        let (seen, end, corrupt) = visit_all(file, &ParseConfig::default());
        assert_eq!(seen, [
            (0, FourCC::new(b"ftyp")),
            (0, FourCC::new(b"moov")),
            (1, FourCC::new(b"mvhd")),
            (1, FourCC::new(b"trak")),
            (2, FourCC::new(b"tkhd")),
            (0, FourCC::new(b"mdat")),
        ]);
        assert_eq!(end, WalkEnd::Stopped);
        assert_eq!(corrupt, 0);
    }

    #[test]
    fn truncated_child_keeps_siblings_before_it() {
        let mut moov_payload = bmff_box(b"mvhd", &[0; 4]);
        // Declares 64 bytes but only 12 remain in moov
        moov_payload.extend_from_slice(b"\0\0\0\x40trak\0\0\0\0");
        let mut file = bmff_box(b"moov", &moov_payload);
        file.extend(bmff_box(b"free", &[]));

        let (seen, end, corrupt) = visit_all(file, &ParseConfig::default());
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2].1, FourCC::new(b"free"));
        assert_eq!(end, WalkEnd::Truncated);
        assert_eq!(corrupt, 1);
    }

    #[test]
    fn depth_limit_is_recorded() {
        let mut nested = bmff_box(b"tkhd", &[]);
        for _ in 0..4 {
            nested = bmff_box(b"trak", &nested);
        }
        let config = ParseConfig::default().with_max_depth(2);
        let (seen, end, corrupt) = visit_all(nested, &config);
        assert_eq!(seen.len(), 2);
        assert_eq!(end, WalkEnd::Truncated);
        assert_eq!(corrupt, 1);
    }

    #[test]
    fn clamped_walk_visits_cut_elements() {
        let mut file = bmff_box(b"free", &[]);
        // Declares 64 bytes, 12 are there
        file.extend_from_slice(b"\0\0\0\x40mdat\x01\x02\x03\x04");
        let mut cursor = std::io::Cursor::new(file);
        let config = ParseConfig::default();
        let mut session = Session::new(&mut cursor, &config, &Unstoppable).unwrap();
        let mut sizes = std::vec::Vec::new();
        let end = walk_clamped(&mut session, Dialect::Bmff, None, 0..u64::MAX, |_, visit| {
            sizes.push(visit.header.data_size);
            Ok(Action::Skip)
        })
        .unwrap();
        assert_eq!(sizes, [0, 4]);
        assert_eq!(end, WalkEnd::Truncated);
        assert_eq!(session.ledger.len(), 1);
    }

    #[test]
    fn element_limit_ends_walk() {
        let mut file = std::vec::Vec::new();
        for _ in 0..10 {
            file.extend(bmff_box(b"free", &[]));
        }
        let config = ParseConfig::default().with_max_elements(4);
        let (seen, end, corrupt) = visit_all(file, &config);
        assert_eq!(seen.len(), 4);
        assert_eq!(end, WalkEnd::Truncated);
        assert_eq!(corrupt, 1);
    }
}
