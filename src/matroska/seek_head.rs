// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `SeekHead` index: a list of (element id, position) pairs pointing
//! at the top-level elements of a segment.

use super::ids::ElementId;
use super::{element_id, parent_id, read_uint};
use crate::element::{read_payload, Dialect, ElementArena, ElementIndex, Header, TypeId};
use crate::sizes::{self, EBML_MAX_ID_WIDTH};
use crate::walker::{walk, Action, WalkEnd};
use crate::{Error, Result, Session, ToU64, TryVec};
use log::debug;
use std::io::{Read, Seek};

#[derive(Debug, Clone, Copy, Default)]
struct SeekEntry {
    id: Option<u32>,
    position: Option<u64>,
}

/// Read the `Seek` entries of one SeekHead as (id, position relative to
/// the segment data).
fn read_entries<R: Read + Seek>(session: &mut Session<'_, R>, header: &Header) -> Result<TryVec<(u32, u64)>> {
    let mut entries: TryVec<SeekEntry> = TryVec::new();
    let within = Some(TypeId::Ebml(ElementId::SeekHead.into()));
    let end = walk(session, Dialect::Ebml, within, header.data_range(), |session, visit| {
        let in_seek = parent_id(visit) == Some(ElementId::Seek);
        Ok(match element_id(&visit.header) {
            ElementId::Seek => {
                entries.push(SeekEntry::default())?;
                visit.children()
            },
            ElementId::SeekId if in_seek => {
                let bytes = read_payload(&mut session.src, &visit.header, EBML_MAX_ID_WIDTH.to_u64())?;
                let (id, width) = sizes::decode_ebml_id(&bytes)?;
                if width.to_u64() != visit.header.data_size {
                    return Err(Error::InvalidData("SeekID is not a single element id"));
                }
                if let Some(entry) = entries.last_mut() {
                    entry.id = Some(id);
                }
                Action::Skip
            },
            ElementId::SeekPosition if in_seek => {
                let position = read_uint(session, &visit.header)?;
                if let Some(entry) = entries.last_mut() {
                    entry.position = Some(position);
                }
                Action::Skip
            },
            _ => Action::Skip,
        })
    })?;
    if end == WalkEnd::Truncated {
        return Err(Error::Inconsistent("SeekHead is damaged"));
    }

    let mut complete = TryVec::new();
    for entry in entries.iter() {
        match (entry.id, entry.position) {
            (Some(id), Some(position)) => complete.push((id, position))?,
            _ => debug!("ignoring incomplete Seek entry {entry:?}"),
        }
    }
    Ok(complete)
}

/// Keep `resolved` ordered by element offset after appending `index`.
fn insert_sorted(arena: &ElementArena, resolved: &mut TryVec<ElementIndex>, index: ElementIndex) -> Result<()> {
    let offset = |i: ElementIndex| arena.get(i).map_or(u64::MAX, |e| e.offset);
    resolved.push(index)?;
    let mut i = resolved.len() - 1;
    while i > 0 && offset(resolved[i - 1]) > offset(resolved[i]) {
        resolved.swap(i - 1, i);
        i -= 1;
    }
    Ok(())
}

/// Follow the SeekHead at `seek_head`, and any SeekHeads it points to, and
/// read the header of every element they list.
///
/// The result holds materialized elements ordered by offset; two entries
/// naming the same element both appear. Every entry is checked against the
/// element found at its position, and any disagreement between the index
/// and the file is an error: the caller is expected to drop the whole index
/// and scan the segment instead. Chains of SeekHeads are bounded only by
/// `max_seek_head_depth`.
pub(crate) fn resolve<R: Read + Seek>(
    session: &mut Session<'_, R>,
    arena: &mut ElementArena,
    segment: ElementIndex,
    segment_header: &Header,
    seek_head: ElementIndex,
) -> Result<TryVec<ElementIndex>> {
    let mut resolved: TryVec<ElementIndex> = TryVec::new();
    let mut heads: TryVec<(ElementIndex, u32)> = TryVec::new();
    heads.push((seek_head, 0))?;

    let mut next = 0;
    while let Some(&(head, depth)) = heads.get(next) {
        next += 1;
        session.check_stop()?;
        let header = arena.materialize(head, Dialect::Ebml, &mut session.src)?;
        let entries = read_entries(session, &header)?;
        for &(id, position) in entries.iter() {
            let offset = segment_header
                .data_offset
                .checked_add(position)
                .filter(|&offset| offset < segment_header.data_end())
                .ok_or(Error::OutOfBounds("seek position outside the segment"))?;
            let index = arena.as_abstract(Some(segment), offset, TypeId::Ebml(id), None)?;
            if ElementId::from(id) == ElementId::SeekHead {
                if depth + 1 > session.config.max_seek_head_depth {
                    return Err(Error::Inconsistent("SeekHead chain nested too deeply"));
                }
                heads.push((index, depth + 1))?;
            }
            insert_sorted(arena, &mut resolved, index)?;
        }
    }

    for &index in resolved.iter() {
        session.check_stop()?;
        session.count_element()?;
        arena.materialize(index, Dialect::Ebml, &mut session.src)?;
    }
    debug!("SeekHead resolved {} elements", resolved.len());
    Ok(resolved)
}
