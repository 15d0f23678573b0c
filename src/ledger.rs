// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::TryVec;
use log::warn;
use std::fmt;

/// One piece of evidence that a file is damaged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Corruption {
    /// Absolute byte offset of the damaged element, or of the point where
    /// reading had to stop.
    pub offset: u64,
    pub reason: std::string::String,
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{:#x}: {}", self.offset, self.reason)
    }
}

/// Append-only list of [`Corruption`] entries collected during one read.
///
/// Entries are kept in the order they were found. A file with an empty
/// ledger parsed cleanly.
#[derive(Debug, Default)]
pub struct CorruptionLedger {
    entries: TryVec<Corruption>,
}

impl CorruptionLedger {
    pub(crate) fn record(&mut self, offset: u64, reason: impl fmt::Display) {
        let entry = Corruption { offset, reason: reason.to_string() };
        warn!("possible corruption {entry}");
        // An entry lost to allocation failure still leaves its warning in the log.
        let _ = self.entries.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Corruption> {
        self.entries().iter()
    }

    pub fn entries(&self) -> &[Corruption] {
        &self.entries
    }
}

impl<'a> IntoIterator for &'a CorruptionLedger {
    type Item = &'a Corruption;
    type IntoIter = std::slice::Iter<'a, Corruption>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[test]
fn ledger_keeps_order() {
    let mut ledger = CorruptionLedger::default();
    assert!(ledger.is_empty());
    ledger.record(40, "first");
    ledger.record(8, crate::Error::OutOfBounds("second"));
    assert_eq!(ledger.len(), 2);
    let offsets: std::vec::Vec<u64> = ledger.iter().map(|c| c.offset).collect();
    assert_eq!(offsets, [40, 8]);
    assert_eq!(ledger.entries()[1].reason, "second");
    assert_eq!(ledger.entries()[0].to_string(), "@0x28: first");
}
