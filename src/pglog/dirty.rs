use super::entry::{DupEntry, LogEntry, ObjectId};
use super::log::IndexedLog;
use super::missing::{MissingItem, MissingObjectTracker};
use super::version::Eversion;
use std::collections::BTreeSet;
use thiserror::Error;

/// Ranges of the in-memory log that differ from what was last persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyTracker {
    /// Entries at or below this version must be rewritten.
    pub dirty_to: Eversion,
    /// Entries at or above this version must be rewritten.
    pub dirty_from: Eversion,
    /// Entries at or above this version were appended and never written.
    pub writeout_from: Eversion,
    pub trimmed: BTreeSet<Eversion>,
    pub trimmed_dups: BTreeSet<String>,
    pub dirty_to_dups: Eversion,
    pub dirty_from_dups: Eversion,
    pub write_from_dups: Eversion,
    /// False until the first write, which then rewrites everything.
    pub touched_log: bool,
}

impl Default for DirtyTracker {
    fn default() -> Self {
        Self {
            dirty_to: Eversion::ZERO,
            dirty_from: Eversion::MAX,
            writeout_from: Eversion::MAX,
            trimmed: BTreeSet::new(),
            trimmed_dups: BTreeSet::new(),
            dirty_to_dups: Eversion::ZERO,
            dirty_from_dups: Eversion::MAX,
            write_from_dups: Eversion::MAX,
            touched_log: false,
        }
    }
}

impl DirtyTracker {
    pub fn mark_dirty_to(&mut self, to: Eversion) {
        if to > self.dirty_to {
            self.dirty_to = to;
        }
    }

    pub fn mark_dirty_from(&mut self, from: Eversion) {
        if from < self.dirty_from {
            self.dirty_from = from;
        }
    }

    pub fn mark_writeout_from(&mut self, from: Eversion) {
        if from < self.writeout_from {
            self.writeout_from = from;
        }
    }

    pub fn mark_dirty_to_dups(&mut self, to: Eversion) {
        if to > self.dirty_to_dups {
            self.dirty_to_dups = to;
        }
    }

    pub fn mark_dirty_from_dups(&mut self, from: Eversion) {
        if from < self.dirty_from_dups {
            self.dirty_from_dups = from;
        }
    }

    pub fn mark_write_from_dups(&mut self, from: Eversion) {
        if from < self.write_from_dups {
            self.write_from_dups = from;
        }
    }

    pub fn mark_all_dups_dirty(&mut self) {
        self.dirty_from_dups = Eversion::ZERO;
        self.dirty_to_dups = Eversion::MAX;
    }

    pub fn is_dirty(&self) -> bool {
        !self.touched_log
            || self.dirty_to != Eversion::ZERO
            || self.dirty_from != Eversion::MAX
            || self.writeout_from != Eversion::MAX
            || !self.trimmed.is_empty()
            || !self.trimmed_dups.is_empty()
            || self.dirty_to_dups != Eversion::ZERO
            || self.dirty_from_dups != Eversion::MAX
            || self.write_from_dups != Eversion::MAX
    }

    /// Resets to the clean state that follows a successful write.
    pub fn undirty(&mut self) {
        *self = Self {
            touched_log: true,
            ..Self::default()
        };
    }

    fn entry_is_dirty(&self, version: Eversion) -> bool {
        !self.touched_log
            || version <= self.dirty_to
            || version >= self.dirty_from
            || version >= self.writeout_from
    }

    fn dup_is_dirty(&self, version: Eversion) -> bool {
        !self.touched_log
            || version <= self.dirty_to_dups
            || version >= self.dirty_from_dups
            || version >= self.write_from_dups
    }
}

/// Everything the persistent writer needs to bring stored state in line
/// with memory. Entries and dups are full copies of the dirty ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogWriteDescriptor {
    /// Rewrite the whole log instead of patching ranges.
    pub clear_all: bool,
    pub dirty_to: Eversion,
    pub dirty_from: Eversion,
    pub writeout_from: Eversion,
    pub trimmed: BTreeSet<Eversion>,
    pub trimmed_dups: BTreeSet<String>,
    pub dirty_to_dups: Eversion,
    pub dirty_from_dups: Eversion,
    pub write_from_dups: Eversion,
    pub entries: Vec<LogEntry>,
    pub dups: Vec<DupEntry>,
    /// Changed missing-set keys; `None` means the key must be erased.
    pub missing: Vec<(ObjectId, Option<MissingItem>)>,
}

impl LogWriteDescriptor {
    pub(crate) fn build(
        dirty: &DirtyTracker,
        log: &IndexedLog,
        missing: &MissingObjectTracker,
        changed: Vec<ObjectId>,
    ) -> Self {
        let entries = log
            .entries()
            .filter(|entry| dirty.entry_is_dirty(entry.version))
            .cloned()
            .collect();
        let dups = log
            .dups()
            .filter(|dup| dirty.dup_is_dirty(dup.version))
            .cloned()
            .collect();
        let missing = changed
            .into_iter()
            .map(|object| {
                let item = missing.is_missing(&object).copied();
                (object, item)
            })
            .collect();
        Self {
            clear_all: !dirty.touched_log,
            dirty_to: dirty.dirty_to,
            dirty_from: dirty.dirty_from,
            writeout_from: dirty.writeout_from,
            trimmed: dirty.trimmed.clone(),
            trimmed_dups: dirty.trimmed_dups.clone(),
            dirty_to_dups: dirty.dirty_to_dups,
            dirty_from_dups: dirty.dirty_from_dups,
            write_from_dups: dirty.write_from_dups,
            entries,
            dups,
            missing,
        }
    }
}

#[derive(Debug, Error)]
pub enum LogWriteError {
    #[error("log write I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("log write rejected: {0}")]
    Rejected(String),
}

/// Persistent log store; encodes and writes or erases the described records.
pub trait LogWriter {
    fn write(&mut self, descriptor: &LogWriteDescriptor) -> Result<(), LogWriteError>;
}
