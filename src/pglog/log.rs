use super::entry::{DupEntry, LogEntry, ObjectId, RequestId};
use super::rollback::RollbackHandler;
use super::version::Eversion;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

/// Transferable form of a placement-group log, as shipped between replicas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgLogRecord {
    pub head: Eversion,
    pub tail: Eversion,
    pub can_rollback_to: Eversion,
    pub rollback_info_trimmed_to: Eversion,
    pub entries: Vec<LogEntry>,
    pub dups: Vec<DupEntry>,
}

impl PgLogRecord {
    /// Builds a record whose bounds are derived from `entries`; rollback is
    /// not possible past the head.
    pub fn from_entries(tail: Eversion, entries: Vec<LogEntry>) -> Self {
        let head = entries.last().map(|entry| entry.version).unwrap_or(tail);
        Self {
            head,
            tail,
            can_rollback_to: head,
            rollback_info_trimmed_to: head,
            entries,
            dups: Vec::new(),
        }
    }

    pub fn with_can_rollback_to(mut self, version: Eversion) -> Self {
        self.can_rollback_to = version;
        if self.rollback_info_trimmed_to > version {
            self.rollback_info_trimmed_to = version;
        }
        self
    }

    pub fn with_dups(mut self, dups: Vec<DupEntry>) -> Self {
        self.dups = dups;
        self
    }

    pub fn is_null(&self) -> bool {
        self.head.is_zero()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LogInvariantError {
    #[error("entries out of order: {previous} followed by {next}")]
    OutOfOrder { previous: Eversion, next: Eversion },
    #[error("entry {version} outside ({tail}, {head}]")]
    OutOfBounds {
        version: Eversion,
        tail: Eversion,
        head: Eversion,
    },
    #[error("bounds violated: tail={tail} can_rollback_to={can_rollback_to} head={head}")]
    Bounds {
        tail: Eversion,
        can_rollback_to: Eversion,
        head: Eversion,
    },
    #[error("dup {version} is not older than tail {tail}")]
    DupOverlapsLog { version: Eversion, tail: Eversion },
    #[error("dups out of order: {previous} followed by {next}")]
    DupOutOfOrder { previous: Eversion, next: Eversion },
}

/// What a trim removed, for the persistent writer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TrimOutcome {
    pub trimmed: Vec<Eversion>,
    pub trimmed_dups: Vec<String>,
    /// Oldest version newly copied into the dup ledger.
    pub first_new_dup: Option<Eversion>,
}

/// Changes applied to the dup ledger by [`IndexedLog::merge_dups`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DupMerge {
    pub changed: bool,
    pub copied_all: bool,
    pub dirty_from: Option<Eversion>,
    pub dirty_to: Option<Eversion>,
}

/// Ordered log with per-object and per-request indices.
#[derive(Debug, Clone, Default)]
pub struct IndexedLog {
    head: Eversion,
    tail: Eversion,
    can_rollback_to: Eversion,
    rollback_info_trimmed_to: Eversion,
    entries: VecDeque<LogEntry>,
    dups: VecDeque<DupEntry>,
    objects: HashMap<ObjectId, Eversion>,
    requests: HashMap<RequestId, Eversion>,
    dup_requests: HashMap<RequestId, Eversion>,
}

impl IndexedLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_record(record: PgLogRecord) -> Self {
        let mut log = Self {
            head: record.head,
            tail: record.tail,
            can_rollback_to: record.can_rollback_to,
            rollback_info_trimmed_to: record.rollback_info_trimmed_to,
            entries: record.entries.into(),
            dups: record.dups.into(),
            ..Self::default()
        };
        log.reindex();
        log
    }

    pub fn to_record(&self) -> PgLogRecord {
        PgLogRecord {
            head: self.head,
            tail: self.tail,
            can_rollback_to: self.can_rollback_to,
            rollback_info_trimmed_to: self.rollback_info_trimmed_to,
            entries: self.entries.iter().cloned().collect(),
            dups: self.dups.iter().cloned().collect(),
        }
    }

    pub fn head(&self) -> Eversion {
        self.head
    }

    pub fn tail(&self) -> Eversion {
        self.tail
    }

    pub fn can_rollback_to(&self) -> Eversion {
        self.can_rollback_to
    }

    pub fn rollback_info_trimmed_to(&self) -> Eversion {
        self.rollback_info_trimmed_to
    }

    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &LogEntry> + '_ {
        self.entries.iter()
    }

    pub fn dups(&self) -> impl DoubleEndedIterator<Item = &DupEntry> + '_ {
        self.dups.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dup_len(&self) -> usize {
        self.dups.len()
    }

    pub fn is_null(&self) -> bool {
        self.head.is_zero()
    }

    /// Newest logged version for `object`, ignoring error markers.
    pub fn latest_for_object(&self, object: &ObjectId) -> Option<Eversion> {
        self.objects.get(object).copied()
    }

    /// Returns the version and return code recorded for a request, looking at
    /// live entries first and then at the dup ledger.
    pub fn lookup_request(&self, request: &RequestId) -> Option<(Eversion, i32)> {
        if let Some(version) = self.requests.get(request) {
            return self
                .entries
                .iter()
                .rev()
                .find(|entry| entry.version == *version)
                .map(|entry| (entry.version, entry.return_code()));
        }
        let version = self.dup_requests.get(request)?;
        self.dups
            .iter()
            .rev()
            .find(|dup| dup.version == *version && &dup.request == request)
            .map(|dup| (dup.version, dup.return_code))
    }

    /// Appends a new head entry.
    pub fn add(&mut self, entry: LogEntry) {
        assert!(
            entry.version > self.head,
            "log append must advance head: head={} attempted={}",
            self.head,
            entry.version
        );
        self.head = entry.version;
        self.index_entry(&entry);
        self.entries.push_back(entry);
    }

    /// Moves the head forward without an entry, for peers whose head
    /// outruns their last shipped entry.
    pub(crate) fn advance_head(&mut self, head: Eversion) {
        if head > self.head {
            self.head = head;
        }
    }

    /// Prepends history older than the current tail and lowers the tail.
    pub(crate) fn extend_tail(&mut self, older: Vec<LogEntry>, new_tail: Eversion) {
        assert!(new_tail <= self.tail, "tail extension must lower the tail");
        for entry in older.into_iter().rev() {
            assert!(
                self.entries
                    .front()
                    .map(|front| entry.version < front.version)
                    .unwrap_or(entry.version <= self.head),
                "tail extension out of order at {}",
                entry.version
            );
            if entry.object_is_indexed() && !self.objects.contains_key(&entry.object) {
                self.objects.insert(entry.object.clone(), entry.version);
            }
            if let Some(request) = &entry.request {
                self.requests
                    .entry(request.clone())
                    .or_insert(entry.version);
            }
            self.entries.push_front(entry);
        }
        self.tail = new_tail;
    }

    /// Removes every entry newer than `newhead` and returns them oldest first.
    pub fn rewind_from_head(&mut self, newhead: Eversion) -> Vec<LogEntry> {
        assert!(
            newhead >= self.tail,
            "cannot rewind below tail: tail={} newhead={}",
            self.tail,
            newhead
        );
        let mut divergent = Vec::new();
        while let Some(last) = self.entries.back() {
            if last.version <= newhead {
                break;
            }
            if let Some(entry) = self.entries.pop_back() {
                self.unindex_newest(&entry);
                divergent.push(entry);
            }
        }
        divergent.reverse();
        self.head = newhead;
        if self.can_rollback_to > newhead {
            self.can_rollback_to = newhead;
        }
        if self.rollback_info_trimmed_to > newhead {
            self.rollback_info_trimmed_to = newhead;
        }
        if !divergent.is_empty() {
            debug!(
                "event=pglog_rewind newhead={} divergent={}",
                newhead,
                divergent.len()
            );
        }
        divergent
    }

    /// Commits entries up to `to`: their rollback metadata is handed to
    /// `handler.roll_forward` and can no longer be used.
    pub fn roll_forward_to(&mut self, to: Eversion, handler: &mut dyn RollbackHandler) {
        if to > self.can_rollback_to {
            self.can_rollback_to = to;
        }
        if to > self.rollback_info_trimmed_to {
            let from = self.rollback_info_trimmed_to;
            for entry in self
                .entries
                .iter()
                .filter(|entry| entry.version > from && entry.version <= to)
            {
                trace!("event=pglog_roll_forward version={}", entry.version);
                handler.roll_forward(entry);
            }
            self.rollback_info_trimmed_to = to;
        }
    }

    /// Forbids rolling back into anything currently in the log.
    pub fn skip_can_rollback_to_to_head(&mut self) {
        self.can_rollback_to = self.head;
        self.rollback_info_trimmed_to = self.head;
    }

    /// Drops entries at or below `to`, copying recent ones into the dup
    /// ledger which is then capped at `dups_tracked` versions behind head.
    pub fn trim(&mut self, to: Eversion, dups_tracked: u64) -> TrimOutcome {
        assert!(
            to <= self.can_rollback_to,
            "trim past can_rollback_to: to={} can_rollback_to={}",
            to,
            self.can_rollback_to
        );
        let mut outcome = TrimOutcome::default();
        let earliest_dup_version = self
            .entries
            .back()
            .map(|last| {
                if last.version.version < dups_tracked {
                    0
                } else {
                    last.version.version - dups_tracked + 1
                }
            })
            .unwrap_or(0);

        while let Some(front) = self.entries.front() {
            if front.version > to {
                break;
            }
            let Some(entry) = self.entries.pop_front() else {
                break;
            };
            trace!("event=pglog_trim version={}", entry.version);
            outcome.trimmed.push(entry.version);
            self.unindex_oldest(&entry);
            if entry.version.version >= earliest_dup_version {
                if let Some(dup) = DupEntry::from_entry(&entry) {
                    if outcome.first_new_dup.is_none() {
                        outcome.first_new_dup = Some(entry.version);
                    }
                    self.dup_requests.insert(dup.request.clone(), dup.version);
                    self.dups.push_back(dup);
                }
            }
        }

        while let Some(front) = self.dups.front() {
            if front.version.version >= earliest_dup_version {
                break;
            }
            if let Some(dup) = self.dups.pop_front() {
                trace!("event=pglog_trim_dup version={}", dup.version);
                outcome.trimmed_dups.push(dup.key_name());
                self.unindex_dup(&dup);
            }
        }

        if self.tail < to {
            self.tail = to;
        }
        if self.rollback_info_trimmed_to < self.tail {
            self.rollback_info_trimmed_to = self.tail;
        }
        outcome
    }

    /// Folds a peer's dup ledger into ours, extending on both ends, then
    /// drops dups that now overlap live entries. Peer dups above our tail
    /// are covered by the log itself and are ignored.
    pub fn merge_dups(&mut self, peer: &[DupEntry]) -> DupMerge {
        let mut merge = DupMerge::default();
        let tail = self.tail;
        let peer: Vec<&DupEntry> = peer.iter().filter(|dup| dup.version <= tail).collect();
        if !peer.is_empty() {
            if self.dups.is_empty() {
                debug!(
                    "event=pglog_dups_copy from={} to={}",
                    peer[0].version,
                    peer[peer.len() - 1].version
                );
                merge.changed = true;
                merge.copied_all = true;
                for dup in peer {
                    self.dup_requests.insert(dup.request.clone(), dup.version);
                    self.dups.push_back((*dup).clone());
                }
            } else {
                let newest = self.dups.back().map(|dup| dup.version).unwrap_or_default();
                let newer: Vec<&DupEntry> =
                    peer.iter().copied().filter(|dup| dup.version > newest).collect();
                if !newer.is_empty() {
                    debug!(
                        "event=pglog_dups_extend_newer to={}",
                        newer[newer.len() - 1].version
                    );
                    merge.changed = true;
                    merge.dirty_from = Some(newer[0].version);
                    for dup in newer {
                        self.dup_requests.insert(dup.request.clone(), dup.version);
                        self.dups.push_back(dup.clone());
                    }
                }

                let oldest = self.dups.front().map(|dup| dup.version).unwrap_or_default();
                let older: Vec<&DupEntry> =
                    peer.iter().copied().filter(|dup| dup.version < oldest).collect();
                if !older.is_empty() {
                    debug!("event=pglog_dups_extend_older to={}", older[0].version);
                    merge.changed = true;
                    merge.dirty_to = Some(older[older.len() - 1].version);
                    for dup in older.into_iter().rev() {
                        self.dup_requests.insert(dup.request.clone(), dup.version);
                        self.dups.push_front(dup.clone());
                    }
                }
            }
        }

        if self
            .dups
            .back()
            .map(|dup| dup.version > self.tail)
            .unwrap_or(false)
        {
            debug!(
                "event=pglog_dups_drop_overlap tail={} newest={}",
                self.tail,
                self.dups.back().map(|dup| dup.version).unwrap_or_default()
            );
            merge.changed = true;
            while let Some(last) = self.dups.back() {
                if last.version <= self.tail {
                    break;
                }
                let version = last.version;
                if let Some(dup) = self.dups.pop_back() {
                    self.unindex_dup(&dup);
                }
                merge.dirty_from = Some(match merge.dirty_from {
                    Some(current) if current < version => current,
                    _ => version,
                });
            }
        }
        merge
    }

    /// Checks ordering and bound invariants.
    pub fn validate(&self) -> Result<(), LogInvariantError> {
        if !(self.tail <= self.can_rollback_to && self.can_rollback_to <= self.head) {
            return Err(LogInvariantError::Bounds {
                tail: self.tail,
                can_rollback_to: self.can_rollback_to,
                head: self.head,
            });
        }
        let mut previous: Option<Eversion> = None;
        for entry in &self.entries {
            if entry.version <= self.tail || entry.version > self.head {
                return Err(LogInvariantError::OutOfBounds {
                    version: entry.version,
                    tail: self.tail,
                    head: self.head,
                });
            }
            if let Some(previous) = previous {
                if entry.version <= previous {
                    return Err(LogInvariantError::OutOfOrder {
                        previous,
                        next: entry.version,
                    });
                }
            }
            previous = Some(entry.version);
        }
        let mut previous: Option<Eversion> = None;
        for dup in &self.dups {
            if dup.version > self.tail {
                return Err(LogInvariantError::DupOverlapsLog {
                    version: dup.version,
                    tail: self.tail,
                });
            }
            if let Some(previous) = previous {
                if dup.version < previous {
                    return Err(LogInvariantError::DupOutOfOrder {
                        previous,
                        next: dup.version,
                    });
                }
            }
            previous = Some(dup.version);
        }
        Ok(())
    }

    fn reindex(&mut self) {
        self.objects.clear();
        self.requests.clear();
        self.dup_requests.clear();
        for entry in &self.entries {
            if entry.object_is_indexed() {
                self.objects.insert(entry.object.clone(), entry.version);
            }
            if let Some(request) = &entry.request {
                self.requests.insert(request.clone(), entry.version);
            }
        }
        for dup in &self.dups {
            self.dup_requests.insert(dup.request.clone(), dup.version);
        }
    }

    fn index_entry(&mut self, entry: &LogEntry) {
        if entry.object_is_indexed() {
            self.objects.insert(entry.object.clone(), entry.version);
        }
        if let Some(request) = &entry.request {
            self.requests.insert(request.clone(), entry.version);
        }
    }

    // Called after `entry` was popped from the back; older entries for the
    // same object or request become the indexed ones again.
    fn unindex_newest(&mut self, entry: &LogEntry) {
        if entry.object_is_indexed()
            && self.objects.get(&entry.object) == Some(&entry.version)
        {
            match self
                .entries
                .iter()
                .rev()
                .find(|older| older.object_is_indexed() && older.object == entry.object)
            {
                Some(older) => {
                    self.objects.insert(entry.object.clone(), older.version);
                }
                None => {
                    self.objects.remove(&entry.object);
                }
            }
        }
        if let Some(request) = &entry.request {
            if self.requests.get(request) == Some(&entry.version) {
                match self
                    .entries
                    .iter()
                    .rev()
                    .find(|older| older.request.as_ref() == Some(request))
                {
                    Some(older) => {
                        self.requests.insert(request.clone(), older.version);
                    }
                    None => {
                        self.requests.remove(request);
                    }
                }
            }
        }
    }

    // Called after `entry` was popped from the front; anything newer keeps
    // its index slot.
    fn unindex_oldest(&mut self, entry: &LogEntry) {
        if entry.object_is_indexed()
            && self.objects.get(&entry.object) == Some(&entry.version)
        {
            self.objects.remove(&entry.object);
        }
        if let Some(request) = &entry.request {
            if self.requests.get(request) == Some(&entry.version) {
                self.requests.remove(request);
            }
        }
    }

    fn unindex_dup(&mut self, dup: &DupEntry) {
        if self.dup_requests.get(&dup.request) == Some(&dup.version) {
            self.dup_requests.remove(&dup.request);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pglog::rollback::NoopRollback;

    fn v(version: u64) -> Eversion {
        Eversion::new(1, version)
    }

    fn log_with(count: u64) -> IndexedLog {
        let mut log = IndexedLog::new();
        for i in 1..=count {
            log.add(
                LogEntry::modify(v(i), format!("obj{}", i % 2), v(i.saturating_sub(2)))
                    .with_request(RequestId::new("client", i)),
            );
        }
        log
    }

    #[test]
    fn rewind_returns_divergent_oldest_first_and_restores_index() {
        let mut log = log_with(5);
        let divergent = log.rewind_from_head(v(3));
        let versions: Vec<_> = divergent.iter().map(|entry| entry.version).collect();
        assert_eq!(versions, vec![v(4), v(5)]);
        assert_eq!(log.head(), v(3));
        assert_eq!(log.latest_for_object(&ObjectId::new("obj0")), Some(v(2)));
        assert_eq!(log.latest_for_object(&ObjectId::new("obj1")), Some(v(3)));
        assert!(log.lookup_request(&RequestId::new("client", 5)).is_none());
        log.validate().unwrap();
    }

    #[test]
    fn rewind_clamps_rollback_bounds() {
        let mut log = log_with(4);
        log.skip_can_rollback_to_to_head();
        log.rewind_from_head(v(2));
        assert_eq!(log.can_rollback_to(), v(2));
        assert_eq!(log.rollback_info_trimmed_to(), v(2));
    }

    #[test]
    fn trim_moves_requests_into_capped_dup_ledger() {
        let mut log = log_with(6);
        log.roll_forward_to(v(6), &mut NoopRollback);
        let outcome = log.trim(v(4), 3);
        assert_eq!(outcome.trimmed, vec![v(1), v(2), v(3), v(4)]);
        // head sequence is 6 so only versions >= 4 are retained as dups
        assert_eq!(log.dup_len(), 1);
        assert_eq!(outcome.first_new_dup, Some(v(4)));
        assert_eq!(log.tail(), v(4));
        assert_eq!(
            log.lookup_request(&RequestId::new("client", 4)),
            Some((v(4), 0))
        );
        assert!(log.lookup_request(&RequestId::new("client", 2)).is_none());
        log.validate().unwrap();
    }

    #[test]
    #[should_panic(expected = "trim past can_rollback_to")]
    fn trim_refuses_uncommitted_entries() {
        let mut log = log_with(3);
        log.trim(v(2), 10);
    }

    #[test]
    fn merge_dups_extends_both_ends_and_drops_overlap() {
        let dup = |i: u64| DupEntry {
            request: RequestId::new("c", i),
            version: v(i),
            return_code: 0,
        };
        let mut log = IndexedLog::from_record(PgLogRecord {
            head: v(10),
            tail: v(6),
            can_rollback_to: v(10),
            rollback_info_trimmed_to: v(10),
            entries: Vec::new(),
            dups: vec![dup(3), dup(4)],
        });
        let merge = log.merge_dups(&[dup(1), dup(2), dup(3), dup(4), dup(5), dup(7)]);
        assert!(merge.changed);
        assert_eq!(merge.dirty_to, Some(v(2)));
        assert_eq!(merge.dirty_from, Some(v(5)));
        let versions: Vec<_> = log.dups().map(|dup| dup.version).collect();
        assert_eq!(versions, vec![v(1), v(2), v(3), v(4), v(5)]);
        log.validate().unwrap();
    }
}
