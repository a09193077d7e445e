use super::dirty::{DirtyTracker, LogWriteDescriptor, LogWriteError, LogWriter};
use super::entry::{LogEntry, ObjectId};
use super::log::{IndexedLog, PgLogRecord};
use super::missing::MissingObjectTracker;
use super::rollback::{NoopRollback, RollbackHandler};
use super::version::Eversion;
use log::{debug, info, trace};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Number of trimmed request ids kept for dedup when none is configured.
pub const DEFAULT_DUPS_TRACKED: u64 = 3000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PgLogConfig {
    /// Dup ledger depth, in versions behind the log head.
    pub dups_tracked: u64,
}

impl Default for PgLogConfig {
    fn default() -> Self {
        Self {
            dups_tracked: DEFAULT_DUPS_TRACKED,
        }
    }
}

/// How far backfill has progressed. Objects beyond the bound are copied
/// wholesale later and are not tracked through the log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LastBackfill {
    #[default]
    Nothing,
    Through(ObjectId),
    Complete,
}

impl LastBackfill {
    pub fn covers(&self, object: &ObjectId) -> bool {
        match self {
            LastBackfill::Nothing => false,
            LastBackfill::Through(bound) => object <= bound,
            LastBackfill::Complete => true,
        }
    }
}

/// Replica summary exchanged alongside logs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgInfo {
    pub last_update: Eversion,
    pub last_complete: Eversion,
    pub log_tail: Eversion,
    pub last_backfill: LastBackfill,
    pub last_user_version: u64,
}

impl PgInfo {
    /// Info for a replica whose store fully reflects `record`.
    pub fn for_log(record: &PgLogRecord) -> Self {
        Self {
            last_update: record.head,
            last_complete: record.head,
            log_tail: record.tail,
            last_backfill: LastBackfill::Complete,
            last_user_version: 0,
        }
    }
}

/// A replica's log, missing set and write-back state for one placement
/// group. Callers serialize access (see [`SharedPgLog`]); no method is
/// internally synchronized.
#[derive(Debug)]
pub struct PgLog {
    pg: String,
    config: PgLogConfig,
    log: IndexedLog,
    missing: MissingObjectTracker,
    info: PgInfo,
    dirty: DirtyTracker,
}

impl PgLog {
    pub fn new(pg: impl Into<String>, config: PgLogConfig) -> Self {
        Self {
            pg: pg.into(),
            config,
            log: IndexedLog::new(),
            missing: MissingObjectTracker::new(),
            info: PgInfo::default(),
            dirty: DirtyTracker::default(),
        }
    }

    pub fn from_record(
        pg: impl Into<String>,
        record: PgLogRecord,
        info: PgInfo,
        config: PgLogConfig,
    ) -> Self {
        Self {
            log: IndexedLog::from_record(record),
            info,
            ..Self::new(pg, config)
        }
    }

    pub fn pg(&self) -> &str {
        &self.pg
    }

    pub fn log(&self) -> &IndexedLog {
        &self.log
    }

    pub fn missing(&self) -> &MissingObjectTracker {
        &self.missing
    }

    pub fn missing_mut(&mut self) -> &mut MissingObjectTracker {
        &mut self.missing
    }

    pub fn info(&self) -> &PgInfo {
        &self.info
    }

    pub fn info_mut(&mut self) -> &mut PgInfo {
        &mut self.info
    }

    pub fn dirty(&self) -> &DirtyTracker {
        &self.dirty
    }

    pub fn to_record(&self) -> PgLogRecord {
        self.log.to_record()
    }

    /// Appends a locally originated entry.
    pub fn add(&mut self, entry: LogEntry) {
        let version = entry.version;
        self.log.add(entry);
        self.dirty.mark_writeout_from(version);
        self.info.last_update = version;
    }

    pub fn roll_forward_to(&mut self, to: Eversion, handler: &mut dyn RollbackHandler) {
        self.log.roll_forward_to(to, handler);
    }

    pub fn trim(&mut self, trim_to: Eversion) {
        if trim_to <= self.log.tail() {
            return;
        }
        debug!(
            "event=pglog_trim pg={} trim_to={} tail={} missing={}",
            self.pg,
            trim_to,
            self.log.tail(),
            self.missing.num_missing()
        );
        let outcome = self.log.trim(trim_to, self.config.dups_tracked);
        self.dirty.trimmed.extend(outcome.trimmed);
        self.dirty.trimmed_dups.extend(outcome.trimmed_dups);
        if let Some(first) = outcome.first_new_dup {
            self.dirty.mark_write_from_dups(first);
        }
        self.info.log_tail = self.log.tail();
    }

    /// Merges an authoritative peer log into ours. Returns whether anything
    /// changed; the caller persists via [`PgLog::write_log_and_missing`].
    pub fn merge_log(
        &mut self,
        peer_info: &PgInfo,
        peer_log: &PgLogRecord,
        from: &str,
        handler: &mut dyn RollbackHandler,
    ) -> bool {
        assert!(
            !self.log.is_null() || peer_log.tail.is_zero(),
            "pg {}: empty log cannot merge a trimmed peer log (peer tail {})",
            self.pg,
            peer_log.tail
        );
        assert!(
            self.log.head() >= peer_log.tail && peer_log.head >= self.log.tail(),
            "pg {}: logs do not overlap: local ({}, {}] peer ({}, {}]",
            self.pg,
            self.log.tail(),
            self.log.head(),
            peer_log.tail,
            peer_log.head
        );
        debug!(
            "event=pglog_merge pg={} from={} local=({},{}] peer=({},{}] missing={}",
            self.pg,
            from,
            self.log.tail(),
            self.log.head(),
            peer_log.tail,
            peer_log.head,
            self.missing.num_missing()
        );

        let mut changed = false;
        let orig_tail = self.log.tail();

        // Older history only; the missing set already matches our log.
        if peer_log.tail < orig_tail {
            debug!(
                "event=pglog_merge_extend_tail pg={} tail={}",
                self.pg, peer_log.tail
            );
            let older: Vec<LogEntry> = peer_log
                .entries
                .iter()
                .take_while(|entry| entry.version <= orig_tail)
                .cloned()
                .collect();
            if let Some(last) = older.last() {
                self.dirty.mark_dirty_to(last.version);
            }
            self.log.extend_tail(older, peer_log.tail);
            self.info.log_tail = peer_log.tail;
            changed = true;
        }

        if peer_log.head < self.log.head() {
            self.rewind_divergent_log(peer_log.head, handler);
            changed = true;
        }

        if peer_log.head > self.log.head() {
            debug!(
                "event=pglog_merge_extend_head pg={} head={}",
                self.pg, peer_log.head
            );
            let local_head = self.log.head();
            let mut lower_bound = peer_log.tail.max(orig_tail);
            let cut = peer_log
                .entries
                .iter()
                .rposition(|entry| entry.version <= local_head);
            let append_from = match cut {
                Some(index) => {
                    lower_bound = lower_bound.max(peer_log.entries[index].version);
                    index + 1
                }
                None => 0,
            };
            debug!(
                "event=pglog_merge_cut_point pg={} cut={}",
                self.pg, lower_bound
            );
            self.dirty.mark_dirty_from(lower_bound);

            // Rollback decisions use the bound from before the rewind.
            let original_crt = self.log.can_rollback_to();
            let divergent = self.log.rewind_from_head(lower_bound);
            for entry in &divergent {
                info!(
                    "event=pglog_merge_divergent pg={} from={} entry=\"{}\"",
                    self.pg, from, entry
                );
            }
            let head = self.log.head();
            self.log.roll_forward_to(head, handler);

            let new_entries = peer_log.entries[append_from..].to_vec();
            Self::append_log_entries_update_missing(
                &self.info.last_backfill,
                new_entries,
                &mut self.log,
                &mut self.missing,
            );
            Self::merge_divergent_entries(
                &self.log,
                divergent,
                &self.info,
                original_crt,
                &mut self.missing,
                handler,
            );

            self.log.advance_head(peer_log.head);
            self.info.last_update = peer_log.head;
            // The new entries came from the authoritative log; never roll
            // back into them.
            self.log.skip_can_rollback_to_to_head();
            self.info.last_user_version = peer_info.last_user_version;
            changed = true;
        }

        if self.merge_log_dups(peer_log) {
            changed = true;
        }

        debug!(
            "event=pglog_merge_result pg={} log=({},{}] missing={} changed={}",
            self.pg,
            self.log.tail(),
            self.log.head(),
            self.missing.num_missing(),
            changed
        );
        changed
    }

    /// Drops our entries newer than `newhead` and resolves each affected
    /// object by rollback or by marking it missing.
    pub fn rewind_divergent_log(&mut self, newhead: Eversion, handler: &mut dyn RollbackHandler) {
        debug!(
            "event=pglog_rewind_divergent pg={} newhead={}",
            self.pg, newhead
        );
        let original_crt = self.log.can_rollback_to();
        if self.info.last_complete > newhead {
            self.info.last_complete = newhead;
        }
        let divergent = self.log.rewind_from_head(newhead);
        if let Some(first) = divergent.first() {
            self.dirty.mark_dirty_from(first.version);
        }
        for entry in &divergent {
            info!(
                "event=pglog_rewind_divergent_entry pg={} entry=\"{}\"",
                self.pg, entry
            );
        }
        self.info.last_update = newhead;
        Self::merge_divergent_entries(
            &self.log,
            divergent,
            &self.info,
            original_crt,
            &mut self.missing,
            handler,
        );
    }

    /// Works out what a replica must discard so its log agrees with ours,
    /// adjusting the replica's info and missing set in place. Our own state
    /// is not modified.
    pub fn proc_replica_log(
        &self,
        peer_info: &mut PgInfo,
        peer_log: &PgLogRecord,
        peer_missing: &mut MissingObjectTracker,
        from: &str,
    ) {
        if peer_log.head < self.log.tail() {
            debug!(
                "event=pglog_replica_no_overlap pg={} from={} peer_head={}",
                self.pg, from, peer_log.head
            );
            return;
        }
        if peer_log.head == self.log.head() {
            debug!(
                "event=pglog_replica_same_head pg={} from={}",
                self.pg, from
            );
            return;
        }

        // Neither tail can be divergent; if no entry falls inside both
        // logs the last shared point is the larger tail.
        let limit = peer_log.tail.max(self.log.tail());
        let last_update = match self
            .log
            .entries()
            .rev()
            .find(|entry| entry.version <= peer_log.head)
        {
            Some(entry) if entry.version >= limit => entry.version,
            _ => limit,
        };

        let mut peer = IndexedLog::from_record(peer_log.clone());
        let divergent = peer.rewind_from_head(last_update);
        Self::merge_divergent_entries(
            &peer,
            divergent,
            peer_info,
            peer_log.can_rollback_to,
            peer_missing,
            &mut NoopRollback,
        );

        if last_update < peer_info.last_update {
            debug!(
                "event=pglog_replica_rewound pg={} from={} last_update={}",
                self.pg, from, last_update
            );
            peer_info.last_update = last_update;
        }

        match peer_missing.first_missing_need() {
            Some(first_missing) => {
                peer_info.last_complete = peer_log
                    .entries
                    .iter()
                    .take_while(|entry| entry.version < first_missing)
                    .last()
                    .map(|entry| entry.version)
                    .unwrap_or(Eversion::ZERO);
            }
            None => peer_info.last_complete = peer_info.last_update,
        }
    }

    pub fn needs_write(&self) -> bool {
        self.dirty.is_dirty() || self.missing.has_changes()
    }

    /// Hands dirty state to `writer`. Dirty marks survive a failed write.
    pub fn write_log_and_missing(
        &mut self,
        writer: &mut dyn LogWriter,
    ) -> Result<bool, LogWriteError> {
        if !self.needs_write() {
            debug!("event=pglog_write_skip pg={} reason=clean", self.pg);
            return Ok(false);
        }
        let descriptor = LogWriteDescriptor::build(
            &self.dirty,
            &self.log,
            &self.missing,
            self.missing.changes(),
        );
        debug!(
            "event=pglog_write pg={} dirty_to={} dirty_from={} writeout_from={} trimmed={} trimmed_dups={}",
            self.pg,
            self.dirty.dirty_to,
            self.dirty.dirty_from,
            self.dirty.writeout_from,
            self.dirty.trimmed.len(),
            self.dirty.trimmed_dups.len()
        );
        writer.write(&descriptor)?;
        self.dirty.undirty();
        self.missing.clear_changes();
        Ok(true)
    }

    fn merge_log_dups(&mut self, peer_log: &PgLogRecord) -> bool {
        let merge = self.log.merge_dups(&peer_log.dups);
        if merge.copied_all {
            self.dirty.mark_all_dups_dirty();
        }
        if let Some(from) = merge.dirty_from {
            self.dirty.mark_dirty_from_dups(from);
        }
        if let Some(to) = merge.dirty_to {
            self.dirty.mark_dirty_to_dups(to);
        }
        merge.changed
    }

    fn append_log_entries_update_missing(
        last_backfill: &LastBackfill,
        entries: Vec<LogEntry>,
        log: &mut IndexedLog,
        missing: &mut MissingObjectTracker,
    ) {
        for entry in entries {
            trace!("event=pglog_append_missing entry=\"{}\"", entry);
            if last_backfill.covers(&entry.object) && entry.object_is_indexed() {
                missing.add_next_event(&entry);
            }
            log.add(entry);
        }
    }

    fn merge_divergent_entries(
        log: &IndexedLog,
        divergent: Vec<LogEntry>,
        info: &PgInfo,
        can_rollback_to: Eversion,
        missing: &mut MissingObjectTracker,
        handler: &mut dyn RollbackHandler,
    ) {
        let mut by_object: BTreeMap<ObjectId, Vec<LogEntry>> = BTreeMap::new();
        for entry in divergent {
            by_object.entry(entry.object.clone()).or_default().push(entry);
        }
        for (object, entries) in by_object {
            Self::merge_object_divergent_entries(
                log,
                &object,
                entries,
                info,
                can_rollback_to,
                missing,
                handler,
            );
        }
    }

    fn merge_object_divergent_entries(
        log: &IndexedLog,
        object: &ObjectId,
        entries: Vec<LogEntry>,
        info: &PgInfo,
        can_rollback_to: Eversion,
        missing: &mut MissingObjectTracker,
        handler: &mut dyn RollbackHandler,
    ) {
        if !info.last_backfill.covers(object) {
            debug!("event=pglog_divergent_skip object={object} reason=beyond_backfill");
            return;
        }
        // Error markers never reached the object store.
        let entries: Vec<LogEntry> = entries
            .into_iter()
            .filter(|entry| !entry.is_error())
            .collect();
        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return;
        };
        let first_divergent = first.version;
        let prior_version = first.prior_version;
        let object_not_in_store = missing.is_missing(object).is_none() && last.is_delete();
        trace!(
            "event=pglog_divergent_object object={object} first={first_divergent} last={} prior={prior_version}",
            last.version
        );

        if let Some(logged) = log.latest_for_object(object) {
            if logged >= first_divergent {
                debug!("event=pglog_divergent_resolved object={object} reason=newer_in_log logged={logged}");
                if missing.is_missing(object).is_some() {
                    missing.revise_have(object, Eversion::ZERO);
                }
                if !object_not_in_store {
                    handler.delete_object(object);
                }
                Self::trim_divergent(&entries, handler);
                return;
            }
            if logged != prior_version {
                debug!(
                    "event=pglog_divergent_prior_mismatch object={object} logged={logged} prior={prior_version}"
                );
            }
        }

        if prior_version.is_zero() {
            debug!("event=pglog_divergent_resolved object={object} reason=created_in_divergence");
            missing.remove(object);
            if !object_not_in_store {
                handler.delete_object(object);
            }
            Self::trim_divergent(&entries, handler);
            return;
        }

        if let Some(item) = missing.is_missing(object).copied() {
            if item.have == prior_version {
                debug!("event=pglog_divergent_resolved object={object} reason=have_prior");
                missing.remove(object);
            } else {
                debug!(
                    "event=pglog_divergent_resolved object={object} reason=revise_need need={prior_version}"
                );
                missing.revise_need(object.clone(), prior_version, false);
            }
            Self::trim_divergent(&entries, handler);
            return;
        }

        let can_rollback = entries
            .iter()
            .all(|entry| entry.can_rollback() && entry.version > can_rollback_to);
        if can_rollback {
            debug!(
                "event=pglog_divergent_resolved object={object} reason=rollback entries={}",
                entries.len()
            );
            for entry in entries.iter().rev() {
                handler.rollback(entry);
            }
            return;
        }

        debug!(
            "event=pglog_divergent_resolved object={object} reason=mark_missing need={prior_version}"
        );
        if !object_not_in_store {
            handler.delete_object(object);
        }
        missing.add(object.clone(), prior_version, Eversion::ZERO, false);
        Self::trim_divergent(&entries, handler);
        if prior_version <= info.log_tail {
            debug!(
                "event=pglog_divergent_prior_trimmed object={object} prior={prior_version} tail={}",
                info.log_tail
            );
        }
    }

    fn trim_divergent(entries: &[LogEntry], handler: &mut dyn RollbackHandler) {
        for entry in entries {
            trace!("event=pglog_divergent_trim version={}", entry.version);
            handler.trim(entry);
        }
    }
}

/// Lock context for a placement group's log. Holding the guard is what
/// entitles a caller to merge, trim or write.
#[derive(Debug, Clone)]
pub struct SharedPgLog {
    inner: Arc<Mutex<PgLog>>,
}

impl SharedPgLog {
    pub fn new(log: PgLog) -> Self {
        Self {
            inner: Arc::new(Mutex::new(log)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, PgLog> {
        self.inner.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, PgLog>> {
        self.inner.try_lock()
    }
}
