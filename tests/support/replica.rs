#![allow(dead_code)]

use pgcore::pglog::{
    Eversion, LogEntry, LogWriteDescriptor, LogWriteError, LogWriter, ObjectId, PgInfo, PgLog,
    PgLogConfig, PgLogRecord, RequestId, RollbackHandler,
};

pub fn ev(epoch: u64, version: u64) -> Eversion {
    Eversion::new(epoch, version)
}

/// Object store double that records every hook the log invokes.
#[derive(Debug, Default)]
pub struct RecordingStore {
    pub rolled_back: Vec<(ObjectId, Eversion)>,
    pub deleted: Vec<ObjectId>,
    pub rolled_forward: Vec<Eversion>,
    pub trimmed: Vec<Eversion>,
    pub writes: Vec<LogWriteDescriptor>,
    pub reject_writes: bool,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rolled_back_versions(&self) -> Vec<Eversion> {
        self.rolled_back.iter().map(|(_, version)| *version).collect()
    }
}

impl RollbackHandler for RecordingStore {
    fn rollback(&mut self, entry: &LogEntry) {
        self.rolled_back.push((entry.object.clone(), entry.version));
    }

    fn delete_object(&mut self, object: &ObjectId) {
        self.deleted.push(object.clone());
    }

    fn roll_forward(&mut self, entry: &LogEntry) {
        self.rolled_forward.push(entry.version);
    }

    fn trim(&mut self, entry: &LogEntry) {
        self.trimmed.push(entry.version);
    }
}

impl LogWriter for RecordingStore {
    fn write(&mut self, descriptor: &LogWriteDescriptor) -> Result<(), LogWriteError> {
        if self.reject_writes {
            return Err(LogWriteError::Rejected("store is read-only".into()));
        }
        self.writes.push(descriptor.clone());
        Ok(())
    }
}

/// Entries `1..=count` in `epoch`, each touching `obj{i % objects}` with a
/// request id from `client`.
pub fn linear_entries(epoch: u64, count: u64, objects: u64) -> Vec<LogEntry> {
    let mut last: Vec<Eversion> = vec![Eversion::ZERO; objects as usize];
    (1..=count)
        .map(|i| {
            let slot = (i % objects) as usize;
            let version = ev(epoch, i);
            let entry = LogEntry::modify(version, format!("obj{slot}"), last[slot])
                .with_request(RequestId::new("client", i));
            last[slot] = version;
            entry
        })
        .collect()
}

/// A replica whose store matches `record` exactly.
pub fn replica(record: PgLogRecord) -> PgLog {
    replica_with(record, PgLogConfig::default())
}

pub fn replica_with(record: PgLogRecord, config: PgLogConfig) -> PgLog {
    let info = PgInfo::for_log(&record);
    PgLog::from_record("1.0", record, info, config)
}
