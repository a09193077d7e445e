use super::entry::{LogEntry, ObjectId};

/// Object-store hooks invoked synchronously while divergent history is
/// resolved. Implementations must not call back into the log.
pub trait RollbackHandler {
    /// Reverts the object touched by `entry` to `entry.prior_version`.
    fn rollback(&mut self, entry: &LogEntry);
    /// Removes the local copy of an object whose state cannot be recovered.
    fn delete_object(&mut self, object: &ObjectId);
    /// `entry` is committed; its rollback metadata may be discarded.
    fn roll_forward(&mut self, _entry: &LogEntry) {}
    /// `entry` was discarded without being rolled back; drop any rollback
    /// metadata stashed for it. The entry is never applied.
    fn trim(&mut self, _entry: &LogEntry) {}
}

/// Handler for read-only simulations such as replica log processing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRollback;

impl RollbackHandler for NoopRollback {
    fn rollback(&mut self, _entry: &LogEntry) {}

    fn delete_object(&mut self, _object: &ObjectId) {}
}
