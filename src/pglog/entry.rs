use super::version::Eversion;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of an object within a placement group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub String);

impl ObjectId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Client request identity used to answer retried requests from the log or
/// the dup ledger instead of re-executing them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId {
    pub client: String,
    pub tid: u64,
}

impl RequestId {
    pub fn new(client: impl Into<String>, tid: u64) -> Self {
        Self {
            client: client.into(),
            tid,
        }
    }

    pub fn key_name(&self) -> String {
        format!("dup_{}.{}", self.client, self.tid)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client, self.tid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOp {
    Modify,
    Delete,
    /// Failed request recorded only so a retry observes the same error.
    Error { return_code: i32 },
}

impl LogOp {
    pub fn is_error(&self) -> bool {
        matches!(self, LogOp::Error { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, LogOp::Delete)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub version: Eversion,
    pub object: ObjectId,
    pub op: LogOp,
    pub prior_version: Eversion,
    pub request: Option<RequestId>,
    /// Whether the object store kept enough metadata to undo this mutation.
    pub rollbackable: bool,
}

impl LogEntry {
    pub fn modify(version: Eversion, object: impl Into<ObjectId>, prior: Eversion) -> Self {
        Self {
            version,
            object: object.into(),
            op: LogOp::Modify,
            prior_version: prior,
            request: None,
            rollbackable: false,
        }
    }

    pub fn delete(version: Eversion, object: impl Into<ObjectId>, prior: Eversion) -> Self {
        Self {
            op: LogOp::Delete,
            ..Self::modify(version, object, prior)
        }
    }

    pub fn error(version: Eversion, object: impl Into<ObjectId>, return_code: i32) -> Self {
        Self {
            op: LogOp::Error { return_code },
            ..Self::modify(version, object, Eversion::ZERO)
        }
    }

    pub fn with_request(mut self, request: RequestId) -> Self {
        self.request = Some(request);
        self
    }

    pub fn rollbackable(mut self, rollbackable: bool) -> Self {
        self.rollbackable = rollbackable;
        self
    }

    pub fn is_error(&self) -> bool {
        self.op.is_error()
    }

    pub fn is_delete(&self) -> bool {
        self.op.is_delete()
    }

    /// Error markers never touched the object and are not tracked per object.
    pub fn object_is_indexed(&self) -> bool {
        !self.is_error()
    }

    pub fn can_rollback(&self) -> bool {
        self.rollbackable
    }

    pub fn return_code(&self) -> i32 {
        match self.op {
            LogOp::Error { return_code } => return_code,
            _ => 0,
        }
    }
}

impl From<String> for ObjectId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            LogOp::Modify => "modify",
            LogOp::Delete => "delete",
            LogOp::Error { .. } => "error",
        };
        write!(
            f,
            "{} ({}) {} {}",
            self.version, self.prior_version, op, self.object
        )
    }
}

/// Request-dedup record kept after the owning log entry is trimmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DupEntry {
    pub request: RequestId,
    pub version: Eversion,
    pub return_code: i32,
}

impl DupEntry {
    pub fn from_entry(entry: &LogEntry) -> Option<Self> {
        entry.request.as_ref().map(|request| Self {
            request: request.clone(),
            version: entry.version,
            return_code: entry.return_code(),
        })
    }

    pub fn key_name(&self) -> String {
        self.request.key_name()
    }
}
