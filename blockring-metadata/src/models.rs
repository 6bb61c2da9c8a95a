//! Records kept by metadata backends

use blockring_core::INodeRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lease identifier granted by a metadata backend
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeaseId(pub i64);

impl fmt::Debug for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LeaseId({})", self.0)
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Named, immutable capture of a volume's root pointer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub when: DateTime<Utc>,
    pub inode: INodeRef,
}

impl Snapshot {
    pub fn new(name: impl Into<String>, inode: INodeRef) -> Self {
        Self {
            name: name.into(),
            when: Utc::now(),
            inode,
        }
    }
}

/// Lease holder with its expiry in unix milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LeaseRecord {
    pub lease: LeaseId,
    pub expires_at_ms: i64,
}

impl LeaseRecord {
    pub fn new(lease: LeaseId, ttl: std::time::Duration) -> Self {
        Self {
            lease,
            expires_at_ms: now_ms() + ttl.as_millis() as i64,
        }
    }

    pub fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at_ms > now_ms
    }
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_lease_record_expiry() {
        let record = LeaseRecord::new(LeaseId(7), Duration::from_secs(10));
        assert!(record.is_live(now_ms()));
        assert!(!record.is_live(record.expires_at_ms));
    }
}
