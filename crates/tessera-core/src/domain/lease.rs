//! Remote lease record
//!
//! A lease is a time-bounded, renewable claim of exclusive write access to
//! a provider's remote index. It is persisted as a single plain JSON object
//! under [`BlobId::LEASE`](super::BlobId::LEASE).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::DeviceId;

/// Persisted lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub owner: DeviceId,
    pub acquired_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl LeaseRecord {
    /// Lease stamped now for `owner`
    pub fn new(owner: DeviceId, duration_ms: u64) -> Self {
        Self {
            owner,
            acquired_at: Utc::now(),
            duration_ms,
        }
    }

    /// `acquired_at + duration_ms`
    pub fn expires_at(&self) -> DateTime<Utc> {
        let duration = i64::try_from(self.duration_ms).unwrap_or(i64::MAX);
        self.acquired_at + Duration::milliseconds(duration)
    }

    /// True once `now` is past the expiry instant
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }

    /// True once the current time is past the expiry instant
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// True if `device` owns this lease
    pub fn is_owned_by(&self, device: &DeviceId) -> bool {
        &self.owner == device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry() {
        let lease = LeaseRecord::new(DeviceId::new("a").unwrap(), 1_000);
        assert!(!lease.is_expired_at(lease.acquired_at));
        assert!(!lease.is_expired_at(lease.acquired_at + Duration::milliseconds(1_000)));
        assert!(lease.is_expired_at(lease.acquired_at + Duration::milliseconds(1_001)));
    }

    #[test]
    fn test_ownership() {
        let lease = LeaseRecord::new(DeviceId::new("a").unwrap(), 1_000);
        assert!(lease.is_owned_by(&DeviceId::new("a").unwrap()));
        assert!(!lease.is_owned_by(&DeviceId::new("b").unwrap()));
    }
}
