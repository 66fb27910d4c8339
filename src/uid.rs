//! Fresh UID generation.
//!
//! Real deployments mint UIDs under a registered site root using whatever
//! scheme the operator's PACS vendor requires (a counter backed by durable
//! storage, a UUID-derived OID, etc). That allocation policy is outside
//! this crate's concern; [`UidSource`] is the seam the rest of the service
//! depends on, and [`SiteUidSource`] is a minimal process-local generator
//! suitable for a single-instance deployment.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of fresh, globally unique SOP/Study/Series instance UIDs.
pub trait UidSource: Send + Sync {
    fn new_uid(&self) -> String;
}

/// Generates UIDs under a configured root, `<root>.<pid-ish>.<counter>`.
///
/// This satisfies uniqueness for a single running process; a real
/// deployment backing multiple instances of this service under one root
/// would swap in a source that coordinates allocation externally (e.g. a
/// database sequence), which is why this lives behind [`UidSource`].
pub struct SiteUidSource {
    root: String,
    epoch: u64,
    counter: AtomicU64,
}

impl SiteUidSource {
    pub fn new(root: impl Into<String>) -> Self {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            root: root.into(),
            epoch,
            counter: AtomicU64::new(0),
        }
    }
}

impl UidSource for SiteUidSource {
    fn new_uid(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut uid = format!("{}.{}.{}", self.root.trim_end_matches('.'), self.epoch, n);
        // UIDs are capped at 64 characters by the standard.
        uid.truncate(64);
        uid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_uids_are_distinct_and_rooted() {
        let src = SiteUidSource::new("1.2.826.0.1.3680043.8.498");
        let a = src.new_uid();
        let b = src.new_uid();
        assert_ne!(a, b);
        assert!(a.starts_with("1.2.826.0.1.3680043.8.498."));
        assert!(a.len() <= 64);
    }
}
