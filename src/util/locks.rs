//! Volume lock registry
//!
//! Node-side operations on a volume mutate host-global state (iSCSI node
//! database, mount table) that does not tolerate interleaving. Every stage,
//! unstage, publish, unpublish and expand brackets its work in
//! `try_acquire`/`release`; a failed acquire surfaces as Aborted so the
//! orchestrator retries later.

use parking_lot::Mutex;
use std::collections::HashSet;

/// Process-wide set of volume ids with an operation in flight.
#[derive(Debug, Default)]
pub struct VolumeLocks {
    locks: Mutex<HashSet<String>>,
}

impl VolumeLocks {
    pub fn new() -> Self {
        VolumeLocks::default()
    }

    /// Non-blocking acquire; returns false if an operation already holds the
    /// volume.
    pub fn try_acquire(&self, volume_id: &str) -> bool {
        self.locks.lock().insert(volume_id.to_string())
    }

    pub fn release(&self, volume_id: &str) {
        self.locks.lock().remove(volume_id);
    }
}

/// RAII guard variant; releases on drop.
pub struct VolumeLockGuard<'a> {
    registry: &'a VolumeLocks,
    volume_id: String,
}

impl VolumeLocks {
    /// Acquires and returns a guard that releases on drop, or None if held.
    pub fn guard(&self, volume_id: &str) -> Option<VolumeLockGuard<'_>> {
        if self.try_acquire(volume_id) {
            Some(VolumeLockGuard {
                registry: self,
                volume_id: volume_id.to_string(),
            })
        } else {
            None
        }
    }
}

impl Drop for VolumeLockGuard<'_> {
    fn drop(&mut self) {
        self.registry.release(&self.volume_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release() {
        let locks = VolumeLocks::new();
        assert!(locks.try_acquire("vol-1"));
        assert!(!locks.try_acquire("vol-1"));
        assert!(locks.try_acquire("vol-2"));
        locks.release("vol-1");
        assert!(locks.try_acquire("vol-1"));
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let locks = VolumeLocks::new();
        {
            let _guard = locks.guard("vol-1").unwrap();
            assert!(locks.guard("vol-1").is_none());
        }
        assert!(locks.guard("vol-1").is_some());
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let locks = VolumeLocks::new();
        locks.release("never-acquired");
        assert!(locks.try_acquire("never-acquired"));
    }
}
