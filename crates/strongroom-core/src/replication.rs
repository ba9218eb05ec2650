//! Replication role flags.
//!
//! The node only reads these; the replication protocol that sets them lives
//! elsewhere. A DR secondary accepts replicated writes but does not serve
//! requests, so activation skips its request-serving subsystems.

use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

bitflags! {
    /// A set of replication role bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ReplicationFlags: u32 {
        /// This cluster is a disaster-recovery secondary.
        const DR_SECONDARY = 1 << 0;
        /// Disaster-recovery replication is explicitly disabled.
        const DR_DISABLED = 1 << 1;
        /// This cluster is a performance secondary.
        const PERFORMANCE_SECONDARY = 1 << 2;
        /// Performance replication is explicitly disabled.
        const PERFORMANCE_DISABLED = 1 << 3;
    }
}

/// Atomically updated replication flags.
#[derive(Debug, Default)]
pub struct ReplicationState(AtomicU32);

impl ReplicationState {
    /// Start with the given flags.
    #[must_use]
    pub fn new(flags: ReplicationFlags) -> Self {
        Self(AtomicU32::new(flags.bits()))
    }

    /// Current flags.
    #[must_use]
    pub fn load(&self) -> ReplicationFlags {
        ReplicationFlags::from_bits_truncate(self.0.load(Ordering::SeqCst))
    }

    /// Set the given bits.
    pub fn insert(&self, flags: ReplicationFlags) {
        self.0.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    /// Clear the given bits.
    pub fn remove(&self, flags: ReplicationFlags) {
        self.0.fetch_and(!flags.bits(), Ordering::SeqCst);
    }

    /// Whether this node is a DR secondary.
    #[must_use]
    pub fn is_dr_secondary(&self) -> bool {
        self.load().contains(ReplicationFlags::DR_SECONDARY)
    }

    /// Whether this node is a performance secondary.
    #[must_use]
    pub fn is_performance_secondary(&self) -> bool {
        self.load().contains(ReplicationFlags::PERFORMANCE_SECONDARY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_toggle_independently() {
        let state = ReplicationState::new(ReplicationFlags::DR_DISABLED);
        assert!(!state.is_dr_secondary());
        state.insert(ReplicationFlags::DR_SECONDARY | ReplicationFlags::PERFORMANCE_DISABLED);
        assert!(state.is_dr_secondary());
        assert!(state.load().contains(ReplicationFlags::DR_DISABLED));
        state.remove(ReplicationFlags::DR_SECONDARY);
        assert!(!state.is_dr_secondary());
        assert!(!state.is_performance_secondary());
    }

    #[test]
    fn unknown_bits_are_dropped_on_load() {
        let state = ReplicationState(AtomicU32::new(u32::MAX));
        assert_eq!(state.load(), ReplicationFlags::all());
        assert!(state.is_performance_secondary());
    }

    #[test]
    fn debug_names_set_flags() {
        let flags = ReplicationFlags::DR_SECONDARY | ReplicationFlags::PERFORMANCE_DISABLED;
        let shown = format!("{flags:?}");
        assert!(shown.contains("DR_SECONDARY"));
        assert!(shown.contains("PERFORMANCE_DISABLED"));
        assert!(!shown.contains("DR_DISABLED"));
    }
}
