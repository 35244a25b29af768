//! In-flight nullifier guard.
//!
//! One guard is shared by every chain, so the same note cannot be relayed
//! twice at once even across chains. Entries live only in memory; the
//! pool's spent flag is what actually prevents double spends.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::debug;

use crate::error::RelayerError;

#[derive(Debug, Default)]
pub struct NullifierGuard {
    in_flight: Mutex<HashSet<String>>,
}

impl NullifierGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashSet<String>> {
        // A panic while holding the lock cannot leave the set half-updated.
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim `nullifier`. `false` if someone else holds it.
    pub fn acquire(&self, nullifier: &str) -> bool {
        self.entries().insert(nullifier.to_string())
    }

    /// Idempotent.
    pub fn release(&self, nullifier: &str) {
        self.entries().remove(nullifier);
    }

    pub fn is_held(&self, nullifier: &str) -> bool {
        self.entries().contains(nullifier)
    }

    pub fn in_flight(&self) -> usize {
        self.entries().len()
    }

    /// Claim all `nullifiers` in order, all or nothing.
    ///
    /// The returned lease releases them when dropped.
    pub fn lock(self: &Arc<Self>, nullifiers: &[String]) -> Result<NullifierLease, RelayerError> {
        let mut lease = NullifierLease {
            guard: Arc::clone(self),
            held: Vec::with_capacity(nullifiers.len()),
        };
        for nullifier in nullifiers {
            if !self.acquire(nullifier) {
                debug!("Nullifier {} already in flight", nullifier);
                // dropping `lease` frees whatever was taken so far
                return Err(RelayerError::Conflict {
                    nullifier: nullifier.clone(),
                });
            }
            lease.held.push(nullifier.clone());
        }
        Ok(lease)
    }
}

/// Nullifiers held by one submission.
#[derive(Debug)]
pub struct NullifierLease {
    guard: Arc<NullifierGuard>,
    held: Vec<String>,
}

impl NullifierLease {
    pub fn nullifiers(&self) -> &[String] {
        &self.held
    }
}

impl Drop for NullifierLease {
    fn drop(&mut self) {
        for nullifier in self.held.drain(..) {
            self.guard.release(&nullifier);
        }
    }
}
