//! Per-nullifier submission cooldown.

use sled::{Db, IVec, Tree};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::debug;

use crate::store::StoreError;

const COOLDOWN_TREE: &str = "cooldown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownDecision {
    /// Attempt recorded.
    Allowed,
    Limited { retry_after_ms: u64 },
}

#[derive(Clone)]
pub struct CooldownStore {
    window_ms: u64,
    backend: Arc<CooldownBackend>,
}

enum CooldownBackend {
    InMemory(Mutex<HashMap<String, u64>>),
    Persistent(Tree),
}

impl CooldownStore {
    pub fn in_memory(window: Duration) -> Self {
        Self {
            window_ms: window.as_millis() as u64,
            backend: Arc::new(CooldownBackend::InMemory(Mutex::new(HashMap::new()))),
        }
    }

    pub fn persistent(db: &Db, window: Duration) -> Result<Self, StoreError> {
        let tree = db.open_tree(COOLDOWN_TREE)?;
        Ok(Self {
            window_ms: window.as_millis() as u64,
            backend: Arc::new(CooldownBackend::Persistent(tree)),
        })
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn check(&self, key: &str) -> Result<CooldownDecision, StoreError> {
        self.check_at(key, now_ms())
    }

    /// Record an attempt at `now_ms` unless the previous one is too recent.
    pub fn check_at(&self, key: &str, now_ms: u64) -> Result<CooldownDecision, StoreError> {
        if self.window_ms == 0 {
            return Ok(CooldownDecision::Allowed);
        }

        match &*self.backend {
            CooldownBackend::InMemory(entries) => {
                let mut entries = entries.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(decision) = entries.get(key).and_then(|last| self.limited(*last, now_ms)) {
                    return Ok(decision);
                }
                entries.insert(key.to_string(), now_ms);
                Ok(CooldownDecision::Allowed)
            }
            CooldownBackend::Persistent(tree) => loop {
                let current = tree.get(key)?;
                if let Some(raw) = &current {
                    if let Some(decision) = self.limited(decode_ts(raw)?, now_ms) {
                        return Ok(decision);
                    }
                }
                let swapped = tree.compare_and_swap(
                    key,
                    current,
                    Some(IVec::from(&now_ms.to_be_bytes()[..])),
                )?;
                if swapped.is_ok() {
                    return Ok(CooldownDecision::Allowed);
                }
                debug!("Cooldown entry {} changed concurrently, retrying", key);
            },
        }
    }

    /// Drop entries whose window has passed. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        self.purge_expired_at(now_ms())
    }

    pub fn purge_expired_at(&self, now_ms: u64) -> Result<usize, StoreError> {
        match &*self.backend {
            CooldownBackend::InMemory(entries) => {
                let mut entries = entries.lock().unwrap_or_else(|p| p.into_inner());
                let before = entries.len();
                entries.retain(|_, last| self.limited(*last, now_ms).is_some());
                Ok(before - entries.len())
            }
            CooldownBackend::Persistent(tree) => {
                let mut removed = 0;
                for entry in tree.iter() {
                    let (key, raw) = entry?;
                    if self.limited(decode_ts(&raw)?, now_ms).is_some() {
                        continue;
                    }
                    // only remove if nobody refreshed it in between
                    if tree.compare_and_swap(&key, Some(&raw), None::<IVec>)?.is_ok() {
                        removed += 1;
                    }
                }
                Ok(removed)
            }
        }
    }

    fn limited(&self, last_ms: u64, now_ms: u64) -> Option<CooldownDecision> {
        let until = last_ms.saturating_add(self.window_ms);
        (now_ms < until).then(|| CooldownDecision::Limited {
            retry_after_ms: until - now_ms,
        })
    }
}

fn decode_ts(raw: &IVec) -> Result<u64, StoreError> {
    <[u8; 8]>::try_from(raw.as_ref())
        .map(u64::from_be_bytes)
        .map_err(|_| StoreError::Corrupt("cooldown timestamp is not 8 bytes".into()))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
