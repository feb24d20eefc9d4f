// locks.rs — Per-key serialization for counter and tier updates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::TrustError;
use crate::state::TrustKey;

const PRUNE_AT: usize = 256;

/// Hands out one mutex per key so that updates for the same key are
/// serialized while distinct keys proceed in parallel. Locks nobody holds
/// are dropped once the table doubles past its last pruned size.
#[derive(Debug)]
pub(crate) struct KeyLocks {
    table: Mutex<LockTable>,
}

#[derive(Debug)]
struct LockTable {
    locks: HashMap<TrustKey, Arc<Mutex<()>>>,
    prune_at: usize,
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self {
            table: Mutex::new(LockTable {
                locks: HashMap::new(),
                prune_at: PRUNE_AT,
            }),
        }
    }
}

impl KeyLocks {
    pub(crate) fn for_key(&self, key: &TrustKey) -> Result<Arc<Mutex<()>>, TrustError> {
        let mut table = self.table.lock()?;
        if table.locks.len() >= table.prune_at {
            // Only the table holds an idle lock.
            table.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            table.prune_at = (table.locks.len() * 2).max(PRUNE_AT);
        }
        Ok(table
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table.lock().map(|t| t.locks.len()).unwrap_or_default()
    }
}
