//! Volatile persistence backed by in-process maps.

use std::collections::HashMap;

use super::index::LogIndex;
use super::{BatchToken, DEFAULT_CAPACITY, Persistence, validate_group_name};
use crate::error::PersistenceError;
use crate::log_record::{Log, LogId, PersistedLog};

#[derive(Default)]
struct GroupStore {
    index: LogIndex,
    logs: HashMap<LogId, Log>,
}

/// Persistence that keeps logs in memory only.
///
/// Logs do not survive the process; the capacity and claim semantics match
/// [`FilePersistence`](super::FilePersistence).
pub struct MemoryPersistence {
    capacity: usize,
    next_id: u64,
    groups: HashMap<String, GroupStore>,
    closed: bool,
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl MemoryPersistence {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: 1,
            groups: HashMap::new(),
            closed: false,
        }
    }
}

impl Persistence for MemoryPersistence {
    fn put_log(&mut self, group: &str, log: Log) -> Result<LogId, PersistenceError> {
        if self.closed {
            return Err(PersistenceError::Closed);
        }
        validate_group_name(group)?;
        let id = LogId(self.next_id);
        self.next_id += 1;
        let store = self.groups.entry(group.to_owned()).or_default();
        let evicted = store.index.insert(id, log.timestamp, self.capacity);
        store.logs.insert(id, log);
        for old in evicted {
            log::debug!("MemoryPersistence: evicted log {old} from group '{group}'");
            store.logs.remove(&old);
        }
        Ok(id)
    }

    fn get_logs(
        &mut self,
        group: &str,
        limit: usize,
        out: &mut Vec<PersistedLog>,
    ) -> Option<BatchToken> {
        let store = self.groups.get_mut(group)?;
        let ids = store.index.unclaimed(limit);
        let token = store.index.claim(ids.clone())?;
        out.extend(ids.into_iter().filter_map(|id| {
            store.logs.get(&id).map(|log| PersistedLog {
                id,
                group: group.to_owned(),
                log: log.clone(),
            })
        }));
        Some(token)
    }

    fn delete_batch(&mut self, group: &str, token: &BatchToken) {
        if let Some(store) = self.groups.get_mut(group) {
            for id in store.index.take_claim(token) {
                store.logs.remove(&id);
            }
        }
    }

    fn delete_logs(&mut self, group: &str) {
        self.groups.remove(group);
    }

    fn release_logs(&mut self, group: &str, token: &BatchToken) {
        if let Some(store) = self.groups.get_mut(group) {
            store.index.release(token);
        }
    }

    fn clear_pending_log_state(&mut self) {
        for store in self.groups.values_mut() {
            store.index.release_all();
        }
    }

    fn count_logs(&self, group: &str) -> usize {
        self.groups.get(group).map_or(0, |store| store.index.len())
    }

    fn count_pending_logs(&self, group: &str) -> usize {
        self.groups
            .get(group)
            .map_or(0, |store| store.index.unclaimed_len())
    }

    fn close(&mut self) -> Result<(), PersistenceError> {
        self.closed = true;
        self.groups.clear();
        Ok(())
    }
}
