//! Per-group bookkeeping shared by the persistence implementations.
//!
//! The index tracks which ids exist for a group, their timestamps (for
//! eviction), and which batch claim each id belongs to. Claim state is
//! volatile by construction: it lives only in this structure.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use super::BatchToken;
use crate::log_record::LogId;

#[derive(Debug)]
struct Entry {
    timestamp: DateTime<Utc>,
    claim: Option<BatchToken>,
}

/// Ordered index of one group's persisted logs.
#[derive(Debug, Default)]
pub(crate) struct LogIndex {
    entries: BTreeMap<LogId, Entry>,
    claims: HashMap<BatchToken, Vec<LogId>>,
}

impl LogIndex {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids not covered by any claim.
    pub(crate) fn unclaimed_len(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.claim.is_none())
            .count()
    }

    pub(crate) fn claim_count(&self) -> usize {
        self.claims.len()
    }

    /// Record a new id, then evict down to `capacity`.
    ///
    /// Returns the evicted ids, oldest timestamp first. Evicted ids that were
    /// part of a claim are removed from that claim.
    pub(crate) fn insert(
        &mut self,
        id: LogId,
        timestamp: DateTime<Utc>,
        capacity: usize,
    ) -> Vec<LogId> {
        self.entries.insert(
            id,
            Entry {
                timestamp,
                claim: None,
            },
        );
        let mut evicted = Vec::new();
        while self.entries.len() > capacity {
            let Some(oldest) = self.oldest() else {
                break;
            };
            self.remove(oldest);
            evicted.push(oldest);
        }
        evicted
    }

    fn oldest(&self) -> Option<LogId> {
        self.entries
            .iter()
            .min_by_key(|(id, entry)| (entry.timestamp, **id))
            .map(|(id, _)| *id)
    }

    /// Remove a single id, detaching it from its claim.
    pub(crate) fn remove(&mut self, id: LogId) {
        let Some(entry) = self.entries.remove(&id) else {
            return;
        };
        if let Some(token) = entry.claim
            && let Some(ids) = self.claims.get_mut(&token)
        {
            ids.retain(|claimed| *claimed != id);
        }
    }

    /// Up to `limit` unclaimed ids in insertion order.
    pub(crate) fn unclaimed(&self, limit: usize) -> Vec<LogId> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.claim.is_none())
            .take(limit)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Claim `ids` under a fresh token.
    pub(crate) fn claim(&mut self, ids: Vec<LogId>) -> Option<BatchToken> {
        if ids.is_empty() {
            return None;
        }
        let token = BatchToken::new();
        for id in &ids {
            if let Some(entry) = self.entries.get_mut(id) {
                entry.claim = Some(token);
            }
        }
        self.claims.insert(token, ids);
        Some(token)
    }

    /// Drop a claim and every id it covers; returns the removed ids.
    pub(crate) fn take_claim(&mut self, token: &BatchToken) -> Vec<LogId> {
        let ids = self.claims.remove(token).unwrap_or_default();
        for id in &ids {
            self.entries.remove(id);
        }
        ids
    }

    /// Release a claim so its ids can be batched again.
    pub(crate) fn release(&mut self, token: &BatchToken) -> usize {
        let ids = self.claims.remove(token).unwrap_or_default();
        for id in &ids {
            if let Some(entry) = self.entries.get_mut(id) {
                entry.claim = None;
            }
        }
        ids.len()
    }

    pub(crate) fn release_all(&mut self) {
        self.claims.clear();
        for entry in self.entries.values_mut() {
            entry.claim = None;
        }
    }

    /// Forget every id; returns them for the caller to delete.
    pub(crate) fn clear(&mut self) -> Vec<LogId> {
        self.claims.clear();
        std::mem::take(&mut self.entries).into_keys().collect()
    }
}
