//! Durable persistence storing one MessagePack file per log.
//!
//! Layout: `<root>/<group>/<id>.log`, where `<id>` is zero padded so that a
//! directory listing sorts in insertion order. Files are written through a
//! temporary file in the same directory and renamed into place after
//! `sync_all`, so a crash never leaves a half-written log behind.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use tempfile::NamedTempFile;

use super::index::LogIndex;
use super::{BatchToken, DEFAULT_CAPACITY, Persistence, validate_group_name};
use crate::error::PersistenceError;
use crate::log_record::{Log, LogId, PersistedLog};

const LOG_EXTENSION: &str = "log";

/// Persistence writing each log to its own file under a root directory.
pub struct FilePersistence {
    root: PathBuf,
    capacity: usize,
    next_id: u64,
    groups: HashMap<String, LogIndex>,
    closed: bool,
}

impl FilePersistence {
    /// Open (or create) a store rooted at `root` with the default capacity.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        Self::with_capacity(root, DEFAULT_CAPACITY)
    }

    /// Open a store and index every log already on disk.
    ///
    /// Files that cannot be decoded are removed with a warning. Id
    /// allocation resumes above the highest id found.
    pub fn with_capacity(
        root: impl Into<PathBuf>,
        capacity: usize,
    ) -> Result<Self, PersistenceError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let mut store = Self {
            root,
            capacity: capacity.max(1),
            next_id: 1,
            groups: HashMap::new(),
            closed: false,
        };
        store.load_existing()?;
        Ok(store)
    }

    /// Directory holding the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn group_dir(&self, group: &str) -> PathBuf {
        self.root.join(group)
    }

    fn log_path(&self, group: &str, id: LogId) -> PathBuf {
        self.group_dir(group)
            .join(format!("{:020}.{LOG_EXTENSION}", id.0))
    }

    fn load_existing(&mut self) -> Result<(), PersistenceError> {
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(group) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if validate_group_name(&group).is_err() {
                continue;
            }
            self.load_group(&group, &entry.path())?;
        }
        Ok(())
    }

    fn load_group(&mut self, group: &str, dir: &Path) -> Result<(), PersistenceError> {
        let mut found = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if let Some(id) = parse_log_id(&path) {
                found.push((id, path));
            }
        }
        found.sort_by_key(|(id, _)| *id);

        let mut index = LogIndex::default();
        for (id, path) in found {
            self.next_id = self.next_id.max(id.0 + 1);
            match read_log(&path) {
                Ok(log) => {
                    for old in index.insert(id, log.timestamp, self.capacity) {
                        remove_file_quietly(&self.log_path(group, old));
                    }
                }
                Err(err) => {
                    warn!(
                        "FilePersistence: discarding unreadable log {}: {err}",
                        path.display()
                    );
                    remove_file_quietly(&path);
                }
            }
        }
        if !index.is_empty() {
            debug!(
                "FilePersistence: recovered {} logs for group '{group}'",
                index.len()
            );
            self.groups.insert(group.to_owned(), index);
        }
        Ok(())
    }

    fn write_log(&self, group: &str, id: LogId, log: &Log) -> Result<(), PersistenceError> {
        let dir = self.group_dir(group);
        fs::create_dir_all(&dir)?;
        let bytes = rmp_serde::to_vec_named(log)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.log_path(group, id))
            .map_err(|err| PersistenceError::Io(err.error))?;
        Ok(())
    }

    fn remove_ids(&self, group: &str, ids: impl IntoIterator<Item = LogId>) {
        for id in ids {
            remove_file_quietly(&self.log_path(group, id));
        }
    }
}

impl Persistence for FilePersistence {
    fn put_log(&mut self, group: &str, log: Log) -> Result<LogId, PersistenceError> {
        if self.closed {
            return Err(PersistenceError::Closed);
        }
        validate_group_name(group)?;
        let id = LogId(self.next_id);
        self.write_log(group, id, &log)?;
        self.next_id += 1;
        let capacity = self.capacity;
        let evicted = self
            .groups
            .entry(group.to_owned())
            .or_default()
            .insert(id, log.timestamp, capacity);
        if !evicted.is_empty() {
            debug!(
                "FilePersistence: group '{group}' over capacity, evicted {} logs",
                evicted.len()
            );
            self.remove_ids(group, evicted);
        }
        Ok(id)
    }

    fn get_logs(
        &mut self,
        group: &str,
        limit: usize,
        out: &mut Vec<PersistedLog>,
    ) -> Option<BatchToken> {
        if self.closed {
            return None;
        }
        let candidates = self.groups.get(group)?.unclaimed(limit);
        let mut claimed = Vec::with_capacity(candidates.len());
        let mut corrupt = Vec::new();
        for id in candidates {
            match read_log(&self.log_path(group, id)) {
                Ok(log) => claimed.push(PersistedLog {
                    id,
                    group: group.to_owned(),
                    log,
                }),
                Err(err) => {
                    warn!("FilePersistence: dropping unreadable log {id} in '{group}': {err}");
                    corrupt.push(id);
                }
            }
        }
        let index = self.groups.get_mut(group)?;
        for id in &corrupt {
            index.remove(*id);
        }
        let token = index.claim(claimed.iter().map(|p| p.id).collect());
        self.remove_ids(group, corrupt);
        if token.is_some() {
            out.extend(claimed);
        }
        token
    }

    fn delete_batch(&mut self, group: &str, token: &BatchToken) {
        let Some(index) = self.groups.get_mut(group) else {
            return;
        };
        let ids = index.take_claim(token);
        self.remove_ids(group, ids);
    }

    fn delete_logs(&mut self, group: &str) {
        self.groups.remove(group);
        let dir = self.group_dir(group);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                "FilePersistence: failed to delete logs for group '{group}': {err}"
            ),
        }
    }

    fn release_logs(&mut self, group: &str, token: &BatchToken) {
        if let Some(index) = self.groups.get_mut(group) {
            index.release(token);
        }
    }

    fn clear_pending_log_state(&mut self) {
        for index in self.groups.values_mut() {
            index.release_all();
        }
    }

    fn count_logs(&self, group: &str) -> usize {
        self.groups.get(group).map_or(0, LogIndex::len)
    }

    fn count_pending_logs(&self, group: &str) -> usize {
        self.groups.get(group).map_or(0, LogIndex::unclaimed_len)
    }

    fn close(&mut self) -> Result<(), PersistenceError> {
        self.closed = true;
        self.groups.clear();
        Ok(())
    }
}

fn parse_log_id(path: &Path) -> Option<LogId> {
    if path.extension()?.to_str()? != LOG_EXTENSION {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok().map(LogId)
}

fn read_log(path: &Path) -> Result<Log, PersistenceError> {
    let bytes = fs::read(path)?;
    Ok(rmp_serde::from_slice(&bytes)?)
}

fn remove_file_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path)
        && err.kind() != io::ErrorKind::NotFound
    {
        warn!("FilePersistence: failed to remove {}: {err}", path.display());
    }
}
