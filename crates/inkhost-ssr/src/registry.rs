use std::{
    collections::HashMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use chrono::{DateTime, Utc};

/// One live externally-rendered runtime process.
///
/// The OS handle itself is owned by the reaper task spawned at start time;
/// the registry keeps only what lookups and signalling need.
#[derive(Debug, Clone)]
pub struct RuntimeEntry {
    pub pid: Option<u32>,
    pub pgid: Option<i32>,
    pub port: u16,
    pub started_at: DateTime<Utc>,
}

/// In-memory table of running theme runtimes, keyed by theme name.
///
/// Rebuilt empty on host restart. Lookups take the read lock, start/stop/reap
/// take the write lock; no lock is ever held across an await point.
#[derive(Clone, Debug, Default)]
pub struct RuntimeRegistry {
    inner: Arc<RwLock<HashMap<String, RuntimeEntry>>>,
}

impl RuntimeRegistry {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, RuntimeEntry>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, RuntimeEntry>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Records a new instance. Fails (returning the entry back) if the theme
    /// already has a live entry, which enforces at-most-one per name.
    pub fn try_insert(&self, theme: &str, entry: RuntimeEntry) -> Result<(), RuntimeEntry> {
        let mut map = self.write();
        if map.contains_key(theme) {
            return Err(entry);
        }
        map.insert(theme.to_string(), entry);
        Ok(())
    }

    /// Unconditional removal; a no-op when the entry is already gone.
    pub fn remove(&self, theme: &str) -> Option<RuntimeEntry> {
        self.write().remove(theme)
    }

    /// Removal guarded by pid, used by the reaper: a reaper for an exited
    /// process must never delete an entry that a later start re-created.
    pub fn remove_if_pid(&self, theme: &str, pid: Option<u32>) -> bool {
        let mut map = self.write();
        match map.get(theme) {
            Some(e) if e.pid == pid => {
                map.remove(theme);
                true
            }
            _ => false,
        }
    }

    /// Fills in the process identifiers on a reservation inserted before the
    /// spawn. Returns false when the entry vanished in the meantime.
    pub fn set_process(&self, theme: &str, pid: Option<u32>, pgid: Option<i32>) -> bool {
        let mut map = self.write();
        match map.get_mut(theme) {
            Some(e) => {
                e.pid = pid;
                e.pgid = pgid;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, theme: &str) -> Option<RuntimeEntry> {
        self.read().get(theme).cloned()
    }

    pub fn is_running(&self, theme: &str) -> bool {
        self.read().contains_key(theme)
    }

    /// Port of a running theme, or 0 when it is not running.
    pub fn port(&self, theme: &str) -> u16 {
        self.read().get(theme).map(|e| e.port).unwrap_or(0)
    }

    pub fn list_running(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
