//! Per-logical-key CID history (spec.md §4.4 "CidManager").
//!
//! Recording a new CID demotes the current one to the `previous` list;
//! once that list exceeds `maxHistory` (`chunkHistoryMax`, default 5) the
//! oldest entries are unpinned best-effort and dropped.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CidHistoryEntry {
    pub current: Option<String>,
    pub previous: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CidManager {
    max_history: usize,
    entries: HashMap<String, CidHistoryEntry>,
}

impl CidManager {
    pub fn new(max_history: usize) -> Self {
        Self { max_history, entries: HashMap::new() }
    }

    /// Record a new CID for `key`, returning CIDs that fell out of history
    /// and should be unpinned best-effort.
    pub fn record(&mut self, key: &str, cid: impl Into<String>) -> Vec<String> {
        let entry = self.entries.entry(key.to_string()).or_default();
        let cid = cid.into();
        if let Some(prev_current) = entry.current.replace(cid) {
            entry.previous.insert(0, prev_current);
        }
        let mut evicted = Vec::new();
        while entry.previous.len() > self.max_history {
            if let Some(oldest) = entry.previous.pop() {
                evicted.push(oldest);
            }
        }
        evicted
    }

    pub fn current(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(|e| e.current.as_deref())
    }

    pub fn history(&self, key: &str) -> &[String] {
        self.entries.get(key).map(|e| e.previous.as_slice()).unwrap_or(&[])
    }

    /// Serialize the whole table for persistence across restarts.
    pub fn export(&self) -> HashMap<String, CidHistoryEntry> {
        self.entries.clone()
    }

    pub fn import(max_history: usize, entries: HashMap<String, CidHistoryEntry>) -> Self {
        Self { max_history, entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_demotes_current_to_previous() {
        let mut mgr = CidManager::new(5);
        mgr.record("device:d1:manifest", "cid-1");
        mgr.record("device:d1:manifest", "cid-2");
        assert_eq!(mgr.current("device:d1:manifest"), Some("cid-2"));
        assert_eq!(mgr.history("device:d1:manifest"), &["cid-1".to_string()]);
    }

    #[test]
    fn overflow_evicts_oldest_for_unpinning() {
        let mut mgr = CidManager::new(2);
        mgr.record("k", "c0");
        mgr.record("k", "c1");
        mgr.record("k", "c2");
        let evicted = mgr.record("k", "c3");
        assert_eq!(evicted, vec!["c0".to_string()]);
        assert_eq!(mgr.history("k"), &["c2".to_string(), "c1".to_string()]);
    }

    #[test]
    fn export_import_round_trips() {
        let mut mgr = CidManager::new(3);
        mgr.record("k", "c0");
        mgr.record("k", "c1");
        let exported = mgr.export();
        let restored = CidManager::import(3, exported);
        assert_eq!(restored.current("k"), Some("c1"));
    }
}
