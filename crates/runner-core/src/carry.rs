use std::collections::HashMap;
use std::sync::Mutex;

/// Intermediate artifact paths threaded between stages for one task (spec
/// §3 "Carry store"). No TTL: entries live from `add` until the runner
/// explicitly deletes them on a terminal transition.
#[derive(Debug, Clone, Default)]
pub struct CarryEntry {
    pub downloaded_file_path: Option<String>,
    pub converted_file_path: Option<String>,
}

/// `taskId -> CarryEntry`, single-writer-per-task under a mutex (spec §5
/// "Shared resources"). Grounded on the teacher's `InflightStore`
/// (`inflight.rs`), simplified to an in-process map: the carry store has
/// no TTL and is not meant to survive a restart, unlike the teacher's
/// disk-persisted inflight-job ledger.
#[derive(Default)]
pub struct CarryStore {
    entries: Mutex<HashMap<String, CarryEntry>>,
}

impl CarryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent entry creation: a task entering the download queue gets
    /// an empty entry if it doesn't already have one.
    pub fn create(&self, task_id: &str) {
        self.entries
            .lock()
            .unwrap()
            .entry(task_id.to_string())
            .or_default();
    }

    /// Merges the given fields into the task's entry, creating it if
    /// absent.
    pub fn set_downloaded(&self, task_id: &str, path: impl Into<String>) {
        let mut entries = self.entries.lock().unwrap();
        entries.entry(task_id.to_string()).or_default().downloaded_file_path = Some(path.into());
    }

    pub fn set_converted(&self, task_id: &str, path: impl Into<String>) {
        let mut entries = self.entries.lock().unwrap();
        entries.entry(task_id.to_string()).or_default().converted_file_path = Some(path.into());
    }

    pub fn get(&self, task_id: &str) -> Option<CarryEntry> {
        self.entries.lock().unwrap().get(task_id).cloned()
    }

    /// Removed on terminal transition (finished or failed).
    pub fn delete(&self, task_id: &str) {
        self.entries.lock().unwrap().remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_is_idempotent() {
        let store = CarryStore::new();
        store.create("t1");
        store.create("t1");
        assert!(store.get("t1").is_some());
    }

    #[test]
    fn set_merges_rather_than_overwrites_sibling_fields() {
        let store = CarryStore::new();
        store.set_downloaded("t1", "/tmp/videoconverter/t1/source");
        store.set_converted("t1", "/tmp/videoconverter/t1_converted.mp4");
        let entry = store.get("t1").unwrap();
        assert_eq!(
            entry.downloaded_file_path.as_deref(),
            Some("/tmp/videoconverter/t1/source")
        );
        assert_eq!(
            entry.converted_file_path.as_deref(),
            Some("/tmp/videoconverter/t1_converted.mp4")
        );
    }

    #[test]
    fn delete_removes_the_entry() {
        let store = CarryStore::new();
        store.set_downloaded("t1", "/tmp/x");
        store.delete("t1");
        assert!(store.get("t1").is_none());
    }

    #[test]
    fn missing_entry_returns_none() {
        let store = CarryStore::new();
        assert!(store.get("missing").is_none());
    }
}
