//! In-memory device-record map, keyed by `(user_id, ip)` (§3, §4.2).
//! Guarded by a single mutex; only the orchestrator and dispatcher mutate
//! it, per the shared-resource policy in §5.

use std::collections::HashMap;

use parking_lot::Mutex;

use core_common::model::DeviceRecord;
use crate::scanner::CancelToken;

#[derive(Default)]
pub struct DeviceStore {
    records: Mutex<HashMap<(String, String), DeviceRecord>>,
    active_scan: Mutex<Option<CancelToken>>,
}

impl DeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, record: DeviceRecord) {
        self.records.lock().insert(record.key(), record);
    }

    pub fn get(&self, user_id: &str, ip: &str) -> Option<DeviceRecord> {
        self.records.lock().get(&(user_id.to_string(), ip.to_string())).cloned()
    }

    pub fn list_for_user(&self, user_id: &str) -> Vec<DeviceRecord> {
        self.records
            .lock()
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect()
    }

    /// No two scans run concurrently per user; starting a new scan first
    /// deletes prior records for that user and cancels any scan already
    /// in flight.
    pub fn begin_scan(&self, user_id: &str) -> CancelToken {
        let mut active = self.active_scan.lock();
        if let Some(prev) = active.take() {
            prev.cancel();
        }
        self.records.lock().retain(|(uid, _), _| uid != user_id);
        let token = CancelToken::new();
        *active = Some(token.clone());
        token
    }

    pub fn end_scan(&self, token: &CancelToken) {
        let mut active = self.active_scan.lock();
        if matches!(active.as_ref(), Some(t) if t.is_same(token)) {
            *active = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use core_common::model::{Brand, RtspTestOutcome};

    fn record(user_id: &str, ip: &str) -> DeviceRecord {
        DeviceRecord {
            user_id: user_id.to_string(),
            ip: ip.to_string(),
            brand: Brand::Generic,
            confidence: 0.3,
            open_ports: vec![554],
            rtsp_url_templates: vec![],
            default_users: vec![],
            default_passwords: vec![],
            discovered_at: Utc::now(),
            validated_rtsp_url: None,
            last_test_outcome: RtspTestOutcome::Untested,
        }
    }

    #[test]
    fn begin_scan_clears_prior_records_for_user_only() {
        let store = DeviceStore::new();
        store.upsert(record("u1", "10.0.0.1"));
        store.upsert(record("u2", "10.0.0.2"));
        store.begin_scan("u1");
        assert!(store.list_for_user("u1").is_empty());
        assert_eq!(store.list_for_user("u2").len(), 1);
    }

    #[test]
    fn upsert_replaces_by_key() {
        let store = DeviceStore::new();
        store.upsert(record("u1", "10.0.0.1"));
        let mut updated = record("u1", "10.0.0.1");
        updated.confidence = 0.9;
        store.upsert(updated);
        assert_eq!(store.get("u1", "10.0.0.1").unwrap().confidence, 0.9);
    }
}
