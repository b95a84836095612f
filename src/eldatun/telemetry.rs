//! Admin status API's data model (N): an in-memory registry of active sessions, read by the
//! `/sessions` endpoint. No metrics/reload machinery here — the admin surface is read-only status,
//! not a control plane.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub peer: String,
    pub remote: String,
    pub started_at_unix_ms: u64,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionInfo>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self { sessions: DashMap::new() }
    }

    pub fn add(&self, s: SessionInfo) {
        self.sessions.insert(s.id.clone(), s);
    }

    pub fn remove(&self, id: &str) {
        self.sessions.remove(id);
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut out: Vec<_> = self.sessions.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|s| s.started_at_unix_ms);
        out
    }
}

pub type SharedSessions = Arc<SessionRegistry>;

pub fn now_unix_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

pub fn new_session_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("s{n}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_sorted_by_start_time() {
        let reg = SessionRegistry::new();
        reg.add(SessionInfo { id: "a".into(), peer: "p1".into(), remote: "r1".into(), started_at_unix_ms: 20 });
        reg.add(SessionInfo { id: "b".into(), peer: "p2".into(), remote: "r2".into(), started_at_unix_ms: 10 });
        let snap = reg.snapshot();
        assert_eq!(snap[0].id, "b");
        assert_eq!(snap[1].id, "a");
    }

    #[test]
    fn remove_drops_entry() {
        let reg = SessionRegistry::new();
        reg.add(SessionInfo { id: "a".into(), peer: "p".into(), remote: "r".into(), started_at_unix_ms: 1 });
        reg.remove("a");
        assert!(reg.snapshot().is_empty());
    }
}
