//! Audit logging for gateway decisions
//!
//! Records every dispatched request, every approval and rejection, and every
//! dropped envelope to a local append-only log for security review.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// One audit line.
#[derive(Debug, Serialize)]
struct AuditEntry {
    timestamp: String,
    account: String,
    requester: String,
    operation: String,
    decision: String,
}

/// Append-only audit log, stored as a JSONL sidecar next to the database path.
pub struct AuditLog {
    path: PathBuf,
    enabled: bool,
}

impl AuditLog {
    pub fn new(db_path: &Path) -> Self {
        let path = db_path.with_extension("audit.jsonl");
        Self { path, enabled: true }
    }

    /// Create a disabled audit log (for testing)
    pub fn disabled() -> Self {
        Self { path: PathBuf::from("/dev/null"), enabled: false }
    }

    /// Record a decision. Best-effort append, never fails the request.
    pub fn record(&mut self, account: &str, requester: &str, operation: &str, decision: &str) {
        if !self.enabled {
            return;
        }

        let entry = AuditEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            account: account.to_string(),
            requester: requester.to_string(),
            operation: operation.to_string(),
            decision: decision.to_string(),
        };

        if let Ok(json) = serde_json::to_string(&entry) {
            if let Ok(mut file) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
            {
                let _ = writeln!(file, "{}", json);
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_log_writes() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("keyfort.db");

        let mut log = AuditLog::new(&db_path);
        log.record("acct1", "com.example.app", "sign_event", "auto_approve");
        log.record("acct1", "com.example.app", "nip04_decrypt", "rejected");

        let content = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let entry: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(entry["operation"], "sign_event");
        assert_eq!(entry["decision"], "auto_approve");
        assert_eq!(entry["requester"], "com.example.app");
    }

    #[test]
    fn test_audit_log_disabled() {
        let mut log = AuditLog::disabled();
        // Should not panic
        log.record("a", "b", "c", "d");
    }
}
