//! Permission cache and resolver
//!
//! Every `(requester, operation)` pair derives one stable cache key; the
//! per-account table maps keys to a remembered grant or denial. The resolver
//! only reads the table. Writes happen exclusively on an explicit user
//! decision carrying the "remember" flag, or when seeding declared
//! permissions after an approved connect.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::request::{DeclaredPermission, Operation, Requester, SignerRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Granted,
    Denied,
}

/// Outcome of consulting the table for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    AutoApprove,
    /// A standing denial is itself an automatic decision: fail without a
    /// prompt and without touching the dispatcher.
    AutoReject,
    RequireApproval,
}

/// Per-account permission table.
pub type PermissionRecord = HashMap<String, ApprovalState>;

/// Derive the cache key for a requester/operation pair. Sign approvals are
/// scoped per event kind, so SignEvent appends the kind when known.
pub fn cache_key(requester: &Requester, operation: Operation, event_kind: Option<u16>) -> String {
    let base = format!("{}-{}", requester.id_string(), operation.as_str());
    match (operation, event_kind) {
        (Operation::SignEvent, Some(kind)) => format!("{base}-{kind}"),
        _ => base,
    }
}

pub fn request_key(request: &SignerRequest) -> String {
    cache_key(&request.requester, request.operation, request.event_kind)
}

/// Read-only resolution against a permission record.
pub fn resolve(request: &SignerRequest, record: &PermissionRecord) -> Decision {
    match record.get(&request_key(request)) {
        Some(ApprovalState::Granted) => Decision::AutoApprove,
        Some(ApprovalState::Denied) => Decision::AutoReject,
        None => Decision::RequireApproval,
    }
}

/// Persistent permission tables for all local accounts, stored as a JSON
/// sidecar next to the database path.
pub struct PermissionStore {
    path: PathBuf,
    accounts: HashMap<String, PermissionRecord>,
}

impl PermissionStore {
    pub fn store_path(db_path: &Path) -> PathBuf {
        db_path.with_extension("permissions.json")
    }

    /// Load the store, starting empty when no file exists yet.
    pub fn load(db_path: &Path) -> Result<Self> {
        let path = Self::store_path(db_path);
        let accounts = if path.exists() {
            let content =
                std::fs::read_to_string(&path).context("Failed to read permission store")?;
            serde_json::from_str(&content).context("Failed to parse permission store")?
        } else {
            HashMap::new()
        };
        Ok(Self { path, accounts })
    }

    /// Save atomically: write a temp file, then rename over the target.
    pub fn save(&self) -> Result<()> {
        let tmp_path = self.path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(&self.accounts)
            .context("Failed to serialize permission store")?;

        std::fs::write(&tmp_path, &content).context("Failed to write permission store")?;
        std::fs::rename(&tmp_path, &self.path)
            .context("Failed to atomically save permission store")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.path, perms)?;
        }

        Ok(())
    }

    pub fn record(&self, account_id: &str) -> PermissionRecord {
        self.accounts.get(account_id).cloned().unwrap_or_default()
    }

    pub fn all(&self) -> &HashMap<String, PermissionRecord> {
        &self.accounts
    }

    /// Remember an explicit user decision. Last writer wins; repeating the
    /// same state is a no-op.
    pub fn remember(&mut self, account_id: &str, key: &str, state: ApprovalState) -> Result<()> {
        let record = self.accounts.entry(account_id.to_string()).or_default();
        if record.get(key) == Some(&state) {
            return Ok(());
        }
        record.insert(key.to_string(), state);
        self.save()
    }

    pub fn revoke(&mut self, account_id: &str, key: &str) -> Result<bool> {
        let removed = self
            .accounts
            .get_mut(account_id)
            .map(|record| record.remove(key).is_some())
            .unwrap_or(false);
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    /// Pre-seed declared permissions as granted. Only called after the user
    /// approved the overall connect, never unilaterally.
    pub fn seed_declared(
        &mut self,
        account_id: &str,
        requester: &Requester,
        declared: &[DeclaredPermission],
    ) -> Result<()> {
        if declared.is_empty() {
            return Ok(());
        }
        let record = self.accounts.entry(account_id.to_string()).or_default();
        for permission in declared {
            let operation = Operation::from_extras_type(&permission.operation);
            let kind = if operation == Operation::SignEvent { permission.kind } else { None };
            let key = cache_key(requester, operation, kind);
            record.insert(key, ApprovalState::Granted);
        }
        self.save()
    }
}
