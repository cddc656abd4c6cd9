//! Account storage
//!
//! Holds the local identities the gateway can sign for, in a JSON sidecar
//! file next to the database path. Secret keys never appear anywhere else on
//! disk, so saves are atomic and the file is chmod 0600.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::signer::{Account, LocalSigner};

/// Serialized form of one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SavedAccount {
    label: String,
    /// Secret key (hex)
    secret_key: String,
}

/// Persistent multi-account store.
pub struct AccountStore {
    path: PathBuf,
    saved: Vec<SavedAccount>,
}

impl AccountStore {
    /// Store file path derived from the database path
    pub fn store_path(db_path: &Path) -> PathBuf {
        db_path.with_extension("accounts.json")
    }

    /// Load the store, starting empty when no file exists yet.
    pub fn load(db_path: &Path) -> Result<Self> {
        let path = Self::store_path(db_path);
        let saved = if path.exists() {
            let content =
                std::fs::read_to_string(&path).context("Failed to read account store")?;
            serde_json::from_str(&content).context("Failed to parse account store")?
        } else {
            Vec::new()
        };
        Ok(Self { path, saved })
    }

    /// Save atomically: write a temp file, then rename over the target.
    pub fn save(&self) -> Result<()> {
        let tmp_path = self.path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(&self.saved)
            .context("Failed to serialize account store")?;

        std::fs::write(&tmp_path, &content).context("Failed to write account store")?;
        std::fs::rename(&tmp_path, &self.path)
            .context("Failed to atomically save account store")?;

        // The file holds secret keys.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.path, perms)?;
        }

        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.saved.is_empty()
    }

    pub fn len(&self) -> usize {
        self.saved.len()
    }

    /// Add an identity and persist. Duplicate public keys are rejected so one
    /// envelope never matches two accounts.
    pub fn add(&mut self, label: &str, signer: &LocalSigner) -> Result<()> {
        let secret_key = signer.secret_hex();
        let pubkey = signer.public_key();
        for existing in &self.saved {
            let existing_signer = LocalSigner::from_secret(&existing.secret_key)?;
            if existing_signer.public_key() == pubkey {
                anyhow::bail!("Account already exists: {}", existing.label);
            }
        }
        self.saved.push(SavedAccount { label: label.to_string(), secret_key });
        self.save()
    }

    /// Materialize all stored identities as live signers.
    pub fn accounts(&self) -> Result<Vec<Account>> {
        self.saved
            .iter()
            .map(|s| {
                let signer = LocalSigner::from_secret(&s.secret_key)
                    .with_context(|| format!("Invalid stored key for account {}", s.label))?;
                Ok(Account::new(s.label.clone(), signer))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("keyfort.db");

        let signer = LocalSigner::generate();
        let mut store = AccountStore::load(&db_path).unwrap();
        assert!(store.is_empty());
        store.add("main", &signer).unwrap();

        let reloaded = AccountStore::load(&db_path).unwrap();
        let accounts = reloaded.accounts().unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].label, "main");
        assert_eq!(accounts[0].signer.public_key(), signer.public_key());
    }

    #[test]
    fn test_duplicate_pubkey_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("keyfort.db");

        let signer = LocalSigner::generate();
        let mut store = AccountStore::load(&db_path).unwrap();
        store.add("first", &signer).unwrap();
        assert!(store.add("second", &signer).is_err());
        assert_eq!(store.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_store_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("keyfort.db");

        let mut store = AccountStore::load(&db_path).unwrap();
        store.add("main", &LocalSigner::generate()).unwrap();

        let mode = std::fs::metadata(AccountStore::store_path(&db_path))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
