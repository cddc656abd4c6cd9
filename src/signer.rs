//! Local signer capability
//!
//! Wraps a Nostr keypair and exposes the operations the gateway dispatches
//! against: event signing, NIP-04 and NIP-44 encryption/decryption, and the
//! public key. Keys never leave this module; everything else in the crate
//! works through these methods.

use anyhow::{Context, Result};
use nostr::nips::{nip04, nip44};
use nostr::prelude::*;

/// A signer bound to one local identity.
#[derive(Clone)]
pub struct LocalSigner {
    keys: Keys,
}

impl LocalSigner {
    pub fn new(keys: Keys) -> Self {
        Self { keys }
    }

    /// Parse an nsec or hex secret key into a signer.
    pub fn from_secret(secret: &str) -> Result<Self> {
        let keys = if secret.starts_with("nsec") {
            Keys::parse(secret).context("Invalid nsec")?
        } else {
            let sk = SecretKey::from_hex(secret).context("Invalid hex secret key")?;
            Keys::new(sk)
        };
        Ok(Self { keys })
    }

    pub fn generate() -> Self {
        Self { keys: Keys::generate() }
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    /// Secret key as hex, for the account store only.
    pub fn secret_hex(&self) -> String {
        self.keys.secret_key().to_secret_hex()
    }

    /// Sign an event. The unsigned event's pubkey must already match this
    /// signer; callers enforce that before reaching here.
    pub async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event> {
        unsigned
            .sign(&self.keys)
            .await
            .context("Failed to sign event with local keys")
    }

    pub fn nip04_encrypt(&self, plaintext: &str, counterparty: &PublicKey) -> Result<String> {
        nip04::encrypt(self.keys.secret_key(), counterparty, plaintext)
            .context("NIP-04 encryption failed")
    }

    pub fn nip04_decrypt(&self, ciphertext: &str, counterparty: &PublicKey) -> Result<String> {
        nip04::decrypt(self.keys.secret_key(), counterparty, ciphertext)
            .context("NIP-04 decryption failed")
    }

    pub fn nip44_encrypt(&self, plaintext: &str, counterparty: &PublicKey) -> Result<String> {
        nip44::encrypt(
            self.keys.secret_key(),
            counterparty,
            plaintext,
            nip44::Version::V2,
        )
        .context("NIP-44 encryption failed")
    }

    pub fn nip44_decrypt(&self, ciphertext: &str, counterparty: &PublicKey) -> Result<String> {
        nip44::decrypt(self.keys.secret_key(), counterparty, ciphertext)
            .context("NIP-44 decryption failed")
    }
}

/// One locally held identity the gateway can act for.
#[derive(Clone)]
pub struct Account {
    pub label: String,
    pub signer: LocalSigner,
}

impl Account {
    pub fn new(label: impl Into<String>, signer: LocalSigner) -> Self {
        Self { label: label.into(), signer }
    }

    /// Stable identifier used for permission tables and audit entries.
    pub fn id(&self) -> String {
        self.signer.public_key().to_hex()
    }
}
