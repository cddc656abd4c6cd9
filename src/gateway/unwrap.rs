//! Envelope unwrapping
//!
//! Bunker requests arrive as nested encrypted envelopes: a gift wrap (kind
//! 1059) hiding a seal (kind 13) hiding the terminal message. The transport
//! does not say which local identity an envelope is for, so callers fan out
//! over every account and treat per-identity decryption failures as silence.

use std::collections::HashMap;
use std::sync::Mutex;

use nostr::prelude::*;
use serde::Deserialize;
use tracing::debug;

use super::GatewayError;
use crate::signer::LocalSigner;

/// Unwrapping gives up after this many encrypted layers; a deeper envelope is
/// treated as hostile and fails closed.
pub const MAX_UNWRAP_DEPTH: usize = 5;

/// Memoization cap. Eviction is wholesale: correctness never depends on a hit.
const MAX_CACHE_ENTRIES: usize = 512;

/// The innermost, non-wrapped message of an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalMessage {
    pub pubkey: PublicKey,
    pub kind: Kind,
    pub content: String,
    pub created_at: Timestamp,
}

/// One classified envelope layer.
pub enum UnwrapEnvelope {
    /// Gift wrap: decrypts with the embedded ephemeral sender key.
    Wrapped { content: String, sender: PublicKey },
    /// Seal: decrypts with the sealed (true) sender's key.
    Sealed { content: String, sender: PublicKey },
    Terminal(TerminalMessage),
}

/// Inner layers are rumors: `sig` and `id` may be absent.
#[derive(Debug, Deserialize)]
struct RawLayer {
    pubkey: String,
    #[serde(default)]
    created_at: u64,
    kind: u16,
    #[serde(default)]
    content: String,
}

fn classify(layer: RawLayer) -> Result<UnwrapEnvelope, GatewayError> {
    let sender = PublicKey::from_hex(&layer.pubkey)
        .map_err(|e| GatewayError::Malformed(format!("invalid envelope pubkey: {e}")))?;
    let kind = Kind::from(layer.kind);

    Ok(match kind {
        Kind::GiftWrap => UnwrapEnvelope::Wrapped { content: layer.content, sender },
        Kind::Seal => UnwrapEnvelope::Sealed { content: layer.content, sender },
        _ => UnwrapEnvelope::Terminal(TerminalMessage {
            pubkey: sender,
            kind,
            content: layer.content,
            created_at: Timestamp::from(layer.created_at),
        }),
    })
}

fn classify_event(event: &Event) -> UnwrapEnvelope {
    match event.kind {
        Kind::GiftWrap => UnwrapEnvelope::Wrapped {
            content: event.content.clone(),
            sender: event.pubkey,
        },
        Kind::Seal => UnwrapEnvelope::Sealed {
            content: event.content.clone(),
            sender: event.pubkey,
        },
        _ => UnwrapEnvelope::Terminal(TerminalMessage {
            pubkey: event.pubkey,
            kind: event.kind,
            content: event.content.clone(),
            created_at: event.created_at,
        }),
    }
}

/// Peel encrypted layers until a terminal message appears.
///
/// Both gift wraps and seals carry NIP-44 ciphertext addressed to the local
/// identity; a failed decryption means the envelope was for someone else.
pub fn unwrap_envelope(
    signer: &LocalSigner,
    event: &Event,
) -> Result<TerminalMessage, GatewayError> {
    let mut current = classify_event(event);
    let mut depth = 0usize;

    loop {
        let (content, sender) = match current {
            UnwrapEnvelope::Terminal(message) => return Ok(message),
            UnwrapEnvelope::Wrapped { content, sender }
            | UnwrapEnvelope::Sealed { content, sender } => (content, sender),
        };

        depth += 1;
        if depth >= MAX_UNWRAP_DEPTH {
            return Err(GatewayError::TooDeeplyNested);
        }

        let inner = signer
            .nip44_decrypt(&content, &sender)
            .map_err(|_| GatewayError::Decryption)?;
        let layer: RawLayer = serde_json::from_str(&inner)
            .map_err(|e| GatewayError::Malformed(format!("invalid inner envelope: {e}")))?;
        current = classify(layer)?;
    }
}

#[derive(Debug, Clone)]
enum CachedUnwrap {
    Terminal(TerminalMessage),
    Failed,
}

/// Process-wide unwrap memo, keyed by envelope and identity. Re-delivered
/// envelopes (duplicate pushes) resolve without a second decryption pass,
/// which also suppresses duplicate approval prompts.
#[derive(Default)]
pub struct UnwrapCache {
    entries: Mutex<HashMap<(EventId, PublicKey), CachedUnwrap>>,
}

impl UnwrapCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unwrap through the memo. Only terminal-vs-failed is cached; error
    /// detail is not preserved across hits.
    pub fn unwrap_cached(
        &self,
        signer: &LocalSigner,
        event: &Event,
    ) -> Result<TerminalMessage, GatewayError> {
        let key = (event.id, signer.public_key());

        if let Ok(entries) = self.entries.lock() {
            match entries.get(&key) {
                Some(CachedUnwrap::Terminal(message)) => return Ok(message.clone()),
                Some(CachedUnwrap::Failed) => return Err(GatewayError::Decryption),
                None => {}
            }
        }

        let outcome = unwrap_envelope(signer, event);

        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() >= MAX_CACHE_ENTRIES {
                entries.clear();
            }
            let cached = match &outcome {
                Ok(message) => CachedUnwrap::Terminal(message.clone()),
                Err(_) => CachedUnwrap::Failed,
            };
            entries.insert(key, cached);
        }

        outcome
    }
}

/// Try every local identity against an envelope. Attempts are independent;
/// failures are silent because the envelope was simply addressed elsewhere.
pub fn unwrap_for_accounts<'a>(
    cache: &UnwrapCache,
    accounts: &'a [crate::signer::Account],
    event: &Event,
) -> Option<(&'a crate::signer::Account, TerminalMessage)> {
    for account in accounts {
        match cache.unwrap_cached(&account.signer, event) {
            Ok(message) => return Some((account, message)),
            Err(GatewayError::Decryption) => {
                debug!(account = %account.label, "envelope not addressed to this identity");
            }
            Err(e) => {
                debug!(account = %account.label, error = %e, "unwrap failed");
            }
        }
    }
    None
}
