//! Operation execution and result shaping
//!
//! Takes an approved [`SignerRequest`], runs the matching cryptographic
//! capability, and shapes the outgoing value per the request's formatting
//! hints. Crypto failures on encrypt/decrypt paths collapse into a sentinel
//! string rather than propagating, matching what callers of the legacy
//! protocol expect to see.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use flate2::write::GzEncoder;
use nostr::prelude::*;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::io::Write;
use tracing::debug;

use super::request::{
    fill_event, BunkerResponse, CompressionType, Operation, PartialEvent, ReturnType,
    SignerRequest,
};
use super::GatewayError;
use crate::signer::LocalSigner;

/// Sentinel returned to callers when an encrypt/decrypt capability fails.
pub const DECRYPT_FAILURE_SENTINEL: &str = "Could not decrypt the message";

/// Execute an approved request against the signer and return the raw result
/// string (before compression/URL embedding).
pub async fn execute(request: &SignerRequest, signer: &LocalSigner) -> Result<String, GatewayError> {
    match request.operation {
        Operation::Connect => Ok("ack".to_string()),
        Operation::GetPublicKey => Ok(signer.public_key().to_hex()),
        Operation::SignEvent => sign_event(request, signer).await,
        Operation::Nip04Encrypt => {
            // Guard against callers double-encrypting: NIP-04 ciphertext
            // always carries an "?iv=" marker.
            if request.payload.to_lowercase().contains("?iv=") {
                return Err(GatewayError::AlreadyEncrypted);
            }
            Ok(run_crypto(request, signer))
        }
        Operation::Nip04Decrypt | Operation::Nip44Encrypt | Operation::Nip44Decrypt => {
            Ok(run_crypto(request, signer))
        }
        Operation::DecryptZapEvent => {
            // A failed zap decryption surfaces as an empty string: callers
            // expect an amount there, not an error message.
            Ok(decrypt_zap_event(request, signer).unwrap_or_default())
        }
    }
}

async fn sign_event(request: &SignerRequest, signer: &LocalSigner) -> Result<String, GatewayError> {
    let unsigned = fill_event(&request.payload, &signer.public_key())?;

    if unsigned.pubkey != signer.public_key() {
        return Err(GatewayError::IdentityMismatch);
    }

    let anon_zap = is_anon_zap(&unsigned);
    let signed = signer
        .sign_event(unsigned)
        .await
        .map_err(|e| GatewayError::Crypto(e.to_string()))?;

    // Anonymous zaps always return the full event: a bare signature would
    // leak outside the context that keeps the zap anonymous.
    if anon_zap {
        return Ok(signed.as_json());
    }

    Ok(match request.return_type {
        ReturnType::Event => signed.as_json(),
        ReturnType::Signature => signed.sig.to_string(),
    })
}

fn is_anon_zap(unsigned: &UnsignedEvent) -> bool {
    unsigned.kind == Kind::ZapRequest
        && unsigned
            .tags
            .iter()
            .any(|tag| tag.as_slice().iter().any(|value| value == "anon"))
}

fn run_crypto(request: &SignerRequest, signer: &LocalSigner) -> String {
    try_crypto(request, signer).unwrap_or_else(|e| {
        debug!(operation = %request.operation, error = %e, "crypto capability failed");
        DECRYPT_FAILURE_SENTINEL.to_string()
    })
}

fn try_crypto(request: &SignerRequest, signer: &LocalSigner) -> anyhow::Result<String> {
    let counterparty = PublicKey::parse(&request.counterparty)?;
    match request.operation {
        Operation::Nip04Encrypt => signer.nip04_encrypt(&request.payload, &counterparty),
        Operation::Nip04Decrypt => signer.nip04_decrypt(&request.payload, &counterparty),
        Operation::Nip44Encrypt => signer.nip44_encrypt(&request.payload, &counterparty),
        Operation::Nip44Decrypt => signer.nip44_decrypt(&request.payload, &counterparty),
        other => anyhow::bail!("not a crypto operation: {other}"),
    }
}

/// Zap receipts embed their ciphertext in an event; the sender is either the
/// declared counterparty or the first `p` tag of the zap event.
fn decrypt_zap_event(request: &SignerRequest, signer: &LocalSigner) -> Option<String> {
    let event = PartialEvent::from_json(&request.payload).ok()?;

    let sender = if !request.counterparty.is_empty() {
        PublicKey::parse(&request.counterparty).ok()?
    } else {
        let hex = event
            .tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some("p"))
            .and_then(|tag| tag.get(1))?;
        PublicKey::parse(hex).ok()?
    };

    signer.nip04_decrypt(&event.content, &sender).ok()
}

/// Apply the compression hint to an outgoing result.
pub fn encode_result(value: &str, compression: CompressionType) -> Result<String, GatewayError> {
    match compression {
        CompressionType::None => Ok(value.to_string()),
        CompressionType::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(value.as_bytes())
                .and_then(|_| encoder.finish())
                .map(|bytes| BASE64.encode(bytes))
                .map_err(|e| GatewayError::Crypto(format!("gzip failed: {e}")))
        }
    }
}

/// Embed a result into the caller's redirect target.
pub fn callback_redirect(callback_url: &str, result: &str) -> String {
    let separator = if callback_url.contains('?') { '&' } else { '?' };
    format!(
        "{callback_url}{separator}event={}",
        utf8_percent_encode(result, NON_ALPHANUMERIC)
    )
}

/// Re-encrypt a bunker response to the client and package it as a signed
/// NIP-46 event, mirroring how the request arrived.
pub async fn build_bunker_reply(
    signer: &LocalSigner,
    client: &PublicKey,
    response: &BunkerResponse,
) -> Result<Event, GatewayError> {
    let json = serde_json::to_string(response)
        .map_err(|e| GatewayError::Crypto(format!("serialize response: {e}")))?;
    let encrypted = signer
        .nip04_encrypt(&json, client)
        .map_err(|e| GatewayError::Crypto(e.to_string()))?;

    let unsigned = EventBuilder::new(Kind::NostrConnect, encrypted)
        .tag(Tag::public_key(*client))
        .build(signer.public_key());

    signer
        .sign_event(unsigned)
        .await
        .map_err(|e| GatewayError::Crypto(e.to_string()))
}
