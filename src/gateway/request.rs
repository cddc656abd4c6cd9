//! Request normalization
//!
//! Converts the two inbound transports — an encrypted NIP-46 "bunker" RPC
//! body, or a `nostrsigner:` URI with optional structured extras — into one
//! canonical [`SignerRequest`]. Every field the dispatcher needs is populated
//! here (defaults applied, never left unset), so downstream code never has to
//! re-check "was this provided".

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use nostr::prelude::*;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::GatewayError;

/// URI scheme consumed by the intent transport.
pub const URI_SCHEME: &str = "nostrsigner:";

/// Counts requests whose method/type string was not recognized and fell back
/// to SignEvent. The fallback is legacy-compatible but silently misclassifies,
/// so we keep it observable.
pub static UNKNOWN_METHOD_COUNT: AtomicU64 = AtomicU64::new(0);

/// The closed set of operations a requester can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    SignEvent,
    GetPublicKey,
    Connect,
    Nip04Encrypt,
    Nip04Decrypt,
    Nip44Encrypt,
    Nip44Decrypt,
    DecryptZapEvent,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::SignEvent => "sign_event",
            Operation::GetPublicKey => "get_public_key",
            Operation::Connect => "connect",
            Operation::Nip04Encrypt => "nip04_encrypt",
            Operation::Nip04Decrypt => "nip04_decrypt",
            Operation::Nip44Encrypt => "nip44_encrypt",
            Operation::Nip44Decrypt => "nip44_decrypt",
            Operation::DecryptZapEvent => "decrypt_zap_event",
        }
    }

    pub fn is_encryption(&self) -> bool {
        matches!(
            self,
            Operation::Nip04Encrypt
                | Operation::Nip04Decrypt
                | Operation::Nip44Encrypt
                | Operation::Nip44Decrypt
                | Operation::DecryptZapEvent
        )
    }

    /// Method table for the bunker RPC transport. `get_public_get` is the
    /// spelling legacy clients send on this path.
    pub fn from_bunker_method(method: &str) -> Operation {
        match method {
            "connect" => Operation::Connect,
            "sign_event" => Operation::SignEvent,
            "get_public_get" => Operation::GetPublicKey,
            "nip04_encrypt" => Operation::Nip04Encrypt,
            "nip04_decrypt" => Operation::Nip04Decrypt,
            "nip44_encrypt" => Operation::Nip44Encrypt,
            "nip44_decrypt" => Operation::Nip44Decrypt,
            other => unknown_fallback("bunker", other),
        }
    }

    /// Type table for the structured-extras transport.
    pub fn from_extras_type(value: &str) -> Operation {
        match value {
            "sign_event" => Operation::SignEvent,
            "nip04_encrypt" => Operation::Nip04Encrypt,
            "nip04_decrypt" => Operation::Nip04Decrypt,
            "nip44_encrypt" => Operation::Nip44Encrypt,
            "nip44_decrypt" => Operation::Nip44Decrypt,
            "get_public_key" => Operation::GetPublicKey,
            "decrypt_zap_event" => Operation::DecryptZapEvent,
            other => unknown_fallback("extras", other),
        }
    }

    /// Type table for the bare-URI query string. Mirrors the bunker table
    /// minus `connect`; unknown values fall through to SignEvent.
    pub fn from_uri_type(value: &str) -> Operation {
        match value {
            "sign_event" => Operation::SignEvent,
            "get_public_get" => Operation::GetPublicKey,
            "nip04_encrypt" => Operation::Nip04Encrypt,
            "nip04_decrypt" => Operation::Nip04Decrypt,
            "nip44_encrypt" => Operation::Nip44Encrypt,
            "nip44_decrypt" => Operation::Nip44Decrypt,
            other => unknown_fallback("uri", other),
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Unknown methods default to SignEvent for compatibility with legacy callers.
// Counted and logged so the misclassification is observable.
fn unknown_fallback(transport: &str, value: &str) -> Operation {
    if !value.is_empty() {
        UNKNOWN_METHOD_COUNT.fetch_add(1, Ordering::Relaxed);
        warn!(transport, value, "unknown operation type, defaulting to sign_event");
    }
    Operation::SignEvent
}

/// Who is asking: a local application (by package identifier) or a remote
/// bunker client (by public key). Exactly one per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requester {
    App(String),
    Client(PublicKey),
}

impl Requester {
    /// Stable identity string feeding the permission cache key.
    pub fn id_string(&self) -> String {
        match self {
            Requester::App(package) => package.clone(),
            Requester::Client(pk) => pk.to_hex(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionType {
    #[default]
    None,
    Gzip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnType {
    #[default]
    Signature,
    Event,
}

/// A permission the requester asks to have pre-approved on first contact.
/// Wire shape: `{"type": "...", "kind": 1}` with `kind` optional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeclaredPermission {
    #[serde(rename = "type")]
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<u16>,
}

/// Canonical request produced by normalization. Owned by the caller until
/// handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct SignerRequest {
    /// Caller-supplied correlation id; absent means fresh/non-idempotent.
    pub id: Option<String>,
    pub operation: Operation,
    /// Event JSON for SignEvent, cipher/plaintext for crypto ops, empty for
    /// GetPublicKey/Connect.
    pub payload: String,
    /// The other party's public key (hex) for crypto ops, empty otherwise.
    pub counterparty: String,
    pub requester: Requester,
    /// Human-readable caller name for approval prompts (package id or
    /// callback host).
    pub app_name: String,
    pub callback_url: Option<String>,
    pub compression: CompressionType,
    pub return_type: ReturnType,
    pub declared_permissions: Vec<DeclaredPermission>,
    /// Which local account the caller addressed, when stated.
    pub account_hint: Option<String>,
    /// Event kind pre-parsed for SignEvent so the permission resolver never
    /// re-parses the payload.
    pub event_kind: Option<u16>,
}

/// NIP-46 RPC body. `localKey` is transient: set by the receiver after
/// decryption to correlate the response channel, never transmitted by the
/// client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BunkerRequest {
    #[serde(default)]
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(rename = "localKey", default, skip_serializing_if = "String::is_empty")]
    pub local_key: String,
}

/// NIP-46 RPC response: `{"id":..., "result":...}` or `{"id":..., "error":...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BunkerResponse {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BunkerResponse {
    pub fn ok(id: String, result: impl Into<String>) -> Self {
        Self { id, result: Some(result.into()), error: None }
    }

    pub fn error(id: String, error: impl Into<String>) -> Self {
        Self { id, result: None, error: Some(error.into()) }
    }
}

fn default_created_at() -> u64 {
    Timestamp::now().as_u64()
}

/// Leniently parsed event: callers routinely omit `pubkey`, `id`, and
/// `created_at` and expect the signer to fill them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub pubkey: String,
    #[serde(default = "default_created_at")]
    pub created_at: u64,
    #[serde(default)]
    pub kind: u16,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sig: String,
}

impl PartialEvent {
    pub fn from_json(json: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(json)
            .map_err(|e| GatewayError::Malformed(format!("invalid event JSON: {e}")))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Fill a partial event with the signer's identity: missing `pubkey` becomes
/// the signer's, missing `id` is computed over the filled fields. A supplied
/// id is trusted verbatim.
pub fn fill_event(payload: &str, signer_pubkey: &PublicKey) -> Result<UnsignedEvent, GatewayError> {
    let partial = PartialEvent::from_json(payload)?;

    let pubkey = if partial.pubkey.is_empty() {
        *signer_pubkey
    } else {
        PublicKey::from_hex(&partial.pubkey)
            .map_err(|e| GatewayError::Malformed(format!("invalid event pubkey: {e}")))?
    };

    let tags: Vec<Tag> = partial
        .tags
        .iter()
        .filter_map(|t| Tag::parse(t).ok())
        .collect();

    let mut unsigned = UnsignedEvent::new(
        pubkey,
        Timestamp::from(partial.created_at),
        Kind::from(partial.kind),
        tags,
        &partial.content,
    );

    if partial.id.is_empty() {
        unsigned.ensure_id();
    } else {
        let id = EventId::from_hex(&partial.id)
            .map_err(|e| GatewayError::Malformed(format!("invalid event id: {e}")))?;
        unsigned.id = Some(id);
    }

    Ok(unsigned)
}

/// Normalize a decrypted bunker RPC body.
///
/// `sender` is the bunker client's public key (the terminal message author);
/// it becomes both the requester identity and the response channel.
pub fn from_bunker(
    request: &BunkerRequest,
    sender: PublicKey,
    callback_url: Option<String>,
) -> Result<SignerRequest, GatewayError> {
    let operation = Operation::from_bunker_method(&request.method);

    // Payload and counterparty follow the raw method string, not the mapped
    // operation: an unknown method lands on SignEvent with an empty payload.
    let (payload, event_kind) = match request.method.as_str() {
        "connect" => ("ack".to_string(), None),
        "sign_event" => {
            let raw = request.params.first().ok_or_else(|| {
                GatewayError::Malformed("sign_event request missing event parameter".into())
            })?;
            let partial = PartialEvent::from_json(raw)?;
            let kind = partial.kind;
            (partial.to_json(), Some(kind))
        }
        "nip04_encrypt" | "nip04_decrypt" | "nip44_encrypt" | "nip44_decrypt" => {
            (request.params.get(1).cloned().unwrap_or_default(), None)
        }
        _ => (String::new(), None),
    };

    let counterparty = if request.method.ends_with("encrypt") || request.method.ends_with("decrypt")
    {
        request
            .params
            .first()
            .cloned()
            .ok_or_else(|| GatewayError::Malformed("missing counterparty parameter".into()))?
    } else {
        String::new()
    };

    let declared_permissions = if operation == Operation::Connect {
        request
            .params
            .get(2)
            .map(|s| parse_permission_list(s))
            .unwrap_or_default()
    } else {
        Vec::new()
    };

    let id = Some(request.id.clone()).filter(|s| !s.is_empty());

    Ok(SignerRequest {
        id,
        operation,
        payload,
        counterparty,
        requester: Requester::Client(sender),
        app_name: sender.to_hex(),
        callback_url,
        compression: CompressionType::None,
        return_type: ReturnType::Event,
        declared_permissions,
        account_hint: None,
        event_kind,
    })
}

/// Comma-separated connect permission list, e.g. `sign_event:1,nip04_encrypt`.
fn parse_permission_list(raw: &str) -> Vec<DeclaredPermission> {
    raw.split(',')
        .filter_map(|part| {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                return None;
            }
            match trimmed.split_once(':') {
                Some((op, kind)) => Some(DeclaredPermission {
                    operation: op.to_string(),
                    kind: kind.parse().ok(),
                }),
                None => Some(DeclaredPermission { operation: trimmed.to_string(), kind: None }),
            }
        })
        .collect()
}

/// String-keyed parameter map supplied by a known calling application.
pub type Extras = HashMap<String, String>;

/// Normalize an intent-style request: a `nostrsigner:` URI plus optional
/// structured extras.
///
/// A URI carrying a query string is parsed on its own; otherwise the extras
/// map drives the request and the URI remainder is the payload.
pub fn from_intent(
    uri: &str,
    package: Option<&str>,
    extras: &Extras,
) -> Result<SignerRequest, GatewayError> {
    let stripped = uri.strip_prefix(URI_SCHEME).unwrap_or(uri);

    match stripped.split_once('?') {
        Some((payload_part, query)) if !query.is_empty() => {
            from_bare_uri(payload_part, query, package)
        }
        _ => from_extras(stripped, package, extras),
    }
}

fn from_bare_uri(
    payload_part: &str,
    query: &str,
    package: Option<&str>,
) -> Result<SignerRequest, GatewayError> {
    // `+` must survive decoding: callers embed base64/JSON payloads where a
    // literal plus is meaningful, so re-encode before percent-decoding.
    let payload = decode_payload(payload_part)?;

    let mut operation = Operation::SignEvent;
    let mut counterparty = String::new();
    let mut compression = CompressionType::None;
    let mut callback_url: Option<String> = None;
    let mut return_type = ReturnType::Signature;

    for pair in query.split('&') {
        let (name, value) = match pair.split_once('=') {
            Some((n, v)) => (n, v),
            None => (pair, ""),
        };
        match name {
            "type" => operation = Operation::from_uri_type(value),
            "pubkey" => counterparty = value.to_string(),
            "compressionType" => {
                if value == "gzip" {
                    compression = CompressionType::Gzip;
                }
            }
            "callbackUrl" => callback_url = Some(value.to_string()),
            "returnType" => {
                if value == "event" {
                    return_type = ReturnType::Event;
                }
            }
            _ => {}
        }
    }

    let event_kind = parse_event_kind(operation, &payload);
    let requester = app_requester(package, &callback_url);
    let app_name = app_display_name(package, &callback_url);

    Ok(SignerRequest {
        id: None,
        operation,
        payload,
        counterparty,
        requester,
        app_name,
        callback_url,
        compression,
        return_type,
        declared_permissions: Vec::new(),
        account_hint: None,
        event_kind,
    })
}

fn from_extras(
    raw_payload: &str,
    package: Option<&str>,
    extras: &Extras,
) -> Result<SignerRequest, GatewayError> {
    let operation = extras
        .get("type")
        .map(|t| Operation::from_extras_type(t))
        .unwrap_or(Operation::SignEvent);

    // Unknown-application callers deliver a still-encoded payload; known
    // packages pass it through verbatim.
    let payload = if package.is_none() {
        decode_payload(raw_payload).unwrap_or_else(|_| raw_payload.to_string())
    } else {
        raw_payload.to_string()
    };

    let counterparty = extras.get("pubKey").cloned().unwrap_or_default();
    let id = extras.get("id").cloned().filter(|s| !s.is_empty());
    let callback_url = extras.get("callbackUrl").cloned().filter(|s| !s.is_empty());

    let compression = match extras.get("compression").map(String::as_str) {
        Some("gzip") => CompressionType::Gzip,
        _ => CompressionType::None,
    };
    let return_type = match extras.get("returnType").map(String::as_str) {
        Some("event") => ReturnType::Event,
        _ => ReturnType::Signature,
    };

    let declared_permissions = extras
        .get("permissions")
        .map(|json| match serde_json::from_str::<Vec<DeclaredPermission>>(json) {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "ignoring unparseable permissions list");
                Vec::new()
            }
        })
        .unwrap_or_default();

    let account_hint = extras.get("current_user").cloned().filter(|s| !s.is_empty());
    let event_kind = parse_event_kind(operation, &payload);
    let requester = app_requester(package, &callback_url);
    let app_name = app_display_name(package, &callback_url);

    Ok(SignerRequest {
        id,
        operation,
        payload,
        counterparty,
        requester,
        app_name,
        callback_url,
        compression,
        return_type,
        declared_permissions,
        account_hint,
        event_kind,
    })
}

fn decode_payload(raw: &str) -> Result<String, GatewayError> {
    let plus_safe = raw.replace('+', "%2b");
    percent_decode_str(&plus_safe)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| GatewayError::Malformed(format!("payload is not valid UTF-8: {e}")))
}

fn parse_event_kind(operation: Operation, payload: &str) -> Option<u16> {
    if operation != Operation::SignEvent {
        return None;
    }
    PartialEvent::from_json(payload).ok().map(|p| p.kind)
}

fn app_requester(package: Option<&str>, callback_url: &Option<String>) -> Requester {
    Requester::App(
        package
            .map(str::to_string)
            .unwrap_or_else(|| callback_host(callback_url)),
    )
}

fn app_display_name(package: Option<&str>, callback_url: &Option<String>) -> String {
    match package {
        Some(p) => p.to_string(),
        None => callback_host(callback_url),
    }
}

fn callback_host(callback_url: &Option<String>) -> String {
    callback_url
        .as_deref()
        .and_then(|u| url::Url::parse(u).ok())
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}
