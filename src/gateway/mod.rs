//! Remote-signing gateway
//!
//! Receives signing requests over two transports, resolves whether each one
//! may proceed against per-account permission tables, executes approved
//! operations against the local signer, and shapes the reply for the
//! transport it arrived on.
//!
//! The relay transport delivers encrypted envelopes (gift wrap around seal
//! around a NIP-46 RPC body); the intent transport delivers `nostrsigner:`
//! URIs with optional structured extras. Both converge on [`SignerRequest`]
//! before any policy or key material is touched.

pub mod dispatch;
pub mod permissions;
pub mod request;
pub mod unwrap;

use std::sync::Mutex;

use nostr::prelude::*;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::audit::AuditLog;
use crate::signer::Account;
use dispatch::{build_bunker_reply, callback_redirect, encode_result, execute};
use permissions::{resolve, request_key, ApprovalState, Decision, PermissionStore};
use request::{from_bunker, from_intent, BunkerRequest, BunkerResponse, Extras, Operation, SignerRequest};
use unwrap::{unwrap_for_accounts, UnwrapCache};

/// Errors surfaced by gateway processing. Transport loops treat most of these
/// as drop-and-log; only dispatch errors travel back to the requester.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The envelope was not addressed to any local identity.
    #[error("could not decrypt envelope")]
    Decryption,
    /// Envelope nesting exceeded the unwrap depth cap.
    #[error("envelope nested too deeply")]
    TooDeeplyNested,
    #[error("malformed request: {0}")]
    Malformed(String),
    /// The event to sign names a pubkey that is not the selected account.
    #[error("event pubkey does not match the signing account")]
    IdentityMismatch,
    /// NIP-04 encryption of text that already looks NIP-04 encrypted.
    #[error("content is already encrypted")]
    AlreadyEncrypted,
    #[error("cryptographic operation failed: {0}")]
    Crypto(String),
    /// No local account matched the request's addressing.
    #[error("no account available for this request")]
    IdentityUnresolved,
    #[error("request rejected")]
    Rejected,
}

/// What the user is shown when a request needs a decision.
#[derive(Debug, Clone)]
pub struct ApprovalPrompt {
    pub account: String,
    pub requester: String,
    pub operation: Operation,
    pub event_kind: Option<u16>,
    pub payload_preview: String,
}

/// The user's answer to a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved { remember: bool },
    Rejected { remember: bool },
    /// The prompt was dismissed without an answer: nothing is delivered and
    /// nothing is remembered.
    Abandoned,
}

/// Seam between the gateway and whatever surface collects user decisions.
pub trait ApprovalCallbacks: Send + Sync {
    fn decide(&self, prompt: &ApprovalPrompt) -> ApprovalOutcome;
}

/// Outgoing result, shaped per transport.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Signed kind-24133 event carrying the encrypted RPC response.
    Bunker(Event),
    /// Redirect URL with the result embedded as a query parameter.
    Callback(String),
    /// Bare result for callers without a redirect target.
    Inline(String),
}

/// The gateway itself: accounts plus policy plus the approval seam.
pub struct Gateway<C: ApprovalCallbacks> {
    accounts: Vec<Account>,
    permissions: Mutex<PermissionStore>,
    audit: Mutex<AuditLog>,
    cache: UnwrapCache,
    callbacks: C,
}

impl<C: ApprovalCallbacks> Gateway<C> {
    pub fn new(
        accounts: Vec<Account>,
        permissions: PermissionStore,
        audit: AuditLog,
        callbacks: C,
    ) -> Self {
        Self {
            accounts,
            permissions: Mutex::new(permissions),
            audit: Mutex::new(audit),
            cache: UnwrapCache::new(),
            callbacks,
        }
    }

    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    /// Handle one envelope from the relay transport.
    ///
    /// Undecryptable, non-RPC, or abandoned requests all resolve to `None`:
    /// the relay loop has nothing to publish for them.
    pub async fn handle_envelope(&self, event: &Event) -> Option<Reply> {
        let (account, terminal) = match unwrap_for_accounts(&self.cache, &self.accounts, event) {
            Some(found) => found,
            None => {
                debug!(event = %event.id, "envelope matched no local identity, dropping");
                return None;
            }
        };

        if terminal.kind != Kind::NostrConnect {
            debug!(kind = %terminal.kind, "terminal message is not a signer RPC, dropping");
            return None;
        }

        let plaintext = match account.signer.nip04_decrypt(&terminal.content, &terminal.pubkey) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "could not decrypt RPC body, dropping");
                return None;
            }
        };

        let mut rpc: BunkerRequest = match serde_json::from_str(&plaintext) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "unparseable RPC body, dropping");
                return None;
            }
        };
        // Stamp the response channel; clients never send this field.
        rpc.local_key = account.id();

        let request = match from_bunker(&rpc, terminal.pubkey, None) {
            Ok(r) => r,
            Err(e) => {
                let response = BunkerResponse::error(rpc.id.clone(), e.to_string());
                return self.bunker_reply(account, &terminal.pubkey, response).await;
            }
        };

        let response = match self.process(account, &request).await? {
            Ok(result) => BunkerResponse::ok(rpc.id.clone(), result),
            Err(e) => BunkerResponse::error(rpc.id.clone(), e.to_string()),
        };
        self.bunker_reply(account, &terminal.pubkey, response).await
    }

    async fn bunker_reply(
        &self,
        account: &Account,
        client: &PublicKey,
        response: BunkerResponse,
    ) -> Option<Reply> {
        match build_bunker_reply(&account.signer, client, &response).await {
            Ok(event) => Some(Reply::Bunker(event)),
            Err(e) => {
                warn!(error = %e, "failed to build reply event");
                None
            }
        }
    }

    /// Handle one intent-transport request (URI plus optional extras).
    pub async fn handle_intent(
        &self,
        uri: &str,
        package: Option<&str>,
        extras: &Extras,
    ) -> Result<Option<Reply>, GatewayError> {
        let request = from_intent(uri, package, extras)?;
        let account = self.select_account(&request)?;

        let result = match self.process(account, &request).await {
            Some(Ok(result)) => result,
            Some(Err(e)) => return Err(e),
            None => return Ok(None),
        };

        let encoded = encode_result(&result, request.compression)?;
        Ok(Some(match &request.callback_url {
            Some(url) => Reply::Callback(callback_redirect(url, &encoded)),
            None => Reply::Inline(encoded),
        }))
    }

    /// Pick the account a request addresses: the hint when it names a local
    /// identity, the sole account otherwise.
    fn select_account(&self, request: &SignerRequest) -> Result<&Account, GatewayError> {
        if let Some(hint) = &request.account_hint {
            return self
                .accounts
                .iter()
                .find(|a| &a.id() == hint || &a.label == hint)
                .ok_or(GatewayError::IdentityUnresolved);
        }
        self.accounts.first().ok_or(GatewayError::IdentityUnresolved)
    }

    /// Resolve policy and, when allowed, dispatch.
    ///
    /// `None` means the request produced no deliverable outcome (abandoned
    /// prompt); `Some(Err)` is an outcome the requester gets to see.
    async fn process(
        &self,
        account: &Account,
        request: &SignerRequest,
    ) -> Option<Result<String, GatewayError>> {
        let decision = {
            let permissions = self.permissions.lock().ok()?;
            resolve(request, &permissions.record(&account.id()))
        };

        match decision {
            Decision::AutoApprove => {
                self.audit(account, request, "auto_approve");
                Some(self.approved(account, request).await)
            }
            Decision::AutoReject => {
                self.audit(account, request, "auto_reject");
                Some(Err(GatewayError::Rejected))
            }
            Decision::RequireApproval => {
                let prompt = ApprovalPrompt {
                    account: account.label.clone(),
                    requester: request.app_name.clone(),
                    operation: request.operation,
                    event_kind: request.event_kind,
                    payload_preview: preview(&request.payload),
                };
                match self.callbacks.decide(&prompt) {
                    ApprovalOutcome::Approved { remember } => {
                        self.audit(account, request, "approved");
                        if remember {
                            self.remember(account, request, ApprovalState::Granted);
                        }
                        Some(self.approved(account, request).await)
                    }
                    ApprovalOutcome::Rejected { remember } => {
                        self.audit(account, request, "rejected");
                        if remember {
                            self.remember(account, request, ApprovalState::Denied);
                        }
                        Some(Err(GatewayError::Rejected))
                    }
                    ApprovalOutcome::Abandoned => {
                        self.audit(account, request, "abandoned");
                        None
                    }
                }
            }
        }
    }

    async fn approved(
        &self,
        account: &Account,
        request: &SignerRequest,
    ) -> Result<String, GatewayError> {
        // An approved connect carries the client's requested permission list;
        // seed it so follow-up calls skip the prompt.
        if request.operation == Operation::Connect && !request.declared_permissions.is_empty() {
            if let Ok(mut permissions) = self.permissions.lock() {
                if let Err(e) = permissions.seed_declared(
                    &account.id(),
                    &request.requester,
                    &request.declared_permissions,
                ) {
                    warn!(error = %e, "failed to seed declared permissions");
                }
            }
        }

        let result = execute(request, &account.signer).await?;
        info!(
            account = %account.label,
            requester = %request.app_name,
            operation = %request.operation,
            "request dispatched"
        );
        Ok(result)
    }

    fn remember(&self, account: &Account, request: &SignerRequest, state: ApprovalState) {
        if let Ok(mut permissions) = self.permissions.lock() {
            if let Err(e) = permissions.remember(&account.id(), &request_key(request), state) {
                warn!(error = %e, "failed to persist permission decision");
            }
        }
    }

    fn audit(&self, account: &Account, request: &SignerRequest, decision: &str) {
        if let Ok(mut audit) = self.audit.lock() {
            audit.record(
                &account.id(),
                &request.requester.id_string(),
                request.operation.as_str(),
                decision,
            );
        }
    }
}

fn preview(payload: &str) -> String {
    const MAX: usize = 120;
    if payload.len() <= MAX {
        payload.to_string()
    } else {
        let cut = payload
            .char_indices()
            .take_while(|(i, _)| *i < MAX)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}...", &payload[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::LocalSigner;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AlwaysApprove;
    impl ApprovalCallbacks for AlwaysApprove {
        fn decide(&self, _prompt: &ApprovalPrompt) -> ApprovalOutcome {
            ApprovalOutcome::Approved { remember: false }
        }
    }

    struct AlwaysAbandon;
    impl ApprovalCallbacks for AlwaysAbandon {
        fn decide(&self, _prompt: &ApprovalPrompt) -> ApprovalOutcome {
            ApprovalOutcome::Abandoned
        }
    }

    struct CountingApprove(AtomicUsize);
    impl ApprovalCallbacks for CountingApprove {
        fn decide(&self, _prompt: &ApprovalPrompt) -> ApprovalOutcome {
            self.0.fetch_add(1, Ordering::SeqCst);
            ApprovalOutcome::Approved { remember: true }
        }
    }

    fn gateway_with<C: ApprovalCallbacks>(
        accounts: Vec<Account>,
        dir: &tempfile::TempDir,
        callbacks: C,
    ) -> Gateway<C> {
        let db_path = dir.path().join("keyfort.db");
        let permissions = PermissionStore::load(&db_path).unwrap();
        Gateway::new(accounts, permissions, AuditLog::disabled(), callbacks)
    }

    /// Build the full relay-side envelope: nip04-encrypted RPC inside a seal
    /// inside a gift wrap.
    async fn bunker_envelope(client: &Keys, receiver: &PublicKey, rpc: &BunkerRequest) -> Event {
        let rpc_json = serde_json::to_string(rpc).unwrap();
        let encrypted =
            nostr::nips::nip04::encrypt(client.secret_key(), receiver, &rpc_json).unwrap();

        let rumor = serde_json::json!({
            "pubkey": client.public_key().to_hex(),
            "created_at": 1_700_000_000u64,
            "kind": 24133,
            "tags": [],
            "content": encrypted,
        })
        .to_string();

        let sealed = nostr::nips::nip44::encrypt(
            client.secret_key(),
            receiver,
            &rumor,
            nostr::nips::nip44::Version::V2,
        )
        .unwrap();
        let seal = EventBuilder::new(Kind::Seal, sealed).sign(client).await.unwrap();

        let ephemeral = Keys::generate();
        let wrapped = nostr::nips::nip44::encrypt(
            ephemeral.secret_key(),
            receiver,
            &seal.as_json(),
            nostr::nips::nip44::Version::V2,
        )
        .unwrap();
        EventBuilder::new(Kind::GiftWrap, wrapped)
            .tag(Tag::public_key(*receiver))
            .sign(&ephemeral)
            .await
            .unwrap()
    }

    fn decrypt_reply(client: &Keys, account_pk: &PublicKey, reply: &Reply) -> BunkerResponse {
        let event = match reply {
            Reply::Bunker(event) => event,
            other => panic!("expected bunker reply, got {other:?}"),
        };
        assert_eq!(event.kind, Kind::NostrConnect);
        let plaintext =
            nostr::nips::nip04::decrypt(client.secret_key(), account_pk, &event.content).unwrap();
        serde_json::from_str(&plaintext).unwrap()
    }

    #[tokio::test]
    async fn test_bunker_round_trip_sign_event() {
        let dir = tempfile::tempdir().unwrap();
        let account = Account::new("main", LocalSigner::generate());
        let account_pk = account.signer.public_key();
        let client = Keys::generate();
        let gateway = gateway_with(vec![account], &dir, AlwaysApprove);

        let rpc = BunkerRequest {
            id: "42".into(),
            method: "sign_event".into(),
            params: vec![r#"{"kind":1,"content":"hi","created_at":1700000000}"#.into()],
            local_key: String::new(),
        };
        let envelope = bunker_envelope(&client, &account_pk, &rpc).await;

        let reply = gateway.handle_envelope(&envelope).await.expect("reply published");
        let response = decrypt_reply(&client, &account_pk, &reply);

        assert_eq!(response.id, "42");
        assert!(response.error.is_none());
        let signed = Event::from_json(response.result.unwrap()).unwrap();
        assert!(signed.verify().is_ok());
        assert_eq!(signed.pubkey, account_pk);
    }

    #[tokio::test]
    async fn test_envelope_for_stranger_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let account = Account::new("main", LocalSigner::generate());
        let client = Keys::generate();
        let gateway = gateway_with(vec![account], &dir, AlwaysApprove);

        let rpc = BunkerRequest {
            id: "1".into(),
            method: "connect".into(),
            params: vec![],
            local_key: String::new(),
        };
        let stranger = Keys::generate().public_key();
        let envelope = bunker_envelope(&client, &stranger, &rpc).await;

        assert!(gateway.handle_envelope(&envelope).await.is_none());
    }

    #[tokio::test]
    async fn test_abandoned_prompt_delivers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let account = Account::new("main", LocalSigner::generate());
        let account_pk = account.signer.public_key();
        let client = Keys::generate();
        let gateway = gateway_with(vec![account], &dir, AlwaysAbandon);

        let rpc = BunkerRequest {
            id: "7".into(),
            method: "sign_event".into(),
            params: vec![r#"{"kind":1,"content":"x","created_at":1700000000}"#.into()],
            local_key: String::new(),
        };
        let envelope = bunker_envelope(&client, &account_pk, &rpc).await;

        assert!(gateway.handle_envelope(&envelope).await.is_none());
    }

    #[tokio::test]
    async fn test_remembered_approval_skips_the_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let account = Account::new("main", LocalSigner::generate());
        let account_pk = account.signer.public_key();
        let client = Keys::generate();
        let counter = CountingApprove(AtomicUsize::new(0));
        let gateway = gateway_with(vec![account], &dir, counter);

        for id in ["1", "2"] {
            let rpc = BunkerRequest {
                id: id.into(),
                method: "sign_event".into(),
                params: vec![r#"{"kind":1,"content":"x","created_at":1700000000}"#.into()],
                local_key: String::new(),
            };
            let envelope = bunker_envelope(&client, &account_pk, &rpc).await;
            let reply = gateway.handle_envelope(&envelope).await.unwrap();
            let response = decrypt_reply(&client, &account_pk, &reply);
            assert!(response.error.is_none());
        }

        // First call prompted and remembered; second resolved from the table.
        assert_eq!(gateway.callbacks.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_seeds_declared_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let account = Account::new("main", LocalSigner::generate());
        let account_id = account.id();
        let account_pk = account.signer.public_key();
        let client = Keys::generate();
        let counter = CountingApprove(AtomicUsize::new(0));
        let gateway = gateway_with(vec![account], &dir, counter);

        let connect = BunkerRequest {
            id: "c".into(),
            method: "connect".into(),
            params: vec![String::new(), String::new(), "sign_event:1".into()],
            local_key: String::new(),
        };
        let envelope = bunker_envelope(&client, &account_pk, &connect).await;
        let reply = gateway.handle_envelope(&envelope).await.unwrap();
        let response = decrypt_reply(&client, &account_pk, &reply);
        assert_eq!(response.result.as_deref(), Some("ack"));

        // A kind-1 sign now auto-approves without another prompt.
        let sign = BunkerRequest {
            id: "s".into(),
            method: "sign_event".into(),
            params: vec![r#"{"kind":1,"content":"x","created_at":1700000000}"#.into()],
            local_key: String::new(),
        };
        let envelope = bunker_envelope(&client, &account_pk, &sign).await;
        let reply = gateway.handle_envelope(&envelope).await.unwrap();
        let response = decrypt_reply(&client, &account_pk, &reply);
        assert!(response.error.is_none());
        assert_eq!(gateway.callbacks.0.load(Ordering::SeqCst), 1);

        let permissions = gateway.permissions.lock().unwrap();
        let record = permissions.record(&account_id);
        let key = format!("{}-sign_event-1", client.public_key().to_hex());
        assert_eq!(record.get(&key), Some(&ApprovalState::Granted));
    }

    #[tokio::test]
    async fn test_standing_denial_returns_error_reply() {
        let dir = tempfile::tempdir().unwrap();
        let account = Account::new("main", LocalSigner::generate());
        let account_id = account.id();
        let account_pk = account.signer.public_key();
        let client = Keys::generate();
        let gateway = gateway_with(vec![account], &dir, AlwaysApprove);

        {
            let mut permissions = gateway.permissions.lock().unwrap();
            let key = format!("{}-sign_event-1", client.public_key().to_hex());
            permissions.remember(&account_id, &key, ApprovalState::Denied).unwrap();
        }

        let rpc = BunkerRequest {
            id: "9".into(),
            method: "sign_event".into(),
            params: vec![r#"{"kind":1,"content":"x","created_at":1700000000}"#.into()],
            local_key: String::new(),
        };
        let envelope = bunker_envelope(&client, &account_pk, &rpc).await;
        let reply = gateway.handle_envelope(&envelope).await.unwrap();
        let response = decrypt_reply(&client, &account_pk, &reply);
        assert!(response.result.is_none());
        assert_eq!(response.error.as_deref(), Some("request rejected"));
    }

    #[tokio::test]
    async fn test_intent_with_callback_url() {
        let dir = tempfile::tempdir().unwrap();
        let account = Account::new("main", LocalSigner::generate());
        let pk_hex = account.signer.public_key().to_hex();
        let gateway = gateway_with(vec![account], &dir, AlwaysApprove);

        let mut extras = Extras::new();
        extras.insert("type".into(), "get_public_key".into());
        extras.insert("callbackUrl".into(), "https://example.com/cb".into());

        let reply = gateway
            .handle_intent("nostrsigner:", Some("com.example.app"), &extras)
            .await
            .unwrap()
            .unwrap();
        match reply {
            Reply::Callback(url) => {
                assert!(url.starts_with("https://example.com/cb?event="));
                assert!(url.contains(&pk_hex));
            }
            other => panic!("expected callback reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_intent_account_hint_selects_identity() {
        let dir = tempfile::tempdir().unwrap();
        let a = Account::new("a", LocalSigner::generate());
        let b = Account::new("b", LocalSigner::generate());
        let b_pk = b.signer.public_key().to_hex();
        let gateway = gateway_with(vec![a, b], &dir, AlwaysApprove);

        let mut extras = Extras::new();
        extras.insert("type".into(), "get_public_key".into());
        extras.insert("current_user".into(), b_pk.clone());

        let reply = gateway
            .handle_intent("nostrsigner:", Some("app"), &extras)
            .await
            .unwrap()
            .unwrap();
        match reply {
            Reply::Inline(result) => assert_eq!(result, b_pk),
            other => panic!("expected inline reply, got {other:?}"),
        }

        extras.insert("current_user".into(), "unknown".into());
        let err = gateway
            .handle_intent("nostrsigner:", Some("app"), &extras)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::IdentityUnresolved));
    }

    #[test]
    fn test_preview_truncates() {
        assert_eq!(preview("short"), "short");
        let long = "x".repeat(300);
        let p = preview(&long);
        assert!(p.len() <= 123);
        assert!(p.ends_with("..."));
    }
}
