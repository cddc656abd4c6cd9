//! Relay transport
//!
//! Subscribes to gift-wrapped events addressed to any local account, feeds
//! them through the gateway, and publishes whatever reply events come back.
//! One envelope at a time: the notification loop awaits each request to
//! completion before taking the next, so approval prompts never interleave.

use std::sync::Arc;

use anyhow::{Context, Result};
use nostr_sdk::prelude::*;
use tracing::{debug, info, warn};

use crate::gateway::{ApprovalCallbacks, Gateway, Reply};

pub struct RelayService<C: ApprovalCallbacks> {
    client: Client,
    relays: Vec<String>,
    gateway: Arc<Gateway<C>>,
}

impl<C: ApprovalCallbacks + 'static> RelayService<C> {
    pub async fn new(relays: Vec<String>, gateway: Arc<Gateway<C>>) -> Result<Self> {
        let client = Client::default();
        for relay in &relays {
            client
                .add_relay(relay.as_str())
                .await
                .with_context(|| format!("Failed to add relay {relay}"))?;
        }
        Ok(Self { client, relays, gateway })
    }

    /// Connect and consume envelopes until the connection is torn down.
    pub async fn run(&self) -> Result<()> {
        info!(relays = ?self.relays, "connecting to relays");
        self.client.connect().await;

        let account_keys: Vec<PublicKey> = self
            .gateway
            .accounts()
            .iter()
            .map(|a| a.signer.public_key())
            .collect();
        let filter = Filter::new().kind(Kind::GiftWrap).pubkeys(account_keys);

        self.client
            .subscribe(filter, None)
            .await
            .context("Failed to subscribe to gift-wrap events")?;

        info!(accounts = self.gateway.accounts().len(), "listening for signing requests");

        let gateway = self.gateway.clone();
        let client = self.client.clone();

        self.client
            .handle_notifications(|notification| {
                let gateway = gateway.clone();
                let client = client.clone();

                async move {
                    if let RelayPoolNotification::Event { event, .. } = notification {
                        if event.kind == Kind::GiftWrap {
                            Self::handle_envelope(&gateway, &client, &event).await;
                        }
                    }
                    Ok(false)
                }
            })
            .await
            .context("Relay notification loop failed")?;

        Ok(())
    }

    async fn handle_envelope(gateway: &Gateway<C>, client: &Client, event: &Event) {
        match gateway.handle_envelope(event).await {
            Some(Reply::Bunker(reply)) => {
                if let Err(e) = client.send_event(&reply).await {
                    warn!(error = %e, "failed to publish reply event");
                }
            }
            Some(other) => {
                // Relay requests always answer over the relay.
                warn!(reply = ?other, "unexpected reply shape for relay transport");
            }
            None => {
                debug!(event = %event.id, "envelope produced no reply");
            }
        }
    }

    pub async fn shutdown(&self) {
        self.client.disconnect().await;
    }
}
