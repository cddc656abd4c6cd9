// Keyfort - remote-signing gateway for Nostr
//
// Holds local identities and answers signing requests from two transports:
// - NIP-46 bunker RPC arriving as gift-wrapped relay events
// - nostrsigner: URIs handed over by local applications
//
// Every request passes the permission resolver before any key material is
// touched; undecided requests prompt on the terminal.

mod audit;
mod gateway;
mod relay;
mod signer;
mod store;

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nostr::prelude::*;

use audit::AuditLog;
use gateway::permissions::PermissionStore;
use gateway::request::Extras;
use gateway::{ApprovalCallbacks, ApprovalOutcome, ApprovalPrompt, Gateway, Reply};
use relay::RelayService;
use signer::LocalSigner;
use store::AccountStore;

#[derive(Parser)]
#[command(name = "keyfort")]
#[command(about = "Remote-signing gateway for Nostr identities")]
#[command(version)]
struct Cli {
    /// Path to the database file
    #[arg(short, long, default_value = "~/.keyfort/keyfort.db")]
    db: String,

    /// Relay URLs (comma-separated)
    #[arg(short, long, default_value = "wss://relay.damus.io,wss://relay.primal.net,wss://nos.lol")]
    relays: String,

    /// Suppress relay connection logs
    #[arg(short, long, default_value_t = false)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a local identity (generates new keys unless --nsec is given)
    Init {
        /// Use existing nsec or hex secret key
        #[arg(long, env = "NOSTR_NSEC", hide_env_values = true)]
        nsec: Option<String>,
        /// Label for this account
        #[arg(short, long, default_value = "main")]
        label: String,
    },
    /// Show stored identities
    Whoami,
    /// Listen on relays and answer signing requests (runs continuously)
    Serve {
        /// Skip prompts and approve every request (for unattended agents)
        #[arg(long, default_value_t = false)]
        auto_approve: bool,
    },
    /// Handle a single nostrsigner: URI and print the result
    HandleUri {
        /// The nostrsigner: URI
        uri: String,
        /// Calling application's package identifier, when known
        #[arg(short, long)]
        package: Option<String>,
        /// Structured extras as key=value pairs
        #[arg(short, long)]
        extra: Vec<String>,
    },
    /// List remembered permission decisions
    Permissions,
    /// Revoke a remembered permission
    Revoke {
        /// Account public key (hex)
        account: String,
        /// Permission key, as shown by `permissions`
        key: String,
    },
}

/// Terminal prompt for interactive approval.
struct StdinApproval;

impl ApprovalCallbacks for StdinApproval {
    fn decide(&self, prompt: &ApprovalPrompt) -> ApprovalOutcome {
        println!("\n=== Signing request ===");
        println!("  Account:   {}", prompt.account);
        println!("  Requester: {}", prompt.requester);
        match prompt.event_kind {
            Some(kind) => println!("  Operation: {} (kind {})", prompt.operation, kind),
            None => println!("  Operation: {}", prompt.operation),
        }
        if !prompt.payload_preview.is_empty() {
            println!("  Payload:   {}", prompt.payload_preview);
        }
        print!("Approve? [y]es / [n]o / [a]lways / n[e]ver: ");
        let _ = std::io::stdout().flush();

        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            return ApprovalOutcome::Abandoned;
        }
        match line.trim().to_lowercase().as_str() {
            "y" | "yes" => ApprovalOutcome::Approved { remember: false },
            "a" | "always" => ApprovalOutcome::Approved { remember: true },
            "n" | "no" => ApprovalOutcome::Rejected { remember: false },
            "e" | "never" => ApprovalOutcome::Rejected { remember: true },
            _ => ApprovalOutcome::Abandoned,
        }
    }
}

/// Unattended mode: every request goes through, nothing is remembered.
struct AutoApproval;

impl ApprovalCallbacks for AutoApproval {
    fn decide(&self, _prompt: &ApprovalPrompt) -> ApprovalOutcome {
        ApprovalOutcome::Approved { remember: false }
    }
}

fn init_account(db_path: &PathBuf, nsec: Option<&str>, label: &str) -> Result<()> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let (signer, generated) = match nsec {
        Some(secret) => (LocalSigner::from_secret(secret)?, false),
        None => (LocalSigner::generate(), true),
    };

    let mut accounts = AccountStore::load(db_path)?;
    accounts.add(label, &signer)?;

    println!("✓ Account '{}' stored", label);
    println!("  npub: {}", signer.public_key().to_bech32()?);
    println!("  hex:  {}", signer.public_key());
    if generated {
        println!("\nGenerated a fresh keypair. Back up the secret key:");
        println!("  nsec: {}", SecretKey::from_hex(&signer.secret_hex())?.to_bech32()?);
    }
    Ok(())
}

fn whoami(db_path: &PathBuf, relays: &[String]) -> Result<()> {
    let accounts = AccountStore::load(db_path)?.accounts()?;
    if accounts.is_empty() {
        println!("No identities stored. Add one with: keyfort init");
        return Ok(());
    }
    println!("=== Keyfort Identities ({}) ===", accounts.len());
    for account in &accounts {
        println!("\n  {} ", account.label);
        println!("    npub: {}", account.signer.public_key().to_bech32()?);
        println!("    hex:  {}", account.signer.public_key());
    }
    println!("\nRelays:");
    for relay in relays {
        println!("  - {}", relay);
    }
    Ok(())
}

fn build_gateway<C: ApprovalCallbacks>(db_path: &PathBuf, callbacks: C) -> Result<Gateway<C>> {
    let accounts = AccountStore::load(db_path)?.accounts()?;
    if accounts.is_empty() {
        anyhow::bail!("No identities stored. Add one first with: keyfort init");
    }
    let permissions = PermissionStore::load(db_path)?;
    let audit_log = AuditLog::new(db_path);
    Ok(Gateway::new(accounts, permissions, audit_log, callbacks))
}

async fn serve(db_path: &PathBuf, relays: Vec<String>, auto_approve: bool) -> Result<()> {
    if auto_approve {
        println!("⚠️  Auto-approve enabled: every request will be signed without prompting.");
        let gateway = Arc::new(build_gateway(db_path, AutoApproval)?);
        RelayService::new(relays, gateway).await?.run().await
    } else {
        let gateway = Arc::new(build_gateway(db_path, StdinApproval)?);
        RelayService::new(relays, gateway).await?.run().await
    }
}

async fn handle_uri(
    db_path: &PathBuf,
    uri: &str,
    package: Option<&str>,
    extra: &[String],
) -> Result<()> {
    let mut extras: Extras = HashMap::new();
    for pair in extra {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("Invalid extra '{pair}', expected key=value"))?;
        extras.insert(key.to_string(), value.to_string());
    }

    let gateway = build_gateway(db_path, StdinApproval)?;
    match gateway.handle_intent(uri, package, &extras).await? {
        Some(Reply::Callback(url)) => println!("{url}"),
        Some(Reply::Inline(result)) => println!("{result}"),
        Some(Reply::Bunker(_)) => unreachable!("intent transport never replies over the relay"),
        None => println!("(no result: request abandoned)"),
    }
    Ok(())
}

fn list_permissions(db_path: &PathBuf) -> Result<()> {
    let permissions = PermissionStore::load(db_path)?;
    let all = permissions.all();
    if all.is_empty() {
        println!("No remembered permissions.");
        return Ok(());
    }
    for (account, record) in all {
        println!("Account {}:", account);
        let mut keys: Vec<_> = record.iter().collect();
        keys.sort_by(|a, b| a.0.cmp(b.0));
        for (key, state) in keys {
            println!("  {:?}  {}", state, key);
        }
    }
    Ok(())
}

fn revoke_permission(db_path: &PathBuf, account: &str, key: &str) -> Result<()> {
    let mut permissions = PermissionStore::load(db_path)?;
    if permissions.revoke(account, key)? {
        println!("✓ Revoked {key}");
    } else {
        println!("No such permission: {key}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let default_filter = if cli.quiet { "warn,nostr_relay_pool=off" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let db_path = PathBuf::from(cli.db.replace("~", &std::env::var("HOME").unwrap_or_default()));
    let relay_urls: Vec<String> = cli.relays.split(',').map(|s| s.trim().to_string()).collect();

    match cli.command {
        Commands::Init { nsec, label } => init_account(&db_path, nsec.as_deref(), &label),
        Commands::Whoami => whoami(&db_path, &relay_urls),
        Commands::Serve { auto_approve } => serve(&db_path, relay_urls, auto_approve).await,
        Commands::HandleUri { uri, package, extra } => {
            handle_uri(&db_path, &uri, package.as_deref(), &extra).await
        }
        Commands::Permissions => list_permissions(&db_path),
        Commands::Revoke { account, key } => revoke_permission(&db_path, &account, &key),
    }
}
