#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use smtpy_common::{EmailAddress, Message};
use smtpy_delivery::{
    Collaborators, DeliveryConfig, DeliveryOutcome, DkimKey, HybridRouter, Priority,
    StaticKeyStore,
};
use tracing::warn;

/// Send mail directly to recipient MX hosts, through a relay, or both
#[derive(Parser, Debug)]
#[command(name = "smtpy")]
#[command(about = "Outbound mail delivery", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (RON). Overrides `SMTPY_CONFIG` and the default
    /// locations
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deliver a message file (RFC 5322) to one or more recipients
    Send {
        /// Envelope sender
        #[arg(long)]
        from: String,

        /// Envelope recipient, may be repeated
        #[arg(long, required = true)]
        to: Vec<String>,

        /// Relay queue priority (low, normal, high)
        #[arg(long, default_value = "normal")]
        priority: Priority,

        /// PEM private key used to DKIM-sign for the sender's domain
        #[arg(long)]
        dkim_key: Option<PathBuf>,

        /// Message file
        message: PathBuf,
    },
    /// Validate and print the effective configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    smtpy_common::logging::init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::CheckConfig => check_config(config),
        Commands::Send {
            from,
            to,
            priority,
            dkim_key,
            message,
        } => send(config, &from, to, priority, dkim_key.as_deref(), &message).await,
    }
}

/// Find the configuration using the following precedence:
/// 1. `--config`
/// 2. `SMTPY_CONFIG` environment variable
/// 3. ./smtpy.config.ron (current working directory)
/// 4. /etc/smtpy/smtpy.config.ron (system-wide config)
/// 5. `SMTP_*` environment variables
fn load_config(explicit: Option<&Path>) -> anyhow::Result<DeliveryConfig> {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => find_config_file()?,
    };

    let Some(path) = path else {
        return DeliveryConfig::from_env().context("Invalid SMTP_* environment configuration");
    };

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    ron::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn find_config_file() -> anyhow::Result<Option<PathBuf>> {
    if let Ok(env_path) = std::env::var("SMTPY_CONFIG") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(Some(path));
        }
        anyhow::bail!(
            "SMTPY_CONFIG points to non-existent file: {}",
            path.display()
        );
    }

    let default_paths = [
        PathBuf::from("./smtpy.config.ron"),
        PathBuf::from("/etc/smtpy/smtpy.config.ron"),
    ];

    Ok(default_paths.into_iter().find(|path| path.exists()))
}

fn check_config(mut config: DeliveryConfig) -> anyhow::Result<()> {
    config.validate()?;

    if config.relay.password.is_some() {
        config.relay.password = Some("********".to_string());
    }
    let rendered = ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::default())?;
    println!("{rendered}");
    Ok(())
}

async fn send(
    config: DeliveryConfig,
    from: &str,
    recipients: Vec<String>,
    priority: Priority,
    dkim_key: Option<&Path>,
    path: &Path,
) -> anyhow::Result<()> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read message {}", path.display()))?;
    let message = Message::parse(&raw, from, recipients.clone())?;

    let mut keys = StaticKeyStore::new();
    if let Some(key_path) = dkim_key {
        let pem = tokio::fs::read_to_string(key_path)
            .await
            .with_context(|| format!("Failed to read DKIM key {}", key_path.display()))?;
        let sender = EmailAddress::parse(from)?;
        keys = keys.with_key(DkimKey::new(sender.domain().clone(), pem));
    }

    let collaborators = Collaborators::system(Arc::new(keys), &config)?;
    let router = HybridRouter::new(config, collaborators)?;
    router.start().await?;

    let outcomes = tokio::select! {
        outcomes = router.send_email(&message, &recipients, from, priority) => Some(outcomes),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping delivery engine");
            None
        }
    };

    router.stop().await;

    let Some(outcomes) = outcomes else {
        anyhow::bail!("Delivery interrupted");
    };

    let mut outcomes: Vec<DeliveryOutcome> = outcomes.into_values().collect();
    outcomes.sort_by(|a, b| a.recipient.cmp(&b.recipient));

    for outcome in &outcomes {
        let code = outcome
            .code
            .map_or_else(|| "---".to_string(), |code| code.to_string());
        println!(
            "{:<40} {:<10} {code} {} ({} attempt(s))",
            outcome.recipient,
            outcome.status.as_str(),
            outcome.message,
            outcome.attempts.len()
        );
    }

    let undelivered = outcomes.iter().filter(|o| !o.is_delivered()).count();
    if undelivered > 0 {
        anyhow::bail!("{undelivered} of {} recipient(s) not delivered", outcomes.len());
    }
    Ok(())
}
