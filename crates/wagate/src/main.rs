//! Wagate command line.
//!
//! Drives one tenant's gateway session and prints every session notice to
//! stdout as a JSON line. Logs go to stderr.
//!
//! Usage:
//!   wagate --subscriber clinica-norte connect --wait
//!   wagate --tenant 42 reset --yes

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wagate::config::Config;
use wagate::protocol::SessionNotice;
use wagate::session::{
    ConnectOutcome, CycleOutcome, SessionError, SessionOrchestrator, SessionRegistry,
    StatusSnapshot, TenantIdentity,
};

#[derive(Parser)]
#[command(name = "wagate", version, about = "Manage WhatsApp gateway sessions")]
struct Cli {
    /// Path to the YAML config file. A missing file means defaults.
    #[arg(long, short, default_value = "wagate.yaml")]
    config: PathBuf,

    /// Subscriber name; preferred over the tenant id as the session name.
    #[arg(long)]
    subscriber: Option<String>,

    /// Tenant id; also selects the tenant's gateway override.
    #[arg(long)]
    tenant: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check the session status once.
    Status,
    /// Create or resume the session and start QR pairing.
    Connect {
        /// Keep running until pairing succeeds, fails or times out.
        #[arg(long)]
        wait: bool,
    },
    /// Stop the session on the gateway.
    Disconnect,
    /// Restart the session and poll for a new QR.
    Restart,
    /// Delete the session on the gateway.
    Reset {
        /// Confirm deletion; the phone has to be paired again afterwards.
        #[arg(long)]
        yes: bool,
    },
    /// Print notices until Ctrl-C, with background status refresh enabled.
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wagate=info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = Config::load(&cli.config)
        .await
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let tenant = TenantIdentity {
        tenant_id: cli.tenant,
        subscriber: cli.subscriber,
    };

    let (registry, notices) = SessionRegistry::from_config(config);
    let printer = tokio::spawn(print_notices(notices));

    let session = registry.open(&tenant)?;
    info!(session = %session.session(), "Starting wagate");

    let result = run(&session, cli.command).await;

    registry.close_all().await;
    drop(session);
    drop(registry);
    if let Err(e) = printer.await {
        warn!(error = %e, "Notice printer ended abnormally");
    }

    let summary = result?;
    println!("{}", summary);
    Ok(())
}

async fn run(session: &Arc<SessionOrchestrator>, command: Command) -> anyhow::Result<String> {
    match command {
        Command::Status => {
            let snapshot = session.refresh_status().await?;
            Ok(describe(session.session(), &snapshot))
        }
        Command::Connect { wait } => {
            let outcome = session.connect().await?;
            if wait && matches!(outcome, ConnectOutcome::Polling(_)) {
                return Ok(match session.wait_for_cycle().await {
                    Some(CycleOutcome::Connected(_)) => {
                        describe(session.session(), &session.snapshot())
                    }
                    Some(CycleOutcome::TimedOut(condition)) if !condition.is_error() => {
                        "QR code not scanned in time; it stays valid".to_string()
                    }
                    Some(other) => anyhow::bail!("pairing did not complete: {:?}", other),
                    None => anyhow::bail!("polling cycle ended unexpectedly"),
                });
            }
            Ok(format!("{:?}", outcome))
        }
        Command::Disconnect => {
            session.disconnect().await?;
            Ok(format!("{} disconnected", session.session()))
        }
        Command::Restart => {
            let outcome = session.restart().await?;
            Ok(format!("{:?}", outcome))
        }
        Command::Reset { yes } => {
            match session.reset(yes).await {
                Err(SessionError::ConfirmationRequired) => {
                    anyhow::bail!("refusing to delete {} without --yes", session.session())
                }
                other => other?,
            }
            Ok(format!("{} deleted", session.session()))
        }
        Command::Watch => {
            session.set_auto_refresh(true);
            session.refresh_status().await?;
            tokio::signal::ctrl_c().await?;
            info!("Received Ctrl-C, stopping");
            Ok(describe(session.session(), &session.snapshot()))
        }
    }
}

fn describe(session: &str, snapshot: &StatusSnapshot) -> String {
    match &snapshot.identity {
        Some(identity) => format!(
            "{}: {} as {}",
            session,
            snapshot.status,
            identity.push_name.as_deref().unwrap_or(&identity.id)
        ),
        None => format!("{}: {}", session, snapshot.status),
    }
}

async fn print_notices(mut notices: mpsc::UnboundedReceiver<SessionNotice>) {
    while let Some(notice) = notices.recv().await {
        match serde_json::to_string(&notice) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!(error = %e, "Failed to encode session notice"),
        }
    }
}
