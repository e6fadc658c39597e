//! Issue a session token signed with the server secret.
//!
//! Usage:
//!   DEVROOM_JWT_SECRET=... cargo run --bin issue-token -- --subject alice --email alice@example.com
//!
//! Prints the token on stdout. Pass it as the `token` cookie or as
//! `Authorization: Bearer <token>`.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use devroom_server::gate::{MemoryRevocationStore, SessionGate};

#[derive(Parser)]
#[command(name = "issue-token", about = "Issue a devroom session token")]
struct Args {
    /// Participant id (`sub` claim).
    #[arg(long)]
    subject: String,

    /// Optional email claim.
    #[arg(long)]
    email: Option<String>,

    /// Validity in seconds.
    #[arg(long, default_value_t = 24 * 3600)]
    ttl_secs: u64,

    /// Signing secret.
    #[arg(long, env = "DEVROOM_JWT_SECRET", hide_env_values = true)]
    secret: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let args = Args::parse();
    if args.secret.is_empty() {
        anyhow::bail!("secret must not be empty");
    }

    let gate = SessionGate::new(&args.secret, Arc::new(MemoryRevocationStore::new()));
    let token = gate.issue(
        &args.subject,
        args.email.as_deref(),
        Duration::from_secs(args.ttl_secs),
    );
    tracing::info!(subject = %args.subject, ttl_secs = args.ttl_secs, "Issued token");
    println!("{token}");
    Ok(())
}
