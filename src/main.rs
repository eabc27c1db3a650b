use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use otp_relay_lib::adapters::imap::MailboxSession;
use otp_relay_lib::adapters::sqlite::SqlitePatternStore;
use otp_relay_lib::config::AppConfig;
use otp_relay_lib::services::RetrievalService;
use otp_relay_lib::types::error::{RelayError, Result};
use otp_relay_lib::types::{Role, TenantId};

/// EX_TEMPFAIL from sysexits.h
const EXIT_RETRYABLE: u8 = 75;

#[derive(Parser, Debug)]
#[command(
    name = "otp-relay",
    about = "Retrieve one-time-code emails from the shared relay mailbox",
    arg_required_else_help = true
)]
struct Cli {
    #[arg(short, long, env = "OTP_RELAY_CONFIG", help = "Path to config.toml")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List recent messages visible to a tenant
    List {
        #[arg(long)]
        tenant: TenantId,
        #[arg(long, value_enum, default_value_t = RoleArg::User)]
        role: RoleArg,
        #[arg(long, help = "Recipient address or fragment to search for")]
        search: Option<String>,
    },
    /// Fetch one message by id
    Get {
        #[arg(long)]
        tenant: TenantId,
        #[arg(long, value_enum, default_value_t = RoleArg::User)]
        role: RoleArg,
        #[arg(long)]
        id: String,
    },
    /// Show the mailbox session state
    Status,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RoleArg {
    Admin,
    User,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Admin => Role::Admin,
            RoleArg::User => Role::User,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("otp_relay_lib=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            if e.is_retryable() {
                ExitCode::from(EXIT_RETRYABLE)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = AppConfig::load(cli.config.as_deref())?;
    info!(host = %config.imap.host, folder = %config.imap.folder, "Starting otp-relay");

    let store = SqlitePatternStore::new(&config.database.path)?;
    if config.database.seed_defaults {
        store.seed_default_patterns()?;
    }

    let session = Arc::new(MailboxSession::new(config.imap.clone()));
    let service = RetrievalService::new(Arc::new(store), session, &config.retrieval);

    // Requests reconnect on demand, so a failed start only degrades.
    if let Err(e) = service.connect().await {
        warn!("Initial IMAP connection failed, continuing: {}", e);
    }

    let outcome = match cli.command {
        Commands::List {
            tenant,
            role,
            search,
        } => {
            let messages = service
                .list_messages(tenant, role.into(), search.as_deref())
                .await;
            messages.and_then(|m| print_json(&m))
        }
        Commands::Get { tenant, role, id } => service
            .get_message(tenant, role.into(), &id)
            .await
            .and_then(|m| print_json(&m)),
        Commands::Status => print_json(&service.status().await),
    };

    service.disconnect().await;
    outcome
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(RelayError::from)?;
    println!("{}", json);
    Ok(())
}
