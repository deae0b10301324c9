//! `bookit-admin`: seed and inspect a bookit data directory.
//!
//! ## Usage
//!
//! ```sh
//! # Seed 30 one-hour slots on consecutive days
//! bookit-admin --data-dir ./data seed --host a@b.com
//!
//! # Print a hold request for tomorrow
//! bookit-admin hold-message --host a@b.com --day-offset 1
//!
//! # Create a schedule token and print it
//! bookit-admin issue-schedule-token --host a@b.com
//! ```
//!
//! Commands that touch the data directory must run while the server is stopped.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use bookit::auth::encode_api_token;
use bookit::clock::now_ms;
use bookit::model::format_instant;
use bookit::store::{TokenSource, WalStore};
use bookit::tools;

#[derive(Parser)]
#[command(name = "bookit-admin", version, about = "Seed and inspect a bookit data directory")]
struct Cli {
    /// Data directory holding bookit.wal
    #[arg(long, env = "BOOKIT_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Insert one-hour slots at 09:00 UTC on consecutive days, starting tomorrow
    Seed {
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = 30)]
        count: u32,
    },
    /// Print a hold-request message for 10:00 UTC, `day-offset` days from today
    HoldMessage {
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = 1, allow_hyphen_values = true)]
        day_offset: i64,
    },
    /// Print the current time shifted by the given days and minutes
    OffsetTime {
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        days: i64,
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        minutes: i64,
    },
    /// Print the current schedule token of a host
    ScheduleToken {
        #[arg(long)]
        host: String,
    },
    /// Print the accepted api tokens, base64-encoded for the wire
    ApiToken,
    /// Make a new schedule token current for a host
    IssueScheduleToken {
        #[arg(long)]
        host: String,
        /// Token value (generated if omitted)
        #[arg(long)]
        token: Option<String>,
    },
    /// Add an api token
    IssueApiToken {
        /// Token value (generated if omitted)
        #[arg(long)]
        token: Option<String>,
    },
}

fn open_store(data_dir: &Path) -> Result<WalStore> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;
    let path = data_dir.join("bookit.wal");
    WalStore::open(&path).with_context(|| format!("failed to open {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let now = now_ms();

    match cli.command {
        Commands::Seed { host, count } => {
            let store = open_store(&cli.data_dir)?;
            let seeded = tools::seed_slots(&store, &host, count, now).await?;
            for slot in &seeded {
                let (start, end) = (slot.span.start, slot.span.end);
                println!("{} {} {}", slot.id, format_instant(start), format_instant(end));
            }
            eprintln!("seeded {} of {count} slots for {host}", seeded.len());
        }
        Commands::HoldMessage { host, day_offset } => {
            let msg = tools::hold_message(&host, day_offset, now);
            println!("{}", serde_json::to_string(&msg)?);
        }
        Commands::OffsetTime { days, minutes } => {
            println!("{}", tools::offset_time(now, days, minutes));
        }
        Commands::ScheduleToken { host } => {
            let store = open_store(&cli.data_dir)?;
            match store.schedule_token(&host).await? {
                Some(token) => println!("{token}"),
                None => bail!("no schedule token for {host}"),
            }
        }
        Commands::ApiToken => {
            let store = open_store(&cli.data_dir)?;
            let tokens = store.api_tokens().await?;
            if tokens.is_empty() {
                bail!("no api token issued");
            }
            for token in tokens {
                println!("{}", encode_api_token(&token));
            }
        }
        Commands::IssueScheduleToken { host, token } => {
            let store = open_store(&cli.data_dir)?;
            let token = token.unwrap_or_else(tools::generate_token);
            store.issue_schedule_token(&host, &token).await?;
            println!("{token}");
        }
        Commands::IssueApiToken { token } => {
            let store = open_store(&cli.data_dir)?;
            let token = token.unwrap_or_else(tools::generate_token);
            store.issue_api_token(&token).await?;
            println!("{}", encode_api_token(&token));
        }
    }
    Ok(())
}
