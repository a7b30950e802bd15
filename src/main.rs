//! # Chat Archive CLI (`chat-archive`)
//!
//! ## Usage
//!
//! ```bash
//! chat-archive [--config PATH] [-v|-q] <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `chat-archive init` | Create the SQLite database and run schema migrations |
//! | `chat-archive accounts` | List configured accounts and their health |
//! | `chat-archive sync [SELECTOR...]` | Synchronize accounts (`backend` or `backend:account`) |
//! | `chat-archive search KEYWORD...` | Search messages, with context |
//! | `chat-archive list` | Print every archived message |
//! | `chat-archive stats` | Archive statistics |
//! | `chat-archive unknown` | List conversations with unknown senders |
//! | `chat-archive unknown resolve ID NAME...` | Name the unknown sender of a private conversation |

use anyhow::Result;
use chat_archive::progress::ProgressMode;
use chat_archive::{accounts, config, migrate, search, stats, sync, unknown};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Chat Archive CLI: a local, searchable archive of chat messages.
///
/// The configuration is read from `--config`, `$CHAT_ARCHIVE_CONFIG`, or
/// `~/.config/chat-archive.toml`, in that order.
#[derive(Parser)]
#[command(
    name = "chat-archive",
    about = "A local, searchable archive of chat messages synchronized from multiple chat services",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More logging (repeatable).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; every other database command also runs it.
    Init,

    /// List configured accounts and their status.
    Accounts,

    /// Synchronize accounts into the archive.
    ///
    /// Selector format: `<backend>` or `<backend>:<account>`. Without
    /// selectors every configured account is synchronized. Exits with
    /// status 1 if any account could not be synchronized at all.
    Sync {
        selectors: Vec<String>,

        /// Retry conversations that failed in earlier runs.
        #[arg(long)]
        force: bool,

        /// Progress output on stderr: `auto`, `human`, `json` or `off`.
        #[arg(long, default_value = "auto")]
        progress: String,
    },

    /// Search messages.
    ///
    /// Every keyword must match (case-insensitively) one of: backend,
    /// account, conversation name, sender name or email, the timestamp as
    /// `YYYY-MM-DD HH:MM:SS`, or the message body.
    Search {
        #[arg(required = true)]
        keywords: Vec<String>,

        /// Messages of context before and after each hit.
        #[arg(short = 'C', long)]
        context: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// Print every archived message, oldest first.
    List {
        #[arg(long)]
        json: bool,
    },

    /// Show archive statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// List or resolve messages from unknown senders.
    Unknown {
        #[command(subcommand)]
        action: Option<UnknownAction>,
    },
}

#[derive(Subcommand)]
enum UnknownAction {
    /// Attach a new contact to the single unknown sender of a private
    /// conversation.
    Resolve {
        /// Conversation id as shown by `chat-archive unknown`.
        conversation: i64,
        /// Full name of the sender.
        #[arg(required = true)]
        name: Vec<String>,
    },
}

fn init_tracing(verbose: u8, quiet: bool) {
    let default = if quiet {
        "chat_archive=warn"
    } else {
        match verbose {
            0 => "chat_archive=info",
            1 => "chat_archive=debug",
            _ => "chat_archive=trace",
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn progress_mode(value: &str) -> Result<ProgressMode> {
    Ok(match value {
        "auto" => ProgressMode::default_for_tty(),
        "human" => ProgressMode::Human,
        "json" => ProgressMode::Json,
        "off" => ProgressMode::Off,
        other => anyhow::bail!(
            "Unknown progress mode: {}. Use auto, human, json or off.",
            other
        ),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let cfg = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Accounts => {
            accounts::list_accounts(&cfg).await?;
        }
        Commands::Sync {
            selectors,
            force,
            progress,
        } => {
            let mode = progress_mode(&progress)?;
            let report = sync::run_sync(&cfg, &selectors, force, mode).await?;
            if report.has_fatal_errors() {
                for (account, error) in report.fatal_errors() {
                    eprintln!("Error: {}: {}", account, error);
                }
                std::process::exit(1);
            }
        }
        Commands::Search {
            keywords,
            context,
            json,
        } => {
            search::run_search(&cfg, &keywords, context, json).await?;
        }
        Commands::List { json } => {
            search::run_list(&cfg, json).await?;
        }
        Commands::Stats { json } => {
            stats::run_stats(&cfg, json).await?;
        }
        Commands::Unknown { action } => match action {
            None => unknown::run_list(&cfg).await?,
            Some(UnknownAction::Resolve { conversation, name }) => {
                unknown::run_resolve(&cfg, conversation, &name.join(" ")).await?;
            }
        },
    }

    Ok(())
}
