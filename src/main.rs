mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::env;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use mmrelay::config::{DaemonArgs, StatePaths, DEFAULT_CONTROL_URL};
use mmrelay::db::Database;
use mmrelay::hook::ControlClient;
use mmrelay::models::SessionStatus;

#[derive(Parser)]
#[command(name = "mmrelay")]
#[command(about = "Relay coding assistant sessions into Mattermost threads")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run or check on the relay daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonCommands,
    },

    /// Inspect and administer recorded sessions
    Session {
        /// State directory holding sessions.db
        #[arg(long, env = "MMRELAY_STATE_DIR", global = true)]
        state_dir: Option<PathBuf>,

        #[command(subcommand)]
        action: SessionCommands,
    },

    /// Assistant-side hooks that talk to a running daemon
    Hook {
        /// Control plane URL
        #[arg(long, env = "MMRELAY_CONTROL_URL", default_value = DEFAULT_CONTROL_URL, global = true)]
        control_url: String,

        #[command(subcommand)]
        action: HookCommands,
    },
}

#[derive(Subcommand)]
enum DaemonCommands {
    /// Run the relay in the foreground
    Run(DaemonArgs),
    /// Check whether a relay is answering on the control plane
    Status {
        /// Control plane URL
        #[arg(long, env = "MMRELAY_CONTROL_URL", default_value = DEFAULT_CONTROL_URL)]
        control_url: String,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// List sessions
    List {
        /// Filter by status (active, ended, timeout, all)
        #[arg(short, long, default_value = "all")]
        status: String,
    },
    /// Show session details
    Show {
        /// Session ID
        id: String,
    },
    /// Mark a session ended
    End {
        /// Session ID
        id: String,
    },
    /// Delete a session and its pending approval
    Delete {
        /// Session ID
        id: String,
        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
    /// Time out sessions idle for at least the given hours
    Expire {
        #[arg(long, env = "SESSION_TIMEOUT_HOURS", default_value_t = 24)]
        hours: u64,
    },
}

#[derive(Subcommand)]
enum HookCommands {
    /// Open a thread for a new session
    Start {
        #[arg(long)]
        session_id: String,
        /// Project directory (defaults to the current directory)
        #[arg(long)]
        project_path: Option<PathBuf>,
    },
    /// Ask the channel to approve a tool call
    RequestApproval {
        #[arg(long)]
        session_id: String,
        #[arg(long)]
        tool: String,
        #[arg(long)]
        command: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Block until a verdict arrives; exits 2 on deny or timeout
        #[arg(long)]
        wait: bool,
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
    },
    /// Post a notification to the session's thread
    Notify {
        #[arg(long)]
        session_id: String,
        message: String,
    },
    /// Post the assistant's reply; "-" reads it from stdin
    Respond {
        #[arg(long)]
        session_id: String,
        response: String,
    },
    /// End the session and mark its thread
    End {
        #[arg(long)]
        session_id: String,
    },
}

fn open_db(state_dir: Option<PathBuf>) -> Result<Database> {
    let state = StatePaths::resolve(state_dir.as_deref());
    Database::open(&state.database()).context("Failed to open session database")
}

fn parse_status_filter(raw: &str) -> Result<Option<SessionStatus>> {
    if raw.eq_ignore_ascii_case("all") {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|_| anyhow::anyhow!("Unknown status '{}' (active, ended, timeout, all)", raw))
}

fn main() -> Result<ExitCode> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Daemon { action } => match action {
            DaemonCommands::Run(args) => {
                commands::daemon::run(&args)?;
                0
            }
            DaemonCommands::Status { control_url } => {
                let client = ControlClient::new(&control_url)?;
                commands::daemon::status(&client)?
            }
        },

        Commands::Session { state_dir, action } => {
            let db = open_db(state_dir)?;
            match action {
                SessionCommands::List { status } => {
                    commands::list::run(&db, parse_status_filter(&status)?)?
                }
                SessionCommands::Show { id } => commands::show::run(&db, &id)?,
                SessionCommands::End { id } => commands::end::run(&db, &id)?,
                SessionCommands::Delete { id, force } => commands::delete::run(&db, &id, force)?,
                SessionCommands::Expire { hours } => commands::expire::run(&db, hours)?,
            }
            0
        }

        Commands::Hook {
            control_url,
            action,
        } => {
            let client = ControlClient::new(&control_url)?;
            match action {
                HookCommands::Start {
                    session_id,
                    project_path,
                } => {
                    let project_path = match project_path {
                        Some(path) => path,
                        None => env::current_dir()?,
                    };
                    commands::hook::start(&client, &session_id, &project_path.to_string_lossy())?
                }
                HookCommands::RequestApproval {
                    session_id,
                    tool,
                    command,
                    description,
                    wait,
                    timeout_secs,
                } => commands::hook::request_approval(
                    &client,
                    &session_id,
                    &tool,
                    &command,
                    &description,
                    wait.then(|| Duration::from_secs(timeout_secs)),
                )?,
                HookCommands::Notify {
                    session_id,
                    message,
                } => commands::hook::notify(&client, &session_id, &message)?,
                HookCommands::Respond {
                    session_id,
                    response,
                } => {
                    let response = if response == "-" {
                        let mut buf = String::new();
                        io::stdin().read_to_string(&mut buf)?;
                        buf
                    } else {
                        response
                    };
                    commands::hook::respond(&client, &session_id, &response)?
                }
                HookCommands::End { session_id } => commands::hook::end(&client, &session_id)?,
            }
        }
    };

    Ok(ExitCode::from(code))
}
