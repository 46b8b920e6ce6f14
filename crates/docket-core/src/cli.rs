use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::anyhow;
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
pub struct PreprocessedArgs {
    pub cleaned_args: Vec<OsString>,
    pub rc_overrides: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct KeyVal {
    pub key: String,
    pub value: String,
}

impl std::str::FromStr for KeyVal {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (k, v) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("expected KEY=VALUE, got: {s}"))?;
        Ok(Self {
            key: k.trim().to_string(),
            value: v.trim().to_string(),
        })
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "docket",
    version,
    about = "Docket: offline-first tracker for tasks taken from meeting protocols",
    disable_help_subcommand = true
)]
pub struct GlobalCli {
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[arg(short = 'q', long = "quiet", action = ArgAction::Count, global = true)]
    pub quiet: u8,

    #[arg(
        long = "rc",
        value_parser = clap::builder::ValueParser::new(|s: &str| s.parse::<KeyVal>()),
        action = ArgAction::Append,
        global = true
    )]
    pub rc_overrides: Vec<KeyVal>,

    #[arg(long = "rc-file", global = true)]
    pub rc_file: Option<PathBuf>,

    #[arg(long = "data", global = true)]
    pub data: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Field edits shared by `add` and `update`.
#[derive(Args, Debug, Clone, Default)]
pub struct FieldArgs {
    #[arg(long)]
    pub section: Option<String>,

    #[arg(long)]
    pub responsible: Option<String>,

    #[arg(long)]
    pub timeline: Option<String>,

    #[arg(long)]
    pub notes: Option<String>,

    /// 0 = none, 1 = low, 2 = medium, 3 = high
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=3))]
    pub priority: Option<u8>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create an account and start a session.
    Register {
        username: String,
        email: String,
        /// Read from stdin when omitted.
        #[arg(long)]
        password: Option<String>,
    },
    /// Start a session with a username or email.
    Login {
        username: String,
        #[arg(long)]
        password: Option<String>,
    },
    Logout {
        /// Also delete cached tasks, queued changes and saved settings.
        #[arg(long)]
        purge: bool,
    },
    /// List cached tasks, refreshing from the server when online.
    List {
        /// Include completed tasks.
        #[arg(long)]
        all: bool,
    },
    Add {
        #[arg(required = true, num_args = 1..)]
        description: Vec<String>,
        #[command(flatten)]
        fields: FieldArgs,
    },
    Update {
        id: String,
        #[arg(long)]
        description: Option<String>,
        #[command(flatten)]
        fields: FieldArgs,
        /// Clear a field: section, responsible, timeline or notes.
        #[arg(long = "clear", action = ArgAction::Append)]
        clear: Vec<String>,
    },
    /// Mark a task completed (or open again with --undo).
    Done {
        id: String,
        #[arg(long)]
        undo: bool,
    },
    /// Set a priority, or step to the next one when no level is given.
    Priority {
        id: String,
        #[arg(value_parser = clap::value_parser!(u8).range(0..=3))]
        level: Option<u8>,
    },
    Delete {
        id: String,
    },
    Search {
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,
    },
    Stats {
        /// Count the local cache instead of asking the server.
        #[arg(long)]
        local: bool,
    },
    /// Show tasks whose description repeats an earlier one.
    Duplicates {
        #[arg(long = "by-section")]
        by_section: bool,
        /// Store the duplicate flags on the tasks.
        #[arg(long)]
        apply: bool,
    },
    /// Upload a .docx or .pdf protocol and import its table rows as tasks.
    Import {
        file: PathBuf,
        /// First global id to number imported rows from.
        #[arg(long = "first-id")]
        first_id: Option<u64>,
        /// Print the extracted rows without creating tasks.
        #[arg(long = "dry-run")]
        dry_run: bool,
    },
    /// Replay queued changes and refresh from the server.
    Sync,
    Offline,
    Online,
    Status,
    Conflicts {
        #[arg(long)]
        clear: bool,
    },
    #[command(subcommand)]
    State(StateCommand),
}

#[derive(Subcommand, Debug, Clone)]
pub enum StateCommand {
    Save {
        #[arg(long, default_value = "list")]
        view: String,
        #[arg(long, default_value = "all")]
        filter: String,
        #[arg(long, default_value = "")]
        query: String,
        #[arg(long = "sort", default_value = "date")]
        sort_by: String,
    },
    Show,
}

pub fn init_tracing(verbose: u8, quiet: u8) -> anyhow::Result<()> {
    let default_level = if quiet >= 2 {
        "error"
    } else if quiet == 1 {
        "warn"
    } else if verbose >= 3 {
        "trace"
    } else if verbose == 2 {
        "debug"
    } else if verbose == 1 {
        "info"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| anyhow!("invalid RUST_LOG / log filter: {e}"))?;

    let init_result = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();

    if let Err(err) = init_result {
        debug!(error = %err, "tracing subscriber already set, continuing");
    }

    Ok(())
}

#[tracing::instrument(skip_all)]
pub fn preprocess_args(raw: &[OsString]) -> anyhow::Result<PreprocessedArgs> {
    let mut cleaned = Vec::with_capacity(raw.len());
    let mut overrides: Vec<(String, String)> = Vec::new();

    let mut iter = raw.iter().cloned();
    if let Some(bin) = iter.next() {
        cleaned.push(bin);
    }

    for arg in iter {
        let s = arg.to_string_lossy();
        if let Some(rest) = s.strip_prefix("rc.") {
            let parsed = if let Some((k, v)) = rest.split_once('=') {
                Some((format!("rc.{k}"), v.to_string()))
            } else if let Some((k, v)) = rest.split_once(':') {
                Some((format!("rc.{k}"), v.to_string()))
            } else {
                None
            };

            if let Some((k, v)) = parsed {
                debug!(key = %k, value = %v, "captured positional rc override");
                overrides.push((k, v));
                continue;
            }
        }

        cleaned.push(arg);
    }

    Ok(PreprocessedArgs {
        cleaned_args: cleaned,
        rc_overrides: overrides,
    })
}
