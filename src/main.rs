//! Command-line companion for inspecting and refreshing a script
//! registry backed by a state file.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use auts_sync::badge;
use auts_sync::http::UreqFetcher;
use auts_sync::logging;
use auts_sync::mapper;
use auts_sync::metadata;
use auts_sync::refresh;
use auts_sync::store::FileStateStore;

#[derive(Parser)]
#[command(
    name = "auts-sync",
    about = "Inspect and refresh a local userscript registry",
    version
)]
struct Cli {
    /// State file backing the registry (default: ~/.auts/state.json)
    #[arg(long, global = true)]
    store: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List mapped scripts
    List {
        /// Include disabled scripts
        #[arg(long)]
        all: bool,
    },
    /// Count enabled scripts covering a URL
    Count { url: String },
    /// Run one refresh sweep over enabled remote sources
    Refresh,
    /// Parse a script file's header block and print the metadata
    Parse { file: PathBuf },
}

fn default_store_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".auts")
        .join("state.json")
}

fn resolve_store_path(arg: Option<&str>) -> PathBuf {
    match arg {
        Some(raw) => PathBuf::from(shellexpand::tilde(raw).into_owned()),
        None => default_store_path(),
    }
}

fn main() -> Result<()> {
    let _logging = logging::init();
    let cli = Cli::parse();
    let store_path = resolve_store_path(cli.store.as_deref());

    match cli.command {
        Command::List { all } => {
            let store = FileStateStore::load(&store_path);
            let scripts = if all {
                mapper::all_scripts(&store)
            } else {
                mapper::enabled_scripts(&store)
            };
            if scripts.is_empty() {
                println!("no scripts");
                return Ok(());
            }
            for script in scripts {
                println!(
                    "{}  {}  [{}]  {} pattern(s)",
                    script.id,
                    script.name,
                    if script.enabled { "on" } else { "off" },
                    script.metadata.matches.len()
                );
            }
        }
        Command::Count { url } => {
            let store = FileStateStore::load(&store_path);
            println!("{}", badge::count_for_url(&store, &url));
        }
        Command::Refresh => {
            let store = FileStateStore::load(&store_path);
            let fetcher = UreqFetcher::default();
            let summary = refresh::refresh_all_auto(&store, &fetcher);
            println!(
                "updated {} url plugin(s), {} subscription(s)",
                summary.url_plugins_changed, summary.subscriptions_changed
            );
        }
        Command::Parse { file } => {
            let code = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let parsed = metadata::parse_metadata(&code);
            println!("{}", serde_json::to_string_pretty(&parsed)?);
        }
    }
    Ok(())
}
