//! DSvn working-copy CLI

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use dsvn_core::Depth;
use dsvn_wc::{CancelToken, CommitPacket, HarvestOptions, StateFlags, WorkingCopy, harvest};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dsvn")]
#[command(author = "DSvn Contributors")]
#[command(version = "0.1.0")]
#[command(about = "DSvn working copy tool", long_about = None)]
struct Cli {
    /// Working copy to operate on (default: the one containing the current directory)
    #[arg(long, global = true)]
    wc: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show what a commit of TARGETS would send
    Status {
        targets: Vec<PathBuf>,

        /// empty, files, immediates or infinity
        #[arg(long, default_value = "infinity")]
        depth: Depth,

        /// Only consider nodes in this changelist (repeatable)
        #[arg(long = "changelist")]
        changelists: Vec<String>,

        /// Also list unmodified nodes holding a lock
        #[arg(long)]
        just_locked: bool,
    },

    /// Finish interrupted work and release a stale lock
    Cleanup,

    /// Show or change the commit configuration
    Config {
        #[arg(long)]
        keep_locks: Option<bool>,
        #[arg(long)]
        keep_changelists: Option<bool>,
        #[arg(long)]
        delta_window_size: Option<usize>,
        #[arg(long)]
        run_hooks: Option<bool>,
        /// Log message used for empty messages; pass "" to clear
        #[arg(long)]
        default_log_message: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("dsvn=info"))
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let cwd = std::env::current_dir().context("Failed to read the current directory")?;
    let start = match &cli.wc {
        Some(path) => absolute(&cwd, path),
        None => cwd.clone(),
    };
    let root = WorkingCopy::find_root(&start)
        .ok_or_else(|| anyhow!("'{}' is not inside a working copy", start.display()))?;
    let mut wc = WorkingCopy::open(&root)
        .with_context(|| format!("Failed to open working copy at {}", root.display()))?;

    match cli.command {
        Commands::Status {
            targets,
            depth,
            changelists,
            just_locked,
        } => {
            let targets = targets
                .iter()
                .map(|t| wc.relpath_of(&absolute(&cwd, t)))
                .collect::<dsvn_wc::Result<Vec<_>>>()?;
            let opts = HarvestOptions {
                depth,
                changelists,
                just_locked,
            };
            let mut packet = harvest(&wc, &targets, &opts, &CancelToken::new())?;
            print!("{}", render_status(&packet));
            packet.dispose()?;
        }

        Commands::Cleanup => {
            let report = wc.cleanup(&CancelToken::new())?;
            if report.broke_lock {
                println!("Released stale lock");
            }
            println!(
                "Ran {} queued work items, removed {} temporary files",
                report.work_items, report.tmp_files
            );
        }

        Commands::Config {
            keep_locks,
            keep_changelists,
            delta_window_size,
            run_hooks,
            default_log_message,
        } => {
            let mut config = wc.config().clone();
            let before = config.clone();
            if let Some(v) = keep_locks {
                config.keep_locks = v;
            }
            if let Some(v) = keep_changelists {
                config.keep_changelists = v;
            }
            if let Some(v) = delta_window_size {
                if v == 0 {
                    return Err(anyhow!("delta window size must be positive"));
                }
                config.delta_window_size = v;
            }
            if let Some(v) = run_hooks {
                config.run_hooks = v;
            }
            if let Some(v) = default_log_message {
                config.default_log_message = Some(v).filter(|m| !m.is_empty());
            }
            if config != before {
                wc.set_config(config)?;
                info!("Updated configuration of {}", root.display());
            }
            println!("{}", serde_json::to_string_pretty(wc.config())?);
        }
    }

    Ok(())
}

/// `path` made absolute against `cwd`, with symlinks of existing parts resolved
fn absolute(cwd: &Path, path: &Path) -> PathBuf {
    let joined = cwd.join(path);
    if let Ok(canonical) = joined.canonicalize() {
        return canonical;
    }
    // Missing nodes (scheduled deletions) resolve through their parent
    let resolved = match (joined.parent(), joined.file_name()) {
        (Some(parent), Some(name)) => parent.canonicalize().ok().map(|p| p.join(name)),
        _ => None,
    };
    resolved.unwrap_or(joined)
}

fn render_status(packet: &CommitPacket) -> String {
    let mut out = String::new();
    for item in packet.sorted_items() {
        let props = if item.flags.contains(StateFlags::PROPS_MODIFIED) && !item.is_add() {
            'M'
        } else {
            ' '
        };
        let copied = if item.is_copy() { '+' } else { ' ' };
        let locked = if item.flags.contains(StateFlags::LOCK_TOKEN) { 'K' } else { ' ' };
        let path = if item.local_relpath.is_empty() { "." } else { item.local_relpath.as_str() };
        out.push_str(&format!(
            "{}{}{}{} {}\n",
            item.flags.status_char(),
            props,
            copied,
            locked,
            path
        ));
    }
    if !packet.lock_tokens().is_empty() {
        out.push_str("Lock tokens:\n");
        for (url, token) in packet.lock_tokens() {
            out.push_str(&format!("  {} {}\n", url, token));
        }
    }
    out
}
