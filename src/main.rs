//! nftsync - declarative nftables blocklist
//!
//! Blocks TCP traffic from listed IPv4 and IPv6 addresses to listed ports.
//! Addresses and ports live in two list files (one entry per line, `#`
//! comments allowed) that are re-read every refresh interval.
//!
//! # Usage
//!
//! ```bash
//! nftsync init-config              # Write the default configuration
//! nftsync oneshot                  # Install table, chain, sets and rules once
//! nftsync manage                   # Install, then keep the sets in sync
//! nftsync status                   # Print set membership and rule counters
//! nftsync --config ./nftsync.json manage
//! ```
//!
//! Set `NFTSYNC_NFT_COMMAND` to run something other than `nft`, and
//! `NFTSYNC_ELEVATION_METHOD` (sudo, run0, pkexec) or `NFTSYNC_NO_ELEVATION`
//! to control privilege escalation.

use clap::{Parser, Subcommand};
use nftsync::blocklist::Blocklist;
use nftsync::config::{self, AppConfig};
use nftsync::core::error::NftablesErrorPattern;
use nftsync::telemetry::init_logging;
use nftsync::{Error, NftConn, Result};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::sync::watch;
use tracing::info;

#[derive(Parser)]
#[command(name = "nftsync", version)]
#[command(about = "Keeps nftables blocklist sets and rules in sync with list files", long_about = None)]
struct Cli {
    /// Config file [default: ~/.config/nftsync/config.json]
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the table, chain, sets and rules, fill the sets, then exit
    Oneshot,
    /// Like oneshot, then keep everything in sync until SIGINT or SIGTERM
    Manage,
    /// Print set membership and rule counters
    Status,
    /// Write the default configuration
    InitConfig {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(handle_cli(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}

fn report(e: &Error) {
    eprintln!("Error: {e}");
    if let Error::Nftables {
        stderr: Some(stderr),
        ..
    } = e
        && let Some(hint) = NftablesErrorPattern::hint(stderr)
    {
        eprintln!("Hint: {hint}");
    }
}

async fn load(path: Option<&Path>) -> Result<(AppConfig, Blocklist)> {
    let config = config::load_config(path).await?;
    init_logging(&config.logging);
    let blocklist = Blocklist::new(&config);
    Ok((config, blocklist))
}

async fn handle_cli(cli: Cli) -> Result<()> {
    let path = cli.config.as_deref();
    match cli.command {
        Commands::Oneshot => {
            let (_, blocklist) = load(path).await?;
            let mut conn = NftConn::connect().await?;
            blocklist.install(&mut conn).await?;
            println!("✓ Blocklist installed in table {}", blocklist.table());
        }
        Commands::Manage => {
            let (config, blocklist) = load(path).await?;
            let mut conn = NftConn::connect().await?;
            let sets = blocklist.install(&mut conn).await?;
            let managers = blocklist.managers(sets, || conn.fork())?;

            info!(
                "Managing {} every {:?}",
                blocklist.table(),
                config.refresh_interval()
            );
            // Managers stop on SIGINT/SIGTERM; the sender only has to outlive them
            let (_shutdown, rx) = watch::channel(false);
            managers.run(rx).await?;
        }
        Commands::Status => {
            let (_, blocklist) = load(path).await?;
            let mut conn = NftConn::connect().await?;
            for set in blocklist.attach_sets()? {
                println!("set {}", set.spec());
                for counted in set.get_counted_set_data(&mut conn).await? {
                    let counter = counted.counter.unwrap_or_default();
                    println!(
                        "  {:<40} {:>12} bytes {:>10} packets",
                        counted.data.to_string(),
                        counter.bytes,
                        counter.packets
                    );
                }
            }
            let target = blocklist.rule_target();
            println!("chain {}/{}", blocklist.table(), target.chain());
            for usage in target.get_rule_usage_counters(&mut conn).await? {
                println!(
                    "  rule {:<10} {:<6} {:>12} bytes {:>10} packets",
                    usage.id.to_string(),
                    usage.verdict.to_string(),
                    usage.bytes,
                    usage.packets
                );
            }
        }
        Commands::InitConfig { force } => init_config(path, force).await?,
    }
    Ok(())
}

async fn init_config(path: Option<&Path>, force: bool) -> Result<()> {
    let path = path
        .map(Path::to_path_buf)
        .or_else(config::default_config_path)
        .ok_or_else(|| Error::validation("config", "no config directory available"))?;
    if !force && tokio::fs::try_exists(&path).await? {
        return Err(Error::validation(
            "config",
            format!("{} already exists (use --force to overwrite)", path.display()),
        ));
    }
    config::save_config(&AppConfig::default(), &path).await?;
    println!("✓ Wrote {}", path.display());
    Ok(())
}
