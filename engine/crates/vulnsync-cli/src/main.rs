//! vulnsync - vulnerability feed sync and image exposure comparison
//!
//! Operator entry point for the `VulnService` facade.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::{info, warn};
use vulnsync_cli::VulnService;
use vulnsync_common::logging::{init_logging_with_config, LogConfig, LogFormat};
use vulnsync_common::Config;
use vulnsync_diff::ComparisonResult;

/// vulnsync operator CLI
#[derive(Parser, Debug)]
#[command(name = "vulnsync")]
#[command(version)]
#[command(about = "Vulnerability feed synchronization and image exposure diffs", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/vulnsync/vulnsync.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides config
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (pretty, json, compact); overrides config
    #[arg(long)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Synchronize one feed
    Sync {
        /// Feed to synchronize (nvd, osv)
        #[arg(long)]
        feed: String,

        /// full or recent
        #[arg(long, default_value = "recent")]
        mode: String,
    },
    /// Show stored sync state per partition
    Status,
    /// Compare the exposure of two versions of an image
    Compare {
        #[arg(long)]
        team: String,
        #[arg(long)]
        product: String,
        #[arg(long)]
        image: String,
        #[arg(long)]
        version_a: String,
        #[arg(long)]
        version_b: String,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    /// Load scanner bindings from a JSON array file
    ImportBindings {
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Json,
    Table,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = if args.config.exists() {
        Config::from_file(&args.config)?
    } else {
        Config::default()
    };
    let config = config.merge_env();
    config.validate()?;

    let mut log_config = LogConfig::from(&config.logging);
    if let Some(level) = &args.log_level {
        log_config = log_config.level(level.clone());
    }
    if let Some(format) = &args.log_format {
        log_config = log_config.format(LogFormat::from_name(format));
    }
    init_logging_with_config(log_config)?;

    if !args.config.exists() {
        info!(path = %args.config.display(), "Config file not found, using defaults");
    }

    let service = VulnService::open(config).context("Failed to open database")?;

    let cancel = service.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            cancel.cancel();
        }
    });

    match args.command {
        Command::Sync { feed, mode } => {
            info!(feed = %feed, mode = %mode, "vulnsync {}", env!("CARGO_PKG_VERSION"));
            let report = service.run_sync(&feed, &mode).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Status => {
            let states = service.status()?;
            if states.is_empty() {
                println!("No partitions synchronized yet");
            }
            for state in states {
                println!(
                    "{:<8} {:<32} {}",
                    state.partition.key(),
                    state.last_modified.to_rfc3339(),
                    state.checksum
                );
            }
        }
        Command::Compare {
            team,
            product,
            image,
            version_a,
            version_b,
            format,
        } => {
            let result = service.compare(&team, &product, &image, &version_a, &version_b)?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
                OutputFormat::Table => print_table(&result),
            }
        }
        Command::ImportBindings { file } => {
            let report = service.import_bindings(&file).await?;
            println!("Imported {} binding(s)", report.committed);
        }
    }

    Ok(())
}

fn print_table(result: &ComparisonResult) {
    println!(
        "{} {} -> {}: {} shared, {} only in {}, {} only in {}",
        result.image_name,
        result.version_a,
        result.version_b,
        result.stats.shared,
        result.stats.only_version_a,
        result.version_a,
        result.stats.only_version_b,
        result.version_b,
    );
    println!();
    println!(
        "{:<18} {:<28} {:<12} {:<16} {:>5} {:<9}",
        "CVE", "COMPONENT", "TYPE", "CLASS", "SCORE", "SEVERITY"
    );
    for row in &result.rows {
        let score = row
            .cvss
            .as_ref()
            .and_then(|m| m.base_score)
            .map(|s| format!("{:.1}", s))
            .unwrap_or_else(|| String::from("-"));
        println!(
            "{:<18} {:<28} {:<12} {:<16} {:>5} {:<9}",
            row.cve_id,
            row.component,
            row.component_type,
            row.classification.as_str(),
            score,
            row.severity.as_str()
        );
    }
}
