//! Tier 3 promotion tooling
//!
//! ## Usage
//!
//! ```bash
//! # Promote a candidate (JSON symbol entry on stdout)
//! polyform-storage ./catalog promote cand-42 --promotion-type user --notes "reviewed"
//!
//! # Demote with a justification payload
//! polyform-storage ./catalog demote cand-42 --justification '{"reason":"unstable"}'
//!
//! # Dump candidates, or promoted symbols
//! polyform-storage ./catalog show
//! polyform-storage ./catalog show --promoted
//! ```
//!
//! Logs go to stderr; set `RUST_LOG` to adjust.

use anyhow::Context;
use clap::{Parser, Subcommand};
use polyform_storage::config::default_config_path;
use polyform_storage::{EngineConfig, PromotionRequest, PromotionService, Tier3Catalog};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "polyform-storage")]
#[command(about = "Tier 3 promotion tooling")]
#[command(subcommand_required = true, arg_required_else_help = true)]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "POLYFORM_STORAGE_CONFIG")]
    config: Option<PathBuf>,

    /// Tier 3 catalog directory
    catalog: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Promote a candidate to Tier 3
    Promote {
        /// Candidate identifier
        candidate_id: String,

        /// Promotion origin (user/system)
        #[arg(long, default_value = "user")]
        promotion_type: String,

        /// Notes describing the promotion
        #[arg(long)]
        notes: Option<String>,

        /// Probation length in days
        #[arg(long)]
        probation_days: Option<i64>,

        /// JSON metadata payload
        #[arg(long)]
        metadata: Option<String>,
    },

    /// Demote a candidate
    Demote {
        /// Candidate identifier
        candidate_id: String,

        /// JSON justification payload
        #[arg(long)]
        justification: Option<String>,

        /// Notes describing the demotion
        #[arg(long)]
        notes: Option<String>,
    },

    /// Display catalog state
    Show {
        /// Show promoted entries instead of candidates
        #[arg(long)]
        promoted: bool,
    },
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("polyform_storage=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(output) => {
            println!("{}", output);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<String> {
    let config = load_config(args.config)?;
    let catalog = Tier3Catalog::open(&args.catalog, &config.catalog)
        .with_context(|| format!("opening catalog {}", args.catalog.display()))?;
    let service = PromotionService::new(catalog, config.promotion, config.catalog.telemetry_buffer_size);

    let output = match args.command {
        Commands::Promote {
            candidate_id,
            promotion_type,
            notes,
            probation_days,
            metadata,
        } => {
            let request = PromotionRequest {
                promotion_type,
                notes,
                metadata: parse_json_object(metadata.as_deref(), "--metadata")?,
                probation_days,
            };
            let symbol = service.promote(&candidate_id, request)?;
            serde_json::to_value(symbol)?
        }
        Commands::Demote {
            candidate_id,
            justification,
            notes,
        } => {
            let justification = parse_json_object(justification.as_deref(), "--justification")?;
            service.demote(&candidate_id, justification, notes)?;
            json!({ "status": "demoted", "candidate_id": candidate_id })
        }
        Commands::Show { promoted } => {
            if promoted {
                serde_json::to_value(service.promoted_symbols()?)?
            } else {
                serde_json::to_value(service.candidates(None)?)?
            }
        }
    };

    service.flush()?;
    Ok(serde_json::to_string_pretty(&output)?)
}

fn load_config(explicit: Option<PathBuf>) -> anyhow::Result<EngineConfig> {
    if let Some(path) = explicit {
        return EngineConfig::load(&path).with_context(|| format!("loading config {}", path.display()));
    }
    let fallback = default_config_path();
    if fallback.exists() {
        debug!(path = %fallback.display(), "Using default config file");
        return EngineConfig::load(&fallback)
            .with_context(|| format!("loading config {}", fallback.display()));
    }
    Ok(EngineConfig::default())
}

fn parse_json_object(raw: Option<&str>, flag: &str) -> anyhow::Result<Map<String, Value>> {
    let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
        return Ok(Map::new());
    };
    match serde_json::from_str::<Value>(raw).with_context(|| format!("invalid JSON for {}", flag))? {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("{} must be a JSON object, got {}", flag, other),
    }
}
