use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand, ValueEnum};
use maemul_adapters::ListingNumberStyle;
use maemul_core::{ProfileRow, PropertyRecord, ZeroRangePolicy};
use maemul_storage::{InventoryFile, MemoryInventory};
use maemul_sync::{CompositionMode, CustomerPropertyMatcher, EngineConfig, StartDateWindow, UnifiedViewPipeline};
use serde_json::Value as JsonValue;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "maemul")]
#[command(about = "Listing matching and unification tools")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the matcher service.
    Serve,
    /// Match properties against customer profiles and print the tagged rows.
    Match {
        #[arg(long)]
        properties: PathBuf,
        #[arg(long)]
        profiles: PathBuf,
        /// `exact` or `unbounded`; defaults to MAEMUL_ZERO_RANGE.
        #[arg(long)]
        zero_range: Option<String>,
        #[arg(long)]
        start_from: Option<NaiveDate>,
        #[arg(long)]
        start_to: Option<NaiveDate>,
    },
    /// Normalize and compose feed batches into the unified view.
    Unify {
        #[arg(long)]
        input: PathBuf,
        /// Comma-separated customer addresses; switches to multi-selection ordering.
        #[arg(long, value_delimiter = ',')]
        selected: Vec<String>,
        #[arg(long)]
        today: Option<NaiveDate>,
        #[arg(long, value_enum, default_value_t = StyleArg::Comma)]
        style: StyleArg,
        #[arg(long)]
        server_produced: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StyleArg {
    Comma,
    Slash,
}

impl From<StyleArg> for ListingNumberStyle {
    fn from(value: StyleArg) -> Self {
        match value {
            StyleArg::Comma => ListingNumberStyle::Comma,
            StyleArg::Slash => ListingNumberStyle::Slash,
        }
    }
}

fn init_tracing() {
    let filter = std::env::var("MAEMUL_LOG").unwrap_or_else(|_| "info".to_string());
    // stdout carries the JSON output
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::new(filter))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => maemul_web::serve_from_env().await?,
        Commands::Match {
            properties,
            profiles,
            zero_range,
            start_from,
            start_to,
        } => {
            let policy = match zero_range {
                Some(raw) => ZeroRangePolicy::parse(&raw).ok_or_else(|| anyhow!("unknown zero-range policy {raw}"))?,
                None => config.zero_range,
            };
            let properties: Vec<PropertyRecord> = read_json(&properties).await?;
            let profiles: Vec<ProfileRow> = read_json(&profiles).await?;
            let store = MemoryInventory::new(InventoryFile {
                properties,
                ..Default::default()
            });
            let rows = CustomerPropertyMatcher::new(policy)
                .match_from_store(&store, &profiles, &StartDateWindow::new(start_from, start_to))
                .await;
            print_json(&rows)?;
        }
        Commands::Unify {
            input,
            selected,
            today,
            style,
            server_produced,
        } => {
            let store = MemoryInventory::from_path(&input)
                .await
                .with_context(|| format!("loading feeds {}", input.display()))?;
            let today = today.unwrap_or_else(|| Local::now().date_naive());
            let options = config
                .normalize_options(today, style.into())
                .server_produced(server_produced);
            let mode = selection_mode(selected);
            let view = UnifiedViewPipeline::new(Arc::new(store), options, config.worker_concurrency)
                .run(&mode)
                .await;
            info!(rows = view.rows.len(), failed = view.failed_sources.len(), "unify complete");
            print_json(&view)?;
        }
    }

    Ok(())
}

fn selection_mode(selected: Vec<String>) -> CompositionMode {
    let addresses: Vec<String> = selected
        .into_iter()
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .collect();
    if addresses.is_empty() {
        CompositionMode::Default
    } else {
        CompositionMode::MultiSelection(addresses)
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let rendered: JsonValue = serde_json::to_value(value)?;
    println!("{}", serde_json::to_string_pretty(&rendered)?);
    Ok(())
}
