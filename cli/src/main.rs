use std::fs;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chunklog_kernel::log::{Recorder, AUTO_INDEX};
use chunklog_kernel::{ChunkStore, InMemoryBackend, RawStore, ScanDirection, StoreConfig, StoreError};

/// Chunklog CLI
#[derive(Parser, Debug)]
#[command(name = "chunklog")]
#[command(about = "Load chunks into an in-memory log and scan them", long_about = None)]
struct Cli {
    /// Path to store config JSON
    #[arg(long)]
    config: Option<String>,

    /// Path to chunk records JSON
    #[arg(long)]
    input: String,

    /// Scan this partition instead of the whole store
    #[arg(long)]
    partition: Option<String>,

    /// Scan from the end
    #[arg(long)]
    backward: bool,

    /// Maximum number of chunks to print
    #[arg(long)]
    limit: Option<usize>,
}

/// One chunk to persist.
#[derive(Debug, Deserialize)]
struct ChunkRecord {
    partition_id: String,
    #[serde(default = "auto_index")]
    index: i64,
    payload: serde_json::Value,
    #[serde(default)]
    operation_id: Option<String>,
}

fn auto_index() -> i64 {
    AUTO_INDEX
}

/// Wrapper for JSON output
#[derive(Debug, Serialize)]
struct ChunkView {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    partition_id: Option<String>,
    index: i64,
    payload: Option<serde_json::Value>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "chunklog=info,chunklog_kernel=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();

    // ----------------------------
    // Open store
    // ----------------------------
    let config = match &cli.config {
        Some(path) => StoreConfig::from_json(&fs::read_to_string(path)?)?,
        None => StoreConfig::new("memory://chunklog").with_local_sequence(),
    };
    let backend = Arc::new(InMemoryBackend::<serde_json::Value>::new());
    let store = ChunkStore::new(backend, config)?;
    store.init(&cancel).await?;

    // ----------------------------
    // Load chunk records
    // ----------------------------
    let input = fs::read_to_string(&cli.input)?;
    let records: Vec<ChunkRecord> = serde_json::from_str(&input)?;

    for record in records {
        match store
            .persist(
                &record.partition_id,
                record.index,
                record.payload,
                record.operation_id,
                &cancel,
            )
            .await
        {
            Ok(id) => tracing::debug!(id, partition_id = %record.partition_id, "chunk stored"),
            Err(StoreError::DuplicateIndex { partition_id, index }) => {
                tracing::warn!(%partition_id, index, "skipping chunk, index already taken")
            }
            Err(err) => return Err(err.into()),
        }
    }

    // ----------------------------
    // Scan
    // ----------------------------
    let direction = if cli.backward {
        ScanDirection::Backward
    } else {
        ScanDirection::Forward
    };
    let mut recorder = Recorder::<serde_json::Value>::new();

    match &cli.partition {
        Some(partition_id) => {
            let (from, to) = (0, i64::MAX);
            store
                .scan_partition(partition_id, from, to, direction, cli.limit, &mut recorder, &cancel)
                .await?
        }
        None => {
            let start = match direction {
                ScanDirection::Forward => 0,
                ScanDirection::Backward => i64::MAX,
            };
            store
                .scan_store(start, direction, cli.limit, &mut recorder, &cancel)
                .await?
        }
    }

    // ----------------------------
    // Output
    // ----------------------------
    let output: Vec<ChunkView> = recorder
        .entries()
        .iter()
        .map(|entry| ChunkView {
            id: entry.id,
            partition_id: entry.partition_id.clone(),
            index: entry.index,
            payload: entry.payload.clone(),
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
