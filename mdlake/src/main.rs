// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! mdlake command line: each subcommand maps onto one core operation.

use clap::{Parser, Subcommand};
use core_types::config::LakeConfig;
use core_types::{DataKind, SeriesIdentity};
use ingest::csv::{CsvIngestor, DEFAULT_CHUNK_ROWS};
use ingest::features::FeatureStore;
use ingest::{IngestPipeline, IngestRequest};
use manifest::Manifest;
use rest_api::routes::data::{frame_rows, parse_time};
use rest_api::AppState;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use storage::{PartitionReader, PartitionWriter};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "mdlake", about = "Local market-data lake", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the data root and manifest database.
    Init,
    /// List active symbols on an exchange market.
    DownloadSymbols {
        exchange: String,
        #[arg(long, default_value = "spot")]
        market: String,
    },
    /// Download OHLCV (and optionally funding) history for one symbol.
    DownloadHistory {
        exchange: String,
        symbol: String,
        #[arg(long, default_value = "spot")]
        market: String,
        #[arg(long, default_value = "1m")]
        timeframe: String,
        /// Start timestamp (epoch ms, YYYY-MM-DD, or RFC 3339).
        #[arg(long)]
        start: Option<String>,
        /// Probe the listing date and download everything.
        #[arg(long)]
        full_history: bool,
        /// raw, funding, or both.
        #[arg(long, default_value = "raw")]
        data_type: String,
    },
    /// Ingest a local CSV file.
    Ingest {
        file: PathBuf,
        exchange: String,
        market: String,
        symbol: String,
        #[arg(long, default_value = "1m")]
        period: String,
        #[arg(long, default_value_t = DEFAULT_CHUNK_ROWS)]
        chunk_rows: usize,
    },
    /// Delete stored history for a symbol.
    Delete {
        exchange: String,
        market: String,
        symbol: String,
        #[arg(long)]
        data_type: Option<String>,
        #[arg(long)]
        period: Option<String>,
    },
    /// Range-read stored rows and print them as JSON lines.
    Read {
        exchange: String,
        symbol: String,
        start: String,
        end: String,
        #[arg(long, default_value = "spot")]
        market: String,
        #[arg(long, default_value = "raw")]
        data_type: String,
        #[arg(long)]
        period: Option<String>,
    },
    /// Register an externally computed feature file.
    UploadFeature {
        file: PathBuf,
        exchange: String,
        market: String,
        symbol: String,
        feature_set: String,
        #[arg(long, default_value = "1.0.0")]
        version: String,
    },
    /// Report catalog/filesystem discrepancies.
    Reconcile,
    /// Run the REST API server.
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
}

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Manifest(#[from] manifest::ManifestError),
    #[error(transparent)]
    Storage(#[from] storage::StorageError),
    #[error(transparent)]
    Connector(#[from] exchange_connector::ConnectorError),
    #[error(transparent)]
    Ingest(#[from] ingest::IngestError),
    #[error("{0}")]
    Api(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rest_api::ApiError> for AppError {
    fn from(err: rest_api::ApiError) -> Self {
        AppError::Api(err.to_string())
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    if let Err(err) = run().await {
        eprintln!("{err}");
        process::exit(1);
    }
}

struct Services {
    config: LakeConfig,
    manifest: Arc<Manifest>,
    writer: Arc<PartitionWriter>,
    reader: Arc<PartitionReader>,
}

fn services(config: LakeConfig) -> Result<Services, AppError> {
    let manifest = Arc::new(Manifest::open(&config.manifest_path())?);
    let writer = Arc::new(PartitionWriter::new(
        &config.data_root,
        config.compression,
        Arc::clone(&manifest),
    ));
    let reader = Arc::new(PartitionReader::new(
        &config.data_root,
        Arc::clone(&manifest),
    ));
    Ok(Services {
        config,
        manifest,
        writer,
        reader,
    })
}

async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let config = LakeConfig::load()?;

    match cli.command {
        Command::Init => {
            std::fs::create_dir_all(&config.data_root)?;
            Manifest::open(&config.manifest_path())?;
            println!(
                "initialized data root {} with manifest {}",
                config.data_root.display(),
                config.manifest_path().display()
            );
        }
        Command::DownloadSymbols { exchange, market } => {
            let connector = exchange_connector::connector_for(
                &exchange,
                Duration::from_secs(config.http_timeout_secs),
            )?;
            for symbol in connector.list_symbols(&market).await? {
                println!("{symbol}");
            }
        }
        Command::DownloadHistory {
            exchange,
            symbol,
            market,
            timeframe,
            start,
            full_history,
            data_type,
        } => {
            let services = services(config)?;
            let connector = Arc::new(exchange_connector::connector_for(
                &exchange,
                Duration::from_secs(services.config.http_timeout_secs),
            )?);
            let pipeline = IngestPipeline::new(
                connector,
                Arc::clone(&services.writer),
                Arc::clone(&services.reader),
                Arc::clone(&services.manifest),
                services.config.page_limit,
            );
            let identity = SeriesIdentity::new(&exchange, &market, &symbol);
            let start_ms = match start {
                Some(raw) => Some(parse_time(&raw)?),
                None => None,
            };
            let cancel = CancellationToken::new();
            let progress = |msg: &str| eprintln!("{msg}");

            if matches!(data_type.as_str(), "raw" | "both") {
                let stats = pipeline
                    .ingest(
                        &IngestRequest {
                            identity: identity.clone(),
                            kind: DataKind::Raw,
                            period: timeframe.clone(),
                            start: start_ms,
                            full_history,
                        },
                        &cancel,
                        &progress,
                    )
                    .await?;
                println!(
                    "raw: {} rows in {} batches ({} partition writes)",
                    stats.rows_written, stats.batches, stats.partitions
                );
            }
            if matches!(data_type.as_str(), "funding" | "both") {
                let stats = pipeline
                    .ingest(
                        &IngestRequest {
                            identity: identity.clone(),
                            kind: DataKind::Funding,
                            period: "funding".to_string(),
                            start: start_ms.or(Some(0)),
                            full_history: false,
                        },
                        &cancel,
                        &progress,
                    )
                    .await?;
                println!("funding: {} rows", stats.rows_written);
            }
        }
        Command::Ingest {
            file,
            exchange,
            market,
            symbol,
            period,
            chunk_rows,
        } => {
            let services = services(config)?;
            let identity = SeriesIdentity::new(&exchange, &market, &symbol);
            let ingestor = CsvIngestor::new(Arc::clone(&services.writer));
            let stats = ingestor.ingest(&file, &identity, &DataKind::Raw, &period, chunk_rows)?;
            println!(
                "ingested {} rows in {} chunks ({} partition writes)",
                stats.rows, stats.chunks, stats.partitions
            );
        }
        Command::Delete {
            exchange,
            market,
            symbol,
            data_type,
            period,
        } => {
            let services = services(config)?;
            let identity = SeriesIdentity::new(&exchange, &market, &symbol);
            let kind = data_type.as_deref().map(DataKind::from_str);
            let removed =
                services
                    .writer
                    .delete(&identity, kind.as_ref(), period.as_deref())?;
            println!("deleted {removed} partition(s)");
        }
        Command::Read {
            exchange,
            symbol,
            start,
            end,
            market,
            data_type,
            period,
        } => {
            let services = services(config)?;
            let identity = SeriesIdentity::new(&exchange, &market, &symbol);
            let frame = services.reader.read_concat(
                &identity,
                &data_type,
                period.as_deref(),
                parse_time(&start)?,
                parse_time(&end)?,
                None,
            )?;
            let (_, rows) = frame_rows(&frame);
            for row in rows {
                println!("{row}");
            }
        }
        Command::UploadFeature {
            file,
            exchange,
            market,
            symbol,
            feature_set,
            version,
        } => {
            let services = services(config)?;
            let store = FeatureStore::new(
                &services.config.data_root,
                Arc::clone(&services.manifest),
            );
            let identity = SeriesIdentity::new(&exchange, &market, &symbol);
            let entry = store.upload(&file, &identity, &feature_set, &version)?;
            println!("registered {} as entry {}", entry.path, entry.id);
        }
        Command::Reconcile => {
            let services = services(config)?;
            let report = services.manifest.reconcile(&services.config.data_root)?;
            println!("{}", serde_json::to_string_pretty(&report).expect("report serializes"));
        }
        Command::Serve { bind, port } => {
            let state = AppState::new(config)?;
            let addr = format!("{bind}:{port}")
                .parse()
                .map_err(|err| AppError::Api(format!("invalid bind address: {err}")))?;
            rest_api::serve(state, addr).await?;
        }
    }
    Ok(())
}
