// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Ingestion: the incremental download pipeline, the CSV ingestor, the
//! task supervisor, and the feature store.

pub mod csv;
pub mod features;
pub mod pipeline;
pub mod supervisor;

use core_types::FrameError;
use exchange_connector::ConnectorError;
use manifest::ManifestError;
use storage::StorageError;
use thiserror::Error;

pub use pipeline::{IngestPipeline, IngestRequest, IngestStats, IntegrityReport};
pub use supervisor::{TaskHandle, TaskSupervisor};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("start timestamp required: no prior data for this series")]
    MissingStart,
    #[error("no data available for this symbol")]
    NoData,
    #[error("cancelled")]
    Cancelled,
    #[error("task already running: {0}")]
    AlreadyRunning(String),
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("csv error: {0}")]
    Csv(#[from] ::csv::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
