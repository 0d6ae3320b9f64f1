// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Parquet partition store: day-partitioned layout, atomic UPSERT writes,
//! and manifest-pruned range reads.

pub mod codec;
pub mod layout;
pub mod reader;
pub mod writer;

use core_types::FrameError;
use std::path::PathBuf;
use thiserror::Error;

pub use reader::PartitionReader;
pub use writer::{sha256_file, PartitionWriter, WriteResult};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("manifest error: {0}")]
    Manifest(#[from] manifest::ManifestError),
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("data integrity check failed: {0}")]
    DataIntegrity(String),
    #[error("corrupt partition could not be quarantined: {0}")]
    CorruptExisting(PathBuf),
}
