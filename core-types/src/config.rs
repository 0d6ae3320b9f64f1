// Copyright (c) James Kassemi, SC, US. All rights reserved.

use config::{Config, ConfigError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Parquet compression codec used for partition files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionCodec {
    Snappy,
    Zstd,
}

impl Default for CompressionCodec {
    fn default() -> Self {
        CompressionCodec::Snappy
    }
}

/// Lake-wide configuration with key knobs for storage and ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LakeConfig {
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,
    #[serde(default)]
    pub compression: CompressionCodec,
    /// Bounded size of the ingest worker pool.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Per-request HTTP timeout for exchange calls, in seconds.
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    /// Records requested per exchange page; exchanges cap this themselves.
    #[serde(default = "default_page_limit")]
    pub page_limit: usize,
}

fn default_data_root() -> PathBuf {
    PathBuf::from("data")
}

fn default_export_dir() -> PathBuf {
    PathBuf::from("export")
}

fn default_workers() -> usize {
    4
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_page_limit() -> usize {
    1000
}

impl Default for LakeConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            export_dir: default_export_dir(),
            compression: CompressionCodec::default(),
            workers: default_workers(),
            http_timeout_secs: default_http_timeout_secs(),
            page_limit: default_page_limit(),
        }
    }
}

impl LakeConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(config::File::with_name("datalake.toml").required(false))
            .add_source(config::Environment::with_prefix("LAKE"))
            .build()?;
        settings.try_deserialize()
    }

    /// The SQLite manifest lives next to the data it indexes.
    pub fn manifest_path(&self) -> PathBuf {
        self.data_root.join("manifest.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = LakeConfig::default();
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.compression, CompressionCodec::Snappy);
        assert_eq!(cfg.manifest_path(), PathBuf::from("data/manifest.db"));
    }
}
