// Copyright (c) James Kassemi, SC, US. All rights reserved.

use crate::ApiError;
use core_types::config::LakeConfig;
use exchange_connector::{connector_for, Connector};
use ingest::features::FeatureStore;
use ingest::supervisor::TaskSupervisor;
use ingest::IngestPipeline;
use manifest::Manifest;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storage::{PartitionReader, PartitionWriter};

/// Shared services, one instance per data root.
pub struct AppState {
    pub config: LakeConfig,
    pub manifest: Arc<Manifest>,
    pub writer: Arc<PartitionWriter>,
    pub reader: Arc<PartitionReader>,
    pub supervisor: TaskSupervisor,
    pub features: FeatureStore,
    connectors: Mutex<HashMap<String, Arc<Connector>>>,
}

impl AppState {
    pub fn new(config: LakeConfig) -> Result<Arc<Self>, ApiError> {
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
        let supervisor = TaskSupervisor::new(config.workers);
        let features = FeatureStore::new(&config.data_root, Arc::clone(&manifest));
        Ok(Arc::new(Self {
            config,
            manifest,
            writer,
            reader,
            supervisor,
            features,
            connectors: Mutex::new(HashMap::new()),
        }))
    }

    /// Connectors are cached per exchange so the probe cache and HTTP pool
    /// are shared across tasks.
    pub fn connector(&self, exchange: &str) -> Result<Arc<Connector>, ApiError> {
        let key = exchange.to_lowercase();
        let mut connectors = self.connectors.lock().expect("connector cache poisoned");
        if let Some(connector) = connectors.get(&key) {
            return Ok(Arc::clone(connector));
        }
        let connector = Arc::new(connector_for(
            &key,
            Duration::from_secs(self.config.http_timeout_secs),
        )?);
        connectors.insert(key, Arc::clone(&connector));
        Ok(connector)
    }

    pub fn pipeline(&self, exchange: &str) -> Result<IngestPipeline, ApiError> {
        Ok(IngestPipeline::new(
            self.connector(exchange)?,
            Arc::clone(&self.writer),
            Arc::clone(&self.reader),
            Arc::clone(&self.manifest),
            self.config.page_limit,
        ))
    }
}
