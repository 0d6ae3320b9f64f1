// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Task state exposed by the ingest supervisor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Whether a task with this status still occupies its registry key.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

/// Snapshot of one ingestion task. Created on enqueue, retained after the
/// task finishes until explicitly cleared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub key: String,
    pub status: TaskStatus,
    pub exchange: String,
    pub market: String,
    pub symbol: String,
    pub data_type: String,
    pub message: String,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl TaskState {
    pub fn pending(
        key: String,
        exchange: String,
        market: String,
        symbol: String,
        data_type: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            key,
            status: TaskStatus::Pending,
            exchange,
            market,
            symbol,
            data_type,
            message: "queued".to_string(),
            start_time: now,
            last_update: now,
        }
    }
}
