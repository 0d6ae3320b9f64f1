// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Process-wide registry of in-flight ingestion tasks.
//!
//! At most one active task per `exchange:market:symbol:data_type` key.
//! Execution is bounded by a fair semaphore, so enqueued jobs start in
//! FIFO order up to the worker limit. The registry mutex is never held
//! across I/O; jobs talk to it through a [`TaskHandle`].

use crate::IngestError;
use chrono::Utc;
use core_types::task::{TaskState, TaskStatus};
use core_types::SeriesIdentity;
use log::{error, info};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct TaskSupervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    registry: Mutex<HashMap<String, TaskState>>,
    cancels: Mutex<HashMap<String, CancellationToken>>,
    workers: Arc<Semaphore>,
}

/// A job's write handle onto its own registry entry.
#[derive(Clone)]
pub struct TaskHandle {
    key: String,
    inner: Arc<SupervisorInner>,
}

impl TaskHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn set_message(&self, message: &str) {
        self.inner.update(&self.key, |state| {
            state.message = message.to_string();
        });
    }
}

impl SupervisorInner {
    fn update(&self, key: &str, mutate: impl FnOnce(&mut TaskState)) {
        let mut registry = self.registry.lock().expect("task registry poisoned");
        if let Some(state) = registry.get_mut(key) {
            mutate(state);
            state.last_update = Utc::now();
        }
    }
}

impl TaskSupervisor {
    pub fn new(workers: usize) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                registry: Mutex::new(HashMap::new()),
                cancels: Mutex::new(HashMap::new()),
                workers: Arc::new(Semaphore::new(workers.max(1))),
            }),
        }
    }

    /// Register and schedule a job. Rejects with `AlreadyRunning` while a
    /// task with the same key is pending or running; finished tasks are
    /// replaced. The job receives its handle plus a cancellation token and
    /// reports a final status line on success.
    pub fn enqueue<F, Fut>(
        &self,
        identity: &SeriesIdentity,
        data_type: &str,
        job: F,
    ) -> Result<String, IngestError>
    where
        F: FnOnce(TaskHandle, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<String, IngestError>> + Send + 'static,
    {
        let key = identity.task_key(data_type);
        {
            let mut registry = self.inner.registry.lock().expect("task registry poisoned");
            if let Some(existing) = registry.get(&key) {
                if existing.status.is_active() {
                    return Err(IngestError::AlreadyRunning(key));
                }
            }
            registry.insert(
                key.clone(),
                TaskState::pending(
                    key.clone(),
                    identity.exchange.clone(),
                    identity.market.clone(),
                    identity.symbol.clone(),
                    data_type.to_string(),
                ),
            );
        }

        let cancel = CancellationToken::new();
        self.inner
            .cancels
            .lock()
            .expect("cancel map poisoned")
            .insert(key.clone(), cancel.clone());

        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        tokio::spawn(async move {
            let permit = inner
                .workers
                .clone()
                .acquire_owned()
                .await
                .expect("worker semaphore closed");
            if cancel.is_cancelled() {
                inner.update(&task_key, |state| {
                    state.status = TaskStatus::Failed;
                    state.message = "cancelled".to_string();
                });
                return;
            }
            inner.update(&task_key, |state| {
                state.status = TaskStatus::Running;
                state.message = "started".to_string();
            });
            info!("task {} running", task_key);

            let handle = TaskHandle {
                key: task_key.clone(),
                inner: Arc::clone(&inner),
            };
            let outcome = job(handle, cancel.clone()).await;
            drop(permit);

            match outcome {
                Ok(message) => {
                    info!("task {} completed: {}", task_key, message);
                    inner.update(&task_key, |state| {
                        state.status = TaskStatus::Completed;
                        state.message = message;
                    });
                }
                Err(err) => {
                    error!("task {} failed: {}", task_key, err);
                    inner.update(&task_key, |state| {
                        state.status = TaskStatus::Failed;
                        state.message = err.to_string();
                    });
                }
            }
            inner
                .cancels
                .lock()
                .expect("cancel map poisoned")
                .remove(&task_key);
        });

        Ok(key)
    }

    /// Snapshot copy of every known task.
    pub fn status(&self) -> HashMap<String, TaskState> {
        self.inner
            .registry
            .lock()
            .expect("task registry poisoned")
            .clone()
    }

    /// Trip a task's cancellation token. The job observes it at the next
    /// safe point (between batches); an in-flight partition write finishes
    /// atomically first.
    pub fn cancel(&self, key: &str) -> bool {
        let cancels = self.inner.cancels.lock().expect("cancel map poisoned");
        match cancels.get(key) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop completed/failed entries; active tasks stay.
    pub fn clear_finished(&self) -> usize {
        let mut registry = self.inner.registry.lock().expect("task registry poisoned");
        let before = registry.len();
        registry.retain(|_, state| state.status.is_active());
        before - registry.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn identity() -> SeriesIdentity {
        SeriesIdentity::new("binance", "spot", "BTCUSDT")
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn duplicate_active_key_is_rejected() {
        let supervisor = TaskSupervisor::new(2);
        let identity = identity();
        supervisor
            .enqueue(&identity, "raw", |_, cancel| async move {
                cancel.cancelled().await;
                Err(IngestError::Cancelled)
            })
            .unwrap();

        let err = supervisor
            .enqueue(&identity, "raw", |_, _| async { Ok("done".to_string()) })
            .unwrap_err();
        assert!(matches!(err, IngestError::AlreadyRunning(_)));

        // A different data type is a different key.
        supervisor
            .enqueue(&identity, "funding", |_, _| async {
                Ok("done".to_string())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn completed_task_reports_and_frees_the_key() {
        let supervisor = TaskSupervisor::new(2);
        let identity = identity();
        let key = supervisor
            .enqueue(&identity, "raw", |handle, _| async move {
                handle.set_message("Fetched 10 rows");
                Ok("Finished".to_string())
            })
            .unwrap();

        let sup = supervisor.clone();
        let key2 = key.clone();
        wait_for(move || {
            sup.status()
                .get(&key2)
                .is_some_and(|s| s.status == TaskStatus::Completed)
        })
        .await;

        let state = supervisor.status().remove(&key).unwrap();
        assert_eq!(state.message, "Finished");

        // Finished key can be reused.
        supervisor
            .enqueue(&identity, "raw", |_, _| async { Ok("again".to_string()) })
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_marks_failed_with_cancelled_message() {
        let supervisor = TaskSupervisor::new(1);
        let identity = identity();
        let key = supervisor
            .enqueue(&identity, "raw", |_, cancel| async move {
                // Cooperative loop: observe the token between "batches".
                loop {
                    if cancel.is_cancelled() {
                        return Err(IngestError::Cancelled);
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            })
            .unwrap();

        let sup = supervisor.clone();
        let running_key = key.clone();
        wait_for(move || {
            sup.status()
                .get(&running_key)
                .is_some_and(|s| s.status == TaskStatus::Running)
        })
        .await;

        assert!(supervisor.cancel(&key));
        let sup = supervisor.clone();
        let done_key = key.clone();
        wait_for(move || {
            sup.status()
                .get(&done_key)
                .is_some_and(|s| s.status == TaskStatus::Failed)
        })
        .await;
        assert_eq!(supervisor.status()[&key].message, "cancelled");

        assert_eq!(supervisor.clear_finished(), 1);
        assert!(supervisor.status().is_empty());
    }

    #[tokio::test]
    async fn worker_pool_bounds_concurrency() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let supervisor = TaskSupervisor::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..6 {
            let identity = SeriesIdentity::new("binance", "spot", &format!("SYM{i}"));
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            supervisor
                .enqueue(&identity, "raw", move |_, _| async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok("done".to_string())
                })
                .unwrap();
        }

        let sup = supervisor.clone();
        wait_for(move || {
            sup.status()
                .values()
                .all(|s| s.status == TaskStatus::Completed)
        })
        .await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
