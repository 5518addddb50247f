use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use sleuth_core::error::{Result, SleuthError};
use sleuth_core::types::{OwnerId, RunId, SketchId};

use crate::orchestrator::{RunOrchestrator, RunPayload, RunRequest};

/// Infrastructure-level status of a queued task, tracked beside the
/// domain-level RunRecord (dual bookkeeping).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed { error: String },
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }
}

/// In-process rendition of the distributed task queue: run submissions go
/// onto an mpsc channel and a fixed worker pool drains it, one run per
/// worker slot at a time.
pub struct TaskQueue {
    orchestrator: Arc<RunOrchestrator>,
    tx: mpsc::Sender<RunRequest>,
    statuses: Arc<RwLock<HashMap<RunId, TaskStatus>>>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl TaskQueue {
    /// Start the worker pool. Workers run until `cancel` fires or the
    /// queue is dropped.
    pub fn start(
        orchestrator: Arc<RunOrchestrator>,
        workers: usize,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<RunRequest>(64);
        let rx = Arc::new(Mutex::new(rx));
        let statuses: Arc<RwLock<HashMap<RunId, TaskStatus>>> =
            Arc::new(RwLock::new(HashMap::new()));

        let count = workers.max(1);
        let handles = (0..count)
            .map(|slot| {
                tokio::spawn(worker_loop(
                    slot,
                    orchestrator.clone(),
                    rx.clone(),
                    statuses.clone(),
                    cancel.clone(),
                ))
            })
            .collect();

        info!(workers = count, "Task queue started");
        Self {
            orchestrator,
            tx,
            statuses,
            workers: handles,
        }
    }

    /// Submit a run: creates the pending RunRecord, enqueues the request,
    /// and returns the run id for status polling.
    pub async fn submit(
        &self,
        sketch_id: SketchId,
        owner: Option<OwnerId>,
        payload: RunPayload,
        values: Vec<String>,
        params: Map<String, Value>,
        secret_refs: BTreeMap<String, String>,
    ) -> Result<RunId> {
        let record = self.orchestrator.prepare(&sketch_id)?;
        let run_id = record.id.clone();

        self.statuses
            .write()
            .await
            .insert(run_id.clone(), TaskStatus::Queued);

        let request = RunRequest {
            run_id: run_id.clone(),
            sketch_id,
            owner,
            payload,
            values,
            params,
            secret_refs,
        };
        self.tx
            .send(request)
            .await
            .map_err(|e| SleuthError::Queue(format!("submission channel closed: {}", e)))?;

        Ok(run_id)
    }

    /// Infra-level status for a submitted run.
    pub async fn status(&self, run_id: &RunId) -> Option<TaskStatus> {
        self.statuses.read().await.get(run_id).cloned()
    }

    /// Drop the submission side and wait for workers to drain and exit.
    pub async fn shutdown(self) {
        drop(self.tx);
        for handle in self.workers {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    slot: usize,
    orchestrator: Arc<RunOrchestrator>,
    rx: Arc<Mutex<mpsc::Receiver<RunRequest>>>,
    statuses: Arc<RwLock<HashMap<RunId, TaskStatus>>>,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = async { rx.lock().await.recv().await } => match request {
                Some(request) => request,
                None => break,
            },
        };

        statuses
            .write()
            .await
            .insert(request.run_id.clone(), TaskStatus::Running);

        match orchestrator.execute_run(&request).await {
            Ok(_) => {
                statuses
                    .write()
                    .await
                    .insert(request.run_id.clone(), TaskStatus::Succeeded);
            }
            Err(e) => {
                // The orchestrator already flipped the RunRecord to failed;
                // the re-raised error lands here so task status agrees
                error!(slot, run_id = %request.run_id, error = %e, "Run failed on worker");
                statuses.write().await.insert(
                    request.run_id.clone(),
                    TaskStatus::Failed {
                        error: e.to_string(),
                    },
                );
            }
        }
    }
    info!(slot, "Queue worker stopped");
}
