use crate::errors::AppError;
use crate::flow::FlowEngine;
use crate::models::FlowRequest;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Progress snapshot of the current (or last) batch run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatus {
    pub running: bool,
    pub paused: bool,
    pub total: usize,
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Runs the flow for every opportunity of one CRM pipeline, capping
/// concurrent per-CPF pipelines at a fixed fan-out and honoring a
/// cooperative pause flag: the flag is checked before dispatching each new
/// unit of work, in-flight units always finish.
pub struct BatchRunner {
    engine: Arc<FlowEngine>,
    fan_out: usize,
    running: AtomicBool,
    paused: AtomicBool,
    total: AtomicUsize,
    dispatched: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
}

impl BatchRunner {
    pub fn new(engine: Arc<FlowEngine>, fan_out: usize) -> Arc<Self> {
        Arc::new(Self {
            engine,
            fan_out: fan_out.max(1),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            total: AtomicUsize::new(0),
            dispatched: AtomicUsize::new(0),
            succeeded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        })
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        tracing::info!("Batch run paused - in-flight flows will finish");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        tracing::info!("Batch run resumed");
    }

    pub fn status(&self) -> BatchStatus {
        BatchStatus {
            running: self.running.load(Ordering::SeqCst),
            paused: self.paused.load(Ordering::SeqCst),
            total: self.total.load(Ordering::SeqCst),
            dispatched: self.dispatched.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }

    /// Starts a batch over one pipeline. Returns the number of CPFs queued;
    /// only one batch may run at a time.
    pub async fn start(self: &Arc<Self>, pipeline_id: i64) -> Result<usize, AppError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AppError::BadRequest(
                "A batch run is already in progress".to_string(),
            ));
        }

        let opportunities = match self.engine.crm().list_pipeline(pipeline_id).await {
            Ok(list) => list,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let cpfs: Vec<String> = opportunities
            .into_iter()
            .filter_map(|o| o.mainmail)
            .filter(|cpf| cpf.len() == 11 && cpf.chars().all(|c| c.is_ascii_digit()))
            .collect();

        self.total.store(cpfs.len(), Ordering::SeqCst);
        self.dispatched.store(0, Ordering::SeqCst);
        self.succeeded.store(0, Ordering::SeqCst);
        self.failed.store(0, Ordering::SeqCst);

        tracing::info!(
            "Batch over pipeline {} started: {} CPFs, fan-out {}",
            pipeline_id,
            cpfs.len(),
            self.fan_out
        );

        let runner = Arc::clone(self);
        let queued = cpfs.len();
        tokio::spawn(async move {
            runner.drive(cpfs).await;
        });

        Ok(queued)
    }

    async fn drive(self: Arc<Self>, cpfs: Vec<String>) {
        let semaphore = Arc::new(Semaphore::new(self.fan_out));

        for cpf in cpfs {
            // Cooperative pause: checked before every dispatch and between
            // waits; running flows are never interrupted.
            while self.paused.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            self.dispatched.fetch_add(1, Ordering::SeqCst);

            let runner = Arc::clone(&self);
            tokio::spawn(async move {
                let report = runner
                    .engine
                    .execute(FlowRequest {
                        cpf: cpf.clone(),
                        ..Default::default()
                    })
                    .await;
                if report.success {
                    runner.succeeded.fetch_add(1, Ordering::SeqCst);
                } else {
                    runner.failed.fetch_add(1, Ordering::SeqCst);
                    tracing::info!(
                        "[{}] Batch flow finished without success: {:?}",
                        cpf,
                        report.failure_reason
                    );
                }
                drop(permit);
            });
        }

        // Wait for the in-flight tail before reporting the run finished.
        let _ = semaphore.acquire_many(self.fan_out as u32).await;
        self.running.store(false, Ordering::SeqCst);
        tracing::info!(
            "Batch run finished: {} succeeded, {} failed of {}",
            self.succeeded.load(Ordering::SeqCst),
            self.failed.load(Ordering::SeqCst),
            self.total.load(Ordering::SeqCst)
        );
    }
}
