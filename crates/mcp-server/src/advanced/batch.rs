//! Batch execution of JSON-RPC requests over the router.
//!
//! Parallel batches fan out on a [`JoinSet`] bounded by a semaphore;
//! sequential batches run in order. At most one batch per id is in
//! flight, and [`BatchProcessor::cancel_batch`] tears a running batch
//! down and waits for its sub-tasks to finish unwinding.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::codec::request_from_value;
use crate::protocol::{ErrorCode, McpError, Request, Response, Router};

pub const DEFAULT_BATCH_CONCURRENCY: usize = 32;

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub id: String,
    pub requests: Vec<Request>,
    pub parallel: bool,
    pub max_concurrent: Option<usize>,
    pub timeout: Option<Duration>,
    pub continue_on_error: bool,
}

impl BatchRequest {
    pub fn new(id: impl Into<String>, requests: Vec<Request>) -> Self {
        Self {
            id: id.into(),
            requests,
            parallel: true,
            max_concurrent: None,
            timeout: None,
            continue_on_error: false,
        }
    }

    /// Run requests one at a time in order
    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = Some(max);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    /// Build from `batch/submit` params. Each request is validated as a
    /// full envelope; the id is generated when absent.
    pub fn from_value(value: Value) -> Result<Self, McpError> {
        let raw: RawBatch = serde_json::from_value(value)
            .map_err(|e| McpError::invalid_params(e.to_string()))?;

        if raw.requests.is_empty() {
            return Err(McpError::invalid_params("Batch contains no requests"));
        }
        let requests = raw
            .requests
            .into_iter()
            .map(|r| request_from_value(r).map_err(|e| McpError::invalid_params(e.message)))
            .collect::<Result<Vec<_>, _>>()?;

        let timeout = match raw.timeout {
            Some(secs) if secs > 0.0 => Some(
                Duration::try_from_secs_f64(secs)
                    .map_err(|e| McpError::invalid_params(format!("Invalid timeout: {}", e)))?,
            ),
            Some(_) => return Err(McpError::invalid_params("timeout must be a positive number")),
            None => None,
        };

        Ok(Self {
            id: raw.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            requests,
            parallel: raw.parallel,
            max_concurrent: raw.max_concurrent,
            timeout,
            continue_on_error: raw.continue_on_error,
        })
    }
}

fn default_parallel() -> bool {
    true
}

#[derive(Deserialize)]
struct RawBatch {
    #[serde(default)]
    id: Option<String>,
    requests: Vec<Value>,
    #[serde(default = "default_parallel")]
    parallel: bool,
    #[serde(default)]
    max_concurrent: Option<usize>,
    /// Seconds
    #[serde(default)]
    timeout: Option<f64>,
    #[serde(default)]
    continue_on_error: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResponse {
    pub id: String,
    pub responses: Vec<Response>,
    /// Seconds
    pub duration: f64,
    pub completed: usize,
    pub failed: usize,
}

impl BatchResponse {
    fn new(id: String, responses: Vec<Response>, started: Instant) -> Self {
        let failed = responses.iter().filter(|r| r.is_error()).count();
        Self {
            id,
            completed: responses.len() - failed,
            failed,
            responses,
            duration: started.elapsed().as_secs_f64(),
        }
    }
}

struct ActiveBatch {
    seq: u64,
    token: CancellationToken,
    done: watch::Receiver<bool>,
}

/// Removes the batch table entry and signals teardown when dropped
struct BatchGuard<'a> {
    processor: &'a BatchProcessor,
    id: String,
    seq: u64,
    done: watch::Sender<bool>,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.processor.active.lock();
        if active.get(&self.id).is_some_and(|b| b.seq == self.seq) {
            active.remove(&self.id);
        }
        drop(active);
        self.done.send_replace(true);
    }
}

enum RunOutcome {
    Finished(Vec<Response>),
    Cancelled,
}

pub struct BatchProcessor {
    router: Arc<Router>,
    default_concurrency: usize,
    active: Mutex<HashMap<String, ActiveBatch>>,
    next_seq: AtomicU64,
}

impl BatchProcessor {
    pub fn new(router: Arc<Router>) -> Self {
        Self::with_concurrency(router, DEFAULT_BATCH_CONCURRENCY)
    }

    /// `default_concurrency` caps parallel batches that set no limit
    pub fn with_concurrency(router: Arc<Router>, default_concurrency: usize) -> Self {
        Self {
            router,
            default_concurrency: default_concurrency.max(1),
            active: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Ids of batches currently running, sorted
    pub fn active_batches(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Run a batch to completion. Fails with `INVALID_PARAMS` while another
    /// batch with the same id is in flight, and with `REQUEST_CANCELLED`
    /// when cancelled through [`Self::cancel_batch`].
    pub async fn process_batch(&self, batch: BatchRequest) -> Result<BatchResponse, McpError> {
        let token = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        {
            let mut active = self.active.lock();
            if active.contains_key(&batch.id) {
                return Err(McpError::invalid_params(format!(
                    "Batch already processing: {}",
                    batch.id
                )));
            }
            active.insert(
                batch.id.clone(),
                ActiveBatch {
                    seq,
                    token: token.clone(),
                    done: done_rx,
                },
            );
        }
        let _guard = BatchGuard {
            processor: self,
            id: batch.id.clone(),
            seq,
            done: done_tx,
        };

        let started = Instant::now();
        info!(
            batch_id = %batch.id,
            size = batch.requests.len(),
            parallel = batch.parallel,
            "Processing batch"
        );

        let BatchRequest {
            id,
            requests,
            parallel,
            max_concurrent,
            timeout,
            continue_on_error,
        } = batch;

        let outcome = if parallel {
            let limit = max_concurrent
                .unwrap_or(self.default_concurrency)
                .clamp(1, requests.len().max(1));
            self.run_parallel(requests, limit, timeout, continue_on_error, &token)
                .await
        } else {
            self.run_sequential(requests, timeout, continue_on_error, &token)
                .await
        };

        match outcome {
            RunOutcome::Finished(responses) => {
                let response = BatchResponse::new(id, responses, started);
                info!(
                    batch_id = %response.id,
                    completed = response.completed,
                    failed = response.failed,
                    duration = response.duration,
                    "Batch finished"
                );
                Ok(response)
            }
            RunOutcome::Cancelled => {
                warn!(batch_id = %id, "Batch cancelled");
                Err(McpError::request_cancelled(format!("batch {}", id)))
            }
        }
    }

    async fn run_sequential(
        &self,
        requests: Vec<Request>,
        timeout: Option<Duration>,
        continue_on_error: bool,
        token: &CancellationToken,
    ) -> RunOutcome {
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            let response = tokio::select! {
                _ = token.cancelled() => return RunOutcome::Cancelled,
                response = execute(Arc::clone(&self.router), request, timeout) => response,
            };
            let Some(response) = response else { continue };
            let failed = response.is_error();
            responses.push(response);
            if failed && !continue_on_error {
                debug!("Sequential batch stopped at first failure");
                break;
            }
        }
        RunOutcome::Finished(responses)
    }

    async fn run_parallel(
        &self,
        requests: Vec<Request>,
        limit: usize,
        timeout: Option<Duration>,
        continue_on_error: bool,
        token: &CancellationToken,
    ) -> RunOutcome {
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut slots: Vec<Option<Response>> = (0..requests.len()).map(|_| None).collect();
        let mut set = JoinSet::new();

        for (index, request) in requests.into_iter().enumerate() {
            let router = Arc::clone(&self.router);
            let semaphore = Arc::clone(&semaphore);
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                execute(router, request, timeout).await.map(|r| (index, r))
            });
        }

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    set.shutdown().await;
                    return RunOutcome::Cancelled;
                }
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Ok(Some((index, response)))) => {
                        let failed = response.is_error();
                        slots[index] = Some(response);
                        if failed && !continue_on_error {
                            debug!("Parallel batch aborting outstanding requests");
                            set.shutdown().await;
                            break;
                        }
                    }
                    Some(Ok(None)) => {}
                    Some(Err(e)) => warn!(error = %e, "Batch sub-task failed"),
                }
            }
        }

        RunOutcome::Finished(slots.into_iter().flatten().collect())
    }

    /// Cancel a running batch and wait for its sub-tasks to stop.
    /// Returns false for unknown ids.
    pub async fn cancel_batch(&self, id: &str) -> bool {
        let Some((token, mut done)) = self
            .active
            .lock()
            .get(id)
            .map(|b| (b.token.clone(), b.done.clone()))
        else {
            return false;
        };
        token.cancel();
        let _ = done.wait_for(|finished| *finished).await;
        info!(batch_id = id, "Cancelled batch");
        true
    }
}

/// Route one sub-request. Notifications yield no response.
async fn execute(router: Arc<Router>, request: Request, timeout: Option<Duration>) -> Option<Response> {
    let Some(limit) = timeout else {
        return router.handle(request).await;
    };
    let id = request.id.clone();
    let method = request.method.clone();
    match tokio::time::timeout(limit, router.handle(request)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(method = %method, timeout = ?limit, "Batch request timed out");
            id.map(|id| {
                Response::error(
                    Some(id),
                    McpError::new(ErrorCode::InternalError, "Request timeout"),
                )
            })
        }
    }
}
