use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::IndividualId;
use crate::error::TransferError;
use crate::transfer::{ObjectTransport, TransferJob, TransferResult};

const BASE_DELAY_MS: u64 = 200;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferKey {
    pub individual: IndividualId,
    pub artifact: String,
}

impl TransferKey {
    pub fn new(individual: IndividualId, artifact: impl Into<String>) -> Self {
        Self {
            individual,
            artifact: artifact.into(),
        }
    }
}

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.individual, self.artifact)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransferManifest {
    entries: BTreeMap<TransferKey, TransferJob>,
}

impl TransferManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: TransferKey, job: TransferJob) {
        self.entries.insert(key, job);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug)]
pub struct BatchReport {
    results: BTreeMap<TransferKey, TransferResult>,
}

impl BatchReport {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn is_failed(&self) -> bool {
        self.results.values().any(Result::is_err)
    }

    pub fn get(&self, key: &TransferKey) -> Option<&TransferResult> {
        self.results.get(key)
    }

    pub fn results(&self) -> impl Iterator<Item = (&TransferKey, &TransferResult)> {
        self.results.iter()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&TransferKey, &TransferError)> {
        self.results
            .iter()
            .filter_map(|(key, result)| result.as_ref().err().map(|err| (key, err)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    pub fn linear(max_retries: usize) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(BASE_DELAY_MS),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear(2)
    }
}

// The concurrency limit is shared by every caller.
#[derive(Clone)]
pub struct TransferBatch {
    transport: Arc<dyn ObjectTransport>,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl TransferBatch {
    pub fn new(transport: Arc<dyn ObjectTransport>, concurrency: usize, retry: RetryPolicy) -> Self {
        Self {
            transport,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            retry,
        }
    }

    // One result per manifest entry.
    pub async fn run(&self, manifest: TransferManifest, cancel: &CancellationToken) -> BatchReport {
        let total = manifest.len();
        let tasks = manifest.entries.into_iter().map(|(key, job)| async move {
            let result = self.run_entry(&job, cancel).await;
            (key, result)
        });
        let results: BTreeMap<_, _> = join_all(tasks).await.into_iter().collect();

        let report = BatchReport { results };
        let failed = report.failures().count();
        if failed > 0 {
            warn!(total, failed, "transfer batch finished with failures");
        } else {
            debug!(total, "transfer batch finished");
        }
        report
    }

    async fn run_entry(&self, job: &TransferJob, cancel: &CancellationToken) -> TransferResult {
        let mut attempt = 0usize;
        loop {
            let result = {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                    permit = self.permits.acquire() => permit.map_err(|_| TransferError::Cancelled)?,
                };
                self.transport.transfer(job, cancel).await
            };
            match result {
                Err(err) if attempt < self.retry.max_retries && err.is_retryable() => {
                    attempt += 1;
                    let delay = self.retry.base_delay * attempt as u32;
                    debug!(url = %job.url, attempt, error = %err, "retrying transfer");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                other => return other,
            }
        }
    }
}
