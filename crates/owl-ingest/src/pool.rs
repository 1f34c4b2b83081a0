use std::sync::Arc;
use std::time::Duration;

use owl_core::{DetailDocument, ItemDescriptor};
use owl_storage::FetchError;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::CatalogSource;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetailFailure {
    pub reference_id: String,
    pub error: String,
}

/// Outcome of one detail fan-out once every submitted fetch has finished.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchStageReport {
    pub submitted: usize,
    pub succeeded: usize,
    pub failures: Vec<DetailFailure>,
}

impl FetchStageReport {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// Fetches one detail document per descriptor with at most `concurrency`
/// fetches in flight.
#[derive(Debug, Clone)]
pub struct DetailFetcherPool {
    concurrency: usize,
    fetch_timeout: Option<Duration>,
}

impl Default for DetailFetcherPool {
    fn default() -> Self {
        Self::new(20)
    }
}

impl DetailFetcherPool {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            fetch_timeout: None,
        }
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Start the fan-out in the background. Documents arrive on the receiver,
    /// which closes after the last fetch completes; the handle resolves to the
    /// stage report at the same point.
    pub fn fetch_details(
        &self,
        source: Arc<dyn CatalogSource>,
        descriptors: Vec<ItemDescriptor>,
    ) -> (mpsc::Receiver<DetailDocument>, JoinHandle<FetchStageReport>) {
        let (tx, rx) = mpsc::channel(self.concurrency);
        let pool = self.clone();
        let handle = tokio::spawn(async move { pool.run(source, descriptors, tx).await });
        (rx, handle)
    }

    /// Drive every fetch to completion, sending successful documents to `tx`.
    pub async fn run(
        &self,
        source: Arc<dyn CatalogSource>,
        descriptors: Vec<ItemDescriptor>,
        tx: mpsc::Sender<DetailDocument>,
    ) -> FetchStageReport {
        let gate = Arc::new(Semaphore::new(self.concurrency));
        let mut workers = JoinSet::new();
        let mut report = FetchStageReport {
            submitted: descriptors.len(),
            ..Default::default()
        };

        for descriptor in descriptors {
            // Admission blocks here while `concurrency` fetches are in flight.
            let permit = gate
                .clone()
                .acquire_owned()
                .await
                .expect("fetch gate is never closed");
            let source = source.clone();
            let tx = tx.clone();
            let fetch_timeout = self.fetch_timeout;

            workers.spawn(async move {
                let result = fetch_one(source.as_ref(), &descriptor, fetch_timeout).await;
                drop(permit);

                match result {
                    Ok(document) => {
                        if tx.send(document).await.is_err() {
                            debug!(reference_id = %descriptor.reference_id, "document receiver dropped");
                        }
                        Ok(())
                    }
                    Err(err) => Err(DetailFailure {
                        reference_id: descriptor.reference_id,
                        error: err.to_string(),
                    }),
                }
            });
        }
        drop(tx);

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => report.succeeded += 1,
                Ok(Err(failure)) => {
                    warn!(
                        reference_id = %failure.reference_id,
                        error = %failure.error,
                        "detail fetch failed"
                    );
                    report.failures.push(failure);
                }
                Err(err) => {
                    warn!(error = %err, "detail fetch worker aborted");
                    report.failures.push(DetailFailure {
                        reference_id: "<unknown>".to_string(),
                        error: err.to_string(),
                    });
                }
            }
        }

        debug!(
            submitted = report.submitted,
            succeeded = report.succeeded,
            failed = report.failed(),
            "detail fetch stage drained"
        );
        report
    }
}

async fn fetch_one(
    source: &dyn CatalogSource,
    descriptor: &ItemDescriptor,
    fetch_timeout: Option<Duration>,
) -> Result<DetailDocument, FetchError> {
    let Some(limit) = fetch_timeout else {
        return source.fetch_detail(descriptor).await;
    };
    match tokio::time::timeout(limit, source.fetch_detail(descriptor)).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout {
            target: descriptor.reference_id.clone(),
            timeout: limit,
        }),
    }
}
