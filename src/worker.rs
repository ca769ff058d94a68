use crate::config::AnalysisTimeouts;
use crate::error::{AnalysisError, ServiceError};
use crate::model::{ImageBlob, PageData};
use crate::plugins::AnalysisPlugins;
use crate::protocol::{AnalysisKind, AnalysisOutcome, AnalysisPayload};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Worker pool full: {max_workers} running and {max_queue} queued")]
pub struct Overloaded {
    pub max_workers: usize,
    pub max_queue: usize,
}

/// Bounded processing capacity with non-blocking admission.
///
/// Admission is checked against `max_workers + max_queue`; execution against
/// `max_workers`. Both are held as owned permits so they are released however
/// the holding task ends.
pub struct WorkerPool {
    max_workers: usize,
    max_queue: usize,
    admission: Arc<Semaphore>,
    execution: Arc<Semaphore>,
    rejected: AtomicU64,
    completed: Arc<AtomicU64>,
}

impl WorkerPool {
    pub fn new(max_workers: usize, max_queue: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            max_workers,
            max_queue,
            admission: Arc::new(Semaphore::new(max_workers + max_queue)),
            execution: Arc::new(Semaphore::new(max_workers)),
            rejected: AtomicU64::new(0),
            completed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Reserve a place in the pool without waiting.
    pub fn try_admit(&self) -> Result<Admission, Overloaded> {
        match Arc::clone(&self.admission).try_acquire_owned() {
            Ok(permit) => Ok(Admission {
                admission: permit,
                execution: Arc::clone(&self.execution),
                completed: Arc::clone(&self.completed),
            }),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Err(Overloaded {
                    max_workers: self.max_workers,
                    max_queue: self.max_queue,
                })
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let admitted = self.max_workers + self.max_queue - self.admission.available_permits();
        let active = self.max_workers - self.execution.available_permits();
        PoolStats {
            max_workers: self.max_workers,
            max_queue: self.max_queue,
            active,
            queued: admitted.saturating_sub(active),
            rejected: self.rejected.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }

    pub fn close(&self) {
        self.admission.close();
        self.execution.close();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub max_workers: usize,
    pub max_queue: usize,
    pub active: usize,
    pub queued: usize,
    pub rejected: u64,
    pub completed: u64,
}

/// An admitted request waiting for a worker.
pub struct Admission {
    admission: OwnedSemaphorePermit,
    execution: Arc<Semaphore>,
    completed: Arc<AtomicU64>,
}

impl Admission {
    pub async fn acquire_slot(self) -> Result<WorkerSlot, ServiceError> {
        let execution = self.execution.acquire_owned().await?;
        Ok(WorkerSlot {
            _admission: self.admission,
            _execution: execution,
            completed: self.completed,
        })
    }
}

/// One occupied unit of processing capacity. Freed on drop.
pub struct WorkerSlot {
    _admission: OwnedSemaphorePermit,
    _execution: OwnedSemaphorePermit,
    completed: Arc<AtomicU64>,
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }
}

type SharedScreenshot = Shared<BoxFuture<'static, Result<ImageBlob, AnalysisError>>>;

/// Runs the requested analyses of one request concurrently.
#[derive(Clone)]
pub struct AnalysisRunner {
    plugins: AnalysisPlugins,
    timeouts: AnalysisTimeouts,
}

impl AnalysisRunner {
    pub fn new(plugins: AnalysisPlugins, timeouts: AnalysisTimeouts) -> Self {
        Self { plugins, timeouts }
    }

    /// Every requested kind appears in the result, as a payload or an error.
    pub async fn run(
        &self,
        page: Arc<PageData>,
        kinds: &BTreeSet<AnalysisKind>,
    ) -> BTreeMap<AnalysisKind, (AnalysisOutcome, Duration)> {
        let screenshot = (kinds.contains(&AnalysisKind::Screenshot) || kinds.contains(&AnalysisKind::Image))
            .then(|| self.shared_screenshot(Arc::clone(&page)));

        let mut tasks = JoinSet::new();
        for &kind in kinds {
            let started = Instant::now();
            let task = self.task_for(kind, Arc::clone(&page), screenshot.clone());
            tasks.spawn(async move { (kind, task.await, started.elapsed()) });
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((kind, outcome, elapsed)) => {
                    results.insert(kind, (outcome, elapsed));
                }
                Err(e) => warn!("Analysis task aborted: {}", e),
            }
        }

        for &kind in kinds {
            results.entry(kind).or_insert_with(|| {
                (
                    Err(AnalysisError::failed("analysis task panicked")),
                    Duration::ZERO,
                )
            });
        }
        results
    }

    fn shared_screenshot(&self, page: Arc<PageData>) -> SharedScreenshot {
        let shooter = Arc::clone(&self.plugins.screenshotter);
        let limit = self.timeouts.screenshot;
        async move {
            timeout(limit, shooter.screenshot(&page, limit))
                .await
                .unwrap_or_else(|_| Err(AnalysisError::timeout(limit)))
        }
        .boxed()
        .shared()
    }

    fn task_for(
        &self,
        kind: AnalysisKind,
        page: Arc<PageData>,
        screenshot: Option<SharedScreenshot>,
    ) -> BoxFuture<'static, AnalysisOutcome> {
        let limit = self.timeouts.for_kind(kind);
        match kind {
            AnalysisKind::Screenshot => async move {
                match screenshot {
                    Some(shot) => shot.await.map(AnalysisPayload::Screenshot),
                    None => Err(AnalysisError::Missing),
                }
            }
            .boxed(),
            AnalysisKind::Image => {
                let processor = Arc::clone(&self.plugins.image_processor);
                async move {
                    let blob = match screenshot {
                        Some(shot) => shot.await.map_err(|e| AnalysisError::Skipped {
                            reason: format!("screenshot unavailable: {e}"),
                        })?,
                        None => return Err(AnalysisError::Missing),
                    };
                    timeout(limit, processor.process(&blob, limit))
                        .await
                        .map_err(|_| AnalysisError::timeout(limit))?
                        .map(AnalysisPayload::Image)
                }
                .boxed()
            }
            AnalysisKind::Performance => {
                let scorer = Arc::clone(&self.plugins.scorer);
                async move {
                    timeout(limit, scorer.score(&page, limit))
                        .await
                        .map_err(|_| AnalysisError::timeout(limit))?
                        .map(AnalysisPayload::Performance)
                }
                .boxed()
            }
            AnalysisKind::Seo | AnalysisKind::TechStack | AnalysisKind::StructuredData | AnalysisKind::Accessibility => {
                let auditor = Arc::clone(&self.plugins.auditor);
                async move {
                    let audit = tokio::task::spawn_blocking(move || match kind {
                        AnalysisKind::Seo => AnalysisPayload::Seo(auditor.seo(&page)),
                        AnalysisKind::StructuredData => AnalysisPayload::StructuredData(auditor.structured_data(&page)),
                        AnalysisKind::Accessibility => AnalysisPayload::Accessibility(auditor.accessibility(&page)),
                        _ => AnalysisPayload::TechStack(auditor.technologies(&page)),
                    });
                    let payload = timeout(limit, audit)
                        .await
                        .map_err(|_| AnalysisError::timeout(limit))?
                        .map_err(AnalysisError::failed)?;
                    debug!("{} audit finished", kind);
                    Ok(payload)
                }
                .boxed()
            }
        }
    }
}
