//! Worker pool for per-annotation batch work
//!
//! Units are pushed through a bounded channel to scoped worker threads. Each
//! result carries its annotation id and input position, and is reassembled in
//! input order. Cancellation is coarse: it is checked between units, and a
//! unit that already started runs to completion.

use crossbeam_channel::{bounded, unbounded};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::types::Aid;
use crate::{Error, Result};

/// Jobs buffered per worker before the producer blocks.
const QUEUE_DEPTH_PER_WORKER: usize = 4;

/// Shared flag to abandon a batch between units.
///
/// A child token reads as cancelled once it or any ancestor is cancelled.
/// Cancelling a child leaves its parent untouched.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Box<CancelToken>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh token for one batch that also observes `self`.
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::default(),
            parent: Some(Box::new(self.clone())),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.parent.as_ref().is_some_and(|parent| parent.is_cancelled())
    }
}

/// Annotations a batch build skipped, with the reason.
#[derive(Debug, Default)]
pub struct BuildReport {
    pub built: usize,
    pub skipped: Vec<(Aid, String)>,
}

impl BuildReport {
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// Results of a batch, in input order, plus the per-item failures.
#[derive(Debug)]
pub struct PoolOutcome<R> {
    pub results: Vec<(Aid, R)>,
    pub failures: Vec<(Aid, Error)>,
}

impl<R> PoolOutcome<R> {
    pub fn report(&self) -> BuildReport {
        BuildReport {
            built: self.results.len(),
            skipped: self
                .failures
                .iter()
                .map(|(aid, err)| (*aid, err.to_string()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `task` over every item and reassemble the results in input order.
    ///
    /// A fatal error (see [`Error::is_fatal`]) stops dispatch and is returned.
    /// Any other failure only drops its own item and is reported in
    /// [`PoolOutcome::failures`]. If `cancel` fires, no further units start and
    /// the batch returns [`Error::Cancelled`].
    pub fn map_ordered<T, R, F>(
        &self,
        items: Vec<(Aid, T)>,
        cancel: &CancelToken,
        task: F,
    ) -> Result<PoolOutcome<R>>
    where
        T: Send,
        R: Send,
        F: Fn(Aid, T) -> Result<R> + Sync,
    {
        let total = items.len();
        if total == 0 {
            return Ok(PoolOutcome {
                results: Vec::new(),
                failures: Vec::new(),
            });
        }

        let workers = self.workers.min(total);
        let abort = AtomicBool::new(false);
        let (job_tx, job_rx) = bounded::<(usize, Aid, T)>(workers * QUEUE_DEPTH_PER_WORKER);
        let (done_tx, done_rx) = unbounded::<(usize, Aid, Result<R>)>();

        tracing::debug!(total, workers, "Dispatching batch to worker pool");

        std::thread::scope(|s| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let done_tx = done_tx.clone();
                let task = &task;
                let abort = &abort;
                s.spawn(move || {
                    for (pos, aid, item) in job_rx.iter() {
                        if cancel.is_cancelled() || abort.load(Ordering::SeqCst) {
                            continue;
                        }
                        let result = task(aid, item);
                        if matches!(&result, Err(err) if err.is_fatal()) {
                            abort.store(true, Ordering::SeqCst);
                        }
                        if done_tx.send((pos, aid, result)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(job_rx);
            drop(done_tx);

            for (pos, (aid, item)) in items.into_iter().enumerate() {
                if cancel.is_cancelled() || abort.load(Ordering::SeqCst) {
                    break;
                }
                if job_tx.send((pos, aid, item)).is_err() {
                    break;
                }
            }
            drop(job_tx);
        });

        let mut finished: Vec<(usize, Aid, Result<R>)> = done_rx.iter().collect();
        finished.sort_by_key(|(pos, _, _)| *pos);

        let mut results = Vec::with_capacity(finished.len());
        let mut failures = Vec::new();
        for (_, aid, result) in finished {
            match result {
                Ok(value) => results.push((aid, value)),
                Err(err) if err.is_fatal() => {
                    tracing::error!(aid, error = %err, "Batch aborted");
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(aid, error = %err, "Skipping annotation");
                    failures.push((aid, err));
                }
            }
        }

        if cancel.is_cancelled() {
            tracing::info!(
                completed = results.len(),
                total,
                "Batch cancelled between units"
            );
            return Err(Error::Cancelled);
        }

        Ok(PoolOutcome { results, failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_come_back_in_input_order() {
        let pool = WorkerPool::new(4);
        let items: Vec<(Aid, u64)> = (0..100).map(|i| (i, i)).collect();
        let outcome = pool
            .map_ordered(items, &CancelToken::new(), |aid, x| {
                if aid % 7 == 0 {
                    std::thread::yield_now();
                }
                Ok(x * 2)
            })
            .unwrap();
        let aids: Vec<Aid> = outcome.results.iter().map(|(aid, _)| *aid).collect();
        assert_eq!(aids, (0..100).collect::<Vec<_>>());
        assert!(outcome.results.iter().all(|(aid, v)| *v == aid * 2));
    }

    #[test]
    fn non_fatal_failures_are_skipped() {
        let pool = WorkerPool::new(2);
        let items: Vec<(Aid, ())> = (1..=5).map(|i| (i, ())).collect();
        let outcome = pool
            .map_ordered(items, &CancelToken::new(), |aid, _| {
                if aid == 3 {
                    Err(Error::AnnotationNotFound(aid))
                } else {
                    Ok(aid)
                }
            })
            .unwrap();
        assert_eq!(outcome.results.len(), 4);
        let report = outcome.report();
        assert_eq!(report.built, 4);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, 3);
    }

    #[test]
    fn fatal_failure_aborts_batch() {
        let pool = WorkerPool::new(2);
        let items: Vec<(Aid, ())> = (1..=20).map(|i| (i, ())).collect();
        let err = pool
            .map_ordered(items, &CancelToken::new(), |aid, _| {
                if aid == 2 {
                    Err(Error::config("vocabulary missing"))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert!(matches!(err, Error::PipelineConfiguration(_)));
    }

    #[test]
    fn cancelled_batch_returns_cancelled() {
        let pool = WorkerPool::new(1);
        let cancel = CancelToken::new();
        let items: Vec<(Aid, ())> = (1..=50).map(|i| (i, ())).collect();
        let err = pool
            .map_ordered(items, &cancel, |aid, _| {
                if aid == 5 {
                    cancel.cancel();
                }
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn child_token_follows_parent_only() {
        let parent = CancelToken::new();
        let first = parent.child();
        first.cancel();
        assert!(first.is_cancelled());
        assert!(!parent.is_cancelled());

        let second = parent.child();
        assert!(!second.is_cancelled());
        parent.cancel();
        assert!(second.is_cancelled());
    }

    #[test]
    fn empty_batch_is_empty() {
        let outcome = WorkerPool::new(3)
            .map_ordered(Vec::<(Aid, ())>::new(), &CancelToken::new(), |_, _| Ok(()))
            .unwrap();
        assert!(outcome.results.is_empty());
        assert!(outcome.failures.is_empty());
    }
}
