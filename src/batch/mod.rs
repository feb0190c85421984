//! Concurrency-bounded batch scheduling.
//!
//! The scheduler takes an ordered list of independent tasks, splits it
//! into fixed-size groups and runs each group under a shared semaphore.
//! Groups are sequential; tasks inside a group are concurrent up to the
//! permit count. An optional per-group deadline aborts whatever has not
//! finished when it fires, records each aborted task as a
//! [`CrawlError::BatchTimeout`] and moves on to the next group - one slow
//! group never sinks the rest of the crawl, and one failed task never
//! sinks its group.
//!
//! Task outcomes come back indexed by submission order, successes sorted
//! ascending, so callers see deterministic output regardless of
//! completion order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::CrawlError;

/// Scheduling knobs for one batch run.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum tasks in flight at once, across the whole group.
    pub concurrency: usize,
    /// Tasks per sequential group.
    pub batch_size: usize,
    /// Deadline for one group; `None` waits indefinitely.
    pub group_timeout: Option<Duration>,
    /// Random pause window between consecutive groups.
    pub group_interval: (Duration, Duration),
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            batch_size: 10,
            group_timeout: Some(Duration::from_secs(120)),
            group_interval: (Duration::from_secs(1), Duration::from_secs(3)),
        }
    }
}

/// Outcome of one batch run.
#[derive(Debug)]
pub struct BatchReport<T> {
    /// Completed tasks as `(submission_index, value)`, sorted by index.
    pub successes: Vec<(usize, T)>,
    /// Failed or aborted tasks as `(submission_index, error)`, sorted by
    /// index.
    pub failures: Vec<(usize, CrawlError)>,
}

impl<T> BatchReport<T> {
    /// Values of the completed tasks, in submission order.
    #[must_use]
    pub fn into_values(self) -> Vec<T> {
        self.successes.into_iter().map(|(_, value)| value).collect()
    }

    /// Number of tasks that completed.
    #[must_use]
    pub fn success_count(&self) -> usize {
        self.successes.len()
    }
}

/// Runs ordered task lists in bounded concurrent groups.
#[derive(Debug, Clone, Default)]
pub struct BatchScheduler {
    config: BatchConfig,
}

impl BatchScheduler {
    #[must_use]
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    /// Runs `tasks` to completion and reports per-task outcomes.
    ///
    /// Task futures must be independent: a failure is recorded against
    /// its own index and the remaining tasks keep running.
    pub async fn run<T, Fut>(
        &self,
        label: &str,
        tasks: impl IntoIterator<Item = Fut>,
    ) -> BatchReport<T>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T, CrawlError>> + Send + 'static,
    {
        let batch_size = self.config.batch_size.max(1);
        let indexed: Vec<(usize, Fut)> = tasks.into_iter().enumerate().collect();
        let total = indexed.len();
        info!(%label, total, batch_size, concurrency = self.config.concurrency, "batch run starting");

        let mut report = BatchReport {
            successes: Vec::with_capacity(total),
            failures: Vec::new(),
        };
        let mut groups = Vec::new();
        let mut current = Vec::new();
        for task in indexed {
            current.push(task);
            if current.len() == batch_size {
                groups.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            groups.push(current);
        }

        let group_count = groups.len();
        for (group_index, group) in groups.into_iter().enumerate() {
            self.run_group(label, group_index, group, &mut report).await;
            if group_index + 1 < group_count {
                pause_between_groups(self.config.group_interval).await;
            }
        }

        report.successes.sort_by_key(|(index, _)| *index);
        report.failures.sort_by_key(|(index, _)| *index);
        info!(
            %label,
            succeeded = report.successes.len(),
            failed = report.failures.len(),
            "batch run finished"
        );
        report
    }

    async fn run_group<T, Fut>(
        &self,
        label: &str,
        group_index: usize,
        group: Vec<(usize, Fut)>,
        report: &mut BatchReport<T>,
    ) where
        T: Send + 'static,
        Fut: Future<Output = Result<T, CrawlError>> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut join_set: JoinSet<(usize, Result<T, CrawlError>)> = JoinSet::new();
        let mut task_indices: HashMap<tokio::task::Id, usize> = HashMap::new();

        for (index, fut) in group {
            let semaphore = Arc::clone(&semaphore);
            let handle = join_set.spawn(async move {
                // The semaphore is never closed, so the permit always
                // arrives unless the whole task is aborted first.
                let _permit = semaphore.acquire_owned().await.ok();
                (index, fut.await)
            });
            task_indices.insert(handle.id(), index);
        }

        let deadline = self
            .config
            .group_timeout
            .map(|timeout| Instant::now() + timeout);
        let mut deadline_hit = false;

        loop {
            let joined = match deadline {
                Some(at) if !deadline_hit => {
                    match tokio::time::timeout_at(at, join_set.join_next_with_id()).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            deadline_hit = true;
                            warn!(%label, group = group_index, "group deadline expired, aborting unfinished tasks");
                            join_set.abort_all();
                            continue;
                        }
                    }
                }
                _ => join_set.join_next_with_id().await,
            };
            let Some(joined) = joined else { break };

            match joined {
                Ok((id, (index, result))) => {
                    task_indices.remove(&id);
                    match result {
                        Ok(value) => report.successes.push((index, value)),
                        Err(error) => {
                            debug!(%label, group = group_index, index, "task failed: {error}");
                            report.failures.push((index, error));
                        }
                    }
                }
                Err(join_error) => {
                    let index = task_indices
                        .remove(&join_error.id())
                        .unwrap_or(usize::MAX);
                    if join_error.is_cancelled() {
                        report
                            .failures
                            .push((index, CrawlError::BatchTimeout { group: group_index }));
                    } else {
                        report.failures.push((
                            index,
                            CrawlError::decode(label, format!("task panicked: {join_error}")),
                        ));
                    }
                }
            }
        }
    }
}

async fn pause_between_groups((low, high): (Duration, Duration)) {
    let wait = if high <= low {
        low
    } else {
        low + (high - low).mul_f64(rand::thread_rng().r#gen::<f64>())
    };
    if !wait.is_zero() {
        tokio::time::sleep(wait).await;
    }
}
