// src/batch/mod.rs
//! Priority-queued batch execution with bounded parallelism.
//!
//! Callers submit batches of work items with a priority; a fixed set of
//! worker tasks drains the queue highest-priority-first (FIFO within a
//! priority) and hands each batch to the processor supplied with the job.
//! Batch sizing is pluggable: a fixed size, or an adaptive strategy that
//! drifts toward whatever size has delivered the best throughput.

use crate::error::ClientError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use uuid::Uuid;

const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Job priority. Higher values drain first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BatchPriority {
    Low = 1,
    Normal = 5,
    High = 8,
    Critical = 10,
}

impl BatchPriority {
    fn rank(self) -> u8 {
        // Smaller rank pops first.
        10 - self as u8
    }
}

/// Outcome for one item within a processed batch.
#[derive(Debug, Clone, Serialize)]
pub struct ItemOutcome {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl ItemOutcome {
    pub fn ok(data: Option<serde_json::Value>) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub job_id: String,
    pub success: bool,
    pub item_count: usize,
    pub successful: usize,
    pub failed: usize,
    pub outcomes: Vec<ItemOutcome>,
    pub error: Option<String>,
    #[serde(skip)]
    pub duration: Duration,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchMetrics {
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub items_processed: u64,
    pub queued_jobs: usize,
    pub processing_jobs: usize,
    pub current_batch_size: usize,
}

/// Decides how many items go into each batch split by `submit_bulk`.
pub trait BatchSizeStrategy: Send + Sync {
    fn batch_size(&self) -> usize;

    /// Called after every completed job with the item count and wall time.
    fn record(&self, _items: usize, _duration: Duration) {}
}

/// Constant batch size.
pub struct FixedBatchSize(pub usize);

impl BatchSizeStrategy for FixedBatchSize {
    fn batch_size(&self) -> usize {
        self.0
    }
}

struct AdaptiveState {
    current: usize,
    // size -> (total items/sec observed, sample count)
    throughput: HashMap<usize, (f64, u32)>,
    last_adjust: Instant,
}

/// Drifts the batch size toward whichever size has shown the best
/// throughput, in steps of `STEP`, no more often than once per
/// `ADJUST_INTERVAL`, and only once at least three distinct sizes have
/// been sampled.
pub struct AdaptiveBatchSize {
    min: usize,
    max: usize,
    state: std::sync::Mutex<AdaptiveState>,
}

impl AdaptiveBatchSize {
    const STEP: usize = 10;
    const ADJUST_INTERVAL: Duration = Duration::from_secs(60);
    const MIN_DISTINCT_SIZES: usize = 3;

    pub fn new(initial: usize, min: usize, max: usize) -> Self {
        Self {
            min,
            max,
            state: std::sync::Mutex::new(AdaptiveState {
                current: initial.clamp(min, max),
                throughput: HashMap::new(),
                last_adjust: Instant::now(),
            }),
        }
    }
}

impl BatchSizeStrategy for AdaptiveBatchSize {
    fn batch_size(&self) -> usize {
        self.state.lock().expect("adaptive state poisoned").current
    }

    fn record(&self, items: usize, duration: Duration) {
        if items == 0 {
            return;
        }
        let secs = duration.as_secs_f64().max(0.001);
        let throughput = items as f64 / secs;

        let mut state = self.state.lock().expect("adaptive state poisoned");
        let entry = state.throughput.entry(items).or_insert((0.0, 0));
        entry.0 += throughput;
        entry.1 += 1;

        if state.throughput.len() < Self::MIN_DISTINCT_SIZES
            || state.last_adjust.elapsed() < Self::ADJUST_INTERVAL
        {
            return;
        }

        let best = state
            .throughput
            .iter()
            .map(|(size, (total, count))| (*size, total / *count as f64))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(CmpOrdering::Equal))
            .map(|(size, _)| size);

        if let Some(best) = best {
            let current = state.current;
            let next = if best > current {
                (current + Self::STEP).min(self.max)
            } else if best < current {
                current.saturating_sub(Self::STEP).max(self.min)
            } else {
                current
            };
            if next != current {
                debug!("Adaptive batch size {} -> {} (best observed {})", current, next, best);
                state.current = next;
            }
            state.last_adjust = Instant::now();
        }
    }
}

/// Async closure that processes one batch of items.
pub type BatchFn<T> =
    Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, Result<Vec<ItemOutcome>, ClientError>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_parallel: usize,
    pub queue_size: usize,
    pub process_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_parallel: 10,
            queue_size: 1000,
            process_interval: Duration::from_millis(100),
        }
    }
}

struct QueuedJob<T> {
    job_id: String,
    items: Vec<T>,
    processor: BatchFn<T>,
    rank: u8,
    seq: u64,
    // Carried for result bookkeeping; retries happen at the transport
    // layer below the processor.
    #[allow(dead_code)]
    max_retries: u32,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
}

impl<T> PartialEq for QueuedJob<T> {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.seq == other.seq
    }
}

impl<T> Eq for QueuedJob<T> {}

impl<T> PartialOrd for QueuedJob<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for QueuedJob<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: lowest rank (highest priority) wins, then lowest seq
        // for FIFO within a priority.
        other
            .rank
            .cmp(&self.rank)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct BatchInner<T> {
    config: BatchConfig,
    strategy: Arc<dyn BatchSizeStrategy>,
    queue: Mutex<BinaryHeap<QueuedJob<T>>>,
    notify: Notify,
    processing: DashMap<String, ()>,
    results: DashMap<String, JobResult>,
    seq: AtomicU64,
    jobs_submitted: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    items_processed: AtomicU64,
}

impl<T: Send + 'static> BatchInner<T> {
    async fn process_job(&self, job: QueuedJob<T>) {
        self.processing.insert(job.job_id.clone(), ());
        let item_count = job.items.len();
        let start = Instant::now();

        let result = match (job.processor)(job.items).await {
            Ok(mut outcomes) => {
                // Processors that return fewer outcomes than items leave
                // the remainder unreported; count those as failures.
                while outcomes.len() < item_count {
                    outcomes.push(ItemOutcome::failed("no outcome reported"));
                }
                let successful = outcomes.iter().filter(|o| o.success).count();
                JobResult {
                    job_id: job.job_id.clone(),
                    success: true,
                    item_count,
                    successful,
                    failed: item_count - successful,
                    outcomes,
                    error: None,
                    duration: start.elapsed(),
                    processed_at: Utc::now(),
                }
            }
            Err(e) => {
                warn!("Batch job {} failed: {}", job.job_id, e);
                JobResult {
                    job_id: job.job_id.clone(),
                    success: false,
                    item_count,
                    successful: 0,
                    failed: item_count,
                    outcomes: Vec::new(),
                    error: Some(e.to_string()),
                    duration: start.elapsed(),
                    processed_at: Utc::now(),
                }
            }
        };

        if result.success {
            self.jobs_completed.fetch_add(1, Ordering::Relaxed);
            self.strategy.record(item_count, result.duration);
        } else {
            self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.items_processed
            .fetch_add(item_count as u64, Ordering::Relaxed);

        self.processing.remove(&job.job_id);
        self.results.insert(job.job_id, result);
    }
}

pub struct BatchProcessor<T> {
    inner: Arc<BatchInner<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl<T: Send + 'static> BatchProcessor<T> {
    pub fn new(config: BatchConfig, strategy: Arc<dyn BatchSizeStrategy>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(BatchInner {
                config,
                strategy,
                queue: Mutex::new(BinaryHeap::new()),
                notify: Notify::new(),
                processing: DashMap::new(),
                results: DashMap::new(),
                seq: AtomicU64::new(0),
                jobs_submitted: AtomicU64::new(0),
                jobs_completed: AtomicU64::new(0),
                jobs_failed: AtomicU64::new(0),
                items_processed: AtomicU64::new(0),
            }),
            workers: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    /// Spawns the worker tasks. Idempotent.
    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }
        let _ = self.shutdown.send(false);
        for id in 0..self.inner.config.max_parallel {
            let inner = self.inner.clone();
            let mut shutdown_rx = self.shutdown.subscribe();
            workers.push(tokio::spawn(async move {
                debug!("Batch worker {} started", id);
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    let job = inner.queue.lock().await.pop();
                    match job {
                        Some(job) => {
                            inner.process_job(job).await;
                            sleep(inner.config.process_interval).await;
                        }
                        None => {
                            tokio::select! {
                                _ = inner.notify.notified() => {}
                                _ = shutdown_rx.changed() => {}
                            }
                        }
                    }
                }
                debug!("Batch worker {} stopped", id);
            }));
        }
        info!(
            "Batch processor started with {} workers",
            self.inner.config.max_parallel
        );
    }

    /// Signals shutdown and waits for the workers. A worker that already
    /// pulled a job finishes it before exiting.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.inner.notify.notify_waiters();
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            if let Err(e) = handle.await {
                error!("Batch worker panicked: {}", e);
            }
        }
        info!("Batch processor stopped");
    }

    /// Enqueues one batch with its processor. Returns the job id, or
    /// `ResourceExhausted` when the queue is full.
    pub async fn submit_batch(
        &self,
        items: Vec<T>,
        processor: BatchFn<T>,
        priority: BatchPriority,
        job_id: Option<String>,
    ) -> Result<String, ClientError> {
        let mut queue = self.inner.queue.lock().await;
        if queue.len() >= self.inner.config.queue_size {
            return Err(ClientError::ResourceExhausted(format!(
                "batch queue full ({} jobs)",
                queue.len()
            )));
        }

        let job_id = job_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        queue.push(QueuedJob {
            job_id: job_id.clone(),
            items,
            processor,
            rank: priority.rank(),
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
            max_retries: 3,
            created_at: Utc::now(),
        });
        drop(queue);

        self.inner.jobs_submitted.fetch_add(1, Ordering::Relaxed);
        self.inner.notify.notify_one();
        Ok(job_id)
    }

    /// Splits `items` into batches sized by the strategy and enqueues them
    /// all, failing up front if they would not fit in the queue.
    pub async fn submit_bulk(
        &self,
        items: Vec<T>,
        processor: BatchFn<T>,
        priority: BatchPriority,
        id_prefix: &str,
    ) -> Result<Vec<String>, ClientError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let batch_size = self.inner.strategy.batch_size().max(1);
        let mut chunks = Vec::with_capacity(items.len().div_ceil(batch_size));
        let mut items = items;
        while !items.is_empty() {
            let rest = items.split_off(items.len().min(batch_size));
            chunks.push(std::mem::replace(&mut items, rest));
        }

        // Capacity check and enqueue under one lock, so a concurrent
        // submitter cannot strand a partially enqueued bulk.
        let mut job_ids = Vec::with_capacity(chunks.len());
        {
            let mut queue = self.inner.queue.lock().await;
            if queue.len() + chunks.len() > self.inner.config.queue_size {
                return Err(ClientError::ResourceExhausted(format!(
                    "bulk submission of {} batches would overflow the queue",
                    chunks.len()
                )));
            }
            for (index, chunk) in chunks.into_iter().enumerate() {
                let job_id = format!("{}_{}_{}", id_prefix, index, Uuid::new_v4());
                queue.push(QueuedJob {
                    job_id: job_id.clone(),
                    items: chunk,
                    processor: processor.clone(),
                    rank: priority.rank(),
                    seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
                    max_retries: 3,
                    created_at: Utc::now(),
                });
                job_ids.push(job_id);
            }
        }

        self.inner
            .jobs_submitted
            .fetch_add(job_ids.len() as u64, Ordering::Relaxed);
        for _ in 0..job_ids.len() {
            self.inner.notify.notify_one();
        }
        Ok(job_ids)
    }

    pub fn job_status(&self, job_id: &str) -> JobStatus {
        if self.inner.results.contains_key(job_id) {
            JobStatus::Completed
        } else if self.inner.processing.contains_key(job_id) {
            JobStatus::Processing
        } else {
            JobStatus::Unknown
        }
    }

    pub fn job_result(&self, job_id: &str) -> Option<JobResult> {
        self.inner.results.get(job_id).map(|r| r.clone())
    }

    /// Polls until the job completes or `timeout` elapses.
    pub async fn wait_for_job(
        &self,
        job_id: &str,
        timeout: Duration,
    ) -> Result<JobResult, ClientError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(result) = self.inner.results.get(job_id) {
                return Ok(result.clone());
            }
            if Instant::now() >= deadline {
                return Err(ClientError::Timeout(format!(
                    "job {} not complete after {:?}",
                    job_id, timeout
                )));
            }
            sleep(RESULT_POLL_INTERVAL).await;
        }
    }

    /// Waits for every job against a single overall deadline. Jobs still
    /// pending at the deadline are reported as failed results instead of
    /// aborting the whole call.
    pub async fn wait_for_all(&self, job_ids: &[String], timeout: Duration) -> Vec<JobResult> {
        let deadline = Instant::now() + timeout;
        let mut results = Vec::with_capacity(job_ids.len());
        for job_id in job_ids {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.wait_for_job(job_id, remaining).await {
                Ok(result) => results.push(result),
                Err(e) => results.push(JobResult {
                    job_id: job_id.clone(),
                    success: false,
                    item_count: 0,
                    successful: 0,
                    failed: 0,
                    outcomes: Vec::new(),
                    error: Some(e.to_string()),
                    duration: timeout,
                    processed_at: Utc::now(),
                }),
            }
        }
        results
    }

    /// Drops completed results older than `max_age`. Returns the count
    /// removed.
    pub fn clear_results(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let before = self.inner.results.len();
        self.inner.results.retain(|_, r| r.processed_at > cutoff);
        before - self.inner.results.len()
    }

    pub async fn metrics(&self) -> BatchMetrics {
        BatchMetrics {
            jobs_submitted: self.inner.jobs_submitted.load(Ordering::Relaxed),
            jobs_completed: self.inner.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.inner.jobs_failed.load(Ordering::Relaxed),
            items_processed: self.inner.items_processed.load(Ordering::Relaxed),
            queued_jobs: self.inner.queue.lock().await.len(),
            processing_jobs: self.inner.processing.len(),
            current_batch_size: self.inner.strategy.batch_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use pretty_assertions::assert_eq;

    fn succeed_all() -> BatchFn<u32> {
        Arc::new(|items: Vec<u32>| {
            async move {
                Ok(items
                    .iter()
                    .map(|v| ItemOutcome::ok(Some(serde_json::json!(v))))
                    .collect())
            }
            .boxed()
        })
    }

    fn fail_all() -> BatchFn<u32> {
        Arc::new(|_items: Vec<u32>| {
            async move { Err(ClientError::Transport("backend unavailable".to_string())) }.boxed()
        })
    }

    fn fast_config() -> BatchConfig {
        BatchConfig {
            max_parallel: 4,
            queue_size: 100,
            process_interval: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn bulk_submission_splits_by_strategy_size() {
        let processor = BatchProcessor::new(fast_config(), Arc::new(FixedBatchSize(100)));
        processor.start().await;

        let items: Vec<u32> = (0..250).collect();
        let job_ids = processor
            .submit_bulk(items, succeed_all(), BatchPriority::Normal, "bulk")
            .await
            .unwrap();
        assert_eq!(job_ids.len(), 3);

        let results = processor
            .wait_for_all(&job_ids, Duration::from_secs(5))
            .await;
        let counts: Vec<usize> = results.iter().map(|r| r.item_count).collect();
        assert_eq!(counts, vec![100, 100, 50]);
        assert!(results.iter().all(|r| r.success && r.failed == 0));
        assert_eq!(
            results.iter().map(|r| r.successful).sum::<usize>(),
            250
        );

        processor.stop().await;
    }

    #[tokio::test]
    async fn higher_priority_jobs_drain_first() {
        // Workers never started: inspect queue order directly.
        let processor = BatchProcessor::new(fast_config(), Arc::new(FixedBatchSize(10)));

        let low = processor
            .submit_batch(vec![1], succeed_all(), BatchPriority::Low, None)
            .await
            .unwrap();
        let normal_a = processor
            .submit_batch(vec![2], succeed_all(), BatchPriority::Normal, None)
            .await
            .unwrap();
        let critical = processor
            .submit_batch(vec![3], succeed_all(), BatchPriority::Critical, None)
            .await
            .unwrap();
        let normal_b = processor
            .submit_batch(vec![4], succeed_all(), BatchPriority::Normal, None)
            .await
            .unwrap();

        let mut queue = processor.inner.queue.lock().await;
        assert_eq!(queue.pop().unwrap().job_id, critical);
        assert_eq!(queue.pop().unwrap().job_id, normal_a); // FIFO within priority
        assert_eq!(queue.pop().unwrap().job_id, normal_b);
        assert_eq!(queue.pop().unwrap().job_id, low);
    }

    #[tokio::test]
    async fn full_queue_rejects_submission() {
        let config = BatchConfig {
            queue_size: 2,
            ..fast_config()
        };
        let processor = BatchProcessor::new(config, Arc::new(FixedBatchSize(10)));

        processor
            .submit_batch(vec![1], succeed_all(), BatchPriority::Normal, None)
            .await
            .unwrap();
        processor
            .submit_batch(vec![2], succeed_all(), BatchPriority::Normal, None)
            .await
            .unwrap();

        let err = processor
            .submit_batch(vec![3], succeed_all(), BatchPriority::Normal, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ResourceExhausted(_)));

        // Bulk pre-checks capacity as well.
        let err = processor
            .submit_bulk((0..30).collect(), succeed_all(), BatchPriority::Normal, "bulk")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn bulk_overflow_enqueues_nothing() {
        let config = BatchConfig {
            queue_size: 3,
            ..fast_config()
        };
        let processor = BatchProcessor::new(config, Arc::new(FixedBatchSize(10)));

        processor
            .submit_batch(vec![0], succeed_all(), BatchPriority::Normal, None)
            .await
            .unwrap();

        // Three chunks on top of one queued job would overflow; the bulk
        // must be rejected whole, with no stranded jobs or ids.
        let err = processor
            .submit_bulk((0..30).collect(), succeed_all(), BatchPriority::Normal, "bulk")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ResourceExhausted(_)));

        let metrics = processor.metrics().await;
        assert_eq!(metrics.queued_jobs, 1);
        assert_eq!(metrics.jobs_submitted, 1);

        // A bulk that fits is accepted in full.
        let job_ids = processor
            .submit_bulk((0..20).collect(), succeed_all(), BatchPriority::Normal, "bulk")
            .await
            .unwrap();
        assert_eq!(job_ids.len(), 2);
        assert_eq!(processor.metrics().await.queued_jobs, 3);
    }

    #[tokio::test]
    async fn processor_error_marks_every_item_failed() {
        let processor = BatchProcessor::new(fast_config(), Arc::new(FixedBatchSize(10)));
        processor.start().await;

        let job_id = processor
            .submit_batch(vec![1, 2, 3], fail_all(), BatchPriority::High, None)
            .await
            .unwrap();
        let result = processor
            .wait_for_job(&job_id, Duration::from_secs(5))
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.failed, 3);
        assert_eq!(result.successful, 0);
        assert!(result.error.is_some());

        let metrics = processor.metrics().await;
        assert_eq!(metrics.jobs_failed, 1);
        assert_eq!(metrics.items_processed, 3);

        processor.stop().await;
    }

    #[tokio::test]
    async fn wait_for_all_reports_timeouts_as_failed_records() {
        // No workers: nothing ever completes.
        let processor = BatchProcessor::new(fast_config(), Arc::new(FixedBatchSize(10)));
        let job_id = processor
            .submit_batch(vec![1], succeed_all(), BatchPriority::Normal, None)
            .await
            .unwrap();

        let results = processor
            .wait_for_all(&[job_id.clone()], Duration::from_millis(150))
            .await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert_eq!(results[0].job_id, job_id);
        assert!(results[0].error.as_deref().unwrap().contains("not complete"));
    }

    #[tokio::test]
    async fn clear_results_drops_old_entries() {
        let processor = BatchProcessor::new(fast_config(), Arc::new(FixedBatchSize(10)));
        processor.start().await;

        let job_id = processor
            .submit_batch(vec![1], succeed_all(), BatchPriority::Normal, None)
            .await
            .unwrap();
        processor
            .wait_for_job(&job_id, Duration::from_secs(5))
            .await
            .unwrap();
        processor.stop().await;

        assert_eq!(processor.clear_results(Duration::from_secs(3600)), 0);
        assert_eq!(processor.clear_results(Duration::ZERO), 1);
        assert_eq!(processor.job_status(&job_id), JobStatus::Unknown);
    }

    #[test]
    fn adaptive_size_stays_within_bounds() {
        let adaptive = AdaptiveBatchSize::new(50, 10, 60);
        assert_eq!(adaptive.batch_size(), 50);

        // Larger batches show better throughput.
        adaptive.record(50, Duration::from_secs(5));
        adaptive.record(40, Duration::from_secs(5));
        adaptive.record(60, Duration::from_secs(2));

        // Force the adjustment window to have elapsed.
        adaptive
            .state
            .lock()
            .unwrap()
            .last_adjust = Instant::now() - Duration::from_secs(61);
        adaptive.record(60, Duration::from_secs(2));

        // Nudged up by one step, clamped to max.
        assert_eq!(adaptive.batch_size(), 60);
    }

    #[test]
    fn adaptive_needs_several_distinct_sizes() {
        let adaptive = AdaptiveBatchSize::new(50, 10, 200);
        adaptive
            .state
            .lock()
            .unwrap()
            .last_adjust = Instant::now() - Duration::from_secs(120);

        adaptive.record(50, Duration::from_secs(1));
        adaptive.record(50, Duration::from_secs(1));
        assert_eq!(adaptive.batch_size(), 50);
    }
}
