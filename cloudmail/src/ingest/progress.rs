//! Fetch job tracking
//!
//! A fetch runs as a job with a single-flight slot: while one job holds the slot no other
//! job can start. Pollers read the job's progress record, which is replaced as a whole on
//! every update so a reader never observes a half-written record.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

pub type JobId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStep {
    Idle,
    Initializing,
    ConnectingImap,
    ListingMessages,
    ProcessingMessages,
    Finalizing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailSummary {
    pub subject: String,
    pub sender: String,
}

/// New emails stored for one account during a fetch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountStat {
    pub account: String,
    pub count: usize,
    pub emails: Vec<EmailSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchFailure {
    pub uid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResult {
    pub success: bool,
    /// Messages that produced at least one new row
    pub total_emails: usize,
    pub account_stats: Vec<AccountStat>,
    pub failures: Vec<FetchFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FetchResult {
    /// Successful fetch that found nothing to store
    pub fn empty() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Snapshot of a job as shown to pollers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchProgress {
    pub job_id: Option<JobId>,
    pub is_running: bool,
    pub step: FetchStep,
    /// 0 to 100
    pub progress: u8,
    pub message: String,
    pub processed_emails: usize,
    pub total_emails: usize,
    pub processed_accounts: usize,
    pub total_accounts: usize,
    pub result: Option<FetchResult>,
}

impl FetchProgress {
    pub fn idle() -> Self {
        Self {
            job_id: None,
            is_running: false,
            step: FetchStep::Idle,
            progress: 0,
            message: String::new(),
            processed_emails: 0,
            total_emails: 0,
            processed_accounts: 0,
            total_accounts: 0,
            result: None,
        }
    }

    fn started(job_id: &str) -> Self {
        Self {
            job_id: Some(job_id.to_string()),
            is_running: true,
            step: FetchStep::Initializing,
            message: "Starting mail fetch".to_string(),
            ..Self::idle()
        }
    }
}

/// Partial update of a running job; `None` counters keep their value.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub step: FetchStep,
    pub progress: u8,
    pub message: String,
    pub processed_emails: Option<usize>,
    pub total_emails: Option<usize>,
    pub processed_accounts: Option<usize>,
    pub total_accounts: Option<usize>,
}

impl ProgressUpdate {
    pub fn new(step: FetchStep, progress: u8, message: impl Into<String>) -> Self {
        Self {
            step,
            progress,
            message: message.into(),
            processed_emails: None,
            total_emails: None,
            processed_accounts: None,
            total_accounts: None,
        }
    }

    pub fn emails(mut self, processed: usize, total: usize) -> Self {
        self.processed_emails = Some(processed);
        self.total_emails = Some(total);
        self
    }

    pub fn accounts(mut self, processed: usize, total: usize) -> Self {
        self.processed_accounts = Some(processed);
        self.total_accounts = Some(total);
        self
    }
}

#[async_trait]
pub trait JobStatusStore: Send + Sync {
    /// Take the single-flight slot and register a new job.
    /// Returns `None`, touching nothing, when another job holds the slot.
    async fn start(&self) -> Option<JobId>;

    /// Apply an update to a running job. Progress never moves backwards.
    async fn update(&self, job: &str, update: ProgressUpdate);

    /// Record the outcome. The slot is released and the record forgotten later.
    async fn complete(&self, job: &str, result: FetchResult);

    async fn get(&self, job: &str) -> Option<FetchProgress>;

    /// Record of the most recent job, or an idle record
    async fn current(&self) -> FetchProgress;

    fn is_running(&self) -> bool;
}

struct JobState {
    jobs: RwLock<HashMap<JobId, FetchProgress>>,
    latest: RwLock<Option<JobId>>,
    slot: AtomicBool,
}

impl JobState {
    async fn release(&self, job: &str) {
        if let Some(record) = self.jobs.write().await.get_mut(job) {
            let mut next = record.clone();
            next.is_running = false;
            next.step = FetchStep::Idle;
            *record = next;
        }
        self.slot.store(false, Ordering::Release);
        debug!("Fetch job {} released its slot", job);
    }

    async fn forget(&self, job: &str) {
        self.jobs.write().await.remove(job);
        let mut latest = self.latest.write().await;
        if latest.as_deref() == Some(job) {
            *latest = None;
        }
    }
}

/// Process-local [`JobStatusStore`].
///
/// Completed jobs keep the slot for `release_after` so the final state stays visible, then
/// are dropped after `forget_after`. Both timers stop when `shutdown` is cancelled.
#[derive(Clone)]
pub struct InMemoryJobStore {
    state: Arc<JobState>,
    release_after: Duration,
    forget_after: Duration,
    shutdown: CancellationToken,
}

impl InMemoryJobStore {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self::with_delays(shutdown, Duration::from_secs(3), Duration::from_secs(10 * 60))
    }

    pub fn with_delays(
        shutdown: CancellationToken,
        release_after: Duration,
        forget_after: Duration,
    ) -> Self {
        Self {
            state: Arc::new(JobState {
                jobs: RwLock::new(HashMap::new()),
                latest: RwLock::new(None),
                slot: AtomicBool::new(false),
            }),
            release_after,
            forget_after: forget_after.max(release_after),
            shutdown,
        }
    }

    fn schedule_cleanup(&self, job: JobId) {
        let state = self.state.clone();
        let shutdown = self.shutdown.clone();
        let release_after = self.release_after;
        let forget_after = self.forget_after - release_after;

        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(release_after) => {}
            }
            state.release(&job).await;

            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(forget_after) => state.forget(&job).await,
            }
        });
    }
}

#[async_trait]
impl JobStatusStore for InMemoryJobStore {
    async fn start(&self) -> Option<JobId> {
        if self
            .state
            .slot
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        let job = Uuid::new_v4().to_string();
        self.state
            .jobs
            .write()
            .await
            .insert(job.clone(), FetchProgress::started(&job));
        *self.state.latest.write().await = Some(job.clone());
        debug!("Fetch job {} started", job);
        Some(job)
    }

    async fn update(&self, job: &str, update: ProgressUpdate) {
        let mut jobs = self.state.jobs.write().await;
        let Some(record) = jobs.get_mut(job) else {
            return;
        };
        if !record.is_running {
            return;
        }

        let mut next = record.clone();
        next.step = update.step;
        next.progress = update.progress.min(100).max(record.progress);
        next.message = update.message;
        if let Some(n) = update.processed_emails {
            next.processed_emails = n;
        }
        if let Some(n) = update.total_emails {
            next.total_emails = n;
        }
        if let Some(n) = update.processed_accounts {
            next.processed_accounts = n;
        }
        if let Some(n) = update.total_accounts {
            next.total_accounts = n;
        }
        *record = next;
    }

    async fn complete(&self, job: &str, result: FetchResult) {
        {
            let mut jobs = self.state.jobs.write().await;
            if let Some(record) = jobs.get_mut(job) {
                let mut next = record.clone();
                next.step = FetchStep::Finalizing;
                next.progress = 100;
                next.message = if result.success {
                    format!("Fetch finished: {} new emails", result.total_emails)
                } else {
                    format!(
                        "Fetch failed: {}",
                        result.error.as_deref().unwrap_or("unknown error")
                    )
                };
                next.result = Some(result);
                *record = next;
            }
        }
        self.schedule_cleanup(job.to_string());
    }

    async fn get(&self, job: &str) -> Option<FetchProgress> {
        self.state.jobs.read().await.get(job).cloned()
    }

    async fn current(&self) -> FetchProgress {
        let latest = self.state.latest.read().await.clone();
        match latest {
            Some(job) => self
                .get(&job)
                .await
                .unwrap_or_else(FetchProgress::idle),
            None => FetchProgress::idle(),
        }
    }

    fn is_running(&self) -> bool {
        self.state.slot.load(Ordering::Acquire)
    }
}
