//! The fetch pipeline and its scheduler

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::attachments::AttachmentStore;
use super::mailbox::{MailboxConnector, MailboxSession};
use super::parse::{parse_message, Envelope, ParsedMessage};
use super::progress::{
    AccountStat, EmailSummary, FetchFailure, FetchResult, FetchStep, JobId, JobStatusStore,
    ProgressUpdate,
};
use super::retry::RetryPolicy;
use crate::config::ConfigHandle;
use crate::error::{CloudMailError, Result};
use crate::store::{
    normalize_message_id, now_ms, ActivityKind, Database, NewAttachment, NewEmail, SaveOutcome,
};

/// Overlap subtracted from the newest stored date; dedup absorbs the re-fetched messages
const WATERMARK_PAD_MS: i64 = 60 * 60 * 1000;
const DEFAULT_LOOKBACK_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started(JobId),
    AlreadyRunning,
}

/// Synthetic id for messages without a `Message-ID` header
pub fn synthetic_message_id(uid: u32) -> String {
    format!("uid-{}@imap", uid)
}

/// Lower bound of the IMAP search: newest stored date minus one hour, else thirty days ago
pub fn watermark(last_email_date: Option<i64>, now: i64) -> i64 {
    match last_email_date {
        Some(date) => date - WATERMARK_PAD_MS,
        None => now - ChronoDuration::days(DEFAULT_LOOKBACK_DAYS).num_milliseconds(),
    }
}

/// Checkpoint after handling message `index` of `total`
pub fn processing_progress(index: usize, total: usize) -> u8 {
    if total == 0 {
        return 95;
    }
    (30 + index * 65 / total).min(95) as u8
}

/// Pulls mail from the collecting mailbox into the database.
#[derive(Clone)]
pub struct MailService {
    db: Database,
    config: ConfigHandle,
    connector: Arc<dyn MailboxConnector>,
    jobs: Arc<dyn JobStatusStore>,
    attachments: AttachmentStore,
    retry: RetryPolicy,
}

/// Bookkeeping of one fetch
#[derive(Default)]
struct Batch {
    stats: BTreeMap<String, AccountStat>,
    failures: Vec<FetchFailure>,
    new_messages: usize,
}

impl MailService {
    pub fn new(
        db: Database,
        config: ConfigHandle,
        connector: Arc<dyn MailboxConnector>,
        jobs: Arc<dyn JobStatusStore>,
        attachments: AttachmentStore,
    ) -> Self {
        Self {
            db,
            config,
            connector,
            jobs,
            attachments,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn jobs(&self) -> &Arc<dyn JobStatusStore> {
        &self.jobs
    }

    pub fn attachments(&self) -> &AttachmentStore {
        &self.attachments
    }

    /// Start a fetch in the background, optionally for one account only.
    pub async fn trigger(&self, account: Option<String>) -> TriggerOutcome {
        let Some(job) = self.jobs.start().await else {
            debug!("Mail fetch already in progress");
            return TriggerOutcome::AlreadyRunning;
        };

        let service = self.clone();
        let job_id = job.clone();
        tokio::spawn(async move {
            service.run(&job_id, account).await;
        });
        TriggerOutcome::Started(job)
    }

    /// Run a fetch to completion. `None` when another fetch holds the slot.
    pub async fn fetch_now(&self, account: Option<String>) -> Option<FetchResult> {
        let job = self.jobs.start().await?;
        Some(self.run(&job, account).await)
    }

    async fn run(&self, job: &str, account: Option<String>) -> FetchResult {
        let result = match self.fetch(job, account.as_deref()).await {
            Ok(result) => result,
            Err(e) => {
                error!("Mail fetch failed: {}", e);
                FetchResult::failed(e.to_string())
            }
        };
        self.jobs.complete(job, result.clone()).await;
        result
    }

    async fn progress(&self, job: &str, update: ProgressUpdate) {
        self.jobs.update(job, update).await;
    }

    async fn fetch(&self, job: &str, scope: Option<&str>) -> Result<FetchResult> {
        self.progress(
            job,
            ProgressUpdate::new(FetchStep::Initializing, 5, "Loading active accounts"),
        )
        .await;

        let config = self.config.snapshot().await;
        if !config.email.imap.enabled {
            return Err(CloudMailError::Config("IMAP fetching is disabled".to_string()));
        }

        let scope = scope.map(|s| s.trim().to_lowercase());
        let active: HashSet<String> = self
            .db
            .active_accounts()
            .await?
            .into_iter()
            .map(|a| a.email.to_lowercase())
            .filter(|email| scope.as_ref().map_or(true, |s| s == email))
            .collect();

        if active.is_empty() {
            info!("No active accounts to fetch mail for");
            self.progress(job, ProgressUpdate::new(FetchStep::Finalizing, 100, "No active accounts"))
                .await;
            return Ok(FetchResult::empty());
        }

        let since_ms = watermark(self.db.last_email_date(scope.as_deref()).await?, now_ms());
        let since = Utc
            .timestamp_millis_opt(since_ms)
            .single()
            .ok_or_else(|| CloudMailError::Imap(format!("invalid watermark {}", since_ms)))?
            .date_naive();

        self.progress(
            job,
            ProgressUpdate::new(FetchStep::ConnectingImap, 10, "Connecting to mailbox")
                .accounts(0, active.len()),
        )
        .await;

        let mut session = MailboxSession::new(self.connector.clone());
        let outcome = self.fetch_with_session(job, &mut session, since, &active).await;
        session.close().await;
        let batch = outcome?;

        let result = FetchResult {
            success: true,
            total_emails: batch.new_messages,
            account_stats: batch.stats.into_values().collect(),
            failures: batch.failures,
            error: None,
        };

        let summary = format!(
            "Fetched {} new emails for {} accounts",
            result.total_emails,
            result.account_stats.len()
        );
        self.db
            .record_activity(
                ActivityKind::EmailCheck,
                summary.clone(),
                None,
                Some(json!({
                    "totalEmails": result.total_emails,
                    "accounts": result.account_stats.iter().map(|s| &s.account).collect::<Vec<_>>(),
                    "failures": result.failures.len(),
                })),
            )
            .await;
        info!("{}", summary);

        Ok(result)
    }

    async fn fetch_with_session(
        &self,
        job: &str,
        session: &mut MailboxSession,
        since: chrono::NaiveDate,
        active: &HashSet<String>,
    ) -> Result<Batch> {
        self.retry
            .run("IMAP connect", session, |s| {
                Box::pin(async move { s.client().await.map(|_| ()) })
            })
            .await?;

        self.progress(
            job,
            ProgressUpdate::new(FetchStep::ListingMessages, 20, format!("Searching since {}", since)),
        )
        .await;

        let uids = self
            .retry
            .run("IMAP search", session, |s| {
                Box::pin(async move { s.client().await?.search_since(since).await })
            })
            .await?;

        let mut batch = Batch::default();
        if uids.is_empty() {
            self.progress(job, ProgressUpdate::new(FetchStep::Finalizing, 100, "No new messages"))
                .await;
            return Ok(batch);
        }

        let envelopes = self
            .retry
            .run("IMAP envelope fetch", session, |s| {
                let uids = uids.clone();
                Box::pin(async move { s.client().await?.fetch_envelopes(&uids).await })
            })
            .await?;
        let total = envelopes.len();

        self.progress(
            job,
            ProgressUpdate::new(FetchStep::ProcessingMessages, 30, format!("Processing {} messages", total))
                .emails(0, total)
                .accounts(0, active.len()),
        )
        .await;

        for (index, envelope) in envelopes.iter().enumerate() {
            let matched = matched_accounts(envelope, active);
            if matched.is_empty() {
                debug!("UID {} has no local recipient", envelope.uid);
            } else {
                let uid = envelope.uid;
                let source = self
                    .retry
                    .run("IMAP message fetch", session, |s| {
                        Box::pin(async move { s.client().await?.fetch_source(uid).await })
                    })
                    .await?;

                match source {
                    Some(raw) => self.store_message(envelope, &raw, &matched, &mut batch).await,
                    None => batch.failures.push(FetchFailure {
                        uid,
                        account: None,
                        error: "message disappeared from the mailbox".to_string(),
                    }),
                }
            }

            self.progress(
                job,
                ProgressUpdate::new(
                    FetchStep::ProcessingMessages,
                    processing_progress(index, total),
                    format!("Processed {}/{} messages", index + 1, total),
                )
                .emails(index + 1, total)
                .accounts(batch.stats.len(), active.len()),
            )
            .await;
        }

        self.progress(job, ProgressUpdate::new(FetchStep::Finalizing, 95, "Finalizing"))
            .await;
        Ok(batch)
    }

    /// Persist one message for every matched account. Failures are recorded in `batch`.
    async fn store_message(&self, envelope: &Envelope, raw: &[u8], matched: &[String], batch: &mut Batch) {
        let parsed = match parse_message(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Failed to parse UID {}: {}", envelope.uid, e);
                batch.failures.push(FetchFailure {
                    uid: envelope.uid,
                    account: None,
                    error: e.to_string(),
                });
                return;
            }
        };

        let message_id = parsed
            .message_id
            .clone()
            .or_else(|| envelope.message_id.clone())
            .map(|id| normalize_message_id(&id))
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| synthetic_message_id(envelope.uid));

        let mut saved_any = false;
        for account in matched {
            match self.store_for_account(account, &message_id, envelope, &parsed).await {
                Ok(true) => {
                    saved_any = true;
                    let stat = batch
                        .stats
                        .entry(account.clone())
                        .or_insert_with(|| AccountStat {
                            account: account.clone(),
                            count: 0,
                            emails: Vec::new(),
                        });
                    stat.count += 1;
                    stat.emails.push(EmailSummary {
                        subject: parsed.subject.clone().unwrap_or_default(),
                        sender: parsed.sender.clone().unwrap_or_default(),
                    });
                }
                Ok(false) => debug!("UID {} already stored for {}", envelope.uid, account),
                Err(e) => {
                    warn!("Failed to store UID {} for {}: {}", envelope.uid, account, e);
                    batch.failures.push(FetchFailure {
                        uid: envelope.uid,
                        account: Some(account.clone()),
                        error: e.to_string(),
                    });
                }
            }
        }

        if saved_any {
            batch.new_messages += 1;
        }
    }

    /// Returns whether a new row was written
    async fn store_for_account(
        &self,
        account: &str,
        message_id: &str,
        envelope: &Envelope,
        parsed: &ParsedMessage,
    ) -> Result<bool> {
        if self.db.email_exists(account, message_id).await? {
            return Ok(false);
        }

        let mut files: Vec<NewAttachment> = Vec::with_capacity(parsed.attachments.len());
        for attachment in &parsed.attachments {
            match self.attachments.save(account, attachment).await {
                Ok(file) => files.push(file),
                Err(e) => {
                    self.attachments
                        .remove_files(files.into_iter().map(|f| f.path).collect())
                        .await;
                    return Err(e);
                }
            }
        }

        let email = NewEmail {
            account: account.to_string(),
            message_id: message_id.to_string(),
            sender: parsed.sender.clone(),
            sender_name: parsed.sender_name.clone(),
            subject: parsed.subject.clone(),
            preview: parsed.preview.clone(),
            body: parsed.body.clone(),
            date: parsed.date.or(envelope.date).unwrap_or_else(now_ms),
        };

        match self.db.save_email(&email, &files).await {
            Ok(SaveOutcome::Saved(id)) => {
                debug!("Stored email {} for {}", id, account);
                Ok(true)
            }
            Ok(SaveOutcome::Duplicate) => {
                self.attachments
                    .remove_files(files.into_iter().map(|f| f.path).collect())
                    .await;
                Ok(false)
            }
            Err(e) => {
                self.attachments
                    .remove_files(files.into_iter().map(|f| f.path).collect())
                    .await;
                Err(e)
            }
        }
    }

    /// Trigger a fetch every `email.fetch_interval` minutes until `shutdown` fires.
    ///
    /// The interval is re-read after each tick so settings changes apply without a restart.
    pub fn spawn_scheduler(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                let minutes = service.config.snapshot().await.email.fetch_interval.max(1);
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Mail scheduler stopped");
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_secs(minutes * 60)) => {}
                }

                match service.trigger(None).await {
                    TriggerOutcome::Started(job) => info!("Scheduled mail fetch {} started", job),
                    TriggerOutcome::AlreadyRunning => {
                        debug!("Skipping scheduled fetch, one is already running")
                    }
                }
            }
        })
    }
}

/// Recipients of `envelope` that are active local accounts
pub fn matched_accounts(envelope: &Envelope, active: &HashSet<String>) -> Vec<String> {
    let mut matched: Vec<String> = envelope
        .recipients
        .iter()
        .map(|r| r.to_lowercase())
        .filter(|r| active.contains(r))
        .collect();
    matched.sort();
    matched.dedup();
    matched
}
