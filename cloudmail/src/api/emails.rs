//! Email browsing and fetch control

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::handlers::{api_error, reject, ApiResult, AppState};
use crate::auth::{AuthUser, Claims};
use crate::ingest::{FetchProgress, JobId, TriggerOutcome};
use crate::store::{Attachment, DatePreset, Email, EmailFilter, Paginated};

/// Parse a date bound given as Unix milliseconds, RFC 3339 or `YYYY-MM-DD`.
///
/// A bare day used as an upper bound covers the whole day.
pub fn parse_date_bound(value: &str, end_of_day: bool) -> Option<i64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(ms) = value.parse::<i64>() {
        return Some(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.timestamp_millis());
    }
    let day = NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()?;
    let time = if end_of_day {
        day.and_hms_milli_opt(23, 59, 59, 999)
    } else {
        day.and_hms_opt(0, 0, 0)
    }?;
    Some(time.and_utc().timestamp_millis())
}

/// Listing parameters shared by `/api/emails/list` and the mail page
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EmailListQuery {
    pub account: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub sender: Option<String>,
    pub subject: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub unread_only: Option<String>,
    pub has_attachments: Option<String>,
    /// `today`, `week` or `month`
    pub date: Option<String>,
    pub search: Option<String>,
}

/// Checkbox and select values: `true`/`on`/`1` or `false`/`0`; anything else is unset
fn flag(value: Option<&str>) -> Option<bool> {
    match value?.trim().to_lowercase().as_str() {
        "true" | "on" | "1" | "yes" => Some(true),
        "false" | "off" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn date_preset(value: Option<&str>) -> Option<DatePreset> {
    match value?.trim().to_lowercase().as_str() {
        "today" => Some(DatePreset::Today),
        "week" => Some(DatePreset::Week),
        "month" => Some(DatePreset::Month),
        _ => None,
    }
}

impl EmailListQuery {
    /// Store filter for `user`; non-admins only ever see their own account.
    pub fn filter_for(&self, user: &AuthUser) -> EmailFilter {
        EmailFilter {
            account: self.account.clone().filter(|_| user.is_admin),
            owner: (!user.is_admin).then(|| user.email.clone()),
            sender: self.sender.clone(),
            subject: self.subject.clone(),
            is_read: flag(self.unread_only.as_deref())
                .filter(|unread| *unread)
                .map(|_| false),
            has_attachments: flag(self.has_attachments.as_deref()),
            start_date: self
                .start_date
                .as_deref()
                .and_then(|d| parse_date_bound(d, false)),
            end_date: self
                .end_date
                .as_deref()
                .and_then(|d| parse_date_bound(d, true)),
            date: date_preset(self.date.as_deref()),
            search: self.search.clone(),
        }
    }

    pub fn page(&self) -> i64 {
        self.page.unwrap_or(1)
    }

    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(20)
    }
}

/// How a fetch request was answered
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchTriggered {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
}

impl AppState {
    /// Start a fetch for `user`. Admins may scope it to any account, everyone else to their own.
    pub async fn trigger_fetch(&self, user: &AuthUser, account: Option<String>) -> FetchTriggered {
        let scope = if user.is_admin {
            account.filter(|a| !a.trim().is_empty())
        } else {
            Some(user.email.clone())
        };

        match self.mail.trigger(scope.clone()).await {
            TriggerOutcome::Started(job) => {
                info!("{} started fetch job {}", user.username, job);
                FetchTriggered {
                    success: true,
                    message: match scope {
                        Some(account) => format!("Checking mail for {}", account),
                        None => "Checking mail for all accounts".to_string(),
                    },
                    job_id: Some(job),
                }
            }
            TriggerOutcome::AlreadyRunning => FetchTriggered {
                success: true,
                message: "Mail check already in progress".to_string(),
                job_id: None,
            },
        }
    }

    pub async fn fetch_status(&self) -> FetchProgress {
        self.mail.jobs().current().await
    }

    /// Email `id` if `user` may read it
    pub async fn visible_email(&self, user: &AuthUser, id: i64) -> ApiResult<Email> {
        let email = self
            .db
            .email_by_id(id)
            .await
            .map_err(api_error)?
            .ok_or_else(|| reject(StatusCode::NOT_FOUND, "Email not found"))?;
        if !user.can_access(&email.account) {
            return Err(reject(StatusCode::FORBIDDEN, "Access denied"));
        }
        Ok(email)
    }
}

#[derive(Debug, Serialize)]
pub struct EmailListResponse {
    pub success: bool,
    #[serde(flatten)]
    pub page: Paginated<Email>,
}

#[derive(Debug, Serialize)]
pub struct EmailResponse {
    pub success: bool,
    pub email: Email,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Serialize)]
pub struct ReadResponse {
    pub success: bool,
    pub updated: u64,
}

#[derive(Debug, Deserialize)]
pub struct BatchReadRequest {
    pub ids: Vec<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CheckQuery {
    pub account: Option<String>,
}

/// GET /api/emails/list
pub async fn list_emails(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Query(query): Query<EmailListQuery>,
) -> ApiResult<Json<EmailListResponse>> {
    let filter = query.filter_for(&claims.user());
    let page = state
        .db
        .emails_paginated(query.page(), query.limit(), &filter)
        .await
        .map_err(api_error)?;

    Ok(Json(EmailListResponse {
        success: true,
        page,
    }))
}

/// GET /api/emails/:id
pub async fn get_email(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Path(id): Path<i64>,
) -> ApiResult<Json<EmailResponse>> {
    let email = state.visible_email(&claims.user(), id).await?;
    let attachments = state
        .db
        .attachments_for_email(id)
        .await
        .map_err(api_error)?;

    Ok(Json(EmailResponse {
        success: true,
        email,
        attachments,
    }))
}

/// PUT /api/emails/:id/read
pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Path(id): Path<i64>,
) -> ApiResult<Json<ReadResponse>> {
    state.visible_email(&claims.user(), id).await?;
    let updated = state.db.mark_email_read(id).await.map_err(api_error)?;

    Ok(Json(ReadResponse {
        success: true,
        updated: u64::from(updated),
    }))
}

/// PUT /api/emails/batch/read
pub async fn batch_read(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Json(req): Json<BatchReadRequest>,
) -> ApiResult<Json<ReadResponse>> {
    let user = claims.user();
    if req.ids.is_empty() {
        return Err(reject(StatusCode::BAD_REQUEST, "No email ids given"));
    }

    if !user.is_admin {
        for id in &req.ids {
            match state.db.email_by_id(*id).await.map_err(api_error)? {
                Some(email) if user.can_access(&email.account) => {}
                Some(_) => return Err(reject(StatusCode::FORBIDDEN, "Access denied")),
                None => return Err(reject(StatusCode::NOT_FOUND, "Email not found")),
            }
        }
    }

    let updated = state.db.mark_emails_read(&req.ids).await.map_err(api_error)?;
    Ok(Json(ReadResponse {
        success: true,
        updated,
    }))
}

/// GET /api/emails/check-status
pub async fn check_status(State(state): State<Arc<AppState>>, _claims: Claims) -> Json<FetchProgress> {
    Json(state.fetch_status().await)
}

/// POST /api/emails/check
pub async fn check(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Query(query): Query<CheckQuery>,
) -> Json<FetchTriggered> {
    Json(state.trigger_fetch(&claims.user(), query.account).await)
}
