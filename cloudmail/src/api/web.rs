//! Server-rendered admin console

use askama_axum::Template;
use axum::{
    extract::{ConnectInfo, FromRequestParts, Path, Query, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use super::accounts::AccountListQuery;
use super::emails::EmailListQuery;
use super::handlers::{client_ip, status_for, ApiError, AppState};
use crate::auth::session::{clear_cookie, session_id};
use crate::auth::{AuthUser, LoginOutcome};
use crate::config::CloudflareZone;
use crate::error::CloudMailError;
use crate::ingest::attachments::sanitize_filename;
use crate::ingest::FetchProgress;
use crate::store::{Account, Activity, ActivityKind, AccountUpdate, Attachment, Email, Stats};

const RECENT_ACTIVITIES: i64 = 20;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/login", get(login_page).post(login_submit))
        .route("/logout", get(logout))
        .route("/", get(dashboard))
        .route("/clear-activities", post(clear_activities))
        .route("/accounts", get(accounts_page))
        .route("/accounts/sync", post(sync_accounts))
        .route("/accounts/generate", post(generate_accounts))
        .route("/accounts/create", post(create_account))
        .route("/accounts/delete/:id", post(delete_account))
        .route("/accounts/reset-password/:id", post(reset_password))
        .route("/accounts/edit/:id", post(edit_account))
        .route("/mail", get(mail_page))
        .route("/mail/view/:id", get(view_email))
        .route("/mail/fetch", get(fetch_mail))
        .route("/mail/fetch-status", get(fetch_status))
        .route("/mail/fetch-progress", post(fetch_progress))
        .route(
            "/mail/attachment/:email_id/:attachment_id",
            get(download_attachment),
        )
        .route("/mail/mark-all-as-read", post(mark_all_read))
        .route("/mail/delete/:id", post(delete_email))
        .route("/admin", get(settings_page))
        .route("/admin/settings", post(save_settings))
        .route("/admin/cloudflare/add", post(add_zone))
        .route("/admin/cloudflare/delete/:index", post(delete_zone))
}

/// Logged-in user of the current session
pub struct CurrentUser(pub AuthUser);

/// Logged-in admin; account holders are sent to their mail
pub struct AdminUser(pub AuthUser);

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for CurrentUser {
    type Rejection = Redirect;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let Some(id) = session_id(&parts.headers) else {
            return Err(Redirect::to("/login"));
        };
        state
            .sessions
            .get(&id)
            .await
            .map(CurrentUser)
            .ok_or_else(|| Redirect::to("/login"))
    }
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AdminUser {
    type Rejection = Redirect;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let CurrentUser(user) = CurrentUser::from_request_parts(parts, state).await?;
        if user.is_admin {
            Ok(AdminUser(user))
        } else {
            Err(Redirect::to("/mail"))
        }
    }
}

/// One-shot message carried in the query string after a redirect
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Flash {
    pub success: Option<String>,
    pub error: Option<String>,
}

impl Flash {
    fn success(&self) -> String {
        self.success.clone().unwrap_or_default()
    }

    fn error(&self) -> String {
        self.error.clone().unwrap_or_default()
    }
}

/// `path?key=value&...` with the pairs form-encoded
fn with_query(path: &str, pairs: &[(&str, &str)]) -> String {
    let pairs: Vec<_> = pairs.iter().filter(|(_, v)| !v.is_empty()).collect();
    if pairs.is_empty() {
        return path.to_string();
    }
    let mut url = match reqwest::Url::parse("http://localhost/") {
        Ok(url) => url,
        Err(_) => return path.to_string(),
    };
    {
        let mut query = url.query_pairs_mut();
        for (key, value) in pairs {
            query.append_pair(key, value);
        }
    }
    format!("{}?{}", path, url.query().unwrap_or_default())
}

fn redirect_success(path: &str, message: &str) -> Response {
    Redirect::to(&with_query(path, &[("success", message)])).into_response()
}

fn redirect_error(path: &str, message: &str) -> Response {
    Redirect::to(&with_query(path, &[("error", message)])).into_response()
}

/// Message shown in the UI; internal errors are not echoed
fn user_message(e: &CloudMailError) -> String {
    if status_for(e) == StatusCode::INTERNAL_SERVER_ERROR {
        error!("Request failed: {}", e);
        "Internal error, see the server log".to_string()
    } else {
        e.to_string()
    }
}

fn format_ms(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default()
}

#[derive(Template)]
#[template(path = "error.html")]
struct ErrorTemplate {
    status: u16,
    message: String,
}

fn error_page(status: StatusCode, message: &str) -> Response {
    (
        status,
        ErrorTemplate {
            status: status.as_u16(),
            message: message.to_string(),
        },
    )
        .into_response()
}

fn failure_page(e: CloudMailError) -> Response {
    error_page(status_for(&e), &user_message(&e))
}

// ---------------------------------------------------------------------------
// Login
// ---------------------------------------------------------------------------

#[derive(Template)]
#[template(path = "login.html")]
struct LoginTemplate {
    username: String,
    error: String,
}

#[derive(Deserialize)]
pub struct LoginForm {
    username: String,
    password: String,
}

pub async fn login_page() -> impl IntoResponse {
    LoginTemplate {
        username: String::new(),
        error: String::new(),
    }
}

pub async fn login_submit(
    State(state): State<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Form(form): Form<LoginForm>,
) -> Response {
    let ip = client_ip(&headers, peer.as_ref());
    let outcome = match state
        .authenticator
        .login(&form.username, &form.password, &ip)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => return failure_page(e),
    };

    let status = match &outcome {
        LoginOutcome::Success(user) => {
            let target = if user.is_admin { "/" } else { "/mail" };
            let session = state.sessions.create(user.clone()).await;
            return (
                StatusCode::SEE_OTHER,
                [
                    (header::SET_COOKIE, state.sessions.cookie(&session)),
                    (header::LOCATION, target.to_string()),
                ],
                "Redirecting...",
            )
                .into_response();
        }
        LoginOutcome::Locked { .. } => StatusCode::TOO_MANY_REQUESTS,
        LoginOutcome::Invalid(attempt) if attempt.locked => StatusCode::TOO_MANY_REQUESTS,
        LoginOutcome::Invalid(_) => StatusCode::UNAUTHORIZED,
    };

    (
        status,
        LoginTemplate {
            username: form.username,
            error: outcome.message(),
        },
    )
        .into_response()
}

pub async fn logout(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Some(id) = session_id(&headers) {
        if let Some(user) = state.sessions.remove(&id).await {
            state.authenticator.logout(&user).await;
        }
    }
    (
        StatusCode::SEE_OTHER,
        [
            (header::SET_COOKIE, clear_cookie()),
            (header::LOCATION, "/login".to_string()),
        ],
        "Redirecting...",
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Dashboard
// ---------------------------------------------------------------------------

struct ActivityRow {
    icon: String,
    text: String,
    time: String,
}

impl From<Activity> for ActivityRow {
    fn from(activity: Activity) -> Self {
        Self {
            icon: activity.icon,
            text: activity.text,
            time: format_ms(activity.timestamp),
        }
    }
}

#[derive(Template)]
#[template(path = "dashboard.html")]
struct DashboardTemplate {
    user: AuthUser,
    stats: Stats,
    activities: Vec<ActivityRow>,
    fetch: FetchProgress,
    domains: Vec<String>,
    success: String,
    error: String,
}

pub async fn dashboard(
    State(state): State<Arc<AppState>>,
    AdminUser(user): AdminUser,
    Query(flash): Query<Flash>,
) -> Response {
    let stats = match state.db.stats().await {
        Ok(stats) => stats,
        Err(e) => return failure_page(e),
    };
    let activities = match state.db.recent_activities(RECENT_ACTIVITIES).await {
        Ok(activities) => activities,
        Err(e) => return failure_page(e),
    };

    DashboardTemplate {
        user,
        stats,
        activities: activities.into_iter().map(ActivityRow::from).collect(),
        fetch: state.fetch_status().await,
        domains: state.config.snapshot().await.domains(),
        success: flash.success(),
        error: flash.error(),
    }
    .into_response()
}

pub async fn clear_activities(
    State(state): State<Arc<AppState>>,
    AdminUser(_): AdminUser,
) -> Response {
    match state.db.clear_activities().await {
        Ok(count) => redirect_success("/", &format!("Cleared {} activities", count)),
        Err(e) => redirect_error("/", &user_message(&e)),
    }
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

struct AccountRow {
    id: i64,
    email: String,
    domain: String,
    password: String,
    active: bool,
    notes: String,
    created: String,
    last_accessed: String,
}

impl From<Account> for AccountRow {
    fn from(account: Account) -> Self {
        Self {
            id: account.id,
            active: account.status.is_active(),
            email: account.email,
            domain: account.domain,
            password: account.password.unwrap_or_default(),
            notes: account.notes.unwrap_or_default(),
            created: format_ms(account.created_at),
            last_accessed: account.last_accessed.map(format_ms).unwrap_or_default(),
        }
    }
}

#[derive(Template)]
#[template(path = "accounts.html")]
struct AccountsTemplate {
    user: AuthUser,
    accounts: Vec<AccountRow>,
    domains: Vec<String>,
    filter_domain: String,
    filter_status: String,
    filter_search: String,
    page: i64,
    pages: i64,
    total: i64,
    prev_link: String,
    next_link: String,
    success: String,
    error: String,
}

pub async fn accounts_page(
    State(state): State<Arc<AppState>>,
    AdminUser(user): AdminUser,
    Query(query): Query<AccountListQuery>,
    Query(flash): Query<Flash>,
) -> Response {
    let filter = match query.filter() {
        Ok(filter) => filter,
        Err(e) => return failure_page(e),
    };
    let listing = match state
        .db
        .accounts_paginated(query.page.unwrap_or(1), query.page_size.unwrap_or(20), &filter)
        .await
    {
        Ok(listing) => listing,
        Err(e) => return failure_page(e),
    };

    let filter_domain = query.domain.clone().unwrap_or_default();
    let filter_status = query.status.clone().unwrap_or_default();
    let filter_search = query.search.clone().unwrap_or_default();
    let link = |page: i64| {
        with_query(
            "/accounts",
            &[
                ("domain", filter_domain.as_str()),
                ("status", filter_status.as_str()),
                ("search", filter_search.as_str()),
                ("page", page.to_string().as_str()),
            ],
        )
    };
    let prev_link = if listing.page > 1 { link(listing.page - 1) } else { String::new() };
    let next_link = if listing.page < listing.pages { link(listing.page + 1) } else { String::new() };

    AccountsTemplate {
        user,
        accounts: listing.items.into_iter().map(AccountRow::from).collect(),
        domains: state.config.snapshot().await.domains(),
        filter_domain,
        filter_status,
        filter_search,
        page: listing.page,
        pages: listing.pages,
        total: listing.total,
        prev_link,
        next_link,
        success: flash.success(),
        error: flash.error(),
    }
    .into_response()
}

/// Sync report as JSON for the accounts page script
pub async fn sync_accounts(State(state): State<Arc<AppState>>, AdminUser(_): AdminUser) -> Response {
    match state.sync_routes().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => (status_for(&e), Json(ApiError::new(&user_message(&e)))).into_response(),
    }
}

#[derive(Deserialize)]
pub struct GenerateForm {
    count: usize,
    domain: Option<String>,
}

pub async fn generate_accounts(
    State(state): State<Arc<AppState>>,
    AdminUser(_): AdminUser,
    Form(form): Form<GenerateForm>,
) -> Response {
    match state.generate_accounts(form.count, form.domain.as_deref()).await {
        Ok(report) if report.failures.is_empty() => redirect_success(
            "/accounts",
            &format!("Generated {} accounts", report.accounts.len()),
        ),
        Ok(report) => redirect_error(
            "/accounts",
            &format!(
                "Generated {} accounts, {} failed: {}",
                report.accounts.len(),
                report.failures.len(),
                report.failures.join("; ")
            ),
        ),
        Err(e) => redirect_error("/accounts", &user_message(&e)),
    }
}

#[derive(Deserialize)]
pub struct CreateAccountForm {
    username: String,
    domain: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    notes: Option<String>,
}

pub async fn create_account(
    State(state): State<Arc<AppState>>,
    AdminUser(_): AdminUser,
    Form(form): Form<CreateAccountForm>,
) -> Response {
    match state
        .provision_account(&form.username, &form.domain, form.password, form.notes)
        .await
    {
        Ok(account) => redirect_success("/accounts", &format!("Created {}", account.email)),
        Err(e) => redirect_error("/accounts", &user_message(&e)),
    }
}

pub async fn delete_account(
    State(state): State<Arc<AppState>>,
    AdminUser(_): AdminUser,
    Path(id): Path<i64>,
) -> Response {
    match state.remove_account(id).await {
        Ok(account) => redirect_success("/accounts", &format!("Deleted {}", account.email)),
        Err(e) => redirect_error("/accounts", &user_message(&e)),
    }
}

pub async fn reset_password(
    State(state): State<Arc<AppState>>,
    AdminUser(_): AdminUser,
    Path(id): Path<i64>,
) -> Response {
    match state.reset_password(id).await {
        Ok(account) => redirect_success(
            "/accounts",
            &format!("New password for {}", account.email),
        ),
        Err(e) => redirect_error("/accounts", &user_message(&e)),
    }
}

#[derive(Deserialize)]
pub struct EditAccountForm {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

pub async fn edit_account(
    State(state): State<Arc<AppState>>,
    AdminUser(_): AdminUser,
    Path(id): Path<i64>,
    Form(form): Form<EditAccountForm>,
) -> Response {
    let status = match form.status.as_deref().filter(|s| !s.is_empty()) {
        Some(status) => match status.parse() {
            Ok(status) => Some(status),
            Err(e) => return redirect_error("/accounts", &user_message(&e)),
        },
        None => None,
    };
    let update = AccountUpdate {
        status,
        notes: form.notes,
        password: form.password.filter(|p| !p.is_empty()),
        last_accessed: None,
    };

    match state.change_account(id, update).await {
        Ok(account) => redirect_success("/accounts", &format!("Updated {}", account.email)),
        Err(e) => redirect_error("/accounts", &user_message(&e)),
    }
}

// ---------------------------------------------------------------------------
// Mail
// ---------------------------------------------------------------------------

struct EmailRow {
    id: i64,
    account: String,
    sender: String,
    subject: String,
    preview: String,
    date: String,
    is_read: bool,
    has_attachments: bool,
}

impl From<Email> for EmailRow {
    fn from(email: Email) -> Self {
        Self {
            id: email.id,
            account: email.account,
            sender: email
                .sender_name
                .filter(|n| !n.is_empty())
                .or(email.sender)
                .unwrap_or_default(),
            subject: email.subject.unwrap_or_else(|| "(no subject)".to_string()),
            preview: email.preview.unwrap_or_default(),
            date: format_ms(email.date),
            is_read: email.is_read,
            has_attachments: email.has_attachments,
        }
    }
}

/// Filter fields of the mail page, echoed back into forms and links
#[derive(Default)]
struct MailFilter {
    account: String,
    sender: String,
    subject: String,
    search: String,
    start_date: String,
    end_date: String,
    date: String,
    unread_only: bool,
}

impl MailFilter {
    fn from_query(query: &EmailListQuery) -> Self {
        let text = |v: &Option<String>| v.clone().unwrap_or_default();
        Self {
            account: text(&query.account),
            sender: text(&query.sender),
            subject: text(&query.subject),
            search: text(&query.search),
            start_date: text(&query.start_date),
            end_date: text(&query.end_date),
            date: text(&query.date),
            unread_only: matches!(query.unread_only.as_deref(), Some("true" | "on" | "1")),
        }
    }

    fn link(&self, page: i64) -> String {
        with_query(
            "/mail",
            &[
                ("account", self.account.as_str()),
                ("sender", self.sender.as_str()),
                ("subject", self.subject.as_str()),
                ("search", self.search.as_str()),
                ("startDate", self.start_date.as_str()),
                ("endDate", self.end_date.as_str()),
                ("date", self.date.as_str()),
                ("unreadOnly", if self.unread_only { "true" } else { "" }),
                ("page", page.to_string().as_str()),
            ],
        )
    }
}

#[derive(Template)]
#[template(path = "mail.html")]
struct MailTemplate {
    user: AuthUser,
    emails: Vec<EmailRow>,
    filter: MailFilter,
    page: i64,
    pages: i64,
    total: i64,
    prev_link: String,
    next_link: String,
    success: String,
    error: String,
}

pub async fn mail_page(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<EmailListQuery>,
    Query(flash): Query<Flash>,
) -> Response {
    let listing = match state
        .db
        .emails_paginated(query.page(), query.limit(), &query.filter_for(&user))
        .await
    {
        Ok(listing) => listing,
        Err(e) => return failure_page(e),
    };

    let filter = MailFilter::from_query(&query);
    let prev_link = if listing.page > 1 { filter.link(listing.page - 1) } else { String::new() };
    let next_link = if listing.page < listing.pages { filter.link(listing.page + 1) } else { String::new() };

    MailTemplate {
        user,
        emails: listing.items.into_iter().map(EmailRow::from).collect(),
        filter,
        page: listing.page,
        pages: listing.pages,
        total: listing.total,
        prev_link,
        next_link,
        success: flash.success(),
        error: flash.error(),
    }
    .into_response()
}

#[derive(Template)]
#[template(path = "mail_view.html")]
struct MailViewTemplate {
    user: AuthUser,
    id: i64,
    account: String,
    sender: String,
    sender_name: String,
    subject: String,
    date: String,
    body: String,
    attachments: Vec<Attachment>,
    success: String,
    error: String,
}

pub async fn view_email(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> Response {
    let email = match state.visible_email(&user, id).await {
        Ok(email) => email,
        Err((status, Json(err))) => return error_page(status, &err.error),
    };
    if !email.is_read {
        if let Err(e) = state.db.mark_email_read(id).await {
            return failure_page(e);
        }
    }
    let attachments = match state.db.attachments_for_email(id).await {
        Ok(attachments) => attachments,
        Err(e) => return failure_page(e),
    };

    MailViewTemplate {
        user,
        id: email.id,
        account: email.account,
        sender: email.sender.unwrap_or_default(),
        sender_name: email.sender_name.unwrap_or_default(),
        subject: email.subject.unwrap_or_else(|| "(no subject)".to_string()),
        date: format_ms(email.date),
        body: email.body.unwrap_or_default(),
        attachments,
        success: String::new(),
        error: String::new(),
    }
    .into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct FetchQuery {
    account: Option<String>,
}

pub async fn fetch_mail(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<FetchQuery>,
) -> Response {
    let triggered = state.trigger_fetch(&user, query.account).await;
    redirect_success("/mail", &triggered.message)
}

pub async fn fetch_status(
    State(state): State<Arc<AppState>>,
    CurrentUser(_): CurrentUser,
) -> Json<FetchProgress> {
    Json(state.fetch_status().await)
}

pub async fn fetch_progress(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<FetchQuery>,
) -> Response {
    Json(state.trigger_fetch(&user, query.account).await).into_response()
}

pub async fn download_attachment(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path((email_id, attachment_id)): Path<(i64, i64)>,
) -> Response {
    if let Err((status, Json(err))) = state.visible_email(&user, email_id).await {
        return error_page(status, &err.error);
    }
    let attachment = match state.db.attachment(email_id, attachment_id).await {
        Ok(Some(attachment)) => attachment,
        Ok(None) => return error_page(StatusCode::NOT_FOUND, "Attachment not found"),
        Err(e) => return failure_page(e),
    };

    let path = PathBuf::from(&attachment.path);
    if !state.mail.attachments().contains(&path) {
        return error_page(StatusCode::NOT_FOUND, "Attachment file is missing");
    }
    match tokio::fs::read(&path).await {
        Ok(content) => (
            [
                (header::CONTENT_TYPE, attachment.mime_type.clone()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", sanitize_filename(&attachment.name)),
                ),
            ],
            content,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to read attachment {}: {}", attachment.path, e);
            error_page(StatusCode::NOT_FOUND, "Attachment file is missing")
        }
    }
}

pub async fn mark_all_read(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Form(query): Form<EmailListQuery>,
) -> Response {
    let filter = query.filter_for(&user);
    let back = MailFilter::from_query(&query).link(1);
    match state.db.mark_read_by_filter(&filter).await {
        Ok(count) => Redirect::to(&with_query(
            &back,
            &[("success", format!("Marked {} emails as read", count).as_str())],
        ))
        .into_response(),
        Err(e) => redirect_error("/mail", &user_message(&e)),
    }
}

pub async fn delete_email(
    State(state): State<Arc<AppState>>,
    AdminUser(_): AdminUser,
    Path(id): Path<i64>,
) -> Response {
    match state.db.delete_email(id).await {
        Ok(attachments) => {
            state.mail.attachments().remove(&attachments).await;
            redirect_success("/mail", "Email deleted")
        }
        Err(e) => redirect_error("/mail", &user_message(&e)),
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

struct ZoneRow {
    index: usize,
    domain: String,
    email_forward: String,
    zone_id: String,
}

#[derive(Template)]
#[template(path = "settings.html")]
struct SettingsTemplate {
    user: AuthUser,
    email_user: String,
    mailbox: String,
    fetch_interval: u64,
    imap_enabled: bool,
    imap_host: String,
    imap_port: u16,
    imap_secure: bool,
    proxy_enabled: bool,
    proxy_protocol: String,
    proxy_host: String,
    proxy_port: u16,
    max_attempts: u32,
    lock_minutes: u64,
    zones: Vec<ZoneRow>,
    success: String,
    error: String,
}

pub async fn settings_page(
    State(state): State<Arc<AppState>>,
    AdminUser(user): AdminUser,
    Query(flash): Query<Flash>,
) -> impl IntoResponse {
    let config = state.config.snapshot().await;
    SettingsTemplate {
        user,
        email_user: config.email.user.clone(),
        mailbox: config.email.mailbox.clone(),
        fetch_interval: config.email.fetch_interval,
        imap_enabled: config.email.imap.enabled,
        imap_host: config.email.imap.host.clone(),
        imap_port: config.email.imap.port,
        imap_secure: config.email.imap.secure,
        proxy_enabled: config.proxy.enabled,
        proxy_protocol: config.proxy.protocol.clone(),
        proxy_host: config.proxy.host.clone(),
        proxy_port: config.proxy.port,
        max_attempts: config.login_limiter.max_attempts,
        lock_minutes: config.login_limiter.lock_time_ms / 60_000,
        zones: config
            .cloudflare
            .iter()
            .enumerate()
            .map(|(index, zone)| ZoneRow {
                index,
                domain: zone.bare_domain(),
                email_forward: zone.email_forward.clone(),
                zone_id: zone.zone_id.clone(),
            })
            .collect(),
        success: flash.success(),
        error: flash.error(),
    }
}

fn checked(value: &Option<String>) -> bool {
    matches!(value.as_deref(), Some("on" | "true" | "1"))
}

#[derive(Deserialize)]
pub struct SettingsForm {
    email_user: String,
    /// Left empty to keep the stored password
    #[serde(default)]
    email_pass: String,
    mailbox: String,
    fetch_interval: u64,
    #[serde(default)]
    imap_enabled: Option<String>,
    imap_host: String,
    imap_port: u16,
    #[serde(default)]
    imap_secure: Option<String>,
    #[serde(default)]
    proxy_enabled: Option<String>,
    proxy_protocol: String,
    proxy_host: String,
    proxy_port: u16,
    max_attempts: u32,
    lock_minutes: u64,
}

pub async fn save_settings(
    State(state): State<Arc<AppState>>,
    AdminUser(user): AdminUser,
    Form(form): Form<SettingsForm>,
) -> Response {
    let result = state
        .config
        .update(|config| {
            config.email.user = form.email_user.trim().to_string();
            if !form.email_pass.is_empty() {
                config.email.pass = form.email_pass.clone();
            }
            config.email.mailbox = form.mailbox.trim().to_string();
            config.email.fetch_interval = form.fetch_interval;
            config.email.imap.enabled = checked(&form.imap_enabled);
            config.email.imap.host = form.imap_host.trim().to_string();
            config.email.imap.port = form.imap_port;
            config.email.imap.secure = checked(&form.imap_secure);
            config.proxy.enabled = checked(&form.proxy_enabled);
            config.proxy.protocol = form.proxy_protocol.trim().to_string();
            config.proxy.host = form.proxy_host.trim().to_string();
            config.proxy.port = form.proxy_port;
            config.login_limiter.max_attempts = form.max_attempts;
            config.login_limiter.lock_time_ms = form.lock_minutes * 60_000;
        })
        .await;

    match result {
        Ok(_) => {
            info!("{} updated the settings", user.username);
            state
                .db
                .record_activity(
                    ActivityKind::SettingsUpdate,
                    "Settings updated".to_string(),
                    None,
                    Some(json!({ "by": user.username })),
                )
                .await;
            redirect_success("/admin", "Settings saved")
        }
        Err(e) => redirect_error("/admin", &user_message(&e)),
    }
}

#[derive(Deserialize)]
pub struct ZoneForm {
    domain: String,
    email_forward: String,
    api_token: String,
    zone_id: String,
}

pub async fn add_zone(
    State(state): State<Arc<AppState>>,
    AdminUser(user): AdminUser,
    Form(form): Form<ZoneForm>,
) -> Response {
    let zone = CloudflareZone {
        domain: form.domain.trim().to_string(),
        email_forward: form.email_forward.trim().to_string(),
        api_token: form.api_token.trim().to_string(),
        zone_id: form.zone_id.trim().to_string(),
    };
    let domain = zone.bare_domain();

    let snapshot = state.config.snapshot().await;
    if snapshot.zone_for_domain(&domain).is_some() {
        return redirect_error("/admin", &format!("Domain {} is already configured", domain));
    }

    match state.config.update(|config| config.cloudflare.push(zone)).await {
        Ok(_) => {
            state
                .db
                .record_activity(
                    ActivityKind::SettingsUpdate,
                    format!("Added Cloudflare domain {}", domain),
                    None,
                    Some(json!({ "by": user.username, "domain": domain })),
                )
                .await;
            redirect_success("/admin", &format!("Added {}", domain))
        }
        Err(e) => redirect_error("/admin", &user_message(&e)),
    }
}

pub async fn delete_zone(
    State(state): State<Arc<AppState>>,
    AdminUser(user): AdminUser,
    Path(index): Path<usize>,
) -> Response {
    let snapshot = state.config.snapshot().await;
    let Some(zone) = snapshot.cloudflare.get(index) else {
        return redirect_error("/admin", "No such Cloudflare domain");
    };
    let domain = zone.bare_domain();

    let result = state
        .config
        .update(|config| {
            if index < config.cloudflare.len() {
                config.cloudflare.remove(index);
            }
        })
        .await;
    match result {
        Ok(_) => {
            state
                .db
                .record_activity(
                    ActivityKind::SettingsUpdate,
                    format!("Removed Cloudflare domain {}", domain),
                    None,
                    Some(json!({ "by": user.username, "domain": domain })),
                )
                .await;
            redirect_success("/admin", &format!("Removed {}", domain))
        }
        Err(e) => redirect_error("/admin", &user_message(&e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_query_encodes_and_skips_empty() {
        assert_eq!(with_query("/mail", &[]), "/mail");
        assert_eq!(with_query("/mail", &[("account", "")]), "/mail");
        assert_eq!(
            with_query("/mail", &[("success", "Created a@b.c & more"), ("page", "2")]),
            "/mail?success=Created+a%40b.c+%26+more&page=2"
        );
    }

    #[test]
    fn test_format_ms() {
        assert_eq!(format_ms(1_704_067_200_000), "2024-01-01 00:00");
    }

    #[test]
    fn test_mail_filter_link_keeps_filters() {
        let query = EmailListQuery {
            sender: Some("bob".to_string()),
            unread_only: Some("on".to_string()),
            ..Default::default()
        };
        let filter = MailFilter::from_query(&query);
        assert!(filter.unread_only);
        assert_eq!(filter.link(3), "/mail?sender=bob&unreadOnly=true&page=3");
    }
}
