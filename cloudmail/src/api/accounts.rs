//! Account management: the operations shared by the API and the UI, and the JSON handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::handlers::{api_error, require_admin, reject, ApiResult, AppState};
use crate::auth::Claims;
use crate::cloudflare::{sync_accounts, SyncReport};
use crate::error::{CloudMailError, Result};
use crate::store::{Account, AccountFilter, AccountStatus, AccountUpdate, ActivityKind, NewAccount, Paginated};

const MAX_GENERATE: usize = 10;

/// Usernames are limited to `[A-Za-z0-9_-]+`
pub fn valid_username(username: &str) -> bool {
    !username.is_empty()
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Accounts created by one generate request
#[derive(Debug, Serialize)]
pub struct GenerateReport {
    pub accounts: Vec<Account>,
    pub failures: Vec<String>,
}

impl AppState {
    /// Register a route for `username@domain`, then store the account.
    ///
    /// The route is removed again when the account cannot be stored.
    pub async fn provision_account(
        &self,
        username: &str,
        domain: &str,
        password: Option<String>,
        notes: Option<String>,
    ) -> Result<Account> {
        let username = username.trim().to_lowercase();
        if !valid_username(&username) {
            return Err(CloudMailError::Validation(
                "username may only contain letters, digits, '_' and '-'".to_string(),
            ));
        }

        let config = self.config.snapshot().await;
        let zone = config
            .zone_for_domain(domain)
            .ok_or_else(|| CloudMailError::Validation(format!("domain {} is not configured", domain)))?;
        let domain = zone.bare_domain();
        let email = format!("{}@{}", username, domain);

        if self.db.account_by_email(&email).await?.is_some() {
            return Err(CloudMailError::Validation(format!("account {} already exists", email)));
        }

        let route_id = self.routes.create_route(&email).await?;
        let account = NewAccount {
            email: email.clone(),
            username,
            domain: domain.clone(),
            password: password.filter(|p| !p.is_empty()),
            status: AccountStatus::Active,
            notes: notes.filter(|n| !n.trim().is_empty()),
        };

        match self.db.create_account(account).await {
            Ok(account) => {
                info!("Provisioned {} (route {})", email, route_id);
                Ok(account)
            }
            Err(e) => {
                if let Err(cleanup) = self.routes.remove_route(&route_id, &domain).await {
                    error!("Failed to roll back route {} for {}: {}", route_id, email, cleanup);
                }
                Err(e)
            }
        }
    }

    /// Generate `count` accounts on `domain`, or on random configured domains when `None`.
    pub async fn generate_accounts(&self, count: usize, domain: Option<&str>) -> Result<GenerateReport> {
        if count == 0 || count > MAX_GENERATE {
            return Err(CloudMailError::Validation(format!(
                "count must be between 1 and {}",
                MAX_GENERATE
            )));
        }

        let domains = match domain.filter(|d| !d.is_empty() && *d != "random") {
            Some(domain) => vec![domain.to_string()],
            None => self.routes.virtual_domains().await,
        };

        let mut report = GenerateReport {
            accounts: Vec::new(),
            failures: Vec::new(),
        };
        for _ in 0..count {
            let generated = self.generator.generate(&domains)?;
            match self
                .provision_account(
                    &generated.username,
                    &generated.domain,
                    Some(generated.password),
                    Some(format!("{} {}", generated.first_name, generated.last_name)),
                )
                .await
            {
                Ok(account) => report.accounts.push(account),
                Err(e) => {
                    warn!("Failed to generate {}: {}", generated.email, e);
                    report.failures.push(format!("{}: {}", generated.email, e));
                }
            }
        }

        if !report.accounts.is_empty() {
            self.db
                .record_activity(
                    ActivityKind::AccountGenerate,
                    format!("Generated {} accounts", report.accounts.len()),
                    None,
                    Some(json!({
                        "emails": report.accounts.iter().map(|a| a.email.as_str()).collect::<Vec<_>>(),
                        "failures": report.failures.len(),
                    })),
                )
                .await;
        }
        Ok(report)
    }

    /// Apply an edit; a status change flips the route first.
    pub async fn change_account(&self, id: i64, update: AccountUpdate) -> Result<Account> {
        let account = self
            .db
            .account_by_id(id)
            .await?
            .ok_or_else(|| CloudMailError::NotFound(format!("account {}", id)))?;

        if let Some(status) = update.status.filter(|s| *s != account.status) {
            match self.routes.set_route_enabled(&account.email, status.is_active()).await {
                Ok(_) => {}
                Err(CloudMailError::NotFound(_)) => {
                    warn!("No route for {}, updating local status only", account.email)
                }
                Err(e) => return Err(e),
            }
        }

        self.db.update_account(id, update).await
    }

    /// Remove the route (when there is one), the account and its attachment files.
    pub async fn remove_account(&self, id: i64) -> Result<Account> {
        let account = self
            .db
            .account_by_id(id)
            .await?
            .ok_or_else(|| CloudMailError::NotFound(format!("account {}", id)))?;

        match self.routes.find_route(&account.email).await? {
            Some(route) => self.routes.remove_route(&route.id, &account.domain).await?,
            None => warn!("No route for {}", account.email),
        }

        let account = self.db.delete_account(id).await?;
        self.mail.attachments().remove_account(&account.email).await;
        info!("Removed account {}", account.email);
        Ok(account)
    }

    pub async fn reset_password(&self, id: i64) -> Result<Account> {
        self.db.reset_account_password(id).await
    }

    pub async fn sync_routes(&self) -> Result<SyncReport> {
        sync_accounts(&self.db, self.routes.as_ref()).await
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AccountListQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub domain: Option<String>,
    pub status: Option<String>,
    pub search: Option<String>,
}

impl AccountListQuery {
    pub fn filter(&self) -> Result<AccountFilter> {
        let status = match self.status.as_deref().filter(|s| !s.is_empty()) {
            Some(status) => Some(status.parse::<AccountStatus>()?),
            None => None,
        };
        Ok(AccountFilter {
            domain: self.domain.clone(),
            status,
            search: self.search.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    pub username: String,
    pub domain: String,
    pub password: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub count: usize,
    pub domain: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateAccountRequest {
    pub status: Option<AccountStatus>,
    pub notes: Option<String>,
    pub password: Option<String>,
}

impl From<UpdateAccountRequest> for AccountUpdate {
    fn from(req: UpdateAccountRequest) -> Self {
        AccountUpdate {
            status: req.status,
            notes: req.notes,
            password: req.password.filter(|p| !p.is_empty()),
            last_accessed: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AccountResponse {
    pub success: bool,
    pub account: Account,
}

#[derive(Debug, Serialize)]
pub struct AccountListResponse {
    pub success: bool,
    #[serde(flatten)]
    pub page: Paginated<Account>,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub success: bool,
    #[serde(flatten)]
    pub report: GenerateReport,
}

fn account_response(account: Account) -> Json<AccountResponse> {
    Json(AccountResponse {
        success: true,
        account,
    })
}

/// GET /api/accounts
pub async fn list_accounts(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Query(query): Query<AccountListQuery>,
) -> ApiResult<Json<AccountListResponse>> {
    require_admin(&claims)?;

    let filter = query.filter().map_err(api_error)?;
    let page = state
        .db
        .accounts_paginated(query.page.unwrap_or(1), query.page_size.unwrap_or(20), &filter)
        .await
        .map_err(api_error)?;

    Ok(Json(AccountListResponse {
        success: true,
        page,
    }))
}

/// GET /api/accounts/:id
pub async fn get_account(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Path(id): Path<i64>,
) -> ApiResult<Json<AccountResponse>> {
    require_admin(&claims)?;

    match state.db.account_by_id(id).await.map_err(api_error)? {
        Some(account) => Ok(account_response(account)),
        None => Err(reject(StatusCode::NOT_FOUND, "Account not found")),
    }
}

/// POST /api/accounts
pub async fn create_account(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Json(req): Json<CreateAccountRequest>,
) -> ApiResult<(StatusCode, Json<AccountResponse>)> {
    require_admin(&claims)?;
    info!("Admin: creating account {}@{}", req.username, req.domain);

    let account = state
        .provision_account(&req.username, &req.domain, req.password, req.notes)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, account_response(account)))
}

/// POST /api/accounts/generate
pub async fn generate_accounts(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Json(req): Json<GenerateRequest>,
) -> ApiResult<Json<GenerateResponse>> {
    require_admin(&claims)?;

    let report = state
        .generate_accounts(req.count, req.domain.as_deref())
        .await
        .map_err(api_error)?;
    Ok(Json(GenerateResponse {
        success: true,
        report,
    }))
}

/// PUT /api/accounts/:id
pub async fn update_account(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Path(id): Path<i64>,
    Json(req): Json<UpdateAccountRequest>,
) -> ApiResult<Json<AccountResponse>> {
    require_admin(&claims)?;

    let account = state
        .change_account(id, req.into())
        .await
        .map_err(api_error)?;
    Ok(account_response(account))
}

/// DELETE /api/accounts/:id
pub async fn delete_account(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&claims)?;

    let account = state.remove_account(id).await.map_err(api_error)?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Account {} deleted", account.email),
    })))
}

/// POST /api/accounts/:id/reset-password
pub async fn reset_password(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Path(id): Path<i64>,
) -> ApiResult<Json<AccountResponse>> {
    require_admin(&claims)?;

    let account = state.reset_password(id).await.map_err(api_error)?;
    Ok(account_response(account))
}

/// POST /api/accounts/sync
pub async fn sync(
    State(state): State<Arc<AppState>>,
    claims: Claims,
) -> ApiResult<Json<SyncReport>> {
    require_admin(&claims)?;

    let report = state.sync_routes().await.map_err(api_error)?;
    Ok(Json(report))
}
