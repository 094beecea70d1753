//! Row types and query parameters for the persistence layer

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CloudMailError;

/// Account lifecycle state, mirrored from the Cloudflare route's `enabled` flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Inactive,
}

impl AccountStatus {
    pub fn from_enabled(enabled: bool) -> Self {
        if enabled {
            AccountStatus::Active
        } else {
            AccountStatus::Inactive
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, AccountStatus::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Inactive => "inactive",
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountStatus {
    type Err = CloudMailError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "active" => Ok(AccountStatus::Active),
            "inactive" => Ok(AccountStatus::Inactive),
            other => Err(CloudMailError::Validation(format!(
                "invalid account status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Account {
    pub id: i64,
    pub email: String,
    pub username: String,
    pub domain: String,
    pub password: Option<String>,
    /// Unix milliseconds
    pub created_at: i64,
    pub last_accessed: Option<i64>,
    pub status: AccountStatus,
    pub notes: Option<String>,
}

/// Fields for inserting an account. A missing password is generated.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub email: String,
    pub username: String,
    pub domain: String,
    pub password: Option<String>,
    pub status: AccountStatus,
    pub notes: Option<String>,
}

impl NewAccount {
    /// Split `email` into username and domain
    pub fn from_email(email: &str) -> Option<Self> {
        let email = email.trim().to_lowercase();
        let (username, domain) = email.split_once('@')?;
        if username.is_empty() || domain.is_empty() {
            return None;
        }
        Some(Self {
            username: username.to_string(),
            domain: domain.to_string(),
            email: email.clone(),
            password: None,
            status: AccountStatus::Active,
            notes: None,
        })
    }
}

/// Editable account fields; `None` leaves the column untouched
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountUpdate {
    pub status: Option<AccountStatus>,
    pub notes: Option<String>,
    pub password: Option<String>,
    pub last_accessed: Option<i64>,
}

impl AccountUpdate {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.notes.is_none()
            && self.password.is_none()
            && self.last_accessed.is_none()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountFilter {
    pub domain: Option<String>,
    pub status: Option<AccountStatus>,
    /// Matches email, username or notes
    pub search: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Email {
    pub id: i64,
    pub account: String,
    pub message_id: Option<String>,
    pub sender: Option<String>,
    pub sender_name: Option<String>,
    pub subject: Option<String>,
    pub preview: Option<String>,
    pub body: Option<String>,
    /// Unix milliseconds
    pub date: i64,
    pub is_read: bool,
    pub has_attachments: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default)]
pub struct NewEmail {
    pub account: String,
    pub message_id: String,
    pub sender: Option<String>,
    pub sender_name: Option<String>,
    pub subject: Option<String>,
    pub preview: Option<String>,
    pub body: Option<String>,
    pub date: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Attachment {
    pub id: i64,
    pub email_id: i64,
    pub name: String,
    pub size: i64,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub mime_type: String,
    #[serde(skip_serializing)]
    pub path: String,
    pub created_at: i64,
}

/// Attachment already written to disk, waiting for its row
#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub name: String,
    pub size: i64,
    pub mime_type: String,
    pub path: String,
}

/// Relative date window for email listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatePreset {
    Today,
    Week,
    Month,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmailFilter {
    /// Substring of the account address
    pub account: Option<String>,
    /// Exact account address; used to confine non-admin users
    #[serde(skip)]
    pub owner: Option<String>,
    pub sender: Option<String>,
    pub subject: Option<String>,
    pub is_read: Option<bool>,
    pub has_attachments: Option<bool>,
    /// Unix milliseconds, inclusive
    pub start_date: Option<i64>,
    pub end_date: Option<i64>,
    pub date: Option<DatePreset>,
    /// Matches subject, sender, sender name or preview
    pub search: Option<String>,
}

/// Result of [`Database::save_email`](crate::store::Database::save_email)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved(i64),
    Duplicate,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Activity {
    pub id: i64,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: String,
    pub icon: String,
    pub text: String,
    pub timestamp: i64,
    pub related_id: Option<String>,
    pub details: Option<String>,
}

/// Audit log event kinds, each with its fixed icon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    AccountCreate,
    AccountUpdate,
    AccountPassword,
    AccountDelete,
    AccountGenerate,
    AccountSync,
    EmailCheck,
    EmailDelete,
    EmailBatchRead,
    UserLogin,
    UserLogout,
    LoginFailed,
    LoginBlocked,
    SettingsUpdate,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::AccountCreate => "account_create",
            ActivityKind::AccountUpdate => "account_update",
            ActivityKind::AccountPassword => "account_password",
            ActivityKind::AccountDelete => "account_delete",
            ActivityKind::AccountGenerate => "account_generate",
            ActivityKind::AccountSync => "account_sync",
            ActivityKind::EmailCheck => "email_check",
            ActivityKind::EmailDelete => "email_delete",
            ActivityKind::EmailBatchRead => "email_batch_read",
            ActivityKind::UserLogin => "user_login",
            ActivityKind::UserLogout => "user_logout",
            ActivityKind::LoginFailed => "login_failed",
            ActivityKind::LoginBlocked => "login_blocked",
            ActivityKind::SettingsUpdate => "settings_update",
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            ActivityKind::AccountCreate => "person-plus",
            ActivityKind::AccountUpdate => "gear",
            ActivityKind::AccountPassword => "key",
            ActivityKind::AccountDelete => "person-dash",
            ActivityKind::AccountGenerate => "magic",
            ActivityKind::AccountSync => "cloud-arrow-down",
            ActivityKind::EmailCheck => "arrow-repeat",
            ActivityKind::EmailDelete => "trash",
            ActivityKind::EmailBatchRead => "check2-all",
            ActivityKind::UserLogin => "box-arrow-in-right",
            ActivityKind::UserLogout => "box-arrow-right",
            ActivityKind::LoginFailed => "shield-exclamation",
            ActivityKind::LoginBlocked => "shield-lock",
            ActivityKind::SettingsUpdate => "sliders",
        }
    }
}

/// One page of a listing
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
    pub pages: i64,
}

impl<T> Paginated<T> {
    pub fn new(items: Vec<T>, total: i64, page: i64, page_size: i64) -> Self {
        let pages = if page_size > 0 {
            (total + page_size - 1) / page_size
        } else {
            0
        };
        Self {
            items,
            total,
            page,
            page_size,
            pages,
        }
    }
}

/// Counters shown on the dashboard
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub accounts: i64,
    pub active_accounts: i64,
    pub emails: i64,
    pub unread_emails: i64,
}
