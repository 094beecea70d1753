//! Credential check shared by the UI and API logins

use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

use super::limiter::{AttemptOutcome, LoginLimiter};
use super::AuthUser;
use crate::config::ConfigHandle;
use crate::error::Result;
use crate::store::{ActivityKind, Database};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Success(AuthUser),
    /// The identifier was already locked; nothing was checked
    Locked { remaining: Duration },
    /// Wrong credentials; the attempt may have triggered a lock
    Invalid(AttemptOutcome),
}

fn minutes(ms: u64) -> u64 {
    (ms + 59_999) / 60_000
}

impl LoginOutcome {
    /// Message shown to the user for a rejected login
    pub fn message(&self) -> String {
        match self {
            LoginOutcome::Success(_) => String::new(),
            LoginOutcome::Locked { remaining } => format!(
                "Too many failed attempts, try again in {} minutes",
                minutes(remaining.as_millis() as u64)
            ),
            LoginOutcome::Invalid(attempt) if attempt.locked => format!(
                "Too many failed attempts, login locked for {} minutes",
                minutes(attempt.lock_time)
            ),
            LoginOutcome::Invalid(attempt) => format!(
                "Invalid username or password, {} attempts remaining",
                attempt.remaining_attempts
            ),
        }
    }
}

#[derive(Clone)]
pub struct Authenticator {
    db: Database,
    config: ConfigHandle,
    limiter: LoginLimiter,
}

impl Authenticator {
    pub fn new(db: Database, config: ConfigHandle, limiter: LoginLimiter) -> Self {
        Self {
            db,
            config,
            limiter,
        }
    }

    pub fn limiter(&self) -> &LoginLimiter {
        &self.limiter
    }

    /// Check `username`/`password` from `client_ip`.
    ///
    /// The admin credentials come from the configuration; everyone else logs in with an
    /// active account's address and password.
    pub async fn login(&self, username: &str, password: &str, client_ip: &str) -> Result<LoginOutcome> {
        let username = username.trim();
        let id = LoginLimiter::identifier(username, client_ip);

        let status = self.limiter.is_locked(&id).await;
        if status.locked {
            warn!("Blocked login for {} from {}", username, client_ip);
            self.db
                .record_activity(
                    ActivityKind::LoginBlocked,
                    format!("Blocked login attempt for {}", username),
                    None,
                    Some(json!({ "ip": client_ip, "remainingMinutes": status.remaining_minutes() })),
                )
                .await;
            return Ok(LoginOutcome::Locked {
                remaining: status.remaining,
            });
        }

        if let Some(user) = self.check_credentials(username, password).await? {
            self.limiter.reset_attempts(&id).await;
            if !user.is_admin {
                self.db.touch_account(user.id).await?;
            }
            self.db
                .record_activity(
                    ActivityKind::UserLogin,
                    format!("{} logged in", user.username),
                    (!user.is_admin).then(|| user.id.to_string()),
                    Some(json!({ "ip": client_ip, "admin": user.is_admin })),
                )
                .await;
            info!("{} logged in from {}", user.email, client_ip);
            return Ok(LoginOutcome::Success(user));
        }

        let attempt = self.limiter.record_failed_attempt(&id).await;
        self.db
            .record_activity(
                ActivityKind::LoginFailed,
                format!("Failed login for {}", username),
                None,
                Some(json!({
                    "ip": client_ip,
                    "remainingAttempts": attempt.remaining_attempts,
                    "locked": attempt.locked,
                })),
            )
            .await;
        warn!("Failed login for {} from {}", username, client_ip);
        Ok(LoginOutcome::Invalid(attempt))
    }

    async fn check_credentials(&self, username: &str, password: &str) -> Result<Option<AuthUser>> {
        if password.is_empty() {
            return Ok(None);
        }

        let admin = self.config.snapshot().await.admin;
        if username == admin.username && password == admin.password {
            return Ok(Some(AuthUser::admin(&admin.username)));
        }

        let Some(account) = self.db.account_by_email(username).await? else {
            return Ok(None);
        };
        let password_matches = account.password.as_deref() == Some(password);
        if !password_matches || !account.status.is_active() {
            return Ok(None);
        }
        Ok(Some(AuthUser::from_account(&account)))
    }

    pub async fn logout(&self, user: &AuthUser) {
        self.db
            .record_activity(
                ActivityKind::UserLogout,
                format!("{} logged out", user.username),
                (!user.is_admin).then(|| user.id.to_string()),
                None,
            )
            .await;
    }
}
