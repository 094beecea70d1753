//! Authentication: credential checks, login limiting, JWTs for the API and cookie
//! sessions for the UI

pub mod jwt;
pub mod limiter;
pub mod login;
pub mod session;

pub use jwt::{Claims, JwtConfig};
pub use limiter::{AttemptOutcome, LockStatus, LoginLimiter};
pub use login::{Authenticator, LoginOutcome};
pub use session::{SessionStore, SESSION_COOKIE};

use serde::Serialize;

use crate::store::Account;

/// A logged-in user: either the configured admin or an account holder
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthUser {
    /// Account id, `0` for the admin
    pub id: i64,
    /// Account address; the username for the admin
    pub email: String,
    pub username: String,
    pub is_admin: bool,
}

impl AuthUser {
    pub fn admin(username: &str) -> Self {
        Self {
            id: 0,
            email: username.to_string(),
            username: username.to_string(),
            is_admin: true,
        }
    }

    pub fn from_account(account: &Account) -> Self {
        Self {
            id: account.id,
            email: account.email.clone(),
            username: account.username.clone(),
            is_admin: false,
        }
    }

    /// Whether this user may read mail delivered to `account`
    pub fn can_access(&self, account: &str) -> bool {
        self.is_admin || self.email.eq_ignore_ascii_case(account)
    }
}
