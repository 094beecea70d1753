//! JWT authentication for the JSON API

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::AuthUser;
use crate::config::JwtSettings;
use crate::error::Result;

/// JWT Claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the account address, or the admin username
    pub sub: String,
    /// Account id, `0` for the admin
    pub id: i64,
    pub username: String,
    pub is_admin: bool,
    /// Issued at (Unix timestamp)
    pub iat: u64,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

impl Claims {
    pub fn user(&self) -> AuthUser {
        AuthUser {
            id: self.id,
            email: self.sub.clone(),
            username: self.username.clone(),
            is_admin: self.is_admin,
        }
    }
}

/// JWT configuration
#[derive(Clone)]
pub struct JwtConfig {
    /// Secret key for signing tokens
    secret: String,
    /// Token expiration duration
    expiration: Duration,
}

impl JwtConfig {
    pub fn new(secret: impl Into<String>, expiration: Duration) -> Self {
        Self {
            secret: secret.into(),
            expiration,
        }
    }

    pub fn from_settings(settings: &JwtSettings) -> Result<Self> {
        Ok(Self::new(settings.secret.clone(), settings.expiration()?))
    }

    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    /// Create a new JWT token for a user
    pub fn create_token(&self, user: &AuthUser) -> Result<String> {
        let now = Utc::now().timestamp().max(0) as u64;

        let claims = Claims {
            sub: user.email.clone(),
            id: user.id,
            username: user.username.clone(),
            is_admin: user.is_admin,
            iat: now,
            exp: now + self.expiration.as_secs(),
        };

        Ok(encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )?)
    }

    /// Validate a JWT token and extract claims
    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )?;

        Ok(token_data.claims)
    }

    /// Issue a fresh token for the holder of a valid one
    pub fn refresh_token(&self, token: &str) -> Result<String> {
        let claims = self.validate_token(token)?;
        self.create_token(&claims.user())
    }
}
