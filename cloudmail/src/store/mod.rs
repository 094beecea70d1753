//! SQLite persistence: accounts, emails, attachments and the activity log

mod accounts;
mod activities;
mod emails;
pub mod types;

pub use types::{
    Account, AccountFilter, AccountStatus, AccountUpdate, Activity, ActivityKind, Attachment,
    DatePreset, Email, EmailFilter, NewAccount, NewAttachment, NewEmail, Paginated, SaveOutcome,
    Stats,
};

use crate::error::Result;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;

/// Current time in Unix milliseconds, the unit of every stored timestamp
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Strip angle brackets and whitespace so `<id@x>`, ` id@x ` and `id@x` compare equal.
pub fn normalize_message_id(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c != '<' && *c != '>' && !c.is_whitespace())
        .collect()
}

/// Page numbers start at 1; page sizes are clamped to `1..=100`.
pub(crate) fn page_bounds(page: i64, page_size: i64) -> (i64, i64, i64) {
    let page = page.max(1);
    let page_size = page_size.clamp(1, 100);
    (page, page_size, (page - 1) * page_size)
}

/// Handle on the console database
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let filename = options.clone().get_filename();
        if let Some(parent) = filename.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        info!("Connected to database {}", url);
        Ok(Self::new(pool))
    }

    /// Single-connection in-memory database, used by tests and dry runs.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let db = Self::new(pool);
        db.init_db().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables and indexes
    pub async fn init_db(&self) -> Result<()> {
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL UNIQUE,
                username TEXT NOT NULL,
                domain TEXT NOT NULL,
                password TEXT,
                created_at INTEGER NOT NULL,
                last_accessed INTEGER,
                status TEXT NOT NULL DEFAULT 'active',
                notes TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS emails (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account TEXT NOT NULL,
                message_id TEXT,
                sender TEXT,
                sender_name TEXT,
                subject TEXT,
                preview TEXT,
                body TEXT,
                date INTEGER NOT NULL,
                is_read INTEGER NOT NULL DEFAULT 0,
                has_attachments INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (account) REFERENCES accounts(email) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS email_attachments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                size INTEGER NOT NULL,
                type TEXT NOT NULL,
                path TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (email_id) REFERENCES emails(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS activities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                type TEXT NOT NULL,
                icon TEXT NOT NULL,
                text TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                related_id TEXT,
                details TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_emails_account_message ON emails(account, message_id)",
            "CREATE INDEX IF NOT EXISTS idx_emails_date ON emails(date)",
            "CREATE INDEX IF NOT EXISTS idx_attachments_email ON email_attachments(email_id)",
            "CREATE INDEX IF NOT EXISTS idx_activities_timestamp ON activities(timestamp)",
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<Stats> {
        let (accounts, active_accounts): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN status = 'active' THEN 1 ELSE 0 END), 0) FROM accounts",
        )
        .fetch_one(&self.pool)
        .await?;

        let (emails, unread_emails): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN is_read = 0 THEN 1 ELSE 0 END), 0) FROM emails",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(Stats {
            accounts,
            active_accounts,
            emails,
            unread_emails,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_message_id() {
        assert_eq!(normalize_message_id("<abc@x>"), "abc@x");
        assert_eq!(normalize_message_id(" abc@x "), "abc@x");
        assert_eq!(normalize_message_id("abc@x"), "abc@x");
        assert_eq!(normalize_message_id("< abc@x >\r\n"), "abc@x");
    }

    #[test]
    fn test_page_bounds() {
        assert_eq!(page_bounds(0, 20), (1, 20, 0));
        assert_eq!(page_bounds(3, 20), (3, 20, 40));
        assert_eq!(page_bounds(1, 1000), (1, 100, 0));
        assert_eq!(page_bounds(2, 0), (2, 1, 1));
    }

    #[test]
    fn test_paginated_pages() {
        let page: Paginated<i32> = Paginated::new(vec![], 41, 1, 20);
        assert_eq!(page.pages, 3);
        let empty: Paginated<i32> = Paginated::new(vec![], 0, 1, 20);
        assert_eq!(empty.pages, 0);
    }

    #[tokio::test]
    async fn test_init_db_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        db.init_db().await.unwrap();
        db.health_check().await.unwrap();

        let stats = db.stats().await.unwrap();
        assert_eq!(stats.accounts, 0);
        assert_eq!(stats.emails, 0);
    }
}
