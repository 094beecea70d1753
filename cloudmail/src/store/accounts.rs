//! Account queries

use serde_json::json;
use sqlx::{QueryBuilder, Sqlite};

use super::{
    now_ms, page_bounds, Account, AccountFilter, AccountStatus, AccountUpdate, ActivityKind,
    Database, NewAccount, Paginated,
};
use crate::error::{CloudMailError, Result};
use crate::generator::random_password;

const ACCOUNT_COLUMNS: &str =
    "id, email, username, domain, password, created_at, last_accessed, status, notes";

fn push_account_filters(qb: &mut QueryBuilder<'_, Sqlite>, filter: &AccountFilter) {
    qb.push(" WHERE 1 = 1");
    if let Some(domain) = filter.domain.as_deref().filter(|d| !d.is_empty()) {
        qb.push(" AND domain = ")
            .push_bind(domain.trim_start_matches('@').to_lowercase());
    }
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(search) = filter.search.as_deref().filter(|s| !s.is_empty()) {
        let pattern = format!("%{}%", search);
        qb.push(" AND (email LIKE ")
            .push_bind(pattern.clone())
            .push(" OR username LIKE ")
            .push_bind(pattern.clone())
            .push(" OR notes LIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

impl Database {
    pub async fn all_accounts(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts ORDER BY created_at DESC, id DESC",
            ACCOUNT_COLUMNS
        ))
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn active_accounts(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts WHERE status = 'active' ORDER BY id",
            ACCOUNT_COLUMNS
        ))
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn accounts_paginated(
        &self,
        page: i64,
        page_size: i64,
        filter: &AccountFilter,
    ) -> Result<Paginated<Account>> {
        let (page, page_size, offset) = page_bounds(page, page_size);

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM accounts");
        push_account_filters(&mut count, filter);
        let (total,) = count.build_query_as::<(i64,)>().fetch_one(self.pool()).await?;

        let mut select = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM accounts",
            ACCOUNT_COLUMNS
        ));
        push_account_filters(&mut select, filter);
        select
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(page_size)
            .push(" OFFSET ")
            .push_bind(offset);
        let items = select
            .build_query_as::<Account>()
            .fetch_all(self.pool())
            .await?;

        Ok(Paginated::new(items, total, page, page_size))
    }

    pub async fn account_by_id(&self, id: i64) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts WHERE id = ?",
            ACCOUNT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn account_by_email(&self, email: &str) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts WHERE email = ?",
            ACCOUNT_COLUMNS
        ))
        .bind(email.trim().to_lowercase())
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// Store a new account. A missing password is generated.
    pub async fn create_account(&self, account: NewAccount) -> Result<Account> {
        let email = account.email.trim().to_lowercase();
        if !email.contains('@') || account.username.trim().is_empty() {
            return Err(CloudMailError::Validation(format!(
                "invalid account address: {}",
                account.email
            )));
        }
        if self.account_by_email(&email).await?.is_some() {
            return Err(CloudMailError::Validation(format!(
                "account {} already exists",
                email
            )));
        }

        let password = account
            .password
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| random_password(12));
        let domain = account.domain.trim().trim_start_matches('@').to_lowercase();

        let result = sqlx::query(
            r#"
            INSERT INTO accounts (email, username, domain, password, created_at, status, notes)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&email)
        .bind(account.username.trim())
        .bind(&domain)
        .bind(&password)
        .bind(now_ms())
        .bind(account.status.as_str())
        .bind(&account.notes)
        .execute(self.pool())
        .await?;

        let id = result.last_insert_rowid();
        self.record_activity(
            ActivityKind::AccountCreate,
            format!("Created account {}", email),
            Some(id.to_string()),
            Some(json!({ "email": email, "status": account.status })),
        )
        .await;

        self.account_by_id(id)
            .await?
            .ok_or_else(|| CloudMailError::NotFound(format!("account {}", id)))
    }

    /// Apply the set fields of `update`
    pub async fn update_account(&self, id: i64, update: AccountUpdate) -> Result<Account> {
        let existing = self
            .account_by_id(id)
            .await?
            .ok_or_else(|| CloudMailError::NotFound(format!("account {}", id)))?;

        if update.is_empty() {
            return Ok(existing);
        }

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE accounts SET ");
        {
            let mut fields = qb.separated(", ");
            if let Some(status) = update.status {
                fields.push("status = ").push_bind_unseparated(status.as_str());
            }
            if let Some(notes) = &update.notes {
                fields.push("notes = ").push_bind_unseparated(notes.clone());
            }
            if let Some(password) = &update.password {
                fields.push("password = ").push_bind_unseparated(password.clone());
            }
            if let Some(last_accessed) = update.last_accessed {
                fields
                    .push("last_accessed = ")
                    .push_bind_unseparated(last_accessed);
            }
        }
        qb.push(" WHERE id = ").push_bind(id);
        qb.build().execute(self.pool()).await?;

        if let Some(status) = update.status.filter(|s| *s != existing.status) {
            self.record_activity(
                ActivityKind::AccountUpdate,
                format!("Account {} is now {}", existing.email, status),
                Some(id.to_string()),
                Some(json!({ "from": existing.status, "to": status })),
            )
            .await;
        }
        if update.password.is_some() {
            self.record_activity(
                ActivityKind::AccountPassword,
                format!("Password changed for {}", existing.email),
                Some(id.to_string()),
                None,
            )
            .await;
        }

        self.account_by_id(id)
            .await?
            .ok_or_else(|| CloudMailError::NotFound(format!("account {}", id)))
    }

    pub async fn set_account_status(&self, id: i64, status: AccountStatus) -> Result<Account> {
        self.update_account(
            id,
            AccountUpdate {
                status: Some(status),
                ..Default::default()
            },
        )
        .await
    }

    /// Replace the password with a generated one, returning the updated account
    pub async fn reset_account_password(&self, id: i64) -> Result<Account> {
        self.update_account(
            id,
            AccountUpdate {
                password: Some(random_password(12)),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn touch_account(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE accounts SET last_accessed = ? WHERE id = ?")
            .bind(now_ms())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Delete an account; its emails and attachment rows go with it.
    pub async fn delete_account(&self, id: i64) -> Result<Account> {
        let account = self
            .account_by_id(id)
            .await?
            .ok_or_else(|| CloudMailError::NotFound(format!("account {}", id)))?;

        sqlx::query("DELETE FROM accounts WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;

        self.record_activity(
            ActivityKind::AccountDelete,
            format!("Deleted account {}", account.email),
            Some(id.to_string()),
            None,
        )
        .await;
        Ok(account)
    }
}
