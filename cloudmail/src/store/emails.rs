//! Email and attachment queries

use chrono::{Duration, Utc};
use serde_json::json;
use sqlx::{QueryBuilder, Sqlite};

use super::{
    normalize_message_id, now_ms, page_bounds, ActivityKind, Attachment, Database, DatePreset,
    Email, EmailFilter, NewAttachment, NewEmail, Paginated, SaveOutcome,
};
use crate::error::{CloudMailError, Result};

const EMAIL_COLUMNS: &str = "id, account, message_id, sender, sender_name, subject, preview, body, \
     date, is_read, has_attachments, created_at";

const ATTACHMENT_COLUMNS: &str = "id, email_id, name, size, type, path, created_at";

impl DatePreset {
    /// Lower bound, in Unix milliseconds, of the window ending now
    pub fn since_ms(&self) -> i64 {
        let now = Utc::now();
        let since = match self {
            DatePreset::Today => now
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .map(|d| d.and_utc())
                .unwrap_or(now),
            DatePreset::Week => now - Duration::days(7),
            DatePreset::Month => now - Duration::days(30),
        };
        since.timestamp_millis()
    }
}

fn push_email_filters(qb: &mut QueryBuilder<'_, Sqlite>, filter: &EmailFilter) {
    qb.push(" WHERE 1 = 1");

    let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.trim().is_empty());

    if let Some(owner) = non_empty(&filter.owner) {
        qb.push(" AND account = ").push_bind(owner.to_lowercase());
    }
    if let Some(account) = non_empty(&filter.account) {
        qb.push(" AND account LIKE ")
            .push_bind(format!("%{}%", account.to_lowercase()));
    }
    if let Some(sender) = non_empty(&filter.sender) {
        let pattern = format!("%{}%", sender);
        qb.push(" AND (sender LIKE ")
            .push_bind(pattern.clone())
            .push(" OR sender_name LIKE ")
            .push_bind(pattern)
            .push(")");
    }
    if let Some(subject) = non_empty(&filter.subject) {
        qb.push(" AND subject LIKE ")
            .push_bind(format!("%{}%", subject));
    }
    if let Some(is_read) = filter.is_read {
        qb.push(" AND is_read = ").push_bind(is_read);
    }
    if let Some(has_attachments) = filter.has_attachments {
        qb.push(" AND has_attachments = ").push_bind(has_attachments);
    }
    if let Some(start) = filter.start_date {
        qb.push(" AND date >= ").push_bind(start);
    }
    if let Some(end) = filter.end_date {
        qb.push(" AND date <= ").push_bind(end);
    }
    if let Some(preset) = filter.date {
        qb.push(" AND date >= ").push_bind(preset.since_ms());
    }
    if let Some(search) = non_empty(&filter.search) {
        let pattern = format!("%{}%", search);
        qb.push(" AND (subject LIKE ")
            .push_bind(pattern.clone())
            .push(" OR sender LIKE ")
            .push_bind(pattern.clone())
            .push(" OR sender_name LIKE ")
            .push_bind(pattern.clone())
            .push(" OR preview LIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

impl Database {
    pub async fn emails_paginated(
        &self,
        page: i64,
        page_size: i64,
        filter: &EmailFilter,
    ) -> Result<Paginated<Email>> {
        let (page, page_size, offset) = page_bounds(page, page_size);

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM emails");
        push_email_filters(&mut count, filter);
        let (total,) = count
            .build_query_as::<(i64,)>()
            .fetch_one(self.pool())
            .await?;

        let mut select =
            QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM emails", EMAIL_COLUMNS));
        push_email_filters(&mut select, filter);
        select
            .push(" ORDER BY date DESC, id DESC LIMIT ")
            .push_bind(page_size)
            .push(" OFFSET ")
            .push_bind(offset);
        let items = select
            .build_query_as::<Email>()
            .fetch_all(self.pool())
            .await?;

        Ok(Paginated::new(items, total, page, page_size))
    }

    pub async fn email_by_id(&self, id: i64) -> Result<Option<Email>> {
        let row = sqlx::query_as::<_, Email>(&format!(
            "SELECT {} FROM emails WHERE id = ?",
            EMAIL_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn attachments_for_email(&self, email_id: i64) -> Result<Vec<Attachment>> {
        let rows = sqlx::query_as::<_, Attachment>(&format!(
            "SELECT {} FROM email_attachments WHERE email_id = ? ORDER BY id",
            ATTACHMENT_COLUMNS
        ))
        .bind(email_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn attachment(&self, email_id: i64, attachment_id: i64) -> Result<Option<Attachment>> {
        let row = sqlx::query_as::<_, Attachment>(&format!(
            "SELECT {} FROM email_attachments WHERE email_id = ? AND id = ?",
            ATTACHMENT_COLUMNS
        ))
        .bind(email_id)
        .bind(attachment_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// Whether `account` already holds a message with this id (compared normalized)
    pub async fn email_exists(&self, account: &str, message_id: &str) -> Result<bool> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM emails WHERE account = ? AND message_id = ?")
                .bind(account.to_lowercase())
                .bind(normalize_message_id(message_id))
                .fetch_one(self.pool())
                .await?;
        Ok(count > 0)
    }

    /// Insert an email and its attachment rows in one transaction.
    ///
    /// Returns [`SaveOutcome::Duplicate`] when the account already holds the message.
    pub async fn save_email(
        &self,
        email: &NewEmail,
        attachments: &[NewAttachment],
    ) -> Result<SaveOutcome> {
        let account = email.account.to_lowercase();
        let message_id = normalize_message_id(&email.message_id);
        if message_id.is_empty() {
            return Err(CloudMailError::Validation(
                "email without message id".to_string(),
            ));
        }
        if self.email_exists(&account, &message_id).await? {
            return Ok(SaveOutcome::Duplicate);
        }

        let now = now_ms();
        let mut tx = self.pool().begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO emails (account, message_id, sender, sender_name, subject, preview, body,
                                date, is_read, has_attachments, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(&account)
        .bind(&message_id)
        .bind(&email.sender)
        .bind(&email.sender_name)
        .bind(&email.subject)
        .bind(&email.preview)
        .bind(&email.body)
        .bind(email.date)
        .bind(!attachments.is_empty())
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let email_id = result.last_insert_rowid();

        for attachment in attachments {
            sqlx::query(
                r#"
                INSERT INTO email_attachments (email_id, name, size, type, path, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(email_id)
            .bind(&attachment.name)
            .bind(attachment.size)
            .bind(&attachment.mime_type)
            .bind(&attachment.path)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(SaveOutcome::Saved(email_id))
    }

    pub async fn mark_email_read(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE emails SET is_read = 1 WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_emails_read(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE emails SET is_read = 1 WHERE id IN (");
        {
            let mut list = qb.separated(", ");
            for id in ids {
                list.push_bind(*id);
            }
        }
        qb.push(")");
        let result = qb.build().execute(self.pool()).await?;
        Ok(result.rows_affected())
    }

    /// Mark every unread email matching `filter` as read
    pub async fn mark_read_by_filter(&self, filter: &EmailFilter) -> Result<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE emails SET is_read = 1");
        push_email_filters(&mut qb, filter);
        qb.push(" AND is_read = 0");
        let count = qb.build().execute(self.pool()).await?.rows_affected();

        if count > 0 {
            self.record_activity(
                ActivityKind::EmailBatchRead,
                format!("Marked {} emails as read", count),
                None,
                Some(json!({ "count": count })),
            )
            .await;
        }
        Ok(count)
    }

    /// Delete an email, returning its attachment rows so the caller can remove the files
    pub async fn delete_email(&self, id: i64) -> Result<Vec<Attachment>> {
        let email = self
            .email_by_id(id)
            .await?
            .ok_or_else(|| CloudMailError::NotFound(format!("email {}", id)))?;
        let attachments = self.attachments_for_email(id).await?;

        sqlx::query("DELETE FROM emails WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;

        self.record_activity(
            ActivityKind::EmailDelete,
            format!(
                "Deleted email \"{}\" from {}",
                email.subject.as_deref().unwrap_or("(no subject)"),
                email.account
            ),
            Some(id.to_string()),
            None,
        )
        .await;
        Ok(attachments)
    }

    /// Newest stored email date, optionally for one account
    pub async fn last_email_date(&self, account: Option<&str>) -> Result<Option<i64>> {
        let (max,): (Option<i64>,) = match account {
            Some(account) => {
                sqlx::query_as("SELECT MAX(date) FROM emails WHERE account = ?")
                    .bind(account.to_lowercase())
                    .fetch_one(self.pool())
                    .await?
            }
            None => {
                sqlx::query_as("SELECT MAX(date) FROM emails")
                    .fetch_one(self.pool())
                    .await?
            }
        };
        Ok(max)
    }

    pub async fn email_count(&self, account: Option<&str>) -> Result<i64> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM emails");
        if let Some(account) = account {
            qb.push(" WHERE account = ").push_bind(account.to_lowercase());
        }
        let (count,) = qb.build_query_as::<(i64,)>().fetch_one(self.pool()).await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewAccount;

    async fn setup() -> Database {
        let db = Database::in_memory().await.unwrap();
        for email in ["a@example.com", "b@example.com"] {
            db.create_account(NewAccount::from_email(email).unwrap())
                .await
                .unwrap();
        }
        db
    }

    fn email(account: &str, message_id: &str, date: i64) -> NewEmail {
        NewEmail {
            account: account.to_string(),
            message_id: message_id.to_string(),
            sender: Some("alice@sender.org".to_string()),
            sender_name: Some("Alice".to_string()),
            subject: Some(format!("Subject {}", message_id)),
            preview: Some("hello there".to_string()),
            body: Some("<p>hello there</p>".to_string()),
            date,
        }
    }

    #[tokio::test]
    async fn test_save_dedups_normalized_ids() {
        let db = setup().await;

        let first = db
            .save_email(&email("a@example.com", "<abc@x>", 1_000), &[])
            .await
            .unwrap();
        assert!(matches!(first, SaveOutcome::Saved(_)));

        for variant in [" abc@x ", "abc@x", "<abc@x>"] {
            let again = db
                .save_email(&email("a@example.com", variant, 1_000), &[])
                .await
                .unwrap();
            assert_eq!(again, SaveOutcome::Duplicate);
        }

        // Same message for another account is a separate row
        let other = db
            .save_email(&email("b@example.com", "abc@x", 1_000), &[])
            .await
            .unwrap();
        assert!(matches!(other, SaveOutcome::Saved(_)));

        assert_eq!(db.email_count(None).await.unwrap(), 2);
        assert!(db.email_exists("A@example.com", "<abc@x>").await.unwrap());
    }

    #[tokio::test]
    async fn test_save_with_attachments() {
        let db = setup().await;
        let attachment = NewAttachment {
            name: "report.pdf".to_string(),
            size: 42,
            mime_type: "application/pdf".to_string(),
            path: "data/attachments/a_example_com/1_report.pdf".to_string(),
        };

        let SaveOutcome::Saved(id) = db
            .save_email(&email("a@example.com", "m1", 1_000), &[attachment])
            .await
            .unwrap()
        else {
            panic!("expected a new row");
        };

        let stored = db.email_by_id(id).await.unwrap().unwrap();
        assert!(stored.has_attachments);
        assert!(!stored.is_read);

        let attachments = db.attachments_for_email(id).await.unwrap();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].mime_type, "application/pdf");
        assert!(db.attachment(id, attachments[0].id).await.unwrap().is_some());
        assert!(db.attachment(id + 1, attachments[0].id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_filters_and_ordering() {
        let db = setup().await;
        db.save_email(&email("a@example.com", "m1", 1_000), &[]).await.unwrap();
        db.save_email(&email("a@example.com", "m2", 3_000), &[]).await.unwrap();
        db.save_email(&email("b@example.com", "m3", 2_000), &[]).await.unwrap();

        let all = db
            .emails_paginated(1, 20, &EmailFilter::default())
            .await
            .unwrap();
        let dates: Vec<i64> = all.items.iter().map(|e| e.date).collect();
        assert_eq!(dates, vec![3_000, 2_000, 1_000]);

        let owned = EmailFilter {
            owner: Some("b@example.com".to_string()),
            ..Default::default()
        };
        assert_eq!(db.emails_paginated(1, 20, &owned).await.unwrap().total, 1);

        let ranged = EmailFilter {
            start_date: Some(1_500),
            end_date: Some(3_000),
            ..Default::default()
        };
        assert_eq!(db.emails_paginated(1, 20, &ranged).await.unwrap().total, 2);

        let by_subject = EmailFilter {
            subject: Some("m2".to_string()),
            ..Default::default()
        };
        assert_eq!(db.emails_paginated(1, 20, &by_subject).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_read_marking() {
        let db = setup().await;
        let mut ids = Vec::new();
        for (i, account) in ["a@example.com", "a@example.com", "b@example.com"]
            .iter()
            .enumerate()
        {
            if let SaveOutcome::Saved(id) = db
                .save_email(&email(account, &format!("m{}", i), 1_000), &[])
                .await
                .unwrap()
            {
                ids.push(id);
            }
        }

        assert!(db.mark_email_read(ids[0]).await.unwrap());
        assert_eq!(db.mark_emails_read(&ids[1..2]).await.unwrap(), 1);
        assert_eq!(db.mark_emails_read(&[]).await.unwrap(), 0);

        let unread = EmailFilter {
            is_read: Some(false),
            ..Default::default()
        };
        assert_eq!(db.emails_paginated(1, 20, &unread).await.unwrap().total, 1);

        assert_eq!(db.mark_read_by_filter(&EmailFilter::default()).await.unwrap(), 1);
        assert_eq!(db.stats().await.unwrap().unread_emails, 0);
    }

    #[tokio::test]
    async fn test_delete_cascades_and_watermark() {
        let db = setup().await;
        assert_eq!(db.last_email_date(None).await.unwrap(), None);

        db.save_email(&email("a@example.com", "m1", 1_000), &[]).await.unwrap();
        db.save_email(&email("b@example.com", "m2", 5_000), &[]).await.unwrap();

        assert_eq!(db.last_email_date(None).await.unwrap(), Some(5_000));
        assert_eq!(
            db.last_email_date(Some("a@example.com")).await.unwrap(),
            Some(1_000)
        );

        let account = db.account_by_email("b@example.com").await.unwrap().unwrap();
        db.delete_account(account.id).await.unwrap();
        assert_eq!(db.email_count(Some("b@example.com")).await.unwrap(), 0);
        assert_eq!(db.email_count(None).await.unwrap(), 1);
    }
}
