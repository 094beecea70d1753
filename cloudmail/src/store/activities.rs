//! Append-only activity log

use serde_json::Value;
use tracing::error;

use super::{now_ms, Activity, ActivityKind, Database};
use crate::error::Result;

impl Database {
    /// Append an activity. Failures are logged and never reach the caller.
    pub async fn record_activity(
        &self,
        kind: ActivityKind,
        text: impl Into<String>,
        related_id: Option<String>,
        details: Option<Value>,
    ) {
        let text = text.into();
        let details = details.map(|d| d.to_string());

        let result = sqlx::query(
            r#"
            INSERT INTO activities (type, icon, text, timestamp, related_id, details)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(kind.as_str())
        .bind(kind.icon())
        .bind(&text)
        .bind(now_ms())
        .bind(related_id)
        .bind(details)
        .execute(self.pool())
        .await;

        if let Err(e) = result {
            error!("Failed to record {} activity: {}", kind.as_str(), e);
        }
    }

    pub async fn recent_activities(&self, limit: i64) -> Result<Vec<Activity>> {
        let rows = sqlx::query_as::<_, Activity>(
            r#"
            SELECT id, type, icon, text, timestamp, related_id, details
            FROM activities
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit.max(1))
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn activities_by_type(&self, kind: ActivityKind, limit: i64) -> Result<Vec<Activity>> {
        let rows = sqlx::query_as::<_, Activity>(
            r#"
            SELECT id, type, icon, text, timestamp, related_id, details
            FROM activities
            WHERE type = ?
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(kind.as_str())
        .bind(limit.max(1))
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Delete the whole log, returning how many entries were removed
    pub async fn clear_activities(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM activities")
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_record_and_list() {
        let db = Database::in_memory().await.unwrap();

        db.record_activity(ActivityKind::EmailCheck, "first", None, Some(json!({"count": 2})))
            .await;
        db.record_activity(ActivityKind::UserLogin, "second", Some("7".to_string()), None)
            .await;

        let recent = db.recent_activities(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].text, "second");
        assert_eq!(recent[0].icon, "box-arrow-in-right");
        assert_eq!(recent[1].details.as_deref(), Some(r#"{"count":2}"#));

        let checks = db
            .activities_by_type(ActivityKind::EmailCheck, 10)
            .await
            .unwrap();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].kind, "email_check");
    }

    #[tokio::test]
    async fn test_clear_returns_count() {
        let db = Database::in_memory().await.unwrap();
        for i in 0..3 {
            db.record_activity(ActivityKind::SettingsUpdate, format!("edit {}", i), None, None)
                .await;
        }

        assert_eq!(db.clear_activities().await.unwrap(), 3);
        assert!(db.recent_activities(10).await.unwrap().is_empty());
    }
}
