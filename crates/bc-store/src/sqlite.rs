use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info};

use bc_common::{
    BroadcastStats, BroadcastStatus, JobFilter, JobId, JobPage, JobRecord, JobUpdate, ListId,
    MessageType, NewJob, Recipient, RecipientList,
};
use crate::{JobStore, RecipientDirectory, Result, StoreError};

/// SQLite-backed job store and recipient directory
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they do not exist yet
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS broadcast_lists (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS broadcast_recipients (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                list_id INTEGER NOT NULL REFERENCES broadcast_lists(id),
                address TEXT NOT NULL,
                name TEXT,
                is_active INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_recipients_list
            ON broadcast_recipients (list_id, id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS broadcast_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                list_id INTEGER NOT NULL,
                message_type TEXT NOT NULL,
                content TEXT NOT NULL,
                media_ref TEXT,
                status TEXT NOT NULL,
                sent_count INTEGER NOT NULL DEFAULT 0,
                failed_count INTEGER NOT NULL DEFAULT 0,
                total_recipients INTEGER NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_status_created
            ON broadcast_jobs (status, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("SQLite broadcast schema initialized");
        Ok(())
    }

    /// Create an active list holding `recipients` in the given order
    pub async fn create_list(&self, name: &str, recipients: Vec<Recipient>) -> Result<ListId> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("INSERT INTO broadcast_lists (name, is_active, created_at) VALUES (?, 1, ?)")
            .bind(name)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        let list_id = ListId(result.last_insert_rowid());

        for recipient in &recipients {
            Self::insert_recipient(&mut tx, list_id, recipient).await?;
        }

        tx.commit().await?;
        debug!(list_id = %list_id, recipients = recipients.len(), "Recipient list created");
        Ok(list_id)
    }

    pub async fn add_recipients(&self, list_id: ListId, recipients: Vec<Recipient>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::ensure_list(&mut tx, list_id).await?;

        for recipient in &recipients {
            Self::insert_recipient(&mut tx, list_id, recipient).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn set_list_active(&self, list_id: ListId, active: bool) -> Result<()> {
        let result = sqlx::query("UPDATE broadcast_lists SET is_active = ? WHERE id = ?")
            .bind(active)
            .bind(list_id.0)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ListNotFound(list_id));
        }
        Ok(())
    }

    pub async fn set_recipient_active(&self, list_id: ListId, address: &str, active: bool) -> Result<()> {
        sqlx::query("UPDATE broadcast_recipients SET is_active = ? WHERE list_id = ? AND address = ?")
            .bind(active)
            .bind(list_id.0)
            .bind(address)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove every recipient of the list with the given address. Returns
    /// how many were removed.
    pub async fn remove_recipient(&self, list_id: ListId, address: &str) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        Self::ensure_list(&mut tx, list_id).await?;

        let result = sqlx::query("DELETE FROM broadcast_recipients WHERE list_id = ? AND address = ?")
            .bind(list_id.0)
            .bind(address)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() as usize)
    }

    /// Delete a list together with its recipients. Jobs referencing it are kept.
    pub async fn delete_list(&self, list_id: ListId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::ensure_list(&mut tx, list_id).await?;

        sqlx::query("DELETE FROM broadcast_recipients WHERE list_id = ?")
            .bind(list_id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM broadcast_lists WHERE id = ?")
            .bind(list_id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(list_id = %list_id, "Recipient list deleted");
        Ok(())
    }

    async fn ensure_list(tx: &mut sqlx::Transaction<'_, Sqlite>, list_id: ListId) -> Result<()> {
        let exists = sqlx::query("SELECT id FROM broadcast_lists WHERE id = ?")
            .bind(list_id.0)
            .fetch_optional(&mut **tx)
            .await?;
        if exists.is_none() {
            return Err(StoreError::ListNotFound(list_id));
        }
        Ok(())
    }

    async fn insert_recipient(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        list_id: ListId,
        recipient: &Recipient,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO broadcast_recipients (list_id, address, name, is_active) VALUES (?, ?, ?, ?)",
        )
        .bind(list_id.0)
        .bind(&recipient.address)
        .bind(&recipient.name)
        .bind(recipient.is_active)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    fn row_to_record(row: &SqliteRow) -> Result<JobRecord> {
        let message_type: String = row.try_get("message_type")?;
        let status: String = row.try_get("status")?;

        Ok(JobRecord {
            id: JobId(row.try_get("id")?),
            list_id: ListId(row.try_get("list_id")?),
            message_type: message_type
                .parse::<MessageType>()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            content: row.try_get("content")?,
            media_ref: row.try_get("media_ref")?,
            status: status
                .parse::<BroadcastStatus>()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            sent_count: count_column(row, "sent_count")?,
            failed_count: count_column(row, "failed_count")?,
            total_recipients: count_column(row, "total_recipients")?,
            started_at: row.try_get::<Option<DateTime<Utc>>, _>("started_at")?,
            completed_at: row.try_get::<Option<DateTime<Utc>>, _>("completed_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

fn count_column(row: &SqliteRow, column: &str) -> Result<u32> {
    let value: i64 = row.try_get(column)?;
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{} out of range: {}", column, value)))
}

fn sum_column(row: &SqliteRow, column: &str) -> Result<u64> {
    let value: i64 = row.try_get(column)?;
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{} out of range: {}", column, value)))
}

const JOB_COLUMNS: &str = "id, list_id, message_type, content, media_ref, status, sent_count, \
     failed_count, total_recipients, started_at, completed_at, created_at, updated_at";

#[async_trait]
impl JobStore for SqliteStore {
    async fn create_job(&self, job: NewJob) -> Result<JobId> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO broadcast_jobs
                (list_id, message_type, content, media_ref, status, total_recipients, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.list_id.0)
        .bind(job.message_type.as_str())
        .bind(&job.content)
        .bind(&job.media_ref)
        .bind(BroadcastStatus::Pending.as_str())
        .bind(job.total_recipients as i64)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let id = JobId(result.last_insert_rowid());
        debug!(job_id = %id, "Broadcast job created");
        Ok(id)
    }

    async fn update_job(&self, id: JobId, update: JobUpdate) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE broadcast_jobs
            SET status = COALESCE(?, status),
                sent_count = COALESCE(?, sent_count),
                failed_count = COALESCE(?, failed_count),
                started_at = COALESCE(started_at, ?),
                completed_at = COALESCE(completed_at, ?),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.sent_count.map(i64::from))
        .bind(update.failed_count.map(i64::from))
        .bind(update.started_at)
        .bind(update.completed_at)
        .bind(Utc::now())
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(id));
        }
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<JobRecord> {
        let row = sqlx::query(&format!("SELECT {} FROM broadcast_jobs WHERE id = ?", JOB_COLUMNS))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::JobNotFound(id))?;
        Self::row_to_record(&row)
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage<JobRecord>> {
        let status = filter.status.map(|s| s.as_str());
        let list_id = filter.list_id.map(|l| l.0);

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM broadcast_jobs \
             WHERE (? IS NULL OR status = ?) AND (? IS NULL OR list_id = ?)",
        )
        .bind(status)
        .bind(status)
        .bind(list_id)
        .bind(list_id)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM broadcast_jobs \
             WHERE (? IS NULL OR status = ?) AND (? IS NULL OR list_id = ?) \
             ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
            JOB_COLUMNS
        ))
        .bind(status)
        .bind(status)
        .bind(list_id)
        .bind(list_id)
        .bind(filter.limit as i64)
        .bind(filter.offset as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(JobPage {
            items: rows.iter().map(Self::row_to_record).collect::<Result<Vec<_>>>()?,
            total: total.max(0) as u64,
            limit: filter.limit,
            offset: filter.offset,
        })
    }

    async fn stats(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<BroadcastStats> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS completed,
                   COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed,
                   COALESCE(SUM(CASE WHEN status = 'cancelled' THEN 1 ELSE 0 END), 0) AS cancelled,
                   COALESCE(SUM(sent_count), 0) AS total_sent,
                   COALESCE(SUM(failed_count), 0) AS total_failed
            FROM broadcast_jobs
            WHERE created_at >= ? AND created_at < ?
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;

        Ok(BroadcastStats {
            total: sum_column(&row, "total")?,
            completed: sum_column(&row, "completed")?,
            failed: sum_column(&row, "failed")?,
            cancelled: sum_column(&row, "cancelled")?,
            total_sent: sum_column(&row, "total_sent")?,
            total_failed: sum_column(&row, "total_failed")?,
        })
    }
}

#[async_trait]
impl RecipientDirectory for SqliteStore {
    async fn get_list(&self, id: ListId) -> Result<RecipientList> {
        let list_row = sqlx::query("SELECT id, name, is_active FROM broadcast_lists WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::ListNotFound(id))?;

        let recipient_rows = sqlx::query(
            "SELECT address, name, is_active FROM broadcast_recipients WHERE list_id = ? ORDER BY id",
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await?;

        let recipients = recipient_rows
            .iter()
            .map(|row| {
                Ok(Recipient {
                    address: row.try_get("address")?,
                    name: row.try_get("name")?,
                    is_active: row.try_get("is_active")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(RecipientList {
            id,
            name: list_row.try_get("name")?,
            is_active: list_row.try_get("is_active")?,
            recipients,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn create_test_store() -> SqliteStore {
        // One connection: every connection to sqlite::memory: is its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteStore::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    fn new_job(list_id: ListId) -> NewJob {
        NewJob {
            list_id,
            message_type: MessageType::Image,
            content: "caption".to_string(),
            media_ref: Some("https://cdn.example/banner.png".to_string()),
            total_recipients: 4,
        }
    }

    #[tokio::test]
    async fn test_job_lifecycle() {
        let store = create_test_store().await;
        let id = store.create_job(new_job(ListId(1))).await.unwrap();

        let record = store.get_job(id).await.unwrap();
        assert_eq!(record.status, BroadcastStatus::Pending);
        assert_eq!(record.message_type, MessageType::Image);
        assert_eq!(record.media_ref.as_deref(), Some("https://cdn.example/banner.png"));
        assert!(record.started_at.is_none());

        let started = Utc::now();
        store
            .update_job(id, JobUpdate::status(BroadcastStatus::Sending).with_started_at(started))
            .await
            .unwrap();
        store.update_job(id, JobUpdate::counters(3, 1)).await.unwrap();
        store
            .update_job(
                id,
                JobUpdate::status(BroadcastStatus::Completed)
                    .with_counters(3, 1)
                    .with_completed_at(Utc::now())
                    .with_started_at(Utc::now()),
            )
            .await
            .unwrap();

        let record = store.get_job(id).await.unwrap();
        assert_eq!(record.status, BroadcastStatus::Completed);
        assert_eq!((record.sent_count, record.failed_count), (3, 1));
        assert_eq!(
            record.started_at.map(|t| t.timestamp_millis()),
            Some(started.timestamp_millis())
        );
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_missing_job() {
        let store = create_test_store().await;
        assert!(matches!(store.get_job(JobId(42)).await, Err(StoreError::JobNotFound(_))));
        assert!(matches!(
            store.update_job(JobId(42), JobUpdate::counters(1, 0)).await,
            Err(StoreError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_jobs_by_status() {
        let store = create_test_store().await;
        let first = store.create_job(new_job(ListId(1))).await.unwrap();
        let second = store.create_job(new_job(ListId(1))).await.unwrap();
        store
            .update_job(first, JobUpdate::status(BroadcastStatus::Cancelled))
            .await
            .unwrap();

        let all = store.list_jobs(&JobFilter::default()).await.unwrap();
        assert_eq!(all.total, 2);
        assert_eq!(all.items[0].id, second);

        let cancelled = store
            .list_jobs(&JobFilter::default().with_status(BroadcastStatus::Cancelled))
            .await
            .unwrap();
        assert_eq!(cancelled.total, 1);
        assert_eq!(cancelled.items[0].id, first);
    }

    #[tokio::test]
    async fn test_list_jobs_by_list_with_total() {
        let store = create_test_store().await;
        store.create_job(new_job(ListId(1))).await.unwrap();
        store.create_job(new_job(ListId(2))).await.unwrap();
        let newest = store.create_job(new_job(ListId(1))).await.unwrap();

        let page = store
            .list_jobs(&JobFilter::default().with_list(ListId(1)).with_page(1, 0))
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, newest);

        let past_end = store
            .list_jobs(&JobFilter::default().with_list(ListId(1)).with_page(10, 5))
            .await
            .unwrap();
        assert_eq!(past_end.total, 2);
        assert!(past_end.items.is_empty());
    }

    #[tokio::test]
    async fn test_stats_over_period() {
        let store = create_test_store().await;
        let before = Utc::now() - chrono::Duration::seconds(1);
        let done = store.create_job(new_job(ListId(1))).await.unwrap();
        let failed = store.create_job(new_job(ListId(1))).await.unwrap();
        store.create_job(new_job(ListId(2))).await.unwrap();
        store
            .update_job(done, JobUpdate::status(BroadcastStatus::Completed).with_counters(3, 1))
            .await
            .unwrap();
        store
            .update_job(failed, JobUpdate::status(BroadcastStatus::Failed).with_counters(0, 2))
            .await
            .unwrap();
        let after = Utc::now() + chrono::Duration::seconds(1);

        let stats = store.stats(before, after).await.unwrap();
        assert_eq!(
            stats,
            BroadcastStats {
                total: 3,
                completed: 1,
                failed: 1,
                cancelled: 0,
                total_sent: 3,
                total_failed: 3,
            }
        );

        let empty = store
            .stats(before - chrono::Duration::days(2), before - chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(empty, BroadcastStats::default());
    }

    #[tokio::test]
    async fn test_recipient_lists() {
        let store = create_test_store().await;
        let id = store
            .create_list("vip", vec![Recipient::new("a@s"), Recipient::inactive("b@s")])
            .await
            .unwrap();
        store.add_recipients(id, vec![Recipient::new("c@s")]).await.unwrap();
        store.set_recipient_active(id, "a@s", false).await.unwrap();

        let list = store.get_list(id).await.unwrap();
        assert_eq!(list.name, "vip");
        assert!(list.is_active);
        assert_eq!(list.recipients.len(), 3);
        assert_eq!(list.active_addresses(), vec!["c@s".to_string()]);

        store.set_list_active(id, false).await.unwrap();
        assert!(!store.get_list(id).await.unwrap().is_active);

        assert!(matches!(store.get_list(ListId(9)).await, Err(StoreError::ListNotFound(_))));
        assert!(matches!(
            store.add_recipients(ListId(9), vec![Recipient::new("x")]).await,
            Err(StoreError::ListNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_recipient_and_delete_list() {
        let store = create_test_store().await;
        let id = store
            .create_list("vip", vec![Recipient::new("a@s"), Recipient::new("b@s")])
            .await
            .unwrap();

        assert_eq!(store.remove_recipient(id, "a@s").await.unwrap(), 1);
        assert_eq!(store.remove_recipient(id, "a@s").await.unwrap(), 0);
        assert_eq!(
            store.get_list(id).await.unwrap().active_addresses(),
            vec!["b@s".to_string()]
        );

        store.delete_list(id).await.unwrap();
        assert!(matches!(store.get_list(id).await, Err(StoreError::ListNotFound(_))));
        assert!(matches!(store.delete_list(id).await, Err(StoreError::ListNotFound(_))));
        assert!(matches!(
            store.remove_recipient(id, "b@s").await,
            Err(StoreError::ListNotFound(_))
        ));
    }
}
