use super::{
    GroupTotals, MergeOutcome, Storage, TableCounts, format_timestamp, parse_timestamp,
};
use crate::drafts::{Draft, DraftPatch, NewDraft};
use crate::types::{FailedRecord, SendMode, SentRecord, Template, join_list, split_list};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

const FILE_POOL_SIZE: u32 = 4;

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS emails (
        id TEXT PRIMARY KEY,
        subject TEXT NOT NULL,
        body TEXT NOT NULL,
        sender TEXT NOT NULL,
        files TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL DEFAULT ''
    )"#,
    r#"CREATE TABLE IF NOT EXISTS sent_emails (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        email_id TEXT NOT NULL,
        sent_to TEXT NOT NULL,
        sent_type TEXT NOT NULL DEFAULT 'bcc',
        sent_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
        FOREIGN KEY (email_id) REFERENCES emails(id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS failed_emails (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        email_id TEXT NOT NULL,
        recipient TEXT NOT NULL,
        error_reason TEXT NOT NULL DEFAULT '',
        failed_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
        retried INTEGER NOT NULL DEFAULT 0,
        FOREIGN KEY (email_id) REFERENCES emails(id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS drafts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        subject TEXT NOT NULL DEFAULT '',
        body TEXT NOT NULL DEFAULT '',
        sender TEXT NOT NULL DEFAULT '',
        recipients TEXT NOT NULL DEFAULT '',
        attachments TEXT NOT NULL DEFAULT '',
        email_type TEXT NOT NULL DEFAULT 'html',
        created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_sent_emails_email_id ON sent_emails (email_id)",
    "CREATE INDEX IF NOT EXISTS idx_failed_emails_email_id ON failed_emails (email_id)",
];

// ============================================================================
// Row types
// ============================================================================

#[derive(sqlx::FromRow)]
struct TemplateRow {
    id: String,
    subject: String,
    body: String,
    sender: String,
    files: String,
    created_at: String,
}

impl From<TemplateRow> for Template {
    fn from(row: TemplateRow) -> Self {
        // Databases created before `created_at` existed hold an empty string;
        // those rows sort first and fall back to insert order.
        let created_at = parse_timestamp(&row.created_at).unwrap_or(DateTime::UNIX_EPOCH);
        Self {
            id: row.id,
            subject: row.subject,
            body: row.body,
            sender: row.sender,
            attachment_paths: split_list(&row.files),
            created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SentRow {
    id: i64,
    email_id: String,
    sent_to: String,
    sent_type: String,
    sent_at: Option<String>,
}

impl TryFrom<SentRow> for SentRecord {
    type Error = anyhow::Error;

    fn try_from(row: SentRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            template_id: row.email_id,
            recipient: row.sent_to,
            send_mode: SendMode::from_str(&row.sent_type)?,
            sent_at: row.sent_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct FailedRow {
    id: i64,
    email_id: String,
    recipient: String,
    error_reason: String,
    failed_at: Option<String>,
    retried: i64,
}

impl TryFrom<FailedRow> for FailedRecord {
    type Error = anyhow::Error;

    fn try_from(row: FailedRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            template_id: row.email_id,
            recipient: row.recipient,
            error_reason: row.error_reason,
            failed_at: row.failed_at.as_deref().map(parse_timestamp).transpose()?,
            retried: row.retried != 0,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DraftRow {
    id: i64,
    name: String,
    subject: String,
    body: String,
    sender: String,
    recipients: String,
    attachments: String,
    email_type: String,
    created_at: Option<String>,
    updated_at: Option<String>,
}

impl TryFrom<DraftRow> for Draft {
    type Error = anyhow::Error;

    fn try_from(row: DraftRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            name: row.name,
            subject: row.subject,
            body: row.body,
            sender: row.sender,
            recipients: split_list(&row.recipients),
            attachments: split_list(&row.attachments),
            email_type: row.email_type.parse()?,
            created_at: row.created_at.as_deref().map(parse_timestamp).transpose()?,
            updated_at: row.updated_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

// ============================================================================
// SqliteStorage
// ============================================================================

/// SQLite-backed store. Write paths are serialized through `write_lock` so
/// that concurrent send sessions never interleave one batch's rows.
pub struct SqliteStorage {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl SqliteStorage {
    /// Open (creating if missing) the database file at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        Self::connect(options, FILE_POOL_SIZE)
            .await
            .with_context(|| format!("Failed to open database {}", path.display()))
    }

    /// A private in-memory database, held on a single connection.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Self::connect(options, 1).await
    }

    async fn connect(options: SqliteConnectOptions, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;
        let storage = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        storage.ensure_schema().await?;
        Ok(storage)
    }

    async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(*statement)
                .execute(&self.pool)
                .await
                .context("Failed to create schema")?;
        }

        let has_created_at: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pragma_table_info('emails') WHERE name = 'created_at'",
        )
        .fetch_one(&self.pool)
        .await?;
        if has_created_at == 0 {
            info!("Adding created_at column to emails table");
            sqlx::query("ALTER TABLE emails ADD COLUMN created_at TEXT NOT NULL DEFAULT ''")
                .execute(&self.pool)
                .await
                .context("Failed to add created_at column")?;
        }
        Ok(())
    }

    async fn count(&self, sql: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(sql)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("Failed to run count query: {}", sql))?;
        Ok(count as u64)
    }
}

/// Appends `(?, ?, ...)` for `ids` to an open `IN` clause.
fn push_id_list<'a>(builder: &mut QueryBuilder<'a, Sqlite>, ids: &'a [String]) {
    builder.push("(");
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(id.as_str());
    }
    separated.push_unseparated(")");
}

impl Storage for SqliteStorage {
    async fn insert_template(&self, template: &Template) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO emails (id, subject, body, sender, files, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&template.id)
        .bind(&template.subject)
        .bind(&template.body)
        .bind(&template.sender)
        .bind(join_list(&template.attachment_paths))
        .bind(format_timestamp(template.created_at))
        .execute(&self.pool)
        .await
        .context("Failed to insert template")?;
        Ok(())
    }

    async fn get_template(&self, id: &str) -> Result<Option<Template>> {
        let row = sqlx::query_as::<_, TemplateRow>(
            "SELECT id, subject, body, sender, files, created_at FROM emails WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch template")?;
        Ok(row.map(Template::from))
    }

    async fn list_templates(&self) -> Result<Vec<Template>> {
        let rows = sqlx::query_as::<_, TemplateRow>(
            "SELECT id, subject, body, sender, files, created_at FROM emails ORDER BY created_at ASC, rowid ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list templates")?;
        Ok(rows.into_iter().map(Template::from).collect())
    }

    async fn record_sent(
        &self,
        template_id: &str,
        recipients: &[String],
        mode: SendMode,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let sent_at = format_timestamp(Utc::now());
        let mut tx = self.pool.begin().await?;
        for recipient in recipients {
            sqlx::query(
                "INSERT INTO sent_emails (email_id, sent_to, sent_type, sent_at) VALUES (?, ?, ?, ?)",
            )
            .bind(template_id)
            .bind(recipient)
            .bind(mode.as_str())
            .bind(&sent_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to record sent email to {}", recipient))?;
        }
        tx.commit().await.context("Failed to commit sent records")?;
        Ok(())
    }

    async fn record_failed(
        &self,
        template_id: &str,
        recipients: &[String],
        reason: &str,
    ) -> Result<Vec<i64>> {
        let _guard = self.write_lock.lock().await;
        let failed_at = format_timestamp(Utc::now());
        let mut ids = Vec::with_capacity(recipients.len());
        let mut tx = self.pool.begin().await?;
        for recipient in recipients {
            let result = sqlx::query(
                "INSERT INTO failed_emails (email_id, recipient, error_reason, failed_at) VALUES (?, ?, ?, ?)",
            )
            .bind(template_id)
            .bind(recipient)
            .bind(reason)
            .bind(&failed_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to record failed email to {}", recipient))?;
            ids.push(result.last_insert_rowid());
        }
        tx.commit().await.context("Failed to commit failed records")?;
        Ok(ids)
    }

    async fn sent_records(&self, template_ids: &[String]) -> Result<Vec<SentRecord>> {
        if template_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT id, email_id, sent_to, sent_type, sent_at FROM sent_emails WHERE email_id IN ",
        );
        push_id_list(&mut builder, template_ids);
        builder.push(" ORDER BY sent_at DESC, id DESC");

        let rows = builder
            .build_query_as::<SentRow>()
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch sent records")?;
        rows.into_iter().map(SentRecord::try_from).collect()
    }

    async fn failed_records(&self, template_ids: &[String]) -> Result<Vec<FailedRecord>> {
        if template_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT id, email_id, recipient, error_reason, failed_at, retried FROM failed_emails WHERE email_id IN ",
        );
        push_id_list(&mut builder, template_ids);
        builder.push(" ORDER BY failed_at DESC, id DESC");

        let rows = builder
            .build_query_as::<FailedRow>()
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch failed records")?;
        rows.into_iter().map(FailedRecord::try_from).collect()
    }

    async fn unretried_failed_records(&self, template_id: &str) -> Result<Vec<FailedRecord>> {
        let rows = sqlx::query_as::<_, FailedRow>(
            "SELECT id, email_id, recipient, error_reason, failed_at, retried FROM failed_emails \
             WHERE email_id = ? AND retried = 0 ORDER BY failed_at DESC, id DESC",
        )
        .bind(template_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch unretried failed records")?;
        rows.into_iter().map(FailedRecord::try_from).collect()
    }

    async fn group_totals(&self, template_ids: &[String]) -> Result<GroupTotals> {
        if template_ids.is_empty() {
            return Ok(GroupTotals::default());
        }

        let mut sent = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(DISTINCT sent_to), MAX(sent_at) FROM sent_emails WHERE email_id IN ",
        );
        push_id_list(&mut sent, template_ids);
        let (sent_count, last_sent): (i64, Option<String>) = sent
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .context("Failed to aggregate sent records")?;

        let mut failed =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM failed_emails WHERE email_id IN ");
        push_id_list(&mut failed, template_ids);
        let failed_count: i64 = failed
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .context("Failed to count failed records")?;

        Ok(GroupTotals {
            sent_count: sent_count as u64,
            failed_count: failed_count as u64,
            last_sent: last_sent.as_deref().map(parse_timestamp).transpose()?,
        })
    }

    async fn sent_recipients(&self, template_ids: Option<&[String]>) -> Result<HashSet<String>> {
        let recipients: Vec<String> = match template_ids {
            None => sqlx::query_scalar("SELECT DISTINCT sent_to FROM sent_emails")
                .fetch_all(&self.pool)
                .await
                .context("Failed to fetch sent recipients")?,
            Some([]) => Vec::new(),
            Some(ids) => {
                let mut builder = QueryBuilder::<Sqlite>::new(
                    "SELECT DISTINCT sent_to FROM sent_emails WHERE email_id IN ",
                );
                push_id_list(&mut builder, ids);
                builder
                    .build_query_scalar()
                    .fetch_all(&self.pool)
                    .await
                    .context("Failed to fetch sent recipients")?
            }
        };
        Ok(recipients.into_iter().collect())
    }

    async fn sent_timestamps(&self) -> Result<Vec<DateTime<Utc>>> {
        let stored: Vec<String> =
            sqlx::query_scalar("SELECT sent_at FROM sent_emails WHERE sent_at IS NOT NULL")
                .fetch_all(&self.pool)
                .await
                .context("Failed to fetch sent timestamps")?;
        // Unparseable legacy values are skipped rather than failing the whole report.
        Ok(stored
            .iter()
            .filter_map(|s| parse_timestamp(s).ok())
            .collect())
    }

    async fn mark_failed_retried(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let _guard = self.write_lock.lock().await;
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE failed_emails SET retried = 1 WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .context("Failed to mark failed records retried")?;
        Ok(result.rows_affected())
    }

    async fn delete_failed_record(&self, id: i64) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM failed_emails WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete failed record")?;
        Ok(result.rows_affected() > 0)
    }

    async fn merge_templates(
        &self,
        canonical_id: &str,
        duplicate_ids: &[String],
    ) -> Result<MergeOutcome> {
        let _guard = self.write_lock.lock().await;
        let mut outcome = MergeOutcome::default();
        let mut tx = self.pool.begin().await?;

        for duplicate_id in duplicate_ids.iter().filter(|id| *id != canonical_id) {
            outcome.sent_rewritten += sqlx::query("UPDATE sent_emails SET email_id = ? WHERE email_id = ?")
                .bind(canonical_id)
                .bind(duplicate_id)
                .execute(&mut *tx)
                .await
                .context("Failed to rewrite sent records")?
                .rows_affected();

            outcome.failed_rewritten += sqlx::query("UPDATE failed_emails SET email_id = ? WHERE email_id = ?")
                .bind(canonical_id)
                .bind(duplicate_id)
                .execute(&mut *tx)
                .await
                .context("Failed to rewrite failed records")?
                .rows_affected();

            outcome.templates_removed += sqlx::query("DELETE FROM emails WHERE id = ?")
                .bind(duplicate_id)
                .execute(&mut *tx)
                .await
                .context("Failed to delete duplicate template")?
                .rows_affected();
        }

        tx.commit().await.context("Failed to commit template merge")?;
        Ok(outcome)
    }

    async fn table_counts(&self) -> Result<TableCounts> {
        Ok(TableCounts {
            templates: self.count("SELECT COUNT(*) FROM emails").await?,
            sent_records: self.count("SELECT COUNT(*) FROM sent_emails").await?,
            distinct_recipients: self
                .count("SELECT COUNT(DISTINCT sent_to) FROM sent_emails")
                .await?,
            failed_records: self.count("SELECT COUNT(*) FROM failed_emails").await?,
            drafts: self.count("SELECT COUNT(*) FROM drafts").await?,
        })
    }

    async fn insert_draft(&self, draft: &NewDraft) -> Result<i64> {
        let _guard = self.write_lock.lock().await;
        let now = format_timestamp(Utc::now());
        let result = sqlx::query(
            "INSERT INTO drafts (name, subject, body, sender, recipients, attachments, email_type, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&draft.name)
        .bind(&draft.subject)
        .bind(&draft.body)
        .bind(&draft.sender)
        .bind(join_list(&draft.recipients))
        .bind(join_list(&draft.attachments))
        .bind(draft.email_type.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("Failed to insert draft")?;
        Ok(result.last_insert_rowid())
    }

    async fn get_draft(&self, id: i64) -> Result<Option<Draft>> {
        let row = sqlx::query_as::<_, DraftRow>(
            "SELECT id, name, subject, body, sender, recipients, attachments, email_type, created_at, updated_at \
             FROM drafts WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch draft")?;
        row.map(Draft::try_from).transpose()
    }

    async fn list_drafts(&self) -> Result<Vec<Draft>> {
        let rows = sqlx::query_as::<_, DraftRow>(
            "SELECT id, name, subject, body, sender, recipients, attachments, email_type, created_at, updated_at \
             FROM drafts ORDER BY updated_at DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list drafts")?;
        rows.into_iter().map(Draft::try_from).collect()
    }

    async fn update_draft(&self, id: i64, patch: &DraftPatch) -> Result<bool> {
        if patch.is_empty() {
            return Ok(false);
        }
        let _guard = self.write_lock.lock().await;
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE drafts SET ");
        let mut assignments = builder.separated(", ");
        for (field, value) in patch.fields() {
            assignments.push(format!("{} = ", field.column()));
            assignments.push_bind_unseparated(value.to_string());
        }
        assignments.push("updated_at = ");
        assignments.push_bind_unseparated(format_timestamp(Utc::now()));
        builder.push(" WHERE id = ");
        builder.push_bind(id);

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .context("Failed to update draft")?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_draft(&self, id: i64) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM drafts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete draft")?;
        Ok(result.rows_affected() > 0)
    }
}

// ============================================================================
// Tests
// ============================================================================
