use crate::drafts::{Draft, DraftPatch, NewDraft};
use crate::types::{FailedRecord, SendMode, SentRecord, Template};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::HashSet;

pub mod sqlite;
pub use sqlite::SqliteStorage;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
const TIMESTAMP_PARSE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

// ============================================================================
// Storage trait
// ============================================================================

#[allow(async_fn_in_trait)]
pub trait Storage: Send + Sync {
    async fn insert_template(&self, template: &Template) -> Result<()>;
    async fn get_template(&self, id: &str) -> Result<Option<Template>>;
    /// All templates, oldest first.
    async fn list_templates(&self) -> Result<Vec<Template>>;

    async fn record_sent(
        &self,
        template_id: &str,
        recipients: &[String],
        mode: SendMode,
    ) -> Result<()>;
    /// Returns the ids of the inserted rows, in recipient order.
    async fn record_failed(
        &self,
        template_id: &str,
        recipients: &[String],
        reason: &str,
    ) -> Result<Vec<i64>>;

    /// Sent records of the given templates, newest first.
    async fn sent_records(&self, template_ids: &[String]) -> Result<Vec<SentRecord>>;
    /// Failed records of the given templates, newest first.
    async fn failed_records(&self, template_ids: &[String]) -> Result<Vec<FailedRecord>>;
    async fn unretried_failed_records(&self, template_id: &str) -> Result<Vec<FailedRecord>>;
    async fn group_totals(&self, template_ids: &[String]) -> Result<GroupTotals>;
    /// Distinct recipients recorded as sent, across all history when `template_ids`
    /// is `None`.
    async fn sent_recipients(&self, template_ids: Option<&[String]>) -> Result<HashSet<String>>;
    async fn sent_timestamps(&self) -> Result<Vec<DateTime<Utc>>>;
    async fn mark_failed_retried(&self, ids: &[i64]) -> Result<u64>;
    async fn delete_failed_record(&self, id: i64) -> Result<bool>;

    /// Point every record of `duplicate_ids` at `canonical_id` and delete the
    /// duplicates, atomically.
    async fn merge_templates(
        &self,
        canonical_id: &str,
        duplicate_ids: &[String],
    ) -> Result<MergeOutcome>;
    async fn table_counts(&self) -> Result<TableCounts>;

    async fn insert_draft(&self, draft: &NewDraft) -> Result<i64>;
    async fn get_draft(&self, id: i64) -> Result<Option<Draft>>;
    /// Most recently updated first.
    async fn list_drafts(&self) -> Result<Vec<Draft>>;
    /// Returns `false` when the draft does not exist or the patch is empty.
    async fn update_draft(&self, id: i64, patch: &DraftPatch) -> Result<bool>;
    async fn delete_draft(&self, id: i64) -> Result<bool>;
}

/// Aggregates over a group of templates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupTotals {
    /// Distinct recipients.
    pub sent_count: u64,
    pub failed_count: u64,
    pub last_sent: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub templates_removed: u64,
    pub sent_rewritten: u64,
    pub failed_rewritten: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounts {
    pub templates: u64,
    pub sent_records: u64,
    pub distinct_recipients: u64,
    pub failed_records: u64,
    pub drafts: u64,
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Fixed-width, so stored timestamps sort lexicographically.
pub(crate) fn format_timestamp(date: DateTime<Utc>) -> String {
    date.format(TIMESTAMP_FORMAT).to_string()
}

pub(crate) fn parse_timestamp(stored: &str) -> Result<DateTime<Utc>> {
    let normalized = stored.replacen('T', " ", 1);
    let trimmed = normalized.trim_end_matches('Z');
    NaiveDateTime::parse_from_str(trimmed, TIMESTAMP_PARSE_FORMAT)
        .map(|naive| naive.and_utc())
        .with_context(|| format!("Invalid stored timestamp '{}'", stored))
}

// ============================================================================
// Test utilities
// ============================================================================
