//! Campaign view over the stored templates: grouping by content, per-group
//! aggregates, consolidation of duplicates and overall statistics.
//!
//! Two templates belong to the same campaign when subject, sender and body
//! are byte-for-byte equal. Whitespace or case differences produce separate
//! campaigns.

use crate::storage::Storage;
use crate::types::{FailedRecord, SentRecord, Template};
use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

const RECENT_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Campaign {
    /// Id of the oldest member template.
    pub id: String,
    pub subject: String,
    pub sender: String,
    pub body: String,
    /// Member ids in creation order.
    pub template_ids: Vec<String>,
    pub template_count: usize,
    /// Distinct recipients across the group.
    pub sent_count: u64,
    pub failed_count: u64,
    pub last_sent: Option<DateTime<Utc>>,
}

/// Group `templates` by content, keeping first-seen order both across and
/// within groups. With oldest-first input the first member is canonical.
pub fn group_templates(templates: &[Template]) -> Vec<Vec<&Template>> {
    let mut positions: HashMap<(&str, &str, &str), usize> = HashMap::new();
    let mut groups: Vec<Vec<&Template>> = Vec::new();
    for template in templates {
        match positions.get(&template.content_key()) {
            Some(&index) => groups[index].push(template),
            None => {
                positions.insert(template.content_key(), groups.len());
                groups.push(vec![template]);
            }
        }
    }
    groups
}

fn member_ids(group: &[&Template]) -> Vec<String> {
    group.iter().map(|t| t.id.clone()).collect()
}

/// All campaigns, most recently sent first; never-sent campaigns last.
pub async fn list_campaigns<S: Storage>(storage: &Arc<S>) -> Result<Vec<Campaign>> {
    let templates = storage.list_templates().await?;
    let mut campaigns = Vec::new();
    for group in group_templates(&templates) {
        let canonical = group[0];
        let template_ids = member_ids(&group);
        let totals = storage.group_totals(&template_ids).await?;
        campaigns.push(Campaign {
            id: canonical.id.clone(),
            subject: canonical.subject.clone(),
            sender: canonical.sender.clone(),
            body: canonical.body.clone(),
            template_count: template_ids.len(),
            template_ids,
            sent_count: totals.sent_count,
            failed_count: totals.failed_count,
            last_sent: totals.last_sent,
        });
    }
    // Option orders None first, so the reversed comparison puts it last.
    campaigns.sort_by(|a, b| b.last_sent.cmp(&a.last_sent));
    Ok(campaigns)
}

/// Campaigns whose subject or sender contains `query`, ignoring case.
pub async fn search_campaigns<S: Storage>(storage: &Arc<S>, query: &str) -> Result<Vec<Campaign>> {
    let needle = query.trim().to_lowercase();
    let campaigns = list_campaigns(storage).await?;
    if needle.is_empty() {
        return Ok(campaigns);
    }
    Ok(campaigns
        .into_iter()
        .filter(|c| {
            c.subject.to_lowercase().contains(&needle) || c.sender.to_lowercase().contains(&needle)
        })
        .collect())
}

// ============================================================================
// Consolidation
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateGroup {
    pub canonical_id: String,
    pub duplicate_ids: Vec<String>,
    pub subject: String,
    pub sender: String,
}

/// Groups with more than one template, without changing anything.
pub async fn find_duplicate_groups<S: Storage>(storage: &Arc<S>) -> Result<Vec<DuplicateGroup>> {
    let templates = storage.list_templates().await?;
    Ok(group_templates(&templates)
        .into_iter()
        .filter(|group| group.len() > 1)
        .map(|group| DuplicateGroup {
            canonical_id: group[0].id.clone(),
            duplicate_ids: group[1..].iter().map(|t| t.id.clone()).collect(),
            subject: group[0].subject.clone(),
            sender: group[0].sender.clone(),
        })
        .collect())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidationReport {
    pub groups_processed: u64,
    pub templates_removed: u64,
    pub sent_records_rewritten: u64,
    pub failed_records_rewritten: u64,
}

/// Merge every duplicate group into its oldest template. Each group is
/// merged atomically; running this again changes nothing.
pub async fn consolidate_duplicates<S: Storage>(storage: &Arc<S>) -> Result<ConsolidationReport> {
    let mut report = ConsolidationReport::default();
    for group in find_duplicate_groups(storage).await? {
        let outcome = storage
            .merge_templates(&group.canonical_id, &group.duplicate_ids)
            .await?;
        info!(
            canonical_id = %group.canonical_id,
            removed = outcome.templates_removed,
            sent_rewritten = outcome.sent_rewritten,
            failed_rewritten = outcome.failed_rewritten,
            "Consolidated duplicate templates"
        );
        report.groups_processed += 1;
        report.templates_removed += outcome.templates_removed;
        report.sent_records_rewritten += outcome.sent_rewritten;
        report.failed_records_rewritten += outcome.failed_rewritten;
    }
    Ok(report)
}

// ============================================================================
// Detail
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignDetail {
    pub campaign: Campaign,
    /// Newest first.
    pub sent_records: Vec<SentRecord>,
    /// Newest first.
    pub failed_records: Vec<FailedRecord>,
}

pub async fn campaign_detail<S: Storage>(
    storage: &Arc<S>,
    campaign_id: &str,
) -> Result<Option<CampaignDetail>> {
    let Some(campaign) = list_campaigns(storage)
        .await?
        .into_iter()
        .find(|c| c.id == campaign_id)
    else {
        return Ok(None);
    };
    let sent_records = storage.sent_records(&campaign.template_ids).await?;
    let failed_records = storage.failed_records(&campaign.template_ids).await?;
    Ok(Some(CampaignDetail {
        campaign,
        sent_records,
        failed_records,
    }))
}

/// Flag the given failed records as handled, e.g. after resending them from
/// a history view.
pub async fn mark_retried<S: Storage>(storage: &Arc<S>, failed_ids: &[i64]) -> Result<u64> {
    let marked = storage.mark_failed_retried(failed_ids).await?;
    info!(requested = failed_ids.len(), marked, "Marked failed records retried");
    Ok(marked)
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverallStats {
    pub total_campaigns: usize,
    pub total_sent: u64,
    pub total_failed: u64,
    pub unique_recipients: usize,
    /// Percentage with one decimal; 0 when nothing was attempted.
    pub success_rate: f64,
    pub sent_today: u64,
    /// Sends dated today or up to seven days before.
    pub sent_this_week: u64,
}

pub fn success_rate(sent: u64, failed: u64) -> f64 {
    let attempts = sent + failed;
    if attempts == 0 {
        return 0.0;
    }
    let rate = sent as f64 / attempts as f64 * 100.0;
    (rate * 10.0).round() / 10.0
}

/// Counts of `timestamps` dated `today`, and within the trailing week.
/// Dates are taken in UTC.
pub fn count_recent(timestamps: &[DateTime<Utc>], today: NaiveDate) -> (u64, u64) {
    let mut sent_today = 0;
    let mut sent_this_week = 0;
    for timestamp in timestamps {
        let days_ago = (today - timestamp.date_naive()).num_days();
        if days_ago == 0 {
            sent_today += 1;
        }
        if (0..=RECENT_WINDOW_DAYS).contains(&days_ago) {
            sent_this_week += 1;
        }
    }
    (sent_today, sent_this_week)
}

pub async fn overall_stats<S: Storage>(storage: &Arc<S>, today: NaiveDate) -> Result<OverallStats> {
    let campaigns = list_campaigns(storage).await?;
    let total_sent = campaigns.iter().map(|c| c.sent_count).sum();
    let total_failed = campaigns.iter().map(|c| c.failed_count).sum();
    let unique_recipients = storage.sent_recipients(None).await?.len();
    let timestamps = storage.sent_timestamps().await?;
    let (sent_today, sent_this_week) = count_recent(&timestamps, today);

    Ok(OverallStats {
        total_campaigns: campaigns.len(),
        total_sent,
        total_failed,
        unique_recipients,
        success_rate: success_rate(total_sent, total_failed),
        sent_today,
        sent_this_week,
    })
}

/// Raw row counts, for maintenance output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DatabaseStats {
    pub templates: u64,
    pub unique_campaigns: u64,
    pub sent_records: u64,
    pub distinct_recipients: u64,
    pub failed_records: u64,
    pub drafts: u64,
}

pub async fn database_stats<S: Storage>(storage: &Arc<S>) -> Result<DatabaseStats> {
    let counts = storage.table_counts().await?;
    let templates = storage.list_templates().await?;
    Ok(DatabaseStats {
        templates: counts.templates,
        unique_campaigns: group_templates(&templates).len() as u64,
        sent_records: counts.sent_records,
        distinct_recipients: counts.distinct_recipients,
        failed_records: counts.failed_records,
        drafts: counts.drafts,
    })
}
