use crate::history::Campaign;
use crate::storage::Storage;
use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Which history candidates are compared against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompareScope {
    AllHistory,
    /// An empty list compares against nothing.
    Templates(Vec<String>),
}

impl CompareScope {
    pub fn campaign(campaign: &Campaign) -> Self {
        Self::Templates(campaign.template_ids.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Comparison {
    /// Distinct normalized candidates.
    pub total: usize,
    /// Sorted.
    pub already_sent: Vec<String>,
    /// Sorted.
    pub new_recipients: Vec<String>,
}

/// Trimmed and lowercased; `None` for blank input.
pub fn normalize(address: &str) -> Option<String> {
    let trimmed = address.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_lowercase())
}

/// Split `candidates` by membership in `historical`. Both sides are
/// normalized.
pub fn compare_sets<'a>(
    candidates: impl IntoIterator<Item = &'a str>,
    historical: impl IntoIterator<Item = &'a str>,
) -> Comparison {
    let historical: HashSet<String> = historical.into_iter().filter_map(normalize).collect();
    let candidates: BTreeSet<String> = candidates.into_iter().filter_map(normalize).collect();

    let total = candidates.len();
    let (already_sent, new_recipients): (Vec<String>, Vec<String>) = candidates
        .into_iter()
        .partition(|candidate| historical.contains(candidate));
    Comparison {
        total,
        already_sent,
        new_recipients,
    }
}

pub async fn compare<S: Storage>(
    storage: &Arc<S>,
    candidates: &[String],
    scope: &CompareScope,
) -> Result<Comparison> {
    let historical = match scope {
        CompareScope::AllHistory => storage.sent_recipients(None).await?,
        CompareScope::Templates(ids) => storage.sent_recipients(Some(ids.as_slice())).await?,
    };
    let comparison = compare_sets(
        candidates.iter().map(String::as_str),
        historical.iter().map(String::as_str),
    );
    debug!(
        total = comparison.total,
        already_sent = comparison.already_sent.len(),
        new_recipients = comparison.new_recipients.len(),
        "Compared recipients against history"
    );
    Ok(comparison)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::list_campaigns;
    use crate::storage::test_utils::{memory_storage, seed_sent, strings};

    #[test]
    fn normalize_trims_and_lowercases() {
        assert_eq!(normalize("  Y@A.com "), Some("y@a.com".to_string()));
        assert_eq!(normalize("   "), None);
    }

    #[test]
    fn partitions_are_disjoint_and_cover_candidates() {
        let comparison = compare_sets(
            ["b@x.com", "A@x.com", "c@x.com", "", "a@x.com "],
            ["a@x.com", "z@x.com"],
        );

        assert_eq!(comparison.total, 3);
        assert_eq!(comparison.already_sent, vec!["a@x.com".to_string()]);
        assert_eq!(comparison.new_recipients, strings(&["b@x.com", "c@x.com"]));
    }

    #[tokio::test]
    async fn candidates_checked_against_one_campaign() {
        let storage = Arc::new(memory_storage().await);
        let a = seed_sent(&storage, "A", "me@a.com", "Body", &["x@a.com"]).await;
        storage
            .record_sent(&a.id, &strings(&["y@a.com"]), crate::types::SendMode::Bcc)
            .await
            .unwrap();
        seed_sent(&storage, "B", "me@a.com", "Body", &["z@a.com"]).await;

        let campaigns = list_campaigns(&storage).await.unwrap();
        let campaign_a = campaigns.iter().find(|c| c.id == a.id).unwrap();
        let candidates = strings(&["x@a.com", "Y@A.COM", "z@a.com"]);

        let comparison = compare(&storage, &candidates, &CompareScope::campaign(campaign_a))
            .await
            .unwrap();
        assert_eq!(comparison.total, 3);
        assert_eq!(comparison.already_sent, strings(&["x@a.com", "y@a.com"]));
        assert_eq!(comparison.new_recipients, strings(&["z@a.com"]));

        let comparison = compare(&storage, &candidates, &CompareScope::AllHistory)
            .await
            .unwrap();
        assert_eq!(comparison.already_sent.len(), 3);
        assert!(comparison.new_recipients.is_empty());
    }

    #[tokio::test]
    async fn empty_template_scope_treats_everyone_as_new() {
        let storage = Arc::new(memory_storage().await);
        seed_sent(&storage, "A", "me@a.com", "Body", &["x@a.com"]).await;

        let comparison = compare(
            &storage,
            &strings(&["x@a.com"]),
            &CompareScope::Templates(vec![]),
        )
        .await
        .unwrap();
        assert!(comparison.already_sent.is_empty());
        assert_eq!(comparison.new_recipients, strings(&["x@a.com"]));
    }

    #[tokio::test]
    async fn historical_addresses_are_normalized_too() {
        let storage = Arc::new(memory_storage().await);
        seed_sent(&storage, "A", "me@a.com", "Body", &[" Mixed@Case.com"]).await;

        let comparison = compare(&storage, &strings(&["mixed@case.com"]), &CompareScope::AllHistory)
            .await
            .unwrap();
        assert_eq!(comparison.already_sent, strings(&["mixed@case.com"]));
    }
}
