//! Recipient lists in and failed lists out, as CSV files.

use crate::compare::normalize;
use crate::sender::FailedEntry;
use anyhow::{Context, Result};
use email_address::EmailAddress;
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

const EXPORT_HEADERS: [&str; 3] = ["Email Address", "Error Reason", "Failed At"];
const EXPORT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Values of column `column` (zero-based) below the header row. Blank values,
/// values starting with whitespace and rows too short to have the column are
/// skipped.
pub fn read_column(path: &Path, column: usize) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut values = Vec::new();
    let mut short_rows = 0;
    for (row, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Failed to read row {} of {}", row + 2, path.display()))?;
        let Some(value) = record.get(column) else {
            short_rows += 1;
            continue;
        };
        if value.is_empty() || value.starts_with(char::is_whitespace) {
            continue;
        }
        values.push(value.trim_end().to_string());
    }
    if short_rows > 0 {
        warn!(path = %path.display(), column, short_rows, "Rows without the requested column were skipped");
    }
    info!(path = %path.display(), column, count = values.len(), "Loaded recipients");
    Ok(values)
}

/// Split addresses into syntactically valid and invalid ones, keeping order.
pub fn partition_valid(addresses: &[String]) -> (Vec<String>, Vec<String>) {
    addresses
        .iter()
        .cloned()
        .partition(|address| EmailAddress::is_valid(address))
}

/// Drop blanks and repeats, comparing addresses trimmed and lowercased. The
/// first spelling of each address is kept.
pub fn dedupe(addresses: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    addresses
        .into_iter()
        .filter(|address| normalize(address).is_some_and(|key| seen.insert(key)))
        .collect()
}

pub fn export_failed(path: &Path, failed: &[FailedEntry]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record(EXPORT_HEADERS)?;
    for entry in failed {
        let failed_at = entry.failed_at.format(EXPORT_TIME_FORMAT).to_string();
        writer.write_record([entry.recipient.as_str(), entry.error.as_str(), failed_at.as_str()])?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!(path = %path.display(), count = failed.len(), "Exported failed recipients");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::fs;

    #[test]
    fn reads_column_and_skips_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.csv");
        fs::write(
            &path,
            "Name,Email\nAda,ada@x.com\nBob,\nCy, cy@x.com\nshort\nDee,dee@x.com\n",
        )
        .unwrap();

        let values = read_column(&path, 1).unwrap();
        assert_eq!(values, vec!["ada@x.com".to_string(), "dee@x.com".to_string()]);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_column(&dir.path().join("nope.csv"), 0).is_err());
    }

    #[test]
    fn dedupe_ignores_case_and_surrounding_space() {
        let addresses = vec![
            "A@x.com".to_string(),
            "b@x.com".to_string(),
            "a@x.com".to_string(),
            " b@X.com ".to_string(),
            "  ".to_string(),
        ];
        assert_eq!(
            dedupe(addresses),
            vec!["A@x.com".to_string(), "b@x.com".to_string()]
        );
    }

    #[test]
    fn partition_keeps_order() {
        let addresses = vec![
            "a@x.com".to_string(),
            "not-an-address".to_string(),
            "b@x.com".to_string(),
        ];
        let (valid, invalid) = partition_valid(&addresses);
        assert_eq!(valid, vec!["a@x.com".to_string(), "b@x.com".to_string()]);
        assert_eq!(invalid, vec!["not-an-address".to_string()]);
    }

    #[test]
    fn export_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed.csv");
        let failed = vec![FailedEntry {
            recipient: "a@x.com".to_string(),
            error: "MessageRejected: Address blacklisted".to_string(),
            failed_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap(),
            record_id: Some(7),
        }];

        export_failed(&path, &failed).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "Email Address,Error Reason,Failed At\n\
             a@x.com,MessageRejected: Address blacklisted,2024-05-01 09:30:00\n"
        );
    }
}
