use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Separator used for list-valued columns (attachments, draft recipients).
const LIST_SEPARATOR: char = ',';

/// How the recipients of a batch were addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendMode {
    #[default]
    Bcc,
    Cc,
    To,
}

impl SendMode {
    pub fn from_use_bcc(use_bcc: bool) -> Self {
        if use_bcc { Self::Bcc } else { Self::To }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bcc => "bcc",
            Self::Cc => "cc",
            Self::To => "to",
        }
    }
}

impl fmt::Display for SendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SendMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bcc" => Ok(Self::Bcc),
            "cc" => Ok(Self::Cc),
            "to" => Ok(Self::To),
            other => anyhow::bail!("Invalid send mode: {}", other),
        }
    }
}

/// MIME subtype of the message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailType {
    #[default]
    Html,
    Plain,
}

impl EmailType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Plain => "plain",
        }
    }
}

impl fmt::Display for EmailType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmailType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "html" => Ok(Self::Html),
            "plain" => Ok(Self::Plain),
            other => anyhow::bail!("Invalid email type: {} (expected html or plain)", other),
        }
    }
}

/// A stored email identity that send attempts are recorded against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub subject: String,
    pub body: String,
    pub sender: String,
    pub attachment_paths: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Template {
    /// Create a new template with a generated id.
    pub fn new(
        subject: impl Into<String>,
        body: impl Into<String>,
        sender: impl Into<String>,
        attachment_paths: Vec<String>,
    ) -> Self {
        Self {
            id: new_template_id(),
            subject: subject.into(),
            body: body.into(),
            sender: sender.into(),
            attachment_paths,
            // Microseconds, the precision the history database keeps.
            created_at: Utc::now().trunc_subsecs(6),
        }
    }

    /// Templates with the same content key belong to one campaign.
    pub fn content_key(&self) -> (&str, &str, &str) {
        (&self.subject, &self.sender, &self.body)
    }
}

/// 32 lowercase hex characters.
pub fn new_template_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentRecord {
    pub id: i64,
    pub template_id: String,
    pub recipient: String,
    pub send_mode: SendMode,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedRecord {
    pub id: i64,
    pub template_id: String,
    pub recipient: String,
    pub error_reason: String,
    pub failed_at: Option<DateTime<Utc>>,
    pub retried: bool,
}

pub fn join_list(items: &[String]) -> String {
    items.join(&LIST_SEPARATOR.to_string())
}

pub fn split_list(stored: &str) -> Vec<String> {
    stored
        .split(LIST_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
