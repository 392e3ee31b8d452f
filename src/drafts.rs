//! Draft model and the explicit patch structure used for partial updates.
//!
//! Drafts are independent of send history: nothing here touches templates,
//! sent records or failed records.

use crate::types::{EmailType, join_list};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Draft {
    pub id: i64,
    pub name: String,
    pub subject: String,
    pub body: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub attachments: Vec<String>,
    pub email_type: EmailType,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Fields of a draft that is about to be created.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewDraft {
    pub name: String,
    pub subject: String,
    pub body: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub attachments: Vec<String>,
    pub email_type: EmailType,
}

impl NewDraft {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// The updatable columns of a draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DraftField {
    Name,
    Subject,
    Body,
    Sender,
    Recipients,
    Attachments,
    EmailType,
}

impl DraftField {
    pub fn column(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Subject => "subject",
            Self::Body => "body",
            Self::Sender => "sender",
            Self::Recipients => "recipients",
            Self::Attachments => "attachments",
            Self::EmailType => "email_type",
        }
    }
}

impl fmt::Display for DraftField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

impl FromStr for DraftField {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "name" => Ok(Self::Name),
            "subject" => Ok(Self::Subject),
            "body" => Ok(Self::Body),
            "sender" => Ok(Self::Sender),
            "recipients" => Ok(Self::Recipients),
            "attachments" => Ok(Self::Attachments),
            "email_type" => Ok(Self::EmailType),
            other => anyhow::bail!("Unknown draft field: {}", other),
        }
    }
}

/// A partial update: only the fields present are written.
///
/// Values are held in their stored form, so list fields are already joined
/// and the email type is already validated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DraftPatch {
    fields: BTreeMap<DraftField, String>,
}

impl DraftPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(self, name: impl Into<String>) -> Self {
        self.with(DraftField::Name, name.into())
    }

    pub fn subject(self, subject: impl Into<String>) -> Self {
        self.with(DraftField::Subject, subject.into())
    }

    pub fn body(self, body: impl Into<String>) -> Self {
        self.with(DraftField::Body, body.into())
    }

    pub fn sender(self, sender: impl Into<String>) -> Self {
        self.with(DraftField::Sender, sender.into())
    }

    pub fn recipients(self, recipients: &[String]) -> Self {
        self.with(DraftField::Recipients, join_list(recipients))
    }

    pub fn attachments(self, attachments: &[String]) -> Self {
        self.with(DraftField::Attachments, join_list(attachments))
    }

    pub fn email_type(self, email_type: EmailType) -> Self {
        self.with(DraftField::EmailType, email_type.as_str().to_string())
    }

    /// Set a field from its textual form, e.g. from `subject=Hello` on the
    /// command line. List fields take a comma-separated value.
    pub fn set(self, field: DraftField, value: &str) -> anyhow::Result<Self> {
        Ok(match field {
            DraftField::EmailType => self.email_type(EmailType::from_str(value)?),
            DraftField::Recipients => self.recipients(&crate::types::split_list(value)),
            DraftField::Attachments => self.attachments(&crate::types::split_list(value)),
            other => self.with(other, value.to_string()),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Fields in a stable order, with their stored values.
    pub fn fields(&self) -> impl Iterator<Item = (DraftField, &str)> {
        self.fields.iter().map(|(field, value)| (*field, value.as_str()))
    }

    fn with(mut self, field: DraftField, value: String) -> Self {
        self.fields.insert(field, value);
        self
    }
}
