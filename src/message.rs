//! Multipart message construction.

use crate::config::{AwsConfig, SenderConfig};
use crate::types::EmailType;
use anyhow::{Context, Result};
use lettre::Address;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, Message, MultiPart, SinglePart};
use std::fs;
use std::path::PathBuf;
use tracing::warn;

/// Who a message is sent as.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderProfile {
    /// Bare address or `Name <address>`.
    pub source_address: String,
    pub display_name: String,
    pub reply_to: String,
    pub default_to: String,
}

impl SenderProfile {
    pub fn from_config(aws: &AwsConfig, sender: &SenderConfig) -> Self {
        Self {
            source_address: aws.source_email.clone(),
            display_name: sender.sender_name.clone(),
            reply_to: sender.reply_to.clone(),
            default_to: sender.default_to.clone(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.source_address.trim().is_empty()
    }

    fn source_mailbox(&self) -> Result<Mailbox> {
        self.source_address
            .trim()
            .parse::<Mailbox>()
            .with_context(|| format!("Invalid source address '{}'", self.source_address))
    }

    /// Bare address part of the source.
    pub fn bare_source(&self) -> Result<String> {
        Ok(self.source_mailbox()?.email.to_string())
    }

    /// A name embedded in the source address wins over the display name.
    pub fn from_mailbox(&self) -> Result<Mailbox> {
        let source = self.source_mailbox()?;
        if source.name.is_some() {
            return Ok(source);
        }
        let name = self.display_name.trim();
        Ok(Mailbox::new(
            (!name.is_empty()).then(|| name.to_string()),
            source.email,
        ))
    }

    /// `Name <address>` or the bare address, as stored on templates.
    pub fn formatted_from(&self) -> Result<String> {
        let mailbox = self.from_mailbox()?;
        Ok(match &mailbox.name {
            Some(name) => format!("{} <{}>", name, mailbox.email),
            None => mailbox.email.to_string(),
        })
    }

    /// The visible `To`: the configured default or the bare source.
    pub fn to_address(&self) -> Result<Address> {
        self.fallback_address(&self.default_to, "default To")
    }

    pub fn reply_to_address(&self) -> Result<Address> {
        self.fallback_address(&self.reply_to, "Reply-To")
    }

    fn fallback_address(&self, configured: &str, what: &str) -> Result<Address> {
        let configured = configured.trim();
        if configured.is_empty() {
            return Ok(self.source_mailbox()?.email);
        }
        configured
            .parse::<Address>()
            .with_context(|| format!("Invalid {} address '{}'", what, configured))
    }
}

/// What is being sent, independent of who receives it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Composition {
    pub subject: String,
    pub body: String,
    pub email_type: EmailType,
    pub attachments: Vec<PathBuf>,
}

impl Composition {
    pub fn attachment_strings(&self) -> Vec<String> {
        self.attachments
            .iter()
            .map(|path| path.display().to_string())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct BuiltMessage {
    pub raw: Vec<u8>,
    /// Formatted `From`, as stored on templates.
    pub from: String,
    /// Bare address of the visible `To` header.
    pub visible_to: String,
    pub skipped_attachments: Vec<PathBuf>,
}

pub fn build_message(composition: &Composition, profile: &SenderProfile) -> Result<BuiltMessage> {
    let from = profile.from_mailbox()?;
    let to = profile.to_address()?;
    let reply_to = profile.reply_to_address()?;

    let body_part = match composition.email_type {
        EmailType::Html => SinglePart::html(composition.body.clone()),
        EmailType::Plain => SinglePart::plain(composition.body.clone()),
    };
    let mut multipart = MultiPart::mixed().singlepart(body_part);

    let octet_stream = ContentType::parse("application/octet-stream")
        .context("Invalid attachment content type")?;
    let mut skipped_attachments = Vec::new();
    for path in &composition.attachments {
        let Some(filename) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            warn!(path = %path.display(), "Attachment has no file name, skipping");
            skipped_attachments.push(path.clone());
            continue;
        };
        match fs::read(path) {
            Ok(bytes) => {
                multipart = multipart
                    .singlepart(Attachment::new(filename).body(bytes, octet_stream.clone()));
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not read attachment, skipping");
                skipped_attachments.push(path.clone());
            }
        }
    }

    let message = Message::builder()
        .from(from)
        .reply_to(Mailbox::new(None, reply_to))
        .to(Mailbox::new(None, to.clone()))
        .subject(composition.subject.clone())
        .multipart(multipart)
        .context("Failed to build message")?;

    Ok(BuiltMessage {
        raw: message.formatted(),
        from: profile.formatted_from()?,
        visible_to: to.to_string(),
        skipped_attachments,
    })
}
