use crate::config::AwsConfig;
use aws_config::BehaviorVersion;
use aws_sdk_sesv2::Client;
use aws_sdk_sesv2::config::{Credentials, Region};
use aws_sdk_sesv2::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_sesv2::primitives::Blob;
use aws_sdk_sesv2::types::{Destination, EmailContent, RawMessage};
use tracing::{debug, info};

/// Why a provider call did not deliver. Either way every recipient of the
/// call is recorded as failed with `reason()`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The provider answered with a structured error.
    #[error("{0}")]
    Rejected(String),
    /// The request never got a structured answer.
    #[error("{0}")]
    Transport(String),
}

impl SendError {
    pub fn reason(&self) -> &str {
        match self {
            Self::Rejected(reason) | Self::Transport(reason) => reason,
        }
    }
}

// ============================================================================
// EmailProvider trait
// ============================================================================

/// Raw-message transport. One call is one delivery attempt; implementations
/// do not retry.
#[allow(async_fn_in_trait)]
pub trait EmailProvider: Send + Sync {
    /// Returns the provider's message id.
    async fn send_raw(
        &self,
        from: &str,
        to: &[String],
        bcc: &[String],
        raw: &[u8],
    ) -> Result<String, SendError>;
}

// ============================================================================
// SesProvider: AWS SES v2 implementation
// ============================================================================

pub struct SesProvider {
    ses_client: Client,
}

impl SesProvider {
    pub fn new(ses_client: Client) -> Self {
        Self { ses_client }
    }

    /// Region from the settings; static credentials when both keys are set,
    /// the default AWS chain otherwise.
    pub async fn from_config(aws: &AwsConfig) -> Self {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(aws.region.clone()));
        if aws.has_static_credentials() {
            loader = loader.credentials_provider(Credentials::new(
                aws.access_key_id.clone(),
                aws.secret_access_key.clone(),
                None,
                None,
                "sesmail-settings",
            ));
        }
        let sdk_config = loader.load().await;
        info!(region = %aws.region, "SES client initialized");
        Self::new(Client::new(&sdk_config))
    }
}

impl EmailProvider for SesProvider {
    async fn send_raw(
        &self,
        from: &str,
        to: &[String],
        bcc: &[String],
        raw: &[u8],
    ) -> Result<String, SendError> {
        let raw_message = RawMessage::builder()
            .data(Blob::new(raw))
            .build()
            .map_err(|e| SendError::Transport(format!("Failed to build raw message: {}", e)))?;
        let destination = Destination::builder()
            .set_to_addresses(Some(to.to_vec()))
            .set_bcc_addresses((!bcc.is_empty()).then(|| bcc.to_vec()))
            .build();
        let content = EmailContent::builder().raw(raw_message).build();

        let response = self
            .ses_client
            .send_email()
            .from_email_address(from)
            .destination(destination)
            .content(content)
            .send()
            .await
            .map_err(|err| match err.as_service_error() {
                Some(service_err) => {
                    let code = service_err.code().unwrap_or("Error");
                    let message = service_err.message().unwrap_or("no message");
                    SendError::Rejected(format!("{}: {}", code, message))
                }
                None => SendError::Transport(DisplayErrorContext(&err).to_string()),
            })?;

        let message_id = response.message_id().unwrap_or_default().to_string();
        debug!(
            message_id = %message_id,
            to = to.len(),
            bcc = bcc.len(),
            "Raw email sent"
        );
        Ok(message_id)
    }
}

// ============================================================================
// Test utilities
// ============================================================================
