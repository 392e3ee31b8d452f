//! Chunked send loop with pause, resume, cancel and retry.

pub mod control;
pub mod progress;

pub use control::{SendControl, SendSessionError, SendState};
pub use progress::{NoopSink, ProgressEvent, ProgressSink, TracingSink};

use crate::config::BatchConfig;
use crate::message::{BuiltMessage, Composition, SenderProfile, build_message};
use crate::provider::{EmailProvider, SendError};
use crate::storage::Storage;
use crate::types::{SendMode, Template};
use anyhow::Context;
use chrono::{DateTime, Utc};
use control::Checkpoint;
use progress::short_message_id;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const WAIT_STEP: Duration = Duration::from_secs(1);

// ============================================================================
// Requests and run state
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub delay: Duration,
    pub use_bcc: bool,
}

impl BatchSettings {
    pub fn from_config(batch: &BatchConfig) -> anyhow::Result<Self> {
        let delay = Duration::try_from_secs_f64(batch.delay_seconds.max(0.0)).with_context(|| {
            format!("Batch delay of {} seconds is out of range", batch.delay_seconds)
        })?;
        Ok(Self {
            batch_size: batch.batch_size,
            delay,
            use_bcc: batch.use_bcc,
        })
    }

    pub fn send_mode(&self) -> SendMode {
        SendMode::from_use_bcc(self.use_bcc)
    }
}

/// Whether a retry marks the failed records it consumed once it delivers
/// their recipients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    pub mark_retried_on_success: bool,
}

impl RetryPolicy {
    pub fn from_config(batch: &BatchConfig) -> Self {
        Self {
            mark_retried_on_success: batch.mark_retried_on_success,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendRequest {
    pub recipients: Vec<String>,
    pub composition: Composition,
    pub settings: BatchSettings,
}

/// A recipient whose batch failed in the current run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedEntry {
    pub recipient: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    /// Id of the stored failed record, when recording succeeded.
    pub record_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunProgress {
    pub total_sent: usize,
    pub total_failed: usize,
    pub failed_list: Vec<FailedEntry>,
    /// Next chunk to send; a resumed run starts here.
    pub current_batch_index: usize,
    pub total_batches: usize,
    pub current_template_id: Option<String>,
}

struct ActiveRun {
    request: SendRequest,
    /// Failed-record ids consumed by a retry, by recipient.
    retried_ids: HashMap<String, Vec<i64>>,
}

pub fn chunk_recipients(recipients: &[String], batch_size: usize) -> Vec<&[String]> {
    if batch_size == 0 {
        return Vec::new();
    }
    recipients.chunks(batch_size).collect()
}

pub fn total_batches(recipient_count: usize, batch_size: usize) -> usize {
    if batch_size == 0 {
        return 0;
    }
    recipient_count.div_ceil(batch_size)
}

// ============================================================================
// SendSession
// ============================================================================

pub struct SendSession<S: Storage, P: EmailProvider> {
    storage: Arc<S>,
    provider: Arc<P>,
    profile: SenderProfile,
    retry_policy: RetryPolicy,
    control: SendControl,
    run: Option<ActiveRun>,
    progress: RunProgress,
}

impl<S: Storage, P: EmailProvider> SendSession<S, P> {
    pub fn new(
        storage: Arc<S>,
        provider: Arc<P>,
        profile: SenderProfile,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            storage,
            provider,
            profile,
            retry_policy,
            control: SendControl::new(),
            run: None,
            progress: RunProgress::default(),
        }
    }

    /// Use an existing control handle, e.g. one already given to a signal handler.
    pub fn with_control(mut self, control: SendControl) -> Self {
        self.control = control;
        self
    }

    pub fn control(&self) -> SendControl {
        self.control.clone()
    }

    pub fn state(&self) -> SendState {
        self.control.state()
    }

    pub fn progress(&self) -> &RunProgress {
        &self.progress
    }

    /// Run `request` from its first chunk. Returns the state the run stopped
    /// in: `Completed`, `Paused` or `Cancelled`.
    pub async fn start(
        &mut self,
        request: SendRequest,
        sink: &impl ProgressSink,
    ) -> Result<SendState, SendSessionError> {
        self.check_request(&request)?;
        self.control.begin(
            "start",
            &[
                SendState::Idle,
                SendState::Paused,
                SendState::Completed,
                SendState::Cancelled,
            ],
        )?;

        self.progress = RunProgress {
            total_batches: total_batches(request.recipients.len(), request.settings.batch_size),
            ..RunProgress::default()
        };
        self.run = Some(ActiveRun {
            request,
            retried_ids: HashMap::new(),
        });
        self.emit_started(sink);
        Ok(self.run_batches(sink).await)
    }

    /// Continue a paused run at its cursor, keeping its totals and template.
    pub async fn resume(&mut self, sink: &impl ProgressSink) -> Result<SendState, SendSessionError> {
        if self.run.is_none() {
            return Err(SendSessionError::InvalidState {
                action: "resume",
                state: self.state(),
            });
        }
        self.control.begin("resume", &[SendState::Paused])?;
        info!(
            batch_index = self.progress.current_batch_index,
            total_batches = self.progress.total_batches,
            "Resuming send"
        );
        Ok(self.run_batches(sink).await)
    }

    /// New run over exactly the recipients in `failed`, with the composition
    /// and settings of the previous run. `total_sent` carries over.
    pub async fn retry(
        &mut self,
        failed: &[FailedEntry],
        sink: &impl ProgressSink,
    ) -> Result<SendState, SendSessionError> {
        let Some(previous) = self.run.as_ref() else {
            return Err(SendSessionError::InvalidState {
                action: "retry",
                state: self.state(),
            });
        };
        let request = SendRequest {
            recipients: failed.iter().map(|entry| entry.recipient.clone()).collect(),
            composition: previous.request.composition.clone(),
            settings: previous.request.settings.clone(),
        };
        self.check_request(&request)?;
        self.control.begin(
            "retry",
            &[SendState::Paused, SendState::Completed, SendState::Cancelled],
        )?;

        let mut retried_ids: HashMap<String, Vec<i64>> = HashMap::new();
        for entry in failed {
            if let Some(id) = entry.record_id {
                retried_ids.entry(entry.recipient.clone()).or_default().push(id);
            }
        }

        self.progress = RunProgress {
            total_sent: self.progress.total_sent,
            total_batches: total_batches(request.recipients.len(), request.settings.batch_size),
            ..RunProgress::default()
        };
        self.run = Some(ActiveRun {
            request,
            retried_ids,
        });
        info!(recipients = failed.len(), "Retrying failed recipients");
        self.emit_started(sink);
        Ok(self.run_batches(sink).await)
    }

    fn check_request(&self, request: &SendRequest) -> Result<(), SendSessionError> {
        if request.recipients.is_empty() {
            return Err(SendSessionError::NoRecipients);
        }
        if request.settings.batch_size == 0 {
            return Err(SendSessionError::InvalidBatchSize);
        }
        if !self.profile.is_complete() {
            return Err(SendSessionError::IncompleteProfile(
                "source address is not set".to_string(),
            ));
        }
        let addresses = self
            .profile
            .from_mailbox()
            .and(self.profile.to_address())
            .and(self.profile.reply_to_address());
        if let Err(e) = addresses {
            return Err(SendSessionError::IncompleteProfile(e.to_string()));
        }
        Ok(())
    }

    fn emit_started(&self, sink: &impl ProgressSink) {
        if let Some(run) = &self.run {
            let settings = &run.request.settings;
            sink.emit(ProgressEvent::Started {
                total_recipients: run.request.recipients.len(),
                total_batches: self.progress.total_batches,
                batch_size: settings.batch_size,
                delay_seconds: settings.delay.as_secs_f64(),
            });
        }
    }

    async fn run_batches(&mut self, sink: &impl ProgressSink) -> SendState {
        let Some(run) = self.run.as_ref() else {
            self.control.finish(SendState::Idle);
            return SendState::Idle;
        };
        let settings = run.request.settings.clone();
        let composition = run.request.composition.clone();
        let chunks: Vec<Vec<String>> = chunk_recipients(&run.request.recipients, settings.batch_size)
            .into_iter()
            .map(<[String]>::to_vec)
            .collect();

        while self.progress.current_batch_index < chunks.len() {
            match self.control.checkpoint() {
                Checkpoint::Continue => {}
                Checkpoint::Pause => return self.paused(sink),
                Checkpoint::Cancel => return self.finished(SendState::Cancelled, sink),
            }

            let index = self.progress.current_batch_index;
            let chunk = &chunks[index];
            sink.emit(ProgressEvent::BatchStarted {
                batch: index + 1,
                total_batches: chunks.len(),
                batch_size: chunk.len(),
            });

            let built = build_message(&composition, &self.profile);
            let outcome = match &built {
                Ok(message) => self.deliver(message, chunk, &settings).await,
                Err(e) => Err(SendError::Transport(format!("Failed to build message: {:#}", e))),
            };
            let sender = match &built {
                Ok(message) => message.from.clone(),
                Err(_) => self.profile.source_address.clone(),
            };

            match outcome {
                Ok(message_id) => {
                    self.record_success(&composition, &sender, chunk, settings.send_mode())
                        .await;
                    sink.emit(ProgressEvent::BatchSent {
                        batch: index + 1,
                        sent: chunk.len(),
                        total_sent: self.progress.total_sent,
                        total_failed: self.progress.total_failed,
                        message_id: short_message_id(&message_id),
                    });
                }
                Err(send_error) => {
                    self.record_failure(&composition, &sender, chunk, send_error.reason())
                        .await;
                    sink.emit(ProgressEvent::BatchFailed {
                        batch: index + 1,
                        failed: chunk.len(),
                        total_sent: self.progress.total_sent,
                        total_failed: self.progress.total_failed,
                        error: send_error.reason().to_string(),
                    });
                }
            }

            self.progress.current_batch_index += 1;
            if self.progress.current_batch_index < chunks.len() {
                match wait_between_batches(settings.delay, &self.control, sink).await {
                    Checkpoint::Continue => {}
                    Checkpoint::Pause => return self.paused(sink),
                    Checkpoint::Cancel => return self.finished(SendState::Cancelled, sink),
                }
            }
        }

        self.finished(SendState::Completed, sink)
    }

    async fn deliver(
        &self,
        message: &BuiltMessage,
        chunk: &[String],
        settings: &BatchSettings,
    ) -> Result<String, SendError> {
        if settings.use_bcc {
            let to = vec![message.visible_to.clone()];
            self.provider
                .send_raw(&message.from, &to, chunk, &message.raw)
                .await
        } else {
            self.provider
                .send_raw(&message.from, chunk, &[], &message.raw)
                .await
        }
    }

    fn paused(&self, sink: &impl ProgressSink) -> SendState {
        sink.emit(ProgressEvent::Paused {
            batch_index: self.progress.current_batch_index,
        });
        SendState::Paused
    }

    fn finished(&self, state: SendState, sink: &impl ProgressSink) -> SendState {
        self.control.finish(state);
        sink.emit(ProgressEvent::Finished {
            state,
            total_sent: self.progress.total_sent,
            total_failed: self.progress.total_failed,
        });
        state
    }

    // ========================================================================
    // Outcome recording
    // ========================================================================

    /// The run's template, created on its first recorded outcome.
    async fn ensure_template(&mut self, composition: &Composition, sender: &str) -> Option<String> {
        if let Some(id) = &self.progress.current_template_id {
            return Some(id.clone());
        }
        let template = Template::new(
            composition.subject.clone(),
            composition.body.clone(),
            sender,
            composition.attachment_strings(),
        );
        match self.storage.insert_template(&template).await {
            Ok(()) => {
                debug!(template_id = %template.id, "Template created");
                self.progress.current_template_id = Some(template.id.clone());
                Some(template.id)
            }
            Err(e) => {
                error!(error = %format!("{:#}", e), "Failed to store template");
                None
            }
        }
    }

    async fn record_success(
        &mut self,
        composition: &Composition,
        sender: &str,
        chunk: &[String],
        mode: SendMode,
    ) {
        self.progress.total_sent += chunk.len();
        let Some(template_id) = self.ensure_template(composition, sender).await else {
            return;
        };
        if let Err(e) = self.storage.record_sent(&template_id, chunk, mode).await {
            error!(
                template_id = %template_id,
                recipients = chunk.len(),
                error = %format!("{:#}", e),
                "Failed to record sent emails"
            );
        }

        if !self.retry_policy.mark_retried_on_success {
            return;
        }
        let ids: Vec<i64> = match &self.run {
            Some(run) => chunk
                .iter()
                .filter_map(|recipient| run.retried_ids.get(recipient))
                .flatten()
                .copied()
                .collect(),
            None => Vec::new(),
        };
        if ids.is_empty() {
            return;
        }
        match self.storage.mark_failed_retried(&ids).await {
            Ok(marked) => debug!(marked, "Marked failed records retried"),
            Err(e) => error!(error = %format!("{:#}", e), "Failed to mark failed records retried"),
        }
    }

    async fn record_failure(
        &mut self,
        composition: &Composition,
        sender: &str,
        chunk: &[String],
        reason: &str,
    ) {
        self.progress.total_failed += chunk.len();
        let failed_at = Utc::now();
        let record_ids: Vec<Option<i64>> = match self.ensure_template(composition, sender).await {
            Some(template_id) => {
                match self.storage.record_failed(&template_id, chunk, reason).await {
                    Ok(ids) => ids.into_iter().map(Some).collect(),
                    Err(e) => {
                        error!(
                            template_id = %template_id,
                            recipients = chunk.len(),
                            error = %format!("{:#}", e),
                            "Failed to record failed emails"
                        );
                        Vec::new()
                    }
                }
            }
            None => Vec::new(),
        };

        warn!(recipients = chunk.len(), reason = %reason, "Batch failed");
        for (i, recipient) in chunk.iter().enumerate() {
            self.progress.failed_list.push(FailedEntry {
                recipient: recipient.clone(),
                error: reason.to_string(),
                failed_at,
                record_id: record_ids.get(i).copied().flatten(),
            });
        }
    }
}

/// Sleep `delay` in one-second steps, consuming pause and cancel requests
/// before each step.
async fn wait_between_batches(
    delay: Duration,
    control: &SendControl,
    sink: &impl ProgressSink,
) -> Checkpoint {
    let mut remaining = delay;
    while !remaining.is_zero() {
        match control.checkpoint() {
            Checkpoint::Continue => {}
            other => return other,
        }
        sink.emit(ProgressEvent::Waiting {
            seconds_remaining: remaining.as_secs_f64().ceil() as u64,
        });
        let step = remaining.min(WAIT_STEP);
        tokio::time::sleep(step).await;
        remaining -= step;
    }
    Checkpoint::Continue
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::progress::test_utils::CollectingSink;
    use super::*;
    use crate::provider::test_utils::FakeProvider;
    use crate::storage::SqliteStorage;
    use crate::storage::test_utils::memory_storage;
    use crate::types::EmailType;

    fn recipients(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("user{}@example.com", i)).collect()
    }

    fn request(recipients: Vec<String>, batch_size: usize) -> SendRequest {
        SendRequest {
            recipients,
            composition: Composition {
                subject: "Launch".to_string(),
                body: "<p>We're live</p>".to_string(),
                email_type: EmailType::Html,
                attachments: vec![],
            },
            settings: BatchSettings {
                batch_size,
                delay: Duration::ZERO,
                use_bcc: true,
            },
        }
    }

    fn profile() -> SenderProfile {
        SenderProfile {
            source_address: "news@acme.com".to_string(),
            display_name: "Acme".to_string(),
            reply_to: String::new(),
            default_to: "list@acme.com".to_string(),
        }
    }

    async fn session(
        provider: FakeProvider,
        policy: RetryPolicy,
    ) -> (
        SendSession<SqliteStorage, FakeProvider>,
        Arc<SqliteStorage>,
        Arc<FakeProvider>,
    ) {
        let storage = Arc::new(memory_storage().await);
        let provider = Arc::new(provider);
        let session = SendSession::new(storage.clone(), provider.clone(), profile(), policy);
        (session, storage, provider)
    }

    fn rejected(reason: &str) -> SendError {
        SendError::Rejected(reason.to_string())
    }

    // -----------------------------------------------------------------------
    // Chunking
    // -----------------------------------------------------------------------

    #[test]
    fn chunks_cover_recipients_in_order() {
        for (count, batch_size) in [(120, 50), (100, 50), (1, 50), (7, 1), (3, 10)] {
            let all = recipients(count);
            let chunks = chunk_recipients(&all, batch_size);

            assert_eq!(chunks.len(), total_batches(count, batch_size));
            assert_eq!(chunks.concat(), all);
            for chunk in &chunks[..chunks.len() - 1] {
                assert_eq!(chunk.len(), batch_size);
            }
        }
    }

    #[test]
    fn zero_batch_size_yields_no_chunks() {
        assert!(chunk_recipients(&recipients(3), 0).is_empty());
        assert_eq!(total_batches(3, 0), 0);
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn failing_middle_chunk_is_recorded_and_run_completes() {
        let provider = FakeProvider::failing_on(vec![(2, rejected("MessageRejected: Throttled"))]);
        let (mut session, storage, provider) = session(provider, RetryPolicy::default()).await;
        let sink = CollectingSink::default();

        let state = session.start(request(recipients(120), 50), &sink).await.unwrap();

        assert_eq!(state, SendState::Completed);
        assert_eq!(session.state(), SendState::Completed);
        let progress = session.progress();
        assert_eq!(progress.total_sent, 70);
        assert_eq!(progress.total_failed, 50);
        assert_eq!(progress.failed_list.len(), 50);
        assert!(progress.failed_list.iter().all(|f| f.record_id.is_some()));
        assert_eq!(progress.failed_list[0].recipient, "user50@example.com");
        assert_eq!(provider.call_count(), 3);

        let counts = storage.table_counts().await.unwrap();
        assert_eq!(counts.templates, 1);
        assert_eq!(counts.sent_records, 70);
        assert_eq!(counts.failed_records, 50);

        let events = sink.events();
        assert!(matches!(
            events.first(),
            Some(ProgressEvent::Started {
                total_recipients: 120,
                total_batches: 3,
                ..
            })
        ));
        assert!(events.contains(&ProgressEvent::BatchFailed {
            batch: 2,
            failed: 50,
            total_sent: 50,
            total_failed: 50,
            error: "MessageRejected: Throttled".to_string(),
        }));
        assert_eq!(
            events.last(),
            Some(&ProgressEvent::Finished {
                state: SendState::Completed,
                total_sent: 70,
                total_failed: 50,
            })
        );
    }

    #[tokio::test]
    async fn bcc_mode_hides_recipients_behind_visible_to() {
        let (mut session, storage, provider) =
            session(FakeProvider::reliable(), RetryPolicy::default()).await;
        session
            .start(request(recipients(3), 2), &NoopSink)
            .await
            .unwrap();

        let calls = provider.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].from, "Acme <news@acme.com>");
        assert_eq!(calls[0].to, vec!["list@acme.com".to_string()]);
        assert_eq!(calls[0].bcc, recipients(2));
        assert_eq!(calls[1].bcc, vec!["user2@example.com".to_string()]);

        let template_id = session.progress().current_template_id.clone().unwrap();
        let records = storage.sent_records(&[template_id]).await.unwrap();
        assert!(records.iter().all(|r| r.send_mode == SendMode::Bcc));
    }

    #[tokio::test]
    async fn to_mode_addresses_chunk_directly() {
        let (mut session, storage, provider) =
            session(FakeProvider::reliable(), RetryPolicy::default()).await;
        let mut req = request(recipients(2), 5);
        req.settings.use_bcc = false;
        session.start(req, &NoopSink).await.unwrap();

        let calls = provider.calls();
        assert_eq!(calls[0].to, recipients(2));
        assert!(calls[0].bcc.is_empty());

        let template_id = session.progress().current_template_id.clone().unwrap();
        let records = storage.sent_records(&[template_id]).await.unwrap();
        assert!(records.iter().all(|r| r.send_mode == SendMode::To));
    }

    #[tokio::test]
    async fn run_reuses_one_template_across_outcomes() {
        let provider = FakeProvider::failing_on(vec![(1, rejected("Bad"))]);
        let (mut session, storage, _) = session(provider, RetryPolicy::default()).await;
        session
            .start(request(recipients(4), 1), &NoopSink)
            .await
            .unwrap();

        let templates = storage.list_templates().await.unwrap();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].sender, "Acme <news@acme.com>");
        assert_eq!(templates[0].subject, "Launch");
        assert_eq!(
            session.progress().current_template_id.as_deref(),
            Some(templates[0].id.as_str())
        );
    }

    #[test]
    fn batch_settings_reject_delay_too_large_for_a_duration() {
        let mut batch = BatchConfig::default();
        batch.delay_seconds = 1e300;
        assert!(BatchSettings::from_config(&batch).is_err());

        batch.delay_seconds = 2.5;
        let settings = BatchSettings::from_config(&batch).unwrap();
        assert_eq!(settings.delay, Duration::from_millis(2500));
    }

    // -----------------------------------------------------------------------
    // Pause, resume and cancel
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn pause_then_resume_sends_remaining_chunks_once() {
        let control = SendControl::new();
        let pauser = control.clone();
        let provider = FakeProvider::reliable().with_hook(move |call| {
            if call == 2 {
                pauser.pause().unwrap();
            }
        });
        let (session, storage, provider) = session(provider, RetryPolicy::default()).await;
        let mut session = session.with_control(control);
        let sink = CollectingSink::default();

        let state = session.start(request(recipients(5), 1), &sink).await.unwrap();
        assert_eq!(state, SendState::Paused);
        assert_eq!(session.state(), SendState::Paused);
        assert_eq!(session.progress().current_batch_index, 2);
        assert_eq!(session.progress().total_sent, 2);
        assert_eq!(provider.call_count(), 2);
        assert!(sink.events().contains(&ProgressEvent::Paused { batch_index: 2 }));
        let template_id = session.progress().current_template_id.clone();

        let state = session.resume(&sink).await.unwrap();
        assert_eq!(state, SendState::Completed);
        assert_eq!(provider.call_count(), 5);
        let progress = session.progress();
        assert_eq!(progress.total_sent + progress.total_failed, 5);
        assert_eq!(progress.current_template_id, template_id);

        // Every recipient was delivered exactly once.
        let bcc: Vec<String> = provider.calls().into_iter().flat_map(|c| c.bcc).collect();
        assert_eq!(bcc, recipients(5));
        assert_eq!(storage.table_counts().await.unwrap().templates, 1);
    }

    #[tokio::test]
    async fn cancel_stops_at_next_boundary_with_partial_counts() {
        let control = SendControl::new();
        let canceller = control.clone();
        let provider = FakeProvider::reliable().with_hook(move |call| {
            if call == 1 {
                canceller.cancel().unwrap();
            }
        });
        let (session, _, provider) = session(provider, RetryPolicy::default()).await;
        let mut session = session.with_control(control);
        let sink = CollectingSink::default();

        let state = session.start(request(recipients(3), 1), &sink).await.unwrap();

        assert_eq!(state, SendState::Cancelled);
        assert_eq!(provider.call_count(), 1);
        assert_eq!(session.progress().total_sent, 1);
        assert_eq!(session.progress().current_batch_index, 1);
        assert_eq!(
            sink.events().last(),
            Some(&ProgressEvent::Finished {
                state: SendState::Cancelled,
                total_sent: 1,
                total_failed: 0,
            })
        );
    }

    #[tokio::test]
    async fn cancel_during_delay_ends_run_before_next_chunk() {
        let control = SendControl::new();
        let canceller = control.clone();
        let provider = FakeProvider::reliable().with_hook(move |call| {
            if call == 1 {
                let canceller = canceller.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(300));
                    canceller.cancel().unwrap();
                });
            }
        });
        let (session, _, provider) = session(provider, RetryPolicy::default()).await;
        let mut session = session.with_control(control);
        let sink = CollectingSink::default();
        let mut req = request(recipients(3), 1);
        req.settings.delay = Duration::from_secs(30);

        let started = std::time::Instant::now();
        let state = session.start(req, &sink).await.unwrap();

        assert_eq!(state, SendState::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(provider.call_count(), 1);
        assert_eq!(session.progress().current_batch_index, 1);
        assert_eq!(session.progress().total_sent, 1);
        let waits = sink
            .events()
            .into_iter()
            .filter(|e| matches!(e, ProgressEvent::Waiting { .. }))
            .count();
        assert!(waits >= 1 && waits < 30);
        assert_eq!(
            sink.events().last(),
            Some(&ProgressEvent::Finished {
                state: SendState::Cancelled,
                total_sent: 1,
                total_failed: 0,
            })
        );
    }

    #[tokio::test]
    async fn cancelling_paused_session_prevents_resume() {
        let control = SendControl::new();
        let pauser = control.clone();
        let provider = FakeProvider::reliable().with_hook(move |call| {
            if call == 1 {
                pauser.pause().unwrap();
            }
        });
        let (session, _, provider) = session(provider, RetryPolicy::default()).await;
        let mut session = session.with_control(control);

        session
            .start(request(recipients(3), 1), &NoopSink)
            .await
            .unwrap();
        session.control().cancel().unwrap();

        assert_eq!(session.state(), SendState::Cancelled);
        assert_eq!(
            session.resume(&NoopSink).await,
            Err(SendSessionError::InvalidState {
                action: "resume",
                state: SendState::Cancelled,
            })
        );
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn resume_without_pause_is_rejected() {
        let (mut session, _, _) = session(FakeProvider::reliable(), RetryPolicy::default()).await;
        assert!(session.resume(&NoopSink).await.is_err());
        assert!(session.control().pause().is_err());
    }

    // -----------------------------------------------------------------------
    // Preconditions
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn invalid_requests_fail_before_any_chunk() {
        let (mut session, _, provider) =
            session(FakeProvider::reliable(), RetryPolicy::default()).await;

        assert_eq!(
            session.start(request(vec![], 5), &NoopSink).await,
            Err(SendSessionError::NoRecipients)
        );
        assert_eq!(
            session.start(request(recipients(2), 0), &NoopSink).await,
            Err(SendSessionError::InvalidBatchSize)
        );
        assert_eq!(session.state(), SendState::Idle);
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn incomplete_profile_is_rejected() {
        let storage = Arc::new(memory_storage().await);
        let provider = Arc::new(FakeProvider::reliable());
        let mut session = SendSession::new(
            storage,
            provider.clone(),
            SenderProfile::default(),
            RetryPolicy::default(),
        );

        let result = session.start(request(recipients(2), 5), &NoopSink).await;
        assert!(matches!(result, Err(SendSessionError::IncompleteProfile(_))));
        assert_eq!(provider.call_count(), 0);
    }

    // -----------------------------------------------------------------------
    // Retry
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn retry_resends_failed_recipients_and_keeps_total_sent() {
        let provider = FakeProvider::failing_on(vec![(1, rejected("Throttled"))]);
        let (mut session, storage, provider) = session(provider, RetryPolicy::default()).await;
        session
            .start(request(recipients(4), 2), &NoopSink)
            .await
            .unwrap();
        let failed = session.progress().failed_list.clone();
        let first_template = session.progress().current_template_id.clone().unwrap();
        assert_eq!(failed.len(), 2);

        let state = session.retry(&failed, &NoopSink).await.unwrap();

        assert_eq!(state, SendState::Completed);
        let progress = session.progress();
        assert_eq!(progress.total_sent, 4);
        assert_eq!(progress.total_failed, 0);
        assert!(progress.failed_list.is_empty());
        assert_ne!(progress.current_template_id.as_deref(), Some(first_template.as_str()));
        assert_eq!(provider.calls()[2].bcc, recipients(2));
        assert_eq!(storage.table_counts().await.unwrap().templates, 2);

        // Default policy leaves the first run's failures unmarked.
        let unretried = storage.unretried_failed_records(&first_template).await.unwrap();
        assert_eq!(unretried.len(), 2);
    }

    #[tokio::test]
    async fn retry_marks_consumed_failures_when_enabled() {
        let provider = FakeProvider::failing_on(vec![(1, rejected("Throttled"))]);
        let policy = RetryPolicy {
            mark_retried_on_success: true,
        };
        let (mut session, storage, _) = session(provider, policy).await;
        session
            .start(request(recipients(4), 2), &NoopSink)
            .await
            .unwrap();
        let failed = session.progress().failed_list.clone();
        let first_template = session.progress().current_template_id.clone().unwrap();

        session.retry(&failed, &NoopSink).await.unwrap();

        let unretried = storage.unretried_failed_records(&first_template).await.unwrap();
        assert!(unretried.is_empty());
        assert_eq!(storage.table_counts().await.unwrap().failed_records, 2);
    }

    #[tokio::test]
    async fn retry_requires_a_previous_run() {
        let (mut session, _, _) = session(FakeProvider::reliable(), RetryPolicy::default()).await;
        let entry = FailedEntry {
            recipient: "a@x.com".to_string(),
            error: "Throttled".to_string(),
            failed_at: Utc::now(),
            record_id: None,
        };
        assert!(matches!(
            session.retry(&[entry], &NoopSink).await,
            Err(SendSessionError::InvalidState { action: "retry", .. })
        ));
    }

    // -----------------------------------------------------------------------
    // Delay between batches
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn short_delay_emits_waiting_between_batches_only() {
        let (mut session, _, _) = session(FakeProvider::reliable(), RetryPolicy::default()).await;
        let sink = CollectingSink::default();
        let mut req = request(recipients(2), 1);
        req.settings.delay = Duration::from_millis(20);

        session.start(req, &sink).await.unwrap();

        let waits: Vec<_> = sink
            .events()
            .into_iter()
            .filter(|e| matches!(e, ProgressEvent::Waiting { .. }))
            .collect();
        assert_eq!(waits, vec![ProgressEvent::Waiting { seconds_remaining: 1 }]);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_counts_down_in_seconds() {
        let control = SendControl::new();
        control.begin("start", &[SendState::Idle]).unwrap();
        let sink = CollectingSink::default();

        let outcome = wait_between_batches(Duration::from_secs(3), &control, &sink).await;

        assert_eq!(outcome, Checkpoint::Continue);
        assert_eq!(
            sink.events(),
            vec![
                ProgressEvent::Waiting { seconds_remaining: 3 },
                ProgressEvent::Waiting { seconds_remaining: 2 },
                ProgressEvent::Waiting { seconds_remaining: 1 },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pause_during_wait_is_honored_within_a_second() {
        let control = SendControl::new();
        control.begin("start", &[SendState::Idle]).unwrap();
        let pauser = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            pauser.pause().unwrap();
        });
        let sink = CollectingSink::default();

        let outcome = wait_between_batches(Duration::from_secs(5), &control, &sink).await;

        assert_eq!(outcome, Checkpoint::Pause);
        assert_eq!(control.state(), SendState::Paused);
        assert_eq!(sink.events().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_wait_is_honored_within_a_second() {
        let control = SendControl::new();
        control.begin("start", &[SendState::Idle]).unwrap();
        let canceller = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            canceller.cancel().unwrap();
        });
        let sink = CollectingSink::default();

        let outcome = wait_between_batches(Duration::from_secs(10), &control, &sink).await;

        assert_eq!(outcome, Checkpoint::Cancel);
        assert_eq!(control.state(), SendState::Cancelled);
        assert_eq!(sink.events().len(), 3);
    }
}
