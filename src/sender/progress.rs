use super::SendState;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

const MESSAGE_ID_DISPLAY_LEN: usize = 16;

/// Progress of a send run, emitted in order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started {
        total_recipients: usize,
        total_batches: usize,
        batch_size: usize,
        delay_seconds: f64,
    },
    BatchStarted {
        batch: usize,
        total_batches: usize,
        batch_size: usize,
    },
    BatchSent {
        batch: usize,
        sent: usize,
        total_sent: usize,
        total_failed: usize,
        message_id: String,
    },
    BatchFailed {
        batch: usize,
        failed: usize,
        total_sent: usize,
        total_failed: usize,
        error: String,
    },
    Waiting {
        seconds_remaining: u64,
    },
    Paused {
        batch_index: usize,
    },
    Finished {
        state: SendState,
        total_sent: usize,
        total_failed: usize,
    },
}

/// Shortened message id for progress display.
pub(crate) fn short_message_id(message_id: &str) -> String {
    message_id.chars().take(MESSAGE_ID_DISPLAY_LEN).collect()
}

/// Receives progress events. Must not block.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Discards every event.
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn emit(&self, _event: ProgressEvent) {}
}

impl ProgressSink for UnboundedSender<ProgressEvent> {
    fn emit(&self, event: ProgressEvent) {
        // A dropped receiver only means nobody is watching.
        let _ = self.send(event);
    }
}

/// Logs every event through `tracing`.
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn emit(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started {
                total_recipients,
                total_batches,
                batch_size,
                delay_seconds,
            } => info!(
                total_recipients,
                total_batches, batch_size, delay_seconds, "Starting send"
            ),
            ProgressEvent::BatchStarted {
                batch,
                total_batches,
                batch_size,
            } => info!(batch, total_batches, batch_size, "Sending batch"),
            ProgressEvent::BatchSent {
                batch,
                sent,
                total_sent,
                total_failed,
                message_id,
            } => info!(
                batch,
                sent,
                total_sent,
                total_failed,
                message_id = %message_id,
                "Batch sent"
            ),
            ProgressEvent::BatchFailed {
                batch,
                failed,
                total_sent,
                total_failed,
                error,
            } => warn!(
                batch,
                failed,
                total_sent,
                total_failed,
                error = %error,
                "Batch failed"
            ),
            ProgressEvent::Waiting { seconds_remaining } => {
                if seconds_remaining % 10 == 0 {
                    info!(seconds_remaining, "Waiting before next batch");
                }
            }
            ProgressEvent::Paused { batch_index } => {
                info!(batch_index, "Send paused")
            }
            ProgressEvent::Finished {
                state,
                total_sent,
                total_failed,
            } => info!(state = %state, total_sent, total_failed, "Send finished"),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_are_truncated_for_display() {
        assert_eq!(short_message_id("0100018f2c3d4e5f-abcdef"), "0100018f2c3d4e5f");
        assert_eq!(short_message_id("short"), "short");
    }

    #[test]
    fn events_serialize_with_snake_case_tag() {
        let json = serde_json::to_value(ProgressEvent::Waiting {
            seconds_remaining: 3,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"event": "waiting", "seconds_remaining": 3}));

        let json = serde_json::to_value(ProgressEvent::Finished {
            state: SendState::Completed,
            total_sent: 2,
            total_failed: 0,
        })
        .unwrap();
        assert_eq!(json["event"], "finished");
        assert_eq!(json["state"], "completed");
    }

    #[tokio::test]
    async fn channel_sink_forwards_in_order() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tx.emit(ProgressEvent::Paused { batch_index: 1 });
        tx.emit(ProgressEvent::Waiting {
            seconds_remaining: 0,
        });
        assert_eq!(rx.recv().await, Some(ProgressEvent::Paused { batch_index: 1 }));
        assert_eq!(
            rx.recv().await,
            Some(ProgressEvent::Waiting {
                seconds_remaining: 0
            })
        );
    }

    #[test]
    fn channel_sink_ignores_closed_receiver() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(rx);
        tx.emit(ProgressEvent::Paused { batch_index: 0 });
    }
}
