use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SendState {
    #[default]
    Idle,
    Sending,
    Paused,
    Completed,
    Cancelled,
}

impl SendState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Sending => "sending",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Precondition failures of a send session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendSessionError {
    #[error("No recipients to send to")]
    NoRecipients,
    #[error("Batch size must be greater than zero")]
    InvalidBatchSize,
    #[error("Sender profile is incomplete: {0}")]
    IncompleteProfile(String),
    #[error("Cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: SendState,
    },
}

/// What the send loop should do at a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Checkpoint {
    Continue,
    Pause,
    Cancel,
}

#[derive(Debug, Default)]
struct ControlState {
    state: SendState,
    pause_requested: bool,
    cancel_requested: bool,
}

/// Cloneable handle for steering a session from other tasks.
///
/// Requests are only consumed by the send loop at chunk boundaries and once
/// per second while waiting between chunks.
#[derive(Debug, Clone, Default)]
pub struct SendControl {
    inner: Arc<Mutex<ControlState>>,
}

impl SendControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SendState {
        self.lock().state
    }

    pub fn pause(&self) -> Result<(), SendSessionError> {
        let mut inner = self.lock();
        match inner.state {
            SendState::Sending => {
                inner.pause_requested = true;
                Ok(())
            }
            state => Err(SendSessionError::InvalidState {
                action: "pause",
                state,
            }),
        }
    }

    /// A paused session is cancelled on the spot; a sending one stops at its
    /// next checkpoint.
    pub fn cancel(&self) -> Result<(), SendSessionError> {
        let mut inner = self.lock();
        match inner.state {
            SendState::Sending => {
                inner.cancel_requested = true;
                Ok(())
            }
            SendState::Paused => {
                inner.state = SendState::Cancelled;
                inner.pause_requested = false;
                inner.cancel_requested = false;
                Ok(())
            }
            state => Err(SendSessionError::InvalidState {
                action: "cancel",
                state,
            }),
        }
    }

    /// Enter `Sending` from any state in `allowed`, clearing stale requests.
    pub(crate) fn begin(
        &self,
        action: &'static str,
        allowed: &[SendState],
    ) -> Result<(), SendSessionError> {
        let mut inner = self.lock();
        if !allowed.contains(&inner.state) {
            return Err(SendSessionError::InvalidState {
                action,
                state: inner.state,
            });
        }
        inner.state = SendState::Sending;
        inner.pause_requested = false;
        inner.cancel_requested = false;
        Ok(())
    }

    /// Consume a pending request. Cancel wins over pause.
    pub(crate) fn checkpoint(&self) -> Checkpoint {
        let mut inner = self.lock();
        if inner.cancel_requested {
            inner.cancel_requested = false;
            inner.pause_requested = false;
            inner.state = SendState::Cancelled;
            Checkpoint::Cancel
        } else if inner.pause_requested {
            inner.pause_requested = false;
            inner.state = SendState::Paused;
            Checkpoint::Pause
        } else {
            Checkpoint::Continue
        }
    }

    pub(crate) fn finish(&self, state: SendState) {
        let mut inner = self.lock();
        inner.state = state;
        inner.pause_requested = false;
        inner.cancel_requested = false;
    }
}
