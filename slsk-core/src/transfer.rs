//! Transfer model: direction, state, and the events raised by transfer I/O.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::reader::{MessageError, ReadError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferDirection {
    Download,
    Upload,
}

impl TransferDirection {
    pub(crate) fn to_wire(self) -> i32 {
        match self {
            Self::Download => 0,
            Self::Upload => 1,
        }
    }

    pub(crate) fn from_wire(raw: i32) -> Result<Self, MessageError> {
        match raw {
            0 => Ok(Self::Download),
            1 => Ok(Self::Upload),
            other => Err(ReadError::InvalidValue {
                field: "transfer direction",
                value: i64::from(other),
            }
            .into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferState {
    Queued,
    Initializing,
    InProgress,
    Completed,
    Cancelled,
    TimedOut,
    Errored,
    Rejected,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::TimedOut | Self::Errored | Self::Rejected
        )
    }
}

/// One upload or download, identified by direction, username, and filename.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub direction: TransferDirection,
    pub username: String,
    pub filename: String,
    pub token: i32,
    pub size: i64,
    pub bytes_transferred: i64,
    pub state: TransferState,
    pub start_time: Option<SystemTime>,
    pub end_time: Option<SystemTime>,
    /// Why the transfer ended up `Errored` or `Rejected`.
    pub message: Option<String>,
}

impl Transfer {
    pub fn new(
        direction: TransferDirection,
        username: impl Into<String>,
        filename: impl Into<String>,
        token: i32,
    ) -> Self {
        Self {
            direction,
            username: username.into(),
            filename: filename.into(),
            token,
            size: 0,
            bytes_transferred: 0,
            state: TransferState::Queued,
            start_time: None,
            end_time: None,
            message: None,
        }
    }

    /// Move to `state`, stamping start and end times, and build the matching event.
    pub fn transition(&mut self, state: TransferState, message: Option<String>) -> TransferEvent {
        let previous_state = self.state;
        self.state = state;
        if state == TransferState::InProgress && self.start_time.is_none() {
            self.start_time = Some(SystemTime::now());
        }
        if state.is_terminal() && self.end_time.is_none() {
            self.end_time = Some(SystemTime::now());
        }
        if message.is_some() {
            self.message = message;
        }
        TransferEvent::StateChanged {
            previous_state,
            transfer: self.clone(),
        }
    }

    /// Record progress and build the matching event.
    pub fn progress(&mut self, bytes_transferred: i64) -> TransferEvent {
        let previous_bytes_transferred = self.bytes_transferred;
        self.bytes_transferred = bytes_transferred;
        TransferEvent::Progress {
            previous_bytes_transferred,
            transfer: self.clone(),
        }
    }

    pub fn bytes_remaining(&self) -> i64 {
        (self.size - self.bytes_transferred).max(0)
    }

    pub fn percent_complete(&self) -> f64 {
        if self.size <= 0 {
            return 0.0;
        }
        self.bytes_transferred as f64 / self.size as f64 * 100.0
    }

    /// Time from start to end, or to now if still running.
    pub fn elapsed(&self) -> Option<Duration> {
        let start = self.start_time?;
        let end = self.end_time.unwrap_or_else(SystemTime::now);
        end.duration_since(start).ok()
    }

    /// Bytes per second over the elapsed time.
    pub fn average_speed(&self) -> f64 {
        match self.elapsed() {
            Some(elapsed) if !elapsed.is_zero() => {
                self.bytes_transferred as f64 / elapsed.as_secs_f64()
            }
            _ => 0.0,
        }
    }
}

/// Raised by the transfer I/O loop; consumed by [`TransferTracker`](crate::TransferTracker).
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    StateChanged {
        previous_state: TransferState,
        transfer: Transfer,
    },
    Progress {
        previous_bytes_transferred: i64,
        transfer: Transfer,
    },
}

impl TransferEvent {
    pub fn transfer(&self) -> &Transfer {
        match self {
            Self::StateChanged { transfer, .. } | Self::Progress { transfer, .. } => transfer,
        }
    }
}
