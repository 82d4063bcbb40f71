//! Change notifications for stored issues.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::error::{Error, Result};
use crate::types::TrackedIssue;

/// A change to a stored issue, carrying the object as of that change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Added(TrackedIssue),
    Modified(TrackedIssue),
    Deleted(TrackedIssue),
}

impl WatchEvent {
    /// The object the event refers to.
    pub fn object(&self) -> &TrackedIssue {
        match self {
            Self::Added(issue) | Self::Modified(issue) | Self::Deleted(issue) => issue,
        }
    }

    /// Short event name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Modified(_) => "modified",
            Self::Deleted(_) => "deleted",
        }
    }
}

/// Subscription handle for receiving watch events.
///
/// The stream cannot be restarted. A consumer that falls behind receives
/// [`Error::Lagged`] and should relist to catch up.
pub struct WatchStream {
    receiver: broadcast::Receiver<WatchEvent>,
}

impl WatchStream {
    pub(crate) fn new(receiver: broadcast::Receiver<WatchEvent>) -> Self {
        Self { receiver }
    }

    /// Receive the next event.
    pub async fn recv(&mut self) -> Result<WatchEvent> {
        self.receiver.recv().await.map_err(|err| match err {
            RecvError::Lagged(skipped) => Error::Lagged { skipped },
            RecvError::Closed => Error::ChannelClosed,
        })
    }

    /// Receive an event without waiting, `None` when nothing is pending.
    pub fn try_recv(&mut self) -> Result<Option<WatchEvent>> {
        match self.receiver.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Lagged(skipped)) => Err(Error::Lagged { skipped }),
            Err(TryRecvError::Closed) => Err(Error::ChannelClosed),
        }
    }
}
