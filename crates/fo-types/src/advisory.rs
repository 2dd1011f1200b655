//! Out-of-band advisory status channel.
//!
//! Executors publish fire-and-forget progress ("running", "finishing") keyed
//! by pool handle. The orchestrator drains whatever has arrived on each poll
//! pass and merges it without letting it override polled state. Delivery is
//! best-effort: a message sent after the receiver is gone is dropped.

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::trial::Handle;

/// A single advisory status message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvisoryUpdate {
    pub handle: Handle,
    pub status: String,
    pub published_at: DateTime<Utc>,
}

/// Create a connected publisher/receiver pair.
pub fn advisory_channel() -> (AdvisoryPublisher, AdvisoryReceiver) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (AdvisoryPublisher { tx }, AdvisoryReceiver { rx })
}

/// Executor side of the channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AdvisoryPublisher {
    tx: Sender<AdvisoryUpdate>,
}

impl AdvisoryPublisher {
    /// Publish a status for `handle`. Never blocks and never fails.
    pub fn publish(&self, handle: Handle, status: impl Into<String>) {
        let update = AdvisoryUpdate {
            handle,
            status: status.into(),
            published_at: Utc::now(),
        };
        if let Err(err) = self.tx.send(update) {
            trace!(handle = %err.0.handle, "advisory receiver dropped; discarding update");
        }
    }
}

/// Orchestrator side of the channel.
#[derive(Debug)]
pub struct AdvisoryReceiver {
    rx: Receiver<AdvisoryUpdate>,
}

impl AdvisoryReceiver {
    /// Everything published so far, oldest first, without waiting.
    pub fn drain(&self) -> Vec<AdvisoryUpdate> {
        self.rx.try_iter().collect()
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_returns_in_publish_order() {
        let (publisher, receiver) = advisory_channel();
        publisher.publish(Handle::new("a"), "running");
        publisher.clone().publish(Handle::new("a"), "finishing");

        assert_eq!(receiver.pending(), 2);
        let updates = receiver.drain();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].status, "running");
        assert_eq!(updates[1].status, "finishing");
        assert!(receiver.drain().is_empty());
    }

    #[test]
    fn publish_after_receiver_dropped_is_silent() {
        let (publisher, receiver) = advisory_channel();
        drop(receiver);
        publisher.publish(Handle::new("gone"), "running");
    }
}
