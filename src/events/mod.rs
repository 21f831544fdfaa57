//! In-process publish/subscribe channel for progress updates.

use crate::activity::Job;
use crate::uploader::UploadSessionState;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing;

/// Progress events published to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    /// Snapshot of a chunked upload session
    UploadProgress(UploadSessionState),
    /// Full job record after any state change
    JobUpdated { workspace_id: String, job: Job },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::UploadProgress(_) => "UploadProgress",
            Event::JobUpdated { .. } => "JobUpdated",
        }
    }

    /// Whether this event belongs to the given workspace or upload session.
    /// A `None` filter matches everything of that kind.
    pub fn matches(&self, workspace_id: Option<&str>, session_id: Option<&str>) -> bool {
        match self {
            Event::UploadProgress(state) => session_id.is_none_or(|id| state.session_id == id),
            Event::JobUpdated { workspace_id: ws, .. } => workspace_id.is_none_or(|id| ws == id),
        }
    }
}

/// Event broadcaster backing the progress channel and SSE stream
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: Arc<broadcast::Sender<Event>>,
}

impl EventBroadcaster {
    /// Create a new event broadcaster
    ///
    /// # Arguments
    /// * `capacity` - The capacity of the broadcast channel. Slow subscribers
    ///   that fall further behind than this skip the oldest events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Subscribe to events and get a receiver
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Broadcast an event to all subscribers
    ///
    /// # Returns
    /// The number of receivers that received the event
    pub fn broadcast(&self, event: Event) -> usize {
        let name = event.name();
        match self.sender.send(event) {
            Ok(count) => {
                tracing::debug!(target: "events", event = name, subscribers = count, "Broadcast event to subscriber(s)");
                count
            }
            Err(_) => {
                tracing::trace!(target: "events", event = name, "No active subscribers for event");
                0
            }
        }
    }

    pub fn upload_progress(&self, state: UploadSessionState) {
        self.broadcast(Event::UploadProgress(state));
    }

    pub fn job_updated(&self, workspace_id: impl Into<String>, job: Job) {
        self.broadcast(Event::JobUpdated {
            workspace_id: workspace_id.into(),
            job,
        });
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
