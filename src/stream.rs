//! Live metric broadcast.
//!
//! A process-wide single-producer, multi-subscriber feed built on a
//! ring-buffered broadcast channel. `MetricReceived` delivery is best-effort:
//! a slow subscriber skips over the samples it missed and never slows the
//! engine. Terminal events are the last events of a run, so they survive in
//! the ring for every subscriber attached at the moment of dispatch. There is
//! no replay for late subscribers.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::model::{MetricSample, RunAggregate};

/// Ring capacity. Large enough that a terminal event is never pushed out by
/// the tail of its own run before an attached subscriber can observe it.
const CHANNEL_CAPACITY: usize = 1024;

/// Events observable on the live feed. The variant names are wire names and
/// must not be renamed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum StreamEvent {
    #[serde(rename_all = "camelCase")]
    Connected { subscriber_id: String },
    MetricReceived(MetricSample),
    TestCompleted(RunAggregate),
    #[serde(rename_all = "camelCase")]
    TestError { run_token: String, error: String },
    #[serde(rename_all = "camelCase")]
    AuthenticationStarted { run_token: String },
    #[serde(rename_all = "camelCase")]
    AuthenticationSuccess { run_token: String },
    #[serde(rename_all = "camelCase")]
    AuthenticationFailed { run_token: String, error: String },
}

impl StreamEvent {
    /// True for the events that end a run's stream activity.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::TestCompleted(_)
                | StreamEvent::TestError { .. }
                | StreamEvent::AuthenticationFailed { .. }
        )
    }
}

/// The broadcast hub. Cheap to clone; all clones publish into the same ring.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<StreamEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        EventHub { tx }
    }

    /// Attaches a new subscriber. The returned handle yields a one-time
    /// `Connected` greeting followed by every event published after attach.
    pub fn subscribe(&self) -> Subscription {
        let id = format!("sub-{}", crate::model::generate_run_token());
        debug!(subscriber_id = %id, "Subscriber attached");
        Subscription {
            greeting: Some(StreamEvent::Connected {
                subscriber_id: id.clone(),
            }),
            rx: self.tx.subscribe(),
            id,
        }
    }

    /// Publishes an event to all attached subscribers. Never blocks; having
    /// no subscribers is not an error.
    pub fn publish(&self, event: StreamEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's view of the feed. Dropping the handle detaches
/// immediately and never blocks the hub.
pub struct Subscription {
    pub id: String,
    greeting: Option<StreamEvent>,
    rx: broadcast::Receiver<StreamEvent>,
}

impl Subscription {
    /// Waits for the next event. Lag gaps are skipped silently; `None` means
    /// the hub has been dropped.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if let Some(greeting) = self.greeting.take() {
            return Some(greeting);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(
                        subscriber_id = %self.id,
                        skipped = skipped,
                        "Subscriber lagged; skipping ahead"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
