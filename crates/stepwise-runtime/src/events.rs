//! Engine lifecycle events.
//!
//! Observers are called synchronously from the engine's run loop, in the
//! order events happen. [`EventBus`] adapts that to any number of async
//! subscribers over a `tokio::sync::broadcast` channel.

use serde::Serialize;
use tokio::sync::broadcast;

use stepwise_core::StepId;

use crate::engine::PlanSource;

/// Something that happened during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    PlanGenerated {
        revision: u32,
        steps: usize,
        source: PlanSource,
    },
    StepStarted {
        revision: u32,
        step_id: StepId,
        step_number: u32,
        tool_name: Option<String>,
    },
    StepCompleted {
        revision: u32,
        step_id: StepId,
        step_number: u32,
        duration_ms: u64,
    },
    StepFailed {
        revision: u32,
        step_id: StepId,
        step_number: u32,
        error: String,
    },
    ReplanTriggered {
        /// Revision that failed
        revision: u32,
        failed_steps: usize,
        completed_steps: usize,
    },
    SynthesisStarted {
        results: usize,
    },
    SynthesisFragment {
        text: String,
    },
    SynthesisCompleted {
        length: usize,
    },
}

/// Receives engine events.
///
/// Called inline on the run loop; implementations must not block.
pub trait EngineObserver: Send + Sync {
    fn on_event(&self, event: &EngineEvent);
}

impl<F> EngineObserver for F
where
    F: Fn(&EngineEvent) + Send + Sync,
{
    fn on_event(&self, event: &EngineEvent) {
        self(event)
    }
}

/// Multi-consumer event bus for engine events.
///
/// Cloning the bus clones the sender, allowing multiple producers and
/// consumers. Publishing with no active subscribers is a no-op.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }
}

impl EngineObserver for EventBus {
    fn on_event(&self, event: &EngineEvent) {
        self.publish(event.clone());
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
