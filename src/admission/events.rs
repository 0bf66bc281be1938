//! Controller events and the subscriber side channel.
//!
//! Events are purely observational. The controller dispatches them after
//! its locks are released and never waits on a listener: sinks must return
//! quickly and channel subscribers whose buffer is full simply miss events.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use serde::Serialize;

use super::types::{DegradationLevel, DropReason, QueuedMessage};

/// Capacity of each `subscribe()` channel.
pub const SUBSCRIBER_CAPACITY: usize = 1_024;

/// Notification emitted by the backpressure controller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControllerEvent {
    /// The degradation level moved.
    DegradationLevelChanged {
        /// Level before the transition.
        old: DegradationLevel,
        /// Level after the transition.
        new: DegradationLevel,
        /// Worst signal ratio of the sample that caused it.
        max_ratio: f64,
    },
    /// A subject's breaker went from closed/half-open to open.
    CircuitBreakerOpened {
        /// Subject whose breaker opened.
        subject: String,
        /// True when an operator opened it.
        manual: bool,
    },
    /// A subject's breaker closed.
    CircuitBreakerClosed {
        /// Subject whose breaker closed.
        subject: String,
    },
    /// A message was not delivered.
    MessageDropped {
        /// The dropped message.
        message: QueuedMessage,
        /// Why it was dropped.
        reason: DropReason,
    },
}

impl ControllerEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::DegradationLevelChanged { .. } => "degradation_level_changed",
            Self::CircuitBreakerOpened { .. } => "circuit_breaker_opened",
            Self::CircuitBreakerClosed { .. } => "circuit_breaker_closed",
            Self::MessageDropped { .. } => "message_dropped",
        }
    }
}

/// Receives controller events synchronously on the emitting thread.
pub trait EventSink: Send + Sync {
    /// Called once per event. Must not block.
    fn on_event(&self, event: &ControllerEvent);
}

/// Fan-out of events to registered sinks and channel subscribers.
#[derive(Default)]
pub(crate) struct EventBus {
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
    subscribers: RwLock<Vec<Sender<ControllerEvent>>>,
}

impl EventBus {
    pub(crate) fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().push(sink);
    }

    pub(crate) fn subscribe(&self) -> Receiver<ControllerEvent> {
        let (tx, rx) = crossbeam_channel::bounded(SUBSCRIBER_CAPACITY);
        self.subscribers.write().push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: ControllerEvent) {
        for sink in self.sinks.read().iter() {
            sink.on_event(&event);
        }

        let mut dead: Vec<Sender<ControllerEvent>> = Vec::new();
        for tx in self.subscribers.read().iter() {
            if let Err(TrySendError::Disconnected(_)) = tx.try_send(event.clone()) {
                dead.push(tx.clone());
            }
        }
        // Only a dropped receiver takes the write lock.
        if !dead.is_empty() {
            self.subscribers
                .write()
                .retain(|tx| !dead.iter().any(|d| d.same_channel(tx)));
        }
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.sinks.read().len() + self.subscribers.read().len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}
