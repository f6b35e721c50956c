use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::PipelineState;

/// Lifecycle event published by the engine. Every event carries the current
/// state snapshot so subscribers never have to query back.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum PipelineEvent {
    PipelineStarted {
        state: PipelineState,
    },
    /// Terminal event for `completed` and `partial` runs; `partial` carries
    /// the distinction.
    PipelineCompleted {
        state: PipelineState,
        partial: bool,
    },
    PipelineFailed {
        state: PipelineState,
    },
    PipelineAborted {
        state: PipelineState,
    },
    StageStarted {
        state: PipelineState,
        stage_name: String,
    },
    StageCompleted {
        state: PipelineState,
        stage_name: String,
    },
    StageFailed {
        state: PipelineState,
        stage_name: String,
    },
    PrCreated {
        state: PipelineState,
        pr_url: String,
    },
}

impl PipelineEvent {
    /// Dotted event name, stable for subscribers and logs.
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::PipelineStarted { .. } => "pipeline.started",
            PipelineEvent::PipelineCompleted { .. } => "pipeline.completed",
            PipelineEvent::PipelineFailed { .. } => "pipeline.failed",
            PipelineEvent::PipelineAborted { .. } => "pipeline.aborted",
            PipelineEvent::StageStarted { .. } => "stage.started",
            PipelineEvent::StageCompleted { .. } => "stage.completed",
            PipelineEvent::StageFailed { .. } => "stage.failed",
            PipelineEvent::PrCreated { .. } => "pr.created",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineEvent::PipelineCompleted { .. }
                | PipelineEvent::PipelineFailed { .. }
                | PipelineEvent::PipelineAborted { .. }
        )
    }
}

/// Fire-and-forget event consumer. Implementations must never block the
/// coordinator.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

/// Sink that discards everything (the default when no one is listening).
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: PipelineEvent) {}
}

/// Read-only observer invoked with a state snapshot after every persisted
/// transition. Observers must not assume they see every intermediate state.
pub trait StateObserver: Send + Sync {
    fn on_state_change(&self, state: &PipelineState);
}

const EVENT_CAPACITY: usize = 256;

/// Broadcast event bus decoupling slow subscribers from the coordinator.
///
/// A subscriber that falls more than the channel capacity behind loses its
/// oldest pending events; the loss is counted on its subscription.
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self { tx })
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: PipelineEvent) {
        // send only fails when there are no receivers; fire-and-forget.
        let _ = self.tx.send(event);
    }
}

/// One subscriber's view of the bus, with a drop counter for overflow.
pub struct EventSubscription {
    rx: broadcast::Receiver<PipelineEvent>,
    dropped: AtomicU64,
}

impl EventSubscription {
    /// Next event, or None when the bus is closed. Overflow is absorbed
    /// here: lagged events increment the drop counter and reception
    /// continues from the oldest retained event.
    pub async fn recv(&mut self) -> Option<PipelineEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant used by drains and tests.
    pub fn try_recv(&mut self) -> Option<PipelineEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(_) => return None,
            }
        }
    }

    /// Events lost to overflow since subscription.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
