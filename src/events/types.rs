//! Event and subscription types.

use crate::error::RemoteError;
use crate::types::{ActionId, MutationId, MutationKind, Timestamp};
use serde::{Deserialize, Serialize};

/// Configuration for a subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Max buffered events before dropping subscriber.
    /// Default: 256
    pub buffer_size: usize,

    /// Filter criteria.
    pub filter: EventFilter,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 256,
            filter: EventFilter::all(),
        }
    }
}

/// Which event families a subscriber wants.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    pub include_queue: bool,
    pub include_undo: bool,
}

impl EventFilter {
    /// Mutation lifecycle and queue counters.
    pub fn queue() -> Self {
        Self {
            include_queue: true,
            ..Default::default()
        }
    }

    /// Undo registrations and their outcome.
    pub fn undo() -> Self {
        Self {
            include_undo: true,
            ..Default::default()
        }
    }

    pub fn all() -> Self {
        Self {
            include_queue: true,
            include_undo: true,
        }
    }

    pub(crate) fn matches(&self, event: &PipelineEvent) -> bool {
        if event.is_queue_event() {
            self.include_queue
        } else if event.is_undo_event() {
            self.include_undo
        } else {
            true
        }
    }
}

/// Events emitted by the pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    // --- Queue Events ---
    MutationQueued {
        id: MutationId,
        kind: MutationKind,
        entity_type: String,
    },
    MutationSyncing {
        id: MutationId,
    },
    /// Confirmed by the remote store and removed from the queue.
    MutationSynced {
        id: MutationId,
    },
    MutationFailed {
        id: MutationId,
        error: RemoteError,
    },
    MutationRetried {
        id: MutationId,
        retry_count: u32,
    },
    MutationRemoved {
        id: MutationId,
    },
    /// Counters after a queue change.
    QueueCounts {
        pending: usize,
        failed: usize,
    },

    // --- Undo Events ---
    /// A new action took the displayed undo slot.
    UndoRegistered {
        action_id: ActionId,
        message: String,
        expires_at: Timestamp,
    },
    UndoConsumed {
        action_id: ActionId,
    },
    UndoExpired {
        action_id: ActionId,
    },

    // --- Lifecycle Events ---
    /// Subscription was dropped.
    Dropped {
        reason: DropReason,
    },
}

impl PipelineEvent {
    fn is_queue_event(&self) -> bool {
        matches!(
            self,
            PipelineEvent::MutationQueued { .. }
                | PipelineEvent::MutationSyncing { .. }
                | PipelineEvent::MutationSynced { .. }
                | PipelineEvent::MutationFailed { .. }
                | PipelineEvent::MutationRetried { .. }
                | PipelineEvent::MutationRemoved { .. }
                | PipelineEvent::QueueCounts { .. }
        )
    }

    fn is_undo_event(&self) -> bool {
        matches!(
            self,
            PipelineEvent::UndoRegistered { .. }
                | PipelineEvent::UndoConsumed { .. }
                | PipelineEvent::UndoExpired { .. }
        )
    }
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Handle to manage a subscription.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<PipelineEvent>,
}

impl SubscriptionHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<PipelineEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<PipelineEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<PipelineEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything currently buffered.
    pub fn drain(&self) -> Vec<PipelineEvent> {
        self.receiver.try_iter().collect()
    }
}
