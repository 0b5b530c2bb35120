//! Undo registry with scheduled expiry.

use super::action::{ActionStatus, InverseOperation, ReversibleAction};
use crate::clock::Clock;
use crate::error::RemoteError;
use crate::events::{EventBus, PipelineEvent};
use crate::types::ActionId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Why an undo was refused.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum UndoError {
    /// Unknown id, or the action was already consumed or pruned.
    #[error("undo action {0} is not available")]
    Unavailable(ActionId),

    #[error("undo window for action {0} has expired")]
    Expired(ActionId),

    /// Another caller is running the inverse right now.
    #[error("undo action {0} is already in progress")]
    InProgress(ActionId),

    /// The inverse ran and failed; the action stays active until expiry.
    #[error("inverse operation failed: {0}")]
    InverseFailed(RemoteError),
}

struct Slot {
    action: ReversibleAction,
    inverse: Arc<dyn InverseOperation>,
    /// Set while a caller is running the inverse.
    claimed: bool,
    /// Deadline fired while claimed; expire once the claim is released.
    deadline_passed: bool,
    deadline: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct State {
    actions: HashMap<ActionId, Slot>,
    /// The one action surfaced to the user.
    displayed: Option<ActionId>,
}

struct Inner {
    clock: Arc<dyn Clock>,
    default_duration: Duration,
    state: Mutex<State>,
    next_id: AtomicU64,
    events: Option<Arc<EventBus>>,
}

/// Registry of short-lived inverses for destructive writes.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct UndoRegistry {
    inner: Arc<Inner>,
}

impl UndoRegistry {
    pub fn new(clock: Arc<dyn Clock>, default_duration: Duration) -> Self {
        Self::build(clock, default_duration, None)
    }

    /// Registry that reports registrations and outcomes on `events`.
    pub fn with_events(clock: Arc<dyn Clock>, default_duration: Duration, events: Arc<EventBus>) -> Self {
        Self::build(clock, default_duration, Some(events))
    }

    fn build(clock: Arc<dyn Clock>, default_duration: Duration, events: Option<Arc<EventBus>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                clock,
                default_duration,
                state: Mutex::new(State::default()),
                next_id: AtomicU64::new(1),
                events,
            }),
        }
    }

    /// Register an inverse, reversible for `duration` (default if None).
    ///
    /// The new action takes the displayed slot. When called inside a tokio
    /// runtime a deadline task expires the action after `duration` of tokio
    /// time. Reads check the registry clock and expire lazily, so whichever
    /// of the two passes the deadline first wins. Without a runtime expiry
    /// happens on access or via [`prune_expired`](Self::prune_expired).
    pub fn register(
        &self,
        message: impl Into<String>,
        inverse: impl InverseOperation + 'static,
        duration: Option<Duration>,
    ) -> ActionId {
        let duration = duration.unwrap_or(self.inner.default_duration);
        let id = ActionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let now = self.inner.clock.now();
        let action = ReversibleAction {
            action_id: id,
            message: message.into(),
            created_at: now,
            expires_at: now.plus(duration),
            status: ActionStatus::Active,
        };
        let event = PipelineEvent::UndoRegistered {
            action_id: id,
            message: action.message.clone(),
            expires_at: action.expires_at,
        };

        {
            let mut state = self.inner.state.lock();
            let deadline = spawn_deadline(Arc::downgrade(&self.inner), id, duration);
            state.actions.insert(
                id,
                Slot {
                    action,
                    inverse: Arc::new(inverse),
                    claimed: false,
                    deadline_passed: false,
                    deadline,
                },
            );
            state.displayed = Some(id);
        }

        debug!(action = id.0, ttl_ms = duration.as_millis() as u64, "undo registered");
        self.inner.publish(event);
        id
    }

    /// Whether `undo(id)` would currently run the inverse.
    pub fn can_undo(&self, id: ActionId) -> bool {
        let now = self.inner.clock.now();
        self.inner.state.lock().actions.get(&id).map_or(false, |slot| {
            slot.action.status == ActionStatus::Active && !slot.claimed && now < slot.action.expires_at
        })
    }

    /// Run the inverse once. A second or concurrent call fails.
    pub async fn undo(&self, id: ActionId) -> Result<(), UndoError> {
        let inverse = self.inner.claim(id)?;
        let mut claim = Claim {
            inner: &self.inner,
            id,
            settled: false,
        };

        match inverse.invert().await {
            Ok(()) => {
                claim.settled = true;
                self.inner.finish(id);
                info!(action = id.0, "undo applied");
                Ok(())
            }
            Err(e) => {
                warn!(action = id.0, error = %e, "undo inverse failed");
                Err(UndoError::InverseFailed(e))
            }
        }
    }

    /// Consume an action without running its inverse.
    ///
    /// Used when the destructive write never reached the remote store, so
    /// dropping it from the queue already undoes it.
    pub fn consume(&self, id: ActionId) -> bool {
        if self.inner.claim(id).is_err() {
            return false;
        }
        self.inner.finish(id);
        true
    }

    /// Consume an action if `local` manages to cancel the write itself.
    ///
    /// `local` runs while the action is claimed. `Ok(false)` or an error
    /// releases the claim and leaves the action active.
    pub fn consume_with<F, E>(&self, id: ActionId, local: F) -> Result<bool, E>
    where
        F: FnOnce() -> Result<bool, E>,
        E: From<UndoError>,
    {
        self.inner.claim(id)?;
        let mut claim = Claim {
            inner: &self.inner,
            id,
            settled: false,
        };
        if !local()? {
            return Ok(false);
        }
        claim.settled = true;
        self.inner.finish(id);
        Ok(true)
    }

    /// Snapshot of an action still held by the registry. An action past
    /// its deadline by the clock is expired here and not returned.
    pub fn get(&self, id: ActionId) -> Option<ReversibleAction> {
        let now = self.inner.clock.now();
        {
            let state = self.inner.state.lock();
            let slot = state.actions.get(&id)?;
            if slot.claimed || now < slot.action.expires_at {
                return Some(slot.action.clone());
            }
        }
        self.inner.expire(id);
        None
    }

    /// Time left before the action expires (countdown display).
    pub fn remaining(&self, id: ActionId) -> Option<Duration> {
        let now = self.inner.clock.now();
        self.inner
            .state
            .lock()
            .actions
            .get(&id)
            .filter(|slot| slot.action.status == ActionStatus::Active)
            .map(|slot| now.until(slot.action.expires_at))
    }

    /// The action currently surfaced to the user, if still undoable.
    pub fn current(&self) -> Option<ReversibleAction> {
        let now = self.inner.clock.now();
        let state = self.inner.state.lock();
        let id = state.displayed?;
        state
            .actions
            .get(&id)
            .filter(|slot| now < slot.action.expires_at)
            .map(|slot| slot.action.clone())
    }

    /// Hide the displayed action. It stays undoable by id.
    pub fn dismiss(&self) {
        self.inner.state.lock().displayed = None;
    }

    /// Expire every action whose deadline has passed by the clock.
    pub fn prune_expired(&self) -> usize {
        let now = self.inner.clock.now();
        let expired: Vec<ActionId> = {
            let state = self.inner.state.lock();
            state
                .actions
                .iter()
                .filter(|(_, slot)| !slot.claimed && now >= slot.action.expires_at)
                .map(|(id, _)| *id)
                .collect()
        };
        expired.iter().filter(|id| self.inner.expire(**id)).count()
    }

    /// Number of actions still held.
    pub fn len(&self) -> usize {
        self.inner.state.lock().actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    fn publish(&self, event: PipelineEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    /// Take the single-winner claim on an action.
    fn claim(&self, id: ActionId) -> Result<Arc<dyn InverseOperation>, UndoError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let slot = state
            .actions
            .get_mut(&id)
            .ok_or(UndoError::Unavailable(id))?;

        if slot.claimed {
            return Err(UndoError::InProgress(id));
        }
        if slot.action.status != ActionStatus::Active {
            return Err(UndoError::Unavailable(id));
        }
        if now >= slot.action.expires_at {
            drop(state);
            self.expire(id);
            return Err(UndoError::Expired(id));
        }

        slot.claimed = true;
        Ok(Arc::clone(&slot.inverse))
    }

    /// Mark consumed, cancel the deadline and prune.
    fn finish(&self, id: ActionId) {
        {
            let mut state = self.state.lock();
            if let Some(mut slot) = state.actions.remove(&id) {
                slot.action.status = ActionStatus::Consumed;
                if let Some(deadline) = slot.deadline.take() {
                    deadline.abort();
                }
            }
            if state.displayed == Some(id) {
                state.displayed = None;
            }
        }
        self.publish(PipelineEvent::UndoConsumed { action_id: id });
    }

    /// Give the claim back after a failed inverse.
    fn release(&self, id: ActionId) {
        let now = self.clock.now();
        let overdue = {
            let mut state = self.state.lock();
            match state.actions.get_mut(&id) {
                Some(slot) => {
                    slot.claimed = false;
                    slot.deadline_passed || now >= slot.action.expires_at
                }
                None => false,
            }
        };
        if overdue {
            self.expire(id);
        }
    }

    /// Deadline reached: expire and prune unless a claim is in flight.
    /// Returns true if the action was expired.
    fn expire(&self, id: ActionId) -> bool {
        {
            let mut state = self.state.lock();
            match state.actions.get_mut(&id) {
                Some(slot) if slot.claimed => {
                    slot.deadline_passed = true;
                    return false;
                }
                Some(slot) if slot.action.status == ActionStatus::Active => {}
                _ => return false,
            }
            if let Some(mut slot) = state.actions.remove(&id) {
                slot.action.status = ActionStatus::Expired;
                if let Some(deadline) = slot.deadline.take() {
                    deadline.abort();
                }
            }
            if state.displayed == Some(id) {
                state.displayed = None;
            }
        }
        debug!(action = id.0, "undo expired");
        self.publish(PipelineEvent::UndoExpired { action_id: id });
        true
    }
}

/// Releases the claim if the undo future is dropped or the inverse fails.
struct Claim<'a> {
    inner: &'a Inner,
    id: ActionId,
    settled: bool,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.inner.release(self.id);
        }
    }
}

fn spawn_deadline(inner: Weak<Inner>, id: ActionId, duration: Duration) -> Option<JoinHandle<()>> {
    let runtime = tokio::runtime::Handle::try_current().ok()?;
    Some(runtime.spawn(async move {
        tokio::time::sleep(duration).await;
        if let Some(inner) = inner.upgrade() {
            inner.expire(id);
        }
    }))
}
