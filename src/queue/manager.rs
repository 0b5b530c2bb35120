//! Queue state machine and dispatch loop.

use super::journal::{JournalOp, QueueJournal};
use super::record::MutationRecord;
use crate::clock::Clock;
use crate::command::{Applied, MutationCommand};
use crate::concurrency::ConcurrencyController;
use crate::config::QueueConfig;
use crate::error::{ErrorKind, PipelineError, RemoteError, Result};
use crate::events::{EventBus, PipelineEvent};
use crate::remote::RemoteStore;
use crate::types::{Actor, EntityRef, MutationId, MutationStatus};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one dispatch pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Entries moved to syncing and submitted.
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Pending entries held back because their entity was already syncing.
    pub deferred: usize,
}

struct QueueState {
    entries: BTreeMap<MutationId, MutationRecord>,
    next_id: u64,
    journal: Option<QueueJournal>,
    /// Journal entries written since the last rewrite.
    journal_ops: usize,
}

/// Ordered store of unconfirmed writes.
pub struct MutationQueue {
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
    events: Option<Arc<EventBus>>,
}

impl MutationQueue {
    /// Open a queue, replaying the journal when one is configured.
    pub fn open(config: QueueConfig, clock: Arc<dyn Clock>, events: Option<Arc<EventBus>>) -> Result<Self> {
        let mut state = QueueState {
            entries: BTreeMap::new(),
            next_id: 1,
            journal: None,
            journal_ops: 0,
        };

        if let Some(path) = &config.journal_path {
            let (journal, replayed) = QueueJournal::open(path, Arc::clone(&clock))?;
            state.entries = replayed.entries;
            state.next_id = replayed.next_id;
            state.journal_ops = replayed.ops;
            state.journal = Some(journal);

            let interrupted: Vec<MutationId> = state
                .entries
                .values()
                .filter(|r| r.status == MutationStatus::Syncing)
                .map(|r| r.id)
                .collect();
            for id in &interrupted {
                if let Some(record) = state.entries.get_mut(id) {
                    record.status = MutationStatus::Failed;
                    record.last_error = Some(RemoteError::new(
                        ErrorKind::Unknown,
                        "interrupted before the remote store confirmed",
                    ));
                }
            }
            for id in &interrupted {
                Self::log_update(&mut state, *id)?;
            }

            info!(
                path = %path.display(),
                entries = state.entries.len(),
                interrupted = interrupted.len(),
                "mutation queue recovered"
            );
        }

        Ok(Self {
            config,
            clock,
            state: Mutex::new(state),
            events,
        })
    }

    /// In-memory queue with default settings.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            config: QueueConfig::default(),
            clock,
            state: Mutex::new(QueueState {
                entries: BTreeMap::new(),
                next_id: 1,
                journal: None,
                journal_ops: 0,
            }),
            events: None,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Append a new pending entry.
    pub fn enqueue(&self, actor: Actor, command: MutationCommand) -> Result<MutationId> {
        let (id, kind, entity_type) = {
            let mut state = self.state.lock();
            let id = MutationId(state.next_id);
            state.next_id += 1;

            let record = MutationRecord::new(id, actor, command, self.clock.now());
            let kind = record.kind;
            let entity_type = record.entity_type.clone();
            state.entries.insert(id, record.clone());
            if let Err(e) = Self::log(&mut state, &self.config, JournalOp::Enqueued(record)) {
                state.entries.remove(&id);
                return Err(e);
            }
            (id, kind, entity_type)
        };

        debug!(mutation = id.0, kind = ?kind, table = %entity_type, "mutation queued");
        self.publish(PipelineEvent::MutationQueued { id, kind, entity_type });
        self.publish_counts();
        Ok(id)
    }

    /// Delete an entry whatever its status. A syncing entry keeps running
    /// remotely; its outcome is discarded.
    pub fn remove(&self, id: MutationId) -> Result<bool> {
        {
            let mut state = self.state.lock();
            let Some(record) = state.entries.remove(&id) else {
                return Ok(false);
            };
            if record.status == MutationStatus::Syncing {
                debug!(mutation = id.0, "removed while syncing, outcome will be ignored");
            }
            Self::log(&mut state, &self.config, JournalOp::Removed(id))?;
        }

        self.publish(PipelineEvent::MutationRemoved { id });
        self.publish_counts();
        Ok(true)
    }

    /// Remove an entry only if it is not syncing. Returns false when the
    /// entry is gone or already on its way to the remote store.
    pub fn withdraw(&self, id: MutationId) -> Result<bool> {
        {
            let mut state = self.state.lock();
            match state.entries.get(&id) {
                Some(record) if record.status != MutationStatus::Syncing => {}
                _ => return Ok(false),
            }
            state.entries.remove(&id);
            Self::log(&mut state, &self.config, JournalOp::Removed(id))?;
        }

        debug!(mutation = id.0, "mutation withdrawn before sync");
        self.publish(PipelineEvent::MutationRemoved { id });
        self.publish_counts();
        Ok(true)
    }

    /// Put a failed entry back to pending.
    pub fn retry(&self, id: MutationId) -> Result<()> {
        self.reset_failed(id, None)
    }

    /// Retry every failed entry; returns how many were reset.
    pub fn retry_all(&self) -> Result<usize> {
        let failed: Vec<MutationId> = {
            let state = self.state.lock();
            state
                .entries
                .values()
                .filter(|r| r.status == MutationStatus::Failed)
                .map(|r| r.id)
                .collect()
        };

        let mut count = 0;
        for id in failed {
            match self.reset_failed(id, None) {
                Ok(()) => count += 1,
                // Removed or retried concurrently.
                Err(PipelineError::MutationNotFound(_)) | Err(PipelineError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(count)
    }

    /// Replace a failed entry's command and put it back to pending.
    pub fn resubmit(&self, id: MutationId, command: MutationCommand) -> Result<()> {
        self.reset_failed(id, Some(command))
    }

    fn reset_failed(&self, id: MutationId, command: Option<MutationCommand>) -> Result<()> {
        let retry_count = {
            let mut state = self.state.lock();
            let record = state
                .entries
                .get_mut(&id)
                .ok_or(PipelineError::MutationNotFound(id))?;
            if record.status != MutationStatus::Failed {
                return Err(PipelineError::InvalidTransition {
                    id,
                    status: record.status.as_str(),
                    expected: MutationStatus::Failed.as_str(),
                });
            }

            record.status = MutationStatus::Pending;
            record.retry_count += 1;
            record.last_error = None;
            let retry_count = record.retry_count;

            let payload = command.map(|command| {
                record.kind = command.kind();
                record.entity_type = command.entity_type().to_string();
                record.payload = command.clone();
                command
            });
            Self::log(
                &mut state,
                &self.config,
                JournalOp::Updated {
                    id,
                    status: MutationStatus::Pending,
                    retry_count,
                    last_error: None,
                    payload,
                },
            )?;
            retry_count
        };

        debug!(mutation = id.0, retry_count, "mutation retried");
        self.publish(PipelineEvent::MutationRetried { id, retry_count });
        self.publish_counts();
        Ok(())
    }

    /// Entries pending or syncing.
    pub fn pending_count(&self) -> usize {
        self.state.lock().entries.values().filter(|r| r.is_outstanding()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.state
            .lock()
            .entries
            .values()
            .filter(|r| r.status == MutationStatus::Failed)
            .count()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: MutationId) -> Option<MutationRecord> {
        self.state.lock().entries.get(&id).cloned()
    }

    /// Snapshot of every entry in enqueue order.
    pub fn list(&self) -> Vec<MutationRecord> {
        self.state.lock().entries.values().cloned().collect()
    }

    /// Submit every eligible pending entry.
    ///
    /// Outcomes are applied as they arrive. Journal failures do not stop
    /// the pass; the first one is returned after every submission settles.
    pub async fn dispatch<R: RemoteStore>(&self, controller: &ConcurrencyController<R>) -> Result<DispatchSummary> {
        let (batch, deferred) = self.begin_dispatch()?;
        let mut summary = DispatchSummary {
            attempted: batch.len(),
            deferred,
            ..Default::default()
        };
        if batch.is_empty() {
            return Ok(summary);
        }

        debug!(attempted = summary.attempted, deferred, "dispatching mutations");

        let mut outcomes = stream::iter(batch)
            .map(|(id, actor, command)| async move {
                let outcome = command.apply(controller, &actor).await;
                (id, outcome)
            })
            .buffer_unordered(self.config.max_in_flight.max(1));

        let mut first_error = None;
        while let Some((id, outcome)) = outcomes.next().await {
            match &outcome {
                Ok(_) => summary.succeeded += 1,
                Err(_) => summary.failed += 1,
            }
            if let Err(e) = self.complete(id, outcome) {
                warn!(mutation = id.0, error = %e, "failed to record dispatch outcome");
                first_error.get_or_insert(e);
            }
        }

        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            "dispatch pass finished"
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    /// Mark eligible pending entries syncing and hand back their commands.
    fn begin_dispatch(&self) -> Result<(Vec<(MutationId, Actor, MutationCommand)>, usize)> {
        let mut batch = Vec::new();
        let mut deferred = 0;
        {
            let mut state = self.state.lock();
            let mut busy: HashSet<EntityRef> = state
                .entries
                .values()
                .filter(|r| r.status == MutationStatus::Syncing)
                .map(|r| r.entity())
                .collect();

            let pending: Vec<MutationId> = state
                .entries
                .values()
                .filter(|r| r.status == MutationStatus::Pending)
                .map(|r| r.id)
                .collect();

            for id in pending {
                let Some(record) = state.entries.get_mut(&id) else {
                    continue;
                };
                if self.config.serialize_per_entity && !busy.insert(record.entity()) {
                    deferred += 1;
                    continue;
                }
                record.status = MutationStatus::Syncing;
                batch.push((id, record.actor.clone(), record.payload.clone()));
                if let Err(e) = Self::log_update(&mut state, id) {
                    // Nothing was submitted yet; hand every entry back.
                    for (id, _, _) in &batch {
                        if let Some(record) = state.entries.get_mut(id) {
                            record.status = MutationStatus::Pending;
                        }
                    }
                    warn!(error = %e, reverted = batch.len(), "journal write failed, dispatch abandoned");
                    return Err(e);
                }
            }
        }

        for (id, _, _) in &batch {
            self.publish(PipelineEvent::MutationSyncing { id: *id });
        }
        Ok((batch, deferred))
    }

    /// Apply a remote outcome. The in-memory transition always happens;
    /// a journal error is returned afterwards. A journal that still says
    /// syncing replays as failed/UNKNOWN, so the entry stays visible.
    fn complete(&self, id: MutationId, outcome: std::result::Result<Applied, RemoteError>) -> Result<()> {
        let (event, logged) = {
            let mut state = self.state.lock();
            if !state.entries.contains_key(&id) {
                debug!(mutation = id.0, "outcome for removed mutation ignored");
                return Ok(());
            }

            match outcome {
                Ok(applied) => {
                    state.entries.remove(&id);
                    debug!(mutation = id.0, applied = ?applied, "mutation synced");
                    let logged = Self::log(&mut state, &self.config, JournalOp::Removed(id));
                    (PipelineEvent::MutationSynced { id }, logged)
                }
                Err(error) => {
                    if let Some(record) = state.entries.get_mut(&id) {
                        record.status = MutationStatus::Failed;
                        record.last_error = Some(error.clone());
                    }
                    warn!(mutation = id.0, kind = %error.kind, error = %error.message, "mutation failed");
                    let logged = Self::log_update(&mut state, id);
                    (PipelineEvent::MutationFailed { id, error }, logged)
                }
            }
        };

        self.publish(event);
        self.publish_counts();
        logged
    }

    /// Rewrite the journal with only the live entries.
    pub fn compact(&self) -> Result<()> {
        let mut state = self.state.lock();
        Self::rewrite(&mut state)
    }

    fn rewrite(state: &mut QueueState) -> Result<()> {
        let QueueState {
            entries,
            next_id,
            journal,
            journal_ops,
        } = state;
        if let Some(journal) = journal {
            journal.rewrite(*next_id, entries.values())?;
            *journal_ops = entries.len() + 1;
            debug!(path = %journal.path().display(), live = entries.len(), "journal compacted");
        }
        Ok(())
    }

    fn log_update(state: &mut QueueState, id: MutationId) -> Result<()> {
        let Some(record) = state.entries.get(&id) else {
            return Ok(());
        };
        let op = JournalOp::Updated {
            id,
            status: record.status,
            retry_count: record.retry_count,
            last_error: record.last_error.clone(),
            payload: None,
        };
        if let Some(journal) = state.journal.as_mut() {
            journal.append(op)?;
            state.journal_ops += 1;
        }
        Ok(())
    }

    fn log(state: &mut QueueState, config: &QueueConfig, op: JournalOp) -> Result<()> {
        let Some(journal) = state.journal.as_mut() else {
            return Ok(());
        };
        journal.append(op)?;
        state.journal_ops += 1;

        let stale = state.journal_ops.saturating_sub(state.entries.len() + 1);
        if stale >= config.compact_after {
            Self::rewrite(state)?;
        }
        Ok(())
    }

    fn publish(&self, event: PipelineEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    fn publish_counts(&self) {
        if self.events.is_some() {
            let (pending, failed) = {
                let state = self.state.lock();
                state.entries.values().fold((0, 0), |(p, f), r| match r.status {
                    MutationStatus::Failed => (p, f + 1),
                    _ => (p + 1, f),
                })
            };
            self.publish(PipelineEvent::QueueCounts { pending, failed });
        }
    }
}
