//! Pipeline facade tying the queue, controller, undo registry and events
//! together.

use crate::audit::AuditRecord;
use crate::clock::Clock;
use crate::command::MutationCommand;
use crate::concurrency::{ConcurrencyController, UpdateOutcome};
use crate::config::PipelineConfig;
use crate::error::{RemoteError, Result};
use crate::events::{EventBus, SubscriptionConfig, SubscriptionHandle};
use crate::queue::{DispatchSummary, MutationQueue};
use crate::remote::{BulkInsertResponse, NewRecord, RemoteStore};
use crate::types::{ActionId, Actor, Fields, MutationId};
use crate::undo::{CommandInverse, UndoRegistry};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Ids handed back by [`Pipeline::submit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Submission {
    pub mutation_id: MutationId,
    /// Set when the write registered an undo action.
    pub action_id: Option<ActionId>,
}

/// The mutation pipeline.
///
/// Writes are queued locally, dispatched to the remote store, and (for
/// destructive ones) stay reversible for the configured undo window.
pub struct Pipeline<R> {
    config: PipelineConfig,
    events: Arc<EventBus>,
    queue: MutationQueue,
    controller: Arc<ConcurrencyController<R>>,
    undo: UndoRegistry,
    /// Undo action -> the queued write it reverses.
    pairings: Mutex<HashMap<ActionId, MutationId>>,
    wake: Notify,
}

impl<R: RemoteStore + 'static> Pipeline<R> {
    pub fn new(remote: Arc<R>, config: PipelineConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let events = Arc::new(EventBus::new());
        let queue = MutationQueue::open(config.queue.clone(), Arc::clone(&clock), Some(Arc::clone(&events)))?;
        let controller = Arc::new(ConcurrencyController::new(
            remote,
            config.rate_limit.clone(),
            Arc::clone(&clock),
        ));
        let undo = UndoRegistry::with_events(clock, config.undo.duration(), Arc::clone(&events));

        Ok(Self {
            config,
            events,
            queue,
            controller,
            undo,
            pairings: Mutex::new(HashMap::new()),
            wake: Notify::new(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    pub fn undo_registry(&self) -> &UndoRegistry {
        &self.undo
    }

    pub fn controller(&self) -> &Arc<ConcurrencyController<R>> {
        &self.controller
    }

    pub fn subscribe(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        self.events.subscribe(config)
    }

    /// Queue a write.
    ///
    /// Deletes always register an undo action; other writes do when an
    /// `undo_message` is given and the command can be inverted.
    pub fn submit(&self, actor: Actor, command: MutationCommand, undo_message: Option<&str>) -> Result<Submission> {
        let inverse = match (command.kind().is_destructive(), undo_message) {
            (true, _) | (false, Some(_)) => command.invert(),
            (false, None) => None,
        };
        let message = undo_message
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} deleted", command.entity()));

        let mutation_id = self.queue.enqueue(actor.clone(), command)?;
        let action_id = inverse.map(|inverse| {
            let action_id = self.undo.register(
                message,
                CommandInverse::new(Arc::clone(&self.controller), actor, inverse),
                None,
            );
            let mut pairings = self.pairings.lock();
            pairings.retain(|id, _| self.undo.get(*id).is_some());
            pairings.insert(action_id, mutation_id);
            action_id
        });

        self.wake.notify_one();
        Ok(Submission {
            mutation_id,
            action_id,
        })
    }

    /// Reverse a registered action.
    ///
    /// If the paired write has not reached the remote store yet, it is
    /// dropped from the queue instead of running the inverse.
    pub async fn undo(&self, action_id: ActionId) -> Result<()> {
        let paired = self.pairings.lock().get(&action_id).copied();
        if let Some(mutation_id) = paired {
            if self
                .undo
                .consume_with(action_id, || self.queue.withdraw(mutation_id))?
            {
                self.pairings.lock().remove(&action_id);
                info!(action = action_id.0, mutation = mutation_id.0, "undo withdrew queued write");
                return Ok(());
            }
        }

        self.undo.undo(action_id).await?;
        self.pairings.lock().remove(&action_id);
        Ok(())
    }

    /// Run one dispatch pass over the queue.
    pub async fn dispatch(&self) -> Result<DispatchSummary> {
        self.queue.dispatch(&self.controller).await
    }

    /// Dispatch in the background on every submit and every interval tick.
    pub fn spawn_dispatcher(self: Arc<Self>) -> DispatcherHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = self.config.dispatcher.interval();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                    _ = self.wake.notified() => {}
                }

                self.undo.prune_expired();
                match self.dispatch().await {
                    Ok(summary) if summary.attempted > 0 => {
                        debug!(?summary, "background dispatch");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "background dispatch failed"),
                }
            }
            debug!("dispatcher stopped");
        });

        DispatcherHandle { shutdown_tx, task }
    }

    /// Version-checked update, outside the queue.
    pub async fn update_with_version(
        &self,
        actor: &Actor,
        table: &str,
        record_id: &str,
        fields: Fields,
        expected_version: u64,
    ) -> UpdateOutcome {
        self.controller
            .update_with_version(actor, table, record_id, fields, expected_version)
            .await
    }

    pub async fn bulk_insert(
        &self,
        actor: &Actor,
        table: &str,
        records: Vec<NewRecord>,
    ) -> std::result::Result<BulkInsertResponse, RemoteError> {
        self.controller.bulk_insert(actor, table, records).await
    }

    /// Audit history, newest first. `limit` defaults to the configured one.
    pub async fn audit_log(
        &self,
        table: &str,
        record_id: Option<&str>,
        limit: Option<usize>,
    ) -> std::result::Result<Vec<AuditRecord>, RemoteError> {
        let limit = limit.unwrap_or(self.config.audit.default_query_limit);
        self.controller
            .remote()
            .query_audit_log(table, record_id, limit)
            .await
    }
}

/// Handle to a running background dispatcher.
pub struct DispatcherHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Stop after the current pass and wait for the task to finish.
    /// Dropping the handle also stops the dispatcher.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "dispatcher task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
