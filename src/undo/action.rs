//! Reversible action types.

use crate::command::MutationCommand;
use crate::concurrency::ConcurrencyController;
use crate::error::RemoteError;
use crate::remote::RemoteStore;
use crate::types::{ActionId, Actor, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

/// Lifecycle of a reversible action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Active,
    Consumed,
    Expired,
}

/// Read-only view of a registered action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReversibleAction {
    pub action_id: ActionId,
    /// Shown to the user, e.g. "Tugas dihapus".
    pub message: String,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    pub status: ActionStatus,
}

/// Something that undoes a destructive write.
#[async_trait]
pub trait InverseOperation: Send + Sync {
    async fn invert(&self) -> Result<(), RemoteError>;
}

/// Adapter for async closures.
pub struct InverseFn<F>(pub F);

#[async_trait]
impl<F, Fut> InverseOperation for InverseFn<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), RemoteError>> + Send,
{
    async fn invert(&self) -> Result<(), RemoteError> {
        (self.0)().await
    }
}

/// Replays an inverse command through the concurrency controller.
pub struct CommandInverse<R> {
    controller: Arc<ConcurrencyController<R>>,
    actor: Actor,
    command: MutationCommand,
}

impl<R: RemoteStore> CommandInverse<R> {
    pub fn new(controller: Arc<ConcurrencyController<R>>, actor: Actor, command: MutationCommand) -> Self {
        Self {
            controller,
            actor,
            command,
        }
    }

    pub fn command(&self) -> &MutationCommand {
        &self.command
    }
}

#[async_trait]
impl<R: RemoteStore> InverseOperation for CommandInverse<R> {
    async fn invert(&self) -> Result<(), RemoteError> {
        self.command
            .apply(&self.controller, &self.actor)
            .await
            .map(|_| ())
    }
}
