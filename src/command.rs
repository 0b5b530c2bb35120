//! Mutation commands.
//!
//! A command is the payload of a queued write. It knows how to apply itself
//! through the concurrency controller and how to build its own inverse, so
//! the queue and the undo registry share one definition of each write.

use crate::concurrency::ConcurrencyController;
use crate::error::RemoteError;
use crate::remote::RemoteStore;
use crate::types::{Actor, EntityRef, Fields, MutationKind};
use serde::{Deserialize, Serialize};

/// A client-originated write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MutationCommand {
    Create {
        table: String,
        record_id: String,
        fields: Fields,
    },
    Update {
        table: String,
        record_id: String,
        fields: Fields,
        expected_version: u64,
        /// Prior values of the touched fields, when known. Needed to invert.
        previous: Option<Fields>,
    },
    Delete {
        table: String,
        record_id: String,
        /// Last known state, used to re-create the record on undo.
        snapshot: Fields,
    },
}

/// What the remote store reported after applying a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Applied {
    Created { version: u64 },
    Updated { new_version: u64 },
    Deleted,
}

impl MutationCommand {
    pub fn create(table: impl Into<String>, record_id: impl Into<String>, fields: Fields) -> Self {
        MutationCommand::Create {
            table: table.into(),
            record_id: record_id.into(),
            fields,
        }
    }

    pub fn update(
        table: impl Into<String>,
        record_id: impl Into<String>,
        fields: Fields,
        expected_version: u64,
    ) -> Self {
        MutationCommand::Update {
            table: table.into(),
            record_id: record_id.into(),
            fields,
            expected_version,
            previous: None,
        }
    }

    pub fn delete(table: impl Into<String>, record_id: impl Into<String>, snapshot: Fields) -> Self {
        MutationCommand::Delete {
            table: table.into(),
            record_id: record_id.into(),
            snapshot,
        }
    }

    /// Attach the prior values of an update so it can be inverted.
    pub fn with_previous(mut self, prior: Fields) -> Self {
        if let MutationCommand::Update { previous, .. } = &mut self {
            *previous = Some(prior);
        }
        self
    }

    pub fn kind(&self) -> MutationKind {
        match self {
            MutationCommand::Create { .. } => MutationKind::Create,
            MutationCommand::Update { .. } => MutationKind::Update,
            MutationCommand::Delete { .. } => MutationKind::Delete,
        }
    }

    /// The table this command writes to.
    pub fn entity_type(&self) -> &str {
        match self {
            MutationCommand::Create { table, .. }
            | MutationCommand::Update { table, .. }
            | MutationCommand::Delete { table, .. } => table,
        }
    }

    pub fn record_id(&self) -> &str {
        match self {
            MutationCommand::Create { record_id, .. }
            | MutationCommand::Update { record_id, .. }
            | MutationCommand::Delete { record_id, .. } => record_id,
        }
    }

    pub fn entity(&self) -> EntityRef {
        EntityRef::new(self.entity_type(), self.record_id())
    }

    /// The command that undoes this one, if it can be built.
    ///
    /// An update is only invertible when its prior values are known; the
    /// inverse expects the version this update will produce.
    pub fn invert(&self) -> Option<MutationCommand> {
        match self {
            MutationCommand::Create {
                table, record_id, fields,
            } => Some(MutationCommand::Delete {
                table: table.clone(),
                record_id: record_id.clone(),
                snapshot: fields.clone(),
            }),
            MutationCommand::Update {
                table,
                record_id,
                fields,
                expected_version,
                previous,
            } => previous.as_ref().map(|prior| MutationCommand::Update {
                table: table.clone(),
                record_id: record_id.clone(),
                fields: prior.clone(),
                expected_version: expected_version + 1,
                previous: Some(fields.clone()),
            }),
            MutationCommand::Delete {
                table,
                record_id,
                snapshot,
            } => Some(MutationCommand::Create {
                table: table.clone(),
                record_id: record_id.clone(),
                fields: snapshot.clone(),
            }),
        }
    }

    /// Submit through the controller. Updates go through the version check;
    /// creates and deletes take the plain paths.
    pub async fn apply<R: RemoteStore>(
        &self,
        controller: &ConcurrencyController<R>,
        actor: &Actor,
    ) -> Result<Applied, RemoteError> {
        match self {
            MutationCommand::Create {
                table,
                record_id,
                fields,
            } => {
                let entity = controller
                    .create(actor, table, record_id, fields.clone())
                    .await?;
                Ok(Applied::Created {
                    version: entity.version,
                })
            }
            MutationCommand::Update {
                table,
                record_id,
                fields,
                expected_version,
                ..
            } => {
                let new_version = controller
                    .update_with_version(actor, table, record_id, fields.clone(), *expected_version)
                    .await
                    .into_result(*expected_version)?;
                Ok(Applied::Updated { new_version })
            }
            MutationCommand::Delete {
                table, record_id, ..
            } => {
                controller.delete(actor, table, record_id).await?;
                Ok(Applied::Deleted)
            }
        }
    }
}
