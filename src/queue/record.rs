//! Queue entry type.

use crate::command::MutationCommand;
use crate::error::RemoteError;
use crate::types::{Actor, EntityRef, MutationId, MutationKind, MutationStatus, Timestamp};
use serde::{Deserialize, Serialize};

/// A write waiting for confirmation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub id: MutationId,
    pub kind: MutationKind,
    /// Table the write targets.
    pub entity_type: String,
    pub payload: MutationCommand,
    pub actor: Actor,
    pub created_at: Timestamp,
    pub retry_count: u32,
    pub status: MutationStatus,
    pub last_error: Option<RemoteError>,
}

impl MutationRecord {
    pub(crate) fn new(id: MutationId, actor: Actor, payload: MutationCommand, created_at: Timestamp) -> Self {
        Self {
            id,
            kind: payload.kind(),
            entity_type: payload.entity_type().to_string(),
            payload,
            actor,
            created_at,
            retry_count: 0,
            status: MutationStatus::Pending,
            last_error: None,
        }
    }

    pub fn entity(&self) -> EntityRef {
        self.payload.entity()
    }

    /// Counts toward `pending_count` (pending or syncing).
    pub fn is_outstanding(&self) -> bool {
        matches!(self.status, MutationStatus::Pending | MutationStatus::Syncing)
    }
}
