//! In-memory audit recorder.

use crate::clock::Clock;
use crate::error::{PipelineError, Result};
use crate::types::{Actor, AuditAction, AuditId, Fields, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// An immutable audit entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: AuditId,
    pub created_at: Timestamp,
    pub actor_id: String,
    pub actor_label: String,
    pub table_name: String,
    pub record_id: String,
    pub action: AuditAction,
    /// Pre-image (update and delete only).
    pub before_state: Option<Fields>,
    /// Post-image (insert and update only).
    pub after_state: Option<Fields>,
}

#[derive(Default)]
struct Inner {
    /// All records in append order; position = id - 1.
    records: Vec<AuditRecord>,
    /// (table, record_id) -> positions in `records`.
    by_record: HashMap<(String, String), Vec<usize>>,
    /// table -> positions in `records`.
    by_table: HashMap<String, Vec<usize>>,
}

/// Append-only audit log with table and record indices.
pub struct AuditRecorder {
    clock: Arc<dyn Clock>,
    inner: RwLock<Inner>,
}

impl AuditRecorder {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Append a record.
    ///
    /// The before/after images must match the action: insert carries only
    /// `after`, delete only `before`, update both.
    pub fn append(
        &self,
        actor: &Actor,
        table_name: &str,
        record_id: &str,
        action: AuditAction,
        before: Option<Fields>,
        after: Option<Fields>,
    ) -> Result<AuditRecord> {
        match (action, before.is_some(), after.is_some()) {
            (AuditAction::Insert, false, true)
            | (AuditAction::Update, true, true)
            | (AuditAction::Delete, true, false) => {}
            (action, has_before, has_after) => {
                return Err(PipelineError::InvalidAudit(format!(
                    "{:?} with before={} after={}",
                    action, has_before, has_after
                )));
            }
        }

        let mut inner = self.inner.write();
        let position = inner.records.len();
        let record = AuditRecord {
            id: AuditId(position as u64 + 1),
            created_at: self.clock.now(),
            actor_id: actor.id.clone(),
            actor_label: actor.label.clone(),
            table_name: table_name.to_string(),
            record_id: record_id.to_string(),
            action,
            before_state: before,
            after_state: after,
        };

        inner.records.push(record.clone());
        inner
            .by_record
            .entry((table_name.to_string(), record_id.to_string()))
            .or_default()
            .push(position);
        inner
            .by_table
            .entry(table_name.to_string())
            .or_default()
            .push(position);

        Ok(record)
    }

    /// Records for a table (optionally one record), newest first.
    pub fn query(&self, table_name: &str, record_id: Option<&str>, limit: usize) -> Vec<AuditRecord> {
        let inner = self.inner.read();
        let positions = match record_id {
            Some(id) => inner
                .by_record
                .get(&(table_name.to_string(), id.to_string())),
            None => inner.by_table.get(table_name),
        };

        positions
            .map(|positions| {
                positions
                    .iter()
                    .rev()
                    .take(limit)
                    .map(|&p| inner.records[p].clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get a record by id.
    pub fn get(&self, id: AuditId) -> Option<AuditRecord> {
        let index = id.0.checked_sub(1)? as usize;
        self.inner.read().records.get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
