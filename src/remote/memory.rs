//! In-process remote store.

use super::{BulkInsertResponse, NewRecord, RecordError, RemoteStore, UpdateResponse};
use crate::audit::{AuditRecord, AuditRecorder};
use crate::clock::Clock;
use crate::config::RateLimitPolicy;
use crate::error::{ErrorKind, RemoteError};
use crate::ratelimit::RateLimiter;
use crate::types::{Actor, AuditAction, Fields, VersionedEntity};
use crate::validation::{FieldError, RecordValidator};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

type Table = HashMap<String, VersionedEntity>;

/// Remote store held in memory.
///
/// One mutex guards all tables, so every version check and its write (and
/// the matching audit append) happen as a single atomic step.
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Table>>,
    validators: RwLock<HashMap<String, Arc<dyn RecordValidator>>>,
    audit: AuditRecorder,
    limiter: RateLimiter,
    bulk_policy: RateLimitPolicy,
    offline: AtomicBool,
    next_generated_id: AtomicU64,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>, bulk_policy: RateLimitPolicy) -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            validators: RwLock::new(HashMap::new()),
            audit: AuditRecorder::new(Arc::clone(&clock)),
            limiter: RateLimiter::new(clock),
            bulk_policy,
            offline: AtomicBool::new(false),
            next_generated_id: AtomicU64::new(1),
        }
    }

    /// Install a validator for a table (replaces any previous one).
    pub fn set_validator(&self, table: &str, validator: impl RecordValidator + 'static) {
        self.validators
            .write()
            .insert(table.to_string(), Arc::new(validator));
    }

    /// Simulate losing connectivity: every call fails with `OFFLINE`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// The store's audit trail.
    pub fn audit(&self) -> &AuditRecorder {
        &self.audit
    }

    /// Current state of a record.
    pub fn get(&self, table: &str, record_id: &str) -> Option<VersionedEntity> {
        self.tables
            .lock()
            .get(table)
            .and_then(|t| t.get(record_id))
            .cloned()
    }

    /// Number of records in a table.
    pub fn count(&self, table: &str) -> usize {
        self.tables.lock().get(table).map_or(0, |t| t.len())
    }

    fn ensure_online(&self) -> Result<(), RemoteError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(RemoteError::offline())
        } else {
            Ok(())
        }
    }

    fn validate(&self, table: &str, fields: &Fields) -> Vec<FieldError> {
        self.validators
            .read()
            .get(table)
            .map(|v| v.validate(fields))
            .unwrap_or_default()
    }

    fn record_audit(
        &self,
        actor: &Actor,
        table: &str,
        record_id: &str,
        action: AuditAction,
        before: Option<Fields>,
        after: Option<Fields>,
    ) -> Result<AuditRecord, RemoteError> {
        self.audit
            .append(actor, table, record_id, action, before, after)
            .map_err(|e| RemoteError::new(ErrorKind::ServerError, e.to_string()))
    }

    /// Insert into an already-locked table map.
    fn insert_locked(
        &self,
        tables: &mut HashMap<String, Table>,
        actor: &Actor,
        table: &str,
        record_id: &str,
        fields: Fields,
    ) -> Result<VersionedEntity, RemoteError> {
        let rows = tables.entry(table.to_string()).or_default();
        if rows.contains_key(record_id) {
            return Err(RemoteError::conflict(format!(
                "{}/{} already exists",
                table, record_id
            )));
        }

        let entity = VersionedEntity {
            table: table.to_string(),
            record_id: record_id.to_string(),
            version: 1,
            fields,
        };
        rows.insert(record_id.to_string(), entity.clone());
        self.record_audit(
            actor,
            table,
            record_id,
            AuditAction::Insert,
            None,
            Some(entity.fields.clone()),
        )?;
        Ok(entity)
    }

    fn generate_id(&self, table: &str) -> String {
        let n = self.next_generated_id.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}", table, n)
    }

    fn update_locked(
        &self,
        actor: &Actor,
        table: &str,
        record_id: &str,
        fields: Fields,
        expected_version: u64,
    ) -> Result<UpdateResponse, RemoteError> {
        let mut tables = self.tables.lock();
        let entity = match tables.get_mut(table).and_then(|t| t.get_mut(record_id)) {
            Some(entity) => entity,
            None => return Ok(UpdateResponse::not_found()),
        };

        if entity.version != expected_version {
            debug!(
                table,
                record_id,
                expected_version,
                current_version = entity.version,
                "version conflict"
            );
            return Ok(UpdateResponse::conflict(entity.version));
        }

        let before = entity.fields.clone();
        for (key, value) in fields {
            entity.fields.insert(key, value);
        }
        entity.version += 1;
        let new_version = entity.version;
        let after = entity.fields.clone();

        self.record_audit(actor, table, record_id, AuditAction::Update, Some(before), Some(after))?;
        Ok(UpdateResponse::applied(new_version))
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn fetch(&self, table: &str, record_id: &str) -> Result<Option<VersionedEntity>, RemoteError> {
        self.ensure_online()?;
        Ok(self.get(table, record_id))
    }

    async fn insert(
        &self,
        actor: &Actor,
        table: &str,
        record_id: &str,
        fields: Fields,
    ) -> Result<VersionedEntity, RemoteError> {
        self.ensure_online()?;
        let errors = self.validate(table, &fields);
        if !errors.is_empty() {
            let summary: Vec<String> = errors
                .iter()
                .map(|e| format!("{} {}", e.field, e.message))
                .collect();
            return Err(RemoteError::new(ErrorKind::Validation, summary.join(", ")));
        }

        let mut tables = self.tables.lock();
        self.insert_locked(&mut tables, actor, table, record_id, fields)
    }

    async fn delete(&self, actor: &Actor, table: &str, record_id: &str) -> Result<VersionedEntity, RemoteError> {
        self.ensure_online()?;
        let mut tables = self.tables.lock();
        let removed = tables
            .get_mut(table)
            .and_then(|t| t.remove(record_id))
            .ok_or_else(|| RemoteError::not_found(table, record_id))?;

        self.record_audit(
            actor,
            table,
            record_id,
            AuditAction::Delete,
            Some(removed.fields.clone()),
            None,
        )?;
        Ok(removed)
    }

    async fn update_with_version(
        &self,
        actor: &Actor,
        table: &str,
        record_id: &str,
        fields: Fields,
        expected_version: u64,
    ) -> Result<UpdateResponse, RemoteError> {
        self.ensure_online()?;
        self.update_locked(actor, table, record_id, fields, expected_version)
    }

    async fn bulk_insert(
        &self,
        actor: &Actor,
        table: &str,
        records: Vec<NewRecord>,
    ) -> Result<BulkInsertResponse, RemoteError> {
        self.ensure_online()?;

        let policy = &self.bulk_policy;
        if !self.limiter.check(
            &actor.id,
            &policy.action_type,
            policy.max_requests,
            policy.window_minutes,
        ) {
            debug!(actor = %actor.id, table, "bulk insert rate limited");
            return Ok(BulkInsertResponse::rate_limited(records.len()));
        }

        let mut inserted = 0;
        let mut errors = Vec::new();
        let mut tables = self.tables.lock();

        for (index, record) in records.into_iter().enumerate() {
            let record_ref = record
                .record_id
                .clone()
                .unwrap_or_else(|| format!("#{}", index));

            let field_errors = self.validate(table, &record.fields);
            if !field_errors.is_empty() {
                errors.push(RecordError {
                    record_ref,
                    field_errors,
                });
                continue;
            }

            let record_id = record
                .record_id
                .unwrap_or_else(|| self.generate_id(table));
            match self.insert_locked(&mut tables, actor, table, &record_id, record.fields) {
                Ok(_) => inserted += 1,
                Err(e) => errors.push(RecordError {
                    record_ref,
                    field_errors: vec![FieldError::new("id", e.message)],
                }),
            }
        }

        let failed = errors.len();
        Ok(BulkInsertResponse {
            success: failed == 0,
            inserted,
            failed,
            errors,
            error_code: if failed == 0 {
                None
            } else {
                Some(ErrorKind::Validation)
            },
        })
    }

    async fn check_rate_limit(
        &self,
        actor_id: &str,
        action_type: &str,
        max_requests: u32,
        window_minutes: u32,
    ) -> Result<bool, RemoteError> {
        self.ensure_online()?;
        Ok(self
            .limiter
            .check(actor_id, action_type, max_requests, window_minutes))
    }

    async fn query_audit_log(
        &self,
        table: &str,
        record_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AuditRecord>, RemoteError> {
        self.ensure_online()?;
        Ok(self.audit.query(table, record_id, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::validation::RequiredFields;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn store() -> MemoryStore {
        MemoryStore::new(Arc::new(ManualClock::default()), RateLimitPolicy::default())
    }

    fn admin() -> Actor {
        Actor::new("u-admin", "Admin")
    }

    #[tokio::test]
    async fn test_insert_update_delete_audited() {
        let store = store();

        let created = store
            .insert(&admin(), "grades", "g-1", fields(json!({"score": 85})))
            .await
            .unwrap();
        assert_eq!(created.version, 1);

        let response = store
            .update_with_version(&admin(), "grades", "g-1", fields(json!({"notes": "ok"})), 1)
            .await
            .unwrap();
        assert_eq!(response, UpdateResponse::applied(2));

        let entity = store.get("grades", "g-1").unwrap();
        assert_eq!(entity.fields["score"], 85);
        assert_eq!(entity.fields["notes"], "ok");

        let removed = store.delete(&admin(), "grades", "g-1").await.unwrap();
        assert_eq!(removed.version, 2);
        assert!(store.get("grades", "g-1").is_none());

        let log = store.query_audit_log("grades", Some("g-1"), 10).await.unwrap();
        let actions: Vec<_> = log.iter().map(|r| r.action).collect();
        assert_eq!(
            actions,
            vec![AuditAction::Delete, AuditAction::Update, AuditAction::Insert]
        );
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected_without_change() {
        let store = store();
        store
            .insert(&admin(), "grades", "g-1", fields(json!({"score": 85})))
            .await
            .unwrap();
        store
            .update_with_version(&admin(), "grades", "g-1", fields(json!({"score": 90})), 1)
            .await
            .unwrap();

        let response = store
            .update_with_version(&admin(), "grades", "g-1", fields(json!({"score": 10})), 1)
            .await
            .unwrap();
        assert_eq!(response, UpdateResponse::conflict(2));
        assert_eq!(store.get("grades", "g-1").unwrap().fields["score"], 90);
        assert_eq!(store.audit().len(), 2);
    }

    #[tokio::test]
    async fn test_update_missing_record() {
        let store = store();
        let response = store
            .update_with_version(&admin(), "grades", "nope", Fields::new(), 1)
            .await
            .unwrap();
        assert_eq!(response, UpdateResponse::not_found());
    }

    #[tokio::test]
    async fn test_duplicate_insert_conflicts() {
        let store = store();
        store.insert(&admin(), "students", "s-1", Fields::new()).await.unwrap();
        let err = store
            .insert(&admin(), "students", "s-1", Fields::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_single_insert_is_validated() {
        let store = store();
        store.set_validator("students", RequiredFields::new(["name"]));
        let err = store
            .insert(&admin(), "students", "s-1", fields(json!({"nis": "1"})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(store.count("students"), 0);
    }

    #[tokio::test]
    async fn test_offline_rejects_everything() {
        let store = store();
        store.set_offline(true);
        let err = store.fetch("students", "s-1").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Offline);
        assert!(err.is_retryable());

        store.set_offline(false);
        assert!(store.fetch("students", "s-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bulk_insert_generates_ids_and_reports_duplicates() {
        let store = store();
        store.insert(&admin(), "students", "s-1", Fields::new()).await.unwrap();

        let response = store
            .bulk_insert(
                &admin(),
                "students",
                vec![
                    NewRecord::anonymous(fields(json!({"name": "Ani"}))),
                    NewRecord::new("s-1", fields(json!({"name": "Budi"}))),
                ],
            )
            .await
            .unwrap();

        assert_eq!(response.inserted, 1);
        assert_eq!(response.failed, 1);
        assert_eq!(response.errors[0].record_ref, "s-1");
        assert_eq!(store.count("students"), 2);
        assert!(store.get("students", "students-1").is_some());
    }
}
