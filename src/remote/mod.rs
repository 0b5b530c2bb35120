//! Remote data store interface.
//!
//! The remote store is authoritative for versions, rate limits and the
//! audit trail. The pipeline talks to it only through [`RemoteStore`];
//! [`MemoryStore`] is an in-process implementation with the same
//! guarantees, used for tests and offline demos.

mod memory;

pub use memory::MemoryStore;

use crate::audit::AuditRecord;
use crate::error::{ErrorKind, RemoteError};
use crate::types::{Actor, Fields, VersionedEntity};
use crate::validation::FieldError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A record submitted to a bulk insert.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    /// Client-chosen key; the store generates one when absent.
    pub record_id: Option<String>,
    pub fields: Fields,
}

impl NewRecord {
    pub fn new(record_id: impl Into<String>, fields: Fields) -> Self {
        Self {
            record_id: Some(record_id.into()),
            fields,
        }
    }

    pub fn anonymous(fields: Fields) -> Self {
        Self {
            record_id: None,
            fields,
        }
    }
}

/// Why one record of a bulk insert was rejected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordError {
    /// Record id, or `#<index>` for records without one.
    pub record_ref: String,
    pub field_errors: Vec<FieldError>,
}

/// Response of a bulk insert.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkInsertResponse {
    pub success: bool,
    pub inserted: usize,
    pub failed: usize,
    pub errors: Vec<RecordError>,
    pub error_code: Option<ErrorKind>,
}

impl BulkInsertResponse {
    /// Whole batch refused by the rate limiter.
    pub fn rate_limited(len: usize) -> Self {
        Self {
            success: false,
            inserted: 0,
            failed: len,
            errors: Vec::new(),
            error_code: Some(ErrorKind::RateLimit),
        }
    }
}

/// Error code of a refused versioned update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateErrorCode {
    NotFound,
    Conflict,
    UpdateFailed,
}

/// Response of a versioned update.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResponse {
    pub success: bool,
    pub new_version: Option<u64>,
    pub current_version: Option<u64>,
    pub error_code: Option<UpdateErrorCode>,
}

impl UpdateResponse {
    pub fn applied(new_version: u64) -> Self {
        Self {
            success: true,
            new_version: Some(new_version),
            current_version: None,
            error_code: None,
        }
    }

    pub fn conflict(current_version: u64) -> Self {
        Self {
            success: false,
            new_version: None,
            current_version: Some(current_version),
            error_code: Some(UpdateErrorCode::Conflict),
        }
    }

    pub fn not_found() -> Self {
        Self {
            success: false,
            new_version: None,
            current_version: None,
            error_code: Some(UpdateErrorCode::NotFound),
        }
    }
}

/// Operations the pipeline consumes from the remote data store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Read the current state of a record.
    async fn fetch(&self, table: &str, record_id: &str) -> Result<Option<VersionedEntity>, RemoteError>;

    /// Insert a new record at version 1. Fails with `CONFLICT` if it exists.
    async fn insert(
        &self,
        actor: &Actor,
        table: &str,
        record_id: &str,
        fields: Fields,
    ) -> Result<VersionedEntity, RemoteError>;

    /// Delete a record, returning its last state.
    async fn delete(&self, actor: &Actor, table: &str, record_id: &str) -> Result<VersionedEntity, RemoteError>;

    /// Atomic version check and apply.
    async fn update_with_version(
        &self,
        actor: &Actor,
        table: &str,
        record_id: &str,
        fields: Fields,
        expected_version: u64,
    ) -> Result<UpdateResponse, RemoteError>;

    /// Validate and insert each record independently.
    async fn bulk_insert(
        &self,
        actor: &Actor,
        table: &str,
        records: Vec<NewRecord>,
    ) -> Result<BulkInsertResponse, RemoteError>;

    /// Authoritative sliding-window check; admitted requests are counted.
    async fn check_rate_limit(
        &self,
        actor_id: &str,
        action_type: &str,
        max_requests: u32,
        window_minutes: u32,
    ) -> Result<bool, RemoteError>;

    /// Audit history, newest first.
    async fn query_audit_log(
        &self,
        table: &str,
        record_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AuditRecord>, RemoteError>;
}
