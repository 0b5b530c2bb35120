//! Optimistic concurrency controller.
//!
//! Client-side front for the remote store's write operations. Versioned
//! updates are turned into an [`UpdateOutcome`]; bulk inserts are gated by
//! an advisory local rate-limit check before the remote store makes the
//! final call. Conflicts and not-found are never retried here.

use crate::clock::Clock;
use crate::config::RateLimitPolicy;
use crate::error::{ErrorKind, RemoteError};
use crate::ratelimit::RateLimiter;
use crate::remote::{BulkInsertResponse, NewRecord, RemoteStore, UpdateErrorCode};
use crate::types::{Actor, Fields, VersionedEntity};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of a versioned update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Applied; the record now carries `new_version`.
    Success { new_version: u64 },
    /// Someone else wrote first. Nothing was applied.
    Conflict { current_version: u64 },
    NotFound,
    Error(RemoteError),
}

impl UpdateOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UpdateOutcome::Success { .. })
    }

    /// Collapse into a `Result`, classifying refusals as remote errors.
    pub fn into_result(self, expected_version: u64) -> Result<u64, RemoteError> {
        match self {
            UpdateOutcome::Success { new_version } => Ok(new_version),
            UpdateOutcome::Conflict { current_version } => Err(RemoteError::conflict(format!(
                "expected version {}, current version is {}",
                expected_version, current_version
            ))),
            UpdateOutcome::NotFound => Err(RemoteError::new(
                ErrorKind::NotFound,
                "record no longer exists",
            )),
            UpdateOutcome::Error(e) => Err(e),
        }
    }
}

/// Version-checked writes against a remote store.
pub struct ConcurrencyController<R> {
    remote: Arc<R>,
    policy: RateLimitPolicy,
    advisory: Option<RateLimiter>,
}

impl<R: RemoteStore> ConcurrencyController<R> {
    pub fn new(remote: Arc<R>, policy: RateLimitPolicy, clock: Arc<dyn Clock>) -> Self {
        let advisory = policy
            .advisory_precheck
            .then(|| RateLimiter::new(clock));
        Self {
            remote,
            policy,
            advisory,
        }
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Apply `fields` only if the record is still at `expected_version`.
    pub async fn update_with_version(
        &self,
        actor: &Actor,
        table: &str,
        record_id: &str,
        fields: Fields,
        expected_version: u64,
    ) -> UpdateOutcome {
        let response = match self
            .remote
            .update_with_version(actor, table, record_id, fields, expected_version)
            .await
        {
            Ok(response) => response,
            Err(e) => return UpdateOutcome::Error(e),
        };

        if response.success {
            return match response.new_version {
                Some(new_version) => UpdateOutcome::Success { new_version },
                None => UpdateOutcome::Error(RemoteError::new(
                    ErrorKind::ServerError,
                    "update succeeded without a new version",
                )),
            };
        }

        match response.error_code {
            Some(UpdateErrorCode::NotFound) => UpdateOutcome::NotFound,
            Some(UpdateErrorCode::Conflict) => {
                let current_version = response.current_version.unwrap_or_default();
                debug!(table, record_id, expected_version, current_version, "update conflict");
                UpdateOutcome::Conflict { current_version }
            }
            Some(UpdateErrorCode::UpdateFailed) | None => UpdateOutcome::Error(RemoteError::new(
                ErrorKind::ServerError,
                "update failed",
            )),
        }
    }

    /// Insert a batch, reporting per-record results.
    ///
    /// Refused up front (nothing sent) when the advisory limiter says the
    /// actor is over budget; the remote store may still refuse afterwards.
    pub async fn bulk_insert(
        &self,
        actor: &Actor,
        table: &str,
        records: Vec<NewRecord>,
    ) -> Result<BulkInsertResponse, RemoteError> {
        let policy = &self.policy;
        if let Some(advisory) = &self.advisory {
            if !advisory.check(
                &actor.id,
                &policy.action_type,
                policy.max_requests,
                policy.window_minutes,
            ) {
                let wait = advisory
                    .retry_after(&actor.id, &policy.action_type, policy.max_requests, policy.window_minutes)
                    .unwrap_or_default();
                warn!(
                    actor = %actor.id,
                    retry_after_secs = wait.as_secs(),
                    "bulk insert refused by local rate limit"
                );
                return Ok(BulkInsertResponse::rate_limited(records.len()));
            }
        }

        let count = records.len();
        let response = self.remote.bulk_insert(actor, table, records).await?;
        debug!(
            table,
            count,
            inserted = response.inserted,
            failed = response.failed,
            "bulk insert finished"
        );
        Ok(response)
    }

    /// Plain insert path.
    pub async fn create(
        &self,
        actor: &Actor,
        table: &str,
        record_id: &str,
        fields: Fields,
    ) -> Result<VersionedEntity, RemoteError> {
        self.remote.insert(actor, table, record_id, fields).await
    }

    /// Plain delete path.
    pub async fn delete(&self, actor: &Actor, table: &str, record_id: &str) -> Result<VersionedEntity, RemoteError> {
        self.remote.delete(actor, table, record_id).await
    }

    /// Ask the remote store whether the actor may proceed.
    pub async fn check_rate_limit(&self, actor_id: &str, action_type: &str) -> Result<bool, RemoteError> {
        self.remote
            .check_rate_limit(
                actor_id,
                action_type,
                self.policy.max_requests,
                self.policy.window_minutes,
            )
            .await
    }
}
