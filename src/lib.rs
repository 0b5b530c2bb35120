//! # Rollbook
//!
//! An offline-tolerant mutation pipeline for classroom records. Writes are
//! queued on the client, sent to an authoritative remote store under
//! optimistic concurrency, and destructive ones stay reversible for a short
//! grace period. The remote store keeps an append-only audit trail.
//!
//! ## Core Concepts
//!
//! - **Queue**: Unconfirmed writes, with manual retry for failures
//! - **Concurrency**: Version-checked updates; exactly one writer wins
//! - **Undo**: Short-lived inverses with a single winner per action
//! - **Rate limits**: Sliding windows keyed by actor and action type
//! - **Audit**: Before/after images for every applied write
//!
//! ## Example
//!
//! ```ignore
//! use rollbook::{Actor, MemoryStore, MutationCommand, Pipeline, PipelineConfig};
//!
//! let clock = rollbook::clock::system();
//! let remote = Arc::new(MemoryStore::new(clock.clone(), Default::default()));
//! let pipeline = Pipeline::new(remote, PipelineConfig::default(), clock)?;
//!
//! let actor = Actor::new("u-1", "Bu Sari");
//! let submission = pipeline.submit(
//!     actor,
//!     MutationCommand::delete("tasks", "t-1", snapshot),
//!     Some("Tugas dihapus"),
//! )?;
//! pipeline.dispatch().await?;
//!
//! // Within the undo window:
//! pipeline.undo(submission.action_id.unwrap()).await?;
//! ```

pub mod audit;
pub mod clock;
pub mod command;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod queue;
pub mod ratelimit;
pub mod remote;
pub mod types;
pub mod undo;
pub mod validation;

// Re-exports
pub use audit::{diff, AuditRecord, AuditRecorder, FieldChange};
pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{Applied, MutationCommand};
pub use concurrency::{ConcurrencyController, UpdateOutcome};
pub use config::{
    AuditConfig, DispatcherConfig, PipelineConfig, QueueConfig, RateLimitPolicy, UndoConfig,
};
pub use error::{ErrorKind, PipelineError, RemoteError, Result};
pub use events::{
    DropReason, EventBus, EventFilter, PipelineEvent, SubscriptionConfig, SubscriptionHandle,
    SubscriptionId,
};
pub use pipeline::{DispatcherHandle, Pipeline, Submission};
pub use queue::{DispatchSummary, MutationQueue, MutationRecord};
pub use ratelimit::RateLimiter;
pub use remote::{
    BulkInsertResponse, MemoryStore, NewRecord, RecordError, RemoteStore, UpdateErrorCode,
    UpdateResponse,
};
pub use types::{
    ActionId, Actor, AuditAction, AuditId, EntityRef, Fields, MutationId, MutationKind,
    MutationStatus, Timestamp, VersionedEntity,
};
pub use undo::{
    ActionStatus, CommandInverse, InverseFn, InverseOperation, ReversibleAction, UndoError,
    UndoRegistry,
};
pub use validation::{AllOf, FieldError, NumberRange, RecordValidator, RequiredFields};
