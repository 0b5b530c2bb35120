//! Live pipeline events for UI listeners.
//!
//! Queue and undo state changes are pushed to subscribers instead of being
//! polled on a timer:
//! - Mutation lifecycle (queued, syncing, synced, failed, retried, removed)
//! - Queue counters after every change
//! - Undo registrations, consumption and expiry
//!
//! Each subscriber has a bounded buffer. A subscriber that falls behind is
//! dropped rather than slowing the pipeline down.
//!
//! # Example
//!
//! ```ignore
//! let handle = pipeline.subscribe(SubscriptionConfig {
//!     filter: EventFilter::queue(),
//!     ..Default::default()
//! });
//!
//! while let Ok(event) = handle.recv() {
//!     match event {
//!         PipelineEvent::QueueCounts { pending, failed } => render_badge(pending, failed),
//!         PipelineEvent::Dropped { .. } => break,
//!         _ => {}
//!     }
//! }
//! ```

mod bus;
mod types;

pub use bus::EventBus;
pub use types::{
    DropReason, EventFilter, PipelineEvent, SubscriptionConfig, SubscriptionHandle, SubscriptionId,
};
