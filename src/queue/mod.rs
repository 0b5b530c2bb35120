//! Client-held queue of writes not yet confirmed by the remote store.
//!
//! Entries move `pending -> syncing -> (removed | failed)`. Failed entries
//! stay visible until the caller retries, resubmits or removes them; nothing
//! is retried automatically. With a journal configured the queue survives
//! process restarts.

mod journal;
mod manager;
mod record;

pub use journal::{JournalEntry, JournalOp, QueueJournal, Replayed};
pub use manager::{DispatchSummary, MutationQueue};
pub use record::MutationRecord;
