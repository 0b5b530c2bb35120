//! Append-only audit trail.
//!
//! Every successful insert, update or delete produces exactly one
//! [`AuditRecord`]. Records are never edited or removed once written.
//! For updates, [`diff`] derives the changed fields on demand.

mod diff;
mod recorder;

pub use diff::{diff, FieldChange};
pub use recorder::{AuditRecord, AuditRecorder};
