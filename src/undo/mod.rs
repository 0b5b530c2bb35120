//! Reversible action registry.
//!
//! Destructive writes register an inverse that stays available for a short
//! grace period. Each action has exactly one winner: the first successful
//! `undo` consumes it, and once its deadline fires it expires and is pruned.

mod action;
mod registry;

pub use action::{ActionStatus, CommandInverse, InverseFn, InverseOperation, ReversibleAction};
pub use registry::{UndoError, UndoRegistry};
