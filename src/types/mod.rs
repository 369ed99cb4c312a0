//! Data types shared across the replicator
//!
//! This module contains the change-log records, store mutations and peer
//! identities used throughout the crate.

mod change;
mod mutation;
mod peer;

pub use change::{ChangeRecord, ChangeType, Timestamp, TIMESTAMP_KEY_WIDTH};
pub use mutation::{Mutation, MutationOrigin, WriteOp};
pub use peer::{PeerIdentity, ANONYMOUS};
