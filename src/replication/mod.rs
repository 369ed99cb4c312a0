//! Replication subsystem
//!
//! - `capture`: records every primary-store mutation in the change log
//! - `metadata`: the change log, version marker and per-peer watermarks
//! - `driver`: periodically pulls a peer's change log and replays it
//! - `compat`: version compatibility between peers

mod capture;
pub mod compat;
mod driver;
mod metadata;

pub use capture::{CapturePolicy, ChangeCaptureLog};
pub use driver::{
    CycleOutcome, DriverConfig, DriverHandle, IncompatiblePolicy, LocalPeer, ReplicationDriver,
    ReplicationPeer,
};
pub use metadata::{ReadStreamOptions, ReplicationMetadataStore, DEFAULT_SEPARATOR, STREAM_PAGE_SIZE};
