//! Hobbes
//!
//! The Hobbes node coordination fabric: a shared resource and metadata
//! registry, cross-enclave command queues, an event notifier, and the
//! enclave / application / VM lifecycle protocol layered on top of them.
//!
//! The registry is the source of truth for the node's CPUs, memory blocks,
//! enclaves, applications and exported segments. Command queues are how
//! mutations propagate to the init task that owns the corresponding kernel
//! resources. The lifecycle module drives the state machines across both.

pub mod cmdq;
pub mod error;
pub mod file;
pub mod inittask;
pub mod lifecycle;
pub mod logger;
pub mod nodecfg;
pub mod notifier;
pub mod registry;
pub mod spec;

use hobbes_core::{AppId, EnclaveId};

pub use error::{HobbesError, Result};

// ———————————————————————————— Process Identity ———————————————————————————— //

/// The enclave this process runs in, from the process environment contract.
pub fn my_enclave_id() -> Option<EnclaveId> {
    let id = std::env::var(hobbes_core::ENV_ENCLAVE_ID).ok()?;
    id.parse().ok().map(EnclaveId)
}

/// The application row this process was launched as, if any.
pub fn my_app_id() -> Option<AppId> {
    let id = std::env::var(hobbes_core::ENV_APP_ID).ok()?;
    id.parse().ok().map(AppId)
}

/// Whether this process runs inside a Hobbes enclave.
pub fn is_available() -> bool {
    my_enclave_id().is_some()
}
