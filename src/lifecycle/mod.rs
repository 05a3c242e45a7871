//! Enclave, application and VM lifecycle
//!
//! The state machines the fabric drives across the registry and the command
//! queues. Coordinators here mutate registry rows, issue commands to the
//! init task that owns the kernel resources, and raise notifier events on
//! every terminal transition.

pub mod app;
pub mod enclave;
pub mod vm;

use std::time::{Duration, Instant};

use hobbes_core::{CmdCode, EnclaveId, EnclaveState};

use crate::cmdq::CmdClient;
use crate::error::{HobbesError, Result};
use crate::registry::Registry;
use crate::spec::{CpuAssignSpec, MemAssignSpec};

pub use app::{kill_app, launch_app, launch_app_with_hio, HioLaunch, HioPair};
pub use enclave::{create_enclave, destroy_enclave, PiscesBoot, PiscesConfig, PiscesResources};
pub use vm::{create_vm, destroy_vm};

// ———————————————————————————— Command Plumbing ———————————————————————————— //

/// Connect to an enclave's command queue, discovered through the registry.
pub fn open_enclave_cmdq(registry: &Registry, enclave: EnclaveId) -> Result<CmdClient> {
    let segid = registry.enclave_cmdq(enclave)?.ok_or_else(|| {
        HobbesError::not_found(format!("enclave {} has no command queue", enclave))
    })?;
    CmdClient::connect(segid)
}

/// Flatten a non-zero command reply into an error carrying the reply string.
pub(crate) fn check_reply(ret: i64, data: &[u8], what: &str) -> Result<()> {
    if ret == 0 {
        return Ok(());
    }
    let msg = String::from_utf8_lossy(data);
    let msg = msg.trim_end_matches('\0').trim();
    if msg.is_empty() {
        Err(HobbesError::child_failure(format!("{} failed (ret={})", what, ret)))
    } else {
        Err(HobbesError::child_failure(format!("{}: {}", what, msg)))
    }
}

/// Hand a physical memory range to an enclave's kernel.
pub fn assign_memory(
    registry: &Registry,
    enclave: EnclaveId,
    base_addr: u64,
    size: u64,
    allocated: bool,
    zeroed: bool,
) -> Result<()> {
    let client = open_enclave_cmdq(registry, enclave)?;
    let spec = MemAssignSpec {
        base_addr,
        size,
        allocated,
        zeroed,
    };
    let (ret, data) = client.submit(CmdCode::AddMem.into(), &spec.to_wire())?;
    check_reply(ret, &data, "memory assignment")
}

/// Withdraw a physical memory range from an enclave's kernel.
pub fn remove_memory(
    registry: &Registry,
    enclave: EnclaveId,
    base_addr: u64,
    size: u64,
    allocated: bool,
) -> Result<()> {
    let client = open_enclave_cmdq(registry, enclave)?;
    let spec = MemAssignSpec {
        base_addr,
        size,
        allocated,
        zeroed: false,
    };
    let (ret, data) = client.submit(CmdCode::RemoveMem.into(), &spec.to_wire())?;
    check_reply(ret, &data, "memory removal")
}

/// Hand a CPU to an enclave's kernel.
pub fn assign_cpu(
    registry: &Registry,
    enclave: EnclaveId,
    phys_cpu_id: u32,
    apic_id: u32,
) -> Result<()> {
    let client = open_enclave_cmdq(registry, enclave)?;
    let spec = CpuAssignSpec {
        phys_cpu_id,
        apic_id,
    };
    let (ret, data) = client.submit(CmdCode::AddCpu.into(), &spec.to_wire())?;
    check_reply(ret, &data, "cpu assignment")
}

// ————————————————————————————— State Watching ————————————————————————————— //

/// Poll the registry until an enclave reaches the wanted state.
///
/// The bound is a liveness policy, not a correctness requirement; hosted
/// init tasks usually report within a few polls.
pub(crate) fn wait_for_enclave_state(
    registry: &Registry,
    enclave: EnclaveId,
    wanted: EnclaveState,
    timeout: Duration,
) -> Result<()> {
    const POLL_INTERVAL: Duration = Duration::from_millis(100);

    let deadline = Instant::now() + timeout;
    loop {
        let state = registry.enclave_state(enclave)?;
        if state == wanted {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(HobbesError::child_failure(format!(
                "enclave {} stuck in state {} waiting for {}",
                enclave, state, wanted
            )));
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}
