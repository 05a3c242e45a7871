//! Application lifecycle
//!
//! Applications are rows in the registry plus a process in some enclave.
//! The coordinator creates the row, ships an AppLaunch command to the
//! owning enclave's init task, and watches application events for exits.

use std::sync::Arc;

use hobbes_core::{AppId, AppState, CmdCode, EnclaveId, EnclaveType, EventMask};

use super::{assign_memory, check_reply, open_enclave_cmdq};
use crate::error::{HobbesError, Result};
use crate::notifier::{notify, Notifier};
use crate::registry::Registry;
use crate::spec::{encode_id, AppSpec};

/// Launch an application in an enclave.
///
/// The spec must already carry its registry app id; the init task stamps
/// the id into the child's environment.
pub fn launch_app(registry: &Registry, enclave: EnclaveId, spec: &AppSpec) -> Result<()> {
    if spec.app_id.is_none() {
        return Err(HobbesError::invalid("app spec carries no app id"));
    }
    let client = open_enclave_cmdq(registry, enclave)?;
    let (ret, data) = client.submit(CmdCode::AppLaunch.into(), &spec.to_wire())?;
    check_reply(ret, &data, "app launch")
}

/// Kill an application running in an enclave.
pub fn kill_app(registry: &Registry, enclave: EnclaveId, app: AppId) -> Result<()> {
    let client = open_enclave_cmdq(registry, enclave)?;
    let (ret, data) = client.submit(CmdCode::AppKill.into(), &encode_id(app.0))?;
    check_reply(ret, &data, "app kill")
}

// ————————————————————————— I/O-Offloaded Launches ————————————————————————— //

/// An application whose I/O is serviced by a stub in another enclave.
///
/// Region sizes are caller-supplied; deriving them from the executable image
/// is the launcher front-end's job.
#[derive(Debug, Clone)]
pub struct HioLaunch {
    pub name: String,
    pub spec: AppSpec,
    pub stub_path: String,
    pub stub_argv: Option<String>,
    pub stub_envp: Option<String>,
    pub numa_node: Option<u32>,
    pub data_size: u64,
    pub heap_size: u64,
    pub stack_size: u64,
}

/// A launched stub/compute pair, supervised until one side exits.
pub struct HioPair {
    registry: Registry,
    notifier: Notifier,
    pub compute: (EnclaveId, AppId),
    pub stub: (EnclaveId, AppId),
}

/// Launch an application in `compute_enclave` with its I/O serviced by a
/// stub in `hio_enclave`.
///
/// Three memory regions (data, heap, stack) are carved out of the free
/// pool, exported as named segments for the stub, and assigned to the
/// compute enclave's kernel; the compute side then runs with preallocated
/// memory at the three physical addresses.
pub fn launch_app_with_hio(
    registry: &Registry,
    compute_enclave: EnclaveId,
    hio_enclave: EnclaveId,
    launch: &HioLaunch,
) -> Result<HioPair> {
    if registry.enclave_type(compute_enclave)? != EnclaveType::Pisces {
        return Err(HobbesError::invalid(
            "I/O offload requires a co-kernel compute enclave",
        ));
    }
    registry.enclave_info(hio_enclave)?;

    // Subscribe before anything can exit so no event is lost.
    let notifier = Notifier::create(registry, EventMask::APPLICATION)?;

    let stub_name = format!("{}-hio", launch.name);
    let stub_app = registry.create_app(&stub_name, hio_enclave)?;
    let compute_app = registry.create_app(&launch.name, compute_enclave)?;

    let block_size = registry.block_size()?;
    let mut regions: Vec<(u64, u64)> = Vec::new();

    let result = (|| {
        // Carve the three regions out of the compute enclave's free pool.
        let mut region = |bytes: u64| -> Result<u64> {
            let base = registry.alloc_mem(compute_enclave, launch.numa_node, bytes)?;
            let span = registry.span_for_bytes(bytes)?;
            registry.assign_blocks_to_app(base, span, Some(compute_app))?;
            regions.push((base, span as u64 * block_size));
            Ok(base)
        };
        let data_pa = region(launch.data_size)?;
        let heap_pa = region(launch.heap_size)?;
        let stack_pa = region(launch.stack_size)?;

        // Export each region for the stub and advertise it.
        let mut export = |suffix: &str, base: u64| -> Result<xemem::SegId> {
            let segid = xemem::make(Arc::new(base), None)?;
            let name = format!("{}-{}", launch.name, suffix);
            registry.create_segment(segid, Some(&name), Some(hio_enclave), Some(stub_app))?;
            Ok(segid)
        };
        let data_segid = export("data", data_pa)?;
        let heap_segid = export("heap", heap_pa)?;
        let stack_segid = export("stack", stack_pa)?;

        // The compute enclave's kernel learns about the physical ranges.
        for (base, size) in &regions {
            assign_memory(registry, compute_enclave, *base, *size, true, false)?;
        }

        // Stub first, so the offload endpoint exists when the app boots.
        let mut stub_spec = AppSpec::new(&launch.stub_path);
        stub_spec.name = Some(stub_name.clone());
        stub_spec.argv = launch.stub_argv.clone();
        stub_spec.envp = launch.stub_envp.clone();
        stub_spec.app_id = Some(stub_app);
        stub_spec.data_segid = Some(data_segid);
        stub_spec.heap_segid = Some(heap_segid);
        stub_spec.stack_segid = Some(stack_segid);
        launch_app(registry, hio_enclave, &stub_spec)?;

        let mut spec = launch.spec.clone();
        spec.name = Some(launch.name.clone());
        spec.app_id = Some(compute_app);
        spec.use_prealloc_mem = true;
        spec.data_pa = Some(data_pa);
        spec.heap_pa = Some(heap_pa);
        spec.stack_pa = Some(stack_pa);
        if let Err(e) = launch_app(registry, compute_enclave, &spec) {
            // The stub is already up; take it down with us.
            let _ = kill_app(registry, hio_enclave, stub_app);
            return Err(e);
        }

        Ok(())
    })();

    if let Err(e) = result {
        for (base, size) in &regions {
            let _ = registry.free_mem(*base, *size);
        }
        let _ = registry.set_app_state(compute_app, AppState::Error);
        let _ = registry.set_app_state(stub_app, AppState::Error);
        notify(registry, EventMask::APPLICATION);
        return Err(e);
    }

    Ok(HioPair {
        registry: registry.clone(),
        notifier,
        compute: (compute_enclave, compute_app),
        stub: (hio_enclave, stub_app),
    })
}

impl HioPair {
    fn is_done(&self, app: AppId) -> Result<bool> {
        Ok(!matches!(
            self.registry.app_state(app)?,
            AppState::Initialized | AppState::Running
        ))
    }

    /// Block until either side exits, then kill the survivor.
    pub fn supervise(&self) -> Result<()> {
        use nix::poll::{poll, PollFd, PollFlags};

        loop {
            let compute_done = self.is_done(self.compute.1)?;
            let stub_done = self.is_done(self.stub.1)?;

            if compute_done || stub_done {
                if !stub_done {
                    kill_app(&self.registry, self.stub.0, self.stub.1)?;
                }
                if !compute_done {
                    kill_app(&self.registry, self.compute.0, self.compute.1)?;
                }
                return Ok(());
            }

            let mut fds = [PollFd::new(self.notifier.fd(), PollFlags::POLLIN)];
            match poll(&mut fds, -1) {
                Ok(_) => {
                    self.notifier.ack()?;
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    return Err(HobbesError::transport(format!(
                        "poll on notifier failed: {}",
                        e
                    )))
                }
            }
        }
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use std::thread;

    use hobbes_core::{AppState, EnclaveType};

    use super::*;
    use crate::inittask::testutil::{
        master_node, shutdown_enclave, spawn_init_task, wait_for_app_state,
    };
    use crate::inittask::InitTask;

    #[test]
    fn killing_the_stub_takes_the_compute_app_down() {
        let (registry, master) = master_node();
        let master_loop = spawn_init_task(InitTask::new(registry.clone(), master).unwrap());

        // A co-kernel compute enclave, its init task hosted like any other.
        let compute = registry
            .create_enclave(Some("p1"), EnclaveType::Pisces, Some(master))
            .unwrap();
        let compute_loop = spawn_init_task(InitTask::new(registry.clone(), compute).unwrap());

        let blk = registry.block_size().unwrap();
        let launch = HioLaunch {
            name: String::from("job"),
            spec: {
                let mut spec = AppSpec::new("/bin/sleep");
                spec.argv = Some(String::from("600"));
                spec
            },
            stub_path: String::from("/bin/sleep"),
            stub_argv: Some(String::from("600")),
            stub_envp: None,
            numa_node: None,
            data_size: blk,
            heap_size: blk,
            stack_size: blk,
        };

        let free_before = registry.free_mem_bytes().unwrap();
        let pair = launch_app_with_hio(&registry, compute, master, &launch).unwrap();
        let (compute_app, stub_app) = (pair.compute.1, pair.stub.1);

        // Three regions back the job, owned by the compute enclave.
        assert_eq!(registry.free_mem_bytes().unwrap(), free_before - 3 * blk);
        assert_eq!(registry.enclave_memory_list(compute).unwrap().len(), 3);
        assert_eq!(registry.list_segments().unwrap().len(), 5);

        wait_for_app_state(&registry, stub_app, AppState::Running);
        wait_for_app_state(&registry, compute_app, AppState::Running);

        let supervisor = thread::spawn(move || pair.supervise());

        // One side dies; the supervisor must take the other down.
        kill_app(&registry, master, stub_app).unwrap();
        supervisor.join().unwrap().unwrap();

        wait_for_app_state(&registry, stub_app, AppState::Stopped);
        wait_for_app_state(&registry, compute_app, AppState::Stopped);

        shutdown_enclave(&registry, compute, compute_loop);
        shutdown_enclave(&registry, master, master_loop);
    }

    #[test]
    fn offload_requires_a_co_kernel_compute_enclave() {
        let (registry, master) = master_node();

        let launch = HioLaunch {
            name: String::from("job"),
            spec: AppSpec::new("/bin/true"),
            stub_path: String::from("/bin/true"),
            stub_argv: None,
            stub_envp: None,
            numa_node: None,
            data_size: 1,
            heap_size: 1,
            stack_size: 1,
        };

        // The master is not a co-kernel partition.
        assert!(launch_app_with_hio(&registry, master, master, &launch).is_err());
    }
}
