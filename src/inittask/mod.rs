//! Per-enclave init task
//!
//! Every enclave runs exactly one init task: a single-threaded cooperative
//! event loop multiplexing the command queue fd and the stdout pipes of the
//! processes it hosts. Handlers never run concurrently; the shared state
//! they mutate is the registry, which serializes through its own lock.

mod apps;
mod ctrl;
mod files;

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use hobbes_core::{AppId, EnclaveId, EnclaveState, EventMask};
use nix::poll::{poll, PollFd, PollFlags};

use crate::cmdq::{CmdId, CmdServer};
use crate::error::{HobbesError, Result};
use crate::notifier::notify;
use crate::registry::Registry;
use crate::spec::VmSpec;

// —————————————————————————— Collaborator Surfaces ————————————————————————— //

/// The hosting kernel's resource plumbing: onlining and pinning the CPUs
/// and memory blocks other enclaves hand over.
pub trait HostControl: Send {
    fn online_cpu(&mut self, cpu_id: u32) -> Result<()>;
    fn offline_cpu(&mut self, cpu_id: u32) -> Result<()>;
    fn lock_cpu(&mut self, cpu_id: u32) -> Result<()>;
    fn unlock_cpu(&mut self, cpu_id: u32) -> Result<()>;

    fn online_block(&mut self, base_addr: u64) -> Result<()>;
    fn offline_block(&mut self, base_addr: u64) -> Result<()>;
    fn lock_block(&mut self, base_addr: u64) -> Result<()>;
    fn unlock_block(&mut self, base_addr: u64) -> Result<()>;
}

/// A host without hotplug plumbing; every operation is accepted as already
/// done.
pub struct NullHostControl;

impl HostControl for NullHostControl {
    fn online_cpu(&mut self, cpu_id: u32) -> Result<()> {
        log::debug!("online cpu {}", cpu_id);
        Ok(())
    }
    fn offline_cpu(&mut self, cpu_id: u32) -> Result<()> {
        log::debug!("offline cpu {}", cpu_id);
        Ok(())
    }
    fn lock_cpu(&mut self, cpu_id: u32) -> Result<()> {
        log::debug!("lock cpu {}", cpu_id);
        Ok(())
    }
    fn unlock_cpu(&mut self, cpu_id: u32) -> Result<()> {
        log::debug!("unlock cpu {}", cpu_id);
        Ok(())
    }
    fn online_block(&mut self, base_addr: u64) -> Result<()> {
        log::debug!("online block {:#x}", base_addr);
        Ok(())
    }
    fn offline_block(&mut self, base_addr: u64) -> Result<()> {
        log::debug!("offline block {:#x}", base_addr);
        Ok(())
    }
    fn lock_block(&mut self, base_addr: u64) -> Result<()> {
        log::debug!("lock block {:#x}", base_addr);
        Ok(())
    }
    fn unlock_block(&mut self, base_addr: u64) -> Result<()> {
        log::debug!("unlock block {:#x}", base_addr);
        Ok(())
    }
}

/// The hosting VMM's control surface. Present only on enclaves that can
/// host VMs; the VM command handlers are registered when one is installed.
pub trait VmmControl: Send {
    /// Build and create a VM instance; returns the host-local instance id.
    fn create_vm(&mut self, name: &str, spec: &VmSpec) -> Result<i32>;
    fn launch_vm(&mut self, vm_id: i32) -> Result<()>;
    fn stop_vm(&mut self, vm_id: i32) -> Result<()>;
    fn free_vm(&mut self, vm_id: i32) -> Result<()>;

    /// A CPU handed to this enclave also becomes schedulable for guests.
    fn add_cpu(&mut self, cpu_id: u32) -> Result<()> {
        let _ = cpu_id;
        Ok(())
    }
    fn remove_cpu(&mut self, cpu_id: u32) -> Result<()> {
        let _ = cpu_id;
        Ok(())
    }
}

// ————————————————————————————— Command Dispatch ——————————————————————————— //

/// A command taken off the queue, with its payload copied out.
pub struct CmdRequest {
    pub id: CmdId,
    pub code: u64,
    pub data: Vec<u8>,
}

/// Command handlers return the reply payload; errors become a non-zero
/// status with the error string in the reply.
pub type CmdHandler = fn(&mut InitTask, &CmdRequest) -> Result<Vec<u8>>;

#[derive(Debug, Clone, Copy)]
enum FdSource {
    CmdQueue,
    AppStdout(AppId),
}

// ——————————————————————————————— Init Task ———————————————————————————————— //

pub struct InitTask {
    registry: Registry,
    enclave_id: EnclaveId,
    server: CmdServer,
    handlers: HashMap<u64, CmdHandler>,
    fd_sources: HashMap<RawFd, FdSource>,
    apps: apps::AppTable,
    files: files::FileTable,
    host: Box<dyn HostControl>,
    vmm: Option<Box<dyn VmmControl>>,
    exit_requested: bool,
}

impl InitTask {
    /// Bring up this enclave's control plane: create the command queue,
    /// advertise it in the registry, install the default handlers, and
    /// report the enclave Running.
    pub fn new(registry: Registry, enclave_id: EnclaveId) -> Result<InitTask> {
        let server = CmdServer::create()?;

        let name = registry.enclave_name(enclave_id)?;
        registry.create_segment(
            server.segid(),
            Some(&format!("{}-cmdq", name)),
            Some(enclave_id),
            None,
        )?;
        registry.set_enclave_cmdq(enclave_id, Some(server.segid()))?;

        let mut task = InitTask {
            registry,
            enclave_id,
            server,
            handlers: HashMap::new(),
            fd_sources: HashMap::new(),
            apps: apps::AppTable::default(),
            files: files::FileTable::default(),
            host: Box::new(NullHostControl),
            vmm: None,
            exit_requested: false,
        };
        task.fd_sources.insert(task.server.fd(), FdSource::CmdQueue);
        ctrl::register_default_cmds(&mut task)?;

        task.registry
            .set_enclave_state(enclave_id, EnclaveState::Running)?;
        notify(&task.registry, EventMask::ENCLAVE);

        log::info!("Enclave {} ({}) control plane is up", enclave_id, name);
        Ok(task)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn enclave_id(&self) -> EnclaveId {
        self.enclave_id
    }

    pub fn set_host_control(&mut self, host: Box<dyn HostControl>) {
        self.host = host;
    }

    /// Install a VMM and expose the VM lifecycle commands.
    pub fn set_vmm(&mut self, vmm: Box<dyn VmmControl>) -> Result<()> {
        self.vmm = Some(vmm);
        ctrl::register_vm_cmds(self)
    }

    /// Install a handler for a command code.
    pub fn register_cmd(&mut self, code: u64, handler: CmdHandler) -> Result<()> {
        if self.handlers.contains_key(&code) {
            return Err(HobbesError::already_exists(format!(
                "handler for command {}",
                code
            )));
        }
        self.handlers.insert(code, handler);
        Ok(())
    }

    /// Run the event loop until a Shutdown command arrives.
    pub fn run(&mut self) -> Result<()> {
        log::info!("Enclave {} entering command loop", self.enclave_id);

        while !self.exit_requested {
            let fds: Vec<RawFd> = self.fd_sources.keys().copied().collect();
            let mut pollfds: Vec<PollFd> = fds
                .iter()
                .map(|fd| PollFd::new(*fd, PollFlags::POLLIN))
                .collect();

            match poll(&mut pollfds, -1) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    return Err(HobbesError::transport(format!("poll failed: {}", e)));
                }
            }

            let ready = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
            let woken: Vec<RawFd> = pollfds
                .iter()
                .zip(&fds)
                .filter(|(pollfd, _)| {
                    pollfd.revents().is_some_and(|r| r.intersects(ready))
                })
                .map(|(_, fd)| *fd)
                .collect();

            for fd in woken {
                // A handler earlier in this round may have dropped the fd.
                match self.fd_sources.get(&fd).copied() {
                    Some(FdSource::CmdQueue) => self.handle_cmds()?,
                    Some(FdSource::AppStdout(app_id)) => self.handle_app_stdout(app_id, fd)?,
                    None => {}
                }
            }
        }

        log::info!("Enclave {} shutting down", self.enclave_id);
        self.registry.set_enclave_cmdq(self.enclave_id, None)?;
        self.registry
            .set_enclave_state(self.enclave_id, EnclaveState::Stopped)?;
        notify(&self.registry, EventMask::ENCLAVE);
        Ok(())
    }

    /// Drain the command queue, dispatching each command to its handler.
    fn handle_cmds(&mut self) -> Result<()> {
        loop {
            let cmd = match self.server.get_next_cmd()? {
                Some(cmd) => cmd,
                None => return Ok(()),
            };

            let (code, data) = match (self.server.cmd_code(cmd), self.server.cmd_data(cmd)) {
                (Ok(code), Ok(data)) => (code, data),
                _ => {
                    log::error!("Command {} vanished before dispatch", cmd);
                    continue;
                }
            };

            let req = CmdRequest {
                id: cmd,
                code,
                data,
            };

            match self.handlers.get(&code).copied() {
                Some(handler) => match handler(self, &req) {
                    Ok(payload) => self.server.cmd_return(cmd, 0, &payload)?,
                    Err(e) => {
                        log::error!("Command {} (code {}) failed: {}", cmd, code, e);
                        let mut msg = e.to_string().into_bytes();
                        msg.push(0);
                        self.server.cmd_return(cmd, -1, &msg)?;
                    }
                },
                None => {
                    log::error!("Received unregistered command code {}", code);
                    self.server.cmd_return(cmd, -1, b"unknown command\0")?;
                }
            }
        }
    }

    fn request_exit(&mut self) {
        self.exit_requested = true;
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
pub(crate) mod testutil {
    use std::thread;
    use std::time::{Duration, Instant};

    use hobbes_core::{AppState, CmdCode, EnclaveId, EnclaveType, ResourceState,
                      DEFAULT_BLOCK_SIZE};

    use super::InitTask;
    use crate::error::Result;
    use crate::lifecycle::open_enclave_cmdq;
    use crate::registry::testutil::fresh_registry;
    use crate::registry::Registry;

    /// A registry populated like a small master boot: one NUMA node, four
    /// CPUs, eight blocks, master enclave created.
    pub(crate) fn master_node() -> (Registry, EnclaveId) {
        let registry = fresh_registry();
        registry.init_system_info(1, DEFAULT_BLOCK_SIZE).unwrap();
        let master = registry
            .create_enclave(Some("master"), EnclaveType::Master, None)
            .unwrap();
        for cpu in 0..4u32 {
            registry
                .register_cpu(cpu, cpu, 0, ResourceState::Free)
                .unwrap();
        }
        for i in 0..8u64 {
            registry
                .register_memory(
                    i * DEFAULT_BLOCK_SIZE,
                    DEFAULT_BLOCK_SIZE,
                    0,
                    ResourceState::Free,
                )
                .unwrap();
        }
        (registry, master)
    }

    /// Run an init task on its own thread until it is shut down.
    pub(crate) fn spawn_init_task(mut task: InitTask) -> thread::JoinHandle<Result<()>> {
        thread::spawn(move || task.run())
    }

    /// Ask an enclave's init task to exit and join it.
    pub(crate) fn shutdown_enclave(
        registry: &Registry,
        enclave: EnclaveId,
        handle: thread::JoinHandle<Result<()>>,
    ) {
        let client = open_enclave_cmdq(registry, enclave).unwrap();
        let (ret, _) = client.submit(CmdCode::Shutdown.into(), &[]).unwrap();
        assert_eq!(ret, 0);
        handle.join().unwrap().unwrap();
    }

    /// Poll until an app reaches the wanted state.
    pub(crate) fn wait_for_app_state(
        registry: &Registry,
        app: hobbes_core::AppId,
        wanted: AppState,
    ) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if registry.app_state(app).unwrap() == wanted {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "app {} never reached {:?}",
                app,
                wanted
            );
            thread::sleep(Duration::from_millis(20));
        }
    }
}
