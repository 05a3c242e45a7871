//! Default command handlers
//!
//! The handler set every init task installs at startup, plus the VM
//! handlers installed alongside a VMM. Handlers parse the payload, drive
//! the registry and the collaborator surfaces, and hand back the reply
//! payload; the dispatcher turns errors into non-zero replies carrying the
//! error string.

use hobbes_core::{AppId, CmdCode, EnclaveId, EnclaveState, EnclaveType};

use super::{CmdRequest, InitTask};
use crate::error::{HobbesError, Result};
use crate::spec::{decode_id, AppSpec, CpuAssignSpec, MemAssignSpec, VmSpec};

pub(crate) fn register_default_cmds(task: &mut InitTask) -> Result<()> {
    task.register_cmd(CmdCode::Ping.into(), ping_cmd)?;
    task.register_cmd(CmdCode::AppLaunch.into(), app_launch_cmd)?;
    task.register_cmd(CmdCode::AppKill.into(), app_kill_cmd)?;
    task.register_cmd(CmdCode::AddCpu.into(), add_cpu_cmd)?;
    task.register_cmd(CmdCode::RemoveCpu.into(), remove_cpu_cmd)?;
    task.register_cmd(CmdCode::AddMem.into(), add_mem_cmd)?;
    task.register_cmd(CmdCode::RemoveMem.into(), remove_mem_cmd)?;
    task.register_cmd(CmdCode::LoadFile.into(), load_file_cmd)?;
    task.register_cmd(CmdCode::Shutdown.into(), shutdown_cmd)?;
    super::files::register_file_cmds(task)?;
    Ok(())
}

pub(crate) fn register_vm_cmds(task: &mut InitTask) -> Result<()> {
    task.register_cmd(CmdCode::VmLaunch.into(), vm_launch_cmd)?;
    task.register_cmd(CmdCode::VmDestroy.into(), vm_destroy_cmd)?;
    Ok(())
}

// ——————————————————————————————— Basic Cmds ——————————————————————————————— //

fn ping_cmd(_task: &mut InitTask, req: &CmdRequest) -> Result<Vec<u8>> {
    Ok(req.data.clone())
}

fn shutdown_cmd(task: &mut InitTask, _req: &CmdRequest) -> Result<Vec<u8>> {
    task.request_exit();
    Ok(Vec::new())
}

// —————————————————————————————— Applications —————————————————————————————— //

fn app_launch_cmd(task: &mut InitTask, req: &CmdRequest) -> Result<Vec<u8>> {
    let spec = AppSpec::from_wire(&req.data)?;
    task.launch_local_app(&spec)?;
    Ok(Vec::new())
}

fn app_kill_cmd(task: &mut InitTask, req: &CmdRequest) -> Result<Vec<u8>> {
    let app_id = AppId(decode_id(&req.data)?);
    task.kill_local_app(app_id)?;
    Ok(Vec::new())
}

// ————————————————————————— Resource Assignments ——————————————————————————— //

fn add_cpu_cmd(task: &mut InitTask, req: &CmdRequest) -> Result<Vec<u8>> {
    let spec = CpuAssignSpec::from_wire(&req.data)?;

    task.host.online_cpu(spec.phys_cpu_id)?;
    if let Err(e) = task.host.lock_cpu(spec.phys_cpu_id) {
        let _ = task.host.offline_cpu(spec.phys_cpu_id);
        return Err(e);
    }

    if let Some(vmm) = &mut task.vmm {
        if let Err(e) = vmm.add_cpu(spec.phys_cpu_id) {
            let _ = task.host.unlock_cpu(spec.phys_cpu_id);
            let _ = task.host.offline_cpu(spec.phys_cpu_id);
            return Err(e);
        }
    }
    Ok(Vec::new())
}

fn remove_cpu_cmd(task: &mut InitTask, req: &CmdRequest) -> Result<Vec<u8>> {
    let spec = CpuAssignSpec::from_wire(&req.data)?;

    if let Some(vmm) = &mut task.vmm {
        vmm.remove_cpu(spec.phys_cpu_id)?;
    }
    task.host.unlock_cpu(spec.phys_cpu_id)?;
    task.host.offline_cpu(spec.phys_cpu_id)?;
    Ok(Vec::new())
}

fn add_mem_cmd(task: &mut InitTask, req: &CmdRequest) -> Result<Vec<u8>> {
    let spec = MemAssignSpec::from_wire(&req.data)?;
    let blk_size = task.registry.block_size()?;

    let mut addr = spec.base_addr;
    let mut left = spec.size;
    while left > 0 {
        task.host.online_block(addr)?;
        if let Err(e) = task.host.lock_block(addr) {
            let _ = task.host.offline_block(addr);
            return Err(e);
        }
        addr += blk_size;
        left = left.saturating_sub(blk_size);
    }
    Ok(Vec::new())
}

fn remove_mem_cmd(task: &mut InitTask, req: &CmdRequest) -> Result<Vec<u8>> {
    let spec = MemAssignSpec::from_wire(&req.data)?;
    let blk_size = task.registry.block_size()?;

    let mut addr = spec.base_addr;
    let mut left = spec.size;
    while left > 0 {
        task.host.unlock_block(addr)?;
        task.host.offline_block(addr)?;
        addr += blk_size;
        left = left.saturating_sub(blk_size);
    }
    Ok(Vec::new())
}

// ————————————————————————————————— Files —————————————————————————————————— //

/// Upper bound on a whole-file transfer reply.
const LOAD_FILE_MAX: u64 = 8 * 1024 * 1024;

fn load_file_cmd(_task: &mut InitTask, req: &CmdRequest) -> Result<Vec<u8>> {
    let path = match req.data.split_last() {
        Some((0, body)) => std::str::from_utf8(body)
            .map_err(|_| HobbesError::invalid("path is not UTF-8"))?,
        _ => return Err(HobbesError::invalid("path is not NUL-terminated")),
    };

    let meta = std::fs::metadata(path)
        .map_err(|e| HobbesError::not_found(format!("{}: {}", path, e)))?;
    if meta.len() > LOAD_FILE_MAX {
        return Err(HobbesError::invalid(format!(
            "{} is larger than the {} byte transfer limit",
            path, LOAD_FILE_MAX
        )));
    }

    std::fs::read(path).map_err(|e| HobbesError::not_found(format!("{}: {}", path, e)))
}

// ————————————————————————————————— VMs ———————————————————————————————————— //

fn vm_launch_cmd(task: &mut InitTask, req: &CmdRequest) -> Result<Vec<u8>> {
    let spec = VmSpec::from_wire(&req.data)?;

    let name = spec
        .name()
        .ok_or_else(|| HobbesError::invalid("VM spec is missing the 'name' field"))?
        .to_string();
    let enclave_id = spec.enclave_id()?;

    let vmm = task
        .vmm
        .as_mut()
        .ok_or_else(|| HobbesError::invalid("no VMM present in this enclave"))?;

    log::info!("Creating VM {} (enclave {})", name, enclave_id);
    let vm_id = vmm.create_vm(&name, &spec)?;
    task.registry.set_enclave_dev_id(enclave_id, vm_id)?;

    log::info!("Launching VM {} (instance {})", name, vm_id);
    if let Err(e) = task.vmm.as_mut().unwrap().launch_vm(vm_id) {
        task.registry
            .set_enclave_state(enclave_id, EnclaveState::Crashed)?;
        return Err(e);
    }
    Ok(Vec::new())
}

fn vm_destroy_cmd(task: &mut InitTask, req: &CmdRequest) -> Result<Vec<u8>> {
    let enclave_id = EnclaveId(decode_id(&req.data)?);

    // The coordinator asked us, but trust the registry over the request.
    if task.registry.enclave_type(enclave_id)? != EnclaveType::Vm {
        return Err(HobbesError::invalid(format!(
            "enclave {} is not a VM",
            enclave_id
        )));
    }
    if task.registry.enclave_parent(enclave_id)? != Some(task.enclave_id) {
        return Err(HobbesError::invalid(format!(
            "VM {} is not hosted by this enclave",
            enclave_id
        )));
    }

    let vm_id = task
        .registry
        .enclave_dev_id(enclave_id)?
        .ok_or_else(|| HobbesError::not_found(format!("VM instance for {}", enclave_id)))?;

    let vmm = task
        .vmm
        .as_mut()
        .ok_or_else(|| HobbesError::invalid("no VMM present in this enclave"))?;

    if let Err(e) = vmm.stop_vm(vm_id) {
        task.registry
            .set_enclave_state(enclave_id, EnclaveState::Error)?;
        return Err(e);
    }
    if let Err(e) = task.vmm.as_mut().unwrap().free_vm(vm_id) {
        task.registry
            .set_enclave_state(enclave_id, EnclaveState::Error)?;
        return Err(e);
    }
    Ok(Vec::new())
}
