//! VM lifecycle
//!
//! A VM is an enclave hosted inside another enclave. Launching one is the
//! longest composite path in the fabric: registry row, host-memory backing
//! carved out of the block allocator, configuration rewrite with the
//! concrete regions, assignment of the backing to the host's kernel when
//! the host is not the master, and finally the VmLaunch command to the
//! host's init task.

use hobbes_core::{CmdCode, EnclaveId, EnclaveState, EnclaveType, EventMask};

use super::{check_reply, open_enclave_cmdq, remove_memory};
use crate::error::{HobbesError, Result};
use crate::notifier::notify;
use crate::registry::Registry;
use crate::spec::{encode_id, parse_u64, VmSpec, XmlNode};

/// One concrete backing region handed to the VMM.
struct VmRegion {
    host_addr: u64,
    numa_node: Option<u32>,
}

/// Compute and allocate the VM's memory footprint, rewriting the memory
/// subtree with the concrete regions.
///
/// Regions without an explicit `host_addr` come from the free pool; pinned
/// regions go through the explicit-address allocator. Returns the regions
/// and the per-region size in bytes.
fn allocate_vm_memory(
    registry: &Registry,
    enclave: EnclaveId,
    mem: &mut XmlNode,
) -> Result<(Vec<VmRegion>, u64)> {
    let sys_block_size = registry.block_size()?;

    let mem_size = mem
        .val("size")
        .and_then(parse_u64)
        .map(|mib| mib * 1024 * 1024)
        .ok_or_else(|| HobbesError::invalid("bad memory size in VM configuration"))?;
    if mem_size == 0 {
        return Err(HobbesError::invalid("zero memory size in VM configuration"));
    }

    // The VM block size must be at least the system block size.
    let mut block_size = mem
        .val("block_size")
        .and_then(parse_u64)
        .unwrap_or(sys_block_size);
    if block_size < sys_block_size {
        block_size = sys_block_size;
    }
    let span = registry.span_for_bytes(block_size)?;

    let dflt_numa = mem.val("node").and_then(crate::spec::parse_u32);

    let region_cnt = mem_size.div_ceil(block_size);
    let mut regions: Vec<VmRegion> = Vec::with_capacity(region_cnt as usize);

    let result = (|| -> Result<()> {
        let explicit: Vec<XmlNode> = mem.subtrees("region").cloned().collect();

        if explicit.is_empty() {
            let bases = registry.alloc_blocks(enclave, dflt_numa, region_cnt as u32, span)?;
            for host_addr in bases {
                regions.push(VmRegion {
                    host_addr,
                    numa_node: dflt_numa,
                });
            }
            return Ok(());
        }

        for region in &explicit {
            let size = region
                .val("size")
                .and_then(parse_u64)
                .ok_or_else(|| HobbesError::invalid("bad region size in VM configuration"))?;
            if size % block_size != 0 {
                return Err(HobbesError::invalid(
                    "region size is not a multiple of the block size",
                ));
            }
            let numa_node = region
                .val("node")
                .and_then(crate::spec::parse_u32)
                .or(dflt_numa);

            match region.val("host_addr").and_then(parse_u64) {
                Some(mut host_addr) => {
                    // The range was reserved out of band; take it verbatim.
                    registry.alloc_mem_addr(enclave, host_addr, size)?;
                    for _ in 0..size / block_size {
                        regions.push(VmRegion {
                            host_addr,
                            numa_node,
                        });
                        host_addr += block_size;
                    }
                }
                None => {
                    for _ in 0..size / block_size {
                        let host_addr = registry.alloc_blocks(enclave, numa_node, 1, span)?[0];
                        regions.push(VmRegion {
                            host_addr,
                            numa_node,
                        });
                    }
                }
            }
        }
        Ok(())
    })();

    if let Err(e) = result {
        for region in &regions {
            let _ = registry.free_block(region.host_addr, span);
        }
        return Err(e);
    }

    // Rewrite the configuration with the concrete region list.
    mem.remove_subtrees("region");
    mem.set_val("preallocated", "1");
    for region in &regions {
        let node = mem.add_subtree("region");
        node.set_val("host_addr", &format!("{:#x}", region.host_addr));
        node.set_val("size", &block_size.to_string());
        if let Some(numa) = region.numa_node {
            node.set_val("node", &numa.to_string());
        }
    }

    Ok((regions, block_size))
}

/// Create and launch a VM enclave.
///
/// Returns the new enclave id; on any failure the backing memory is
/// released and the enclave row removed before the error is reported.
pub fn create_vm(
    registry: &Registry,
    spec: &mut VmSpec,
    name: Option<&str>,
    host: Option<EnclaveId>,
) -> Result<EnclaveId> {
    // Resolve the host enclave: explicit argument, then the configuration,
    // then the master.
    let host = match host {
        Some(host) => host,
        None => match spec.host_enclave() {
            Some(target) => registry.lookup_enclave(target)?,
            None => EnclaveId::MASTER,
        },
    };
    registry.enclave_info(host)?;

    let vm_name = spec.name().map(str::to_string).or(name.map(str::to_string));
    let enclave_id = registry.create_enclave(vm_name.as_deref(), EnclaveType::Vm, Some(host))?;
    if spec.name().is_none() {
        spec.set_name(&registry.enclave_name(enclave_id)?);
    }
    spec.set_enclave_id(enclave_id);

    let result = (|| -> Result<()> {
        let (regions, region_size) = {
            let mem = spec.memory_mut()?;
            allocate_vm_memory(registry, enclave_id, mem)?
        };

        spec.ensure_hobbes_env(enclave_id);

        // A non-master host runs its own allocator; tell its kernel about
        // every backing range before the VMM maps them.
        if host != EnclaveId::MASTER {
            for region in &regions {
                super::assign_memory(
                    registry,
                    host,
                    region.host_addr,
                    region_size,
                    true,
                    false,
                )?;
            }
        }

        let client = open_enclave_cmdq(registry, host)?;
        let (ret, data) = client.submit(CmdCode::VmLaunch.into(), &spec.to_wire())?;
        check_reply(ret, &data, "vm launch")
    })();

    match result {
        Ok(()) => {
            registry.set_enclave_state(enclave_id, EnclaveState::Running)?;
            notify(registry, EventMask::ENCLAVE);
            Ok(enclave_id)
        }
        Err(e) => {
            // Memory first, row second: a row without backing can always be
            // retried, backing without a row leaks.
            if host != EnclaveId::MASTER {
                let blk_size = registry.block_size().unwrap_or(0);
                for block in registry.enclave_memory_list(enclave_id).unwrap_or_default() {
                    let _ = remove_memory(registry, host, block.base_addr, blk_size, true);
                }
            }
            let _ = registry.free_enclave_blocks(enclave_id);
            let _ = registry.delete_enclave(enclave_id);
            notify(registry, EventMask::ENCLAVE);
            Err(e)
        }
    }
}

/// Tear down a VM enclave through its hosting enclave.
pub fn destroy_vm(registry: &Registry, enclave_id: EnclaveId) -> Result<()> {
    if registry.enclave_type(enclave_id)? != EnclaveType::Vm {
        return Err(HobbesError::invalid(format!(
            "enclave {} is not a VM",
            enclave_id
        )));
    }

    let host = registry.enclave_parent(enclave_id)?.ok_or_else(|| {
        HobbesError::not_found(format!("VM {} has no hosting enclave", enclave_id))
    })?;

    let client = open_enclave_cmdq(registry, host)?;
    let (ret, data) = client.submit(CmdCode::VmDestroy.into(), &encode_id(enclave_id.0))?;

    match check_reply(ret, &data, "vm destroy") {
        Ok(()) => {
            // Free the backing before the row goes away so nothing leaks if
            // either step fails.
            registry.free_enclave_blocks(enclave_id)?;
            registry.delete_enclave(enclave_id)?;
            notify(registry, EventMask::ENCLAVE);
            Ok(())
        }
        Err(e) => {
            registry.set_enclave_state(enclave_id, EnclaveState::Error)?;
            notify(registry, EventMask::ENCLAVE);
            Err(e)
        }
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use hobbes_core::{EnclaveState, EnclaveType};

    use super::*;
    use crate::inittask::testutil::{master_node, shutdown_enclave, spawn_init_task};
    use crate::inittask::{InitTask, VmmControl};

    /// A VMM that records what it was asked to run.
    #[derive(Default)]
    struct FakeVmmState {
        next_id: i32,
        created: Vec<(i32, VmSpec)>,
        running: Vec<i32>,
        fail_launch: bool,
    }

    #[derive(Clone)]
    struct FakeVmm(Arc<Mutex<FakeVmmState>>);

    impl VmmControl for FakeVmm {
        fn create_vm(&mut self, _name: &str, spec: &VmSpec) -> Result<i32> {
            let mut state = self.0.lock().unwrap();
            let id = state.next_id;
            state.next_id += 1;
            state.created.push((id, spec.clone()));
            Ok(id)
        }

        fn launch_vm(&mut self, vm_id: i32) -> Result<()> {
            let mut state = self.0.lock().unwrap();
            if state.fail_launch {
                return Err(HobbesError::child_failure("VMM rejected the image"));
            }
            state.running.push(vm_id);
            Ok(())
        }

        fn stop_vm(&mut self, vm_id: i32) -> Result<()> {
            self.0.lock().unwrap().running.retain(|id| *id != vm_id);
            Ok(())
        }

        fn free_vm(&mut self, _vm_id: i32) -> Result<()> {
            Ok(())
        }
    }

    fn vm_spec_256() -> VmSpec {
        VmSpec::parse("<vm><name>vm0</name><memory><size>256</size></memory><devices/></vm>")
            .unwrap()
    }

    #[test]
    fn launch_on_master_rewrites_regions_and_runs() {
        let (registry, master) = master_node();
        let vmm = FakeVmm(Arc::new(Mutex::new(FakeVmmState::default())));
        let mut task = InitTask::new(registry.clone(), master).unwrap();
        task.set_vmm(Box::new(vmm.clone())).unwrap();
        let handle = spawn_init_task(task);

        let free_before = registry.free_mem_bytes().unwrap();

        let mut spec = vm_spec_256();
        let vm = create_vm(&registry, &mut spec, None, None).unwrap();

        assert_eq!(registry.enclave_state(vm).unwrap(), EnclaveState::Running);
        assert_eq!(registry.enclave_type(vm).unwrap(), EnclaveType::Vm);
        assert_eq!(registry.enclave_parent(vm).unwrap(), Some(master));
        assert_eq!(registry.enclave_dev_id(vm).unwrap(), Some(0));
        assert_eq!(
            registry.free_mem_bytes().unwrap(),
            free_before - 256 * 1024 * 1024
        );

        // The host saw a configuration rewritten with two concrete regions.
        {
            let state = vmm.0.lock().unwrap();
            assert_eq!(state.created.len(), 1);
            let sent = &state.created[0].1;
            assert_eq!(sent.enclave_id().unwrap(), vm);
            let mem = sent.memory().unwrap();
            assert_eq!(mem.val("preallocated"), Some("1"));
            let regions: Vec<_> = mem.subtrees("region").collect();
            assert_eq!(regions.len(), 2);
            for region in regions {
                assert!(parse_u64(region.val("host_addr").unwrap()).is_some());
            }
            assert_eq!(state.running, vec![0]);
        }

        // Destroy: memory returns, the row goes away, the VMM stops it.
        destroy_vm(&registry, vm).unwrap();
        assert_eq!(registry.free_mem_bytes().unwrap(), free_before);
        assert!(registry.enclave_state(vm).is_err());
        assert!(vmm.0.lock().unwrap().running.is_empty());

        shutdown_enclave(&registry, master, handle);
    }

    #[test]
    fn failed_launch_rolls_back_completely() {
        let (registry, master) = master_node();
        let vmm = FakeVmm(Arc::new(Mutex::new(FakeVmmState {
            fail_launch: true,
            ..FakeVmmState::default()
        })));
        let mut task = InitTask::new(registry.clone(), master).unwrap();
        task.set_vmm(Box::new(vmm.clone())).unwrap();
        let handle = spawn_init_task(task);

        let free_before = registry.free_mem_bytes().unwrap();
        let enclaves_before = registry.enclave_count().unwrap();

        let mut spec = vm_spec_256();
        let err = create_vm(&registry, &mut spec, None, None).unwrap_err();
        assert!(err.to_string().contains("rejected"));

        assert_eq!(registry.free_mem_bytes().unwrap(), free_before);
        assert_eq!(registry.enclave_count().unwrap(), enclaves_before);

        shutdown_enclave(&registry, master, handle);
    }

    #[test]
    fn pinned_regions_use_the_explicit_allocator() {
        let (registry, master) = master_node();
        let vmm = FakeVmm(Arc::new(Mutex::new(FakeVmmState::default())));
        let mut task = InitTask::new(registry.clone(), master).unwrap();
        task.set_vmm(Box::new(vmm.clone())).unwrap();
        let handle = spawn_init_task(task);

        let blk = registry.block_size().unwrap();
        let pinned = 3 * blk;
        let mut spec = VmSpec::parse(&format!(
            "<vm><name>vm1</name><memory><size>128</size>\
             <region><host_addr>{:#x}</host_addr><size>{}</size></region>\
             </memory><devices/></vm>",
            pinned, blk
        ))
        .unwrap();

        let vm = create_vm(&registry, &mut spec, None, None).unwrap();
        assert_eq!(registry.mem_info(pinned).unwrap().enclave, Some(vm));

        // The pinned range is gone now; a second VM asking for it must fail
        // and leave no trace.
        let enclaves_before = registry.enclave_count().unwrap();
        let mut again = VmSpec::parse(&format!(
            "<vm><name>vm2</name><memory><size>128</size>\
             <region><host_addr>{:#x}</host_addr><size>{}</size></region>\
             </memory><devices/></vm>",
            pinned, blk
        ))
        .unwrap();
        assert!(create_vm(&registry, &mut again, None, None).is_err());
        assert_eq!(registry.enclave_count().unwrap(), enclaves_before);

        destroy_vm(&registry, vm).unwrap();
        shutdown_enclave(&registry, master, handle);
    }

    #[test]
    fn destroy_refuses_non_vm_enclaves() {
        let (registry, master) = master_node();
        assert!(destroy_vm(&registry, master).is_err());
    }
}
