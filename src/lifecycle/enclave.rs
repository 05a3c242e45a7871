//! Enclave lifecycle
//!
//! Physical enclaves are co-kernel partitions booted onto reserved hardware
//! through the co-kernel loader; VMs are delegated to the VM path. The
//! loader itself is an external collaborator reached through [`PiscesBoot`].

use std::time::Duration;

use hobbes_core::{CmdCode, EnclaveId, EnclaveState, EnclaveType, EventMask};

use super::{open_enclave_cmdq, wait_for_enclave_state};
use crate::error::{HobbesError, Result};
use crate::notifier::notify;
use crate::registry::Registry;
use crate::spec::{parse_u64, XmlNode};

/// How long a freshly booted co-kernel init task gets to report Running.
const PISCES_BOOT_TIMEOUT: Duration = Duration::from_secs(2);

// ————————————————————————— Co-Kernel Boot Surface ————————————————————————— //

/// Resources carved out for a co-kernel partition.
#[derive(Debug, Clone)]
pub struct PiscesResources {
    pub enclave_id: EnclaveId,
    pub boot_cpu: u32,
    /// Base address and size of each memory region.
    pub regions: Vec<(u64, u64)>,
}

/// Boot parameters for a co-kernel partition.
#[derive(Debug, Clone)]
pub struct PiscesConfig {
    pub kernel_path: String,
    pub initrd_path: String,
    pub cmdline: Option<String>,
    pub numa_node: Option<u32>,
    /// Partition memory in MiB.
    pub mem_size_mb: u64,
}

impl PiscesConfig {
    pub fn from_xml(root: &XmlNode) -> Result<PiscesConfig> {
        Ok(PiscesConfig {
            kernel_path: root
                .val("kernel")
                .ok_or_else(|| HobbesError::invalid("missing 'kernel' field"))?
                .to_string(),
            initrd_path: root
                .val("init_task")
                .ok_or_else(|| HobbesError::invalid("missing 'init_task' field"))?
                .to_string(),
            cmdline: root.val("cmd_line").map(str::to_string),
            numa_node: root.val("node").and_then(crate::spec::parse_u32),
            mem_size_mb: root.val("size").and_then(parse_u64).unwrap_or(128),
        })
    }
}

/// The co-kernel loader surface.
///
/// The real loader talks to the partition driver; tests install a fake
/// that flips the enclave row the way a hosted init task would.
pub trait PiscesBoot {
    /// Boot a partition on the given resources; returns the device id the
    /// host OS uses to reach it.
    fn boot(&self, config: &PiscesConfig, resources: &PiscesResources) -> Result<i32>;

    /// Force a partition down after a failed or finished run.
    fn teardown(&self, dev_id: i32) -> Result<()>;
}

// ———————————————————————————— Enclave Creation ———————————————————————————— //

/// Create an enclave from a configuration tree (root tag `enclave`).
///
/// Dispatches on the `type` field: co-kernel partitions boot through the
/// loader, VM configurations are delegated to the VM launch path.
pub fn create_enclave(
    registry: &Registry,
    boot: &dyn PiscesBoot,
    config: &XmlNode,
    name: Option<&str>,
) -> Result<EnclaveId> {
    if config.tag != "enclave" {
        return Err(HobbesError::invalid("not an enclave configuration"));
    }

    match config.val("type") {
        Some("pisces") => create_pisces_enclave(registry, boot, config, name),
        Some("vm") => {
            let vm_node = config
                .subtree("vm")
                .ok_or_else(|| HobbesError::invalid("missing 'vm' configuration block"))?;
            let mut spec = crate::spec::VmSpec::from_node(vm_node.clone())?;
            super::create_vm(registry, &mut spec, name, None)
        }
        Some(other) => Err(HobbesError::invalid(format!(
            "unknown enclave type '{}'",
            other
        ))),
        None => Err(HobbesError::invalid("enclave type not specified")),
    }
}

/// Boot a co-kernel partition: allocate its CPU and memory, create the row,
/// hand everything to the loader, then wait for the hosted init task to
/// report Running.
fn create_pisces_enclave(
    registry: &Registry,
    boot: &dyn PiscesBoot,
    config: &XmlNode,
    name: Option<&str>,
) -> Result<EnclaveId> {
    let pisces = PiscesConfig::from_xml(config)?;

    let enclave_id =
        registry.create_enclave(name, EnclaveType::Pisces, Some(EnclaveId::MASTER))?;

    let result = (|| -> Result<EnclaveId> {
        let boot_cpu = registry.alloc_cpu(None, pisces.numa_node, enclave_id)?;
        registry.set_cpu_logical_id(boot_cpu, 0)?;

        let bytes = pisces.mem_size_mb * 1024 * 1024;
        let base = registry.alloc_mem(enclave_id, pisces.numa_node, bytes)?;
        let span = registry.span_for_bytes(bytes)?;
        let block_size = registry.block_size()?;

        let resources = PiscesResources {
            enclave_id,
            boot_cpu,
            regions: vec![(base, span as u64 * block_size)],
        };

        let dev_id = boot.boot(&pisces, &resources)?;
        registry.set_enclave_dev_id(enclave_id, dev_id)?;

        // The hosted init task flips the row once its command queue is up.
        if let Err(e) =
            wait_for_enclave_state(registry, enclave_id, EnclaveState::Running, PISCES_BOOT_TIMEOUT)
        {
            let _ = boot.teardown(dev_id);
            return Err(e);
        }

        Ok(enclave_id)
    })();

    match result {
        Ok(id) => {
            notify(registry, EventMask::ENCLAVE);
            Ok(id)
        }
        Err(e) => {
            registry.free_enclave_cpus(enclave_id)?;
            registry.free_enclave_blocks(enclave_id)?;
            registry.delete_enclave(enclave_id)?;
            notify(registry, EventMask::ENCLAVE);
            Err(e)
        }
    }
}

// ———————————————————————————— Enclave Teardown ———————————————————————————— //

/// Tear down an enclave, releasing everything it owns.
pub fn destroy_enclave(registry: &Registry, enclave_id: EnclaveId) -> Result<()> {
    match registry.enclave_type(enclave_id)? {
        EnclaveType::Vm => super::destroy_vm(registry, enclave_id),
        EnclaveType::Pisces => destroy_pisces_enclave(registry, enclave_id),
        EnclaveType::Master => Err(HobbesError::invalid("cannot destroy the master enclave")),
        EnclaveType::Invalid => Err(HobbesError::invalid(format!(
            "enclave {} has no valid type",
            enclave_id
        ))),
    }
}

fn destroy_pisces_enclave(registry: &Registry, enclave_id: EnclaveId) -> Result<()> {
    // An orderly shutdown request; a dead init task cannot answer, in which
    // case its resources are reclaimed regardless.
    match open_enclave_cmdq(registry, enclave_id) {
        Ok(client) => match client.submit(CmdCode::Shutdown.into(), &[]) {
            Ok((0, _)) => {
                let _ = wait_for_enclave_state(
                    registry,
                    enclave_id,
                    EnclaveState::Stopped,
                    PISCES_BOOT_TIMEOUT,
                );
            }
            Ok((ret, _)) => {
                log::warn!("Enclave {} refused shutdown (ret={})", enclave_id, ret);
            }
            Err(e) => log::warn!("Shutdown of enclave {} failed: {}", enclave_id, e),
        },
        Err(e) => log::warn!("Enclave {} is unreachable: {}", enclave_id, e),
    }

    registry.free_enclave_cpus(enclave_id)?;
    registry.free_enclave_blocks(enclave_id)?;
    registry.delete_enclave_segments(enclave_id)?;
    registry.delete_enclave(enclave_id)?;
    notify(registry, EventMask::ENCLAVE);
    Ok(())
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Mutex;

    use hobbes_core::{EnclaveState, EnclaveType, ResourceState, DEFAULT_BLOCK_SIZE};

    use super::*;
    use crate::registry::testutil::fresh_registry;
    use crate::registry::Registry;

    /// A loader that flips the row to Running, the way a hosted init task
    /// would after bringing up its command queue.
    struct FakeBoot {
        registry: Registry,
        next_dev: AtomicI32,
        booted: Mutex<Vec<i32>>,
        fail: bool,
    }

    impl PiscesBoot for FakeBoot {
        fn boot(&self, _config: &PiscesConfig, resources: &PiscesResources) -> Result<i32> {
            if self.fail {
                return Err(HobbesError::child_failure("loader rejected the image"));
            }
            let dev = self.next_dev.fetch_add(1, Ordering::SeqCst);
            self.booted.lock().unwrap().push(dev);
            self.registry
                .set_enclave_state(resources.enclave_id, EnclaveState::Running)?;
            Ok(dev)
        }

        fn teardown(&self, dev_id: i32) -> Result<()> {
            self.booted.lock().unwrap().retain(|d| *d != dev_id);
            Ok(())
        }
    }

    fn boot_node() -> Registry {
        let registry = fresh_registry();
        registry.init_system_info(1, DEFAULT_BLOCK_SIZE).unwrap();
        registry
            .create_enclave(Some("master"), EnclaveType::Master, None)
            .unwrap();
        for cpu in 0..4u32 {
            registry
                .register_cpu(cpu, cpu, 0, ResourceState::Free)
                .unwrap();
        }
        for i in 0..8u64 {
            registry
                .register_memory(i * DEFAULT_BLOCK_SIZE, DEFAULT_BLOCK_SIZE, 0, ResourceState::Free)
                .unwrap();
        }
        registry
    }

    fn pisces_config() -> XmlNode {
        XmlNode::parse(
            "<enclave><type>pisces</type><kernel>/opt/kitten/vmlwk</kernel>\
             <init_task>/opt/kitten/init</init_task><size>256</size></enclave>",
        )
        .unwrap()
    }

    #[test]
    fn pisces_create_allocates_and_reports_running() {
        let registry = boot_node();
        let boot = FakeBoot {
            registry: registry.clone(),
            next_dev: AtomicI32::new(0),
            booted: Mutex::new(Vec::new()),
            fail: false,
        };

        let free_before = registry.free_mem_bytes().unwrap();
        let id = create_enclave(&registry, &boot, &pisces_config(), Some("p1")).unwrap();

        assert_eq!(registry.enclave_state(id).unwrap(), EnclaveState::Running);
        assert_eq!(registry.enclave_type(id).unwrap(), EnclaveType::Pisces);
        assert_eq!(registry.enclave_dev_id(id).unwrap(), Some(0));
        assert_eq!(
            registry.free_mem_bytes().unwrap(),
            free_before - 256 * 1024 * 1024
        );
        assert_eq!(registry.free_cpu_count().unwrap(), 3);
    }

    #[test]
    fn failed_boot_rolls_everything_back() {
        let registry = boot_node();
        let boot = FakeBoot {
            registry: registry.clone(),
            next_dev: AtomicI32::new(0),
            booted: Mutex::new(Vec::new()),
            fail: true,
        };

        let enclaves_before = registry.enclave_count().unwrap();
        let free_before = registry.free_mem_bytes().unwrap();

        assert!(create_enclave(&registry, &boot, &pisces_config(), Some("p1")).is_err());

        assert_eq!(registry.enclave_count().unwrap(), enclaves_before);
        assert_eq!(registry.free_mem_bytes().unwrap(), free_before);
        assert_eq!(registry.free_cpu_count().unwrap(), 4);
    }

    #[test]
    fn unknown_types_are_rejected() {
        let registry = boot_node();
        let boot = FakeBoot {
            registry: registry.clone(),
            next_dev: AtomicI32::new(0),
            booted: Mutex::new(Vec::new()),
            fail: false,
        };

        let config = XmlNode::parse("<enclave><type>exotic</type></enclave>").unwrap();
        assert!(create_enclave(&registry, &boot, &config, None).is_err());

        let config = XmlNode::parse("<enclave><kernel>/k</kernel></enclave>").unwrap();
        assert!(create_enclave(&registry, &boot, &config, None).is_err());
    }
}
