//! Node description
//!
//! The master init task boots the registry from a declarative node map
//! rather than probing the hardware itself; probing belongs to the platform
//! layer that writes this file.
//!
//! ```toml
//! [system]
//! numa_nodes = 2
//! block_size = 134217728
//!
//! [[cpu]]
//! id = 0
//! apic_id = 0
//! numa = 0
//!
//! [[memory]]
//! base_addr = 0x100000000
//! blocks = 8
//! numa = 0
//! ```

use std::path::Path;

use hobbes_core::ResourceState;
use serde::Deserialize;

use crate::error::{HobbesError, Result};
use crate::registry::Registry;

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub system: System,
    #[serde(default, rename = "cpu")]
    pub cpus: Vec<Cpu>,
    #[serde(default, rename = "memory")]
    pub memory: Vec<MemoryRange>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct System {
    pub numa_nodes: u32,
    pub block_size: u64,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct Cpu {
    pub id: u32,
    #[serde(default)]
    pub apic_id: Option<u32>,
    pub numa: u32,
    /// Reserved CPUs stay with the host OS and are never allocatable.
    #[serde(default)]
    pub reserved: bool,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct MemoryRange {
    pub base_addr: u64,
    /// Number of consecutive blocks starting at `base_addr`.
    pub blocks: u64,
    pub numa: u32,
    #[serde(default)]
    pub reserved: bool,
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<NodeConfig> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            HobbesError::invalid(format!("cannot read {}: {}", path.display(), e))
        })?;
        toml::from_str(&text)
            .map_err(|e| HobbesError::invalid(format!("bad node config: {}", e)))
    }

    /// Populate a freshly created registry with this node's resources.
    pub fn populate(&self, registry: &Registry) -> Result<()> {
        registry.init_system_info(self.system.numa_nodes, self.system.block_size)?;

        for cpu in &self.cpus {
            let state = if cpu.reserved {
                ResourceState::Reserved
            } else {
                ResourceState::Free
            };
            registry.register_cpu(cpu.id, cpu.apic_id.unwrap_or(cpu.id), cpu.numa, state)?;
        }

        for range in &self.memory {
            let state = if range.reserved {
                ResourceState::Reserved
            } else {
                ResourceState::Free
            };
            for i in 0..range.blocks {
                registry.register_memory(
                    range.base_addr + i * self.system.block_size,
                    self.system.block_size,
                    range.numa,
                    state,
                )?;
            }
        }

        Ok(())
    }

    /// A small synthetic node, used by the demo and for bring-up without a
    /// platform-generated map.
    pub fn synthetic(numa_nodes: u32, cpus_per_node: u32, blocks_per_node: u64) -> NodeConfig {
        let block_size = hobbes_core::DEFAULT_BLOCK_SIZE;
        let mut cpus = Vec::new();
        let mut memory = Vec::new();
        for node in 0..numa_nodes {
            for i in 0..cpus_per_node {
                cpus.push(Cpu {
                    id: node * cpus_per_node + i,
                    apic_id: None,
                    numa: node,
                    reserved: false,
                });
            }
            memory.push(MemoryRange {
                base_addr: node as u64 * blocks_per_node * block_size,
                blocks: blocks_per_node,
                numa: node,
                reserved: false,
            });
        }
        NodeConfig {
            system: System {
                numa_nodes,
                block_size,
            },
            cpus,
            memory,
        }
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
