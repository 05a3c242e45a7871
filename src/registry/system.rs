//! System header and CPU rows

use hobbes_core::{EnclaveId, ResourceState};

use super::{MasterDb, Registry};
use crate::error::{HobbesError, Result};

pub(crate) struct SystemHeader {
    pub(crate) numa_cnt: u32,
    pub(crate) blk_size: u64,
}

pub(crate) struct CpuRow {
    pub(crate) cpu_id: u32,
    pub(crate) apic_id: u32,
    pub(crate) numa_node: u32,
    pub(crate) state: ResourceState,
    /// Valid iff state is Allocated.
    pub(crate) enclave: Option<EnclaveId>,
    /// Enclave-local logical id, assigned by the owning enclave's init task.
    pub(crate) logical_id: Option<u32>,
}

/// Snapshot of the system header.
#[derive(Debug, Clone, Copy)]
pub struct SystemInfo {
    pub numa_cnt: u32,
    pub blk_size: u64,
    pub cpu_cnt: u32,
    pub blk_cnt: u64,
    pub free_blk_cnt: u64,
}

/// Snapshot of a CPU row.
#[derive(Debug, Clone, Copy)]
pub struct CpuInfo {
    pub cpu_id: u32,
    pub apic_id: u32,
    pub numa_node: u32,
    pub state: ResourceState,
    pub enclave: Option<EnclaveId>,
    pub logical_id: Option<u32>,
}

impl From<&CpuRow> for CpuInfo {
    fn from(row: &CpuRow) -> Self {
        CpuInfo {
            cpu_id: row.cpu_id,
            apic_id: row.apic_id,
            numa_node: row.numa_node,
            state: row.state,
            enclave: row.enclave,
            logical_id: row.logical_id,
        }
    }
}

pub(crate) fn system_header(db: &MasterDb) -> Result<&SystemHeader> {
    db.system
        .as_ref()
        .ok_or_else(|| HobbesError::invalid("system info is not initialized"))
}

impl Registry {
    /// Initialize the system header. Master boot does this exactly once,
    /// before any resource registration.
    pub fn init_system_info(&self, numa_cnt: u32, blk_size: u64) -> Result<()> {
        if numa_cnt == 0 {
            return Err(HobbesError::invalid("NUMA node count must be non-zero"));
        }
        if blk_size == 0 {
            return Err(HobbesError::invalid("memory block size must be non-zero"));
        }

        let mut db = self.write()?;
        if db.system.is_some() {
            return Err(HobbesError::already_exists("system info header"));
        }
        db.system = Some(SystemHeader { numa_cnt, blk_size });
        Ok(())
    }

    pub fn system_info(&self) -> Result<SystemInfo> {
        let db = self.read()?;
        let hdr = system_header(&db)?;
        Ok(SystemInfo {
            numa_cnt: hdr.numa_cnt,
            blk_size: hdr.blk_size,
            cpu_cnt: db.cpus.len() as u32,
            blk_cnt: db.blocks.len() as u64,
            free_blk_cnt: db.free_blocks.len() as u64,
        })
    }

    pub fn numa_cnt(&self) -> Result<u32> {
        let db = self.read()?;
        Ok(system_header(&db)?.numa_cnt)
    }

    pub fn block_size(&self) -> Result<u64> {
        let db = self.read()?;
        Ok(system_header(&db)?.blk_size)
    }

    // —————————————————————————————— CPU Rows —————————————————————————————— //

    /// Register a CPU row. State must be Free or Reserved; allocation goes
    /// through the allocator so ownership accounting stays consistent.
    pub fn register_cpu(
        &self,
        cpu_id: u32,
        apic_id: u32,
        numa_node: u32,
        state: ResourceState,
    ) -> Result<()> {
        if !matches!(state, ResourceState::Free | ResourceState::Reserved) {
            return Err(HobbesError::invalid(format!(
                "cannot register CPU {} in state {}",
                cpu_id, state
            )));
        }

        let mut db = self.write()?;
        let hdr = system_header(&db)?;
        if numa_node >= hdr.numa_cnt {
            return Err(HobbesError::invalid(format!(
                "NUMA node {} out of range",
                numa_node
            )));
        }
        if db.cpus.contains_key(&cpu_id) {
            return Err(HobbesError::already_exists(format!("CPU {}", cpu_id)));
        }

        db.cpus.insert(
            cpu_id,
            CpuRow {
                cpu_id,
                apic_id,
                numa_node,
                state,
                enclave: None,
                logical_id: None,
            },
        );
        Ok(())
    }

    pub fn cpu_info(&self, cpu_id: u32) -> Result<CpuInfo> {
        let db = self.read()?;
        db.cpus
            .get(&cpu_id)
            .map(CpuInfo::from)
            .ok_or_else(|| HobbesError::not_found(format!("CPU {}", cpu_id)))
    }

    pub fn cpu_list(&self) -> Result<Vec<CpuInfo>> {
        let db = self.read()?;
        Ok(db.cpus.values().map(CpuInfo::from).collect())
    }

    pub fn free_cpu_count(&self) -> Result<u32> {
        let db = self.read()?;
        Ok(db
            .cpus
            .values()
            .filter(|row| row.state == ResourceState::Free)
            .count() as u32)
    }

    /// Allocate a CPU to an enclave.
    ///
    /// With an explicit id the CPU must be Free (and on the requested NUMA
    /// node, when one is given). Otherwise the first Free CPU matching the
    /// constraints wins. Returns the allocated hardware id.
    pub fn alloc_cpu(
        &self,
        cpu_id: Option<u32>,
        numa_node: Option<u32>,
        enclave: EnclaveId,
    ) -> Result<u32> {
        let mut db = self.write()?;

        if !db.enclaves.contains_key(&enclave) {
            return Err(HobbesError::not_found(format!("enclave {}", enclave)));
        }

        let id = match cpu_id {
            Some(id) => {
                let row = db
                    .cpus
                    .get(&id)
                    .ok_or_else(|| HobbesError::not_found(format!("CPU {}", id)))?;
                if row.state != ResourceState::Free {
                    return Err(HobbesError::no_resources(format!(
                        "CPU {} is {}",
                        id, row.state
                    )));
                }
                if let Some(numa) = numa_node {
                    if row.numa_node != numa {
                        return Err(HobbesError::no_resources(format!(
                            "CPU {} is on NUMA node {}, not {}",
                            id, row.numa_node, numa
                        )));
                    }
                }
                id
            }
            None => db
                .cpus
                .values()
                .find(|row| {
                    row.state == ResourceState::Free
                        && numa_node.map_or(true, |numa| row.numa_node == numa)
                })
                .map(|row| row.cpu_id)
                .ok_or_else(|| HobbesError::no_resources("no free CPU matches"))?,
        };

        let row = db.cpus.get_mut(&id).unwrap();
        row.state = ResourceState::Allocated;
        row.enclave = Some(enclave);
        Ok(id)
    }

    pub fn free_cpu(&self, cpu_id: u32) -> Result<()> {
        let mut db = self.write()?;
        let row = db
            .cpus
            .get_mut(&cpu_id)
            .ok_or_else(|| HobbesError::not_found(format!("CPU {}", cpu_id)))?;
        if row.state != ResourceState::Allocated {
            return Err(HobbesError::invalid(format!(
                "CPU {} is {}, not allocated",
                cpu_id, row.state
            )));
        }
        row.state = ResourceState::Free;
        row.enclave = None;
        row.logical_id = None;
        Ok(())
    }

    /// Release every CPU owned by the given enclave.
    pub fn free_enclave_cpus(&self, enclave: EnclaveId) -> Result<()> {
        let mut db = self.write()?;
        for row in db.cpus.values_mut() {
            if row.enclave == Some(enclave) {
                row.state = ResourceState::Free;
                row.enclave = None;
                row.logical_id = None;
            }
        }
        Ok(())
    }

    /// Record the enclave-local logical id of an allocated CPU.
    pub fn set_cpu_logical_id(&self, cpu_id: u32, logical_id: u32) -> Result<()> {
        let mut db = self.write()?;
        let row = db
            .cpus
            .get_mut(&cpu_id)
            .ok_or_else(|| HobbesError::not_found(format!("CPU {}", cpu_id)))?;
        if row.state != ResourceState::Allocated {
            return Err(HobbesError::invalid(format!(
                "CPU {} has no owning enclave",
                cpu_id
            )));
        }
        row.logical_id = Some(logical_id);
        Ok(())
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
