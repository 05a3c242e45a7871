//! Memory block rows and the block allocator
//!
//! The unit of all memory accounting is the hardware block. Blocks live in
//! an address-ordered arena; the free set is address-ordered as well and
//! contains exactly the rows whose state is Free. A span of `n` blocks is
//! physically contiguous iff the `n` entries following its base coincide on
//! the all-blocks order and the free order, and a span never crosses a NUMA
//! boundary.

use hobbes_core::{AppId, EnclaveId, ResourceState};

use super::system::system_header;
use super::{MasterDb, Registry};
use crate::error::{HobbesError, Result};

pub(crate) struct MemBlockRow {
    pub(crate) base_addr: u64,
    pub(crate) numa_node: u32,
    pub(crate) state: ResourceState,
    /// Valid iff state is Allocated.
    pub(crate) enclave: Option<EnclaveId>,
    pub(crate) app: Option<AppId>,
}

/// Snapshot of a memory block row.
#[derive(Debug, Clone, Copy)]
pub struct MemBlockInfo {
    pub base_addr: u64,
    pub size: u64,
    pub numa_node: u32,
    pub state: ResourceState,
    pub enclave: Option<EnclaveId>,
    pub app: Option<AppId>,
}

// ————————————————————————— Internal Allocator Ops ————————————————————————— //

fn take_block(db: &mut MasterDb, addr: u64, enclave: EnclaveId) {
    db.free_blocks.remove(&addr);
    let row = db.blocks.get_mut(&addr).unwrap();
    row.state = ResourceState::Allocated;
    row.enclave = Some(enclave);
}

/// Allocate one span of `span` contiguous same-NUMA blocks.
fn alloc_span(
    db: &mut MasterDb,
    enclave: EnclaveId,
    numa_node: Option<u32>,
    span: usize,
) -> Result<u64> {
    let candidates: Vec<u64> = db.free_blocks.iter().copied().collect();

    for &base in &candidates {
        let node = db.blocks[&base].numa_node;
        if let Some(numa) = numa_node {
            if node != numa {
                continue;
            }
        }

        // Contiguity: the next `span` entries after `base` must be the same
        // on the all-blocks order and on the free order.
        let run: Vec<u64> = db.blocks.range(base..).map(|(a, _)| *a).take(span).collect();
        let free_run: Vec<u64> = db.free_blocks.range(base..).take(span).copied().collect();
        if run.len() < span || run != free_run {
            continue;
        }

        if let Some(&crossing) = run.iter().find(|a| db.blocks[a].numa_node != node) {
            if numa_node.is_some() {
                // An explicitly pinned span must not interleave NUMA nodes.
                return Err(HobbesError::no_resources(format!(
                    "span at {:#x} crosses a NUMA boundary at {:#x}",
                    base, crossing
                )));
            }
            continue;
        }

        for addr in run {
            take_block(db, addr, enclave);
        }
        return Ok(base);
    }

    Err(HobbesError::no_resources(format!(
        "no free span of {} contiguous blocks",
        span
    )))
}

/// Release `span` blocks starting at `base`, following the all-blocks order.
fn free_span(db: &mut MasterDb, base: u64, span: usize) -> Result<()> {
    if !db.blocks.contains_key(&base) {
        return Err(HobbesError::not_found(format!("memory block {:#x}", base)));
    }

    let run: Vec<u64> = db.blocks.range(base..).map(|(a, _)| *a).take(span).collect();
    for addr in &run {
        let row = db.blocks.get_mut(addr).unwrap();
        row.state = ResourceState::Free;
        row.enclave = None;
        row.app = None;
        db.free_blocks.insert(*addr);
    }

    if run.len() < span {
        return Err(HobbesError::invalid(format!(
            "span at {:#x} extends past registered memory",
            base
        )));
    }
    Ok(())
}

impl From<(&MemBlockRow, u64)> for MemBlockInfo {
    fn from((row, size): (&MemBlockRow, u64)) -> Self {
        MemBlockInfo {
            base_addr: row.base_addr,
            size,
            numa_node: row.numa_node,
            state: row.state,
            enclave: row.enclave,
            app: row.app,
        }
    }
}

// ————————————————————————————— Public Interface ——————————————————————————— //

impl Registry {
    /// Register a memory block. `size` must match the system block size.
    pub fn register_memory(
        &self,
        base_addr: u64,
        size: u64,
        numa_node: u32,
        state: ResourceState,
    ) -> Result<()> {
        if !matches!(state, ResourceState::Free | ResourceState::Reserved) {
            return Err(HobbesError::invalid(format!(
                "cannot register block {:#x} in state {}",
                base_addr, state
            )));
        }

        let mut db = self.write()?;
        let hdr = system_header(&db)?;
        if size != hdr.blk_size {
            return Err(HobbesError::invalid(format!(
                "block size {} does not match the system block size {}",
                size, hdr.blk_size
            )));
        }
        if numa_node >= hdr.numa_cnt {
            return Err(HobbesError::invalid(format!(
                "NUMA node {} out of range",
                numa_node
            )));
        }
        if db.blocks.contains_key(&base_addr) {
            return Err(HobbesError::already_exists(format!(
                "memory block {:#x}",
                base_addr
            )));
        }

        db.blocks.insert(
            base_addr,
            MemBlockRow {
                base_addr,
                numa_node,
                state,
                enclave: None,
                app: None,
            },
        );
        if state == ResourceState::Free {
            db.free_blocks.insert(base_addr);
        }
        Ok(())
    }

    /// Allocate `num_blocks` spans of `block_span` contiguous blocks each.
    ///
    /// Returns the base address of each span. On any failure everything
    /// allocated by this call is released before the error is reported.
    pub fn alloc_blocks(
        &self,
        enclave: EnclaveId,
        numa_node: Option<u32>,
        num_blocks: u32,
        block_span: u32,
    ) -> Result<Vec<u64>> {
        if num_blocks == 0 {
            return Ok(Vec::new());
        }
        if block_span == 0 {
            return Err(HobbesError::invalid("zero block span"));
        }

        let mut db = self.write()?;
        system_header(&db)?;
        if !db.enclaves.contains_key(&enclave) {
            return Err(HobbesError::not_found(format!("enclave {}", enclave)));
        }

        let mut allocated = Vec::with_capacity(num_blocks as usize);
        for _ in 0..num_blocks {
            match alloc_span(&mut db, enclave, numa_node, block_span as usize) {
                Ok(base) => allocated.push(base),
                Err(e) => {
                    for base in allocated {
                        free_span(&mut db, base, block_span as usize)?;
                    }
                    return Err(e);
                }
            }
        }
        Ok(allocated)
    }

    /// Allocate a specific, pre-known range of `block_span` blocks starting
    /// at `base_addr`. Used when another subsystem already reserved the
    /// physical range.
    pub fn alloc_block_addr(
        &self,
        enclave: EnclaveId,
        base_addr: u64,
        block_span: u32,
    ) -> Result<()> {
        if block_span == 0 {
            return Ok(());
        }

        let mut db = self.write()?;
        let blk_size = system_header(&db)?.blk_size;
        if !db.enclaves.contains_key(&enclave) {
            return Err(HobbesError::not_found(format!("enclave {}", enclave)));
        }

        for i in 0..block_span as u64 {
            let addr = base_addr + i * blk_size;
            let state = match db.blocks.get(&addr) {
                Some(row) => row.state,
                None => {
                    if i > 0 {
                        free_span(&mut db, base_addr, i as usize)?;
                    }
                    return Err(HobbesError::not_found(format!("memory block {:#x}", addr)));
                }
            };
            if state != ResourceState::Free {
                if i > 0 {
                    free_span(&mut db, base_addr, i as usize)?;
                }
                return Err(HobbesError::already_exists(format!(
                    "memory block {:#x} is {}",
                    addr, state
                )));
            }
            take_block(&mut db, addr, enclave);
        }
        Ok(())
    }

    /// Release `block_span` blocks starting at `base_addr`.
    pub fn free_block(&self, base_addr: u64, block_span: u32) -> Result<()> {
        let mut db = self.write()?;
        free_span(&mut db, base_addr, block_span as usize)
    }

    /// Release every block owned by the given enclave.
    pub fn free_enclave_blocks(&self, enclave: EnclaveId) -> Result<()> {
        let mut db = self.write()?;
        let owned: Vec<u64> = db
            .blocks
            .values()
            .filter(|row| row.enclave == Some(enclave))
            .map(|row| row.base_addr)
            .collect();
        for addr in owned {
            free_span(&mut db, addr, 1)?;
        }
        Ok(())
    }

    /// Tag allocated blocks with the application they back.
    pub fn assign_blocks_to_app(
        &self,
        base_addr: u64,
        block_span: u32,
        app: Option<AppId>,
    ) -> Result<()> {
        let mut db = self.write()?;
        let run: Vec<u64> = db
            .blocks
            .range(base_addr..)
            .map(|(a, _)| *a)
            .take(block_span as usize)
            .collect();
        if run.len() < block_span as usize {
            return Err(HobbesError::not_found(format!(
                "memory span {:#x}",
                base_addr
            )));
        }
        for addr in run {
            let row = db.blocks.get_mut(&addr).unwrap();
            if row.state != ResourceState::Allocated {
                return Err(HobbesError::invalid(format!(
                    "block {:#x} is {}, not allocated",
                    addr, row.state
                )));
            }
            row.app = app;
        }
        Ok(())
    }

    // ———————————————————————— Byte-Size Conveniences —————————————————————— //

    /// Number of blocks needed to cover `bytes`.
    pub fn span_for_bytes(&self, bytes: u64) -> Result<u32> {
        let blk_size = self.block_size()?;
        Ok((bytes.div_ceil(blk_size)) as u32)
    }

    /// Allocate one contiguous region of at least `bytes`.
    pub fn alloc_mem(
        &self,
        enclave: EnclaveId,
        numa_node: Option<u32>,
        bytes: u64,
    ) -> Result<u64> {
        let span = self.span_for_bytes(bytes)?;
        let spans = self.alloc_blocks(enclave, numa_node, 1, span)?;
        Ok(spans[0])
    }

    /// Allocate a specific range covering `bytes` starting at `base_addr`.
    pub fn alloc_mem_addr(&self, enclave: EnclaveId, base_addr: u64, bytes: u64) -> Result<()> {
        let span = self.span_for_bytes(bytes)?;
        self.alloc_block_addr(enclave, base_addr, span)
    }

    /// Release the range covering `bytes` starting at `base_addr`.
    pub fn free_mem(&self, base_addr: u64, bytes: u64) -> Result<()> {
        let span = self.span_for_bytes(bytes)?;
        self.free_block(base_addr, span)
    }

    pub fn total_mem(&self) -> Result<u64> {
        let db = self.read()?;
        let hdr = system_header(&db)?;
        Ok(db.blocks.len() as u64 * hdr.blk_size)
    }

    pub fn free_mem_bytes(&self) -> Result<u64> {
        let db = self.read()?;
        let hdr = system_header(&db)?;
        Ok(db.free_blocks.len() as u64 * hdr.blk_size)
    }

    pub fn mem_info(&self, base_addr: u64) -> Result<MemBlockInfo> {
        let db = self.read()?;
        let blk_size = system_header(&db)?.blk_size;
        db.blocks
            .get(&base_addr)
            .map(|row| MemBlockInfo::from((row, blk_size)))
            .ok_or_else(|| HobbesError::not_found(format!("memory block {:#x}", base_addr)))
    }

    pub fn memory_list(&self) -> Result<Vec<MemBlockInfo>> {
        let db = self.read()?;
        let blk_size = system_header(&db)?.blk_size;
        Ok(db
            .blocks
            .values()
            .map(|row| MemBlockInfo::from((row, blk_size)))
            .collect())
    }

    pub fn enclave_memory_list(&self, enclave: EnclaveId) -> Result<Vec<MemBlockInfo>> {
        let db = self.read()?;
        let blk_size = system_header(&db)?.blk_size;
        Ok(db
            .blocks
            .values()
            .filter(|row| row.enclave == Some(enclave))
            .map(|row| MemBlockInfo::from((row, blk_size)))
            .collect())
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use hobbes_core::{EnclaveId, EnclaveType, ResourceState, DEFAULT_BLOCK_SIZE};

    use crate::registry::testutil::fresh_registry;
    use crate::registry::Registry;

    const BLK: u64 = DEFAULT_BLOCK_SIZE;

    /// Two NUMA nodes with 8 blocks each, contiguous from address 0.
    fn sixteen_block_node() -> (Registry, EnclaveId) {
        let registry = fresh_registry();
        registry.init_system_info(2, BLK).unwrap();
        let master = registry
            .create_enclave(Some("master"), EnclaveType::Master, None)
            .unwrap();
        for i in 0..16u64 {
            registry
                .register_memory(i * BLK, BLK, (i / 8) as u32, ResourceState::Free)
                .unwrap();
        }
        (registry, master)
    }

    /// The free set must contain exactly the Free rows, in address order.
    fn check_free_list(registry: &Registry) {
        let free: Vec<u64> = registry
            .memory_list()
            .unwrap()
            .iter()
            .filter(|b| b.state == ResourceState::Free)
            .map(|b| b.base_addr)
            .collect();
        assert_eq!(registry.free_mem_bytes().unwrap(), free.len() as u64 * BLK);
        for b in registry.memory_list().unwrap() {
            assert_eq!(
                b.state == ResourceState::Allocated,
                b.enclave.is_some(),
                "block {:#x} violates state/owner coupling",
                b.base_addr
            );
        }
    }

    #[test]
    fn register_rejects_duplicates_and_bad_sizes() {
        let (registry, _) = sixteen_block_node();
        assert!(registry
            .register_memory(0, BLK, 0, ResourceState::Free)
            .is_err());
        assert!(registry
            .register_memory(32 * BLK, BLK / 2, 0, ResourceState::Free)
            .is_err());
        assert!(registry
            .register_memory(32 * BLK, BLK, 7, ResourceState::Free)
            .is_err());
    }

    #[test]
    fn span_allocation_is_contiguous_and_single_numa() {
        let (registry, master) = sixteen_block_node();

        let spans = registry.alloc_blocks(master, None, 2, 3).unwrap();
        assert_eq!(spans.len(), 2);

        for base in &spans {
            // Each result starts a run of 3 blocks allocated to the same
            // enclave on the same node, consecutive by address.
            let node = registry.mem_info(*base).unwrap().numa_node;
            for i in 0..3u64 {
                let info = registry.mem_info(base + i * BLK).unwrap();
                assert_eq!(info.state, ResourceState::Allocated);
                assert_eq!(info.enclave, Some(master));
                assert_eq!(info.numa_node, node);
            }
        }
        check_free_list(&registry);
    }

    #[test]
    fn pinned_span_must_not_cross_numa() {
        let (registry, master) = sixteen_block_node();

        // Take blocks 0-5, leaving 6-7 on node 0 free; a pinned span of 4
        // would have to cross into node 1.
        registry.alloc_block_addr(master, 0, 6).unwrap();
        let err = registry.alloc_blocks(master, Some(0), 1, 4).unwrap_err();
        assert!(err.to_string().contains("NUMA") || err.to_string().contains("span"));

        // Unpinned allocation skips the crossing run and lands on node 1.
        let spans = registry.alloc_blocks(master, None, 1, 4).unwrap();
        assert_eq!(spans, vec![8 * BLK]);
        check_free_list(&registry);
    }

    #[test]
    fn failed_allocation_rolls_back() {
        let (registry, master) = sixteen_block_node();
        let free_before = registry.free_mem_bytes().unwrap();

        // Three spans of 8 cannot fit in 16 blocks; the first spans must be
        // released before the failure is reported.
        assert!(registry.alloc_blocks(master, None, 3, 8).is_err());
        assert_eq!(registry.free_mem_bytes().unwrap(), free_before);
        check_free_list(&registry);
    }

    #[test]
    fn span_larger_than_any_free_run_fails() {
        let (registry, master) = sixteen_block_node();
        assert!(registry.alloc_blocks(master, Some(0), 1, 9).is_err());
        assert!(registry.alloc_blocks(master, None, 1, 17).is_err());
    }

    #[test]
    fn zero_count_is_a_noop_success() {
        let (registry, master) = sixteen_block_node();
        assert!(registry.alloc_blocks(master, None, 0, 4).unwrap().is_empty());
        assert_eq!(registry.free_mem_bytes().unwrap(), 16 * BLK);
        assert!(registry.alloc_blocks(master, None, 1, 0).is_err());
    }

    #[test]
    fn explicit_address_allocation() {
        let (registry, master) = sixteen_block_node();

        registry.alloc_block_addr(master, 4 * BLK, 2).unwrap();
        assert_eq!(
            registry.mem_info(4 * BLK).unwrap().enclave,
            Some(master)
        );

        // Taking an already-allocated range is a duplicate.
        assert!(matches!(
            registry.alloc_block_addr(master, 4 * BLK, 1),
            Err(crate::error::HobbesError::AlreadyExists(_))
        ));

        // An unregistered range reports NotFound, and a partial overlap
        // rolls the prefix back.
        let free_before = registry.free_mem_bytes().unwrap();
        assert!(matches!(
            registry.alloc_block_addr(master, 15 * BLK, 2),
            Err(crate::error::HobbesError::NotFound(_))
        ));
        assert_eq!(registry.free_mem_bytes().unwrap(), free_before);
        check_free_list(&registry);
    }

    #[test]
    fn free_enclave_blocks_restores_the_free_count() {
        let (registry, master) = sixteen_block_node();
        let p1 = registry
            .create_enclave(Some("p1"), EnclaveType::Pisces, Some(master))
            .unwrap();

        let free_before = registry.free_mem_bytes().unwrap();
        registry.alloc_blocks(p1, Some(0), 2, 2).unwrap();
        registry.alloc_mem(p1, Some(1), BLK * 3).unwrap();
        assert_eq!(registry.free_mem_bytes().unwrap(), free_before - 7 * BLK);

        registry.free_enclave_blocks(p1).unwrap();
        assert_eq!(registry.free_mem_bytes().unwrap(), free_before);
        check_free_list(&registry);
    }

    #[test]
    fn app_tagging_requires_allocated_blocks() {
        let (registry, master) = sixteen_block_node();
        let app = registry.create_app("stub", master).unwrap();

        assert!(registry
            .assign_blocks_to_app(0, 1, Some(app))
            .is_err());

        registry.alloc_block_addr(master, 0, 1).unwrap();
        registry.assign_blocks_to_app(0, 1, Some(app)).unwrap();
        assert_eq!(registry.mem_info(0).unwrap().app, Some(app));

        // Freeing clears the tag.
        registry.free_block(0, 1).unwrap();
        assert_eq!(registry.mem_info(0).unwrap().app, None);
    }
}
