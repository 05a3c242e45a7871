//! Resource and metadata registry
//!
//! The master database of the node: one record store exported under a
//! well-known segment id, holding the system header plus CPU, memory block,
//! enclave, application, segment, and notifier rows.
//!
//! Ownership of every row belongs to the registry; callers only see copies
//! taken under the row lock. All cross-row references are typed ids, so
//! traversal is always a query against the store, never a chased pointer.
//! Every public operation spans exactly one read- or write-locked critical
//! section: a committed write becomes visible atomically to any read that
//! acquires the lock after it.

mod app;
mod enclave;
mod memory;
mod segment;
mod system;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use hobbes_core::{AppId, EnclaveId, EventMask, MASTER_DB_SEGID};
use xemem::SegId;

pub use app::AppInfo;
pub use enclave::EnclaveInfo;
pub use memory::MemBlockInfo;
pub use segment::SegmentInfo;
pub use system::{CpuInfo, SystemInfo};

use crate::error::{HobbesError, Result};

// ————————————————————————————— Database State ————————————————————————————— //

/// Monotonic id header for enclave and application rows.
///
/// `next` only ever grows, so a freed id is never reissued; `count` tracks
/// the live rows.
#[derive(Debug, Default)]
pub(crate) struct RowHeader {
    pub(crate) next: i32,
    pub(crate) count: u32,
}

pub(crate) struct MasterDb {
    pub(crate) system: Option<system::SystemHeader>,
    pub(crate) cpus: BTreeMap<u32, system::CpuRow>,

    /// All memory blocks, keyed (and therefore ordered) by base address.
    pub(crate) blocks: BTreeMap<u64, memory::MemBlockRow>,
    /// Free blocks, ordered by base address. Always a subset of `blocks`
    /// containing exactly the rows whose state is Free.
    pub(crate) free_blocks: BTreeSet<u64>,

    pub(crate) enclaves: BTreeMap<EnclaveId, enclave::EnclaveRow>,
    pub(crate) enclave_hdr: RowHeader,

    pub(crate) apps: BTreeMap<AppId, app::AppRow>,
    pub(crate) app_hdr: RowHeader,

    pub(crate) segments: BTreeMap<SegId, segment::SegmentRow>,
    pub(crate) notifiers: BTreeMap<SegId, EventMask>,
}

impl MasterDb {
    fn new() -> Self {
        MasterDb {
            system: None,
            cpus: BTreeMap::new(),
            blocks: BTreeMap::new(),
            free_blocks: BTreeSet::new(),
            enclaves: BTreeMap::new(),
            enclave_hdr: RowHeader::default(),
            apps: BTreeMap::new(),
            app_hdr: RowHeader::default(),
            segments: BTreeMap::new(),
            notifiers: BTreeMap::new(),
        }
    }
}

// ———————————————————————————————— Registry ———————————————————————————————— //

/// A handle onto the master database.
///
/// Cloning is cheap; all clones share the same store.
#[derive(Clone)]
pub struct Registry {
    db: Arc<RwLock<MasterDb>>,
    segid: SegId,
}

impl Registry {
    /// Create the master database and export it under the well-known
    /// segment id. Only the master init task does this, once per node boot.
    pub fn create() -> Result<Registry> {
        Self::create_at(MASTER_DB_SEGID)
    }

    /// Create a master database exported under an explicit segment id.
    pub fn create_at(segid: SegId) -> Result<Registry> {
        let db = Arc::new(RwLock::new(MasterDb::new()));
        xemem::make(db.clone(), Some(segid))?;
        Ok(Registry { db, segid })
    }

    /// Attach the master database exported under the well-known segment id.
    pub fn open() -> Result<Registry> {
        Self::open_at(MASTER_DB_SEGID)
    }

    /// Attach a master database exported under an explicit segment id.
    pub fn open_at(segid: SegId) -> Result<Registry> {
        let apid = xemem::get(segid)?;
        let db: Arc<RwLock<MasterDb>> = apid.attach()?;
        Ok(Registry { db, segid })
    }

    pub fn segid(&self) -> SegId {
        self.segid
    }

    /// Withdraw the database export. Master teardown only; refused while
    /// any other enclave is still registered.
    pub fn destroy(self) -> Result<()> {
        {
            let db = self.read()?;
            if db.enclaves.keys().any(|id| *id != EnclaveId::MASTER) {
                return Err(HobbesError::Busy(String::from(
                    "enclaves are still registered",
                )));
            }
        }
        xemem::remove(self.segid)?;
        Ok(())
    }

    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, MasterDb>> {
        self.db
            .read()
            .map_err(|_| HobbesError::catastrophic("registry lock poisoned"))
    }

    pub(crate) fn write(&self) -> Result<RwLockWriteGuard<'_, MasterDb>> {
        self.db
            .write()
            .map_err(|_| HobbesError::catastrophic("registry lock poisoned"))
    }
}

// —————————————————————————————— Notifier Rows ————————————————————————————— //

impl Registry {
    /// Record an event subscription for a signalled segment.
    pub fn create_notifier(&self, segid: SegId, mask: EventMask) -> Result<()> {
        if mask.is_empty() {
            return Err(HobbesError::invalid("empty notifier event mask"));
        }
        let mut db = self.write()?;
        if db.notifiers.contains_key(&segid) {
            return Err(HobbesError::already_exists(format!("notifier {}", segid)));
        }
        db.notifiers.insert(segid, mask);
        Ok(())
    }

    pub fn delete_notifier(&self, segid: SegId) -> Result<()> {
        let mut db = self.write()?;
        db.notifiers
            .remove(&segid)
            .map(|_| ())
            .ok_or_else(|| HobbesError::not_found(format!("notifier {}", segid)))
    }

    /// Segments subscribed to any of the given events.
    pub fn event_subscribers(&self, mask: EventMask) -> Result<Vec<SegId>> {
        let db = self.read()?;
        Ok(db
            .notifiers
            .iter()
            .filter(|(_, sub)| sub.intersects(mask))
            .map(|(segid, _)| *segid)
            .collect())
    }
}

// ——————————————————————————————— Test Support ————————————————————————————— //

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::atomic::{AtomicI64, Ordering};

    use super::Registry;

    /// Registries for tests get their own segment ids so concurrently
    /// running tests never collide on the well-known id.
    static NEXT_TEST_SEGID: AtomicI64 = AtomicI64::new(50_000);

    pub(crate) fn fresh_registry() -> Registry {
        let segid = NEXT_TEST_SEGID.fetch_add(1, Ordering::SeqCst);
        Registry::create_at(segid).unwrap()
    }
}
