//! Enclave rows

use hobbes_core::{EnclaveId, EnclaveState, EnclaveType};
use xemem::SegId;

use super::Registry;
use crate::error::{HobbesError, Result};

pub(crate) struct EnclaveRow {
    pub(crate) id: EnclaveId,
    pub(crate) name: String,
    pub(crate) enclave_type: EnclaveType,
    pub(crate) state: EnclaveState,
    /// The id the parent's OS uses to reach this enclave (a Pisces
    /// partition index, a VM instance id). None until the loader reports it.
    pub(crate) dev_id: Option<i32>,
    /// Master for physical enclaves, the hosting enclave for VMs.
    pub(crate) parent: Option<EnclaveId>,
    /// Signalled segment carrying this enclave's command queue.
    pub(crate) cmdq_segid: Option<SegId>,
}

/// Snapshot of an enclave row.
#[derive(Debug, Clone)]
pub struct EnclaveInfo {
    pub id: EnclaveId,
    pub name: String,
    pub enclave_type: EnclaveType,
    pub state: EnclaveState,
    pub parent: Option<EnclaveId>,
}

impl From<&EnclaveRow> for EnclaveInfo {
    fn from(row: &EnclaveRow) -> Self {
        EnclaveInfo {
            id: row.id,
            name: row.name.clone(),
            enclave_type: row.enclave_type,
            state: row.state,
            parent: row.parent,
        }
    }
}

impl Registry {
    /// Insert an enclave row in state Initialized and return its id.
    ///
    /// The parentless root is the master enclave and takes the well-known
    /// master id; everyone else draws the next monotonic id. An absent name
    /// auto-names the enclave `enclave-<id>`.
    pub fn create_enclave(
        &self,
        name: Option<&str>,
        enclave_type: EnclaveType,
        parent: Option<EnclaveId>,
    ) -> Result<EnclaveId> {
        let mut db = self.write()?;

        let id = match parent {
            None => EnclaveId::MASTER,
            Some(parent) => {
                if !db.enclaves.contains_key(&parent) {
                    return Err(HobbesError::not_found(format!("parent enclave {}", parent)));
                }
                EnclaveId(db.enclave_hdr.next)
            }
        };

        if db.enclaves.contains_key(&id) {
            return Err(HobbesError::already_exists(format!("enclave {}", id)));
        }

        let name = match name {
            Some(name) => name.to_string(),
            None => format!("enclave-{}", id),
        };

        db.enclaves.insert(
            id,
            EnclaveRow {
                id,
                name,
                enclave_type,
                state: EnclaveState::Initialized,
                dev_id: None,
                parent,
                cmdq_segid: None,
            },
        );

        // Ids only ever grow so a deleted enclave's id is never reissued.
        db.enclave_hdr.next = db.enclave_hdr.next.max(id.0 + 1);
        db.enclave_hdr.count += 1;

        Ok(id)
    }

    pub fn delete_enclave(&self, id: EnclaveId) -> Result<()> {
        let mut db = self.write()?;
        if db.enclaves.remove(&id).is_none() {
            return Err(HobbesError::not_found(format!("enclave {}", id)));
        }
        db.enclave_hdr.count -= 1;
        Ok(())
    }

    /// Snapshot of all enclave ids, in id order.
    pub fn list_enclaves(&self) -> Result<Vec<EnclaveId>> {
        let db = self.read()?;
        Ok(db.enclaves.keys().copied().collect())
    }

    pub fn enclave_count(&self) -> Result<u32> {
        Ok(self.read()?.enclave_hdr.count)
    }

    pub fn enclave_info(&self, id: EnclaveId) -> Result<EnclaveInfo> {
        let db = self.read()?;
        db.enclaves
            .get(&id)
            .map(EnclaveInfo::from)
            .ok_or_else(|| HobbesError::not_found(format!("enclave {}", id)))
    }

    pub fn enclave_info_list(&self) -> Result<Vec<EnclaveInfo>> {
        let db = self.read()?;
        Ok(db.enclaves.values().map(EnclaveInfo::from).collect())
    }

    /// Resolve an enclave by name. The first row wins when names collide
    /// (duplicate names are permitted).
    pub fn lookup_enclave(&self, name: &str) -> Result<EnclaveId> {
        let db = self.read()?;
        db.enclaves
            .values()
            .find(|row| row.name == name)
            .map(|row| row.id)
            .ok_or_else(|| HobbesError::not_found(format!("enclave '{}'", name)))
    }

    pub fn enclave_name(&self, id: EnclaveId) -> Result<String> {
        let db = self.read()?;
        db.enclaves
            .get(&id)
            .map(|row| row.name.clone())
            .ok_or_else(|| HobbesError::not_found(format!("enclave {}", id)))
    }

    pub fn enclave_type(&self, id: EnclaveId) -> Result<EnclaveType> {
        let db = self.read()?;
        db.enclaves
            .get(&id)
            .map(|row| row.enclave_type)
            .ok_or_else(|| HobbesError::not_found(format!("enclave {}", id)))
    }

    pub fn enclave_state(&self, id: EnclaveId) -> Result<EnclaveState> {
        let db = self.read()?;
        db.enclaves
            .get(&id)
            .map(|row| row.state)
            .ok_or_else(|| HobbesError::not_found(format!("enclave {}", id)))
    }

    pub fn set_enclave_state(&self, id: EnclaveId, state: EnclaveState) -> Result<()> {
        let mut db = self.write()?;
        let row = db
            .enclaves
            .get_mut(&id)
            .ok_or_else(|| HobbesError::not_found(format!("enclave {}", id)))?;
        row.state = state;
        Ok(())
    }

    pub fn enclave_parent(&self, id: EnclaveId) -> Result<Option<EnclaveId>> {
        let db = self.read()?;
        db.enclaves
            .get(&id)
            .map(|row| row.parent)
            .ok_or_else(|| HobbesError::not_found(format!("enclave {}", id)))
    }

    pub fn enclave_dev_id(&self, id: EnclaveId) -> Result<Option<i32>> {
        let db = self.read()?;
        db.enclaves
            .get(&id)
            .map(|row| row.dev_id)
            .ok_or_else(|| HobbesError::not_found(format!("enclave {}", id)))
    }

    pub fn set_enclave_dev_id(&self, id: EnclaveId, dev_id: i32) -> Result<()> {
        let mut db = self.write()?;
        let row = db
            .enclaves
            .get_mut(&id)
            .ok_or_else(|| HobbesError::not_found(format!("enclave {}", id)))?;
        row.dev_id = Some(dev_id);
        Ok(())
    }

    pub fn enclave_cmdq(&self, id: EnclaveId) -> Result<Option<SegId>> {
        let db = self.read()?;
        db.enclaves
            .get(&id)
            .map(|row| row.cmdq_segid)
            .ok_or_else(|| HobbesError::not_found(format!("enclave {}", id)))
    }

    pub fn set_enclave_cmdq(&self, id: EnclaveId, segid: Option<SegId>) -> Result<()> {
        let mut db = self.write()?;
        let row = db
            .enclaves
            .get_mut(&id)
            .ok_or_else(|| HobbesError::not_found(format!("enclave {}", id)))?;
        row.cmdq_segid = segid;
        Ok(())
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use hobbes_core::{EnclaveId, EnclaveState, EnclaveType};

    use crate::registry::testutil::fresh_registry;

    #[test]
    fn master_gets_the_well_known_id() {
        let registry = fresh_registry();

        let master = registry
            .create_enclave(Some("master"), EnclaveType::Master, None)
            .unwrap();
        assert_eq!(master, EnclaveId::MASTER);

        // A second parentless enclave collides with the master id.
        assert!(registry
            .create_enclave(Some("other"), EnclaveType::Master, None)
            .is_err());
    }

    #[test]
    fn create_delete_round_trip() {
        let registry = fresh_registry();
        let master = registry
            .create_enclave(Some("master"), EnclaveType::Master, None)
            .unwrap();

        let before = registry.enclave_count().unwrap();

        let p1 = registry
            .create_enclave(Some("p1"), EnclaveType::Pisces, Some(master))
            .unwrap();
        assert_eq!(registry.enclave_count().unwrap(), before + 1);
        assert_eq!(
            registry.enclave_state(p1).unwrap(),
            EnclaveState::Initialized
        );

        registry.delete_enclave(p1).unwrap();
        assert_eq!(registry.enclave_count().unwrap(), before);
        assert!(registry.enclave_state(p1).is_err());

        // The freed id is not reissued.
        let p2 = registry
            .create_enclave(Some("p2"), EnclaveType::Pisces, Some(master))
            .unwrap();
        assert_ne!(p2, p1);
        assert!(p2 > p1);
    }

    #[test]
    fn auto_naming() {
        let registry = fresh_registry();
        let master = registry.create_enclave(None, EnclaveType::Master, None).unwrap();
        assert_eq!(registry.enclave_name(master).unwrap(), "enclave-0");

        let vm = registry
            .create_enclave(None, EnclaveType::Vm, Some(master))
            .unwrap();
        assert_eq!(
            registry.enclave_name(vm).unwrap(),
            format!("enclave-{}", vm)
        );
    }

    #[test]
    fn field_accessors_round_trip() {
        let registry = fresh_registry();
        let master = registry
            .create_enclave(Some("master"), EnclaveType::Master, None)
            .unwrap();
        let p1 = registry
            .create_enclave(Some("p1"), EnclaveType::Pisces, Some(master))
            .unwrap();

        registry.set_enclave_state(p1, EnclaveState::Running).unwrap();
        assert_eq!(registry.enclave_state(p1).unwrap(), EnclaveState::Running);

        registry.set_enclave_dev_id(p1, 3).unwrap();
        assert_eq!(registry.enclave_dev_id(p1).unwrap(), Some(3));

        registry.set_enclave_cmdq(p1, Some(42)).unwrap();
        assert_eq!(registry.enclave_cmdq(p1).unwrap(), Some(42));

        assert_eq!(registry.enclave_parent(p1).unwrap(), Some(master));
        assert_eq!(registry.enclave_type(p1).unwrap(), EnclaveType::Pisces);
        assert_eq!(registry.lookup_enclave("p1").unwrap(), p1);

        let infos = registry.enclave_info_list().unwrap();
        assert_eq!(infos.len(), 2);
        assert!(infos
            .iter()
            .any(|i| i.id == p1 && i.state == EnclaveState::Running));
    }

    #[test]
    fn missing_rows_report_not_found() {
        let registry = fresh_registry();
        let ghost = EnclaveId(17);
        assert!(registry.enclave_state(ghost).is_err());
        assert!(registry.delete_enclave(ghost).is_err());
        assert!(registry
            .set_enclave_state(ghost, EnclaveState::Running)
            .is_err());
        assert!(registry.lookup_enclave("nope").is_err());
    }
}
