//! Application rows

use hobbes_core::{AppId, AppState, EnclaveId};

use super::Registry;
use crate::error::{HobbesError, Result};

pub(crate) struct AppRow {
    pub(crate) id: AppId,
    pub(crate) name: String,
    pub(crate) state: AppState,
    pub(crate) enclave: EnclaveId,
}

/// Snapshot of an application row.
#[derive(Debug, Clone)]
pub struct AppInfo {
    pub id: AppId,
    pub name: String,
    pub state: AppState,
    pub enclave: EnclaveId,
}

impl From<&AppRow> for AppInfo {
    fn from(row: &AppRow) -> Self {
        AppInfo {
            id: row.id,
            name: row.name.clone(),
            state: row.state,
            enclave: row.enclave,
        }
    }
}

impl Registry {
    /// Insert an application row in state Initialized and return its id.
    pub fn create_app(&self, name: &str, enclave: EnclaveId) -> Result<AppId> {
        let mut db = self.write()?;

        if !db.enclaves.contains_key(&enclave) {
            return Err(HobbesError::not_found(format!("enclave {}", enclave)));
        }

        let id = AppId(db.app_hdr.next);
        db.apps.insert(
            id,
            AppRow {
                id,
                name: name.to_string(),
                state: AppState::Initialized,
                enclave,
            },
        );
        db.app_hdr.next += 1;
        db.app_hdr.count += 1;

        Ok(id)
    }

    pub fn delete_app(&self, id: AppId) -> Result<()> {
        let mut db = self.write()?;
        if db.apps.remove(&id).is_none() {
            return Err(HobbesError::not_found(format!("app {}", id)));
        }
        db.app_hdr.count -= 1;
        Ok(())
    }

    pub fn list_apps(&self) -> Result<Vec<AppId>> {
        let db = self.read()?;
        Ok(db.apps.keys().copied().collect())
    }

    pub fn app_count(&self) -> Result<u32> {
        Ok(self.read()?.app_hdr.count)
    }

    pub fn app_info(&self, id: AppId) -> Result<AppInfo> {
        let db = self.read()?;
        db.apps
            .get(&id)
            .map(AppInfo::from)
            .ok_or_else(|| HobbesError::not_found(format!("app {}", id)))
    }

    pub fn app_info_list(&self) -> Result<Vec<AppInfo>> {
        let db = self.read()?;
        Ok(db.apps.values().map(AppInfo::from).collect())
    }

    pub fn lookup_app(&self, name: &str) -> Result<AppId> {
        let db = self.read()?;
        db.apps
            .values()
            .find(|row| row.name == name)
            .map(|row| row.id)
            .ok_or_else(|| HobbesError::not_found(format!("app '{}'", name)))
    }

    pub fn app_name(&self, id: AppId) -> Result<String> {
        let db = self.read()?;
        db.apps
            .get(&id)
            .map(|row| row.name.clone())
            .ok_or_else(|| HobbesError::not_found(format!("app {}", id)))
    }

    pub fn app_state(&self, id: AppId) -> Result<AppState> {
        let db = self.read()?;
        db.apps
            .get(&id)
            .map(|row| row.state)
            .ok_or_else(|| HobbesError::not_found(format!("app {}", id)))
    }

    pub fn set_app_state(&self, id: AppId, state: AppState) -> Result<()> {
        let mut db = self.write()?;
        let row = db
            .apps
            .get_mut(&id)
            .ok_or_else(|| HobbesError::not_found(format!("app {}", id)))?;
        row.state = state;
        Ok(())
    }

    pub fn app_enclave(&self, id: AppId) -> Result<EnclaveId> {
        let db = self.read()?;
        db.apps
            .get(&id)
            .map(|row| row.enclave)
            .ok_or_else(|| HobbesError::not_found(format!("app {}", id)))
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use hobbes_core::{AppState, EnclaveType};

    use crate::registry::testutil::fresh_registry;

    #[test]
    fn app_rows_round_trip() {
        let registry = fresh_registry();
        let master = registry
            .create_enclave(Some("master"), EnclaveType::Master, None)
            .unwrap();

        let a = registry.create_app("bench", master).unwrap();
        let b = registry.create_app("bench", master).unwrap();
        assert_ne!(a, b);

        assert_eq!(registry.app_state(a).unwrap(), AppState::Initialized);
        assert_eq!(registry.app_enclave(a).unwrap(), master);
        assert_eq!(registry.app_name(a).unwrap(), "bench");

        // Name lookup resolves to the first row.
        assert_eq!(registry.lookup_app("bench").unwrap(), a);

        registry.set_app_state(a, AppState::Running).unwrap();
        assert_eq!(registry.app_state(a).unwrap(), AppState::Running);

        assert_eq!(registry.app_count().unwrap(), 2);
        registry.delete_app(a).unwrap();
        assert_eq!(registry.app_count().unwrap(), 1);
        assert!(registry.app_state(a).is_err());

        // Freed app ids are not reissued either.
        let c = registry.create_app("other", master).unwrap();
        assert!(c > b);
    }

    #[test]
    fn apps_require_an_existing_enclave() {
        let registry = fresh_registry();
        assert!(registry
            .create_app("orphan", hobbes_core::EnclaveId(9))
            .is_err());
    }
}
