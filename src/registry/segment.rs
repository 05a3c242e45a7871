//! Exported segment rows
//!
//! Enclaves and applications advertise their cross-enclave memory exports
//! here so peers can discover a segment id by name.

use hobbes_core::{AppId, EnclaveId};
use xemem::SegId;

use super::Registry;
use crate::error::{HobbesError, Result};

pub(crate) struct SegmentRow {
    pub(crate) segid: SegId,
    pub(crate) name: Option<String>,
    pub(crate) enclave: Option<EnclaveId>,
    pub(crate) app: Option<AppId>,
}

/// Snapshot of a segment row.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub segid: SegId,
    pub name: Option<String>,
    pub enclave: Option<EnclaveId>,
    pub app: Option<AppId>,
}

impl From<&SegmentRow> for SegmentInfo {
    fn from(row: &SegmentRow) -> Self {
        SegmentInfo {
            segid: row.segid,
            name: row.name.clone(),
            enclave: row.enclave,
            app: row.app,
        }
    }
}

impl Registry {
    pub fn create_segment(
        &self,
        segid: SegId,
        name: Option<&str>,
        enclave: Option<EnclaveId>,
        app: Option<AppId>,
    ) -> Result<()> {
        let mut db = self.write()?;
        if db.segments.contains_key(&segid) {
            return Err(HobbesError::already_exists(format!("segment {}", segid)));
        }
        db.segments.insert(
            segid,
            SegmentRow {
                segid,
                name: name.map(str::to_string),
                enclave,
                app,
            },
        );
        Ok(())
    }

    pub fn delete_segment(&self, segid: SegId) -> Result<()> {
        let mut db = self.write()?;
        db.segments
            .remove(&segid)
            .map(|_| ())
            .ok_or_else(|| HobbesError::not_found(format!("segment {}", segid)))
    }

    pub fn list_segments(&self) -> Result<Vec<SegmentInfo>> {
        let db = self.read()?;
        Ok(db.segments.values().map(SegmentInfo::from).collect())
    }

    /// Resolve a named export to its segment id.
    pub fn lookup_segment(&self, name: &str) -> Result<SegId> {
        let db = self.read()?;
        db.segments
            .values()
            .find(|row| row.name.as_deref() == Some(name))
            .map(|row| row.segid)
            .ok_or_else(|| HobbesError::not_found(format!("segment '{}'", name)))
    }

    pub fn segment_name(&self, segid: SegId) -> Result<Option<String>> {
        let db = self.read()?;
        db.segments
            .get(&segid)
            .map(|row| row.name.clone())
            .ok_or_else(|| HobbesError::not_found(format!("segment {}", segid)))
    }

    /// Drop every segment row advertised by the given enclave.
    pub fn delete_enclave_segments(&self, enclave: EnclaveId) -> Result<()> {
        let mut db = self.write()?;
        db.segments.retain(|_, row| row.enclave != Some(enclave));
        Ok(())
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use hobbes_core::EnclaveType;

    use crate::registry::testutil::fresh_registry;

    #[test]
    fn segment_rows_round_trip() {
        let registry = fresh_registry();
        let master = registry
            .create_enclave(Some("master"), EnclaveType::Master, None)
            .unwrap();

        registry
            .create_segment(900, Some("master-cmdq"), Some(master), None)
            .unwrap();
        assert!(registry
            .create_segment(900, Some("dup"), None, None)
            .is_err());

        assert_eq!(registry.lookup_segment("master-cmdq").unwrap(), 900);
        assert_eq!(
            registry.segment_name(900).unwrap().as_deref(),
            Some("master-cmdq")
        );

        registry.create_segment(901, None, Some(master), None).unwrap();
        assert_eq!(registry.list_segments().unwrap().len(), 2);

        registry.delete_enclave_segments(master).unwrap();
        assert!(registry.list_segments().unwrap().is_empty());
        assert!(registry.lookup_segment("master-cmdq").is_err());
    }
}
