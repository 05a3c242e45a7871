//! Cross-enclave shared memory segments
//!
//! This crate names the interface the Hobbes fabric uses to export and reach
//! cross-enclave memory segments: `make` / `make_signalled` to export,
//! `get` + `attach` to reach, `signal` / `ack` to kick and drain the
//! signalled file descriptor, `remove` to withdraw an export.
//!
//! The backend here is the process-local reference implementation: a global
//! segment table handing out `Arc` payloads, with signalled segments backed
//! by an eventfd. Signals accumulate in the eventfd counter, so any number of
//! signals between two acks is delivered as one readiness event and a single
//! ack drains them all. The kernel transport that carries segments between
//! address spaces is an external collaborator with this same surface.

use std::any::Any;
use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use nix::sys::eventfd::{eventfd, EfdFlags};
use nix::unistd;
use thiserror::Error;

// ————————————————————————————————— Types —————————————————————————————————— //

/// Externally visible segment identifier.
pub type SegId = i64;

pub const INVALID_SEGID: SegId = -1;

/// Payload carried by a segment.
///
/// In the kernel-backed transport this is the raw shared region; the
/// reference backend hands the exporter's `Arc` straight to attachers.
pub type Payload = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Error)]
pub enum XememError {
    #[error("segment {0} does not exist")]
    NotFound(SegId),
    #[error("segment {0} already exists")]
    Exists(SegId),
    #[error("segment {0} is not signalled")]
    NotSignalled(SegId),
    #[error("segment payload has an unexpected type")]
    BadPayload,
    #[error("segment table is poisoned")]
    Poisoned,
    #[error("segment fd failure: {0}")]
    Io(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, XememError>;

// ————————————————————————————— Segment Table —————————————————————————————— //

struct SegmentEntry {
    payload: Payload,
    /// eventfd used to kick the segment owner, when signalled.
    signal_fd: Option<RawFd>,
}

struct SegmentTable {
    next_segid: SegId,
    segments: BTreeMap<SegId, SegmentEntry>,
}

impl SegmentTable {
    const fn new() -> Self {
        SegmentTable {
            // Dynamic ids start above the well-known range.
            next_segid: 1000,
            segments: BTreeMap::new(),
        }
    }
}

static SEGMENTS: Mutex<SegmentTable> = Mutex::new(SegmentTable::new());

fn with_table<T>(f: impl FnOnce(&mut SegmentTable) -> Result<T>) -> Result<T> {
    let mut table = SEGMENTS.lock().map_err(|_| XememError::Poisoned)?;
    f(&mut table)
}

fn insert(payload: Payload, signal_fd: Option<RawFd>, well_known: Option<SegId>) -> Result<SegId> {
    with_table(|table| {
        let segid = match well_known {
            Some(id) => {
                if table.segments.contains_key(&id) {
                    return Err(XememError::Exists(id));
                }
                id
            }
            None => {
                let id = table.next_segid;
                table.next_segid += 1;
                id
            }
        };
        table.segments.insert(segid, SegmentEntry { payload, signal_fd });
        Ok(segid)
    })
}

// ————————————————————————————— Export / Remove ———————————————————————————— //

/// Export a segment, optionally under a well-known id.
pub fn make(payload: Payload, well_known: Option<SegId>) -> Result<SegId> {
    insert(payload, None, well_known)
}

/// Export a signalled segment.
///
/// Returns the segment id and the owner's end of the signal channel. The
/// owner polls the fd for readiness and acks it to drain pending signals.
pub fn make_signalled(payload: Payload, well_known: Option<SegId>) -> Result<(SegId, SignalFd)> {
    let fd = eventfd(0, EfdFlags::EFD_NONBLOCK)?;
    let segid = match insert(payload, Some(fd), well_known) {
        Ok(segid) => segid,
        Err(e) => {
            let _ = unistd::close(fd);
            return Err(e);
        }
    };
    Ok((segid, SignalFd { segid, fd }))
}

/// Withdraw a segment export. Existing attachments stay valid.
pub fn remove(segid: SegId) -> Result<()> {
    with_table(|table| {
        table
            .segments
            .remove(&segid)
            .map(|_| ())
            .ok_or(XememError::NotFound(segid))
    })
}

// —————————————————————————————— Get / Attach —————————————————————————————— //

/// An access handle to an exported segment.
#[derive(Debug, Clone, Copy)]
pub struct Apid {
    segid: SegId,
}

impl Apid {
    pub fn segid(&self) -> SegId {
        self.segid
    }

    /// Map the segment payload into this address space.
    pub fn attach<T: Any + Send + Sync>(&self) -> Result<Arc<T>> {
        let payload = with_table(|table| {
            table
                .segments
                .get(&self.segid)
                .map(|entry| entry.payload.clone())
                .ok_or(XememError::NotFound(self.segid))
        })?;
        payload.downcast().map_err(|_| XememError::BadPayload)
    }

    /// Kick the segment owner.
    pub fn signal(&self) -> Result<()> {
        signal_segid(self.segid)
    }
}

/// Resolve a segment id into an access handle.
pub fn get(segid: SegId) -> Result<Apid> {
    with_table(|table| {
        if table.segments.contains_key(&segid) {
            Ok(Apid { segid })
        } else {
            Err(XememError::NotFound(segid))
        }
    })
}

/// Signal a segment directly by id.
pub fn signal_segid(segid: SegId) -> Result<()> {
    with_table(|table| {
        let entry = table
            .segments
            .get(&segid)
            .ok_or(XememError::NotFound(segid))?;
        let fd = entry.signal_fd.ok_or(XememError::NotSignalled(segid))?;
        unistd::write(fd, &1u64.to_ne_bytes())?;
        Ok(())
    })
}

// ——————————————————————————————— Signal Fd ———————————————————————————————— //

/// The owner's end of a signalled segment.
///
/// Dropping the handle withdraws the export and closes the fd.
#[derive(Debug)]
pub struct SignalFd {
    segid: SegId,
    fd: RawFd,
}

impl SignalFd {
    pub fn segid(&self) -> SegId {
        self.segid
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Drain all signals delivered since the last ack.
    pub fn ack(&self) -> Result<u64> {
        ack(self.fd)
    }
}

impl Drop for SignalFd {
    fn drop(&mut self) {
        // The entry must leave the table before the fd closes so no signaller
        // can write to a reused descriptor.
        let _ = remove(self.segid);
        if let Err(e) = unistd::close(self.fd) {
            log::warn!("Failed to close signal fd for segment {}: {}", self.segid, e);
        }
    }
}

/// Drain all pending signals on a signalled fd.
///
/// Returns the number of coalesced signals, 0 if none were pending.
pub fn ack(fd: RawFd) -> Result<u64> {
    let mut buf = [0u8; 8];
    match unistd::read(fd, &mut buf) {
        Ok(_) => Ok(u64::from_ne_bytes(buf)),
        Err(Errno::EAGAIN) => Ok(0),
        Err(e) => Err(XememError::Io(e)),
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_get_attach() {
        let payload: Payload = Arc::new(String::from("registry"));
        let segid = make(payload, None).unwrap();

        let apid = get(segid).unwrap();
        let attached: Arc<String> = apid.attach().unwrap();
        assert_eq!(attached.as_str(), "registry");

        // Wrong payload type is rejected.
        assert!(apid.attach::<u64>().is_err());

        remove(segid).unwrap();
        assert!(get(segid).is_err());
    }

    #[test]
    fn well_known_ids_are_exclusive() {
        let segid = make(Arc::new(0u8), Some(901)).unwrap();
        assert_eq!(segid, 901);
        assert!(matches!(
            make(Arc::new(0u8), Some(901)),
            Err(XememError::Exists(901))
        ));
        remove(segid).unwrap();
    }

    #[test]
    fn signals_coalesce_until_acked() {
        let (segid, fd) = make_signalled(Arc::new(()), None).unwrap();

        let apid = get(segid).unwrap();
        apid.signal().unwrap();
        apid.signal().unwrap();
        signal_segid(segid).unwrap();

        assert_eq!(fd.ack().unwrap(), 3);
        assert_eq!(fd.ack().unwrap(), 0);
    }

    #[test]
    fn dropping_the_owner_withdraws_the_export() {
        let (segid, fd) = make_signalled(Arc::new(()), None).unwrap();
        drop(fd);
        assert!(get(segid).is_err());
    }
}
