//! Command queue server side

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{Arc, RwLockReadGuard, RwLockWriteGuard};

use xemem::{Apid, SegId};

use super::{CmdId, CmdStatus, QueueDb, QueueState};
use crate::error::{HobbesError, Result};

/// The serving end of a command queue.
///
/// Dropping the server withdraws the queue segment; commands still pending
/// are lost and their clients keep waiting (watchdogs live above this
/// layer).
pub struct CmdServer {
    db: Arc<QueueDb>,
    signal: xemem::SignalFd,
    /// Resolved client reply segments, so repeat issuers are kicked without
    /// a lookup per reply.
    connections: HashMap<SegId, Apid>,
}

impl CmdServer {
    /// Allocate the queue store and export it as a signalled segment.
    pub fn create() -> Result<CmdServer> {
        let db: Arc<QueueDb> = Arc::new(QueueDb::default());
        let (_, signal) = xemem::make_signalled(db.clone(), None)?;
        Ok(CmdServer {
            db,
            signal,
            connections: HashMap::new(),
        })
    }

    /// The externally visible queue segment id.
    pub fn segid(&self) -> SegId {
        self.signal.segid()
    }

    /// The fd to multiplex for incoming commands.
    pub fn fd(&self) -> RawFd {
        self.signal.as_raw_fd()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, QueueState>> {
        self.db
            .read()
            .map_err(|_| HobbesError::catastrophic("command queue lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, QueueState>> {
        self.db
            .write()
            .map_err(|_| HobbesError::catastrophic("command queue lock poisoned"))
    }

    /// Take the next pending command, advancing the pending cursor.
    ///
    /// Also quiesces the signal fd, so a caller that drains until `None`
    /// leaves no stale readiness behind even when signals coalesced.
    pub fn get_next_cmd(&mut self) -> Result<Option<CmdId>> {
        let mut queue = self.write()?;

        self.signal.ack()?;

        if queue.outstanding == 0 {
            return Ok(None);
        }
        let cmd = queue.pending;
        queue.pending += 1;
        queue.outstanding -= 1;
        Ok(Some(CmdId(cmd)))
    }

    pub fn cmd_code(&self, cmd: CmdId) -> Result<u64> {
        let queue = self.read()?;
        queue
            .cmds
            .get(&cmd.0)
            .map(|row| row.code)
            .ok_or_else(|| HobbesError::not_found(format!("command {}", cmd)))
    }

    /// Copy of the request payload.
    pub fn cmd_data(&self, cmd: CmdId) -> Result<Vec<u8>> {
        let queue = self.read()?;
        queue
            .cmds
            .get(&cmd.0)
            .map(|row| row.data.clone())
            .ok_or_else(|| HobbesError::not_found(format!("command {}", cmd)))
    }

    /// Write the reply fields, flip the command to Returned, and kick the
    /// issuer's reply segment.
    ///
    /// The kick is best effort: a client that vanished before reading its
    /// reply must not fail the server.
    pub fn cmd_return(&mut self, cmd: CmdId, ret_code: i64, data: &[u8]) -> Result<()> {
        let reply_segid = {
            let mut queue = self.write()?;
            let row = queue
                .cmds
                .get_mut(&cmd.0)
                .ok_or_else(|| HobbesError::not_found(format!("command {}", cmd)))?;
            row.ret_code = ret_code;
            row.ret_data = data.to_vec();
            row.status = CmdStatus::Returned;
            row.reply_segid
        };

        if reply_segid == xemem::INVALID_SEGID {
            return Ok(());
        }

        let apid = match self.connections.get(&reply_segid) {
            Some(apid) => *apid,
            None => match xemem::get(reply_segid) {
                Ok(apid) => {
                    self.connections.insert(reply_segid, apid);
                    apid
                }
                Err(e) => {
                    log::warn!(
                        "Cannot resolve reply segment {} for command {}: {}",
                        reply_segid,
                        cmd,
                        e
                    );
                    return Ok(());
                }
            },
        };

        if let Err(e) = apid.signal() {
            log::warn!("Cannot kick client for command {}: {}", cmd, e);
        }
        Ok(())
    }

    /// Log the queue header and every live command row.
    pub fn dump_queue(&self) -> Result<()> {
        let queue = self.read()?;
        log::info!(
            "HCQ -- outstanding: {} ; pending cursor: {}",
            queue.outstanding,
            queue.pending
        );
        for (id, row) in &queue.cmds {
            log::info!(
                "CMD {}: code={}, size={}, status={:?}, reply_segid={}, ret_code={}, ret_size={}",
                id,
                row.code,
                row.data.len(),
                row.status,
                row.reply_segid,
                row.ret_code,
                row.ret_data.len()
            );
        }
        Ok(())
    }
}
