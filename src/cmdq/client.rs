//! Command queue client side

use std::sync::{Arc, RwLockReadGuard, RwLockWriteGuard};

use nix::poll::{poll, PollFd, PollFlags};
use xemem::{Apid, SegId};

use super::{CmdId, CmdStatus, CommandRow, QueueDb, QueueState};
use crate::error::{HobbesError, Result};

/// The issuing end of a command queue.
///
/// Each client carries its own signalled reply segment; the server kicks it
/// when a command completes. Dropping the client withdraws the reply
/// segment.
#[derive(Debug)]
pub struct CmdClient {
    server: Apid,
    db: Arc<QueueDb>,
    reply: xemem::SignalFd,
}

impl CmdClient {
    /// Attach the queue exported under `segid`.
    pub fn connect(segid: SegId) -> Result<CmdClient> {
        let (_, reply) = xemem::make_signalled(Arc::new(()), None)?;
        let server = xemem::get(segid)?;
        let db: Arc<QueueDb> = server.attach()?;
        Ok(CmdClient { server, db, reply })
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

    /// Append a Pending command and kick the server.
    pub fn cmd_issue(&self, code: u64, data: &[u8]) -> Result<CmdId> {
        let cmd = {
            let mut queue = self.write()?;
            let cmd = queue.next_avail;
            queue.cmds.insert(
                cmd,
                CommandRow {
                    code,
                    data: data.to_vec(),
                    reply_segid: self.reply.segid(),
                    status: CmdStatus::Pending,
                    ret_code: 0,
                    ret_data: Vec::new(),
                },
            );
            queue.next_avail += 1;
            queue.outstanding += 1;
            cmd
        };

        self.server.signal()?;
        Ok(CmdId(cmd))
    }

    /// Block until the command flips to Returned.
    ///
    /// Wakeups are only hints: the status is rechecked on every one, so
    /// spurious or coalesced signals are harmless.
    pub fn wait(&self, cmd: CmdId) -> Result<()> {
        loop {
            if self.cmd_status(cmd)? == CmdStatus::Returned {
                return Ok(());
            }
            let mut fds = [PollFd::new(self.reply.as_raw_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, -1) {
                Ok(_) => {
                    self.reply.ack()?;
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    return Err(HobbesError::transport(format!(
                        "poll on reply fd failed: {}",
                        e
                    )))
                }
            }
        }
    }

    pub fn cmd_status(&self, cmd: CmdId) -> Result<CmdStatus> {
        let queue = self.read()?;
        queue
            .cmds
            .get(&cmd.0)
            .map(|row| row.status)
            .ok_or_else(|| HobbesError::not_found(format!("command {}", cmd)))
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

    pub fn ret_code(&self, cmd: CmdId) -> Result<i64> {
        let queue = self.read()?;
        queue
            .cmds
            .get(&cmd.0)
            .map(|row| row.ret_code)
            .ok_or_else(|| HobbesError::not_found(format!("command {}", cmd)))
    }

    /// Copy of the reply payload.
    pub fn ret_data(&self, cmd: CmdId) -> Result<Vec<u8>> {
        let queue = self.read()?;
        queue
            .cmds
            .get(&cmd.0)
            .map(|row| row.ret_data.clone())
            .ok_or_else(|| HobbesError::not_found(format!("command {}", cmd)))
    }

    /// Delete a completed command row.
    pub fn cmd_complete(&self, cmd: CmdId) -> Result<()> {
        let mut queue = self.write()?;
        queue
            .cmds
            .remove(&cmd.0)
            .map(|_| ())
            .ok_or_else(|| HobbesError::not_found(format!("command {}", cmd)))
    }

    /// Issue, await the reply, and clean up in one call.
    ///
    /// Returns the reply code and a copy of the reply payload.
    pub fn submit(&self, code: u64, data: &[u8]) -> Result<(i64, Vec<u8>)> {
        let cmd = self.cmd_issue(code, data)?;
        self.wait(cmd)?;
        let ret_code = self.ret_code(cmd)?;
        let ret_data = self.ret_data(cmd)?;
        self.cmd_complete(cmd)?;
        Ok((ret_code, ret_data))
    }
}
