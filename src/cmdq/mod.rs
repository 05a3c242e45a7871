//! Cross-enclave command queues
//!
//! A command queue is a record store exported as a signalled segment: a
//! header row carrying the next-available command id, the pending cursor and
//! the outstanding count, plus one row per in-flight command. Clients append
//! Pending commands and kick the server's fd; the server serves them
//! strictly in id order and kicks each client's reply segment when the
//! command flips to Returned.
//!
//! If a server dies while a command is Pending the client waits forever;
//! watchdogs belong to the lifecycle layer above. If a client dies before
//! reading a reply the row simply stays Returned until the queue goes away.

mod client;
mod server;

use std::collections::BTreeMap;
use std::sync::RwLock;

pub use client::CmdClient;
pub use server::CmdServer;
use xemem::SegId;

/// Identifier of one command within one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CmdId(pub u64);

impl std::fmt::Display for CmdId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdStatus {
    Pending,
    Returned,
}

#[derive(Debug)]
pub(crate) struct CommandRow {
    pub(crate) code: u64,
    pub(crate) data: Vec<u8>,
    /// Where to signal on completion.
    pub(crate) reply_segid: SegId,
    pub(crate) status: CmdStatus,
    pub(crate) ret_code: i64,
    pub(crate) ret_data: Vec<u8>,
}

#[derive(Debug, Default)]
pub(crate) struct QueueState {
    /// Next command id handed to an issuer.
    pub(crate) next_avail: u64,
    /// Next command the server will serve.
    pub(crate) pending: u64,
    /// Commands issued but not yet served.
    pub(crate) outstanding: u64,
    pub(crate) cmds: BTreeMap<u64, CommandRow>,
}

pub(crate) type QueueDb = RwLock<QueueState>;

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;

    use nix::poll::{poll, PollFd, PollFlags};

    use super::*;

    /// One server thread echoing every command payload back with code 0.
    fn spawn_echo_server(served: u32) -> (SegId, thread::JoinHandle<Vec<u64>>) {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let mut server = CmdServer::create().unwrap();
            tx.send(server.segid()).unwrap();

            let mut order = Vec::new();
            while order.len() < served as usize {
                let mut fds = [PollFd::new(server.fd(), PollFlags::POLLIN)];
                match poll(&mut fds, -1) {
                    Ok(_) => {}
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => panic!("poll failed: {}", e),
                }
                while let Some(cmd) = server.get_next_cmd().unwrap() {
                    order.push(cmd.0);
                    let data = server.cmd_data(cmd).unwrap();
                    server.cmd_return(cmd, 0, &data).unwrap();
                }
            }
            order
        });
        (rx.recv().unwrap(), handle)
    }

    #[test]
    fn ping_round_trip() {
        let (segid, server) = spawn_echo_server(1);
        let client = CmdClient::connect(segid).unwrap();

        // "hello" with the trailing NUL, as it travels on the wire.
        let payload = b"hello\0";
        let (ret, data) = client.submit(2100, payload).unwrap();
        assert_eq!(ret, 0);
        assert_eq!(data, payload);

        server.join().unwrap();
    }

    #[test]
    fn pending_flips_to_returned_exactly_once() {
        let (segid, server) = spawn_echo_server(1);
        let client = CmdClient::connect(segid).unwrap();

        let cmd = client.cmd_issue(2100, b"x").unwrap();
        client.wait(cmd).unwrap();
        assert_eq!(client.cmd_status(cmd).unwrap(), CmdStatus::Returned);
        assert_eq!(client.ret_code(cmd).unwrap(), 0);
        assert_eq!(client.ret_data(cmd).unwrap(), b"x");

        client.cmd_complete(cmd).unwrap();
        assert!(client.cmd_status(cmd).is_err());

        server.join().unwrap();
    }

    #[test]
    fn commands_are_served_in_issue_order() {
        // Issue several commands before the server starts serving; ids must
        // come back monotonic.
        let mut server = CmdServer::create().unwrap();
        let client = CmdClient::connect(server.segid()).unwrap();

        let a = client.cmd_issue(2100, b"a").unwrap();
        let b = client.cmd_issue(2100, b"b").unwrap();
        let c = client.cmd_issue(2100, b"c").unwrap();
        assert!(a < b && b < c);

        let mut served = Vec::new();
        while let Some(cmd) = server.get_next_cmd().unwrap() {
            served.push(cmd.0);
            server.cmd_return(cmd, 7, b"").unwrap();
        }
        assert_eq!(served, vec![a.0, b.0, c.0]);
        assert_eq!(client.ret_code(a).unwrap(), 7);

        // The queue is drained.
        assert!(server.get_next_cmd().unwrap().is_none());
    }

    #[test]
    fn concurrent_clients_interleave_consistently() {
        let (segid, server) = spawn_echo_server(8);

        let mut clients = Vec::new();
        for i in 0..4u8 {
            clients.push(thread::spawn(move || {
                let client = CmdClient::connect(segid).unwrap();
                for _ in 0..2 {
                    let (ret, data) = client.submit(2100, &[i]).unwrap();
                    assert_eq!(ret, 0);
                    assert_eq!(data, vec![i]);
                }
            }));
        }
        for c in clients {
            c.join().unwrap();
        }

        let order = server.join().unwrap();
        // The server saw one monotonic sequence of ids.
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(order, sorted);
        assert_eq!(order.len(), 8);
    }
}
