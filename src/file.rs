//! Remote file access
//!
//! File operations executed in another enclave over its command queue,
//! used when an enclave has no filesystem of its own. Transfers move at
//! most [`MAX_XFER_SIZE`] bytes per command; the client loops for larger
//! requests.

use std::fs::Metadata;
use std::os::unix::fs::{MetadataExt, PermissionsExt};

use bitflags::bitflags;
use hobbes_core::CmdCode;

use crate::cmdq::CmdClient;
use crate::error::{HobbesError, Result};
use crate::spec::FileOpenSpec;

/// Largest payload moved by one file command.
pub const MAX_XFER_SIZE: usize = 4096;

bitflags! {
    /// Open flags allowed across enclaves. Anything else is dropped by the
    /// serving side.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ     = 0x01;
        const WRITE    = 0x02;
        const APPEND   = 0x04;
        const CREATE   = 0x08;
        const EXCL     = 0x10;
        const TRUNCATE = 0x20;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set = 0,
    Cur = 1,
    End = 2,
}

/// A portable stat reply. A fixed encoding rather than a kernel `stat`
/// copy, so enclaves with different libcs agree on the layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub mode: u32,
    pub is_dir: bool,
}

impl FileStat {
    pub(crate) fn from_metadata(meta: &Metadata) -> FileStat {
        FileStat {
            size: meta.size(),
            mode: meta.permissions().mode(),
            is_dir: meta.is_dir(),
        }
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.mode.to_le_bytes());
        out.extend_from_slice(&u32::from(self.is_dir).to_le_bytes());
        out
    }

    pub(crate) fn decode(data: &[u8]) -> Result<FileStat> {
        if data.len() != 16 {
            return Err(HobbesError::invalid("stat reply is corrupt"));
        }
        Ok(FileStat {
            size: u64::from_le_bytes(data[0..8].try_into().unwrap()),
            mode: u32::from_le_bytes(data[8..12].try_into().unwrap()),
            is_dir: u32::from_le_bytes(data[12..16].try_into().unwrap()) != 0,
        })
    }
}

// ————————————————————————————— Request Encoding ——————————————————————————— //

pub(crate) fn decode_handle(data: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = data
        .try_into()
        .map_err(|_| HobbesError::invalid("file handle payload is corrupt"))?;
    Ok(u64::from_le_bytes(bytes))
}

fn encode_rd_req(handle: u64, size: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&handle.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out
}

pub(crate) fn decode_rd_req(data: &[u8]) -> Result<(u64, u64)> {
    if data.len() != 16 {
        return Err(HobbesError::invalid("read request is corrupt"));
    }
    Ok((
        u64::from_le_bytes(data[0..8].try_into().unwrap()),
        u64::from_le_bytes(data[8..16].try_into().unwrap()),
    ))
}

fn encode_wr_req(handle: u64, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + data.len());
    out.extend_from_slice(&handle.to_le_bytes());
    out.extend_from_slice(&(data.len() as u64).to_le_bytes());
    out.extend_from_slice(data);
    out
}

pub(crate) fn decode_wr_req(data: &[u8]) -> Result<(u64, &[u8])> {
    if data.len() < 16 {
        return Err(HobbesError::invalid("write request is corrupt"));
    }
    let handle = u64::from_le_bytes(data[0..8].try_into().unwrap());
    let size = u64::from_le_bytes(data[8..16].try_into().unwrap()) as usize;
    let body = &data[16..];
    if body.len() != size {
        return Err(HobbesError::invalid("write request length mismatch"));
    }
    Ok((handle, body))
}

fn encode_seek_req(handle: u64, offset: i64, whence: Whence) -> Vec<u8> {
    let mut out = Vec::with_capacity(20);
    out.extend_from_slice(&handle.to_le_bytes());
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&(whence as u32).to_le_bytes());
    out
}

pub(crate) fn decode_seek_req(data: &[u8]) -> Result<(u64, i64, u32)> {
    if data.len() != 20 {
        return Err(HobbesError::invalid("seek request is corrupt"));
    }
    Ok((
        u64::from_le_bytes(data[0..8].try_into().unwrap()),
        i64::from_le_bytes(data[8..16].try_into().unwrap()),
        u32::from_le_bytes(data[16..20].try_into().unwrap()),
    ))
}

fn submit(client: &CmdClient, code: CmdCode, data: &[u8], what: &str) -> Result<Vec<u8>> {
    let (ret, reply) = client.submit(code.into(), data)?;
    if ret != 0 {
        let msg = String::from_utf8_lossy(&reply);
        let msg = msg.trim_end_matches('\0').trim();
        return Err(HobbesError::transport(format!("{}: {}", what, msg)));
    }
    Ok(reply)
}

// —————————————————————————————— Client Handle ————————————————————————————— //

/// A file open in another enclave.
#[derive(Debug)]
pub struct RemoteFile<'a> {
    client: &'a CmdClient,
    handle: u64,
}

/// Open a file served by the enclave behind `client`.
pub fn open<'a>(client: &'a CmdClient, path: &str, flags: OpenFlags) -> Result<RemoteFile<'a>> {
    let spec = FileOpenSpec {
        path: path.to_string(),
        flags: flags.bits(),
    };
    let reply = submit(client, CmdCode::FileOpen, &spec.to_wire(), "open")?;
    Ok(RemoteFile {
        client,
        handle: decode_handle(&reply)?,
    })
}

/// Stat a path served by the enclave behind `client`.
pub fn stat(client: &CmdClient, path: &str) -> Result<FileStat> {
    let mut payload = path.as_bytes().to_vec();
    payload.push(0);
    let reply = submit(client, CmdCode::FileStat, &payload, "stat")?;
    FileStat::decode(&reply)
}

impl RemoteFile<'_> {
    /// Read into `buf`, looping per transfer cap. Returns the bytes read;
    /// short counts mean end of file.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let want = (buf.len() - done).min(MAX_XFER_SIZE);
            let reply = submit(
                self.client,
                CmdCode::FileRead,
                &encode_rd_req(self.handle, want as u64),
                "read",
            )?;
            if reply.is_empty() {
                break;
            }
            buf[done..done + reply.len()].copy_from_slice(&reply);
            done += reply.len();
            if reply.len() < want {
                break;
            }
        }
        Ok(done)
    }

    /// Write all of `data`, looping per transfer cap.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let mut done = 0;
        while done < data.len() {
            let chunk = &data[done..(done + MAX_XFER_SIZE).min(data.len())];
            let reply = submit(
                self.client,
                CmdCode::FileWrite,
                &encode_wr_req(self.handle, chunk),
                "write",
            )?;
            let written = decode_handle(&reply)? as usize;
            if written == 0 {
                break;
            }
            done += written;
        }
        Ok(done)
    }

    pub fn seek(&self, offset: i64, whence: Whence) -> Result<u64> {
        let reply = submit(
            self.client,
            CmdCode::FileSeek,
            &encode_seek_req(self.handle, offset, whence),
            "seek",
        )?;
        decode_handle(&reply)
    }

    pub fn fstat(&self) -> Result<FileStat> {
        let reply = submit(
            self.client,
            CmdCode::FileFStat,
            &self.handle.to_le_bytes(),
            "fstat",
        )?;
        FileStat::decode(&reply)
    }

    pub fn close(self) -> Result<()> {
        submit(
            self.client,
            CmdCode::FileClose,
            &self.handle.to_le_bytes(),
            "close",
        )?;
        Ok(())
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inittask::testutil::{master_node, shutdown_enclave, spawn_init_task};
    use crate::inittask::InitTask;
    use crate::lifecycle::open_enclave_cmdq;

    fn scratch_path(name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("hobbes-file-test-{}-{}", std::process::id(), name));
        path
    }

    #[test]
    fn write_seek_read_round_trip() {
        let (registry, master) = master_node();
        let handle = spawn_init_task(InitTask::new(registry.clone(), master).unwrap());
        let client = open_enclave_cmdq(&registry, master).unwrap();

        let path = scratch_path("rw");
        let path_str = path.to_str().unwrap();

        let file = open(
            &client,
            path_str,
            OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
        )
        .unwrap();

        // Span more than one transfer so the chunking loop is exercised.
        let payload: Vec<u8> = (0..MAX_XFER_SIZE + 100).map(|i| (i % 251) as u8).collect();
        assert_eq!(file.write(&payload).unwrap(), payload.len());

        assert_eq!(file.seek(0, Whence::Set).unwrap(), 0);
        let mut back = vec![0u8; payload.len()];
        assert_eq!(file.read(&mut back).unwrap(), payload.len());
        assert_eq!(back, payload);

        let st = file.fstat().unwrap();
        assert_eq!(st.size, payload.len() as u64);
        assert!(!st.is_dir);

        file.close().unwrap();

        let st = stat(&client, path_str).unwrap();
        assert_eq!(st.size, payload.len() as u64);

        std::fs::remove_file(&path).unwrap();
        shutdown_enclave(&registry, master, handle);
    }

    #[test]
    fn missing_files_surface_the_error_string() {
        let (registry, master) = master_node();
        let handle = spawn_init_task(InitTask::new(registry.clone(), master).unwrap());
        let client = open_enclave_cmdq(&registry, master).unwrap();

        let err = open(&client, "/nonexistent/hobbes", OpenFlags::READ).unwrap_err();
        assert!(err.to_string().contains("nonexistent"));

        assert!(stat(&client, "/nonexistent/hobbes").is_err());

        shutdown_enclave(&registry, master, handle);
    }

    #[test]
    fn stale_handles_are_rejected() {
        let (registry, master) = master_node();
        let handle = spawn_init_task(InitTask::new(registry.clone(), master).unwrap());
        let client = open_enclave_cmdq(&registry, master).unwrap();

        let path = scratch_path("stale");
        let file = open(
            &client,
            path.to_str().unwrap(),
            OpenFlags::WRITE | OpenFlags::CREATE,
        )
        .unwrap();
        let stolen = file.handle;
        file.close().unwrap();

        let ghost = RemoteFile {
            client: &client,
            handle: stolen,
        };
        assert!(ghost.fstat().is_err());

        std::fs::remove_file(&path).unwrap();
        shutdown_enclave(&registry, master, handle);
    }
}
