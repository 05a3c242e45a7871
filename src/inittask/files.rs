//! File service handlers
//!
//! Serves the remote file commands against this enclave's filesystem. Open
//! files live in a per-init-task handle table; transfers are bounded so a
//! single command never floods the queue region.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use hobbes_core::CmdCode;

use super::{CmdRequest, InitTask};
use crate::error::{HobbesError, Result};
use crate::file::{
    decode_handle, decode_rd_req, decode_seek_req, decode_wr_req, FileStat, OpenFlags,
    MAX_XFER_SIZE,
};
use crate::spec::FileOpenSpec;

#[derive(Default)]
pub(crate) struct FileTable {
    next_handle: u64,
    files: HashMap<u64, File>,
}

impl FileTable {
    fn get_mut(&mut self, handle: u64) -> Result<&mut File> {
        self.files
            .get_mut(&handle)
            .ok_or_else(|| HobbesError::not_found(format!("file handle {}", handle)))
    }
}

pub(crate) fn register_file_cmds(task: &mut InitTask) -> Result<()> {
    task.register_cmd(CmdCode::FileOpen.into(), file_open_cmd)?;
    task.register_cmd(CmdCode::FileClose.into(), file_close_cmd)?;
    task.register_cmd(CmdCode::FileRead.into(), file_read_cmd)?;
    task.register_cmd(CmdCode::FileWrite.into(), file_write_cmd)?;
    task.register_cmd(CmdCode::FileStat.into(), file_stat_cmd)?;
    task.register_cmd(CmdCode::FileFStat.into(), file_fstat_cmd)?;
    task.register_cmd(CmdCode::FileSeek.into(), file_seek_cmd)?;
    Ok(())
}

fn file_open_cmd(task: &mut InitTask, req: &CmdRequest) -> Result<Vec<u8>> {
    let spec = FileOpenSpec::from_wire(&req.data)?;
    // Unknown flag bits are dropped rather than trusted.
    let flags = OpenFlags::from_bits_truncate(spec.flags);

    let file = OpenOptions::new()
        .read(flags.contains(OpenFlags::READ) || !flags.contains(OpenFlags::WRITE))
        .write(flags.contains(OpenFlags::WRITE))
        .append(flags.contains(OpenFlags::APPEND))
        .create(flags.contains(OpenFlags::CREATE))
        .create_new(flags.contains(OpenFlags::EXCL))
        .truncate(flags.contains(OpenFlags::TRUNCATE))
        .open(&spec.path)
        .map_err(|e| HobbesError::not_found(format!("{}: {}", spec.path, e)))?;

    task.files.next_handle += 1;
    let handle = task.files.next_handle;
    task.files.files.insert(handle, file);

    Ok(handle.to_le_bytes().to_vec())
}

fn file_close_cmd(task: &mut InitTask, req: &CmdRequest) -> Result<Vec<u8>> {
    let handle = decode_handle(&req.data)?;
    task.files
        .files
        .remove(&handle)
        .ok_or_else(|| HobbesError::not_found(format!("file handle {}", handle)))?;
    Ok(Vec::new())
}

fn file_read_cmd(task: &mut InitTask, req: &CmdRequest) -> Result<Vec<u8>> {
    let (handle, size) = decode_rd_req(&req.data)?;
    let file = task.files.get_mut(handle)?;

    let size = size.min(MAX_XFER_SIZE as u64) as usize;
    let mut buf = vec![0u8; size];
    let n = file
        .read(&mut buf)
        .map_err(|e| HobbesError::transport(format!("read failed: {}", e)))?;
    buf.truncate(n);
    Ok(buf)
}

fn file_write_cmd(task: &mut InitTask, req: &CmdRequest) -> Result<Vec<u8>> {
    let (handle, data) = decode_wr_req(&req.data)?;
    let file = task.files.get_mut(handle)?;

    let data = &data[..data.len().min(MAX_XFER_SIZE)];
    let n = file
        .write(data)
        .map_err(|e| HobbesError::transport(format!("write failed: {}", e)))?;
    Ok((n as u64).to_le_bytes().to_vec())
}

fn file_seek_cmd(task: &mut InitTask, req: &CmdRequest) -> Result<Vec<u8>> {
    let (handle, offset, whence) = decode_seek_req(&req.data)?;
    let file = task.files.get_mut(handle)?;

    let pos = match whence {
        0 => SeekFrom::Start(offset as u64),
        1 => SeekFrom::Current(offset),
        2 => SeekFrom::End(offset),
        _ => return Err(HobbesError::invalid(format!("bad whence {}", whence))),
    };
    let pos = file
        .seek(pos)
        .map_err(|e| HobbesError::transport(format!("seek failed: {}", e)))?;
    Ok(pos.to_le_bytes().to_vec())
}

fn file_stat_cmd(_task: &mut InitTask, req: &CmdRequest) -> Result<Vec<u8>> {
    let path = match req.data.split_last() {
        Some((0, body)) => {
            std::str::from_utf8(body).map_err(|_| HobbesError::invalid("path is not UTF-8"))?
        }
        _ => return Err(HobbesError::invalid("path is not NUL-terminated")),
    };

    let meta = std::fs::metadata(path)
        .map_err(|e| HobbesError::not_found(format!("{}: {}", path, e)))?;
    Ok(FileStat::from_metadata(&meta).encode())
}

fn file_fstat_cmd(task: &mut InitTask, req: &CmdRequest) -> Result<Vec<u8>> {
    let handle = decode_handle(&req.data)?;
    let file = task.files.get_mut(handle)?;

    let meta = file
        .metadata()
        .map_err(|e| HobbesError::transport(format!("fstat failed: {}", e)))?;
    Ok(FileStat::from_metadata(&meta).encode())
}
