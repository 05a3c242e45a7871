//! Hobbes core definitions
//!
//! This crate holds the type and constant definitions shared by every part of
//! the Hobbes fabric: typed row identifiers, lifecycle states, the command
//! code namespace, notifier event bits, and the process environment contract.
//! In particular this crate does not hold any behavior, only the stable
//! definitions other crates (the fabric itself, init tasks, and external
//! tooling) agree on.

use std::fmt;

use bitflags::bitflags;

// ————————————————————————————— Well-Known Ids ————————————————————————————— //

/// Segment id under which the master registry is exported.
pub const MASTER_DB_SEGID: i64 = 1;

/// Size of the master registry region, in bytes.
pub const MASTER_DB_SIZE: u64 = 64 * 1024 * 1024;

/// Size of a command queue region, in bytes.
pub const CMD_QUEUE_SIZE: u64 = 16 * 1024 * 1024;

/// Default memory block size (the unit of all memory accounting).
pub const DEFAULT_BLOCK_SIZE: u64 = 128 * 1024 * 1024;

// ——————————————————————————— Environment Contract ————————————————————————— //

/// Environment variables passed to every launched Hobbes process.
pub const ENV_ENCLAVE_ID: &str = "HOBBES_ENCLAVE_ID";
pub const ENV_APP_ID: &str = "HOBBES_APP_ID";
pub const ENV_PROCESS_ID: &str = "HOBBES_PROCESS_ID";

/// Log level selector honored by the init-task daemon.
pub const ENV_LOG_LEVEL: &str = "HOBBES_LOG_LEVEL";

// —————————————————————————————— Typed Row Ids ————————————————————————————— //

/// Identifier of an enclave row in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EnclaveId(pub i32);

impl EnclaveId {
    /// The master enclave owns the registry and always has the well-known id.
    pub const MASTER: EnclaveId = EnclaveId(0);

    /// Sentinel used only on the wire; in-memory rows use `Option`.
    pub const INVALID: EnclaveId = EnclaveId(-1);

    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for EnclaveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an application row in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AppId(pub i32);

impl AppId {
    pub const INVALID: AppId = AppId(-1);

    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ————————————————————————————— Enclave States ————————————————————————————— //

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnclaveType {
    Invalid,
    Master,
    Pisces,
    Vm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnclaveState {
    Initialized,
    Running,
    Stopped,
    Crashed,
    Error,
}

impl EnclaveState {
    /// Terminal states trigger an enclave notifier event.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EnclaveState::Stopped | EnclaveState::Crashed | EnclaveState::Error
        )
    }
}

impl fmt::Display for EnclaveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnclaveState::Initialized => "Initialized",
            EnclaveState::Running => "Running",
            EnclaveState::Stopped => "Stopped",
            EnclaveState::Crashed => "Crashed",
            EnclaveState::Error => "Error",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for EnclaveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnclaveType::Invalid => "invalid",
            EnclaveType::Master => "master",
            EnclaveType::Pisces => "pisces",
            EnclaveType::Vm => "vm",
        };
        write!(f, "{}", s)
    }
}

// ———————————————————————————— Application States —————————————————————————— //

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Initialized,
    Running,
    Stopped,
    Crashed,
    Error,
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AppState::Initialized => "Initialized",
            AppState::Running => "Running",
            AppState::Stopped => "Stopped",
            AppState::Crashed => "Crashed",
            AppState::Error => "Error",
        };
        write!(f, "{}", s)
    }
}

// ————————————————————————————— Resource States ———————————————————————————— //

/// State of a CPU or memory block row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Invalid,
    Reserved,
    Free,
    Allocated,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceState::Invalid => "INVALID",
            ResourceState::Reserved => "RSVD",
            ResourceState::Free => "FREE",
            ResourceState::Allocated => "ALLOCATED",
        };
        write!(f, "{}", s)
    }
}

// —————————————————————————————— Command Codes ————————————————————————————— //

/// The stable 64 bit command code namespace served over enclave command
/// queues. Values are part of the wire contract and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum CmdCode {
    AddCpu = 1000,
    AddMem = 1001,
    RemoveCpu = 1010,
    RemoveMem = 1011,
    LoadFile = 1100,
    // Legacy single-enclave VM controls, kept as reserved values.
    VmLaunchLegacy = 1500,
    VmDestroyLegacy = 1501,
    AppLaunch = 2000,
    AppKill = 2001,
    Ping = 2100,
    Shutdown = 2150,
    FileOpen = 2200,
    FileClose = 2201,
    FileRead = 2202,
    FileWrite = 2203,
    FileStat = 2204,
    FileFStat = 2205,
    FileSeek = 2206,
    VmLaunch = 2300,
    VmDestroy = 2301,
}

impl CmdCode {
    pub fn from_u64(code: u64) -> Option<CmdCode> {
        let code = match code {
            1000 => CmdCode::AddCpu,
            1001 => CmdCode::AddMem,
            1010 => CmdCode::RemoveCpu,
            1011 => CmdCode::RemoveMem,
            1100 => CmdCode::LoadFile,
            1500 => CmdCode::VmLaunchLegacy,
            1501 => CmdCode::VmDestroyLegacy,
            2000 => CmdCode::AppLaunch,
            2001 => CmdCode::AppKill,
            2100 => CmdCode::Ping,
            2150 => CmdCode::Shutdown,
            2200 => CmdCode::FileOpen,
            2201 => CmdCode::FileClose,
            2202 => CmdCode::FileRead,
            2203 => CmdCode::FileWrite,
            2204 => CmdCode::FileStat,
            2205 => CmdCode::FileFStat,
            2206 => CmdCode::FileSeek,
            2300 => CmdCode::VmLaunch,
            2301 => CmdCode::VmDestroy,
            _ => return None,
        };
        Some(code)
    }
}

impl From<CmdCode> for u64 {
    fn from(code: CmdCode) -> u64 {
        code as u64
    }
}

// —————————————————————————————— Notifier Events ——————————————————————————— //

bitflags! {
    /// Event classes a notifier can subscribe to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventMask: u64 {
        const ENCLAVE     = 0x1;
        const RESOURCE    = 0x2;
        const APPLICATION = 0x4;
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmd_code_round_trip() {
        for code in [
            CmdCode::AddCpu,
            CmdCode::AddMem,
            CmdCode::RemoveMem,
            CmdCode::AppLaunch,
            CmdCode::AppKill,
            CmdCode::Ping,
            CmdCode::FileSeek,
            CmdCode::VmLaunch,
            CmdCode::VmDestroy,
        ] {
            assert_eq!(CmdCode::from_u64(code.into()), Some(code));
        }
        assert_eq!(CmdCode::from_u64(0), None);
        assert_eq!(CmdCode::from_u64(1999), None);
    }

    #[test]
    fn wire_values_are_stable() {
        assert_eq!(u64::from(CmdCode::AddCpu), 1000);
        assert_eq!(u64::from(CmdCode::RemoveMem), 1011);
        assert_eq!(u64::from(CmdCode::AppLaunch), 2000);
        assert_eq!(u64::from(CmdCode::AppKill), 2001);
        assert_eq!(u64::from(CmdCode::Ping), 2100);
    }

    #[test]
    fn event_mask_intersection() {
        let sub = EventMask::ENCLAVE | EventMask::APPLICATION;
        assert!(sub.intersects(EventMask::APPLICATION));
        assert!(!sub.intersects(EventMask::RESOURCE));
    }
}
