//! Daemon logging
//!
//! Log lines carry the process's place in the fabric: every process names
//! the enclave (and, for launched applications, the app row) it speaks as,
//! taken from the process identity contract, plus the time since the logger
//! came up. The level is read from `HOBBES_LOG_LEVEL`.

use std::io::Write;
use std::sync::OnceLock;
use std::time::Instant;

use log::{LevelFilter, Metadata, Record};

struct FabricLogger {
    level: LevelFilter,
    identity: String,
    start: Instant,
}

static LOGGER: OnceLock<FabricLogger> = OnceLock::new();

impl FabricLogger {
    fn from_env() -> FabricLogger {
        let level = std::env::var(hobbes_core::ENV_LOG_LEVEL)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(LevelFilter::Info);

        // Processes identify themselves by their registry rows; anything
        // launched outside the fabric logs as the bare node.
        let identity = match (crate::my_enclave_id(), crate::my_app_id()) {
            (Some(enclave), Some(app)) => format!("enclave {} app {}", enclave, app),
            (Some(enclave), None) => format!("enclave {}", enclave),
            _ => String::from("node"),
        };

        FabricLogger {
            level,
            identity,
            start: Instant::now(),
        }
    }
}

impl log::Log for FabricLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let uptime = self.start.elapsed();
        let mut err = std::io::stderr().lock();
        let _ = writeln!(
            err,
            "[{:>4}.{:03}] {} {} {}: {}",
            uptime.as_secs(),
            uptime.subsec_millis(),
            self.identity,
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Install the fabric logger. Safe to call more than once; the first call
/// pins the level and identity.
pub fn init() {
    let logger = LOGGER.get_or_init(FabricLogger::from_env);
    if log::set_logger(logger).is_ok() {
        log::set_max_level(logger.level);
    }
}
