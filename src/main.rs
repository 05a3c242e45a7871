//! Hobbes init task daemon
//!
//! Every enclave runs one of these. The master instance creates the
//! registry from a node description file, reserves its own resources, and
//! enters the command loop; hosted instances attach the registry using the
//! enclave identity from their environment and do the same.

use std::path::PathBuf;

use clap::Parser;
use hobbes::error::{HobbesError, Result};
use hobbes::inittask::InitTask;
use hobbes::nodecfg::NodeConfig;
use hobbes::registry::Registry;
use hobbes::{logger, my_enclave_id};
use hobbes_core::{EnclaveId, EnclaveType};

#[derive(Parser)]
#[command(name = "hobbes-init", about = "Hobbes enclave init task")]
struct Args {
    /// Boot as the master enclave, creating the registry.
    #[arg(long)]
    master: bool,

    /// Node description file (master only).
    #[arg(long, default_value = "hobbes.toml")]
    config: PathBuf,

    /// Number of CPUs to reserve for the master enclave.
    #[arg(short = 'c', long)]
    cpus: Option<u32>,

    /// Reserve this comma separated list of CPU ids instead.
    #[arg(long)]
    cpulist: Option<String>,

    /// NUMA node reservations are drawn from.
    #[arg(short = 'n', long)]
    numa: Option<u32>,

    /// Memory to reserve for the master enclave, in MiB.
    #[arg(short = 'm', long)]
    mem: Option<u64>,
}

fn main() {
    logger::init();
    let args = Args::parse();

    let status = if args.master {
        master_init(&args)
    } else {
        hosted_init()
    };

    if let Err(e) = status {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

// —————————————————————————————— Master Boot ——————————————————————————————— //

fn reserve_cpu_list(registry: &Registry, cpu_list: &str) -> Result<()> {
    for entry in cpu_list.split(',') {
        let cpu_id: u32 = entry
            .trim()
            .parse()
            .map_err(|_| HobbesError::invalid(format!("bad CPU id '{}'", entry)))?;
        registry.alloc_cpu(Some(cpu_id), None, EnclaveId::MASTER)?;
    }
    Ok(())
}

fn reserve_cpus(registry: &Registry, num_cpus: u32, numa: Option<u32>) -> Result<()> {
    for _ in 0..num_cpus {
        registry.alloc_cpu(None, numa, EnclaveId::MASTER)?;
    }
    Ok(())
}

fn reserve_memory(registry: &Registry, mem_size_mb: u64, numa: Option<u32>) -> Result<()> {
    let bytes = mem_size_mb * 1024 * 1024;
    let blocks = bytes.div_ceil(registry.block_size()?) as u32;
    registry.alloc_blocks(EnclaveId::MASTER, numa, blocks, 1)?;
    Ok(())
}

fn master_init(args: &Args) -> Result<()> {
    if args.cpulist.is_some() && args.cpus.is_some() {
        return Err(HobbesError::invalid(
            "cannot use both --cpus and --cpulist at the same time",
        ));
    }

    let registry = Registry::create()?;

    // Describe the node. A platform-generated map is the normal case; a
    // small synthetic node keeps bring-up possible without one.
    let config = if args.config.exists() {
        NodeConfig::load(&args.config)?
    } else {
        log::warn!(
            "No node config at {}, booting a synthetic node",
            args.config.display()
        );
        NodeConfig::synthetic(1, 4, 8)
    };
    config.populate(&registry)?;

    registry.create_enclave(Some("master"), EnclaveType::Master, None)?;

    // Reserve the master's own share before anyone else can claim it.
    if let Some(cpu_list) = &args.cpulist {
        reserve_cpu_list(&registry, cpu_list)?;
    } else if let Some(num_cpus) = args.cpus {
        reserve_cpus(&registry, num_cpus, args.numa)?;
    } else {
        reserve_cpu_list(&registry, "0")?;
    }
    reserve_memory(&registry, args.mem.unwrap_or(1024), args.numa)?;

    log::info!(
        "Master enclave up: {} CPUs, {} MiB free",
        registry.free_cpu_count()?,
        registry.free_mem_bytes()? / (1024 * 1024)
    );

    InitTask::new(registry, EnclaveId::MASTER)?.run()
}

// ——————————————————————————————— Hosted Boot —————————————————————————————— //

fn hosted_init() -> Result<()> {
    let enclave_id = my_enclave_id().ok_or_else(|| {
        HobbesError::invalid("not inside a Hobbes enclave (HOBBES_ENCLAVE_ID is unset)")
    })?;

    let registry = Registry::open()?;
    log::info!(
        "Joining as enclave {} ({})",
        enclave_id,
        registry.enclave_name(enclave_id)?
    );

    InitTask::new(registry, enclave_id)?.run()
}
