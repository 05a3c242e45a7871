//! Hobbes operator shell
//!
//! Command-line front end onto the coordination fabric: resource and
//! lifecycle listings, pings, application and VM launches. Every command
//! attaches the node's registry; `demo` instead boots a synthetic node
//! in-process and exercises the fabric end to end.
//!
//! Command results print straight to stdout; the fabric's own logging goes
//! to stderr through the library logger, with `--verbose` raising its
//! level.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use hobbes::error::{HobbesError, Result};
use hobbes::inittask::InitTask;
use hobbes::lifecycle::{self, open_enclave_cmdq};
use hobbes::nodecfg::NodeConfig;
use hobbes::registry::Registry;
use hobbes::spec::{AppSpec, VmSpec};
use hobbes_core::{AppId, AppState, CmdCode, EnclaveId, EnclaveType};

#[derive(Parser)]
#[command(name = "hobbes", about = "Hobbes node coordination shell")]
struct Cli {
    #[arg(short, long, action)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the node's resource summary.
    Info,
    /// List enclaves.
    ListEnclaves,
    /// List applications.
    ListApps,
    /// List CPUs.
    ListCpus,
    /// List memory blocks.
    ListMem,
    /// List exported segments.
    ListSegments,
    /// Ping an enclave's init task.
    Ping {
        enclave: String,
        #[arg(default_value = "hello")]
        payload: String,
    },
    /// Launch an application in an enclave.
    LaunchApp {
        enclave: String,
        path: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        argv: Option<String>,
        #[arg(long)]
        envp: Option<String>,
        #[arg(long)]
        ranks: Option<u32>,
        #[arg(long)]
        cpu_list: Option<String>,
        #[arg(long, action)]
        large_pages: bool,
        #[arg(long, action)]
        smartmap: bool,
        #[arg(long)]
        heap_size: Option<u64>,
        #[arg(long)]
        stack_size: Option<u64>,
    },
    /// Kill an application.
    KillApp { app_id: i32 },
    /// Create and launch a VM from a configuration file.
    CreateVm {
        config: PathBuf,
        #[arg(short, long)]
        name: Option<String>,
        #[arg(short = 't', long)]
        host: Option<String>,
    },
    /// Tear down a VM enclave.
    DestroyVm { enclave: String },
    /// Tear down an enclave and reclaim its resources.
    DestroyEnclave { enclave: String },
    /// Boot a synthetic node in-process and exercise the fabric.
    Demo,
}

fn main() {
    let cli = Cli::parse();

    // The shell prints its own results; the fabric logger only carries the
    // library's diagnostics, raised to debug when asked.
    if cli.verbose && std::env::var(hobbes_core::ENV_LOG_LEVEL).is_err() {
        std::env::set_var(hobbes_core::ENV_LOG_LEVEL, "debug");
    }
    hobbes::logger::init();

    if let Err(e) = run(cli.command) {
        eprintln!("\x1b[31mError: {}\x1b[0m", e);
        std::process::exit(1);
    }
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Info => info(&Registry::open()?),
        Command::ListEnclaves => list_enclaves(&Registry::open()?),
        Command::ListApps => list_apps(&Registry::open()?),
        Command::ListCpus => list_cpus(&Registry::open()?),
        Command::ListMem => list_mem(&Registry::open()?),
        Command::ListSegments => list_segments(&Registry::open()?),
        Command::Ping { enclave, payload } => {
            let registry = Registry::open()?;
            let id = resolve_enclave(&registry, &enclave)?;
            ping(&registry, id, &payload)
        }
        Command::LaunchApp {
            enclave,
            path,
            name,
            argv,
            envp,
            ranks,
            cpu_list,
            large_pages,
            smartmap,
            heap_size,
            stack_size,
        } => {
            let registry = Registry::open()?;
            let id = resolve_enclave(&registry, &enclave)?;

            let app_name = name.clone().unwrap_or_else(|| path.clone());
            let app = registry.create_app(&app_name, id)?;

            let mut spec = AppSpec::new(&path);
            spec.name = Some(app_name);
            spec.argv = argv;
            spec.envp = envp;
            spec.ranks = ranks;
            spec.cpu_list = cpu_list;
            spec.use_large_pages = large_pages;
            spec.use_smartmap = smartmap;
            spec.heap_size = heap_size;
            spec.stack_size = stack_size;
            spec.app_id = Some(app);

            lifecycle::launch_app(&registry, id, &spec)?;
            println!("Launched app {} in enclave {}", app, id);
            Ok(())
        }
        Command::KillApp { app_id } => {
            let registry = Registry::open()?;
            let app = AppId(app_id);
            let enclave = registry.app_enclave(app)?;
            lifecycle::kill_app(&registry, enclave, app)
        }
        Command::CreateVm { config, name, host } => {
            let registry = Registry::open()?;
            let text = std::fs::read_to_string(&config).map_err(|e| {
                HobbesError::invalid(format!("cannot read {}: {}", config.display(), e))
            })?;
            let mut spec = VmSpec::parse(&text)?;
            let host = match host {
                Some(host) => Some(resolve_enclave(&registry, &host)?),
                None => None,
            };
            let vm = lifecycle::create_vm(&registry, &mut spec, name.as_deref(), host)?;
            println!("VM enclave {} is running", vm);
            Ok(())
        }
        Command::DestroyVm { enclave } => {
            let registry = Registry::open()?;
            let id = resolve_enclave(&registry, &enclave)?;
            lifecycle::destroy_vm(&registry, id)
        }
        Command::DestroyEnclave { enclave } => {
            let registry = Registry::open()?;
            let id = resolve_enclave(&registry, &enclave)?;
            lifecycle::destroy_enclave(&registry, id)
        }
        Command::Demo => demo(),
    }
}

/// Accept either an enclave id or a name.
fn resolve_enclave(registry: &Registry, arg: &str) -> Result<EnclaveId> {
    match arg.parse::<i32>() {
        Ok(id) => Ok(EnclaveId(id)),
        Err(_) => registry.lookup_enclave(arg),
    }
}

// ———————————————————————————————— Listings ———————————————————————————————— //

fn info(registry: &Registry) -> Result<()> {
    let system = registry.system_info()?;
    println!("NUMA nodes:   {}", system.numa_cnt);
    println!("Block size:   {} MiB", system.blk_size / (1024 * 1024));
    println!("CPUs:         {}", system.cpu_cnt);
    println!(
        "Memory:       {} / {} MiB free",
        registry.free_mem_bytes()? / (1024 * 1024),
        registry.total_mem()? / (1024 * 1024)
    );
    println!("Enclaves:     {}", registry.enclave_count()?);
    println!("Applications: {}", registry.app_count()?);
    Ok(())
}

fn list_enclaves(registry: &Registry) -> Result<()> {
    println!("{:<6} {:<20} {:<8} {:<12} {:<6}", "ID", "NAME", "TYPE", "STATE", "PARENT");
    for info in registry.enclave_info_list()? {
        println!(
            "{:<6} {:<20} {:<8} {:<12} {:<6}",
            info.id.to_string(),
            info.name,
            info.enclave_type.to_string(),
            info.state.to_string(),
            info.parent.map(|p| p.to_string()).unwrap_or_default()
        );
    }
    Ok(())
}

fn list_apps(registry: &Registry) -> Result<()> {
    println!("{:<6} {:<20} {:<12} {:<8}", "ID", "NAME", "STATE", "ENCLAVE");
    for info in registry.app_info_list()? {
        println!(
            "{:<6} {:<20} {:<12} {:<8}",
            info.id.to_string(),
            info.name,
            info.state.to_string(),
            info.enclave.to_string()
        );
    }
    Ok(())
}

fn list_cpus(registry: &Registry) -> Result<()> {
    println!("{:<6} {:<6} {:<6} {:<10} {:<8}", "CPU", "APIC", "NUMA", "STATE", "ENCLAVE");
    for cpu in registry.cpu_list()? {
        println!(
            "{:<6} {:<6} {:<6} {:<10} {:<8}",
            cpu.cpu_id,
            cpu.apic_id,
            cpu.numa_node,
            cpu.state.to_string(),
            cpu.enclave.map(|e| e.to_string()).unwrap_or_default()
        );
    }
    Ok(())
}

fn list_mem(registry: &Registry) -> Result<()> {
    println!("{:<18} {:<8} {:<6} {:<10} {:<8}", "BASE", "SIZE_MB", "NUMA", "STATE", "ENCLAVE");
    for blk in registry.memory_list()? {
        println!(
            "{:<18} {:<8} {:<6} {:<10} {:<8}",
            format!("{:#x}", blk.base_addr),
            blk.size / (1024 * 1024),
            blk.numa_node,
            blk.state.to_string(),
            blk.enclave.map(|e| e.to_string()).unwrap_or_default()
        );
    }
    Ok(())
}

fn list_segments(registry: &Registry) -> Result<()> {
    println!("{:<8} {:<24} {:<8} {:<6}", "SEGID", "NAME", "ENCLAVE", "APP");
    for seg in registry.list_segments()? {
        println!(
            "{:<8} {:<24} {:<8} {:<6}",
            seg.segid,
            seg.name.unwrap_or_default(),
            seg.enclave.map(|e| e.to_string()).unwrap_or_default(),
            seg.app.map(|a| a.to_string()).unwrap_or_default()
        );
    }
    Ok(())
}

// —————————————————————————————————— Ping —————————————————————————————————— //

fn ping(registry: &Registry, enclave: EnclaveId, payload: &str) -> Result<()> {
    let client = open_enclave_cmdq(registry, enclave)?;

    let mut data = payload.as_bytes().to_vec();
    data.push(0);

    let start = Instant::now();
    let (ret, reply) = client.submit(CmdCode::Ping.into(), &data)?;
    let elapsed = start.elapsed();

    if ret != 0 || reply != data {
        return Err(HobbesError::transport(format!(
            "bad ping reply from enclave {} (ret={})",
            enclave, ret
        )));
    }
    println!(
        "Reply from enclave {}: {} bytes in {:?}",
        enclave,
        reply.len(),
        elapsed
    );
    Ok(())
}

// —————————————————————————————————— Demo —————————————————————————————————— //

/// Boot a synthetic master in this process and drive it: ping, launch an
/// app, print the listings, shut down.
fn demo() -> Result<()> {
    let registry = Registry::create()?;
    NodeConfig::synthetic(2, 4, 8).populate(&registry)?;
    registry.create_enclave(Some("master"), EnclaveType::Master, None)?;
    registry.alloc_cpu(Some(0), None, EnclaveId::MASTER)?;

    let mut task = InitTask::new(registry.clone(), EnclaveId::MASTER)?;
    let loop_handle = std::thread::spawn(move || task.run());

    ping(&registry, EnclaveId::MASTER, "hello")?;

    let app = registry.create_app("demo-echo", EnclaveId::MASTER)?;
    let mut spec = AppSpec::new("/bin/echo");
    spec.name = Some(String::from("demo-echo"));
    spec.argv = Some(String::from("Hello from a Hobbes application"));
    spec.app_id = Some(app);
    lifecycle::launch_app(&registry, EnclaveId::MASTER, &spec)?;

    // Wait for the exit event to flip the row.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match registry.app_state(app)? {
            AppState::Initialized | AppState::Running if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(50));
            }
            state => {
                println!("Demo app finished in state {}", state);
                break;
            }
        }
    }

    list_enclaves(&registry)?;
    list_apps(&registry)?;
    info(&registry)?;

    let client = open_enclave_cmdq(&registry, EnclaveId::MASTER)?;
    client.submit(CmdCode::Shutdown.into(), &[])?;
    loop_handle
        .join()
        .map_err(|_| HobbesError::catastrophic("init task panicked"))??;

    println!("Demo complete");
    Ok(())
}
