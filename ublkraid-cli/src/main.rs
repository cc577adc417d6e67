use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::{info, warn};
use uuid::Uuid;

use ublkraid::config::Config;
use ublkraid::disk::UblkDisk;
use ublkraid::drivers::FsDisk;
use ublkraid::raid::raid0::Raid0Disk;
use ublkraid::raid::raid1::{Raid1Disk, Raid1Opts, ReplicaState};
use ublkraid::target::Target;
use ublkraid::KI;

#[derive(Debug, Parser)]
#[command(name = "ublkraid", about = "Compose backing devices into a virtual block device")]
struct Cli {
    /// Volume UUID to use (else random)
    #[arg(long, env = "UBLKRAID_VOL_ID")]
    vol_id: Option<Uuid>,

    /// Attach a single device 1-to-1
    #[arg(long = "loop", value_name = "path")]
    loop_dev: Option<PathBuf>,

    /// Devices for a RAID-0 array
    #[arg(long, value_delimiter = ',', value_name = "path,...")]
    raid0: Vec<PathBuf>,

    /// Devices for a RAID-1 mirror pair
    #[arg(long, value_delimiter = ',', value_name = "path,path")]
    raid1: Vec<PathBuf>,

    /// Devices for RAID-10 (striped mirror pairs, in pair order)
    #[arg(long, value_delimiter = ',', value_name = "path,...")]
    raid10: Vec<PathBuf>,

    /// RAID-0 stripe size in bytes
    #[arg(long, default_value_t = 131072)]
    stripe_size: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the assembled device tree and replica health
    Info,
    /// Assemble and wait for any degraded mirror to resync to clean
    Resync,
    /// Export the assembled tree as a ublk block device
    Serve,
}

struct Assembly {
    root: Arc<dyn UblkDisk>,
    mirrors: Vec<Arc<Raid1Disk>>,
}

fn open_leaf(path: &PathBuf) -> anyhow::Result<Arc<dyn UblkDisk>> {
    let disk = FsDisk::open(path).with_context(|| format!("opening {}", path.display()))?;
    Ok(Arc::new(disk))
}

fn assemble(cli: &Cli, cfg: &Config, uuid: Uuid) -> anyhow::Result<Assembly> {
    let raid1_opts = Raid1Opts::from(&cfg.raid1);
    let mut mirrors = Vec::new();

    let root: Arc<dyn UblkDisk> = if let Some(path) = &cli.loop_dev {
        open_leaf(path)?
    } else if !cli.raid0.is_empty() {
        let disks = cli
            .raid0
            .iter()
            .map(open_leaf)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Arc::new(Raid0Disk::open(&uuid, cli.stripe_size, disks)?)
    } else if !cli.raid1.is_empty() {
        if 2 != cli.raid1.len() {
            bail!("--raid1 requires exactly two devices");
        }
        let mirror = Arc::new(Raid1Disk::open(
            uuid,
            open_leaf(&cli.raid1[0])?,
            open_leaf(&cli.raid1[1])?,
            raid1_opts,
        )?);
        mirrors.push(mirror.clone());
        mirror
    } else if !cli.raid10.is_empty() {
        if 0 != cli.raid10.len() % 2 || cli.raid10.len() < 4 {
            bail!("--raid10 requires an even number (>= 4) of devices");
        }
        let mut stripes: Vec<Arc<dyn UblkDisk>> = Vec::new();
        for (idx, pair) in cli.raid10.chunks(2).enumerate() {
            // Each mirror pair carries its own uuid derived from the
            // volume id so the pairs cannot be cross-assembled
            let pair_uuid = Uuid::new_v5(&uuid, format!("mirror-{idx}").as_bytes());
            let mirror = Arc::new(Raid1Disk::open(
                pair_uuid,
                open_leaf(&pair[0])?,
                open_leaf(&pair[1])?,
                raid1_opts.clone(),
            )?);
            mirrors.push(mirror.clone());
            stripes.push(mirror);
        }
        Arc::new(Raid0Disk::open(&uuid, cli.stripe_size, stripes)?)
    } else {
        bail!("one of --loop, --raid0, --raid1, --raid10 is required");
    };

    Ok(Assembly { root, mirrors })
}

fn print_state(assembly: &Assembly) {
    println!("{}", assembly.root.describe());
    for (idx, mirror) in assembly.mirrors.iter().enumerate() {
        let state = mirror.replica_states();
        println!(
            "  mirror[{idx}]: A={:?} B={:?} to_sync={}KiB",
            state.device_a,
            state.device_b,
            state.bytes_to_sync / KI
        );
    }
}

fn wait_for_clean(assembly: &Assembly, stop: &AtomicBool) -> anyhow::Result<()> {
    loop {
        if stop.load(Ordering::Acquire) {
            warn!("interrupted, resync incomplete");
            return Ok(());
        }
        // No guest I/O flows here; tell each mirror the queue is idle so
        // the background copy runs unthrottled
        for mirror in &assembly.mirrors {
            mirror.idle_transition(true);
        }
        let pending: u64 = assembly
            .mirrors
            .iter()
            .map(|m| m.replica_states().bytes_to_sync)
            .sum();
        let errored = assembly.mirrors.iter().any(|m| {
            let s = m.replica_states();
            ReplicaState::Error == s.device_a || ReplicaState::Error == s.device_b
        });
        if errored {
            bail!("a replica is unavailable; resync cannot finish");
        }
        if 0 == pending
            && assembly.mirrors.iter().all(|m| {
                let s = m.replica_states();
                ReplicaState::Clean == s.device_a && ReplicaState::Clean == s.device_b
            })
        {
            info!("all mirrors clean");
            return Ok(());
        }
        info!("{}KiB left to resync", pending / KI);
        std::thread::sleep(Duration::from_secs(1));
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let cfg = Config::load();
    let uuid = cli.vol_id.unwrap_or_else(Uuid::new_v4);

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::Release))
            .context("installing signal handler")?;
    }

    let assembly = assemble(&cli, &cfg, uuid)?;
    info!("assembled volume {uuid}");

    match cli.command {
        Command::Info => print_state(&assembly),
        Command::Resync => {
            print_state(&assembly);
            wait_for_clean(&assembly, &stop)?;
            print_state(&assembly);
        }
        Command::Serve => {
            let target = Arc::new(Target::new(assembly.root.clone(), cfg.target.clone()));
            let params = target.init_target();
            info!(
                "target ready: {} bytes, {} queue(s), depth {}",
                params.dev_size, params.nr_hw_queues, params.queue_depth
            );
            // The kernel session library is an external integration; this
            // build has none wired in.
            bail!("no ublk session provider available in this build");
        }
    }
    Ok(())
}
