#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use osh_core::{AllocStats, Caller, FsConfig, OshFs};
use osh_fuse::MountOptions;
use serde::Serialize;
use std::env;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tracing::info;
use tracing_subscriber::EnvFilter;

const MIB: u64 = 1024 * 1024;

/// Flags shared by `mount` and `stats`.
#[derive(Debug, Default)]
struct CommonArgs {
    capacity_mib: Option<u64>,
    header_slots: Option<usize>,
    allow_other: bool,
    read_only: bool,
    json: bool,
}

impl CommonArgs {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let mut out = Self::default();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--capacity-mib" => {
                    let value = args.next().context("--capacity-mib requires a value")?;
                    out.capacity_mib = Some(
                        value
                            .parse()
                            .with_context(|| format!("invalid --capacity-mib: {value}"))?,
                    );
                }
                "--header-slots" => {
                    let value = args.next().context("--header-slots requires a value")?;
                    out.header_slots = Some(
                        value
                            .parse()
                            .with_context(|| format!("invalid --header-slots: {value}"))?,
                    );
                }
                "--allow-other" => out.allow_other = true,
                "--read-only" => out.read_only = true,
                "--json" => out.json = true,
                other => bail!("unknown option: {other}"),
            }
        }
        Ok(out)
    }

    fn fs_config(&self) -> Result<FsConfig> {
        let mut config = FsConfig::default();
        if let Some(mib) = self.capacity_mib {
            let bytes = mib
                .checked_mul(MIB)
                .with_context(|| format!("capacity of {mib} MiB overflows"))?;
            config = FsConfig::with_capacity_bytes(bytes);
        }
        if let Some(slots) = self.header_slots {
            config.header_slots = slots;
        }
        config.validate().context("invalid filesystem configuration")?;
        Ok(config)
    }
}

#[derive(Debug, Serialize)]
struct StatsOutput {
    capacity_bytes: Option<u64>,
    #[serde(flatten)]
    alloc: AllocStats,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "mount" => {
            let Some(mountpoint) = args.next() else {
                bail!("mount requires <mountpoint>");
            };
            let common = CommonArgs::parse(args)?;
            mount_cmd(Path::new(&mountpoint), &common)
        }
        "stats" => {
            let common = CommonArgs::parse(args)?;
            stats_cmd(&common)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("osh-cli\n");
    println!("USAGE:");
    println!(
        "  osh-cli mount <mountpoint> [--capacity-mib N] [--header-slots N] [--allow-other] [--read-only]"
    );
    println!("  osh-cli stats [--capacity-mib N] [--header-slots N] [--json]");
    println!();
    println!("Logging is controlled by RUST_LOG (default: info).");
}

fn stats_cmd(common: &CommonArgs) -> Result<()> {
    let config = common.fs_config()?;
    let fs = OshFs::new(config).context("failed to build filesystem")?;
    let output = StatsOutput {
        capacity_bytes: config.capacity_bytes(),
        alloc: fs.alloc_stats(),
    };

    if common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        let s = &output.alloc;
        println!("OshFS allocator");
        println!("block_size: {}", s.block_size);
        println!("total_blocks: {}", s.total_blocks);
        if let Some(bytes) = output.capacity_bytes {
            println!("capacity_bytes: {bytes}");
        }
        println!("free_blocks: {}", s.free_blocks);
        println!("free_ranges: {}", s.free_ranges);
        println!("largest_free_range: {}", s.largest_free_range);
        println!(
            "header_slots: {} ({} in use)",
            s.header_slots, s.header_slots_in_use
        );
    }
    Ok(())
}

fn mount_cmd(mountpoint: &Path, common: &CommonArgs) -> Result<()> {
    let config = common.fs_config()?;
    // The root directory takes the owner of the directory it covers.
    let meta = std::fs::metadata(mountpoint)
        .with_context(|| format!("cannot stat mountpoint {}", mountpoint.display()))?;
    let owner = Caller {
        uid: meta.uid(),
        gid: meta.gid(),
    };
    let fs = OshFs::with_root_owner(config, owner).context("failed to build filesystem")?;

    eprintln!(
        "Mounting OshFS (block_size={}, blocks={}, header_slots={}) at {}",
        config.block_size,
        config.total_blocks,
        config.header_slots,
        mountpoint.display()
    );

    let options = MountOptions {
        read_only: common.read_only,
        allow_other: common.allow_other,
        ..MountOptions::default()
    };
    let handle = osh_fuse::mount_managed(Box::new(fs), mountpoint, &options)
        .with_context(|| format!("FUSE mount failed at {}", mountpoint.display()))?;

    let snap = handle.wait();
    info!(
        requests_total = snap.requests_total,
        requests_err = snap.requests_err,
        "filesystem unmounted"
    );
    check_shutdown(mountpoint, snap.requests_fatal)
}

/// A mount that ended on a fatal error exits non-zero; an unmount is clean.
fn check_shutdown(mountpoint: &Path, fatal_errors: u64) -> Result<()> {
    if fatal_errors > 0 {
        bail!(
            "mount at {} shut down after {fatal_errors} fatal error(s)",
            mountpoint.display()
        );
    }
    Ok(())
}
