//! `rvm-machine`: boot a RISC-V guest from the command line.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rvm_machine::{seed_dtb_address, Machine, MachineConfig, DEFAULT_MEM_BASE};
use rvm_net_backend::Tap;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const ETHERNET_BASE: u64 = 0x2100_0000;
const ETHERNET_IRQ: u32 = 5;

/// Kernel images land at the hugepage-aligned offset firmware expects
/// (4 MiB on RV32).
const KERNEL_OFFSET: u64 = 4 << 20;

#[derive(Parser, Debug)]
#[command(name = "rvm-machine", version, about = "RISC-V machine emulator")]
struct Args {
    /// Machine bootrom (SBI, BBL, etc)
    bootrom: PathBuf,

    /// Memory amount, e.g. 256M
    #[arg(long, default_value = "256M", value_parser = parse_mem_size)]
    mem: u64,

    /// Core count
    #[arg(long, default_value_t = 1)]
    smp: u32,

    /// Enable 64-bit RISC-V (not available in this build)
    #[arg(long)]
    rv64: bool,

    /// Load a kernel Image as SBI payload
    #[arg(long)]
    kernel: Option<PathBuf>,

    /// Attach a hard drive with a raw image (not wired in this build)
    #[arg(long)]
    image: Option<PathBuf>,

    /// Pass a custom DTB to the machine
    #[arg(long)]
    dtb: Option<PathBuf>,

    /// Dump the autogenerated DTB to a file
    #[arg(long)]
    dumpdtb: Option<PathBuf>,

    /// Framebuffer resolution
    #[arg(long, default_value = "640x480", value_parser = parse_resolution)]
    res: (u32, u32),

    /// Disable framebuffer & mouse/keyboard
    #[arg(long)]
    nogui: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

fn parse_mem_size(arg: &str) -> Result<u64, String> {
    let arg = arg.trim();
    let (digits, shift) = match arg.as_bytes().last() {
        Some(b'k') | Some(b'K') => (&arg[..arg.len() - 1], 10),
        Some(b'm') | Some(b'M') => (&arg[..arg.len() - 1], 20),
        Some(b'g') | Some(b'G') => (&arg[..arg.len() - 1], 30),
        _ => (arg, 0),
    };
    let base: u64 = digits
        .parse()
        .map_err(|_| format!("invalid memory amount: {arg}"))?;
    base.checked_shl(shift)
        .filter(|bytes| *bytes >> shift == base)
        .ok_or_else(|| format!("memory amount overflows: {arg}"))
}

fn parse_resolution(arg: &str) -> Result<(u32, u32), String> {
    let err = || format!("invalid resolution: {arg}, expects 640x480");
    let (w, h) = arg.split_once('x').ok_or_else(err)?;
    Ok((w.parse().map_err(|_| err())?, h.parse().map_err(|_| err())?))
}

#[cfg(target_os = "linux")]
fn open_tap() -> Option<Arc<dyn Tap>> {
    match rvm_net_backend::LinuxTap::open(None) {
        Ok(tap) => Some(Arc::new(tap)),
        Err(err) => {
            warn!("no TAP interface available ({err}); ethernet disabled");
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn open_tap() -> Option<Arc<dyn Tap>> {
    // Userspace fallback: the MAC works, frames stay on the host side.
    Some(Arc::new(rvm_net_backend::HostQueueTap::new()))
}

/// One full power-on → shutdown cycle. Returns whether the guest asked for a
/// reset.
fn run_machine(args: &Args) -> Result<bool> {
    let mut machine = Machine::new(MachineConfig {
        mem_base: DEFAULT_MEM_BASE,
        mem_size: args.mem,
        hart_count: args.smp,
        rv64: args.rv64,
    })
    .context("machine creation failed")?;

    let bootrom = fs::read(&args.bootrom)
        .with_context(|| format!("cannot open {}", args.bootrom.display()))?;
    machine
        .load_image(DEFAULT_MEM_BASE, &bootrom)
        .context("failed to load bootrom")?;

    if let Some(kernel) = &args.kernel {
        let image =
            fs::read(kernel).with_context(|| format!("cannot open {}", kernel.display()))?;
        machine
            .load_image(DEFAULT_MEM_BASE + KERNEL_OFFSET, &image)
            .context("failed to load kernel")?;
        info!("kernel image loaded at {:#x}", DEFAULT_MEM_BASE + KERNEL_OFFSET);
    }

    if let Some(dtb) = &args.dtb {
        let blob = fs::read(dtb).with_context(|| format!("cannot open {}", dtb.display()))?;
        let dtb_addr = DEFAULT_MEM_BASE + args.mem / 2;
        machine
            .load_image(dtb_addr, &blob)
            .context("failed to load DTB")?;
        seed_dtb_address(&mut machine, dtb_addr as u32);
        info!("custom DTB loaded at {dtb_addr:#x}");
    }

    if args.dumpdtb.is_some() {
        warn!("this build doesn't support FDT generation");
    }
    if args.image.is_some() {
        warn!("storage controllers are not wired in this build; ignoring --image");
    }
    if !args.nogui {
        let (w, h) = args.res;
        info!("no framebuffer in this build; running headless (requested {w}x{h})");
    }

    if let Some(tap) = open_tap() {
        if let Err(err) = machine.attach_ethernet(ETHERNET_BASE, ETHERNET_IRQ, tap) {
            warn!("ethernet disabled: {err}");
        }
    }

    machine.run().context("machine run failed")?;
    Ok(machine.needs_reset())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    while run_machine(&args)? {
        info!("guest requested reset; restarting machine");
    }
    Ok(())
}
