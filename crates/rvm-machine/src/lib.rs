//! The machine: guest RAM, the MMIO table, the interrupt controller and a
//! set of harts, plus the device lifecycle around them.
//!
//! Construction and device attachment happen single-threaded; [`Machine::run`]
//! then spawns one OS thread per hart and blocks until all of them halt.
//! Devices keep their background threads until teardown, which detaches every
//! MMIO region in reverse attach order and runs each device's `remove`.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use rvm_cpu::{Hart, HartState, OpcodeTable, Register};
use rvm_interrupts::{HartEvent, HartEvents, IrqLine, Plic};
use rvm_mem::{AttachError, BusError, GuestRam, MmioRegion, PhysBus, RamError};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

pub use rvm_mem::DEFAULT_MEM_BASE;

/// Default guest RAM size: 256 MiB.
pub const DEFAULT_MEM_SIZE: u64 = 256 << 20;

/// Hard cap on the hart count, matching what the rest of the platform
/// (interrupt routing, device-tree cells) can address.
pub const MAX_HARTS: u32 = 1024;

const MIN_MEM_SIZE: u64 = 64 << 10;
const MAX_MEM_SIZE: u64 = 16 << 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineConfig {
    pub mem_base: u64,
    pub mem_size: u64,
    pub hart_count: u32,
    pub rv64: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            mem_base: DEFAULT_MEM_BASE,
            mem_size: DEFAULT_MEM_SIZE,
            hart_count: 1,
            rv64: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("mem_size={0:#x} is invalid; guest RAM must be {MIN_MEM_SIZE:#x}..={MAX_MEM_SIZE:#x} bytes")]
    InvalidMemSize(u64),
    #[error("hart_count={0} is invalid; between 1 and {MAX_HARTS} harts are supported")]
    InvalidHartCount(u32),
    #[error("rv64=true is not supported; this machine runs RV32 harts only")]
    Rv64Unsupported,
    #[error("boot image of {len:#x} bytes does not fit in RAM at {addr:#x}")]
    ImageDoesNotFit { addr: u64, len: usize },
    #[error("failed to spawn hart thread")]
    HartSpawn(#[source] io::Error),
    #[error("failed to spawn device worker thread")]
    DeviceSpawn(#[source] io::Error),
    #[error("hart thread panicked")]
    HartPanicked,
    #[error(transparent)]
    Ram(#[from] RamError),
    #[error(transparent)]
    Attach(#[from] AttachError),
}

/// Cloneable handle for requesting shutdown from outside the run loop
/// (a poweroff device model, a signal handler).
#[derive(Clone)]
pub struct ShutdownHandle {
    hart_events: Vec<Arc<HartEvents>>,
    needs_reset: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn request_shutdown(&self, reset: bool) {
        if reset {
            self.needs_reset.store(true, Ordering::Release);
        }
        for events in &self.hart_events {
            events.raise(HartEvent::SHUTDOWN);
        }
    }
}

pub struct Machine {
    bus: PhysBus,
    plic: Arc<Plic>,
    opcode_table: Arc<OpcodeTable>,
    harts: Vec<Hart>,
    hart_events: Vec<Arc<HartEvents>>,
    /// MMIO begin addresses in attach order; teardown walks it backwards.
    attach_order: Vec<u64>,
    needs_reset: Arc<AtomicBool>,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Result<Self, MachineError> {
        if config.rv64 {
            return Err(MachineError::Rv64Unsupported);
        }
        if config.mem_size < MIN_MEM_SIZE
            || config.mem_size > MAX_MEM_SIZE
            || config.mem_base.checked_add(config.mem_size).is_none()
        {
            return Err(MachineError::InvalidMemSize(config.mem_size));
        }
        if config.hart_count == 0 || config.hart_count > MAX_HARTS {
            return Err(MachineError::InvalidHartCount(config.hart_count));
        }

        let ram = Arc::new(GuestRam::new(config.mem_base, config.mem_size)?);
        let mut harts: Vec<Hart> = (0..config.hart_count).map(Hart::new).collect();
        for hart in &mut harts {
            hart.reset(config.mem_base as u32);
        }
        let hart_events: Vec<_> = harts.iter().map(|h| h.events().clone()).collect();
        let plic = Arc::new(Plic::new(hart_events.clone()));

        info!(
            "machine created: {} MiB RAM at {:#x}, {} hart(s)",
            config.mem_size >> 20,
            config.mem_base,
            config.hart_count
        );

        Ok(Self {
            bus: PhysBus::new(ram),
            plic,
            opcode_table: Arc::new(OpcodeTable::rv32i()),
            harts,
            hart_events,
            attach_order: Vec::new(),
            needs_reset: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn ram(&self) -> &Arc<GuestRam> {
        self.bus.ram()
    }

    pub fn plic(&self) -> &Arc<Plic> {
        &self.plic
    }

    /// The IRQ line handle a device model holds on to.
    pub fn irq_line(&self, irq: u32) -> IrqLine {
        IrqLine::new(self.plic.clone(), irq)
    }

    pub fn harts(&self) -> &[Hart] {
        &self.harts
    }

    /// Pre-run register seeding (DTB address into `a1`, etc.).
    pub fn harts_mut(&mut self) -> &mut [Hart] {
        &mut self.harts
    }

    pub fn mmio_regions(&self) -> &[MmioRegion] {
        self.bus.regions()
    }

    pub fn attach_mmio(&mut self, region: MmioRegion) -> Result<(), MachineError> {
        let begin = region.begin;
        self.bus.attach(region)?;
        self.attach_order.push(begin);
        Ok(())
    }

    /// Detach the region starting at `begin`, running the device's `remove`.
    pub fn detach_mmio(&mut self, begin: u64) -> bool {
        let detached = self.bus.detach(begin);
        if detached {
            self.attach_order.retain(|&b| b != begin);
        }
        detached
    }

    /// Bounded RAM access, bypassing MMIO.
    pub fn read_ram(&self, addr: u64, dst: &mut [u8]) -> Result<(), RamError> {
        self.bus.ram().read_into(addr, dst)
    }

    pub fn write_ram(&self, addr: u64, src: &[u8]) -> Result<(), RamError> {
        self.bus.ram().write_from(addr, src)
    }

    /// Physical access resolved to RAM or an MMIO region, the way a hart's
    /// load/store would be.
    pub fn read_physical(&self, addr: u64, dst: &mut [u8]) -> Result<(), BusError> {
        self.bus.read(addr, dst)
    }

    pub fn write_physical(&self, addr: u64, src: &[u8]) -> Result<(), BusError> {
        self.bus.write(addr, src)
    }

    /// Place a boot blob (bootrom, kernel, DTB) into guest RAM.
    pub fn load_image(&self, addr: u64, image: &[u8]) -> Result<(), MachineError> {
        self.write_ram(addr, image)
            .map_err(|_| MachineError::ImageDoesNotFit {
                addr,
                len: image.len(),
            })?;
        debug!("loaded {:#x}-byte image at {:#x}", image.len(), addr);
        Ok(())
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            hart_events: self.hart_events.clone(),
            needs_reset: self.needs_reset.clone(),
        }
    }

    /// Post a shutdown event to every hart. With `reset` the caller is
    /// expected to tear the machine down and build a fresh one.
    pub fn request_shutdown(&self, reset: bool) {
        self.shutdown_handle().request_shutdown(reset);
    }

    pub fn needs_reset(&self) -> bool {
        self.needs_reset.load(Ordering::Acquire)
    }

    /// Run every hart on its own OS thread until all of them halt (shutdown
    /// request, or a trap nothing here handles).
    pub fn run(&mut self) -> Result<(), MachineError> {
        let mut pending = std::mem::take(&mut self.harts).into_iter();
        let mut handles = Vec::new();
        let mut spawn_err = None;
        for mut hart in pending.by_ref() {
            let ram = self.bus.ram().clone();
            let table = self.opcode_table.clone();
            let spawned = thread::Builder::new()
                .name(format!("hart{}", hart.id()))
                .spawn(move || {
                    run_hart(&mut hart, &ram, &table);
                    hart
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    spawn_err = Some(err);
                    break;
                }
            }
        }
        if spawn_err.is_some() {
            // Call back the harts that did start before reporting failure.
            for events in &self.hart_events {
                events.raise(HartEvent::SHUTDOWN);
            }
        }

        let mut result = Ok(());
        for handle in handles {
            match handle.join() {
                Ok(hart) => self.harts.push(hart),
                Err(_) => result = Err(MachineError::HartPanicked),
            }
        }
        self.harts.extend(pending);
        if let Some(err) = spawn_err {
            return Err(MachineError::HartSpawn(err));
        }
        result
    }

    /// Attach an OpenCores Ethernet MAC at `base`, raising `irq`, backed by
    /// `tap`. The DMA worker is spawned here; if that fails the region is
    /// detached again (running the device's `remove`) and the machine keeps
    /// going without networking.
    pub fn attach_ethernet(
        &mut self,
        base: u64,
        irq: u32,
        tap: Arc<dyn rvm_net_backend::Tap>,
    ) -> Result<Arc<rvm_net_ethoc::EthOcDevice>, MachineError> {
        let device = rvm_net_ethoc::EthOcDevice::new(tap, self.ram().clone(), self.irq_line(irq));
        self.attach_mmio(device.region(base))?;
        if let Err(err) = device.spawn_worker() {
            self.detach_mmio(base);
            return Err(MachineError::DeviceSpawn(err));
        }
        info!("ethernet MAC attached at {base:#x}, irq {irq}");
        Ok(device)
    }

    /// Detach every device in reverse attach order, running each `remove`.
    /// Called from `Drop` as well; safe to call twice.
    pub fn shutdown_devices(&mut self) {
        while let Some(begin) = self.attach_order.pop() {
            self.bus.detach(begin);
        }
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.shutdown_devices();
    }
}

fn run_hart(hart: &mut Hart, ram: &GuestRam, table: &OpcodeTable) {
    loop {
        let events = hart.events().take();
        if events.contains(HartEvent::SHUTDOWN) {
            debug!("hart{} halted by shutdown request", hart.id());
            hart.set_state(HartState::Halted);
            return;
        }
        if events.contains(HartEvent::EXT_IRQ) {
            trace!("hart{}: external interrupt pending", hart.id());
        }
        if let Err(trap) = hart.step(ram, table) {
            warn!("hart{} stopped: {trap}", hart.id());
            hart.set_state(HartState::Trapped);
            return;
        }
    }
}

/// Convenience: seed the DTB address into `a1` of every hart, the register
/// boot firmware expects it in.
pub fn seed_dtb_address(machine: &mut Machine, dtb_addr: u32) {
    for hart in machine.harts_mut() {
        hart.write_reg(Register::A1, dtb_addr);
    }
}
