//! Guest physical memory and the physical address bus.
//!
//! [`GuestRam`] is the machine's contiguous RAM region; [`PhysBus`] resolves a
//! physical access to either RAM (a direct byte copy) or a memory-mapped
//! device window (a size-checked dispatch into the owning [`MmioDevice`]).

mod bus;
mod ram;

pub use bus::{AttachError, BusError, MmioDevice, MmioFault, MmioRegion, MmioResult, PhysBus};
pub use ram::{GuestRam, RamError};

/// Default base physical address of guest RAM.
pub const DEFAULT_MEM_BASE: u64 = 0x8000_0000;
