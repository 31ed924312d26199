use std::sync::Arc;

use thiserror::Error;
use tracing::trace;

use crate::ram::GuestRam;
use crate::RamError;

/// Rejection returned by a device callback. Carries no payload: the bus
/// wraps it with the region context and the hart turns it into a bus error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioFault;

pub type MmioResult = Result<(), MmioFault>;

/// The contract every memory-mapped device implements.
///
/// Callbacks take `&self`: a device guards its own register bank with its own
/// lock. `remove` is the device's sole opportunity to stop background threads
/// and release external handles; it is called exactly once, at detach or
/// machine teardown.
pub trait MmioDevice: Send + Sync {
    fn name(&self) -> &'static str;

    /// Read `buf.len()` bytes at `offset` within the device window.
    fn read(&self, offset: u64, buf: &mut [u8]) -> MmioResult;

    /// Write `buf.len()` bytes at `offset` within the device window.
    fn write(&self, offset: u64, buf: &[u8]) -> MmioResult;

    fn remove(&self) {}
}

/// One entry of the MMIO dispatch table: a `[begin, end)` window bound to a
/// device and the access sizes it accepts.
#[derive(Clone)]
pub struct MmioRegion {
    pub begin: u64,
    pub end: u64,
    pub min_op_size: usize,
    pub max_op_size: usize,
    pub device: Arc<dyn MmioDevice>,
}

impl MmioRegion {
    fn contains(&self, addr: u64) -> bool {
        addr >= self.begin && addr < self.end
    }
}

impl std::fmt::Debug for MmioRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmioRegion")
            .field("begin", &format_args!("{:#x}", self.begin))
            .field("end", &format_args!("{:#x}", self.end))
            .field("device", &self.device.name())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AttachError {
    #[error("MMIO region {begin:#x}..{end:#x} is inverted or empty")]
    InvertedRange { begin: u64, end: u64 },
    #[error("MMIO region {begin:#x}..{end:#x} overlaps region {other_begin:#x}..{other_end:#x}")]
    Overlap {
        begin: u64,
        end: u64,
        other_begin: u64,
        other_end: u64,
    },
    #[error("MMIO region {begin:#x}..{end:#x} overlaps guest RAM")]
    OverlapsRam { begin: u64, end: u64 },
    #[error("op size bounds {min}..={max} are invalid")]
    BadOpSize { min: usize, max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("no RAM or MMIO region maps physical address {addr:#x}")]
    Unmapped { addr: u64 },
    #[error("{size}-byte access at {addr:#x} violates {min}..={max} for device `{device}`")]
    AccessSize {
        addr: u64,
        size: usize,
        min: usize,
        max: usize,
        device: &'static str,
    },
    #[error("device `{device}` rejected {size}-byte access at offset {offset:#x}")]
    DeviceFault {
        device: &'static str,
        offset: u64,
        size: usize,
    },
    #[error(transparent)]
    Ram(#[from] RamError),
}

/// The physical address space: guest RAM plus an ordered, pairwise-disjoint
/// set of MMIO windows.
pub struct PhysBus {
    ram: Arc<GuestRam>,
    /// Sorted by `begin`; disjointness is enforced at attach.
    regions: Vec<MmioRegion>,
}

impl PhysBus {
    pub fn new(ram: Arc<GuestRam>) -> Self {
        Self {
            ram,
            regions: Vec::new(),
        }
    }

    pub fn ram(&self) -> &Arc<GuestRam> {
        &self.ram
    }

    pub fn regions(&self) -> &[MmioRegion] {
        &self.regions
    }

    /// Insert a region, rejecting malformed descriptors and any overlap with
    /// existing regions or with guest RAM.
    pub fn attach(&mut self, region: MmioRegion) -> Result<(), AttachError> {
        if region.begin >= region.end {
            return Err(AttachError::InvertedRange {
                begin: region.begin,
                end: region.end,
            });
        }
        if region.min_op_size == 0 || region.min_op_size > region.max_op_size {
            return Err(AttachError::BadOpSize {
                min: region.min_op_size,
                max: region.max_op_size,
            });
        }
        if region.begin < self.ram.end() && self.ram.begin() < region.end {
            return Err(AttachError::OverlapsRam {
                begin: region.begin,
                end: region.end,
            });
        }
        for other in &self.regions {
            if region.begin < other.end && other.begin < region.end {
                return Err(AttachError::Overlap {
                    begin: region.begin,
                    end: region.end,
                    other_begin: other.begin,
                    other_end: other.end,
                });
            }
        }
        trace!(
            "mmio attach: {} at {:#x}..{:#x}",
            region.device.name(),
            region.begin,
            region.end
        );
        let at = self
            .regions
            .partition_point(|other| other.begin < region.begin);
        self.regions.insert(at, region);
        Ok(())
    }

    /// Remove the region starting at `begin` and run its `remove` callback.
    /// Returns false when no region starts there.
    pub fn detach(&mut self, begin: u64) -> bool {
        let Some(at) = self.regions.iter().position(|r| r.begin == begin) else {
            return false;
        };
        let region = self.regions.remove(at);
        trace!("mmio detach: {} at {:#x}", region.device.name(), begin);
        region.device.remove();
        true
    }

    fn region_for(&self, addr: u64) -> Option<&MmioRegion> {
        let at = self.regions.partition_point(|r| r.end <= addr);
        self.regions.get(at).filter(|r| r.contains(addr))
    }

    fn dispatch_check(region: &MmioRegion, addr: u64, size: usize) -> Result<(), BusError> {
        let end = addr.checked_add(size as u64);
        if size < region.min_op_size
            || size > region.max_op_size
            || end.is_none_or(|e| e > region.end)
        {
            return Err(BusError::AccessSize {
                addr,
                size,
                min: region.min_op_size,
                max: region.max_op_size,
                device: region.device.name(),
            });
        }
        Ok(())
    }

    /// Resolve a physical read to RAM or a device window.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), BusError> {
        if self.ram.contains(addr, buf.len() as u64) {
            return Ok(self.ram.read_into(addr, buf)?);
        }
        let region = self.region_for(addr).ok_or(BusError::Unmapped { addr })?;
        Self::dispatch_check(region, addr, buf.len())?;
        region
            .device
            .read(addr - region.begin, buf)
            .map_err(|MmioFault| BusError::DeviceFault {
                device: region.device.name(),
                offset: addr - region.begin,
                size: buf.len(),
            })
    }

    /// Resolve a physical write to RAM or a device window.
    pub fn write(&self, addr: u64, buf: &[u8]) -> Result<(), BusError> {
        if self.ram.contains(addr, buf.len() as u64) {
            return Ok(self.ram.write_from(addr, buf)?);
        }
        let region = self.region_for(addr).ok_or(BusError::Unmapped { addr })?;
        Self::dispatch_check(region, addr, buf.len())?;
        region
            .device
            .write(addr - region.begin, buf)
            .map_err(|MmioFault| BusError::DeviceFault {
                device: region.device.name(),
                offset: addr - region.begin,
                size: buf.len(),
            })
    }
}
