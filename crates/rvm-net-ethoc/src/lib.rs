//! OpenCores-compatible Ethernet MAC.
//!
//! The guest drives a register bank and a 128-entry buffer-descriptor ring
//! through a 2 KiB MMIO window; a background thread moves frames between the
//! descriptor ring and a host [`rvm_net_backend::Tap`], DMA-ing payloads
//! through guest RAM and raising interrupts over a PLIC line.

pub mod bd;
mod device;
mod mdio;
pub mod reg;

pub use bd::BufferDesc;
pub use device::{EthOcDevice, BD_BASE, BD_COUNT, ETHOC_MMIO_SIZE};
pub use mdio::{MII_BMCR, MII_BMSR, MII_PHYIDR1, MII_PHYIDR2};
