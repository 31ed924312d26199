//! Host-side L2 frame I/O for emulated network devices.
//!
//! A [`Tap`] hands Ethernet frames between the emulator and the host. Device
//! DMA threads block in [`Tap::poll`]; anything that enqueues work for such a
//! thread (an MMIO write, shutdown) calls [`Tap::wake`] to knock it out of
//! the wait. Wakes are sticky: one posted before the poll is observed by it.

use std::time::Duration;

use bitflags::bitflags;
use thiserror::Error;

mod queue;
pub use queue::HostQueueTap;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::LinuxTap;

/// Frames up to this long traverse a tap in one piece (1500 MTU plus L2
/// header and a little slack, the classic scratch size).
pub const MAX_FRAME_LEN: usize = 1536;

bitflags! {
    /// Poll interest going in, readiness coming back out.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PollEvents: u8 {
        /// A frame can be received.
        const IN = 1 << 0;
        /// A frame can be sent.
        const OUT = 1 << 1;
    }
}

#[derive(Debug, Error)]
pub enum TapError {
    #[error("tap I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tap operation would block")]
    WouldBlock,
    #[error("tap is closed")]
    Closed,
}

/// An L2 frame endpoint.
///
/// All methods take `&self` and are callable from any thread; `wake` in
/// particular is called by MMIO handlers while another thread sits in
/// `poll`.
pub trait Tap: Send + Sync {
    /// Block until one of `interest` is ready, the timeout elapses, or a
    /// wake arrives. A wake or timeout yields an empty readiness set.
    fn poll(&self, interest: PollEvents, timeout: Option<Duration>) -> Result<PollEvents, TapError>;

    /// Receive one frame into `buf`, returning its length (truncating to
    /// `buf.len()` if the frame is longer).
    fn recv(&self, buf: &mut [u8]) -> Result<usize, TapError>;

    /// Send one frame, returning the number of bytes accepted.
    fn send(&self, buf: &[u8]) -> Result<usize, TapError>;

    /// Knock a blocked `poll` loose. Sticky until observed.
    fn wake(&self);

    fn mac(&self) -> [u8; 6];

    fn set_mac(&self, mac: [u8; 6]);

    /// Whether the host side of the link is up (PHY status).
    fn link_up(&self) -> bool;
}
