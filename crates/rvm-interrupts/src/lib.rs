//! Platform-level interrupt controller and per-hart event bitmaps.
//!
//! Devices raise IRQ lines from MMIO write handlers and from their background
//! threads; harts observe the result as an event bit sampled between
//! instructions. Nothing here promises synchronous delivery.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use tracing::warn;

bitflags! {
    /// Events a hart samples at instruction boundaries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HartEvent: u32 {
        /// Cooperative shutdown request; the hart leaves its run loop.
        const SHUTDOWN = 1 << 0;
        /// An external interrupt is pending in the PLIC.
        const EXT_IRQ = 1 << 1;
    }
}

/// Atomic event bitmap shared between a hart and everything that may poke it.
#[derive(Debug, Default)]
pub struct HartEvents {
    bits: AtomicU32,
}

impl HartEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, event: HartEvent) {
        self.bits.fetch_or(event.bits(), Ordering::Release);
    }

    /// Consume all currently pending events.
    pub fn take(&self) -> HartEvent {
        HartEvent::from_bits_truncate(self.bits.swap(0, Ordering::Acquire))
    }

    pub fn peek(&self) -> HartEvent {
        HartEvent::from_bits_truncate(self.bits.load(Ordering::Acquire))
    }
}

/// Number of IRQ lines; line 0 means "no interrupt" and cannot be raised.
pub const IRQ_LINES: u32 = 32;

/// Platform-level interrupt controller.
///
/// `send_irq` may be called from any thread. Delivery is level-sensitive from
/// the device's point of view: a device re-raises its line whenever its
/// `pending & mask` state becomes nonzero, so a lost edge is recovered by the
/// next raise.
pub struct Plic {
    pending: AtomicU32,
    harts: Vec<Arc<HartEvents>>,
}

impl Plic {
    pub fn new(harts: Vec<Arc<HartEvents>>) -> Self {
        Self {
            pending: AtomicU32::new(0),
            harts,
        }
    }

    /// Latch `irq` pending and post an external-interrupt event to every hart.
    pub fn send_irq(&self, irq: u32) {
        if irq == 0 || irq >= IRQ_LINES {
            warn!("ignoring raise of invalid IRQ line {irq}");
            return;
        }
        self.pending.fetch_or(1 << irq, Ordering::Release);
        for hart in &self.harts {
            hart.raise(HartEvent::EXT_IRQ);
        }
    }

    /// Claim and clear the lowest pending line, if any.
    pub fn claim(&self) -> Option<u32> {
        loop {
            let pending = self.pending.load(Ordering::Acquire);
            if pending == 0 {
                return None;
            }
            let irq = pending.trailing_zeros();
            if self
                .pending
                .compare_exchange_weak(
                    pending,
                    pending & !(1 << irq),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Some(irq);
            }
        }
    }

    /// Snapshot of all pending lines.
    pub fn pending_mask(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }
}

/// A single IRQ line handed to a device model. Cloneable and cheap; devices
/// never see the machine, only this.
#[derive(Clone)]
pub struct IrqLine {
    plic: Arc<Plic>,
    irq: u32,
}

impl IrqLine {
    pub fn new(plic: Arc<Plic>, irq: u32) -> Self {
        Self { plic, irq }
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }

    pub fn raise(&self) {
        self.plic.send_irq(self.irq);
    }
}

impl std::fmt::Debug for IrqLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrqLine").field("irq", &self.irq).finish()
    }
}
