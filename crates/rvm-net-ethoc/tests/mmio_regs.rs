use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rvm_interrupts::{IrqLine, Plic};
use rvm_mem::{GuestRam, MmioDevice};
use rvm_net_ethoc::{reg, EthOcDevice, BD_BASE};
use rvm_net_backend::{PollEvents, Tap, TapError};

/// TAP double: plays back injected receives, counts wakes.
#[derive(Default)]
struct ScriptedTap {
    rx: Mutex<VecDeque<Vec<u8>>>,
    mac: Mutex<[u8; 6]>,
    link: AtomicBool,
    wakes: AtomicUsize,
}

impl Tap for ScriptedTap {
    fn poll(&self, interest: PollEvents, _timeout: Option<Duration>) -> Result<PollEvents, TapError> {
        let mut ready = PollEvents::empty();
        if interest.contains(PollEvents::IN) && !self.rx.lock().unwrap().is_empty() {
            ready |= PollEvents::IN;
        }
        if interest.contains(PollEvents::OUT) {
            ready |= PollEvents::OUT;
        }
        Ok(ready)
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize, TapError> {
        let frame = self.rx.lock().unwrap().pop_front().ok_or(TapError::WouldBlock)?;
        let n = frame.len().min(buf.len());
        buf[..n].copy_from_slice(&frame[..n]);
        Ok(n)
    }

    fn send(&self, buf: &[u8]) -> Result<usize, TapError> {
        Ok(buf.len())
    }

    fn wake(&self) {
        self.wakes.fetch_add(1, Ordering::SeqCst);
    }

    fn mac(&self) -> [u8; 6] {
        *self.mac.lock().unwrap()
    }

    fn set_mac(&self, mac: [u8; 6]) {
        *self.mac.lock().unwrap() = mac;
    }

    fn link_up(&self) -> bool {
        self.link.load(Ordering::SeqCst)
    }
}

fn device() -> (Arc<EthOcDevice>, Arc<ScriptedTap>, Arc<Plic>) {
    let tap = Arc::new(ScriptedTap::default());
    let ram = Arc::new(GuestRam::new(0x8000_0000, 0x10000).unwrap());
    let plic = Arc::new(Plic::new(vec![]));
    let dev = EthOcDevice::new(tap.clone(), ram, IrqLine::new(plic.clone(), 5));
    (dev, tap, plic)
}

#[test]
fn reset_values_match_the_hardware_defaults() {
    let (dev, _, _) = device();
    assert_eq!(dev.mmio_read_u32(reg::MODER), Some(0xA000)); // PAD | CRCEN
    assert_eq!(dev.mmio_read_u32(reg::INT_SRC), Some(0));
    assert_eq!(dev.mmio_read_u32(reg::INT_MASK), Some(0));
    assert_eq!(dev.mmio_read_u32(reg::PACKETLEN), Some(0x0040_0600));
    assert_eq!(dev.mmio_read_u32(reg::COLLCONF), Some(0xF003F));
    assert_eq!(dev.mmio_read_u32(reg::TX_BD_NUM), Some(0x40));
    assert_eq!(dev.mmio_read_u32(reg::MIIMODER), Some(0x64));
    assert_eq!(dev.mmio_read_u32(reg::MIICOMMAND), Some(0), "write-only");
    assert_eq!(dev.mmio_read_u32(reg::HASH0), Some(0));
    assert_eq!(dev.mmio_read_u32(reg::HASH1), Some(0));
    assert_eq!(dev.mmio_read_u32(reg::TXCTRL), Some(0));
}

#[test]
fn register_file_requires_aligned_word_accesses() {
    let (dev, _, _) = device();

    let mut byte = [0u8; 1];
    assert!(MmioDevice::read(&*dev, reg::MODER, &mut byte).is_err());
    assert!(MmioDevice::write(&*dev, reg::MODER, &byte).is_err());

    let mut word = [0u8; 4];
    assert!(MmioDevice::read(&*dev, reg::MODER + 2, &mut word).is_err());
    assert!(MmioDevice::read(&*dev, reg::MODER, &mut word).is_ok());

    // Past TXCTRL but below the ring there are no registers.
    assert!(MmioDevice::read(&*dev, 0x54, &mut word).is_err());
    assert!(MmioDevice::write(&*dev, 0x54, &word).is_err());
}

#[test]
fn bd_window_takes_arbitrary_access_sizes() {
    let (dev, _, _) = device();

    // Word write, byte-wise read-back.
    assert!(dev.mmio_write_u32(BD_BASE, 0xDDCC_BBAA));
    for (i, expected) in [0xAAu8, 0xBB, 0xCC, 0xDD].into_iter().enumerate() {
        let mut byte = [0u8; 1];
        MmioDevice::read(&*dev, BD_BASE + i as u64, &mut byte).unwrap();
        assert_eq!(byte[0], expected);
    }

    // Two-byte write straddling the data/ptr boundary of a descriptor.
    MmioDevice::write(&*dev, BD_BASE + 3, &[0x11, 0x22]).unwrap();
    assert_eq!(dev.mmio_read_u32(BD_BASE), Some(0x11CC_BBAA));
    assert_eq!(dev.mmio_read_u32(BD_BASE + 4).unwrap() & 0xFF, 0x22);

    // The last word of the ring is addressable...
    assert!(dev.mmio_write_u32(BD_BASE + 0x3FC, 0x5555_5555));
    assert_eq!(dev.mmio_read_u32(BD_BASE + 0x3FC), Some(0x5555_5555));

    // ...but nothing may spill past the window.
    assert!(MmioDevice::write(&*dev, BD_BASE + 0x3FE, &[0u8; 4]).is_err());
}

#[test]
fn bd_window_writes_wake_the_worker() {
    let (dev, tap, _) = device();
    let before = tap.wakes.load(Ordering::SeqCst);
    dev.mmio_write_u32(BD_BASE + 8, 0x8000);
    assert_eq!(tap.wakes.load(Ordering::SeqCst), before + 1);
}

#[test]
fn int_src_is_write_one_to_clear() {
    let (dev, tap, plic) = device();

    // Latch RXB by receiving a frame with the descriptor IRQ bit set.
    tap.rx.lock().unwrap().push_back(vec![0u8; 64]);
    dev.mmio_write_u32(reg::TX_BD_NUM, 2);
    // RX descriptor 2: empty, IRQ, buffer in RAM.
    dev.mmio_write_u32(BD_BASE + 2 * 8, 0x8000 | 0x4000);
    dev.mmio_write_u32(BD_BASE + 2 * 8 + 4, 0x8000_0100);
    dev.mmio_write_u32(reg::MODER, 0xA000 | 1); // RXEN
    dev.service(PollEvents::IN);

    let src = dev.mmio_read_u32(reg::INT_SRC).unwrap();
    assert_ne!(src & (1 << reg::INT_RXB), 0, "RXB should be latched");

    // Clearing an unrelated bit leaves RXB alone.
    dev.mmio_write_u32(reg::INT_SRC, 1 << reg::INT_TXB);
    assert_eq!(dev.mmio_read_u32(reg::INT_SRC).unwrap(), src);

    // Clearing RXB clears exactly it.
    dev.mmio_write_u32(reg::INT_SRC, 1 << reg::INT_RXB);
    assert_eq!(dev.mmio_read_u32(reg::INT_SRC).unwrap(), src & !(1 << reg::INT_RXB));

    // Masked while latched: no line raised so far.
    assert_eq!(plic.pending_mask(), 0);
}

#[test]
fn w1c_follows_the_src_and_not_the_write() {
    let (dev, tap, _) = device();
    // Latch RXB and RXE via a too-long frame with IRQ requested.
    tap.rx.lock().unwrap().push_back(vec![0u8; 300]);
    dev.mmio_write_u32(reg::PACKETLEN, 0x0040_0080); // max 128 bytes
    dev.mmio_write_u32(reg::TX_BD_NUM, 2);
    dev.mmio_write_u32(BD_BASE + 2 * 8, 0x8000 | 0x4000);
    dev.mmio_write_u32(BD_BASE + 2 * 8 + 4, 0x8000_0100);
    dev.mmio_write_u32(reg::MODER, 0xA000 | 1);
    dev.service(PollEvents::IN);

    let src = dev.mmio_read_u32(reg::INT_SRC).unwrap();
    assert_eq!(src, (1 << reg::INT_RXB) | (1 << reg::INT_RXE));

    // int_src' = int_src & !w for an arbitrary w.
    dev.mmio_write_u32(reg::INT_SRC, 0b0000100);
    assert_eq!(
        dev.mmio_read_u32(reg::INT_SRC).unwrap(),
        src & !0b0000100
    );
}

#[test]
fn unmasking_a_latched_source_raises_the_line() {
    let (dev, tap, plic) = device();
    tap.rx.lock().unwrap().push_back(vec![0u8; 64]);
    dev.mmio_write_u32(reg::TX_BD_NUM, 2);
    dev.mmio_write_u32(BD_BASE + 2 * 8, 0x8000 | 0x4000);
    dev.mmio_write_u32(BD_BASE + 2 * 8 + 4, 0x8000_0100);
    dev.mmio_write_u32(reg::MODER, 0xA000 | 1);
    dev.service(PollEvents::IN);

    assert_eq!(plic.pending_mask(), 0, "masked: nothing raised yet");

    // Writing the mask re-evaluates pending & mask.
    dev.mmio_write_u32(reg::INT_MASK, 1 << reg::INT_RXB);
    assert_eq!(plic.pending_mask(), 1 << 5);
}

#[test]
fn mac_address_registers_pack_bytes_and_reach_the_tap() {
    let (dev, tap, _) = device();

    dev.mmio_write_u32(reg::MAC_ADDR0, 0x2233_4455);
    dev.mmio_write_u32(reg::MAC_ADDR1, 0x0000_0011);
    assert_eq!(tap.mac(), [0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);

    // Reads consult the TAP first.
    tap.set_mac([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
    assert_eq!(dev.mmio_read_u32(reg::MAC_ADDR0), Some(0xCCDD_EEFF));
    assert_eq!(dev.mmio_read_u32(reg::MAC_ADDR1), Some(0x0000_AABB));
}

#[test]
fn moder_rising_edges_wake_the_worker() {
    let (dev, tap, _) = device();
    let base = tap.wakes.load(Ordering::SeqCst);

    dev.mmio_write_u32(reg::MODER, 0xA000 | 2); // TXEN 0 -> 1
    assert_eq!(tap.wakes.load(Ordering::SeqCst), base + 1);

    dev.mmio_write_u32(reg::MODER, 0xA000 | 3); // RXEN 0 -> 1, TXEN held
    assert_eq!(tap.wakes.load(Ordering::SeqCst), base + 2);

    // No edge, no wake.
    dev.mmio_write_u32(reg::MODER, 0xA000 | 3);
    assert_eq!(tap.wakes.load(Ordering::SeqCst), base + 2);
}
