use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rvm_interrupts::{IrqLine, Plic};
use rvm_mem::GuestRam;
use rvm_net_ethoc::bd::{BD_IRQ, BD_WRAP, TXBD_CARRIER_LOST, TXBD_READY, TXBD_RETRY_LIMIT, TXBD_UNDERRUN};
use rvm_net_ethoc::{reg, EthOcDevice, BD_BASE};
use rvm_net_backend::{PollEvents, Tap, TapError};

const MODER_BASE: u32 = 0xA000; // PAD | CRCEN reset state
const TXEN: u32 = 1 << 1;
const IRQ_LINE: u32 = 5;

/// TAP double whose send results can be scripted per call.
#[derive(Default)]
struct TxTap {
    sends: Mutex<Vec<Vec<u8>>>,
    results: Mutex<VecDeque<Result<usize, TapError>>>,
}

impl TxTap {
    fn script(&self, result: Result<usize, TapError>) {
        self.results.lock().unwrap().push_back(result);
    }
}

impl Tap for TxTap {
    fn poll(&self, interest: PollEvents, _timeout: Option<Duration>) -> Result<PollEvents, TapError> {
        Ok(interest & PollEvents::OUT)
    }

    fn recv(&self, _buf: &mut [u8]) -> Result<usize, TapError> {
        Err(TapError::WouldBlock)
    }

    fn send(&self, buf: &[u8]) -> Result<usize, TapError> {
        self.sends.lock().unwrap().push(buf.to_vec());
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(buf.len()))
    }

    fn wake(&self) {}

    fn mac(&self) -> [u8; 6] {
        [0x52, 0x54, 0x00, 0x12, 0x34, 0x56]
    }

    fn set_mac(&self, _mac: [u8; 6]) {}

    fn link_up(&self) -> bool {
        true
    }
}

struct TxRig {
    dev: Arc<EthOcDevice>,
    tap: Arc<TxTap>,
    ram: Arc<GuestRam>,
    plic: Arc<Plic>,
}

fn rig() -> TxRig {
    let tap = Arc::new(TxTap::default());
    let ram = Arc::new(GuestRam::new(0x8000_0000, 0x10000).unwrap());
    let plic = Arc::new(Plic::new(vec![]));
    let dev = EthOcDevice::new(tap.clone(), ram.clone(), IrqLine::new(plic.clone(), IRQ_LINE));
    TxRig { dev, tap, ram, plic }
}

impl TxRig {
    fn write_bd(&self, index: u64, data: u32, ptr: u32) {
        assert!(self.dev.mmio_write_u32(BD_BASE + index * 8, data));
        assert!(self.dev.mmio_write_u32(BD_BASE + index * 8 + 4, ptr));
    }

    fn bd_data(&self, index: u64) -> u32 {
        self.dev.mmio_read_u32(BD_BASE + index * 8).unwrap()
    }

    fn int_src(&self) -> u32 {
        self.dev.mmio_read_u32(reg::INT_SRC).unwrap()
    }
}

#[test]
fn tx_happy_path_sends_once_and_raises_txb() {
    let rig = rig();
    let payload = b"hello over the wire";

    rig.ram.write_from(0x8000_2000, payload).unwrap();
    rig.dev.mmio_write_u32(reg::TX_BD_NUM, 4);
    rig.dev.mmio_write_u32(reg::INT_MASK, 1 << reg::INT_TXB);
    rig.write_bd(
        0,
        TXBD_READY | BD_IRQ | (payload.len() as u32) << 16,
        0x8000_2000,
    );

    rig.dev.mmio_write_u32(reg::MODER, MODER_BASE | TXEN);
    assert_eq!(rig.dev.poll_interest(), PollEvents::OUT);
    rig.dev.service(PollEvents::OUT);

    let sends = rig.tap.sends.lock().unwrap().clone();
    assert_eq!(sends, vec![payload.to_vec()], "exactly one send of the payload");

    assert_eq!(rig.bd_data(0) & TXBD_READY, 0, "READY must be cleared");
    assert_eq!(rig.int_src(), 1 << reg::INT_TXB);
    assert_eq!(rig.plic.pending_mask(), 1 << IRQ_LINE);

    // Descriptor consumed; nothing further to send.
    assert_eq!(rig.dev.poll_interest(), PollEvents::empty());
}

#[test]
fn tx_cursor_advances_through_the_partition() {
    let rig = rig();
    for (i, addr) in [0x8000_1000u32, 0x8000_1100, 0x8000_1200].iter().enumerate() {
        rig.ram.write_from(*addr as u64, &[i as u8; 16]).unwrap();
        rig.write_bd(i as u64, TXBD_READY | 16 << 16, *addr);
    }
    rig.dev.mmio_write_u32(reg::TX_BD_NUM, 4);
    rig.dev.mmio_write_u32(reg::MODER, MODER_BASE | TXEN);

    for _ in 0..3 {
        rig.dev.service(PollEvents::OUT);
    }
    let sends = rig.tap.sends.lock().unwrap().clone();
    assert_eq!(sends.len(), 3);
    assert_eq!(sends[0], vec![0u8; 16]);
    assert_eq!(sends[1], vec![1u8; 16]);
    assert_eq!(sends[2], vec![2u8; 16]);
}

#[test]
fn wrap_descriptor_sends_then_returns_the_cursor_to_zero() {
    let rig = rig();
    rig.dev.mmio_write_u32(reg::TX_BD_NUM, 4);

    // Walk the cursor to descriptor 3.
    for i in 0..3u64 {
        rig.ram
            .write_from(0x8000_1000 + i * 0x100, &[i as u8; 8])
            .unwrap();
        rig.write_bd(i, TXBD_READY | 8 << 16, 0x8000_1000 + i as u32 * 0x100);
    }
    rig.dev.mmio_write_u32(reg::MODER, MODER_BASE | TXEN);
    for _ in 0..3 {
        rig.dev.service(PollEvents::OUT);
    }

    // Descriptor 3 carries WRAP; after it completes the cursor is back at 0.
    rig.ram.write_from(0x8000_1300, b"wrapped!").unwrap();
    rig.write_bd(3, TXBD_READY | BD_WRAP | 8 << 16, 0x8000_1300);
    rig.dev.service(PollEvents::OUT);

    rig.ram.write_from(0x8000_1000, b"fromzero").unwrap();
    rig.write_bd(0, TXBD_READY | 8 << 16, 0x8000_1000);
    rig.dev.service(PollEvents::OUT);

    let sends = rig.tap.sends.lock().unwrap().clone();
    assert_eq!(sends[3], b"wrapped!".to_vec());
    assert_eq!(sends[4], b"fromzero".to_vec(), "cursor wrapped to descriptor 0");
}

#[test]
fn enabling_txen_rewinds_the_cursor_to_descriptor_zero() {
    let rig = rig();
    rig.dev.mmio_write_u32(reg::TX_BD_NUM, 4);

    rig.write_bd(0, TXBD_READY | 4 << 16, 0x8000_1000);
    rig.write_bd(1, TXBD_READY | 4 << 16, 0x8000_1010);
    rig.dev.mmio_write_u32(reg::MODER, MODER_BASE | TXEN);
    rig.dev.service(PollEvents::OUT);
    rig.dev.service(PollEvents::OUT); // cursor now at 2

    // Drop TXEN, re-raise it: the rising edge rewinds to 0.
    rig.dev.mmio_write_u32(reg::MODER, MODER_BASE);
    rig.write_bd(0, TXBD_READY | 4 << 16, 0x8000_1000);
    rig.dev.mmio_write_u32(reg::MODER, MODER_BASE | TXEN);
    rig.dev.service(PollEvents::OUT);

    assert_eq!(rig.tap.sends.lock().unwrap().len(), 3);
    assert_eq!(rig.bd_data(0) & TXBD_READY, 0, "descriptor 0 was re-sent");
}

#[test]
fn descriptor_without_ready_is_skipped() {
    let rig = rig();
    rig.dev.mmio_write_u32(reg::TX_BD_NUM, 4);
    rig.write_bd(0, 8 << 16, 0x8000_1000);
    rig.dev.mmio_write_u32(reg::MODER, MODER_BASE | TXEN);

    assert_eq!(rig.dev.poll_interest(), PollEvents::empty());
    rig.dev.service(PollEvents::OUT);
    assert!(rig.tap.sends.lock().unwrap().is_empty());
}

#[test]
fn send_error_sets_retry_limit_and_txe() {
    let rig = rig();
    rig.tap.script(Err(TapError::Closed));
    rig.dev.mmio_write_u32(reg::TX_BD_NUM, 4);
    rig.write_bd(0, TXBD_READY | BD_IRQ | 8 << 16, 0x8000_1000);
    rig.dev.mmio_write_u32(reg::MODER, MODER_BASE | TXEN);

    rig.dev.service(PollEvents::OUT);

    let data = rig.bd_data(0);
    assert_eq!(data & TXBD_READY, 0);
    assert_ne!(data & TXBD_RETRY_LIMIT, 0);
    assert_eq!(rig.int_src(), 1 << reg::INT_TXE, "no TXB on a failed send");
}

#[test]
fn partial_send_sets_underrun_and_txe() {
    let rig = rig();
    rig.tap.script(Ok(4));
    rig.dev.mmio_write_u32(reg::TX_BD_NUM, 4);
    rig.write_bd(0, TXBD_READY | 16 << 16, 0x8000_1000);
    rig.dev.mmio_write_u32(reg::MODER, MODER_BASE | TXEN);

    rig.dev.service(PollEvents::OUT);

    assert_ne!(rig.bd_data(0) & TXBD_UNDERRUN, 0);
    assert_eq!(rig.int_src(), 1 << reg::INT_TXE);
}

#[test]
fn unreadable_buffer_sets_carrier_sense_and_txe_without_sending() {
    let rig = rig();
    rig.dev.mmio_write_u32(reg::TX_BD_NUM, 4);
    // Pointer far outside guest RAM.
    rig.write_bd(0, TXBD_READY | 16 << 16, 0x1000_0000);
    rig.dev.mmio_write_u32(reg::MODER, MODER_BASE | TXEN);

    rig.dev.service(PollEvents::OUT);

    assert!(rig.tap.sends.lock().unwrap().is_empty(), "nothing reached the wire");
    let data = rig.bd_data(0);
    assert_eq!(data & TXBD_READY, 0);
    assert_ne!(data & TXBD_CARRIER_LOST, 0);
    assert_eq!(rig.int_src(), 1 << reg::INT_TXE);
}

#[test]
fn tx_while_disabled_does_nothing() {
    let rig = rig();
    rig.dev.mmio_write_u32(reg::TX_BD_NUM, 4);
    rig.write_bd(0, TXBD_READY | 8 << 16, 0x8000_1000);

    // TXEN never set.
    assert_eq!(rig.dev.poll_interest(), PollEvents::empty());
    rig.dev.service(PollEvents::OUT);
    assert!(rig.tap.sends.lock().unwrap().is_empty());
    assert_ne!(rig.bd_data(0) & TXBD_READY, 0, "descriptor untouched");
}
