use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rvm_interrupts::IrqLine;
use rvm_mem::{GuestRam, MmioDevice, MmioFault, MmioRegion, MmioResult};
use rvm_net_backend::{PollEvents, Tap, MAX_FRAME_LEN};
use tracing::{debug, trace, warn};

use crate::bd::{self, BufferDesc};
use crate::mdio::Mdio;
use crate::reg::{self, Moder};

/// Size of the MMIO window: the register file below the descriptor ring.
pub const ETHOC_MMIO_SIZE: u64 = 0x800;

/// Offset of the buffer-descriptor ring inside the window.
pub const BD_BASE: u64 = 0x400;

/// Number of 8-byte descriptors in the ring.
pub const BD_COUNT: usize = 128;

struct EthOcState {
    bd: [BufferDesc; BD_COUNT],
    /// Next TX descriptor to transmit; always inside `[0, tx_bd_num)`.
    cur_txbd: u32,
    /// RX probe cursor; always inside `[tx_bd_num, BD_COUNT)`.
    cur_rxbd: u32,

    moder: u32,
    int_src: u32,
    int_mask: u32,
    packetlen: u32,
    collconf: u32,
    tx_bd_num: u32,
    ctrlmoder: u32,
    miimoder: u32,
    miiaddress: u32,
    miitx_data: u32,
    miirx_data: u32,
    miistatus: u32,
    hash: [u32; 2],
    txctrl: u32,
    macaddr: [u8; 6],
}

impl EthOcState {
    fn reset() -> Self {
        Self {
            bd: [BufferDesc::default(); BD_COUNT],
            cur_txbd: 0,
            cur_rxbd: 0,
            moder: (Moder::PAD | Moder::CRCEN).bits(),
            int_src: 0,
            int_mask: 0,
            // Minimum frame length in the high half, maximum in the low.
            packetlen: 0x0040_0600,
            collconf: 0xF003F,
            tx_bd_num: 0x40,
            ctrlmoder: 0,
            miimoder: 0x64,
            miiaddress: 0,
            miitx_data: 0,
            miirx_data: 0,
            miistatus: 0,
            hash: [0; 2],
            txctrl: 0,
            macaddr: [0; 6],
        }
    }

    fn moder(&self) -> Moder {
        Moder::from_bits_truncate(self.moder)
    }

    /// TX/RX split point, clamped so ring indexing stays in bounds whatever
    /// the guest wrote.
    fn tx_bd_count(&self) -> u32 {
        self.tx_bd_num.min(BD_COUNT as u32)
    }

    fn max_frame_len(&self) -> usize {
        (self.packetlen & 0xFFFF) as usize
    }

    fn min_frame_len(&self) -> usize {
        ((self.packetlen >> 16) & 0xFFFF) as usize
    }

    fn bd_read_bytes(&self, offset: usize, buf: &mut [u8]) {
        for (i, out) in buf.iter_mut().enumerate() {
            let byte = offset + i;
            *out = self.bd[byte / 8].byte(byte % 8);
        }
    }

    fn bd_write_bytes(&mut self, offset: usize, buf: &[u8]) {
        for (i, value) in buf.iter().enumerate() {
            let byte = offset + i;
            self.bd[byte / 8].set_byte(byte % 8, *value);
        }
    }

    /// Walk the RX partition from the cursor for a descriptor the MAC may
    /// fill, advancing the cursor past non-empty slots. Wraps back to the
    /// split point at a WRAP descriptor or the end of the ring; gives up
    /// after one full lap.
    fn probe_rx(&mut self) -> Option<usize> {
        let tx_num = self.tx_bd_count();
        if tx_num as usize >= BD_COUNT {
            return None;
        }
        if self.cur_rxbd < tx_num || self.cur_rxbd as usize >= BD_COUNT {
            self.cur_rxbd = tx_num;
        }
        let start = self.cur_rxbd;
        loop {
            let bd = self.bd[self.cur_rxbd as usize];
            if bd.is_rx_empty() {
                return Some(self.cur_rxbd as usize);
            }
            self.cur_rxbd = if bd.wraps() || self.cur_rxbd + 1 >= BD_COUNT as u32 {
                tx_num
            } else {
                self.cur_rxbd + 1
            };
            if self.cur_rxbd == start {
                return None;
            }
        }
    }
}

/// The MAC. MMIO handlers and the DMA worker share [`EthOcState`] under one
/// blocking mutex; the worker drops it around every TAP syscall.
pub struct EthOcDevice {
    state: Mutex<EthOcState>,
    tap: Arc<dyn Tap>,
    ram: Arc<GuestRam>,
    irq: IrqLine,
    mdio: Mdio,
    kill: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EthOcDevice {
    pub fn new(tap: Arc<dyn Tap>, ram: Arc<GuestRam>, irq: IrqLine) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(EthOcState::reset()),
            tap,
            ram,
            irq,
            mdio: Mdio::new(0),
            kill: AtomicBool::new(false),
            worker: Mutex::new(None),
        })
    }

    /// The MMIO descriptor for this device at `base`.
    ///
    /// The dispatch bounds admit 1..=4-byte accesses because the descriptor
    /// window takes arbitrary sizes; the word-only rule for the register file
    /// is enforced by the callbacks.
    pub fn region(self: &Arc<Self>, base: u64) -> MmioRegion {
        MmioRegion {
            begin: base,
            end: base + ETHOC_MMIO_SIZE,
            min_op_size: 1,
            max_op_size: 4,
            device: self.clone(),
        }
    }

    /// Start the DMA worker. Separate from `new` so a spawn failure can be
    /// handled by detaching the device.
    pub fn spawn_worker(self: &Arc<Self>) -> io::Result<()> {
        let dev = self.clone();
        let handle = std::thread::Builder::new()
            .name("ethoc-dma".into())
            .spawn(move || dev.worker_loop())?;
        *self.worker.lock().unwrap() = Some(handle);
        Ok(())
    }

    pub fn tap(&self) -> &Arc<dyn Tap> {
        &self.tap
    }

    /// Word read helper for integration code and tests.
    pub fn mmio_read_u32(&self, offset: u64) -> Option<u32> {
        let mut buf = [0u8; 4];
        MmioDevice::read(self, offset, &mut buf).ok()?;
        Some(u32::from_le_bytes(buf))
    }

    /// Word write helper for integration code and tests.
    pub fn mmio_write_u32(&self, offset: u64, value: u32) -> bool {
        MmioDevice::write(self, offset, &value.to_le_bytes()).is_ok()
    }

    /// Set bit `line` in INT_SRC and raise the PLIC line if unmasked.
    fn interrupt(&self, st: &mut EthOcState, line: u32) {
        st.int_src |= 1 << line;
        if st.int_mask & (1 << line) == 0 {
            return;
        }
        self.irq.raise();
    }

    fn reg_read(&self, offset: u64) -> Result<u32, MmioFault> {
        // MAC-address reads consult the TAP; keep the ioctl outside the lock.
        let tap_mac = matches!(offset, reg::MAC_ADDR0 | reg::MAC_ADDR1).then(|| self.tap.mac());

        let mut st = self.state.lock().unwrap();
        let value = match offset {
            reg::MODER => st.moder,
            reg::INT_SRC => st.int_src,
            reg::INT_MASK => st.int_mask,
            reg::IPGT | reg::IPGR1 | reg::IPGR2 => 0,
            reg::PACKETLEN => st.packetlen,
            reg::COLLCONF => st.collconf,
            reg::TX_BD_NUM => st.tx_bd_num,
            reg::CTRLMODER => st.ctrlmoder,
            reg::MIIMODER => st.miimoder,
            reg::MIICOMMAND => 0,
            reg::MIIADDRESS => st.miiaddress,
            reg::MIITX_DATA => st.miitx_data,
            reg::MIIRX_DATA => st.miirx_data,
            reg::MIISTATUS => st.miistatus,
            reg::MAC_ADDR0 => {
                st.macaddr = tap_mac.unwrap_or(st.macaddr);
                u32::from(st.macaddr[5])
                    | u32::from(st.macaddr[4]) << 8
                    | u32::from(st.macaddr[3]) << 16
                    | u32::from(st.macaddr[2]) << 24
            }
            reg::MAC_ADDR1 => {
                st.macaddr = tap_mac.unwrap_or(st.macaddr);
                u32::from(st.macaddr[1]) | u32::from(st.macaddr[0]) << 8
            }
            reg::HASH0 => st.hash[0],
            reg::HASH1 => st.hash[1],
            reg::TXCTRL => st.txctrl,
            _ => return Err(MmioFault),
        };
        Ok(value)
    }

    fn reg_write(&self, offset: u64, value: u32) -> MmioResult {
        // MII status lives on the TAP side; sample it before locking so the
        // lock never spans a syscall.
        let link_up = (offset == reg::MIICOMMAND).then(|| self.tap.link_up());

        let mut wake = false;
        let mut mac_update = None;
        {
            let mut st = self.state.lock().unwrap();
            match offset {
                reg::MODER => {
                    let prev = st.moder();
                    st.moder = value;
                    let now = st.moder();
                    if !prev.contains(Moder::RXEN) && now.contains(Moder::RXEN) {
                        st.cur_rxbd = st.tx_bd_count();
                        wake = true;
                    }
                    if !prev.contains(Moder::TXEN) && now.contains(Moder::TXEN) {
                        st.cur_txbd = 0;
                        wake = true;
                    }
                }
                reg::INT_SRC => {
                    // Write-1-to-clear; a still-unmasked residue re-raises.
                    st.int_src &= !value;
                    if st.int_src & st.int_mask != 0 {
                        self.irq.raise();
                    }
                }
                reg::INT_MASK => {
                    st.int_mask = value;
                    if st.int_src & st.int_mask != 0 {
                        self.irq.raise();
                    }
                }
                reg::IPGT | reg::IPGR1 | reg::IPGR2 => {}
                reg::PACKETLEN => st.packetlen = value,
                reg::COLLCONF => st.collconf = value,
                reg::TX_BD_NUM => st.tx_bd_num = value,
                reg::CTRLMODER => st.ctrlmoder = value,
                reg::MIIMODER => st.miimoder = value,
                reg::MIICOMMAND => {
                    let phy = (st.miiaddress & 0x1F) as u8;
                    let mii_reg = ((st.miiaddress >> 8) & 0x1F) as u8;
                    if value & reg::MIICOMMAND_RSTAT != 0 {
                        st.miirx_data =
                            u32::from(self.mdio.read(phy, mii_reg, link_up.unwrap_or(false)));
                    } else if value & reg::MIICOMMAND_WCTRLDATA != 0 {
                        self.mdio.write(phy, mii_reg, st.miitx_data as u16);
                    }
                }
                reg::MIIADDRESS => st.miiaddress = value,
                reg::MIITX_DATA => st.miitx_data = value,
                // Read-only; latched by RSTAT.
                reg::MIIRX_DATA => {}
                reg::MIISTATUS => st.miistatus = value,
                reg::MAC_ADDR0 => {
                    st.macaddr[5] = value as u8;
                    st.macaddr[4] = (value >> 8) as u8;
                    st.macaddr[3] = (value >> 16) as u8;
                    st.macaddr[2] = (value >> 24) as u8;
                    mac_update = Some(st.macaddr);
                }
                reg::MAC_ADDR1 => {
                    st.macaddr[1] = value as u8;
                    st.macaddr[0] = (value >> 8) as u8;
                    mac_update = Some(st.macaddr);
                }
                reg::HASH0 => st.hash[0] = value,
                reg::HASH1 => st.hash[1] = value,
                reg::TXCTRL => st.txctrl = value,
                _ => return Err(MmioFault),
            }
        }

        if let Some(mac) = mac_update {
            self.tap.set_mac(mac);
        }
        if wake {
            self.tap.wake();
        }
        Ok(())
    }

    /// Step 1 of the worker: what to wait for, given the ring state.
    pub fn poll_interest(&self) -> PollEvents {
        let mut st = self.state.lock().unwrap();
        let mut interest = PollEvents::empty();
        if st.moder().contains(Moder::TXEN) {
            let tx_num = st.tx_bd_count();
            if tx_num > 0 {
                if st.cur_txbd >= tx_num {
                    st.cur_txbd = 0;
                }
                if st.bd[st.cur_txbd as usize].is_tx_ready() {
                    interest |= PollEvents::OUT;
                }
            }
        }
        if st.moder().contains(Moder::RXEN) && st.probe_rx().is_some() {
            interest |= PollEvents::IN;
        }
        interest
    }

    /// Drive the RX and/or TX DMA steps once. The worker calls this after
    /// `tap.poll`; tests call it directly with a scripted TAP.
    pub fn service(&self, events: PollEvents) {
        if events.contains(PollEvents::IN) {
            self.service_rx();
        }
        if events.contains(PollEvents::OUT) {
            self.service_tx();
        }
    }

    fn service_rx(&self) {
        let (index, ptr) = {
            let mut st = self.state.lock().unwrap();
            if !st.moder().contains(Moder::RXEN) {
                return;
            }
            let Some(index) = st.probe_rx() else {
                // No free descriptor; leave the frame queued on the TAP.
                return;
            };
            st.bd[index].clear_flag(bd::RXBD_EMPTY);
            (index, st.bd[index].ptr())
        };

        let mut scratch = vec![0u8; MAX_FRAME_LEN];
        let received = self.tap.recv(&mut scratch);

        let mut st = self.state.lock().unwrap();
        match received {
            Err(err) => {
                // No generic error flag exists; invalid-symbol is the
                // closest thing.
                debug!("ethoc rx failed: {err}");
                st.bd[index].set_flag(bd::RXBD_INVALID_SYMBOL);
                self.interrupt(&mut st, reg::INT_RXE);
            }
            Ok(n) => {
                if self.ram.write_from(u64::from(ptr), &scratch[..n]).is_ok() {
                    st.bd[index].set_len(n as u16);
                } else {
                    st.bd[index].set_flag(bd::RXBD_OVERRUN);
                    self.interrupt(&mut st, reg::INT_RXE);
                }

                if n > st.max_frame_len() {
                    st.bd[index].set_flag(bd::RXBD_TOO_LONG);
                    self.interrupt(&mut st, reg::INT_RXE);
                } else if !st.moder().contains(Moder::PAD)
                    && !st.moder().contains(Moder::RECSMALL)
                    && n < st.min_frame_len()
                {
                    st.bd[index].set_flag(bd::RXBD_SHORT_FRAME);
                    self.interrupt(&mut st, reg::INT_RXE);
                }

                trace!("ethoc rx: bd {index}, {n} bytes");
                if st.bd[index].wants_irq() {
                    self.interrupt(&mut st, reg::INT_RXB);
                }
            }
        }
    }

    fn service_tx(&self) {
        let (index, ptr, len) = {
            let mut st = self.state.lock().unwrap();
            if !st.moder().contains(Moder::TXEN) {
                return;
            }
            let tx_num = st.tx_bd_count();
            if tx_num == 0 {
                return;
            }
            if st.cur_txbd >= tx_num {
                st.cur_txbd = 0;
            }
            let index = st.cur_txbd as usize;
            let bd = st.bd[index];
            if !bd.is_tx_ready() {
                return;
            }
            // Advance past the consumed slot; wrap to 0 at a WRAP descriptor
            // or the end of the TX partition.
            st.cur_txbd = if bd.wraps() || st.cur_txbd + 1 >= tx_num {
                0
            } else {
                st.cur_txbd + 1
            };
            (index, bd.ptr(), usize::from(bd.len()))
        };

        let mut scratch = vec![0u8; len];
        if self.ram.read_into(u64::from(ptr), &mut scratch).is_err() {
            let mut st = self.state.lock().unwrap();
            st.bd[index].clear_flag(bd::TXBD_READY);
            st.bd[index].set_flag(bd::TXBD_CARRIER_LOST);
            self.interrupt(&mut st, reg::INT_TXE);
            return;
        }

        let sent = self.tap.send(&scratch);

        let mut st = self.state.lock().unwrap();
        st.bd[index].clear_flag(bd::TXBD_READY);
        match sent {
            Err(err) => {
                debug!("ethoc tx failed: {err}");
                st.bd[index].set_flag(bd::TXBD_RETRY_LIMIT);
                self.interrupt(&mut st, reg::INT_TXE);
            }
            Ok(n) if n < len => {
                st.bd[index].set_flag(bd::TXBD_UNDERRUN);
                self.interrupt(&mut st, reg::INT_TXE);
            }
            Ok(n) => {
                trace!("ethoc tx: bd {index}, {n} bytes");
                if st.bd[index].wants_irq() {
                    self.interrupt(&mut st, reg::INT_TXB);
                }
            }
        }
    }

    fn worker_loop(&self) {
        while !self.kill.load(Ordering::Acquire) {
            let interest = self.poll_interest();
            let events = match self.tap.poll(interest, None) {
                Ok(events) => events,
                Err(err) => {
                    warn!("ethoc poll failed: {err}");
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                }
            };
            // A wake may mean shutdown; check before touching the ring.
            if self.kill.load(Ordering::Acquire) {
                break;
            }
            self.service(events);
        }
        debug!("ethoc worker exiting");
    }
}

impl MmioDevice for EthOcDevice {
    fn name(&self) -> &'static str {
        "ethernet_oc"
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> MmioResult {
        if offset < BD_BASE {
            // The register file takes aligned word accesses only.
            if buf.len() != 4 || offset % 4 != 0 {
                return Err(MmioFault);
            }
            let value = self.reg_read(offset)?;
            buf.copy_from_slice(&value.to_le_bytes());
            Ok(())
        } else if offset + buf.len() as u64 <= ETHOC_MMIO_SIZE {
            let st = self.state.lock().unwrap();
            st.bd_read_bytes((offset - BD_BASE) as usize, buf);
            Ok(())
        } else {
            Err(MmioFault)
        }
    }

    fn write(&self, offset: u64, buf: &[u8]) -> MmioResult {
        if offset < BD_BASE {
            if buf.len() != 4 || offset % 4 != 0 {
                return Err(MmioFault);
            }
            self.reg_write(offset, u32::from_le_bytes(buf.try_into().unwrap()))
        } else if offset + buf.len() as u64 <= ETHOC_MMIO_SIZE {
            {
                let mut st = self.state.lock().unwrap();
                st.bd_write_bytes((offset - BD_BASE) as usize, buf);
            }
            // The worker may be blocked waiting for exactly this descriptor.
            self.tap.wake();
            Ok(())
        } else {
            Err(MmioFault)
        }
    }

    /// Stop the DMA worker and drop the TAP: kill flag, wake, join.
    fn remove(&self) {
        self.kill.store(true, Ordering::Release);
        self.tap.wake();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            if worker.join().is_err() {
                warn!("ethoc worker panicked during shutdown");
            }
        }
    }
}
