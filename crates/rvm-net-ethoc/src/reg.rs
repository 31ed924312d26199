//! Register map of the MAC: word offsets, MODER bits, interrupt lines and
//! MII command/status bits.

use bitflags::bitflags;

pub const MODER: u64 = 0x00;
pub const INT_SRC: u64 = 0x04;
pub const INT_MASK: u64 = 0x08;
pub const IPGT: u64 = 0x0C;
pub const IPGR1: u64 = 0x10;
pub const IPGR2: u64 = 0x14;
pub const PACKETLEN: u64 = 0x18;
pub const COLLCONF: u64 = 0x1C;
pub const TX_BD_NUM: u64 = 0x20;
pub const CTRLMODER: u64 = 0x24;
pub const MIIMODER: u64 = 0x28;
pub const MIICOMMAND: u64 = 0x2C;
pub const MIIADDRESS: u64 = 0x30;
pub const MIITX_DATA: u64 = 0x34;
pub const MIIRX_DATA: u64 = 0x38;
pub const MIISTATUS: u64 = 0x3C;
pub const MAC_ADDR0: u64 = 0x40;
pub const MAC_ADDR1: u64 = 0x44;
pub const HASH0: u64 = 0x48;
pub const HASH1: u64 = 0x4C;
pub const TXCTRL: u64 = 0x50;

bitflags! {
    /// MODER mode register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Moder: u32 {
        const RXEN = 1 << 0;
        const TXEN = 1 << 1;
        const NOPRE = 1 << 2;
        const BRO = 1 << 3;
        const IAM = 1 << 4;
        const PRO = 1 << 5;
        const IFG = 1 << 6;
        const LOOPBCK = 1 << 7;
        const NOBCKOF = 1 << 8;
        const EXDFREN = 1 << 9;
        const FULLD = 1 << 10;
        const RST = 1 << 11;
        const DLYCRCEN = 1 << 12;
        const CRCEN = 1 << 13;
        const HUGEN = 1 << 14;
        const PAD = 1 << 15;
        const RECSMALL = 1 << 16;
    }
}

bitflags! {
    /// CTRLMODER control-frame register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CtrlModer: u32 {
        const PASSALL = 1 << 0;
        const RXFLOW = 1 << 1;
        const TXFLOW = 1 << 2;
    }
}

/// Interrupt source lines (bit numbers in INT_SRC/INT_MASK).
pub const INT_TXB: u32 = 0;
pub const INT_TXE: u32 = 1;
pub const INT_RXB: u32 = 2;
pub const INT_RXE: u32 = 3;
pub const INT_BUSY: u32 = 4;
pub const INT_TXC: u32 = 5;
pub const INT_RXC: u32 = 6;

/// MIICOMMAND bits. Reads of the register return 0.
pub const MIICOMMAND_SCANSTAT: u32 = 1 << 0;
pub const MIICOMMAND_RSTAT: u32 = 1 << 1;
pub const MIICOMMAND_WCTRLDATA: u32 = 1 << 2;

/// MIIMODER: clock divider in the low byte.
pub const MIIMODER_NOPRE: u32 = 1 << 8;
pub const MIIMODER_RST: u32 = 1 << 9;

/// MIISTATUS bits.
pub const MIISTATUS_LINKFAIL: u32 = 1 << 0;
pub const MIISTATUS_BUSY: u32 = 1 << 1;
pub const MIISTATUS_NVALID: u32 = 1 << 2;

/// TXCTRL: transmit-pause request.
pub const TXCTRL_TXPAUSERQ: u32 = 1 << 16;
