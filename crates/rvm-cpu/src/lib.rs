//! RV32 hart: register file, instruction decode and the RV32I opcode table.

pub mod decode;
mod hart;
mod regs;
mod rv32i;

pub use hart::{Hart, HartState, PrivMode, Trap};
pub use regs::Register;
pub use rv32i::{OpcodeFn, OpcodeTable};
