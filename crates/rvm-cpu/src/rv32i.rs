//! RV32I integer instruction handlers and the dispatch table.
//!
//! The table is indexed by the composed funct id (major opcode bits [6:2]
//! plus funct3, see [`crate::decode::funct_id`]) and built once per machine.
//! Opcodes whose funct3 bits belong to the immediate (LUI, AUIPC, JAL) are
//! "smudged": the same handler sits in every funct3 slot of the opcode, so a
//! decoded instruction is always a single indexed call.

use tracing::trace;

use crate::decode;
use crate::Hart;

pub type OpcodeFn = fn(&mut Hart, u32);

/// Major opcodes, already shifted down by the two always-set low bits.
mod opc {
    pub const LOAD: u32 = 0x00;
    pub const FENCE: u32 = 0x03;
    pub const OP_IMM: u32 = 0x04;
    pub const AUIPC: u32 = 0x05;
    pub const STORE: u32 = 0x08;
    pub const OP: u32 = 0x0C;
    pub const LUI: u32 = 0x0D;
    pub const BRANCH: u32 = 0x18;
    pub const JALR: u32 = 0x19;
    pub const JAL: u32 = 0x1B;
    pub const SYSTEM: u32 = 0x1C;
}

/// Immutable dispatch table shared by every hart of a machine.
pub struct OpcodeTable {
    slots: [Option<OpcodeFn>; 256],
}

impl OpcodeTable {
    /// The RV32I base table.
    pub fn rv32i() -> Self {
        let mut table = Self { slots: [None; 256] };

        table.smudge(opc::LUI, lui);
        table.smudge(opc::AUIPC, auipc);
        table.smudge(opc::JAL, jal);

        table.set(opc::OP_IMM, 0, addi);
        table.set(opc::OP_IMM, 1, slli);
        table.set(opc::OP_IMM, 2, slti);
        table.set(opc::OP_IMM, 3, sltiu);
        table.set(opc::OP_IMM, 4, xori);
        table.set(opc::OP_IMM, 5, srli_srai);
        table.set(opc::OP_IMM, 6, ori);
        table.set(opc::OP_IMM, 7, andi);

        table.set(opc::OP, 0, add_sub);
        table.set(opc::OP, 1, sll);
        table.set(opc::OP, 2, slt);
        table.set(opc::OP, 3, sltu);
        table.set(opc::OP, 4, xor);
        table.set(opc::OP, 5, srl_sra);
        table.set(opc::OP, 6, or);
        table.set(opc::OP, 7, and);

        table.set(opc::JALR, 0, jalr);
        table.set(opc::BRANCH, 0, beq);
        table.set(opc::BRANCH, 1, bne);
        table.set(opc::BRANCH, 4, blt);
        table.set(opc::BRANCH, 5, bge);
        table.set(opc::BRANCH, 6, bltu);
        table.set(opc::BRANCH, 7, bgeu);

        table.set(opc::LOAD, 0, lb);
        table.set(opc::LOAD, 1, lh);
        table.set(opc::LOAD, 2, lw);
        table.set(opc::LOAD, 4, lbu);
        table.set(opc::LOAD, 5, lhu);
        table.set(opc::STORE, 0, sb);
        table.set(opc::STORE, 1, sh);
        table.set(opc::STORE, 2, sw);

        table.set(opc::FENCE, 0, fence);
        table.set(opc::SYSTEM, 0, ecall_ebreak);

        table
    }

    fn set(&mut self, opcode: u32, funct3: u32, handler: OpcodeFn) {
        self.slots[(opcode | funct3 << 5) as usize] = Some(handler);
    }

    /// Register `handler` at every funct3 slot of `opcode`.
    fn smudge(&mut self, opcode: u32, handler: OpcodeFn) {
        for funct3 in 0..8 {
            self.set(opcode, funct3, handler);
        }
    }

    pub fn lookup(&self, inst: u32) -> Option<OpcodeFn> {
        self.slots[decode::funct_id(inst)]
    }
}

fn lui(hart: &mut Hart, inst: u32) {
    let rd = decode::rd(inst);
    let imm = decode::imm_u(inst);
    hart.write_reg(rd, imm);
    trace!("lui {rd},{:#x}", imm >> 12);
}

fn auipc(hart: &mut Hart, inst: u32) {
    let rd = decode::rd(inst);
    let imm = decode::imm_u(inst);
    hart.write_reg(rd, hart.pc().wrapping_add(imm));
    trace!("auipc {rd},{:#x}", imm >> 12);
}

fn addi(hart: &mut Hart, inst: u32) {
    let (rd, rs1) = (decode::rd(inst), decode::rs1(inst));
    let imm = decode::imm_i(inst);
    hart.write_reg_signed(rd, hart.read_reg_signed(rs1).wrapping_add(imm));
    trace!("addi {rd},{rs1},{imm}");
}

fn slti(hart: &mut Hart, inst: u32) {
    let (rd, rs1) = (decode::rd(inst), decode::rs1(inst));
    let imm = decode::imm_i(inst);
    hart.write_reg(rd, (hart.read_reg_signed(rs1) < imm) as u32);
    trace!("slti {rd},{rs1},{imm}");
}

fn sltiu(hart: &mut Hart, inst: u32) {
    let (rd, rs1) = (decode::rd(inst), decode::rs1(inst));
    // The immediate is sign-extended first, then compared unsigned.
    let imm = decode::imm_i(inst) as u32;
    hart.write_reg(rd, (hart.read_reg(rs1) < imm) as u32);
    trace!("sltiu {rd},{rs1},{imm}");
}

fn xori(hart: &mut Hart, inst: u32) {
    let (rd, rs1) = (decode::rd(inst), decode::rs1(inst));
    let imm = decode::imm_i(inst) as u32;
    hart.write_reg(rd, hart.read_reg(rs1) ^ imm);
    trace!("xori {rd},{rs1},{imm:#x}");
}

fn ori(hart: &mut Hart, inst: u32) {
    let (rd, rs1) = (decode::rd(inst), decode::rs1(inst));
    let imm = decode::imm_i(inst) as u32;
    hart.write_reg(rd, hart.read_reg(rs1) | imm);
    trace!("ori {rd},{rs1},{imm:#x}");
}

fn andi(hart: &mut Hart, inst: u32) {
    let (rd, rs1) = (decode::rd(inst), decode::rs1(inst));
    let imm = decode::imm_i(inst) as u32;
    hart.write_reg(rd, hart.read_reg(rs1) & imm);
    trace!("andi {rd},{rs1},{imm:#x}");
}

fn slli(hart: &mut Hart, inst: u32) {
    let (rd, rs1) = (decode::rd(inst), decode::rs1(inst));
    let shamt = decode::shamt(inst);
    hart.write_reg(rd, hart.read_reg(rs1) << shamt);
    trace!("slli {rd},{rs1},{shamt}");
}

fn srli_srai(hart: &mut Hart, inst: u32) {
    let (rd, rs1) = (decode::rd(inst), decode::rs1(inst));
    let shamt = decode::shamt(inst);
    // Bit 30 selects the arithmetic variant.
    if inst & (1 << 30) != 0 {
        hart.write_reg_signed(rd, hart.read_reg_signed(rs1) >> shamt);
        trace!("srai {rd},{rs1},{shamt}");
    } else {
        hart.write_reg(rd, hart.read_reg(rs1) >> shamt);
        trace!("srli {rd},{rs1},{shamt}");
    }
}

fn add_sub(hart: &mut Hart, inst: u32) {
    let (rd, rs1, rs2) = (decode::rd(inst), decode::rs1(inst), decode::rs2(inst));
    let (a, b) = (hart.read_reg_signed(rs1), hart.read_reg_signed(rs2));
    if decode::funct7(inst) == 0x20 {
        hart.write_reg_signed(rd, a.wrapping_sub(b));
        trace!("sub {rd},{rs1},{rs2}");
    } else {
        hart.write_reg_signed(rd, a.wrapping_add(b));
        trace!("add {rd},{rs1},{rs2}");
    }
}

fn sll(hart: &mut Hart, inst: u32) {
    let (rd, rs1, rs2) = (decode::rd(inst), decode::rs1(inst), decode::rs2(inst));
    let shamt = hart.read_reg(rs2) & 0x1F;
    hart.write_reg(rd, hart.read_reg(rs1) << shamt);
    trace!("sll {rd},{rs1},{rs2}");
}

fn slt(hart: &mut Hart, inst: u32) {
    let (rd, rs1, rs2) = (decode::rd(inst), decode::rs1(inst), decode::rs2(inst));
    hart.write_reg(rd, (hart.read_reg_signed(rs1) < hart.read_reg_signed(rs2)) as u32);
    trace!("slt {rd},{rs1},{rs2}");
}

fn sltu(hart: &mut Hart, inst: u32) {
    let (rd, rs1, rs2) = (decode::rd(inst), decode::rs1(inst), decode::rs2(inst));
    hart.write_reg(rd, (hart.read_reg(rs1) < hart.read_reg(rs2)) as u32);
    trace!("sltu {rd},{rs1},{rs2}");
}

fn xor(hart: &mut Hart, inst: u32) {
    let (rd, rs1, rs2) = (decode::rd(inst), decode::rs1(inst), decode::rs2(inst));
    hart.write_reg(rd, hart.read_reg(rs1) ^ hart.read_reg(rs2));
    trace!("xor {rd},{rs1},{rs2}");
}

fn or(hart: &mut Hart, inst: u32) {
    let (rd, rs1, rs2) = (decode::rd(inst), decode::rs1(inst), decode::rs2(inst));
    hart.write_reg(rd, hart.read_reg(rs1) | hart.read_reg(rs2));
    trace!("or {rd},{rs1},{rs2}");
}

fn and(hart: &mut Hart, inst: u32) {
    let (rd, rs1, rs2) = (decode::rd(inst), decode::rs1(inst), decode::rs2(inst));
    hart.write_reg(rd, hart.read_reg(rs1) & hart.read_reg(rs2));
    trace!("and {rd},{rs1},{rs2}");
}

fn srl_sra(hart: &mut Hart, inst: u32) {
    let (rd, rs1, rs2) = (decode::rd(inst), decode::rs1(inst), decode::rs2(inst));
    let shamt = hart.read_reg(rs2) & 0x1F;
    if decode::funct7(inst) == 0x20 {
        hart.write_reg_signed(rd, hart.read_reg_signed(rs1) >> shamt);
        trace!("sra {rd},{rs1},{rs2}");
    } else {
        hart.write_reg(rd, hart.read_reg(rs1) >> shamt);
        trace!("srl {rd},{rs1},{rs2}");
    }
}

// Control transfer, memory and environment instructions are routed through
// the table but modeled outside this core; the handlers only trace.

fn jal(_hart: &mut Hart, inst: u32) {
    trace!("jal {},{}: not modeled here", decode::rd(inst), decode::imm_j(inst));
}

fn jalr(_hart: &mut Hart, inst: u32) {
    trace!("jalr {},{}: not modeled here", decode::rd(inst), decode::imm_i(inst));
}

macro_rules! routed_branch {
    ($($name:ident)*) => {$(
        fn $name(_hart: &mut Hart, inst: u32) {
            trace!(
                concat!(stringify!($name), " {},{},{}: not modeled here"),
                decode::rs1(inst),
                decode::rs2(inst),
                decode::imm_b(inst)
            );
        }
    )*};
}

routed_branch!(beq bne blt bge bltu bgeu);

macro_rules! routed_load {
    ($($name:ident)*) => {$(
        fn $name(_hart: &mut Hart, inst: u32) {
            trace!(
                concat!(stringify!($name), " {},{}({}): not modeled here"),
                decode::rd(inst),
                decode::imm_i(inst),
                decode::rs1(inst)
            );
        }
    )*};
}

routed_load!(lb lh lw lbu lhu);

macro_rules! routed_store {
    ($($name:ident)*) => {$(
        fn $name(_hart: &mut Hart, inst: u32) {
            trace!(
                concat!(stringify!($name), " {},{}({}): not modeled here"),
                decode::rs2(inst),
                decode::imm_s(inst),
                decode::rs1(inst)
            );
        }
    )*};
}

routed_store!(sb sh sw);

fn fence(_hart: &mut Hart, inst: u32) {
    trace!("fence {inst:#010x}: host ordering only");
}

fn ecall_ebreak(_hart: &mut Hart, inst: u32) {
    trace!("ecall/ebreak {inst:#010x}: environment not modeled here");
}
