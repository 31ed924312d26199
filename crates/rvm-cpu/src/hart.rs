use std::sync::Arc;

use rvm_interrupts::HartEvents;
use rvm_mem::GuestRam;
use thiserror::Error;

use crate::rv32i::OpcodeTable;
use crate::Register;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Trap {
    #[error("instruction fetch fault at {addr:#010x}")]
    FetchFault { addr: u32 },
    #[error("illegal instruction {inst:#010x} at {pc:#010x}")]
    IllegalInstruction { inst: u32, pc: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrivMode {
    User,
    Supervisor,
    #[default]
    Machine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HartState {
    #[default]
    Running,
    /// A trap was taken and nothing handles traps here.
    Trapped,
    /// Halted cooperatively (shutdown request, poweroff).
    Halted,
}

/// One hardware thread: the 32-entry register file, a dedicated `pc`, the
/// privilege mode and the event bitmap other threads poke.
pub struct Hart {
    id: u32,
    regs: [u32; 32],
    pc: u32,
    priv_mode: PrivMode,
    state: HartState,
    events: Arc<HartEvents>,
}

impl Hart {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            regs: [0; 32],
            pc: 0,
            priv_mode: PrivMode::Machine,
            state: HartState::Running,
            events: Arc::new(HartEvents::new()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn events(&self) -> &Arc<HartEvents> {
        &self.events
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    pub fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
    }

    pub fn state(&self) -> HartState {
        self.state
    }

    pub fn set_state(&mut self, state: HartState) {
        self.state = state;
    }

    pub fn priv_mode(&self) -> PrivMode {
        self.priv_mode
    }

    pub fn read_reg(&self, reg: Register) -> u32 {
        self.regs[reg.index()]
    }

    pub fn read_reg_signed(&self, reg: Register) -> i32 {
        self.regs[reg.index()] as i32
    }

    /// Stores to `x0` are silently discarded.
    pub fn write_reg(&mut self, reg: Register, value: u32) {
        if !reg.is_zero() {
            self.regs[reg.index()] = value;
        }
    }

    pub fn write_reg_signed(&mut self, reg: Register, value: i32) {
        self.write_reg(reg, value as u32);
    }

    /// Back to the power-on state, entry point at `pc`.
    pub fn reset(&mut self, pc: u32) {
        self.regs = [0; 32];
        self.pc = pc;
        self.priv_mode = PrivMode::Machine;
        self.state = HartState::Running;
        self.events.take();
        self.write_reg(Register::A0, self.id);
    }

    /// Fetch the word at `pc`, dispatch through the opcode table and advance
    /// `pc` past the instruction. Handlers observe the pre-advance `pc`.
    pub fn step(&mut self, ram: &GuestRam, table: &OpcodeTable) -> Result<(), Trap> {
        let pc = self.pc;
        let inst = ram
            .read_u32(pc as u64)
            .map_err(|_| Trap::FetchFault { addr: pc })?;
        // Only the 32-bit encoding space is supported.
        if inst & 0b11 != 0b11 {
            return Err(Trap::IllegalInstruction { inst, pc });
        }
        let handler = table
            .lookup(inst)
            .ok_or(Trap::IllegalInstruction { inst, pc })?;
        handler(self, inst);
        self.pc = pc.wrapping_add(4);
        Ok(())
    }
}

impl std::fmt::Debug for Hart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hart")
            .field("id", &self.id)
            .field("pc", &format_args!("{:#010x}", self.pc))
            .field("state", &self.state)
            .finish()
    }
}
