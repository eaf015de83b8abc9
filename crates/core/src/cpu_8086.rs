//! Real-mode 8086 decode/execute core
//!
//! This module provides the instruction engine used to run unmodified 16-bit
//! DOS executables: the register file with lazy flags, the ModR/M
//! effective-address resolver, the instruction length table and a
//! table-driven opcode dispatcher.
//!
//! BIOS/DOS services, the interrupt controller, the timer and video are
//! external collaborators reached through [`CpuHooks`].
//!
//! # Decode loop
//!
//! Each instruction is fetched from CS:IP, its length is computed from the
//! opcode descriptor plus the [`LENGTH_TABLE`](modrm::LENGTH_TABLE) entry for
//! its ModR/M byte, IP is advanced past it, and then the operation executes.
//! Segment-override and repeat prefixes are consumed inside the same cycle
//! slot: they update the decode state and decoding restarts at the next byte.
//! A chain of more than 15 prefixes is rejected like an invalid opcode.
//! An opcode that maps to no instruction halts the current `run` call with IP
//! left on the failing instruction.

mod dispatch;
mod execute;
pub mod flags;
pub mod hooks;
pub mod modrm;
pub mod registers;

#[cfg(test)]
mod tests;

pub use dispatch::{AluOp, Operation, OPCODES};
pub use hooks::{CpuHooks, HookContext, InterruptDisposition, NullHooks, PortWidth};
pub use registers::{linear, Flag, Reg16, Reg8, Registers, SegReg, Width};

use crate::logging::{log, LogCategory, LogLevel};
use crate::memory::Memory;
use dispatch::{instruction_length, Prefix};
use execute::{Instruction, MAX_INSTRUCTION_LEN};
use modrm::{AddressContext, ModRm, LENGTH_TABLE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// CPU model/variant selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CpuModel {
    /// Intel 8086 (1978) - Original 16-bit x86 processor
    #[default]
    Intel8086,
    /// Intel 8088 (1979) - 8-bit external bus variant of 8086
    Intel8088,
    /// Intel 80186 (1982) - Enhanced 8086 with additional instructions
    Intel80186,
    /// Intel 80188 (1982) - 8-bit external bus variant of 80186
    Intel80188,
}

impl CpuModel {
    /// Returns true if this CPU model supports 80186+ instructions
    pub fn supports_80186_instructions(&self) -> bool {
        matches!(self, CpuModel::Intel80186 | CpuModel::Intel80188)
    }

    /// Returns the name of the CPU model as a string
    pub fn name(&self) -> &'static str {
        match self {
            CpuModel::Intel8086 => "Intel 8086",
            CpuModel::Intel8088 => "Intel 8088",
            CpuModel::Intel80186 => "Intel 80186",
            CpuModel::Intel80188 => "Intel 80188",
        }
    }
}

/// Core configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    /// Model gating the 80186 opcode extensions
    pub model: CpuModel,
    /// Halt `run` on port accesses no hook answers, instead of logging and
    /// reading 0
    pub strict_ports: bool,
    /// Record AF/OF for arithmetic. Off by default: AF and OF then read
    /// false unless loaded from a FLAGS image.
    pub track_overflow: bool,
}

/// Conditions that stop the decode loop
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CpuError {
    #[error("invalid opcode {opcode:#04X} at {cs:04X}:{ip:04X}")]
    InvalidOpcode { opcode: u8, cs: u16, ip: u16 },
    #[error("instruction at {cs:04X}:{ip:04X} runs past the end of memory")]
    Truncated { cs: u16, ip: u16 },
    #[error("unhandled {width} port access at {port:#06X} (write: {write})")]
    UnhandledPort {
        port: u16,
        width: PortWidth,
        write: bool,
    },
}

/// How a `run` call ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// All requested instructions executed
    Completed,
    /// `stop()` was requested
    Stopped,
    /// The core executed HLT and waits for a hardware interrupt
    Waiting,
}

/// Register state of a relocated program entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    pub cs: u16,
    pub ip: u16,
    pub ss: u16,
    pub sp: u16,
    /// Program Segment Prefix segment, loaded into DS and ES
    pub psp: u16,
}

/// Repeat prefix in effect for the current instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RepPrefix {
    Rep,
    RepNe,
}

/// Bytes available at CS:IP, fetched once per decode step
struct FetchWindow {
    bytes: [u8; MAX_INSTRUCTION_LEN],
    len: usize,
}

impl FetchWindow {
    #[inline]
    fn get(&self, index: usize) -> Option<u8> {
        (index < self.len).then(|| self.bytes[index])
    }
}

/// Initial FLAGS for a booted program: IF set
const BOOT_FLAGS: u16 = 0x0202;

/// Longest prefix chain accepted before the instruction is rejected
const MAX_PREFIXES: usize = 15;

/// Real-mode x86 core
///
/// Owns the register file and memory; collaborators are reached through
/// `hooks`.
pub struct Cpu8086<H: CpuHooks = NullHooks> {
    pub regs: Registers,
    pub memory: Memory,
    pub hooks: H,

    /// Total instructions executed (prefixes are not counted)
    pub instructions: u64,

    config: CpuConfig,

    /// Segment bases for the current instruction, overridden by prefixes
    addressing: AddressContext,

    rep: Option<RepPrefix>,

    stop_requested: bool,

    /// Set by HLT, cleared by an accepted hardware interrupt
    waiting: bool,

    /// Why the last `run` call halted, if it did
    halt: Option<CpuError>,
}

impl Cpu8086<NullHooks> {
    /// Core with no collaborators attached
    pub fn new(memory: Memory) -> Self {
        Self::with_hooks(memory, NullHooks)
    }
}

impl<H: CpuHooks> Cpu8086<H> {
    pub fn with_hooks(memory: Memory, hooks: H) -> Self {
        Self::with_config(memory, hooks, CpuConfig::default())
    }

    pub fn with_config(memory: Memory, hooks: H, config: CpuConfig) -> Self {
        let regs = Registers::new();
        let addressing = AddressContext::from_registers(&regs);
        Self {
            regs,
            memory,
            hooks,
            instructions: 0,
            config,
            addressing,
            rep: None,
            stop_requested: false,
            waiting: false,
            halt: None,
        }
    }

    #[inline]
    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: CpuConfig) {
        self.config = config;
    }

    /// Reset the register file (memory and hooks are preserved)
    pub fn reset(&mut self) {
        self.regs = Registers::new();
        self.regs.set16(Reg16::CS, 0xFFFF);
        self.clear_run_state();
    }

    /// Initialize registers for a loaded program
    pub fn boot(&mut self, entry: &EntryPoint) {
        self.regs = Registers::new();
        self.regs.set16(Reg16::CS, entry.cs);
        self.regs.set_ip(entry.ip);
        self.regs.set16(Reg16::SS, entry.ss);
        self.regs.set16(Reg16::SP, entry.sp);
        self.regs.set16(Reg16::DS, entry.psp);
        self.regs.set16(Reg16::ES, entry.psp);
        self.regs.set_flags(BOOT_FLAGS);
        self.clear_run_state();
        log(LogCategory::CPU, LogLevel::Info, || {
            format!(
                "CPU: boot at {:04X}:{:04X}, stack {:04X}:{:04X}, PSP {:04X}",
                entry.cs, entry.ip, entry.ss, entry.sp, entry.psp
            )
        });
    }

    fn clear_run_state(&mut self) {
        self.rep = None;
        self.stop_requested = false;
        self.waiting = false;
        self.halt = None;
        self.addressing = AddressContext::from_registers(&self.regs);
    }

    #[inline]
    pub fn get_reg16(&self, reg: Reg16) -> u16 {
        self.regs.get16(reg)
    }

    #[inline]
    pub fn set_reg16(&mut self, reg: Reg16, val: u16) {
        self.regs.set16(reg, val);
    }

    #[inline]
    pub fn get_reg8(&self, reg: Reg8) -> u8 {
        self.regs.get8(reg)
    }

    #[inline]
    pub fn set_reg8(&mut self, reg: Reg8, val: u8) {
        self.regs.set8(reg, val);
    }

    #[inline]
    pub fn get_flag(&self, flag: Flag) -> bool {
        self.regs.get_flag(flag)
    }

    #[inline]
    pub fn set_flag(&mut self, flag: Flag, value: bool) {
        self.regs.set_flag(flag, value);
    }

    /// Whether HLT left the core waiting for a hardware interrupt
    #[inline]
    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    /// Error that halted the last `run` call
    pub fn halt_reason(&self) -> Option<&CpuError> {
        self.halt.as_ref()
    }

    /// End the current `run` call after the executing instruction, or the
    /// next `run` call before its first instruction
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    /// Execute up to `cycles` instructions
    ///
    /// Segment bases are recomputed from DS/SS on entry. Returns early when
    /// stopped, when HLT is reached, or with an error when an instruction
    /// cannot be decoded.
    pub fn run(&mut self, cycles: u32) -> Result<RunOutcome, CpuError> {
        self.addressing = AddressContext::from_registers(&self.regs);
        self.halt = None;

        for _ in 0..cycles {
            if self.stop_requested {
                self.stop_requested = false;
                return Ok(RunOutcome::Stopped);
            }
            if self.waiting {
                return Ok(RunOutcome::Waiting);
            }
            self.execute_instruction()?;
        }

        if self.stop_requested {
            self.stop_requested = false;
            return Ok(RunOutcome::Stopped);
        }
        Ok(RunOutcome::Completed)
    }

    /// Decode and execute one instruction, including its prefixes. Callers
    /// check the stop and wait states first.
    fn execute_instruction(&mut self) -> Result<(), CpuError> {
        let start_ip = self.regs.ip();
        let mut prefixes = 0;

        loop {
            let cs = self.regs.get16(Reg16::CS);
            let ip = self.regs.ip();
            let window = self.fetch_window(cs, ip);

            let Some(opcode) = window.get(0) else {
                return self.halt_at(start_ip, CpuError::Truncated { cs, ip });
            };

            let mut op = OPCODES[opcode as usize];
            if Operation::requires_80186(opcode) && !self.config.model.supports_80186_instructions()
            {
                op = Operation::Invalid;
            }

            match op {
                Operation::Prefix(_) if prefixes == MAX_PREFIXES => {
                    return self.halt_at(start_ip, CpuError::InvalidOpcode { opcode, cs, ip });
                }
                Operation::Prefix(prefix) => {
                    prefixes += 1;
                    self.apply_prefix(prefix);
                    self.regs.set_ip(ip.wrapping_add(1));
                    continue;
                }
                Operation::Invalid => {
                    return self.halt_at(start_ip, CpuError::InvalidOpcode { opcode, cs, ip });
                }
                _ => {}
            }

            let modrm_byte = window.get(1);
            let len = match instruction_length(op, modrm_byte) {
                Some(len) if (len as usize) <= window.len => len,
                _ => return self.halt_at(start_ip, CpuError::Truncated { cs, ip }),
            };

            let modrm = ModRm(modrm_byte.unwrap_or(0));
            if op.has_modrm() && !op.accepts(modrm) {
                return self.halt_at(start_ip, CpuError::InvalidOpcode { opcode, cs, ip });
            }

            let insn = Instruction {
                op,
                modrm,
                bytes: window.bytes,
                imm_at: if op.has_modrm() {
                    LENGTH_TABLE[modrm.0 as usize] as usize
                } else {
                    1
                },
            };

            self.regs.set_ip(ip.wrapping_add(len));
            let result = self.execute(&insn);
            self.end_instruction();

            return match result {
                Ok(()) => {
                    self.instructions += 1;
                    Ok(())
                }
                Err(err) => self.halt_at(start_ip, err),
            };
        }
    }

    fn fetch_window(&self, cs: u16, ip: u16) -> FetchWindow {
        let mut window = FetchWindow {
            bytes: [0; MAX_INSTRUCTION_LEN],
            len: 0,
        };
        for i in 0..MAX_INSTRUCTION_LEN {
            match self.memory.get(linear(cs, ip.wrapping_add(i as u16))) {
                Some(byte) => {
                    window.bytes[i] = byte;
                    window.len += 1;
                }
                None => break,
            }
        }
        window
    }

    fn apply_prefix(&mut self, prefix: Prefix) {
        match prefix {
            Prefix::Segment(seg) => {
                self.addressing = AddressContext::overridden(self.regs.seg(seg));
            }
            Prefix::Rep => self.rep = Some(RepPrefix::Rep),
            Prefix::RepNe => self.rep = Some(RepPrefix::RepNe),
            Prefix::Lock => {}
        }
        log(LogCategory::CPU, LogLevel::Trace, || {
            format!("CPU: prefix {:?} at IP={:04X}", prefix, self.regs.ip())
        });
    }

    /// Drop per-instruction decode state: prefixes end with their instruction
    fn end_instruction(&mut self) {
        self.rep = None;
        self.addressing = AddressContext::from_registers(&self.regs);
    }

    fn halt_at(&mut self, start_ip: u16, err: CpuError) -> Result<(), CpuError> {
        self.regs.set_ip(start_ip);
        self.end_instruction();
        log(LogCategory::CPU, LogLevel::Error, || format!("CPU: halted: {}", err));
        self.halt = Some(err.clone());
        Err(err)
    }

    /// Software-style interrupt injection: offered to the hooks, otherwise
    /// delivered through the vector table
    pub fn interrupt(&mut self, vector: u8) {
        let disposition = {
            let mut ctx =
                HookContext::new(&mut self.regs, &mut self.memory, &mut self.stop_requested);
            self.hooks.interrupt(&mut ctx, vector)
        };
        log(LogCategory::Interrupts, LogLevel::Trace, || {
            format!("Interrupts: INT {:02X} -> {:?}", vector, disposition)
        });
        if disposition == InterruptDisposition::Vector {
            self.enter_vector(vector);
        }
    }

    /// Attempt delivery of a hardware interrupt. Returns false, delivering
    /// nothing, while interrupts are disabled.
    pub fn hardware_interrupt(&mut self, vector: u8) -> bool {
        if !self.regs.get_flag(Flag::IF) {
            log(LogCategory::Interrupts, LogLevel::Debug, || {
                format!("Interrupts: IRQ vector {:02X} masked (IF=0)", vector)
            });
            return false;
        }
        self.waiting = false;
        self.interrupt(vector);
        true
    }

    /// Push FLAGS/CS/IP and jump through the real-mode vector table
    fn enter_vector(&mut self, vector: u8) {
        let flags = self.regs.flags();
        self.push16(flags);
        self.push16(self.regs.get16(Reg16::CS));
        self.push16(self.regs.ip());

        self.regs.set_flag(Flag::IF, false);
        self.regs.set_flag(Flag::TF, false);

        // Each IVT entry is 4 bytes: offset then segment
        let entry = (vector as u32) * 4;
        let ip = self.memory.read16(entry);
        let cs = self.memory.read16(entry + 2);
        self.regs.set16(Reg16::CS, cs);
        self.regs.set_ip(ip);
    }

    /// Push a word at SS:SP
    pub fn push16(&mut self, val: u16) {
        let sp = self.regs.get16(Reg16::SP).wrapping_sub(2);
        self.regs.set16(Reg16::SP, sp);
        let ss = self.regs.get16(Reg16::SS);
        self.write_word(ss, sp, val);
    }

    /// Pop a word from SS:SP
    pub fn pop16(&mut self) -> u16 {
        let sp = self.regs.get16(Reg16::SP);
        let ss = self.regs.get16(Reg16::SS);
        let val = self.read_word(ss, sp);
        self.regs.set16(Reg16::SP, sp.wrapping_add(2));
        val
    }

    /// Word at `segment:offset`, wrapping within the segment
    pub fn read_word(&mut self, segment: u16, offset: u16) -> u16 {
        let lo = self.load8(linear(segment, offset));
        let hi = self.load8(linear(segment, offset.wrapping_add(1)));
        u16::from_le_bytes([lo, hi])
    }

    pub fn write_word(&mut self, segment: u16, offset: u16, val: u16) {
        let [lo, hi] = val.to_le_bytes();
        self.store8(linear(segment, offset), lo);
        self.store8(linear(segment, offset.wrapping_add(1)), hi);
    }

    /// Data read honouring VGA routing
    #[inline]
    fn load8(&mut self, addr: u32) -> u8 {
        if self.memory.is_vga_routed(addr) {
            self.hooks.vga_read(addr)
        } else {
            self.memory.read8(addr)
        }
    }

    /// Data write honouring VGA routing
    #[inline]
    fn store8(&mut self, addr: u32, val: u8) {
        if self.memory.is_vga_routed(addr) {
            self.hooks.vga_write(addr, val);
        } else {
            self.memory.write8(addr, val);
        }
    }
}

impl<H: CpuHooks> crate::Cpu for Cpu8086<H> {
    fn reset(&mut self) {
        Cpu8086::reset(self);
    }

    /// One instruction per step. A halted or waiting core consumes nothing,
    /// and a pending stop is consumed instead of an instruction.
    fn step(&mut self) -> u32 {
        if self.stop_requested {
            self.stop_requested = false;
            return 0;
        }
        if self.waiting {
            return 0;
        }
        match self.execute_instruction() {
            Ok(()) => 1,
            Err(_) => 0,
        }
    }
}
