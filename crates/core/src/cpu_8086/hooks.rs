//! Interrupt, port and VGA hooks
//!
//! BIOS/DOS services, the interrupt controller, the timer and the video
//! adapter live outside the core. The core calls into them synchronously
//! through [`CpuHooks`]: once per interrupt, and once per element a port
//! or VGA access transfers (a repeated `ins`/`outs` calls once per
//! iteration). Interrupt and port calls get a [`HookContext`] to inspect
//! and mutate registers and memory. Hooks must not re-enter
//! [`Cpu8086::run`](super::Cpu8086::run).

use super::registers::{Flag, Reg16, Reg8, Registers};
use crate::memory::Memory;
use std::fmt;

/// Access width of an I/O port operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortWidth {
    Byte,
    Word,
}

impl fmt::Display for PortWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortWidth::Byte => write!(f, "byte"),
            PortWidth::Word => write!(f, "word"),
        }
    }
}

/// What the core should do after offering an interrupt to the hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptDisposition {
    /// The service was emulated in host code; execution continues after
    /// the `int` instruction
    Handled,
    /// Deliver through the interrupt vector table
    Vector,
}

/// View of the core handed to hooks
pub struct HookContext<'a> {
    pub regs: &'a mut Registers,
    pub memory: &'a mut Memory,
    stop: &'a mut bool,
}

impl<'a> HookContext<'a> {
    pub(crate) fn new(regs: &'a mut Registers, memory: &'a mut Memory, stop: &'a mut bool) -> Self {
        Self { regs, memory, stop }
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

    /// End the current `run` call once this instruction completes
    pub fn stop(&mut self) {
        *self.stop = true;
    }
}

/// Collaborator callouts. Every method has a default, so a collaborator only
/// implements what it services.
pub trait CpuHooks {
    /// Offered every software interrupt (`int n`, `int3`, `into`, divide
    /// errors, [`Cpu8086::interrupt`](super::Cpu8086::interrupt)) and every
    /// accepted hardware interrupt.
    fn interrupt(&mut self, _cpu: &mut HookContext<'_>, _vector: u8) -> InterruptDisposition {
        InterruptDisposition::Vector
    }

    /// `in`/`ins`. `None` means nothing answers at `port`.
    fn port_read(&mut self, _cpu: &mut HookContext<'_>, _port: u16, _width: PortWidth) -> Option<u16> {
        None
    }

    /// `out`/`outs`. `false` means nothing listens at `port`.
    fn port_write(
        &mut self,
        _cpu: &mut HookContext<'_>,
        _port: u16,
        _width: PortWidth,
        _value: u16,
    ) -> bool {
        false
    }

    /// Data read inside the VGA window while routing is enabled
    fn vga_read(&mut self, _addr: u32) -> u8 {
        0xFF
    }

    /// Data write inside the VGA window while routing is enabled
    fn vga_write(&mut self, _addr: u32, _value: u8) {}
}

/// Hooks that service nothing: interrupts vector through the IVT and every
/// port is unhandled
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHooks;

impl CpuHooks for NullHooks {}
