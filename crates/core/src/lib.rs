//! Real-mode x86 core for running 16-bit DOS executables.

pub mod cpu_8086;
pub mod logging;
pub mod memory;

pub use cpu_8086::{
    Cpu8086, CpuConfig, CpuError, CpuHooks, CpuModel, EntryPoint, Flag, HookContext,
    InterruptDisposition, NullHooks, PortWidth, Reg16, Reg8, Registers, RunOutcome, SegReg,
};
pub use memory::{Memory, MemoryError};

/// A CPU-like component that can be stepped; returns instructions consumed.
pub trait Cpu {
    fn reset(&mut self);
    fn step(&mut self) -> u32;
}
