//! Tests for the real-mode core
//!
//! - `tests_scenarios`: end-to-end programs and run-loop contracts
//! - `tests_alu`: arithmetic, logic, shifts, multiply/divide and BCD
//! - `tests_flags`: flag derivation and flag instructions
//! - `tests_addressing`: ModR/M operands, segment overrides, decode failures
//! - `tests_jumps`: branches, calls, returns and loops
//! - `tests_strings`: string instructions and repeat prefixes
//! - `tests_interrupts`: interrupt hooks, vector table, HLT
//! - `tests_io`: ports and VGA routing

mod tests_addressing;

use super::{
    linear, Cpu8086, CpuConfig, CpuHooks, EntryPoint, HookContext, InterruptDisposition,
    NullHooks, PortWidth,
};
use crate::memory::Memory;

/// Segment test programs are loaded into
pub(super) const CODE_SEG: u16 = 0x1000;

/// Core with `program` at CODE_SEG:0100, booted like a .COM image
pub(super) fn com_cpu(program: &[u8]) -> Cpu8086 {
    com_cpu_with(program, NullHooks, CpuConfig::default())
}

pub(super) fn com_cpu_with<H: CpuHooks>(program: &[u8], hooks: H, config: CpuConfig) -> Cpu8086<H> {
    let mut memory = Memory::new();
    memory
        .load(linear(CODE_SEG, 0x100), program)
        .expect("program fits in memory");
    let mut cpu = Cpu8086::with_config(memory, hooks, config);
    cpu.boot(&EntryPoint {
        cs: CODE_SEG,
        ip: 0x100,
        ss: CODE_SEG,
        sp: 0xFFFE,
        psp: CODE_SEG,
    });
    cpu
}

/// Hooks that record every callout
#[derive(Default)]
pub(super) struct RecordingHooks {
    /// Vectors reported as serviced
    pub handled: Vec<u8>,
    pub stop_on: Option<u8>,
    /// Answer for every port read
    pub port_value: Option<u16>,
    pub accept_writes: bool,
    pub vga_value: u8,

    pub interrupts: Vec<u8>,
    pub port_reads: Vec<(u16, PortWidth)>,
    pub port_writes: Vec<(u16, PortWidth, u16)>,
    pub vga_writes: Vec<(u32, u8)>,
}

impl CpuHooks for RecordingHooks {
    fn interrupt(&mut self, cpu: &mut HookContext<'_>, vector: u8) -> InterruptDisposition {
        self.interrupts.push(vector);
        if self.stop_on == Some(vector) {
            cpu.stop();
        }
        if self.handled.contains(&vector) {
            InterruptDisposition::Handled
        } else {
            InterruptDisposition::Vector
        }
    }

    fn port_read(&mut self, _cpu: &mut HookContext<'_>, port: u16, width: PortWidth) -> Option<u16> {
        self.port_reads.push((port, width));
        self.port_value
    }

    fn port_write(
        &mut self,
        _cpu: &mut HookContext<'_>,
        port: u16,
        width: PortWidth,
        value: u16,
    ) -> bool {
        self.port_writes.push((port, width, value));
        self.accept_writes
    }

    fn vga_read(&mut self, _addr: u32) -> u8 {
        self.vga_value
    }

    fn vga_write(&mut self, addr: u32, value: u8) {
        self.vga_writes.push((addr, value));
    }
}
