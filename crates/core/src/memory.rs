//! Flat real-mode memory
//!
//! An owned, bounds-checked byte buffer covering the 20-bit address space
//! plus the region above 1 MiB reachable through `FFFF:xxxx`. The VGA
//! framebuffer window lives inside the same buffer; a video collaborator may
//! switch on routing so CPU data accesses to the window go through the
//! VGA hooks instead (planar and chained modes).

use crate::logging::{log, LogCategory, LogLevel};
use std::ops::Range;
use thiserror::Error;

/// Highest linear address reachable in real mode is `FFFF:FFFF` = 0x10FFEF
pub const MEMORY_SIZE: usize = 0x10_FFF0;

/// VGA graphics framebuffer window
pub const VGA_WINDOW: Range<u32> = 0xA0000..0xB0000;

/// Value read from addresses with nothing behind them
const OPEN_BUS: u8 = 0xFF;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("{len} bytes at {addr:#07X} do not fit in {size} bytes of memory")]
    OutOfRange { addr: u32, len: usize, size: usize },
}

/// Addressable memory
#[derive(Debug, Clone)]
pub struct Memory {
    data: Vec<u8>,
    vga_routing: bool,
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Memory {
    /// Full real-mode address space, zero filled
    pub fn new() -> Self {
        Self::with_size(MEMORY_SIZE)
    }

    pub fn with_size(size: usize) -> Self {
        Self {
            data: vec![0; size],
            vga_routing: false,
        }
    }

    /// Memory that holds exactly `image`, starting at linear address 0
    pub fn from_image(image: &[u8]) -> Self {
        Self {
            data: image.to_vec(),
            vga_routing: false,
        }
    }

    /// Copy `bytes` to linear address `addr`
    pub fn load(&mut self, addr: u32, bytes: &[u8]) -> Result<(), MemoryError> {
        let start = addr as usize;
        let end = start
            .checked_add(bytes.len())
            .filter(|&end| end <= self.data.len())
            .ok_or(MemoryError::OutOfRange {
                addr,
                len: bytes.len(),
                size: self.data.len(),
            })?;
        self.data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whole buffer, for collaborators that scan or bulk-copy memory
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Byte at `addr`, or `None` past the end of the buffer
    #[inline]
    pub fn get(&self, addr: u32) -> Option<u8> {
        self.data.get(addr as usize).copied()
    }

    #[inline]
    pub fn read8(&self, addr: u32) -> u8 {
        match self.data.get(addr as usize) {
            Some(&val) => val,
            None => {
                log(LogCategory::Memory, LogLevel::Trace, || {
                    format!("Memory: read past end at {:#07X}", addr)
                });
                OPEN_BUS
            }
        }
    }

    #[inline]
    pub fn write8(&mut self, addr: u32, val: u8) {
        match self.data.get_mut(addr as usize) {
            Some(slot) => *slot = val,
            None => log(LogCategory::Memory, LogLevel::Trace, || {
                format!("Memory: write {:02X} past end at {:#07X}", val, addr)
            }),
        }
    }

    /// Little-endian word
    #[inline]
    pub fn read16(&self, addr: u32) -> u16 {
        u16::from_le_bytes([self.read8(addr), self.read8(addr.wrapping_add(1))])
    }

    #[inline]
    pub fn write16(&mut self, addr: u32, val: u16) {
        let [lo, hi] = val.to_le_bytes();
        self.write8(addr, lo);
        self.write8(addr.wrapping_add(1), hi);
    }

    /// Route CPU data accesses in [`VGA_WINDOW`] through the VGA hooks
    pub fn set_vga_routing(&mut self, enabled: bool) {
        self.vga_routing = enabled;
    }

    #[inline]
    pub fn vga_routing(&self) -> bool {
        self.vga_routing
    }

    /// True when a CPU data access at `addr` belongs to the VGA hooks
    #[inline]
    pub fn is_vga_routed(&self, addr: u32) -> bool {
        self.vga_routing && VGA_WINDOW.contains(&addr)
    }
}
