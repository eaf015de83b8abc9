//! ModR/M effective-address resolver and instruction length table
//!
//! A ModR/M byte splits into `mod` (bits 7-6), `reg` (bits 5-3) and `rm`
//! (bits 2-0). `mod = 11` names a register; every other mode names memory
//! at `base + base-combo registers + displacement`. All 256 values are
//! defined, so resolution never fails.

use super::registers::{Reg16, Registers};

/// Register combination added to the displacement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseCombo {
    BxSi,
    BxDi,
    BpSi,
    BpDi,
    Si,
    Di,
    Bp,
    Bx,
    /// mod=00 rm=110: the displacement is the whole offset
    Direct,
}

impl BaseCombo {
    /// Combos that address through BP default to the stack segment
    #[inline]
    pub fn uses_bp(self) -> bool {
        matches!(self, BaseCombo::BpSi | BaseCombo::BpDi | BaseCombo::Bp)
    }

    #[inline]
    fn offset(self, regs: &Registers) -> u16 {
        let r = |reg| regs.get16(reg);
        match self {
            BaseCombo::BxSi => r(Reg16::BX).wrapping_add(r(Reg16::SI)),
            BaseCombo::BxDi => r(Reg16::BX).wrapping_add(r(Reg16::DI)),
            BaseCombo::BpSi => r(Reg16::BP).wrapping_add(r(Reg16::SI)),
            BaseCombo::BpDi => r(Reg16::BP).wrapping_add(r(Reg16::DI)),
            BaseCombo::Si => r(Reg16::SI),
            BaseCombo::Di => r(Reg16::DI),
            BaseCombo::Bp => r(Reg16::BP),
            BaseCombo::Bx => r(Reg16::BX),
            BaseCombo::Direct => 0,
        }
    }
}

/// Displacement bytes trailing the ModR/M byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Displacement {
    None,
    /// Sign-extended 8-bit
    Byte,
    Word,
}

impl Displacement {
    #[inline]
    pub const fn size(self) -> u8 {
        match self {
            Displacement::None => 0,
            Displacement::Byte => 1,
            Displacement::Word => 2,
        }
    }
}

/// Which segment base an address resolves against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentChoice {
    Data,
    Stack,
}

/// Decoded memory form of a ModR/M byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Addressing {
    pub base: BaseCombo,
    pub disp: Displacement,
    pub segment: SegmentChoice,
}

const COMBOS: [BaseCombo; 8] = [
    BaseCombo::BxSi,
    BaseCombo::BxDi,
    BaseCombo::BpSi,
    BaseCombo::BpDi,
    BaseCombo::Si,
    BaseCombo::Di,
    BaseCombo::Bp,
    BaseCombo::Bx,
];

/// Memory operand: a segment base plus a 16-bit offset. Multi-byte
/// accesses wrap the offset within the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRef {
    pub base: u32,
    pub offset: u16,
}

impl MemRef {
    #[inline]
    pub fn new(base: u32, offset: u16) -> Self {
        Self { base, offset }
    }

    #[inline]
    pub fn linear(self) -> u32 {
        self.base + self.offset as u32
    }

    /// `delta` bytes further on in the same segment
    #[inline]
    pub fn advance(self, delta: u16) -> Self {
        Self {
            base: self.base,
            offset: self.offset.wrapping_add(delta),
        }
    }
}

/// Operand location after resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Register selected by `rm` (8- or 16-bit per the opcode width)
    Reg(u8),
    Mem(MemRef),
}

/// Linear segment bases in effect for the current instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddressContext {
    pub segment_base: u32,
    pub stack_segment_base: u32,
}

impl AddressContext {
    /// Bases derived from DS and SS
    #[inline]
    pub fn from_registers(regs: &Registers) -> Self {
        Self {
            segment_base: (regs.get16(Reg16::DS) as u32) << 4,
            stack_segment_base: (regs.get16(Reg16::SS) as u32) << 4,
        }
    }

    /// Both bases replaced by a segment-override prefix
    #[inline]
    pub fn overridden(segment: u16) -> Self {
        let base = (segment as u32) << 4;
        Self {
            segment_base: base,
            stack_segment_base: base,
        }
    }

    #[inline]
    pub fn base(&self, choice: SegmentChoice) -> u32 {
        match choice {
            SegmentChoice::Data => self.segment_base,
            SegmentChoice::Stack => self.stack_segment_base,
        }
    }
}

/// A raw ModR/M byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModRm(pub u8);

impl ModRm {
    #[inline]
    pub fn mode(self) -> u8 {
        (self.0 >> 6) & 0x03
    }

    #[inline]
    pub fn reg(self) -> u8 {
        (self.0 >> 3) & 0x07
    }

    #[inline]
    pub fn rm(self) -> u8 {
        self.0 & 0x07
    }

    #[inline]
    pub fn is_register(self) -> bool {
        self.mode() == 0b11
    }

    /// Memory form, or `None` for register operands
    pub const fn addressing(self) -> Option<Addressing> {
        let mode = (self.0 >> 6) & 0x03;
        let rm = self.0 & 0x07;
        let disp = match mode {
            0b00 if rm == 0b110 => Displacement::Word,
            0b00 => Displacement::None,
            0b01 => Displacement::Byte,
            0b10 => Displacement::Word,
            _ => return None,
        };
        let base = if mode == 0b00 && rm == 0b110 {
            BaseCombo::Direct
        } else {
            COMBOS[rm as usize]
        };
        let segment = match base {
            BaseCombo::BpSi | BaseCombo::BpDi | BaseCombo::Bp => SegmentChoice::Stack,
            _ => SegmentChoice::Data,
        };
        Some(Addressing {
            base,
            disp,
            segment,
        })
    }

    /// Displacement bytes that follow this ModR/M byte
    #[inline]
    pub const fn displacement_size(self) -> u8 {
        match self.addressing() {
            Some(a) => a.disp.size(),
            None => 0,
        }
    }

    /// Resolve the operand. `disp` holds the bytes following the ModR/M byte
    /// and must contain at least `displacement_size()` bytes.
    pub fn resolve(self, disp: &[u8], regs: &Registers, ctx: &AddressContext) -> Location {
        let Some(addressing) = self.addressing() else {
            return Location::Reg(self.rm());
        };
        let displacement = match addressing.disp {
            Displacement::None => 0,
            Displacement::Byte => disp[0] as i8 as i16 as u16,
            Displacement::Word => u16::from_le_bytes([disp[0], disp[1]]),
        };
        let offset = addressing.base.offset(regs).wrapping_add(displacement);
        Location::Mem(MemRef::new(ctx.base(addressing.segment), offset))
    }

    /// Offset only, without a segment base (used by LEA)
    pub fn offset(self, disp: &[u8], regs: &Registers) -> Option<u16> {
        match self.resolve(disp, regs, &AddressContext::default()) {
            Location::Mem(mem) => Some(mem.offset),
            Location::Reg(_) => None,
        }
    }
}

const fn build_length_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = 2 + ModRm(i as u8).displacement_size();
        i += 1;
    }
    table
}

/// Bytes consumed by opcode + ModR/M + displacement, indexed by ModR/M
pub static LENGTH_TABLE: [u8; 256] = build_length_table();
