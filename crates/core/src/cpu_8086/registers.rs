//! Register file for the real-mode core
//!
//! Sixteen 16-bit slots hold the general, segment, IP and FLAGS registers.
//! The 8-bit registers are byte views onto AX/CX/DX/BX, never separate
//! storage. The status bits of FLAGS live in a [`LazyFlags`] shadow and are
//! only folded into the FLAGS slot when something reads FLAGS as a whole.

use super::flags::{
    LazyFlags, FLAGS_ALWAYS_CLEAR, FLAGS_ALWAYS_SET, FLAG_AF, FLAG_CF, FLAG_DF, FLAG_IF,
    FLAG_NT, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_TF, FLAG_ZF, STATUS_MASK,
};
use serde::{Deserialize, Serialize};

/// Slot holding the FLAGS image inside the register array
const FLAGS_SLOT: usize = 13;

/// Operand width of an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Word,
}

impl Width {
    #[inline]
    pub fn mask(self) -> u32 {
        match self {
            Width::Byte => 0xFF,
            Width::Word => 0xFFFF,
        }
    }

    #[inline]
    pub fn bytes(self) -> u16 {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
        }
    }

    #[inline]
    pub fn sign_bit(self) -> u32 {
        match self {
            Width::Byte => 0x80,
            Width::Word => 0x8000,
        }
    }

    /// Sign-extend the low `self` bits of `val` to 32 bits
    #[inline]
    pub fn sign_extend(self, val: u32) -> i32 {
        match self {
            Width::Byte => val as u8 as i8 as i32,
            Width::Word => val as u16 as i16 as i32,
        }
    }
}

/// 16-bit registers visible to collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg16 {
    AX = 0,
    CX = 1,
    DX = 2,
    BX = 3,
    SP = 4,
    BP = 5,
    SI = 6,
    DI = 7,
    ES = 8,
    CS = 9,
    SS = 10,
    DS = 11,
    IP = 12,
}

impl Reg16 {
    /// General registers in ModRM encoding order
    pub const GENERAL: [Reg16; 8] = [
        Reg16::AX,
        Reg16::CX,
        Reg16::DX,
        Reg16::BX,
        Reg16::SP,
        Reg16::BP,
        Reg16::SI,
        Reg16::DI,
    ];

    /// General register selected by a 3-bit encoding field
    #[inline]
    pub fn general(index: u8) -> Reg16 {
        Self::GENERAL[(index & 0x07) as usize]
    }

    #[inline]
    fn slot(self) -> usize {
        self as usize
    }
}

/// 8-bit register views, in ModRM encoding order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg8 {
    AL = 0,
    CL = 1,
    DL = 2,
    BL = 3,
    AH = 4,
    CH = 5,
    DH = 6,
    BH = 7,
}

impl Reg8 {
    pub const ALL: [Reg8; 8] = [
        Reg8::AL,
        Reg8::CL,
        Reg8::DL,
        Reg8::BL,
        Reg8::AH,
        Reg8::CH,
        Reg8::DH,
        Reg8::BH,
    ];

    #[inline]
    pub fn from_index(index: u8) -> Reg8 {
        Self::ALL[(index & 0x07) as usize]
    }

    /// The 16-bit register this view aliases
    #[inline]
    pub fn word(self) -> Reg16 {
        Reg16::general(self as u8 & 0x03)
    }

    #[inline]
    pub fn is_high(self) -> bool {
        (self as u8) >= 4
    }
}

/// Segment registers in ModRM/prefix encoding order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SegReg {
    ES = 0,
    CS = 1,
    SS = 2,
    DS = 3,
}

impl SegReg {
    #[inline]
    pub fn from_index(index: u8) -> SegReg {
        match index & 0x03 {
            0 => SegReg::ES,
            1 => SegReg::CS,
            2 => SegReg::SS,
            _ => SegReg::DS,
        }
    }

    #[inline]
    pub fn reg16(self) -> Reg16 {
        match self {
            SegReg::ES => Reg16::ES,
            SegReg::CS => Reg16::CS,
            SegReg::SS => Reg16::SS,
            SegReg::DS => Reg16::DS,
        }
    }
}

/// Individually addressable FLAGS bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    CF,
    PF,
    AF,
    ZF,
    SF,
    TF,
    IF,
    DF,
    OF,
    NT,
}

impl Flag {
    /// Bit mask of this flag in the FLAGS image
    #[inline]
    pub fn mask(self) -> u16 {
        match self {
            Flag::CF => FLAG_CF,
            Flag::PF => FLAG_PF,
            Flag::AF => FLAG_AF,
            Flag::ZF => FLAG_ZF,
            Flag::SF => FLAG_SF,
            Flag::TF => FLAG_TF,
            Flag::IF => FLAG_IF,
            Flag::DF => FLAG_DF,
            Flag::OF => FLAG_OF,
            Flag::NT => FLAG_NT,
        }
    }

    /// True for the bits derived from the lazy shadow
    #[inline]
    pub fn is_status(self) -> bool {
        self.mask() & STATUS_MASK != 0
    }
}

/// Linear address of `segment:offset`
#[inline]
pub fn linear(segment: u16, offset: u16) -> u32 {
    ((segment as u32) << 4) + offset as u32
}

/// Register file state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registers {
    words: [u16; 16],
    lazy: LazyFlags,
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

impl Registers {
    pub fn new() -> Self {
        let mut words = [0u16; 16];
        words[FLAGS_SLOT] = FLAGS_ALWAYS_SET;
        Self {
            words,
            lazy: LazyFlags::from_status(0),
        }
    }

    #[inline]
    pub fn get16(&self, reg: Reg16) -> u16 {
        self.words[reg.slot()]
    }

    #[inline]
    pub fn set16(&mut self, reg: Reg16, val: u16) {
        self.words[reg.slot()] = val;
    }

    #[inline]
    pub fn get8(&self, reg: Reg8) -> u8 {
        let word = self.words[reg.word().slot()];
        if reg.is_high() {
            (word >> 8) as u8
        } else {
            word as u8
        }
    }

    #[inline]
    pub fn set8(&mut self, reg: Reg8, val: u8) {
        let slot = reg.word().slot();
        let word = self.words[slot];
        self.words[slot] = if reg.is_high() {
            (word & 0x00FF) | ((val as u16) << 8)
        } else {
            (word & 0xFF00) | val as u16
        };
    }

    #[inline]
    pub fn seg(&self, seg: SegReg) -> u16 {
        self.get16(seg.reg16())
    }

    #[inline]
    pub fn set_seg(&mut self, seg: SegReg, val: u16) {
        self.set16(seg.reg16(), val);
    }

    #[inline]
    pub fn ip(&self) -> u16 {
        self.words[Reg16::IP.slot()]
    }

    #[inline]
    pub fn set_ip(&mut self, ip: u16) {
        self.words[Reg16::IP.slot()] = ip;
    }

    /// Read one flag. Status bits are derived from the lazy shadow.
    #[inline]
    pub fn get_flag(&self, flag: Flag) -> bool {
        match flag {
            Flag::CF => self.lazy.cf(),
            Flag::PF => self.lazy.pf(),
            Flag::AF => self.lazy.af(),
            Flag::ZF => self.lazy.zf(),
            Flag::SF => self.lazy.sf(),
            Flag::OF => self.lazy.of(),
            _ => self.words[FLAGS_SLOT] & flag.mask() != 0,
        }
    }

    /// Write one flag. Setting a status bit re-encodes the lazy shadow so the
    /// other derived bits keep their current values.
    pub fn set_flag(&mut self, flag: Flag, value: bool) {
        if flag.is_status() {
            let mut status = self.lazy.status();
            if value {
                status |= flag.mask();
            } else {
                status &= !flag.mask();
            }
            self.lazy = LazyFlags::from_status(status);
        } else if value {
            self.words[FLAGS_SLOT] |= flag.mask();
        } else {
            self.words[FLAGS_SLOT] &= !flag.mask();
        }
    }

    /// Materialize the full FLAGS image (RecalcFlags)
    pub fn flags(&mut self) -> u16 {
        let image = (self.words[FLAGS_SLOT] & !STATUS_MASK) | self.lazy.status();
        self.words[FLAGS_SLOT] = image;
        image
    }

    /// Load a full FLAGS image, as `popf`/`iret` do. Reserved bits are forced
    /// to their architectural values regardless of `image`.
    pub fn set_flags(&mut self, image: u16) {
        let image = (image | FLAGS_ALWAYS_SET) & !FLAGS_ALWAYS_CLEAR;
        self.words[FLAGS_SLOT] = image;
        self.lazy = LazyFlags::from_status(image & STATUS_MASK);
    }

    #[inline]
    pub fn lazy(&self) -> &LazyFlags {
        &self.lazy
    }

    #[inline]
    pub fn lazy_mut(&mut self) -> &mut LazyFlags {
        &mut self.lazy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_views_alias_words() {
        let mut regs = Registers::new();
        regs.set16(Reg16::AX, 0x1234);
        assert_eq!(regs.get8(Reg8::AL), 0x34);
        assert_eq!(regs.get8(Reg8::AH), 0x12);

        regs.set8(Reg8::BH, 0xAB);
        regs.set8(Reg8::BL, 0xCD);
        assert_eq!(regs.get16(Reg16::BX), 0xABCD);

        regs.set8(Reg8::CL, 0xFF);
        assert_eq!(regs.get16(Reg16::CX), 0x00FF);
        regs.set8(Reg8::CH, 0x01);
        assert_eq!(regs.get16(Reg16::CX), 0x01FF);
    }

    #[test]
    fn test_encoding_order() {
        assert_eq!(Reg16::general(4), Reg16::SP);
        assert_eq!(Reg16::general(7), Reg16::DI);
        assert_eq!(Reg8::from_index(5), Reg8::CH);
        assert_eq!(Reg8::CH.word(), Reg16::CX);
        assert_eq!(SegReg::from_index(2), SegReg::SS);
        assert_eq!(SegReg::DS.reg16(), Reg16::DS);
    }

    #[test]
    fn test_control_flags_are_stored() {
        let mut regs = Registers::new();
        regs.set_flag(Flag::DF, true);
        regs.set_flag(Flag::IF, true);
        assert!(regs.get_flag(Flag::DF));
        assert!(regs.get_flag(Flag::IF));
        assert!(!regs.get_flag(Flag::TF));
        regs.set_flag(Flag::DF, false);
        assert!(!regs.get_flag(Flag::DF));
    }

    #[test]
    fn test_status_flag_set_preserves_others() {
        let mut regs = Registers::new();
        regs.set_flag(Flag::ZF, true);
        regs.set_flag(Flag::CF, true);
        regs.set_flag(Flag::SF, true);
        assert!(regs.get_flag(Flag::ZF));
        assert!(regs.get_flag(Flag::CF));
        assert!(regs.get_flag(Flag::SF));

        regs.set_flag(Flag::CF, false);
        assert!(regs.get_flag(Flag::ZF));
        assert!(regs.get_flag(Flag::SF));
        assert!(!regs.get_flag(Flag::CF));
    }

    #[test]
    fn test_set_flags_forces_reserved_bits() {
        let mut regs = Registers::new();
        regs.set_flags(0xFFFF);
        let image = regs.flags();
        assert_eq!(image & FLAGS_ALWAYS_SET, FLAGS_ALWAYS_SET);
        assert_eq!(image & FLAGS_ALWAYS_CLEAR, 0);

        regs.set_flags(0x0000);
        assert_eq!(regs.flags(), FLAGS_ALWAYS_SET);
    }

    #[test]
    fn test_flags_image_roundtrip() {
        let mut regs = Registers::new();
        let image = FLAGS_ALWAYS_SET | FLAG_CF | FLAG_PF | FLAG_SF | FLAG_IF | FLAG_OF;
        regs.set_flags(image);
        assert_eq!(regs.flags(), image);
        assert!(regs.get_flag(Flag::OF));
        assert!(!regs.get_flag(Flag::ZF));
    }

    #[test]
    fn test_linear_address() {
        assert_eq!(linear(0x1000, 0x0234), 0x10234);
        assert_eq!(linear(0xFFFF, 0xFFFF), 0x10FFEF);
    }
}
