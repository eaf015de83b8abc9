//! Lazy flag model
//!
//! The status flags are not stored eagerly. Every flag-affecting operation
//! records two scalars instead:
//!
//! - `last_result`: the result, sign-extended from its operand width
//! - `aux_bits`: packed auxiliary data
//!   - bit 31: carry out (CF)
//!   - bit 30: sign correction, XORed into the derived SF
//!   - bit 9: OF, bit 8: AF (only when explicitly populated)
//!   - bits 0-7: parity deviation byte, XORed into the low result byte
//!     before PF is computed
//!
//! CF/ZF/SF/PF are derived on every query. The correction and deviation
//! fields let any FLAGS image be encoded back into the shadow (`popf`,
//! `sahf`, `SetFlag`), e.g. ZF and SF both set with a zero result.

use super::registers::Width;
use serde::{Deserialize, Serialize};

// Flag bit positions in FLAGS register
pub const FLAG_CF: u16 = 0x0001; // Carry Flag
pub const FLAG_PF: u16 = 0x0004; // Parity Flag
pub const FLAG_AF: u16 = 0x0010; // Auxiliary Carry Flag
pub const FLAG_ZF: u16 = 0x0040; // Zero Flag
pub const FLAG_SF: u16 = 0x0080; // Sign Flag
pub const FLAG_TF: u16 = 0x0100; // Trap Flag
pub const FLAG_IF: u16 = 0x0200; // Interrupt Enable Flag
pub const FLAG_DF: u16 = 0x0400; // Direction Flag
pub const FLAG_OF: u16 = 0x0800; // Overflow Flag
pub const FLAG_NT: u16 = 0x4000; // Nested Task

/// Bits owned by the lazy shadow
pub const STATUS_MASK: u16 = FLAG_CF | FLAG_PF | FLAG_AF | FLAG_ZF | FLAG_SF | FLAG_OF;

/// Reserved bit 1 always reads as 1
pub const FLAGS_ALWAYS_SET: u16 = 0x0002;
/// Reserved bits 3, 5 and 15 always read as 0
pub const FLAGS_ALWAYS_CLEAR: u16 = 0x8028;

pub const AUX_CF: u32 = 1 << 31;
pub const AUX_SF_FLIP: u32 = 1 << 30;
pub const AUX_OF: u32 = 1 << 9;
pub const AUX_AF: u32 = 1 << 8;
pub const AUX_PARITY: u32 = 0xFF;

#[inline]
fn even_parity(val: u8) -> bool {
    val.count_ones() % 2 == 0
}

/// Predicates of the sixteen Jcc condition codes; the low bit of the code
/// negates the predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Predicate {
    Overflow,
    Carry,
    Zero,
    BelowOrEqual,
    Sign,
    Parity,
    Less,
    LessOrEqual,
}

static CONDITIONS: [Predicate; 8] = [
    Predicate::Overflow,     // 0 O / 1 NO
    Predicate::Carry,        // 2 B / 3 NB
    Predicate::Zero,         // 4 E / 5 NE
    Predicate::BelowOrEqual, // 6 BE / 7 A
    Predicate::Sign,         // 8 S / 9 NS
    Predicate::Parity,       // A P / B NP
    Predicate::Less,         // C L / D GE
    Predicate::LessOrEqual,  // E LE / F G
];

/// Lazy status-flag shadow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LazyFlags {
    pub last_result: i32,
    pub aux_bits: u32,
}

impl LazyFlags {
    /// Record the result of a flag-affecting operation
    #[inline]
    pub fn set_result(&mut self, result: u32, width: Width, aux_bits: u32) {
        self.last_result = width.sign_extend(result);
        self.aux_bits = aux_bits;
    }

    #[inline]
    pub fn cf(&self) -> bool {
        self.aux_bits & AUX_CF != 0
    }

    #[inline]
    pub fn zf(&self) -> bool {
        self.last_result == 0
    }

    #[inline]
    pub fn sf(&self) -> bool {
        (self.last_result < 0) ^ (self.aux_bits & AUX_SF_FLIP != 0)
    }

    #[inline]
    pub fn pf(&self) -> bool {
        even_parity((self.last_result as u8) ^ (self.aux_bits & AUX_PARITY) as u8)
    }

    #[inline]
    pub fn af(&self) -> bool {
        self.aux_bits & AUX_AF != 0
    }

    #[inline]
    pub fn of(&self) -> bool {
        self.aux_bits & AUX_OF != 0
    }

    /// Derived status bits in FLAGS layout
    pub fn status(&self) -> u16 {
        let mut status = 0;
        if self.cf() {
            status |= FLAG_CF;
        }
        if self.pf() {
            status |= FLAG_PF;
        }
        if self.af() {
            status |= FLAG_AF;
        }
        if self.zf() {
            status |= FLAG_ZF;
        }
        if self.sf() {
            status |= FLAG_SF;
        }
        if self.of() {
            status |= FLAG_OF;
        }
        status
    }

    /// Encode status bits (FLAGS layout) back into a shadow that derives them
    pub fn from_status(status: u16) -> Self {
        let last_result = if status & FLAG_ZF != 0 { 0 } else { 1 };
        let mut aux_bits = 0;
        if status & FLAG_CF != 0 {
            aux_bits |= AUX_CF;
        }
        if status & FLAG_SF != 0 {
            aux_bits |= AUX_SF_FLIP;
        }
        if status & FLAG_AF != 0 {
            aux_bits |= AUX_AF;
        }
        if status & FLAG_OF != 0 {
            aux_bits |= AUX_OF;
        }
        if even_parity(last_result as u8) != (status & FLAG_PF != 0) {
            aux_bits |= 0x01;
        }
        Self {
            last_result,
            aux_bits,
        }
    }

    /// Evaluate a Jcc/LOOP-style condition code (low nibble of 0x70-0x7F)
    pub fn condition(&self, code: u8) -> bool {
        let taken = match CONDITIONS[((code >> 1) & 0x07) as usize] {
            Predicate::Overflow => self.of(),
            Predicate::Carry => self.cf(),
            Predicate::Zero => self.zf(),
            Predicate::BelowOrEqual => self.cf() || self.zf(),
            Predicate::Sign => self.sf(),
            Predicate::Parity => self.pf(),
            Predicate::Less => self.sf() != self.of(),
            Predicate::LessOrEqual => self.zf() || self.sf() != self.of(),
        };
        taken ^ (code & 0x01 != 0)
    }
}

/// Pack carry/adjust/overflow results into `aux_bits`. AF and OF are only
/// recorded when the core is configured to track them.
#[inline]
pub fn arith_aux(carry: bool, adjust: bool, overflow: bool, track_overflow: bool) -> u32 {
    let mut aux = if carry { AUX_CF } else { 0 };
    if track_overflow {
        if adjust {
            aux |= AUX_AF;
        }
        if overflow {
            aux |= AUX_OF;
        }
    }
    aux
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shadow(result: u32, width: Width, aux: u32) -> LazyFlags {
        let mut f = LazyFlags::from_status(0);
        f.set_result(result, width, aux);
        f
    }

    #[test]
    fn test_zero_and_sign_from_result() {
        let f = shadow(0, Width::Word, 0);
        assert!(f.zf());
        assert!(!f.sf());

        let f = shadow(0x8000, Width::Word, 0);
        assert!(!f.zf());
        assert!(f.sf());

        // 0x80 is negative as a byte but positive as a word
        assert!(shadow(0x80, Width::Byte, 0).sf());
        assert!(!shadow(0x80, Width::Word, 0).sf());
    }

    #[test]
    fn test_carry_is_bit_31() {
        assert!(shadow(1, Width::Byte, AUX_CF).cf());
        assert!(!shadow(1, Width::Byte, 0).cf());
    }

    #[test]
    fn test_parity_uses_low_byte_and_deviation() {
        // 0x03 has two bits set: even parity
        assert!(shadow(0x03, Width::Byte, 0).pf());
        // 0x07 has three bits set: odd parity
        assert!(!shadow(0x07, Width::Byte, 0).pf());
        // Only the low byte counts
        assert!(shadow(0x0100, Width::Word, 0).pf());
        // A deviation byte with one bit set flips the answer
        assert!(!shadow(0x03, Width::Byte, 0x01).pf());
    }

    #[test]
    fn test_af_of_default_false() {
        let f = shadow(0x7F, Width::Byte, AUX_CF);
        assert!(!f.af());
        assert!(!f.of());
        let f = shadow(0x7F, Width::Byte, AUX_AF | AUX_OF);
        assert!(f.af());
        assert!(f.of());
    }

    #[test]
    fn test_status_roundtrip_all_combinations() {
        for bits in 0u16..64 {
            let mut status = 0;
            for (i, flag) in [FLAG_CF, FLAG_PF, FLAG_AF, FLAG_ZF, FLAG_SF, FLAG_OF]
                .iter()
                .enumerate()
            {
                if bits & (1 << i) != 0 {
                    status |= flag;
                }
            }
            assert_eq!(
                LazyFlags::from_status(status).status(),
                status,
                "status {:04X} did not survive encoding",
                status
            );
        }
    }

    #[test]
    fn test_condition_table() {
        let zero = LazyFlags::from_status(FLAG_ZF);
        assert!(zero.condition(0x4)); // JE
        assert!(!zero.condition(0x5)); // JNE
        assert!(zero.condition(0x6)); // JBE
        assert!(!zero.condition(0x7)); // JA
        assert!(zero.condition(0xE)); // JLE

        let carry = LazyFlags::from_status(FLAG_CF);
        assert!(carry.condition(0x2)); // JB
        assert!(!carry.condition(0x3)); // JAE

        let less = LazyFlags::from_status(FLAG_SF);
        assert!(less.condition(0xC)); // JL
        assert!(!less.condition(0xD)); // JGE
        assert!(!less.condition(0xF)); // JG

        let overflow_and_sign = LazyFlags::from_status(FLAG_SF | FLAG_OF);
        assert!(!overflow_and_sign.condition(0xC));
        assert!(overflow_and_sign.condition(0x0)); // JO
    }

    #[test]
    fn test_arith_aux_respects_tracking() {
        assert_eq!(arith_aux(true, true, true, false), AUX_CF);
        assert_eq!(arith_aux(false, true, true, true), AUX_AF | AUX_OF);
        assert_eq!(arith_aux(false, false, false, true), 0);
    }
}
