//! Opcode descriptor table
//!
//! Every opcode byte maps to an [`Operation`] that carries what the executor
//! needs (width, direction, ALU function, register field) and what the
//! length computation needs (ModR/M presence, immediate size). The table is
//! generated once at compile time.

use super::modrm::{ModRm, LENGTH_TABLE};
use super::registers::{Flag, SegReg, Width};

/// The eight two-operand ALU functions, in encoding order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    const ALL: [AluOp; 8] = [
        AluOp::Add,
        AluOp::Or,
        AluOp::Adc,
        AluOp::Sbb,
        AluOp::And,
        AluOp::Sub,
        AluOp::Xor,
        AluOp::Cmp,
    ];

    #[inline]
    pub const fn from_index(index: u8) -> AluOp {
        Self::ALL[(index & 0x07) as usize]
    }

    /// CMP only sets flags
    #[inline]
    pub fn writes_result(self) -> bool {
        self != AluOp::Cmp
    }
}

/// Operand order of a ModR/M two-operand instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `op r/m, reg`
    ToRm,
    /// `op reg, r/m`
    ToReg,
}

/// Immediate operand kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Imm {
    Byte,
    Word,
    /// 8-bit, sign-extended to 16
    SignedByte,
}

impl Imm {
    #[inline]
    pub const fn size(self) -> u16 {
        match self {
            Imm::Byte | Imm::SignedByte => 1,
            Imm::Word => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringOp {
    Movs,
    Cmps,
    Stos,
    Lods,
    Scas,
    Ins,
    Outs,
}

impl StringOp {
    /// CMPS and SCAS honour the REPE/REPNE termination condition
    #[inline]
    pub fn compares(self) -> bool {
        matches!(self, StringOp::Cmps | StringOp::Scas)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftCount {
    One,
    Cl,
    Imm8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    LoopNz,
    LoopZ,
    Loop,
    Jcxz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortAddr {
    Imm8,
    Dx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BcdOp {
    Daa,
    Das,
    Aaa,
    Aas,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    Segment(SegReg),
    Rep,
    RepNe,
    Lock,
}

/// Decoded meaning of an opcode byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Prefix(Prefix),
    Alu { op: AluOp, width: Width, dir: Direction },
    AluAcc { op: AluOp, width: Width },
    /// 0x80-0x83, ALU function selected by the ModR/M reg field
    AluImm { width: Width, imm: Imm },
    Test { width: Width },
    TestAcc { width: Width },
    Xchg { width: Width },
    XchgAx(u8),
    Mov { width: Width, dir: Direction },
    MovFromSeg,
    MovToSeg,
    Lea,
    PopRm,
    MovAccMem { width: Width, store: bool },
    MovRegImm { width: Width, reg: u8 },
    MovRmImm { width: Width },
    LoadFarPointer(SegReg),
    IncReg(u8),
    DecReg(u8),
    PushReg(u8),
    PopReg(u8),
    PushSeg(SegReg),
    PopSeg(SegReg),
    Pusha,
    Popa,
    PushImm(Imm),
    ImulImm(Imm),
    Pushf,
    Popf,
    Sahf,
    Lahf,
    Bcd(BcdOp),
    Aam,
    Aad,
    Cbw,
    Cwd,
    Xlat,
    Salc,
    Jcc(u8),
    JmpRel8,
    JmpRel16,
    JmpFar,
    CallRel16,
    CallFar,
    RetNear { release: bool },
    RetFar { release: bool },
    Iret,
    Loop(LoopKind),
    Int3,
    IntImm,
    Into,
    In { width: Width, port: PortAddr },
    Out { width: Width, port: PortAddr },
    String { op: StringOp, width: Width },
    Shift { width: Width, count: ShiftCount },
    /// 0xF6/0xF7: test/not/neg/mul/imul/div/idiv
    Group3(Width),
    /// 0xFE: inc/dec r/m8
    Group4,
    /// 0xFF: inc/dec/call/jmp/push r/m16
    Group5,
    Enter,
    Leave,
    SetFlag { flag: Flag, value: bool },
    Cmc,
    Hlt,
    Nop,
    /// Coprocessor escape: operand bytes are skipped
    Escape,
    Invalid,
}

impl Operation {
    /// Whether a ModR/M byte follows the opcode
    pub fn has_modrm(self) -> bool {
        matches!(
            self,
            Operation::Alu { .. }
                | Operation::AluImm { .. }
                | Operation::Test { .. }
                | Operation::Xchg { .. }
                | Operation::Mov { .. }
                | Operation::MovFromSeg
                | Operation::MovToSeg
                | Operation::Lea
                | Operation::PopRm
                | Operation::MovRmImm { .. }
                | Operation::LoadFarPointer(_)
                | Operation::ImulImm(_)
                | Operation::Shift { .. }
                | Operation::Group3(_)
                | Operation::Group4
                | Operation::Group5
                | Operation::Escape
        )
    }

    /// Immediate bytes following the opcode (and ModR/M, if any)
    pub fn immediate_size(self, modrm: ModRm) -> u16 {
        match self {
            Operation::AluAcc { width, .. }
            | Operation::TestAcc { width }
            | Operation::MovRegImm { width, .. }
            | Operation::MovRmImm { width } => width.bytes(),
            Operation::AluImm { imm, .. } | Operation::PushImm(imm) | Operation::ImulImm(imm) => {
                imm.size()
            }
            Operation::MovAccMem { .. } => 2,
            Operation::Aam
            | Operation::Aad
            | Operation::Jcc(_)
            | Operation::JmpRel8
            | Operation::Loop(_)
            | Operation::IntImm => 1,
            Operation::In { port, .. } | Operation::Out { port, .. } => match port {
                PortAddr::Imm8 => 1,
                PortAddr::Dx => 0,
            },
            Operation::Shift { count, .. } => match count {
                ShiftCount::Imm8 => 1,
                ShiftCount::One | ShiftCount::Cl => 0,
            },
            Operation::JmpRel16 | Operation::CallRel16 => 2,
            Operation::JmpFar | Operation::CallFar => 4,
            Operation::RetNear { release } | Operation::RetFar { release } => {
                if release {
                    2
                } else {
                    0
                }
            }
            Operation::Group3(width) if modrm.reg() < 2 => width.bytes(),
            Operation::Enter => 3,
            _ => 0,
        }
    }

    /// Whether the ModR/M byte selects a defined instruction
    pub fn accepts(self, modrm: ModRm) -> bool {
        match self {
            Operation::PopRm | Operation::MovRmImm { .. } => modrm.reg() == 0,
            Operation::Group4 => modrm.reg() < 2,
            Operation::Group5 => match modrm.reg() {
                3 | 5 => !modrm.is_register(),
                7 => false,
                _ => true,
            },
            Operation::Lea | Operation::LoadFarPointer(_) => !modrm.is_register(),
            _ => true,
        }
    }

    /// Opcodes introduced with the 80186
    pub fn requires_80186(opcode: u8) -> bool {
        matches!(opcode, 0x60..=0x6F | 0xC0 | 0xC1 | 0xC8 | 0xC9)
    }
}

/// Total instruction length (without prefixes) given the bytes from the
/// opcode onwards. `None` when the ModR/M byte is not available.
pub fn instruction_length(op: Operation, modrm_byte: Option<u8>) -> Option<u16> {
    if op.has_modrm() {
        let modrm = ModRm(modrm_byte?);
        Some(LENGTH_TABLE[modrm.0 as usize] as u16 + op.immediate_size(modrm))
    } else {
        Some(1 + op.immediate_size(ModRm(0)))
    }
}

const fn alu_row(mut table: [Operation; 256], base: usize, op: AluOp) -> [Operation; 256] {
    table[base] = Operation::Alu {
        op,
        width: Width::Byte,
        dir: Direction::ToRm,
    };
    table[base + 1] = Operation::Alu {
        op,
        width: Width::Word,
        dir: Direction::ToRm,
    };
    table[base + 2] = Operation::Alu {
        op,
        width: Width::Byte,
        dir: Direction::ToReg,
    };
    table[base + 3] = Operation::Alu {
        op,
        width: Width::Word,
        dir: Direction::ToReg,
    };
    table[base + 4] = Operation::AluAcc {
        op,
        width: Width::Byte,
    };
    table[base + 5] = Operation::AluAcc {
        op,
        width: Width::Word,
    };
    table
}

const fn build_opcode_table() -> [Operation; 256] {
    use Operation as O;

    let mut t = [O::Invalid; 256];

    let mut row = 0;
    while row < 8 {
        t = alu_row(t, row * 8, AluOp::from_index(row as u8));
        row += 1;
    }

    t[0x06] = O::PushSeg(SegReg::ES);
    t[0x07] = O::PopSeg(SegReg::ES);
    t[0x0E] = O::PushSeg(SegReg::CS);
    t[0x16] = O::PushSeg(SegReg::SS);
    t[0x17] = O::PopSeg(SegReg::SS);
    t[0x1E] = O::PushSeg(SegReg::DS);
    t[0x1F] = O::PopSeg(SegReg::DS);
    t[0x26] = O::Prefix(Prefix::Segment(SegReg::ES));
    t[0x27] = O::Bcd(BcdOp::Daa);
    t[0x2E] = O::Prefix(Prefix::Segment(SegReg::CS));
    t[0x2F] = O::Bcd(BcdOp::Das);
    t[0x36] = O::Prefix(Prefix::Segment(SegReg::SS));
    t[0x37] = O::Bcd(BcdOp::Aaa);
    t[0x3E] = O::Prefix(Prefix::Segment(SegReg::DS));
    t[0x3F] = O::Bcd(BcdOp::Aas);

    let mut r = 0;
    while r < 8 {
        let reg = r as u8;
        t[0x40 + r] = O::IncReg(reg);
        t[0x48 + r] = O::DecReg(reg);
        t[0x50 + r] = O::PushReg(reg);
        t[0x58 + r] = O::PopReg(reg);
        if r > 0 {
            t[0x90 + r] = O::XchgAx(reg);
        }
        t[0xB0 + r] = O::MovRegImm {
            width: Width::Byte,
            reg,
        };
        t[0xB8 + r] = O::MovRegImm {
            width: Width::Word,
            reg,
        };
        t[0xD8 + r] = O::Escape;
        r += 1;
    }

    t[0x60] = O::Pusha;
    t[0x61] = O::Popa;
    t[0x68] = O::PushImm(Imm::Word);
    t[0x69] = O::ImulImm(Imm::Word);
    t[0x6A] = O::PushImm(Imm::SignedByte);
    t[0x6B] = O::ImulImm(Imm::SignedByte);
    t[0x6C] = O::String {
        op: StringOp::Ins,
        width: Width::Byte,
    };
    t[0x6D] = O::String {
        op: StringOp::Ins,
        width: Width::Word,
    };
    t[0x6E] = O::String {
        op: StringOp::Outs,
        width: Width::Byte,
    };
    t[0x6F] = O::String {
        op: StringOp::Outs,
        width: Width::Word,
    };

    let mut cc = 0;
    while cc < 16 {
        t[0x70 + cc] = O::Jcc(cc as u8);
        cc += 1;
    }

    t[0x80] = O::AluImm {
        width: Width::Byte,
        imm: Imm::Byte,
    };
    t[0x81] = O::AluImm {
        width: Width::Word,
        imm: Imm::Word,
    };
    t[0x82] = O::AluImm {
        width: Width::Byte,
        imm: Imm::Byte,
    };
    t[0x83] = O::AluImm {
        width: Width::Word,
        imm: Imm::SignedByte,
    };
    t[0x84] = O::Test { width: Width::Byte };
    t[0x85] = O::Test { width: Width::Word };
    t[0x86] = O::Xchg { width: Width::Byte };
    t[0x87] = O::Xchg { width: Width::Word };
    t[0x88] = O::Mov {
        width: Width::Byte,
        dir: Direction::ToRm,
    };
    t[0x89] = O::Mov {
        width: Width::Word,
        dir: Direction::ToRm,
    };
    t[0x8A] = O::Mov {
        width: Width::Byte,
        dir: Direction::ToReg,
    };
    t[0x8B] = O::Mov {
        width: Width::Word,
        dir: Direction::ToReg,
    };
    t[0x8C] = O::MovFromSeg;
    t[0x8D] = O::Lea;
    t[0x8E] = O::MovToSeg;
    t[0x8F] = O::PopRm;

    t[0x90] = O::Nop;
    t[0x98] = O::Cbw;
    t[0x99] = O::Cwd;
    t[0x9A] = O::CallFar;
    t[0x9B] = O::Nop; // WAIT
    t[0x9C] = O::Pushf;
    t[0x9D] = O::Popf;
    t[0x9E] = O::Sahf;
    t[0x9F] = O::Lahf;

    t[0xA0] = O::MovAccMem {
        width: Width::Byte,
        store: false,
    };
    t[0xA1] = O::MovAccMem {
        width: Width::Word,
        store: false,
    };
    t[0xA2] = O::MovAccMem {
        width: Width::Byte,
        store: true,
    };
    t[0xA3] = O::MovAccMem {
        width: Width::Word,
        store: true,
    };
    t[0xA4] = O::String {
        op: StringOp::Movs,
        width: Width::Byte,
    };
    t[0xA5] = O::String {
        op: StringOp::Movs,
        width: Width::Word,
    };
    t[0xA6] = O::String {
        op: StringOp::Cmps,
        width: Width::Byte,
    };
    t[0xA7] = O::String {
        op: StringOp::Cmps,
        width: Width::Word,
    };
    t[0xA8] = O::TestAcc { width: Width::Byte };
    t[0xA9] = O::TestAcc { width: Width::Word };
    t[0xAA] = O::String {
        op: StringOp::Stos,
        width: Width::Byte,
    };
    t[0xAB] = O::String {
        op: StringOp::Stos,
        width: Width::Word,
    };
    t[0xAC] = O::String {
        op: StringOp::Lods,
        width: Width::Byte,
    };
    t[0xAD] = O::String {
        op: StringOp::Lods,
        width: Width::Word,
    };
    t[0xAE] = O::String {
        op: StringOp::Scas,
        width: Width::Byte,
    };
    t[0xAF] = O::String {
        op: StringOp::Scas,
        width: Width::Word,
    };

    t[0xC0] = O::Shift {
        width: Width::Byte,
        count: ShiftCount::Imm8,
    };
    t[0xC1] = O::Shift {
        width: Width::Word,
        count: ShiftCount::Imm8,
    };
    t[0xC2] = O::RetNear { release: true };
    t[0xC3] = O::RetNear { release: false };
    t[0xC4] = O::LoadFarPointer(SegReg::ES);
    t[0xC5] = O::LoadFarPointer(SegReg::DS);
    t[0xC6] = O::MovRmImm { width: Width::Byte };
    t[0xC7] = O::MovRmImm { width: Width::Word };
    t[0xC8] = O::Enter;
    t[0xC9] = O::Leave;
    t[0xCA] = O::RetFar { release: true };
    t[0xCB] = O::RetFar { release: false };
    t[0xCC] = O::Int3;
    t[0xCD] = O::IntImm;
    t[0xCE] = O::Into;
    t[0xCF] = O::Iret;

    t[0xD0] = O::Shift {
        width: Width::Byte,
        count: ShiftCount::One,
    };
    t[0xD1] = O::Shift {
        width: Width::Word,
        count: ShiftCount::One,
    };
    t[0xD2] = O::Shift {
        width: Width::Byte,
        count: ShiftCount::Cl,
    };
    t[0xD3] = O::Shift {
        width: Width::Word,
        count: ShiftCount::Cl,
    };
    t[0xD4] = O::Aam;
    t[0xD5] = O::Aad;
    t[0xD6] = O::Salc;
    t[0xD7] = O::Xlat;

    t[0xE0] = O::Loop(LoopKind::LoopNz);
    t[0xE1] = O::Loop(LoopKind::LoopZ);
    t[0xE2] = O::Loop(LoopKind::Loop);
    t[0xE3] = O::Loop(LoopKind::Jcxz);
    t[0xE4] = O::In {
        width: Width::Byte,
        port: PortAddr::Imm8,
    };
    t[0xE5] = O::In {
        width: Width::Word,
        port: PortAddr::Imm8,
    };
    t[0xE6] = O::Out {
        width: Width::Byte,
        port: PortAddr::Imm8,
    };
    t[0xE7] = O::Out {
        width: Width::Word,
        port: PortAddr::Imm8,
    };
    t[0xE8] = O::CallRel16;
    t[0xE9] = O::JmpRel16;
    t[0xEA] = O::JmpFar;
    t[0xEB] = O::JmpRel8;
    t[0xEC] = O::In {
        width: Width::Byte,
        port: PortAddr::Dx,
    };
    t[0xED] = O::In {
        width: Width::Word,
        port: PortAddr::Dx,
    };
    t[0xEE] = O::Out {
        width: Width::Byte,
        port: PortAddr::Dx,
    };
    t[0xEF] = O::Out {
        width: Width::Word,
        port: PortAddr::Dx,
    };

    t[0xF0] = O::Prefix(Prefix::Lock);
    t[0xF2] = O::Prefix(Prefix::RepNe);
    t[0xF3] = O::Prefix(Prefix::Rep);
    t[0xF4] = O::Hlt;
    t[0xF5] = O::Cmc;
    t[0xF6] = O::Group3(Width::Byte);
    t[0xF7] = O::Group3(Width::Word);
    t[0xF8] = O::SetFlag {
        flag: Flag::CF,
        value: false,
    };
    t[0xF9] = O::SetFlag {
        flag: Flag::CF,
        value: true,
    };
    t[0xFA] = O::SetFlag {
        flag: Flag::IF,
        value: false,
    };
    t[0xFB] = O::SetFlag {
        flag: Flag::IF,
        value: true,
    };
    t[0xFC] = O::SetFlag {
        flag: Flag::DF,
        value: false,
    };
    t[0xFD] = O::SetFlag {
        flag: Flag::DF,
        value: true,
    };
    t[0xFE] = O::Group4;
    t[0xFF] = O::Group5;

    t
}

/// Descriptor for every opcode byte
pub static OPCODES: [Operation; 256] = build_opcode_table();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alu_rows() {
        assert_eq!(
            OPCODES[0x00],
            Operation::Alu {
                op: AluOp::Add,
                width: Width::Byte,
                dir: Direction::ToRm
            }
        );
        assert_eq!(
            OPCODES[0x2B],
            Operation::Alu {
                op: AluOp::Sub,
                width: Width::Word,
                dir: Direction::ToReg
            }
        );
        assert_eq!(
            OPCODES[0x3C],
            Operation::AluAcc {
                op: AluOp::Cmp,
                width: Width::Byte
            }
        );
        // Prefix and BCD slots interleaved with the ALU rows stay intact
        assert_eq!(
            OPCODES[0x26],
            Operation::Prefix(Prefix::Segment(SegReg::ES))
        );
        assert_eq!(OPCODES[0x0F], Operation::Invalid);
    }

    #[test]
    fn test_instruction_lengths() {
        // mov ax, imm16
        assert_eq!(instruction_length(OPCODES[0xB8], None), Some(3));
        // add [bx+si], al
        assert_eq!(instruction_length(OPCODES[0x00], Some(0x00)), Some(2));
        // add [disp16], al
        assert_eq!(instruction_length(OPCODES[0x00], Some(0x06)), Some(4));
        // add word [bp+disp8], imm16
        assert_eq!(instruction_length(OPCODES[0x81], Some(0x46)), Some(5));
        // add word [bx+disp16], simm8
        assert_eq!(instruction_length(OPCODES[0x83], Some(0x87)), Some(5));
        // test byte [bx], imm8 vs not byte [bx]
        assert_eq!(instruction_length(OPCODES[0xF6], Some(0x07)), Some(3));
        assert_eq!(instruction_length(OPCODES[0xF6], Some(0x17)), Some(2));
        // call far ptr16:16
        assert_eq!(instruction_length(OPCODES[0x9A], None), Some(5));
        // enter imm16, imm8
        assert_eq!(instruction_length(OPCODES[0xC8], None), Some(4));
        // fld qword [disp16] is skipped whole
        assert_eq!(instruction_length(OPCODES[0xDD], Some(0x06)), Some(4));
        // ModR/M missing
        assert_eq!(instruction_length(OPCODES[0xFF], None), None);
    }

    #[test]
    fn test_group_validation() {
        assert!(Operation::Group5.accepts(ModRm(0x07)));
        assert!(!Operation::Group5.accepts(ModRm(0x3F)));
        assert!(!Operation::Group5.accepts(ModRm(0xD8)));
        assert!(Operation::Group5.accepts(ModRm(0x1E)));
        assert!(!Operation::Group4.accepts(ModRm(0x10)));
        assert!(!Operation::PopRm.accepts(ModRm(0x08)));
        assert!(!Operation::Lea.accepts(ModRm(0xC0)));
    }

    #[test]
    fn test_80186_range() {
        assert!(Operation::requires_80186(0x60));
        assert!(Operation::requires_80186(0xC9));
        assert!(!Operation::requires_80186(0xCA));
    }
}
