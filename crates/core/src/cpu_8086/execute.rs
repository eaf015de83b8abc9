//! Operation semantics
//!
//! IP already points past the instruction when an operation runs, so
//! relative branches add to it directly and pushed return addresses are
//! simply the current IP.

use super::dispatch::{
    AluOp, BcdOp, Direction, Imm, LoopKind, Operation, PortAddr, ShiftCount, StringOp,
};
use super::flags::{arith_aux, AUX_CF, AUX_OF};
use super::hooks::{CpuHooks, HookContext, PortWidth};
use super::modrm::{Location, MemRef, ModRm};
use super::registers::{Flag, Reg16, Reg8, SegReg, Width};
use super::{Cpu8086, CpuError, RepPrefix};
use crate::logging::{log, LogCategory, LogLevel};

/// Longest encoding without prefixes: opcode, ModR/M, disp16, imm16
pub(super) const MAX_INSTRUCTION_LEN: usize = 6;

/// A decoded instruction with its raw bytes
pub(super) struct Instruction {
    pub op: Operation,
    pub modrm: ModRm,
    pub bytes: [u8; MAX_INSTRUCTION_LEN],
    /// Index of the first immediate byte
    pub imm_at: usize,
}

impl Instruction {
    /// Bytes following the ModR/M byte
    #[inline]
    fn displacement(&self) -> &[u8] {
        &self.bytes[2..]
    }

    #[inline]
    fn imm8_at(&self, offset: usize) -> u8 {
        self.bytes[self.imm_at + offset]
    }

    #[inline]
    fn imm8(&self) -> u8 {
        self.imm8_at(0)
    }

    #[inline]
    fn imm16_at(&self, offset: usize) -> u16 {
        let i = self.imm_at + offset;
        u16::from_le_bytes([self.bytes[i], self.bytes[i + 1]])
    }

    #[inline]
    fn imm16(&self) -> u16 {
        self.imm16_at(0)
    }

    #[inline]
    fn imm(&self, width: Width) -> u32 {
        match width {
            Width::Byte => self.imm8() as u32,
            Width::Word => self.imm16() as u32,
        }
    }

    #[inline]
    fn immediate(&self, kind: Imm) -> u32 {
        match kind {
            Imm::Byte => self.imm8() as u32,
            Imm::Word => self.imm16() as u32,
            Imm::SignedByte => self.imm8() as i8 as i16 as u16 as u32,
        }
    }

    /// 8-bit branch displacement, sign-extended
    #[inline]
    fn rel8(&self) -> u16 {
        self.imm8() as i8 as i16 as u16
    }
}

fn port_width(width: Width) -> PortWidth {
    match width {
        Width::Byte => PortWidth::Byte,
        Width::Word => PortWidth::Word,
    }
}

impl<H: CpuHooks> Cpu8086<H> {
    pub(super) fn execute(&mut self, insn: &Instruction) -> Result<(), CpuError> {
        let modrm = insn.modrm;

        match insn.op {
            Operation::Alu { op, width, dir } => {
                let loc = self.operand(insn);
                let rm = self.read_operand(loc, width);
                let reg = self.read_reg(modrm.reg(), width);
                match dir {
                    Direction::ToRm => {
                        let result = self.alu(op, width, rm, reg);
                        if op.writes_result() {
                            self.write_operand(loc, width, result);
                        }
                    }
                    Direction::ToReg => {
                        let result = self.alu(op, width, reg, rm);
                        if op.writes_result() {
                            self.write_reg(modrm.reg(), width, result);
                        }
                    }
                }
            }
            Operation::AluAcc { op, width } => {
                let acc = self.read_reg(0, width);
                let result = self.alu(op, width, acc, insn.imm(width));
                if op.writes_result() {
                    self.write_reg(0, width, result);
                }
            }
            Operation::AluImm { width, imm } => {
                let op = AluOp::from_index(modrm.reg());
                let loc = self.operand(insn);
                let dst = self.read_operand(loc, width);
                let result = self.alu(op, width, dst, insn.immediate(imm));
                if op.writes_result() {
                    self.write_operand(loc, width, result);
                }
            }
            Operation::Test { width } => {
                let loc = self.operand(insn);
                let rm = self.read_operand(loc, width);
                let reg = self.read_reg(modrm.reg(), width);
                self.alu(AluOp::And, width, rm, reg);
            }
            Operation::TestAcc { width } => {
                let acc = self.read_reg(0, width);
                self.alu(AluOp::And, width, acc, insn.imm(width));
            }
            Operation::Xchg { width } => {
                let loc = self.operand(insn);
                let rm = self.read_operand(loc, width);
                let reg = self.read_reg(modrm.reg(), width);
                self.write_operand(loc, width, reg);
                self.write_reg(modrm.reg(), width, rm);
            }
            Operation::XchgAx(r) => {
                let other = Reg16::general(r);
                let ax = self.regs.get16(Reg16::AX);
                let val = self.regs.get16(other);
                self.regs.set16(Reg16::AX, val);
                self.regs.set16(other, ax);
            }
            Operation::Mov { width, dir } => {
                let loc = self.operand(insn);
                match dir {
                    Direction::ToRm => {
                        let val = self.read_reg(modrm.reg(), width);
                        self.write_operand(loc, width, val);
                    }
                    Direction::ToReg => {
                        let val = self.read_operand(loc, width);
                        self.write_reg(modrm.reg(), width, val);
                    }
                }
            }
            Operation::MovFromSeg => {
                let loc = self.operand(insn);
                let val = self.regs.seg(SegReg::from_index(modrm.reg()));
                self.write_operand(loc, Width::Word, val as u32);
            }
            Operation::MovToSeg => {
                let loc = self.operand(insn);
                let val = self.read_operand(loc, Width::Word);
                self.regs.set_seg(SegReg::from_index(modrm.reg()), val as u16);
            }
            Operation::Lea => {
                if let Some(offset) = modrm.offset(insn.displacement(), &self.regs) {
                    self.write_reg(modrm.reg(), Width::Word, offset as u32);
                }
            }
            Operation::PopRm => {
                let val = self.pop16();
                let loc = self.operand(insn);
                self.write_operand(loc, Width::Word, val as u32);
            }
            Operation::MovAccMem { width, store } => {
                let addr = MemRef::new(self.addressing.segment_base, insn.imm16());
                if store {
                    let val = self.read_reg(0, width);
                    self.store(addr, width, val);
                } else {
                    let val = self.load(addr, width);
                    self.write_reg(0, width, val);
                }
            }
            Operation::MovRegImm { width, reg } => self.write_reg(reg, width, insn.imm(width)),
            Operation::MovRmImm { width } => {
                let loc = self.operand(insn);
                self.write_operand(loc, width, insn.imm(width));
            }
            Operation::LoadFarPointer(seg) => {
                if let Location::Mem(mem) = self.operand(insn) {
                    let (segment, offset) = self.far_pointer(mem);
                    self.write_reg(modrm.reg(), Width::Word, offset as u32);
                    self.regs.set_seg(seg, segment);
                }
            }

            Operation::IncReg(r) | Operation::DecReg(r) => {
                let reg = Reg16::general(r);
                let val = self.regs.get16(reg) as u32;
                let increment = matches!(insn.op, Operation::IncReg(_));
                let result = self.inc_dec(Width::Word, val, increment);
                self.regs.set16(reg, result as u16);
            }
            Operation::PushReg(r) => {
                let reg = Reg16::general(r);
                // The 8086 pushes SP after the decrement
                let val = if reg == Reg16::SP {
                    self.regs.get16(Reg16::SP).wrapping_sub(2)
                } else {
                    self.regs.get16(reg)
                };
                self.push16(val);
            }
            Operation::PopReg(r) => {
                let val = self.pop16();
                self.regs.set16(Reg16::general(r), val);
            }
            Operation::PushSeg(seg) => self.push16(self.regs.seg(seg)),
            Operation::PopSeg(seg) => {
                let val = self.pop16();
                self.regs.set_seg(seg, val);
            }
            Operation::Pusha => {
                let sp = self.regs.get16(Reg16::SP);
                for reg in Reg16::GENERAL {
                    let val = if reg == Reg16::SP {
                        sp
                    } else {
                        self.regs.get16(reg)
                    };
                    self.push16(val);
                }
            }
            Operation::Popa => {
                for reg in Reg16::GENERAL.iter().rev() {
                    let val = self.pop16();
                    if *reg != Reg16::SP {
                        self.regs.set16(*reg, val);
                    }
                }
            }
            Operation::PushImm(imm) => self.push16(insn.immediate(imm) as u16),
            Operation::ImulImm(imm) => {
                let loc = self.operand(insn);
                let src = self.read_operand(loc, Width::Word) as u16 as i16 as i32;
                let factor = insn.immediate(imm) as u16 as i16 as i32;
                let product = src * factor;
                self.write_reg(modrm.reg(), Width::Word, product as u16 as u32);
                self.set_multiply_flags(
                    product as u16 as u32,
                    Width::Word,
                    product != product as i16 as i32,
                );
            }
            Operation::Pushf => {
                let image = self.regs.flags();
                self.push16(image);
            }
            Operation::Popf => {
                let image = self.pop16();
                self.regs.set_flags(image);
            }
            Operation::Sahf => {
                // SF ZF AF PF CF
                let ah = self.regs.get8(Reg8::AH) as u16 & 0x00D5;
                let image = self.regs.flags();
                self.regs.set_flags((image & 0xFF00) | ah);
            }
            Operation::Lahf => {
                let image = self.regs.flags();
                self.regs.set8(Reg8::AH, image as u8);
            }

            Operation::Bcd(op) => self.bcd_adjust(op),
            Operation::Aam => {
                let base = insn.imm8();
                if base == 0 {
                    self.divide_error();
                } else {
                    let al = self.regs.get8(Reg8::AL);
                    self.regs.set8(Reg8::AH, al / base);
                    self.regs.set8(Reg8::AL, al % base);
                    self.regs
                        .lazy_mut()
                        .set_result((al % base) as u32, Width::Byte, 0);
                }
            }
            Operation::Aad => {
                let base = insn.imm8();
                let al = self.regs.get8(Reg8::AL);
                let ah = self.regs.get8(Reg8::AH);
                let result = al.wrapping_add(ah.wrapping_mul(base));
                self.regs.set16(Reg16::AX, result as u16);
                self.regs.lazy_mut().set_result(result as u32, Width::Byte, 0);
            }
            Operation::Cbw => {
                let al = self.regs.get8(Reg8::AL);
                self.regs.set16(Reg16::AX, al as i8 as i16 as u16);
            }
            Operation::Cwd => {
                let ax = self.regs.get16(Reg16::AX);
                let dx = if ax & 0x8000 != 0 { 0xFFFF } else { 0 };
                self.regs.set16(Reg16::DX, dx);
            }
            Operation::Xlat => {
                let offset = self
                    .regs
                    .get16(Reg16::BX)
                    .wrapping_add(self.regs.get8(Reg8::AL) as u16);
                let val = self.load8(self.addressing.segment_base + offset as u32);
                self.regs.set8(Reg8::AL, val);
            }
            Operation::Salc => {
                let al = if self.regs.lazy().cf() { 0xFF } else { 0x00 };
                self.regs.set8(Reg8::AL, al);
            }

            Operation::Jcc(code) => {
                if self.regs.lazy().condition(code) {
                    self.jump_relative(insn.rel8());
                }
            }
            Operation::JmpRel8 => self.jump_relative(insn.rel8()),
            Operation::JmpRel16 => self.jump_relative(insn.imm16()),
            Operation::JmpFar => self.jump_far(insn.imm16_at(2), insn.imm16()),
            Operation::CallRel16 => {
                self.push16(self.regs.ip());
                self.jump_relative(insn.imm16());
            }
            Operation::CallFar => {
                self.push16(self.regs.get16(Reg16::CS));
                self.push16(self.regs.ip());
                self.jump_far(insn.imm16_at(2), insn.imm16());
            }
            Operation::RetNear { release } => {
                let ip = self.pop16();
                self.regs.set_ip(ip);
                if release {
                    self.release_stack(insn.imm16());
                }
            }
            Operation::RetFar { release } => {
                let ip = self.pop16();
                let cs = self.pop16();
                self.jump_far(cs, ip);
                if release {
                    self.release_stack(insn.imm16());
                }
            }
            Operation::Iret => {
                let ip = self.pop16();
                let cs = self.pop16();
                let image = self.pop16();
                self.jump_far(cs, ip);
                self.regs.set_flags(image);
            }
            Operation::Loop(kind) => {
                let taken = match kind {
                    LoopKind::Jcxz => self.regs.get16(Reg16::CX) == 0,
                    _ => {
                        let cx = self.regs.get16(Reg16::CX).wrapping_sub(1);
                        self.regs.set16(Reg16::CX, cx);
                        let zf = self.regs.lazy().zf();
                        cx != 0
                            && match kind {
                                LoopKind::LoopNz => !zf,
                                LoopKind::LoopZ => zf,
                                _ => true,
                            }
                    }
                };
                if taken {
                    self.jump_relative(insn.rel8());
                }
            }
            Operation::Int3 => self.interrupt(3),
            Operation::IntImm => self.interrupt(insn.imm8()),
            Operation::Into => {
                if self.regs.lazy().of() {
                    self.interrupt(4);
                }
            }

            Operation::In { width, port } => {
                let port = self.port_number(insn, port);
                let val = self.port_in(port, width)?;
                self.write_reg(0, width, val);
            }
            Operation::Out { width, port } => {
                let port = self.port_number(insn, port);
                let val = self.read_reg(0, width);
                self.port_out(port, width, val)?;
            }
            Operation::String { op, width } => self.string_op(op, width)?,

            Operation::Shift { width, count } => {
                let count = match count {
                    ShiftCount::One => 1,
                    ShiftCount::Cl => self.regs.get8(Reg8::CL),
                    ShiftCount::Imm8 => insn.imm8(),
                };
                // The 80186 masks shift counts to five bits
                let count = if self.config.model.supports_80186_instructions() {
                    count & 0x1F
                } else {
                    count
                };
                let loc = self.operand(insn);
                let val = self.read_operand(loc, width);
                let result = self.shift(modrm.reg(), width, val, count);
                self.write_operand(loc, width, result);
            }
            Operation::Group3(width) => {
                let loc = self.operand(insn);
                let val = self.read_operand(loc, width);
                match modrm.reg() {
                    0 | 1 => {
                        self.alu(AluOp::And, width, val, insn.imm(width));
                    }
                    2 => self.write_operand(loc, width, !val & width.mask()),
                    3 => {
                        let result = self.alu(AluOp::Sub, width, 0, val);
                        self.write_operand(loc, width, result);
                    }
                    4 => self.mul(width, val),
                    5 => self.imul(width, val),
                    6 => self.div(width, val),
                    _ => self.idiv(width, val),
                }
            }
            Operation::Group4 => {
                let loc = self.operand(insn);
                let val = self.read_operand(loc, Width::Byte);
                let result = self.inc_dec(Width::Byte, val, modrm.reg() == 0);
                self.write_operand(loc, Width::Byte, result);
            }
            Operation::Group5 => {
                let loc = self.operand(insn);
                match modrm.reg() {
                    0 | 1 => {
                        let val = self.read_operand(loc, Width::Word);
                        let result = self.inc_dec(Width::Word, val, modrm.reg() == 0);
                        self.write_operand(loc, Width::Word, result);
                    }
                    2 => {
                        let target = self.read_operand(loc, Width::Word) as u16;
                        self.push16(self.regs.ip());
                        self.regs.set_ip(target);
                    }
                    3 => {
                        if let Location::Mem(mem) = loc {
                            let (cs, ip) = self.far_pointer(mem);
                            self.push16(self.regs.get16(Reg16::CS));
                            self.push16(self.regs.ip());
                            self.jump_far(cs, ip);
                        }
                    }
                    4 => {
                        let target = self.read_operand(loc, Width::Word) as u16;
                        self.regs.set_ip(target);
                    }
                    5 => {
                        if let Location::Mem(mem) = loc {
                            let (cs, ip) = self.far_pointer(mem);
                            self.jump_far(cs, ip);
                        }
                    }
                    _ => {
                        let val = self.read_operand(loc, Width::Word);
                        self.push16(val as u16);
                    }
                }
            }
            Operation::Enter => self.enter(insn.imm16(), insn.imm8_at(2)),
            Operation::Leave => {
                self.regs.set16(Reg16::SP, self.regs.get16(Reg16::BP));
                let bp = self.pop16();
                self.regs.set16(Reg16::BP, bp);
            }

            Operation::SetFlag { flag, value } => self.regs.set_flag(flag, value),
            Operation::Cmc => {
                let cf = self.regs.get_flag(Flag::CF);
                self.regs.set_flag(Flag::CF, !cf);
            }
            Operation::Hlt => {
                self.waiting = true;
                log(LogCategory::CPU, LogLevel::Debug, || {
                    format!(
                        "CPU: HLT at {:04X}:{:04X}, waiting for interrupt",
                        self.regs.get16(Reg16::CS),
                        self.regs.ip()
                    )
                });
            }
            Operation::Escape => {
                log(LogCategory::Stubs, LogLevel::Trace, || {
                    format!("Stubs: coprocessor escape {:02X} skipped", insn.bytes[0])
                });
            }
            Operation::Nop => {}
            // Consumed by the decoder before execution
            Operation::Prefix(_) | Operation::Invalid => {}
        }

        Ok(())
    }

    #[inline]
    fn operand(&self, insn: &Instruction) -> Location {
        insn.modrm
            .resolve(insn.displacement(), &self.regs, &self.addressing)
    }

    #[inline]
    fn read_reg(&self, index: u8, width: Width) -> u32 {
        match width {
            Width::Byte => self.regs.get8(Reg8::from_index(index)) as u32,
            Width::Word => self.regs.get16(Reg16::general(index)) as u32,
        }
    }

    #[inline]
    fn write_reg(&mut self, index: u8, width: Width, val: u32) {
        match width {
            Width::Byte => self.regs.set8(Reg8::from_index(index), val as u8),
            Width::Word => self.regs.set16(Reg16::general(index), val as u16),
        }
    }

    /// Words wrap within the segment: offset 0xFFFF pairs with offset 0
    fn load(&mut self, mem: MemRef, width: Width) -> u32 {
        match width {
            Width::Byte => self.load8(mem.linear()) as u32,
            Width::Word => {
                let lo = self.load8(mem.linear()) as u32;
                let hi = self.load8(mem.advance(1).linear()) as u32;
                lo | (hi << 8)
            }
        }
    }

    fn store(&mut self, mem: MemRef, width: Width, val: u32) {
        self.store8(mem.linear(), val as u8);
        if width == Width::Word {
            self.store8(mem.advance(1).linear(), (val >> 8) as u8);
        }
    }

    fn read_operand(&mut self, loc: Location, width: Width) -> u32 {
        match loc {
            Location::Reg(index) => self.read_reg(index, width),
            Location::Mem(mem) => self.load(mem, width),
        }
    }

    fn write_operand(&mut self, loc: Location, width: Width, val: u32) {
        match loc {
            Location::Reg(index) => self.write_reg(index, width, val),
            Location::Mem(mem) => self.store(mem, width, val),
        }
    }

    /// `(segment, offset)` of a far pointer stored offset first
    fn far_pointer(&mut self, mem: MemRef) -> (u16, u16) {
        let offset = self.load(mem, Width::Word) as u16;
        let segment = self.load(mem.advance(2), Width::Word) as u16;
        (segment, offset)
    }

    #[inline]
    fn jump_relative(&mut self, rel: u16) {
        let ip = self.regs.ip().wrapping_add(rel);
        self.regs.set_ip(ip);
    }

    #[inline]
    fn jump_far(&mut self, cs: u16, ip: u16) {
        self.regs.set16(Reg16::CS, cs);
        self.regs.set_ip(ip);
    }

    fn release_stack(&mut self, bytes: u16) {
        let sp = self.regs.get16(Reg16::SP).wrapping_add(bytes);
        self.regs.set16(Reg16::SP, sp);
    }

    /// Two-operand ALU function; records the lazy flags and returns the
    /// masked result
    fn alu(&mut self, op: AluOp, width: Width, a: u32, b: u32) -> u32 {
        let mask = width.mask();
        let sign = width.sign_bit();
        let carry_in = self.regs.lazy().cf() as u32;

        let (result, carry, adjust, overflow) = match op {
            AluOp::Add | AluOp::Adc => {
                let c = if op == AluOp::Adc { carry_in } else { 0 };
                let wide = a + b + c;
                let r = wide & mask;
                (
                    r,
                    wide > mask,
                    (a ^ b ^ r) & 0x10 != 0,
                    (a ^ r) & (b ^ r) & sign != 0,
                )
            }
            AluOp::Sub | AluOp::Sbb | AluOp::Cmp => {
                let c = if op == AluOp::Sbb { carry_in } else { 0 };
                let r = a.wrapping_sub(b).wrapping_sub(c) & mask;
                (
                    r,
                    a < b + c,
                    (a ^ b ^ r) & 0x10 != 0,
                    (a ^ b) & (a ^ r) & sign != 0,
                )
            }
            AluOp::And => (a & b, false, false, false),
            AluOp::Or => (a | b, false, false, false),
            AluOp::Xor => (a ^ b, false, false, false),
        };

        let aux = arith_aux(carry, adjust, overflow, self.config.track_overflow);
        self.regs.lazy_mut().set_result(result, width, aux);
        result
    }

    /// INC/DEC leave CF untouched
    fn inc_dec(&mut self, width: Width, val: u32, increment: bool) -> u32 {
        let result = (if increment {
            val.wrapping_add(1)
        } else {
            val.wrapping_sub(1)
        }) & width.mask();
        let overflow = if increment {
            result == width.sign_bit()
        } else {
            val == width.sign_bit()
        };
        let adjust = (val ^ 1 ^ result) & 0x10 != 0;
        let carry = self.regs.lazy().cf();
        let aux = arith_aux(carry, adjust, overflow, self.config.track_overflow);
        self.regs.lazy_mut().set_result(result, width, aux);
        result
    }

    /// Group 2: ROL ROR RCL RCR SHL SHR SAL SAR, selected by `kind`
    fn shift(&mut self, kind: u8, width: Width, val: u32, count: u8) -> u32 {
        if count == 0 {
            return val;
        }

        let bits: u32 = match width {
            Width::Byte => 8,
            Width::Word => 16,
        };
        let mask = width.mask();
        let sign = width.sign_bit();
        let msb = |v: u32| v & sign != 0;
        let c = count as u32;

        match kind {
            0 => {
                let n = c % bits;
                let result = if n == 0 {
                    val
                } else {
                    ((val << n) | (val >> (bits - n))) & mask
                };
                let carry = result & 1 != 0;
                self.set_rotate_flags(carry, msb(result) != carry, count);
                result
            }
            1 => {
                let n = c % bits;
                let result = if n == 0 {
                    val
                } else {
                    ((val >> n) | (val << (bits - n))) & mask
                };
                let carry = msb(result);
                self.set_rotate_flags(carry, carry != (result & (sign >> 1) != 0), count);
                result
            }
            2 => {
                let mut result = val;
                let mut carry = self.regs.lazy().cf();
                for _ in 0..count {
                    let out = msb(result);
                    result = ((result << 1) | carry as u32) & mask;
                    carry = out;
                }
                self.set_rotate_flags(carry, msb(result) != carry, count);
                result
            }
            3 => {
                let mut result = val;
                let mut carry = self.regs.lazy().cf();
                let overflow = msb(val) != carry;
                for _ in 0..count {
                    let out = result & 1 != 0;
                    result = (result >> 1) | if carry { sign } else { 0 };
                    carry = out;
                }
                self.set_rotate_flags(carry, overflow, count);
                result
            }
            4 | 6 => {
                let carry = c <= bits && (val >> (bits - c)) & 1 != 0;
                let result = if c >= bits { 0 } else { (val << c) & mask };
                self.set_shift_flags(result, width, carry, msb(result) != carry, count);
                result
            }
            5 => {
                let carry = c <= bits && (val >> (c - 1)) & 1 != 0;
                let result = if c >= bits { 0 } else { val >> c };
                self.set_shift_flags(result, width, carry, msb(val), count);
                result
            }
            _ => {
                let signed = width.sign_extend(val);
                let c = c.min(bits);
                let carry = (signed >> (c - 1)) & 1 != 0;
                let result = (signed >> c) as u32 & mask;
                self.set_shift_flags(result, width, carry, false, count);
                result
            }
        }
    }

    /// Rotates change only CF (and OF for single-bit rotates)
    fn set_rotate_flags(&mut self, carry: bool, overflow: bool, count: u8) {
        self.regs.set_flag(Flag::CF, carry);
        if count == 1 && self.config.track_overflow {
            self.regs.set_flag(Flag::OF, overflow);
        }
    }

    fn set_shift_flags(&mut self, result: u32, width: Width, carry: bool, overflow: bool, count: u8) {
        let aux = arith_aux(
            carry,
            false,
            overflow && count == 1,
            self.config.track_overflow,
        );
        self.regs.lazy_mut().set_result(result, width, aux);
    }

    /// MUL/IMUL set CF and OF together when the upper half is significant
    fn set_multiply_flags(&mut self, low: u32, width: Width, overflow: bool) {
        let aux = if overflow { AUX_CF | AUX_OF } else { 0 };
        self.regs.lazy_mut().set_result(low, width, aux);
    }

    fn mul(&mut self, width: Width, src: u32) {
        match width {
            Width::Byte => {
                let product = self.regs.get8(Reg8::AL) as u32 * src;
                self.regs.set16(Reg16::AX, product as u16);
                self.set_multiply_flags(product & 0xFF, width, product >> 8 != 0);
            }
            Width::Word => {
                let product = self.regs.get16(Reg16::AX) as u32 * src;
                self.regs.set16(Reg16::AX, product as u16);
                self.regs.set16(Reg16::DX, (product >> 16) as u16);
                self.set_multiply_flags(product & 0xFFFF, width, product >> 16 != 0);
            }
        }
    }

    fn imul(&mut self, width: Width, src: u32) {
        match width {
            Width::Byte => {
                let product =
                    self.regs.get8(Reg8::AL) as i8 as i16 * src as u8 as i8 as i16;
                self.regs.set16(Reg16::AX, product as u16);
                self.set_multiply_flags(
                    product as u8 as u32,
                    width,
                    product != product as i8 as i16,
                );
            }
            Width::Word => {
                let product =
                    self.regs.get16(Reg16::AX) as i16 as i32 * src as u16 as i16 as i32;
                self.regs.set16(Reg16::AX, product as u16);
                self.regs.set16(Reg16::DX, (product >> 16) as u16);
                self.set_multiply_flags(
                    product as u16 as u32,
                    width,
                    product != product as i16 as i32,
                );
            }
        }
    }

    fn div(&mut self, width: Width, divisor: u32) {
        if divisor == 0 {
            return self.divide_error();
        }
        match width {
            Width::Byte => {
                let dividend = self.regs.get16(Reg16::AX) as u32;
                let quotient = dividend / divisor;
                if quotient > 0xFF {
                    return self.divide_error();
                }
                self.regs.set8(Reg8::AL, quotient as u8);
                self.regs.set8(Reg8::AH, (dividend % divisor) as u8);
            }
            Width::Word => {
                let dividend = ((self.regs.get16(Reg16::DX) as u32) << 16)
                    | self.regs.get16(Reg16::AX) as u32;
                let quotient = dividend / divisor;
                if quotient > 0xFFFF {
                    return self.divide_error();
                }
                self.regs.set16(Reg16::AX, quotient as u16);
                self.regs.set16(Reg16::DX, (dividend % divisor) as u16);
            }
        }
    }

    fn idiv(&mut self, width: Width, divisor: u32) {
        match width {
            Width::Byte => {
                let divisor = divisor as u8 as i8 as i32;
                if divisor == 0 {
                    return self.divide_error();
                }
                let dividend = self.regs.get16(Reg16::AX) as i16 as i32;
                let quotient = dividend / divisor;
                if !(i8::MIN as i32..=i8::MAX as i32).contains(&quotient) {
                    return self.divide_error();
                }
                self.regs.set8(Reg8::AL, quotient as u8);
                self.regs.set8(Reg8::AH, (dividend % divisor) as u8);
            }
            Width::Word => {
                let divisor = divisor as u16 as i16 as i64;
                if divisor == 0 {
                    return self.divide_error();
                }
                let dividend = (((self.regs.get16(Reg16::DX) as u32) << 16)
                    | self.regs.get16(Reg16::AX) as u32) as i32 as i64;
                let quotient = dividend / divisor;
                if !(i16::MIN as i64..=i16::MAX as i64).contains(&quotient) {
                    return self.divide_error();
                }
                self.regs.set16(Reg16::AX, quotient as u16);
                self.regs.set16(Reg16::DX, (dividend % divisor) as u16);
            }
        }
    }

    /// Interrupt 0; the pushed return address is the next instruction
    fn divide_error(&mut self) {
        log(LogCategory::Interrupts, LogLevel::Debug, || {
            format!(
                "Interrupts: divide error near {:04X}:{:04X}",
                self.regs.get16(Reg16::CS),
                self.regs.ip()
            )
        });
        self.interrupt(0);
    }

    fn bcd_adjust(&mut self, op: BcdOp) {
        let al = self.regs.get8(Reg8::AL);
        let cf = self.regs.lazy().cf();
        let af = self.regs.lazy().af();
        let track = self.config.track_overflow;
        let low_nibble_adjust = al & 0x0F > 9 || af;

        match op {
            BcdOp::Daa | BcdOp::Das => {
                let mut result = al;
                let mut carry = false;
                if low_nibble_adjust {
                    result = if op == BcdOp::Daa {
                        result.wrapping_add(0x06)
                    } else {
                        result.wrapping_sub(0x06)
                    };
                }
                if al > 0x99 || cf {
                    result = if op == BcdOp::Daa {
                        result.wrapping_add(0x60)
                    } else {
                        result.wrapping_sub(0x60)
                    };
                    carry = true;
                }
                self.regs.set8(Reg8::AL, result);
                let aux = arith_aux(carry, low_nibble_adjust, false, track);
                self.regs.lazy_mut().set_result(result as u32, Width::Byte, aux);
            }
            BcdOp::Aaa | BcdOp::Aas => {
                let mut al = al;
                if low_nibble_adjust {
                    let ah = self.regs.get8(Reg8::AH);
                    if op == BcdOp::Aaa {
                        al = al.wrapping_add(6);
                        self.regs.set8(Reg8::AH, ah.wrapping_add(1));
                    } else {
                        al = al.wrapping_sub(6);
                        self.regs.set8(Reg8::AH, ah.wrapping_sub(1));
                    }
                }
                al &= 0x0F;
                self.regs.set8(Reg8::AL, al);
                let aux = arith_aux(low_nibble_adjust, low_nibble_adjust, false, track);
                self.regs.lazy_mut().set_result(al as u32, Width::Byte, aux);
            }
        }
    }

    fn enter(&mut self, frame_size: u16, level: u8) {
        let level = level & 0x1F;
        let mut bp = self.regs.get16(Reg16::BP);
        self.push16(bp);
        let frame = self.regs.get16(Reg16::SP);

        if level > 0 {
            let ss = self.regs.get16(Reg16::SS);
            for _ in 1..level {
                bp = bp.wrapping_sub(2);
                let val = self.read_word(ss, bp);
                self.push16(val);
            }
            self.push16(frame);
        }

        self.regs.set16(Reg16::BP, frame);
        self.regs
            .set16(Reg16::SP, self.regs.get16(Reg16::SP).wrapping_sub(frame_size));
    }

    /// Execute a string instruction, repeating under REP/REPNE
    fn string_op(&mut self, op: StringOp, width: Width) -> Result<(), CpuError> {
        let Some(rep) = self.rep else {
            return self.string_iteration(op, width);
        };

        while self.regs.get16(Reg16::CX) != 0 {
            self.string_iteration(op, width)?;
            let cx = self.regs.get16(Reg16::CX).wrapping_sub(1);
            self.regs.set16(Reg16::CX, cx);

            if op.compares() {
                let zf = self.regs.lazy().zf();
                let done = match rep {
                    RepPrefix::Rep => !zf,
                    RepPrefix::RepNe => zf,
                };
                if done {
                    break;
                }
            }
        }
        Ok(())
    }

    /// One element: source DS:SI (or the override), destination ES:DI
    fn string_iteration(&mut self, op: StringOp, width: Width) -> Result<(), CpuError> {
        let step = if self.regs.get_flag(Flag::DF) {
            width.bytes().wrapping_neg()
        } else {
            width.bytes()
        };
        let si = self.regs.get16(Reg16::SI);
        let di = self.regs.get16(Reg16::DI);
        let src = MemRef::new(self.addressing.segment_base, si);
        let dst = MemRef::new((self.regs.get16(Reg16::ES) as u32) << 4, di);
        let (advance_si, advance_di) = match op {
            StringOp::Movs => {
                let val = self.load(src, width);
                self.store(dst, width, val);
                (true, true)
            }
            StringOp::Cmps => {
                let a = self.load(src, width);
                let b = self.load(dst, width);
                self.alu(AluOp::Cmp, width, a, b);
                (true, true)
            }
            StringOp::Stos => {
                let val = self.read_reg(0, width);
                self.store(dst, width, val);
                (false, true)
            }
            StringOp::Lods => {
                let val = self.load(src, width);
                self.write_reg(0, width, val);
                (true, false)
            }
            StringOp::Scas => {
                let acc = self.read_reg(0, width);
                let val = self.load(dst, width);
                self.alu(AluOp::Cmp, width, acc, val);
                (false, true)
            }
            StringOp::Ins => {
                let port = self.regs.get16(Reg16::DX);
                let val = self.port_in(port, width)?;
                self.store(dst, width, val);
                (false, true)
            }
            StringOp::Outs => {
                let port = self.regs.get16(Reg16::DX);
                let val = self.load(src, width);
                self.port_out(port, width, val)?;
                (true, false)
            }
        };

        if advance_si {
            self.regs.set16(Reg16::SI, si.wrapping_add(step));
        }
        if advance_di {
            self.regs.set16(Reg16::DI, di.wrapping_add(step));
        }
        Ok(())
    }

    fn port_number(&self, insn: &Instruction, port: PortAddr) -> u16 {
        match port {
            PortAddr::Imm8 => insn.imm8() as u16,
            PortAddr::Dx => self.regs.get16(Reg16::DX),
        }
    }

    fn port_in(&mut self, port: u16, width: Width) -> Result<u32, CpuError> {
        let value = {
            let mut ctx =
                HookContext::new(&mut self.regs, &mut self.memory, &mut self.stop_requested);
            self.hooks.port_read(&mut ctx, port, port_width(width))
        };
        match value {
            Some(val) => {
                log(LogCategory::Io, LogLevel::Trace, || {
                    format!("Io: IN {:#06X} -> {:04X}", port, val)
                });
                Ok(val as u32 & width.mask())
            }
            None => {
                self.unhandled_port(port, width, false)?;
                Ok(0)
            }
        }
    }

    fn port_out(&mut self, port: u16, width: Width, val: u32) -> Result<(), CpuError> {
        let handled = {
            let mut ctx =
                HookContext::new(&mut self.regs, &mut self.memory, &mut self.stop_requested);
            self.hooks
                .port_write(&mut ctx, port, port_width(width), val as u16)
        };
        log(LogCategory::Io, LogLevel::Trace, || {
            format!("Io: OUT {:#06X} <- {:04X}", port, val)
        });
        if handled {
            Ok(())
        } else {
            self.unhandled_port(port, width, true)
        }
    }

    fn unhandled_port(&self, port: u16, width: Width, write: bool) -> Result<(), CpuError> {
        if self.config.strict_ports {
            return Err(CpuError::UnhandledPort {
                port,
                width: port_width(width),
                write,
            });
        }
        log(LogCategory::Stubs, LogLevel::Warn, || {
            format!(
                "Stubs: unhandled {} port {} at {:#06X}",
                port_width(width),
                if write { "write" } else { "read" },
                port
            )
        });
        Ok(())
    }
}
