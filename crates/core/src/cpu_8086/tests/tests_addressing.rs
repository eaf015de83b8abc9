//! ModR/M operands, segment overrides and decode failures

use super::{com_cpu, CODE_SEG};
use crate::cpu_8086::{linear, Cpu8086, CpuError, Reg16, Reg8, RunOutcome};
use crate::memory::Memory;

#[test]
fn test_es_override_scoped_to_one_instruction() {
    // mov al, es:[bx]; mov ah, [bx]
    let mut cpu = com_cpu(&[0x26, 0x8A, 0x07, 0x8A, 0x27]);
    cpu.set_reg16(Reg16::DS, 0x2000);
    cpu.set_reg16(Reg16::ES, 0x3000);
    cpu.set_reg16(Reg16::BX, 0x0010);
    cpu.memory.write8(linear(0x2000, 0x0010), 0x11);
    cpu.memory.write8(linear(0x3000, 0x0010), 0x22);

    cpu.run(2).expect("run");
    assert_eq!(cpu.get_reg8(Reg8::AL), 0x22);
    assert_eq!(cpu.get_reg8(Reg8::AH), 0x11);
}

#[test]
fn test_bp_addresses_default_to_stack_segment() {
    // mov ax, [bp+2]
    let mut cpu = com_cpu(&[0x8B, 0x46, 0x02]);
    cpu.set_reg16(Reg16::SS, 0x4000);
    cpu.set_reg16(Reg16::BP, 0x0200);
    cpu.memory.write16(linear(0x4000, 0x0202), 0xCAFE);

    cpu.run(1).expect("run");
    assert_eq!(cpu.get_reg16(Reg16::AX), 0xCAFE);
}

#[test]
fn test_override_replaces_stack_segment_for_bp() {
    // mov ax, ds:[bp+2]
    let mut cpu = com_cpu(&[0x3E, 0x8B, 0x46, 0x02]);
    cpu.set_reg16(Reg16::SS, 0x4000);
    cpu.set_reg16(Reg16::DS, 0x5000);
    cpu.set_reg16(Reg16::BP, 0x0200);
    cpu.memory.write16(linear(0x5000, 0x0202), 0xF00D);

    cpu.run(1).expect("run");
    assert_eq!(cpu.get_reg16(Reg16::AX), 0xF00D);
}

#[test]
fn test_direct_address_length() {
    // mov ax, [0x0234]; mov bx, [0x0234] (accumulator form)
    let mut cpu = com_cpu(&[0x8B, 0x06, 0x34, 0x02, 0xA1, 0x34, 0x02]);
    cpu.memory.write16(linear(CODE_SEG, 0x0234), 0x7788);

    cpu.run(1).expect("run");
    assert_eq!(cpu.get_reg16(Reg16::AX), 0x7788);
    assert_eq!(cpu.regs.ip(), 0x104);

    cpu.set_reg16(Reg16::AX, 0);
    cpu.run(1).expect("run");
    assert_eq!(cpu.get_reg16(Reg16::AX), 0x7788);
    assert_eq!(cpu.regs.ip(), 0x107);
}

#[test]
fn test_effective_offset_wraps() {
    // mov al, [bx+2]
    let mut cpu = com_cpu(&[0x8A, 0x47, 0x02]);
    cpu.set_reg16(Reg16::BX, 0xFFFF);
    cpu.memory.write8(linear(CODE_SEG, 0x0001), 0x5A);

    cpu.run(1).expect("run");
    assert_eq!(cpu.get_reg8(Reg8::AL), 0x5A);
}

#[test]
fn test_segment_load_takes_effect_next_instruction() {
    // mov ds, ax; mov al, [0]
    let mut cpu = com_cpu(&[0x8E, 0xD8, 0xA0, 0x00, 0x00]);
    cpu.set_reg16(Reg16::AX, 0x2000);
    cpu.memory.write8(0x20000, 0x99);

    cpu.run(2).expect("run");
    assert_eq!(cpu.get_reg16(Reg16::DS), 0x2000);
    assert_eq!(cpu.get_reg8(Reg8::AL), 0x99);
}

#[test]
fn test_mov_from_segment_register() {
    // mov [0x0200], es
    let mut cpu = com_cpu(&[0x8C, 0x06, 0x00, 0x02]);
    cpu.set_reg16(Reg16::ES, 0xB800);

    cpu.run(1).expect("run");
    assert_eq!(cpu.memory.read16(linear(CODE_SEG, 0x0200)), 0xB800);
}

#[test]
fn test_les_loads_far_pointer() {
    // les bx, [0x0200]
    let mut cpu = com_cpu(&[0xC4, 0x1E, 0x00, 0x02]);
    cpu.memory
        .load(linear(CODE_SEG, 0x0200), &[0x34, 0x12, 0x00, 0x50])
        .expect("load");

    cpu.run(1).expect("run");
    assert_eq!(cpu.get_reg16(Reg16::BX), 0x1234);
    assert_eq!(cpu.get_reg16(Reg16::ES), 0x5000);
}

#[test]
fn test_lea_computes_offset_only() {
    // lea ax, [bx+si+4]
    let mut cpu = com_cpu(&[0x8D, 0x40, 0x04]);
    cpu.set_reg16(Reg16::BX, 0x0100);
    cpu.set_reg16(Reg16::SI, 0x0010);
    cpu.set_reg16(Reg16::DS, 0x7000);

    cpu.run(1).expect("run");
    assert_eq!(cpu.get_reg16(Reg16::AX), 0x0114);
}

#[test]
fn test_pop_to_memory() {
    // push ax; pop word [0x0200]
    let mut cpu = com_cpu(&[0x50, 0x8F, 0x06, 0x00, 0x02]);
    cpu.set_reg16(Reg16::AX, 0x4242);

    cpu.run(2).expect("run");
    assert_eq!(cpu.memory.read16(linear(CODE_SEG, 0x0200)), 0x4242);
    assert_eq!(cpu.get_reg16(Reg16::SP), 0xFFFE);
}

#[test]
fn test_mov_rm_immediate_after_displacement() {
    // mov word [bp-2], 0xABCD
    let mut cpu = com_cpu(&[0xC7, 0x46, 0xFE, 0xCD, 0xAB]);
    cpu.set_reg16(Reg16::BP, 0x0010);

    cpu.run(1).expect("run");
    assert_eq!(cpu.memory.read16(linear(CODE_SEG, 0x000E)), 0xABCD);
    assert_eq!(cpu.regs.ip(), 0x105);
}

#[test]
fn test_xlat_uses_segment_base() {
    // xlat
    let mut cpu = com_cpu(&[0xD7]);
    cpu.set_reg16(Reg16::BX, 0x0300);
    cpu.set_reg8(Reg8::AL, 0x05);
    cpu.memory.write8(linear(CODE_SEG, 0x0305), 0x77);

    cpu.run(1).expect("run");
    assert_eq!(cpu.get_reg8(Reg8::AL), 0x77);
}

#[test]
fn test_escape_opcode_skips_operands() {
    // fld qword [0x0000]; nop
    let mut cpu = com_cpu(&[0xDD, 0x06, 0x00, 0x00, 0x90]);

    cpu.run(1).expect("run");
    assert_eq!(cpu.regs.ip(), 0x104);
}

#[test]
fn test_truncated_instruction_at_end_of_memory() {
    // nop; mov ax, imm16 (missing one byte)
    let mut cpu = Cpu8086::new(Memory::from_image(&[0x90, 0xB8, 0x34]));

    assert_eq!(cpu.run(2), Err(CpuError::Truncated { cs: 0, ip: 1 }));
    assert_eq!(cpu.regs.ip(), 1);
    assert_eq!(cpu.get_reg16(Reg16::AX), 0);
}

#[test]
fn test_undefined_group_encodings_halt() {
    let cases: [&[u8]; 6] = [
        // pop r/m with reg field 1
        &[0x8F, 0x08],
        // mov r/m, imm with reg field 2
        &[0xC6, 0x10, 0x00],
        // group 4 reg field 2
        &[0xFE, 0x10],
        // group 5 reg field 7
        &[0xFF, 0x38],
        // call far with a register operand
        &[0xFF, 0xD8],
        // lea with a register operand
        &[0x8D, 0xC0],
    ];
    for program in cases {
        let mut cpu = com_cpu(program);
        let result = cpu.run(1);
        assert!(
            matches!(result, Err(CpuError::InvalidOpcode { .. })),
            "{:02X?} gave {:?}",
            program,
            result
        );
        assert_eq!(cpu.regs.ip(), 0x100);
    }
}

#[test]
fn test_lock_and_wait_are_transparent() {
    // lock inc word [0x0200]; wait
    let mut cpu = com_cpu(&[0xF0, 0xFF, 0x06, 0x00, 0x02, 0x9B]);

    assert_eq!(cpu.run(2), Ok(RunOutcome::Completed));
    assert_eq!(cpu.memory.read16(linear(CODE_SEG, 0x0200)), 1);
    assert_eq!(cpu.regs.ip(), 0x106);
}

#[test]
fn test_prefix_chain_limit() {
    // 15 x es: then nop
    let mut program = vec![0x26; 15];
    program.push(0x90);
    let mut cpu = com_cpu(&program);
    assert_eq!(cpu.run(1), Ok(RunOutcome::Completed));
    assert_eq!(cpu.regs.ip(), 0x110);

    // 16 x es: then nop
    let mut program = vec![0x26; 16];
    program.push(0x90);
    let mut cpu = com_cpu(&program);
    assert!(matches!(
        cpu.run(1),
        Err(CpuError::InvalidOpcode { opcode: 0x26, .. })
    ));
    assert_eq!(cpu.regs.ip(), 0x100);
    assert_eq!(cpu.instructions, 0);
}

#[test]
fn test_segment_of_prefixes_halts() {
    let mut cpu = com_cpu(&[]);
    cpu.memory
        .load(linear(CODE_SEG, 0), &vec![0x2E; 0x10000])
        .expect("load");

    assert!(matches!(
        cpu.run(1),
        Err(CpuError::InvalidOpcode { opcode: 0x2E, .. })
    ));
    assert_eq!(cpu.regs.ip(), 0x100);
}

#[test]
fn test_word_operand_wraps_within_segment() {
    // mov ax, [0xFFFF]
    let mut cpu = com_cpu(&[0xA1, 0xFF, 0xFF]);
    cpu.set_reg16(Reg16::DS, 0x2000);
    cpu.memory.write8(0x2FFFF, 0x34);
    cpu.memory.write8(0x20000, 0x12);
    cpu.memory.write8(0x30000, 0x99);

    cpu.run(1).expect("run");
    assert_eq!(cpu.get_reg16(Reg16::AX), 0x1234);

    // mov [bx], ax with BX = 0xFFFF
    let mut cpu = com_cpu(&[0x89, 0x07]);
    cpu.set_reg16(Reg16::DS, 0x2000);
    cpu.set_reg16(Reg16::BX, 0xFFFF);
    cpu.set_reg16(Reg16::AX, 0xBEEF);

    cpu.run(1).expect("run");
    assert_eq!(cpu.memory.read8(0x2FFFF), 0xEF);
    assert_eq!(cpu.memory.read8(0x20000), 0xBE);
    assert_eq!(cpu.memory.read8(0x30000), 0x00);
}

#[test]
fn test_far_pointer_wraps_within_segment() {
    // lds si, [0xFFFE]
    let mut cpu = com_cpu(&[0xC5, 0x36, 0xFE, 0xFF]);
    cpu.set_reg16(Reg16::DS, 0x2000);
    cpu.memory.write16(0x2FFFE, 0x0456);
    cpu.memory.write16(0x20000, 0x7000);
    cpu.memory.write16(0x30000, 0xDEAD);

    cpu.run(1).expect("run");
    assert_eq!(cpu.get_reg16(Reg16::SI), 0x0456);
    assert_eq!(cpu.get_reg16(Reg16::DS), 0x7000);
}
