use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use dos86_core::{Cpu, Cpu8086, EntryPoint, Memory, Reg16};

const LOAD_SEG: u16 = 0x1000;

fn entry() -> EntryPoint {
    EntryPoint {
        cs: LOAD_SEG,
        ip: 0x100,
        ss: LOAD_SEG,
        sp: 0xFFFE,
        psp: LOAD_SEG,
    }
}

/// Tight loop mixing register ALU, memory operands and a conditional branch
fn arithmetic_loop() -> Vec<u8> {
    vec![
        0xB8, 0x42, 0x00, // mov ax, 0x42
        0xBB, 0x00, 0x02, // mov bx, 0x200
        0x01, 0x07, // add [bx], ax
        0x8B, 0x0F, // mov cx, [bx]
        0x40, // inc ax
        0x31, 0xD1, // xor cx, dx
        0xD1, 0xE0, // shl ax, 1
        0x3D, 0x00, 0x80, // cmp ax, 0x8000
        0x75, 0xEF, // jne 0x103 (back to mov bx)
        0xEB, 0xEA, // jmp 0x100
    ]
}

/// Block copy driven by a repeat prefix
fn string_copy() -> Vec<u8> {
    vec![
        0xBE, 0x00, 0x10, // mov si, 0x1000
        0xBF, 0x00, 0x20, // mov di, 0x2000
        0xB9, 0x00, 0x01, // mov cx, 0x100
        0xF3, 0xA5, // rep movsw
        0xEB, 0xF3, // jmp 0x100
    ]
}

fn booted(program: &[u8]) -> Cpu8086 {
    let mut memory = Memory::new();
    memory
        .load(dos86_core::cpu_8086::linear(LOAD_SEG, 0x100), program)
        .expect("program fits");
    let mut cpu = Cpu8086::new(memory);
    cpu.boot(&entry());
    cpu
}

fn bench_cpu_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("cpu_8086_step");

    group.bench_function("single_instruction", |b| {
        let mut cpu = booted(&arithmetic_loop());
        b.iter(|| {
            cpu.step();
            black_box(cpu.get_reg16(Reg16::AX));
        });
    });

    group.finish();
}

fn bench_cpu_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("cpu_8086_run");

    for cycles in [10u32, 100, 1000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(cycles), cycles, |b, &count| {
            let mut cpu = booted(&arithmetic_loop());
            b.iter(|| {
                let _ = black_box(cpu.run(count));
            });
        });
    }

    group.finish();
}

fn bench_rep_movsw(c: &mut Criterion) {
    c.bench_function("cpu_8086_rep_movsw_256", |b| {
        let mut cpu = booted(&string_copy());
        b.iter(|| {
            // mov si; mov di; mov cx; rep movsw; jmp
            let _ = black_box(cpu.run(5));
        });
    });
}

fn bench_cpu_boot(c: &mut Criterion) {
    c.bench_function("cpu_8086_boot", |b| {
        let mut cpu = booted(&arithmetic_loop());
        let entry = entry();
        b.iter(|| {
            cpu.boot(&entry);
            black_box(cpu.regs.ip());
        });
    });
}

criterion_group!(
    benches,
    bench_cpu_step,
    bench_cpu_run,
    bench_rep_movsw,
    bench_cpu_boot
);
criterion_main!(benches);
