//! Literal end-to-end scenarios run through `Manager`: arithmetic, stack
//! round-trip, conditional branching, big-endian memory, tagged loads, and
//! the exit syscall.

use enigma_vm::instruction::Opcode;
use enigma_vm::manager::{ExitReason, Manager};
use enigma_vm::memory::tagged_addr;
use enigma_vm::registers::Register;

fn encode_reg_reg(op: Opcode, dst: u8, src: u8) -> u64 {
    ((op as u64) << 58) | ((u64::from(dst) & 0b111) << 3) | (u64::from(src) & 0b111)
}

fn encode_reg_imm(op: Opcode, format: u64, dst: u8, imm: u64) -> u64 {
    ((op as u64) << 58) | (format << 56) | (imm << 3) | (u64::from(dst) & 0b111)
}

fn load(reg: u8, imm: u64) -> u64 {
    encode_reg_imm(Opcode::Load, 0, reg, imm & ((1 << 58) - 1))
}

fn halt() -> u64 {
    (Opcode::Halt as u64) << 58
}

#[test]
fn scenario_1_add_and_halt() {
    let mut manager = Manager::new();
    manager
        .load_instructions([
            load(0, 5),                        // LOAD ar, 5
            load(1, 7),                         // LOAD br, 7
            encode_reg_reg(Opcode::Add, 0, 1),  // ADD ar, br
            halt(),
        ])
        .unwrap();
    manager.start_execution().unwrap();
    assert_eq!(manager.cpu().regs().get(Register::Ar), 12);
    assert_eq!(manager.cpu().regs().get(Register::Br), 7);
    assert!(!manager.cpu().running());
}

#[test]
fn scenario_2_stack_round_trip() {
    let mut manager = Manager::new();
    manager
        .load_instructions([
            load(0, 0xAA),                          // LOAD ar, 0xAA
            load(1, 0xBB),                           // LOAD br, 0xBB
            (Opcode::Push as u64) << 58,
            encode_reg_reg(Opcode::Xor, 0, 0),        // XOR ar, ar
            encode_reg_reg(Opcode::Xor, 1, 1),        // XOR br, br
            (Opcode::Pop as u64) << 58,
            halt(),
        ])
        .unwrap();
    manager.start_execution().unwrap();
    assert_eq!(manager.cpu().regs().get(Register::Ar), 0xAA);
    assert_eq!(manager.cpu().regs().get(Register::Br), 0xBB);
}

#[test]
fn scenario_3_conditional_branch() {
    let mut manager = Manager::new();
    // 0: LOAD ar,3  1: LOAD br,3  2: CMP ar,br  3: JE  4: target=7
    // 5: LOAD cr,1  6: HALT       7: LOAD cr,2  8: HALT
    manager
        .load_instructions([
            load(0, 3),
            load(1, 3),
            encode_reg_reg(Opcode::Cmp, 0, 1),
            (Opcode::Je as u64) << 58,
            7u64,
            load(2, 1),
            halt(),
            load(2, 2),
            halt(),
        ])
        .unwrap();
    manager.start_execution().unwrap();
    assert_eq!(manager.cpu().regs().get(Register::Cr), 2);
}

#[test]
fn scenario_4_memory_big_endian() {
    let mut manager = Manager::new();
    manager.cpu_mut().data_memory_mut().write64(0x100, 0x0102030405060708).unwrap();
    assert_eq!(manager.cpu().data_memory().read8(0x100).unwrap(), 0x01);
    assert_eq!(manager.cpu().data_memory().read8(0x107).unwrap(), 0x08);
}

#[test]
fn scenario_5_tagged_movzx_load() {
    let mut manager = Manager::new();
    manager.cpu_mut().data_memory_mut().write8(0x200, 0xFF).unwrap();
    let addr = tagged_addr(1, 0x200);
    // LOAD cr with the low 58 bits of the tagged address (the width-1 tag sits in
    // bit 60, above the 58-bit LOAD immediate, so a two-word LEA is used instead).
    manager
        .load_instructions([
            (Opcode::Lea as u64) << 58,
            addr,
            // MOVZX format 3: dst=dr (reg_hi), src=cr (reg_lo) — but LEA always
            // targets `ar`, so move the address into cr first.
            encode_reg_reg(Opcode::Mov, 2, 0), // MOV cr, ar
            ((Opcode::Movzx as u64) << 58) | (3 << 56) | (3 << 3) | 2, // MOVZX dr, [cr]
            halt(),
        ])
        .unwrap();
    manager.start_execution().unwrap();
    assert_eq!(manager.cpu().regs().get(Register::Dr), 0x00000000000000FF);
}

#[test]
fn scenario_6_exit_syscall() {
    let mut manager = Manager::new();
    manager
        .load_instructions([
            load(0, 11),                     // LOAD ar, 11 (exit)
            load(1, 42),                      // LOAD br, 42
            (Opcode::Syscall as u64) << 58,
            halt(),                           // unreachable
        ])
        .unwrap();
    let outcome = manager.start_execution().unwrap();
    assert_eq!(outcome, ExitReason::Exited { code: 42 });
    assert_eq!(manager.cpu().regs().get(Register::Ar), 42);
    assert!(!manager.cpu().running());
}
