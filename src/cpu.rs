//! The fetch-decode-execute loop.
//!
//! `Cpu` owns both memory instances and knows nothing about `Manager` — syscalls
//! are dispatched through the [`SyscallHandler`] capability passed into [`Cpu::run`],
//! which is how the CPU/Manager dependency cycle in the original source is broken.

use crate::error::{Result, VmFault};
use crate::flags::{Flag, FlagSet};
use crate::instruction::{format1, format2, imm53, imm58, opcode_bits, reg_hi, reg_lo, Opcode};
use crate::memory::{map_mem, Memory};
use crate::registers::{Register, RegisterFile, GENERAL_REGISTERS};

/// Invoked by the CPU on `SYSCALL`. Implemented by `Manager`'s I/O state so the
/// CPU module never has to name `Manager`.
pub trait SyscallHandler {
    fn handle_syscall(&mut self, cpu: &mut Cpu) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MovKind {
    Plain,
    Zx,
    Sx,
}

#[derive(Debug)]
pub struct Cpu {
    regs: RegisterFile,
    flags: FlagSet,
    running: bool,
    instruction_memory: Memory,
    data_memory: Memory,
}

impl Cpu {
    pub fn new() -> Self {
        Cpu {
            regs: RegisterFile::new(),
            flags: FlagSet::new(),
            running: true,
            instruction_memory: Memory::new(),
            data_memory: Memory::new(),
        }
    }

    pub fn running(&self) -> bool {
        self.running
    }

    /// Stops the run loop after the current syscall returns, as the exit syscall
    /// does.
    pub fn halt(&mut self) {
        self.running = false;
    }

    pub fn regs(&self) -> &RegisterFile {
        &self.regs
    }

    pub fn regs_mut(&mut self) -> &mut RegisterFile {
        &mut self.regs
    }

    pub fn instruction_memory(&self) -> &Memory {
        &self.instruction_memory
    }

    pub fn instruction_memory_mut(&mut self) -> &mut Memory {
        &mut self.instruction_memory
    }

    pub fn data_memory(&self) -> &Memory {
        &self.data_memory
    }

    pub fn data_memory_mut(&mut self) -> &mut Memory {
        &mut self.data_memory
    }

    /// Runs until `running` becomes false or a fault occurs.
    pub fn run(&mut self, handler: &mut dyn SyscallHandler) -> Result<()> {
        while self.running {
            self.step(handler)?;
        }
        Ok(())
    }

    fn step(&mut self, handler: &mut dyn SyscallHandler) -> Result<()> {
        let pc = self.regs.get(Register::Pc);
        let instr = self.instruction_memory.read64(instr_byte_addr(pc))?;
        let op = Opcode::try_from(opcode_bits(instr))?;
        log::trace!("pc={pc:#x} opcode={op:?}");

        let mut jumped = false;
        self.execute(op, instr, handler, &mut jumped)?;

        if !jumped {
            let pc = self.regs.get(Register::Pc);
            self.regs.set(Register::Pc, pc.wrapping_add(1));
        }
        Ok(())
    }

    /// Advances `pc` by one and fetches the word now pointed at. Used by every
    /// opcode whose encoding spans two instruction words.
    fn fetch_next_word(&mut self) -> Result<u64> {
        let pc = self.regs.get(Register::Pc).wrapping_add(1);
        self.regs.set(Register::Pc, pc);
        self.instruction_memory.read64(instr_byte_addr(pc))
    }

    /// Resolves `(dst, lhs, rhs)` for the arithmetic opcodes: format 0 is
    /// register-register, 1/2 are register-immediate, 3 reads a tagged address
    /// from a trailing instruction word.
    fn arith_operands(&mut self, instr: u64) -> Result<(Register, u64, u64)> {
        match format2(instr) {
            0 => {
                let dst = Register::from_operand(reg_hi(instr));
                let src = Register::from_operand(reg_lo(instr));
                Ok((dst, self.regs.get(dst), self.regs.get(src)))
            }
            3 => {
                let dst = Register::from_operand(reg_lo(instr));
                let addr = self.fetch_next_word()?;
                let (width, offset) = map_mem(addr);
                let rhs = self.data_memory.read_width(offset, width)?;
                Ok((dst, self.regs.get(dst), rhs))
            }
            _ => {
                let dst = Register::from_operand(reg_lo(instr));
                Ok((dst, self.regs.get(dst), imm53(instr)))
            }
        }
    }

    /// Resolves `(dst, lhs, rhs)` for the one-format-bit opcodes (`AND`/`OR`/`XOR`
    /// and the shifts): bit 0 is register-register, bit 1 is register-immediate.
    fn binary_operands_1bit(&self, instr: u64) -> (Register, u64, u64) {
        match format1(instr) {
            0 => {
                let dst = Register::from_operand(reg_hi(instr));
                let src = Register::from_operand(reg_lo(instr));
                (dst, self.regs.get(dst), self.regs.get(src))
            }
            _ => {
                let dst = Register::from_operand(reg_lo(instr));
                (dst, self.regs.get(dst), imm53(instr))
            }
        }
    }

    fn exec_mov(&mut self, instr: u64, kind: MovKind) -> Result<()> {
        match format2(instr) {
            3 => {
                let dst = Register::from_operand(reg_hi(instr));
                let addr_reg = Register::from_operand(reg_lo(instr));
                let addr = self.regs.get(addr_reg);
                let (width, offset) = map_mem(addr);
                let raw = self.data_memory.read_width(offset, width)?;
                let value = match kind {
                    MovKind::Sx => sign_extend(raw, width),
                    MovKind::Zx | MovKind::Plain => raw,
                };
                self.regs.set(dst, value);
            }
            1 => {
                let dst = Register::from_operand(reg_lo(instr));
                self.regs.set(dst, imm53(instr));
            }
            _ => {
                let dst = Register::from_operand(reg_hi(instr));
                let src = Register::from_operand(reg_lo(instr));
                self.regs.set(dst, self.regs.get(src));
            }
        }
        Ok(())
    }

    fn exec_store(&mut self, instr: u64) -> Result<()> {
        let src = Register::from_operand(reg_lo(instr));
        let addr = self.fetch_next_word()?;
        let (width, offset) = map_mem(addr);
        let value = self.regs.get(src);
        self.data_memory.write_width(offset, width, value)
    }

    fn exec_lea(&mut self) -> Result<()> {
        let literal = self.fetch_next_word()?;
        self.regs.set(Register::Ar, literal);
        Ok(())
    }

    fn exec_push(&mut self) -> Result<()> {
        for reg in GENERAL_REGISTERS {
            let sp = self.regs.get(Register::Sp);
            let value = self.regs.get(reg);
            self.data_memory.write64(sp, value)?;
            self.regs.set(Register::Sp, sp + 8);
        }
        Ok(())
    }

    fn exec_pop(&mut self) -> Result<()> {
        for reg in GENERAL_REGISTERS.iter().rev() {
            let sp = self.regs.get(Register::Sp) - 8;
            let value = self.data_memory.read64(sp)?;
            self.regs.set(Register::Sp, sp);
            self.regs.set(*reg, value);
        }
        Ok(())
    }

    fn exec_cmp(&mut self, instr: u64) {
        let reg2 = self.regs.get(Register::from_operand(reg_hi(instr)));
        let reg1 = self.regs.get(Register::from_operand(reg_lo(instr)));
        self.flags.compare(reg2, reg1);
    }

    fn exec_cond_jump(&mut self, taken: bool, jumped: &mut bool) -> Result<()> {
        let target = self.fetch_next_word()?;
        if taken {
            self.regs.set(Register::Pc, target);
            *jumped = true;
        }
        Ok(())
    }

    fn exec_cond_move(&mut self, instr: u64, taken: bool) -> Result<()> {
        if taken {
            self.exec_mov(instr, MovKind::Plain)?;
        }
        Ok(())
    }

    fn exec_ext(&mut self, instr: u64, signed: bool) {
        let reg = Register::from_operand(reg_lo(instr));
        let width = width_class(format2(instr));
        let raw = self.regs.get(reg);
        let truncated = truncate_to_width(raw, width);
        let value = if signed {
            sign_extend(truncated, width)
        } else {
            truncated
        };
        self.regs.set(reg, value);
    }

    fn execute(
        &mut self,
        op: Opcode,
        instr: u64,
        handler: &mut dyn SyscallHandler,
        jumped: &mut bool,
    ) -> Result<()> {
        use Opcode::*;
        match op {
            Nop => {}
            Add => {
                let (dst, a, b) = self.arith_operands(instr)?;
                self.regs.set(dst, a.wrapping_add(b));
            }
            Sub => {
                let (dst, a, b) = self.arith_operands(instr)?;
                self.regs.set(dst, a.wrapping_sub(b));
            }
            Mul => {
                let (dst, a, b) = self.arith_operands(instr)?;
                self.regs.set(dst, a.wrapping_mul(b));
            }
            Div => {
                let (dst, a, b) = self.arith_operands(instr)?;
                if b == 0 {
                    return Err(VmFault::DivideByZero);
                }
                self.regs.set(dst, a / b);
            }
            Inc => {
                let r = Register::from_operand(reg_lo(instr));
                let v = self.regs.get(r);
                self.regs.set(r, v.wrapping_add(1));
            }
            Dec => {
                let r = Register::from_operand(reg_lo(instr));
                let v = self.regs.get(r);
                self.regs.set(r, v.wrapping_sub(1));
            }
            Neg => {
                let r = Register::from_operand(reg_lo(instr));
                let v = self.regs.get(r);
                self.regs.set(r, (!v).wrapping_add(1));
            }
            And => {
                let (dst, a, b) = self.binary_operands_1bit(instr);
                self.regs.set(dst, a & b);
            }
            Not => {
                let r = Register::from_operand(reg_lo(instr));
                let v = self.regs.get(r);
                self.regs.set(r, !v);
            }
            Or => {
                let (dst, a, b) = self.binary_operands_1bit(instr);
                self.regs.set(dst, a | b);
            }
            Xor => {
                let (dst, a, b) = self.binary_operands_1bit(instr);
                self.regs.set(dst, a ^ b);
            }
            Lshift => {
                let (dst, val, amount) = self.binary_operands_1bit(instr);
                if amount >= 64 {
                    return Err(VmFault::ShiftOverflow { amount });
                }
                self.regs.set(dst, val << amount);
            }
            Rshift => {
                let (dst, val, amount) = self.binary_operands_1bit(instr);
                if amount >= 64 {
                    return Err(VmFault::ShiftOverflow { amount });
                }
                self.regs.set(dst, val >> amount);
            }
            Mov => self.exec_mov(instr, MovKind::Plain)?,
            Movzx => self.exec_mov(instr, MovKind::Zx)?,
            Movsx => self.exec_mov(instr, MovKind::Sx)?,
            Store => self.exec_store(instr)?,
            Load => {
                let r = Register::from_operand(reg_lo(instr));
                self.regs.set(r, imm58(instr));
            }
            Lea => self.exec_lea()?,
            Push => self.exec_push()?,
            Pop => self.exec_pop()?,
            PushReg => {
                let r = Register::from_operand(reg_lo(instr));
                let sp = self.regs.get(Register::Sp);
                let value = self.regs.get(r);
                self.data_memory.write64(sp, value)?;
                self.regs.set(Register::Sp, sp + 8);
            }
            PopReg => {
                let r = Register::from_operand(reg_lo(instr));
                let sp = self.regs.get(Register::Sp) - 8;
                let value = self.data_memory.read64(sp)?;
                self.regs.set(Register::Sp, sp);
                self.regs.set(r, value);
            }
            Cmp => self.exec_cmp(instr),
            Jmp => {
                let target = self.fetch_next_word()?;
                self.regs.set(Register::Pc, target);
                *jumped = true;
            }
            Jz => {
                let cond = self.flags.get(Flag::Zero);
                self.exec_cond_jump(cond, jumped)?;
            }
            Jnz => {
                let cond = self.flags.get(Flag::Nonzero);
                self.exec_cond_jump(cond, jumped)?;
            }
            Jn => self.exec_cond_jump(false, jumped)?,
            Jnn => self.exec_cond_jump(false, jumped)?,
            Je => {
                let cond = self.flags.get(Flag::Equal);
                self.exec_cond_jump(cond, jumped)?;
            }
            Jne => {
                let cond = self.flags.get(Flag::NotEq);
                self.exec_cond_jump(cond, jumped)?;
            }
            Jg => {
                let cond = self.flags.get(Flag::Greater);
                self.exec_cond_jump(cond, jumped)?;
            }
            Jge => {
                let cond = self.flags.get(Flag::GreaterEq);
                self.exec_cond_jump(cond, jumped)?;
            }
            Js => {
                let cond = self.flags.get(Flag::Smaller);
                self.exec_cond_jump(cond, jumped)?;
            }
            Jse => {
                let cond = self.flags.get(Flag::SmallerEq);
                self.exec_cond_jump(cond, jumped)?;
            }
            Movz => {
                let cond = self.flags.get(Flag::Zero);
                self.exec_cond_move(instr, cond)?;
            }
            Movnz => {
                let cond = self.flags.get(Flag::Nonzero);
                self.exec_cond_move(instr, cond)?;
            }
            Movn => self.exec_cond_move(instr, false)?,
            Movnn => self.exec_cond_move(instr, false)?,
            Move => {
                let cond = self.flags.get(Flag::Equal);
                self.exec_cond_move(instr, cond)?;
            }
            Movne => {
                let cond = self.flags.get(Flag::NotEq);
                self.exec_cond_move(instr, cond)?;
            }
            Movg => {
                let cond = self.flags.get(Flag::Greater);
                self.exec_cond_move(instr, cond)?;
            }
            Movge => {
                let cond = self.flags.get(Flag::GreaterEq);
                self.exec_cond_move(instr, cond)?;
            }
            Movs => {
                let cond = self.flags.get(Flag::Smaller);
                self.exec_cond_move(instr, cond)?;
            }
            Movse => {
                let cond = self.flags.get(Flag::SmallerEq) || self.flags.get(Flag::Smaller);
                self.exec_cond_move(instr, cond)?;
            }
            Ext => self.exec_ext(instr, true),
            Zext => self.exec_ext(instr, false),
            Halt => self.running = false,
            Syscall => handler.handle_syscall(self)?,
        }
        Ok(())
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

/// `pc` counts instruction words, not bytes — it is the unit `JMP` targets and
/// the `pc += 1` of the main loop are expressed in. Instruction memory is
/// still a byte-addressed `Memory` like data memory (loaded 8 bytes per
/// word), so every fetch scales `pc` by the word size to get a byte address.
const fn instr_byte_addr(pc: u64) -> u64 {
    pc.wrapping_mul(8)
}

fn width_class(format: u8) -> u8 {
    match format {
        0 => 1,
        1 => 2,
        2 => 4,
        _ => 8,
    }
}

fn truncate_to_width(value: u64, width: u8) -> u64 {
    match width {
        1 => value & 0xFF,
        2 => value & 0xFFFF,
        4 => value & 0xFFFF_FFFF,
        _ => value,
    }
}

/// Sign-extends the low `width` bytes of `value` to a full 64 bits.
fn sign_extend(value: u64, width: u8) -> u64 {
    let bits = u32::from(width) * 8;
    if bits >= 64 {
        return value;
    }
    let shift = 64 - bits;
    (((value << shift) as i64) >> shift) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Opcode;

    struct NoSyscalls;
    impl SyscallHandler for NoSyscalls {
        fn handle_syscall(&mut self, _cpu: &mut Cpu) -> Result<()> {
            Ok(())
        }
    }

    fn encode_reg_reg(op: Opcode, dst: u8, src: u8) -> u64 {
        ((op as u64) << 58) | ((u64::from(dst) & 0b111) << 3) | (u64::from(src) & 0b111)
    }

    fn encode_reg_imm(op: Opcode, format: u64, dst: u8, imm: u64) -> u64 {
        ((op as u64) << 58) | (format << 56) | (imm << 3) | (u64::from(dst) & 0b111)
    }

    fn load(reg: u8, imm: u64) -> u64 {
        encode_reg_imm(Opcode::Load, 0, reg, imm & ((1 << 58) - 1))
    }

    #[test]
    fn add_and_halt_scenario() {
        let program = [
            load(0, 5),                          // LOAD ar, 5
            load(1, 7),                          // LOAD br, 7
            encode_reg_reg(Opcode::Add, 0, 1),   // ADD ar, br
            (Opcode::Halt as u64) << 58,
        ];
        let mut cpu = Cpu::new();
        for (i, word) in program.iter().enumerate() {
            cpu.instruction_memory_mut().write64((i as u64) * 8, *word).unwrap();
        }
        cpu.instruction_memory_mut().ensure_capacity(program.len() as u64 * 8).unwrap();
        let mut handler = NoSyscalls;
        cpu.run(&mut handler).unwrap();
        assert_eq!(cpu.regs().get(Register::Ar), 12);
        assert_eq!(cpu.regs().get(Register::Br), 7);
        assert!(!cpu.running());
    }

    #[test]
    fn cmp_both_zero_sets_zero_flag() {
        let mut cpu = Cpu::new();
        cpu.exec_cmp(encode_reg_reg(Opcode::Cmp, 0, 1));
        assert!(cpu.flags.get(Flag::Zero));
    }

    #[test]
    fn shift_mnemonics_match_direction() {
        let mut cpu = Cpu::new();
        cpu.regs.set(Register::Ar, 1);
        let instr = encode_reg_imm(Opcode::Lshift, 1, 0, 4);
        let mut jumped = false;
        let mut handler = NoSyscalls;
        cpu.execute(Opcode::Lshift, instr, &mut handler, &mut jumped).unwrap();
        assert_eq!(cpu.regs().get(Register::Ar), 16);
    }

    #[test]
    fn shift_overflow_is_fatal() {
        let mut cpu = Cpu::new();
        let instr = encode_reg_imm(Opcode::Lshift, 1, 0, 64);
        let mut jumped = false;
        let mut handler = NoSyscalls;
        assert!(cpu.execute(Opcode::Lshift, instr, &mut handler, &mut jumped).is_err());
    }

    #[test]
    fn sign_extend_from_byte() {
        assert_eq!(sign_extend(0xFF, 1), u64::MAX);
        assert_eq!(sign_extend(0x7F, 1), 0x7F);
    }
}
