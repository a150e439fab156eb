//! The host mediator: loads programs into memory, dispatches syscalls, and
//! drives the CPU to completion.
//!
//! `Manager` owns a `Cpu` and a separate `IoState` that implements
//! [`SyscallHandler`]; splitting the two by field lets `start_execution` hand
//! `&mut self.cpu` and `&mut self.io` to `Cpu::run` without a borrow conflict,
//! so `Cpu` never has to name `Manager`.

use std::collections::VecDeque;
use std::io::{self, BufRead, Read, Write};

use crate::cpu::{Cpu, SyscallHandler};
use crate::error::{Result, VmFault};
use crate::memory::map_mem;
use crate::registers::Register;
use crate::syscalls::{format_signed_num, pack_float, parse_decimal, parse_decimal_float, unpack_float};

/// Where data loaded with `load_data*` begins; `0x00..0x100` is reserved for the
/// stack.
pub const DATA_SEGMENT_START: u64 = 0x100;

/// Outcome of a completed run: either the VM halted on `HALT`, or the guest
/// called the exit syscall with a process-visible status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Halted,
    Exited { code: u8 },
}

/// The auxiliary I/O state a syscall needs beyond the CPU itself: the FIFO
/// buffer fed by read syscalls, the exit reason once one fires, and the
/// stdin/stdout handles.
pub struct IoState {
    io_buffer: VecDeque<u64>,
    exit: Option<ExitReason>,
}

impl IoState {
    fn new() -> Self {
        IoState {
            io_buffer: VecDeque::new(),
            exit: None,
        }
    }

    /// The FIFO of values produced so far by read-type syscalls.
    pub fn io_buffer(&self) -> &VecDeque<u64> {
        &self.io_buffer
    }

    fn read_line_trimmed(&mut self) -> Result<String> {
        let stdin = io::stdin();
        let mut line = String::new();
        stdin.lock().read_line(&mut line)?;
        Ok(line.trim().to_string())
    }
}

impl SyscallHandler for IoState {
    fn handle_syscall(&mut self, cpu: &mut Cpu) -> Result<()> {
        let call = cpu.regs().get(Register::Ar);
        log::info!("syscall {call} (br={:#x}, cr={:#x})", cpu.regs().get(Register::Br), cpu.regs().get(Register::Cr));
        match call {
            0 | 2 => {
                let bytes = cpu.regs().get(Register::Br);
                cpu.data_memory_mut().add_size(bytes)?;
                log::debug!("data memory pointer_limit grown by {bytes:#x}");
            }
            1 => {
                let bytes = cpu.regs().get(Register::Br);
                cpu.data_memory_mut().increase_upper_limit(bytes)?;
                log::debug!("data memory max_memory_length grown by {bytes:#x}");
            }
            3..=10 => {}
            11 => {
                let code = cpu.regs().get(Register::Br);
                cpu.regs_mut().set(Register::Ar, code);
                self.exit = Some(ExitReason::Exited { code: code as u8 });
                cpu.halt();
            }
            12 => {
                let addr = cpu.regs().get(Register::Br);
                let (width, offset) = map_mem(addr);
                let line = self.read_line_trimmed()?;
                let (_, value) = parse_decimal(&line);
                cpu.data_memory_mut().write_width(offset, width, value)?;
                self.io_buffer.push_back(value);
            }
            13 => {
                let addr = cpu.regs().get(Register::Br);
                let count = cpu.regs().get(Register::Cr);
                let (_, offset) = map_mem(addr);
                let mut buf = vec![0u8; count as usize];
                io::stdin().lock().read_exact(&mut buf)?;
                for (i, byte) in buf.iter().enumerate() {
                    cpu.data_memory_mut().write8(offset + i as u64, *byte as u64)?;
                }
            }
            14 => {
                let addr = cpu.regs().get(Register::Br);
                let (width, offset) = map_mem(addr);
                if width != 4 && width != 8 {
                    return Err(VmFault::MalformedSyscall {
                        syscall: call,
                        detail: "read_float requires a tagged address of width 4 or 8",
                    });
                }
                let line = self.read_line_trimmed()?;
                let (integer, fraction) = parse_decimal_float(&line);
                let packed = pack_float(width, integer, fraction);
                cpu.data_memory_mut().write_width(offset, width, packed)?;
            }
            15 => {
                let addr = cpu.regs().get(Register::Br);
                let (width, offset) = map_mem(addr);
                let value = cpu.data_memory().read_width(offset, width)?;
                print!("{}", format_signed_num(width, value));
                io::stdout().flush()?;
            }
            16 => {
                let addr = cpu.regs().get(Register::Br);
                let count = cpu.regs().get(Register::Cr);
                let (_, offset) = map_mem(addr);
                let mut out = io::stdout();
                for i in 0..count {
                    let byte = cpu.data_memory().read8(offset + i)?;
                    out.write_all(&[byte as u8])?;
                }
                out.flush()?;
            }
            17 => {
                let addr = cpu.regs().get(Register::Br);
                let (width, offset) = map_mem(addr);
                if width != 4 && width != 8 {
                    return Err(VmFault::MalformedSyscall {
                        syscall: call,
                        detail: "write_float requires a tagged address of width 4 or 8",
                    });
                }
                let packed = cpu.data_memory().read_width(offset, width)?;
                let (integer, fraction) = unpack_float(width, packed);
                print!("{integer}.{fraction}");
                io::stdout().flush()?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Owns the `Cpu`, the syscall-facing I/O state, and the data-memory write
/// cursor used while loading.
pub struct Manager {
    cpu: Cpu,
    io: IoState,
    instr_cursor: u64,
    data_cursor: u64,
}

impl Manager {
    pub fn new() -> Self {
        let mut cpu = Cpu::new();
        cpu.regs_mut().set(Register::Sp, 0);
        cpu.regs_mut().set(Register::Pc, 0);
        Manager {
            cpu,
            io: IoState::new(),
            instr_cursor: 0,
            data_cursor: DATA_SEGMENT_START,
        }
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Cpu {
        &mut self.cpu
    }

    pub fn io(&self) -> &IoState {
        &self.io
    }

    /// Appends a sequence of 64-bit instruction words starting at the current
    /// write cursor, growing instruction memory as needed.
    pub fn load_instructions<I: IntoIterator<Item = u64>>(&mut self, words: I) -> Result<()> {
        for word in words {
            self.cpu.instruction_memory_mut().ensure_capacity(self.instr_cursor + 8)?;
            self.cpu.instruction_memory_mut().write64(self.instr_cursor, word)?;
            self.instr_cursor += 8;
        }
        Ok(())
    }

    pub fn load_data64<I: IntoIterator<Item = u64>>(&mut self, values: I) -> Result<()> {
        self.load_data_width(8, values)
    }

    pub fn load_data32<I: IntoIterator<Item = u64>>(&mut self, values: I) -> Result<()> {
        self.load_data_width(4, values)
    }

    pub fn load_data16<I: IntoIterator<Item = u64>>(&mut self, values: I) -> Result<()> {
        self.load_data_width(2, values)
    }

    pub fn load_data8<I: IntoIterator<Item = u64>>(&mut self, values: I) -> Result<()> {
        self.load_data_width(1, values)
    }

    fn load_data_width<I: IntoIterator<Item = u64>>(&mut self, width: u8, values: I) -> Result<()> {
        for value in values {
            self.cpu.data_memory_mut().ensure_capacity(self.data_cursor + u64::from(width))?;
            self.cpu.data_memory_mut().write_width(self.data_cursor, width, value)?;
            self.data_cursor += u64::from(width);
        }
        Ok(())
    }

    /// Runs the CPU to completion and reports why it stopped.
    pub fn start_execution(&mut self) -> Result<ExitReason> {
        let Manager { cpu, io, .. } = self;
        cpu.run(io)?;
        Ok(io.exit.unwrap_or(ExitReason::Halted))
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}
