//! Enigma VM: a register-based virtual machine executing a custom 64-bit
//! instruction set against an isolated byte-addressable memory.
//!
//! The three components are leaves-first: [`memory`] (bounds-checked,
//! growable byte storage), [`cpu`] (fetch/decode/execute over two memory
//! instances), and [`manager`] (program loading and syscall dispatch). `Cpu`
//! depends on nothing from `Manager` — syscalls are invoked through the
//! [`cpu::SyscallHandler`] capability rather than a direct dependency.

pub mod cpu;
pub mod error;
pub mod flags;
pub mod instruction;
pub mod manager;
pub mod memory;
pub mod registers;
pub mod syscalls;

pub use cpu::{Cpu, SyscallHandler};
pub use error::{Result, VmFault};
pub use manager::{ExitReason, Manager};
pub use memory::Memory;
