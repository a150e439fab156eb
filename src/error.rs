//! Fatal conditions the VM can encounter.
//!
//! Every variant here corresponds to a condition the guest cannot observe or recover
//! from: a memory fault, a malformed syscall argument, or an undefined arithmetic
//! operation. Library code never calls `process::exit` or `panic!` for these — they
//! propagate as `Err(VmFault)` up to whatever host drives the VM.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VmFault {
    #[error("Segmentation fault: access to [{addr:#x}, {addr:#x} + {width}) exceeds pointer limit {pointer_limit:#x}")]
    SegmentationFault {
        addr: u64,
        width: u64,
        pointer_limit: u64,
    },

    #[error("pointer limit increase by {requested:#x} would exceed max_memory_length {max_memory_length:#x}")]
    PointerLimitExceeded { requested: u64, max_memory_length: u64 },

    #[error("max_memory_length increase by {requested:#x} would exceed the hard cap {cap:#x}")]
    MaxMemoryLengthExceeded { requested: u64, cap: u64 },

    #[error("resize to {requested:#x} exceeds max_memory_length {max_memory_length:#x}")]
    ResizeExceedsMax { requested: u64, max_memory_length: u64 },

    #[error("division by zero")]
    DivideByZero,

    #[error("shift amount {amount} is out of range (must be < 64)")]
    ShiftOverflow { amount: u64 },

    #[error("undefined opcode {opcode}")]
    UndefinedOpcode { opcode: u8 },

    #[error("malformed argument to syscall {syscall}: {detail}")]
    MalformedSyscall { syscall: u64, detail: &'static str },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VmFault>;
