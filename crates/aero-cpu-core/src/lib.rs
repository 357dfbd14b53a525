//! x86 CPU core for 16- and 32-bit guests (i386 through Pentium).
//!
//! The crate is split along the path an instruction takes:
//! - [`decode`] turns guest bytes into an [`decode::Instruction`] with resolved
//!   operand modes and prefixes.
//! - [`interp`] holds the instruction semantics. Faults travel back as
//!   [`exceptions::Unwind`] values and are delivered at the instruction
//!   boundary by [`Cpu::execute_instruction`].
//! - [`backend`] decides how code is run: one instruction at a time, from a
//!   cache of decoded blocks, or through an external code generator.
//! - [`exec::ExecDispatcher`] owns the CPU and the backend and drives the
//!   per-boundary interrupt checks.
//!
//! Guest memory and port I/O live in `aero-mem`; the CPU owns its
//! [`aero_mem::MemoryBus`].

#![forbid(unsafe_code)]

pub mod backend;
pub mod config;
mod cpu;
pub mod decode;
pub mod descriptors;
pub mod exceptions;
pub mod exec;
pub mod interp;
pub mod interrupts;
mod mem;
mod operands;
pub mod paging;
mod segmentation;
pub mod state;

pub use config::{BackendKind, CpuConfig, CpuConfigError, CpuModel};
pub use cpu::Cpu;
pub use exceptions::{CpuException, CpuExit, Exception};
pub use exec::{ExecDispatcher, RunExit, StepOutcome};
pub use interp::InstructionOutcome;
