use thiserror::Error;

use crate::state::EFlags;

/// CPU generation being emulated. Gates ISA extensions and the set of EFLAGS
/// bits software can change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CpuModel {
    I386,
    I486,
    Pentium,
}

impl CpuModel {
    /// EFLAGS bits that exist on this model. Bits outside the mask always read
    /// as their architectural default.
    pub fn supported_flags(self) -> EFlags {
        let base = EFlags::CF
            | EFlags::PF
            | EFlags::AF
            | EFlags::ZF
            | EFlags::SF
            | EFlags::TF
            | EFlags::IF
            | EFlags::DF
            | EFlags::OF
            | EFlags::IOPL
            | EFlags::NT
            | EFlags::RF
            | EFlags::VM;
        match self {
            CpuModel::I386 => base,
            CpuModel::I486 => base | EFlags::AC | EFlags::ID,
            CpuModel::Pentium => base | EFlags::AC | EFlags::VIF | EFlags::VIP | EFlags::ID,
        }
    }

    pub fn has_i486_instructions(self) -> bool {
        self >= CpuModel::I486
    }

    pub fn has_pentium_instructions(self) -> bool {
        self >= CpuModel::Pentium
    }

    /// Value reported in EAX for CPUID leaf 1 (family/model/stepping).
    pub fn cpuid_signature(self) -> u32 {
        match self {
            CpuModel::I386 => 0x0308,
            CpuModel::I486 => 0x0480,
            CpuModel::Pentium => 0x0543,
        }
    }
}

/// How the CPU turns guest code into work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Fetch, decode and execute one instruction at a time.
    Interpreter,
    /// Cache decoded blocks keyed by physical EIP and execution mode.
    CachedInterpreter,
    /// Cache blocks translated by an external code generator.
    Recompiler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuConfig {
    pub model: CpuModel,
    pub backend: BackendKind,
    /// Capacity of the code buffer used by the recompiler backend.
    pub code_buffer_size: usize,
    /// Upper bound on the number of instructions decoded into one block.
    pub max_block_instructions: usize,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            model: CpuModel::I486,
            backend: BackendKind::CachedInterpreter,
            code_buffer_size: 64 * 1024 * 1024,
            max_block_instructions: 512,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CpuConfigError {
    #[error("max_block_instructions must be at least 1")]
    EmptyBlocks,
    #[error("code buffer of {0} bytes cannot hold a single block")]
    CodeBufferTooSmall(usize),
    #[error("the recompiler backend needs a code generator")]
    MissingCodeGenerator,
    #[error("the memory bus already has a code invalidation callback")]
    BusAlreadyAttached,
}

impl CpuConfig {
    pub fn validate(&self) -> Result<(), CpuConfigError> {
        if self.max_block_instructions == 0 {
            return Err(CpuConfigError::EmptyBlocks);
        }
        // Room for at least one single-instruction block.
        if self.code_buffer_size < 128 + 64 {
            return Err(CpuConfigError::CodeBufferTooSmall(self.code_buffer_size));
        }
        Ok(())
    }
}
