//! Architectural exceptions and the unwind model used by the interpreter.
//!
//! Instruction semantics never deliver exceptions themselves. They return
//! [`Unwind::Fault`] through [`ExecResult`], and the per-instruction dispatch
//! boundary restores the faulting instruction's EIP/ESP and vectors through the
//! IVT/IDT.

/// Architecturally defined exception vectors.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exception {
    DivideError = 0,          // #DE
    Debug = 1,                // #DB
    NonMaskableInterrupt = 2, // NMI
    Breakpoint = 3,           // #BP
    Overflow = 4,             // #OF
    BoundRangeExceeded = 5,   // #BR
    InvalidOpcode = 6,        // #UD
    DeviceNotAvailable = 7,   // #NM
    DoubleFault = 8,          // #DF
    InvalidTss = 10,          // #TS
    SegmentNotPresent = 11,   // #NP
    StackFault = 12,          // #SS
    GeneralProtection = 13,   // #GP
    PageFault = 14,           // #PF
    X87Fpu = 16,              // #MF
    AlignmentCheck = 17,      // #AC
    MachineCheck = 18,        // #MC
}

impl Exception {
    #[inline]
    pub const fn vector(self) -> u8 {
        self as u8
    }

    /// Whether the CPU pushes an error code for this exception.
    #[inline]
    pub const fn pushes_error_code(self) -> bool {
        matches!(
            self,
            Exception::DoubleFault
                | Exception::InvalidTss
                | Exception::SegmentNotPresent
                | Exception::StackFault
                | Exception::GeneralProtection
                | Exception::PageFault
                | Exception::AlignmentCheck
        )
    }
}

/// A raised exception together with its error code (if the vector has one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuException {
    pub exception: Exception,
    pub error_code: Option<u32>,
}

impl CpuException {
    pub const fn new(exception: Exception) -> Self {
        Self {
            exception,
            error_code: None,
        }
    }

    pub const fn with_code(exception: Exception, error_code: u32) -> Self {
        Self {
            exception,
            error_code: Some(error_code),
        }
    }
}

/// Why an instruction stopped before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unwind {
    /// An architectural fault. The dispatcher rolls the instruction back and
    /// delivers the exception.
    Fault(CpuException),
    /// The instruction was abandoned and the CPU state is already consistent
    /// (for example after a shutdown). Dispatch restarts from the top.
    Abort,
}

impl From<CpuException> for Unwind {
    fn from(value: CpuException) -> Self {
        Unwind::Fault(value)
    }
}

pub type ExecResult<T> = Result<T, Unwind>;

/// Reasons the CPU stops executing without the embedder asking it to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuExit {
    /// An exception occurred while delivering a double fault. The CPU is in the
    /// shutdown state until reset.
    TripleFault,
}

#[inline]
pub(crate) fn fault<T>(exception: Exception) -> ExecResult<T> {
    Err(Unwind::Fault(CpuException::new(exception)))
}

#[inline]
pub(crate) fn fault_code<T>(exception: Exception, error_code: u32) -> ExecResult<T> {
    Err(Unwind::Fault(CpuException::with_code(exception, error_code)))
}

#[inline]
pub(crate) fn gp<T>(error_code: u32) -> ExecResult<T> {
    fault_code(Exception::GeneralProtection, error_code)
}

#[inline]
pub(crate) fn ud<T>() -> ExecResult<T> {
    fault(Exception::InvalidOpcode)
}
