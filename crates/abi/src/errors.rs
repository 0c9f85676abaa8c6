/// The error enumeration shared between the kernel and user-space.
///
/// Syscalls return a negative value numerically equal to one of these
/// variants on failure (see [`SysResult`]).
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorStatus {
    /// Use when nothing more precise is available and a new variant cannot be
    /// added
    Generic = 1,
    /// The operation exists but is not supported on this configuration (for
    /// example address-space clone on RISC-V)
    NotSupported = 2,
    InvalidSyscall = 3,

    // resource exhaustion
    OutOfMemory = 4,
    OutOfPorts = 5,
    OutOfInterruptVectors = 6,

    // invalid requests
    /// A user pointer or range is outside user-addressable space, null, or
    /// unaligned
    BadAddress = 7,
    InvalidArgument = 8,
    AlreadyExists = 9,
    NotFound = 0xA,
    /// The caller does not own the object it is operating on
    WrongOwner = 0xB,
    /// The destination port has been destroyed
    PortDead = 0xC,
    /// The right has been consumed or its port destroyed
    RightDead = 0xD,
    /// A name exceeds the fixed name-length limit
    NameTooLong = 0xE,

    // transient
    /// The caller was blocked and the syscall will be restarted
    Retry = 0xF,
    /// A wait was preempted by an IPI; retry
    Interrupted = 0x10,
    /// A deadline expired before the wait completed
    Timeout = 0x11,

    // fatal to the faulting task
    /// A user access fell outside every memory region
    PageNotAllocated = 0x12,
    BadInstruction = 0x13,
    InstructionUnavailable = 0x14,
}

impl ErrorStatus {
    // update when a new error is added
    const MAX: u16 = Self::InstructionUnavailable as u16;

    #[inline(always)]
    /// Gives a string description of the error
    pub fn as_str(&self) -> &'static str {
        use ErrorStatus::*;
        match self {
            Generic => "unknown error",
            NotSupported => "operation not supported",
            InvalidSyscall => "invalid syscall number",
            OutOfMemory => "out of memory",
            OutOfPorts => "out of port ids",
            OutOfInterruptVectors => "out of interrupt vectors",
            BadAddress => "bad user address",
            InvalidArgument => "invalid argument",
            AlreadyExists => "already exists",
            NotFound => "not found",
            WrongOwner => "wrong owner",
            PortDead => "port is dead",
            RightDead => "right is dead",
            NameTooLong => "name too long",
            Retry => "blocked, retry",
            Interrupted => "interrupted, retry",
            Timeout => "timed out",
            PageNotAllocated => "page not allocated",
            BadInstruction => "bad instruction",
            InstructionUnavailable => "instruction unavailable",
        }
    }
}

impl TryFrom<u16> for ErrorStatus {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        if value >= 1 && value <= Self::MAX {
            Ok(unsafe { core::mem::transmute(value) })
        } else {
            Err(())
        }
    }
}

/// The raw value a syscall hands back to user-space: zero or a positive
/// payload on success, `-(ErrorStatus as isize)` on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct SysResult(isize);

impl SysResult {
    pub const SUCCESS: Self = Self(0);

    #[inline(always)]
    pub const fn into_raw(self) -> isize {
        self.0
    }

    #[inline(always)]
    pub const fn from_raw(raw: isize) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub fn is_err(&self) -> bool {
        self.0 < 0
    }

    pub fn into_result(self) -> Result<usize, ErrorStatus> {
        if self.0 < 0 {
            Err(ErrorStatus::try_from((-self.0) as u16).unwrap_or(ErrorStatus::Generic))
        } else {
            Ok(self.0 as usize)
        }
    }
}

impl From<Result<(), ErrorStatus>> for SysResult {
    #[inline(always)]
    fn from(value: Result<(), ErrorStatus>) -> Self {
        match value {
            Ok(()) => Self::SUCCESS,
            Err(err) => Self(-(err as u16 as isize)),
        }
    }
}

impl From<Result<usize, ErrorStatus>> for SysResult {
    #[inline(always)]
    fn from(value: Result<usize, ErrorStatus>) -> Self {
        match value {
            Ok(v) => Self(v as isize),
            Err(err) => Self(-(err as u16 as isize)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_round_trip() {
        for raw in 1..=ErrorStatus::MAX {
            let err = ErrorStatus::try_from(raw).unwrap();
            assert_eq!(err as u16, raw);
            assert!(!err.as_str().is_empty());
        }
        assert!(ErrorStatus::try_from(0).is_err());
        assert!(ErrorStatus::try_from(ErrorStatus::MAX + 1).is_err());
    }

    #[test]
    fn sysresult_encoding() {
        let ok: SysResult = Ok(7usize).into();
        assert_eq!(ok.into_result(), Ok(7));

        let err: SysResult = Err::<usize, _>(ErrorStatus::PortDead).into();
        assert!(err.is_err());
        assert_eq!(err.into_result(), Err(ErrorStatus::PortDead));
        assert_eq!(err.into_raw(), -(ErrorStatus::PortDead as isize));
    }
}
