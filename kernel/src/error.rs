//! Error types for the Matrix kernel core
//!
//! Recoverable failures are modelled as [`KernelError`] values and unwind
//! locally with `?`; every early return on the VFS lookup/create paths
//! releases the references it acquired first. Corruption-class failures
//! (heap magic mismatch, ref-count underflow, run-queue bitmap divergence)
//! are contract violations and panic instead of returning.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Memory-related errors
    MmError(MmError),

    /// Scheduler-related errors
    SchedError(SchedError),

    /// Filesystem-related errors
    FsError(FsError),

    /// A caller handed in something nonsensical
    InvalidArgument {
        what: &'static str,
    },

    /// Operation absent from the relevant ops vtable
    NotSupported {
        operation: &'static str,
    },
}

/// Memory subsystem errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    /// Pool or slab exhausted and unable to grow
    OutOfMemory,
    /// Growth would push the pool past its maximum address
    PoolLimit,
    /// The page mapper refused a mapping
    MapFailed,
    /// Address not mapped
    NotMapped,
}

/// Scheduler errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// No thread with that id
    ThreadNotFound,
    /// No process with that id
    ProcessNotFound,
    /// Thread is not in the state the operation requires
    InvalidState,
    /// CPU id outside the configured table
    NoSuchCpu,
    /// No such timer pending on this CPU
    TimerNotFound,
}

/// Filesystem errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Path resolution failed at some component
    NotFound,
    /// Path traverses a non-directory
    NotADirectory,
    /// Node is not a regular file
    NotAFile,
    /// Mount on an existing mount root, or name collision
    AlreadyExists,
    /// Unmount/unregister with live references
    Busy,
    /// No root filesystem mounted yet
    NoRootMount,
    /// Filesystem type not registered
    UnknownType,
    /// Filesystem rejected the operation because it is read-only
    ReadOnly,
    /// On-media/image structure failed validation
    BadImage,
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl From<MmError> for KernelError {
    fn from(err: MmError) -> Self {
        KernelError::MmError(err)
    }
}

impl From<SchedError> for KernelError {
    fn from(err: SchedError) -> Self {
        KernelError::SchedError(err)
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        KernelError::FsError(err)
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::MmError(e) => write!(f, "memory error: {}", e),
            KernelError::SchedError(e) => write!(f, "scheduler error: {}", e),
            KernelError::FsError(e) => write!(f, "filesystem error: {}", e),
            KernelError::InvalidArgument { what } => {
                write!(f, "invalid argument: {}", what)
            }
            KernelError::NotSupported { operation } => {
                write!(f, "operation not supported: {}", operation)
            }
        }
    }
}

impl fmt::Display for MmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            MmError::OutOfMemory => "out of memory",
            MmError::PoolLimit => "pool maximum exceeded",
            MmError::MapFailed => "page mapping failed",
            MmError::NotMapped => "address not mapped",
        };
        f.write_str(msg)
    }
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            SchedError::ThreadNotFound => "thread not found",
            SchedError::ProcessNotFound => "process not found",
            SchedError::InvalidState => "invalid thread state",
            SchedError::NoSuchCpu => "no such cpu",
            SchedError::TimerNotFound => "timer not found",
        };
        f.write_str(msg)
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FsError::NotFound => "no such file or directory",
            FsError::NotADirectory => "not a directory",
            FsError::NotAFile => "not a regular file",
            FsError::AlreadyExists => "already exists",
            FsError::Busy => "resource busy",
            FsError::NoRootMount => "root filesystem not mounted",
            FsError::UnknownType => "unknown filesystem type",
            FsError::ReadOnly => "filesystem is read-only",
            FsError::BadImage => "malformed filesystem image",
        };
        f.write_str(msg)
    }
}
