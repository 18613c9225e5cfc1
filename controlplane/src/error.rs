use core::fmt;

use flowplane_mem::MemError;
use flowplane_shm::ShmError;

/// Controlplane boundary errors. Higher layers (RPC) translate these; the
/// core never retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpError {
    OutOfMemory,
    NotFound,
    InvalidArgument,
    Exists,
    Stuck,
    Detached,
}

impl fmt::Display for CpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "zone arena exhausted, publication aborted"),
            Self::NotFound => write!(f, "unknown module type, module instance or pipeline"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::Exists => write!(f, "agent with this name and pid is already attached"),
            Self::Stuck => {
                write!(f, "published, but a worker missed the quiescence deadline")
            }
            Self::Detached => write!(f, "shared segment is gone or malformed"),
        }
    }
}

pub type CpResult<T = ()> = Result<T, CpError>;

impl From<ShmError> for CpError {
    fn from(e: ShmError) -> Self {
        match e {
            ShmError::InvalidArgument => CpError::InvalidArgument,
            ShmError::ZoneEmpty { .. } => CpError::NotFound,
            ShmError::OutOfMemory => CpError::OutOfMemory,
            ShmError::FileFailed { .. } | ShmError::MapFailed { .. } | ShmError::BadSegment => {
                CpError::Detached
            }
        }
    }
}

impl From<MemError> for CpError {
    fn from(e: MemError) -> Self {
        match e {
            MemError::OutOfMemory => CpError::OutOfMemory,
            MemError::InvalidSize { .. } => CpError::InvalidArgument,
        }
    }
}
