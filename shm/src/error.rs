use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmError {
    InvalidArgument,
    FileFailed { errno: i32 },
    MapFailed { errno: i32 },
    BadSegment,
    ZoneEmpty { numa_idx: u32 },
    OutOfMemory,
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid segment parameters"),
            Self::FileFailed { errno } => write!(f, "segment file operation failed (errno {errno})"),
            Self::MapFailed { errno } => write!(f, "mmap failed (errno {errno})"),
            Self::BadSegment => write!(f, "segment header is malformed or truncated"),
            Self::ZoneEmpty { numa_idx } => write!(f, "zone {numa_idx} is not populated"),
            Self::OutOfMemory => write!(f, "zone arena exhausted during initialisation"),
        }
    }
}

pub type ShmResult<T = ()> = Result<T, ShmError>;
