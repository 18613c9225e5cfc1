use core::fmt;

use flowplane_shm::ShmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpError {
    Segment(ShmError),
    NoSuchWorker { idx: u64 },
    WorkerBusy { idx: u64 },
    InvalidArgument,
}

impl fmt::Display for DpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Segment(e) => write!(f, "segment error: {e}"),
            Self::NoSuchWorker { idx } => write!(f, "no worker slot {idx}"),
            Self::WorkerBusy { idx } => write!(f, "worker slot {idx} is already claimed"),
            Self::InvalidArgument => write!(f, "invalid dataplane parameters"),
        }
    }
}

impl From<ShmError> for DpError {
    fn from(e: ShmError) -> Self {
        Self::Segment(e)
    }
}

pub type DpResult<T = ()> = Result<T, DpError>;
