use std::{fmt, io};
use thiserror::Error;

/// What a failed kernel call most likely means for the queue that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    InvalidPointer,
    InvalidArgument,
    OutOfResources,
    Pending,
    Aborted,
    Other,
}

impl FaultKind {
    pub fn classify(code: i32) -> FaultKind {
        match code {
            libc::EFAULT => FaultKind::InvalidPointer,
            libc::EINVAL | libc::EBADF => FaultKind::InvalidArgument,
            libc::ENOBUFS | libc::ENOMEM | libc::EBUSY | libc::EAGAIN => FaultKind::OutOfResources,
            libc::EINPROGRESS | libc::EALREADY => FaultKind::Pending,
            libc::ECANCELED | libc::ECONNABORTED | libc::EINTR => FaultKind::Aborted,
            _ => FaultKind::Other,
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FaultKind::InvalidPointer => "invalid buffer pointer",
            FaultKind::InvalidArgument => "invalid argument or request queue corrupted",
            FaultKind::OutOfResources => "kernel out of resources",
            FaultKind::Pending => "operation still pending",
            FaultKind::Aborted => "operation aborted",
            FaultKind::Other => "i/o failure",
        })
    }
}

/// Every failure the registered-I/O layer can hand back to a consumer.
///
/// Anything coming out of a send or receive is fatal to the connection that
/// raised it: the caller logs, closes, and moves on.
#[derive(Debug, Error)]
pub enum IoFault {
    #[error("{kind} (errno {code})")]
    Kernel { code: i32, kind: FaultKind },
    #[error("buffer pool exhausted: all {capacity} segments are in use")]
    PoolExhausted { capacity: usize },
    #[error("send ring overrun: segment {slot} is still owned by the kernel")]
    SendRingOverrun { slot: usize },
    #[error("{outstanding} segments are still held, pool cannot be disposed")]
    SegmentsOutstanding { outstanding: usize },
    #[error("i/o failure: {0}")]
    Os(io::Error),
}

impl IoFault {
    /// Builds a fault from a positive errno value (or a negated CQE result).
    pub fn from_code(code: i32) -> IoFault {
        let code = code.abs();
        IoFault::Kernel {
            code,
            kind: FaultKind::classify(code),
        }
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            IoFault::Kernel { code, .. } => Some(*code),
            IoFault::Os(err) => err.raw_os_error(),
            _ => None,
        }
    }

    pub fn kind(&self) -> Option<FaultKind> {
        match self {
            IoFault::Kernel { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<io::Error> for IoFault {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => IoFault::from_code(code),
            None => IoFault::Os(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errno_values() {
        assert_eq!(FaultKind::classify(libc::EFAULT), FaultKind::InvalidPointer);
        assert_eq!(FaultKind::classify(libc::EINVAL), FaultKind::InvalidArgument);
        assert_eq!(FaultKind::classify(libc::ENOBUFS), FaultKind::OutOfResources);
        assert_eq!(FaultKind::classify(libc::EALREADY), FaultKind::Pending);
        assert_eq!(FaultKind::classify(libc::ECANCELED), FaultKind::Aborted);
        assert_eq!(FaultKind::classify(libc::ECONNRESET), FaultKind::Other);
    }

    #[test]
    fn negated_cqe_results_are_accepted() {
        let fault = IoFault::from_code(-libc::ECONNRESET);
        assert_eq!(fault.code(), Some(libc::ECONNRESET));
        assert_eq!(fault.kind(), Some(FaultKind::Other));
    }

    #[test]
    fn io_errors_keep_their_errno() {
        let fault = IoFault::from(io::Error::from_raw_os_error(libc::ENOMEM));
        assert_eq!(fault.kind(), Some(FaultKind::OutOfResources));
        let fault = IoFault::from(io::Error::other("no errno here"));
        assert!(matches!(fault, IoFault::Os(_)));
        assert_eq!(fault.code(), None);
    }

    #[test]
    fn display_carries_classification_and_code() {
        let text = IoFault::from_code(libc::EINVAL).to_string();
        assert!(text.contains("queue corrupted"));
        assert!(text.contains(&libc::EINVAL.to_string()));
    }
}
