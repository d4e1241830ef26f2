//! Error and status codes surfaced at the thread-management boundary.

use thiserror::Error;

/// Failure of a monitor or thread operation.
///
/// Interruption and timeouts are not errors; blocking calls report them through
/// [`WaitResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ThreadError {
    #[error("current thread is not the owner of the monitor")]
    IllegalMonitorState,
    #[error("monitor handle does not resolve to a live monitor")]
    InvalidMonitor,
    #[error("out of memory while allocating a monitor")]
    OutOfMemory,
    #[error("internal error: {0}")]
    InternalError(&'static str),
}

/// How a blocking wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitResult {
    /// Notified, unparked or otherwise woken by its counterpart operation.
    Woken,
    Interrupted,
    TimedOut,
}

impl WaitResult {
    pub fn is_woken(&self) -> bool {
        matches!(self, Self::Woken)
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }

    pub fn timed_out(&self) -> bool {
        matches!(self, Self::TimedOut)
    }
}

/// Plain status codes for collaborators that do not speak `Result`
/// (e.g. the debugging agent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    Interrupted = 1,
    TimedOut = 2,
    IllegalMonitorState = 3,
    InvalidMonitor = 4,
    OutOfMemory = 5,
    InternalError = 6,
}

impl Status {
    pub fn is_ok(&self) -> bool {
        *self == Status::Ok
    }

    pub fn code(&self) -> i32 {
        *self as i32
    }
}

impl From<ThreadError> for Status {
    fn from(value: ThreadError) -> Self {
        match value {
            ThreadError::IllegalMonitorState => Status::IllegalMonitorState,
            ThreadError::InvalidMonitor => Status::InvalidMonitor,
            ThreadError::OutOfMemory => Status::OutOfMemory,
            ThreadError::InternalError(_) => Status::InternalError,
        }
    }
}

impl From<WaitResult> for Status {
    fn from(value: WaitResult) -> Self {
        match value {
            WaitResult::Woken => Status::Ok,
            WaitResult::Interrupted => Status::Interrupted,
            WaitResult::TimedOut => Status::TimedOut,
        }
    }
}

impl From<Result<(), ThreadError>> for Status {
    fn from(value: Result<(), ThreadError>) -> Self {
        match value {
            Ok(()) => Status::Ok,
            Err(err) => err.into(),
        }
    }
}

impl From<Result<WaitResult, ThreadError>> for Status {
    fn from(value: Result<WaitResult, ThreadError>) -> Self {
        match value {
            Ok(res) => res.into(),
            Err(err) => err.into(),
        }
    }
}

/// Log and abort. Used where continuing would silently break mutual exclusion.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!(target: "vmkit::threads", $($arg)*);
        std::process::abort()
    }};
}

pub(crate) use fatal;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_from_results() {
        assert_eq!(Status::from(Ok(())), Status::Ok);
        assert_eq!(
            Status::from(Err::<(), _>(ThreadError::InvalidMonitor)),
            Status::InvalidMonitor
        );
        assert_eq!(
            Status::from(Ok::<_, ThreadError>(WaitResult::TimedOut)),
            Status::TimedOut
        );
        assert_eq!(Status::from(ThreadError::InternalError("x")).code(), 6);
    }
}
