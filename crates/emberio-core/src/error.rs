//! Engine error types.
//!
//! Two conventions live side by side, matching how errors actually travel:
//!
//! - API calls return `Result<T, EngineError>`.
//! - Completion callbacks carry errors as data: `0` for success, a negative
//!   errno otherwise. [`CANCELED`] is the synthesized code delivered when a
//!   handle is closed with requests still outstanding.

use std::fmt;

/// Completion code for a request cancelled by handle close.
pub const CANCELED: i32 = -libc::ECANCELED;

/// Completion code helper: last OS errno, negated.
#[inline]
pub fn last_os_error() -> i32 {
    -std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

/// Returns true for errno values that mean "retry the syscall". Accepts
/// either sign, since syscall wrappers and completion codes differ.
#[inline]
pub fn is_transient(errno: i32) -> bool {
    let e = errno.abs();
    e == libc::EINTR || e == libc::EAGAIN || e == libc::EWOULDBLOCK
}

#[derive(Debug)]
pub enum EngineError {
    /// Resource pool is at capacity.
    PoolExhausted,
    /// Cross-thread injection queue is full.
    QueueFull,
    /// Operation on a handle that is not OPEN (or a stale id).
    HandleClosed,
    /// Reactor is already running (run() while RUNNING).
    ReactorBusy,
    /// epoll/eventfd setup failed at startup.
    ReactorSetup(i32),
    /// Fatal wait error aborted the reactor.
    ReactorWait(i32),
    /// Worker pool is stopped or was never started.
    WorkerUnavailable,
    /// Connector pool acquire timed out.
    AcquireTimeout,
    /// TLS configuration could not be loaded.
    TlsConfig(String),
    /// OS error with errno.
    Os(i32),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PoolExhausted => write!(f, "resource pool exhausted"),
            Self::QueueFull => write!(f, "injection queue full"),
            Self::HandleClosed => write!(f, "handle not open"),
            Self::ReactorBusy => write!(f, "reactor already running"),
            Self::ReactorSetup(e) => write!(f, "reactor setup: errno {}", e),
            Self::ReactorWait(e) => write!(f, "reactor wait: errno {}", e),
            Self::WorkerUnavailable => write!(f, "worker pool unavailable"),
            Self::AcquireTimeout => write!(f, "connector acquire timed out"),
            Self::TlsConfig(msg) => write!(f, "tls config: {}", msg),
            Self::Os(e) => write!(f, "OS error: errno {}", e),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        Self::Os(-e.raw_os_error().unwrap_or(libc::EIO))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
