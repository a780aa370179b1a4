//! Engine configuration.
//!
//! Compile-time defaults, overridable at runtime through `EMB_*` environment
//! variables, further adjustable through builder-style setters.
//!
//! ```ignore
//! let config = EngineConfig::from_env()
//!     .port(8443)
//!     .worker_threads(8);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use emberio_core::env::{env_get, env_get_opt};

/// Library defaults. Environment variables win over these.
pub mod defaults {
    /// Listener bind address.
    pub const BIND_ADDR: &str = "0.0.0.0";
    /// Listener port.
    pub const PORT: u16 = 8080;
    /// listen(2) backlog.
    pub const BACKLOG: i32 = 1024;
    /// Idle-check period for connection timeouts, ms.
    pub const IDLE_GAP_MS: u64 = 20_000;
    /// Max idle period before the timeout callback may close, ms.
    pub const IDLE_MAX_MS: u64 = 30_000;
    /// Worker pool size.
    pub const WORKER_THREADS: usize = 4;
    /// Cross-thread injection queue capacity.
    pub const MAX_QUEUED_TASKS: usize = 16_384;
    /// Handle slab capacity per reactor.
    pub const MAX_HANDLES: usize = 65_536;
    /// Request slab capacity per reactor.
    pub const MAX_REQUESTS: usize = 65_536;
    /// Read request buffer size, bytes.
    pub const READ_BUF_SIZE: usize = 4 * 1024;
    /// Largest accepted message body, bytes.
    pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Listener bind address
    pub bind_addr: String,
    /// Listener port
    pub port: u16,
    /// listen(2) backlog
    pub backlog: i32,
    /// PEM certificate chain; TLS is enabled when both paths are set
    pub tls_cert: Option<PathBuf>,
    /// PEM private key
    pub tls_key: Option<PathBuf>,
    /// Idle-check period for handle timeouts
    pub idle_gap: Duration,
    /// Max idle period before close
    pub idle_max: Duration,
    /// Idle-timer repeats (-1 = until cancelled)
    pub idle_repeats: i32,
    /// Worker pool thread count
    pub worker_threads: usize,
    /// Cross-thread injection queue capacity
    pub max_queued_tasks: usize,
    /// Handle slab capacity
    pub max_handles: usize,
    /// Request slab capacity
    pub max_requests: usize,
    /// Read buffer size per read request
    pub read_buf_size: usize,
    /// Largest accepted message body
    pub max_body_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl EngineConfig {
    /// Defaults with environment overrides. Variables (all optional):
    /// `EMB_BIND`, `EMB_PORT`, `EMB_BACKLOG`, `EMB_TLS_CERT`, `EMB_TLS_KEY`,
    /// `EMB_IDLE_GAP_MS`, `EMB_IDLE_MAX_MS`, `EMB_WORKERS`, `EMB_MAX_TASKS`,
    /// `EMB_MAX_HANDLES`, `EMB_MAX_REQUESTS`, `EMB_READ_BUF`, `EMB_MAX_BODY`.
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_get("EMB_BIND", defaults::BIND_ADDR.to_string()),
            port: env_get("EMB_PORT", defaults::PORT),
            backlog: env_get("EMB_BACKLOG", defaults::BACKLOG),
            tls_cert: env_get_opt::<PathBuf>("EMB_TLS_CERT"),
            tls_key: env_get_opt::<PathBuf>("EMB_TLS_KEY"),
            idle_gap: Duration::from_millis(env_get("EMB_IDLE_GAP_MS", defaults::IDLE_GAP_MS)),
            idle_max: Duration::from_millis(env_get("EMB_IDLE_MAX_MS", defaults::IDLE_MAX_MS)),
            idle_repeats: -1,
            worker_threads: env_get("EMB_WORKERS", defaults::WORKER_THREADS),
            max_queued_tasks: env_get("EMB_MAX_TASKS", defaults::MAX_QUEUED_TASKS),
            max_handles: env_get("EMB_MAX_HANDLES", defaults::MAX_HANDLES),
            max_requests: env_get("EMB_MAX_REQUESTS", defaults::MAX_REQUESTS),
            read_buf_size: env_get("EMB_READ_BUF", defaults::READ_BUF_SIZE),
            max_body_size: env_get("EMB_MAX_BODY", defaults::MAX_BODY_SIZE),
        }
    }

    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n;
        self
    }

    pub fn max_handles(mut self, n: usize) -> Self {
        self.max_handles = n;
        self
    }

    pub fn max_requests(mut self, n: usize) -> Self {
        self.max_requests = n;
        self
    }

    pub fn max_body_size(mut self, n: usize) -> Self {
        self.max_body_size = n;
        self
    }

    pub fn idle_timeout(mut self, gap: Duration, max: Duration) -> Self {
        self.idle_gap = gap;
        self.idle_max = max;
        self
    }

    pub fn tls(mut self, cert: PathBuf, key: PathBuf) -> Self {
        self.tls_cert = Some(cert);
        self.tls_key = Some(key);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = EngineConfig::from_env();
        assert!(c.max_handles > 0);
        assert!(c.max_requests > 0);
        assert!(c.read_buf_size >= 1024);
        assert!(!c.tls_enabled());
    }

    #[test]
    fn builder_setters() {
        let c = EngineConfig::from_env()
            .port(9999)
            .worker_threads(2)
            .max_body_size(1024);
        assert_eq!(c.port, 9999);
        assert_eq!(c.worker_threads, 2);
        assert_eq!(c.max_body_size, 1024);
    }

    #[test]
    fn env_override() {
        std::env::set_var("EMB_BACKLOG", "77");
        let c = EngineConfig::from_env();
        assert_eq!(c.backlog, 77);
        std::env::remove_var("EMB_BACKLOG");
    }
}
