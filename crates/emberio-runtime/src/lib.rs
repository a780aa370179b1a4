//! # emberio-runtime — the event engine
//!
//! One [`Reactor`] per thread owns an epoll instance and a slab of
//! [`HandleId`]-addressed I/O resources. Asynchronous operations are
//! submitted as requests against a handle and complete exactly once through
//! an owned callback: normally, with an OS error, or with a synthesized
//! cancellation when the handle is closed first.
//!
//! Blocking or CPU-bound work goes to the [`WorkerPool`]; results come back
//! to the reactor thread through [`ReactorWaker::post`], the only
//! cross-thread door into a reactor.

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod addr;
        pub mod config;
        pub mod handle;
        pub mod reactor;
        pub mod request;
        pub mod socket;
        pub mod timer;
        pub mod tls;
        pub mod worker_pool;

        pub use addr::NetAddress;
        pub use config::EngineConfig;
        pub use handle::{HandleId, HandleState, TimeoutAction};
        pub use reactor::{Reactor, ReactorState, ReactorWaker};
        pub use request::{Accepted, Completion, RequestKind};
        pub use socket::Socket;
        pub use timer::TimerId;
        pub use worker_pool::WorkerPool;
    } else {
        compile_error!("emberio-runtime currently supports only the Linux epoll backend");
    }
}
