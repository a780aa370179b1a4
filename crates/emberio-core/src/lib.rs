//! # emberio-core — platform-agnostic leaves of the emberio engine
//!
//! Everything in here is consumed by the runtime and protocol crates but
//! depends on neither: error/result types, the slab resource pool, the
//! byte cache used for message I/O staging, env helpers, leveled logging,
//! and the connector-pool collaborator.
//!
//! Nothing in this crate touches a socket or an epoll fd.

pub mod cache;
pub mod db;
pub mod elog;
pub mod env;
pub mod error;
pub mod pool;

pub use error::{EngineError, Result};
