//! # emberio-http — HTTP/1.x over the emberio engine
//!
//! The protocol layer turns the byte stream of one stream handle into
//! discrete request/response exchanges. A [`Scanner`] tokenizes received
//! bytes through the [`ScanSink`] callback table; an [`HttpMsg`] accumulates
//! one exchange and serializes its response; an [`HttpLayer`] drives both
//! against a reactor handle, stepping a [`Site`] collaborator at each
//! station transition. Transport (plain or TLS) was decided at accept time
//! and is invisible here.

pub mod layer;
pub mod msg;
pub mod scanner;
pub mod site;

pub use layer::HttpLayer;
pub use msg::{mime_of, HttpMsg, Station};
pub use scanner::{ScanError, ScanHead, ScanResult, ScanSink, Scanner};
pub use site::{HelloSite, Site};
