//! Network clients.

pub mod http;

pub use http::{HttpConfigSource, HttpTransport};
