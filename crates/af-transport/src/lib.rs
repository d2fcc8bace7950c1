//! Concrete I/O for the apiflow core
//!
//! - `HttpTransport`: `Transport` over a shared `reqwest::Client`
//! - `HttpTokenRefresher`: exchanges a rejected token at the refresh endpoint
//! - `FileTokenStore`: persists the auth token as a JSON map on disk

pub mod http;
pub mod store;

pub use http::{HttpTokenRefresher, HttpTransport, HttpTransportConfig};
pub use store::FileTokenStore;
