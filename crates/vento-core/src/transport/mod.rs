//! Vendor endpoint transport abstraction.
//!
//! The firmware check is a two-phase operation: fetch response headers
//! first, then either consume the body or drop the response to abort the
//! transfer. The trait keeps that control flow explicit so tests can assert
//! that an up-to-date check never reads a single body byte.

pub mod http;
pub mod mock;
pub mod traits;

pub use http::HttpTransport;
pub use mock::{MockResponse, MockVendorTransport};
pub use traits::{CheckResponse, TransportError, VendorTransport};
