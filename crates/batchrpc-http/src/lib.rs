//! batchrpc-http: HTTP transport for batchrpc.
//!
//! Maps single and batched calls onto REST-style `GET` requests:
//!
//! ```text
//! single  GET {base}/{resource}/{id}?{params}
//! batch   GET {base}/{resource}?ids=1&ids=2&{params}
//! ```
//!
//! Methods other than `get` add `q=<method>` to the query.

pub mod client;

pub use client::{HttpTransport, HttpTransportConfig};
