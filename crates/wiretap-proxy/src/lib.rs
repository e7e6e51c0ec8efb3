//! Intercepting HTTP/HTTPS proxy core.
//!
//! Accepts forward-proxy traffic, impersonates TLS origins with certificates
//! minted from a local root CA, and pushes every upstream response through a
//! transform/tap/sink pipeline that records flows and streamed events through
//! the [`wiretap_core::storage::FlowStore`] interface.

pub mod ca;
pub mod decompress;
pub mod egress;
pub mod eventstream;
pub mod http1;
pub mod pipeline;
pub mod proxy;
pub mod sink;
pub mod sse;
pub mod taps;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testutil;
