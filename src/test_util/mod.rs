//! In-memory [`Socket`](crate::transport::socket::Socket) implementations for tests:
//!  a recording stub for single-component tests and a hub that wires several engine
//!  instances into a lossless virtual network.

pub mod hub;
