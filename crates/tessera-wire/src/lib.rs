//! Framing and connection multiplexing for the shared listener port.
//!
//! Every connection carries `[tag:1][len:4 BE][payload]` frames. The first
//! frame of a fresh connection is a startup frame whose magic number selects
//! the protocol family; [`mux::Mux`] uses it to hand the socket to the right
//! [`mux::MuxListener`].

pub mod connection;
pub mod frame;
pub mod mux;

pub use connection::Connection;
pub use frame::{Frame, Protocol, ERROR_TAG, STARTUP_TAG};
pub use mux::{dial, Accepted, Mux, MuxConfig, MuxListener};
