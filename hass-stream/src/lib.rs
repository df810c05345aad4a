//! # hass-stream
//!
//! A micro-crate for holding one authenticated, long-lived connection to a
//! Home Assistant server.
//!
//! It drives the connection lifecycle (connect, authenticate, ready,
//! closed), correlates command responses with their requests, and hands
//! unsolicited events to a [`FrameHandler`]. What happens to those events is
//! up to the handler; `hass-sdk-event-manager` provides the standard one.

mod config;
mod connection;
mod correlator;
mod error;
mod handler;
mod phase;
mod transport;

pub use config::*;
pub use connection::*;
pub use correlator::*;
pub use error::*;
pub use handler::*;
pub use phase::*;
pub use transport::*;
