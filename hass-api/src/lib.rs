//! Wire-level API for the Home Assistant WebSocket protocol
//!
//! This crate owns the shape of every frame exchanged with the server and
//! the JSON codec that moves them on and off the socket. It has no I/O of its
//! own; `hass-sdk-stream` drives it.
//!
//! # Records
//!
//! ```rust
//! use hass_api::{codec, Command, ServerMessage};
//!
//! let frame = codec::encode_command(1, &Command::GetStates)?;
//! assert_eq!(frame, r#"{"id":1,"type":"get_states"}"#);
//!
//! let reply = codec::decode(r#"{"id":1,"type":"result","success":true,"result":[]}"#)?;
//! assert!(matches!(reply, ServerMessage::Result(_)));
//! # Ok::<(), hass_api::CodecError>(())
//! ```
//!
//! # Typed attributes
//!
//! Entity attributes are free-form JSON. [`StateRecord::attribute`] reads
//! them through explicit [`FromAttribute`] conversions and reports a missing
//! key or a type mismatch as a named [`AttributeError`].

pub mod attribute;
pub mod codec;
pub mod error;
pub mod message;
pub mod state;

pub use attribute::FromAttribute;
pub use error::{AttributeError, CodecError, Result};
pub use message::{
    AttributeChange, AuthMessage, Command, CommandRequest, ErrorInfo, Event, EventMessage, ResultMessage,
    ServerConfig, ServerMessage, StateChange, STATE_CHANGED,
};
pub use state::{domain_of, Attributes, Context, StateRecord};
