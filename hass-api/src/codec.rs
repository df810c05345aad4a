//! JSON text framing
//!
//! Every frame on the socket is one JSON object. Encoding never fails for
//! well-formed records; decoding fails for invalid JSON and for objects
//! without a `type` tag, while unknown tags decode to
//! [`ServerMessage::Unknown`].

use crate::error::Result;
use crate::message::{AuthMessage, Command, CommandRequest, ServerMessage};

/// Serialize the handshake frame
pub fn encode_auth(message: &AuthMessage) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Serialize a command with its correlation id
pub fn encode_command(id: u64, command: &Command) -> Result<String> {
    let request = CommandRequest {
        id,
        command: command.clone(),
    };
    Ok(serde_json::to_string(&request)?)
}

/// Parse one inbound frame
pub fn decode(frame: &str) -> Result<ServerMessage> {
    Ok(serde_json::from_str(frame)?)
}
