//! launcher-proto: the control protocol between spawner, broker and one-shot clients
//!
//! Every message is a fixed header `{command, payload_length}` followed by
//! exactly `payload_length` bytes. Payload layouts are fixed per command and
//! parsed field by field; anything left over or missing is a protocol error.

pub mod frame;
pub mod message;
pub mod payload;

pub use frame::{Frame, HEADER_LEN, MAX_PAYLOAD_LEN};
pub use message::{
    ControlMessage, ExecRequest, ExecVariant, command, command_name, read_message, write_message,
};
