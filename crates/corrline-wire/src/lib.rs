//! Wire types and framing for the correspondence protocol: newline-delimited
//! JSON messages, each tagged `data`/`fin`/`err` (absent ⇒ `data`).

mod codec;
mod message;

pub use codec::{decode_line, encode_message, framed_from_io, FrameIssue, FrameSink, FrameStream, MessageCodec};
pub use message::{Message, MessageError, MessageHeader, MessageType, ValidationError};
