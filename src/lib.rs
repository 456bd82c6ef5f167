//! `corrline` — a bidirectional, peer-symmetric streaming-correspondence
//! protocol engine over any duplex byte transport.
//!
//! Four layers, each owned by its own module:
//! - wire framing and validation live in the `corrline-wire` crate
//! - [`Correspondence`] is the stateful conduit for one exchange
//! - [`Peer`] binds one transport stream and demultiplexes it into
//!   correspondences
//! - [`Server`] hosts many peers and routes by subject

mod correspondence;
mod error;
mod peer;
mod server;

pub use correspondence::{Correspondence, NextOutcome, ReadHandler};
pub use error::{CorrespondenceError, PeerError, PeerEvent, ServerError, ServerEvent};
pub use peer::Peer;
pub use server::{ExceptionHandler, Handler, HandlerError, HandlerException, Server, WritableView};

pub use corrline_wire::{Message, MessageError, MessageHeader, MessageType};
