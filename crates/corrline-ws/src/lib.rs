//! WebSocket transport adapter. A frame is a single WS text message — one
//! JSON object per message, framing handled entirely by the WebSocket
//! protocol rather than `corrline_wire::MessageCodec`'s newline scanning.
//!
//! `client` dials out with `tokio-tungstenite`; `server` wraps an
//! already-upgraded `axum` WebSocket.

mod client;
mod server;

pub use client::{dial, WsAdapterError};
pub use server::{accept, split_frames};
