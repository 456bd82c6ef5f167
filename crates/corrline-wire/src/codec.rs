use bytes::BytesMut;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::io;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed, LinesCodec, LinesCodecError};

use crate::message::{validate, Message, RawMessage, ValidationError};

/// Everything that can go wrong turning bytes/transport frames into a
/// [`Message`], bucketed the way the ingestion loop needs to react to them:
/// framing and validation errors are recoverable per-frame, transport errors
/// are terminal for the connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FrameIssue {
    #[error("line did not parse as JSON: {0}")]
    Framing(String),
    #[error("message failed validation: {0}")]
    Invalid(#[from] ValidationError),
    #[error("transport failure: {0}")]
    Transport(String),
}

fn decode_json_line(line: &str) -> Result<Message, FrameIssue> {
    let raw: RawMessage = serde_json::from_str(line).map_err(|e| FrameIssue::Framing(e.to_string()))?;
    validate(raw).map_err(FrameIssue::from)
}

/// Parses one already-delimited frame of text (one WebSocket text frame, one
/// line of a byte stream with the trailing `\n` already stripped).
pub fn decode_line(line: &str) -> Result<Message, FrameIssue> {
    decode_json_line(line)
}

/// Serializes a message to its bare JSON text, with no trailing newline.
/// Byte-stream transports append `\n` themselves (see [`MessageCodec`]);
/// message-framed transports use the text as-is as one frame.
pub fn encode_message(message: &Message) -> String {
    serde_json::to_string(message).expect("Message serializes infallibly")
}

/// `tokio_util::codec::Decoder`/`Encoder` pair implementing the
/// newline-delimited JSON wire format for byte-stream transports.
///
/// Built on [`LinesCodec`] for the line-splitting plumbing; a line that
/// isn't valid JSON, or is valid JSON but fails validation, is reported as
/// `Ok(Some(Err(_)))` rather than ending the stream, so the connection keeps
/// reading at the next newline.
#[derive(Debug, Default)]
pub struct MessageCodec {
    lines: LinesCodec,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for MessageCodec {
    type Item = Result<Message, FrameIssue>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.lines.decode(src) {
            Ok(Some(line)) => Ok(Some(decode_json_line(&line))),
            Ok(None) => Ok(None),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Err(FrameIssue::Framing(
                "line exceeded maximum length".to_owned(),
            )))),
            Err(LinesCodecError::Io(e)) => Err(e),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = encode_message(&item);
        self.lines
            .encode(line, dst)
            .map_err(|e| match e {
                LinesCodecError::Io(e) => e,
                LinesCodecError::MaxLineLengthExceeded => {
                    io::Error::new(io::ErrorKind::InvalidData, "encoded message exceeded maximum line length")
                }
            })
    }
}

/// A boxed, transport-agnostic inbound frame stream: every item is already a
/// `Result<Message, FrameIssue>`, with no further I/O error layer to unwrap.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, FrameIssue>> + Send>>;

/// A boxed, transport-agnostic outbound frame sink.
pub type FrameSink = Pin<Box<dyn Sink<Message, Error = FrameIssue> + Send>>;

/// Adapts any `AsyncRead + AsyncWrite` duplex stream (TCP, Unix/Windows named
/// pipes, `tokio::io::duplex`) into a `(FrameStream, FrameSink)` pair via
/// [`MessageCodec`]. This is the entry point used by `corrline-tcp` and by
/// any other byte-stream transport adapter.
pub fn framed_from_io<T>(io: T) -> (FrameStream, FrameSink)
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let framed = Framed::new(io, MessageCodec::new());
    let (sink, stream) = framed.split();

    let stream = stream.map(|item| match item {
        Ok(Ok(message)) => Ok(message),
        Ok(Err(issue)) => Err(issue),
        Err(io_err) => Err(FrameIssue::Transport(io_err.to_string())),
    });
    let sink = sink.sink_map_err(|io_err| FrameIssue::Transport(io_err.to_string()));

    (Box::pin(stream), Box::pin(sink))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[tokio::test]
    async fn round_trips_a_well_formed_message() {
        let (client, server) = tokio::io::duplex(4096);
        let header = crate::message::MessageHeader::new("c1", "login");
        let msg = Message::data(header, Some(serde_json::json!({"ok": true})));

        let mut writer = FramedWrite::new(client, MessageCodec::new());
        writer.send(msg.clone()).await.unwrap();
        drop(writer);

        let mut reader = FramedRead::new(server, MessageCodec::new());
        let decoded = reader.next().await.unwrap().unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn a_garbage_line_does_not_end_the_stream() {
        let (mut client, server) = tokio::io::duplex(4096);
        use tokio::io::AsyncWriteExt;
        client.write_all(b"not json at all\n").await.unwrap();
        let header = crate::message::MessageHeader::new("c1", "login");
        let msg = Message::data(header, None);
        client
            .write_all(format!("{}\n", encode_message(&msg)).as_bytes())
            .await
            .unwrap();
        drop(client);

        let mut reader = FramedRead::new(server, MessageCodec::new());
        let first = reader.next().await.unwrap().unwrap();
        assert!(matches!(first, Err(FrameIssue::Framing(_))));
        let second = reader.next().await.unwrap().unwrap().unwrap();
        assert_eq!(second, msg);
    }
}
