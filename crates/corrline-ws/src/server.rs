use std::sync::Arc;

use axum::extract::ws::{Message as AxMessage, WebSocket};
use corrline::Peer;
use corrline_wire::{decode_line, encode_message, FrameIssue, FrameSink, FrameStream, Message};
use futures_util::{sink, stream, SinkExt, StreamExt};
use tokio::sync::Mutex;

/// Splits an already-upgraded axum [`WebSocket`] into the boxed
/// `FrameStream`/`FrameSink` pair the engine consumes, mirroring
/// [`corrline_wire::framed_from_io`] for byte-stream transports.
pub fn split_frames(socket: WebSocket) -> (FrameStream, FrameSink) {
    let (stream_half, sink_half) = socket.split();
    let sink_half = Arc::new(Mutex::new(sink_half));

    let frame_stream: FrameStream = {
        let sink_half = sink_half.clone();
        Box::pin(stream::unfold(
            (stream_half, sink_half),
            |(mut stream_half, sink_half)| async move {
                loop {
                    match stream_half.next().await {
                        None => return None,
                        Some(Err(e)) => {
                            return Some((Err(FrameIssue::Transport(e.to_string())), (stream_half, sink_half)))
                        }
                        Some(Ok(AxMessage::Text(text))) => {
                            return Some((decode_line(text.as_str()), (stream_half, sink_half)))
                        }
                        Some(Ok(AxMessage::Ping(payload))) => {
                            let _ = sink_half.lock().await.send(AxMessage::Pong(payload)).await;
                            continue;
                        }
                        Some(Ok(AxMessage::Pong(_))) => continue,
                        Some(Ok(AxMessage::Close(_))) => {
                            return Some((
                                Err(FrameIssue::Transport("connection closed by peer".to_owned())),
                                (stream_half, sink_half),
                            ))
                        }
                        Some(Ok(_)) => continue,
                    }
                }
            },
        ))
    };

    let frame_sink: FrameSink = Box::pin(sink::unfold(sink_half, |sink_half, message: Message| async move {
        let text = encode_message(&message);
        sink_half
            .lock()
            .await
            .send(AxMessage::Text(text.into()))
            .await
            .map_err(|e| FrameIssue::Transport(e.to_string()))?;
        Ok::<_, FrameIssue>(sink_half)
    }));

    (frame_stream, frame_sink)
}

/// Wraps an already-upgraded axum [`WebSocket`] as a connected [`Peer`] —
/// the responder side of the symmetric protocol.
pub fn accept(id: impl Into<String>, socket: WebSocket) -> Peer {
    let (stream, sink) = split_frames(socket);
    Peer::from_frames(id, stream, sink)
}
