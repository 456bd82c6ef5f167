use std::sync::Arc;

use corrline::Peer;
use corrline_wire::{decode_line, encode_message, FrameIssue, FrameSink, FrameStream, Message};
use futures_util::{sink, stream, SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;

#[derive(Debug, thiserror::Error)]
pub enum WsAdapterError {
    #[error("connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Dials a WebSocket URL and returns a connected [`Peer`] — the initiator
/// side of the symmetric protocol.
pub async fn dial(url: &str) -> Result<Peer, WsAdapterError> {
    let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
    let (stream_half, sink_half) = ws.split();
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
                        Some(Ok(WsMessage::Text(text))) => {
                            return Some((decode_line(&text), (stream_half, sink_half)))
                        }
                        Some(Ok(WsMessage::Ping(payload))) => {
                            let _ = sink_half.lock().await.send(WsMessage::Pong(payload)).await;
                            continue;
                        }
                        Some(Ok(WsMessage::Pong(_))) => continue,
                        Some(Ok(WsMessage::Close(_))) => {
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
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| FrameIssue::Transport(e.to_string()))?;
        Ok::<_, FrameIssue>(sink_half)
    }));

    Ok(Peer::from_frames(url.to_owned(), frame_stream, frame_sink))
}
