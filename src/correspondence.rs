use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use corrline_wire::{FrameSink, Message, MessageError, MessageHeader, MessageType};
use futures_util::SinkExt;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::CorrespondenceError;
use crate::peer::PeerShared;

/// A read-handler run by [`Correspondence::next`]/[`Correspondence::all`]
/// over every delivered chunk, in registration order, before the chunk is
/// handed back to the caller. Returning `Err` aborts the read with
/// [`CorrespondenceError::Handler`].
pub type ReadHandler =
    Arc<dyn Fn(&Value, &MessageHeader, &mut Map<String, Value>) -> Result<(), String> + Send + Sync>;

/// Result of one [`Correspondence::next`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum NextOutcome {
    Chunk(Value),
    End,
}

#[derive(Debug, Clone)]
pub(crate) enum InboundEvent {
    Chunk(Value),
    End,
    Error(MessageError),
}

struct CorrespondenceInner {
    id: String,
    header: Mutex<MessageHeader>,
    readable: AtomicBool,
    writable: AtomicBool,
    writer: Arc<Mutex<FrameSink>>,
    inbound_tx: mpsc::UnboundedSender<InboundEvent>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<InboundEvent>>,
    read_context: Mutex<Map<String, Value>>,
    peer: Weak<PeerShared>,
}

/// A stateful bidirectional conduit bound to one correspondence id on one
/// [`crate::Peer`]. Cheaply `Clone`able — clones share the same underlying
/// state.
#[derive(Clone)]
pub struct Correspondence {
    inner: Arc<CorrespondenceInner>,
}

impl std::fmt::Debug for Correspondence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correspondence")
            .field("id", &self.inner.id)
            .field("readable", &self.is_readable())
            .field("writable", &self.is_writable())
            .finish()
    }
}

impl Correspondence {
    pub(crate) fn new(
        id: String,
        header: MessageHeader,
        writer: Arc<Mutex<FrameSink>>,
        peer: Weak<PeerShared>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(CorrespondenceInner {
                id,
                header: Mutex::new(header),
                readable: AtomicBool::new(true),
                writable: AtomicBool::new(true),
                writer,
                inbound_tx,
                inbound_rx: Mutex::new(inbound_rx),
                read_context: Mutex::new(Map::new()),
                peer,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub async fn header(&self) -> MessageHeader {
        self.inner.header.lock().await.clone()
    }

    pub fn is_readable(&self) -> bool {
        self.inner.readable.load(Ordering::SeqCst)
    }

    pub fn is_writable(&self) -> bool {
        self.inner.writable.load(Ordering::SeqCst)
    }

    /// Routes an inbound, already-validated message into this
    /// correspondence. Called only by the owning [`crate::Peer`]'s
    /// ingestion loop.
    pub(crate) async fn ingest(&self, message: Message) {
        *self.inner.header.lock().await = message.header;
        match message.kind {
            MessageType::Data => {
                let _ = self
                    .inner
                    .inbound_tx
                    .send(InboundEvent::Chunk(message.body.unwrap_or(Value::Null)));
            }
            MessageType::Finish => {
                self.inner.readable.store(false, Ordering::SeqCst);
                if let Some(body) = message.body {
                    let _ = self.inner.inbound_tx.send(InboundEvent::Chunk(body));
                }
                let _ = self.inner.inbound_tx.send(InboundEvent::End);
                self.maybe_evict().await;
            }
            MessageType::Error => {
                self.inner.readable.store(false, Ordering::SeqCst);
                let error = message
                    .error
                    .unwrap_or_else(|| MessageError::new("UnknownError", "remote sent no error detail"));
                let _ = self.inner.inbound_tx.send(InboundEvent::Error(error));
                self.maybe_evict().await;
            }
        }
    }

    /// Forcibly marks both directions closed and fails any pending waiter.
    /// Called by the owning [`crate::Peer`] on disconnect.
    pub(crate) async fn force_close(&self) {
        self.inner.readable.store(false, Ordering::SeqCst);
        self.inner.writable.store(false, Ordering::SeqCst);
        // Closing the receiver makes any pending or future `next` call
        // observe the channel as closed (`None`), which `next` maps to
        // `PeerDisconnected`.
        self.inner.inbound_rx.lock().await.close();
    }

    async fn maybe_evict(&self) {
        if !self.is_readable() && !self.is_writable() {
            if let Some(peer) = self.inner.peer.upgrade() {
                peer.correspondences.lock().await.remove(&self.inner.id);
            }
        }
    }

    async fn send_frame(&self, message: Message) -> Result<(), CorrespondenceError> {
        let mut writer = self.inner.writer.lock().await;
        writer
            .send(message)
            .await
            .map_err(|e| CorrespondenceError::Transport(e.to_string()))
    }

    /// Sends a `Data` frame. Fails if this side is no longer writable.
    ///
    /// The writability recheck happens under the same writer-mutex critical
    /// section as the send itself, so a concurrent `finish`/`error` on a
    /// clone can never have its frame overtaken by a `write` that read a
    /// stale "still writable" snapshot: whichever call actually holds the
    /// writer lock first either observes the flag already flipped (and
    /// aborts) or legitimately sends before the other call can acquire the
    /// lock in turn.
    pub async fn write(&self, body: Value) -> Result<(), CorrespondenceError> {
        let header = self.header().await;
        let message = Message::data(header, Some(body));
        let mut writer = self.inner.writer.lock().await;
        if !self.is_writable() {
            return Err(CorrespondenceError::Unwritable);
        }
        writer
            .send(message)
            .await
            .map_err(|e| CorrespondenceError::Transport(e.to_string()))
    }

    /// Sends a single `Finish` frame, optionally carrying a final body, and
    /// closes the write side. Idempotent: a second call fails with
    /// [`CorrespondenceError::Unwritable`] and emits no frame.
    pub async fn finish(&self, body: Option<Value>) -> Result<(), CorrespondenceError> {
        if !self.inner.writable.swap(false, Ordering::SeqCst) {
            return Err(CorrespondenceError::Unwritable);
        }
        let header = self.header().await;
        let result = self.send_frame(Message::finish(header, body)).await;
        self.maybe_evict().await;
        result
    }

    /// Sends an `Error` frame and closes the write side. Idempotent like
    /// [`Correspondence::finish`].
    pub async fn error(&self, error: MessageError) -> Result<(), CorrespondenceError> {
        if !self.inner.writable.swap(false, Ordering::SeqCst) {
            return Err(CorrespondenceError::Unwritable);
        }
        let header = self.header().await;
        let result = self.send_frame(Message::error(header, error)).await;
        self.maybe_evict().await;
        result
    }

    /// Waits for the next inbound chunk, finish, or error. Resets the
    /// per-read context and runs `handlers` over a delivered chunk before
    /// returning it.
    ///
    /// If `cancel` fires before a frame arrives, the wait resolves with
    /// [`CorrespondenceError::Cancelled`] and this side is marked
    /// unreadable — a cancelled read is terminal, not retryable, matching
    /// what happens when the remote sends `Finish`/`Error`.
    pub async fn next(&self, handlers: &[ReadHandler]) -> Result<NextOutcome, CorrespondenceError> {
        self.next_cancellable(handlers, None).await
    }

    /// Like [`Correspondence::next`], but the wait is also raced against
    /// `cancel`.
    pub async fn next_cancellable(
        &self,
        handlers: &[ReadHandler],
        cancel: Option<&CancellationToken>,
    ) -> Result<NextOutcome, CorrespondenceError> {
        if !self.is_readable() {
            return Err(CorrespondenceError::Unreadable);
        }
        let event = {
            let mut rx = self.inner.inbound_rx.lock().await;
            match cancel {
                Some(cancel) => tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        self.inner.readable.store(false, Ordering::SeqCst);
                        return Err(CorrespondenceError::Cancelled);
                    }
                    event = rx.recv() => event,
                },
                None => rx.recv().await,
            }
        };
        match event {
            None => Err(CorrespondenceError::PeerDisconnected),
            Some(InboundEvent::Chunk(body)) => {
                *self.inner.read_context.lock().await = Map::new();
                let header = self.header().await;
                {
                    let mut ctx = self.inner.read_context.lock().await;
                    for handler in handlers {
                        handler(&body, &header, &mut ctx).map_err(CorrespondenceError::Handler)?;
                    }
                }
                Ok(NextOutcome::Chunk(body))
            }
            Some(InboundEvent::End) => {
                *self.inner.read_context.lock().await = Map::new();
                Ok(NextOutcome::End)
            }
            Some(InboundEvent::Error(error)) => Err(CorrespondenceError::Remote(error)),
        }
    }

    /// A lazy, restartable-by-construction sequence of chunks, built fresh
    /// on every call.
    pub fn all<'a>(
        &'a self,
        handlers: &'a [ReadHandler],
    ) -> impl futures_util::Stream<Item = Result<Value, CorrespondenceError>> + 'a {
        self.all_cancellable(handlers, None)
    }

    /// Like [`Correspondence::all`], but every underlying `next` wait is
    /// also raced against `cancel` — firing it ends the stream with one
    /// final `Err(CorrespondenceError::Cancelled)` item and marks this side
    /// unreadable.
    pub fn all_cancellable<'a>(
        &'a self,
        handlers: &'a [ReadHandler],
        cancel: Option<&'a CancellationToken>,
    ) -> impl futures_util::Stream<Item = Result<Value, CorrespondenceError>> + 'a {
        async_stream::stream! {
            loop {
                match self.next_cancellable(handlers, cancel).await {
                    Ok(NextOutcome::Chunk(v)) => yield Ok(v),
                    Ok(NextOutcome::End) => break,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corrline_wire::FrameIssue;
    use futures_util::{sink, StreamExt};

    fn sink_to_vec() -> (Arc<Mutex<FrameSink>>, Arc<std::sync::Mutex<Vec<Message>>>) {
        let collected: Arc<std::sync::Mutex<Vec<Message>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let collected_for_sink = collected.clone();
        let sink = sink::unfold((), move |(), msg: Message| {
            let collected = collected_for_sink.clone();
            async move {
                collected.lock().unwrap().push(msg);
                Ok::<_, FrameIssue>(())
            }
        });
        (Arc::new(Mutex::new(Box::pin(sink))), collected)
    }

    fn test_correspondence() -> (Correspondence, Arc<std::sync::Mutex<Vec<Message>>>) {
        let (writer, collected) = sink_to_vec();
        let header = MessageHeader::new("c1", "chat");
        (Correspondence::new("c1".into(), header, writer, Weak::new()), collected)
    }

    #[tokio::test]
    async fn write_then_finish_then_write_again_fails() {
        let (corr, sent) = test_correspondence();
        corr.write(Value::from(1)).await.unwrap();
        corr.finish(None).await.unwrap();
        assert!(matches!(corr.write(Value::from(2)).await, Err(CorrespondenceError::Unwritable)));
        assert_eq!(sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn finish_is_idempotent_and_emits_once() {
        let (corr, sent) = test_correspondence();
        corr.finish(Some(Value::from("bye"))).await.unwrap();
        assert!(matches!(corr.finish(None).await, Err(CorrespondenceError::Unwritable)));
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ingest_data_then_finish_yields_chunk_then_end() {
        let (corr, _sent) = test_correspondence();
        let header = MessageHeader::new("c1", "chat");
        corr.ingest(Message::data(header.clone(), Some(Value::from("hi")))).await;
        corr.ingest(Message::finish(header, None)).await;

        let first = corr.next(&[]).await.unwrap();
        assert_eq!(first, NextOutcome::Chunk(Value::from("hi")));
        let second = corr.next(&[]).await.unwrap();
        assert_eq!(second, NextOutcome::End);
        assert!(!corr.is_readable());
    }

    #[tokio::test]
    async fn finish_with_body_delivers_chunk_then_end() {
        let (corr, _sent) = test_correspondence();
        let header = MessageHeader::new("c1", "chat");
        corr.ingest(Message::finish(header, Some(Value::from("last")))).await;

        assert_eq!(corr.next(&[]).await.unwrap(), NextOutcome::Chunk(Value::from("last")));
        assert_eq!(corr.next(&[]).await.unwrap(), NextOutcome::End);
    }

    #[tokio::test]
    async fn ingest_error_fails_next_with_remote() {
        let (corr, _sent) = test_correspondence();
        let header = MessageHeader::new("c1", "chat");
        corr.ingest(Message::error(header, MessageError::new("Bad", "nope"))).await;

        let err = corr.next(&[]).await.unwrap_err();
        assert!(matches!(err, CorrespondenceError::Remote(_)));
        assert!(!corr.is_readable());
    }

    #[tokio::test]
    async fn read_handler_can_reject_a_chunk() {
        let (corr, _sent) = test_correspondence();
        let header = MessageHeader::new("c1", "chat");
        corr.ingest(Message::data(header, Some(Value::from("bad")))).await;

        let handler: ReadHandler = Arc::new(|body, _header, _ctx| {
            if body == "bad" {
                Err("rejected".to_owned())
            } else {
                Ok(())
            }
        });
        let err = corr.next(&[handler]).await.unwrap_err();
        assert!(matches!(err, CorrespondenceError::Handler(_)));
    }

    #[tokio::test]
    async fn all_terminates_on_end_and_is_restartable() {
        let (corr, _sent) = test_correspondence();
        let header = MessageHeader::new("c1", "chat");
        corr.ingest(Message::data(header.clone(), Some(Value::from(1)))).await;
        corr.ingest(Message::finish(header, None)).await;

        let collected: Vec<_> = corr.all(&[]).collect().await;
        assert_eq!(collected.len(), 1); // End breaks the stream without yielding an item
        assert_eq!(collected[0].as_ref().unwrap(), &Value::from(1));
    }

    #[tokio::test]
    async fn cancelling_a_pending_next_fails_it_and_marks_unreadable() {
        let (corr, _sent) = test_correspondence();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = corr.next_cancellable(&[], Some(&cancel)).await.unwrap_err();
        assert!(matches!(err, CorrespondenceError::Cancelled));
        assert!(!corr.is_readable());
    }

    #[tokio::test]
    async fn an_already_delivered_chunk_wins_the_race_against_cancellation() {
        let (corr, _sent) = test_correspondence();
        let header = MessageHeader::new("c1", "chat");
        corr.ingest(Message::data(header, Some(Value::from("hi")))).await;

        // biased select prefers the cancellation branch only when it is
        // ready; here the channel already has an item queued, so a
        // not-yet-fired token must not pre-empt it.
        let cancel = CancellationToken::new();
        let outcome = corr.next_cancellable(&[], Some(&cancel)).await.unwrap();
        assert_eq!(outcome, NextOutcome::Chunk(Value::from("hi")));
        assert!(corr.is_readable());
    }
}
