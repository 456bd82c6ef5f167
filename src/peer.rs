use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use corrline_wire::{FrameIssue, FrameSink, FrameStream, Message, MessageHeader};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::correspondence::Correspondence;
use crate::error::{PeerError, PeerEvent};

pub(crate) struct PeerShared {
    pub id: String,
    pub correspondences: Mutex<HashMap<String, Correspondence>>,
    pub writer: Arc<Mutex<FrameSink>>,
    pub disconnected: AtomicBool,
    pub shutdown: Notify,
}

/// Binds one duplex transport stream. Demultiplexes inbound messages into
/// [`Correspondence`]s (creating one on first sight of an id), serializes
/// outgoing writes, and owns the connection's lifecycle.
pub struct Peer {
    shared: Arc<PeerShared>,
    events_rx: Mutex<mpsc::UnboundedReceiver<PeerEvent>>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
}

impl Peer {
    /// Convenience constructor for any byte-stream duplex transport (TCP,
    /// named pipes, `tokio::io::duplex`).
    pub fn new<T>(id: impl Into<String>, io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (stream, sink) = corrline_wire::framed_from_io(io);
        Self::from_frames(id, stream, sink)
    }

    /// Constructor for adapters that already produce a framed
    /// stream/sink pair (e.g. `corrline-ws`).
    pub fn from_frames(id: impl Into<String>, stream: FrameStream, sink: FrameSink) -> Self {
        let id = id.into();
        let shared = Arc::new(PeerShared {
            id: id.clone(),
            correspondences: Mutex::new(HashMap::new()),
            writer: Arc::new(Mutex::new(sink)),
            disconnected: AtomicBool::new(false),
            shutdown: Notify::new(),
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let task_shared = shared.clone();
        let task_events_tx = events_tx.clone();
        tokio::spawn(async move {
            run_ingestion(task_shared, stream, task_events_tx).await;
        });

        Self {
            shared,
            events_rx: Mutex::new(events_rx),
            events_tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn is_connected(&self) -> bool {
        !self.shared.disconnected.load(Ordering::SeqCst)
    }

    /// Assigns an id if absent, validates, writes one frame, records the
    /// correspondence, and returns it.
    pub async fn send(&self, mut header: MessageHeader, body: Option<serde_json::Value>) -> Result<Correspondence, PeerError> {
        if !self.is_connected() {
            return Err(PeerError::Disconnected);
        }
        if header.correspondence_id.is_empty() {
            header.correspondence_id = Uuid::new_v4().to_string();
        }
        if header.subject.is_empty() {
            return Err(PeerError::InvalidMessage("subject must not be empty".to_owned()));
        }
        let corr = Correspondence::new(
            header.correspondence_id.clone(),
            header.clone(),
            self.shared.writer.clone(),
            Arc::downgrade(&self.shared),
        );
        self.shared
            .correspondences
            .lock()
            .await
            .insert(header.correspondence_id.clone(), corr.clone());

        let message = Message::data(header, body);
        let mut writer = self.shared.writer.lock().await;
        writer
            .send(message)
            .await
            .map_err(|e| PeerError::Transport(e.to_string()))?;
        drop(writer);
        Ok(corr)
    }

    /// Creates a correspondence without sending a frame, so the caller can
    /// stream data/finish at its own pace.
    pub async fn correspond(&self, mut header: MessageHeader) -> Result<Correspondence, PeerError> {
        if !self.is_connected() {
            return Err(PeerError::Disconnected);
        }
        if header.correspondence_id.is_empty() {
            header.correspondence_id = Uuid::new_v4().to_string();
        }
        let corr = Correspondence::new(
            header.correspondence_id.clone(),
            header.clone(),
            self.shared.writer.clone(),
            Arc::downgrade(&self.shared),
        );
        self.shared
            .correspondences
            .lock()
            .await
            .insert(header.correspondence_id, corr.clone());
        Ok(corr)
    }

    /// Suspends until the next remote-initiated correspondence becomes
    /// known. Transport- and framing-level errors are skipped (they are
    /// still observable via [`Peer::next_event`]); a disconnect resolves
    /// with [`PeerError::Disconnected`].
    pub async fn receive(&self) -> Result<Correspondence, PeerError> {
        loop {
            match self.next_event().await {
                Some(PeerEvent::Correspondence(c)) => return Ok(c),
                Some(PeerEvent::Error(_)) => continue,
                Some(PeerEvent::Disconnect) | None => return Err(PeerError::Disconnected),
            }
        }
    }

    /// Low-level event access used directly by [`crate::Server`]; also
    /// backs [`Peer::receive`].
    pub async fn next_event(&self) -> Option<PeerEvent> {
        self.events_rx.lock().await.recv().await
    }

    /// Detaches the frame stream. The underlying transport's own close is
    /// the adapter's responsibility; this only stops ingestion and fails
    /// every live/future correspondence operation with
    /// [`PeerError::Disconnected`] going forward.
    pub async fn disconnect(&self) {
        if self.shared.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.shutdown.notify_waiters();
        let correspondences = self.shared.correspondences.lock().await;
        for corr in correspondences.values() {
            corr.force_close().await;
        }
        drop(correspondences);
        let _ = self.events_tx.send(PeerEvent::Disconnect);
    }
}

async fn run_ingestion(shared: Arc<PeerShared>, mut stream: FrameStream, events_tx: mpsc::UnboundedSender<PeerEvent>) {
    loop {
        if shared.disconnected.load(Ordering::SeqCst) {
            break;
        }
        let frame = tokio::select! {
            biased;
            _ = shared.shutdown.notified() => break,
            frame = stream.next() => frame,
        };

        match frame {
            None => break,
            Some(Err(FrameIssue::Transport(reason))) => {
                let _ = events_tx.send(PeerEvent::Error(PeerError::Transport(reason)));
                break;
            }
            Some(Err(issue)) => {
                warn!(peer = %shared.id, error = %issue, "dropping malformed frame");
                let _ = events_tx.send(PeerEvent::Error(PeerError::InvalidMessage(issue.to_string())));
            }
            Some(Ok(message)) => {
                dispatch_inbound(&shared, message, &events_tx).await;
            }
        }
    }

    if !shared.disconnected.swap(true, Ordering::SeqCst) {
        let correspondences = shared.correspondences.lock().await;
        for corr in correspondences.values() {
            corr.force_close().await;
        }
        drop(correspondences);
        debug!(peer = %shared.id, "peer disconnected");
        let _ = events_tx.send(PeerEvent::Disconnect);
    }
}

async fn dispatch_inbound(shared: &Arc<PeerShared>, message: Message, events_tx: &mpsc::UnboundedSender<PeerEvent>) {
    let id = message.header.correspondence_id.clone();
    let existing = { shared.correspondences.lock().await.get(&id).cloned() };

    let corr = match existing {
        Some(corr) => corr,
        None => {
            let corr = Correspondence::new(
                id.clone(),
                message.header.clone(),
                shared.writer.clone(),
                Arc::downgrade(shared),
            );
            shared.correspondences.lock().await.insert(id, corr.clone());
            // The correspondence must be observable before its first frame
            // is consumed, so a subscriber can register read handlers in
            // time to see chunk 1.
            let _ = events_tx.send(PeerEvent::Correspondence(corr.clone()));
            corr
        }
    };

    corr.ingest(message).await;
}
