use std::collections::HashMap;
use std::error::Error as StdError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use corrline_wire::{FrameSink, FrameStream, MessageError};
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

use crate::correspondence::Correspondence;
use crate::error::{PeerEvent, ServerEvent};
use crate::peer::Peer;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The error type handlers and exception handlers return. Any `Error` works;
/// a [`HandlerException`] gets its `kind`/`message` surfaced verbatim by the
/// built-in default exception handler.
pub type HandlerError = Box<dyn StdError + Send + Sync>;

/// A correspondence handler: given the newly observed correspondence, must
/// terminate it (via `finish` or `error`) before returning `Ok`.
pub type Handler = Arc<dyn Fn(Correspondence) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// An exception handler: given a writable view of the correspondence that a
/// [`Handler`] failed to terminate cleanly, and the error it returned.
pub type ExceptionHandler =
    Arc<dyn Fn(WritableView, Arc<HandlerError>) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// A deliberate error a handler can return to control the exact `type`/
/// `message` the default exception handler sends back, without reaching for
/// `error()` itself (useful when a handler wants the exception pipeline,
/// e.g. user-registered exception handlers, to see the failure too).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{}", self.message.as_deref().unwrap_or("Unexpected error occurred!"))]
pub struct HandlerException {
    pub kind: Option<String>,
    pub message: Option<String>,
}

impl HandlerException {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            message: Some(message.into()),
        }
    }
}

/// A narrow, `Clone`-able view over a [`Correspondence`] exposing only the
/// write-side operations, handed to exception handlers so they can terminate
/// the correspondence without being tempted to read from it.
#[derive(Clone)]
pub struct WritableView {
    inner: Correspondence,
}

impl From<&Correspondence> for WritableView {
    fn from(corr: &Correspondence) -> Self {
        Self { inner: corr.clone() }
    }
}

impl WritableView {
    pub async fn write(&self, body: serde_json::Value) -> Result<(), crate::error::CorrespondenceError> {
        self.inner.write(body).await
    }

    pub async fn finish(&self, body: Option<serde_json::Value>) -> Result<(), crate::error::CorrespondenceError> {
        self.inner.finish(body).await
    }

    pub async fn error(&self, error: MessageError) -> Result<(), crate::error::CorrespondenceError> {
        self.inner.error(error).await
    }

    pub fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }
}

struct ServerShared {
    handlers: RwLock<HashMap<String, Handler>>,
    default_handler: RwLock<Handler>,
    exception_handlers: RwLock<Vec<ExceptionHandler>>,
    peers: RwLock<HashMap<String, Arc<Peer>>>,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
}

/// Hosts any number of [`Peer`]s, routing their newly observed
/// correspondences to subject handlers and running the exception pipeline
/// when a handler fails to terminate one.
pub struct Server {
    shared: Arc<ServerShared>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerEvent>>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(ServerShared {
                handlers: RwLock::new(HashMap::new()),
                default_handler: RwLock::new(unknown_subject_handler()),
                exception_handlers: RwLock::new(Vec::new()),
                peers: RwLock::new(HashMap::new()),
                events_tx,
            }),
            events_rx: tokio::sync::Mutex::new(events_rx),
        }
    }

    /// Registers the handler for `subject`, replacing (and logging a
    /// warning about) any prior registration.
    pub async fn handle(&self, subject: impl Into<String>, handler: Handler) {
        let subject = subject.into();
        let mut handlers = self.shared.handlers.write().await;
        if handlers.insert(subject.clone(), handler).is_some() {
            warn!(subject = %subject, "replacing existing subject handler");
        }
    }

    /// Replaces the built-in unknown-subject responder.
    pub async fn default_handler(&self, handler: Handler) {
        *self.shared.default_handler.write().await = handler;
    }

    /// Prepends `handler` to the exception chain — most-recently-registered
    /// runs first, ahead of any handler already registered. The built-in
    /// catch-all always runs last and is never itself replaceable.
    pub async fn handle_exception(&self, handler: ExceptionHandler) {
        self.shared.exception_handlers.write().await.insert(0, handler);
    }

    /// Runs `configure` with a reference to this server — a pure
    /// convenience hook for bundling related `handle`/`handle_exception`
    /// registrations.
    pub async fn configure<F, Fut>(&self, configure: F)
    where
        F: FnOnce(&Server) -> Fut,
        Fut: Future<Output = ()>,
    {
        configure(self).await;
    }

    /// Binds a transport (already split into frames) as a new peer, spawns
    /// its dispatch loop, and returns the peer id assigned.
    pub async fn connect(&self, peer_id: impl Into<String>, stream: FrameStream, sink: FrameSink) -> String {
        let peer_id = peer_id.into();
        let peer = Arc::new(Peer::from_frames(peer_id.clone(), stream, sink));
        self.shared.peers.write().await.insert(peer_id.clone(), peer.clone());

        let shared = self.shared.clone();
        let dispatch_peer_id = peer_id.clone();
        tokio::spawn(async move {
            run_peer_dispatch(shared, dispatch_peer_id, peer).await;
        });

        let _ = self.shared.events_tx.send(ServerEvent::Connect { peer_id: peer_id.clone() });
        peer_id
    }

    /// Disconnects the named peer, if still connected.
    pub async fn disconnect(&self, peer_id: &str) {
        if let Some(peer) = self.shared.peers.read().await.get(peer_id).cloned() {
            peer.disconnect().await;
        }
    }

    /// Snapshot of currently tracked peer ids (a disconnected peer is
    /// removed from this list once its dispatch loop observes the
    /// disconnect).
    pub async fn peer_ids(&self) -> Vec<String> {
        self.shared.peers.read().await.keys().cloned().collect()
    }

    /// Next server-level event (`Connect`/`Disconnect`/`Error`).
    pub async fn next_event(&self) -> Option<ServerEvent> {
        self.events_rx.lock().await.recv().await
    }
}

async fn run_peer_dispatch(shared: Arc<ServerShared>, peer_id: String, peer: Arc<Peer>) {
    loop {
        match peer.next_event().await {
            Some(PeerEvent::Correspondence(corr)) => {
                let shared = shared.clone();
                let peer_id = peer_id.clone();
                tokio::spawn(async move {
                    dispatch_subject(&shared, &peer_id, corr).await;
                });
            }
            Some(PeerEvent::Error(e)) => {
                let _ = shared.events_tx.send(ServerEvent::Error {
                    peer_id: peer_id.clone(),
                    error: e.to_string(),
                });
            }
            Some(PeerEvent::Disconnect) | None => {
                shared.peers.write().await.remove(&peer_id);
                let _ = shared.events_tx.send(ServerEvent::Disconnect { peer_id });
                break;
            }
        }
    }
}

async fn dispatch_subject(shared: &Arc<ServerShared>, peer_id: &str, corr: Correspondence) {
    let header = corr.header().await;
    let subject = header.subject.clone();

    let found = { shared.handlers.read().await.get(&subject).cloned() };
    let handler = match found {
        Some(h) => h,
        None => shared.default_handler.read().await.clone(),
    };

    if let Err(err) = handler(corr.clone()).await {
        run_exception_pipeline(shared, &corr, Arc::new(err)).await;
    }

    if corr.is_writable() {
        let _ = shared.events_tx.send(ServerEvent::Error {
            peer_id: peer_id.to_owned(),
            error: crate::error::ServerError::Unfinished { subject }.to_string(),
        });
    }
}

async fn run_exception_pipeline(shared: &Arc<ServerShared>, corr: &Correspondence, err: Arc<HandlerError>) {
    let view = WritableView::from(corr);
    let handlers = shared.exception_handlers.read().await.clone();
    for handler in handlers.iter().chain(std::iter::once(&default_exception_handler())) {
        if !view.is_writable() {
            break;
        }
        if let Err(inner) = handler(view.clone(), err.clone()).await {
            warn!(error = %inner, "exception handler itself failed");
            let _ = view
                .error(MessageError::new("GenericError", "Failed processing correspondence"))
                .await;
            break;
        }
    }
}

fn unknown_subject_handler() -> Handler {
    Arc::new(|corr: Correspondence| {
        Box::pin(async move {
            let subject = corr.header().await.subject.clone();
            corr.error(MessageError::new("UnknownSubject", format!("Unknown subject: {subject}")))
                .await
                .map_err(|e| Box::new(e) as HandlerError)
        })
    })
}

fn default_exception_handler() -> ExceptionHandler {
    Arc::new(|view: WritableView, err: Arc<HandlerError>| {
        Box::pin(async move {
            let (kind, message) = match err.downcast_ref::<HandlerException>() {
                Some(exc) => (
                    exc.kind.clone().unwrap_or_else(|| "UnknownError".to_owned()),
                    exc.message.clone().unwrap_or_else(|| "Unexpected error occurred!".to_owned()),
                ),
                None => ("UnknownError".to_owned(), err.to_string()),
            };
            view.error(MessageError::new(kind, message))
                .await
                .map_err(|e| Box::new(e) as HandlerError)
        })
    })
}
