use corrline_wire::FrameIssue;

/// Errors raised by [`crate::Correspondence`] operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CorrespondenceError {
    #[error("correspondence is no longer writable")]
    Unwritable,
    #[error("correspondence is no longer readable")]
    Unreadable,
    #[error("remote side sent an error: {}: {}", .0.kind, .0.message)]
    Remote(corrline_wire::MessageError),
    #[error("owning peer has disconnected")]
    PeerDisconnected,
    #[error("a read handler rejected the chunk: {0}")]
    Handler(String),
    #[error("write failed: {0}")]
    Transport(String),
    #[error("read was cancelled")]
    Cancelled,
}

impl From<FrameIssue> for CorrespondenceError {
    fn from(issue: FrameIssue) -> Self {
        CorrespondenceError::Transport(issue.to_string())
    }
}

/// Errors raised by [`crate::Peer`] operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PeerError {
    #[error("peer has disconnected")]
    Disconnected,
    #[error("message failed validation before sending: {0}")]
    InvalidMessage(String),
    #[error("underlying transport failed: {0}")]
    Transport(String),
}

/// Events emitted by a [`crate::Peer`]'s background ingestion loop.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A correspondence — local or remote-initiated — became known.
    Correspondence(crate::Correspondence),
    /// A framing, validation, or transport error was observed.
    Error(PeerError),
    /// The peer disconnected; no further events follow.
    Disconnect,
}

/// Errors surfaced at the [`crate::Server`] level.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServerError {
    #[error("handler for subject \"{subject}\" returned without terminating the correspondence")]
    Unfinished { subject: String },
}

/// Events emitted by a [`crate::Server`].
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Connect { peer_id: String },
    Disconnect { peer_id: String },
    Error { peer_id: String, error: String },
}
