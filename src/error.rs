/// Failure to interpret a single received line. Reported, never thrown:
/// the listener logs the line and moves on.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),

    #[error("missing field: {0}")]
    MissingField(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connect/send/receive failure or socket closed. Triggers the
    /// transparent reconnect path; never surfaced to `control`/`query`.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Info reply missing the device id or product id. Retried like a
    /// connection failure.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Internal misuse of the codec (e.g. encoding a push). Fatal to the
    /// call that triggered it, not to the client.
    #[error("unsupported command: {0}")]
    UnsupportedCommand(u8),
}

impl Error {
    pub(crate) fn timed_out(op: &str) -> Self {
        Self::Transport(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("{op} timed out"),
        ))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
