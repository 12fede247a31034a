use std::{io, sync::Arc};

/// Shared failure cause.
///
/// Causes travel between promises by reference so that whoever observes a failure sees the
/// very same value the failing party produced.
pub type Cause = Arc<ConnectError>;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("connect issued on a coordinator that is not attached to a pipeline")]
    NotAttached,

    #[error("coordinator was already attached once and cannot be reused")]
    AlreadyAttached,

    #[error("a connect attempt was already issued on this channel")]
    AlreadyConnected,

    #[error("proxy handshake failed: {0}")]
    Handshake(String),

    #[error("proxy rejected the connect request with status {status}: {reason}")]
    ProxyRejected { status: u16, reason: String },

    #[error("connection closed before the handshake completed")]
    ConnectionClosed,

    #[error("channel closed")]
    ChannelClosed,

    #[error("no stage named `{0}` in pipeline")]
    StageNotFound(String),

    #[error("a stage named `{0}` is already in the pipeline")]
    DuplicateStage(String),

    #[error("no transport handled the outbound {0} operation")]
    NoTransport(&'static str),

    #[error("could not resolve {0}")]
    Unresolvable(String),

    #[error("unsupported address for this transport: {0}")]
    UnsupportedAddress(String),

    #[error("network error: {0}")]
    Transport(#[from] io::Error),
}

impl ConnectError {
    pub fn into_cause(self) -> Cause {
        Arc::new(self)
    }
}
