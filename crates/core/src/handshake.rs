//! Proxy handshake engines.
//!
//! An engine is a codec stage that speaks a proxy protocol on a freshly connected
//! channel and reports the result through its handshake signal.
use crate::{pipeline::Stage, promise::Promise};

mod http_connect;
pub use http_connect::{Credentials, HttpConnectHandshake};

/// A stage performing a proxy handshake.
///
/// Implementors must fail the signal on any error or closure during the handshake window
/// and abandon writes buffered for the tunnel when they do.
pub trait HandshakeStage: Stage {
    fn handshake_signal(&self) -> Promise;
}
