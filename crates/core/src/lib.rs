//! Delays a channel's connect completion until a proxy handshake has finished.
//!
//! A [`HandshakeCoordinator`] is placed in a channel's [`Pipeline`](pipeline::Pipeline)
//! together with a handshake engine. The caller's connect promise only succeeds once the
//! engine reports a finished proxy handshake, and the coordinator steps out of the way
//! afterwards.

/// Remote address kinds and hostname-preserving normalization.
pub mod address;

/// Command line and file configuration.
pub mod config;

/// Holds the connect until the proxy handshake resolves.
pub mod coordinator;
pub use coordinator::{HandshakeCoordinator, HANDSHAKE_CODEC};

mod error;
pub use error::{Cause, ConnectError};

/// Proxy handshake engines.
pub mod handshake;

/// Ordered named stages and the per-channel event loop.
pub mod pipeline;

/// One-shot completion cells with race-tolerant completion.
pub mod promise;

/// Tracing and logging setup.
pub mod tracing;

/// Socket transports at the head of a pipeline.
pub mod transport;
