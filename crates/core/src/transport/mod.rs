//! Transports sitting at the head of a channel pipeline.
//!
//! A transport is the stage that finally executes outbound operations: it opens the
//! connection a `connect` asks for, puts written bytes on the wire and turns whatever
//! the socket produces into inbound pipeline events.
mod tcp;

pub use tcp::TcpTransport;
