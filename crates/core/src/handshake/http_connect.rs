//! HTTP `CONNECT` tunnel handshake.
use std::{fmt, net::SocketAddr};

use base64::{prelude::BASE64_STANDARD, Engine};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::Deserialize;

use super::HandshakeStage;
use crate::{
    address::RemoteAddress,
    error::{Cause, ConnectError},
    pipeline::{Stage, StageContext},
    promise::{Outcome, Promise},
};

/// Upper bound for the proxy's response head.
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Basic credentials sent in `Proxy-Authorization`.
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    fn header_value(&self) -> String {
        let encoded = BASE64_STANDARD.encode(format!("{}:{}", self.username, self.password));
        format!("Basic {encoded}")
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

enum State {
    Idle,
    /// Transport connect to the proxy issued.
    Connecting {
        authority: String,
        pending: Vec<Bytes>,
    },
    /// Request sent, collecting the response head.
    AwaitingResponse {
        response: BytesMut,
        pending: Vec<Bytes>,
    },
    Established,
    Failed,
}

enum Progress {
    Incomplete,
    Established {
        pending: Vec<Bytes>,
        leftover: BytesMut,
    },
    Rejected(ConnectError),
}

/// Opens a tunnel through an HTTP proxy.
///
/// The transport connect is redirected to the proxy. Once the channel is active the engine
/// asks the proxy to `CONNECT` to the original target and holds back every outbound write
/// and the upstream `channel_active` until the proxy answers with a 2xx status.
pub struct HttpConnectHandshake {
    proxy: RemoteAddress,
    credentials: Option<Credentials>,
    signal: Promise,
    state: Mutex<State>,
}

impl HttpConnectHandshake {
    pub fn new(proxy: RemoteAddress) -> Self {
        Self {
            proxy,
            credentials: None,
            signal: Promise::new(),
            state: Mutex::new(State::Idle),
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    fn request(&self, authority: &str) -> Bytes {
        let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
        if let Some(credentials) = &self.credentials {
            request.push_str("Proxy-Authorization: ");
            request.push_str(&credentials.header_value());
            request.push_str("\r\n");
        }
        request.push_str("\r\n");
        Bytes::from(request)
    }

    /// Fails the handshake if it is still in progress. Returns whether it was.
    fn abort(&self, ctx: &StageContext, cause: Cause) -> bool {
        let dropped = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::Failed) {
                State::Connecting { pending, .. } | State::AwaitingResponse { pending, .. } => {
                    pending.len()
                }
                other => {
                    *state = other;
                    return false;
                }
            }
        };
        tracing::warn!(proxy = %self.proxy, %cause, dropped_writes = dropped, "proxy handshake failed");
        self.signal.try_failure(cause);
        ctx.close();
        true
    }
}

impl HandshakeStage for HttpConnectHandshake {
    fn handshake_signal(&self) -> Promise {
        self.signal.clone()
    }
}

impl Stage for HttpConnectHandshake {
    fn handler_removed(&self, ctx: &StageContext) {
        self.abort(
            ctx,
            ConnectError::Handshake("handshake codec removed before completion".into())
                .into_cause(),
        );
    }

    fn connect(
        &self,
        ctx: &StageContext,
        remote: RemoteAddress,
        local: Option<SocketAddr>,
        promise: Promise,
    ) {
        let Some(authority) = remote.authority() else {
            let cause = ConnectError::UnsupportedAddress(remote.to_string()).into_cause();
            self.signal.try_failure(cause.clone());
            promise.try_failure(cause);
            return;
        };
        {
            let mut state = self.state.lock();
            if !matches!(*state, State::Idle) {
                drop(state);
                promise.try_failure(ConnectError::AlreadyConnected.into_cause());
                return;
            }
            *state = State::Connecting {
                authority,
                pending: Vec::new(),
            };
        }
        tracing::debug!(proxy = %self.proxy, target = %remote, "connecting to proxy");

        let signal = self.signal.clone();
        promise.add_listener(move |outcome| match outcome {
            Outcome::Success(()) => {}
            Outcome::Failure(cause) => {
                signal.try_failure(cause.clone());
            }
            Outcome::Cancelled => {
                signal.cancel();
            }
        });
        ctx.connect(self.proxy.clone(), local, promise);
    }

    fn write(&self, ctx: &StageContext, data: Bytes) {
        let mut state = self.state.lock();
        match &mut *state {
            State::Connecting { pending, .. } | State::AwaitingResponse { pending, .. } => {
                pending.push(data)
            }
            State::Failed => {
                tracing::trace!(len = data.len(), "write after failed handshake discarded")
            }
            State::Idle | State::Established => {
                drop(state);
                ctx.write(data)
            }
        }
    }

    fn channel_active(&self, ctx: &StageContext) {
        let authority = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::Failed) {
                State::Connecting { authority, pending } => {
                    *state = State::AwaitingResponse {
                        response: BytesMut::new(),
                        pending,
                    };
                    authority
                }
                State::Failed => return,
                other => {
                    *state = other;
                    drop(state);
                    ctx.fire_channel_active();
                    return;
                }
            }
        };
        tracing::debug!(proxy = %self.proxy, %authority, "sending CONNECT request");
        ctx.write(self.request(&authority));
    }

    fn channel_read(&self, ctx: &StageContext, data: Bytes) {
        let progress = {
            let mut state = self.state.lock();
            match &mut *state {
                State::AwaitingResponse { response, pending } => {
                    response.extend_from_slice(&data);
                    match parse_response(response) {
                        Ok(Some(leftover)) => {
                            let pending = std::mem::take(pending);
                            *state = State::Established;
                            Progress::Established { pending, leftover }
                        }
                        Ok(None) => Progress::Incomplete,
                        Err(err) => Progress::Rejected(err),
                    }
                }
                State::Idle | State::Established => {
                    drop(state);
                    ctx.fire_channel_read(data);
                    return;
                }
                State::Connecting { .. } | State::Failed => {
                    tracing::trace!(len = data.len(), "unexpected data during handshake discarded");
                    return;
                }
            }
        };
        match progress {
            Progress::Incomplete => {}
            Progress::Established { pending, leftover } => {
                tracing::debug!(proxy = %self.proxy, flushed = pending.len(), "proxy tunnel established");
                self.signal.try_success(());
                ctx.fire_channel_active();
                for data in pending {
                    ctx.write(data);
                }
                if !leftover.is_empty() {
                    ctx.fire_channel_read(leftover.freeze());
                }
            }
            Progress::Rejected(err) => {
                self.abort(ctx, err.into_cause());
            }
        }
    }

    fn channel_inactive(&self, ctx: &StageContext) {
        self.abort(ctx, ConnectError::ConnectionClosed.into_cause());
        ctx.fire_channel_inactive();
    }

    fn exception_caught(&self, ctx: &StageContext, cause: Cause) {
        if !self.abort(ctx, cause.clone()) {
            ctx.fire_exception_caught(cause);
        }
    }
}

/// Checks the buffered response head. Returns the bytes following the head once the proxy
/// accepted the tunnel.
fn parse_response(response: &mut BytesMut) -> Result<Option<BytesMut>, ConnectError> {
    let Some(end) = response.windows(4).position(|w| w == b"\r\n\r\n") else {
        if response.len() > MAX_RESPONSE_HEAD {
            return Err(ConnectError::Handshake(format!(
                "proxy response head exceeds {MAX_RESPONSE_HEAD} bytes"
            )));
        }
        return Ok(None);
    };
    let head = response.split_to(end + 4);
    let line_end = head.windows(2).position(|w| w == b"\r\n").unwrap_or(end);
    let line = String::from_utf8_lossy(&head[..line_end]);
    let mut parts = line.splitn(3, ' ');
    if !parts.next().is_some_and(|v| v.starts_with("HTTP/1.")) {
        return Err(ConnectError::Handshake(format!(
            "unexpected proxy response `{line}`"
        )));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| ConnectError::Handshake(format!("malformed status line `{line}`")))?;
    if !(200..300).contains(&status) {
        return Err(ConnectError::ProxyRejected {
            status,
            reason: parts.next().unwrap_or_default().trim().to_owned(),
        });
    }
    Ok(Some(std::mem::take(response)))
}
