use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpSocket, TcpStream},
    sync::mpsc,
};

use crate::{
    address::RemoteAddress,
    error::ConnectError,
    pipeline::{Pipeline, Stage, StageContext},
    promise::Promise,
};

const READ_BUFFER: usize = 16 * 1024;

enum Command {
    Write(Bytes),
    Close,
}

enum Connection {
    Idle,
    Open(mpsc::UnboundedSender<Command>),
    Closed,
}

/// Pipeline head backed by a tokio TCP stream.
///
/// The socket is driven by its own task. Inbound data and state changes are fed back into
/// the pipeline as jobs on the channel's event loop.
pub struct TcpTransport {
    connection: Mutex<Connection>,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            connection: Mutex::new(Connection::Idle),
        }
    }

    fn send(&self, command: Command) -> bool {
        match &*self.connection.lock() {
            Connection::Open(commands) => commands.send(command).is_ok(),
            Connection::Idle | Connection::Closed => false,
        }
    }
}

impl Stage for TcpTransport {
    fn connect(
        &self,
        ctx: &StageContext,
        remote: RemoteAddress,
        local: Option<SocketAddr>,
        promise: Promise,
    ) {
        let commands = {
            let mut connection = self.connection.lock();
            if !matches!(*connection, Connection::Idle) {
                drop(connection);
                promise.try_failure(ConnectError::AlreadyConnected.into_cause());
                return;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            *connection = Connection::Open(tx);
            rx
        };
        let pipeline = ctx.pipeline().clone();
        tokio::spawn(async move {
            let stream = tokio::select! {
                stream = open_stream(&remote, local) => stream,
                _ = promise.wait() => {
                    tracing::debug!(%remote, "connect attempt abandoned");
                    return;
                }
            };
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::debug!(%remote, %err, "connect failed");
                    promise.try_failure(err.into_cause());
                    return;
                }
            };
            if !promise.try_success(()) {
                tracing::debug!(%remote, "connected after the attempt was resolved, dropping");
                return;
            }
            tracing::debug!(%remote, local = ?stream.local_addr().ok(), "connected");
            schedule(&pipeline, Pipeline::fire_channel_active);
            pump(stream, commands, &pipeline).await;
            schedule(&pipeline, Pipeline::fire_channel_inactive);
        });
    }

    fn write(&self, _ctx: &StageContext, data: Bytes) {
        let len = data.len();
        if !self.send(Command::Write(data)) {
            tracing::trace!(len, "write on a closed transport discarded");
        }
    }

    fn close(&self, _ctx: &StageContext) {
        self.send(Command::Close);
        *self.connection.lock() = Connection::Closed;
    }
}

async fn open_stream(
    remote: &RemoteAddress,
    local: Option<SocketAddr>,
) -> Result<TcpStream, ConnectError> {
    let target = match remote {
        RemoteAddress::Resolved { addr, .. } => *addr,
        RemoteAddress::Unresolved { host, port } => tokio::net::lookup_host((host.as_str(), *port))
            .await?
            .next()
            .ok_or_else(|| ConnectError::Unresolvable(remote.to_string()))?,
        RemoteAddress::Unix(_) => return Err(ConnectError::UnsupportedAddress(remote.to_string())),
    };
    let socket = if target.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(local) = local {
        socket.bind(local)?;
    }
    Ok(socket.connect(target).await?)
}

async fn pump(
    stream: TcpStream,
    mut commands: mpsc::UnboundedReceiver<Command>,
    pipeline: &Pipeline,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = BytesMut::with_capacity(READ_BUFFER);
    loop {
        buf.reserve(READ_BUFFER);
        tokio::select! {
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => break,
                Ok(_) => {
                    let data = buf.split().freeze();
                    schedule(pipeline, move |p| p.fire_channel_read(data));
                }
                Err(err) => {
                    let cause = ConnectError::from(err).into_cause();
                    schedule(pipeline, move |p| p.fire_exception_caught(cause));
                    break;
                }
            },
            command = commands.recv() => match command {
                Some(Command::Write(data)) => {
                    if let Err(err) = writer.write_all(&data).await {
                        let cause = ConnectError::from(err).into_cause();
                        schedule(pipeline, move |p| p.fire_exception_caught(cause));
                        break;
                    }
                }
                Some(Command::Close) | None => break,
            },
        }
    }
    if let Err(err) = writer.shutdown().await {
        tracing::trace!(%err, "shutdown of closed socket");
    }
}

fn schedule<F>(pipeline: &Pipeline, job: F)
where
    F: FnOnce(&Pipeline) + Send + 'static,
{
    let target = pipeline.clone();
    if pipeline.channel().execute(move || job(&target)).is_err() {
        tracing::trace!("channel event loop gone, transport event dropped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::net::TcpListener;

    use super::*;
    use crate::pipeline::Channel;

    #[derive(Default)]
    struct Sink {
        read: Mutex<Vec<u8>>,
        active: Mutex<bool>,
        inactive: Mutex<bool>,
    }

    impl Stage for Sink {
        fn channel_active(&self, _ctx: &StageContext) {
            *self.active.lock() = true;
        }

        fn channel_read(&self, _ctx: &StageContext, data: Bytes) {
            self.read.lock().extend_from_slice(&data);
        }

        fn channel_inactive(&self, _ctx: &StageContext) {
            *self.inactive.lock() = true;
        }
    }

    #[tokio::test]
    async fn echoes_over_loopback() -> testresult::TestResult {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await?;
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await?;
            socket.write_all(&buf).await?;
            Ok::<_, std::io::Error>(())
        });

        let channel = Channel::new();
        let sink = Arc::new(Sink::default());
        channel
            .pipeline()
            .add_last("tcp", Arc::new(TcpTransport::new()))?;
        channel.pipeline().add_last("sink", sink.clone())?;

        let promise = channel.connect(addr.into(), None);
        assert!(promise.wait().await.is_success());
        channel.write(Bytes::from_static(b"ping"))?;
        server.await??;

        for _ in 0..100 {
            channel.sync().await?;
            if *sink.inactive.lock() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(*sink.active.lock());
        assert_eq!(sink.read.lock().as_slice(), b"ping");
        assert!(*sink.inactive.lock());
        Ok(())
    }

    #[tokio::test]
    async fn refused_connect_fails_promise() -> testresult::TestResult {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        drop(listener);

        let channel = Channel::new();
        channel
            .pipeline()
            .add_last("tcp", Arc::new(TcpTransport::new()))?;
        let outcome = channel.connect(addr.into(), None).wait().await;
        assert!(matches!(
            outcome.cause().map(|c| &**c),
            Some(ConnectError::Transport(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn unix_address_is_unsupported() -> testresult::TestResult {
        let channel = Channel::new();
        channel
            .pipeline()
            .add_last("tcp", Arc::new(TcpTransport::new()))?;
        let outcome = channel
            .connect(RemoteAddress::Unix("/tmp/none.sock".into()), None)
            .wait()
            .await;
        assert!(matches!(
            outcome.cause().map(|c| &**c),
            Some(ConnectError::UnsupportedAddress(_))
        ));
        Ok(())
    }
}
