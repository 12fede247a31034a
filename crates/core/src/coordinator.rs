//! Holds a channel's connect until a proxy handshake finishes.
//!
//! The [`HandshakeCoordinator`] is a single-use stage. When added to a pipeline it installs
//! its handshake engine as the [`HANDSHAKE_CODEC`] stage right in front of itself. A connect
//! passing through it is re-issued downward with a fresh inner attempt, and the caller's
//! promise is only completed once the engine reports the handshake outcome. After a
//! successful handshake the coordinator takes itself out of the pipeline, and the codec
//! follows when the coordinator is removed.
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::{
    address::{self, RemoteAddress},
    error::ConnectError,
    handshake::HandshakeStage,
    pipeline::{Pipeline, Stage, StageContext},
    promise::{Outcome, Promise},
};

/// Name of the handshake engine stage installed ahead of the coordinator.
pub const HANDSHAKE_CODEC: &str = "proxy-handshake-codec";

enum AttachState<E> {
    Unattached { engine: Arc<E> },
    Attached { signal: Promise },
    Detached,
}

pub struct HandshakeCoordinator<E> {
    state: Mutex<AttachState<E>>,
    removal_requested: Arc<AtomicBool>,
}

impl<E: HandshakeStage> HandshakeCoordinator<E> {
    pub fn new(engine: E) -> Self {
        Self {
            state: Mutex::new(AttachState::Unattached {
                engine: Arc::new(engine),
            }),
            removal_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Captures the engine's handshake signal and installs the engine right before this
    /// stage.
    pub fn attach(&self, ctx: &StageContext) -> Result<(), ConnectError> {
        let engine = match &*self.state.lock() {
            AttachState::Unattached { engine } => engine.clone(),
            AttachState::Attached { .. } | AttachState::Detached => {
                return Err(ConnectError::AlreadyAttached)
            }
        };
        let signal = engine.handshake_signal();
        ctx.pipeline().add_before(ctx.name(), HANDSHAKE_CODEC, engine)?;
        *self.state.lock() = AttachState::Attached { signal };
        Ok(())
    }

    /// Removes the handshake codec installed by [`attach`](Self::attach). A codec that is
    /// already gone is not an error, and a coordinator that never attached removes nothing.
    pub fn detach(&self, ctx: &StageContext) {
        let previous = std::mem::replace(&mut *self.state.lock(), AttachState::Detached);
        if !matches!(previous, AttachState::Attached { .. }) {
            return;
        }
        match ctx.pipeline().remove(HANDSHAKE_CODEC) {
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(stage = %ctx.name(), %err, "handshake codec already removed")
            }
        }
    }

    fn signal(&self) -> Option<Promise> {
        match &*self.state.lock() {
            AttachState::Attached { signal } => Some(signal.clone()),
            AttachState::Unattached { .. } | AttachState::Detached => None,
        }
    }
}

impl<E: HandshakeStage> Stage for HandshakeCoordinator<E> {
    fn handler_added(&self, ctx: &StageContext) -> Result<(), ConnectError> {
        self.attach(ctx)
    }

    fn handler_removed(&self, ctx: &StageContext) {
        self.detach(ctx)
    }

    fn connect(
        &self,
        ctx: &StageContext,
        remote: RemoteAddress,
        local: Option<SocketAddr>,
        outer: Promise,
    ) {
        let Some(signal) = self.signal() else {
            outer.try_failure(ConnectError::NotAttached.into_cause());
            return;
        };
        let remote = address::normalize(remote);
        tracing::debug!(stage = %ctx.name(), %remote, "connecting through proxy handshake");
        let inner = Promise::new();

        // caller cancellation reaches the transport attempt; closing the channel takes care
        // of anything already written
        let attempt = inner.clone();
        outer.add_listener(move |outcome| {
            if outcome.is_cancelled() && attempt.cancel() {
                tracing::trace!("outer connect cancelled, inner attempt cancelled");
            }
        });

        // the channel never became active, so there are no buffered writes to reconcile
        let caller = outer.clone();
        inner.add_listener(move |outcome| {
            if let Outcome::Failure(cause) = outcome {
                caller.try_failure(cause.clone());
            }
        });

        let caller = outer;
        let pipeline = ctx.pipeline().clone();
        let name = ctx.name().to_owned();
        let removal_requested = self.removal_requested.clone();
        signal.add_listener(move |outcome| match outcome {
            Outcome::Success(()) => {
                if caller.try_success(()) {
                    request_removal(&pipeline, name, &removal_requested);
                } else {
                    tracing::trace!(stage = %name, "handshake finished after connect was resolved");
                }
            }
            Outcome::Failure(cause) => {
                caller.try_failure(cause.clone());
            }
            Outcome::Cancelled => {
                caller.cancel();
            }
        });

        ctx.connect(remote, local, inner);
    }
}

/// Schedules removal of the coordinator stage on the channel's event loop, at most once.
fn request_removal(pipeline: &Pipeline, name: String, removal_requested: &AtomicBool) {
    if removal_requested.swap(true, Ordering::AcqRel) {
        return;
    }
    let job_pipeline = pipeline.clone();
    let scheduled = pipeline.channel().execute(move || {
        if let Err(err) = job_pipeline.remove(&name) {
            tracing::debug!(stage = %name, %err, "coordinator already removed");
        }
    });
    if let Err(err) = scheduled {
        tracing::debug!(%err, "could not schedule coordinator removal");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::{
        error::Cause,
        pipeline::{Channel, EventLoop},
    };

    /// Engine whose signal is driven by the test.
    struct ScriptedEngine {
        signal: Promise,
    }

    impl Stage for ScriptedEngine {}

    impl HandshakeStage for ScriptedEngine {
        fn handshake_signal(&self) -> Promise {
            self.signal.clone()
        }
    }

    /// Transport stand-in that records connects and keeps the attempts for the test.
    #[derive(Default)]
    struct FakeTransport {
        attempts: Mutex<Vec<(RemoteAddress, Promise)>>,
    }

    impl FakeTransport {
        fn attempt(&self) -> (RemoteAddress, Promise) {
            self.attempts.lock()[0].clone()
        }
    }

    impl Stage for FakeTransport {
        fn connect(
            &self,
            _ctx: &StageContext,
            remote: RemoteAddress,
            _local: Option<SocketAddr>,
            promise: Promise,
        ) {
            self.attempts.lock().push((remote, promise));
        }
    }

    /// Counts its own removal, used to check self-removal happens once.
    struct Counted<S> {
        inner: S,
        removed: Arc<AtomicUsize>,
    }

    impl<E: HandshakeStage> Stage for Counted<HandshakeCoordinator<E>> {
        fn handler_added(&self, ctx: &StageContext) -> Result<(), ConnectError> {
            self.inner.attach(ctx)
        }

        fn handler_removed(&self, ctx: &StageContext) {
            self.removed.fetch_add(1, Ordering::SeqCst);
            self.inner.detach(ctx)
        }

        fn connect(
            &self,
            ctx: &StageContext,
            remote: RemoteAddress,
            local: Option<SocketAddr>,
            promise: Promise,
        ) {
            self.inner.connect(ctx, remote, local, promise)
        }
    }

    struct Fixture {
        channel: Channel,
        transport: Arc<FakeTransport>,
        signal: Promise,
        removed: Arc<AtomicUsize>,
    }

    const COORDINATOR: &str = "proxy-coordinator";

    fn fixture() -> Fixture {
        let channel = Channel::new();
        let transport = Arc::new(FakeTransport::default());
        let signal = Promise::new();
        let removed = Arc::new(AtomicUsize::new(0));
        channel
            .pipeline()
            .add_last("transport", transport.clone())
            .unwrap();
        let coordinator = Counted {
            inner: HandshakeCoordinator::new(ScriptedEngine {
                signal: signal.clone(),
            }),
            removed: removed.clone(),
        };
        channel
            .pipeline()
            .add_last(COORDINATOR, Arc::new(coordinator))
            .unwrap();
        Fixture {
            channel,
            transport,
            signal,
            removed,
        }
    }

    fn example_address() -> RemoteAddress {
        RemoteAddress::resolved("example.com", SocketAddr::from(([93, 184, 216, 34], 443)))
    }

    #[tokio::test]
    async fn attach_installs_codec_before_coordinator() {
        let fx = fixture();
        assert_eq!(
            fx.channel.pipeline().names(),
            ["transport", HANDSHAKE_CODEC, COORDINATOR]
        );
    }

    #[tokio::test]
    async fn detach_twice_is_harmless() {
        let channel = Channel::new();
        let pipeline = channel.pipeline();
        let coordinator = Arc::new(HandshakeCoordinator::new(ScriptedEngine {
            signal: Promise::new(),
        }));
        pipeline.add_last(COORDINATOR, coordinator.clone()).unwrap();
        assert_eq!(pipeline.names(), [HANDSHAKE_CODEC, COORDINATOR]);

        let ctx = pipeline.context(COORDINATOR).unwrap();
        coordinator.detach(&ctx);
        assert_eq!(pipeline.names(), [COORDINATOR]);
        coordinator.detach(&ctx);
        assert_eq!(pipeline.names(), [COORDINATOR]);
    }

    #[tokio::test]
    async fn connect_forwards_normalized_address() {
        let fx = fixture();
        let outer = fx.channel.connect(example_address(), None);
        fx.channel.sync().await.unwrap();

        let (remote, inner) = fx.transport.attempt();
        assert_eq!(remote, RemoteAddress::unresolved("example.com", 443));
        assert!(!inner.is_done());
        assert!(!outer.is_done());
    }

    #[tokio::test]
    async fn handshake_success_completes_and_removes_once() {
        let fx = fixture();
        let outer = fx.channel.connect(example_address(), None);
        fx.channel.sync().await.unwrap();
        let (_, inner) = fx.transport.attempt();

        inner.try_success(());
        assert!(!outer.is_done(), "transport connect alone must not satisfy the caller");

        fx.signal.try_success(());
        assert!(outer.is_success());
        fx.channel.sync().await.unwrap();

        assert_eq!(fx.removed.load(Ordering::SeqCst), 1);
        assert_eq!(fx.channel.pipeline().names(), ["transport"]);

        // late completions are no-ops
        assert!(!outer.cancel());
        fx.channel.sync().await.unwrap();
        assert_eq!(fx.removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_after_cancel_keeps_stage() {
        let fx = fixture();
        let outer = fx.channel.connect(example_address(), None);
        fx.channel.sync().await.unwrap();
        let (_, inner) = fx.transport.attempt();

        assert!(outer.cancel());
        assert!(inner.is_cancelled());

        fx.signal.try_success(());
        fx.channel.sync().await.unwrap();
        assert!(outer.is_cancelled());
        assert_eq!(fx.removed.load(Ordering::SeqCst), 0);
        assert!(fx.channel.pipeline().contains(COORDINATOR));
    }

    #[tokio::test]
    async fn handshake_failure_carries_identical_cause() {
        let fx = fixture();
        let outer = fx.channel.connect(example_address(), None);
        fx.channel.sync().await.unwrap();

        let cause: Cause = ConnectError::Handshake("proxy said no".into()).into_cause();
        fx.signal.try_failure(cause.clone());

        let seen = outer.outcome().and_then(|o| o.cause().cloned()).unwrap();
        assert!(Arc::ptr_eq(&seen, &cause));
        fx.channel.sync().await.unwrap();
        assert_eq!(fx.removed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn inner_failure_fails_outer_with_same_cause() {
        let fx = fixture();
        let outer = fx.channel.connect(example_address(), None);
        fx.channel.sync().await.unwrap();
        let (_, inner) = fx.transport.attempt();

        let cause = ConnectError::ConnectionClosed.into_cause();
        inner.try_failure(cause.clone());
        let seen = outer.outcome().and_then(|o| o.cause().cloned()).unwrap();
        assert!(Arc::ptr_eq(&seen, &cause));

        // the engine reporting the same failure afterwards changes nothing
        fx.signal.try_failure(ConnectError::Handshake("late".into()).into_cause());
        let seen = outer.outcome().and_then(|o| o.cause().cloned()).unwrap();
        assert!(Arc::ptr_eq(&seen, &cause));
    }

    #[tokio::test]
    async fn cancel_before_handshake_blocks_later_outcomes() {
        let fx = fixture();
        let outer = fx.channel.connect(example_address(), None);
        fx.channel.sync().await.unwrap();
        let (_, inner) = fx.transport.attempt();

        outer.cancel();
        assert!(inner.is_cancelled());
        fx.signal
            .try_failure(ConnectError::ConnectionClosed.into_cause());
        assert!(outer.is_cancelled());
    }

    #[tokio::test]
    async fn signal_completed_from_foreign_task() {
        let fx = fixture();
        let outer = fx.channel.connect(example_address(), None);
        fx.channel.sync().await.unwrap();

        let signal = fx.signal.clone();
        tokio::spawn(async move {
            signal.try_success(());
        })
        .await
        .unwrap();

        assert!(outer.wait().await.is_success());
        fx.channel.sync().await.unwrap();
        assert_eq!(fx.removed.load(Ordering::SeqCst), 1);
        assert!(!fx.channel.pipeline().contains(HANDSHAKE_CODEC));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn racing_cancel_and_success_resolve_once() {
        for _ in 0..32 {
            let fx = fixture();
            let outer = fx.channel.connect(example_address(), None);
            fx.channel.sync().await.unwrap();

            let signal = fx.signal.clone();
            let canceller = outer.clone();
            let a = tokio::spawn(async move { signal.try_success(()) });
            let b = tokio::spawn(async move { canceller.cancel() });
            a.await.unwrap();
            b.await.unwrap();
            fx.channel.sync().await.unwrap();

            let removed = fx.removed.load(Ordering::SeqCst);
            if outer.is_success() {
                assert_eq!(removed, 1);
            } else {
                assert!(outer.is_cancelled());
                assert_eq!(removed, 0);
            }
        }
    }

    #[test]
    fn connect_without_attach_fails() {
        let (_event_loop, handle) = EventLoop::new();
        let pipeline = Pipeline::new(handle);
        pipeline.add_last("plain", Arc::new(FakeTransport::default())).unwrap();
        let ctx = pipeline.context("plain").unwrap();

        let coordinator = HandshakeCoordinator::new(ScriptedEngine {
            signal: Promise::new(),
        });
        let outer = Promise::new();
        coordinator.connect(&ctx, example_address(), None, outer.clone());
        let cause = outer.outcome().and_then(|o| o.cause().cloned()).unwrap();
        assert!(matches!(*cause, ConnectError::NotAttached));
    }

    #[tokio::test]
    async fn second_attach_is_rejected() {
        let fx = fixture();
        let ctx = fx.channel.pipeline().context(COORDINATOR).unwrap();
        let coordinator = HandshakeCoordinator::new(ScriptedEngine {
            signal: Promise::new(),
        });
        assert!(matches!(
            coordinator.attach(&ctx),
            Err(ConnectError::DuplicateStage(_))
        ));
        coordinator.detach(&ctx);
        assert_eq!(
            fx.channel.pipeline().names(),
            ["transport", HANDSHAKE_CODEC, COORDINATOR]
        );
        assert!(matches!(
            coordinator.attach(&ctx),
            Err(ConnectError::AlreadyAttached)
        ));
    }

    #[tokio::test]
    async fn unattached_detach_leaves_foreign_codec() {
        let fx = fixture();
        let ctx = fx.channel.pipeline().context(COORDINATOR).unwrap();
        let stranger = HandshakeCoordinator::new(ScriptedEngine {
            signal: Promise::new(),
        });
        stranger.detach(&ctx);
        stranger.detach(&ctx);
        assert!(fx.channel.pipeline().contains(HANDSHAKE_CODEC));
        assert_eq!(fx.removed.load(Ordering::SeqCst), 0);
    }
}
