//! Ordered, named processing stages of a channel.
//!
//! Outbound operations (`connect`, `write`, `close`) travel from the tail toward the head,
//! where the transport sits. Inbound events (`channel_active`, `channel_read`, ...) travel
//! from the head toward the tail. Stages can be inserted relative to each other by name and
//! removed by name; the list is never locked while a stage callback runs, so callbacks may
//! mutate the pipeline freely.
use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use parking_lot::RwLock;

use crate::{
    address::RemoteAddress,
    error::{Cause, ConnectError},
    promise::Promise,
};

mod event_loop;
pub use event_loop::{ChannelHandle, EventLoop};

/// A unit of the pipeline.
///
/// Every callback has a pass-through default so implementors only override what they
/// intercept.
pub trait Stage: Send + Sync + 'static {
    /// Called once the stage is in the pipeline. Returning an error takes it out again.
    fn handler_added(&self, _ctx: &StageContext) -> Result<(), ConnectError> {
        Ok(())
    }

    /// Called once the stage left the pipeline.
    fn handler_removed(&self, _ctx: &StageContext) {}

    fn connect(
        &self,
        ctx: &StageContext,
        remote: RemoteAddress,
        local: Option<SocketAddr>,
        promise: Promise,
    ) {
        ctx.connect(remote, local, promise)
    }

    fn write(&self, ctx: &StageContext, data: Bytes) {
        ctx.write(data)
    }

    fn close(&self, ctx: &StageContext) {
        ctx.close()
    }

    fn channel_active(&self, ctx: &StageContext) {
        ctx.fire_channel_active()
    }

    fn channel_read(&self, ctx: &StageContext, data: Bytes) {
        ctx.fire_channel_read(data)
    }

    fn channel_inactive(&self, ctx: &StageContext) {
        ctx.fire_channel_inactive()
    }

    fn exception_caught(&self, ctx: &StageContext, cause: Cause) {
        ctx.fire_exception_caught(cause)
    }
}

struct Entry {
    name: String,
    stage: Arc<dyn Stage>,
}

#[derive(Clone, Copy)]
enum Direction {
    /// Toward the head.
    Outbound,
    /// Toward the tail.
    Inbound,
}

enum Step {
    Next(StageContext, Arc<dyn Stage>),
    /// Fell off the end of the pipeline.
    Boundary,
    /// The originating stage is no longer in the pipeline.
    Detached,
}

#[derive(Clone)]
pub struct Pipeline {
    stages: Arc<RwLock<Vec<Entry>>>,
    channel: ChannelHandle,
}

impl Pipeline {
    pub fn new(channel: ChannelHandle) -> Self {
        Self {
            stages: Arc::new(RwLock::new(Vec::new())),
            channel,
        }
    }

    pub fn channel(&self) -> &ChannelHandle {
        &self.channel
    }

    /// Stage names from head to tail.
    pub fn names(&self) -> Vec<String> {
        self.stages.read().iter().map(|e| e.name.clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stages.read().iter().any(|e| e.name == name)
    }

    /// Context of the stage called `name`, if present.
    pub fn context(&self, name: &str) -> Option<StageContext> {
        self.contains(name).then(|| self.context_for(name.to_owned()))
    }

    pub fn add_last(
        &self,
        name: impl Into<String>,
        stage: Arc<dyn Stage>,
    ) -> Result<(), ConnectError> {
        let name = name.into();
        {
            let mut stages = self.stages.write();
            if stages.iter().any(|e| e.name == name) {
                return Err(ConnectError::DuplicateStage(name));
            }
            stages.push(Entry {
                name: name.clone(),
                stage: stage.clone(),
            });
        }
        self.added(name, stage)
    }

    /// Inserts `stage` immediately before (closer to the head than) the stage called `base`.
    pub fn add_before(
        &self,
        base: &str,
        name: impl Into<String>,
        stage: Arc<dyn Stage>,
    ) -> Result<(), ConnectError> {
        let name = name.into();
        {
            let mut stages = self.stages.write();
            if stages.iter().any(|e| e.name == name) {
                return Err(ConnectError::DuplicateStage(name));
            }
            let pos = stages
                .iter()
                .position(|e| e.name == base)
                .ok_or_else(|| ConnectError::StageNotFound(base.to_owned()))?;
            stages.insert(
                pos,
                Entry {
                    name: name.clone(),
                    stage: stage.clone(),
                },
            );
        }
        self.added(name, stage)
    }

    pub fn remove(&self, name: &str) -> Result<Arc<dyn Stage>, ConnectError> {
        let entry = {
            let mut stages = self.stages.write();
            let pos = stages
                .iter()
                .position(|e| e.name == name)
                .ok_or_else(|| ConnectError::StageNotFound(name.to_owned()))?;
            stages.remove(pos)
        };
        tracing::debug!(stage = %entry.name, "stage removed");
        entry.stage.handler_removed(&self.context_for(entry.name.clone()));
        Ok(entry.stage)
    }

    /// Issues a connect from the tail of the pipeline.
    pub fn connect(&self, remote: RemoteAddress, local: Option<SocketAddr>, promise: Promise) {
        match self.tail() {
            Some((ctx, stage)) => stage.connect(&ctx, remote, local, promise),
            None => {
                promise.try_failure(ConnectError::NoTransport("connect").into_cause());
            }
        }
    }

    pub fn write(&self, data: Bytes) {
        match self.tail() {
            Some((ctx, stage)) => stage.write(&ctx, data),
            None => tracing::trace!(len = data.len(), "write on an empty pipeline discarded"),
        }
    }

    pub fn close(&self) {
        if let Some((ctx, stage)) = self.tail() {
            stage.close(&ctx)
        }
    }

    pub fn fire_channel_active(&self) {
        if let Some((ctx, stage)) = self.head() {
            stage.channel_active(&ctx)
        }
    }

    pub fn fire_channel_read(&self, data: Bytes) {
        match self.head() {
            Some((ctx, stage)) => stage.channel_read(&ctx, data),
            None => tracing::trace!(len = data.len(), "read on an empty pipeline discarded"),
        }
    }

    pub fn fire_channel_inactive(&self) {
        if let Some((ctx, stage)) = self.head() {
            stage.channel_inactive(&ctx)
        }
    }

    pub fn fire_exception_caught(&self, cause: Cause) {
        match self.head() {
            Some((ctx, stage)) => stage.exception_caught(&ctx, cause),
            None => tracing::warn!(%cause, "exception on an empty pipeline"),
        }
    }

    fn added(&self, name: String, stage: Arc<dyn Stage>) -> Result<(), ConnectError> {
        tracing::debug!(stage = %name, "stage added");
        if let Err(err) = stage.handler_added(&self.context_for(name.clone())) {
            tracing::debug!(stage = %name, %err, "stage rejected its insertion");
            self.stages.write().retain(|e| e.name != name);
            return Err(err);
        }
        Ok(())
    }

    fn context_for(&self, name: String) -> StageContext {
        StageContext {
            name,
            pipeline: self.clone(),
        }
    }

    fn head(&self) -> Option<(StageContext, Arc<dyn Stage>)> {
        let stages = self.stages.read();
        stages
            .first()
            .map(|e| (self.context_for(e.name.clone()), e.stage.clone()))
    }

    fn tail(&self) -> Option<(StageContext, Arc<dyn Stage>)> {
        let stages = self.stages.read();
        stages
            .last()
            .map(|e| (self.context_for(e.name.clone()), e.stage.clone()))
    }

    fn step(&self, from: &str, direction: Direction) -> Step {
        let stages = self.stages.read();
        let Some(pos) = stages.iter().position(|e| e.name == from) else {
            return Step::Detached;
        };
        let next = match direction {
            Direction::Outbound => pos.checked_sub(1),
            Direction::Inbound => Some(pos + 1).filter(|i| *i < stages.len()),
        };
        match next.map(|i| &stages[i]) {
            Some(entry) => Step::Next(self.context_for(entry.name.clone()), entry.stage.clone()),
            None => Step::Boundary,
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// A stage's view of the pipeline it lives in.
#[derive(Clone)]
pub struct StageContext {
    name: String,
    pipeline: Pipeline,
}

impl StageContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn channel(&self) -> &ChannelHandle {
        self.pipeline.channel()
    }

    pub fn connect(&self, remote: RemoteAddress, local: Option<SocketAddr>, promise: Promise) {
        match self.pipeline.step(&self.name, Direction::Outbound) {
            Step::Next(ctx, stage) => stage.connect(&ctx, remote, local, promise),
            Step::Boundary => {
                promise.try_failure(ConnectError::NoTransport("connect").into_cause());
            }
            Step::Detached => {
                promise.try_failure(ConnectError::StageNotFound(self.name.clone()).into_cause());
            }
        }
    }

    pub fn write(&self, data: Bytes) {
        match self.pipeline.step(&self.name, Direction::Outbound) {
            Step::Next(ctx, stage) => stage.write(&ctx, data),
            Step::Boundary | Step::Detached => {
                tracing::trace!(stage = %self.name, len = data.len(), "write discarded")
            }
        }
    }

    pub fn close(&self) {
        if let Step::Next(ctx, stage) = self.pipeline.step(&self.name, Direction::Outbound) {
            stage.close(&ctx)
        }
    }

    pub fn fire_channel_active(&self) {
        if let Step::Next(ctx, stage) = self.pipeline.step(&self.name, Direction::Inbound) {
            stage.channel_active(&ctx)
        }
    }

    pub fn fire_channel_read(&self, data: Bytes) {
        match self.pipeline.step(&self.name, Direction::Inbound) {
            Step::Next(ctx, stage) => stage.channel_read(&ctx, data),
            Step::Boundary | Step::Detached => {
                tracing::trace!(stage = %self.name, len = data.len(), "inbound data discarded")
            }
        }
    }

    pub fn fire_channel_inactive(&self) {
        if let Step::Next(ctx, stage) = self.pipeline.step(&self.name, Direction::Inbound) {
            stage.channel_inactive(&ctx)
        }
    }

    pub fn fire_exception_caught(&self, cause: Cause) {
        match self.pipeline.step(&self.name, Direction::Inbound) {
            Step::Next(ctx, stage) => stage.exception_caught(&ctx, cause),
            Step::Boundary | Step::Detached => {
                tracing::warn!(stage = %self.name, %cause, "unhandled exception in pipeline")
            }
        }
    }
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("name", &self.name)
            .finish()
    }
}

/// A pipeline bound to its own event loop.
pub struct Channel {
    pipeline: Pipeline,
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel {
    /// Creates a channel and spawns its event loop on the current tokio runtime.
    pub fn new() -> Self {
        let (event_loop, handle) = EventLoop::new();
        tokio::spawn(event_loop.run());
        Self {
            pipeline: Pipeline::new(handle),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn handle(&self) -> &ChannelHandle {
        self.pipeline.channel()
    }

    /// Schedules a connect on the event loop. The outcome is observed on the returned promise.
    pub fn connect(&self, remote: RemoteAddress, local: Option<SocketAddr>) -> Promise {
        let promise = Promise::new();
        self.connect_with(remote, local, promise.clone());
        promise
    }

    pub fn connect_with(&self, remote: RemoteAddress, local: Option<SocketAddr>, promise: Promise) {
        let pipeline = self.pipeline.clone();
        let job_promise = promise.clone();
        if let Err(err) = self
            .handle()
            .execute(move || pipeline.connect(remote, local, job_promise))
        {
            promise.try_failure(err.into_cause());
        }
    }

    /// Like [`Channel::connect`], cancelling the returned promise if it has not completed
    /// within `timeout`.
    pub fn connect_timeout(
        &self,
        remote: RemoteAddress,
        local: Option<SocketAddr>,
        timeout: Duration,
    ) -> Promise {
        let promise = self.connect(remote, local);
        let deadline = promise.clone();
        tokio::spawn(async move {
            if tokio::time::timeout(timeout, deadline.wait()).await.is_err() && deadline.cancel()
            {
                tracing::debug!(?timeout, "connect cancelled after timeout");
            }
        });
        promise
    }

    pub fn write(&self, data: Bytes) -> Result<(), ConnectError> {
        let pipeline = self.pipeline.clone();
        self.handle().execute(move || pipeline.write(data))
    }

    pub fn close(&self) -> Result<(), ConnectError> {
        let pipeline = self.pipeline.clone();
        self.handle().execute(move || pipeline.close())
    }

    /// Waits until every job scheduled so far has run.
    pub async fn sync(&self) -> Result<(), ConnectError> {
        self.handle().sync().await
    }
}

/// Closing on drop lets the transport report the channel inactive, which settles any
/// handshake still holding on to the pipeline.
impl Drop for Channel {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::trace!(%err, "channel dropped after its event loop stopped");
        }
    }
}
