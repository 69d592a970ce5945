// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    CanaryPolicy, Event, MappingHandler, State, UidmapCanaryRequest, UidmapCanaryResponse,
    WorkspaceHandle,
};

/// An open canary stream to the in-workspace agent.
#[async_trait]
pub trait CanaryStream: Send {
    /// Receives the next request. Returns `None` once the agent closed the
    /// stream.
    async fn recv(&mut self) -> Result<Option<UidmapCanaryRequest>>;

    async fn send(&mut self, response: UidmapCanaryResponse) -> Result<()>;
}

/// A connection to the in-workspace agent.
#[async_trait]
pub trait CanaryConnection: Send {
    async fn open_stream(&mut self) -> Result<Box<dyn CanaryStream>>;
}

/// Connects to the in-workspace agent of a workspace.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, workspace: &WorkspaceHandle) -> Result<Box<dyn CanaryConnection>>;
}

/// Waits between sessions.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// Serves the ID mapper canary of one workspace.
///
/// The canary is reachable by code running inside the workspace, so the
/// daemon only ever serves a bounded number of requests per stream. After
/// that the stream is closed and reopened after a delay, which caps the rate
/// at which a workspace can hit the privileged mapping path.
pub struct CanarySession {
    workspace: WorkspaceHandle,
    handler: MappingHandler,
    dialer: Arc<dyn Dialer>,
    sleeper: Arc<dyn Sleeper>,
    policy: CanaryPolicy,
}

impl CanarySession {
    pub fn new(
        workspace: WorkspaceHandle,
        handler: MappingHandler,
        dialer: Arc<dyn Dialer>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let policy = CanaryPolicy::from(&handler.config().canary);
        Self {
            workspace,
            handler,
            dialer,
            sleeper,
            policy,
        }
    }

    /// Runs sessions back to back until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let span = info_span!(
            "canary",
            workspace_id = %self.workspace.workspace_id,
            instance_id = %self.workspace.instance_id,
            container_id = %self.workspace.container_id,
        );
        async move {
            info!("Starting ID mapper canary");
            self.run_loop(&cancel).await;
            info!("Stopped ID mapper canary");
        }
        .instrument(span)
        .await
    }

    async fn run_loop(&self, cancel: &CancellationToken) {
        let mut state = State::Idle;
        let mut event = Event::Start;
        let mut connection: Option<Box<dyn CanaryConnection>> = None;
        let mut stream: Option<Box<dyn CanaryStream>> = None;

        loop {
            let (next, delay) = self.policy.next(state, event);
            debug!(?state, ?event, ?next, "Canary transition");
            state = next;

            event = match state {
                State::Done => break,
                State::Idle => Event::Start,
                State::Dialing => self.dial(cancel, &mut connection).await,
                State::Established => match connection.as_mut() {
                    Some(c) => self.open_stream(cancel, &mut **c, &mut stream).await,
                    None => Event::StreamFailed,
                },
                State::Serving { .. } => match stream.as_mut() {
                    Some(s) => self.serve_one(cancel, &mut **s).await,
                    None => Event::StreamFailed,
                },
                State::Closing { .. } => {
                    stream = None;
                    connection = None;
                    Event::StreamClosed
                }
                State::Backoff => {
                    self.wait(cancel, delay.unwrap_or(self.policy.reconnect_delay))
                        .await
                }
            };
        }
    }

    async fn dial(
        &self,
        cancel: &CancellationToken,
        connection: &mut Option<Box<dyn CanaryConnection>>,
    ) -> Event {
        if cancel.is_cancelled() {
            return Event::Cancelled;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Event::Cancelled,
            result = self.dialer.dial(&self.workspace) => match result {
                Ok(c) => {
                    *connection = Some(c);
                    Event::DialSucceeded
                }
                Err(e) => {
                    warn!("Cannot connect to workspace: {:#}", e);
                    Event::DialFailed
                }
            },
        }
    }

    async fn open_stream(
        &self,
        cancel: &CancellationToken,
        connection: &mut dyn CanaryConnection,
        stream: &mut Option<Box<dyn CanaryStream>>,
    ) -> Event {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Event::Cancelled,
            result = connection.open_stream() => match result {
                Ok(s) => {
                    *stream = Some(s);
                    Event::StreamOpened
                }
                Err(e) => {
                    warn!("Cannot open canary stream: {:#}", e);
                    Event::StreamFailed
                }
            },
        }
    }

    async fn serve_one(&self, cancel: &CancellationToken, stream: &mut dyn CanaryStream) -> Event {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Event::Cancelled,
            received = stream.recv() => received,
        };
        let request = match received {
            Ok(Some(request)) => request,
            Ok(None) => {
                info!("Canary stream closed by workspace");
                return Event::StreamFailed;
            }
            Err(e) => {
                warn!("Canary stream failed: {:#}", e);
                return Event::StreamFailed;
            }
        };

        let response = self
            .handler
            .respond(&self.workspace.container_id, &request, cancel)
            .await;
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Event::Cancelled,
            sent = stream.send(response) => sent,
        };
        if let Err(e) = sent {
            warn!("Cannot send canary response: {:#}", e);
            return Event::StreamFailed;
        }
        Event::RequestServed
    }

    async fn wait(&self, cancel: &CancellationToken, delay: Duration) -> Event {
        debug!("Reconnecting in {:?}", delay);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Event::Cancelled,
            _ = self.sleeper.sleep(delay) => Event::DelayElapsed,
        }
    }
}
