// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{
    client::Grpc,
    codec::{ProstCodec, Streaming},
    codegen::http::uri::PathAndQuery,
    transport::{Channel, Endpoint},
    Request,
};
use tracing::{debug, instrument};

use crate::{
    CanaryConnection, CanaryStream, Dialer, UidmapCanaryRequest, UidmapCanaryResponse,
    WorkspaceHandle, CANARY_METHOD_PATH,
};

/// Dials the in-workspace agent over gRPC.
pub struct TonicDialer {
    port: u16,
    connect_timeout: Duration,
}

impl TonicDialer {
    pub fn new(port: u16, connect_timeout: Duration) -> Self {
        Self {
            port,
            connect_timeout,
        }
    }
}

#[async_trait]
impl Dialer for TonicDialer {
    #[instrument(skip_all, fields(address = %workspace.agent_address, port = self.port))]
    async fn dial(&self, workspace: &WorkspaceHandle) -> Result<Box<dyn CanaryConnection>> {
        let uri = format!("http://{}:{}", workspace.agent_address, self.port);
        let channel = Endpoint::from_shared(uri.clone())
            .with_context(|| format!("Invalid agent address {uri}"))?
            .connect_timeout(self.connect_timeout)
            .connect()
            .await
            .with_context(|| format!("Failed to connect to {uri}"))?;
        debug!("Connected to in-workspace agent");
        Ok(Box::new(TonicConnection {
            grpc: Grpc::new(channel),
        }))
    }
}

struct TonicConnection {
    grpc: Grpc<Channel>,
}

#[async_trait]
impl CanaryConnection for TonicConnection {
    async fn open_stream(&mut self) -> Result<Box<dyn CanaryStream>> {
        self.grpc
            .ready()
            .await
            .context("Agent connection is not ready")?;

        // Responses are produced one at a time, so a single slot is enough.
        let (tx, rx) = mpsc::channel(1);
        let codec: ProstCodec<UidmapCanaryResponse, UidmapCanaryRequest> = ProstCodec::default();
        let response = self
            .grpc
            .streaming(
                Request::new(ReceiverStream::new(rx)),
                PathAndQuery::from_static(CANARY_METHOD_PATH),
                codec,
            )
            .await
            .context("Failed to open canary stream")?;

        Ok(Box::new(TonicStream {
            requests: response.into_inner(),
            responses: tx,
        }))
    }
}

struct TonicStream {
    requests: Streaming<UidmapCanaryRequest>,
    responses: mpsc::Sender<UidmapCanaryResponse>,
}

#[async_trait]
impl CanaryStream for TonicStream {
    async fn recv(&mut self) -> Result<Option<UidmapCanaryRequest>> {
        self.requests
            .message()
            .await
            .context("Failed to receive canary request")
    }

    async fn send(&mut self, response: UidmapCanaryResponse) -> Result<()> {
        self.responses
            .send(response)
            .await
            .map_err(|_| anyhow!("Canary stream closed before the response was sent"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace(agent_address: &str) -> WorkspaceHandle {
        WorkspaceHandle {
            workspace_id: "workspace-1".into(),
            instance_id: "instance-1".into(),
            container_id: "container-1".into(),
            agent_address: agent_address.into(),
        }
    }

    #[tokio::test]
    async fn test_dial_refused() -> Result<()> {
        // Grab a free port and release it so nothing listens there.
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        drop(listener);

        let dialer = TonicDialer::new(port, Duration::from_secs(5));
        let err = dialer
            .dial(&workspace("127.0.0.1"))
            .await
            .err()
            .context("dial unexpectedly succeeded")?;
        assert!(
            format!("{err:#}").contains("Failed to connect"),
            "{err:#}"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_dial_invalid_address() -> Result<()> {
        let dialer = TonicDialer::new(22999, Duration::from_secs(5));
        let err = dialer
            .dial(&workspace("not a host"))
            .await
            .err()
            .context("dial unexpectedly succeeded")?;
        assert!(
            format!("{err:#}").contains("Invalid agent address"),
            "{err:#}"
        );
        Ok(())
    }
}
