// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use idmapping::{
    find_host_pid, validate_mapping, write_mapping, HostPidNotFound, MapperConfig,
    ValidationError,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{ContainerRuntime, UidmapCanaryRequest, UidmapCanaryResponse};

/// Why a mapping request was not fulfilled.
///
/// The `Display` form is sent back to the workspace, so variants wrapping
/// internal errors only render a fixed message.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Resolution(#[from] HostPidNotFound),
    #[error("cannot write ID mapping")]
    Write(anyhow::Error),
    #[error("workspace is shutting down")]
    Cancelled,
    #[error("internal error")]
    Internal(anyhow::Error),
}

impl RequestError {
    pub fn code(&self) -> tonic::Code {
        match self {
            RequestError::Validation(_) | RequestError::Resolution(_) => {
                tonic::Code::InvalidArgument
            }
            RequestError::Write(_) => tonic::Code::FailedPrecondition,
            RequestError::Cancelled => tonic::Code::Cancelled,
            RequestError::Internal(_) => tonic::Code::Internal,
        }
    }

    pub fn to_response(&self) -> UidmapCanaryResponse {
        UidmapCanaryResponse::error(self.code(), self.to_string())
    }
}

/// Fulfills mapping requests of workspace containers: validates the mapping,
/// locates the requesting process on the node and writes its map.
#[derive(Clone)]
pub struct MappingHandler {
    config: Arc<MapperConfig>,
    runtime: Arc<dyn ContainerRuntime>,
}

impl MappingHandler {
    pub fn new(config: Arc<MapperConfig>, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { config, runtime }
    }

    pub fn config(&self) -> &MapperConfig {
        &self.config
    }

    /// Handles one request and renders the outcome as a response.
    pub async fn respond(
        &self,
        container_id: &str,
        request: &UidmapCanaryRequest,
        cancel: &CancellationToken,
    ) -> UidmapCanaryResponse {
        match self.handle(container_id, request, cancel).await {
            Ok(()) => UidmapCanaryResponse::success(),
            Err(e) => {
                match &e {
                    RequestError::Internal(inner) => {
                        error!("Mapping request failed: {:#}", inner)
                    }
                    RequestError::Write(inner) => warn!("Cannot write ID mapping: {:#}", inner),
                    other => warn!("Denied mapping request: {}", other),
                }
                e.to_response()
            }
        }
    }

    #[instrument(skip_all, fields(pid = request.pid, gid = request.gid))]
    pub async fn handle(
        &self,
        container_id: &str,
        request: &UidmapCanaryRequest,
        cancel: &CancellationToken,
    ) -> Result<(), RequestError> {
        debug!("Received mapping request: {:?}", request.mapping);
        let mapping = request.entries();
        validate_mapping(&self.config, &mapping)?;

        let seed_pid = self
            .runtime
            .container_pid(container_id)
            .await
            .map_err(RequestError::Internal)?;

        let proc_root = self.config.proc_root.clone();
        let target_pid = request.pid;
        let host_pid =
            tokio::task::spawn_blocking(move || find_host_pid(&proc_root, seed_pid, target_pid))
                .await
                .map_err(|e| RequestError::Internal(e.into()))??;

        // A workspace being torn down must not get any more maps written.
        if cancel.is_cancelled() {
            return Err(RequestError::Cancelled);
        }

        write_mapping(&self.config.proc_root, host_pid, request.gid, &mapping)
            .map_err(RequestError::Write)?;
        info!(host_pid, seed_pid, "Wrote ID mapping");
        Ok(())
    }
}
