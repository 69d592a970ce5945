// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{collections::HashMap, sync::Arc};

use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{CanarySession, Dialer, MappingHandler, Sleeper};

/// Identifies the workspace whose container requests mappings.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceHandle {
    pub workspace_id: String,
    pub instance_id: String,
    pub container_id: String,
    /// Address the in-workspace agent listens on, typically the pod IP.
    pub agent_address: String,
}

/// A change in the set of workspaces running on this node.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkspaceEvent {
    Added(WorkspaceHandle),
    Removed {
        #[serde(rename = "instanceId")]
        instance_id: String,
    },
}

struct RunningCanary {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RunningCanary {
    async fn stop(self, instance_id: &str) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(instance_id, "ID mapper canary task failed: {}", e);
        }
    }
}

/// Runs one canary per workspace instance.
pub struct WorkspaceDispatch {
    handler: MappingHandler,
    dialer: Arc<dyn Dialer>,
    sleeper: Arc<dyn Sleeper>,
    cancel: CancellationToken,
    canaries: HashMap<String, RunningCanary>,
}

impl WorkspaceDispatch {
    pub fn new(handler: MappingHandler, dialer: Arc<dyn Dialer>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            handler,
            dialer,
            sleeper,
            cancel: CancellationToken::new(),
            canaries: HashMap::new(),
        }
    }

    /// Number of workspaces currently served.
    pub fn len(&self) -> usize {
        self.canaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.canaries.is_empty()
    }

    pub fn is_serving(&self, instance_id: &str) -> bool {
        self.canaries.contains_key(instance_id)
    }

    /// Starts serving the canary of a workspace whose container appeared.
    ///
    /// Returns false if the instance is already served.
    pub fn on_workspace_container_observed(&mut self, workspace: WorkspaceHandle) -> bool {
        if self.canaries.contains_key(&workspace.instance_id) {
            debug!(
                instance_id = %workspace.instance_id,
                "ID mapper canary already running"
            );
            return false;
        }

        let instance_id = workspace.instance_id.clone();
        let cancel = self.cancel.child_token();
        let session = CanarySession::new(
            workspace,
            self.handler.clone(),
            self.dialer.clone(),
            self.sleeper.clone(),
        );
        let task = tokio::spawn(session.run(cancel.clone()));
        self.canaries
            .insert(instance_id, RunningCanary { cancel, task });
        true
    }

    /// Stops serving a workspace that was torn down, waiting for its canary to
    /// exit.
    ///
    /// Returns false if the instance was not served.
    pub async fn on_workspace_removed(&mut self, instance_id: &str) -> bool {
        match self.canaries.remove(instance_id) {
            Some(canary) => {
                canary.stop(instance_id).await;
                true
            }
            None => {
                debug!(instance_id, "No ID mapper canary to stop");
                false
            }
        }
    }

    pub async fn handle_event(&mut self, event: WorkspaceEvent) {
        match event {
            WorkspaceEvent::Added(workspace) => {
                self.on_workspace_container_observed(workspace);
            }
            WorkspaceEvent::Removed { instance_id } => {
                self.on_workspace_removed(&instance_id).await;
            }
        }
    }

    /// Stops every canary.
    pub async fn shutdown(mut self) {
        info!(count = self.canaries.len(), "Stopping ID mapper canaries");
        self.cancel.cancel();
        for (instance_id, canary) in self.canaries.drain() {
            canary.stop(&instance_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use idmapping::{CanaryConfig, IdentityRange, MapperConfig};
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{CanaryConnection, ContainerRuntime, TokioSleeper};

    /// Reports every dial and refuses the connection, which parks the canary
    /// in backoff.
    struct RefusingDialer {
        dials: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl Dialer for RefusingDialer {
        async fn dial(&self, workspace: &WorkspaceHandle) -> Result<Box<dyn CanaryConnection>> {
            let _ = self.dials.send(workspace.instance_id.clone());
            bail!("connection refused")
        }
    }

    struct NoRuntime;

    #[async_trait]
    impl ContainerRuntime for NoRuntime {
        async fn container_pid(&self, _container_id: &str) -> Result<u64> {
            bail!("not reached")
        }
    }

    fn new_dispatch() -> (WorkspaceDispatch, mpsc::UnboundedReceiver<String>) {
        let config = MapperConfig {
            proc_root: "/nonexistent".into(),
            root_range: IdentityRange::new(33333, 1),
            user_ranges: vec![IdentityRange::new(100000, 70000)],
            canary: CanaryConfig {
                max_requests: 10,
                reconnect_delay_ms: 600_000,
            },
            agent_port: 22999,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatch = WorkspaceDispatch::new(
            MappingHandler::new(Arc::new(config), Arc::new(NoRuntime)),
            Arc::new(RefusingDialer { dials: tx }),
            Arc::new(TokioSleeper),
        );
        (dispatch, rx)
    }

    fn workspace(instance_id: &str) -> WorkspaceHandle {
        WorkspaceHandle {
            workspace_id: format!("ws-{instance_id}"),
            instance_id: instance_id.into(),
            container_id: format!("container-{instance_id}"),
            agent_address: "10.0.0.1".into(),
        }
    }

    #[tokio::test]
    async fn test_observe_and_remove() -> Result<()> {
        let (mut dispatch, mut dials) = new_dispatch();

        assert!(dispatch.on_workspace_container_observed(workspace("a")));
        assert_eq!(dials.recv().await.as_deref(), Some("a"));
        assert!(dispatch.is_serving("a"));

        assert!(dispatch.on_workspace_removed("a").await);
        assert!(dispatch.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_observe_twice_is_noop() -> Result<()> {
        let (mut dispatch, mut dials) = new_dispatch();

        assert!(dispatch.on_workspace_container_observed(workspace("a")));
        assert!(!dispatch.on_workspace_container_observed(workspace("a")));
        assert_eq!(dispatch.len(), 1);
        assert_eq!(dials.recv().await.as_deref(), Some("a"));

        dispatch.shutdown().await;
        // The canary is stopped and nothing else dialed in the meantime.
        assert_eq!(dials.recv().await, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_unknown() {
        let (mut dispatch, _dials) = new_dispatch();
        assert!(!dispatch.on_workspace_removed("missing").await);
    }

    #[tokio::test]
    async fn test_shutdown_stops_all() -> Result<()> {
        let (mut dispatch, mut dials) = new_dispatch();
        dispatch.on_workspace_container_observed(workspace("a"));
        dispatch.on_workspace_container_observed(workspace("b"));

        let mut dialed = vec![dials.recv().await, dials.recv().await];
        dialed.sort();
        assert_eq!(dialed, vec![Some("a".to_string()), Some("b".to_string())]);

        tokio::time::timeout(Duration::from_secs(10), dispatch.shutdown()).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_handle_events() -> Result<()> {
        let (mut dispatch, mut dials) = new_dispatch();

        dispatch
            .handle_event(serde_json::from_str(
                r#"{"type":"added","workspaceId":"ws-a","instanceId":"a","containerId":"c-a","agentAddress":"10.0.0.1"}"#,
            )?)
            .await;
        assert_eq!(dials.recv().await.as_deref(), Some("a"));
        assert!(dispatch.is_serving("a"));

        dispatch
            .handle_event(serde_json::from_str(
                r#"{"type":"removed","instanceId":"a"}"#,
            )?)
            .await;
        assert!(dispatch.is_empty());
        Ok(())
    }

    #[test]
    fn test_parse_events() -> Result<()> {
        let added: WorkspaceEvent = serde_json::from_str(
            r#"{"type":"added","workspaceId":"ws-1","instanceId":"i-1","containerId":"c-1","agentAddress":"10.1.2.3"}"#,
        )?;
        assert_eq!(
            added,
            WorkspaceEvent::Added(WorkspaceHandle {
                workspace_id: "ws-1".into(),
                instance_id: "i-1".into(),
                container_id: "c-1".into(),
                agent_address: "10.1.2.3".into(),
            })
        );

        let removed: WorkspaceEvent = serde_json::from_str(r#"{"type":"removed","instanceId":"i-1"}"#)?;
        assert_eq!(
            removed,
            WorkspaceEvent::Removed {
                instance_id: "i-1".into()
            }
        );

        assert!(serde_json::from_str::<WorkspaceEvent>(r#"{"type":"moved"}"#).is_err());
        Ok(())
    }
}
