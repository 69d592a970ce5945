// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Defines the messages exchanged on the ID mapper canary stream.
//!
//! The in-workspace agent sends [`UidmapCanaryRequest`]s; the daemon answers
//! each of them with exactly one [`UidmapCanaryResponse`].

use idmapping::MappingEntry;

/// Full gRPC method path of the canary stream served by the in-workspace
/// agent.
pub const CANARY_METHOD_PATH: &str = "/iws.InWorkspaceHelper/IDMapperCanary";

#[derive(Clone, PartialEq, prost::Message)]
pub struct UidmapCanaryRequest {
    /// PID of the process whose map to write, as seen inside the workspace.
    #[prost(uint64, tag = "1")]
    pub pid: u64,
    /// Write gid_map instead of uid_map.
    #[prost(bool, tag = "2")]
    pub gid: bool,
    #[prost(message, repeated, tag = "3")]
    pub mapping: Vec<IdMapping>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct IdMapping {
    #[prost(uint32, tag = "1")]
    pub container_id: u32,
    #[prost(uint32, tag = "2")]
    pub host_id: u32,
    #[prost(uint32, tag = "3")]
    pub size: u32,
}

/// An empty message and a zero code mean success.
#[derive(Clone, PartialEq, prost::Message)]
pub struct UidmapCanaryResponse {
    #[prost(string, tag = "1")]
    pub message: String,
    #[prost(uint32, tag = "2")]
    pub error_code: u32,
}

impl UidmapCanaryRequest {
    pub fn entries(&self) -> Vec<MappingEntry> {
        self.mapping
            .iter()
            .map(|m| MappingEntry::new(m.container_id, m.host_id, m.size))
            .collect()
    }
}

impl UidmapCanaryResponse {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn error(code: tonic::Code, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_code: code as u32,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error_code == 0 && self.message.is_empty()
    }
}
