// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Serves the ID mapper canary of workspace containers.
//!
//! Workspaces that want a user namespace ask the node, over a stream opened
//! by the daemon, to write `uid_map`/`gid_map` of one of their processes.
//! [`WorkspaceDispatch`] keeps one [`CanarySession`] per workspace, which
//! dials the in-workspace agent and feeds its requests to [`MappingHandler`].

mod dispatch;
mod handler;
mod policy;
mod protocol;
mod runtime;
mod session;
mod transport;

pub use dispatch::*;
pub use handler::*;
pub use policy::*;
pub use protocol::*;
pub use runtime::*;
pub use session::*;
pub use transport::*;
