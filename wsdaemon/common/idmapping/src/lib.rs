// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Writes user namespace ID mappings on behalf of workspace containers.
//!
//! A mapping request goes through three steps:
//! 1. [`validate_mapping`] checks it against the node's [`MapperConfig`].
//! 2. [`find_host_pid`] translates the requesting in-container PID to a host
//!    PID.
//! 3. [`write_mapping`] writes the host process's uid_map or gid_map.

mod config;
mod hostpid;
mod range;
mod validate;
mod write;

pub use config::*;
pub use hostpid::*;
pub use range::*;
pub use validate::*;
pub use write::*;
