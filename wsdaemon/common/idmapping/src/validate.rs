// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::{MapperConfig, MappingEntry};

/// An error returned by [`validate_mapping`] when a requested mapping is not
/// permitted by the configured ranges.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("mapping for UID 0 is out of range")]
    RootOutOfRange,
    #[error("mapping for UID {container_id} is out of range")]
    UserOutOfRange { container_id: u32 },
}

/// Checks every entry of a requested uid_map/gid_map against the configured
/// ranges. The whole mapping is rejected on the first entry that is not
/// permitted.
///
/// Container ID 0 may only be mapped into the root range; any other container
/// ID must fit one of the user ranges.
pub fn validate_mapping(
    config: &MapperConfig,
    mapping: &[MappingEntry],
) -> Result<(), ValidationError> {
    for entry in mapping {
        if entry.container_id == 0 {
            if !config.root_range.contains(entry.host_id, entry.size) {
                return Err(ValidationError::RootOutOfRange);
            }
            continue;
        }

        let permitted = config
            .user_ranges
            .iter()
            .any(|range| range.contains(entry.host_id, entry.size));
        if !permitted {
            return Err(ValidationError::UserOutOfRange {
                container_id: entry.container_id,
            });
        }
    }
    Ok(())
}
