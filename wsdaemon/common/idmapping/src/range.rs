// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use serde::{Deserialize, Serialize};

/// A range of host UIDs/GIDs that workspace containers may be mapped into.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRange {
    pub start: u32,
    pub size: u32,
}

impl IdentityRange {
    pub fn new(start: u32, size: u32) -> Self {
        Self { start, size }
    }

    /// Checks whether a requested sub-mapping of `size` IDs starting at
    /// `start` is permitted by this range.
    ///
    /// Only the lower bound of `start` and the upper bound of `size` are
    /// checked, each on its own. `start + size` is NOT required to stay within
    /// `self.start + self.size`, so e.g. `[1000, +10)` contains `(1005, 10)`.
    pub fn contains(&self, start: u32, size: u32) -> bool {
        start >= self.start && size <= self.size
    }
}
