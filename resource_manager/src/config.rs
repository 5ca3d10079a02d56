// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Policy constants supplied by the platform description at initialization.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::CoreId;
use crate::Error;
use crate::Result;
use crate::MAX_INSTANCES;

/// Resource manager configuration.
///
/// Every field has a default so a configuration file only lists what it changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RmConfig {
    /// Load percentage the default core may reach before free instances spill over to the
    /// surplus core. `100` turns balancing off.
    pub core_balance: u32,
    /// Capacity of each core in weighted macroblocks per second, indexed by core id.
    pub max_mb: Vec<u64>,
    /// Bound on a single hardware lock acquisition.
    pub hwlock_timeout_ms: u64,
    /// Bound on the wait for a slave core's header parsing.
    pub seq_done_timeout_ms: u64,
    /// Number of instance slots.
    pub max_instances: usize,
}

impl Default for RmConfig {
    fn default() -> Self {
        RmConfig {
            core_balance: 80,
            // 3840x2160 at 120fps.
            max_mb: vec![3_888_000, 3_888_000],
            hwlock_timeout_ms: 1000,
            seq_done_timeout_ms: 1000,
            max_instances: MAX_INSTANCES,
        }
    }
}

impl RmConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: RmConfig =
            serde_json::from_str(json).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.core_balance > 100 {
            return Err(Error::InvalidConfig(format!(
                "core_balance {} is above 100%",
                self.core_balance
            )));
        }
        if self.max_instances == 0 {
            return Err(Error::InvalidConfig("max_instances is 0".to_string()));
        }
        Ok(())
    }

    /// Capacity of `core`, or `None` when it is missing or zero. Balancing is skipped in that
    /// case.
    pub fn max_mb_for(&self, core: CoreId) -> Option<u64> {
        self.max_mb.get(core.0).copied().filter(|&mb| mb > 0)
    }

    pub fn instance_slots(&self) -> usize {
        self.max_instances.min(MAX_INSTANCES)
    }

    pub fn hwlock_timeout(&self) -> Duration {
        Duration::from_millis(self.hwlock_timeout_ms)
    }

    pub fn seq_done_timeout(&self) -> Duration {
        Duration::from_millis(self.seq_done_timeout_ms)
    }
}
