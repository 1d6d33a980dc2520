// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Sandbox configuration

use serde::{Deserialize, Serialize};

use crate::fault::FaultPolicy;

/// Resource limits
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SandboxLimits {
    /// Upper bound on simultaneously open access handles across all files
    pub max_open_handles: u32,
    /// Largest size in bytes a file may reach through write or truncate
    pub max_file_size: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_open_handles: 10_000,
            max_file_size: 1 << 30,
        }
    }
}

/// Sandbox configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SandboxConfig {
    pub limits: SandboxLimits,
    /// Deliver lock events to subscribers
    pub track_events: bool,
    pub faults: FaultPolicy,
}
