// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Job runtime.
//!
//! A job is one profile applied to one (source, destination, collection)
//! triple. This module owns its lifecycle:
//! - [`state`]: the per-run state machine, broadcast on a watch channel
//! - [`runner`]: one run's pipeline (read → plan → execute)
//! - [`graph`]: declared dependencies and admission-time cycle detection
//! - [`scheduler`]: priority queue, parallelism limit, destination leases

mod graph;
mod runner;
mod scheduler;
mod state;

pub use graph::DependencyGraph;
pub use runner::SyncJob;
pub use scheduler::{JobHandle, JobScheduler};
pub use state::{JobState, JobStateMachine};

use serde::{Deserialize, Serialize};

/// Admission priority. `Critical` jobs leave the queue first; FIFO within a
/// tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    Critical,
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl Priority {
    fn rank(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::Critical => 2,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::Critical => write!(f, "critical"),
        }
    }
}
