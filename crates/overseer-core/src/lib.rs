//! Overseer Core Library
//!
//! This crate orchestrates long-running agent processes on behalf of a
//! user-facing application:
//! - Spawns one subprocess per requested run and registers it as the single
//!   live process for that run
//! - Tracks each run's lifecycle through a persisted state machine with
//!   compare-and-set transitions
//! - Streams the agent's line-oriented output to per-run subscribers and
//!   aggregates token/cost metrics
//! - Detects provider usage limits, pausing affected runs and resuming them
//!   as new runs linked by lineage
//! - Supports deferred (scheduled) execution and startup crash recovery
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      overseer-core                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  run/          - Executor, scheduler, events, metrics       │
//! │  process/      - Live-process registry, output streaming    │
//! │  sandbox/      - Capability policy derivation               │
//! │  storage/      - SQLite database, queries                   │
//! │  types/        - Shared type definitions                    │
//! │  error.rs      - Error types                                │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod process;
pub mod run;
pub mod sandbox;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;

// Re-export orchestration components
pub use run::{
    recover, EventBus, Executor, MarkerDetector, MetricsAggregator, Scheduler,
    UsageLimitDetector, UsageLimitMonitor, UsageLimitSignal, DEFAULT_GRACE_PERIOD, DEFAULT_TICK,
};

// Re-export process components
pub use process::{OutputStreamer, ProcessHandle, ProcessRegistry};

// Re-export sandbox components
pub use sandbox::{PlatformPolicyProvider, PolicyProvider, SandboxPolicy};

// Re-export storage
pub use storage::Storage;
