//! Idempotent desired-state reconciliation engine.
//!
//! Declared items are grouped by resource category; each category is
//! converged by a step, and steps run in dependency order. The architecture
//! keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (matching, normalization,
//!   dependency graph, run report). No I/O.
//! - **[`io`]**: Side-effecting operations (config, desired-state files,
//!   export artifacts, the file-backed target).
//!
//! [`capability`], [`resolver`], [`step`] and [`orchestrator`] implement a
//! run; [`audit`] replays an exported run against a target.

pub mod audit;
pub mod capability;
pub mod catalog;
pub mod cli;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod resolver;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
