//! Pure, deterministic reconciliation logic. No I/O.

pub mod graph;
pub mod invariants;
pub mod matching;
pub mod normalize;
pub mod report;
pub mod types;
