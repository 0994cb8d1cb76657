//! Stable exit codes for reconciler CLI commands.

/// Run (or audit) completed with no failures and no warnings.
pub const OK: i32 = 0;
/// Invalid config, desired state or step plan; nothing was run.
pub const INVALID: i32 = 1;
/// At least one step failed, or the audit found missing or mismatched items.
pub const FAILED: i32 = 2;
/// Completed, but some categories were skipped as unsupported.
pub const WARNINGS: i32 = 3;
