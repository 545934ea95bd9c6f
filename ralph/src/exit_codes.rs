//! Stable exit codes for `ralph` commands.

/// Loop finished successfully, or `select` printed an item.
pub const OK: i32 = 0;
/// The agent printed the abort marker.
pub const ABORTED: i32 = 1;
/// Iteration budget spent without a stop condition; for `select`, nothing left in scope.
pub const EXHAUSTED: i32 = 2;
/// Invalid flags, configuration, backlog or template, or any other fatal error.
pub const INVALID: i32 = 3;
/// Another live instance holds the lock.
pub const LOCKED: i32 = 4;
/// Interrupted by the operator.
pub const INTERRUPTED: i32 = 130;
