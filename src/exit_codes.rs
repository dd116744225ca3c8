//! Stable exit codes for the dirorch CLI.

/// The workflow reached its terminal fixpoint.
pub const OK: i32 = 0;
/// Invalid workflow document, filesystem failure, or other fatal error.
pub const INVALID: i32 = 1;
/// An init or completion hook exhausted its retry budget.
pub const HOOK_EXHAUSTED: i32 = 2;
