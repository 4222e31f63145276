//! Process-wide tracing setup shared by every binary in the workspace.

pub mod tracing;

/// Initialize JSON logging with an `info` default, overridable via `RUST_LOG`.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init_with_default(tracing::DEFAULT_DIRECTIVES);
}
