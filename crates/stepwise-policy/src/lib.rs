//! Hook pipeline and permission gate used by the agent loop.

mod hooks;
mod permission;

pub use hooks::{FnHook, HookPipeline, HookRegistration, HookRun};
pub use permission::{PermissionMode, PermissionRules, RulePermissionGate, StaticAnswerer};

/// Match a tool or model name against a registration pattern.
///
/// Patterns are `*`, an exact name, a `prefix*` glob, or `|`-separated
/// alternatives of those.
pub fn matches(pattern: &str, actual: &str) -> bool {
    pattern
        .split('|')
        .map(str::trim)
        .any(|alternative| matches_one(alternative, actual))
}

fn matches_one(pattern: &str, actual: &str) -> bool {
    if pattern.ends_with('*') {
        let prefix = pattern.trim_end_matches('*');
        prefix.is_empty() || actual.starts_with(prefix)
    } else {
        pattern == actual
    }
}
