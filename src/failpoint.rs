//! Process-wide fault-injection points and engine toggles.
//!
//! A failpoint is a named switch checked at a specific code site; tests flip
//! it to force an error path that is otherwise hard to reach. The registry is
//! process-wide with an explicit lifecycle: enable, observe, disable.
//!
//! Known sites:
//! - `try_consume_mem_failed` — a memory tracker consume request fails.
//! - `snapshot_dump_fail` — dumping the L0 snapshot reports an IO error.
//! - `snapshot_load_fail` — loading the L0 snapshot reports an IO error.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{OnceLock, RwLock};

static REGISTRY: OnceLock<RwLock<HashSet<String>>> = OnceLock::new();

/// Whether newly written immutable files carry bloom filters.
static WRITE_INDEX_BF: AtomicBool = AtomicBool::new(true);

fn registry() -> &'static RwLock<HashSet<String>> {
    REGISTRY.get_or_init(|| RwLock::new(HashSet::new()))
}

/// Arm the named failpoint.
pub fn enable(name: &str) {
    registry().write().unwrap().insert(name.to_string());
}

/// Disarm the named failpoint.
pub fn disable(name: &str) {
    registry().write().unwrap().remove(name);
}

/// Returns true iff the named failpoint is armed.
pub fn triggered(name: &str) -> bool {
    registry().read().unwrap().contains(name)
}

/// Returns true iff the named failpoint is armed, either globally or scoped
/// as `<name>/<scope>`. Scoped arming lets a test target one index instance
/// without tripping unrelated ones in the same process.
pub fn triggered_for(name: &str, scope: &str) -> bool {
    let reg = registry().read().unwrap();
    reg.contains(name) || reg.contains(&format!("{name}/{scope}"))
}

/// Disarm every failpoint.
pub fn reset() {
    registry().write().unwrap().clear();
}

pub fn set_write_index_bf(v: bool) {
    WRITE_INDEX_BF.store(v, Ordering::SeqCst);
}

pub fn write_index_bf() -> bool {
    WRITE_INDEX_BF.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failpoint_lifecycle() {
        assert!(!triggered("test_only_point"));
        enable("test_only_point");
        assert!(triggered("test_only_point"));
        disable("test_only_point");
        assert!(!triggered("test_only_point"));
    }
}
