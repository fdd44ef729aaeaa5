// SPDX-FileCopyrightText: Copyright © 2020-2026 the project authors
//
// SPDX-License-Identifier: MPL-2.0

//! Once-per-key warnings, routed through `log::warn!` the way `boulder`/`moss` route user-visible
//! messages through their logging facade rather than `eprintln!`.

use std::cell::RefCell;

use indexmap::IndexSet;

/// Deduplicates warnings by an arbitrary string key so a call-site reached many times during one
/// elaboration (e.g. the same duplicate-dependency pair re-encountered via memoization) only logs
/// once.
#[derive(Debug, Default)]
pub struct WarnOnce {
    seen: RefCell<IndexSet<String>>,
}

impl WarnOnce {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log `message` at `warn` level the first time `key` is seen; silently skip afterwards.
    pub fn warn(&self, key: impl Into<String>, message: impl std::fmt::Display) {
        if self.seen.borrow_mut().insert(key.into()) {
            log::warn!("{message}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn dedups_by_key() {
        static COUNT: AtomicUsize = AtomicUsize::new(0);
        let w = WarnOnce::new();
        for _ in 0..3 {
            w.warn("dup:foo", "first message");
            COUNT.fetch_add(1, Ordering::SeqCst);
        }
        w.warn("dup:bar", "second message");
        // the counter above just proves we still call through each time; the dedup only gates
        // the log line itself. What we actually assert is the key bookkeeping:
        assert_eq!(w.seen.borrow().len(), 2);
    }
}
