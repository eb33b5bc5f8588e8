//! Per-flow trace context store.
//!
//! Binds "the current transaction" to the executing OS thread, the way
//! `opentelemetry::Context` binds an arbitrary value set via
//! `thread_local!` + guard-restores-previous-on-drop. Unlike
//! `opentelemetry::Context`, this slot holds exactly one thing (an
//! `Arc<Transaction>`) and nested `begin_transaction` calls do not stack —
//! `spec.md` §4.1 requires `begin_transaction` to leave an existing current
//! transaction in place rather than shadow it.
//!
//! The slot is thread-local, not task-local: this core targets the
//! preemptive (OS-thread) scheduling model. A cooperative-scheduling port
//! would attach this same slot to the task/context object instead (see
//! `spec.md` §9); the public API in [`crate::api`] would not need to
//! change.

use std::cell::RefCell;
use std::sync::Arc;

use crate::trace::Transaction;

thread_local! {
    static CURRENT: RefCell<Option<Arc<Transaction>>> = const { RefCell::new(None) };
}

/// The current-flow transaction slot.
///
/// All methods operate on the calling thread's slot only; there is no
/// cross-flow visibility by design (`spec.md` §4.1: "MUST be isolated per
/// flow — no cross-flow leakage").
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceContextStore {
    _private: (),
}

impl TraceContextStore {
    pub const fn new() -> Self {
        TraceContextStore { _private: () }
    }

    /// Returns the transaction currently bound to this flow, if any.
    pub fn get(&self) -> Option<Arc<Transaction>> {
        CURRENT.with(|cell| cell.borrow().clone())
    }

    /// Binds `txn` as current on this flow.
    ///
    /// Returns a guard that restores whatever was current before this call
    /// when dropped. Most callers don't need the guard (`begin_transaction`
    /// sets the slot and leaves it set until `end_transaction` clears it);
    /// it exists for `scoped_span`-style constructs that need strict
    /// nesting semantics internally even though transactions themselves do
    /// not nest.
    pub fn set(&self, txn: Arc<Transaction>) -> ContextGuard {
        let previous = CURRENT.with(|cell| cell.borrow_mut().replace(txn));
        ContextGuard { previous }
    }

    /// Clears the slot unconditionally.
    pub fn clear(&self) {
        CURRENT.with(|cell| *cell.borrow_mut() = None);
    }
}

/// Restores the previous slot contents on drop.
#[must_use = "dropping this guard immediately restores the previous context"]
pub struct ContextGuard {
    previous: Option<Arc<Transaction>>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CURRENT.with(|cell| *cell.borrow_mut() = self.previous.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(name: &str) -> Arc<Transaction> {
        Arc::new(Transaction::new(
            name.to_string(),
            "test".to_string(),
            true,
            None,
        ))
    }

    #[test]
    fn empty_by_default() {
        let store = TraceContextStore::new();
        assert!(store.get().is_none());
    }

    #[test]
    fn set_then_get() {
        let store = TraceContextStore::new();
        let t = txn("a");
        let _guard = store.set(t.clone());
        assert!(Arc::ptr_eq(&store.get().unwrap(), &t));
        store.clear();
    }

    #[test]
    fn clear_empties_slot() {
        let store = TraceContextStore::new();
        let _guard = store.set(txn("a"));
        store.clear();
        assert!(store.get().is_none());
    }

    #[test]
    fn guard_restores_previous_on_drop() {
        let store = TraceContextStore::new();
        let outer = txn("outer");
        let _outer_guard = store.set(outer.clone());
        {
            let inner = txn("inner");
            let _inner_guard = store.set(inner.clone());
            assert!(Arc::ptr_eq(&store.get().unwrap(), &inner));
        }
        assert!(Arc::ptr_eq(&store.get().unwrap(), &outer));
        store.clear();
    }

    #[test]
    fn isolated_per_thread() {
        let store = TraceContextStore::new();
        let _guard = store.set(txn("main-thread"));
        let handle = std::thread::spawn(|| {
            let store = TraceContextStore::new();
            assert!(store.get().is_none());
        });
        handle.join().unwrap();
        store.clear();
    }
}
