//! Execution context tracking.
//!
//! Two pieces of ambient state follow a task around:
//!
//! - whether the current thread is a worker, and if so which registry it serves from
//!   (calls made from inside a worker run in place instead of going back to the pool);
//! - the caller's tracing span, captured at submission and re-entered right before the
//!   task settles so completion events stay correlated with the request that caused
//!   them.

use std::cell::RefCell;
use std::sync::Arc;

use tracing::Span;

use crate::registry::ComponentRegistry;

thread_local! {
    static WORKER_REGISTRY: RefCell<Option<Arc<ComponentRegistry>>> = const { RefCell::new(None) };
}

/// Registry of the worker running on this thread, if any.
pub fn worker_registry() -> Option<Arc<ComponentRegistry>> {
    WORKER_REGISTRY.with(|slot| slot.borrow().clone())
}

/// Whether the current thread is a worker execution unit.
pub fn in_worker() -> bool {
    WORKER_REGISTRY.with(|slot| slot.borrow().is_some())
}

/// Marks the current thread as a worker until dropped.
pub struct WorkerScope {
    previous: Option<Arc<ComponentRegistry>>,
}

/// Mark the current thread as a worker serving from `registry`.
pub fn enter_worker(registry: Arc<ComponentRegistry>) -> WorkerScope {
    let previous = WORKER_REGISTRY.with(|slot| slot.borrow_mut().replace(registry));
    WorkerScope { previous }
}

impl Drop for WorkerScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        WORKER_REGISTRY.with(|slot| *slot.borrow_mut() = previous);
    }
}

/// The caller's logical context, carried with a task across the pool.
#[derive(Debug, Clone)]
pub struct ContextToken {
    span: Span,
}

impl ContextToken {
    /// Capture the current span.
    pub fn capture() -> Self {
        Self {
            span: Span::current(),
        }
    }

    /// Run `f` inside the captured context.
    pub fn restore<R>(&self, f: impl FnOnce() -> R) -> R {
        self.span.in_scope(f)
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_in_worker_by_default() {
        assert!(!in_worker());
        assert!(worker_registry().is_none());
    }

    #[test]
    fn test_worker_scope_sets_and_restores() {
        let registry = Arc::new(ComponentRegistry::new());
        {
            let _scope = enter_worker(registry.clone());
            assert!(in_worker());
            assert!(Arc::ptr_eq(&worker_registry().unwrap(), &registry));
        }
        assert!(!in_worker());
    }

    #[test]
    fn test_worker_scope_is_per_thread() {
        let _scope = enter_worker(Arc::new(ComponentRegistry::new()));
        let seen_elsewhere = std::thread::spawn(in_worker).join().unwrap();
        assert!(!seen_elsewhere);
        assert!(in_worker());
    }

    #[test]
    fn test_context_token_restores_span() {
        let subscriber = tracing_subscriber::registry();
        tracing::subscriber::with_default(subscriber, || {
            let request = tracing::info_span!("request", id = 7);
            let token = request.in_scope(ContextToken::capture);
            assert_eq!(token.span().id(), request.id());

            let inside = token.restore(Span::current);
            assert_eq!(inside.id(), request.id());
            assert_ne!(Span::current().id(), request.id());
        });
    }
}
