//! Composable cancellation tokens.
//!
//! Every async-shaped operation in this crate (queued AT commands, bearer
//! connect/disconnect steps, device support-checks) accepts a
//! [`CancelToken`]. Two tokens compose: a caller-supplied token and the
//! owning object's lifetime token. Cancelling either fires both — `child()`
//! returns a token that is cancelled when *it* is cancelled directly, or
//! when its parent is.
//!
//! Since this crate has no async runtime (see `serial`/`bearer` design
//! notes), cancellation is observed by registering a one-shot callback via
//! [`CancelToken::on_cancel`] rather than by awaiting a future.

use std::cell::RefCell;
use std::rc::Rc;

type Observer = Rc<dyn Fn()>;

struct Inner {
    cancelled: RefCell<bool>,
    parent: Option<CancelToken>,
    observers: RefCell<Vec<Observer>>,
}

impl Default for Inner {
    fn default() -> Self {
        Self { cancelled: RefCell::new(false), parent: None, observers: RefCell::new(Vec::new()) }
    }
}

/// A cheaply clonable, reference-counted cancellation flag.
#[derive(Clone)]
pub struct CancelToken(Rc<Inner>);

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Create a new, unparented root token.
    pub fn new() -> Self {
        Self(Rc::new(Inner::default()))
    }

    /// Create a token that is cancelled when either `self` or this new
    /// token is cancelled.
    pub fn child(&self) -> Self {
        Self(Rc::new(Inner {
            cancelled: RefCell::new(false),
            parent: Some(self.clone()),
            observers: RefCell::new(Vec::new()),
        }))
    }

    /// Mark this token (and anything derived from it) as cancelled.
    pub fn cancel(&self) {
        if std::mem::replace(&mut *self.0.cancelled.borrow_mut(), true) {
            return;
        }
        for observer in self.0.observers.borrow_mut().drain(..) {
            observer();
        }
    }

    /// Whether this token or any of its ancestors has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.0.cancelled.borrow() || self.0.parent.as_ref().is_some_and(Self::is_cancelled)
    }

    /// Run `f` exactly once, the moment this token (or an ancestor) is
    /// cancelled. Runs immediately if already cancelled.
    pub fn on_cancel(&self, f: impl FnOnce() + 'static) {
        if self.is_cancelled() {
            f();
            return;
        }

        let slot = Rc::new(RefCell::new(Some(Box::new(f) as Box<dyn FnOnce()>)));
        let trigger: Observer = Rc::new(move || {
            if let Some(f) = slot.borrow_mut().take() {
                f();
            }
        });

        self.0.observers.borrow_mut().push(trigger.clone());
        if let Some(parent) = &self.0.parent {
            let trigger = trigger.clone();
            parent.on_cancel(move || trigger());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn child_sees_parent_cancel() {
        let parent = CancelToken::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn parent_unaffected_by_child_cancel() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn independent_tokens_compose_via_shared_child() {
        let user = CancelToken::new();
        let lifetime = CancelToken::new();
        let op = user.child();
        let op2 = lifetime.child();
        lifetime.cancel();
        assert!(op2.is_cancelled());
        assert!(!op.is_cancelled());
        user.cancel();
        assert!(op.is_cancelled());
    }

    #[test]
    fn on_cancel_fires_exactly_once() {
        let token = CancelToken::new();
        let count = Rc::new(Cell::new(0));
        let counter = count.clone();
        token.on_cancel(move || counter.set(counter.get() + 1));
        token.cancel();
        token.cancel();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn on_cancel_fires_via_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        child.on_cancel(move || flag.set(true));
        parent.cancel();
        assert!(fired.get());
    }

    #[test]
    fn on_cancel_runs_immediately_if_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        token.on_cancel(move || flag.set(true));
        assert!(fired.get());
    }
}
