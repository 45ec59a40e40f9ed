use std::cell::{Cell, RefCell};

/// A replaceable callback slot.
///
/// The callback is taken out of the slot for the duration of the call, so the callee may
///  freely borrow the component that owns the slot, or even replace the callback. A
///  callback that was replaced during its own invocation is dropped afterwards. It still
///  counts as registered while it runs.
pub struct Handler<A, R = ()> {
    slot: RefCell<Option<Box<dyn FnMut(A) -> R>>>,
    registered: Cell<bool>,
}

impl<A, R> Default for Handler<A, R> {
    fn default() -> Self {
        Handler::empty()
    }
}

impl<A, R> Handler<A, R> {
    pub fn empty() -> Handler<A, R> {
        Handler {
            slot: RefCell::new(None),
            registered: Cell::new(false),
        }
    }

    pub fn new(f: impl FnMut(A) -> R + 'static) -> Handler<A, R> {
        Handler {
            slot: RefCell::new(Some(Box::new(f))),
            registered: Cell::new(true),
        }
    }

    pub fn set(&self, f: impl FnMut(A) -> R + 'static) {
        *self.slot.borrow_mut() = Some(Box::new(f));
        self.registered.set(true);
    }

    pub fn clear(&self) {
        self.slot.borrow_mut().take();
        self.registered.set(false);
    }

    pub fn is_set(&self) -> bool {
        self.registered.get()
    }

    /// Returns `None` if no callback is registered, or if the callback is currently
    ///  executing further up the stack.
    pub fn call(&self, arg: A) -> Option<R> {
        let taken = self.slot.borrow_mut().take();
        let mut f = taken?;
        let result = f(arg);

        let mut slot = self.slot.borrow_mut();
        if slot.is_none() && self.registered.get() {
            *slot = Some(f);
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;
    use std::cell::Cell;

    #[test]
    fn test_call_empty() {
        let handler: Handler<u32, u32> = Handler::empty();
        assert!(!handler.is_set());
        assert_eq!(handler.call(1), None);
    }

    #[test]
    fn test_call_passes_argument_and_result() {
        let handler = Handler::new(|x: u32| x * 2);
        assert_eq!(handler.call(21), Some(42));
        assert_eq!(handler.call(2), Some(4));
    }

    #[test]
    fn test_replace_during_call() {
        let handler = Rc::new(Handler::<(), u32>::empty());
        let h2 = handler.clone();
        handler.set(move |_| {
            h2.set(|_| 2);
            1
        });

        assert_eq!(handler.call(()), Some(1));
        assert_eq!(handler.call(()), Some(2));
    }

    #[test]
    fn test_reentrant_call_is_ignored() {
        let handler = Rc::new(Handler::<(), ()>::empty());
        let counter = Rc::new(Cell::new(0));

        let h2 = handler.clone();
        let c2 = counter.clone();
        handler.set(move |_| {
            c2.set(c2.get() + 1);
            assert!(h2.call(()).is_none());
        });

        handler.call(());
        assert_eq!(counter.get(), 1);
        assert!(handler.is_set());
    }

    #[test]
    fn test_registered_while_running() {
        let handler = Rc::new(Handler::<(), bool>::empty());
        let h2 = handler.clone();
        handler.set(move |_| h2.is_set());

        assert_eq!(handler.call(()), Some(true));
    }

    #[test]
    fn test_clear_during_call() {
        let handler = Rc::new(Handler::<(), ()>::empty());
        let h2 = handler.clone();
        handler.set(move |_| h2.clear());

        handler.call(());
        assert!(!handler.is_set());
        assert_eq!(handler.call(()), None);
    }
}
