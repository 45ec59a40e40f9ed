use std::cell::RefCell;
use std::rc::Weak;

pub mod handler;
pub mod safe_converter;

/// Runs `f` on the target of a weak component reference if it is still alive. Callbacks
///  registered with interfaces and timers hold their component this way.
pub(crate) fn with_upgraded<T, R>(weak: &Weak<RefCell<T>>, f: impl FnOnce(&mut T) -> R) -> Option<R> {
    let rc = weak.upgrade()?;
    let mut borrowed = rc.borrow_mut();
    Some(f(&mut borrowed))
}
