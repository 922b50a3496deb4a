//! Teardown stack

use std::any::Any;
use tbot_core::{Result, TbotError};
use tracing::warn;

enum Entry {
    Callback(Box<dyn FnOnce() -> Result<()>>),
    Value(Box<dyn Any>),
}

/// Actions and values released in reverse order of registration.
///
/// Dropping an `ExitStack` unwinds it; errors are logged.
#[derive(Default)]
pub struct ExitStack {
    entries: Vec<Entry>,
}

impl ExitStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` on unwind
    pub fn push(&mut self, f: impl FnOnce() -> Result<()> + 'static) {
        self.entries.push(Entry::Callback(Box::new(f)));
    }

    /// Keep `value` alive until unwind
    pub fn hold<T: 'static>(&mut self, value: T) {
        self.entries.push(Entry::Value(Box::new(value)));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Release everything, newest first, returning the errors raised
    pub fn unwind(&mut self) -> Vec<TbotError> {
        let mut errors = Vec::new();
        while let Some(entry) = self.entries.pop() {
            match entry {
                Entry::Callback(f) => {
                    if let Err(e) = f() {
                        errors.push(e);
                    }
                }
                Entry::Value(value) => drop(value),
            }
        }
        errors
    }
}

impl Drop for ExitStack {
    fn drop(&mut self) {
        for e in self.unwind() {
            warn!("error during teardown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Noisy(&'static str, Rc<RefCell<Vec<&'static str>>>);

    impl Drop for Noisy {
        fn drop(&mut self) {
            self.1.borrow_mut().push(self.0);
        }
    }

    #[test]
    fn test_unwinds_in_reverse_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut stack = ExitStack::new();
        let l = log.clone();
        stack.push(move || {
            l.borrow_mut().push("first");
            Ok(())
        });
        stack.hold(Noisy("held", log.clone()));
        let l = log.clone();
        stack.push(move || {
            l.borrow_mut().push("last");
            Err(TbotError::internal("teardown hiccup"))
        });

        let errors = stack.unwind();
        assert_eq!(errors.len(), 1);
        assert_eq!(*log.borrow(), ["last", "held", "first"]);
        assert!(stack.is_empty());
    }
}
