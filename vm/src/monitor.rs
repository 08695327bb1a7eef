//! Re-entrant monitors for synchronized methods.

use std::{sync::Arc, thread::ThreadId};

use ahash::AHashMap;
use object::{ClassId, ObjRef};
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct MonitorState {
    owner: Option<ThreadId>,
    recursion: u32,
}

#[derive(Debug, Default)]
pub struct Monitor {
    state: Mutex<MonitorState>,
    released: Condvar,
}

impl Monitor {
    pub fn enter(&self) {
        let me = std::thread::current().id();
        let mut state = self.state.lock();
        while state.owner.is_some_and(|owner| owner != me) {
            self.released.wait(&mut state);
        }
        state.owner = Some(me);
        state.recursion += 1;
    }

    pub fn exit(&self) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.owner, Some(std::thread::current().id()));
        state.recursion -= 1;
        if state.recursion == 0 {
            state.owner = None;
            self.released.notify_one();
        }
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.state.lock().owner == Some(std::thread::current().id())
    }
}

/// Holds a monitor until dropped.
pub(crate) struct MonitorGuard(Arc<Monitor>);

impl MonitorGuard {
    pub(crate) fn enter(monitor: Arc<Monitor>) -> Self {
        monitor.enter();
        Self(monitor)
    }
}

impl Drop for MonitorGuard {
    fn drop(&mut self) {
        self.0.exit();
    }
}

/// Monitors of objects and classes.
///
/// An object's sync word holds its monitor's index plus one; zero means it
/// never had one.
#[derive(Default)]
pub(crate) struct MonitorTable {
    monitors: Mutex<Vec<Arc<Monitor>>>,
    classes: Mutex<AHashMap<ClassId, Arc<Monitor>>>,
}

impl MonitorTable {
    /// # Safety
    ///
    /// `obj` must be a live, non-null object.
    pub(crate) unsafe fn for_object(&self, obj: ObjRef) -> Arc<Monitor> {
        let header = unsafe { obj.header() };
        let mut monitors = self.monitors.lock();
        let word = match header.sync() {
            0 => {
                monitors.push(Arc::new(Monitor::default()));
                header.init_sync(monitors.len())
            }
            word => word,
        };
        monitors[word - 1].clone()
    }

    pub(crate) fn for_class(&self, class: ClassId) -> Arc<Monitor> {
        self.classes.lock().entry(class).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitors_are_reentrant() {
        let monitor = Arc::new(Monitor::default());
        let outer = MonitorGuard::enter(monitor.clone());
        let inner = MonitorGuard::enter(monitor.clone());
        drop(inner);
        assert!(monitor.is_held_by_current_thread());
        drop(outer);
        assert!(!monitor.is_held_by_current_thread());
    }

    #[test]
    fn monitors_exclude_other_threads() {
        let monitor = Arc::new(Monitor::default());
        let counter = Arc::new(Mutex::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let monitor = monitor.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let _guard = MonitorGuard::enter(monitor.clone());
                        let value = *counter.lock();
                        std::thread::yield_now();
                        *counter.lock() = value + 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*counter.lock(), 400);
    }

    #[test]
    fn class_monitors_are_shared() {
        let table = MonitorTable::default();
        let a = table.for_class(ClassId(3));
        let b = table.for_class(ClassId(3));
        assert!(Arc::ptr_eq(&a, &b));
    }
}
