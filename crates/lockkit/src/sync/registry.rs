//! The set of all live inflated monitors.
//!
//! Inflation registers every published monitor here. During a GC root
//! snapshot the registry gate closes: inflating threads park in [`add`]
//! until the gate reopens. The sweep runs under GC-imposed global quiescence,
//! retargets monitors whose objects moved, and frees monitors whose objects
//! died.
//!
//! [`add`]: MonitorRegistry::add

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::objectmodel::ObjectReference;
use crate::sync::lock_word::MonitorRef;
use crate::sync::monitor::Monitor;
use crate::Runtime;

struct RegistryInner<R: Runtime> {
    allow_new: bool,
    monitors: VecDeque<Box<Monitor<R>>>,
}

pub struct MonitorRegistry<R: Runtime> {
    inner: Mutex<RegistryInner<R>>,
    add_cond: Condvar,
}

impl<R: Runtime> MonitorRegistry<R> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                allow_new: true,
                monitors: VecDeque::new(),
            }),
            add_cond: Condvar::new(),
        }
    }

    /// Registers a freshly installed monitor, parking while the gate is
    /// closed.
    pub(crate) fn add(&self, monitor: Box<Monitor<R>>) {
        let mut inner = self.inner.lock();
        while !inner.allow_new {
            self.add_cond.wait(&mut inner);
        }
        inner.monitors.push_front(monitor);
    }

    /// Closes the gate; subsequent [`add`](Self::add) callers wait.
    pub fn disallow_new(&self) {
        self.inner.lock().allow_new = false;
    }

    /// Reopens the gate and wakes every parked registrant.
    pub fn allow_new(&self) {
        let mut inner = self.inner.lock();
        inner.allow_new = true;
        self.add_cond.notify_all();
    }

    /// Visits every monitor's object reference. A `None` verdict frees the
    /// monitor; `Some` retargets it at the forwarded object.
    ///
    /// Must only run while no mutator can acquire, release, wait or notify;
    /// the GC calls this under global quiescence.
    pub fn sweep(&self, mut visitor: impl FnMut(ObjectReference) -> Option<ObjectReference>) {
        let mut inner = self.inner.lock();
        inner.monitors.retain(|monitor| {
            let Some(obj) = monitor.object() else {
                return false;
            };
            match visitor(obj) {
                Some(forwarded) => {
                    monitor.set_object(forwarded);
                    true
                }
                None => {
                    log::debug!(
                        target: "lockkit::monitor",
                        "freeing monitor {:p} belonging to unreachable object {:#x}",
                        &**monitor,
                        obj.as_raw()
                    );
                    false
                }
            }
        });
    }

    /// Whether a fat lock word's payload names a registered monitor.
    pub fn contains(&self, monitor: MonitorRef) -> bool {
        self.inner
            .lock()
            .monitors
            .iter()
            .any(|m| m.to_ref() == monitor)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().monitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<R: Runtime> Default for MonitorRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::mock::{MockObject, MockThread, MockVM};

    #[test]
    fn sweep_frees_dead_and_forwards_live() {
        let me = MockThread::attach("sweeper");
        let registry = MonitorRegistry::<MockVM>::new();

        let dead_obj = MockObject::alloc();
        let live_obj = MockObject::alloc();
        let forwarded_obj = MockObject::alloc();
        registry.add(Box::new(Monitor::new(me, dead_obj)));
        registry.add(Box::new(Monitor::new(me, live_obj)));
        assert_eq!(registry.len(), 2);

        registry.sweep(|obj| {
            if obj == dead_obj {
                None
            } else {
                assert_eq!(obj, live_obj);
                Some(forwarded_obj)
            }
        });

        assert_eq!(registry.len(), 1);
        let inner = registry.inner.lock();
        assert_eq!(inner.monitors[0].object(), Some(forwarded_obj));
    }

    #[test]
    fn closed_gate_parks_registrants() {
        let me = MockThread::attach("gatekeeper");
        let registry = Arc::new(MonitorRegistry::<MockVM>::new());
        let monitor = Box::new(Monitor::new(me, MockObject::alloc()));

        registry.disallow_new();

        let added = Arc::new(AtomicBool::new(false));
        let handle = {
            let registry = Arc::clone(&registry);
            let added = Arc::clone(&added);
            std::thread::spawn(move || {
                registry.add(monitor);
                added.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!added.load(Ordering::SeqCst));

        registry.allow_new();
        handle.join().unwrap();
        assert!(added.load(Ordering::SeqCst));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn contains_tracks_registration() {
        let me = MockThread::attach("member");
        let registry = MonitorRegistry::<MockVM>::new();
        let monitor = Box::new(Monitor::new(me, MockObject::alloc()));
        let reference = monitor.to_ref();
        assert!(!registry.contains(reference));
        registry.add(monitor);
        assert!(registry.contains(reference));
    }
}
