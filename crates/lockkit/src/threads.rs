//! Thread handles and the per-thread synchronization state lockkit owns.
//!
//! The embedding runtime represents threads however it likes; lockkit sees
//! them as opaque [`VmThread`] handles and reaches the state it needs through
//! the [`Thread`] contract. The one piece of thread state this crate owns is
//! [`ThreadSync`], which the runtime embeds in its thread object and hands
//! back from [`Thread::sync`].

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::objectmodel::ObjectReference;
use crate::sync::lock_word::MonitorRef;
use crate::Runtime;

/// Thread id zero is never assigned.
pub const INVALID_THREAD_ID: u32 = 0;

/// An opaque handle to a runtime thread. The embedding runtime chooses the
/// representation (typically the address of its thread object); lockkit only
/// stores, copies and compares these.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct VmThread(usize);

impl VmThread {
    pub const NULL: VmThread = VmThread(0);

    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> usize {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Runtime thread states this subsystem transitions through or reports on.
/// `Waiting`, `TimedWaiting` and `Sleeping` double as the `why` argument of
/// wait: they name the suspended state the waiter parks in.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThreadState {
    Runnable,
    /// Blocked trying to acquire a monitor.
    Blocked,
    /// Inside an untimed wait.
    Waiting,
    /// Inside a timed wait.
    TimedWaiting,
    /// Inside a sleep implemented as a timed wait on the thread's own lock.
    Sleeping,
}

impl ThreadState {
    pub fn is_waiting_kind(self) -> bool {
        matches!(
            self,
            ThreadState::Waiting | ThreadState::TimedWaiting | ThreadState::Sleeping
        )
    }
}

pub(crate) struct WaitState {
    /// Monitor this thread is blocked on inside wait, if any. While this is
    /// set, a notifier or interrupter must signal `wait_cond` to wake the
    /// thread.
    pub wait_monitor: Option<MonitorRef>,
    pub interrupted: bool,
}

/// Per-thread wait machinery. Touched by other threads only while holding
/// `wait_mutex`, which must be obtainable even when the thread is suspended.
pub struct ThreadSync {
    pub(crate) wait_mutex: Mutex<WaitState>,
    pub(crate) wait_cond: Condvar,
    /// Link while queued in some monitor's wait set. Guarded by that
    /// monitor's internal mutex, not by `wait_mutex`.
    wait_next: AtomicUsize,
    /// Object a contended acquire is currently entering, for diagnostics.
    monitor_enter_object: AtomicUsize,
}

impl ThreadSync {
    pub fn new() -> Self {
        Self {
            wait_mutex: Mutex::new(WaitState {
                wait_monitor: None,
                interrupted: false,
            }),
            wait_cond: Condvar::new(),
            wait_next: AtomicUsize::new(0),
            monitor_enter_object: AtomicUsize::new(0),
        }
    }

    /// Delivers an interrupt: sets the flag and wakes the thread if it is
    /// parked in a wait.
    pub fn interrupt(&self) {
        let mut state = self.wait_mutex.lock();
        state.interrupted = true;
        self.wait_cond.notify_one();
    }

    pub fn is_interrupted(&self) -> bool {
        self.wait_mutex.lock().interrupted
    }

    pub fn set_interrupted(&self, value: bool) {
        self.wait_mutex.lock().interrupted = value;
    }

    /// Monitor the thread is currently waiting on, if any.
    pub fn wait_monitor(&self) -> Option<MonitorRef> {
        self.wait_mutex.lock().wait_monitor
    }

    /// Wakes the thread without touching the interrupt flag. Used by
    /// notify-all, which delivers a wake to every dequeued waiter.
    pub(crate) fn wake(&self) {
        let _state = self.wait_mutex.lock();
        self.wait_cond.notify_one();
    }

    pub(crate) fn wait_next(&self) -> VmThread {
        VmThread::from_raw(self.wait_next.load(Ordering::Relaxed))
    }

    pub(crate) fn set_wait_next(&self, next: VmThread) {
        self.wait_next.store(next.as_raw(), Ordering::Relaxed);
    }

    pub(crate) fn monitor_enter_object(&self) -> Option<ObjectReference> {
        ObjectReference::from_raw(self.monitor_enter_object.load(Ordering::Relaxed))
    }

    pub(crate) fn set_monitor_enter_object(&self, obj: Option<ObjectReference>) {
        self.monitor_enter_object
            .store(obj.map_or(0, ObjectReference::as_raw), Ordering::Relaxed);
    }
}

impl Default for ThreadSync {
    fn default() -> Self {
        Self::new()
    }
}

/// A method/instruction-offset pair identifying a lock-acquire site, recorded
/// while lock profiling is enabled.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ProfileSite {
    pub method: MethodId,
    pub pc: u32,
}

/// Opaque method identifier supplied by the embedding runtime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct MethodId(pub usize);

/// Per-thread contract the embedding runtime implements.
pub trait Thread<R: Runtime>: 'static {
    /// Stable positive thread id. Must fit the thin-lock owner field; zero is
    /// reserved as [`INVALID_THREAD_ID`].
    fn id(thread: VmThread) -> u32;

    /// The lockkit-owned sync state embedded in the runtime's thread object.
    fn sync<'a>(thread: VmThread) -> &'a ThreadSync;

    fn state(thread: VmThread) -> ThreadState;

    /// Runnable -> suspended transition. Past this point the GC may scan the
    /// thread's stack; the thread touches no heap references until it
    /// transitions back.
    fn transition_from_runnable_to_suspended(thread: VmThread, why: ThreadState);

    /// Suspended -> runnable transition. May stall at a safepoint if a GC is
    /// in progress.
    fn transition_from_suspended_to_runnable(thread: VmThread);

    /// Whether the thread is currently suspended by the registry. Inflating
    /// another thread's thin lock is only sound while this holds.
    fn is_suspended(thread: VmThread) -> bool;

    /// Where the thread is currently executing, for lock profiling.
    fn current_location(thread: VmThread) -> Option<ProfileSite> {
        let _ = thread;
        None
    }

    /// Short human-readable form used in diagnostics.
    fn describe(thread: VmThread) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_sets_and_clears() {
        let sync = ThreadSync::new();
        assert!(!sync.is_interrupted());
        sync.interrupt();
        assert!(sync.is_interrupted());
        sync.set_interrupted(false);
        assert!(!sync.is_interrupted());
    }

    #[test]
    fn wait_next_defaults_null() {
        let sync = ThreadSync::new();
        assert!(sync.wait_next().is_null());
        sync.set_wait_next(VmThread::from_raw(0x1000));
        assert_eq!(sync.wait_next().as_raw(), 0x1000);
    }
}
