//! The inflated form of an object lock.
//!
//! A monitor comes into existence when a thin lock inflates and lives until
//! the GC sweep observes its object unreachable. It owns an internal mutex
//! guarding all mutable state, a condition for contending acquirers, and the
//! wait set: an insertion-ordered singly-linked list threaded through each
//! waiter's `wait_next` field.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::objectmodel::ObjectReference;
use crate::sync::lock_word::{LockState, LockWord, MonitorRef};
use crate::sync::SyncError;
use crate::threads::{ProfileSite, Thread, ThreadState, VmThread, INVALID_THREAD_ID};
use crate::{Runtime, ThreadOf};

/// Timed waits are allowed to wake early, so absurd durations clamp here.
pub const MAX_TIMED_WAIT_MS: i64 = i32::MAX as i64;

struct MonitorInner {
    /// Thread holding the monitor, or null.
    owner: VmThread,
    /// Surplus acquisitions by `owner` beyond the first.
    recursion: u32,
    /// Head of the wait set. Each waiter's `wait_next` is guarded by this
    /// monitor's internal mutex for as long as the waiter is enqueued here.
    wait_set: VmThread,
    /// Where the current owner acquired, when lock profiling is enabled.
    locking_site: Option<ProfileSite>,
}

pub struct Monitor<R: Runtime> {
    monitor_lock: Mutex<MonitorInner>,
    contenders: Condvar,
    /// Back-reference to the owning object; retargeted by the GC sweep when
    /// the object moves.
    object: AtomicUsize,
    marker: PhantomData<R>,
}

impl<R: Runtime> Monitor<R> {
    /// A monitor may only be created for a thin lock whose owner is the
    /// creating thread or is suspended; anything else races the owner's plain
    /// stores to the thin word.
    pub(crate) fn new(owner: VmThread, obj: ObjectReference) -> Self {
        debug_assert!(
            owner == R::current_thread() || ThreadOf::<R>::is_suspended(owner),
            "inflating a thin lock whose owner is running"
        );
        Self {
            monitor_lock: Mutex::new(MonitorInner {
                owner,
                recursion: 0,
                wait_set: VmThread::NULL,
                locking_site: None,
            }),
            contenders: Condvar::new(),
            object: AtomicUsize::new(obj.as_raw()),
            marker: PhantomData,
        }
    }

    pub(crate) fn to_ref(&self) -> MonitorRef {
        MonitorRef::from_raw(self as *const Self as usize).expect("monitor has a live address")
    }

    /// Resolves a fat lock word's payload back to the record. Sound because a
    /// published fat word only ever names a registered monitor, and the sweep
    /// that frees monitors runs under global quiescence.
    pub(crate) fn from_ref<'a>(monitor: MonitorRef) -> &'a Self {
        unsafe { &*(monitor.as_raw() as *const Self) }
    }

    pub fn object(&self) -> Option<ObjectReference> {
        ObjectReference::from_raw(self.object.load(Ordering::Relaxed))
    }

    pub(crate) fn set_object(&self, obj: ObjectReference) {
        self.object.store(obj.as_raw(), Ordering::Relaxed);
    }

    /// Copies the thin-lock tenancy into this record and publishes it with a
    /// CAS on the object's lock word. Returns false if another thread won the
    /// inflation race; the caller discards the record.
    pub(crate) fn install(&self, _self_thread: VmThread) -> bool {
        // Uncontended: the monitor is not published yet.
        let mut inner = self.monitor_lock.lock();
        let Some(obj) = self.object() else {
            return false;
        };
        let word = obj.header().lock_word();
        match word.state() {
            // The owner is pinned, but another thread may still have beaten
            // us to publishing a monitor.
            LockState::FatLocked { .. } => false,
            LockState::ThinLocked { owner, count } => {
                debug_assert_eq!(owner, ThreadOf::<R>::id(inner.owner));
                inner.recursion = count;
                let fat = LockWord::from_monitor(self.to_ref());
                let success = obj.header().cas_lock_word(word, fat);
                if success && R::lockkit().options().lock_profiling_threshold_ms != 0 {
                    inner.locking_site = ThreadOf::<R>::current_location(inner.owner);
                }
                success
            }
            LockState::Unlocked => unreachable!("thin lock vanished during inflation"),
        }
    }

    /// Upgrades `obj`'s thin lock, currently held by `owner`, to a monitor.
    /// `owner` must be `self_thread` or suspended. On return the lock word is
    /// fat, though not necessarily with the record allocated here.
    pub(crate) fn inflate(self_thread: VmThread, owner: VmThread, obj: ObjectReference) {
        let monitor = Box::new(Monitor::<R>::new(owner, obj));
        if monitor.install(self_thread) {
            log::debug!(
                target: "lockkit::monitor",
                "thread {} created monitor {:p} for object {:#x}",
                ThreadOf::<R>::id(owner),
                &*monitor,
                obj.as_raw()
            );
            R::lockkit().monitors.add(monitor);
        }
        debug_assert!(matches!(
            obj.header().lock_word().state(),
            LockState::FatLocked { .. }
        ));
    }

    /// Blocking acquire. Contending threads drop to the suspended runtime
    /// state while parked so the GC can scan them.
    pub fn lock(&self, thread: VmThread) {
        let threshold = R::lockkit().options().lock_profiling_threshold_ms;
        let mut inner = self.monitor_lock.lock();
        loop {
            if inner.owner.is_null() {
                inner.owner = thread;
                debug_assert_eq!(inner.recursion, 0);
                if threshold != 0 {
                    inner.locking_site = ThreadOf::<R>::current_location(thread);
                }
                return;
            }
            if inner.owner == thread {
                inner.recursion += 1;
                return;
            }

            // Contended.
            let contention_start = (threshold != 0).then(Instant::now);
            let owners_site = inner.locking_site;
            let sync = ThreadOf::<R>::sync(thread);
            sync.set_monitor_enter_object(self.object());
            drop(inner);

            ThreadOf::<R>::transition_from_runnable_to_suspended(thread, ThreadState::Blocked);
            {
                let mut blocked = self.monitor_lock.lock();
                // The owner may have let go between our two acquisitions.
                if !blocked.owner.is_null() {
                    self.contenders.wait(&mut blocked);
                    if let Some(start) = contention_start {
                        self.log_contention_sample(thread, start.elapsed(), owners_site);
                    }
                }
            }
            ThreadOf::<R>::transition_from_suspended_to_runnable(thread);

            sync.set_monitor_enter_object(None);
            inner = self.monitor_lock.lock();
        }
    }

    pub fn unlock(&self, thread: VmThread) -> Result<(), SyncError> {
        let mut inner = self.monitor_lock.lock();
        if inner.owner == thread {
            if inner.recursion > 0 {
                inner.recursion -= 1;
            } else {
                inner.owner = VmThread::NULL;
                inner.locking_site = None;
                self.contenders.notify_one();
            }
            Ok(())
        } else {
            let found = inner.owner;
            drop(inner);
            Err(failed_unlock::<R>(self.object(), thread, found, Some(self)))
        }
    }

    /// Wait until timeout, interrupt, or notification.
    ///
    /// Releases the monitor however deep the recursion, parks on the thread's
    /// private condition, and restores the full tenancy before returning.
    /// `why` distinguishes untimed waits, timed waits and sleeps; a zero
    /// timeout turns a timed wait into an untimed one.
    pub fn wait(
        &self,
        thread: VmThread,
        ms: i64,
        ns: i32,
        interruptible: bool,
        mut why: ThreadState,
    ) -> Result<(), SyncError> {
        debug_assert!(why.is_waiting_kind());
        let mut inner = self.monitor_lock.lock();

        if inner.owner != thread {
            return Err(SyncError::illegal_monitor_state(
                "object not locked by thread before wait()",
            ));
        }

        // wait(0, 0) is defined as wait().
        if why == ThreadState::TimedWaiting && ms == 0 && ns == 0 {
            why = ThreadState::Waiting;
        }

        if ms < 0 || !(0..=999_999).contains(&ns) {
            return Err(SyncError::IllegalArgument { ms, ns });
        }

        // Enqueue ahead of clearing the owner so the wait-set helpers can
        // still check ownership.
        Self::append_to_wait_set(&mut inner, thread);
        let saved_recursion = inner.recursion;
        let saved_site = inner.locking_site.take();
        inner.recursion = 0;
        inner.owner = VmThread::NULL;

        ThreadOf::<R>::transition_from_runnable_to_suspended(thread, why);

        let sync = ThreadOf::<R>::sync(thread);
        let was_interrupted;
        {
            // Publish wait_monitor and release the monitor as one step: no
            // notifier can traverse the wait set until the internal mutex
            // drops, and by then wait_monitor is set.
            let mut state = sync.wait_mutex.lock();
            debug_assert!(state.wait_monitor.is_none());
            state.wait_monitor = Some(self.to_ref());

            self.contenders.notify_one();
            drop(inner);

            if state.interrupted {
                // Interrupted before the wait began; skip the park entirely.
                was_interrupted = true;
            } else {
                if why == ThreadState::Waiting {
                    sync.wait_cond.wait(&mut state);
                } else {
                    sync.wait_cond
                        .wait_for(&mut state, timed_wait_duration(ms, ns));
                }
                was_interrupted = state.interrupted;
                state.interrupted = false;
            }
        }

        ThreadOf::<R>::transition_from_suspended_to_runnable(thread);

        // wait_monitor stays set until we are runnable again so stack dumps
        // taken during the wait name the monitor rather than nothing.
        {
            let mut state = sync.wait_mutex.lock();
            debug_assert!(state.wait_monitor.is_some());
            state.wait_monitor = None;
        }

        self.lock(thread);
        let mut inner = self.monitor_lock.lock();

        // Restore the tenancy before dequeuing so wait-set invariants are
        // checked against a valid owner. We may still be enqueued if the wake
        // came from a timeout or interrupt rather than notify-consumption.
        inner.owner = thread;
        inner.recursion = saved_recursion;
        inner.locking_site = saved_site;
        Self::remove_from_wait_set(&mut inner, thread);
        drop(inner);

        if was_interrupted {
            // The interrupted status is cleared when the exception is raised,
            // and stays cleared for uninterruptible waits too.
            sync.set_interrupted(false);
            if interruptible {
                return Err(SyncError::Interrupted);
            }
        }
        Ok(())
    }

    /// Wakes at most one waiter that is still waiting on this monitor,
    /// skipping entries that already left via timeout or interrupt.
    pub fn notify(&self, thread: VmThread) -> Result<(), SyncError> {
        let mut inner = self.monitor_lock.lock();
        if inner.owner != thread {
            return Err(SyncError::illegal_monitor_state(
                "object not locked by thread before notify()",
            ));
        }
        while !inner.wait_set.is_null() {
            let waiter = inner.wait_set;
            let waiter_sync = ThreadOf::<R>::sync(waiter);
            inner.wait_set = waiter_sync.wait_next();
            waiter_sync.set_wait_next(VmThread::NULL);

            let state = waiter_sync.wait_mutex.lock();
            if state.wait_monitor == Some(self.to_ref()) {
                waiter_sync.wait_cond.notify_one();
                return Ok(());
            }
        }
        Ok(())
    }

    /// Drains the wait set, delivering a wake to every dequeued thread.
    pub fn notify_all(&self, thread: VmThread) -> Result<(), SyncError> {
        let mut inner = self.monitor_lock.lock();
        if inner.owner != thread {
            return Err(SyncError::illegal_monitor_state(
                "object not locked by thread before notifyAll()",
            ));
        }
        while !inner.wait_set.is_null() {
            let waiter = inner.wait_set;
            let waiter_sync = ThreadOf::<R>::sync(waiter);
            inner.wait_set = waiter_sync.wait_next();
            waiter_sync.set_wait_next(VmThread::NULL);
            waiter_sync.wake();
        }
        Ok(())
    }

    pub fn owner_thread_id(&self) -> u32 {
        let inner = self.monitor_lock.lock();
        if inner.owner.is_null() {
            INVALID_THREAD_ID
        } else {
            ThreadOf::<R>::id(inner.owner)
        }
    }

    pub(crate) fn owner(&self) -> VmThread {
        self.monitor_lock.lock().owner
    }

    fn append_to_wait_set(inner: &mut MonitorInner, thread: VmThread) {
        let sync = ThreadOf::<R>::sync(thread);
        debug_assert!(sync.wait_next().is_null());
        if inner.wait_set.is_null() {
            inner.wait_set = thread;
            return;
        }
        let mut tail = inner.wait_set;
        loop {
            let next = ThreadOf::<R>::sync(tail).wait_next();
            if next.is_null() {
                break;
            }
            tail = next;
        }
        ThreadOf::<R>::sync(tail).set_wait_next(thread);
    }

    fn remove_from_wait_set(inner: &mut MonitorInner, thread: VmThread) {
        if inner.wait_set.is_null() {
            return;
        }
        let sync = ThreadOf::<R>::sync(thread);
        if inner.wait_set == thread {
            inner.wait_set = sync.wait_next();
            sync.set_wait_next(VmThread::NULL);
            return;
        }
        let mut t = inner.wait_set;
        loop {
            let t_sync = ThreadOf::<R>::sync(t);
            let next = t_sync.wait_next();
            if next.is_null() {
                return;
            }
            if next == thread {
                t_sync.set_wait_next(sync.wait_next());
                sync.set_wait_next(VmThread::NULL);
                return;
            }
            t = next;
        }
    }

    fn log_contention_sample(
        &self,
        thread: VmThread,
        waited: Duration,
        owners_site: Option<ProfileSite>,
    ) {
        let options = R::lockkit().options();
        let threshold = options.lock_profiling_threshold_ms;
        let wait_ms = waited.as_millis() as u64;
        let sample_percent = contention_sample_percent(wait_ms, threshold);
        if sample_percent == 0 {
            return;
        }
        if !options.sensitive_thread() && sample_roll() >= sample_percent {
            return;
        }
        let (held_at, line) = match owners_site {
            Some(site) => R::translate_location(site),
            None => (String::new(), 0),
        };
        log::info!(
            target: "lockkit::contention",
            "thread {} waited {}ms for monitor {:p} held at {}:{} (sampled at {}%)",
            ThreadOf::<R>::id(thread),
            wait_ms,
            self,
            held_at,
            line,
            sample_percent
        );
    }
}

/// Waits past the profiling threshold always log; shorter waits are sampled
/// in proportion to how close they came.
fn contention_sample_percent(wait_ms: u64, threshold_ms: u64) -> u64 {
    if wait_ms >= threshold_ms {
        100
    } else {
        100 * wait_ms / threshold_ms
    }
}

fn timed_wait_duration(ms: i64, ns: i32) -> Duration {
    let ms = ms.min(MAX_TIMED_WAIT_MS) as u64;
    Duration::from_millis(ms) + Duration::from_nanos(ns as u64)
}

fn sample_roll() -> u64 {
    thread_local! {
        static STATE: Cell<u64> = Cell::new(0);
    }
    STATE.with(|state| {
        let mut x = state.get();
        if x == 0 {
            x = state as *const Cell<u64> as u64 | 1;
        }
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        state.set(x);
        x % 100
    })
}

/// Builds the IllegalMonitorState diagnostic for a failed unlock. `found` is
/// the owner observed at the failing check; the owner re-read here may
/// disagree with it, and the message calls the race out when they do. Names
/// resolve under the thread-registry lock so the threads cannot exit while we
/// format them.
pub(crate) fn failed_unlock<R: Runtime>(
    obj: Option<ObjectReference>,
    expected: VmThread,
    found: VmThread,
    monitor: Option<&Monitor<R>>,
) -> SyncError {
    let (current, current_s, expected_s, found_s) = R::with_thread_registry_locked(|| {
        let current = monitor.map_or(VmThread::NULL, |m| m.owner());
        (
            current,
            thread_to_string::<R>(current),
            thread_to_string::<R>(expected),
            thread_to_string::<R>(found),
        )
    });
    let ty = obj.map_or_else(|| "<unknown>".to_string(), R::type_name);
    let message = if current.is_null() {
        if found.is_null() {
            format!("unlock of unowned monitor on object of type '{ty}' on thread '{expected_s}'")
        } else {
            format!(
                "unlock of monitor owned by '{found_s}' on object of type '{ty}' \
                 (where now the monitor appears unowned) on thread '{expected_s}'"
            )
        }
    } else if found.is_null() {
        format!(
            "unlock of monitor owned by '{current_s}' on object of type '{ty}' \
             (originally believed to be unowned) on thread '{expected_s}'"
        )
    } else if found != current {
        format!(
            "unlock of monitor originally owned by '{found_s}' (now owned by '{current_s}') \
             on object of type '{ty}' on thread '{expected_s}'"
        )
    } else {
        format!("unlock of monitor owned by '{current_s}' on object of type '{ty}' on thread '{expected_s}'")
    };
    SyncError::IllegalMonitorState(message)
}

fn thread_to_string<R: Runtime>(thread: VmThread) -> String {
    if thread.is_null() {
        "<none>".to_string()
    } else {
        ThreadOf::<R>::describe(thread)
    }
}

/// Point-in-time snapshot of one object's lock, for thread dumps and tests.
/// Only meaningful while the world is quiescent or the owner is pinned.
pub struct MonitorInfo {
    pub owner: Option<VmThread>,
    pub entry_count: u32,
    pub waiters: Vec<VmThread>,
}

impl MonitorInfo {
    pub fn of<R: Runtime>(obj: ObjectReference) -> MonitorInfo {
        match obj.header().lock_word().state() {
            LockState::Unlocked => MonitorInfo {
                owner: None,
                entry_count: 0,
                waiters: Vec::new(),
            },
            LockState::ThinLocked { owner, count } => MonitorInfo {
                owner: R::find_thread_by_id(owner),
                entry_count: 1 + count,
                waiters: Vec::new(),
            },
            LockState::FatLocked { monitor } => {
                let monitor = Monitor::<R>::from_ref(monitor);
                let inner = monitor.monitor_lock.lock();
                let mut waiters = Vec::new();
                let mut t = inner.wait_set;
                while !t.is_null() {
                    waiters.push(t);
                    t = ThreadOf::<R>::sync(t).wait_next();
                }
                MonitorInfo {
                    owner: (!inner.owner.is_null()).then_some(inner.owner),
                    entry_count: 1 + inner.recursion,
                    waiters,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::mock::{
        captured_logs, install_capture_logger, sensitive_probe_calls, MockObject, MockThread,
        MockVM,
    };
    use crate::sync::SyncError;
    use crate::threads::{MethodId, Thread};

    #[test]
    fn unlock_by_non_owner_names_both_threads() {
        let me = MockThread::attach("owner");
        let obj = MockObject::alloc();
        // Born owned by `me`, as inflation leaves it.
        let monitor = Monitor::<MockVM>::new(me, obj);

        let intruder = MockThread::attach_detached("intruder");
        let err = monitor.unlock(intruder).unwrap_err();
        let SyncError::IllegalMonitorState(message) = err else {
            panic!("expected IllegalMonitorState, got {err:?}");
        };
        assert!(message.contains("owner"), "{message}");
        assert!(message.contains("intruder"), "{message}");

        monitor.unlock(me).unwrap();
    }

    #[test]
    fn notify_without_ownership_is_rejected() {
        let me = MockThread::attach("notifier");
        let obj = MockObject::alloc();
        let monitor = Monitor::<MockVM>::new(me, obj);
        // Release the inflation-time tenancy.
        monitor.unlock(me).unwrap();

        assert!(matches!(
            monitor.notify(me),
            Err(SyncError::IllegalMonitorState(_))
        ));
        assert!(matches!(
            monitor.notify_all(me),
            Err(SyncError::IllegalMonitorState(_))
        ));
    }

    #[test]
    fn recursion_counts_surplus_acquisitions() {
        let me = MockThread::attach("recursive");
        let obj = MockObject::alloc();
        // One acquisition from construction, three recursive on top.
        let monitor = Monitor::<MockVM>::new(me, obj);
        monitor.lock(me);
        monitor.lock(me);
        monitor.lock(me);
        assert_eq!(monitor.owner_thread_id(), MockThread::id(me));
        monitor.unlock(me).unwrap();
        monitor.unlock(me).unwrap();
        monitor.unlock(me).unwrap();
        assert_eq!(monitor.owner_thread_id(), MockThread::id(me));
        monitor.unlock(me).unwrap();
        assert_eq!(monitor.owner_thread_id(), INVALID_THREAD_ID);
    }

    #[test]
    fn timed_wait_duration_clamps() {
        let d = timed_wait_duration(i64::MAX, 0);
        assert_eq!(d, Duration::from_millis(MAX_TIMED_WAIT_MS as u64));
        let d = timed_wait_duration(1, 500);
        assert_eq!(d, Duration::from_millis(1) + Duration::from_nanos(500));
    }

    #[test]
    fn contention_sample_percent_is_proportional() {
        assert_eq!(contention_sample_percent(0, 10), 0);
        assert_eq!(contention_sample_percent(2, 10), 20);
        assert_eq!(contention_sample_percent(9, 10), 90);
        assert_eq!(contention_sample_percent(10, 10), 100);
        assert_eq!(contention_sample_percent(500, 10), 100);
    }

    #[test]
    fn contended_lock_emits_sampled_contention_event() {
        install_capture_logger();

        let me = MockThread::attach("profiled");
        MockThread::set_location(
            me,
            ProfileSite {
                method: MethodId(0x40),
                pc: 7,
            },
        );
        let obj = MockObject::alloc();
        let monitor: &'static Monitor<MockVM> = Box::leak(Box::new(Monitor::new(me, obj)));
        monitor.unlock(me).unwrap();
        // Reacquire so the holder's profile site is recorded on the monitor.
        monitor.lock(me);

        let probes_before = sensitive_probe_calls();
        let (handle_tx, handle_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let contender = MockThread::spawn("contender", move |t| {
            handle_tx.send(t).unwrap();
            monitor.lock(t);
            monitor.unlock(t).unwrap();
            done_tx.send(()).unwrap();
        });

        // Wait until the contender has hit the contended path, then keep the
        // monitor held past the sampling threshold before letting go.
        let t = handle_rx.recv().unwrap();
        while MockThread::sync(t).monitor_enter_object().is_none() {
            std::thread::sleep(Duration::from_millis(1));
        }
        std::thread::sleep(Duration::from_millis(50));
        monitor.unlock(me).unwrap();
        done_rx.recv().unwrap();
        contender.join().unwrap();

        // A sensitive thread is sampled before any roll of the dice, so the
        // probe must have been consulted and the event must have landed with
        // the holder's acquire site resolved.
        assert!(sensitive_probe_calls() > probes_before);
        let events = captured_logs("lockkit::contention");
        assert!(
            events.iter().any(|event| event.contains("method#0x40")),
            "no sampled contention event named the holder's site: {events:?}"
        );
    }
}
