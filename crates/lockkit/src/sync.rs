//! Runtime-facing operations on object locks.
//!
//! These free functions drive the lock-word state machine: the uncontended
//! paths are a CAS or a plain store on the word, contention falls back to
//! bounded spinning and then suspend-the-owner inflation, and everything past
//! inflation delegates to the [`Monitor`](monitor::Monitor) record.

pub mod introspect;
pub mod lock_word;
pub mod monitor;
pub mod registry;

use std::time::Duration;

use thiserror::Error;

use crate::objectmodel::ObjectReference;
use crate::sync::lock_word::{LockState, LockWord, THIN_LOCK_MAX_COUNT};
use crate::sync::monitor::{failed_unlock, Monitor};
use crate::threads::{Thread, ThreadState, VmThread, INVALID_THREAD_ID};
use crate::{Runtime, ThreadOf};

/// Pause between spin attempts on a thin lock held by another thread.
const SPIN_SLEEP: Duration = Duration::from_nanos(1_000);

/// Errors surfaced to the embedding runtime, which converts them into managed
/// exceptions on the calling thread. Contention is not an error and nothing
/// here is retried internally.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{0}")]
    IllegalMonitorState(String),
    #[error("timeout arguments out of range: ms={ms} ns={ns}")]
    IllegalArgument { ms: i64, ns: i32 },
    #[error("interrupted")]
    Interrupted,
}

impl SyncError {
    pub(crate) fn illegal_monitor_state(message: &str) -> Self {
        Self::IllegalMonitorState(message.to_string())
    }
}

/// Acquires `obj`'s monitor, blocking until it is held.
///
/// Lock-free on the uncontended transitions; a thin lock held by another
/// thread is spun on for a bounded budget and then inflated on the owner's
/// behalf after suspending it, so this thread can park on the monitor's
/// contenders condition instead of burning cycles.
pub fn enter<R: Runtime>(thread: VmThread, obj: ObjectReference) {
    let tid = ThreadOf::<R>::id(thread);
    let max_spins = R::lockkit().options().max_spins_before_inflation;
    let header = obj.header();
    let mut contention_count = 0u32;
    loop {
        let word = header.lock_word();
        match word.state() {
            LockState::Unlocked => {
                let thin = LockWord::from_thin_lock(tid, 0);
                if header.cas_lock_word(word, thin) {
                    return;
                }
            }
            LockState::ThinLocked { owner, count } => {
                if owner == tid {
                    if count + 1 < THIN_LOCK_MAX_COUNT {
                        // Only the owner writes the recursion, no CAS needed.
                        header.set_lock_word(LockWord::from_thin_lock(tid, count + 1));
                        return;
                    }
                    // The count is about to hit the thin ceiling; switch to a
                    // monitor, which carries the recursion unbounded.
                    Monitor::<R>::inflate(thread, thread, obj);
                } else {
                    let sync = ThreadOf::<R>::sync(thread);
                    sync.set_monitor_enter_object(Some(obj));
                    contention_count += 1;
                    if contention_count <= max_spins {
                        std::thread::sleep(SPIN_SLEEP);
                    } else {
                        contention_count = 0;
                        // Out of spin budget: stop the owner and inflate on
                        // its behalf. Blocked state first, so the GC is free
                        // to run while we wait on the suspension.
                        ThreadOf::<R>::transition_from_runnable_to_suspended(
                            thread,
                            ThreadState::Blocked,
                        );
                        if header.lock_word() == word {
                            if let Some(owner_thread) = R::suspend_thread_by_id(owner) {
                                // The owner may have released or inflated
                                // before the suspension landed.
                                let reread = header.lock_word();
                                if matches!(
                                    reread.state(),
                                    LockState::ThinLocked { owner: o, .. } if o == owner
                                ) {
                                    Monitor::<R>::inflate(thread, owner_thread, obj);
                                }
                                R::resume(owner_thread);
                            }
                        }
                        ThreadOf::<R>::transition_from_suspended_to_runnable(thread);
                    }
                    sync.set_monitor_enter_object(None);
                }
            }
            LockState::FatLocked { monitor } => {
                Monitor::<R>::from_ref(monitor).lock(thread);
                return;
            }
        }
    }
}

/// Releases one acquisition of `obj`'s monitor.
pub fn exit<R: Runtime>(thread: VmThread, obj: ObjectReference) -> Result<(), SyncError> {
    let header = obj.header();
    let word = header.lock_word();
    match word.state() {
        LockState::Unlocked => Err(failed_unlock::<R>(
            Some(obj),
            thread,
            VmThread::NULL,
            None,
        )),
        LockState::ThinLocked { owner, count } => {
            let tid = ThreadOf::<R>::id(thread);
            if owner != tid {
                let found = R::find_thread_by_id(owner).unwrap_or(VmThread::NULL);
                Err(failed_unlock::<R>(Some(obj), thread, found, None))
            } else {
                // Owner-private transition: a plain store suffices.
                if count != 0 {
                    header.set_lock_word(LockWord::from_thin_lock(tid, count - 1));
                } else {
                    header.set_lock_word(LockWord::UNLOCKED);
                }
                Ok(())
            }
        }
        LockState::FatLocked { monitor } => Monitor::<R>::from_ref(monitor).unlock(thread),
    }
}

/// Waits on `obj`'s monitor, inflating a held thin lock first (waiters only
/// exist on the inflated form). `why` must be a waiting kind and selects the
/// suspended state the waiter parks in.
pub fn wait<R: Runtime>(
    thread: VmThread,
    obj: ObjectReference,
    ms: i64,
    ns: i32,
    interruptible: bool,
    why: ThreadState,
) -> Result<(), SyncError> {
    let header = obj.header();
    let mut word = header.lock_word();
    match word.state() {
        LockState::Unlocked => {
            return Err(SyncError::illegal_monitor_state(
                "object not locked by thread before wait()",
            ));
        }
        LockState::ThinLocked { owner, .. } => {
            if owner != ThreadOf::<R>::id(thread) {
                return Err(SyncError::illegal_monitor_state(
                    "object not locked by thread before wait()",
                ));
            }
            // We own the thin lock; inflate so there is a wait set to join.
            Monitor::<R>::inflate(thread, thread, obj);
            word = header.lock_word();
        }
        LockState::FatLocked { .. } => {}
    }
    match word.state() {
        LockState::FatLocked { monitor } => {
            Monitor::<R>::from_ref(monitor).wait(thread, ms, ns, interruptible, why)
        }
        // Inflation published a fat word before returning.
        _ => unreachable!("lock word not fat after inflation"),
    }
}

/// Wakes one waiter on `obj`'s monitor.
pub fn notify<R: Runtime>(thread: VmThread, obj: ObjectReference) -> Result<(), SyncError> {
    notify_on::<R>(thread, obj, false)
}

/// Wakes every waiter on `obj`'s monitor.
pub fn notify_all<R: Runtime>(thread: VmThread, obj: ObjectReference) -> Result<(), SyncError> {
    notify_on::<R>(thread, obj, true)
}

fn notify_on<R: Runtime>(
    thread: VmThread,
    obj: ObjectReference,
    all: bool,
) -> Result<(), SyncError> {
    let word = obj.header().lock_word();
    match word.state() {
        LockState::Unlocked => Err(SyncError::illegal_monitor_state(
            "object not locked by thread before notify()",
        )),
        LockState::ThinLocked { owner, .. } => {
            if owner != ThreadOf::<R>::id(thread) {
                Err(SyncError::illegal_monitor_state(
                    "object not locked by thread before notify()",
                ))
            } else {
                // A thin lock has no monitor and therefore no waiters.
                Ok(())
            }
        }
        LockState::FatLocked { monitor } => {
            let monitor = Monitor::<R>::from_ref(monitor);
            if all {
                monitor.notify_all(thread)
            } else {
                monitor.notify(thread)
            }
        }
    }
}

/// The tid of the thread holding `obj`'s monitor, or [`INVALID_THREAD_ID`].
pub fn owner_tid<R: Runtime>(obj: ObjectReference) -> u32 {
    match obj.header().lock_word().state() {
        LockState::Unlocked => INVALID_THREAD_ID,
        LockState::ThinLocked { owner, .. } => owner,
        LockState::FatLocked { monitor } => Monitor::<R>::from_ref(monitor).owner_thread_id(),
    }
}
