//! Read-only queries over lock state, for thread dumps, debugger plumbing
//! and heap verification.

use std::fmt;

use crate::objectmodel::ObjectReference;
use crate::sync::lock_word::{LockState, LockWord};
use crate::sync::monitor::Monitor;
use crate::sync::owner_tid;
use crate::threads::{Thread, ThreadState, VmThread, INVALID_THREAD_ID};
use crate::{Runtime, ThreadOf};

/// Stack-walker and verifier contract for one frame, used by [`visit_locks`].
///
/// The verifier side reports the instruction offsets of the lock-acquire
/// instructions whose acquisitions are still live at a given offset; the
/// stack-walker side decodes an acquire instruction's source register and
/// reads the reference out of it.
pub trait Frame<R: Runtime> {
    fn is_native(&self) -> bool;
    fn is_synchronized(&self) -> bool;
    fn is_class_initializer(&self) -> bool;

    /// The declaring class object, reported for class initializers (the
    /// runtime holds the class lock across them).
    fn declaring_class(&self) -> Option<ObjectReference>;

    /// The receiver captured in the per-frame reference table of a native
    /// synchronized method.
    fn receiver(&self) -> Option<ObjectReference>;

    /// Whether the method has any exception handlers. A method without them
    /// has no lock-acquire instructions either.
    fn has_exception_handlers(&self) -> bool;

    fn pc(&self) -> u32;

    /// Verifier query: offsets of the acquire instructions live at `pc`.
    fn lock_acquire_sites(&self, pc: u32) -> Vec<u32>;

    /// Decodes the source virtual register of the acquire instruction at
    /// `site`.
    fn acquire_source_register(&self, site: u32) -> u16;

    /// Reads a reference out of a virtual register at this frame's offset.
    fn read_reference_register(&self, vreg: u16) -> Option<ObjectReference>;
}

/// Reports every object whose lock is held by `frame`.
pub fn visit_locks<R: Runtime>(frame: &R::Frame, mut callback: impl FnMut(ObjectReference)) {
    if frame.is_native() {
        if frame.is_synchronized() {
            if let Some(receiver) = frame.receiver() {
                callback(receiver);
            }
        }
        return;
    }

    if frame.is_class_initializer() {
        if let Some(class) = frame.declaring_class() {
            callback(class);
        }
        // Fall through: the initializer body may synchronize too.
    }

    if !frame.has_exception_handlers() {
        return;
    }

    for site in frame.lock_acquire_sites(frame.pc()) {
        let vreg = frame.acquire_source_register(site);
        if let Some(obj) = frame.read_reference_register(vreg) {
            callback(obj);
        }
    }
}

/// The object the thread is trying to enter, or failing that the object it is
/// waiting on. Debugger-facing notion of "contended".
pub fn contended_monitor<R: Runtime>(thread: VmThread) -> Option<ObjectReference> {
    let sync = ThreadOf::<R>::sync(thread);
    if let Some(obj) = sync.monitor_enter_object() {
        return Some(obj);
    }
    sync.wait_monitor()
        .and_then(|monitor| Monitor::<R>::from_ref(monitor).object())
}

/// Writes the "waiting on" / "sleeping on" / "waiting to lock" line for a
/// thread dump, or nothing if the thread is not in a lock-related state.
pub fn describe_wait<R: Runtime>(out: &mut dyn fmt::Write, thread: VmThread) -> fmt::Result {
    let state = ThreadOf::<R>::state(thread);

    let mut identity_hash = 0u32;
    let mut lock_owner = INVALID_THREAD_ID;
    let mut pretty_type = String::new();

    match state {
        ThreadState::Waiting | ThreadState::TimedWaiting | ThreadState::Sleeping => {
            if state == ThreadState::Sleeping {
                out.write_str("  - sleeping on ")?;
            } else {
                out.write_str("  - waiting on ")?;
            }
            if let Some(obj) = ThreadOf::<R>::sync(thread)
                .wait_monitor()
                .and_then(|monitor| Monitor::<R>::from_ref(monitor).object())
            {
                identity_hash = R::identity_hash(obj);
                pretty_type = R::type_name(obj);
            }
        }
        ThreadState::Blocked => {
            out.write_str("  - waiting to lock ")?;
            if let Some(obj) = ThreadOf::<R>::sync(thread).monitor_enter_object() {
                identity_hash = R::identity_hash(obj);
                lock_owner = owner_tid::<R>(obj);
                pretty_type = R::type_name(obj);
            }
        }
        // Not waiting on anything.
        _ => return Ok(()),
    }

    write!(out, "<{identity_hash:#010x}> (a {pretty_type})")?;
    if lock_owner != INVALID_THREAD_ID {
        write!(out, " held by thread {lock_owner}")?;
    }
    out.write_str("\n")
}

/// Validity check for heap verification: unlocked words are always valid, a
/// thin word must carry a real owner tid, a fat word must name a registered
/// monitor.
pub fn is_valid_lock_word<R: Runtime>(word: LockWord) -> bool {
    match word.state() {
        LockState::Unlocked => true,
        LockState::ThinLocked { owner, .. } => owner != INVALID_THREAD_ID,
        LockState::FatLocked { monitor } => R::lockkit().monitors.contains(monitor),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockFrame, MockObject, MockThread, MockVM};
    use crate::sync::lock_word::ThinCountField;
    use crate::sync::{enter, exit};
    use crate::threads::Thread;
    use easy_bitfield::BitFieldTrait;

    fn collect_locks(frame: &MockFrame) -> Vec<ObjectReference> {
        let mut seen = Vec::new();
        visit_locks::<MockVM>(frame, |obj| seen.push(obj));
        seen
    }

    #[test]
    fn native_synchronized_frame_reports_receiver() {
        let receiver = MockObject::alloc();
        let frame = MockFrame {
            native: true,
            synchronized: true,
            receiver: Some(receiver),
            ..Default::default()
        };
        assert_eq!(collect_locks(&frame), vec![receiver]);

        let frame = MockFrame {
            native: true,
            ..Default::default()
        };
        assert!(collect_locks(&frame).is_empty());
    }

    #[test]
    fn class_initializer_reports_declaring_class_and_body_locks() {
        let class = MockObject::alloc();
        let locked = MockObject::alloc();
        let frame = MockFrame {
            class_initializer: true,
            declaring_class: Some(class),
            exception_handlers: true,
            pc: 20,
            acquire_sites: vec![(4, 1)],
            registers: vec![(1, locked)],
            ..Default::default()
        };
        assert_eq!(collect_locks(&frame), vec![class, locked]);
    }

    #[test]
    fn frame_without_handlers_reports_nothing() {
        let frame = MockFrame {
            pc: 8,
            acquire_sites: vec![(2, 0)],
            registers: vec![],
            ..Default::default()
        };
        assert!(collect_locks(&frame).is_empty());
    }

    #[test]
    fn acquire_sites_resolve_through_registers() {
        let first = MockObject::alloc();
        let second = MockObject::alloc();
        let frame = MockFrame {
            exception_handlers: true,
            pc: 31,
            acquire_sites: vec![(5, 2), (17, 9)],
            registers: vec![(2, first), (9, second)],
            ..Default::default()
        };
        assert_eq!(collect_locks(&frame), vec![first, second]);
    }

    #[test]
    fn describe_wait_names_the_blocked_object_and_owner() {
        let me = MockThread::attach("holder");
        let obj = MockObject::alloc();
        enter::<MockVM>(me, obj);

        let blocked = MockThread::attach_detached("blocked");
        MockThread::transition_from_runnable_to_suspended(blocked, ThreadState::Blocked);
        MockThread::sync(blocked).set_monitor_enter_object(Some(obj));

        let mut out = String::new();
        describe_wait::<MockVM>(&mut out, blocked).unwrap();
        let expected = format!(
            "  - waiting to lock <{:#010x}> (a mock.Object) held by thread {}\n",
            MockVM::identity_hash(obj),
            MockThread::id(me)
        );
        assert_eq!(out, expected);

        MockThread::sync(blocked).set_monitor_enter_object(None);
        exit::<MockVM>(me, obj).unwrap();
    }

    #[test]
    fn describe_wait_names_the_awaited_object() {
        let me = MockThread::attach("sleeper");
        let obj = MockObject::alloc();
        let monitor = Monitor::<MockVM>::new(me, obj);

        MockThread::transition_from_runnable_to_suspended(me, ThreadState::Sleeping);
        MockThread::sync(me).wait_mutex.lock().wait_monitor = Some(monitor.to_ref());

        let mut out = String::new();
        describe_wait::<MockVM>(&mut out, me).unwrap();
        let expected = format!(
            "  - sleeping on <{:#010x}> (a mock.Object)\n",
            MockVM::identity_hash(obj)
        );
        assert_eq!(out, expected);

        MockThread::sync(me).wait_mutex.lock().wait_monitor = None;
        MockThread::transition_from_suspended_to_runnable(me);
    }

    #[test]
    fn describe_wait_of_runnable_thread_is_empty() {
        let me = MockThread::attach("runnable");
        let mut out = String::new();
        describe_wait::<MockVM>(&mut out, me).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn contended_monitor_prefers_enter_object() {
        let me = MockThread::attach("contender");
        let entering = MockObject::alloc();

        assert_eq!(contended_monitor::<MockVM>(me), None);

        MockThread::sync(me).set_monitor_enter_object(Some(entering));
        assert_eq!(contended_monitor::<MockVM>(me), Some(entering));
        MockThread::sync(me).set_monitor_enter_object(None);
    }

    #[test]
    fn contended_monitor_falls_back_to_wait_monitor() {
        let me = MockThread::attach("waiting");
        let obj = MockObject::alloc();
        let monitor = Monitor::<MockVM>::new(me, obj);

        MockThread::sync(me).wait_mutex.lock().wait_monitor = Some(monitor.to_ref());
        assert_eq!(contended_monitor::<MockVM>(me), Some(obj));
        MockThread::sync(me).wait_mutex.lock().wait_monitor = None;
    }

    #[test]
    fn lock_word_validity() {
        let me = MockThread::attach("validator");

        assert!(is_valid_lock_word::<MockVM>(LockWord::UNLOCKED));
        assert!(is_valid_lock_word::<MockVM>(LockWord::from_thin_lock(
            MockThread::id(me),
            3
        )));
        // Thin word with the invalid tid as owner.
        assert!(!is_valid_lock_word::<MockVM>(LockWord::from_raw(
            ThinCountField::encode(1)
        )));

        // A fat word is only valid once its monitor is registered.
        let obj = MockObject::alloc();
        let monitor = Box::new(Monitor::<MockVM>::new(me, obj));
        let word = LockWord::from_monitor(monitor.to_ref());
        assert!(!is_valid_lock_word::<MockVM>(word));
        MockVM::lockkit().monitors.add(monitor);
        assert!(is_valid_lock_word::<MockVM>(word));
    }
}
