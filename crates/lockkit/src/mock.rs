//! A minimal runtime binding used by the test suite.
//!
//! `MockVM` backs the [`Runtime`] contract with a boxed-and-leaked thread
//! block per thread, a `Vec`-based thread registry, and flag-based
//! suspension. Mock suspension does not stop the OS thread; tests arrange
//! schedules where a "suspended" thread is genuinely not touching the lock
//! word, which is the same guarantee the real registry provides.
//!
//! The mock subsystem runs with lock profiling enabled and a sensitive-thread
//! probe that counts how often sampling consults it, and `log` events can be
//! routed into an in-memory buffer via [`install_capture_logger`], so tests
//! can assert on contention sampling.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::LazyLock;
use std::thread::JoinHandle;

use log::{LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;

use crate::objectmodel::{HeapObjectHeader, ObjectReference};
use crate::sync::introspect::Frame;
use crate::threads::{ProfileSite, Thread, ThreadState, ThreadSync, VmThread};
use crate::{Lockkit, LockkitBuilder, Runtime};

pub struct MockVM;

static LOCKKIT: LazyLock<Lockkit<MockVM>> = LazyLock::new(|| {
    LockkitBuilder::new()
        .lock_profiling_threshold_ms(10)
        .sensitive_thread_hook(sensitive_thread_probe)
        .build()
});

static THREADS: Mutex<Vec<VmThread>> = Mutex::new(Vec::new());

static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

static SENSITIVE_PROBE_CALLS: AtomicUsize = AtomicUsize::new(0);

fn sensitive_thread_probe() -> bool {
    SENSITIVE_PROBE_CALLS.fetch_add(1, Ordering::Relaxed);
    true
}

/// How many times contention sampling has consulted the sensitive-thread
/// hook.
pub fn sensitive_probe_calls() -> usize {
    SENSITIVE_PROBE_CALLS.load(Ordering::Relaxed)
}

static LOG_RECORDS: Mutex<Vec<(String, String)>> = Mutex::new(Vec::new());

struct CaptureLogger;

impl Log for CaptureLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        LOG_RECORDS
            .lock()
            .push((record.target().to_string(), record.args().to_string()));
    }

    fn flush(&self) {}
}

static CAPTURE_LOGGER: CaptureLogger = CaptureLogger;

/// Routes `log` events into an in-memory buffer tests can assert on. Safe to
/// call from any number of tests; the first call installs the logger.
pub fn install_capture_logger() {
    let _ = log::set_logger(&CAPTURE_LOGGER);
    log::set_max_level(LevelFilter::Debug);
}

/// Messages captured so far for one log target.
pub fn captured_logs(target: &str) -> Vec<String> {
    LOG_RECORDS
        .lock()
        .iter()
        .filter(|(t, _)| t == target)
        .map(|(_, message)| message.clone())
        .collect()
}

thread_local! {
    static CURRENT: Cell<VmThread> = Cell::new(VmThread::NULL);
}

impl Runtime for MockVM {
    type Thread = MockThread;
    type Frame = MockFrame;

    fn current_thread() -> VmThread {
        CURRENT.with(|current| current.get())
    }

    fn lockkit() -> &'static Lockkit<Self> {
        &LOCKKIT
    }

    fn find_thread_by_id(tid: u32) -> Option<VmThread> {
        THREADS
            .lock()
            .iter()
            .copied()
            .find(|&thread| MockThread::id(thread) == tid)
    }

    fn suspend_thread_by_id(tid: u32) -> Option<VmThread> {
        let threads = THREADS.lock();
        let thread = threads
            .iter()
            .copied()
            .find(|&thread| MockThread::id(thread) == tid)?;
        let block = MockThread::block(thread);
        // Like the real registry, suspension only lands once the target has
        // reached a safepoint; a thread still running managed code cannot be
        // stopped, and callers fall back to restarting their acquire.
        if state_from_u8(block.state.load(Ordering::SeqCst)) == ThreadState::Runnable {
            return None;
        }
        block.suspended.store(true, Ordering::SeqCst);
        Some(thread)
    }

    fn resume(thread: VmThread) {
        MockThread::block(thread)
            .suspended
            .store(false, Ordering::SeqCst);
    }

    fn with_thread_registry_locked<T>(f: impl FnOnce() -> T) -> T {
        let _guard = THREADS.lock();
        f()
    }

    fn identity_hash(obj: ObjectReference) -> u32 {
        obj.as_raw() as u32
    }

    fn type_name(_obj: ObjectReference) -> String {
        "mock.Object".to_string()
    }
}

pub struct MockThread {
    id: u32,
    name: String,
    sync: ThreadSync,
    state: AtomicU8,
    suspended: AtomicBool,
    location: Mutex<Option<ProfileSite>>,
}

const STATE_RUNNABLE: u8 = 0;
const STATE_BLOCKED: u8 = 1;
const STATE_WAITING: u8 = 2;
const STATE_TIMED_WAITING: u8 = 3;
const STATE_SLEEPING: u8 = 4;

fn state_to_u8(state: ThreadState) -> u8 {
    match state {
        ThreadState::Runnable => STATE_RUNNABLE,
        ThreadState::Blocked => STATE_BLOCKED,
        ThreadState::Waiting => STATE_WAITING,
        ThreadState::TimedWaiting => STATE_TIMED_WAITING,
        ThreadState::Sleeping => STATE_SLEEPING,
    }
}

fn state_from_u8(raw: u8) -> ThreadState {
    match raw {
        STATE_RUNNABLE => ThreadState::Runnable,
        STATE_BLOCKED => ThreadState::Blocked,
        STATE_WAITING => ThreadState::Waiting,
        STATE_TIMED_WAITING => ThreadState::TimedWaiting,
        STATE_SLEEPING => ThreadState::Sleeping,
        _ => unreachable!(),
    }
}

impl MockThread {
    fn block<'a>(thread: VmThread) -> &'a MockThread {
        unsafe { &*(thread.as_raw() as *const MockThread) }
    }

    fn new_block(name: &str) -> VmThread {
        let block = Box::leak(Box::new(MockThread {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            sync: ThreadSync::new(),
            state: AtomicU8::new(STATE_RUNNABLE),
            suspended: AtomicBool::new(false),
            location: Mutex::new(None),
        }));
        let thread = VmThread::from_raw(block as *const MockThread as usize);
        THREADS.lock().push(thread);
        thread
    }

    /// Creates a thread block, registers it, and makes it the calling
    /// thread's identity.
    pub fn attach(name: &str) -> VmThread {
        let thread = Self::new_block(name);
        CURRENT.with(|current| current.set(thread));
        thread
    }

    /// Creates and registers a thread block without binding it to the calling
    /// thread, for tests that need a second identity to poke at.
    pub fn attach_detached(name: &str) -> VmThread {
        Self::new_block(name)
    }

    /// Sets the profile site this thread reports through
    /// [`current_location`](Thread::current_location).
    pub fn set_location(thread: VmThread, site: ProfileSite) {
        *Self::block(thread).location.lock() = Some(site);
    }

    /// Runs `f` on a new OS thread attached as `name`.
    pub fn spawn(
        name: &str,
        f: impl FnOnce(VmThread) + Send + 'static,
    ) -> JoinHandle<()> {
        let name = name.to_string();
        std::thread::spawn(move || {
            let thread = MockThread::attach(&name);
            f(thread);
        })
    }
}

impl Thread<MockVM> for MockThread {
    fn id(thread: VmThread) -> u32 {
        Self::block(thread).id
    }

    fn sync<'a>(thread: VmThread) -> &'a ThreadSync {
        &Self::block(thread).sync
    }

    fn state(thread: VmThread) -> ThreadState {
        state_from_u8(Self::block(thread).state.load(Ordering::SeqCst))
    }

    fn transition_from_runnable_to_suspended(thread: VmThread, why: ThreadState) {
        Self::block(thread)
            .state
            .store(state_to_u8(why), Ordering::SeqCst);
    }

    fn transition_from_suspended_to_runnable(thread: VmThread) {
        Self::block(thread)
            .state
            .store(STATE_RUNNABLE, Ordering::SeqCst);
    }

    fn is_suspended(thread: VmThread) -> bool {
        Self::block(thread).suspended.load(Ordering::SeqCst)
    }

    fn current_location(thread: VmThread) -> Option<ProfileSite> {
        *Self::block(thread).location.lock()
    }

    fn describe(thread: VmThread) -> String {
        let block = Self::block(thread);
        format!("Thread[{},\"{}\"]", block.id, block.name)
    }
}

pub struct MockObject {
    header: HeapObjectHeader,
}

impl MockObject {
    /// Leaks a fresh object and returns a reference to it. Mock objects are
    /// never collected; registry tests drive the sweep with their own
    /// visitor verdicts instead.
    pub fn alloc() -> ObjectReference {
        let object = Box::leak(Box::new(MockObject {
            header: HeapObjectHeader::new(),
        }));
        ObjectReference::from_header(&object.header)
    }
}

/// A hand-assembled frame for visit_locks tests.
#[derive(Default)]
pub struct MockFrame {
    pub native: bool,
    pub synchronized: bool,
    pub class_initializer: bool,
    pub declaring_class: Option<ObjectReference>,
    pub receiver: Option<ObjectReference>,
    pub exception_handlers: bool,
    pub pc: u32,
    /// (acquire site offset, source register) pairs live at `pc`.
    pub acquire_sites: Vec<(u32, u16)>,
    /// (register, reference) contents readable through the stack walker.
    pub registers: Vec<(u16, ObjectReference)>,
}

impl Frame<MockVM> for MockFrame {
    fn is_native(&self) -> bool {
        self.native
    }

    fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    fn is_class_initializer(&self) -> bool {
        self.class_initializer
    }

    fn declaring_class(&self) -> Option<ObjectReference> {
        self.declaring_class
    }

    fn receiver(&self) -> Option<ObjectReference> {
        self.receiver
    }

    fn has_exception_handlers(&self) -> bool {
        self.exception_handlers
    }

    fn pc(&self) -> u32 {
        self.pc
    }

    fn lock_acquire_sites(&self, pc: u32) -> Vec<u32> {
        if pc != self.pc {
            return Vec::new();
        }
        self.acquire_sites.iter().map(|&(site, _)| site).collect()
    }

    fn acquire_source_register(&self, site: u32) -> u16 {
        self.acquire_sites
            .iter()
            .find(|&&(s, _)| s == site)
            .map(|&(_, vreg)| vreg)
            .expect("unknown acquire site")
    }

    fn read_reference_register(&self, vreg: u16) -> Option<ObjectReference> {
        self.registers
            .iter()
            .find(|&&(r, _)| r == vreg)
            .map(|&(_, obj)| obj)
    }
}
