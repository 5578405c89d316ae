//! Per-object synchronization for managed runtimes.
//!
//! Every heap object carries a one-word lock that fills the role of both a
//! mutex and a condition variable. A lock starts *thin*: the owner's thread
//! id and a small recursion count live directly in the object's header word,
//! and uncontended acquire/release is a single CAS or plain store. On
//! contention, recursion overflow, or a wait, the lock *inflates* into a
//! heap-resident [`Monitor`](sync::monitor::Monitor) with an OS mutex, a
//! contenders condition and a wait set. Inflation is one-way.
//!
//! The embedding runtime plugs in through the [`Runtime`] trait plus the
//! [`Thread`](threads::Thread) and [`Frame`](sync::introspect::Frame)
//! contracts, and drives the subsystem through the operations in [`sync`].

pub mod mock;
pub mod objectmodel;
pub mod options;
pub mod sync;
pub mod threads;

use objectmodel::ObjectReference;
use options::Options;
use sync::registry::MonitorRegistry;
use threads::{ProfileSite, VmThread};

pub type ThreadOf<R> = <R as Runtime>::Thread;
pub type FrameOf<R> = <R as Runtime>::Frame;

pub use sync::SyncError;

/// The binding between lockkit and the embedding runtime.
///
/// Everything the lock subsystem needs from the rest of the runtime comes
/// through here: the current thread, the thread registry, and the two
/// object-model queries diagnostics use.
pub trait Runtime: 'static + Sized + Send + Sync {
    type Thread: threads::Thread<Self>;
    type Frame: sync::introspect::Frame<Self>;

    fn current_thread() -> VmThread;

    /// The process-wide lock subsystem instance.
    fn lockkit() -> &'static Lockkit<Self>;

    /// Thread-registry lookup by id. Returns `None` for dead or unknown ids.
    fn find_thread_by_id(tid: u32) -> Option<VmThread>;

    /// Suspends the thread with the given id and returns its handle, or
    /// `None` if it died or could not be suspended. A successful return means
    /// the thread is stopped until [`resume`](Self::resume).
    fn suspend_thread_by_id(tid: u32) -> Option<VmThread>;

    fn resume(thread: VmThread);

    /// Runs `f` with the thread registry locked, so threads named inside
    /// cannot exit concurrently.
    fn with_thread_registry_locked<T>(f: impl FnOnce() -> T) -> T;

    fn identity_hash(obj: ObjectReference) -> u32;

    fn type_name(obj: ObjectReference) -> String;

    /// Resolves a profile site to a source file and line for contention
    /// events. The default keeps profiling usable without symbolization.
    fn translate_location(site: ProfileSite) -> (String, u32) {
        (format!("method#{:#x}", site.method.0), site.pc)
    }
}

/// The process-wide lock subsystem: the monitor registry plus configuration.
/// Built once at runtime startup and torn down with it.
pub struct Lockkit<R: Runtime> {
    pub monitors: MonitorRegistry<R>,
    options: Options,
}

impl<R: Runtime> Lockkit<R> {
    pub fn options(&self) -> &Options {
        &self.options
    }
}

pub struct LockkitBuilder {
    options: Options,
}

impl LockkitBuilder {
    pub fn new() -> Self {
        Self {
            options: Options::default(),
        }
    }

    pub fn lock_profiling_threshold_ms(mut self, ms: u64) -> Self {
        self.options.lock_profiling_threshold_ms = ms;
        self
    }

    pub fn max_spins_before_inflation(mut self, spins: u32) -> Self {
        self.options.max_spins_before_inflation = spins;
        self
    }

    pub fn sensitive_thread_hook(mut self, hook: fn() -> bool) -> Self {
        self.options.is_sensitive_thread = Some(hook);
        self
    }

    pub fn build<R: Runtime>(self) -> Lockkit<R> {
        Lockkit {
            monitors: MonitorRegistry::new(),
            options: self.options,
        }
    }
}

impl Default for LockkitBuilder {
    fn default() -> Self {
        Self::new()
    }
}
