//! Subsystem configuration, fixed at [`Lockkit`](crate::Lockkit) build time.

/// Tunables for the lock subsystem.
#[derive(Clone)]
pub struct Options {
    /// Contended acquires that waited at least this long always log a
    /// contention event; shorter waits are sampled proportionally. Zero
    /// disables lock profiling entirely.
    pub lock_profiling_threshold_ms: u64,
    /// Spin attempts against a thin lock held by another thread before
    /// falling back to suspend-and-inflate.
    pub max_spins_before_inflation: u32,
    /// Threads for which contention sampling is never skipped.
    pub is_sensitive_thread: Option<fn() -> bool>,
}

impl Options {
    pub fn sensitive_thread(&self) -> bool {
        self.is_sensitive_thread.map_or(false, |hook| hook())
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            lock_profiling_threshold_ms: 0,
            max_spins_before_inflation: 50,
            is_sensitive_thread: None,
        }
    }
}
