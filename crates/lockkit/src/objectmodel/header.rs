use std::sync::atomic::{AtomicUsize, Ordering};

use crate::sync::lock_word::LockWord;

/// The one-word object header. The entire word is the lock word; identity
/// hashes and type information live with the embedding runtime.
#[repr(transparent)]
pub struct HeapObjectHeader {
    status: AtomicUsize,
}

impl HeapObjectHeader {
    pub const fn new() -> Self {
        Self {
            status: AtomicUsize::new(0),
        }
    }

    pub fn lock_word(&self) -> LockWord {
        LockWord::from_raw(self.status.load(Ordering::Acquire))
    }

    /// Plain store, for owner-private transitions (recursion bumps, final
    /// release). Cross-owner transitions must go through
    /// [`cas_lock_word`](Self::cas_lock_word).
    pub fn set_lock_word(&self, word: LockWord) {
        self.status.store(word.as_raw(), Ordering::Release);
    }

    /// Publishes `new` if the word still reads exactly `old`. The release
    /// ordering makes a published fat word the linearization point: a reader
    /// that observes it sees the monitor's fields initialized.
    pub fn cas_lock_word(&self, old: LockWord, new: LockWord) -> bool {
        self.status
            .compare_exchange(
                old.as_raw(),
                new.as_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl Default for HeapObjectHeader {
    fn default() -> Self {
        Self::new()
    }
}
