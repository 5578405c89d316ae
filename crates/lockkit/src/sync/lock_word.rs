//! The lock word: one machine word per object encoding the object's lock
//! state. Thin state packs the owner tid and a small recursion count into the
//! word itself; fat state is a tagged pointer to an inflated
//! [`Monitor`](super::monitor::Monitor). The all-zero word is unlocked.
//!
//! Once a word goes fat it never returns to thin or unlocked for the
//! object's lifetime.

use std::num::NonZeroUsize;

use easy_bitfield::{BitField, BitFieldTrait};

pub type TagField = BitField<usize, usize, 0, 2, false>;
pub type ThinOwnerField = BitField<usize, usize, { TagField::NEXT_BIT }, 16, false>;
pub type ThinCountField = BitField<usize, usize, { ThinOwnerField::NEXT_BIT }, 12, false>;

const TAG_THIN: usize = 0;
const TAG_FAT: usize = 1;
const TAG_MASK: usize = 0b11;

/// Maximum recursion representable in the thin encoding. A thin owner that
/// would reach this count inflates instead.
pub const THIN_LOCK_MAX_COUNT: u32 = (1 << 12) - 1;

/// Largest thread id that fits the thin owner field. The thread registry
/// contract guarantees ids stay within this bound.
pub const MAX_THIN_LOCK_OWNER: u32 = (1 << 16) - 1;

/// An untyped reference to an inflated monitor, as stored in a fat lock word.
/// [`Monitor`](super::monitor::Monitor) resolves it back to the record.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct MonitorRef(NonZeroUsize);

impl MonitorRef {
    pub(crate) fn from_raw(addr: usize) -> Option<Self> {
        NonZeroUsize::new(addr).map(Self)
    }

    pub(crate) fn as_raw(self) -> usize {
        self.0.get()
    }
}

/// The three decodable lock states.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LockState {
    Unlocked,
    ThinLocked { owner: u32, count: u32 },
    FatLocked { monitor: MonitorRef },
}

/// A decoded-on-demand view over the raw header word. Pure value type; all
/// mutation happens through the object header's atomic.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LockWord(usize);

impl LockWord {
    pub const UNLOCKED: LockWord = LockWord(0);

    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> usize {
        self.0
    }

    pub fn from_thin_lock(owner: u32, count: u32) -> Self {
        debug_assert!(owner != 0 && owner <= MAX_THIN_LOCK_OWNER);
        debug_assert!(count <= THIN_LOCK_MAX_COUNT);
        let word = ThinCountField::update(
            count as usize,
            ThinOwnerField::update(owner as usize, TagField::encode(TAG_THIN)),
        );
        Self(word)
    }

    pub fn from_monitor(monitor: MonitorRef) -> Self {
        let addr = monitor.as_raw();
        debug_assert_eq!(addr & TAG_MASK, 0, "monitor insufficiently aligned");
        Self(addr | TAG_FAT)
    }

    pub fn state(self) -> LockState {
        if self.0 == 0 {
            return LockState::Unlocked;
        }
        match TagField::decode(self.0) {
            TAG_THIN => LockState::ThinLocked {
                owner: ThinOwnerField::decode(self.0) as u32,
                count: ThinCountField::decode(self.0) as u32,
            },
            TAG_FAT => match MonitorRef::from_raw(self.0 & !TAG_MASK) {
                Some(monitor) => LockState::FatLocked { monitor },
                None => invalid_lock_word(self.0),
            },
            _ => invalid_lock_word(self.0),
        }
    }
}

impl std::fmt::Debug for LockWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LockWord({:#x})", self.0)
    }
}

/// An undecodable word is a broken runtime invariant, not a recoverable
/// condition.
#[cold]
fn invalid_lock_word(raw: usize) -> ! {
    log::error!(target: "lockkit", "impossible lock word {raw:#x}");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlocked_is_zero() {
        assert_eq!(LockWord::UNLOCKED.as_raw(), 0);
        assert_eq!(LockWord::from_raw(0).state(), LockState::Unlocked);
    }

    #[test]
    fn thin_round_trip() {
        for (owner, count) in [
            (1, 0),
            (1, 1),
            (42, 17),
            (MAX_THIN_LOCK_OWNER, THIN_LOCK_MAX_COUNT),
        ] {
            let word = LockWord::from_thin_lock(owner, count);
            assert_eq!(word.state(), LockState::ThinLocked { owner, count });
        }
    }

    #[test]
    fn fat_round_trip() {
        let addr = 0x1234_5670usize & !TAG_MASK;
        let monitor = MonitorRef::from_raw(addr).unwrap();
        let word = LockWord::from_monitor(monitor);
        assert_eq!(word.state(), LockState::FatLocked { monitor });
        assert_ne!(word.as_raw(), addr);
    }

    #[test]
    fn thin_fields_do_not_overlap() {
        let word = LockWord::from_thin_lock(MAX_THIN_LOCK_OWNER, 0);
        assert_eq!(
            word.state(),
            LockState::ThinLocked {
                owner: MAX_THIN_LOCK_OWNER,
                count: 0
            }
        );
        let word = LockWord::from_thin_lock(1, THIN_LOCK_MAX_COUNT);
        assert_eq!(
            word.state(),
            LockState::ThinLocked {
                owner: 1,
                count: THIN_LOCK_MAX_COUNT
            }
        );
    }
}
