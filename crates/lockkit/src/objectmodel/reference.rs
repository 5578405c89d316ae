use std::num::NonZeroUsize;

use super::header::HeapObjectHeader;

/// A reference to a heap object. The referenced address is the address of the
/// object's [`HeapObjectHeader`]; everything past the header word is the
/// embedding runtime's business.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct ObjectReference(NonZeroUsize);

impl ObjectReference {
    pub fn from_raw(addr: usize) -> Option<Self> {
        NonZeroUsize::new(addr).map(Self)
    }

    pub fn from_header(header: &HeapObjectHeader) -> Self {
        // A reference cannot be null, the address of a live header never is.
        Self(unsafe { NonZeroUsize::new_unchecked(header as *const _ as usize) })
    }

    pub fn as_raw(self) -> usize {
        self.0.get()
    }

    /// The object's header word.
    ///
    /// The returned borrow is tied to the caller-chosen lifetime; callers must
    /// only use it while the object is reachable.
    pub fn header<'a>(self) -> &'a HeapObjectHeader {
        unsafe { &*(self.0.get() as *const HeapObjectHeader) }
    }
}
