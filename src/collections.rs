use std::alloc::Layout;
use std::error::Error;
use std::fmt;

pub mod rb_tree;

pub use rb_tree::RBTree;

/// The error type for `try_reserve` methods.
#[derive(Debug)]
pub struct TryReserveError {
    pub(crate) kind: TryReserveErrorKind,
}

impl TryReserveError {
    /// Details about the allocation that caused the error
    #[must_use]
    pub fn kind(&self) -> TryReserveErrorKind {
        self.kind.clone()
    }
}

impl fmt::Display for TryReserveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TryReserveErrorKind::CapacityOverflow => {
                f.write_str("requested node capacity exceeds the maximum")
            }
            TryReserveErrorKind::AllocError { layout } => {
                write!(f, "node storage allocation of {} bytes failed", layout.size())
            }
        }
    }
}

impl Error for TryReserveError {}

/// Details of the allocation that caused a `TryReserveError`
#[derive(Debug, Clone)]
pub enum TryReserveErrorKind {
    /// Error due to the computed capacity exceeding the collection's maximum
    /// (usually `isize::MAX` bytes).
    CapacityOverflow,

    /// The memory allocator returned an error
    AllocError {
        /// The layout of allocation request that failed
        layout: Layout,
    },
}
