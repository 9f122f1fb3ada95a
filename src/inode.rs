//! Inode identity and block addressing types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical position of a block within an inode's address space.
pub type BlockIndex = u64;

/// Identifies an inode at a specific generation.
///
/// Every mutation of a blockset is attributed to an `InodeRef`. It is not part
/// of the read path; it records provenance so that reference counting and
/// snapshot garbage collection can tell which inode generation owns a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeRef {
    pub inode: u64,
    pub generation: u64,
}

impl InodeRef {
    /// Create a new inode reference
    pub fn new(inode: u64, generation: u64) -> Self {
        Self { inode, generation }
    }

    /// Reference to the next generation of the same inode, `None` once the
    /// generation counter is exhausted
    pub fn next_generation(&self) -> Option<Self> {
        Some(Self {
            inode: self.inode,
            generation: self.generation.checked_add(1)?,
        })
    }
}

impl fmt::Display for InodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.inode, self.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_ordering() {
        let a = InodeRef::new(1, 1);
        let b = a.next_generation().unwrap();

        assert_eq!(a.to_string(), "1:1");
        assert_eq!(b, InodeRef::new(1, 2));
        assert!(a < b);
        assert!(InodeRef::new(1, 9) < InodeRef::new(2, 0));
    }

    #[test]
    fn test_generation_exhausted() {
        assert_eq!(InodeRef::new(7, u64::MAX).next_generation(), None);
        assert_eq!(
            InodeRef::new(7, u64::MAX - 1).next_generation(),
            Some(InodeRef::new(7, u64::MAX))
        );
    }
}
