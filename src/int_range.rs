use std::fmt;

use serde::{Deserialize, Serialize};

/// A simple integer interval type
///
/// All ranges follow the bed file convention: 0-indexed, half-closed, [start,end)
///
/// Used instead of the native rust Range type to keep genomic interval semantics (ordering,
/// merging) in one place.
///
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Deserialize, Serialize)]
pub struct IntRange {
    pub start: i64,
    pub end: i64,
}

impl IntRange {
    pub fn from_int(start: i64) -> Self {
        Self {
            start,
            end: start + 1,
        }
    }

    pub fn from_pair(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn size(&self) -> i64 {
        self.end - self.start
    }

    /// Return true if pos intersects range (adjacency does not count)
    ///
    pub fn intersect_pos(&self, pos: i64) -> bool {
        pos >= self.start && pos < self.end
    }

    /// Return true if the ranges intersect (adjacency does not count)
    ///
    pub fn intersect_range(&self, other: &IntRange) -> bool {
        other.end > self.start && other.start < self.end
    }

    /// Expand this range to the union extent of the two ranges
    ///
    pub fn merge(&mut self, other: &IntRange) {
        if other.start < self.start {
            self.start = other.start;
        }
        if other.end > self.end {
            self.end = other.end;
        }
    }
}

impl fmt::Debug for IntRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}-{})", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intersect_range() {
        let r1 = IntRange::from_pair(1, 4);
        let r2 = IntRange::from_pair(3, 8);
        let r3 = IntRange::from_pair(4, 9);

        assert!(r1.intersect_range(&r2));
        assert!(r2.intersect_range(&r1));
        assert!(!r1.intersect_range(&r3));
        assert!(!r3.intersect_range(&r1));
    }

    #[test]
    fn test_merge() {
        let mut r1 = IntRange::from_pair(5, 10);
        r1.merge(&IntRange::from_pair(2, 7));
        assert_eq!(r1, IntRange::from_pair(2, 10));

        r1.merge(&IntRange::from_pair(6, 14));
        assert_eq!(r1, IntRange::from_pair(2, 14));
    }
}
