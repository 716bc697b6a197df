use std::fmt;

use serde::{Deserialize, Serialize};

use crate::chrom_list::ChromList;
use crate::int_range::IntRange;

/// A contiguous region of the genome on a single chromosome
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Deserialize, Serialize)]
pub struct GenomeSegment {
    /// Index into the ChromList shared by all segments from one analysis
    pub chrom_index: usize,
    pub range: IntRange,
}

impl GenomeSegment {
    pub fn new(chrom_index: usize, start: i64, end: i64) -> Self {
        Self {
            chrom_index,
            range: IntRange::from_pair(start, end),
        }
    }

    /// Format as a 'samtools' style region string (e.g. chr7:101-200)
    ///
    pub fn to_region_str(&self, chrom_list: &ChromList) -> String {
        let chrom = chrom_list.label(self.chrom_index);
        format!("{chrom}:{}-{}", self.range.start + 1, self.range.end)
    }

    pub fn intersect(&self, other: &Self) -> bool {
        self.chrom_index == other.chrom_index && self.range.intersect_range(&other.range)
    }
}

impl fmt::Debug for GenomeSegment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Segment: {}:{:?}", self.chrom_index, self.range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify the derived segment ordering used when sorting bins
    ///
    #[test]
    fn test_segment_order() {
        // Ensure chrom_index has priority over pos
        let segment1 = GenomeSegment::new(0, 10, 11);
        let segment2 = GenomeSegment::new(1, 1, 2);
        assert!(segment1 < segment2);

        // Ensure begin pos has priority over end pos
        let segment1 = GenomeSegment::new(0, 1, 20);
        let segment2 = GenomeSegment::new(0, 10, 11);
        assert!(segment1 < segment2);
    }

    #[test]
    fn test_to_region_str() {
        let mut chrom_list = ChromList::default();
        chrom_list.add_chrom("chr1");
        chrom_list.add_chrom("chr2");

        let segment = GenomeSegment::new(1, 10, 11);
        assert_eq!(segment.to_region_str(&chrom_list), "chr2:11-11".to_string());
    }
}
