use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::chrom_list::ChromList;
use crate::coords::Bin;
use crate::genome_segment::GenomeSegment;

/// Return per-chromosome runs of bin indices
///
/// Bins are stored sorted by (chromosome, start), so each chromosome's bins form one contiguous
/// index range.
///
pub fn chrom_bin_ranges(bins: &[Bin]) -> Vec<(usize, Range<usize>)> {
    let mut ranges: Vec<(usize, Range<usize>)> = Vec::new();
    for (bin_index, bin) in bins.iter().enumerate() {
        match ranges.last_mut() {
            Some((chrom_index, range)) if *chrom_index == bin.segment.chrom_index => {
                range.end = bin_index + 1;
            }
            _ => {
                ranges.push((bin.segment.chrom_index, bin_index..bin_index + 1));
            }
        }
    }
    ranges
}

/// Return indices of all bins intersecting a genome segment
///
pub fn region_bin_indices(bins: &[Bin], segment: &GenomeSegment) -> Vec<usize> {
    bins.iter()
        .enumerate()
        .filter(|(_, bin)| bin.segment.intersect(segment))
        .map(|(bin_index, _)| bin_index)
        .collect()
}

/// Log-scale expression values for (gene, cell) pairs, aligned to genomic coordinates
///
/// Carries the per-gene reference expectation from the matched normal/reference population, so
/// that per-cell deviance is available directly.
///
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ExpressionMatrix {
    pub chrom_list: ChromList,
    pub bins: Vec<Bin>,
    pub cells: Vec<String>,

    /// Expression values in row-major (bin, cell) order; NaN marks a missing observation
    values: Vec<f64>,

    /// Mean reference expression per bin
    ref_means: Vec<f64>,
}

impl ExpressionMatrix {
    pub fn new(
        chrom_list: ChromList,
        bins: Vec<Bin>,
        cells: Vec<String>,
        values: Vec<f64>,
        ref_means: Vec<f64>,
    ) -> Self {
        assert_eq!(values.len(), bins.len() * cells.len());
        assert_eq!(ref_means.len(), bins.len());
        Self {
            chrom_list,
            bins,
            cells,
            values,
            ref_means,
        }
    }

    pub fn bin_count(&self) -> usize {
        self.bins.len()
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn value(&self, bin_index: usize, cell_index: usize) -> f64 {
        self.values[bin_index * self.cells.len() + cell_index]
    }

    pub fn ref_mean(&self, bin_index: usize) -> f64 {
        self.ref_means[bin_index]
    }

    /// Expression deviance from the reference expectation; NaN for missing observations
    pub fn deviance(&self, bin_index: usize, cell_index: usize) -> f64 {
        self.value(bin_index, cell_index) - self.ref_means[bin_index]
    }
}

/// Reference/alternate allele read counts for (SNP, cell) pairs, aligned to genomic coordinates
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AlleleMatrix {
    pub chrom_list: ChromList,
    pub bins: Vec<Bin>,
    pub cells: Vec<String>,

    /// Counts in row-major (bin, cell) order
    ref_counts: Vec<u32>,
    alt_counts: Vec<u32>,
}

impl AlleleMatrix {
    pub fn new(
        chrom_list: ChromList,
        bins: Vec<Bin>,
        cells: Vec<String>,
        ref_counts: Vec<u32>,
        alt_counts: Vec<u32>,
    ) -> Self {
        assert_eq!(ref_counts.len(), bins.len() * cells.len());
        assert_eq!(alt_counts.len(), ref_counts.len());
        Self {
            chrom_list,
            bins,
            cells,
            ref_counts,
            alt_counts,
        }
    }

    pub fn bin_count(&self) -> usize {
        self.bins.len()
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn ref_count(&self, bin_index: usize, cell_index: usize) -> u32 {
        self.ref_counts[bin_index * self.cells.len() + cell_index]
    }

    pub fn alt_count(&self, bin_index: usize, cell_index: usize) -> u32 {
        self.alt_counts[bin_index * self.cells.len() + cell_index]
    }

    pub fn coverage(&self, bin_index: usize, cell_index: usize) -> u32 {
        self.ref_count(bin_index, cell_index) + self.alt_count(bin_index, cell_index)
    }

    /// Observed alternate allele fraction, or None for zero coverage
    pub fn alt_fraction(&self, bin_index: usize, cell_index: usize) -> Option<f64> {
        let coverage = self.coverage(bin_index, cell_index);
        if coverage == 0 {
            None
        } else {
            Some(self.alt_count(bin_index, cell_index) as f64 / coverage as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_bins() -> (ChromList, Vec<Bin>) {
        let mut chrom_list = ChromList::default();
        let chr1 = chrom_list.add_chrom("chr1");
        let chr2 = chrom_list.add_chrom("chr2");
        let bins = vec![
            Bin {
                id: "A".to_string(),
                segment: GenomeSegment::new(chr1, 100, 200),
            },
            Bin {
                id: "B".to_string(),
                segment: GenomeSegment::new(chr1, 300, 400),
            },
            Bin {
                id: "C".to_string(),
                segment: GenomeSegment::new(chr2, 100, 200),
            },
        ];
        (chrom_list, bins)
    }

    #[test]
    fn test_chrom_bin_ranges() {
        let (_, bins) = test_bins();
        let ranges = chrom_bin_ranges(&bins);
        assert_eq!(ranges, vec![(0, 0..2), (1, 2..3)]);
    }

    #[test]
    fn test_region_bin_indices() {
        let (_, bins) = test_bins();
        let segment = GenomeSegment::new(0, 150, 350);
        assert_eq!(region_bin_indices(&bins, &segment), vec![0, 1]);

        let segment = GenomeSegment::new(1, 0, 1000);
        assert_eq!(region_bin_indices(&bins, &segment), vec![2]);
    }

    #[test]
    fn test_expression_deviance() {
        let (chrom_list, bins) = test_bins();
        let cells = vec!["cell1".to_string(), "cell2".to_string()];
        let values = vec![5.0, 6.0, 4.0, 4.5, 7.0, 7.5];
        let ref_means = vec![5.5, 4.0, 7.0];
        let matrix = ExpressionMatrix::new(chrom_list, bins, cells, values, ref_means);

        approx::assert_ulps_eq!(matrix.deviance(0, 0), -0.5, max_ulps = 4);
        approx::assert_ulps_eq!(matrix.deviance(1, 1), 0.5, max_ulps = 4);
        approx::assert_ulps_eq!(matrix.deviance(2, 0), 0.0, max_ulps = 4);
    }

    #[test]
    fn test_allele_fractions() {
        let (chrom_list, bins) = test_bins();
        let cells = vec!["cell1".to_string()];
        let ref_counts = vec![5, 0, 9];
        let alt_counts = vec![5, 0, 1];
        let matrix = AlleleMatrix::new(chrom_list, bins, cells, ref_counts, alt_counts);

        approx::assert_ulps_eq!(matrix.alt_fraction(0, 0).unwrap(), 0.5, max_ulps = 4);
        assert!(matrix.alt_fraction(1, 0).is_none());
        approx::assert_ulps_eq!(matrix.alt_fraction(2, 0).unwrap(), 0.1, max_ulps = 4);
    }
}
