use itertools::Itertools;
use log::info;
use serde::{Deserialize, Serialize};

use crate::boundary_detect::ConsensusRegion;
use crate::error::{TarponError, TarponResult};
use crate::retest::{EvidenceType, PosteriorCall, PosteriorTable};

/// One row of the unified call table, keyed by (region, cell, evidence type)
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CallRow {
    pub evidence: EvidenceType,
    pub region: ConsensusRegion,
    pub cell: String,

    /// None marks an indeterminate (region, cell) pair
    pub call: Option<PosteriorCall>,
}

/// Unified per-cell call table over all evidence types
///
/// Pure aggregation over retest output; rows are ordered by (evidence, region, cell) so the
/// table is identical regardless of retest scheduling.
///
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct CallTable {
    pub rows: Vec<CallRow>,
}

pub fn build_call_table(tables: &[PosteriorTable]) -> CallTable {
    let rows = tables
        .iter()
        .flat_map(|table| {
            table.regions.iter().enumerate().flat_map(move |(region_index, region)| {
                table.cells.iter().enumerate().map(move |(cell_index, cell)| CallRow {
                    evidence: table.evidence,
                    region: region.clone(),
                    cell: cell.clone(),
                    call: table.call(region_index, cell_index).cloned(),
                })
            })
        })
        .sorted_by(|a, b| {
            (a.evidence, &a.region.segment, &a.cell).cmp(&(b.evidence, &b.region.segment, &b.cell))
        })
        .collect::<Vec<_>>();
    CallTable { rows }
}

/// A consensus region passing the confidence filter
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RegionSummary {
    pub evidence: EvidenceType,
    pub region: ConsensusRegion,

    /// Cells whose max non-neutral posterior reaches the threshold
    pub supporting_cell_count: usize,

    /// Cells with a determinate posterior for this region
    pub scored_cell_count: usize,
}

/// Filter retested regions down to those confidently recurrent across the cell population
///
/// Indeterminate calls are excluded from both counts, never coerced to neutral. Raising the
/// threshold can only shrink the result.
///
pub fn summarize(
    tables: &[PosteriorTable],
    prob_threshold: f64,
    min_cells: usize,
) -> TarponResult<Vec<RegionSummary>> {
    if !(0.0..=1.0).contains(&prob_threshold) {
        return Err(TarponError::Config(format!(
            "prob_threshold must be in [0, 1], got {prob_threshold}"
        )));
    }
    if min_cells == 0 {
        return Err(TarponError::Config(
            "min_cells must be positive".to_string(),
        ));
    }

    let mut summaries = Vec::new();
    for table in tables {
        for (region_index, region) in table.regions.iter().enumerate() {
            let mut supporting_cell_count = 0;
            let mut scored_cell_count = 0;
            for cell_index in 0..table.cells.len() {
                if let Some(call) = table.call(region_index, cell_index) {
                    scored_cell_count += 1;
                    if call.max_non_neutral() >= prob_threshold {
                        supporting_cell_count += 1;
                    }
                }
            }
            if supporting_cell_count >= min_cells {
                summaries.push(RegionSummary {
                    evidence: table.evidence,
                    region: region.clone(),
                    supporting_cell_count,
                    scored_cell_count,
                });
            }
        }
    }
    summaries.sort_by(|a, b| {
        (a.evidence, &a.region.segment).cmp(&(b.evidence, &b.region.segment))
    });

    info!(
        "Summary: {} regions pass threshold {} with at least {} supporting cells",
        summaries.len(),
        prob_threshold,
        min_cells
    );
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genome_segment::GenomeSegment;
    use crate::int_range::IntRange;

    fn call(amplified: f64, deleted: f64) -> Option<PosteriorCall> {
        Some(PosteriorCall {
            amplified,
            deleted,
            neutral: 1.0 - amplified - deleted,
        })
    }

    fn test_table(evidence: EvidenceType, calls: Vec<Vec<Option<PosteriorCall>>>) -> PosteriorTable {
        let region_count = calls.len();
        let cell_count = calls[0].len();
        PosteriorTable {
            evidence,
            regions: (0..region_count)
                .map(|i| ConsensusRegion {
                    segment: GenomeSegment::new(0, (i * 10_000) as i64, (i * 10_000 + 5000) as i64),
                    bin_range: IntRange::from_pair((i * 10) as i64, (i * 10 + 5) as i64),
                    contributing_cell_count: 1,
                })
                .collect(),
            cells: (0..cell_count).map(|i| format!("cell{i}")).collect(),
            calls: calls.into_iter().flatten().collect(),
        }
    }

    fn two_region_table() -> PosteriorTable {
        test_table(
            EvidenceType::Expression,
            vec![
                // Region 0: two confident cells, one indeterminate
                vec![call(0.95, 0.01), call(0.85, 0.05), None],
                // Region 1: one borderline cell
                vec![call(0.45, 0.05), call(0.05, 0.02), call(0.1, 0.05)],
            ],
        )
    }

    #[test]
    fn test_summarize_threshold_filter() {
        let tables = vec![two_region_table()];
        let summaries = summarize(&tables, 0.8, 2).unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].supporting_cell_count, 2);
        // The indeterminate cell is excluded from the scored count
        assert_eq!(summaries[0].scored_cell_count, 2);
    }

    #[test]
    fn test_summarize_monotone_in_threshold() {
        let tables = vec![two_region_table()];
        let mut last_count = usize::MAX;
        for threshold in [0.1, 0.4, 0.8, 0.9, 0.99] {
            let summaries = summarize(&tables, threshold, 1).unwrap();
            let passing: usize = summaries.iter().map(|s| s.supporting_cell_count).sum();
            assert!(passing <= last_count);
            last_count = passing;
        }
    }

    #[test]
    fn test_summarize_invalid_params() {
        let tables = vec![two_region_table()];
        assert!(matches!(
            summarize(&tables, 1.5, 1),
            Err(TarponError::Config(_))
        ));
        assert!(matches!(
            summarize(&tables, 0.5, 0),
            Err(TarponError::Config(_))
        ));
    }

    #[test]
    fn test_build_call_table_merges_evidence() {
        let expression_table = two_region_table();
        let allele_table = test_table(
            EvidenceType::Allele,
            vec![vec![call(0.0, 0.9), call(0.0, 0.1), None]],
        );
        let call_table = build_call_table(&[allele_table, expression_table]);

        // 2 regions x 3 cells + 1 region x 3 cells
        assert_eq!(call_table.rows.len(), 9);
        // Rows are ordered by evidence first
        assert_eq!(call_table.rows[0].evidence, EvidenceType::Expression);
        assert_eq!(call_table.rows[8].evidence, EvidenceType::Allele);
    }
}
