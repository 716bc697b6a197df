use std::collections::BTreeSet;
use std::sync::mpsc::channel;

use log::info;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::coords::Bin;
use crate::deviance_model::{
    ALLELE_STATE_COUNT, AlleleDevianceModel, AlleleState, EXPRESSION_STATE_COUNT,
    ExpressionDevianceModel, ExpressionState,
};
use crate::error::{TarponError, TarponResult};
use crate::genome_segment::GenomeSegment;
use crate::int_range::IntRange;
use crate::matrix::{AlleleMatrix, ExpressionMatrix, chrom_bin_ranges};

#[derive(Clone, Debug)]
pub struct DetectParams {
    /// Per-bin prob of switching into each other state
    ///
    /// CNVs span contiguous runs of bins, so the default strongly favors staying in the
    /// current state.
    ///
    pub state_change_prob: f64,

    /// Initial state distribution weight on the neutral/retained state
    pub neutral_init_prob: f64,

    /// Chromosomes with fewer informative bins than this are skipped
    pub min_bins_per_chrom: usize,

    /// Bin-count slack when merging per-cell candidate runs into consensus regions
    ///
    /// 0 merges only runs that genuinely overlap; larger values also bridge small gaps.
    ///
    pub merge_gap: usize,

    pub thread_count: usize,
}

impl Default for DetectParams {
    fn default() -> Self {
        Self {
            state_change_prob: 1e-5,
            neutral_init_prob: 0.994,
            min_bins_per_chrom: 5,
            merge_gap: 0,
            thread_count: 1,
        }
    }
}

impl DetectParams {
    pub fn validate(&self) -> TarponResult<()> {
        if !(0.0..0.25).contains(&self.state_change_prob) || self.state_change_prob == 0.0 {
            return Err(TarponError::Config(format!(
                "state_change_prob must be in (0, 0.25), got {}",
                self.state_change_prob
            )));
        }
        if !(0.0..1.0).contains(&self.neutral_init_prob) || self.neutral_init_prob == 0.0 {
            return Err(TarponError::Config(format!(
                "neutral_init_prob must be in (0, 1), got {}",
                self.neutral_init_prob
            )));
        }
        if self.min_bins_per_chrom == 0 {
            return Err(TarponError::Config(
                "min_bins_per_chrom must be positive".to_string(),
            ));
        }
        if self.thread_count == 0 {
            return Err(TarponError::Config(
                "thread_count must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// One contiguous non-neutral run decoded from a single cell
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CandidateBoundary {
    pub chrom_index: usize,
    pub cell_index: usize,

    /// Extent in matrix bin indices (not genomic coordinates)
    pub bin_range: IntRange,

    /// Decoded state repr for the run
    pub state: usize,
}

/// Final candidate CNV region, merged over all contributing per-cell candidates
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ConsensusRegion {
    pub segment: GenomeSegment,

    /// Union extent in matrix bin indices
    pub bin_range: IntRange,

    /// Number of distinct cells contributing at least one candidate run
    pub contributing_cell_count: usize,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum ChromSkipReason {
    InsufficientBins { bin_count: usize, min_required: usize },
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SkippedChrom {
    pub chrom_index: usize,
    pub reason: ChromSkipReason,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DetectResult {
    pub regions: Vec<ConsensusRegion>,
    pub candidates: Vec<CandidateBoundary>,
    pub skipped_chroms: Vec<SkippedChrom>,
}

/// Compute the HMM state transition matrix as ln prob values
///
/// Matrix returned with lookup format `matrix[from_state][to_state]`
///
fn get_transition_ln_probs(state_count: usize, state_change_prob: f64) -> Vec<Vec<f64>> {
    let stay_prob = 1.0 - (state_change_prob * ((state_count - 1) as f64));
    let go_ln_prob = state_change_prob.ln();
    let stay_ln_prob = stay_prob.ln();

    let mut tm = vec![vec![0.0; state_count]; state_count];
    for (from_index, row) in tm.iter_mut().enumerate() {
        for (to_index, entry) in row.iter_mut().enumerate() {
            *entry = if from_index == to_index {
                stay_ln_prob
            } else {
                go_ln_prob
            };
        }
    }
    tm
}

/// Initial state distribution as ln prob values, weighted onto the neutral state
fn get_init_ln_probs(state_count: usize, neutral_state: usize, neutral_prob: f64) -> Vec<f64> {
    let other_prob = (1.0 - neutral_prob) / (state_count - 1) as f64;
    (0..state_count)
        .map(|state| {
            if state == neutral_state {
                neutral_prob.ln()
            } else {
                other_prob.ln()
            }
        })
        .collect()
}

/// A Viterbi parse over one chromosome's ordered bin sequence for one cell
///
/// All prob values are tracked in ln space. Returns the max-posterior state path.
///
fn viterbi_parse<F>(init: &[f64], transition: &[Vec<f64>], obs_count: usize, emit: F) -> Vec<u8>
where
    F: Fn(usize, usize) -> f64,
{
    let state_count = init.len();
    if obs_count == 0 {
        return Vec::new();
    }

    // Instead of a full SxO DP matrix, ping-pong on two rows
    let mut this_row = vec![0.0; state_count];
    let mut last_row = vec![0.0; state_count];
    let mut back_pointer = vec![vec![0u8; state_count]; obs_count];

    for (state_index, row_value) in this_row.iter_mut().enumerate() {
        *row_value = init[state_index] + emit(0, state_index);
    }

    for obs_index in 1..obs_count {
        std::mem::swap(&mut this_row, &mut last_row);
        for (to_state, row_value) in this_row.iter_mut().enumerate() {
            let emit_ln_prob = emit(obs_index, to_state);

            let mut max_index = 0;
            let mut max_ln_prob = 0.0;
            for (from_state, &last_value) in last_row.iter().enumerate() {
                let ln_prob = last_value + transition[from_state][to_state] + emit_ln_prob;
                if (from_state == 0) || (ln_prob > max_ln_prob) {
                    max_index = from_state;
                    max_ln_prob = ln_prob;
                }
            }

            *row_value = max_ln_prob;
            back_pointer[obs_index][to_state] = max_index as u8;
        }
    }

    // Backtrace
    let mut max_state = 0;
    for (state, val) in this_row.iter().enumerate() {
        if (state == 0) || (*val > this_row[max_state]) {
            max_state = state;
        }
    }

    let mut max_path: Vec<u8> = vec![0; obs_count];
    for obs_index in (0..obs_count).rev() {
        max_path[obs_index] = max_state as u8;
        max_state = back_pointer[obs_index][max_state] as usize;
    }
    max_path
}

/// Translate one cell's decoded state path into candidate boundary runs
///
/// Runs touching a chromosome end are retained as-is.
///
fn extract_candidate_runs(
    max_path: &[u8],
    neutral_state: usize,
    bin_offset: usize,
    chrom_index: usize,
    cell_index: usize,
) -> Vec<CandidateBoundary> {
    let mut runs = Vec::new();
    let mut run_start: Option<(usize, usize)> = None;
    for (path_index, &state) in max_path.iter().enumerate() {
        let state = state as usize;
        match run_start {
            Some((start, run_state)) if run_state != state => {
                if run_state != neutral_state {
                    runs.push(CandidateBoundary {
                        chrom_index,
                        cell_index,
                        bin_range: IntRange::from_pair(
                            (bin_offset + start) as i64,
                            (bin_offset + path_index) as i64,
                        ),
                        state: run_state,
                    });
                }
                run_start = Some((path_index, state));
            }
            None => {
                run_start = Some((path_index, state));
            }
            _ => {}
        }
    }
    if let Some((start, run_state)) = run_start {
        if run_state != neutral_state {
            runs.push(CandidateBoundary {
                chrom_index,
                cell_index,
                bin_range: IntRange::from_pair(
                    (bin_offset + start) as i64,
                    (bin_offset + max_path.len()) as i64,
                ),
                state: run_state,
            });
        }
    }
    runs
}

/// Merge sorted per-cell candidate runs into consensus regions by interval union
///
/// No single cell's segmentation is privileged: any overlap (within `merge_gap` bins) joins two
/// candidates, and the consensus takes the union extent.
///
fn merge_candidates(
    bins: &[Bin],
    candidates: &[CandidateBoundary],
    merge_gap: usize,
) -> Vec<ConsensusRegion> {
    let mut regions = Vec::new();
    let mut current: Option<(usize, IntRange, BTreeSet<usize>)> = None;

    let mut flush = |current: &mut Option<(usize, IntRange, BTreeSet<usize>)>,
                     regions: &mut Vec<ConsensusRegion>| {
        if let Some((chrom_index, bin_range, cells)) = current.take() {
            let first_bin = &bins[bin_range.start as usize];
            let last_bin = &bins[bin_range.end as usize - 1];
            regions.push(ConsensusRegion {
                segment: GenomeSegment::new(
                    chrom_index,
                    first_bin.segment.range.start,
                    last_bin.segment.range.end,
                ),
                bin_range,
                contributing_cell_count: cells.len(),
            });
        }
    };

    for candidate in candidates {
        let mergeable = match &current {
            Some((chrom_index, bin_range, _)) => {
                *chrom_index == candidate.chrom_index
                    && candidate.bin_range.start < bin_range.end + merge_gap as i64
            }
            None => false,
        };
        if mergeable {
            let (_, bin_range, cells) = current.as_mut().unwrap();
            bin_range.merge(&candidate.bin_range);
            cells.insert(candidate.cell_index);
        } else {
            flush(&mut current, &mut regions);
            let mut cells = BTreeSet::new();
            cells.insert(candidate.cell_index);
            current = Some((candidate.chrom_index, candidate.bin_range.clone(), cells));
        }
    }
    flush(&mut current, &mut regions);
    regions
}

/// Decode all (chromosome, cell) pairs and merge candidates into consensus regions
///
/// Decoding is distributed over a thread pool; results are sorted before merging so scheduling
/// order never affects output.
///
fn detect_boundaries_impl<F>(
    bins: &[Bin],
    cell_count: usize,
    state_count: usize,
    neutral_state: usize,
    params: &DetectParams,
    cancel: Option<&CancelToken>,
    ln_emission: &F,
) -> TarponResult<DetectResult>
where
    F: Fn(usize, usize, usize) -> f64 + Sync,
{
    params.validate()?;
    if bins.is_empty() {
        return Err(TarponError::Input(
            "boundary detection requires a non-empty matrix".to_string(),
        ));
    }

    let transition = get_transition_ln_probs(state_count, params.state_change_prob);
    let init = get_init_ln_probs(state_count, neutral_state, params.neutral_init_prob);

    let mut skipped_chroms = Vec::new();
    let mut jobs = Vec::new();
    for (chrom_index, bin_range) in chrom_bin_ranges(bins) {
        if bin_range.len() < params.min_bins_per_chrom {
            skipped_chroms.push(SkippedChrom {
                chrom_index,
                reason: ChromSkipReason::InsufficientBins {
                    bin_count: bin_range.len(),
                    min_required: params.min_bins_per_chrom,
                },
            });
            continue;
        }
        jobs.push((chrom_index, bin_range));
    }

    let worker_pool = rayon::ThreadPoolBuilder::new()
        .num_threads(params.thread_count)
        .build()
        .unwrap();

    let (tx, rx) = channel();
    let mut cancelled = false;
    worker_pool.scope(|scope| {
        let init = &init;
        let transition = &transition;
        'job_loop: for (chrom_index, bin_range) in jobs.iter() {
            for cell_index in 0..cell_count {
                if let Some(token) = cancel {
                    if token.is_cancelled() {
                        cancelled = true;
                        break 'job_loop;
                    }
                }
                let tx = tx.clone();
                let bin_range = bin_range.clone();
                scope.spawn(move |_| {
                    let max_path =
                        viterbi_parse(init, transition, bin_range.len(), |obs_index, state| {
                            ln_emission(bin_range.start + obs_index, cell_index, state)
                        });
                    let runs = extract_candidate_runs(
                        &max_path,
                        neutral_state,
                        bin_range.start,
                        *chrom_index,
                        cell_index,
                    );
                    tx.send(runs).unwrap();
                });
            }
        }
    });
    drop(tx);

    let mut candidates: Vec<CandidateBoundary> = rx.into_iter().flatten().collect();
    if cancelled {
        return Err(TarponError::Cancelled);
    }

    // Deterministic merge order regardless of worker scheduling
    candidates.sort_by(|a, b| {
        (a.chrom_index, &a.bin_range, a.cell_index, a.state).cmp(&(
            b.chrom_index,
            &b.bin_range,
            b.cell_index,
            b.state,
        ))
    });

    let regions = merge_candidates(bins, &candidates, params.merge_gap);
    info!(
        "Boundary detection: {} consensus regions from {} per-cell candidates ({} chromosomes skipped)",
        regions.len(),
        candidates.len(),
        skipped_chroms.len()
    );

    Ok(DetectResult {
        regions,
        candidates,
        skipped_chroms,
    })
}

/// Detect amplification/deletion candidate regions from expression deviance
///
pub fn detect_expression_boundaries(
    matrix: &ExpressionMatrix,
    model: &ExpressionDevianceModel,
    params: &DetectParams,
    cancel: Option<&CancelToken>,
) -> TarponResult<DetectResult> {
    info!(
        "Detecting copy number boundaries over {} genes x {} cells",
        matrix.bin_count(),
        matrix.cell_count()
    );
    let ln_emission = |bin_index: usize, cell_index: usize, state: usize| {
        model.ln_emission(
            ExpressionState::from_repr(state).unwrap(),
            matrix.deviance(bin_index, cell_index),
        )
    };
    detect_boundaries_impl(
        &matrix.bins,
        matrix.cell_count(),
        EXPRESSION_STATE_COUNT,
        ExpressionState::Neutral as usize,
        params,
        cancel,
        &ln_emission,
    )
}

/// Detect LOH candidate regions from allele fraction deviance
///
pub fn detect_allele_boundaries(
    matrix: &AlleleMatrix,
    model: &AlleleDevianceModel,
    params: &DetectParams,
    cancel: Option<&CancelToken>,
) -> TarponResult<DetectResult> {
    info!(
        "Detecting allelic boundaries over {} sites x {} cells",
        matrix.bin_count(),
        matrix.cell_count()
    );
    let ln_emission = |bin_index: usize, cell_index: usize, state: usize| {
        model.ln_emission(
            AlleleState::from_repr(state).unwrap(),
            matrix.ref_count(bin_index, cell_index),
            matrix.alt_count(bin_index, cell_index),
        )
    };
    detect_boundaries_impl(
        &matrix.bins,
        matrix.cell_count(),
        ALLELE_STATE_COUNT,
        AlleleState::Retained as usize,
        params,
        cancel,
        &ln_emission,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chrom_list::ChromList;

    fn test_expression_model() -> ExpressionDevianceModel {
        ExpressionDevianceModel {
            mean: 0.0,
            neutral_sd: 0.4,
            cnv_sd: 0.6,
            neutral_weight: 0.9,
            cnv_shift: 2.0,
            iterations: 1,
        }
    }

    /// Matrix with per-cell deviance shifts planted on chr1
    ///
    /// `shifts` maps cell_index -> (bin_start, bin_end, shift); chr2 carries only 3 bins so it is
    /// skipped under default params.
    ///
    fn planted_expression_matrix(
        bin_count: usize,
        cell_count: usize,
        shifts: &[(usize, usize, usize, f64)],
    ) -> ExpressionMatrix {
        let mut chrom_list = ChromList::default();
        let chr1 = chrom_list.add_chrom("chr1");
        let chr2 = chrom_list.add_chrom("chr2");

        let mut bins = (0..bin_count)
            .map(|i| Bin {
                id: format!("G{i}"),
                segment: GenomeSegment::new(chr1, (i * 1000) as i64, (i * 1000 + 500) as i64),
            })
            .collect::<Vec<_>>();
        for i in 0..3 {
            bins.push(Bin {
                id: format!("H{i}"),
                segment: GenomeSegment::new(chr2, (i * 1000) as i64, (i * 1000 + 500) as i64),
            });
        }

        let total_bins = bins.len();
        let cells = (0..cell_count).map(|i| format!("cell{i}")).collect::<Vec<_>>();
        let ref_means = vec![5.0; total_bins];
        let mut values = vec![5.0; total_bins * cell_count];
        for &(cell_index, bin_start, bin_end, shift) in shifts {
            for bin_index in bin_start..bin_end {
                values[bin_index * cell_count + cell_index] = 5.0 + shift;
            }
        }
        ExpressionMatrix::new(chrom_list, bins, cells, values, ref_means)
    }

    #[test]
    fn test_transition_ln_probs() {
        let tm = get_transition_ln_probs(3, 1e-5);
        approx::assert_ulps_eq!(tm[0][0], (1.0 - 2e-5f64).ln(), max_ulps = 4);
        approx::assert_ulps_eq!(tm[0][2], 1e-5f64.ln(), max_ulps = 4);
    }

    #[test]
    fn test_viterbi_recovers_planted_run() {
        let matrix = planted_expression_matrix(30, 1, &[(0, 10, 20, 2.0)]);
        let model = test_expression_model();
        let result =
            detect_expression_boundaries(&matrix, &model, &DetectParams::default(), None).unwrap();

        assert_eq!(result.candidates.len(), 1);
        let candidate = &result.candidates[0];
        assert_eq!(candidate.bin_range, IntRange::from_pair(10, 20));
        assert_eq!(candidate.state, ExpressionState::Amplification as usize);

        assert_eq!(result.regions.len(), 1);
        let region = &result.regions[0];
        assert_eq!(region.bin_range, IntRange::from_pair(10, 20));
        assert_eq!(region.segment.range.start, 10_000);
        assert_eq!(region.segment.range.end, 19_500);
        assert_eq!(region.contributing_cell_count, 1);

        // chr2 has too few bins
        assert_eq!(result.skipped_chroms.len(), 1);
        assert_eq!(result.skipped_chroms[0].chrom_index, 1);
    }

    #[test]
    fn test_consensus_merges_overlapping_cells() {
        let matrix =
            planted_expression_matrix(30, 3, &[(0, 5, 15, 2.0), (1, 10, 20, 2.0), (2, 24, 28, -2.0)]);
        let model = test_expression_model();
        let result =
            detect_expression_boundaries(&matrix, &model, &DetectParams::default(), None).unwrap();

        assert_eq!(result.regions.len(), 2);
        assert_eq!(result.regions[0].bin_range, IntRange::from_pair(5, 20));
        assert_eq!(result.regions[0].contributing_cell_count, 2);
        assert_eq!(result.regions[1].bin_range, IntRange::from_pair(24, 28));
        assert_eq!(result.regions[1].contributing_cell_count, 1);

        // Region containment: every candidate is inside some consensus region
        for candidate in result.candidates.iter() {
            assert!(result.regions.iter().any(|region| {
                region.segment.chrom_index == candidate.chrom_index
                    && region.bin_range.start <= candidate.bin_range.start
                    && region.bin_range.end >= candidate.bin_range.end
            }));
        }
    }

    #[test]
    fn test_detection_is_deterministic_across_threads() {
        let matrix = planted_expression_matrix(
            40,
            6,
            &[
                (0, 5, 15, 2.0),
                (1, 10, 20, 2.0),
                (2, 24, 30, -2.0),
                (4, 33, 38, 2.0),
            ],
        );
        let model = test_expression_model();
        let single = detect_expression_boundaries(&matrix, &model, &DetectParams::default(), None)
            .unwrap();
        let threaded_params = DetectParams {
            thread_count: 4,
            ..Default::default()
        };
        let threaded =
            detect_expression_boundaries(&matrix, &model, &threaded_params, None).unwrap();

        assert_eq!(single.regions.len(), threaded.regions.len());
        for (a, b) in single.regions.iter().zip(threaded.regions.iter()) {
            assert_eq!(a.bin_range, b.bin_range);
            assert_eq!(a.segment, b.segment);
            assert_eq!(a.contributing_cell_count, b.contributing_cell_count);
        }
        assert_eq!(single.candidates.len(), threaded.candidates.len());
    }

    #[test]
    fn test_detect_allele_boundaries_loh_run() {
        let mut chrom_list = ChromList::default();
        let chr1 = chrom_list.add_chrom("chr1");
        let bin_count = 20;
        let bins = (0..bin_count)
            .map(|i| Bin {
                id: format!("S{i}"),
                segment: GenomeSegment::new(chr1, (i * 1000) as i64, (i * 1000 + 1) as i64),
            })
            .collect::<Vec<_>>();
        let cells = vec!["cell0".to_string()];

        // Sites 8..16 are monoallelic
        let mut ref_counts = Vec::new();
        let mut alt_counts = Vec::new();
        for bin_index in 0..bin_count {
            if (8..16).contains(&bin_index) {
                ref_counts.push(12);
                alt_counts.push(0);
            } else {
                ref_counts.push(6);
                alt_counts.push(6);
            }
        }
        let matrix = AlleleMatrix::new(chrom_list, bins, cells, ref_counts, alt_counts);
        let model = AlleleDevianceModel {
            monoallelic_rate: 0.02,
        };

        let result =
            detect_allele_boundaries(&matrix, &model, &DetectParams::default(), None).unwrap();
        assert_eq!(result.regions.len(), 1);
        assert_eq!(result.regions[0].bin_range, IntRange::from_pair(8, 16));
        assert_eq!(result.candidates[0].state, AlleleState::Loh as usize);
    }

    #[test]
    fn test_empty_matrix_is_input_error() {
        let matrix = ExpressionMatrix::new(
            ChromList::default(),
            Vec::new(),
            vec!["cell0".to_string()],
            Vec::new(),
            Vec::new(),
        );
        let model = test_expression_model();
        let result = detect_expression_boundaries(&matrix, &model, &DetectParams::default(), None);
        assert!(matches!(result, Err(TarponError::Input(_))));
    }

    #[test]
    fn test_cancel_token_stops_detection() {
        let matrix = planted_expression_matrix(30, 2, &[(0, 5, 15, 2.0)]);
        let model = test_expression_model();
        let token = CancelToken::new();
        token.cancel();
        let result =
            detect_expression_boundaries(&matrix, &model, &DetectParams::default(), Some(&token));
        assert!(matches!(result, Err(TarponError::Cancelled)));
    }

    #[test]
    fn test_invalid_detect_params() {
        let params = DetectParams {
            state_change_prob: 0.0,
            ..Default::default()
        };
        assert!(params.validate().is_err());

        let params = DetectParams {
            thread_count: 0,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }
}
