use std::sync::mpsc::channel;

use log::info;
use serde::{Deserialize, Serialize};

use crate::boundary_detect::ConsensusRegion;
use crate::cancel::CancelToken;
use crate::deviance_model::{
    AlleleDevianceModel, AlleleState, ExpressionDevianceModel, ExpressionState,
};
use crate::error::{TarponError, TarponResult};
use crate::matrix::{AlleleMatrix, ExpressionMatrix, region_bin_indices};
use crate::prob_utils::normalize_ln_distro;

/// Evidence source behind a posterior call
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
pub enum EvidenceType {
    Expression,
    Allele,
}

/// Posterior over {amplified, deleted/LOH, neutral} for one (region, cell) pair
///
/// Always normalized to sum to 1. Allele-based calls place zero mass on amplification since
/// allele fractions can't distinguish it.
///
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PosteriorCall {
    pub amplified: f64,
    pub deleted: f64,
    pub neutral: f64,
}

impl PosteriorCall {
    /// The larger of the two non-neutral posteriors, used for confidence thresholding
    pub fn max_non_neutral(&self) -> f64 {
        self.amplified.max(self.deleted)
    }
}

#[derive(Clone, Debug)]
pub struct RetestParams {
    /// Prior over (amplified, deleted/LOH, neutral); weighted toward neutral by default
    pub prior: [f64; 3],

    pub thread_count: usize,
}

impl Default for RetestParams {
    fn default() -> Self {
        Self {
            prior: [0.05, 0.05, 0.9],
            thread_count: 1,
        }
    }
}

impl RetestParams {
    pub fn validate(&self) -> TarponResult<()> {
        if self.prior.iter().any(|&p| p <= 0.0) {
            return Err(TarponError::Config(
                "retest prior probabilities must be positive".to_string(),
            ));
        }
        let sum: f64 = self.prior.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(TarponError::Config(format!(
                "retest prior must sum to 1, got {sum}"
            )));
        }
        if self.thread_count == 0 {
            return Err(TarponError::Config(
                "thread_count must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-region, per-cell posterior calls for one evidence type
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PosteriorTable {
    pub evidence: EvidenceType,
    pub regions: Vec<ConsensusRegion>,
    pub cells: Vec<String>,

    /// Row-major (region, cell); None marks an indeterminate pair with no informative bins
    pub calls: Vec<Option<PosteriorCall>>,
}

impl PosteriorTable {
    pub fn call(&self, region_index: usize, cell_index: usize) -> Option<&PosteriorCall> {
        self.calls[region_index * self.cells.len() + cell_index].as_ref()
    }

    pub fn indeterminate_count(&self) -> usize {
        self.calls.iter().filter(|call| call.is_none()).count()
    }
}

/// Retest consensus regions against a matrix, one posterior row per region
///
/// Work is distributed per region; rows are reassembled in region order so scheduling never
/// affects output.
///
fn retest_impl<F>(
    regions: &[ConsensusRegion],
    evidence: EvidenceType,
    cells: &[String],
    params: &RetestParams,
    cancel: Option<&CancelToken>,
    retest_region: &F,
) -> TarponResult<PosteriorTable>
where
    F: Fn(&ConsensusRegion) -> Vec<Option<PosteriorCall>> + Sync,
{
    params.validate()?;
    if regions.is_empty() {
        return Err(TarponError::Config(
            "retest requires a non-empty region list".to_string(),
        ));
    }

    let worker_pool = rayon::ThreadPoolBuilder::new()
        .num_threads(params.thread_count)
        .build()
        .unwrap();

    let (tx, rx) = channel();
    let mut cancelled = false;
    worker_pool.scope(|scope| {
        for (region_index, region) in regions.iter().enumerate() {
            if let Some(token) = cancel {
                if token.is_cancelled() {
                    cancelled = true;
                    break;
                }
            }
            let tx = tx.clone();
            scope.spawn(move |_| {
                tx.send((region_index, retest_region(region))).unwrap();
            });
        }
    });
    drop(tx);

    let mut rows: Vec<(usize, Vec<Option<PosteriorCall>>)> = rx.into_iter().collect();
    if cancelled {
        return Err(TarponError::Cancelled);
    }
    rows.sort_by_key(|(region_index, _)| *region_index);

    let mut calls = Vec::with_capacity(regions.len() * cells.len());
    for (_, row) in rows {
        calls.extend(row);
    }

    let table = PosteriorTable {
        evidence,
        regions: regions.to_vec(),
        cells: cells.to_vec(),
        calls,
    };
    info!(
        "Retest ({evidence:?}): {} regions x {} cells, {} indeterminate",
        regions.len(),
        cells.len(),
        table.indeterminate_count()
    );
    Ok(table)
}

/// Bayesian retest of consensus regions against expression deviance
///
/// The HMM pass only discovers region extents; this retest produces a calibrated posterior per
/// cell for the shared, fixed region definition, enabling cross-cell comparison and
/// thresholding.
///
pub fn retest_expression(
    regions: &[ConsensusRegion],
    matrix: &ExpressionMatrix,
    model: &ExpressionDevianceModel,
    params: &RetestParams,
    cancel: Option<&CancelToken>,
) -> TarponResult<PosteriorTable> {
    let ln_prior = params.prior.map(|p| p.ln());
    let retest_region = |region: &ConsensusRegion| {
        let bin_indices = region_bin_indices(&matrix.bins, &region.segment);
        (0..matrix.cell_count())
            .map(|cell_index| {
                let mut ln_post = [ln_prior[0], ln_prior[1], ln_prior[2]];
                let mut informative_bin_count = 0;
                for &bin_index in bin_indices.iter() {
                    let deviance = matrix.deviance(bin_index, cell_index);
                    if !deviance.is_finite() {
                        continue;
                    }
                    informative_bin_count += 1;
                    ln_post[0] += model.ln_emission(ExpressionState::Amplification, deviance);
                    ln_post[1] += model.ln_emission(ExpressionState::Deletion, deviance);
                    ln_post[2] += model.ln_emission(ExpressionState::Neutral, deviance);
                }
                if informative_bin_count == 0 {
                    return None;
                }
                normalize_ln_distro(&mut ln_post);
                Some(PosteriorCall {
                    amplified: ln_post[0],
                    deleted: ln_post[1],
                    neutral: ln_post[2],
                })
            })
            .collect()
    };
    retest_impl(
        regions,
        EvidenceType::Expression,
        &matrix.cells,
        params,
        cancel,
        &retest_region,
    )
}

/// Bayesian retest of consensus regions against allele fractions
///
/// Posterior is over {LOH, retained}; the deleted/neutral prior components are renormalized to
/// cover the two allelic states.
///
pub fn retest_alleles(
    regions: &[ConsensusRegion],
    matrix: &AlleleMatrix,
    model: &AlleleDevianceModel,
    params: &RetestParams,
    cancel: Option<&CancelToken>,
) -> TarponResult<PosteriorTable> {
    let prior_mass = params.prior[1] + params.prior[2];
    let ln_prior_loh = (params.prior[1] / prior_mass).ln();
    let ln_prior_retained = (params.prior[2] / prior_mass).ln();

    let retest_region = |region: &ConsensusRegion| {
        let bin_indices = region_bin_indices(&matrix.bins, &region.segment);
        (0..matrix.cell_count())
            .map(|cell_index| {
                let mut ln_post = [ln_prior_loh, ln_prior_retained];
                let mut informative_bin_count = 0;
                for &bin_index in bin_indices.iter() {
                    if matrix.coverage(bin_index, cell_index) == 0 {
                        continue;
                    }
                    informative_bin_count += 1;
                    let ref_count = matrix.ref_count(bin_index, cell_index);
                    let alt_count = matrix.alt_count(bin_index, cell_index);
                    ln_post[0] += model.ln_emission(AlleleState::Loh, ref_count, alt_count);
                    ln_post[1] += model.ln_emission(AlleleState::Retained, ref_count, alt_count);
                }
                if informative_bin_count == 0 {
                    return None;
                }
                normalize_ln_distro(&mut ln_post);
                Some(PosteriorCall {
                    amplified: 0.0,
                    deleted: ln_post[0],
                    neutral: ln_post[1],
                })
            })
            .collect()
    };
    retest_impl(
        regions,
        EvidenceType::Allele,
        &matrix.cells,
        params,
        cancel,
        &retest_region,
    )
}
