use log::debug;
use serde::{Deserialize, Serialize};
use statrs::distribution::{Binomial, Continuous, Discrete, Normal};

use crate::error::{TarponError, TarponResult};
use crate::matrix::{AlleleMatrix, ExpressionMatrix};
use crate::prob_utils::ln_sum_exp_pair;

/// Copy number states inferred from expression deviance
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::FromRepr)]
#[repr(usize)]
pub enum ExpressionState {
    Deletion,
    Neutral,
    Amplification,
}

pub const EXPRESSION_STATE_COUNT: usize = ExpressionState::Amplification as usize + 1;

/// Allelic states inferred from SNP allele fractions
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::FromRepr)]
#[repr(usize)]
pub enum AlleleState {
    /// Loss of heterozygosity (or deletion of one haplotype)
    Loh,
    /// Both haplotypes retained
    Retained,
}

pub const ALLELE_STATE_COUNT: usize = AlleleState::Retained as usize + 1;

#[derive(Clone, Debug)]
pub struct ExpressionFitParams {
    pub max_iterations: usize,
    pub convergence_tol: f64,

    /// Minimum number of finite (bin, cell) deviance observations required for a stable fit
    pub min_observations: usize,

    /// Expected log-expression shift of the amplified/deleted emission components
    pub cnv_shift: f64,
}

impl Default for ExpressionFitParams {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            convergence_tol: 1e-6,
            min_observations: 20,
            cnv_shift: 1.0,
        }
    }
}

impl ExpressionFitParams {
    pub fn validate(&self) -> TarponResult<()> {
        if self.max_iterations == 0 {
            return Err(TarponError::Config(
                "expression fit max_iterations must be positive".to_string(),
            ));
        }
        if self.convergence_tol <= 0.0 {
            return Err(TarponError::Config(
                "expression fit convergence_tol must be positive".to_string(),
            ));
        }
        if self.cnv_shift <= 0.0 {
            return Err(TarponError::Config(
                "cnv_shift must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Fitted two-component scale mixture over expression deviance
///
/// The neutral component captures ordinary biological/technical noise around the reference
/// expectation; the CNV component is the same mean with inflated spread. Immutable once fit,
/// shared by boundary detection and retesting.
///
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ExpressionDevianceModel {
    pub mean: f64,
    pub neutral_sd: f64,
    pub cnv_sd: f64,
    pub neutral_weight: f64,
    pub cnv_shift: f64,
    pub iterations: usize,
}

impl ExpressionDevianceModel {
    /// ln prob of an observed deviance under one copy number state
    ///
    /// Non-finite deviance marks a missing observation, which is uninformative (ln prob 0 for
    /// every state).
    ///
    pub fn ln_emission(&self, state: ExpressionState, deviance: f64) -> f64 {
        if !deviance.is_finite() {
            return 0.0;
        }
        let (mean, sd) = match state {
            ExpressionState::Neutral => (self.mean, self.neutral_sd),
            ExpressionState::Amplification => (self.mean + self.cnv_shift, self.cnv_sd),
            ExpressionState::Deletion => (self.mean - self.cnv_shift, self.cnv_sd),
        };
        Normal::new(mean, sd).unwrap().ln_pdf(deviance)
    }
}

/// Fit the expression deviance mixture by EM over all retained (bin, cell) observations
///
/// The fit is global: it characterizes typical per-gene noise for the whole sample, not
/// individual bins. Deterministic; no stochastic initialization.
///
pub fn fit_expression_deviance_model(
    matrix: &ExpressionMatrix,
    params: &ExpressionFitParams,
) -> TarponResult<ExpressionDevianceModel> {
    params.validate()?;

    let mut deviances = Vec::new();
    for bin_index in 0..matrix.bin_count() {
        for cell_index in 0..matrix.cell_count() {
            let deviance = matrix.deviance(bin_index, cell_index);
            if deviance.is_finite() {
                deviances.push(deviance);
            }
        }
    }

    let obs_count = deviances.len();
    if obs_count < params.min_observations {
        return Err(TarponError::Fit(format!(
            "{} finite deviance observations, need at least {}",
            obs_count, params.min_observations
        )));
    }

    let mean = deviances.iter().sum::<f64>() / obs_count as f64;
    let variance =
        deviances.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / obs_count as f64;
    if variance < 1e-12 {
        return Err(TarponError::Fit(
            "deviance observations have (near) zero variance".to_string(),
        ));
    }
    let sd = variance.sqrt();

    // EM over component scales with a shared mean
    let mut neutral_sd = sd * 0.75;
    let mut cnv_sd = sd * 2.0;
    let mut neutral_weight: f64 = 0.9;
    let mut converged_at = None;
    for iteration in 0..params.max_iterations {
        let neutral_distro = Normal::new(mean, neutral_sd).unwrap();
        let cnv_distro = Normal::new(mean, cnv_sd).unwrap();
        let ln_w0 = neutral_weight.ln();
        let ln_w1 = (1.0 - neutral_weight).ln();

        let mut resp_sum = 0.0;
        let mut neutral_ss = 0.0;
        let mut cnv_ss = 0.0;
        let mut cnv_resp_sum = 0.0;
        for &deviance in deviances.iter() {
            let ln_p0 = ln_w0 + neutral_distro.ln_pdf(deviance);
            let ln_p1 = ln_w1 + cnv_distro.ln_pdf(deviance);
            let resp = (ln_p0 - ln_sum_exp_pair(ln_p0, ln_p1)).exp();
            let ss = (deviance - mean).powi(2);
            resp_sum += resp;
            neutral_ss += resp * ss;
            cnv_resp_sum += 1.0 - resp;
            cnv_ss += (1.0 - resp) * ss;
        }
        if resp_sum < 1e-9 || cnv_resp_sum < 1e-9 {
            return Err(TarponError::Fit(
                "mixture component collapsed during EM".to_string(),
            ));
        }

        let mut new_neutral_sd = (neutral_ss / resp_sum).sqrt().max(1e-6);
        let mut new_cnv_sd = (cnv_ss / cnv_resp_sum).sqrt().max(1e-6);
        let mut new_neutral_weight = resp_sum / obs_count as f64;
        if new_cnv_sd < new_neutral_sd {
            std::mem::swap(&mut new_neutral_sd, &mut new_cnv_sd);
            new_neutral_weight = 1.0 - new_neutral_weight;
        }
        new_neutral_weight = new_neutral_weight.clamp(1e-3, 1.0 - 1e-3);

        let delta = (new_neutral_sd - neutral_sd)
            .abs()
            .max((new_cnv_sd - cnv_sd).abs())
            .max((new_neutral_weight - neutral_weight).abs());
        neutral_sd = new_neutral_sd;
        cnv_sd = new_cnv_sd;
        neutral_weight = new_neutral_weight;
        if delta < params.convergence_tol {
            converged_at = Some(iteration + 1);
            break;
        }
    }

    let iterations = match converged_at {
        Some(x) => x,
        None => {
            return Err(TarponError::Fit(format!(
                "expression mixture EM did not converge in {} iterations",
                params.max_iterations
            )));
        }
    };

    debug!(
        "Expression deviance fit: mean {:.4} neutral_sd {:.4} cnv_sd {:.4} neutral_weight {:.4} ({} iterations)",
        mean, neutral_sd, cnv_sd, neutral_weight, iterations
    );

    Ok(ExpressionDevianceModel {
        mean,
        neutral_sd,
        cnv_sd,
        neutral_weight,
        cnv_shift: params.cnv_shift,
        iterations,
    })
}

#[derive(Clone, Debug)]
pub struct AlleleFitParams {
    /// Minimum number of covered (site, cell) observations required for a stable fit
    pub min_observations: usize,

    /// Lower bound on the fitted monoallelic error rate
    pub min_error_rate: f64,
}

impl Default for AlleleFitParams {
    fn default() -> Self {
        Self {
            min_observations: 20,
            min_error_rate: 0.01,
        }
    }
}

impl AlleleFitParams {
    pub fn validate(&self) -> TarponResult<()> {
        if !(0.0..0.5).contains(&self.min_error_rate) {
            return Err(TarponError::Config(format!(
                "min_error_rate must be in [0, 0.5), got {}",
                self.min_error_rate
            )));
        }
        Ok(())
    }
}

/// Fitted allele fraction model
///
/// Coverage conditioning is handled by the binomial likelihoods themselves (deeper sites give
/// tighter nulls); the fitted scalar is the residual rate at which reads from the lost haplotype
/// still appear in a monoallelic state.
///
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AlleleDevianceModel {
    pub monoallelic_rate: f64,
}

impl AlleleDevianceModel {
    /// ln prob of observed allele counts under one allelic state
    ///
    /// Zero coverage is uninformative (ln prob 0 for every state). The LOH emission is an
    /// equal-weight mixture over which haplotype was lost.
    ///
    pub fn ln_emission(&self, state: AlleleState, ref_count: u32, alt_count: u32) -> f64 {
        let coverage = (ref_count + alt_count) as u64;
        if coverage == 0 {
            return 0.0;
        }
        let alt_count = alt_count as u64;
        match state {
            AlleleState::Retained => Binomial::new(0.5, coverage).unwrap().ln_pmf(alt_count),
            AlleleState::Loh => {
                let ln_half = 0.5f64.ln();
                let ln_low = Binomial::new(self.monoallelic_rate, coverage)
                    .unwrap()
                    .ln_pmf(alt_count);
                let ln_high = Binomial::new(1.0 - self.monoallelic_rate, coverage)
                    .unwrap()
                    .ln_pmf(alt_count);
                ln_sum_exp_pair(ln_half + ln_low, ln_half + ln_high)
            }
        }
    }
}

/// Fit the allele fraction model from all covered (site, cell) observations
///
pub fn fit_allele_deviance_model(
    matrix: &AlleleMatrix,
    params: &AlleleFitParams,
) -> TarponResult<AlleleDevianceModel> {
    params.validate()?;

    let mut minor_fractions = Vec::new();
    for bin_index in 0..matrix.bin_count() {
        for cell_index in 0..matrix.cell_count() {
            if let Some(fraction) = matrix.alt_fraction(bin_index, cell_index) {
                minor_fractions.push(fraction.min(1.0 - fraction));
            }
        }
    }

    let obs_count = minor_fractions.len();
    if obs_count < params.min_observations {
        return Err(TarponError::Fit(format!(
            "{} covered allele observations, need at least {}",
            obs_count, params.min_observations
        )));
    }

    // Estimate the monoallelic error rate from the extreme-fraction component
    let extreme = minor_fractions
        .iter()
        .filter(|&&f| f < 0.25)
        .collect::<Vec<_>>();
    let monoallelic_rate = if extreme.is_empty() {
        params.min_error_rate
    } else {
        let mean = extreme.iter().copied().sum::<f64>() / extreme.len() as f64;
        mean.clamp(params.min_error_rate, 0.25)
    };

    debug!(
        "Allele deviance fit: monoallelic_rate {:.4} from {} observations",
        monoallelic_rate, obs_count
    );

    Ok(AlleleDevianceModel { monoallelic_rate })
}
