use log::info;
use serde::{Deserialize, Serialize};

use crate::boundary_detect::{
    DetectParams, DetectResult, detect_allele_boundaries, detect_expression_boundaries,
};
use crate::cancel::CancelToken;
use crate::coords::CoordinateResolver;
use crate::deviance_model::{
    AlleleDevianceModel, AlleleFitParams, ExpressionDevianceModel, ExpressionFitParams,
    fit_allele_deviance_model, fit_expression_deviance_model,
};
use crate::error::{TarponError, TarponResult};
use crate::ingest::{
    AlleleIngestParams, ExpressionIngestParams, IngestStats, RawAlleleInput, RawExpressionInput,
    check_cell_consistency, ingest_alleles, ingest_expression,
};
use crate::matrix::{AlleleMatrix, ExpressionMatrix};
use crate::retest::{PosteriorTable, RetestParams, retest_alleles, retest_expression};
use crate::summary::{CallTable, build_call_table};

/// Which evidence types to carry through boundary detection and retesting
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EvidenceSelection {
    ExpressionOnly,
    AlleleOnly,
    Both,
}

#[derive(Clone, Debug, Default)]
pub struct PipelineParams {
    pub expression_ingest: ExpressionIngestParams,
    pub allele_ingest: AlleleIngestParams,
    pub expression_fit: ExpressionFitParams,
    pub allele_fit: AlleleFitParams,
    pub detect: DetectParams,
    pub retest: RetestParams,
}

impl PipelineParams {
    /// Fail fast on any invalid parameter before computation begins
    pub fn validate(&self) -> TarponResult<()> {
        self.expression_ingest.validate()?;
        self.allele_ingest.validate()?;
        self.expression_fit.validate()?;
        self.allele_fit.validate()?;
        self.detect.validate()?;
        self.retest.validate()?;
        Ok(())
    }
}

/// Run accounting for one evidence type, distinguishing analyzed from skipped work
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct EvidenceRunStats {
    pub ingest: IngestStats,
    pub skipped_chrom_count: usize,
    pub consensus_region_count: usize,
    pub indeterminate_call_count: usize,
}

/// Full expression-evidence analysis output
#[derive(Clone, Debug)]
pub struct ExpressionAnalysis {
    pub matrix: ExpressionMatrix,
    pub model: ExpressionDevianceModel,
    pub detect: DetectResult,

    /// None when detection produced no candidate regions
    pub posteriors: Option<PosteriorTable>,

    pub stats: EvidenceRunStats,
}

/// Full allele-evidence analysis output
#[derive(Clone, Debug)]
pub struct AlleleAnalysis {
    pub matrix: AlleleMatrix,
    pub model: AlleleDevianceModel,
    pub detect: DetectResult,
    pub posteriors: Option<PosteriorTable>,
    pub stats: EvidenceRunStats,
}

/// Combined result of a joint expression + allele run
#[derive(Clone, Debug)]
pub struct JointAnalysis {
    pub expression: Option<ExpressionAnalysis>,
    pub alleles: Option<AlleleAnalysis>,

    /// Unified call table over whichever evidence types were run
    pub call_table: CallTable,
}

/// Ingest, fit, detect and retest expression evidence for one sample
///
/// Stage outputs flow forward as immutable values; a fit failure aborts before boundary
/// detection ever runs.
///
pub fn run_expression_analysis(
    input: &RawExpressionInput,
    resolver: &impl CoordinateResolver,
    params: &PipelineParams,
    cancel: Option<&CancelToken>,
) -> TarponResult<ExpressionAnalysis> {
    params.validate()?;
    info!("Starting expression CNV analysis");

    let (matrix, ingest_stats) = ingest_expression(input, resolver, &params.expression_ingest)?;
    let model = fit_expression_deviance_model(&matrix, &params.expression_fit)?;
    let detect = detect_expression_boundaries(&matrix, &model, &params.detect, cancel)?;

    let posteriors = if detect.regions.is_empty() {
        None
    } else {
        Some(retest_expression(
            &detect.regions,
            &matrix,
            &model,
            &params.retest,
            cancel,
        )?)
    };

    let stats = EvidenceRunStats {
        ingest: ingest_stats,
        skipped_chrom_count: detect.skipped_chroms.len(),
        consensus_region_count: detect.regions.len(),
        indeterminate_call_count: posteriors
            .as_ref()
            .map_or(0, |table| table.indeterminate_count()),
    };

    Ok(ExpressionAnalysis {
        matrix,
        model,
        detect,
        posteriors,
        stats,
    })
}

/// Ingest, fit, detect and retest allele evidence for one sample
///
pub fn run_allele_analysis(
    input: &RawAlleleInput,
    resolver: &impl CoordinateResolver,
    params: &PipelineParams,
    cancel: Option<&CancelToken>,
) -> TarponResult<AlleleAnalysis> {
    params.validate()?;
    info!("Starting allele LOH analysis");

    let (matrix, ingest_stats) = ingest_alleles(input, resolver, &params.allele_ingest)?;
    let model = fit_allele_deviance_model(&matrix, &params.allele_fit)?;
    let detect = detect_allele_boundaries(&matrix, &model, &params.detect, cancel)?;

    let posteriors = if detect.regions.is_empty() {
        None
    } else {
        Some(retest_alleles(
            &detect.regions,
            &matrix,
            &model,
            &params.retest,
            cancel,
        )?)
    };

    let stats = EvidenceRunStats {
        ingest: ingest_stats,
        skipped_chrom_count: detect.skipped_chroms.len(),
        consensus_region_count: detect.regions.len(),
        indeterminate_call_count: posteriors
            .as_ref()
            .map_or(0, |table| table.indeterminate_count()),
    };

    Ok(AlleleAnalysis {
        matrix,
        model,
        detect,
        posteriors,
        stats,
    })
}

/// Run both evidence types for one sample and merge the call tables
///
pub fn run_joint_analysis(
    expression_input: Option<&RawExpressionInput>,
    allele_input: Option<&RawAlleleInput>,
    resolver: &impl CoordinateResolver,
    params: &PipelineParams,
    selection: EvidenceSelection,
    cancel: Option<&CancelToken>,
) -> TarponResult<JointAnalysis> {
    params.validate()?;

    let use_expression = selection != EvidenceSelection::AlleleOnly;
    let use_alleles = selection != EvidenceSelection::ExpressionOnly;

    if use_expression && expression_input.is_none() {
        return Err(TarponError::Config(
            "expression evidence selected but no expression input provided".to_string(),
        ));
    }
    if use_alleles && allele_input.is_none() {
        return Err(TarponError::Config(
            "allele evidence selected but no allele input provided".to_string(),
        ));
    }

    let expression = match (use_expression, expression_input) {
        (true, Some(input)) => Some(run_expression_analysis(input, resolver, params, cancel)?),
        _ => None,
    };
    let alleles = match (use_alleles, allele_input) {
        (true, Some(input)) => Some(run_allele_analysis(input, resolver, params, cancel)?),
        _ => None,
    };

    // Paired matrices must describe the same cell population
    if let (Some(expression), Some(alleles)) = (&expression, &alleles) {
        check_cell_consistency(&expression.matrix, &alleles.matrix)?;
    }

    let mut tables = Vec::new();
    if let Some(analysis) = &expression {
        if let Some(table) = &analysis.posteriors {
            tables.push(table.clone());
        }
    }
    if let Some(analysis) = &alleles {
        if let Some(table) = &analysis.posteriors {
            tables.push(table.clone());
        }
    }
    let call_table = build_call_table(&tables);

    Ok(JointAnalysis {
        expression,
        alleles,
        call_table,
    })
}
