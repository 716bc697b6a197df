//! Copy number and loss-of-heterozygosity detection from single-cell data
//!
//! The pipeline ingests per-cell expression and allele count matrices, fits deviance models
//! pooled across cells, segments each (chromosome, cell) track with a Viterbi parse, merges
//! per-cell candidates into consensus regions, and retests every (region, cell) pair with a
//! Bayesian posterior. All stages are deterministic for a fixed input and parameter set.

pub mod boundary_detect;
pub mod cancel;
pub mod chrom_list;
pub mod coords;
pub mod deviance_model;
pub mod error;
pub mod genome_segment;
pub mod ingest;
pub mod int_range;
pub mod matrix;
pub mod pipeline;
pub mod prob_utils;
pub mod retest;
pub mod summary;

pub use crate::error::{TarponError, TarponResult};
pub use crate::pipeline::{
    EvidenceSelection, PipelineParams, run_allele_analysis, run_expression_analysis,
    run_joint_analysis,
};
