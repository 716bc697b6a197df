use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::chrom_list::{ChromList, compare_chrom_labels};
use crate::coords::{Bin, CoordinateResolver};
use crate::error::{TarponError, TarponResult};
use crate::genome_segment::GenomeSegment;
use crate::matrix::{AlleleMatrix, ExpressionMatrix};

/// Raw expression input before coordinate alignment
///
/// `values` holds the single-cell test matrix and `ref_values` the matched normal/reference
/// population matrix; both are row-major over the same gene rows.
///
#[derive(Clone, Debug)]
pub struct RawExpressionInput {
    pub gene_ids: Vec<String>,
    pub cells: Vec<String>,
    /// Log-scale expression in row-major (gene, cell) order
    pub values: Vec<f64>,
    pub ref_cell_count: usize,
    /// Reference expression in row-major (gene, ref_cell) order
    pub ref_values: Vec<f64>,
}

/// Raw per-SNP allele counts before coordinate alignment
#[derive(Clone, Debug)]
pub struct RawAlleleInput {
    pub site_ids: Vec<String>,
    pub cells: Vec<String>,
    /// Counts in row-major (site, cell) order
    pub ref_counts: Vec<u32>,
    pub alt_counts: Vec<u32>,
}

#[derive(Clone, Debug)]
pub struct ExpressionIngestParams {
    /// Minimum mean log expression over test cells
    pub min_mean_test: f64,

    /// Minimum mean log expression over reference cells
    pub min_mean_ref: f64,

    /// Minimum mean log expression required in both matrices at once
    pub min_mean_both: f64,

    /// Rescale each cell column to the mean library size before filtering
    ///
    /// Off by default for pre-normalized input. The rescale maps every column to the same total,
    /// so repeating it is a no-op.
    ///
    pub library_scale: bool,
}

impl Default for ExpressionIngestParams {
    fn default() -> Self {
        Self {
            min_mean_test: 6.0,
            min_mean_ref: 8.0,
            min_mean_both: 4.5,
            library_scale: false,
        }
    }
}

impl ExpressionIngestParams {
    pub fn validate(&self) -> TarponResult<()> {
        if self.min_mean_test < 0.0 || self.min_mean_ref < 0.0 || self.min_mean_both < 0.0 {
            return Err(TarponError::Config(
                "expression mean filter thresholds must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct AlleleIngestParams {
    /// Maximum tolerated deviation of the pooled alt fraction from the heterozygous expectation
    ///
    /// Sites beyond this are treated as constitutively homozygous and uninformative for LOH.
    ///
    pub max_het_deviance: f64,
}

impl Default for AlleleIngestParams {
    fn default() -> Self {
        Self {
            max_het_deviance: 0.1,
        }
    }
}

impl AlleleIngestParams {
    pub fn validate(&self) -> TarponResult<()> {
        if !(0.0..=0.5).contains(&self.max_het_deviance) {
            return Err(TarponError::Config(format!(
                "max_het_deviance must be in [0, 0.5], got {}",
                self.max_het_deviance
            )));
        }
        Ok(())
    }
}

/// Ingestion accounting carried into the run stats
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct IngestStats {
    pub input_bin_count: usize,
    pub unresolved_bin_count: usize,
    pub filtered_bin_count: usize,
    pub retained_bin_count: usize,
}

/// Mean of the non-NaN entries in one matrix row
fn row_mean(values: &[f64], row_index: usize, col_count: usize) -> f64 {
    let row = &values[row_index * col_count..(row_index + 1) * col_count];
    let mut sum = 0.0;
    let mut count = 0usize;
    for &value in row {
        if value.is_finite() {
            sum += value;
            count += 1;
        }
    }
    if count == 0 { f64::NAN } else { sum / count as f64 }
}

/// Rescale each cell column to the mean library size, in place
///
/// Mapping every column to the same total makes the operation idempotent.
///
fn library_scale_columns(values: &mut [f64], row_count: usize, col_count: usize) {
    if row_count == 0 || col_count == 0 {
        return;
    }
    let mut col_sums = vec![0.0; col_count];
    for row_index in 0..row_count {
        for (col_index, col_sum) in col_sums.iter_mut().enumerate() {
            let value = values[row_index * col_count + col_index];
            if value.is_finite() {
                *col_sum += value;
            }
        }
    }
    let mean_sum = col_sums.iter().sum::<f64>() / col_count as f64;
    for row_index in 0..row_count {
        for (col_index, &col_sum) in col_sums.iter().enumerate() {
            if col_sum > 0.0 {
                values[row_index * col_count + col_index] *= mean_sum / col_sum;
            }
        }
    }
}

/// Resolve bin coordinates and return bin ordering information
///
/// Returns the shared chromosome list plus, for each retained input row, the (input row index,
/// Bin) pair sorted by (chromosome order, start, end, id). Unresolvable rows are dropped.
///
fn resolve_and_sort_bins(
    bin_ids: &[String],
    keep: &[bool],
    resolver: &impl CoordinateResolver,
) -> (ChromList, Vec<(usize, Bin)>, usize) {
    let mut resolved: Vec<(usize, String, i64, i64)> = Vec::new();
    let mut unresolved_count = 0;
    for (row_index, bin_id) in bin_ids.iter().enumerate() {
        if !keep[row_index] {
            continue;
        }
        match resolver.lookup(bin_id) {
            Some(coords) => {
                resolved.push((row_index, coords.chrom, coords.start, coords.end));
            }
            None => {
                unresolved_count += 1;
            }
        }
    }

    // Intern chromosome labels in deterministic order before sorting bins
    let mut chrom_labels = resolved.iter().map(|x| x.1.clone()).collect::<Vec<_>>();
    chrom_labels.sort_by(|a, b| compare_chrom_labels(a, b));
    chrom_labels.dedup();
    let mut chrom_list = ChromList::default();
    for label in chrom_labels.iter() {
        chrom_list.add_chrom(label);
    }

    let mut bins = resolved
        .into_iter()
        .map(|(row_index, chrom, start, end)| {
            let chrom_index = chrom_list.label_to_index[&chrom];
            (
                row_index,
                Bin {
                    id: bin_ids[row_index].clone(),
                    segment: GenomeSegment::new(chrom_index, start, end),
                },
            )
        })
        .collect::<Vec<_>>();
    bins.sort_by(|a, b| {
        (&a.1.segment, &a.1.id).cmp(&(&b.1.segment, &b.1.id))
    });

    (chrom_list, bins, unresolved_count)
}

/// Align a raw expression matrix to genomic coordinates and apply the mean-expression filters
///
/// An empty result is a valid value rather than an error; callers check `is_empty()` before
/// fitting a model on it.
///
pub fn ingest_expression(
    input: &RawExpressionInput,
    resolver: &impl CoordinateResolver,
    params: &ExpressionIngestParams,
) -> TarponResult<(ExpressionMatrix, IngestStats)> {
    params.validate()?;

    let gene_count = input.gene_ids.len();
    let cell_count = input.cells.len();
    if input.values.len() != gene_count * cell_count {
        return Err(TarponError::Input(format!(
            "expression matrix size {} does not match {} genes x {} cells",
            input.values.len(),
            gene_count,
            cell_count
        )));
    }
    if input.ref_values.len() != gene_count * input.ref_cell_count {
        return Err(TarponError::Input(format!(
            "reference matrix size {} does not match {} genes x {} reference cells",
            input.ref_values.len(),
            gene_count,
            input.ref_cell_count
        )));
    }
    if input.ref_cell_count == 0 {
        return Err(TarponError::Input(
            "reference expression matrix has no cells".to_string(),
        ));
    }

    let mut values = input.values.clone();
    let mut ref_values = input.ref_values.clone();
    if params.library_scale {
        library_scale_columns(&mut values, gene_count, cell_count);
        library_scale_columns(&mut ref_values, gene_count, input.ref_cell_count);
    }

    // Mean-expression filters, applied independently in test and reference plus a joint floor
    let mut keep = vec![false; gene_count];
    let mut filtered_count = 0;
    for gene_index in 0..gene_count {
        let test_mean = row_mean(&values, gene_index, cell_count);
        let ref_mean = row_mean(&ref_values, gene_index, input.ref_cell_count);
        let retain = test_mean.is_finite()
            && ref_mean.is_finite()
            && test_mean >= params.min_mean_test
            && ref_mean >= params.min_mean_ref
            && test_mean.min(ref_mean) >= params.min_mean_both;
        keep[gene_index] = retain;
        if !retain {
            filtered_count += 1;
        }
    }

    let (chrom_list, sorted_bins, unresolved_count) =
        resolve_and_sort_bins(&input.gene_ids, &keep, resolver);

    let bin_count = sorted_bins.len();
    let mut matrix_values = Vec::with_capacity(bin_count * cell_count);
    let mut ref_means = Vec::with_capacity(bin_count);
    for (row_index, _) in sorted_bins.iter() {
        matrix_values.extend_from_slice(&values[row_index * cell_count..(row_index + 1) * cell_count]);
        ref_means.push(row_mean(&ref_values, *row_index, input.ref_cell_count));
    }
    let bins = sorted_bins.into_iter().map(|(_, bin)| bin).collect::<Vec<_>>();

    let stats = IngestStats {
        input_bin_count: gene_count,
        unresolved_bin_count: unresolved_count,
        filtered_bin_count: filtered_count,
        retained_bin_count: bin_count,
    };
    info!(
        "Expression ingest: {} of {} genes retained ({} filtered, {} unresolved)",
        stats.retained_bin_count,
        stats.input_bin_count,
        stats.filtered_bin_count,
        stats.unresolved_bin_count
    );
    if bin_count == 0 {
        warn!("Expression ingest produced an empty matrix");
    }

    let matrix = ExpressionMatrix::new(
        chrom_list,
        bins,
        input.cells.clone(),
        matrix_values,
        ref_means,
    );
    Ok((matrix, stats))
}

/// Align raw allele counts to genomic coordinates, dropping non-heterozygous sites
///
pub fn ingest_alleles(
    input: &RawAlleleInput,
    resolver: &impl CoordinateResolver,
    params: &AlleleIngestParams,
) -> TarponResult<(AlleleMatrix, IngestStats)> {
    params.validate()?;

    let site_count = input.site_ids.len();
    let cell_count = input.cells.len();
    if input.ref_counts.len() != site_count * cell_count
        || input.alt_counts.len() != site_count * cell_count
    {
        return Err(TarponError::Input(format!(
            "allele count matrix size does not match {} sites x {} cells",
            site_count, cell_count
        )));
    }

    // Pooled allele fraction filter: sites far from the het expectation across the whole
    // population can't inform LOH detection
    let mut keep = vec![false; site_count];
    let mut filtered_count = 0;
    for site_index in 0..site_count {
        let row = site_index * cell_count..(site_index + 1) * cell_count;
        let pooled_alt: u64 = input.alt_counts[row.clone()].iter().map(|&x| x as u64).sum();
        let pooled_total: u64 = pooled_alt
            + input.ref_counts[row].iter().map(|&x| x as u64).sum::<u64>();
        let retain = if pooled_total == 0 {
            false
        } else {
            let pooled_fraction = pooled_alt as f64 / pooled_total as f64;
            (pooled_fraction - 0.5).abs() <= params.max_het_deviance
        };
        keep[site_index] = retain;
        if !retain {
            filtered_count += 1;
        }
    }

    let (chrom_list, sorted_bins, unresolved_count) =
        resolve_and_sort_bins(&input.site_ids, &keep, resolver);

    let bin_count = sorted_bins.len();
    let mut ref_counts = Vec::with_capacity(bin_count * cell_count);
    let mut alt_counts = Vec::with_capacity(bin_count * cell_count);
    for (row_index, _) in sorted_bins.iter() {
        let row = row_index * cell_count..(row_index + 1) * cell_count;
        ref_counts.extend_from_slice(&input.ref_counts[row.clone()]);
        alt_counts.extend_from_slice(&input.alt_counts[row]);
    }
    let bins = sorted_bins.into_iter().map(|(_, bin)| bin).collect::<Vec<_>>();

    let stats = IngestStats {
        input_bin_count: site_count,
        unresolved_bin_count: unresolved_count,
        filtered_bin_count: filtered_count,
        retained_bin_count: bin_count,
    };
    info!(
        "Allele ingest: {} of {} sites retained ({} filtered, {} unresolved)",
        stats.retained_bin_count,
        stats.input_bin_count,
        stats.filtered_bin_count,
        stats.unresolved_bin_count
    );
    if bin_count == 0 {
        warn!("Allele ingest produced an empty matrix");
    }

    let matrix = AlleleMatrix::new(chrom_list, bins, input.cells.clone(), ref_counts, alt_counts);
    Ok((matrix, stats))
}

/// Check that paired expression and allele matrices describe the same cell population
///
/// The two matrices may carry different bin sets but must agree on cells.
///
pub fn check_cell_consistency(
    expression: &ExpressionMatrix,
    alleles: &AlleleMatrix,
) -> TarponResult<()> {
    let mut expression_cells = expression.cells.clone();
    let mut allele_cells = alleles.cells.clone();
    expression_cells.sort();
    allele_cells.sort();
    if expression_cells != allele_cells {
        return Err(TarponError::Input(
            "expression and allele matrices cover different cell sets".to_string(),
        ));
    }
    Ok(())
}
