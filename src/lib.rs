// src/lib.rs
pub mod types;
pub mod error;
pub mod alignments;
pub mod taxdb;
pub mod consensus;
pub mod lineage;
pub mod counts;
pub mod fasta;
pub mod refgroups;
pub mod aligners;
pub mod config;
pub mod database;
pub mod refine;

use ahash::AHashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use crate::aligners::{CoarseAligner, FineAligner, RawAlignmentOutput};
use crate::alignments::AlignmentFormat;
use crate::config::{discover_samples, RefineConfig, Sample, SimpleConfig};
use crate::consensus::{resolve_alignments, FormatPolicy, ParseStats};
use crate::counts::CountMatrix;
use crate::error::{Result, ShogunError};
use crate::fasta::FastaIndex;
use crate::lineage::collapse;
use crate::refgroups::ReferenceGroupIndex;
use crate::refine::{build_groups, CancelFlag, GroupReport, RefinementSources, RefinementSummary, Refiner};
use crate::taxdb::TaxDB;
use crate::types::SampleId;

/// Sample a read belongs to under the combined-FASTA naming convention
/// `<sample>_<n>`. Ids without `_` are their own sample.
pub fn sample_from_query_id(query_id: &str) -> &str {
    query_id
        .rsplit_once('_')
        .map(|(sample, _)| sample)
        .unwrap_or(query_id)
}

/// Outcome of the align-and-count pipeline.
#[derive(Debug)]
pub struct ProfileResults {
    /// Sample x taxon read counts
    pub counts: CountMatrix,
    /// Where the count table was written
    pub table_path: PathBuf,
    pub parse_stats: ParseStats,
    /// Samples whose alignment could not be produced or read
    pub failed_samples: Vec<(SampleId, ShogunError)>,
}

impl ProfileResults {
    /// Generate the OTU table text on demand
    pub fn get_otu_table(&self) -> String {
        self.counts.to_tsv()
    }

    pub fn has_failures(&self) -> bool {
        !self.failed_samples.is_empty()
    }
}

/// Outcome of the coarse-to-fine pipeline.
#[derive(Debug)]
pub struct CapitalistResults {
    pub output_path: PathBuf,
    pub summary: RefinementSummary,
    pub group_reports: Vec<GroupReport>,
    pub parse_stats: ParseStats,
    pub failed_samples: Vec<(SampleId, ShogunError)>,
}

impl CapitalistResults {
    pub fn has_failures(&self) -> bool {
        !self.failed_samples.is_empty() || self.summary.has_failures()
    }
}

/// Runs `aligner` once per sample into `output_dir`.
///
/// A failed sample is logged and returned alongside the successes unless
/// `fail_fast` is set, in which case the first failure is returned.
/// `cancel` is checked before each sample and once more at the end.
pub fn align_samples(
    samples: &[Sample],
    aligner: &CoarseAligner,
    output_dir: &Path,
    fail_fast: bool,
    cancel: &CancelFlag,
) -> Result<(Vec<(SampleId, RawAlignmentOutput)>, Vec<(SampleId, ShogunError)>)> {
    let mut aligned = Vec::with_capacity(samples.len());
    let mut failed = Vec::new();

    for sample in samples {
        if cancel.is_cancelled() {
            return Err(ShogunError::Cancelled);
        }
        let out = output_dir.join(aligner.output_file_name(&sample.id));
        log::info!("Aligning sample {} with {}", sample.id, aligner.name());
        match aligner.run(&sample.fasta, &out) {
            Ok(raw) => aligned.push((sample.id.clone(), raw)),
            Err(err) if !fail_fast => {
                log::error!("Sample {}: {err}", sample.id);
                failed.push((sample.id.clone(), err));
            }
            Err(err) => return Err(err),
        }
    }
    if cancel.is_cancelled() {
        return Err(ShogunError::Cancelled);
    }
    Ok((aligned, failed))
}

/// Counts one sample's alignments. The sample's own matrix is returned so a
/// sample that fails halfway leaves the run's totals untouched.
fn count_sample(
    sample: &str,
    raw: &RawAlignmentOutput,
    taxonomy: Option<&TaxDB>,
    config: &SimpleConfig,
) -> Result<(CountMatrix, ParseStats)> {
    let common = &config.common;
    let mut counts = CountMatrix::new();
    let source_name = raw.path.display().to_string();
    let attribute = |query: &str| -> String {
        if config.samples_from_query_ids {
            sample_from_query_id(query).to_string()
        } else {
            sample.to_string()
        }
    };

    match raw.format {
        AlignmentFormat::Utree => {
            // utree already reports a label per read
            let mut stats = ParseStats::default();
            for record in raw.records()? {
                match record {
                    Ok(hit) => {
                        stats.records += 1;
                        counts.add_count(&attribute(&hit.query_id), &hit.reference_id, 1);
                    }
                    Err(err @ ShogunError::Format { .. }) if common.format_policy() == FormatPolicy::Skip => {
                        stats.skipped += 1;
                        log::warn!("Skipping record: {err}");
                    }
                    Err(err) => return Err(err),
                }
            }
            Ok((counts, stats))
        }
        AlignmentFormat::Sam | AlignmentFormat::Blast6 => {
            let taxonomy = taxonomy.ok_or_else(|| ShogunError::config("a taxonomy (taxDB) file is required"))?;
            let (assignment, stats) = resolve_alignments(
                taxonomy,
                &common.markers,
                raw.records()?,
                common.format_policy(),
                &source_name,
            )?;
            let collapsed = collapse(&assignment, taxonomy, common.depth);

            if config.samples_from_query_ids {
                for (query, lineage) in &collapsed {
                    if let Some(lineage) = lineage {
                        counts.add_count(&attribute(query), lineage.as_str(), 1);
                    }
                }
            } else {
                counts.add_sample(sample, collapsed.values().map(|l| l.as_ref().map(|l| l.as_str())));
            }
            Ok((counts, stats))
        }
    }
}

/// Simple path: align every sample against the full database, resolve each
/// read's consensus taxon, and write a sample x taxon count table.
pub fn align_and_count(config: &SimpleConfig, aligner: &CoarseAligner, cancel: &CancelFlag) -> Result<ProfileResults> {
    config.validate()?;
    let common = &config.common;

    let taxonomy = match aligner.output_format() {
        AlignmentFormat::Utree => None,
        _ => Some(TaxDB::from_file(common.require_taxdb()?)?),
    };

    let samples = discover_samples(&common.input_dir)?;
    log::info!("Found {} sample(s) in {}", samples.len(), common.input_dir.display());

    let (aligned, mut failed_samples) =
        align_samples(&samples, aligner, &common.output_dir, common.fail_fast, cancel)?;

    let mut counts = CountMatrix::new();
    let mut parse_stats = ParseStats::default();
    for (sample, raw) in &aligned {
        match count_sample(sample, raw, taxonomy.as_ref(), config) {
            Ok((sample_counts, stats)) => {
                counts.merge(sample_counts);
                parse_stats.merge(stats);
            }
            Err(err) if !common.fail_fast && !matches!(err, ShogunError::Configuration(_)) => {
                log::error!("Sample {sample}: {err}");
                failed_samples.push((sample.clone(), err));
            }
            Err(err) => return Err(err),
        }
    }

    if cancel.is_cancelled() {
        return Err(ShogunError::Cancelled);
    }
    if counts.is_empty() {
        log::warn!("No reads were assigned a taxon in any sample");
    }
    let table_path = common.output_dir.join(aligner.table_file_name());
    let file = File::create(&table_path).map_err(ShogunError::at_path(&table_path))?;
    counts.write_tsv(BufWriter::new(file))?;

    log::info!(
        "Wrote {} taxa x {} sample(s) to {} ({} record(s) used, {} skipped, {} failed sample(s))",
        counts.labels().len(),
        counts.samples().len(),
        table_path.display(),
        parse_stats.records,
        parse_stats.skipped,
        failed_samples.len()
    );

    Ok(ProfileResults {
        counts,
        table_path,
        parse_stats,
        failed_samples,
    })
}

/// Refinement path: coarse alignment and consensus for every sample, then
/// a per-taxon-group fine alignment against only that taxon's references.
pub fn run_capitalist(
    config: &RefineConfig,
    coarse: &CoarseAligner,
    fine: &FineAligner,
    cancel: CancelFlag,
) -> Result<CapitalistResults> {
    config.validate()?;
    let common = &config.common;
    if coarse.output_format() == AlignmentFormat::Utree {
        return Err(ShogunError::config(
            "refinement needs reference hits; utree only reports labels",
        ));
    }

    let taxonomy = TaxDB::from_file(common.require_taxdb()?)?;
    let reference_groups = ReferenceGroupIndex::from_file(config.reference_map_path())?;
    if reference_groups.skipped() > 0 {
        log::warn!(
            "Ignored {} malformed line(s) in {}",
            reference_groups.skipped(),
            config.reference_map_path().display()
        );
    }
    let samples = discover_samples(&common.input_dir)?;
    log::info!("Found {} sample(s) in {}", samples.len(), common.input_dir.display());

    // Phase 1
    let (aligned, failed_samples) = align_samples(&samples, coarse, &common.output_dir, common.fail_fast, &cancel)?;
    let (groups, parse_stats) = build_groups(
        &taxonomy,
        &common.markers,
        common.depth,
        common.format_policy(),
        &aligned,
    )?;

    // Phase 2
    let mut sample_indexes: AHashMap<SampleId, FastaIndex> = AHashMap::new();
    for sample in samples.iter().filter(|s| aligned.iter().any(|(id, _)| *id == s.id)) {
        sample_indexes.insert(sample.id.clone(), FastaIndex::open(&sample.fasta)?);
    }
    let references = FastaIndex::open(&config.reference_fasta)?;
    log::info!("{} reference sequence(s) in {}", references.len(), references.path().display());

    let sources = RefinementSources {
        samples: &sample_indexes,
        references: &references,
        reference_groups: &reference_groups,
    };
    let output_path = config.output_path();
    let (summary, group_reports) = Refiner::new(sources, fine)
        .temp_root(config.temp_dir.as_deref())
        .group_jobs(config.group_jobs)
        .fail_fast(common.fail_fast)
        .cancel_flag(cancel)
        .run(&groups, &output_path)?;

    Ok(CapitalistResults {
        output_path,
        summary,
        group_reports,
        parse_stats,
        failed_samples,
    })
}
