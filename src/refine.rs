//src/refine.rs

use ahash::AHashMap;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::aligners::{FineAligner, RawAlignmentOutput};
use crate::alignments::TaxonMarkers;
use crate::consensus::{resolve_alignments, FormatPolicy, ParseStats};
use crate::error::{Result, ShogunError};
use crate::fasta::FastaIndex;
use crate::lineage::{collapse, invert, SampleQueries, TaxonGroups};
use crate::refgroups::ReferenceGroupIndex;
use crate::taxdb::Taxonomy;
use crate::types::{CollapseDepth, Lineage, SampleId};

/// Shared flag that stops the refinement pass between groups.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Phase 1: resolves every sample's coarse alignments, collapses them to
/// `depth`, and merges the samples into taxon groups.
pub fn build_groups<T: Taxonomy + ?Sized>(
    taxonomy: &T,
    markers: &TaxonMarkers,
    depth: CollapseDepth,
    policy: FormatPolicy,
    sample_alignments: &[(SampleId, RawAlignmentOutput)],
) -> Result<(TaxonGroups, ParseStats)> {
    let mut groups = TaxonGroups::new();
    let mut stats = ParseStats::default();

    for (sample, output) in sample_alignments {
        let records = output.records()?;
        let source_name = output.path.display().to_string();
        let (assignment, sample_stats) = resolve_alignments(taxonomy, markers, records, policy, &source_name)?;
        stats.merge(sample_stats);

        let inverted = invert(collapse(&assignment, taxonomy, depth));
        log::info!(
            "Sample {sample}: {} queries resolved into {} lineage(s)",
            inverted.values().map(Vec::len).sum::<usize>(),
            inverted.len()
        );
        groups.add_sample(sample, inverted);
    }

    log::info!(
        "Phase 1 produced {} taxon group(s) holding {} queries",
        groups.len(),
        groups.total_queries()
    );
    Ok((groups, stats))
}

/// How one taxon group fared in phase 2.
#[derive(Debug)]
pub enum GroupOutcome {
    Refined { records: usize },
    Skipped { reason: &'static str },
    Failed(ShogunError),
}

#[derive(Debug)]
pub struct GroupReport {
    pub lineage: Lineage,
    pub queries: usize,
    pub references: usize,
    pub missing_queries: usize,
    pub missing_references: usize,
    pub outcome: GroupOutcome,
}

impl GroupReport {
    fn new(lineage: &Lineage) -> Self {
        Self {
            lineage: lineage.clone(),
            queries: 0,
            references: 0,
            missing_queries: 0,
            missing_references: 0,
            outcome: GroupOutcome::Skipped { reason: "not started" },
        }
    }
}

/// Totals for a whole refinement run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefinementSummary {
    pub groups: usize,
    pub refined: usize,
    pub skipped: usize,
    pub failed: usize,
    pub records: usize,
    pub missing_queries: usize,
    pub missing_references: usize,
}

impl RefinementSummary {
    fn add(&mut self, report: &GroupReport) {
        self.groups += 1;
        self.missing_queries += report.missing_queries;
        self.missing_references += report.missing_references;
        match &report.outcome {
            GroupOutcome::Refined { records } => {
                self.refined += 1;
                self.records += records;
            }
            GroupOutcome::Skipped { .. } => self.skipped += 1,
            GroupOutcome::Failed(_) => self.failed += 1,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

/// Sequence sources for phase 2.
pub struct RefinementSources<'a> {
    /// Per-sample query FASTA indexes.
    pub samples: &'a AHashMap<SampleId, FastaIndex>,
    /// The full reference FASTA.
    pub references: &'a FastaIndex,
    pub reference_groups: &'a ReferenceGroupIndex,
}

/// Phase 2 driver: re-aligns each group's queries against only the
/// references filed under its lineage and concatenates the results.
pub struct Refiner<'a> {
    sources: RefinementSources<'a>,
    aligner: &'a FineAligner,
    temp_root: Option<&'a Path>,
    group_jobs: usize,
    fail_fast: bool,
    cancel: CancelFlag,
}

type Sink = Mutex<BufWriter<tempfile::NamedTempFile>>;

impl<'a> Refiner<'a> {
    pub fn new(sources: RefinementSources<'a>, aligner: &'a FineAligner) -> Self {
        Self {
            sources,
            aligner,
            temp_root: None,
            group_jobs: 1,
            fail_fast: false,
            cancel: CancelFlag::new(),
        }
    }

    pub fn temp_root(mut self, root: Option<&'a Path>) -> Self {
        self.temp_root = root;
        self
    }

    pub fn group_jobs(mut self, jobs: usize) -> Self {
        self.group_jobs = jobs.max(1);
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Refines every group and writes the concatenated records to `output`.
    ///
    /// Records are staged in a hidden file next to `output` and only moved
    /// into place once all groups have been processed; on cancellation or a
    /// fail-fast abort the staged file is discarded.
    pub fn run(&self, groups: &TaxonGroups, output: &Path) -> Result<(RefinementSummary, Vec<GroupReport>)> {
        let out_dir = match output.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let staged = tempfile::Builder::new()
            .prefix(".refine-partial-")
            .tempfile_in(out_dir)
            .map_err(ShogunError::at_path(out_dir))?;
        let sink: Sink = Mutex::new(BufWriter::new(staged));

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.group_jobs)
            .build()
            .map_err(|e| ShogunError::config(format!("cannot start refinement pool: {e}")))?;

        let work: Vec<(&Lineage, &[SampleQueries])> = groups.iter().collect();
        log::info!(
            "Phase 2: refining {} group(s) with {} job(s)",
            work.len(),
            self.group_jobs
        );

        let mut reports: Vec<GroupReport> = pool.install(|| {
            work.par_iter()
                .map(|(lineage, members)| {
                    let report = self.refine_group(lineage, members, &sink);
                    if let GroupOutcome::Failed(err) = &report.outcome {
                        log::error!("Group {lineage} failed: {err}");
                        if self.fail_fast {
                            self.cancel.cancel();
                        }
                    }
                    report
                })
                .collect()
        });

        let mut summary = RefinementSummary::default();
        for report in &reports {
            summary.add(report);
        }

        if self.fail_fast {
            let first_failure = reports.iter().position(|r| {
                matches!(&r.outcome, GroupOutcome::Failed(err) if !matches!(err, ShogunError::Cancelled))
            });
            if let Some(pos) = first_failure {
                if let GroupOutcome::Failed(err) = reports.swap_remove(pos).outcome {
                    return Err(err);
                }
            }
        }
        if self.cancel.is_cancelled() {
            return Err(ShogunError::Cancelled);
        }

        self.finish(sink, output)?;
        log::info!(
            "Phase 2 done: {} refined, {} skipped, {} failed, {} record(s) written to {}",
            summary.refined,
            summary.skipped,
            summary.failed,
            summary.records,
            output.display()
        );
        Ok((summary, reports))
    }

    fn finish(&self, sink: Sink, output: &Path) -> Result<()> {
        let staged = sink
            .into_inner()
            .into_inner()
            .map_err(|e| ShogunError::from(e.into_error()))?;
        staged
            .persist(output)
            .map_err(|e| ShogunError::Path {
                path: output.to_path_buf(),
                source: e.error,
            })?;
        Ok(())
    }

    fn refine_group(&self, lineage: &Lineage, members: &[SampleQueries], sink: &Sink) -> GroupReport {
        let mut report = GroupReport::new(lineage);
        let outcome = match self.try_refine_group(lineage, members, sink, &mut report) {
            Ok(outcome) => outcome,
            Err(err) => GroupOutcome::Failed(err),
        };
        report.outcome = outcome;
        report
    }

    fn try_refine_group(
        &self,
        lineage: &Lineage,
        members: &[SampleQueries],
        sink: &Sink,
        report: &mut GroupReport,
    ) -> Result<GroupOutcome> {
        if self.cancel.is_cancelled() {
            return Err(ShogunError::Cancelled);
        }

        // Removed on drop, whichever way this function returns.
        let mut builder = tempfile::Builder::new();
        builder.prefix("shogun-group-");
        let workdir = match self.temp_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }?;

        let queries_path = workdir.path().join("queries.fna");
        let references_path = workdir.path().join("reference.fna");
        let output_path = workdir.path().join("output.txt");

        log::debug!("Group {lineage}: working in {}", workdir.path().display());

        {
            let mut queries = BufWriter::new(File::create(&queries_path)?);
            for member in members {
                let index = self.sources.samples.get(&member.sample);
                for query in &member.queries {
                    let fetched = match index {
                        Some(index) => index.fetch(query),
                        None => Err(ShogunError::Lookup {
                            what: "sample index",
                            name: member.sample.clone(),
                        }),
                    };
                    match fetched {
                        Ok(record) => {
                            record.write_to(&mut queries)?;
                            report.queries += 1;
                        }
                        Err(err @ ShogunError::Lookup { .. }) => {
                            if self.fail_fast {
                                return Err(err);
                            }
                            log::warn!("Group {lineage}, sample {}, query {query}: {err}", member.sample);
                            report.missing_queries += 1;
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
            queries.flush()?;
        }
        if report.queries == 0 {
            return Ok(GroupOutcome::Skipped { reason: "no query sequences" });
        }

        let accessions = self.sources.reference_groups.lookup(lineage);
        if accessions.is_empty() {
            let err = ShogunError::Lookup {
                what: "reference group",
                name: lineage.to_string(),
            };
            if self.fail_fast {
                return Err(err);
            }
            log::warn!("Group {lineage}: {err}");
            return Ok(GroupOutcome::Skipped { reason: "no references for lineage" });
        }

        {
            let mut references = BufWriter::new(File::create(&references_path)?);
            for accession in accessions {
                match self.sources.references.fetch(accession) {
                    Ok(record) => {
                        record.write_to(&mut references)?;
                        report.references += 1;
                    }
                    Err(err @ ShogunError::Lookup { .. }) => {
                        if self.fail_fast {
                            return Err(err);
                        }
                        log::warn!("Group {lineage}, reference {accession}: {err}");
                        report.missing_references += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
            references.flush()?;
        }
        if report.references == 0 {
            return Ok(GroupOutcome::Skipped { reason: "no reference sequences" });
        }

        log::info!(
            "Group {lineage}: aligning {} queries against {} references",
            report.queries,
            report.references
        );
        self.aligner.run(&queries_path, &references_path, &output_path)?;

        let mut raw = match fs::read(&output_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(ShogunError::Path { path: output_path, source: e }),
        };
        if !raw.is_empty() && !raw.ends_with(b"\n") {
            raw.push(b'\n');
        }
        let records = raw.iter().filter(|&&b| b == b'\n').count();

        if self.cancel.is_cancelled() {
            return Err(ShogunError::Cancelled);
        }
        sink.lock().write_all(&raw)?;

        workdir.close()?;
        Ok(GroupOutcome::Refined { records })
    }
}
