//src/consensus.rs

use ahash::AHashMap;

use crate::alignments::TaxonMarkers;
use crate::error::{Result, ShogunError};
use crate::taxdb::Taxonomy;
use crate::types::{AlignmentHit, Consensus, QueryId, ReferenceHit};

/// Per-sample `query -> consensus` map.
pub type Assignment = AHashMap<QueryId, Consensus>;

/// What to do with a record that fails to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatPolicy {
    /// Log, count, and move on to the next record.
    #[default]
    Skip,
    /// Stop at the first bad record.
    Abort,
}

/// Counters reported after reading one alignment stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ParseStats {
    pub records: usize,
    pub skipped: usize,
}

impl ParseStats {
    pub fn merge(&mut self, other: ParseStats) {
        self.records += other.records;
        self.skipped += other.skipped;
    }
}

/// Folds reference hits into one taxon per query by lowest common ancestor.
///
/// The first hit for a query records its taxon; each later hit to a
/// different taxon replaces it with their LCA. A query whose hits share no
/// ancestor becomes `Unresolved` and stays that way.
pub struct ConsensusResolver<'t, T: Taxonomy + ?Sized> {
    taxonomy: &'t T,
    assignment: Assignment,
}

impl<'t, T: Taxonomy + ?Sized> ConsensusResolver<'t, T> {
    pub fn new(taxonomy: &'t T) -> Self {
        Self {
            taxonomy,
            assignment: Assignment::new(),
        }
    }

    pub fn fold(&mut self, hit: ReferenceHit<'_>) {
        match self.assignment.get_mut(hit.query_id) {
            None => {
                self.assignment
                    .insert(hit.query_id.to_string(), Consensus::Taxon(hit.taxon));
            }
            Some(current) => {
                if let Consensus::Taxon(t) = *current {
                    if t != hit.taxon {
                        *current = match self.taxonomy.lowest_common_ancestor(t, hit.taxon) {
                            Some(lca) => Consensus::Taxon(lca),
                            None => Consensus::Unresolved,
                        };
                    }
                }
            }
        }
    }

    pub fn finish(self) -> Assignment {
        self.assignment
    }
}

/// Resolves already-extracted hits. Convenience for in-memory callers.
pub fn resolve_hits<'a, T, I>(taxonomy: &T, hits: I) -> Assignment
where
    T: Taxonomy + ?Sized,
    I: IntoIterator<Item = ReferenceHit<'a>>,
{
    let mut resolver = ConsensusResolver::new(taxonomy);
    for hit in hits {
        resolver.fold(hit);
    }
    resolver.finish()
}

/// Resolves a stream of raw alignment records for one sample.
///
/// Records whose reference id does not carry a taxon between `markers` are
/// format errors, handled per `policy`. I/O errors always abort.
pub fn resolve_alignments<T, I>(
    taxonomy: &T,
    markers: &TaxonMarkers,
    records: I,
    policy: FormatPolicy,
    source_name: &str,
) -> Result<(Assignment, ParseStats)>
where
    T: Taxonomy + ?Sized,
    I: IntoIterator<Item = Result<AlignmentHit>>,
{
    let mut resolver = ConsensusResolver::new(taxonomy);
    let mut stats = ParseStats::default();

    for record in records {
        let err = match record {
            Ok(hit) => match markers.extract(&hit.reference_id) {
                Ok(taxon) => {
                    stats.records += 1;
                    resolver.fold(ReferenceHit {
                        query_id: &hit.query_id,
                        taxon,
                    });
                    continue;
                }
                Err(msg) => ShogunError::format(source_name, hit.line, format!("query {}: {msg}", hit.query_id)),
            },
            Err(e @ ShogunError::Format { .. }) => e,
            Err(e) => return Err(e),
        };

        match policy {
            FormatPolicy::Abort => return Err(err),
            FormatPolicy::Skip => {
                stats.skipped += 1;
                log::warn!("Skipping record: {err}");
            }
        }
    }

    log::debug!(
        "{source_name}: {} hit(s) folded, {} skipped",
        stats.records,
        stats.skipped
    );
    Ok((resolver.finish(), stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignments::{AlignmentFormat, AlignmentRecords};
    use crate::taxdb::tests::sample_taxdb;
    use crate::types::{CollapseDepth, Lineage, TaxId};
    use std::io::Cursor;

    /// Taxonomy stub answering LCA from a fixed table, for the scenario tests.
    struct FixedLca(Vec<((TaxId, TaxId), TaxId)>);

    impl Taxonomy for FixedLca {
        fn parent(&self, _taxid: TaxId) -> Option<TaxId> {
            None
        }

        fn lowest_common_ancestor(&self, a: TaxId, b: TaxId) -> Option<TaxId> {
            self.0
                .iter()
                .find(|((x, y), _)| (*x == a && *y == b) || (*x == b && *y == a))
                .map(|(_, lca)| *lca)
        }

        fn lineage_at_depth(&self, _taxid: TaxId, _depth: CollapseDepth) -> Option<Lineage> {
            None
        }
    }

    fn hits<'a>(pairs: &'a [(&'a str, TaxId)]) -> impl Iterator<Item = ReferenceHit<'a>> + 'a {
        pairs.iter().map(|&(q, t)| ReferenceHit { query_id: q, taxon: t })
    }

    #[test]
    fn two_hits_resolve_to_lca() {
        let tax = FixedLca(vec![((100, 200), 50)]);
        let a = resolve_hits(&tax, hits(&[("q1", 100), ("q1", 200)]));
        assert_eq!(a["q1"], Consensus::Taxon(50));
    }

    #[test]
    fn single_hit_is_identity() {
        let tax = FixedLca(vec![]);
        let a = resolve_hits(&tax, hits(&[("q1", 100)]));
        assert_eq!(a["q1"], Consensus::Taxon(100));
    }

    #[test]
    fn ancestor_absorbs_descendant_in_either_order() {
        let db = sample_taxdb();
        let fwd = resolve_hits(&db, hits(&[("q", 99999), ("q", 1239)]));
        let rev = resolve_hits(&db, hits(&[("q", 1239), ("q", 99999)]));
        assert_eq!(fwd["q"], Consensus::Taxon(1239));
        assert_eq!(rev["q"], Consensus::Taxon(1239));
    }

    #[test]
    fn resolution_ignores_hit_order() {
        let db = sample_taxdb();
        let taxa: [TaxId; 4] = [1579, 99999, 1582, 0];
        let expected = resolve_hits(&db, taxa.iter().map(|&t| ReferenceHit { query_id: "q", taxon: t }));
        assert_eq!(expected["q"], Consensus::Taxon(1578));

        // every rotation and the reversal of each
        for shift in 0..taxa.len() {
            let mut order = taxa.to_vec();
            order.rotate_left(shift);
            for seq in [order.clone(), order.iter().rev().copied().collect()] {
                let got = resolve_hits(&db, seq.iter().map(|&t| ReferenceHit { query_id: "q", taxon: t }));
                assert_eq!(got["q"], expected["q"], "order {seq:?}");
            }
        }
    }

    #[test]
    fn taxon_zero_is_a_real_assignment() {
        let db = sample_taxdb();
        let a = resolve_hits(&db, hits(&[("q", 0), ("q", 1582)]));
        assert_eq!(a["q"], Consensus::Taxon(1578));

        let b = resolve_hits(&db, hits(&[("q", 0), ("q", 0)]));
        assert_eq!(b["q"], Consensus::Taxon(0));
    }

    #[test]
    fn unresolved_stays_unresolved() {
        let db = sample_taxdb();
        let a = resolve_hits(&db, hits(&[("q", 1579), ("q", 424242), ("q", 1579), ("q", 1)]));
        assert_eq!(a["q"], Consensus::Unresolved);

        let b = resolve_hits(&db, hits(&[("r", 424242), ("r", 1579)]));
        assert_eq!(b["r"], Consensus::Unresolved);
    }

    #[test]
    fn queries_are_independent() {
        let db = sample_taxdb();
        let a = resolve_hits(&db, hits(&[("q1", 1579), ("q2", 1582), ("q1", 1582)]));
        assert_eq!(a.len(), 2);
        assert_eq!(a["q1"], Consensus::Taxon(1578));
        assert_eq!(a["q2"], Consensus::Taxon(1582));
    }

    #[test]
    fn bad_records_are_skipped_under_skip_policy() {
        let db = sample_taxdb();
        let sam = "\
q1\t0\tgi|1|ncbi_tid|1579|\t1
q1\t0\tgi|2|ncbi_tid|1582|\t1
q2\t0
q3\t0\tgi|3|no_taxon|\t1
q4\t0\tgi|4|ncbi_tid|1239|\t1
";
        let records = AlignmentRecords::new(Cursor::new(sam), AlignmentFormat::Sam, "s1.sam");
        let (a, stats) =
            resolve_alignments(&db, &TaxonMarkers::default(), records, FormatPolicy::Skip, "s1.sam").unwrap();
        assert_eq!(stats, ParseStats { records: 3, skipped: 2 });
        assert_eq!(a["q1"], Consensus::Taxon(1578));
        assert_eq!(a["q4"], Consensus::Taxon(1239));
        assert!(!a.contains_key("q2"));
        assert!(!a.contains_key("q3"));
    }

    #[test]
    fn bad_records_abort_under_abort_policy() {
        let db = sample_taxdb();
        let sam = "q1\t0\tgi|1|ncbi_tid|1579|\t1\nq3\t0\tgi|3|no_taxon|\t1\n";
        let records = AlignmentRecords::new(Cursor::new(sam), AlignmentFormat::Sam, "s1.sam");
        let err = resolve_alignments(&db, &TaxonMarkers::default(), records, FormatPolicy::Abort, "s1.sam")
            .unwrap_err();
        assert!(matches!(err, ShogunError::Format { line: 2, .. }));
    }

    #[test]
    fn marker_errors_report_the_file_line() {
        let db = sample_taxdb();
        let sam = "\
@HD\tVN:1.0
@SQ\tSN:gi|1|ncbi_tid|1579|\tLN:10
@PG\tID:bowtie2
q0\t4\t*\t0
q3\t0\tgi|3|no_taxon|\t1
";
        let records = AlignmentRecords::new(Cursor::new(sam), AlignmentFormat::Sam, "s1.sam");
        let err = resolve_alignments(&db, &TaxonMarkers::default(), records, FormatPolicy::Abort, "s1.sam")
            .unwrap_err();
        assert!(matches!(err, ShogunError::Format { line: 5, .. }), "{err}");
    }
}
