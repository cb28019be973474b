//src/lineage.rs

use ahash::AHashMap;
use std::collections::BTreeMap;

use crate::consensus::Assignment;
use crate::taxdb::Taxonomy;
use crate::types::{CollapseDepth, Lineage, QueryId, SampleId, TaxId};

/// `query -> lineage` after collapsing; `None` for unresolved queries and
/// taxa without any named rank.
pub type CollapsedAssignment = AHashMap<QueryId, Option<Lineage>>;

/// `lineage -> queries` for one sample, queries sorted.
pub type InvertedAssignment = BTreeMap<Lineage, Vec<QueryId>>;

/// Maps every query's consensus taxon to its lineage at `depth`.
pub fn collapse<T: Taxonomy + ?Sized>(
    assignment: &Assignment,
    taxonomy: &T,
    depth: CollapseDepth,
) -> CollapsedAssignment {
    // Many reads share a taxon; look each one up once.
    let mut cache: AHashMap<TaxId, Option<Lineage>> = AHashMap::new();

    assignment
        .iter()
        .map(|(query, consensus)| {
            let lineage = consensus.taxon().and_then(|taxid| {
                cache
                    .entry(taxid)
                    .or_insert_with(|| taxonomy.lineage_at_depth(taxid, depth))
                    .clone()
            });
            (query.clone(), lineage)
        })
        .collect()
}

/// Inverts `query -> lineage` into `lineage -> [query]`, dropping nulls.
pub fn invert(collapsed: CollapsedAssignment) -> InvertedAssignment {
    let mut inverted = InvertedAssignment::new();
    for (query, lineage) in collapsed {
        if let Some(lineage) = lineage {
            inverted.entry(lineage).or_default().push(query);
        }
    }
    for queries in inverted.values_mut() {
        queries.sort_unstable();
    }
    inverted
}

/// One sample's share of a taxon group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleQueries {
    pub sample: SampleId,
    pub queries: Vec<QueryId>,
}

/// Queries from every sample grouped by collapsed lineage.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TaxonGroups {
    groups: BTreeMap<Lineage, Vec<SampleQueries>>,
}

impl TaxonGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one sample's inverted assignment. Contributions from different
    /// samples to the same lineage are kept side by side.
    pub fn add_sample(&mut self, sample: &str, inverted: InvertedAssignment) {
        for (lineage, queries) in inverted {
            if queries.is_empty() {
                continue;
            }
            self.groups.entry(lineage).or_default().push(SampleQueries {
                sample: sample.to_string(),
                queries,
            });
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn get(&self, lineage: &Lineage) -> Option<&[SampleQueries]> {
        self.groups.get(lineage).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Lineage, &[SampleQueries])> {
        self.groups.iter().map(|(l, s)| (l, s.as_slice()))
    }

    /// Total `(sample, query)` pairs across all groups.
    pub fn total_queries(&self) -> usize {
        self.groups
            .values()
            .flat_map(|members| members.iter().map(|m| m.queries.len()))
            .sum()
    }
}
