//src/types.rs

use std::fmt;

/// NCBI-style numeric taxon identifier. `0` is an ordinary value here.
pub type TaxId = u32;

/// Sample identifier (the input file stem, or the query-id prefix).
pub type SampleId = String;

/// Read identifier, unique within one sample only.
pub type QueryId = String;

/// One `(query, reference)` pair pulled from an aligner's tabular output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignmentHit {
    pub query_id: QueryId,
    pub reference_id: String,
    /// 1-based line in the source file; 0 for hits not read from a file.
    pub line: usize,
}

/// A hit whose reference id has already been resolved to a taxon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceHit<'a> {
    pub query_id: &'a str,
    pub taxon: TaxId,
}

/// Consensus state for a single query.
///
/// A query that has never been seen has no entry at all; `Unresolved` is an
/// explicit terminal state, never confused with taxon `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Consensus {
    Taxon(TaxId),
    Unresolved,
}

impl Consensus {
    pub fn taxon(self) -> Option<TaxId> {
        match self {
            Consensus::Taxon(t) => Some(t),
            Consensus::Unresolved => None,
        }
    }
}

/// Number of ranks kept when collapsing a lineage.
///
/// `0` keeps the full lineage; `1..=8` truncate to kingdom .. strain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CollapseDepth(u8);

impl CollapseDepth {
    pub const MAX: u8 = 8;
    pub const NONE: CollapseDepth = CollapseDepth(0);
    pub const SPECIES: CollapseDepth = CollapseDepth(7);

    pub fn new(depth: u8) -> Option<Self> {
        (depth <= Self::MAX).then_some(CollapseDepth(depth))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn is_full(self) -> bool {
        self.0 == 0
    }
}

impl Default for CollapseDepth {
    fn default() -> Self {
        CollapseDepth::SPECIES
    }
}

/// Canonical `;`-joined lineage string, possibly truncated to a depth.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lineage(String);

impl Lineage {
    /// Builds a lineage from its rank fields, normalising whitespace around
    /// each field. Returns `None` when nothing is left.
    pub fn from_fields<'a, I: IntoIterator<Item = &'a str>>(fields: I) -> Option<Self> {
        let joined = fields
            .into_iter()
            .map(str::trim)
            .collect::<Vec<_>>()
            .join(";");
        let trimmed = joined.trim_end_matches(';');
        if trimmed.is_empty() {
            None
        } else {
            Some(Lineage(trimmed.to_string()))
        }
    }

    /// Parses a lineage as written in a reference map (`"Bacteria; Firmicutes"`).
    pub fn parse(s: &str) -> Option<Self> {
        Self::from_fields(s.split(';'))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of rank fields.
    pub fn ranks(&self) -> usize {
        self.0.split(';').count()
    }

    /// True when every rank of `self` matches the leading ranks of `other`.
    pub fn is_rank_prefix_of(&self, other: &Lineage) -> bool {
        let mine: Vec<&str> = self.0.split(';').collect();
        let theirs: Vec<&str> = other.0.split(';').collect();
        mine.len() <= theirs.len() && mine.iter().zip(&theirs).all(|(a, b)| a == b)
    }
}

impl fmt::Display for Lineage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
