//src/taxdb.rs

use ahash::{AHashMap, AHashSet};
use std::io::BufRead;
use std::path::Path;

use crate::alignments::open_text;
use crate::error::{Result, ShogunError};
use crate::types::{CollapseDepth, Lineage, TaxId};

pub type ParentMap = AHashMap<TaxId, TaxId>;
pub type NameMap = AHashMap<TaxId, String>;
pub type RankMap = AHashMap<TaxId, String>;

/// Greengenes-style rank prefixes, kingdom first.
const RANK_PREFIXES: [&str; CollapseDepth::MAX as usize] =
    ["k__", "p__", "c__", "o__", "f__", "g__", "s__", "t__"];

fn rank_level(rank: &str) -> Option<usize> {
    match rank {
        "superkingdom" | "kingdom" | "domain" => Some(0),
        "phylum" => Some(1),
        "class" => Some(2),
        "order" => Some(3),
        "family" => Some(4),
        "genus" => Some(5),
        "species" => Some(6),
        "strain" | "subspecies" => Some(7),
        _ => None,
    }
}

/// The three questions the consensus and collapse stages ask of a taxonomy.
pub trait Taxonomy {
    /// Parent of `taxid`; `None` at the root or for unknown ids.
    fn parent(&self, taxid: TaxId) -> Option<TaxId>;

    /// Most specific common ancestor; `None` when the ids share no ancestor
    /// (including when either id is unknown).
    fn lowest_common_ancestor(&self, a: TaxId, b: TaxId) -> Option<TaxId>;

    /// Ranked lineage of `taxid` truncated to `depth`; `None` when the taxon
    /// has no named rank at all.
    fn lineage_at_depth(&self, taxid: TaxId, depth: CollapseDepth) -> Option<Lineage>;
}

/// In-memory taxonomy loaded from a taxDB file.
#[derive(Debug, Default, Clone)]
pub struct TaxDB {
    parents: ParentMap,
    names: NameMap,
    ranks: RankMap,
}

impl TaxDB {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a taxDB file (plain or gzipped) in the format:
    /// ```text
    /// <taxid>\t<parentid>\t<taxname>\t<rank>
    /// ```
    /// The root is the node that is its own parent. Malformed lines are
    /// logged and skipped.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let reader = open_text(path)?;
        let db = Self::from_reader(reader, &path.display().to_string())?;
        log::info!("Loaded taxonomy with {} nodes from {}", db.len(), path.display());
        Ok(db)
    }

    pub fn from_reader<R: BufRead>(reader: R, source_name: &str) -> Result<Self> {
        let mut db = TaxDB::new();
        let mut skipped = 0usize;

        for (i, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }
            match parse_taxdb_line(&line) {
                Ok((taxid, parent, name, rank)) => db.insert(taxid, parent, name, rank),
                Err(msg) => {
                    skipped += 1;
                    log::warn!("{}", ShogunError::format(source_name, i + 1, msg));
                }
            }
        }

        if skipped > 0 {
            log::warn!("Skipped {skipped} malformed taxonomy line(s) in {source_name}");
        }
        if db.is_empty() {
            return Err(ShogunError::config(format!("taxonomy {source_name} has no nodes")));
        }
        Ok(db)
    }

    pub fn insert(&mut self, taxid: TaxId, parent: TaxId, name: impl Into<String>, rank: impl Into<String>) {
        self.parents.insert(taxid, parent);
        self.names.insert(taxid, name.into());
        self.ranks.insert(taxid, rank.into());
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn contains(&self, taxid: TaxId) -> bool {
        self.parents.contains_key(&taxid)
    }

    pub fn name(&self, taxid: TaxId) -> Option<&str> {
        self.names.get(&taxid).map(String::as_str)
    }

    pub fn rank(&self, taxid: TaxId) -> Option<&str> {
        self.ranks.get(&taxid).map(String::as_str)
    }

    /// `taxid` followed by each ancestor up to the root.
    /// Empty for unknown ids; stops on cycles.
    pub fn ancestry(&self, taxid: TaxId) -> Vec<TaxId> {
        let mut path = Vec::with_capacity(16);
        if !self.contains(taxid) {
            return path;
        }
        let mut node = taxid;
        loop {
            path.push(node);
            match self.parent(node) {
                Some(p) if path.len() <= self.parents.len() => node = p,
                _ => break,
            }
        }
        path
    }
}

fn parse_taxdb_line(line: &str) -> std::result::Result<(TaxId, TaxId, &str, &str), String> {
    let parts: Vec<&str> = line.split('\t').collect();
    if parts.len() < 4 {
        return Err(format!("expected 4 columns, found {}", parts.len()));
    }
    let taxid = parts[0]
        .trim()
        .parse::<TaxId>()
        .map_err(|_| format!("bad taxid `{}`", parts[0]))?;
    let parent = parts[1]
        .trim()
        .parse::<TaxId>()
        .map_err(|_| format!("bad parent id `{}`", parts[1]))?;
    Ok((taxid, parent, parts[2].trim(), parts[3].trim()))
}

impl Taxonomy for TaxDB {
    fn parent(&self, taxid: TaxId) -> Option<TaxId> {
        match self.parents.get(&taxid) {
            Some(&p) if p != taxid && self.contains(p) => Some(p),
            _ => None,
        }
    }

    fn lowest_common_ancestor(&self, a: TaxId, b: TaxId) -> Option<TaxId> {
        if !self.contains(a) || !self.contains(b) {
            return None;
        }
        if a == b {
            return Some(a);
        }

        let a_anc: AHashSet<TaxId> = self.ancestry(a).into_iter().collect();
        self.ancestry(b).into_iter().find(|t| a_anc.contains(t))
    }

    fn lineage_at_depth(&self, taxid: TaxId, depth: CollapseDepth) -> Option<Lineage> {
        let mut slots: [Option<&str>; CollapseDepth::MAX as usize] = Default::default();

        // Walking upward, the outermost node of a rank wins.
        for node in self.ancestry(taxid) {
            if let Some(level) = self.rank(node).and_then(rank_level) {
                slots[level] = self.name(node);
            }
        }

        let deepest = slots.iter().rposition(Option::is_some)?;
        let keep = if depth.is_full() {
            deepest + 1
        } else {
            (depth.get() as usize).min(deepest + 1)
        };

        let fields: Vec<String> = (0..keep)
            .map(|i| format!("{}{}", RANK_PREFIXES[i], slots[i].unwrap_or("")))
            .collect();
        Lineage::from_fields(fields.iter().map(String::as_str))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    /// root(1) -> Bacteria(2) -> Firmicutes(1239) -> Bacilli(91061)
    ///   -> Lactobacillales(186826) -> Lactobacillaceae(33958)
    ///   -> Lactobacillus(1578) -> {L. acidophilus(1579), L. casei(1582)}
    /// root(1) -> Archaea(2157)
    /// 1579 -> strain(99999); 0 is a species under 1578.
    pub(crate) fn sample_taxdb() -> TaxDB {
        let text = "\
1\t1\troot\tno rank
2\t1\tBacteria\tsuperkingdom
2157\t1\tArchaea\tsuperkingdom
1239\t2\tFirmicutes\tphylum
91061\t1239\tBacilli\tclass
186826\t91061\tLactobacillales\torder
33958\t186826\tLactobacillaceae\tfamily
1578\t33958\tLactobacillus\tgenus
1579\t1578\tLactobacillus acidophilus\tspecies
1582\t1578\tLactobacillus casei\tspecies
0\t1578\tLactobacillus zero\tspecies
99999\t1579\tL. acidophilus NCFM\tstrain
";
        TaxDB::from_reader(Cursor::new(text), "mem").unwrap()
    }

    #[test]
    fn parse_skips_malformed_lines() {
        let text = "1\t1\troot\tno rank\nbroken\n2\tx\tBacteria\tsuperkingdom\n3\t1\tArchaea\tsuperkingdom\n";
        let db = TaxDB::from_reader(Cursor::new(text), "mem").unwrap();
        assert_eq!(db.len(), 2);
        assert!(db.contains(3));
        assert!(!db.contains(2));
    }

    #[test]
    fn empty_taxonomy_is_a_configuration_error() {
        let err = TaxDB::from_reader(Cursor::new("\n"), "mem").unwrap_err();
        assert!(matches!(err, ShogunError::Configuration(_)));
    }

    #[test]
    fn parent_stops_at_root() {
        let db = sample_taxdb();
        assert_eq!(db.parent(1579), Some(1578));
        assert_eq!(db.parent(1), None);
        assert_eq!(db.parent(424242), None);
    }

    #[test]
    fn lca_of_siblings_is_genus() {
        let db = sample_taxdb();
        assert_eq!(db.lowest_common_ancestor(1579, 1582), Some(1578));
        assert_eq!(db.lowest_common_ancestor(1582, 1579), Some(1578));
    }

    #[test]
    fn lca_with_ancestor_is_ancestor() {
        let db = sample_taxdb();
        assert_eq!(db.lowest_common_ancestor(99999, 1239), Some(1239));
        assert_eq!(db.lowest_common_ancestor(1239, 99999), Some(1239));
        assert_eq!(db.lowest_common_ancestor(1579, 2157), Some(1));
    }

    #[test]
    fn lca_handles_taxon_zero_and_unknown_ids() {
        let db = sample_taxdb();
        assert_eq!(db.lowest_common_ancestor(0, 1582), Some(1578));
        assert_eq!(db.lowest_common_ancestor(0, 0), Some(0));
        assert_eq!(db.lowest_common_ancestor(1582, 424242), None);
    }

    #[test]
    fn lineage_truncates_by_rank() {
        let db = sample_taxdb();
        let species = CollapseDepth::SPECIES;
        assert_eq!(
            db.lineage_at_depth(99999, species).unwrap().as_str(),
            "k__Bacteria;p__Firmicutes;c__Bacilli;o__Lactobacillales;f__Lactobacillaceae;g__Lactobacillus;s__Lactobacillus acidophilus"
        );
        assert_eq!(
            db.lineage_at_depth(1579, CollapseDepth::new(2).unwrap()).unwrap().as_str(),
            "k__Bacteria;p__Firmicutes"
        );
    }

    #[test]
    fn shallow_taxon_yields_shorter_lineage() {
        let db = sample_taxdb();
        let lineage = db.lineage_at_depth(1239, CollapseDepth::SPECIES).unwrap();
        assert_eq!(lineage.as_str(), "k__Bacteria;p__Firmicutes");
        assert_eq!(db.lineage_at_depth(1, CollapseDepth::SPECIES), None);
        assert_eq!(db.lineage_at_depth(424242, CollapseDepth::NONE), None);
    }

    #[test]
    fn depth_zero_is_most_specific_and_monotone() {
        let db = sample_taxdb();
        let full = db.lineage_at_depth(99999, CollapseDepth::NONE).unwrap();
        assert_eq!(full.ranks(), 8);
        assert!(full.as_str().ends_with("t__L. acidophilus NCFM"));

        let mut previous: Option<Lineage> = None;
        for d in 1..=CollapseDepth::MAX {
            let lineage = db.lineage_at_depth(99999, CollapseDepth::new(d).unwrap()).unwrap();
            if let Some(prev) = &previous {
                assert!(prev.is_rank_prefix_of(&lineage));
            }
            assert!(lineage.is_rank_prefix_of(&full));
            previous = Some(lineage);
        }
    }
}
