//src/refgroups.rs

use ahash::AHashMap;
use std::io::BufRead;
use std::path::Path;

use crate::alignments::open_text;
use crate::error::{Result, ShogunError};
use crate::types::Lineage;

/// `lineage -> reference accessions`, loaded from a `.map` file of
/// `accession \t lineage` lines where lineage fields are `"; "`-joined.
#[derive(Debug, Default, Clone)]
pub struct ReferenceGroupIndex {
    groups: AHashMap<Lineage, Vec<String>>,
    skipped: usize,
}

impl ReferenceGroupIndex {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let reader = open_text(path)?;
        let index = Self::from_reader(reader, &path.display().to_string())?;
        log::info!(
            "Loaded {} reference group(s) covering {} accession(s) from {}",
            index.groups.len(),
            index.accessions(),
            path.display()
        );
        Ok(index)
    }

    pub fn from_reader<R: BufRead>(reader: R, source_name: &str) -> Result<Self> {
        let mut index = ReferenceGroupIndex::default();

        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }

            let parsed = line
                .split_once('\t')
                .and_then(|(acc, lineage)| {
                    let acc = acc.trim();
                    // extra columns after the lineage are ignored
                    let lineage = lineage.split('\t').next().unwrap_or("");
                    (!acc.is_empty()).then_some(acc).zip(Lineage::parse(lineage))
                });

            match parsed {
                Some((acc, lineage)) => index.groups.entry(lineage).or_default().push(acc.to_string()),
                None => {
                    index.skipped += 1;
                    log::warn!(
                        "{}",
                        ShogunError::format(source_name, i + 1, "expected `accession<TAB>lineage`")
                    );
                }
            }
        }
        Ok(index)
    }

    /// Reference accessions filed under exactly `lineage`.
    pub fn lookup(&self, lineage: &Lineage) -> &[String] {
        self.groups.get(lineage).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn accessions(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    /// Malformed lines skipped while loading.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}
