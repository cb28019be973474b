//src/counts.rs

use ahash::AHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as FmtWrite;
use std::io::{self, Write};

use crate::types::SampleId;

/// Header of the index column in an emitted count table.
pub const OTU_HEADER: &str = "#OTU ID";

/// Sparse `sample x taxon label -> reads` table.
///
/// Samples keep their insertion order; labels are emitted lexicographically.
/// Missing cells read as zero.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CountMatrix {
    samples: Vec<SampleId>,
    columns: AHashMap<SampleId, AHashMap<String, u64>>,
}

impl CountMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a matrix from per-sample `query -> label` maps. `None` labels
    /// (unresolved queries) are not counted.
    pub fn aggregate<'a, S, Q, L>(per_sample: S) -> Self
    where
        S: IntoIterator<Item = (&'a str, Q)>,
        Q: IntoIterator<Item = Option<L>>,
        L: AsRef<str>,
    {
        let mut matrix = CountMatrix::new();
        for (sample, labels) in per_sample {
            matrix.add_sample(sample, labels);
        }
        matrix
    }

    /// Counts one sample's labels. Adding the same sample twice accumulates.
    pub fn add_sample<Q, L>(&mut self, sample: &str, labels: Q)
    where
        Q: IntoIterator<Item = Option<L>>,
        L: AsRef<str>,
    {
        let column = self.column_mut(sample);
        for label in labels.into_iter().flatten() {
            *column.entry(label.as_ref().to_string()).or_insert(0) += 1;
        }
    }

    /// Adds `count` reads of `label` to `sample`.
    pub fn add_count(&mut self, sample: &str, label: &str, count: u64) {
        *self
            .column_mut(sample)
            .entry(label.to_string())
            .or_insert(0) += count;
    }

    fn column_mut(&mut self, sample: &str) -> &mut AHashMap<String, u64> {
        if !self.columns.contains_key(sample) {
            self.samples.push(sample.to_string());
        }
        self.columns.entry(sample.to_string()).or_default()
    }

    /// Folds another matrix into this one, matching samples and labels.
    pub fn merge(&mut self, other: CountMatrix) {
        let CountMatrix { samples, mut columns } = other;
        for sample in samples {
            let column = columns.remove(&sample).unwrap_or_default();
            let target = self.column_mut(&sample);
            for (label, count) in column {
                *target.entry(label).or_insert(0) += count;
            }
        }
    }

    pub fn samples(&self) -> &[SampleId] {
        &self.samples
    }

    /// Union of labels over all samples, sorted.
    pub fn labels(&self) -> Vec<&str> {
        let set: BTreeSet<&str> = self
            .columns
            .values()
            .flat_map(|c| c.keys().map(String::as_str))
            .collect();
        set.into_iter().collect()
    }

    pub fn get(&self, sample: &str, label: &str) -> u64 {
        self.columns
            .get(sample)
            .and_then(|c| c.get(label))
            .copied()
            .unwrap_or(0)
    }

    /// Reads assigned in `sample`.
    pub fn sample_total(&self, sample: &str) -> u64 {
        self.columns
            .get(sample)
            .map(|c| c.values().sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.values().all(|c| c.is_empty())
    }

    /// Dense rows in emission order: `(label, counts in sample order)`.
    pub fn rows(&self) -> BTreeMap<&str, Vec<u64>> {
        self.labels()
            .into_iter()
            .map(|label| {
                let counts = self.samples.iter().map(|s| self.get(s, label)).collect();
                (label, counts)
            })
            .collect()
    }

    /// Renders the tab-separated table: header of sample ids, one row per
    /// label, zero-filled.
    pub fn to_tsv(&self) -> String {
        let mut output = String::new();
        output.push_str(OTU_HEADER);
        for sample in &self.samples {
            output.push('\t');
            output.push_str(sample);
        }
        output.push('\n');

        for (label, counts) in self.rows() {
            output.push_str(label);
            for count in counts {
                write!(output, "\t{}", count).unwrap();
            }
            output.push('\n');
        }
        output
    }

    pub fn write_tsv<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(self.to_tsv().as_bytes())?;
        writer.flush()
    }
}
