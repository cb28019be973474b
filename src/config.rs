//src/config.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::alignments::TaxonMarkers;
use crate::consensus::FormatPolicy;
use crate::error::{Result, ShogunError};
use crate::types::{CollapseDepth, SampleId};

/// Extension of per-sample query FASTA files.
pub const SAMPLE_EXTENSION: &str = "fna";

/// One input sample: its id and the FASTA holding its reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub id: SampleId,
    pub fasta: PathBuf,
}

/// Finds every `*.fna` file directly inside `dir`, sorted by name.
/// The sample id is the file stem.
pub fn discover_samples<P: AsRef<Path>>(dir: P) -> Result<Vec<Sample>> {
    let dir = dir.as_ref();
    let entries = fs::read_dir(dir).map_err(ShogunError::at_path(dir))?;

    let mut samples: Vec<Sample> = entries
        .filter_map(|entry| {
            let path = entry.ok()?.path();
            if !path.is_file() || path.extension()? != SAMPLE_EXTENSION {
                return None;
            }
            let id = path.file_stem()?.to_string_lossy().into_owned();
            Some(Sample { id, fasta: path })
        })
        .collect();
    samples.sort_by(|a, b| a.id.cmp(&b.id));

    if samples.is_empty() {
        return Err(ShogunError::config(format!(
            "no .{SAMPLE_EXTENSION} files in {}",
            dir.display()
        )));
    }
    Ok(samples)
}

/// Parses a collapse depth, rejecting anything outside `0..=8`.
pub fn parse_depth(value: u8) -> Result<CollapseDepth> {
    CollapseDepth::new(value).ok_or_else(|| {
        ShogunError::config(format!(
            "depth must be between 0 and {}, got {value}",
            CollapseDepth::MAX
        ))
    })
}

/// Path of the reference group map that sits next to a reference FASTA.
pub fn default_reference_map(reference_fasta: &Path) -> PathBuf {
    reference_fasta.with_extension("map")
}

fn require_dir(path: &Path, what: &str) -> Result<()> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(ShogunError::config(format!("{what} {} is not a directory", path.display())))
    }
}

fn require_file(path: &Path, what: &str) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ShogunError::config(format!("{what} {} not found", path.display())))
    }
}

/// Settings shared by both pipelines.
#[derive(Debug, Clone)]
pub struct CommonConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    /// taxDB file; needed whenever reference hits go through the LCA.
    pub taxdb: Option<PathBuf>,
    pub markers: TaxonMarkers,
    pub depth: CollapseDepth,
    /// Threads handed to the external aligners.
    pub threads: usize,
    /// Abort on the first bad record, sample, or group.
    pub fail_fast: bool,
}

impl CommonConfig {
    pub fn new(input_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            taxdb: None,
            markers: TaxonMarkers::default(),
            depth: CollapseDepth::default(),
            threads: 1,
            fail_fast: false,
        }
    }

    pub fn with_taxdb(mut self, taxdb: impl Into<PathBuf>) -> Self {
        self.taxdb = Some(taxdb.into());
        self
    }

    /// The taxDB path, or a configuration error when none was given.
    pub fn require_taxdb(&self) -> Result<&Path> {
        self.taxdb
            .as_deref()
            .ok_or_else(|| ShogunError::config("a taxonomy (taxDB) file is required"))
    }

    pub fn format_policy(&self) -> FormatPolicy {
        if self.fail_fast {
            FormatPolicy::Abort
        } else {
            FormatPolicy::Skip
        }
    }

    /// Checks inputs and creates the output directory.
    pub fn validate(&self) -> Result<()> {
        require_dir(&self.input_dir, "input directory")?;
        if let Some(taxdb) = &self.taxdb {
            require_file(taxdb, "taxonomy")?;
        }
        if self.threads == 0 {
            return Err(ShogunError::config("threads must be at least 1"));
        }
        fs::create_dir_all(&self.output_dir).map_err(ShogunError::at_path(&self.output_dir))?;
        Ok(())
    }
}

/// Settings for the plain align-and-count pipeline.
#[derive(Debug, Clone)]
pub struct SimpleConfig {
    pub common: CommonConfig,
    /// Attribute reads to the sample named by their id prefix (before the
    /// last `_`) rather than to the file they came from.
    pub samples_from_query_ids: bool,
}

impl SimpleConfig {
    pub fn validate(&self) -> Result<()> {
        self.common.validate()
    }
}

/// Settings for the coarse-to-fine refinement pipeline.
#[derive(Debug, Clone)]
pub struct RefineConfig {
    pub common: CommonConfig,
    pub reference_fasta: PathBuf,
    /// `accession \t lineage` map; defaults to the reference FASTA's `.map`.
    pub reference_map: Option<PathBuf>,
    /// Taxon groups refined concurrently.
    pub group_jobs: usize,
    /// Parent directory for per-group scratch space.
    pub temp_dir: Option<PathBuf>,
    /// File name of the concatenated refinement output.
    pub output_name: String,
}

impl RefineConfig {
    pub fn new(common: CommonConfig, reference_fasta: impl Into<PathBuf>) -> Self {
        Self {
            common,
            reference_fasta: reference_fasta.into(),
            reference_map: None,
            group_jobs: 1,
            temp_dir: None,
            output_name: "embalmer_out.txt".to_string(),
        }
    }

    pub fn reference_map_path(&self) -> PathBuf {
        self.reference_map
            .clone()
            .unwrap_or_else(|| default_reference_map(&self.reference_fasta))
    }

    pub fn output_path(&self) -> PathBuf {
        self.common.output_dir.join(&self.output_name)
    }

    pub fn validate(&self) -> Result<()> {
        self.common.validate()?;
        self.common.require_taxdb()?;
        require_file(&self.reference_fasta, "reference FASTA")?;
        require_file(&self.reference_map_path(), "reference map")?;
        if self.group_jobs == 0 {
            return Err(ShogunError::config("group jobs must be at least 1"));
        }
        if let Some(tmp) = &self.temp_dir {
            require_dir(tmp, "temporary directory")?;
        }
        if self.output_name.is_empty() {
            return Err(ShogunError::config("output name is empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_bounds() {
        assert_eq!(parse_depth(0).unwrap(), CollapseDepth::NONE);
        assert_eq!(parse_depth(7).unwrap(), CollapseDepth::SPECIES);
        assert!(parse_depth(8).is_ok());
        assert!(matches!(parse_depth(9), Err(ShogunError::Configuration(_))));
    }

    #[test]
    fn samples_are_fna_files_sorted_by_stem() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.fna", "a.fna", "notes.txt", "c.fna.gz"] {
            fs::write(dir.path().join(name), ">x\nA\n").unwrap();
        }
        let samples = discover_samples(dir.path()).unwrap();
        let ids: Vec<&str> = samples.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn empty_input_dir_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(discover_samples(dir.path()), Err(ShogunError::Configuration(_))));
    }

    #[test]
    fn reference_map_defaults_next_to_fasta() {
        let common = CommonConfig::new("in", "out");
        let cfg = RefineConfig::new(common, "/db/refs.fna");
        assert_eq!(cfg.reference_map_path(), PathBuf::from("/db/refs.map"));
        assert_eq!(cfg.output_path(), PathBuf::from("out/embalmer_out.txt"));
    }

    #[test]
    fn validate_fails_fast_on_missing_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let common = CommonConfig::new(dir.path(), dir.path().join("out")).with_taxdb(dir.path().join("taxDB"));
        let cfg = RefineConfig::new(common, dir.path().join("refs.fna"));
        assert!(matches!(cfg.validate(), Err(ShogunError::Configuration(_))));

        fs::write(dir.path().join("taxDB"), "1\t1\troot\tno rank\n").unwrap();
        fs::write(dir.path().join("refs.fna"), ">a\nA\n").unwrap();
        assert!(cfg.validate().is_err());
        fs::write(dir.path().join("refs.map"), "a\tk__A\n").unwrap();
        cfg.validate().unwrap();
    }
}
