//src/database.rs

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::aligners::CoarseAligner;
use crate::error::{Result, ShogunError};

/// Name of the layout file at the root of a database directory.
pub const METADATA_FILE: &str = "metadata.yaml";

/// Files shared by every aligner, relative to the database directory.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeneralFiles {
    /// taxDB file
    pub taxonomy: Option<String>,
    /// Annotated reference sequences
    pub fasta: Option<String>,
    /// `accession<TAB>lineage` map; defaults to the FASTA's `.map`
    pub map: Option<String>,
}

/// Contents of `metadata.yaml`: shared files plus one index prefix per
/// aligner, e.g.
/// ```yaml
/// general:
///   taxonomy: taxDB
///   fasta: rep82.fna
/// bowtie2: bt2/rep82
/// utree: utree/rep82.gg
/// embalmer: emb/rep82
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseMetadata {
    #[serde(default)]
    pub general: GeneralFiles,
    pub bowtie2: Option<String>,
    pub utree: Option<String>,
    pub embalmer: Option<String>,
}

/// A database directory described by its `metadata.yaml`.
#[derive(Debug, Clone)]
pub struct Database {
    dir: PathBuf,
    metadata: DatabaseMetadata,
}

impl Database {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let path = dir.join(METADATA_FILE);
        let text = fs::read_to_string(&path).map_err(ShogunError::at_path(&path))?;
        let metadata = Self::parse(&text)
            .map_err(|e| ShogunError::config(format!("{} is malformed: {e}", path.display())))?;
        log::info!("Using database {}", dir.display());
        Ok(Self { dir, metadata })
    }

    fn parse(text: &str) -> std::result::Result<DatabaseMetadata, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metadata(&self) -> &DatabaseMetadata {
        &self.metadata
    }

    fn resolve(&self, relative: &Option<String>) -> Option<PathBuf> {
        relative.as_deref().map(|r| self.dir.join(r))
    }

    fn prefix(&self, aligner: &str, relative: &Option<String>) -> Result<PathBuf> {
        self.resolve(relative).ok_or_else(|| {
            ShogunError::config(format!(
                "{} in {} has no `{aligner}` entry",
                METADATA_FILE,
                self.dir.display()
            ))
        })
    }

    pub fn taxonomy(&self) -> Option<PathBuf> {
        self.resolve(&self.metadata.general.taxonomy)
    }

    pub fn reference_fasta(&self) -> Option<PathBuf> {
        self.resolve(&self.metadata.general.fasta)
    }

    pub fn reference_map(&self) -> Option<PathBuf> {
        self.resolve(&self.metadata.general.map)
    }

    /// bowtie2 over the `bowtie2` prefix; fails if the index is missing.
    pub fn bowtie2(&self, threads: usize) -> Result<CoarseAligner> {
        CoarseAligner::bowtie2(self.prefix("bowtie2", &self.metadata.bowtie2)?, threads)
    }

    /// utree over `<utree prefix>.ctr`.
    pub fn utree(&self, threads: usize) -> Result<CoarseAligner> {
        let prefix = self.prefix("utree", &self.metadata.utree)?;
        let mut tree = prefix.into_os_string();
        tree.push(".ctr");
        CoarseAligner::utree(PathBuf::from(tree), threads)
    }

    /// embalmer over `<embalmer prefix>.edx`.
    pub fn embalmer(&self, threads: usize) -> Result<CoarseAligner> {
        CoarseAligner::embalmer(self.prefix("embalmer", &self.metadata.embalmer)?, threads)
    }
}
