//src/aligners.rs

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::alignments::{AlignmentFormat, AlignmentRecords};
use crate::error::{Result, ShogunError};

/// An external executable, optionally behind a launcher
/// (`conda run -n env`, `sh script.sh`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalTool {
    pub program: PathBuf,
    pub leading_args: Vec<OsString>,
}

impl ExternalTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    pub fn wrapped<I, S>(program: impl Into<PathBuf>, leading_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            leading_args: leading_args.into_iter().map(Into::into).collect(),
        }
    }

    fn display_name(&self) -> String {
        self.program.display().to_string()
    }

    /// Runs the tool to completion; a non-zero exit is an `ExternalTool` error
    /// carrying the tail of stderr.
    pub fn run<I, S>(&self, args: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args).args(args);
        log::debug!("Running {:?}", cmd);

        let output = cmd.output().map_err(|e| ShogunError::ExternalTool {
            program: self.display_name(),
            status: "could not start".to_string(),
            stderr: e.to_string(),
        })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            let tail: Vec<&str> = stderr.lines().rev().take(20).collect();
            return Err(ShogunError::ExternalTool {
                program: self.display_name(),
                status: output.status.to_string(),
                stderr: tail.into_iter().rev().collect::<Vec<_>>().join("\n"),
            });
        }
        if !stderr.trim().is_empty() {
            log::debug!("{} stderr:\n{}", self.display_name(), stderr.trim_end());
        }
        Ok(())
    }
}

/// Location and layout of an aligner's output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAlignmentOutput {
    pub path: PathBuf,
    pub format: AlignmentFormat,
}

impl RawAlignmentOutput {
    pub fn records(&self) -> Result<AlignmentRecords<Box<dyn std::io::BufRead>>> {
        AlignmentRecords::open(&self.path, self.format)
    }
}

fn require_file(path: &Path, what: &str) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ShogunError::config(format!("{what} {} not found", path.display())))
    }
}

/// Aligners that place reads against the full reference database.
#[derive(Debug, Clone)]
pub enum CoarseAligner {
    /// bowtie2 against an index prefix; reports up to `alignments_to_report`
    /// hits per read for the LCA consensus.
    Bowtie2 {
        tool: ExternalTool,
        index: PathBuf,
        threads: usize,
        alignments_to_report: usize,
    },
    /// utree search against a compressed tree; emits an LCA label per read.
    Utree {
        tool: ExternalTool,
        compressed_tree: PathBuf,
        threads: usize,
    },
    /// embalmer against a whole `.edx` database; BLAST-6 records go through
    /// the same LCA consensus as bowtie2.
    Embalmer {
        tool: ExternalTool,
        database: PathBuf,
        /// `<prefix>.acc`, used when it sits next to the database.
        accelerator: Option<PathBuf>,
        threads: usize,
    },
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

impl CoarseAligner {
    /// bowtie2 with its index checked up front (`<prefix>.1.bt2` or `.1.bt2l`).
    pub fn bowtie2(index: impl Into<PathBuf>, threads: usize) -> Result<Self> {
        let index = index.into();
        let small = with_suffix(&index, ".1.bt2");
        let large = with_suffix(&index, ".1.bt2l");
        if !small.is_file() && !large.is_file() {
            return Err(ShogunError::config(format!(
                "bowtie2 index {} not found",
                small.display()
            )));
        }
        Ok(CoarseAligner::Bowtie2 {
            tool: ExternalTool::new("bowtie2"),
            index,
            threads: threads.max(1),
            alignments_to_report: 16,
        })
    }

    /// utree with the `.ctr` tree checked up front.
    pub fn utree(compressed_tree: impl Into<PathBuf>, threads: usize) -> Result<Self> {
        let compressed_tree = compressed_tree.into();
        require_file(&compressed_tree, "utree compressed tree")?;
        Ok(CoarseAligner::Utree {
            tool: ExternalTool::new("utree-search_gg"),
            compressed_tree,
            threads: threads.max(1),
        })
    }

    /// embalmer with `<prefix>.edx` checked up front; `<prefix>.acc` is
    /// picked up when present.
    pub fn embalmer(database: impl Into<PathBuf>, threads: usize) -> Result<Self> {
        let prefix = database.into();
        let database = with_suffix(&prefix, ".edx");
        require_file(&database, "embalmer database")?;
        let accelerator = Some(with_suffix(&prefix, ".acc")).filter(|acc| acc.is_file());
        if let Some(acc) = &accelerator {
            log::debug!("Using embalmer accelerator {}", acc.display());
        }
        Ok(CoarseAligner::Embalmer {
            tool: ExternalTool::new("emb15"),
            database,
            accelerator,
            threads: threads.max(1),
        })
    }

    /// Replaces the executable, keeping the other settings.
    pub fn with_tool(mut self, new_tool: ExternalTool) -> Self {
        match &mut self {
            CoarseAligner::Bowtie2 { tool, .. }
            | CoarseAligner::Utree { tool, .. }
            | CoarseAligner::Embalmer { tool, .. } => *tool = new_tool,
        }
        self
    }

    pub fn name(&self) -> &'static str {
        match self {
            CoarseAligner::Bowtie2 { .. } => "bowtie2",
            CoarseAligner::Utree { .. } => "utree",
            CoarseAligner::Embalmer { .. } => "embalmer",
        }
    }

    pub fn output_format(&self) -> AlignmentFormat {
        match self {
            CoarseAligner::Bowtie2 { .. } => AlignmentFormat::Sam,
            CoarseAligner::Utree { .. } => AlignmentFormat::Utree,
            CoarseAligner::Embalmer { .. } => AlignmentFormat::Blast6,
        }
    }

    /// File name of the per-sample alignment output.
    pub fn output_file_name(&self, sample: &str) -> String {
        match self {
            CoarseAligner::Bowtie2 { .. } => format!("{sample}.sam"),
            CoarseAligner::Utree { .. } => format!("{sample}.utree.tsv"),
            CoarseAligner::Embalmer { .. } => format!("{sample}.embalmer.b6"),
        }
    }

    /// File name of the simple-path count table.
    pub fn table_file_name(&self) -> String {
        match self {
            CoarseAligner::Embalmer { .. } => "embalmer_taxatable.txt".to_string(),
            _ => format!("{}_taxon_counts.txt", self.name()),
        }
    }

    pub fn run(&self, queries: &Path, output: &Path) -> Result<RawAlignmentOutput> {
        match self {
            CoarseAligner::Bowtie2 {
                tool,
                index,
                threads,
                alignments_to_report,
            } => {
                let args: Vec<OsString> = vec![
                    "--no-unal".into(),
                    "-x".into(),
                    index.into(),
                    "-S".into(),
                    output.into(),
                    "--np".into(),
                    "0".into(),
                    "--mp".into(),
                    "1,1".into(),
                    "--rdg".into(),
                    "0,1".into(),
                    "--rfg".into(),
                    "0,1".into(),
                    "--score-min".into(),
                    "L,0,-0.02".into(),
                    "-f".into(),
                    queries.into(),
                    "--very-sensitive".into(),
                    "-k".into(),
                    alignments_to_report.to_string().into(),
                    "-p".into(),
                    threads.to_string().into(),
                    "--no-hd".into(),
                ];
                tool.run(args)?;
            }
            CoarseAligner::Utree {
                tool,
                compressed_tree,
                threads,
            } => {
                let args: Vec<OsString> = vec![
                    compressed_tree.into(),
                    queries.into(),
                    output.into(),
                    threads.to_string().into(),
                ];
                tool.run(args)?;
            }
            CoarseAligner::Embalmer {
                tool,
                database,
                accelerator,
                threads,
            } => {
                let mut args: Vec<OsString> = vec!["-r".into(), database.into()];
                if let Some(acc) = accelerator {
                    args.push("-a".into());
                    args.push(acc.into());
                }
                args.extend([
                    "-q".into(),
                    queries.into(),
                    "-o".into(),
                    output.into(),
                    "-m".into(),
                    "CAPITALIST".into(),
                    "-i".into(),
                    "0.98".into(),
                    "-t".into(),
                    threads.to_string().into(),
                ]);
                tool.run(args)?;
            }
        }
        Ok(RawAlignmentOutput {
            path: output.to_path_buf(),
            format: self.output_format(),
        })
    }
}

/// Aligners used for the per-group refinement pass.
#[derive(Debug, Clone)]
pub enum FineAligner {
    /// embalmer (BURST) aligning group queries against group references;
    /// writes BLAST-6 style records.
    Embalmer { tool: ExternalTool, threads: usize },
}

impl FineAligner {
    pub fn embalmer(threads: usize) -> Self {
        FineAligner::Embalmer {
            tool: ExternalTool::new("emb15"),
            threads: threads.max(1),
        }
    }

    pub fn with_tool(mut self, new_tool: ExternalTool) -> Self {
        match &mut self {
            FineAligner::Embalmer { tool, .. } => *tool = new_tool,
        }
        self
    }

    pub fn name(&self) -> &'static str {
        match self {
            FineAligner::Embalmer { .. } => "embalmer",
        }
    }

    pub fn output_format(&self) -> AlignmentFormat {
        match self {
            FineAligner::Embalmer { .. } => AlignmentFormat::Blast6,
        }
    }

    pub fn run(&self, queries: &Path, references: &Path, output: &Path) -> Result<RawAlignmentOutput> {
        match self {
            FineAligner::Embalmer { tool, threads } => {
                let args: Vec<OsString> = vec![
                    "-r".into(),
                    references.into(),
                    "-q".into(),
                    queries.into(),
                    "-o".into(),
                    output.into(),
                    "-t".into(),
                    threads.to_string().into(),
                ];
                tool.run(args)?;
            }
        }
        Ok(RawAlignmentOutput {
            path: output.to_path_buf(),
            format: self.output_format(),
        })
    }
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use std::fs;

    /// Stand-in for embalmer: one record per query, aimed at the first
    /// reference in the group. Run through `sh` so it needs no exec bit.
    pub(crate) const FAKE_EMBALMER: &str = r#"
while [ $# -gt 0 ]; do
  case "$1" in
    -r) refs="$2"; shift 2;;
    -q) queries="$2"; shift 2;;
    -o) out="$2"; shift 2;;
    *) shift;;
  esac
done
ref=$(grep '^>' "$refs" | head -n 1 | cut -c2-)
grep '^>' "$queries" | cut -c2- | while read -r q; do
  printf '%s\t%s\t100.0\n' "$q" "$ref"
done > "$out"
"#;

    pub(crate) fn fake_embalmer(dir: &Path) -> FineAligner {
        let script = dir.join("fake_embalmer.sh");
        fs::write(&script, FAKE_EMBALMER).unwrap();
        FineAligner::embalmer(1).with_tool(ExternalTool::wrapped("sh", [script]))
    }

    #[test]
    fn failing_tool_reports_status_and_stderr() {
        let tool = ExternalTool::wrapped("sh", ["-c", "echo boom >&2; exit 3"]);
        match tool.run(Vec::<OsString>::new()) {
            Err(ShogunError::ExternalTool { stderr, .. }) => assert_eq!(stderr, "boom"),
            other => panic!("expected tool failure, got {other:?}"),
        }
    }

    #[test]
    fn missing_program_is_a_tool_failure() {
        let tool = ExternalTool::new("/nonexistent/aligner");
        assert!(matches!(
            tool.run(["x"]),
            Err(ShogunError::ExternalTool { .. })
        ));
    }

    #[test]
    fn bowtie2_requires_an_index() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("db");
        assert!(matches!(
            CoarseAligner::bowtie2(&prefix, 2),
            Err(ShogunError::Configuration(_))
        ));
        fs::write(dir.path().join("db.1.bt2"), b"").unwrap();
        let aligner = CoarseAligner::bowtie2(&prefix, 2).unwrap();
        assert_eq!(aligner.name(), "bowtie2");
        assert_eq!(aligner.output_file_name("s1"), "s1.sam");
        assert_eq!(aligner.table_file_name(), "bowtie2_taxon_counts.txt");
    }

    #[test]
    fn embalmer_needs_edx_and_finds_the_accelerator() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("rep82");
        assert!(matches!(
            CoarseAligner::embalmer(&prefix, 1),
            Err(ShogunError::Configuration(_))
        ));

        fs::write(dir.path().join("rep82.edx"), b"").unwrap();
        match CoarseAligner::embalmer(&prefix, 1).unwrap() {
            CoarseAligner::Embalmer { accelerator, .. } => assert_eq!(accelerator, None),
            other => panic!("expected embalmer, got {other:?}"),
        }

        fs::write(dir.path().join("rep82.acc"), b"").unwrap();
        let aligner = CoarseAligner::embalmer(&prefix, 1).unwrap();
        match &aligner {
            CoarseAligner::Embalmer { accelerator, database, .. } => {
                assert_eq!(accelerator.as_deref(), Some(dir.path().join("rep82.acc").as_path()));
                assert_eq!(database, &dir.path().join("rep82.edx"));
            }
            other => panic!("expected embalmer, got {other:?}"),
        }
        assert_eq!(aligner.output_format(), AlignmentFormat::Blast6);
        assert_eq!(aligner.output_file_name("s1"), "s1.embalmer.b6");
        assert_eq!(aligner.table_file_name(), "embalmer_taxatable.txt");
    }

    #[test]
    fn embalmer_passes_the_accelerator_to_the_tool() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("db.edx"), b"").unwrap();
        fs::write(dir.path().join("db.acc"), b"").unwrap();
        let args_out = dir.path().join("args.txt");
        let script = dir.path().join("echo_args.sh");
        fs::write(&script, format!("echo \"$@\" > '{}'\n", args_out.display())).unwrap();

        let aligner = CoarseAligner::embalmer(dir.path().join("db"), 3)
            .unwrap()
            .with_tool(ExternalTool::wrapped("sh", [script]));
        aligner
            .run(&dir.path().join("s1.fna"), &dir.path().join("s1.b6"))
            .unwrap();

        let args = fs::read_to_string(&args_out).unwrap();
        assert!(args.contains(&format!("-a {}", dir.path().join("db.acc").display())));
        assert!(args.trim_end().ends_with("-t 3"));
    }

    #[test]
    fn fake_embalmer_writes_blast6_records() {
        let dir = tempfile::tempdir().unwrap();
        let aligner = fake_embalmer(dir.path());
        let q = dir.path().join("q.fna");
        let r = dir.path().join("r.fna");
        let o = dir.path().join("o.txt");
        fs::write(&q, ">q1\nACGT\n>q2\nACGT\n").unwrap();
        fs::write(&r, ">acc7\nACGTACGT\n").unwrap();

        let out = aligner.run(&q, &r, &o).unwrap();
        let hits: Vec<_> = out.records().unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[1].query_id, "q2");
        assert_eq!(hits[1].reference_id, "acc7");
    }
}
