use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::process::ExitCode;

use shogun_rs::aligners::{CoarseAligner, ExternalTool, FineAligner};
use shogun_rs::alignments::TaxonMarkers;
use shogun_rs::config::{parse_depth, CommonConfig, RefineConfig, SimpleConfig};
use shogun_rs::database::Database;
use shogun_rs::error::{Result, ShogunError};
use shogun_rs::refine::CancelFlag;
use shogun_rs::{align_and_count, run_capitalist};

#[derive(Parser)]
#[command(name = "shogun-rs")]
#[command(version)]
#[command(about = "Taxonomic profiling of metagenomic reads by alignment and LCA consensus")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Align every sample against the full database and write a taxon count table
    Align(AlignArgs),
    /// Coarse bowtie2 pass, then embalmer refinement per taxon group
    Capitalist(CapitalistArgs),
}

#[derive(Clone, Copy, ValueEnum)]
enum Aligner {
    Bowtie2,
    Utree,
    Embalmer,
}

#[derive(Args)]
struct CommonArgs {
    /// Directory of per-sample *.fna files
    #[arg(short = 'i', long, value_name = "DIR", help_heading = "Input")]
    input: PathBuf,

    #[arg(short = 'o', long, value_name = "DIR", help_heading = "Output")]
    output: PathBuf,

    /// Database directory with a metadata.yaml; explicit paths take precedence
    #[arg(short = 'D', long, value_name = "DIR", help_heading = "Database")]
    database: Option<PathBuf>,

    /// taxDB file: taxid, parent, name, rank
    #[arg(short = 't', long, value_name = "FILE", help_heading = "Database")]
    taxdb: Option<PathBuf>,

    /// bowtie2 index prefix
    #[arg(short = 'b', long = "bt2-index", value_name = "PREFIX", help_heading = "Database")]
    bt2_index: Option<PathBuf>,

    /// Markers around the taxon id in reference names, as "begin,end"
    #[arg(short = 'x', long, value_name = "BEGIN,END", default_value = "ncbi_tid|,|", help_heading = "Database")]
    markers: TaxonMarkers,

    /// Ranks kept in emitted lineages (0 = deepest available, 7 = species)
    #[arg(short = 'd', long, value_name = "N", default_value_t = 7, help_heading = "Profiling")]
    depth: u8,

    /// Threads handed to the aligners
    #[arg(short = 'p', long, value_name = "N", default_value_t = 1, help_heading = "Profiling")]
    threads: usize,

    /// Stop at the first bad record, failed sample, or failed group
    #[arg(long = "fail-fast", help_heading = "Profiling")]
    fail_fast: bool,

    /// bowtie2 executable
    #[arg(long = "bowtie2-bin", value_name = "PATH", default_value = "bowtie2", help_heading = "Tools")]
    bowtie2_bin: PathBuf,
}

impl CommonArgs {
    fn database(&self) -> Result<Option<Database>> {
        self.database.as_ref().map(Database::open).transpose()
    }

    fn config(&self, database: Option<&Database>) -> Result<CommonConfig> {
        let mut common = CommonConfig::new(&self.input, &self.output);
        common.taxdb = self.taxdb.clone().or_else(|| database.and_then(Database::taxonomy));
        common.markers = self.markers.clone();
        common.depth = parse_depth(self.depth)?;
        common.threads = self.threads;
        common.fail_fast = self.fail_fast;
        Ok(common)
    }

    fn bowtie2(&self, database: Option<&Database>) -> Result<CoarseAligner> {
        let aligner = match (&self.bt2_index, database) {
            (Some(index), _) => CoarseAligner::bowtie2(index, self.threads)?,
            (None, Some(db)) => db.bowtie2(self.threads)?,
            (None, None) => return Err(ShogunError::config("--bt2-index or --database is required for bowtie2")),
        };
        Ok(aligner.with_tool(ExternalTool::new(&self.bowtie2_bin)))
    }
}

#[derive(Args)]
struct AlignArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[arg(short = 'a', long, value_enum, default_value = "bowtie2", help_heading = "Profiling")]
    aligner: Aligner,

    /// utree compressed tree (.ctr)
    #[arg(long = "utree-db", value_name = "FILE", help_heading = "Database")]
    utree_db: Option<PathBuf>,

    #[arg(long = "utree-bin", value_name = "PATH", default_value = "utree-search_gg", help_heading = "Tools")]
    utree_bin: PathBuf,

    /// embalmer database prefix (.edx, optional .acc)
    #[arg(long = "embalmer-db", value_name = "PREFIX", help_heading = "Database")]
    embalmer_db: Option<PathBuf>,

    #[arg(long = "embalmer-bin", value_name = "PATH", default_value = "emb15", help_heading = "Tools")]
    embalmer_bin: PathBuf,

    /// Name samples by the query id prefix before the last '_'
    #[arg(long = "split-samples", help_heading = "Profiling")]
    split_samples: bool,
}

#[derive(Args)]
struct CapitalistArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Reference sequences for the refinement pass; defaults to the database's fasta
    #[arg(short = 'r', long = "references", value_name = "FILE", help_heading = "Database")]
    references: Option<PathBuf>,

    /// accession<TAB>lineage map; defaults to the references with a .map extension
    #[arg(short = 'm', long, value_name = "FILE", help_heading = "Database")]
    map: Option<PathBuf>,

    /// Taxon groups refined at once
    #[arg(short = 'j', long = "group-jobs", value_name = "N", default_value_t = 1, help_heading = "Profiling")]
    group_jobs: usize,

    /// Parent directory for per-group scratch files
    #[arg(long = "temp-dir", value_name = "DIR", help_heading = "Output")]
    temp_dir: Option<PathBuf>,

    #[arg(long = "embalmer-bin", value_name = "PATH", default_value = "emb15", help_heading = "Tools")]
    embalmer_bin: PathBuf,
}

fn spinner(color: &str, message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
        .template(&format!("{{spinner:.{color}}} {{msg}}"))
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    spinner.set_style(style);
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(std::time::Duration::from_millis(100));
    spinner
}

/// First Ctrl-C asks the pipeline to stop at the next sample or group
/// boundary; a second one exits immediately.
fn install_interrupt_handler(cancel: &CancelFlag) {
    let cancel = cancel.clone();
    let installed = ctrlc::set_handler(move || {
        if cancel.is_cancelled() {
            std::process::exit(130);
        }
        log::warn!("Interrupted; finishing the current step (press Ctrl-C again to quit now)");
        cancel.cancel();
    });
    if let Err(e) = installed {
        log::warn!("Could not install the Ctrl-C handler: {e}");
    }
}

fn run_align(args: &AlignArgs, cancel: &CancelFlag) -> Result<bool> {
    let database = args.common.database()?;
    let db = database.as_ref();
    let config = SimpleConfig {
        common: args.common.config(db)?,
        samples_from_query_ids: args.split_samples,
    };
    let threads = args.common.threads;
    let aligner = match args.aligner {
        Aligner::Bowtie2 => args.common.bowtie2(db)?,
        Aligner::Utree => {
            let aligner = match (&args.utree_db, db) {
                (Some(tree), _) => CoarseAligner::utree(tree, threads)?,
                (None, Some(db)) => db.utree(threads)?,
                (None, None) => return Err(ShogunError::config("--utree-db or --database is required for utree")),
            };
            aligner.with_tool(ExternalTool::new(&args.utree_bin))
        }
        Aligner::Embalmer => {
            let aligner = match (&args.embalmer_db, db) {
                (Some(prefix), _) => CoarseAligner::embalmer(prefix, threads)?,
                (None, Some(db)) => db.embalmer(threads)?,
                (None, None) => {
                    return Err(ShogunError::config("--embalmer-db or --database is required for embalmer"))
                }
            };
            aligner.with_tool(ExternalTool::new(&args.embalmer_bin))
        }
    };

    let progress = spinner("blue", &format!("Aligning and counting with {}...", aligner.name()));
    let results = align_and_count(&config, &aligner, cancel);
    progress.finish_and_clear();
    let results = results?;

    for (sample, err) in &results.failed_samples {
        log::error!("Sample {sample} failed: {err}");
    }
    let done = spinner("green", "");
    done.finish_with_message(format!(
        "Wrote {} taxa across {} sample(s) to {}",
        results.counts.labels().len(),
        results.counts.samples().len(),
        results.table_path.display()
    ));
    Ok(!results.has_failures())
}

fn run_refine(args: &CapitalistArgs, cancel: &CancelFlag) -> Result<bool> {
    let database = args.common.database()?;
    let db = database.as_ref();
    let references = args
        .references
        .clone()
        .or_else(|| db.and_then(Database::reference_fasta))
        .ok_or_else(|| ShogunError::config("--references or a database with a fasta entry is required"))?;

    let mut config = RefineConfig::new(args.common.config(db)?, references);
    config.reference_map = args.map.clone().or_else(|| db.and_then(Database::reference_map));
    config.group_jobs = args.group_jobs;
    config.temp_dir = args.temp_dir.clone();

    let coarse = args.common.bowtie2(db)?;
    let fine = FineAligner::embalmer(args.common.threads).with_tool(ExternalTool::new(&args.embalmer_bin));

    let progress = spinner("yellow", "Running coarse alignment and group refinement...");
    let results = run_capitalist(&config, &coarse, &fine, cancel.clone());
    progress.finish_and_clear();
    let results = results?;

    for (sample, err) in &results.failed_samples {
        log::error!("Sample {sample} failed: {err}");
    }
    let summary = &results.summary;
    let done = spinner("cyan", "");
    done.finish_with_message(format!(
        "{} of {} group(s) refined ({} skipped, {} failed); {} record(s) in {}",
        summary.refined,
        summary.groups,
        summary.skipped,
        summary.failed,
        summary.records,
        results.output_path.display()
    ));
    Ok(!results.has_failures())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let cancel = CancelFlag::new();
    install_interrupt_handler(&cancel);

    let outcome = match &cli.command {
        Command::Align(args) => run_align(args, &cancel),
        Command::Capitalist(args) => run_refine(args, &cancel),
    };

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            log::warn!("Finished with failures; see the log above");
            ExitCode::from(2)
        }
        Err(ShogunError::Cancelled) => {
            log::warn!("Cancelled; partial outputs were discarded");
            ExitCode::from(130)
        }
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
