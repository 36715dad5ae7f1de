use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};

use blastax::download::{extract_tar_gz, Downloader, NCBI_TAXONOMY_URL};
use blastax::store::build_store;
use blastax::taxonomy::TaxonomyDump;
use blastax::{AssignConfig, CancelFlag, ConsensusMethod, MinSupport, RunSummary};

#[derive(Parser)]
#[command(
    name = "blastax",
    version,
    about = "Taxonomic assignment of sequences from BLAST hits",
    long_about = "Blastax resolves the reference accessions of BLAST hits to taxonomic \
                  lineages through persistent mapping stores and combines them into one \
                  consensus assignment per query sequence."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Number of worker threads (0 = all available)
    #[arg(short = 'j', long, default_value = "0", global = true)]
    threads: usize,
}

#[derive(Subcommand)]
enum Commands {
    /// Assign a taxonomy to each query sequence in a BLAST file
    Sequence(SequenceArgs),

    /// Assign one taxonomy based on all hits in a BLAST file
    Single(SingleArgs),

    /// Assign one taxonomy per BLAST file in a directory
    Multiple(MultipleArgs),

    /// Download an NCBI accession mapping file and build its store
    Download(DownloadArgs),

    /// Build a key-value store from a delimited mapping file
    CreateDb(CreateDbArgs),

    /// Download the NCBI taxonomy dump and build the lineage store
    Taxonomy(TaxonomyArgs),
}

/// NCBI accession mapping the hits were searched against.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum DbType {
    Gb,
    Prot,
    Wgs,
    Est,
    Gss,
    Pdb,
}

impl DbType {
    fn mapping_file(self) -> &'static str {
        match self {
            DbType::Prot => "prot.accession2taxid.gz",
            DbType::Wgs => "nucl_wgs.accession2taxid.gz",
            DbType::Gss => "nucl_gss.accession2taxid.gz",
            DbType::Est => "nucl_est.accession2taxid.gz",
            DbType::Pdb => "pdb.accession2taxid.gz",
            DbType::Gb => "nucl_gb.accession2taxid.gz",
        }
    }

    fn store_file(self) -> &'static str {
        match self {
            DbType::Prot => "prot_mapping.db",
            DbType::Wgs => "wgs_mapping.db",
            DbType::Gss => "gss_mapping.db",
            DbType::Est => "est_mapping.db",
            DbType::Pdb => "pdb_mapping.db",
            DbType::Gb => "gb_mapping.db",
        }
    }
}

/// Knobs shared by the three assignment subcommands.
#[derive(Args)]
struct CommonArgs {
    /// Directory holding the mapping and taxonomy stores
    #[arg(short, long, default_value = ".")]
    directory: PathBuf,

    /// Reference database type the hits were searched against
    #[arg(short = 't', long = "type", value_enum, default_value = "gb")]
    db_type: DbType,

    /// Maximum e-value for a hit to be considered
    #[arg(short, long, default_value_t = 1e-5)]
    evalue: f64,

    /// Minimum alignment length
    #[arg(short = 'l', long, default_value_t = 100)]
    alen: u32,

    /// Minimum percent identity
    #[arg(short, long, default_value_t = 80.0)]
    identity: f64,

    /// Maximum number of hits considered per query (0 = all)
    #[arg(short, long, default_value_t = 100)]
    number: usize,

    /// Minimum support for a majority call: a fraction (<= 1.0) of the
    /// resolved hits, or an absolute hit count
    #[arg(short, long, default_value = "3")]
    minimum: MinSupport,

    /// Consensus method
    #[arg(long, default_value = "lca")]
    method: ConsensusMethod,

    /// Stop examining hits once the consensus is provably stable
    #[arg(long)]
    lazy: bool,

    /// Write results as queries finish instead of in input order
    #[arg(long)]
    unordered: bool,

    /// Per-query store lookup budget in seconds
    #[arg(long, value_name = "SECONDS")]
    lookup_timeout: Option<u64>,
}

impl CommonArgs {
    fn config(&self, threads: usize) -> AssignConfig {
        AssignConfig {
            evalue_max: self.evalue,
            alen_min: self.alen,
            identity_min: self.identity,
            hit_cap: self.number,
            min_support: self.minimum,
            method: self.method,
            lazy: self.lazy,
            threads,
            ordered: !self.unordered,
            lookup_timeout: self.lookup_timeout.map(Duration::from_secs),
        }
    }

    fn accession_db(&self) -> PathBuf {
        self.directory.join(self.db_type.store_file())
    }

    fn lineage_db(&self) -> PathBuf {
        self.directory.join("complete_taxa.db")
    }
}

#[derive(Args)]
struct SequenceArgs {
    /// BLAST tabular input (optionally gzip-compressed)
    blast: PathBuf,

    /// Output file, one line per query
    output: PathBuf,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct SingleArgs {
    /// BLAST tabular input (optionally gzip-compressed)
    blast: PathBuf,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct MultipleArgs {
    /// Directory of BLAST tabular files
    blast_dir: PathBuf,

    /// Output file, one line per input file
    output: PathBuf,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct DownloadArgs {
    /// Directory for the downloaded mapping file and its store
    #[arg(short, long, default_value = ".")]
    directory: PathBuf,

    /// Mapping file to download
    #[arg(short = 't', long = "type", value_enum, default_value = "gb")]
    db_type: DbType,

    /// Base URL of the accession2taxid area
    #[arg(long, default_value_t = format!("{}/accession2taxid", NCBI_TAXONOMY_URL))]
    url: String,
}

#[derive(Args)]
struct CreateDbArgs {
    /// Delimited mapping file (optionally gzip-compressed)
    input: PathBuf,

    /// Store file to create
    output: PathBuf,

    /// Zero-based column holding the key
    #[arg(short, long, default_value_t = 0)]
    key: usize,

    /// Zero-based column holding the value
    #[arg(short, long, default_value_t = 2)]
    value: usize,
}

#[derive(Args)]
struct TaxonomyArgs {
    /// Directory for the taxonomy dump and the lineage store
    #[arg(short, long, default_value = ".")]
    directory: PathBuf,

    /// Base URL of the NCBI taxonomy area
    #[arg(long, default_value = NCBI_TAXONOMY_URL)]
    url: String,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Sequence(args) => cmd_sequence(args, cli.threads),
        Commands::Single(args) => cmd_single(args, cli.threads),
        Commands::Multiple(args) => cmd_multiple(args, cli.threads),
        Commands::Download(args) => cmd_download(args),
        Commands::CreateDb(args) => cmd_create_db(args),
        Commands::Taxonomy(args) => cmd_taxonomy(args),
    }
}

fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_strings(&[
                "⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏",
            ])
            .template("{spinner:.green} {msg}")
            .expect("Invalid spinner template"),
    );
    pb.set_message(msg.to_string());
    pb
}

fn report_summary(summary: &RunSummary, output: &PathBuf) {
    log::info!(
        "Done. {} queries: {} assigned, {} without hits, {} unresolved, {} below support, {} timed out",
        summary.queries,
        summary.assigned,
        summary.no_hits,
        summary.no_lineage,
        summary.low_support,
        summary.timeouts
    );
    log::info!("Output written to {}", output.display());
}

fn cmd_sequence(args: SequenceArgs, threads: usize) -> anyhow::Result<()> {
    let pb = spinner("Assigning taxonomy to each query sequence...");
    let summary = blastax::run_sequence(
        &args.blast,
        &args.output,
        &args.common.accession_db(),
        &args.common.lineage_db(),
        args.common.config(threads),
        &CancelFlag::new(),
    )
    .with_context(|| format!("assigning {}", args.blast.display()))?;
    pb.finish_with_message("Assignment finished.");
    report_summary(&summary, &args.output);
    Ok(())
}

fn cmd_single(args: SingleArgs, threads: usize) -> anyhow::Result<()> {
    let assignment = blastax::run_single(
        &args.blast,
        &args.common.accession_db(),
        &args.common.lineage_db(),
        args.common.config(threads),
    )
    .with_context(|| format!("assigning {}", args.blast.display()))?;

    println!("Last Common Ancestor: {}", assignment.name);
    println!("Rank:                 {}", assignment.rank);
    println!("Taxon id:             {}", assignment.taxid);
    println!(
        "Support:              {}/{} hits",
        assignment.supported, assignment.considered
    );
    Ok(())
}

fn cmd_multiple(args: MultipleArgs, threads: usize) -> anyhow::Result<()> {
    let pb = spinner("Assigning one taxonomy per file...");
    let summary = blastax::run_multiple(
        &args.blast_dir,
        &args.output,
        &args.common.accession_db(),
        &args.common.lineage_db(),
        args.common.config(threads),
        &CancelFlag::new(),
    )
    .with_context(|| format!("assigning files in {}", args.blast_dir.display()))?;
    pb.finish_with_message("Assignment finished.");
    report_summary(&summary, &args.output);
    Ok(())
}

fn cmd_download(args: DownloadArgs) -> anyhow::Result<()> {
    std::fs::create_dir_all(&args.directory)?;
    let downloader = Downloader::new(args.url)?;

    let pb = spinner(&format!("Downloading {}...", args.db_type.mapping_file()));
    let mapping = downloader.fetch_verified(args.db_type.mapping_file(), &args.directory)?;
    pb.finish_with_message("Download complete and verified.");

    let pb = spinner("Building mapping store...");
    let store_path = args.directory.join(args.db_type.store_file());
    let records = build_store(&mapping, &store_path, 0, 2)?;
    pb.finish_with_message(format!(
        "Mapping store {} built with {} records.",
        store_path.display(),
        records
    ));
    Ok(())
}

fn cmd_create_db(args: CreateDbArgs) -> anyhow::Result<()> {
    let pb = spinner(&format!("Processing {}...", args.input.display()));
    let records = build_store(&args.input, &args.output, args.key, args.value)
        .with_context(|| format!("building store from {}", args.input.display()))?;
    pb.finish_with_message(format!(
        "Store {} built with {} records.",
        args.output.display(),
        records
    ));
    Ok(())
}

fn cmd_taxonomy(args: TaxonomyArgs) -> anyhow::Result<()> {
    std::fs::create_dir_all(&args.directory)?;
    let downloader = Downloader::new(args.url)?;

    let pb = spinner("Downloading NCBI taxonomy dump...");
    let archive = downloader.fetch_verified("taxdump.tar.gz", &args.directory)?;
    pb.finish_with_message("Download complete and verified.");

    let pb = spinner("Extracting taxonomy dump...");
    extract_tar_gz(&archive, &args.directory)?;
    pb.finish_with_message("Extraction complete.");

    let pb = spinner("Materializing lineages...");
    let dump = TaxonomyDump::from_dmp_files(
        args.directory.join("nodes.dmp"),
        args.directory.join("names.dmp"),
    )?;
    let table = args.directory.join("complete_taxa");
    let entries = dump.write_lineage_table(&table)?;
    pb.finish_with_message(format!("Lineage table written ({} taxa).", entries));

    let pb = spinner("Building lineage store...");
    let store_path = args.directory.join("complete_taxa.db");
    let records = build_store(&table, &store_path, 0, 1)?;
    pb.finish_with_message(format!(
        "Lineage store {} built with {} records.",
        store_path.display(),
        records
    ));
    Ok(())
}
