// src/lib.rs
pub mod assign;
pub mod blast;
pub mod config;
pub mod download;
pub mod error;
pub mod store;
pub mod taxonomy;
pub mod types;

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

pub use crate::assign::{Assigner, CancelFlag, RunSummary};
pub use crate::config::{AssignConfig, ConsensusMethod, MinSupport};
pub use crate::error::{BlastaxError, Result};
pub use crate::store::{build_store, KvLookup, MapStore};
pub use crate::types::{Assignment, AssignmentStatus, Hit};

/// Opens both read-only stores for a run. An open failure here is fatal:
/// assignment cannot proceed without them.
fn open_stores(accession_db: &Path, lineage_db: &Path) -> Result<(MapStore, MapStore)> {
    let accessions = MapStore::open(accession_db)?;
    let lineages = MapStore::open(lineage_db)?;
    Ok((accessions, lineages))
}

/// Assigns a taxonomy to each query sequence of a BLAST tabular file,
/// writing one `query-id<TAB>taxid<TAB>rank<TAB>name<TAB>s/c` line per
/// query to `output` as results become available.
pub fn run_sequence(
    blast_file: &Path,
    output: &Path,
    accession_db: &Path,
    lineage_db: &Path,
    config: AssignConfig,
    cancel: &CancelFlag,
) -> Result<RunSummary> {
    let (accessions, lineages) = open_stores(accession_db, lineage_db)?;
    let grouped = blast::group_by_query(blast::read_hits(blast_file)?);
    log::info!(
        "Assigning taxonomy to {} query sequences from {}",
        grouped.len(),
        blast_file.display()
    );

    let assigner = Assigner::new(config, &accessions, &lineages);
    let mut out = BufWriter::new(File::create(output)?);
    assigner.assign_sequences(&grouped, &mut out, cancel)
}

/// One consensus assignment from every hit in a BLAST tabular file.
pub fn run_single(
    blast_file: &Path,
    accession_db: &Path,
    lineage_db: &Path,
    config: AssignConfig,
) -> Result<Assignment> {
    let (accessions, lineages) = open_stores(accession_db, lineage_db)?;
    let hits = blast::read_hits(blast_file)?;
    log::info!(
        "Assigning one taxonomy from {} hits in {}",
        hits.len(),
        blast_file.display()
    );

    let assigner = Assigner::new(config, &accessions, &lineages);
    Ok(assigner.assign_single(&hits))
}

/// One assignment per BLAST file in `input_dir`, keyed by file stem.
pub fn run_multiple(
    input_dir: &Path,
    output: &Path,
    accession_db: &Path,
    lineage_db: &Path,
    config: AssignConfig,
    cancel: &CancelFlag,
) -> Result<RunSummary> {
    let (accessions, lineages) = open_stores(accession_db, lineage_db)?;

    let mut files: Vec<PathBuf> = std::fs::read_dir(input_dir)?
        .filter_map(|entry| {
            let path = entry.ok()?.path();
            path.is_file().then_some(path)
        })
        .collect();
    files.sort();
    log::info!("Assigning one taxonomy per file for {} files", files.len());

    let assigner = Assigner::new(config, &accessions, &lineages);
    let mut out = BufWriter::new(File::create(output)?);
    assigner.assign_multiple(&files, &mut out, cancel)
}
