//src/types.rs

use std::sync::Arc;

/// Sentinel taxon id for unresolved/unknown assignments.
pub const UNKNOWN_TAXID: u32 = 0;

/// Rank string used for unresolved assignments.
pub const UNKNOWN_RANK: &str = "no rank";

/// Scientific name used for unresolved assignments.
pub const UNKNOWN_NAME: &str = "Unknown";

/// One similarity-search result linking a query sequence to a reference
/// sequence, as parsed from BLAST tabular output.
#[derive(Debug, Clone)]
pub struct Hit {
    pub query_id: String,
    pub subject_id: String,
    /// Percent identity over the alignment (0-100).
    pub identity: f64,
    /// Alignment length in residues.
    pub alen: u32,
    pub evalue: f64,
    pub bitscore: f64,
    /// Position in the search tool's ranking, 0 = strongest.
    pub rank: usize,
}

/// One node of a taxonomic lineage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxNode {
    pub taxid: u32,
    pub rank: String,
    pub name: String,
}

/// Ordered ancestor chain from the taxonomy root down to a taxon,
/// inclusive of both ends. Immutable once fetched from the store.
pub type Lineage = Vec<TaxNode>;

/// A lineage paired with the rank of its strongest supporting hit,
/// used for tie-breaking between equally supported taxa.
#[derive(Debug, Clone)]
pub struct ResolvedLineage {
    pub lineage: Arc<Lineage>,
    pub hit_rank: usize,
    pub evalue: f64,
}

/// Why a query ended up with (or without) a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentStatus {
    /// A consensus taxon was found.
    Assigned,
    /// No hit survived the quality filter.
    NoHits,
    /// Hits survived but none resolved to a lineage.
    NoLineage,
    /// Lineages resolved but no taxon met the support threshold.
    LowSupport,
    /// The query exceeded its store-lookup time budget.
    Timeout,
}

/// The engine's output for one query.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub taxid: u32,
    pub rank: String,
    pub name: String,
    /// Hits whose lineage supported the assigned taxon.
    pub supported: u32,
    /// Hits that passed filtering and resolved to a lineage.
    pub considered: u32,
    pub status: AssignmentStatus,
}

impl Assignment {
    /// The unresolved sentinel: taxid 0 at the no-rank level with 0/0 support.
    pub fn unresolved(status: AssignmentStatus) -> Self {
        Assignment {
            taxid: UNKNOWN_TAXID,
            rank: UNKNOWN_RANK.to_string(),
            name: UNKNOWN_NAME.to_string(),
            supported: 0,
            considered: 0,
            status,
        }
    }

    pub fn is_assigned(&self) -> bool {
        self.status == AssignmentStatus::Assigned
    }

    /// Tab-delimited output cells shared by all invocation modes:
    /// `taxid<TAB>rank<TAB>name<TAB>supported/considered`.
    pub fn to_tsv(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}/{}",
            self.taxid, self.rank, self.name, self.supported, self.considered
        )
    }
}

/// All hits for one query, in search-tool order.
#[derive(Debug, Clone)]
pub struct QueryHits {
    pub query_id: String,
    pub hits: Vec<Hit>,
}

/// One output row of a batch run.
#[derive(Debug, Clone)]
pub struct AssignmentRecord {
    pub query_id: String,
    pub assignment: Assignment,
}

impl AssignmentRecord {
    pub fn to_tsv(&self) -> String {
        format!("{}\t{}", self.query_id, self.assignment.to_tsv())
    }
}
