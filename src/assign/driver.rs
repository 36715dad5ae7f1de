use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rayon::prelude::*;

use crate::assign::consensus::ConsensusState;
use crate::assign::filter::filter_hits;
use crate::assign::resolve::LineageResolver;
use crate::blast;
use crate::config::AssignConfig;
use crate::error::{BlastaxError, Result};
use crate::store::KvLookup;
use crate::types::{
    Assignment, AssignmentRecord, AssignmentStatus, Hit, QueryHits, ResolvedLineage,
};

/// Queries processed per parallel batch in ordered mode; each batch is
/// written out before the next starts, so partial progress survives a
/// mid-run failure.
const WRITE_CHUNK: usize = 256;

/// Accession miss rate above which the end-of-run summary warns.
const MISS_WARN_RATE: f64 = 0.25;

/// Cooperative stop signal for a batch run: stops dispatching new queries
/// and lets in-flight queries finish. Output already flushed stays valid.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        CancelFlag::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-run outcome counts.
#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    pub queries: u64,
    pub assigned: u64,
    pub no_hits: u64,
    pub no_lineage: u64,
    pub low_support: u64,
    pub timeouts: u64,
}

impl RunSummary {
    fn add(&mut self, assignment: &Assignment) {
        self.queries += 1;
        match assignment.status {
            AssignmentStatus::Assigned => self.assigned += 1,
            AssignmentStatus::NoHits => self.no_hits += 1,
            AssignmentStatus::NoLineage => self.no_lineage += 1,
            AssignmentStatus::LowSupport => self.low_support += 1,
            AssignmentStatus::Timeout => self.timeouts += 1,
        }
    }

    fn merge(mut self, other: RunSummary) -> RunSummary {
        self.queries += other.queries;
        self.assigned += other.assigned;
        self.no_hits += other.no_hits;
        self.no_lineage += other.no_lineage;
        self.low_support += other.low_support;
        self.timeouts += other.timeouts;
        self
    }
}

/// Orchestrates the per-query pipeline (Hit Filter → Lineage Resolver →
/// Consensus Engine) across the three invocation shapes. Queries are
/// independent; workers share only the read-only stores and the resolver
/// caches.
pub struct Assigner<'a> {
    config: AssignConfig,
    resolver: LineageResolver<'a>,
}

impl<'a> Assigner<'a> {
    pub fn new(
        config: AssignConfig,
        accessions: &'a dyn KvLookup,
        lineages: &'a dyn KvLookup,
    ) -> Self {
        Assigner {
            config,
            resolver: LineageResolver::new(accessions, lineages),
        }
    }

    pub fn config(&self) -> &AssignConfig {
        &self.config
    }

    pub fn resolver(&self) -> &LineageResolver<'a> {
        &self.resolver
    }

    /// Runs one query through the full pipeline. In lazy mode resolution
    /// and consensus are interleaved so hit lookups stop as soon as the
    /// call is provably stable.
    pub fn assign_query(&self, hits: &[Hit]) -> Assignment {
        let kept = filter_hits(hits, &self.config);
        if kept.is_empty() {
            return Assignment::unresolved(AssignmentStatus::NoHits);
        }

        let deadline = self.config.lookup_timeout.map(|t| Instant::now() + t);
        let mut state = ConsensusState::new(
            self.config.method,
            self.config.min_support,
            kept.len(),
            self.config.lazy,
        );

        for hit in &kept {
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    log::warn!(
                        "query {}: store lookups exceeded the time budget, reporting unresolved",
                        hit.query_id
                    );
                    return Assignment::unresolved(AssignmentStatus::Timeout);
                }
            }
            if let Some(lineage) = self.resolver.resolve_hit(hit) {
                state.push(ResolvedLineage {
                    lineage,
                    hit_rank: hit.rank,
                    evalue: hit.evalue,
                });
                if self.config.lazy && state.saturated() {
                    break;
                }
            }
        }
        state.finish()
    }

    /// One consensus assignment from every hit of one input (single mode).
    pub fn assign_single(&self, hits: &[Hit]) -> Assignment {
        self.assign_query(hits)
    }

    /// Per-query assignment over one file's grouped hits, written
    /// incrementally as `query-id<TAB>taxid<TAB>rank<TAB>name<TAB>s/c`
    /// lines.
    pub fn assign_sequences<W: Write + Send>(
        &self,
        queries: &[QueryHits],
        out: &mut W,
        cancel: &CancelFlag,
    ) -> Result<RunSummary> {
        let summary = self.with_pool(|| {
            if self.config.ordered {
                self.run_ordered(queries, out, cancel)
            } else {
                self.run_unordered(queries, out, cancel)
            }
        })?;
        self.log_miss_summary();
        Ok(summary)
    }

    /// Runs `op` inside a worker pool bounded by `config.threads`
    /// (0 = the process-wide default pool).
    fn with_pool<T: Send>(&self, op: impl FnOnce() -> Result<T> + Send) -> Result<T> {
        if self.config.threads == 0 {
            return op();
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.threads)
            .build()
            .map_err(|e| BlastaxError::Configuration(e.to_string()))?;
        pool.install(op)
    }

    /// One assignment per BLAST file, keyed by file stem.
    pub fn assign_multiple<W: Write + Send>(
        &self,
        files: &[PathBuf],
        out: &mut W,
        cancel: &CancelFlag,
    ) -> Result<RunSummary> {
        let summary = self.with_pool(|| self.run_files(files, out, cancel))?;
        self.log_miss_summary();
        Ok(summary)
    }

    fn run_files<W: Write>(
        &self,
        files: &[PathBuf],
        out: &mut W,
        cancel: &CancelFlag,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        for chunk in files.chunks(WRITE_CHUNK) {
            if cancel.is_cancelled() {
                log::info!("run cancelled, remaining files skipped");
                break;
            }
            let records: Vec<AssignmentRecord> = chunk
                .par_iter()
                .map(|path| {
                    let label = path
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_else(|| path.display().to_string());
                    // a single unreadable file must not end the run
                    let assignment = match blast::read_hits(path) {
                        Ok(hits) => self.assign_single(&hits),
                        Err(e) => {
                            log::error!("skipping {}: {}", path.display(), e);
                            Assignment::unresolved(AssignmentStatus::NoHits)
                        }
                    };
                    AssignmentRecord {
                        query_id: label,
                        assignment,
                    }
                })
                .collect();
            for record in &records {
                writeln!(out, "{}", record.to_tsv())?;
                summary.add(&record.assignment);
            }
            out.flush()?;
        }
        Ok(summary)
    }

    /// Parallel per-chunk assignment, results written in arrival order.
    fn run_ordered<W: Write>(
        &self,
        queries: &[QueryHits],
        out: &mut W,
        cancel: &CancelFlag,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        for chunk in queries.chunks(WRITE_CHUNK) {
            if cancel.is_cancelled() {
                log::info!("run cancelled, remaining queries skipped");
                break;
            }
            let records: Vec<AssignmentRecord> = chunk
                .par_iter()
                .map(|query| AssignmentRecord {
                    query_id: query.query_id.clone(),
                    assignment: self.assign_query(&query.hits),
                })
                .collect();
            for record in &records {
                writeln!(out, "{}", record.to_tsv())?;
                summary.add(&record.assignment);
            }
            out.flush()?;
        }
        Ok(summary)
    }

    /// Each result is written the moment its query completes. Throughput
    /// over ordering; the choice is explicit via `config.ordered`.
    fn run_unordered<W: Write + Send>(
        &self,
        queries: &[QueryHits],
        out: &mut W,
        cancel: &CancelFlag,
    ) -> Result<RunSummary> {
        let writer = Mutex::new(out);
        let failure: Mutex<Option<std::io::Error>> = Mutex::new(None);

        let summary = queries
            .par_iter()
            .map(|query| {
                if cancel.is_cancelled() {
                    return RunSummary::default();
                }
                let record = AssignmentRecord {
                    query_id: query.query_id.clone(),
                    assignment: self.assign_query(&query.hits),
                };
                let mut local = RunSummary::default();
                local.add(&record.assignment);

                let mut guard = writer.lock();
                if let Err(e) = writeln!(guard, "{}", record.to_tsv()) {
                    failure.lock().get_or_insert(e);
                }
                local
            })
            .reduce(RunSummary::default, RunSummary::merge);

        writer.lock().flush()?;
        if let Some(e) = failure.into_inner() {
            return Err(e.into());
        }
        Ok(summary)
    }

    fn log_miss_summary(&self) {
        let stats = &self.resolver.stats;
        let lookups = stats.accession_lookups.load(Ordering::Relaxed);
        let misses = stats.accession_misses.load(Ordering::Relaxed);
        let rate = stats.accession_miss_rate();
        if lookups > 0 && rate > MISS_WARN_RATE {
            log::warn!(
                "{} of {} accession lookups ({:.1}%) missed the index; \
                 the mapping store may be stale for this reference database",
                misses,
                lookups,
                rate * 100.0
            );
        }
        let lineage_misses = stats.lineage_misses.load(Ordering::Relaxed);
        if lineage_misses > 0 {
            log::warn!(
                "{} resolved taxa had no lineage entry (taxonomy store out of sync)",
                lineage_misses
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConsensusMethod, MinSupport};
    use crate::taxonomy::serialize_lineage;
    use crate::types::{TaxNode, UNKNOWN_TAXID};
    use ahash::AHashMap;
    use std::time::Duration;

    fn node(taxid: u32, rank: &str, name: &str) -> TaxNode {
        TaxNode {
            taxid,
            rank: rank.to_string(),
            name: name.to_string(),
        }
    }

    fn hit(query: &str, subject: &str, rank: usize) -> Hit {
        Hit {
            query_id: query.to_string(),
            subject_id: subject.to_string(),
            identity: 99.0,
            alen: 200,
            evalue: 1e-30,
            bitscore: 300.0,
            rank,
        }
    }

    /// Three accessions sharing kingdom/phylum/class; ACC_O2 diverges at
    /// order.
    fn stores() -> (AHashMap<String, String>, AHashMap<String, String>) {
        let shared = vec![
            node(1, "no rank", "root"),
            node(11, "kingdom", "K1"),
            node(12, "phylum", "P1"),
            node(13, "class", "C1"),
        ];
        let mut o1 = shared.clone();
        o1.push(node(14, "order", "O1"));
        let mut o2 = shared.clone();
        o2.push(node(15, "order", "O2"));

        let mut accessions = AHashMap::new();
        accessions.insert("ACC_A".to_string(), "14".to_string());
        accessions.insert("ACC_B".to_string(), "14".to_string());
        accessions.insert("ACC_O2".to_string(), "15".to_string());

        let mut lineages = AHashMap::new();
        lineages.insert("14".to_string(), serialize_lineage(&o1));
        lineages.insert("15".to_string(), serialize_lineage(&o2));
        (accessions, lineages)
    }

    fn config(method: ConsensusMethod, min_support: MinSupport) -> AssignConfig {
        AssignConfig {
            method,
            min_support,
            ..AssignConfig::default()
        }
    }

    fn three_hits(query: &str) -> Vec<Hit> {
        vec![
            hit(query, "ACC_A", 0),
            hit(query, "ACC_B", 1),
            hit(query, "ACC_O2", 2),
        ]
    }

    #[test]
    fn end_to_end_lca_stops_at_class() {
        let (accessions, lineages) = stores();
        let cfg = config(ConsensusMethod::Lca, MinSupport::Fraction(1.0));
        let assigner = Assigner::new(cfg, &accessions, &lineages);

        let a = assigner.assign_query(&three_hits("q1"));
        assert_eq!(a.taxid, 13);
        assert_eq!(a.rank, "class");
        assert_eq!(a.name, "C1");
        assert_eq!((a.supported, a.considered), (3, 3));
    }

    #[test]
    fn end_to_end_majority_descends_to_order() {
        let (accessions, lineages) = stores();
        let cfg = config(ConsensusMethod::Majority, MinSupport::Fraction(2.0 / 3.0));
        let assigner = Assigner::new(cfg, &accessions, &lineages);

        let a = assigner.assign_query(&three_hits("q1"));
        assert_eq!(a.taxid, 14);
        assert_eq!(a.rank, "order");
        assert_eq!(a.name, "O1");
        assert_eq!((a.supported, a.considered), (2, 3));
    }

    #[test]
    fn unknown_accessions_never_fail_the_query() {
        let (accessions, lineages) = stores();
        let cfg = config(ConsensusMethod::Lca, MinSupport::Fraction(1.0));
        let assigner = Assigner::new(cfg, &accessions, &lineages);

        let hits = vec![
            hit("q1", "GONE_FROM_DB", 0),
            hit("q1", "ACC_A", 1),
            hit("q1", "ACC_B", 2),
        ];
        let a = assigner.assign_query(&hits);
        assert_eq!(a.taxid, 14);
        assert_eq!((a.supported, a.considered), (2, 2));
    }

    #[test]
    fn no_surviving_hits_is_the_sentinel() {
        let (accessions, lineages) = stores();
        let cfg = config(ConsensusMethod::Lca, MinSupport::Fraction(1.0));
        let assigner = Assigner::new(cfg, &accessions, &lineages);

        assert_eq!(
            assigner.assign_query(&[]).status,
            AssignmentStatus::NoHits
        );

        let mut weak = hit("q1", "ACC_A", 0);
        weak.evalue = 1.0;
        let a = assigner.assign_query(&[weak]);
        assert_eq!(a.taxid, UNKNOWN_TAXID);
        assert_eq!(a.status, AssignmentStatus::NoHits);
    }

    #[test]
    fn nothing_resolving_is_the_sentinel() {
        let (accessions, lineages) = stores();
        let cfg = config(ConsensusMethod::Lca, MinSupport::Fraction(1.0));
        let assigner = Assigner::new(cfg, &accessions, &lineages);

        let a = assigner.assign_query(&[hit("q1", "NOPE1", 0), hit("q1", "NOPE2", 1)]);
        assert_eq!(a.taxid, UNKNOWN_TAXID);
        assert_eq!(a.status, AssignmentStatus::NoLineage);
        assert_eq!((a.supported, a.considered), (0, 0));
    }

    #[test]
    fn expired_budget_reports_timeout() {
        let (accessions, lineages) = stores();
        let mut cfg = config(ConsensusMethod::Lca, MinSupport::Fraction(1.0));
        cfg.lookup_timeout = Some(Duration::ZERO);
        let assigner = Assigner::new(cfg, &accessions, &lineages);

        let a = assigner.assign_query(&three_hits("q1"));
        assert_eq!(a.status, AssignmentStatus::Timeout);
        assert_eq!(a.taxid, UNKNOWN_TAXID);
    }

    #[test]
    fn batch_writes_one_line_per_query_in_order() {
        let (accessions, lineages) = stores();
        let cfg = config(ConsensusMethod::Lca, MinSupport::Fraction(1.0));
        let assigner = Assigner::new(cfg, &accessions, &lineages);

        let queries: Vec<QueryHits> = (0..50)
            .map(|i| QueryHits {
                query_id: format!("q{:03}", i),
                hits: three_hits(&format!("q{:03}", i)),
            })
            .collect();

        let mut out = Vec::new();
        let summary = assigner
            .assign_sequences(&queries, &mut out, &CancelFlag::new())
            .unwrap();

        assert_eq!(summary.queries, 50);
        assert_eq!(summary.assigned, 50);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 50);
        for (i, line) in lines.iter().enumerate() {
            assert!(line.starts_with(&format!("q{:03}\t", i)));
            assert!(line.ends_with("\t13\tclass\tC1\t3/3"));
        }
    }

    #[test]
    fn unordered_mode_writes_every_query() {
        let (accessions, lineages) = stores();
        let mut cfg = config(ConsensusMethod::Lca, MinSupport::Fraction(1.0));
        cfg.ordered = false;
        let assigner = Assigner::new(cfg, &accessions, &lineages);

        let queries: Vec<QueryHits> = (0..50)
            .map(|i| QueryHits {
                query_id: format!("q{:03}", i),
                hits: three_hits(&format!("q{:03}", i)),
            })
            .collect();

        let mut out = Vec::new();
        let summary = assigner
            .assign_sequences(&queries, &mut out, &CancelFlag::new())
            .unwrap();
        assert_eq!(summary.assigned, 50);

        let text = String::from_utf8(out).unwrap();
        let mut seen: Vec<&str> = text
            .lines()
            .map(|l| l.split('\t').next().unwrap())
            .collect();
        seen.sort_unstable();
        let expected: Vec<String> = (0..50).map(|i| format!("q{:03}", i)).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn cancelled_run_dispatches_nothing() {
        let (accessions, lineages) = stores();
        let cfg = config(ConsensusMethod::Lca, MinSupport::Fraction(1.0));
        let assigner = Assigner::new(cfg, &accessions, &lineages);

        let queries = vec![QueryHits {
            query_id: "q1".to_string(),
            hits: three_hits("q1"),
        }];
        let cancel = CancelFlag::new();
        cancel.cancel();

        let mut out = Vec::new();
        let summary = assigner
            .assign_sequences(&queries, &mut out, &cancel)
            .unwrap();
        assert_eq!(summary.queries, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn per_query_outcomes_are_independent() {
        let (accessions, lineages) = stores();
        let cfg = config(ConsensusMethod::Lca, MinSupport::Fraction(1.0));
        let assigner = Assigner::new(cfg, &accessions, &lineages);

        let queries = vec![
            QueryHits {
                query_id: "good".to_string(),
                hits: three_hits("good"),
            },
            QueryHits {
                query_id: "empty".to_string(),
                hits: Vec::new(),
            },
            QueryHits {
                query_id: "also_good".to_string(),
                hits: three_hits("also_good"),
            },
        ];

        let mut out = Vec::new();
        let summary = assigner
            .assign_sequences(&queries, &mut out, &CancelFlag::new())
            .unwrap();

        assert_eq!(summary.queries, 3);
        assert_eq!(summary.assigned, 2);
        assert_eq!(summary.no_hits, 1);

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 3);
        let unresolved = text
            .lines()
            .find(|l| l.starts_with("empty\t"))
            .expect("unresolved query still written");
        assert!(unresolved.contains("\t0\tno rank\tUnknown\t0/0"));
    }

    #[test]
    fn lazy_mode_matches_eager_mode_here() {
        let (accessions, lineages) = stores();
        let eager = Assigner::new(
            config(ConsensusMethod::Lca, MinSupport::Fraction(1.0)),
            &accessions,
            &lineages,
        );
        let mut lazy_cfg = config(ConsensusMethod::Lca, MinSupport::Fraction(1.0));
        lazy_cfg.lazy = true;
        let lazy = Assigner::new(lazy_cfg, &accessions, &lineages);

        // three lineages cannot reach the stabilization window, so the
        // lazy run must examine all of them
        let a = eager.assign_query(&three_hits("q1"));
        let b = lazy.assign_query(&three_hits("q1"));
        assert_eq!(a.taxid, b.taxid);
        assert_eq!(a.supported, b.supported);
        assert_eq!(a.considered, b.considered);
    }
}
