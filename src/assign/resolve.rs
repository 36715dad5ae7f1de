use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::blast::extract_accession;
use crate::store::KvLookup;
use crate::taxonomy::parse_lineage;
use crate::types::{Hit, Lineage, ResolvedLineage};

/// Run-wide lookup counters, updated concurrently by query workers.
#[derive(Default)]
pub struct ResolverStats {
    pub accession_lookups: AtomicU64,
    pub accession_misses: AtomicU64,
    pub lineage_lookups: AtomicU64,
    pub lineage_misses: AtomicU64,
}

impl ResolverStats {
    /// Fraction of accession lookups that found no taxon.
    pub fn accession_miss_rate(&self) -> f64 {
        let lookups = self.accession_lookups.load(Ordering::Relaxed);
        if lookups == 0 {
            return 0.0;
        }
        self.accession_misses.load(Ordering::Relaxed) as f64 / lookups as f64
    }
}

/// The query exceeded its store-lookup time budget.
#[derive(Debug)]
pub struct QueryTimeout;

/// Maps hits to lineages through the accession index and the lineage
/// store. Lookups are memoized for the duration of a run; the caches are
/// shared read-mostly across all query workers.
pub struct LineageResolver<'a> {
    accessions: &'a dyn KvLookup,
    lineages: &'a dyn KvLookup,
    acc_cache: RwLock<AHashMap<String, Option<u32>>>,
    lineage_cache: RwLock<AHashMap<u32, Option<Arc<Lineage>>>>,
    pub stats: ResolverStats,
}

impl<'a> LineageResolver<'a> {
    pub fn new(accessions: &'a dyn KvLookup, lineages: &'a dyn KvLookup) -> Self {
        LineageResolver {
            accessions,
            lineages,
            acc_cache: RwLock::new(AHashMap::new()),
            lineage_cache: RwLock::new(AHashMap::new()),
            stats: ResolverStats::default(),
        }
    }

    /// Resolves one hit to its lineage. `None` when the accession is not in
    /// the index (expected: reference database churn) or when its taxon has
    /// no lineage entry (data-integrity fault, logged once per taxon).
    pub fn resolve_hit(&self, hit: &Hit) -> Option<Arc<Lineage>> {
        let taxid = self.taxid_for(extract_accession(&hit.subject_id))?;
        self.lineage_for(taxid)
    }

    /// Resolves a filtered hit list in order, omitting hits that fail.
    /// The deadline is polled between store lookups.
    pub fn resolve_hits(
        &self,
        hits: &[Hit],
        deadline: Option<Instant>,
    ) -> Result<Vec<ResolvedLineage>, QueryTimeout> {
        let mut resolved = Vec::with_capacity(hits.len());
        for hit in hits {
            if let Some(d) = deadline {
                if Instant::now() > d {
                    return Err(QueryTimeout);
                }
            }
            if let Some(lineage) = self.resolve_hit(hit) {
                resolved.push(ResolvedLineage {
                    lineage,
                    hit_rank: hit.rank,
                    evalue: hit.evalue,
                });
            }
        }
        Ok(resolved)
    }

    fn taxid_for(&self, accession: &str) -> Option<u32> {
        if let Some(cached) = self.acc_cache.read().get(accession) {
            return *cached;
        }

        self.stats.accession_lookups.fetch_add(1, Ordering::Relaxed);
        let found = self
            .accessions
            .get(accession)
            .and_then(|v| v.trim().parse::<u32>().ok());
        if found.is_none() {
            self.stats.accession_misses.fetch_add(1, Ordering::Relaxed);
        }

        self.acc_cache
            .write()
            .insert(accession.to_string(), found);
        found
    }

    fn lineage_for(&self, taxid: u32) -> Option<Arc<Lineage>> {
        if let Some(cached) = self.lineage_cache.read().get(&taxid) {
            return cached.clone();
        }

        self.stats.lineage_lookups.fetch_add(1, Ordering::Relaxed);
        let found = self
            .lineages
            .get(&taxid.to_string())
            .and_then(|v| parse_lineage(&v))
            .map(Arc::new);
        if found.is_none() {
            self.stats.lineage_misses.fetch_add(1, Ordering::Relaxed);
            log::warn!("taxid {} resolved from the index has no lineage entry", taxid);
        }

        self.lineage_cache.write().insert(taxid, found.clone());
        found
    }
}
