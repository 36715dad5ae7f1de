//src/config.rs

use std::str::FromStr;
use std::time::Duration;

/// Selectable consensus method. A closed set dispatched once per query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusMethod {
    /// Trust the first (strongest) hit verbatim.
    BestHit,
    /// Deepest taxon common to all resolved lineages.
    Lca,
    /// Deepest taxon still held by at least the minimum support.
    Majority,
}

impl FromStr for ConsensusMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "best-hit" | "besthit" | "best" => Ok(ConsensusMethod::BestHit),
            "lca" => Ok(ConsensusMethod::Lca),
            "majority" => Ok(ConsensusMethod::Majority),
            _ => Err(format!("unknown consensus method: {}", s)),
        }
    }
}

/// Minimum agreement needed for a majority call: a fraction of the
/// considered lineages, or an absolute lineage count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MinSupport {
    Fraction(f64),
    Count(u32),
}

impl MinSupport {
    /// Votes required out of `considered` lineages. Never below 1. The
    /// small slack absorbs float artifacts at exact fractions like 2/3.
    pub fn threshold(&self, considered: usize) -> usize {
        match *self {
            MinSupport::Fraction(f) => {
                (((f * considered as f64) - 1e-9).ceil() as usize).max(1)
            }
            MinSupport::Count(c) => (c as usize).max(1),
        }
    }
}

impl FromStr for MinSupport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: f64 = s
            .parse()
            .map_err(|_| format!("invalid minimum support: {}", s))?;
        if value <= 0.0 {
            return Err(format!("minimum support must be positive, got {}", s));
        }
        if value <= 1.0 {
            Ok(MinSupport::Fraction(value))
        } else {
            Ok(MinSupport::Count(value.round() as u32))
        }
    }
}

/// Per-run assignment configuration. One instance covers every query of a
/// run; workers share it read-only.
#[derive(Debug, Clone)]
pub struct AssignConfig {
    /// Hits with a larger e-value are discarded.
    pub evalue_max: f64,
    /// Hits with a shorter alignment are discarded.
    pub alen_min: u32,
    /// Hits with lower percent identity are discarded.
    pub identity_min: f64,
    /// At most this many surviving hits are considered per query (0 = no cap).
    pub hit_cap: usize,
    pub min_support: MinSupport,
    pub method: ConsensusMethod,
    /// Stop examining hits once the consensus is provably stable.
    pub lazy: bool,
    /// Worker threads for batch modes (0 = all available).
    pub threads: usize,
    /// Write batch results in input order; when false, each result is
    /// written as its query finishes.
    pub ordered: bool,
    /// Per-query ceiling on time spent in store lookups.
    pub lookup_timeout: Option<Duration>,
}

impl Default for AssignConfig {
    fn default() -> Self {
        AssignConfig {
            evalue_max: 1e-5,
            alen_min: 100,
            identity_min: 80.0,
            hit_cap: 100,
            min_support: MinSupport::Count(3),
            method: ConsensusMethod::Lca,
            lazy: false,
            threads: 0,
            ordered: true,
            lookup_timeout: None,
        }
    }
}
