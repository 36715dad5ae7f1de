use crate::config::AssignConfig;
use crate::types::Hit;

/// True when a hit's fields are inside their declared ranges. Out-of-range
/// hits are rejected one at a time; the rest of the query proceeds.
fn is_well_formed(hit: &Hit) -> bool {
    hit.evalue >= 0.0 && hit.alen > 0 && (0.0..=100.0).contains(&hit.identity)
}

/// Applies the quality thresholds and the hit cap to one query's hit list.
///
/// A hit survives iff `evalue <= evalue_max && alen >= alen_min &&
/// identity >= identity_min`. The first `hit_cap` survivors are kept in
/// search-tool order (a cap of 0 keeps all). An empty result is a normal
/// outcome, not an error.
pub fn filter_hits(hits: &[Hit], config: &AssignConfig) -> Vec<Hit> {
    let mut kept = Vec::new();
    for hit in hits {
        if !is_well_formed(hit) {
            log::debug!(
                "rejecting malformed hit {} for query {}",
                hit.subject_id,
                hit.query_id
            );
            continue;
        }
        if hit.evalue <= config.evalue_max
            && hit.alen >= config.alen_min
            && hit.identity >= config.identity_min
        {
            kept.push(hit.clone());
            if config.hit_cap > 0 && kept.len() >= config.hit_cap {
                break;
            }
        }
    }
    kept
}
