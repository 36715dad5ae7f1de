//src/blast.rs

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use ahash::AHashMap;
use flate2::read::MultiGzDecoder;

use crate::error::Result;
use crate::types::{Hit, QueryHits};

/// Reads standard 12-column BLAST tabular output (`-outfmt 6`):
/// ```text
/// qseqid sseqid pident length mismatch gapopen qstart qend sstart send evalue bitscore
/// ```
/// Hits are returned in file order, which is the search tool's ranking.
/// Malformed lines are skipped, never fatal. Supports `.gz` input.
pub fn read_hits<P: AsRef<Path>>(path: P) -> Result<Vec<Hit>> {
    let path = path.as_ref();
    let file = File::open(path)?;

    let is_gz = path
        .extension()
        .map(|ext| ext == "gz")
        .unwrap_or(false);
    let reader: Box<dyn BufRead> = if is_gz {
        Box::new(BufReader::new(MultiGzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    let mut hits = Vec::new();
    let mut skipped = 0u64;
    for line in reader.lines() {
        let line = line?;
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_hit_line(&line, hits.len()) {
            Some(hit) => hits.push(hit),
            None => {
                skipped += 1;
                log::debug!("skipping malformed hit line: {}", line);
            }
        }
    }
    if skipped > 0 {
        log::warn!("{}: skipped {} malformed hit lines", path.display(), skipped);
    }
    Ok(hits)
}

/// Parses one tabular hit line. `rank` is the hit's position in the file.
fn parse_hit_line(line: &str, rank: usize) -> Option<Hit> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < 12 {
        return None;
    }
    Some(Hit {
        query_id: fields[0].to_string(),
        subject_id: fields[1].to_string(),
        identity: fields[2].parse().ok()?,
        alen: fields[3].parse().ok()?,
        evalue: fields[10].parse().ok()?,
        bitscore: fields[11].parse().ok()?,
        rank,
    })
}

/// Groups a flat hit list per query, preserving first-seen query order and
/// per-query hit order. Ranks are re-based within each query.
pub fn group_by_query(hits: Vec<Hit>) -> Vec<QueryHits> {
    let mut groups: Vec<QueryHits> = Vec::new();
    let mut index: AHashMap<String, usize> = AHashMap::new();

    for mut hit in hits {
        let slot = match index.get(&hit.query_id) {
            Some(&i) => i,
            None => {
                index.insert(hit.query_id.clone(), groups.len());
                groups.push(QueryHits {
                    query_id: hit.query_id.clone(),
                    hits: Vec::new(),
                });
                groups.len() - 1
            }
        };
        hit.rank = groups[slot].hits.len();
        groups[slot].hits.push(hit);
    }
    groups
}

/// Extracts the reference accession from a BLAST subject id, without the
/// version suffix. Handles pipe-delimited NCBI ids (`gi|123|ref|NP_1.1|`),
/// UniProt ids (`sp|P12345|NAME`), and bare accessions (`NP_1.1`).
pub fn extract_accession(subject_id: &str) -> &str {
    if subject_id.contains('|') {
        let parts: Vec<&str> = subject_id.split('|').collect();
        if parts.len() >= 2 && (parts[0] == "sp" || parts[0] == "tr") {
            return parts[1];
        }
        if parts.len() >= 4 && parts[2] == "ref" {
            return parts[3].split('.').next().unwrap_or(parts[3]);
        }
        // fall back to the last non-empty field
        if let Some(last) = parts.iter().rev().find(|p| !p.is_empty()) {
            return last.split('.').next().unwrap_or(last);
        }
    }
    subject_id.split('.').next().unwrap_or(subject_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as IoWrite;

    const LINE: &str = "q1\tWP_000001.1\t98.5\t150\t2\t0\t1\t150\t1\t150\t1e-50\t250.0";

    #[test]
    fn parses_outfmt6_line() {
        let hit = parse_hit_line(LINE, 0).unwrap();
        assert_eq!(hit.query_id, "q1");
        assert_eq!(hit.subject_id, "WP_000001.1");
        assert_eq!(hit.identity, 98.5);
        assert_eq!(hit.alen, 150);
        assert_eq!(hit.evalue, 1e-50);
        assert_eq!(hit.bitscore, 250.0);
    }

    #[test]
    fn rejects_short_and_non_numeric_lines() {
        assert!(parse_hit_line("q1\ts1\t98.5", 0).is_none());
        let bad = LINE.replace("150", "abc");
        assert!(parse_hit_line(&bad, 0).is_none());
    }

    #[test]
    fn malformed_lines_do_not_abort_the_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "{}", LINE).unwrap();
        writeln!(f, "garbage line").unwrap();
        writeln!(f, "{}", LINE.replace("q1", "q2")).unwrap();
        f.flush().unwrap();

        let hits = read_hits(f.path()).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].query_id, "q1");
        assert_eq!(hits[1].query_id, "q2");
    }

    #[test]
    fn groups_preserve_order_and_rebase_ranks() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "{}", LINE).unwrap();
        writeln!(f, "{}", LINE.replace("q1", "q2")).unwrap();
        writeln!(f, "{}", LINE).unwrap();
        f.flush().unwrap();

        let groups = group_by_query(read_hits(f.path()).unwrap());
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].query_id, "q1");
        assert_eq!(groups[0].hits.len(), 2);
        assert_eq!(groups[0].hits[1].rank, 1);
        assert_eq!(groups[1].query_id, "q2");
        assert_eq!(groups[1].hits[0].rank, 0);
    }

    #[test]
    fn accession_extraction_forms() {
        assert_eq!(extract_accession("NP_414542.1"), "NP_414542");
        assert_eq!(extract_accession("NP_414542"), "NP_414542");
        assert_eq!(extract_accession("gi|16128239|ref|NP_414542.1|"), "NP_414542");
        assert_eq!(extract_accession("sp|P0A7G6|RECA_ECOLI"), "P0A7G6");
        assert_eq!(extract_accession("tr|Q9XYZ1|Q9XYZ1_HUMAN"), "Q9XYZ1");
    }
}
