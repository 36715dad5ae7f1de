//src/taxonomy.rs

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use ahash::AHashMap;

use crate::error::Result;
use crate::types::{Lineage, TaxNode};

/// Guard against cycles in a corrupt nodes.dmp.
const MAX_LINEAGE_DEPTH: usize = 100;

/// Parsed NCBI taxonomy dump: parent, rank and scientific name per taxon.
/// Only used during the offline lineage-table build; at assignment time the
/// engine reads pre-materialized chains from the lineage store.
pub struct TaxonomyDump {
    parents: AHashMap<u32, u32>,
    ranks: AHashMap<u32, String>,
    names: AHashMap<u32, String>,
}

impl TaxonomyDump {
    /// Parses `nodes.dmp` and `names.dmp` (fields separated by `\t|\t`,
    /// lines terminated by `\t|`). Malformed lines are skipped; only
    /// "scientific name" rows of names.dmp are kept.
    pub fn from_dmp_files<P: AsRef<Path>, Q: AsRef<Path>>(nodes: P, names: Q) -> Result<Self> {
        let mut parents: AHashMap<u32, u32> = AHashMap::new();
        let mut ranks: AHashMap<u32, String> = AHashMap::new();

        let reader = BufReader::new(File::open(nodes)?);
        for line in reader.lines() {
            let line = line?;
            let fields: Vec<&str> = line.trim_end_matches("\t|").split("\t|\t").collect();
            if fields.len() < 3 {
                continue;
            }
            let taxid: u32 = fields[0].trim().parse().unwrap_or(0);
            let parent: u32 = fields[1].trim().parse().unwrap_or(0);
            if taxid != 0 {
                parents.insert(taxid, parent);
                ranks.insert(taxid, fields[2].trim().to_string());
            }
        }

        let reader = BufReader::new(File::open(names)?);
        let mut names: AHashMap<u32, String> = AHashMap::new();
        for line in reader.lines() {
            let line = line?;
            let fields: Vec<&str> = line.trim_end_matches("\t|").split("\t|\t").collect();
            if fields.len() < 4 || fields[3].trim() != "scientific name" {
                continue;
            }
            let taxid: u32 = fields[0].trim().parse().unwrap_or(0);
            if taxid != 0 {
                names.insert(taxid, fields[1].trim().to_string());
            }
        }

        log::info!(
            "Parsed taxonomy dump: {} nodes, {} scientific names",
            parents.len(),
            names.len()
        );

        Ok(TaxonomyDump {
            parents,
            ranks,
            names,
        })
    }

    pub fn node_count(&self) -> usize {
        self.parents.len()
    }

    /// Materializes the root-to-leaf ancestor chain for one taxon. `None`
    /// when the taxid is absent from nodes.dmp.
    pub fn lineage_of(&self, taxid: u32) -> Option<Lineage> {
        if !self.parents.contains_key(&taxid) {
            return None;
        }

        // Climb to the root, then reverse. The NCBI root is its own parent.
        let mut chain = Vec::new();
        let mut node = taxid;
        for _ in 0..MAX_LINEAGE_DEPTH {
            chain.push(TaxNode {
                taxid: node,
                rank: self
                    .ranks
                    .get(&node)
                    .cloned()
                    .unwrap_or_else(|| "no rank".to_string()),
                name: self
                    .names
                    .get(&node)
                    .cloned()
                    .unwrap_or_else(|| "unknown".to_string()),
            });
            match self.parents.get(&node) {
                Some(&p) if p != node && p != 0 => node = p,
                _ => break,
            }
        }
        chain.reverse();
        Some(chain)
    }

    /// Writes the flat lineage table (`taxid<TAB>serialized lineage`, one
    /// line per taxon, ascending taxid) that the lineage store is built
    /// from. Returns the number of lines written.
    pub fn write_lineage_table<P: AsRef<Path>>(&self, output: P) -> Result<u64> {
        let mut taxids: Vec<u32> = self.parents.keys().copied().collect();
        taxids.sort_unstable();

        let mut writer = BufWriter::new(File::create(output)?);
        let mut written = 0u64;
        for taxid in taxids {
            if let Some(lineage) = self.lineage_of(taxid) {
                writeln!(writer, "{}\t{}", taxid, serialize_lineage(&lineage))?;
                written += 1;
            }
        }
        writer.flush()?;

        log::info!("Wrote lineage table with {} entries", written);
        Ok(written)
    }
}

/// Serializes a lineage as `taxid|rank|name` entries joined by `;`.
pub fn serialize_lineage(lineage: &Lineage) -> String {
    lineage
        .iter()
        .map(|node| format!("{}|{}|{}", node.taxid, node.rank, node.name))
        .collect::<Vec<_>>()
        .join(";")
}

/// Inverse of [`serialize_lineage`]. `None` when any entry is malformed.
pub fn parse_lineage(s: &str) -> Option<Lineage> {
    let mut lineage = Vec::new();
    for entry in s.split(';') {
        let mut parts = entry.splitn(3, '|');
        let taxid: u32 = parts.next()?.parse().ok()?;
        let rank = parts.next()?;
        let name = parts.next()?;
        lineage.push(TaxNode {
            taxid,
            rank: rank.to_string(),
            name: name.to_string(),
        });
    }
    if lineage.is_empty() {
        None
    } else {
        Some(lineage)
    }
}
