use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::genome_segment::GenomeSegment;

/// Genomic coordinates for one gene or SNP site, as returned by annotation lookup
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct BinCoords {
    pub chrom: String,
    pub start: i64,
    pub end: i64,
}

/// An ordered genomic unit (a gene or a SNP site) retained in a sample matrix
///
/// Bins are stored sorted by (chromosome order, start), and the HMM transition structure depends
/// on that adjacency.
///
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Bin {
    pub id: String,
    pub segment: GenomeSegment,
}

/// Annotation collaborator mapping gene/SNP identifiers to genomic coordinates
///
/// Bins which can't be resolved are dropped from the working set before modeling.
///
pub trait CoordinateResolver {
    fn lookup(&self, bin_id: &str) -> Option<BinCoords>;
}

/// Coordinate resolver backed by an in-memory annotation table
#[derive(Clone, Debug, Default)]
pub struct TableCoordinateResolver {
    coords: HashMap<String, BinCoords>,
}

impl TableCoordinateResolver {
    pub fn from_records<I, S>(records: I) -> Self
    where
        I: IntoIterator<Item = (S, S, i64, i64)>,
        S: Into<String>,
    {
        let mut coords = HashMap::new();
        for (id, chrom, start, end) in records {
            coords.insert(
                id.into(),
                BinCoords {
                    chrom: chrom.into(),
                    start,
                    end,
                },
            );
        }
        Self { coords }
    }
}

impl CoordinateResolver for TableCoordinateResolver {
    fn lookup(&self, bin_id: &str) -> Option<BinCoords> {
        self.coords.get(bin_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_resolver() {
        let resolver =
            TableCoordinateResolver::from_records(vec![("GENE1", "chr1", 100, 200), ("GENE2", "chr2", 50, 80)]);

        let coords = resolver.lookup("GENE2").unwrap();
        assert_eq!(coords.chrom, "chr2");
        assert_eq!(coords.start, 50);
        assert!(resolver.lookup("GENE3").is_none());
    }
}
