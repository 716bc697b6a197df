use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChromInfo {
    pub label: String,
}

/// Interned chromosome names with stable indices
///
/// Bin coordinates refer to chromosomes through the indices assigned here, so every structure
/// derived from one matrix shares a single labeling scheme.
///
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ChromList {
    pub data: Vec<ChromInfo>,
    pub label_to_index: HashMap<String, usize>,
}

impl ChromList {
    /// Add a chromosome label if new, returning its index either way
    pub fn add_chrom(&mut self, label: &str) -> usize {
        if let Some(&chrom_index) = self.label_to_index.get(label) {
            return chrom_index;
        }
        let chrom_index = self.data.len();
        self.data.push(ChromInfo {
            label: label.to_string(),
        });
        self.label_to_index.insert(label.to_string(), chrom_index);
        chrom_index
    }

    pub fn label(&self, chrom_index: usize) -> &str {
        self.data[chrom_index].label.as_str()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Order chromosome labels so that numbered chromosomes sort numerically
///
/// "chr2" comes before "chr10", and numbered chromosomes come before non-numeric labels like
/// "chrX". Ties fall back to plain string comparison. This keeps bin ordering deterministic
/// regardless of the order bins arrive in.
///
pub fn compare_chrom_labels(a: &str, b: &str) -> Ordering {
    fn chrom_sort_key(label: &str) -> (u8, u64) {
        let stripped = label.strip_prefix("chr").unwrap_or(label);
        match stripped.parse::<u64>() {
            Ok(num) => (0, num),
            Err(_) => (1, 0),
        }
    }
    let ka = chrom_sort_key(a);
    let kb = chrom_sort_key(b);
    ka.cmp(&kb).then_with(|| a.cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_chrom() {
        let mut chrom_list = ChromList::default();
        assert_eq!(chrom_list.add_chrom("chr1"), 0);
        assert_eq!(chrom_list.add_chrom("chr2"), 1);
        assert_eq!(chrom_list.add_chrom("chr1"), 0);
        assert_eq!(chrom_list.len(), 2);
        assert_eq!(chrom_list.label(1), "chr2");
    }

    #[test]
    fn test_compare_chrom_labels() {
        assert_eq!(compare_chrom_labels("chr2", "chr10"), Ordering::Less);
        assert_eq!(compare_chrom_labels("chr10", "chrX"), Ordering::Less);
        assert_eq!(compare_chrom_labels("chrX", "chrX"), Ordering::Equal);
        assert_eq!(compare_chrom_labels("2", "10"), Ordering::Less);
    }
}
