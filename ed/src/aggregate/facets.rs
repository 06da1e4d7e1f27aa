//! Facet breakdowns - mean composite by tag, difficulty, and length bucket

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::Case;

/// Pre-configured length bucket boundaries over prompt-plus-expected
/// character count
pub fn length_bucket(chars: usize) -> &'static str {
    match chars {
        0..200 => "XS",
        200..500 => "S",
        500..1500 => "M",
        1500..5000 => "L",
        _ => "XL",
    }
}

/// Mean composites grouped along each facet dimension
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FacetBreakdown {
    pub by_tag: BTreeMap<String, f64>,
    pub by_difficulty: BTreeMap<u8, f64>,
    pub by_length_bucket: BTreeMap<String, f64>,
}

#[derive(Default)]
struct Accumulator {
    total: f64,
    count: usize,
}

impl Accumulator {
    fn push(&mut self, value: f64) {
        self.total += value;
        self.count += 1;
    }

    fn mean(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.total / self.count as f64 }
    }
}

/// Build the breakdown from (case, composite) pairs
pub fn facet_breakdown(scored_cases: &[(&Case, f64)]) -> FacetBreakdown {
    let mut by_tag: BTreeMap<String, Accumulator> = BTreeMap::new();
    let mut by_difficulty: BTreeMap<u8, Accumulator> = BTreeMap::new();
    let mut by_bucket: BTreeMap<String, Accumulator> = BTreeMap::new();

    for (case, composite) in scored_cases {
        for tag in &case.tags {
            by_tag.entry(tag.clone()).or_default().push(*composite);
        }
        by_difficulty.entry(case.difficulty).or_default().push(*composite);
        by_bucket
            .entry(length_bucket(case.length_chars()).to_string())
            .or_default()
            .push(*composite);
    }

    FacetBreakdown {
        by_tag: by_tag.into_iter().map(|(k, acc)| (k, acc.mean())).collect(),
        by_difficulty: by_difficulty.into_iter().map(|(k, acc)| (k, acc.mean())).collect(),
        by_length_bucket: by_bucket.into_iter().map(|(k, acc)| (k, acc.mean())).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;

    fn case(tags: &[&str], difficulty: u8, input_len: usize) -> Case {
        let mut input = Map::new();
        input.insert("x".to_string(), "y".repeat(input_len));
        Case::new(input)
            .with_tags(tags.iter().map(|t| t.to_string()).collect())
            .with_difficulty(difficulty)
    }

    #[test]
    fn test_length_buckets() {
        assert_eq!(length_bucket(0), "XS");
        assert_eq!(length_bucket(199), "XS");
        assert_eq!(length_bucket(200), "S");
        assert_eq!(length_bucket(499), "S");
        assert_eq!(length_bucket(1499), "M");
        assert_eq!(length_bucket(4999), "L");
        assert_eq!(length_bucket(5000), "XL");
    }

    #[test]
    fn test_breakdown_means() {
        let easy = case(&["math"], 1, 50);
        let hard = case(&["math", "long"], 5, 600);
        let scored = vec![(&easy, 8.0), (&hard, 4.0)];

        let breakdown = facet_breakdown(&scored);
        assert_eq!(breakdown.by_tag["math"], 6.0);
        assert_eq!(breakdown.by_tag["long"], 4.0);
        assert_eq!(breakdown.by_difficulty[&1], 8.0);
        assert_eq!(breakdown.by_difficulty[&5], 4.0);
        assert_eq!(breakdown.by_length_bucket["XS"], 8.0);
        assert_eq!(breakdown.by_length_bucket["M"], 4.0);
    }

    #[test]
    fn test_empty_breakdown() {
        let breakdown = facet_breakdown(&[]);
        assert!(breakdown.by_tag.is_empty());
        assert!(breakdown.by_difficulty.is_empty());
    }
}
