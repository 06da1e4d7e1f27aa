//! Pairwise win-rate matrix

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{Judgment, JudgmentTarget, Output, PairWinner, Verdict};

/// Win/loss/tie tallies for one ordered model pair
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct WinRateCell {
    pub wins: u32,
    pub losses: u32,
    pub ties: u32,
}

impl WinRateCell {
    pub fn total(&self) -> u32 {
        self.wins + self.losses + self.ties
    }

    /// `(wins + 0.5 * ties) / total`
    pub fn rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        (self.wins as f64 + 0.5 * self.ties as f64) / total as f64
    }
}

/// Win rates for every ordered (model A, model B) pair
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WinRateMatrix {
    pub cells: BTreeMap<String, WinRateCell>,
}

impl WinRateMatrix {
    fn key(model_a: &str, model_b: &str) -> String {
        format!("{model_a}->{model_b}")
    }

    pub fn cell(&self, model_a: &str, model_b: &str) -> WinRateCell {
        self.cells.get(&Self::key(model_a, model_b)).copied().unwrap_or_default()
    }

    fn record(&mut self, model_a: &str, model_b: &str, winner: PairWinner) {
        let forward = self.cells.entry(Self::key(model_a, model_b)).or_default();
        match winner {
            PairWinner::A => forward.wins += 1,
            PairWinner::B => forward.losses += 1,
            PairWinner::Tie => forward.ties += 1,
        }
        let backward = self.cells.entry(Self::key(model_b, model_a)).or_default();
        match winner {
            PairWinner::A => backward.losses += 1,
            PairWinner::B => backward.wins += 1,
            PairWinner::Tie => backward.ties += 1,
        }
    }
}

/// Build the matrix from valid pairwise judgments
///
/// Outputs map judgment targets back to model configs; judgments whose
/// outputs are unknown or whose verdicts are INVALID are skipped.
pub fn win_rate_matrix(outputs: &[Output], judgments: &[Judgment]) -> WinRateMatrix {
    let model_of: BTreeMap<&str, &str> = outputs
        .iter()
        .map(|o| (o.id.as_str(), o.model_config_id.as_str()))
        .collect();

    let mut matrix = WinRateMatrix::default();
    for judgment in judgments {
        let JudgmentTarget::Pairwise { output_a, output_b } = &judgment.target else {
            continue;
        };
        let Verdict::Pairwise { winner, .. } = &judgment.verdict else {
            continue;
        };
        let (Some(model_a), Some(model_b)) = (model_of.get(output_a.as_str()), model_of.get(output_b.as_str()))
        else {
            continue;
        };
        matrix.record(model_a, model_b, *winner);
    }
    matrix
}
