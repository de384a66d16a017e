//! Distribution of residual set sizes over a chain's key images.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResidualStats {
    /// residual size -> number of key images.
    pub histogram: BTreeMap<usize, u64>,
    /// Images with a computed residual set.
    pub total: u64,
    pub fully_deanonymized: u64,
    pub anomalies: u64,
    /// Size two or more.
    pub ambiguous: u64,
    /// Images never compared across chains.
    pub not_narrowed: u64,
}

/// Summarize `fork_indices` lengths; `None` marks an image with no cross-chain result yet.
pub fn residual_stats<I>(lengths: I) -> ResidualStats
where
    I: IntoIterator<Item = Option<usize>>,
{
    let mut stats = ResidualStats::default();
    for len in lengths {
        let Some(len) = len else {
            stats.not_narrowed += 1;
            continue;
        };
        *stats.histogram.entry(len).or_default() += 1;
        stats.total += 1;
        match len {
            0 => stats.anomalies += 1,
            1 => stats.fully_deanonymized += 1,
            _ => stats.ambiguous += 1,
        }
    }
    stats
}

impl ResidualStats {
    pub fn max_len(&self) -> Option<usize> {
        self.histogram.keys().next_back().copied()
    }

    /// Dense counts for sizes `0..=max_len`.
    pub fn bincount(&self) -> Vec<u64> {
        let Some(max) = self.max_len() else {
            return vec![];
        };
        (0..=max)
            .map(|n| self.histogram.get(&n).copied().unwrap_or(0))
            .collect()
    }

    /// Share of computed images narrowed to exactly one candidate.
    pub fn deanonymized_pct(&self) -> Option<f64> {
        (self.total > 0).then(|| self.fully_deanonymized as f64 * 100.0 / self.total as f64)
    }
}
