//! Ranking metrics and their per-user definitions.
//!
//! All cut-offs count positions from 1. `recommended` is assumed to be a
//! ranked list without duplicates, as produced by `RecommendationList`.
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{EvaluationError, ItemId};

/// The supported metrics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Hits in the top K divided by K.
    Precision,
    /// Hits in the top K divided by the number of relevant items.
    Recall,
    /// Normalized discounted cumulative gain.
    Ndcg,
    /// Mean average precision.
    Map,
    /// Reciprocal rank of the first hit.
    Mrr,
    /// Whether the top K contains any hit.
    HitRate,
    /// Share of the K requested slots that were filled.
    Completeness,
    /// Share of the train catalog recommended to anyone.
    Coverage,
    /// Mean self-information of recommended items.
    Novelty,
    /// Mean train popularity of recommended items.
    PopularityBias,
}

/// How a metric treats users.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MetricKind {
    /// Needs a non-empty relevant set; users without one are excluded,
    /// users without recommendations score zero.
    Relevance,
    /// Every ground-truth user counts; missing lists score zero.
    Completeness,
    /// Derived from train popularity, averaged over users that received items.
    Popularity,
    /// A single catalog-wide value.
    Catalog,
}

impl Metric {
    /// Every metric, in reporting order.
    pub const ALL: [Metric; 10] = [
        Metric::Precision,
        Metric::Recall,
        Metric::Ndcg,
        Metric::Map,
        Metric::Mrr,
        Metric::HitRate,
        Metric::Completeness,
        Metric::Coverage,
        Metric::Novelty,
        Metric::PopularityBias,
    ];

    /// The name used in configuration and result tables.
    pub fn name(&self) -> &'static str {
        match self {
            Metric::Precision => "precision",
            Metric::Recall => "recall",
            Metric::Ndcg => "ndcg",
            Metric::Map => "map",
            Metric::Mrr => "mrr",
            Metric::HitRate => "hit_rate",
            Metric::Completeness => "completeness",
            Metric::Coverage => "coverage",
            Metric::Novelty => "novelty",
            Metric::PopularityBias => "popularity_bias",
        }
    }

    pub(crate) fn kind(&self) -> MetricKind {
        match self {
            Metric::Precision
            | Metric::Recall
            | Metric::Ndcg
            | Metric::Map
            | Metric::Mrr
            | Metric::HitRate => MetricKind::Relevance,
            Metric::Completeness => MetricKind::Completeness,
            Metric::Novelty | Metric::PopularityBias => MetricKind::Popularity,
            Metric::Coverage => MetricKind::Catalog,
        }
    }

    /// Value for one user, for metrics of the relevance kind.
    pub(crate) fn relevance_value(
        &self,
        recommended: &[ItemId],
        relevant: &HashSet<ItemId>,
        k: usize,
    ) -> f64 {
        match self {
            Metric::Precision => precision_at_k(recommended, relevant, k),
            Metric::Recall => recall_at_k(recommended, relevant, k),
            Metric::Ndcg => ndcg_at_k(recommended, relevant, k),
            Metric::Map => average_precision_at_k(recommended, relevant, k),
            Metric::Mrr => reciprocal_rank_at_k(recommended, relevant, k),
            Metric::HitRate => hit_rate_at_k(recommended, relevant, k),
            _ => 0.0,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Metric {
    type Err = EvaluationError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let lowered = name.trim().to_lowercase();

        Metric::ALL
            .iter()
            .find(|metric| metric.name() == lowered)
            .cloned()
            .ok_or_else(|| EvaluationError::InvalidArgument(format!("unknown metric: {}", name)))
    }
}

/// A metric at a cut-off.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricSpec {
    /// The metric.
    pub metric: Metric,
    /// Cut-off.
    pub k: usize,
    /// Ground-truth rows with a value below this are not relevant.
    pub relevance_threshold: f32,
}

impl MetricSpec {
    /// A metric at cut-off `k` with a relevance threshold of zero.
    pub fn new(metric: Metric, k: usize) -> Self {
        MetricSpec {
            metric,
            k,
            relevance_threshold: 0.0,
        }
    }

    /// Only treat ground-truth rows with `value >= threshold` as relevant.
    pub fn relevance_threshold(mut self, threshold: f32) -> Self {
        self.relevance_threshold = threshold;
        self
    }

    /// `"<metric>@<k>"`, followed by `"[>=<threshold>]"` when the threshold
    /// is not zero.
    pub fn name(&self) -> String {
        if self.relevance_threshold == 0.0 {
            format!("{}@{}", self.metric, self.k)
        } else {
            format!("{}@{}[>={}]", self.metric, self.k, self.relevance_threshold)
        }
    }
}

fn hits(recommended: &[ItemId], relevant: &HashSet<ItemId>, k: usize) -> usize {
    recommended
        .iter()
        .take(k)
        .filter(|&item_id| relevant.contains(item_id))
        .count()
}

fn discount(rank: usize) -> f64 {
    ((rank + 1) as f64).log2()
}

/// Hits in the top `k`, divided by `k`.
pub fn precision_at_k(recommended: &[ItemId], relevant: &HashSet<ItemId>, k: usize) -> f64 {
    if k == 0 {
        return 0.0;
    }
    hits(recommended, relevant, k) as f64 / k as f64
}

/// Hits in the top `k`, divided by the number of relevant items.
pub fn recall_at_k(recommended: &[ItemId], relevant: &HashSet<ItemId>, k: usize) -> f64 {
    if relevant.is_empty() {
        return 0.0;
    }
    hits(recommended, relevant, k) as f64 / relevant.len() as f64
}

/// Binary-gain NDCG; the ideal ranking places all relevant items first.
pub fn ndcg_at_k(recommended: &[ItemId], relevant: &HashSet<ItemId>, k: usize) -> f64 {
    let dcg: f64 = recommended
        .iter()
        .take(k)
        .enumerate()
        .filter(|(_, item_id)| relevant.contains(*item_id))
        .map(|(idx, _)| 1.0 / discount(idx + 1))
        .sum();

    let idcg: f64 = (1..=relevant.len().min(k)).map(|rank| 1.0 / discount(rank)).sum();

    if idcg == 0.0 {
        0.0
    } else {
        dcg / idcg
    }
}

/// Average precision over the hit positions in the top `k`, divided by
/// `min(k, |relevant|)`.
pub fn average_precision_at_k(recommended: &[ItemId], relevant: &HashSet<ItemId>, k: usize) -> f64 {
    let denominator = relevant.len().min(k);
    if denominator == 0 {
        return 0.0;
    }

    let mut num_hits = 0;
    let mut precision_sum = 0.0;

    for (idx, item_id) in recommended.iter().take(k).enumerate() {
        if relevant.contains(item_id) {
            num_hits += 1;
            precision_sum += num_hits as f64 / (idx + 1) as f64;
        }
    }

    precision_sum / denominator as f64
}

/// Reciprocal rank of the first hit, zero if none in the top `k`.
pub fn reciprocal_rank_at_k(recommended: &[ItemId], relevant: &HashSet<ItemId>, k: usize) -> f64 {
    recommended
        .iter()
        .take(k)
        .position(|item_id| relevant.contains(item_id))
        .map_or(0.0, |idx| 1.0 / (idx + 1) as f64)
}

/// One if any of the top `k` is relevant.
pub fn hit_rate_at_k(recommended: &[ItemId], relevant: &HashSet<ItemId>, k: usize) -> f64 {
    if hits(recommended, relevant, k) > 0 {
        1.0
    } else {
        0.0
    }
}
