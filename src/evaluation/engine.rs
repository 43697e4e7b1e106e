//! Metric computation over recommendation lists.
use std::collections::{BTreeMap, HashMap, HashSet};

use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

use super::metrics::{Metric, MetricKind, MetricSpec};
use crate::data::Interactions;
use crate::recommendations::Recommendations;
use crate::{EvaluationError, ItemId, UserId};

/// One metric's per-user values and their mean.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetricValue {
    /// Value for every contributing user. Empty for catalog-wide metrics.
    pub per_user: BTreeMap<UserId, f64>,
    /// `None` when no user contributed.
    pub aggregate: Option<f64>,
}

/// Metric values keyed by [`MetricSpec::name`].
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetricResult {
    values: BTreeMap<String, MetricValue>,
}

impl MetricResult {
    /// Look up a metric by its `"<metric>@<k>"` name, with the `"[>=t]"`
    /// suffix for non-zero thresholds.
    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.values.get(name)
    }

    /// Aggregate value of a metric, if it was computed and had data.
    pub fn aggregate(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|value| value.aggregate)
    }

    /// Iterate over metrics in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetricValue)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Number of computed metrics.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no metric was computed.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn mean(values: &BTreeMap<UserId, f64>) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.values().sum::<f64>() / values.len() as f64)
    }
}

/// Computes metrics against a fixed train log.
///
/// The train log defines the item catalog for coverage and the item
/// popularity for novelty and popularity bias. Popularity is the share of
/// train users who interacted with an item; items missing from the train
/// log get `1 / (num_train_users + 1)`.
#[derive(Clone, Debug)]
pub struct MetricEngine {
    catalog: HashSet<ItemId>,
    popularity: HashMap<ItemId, f64>,
    num_train_users: usize,
}

impl MetricEngine {
    /// Build an engine from the train log.
    pub fn new(train: &Interactions) -> Self {
        let num_train_users = train.num_users();
        let denominator = num_train_users.max(1) as f64;

        let popularity: HashMap<ItemId, f64> = train
            .item_user_counts()
            .into_iter()
            .map(|(item_id, count)| (item_id, count as f64 / denominator))
            .collect();

        MetricEngine {
            catalog: popularity.keys().cloned().collect(),
            popularity,
            num_train_users,
        }
    }

    /// Number of distinct items in the train log.
    pub fn catalog_size(&self) -> usize {
        self.catalog.len()
    }

    /// Train popularity of an item.
    pub fn popularity(&self, item_id: ItemId) -> f64 {
        self.popularity
            .get(&item_id)
            .cloned()
            .unwrap_or_else(|| 1.0 / (self.num_train_users + 1) as f64)
    }

    /// Compute every metric in `specs`.
    ///
    /// The evaluated users are the distinct users of `ground_truth`. Users
    /// without a recommendation list score zero on relevance metrics; users
    /// whose relevant set is empty are left out of them.
    pub fn compute(
        &self,
        recommendations: &Recommendations,
        ground_truth: &Interactions,
        specs: &[MetricSpec],
    ) -> Result<MetricResult, EvaluationError> {
        if let Some(spec) = specs.iter().find(|spec| spec.k == 0) {
            return Err(EvaluationError::InvalidArgument(format!(
                "metric {} needs a positive cut-off",
                spec.metric
            )));
        }
        for (idx, spec) in specs.iter().enumerate() {
            if specs[..idx].iter().any(|other| other.name() == spec.name()) {
                return Err(EvaluationError::InvalidArgument(format!(
                    "metric {} is requested twice",
                    spec.name()
                )));
            }
        }

        let graded = graded_ground_truth(ground_truth);
        let users: Vec<UserId> = graded.keys().cloned().collect();

        let mut values = BTreeMap::new();

        for spec in specs {
            let value = match spec.metric.kind() {
                MetricKind::Relevance => {
                    let relevant = relevant_sets(&graded, spec.relevance_threshold);
                    self.relevance(spec, &users, &relevant, recommendations)
                }
                MetricKind::Completeness => self.completeness(spec, &users, recommendations),
                MetricKind::Popularity => self.popularity_metric(spec, &users, recommendations),
                MetricKind::Catalog => self.coverage(spec, recommendations),
            };

            debug!(
                metric = %spec.name(),
                num_users = value.per_user.len(),
                aggregate = ?value.aggregate,
                "Computed metric"
            );

            values.insert(spec.name(), value);
        }

        Ok(MetricResult { values })
    }

    fn relevance(
        &self,
        spec: &MetricSpec,
        users: &[UserId],
        relevant: &HashMap<UserId, HashSet<ItemId>>,
        recommendations: &Recommendations,
    ) -> MetricValue {
        let per_user: BTreeMap<UserId, f64> = users
            .par_iter()
            .filter_map(|&user_id| {
                let relevant = relevant.get(&user_id).filter(|items| !items.is_empty())?;

                let value = match recommendations.get(user_id) {
                    Some(list) => {
                        let recommended: Vec<ItemId> = list.item_ids().collect();
                        spec.metric.relevance_value(&recommended, relevant, spec.k)
                    }
                    None => 0.0,
                };

                Some((user_id, value))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .collect();

        let aggregate = mean(&per_user);

        MetricValue { per_user, aggregate }
    }

    fn completeness(
        &self,
        spec: &MetricSpec,
        users: &[UserId],
        recommendations: &Recommendations,
    ) -> MetricValue {
        let per_user: BTreeMap<UserId, f64> = users
            .iter()
            .map(|&user_id| {
                let filled = recommendations
                    .get(user_id)
                    .map_or(0, |list| list.len().min(spec.k));
                (user_id, filled as f64 / spec.k as f64)
            })
            .collect();

        let aggregate = mean(&per_user);

        MetricValue { per_user, aggregate }
    }

    fn popularity_metric(
        &self,
        spec: &MetricSpec,
        users: &[UserId],
        recommendations: &Recommendations,
    ) -> MetricValue {
        let per_user: BTreeMap<UserId, f64> = users
            .iter()
            .filter_map(|&user_id| {
                let list = recommendations.get(user_id)?;
                let popularities: Vec<f64> = list
                    .item_ids()
                    .take(spec.k)
                    .map(|item_id| self.popularity(item_id))
                    .collect();

                if popularities.is_empty() {
                    return None;
                }

                let total: f64 = match spec.metric {
                    Metric::Novelty => popularities.iter().map(|pop| -pop.log2()).sum(),
                    _ => popularities.iter().sum(),
                };

                Some((user_id, total / popularities.len() as f64))
            })
            .collect();

        let aggregate = mean(&per_user);

        MetricValue { per_user, aggregate }
    }

    // Counts every recommended user, including those absent from the ground
    // truth.
    fn coverage(&self, spec: &MetricSpec, recommendations: &Recommendations) -> MetricValue {
        if self.catalog.is_empty() {
            return MetricValue::default();
        }

        let recommended: HashSet<ItemId> = recommendations
            .iter()
            .flat_map(|list| list.item_ids().take(spec.k))
            .filter(|item_id| self.catalog.contains(item_id))
            .collect();

        MetricValue {
            per_user: BTreeMap::new(),
            aggregate: Some(recommended.len() as f64 / self.catalog.len() as f64),
        }
    }
}

/// Largest value observed for each (user, item) in the ground truth.
fn graded_ground_truth(ground_truth: &Interactions) -> BTreeMap<UserId, HashMap<ItemId, f32>> {
    let mut graded: BTreeMap<UserId, HashMap<ItemId, f32>> = BTreeMap::new();

    for interaction in ground_truth.data() {
        let value = graded
            .entry(interaction.user_id())
            .or_insert_with(HashMap::new)
            .entry(interaction.item_id())
            .or_insert(interaction.value());

        if interaction.value() > *value {
            *value = interaction.value();
        }
    }

    graded
}

fn relevant_sets(
    graded: &BTreeMap<UserId, HashMap<ItemId, f32>>,
    threshold: f32,
) -> HashMap<UserId, HashSet<ItemId>> {
    graded
        .iter()
        .map(|(&user_id, items)| {
            let relevant = items
                .iter()
                .filter(|&(_, &value)| value >= threshold)
                .map(|(&item_id, _)| item_id)
                .collect();
            (user_id, relevant)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Interaction;
    use crate::recommendations::RecommendationList;

    fn list(user_id: UserId, k: usize, items: &[ItemId]) -> RecommendationList {
        let scores = items
            .iter()
            .enumerate()
            .map(|(idx, &item_id)| (item_id, (items.len() - idx) as f32))
            .collect();
        RecommendationList::from_scores(user_id, k, scores).unwrap()
    }

    fn train() -> Interactions {
        Interactions::new(vec![
            Interaction::new(1, 1, 1),
            Interaction::new(1, 2, 2),
            Interaction::new(2, 1, 1),
            Interaction::new(2, 3, 2),
        ])
        .unwrap()
    }

    fn specs(k: usize) -> Vec<MetricSpec> {
        Metric::ALL.iter().map(|&metric| MetricSpec::new(metric, k)).collect()
    }

    #[test]
    fn single_user_scenario() {
        let engine = MetricEngine::new(&train());
        let test = Interactions::new(vec![Interaction::new(1, 3, 3)]).unwrap();
        let recommendations: Recommendations = vec![list(1, 2, &[3, 1])].into_iter().collect();

        let result = engine.compute(&recommendations, &test, &specs(2)).unwrap();

        assert_eq!(result.aggregate("precision@2"), Some(0.5));
        assert_eq!(result.aggregate("recall@2"), Some(1.0));
        assert_eq!(result.aggregate("ndcg@2"), Some(1.0));
        assert_eq!(result.aggregate("mrr@2"), Some(1.0));
        assert_eq!(result.aggregate("hit_rate@2"), Some(1.0));
        assert_eq!(result.aggregate("completeness@2"), Some(1.0));
        // Items 1 and 3 out of a catalog of {1, 2, 3}.
        assert_eq!(result.aggregate("coverage@2"), Some(2.0 / 3.0));
        // Item 3 is held by one of two users, item 1 by both.
        assert_eq!(result.aggregate("popularity_bias@2"), Some(0.75));
        assert_eq!(result.aggregate("novelty@2"), Some(0.5));
    }

    #[test]
    fn users_without_recommendations_score_zero() {
        let engine = MetricEngine::new(&train());
        let test = Interactions::new(vec![
            Interaction::new(1, 3, 3),
            Interaction::new(2, 2, 3),
        ])
        .unwrap();
        let recommendations: Recommendations = vec![list(1, 1, &[3])].into_iter().collect();

        let result = engine
            .compute(
                &recommendations,
                &test,
                &[
                    MetricSpec::new(Metric::Precision, 1),
                    MetricSpec::new(Metric::Completeness, 1),
                    MetricSpec::new(Metric::Novelty, 1),
                ],
            )
            .unwrap();

        let precision = result.get("precision@1").unwrap();
        assert_eq!(precision.per_user.get(&2), Some(&0.0));
        assert_eq!(precision.aggregate, Some(0.5));

        assert_eq!(result.aggregate("completeness@1"), Some(0.5));

        // Only users that received items count towards novelty.
        assert_eq!(result.get("novelty@1").unwrap().per_user.len(), 1);
    }

    #[test]
    fn users_without_relevant_items_are_excluded() {
        let engine = MetricEngine::new(&train());
        let test = Interactions::new(vec![
            Interaction::with_value(1, 3, 3, 5.0),
            Interaction::with_value(2, 2, 3, 1.0),
        ])
        .unwrap();
        let recommendations: Recommendations = vec![list(1, 1, &[3]), list(2, 1, &[2])]
            .into_iter()
            .collect();

        let spec = MetricSpec::new(Metric::Precision, 1).relevance_threshold(4.0);
        let result = engine.compute(&recommendations, &test, &[spec]).unwrap();

        let precision = result.get("precision@1[>=4]").unwrap();
        assert_eq!(precision.per_user.keys().collect::<Vec<_>>(), vec![&1]);
        assert_eq!(precision.aggregate, Some(1.0));
    }

    #[test]
    fn no_contributing_users_means_no_data() {
        let engine = MetricEngine::new(&train());
        let test = Interactions::new(vec![Interaction::with_value(1, 3, 3, 1.0)]).unwrap();
        let recommendations = Recommendations::new();

        let spec = MetricSpec::new(Metric::Ndcg, 3).relevance_threshold(2.0);
        let result = engine.compute(&recommendations, &test, &[spec]).unwrap();

        assert_eq!(result.aggregate("ndcg@3[>=2]"), None);
        assert!(result.get("ndcg@3[>=2]").unwrap().per_user.is_empty());
    }

    #[test]
    fn thresholds_of_one_metric_are_kept_apart() {
        let engine = MetricEngine::new(&train());
        let test = Interactions::new(vec![
            Interaction::with_value(1, 3, 3, 5.0),
            Interaction::with_value(1, 2, 4, 1.0),
            Interaction::with_value(2, 2, 3, 1.0),
        ])
        .unwrap();
        let recommendations: Recommendations = vec![list(1, 2, &[3, 4]), list(2, 2, &[4, 5])]
            .into_iter()
            .collect();

        let specs = [
            MetricSpec::new(Metric::Recall, 2),
            MetricSpec::new(Metric::Recall, 2).relevance_threshold(4.0),
        ];
        let result = engine.compute(&recommendations, &test, &specs).unwrap();

        assert_eq!(result.len(), 2);
        // User 1 finds one of two items, user 2 none.
        assert_eq!(result.aggregate("recall@2"), Some(0.25));
        // Only user 1's item 3 clears the threshold.
        assert_eq!(result.aggregate("recall@2[>=4]"), Some(1.0));
    }

    #[test]
    fn repeated_metric_specs_are_rejected() {
        let engine = MetricEngine::new(&train());
        let test = Interactions::new(vec![Interaction::new(1, 3, 3)]).unwrap();
        let spec = MetricSpec::new(Metric::Ndcg, 2).relevance_threshold(1.0);

        match engine.compute(&Recommendations::new(), &test, &[spec, spec]) {
            Err(EvaluationError::InvalidArgument(_)) => {}
            other => panic!("expected InvalidArgument, got {:?}", other),
        }
    }

    #[test]
    fn coverage_counts_users_outside_the_ground_truth() {
        let engine = MetricEngine::new(&train());
        let test = Interactions::new(vec![Interaction::new(1, 3, 3)]).unwrap();
        let spec = MetricSpec::new(Metric::Coverage, 1);

        let only_test_user: Recommendations = vec![list(1, 1, &[3])].into_iter().collect();
        let with_extra_user: Recommendations = vec![list(1, 1, &[3]), list(7, 1, &[2])]
            .into_iter()
            .collect();

        let narrow = engine.compute(&only_test_user, &test, &[spec]).unwrap();
        let wide = engine.compute(&with_extra_user, &test, &[spec]).unwrap();

        assert_eq!(narrow.aggregate("coverage@1"), Some(1.0 / 3.0));
        assert_eq!(wide.aggregate("coverage@1"), Some(2.0 / 3.0));
    }

    #[test]
    fn unseen_items_get_smoothed_popularity() {
        let engine = MetricEngine::new(&train());

        assert_eq!(engine.popularity(1), 1.0);
        assert_eq!(engine.popularity(42), 1.0 / 3.0);
        assert_eq!(engine.catalog_size(), 3);
    }

    #[test]
    fn zero_cut_off_is_rejected() {
        let engine = MetricEngine::new(&train());
        let test = Interactions::new(vec![Interaction::new(1, 3, 3)]).unwrap();

        let result = engine.compute(
            &Recommendations::new(),
            &test,
            &[MetricSpec::new(Metric::Recall, 0)],
        );

        match result {
            Err(EvaluationError::InvalidArgument(_)) => {}
            other => panic!("expected InvalidArgument, got {:?}", other),
        }
    }

    #[test]
    fn metric_values_stay_in_unit_range() {
        let engine = MetricEngine::new(&train());
        let test = Interactions::new(vec![
            Interaction::new(1, 3, 3),
            Interaction::new(1, 4, 4),
            Interaction::new(2, 2, 3),
        ])
        .unwrap();
        let recommendations: Recommendations = vec![list(1, 3, &[4, 2, 3]), list(2, 3, &[1, 3])]
            .into_iter()
            .collect();

        let result = engine.compute(&recommendations, &test, &specs(3)).unwrap();

        for (name, value) in result.iter() {
            if name.starts_with("novelty") {
                continue;
            }
            let aggregate = value.aggregate.unwrap();
            assert!(aggregate >= 0.0 && aggregate <= 1.0, "{} = {}", name, aggregate);
        }
    }
}
