//! Popularity baseline.
//!
//! Every item is scored by the share of train users who interacted with
//! it. Known users all receive the same ranking, minus the items they have
//! already seen when filtering is requested.
//!
//! Calling `fit` again discards the previous state and retrains from
//! scratch on the new log.
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{check_predict, ColdUserPolicy, RecommenderModel};
use crate::data::Interactions;
use crate::recommendations::RecommendationList;
use crate::{EvaluationError, ItemId, UserId};

/// Hyperparameters describing the popularity model.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Hyperparameters {
    name: String,
    cold_user_policy: ColdUserPolicy,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Hyperparameters {
            name: "popularity".to_owned(),
            cold_user_policy: ColdUserPolicy::default(),
        }
    }
}

impl Hyperparameters {
    /// Build new hyperparameters.
    pub fn new() -> Self {
        Hyperparameters::default()
    }

    /// Set the name reported in result tables.
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_owned();
        self
    }

    /// Set the behaviour for users unseen during `fit`.
    pub fn cold_user_policy(mut self, cold_user_policy: ColdUserPolicy) -> Self {
        self.cold_user_policy = cold_user_policy;
        self
    }

    /// Build the popularity model.
    pub fn build(self) -> PopularityModel {
        PopularityModel {
            hyper: self,
            state: None,
        }
    }
}

#[derive(Clone, Debug)]
struct FittedState {
    // Sorted by descending score, then ascending item id.
    ranking: Vec<(ItemId, f32)>,
    seen: HashMap<UserId, HashSet<ItemId>>,
}

/// Score items by the share of train users who interacted with them.
pub(crate) fn popularity_ranking(train: &Interactions) -> Vec<(ItemId, f32)> {
    let num_users = train.num_users().max(1) as f32;

    let mut ranking: Vec<(ItemId, f32)> = train
        .item_user_counts()
        .into_iter()
        .map(|(item_id, count)| (item_id, count as f32 / num_users))
        .collect();

    ranking.sort_by(|x, y| {
        y.1.partial_cmp(&x.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(x.0.cmp(&y.0))
    });

    ranking
}

/// Top `k` of a popularity ranking, skipping `exclude`.
pub(crate) fn top_k_excluding(
    user_id: UserId,
    k: usize,
    ranking: &[(ItemId, f32)],
    exclude: Option<&HashSet<ItemId>>,
) -> Result<RecommendationList, EvaluationError> {
    let candidates = ranking
        .iter()
        .filter(|(item_id, _)| exclude.map_or(true, |seen| !seen.contains(item_id)))
        .take(k)
        .cloned()
        .collect();

    RecommendationList::from_scores(user_id, k, candidates)
}

/// Popularity baseline model.
#[derive(Clone, Debug)]
pub struct PopularityModel {
    hyper: Hyperparameters,
    state: Option<FittedState>,
}

impl RecommenderModel for PopularityModel {
    fn name(&self) -> &str {
        &self.hyper.name
    }

    fn is_fitted(&self) -> bool {
        self.state.is_some()
    }

    fn fit(&mut self, train: &Interactions) -> Result<(), EvaluationError> {
        if train.is_empty() {
            return Err(EvaluationError::InvalidInput(
                "cannot fit on an empty log".to_owned(),
            ));
        }

        if self.state.is_some() {
            debug!(model = %self.hyper.name, "Refitting popularity model from scratch");
        }

        let ranking = popularity_ranking(train);

        debug!(
            model = %self.hyper.name,
            num_items = ranking.len(),
            "Fitted popularity model"
        );

        self.state = Some(FittedState {
            ranking,
            seen: train.user_items(),
        });

        Ok(())
    }

    fn recommend_user(
        &self,
        user_id: UserId,
        k: usize,
        filter_seen_items: bool,
    ) -> Result<RecommendationList, EvaluationError> {
        check_predict(self, k)?;
        let state = self.state.as_ref().ok_or(EvaluationError::NotFitted)?;

        let seen = state.seen.get(&user_id);

        if seen.is_none() && self.hyper.cold_user_policy == ColdUserPolicy::Empty {
            return Ok(RecommendationList::empty(user_id, k));
        }

        let exclude = if filter_seen_items { seen } else { None };

        top_k_excluding(user_id, k, &state.ranking, exclude)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Interaction;

    fn train() -> Interactions {
        Interactions::new(vec![
            Interaction::new(1, 10, 0),
            Interaction::new(1, 11, 1),
            Interaction::new(2, 10, 0),
            Interaction::new(2, 12, 1),
            Interaction::new(3, 10, 0),
            Interaction::new(3, 11, 1),
            Interaction::new(3, 11, 2),
        ])
        .unwrap()
    }

    #[test]
    fn predict_before_fit_fails() {
        let model = Hyperparameters::new().build();

        assert_eq!(
            model.predict(&[1, 2], 3, true),
            Err(EvaluationError::NotFitted)
        );
    }

    #[test]
    fn ranks_by_share_of_users() {
        let mut model = Hyperparameters::new().build();
        model.fit(&train()).unwrap();

        let list = model.recommend_user(1, 3, false).unwrap();

        assert_eq!(list.items(), &[(10, 1.0), (11, 2.0 / 3.0), (12, 1.0 / 3.0)]);
    }

    #[test]
    fn filters_seen_items() {
        let mut model = Hyperparameters::new().build();
        model.fit(&train()).unwrap();

        let list = model.recommend_user(2, 3, true).unwrap();

        assert_eq!(list.item_ids().collect::<Vec<_>>(), vec![11]);
    }

    #[test]
    fn zero_k_is_rejected() {
        let mut model = Hyperparameters::new().build();
        model.fit(&train()).unwrap();

        match model.predict(&[1], 0, true) {
            Err(EvaluationError::InvalidArgument(_)) => {}
            other => panic!("expected InvalidArgument, got {:?}", other),
        }
    }

    #[test]
    fn cold_users_get_empty_lists_by_default() {
        let mut model = Hyperparameters::new().build();
        model.fit(&train()).unwrap();

        let recommendations = model.predict(&[1, 99], 2, true).unwrap();

        assert!(recommendations.get(99).unwrap().is_empty());
        assert_eq!(recommendations.get(1).unwrap().len(), 1);
    }

    #[test]
    fn cold_users_can_fall_back_to_popularity() {
        let mut model = Hyperparameters::new()
            .cold_user_policy(ColdUserPolicy::PopularityFallback)
            .build();
        model.fit(&train()).unwrap();

        let list = model.recommend_user(99, 2, true).unwrap();

        assert_eq!(list.item_ids().collect::<Vec<_>>(), vec![10, 11]);
    }

    #[test]
    fn refitting_retrains_from_scratch() {
        let mut model = Hyperparameters::new().build();
        model.fit(&train()).unwrap();

        let other = Interactions::new(vec![Interaction::new(5, 42, 0)]).unwrap();
        model.fit(&other).unwrap();

        let list = model.recommend_user(5, 3, false).unwrap();
        assert_eq!(list.item_ids().collect::<Vec<_>>(), vec![42]);
        assert!(model.recommend_user(1, 3, false).unwrap().is_empty());
    }

    #[test]
    fn streamed_predictions_match_batch_predictions() {
        let mut model = Hyperparameters::new().build();
        model.fit(&train()).unwrap();

        let users = [3, 1, 2];
        let batch = model.predict(&users, 2, true).unwrap();

        let mut stream = model.predict_iter(&users, 2, true).unwrap();
        let first: Vec<_> = stream.by_ref().map(|list| list.unwrap()).collect();
        stream.restart();
        let second: Vec<_> = stream.map(|list| list.unwrap()).collect();

        assert_eq!(first, second);
        for list in first {
            assert_eq!(batch.get(list.user_id()), Some(&list));
        }
    }
}
