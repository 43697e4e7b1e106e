//! Ranked recommendation lists.
use std::cmp::Ordering;
use std::collections::btree_map;
use std::collections::{BTreeMap, HashMap};
use std::iter::FromIterator;

use serde::{Deserialize, Serialize};

use crate::models::RecommenderModel;
use crate::{EvaluationError, ItemId, UserId};

// Higher scores first, ties by ascending item id.
fn cmp_scored(x: &(ItemId, f32), y: &(ItemId, f32)) -> Ordering {
    y.1.partial_cmp(&x.1)
        .unwrap_or(Ordering::Equal)
        .then(x.0.cmp(&y.0))
}

/// The top-`k` items recommended to a single user.
///
/// Items are sorted by score, highest first; equal scores are ordered by
/// ascending item id so that the same scores always yield the same list.
/// Deserialized lists go through [`RecommendationList::from_scores`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ScoredItems")]
pub struct RecommendationList {
    user_id: UserId,
    k: usize,
    items: Vec<(ItemId, f32)>,
}

#[derive(Deserialize)]
struct ScoredItems {
    user_id: UserId,
    k: usize,
    items: Vec<(ItemId, f32)>,
}

impl TryFrom<ScoredItems> for RecommendationList {
    type Error = EvaluationError;

    fn try_from(raw: ScoredItems) -> Result<Self, Self::Error> {
        RecommendationList::from_scores(raw.user_id, raw.k, raw.items)
    }
}

impl RecommendationList {
    /// Select the top `k` of the scored candidates.
    ///
    /// Duplicate candidates keep their highest score. Fails on non-finite
    /// scores and on `k == 0`.
    pub fn from_scores(
        user_id: UserId,
        k: usize,
        scores: Vec<(ItemId, f32)>,
    ) -> Result<Self, EvaluationError> {
        if k == 0 {
            return Err(EvaluationError::InvalidArgument(
                "k must be positive".to_owned(),
            ));
        }

        let mut best: HashMap<ItemId, f32> = HashMap::with_capacity(scores.len());

        for (item_id, score) in scores {
            if !score.is_finite() {
                return Err(EvaluationError::InvalidPredictionValue);
            }

            // Normalises -0.0 so that it ties with 0.0.
            let score = score + 0.0;
            let entry = best.entry(item_id).or_insert(score);
            if score > *entry {
                *entry = score;
            }
        }

        let mut items: Vec<(ItemId, f32)> = best.into_iter().collect();

        if items.len() > k {
            items.select_nth_unstable_by(k - 1, cmp_scored);
            items.truncate(k);
        }
        items.sort_by(cmp_scored);

        Ok(RecommendationList { user_id, k, items })
    }

    /// An empty list, e.g. for a cold user.
    pub fn empty(user_id: UserId, k: usize) -> Self {
        RecommendationList {
            user_id,
            k,
            items: Vec::new(),
        }
    }

    /// The user the list was produced for.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// The requested list length.
    pub fn k(&self) -> usize {
        self.k
    }

    /// `(item, score)` pairs, best first.
    pub fn items(&self) -> &[(ItemId, f32)] {
        &self.items
    }

    /// Item ids, best first.
    pub fn item_ids(&self) -> impl Iterator<Item = ItemId> + '_ {
        self.items.iter().map(|&(item_id, _)| item_id)
    }

    /// Number of items, at most `k`.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether no item was recommended.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The top-`k` prefix of this list.
    ///
    /// Because the list is already sorted this is identical to predicting
    /// with the smaller cut-off directly.
    pub fn truncate(&self, k: usize) -> Self {
        RecommendationList {
            user_id: self.user_id,
            k,
            items: self.items.iter().take(k).cloned().collect(),
        }
    }
}

/// Recommendation lists keyed by user, iterated in ascending user order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Recommendations {
    lists: BTreeMap<UserId, RecommendationList>,
}

impl Recommendations {
    /// No lists.
    pub fn new() -> Self {
        Recommendations::default()
    }

    /// Add a list, replacing any earlier list of the same user.
    pub fn insert(&mut self, list: RecommendationList) {
        self.lists.insert(list.user_id(), list);
    }

    /// The list of `user_id`, if one was produced.
    pub fn get(&self, user_id: UserId) -> Option<&RecommendationList> {
        self.lists.get(&user_id)
    }

    /// Number of users with a list.
    pub fn len(&self) -> usize {
        self.lists.len()
    }

    /// Whether there are no lists.
    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    /// Users with a list, ascending.
    pub fn users(&self) -> impl Iterator<Item = UserId> + '_ {
        self.lists.keys().cloned()
    }

    /// Lists in ascending user order.
    pub fn iter(&self) -> btree_map::Values<'_, UserId, RecommendationList> {
        self.lists.values()
    }

    /// Cut every list down to its top `k` items.
    pub fn truncate(&self, k: usize) -> Self {
        self.iter().map(|list| list.truncate(k)).collect()
    }
}

impl FromIterator<RecommendationList> for Recommendations {
    fn from_iter<I: IntoIterator<Item = RecommendationList>>(iter: I) -> Self {
        let mut recommendations = Recommendations::new();
        for list in iter {
            recommendations.insert(list);
        }
        recommendations
    }
}

impl<'a> IntoIterator for &'a Recommendations {
    type Item = &'a RecommendationList;
    type IntoIter = btree_map::Values<'a, UserId, RecommendationList>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Produces one user's recommendations at a time.
///
/// The stream is finite (one item per requested user) and restartable:
/// [`restart`](RecommendationStream::restart) rewinds it, and clones
/// iterate independently. Only the list being produced is held in memory.
pub struct RecommendationStream<'a, M: ?Sized> {
    model: &'a M,
    users: &'a [UserId],
    k: usize,
    filter_seen_items: bool,
    idx: usize,
}

impl<'a, M: RecommenderModel + ?Sized> RecommendationStream<'a, M> {
    pub(crate) fn new(model: &'a M, users: &'a [UserId], k: usize, filter_seen_items: bool) -> Self {
        RecommendationStream {
            model,
            users,
            k,
            filter_seen_items,
            idx: 0,
        }
    }

    /// Rewind to the first user.
    pub fn restart(&mut self) {
        self.idx = 0;
    }
}

impl<'a, M: ?Sized> Clone for RecommendationStream<'a, M> {
    fn clone(&self) -> Self {
        RecommendationStream {
            model: self.model,
            users: self.users,
            k: self.k,
            filter_seen_items: self.filter_seen_items,
            idx: self.idx,
        }
    }
}

impl<'a, M: RecommenderModel + ?Sized> Iterator for RecommendationStream<'a, M> {
    type Item = Result<RecommendationList, EvaluationError>;

    fn next(&mut self) -> Option<Self::Item> {
        let user_id = *self.users.get(self.idx)?;
        self.idx += 1;

        Some(
            self.model
                .recommend_user(user_id, self.k, self.filter_seen_items),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.users.len().saturating_sub(self.idx);
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorts_by_score_then_item_id() {
        let list = RecommendationList::from_scores(
            1,
            10,
            vec![(5, 0.5), (3, 0.9), (9, 0.5), (1, 0.5), (2, -0.0), (4, 0.0)],
        )
        .unwrap();

        let item_ids: Vec<_> = list.item_ids().collect();
        assert_eq!(item_ids, vec![3, 1, 5, 9, 2, 4]);
    }

    #[test]
    fn keeps_at_most_k_items() {
        let scores = (0..100).map(|x| (x, (x % 7) as f32)).collect();
        let list = RecommendationList::from_scores(1, 5, scores).unwrap();

        assert_eq!(list.len(), 5);
        assert_eq!(list.k(), 5);
        let item_ids: Vec<_> = list.item_ids().collect();
        assert_eq!(item_ids, vec![6, 13, 20, 27, 34]);
    }

    #[test]
    fn duplicate_items_keep_their_best_score() {
        let list = RecommendationList::from_scores(1, 3, vec![(1, 0.1), (2, 0.5), (1, 0.9)]).unwrap();

        assert_eq!(list.items(), &[(1, 0.9), (2, 0.5)]);
    }

    #[test]
    fn rejects_non_finite_scores_and_zero_k() {
        assert_eq!(
            RecommendationList::from_scores(1, 3, vec![(1, std::f32::NAN)]),
            Err(EvaluationError::InvalidPredictionValue)
        );
        assert!(RecommendationList::from_scores(1, 0, vec![(1, 1.0)]).is_err());
    }

    #[test]
    fn deserialized_lists_are_ranked_and_bounded() {
        let list: RecommendationList = serde_json::from_str(
            r#"{"user_id": 1, "k": 2, "items": [[5, 0.1], [6, 0.9], [7, 0.5], [6, 0.2]]}"#,
        )
        .unwrap();

        assert_eq!(list.user_id(), 1);
        assert_eq!(list.items(), &[(6, 0.9), (7, 0.5)]);

        let json = serde_json::to_string(&list).unwrap();
        assert_eq!(serde_json::from_str::<RecommendationList>(&json).unwrap(), list);
    }

    #[test]
    fn deserializing_a_zero_k_list_fails() {
        let result =
            serde_json::from_str::<RecommendationList>(r#"{"user_id": 1, "k": 0, "items": []}"#);

        assert!(result.is_err());
    }

    #[test]
    fn truncation_matches_smaller_k() {
        let scores: Vec<_> = (0..20).map(|x| (x, (x * 37 % 11) as f32)).collect();
        let large = RecommendationList::from_scores(1, 10, scores.clone()).unwrap();
        let small = RecommendationList::from_scores(1, 4, scores).unwrap();

        assert_eq!(large.truncate(4), small);
    }

    #[test]
    fn recommendations_iterate_in_user_order() {
        let recommendations: Recommendations = vec![
            RecommendationList::empty(9, 2),
            RecommendationList::empty(1, 2),
            RecommendationList::empty(4, 2),
        ]
        .into_iter()
        .collect();

        let users: Vec<_> = recommendations.users().collect();
        assert_eq!(users, vec![1, 4, 9]);
    }
}
