//! Interaction logs and their per-user views.
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{EvaluationError, ItemId, Timestamp, UserId};

fn default_value() -> f32 {
    1.0
}

/// A single recorded (user, item) event.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct Interaction {
    user_id: UserId,
    item_id: ItemId,
    timestamp: Timestamp,
    #[serde(default = "default_value")]
    value: f32,
}

impl Interaction {
    /// Build an implicit-feedback interaction with a value of 1.0.
    pub fn new(user_id: UserId, item_id: ItemId, timestamp: Timestamp) -> Self {
        Interaction {
            user_id,
            item_id,
            timestamp,
            value: default_value(),
        }
    }

    /// Build an interaction carrying an explicit value, e.g. a rating.
    pub fn with_value(user_id: UserId, item_id: ItemId, timestamp: Timestamp, value: f32) -> Self {
        Interaction {
            user_id,
            item_id,
            timestamp,
            value,
        }
    }

    /// The user.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }
    /// The item.
    pub fn item_id(&self) -> ItemId {
        self.item_id
    }
    /// When the event happened.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
    /// Strength of the event; 1.0 for implicit feedback.
    pub fn value(&self) -> f32 {
        self.value
    }
}

fn cmp_timestamp(x: &Interaction, y: &Interaction) -> Ordering {
    x.user_id()
        .cmp(&y.user_id())
        .then(x.timestamp().cmp(&y.timestamp()))
        .then(x.item_id().cmp(&y.item_id()))
}

/// An immutable interaction log.
///
/// Cloning is cheap: the rows live behind an `Arc` and are shared
/// between clones, so a log can be handed to any number of worker
/// threads without copying or locking.
#[derive(Clone, Debug)]
pub struct Interactions {
    interactions: Arc<Vec<Interaction>>,
}

impl Interactions {
    /// Build a log from records.
    ///
    /// Fails with `InvalidInput` on duplicate `(user, item, timestamp)`
    /// triples or non-finite values: both make splitting irreproducible.
    pub fn new(interactions: Vec<Interaction>) -> Result<Self, EvaluationError> {
        let mut seen = HashSet::with_capacity(interactions.len());

        for interaction in &interactions {
            if !interaction.value().is_finite() {
                return Err(EvaluationError::InvalidInput(format!(
                    "non-finite value for user {} and item {}",
                    interaction.user_id(),
                    interaction.item_id()
                )));
            }

            let key = (
                interaction.user_id(),
                interaction.item_id(),
                interaction.timestamp(),
            );
            if !seen.insert(key) {
                return Err(EvaluationError::InvalidInput(format!(
                    "duplicate interaction (user {}, item {}, timestamp {})",
                    key.0, key.1, key.2
                )));
            }
        }

        Ok(Interactions::from_validated(interactions))
    }

    // Rows taken from an already validated log cannot introduce duplicates.
    pub(crate) fn from_validated(interactions: Vec<Interaction>) -> Self {
        Interactions {
            interactions: Arc::new(interactions),
        }
    }

    /// The rows, in insertion order.
    pub fn data(&self) -> &[Interaction] {
        &self.interactions
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.interactions.len()
    }

    /// Whether the log has no rows.
    pub fn is_empty(&self) -> bool {
        self.interactions.is_empty()
    }

    /// Distinct user ids, sorted.
    pub fn users(&self) -> Vec<UserId> {
        self.interactions
            .iter()
            .map(|x| x.user_id())
            .sorted()
            .dedup()
            .collect()
    }

    /// Distinct item ids, sorted.
    pub fn items(&self) -> Vec<ItemId> {
        self.interactions
            .iter()
            .map(|x| x.item_id())
            .sorted()
            .dedup()
            .collect()
    }

    /// Number of distinct users.
    pub fn num_users(&self) -> usize {
        self.users().len()
    }

    /// Number of distinct items.
    pub fn num_items(&self) -> usize {
        self.items().len()
    }

    /// The set of items each user interacted with.
    pub fn user_items(&self) -> HashMap<UserId, HashSet<ItemId>> {
        let mut user_items: HashMap<UserId, HashSet<ItemId>> = HashMap::new();

        for interaction in self.interactions.iter() {
            user_items
                .entry(interaction.user_id())
                .or_default()
                .insert(interaction.item_id());
        }

        user_items
    }

    /// Number of distinct users that interacted with each item.
    pub fn item_user_counts(&self) -> HashMap<ItemId, usize> {
        let mut pairs = HashSet::with_capacity(self.len());
        let mut counts = HashMap::new();

        for interaction in self.interactions.iter() {
            if pairs.insert((interaction.user_id(), interaction.item_id())) {
                *counts.entry(interaction.item_id()).or_insert(0) += 1;
            }
        }

        counts
    }

    /// Derive a new log holding the rows for which `func` returns `true`.
    pub fn filter<F: Fn(&Interaction) -> bool>(&self, func: F) -> Self {
        Interactions::from_validated(
            self.interactions
                .iter()
                .filter(|x| func(x))
                .cloned()
                .collect(),
        )
    }

    /// Split into rows for which `func` holds and rows for which it does not.
    pub fn split_by<F: Fn(&Interaction) -> bool>(&self, func: F) -> (Self, Self) {
        let (head, tail): (Vec<_>, Vec<_>) =
            self.interactions.iter().cloned().partition(|x| func(x));

        (
            Interactions::from_validated(head),
            Interactions::from_validated(tail),
        )
    }

    /// Split by a per-row mask; `true` rows go to the first log.
    pub(crate) fn split_by_mask(&self, mask: &[bool]) -> (Self, Self) {
        debug_assert_eq!(mask.len(), self.len());

        let mut head = Vec::new();
        let mut tail = Vec::new();

        for (interaction, &is_head) in self.interactions.iter().zip(mask) {
            if is_head {
                head.push(*interaction);
            } else {
                tail.push(*interaction);
            }
        }

        (
            Interactions::from_validated(head),
            Interactions::from_validated(tail),
        )
    }

    /// Group the rows by user, each user's rows oldest first.
    pub fn to_compressed(&self) -> CompressedInteractions {
        CompressedInteractions::from(self)
    }
}

/// Per-user view of a log, rows sorted by timestamp within each user.
#[derive(Clone, Debug)]
pub struct CompressedInteractions {
    user_ids: Vec<UserId>,
    user_pointers: Vec<usize>,
    item_ids: Vec<ItemId>,
    timestamps: Vec<Timestamp>,
    values: Vec<f32>,
}

impl<'a> From<&'a Interactions> for CompressedInteractions {
    fn from(interactions: &Interactions) -> CompressedInteractions {
        let mut data = interactions.data().to_owned();

        data.sort_by(cmp_timestamp);

        let mut user_ids = Vec::new();
        let mut user_pointers = vec![0];
        let mut item_ids = Vec::with_capacity(data.len());
        let mut timestamps = Vec::with_capacity(data.len());
        let mut values = Vec::with_capacity(data.len());

        for (idx, datum) in data.iter().enumerate() {
            if user_ids.last() != Some(&datum.user_id()) {
                if idx > 0 {
                    user_pointers.push(idx);
                }
                user_ids.push(datum.user_id());
            }

            item_ids.push(datum.item_id());
            timestamps.push(datum.timestamp());
            values.push(datum.value());
        }

        if !data.is_empty() {
            user_pointers.push(data.len());
        }

        CompressedInteractions {
            user_ids,
            user_pointers,
            item_ids,
            timestamps,
            values,
        }
    }
}

impl CompressedInteractions {
    /// Iterate over users in ascending id order.
    pub fn iter_users(&self) -> CompressedInteractionsUserIterator<'_> {
        CompressedInteractionsUserIterator {
            interactions: self,
            idx: 0,
        }
    }

    /// The rows of `user_id`, if present.
    pub fn get_user(&self, user_id: UserId) -> Option<CompressedInteractionsUser<'_>> {
        self.user_ids
            .binary_search(&user_id)
            .ok()
            .map(|idx| self.user_at(idx))
    }

    fn user_at(&self, idx: usize) -> CompressedInteractionsUser<'_> {
        let start = self.user_pointers[idx];
        let stop = self.user_pointers[idx + 1];

        CompressedInteractionsUser {
            user_id: self.user_ids[idx],
            item_ids: &self.item_ids[start..stop],
            timestamps: &self.timestamps[start..stop],
            values: &self.values[start..stop],
        }
    }

    /// Sorted ids of the users present in the view.
    pub fn user_ids(&self) -> &[UserId] {
        &self.user_ids
    }

    /// Number of users.
    pub fn num_users(&self) -> usize {
        self.user_ids.len()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.item_ids.len()
    }

    /// Whether the view has no rows.
    pub fn is_empty(&self) -> bool {
        self.item_ids.is_empty()
    }
}

/// Iterator over the users of a [`CompressedInteractions`].
pub struct CompressedInteractionsUserIterator<'a> {
    interactions: &'a CompressedInteractions,
    idx: usize,
}

/// One user's interactions, oldest first.
#[derive(Debug, Clone, Copy)]
pub struct CompressedInteractionsUser<'a> {
    /// The user.
    pub user_id: UserId,
    /// Items, oldest first.
    pub item_ids: &'a [ItemId],
    /// Timestamps matching `item_ids`.
    pub timestamps: &'a [Timestamp],
    /// Values matching `item_ids`.
    pub values: &'a [f32],
}

impl<'a> CompressedInteractionsUser<'a> {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.item_ids.len()
    }

    /// Whether the user has no rows.
    pub fn is_empty(&self) -> bool {
        self.item_ids.is_empty()
    }

    /// Rebuild the interaction at position `idx`.
    pub fn interaction(&self, idx: usize) -> Interaction {
        Interaction::with_value(
            self.user_id,
            self.item_ids[idx],
            self.timestamps[idx],
            self.values[idx],
        )
    }
}

impl<'a> Iterator for CompressedInteractionsUserIterator<'a> {
    type Item = CompressedInteractionsUser<'a>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.idx >= self.interactions.num_users() {
            return None;
        }

        let value = self.interactions.user_at(self.idx);
        self.idx += 1;

        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> Interactions {
        Interactions::new(vec![
            Interaction::new(7, 3, 20),
            Interaction::new(2, 1, 5),
            Interaction::new(7, 1, 10),
            Interaction::with_value(2, 4, 1, 4.5),
        ])
        .unwrap()
    }

    #[test]
    fn rejects_duplicate_triples() {
        let result = Interactions::new(vec![Interaction::new(1, 1, 1), Interaction::new(1, 1, 1)]);

        match result {
            Err(EvaluationError::InvalidInput(_)) => {}
            other => panic!("expected InvalidInput, got {:?}", other),
        }
    }

    #[test]
    fn rejects_non_finite_values() {
        let result = Interactions::new(vec![Interaction::with_value(1, 1, 1, std::f32::NAN)]);

        assert!(result.is_err());
    }

    #[test]
    fn distinct_users_and_items_are_sorted() {
        let data = log();

        assert_eq!(data.users(), vec![2, 7]);
        assert_eq!(data.items(), vec![1, 3, 4]);
        assert_eq!(data.num_users(), 2);
    }

    #[test]
    fn item_user_counts_ignore_repeats() {
        let data = Interactions::new(vec![
            Interaction::new(1, 1, 1),
            Interaction::new(1, 1, 2),
            Interaction::new(2, 1, 1),
            Interaction::new(2, 2, 1),
        ])
        .unwrap();
        let counts = data.item_user_counts();

        assert_eq!(counts[&1], 2);
        assert_eq!(counts[&2], 1);
    }

    #[test]
    fn derived_logs_leave_the_source_untouched() {
        let data = log();
        let (early, late) = data.split_by(|x| x.timestamp() < 10);

        assert_eq!(early.len(), 2);
        assert_eq!(late.len(), 2);
        assert_eq!(data.len(), 4);
        assert_eq!(data.data()[0], Interaction::new(7, 3, 20));
    }

    #[test]
    fn compressed_view_is_sorted_by_user_then_time() {
        let compressed = log().to_compressed();
        let users: Vec<_> = compressed.iter_users().collect();

        assert_eq!(users.len(), 2);
        assert_eq!(users[0].user_id, 2);
        assert_eq!(users[0].item_ids, &[4, 1]);
        assert_eq!(users[0].values, &[4.5, 1.0]);
        assert_eq!(users[1].user_id, 7);
        assert_eq!(users[1].timestamps, &[10, 20]);

        assert_eq!(compressed.get_user(7).unwrap().item_ids, &[1, 3]);
        assert!(compressed.get_user(3).is_none());
    }

    #[test]
    fn compressed_view_of_empty_log() {
        let compressed = Interactions::new(Vec::new()).unwrap().to_compressed();

        assert!(compressed.is_empty());
        assert_eq!(compressed.iter_users().count(), 0);
    }
}
