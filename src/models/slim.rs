//! Sparse linear item-item model (SLIM).
//!
//! Every item column `a_j` of the user-item matrix `A` is regressed on the
//! other columns with a non-negative elastic net,
//!
//! ```text
//! min_w  1/(2n) ||a_j - A w||^2 + lambda ||w||_1 + beta/2 ||w||^2
//! s.t.   w >= 0, w_j = 0
//! ```
//!
//! where `n` is the number of train users. The coefficients `w_ij` are the
//! similarity of item `i` to item `j`, and a user's score for `j` is the sum
//! of `w_ij` over the items `i` in their train history. Items no history
//! item points to are not candidates.
//!
//! Each regression is solved by cyclic coordinate descent, so the fitted
//! weights do not depend on the number of threads.
//!
//! Calling `fit` again discards the previous state and retrains from
//! scratch on the new log.
use std::collections::{BTreeMap, HashMap};

use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::popularity::{popularity_ranking, top_k_excluding};
use super::{check_predict, ColdUserPolicy, RecommenderModel};
use crate::data::Interactions;
use crate::recommendations::RecommendationList;
use crate::{EvaluationError, ItemId, UserId};

/// Hyperparameters describing the SLIM model.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Hyperparameters {
    name: String,
    beta: f64,
    lambda: f64,
    max_iterations: usize,
    tolerance: f64,
    cold_user_policy: ColdUserPolicy,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Hyperparameters {
            name: "slim".to_owned(),
            beta: 4.0,
            lambda: 0.02,
            max_iterations: 100,
            tolerance: 1e-6,
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

    /// Set the L2 penalty. Must be non-negative.
    pub fn beta(mut self, beta: f64) -> Self {
        self.beta = beta;
        self
    }

    /// Set the L1 penalty. Must be positive.
    pub fn lambda(mut self, lambda: f64) -> Self {
        self.lambda = lambda;
        self
    }

    /// Set the maximum number of coordinate descent sweeps per item.
    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Stop an item's sweeps once no weight moves by more than this.
    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Set the behaviour for users unseen during `fit`.
    pub fn cold_user_policy(mut self, cold_user_policy: ColdUserPolicy) -> Self {
        self.cold_user_policy = cold_user_policy;
        self
    }

    fn validate(&self) -> Result<(), EvaluationError> {
        if !(self.beta >= 0.0) || !self.beta.is_finite() {
            return Err(EvaluationError::InvalidArgument(format!(
                "beta must be non-negative, got {}",
                self.beta
            )));
        }
        if !(self.lambda > 0.0) || !self.lambda.is_finite() {
            return Err(EvaluationError::InvalidArgument(format!(
                "lambda must be positive, got {}",
                self.lambda
            )));
        }
        if self.max_iterations == 0 {
            return Err(EvaluationError::InvalidArgument(
                "max_iterations must be positive".to_owned(),
            ));
        }
        if !(self.tolerance >= 0.0) || !self.tolerance.is_finite() {
            return Err(EvaluationError::InvalidArgument(format!(
                "tolerance must be non-negative, got {}",
                self.tolerance
            )));
        }

        Ok(())
    }

    /// Build the SLIM model.
    pub fn build(self) -> SlimModel {
        SlimModel {
            hyper: self,
            state: None,
        }
    }
}

#[derive(Clone, Debug)]
struct FittedState {
    item_ids: Vec<ItemId>,
    item_index: HashMap<ItemId, usize>,
    // For every source item, the `(target, weight)` pairs with positive weight.
    neighbours: Vec<Vec<(usize, f64)>>,
    // Sorted, distinct item indices of every train user.
    histories: HashMap<UserId, Vec<usize>>,
    popularity: Vec<(ItemId, f32)>,
}

/// Non-negative elastic net weights of one target column.
fn fit_column(
    matrix: ArrayView2<f64>,
    norms: &[f64],
    target: usize,
    hyper: &Hyperparameters,
) -> Vec<(usize, f64)> {
    let num_users = matrix.nrows() as f64;
    let mut residual = matrix.column(target).to_owned();
    let mut weights = vec![0.0; matrix.ncols()];

    for _ in 0..hyper.max_iterations {
        let mut max_change: f64 = 0.0;

        for (idx, &norm) in norms.iter().enumerate() {
            if idx == target || norm == 0.0 {
                continue;
            }

            let column = matrix.column(idx);
            let old = weights[idx];
            let rho = column.dot(&residual) / num_users + norm * old;
            let new = (rho - hyper.lambda).max(0.0) / (norm + hyper.beta);

            if new != old {
                residual.scaled_add(old - new, &column);
                weights[idx] = new;
                max_change = max_change.max((new - old).abs());
            }
        }

        if max_change <= hyper.tolerance {
            break;
        }
    }

    weights
        .into_iter()
        .enumerate()
        .filter(|&(_, weight)| weight > 0.0)
        .collect()
}

/// SLIM item-item model.
#[derive(Clone, Debug)]
pub struct SlimModel {
    hyper: Hyperparameters,
    state: Option<FittedState>,
}

impl SlimModel {
    /// Learned weight of `source` towards `target`.
    ///
    /// `None` before `fit` or for items absent from the train log.
    pub fn similarity(&self, source: ItemId, target: ItemId) -> Option<f64> {
        let state = self.state.as_ref()?;
        let source = *state.item_index.get(&source)?;
        let target = *state.item_index.get(&target)?;

        Some(
            state.neighbours[source]
                .iter()
                .find(|&&(idx, _)| idx == target)
                .map_or(0.0, |&(_, weight)| weight),
        )
    }
}

impl RecommenderModel for SlimModel {
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
        self.hyper.validate()?;

        if self.state.is_some() {
            debug!(model = %self.hyper.name, "Refitting SLIM model from scratch");
        }

        let user_ids = train.users();
        let item_ids = train.items();
        let user_index: HashMap<UserId, usize> =
            user_ids.iter().enumerate().map(|(idx, &id)| (id, idx)).collect();
        let item_index: HashMap<ItemId, usize> =
            item_ids.iter().enumerate().map(|(idx, &id)| (id, idx)).collect();

        let mut strengths: BTreeMap<(usize, usize), f64> = BTreeMap::new();
        for interaction in train.data() {
            let key = (
                user_index[&interaction.user_id()],
                item_index[&interaction.item_id()],
            );
            *strengths.entry(key).or_insert(0.0) += f64::from(interaction.value());
        }

        let mut matrix = Array2::<f64>::zeros((user_ids.len(), item_ids.len()));
        let mut histories: HashMap<UserId, Vec<usize>> = HashMap::new();
        for (&(user_idx, item_idx), &strength) in &strengths {
            matrix[[user_idx, item_idx]] = strength;
            histories
                .entry(user_ids[user_idx])
                .or_default()
                .push(item_idx);
        }

        let num_users = user_ids.len() as f64;
        let norms: Vec<f64> = (0..item_ids.len())
            .map(|idx| {
                let column = matrix.column(idx);
                column.dot(&column) / num_users
            })
            .collect();

        let columns: Vec<Vec<(usize, f64)>> = (0..item_ids.len())
            .into_par_iter()
            .map(|target| fit_column(matrix.view(), &norms, target, &self.hyper))
            .collect();

        let mut neighbours = vec![Vec::new(); item_ids.len()];
        let mut num_weights = 0;
        for (target, weights) in columns.into_iter().enumerate() {
            num_weights += weights.len();
            for (source, weight) in weights {
                neighbours[source].push((target, weight));
            }
        }

        debug!(
            model = %self.hyper.name,
            num_users = user_ids.len(),
            num_items = item_ids.len(),
            num_weights,
            "Fitted SLIM model"
        );

        self.state = Some(FittedState {
            item_ids,
            item_index,
            neighbours,
            histories,
            popularity: popularity_ranking(train),
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

        let history = match state.histories.get(&user_id) {
            Some(history) => history,
            None => {
                return match self.hyper.cold_user_policy {
                    ColdUserPolicy::Empty => Ok(RecommendationList::empty(user_id, k)),
                    ColdUserPolicy::PopularityFallback => {
                        top_k_excluding(user_id, k, &state.popularity, None)
                    }
                };
            }
        };

        let mut scores: BTreeMap<usize, f64> = BTreeMap::new();
        for &source in history {
            for &(target, weight) in &state.neighbours[source] {
                *scores.entry(target).or_insert(0.0) += weight;
            }
        }

        let candidates = scores
            .into_iter()
            .filter(|(target, _)| !filter_seen_items || history.binary_search(target).is_err())
            .map(|(target, score)| (state.item_ids[target], score as f32))
            .collect();

        RecommendationList::from_scores(user_id, k, candidates)
    }
}
