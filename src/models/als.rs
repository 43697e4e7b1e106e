//! Implicit-feedback matrix factorization fitted by alternating least squares.
//!
//! The model estimates two sets of parameters:
//!
//! - n-dimensional user factors `x_u`, and
//! - n-dimensional item factors `y_i`.
//!
//! Each observed `(u, i)` pair carries a confidence `c_ui = 1 + alpha * r_ui`,
//! where `r_ui` is the summed interaction value. Factors are found by
//! alternately solving, for every user (and then every item),
//!
//! ```text
//! (Y^T Y + Y^T (C_u - I) Y + lambda * I) x_u = Y^T C_u p_u
//! ```
//!
//! and the score of item `i` for user `u` is `x_u . y_i`.
//!
//! Initialisation is drawn from an explicitly seeded generator and every
//! per-row solve is independent, so a given seed always produces the same
//! factors regardless of the number of threads.
//!
//! A fitted model cannot be refitted: a second call to `fit` fails with
//! `AlreadyFitted`. Build a new model from the same hyperparameters instead.
use std::collections::{BTreeMap, HashMap, HashSet};

use ndarray::{Array1, Array2, ArrayView2};
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::popularity::{popularity_ranking, top_k_excluding};
use super::{check_predict, ColdUserPolicy, RecommenderModel};
use crate::data::Interactions;
use crate::recommendations::RecommendationList;
use crate::{EvaluationError, ItemId, UserId};

fn factor_init<T: Rng>(rows: usize, cols: usize, rng: &mut T) -> Array2<f64> {
    let scale = (cols as f64).sqrt();
    Array2::from_shape_fn((rows, cols), |_| rng.gen::<f64>() / scale)
}

/// Hyperparameters describing the ALS model.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Hyperparameters {
    name: String,
    latent_dim: usize,
    regularization: f64,
    alpha: f64,
    num_iterations: usize,
    seed: u64,
    cold_user_policy: ColdUserPolicy,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Hyperparameters {
            name: "als".to_owned(),
            latent_dim: 10,
            regularization: 0.1,
            alpha: 1.0,
            num_iterations: 10,
            seed: 42,
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

    /// Set the factor dimensionality.
    pub fn latent_dim(mut self, latent_dim: usize) -> Self {
        self.latent_dim = latent_dim;
        self
    }

    /// Set the L2 penalty.
    pub fn regularization(mut self, regularization: f64) -> Self {
        self.regularization = regularization;
        self
    }

    /// Set the confidence scaling of observed interactions.
    pub fn alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    /// Set the number of alternating sweeps.
    pub fn num_iterations(mut self, num_iterations: usize) -> Self {
        self.num_iterations = num_iterations;
        self
    }

    /// Set the seed of the factor initialisation.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the behaviour for users unseen during `fit`.
    pub fn cold_user_policy(mut self, cold_user_policy: ColdUserPolicy) -> Self {
        self.cold_user_policy = cold_user_policy;
        self
    }

    fn validate(&self) -> Result<(), EvaluationError> {
        if self.latent_dim == 0 {
            return Err(EvaluationError::InvalidArgument(
                "latent_dim must be positive".to_owned(),
            ));
        }
        if !(self.regularization > 0.0) || !self.regularization.is_finite() {
            return Err(EvaluationError::InvalidArgument(format!(
                "regularization must be positive, got {}",
                self.regularization
            )));
        }
        if !(self.alpha >= 0.0) || !self.alpha.is_finite() {
            return Err(EvaluationError::InvalidArgument(format!(
                "alpha must be non-negative, got {}",
                self.alpha
            )));
        }

        Ok(())
    }

    /// Build the ALS model.
    pub fn build(self) -> ImplicitAlsModel {
        ImplicitAlsModel {
            hyper: self,
            model: None,
        }
    }
}

#[derive(Debug)]
struct ModelData {
    user_index: HashMap<UserId, usize>,
    item_ids: Vec<ItemId>,
    user_factors: Array2<f64>,
    item_factors: Array2<f64>,
    seen: HashMap<UserId, HashSet<ItemId>>,
    popularity: Vec<(ItemId, f32)>,
}

/// Implicit ALS factorization model.
#[derive(Debug)]
pub struct ImplicitAlsModel {
    hyper: Hyperparameters,
    model: Option<ModelData>,
}

impl ImplicitAlsModel {
    /// Number of users seen during `fit`.
    pub fn num_users(&self) -> Option<usize> {
        self.model.as_ref().map(|model| model.user_index.len())
    }

    /// Number of items seen during `fit`.
    pub fn num_items(&self) -> Option<usize> {
        self.model.as_ref().map(|model| model.item_ids.len())
    }
}

/// Solve `a x = b` for a symmetric positive definite `a`.
///
/// Returns `None` when `a` is not numerically positive definite.
fn cholesky_solve(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = b.len();
    let mut lower = Array2::<f64>::zeros((n, n));

    for j in 0..n {
        let mut diagonal = a[[j, j]];
        for k in 0..j {
            diagonal -= lower[[j, k]] * lower[[j, k]];
        }
        if !(diagonal > 0.0) || !diagonal.is_finite() {
            return None;
        }
        let diagonal = diagonal.sqrt();
        lower[[j, j]] = diagonal;

        for i in (j + 1)..n {
            let mut value = a[[i, j]];
            for k in 0..j {
                value -= lower[[i, k]] * lower[[j, k]];
            }
            lower[[i, j]] = value / diagonal;
        }
    }

    let mut y = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut value = b[i];
        for k in 0..i {
            value -= lower[[i, k]] * y[k];
        }
        y[i] = value / lower[[i, i]];
    }

    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut value = y[i];
        for k in (i + 1)..n {
            value -= lower[[k, i]] * x[k];
        }
        x[i] = value / lower[[i, i]];
    }

    Some(x)
}

// One half-sweep: recompute every row of one side given the other side.
fn solve_side(
    fixed: ArrayView2<f64>,
    rows: &[Vec<(usize, f64)>],
    regularization: f64,
) -> Result<Array2<f64>, EvaluationError> {
    let latent_dim = fixed.ncols();
    let gram = fixed.t().dot(&fixed);

    let solutions = rows
        .par_iter()
        .map(|row| {
            let mut a = gram.clone();
            let mut b = Array1::<f64>::zeros(latent_dim);

            for &(idx, confidence) in row {
                let y = fixed.row(idx);
                for p in 0..latent_dim {
                    for q in 0..latent_dim {
                        a[[p, q]] += (confidence - 1.0) * y[p] * y[q];
                    }
                }
                b.scaled_add(confidence, &y);
            }

            for p in 0..latent_dim {
                a[[p, p]] += regularization;
            }

            cholesky_solve(&a, &b)
        })
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| {
            EvaluationError::InvalidArgument(
                "ALS normal equations are not positive definite; increase regularization"
                    .to_owned(),
            )
        })?;

    let mut factors = Array2::<f64>::zeros((rows.len(), latent_dim));
    for (idx, solution) in solutions.iter().enumerate() {
        factors.row_mut(idx).assign(solution);
    }

    Ok(factors)
}

impl RecommenderModel for ImplicitAlsModel {
    fn name(&self) -> &str {
        &self.hyper.name
    }

    fn is_fitted(&self) -> bool {
        self.model.is_some()
    }

    fn fit(&mut self, train: &Interactions) -> Result<(), EvaluationError> {
        if self.model.is_some() {
            return Err(EvaluationError::AlreadyFitted);
        }
        if train.is_empty() {
            return Err(EvaluationError::InvalidInput(
                "cannot fit on an empty log".to_owned(),
            ));
        }
        self.hyper.validate()?;

        let user_ids = train.users();
        let item_ids = train.items();
        let user_index: HashMap<UserId, usize> =
            user_ids.iter().enumerate().map(|(idx, &id)| (id, idx)).collect();
        let item_index: HashMap<ItemId, usize> =
            item_ids.iter().enumerate().map(|(idx, &id)| (id, idx)).collect();

        // Summed values per pair; ordered so that accumulation is reproducible.
        let mut strengths: BTreeMap<(usize, usize), f64> = BTreeMap::new();
        for interaction in train.data() {
            let key = (
                user_index[&interaction.user_id()],
                item_index[&interaction.item_id()],
            );
            *strengths.entry(key).or_insert(0.0) += f64::from(interaction.value());
        }

        let mut user_rows = vec![Vec::new(); user_ids.len()];
        let mut item_rows = vec![Vec::new(); item_ids.len()];
        for (&(user_idx, item_idx), &strength) in &strengths {
            let confidence = 1.0 + self.hyper.alpha * strength.max(0.0);
            user_rows[user_idx].push((item_idx, confidence));
            item_rows[item_idx].push((user_idx, confidence));
        }

        let mut rng = XorShiftRng::seed_from_u64(self.hyper.seed);
        let mut user_factors = factor_init(user_ids.len(), self.hyper.latent_dim, &mut rng);
        let mut item_factors = factor_init(item_ids.len(), self.hyper.latent_dim, &mut rng);

        for iteration in 0..self.hyper.num_iterations {
            user_factors = solve_side(item_factors.view(), &user_rows, self.hyper.regularization)?;
            item_factors = solve_side(user_factors.view(), &item_rows, self.hyper.regularization)?;

            debug!(model = %self.hyper.name, iteration, "Finished ALS sweep");
        }

        debug!(
            model = %self.hyper.name,
            num_users = user_ids.len(),
            num_items = item_ids.len(),
            "Fitted ALS model"
        );

        self.model = Some(ModelData {
            user_index,
            item_ids,
            user_factors,
            item_factors,
            seen: train.user_items(),
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
        let model = self.model.as_ref().ok_or(EvaluationError::NotFitted)?;

        let user_idx = match model.user_index.get(&user_id) {
            Some(&user_idx) => user_idx,
            None => {
                return match self.hyper.cold_user_policy {
                    ColdUserPolicy::Empty => Ok(RecommendationList::empty(user_id, k)),
                    ColdUserPolicy::PopularityFallback => {
                        top_k_excluding(user_id, k, &model.popularity, None)
                    }
                };
            }
        };

        let scores = model.item_factors.dot(&model.user_factors.row(user_idx));
        let seen = if filter_seen_items {
            model.seen.get(&user_id)
        } else {
            None
        };

        let candidates = model
            .item_ids
            .iter()
            .zip(scores.iter())
            .filter(|(item_id, _)| seen.map_or(true, |seen| !seen.contains(*item_id)))
            .map(|(&item_id, &score)| (item_id, score as f32))
            .collect();

        RecommendationList::from_scores(user_id, k, candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Interaction;

    fn two_blocks() -> Interactions {
        let mut interactions = Vec::new();
        let mut timestamp = 0;

        for (users, items) in &[(vec![1, 2, 3], vec![1, 2, 3]), (vec![4, 5, 6], vec![4, 5, 6])] {
            for &user_id in users {
                for &item_id in items {
                    // User 1 has not seen item 3 yet.
                    if user_id == 1 && item_id == 3 {
                        continue;
                    }
                    interactions.push(Interaction::new(user_id, item_id, timestamp));
                    timestamp += 1;
                }
            }
        }

        Interactions::new(interactions).unwrap()
    }

    fn hyperparameters() -> Hyperparameters {
        Hyperparameters::new()
            .latent_dim(2)
            .regularization(0.01)
            .alpha(10.0)
            .num_iterations(15)
            .seed(7)
    }

    #[test]
    fn cholesky_solves_small_system() {
        let a = ndarray::arr2(&[[4.0, 2.0], [2.0, 3.0]]);
        let b = ndarray::arr1(&[2.0, 1.0]);

        let x = cholesky_solve(&a, &b).unwrap();

        assert!((x[0] - 0.5).abs() < 1e-12);
        assert!(x[1].abs() < 1e-12);
    }

    #[test]
    fn cholesky_rejects_indefinite_matrix() {
        let a = ndarray::arr2(&[[0.0, 1.0], [1.0, 0.0]]);
        let b = ndarray::arr1(&[1.0, 1.0]);

        assert!(cholesky_solve(&a, &b).is_none());
    }

    #[test]
    fn recommends_the_missing_item_of_the_users_block() {
        let mut model = hyperparameters().build();
        model.fit(&two_blocks()).unwrap();

        assert_eq!(model.num_users(), Some(6));
        assert_eq!(model.num_items(), Some(6));

        let list = model.recommend_user(1, 1, true).unwrap();
        assert_eq!(list.item_ids().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn same_seed_gives_same_recommendations() {
        let data = two_blocks();

        let mut first = hyperparameters().build();
        let mut second = hyperparameters().build();
        first.fit(&data).unwrap();
        second.fit(&data).unwrap();

        let users = data.users();
        assert_eq!(
            first.predict(&users, 4, false).unwrap(),
            second.predict(&users, 4, false).unwrap()
        );
    }

    #[test]
    fn refitting_is_rejected() {
        let mut model = hyperparameters().build();
        model.fit(&two_blocks()).unwrap();

        assert_eq!(
            model.fit(&two_blocks()),
            Err(EvaluationError::AlreadyFitted)
        );
    }

    #[test]
    fn predict_before_fit_fails() {
        let model = hyperparameters().build();

        assert_eq!(model.predict(&[1], 3, true), Err(EvaluationError::NotFitted));
    }

    #[test]
    fn invalid_hyperparameters_are_rejected_at_fit() {
        let mut model = hyperparameters().regularization(0.0).build();

        match model.fit(&two_blocks()) {
            Err(EvaluationError::InvalidArgument(_)) => {}
            other => panic!("expected InvalidArgument, got {:?}", other),
        }
        assert!(!model.is_fitted());
    }

    #[test]
    fn cold_user_policies() {
        let mut empty = hyperparameters().build();
        empty.fit(&two_blocks()).unwrap();
        assert!(empty.recommend_user(42, 3, true).unwrap().is_empty());

        let mut fallback = hyperparameters()
            .cold_user_policy(ColdUserPolicy::PopularityFallback)
            .build();
        fallback.fit(&two_blocks()).unwrap();

        // Items 1, 2 and 4..6 are shared by three users, item 3 by two.
        let list = fallback.recommend_user(42, 3, true).unwrap();
        assert_eq!(list.item_ids().collect::<Vec<_>>(), vec![1, 2, 4]);
    }
}
