//! Models module.
//!
//! Every algorithm is wrapped behind [`RecommenderModel`]: `fit` once on a
//! train log, then `predict` top-K lists for any number of users.
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::Interactions;
use crate::recommendations::{RecommendationList, RecommendationStream, Recommendations};
use crate::{EvaluationError, UserId};

pub mod als;
pub mod popularity;
pub mod slim;

/// What a model returns for users it did not see during `fit`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ColdUserPolicy {
    /// Return an empty list.
    Empty,
    /// Return the most popular train items.
    PopularityFallback,
}

impl Default for ColdUserPolicy {
    fn default() -> Self {
        ColdUserPolicy::Empty
    }
}

/// The fit/predict contract shared by all recommenders.
///
/// `fit` takes `&mut self` and is therefore exclusive. Once fitted a model
/// is logically immutable: implementations keep no mutable scratch state
/// behind `&self`, so `predict` may run concurrently from many threads.
pub trait RecommenderModel: Send + Sync {
    /// Human-readable name, used in result tables.
    fn name(&self) -> &str;

    /// Whether `fit` has completed successfully.
    fn is_fitted(&self) -> bool;

    /// Train on `train`. Whether a second call retrains or fails with
    /// `AlreadyFitted` is documented by each implementation.
    fn fit(&mut self, train: &Interactions) -> Result<(), EvaluationError>;

    /// Up to `k` items for a single user.
    fn recommend_user(
        &self,
        user_id: UserId,
        k: usize,
        filter_seen_items: bool,
    ) -> Result<RecommendationList, EvaluationError>;

    /// Up to `k` items for each of `users`.
    ///
    /// Arguments and fitted state are checked before any user is scored,
    /// so a failure never leaves partial results behind.
    fn predict(
        &self,
        users: &[UserId],
        k: usize,
        filter_seen_items: bool,
    ) -> Result<Recommendations, EvaluationError> {
        check_predict(self, k)?;

        let lists = users
            .par_iter()
            .map(|&user_id| self.recommend_user(user_id, k, filter_seen_items))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(lists.into_iter().collect())
    }

    /// Lazily produce the recommendations of `users`, one user at a time.
    fn predict_iter<'a>(
        &'a self,
        users: &'a [UserId],
        k: usize,
        filter_seen_items: bool,
    ) -> Result<RecommendationStream<'a, Self>, EvaluationError>
    where
        Self: Sized,
    {
        check_predict(self, k)?;

        Ok(RecommendationStream::new(self, users, k, filter_seen_items))
    }
}

pub(crate) fn check_predict<M: RecommenderModel + ?Sized>(
    model: &M,
    k: usize,
) -> Result<(), EvaluationError> {
    if !model.is_fitted() {
        return Err(EvaluationError::NotFitted);
    }
    if k == 0 {
        return Err(EvaluationError::InvalidArgument(
            "k must be positive".to_owned(),
        ));
    }

    Ok(())
}

/// A model described by configuration.
///
/// `params` is forwarded untouched to the hyperparameters of the model
/// named by `kind`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Name reported in result tables.
    pub name: String,
    /// One of `popularity`, `als` or `slim`.
    pub kind: String,
    /// Hyperparameters of the model.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl ModelSpec {
    /// Instantiate the described model.
    pub fn build(&self) -> Result<Box<dyn RecommenderModel>, EvaluationError> {
        let params = if self.params.is_null() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            self.params.clone()
        };

        let invalid = |err: serde_json::Error| {
            EvaluationError::InvalidArgument(format!(
                "bad hyperparameters for model {}: {}",
                self.name, err
            ))
        };

        match self.kind.as_str() {
            "popularity" => {
                let hyper: popularity::Hyperparameters =
                    serde_json::from_value(params).map_err(invalid)?;
                Ok(Box::new(hyper.name(&self.name).build()))
            }
            "als" => {
                let hyper: als::Hyperparameters = serde_json::from_value(params).map_err(invalid)?;
                Ok(Box::new(hyper.name(&self.name).build()))
            }
            "slim" => {
                let hyper: slim::Hyperparameters = serde_json::from_value(params).map_err(invalid)?;
                Ok(Box::new(hyper.name(&self.name).build()))
            }
            other => Err(EvaluationError::InvalidArgument(format!(
                "unknown model kind: {}",
                other
            ))),
        }
    }
}
