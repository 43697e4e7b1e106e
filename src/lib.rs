#![deny(missing_docs)]
//! # rankeval
//!
//! `rankeval` runs the offline part of a recommender experiment:
//! split an interaction log, fit one or more models on the train part,
//! produce top-K recommendation lists for the held-out users, and score
//! them with ranking metrics.
//!
//! ## Example
//!
//! ```rust
//! use rankeval::data::{Interaction, Interactions};
//! use rankeval::evaluation::{EvaluationConfig, EvaluationPipeline, MetricConfig};
//! use rankeval::models::popularity;
//! use rankeval::split::{SplitConfig, SplitPolicy};
//!
//! let log = Interactions::new(vec![
//!     Interaction::new(1, 1, 0),
//!     Interaction::new(1, 2, 1),
//!     Interaction::new(1, 3, 2),
//!     Interaction::new(2, 1, 0),
//!     Interaction::new(2, 3, 1),
//! ])
//! .unwrap();
//!
//! let config = EvaluationConfig::new(SplitConfig::new(SplitPolicy::LeaveOneOut))
//!     .k_values(vec![1, 2])
//!     .metric(MetricConfig::new("precision"))
//!     .metric(MetricConfig::new("ndcg"));
//!
//! let mut model = popularity::Hyperparameters::new().build();
//! let table = EvaluationPipeline::new(config)
//!     .run(&log, &mut model)
//!     .unwrap();
//!
//! for row in table.rows() {
//!     println!("{:?}", row);
//! }
//! ```
#[macro_use]
extern crate failure;

pub mod data;
#[cfg(feature = "csv")]
pub mod datasets;
pub mod evaluation;
pub mod models;
pub mod recommendations;
pub mod split;

/// Alias for user identifiers.
pub type UserId = usize;
/// Alias for item identifiers.
pub type ItemId = usize;
/// Alias for timestamps.
pub type Timestamp = usize;

/// Errors raised while splitting, fitting, predicting or evaluating.
#[derive(Debug, Fail, Clone, PartialEq)]
pub enum EvaluationError {
    /// Malformed or empty interaction data.
    #[fail(display = "Invalid input: {}", _0)]
    InvalidInput(String),
    /// Bad argument or configuration value.
    #[fail(display = "Invalid argument: {}", _0)]
    InvalidArgument(String),
    /// `predict` was called on a model that has not been fitted.
    #[fail(display = "Model must be fitted before calling predict.")]
    NotFitted,
    /// `fit` was called twice on a model that does not support refitting.
    #[fail(display = "Model has already been fitted.")]
    AlreadyFitted,
    /// Train and test share `(user, item)` pairs.
    #[fail(
        display = "Data leakage: {} (user, item) pairs appear in both train and test.",
        pairs
    )]
    DataLeakage {
        /// Number of shared pairs.
        pairs: usize,
    },
    /// Failed prediction due to numerical issues.
    #[fail(display = "Invalid prediction value: non-finite or not a number.")]
    InvalidPredictionValue,
}

impl EvaluationError {
    /// Stable name of the error kind, used in result tables.
    pub fn kind(&self) -> &'static str {
        match self {
            EvaluationError::InvalidInput(_) => "InvalidInputError",
            EvaluationError::InvalidArgument(_) => "InvalidArgumentError",
            EvaluationError::NotFitted => "NotFittedError",
            EvaluationError::AlreadyFitted => "AlreadyFittedError",
            EvaluationError::DataLeakage { .. } => "DataLeakageError",
            EvaluationError::InvalidPredictionValue => "InvalidPredictionValueError",
        }
    }
}
