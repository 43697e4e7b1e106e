//! Metrics and the evaluation pipeline.
//!
//! [`MetricEngine`] scores recommendation lists against held-out
//! interactions; [`EvaluationPipeline`] drives split, fit, predict, and
//! scoring for one or more models and collects a [`ResultTable`].
mod engine;
mod metrics;
mod pipeline;

pub use self::engine::{MetricEngine, MetricResult, MetricValue};
pub use self::metrics::{
    average_precision_at_k, hit_rate_at_k, ndcg_at_k, precision_at_k, recall_at_k,
    reciprocal_rank_at_k, Metric, MetricSpec,
};
pub use self::pipeline::{
    EvaluationConfig, EvaluationPipeline, MetricConfig, ResultRow, ResultTable, RowStatus,
};
