//! End-to-end evaluation: split, fit, predict, score.
use std::fmt;
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::engine::MetricEngine;
use super::metrics::{Metric, MetricSpec};
use crate::data::Interactions;
use crate::models::RecommenderModel;
use crate::split::{split, SplitConfig};
use crate::{EvaluationError, UserId};

/// A metric requested by name.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MetricConfig {
    /// Metric name, such as `ndcg` or `hit_rate`.
    pub name: String,
    /// Ground-truth rows with a value below this are not relevant.
    #[serde(default)]
    pub relevance_threshold: f32,
}

impl MetricConfig {
    /// Request the metric called `name`.
    pub fn new(name: &str) -> Self {
        MetricConfig {
            name: name.to_owned(),
            relevance_threshold: 0.0,
        }
    }

    /// Set the relevance threshold.
    pub fn relevance_threshold(mut self, threshold: f32) -> Self {
        self.relevance_threshold = threshold;
        self
    }
}

/// Configuration of an evaluation run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvaluationConfig {
    split: SplitConfig,
    k_values: Vec<usize>,
    metrics: Vec<MetricConfig>,
    filter_seen_items: bool,
    num_threads: Option<usize>,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        EvaluationConfig {
            split: SplitConfig::default(),
            k_values: vec![10],
            metrics: Vec::new(),
            filter_seen_items: true,
            num_threads: None,
        }
    }
}

impl EvaluationConfig {
    /// Evaluate on splits produced by `split`.
    pub fn new(split: SplitConfig) -> Self {
        EvaluationConfig {
            split,
            ..EvaluationConfig::default()
        }
    }

    /// Set the cut-offs, in reporting order.
    pub fn k_values(mut self, k_values: Vec<usize>) -> Self {
        self.k_values = k_values;
        self
    }

    /// Add a metric.
    pub fn metric(mut self, metric: MetricConfig) -> Self {
        self.metrics.push(metric);
        self
    }

    /// Set whether train items are removed from recommendations.
    pub fn filter_seen_items(mut self, filter_seen_items: bool) -> Self {
        self.filter_seen_items = filter_seen_items;
        self
    }

    /// Run on a dedicated pool of `num_threads` threads.
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    /// The splitter configuration.
    pub fn split(&self) -> &SplitConfig {
        &self.split
    }

    /// Check the configuration and resolve metric names, grouped by cut-off.
    pub fn validate(&self) -> Result<Vec<(usize, Vec<MetricSpec>)>, EvaluationError> {
        if self.k_values.is_empty() {
            return Err(EvaluationError::InvalidArgument(
                "at least one cut-off is required".to_owned(),
            ));
        }
        if self.k_values.contains(&0) {
            return Err(EvaluationError::InvalidArgument(
                "cut-offs must be positive".to_owned(),
            ));
        }
        if self.metrics.is_empty() {
            return Err(EvaluationError::InvalidArgument(
                "at least one metric is required".to_owned(),
            ));
        }
        if self.num_threads == Some(0) {
            return Err(EvaluationError::InvalidArgument(
                "num_threads must be positive".to_owned(),
            ));
        }
        if let Some(metric) = self
            .metrics
            .iter()
            .find(|metric| !metric.relevance_threshold.is_finite())
        {
            return Err(EvaluationError::InvalidArgument(format!(
                "relevance threshold of {} must be finite",
                metric.name
            )));
        }

        self.split.validate()?;

        let metrics = self
            .metrics
            .iter()
            .map(|config| Ok((config.name.parse::<Metric>()?, config.relevance_threshold)))
            .collect::<Result<Vec<_>, EvaluationError>>()?;

        for (idx, &(metric, threshold)) in metrics.iter().enumerate() {
            if metrics[..idx].contains(&(metric, threshold)) {
                return Err(EvaluationError::InvalidArgument(format!(
                    "{} with relevance threshold {} is requested twice",
                    metric, threshold
                )));
            }
        }

        Ok(self
            .k_values
            .iter()
            .map(|&k| {
                let specs = metrics
                    .iter()
                    .map(|&(metric, threshold)| {
                        MetricSpec::new(metric, k).relevance_threshold(threshold)
                    })
                    .collect();
                (k, specs)
            })
            .collect())
    }
}

/// Outcome of a row.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RowStatus {
    /// The metric was computed.
    Ok,
    /// No user contributed to the metric.
    NoData,
    /// The model failed to fit or predict.
    Failed {
        /// Stable error kind, see [`EvaluationError::kind`].
        kind: String,
        /// Error message.
        message: String,
    },
}

/// One line of a result table.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ResultRow {
    /// Name of the evaluated model.
    pub model_name: String,
    /// Cut-off; `None` for failed models.
    pub k: Option<usize>,
    /// Metric name without the cut-off; `None` for failed models.
    pub metric_name: Option<String>,
    /// Relevance threshold the metric was computed with; `None` for failed
    /// models.
    pub relevance_threshold: Option<f32>,
    /// Aggregate value; `None` unless the status is `Ok`.
    pub value: Option<f64>,
    /// Outcome.
    pub status: RowStatus,
}

impl ResultRow {
    fn metric(model_name: &str, spec: &MetricSpec, value: Option<f64>) -> Self {
        ResultRow {
            model_name: model_name.to_owned(),
            k: Some(spec.k),
            metric_name: Some(spec.metric.name().to_owned()),
            relevance_threshold: Some(spec.relevance_threshold),
            value,
            status: if value.is_some() {
                RowStatus::Ok
            } else {
                RowStatus::NoData
            },
        }
    }

    fn failed(model_name: &str, error: &EvaluationError) -> Self {
        ResultRow {
            model_name: model_name.to_owned(),
            k: None,
            metric_name: None,
            relevance_threshold: None,
            value: None,
            status: RowStatus::Failed {
                kind: error.kind().to_owned(),
                message: error.to_string(),
            },
        }
    }

    fn matches(&self, model_name: &str, k: usize, metric_name: &str) -> bool {
        self.model_name == model_name
            && self.k == Some(k)
            && self.metric_name.as_ref().map(String::as_str) == Some(metric_name)
    }

    /// Metric name with the threshold appended when it is not zero.
    fn label(&self) -> String {
        let name = self.metric_name.as_ref().map(String::as_str).unwrap_or("");
        match self.relevance_threshold {
            Some(threshold) if threshold != 0.0 => format!("{}[>={}]", name, threshold),
            _ => name.to_owned(),
        }
    }

    /// Whether this row records a failed model.
    pub fn is_failed(&self) -> bool {
        match self.status {
            RowStatus::Failed { .. } => true,
            _ => false,
        }
    }
}

/// Rows ordered by model, then cut-off, then metric.
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct ResultTable {
    rows: Vec<ResultRow>,
}

impl ResultTable {
    /// All rows.
    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    /// The first row of `metric_name` at cut-off `k` for `model_name`.
    pub fn get(&self, model_name: &str, k: usize, metric_name: &str) -> Option<&ResultRow> {
        self.rows
            .iter()
            .find(|row| row.matches(model_name, k, metric_name))
    }

    /// The row of `metric_name` computed with `relevance_threshold`.
    pub fn get_with_threshold(
        &self,
        model_name: &str,
        k: usize,
        metric_name: &str,
        relevance_threshold: f32,
    ) -> Option<&ResultRow> {
        self.rows.iter().find(|row| {
            row.matches(model_name, k, metric_name)
                && row.relevance_threshold == Some(relevance_threshold)
        })
    }

    /// Rows of models that failed.
    pub fn failed(&self) -> impl Iterator<Item = &ResultRow> {
        self.rows.iter().filter(|row| row.is_failed())
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl fmt::Display for ResultTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<20} {:>4} {:<16} {:>10}", "model", "k", "metric", "value")?;

        for row in &self.rows {
            match &row.status {
                RowStatus::Failed { kind, message } => {
                    writeln!(f, "{:<20} failed: {}: {}", row.model_name, kind, message)?
                }
                status => {
                    let value = match (status, row.value) {
                        (RowStatus::Ok, Some(value)) => format!("{:.4}", value),
                        _ => "no data".to_owned(),
                    };
                    writeln!(
                        f,
                        "{:<20} {:>4} {:<16} {:>10}",
                        row.model_name,
                        row.k.unwrap_or(0),
                        row.label(),
                        value
                    )?
                }
            }
        }

        Ok(())
    }
}

struct EvaluationContext<'a> {
    train: &'a Interactions,
    test: &'a Interactions,
    test_users: Vec<UserId>,
    engine: MetricEngine,
    specs: Vec<(usize, Vec<MetricSpec>)>,
    max_k: usize,
    filter_seen_items: bool,
}

/// Splits a log once and evaluates models on it.
#[derive(Clone, Debug)]
pub struct EvaluationPipeline {
    config: EvaluationConfig,
}

impl EvaluationPipeline {
    /// Build a pipeline.
    pub fn new(config: EvaluationConfig) -> Self {
        EvaluationPipeline { config }
    }

    /// The pipeline's configuration.
    pub fn config(&self) -> &EvaluationConfig {
        &self.config
    }

    /// Evaluate a single model.
    pub fn run(
        &self,
        log: &Interactions,
        model: &mut dyn RecommenderModel,
    ) -> Result<ResultTable, EvaluationError> {
        self.evaluate(log, &mut [model])
    }

    /// Evaluate several models on the same split.
    ///
    /// Configuration and split errors are returned directly. Errors raised
    /// while fitting or scoring a model become a single failed row for that
    /// model; the others are unaffected.
    pub fn compare(
        &self,
        log: &Interactions,
        models: &mut [Box<dyn RecommenderModel>],
    ) -> Result<ResultTable, EvaluationError> {
        let mut models: Vec<&mut dyn RecommenderModel> = models
            .iter_mut()
            .map(|model| model.as_mut() as &mut dyn RecommenderModel)
            .collect();

        self.evaluate(log, &mut models)
    }

    fn evaluate(
        &self,
        log: &Interactions,
        models: &mut [&mut dyn RecommenderModel],
    ) -> Result<ResultTable, EvaluationError> {
        let specs = self.config.validate()?;
        let max_k = specs.iter().map(|(k, _)| *k).max().unwrap_or(1);

        let start = Instant::now();
        let split = split(log, &self.config.split)?;

        info!(
            train = split.train.len(),
            test = split.test.len(),
            elapsed = ?start.elapsed(),
            "Split interactions"
        );

        let context = EvaluationContext {
            train: &split.train,
            test: &split.test,
            test_users: split.test.users(),
            engine: MetricEngine::new(&split.train),
            specs,
            max_k,
            filter_seen_items: self.config.filter_seen_items,
        };

        let rows = match self.config.num_threads {
            Some(num_threads) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(num_threads)
                    .build()
                    .map_err(|err| EvaluationError::InvalidArgument(err.to_string()))?;
                pool.install(|| evaluate_models(models, &context))
            }
            None => evaluate_models(models, &context),
        };

        Ok(ResultTable { rows })
    }
}

fn evaluate_models(
    models: &mut [&mut dyn RecommenderModel],
    context: &EvaluationContext<'_>,
) -> Vec<ResultRow> {
    models
        .par_iter_mut()
        .map(|model| {
            let name = model.name().to_owned();

            match evaluate_model(&mut **model, context) {
                Ok(rows) => rows,
                Err(err) => {
                    warn!(model = %name, error = %err, "Model evaluation failed");
                    vec![ResultRow::failed(&name, &err)]
                }
            }
        })
        .collect::<Vec<_>>()
        .into_iter()
        .flatten()
        .collect()
}

fn evaluate_model(
    model: &mut dyn RecommenderModel,
    context: &EvaluationContext<'_>,
) -> Result<Vec<ResultRow>, EvaluationError> {
    let name = model.name().to_owned();

    let start = Instant::now();
    model.fit(context.train)?;
    info!(model = %name, elapsed = ?start.elapsed(), "Fitted model");

    let start = Instant::now();
    let recommendations =
        model.predict(&context.test_users, context.max_k, context.filter_seen_items)?;
    info!(
        model = %name,
        num_users = recommendations.len(),
        elapsed = ?start.elapsed(),
        "Predicted recommendations"
    );

    let mut rows = Vec::new();

    for (k, specs) in &context.specs {
        let truncated = recommendations.truncate(*k);
        let result = context.engine.compute(&truncated, context.test, specs)?;

        for spec in specs {
            let value = result.aggregate(&spec.name());
            debug!(model = %name, metric = %spec.name(), value = ?value, "Scored model");
            rows.push(ResultRow::metric(&name, spec, value));
        }
    }

    Ok(rows)
}
