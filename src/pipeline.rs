//! End-to-end run for one metric: trace → winners → labels → dataset →
//! search → report.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::config::Config;
use crate::dataset::ChunkDataset;
use crate::error::{Result, TunerError};
use crate::metric::MetricDefinition;
use crate::model::{ExecutionContext, MlpBuilder, ModelBuilder, TrainableModel};
use crate::search::{
    AshaScheduler, SearchController, SearchOutcome, SearchReport, TrainingData, TrialConfig,
};
use crate::trace::{read_trace, TraceRecord};
use crate::vocab::{LabelFile, LabelVocabulary};
use crate::winners::Winners;

/// What to run besides the configured metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Run every known metric instead of only the configured one.
    pub all_metrics: bool,
    /// Stop after exporting the label file.
    pub labels_only: bool,
}

/// Artifacts produced for one metric.
#[derive(Debug)]
pub struct RunReport {
    pub metric: MetricDefinition,
    pub winners: usize,
    pub label_path: PathBuf,
    /// `None` when only labels were exported.
    pub search: Option<SearchReport>,
    pub report_path: Option<PathBuf>,
    pub model_path: Option<PathBuf>,
}

#[derive(Serialize)]
struct ModelExport<'a> {
    metric: &'a str,
    labels: &'a [String],
    input_dim: usize,
    config: TrialConfig,
    model: serde_json::Value,
}

/// Read the trace once and run each requested metric over it.
pub fn run(config: &Config, options: RunOptions) -> Result<Vec<RunReport>> {
    config.validate()?;
    let records = read_trace(&config.paths.trace)?;

    let metrics = config.metrics(options.all_metrics);

    let builder: Arc<dyn ModelBuilder> = Arc::new(MlpBuilder);
    let mut reports = Vec::with_capacity(metrics.len());
    for metric in &metrics {
        if options.all_metrics && !records.iter().any(|r| r.metric_name == metric.name) {
            log::warn!("Trace has no '{}' rows, skipping", metric);
            continue;
        }
        log::info!("=== {} ===", metric);
        reports.push(run_metric(
            config,
            metric,
            &records,
            options.labels_only,
            Arc::clone(&builder),
        )?);
    }
    Ok(reports)
}

pub fn run_metric(
    config: &Config,
    metric: &MetricDefinition,
    records: &[TraceRecord],
    labels_only: bool,
    builder: Arc<dyn ModelBuilder>,
) -> Result<RunReport> {
    let winners = Winners::select(records, metric, config.min_size);
    if winners.is_empty() {
        return Err(TunerError::config(format!(
            "no trace row for '{}' is larger than {} bytes",
            metric, config.min_size
        )));
    }

    let vocab = vocabulary(config, metric, &winners)?;
    log::info!(
        "{} winning chunks across {} classes",
        winners.len(),
        vocab.len()
    );
    for (label, count) in winners.label_counts() {
        log::info!("  {:<24} {}", label, count);
    }

    fs::create_dir_all(&config.paths.output_dir)
        .map_err(|e| TunerError::io(&config.paths.output_dir, e))?;
    let label_path = config.label_path(metric);
    vocab.export(&label_path, &metric.name, config.feature_dim)?;

    if labels_only {
        return Ok(RunReport {
            metric: metric.clone(),
            winners: winners.len(),
            label_path,
            search: None,
            report_path: None,
            model_path: None,
        });
    }

    let dataset = ChunkDataset::load(&winners, &vocab, &config.paths.chunks, config.feature_dim)?;
    let data = Arc::new(TrainingData::prepare(
        dataset,
        config.validation_fraction,
        config.seed,
    )?);

    let controller = SearchController::new(
        config.search_space.clone(),
        config.budget(),
        config.resources(),
        Box::new(AshaScheduler::new(config.asha())?),
        builder,
    )
    .with_seed(config.seed)
    .with_context(ExecutionContext::select(config.accelerator_per_trial))
    .with_decision_timeout(config.decision_timeout());

    let outcome = controller.search(Arc::clone(&data))?;

    let shape = data.shape();
    let report = SearchReport::new(metric, data.dataset().len(), shape.num_classes, &outcome);
    report.log_table();
    let report_path = config.report_path(metric);
    report.write(&report_path)?;

    let model_path = export_model(config, metric, &vocab, &outcome)?;

    Ok(RunReport {
        metric: metric.clone(),
        winners: winners.len(),
        label_path,
        search: Some(report),
        report_path: Some(report_path),
        model_path,
    })
}

/// A fresh vocabulary, or the persisted one if the config names it.
fn vocabulary(
    config: &Config,
    metric: &MetricDefinition,
    winners: &Winners,
) -> Result<LabelVocabulary> {
    let Some(path) = &config.paths.vocabulary else {
        return Ok(LabelVocabulary::build(winners));
    };

    let file = LabelFile::load(path)?;
    if file.metric_name != metric.name {
        return Err(TunerError::config(format!(
            "label file {} is for '{}', not '{}'",
            path.display(),
            file.metric_name,
            metric.name
        )));
    }
    if file.input_dim != config.feature_dim {
        return Err(TunerError::config(format!(
            "label file {} expects {} features, configured {}",
            path.display(),
            file.input_dim,
            config.feature_dim
        )));
    }
    log::info!(
        "Reusing {} labels from {}",
        file.vocabulary.len(),
        path.display()
    );
    Ok(file.vocabulary)
}

fn export_model(
    config: &Config,
    metric: &MetricDefinition,
    vocab: &LabelVocabulary,
    outcome: &SearchOutcome,
) -> Result<Option<PathBuf>> {
    let Some(model) = outcome.model.as_deref() else {
        log::warn!("Best trial kept no model; nothing to export");
        return Ok(None);
    };

    let snapshot = snapshot(model)?;
    let export = ModelExport {
        metric: &metric.name,
        labels: vocab.labels(),
        input_dim: config.feature_dim,
        config: outcome.best.config,
        model: snapshot,
    };
    let json = serde_json::to_string(&export).map_err(|e| TunerError::Serialization {
        what: "model".to_string(),
        message: e.to_string(),
    })?;

    let path = config.model_path(metric);
    fs::write(&path, json).map_err(|e| TunerError::io(&path, e))?;
    log::info!("Wrote best model to {}", path.display());
    Ok(Some(path))
}

fn snapshot(model: &dyn TrainableModel) -> Result<serde_json::Value> {
    model.snapshot().map_err(|e| TunerError::Serialization {
        what: "model".to_string(),
        message: e.to_string(),
    })
}
