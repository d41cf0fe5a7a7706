use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use mmx_core::{MmxError, RunDescriptor};
use serde::Serialize;
use tracing::{debug, info};

use crate::execute::{list_trials, Trial, TrialState};
use crate::maxent::RESULTS_FILE;
use crate::RunLayout;

pub const CONTRIBUTION_MARKER: &str = "permutation";
pub const TOP_K: usize = 10;

/// Predictor base name to every contribution value seen for it.
pub type ContributionTable = BTreeMap<String, Vec<f64>>;

/// What the mean of a predictor with no samples should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmptySamplePolicy {
    /// Mean is 0.0 and the predictor still ranks.
    #[default]
    Zero,
    Exclude,
}

impl FromStr for EmptySamplePolicy {
    type Err = MmxError;

    fn from_str(raw: &str) -> mmx_core::Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "zero" => Ok(EmptySamplePolicy::Zero),
            "exclude" => Ok(EmptySamplePolicy::Exclude),
            other => Err(MmxError::invalid_input(format!(
                "unknown empty-sample policy '{}' (expected zero or exclude)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectOptions {
    pub top_k: usize,
    pub marker: String,
    pub empty_policy: EmptySamplePolicy,
}

impl Default for SelectOptions {
    fn default() -> Self {
        Self {
            top_k: TOP_K,
            marker: CONTRIBUTION_MARKER.to_string(),
            empty_policy: EmptySamplePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedPredictor {
    pub name: String,
    pub mean: f64,
    pub samples: usize,
}

/// Adds every `marker` column of one results table to `table`.
pub fn accumulate_results_file(
    table: &mut ContributionTable,
    path: &Path,
    marker: &str,
) -> mmx_core::Result<()> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;
    let columns: Vec<(usize, String)> = reader
        .headers()?
        .iter()
        .enumerate()
        .filter_map(|(idx, header)| {
            let (base, _) = header.split_once(marker)?;
            let base = base.trim();
            (!base.is_empty()).then(|| (idx, base.to_string()))
        })
        .collect();
    debug!(path = %path.display(), columns = columns.len(), "contribution columns");

    for (row, rec) in reader.records().enumerate() {
        let rec = rec?;
        for (idx, name) in &columns {
            let Some(cell) = rec.get(*idx).map(str::trim).filter(|c| !c.is_empty()) else {
                continue;
            };
            let value = cell
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| {
                    MmxError::invalid_input(format!(
                        "{} row {}: '{}' is not a number",
                        path.display(),
                        row + 2,
                        cell
                    ))
                })?;
            table.entry(name.clone()).or_default().push(value);
        }
    }
    Ok(())
}

/// Contributions across every Complete trial; other trials are ignored.
pub fn aggregate(trials: &[Trial], marker: &str) -> mmx_core::Result<ContributionTable> {
    let mut table = ContributionTable::new();
    for trial in trials {
        if trial.state() != Some(TrialState::Complete) {
            continue;
        }
        let results = trial.results_dir().join(RESULTS_FILE);
        accumulate_results_file(&mut table, &results, marker)?;
    }
    Ok(table)
}

pub fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len().max(1) as f64
}

/// Highest mean first. Equal means keep name order.
pub fn rank(
    table: &ContributionTable,
    top_k: usize,
    policy: EmptySamplePolicy,
) -> Vec<RankedPredictor> {
    let mut ranked: Vec<RankedPredictor> = table
        .iter()
        .filter(|(_, values)| !(values.is_empty() && policy == EmptySamplePolicy::Exclude))
        .map(|(name, values)| RankedPredictor {
            name: name.clone(),
            mean: mean(values),
            samples: values.len(),
        })
        .collect();
    ranked.sort_by(|a, b| b.mean.total_cmp(&a.mean));
    ranked.truncate(top_k);
    ranked
}

pub fn select_top_predictors(
    descriptor: &mut RunDescriptor,
    layout: &RunLayout,
    options: &SelectOptions,
) -> Result<Vec<RankedPredictor>> {
    let trials = list_trials(&layout.trials_dir)?;
    let completed = trials
        .iter()
        .filter(|t| t.state() == Some(TrialState::Complete))
        .count();
    if completed == 0 {
        return Err(MmxError::NoTrialsFound(layout.trials_dir.clone()).into());
    }

    let table = aggregate(&trials, &options.marker)?;
    let ranked = rank(&table, options.top_k, options.empty_policy);
    for (pos, r) in ranked.iter().enumerate() {
        info!(
            rank = pos + 1,
            predictor = %r.name,
            mean = r.mean,
            samples = r.samples,
            "top predictor"
        );
    }
    info!(completed, candidates = table.len(), "ranked predictors");

    let paths = ranked
        .iter()
        .map(|r| layout.asc_dir.join(format!("{}.asc", r.name)))
        .collect();
    descriptor.set_top_predictors(paths);
    descriptor.persist()?;
    Ok(ranked)
}
