use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use mmx_core::{
    atomic_write_bytes, atomic_write_json_pretty, ensure_dir, has_extension, MmxError,
    RunDescriptor,
};
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use crate::execute::{list_trials, reset_trial, Trial, TrialState};
use crate::maxent::{copy_asc_files, write_samples_file};
use crate::RunLayout;

pub const PREDICTORS_PER_TRIAL: usize = 10;
pub const TRIAL_RECORD_FILE: &str = "trial.json";
/// Zero-based column holding the presence/absence label.
pub const LABEL_COLUMN: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialPlanOptions {
    pub predictors_per_trial: usize,
}

impl Default for TrialPlanOptions {
    fn default() -> Self {
        Self {
            predictors_per_trial: PREDICTORS_PER_TRIAL,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedTrial {
    pub index: usize,
    pub dir: PathBuf,
    pub predictors: Vec<PathBuf>,
}

/// `trial_count` independent draws of `per_trial` distinct indices from
/// `[0, candidate_count)`. Draws may repeat across trials.
pub fn generate_trial_assignments<R: Rng + ?Sized>(
    candidate_count: usize,
    trial_count: usize,
    per_trial: usize,
    rng: &mut R,
) -> mmx_core::Result<Vec<Vec<usize>>> {
    if per_trial == 0 {
        return Err(MmxError::invalid_input("a trial needs at least one predictor"));
    }
    if per_trial > candidate_count {
        return Err(MmxError::invalid_input(format!(
            "cannot draw {} predictors per trial from {} candidates",
            per_trial, candidate_count
        )));
    }
    Ok((0..trial_count)
        .map(|_| rand::seq::index::sample(rng, candidate_count, per_trial).into_vec())
        .collect())
}

/// Copies the header row of `src` and every row labelled 1.0 into `dst`.
/// Returns the number of data rows kept. `src` and `dst` may be the same file.
pub fn strip_non_positive_points(src: &Path, dst: &Path) -> mmx_core::Result<usize> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(src)?;
    let mut buf = Vec::new();
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(&mut buf);

    let mut kept = 0;
    for (idx, rec) in reader.records().enumerate() {
        let rec = rec?;
        if idx == 0 {
            writer.write_record(&rec)?;
            continue;
        }
        if rec.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        let label = rec.get(LABEL_COLUMN).ok_or_else(|| {
            MmxError::invalid_input(format!(
                "row {} of {} has no label column",
                idx + 1,
                src.display()
            ))
        })?;
        let label: f64 = label.trim().parse().map_err(|_| {
            MmxError::invalid_input(format!(
                "row {} of {}: unparseable label '{}'",
                idx + 1,
                src.display(),
                label
            ))
        })?;
        if label == 1.0 {
            writer.write_record(&rec)?;
            kept += 1;
        }
    }
    writer.flush()?;
    drop(writer);
    atomic_write_bytes(dst, &buf)?;
    Ok(kept)
}

/// `.tif` files directly under `dir`, sorted by name.
pub fn list_predictors(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in walkdir::WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
        if entry.file_type().is_file() && has_extension(entry.path(), "tif") {
            found.push(entry.into_path());
        }
    }
    found.sort();
    Ok(found)
}

/// Gives the run its own presence file under `<out>/PRESENCE` with absence
/// rows removed, and points the descriptor at it. The source file is only
/// read. A descriptor already pointing at the staged copy is left alone.
fn stage_presence_file(descriptor: &mut RunDescriptor, layout: &RunLayout) -> Result<PathBuf> {
    let source = descriptor
        .presence_file()
        .ok_or_else(|| MmxError::invalid_config("presence point file is not set"))?
        .to_path_buf();
    let name = source
        .file_name()
        .ok_or_else(|| MmxError::invalid_config("presence point file has no name"))?;
    ensure_dir(&layout.presence_dir)?;
    let working = layout.presence_dir.join(name);

    let already_staged = match (fs::canonicalize(&source), fs::canonicalize(&working)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    };
    if already_staged {
        debug!(path = %working.display(), "presence points already staged");
        return Ok(working);
    }

    let kept = strip_non_positive_points(&source, &working)?;
    info!(
        source = %source.display(),
        path = %working.display(),
        kept,
        "staged presence points"
    );
    descriptor.set_presence_file(Some(&working))?;
    descriptor.persist()?;
    Ok(working)
}

/// Removes every `trial-<i>` directory of an earlier plan. Refuses while any
/// trial is still running.
fn clear_previous_plan(trials_dir: &Path) -> Result<usize> {
    let previous = match list_trials(trials_dir) {
        Ok(trials) => trials,
        Err(MmxError::NoTrialsFound(_)) => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    if let Some(busy) = previous
        .iter()
        .find(|t| t.state() == Some(TrialState::Running))
    {
        return Err(MmxError::invalid_config(format!(
            "trial {} is still running in {}; reset it before planning again",
            busy.index,
            busy.dir.display()
        ))
        .into());
    }
    for trial in &previous {
        fs::remove_dir_all(&trial.dir)
            .with_context(|| format!("failed to clear {}", trial.dir.display()))?;
    }
    if !previous.is_empty() {
        info!(count = previous.len(), dir = %trials_dir.display(), "cleared previous trial plan");
    }
    Ok(previous.len())
}

pub fn prepare_trials<R: Rng + ?Sized>(
    descriptor: &mut RunDescriptor,
    layout: &RunLayout,
    options: &TrialPlanOptions,
    rng: &mut R,
) -> Result<Vec<PlannedTrial>> {
    let predictors = list_predictors(&layout.finished_dir)?;
    let trial_count = usize::try_from(descriptor.num_trials()).unwrap_or(0);
    let assignments = generate_trial_assignments(
        predictors.len(),
        trial_count,
        options.predictors_per_trial,
        rng,
    )
    .with_context(|| format!("planning trials from {}", layout.finished_dir.display()))?;

    let presence = stage_presence_file(descriptor, layout)?;
    clear_previous_plan(&layout.trials_dir)?;
    ensure_dir(&layout.trials_dir)?;
    let species = descriptor.species().to_string();

    let mut planned = Vec::with_capacity(assignments.len());
    for (index, picks) in assignments.into_iter().enumerate() {
        let trial = Trial::in_dir(&layout.trials_dir, index);
        ensure_dir(&trial.dir)?;
        let chosen: Vec<PathBuf> = picks.iter().map(|&i| predictors[i].clone()).collect();

        let record = json!({
            "schema_version": "trial_plan_v1",
            "index": index,
            "predictors": chosen
                .iter()
                .filter_map(|p| p.file_name())
                .map(|n| n.to_string_lossy().to_string())
                .collect::<Vec<_>>(),
        });
        atomic_write_json_pretty(&trial.dir.join(TRIAL_RECORD_FILE), &record)?;
        write_samples_file(&presence, &species, &trial.dir)?;
        let asc_dir = trial.asc_dir();
        ensure_dir(&asc_dir)?;
        copy_asc_files(&chosen, &asc_dir)
            .with_context(|| format!("populating {}", asc_dir.display()))?;

        // Claimable only once everything it needs is on disk.
        reset_trial(&trial)?;
        planned.push(PlannedTrial {
            index,
            dir: trial.dir,
            predictors: chosen,
        });
    }
    info!(
        trials = planned.len(),
        candidates = predictors.len(),
        per_trial = options.predictors_per_trial,
        "prepared trials"
    );
    Ok(planned)
}
