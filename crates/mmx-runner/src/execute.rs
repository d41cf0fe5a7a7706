use std::fmt;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use mmx_core::{ensure_dir, MmxError, Result};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::maxent::{ModelingTool, RESULTS_FILE};

pub const TRIAL_PREFIX: &str = "trial-";
pub const RESULTS_DIR: &str = "results";
pub const ASC_DIR: &str = "asc";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialState {
    Pending,
    Running,
    Complete,
    Failed,
}

impl TrialState {
    /// Lookup order when more than one flag is present.
    pub const PRECEDENCE: [TrialState; 4] = [
        TrialState::Running,
        TrialState::Pending,
        TrialState::Failed,
        TrialState::Complete,
    ];

    pub fn flag_file(&self) -> &'static str {
        match self {
            TrialState::Pending => "pending.state",
            TrialState::Running => "running.state",
            TrialState::Complete => "complete.state",
            TrialState::Failed => "failed.state",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrialState::Pending => "pending",
            TrialState::Running => "running",
            TrialState::Complete => "complete",
            TrialState::Failed => "failed",
        }
    }
}

impl fmt::Display for TrialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trial {
    pub index: usize,
    pub dir: PathBuf,
}

impl Trial {
    pub fn new(index: usize, dir: PathBuf) -> Self {
        Self { index, dir }
    }

    pub fn in_dir(trials_dir: &Path, index: usize) -> Self {
        Self::new(index, trials_dir.join(format!("{}{}", TRIAL_PREFIX, index)))
    }

    pub fn flag_path(&self, state: TrialState) -> PathBuf {
        self.dir.join(state.flag_file())
    }

    pub fn results_dir(&self) -> PathBuf {
        self.dir.join(RESULTS_DIR)
    }

    pub fn asc_dir(&self) -> PathBuf {
        self.dir.join(ASC_DIR)
    }

    pub fn state(&self) -> Option<TrialState> {
        TrialState::PRECEDENCE
            .into_iter()
            .find(|s| self.flag_path(*s).exists())
    }

    /// Takes the trial out of Pending. The rename is the lock: of several
    /// concurrent claimers exactly one sees it succeed.
    pub fn claim(&self) -> Result<Option<TrialClaim<'_>>> {
        match fs::rename(
            self.flag_path(TrialState::Pending),
            self.flag_path(TrialState::Running),
        ) {
            Ok(()) => Ok(Some(TrialClaim {
                trial: self,
                finished: false,
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Exclusive hold on a Running trial. Dropping it unfinished leaves the
/// running flag in place for an operator to inspect and reset.
pub struct TrialClaim<'a> {
    trial: &'a Trial,
    finished: bool,
}

impl TrialClaim<'_> {
    pub fn trial(&self) -> &Trial {
        self.trial
    }

    pub fn complete(mut self) -> Result<()> {
        self.settle(TrialState::Complete)
    }

    pub fn fail(mut self, reason: &str) -> Result<()> {
        warn!(trial = self.trial.index, reason, "trial failed");
        self.settle(TrialState::Failed)
    }

    fn settle(&mut self, state: TrialState) -> Result<()> {
        fs::rename(
            self.trial.flag_path(TrialState::Running),
            self.trial.flag_path(state),
        )?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for TrialClaim<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                trial = self.trial.index,
                dir = %self.trial.dir.display(),
                "trial left in running state"
            );
        }
    }
}

fn touch(path: &Path) -> Result<()> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Clears results and flags and makes the trial claimable again.
pub fn reset_trial(trial: &Trial) -> Result<()> {
    let results = trial.results_dir();
    if results.exists() {
        fs::remove_dir_all(&results)?;
    }
    for state in TrialState::PRECEDENCE {
        remove_if_exists(&trial.flag_path(state))?;
    }
    touch(&trial.flag_path(TrialState::Pending))
}

pub fn reset_trials(trials_dir: &Path) -> Result<usize> {
    let trials = list_trials(trials_dir)?;
    for trial in &trials {
        reset_trial(trial)?;
    }
    info!(count = trials.len(), dir = %trials_dir.display(), "reset trials");
    Ok(trials.len())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrialSelection {
    #[default]
    All,
    /// Inclusive on both ends.
    Range { start: usize, end: usize },
}

impl FromStr for TrialSelection {
    type Err = MmxError;

    fn from_str(raw: &str) -> Result<Self> {
        let bad = || MmxError::invalid_input(format!("trial range '{}' must look like a-b", raw));
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("all") {
            return Ok(TrialSelection::All);
        }
        let (a, b) = trimmed.split_once('-').ok_or_else(bad)?;
        let start = a.trim().parse::<usize>().map_err(|_| bad())?;
        let end = b.trim().parse::<usize>().map_err(|_| bad())?;
        if start > end {
            return Err(MmxError::invalid_input(format!(
                "trial range '{}' starts after it ends",
                raw
            )));
        }
        Ok(TrialSelection::Range { start, end })
    }
}

impl fmt::Display for TrialSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrialSelection::All => f.write_str("all"),
            TrialSelection::Range { start, end } => write!(f, "{}-{}", start, end),
        }
    }
}

fn trial_index(name: &str) -> Option<usize> {
    name.strip_prefix(TRIAL_PREFIX)?.parse().ok()
}

/// Every `trial-<i>` directory under `trials_dir`, ordered by index.
pub fn list_trials(trials_dir: &Path) -> Result<Vec<Trial>> {
    if !trials_dir.is_dir() {
        return Err(MmxError::NoTrialsFound(trials_dir.to_path_buf()));
    }
    let mut trials = Vec::new();
    for entry in WalkDir::new(trials_dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| MmxError::Io(e.into()))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        if let Some(index) = entry.file_name().to_str().and_then(trial_index) {
            trials.push(Trial::new(index, entry.path().to_path_buf()));
        }
    }
    trials.sort_by_key(|t| t.index);
    Ok(trials)
}

pub fn select_trials(trials_dir: &Path, selection: &TrialSelection) -> Result<Vec<Trial>> {
    let all = list_trials(trials_dir)?;
    if all.is_empty() {
        return Err(MmxError::NoTrialsFound(trials_dir.to_path_buf()));
    }
    match selection {
        TrialSelection::All => Ok(all),
        TrialSelection::Range { start, end } => (*start..=*end)
            .map(|index| {
                all.iter()
                    .find(|t| t.index == index)
                    .cloned()
                    .ok_or_else(|| MmxError::TrialNotFound {
                        index,
                        trials_dir: trials_dir.to_path_buf(),
                    })
            })
            .collect(),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrialRunSummary {
    pub ran: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Runs each claimable trial in turn. Trials that are not Pending are
/// skipped, so a repeated call does no work.
pub fn run_trials(
    trials: &[Trial],
    samples_name: &str,
    tool: &dyn ModelingTool,
) -> Result<TrialRunSummary> {
    let mut summary = TrialRunSummary::default();
    for trial in trials {
        let Some(claim) = trial.claim()? else {
            debug!(trial = trial.index, state = ?trial.state(), "not claimable, skipping");
            summary.skipped += 1;
            continue;
        };

        info!(trial = trial.index, dir = %trial.dir.display(), "running trial");
        let results = trial.results_dir();
        let outcome = ensure_dir(&results)
            .and_then(|_| tool.run_model(&trial.dir.join(samples_name), &trial.asc_dir(), &results))
            .and_then(|_| {
                let expected = results.join(RESULTS_FILE);
                if expected.is_file() {
                    Ok(())
                } else {
                    Err(MmxError::ExternalTool {
                        command: "modeling tool".to_string(),
                        reason: format!("{} was not produced", expected.display()),
                    })
                }
            });

        match outcome {
            Ok(()) => {
                claim.complete()?;
                summary.ran += 1;
            }
            Err(e) => {
                claim.fail(&e.to_string())?;
                summary.failed += 1;
            }
        }
    }
    info!(
        ran = summary.ran,
        skipped = summary.skipped,
        failed = summary.failed,
        "trial run finished"
    );
    Ok(summary)
}

#[derive(Debug, Clone, Serialize)]
pub struct TrialStatus {
    pub index: usize,
    pub dir: PathBuf,
    pub state: Option<TrialState>,
}

pub fn trial_status(trials_dir: &Path) -> Result<Vec<TrialStatus>> {
    Ok(list_trials(trials_dir)?
        .into_iter()
        .map(|t| TrialStatus {
            state: t.state(),
            index: t.index,
            dir: t.dir,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct WritesResults {
        calls: Cell<usize>,
    }

    impl ModelingTool for WritesResults {
        fn run_model(&self, _samples: &Path, _env: &Path, out_dir: &Path) -> Result<()> {
            self.calls.set(self.calls.get() + 1);
            fs::write(out_dir.join(RESULTS_FILE), "Species,a permutation importance\ns,1\n")?;
            Ok(())
        }
    }

    struct ProducesNothing;

    impl ModelingTool for ProducesNothing {
        fn run_model(&self, _samples: &Path, _env: &Path, _out: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn make_trials(root: &Path, count: usize) -> Vec<Trial> {
        (0..count)
            .map(|i| {
                let trial = Trial::in_dir(root, i);
                fs::create_dir_all(&trial.dir).expect("trial dir");
                reset_trial(&trial).expect("pending");
                trial
            })
            .collect()
    }

    #[test]
    fn parses_ranges() {
        assert_eq!(
            "0-3".parse::<TrialSelection>().expect("range"),
            TrialSelection::Range { start: 0, end: 3 }
        );
        assert_eq!(
            " 2 - 2 ".parse::<TrialSelection>().expect("spaces"),
            TrialSelection::Range { start: 2, end: 2 }
        );
        assert_eq!("all".parse::<TrialSelection>().expect("all"), TrialSelection::All);
        assert!("3".parse::<TrialSelection>().is_err());
        assert!("4-1".parse::<TrialSelection>().is_err());
        assert!("a-b".parse::<TrialSelection>().is_err());
    }

    #[test]
    fn claim_is_exclusive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let trials = make_trials(dir.path(), 1);
        let trial = &trials[0];

        let first = trial.claim().expect("claim").expect("claimable");
        assert_eq!(trial.state(), Some(TrialState::Running));
        assert!(trial.claim().expect("second claim").is_none());
        first.complete().expect("complete");
        assert_eq!(trial.state(), Some(TrialState::Complete));
        assert!(trial.claim().expect("third claim").is_none());
    }

    #[test]
    fn dropped_claim_stays_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let trials = make_trials(dir.path(), 1);
        {
            let _claim = trials[0].claim().expect("claim").expect("claimable");
        }
        assert_eq!(trials[0].state(), Some(TrialState::Running));
        reset_trial(&trials[0]).expect("reset");
        assert_eq!(trials[0].state(), Some(TrialState::Pending));
    }

    #[test]
    fn running_flag_takes_precedence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let trials = make_trials(dir.path(), 1);
        touch(&trials[0].flag_path(TrialState::Complete)).expect("complete flag");
        touch(&trials[0].flag_path(TrialState::Running)).expect("running flag");
        assert_eq!(trials[0].state(), Some(TrialState::Running));
    }

    #[test]
    fn missing_range_member_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        make_trials(dir.path(), 2);
        let err = select_trials(dir.path(), &TrialSelection::Range { start: 3, end: 3 })
            .expect_err("trial 3 missing");
        assert!(matches!(err, MmxError::TrialNotFound { index: 3, .. }));

        let picked = select_trials(dir.path(), &TrialSelection::Range { start: 1, end: 1 })
            .expect("trial 1");
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].index, 1);
    }

    #[test]
    fn empty_trials_dir_has_no_trials() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir(dir.path().join("notes")).expect("other dir");
        let err = select_trials(dir.path(), &TrialSelection::All).expect_err("empty");
        assert!(matches!(err, MmxError::NoTrialsFound(_)));
        let err = select_trials(&dir.path().join("absent"), &TrialSelection::All)
            .expect_err("absent");
        assert!(matches!(err, MmxError::NoTrialsFound(_)));
    }

    #[test]
    fn listing_orders_numerically() {
        let dir = tempfile::tempdir().expect("tempdir");
        for i in [10, 2, 1] {
            fs::create_dir(dir.path().join(format!("trial-{}", i))).expect("dir");
        }
        fs::create_dir(dir.path().join("trial-x")).expect("dir");
        let indices: Vec<usize> = list_trials(dir.path())
            .expect("list")
            .iter()
            .map(|t| t.index)
            .collect();
        assert_eq!(indices, vec![1, 2, 10]);
    }

    #[test]
    fn second_run_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let trials = make_trials(dir.path(), 3);
        let tool = WritesResults { calls: Cell::new(0) };

        let first = run_trials(&trials, "pts.csv", &tool).expect("first run");
        assert_eq!(first, TrialRunSummary { ran: 3, skipped: 0, failed: 0 });
        let second = run_trials(&trials, "pts.csv", &tool).expect("second run");
        assert_eq!(second, TrialRunSummary { ran: 0, skipped: 3, failed: 0 });
        assert_eq!(tool.calls.get(), 3);
        assert!(trials.iter().all(|t| t.state() == Some(TrialState::Complete)));
    }

    #[test]
    fn missing_output_marks_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let trials = make_trials(dir.path(), 1);
        let summary = run_trials(&trials, "pts.csv", &ProducesNothing).expect("run");
        assert_eq!(summary.failed, 1);
        assert_eq!(trials[0].state(), Some(TrialState::Failed));

        assert_eq!(reset_trials(dir.path()).expect("reset"), 1);
        assert!(!trials[0].results_dir().exists());
        assert_eq!(trials[0].state(), Some(TrialState::Pending));
        assert!(!trials[0].flag_path(TrialState::Failed).exists());
    }
}
