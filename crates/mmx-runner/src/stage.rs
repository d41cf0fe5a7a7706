use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use mmx_core::{BoundingBox, MmxError, PresencePoints, RunDescriptor, RunState};
use tracing::{error, info};

use crate::acquire::{acquire_predictors, AcquireOptions};
use crate::execute::{run_trials, select_trials, TrialSelection};
use crate::images::prepare_images;
use crate::maxent::{MaxEntTool, ModelingTool};
use crate::modeler::run_final_model;
use crate::raster::RasterTool;
use crate::selector::{select_top_predictors, SelectOptions};
use crate::trials::{prepare_trials, TrialPlanOptions};
use crate::wrangler::WranglerSettings;

pub const CONFIGURE_PHASE: &str = "configure";
pub const LOG_FILE_NAME: &str = "mmx.log";

/// Working directories of one run, derived from its descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    pub raw_dir: PathBuf,
    pub clip_reproj_dir: PathBuf,
    pub finished_dir: PathBuf,
    pub asc_dir: PathBuf,
    pub presence_dir: PathBuf,
    pub trials_dir: PathBuf,
    pub final_dir: PathBuf,
    pub log_file: PathBuf,
}

impl RunLayout {
    pub fn new(descriptor: &RunDescriptor) -> Self {
        let input = descriptor.input_dir();
        let output = descriptor.output_dir();
        let finished_dir = input.join("FINISHED");
        Self {
            raw_dir: input.join("RAW_MERRA"),
            clip_reproj_dir: input.join("CLIP_REPROJ"),
            asc_dir: finished_dir.join("asc"),
            finished_dir,
            presence_dir: output.join("PRESENCE"),
            trials_dir: output.join("TRIALS"),
            final_dir: output.join("FINAL_MODEL"),
            log_file: output.join(LOG_FILE_NAME),
        }
    }
}

/// External programs a run drives.
pub struct Toolchain {
    pub raster: RasterTool,
    pub modeler: Box<dyn ModelingTool>,
    pub wrangler: WranglerSettings,
}

impl Toolchain {
    pub fn from_env() -> Self {
        Self {
            raster: RasterTool::from_env(),
            modeler: Box::new(MaxEntTool::from_env()),
            wrangler: WranglerSettings::from_env(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    Acquire(AcquireOptions),
    PrepareImages,
    PrepareTrials(TrialPlanOptions),
    RunTrials(TrialSelection),
    Select(SelectOptions),
    Model,
}

impl Stage {
    pub fn phase_name(&self) -> &'static str {
        match self {
            Stage::Acquire(_) => "MERRA",
            Stage::PrepareImages => "PREP_IMAGES",
            Stage::PrepareTrials(_) => "PREPARE_TRIALS",
            Stage::RunTrials(_) => "RUN_TRIALS",
            Stage::Select(_) => "SELECTOR",
            Stage::Model => "MODELER",
        }
    }

    pub fn application_name(&self) -> &'static str {
        match self {
            Stage::Acquire(_) => "GetMerra",
            Stage::PrepareImages => "PrepareImages",
            Stage::PrepareTrials(_) => "PrepareTrials",
            Stage::RunTrials(_) => "RunTrials",
            Stage::Select(_) => "Selector",
            Stage::Model => "Modeler",
        }
    }

    /// Every stage in pipeline order, running all trials.
    pub fn pipeline(
        acquire: AcquireOptions,
        plan: TrialPlanOptions,
        select: SelectOptions,
    ) -> Vec<Stage> {
        vec![
            Stage::Acquire(acquire),
            Stage::PrepareImages,
            Stage::PrepareTrials(plan),
            Stage::RunTrials(TrialSelection::All),
            Stage::Select(select),
            Stage::Model,
        ]
    }

    /// Runs the stage under a [`PhaseRunner`] and hands the updated
    /// descriptor back.
    pub fn run(&self, descriptor: RunDescriptor, tools: &Toolchain) -> Result<RunDescriptor> {
        let mut runner =
            PhaseRunner::begin(descriptor, self.phase_name(), self.application_name())?;
        let outcome = self.execute(runner.descriptor_mut(), tools);
        runner.finish(outcome)
    }

    fn execute(&self, descriptor: &mut RunDescriptor, tools: &Toolchain) -> Result<()> {
        let layout = RunLayout::new(descriptor);
        match self {
            Stage::Acquire(options) => {
                let report = acquire_predictors(
                    descriptor,
                    &layout,
                    options,
                    &tools.raster,
                    &tools.wrangler,
                )?;
                info!(%report, "acquired predictors");
            }
            Stage::PrepareImages => {
                let report = prepare_images(descriptor, &layout, &tools.raster)?;
                info!(%report, "prepared images");
            }
            Stage::PrepareTrials(options) => {
                prepare_trials(descriptor, &layout, options, &mut rand::thread_rng())?;
            }
            Stage::RunTrials(selection) => {
                let samples = samples_file_name(descriptor)?;
                let trials = select_trials(&layout.trials_dir, selection)?;
                run_trials(&trials, &samples, tools.modeler.as_ref())?;
            }
            Stage::Select(options) => {
                select_top_predictors(descriptor, &layout, options)?;
            }
            Stage::Model => {
                let dir = run_final_model(descriptor, &layout, tools.modeler.as_ref())?;
                info!(dir = %dir.display(), "final model written");
            }
        }
        Ok(())
    }
}

/// Trial samples files carry the presence file's name.
fn samples_file_name(descriptor: &RunDescriptor) -> Result<String> {
    descriptor
        .presence_file()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| MmxError::invalid_config("presence point file is not set").into())
}

/// Brackets one phase: the descriptor is persisted as Running on entry and as
/// Complete or Failed on exit. Dropped without `finish`, it records Failed.
pub struct PhaseRunner {
    descriptor: RunDescriptor,
    application: &'static str,
    done: bool,
}

impl PhaseRunner {
    pub fn begin(
        mut descriptor: RunDescriptor,
        phase: &str,
        application: &'static str,
    ) -> Result<Self> {
        descriptor.set_phase(phase);
        descriptor.set_state(RunState::Running);
        descriptor
            .persist()
            .with_context(|| format!("failed to record start of {}", phase))?;
        info!("----------------------------------------");
        info!("{}", application);
        info!("{}", descriptor);
        Ok(Self {
            descriptor,
            application,
            done: false,
        })
    }

    pub fn descriptor_mut(&mut self) -> &mut RunDescriptor {
        &mut self.descriptor
    }

    /// Records the outcome and returns the descriptor, or the stage's error.
    pub fn finish(mut self, outcome: Result<()>) -> Result<RunDescriptor> {
        let state = if outcome.is_ok() {
            RunState::Complete
        } else {
            RunState::Failed
        };
        self.descriptor.set_state(state);
        let persisted = self.descriptor.persist();
        self.done = true;
        if let Err(e) = &outcome {
            error!(application = self.application, "{:#}", e);
        }
        outcome?;
        persisted.context("failed to record phase outcome")?;
        info!(application = self.application, state = %state, "phase finished");
        Ok(self.descriptor.clone())
    }
}

impl Drop for PhaseRunner {
    fn drop(&mut self) {
        if !self.done {
            self.descriptor.set_state(RunState::Failed);
            let _ = self.descriptor.persist();
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigureParams {
    pub presence_file: PathBuf,
    pub species: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub num_processes: i64,
    pub num_trials: i64,
}

/// Creates the run descriptor in the output directory from a presence file.
pub fn configure_run(params: &ConfigureParams) -> Result<RunDescriptor> {
    let mut descriptor = RunDescriptor::new();
    descriptor.set_num_processes(params.num_processes);
    descriptor.set_num_trials(params.num_trials);
    descriptor.set_date_window(params.start_date.as_deref(), params.end_date.as_deref())?;
    descriptor.set_input_dir(&params.input_dir)?;
    descriptor.set_output_dir(&params.output_dir)?;
    descriptor.set_presence_file(Some(&params.presence_file))?;
    descriptor.set_species(&params.species)?;

    let points = PresencePoints::read(&params.presence_file)?;
    let extent = BoundingBox::from_presence(&points)?;
    descriptor.set_extent(&extent).with_context(|| {
        format!(
            "presence points in {} do not span an area",
            params.presence_file.display()
        )
    })?;

    let runner = PhaseRunner::begin(descriptor, CONFIGURE_PHASE, "ConfigureMmxRun")?;
    runner.finish(Ok(()))
}

pub fn run_stage_from_file(
    config: &Path,
    stage: &Stage,
    tools: &Toolchain,
) -> Result<RunDescriptor> {
    let descriptor = RunDescriptor::load_from(config)
        .with_context(|| format!("failed to load run descriptor {}", config.display()))?;
    stage.run(descriptor, tools)
}

/// Runs `stages` in order, reloading the descriptor from disk for each.
/// Stops at the first failing stage.
pub fn run_pipeline(
    config: &Path,
    stages: &[Stage],
    tools: &Toolchain,
) -> Result<RunDescriptor> {
    let mut last = None;
    for stage in stages {
        last = Some(run_stage_from_file(config, stage, tools)?);
    }
    match last {
        Some(d) => Ok(d),
        None => RunDescriptor::load_from(config).map_err(Into::into),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    struct NeverCalled;

    impl ModelingTool for NeverCalled {
        fn run_model(&self, _: &Path, _: &Path, _: &Path) -> mmx_core::Result<()> {
            Err(MmxError::invalid_input("modeling tool should not run"))
        }
    }

    fn tools() -> Toolchain {
        Toolchain {
            raster: RasterTool::default(),
            modeler: Box::new(NeverCalled),
            wrangler: WranglerSettings::default(),
        }
    }

    fn params(root: &Path, points: &str) -> ConfigureParams {
        let presence = root.join("pts.csv");
        fs::write(&presence, points).expect("presence");
        ConfigureParams {
            presence_file: presence,
            species: "cheatgrass".to_string(),
            start_date: Some("01-01-2016".to_string()),
            end_date: Some("12-31-2016".to_string()),
            input_dir: root.to_path_buf(),
            output_dir: root.to_path_buf(),
            num_processes: 4,
            num_trials: 3,
        }
    }

    #[test]
    fn layout_follows_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("in");
        let output = dir.path().join("out");
        fs::create_dir_all(&input).expect("in");
        fs::create_dir_all(&output).expect("out");
        let mut d = RunDescriptor::new();
        d.set_input_dir(&input).expect("in");
        d.set_output_dir(&output).expect("out");

        let layout = RunLayout::new(&d);
        assert_eq!(layout.raw_dir, input.join("RAW_MERRA"));
        assert_eq!(layout.asc_dir, input.join("FINISHED").join("asc"));
        assert_eq!(layout.presence_dir, output.join("PRESENCE"));
        assert_eq!(layout.trials_dir, output.join("TRIALS"));
        assert_eq!(layout.final_dir, output.join("FINAL_MODEL"));
        assert_eq!(layout.log_file, output.join("mmx.log"));
    }

    #[test]
    fn pipeline_runs_every_phase_in_order() {
        let phases: Vec<&str> = Stage::pipeline(
            AcquireOptions::default(),
            TrialPlanOptions::default(),
            SelectOptions::default(),
        )
        .iter()
        .map(Stage::phase_name)
        .collect();
        assert_eq!(
            phases,
            ["MERRA", "PREP_IMAGES", "PREPARE_TRIALS", "RUN_TRIALS", "SELECTOR", "MODELER"]
        );
    }

    #[test]
    fn configure_persists_extent_and_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let p = params(dir.path(), "x,y,epsg:4326\n-120,35,1\n-110,45,1\n");
        let d = configure_run(&p).expect("configure");

        assert_eq!(d.phase(), CONFIGURE_PHASE);
        assert_eq!(d.state(), RunState::Complete);
        assert_eq!((d.ulx(), d.uly()), (Some(-120.0), Some(45.0)));
        assert_eq!((d.lrx(), d.lry()), (Some(-110.0), Some(35.0)));
        assert_eq!(d.epsg(), Some(4326));

        let loaded = RunDescriptor::load_from(&d.descriptor_path()).expect("load");
        assert_eq!(loaded, d);
    }

    #[test]
    fn single_point_extent_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let p = params(dir.path(), "x,y,epsg:4326\n-120,35,1\n");
        let err = configure_run(&p).expect_err("degenerate");
        assert!(matches!(
            err.downcast_ref::<MmxError>(),
            Some(MmxError::InvalidConfiguration(_))
        ));
        assert!(!dir.path().join("config.mmx").exists());
    }

    #[test]
    fn failing_stage_records_failed_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let d = configure_run(&params(dir.path(), "x,y,epsg:4326\n-120,35,1\n-110,45,1\n"))
            .expect("configure");
        let config = d.descriptor_path();

        let err = run_stage_from_file(&config, &Stage::Model, &tools()).expect_err("no ranking");
        assert!(err.to_string().contains("selector"), "{}", err);
        let after = RunDescriptor::load_from(&config).expect("load");
        assert_eq!(after.phase(), "MODELER");
        assert_eq!(after.state(), RunState::Failed);
    }

    #[test]
    fn dropped_runner_records_failed_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let d = configure_run(&params(dir.path(), "x,y,epsg:4326\n-120,35,1\n-110,45,1\n"))
            .expect("configure");
        let config = d.descriptor_path();
        {
            let _runner = PhaseRunner::begin(d, "SELECTOR", "Selector").expect("begin");
            let on_disk = RunDescriptor::load_from(&config).expect("load");
            assert_eq!(on_disk.state(), RunState::Running);
        }
        let after = RunDescriptor::load_from(&config).expect("load");
        assert_eq!(after.state(), RunState::Failed);
    }

    #[test]
    fn run_trials_without_trials_reports_none_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let d = configure_run(&params(dir.path(), "x,y,epsg:4326\n-120,35,1\n-110,45,1\n"))
            .expect("configure");
        let err = Stage::RunTrials(TrialSelection::All)
            .run(d, &tools())
            .expect_err("no trials");
        assert!(matches!(
            err.downcast_ref::<MmxError>(),
            Some(MmxError::NoTrialsFound(_))
        ));
    }
}
