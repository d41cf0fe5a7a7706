pub mod acquire;
pub mod execute;
pub mod images;
pub mod logging;
pub mod maxent;
pub mod modeler;
pub mod raster;
pub mod selector;
pub mod stage;
pub mod trials;
pub mod wrangler;

pub use acquire::AcquireOptions;
pub use execute::{
    reset_trial, reset_trials, run_trials, select_trials, trial_status, Trial, TrialRunSummary,
    TrialSelection, TrialState, TrialStatus,
};
pub use maxent::{MaxEntTool, ModelingTool};
pub use raster::RasterTool;
pub use selector::{EmptySamplePolicy, RankedPredictor, SelectOptions};
pub use stage::{
    configure_run, run_pipeline, run_stage_from_file, ConfigureParams, PhaseRunner, RunLayout,
    Stage, Toolchain,
};
pub use trials::TrialPlanOptions;
pub use wrangler::{PollPolicy, WranglerSettings};
