use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use mmx_core::{MmxError, RunDescriptor};
use mmx_runner::{
    configure_run, logging, reset_trial, reset_trials, run_pipeline, run_stage_from_file,
    select_trials, trial_status, AcquireOptions, ConfigureParams, EmptySamplePolicy, MaxEntTool,
    RunLayout, SelectOptions, Stage, Toolchain, TrialPlanOptions, TrialSelection, TrialState,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "mmx", version = "0.3.0", about = "MERRA/Max species distribution runs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    verbose: bool,
    /// MaxEnt jar, overriding MMX_MAXENT_JAR
    #[arg(long, global = true)]
    maxent_jar: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum EmptyPolicyArg {
    #[value(name = "zero")]
    Zero,
    #[value(name = "exclude")]
    Exclude,
}

impl From<EmptyPolicyArg> for EmptySamplePolicy {
    fn from(value: EmptyPolicyArg) -> Self {
        match value {
            EmptyPolicyArg::Zero => EmptySamplePolicy::Zero,
            EmptyPolicyArg::Exclude => EmptySamplePolicy::Exclude,
        }
    }
}

#[derive(clap::Args, Clone)]
struct ConfigureArgs {
    /// Presence point CSV whose first row carries epsg:<code>
    #[arg(short = 'f', long)]
    presence: PathBuf,
    #[arg(short = 's', long)]
    species: String,
    #[arg(short = 'i', long, default_value = ".")]
    input_dir: PathBuf,
    #[arg(short = 'o', long, default_value = ".")]
    output_dir: PathBuf,
    #[arg(short = 'p', long, default_value_t = 10)]
    processes: i64,
    #[arg(short = 't', long, default_value_t = 10)]
    trials: i64,
    /// mm-dd-yyyy
    #[arg(long)]
    start_date: Option<String>,
    /// mm-dd-yyyy
    #[arg(long)]
    end_date: Option<String>,
}

impl ConfigureArgs {
    fn params(&self) -> ConfigureParams {
        ConfigureParams {
            presence_file: self.presence.clone(),
            species: self.species.clone(),
            start_date: self.start_date.clone(),
            end_date: self.end_date.clone(),
            input_dir: self.input_dir.clone(),
            output_dir: self.output_dir.clone(),
            num_processes: self.processes,
            num_trials: self.trials,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    Configure {
        #[command(flatten)]
        args: ConfigureArgs,
        #[arg(long)]
        json: bool,
    },
    Acquire {
        #[arg(short = 'c', long)]
        config: PathBuf,
        /// Existing service site id; a new empty site is ordered otherwise
        #[arg(long)]
        site: Option<String>,
        #[arg(long)]
        json: bool,
    },
    PrepareImages {
        #[arg(short = 'c', long)]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    PrepareTrials {
        #[arg(short = 'c', long)]
        config: PathBuf,
        #[arg(long, default_value_t = 10)]
        per_trial: usize,
        #[arg(long)]
        json: bool,
    },
    RunTrials {
        #[arg(short = 'c', long)]
        config: PathBuf,
        /// Inclusive trial range, e.g. 0-9
        #[arg(long)]
        range: Option<String>,
        /// Clear results and mark the trials pending instead of running them
        #[arg(long)]
        reset: bool,
        #[arg(long)]
        json: bool,
    },
    Select {
        #[arg(short = 'c', long)]
        config: PathBuf,
        #[arg(long, default_value_t = 10)]
        top_k: usize,
        #[arg(long, default_value = "permutation")]
        marker: String,
        #[arg(long, value_enum, default_value_t = EmptyPolicyArg::Zero)]
        empty_policy: EmptyPolicyArg,
        #[arg(long)]
        json: bool,
    },
    Model {
        #[arg(short = 'c', long)]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Configure and run every stage in order
    Run {
        #[command(flatten)]
        args: ConfigureArgs,
        #[arg(long)]
        site: Option<String>,
        #[arg(long, default_value_t = 10)]
        per_trial: usize,
        #[arg(long, default_value_t = 10)]
        top_k: usize,
        #[arg(long)]
        json: bool,
    },
    Describe {
        #[arg(short = 'c', long)]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Status {
        #[arg(short = 'c', long)]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    logging::init(log_file_for(&cli.command).as_deref(), cli.verbose)?;
    let tools = toolchain(cli.maxent_jar);
    let result = run_command(cli.command, &tools);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let code = err
                    .downcast_ref::<MmxError>()
                    .map(MmxError::code)
                    .unwrap_or("command_failed");
                emit_json(&json_error(code, format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn toolchain(maxent_jar: Option<PathBuf>) -> Toolchain {
    let mut tools = Toolchain::from_env();
    if let Some(jar) = maxent_jar {
        tools.modeler = Box::new(MaxEntTool {
            jar,
            ..MaxEntTool::from_env()
        });
    }
    tools
}

/// Stage commands log next to the run descriptor, which lives in the output
/// directory.
fn log_file_for(command: &Commands) -> Option<PathBuf> {
    let out_dir = match command {
        Commands::Configure { args, .. } | Commands::Run { args, .. } => args.output_dir.clone(),
        Commands::Acquire { config, .. }
        | Commands::PrepareImages { config, .. }
        | Commands::PrepareTrials { config, .. }
        | Commands::RunTrials { config, .. }
        | Commands::Select { config, .. }
        | Commands::Model { config, .. } => config_dir(config),
        Commands::Describe { .. } | Commands::Status { .. } => return None,
    };
    out_dir
        .is_dir()
        .then(|| out_dir.join(mmx_runner::stage::LOG_FILE_NAME))
}

fn config_dir(config: &Path) -> PathBuf {
    match config.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn run_command(command: Commands, tools: &Toolchain) -> Result<Option<Value>> {
    match command {
        Commands::Configure { args, json } => {
            let descriptor = configure_run(&args.params())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "configure",
                    "descriptor": descriptor_to_json(&descriptor),
                })));
            }
            println!("{}", descriptor);
            println!("config: {}", descriptor.descriptor_path().display());
        }
        Commands::Acquire { config, site, json } => {
            let options = AcquireOptions {
                site_id: site,
                ..AcquireOptions::default()
            };
            return stage_command("acquire", &config, &Stage::Acquire(options), tools, json);
        }
        Commands::PrepareImages { config, json } => {
            return stage_command("prepare-images", &config, &Stage::PrepareImages, tools, json);
        }
        Commands::PrepareTrials {
            config,
            per_trial,
            json,
        } => {
            let stage = Stage::PrepareTrials(TrialPlanOptions {
                predictors_per_trial: per_trial,
            });
            return stage_command("prepare-trials", &config, &stage, tools, json);
        }
        Commands::RunTrials {
            config,
            range,
            reset,
            json,
        } => {
            let selection = range
                .as_deref()
                .map(str::parse::<TrialSelection>)
                .transpose()?
                .unwrap_or_default();
            if reset {
                let descriptor = RunDescriptor::load_from(&config)?;
                let trials_dir = RunLayout::new(&descriptor).trials_dir;
                let count = match selection {
                    TrialSelection::All => reset_trials(&trials_dir)?,
                    range => {
                        let picked = select_trials(&trials_dir, &range)?;
                        for trial in &picked {
                            reset_trial(trial)?;
                        }
                        picked.len()
                    }
                };
                if json {
                    return Ok(Some(json!({
                        "ok": true,
                        "command": "run-trials",
                        "reset": count,
                        "selection": selection.to_string(),
                    })));
                }
                println!("reset {} trial(s)", count);
                return Ok(None);
            }
            return stage_command("run-trials", &config, &Stage::RunTrials(selection), tools, json);
        }
        Commands::Select {
            config,
            top_k,
            marker,
            empty_policy,
            json,
        } => {
            let options = SelectOptions {
                top_k,
                marker,
                empty_policy: empty_policy.into(),
            };
            return stage_command("select", &config, &Stage::Select(options), tools, json);
        }
        Commands::Model { config, json } => {
            return stage_command("model", &config, &Stage::Model, tools, json);
        }
        Commands::Run {
            args,
            site,
            per_trial,
            top_k,
            json,
        } => {
            let configured = configure_run(&args.params())?;
            let config = configured.descriptor_path();
            let stages = Stage::pipeline(
                AcquireOptions {
                    site_id: site,
                    ..AcquireOptions::default()
                },
                TrialPlanOptions {
                    predictors_per_trial: per_trial,
                },
                SelectOptions {
                    top_k,
                    ..SelectOptions::default()
                },
            );
            let descriptor = run_pipeline(&config, &stages, tools)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "descriptor": descriptor_to_json(&descriptor),
                })));
            }
            println!("{}", descriptor);
        }
        Commands::Describe { config, json } => {
            let descriptor = RunDescriptor::load_from(&config)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "descriptor": descriptor_to_json(&descriptor),
                })));
            }
            println!("{}", descriptor);
        }
        Commands::Status { config, json } => {
            let descriptor = RunDescriptor::load_from(&config)?;
            let trials_dir = RunLayout::new(&descriptor).trials_dir;
            let statuses = match trial_status(&trials_dir) {
                Ok(s) => s,
                Err(MmxError::NoTrialsFound(_)) => Vec::new(),
                Err(e) => return Err(e.into()),
            };
            let count = |state: Option<TrialState>| {
                statuses.iter().filter(|s| s.state == state).count()
            };
            let counts = json!({
                "pending": count(Some(TrialState::Pending)),
                "running": count(Some(TrialState::Running)),
                "complete": count(Some(TrialState::Complete)),
                "failed": count(Some(TrialState::Failed)),
                "unflagged": count(None),
            });
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "phase": descriptor.phase(),
                    "state": descriptor.state().as_str(),
                    "counts": counts,
                    "trials": statuses,
                })));
            }
            println!("phase: {} ({})", descriptor.phase(), descriptor.state());
            println!("trials: {}", statuses.len());
            for s in &statuses {
                let state = s.state.map(|st| st.as_str()).unwrap_or("unflagged");
                println!("  trial-{}: {}", s.index, state);
            }
        }
    }
    Ok(None)
}

fn stage_command(
    name: &str,
    config: &Path,
    stage: &Stage,
    tools: &Toolchain,
    json: bool,
) -> Result<Option<Value>> {
    let descriptor = run_stage_from_file(config, stage, tools)?;
    if json {
        return Ok(Some(json!({
            "ok": true,
            "command": name,
            "phase": stage.phase_name(),
            "descriptor": descriptor_to_json(&descriptor),
        })));
    }
    println!("{}: {}", stage.application_name(), descriptor.state());
    Ok(None)
}

fn descriptor_to_json(d: &RunDescriptor) -> Value {
    json!({
        "config_file": d.config_file(),
        "phase": d.phase(),
        "state": d.state().as_str(),
        "species": d.species(),
        "extent": d.extent(),
        "start_date": d.start_date().map(|x| mmx_core::descriptor::format_date(&x)),
        "end_date": d.end_date().map(|x| mmx_core::descriptor::format_date(&x)),
        "input_dir": d.input_dir(),
        "output_dir": d.output_dir(),
        "num_trials": d.num_trials(),
        "num_processes": d.num_processes(),
        "presence_file": d.presence_file(),
        "top_predictors": d.top_predictors(),
    })
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Configure { json, .. }
        | Commands::Acquire { json, .. }
        | Commands::PrepareImages { json, .. }
        | Commands::PrepareTrials { json, .. }
        | Commands::RunTrials { json, .. }
        | Commands::Select { json, .. }
        | Commands::Model { json, .. }
        | Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Status { json, .. } => *json,
    }
}
