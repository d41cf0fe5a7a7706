use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use mmx_core::{has_extension, MmxError, Result};
use tracing::{info, warn};

pub const RESULTS_FILE: &str = "maxentResults.csv";
pub const DEFAULT_MAX_HEAP: &str = "1024m";

/// The external modeling executable, seen only through its output contract.
pub trait ModelingTool {
    /// Runs one model. `samples` is the species/x/y file, `env_dir` holds the
    /// `.asc` predictors, results land in `out_dir`.
    fn run_model(&self, samples: &Path, env_dir: &Path, out_dir: &Path) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct MaxEntTool {
    pub java: PathBuf,
    pub jar: PathBuf,
    pub max_heap: String,
}

impl Default for MaxEntTool {
    fn default() -> Self {
        Self {
            java: PathBuf::from("java"),
            jar: PathBuf::from("maxent.jar"),
            max_heap: DEFAULT_MAX_HEAP.to_string(),
        }
    }
}

impl MaxEntTool {
    pub fn from_env() -> Self {
        let mut tool = Self::default();
        if let Ok(java) = std::env::var("MMX_JAVA") {
            tool.java = PathBuf::from(java);
        }
        if let Ok(jar) = std::env::var("MMX_MAXENT_JAR") {
            tool.jar = PathBuf::from(jar);
        }
        if let Ok(heap) = std::env::var("MMX_MAXENT_HEAP") {
            tool.max_heap = heap;
        }
        tool
    }

    pub fn args(&self, samples: &Path, env_dir: &Path, out_dir: &Path) -> Vec<String> {
        vec![
            format!("-Xmx{}", self.max_heap),
            "-jar".to_string(),
            self.jar.to_string_lossy().to_string(),
            "visible=false".to_string(),
            "autorun".to_string(),
            "-P".to_string(),
            "-J".to_string(),
            "writeplotdata".to_string(),
            "applythresholdrule=Equal training sensitivity and specificity".to_string(),
            "removeduplicates=false".to_string(),
            "-s".to_string(),
            samples.to_string_lossy().to_string(),
            "-e".to_string(),
            env_dir.to_string_lossy().to_string(),
            "-o".to_string(),
            out_dir.to_string_lossy().to_string(),
        ]
    }
}

impl ModelingTool for MaxEntTool {
    fn run_model(&self, samples: &Path, env_dir: &Path, out_dir: &Path) -> Result<()> {
        if !samples.is_file() {
            return Err(MmxError::invalid_input(format!(
                "species file {} does not exist",
                samples.display()
            )));
        }
        if !env_dir.is_dir() {
            return Err(MmxError::invalid_input(format!(
                "predictor directory {} does not exist",
                env_dir.display()
            )));
        }
        if !out_dir.is_dir() {
            return Err(MmxError::invalid_input(format!(
                "output directory {} does not exist",
                out_dir.display()
            )));
        }

        let args = self.args(samples, env_dir, out_dir);
        let shown = format!("{} {}", self.java.display(), args.join(" "));
        info!(command = %shown, "MaxEnt command");
        let status = Command::new(&self.java)
            .args(&args)
            .stdin(Stdio::null())
            .status()
            .map_err(|e| MmxError::ExternalTool {
                command: shown.clone(),
                reason: e.to_string(),
            })?;

        // MaxEnt's exit status is not reliable; the results table is the contract.
        let results = out_dir.join(RESULTS_FILE);
        if !results.exists() {
            return Err(MmxError::ExternalTool {
                command: shown,
                reason: format!("{} was not produced (exit: {})", results.display(), status),
            });
        }
        if !status.success() {
            warn!(exit = %status, "MaxEnt exited abnormally but produced results");
        }
        Ok(())
    }
}

/// Writes `<out_dir>/<presence file name>` with a `species,x,y` header and one
/// row per presence row.
pub fn write_samples_file(presence: &Path, species: &str, out_dir: &Path) -> Result<PathBuf> {
    let name = presence.file_name().ok_or_else(|| {
        MmxError::invalid_input(format!("{} has no file name", presence.display()))
    })?;
    let samples = out_dir.join(name);
    if samples == presence {
        return Err(MmxError::invalid_input(format!(
            "samples file would overwrite {}",
            presence.display()
        )));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(presence)?;
    let mut writer = csv::Writer::from_path(&samples)?;
    writer.write_record(["species", "x", "y"])?;
    for (idx, rec) in reader.records().enumerate() {
        let rec = rec?;
        if idx == 0 || rec.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        if rec.len() < 2 {
            return Err(MmxError::invalid_input(format!(
                "row {} of {} needs x and y columns",
                idx + 1,
                presence.display()
            )));
        }
        writer.write_record([species, &rec[0], &rec[1]])?;
    }
    writer.flush()?;
    Ok(samples)
}

/// Copies predictors into `dest`. A `.tif` predictor resolves to the ASCII grid
/// `asc/<stem>.asc` next to it; anything else is copied as-is.
pub fn copy_asc_files(predictors: &[PathBuf], dest: &Path) -> Result<Vec<PathBuf>> {
    if !dest.is_dir() {
        return Err(MmxError::invalid_input(format!(
            "{} is not a directory",
            dest.display()
        )));
    }
    let mut copied = Vec::with_capacity(predictors.len());
    for pred in predictors {
        let source = asc_source_for(pred)?;
        if !source.is_file() {
            return Err(MmxError::invalid_input(format!(
                "prepared raster {} is missing",
                source.display()
            )));
        }
        let target = dest.join(source.file_name().unwrap_or_default());
        fs::copy(&source, &target)?;
        copied.push(target);
    }
    Ok(copied)
}

fn asc_source_for(pred: &Path) -> Result<PathBuf> {
    if !has_extension(pred, "tif") {
        return Ok(pred.to_path_buf());
    }
    let stem = pred
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| MmxError::invalid_input(format!("bad predictor name {}", pred.display())))?;
    let parent = pred.parent().unwrap_or_else(|| Path::new("."));
    Ok(parent.join("asc").join(format!("{}.asc", stem)))
}
