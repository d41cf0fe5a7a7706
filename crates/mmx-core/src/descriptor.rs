//! The persistent run descriptor: one validated document per pipeline run.
//!
//! Every field is assigned through a setter that checks its invariant at
//! assignment time, and loading a persisted document goes through the same
//! setters, so a document on disk is re-validated rather than trusted.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bbox::BoundingBox;
use crate::errors::{MmxError, Result};
use crate::fsutil::atomic_write_json_pretty;
use crate::presence::validate_presence_file;

pub const DESCRIPTOR_FILE_NAME: &str = "config.mmx";
pub const DATE_FORMAT: &str = "%m-%d-%Y";
pub const SCHEMA_VERSION: &str = "run_descriptor_v1";

pub const DEFAULT_PROCESSES: i64 = 10;
pub const DEFAULT_TRIALS: i64 = 10;
pub const MAXIMUM_PROCESSES: i64 = 2000;
pub const MAXIMUM_TRIALS: i64 = 10000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunState {
    #[default]
    Pending,
    Running,
    Complete,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "Pending",
            RunState::Running => "Running",
            RunState::Complete => "Complete",
            RunState::Failed => "Failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corner {
    Ulx,
    Uly,
    Lrx,
    Lry,
}

impl Corner {
    pub fn name(&self) -> &'static str {
        match self {
            Corner::Ulx => "upper-left X",
            Corner::Uly => "upper-left Y",
            Corner::Lrx => "lower-right X",
            Corner::Lry => "lower-right Y",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunDescriptor {
    config_file: Option<PathBuf>,
    ulx: Option<f64>,
    uly: Option<f64>,
    lrx: Option<f64>,
    lry: Option<f64>,
    epsg: Option<i32>,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
    species: String,
    input_dir: PathBuf,
    output_dir: PathBuf,
    num_trials: i64,
    num_processes: i64,
    phase: String,
    state: RunState,
    presence_file: Option<PathBuf>,
    top_predictors: Vec<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RunDocument {
    schema_version: String,
    config_file: Option<PathBuf>,
    ulx: Option<f64>,
    uly: Option<f64>,
    lrx: Option<f64>,
    lry: Option<f64>,
    epsg: Option<i32>,
    start_date: Option<String>,
    end_date: Option<String>,
    species: String,
    input_dir: PathBuf,
    output_dir: PathBuf,
    num_trials: i64,
    num_processes: i64,
    phase: String,
    state: RunState,
    presence_file: Option<PathBuf>,
    #[serde(default)]
    top_predictors: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<String>,
}

impl Default for RunDescriptor {
    fn default() -> Self {
        Self {
            config_file: None,
            ulx: None,
            uly: None,
            lrx: None,
            lry: None,
            epsg: None,
            start_date: None,
            end_date: None,
            species: "species".to_string(),
            input_dir: PathBuf::from("."),
            output_dir: PathBuf::from("."),
            num_trials: DEFAULT_TRIALS,
            num_processes: DEFAULT_PROCESSES,
            phase: "Unknown".to_string(),
            state: RunState::Pending,
            presence_file: None,
            top_predictors: Vec::new(),
        }
    }
}

pub fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).map_err(|_| {
        MmxError::invalid_config(format!("date '{}' does not match MM-DD-YYYY", raw))
    })
}

pub fn format_date(date: &NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Accepts `4326`, `EPSG:4326` or `epsg:4326`.
pub fn parse_epsg(raw: &str) -> Result<i32> {
    let trimmed = raw.trim();
    let digits = match trimmed.split_once(':') {
        Some((prefix, code)) if prefix.trim().eq_ignore_ascii_case("epsg") => code.trim(),
        Some(_) => {
            return Err(MmxError::invalid_config(format!(
                "unrecognized spatial reference '{}'",
                raw
            )))
        }
        None => trimmed,
    };
    match digits.parse::<i32>() {
        Ok(code) if code > 0 => Ok(code),
        _ => Err(MmxError::invalid_config(format!(
            "unrecognized spatial reference '{}'",
            raw
        ))),
    }
}

fn require_dir(path: &Path, label: &str) -> Result<()> {
    if path.as_os_str().is_empty() || !path.exists() || !path.is_dir() {
        return Err(MmxError::invalid_config(format!(
            "a valid {} directory is required (got {})",
            label,
            path.display()
        )));
    }
    Ok(())
}

impl RunDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config_file(&self) -> Option<&Path> {
        self.config_file.as_deref()
    }

    pub fn ulx(&self) -> Option<f64> {
        self.ulx
    }

    pub fn uly(&self) -> Option<f64> {
        self.uly
    }

    pub fn lrx(&self) -> Option<f64> {
        self.lrx
    }

    pub fn lry(&self) -> Option<f64> {
        self.lry
    }

    pub fn epsg(&self) -> Option<i32> {
        self.epsg
    }

    /// The full extent, once all four corners and the spatial reference are known.
    pub fn extent(&self) -> Option<BoundingBox> {
        Some(BoundingBox {
            ulx: self.ulx?,
            uly: self.uly?,
            lrx: self.lrx?,
            lry: self.lry?,
            epsg: self.epsg?,
        })
    }

    pub fn start_date(&self) -> Option<NaiveDate> {
        self.start_date
    }

    pub fn end_date(&self) -> Option<NaiveDate> {
        self.end_date
    }

    pub fn species(&self) -> &str {
        &self.species
    }

    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn num_trials(&self) -> i64 {
        self.num_trials
    }

    pub fn num_processes(&self) -> i64 {
        self.num_processes
    }

    pub fn phase(&self) -> &str {
        &self.phase
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn presence_file(&self) -> Option<&Path> {
        self.presence_file.as_deref()
    }

    pub fn top_predictors(&self) -> &[PathBuf] {
        &self.top_predictors
    }

    pub fn descriptor_path(&self) -> PathBuf {
        self.output_dir.join(DESCRIPTOR_FILE_NAME)
    }

    /// Stores the corner, enforcing `ulx < lrx` and `uly > lry` whenever the
    /// opposing corner on the same axis is already set.
    pub fn set_corner(&mut self, corner: Corner, value: f64) -> Result<()> {
        if !value.is_finite() {
            return Err(MmxError::invalid_config(format!(
                "{} must be a finite number (got {})",
                corner.name(),
                value
            )));
        }
        let consistent = match corner {
            Corner::Ulx => self.lrx.map_or(true, |lrx| value < lrx),
            Corner::Lrx => self.ulx.map_or(true, |ulx| ulx < value),
            Corner::Uly => self.lry.map_or(true, |lry| value > lry),
            Corner::Lry => self.uly.map_or(true, |uly| uly > value),
        };
        if !consistent {
            let msg = match corner {
                Corner::Ulx | Corner::Lrx => "upper-left X must be less than lower-right X",
                Corner::Uly | Corner::Lry => "upper-left Y must be greater than lower-right Y",
            };
            return Err(MmxError::invalid_config(format!(
                "{} ({} = {})",
                msg,
                corner.name(),
                value
            )));
        }
        let slot = match corner {
            Corner::Ulx => &mut self.ulx,
            Corner::Uly => &mut self.uly,
            Corner::Lrx => &mut self.lrx,
            Corner::Lry => &mut self.lry,
        };
        *slot = Some(value);
        Ok(())
    }

    pub fn parse_corner(&mut self, corner: Corner, raw: &str) -> Result<()> {
        let value = raw.trim().parse::<f64>().map_err(|_| {
            MmxError::invalid_config(format!("{} '{}' is not a number", corner.name(), raw))
        })?;
        self.set_corner(corner, value)
    }

    pub fn set_ulx(&mut self, value: f64) -> Result<()> {
        self.set_corner(Corner::Ulx, value)
    }

    pub fn set_uly(&mut self, value: f64) -> Result<()> {
        self.set_corner(Corner::Uly, value)
    }

    pub fn set_lrx(&mut self, value: f64) -> Result<()> {
        self.set_corner(Corner::Lrx, value)
    }

    pub fn set_lry(&mut self, value: f64) -> Result<()> {
        self.set_corner(Corner::Lry, value)
    }

    /// Replaces the whole extent. On failure the previous extent is kept.
    pub fn set_extent(&mut self, bbox: &BoundingBox) -> Result<()> {
        let previous = (self.ulx, self.uly, self.lrx, self.lry, self.epsg);
        self.ulx = None;
        self.uly = None;
        self.lrx = None;
        self.lry = None;
        let applied = self
            .set_ulx(bbox.ulx)
            .and_then(|_| self.set_uly(bbox.uly))
            .and_then(|_| self.set_lrx(bbox.lrx))
            .and_then(|_| self.set_lry(bbox.lry))
            .and_then(|_| self.set_epsg(bbox.epsg));
        if applied.is_err() {
            (self.ulx, self.uly, self.lrx, self.lry, self.epsg) = previous;
        }
        applied
    }

    /// Empty input leaves the current value untouched.
    pub fn set_spatial_reference(&mut self, raw: Option<&str>) -> Result<()> {
        match raw.map(str::trim) {
            None | Some("") => Ok(()),
            Some(value) => {
                self.epsg = Some(parse_epsg(value)?);
                Ok(())
            }
        }
    }

    pub fn set_epsg(&mut self, code: i32) -> Result<()> {
        if code <= 0 {
            return Err(MmxError::invalid_config(format!(
                "EPSG code must be positive (got {})",
                code
            )));
        }
        self.epsg = Some(code);
        Ok(())
    }

    pub fn set_start_date(&mut self, raw: Option<&str>) -> Result<()> {
        self.set_date_window(raw, None)
    }

    pub fn set_end_date(&mut self, raw: Option<&str>) -> Result<()> {
        self.set_date_window(None, raw)
    }

    /// `None` on either side keeps that side's current value; the window is
    /// only committed when `start <= end` holds for the resulting pair.
    pub fn set_date_window(&mut self, start: Option<&str>, end: Option<&str>) -> Result<()> {
        let start = match start {
            Some(raw) => Some(parse_date(raw)?),
            None => self.start_date,
        };
        let end = match end {
            Some(raw) => Some(parse_date(raw)?),
            None => self.end_date,
        };
        if let (Some(s), Some(e)) = (start, end) {
            if s > e {
                return Err(MmxError::invalid_config(format!(
                    "start date {} must not be after end date {}",
                    format_date(&s),
                    format_date(&e)
                )));
            }
        }
        self.start_date = start;
        self.end_date = end;
        Ok(())
    }

    pub fn set_species(&mut self, species: &str) -> Result<()> {
        if species.trim().is_empty() {
            return Err(MmxError::invalid_config("a species must be provided"));
        }
        self.species = species.to_string();
        Ok(())
    }

    pub fn set_input_dir(&mut self, dir: &Path) -> Result<()> {
        require_dir(dir, "input")?;
        self.input_dir = dir.to_path_buf();
        Ok(())
    }

    pub fn set_output_dir(&mut self, dir: &Path) -> Result<()> {
        require_dir(dir, "output")?;
        self.output_dir = dir.to_path_buf();
        Ok(())
    }

    /// Out-of-range counts are ignored; returns whether `n` was kept.
    pub fn set_num_trials(&mut self, n: i64) -> bool {
        if n > 0 && n < MAXIMUM_TRIALS {
            self.num_trials = n;
            true
        } else {
            debug!(requested = n, kept = self.num_trials, "ignoring out-of-range trial count");
            false
        }
    }

    pub fn set_num_processes(&mut self, n: i64) -> bool {
        if n > 0 && n < MAXIMUM_PROCESSES {
            self.num_processes = n;
            true
        } else {
            debug!(requested = n, kept = self.num_processes, "ignoring out-of-range process count");
            false
        }
    }

    /// `None` clears the field; the presence file may not be known yet.
    pub fn set_presence_file(&mut self, path: Option<&Path>) -> Result<()> {
        match path {
            None => {
                warn!("presence file cleared from run descriptor");
                self.presence_file = None;
                Ok(())
            }
            Some(path) => {
                validate_presence_file(path)?;
                self.presence_file = Some(path.to_path_buf());
                Ok(())
            }
        }
    }

    pub fn set_phase(&mut self, phase: &str) {
        self.phase = phase.to_string();
    }

    pub fn set_state(&mut self, state: RunState) {
        self.state = state;
    }

    pub fn set_top_predictors(&mut self, predictors: Vec<PathBuf>) {
        self.top_predictors = predictors;
    }

    fn to_document(&self) -> RunDocument {
        RunDocument {
            schema_version: SCHEMA_VERSION.to_string(),
            config_file: self.config_file.clone(),
            ulx: self.ulx,
            uly: self.uly,
            lrx: self.lrx,
            lry: self.lry,
            epsg: self.epsg,
            start_date: self.start_date.as_ref().map(format_date),
            end_date: self.end_date.as_ref().map(format_date),
            species: self.species.clone(),
            input_dir: self.input_dir.clone(),
            output_dir: self.output_dir.clone(),
            num_trials: self.num_trials,
            num_processes: self.num_processes,
            phase: self.phase.clone(),
            state: self.state,
            presence_file: self.presence_file.clone(),
            top_predictors: self.top_predictors.clone(),
            updated_at: Some(Utc::now().to_rfc3339()),
        }
    }

    /// Overwrites `<output_dir>/config.mmx` and records that path in the descriptor.
    pub fn persist(&mut self) -> Result<PathBuf> {
        let path = self.descriptor_path();
        self.config_file = Some(path.clone());
        atomic_write_json_pretty(&path, &self.to_document())?;
        debug!(path = %path.display(), phase = %self.phase, state = %self.state, "persisted run descriptor");
        Ok(path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = fs::read(path)?;
        let doc: RunDocument = serde_json::from_slice(&raw)?;
        if doc.schema_version != SCHEMA_VERSION {
            return Err(MmxError::invalid_config(format!(
                "{} has schema_version '{}', expected '{}'",
                path.display(),
                doc.schema_version,
                SCHEMA_VERSION
            )));
        }

        let mut d = RunDescriptor::new();
        d.config_file = doc.config_file;
        d.set_input_dir(&doc.input_dir)?;
        d.set_output_dir(&doc.output_dir)?;
        d.set_species(&doc.species)?;
        d.set_presence_file(doc.presence_file.as_deref())?;
        d.set_date_window(doc.start_date.as_deref(), doc.end_date.as_deref())?;
        d.set_num_trials(doc.num_trials);
        d.set_num_processes(doc.num_processes);
        for (corner, value) in [
            (Corner::Ulx, doc.ulx),
            (Corner::Uly, doc.uly),
            (Corner::Lrx, doc.lrx),
            (Corner::Lry, doc.lry),
        ] {
            if let Some(v) = value {
                d.set_corner(corner, v)?;
            }
        }
        if let Some(code) = doc.epsg {
            d.set_epsg(code)?;
        }
        d.set_phase(&doc.phase);
        d.set_state(doc.state);
        d.set_top_predictors(doc.top_predictors);
        Ok(d)
    }
}

fn opt<T: fmt::Display>(value: Option<T>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "None".to_string())
}

impl fmt::Display for RunDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Species:          {}", self.species)?;
        writeln!(
            f,
            "Area of Interest: ({}, {}), ({}, {}) EPSG:{}",
            opt(self.ulx),
            opt(self.uly),
            opt(self.lrx),
            opt(self.lry),
            opt(self.epsg)
        )?;
        writeln!(
            f,
            "Dates:            {} - {}",
            opt(self.start_date.as_ref().map(format_date)),
            opt(self.end_date.as_ref().map(format_date))
        )?;
        writeln!(f, "Input Directory:  {}", self.input_dir.display())?;
        writeln!(f, "Output Directory: {}", self.output_dir.display())?;
        writeln!(f, "Trials:           {}", self.num_trials)?;
        write!(f, "Phase:            {} ({})", self.phase, self.state)
    }
}
