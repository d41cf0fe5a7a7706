use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use mmx_core::{atomic_write_bytes, BoundingBox, MmxError, Result};
use serde_json::Value;
use tracing::{debug, info};

pub const NODATA: f64 = -9999.0;
const NODATA_TOKEN: &str = "-9999";

#[derive(Debug, Clone)]
pub struct RasterTool {
    pub gdalwarp: PathBuf,
    pub gdal_translate: PathBuf,
    pub gdalinfo: PathBuf,
}

impl Default for RasterTool {
    fn default() -> Self {
        Self {
            gdalwarp: PathBuf::from("gdalwarp"),
            gdal_translate: PathBuf::from("gdal_translate"),
            gdalinfo: PathBuf::from("gdalinfo"),
        }
    }
}

/// Target grid for resampling: extent plus square pixel size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSpec {
    pub ulx: f64,
    pub uly: f64,
    pub lrx: f64,
    pub lry: f64,
    pub x_res: f64,
    pub y_res: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RasterInfo {
    pub path: PathBuf,
    pub geo_transform: [f64; 6],
    pub width: usize,
    pub height: usize,
    pub band_min: Option<f64>,
    pub band_max: Option<f64>,
}

impl RasterInfo {
    pub fn from_gdalinfo_json(path: &Path, doc: &Value) -> Result<Self> {
        let bad = |what: &str| {
            MmxError::invalid_input(format!("gdalinfo output for {} lacks {}", path.display(), what))
        };
        let gt = doc
            .get("geoTransform")
            .and_then(|v| v.as_array())
            .ok_or_else(|| bad("geoTransform"))?;
        if gt.len() != 6 {
            return Err(bad("a six-element geoTransform"));
        }
        let mut geo_transform = [0.0; 6];
        for (slot, v) in geo_transform.iter_mut().zip(gt) {
            *slot = v.as_f64().ok_or_else(|| bad("numeric geoTransform"))?;
        }
        let size = doc
            .get("size")
            .and_then(|v| v.as_array())
            .filter(|s| s.len() == 2)
            .ok_or_else(|| bad("size"))?;
        let width = size[0].as_u64().ok_or_else(|| bad("numeric size"))? as usize;
        let height = size[1].as_u64().ok_or_else(|| bad("numeric size"))? as usize;

        let band = doc
            .get("bands")
            .and_then(|v| v.as_array())
            .and_then(|b| b.first());
        let stat = |key: &str| band.and_then(|b| b.get(key)).and_then(|v| v.as_f64());

        Ok(Self {
            path: path.to_path_buf(),
            geo_transform,
            width,
            height,
            band_min: stat("minimum"),
            band_max: stat("maximum"),
        })
    }

    pub fn pixel_size(&self) -> (f64, f64) {
        (self.geo_transform[1], self.geo_transform[5])
    }

    fn coarseness(&self) -> f64 {
        let (x, y) = self.pixel_size();
        x.abs().max(y.abs())
    }

    /// The raster's own extent with square pixels at its coarser axis.
    pub fn square_grid(&self) -> GridSpec {
        let gt = &self.geo_transform;
        let res = self.coarseness();
        GridSpec {
            ulx: gt[0],
            uly: gt[3],
            lrx: gt[0] + self.width as f64 * gt[1],
            lry: gt[3] + self.height as f64 * gt[5],
            x_res: res,
            y_res: res,
        }
    }

    /// A band whose minimum equals its maximum carries no signal.
    pub fn is_filler(&self) -> bool {
        matches!((self.band_min, self.band_max), (Some(lo), Some(hi)) if lo == hi)
    }
}

/// First raster with the largest pixel size; earlier entries win ties.
pub fn coarsest(infos: &[RasterInfo]) -> Option<&RasterInfo> {
    let mut best: Option<&RasterInfo> = None;
    for info in infos {
        if best.map_or(true, |b| info.coarseness() > b.coarseness()) {
            best = Some(info);
        }
    }
    best
}

impl RasterTool {
    pub fn from_env() -> Self {
        let mut tool = Self::default();
        if let Ok(p) = std::env::var("MMX_GDALWARP") {
            tool.gdalwarp = PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("MMX_GDAL_TRANSLATE") {
            tool.gdal_translate = PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("MMX_GDALINFO") {
            tool.gdalinfo = PathBuf::from(p);
        }
        tool
    }

    pub fn info(&self, path: &Path, with_stats: bool) -> Result<RasterInfo> {
        let mut cmd = Command::new(&self.gdalinfo);
        cmd.arg("-json");
        if with_stats {
            cmd.arg("-stats");
        }
        cmd.arg(path);
        let shown = describe(&cmd);
        let out = cmd
            .stdin(Stdio::null())
            .output()
            .map_err(|e| tool_error(&shown, e.to_string()))?;
        if !out.status.success() {
            return Err(tool_error(
                &shown,
                format!("{}: {}", out.status, String::from_utf8_lossy(&out.stderr).trim()),
            ));
        }
        let doc: Value = serde_json::from_slice(&out.stdout)?;
        RasterInfo::from_gdalinfo_json(path, &doc)
    }

    pub fn clip_reproject_args(
        src: &Path,
        dst: &Path,
        epsg: i32,
        extent: &BoundingBox,
        threads: i64,
    ) -> Vec<String> {
        let mut args = vec![
            "-overwrite".to_string(),
            "-multi".to_string(),
            "-wo".to_string(),
            format!("NUM_THREADS={}", threads.max(1)),
            "-t_srs".to_string(),
            format!("EPSG:{}", epsg),
            "-te_srs".to_string(),
            format!("EPSG:{}", extent.epsg),
            "-te".to_string(),
        ];
        args.extend(
            [extent.ulx, extent.lry, extent.lrx, extent.uly]
                .iter()
                .map(|v| v.to_string()),
        );
        args.push(src.to_string_lossy().to_string());
        args.push(dst.to_string_lossy().to_string());
        args
    }

    pub fn clip_reproject(
        &self,
        src: &Path,
        dst: &Path,
        epsg: i32,
        extent: &BoundingBox,
        threads: i64,
    ) -> Result<()> {
        let mut cmd = Command::new(&self.gdalwarp);
        cmd.args(Self::clip_reproject_args(src, dst, epsg, extent, threads));
        run_checked(cmd, dst)
    }

    pub fn resample_args(src: &Path, dst: &Path, grid: &GridSpec) -> Vec<String> {
        let mut args = vec!["-overwrite".to_string(), "-te".to_string()];
        args.extend(
            [grid.ulx, grid.lry, grid.lrx, grid.uly]
                .iter()
                .map(|v| v.to_string()),
        );
        args.push("-tr".to_string());
        args.push(grid.x_res.to_string());
        args.push(grid.y_res.to_string());
        args.push(src.to_string_lossy().to_string());
        args.push(dst.to_string_lossy().to_string());
        args
    }

    pub fn resample(&self, src: &Path, dst: &Path, grid: &GridSpec) -> Result<()> {
        let mut cmd = Command::new(&self.gdalwarp);
        cmd.args(Self::resample_args(src, dst, grid));
        run_checked(cmd, dst)
    }

    pub fn to_ascii_grid(&self, src: &Path, dst: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.gdal_translate);
        cmd.args(["-ot", "Float32", "-a_nodata", NODATA_TOKEN, "-of", "AAIGrid"])
            .arg(src)
            .arg(dst);
        run_checked(cmd, dst)
    }
}

fn describe(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().to_string()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().to_string()));
    parts.join(" ")
}

fn tool_error(command: &str, reason: String) -> MmxError {
    MmxError::ExternalTool {
        command: command.to_string(),
        reason,
    }
}

fn run_checked(mut cmd: Command, expected: &Path) -> Result<()> {
    let shown = describe(&cmd);
    info!(command = %shown, "raster command");
    let out = cmd
        .stdin(Stdio::null())
        .output()
        .map_err(|e| tool_error(&shown, e.to_string()))?;
    if !out.status.success() {
        return Err(tool_error(
            &shown,
            format!("{}: {}", out.status, String::from_utf8_lossy(&out.stderr).trim()),
        ));
    }
    if !expected.exists() {
        return Err(tool_error(
            &shown,
            format!("{} was not created", expected.display()),
        ));
    }
    Ok(())
}

fn is_nan_token(tok: &str) -> bool {
    let t = tok.trim_start_matches(['-', '+']);
    t.eq_ignore_ascii_case("nan")
}

/// Rewrites `nan` cells in every `.asc` under `dir` as the nodata value.
/// Returns how many files changed.
pub fn fix_ascii_nan(dir: &Path) -> Result<usize> {
    let mut changed = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || !mmx_core::has_extension(&path, "asc") {
            continue;
        }
        let body = fs::read_to_string(&path)?;
        if !body.split_whitespace().any(is_nan_token) {
            continue;
        }
        let mut fixed = String::with_capacity(body.len());
        for line in body.lines() {
            let cells: Vec<&str> = line
                .split_whitespace()
                .map(|tok| if is_nan_token(tok) { NODATA_TOKEN } else { tok })
                .collect();
            fixed.push_str(&cells.join(" "));
            fixed.push('\n');
        }
        atomic_write_bytes(&path, fixed.as_bytes())?;
        debug!(path = %path.display(), "replaced nan cells");
        changed += 1;
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn info(name: &str, gt: [f64; 6], width: usize, height: usize) -> RasterInfo {
        RasterInfo {
            path: PathBuf::from(name),
            geo_transform: gt,
            width,
            height,
            band_min: None,
            band_max: None,
        }
    }

    #[test]
    fn parses_gdalinfo_json() {
        let doc = json!({
            "size": [4, 2],
            "geoTransform": [-120.0, 0.5, 0.0, 45.0, 0.0, -0.625],
            "bands": [{"band": 1, "minimum": 1.5, "maximum": 9.0}]
        });
        let parsed = RasterInfo::from_gdalinfo_json(Path::new("a.tif"), &doc).expect("parse");
        assert_eq!((parsed.width, parsed.height), (4, 2));
        assert_eq!(parsed.pixel_size(), (0.5, -0.625));
        assert_eq!(parsed.band_min, Some(1.5));
        assert!(!parsed.is_filler());

        let missing = RasterInfo::from_gdalinfo_json(Path::new("b.tif"), &json!({"size": [1, 1]}));
        assert!(missing.is_err());
    }

    #[test]
    fn square_grid_uses_the_coarser_axis() {
        let r = info("a.tif", [-120.0, 0.5, 0.0, 45.0, 0.0, -0.625], 4, 2);
        let grid = r.square_grid();
        assert_eq!(grid.x_res, 0.625);
        assert_eq!(grid.y_res, 0.625);
        assert_eq!((grid.ulx, grid.uly), (-120.0, 45.0));
        assert_eq!((grid.lrx, grid.lry), (-118.0, 43.75));
    }

    #[test]
    fn coarsest_prefers_first_on_ties() {
        let infos = vec![
            info("fine.tif", [0.0, 0.1, 0.0, 0.0, 0.0, -0.1], 1, 1),
            info("coarse.tif", [0.0, 0.5, 0.0, 0.0, 0.0, -0.5], 1, 1),
            info("coarse2.tif", [0.0, 0.5, 0.0, 0.0, 0.0, -0.5], 1, 1),
        ];
        let c = coarsest(&infos).expect("some");
        assert_eq!(c.path, PathBuf::from("coarse.tif"));
        assert!(coarsest(&[]).is_none());
    }

    #[test]
    fn filler_needs_equal_min_and_max() {
        let mut r = info("f.tif", [0.0; 6], 1, 1);
        assert!(!r.is_filler());
        r.band_min = Some(0.0);
        r.band_max = Some(0.0);
        assert!(r.is_filler());
    }

    #[test]
    fn clip_arguments_order_extent_as_min_max() {
        let extent = BoundingBox {
            ulx: -120.0,
            uly: 45.0,
            lrx: -110.0,
            lry: 35.0,
            epsg: 4326,
        };
        let args = RasterTool::clip_reproject_args(
            Path::new("in.tif"),
            Path::new("out.tif"),
            4326,
            &extent,
            0,
        );
        let te = args.iter().position(|a| a == "-te").expect("-te");
        assert_eq!(&args[te + 1..te + 5], ["-120", "35", "-110", "45"]);
        assert!(args.contains(&"NUM_THREADS=1".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("out.tif"));
    }

    #[test]
    fn nan_cells_become_nodata() {
        let dir = tempfile::tempdir().expect("tempdir");
        let grid = dir.path().join("a.asc");
        fs::write(&grid, "ncols 2\nNODATA_value -9999\n1.5 nan\n-nan 2\n").expect("write");
        fs::write(dir.path().join("b.asc"), "ncols 1\n3\n").expect("write");

        assert_eq!(fix_ascii_nan(dir.path()).expect("fix"), 1);
        let body = fs::read_to_string(&grid).expect("read");
        assert_eq!(body, "ncols 2\nNODATA_value -9999\n1.5 -9999\n-9999 2\n");
        assert_eq!(fix_ascii_nan(dir.path()).expect("second pass"), 0);
    }

    #[test]
    fn missing_program_is_an_external_tool_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tool = RasterTool {
            gdalwarp: dir.path().join("no-such-gdalwarp"),
            ..RasterTool::default()
        };
        let grid = GridSpec {
            ulx: 0.0,
            uly: 1.0,
            lrx: 1.0,
            lry: 0.0,
            x_res: 1.0,
            y_res: 1.0,
        };
        let err = tool
            .resample(Path::new("a.tif"), &dir.path().join("b.tif"), &grid)
            .expect_err("spawn fails");
        assert_eq!(err.code(), "external_tool_failure");
    }
}
