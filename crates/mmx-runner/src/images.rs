use std::ffi::OsStr;
use std::path::Path;

use anyhow::{anyhow, Result};
use mmx_core::{ensure_dir, MmxError, RunDescriptor};
use serde_json::{json, Value};
use tracing::info;

use crate::raster::{coarsest, fix_ascii_nan, RasterTool};
use crate::trials::list_predictors;
use crate::RunLayout;

fn file_name(path: &Path) -> Result<&OsStr> {
    path.file_name()
        .ok_or_else(|| anyhow!("{} has no file name", path.display()))
}

/// Clips, reprojects and resamples the raw predictors onto one square grid,
/// then writes their ASCII grid versions.
pub fn prepare_images(
    descriptor: &RunDescriptor,
    layout: &RunLayout,
    raster: &RasterTool,
) -> Result<Value> {
    let extent = descriptor
        .extent()
        .ok_or_else(|| MmxError::invalid_config("run extent is not set"))?;
    let sources = list_predictors(&layout.raw_dir)?;
    if sources.is_empty() {
        return Err(MmxError::invalid_input(format!(
            "no .tif predictors in {}",
            layout.raw_dir.display()
        ))
        .into());
    }

    ensure_dir(&layout.clip_reproj_dir)?;
    let mut clipped = Vec::with_capacity(sources.len());
    for src in &sources {
        let dst = layout.clip_reproj_dir.join(file_name(src)?);
        raster.clip_reproject(src, &dst, extent.epsg, &extent, descriptor.num_processes())?;
        clipped.push(dst);
    }

    let infos = clipped
        .iter()
        .map(|p| raster.info(p, false))
        .collect::<mmx_core::Result<Vec<_>>>()?;
    let template = coarsest(&infos).ok_or_else(|| anyhow!("no clipped rasters"))?;
    let grid = template.square_grid();
    info!(template = %template.path.display(), resolution = grid.x_res, "resampling grid");

    ensure_dir(&layout.finished_dir)?;
    ensure_dir(&layout.asc_dir)?;
    for src in &clipped {
        let name = file_name(src)?;
        let finished = layout.finished_dir.join(name);
        raster.resample(src, &finished, &grid)?;
        let stem = Path::new(name)
            .file_stem()
            .ok_or_else(|| anyhow!("{} has no stem", src.display()))?;
        let asc = layout
            .asc_dir
            .join(format!("{}.asc", stem.to_string_lossy()));
        raster.to_ascii_grid(&finished, &asc)?;
    }
    let fixed = fix_ascii_nan(&layout.asc_dir)?;

    Ok(json!({
        "images": clipped.len(),
        "template": template.path,
        "resolution": grid.x_res,
        "nan_fixed_files": fixed,
    }))
}
