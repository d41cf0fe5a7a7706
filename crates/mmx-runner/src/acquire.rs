use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use mmx_core::{ensure_dir, has_extension, MmxError, RunDescriptor};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::raster::RasterTool;
use crate::trials::list_predictors;
use crate::wrangler::{
    create_empty_site, order_predictor, HttpPredictorService, PollPolicy, PredictorService,
    WranglerSettings, MERRA_MAX_PREDICTOR,
};
use crate::RunLayout;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireOptions {
    /// Reuse an existing service site instead of creating one.
    pub site_id: Option<String>,
    pub predictor: String,
    pub poll: PollPolicy,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            site_id: None,
            predictor: MERRA_MAX_PREDICTOR.to_string(),
            poll: PollPolicy::default(),
        }
    }
}

fn zip_archives(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut zips = Vec::new();
    for entry in walkdir::WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
        if entry.file_type().is_file() && has_extension(entry.path(), "zip") {
            zips.push(entry.into_path());
        }
    }
    zips.sort();
    Ok(zips)
}

pub fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let file = fs::File::open(archive)
        .with_context(|| format!("failed to open {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(file)
        .with_context(|| format!("{} is not a zip archive", archive.display()))?;
    zip.extract(dest)
        .with_context(|| format!("failed to extract {}", archive.display()))?;
    info!(archive = %archive.display(), files = zip.len(), "extracted");
    Ok(())
}

/// Deletes rasters whose only value is filler. Returns the removed paths.
pub fn remove_filler_images(dir: &Path, raster: &RasterTool) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for path in list_predictors(dir)? {
        let info = raster.info(&path, true)?;
        if info.is_filler() {
            warn!(path = %path.display(), value = ?info.band_min, "removing filler-only image");
            fs::remove_file(&path)?;
            removed.push(path);
        }
    }
    Ok(removed)
}

fn order_archive(
    descriptor: &RunDescriptor,
    raw_dir: &Path,
    options: &AcquireOptions,
    service: &dyn PredictorService,
    settings: &WranglerSettings,
) -> Result<PathBuf> {
    let creds = settings.credentials()?;
    let site = match &options.site_id {
        Some(site) => site.clone(),
        None => {
            let extent = descriptor
                .extent()
                .ok_or_else(|| MmxError::invalid_config("run extent is not set"))?;
            create_empty_site(
                service,
                &creds,
                &extent,
                descriptor.start_date(),
                descriptor.end_date(),
            )?
        }
    };
    order_predictor(service, &creds, &site, &options.predictor, raw_dir, &options.poll)
}

/// Puts the raw predictor rasters in `RAW_MERRA`, ordering them from the
/// service when no archive is already there.
pub fn acquire_predictors(
    descriptor: &RunDescriptor,
    layout: &RunLayout,
    options: &AcquireOptions,
    raster: &RasterTool,
    settings: &WranglerSettings,
) -> Result<Value> {
    ensure_dir(&layout.raw_dir)?;
    let zips = zip_archives(&layout.raw_dir)?;
    let archive = match zips.as_slice() {
        [] => {
            let service = HttpPredictorService::new(&settings.server)?;
            order_archive(descriptor, &layout.raw_dir, options, &service, settings)?
        }
        [one] => {
            info!(archive = %one.display(), "using existing archive");
            one.clone()
        }
        many => bail!(
            "expected at most one archive in {}, found {}",
            layout.raw_dir.display(),
            many.len()
        ),
    };

    extract_archive(&archive, &layout.raw_dir)?;
    let removed = remove_filler_images(&layout.raw_dir, raster)?;
    let kept = list_predictors(&layout.raw_dir)?;
    Ok(json!({
        "archive": archive,
        "images": kept.len(),
        "removed_filler": removed,
    }))
}
