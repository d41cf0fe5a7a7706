use std::path::PathBuf;

use anyhow::{Context, Result};
use mmx_core::{ensure_dir, MmxError, RunDescriptor};
use tracing::info;

use crate::maxent::{copy_asc_files, write_samples_file, ModelingTool};
use crate::RunLayout;

/// Builds the final model from the selected predictors into `FINAL_MODEL`.
pub fn run_final_model(
    descriptor: &RunDescriptor,
    layout: &RunLayout,
    tool: &dyn ModelingTool,
) -> Result<PathBuf> {
    let top = descriptor.top_predictors();
    if top.is_empty() {
        return Err(MmxError::invalid_config(
            "no top predictors recorded; run the selector first",
        )
        .into());
    }
    let presence = descriptor
        .presence_file()
        .ok_or_else(|| MmxError::invalid_config("presence point file is not set"))?;

    let final_dir = &layout.final_dir;
    ensure_dir(final_dir)?;
    copy_asc_files(top, final_dir)
        .with_context(|| format!("copying top predictors into {}", final_dir.display()))?;
    let samples = write_samples_file(presence, descriptor.species(), final_dir)?;

    info!(predictors = top.len(), dir = %final_dir.display(), "running final model");
    tool.run_model(&samples, final_dir, final_dir)?;
    Ok(final_dir.clone())
}
