//! Model loading utilities.
//!
//! This module provides functions for:
//! - Loading SafeTensors weights into a `VarBuilder`
//! - Reading a scorer configuration from JSON

use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::VarBuilder;

use crate::config::ScorerConfig;
use crate::error::{Error, Result};

/// Creates a VarBuilder from SafeTensors files.
///
/// # Arguments
///
/// * `paths` - Paths to SafeTensors files
/// * `dtype` - Data type for tensors
/// * `device` - Device to load tensors to
///
/// # Safety
///
/// Uses memory-mapped file access. The files must not be modified while the
/// returned builder is alive.
#[allow(unsafe_code)]
pub fn load_safetensors(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    if paths.is_empty() {
        return Err(Error::ModelLoad("no weight files given".into()));
    }
    if let Some(missing) = paths.iter().find(|p| !p.exists()) {
        return Err(Error::ModelLoad(format!(
            "weight file {} does not exist",
            missing.display()
        )));
    }
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
    Ok(vb)
}

/// Loads a scorer configuration from a JSON file.
///
/// Missing fields take their defaults.
pub fn load_scorer_config(path: impl AsRef<Path>) -> Result<ScorerConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::ModelLoad(format!("Failed to read {}: {e}", path.display())))?;

    let config: ScorerConfig = serde_json::from_str(&content)
        .map_err(|e| Error::ModelLoad(format!("Failed to parse {}: {e}", path.display())))?;

    Ok(config)
}
