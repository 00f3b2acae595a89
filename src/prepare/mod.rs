use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::PrepareError;

pub const DEFAULT_SOURCE: &str = ".pio/build/pixel_s3/firmware.bin";
pub const DEFAULT_DEST_DIR: &str = "data";
pub const STAGED_FILE_NAME: &str = "firmware.bin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedFirmware {
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl PreparedFirmware {
    pub fn size_kb(&self) -> f64 {
        self.size_bytes as f64 / 1024.0
    }
}

/// Copy a built firmware image into the staging directory as `firmware.bin`.
pub fn stage_firmware(source: &Path, dest_dir: &Path) -> Result<PreparedFirmware, PrepareError> {
    let metadata = match std::fs::metadata(source) {
        Ok(metadata) if metadata.is_file() => metadata,
        _ => return Err(PrepareError::SourceMissing(source.to_path_buf())),
    };
    info!(
        source = %source.display(),
        "Found firmware: {:.2} KB",
        metadata.len() as f64 / 1024.0
    );

    if !dest_dir.exists() {
        info!(dir = %dest_dir.display(), "Creating staging directory");
        std::fs::create_dir_all(dest_dir).map_err(|source| PrepareError::Io {
            path: dest_dir.to_path_buf(),
            source,
        })?;
    }

    let dest = dest_dir.join(STAGED_FILE_NAME);
    let size_bytes = std::fs::copy(source, &dest).map_err(|source| PrepareError::Io {
        path: dest.clone(),
        source,
    })?;

    Ok(PreparedFirmware {
        path: dest,
        size_bytes,
    })
}
