// ============================================================================
// FIRMWARE.RS - FIRMWARE HAND-OFF
// Stages a .bin image where the callback server serves it from and builds
// the URL the bulb downloads it through
// ============================================================================

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// How long the upgrade flow waits for the bulb to fetch the image
pub const FIRMWARE_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("file does not exist: {0}")]
    Missing(PathBuf),
    #[error("firmware file must have a .bin extension: {0}")]
    NotBin(PathBuf),
    #[error("could not copy firmware into {dir}: {source}")]
    Copy {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Copy `source` into `firmware_dir` unless a file of that name is already there.
///
/// Returns the bare file name the server will serve it under.
pub fn prepare_firmware_bin(source: &Path, firmware_dir: &Path) -> Result<String, FirmwareError> {
    if !source.is_file() {
        return Err(FirmwareError::Missing(source.to_path_buf()));
    }

    let name = source
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| n.to_ascii_lowercase().ends_with(".bin"))
        .ok_or_else(|| FirmwareError::NotBin(source.to_path_buf()))?
        .to_string();

    let dest = firmware_dir.join(&name);
    if dest.is_file() {
        debug!("Firmware {} already staged", name);
        return Ok(name);
    }

    let copy_err = |source| FirmwareError::Copy { dir: firmware_dir.to_path_buf(), source };
    std::fs::create_dir_all(firmware_dir).map_err(copy_err)?;
    std::fs::copy(source, &dest).map_err(copy_err)?;
    info!("Firmware file copied to: {}", dest.display());
    Ok(name)
}

pub fn firmware_url(host: IpAddr, port: u16, name: &str) -> String {
    format!("http://{}:{}/{}", host, port, name)
}
