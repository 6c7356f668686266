use std::fs;
use std::path::Path;

use crate::nvme::error::NvmeError;

/// Nitro instances surface the instance id through the DMI board asset tag.
const DMI_ASSET_TAG: &str = "/sys/devices/virtual/dmi/id/board_asset_tag";
const HOSTNAME: &str = "/proc/sys/kernel/hostname";

/// Injection seam for the instance-identifier lookup. Failure is never fatal
/// to a cycle; the scraper falls back to [`fallback_instance_id`].
pub trait InstanceIdProvider: Send + Sync {
    fn instance_id(&self) -> Result<String, NvmeError>;
}

/// Reads the instance id from DMI sysfs.
pub struct DmiInstanceIdProvider;

impl InstanceIdProvider for DmiInstanceIdProvider {
    fn instance_id(&self) -> Result<String, NvmeError> {
        let value = read_trimmed(Path::new(DMI_ASSET_TAG)).map_err(|source| {
            NvmeError::Metadata(format!("reading {}: {}", DMI_ASSET_TAG, source))
        })?;

        if !value.starts_with("i-") {
            return Err(NvmeError::Metadata(format!(
                "board asset tag '{}' is not an instance id",
                value
            )));
        }

        Ok(value)
    }
}

/// `unknown`, qualified with the hostname when one is readable.
pub fn fallback_instance_id() -> String {
    match read_trimmed(Path::new(HOSTNAME)) {
        Ok(hostname) if !hostname.is_empty() => format!("unknown-{}", hostname),
        _ => "unknown".to_string(),
    }
}

fn read_trimmed(path: &Path) -> std::io::Result<String> {
    let contents = fs::read_to_string(path)?;
    Ok(contents.trim().to_string())
}
