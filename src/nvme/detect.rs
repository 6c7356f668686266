use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use tracing::debug;
use tracing::warn;

use crate::nvme::buffer::BufferPool;
use crate::nvme::cache::CachedDetection;
use crate::nvme::cache::TypeCache;
use crate::nvme::cache::FAILURE_TTL;
use crate::nvme::cache::SUCCESS_TTL;
use crate::nvme::device::DeviceHandle;
use crate::nvme::error::NvmeError;
use crate::nvme::reader::LogPageReader;
use crate::nvme::types::read_u32_le;
use crate::nvme::types::read_u64_le;
use crate::nvme::types::DeviceType;
use crate::nvme::types::EBS_MAGIC;
use crate::nvme::types::INSTANCE_STORE_MAGIC;
use crate::scraper::CancelFlag;

pub const DETECTION_ATTEMPTS: u32 = 3;
pub const DETECTION_BASE_DELAY: Duration = Duration::from_millis(100);

/// Injection seam for controller serial retrieval.
pub trait SerialProvider: Send + Sync {
    fn serial(&self, controller: u32) -> Result<String, NvmeError>;
}

/// Reads the controller serial from sysfs.
pub struct SysfsSerialProvider;

impl SerialProvider for SysfsSerialProvider {
    fn serial(&self, controller: u32) -> Result<String, NvmeError> {
        let path = PathBuf::from(format!("/sys/class/nvme/nvme{}/serial", controller));
        let contents =
            fs::read_to_string(&path).map_err(|source| NvmeError::io_path(&path, source))?;
        let trimmed = contents.trim();
        if trimmed.is_empty() {
            return Err(NvmeError::Parse(format!(
                "empty serial for controller {}",
                controller
            )));
        }
        Ok(trimmed.to_string())
    }
}

/// Classifies the primary device of a controller group by probing the leading
/// magic word of its log page, going through the cache first. Recoverable
/// probe errors are retried with linear backoff; exhaustion is cached under
/// the short failure TTL so the next cycles back off too, while
/// non-recoverable errors are surfaced uncached.
pub fn detect_device_type(
    reader: &dyn LogPageReader,
    cache: &TypeCache,
    pool: &BufferPool,
    primary: &DeviceHandle,
    cancel: &CancelFlag,
) -> Result<DeviceType, NvmeError> {
    let controller = primary.controller();
    let namespace = primary.namespace();

    match cache.get(controller, namespace) {
        Some(CachedDetection::Known(device_type)) => return Ok(device_type),
        Some(CachedDetection::Failed) => {
            return Err(NvmeError::DetectionFailed {
                device: primary.name().to_string(),
                detail: "recent failure cached, backing off".to_string(),
            })
        }
        None => {}
    }

    let mut attempt = 1_u32;
    loop {
        match probe(reader, pool, primary) {
            Ok(device_type) => {
                cache.set(
                    controller,
                    namespace,
                    CachedDetection::Known(device_type),
                    SUCCESS_TTL,
                );
                return Ok(device_type);
            }
            Err(error) => {
                if !error.is_recoverable() {
                    return Err(error);
                }
                if attempt >= DETECTION_ATTEMPTS
                    || !backoff_sleep(attempt, DETECTION_BASE_DELAY, cancel)
                {
                    cache.set(controller, namespace, CachedDetection::Failed, FAILURE_TTL);
                    return Err(error);
                }
                debug!(
                    device = %primary.name(),
                    attempt,
                    error = %error,
                    "type detection attempt failed, retrying"
                );
                attempt += 1;
            }
        }
    }
}

fn probe(
    reader: &dyn LogPageReader,
    pool: &BufferPool,
    primary: &DeviceHandle,
) -> Result<DeviceType, NvmeError> {
    let mut buffer = pool.acquire();
    reader.read_log_page(primary, &mut buffer)?;

    let leading_word = read_u64_le(&buffer, 0)?;
    if leading_word == EBS_MAGIC {
        return Ok(DeviceType::Ebs);
    }
    let leading_half = read_u32_le(&buffer, 0)?;
    if leading_half == INSTANCE_STORE_MAGIC {
        return Ok(DeviceType::InstanceStore);
    }

    Err(NvmeError::DetectionFailed {
        device: primary.name().to_string(),
        detail: format!("unrecognized magic word {:#010x}", leading_half),
    })
}

/// Sleeps `attempt × base` between retries. Returns false without sleeping
/// when the cycle has been cancelled, which ends the retry loop.
pub(crate) fn backoff_sleep(attempt: u32, base: Duration, cancel: &CancelFlag) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    std::thread::sleep(base * attempt);
    true
}

/// Derives the resource identifier from a controller serial. EBS serials of
/// the form `vol<hex>` become canonical `vol-<hex>` volume ids; anything else
/// passes through verbatim.
pub fn identifier_from_serial(device_type: DeviceType, serial: &str) -> String {
    match device_type {
        DeviceType::Ebs => match serial.strip_prefix("vol") {
            Some(rest) if !rest.is_empty() => format!("vol-{}", rest),
            _ => {
                warn!(
                    serial = %serial,
                    "EBS serial does not carry the vol prefix, using it verbatim"
                );
                serial.to_string()
            }
        },
        _ => serial.to_string(),
    }
}

/// Identifier used when serial retrieval fails; the group is still admitted.
pub fn fallback_identifier(device_type: DeviceType, controller: u32) -> String {
    format!("unknown-{}-controller-{}", device_type.as_str(), controller)
}
