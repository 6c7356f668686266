use std::fs::OpenOptions;
use std::os::fd::AsRawFd;

use crate::nvme::device::DeviceHandle;
use crate::nvme::error::NvmeError;
use crate::nvme::ioctl;
use crate::nvme::types::VENDOR_LOG_PAGE_ID;

/// Injection seam for the privileged log-page read. The detector and the
/// metrics path both go through this trait; tests substitute canned buffers.
pub trait LogPageReader: Send + Sync {
    fn read_log_page(&self, device: &DeviceHandle, buffer: &mut [u8]) -> Result<(), NvmeError>;
}

/// Reads the vendor performance log page from the live device node.
pub struct DeviceLogPageReader {
    timeout_ms: u32,
}

impl DeviceLogPageReader {
    pub fn new(timeout_ms: u32) -> Self {
        Self { timeout_ms }
    }
}

impl LogPageReader for DeviceLogPageReader {
    fn read_log_page(&self, device: &DeviceHandle, buffer: &mut [u8]) -> Result<(), NvmeError> {
        let path = device.dev_path();
        let file = OpenOptions::new().read(true).open(&path).map_err(|source| {
            let device = path.display().to_string();
            match source.kind() {
                std::io::ErrorKind::NotFound => NvmeError::DeviceNotFound { device },
                std::io::ErrorKind::PermissionDenied => NvmeError::PermissionDenied { device },
                _ if source.raw_os_error() == Some(libc::EBUSY) => {
                    NvmeError::DeviceBusy { device }
                }
                _ => NvmeError::io_path(&path, source),
            }
        })?;

        ioctl::get_log_page(
            file.as_raw_fd(),
            &path.display().to_string(),
            device.namespace(),
            VENDOR_LOG_PAGE_ID,
            buffer,
            self.timeout_ms,
        )
    }
}
