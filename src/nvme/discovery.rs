use std::collections::HashMap;
use std::collections::HashSet;

use crate::nvme::device::DeviceHandle;
use crate::nvme::error::NvmeError;

pub const WILDCARD: &str = "*";

/// Injection seam for device enumeration and the platform probe. The scraper
/// only ever talks to this trait; tests substitute fixed fleets.
pub trait DeviceSource: Send + Sync {
    fn platform_supported(&self) -> bool;

    /// Returns every NVMe namespace device on the host, unfiltered. Ordering
    /// must be stable within a cycle.
    fn devices(&self) -> Result<Vec<DeviceHandle>, NvmeError>;
}

/// Enumerates NVMe namespace nodes under /dev. Controller character devices
/// (`nvme0`) and anything failing the name grammar are skipped.
pub struct DevfsSource;

impl DeviceSource for DevfsSource {
    fn platform_supported(&self) -> bool {
        cfg!(target_os = "linux")
    }

    #[cfg(target_os = "linux")]
    fn devices(&self) -> Result<Vec<DeviceHandle>, NvmeError> {
        let paths = glob::glob("/dev/nvme*")
            .map_err(|error| NvmeError::Parse(format!("invalid device glob: {}", error)))?;

        let mut devices = Vec::new();
        for path_result in paths {
            let path = match path_result {
                Ok(value) => value,
                Err(error) => {
                    return Err(NvmeError::Parse(format!(
                        "failed to read /dev glob path: {}",
                        error
                    )))
                }
            };

            let Some(file_name) = path.file_name() else {
                continue;
            };
            let name = file_name.to_string_lossy();
            if let Ok(device) = DeviceHandle::parse(&name) {
                devices.push(device);
            }
        }

        devices.sort_by(|left, right| left.name().cmp(right.name()));
        Ok(devices)
    }

    #[cfg(not(target_os = "linux"))]
    fn devices(&self) -> Result<Vec<DeviceHandle>, NvmeError> {
        Err(NvmeError::PlatformUnsupported)
    }
}

/// The user allow-list. A `*` entry anywhere admits every device; otherwise
/// only exact name matches are admitted.
pub struct DeviceFilter {
    allow_all: bool,
    names: HashSet<String>,
}

impl DeviceFilter {
    pub fn new(entries: &[String]) -> Self {
        let allow_all = entries.iter().any(|entry| entry == WILDCARD);
        let names = entries
            .iter()
            .filter(|entry| entry.as_str() != WILDCARD)
            .cloned()
            .collect();

        Self { allow_all, names }
    }

    pub fn admits(&self, name: &str) -> bool {
        self.allow_all || self.names.contains(name)
    }
}

/// Devices sharing one controller, folded into a single work unit for the
/// cycle. The first device in enumeration order is the primary and drives
/// type detection and serial retrieval.
#[derive(Clone, Debug)]
pub struct ControllerGroup {
    pub controller: u32,
    pub devices: Vec<DeviceHandle>,
}

impl ControllerGroup {
    pub fn primary(&self) -> &DeviceHandle {
        &self.devices[0]
    }
}

/// Folds devices by controller index, preserving first-seen order of both
/// groups and members.
pub fn group_by_controller(devices: Vec<DeviceHandle>) -> Vec<ControllerGroup> {
    let mut groups: Vec<ControllerGroup> = Vec::new();
    let mut index_by_controller: HashMap<u32, usize> = HashMap::new();

    for device in devices {
        match index_by_controller.get(&device.controller()) {
            Some(&position) => groups[position].devices.push(device),
            None => {
                index_by_controller.insert(device.controller(), groups.len());
                groups.push(ControllerGroup {
                    controller: device.controller(),
                    devices: vec![device],
                });
            }
        }
    }

    groups
}
