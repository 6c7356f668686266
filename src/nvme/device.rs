use std::path::PathBuf;

use crate::nvme::error::NvmeError;

/// One NVMe block device node, addressed as `nvme<C>n<N>` with an optional
/// `p<P>` partition suffix. Identity is the raw name.
#[derive(Clone, Debug)]
pub struct DeviceHandle {
    name: String,
    controller: u32,
    namespace: u32,
    partition: Option<u32>,
}

impl DeviceHandle {
    /// Parses a device name with the strict grammar
    /// `nvme<controller>n<namespace>(p<partition>)?`. Anything else is
    /// rejected, including bare controller nodes such as `nvme0`.
    pub fn parse(name: &str) -> Result<Self, NvmeError> {
        let rest = name
            .strip_prefix("nvme")
            .ok_or_else(|| bad_name(name, "missing nvme prefix"))?;

        let (controller, rest) = take_digits(name, rest)?;
        let rest = rest
            .strip_prefix('n')
            .ok_or_else(|| bad_name(name, "missing namespace separator"))?;
        let (namespace, rest) = take_digits(name, rest)?;

        let partition = if rest.is_empty() {
            None
        } else {
            let rest = rest
                .strip_prefix('p')
                .ok_or_else(|| bad_name(name, "unexpected trailing characters"))?;
            let (partition, rest) = take_digits(name, rest)?;
            if !rest.is_empty() {
                return Err(bad_name(name, "unexpected trailing characters"));
            }
            Some(partition)
        };

        Ok(Self {
            name: name.to_string(),
            controller,
            namespace,
            partition,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn controller(&self) -> u32 {
        self.controller
    }

    pub fn namespace(&self) -> u32 {
        self.namespace
    }

    pub fn partition(&self) -> Option<u32> {
        self.partition
    }

    pub fn dev_path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/{}", self.name))
    }
}

impl PartialEq for DeviceHandle {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for DeviceHandle {}

fn take_digits<'a>(name: &str, rest: &'a str) -> Result<(u32, &'a str), NvmeError> {
    let end = rest
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(rest.len());
    if end == 0 {
        return Err(bad_name(name, "expected digits"));
    }

    let value = rest[..end]
        .parse::<u32>()
        .map_err(|_| bad_name(name, "index out of range"))?;
    Ok((value, &rest[end..]))
}

fn bad_name(name: &str, reason: &str) -> NvmeError {
    NvmeError::Parse(format!("invalid nvme device name '{}': {}", name, reason))
}
