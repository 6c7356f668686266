use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use clap::ValueEnum;

use crate::metrics::MetricFlags;
use crate::nvme::device::DeviceHandle;
use crate::nvme::discovery::WILDCARD;
use crate::nvme::error::NvmeError;

const MAX_DEVICE_PATH_LEN: usize = 255;
const MAX_DEVICE_NAME_LEN: usize = 32;

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub listen_address: SocketAddr,
    /// Normalized allow-list: bare device names plus the optional `*` entry.
    pub devices: Vec<String>,
    pub metric_flags: MetricFlags,
    pub log_level: String,
    pub log_format: LogFormat,
    pub ioctl_timeout: Duration,
}

impl Config {
    pub fn parse() -> Result<Self, NvmeError> {
        Self::from_args(CliArgs::parse())
    }

    fn from_args(args: CliArgs) -> Result<Self, NvmeError> {
        let listen_address = SocketAddr::from_str(&args.listen_address).map_err(|error| {
            NvmeError::Parse(format!(
                "invalid listen address '{}': {}",
                args.listen_address, error
            ))
        })?;

        let mut devices = Vec::with_capacity(args.devices.len());
        for entry in &args.devices {
            devices.push(validate_device_entry(entry)?);
        }

        for name in &args.disable_metrics {
            if !MetricFlags::is_known_metric(name) {
                return Err(NvmeError::Parse(format!("unknown metric name '{}'", name)));
            }
        }

        Ok(Self {
            listen_address,
            devices,
            metric_flags: MetricFlags::with_disabled(args.disable_metrics),
            log_level: args.log_level,
            log_format: args.log_format,
            ioctl_timeout: Duration::from_millis(5000),
        })
    }
}

/// Enforces the allow-list entry grammar: either the wildcard or an absolute
/// `/dev/nvme<C>n<N>[p<P>]` path with no traversal, no control bytes and the
/// lowercase alphanumeric device charset. Returns the bare device name.
fn validate_device_entry(entry: &str) -> Result<String, NvmeError> {
    if entry == WILDCARD {
        return Ok(entry.to_string());
    }

    if entry.len() > MAX_DEVICE_PATH_LEN {
        return Err(NvmeError::Parse(format!(
            "device path exceeds {} bytes",
            MAX_DEVICE_PATH_LEN
        )));
    }
    if entry.bytes().any(|byte| byte == 0 || byte.is_ascii_control()) {
        return Err(NvmeError::Parse(
            "device path contains control bytes".to_string(),
        ));
    }
    if entry.contains('\\')
        || entry.contains("..")
        || entry.contains("./")
        || entry.contains("//")
    {
        return Err(NvmeError::Parse(format!(
            "device path '{}' contains traversal sequences",
            entry
        )));
    }

    let name = entry.strip_prefix("/dev/").ok_or_else(|| {
        NvmeError::Parse(format!(
            "device entry '{}' must be '*' or an absolute /dev/nvme path",
            entry
        ))
    })?;

    if name.len() > MAX_DEVICE_NAME_LEN {
        return Err(NvmeError::Parse(format!(
            "device name exceeds {} bytes",
            MAX_DEVICE_NAME_LEN
        )));
    }
    if !name
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit())
    {
        return Err(NvmeError::Parse(format!(
            "device name '{}' has characters outside [0-9a-z]",
            name
        )));
    }

    DeviceHandle::parse(name)?;
    Ok(name.to_string())
}

#[derive(Clone, Debug, Parser)]
#[command(name = "ec2-nvme-exporter")]
#[command(about = "Prometheus exporter for EC2 NVMe performance counters")]
struct CliArgs {
    #[arg(
        short = 'l',
        long = "listen-address",
        env = "EC2_NVME_EXPORTER_LISTEN_ADDRESS",
        default_value = "0.0.0.0:9901"
    )]
    listen_address: String,

    /// Devices to collect from; repeat the flag or comma-separate. `*`
    /// admits every attached device. No entries means collect nothing.
    #[arg(
        short = 'd',
        long = "device",
        env = "EC2_NVME_EXPORTER_DEVICES",
        value_delimiter = ','
    )]
    devices: Vec<String>,

    /// Metric names to leave out of the emitted set.
    #[arg(
        long = "disable-metric",
        env = "EC2_NVME_EXPORTER_DISABLE_METRICS",
        value_delimiter = ','
    )]
    disable_metrics: Vec<String>,

    #[arg(
        long = "log-level",
        env = "EC2_NVME_EXPORTER_LOG_LEVEL",
        default_value = "info"
    )]
    log_level: String,

    #[arg(
        long = "log-format",
        env = "EC2_NVME_EXPORTER_LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Text
    )]
    log_format: LogFormat,
}
