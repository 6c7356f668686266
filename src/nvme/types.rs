use std::fmt;
use std::str::FromStr;

use crate::nvme::error::NvmeError;

pub const LOG_PAGE_BYTES: usize = 4096;
pub const VENDOR_LOG_PAGE_ID: u8 = 0xD0;

pub const EBS_MAGIC: u64 = 0x3C23_B510;
pub const INSTANCE_STORE_MAGIC: u32 = 0xEC2C_0D7E;

pub const HISTOGRAM_BINS: usize = 64;
const RESERVED_BYTES: usize = 416;
const HISTOGRAM_BYTES: usize = 8 + HISTOGRAM_BINS * 24;

/// Minimum bytes an EBS log page must carry: magic, eleven counters, the
/// reserved area and both latency histograms.
pub const EBS_LOG_BYTES: usize = 8 + 11 * 8 + RESERVED_BYTES + 2 * HISTOGRAM_BYTES;

/// Minimum bytes an instance store log page must carry: the u32 magic, nine
/// counters and the histogram metadata, packed without padding.
pub const INSTANCE_STORE_LOG_BYTES: usize = 4 + 11 * 8;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DeviceType {
    Unknown,
    Ebs,
    InstanceStore,
}

impl DeviceType {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Unknown => "unknown",
            DeviceType::Ebs => "ebs",
            DeviceType::InstanceStore => "instance_store",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = std::convert::Infallible;

    /// Textual configuration is the only producer of `Unknown`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "ebs" => DeviceType::Ebs,
            "instance_store" => DeviceType::InstanceStore,
            _ => DeviceType::Unknown,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct HistogramBin {
    pub lower: u64,
    pub upper: u64,
    pub count: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LatencyHistogram {
    pub bin_count: u64,
    pub bins: [HistogramBin; HISTOGRAM_BINS],
}

impl LatencyHistogram {
    pub fn total_count(&self) -> u64 {
        self.bins
            .iter()
            .fold(0_u64, |total, bin| total.saturating_add(bin.count))
    }

    fn parse(bytes: &[u8], offset: usize) -> Result<Self, NvmeError> {
        let bin_count = read_u64_le(bytes, offset)?;
        let mut bins = [HistogramBin::default(); HISTOGRAM_BINS];
        let mut bin_index = 0_usize;
        while bin_index < HISTOGRAM_BINS {
            let bin_offset = offset + 8 + bin_index * 24;
            bins[bin_index] = HistogramBin {
                lower: read_u64_le(bytes, bin_offset)?,
                upper: read_u64_le(bytes, bin_offset + 8)?,
                count: read_u64_le(bytes, bin_offset + 16)?,
            };
            bin_index += 1;
        }

        Ok(Self { bin_count, bins })
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self {
            bin_count: 0,
            bins: [HistogramBin::default(); HISTOGRAM_BINS],
        }
    }
}

/// Decoded EBS performance log page. Field order mirrors the wire layout,
/// which is contractual.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EbsMetrics {
    pub magic: u64,
    pub read_ops: u64,
    pub write_ops: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub total_read_time: u64,
    pub total_write_time: u64,
    pub ebs_iops_exceeded: u64,
    pub ebs_throughput_exceeded: u64,
    pub ec2_iops_exceeded: u64,
    pub ec2_throughput_exceeded: u64,
    pub queue_length: u64,
    pub read_latency: LatencyHistogram,
    pub write_latency: LatencyHistogram,
}

impl EbsMetrics {
    pub fn parse(device: &str, bytes: &[u8]) -> Result<Self, NvmeError> {
        if bytes.len() < EBS_LOG_BYTES {
            return Err(NvmeError::UnexpectedSize {
                expected: EBS_LOG_BYTES,
                actual: bytes.len(),
            });
        }

        let magic = read_u64_le(bytes, 0)?;
        if magic != EBS_MAGIC {
            return Err(NvmeError::InvalidMagic {
                device: device.to_string(),
                found: magic,
            });
        }

        let histograms_at = 8 + 11 * 8 + RESERVED_BYTES;
        Ok(Self {
            magic,
            read_ops: read_u64_le(bytes, 8)?,
            write_ops: read_u64_le(bytes, 16)?,
            read_bytes: read_u64_le(bytes, 24)?,
            write_bytes: read_u64_le(bytes, 32)?,
            total_read_time: read_u64_le(bytes, 40)?,
            total_write_time: read_u64_le(bytes, 48)?,
            ebs_iops_exceeded: read_u64_le(bytes, 56)?,
            ebs_throughput_exceeded: read_u64_le(bytes, 64)?,
            ec2_iops_exceeded: read_u64_le(bytes, 72)?,
            ec2_throughput_exceeded: read_u64_le(bytes, 80)?,
            queue_length: read_u64_le(bytes, 88)?,
            read_latency: LatencyHistogram::parse(bytes, histograms_at)?,
            write_latency: LatencyHistogram::parse(bytes, histograms_at + HISTOGRAM_BYTES)?,
        })
    }
}

/// Decoded instance store performance log page. Instance store has no
/// volume-level exceed counters, only the EC2 instance-level pair, and
/// carries histogram metadata instead of inline bins.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InstanceStoreMetrics {
    pub magic: u32,
    pub read_ops: u64,
    pub write_ops: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub total_read_time: u64,
    pub total_write_time: u64,
    pub ec2_iops_exceeded: u64,
    pub ec2_throughput_exceeded: u64,
    pub queue_length: u64,
    pub num_histograms: u64,
    pub num_bins: u64,
}

impl InstanceStoreMetrics {
    pub fn parse(device: &str, bytes: &[u8]) -> Result<Self, NvmeError> {
        if bytes.len() < INSTANCE_STORE_LOG_BYTES {
            return Err(NvmeError::UnexpectedSize {
                expected: INSTANCE_STORE_LOG_BYTES,
                actual: bytes.len(),
            });
        }

        let magic = read_u32_le(bytes, 0)?;
        if magic != INSTANCE_STORE_MAGIC {
            return Err(NvmeError::InvalidMagic {
                device: device.to_string(),
                found: u64::from(magic),
            });
        }

        Ok(Self {
            magic,
            read_ops: read_u64_le(bytes, 4)?,
            write_ops: read_u64_le(bytes, 12)?,
            read_bytes: read_u64_le(bytes, 20)?,
            write_bytes: read_u64_le(bytes, 28)?,
            total_read_time: read_u64_le(bytes, 36)?,
            total_write_time: read_u64_le(bytes, 44)?,
            ec2_iops_exceeded: read_u64_le(bytes, 52)?,
            ec2_throughput_exceeded: read_u64_le(bytes, 60)?,
            queue_length: read_u64_le(bytes, 68)?,
            num_histograms: read_u64_le(bytes, 76)?,
            num_bins: read_u64_le(bytes, 84)?,
        })
    }
}

/// One controller's decoded metrics, dispatched by family at a single point.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceFamily {
    Ebs(EbsMetrics),
    InstanceStore(InstanceStoreMetrics),
}

impl DeviceFamily {
    pub fn device_type(&self) -> DeviceType {
        match self {
            DeviceFamily::Ebs(_) => DeviceType::Ebs,
            DeviceFamily::InstanceStore(_) => DeviceType::InstanceStore,
        }
    }
}

pub(crate) fn read_u32_le(bytes: &[u8], offset: usize) -> Result<u32, NvmeError> {
    let src = slice::<4>(bytes, offset)?;
    let mut value = [0_u8; 4];
    value.copy_from_slice(src);
    Ok(u32::from_le_bytes(value))
}

pub(crate) fn read_u64_le(bytes: &[u8], offset: usize) -> Result<u64, NvmeError> {
    let src = slice::<8>(bytes, offset)?;
    let mut value = [0_u8; 8];
    value.copy_from_slice(src);
    Ok(u64::from_le_bytes(value))
}

fn slice<const N: usize>(bytes: &[u8], offset: usize) -> Result<&[u8], NvmeError> {
    let end = offset.saturating_add(N);
    bytes.get(offset..end).ok_or_else(|| {
        NvmeError::Parse(format!(
            "requested range {}..{} from buffer of length {}",
            offset,
            end,
            bytes.len()
        ))
    })
}
