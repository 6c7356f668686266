use crate::nvme::error::NvmeError;
use crate::nvme::types::DeviceFamily;
use crate::nvme::types::EbsMetrics;
use crate::nvme::types::InstanceStoreMetrics;
use crate::nvme::types::EBS_MAGIC;
use crate::nvme::types::INSTANCE_STORE_MAGIC;

const MAX_OPS: u64 = 1_000_000_000_000;
const MAX_BYTES: u64 = 1_000_000_000_000_000_000;
const MAX_TIME_NS: u64 = 1_000_000_000_000_000_000;
const MAX_QUEUE_LENGTH: u64 = 1_000_000;
const MAX_HISTOGRAMS: u64 = 10;
const MAX_BINS: u64 = 256;

/// One nanosecond-per-op average above this suggests a corrupt time counter.
const MAX_AVG_TIME_PER_OP_NS: u64 = 1_000_000_000;

/// Checks a decoded record before emission. A magic mismatch is a hard error
/// and suppresses the device; bounds and consistency findings come back as
/// warnings and the data is still emitted.
pub fn validate(device: &str, family: &DeviceFamily) -> Result<Vec<String>, NvmeError> {
    match family {
        DeviceFamily::Ebs(metrics) => validate_ebs(device, metrics),
        DeviceFamily::InstanceStore(metrics) => validate_instance_store(device, metrics),
    }
}

fn validate_ebs(device: &str, metrics: &EbsMetrics) -> Result<Vec<String>, NvmeError> {
    if metrics.magic != EBS_MAGIC {
        return Err(NvmeError::InvalidMagic {
            device: device.to_string(),
            found: metrics.magic,
        });
    }

    let mut warnings = Vec::new();
    check_bound(&mut warnings, "read_ops", metrics.read_ops, MAX_OPS);
    check_bound(&mut warnings, "write_ops", metrics.write_ops, MAX_OPS);
    check_bound(
        &mut warnings,
        "ebs_iops_exceeded",
        metrics.ebs_iops_exceeded,
        MAX_OPS,
    );
    check_bound(
        &mut warnings,
        "ebs_throughput_exceeded",
        metrics.ebs_throughput_exceeded,
        MAX_OPS,
    );
    check_bound(
        &mut warnings,
        "ec2_iops_exceeded",
        metrics.ec2_iops_exceeded,
        MAX_OPS,
    );
    check_bound(
        &mut warnings,
        "ec2_throughput_exceeded",
        metrics.ec2_throughput_exceeded,
        MAX_OPS,
    );
    check_bound(&mut warnings, "read_bytes", metrics.read_bytes, MAX_BYTES);
    check_bound(&mut warnings, "write_bytes", metrics.write_bytes, MAX_BYTES);
    check_bound(
        &mut warnings,
        "total_read_time",
        metrics.total_read_time,
        MAX_TIME_NS,
    );
    check_bound(
        &mut warnings,
        "total_write_time",
        metrics.total_write_time,
        MAX_TIME_NS,
    );
    check_bound(
        &mut warnings,
        "queue_length",
        metrics.queue_length,
        MAX_QUEUE_LENGTH,
    );

    check_transfer(
        &mut warnings,
        "read",
        metrics.read_ops,
        metrics.read_bytes,
        metrics.total_read_time,
    );
    check_transfer(
        &mut warnings,
        "write",
        metrics.write_ops,
        metrics.write_bytes,
        metrics.total_write_time,
    );

    if metrics.read_latency.bin_count == 0 && metrics.read_latency.total_count() > 0 {
        warnings.push("read latency histogram has counts but zero bins".to_string());
    }
    if metrics.write_latency.bin_count == 0 && metrics.write_latency.total_count() > 0 {
        warnings.push("write latency histogram has counts but zero bins".to_string());
    }

    Ok(warnings)
}

fn validate_instance_store(
    device: &str,
    metrics: &InstanceStoreMetrics,
) -> Result<Vec<String>, NvmeError> {
    if metrics.magic != INSTANCE_STORE_MAGIC {
        return Err(NvmeError::InvalidMagic {
            device: device.to_string(),
            found: u64::from(metrics.magic),
        });
    }

    let mut warnings = Vec::new();
    check_bound(&mut warnings, "read_ops", metrics.read_ops, MAX_OPS);
    check_bound(&mut warnings, "write_ops", metrics.write_ops, MAX_OPS);
    check_bound(
        &mut warnings,
        "ec2_iops_exceeded",
        metrics.ec2_iops_exceeded,
        MAX_OPS,
    );
    check_bound(
        &mut warnings,
        "ec2_throughput_exceeded",
        metrics.ec2_throughput_exceeded,
        MAX_OPS,
    );
    check_bound(&mut warnings, "read_bytes", metrics.read_bytes, MAX_BYTES);
    check_bound(&mut warnings, "write_bytes", metrics.write_bytes, MAX_BYTES);
    check_bound(
        &mut warnings,
        "total_read_time",
        metrics.total_read_time,
        MAX_TIME_NS,
    );
    check_bound(
        &mut warnings,
        "total_write_time",
        metrics.total_write_time,
        MAX_TIME_NS,
    );
    check_bound(
        &mut warnings,
        "queue_length",
        metrics.queue_length,
        MAX_QUEUE_LENGTH,
    );
    check_bound(
        &mut warnings,
        "num_histograms",
        metrics.num_histograms,
        MAX_HISTOGRAMS,
    );
    check_bound(&mut warnings, "num_bins", metrics.num_bins, MAX_BINS);

    check_transfer(
        &mut warnings,
        "read",
        metrics.read_ops,
        metrics.read_bytes,
        metrics.total_read_time,
    );
    check_transfer(
        &mut warnings,
        "write",
        metrics.write_ops,
        metrics.write_bytes,
        metrics.total_write_time,
    );

    if metrics.num_histograms > 0 && metrics.num_bins == 0 {
        warnings.push("histograms reported but zero bins".to_string());
    }

    Ok(warnings)
}

fn check_bound(warnings: &mut Vec<String>, field: &str, value: u64, limit: u64) {
    if value > limit {
        warnings.push(format!("{} = {} exceeds bound {}", field, value, limit));
    }
}

fn check_transfer(warnings: &mut Vec<String>, direction: &str, ops: u64, bytes: u64, time_ns: u64) {
    if bytes > 0 && ops == 0 {
        warnings.push(format!(
            "{} side reports {} bytes with zero ops",
            direction, bytes
        ));
    }
    if ops > 0 && time_ns / ops > MAX_AVG_TIME_PER_OP_NS {
        warnings.push(format!(
            "{} side averages {} ns per op, above the 1 s plausibility limit",
            direction,
            time_ns / ops
        ));
    }
}
