use std::collections::BTreeMap;
use std::collections::HashSet;
use std::time::SystemTime;

use prometheus::Encoder;
use prometheus::Gauge;
use prometheus::IntCounterVec;
use prometheus::IntGauge;
use prometheus::IntGaugeVec;
use prometheus::Opts;
use prometheus::Registry;
use prometheus::TextEncoder;
use tracing::debug;

use crate::nvme::error::ErrorClass;
use crate::nvme::error::NvmeError;
use crate::nvme::types::DeviceFamily;
use crate::nvme::types::DeviceType;
use crate::nvme::types::EbsMetrics;
use crate::nvme::types::InstanceStoreMetrics;

pub const EBS_TOTAL_READ_OPS: &str = "diskio_ebs_total_read_ops";
pub const EBS_TOTAL_WRITE_OPS: &str = "diskio_ebs_total_write_ops";
pub const EBS_TOTAL_READ_BYTES: &str = "diskio_ebs_total_read_bytes";
pub const EBS_TOTAL_WRITE_BYTES: &str = "diskio_ebs_total_write_bytes";
pub const EBS_TOTAL_READ_TIME: &str = "diskio_ebs_total_read_time";
pub const EBS_TOTAL_WRITE_TIME: &str = "diskio_ebs_total_write_time";
pub const EBS_VOLUME_EXCEEDED_IOPS: &str = "diskio_ebs_volume_performance_exceeded_iops";
pub const EBS_VOLUME_EXCEEDED_TP: &str = "diskio_ebs_volume_performance_exceeded_tp";
pub const EBS_EC2_EXCEEDED_IOPS: &str = "diskio_ebs_ec2_instance_performance_exceeded_iops";
pub const EBS_EC2_EXCEEDED_TP: &str = "diskio_ebs_ec2_instance_performance_exceeded_tp";
pub const EBS_VOLUME_QUEUE_LENGTH: &str = "diskio_ebs_volume_queue_length";

pub const IS_TOTAL_READ_OPS: &str = "diskio_instance_store_total_read_ops";
pub const IS_TOTAL_WRITE_OPS: &str = "diskio_instance_store_total_write_ops";
pub const IS_TOTAL_READ_BYTES: &str = "diskio_instance_store_total_read_bytes";
pub const IS_TOTAL_WRITE_BYTES: &str = "diskio_instance_store_total_write_bytes";
pub const IS_TOTAL_READ_TIME: &str = "diskio_instance_store_total_read_time";
pub const IS_TOTAL_WRITE_TIME: &str = "diskio_instance_store_total_write_time";
pub const IS_VOLUME_EXCEEDED_IOPS: &str =
    "diskio_instance_store_volume_performance_exceeded_iops";
pub const IS_VOLUME_EXCEEDED_TP: &str = "diskio_instance_store_volume_performance_exceeded_tp";
pub const IS_VOLUME_QUEUE_LENGTH: &str = "diskio_instance_store_volume_queue_length";

pub const EBS_METRIC_NAMES: [&str; 11] = [
    EBS_TOTAL_READ_OPS,
    EBS_TOTAL_WRITE_OPS,
    EBS_TOTAL_READ_BYTES,
    EBS_TOTAL_WRITE_BYTES,
    EBS_TOTAL_READ_TIME,
    EBS_TOTAL_WRITE_TIME,
    EBS_VOLUME_EXCEEDED_IOPS,
    EBS_VOLUME_EXCEEDED_TP,
    EBS_EC2_EXCEEDED_IOPS,
    EBS_EC2_EXCEEDED_TP,
    EBS_VOLUME_QUEUE_LENGTH,
];

pub const INSTANCE_STORE_METRIC_NAMES: [&str; 9] = [
    IS_TOTAL_READ_OPS,
    IS_TOTAL_WRITE_OPS,
    IS_TOTAL_READ_BYTES,
    IS_TOTAL_WRITE_BYTES,
    IS_TOTAL_READ_TIME,
    IS_TOTAL_WRITE_TIME,
    IS_VOLUME_EXCEEDED_IOPS,
    IS_VOLUME_EXCEEDED_TP,
    IS_VOLUME_QUEUE_LENGTH,
];

/// Every emitted resource carries these four labels.
const RESOURCE_LABELS: [&str; 4] = ["instance_id", "device_type", "device", "serial_number"];

/// Accessor tables keyed by field position keep the emission hot path free of
/// name lookups and allocation.
const EBS_COUNTER_FIELDS: [(&str, fn(&EbsMetrics) -> u64); 10] = [
    (EBS_TOTAL_READ_OPS, |metrics| metrics.read_ops),
    (EBS_TOTAL_WRITE_OPS, |metrics| metrics.write_ops),
    (EBS_TOTAL_READ_BYTES, |metrics| metrics.read_bytes),
    (EBS_TOTAL_WRITE_BYTES, |metrics| metrics.write_bytes),
    (EBS_TOTAL_READ_TIME, |metrics| metrics.total_read_time),
    (EBS_TOTAL_WRITE_TIME, |metrics| metrics.total_write_time),
    (EBS_VOLUME_EXCEEDED_IOPS, |metrics| metrics.ebs_iops_exceeded),
    (EBS_VOLUME_EXCEEDED_TP, |metrics| {
        metrics.ebs_throughput_exceeded
    }),
    (EBS_EC2_EXCEEDED_IOPS, |metrics| metrics.ec2_iops_exceeded),
    (EBS_EC2_EXCEEDED_TP, |metrics| {
        metrics.ec2_throughput_exceeded
    }),
];

const INSTANCE_STORE_COUNTER_FIELDS: [(&str, fn(&InstanceStoreMetrics) -> u64); 8] = [
    (IS_TOTAL_READ_OPS, |metrics| metrics.read_ops),
    (IS_TOTAL_WRITE_OPS, |metrics| metrics.write_ops),
    (IS_TOTAL_READ_BYTES, |metrics| metrics.read_bytes),
    (IS_TOTAL_WRITE_BYTES, |metrics| metrics.write_bytes),
    (IS_TOTAL_READ_TIME, |metrics| metrics.total_read_time),
    (IS_TOTAL_WRITE_TIME, |metrics| metrics.total_write_time),
    (IS_VOLUME_EXCEEDED_IOPS, |metrics| metrics.ec2_iops_exceeded),
    (IS_VOLUME_EXCEEDED_TP, |metrics| {
        metrics.ec2_throughput_exceeded
    }),
];

/// Per-metric enable flags. Everything is enabled unless explicitly disabled;
/// a family whose every metric is disabled makes its devices skippable.
#[derive(Clone, Debug, Default)]
pub struct MetricFlags {
    disabled: HashSet<String>,
}

impl MetricFlags {
    pub fn all_enabled() -> Self {
        Self::default()
    }

    pub fn with_disabled(names: impl IntoIterator<Item = String>) -> Self {
        Self {
            disabled: names.into_iter().collect(),
        }
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        !self.disabled.contains(name)
    }

    pub fn any_ebs_enabled(&self) -> bool {
        EBS_METRIC_NAMES.iter().any(|name| self.is_enabled(name))
    }

    pub fn any_instance_store_enabled(&self) -> bool {
        INSTANCE_STORE_METRIC_NAMES
            .iter()
            .any(|name| self.is_enabled(name))
    }

    pub fn is_known_metric(name: &str) -> bool {
        EBS_METRIC_NAMES.contains(&name) || INSTANCE_STORE_METRIC_NAMES.contains(&name)
    }
}

/// One controller group's emission: the resource attributes and the decoded
/// family record.
#[derive(Clone, Debug)]
pub struct GroupMetrics {
    pub device: String,
    pub serial_number: String,
    pub family: DeviceFamily,
}

impl GroupMetrics {
    pub fn device_type(&self) -> DeviceType {
        self.family.device_type()
    }
}

/// Outcome of one scrape cycle.
#[derive(Clone, Debug)]
pub struct ScrapeReport {
    pub duration_seconds: f64,
    pub timestamp: SystemTime,
    pub instance_id: String,
    pub admitted_groups: usize,
    pub skipped_groups: usize,
    pub groups: Vec<GroupMetrics>,
    pub errors: BTreeMap<ErrorClass, u64>,
}

impl ScrapeReport {
    pub fn empty(instance_id: impl Into<String>) -> Self {
        Self {
            duration_seconds: 0.0,
            timestamp: SystemTime::now(),
            instance_id: instance_id.into(),
            admitted_groups: 0,
            skipped_groups: 0,
            groups: Vec::new(),
            errors: BTreeMap::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn failed_groups(&self) -> u64 {
        self.errors.values().sum()
    }
}

pub fn encode_report(report: &ScrapeReport, flags: &MetricFlags) -> Result<String, NvmeError> {
    let registry = Registry::new();

    let mut ebs_counters = Vec::with_capacity(EBS_COUNTER_FIELDS.len());
    for (name, accessor) in EBS_COUNTER_FIELDS {
        let vec = register_int_counter_vec(&registry, name, counter_help(name))?;
        ebs_counters.push((name, accessor, vec));
    }
    let ebs_queue_length = register_int_gauge_vec(
        &registry,
        EBS_VOLUME_QUEUE_LENGTH,
        "Current EBS volume queue length",
    )?;

    let mut instance_store_counters = Vec::with_capacity(INSTANCE_STORE_COUNTER_FIELDS.len());
    for (name, accessor) in INSTANCE_STORE_COUNTER_FIELDS {
        let vec = register_int_counter_vec(&registry, name, counter_help(name))?;
        instance_store_counters.push((name, accessor, vec));
    }
    let instance_store_queue_length = register_int_gauge_vec(
        &registry,
        IS_VOLUME_QUEUE_LENGTH,
        "Current instance store volume queue length",
    )?;

    let scrape_duration = register_gauge(
        &registry,
        "ec2_nvme_scrape_duration_seconds",
        "Time to collect all device metrics",
    )?;
    let scrape_success = register_int_gauge(
        &registry,
        "ec2_nvme_scrape_success",
        "1 if the cycle collected without errors, 0 otherwise",
    )?;
    let device_count = register_int_gauge(
        &registry,
        "ec2_nvme_device_count",
        "Number of admitted NVMe controller groups",
    )?;
    let scrape_errors = register_int_gauge_vec_with_labels(
        &registry,
        "ec2_nvme_scrape_errors",
        "Failed controller groups in this cycle by error class",
        &["class"],
    )?;

    for group in &report.groups {
        let device_type = group.device_type();
        let labels = [
            report.instance_id.as_str(),
            device_type.as_str(),
            group.device.as_str(),
            group.serial_number.as_str(),
        ];

        match &group.family {
            DeviceFamily::Ebs(metrics) => {
                for (name, accessor, vec) in &ebs_counters {
                    record_counter(vec, name, &labels, accessor(metrics), flags);
                }
                record_gauge(
                    &ebs_queue_length,
                    EBS_VOLUME_QUEUE_LENGTH,
                    &labels,
                    metrics.queue_length,
                    flags,
                );
            }
            DeviceFamily::InstanceStore(metrics) => {
                for (name, accessor, vec) in &instance_store_counters {
                    record_counter(vec, name, &labels, accessor(metrics), flags);
                }
                record_gauge(
                    &instance_store_queue_length,
                    IS_VOLUME_QUEUE_LENGTH,
                    &labels,
                    metrics.queue_length,
                    flags,
                );
            }
        }
    }

    for (class, count) in &report.errors {
        if let Ok(count) = i64::try_from(*count) {
            scrape_errors.with_label_values(&[class.as_str()]).set(count);
        }
    }

    scrape_duration.set(report.duration_seconds);
    scrape_success.set(i64::from(report.success()));
    device_count.set(report.admitted_groups as i64);

    let metric_families = registry.gather();
    let mut buffer = Vec::<u8>::new();
    TextEncoder::new()
        .encode(&metric_families, &mut buffer)
        .map_err(|error| NvmeError::Internal(format!("failed to encode metrics: {}", error)))?;

    String::from_utf8(buffer)
        .map_err(|error| NvmeError::Internal(format!("metrics are not valid utf8: {}", error)))
}

/// Counters are recorded only when the source value fits a signed 64-bit
/// integer; larger values are treated as corruption and skipped.
fn record_counter(
    vec: &IntCounterVec,
    name: &str,
    labels: &[&str; 4],
    value: u64,
    flags: &MetricFlags,
) {
    if !flags.is_enabled(name) {
        return;
    }
    if i64::try_from(value).is_err() {
        debug!(metric = name, value, "counter exceeds i64 range, skipping");
        return;
    }
    vec.with_label_values(labels).inc_by(value);
}

fn record_gauge(
    vec: &IntGaugeVec,
    name: &str,
    labels: &[&str; 4],
    value: u64,
    flags: &MetricFlags,
) {
    if !flags.is_enabled(name) {
        return;
    }
    match i64::try_from(value) {
        Ok(value) => vec.with_label_values(labels).set(value),
        Err(_) => debug!(metric = name, value, "gauge exceeds i64 range, skipping"),
    }
}

fn counter_help(name: &str) -> &'static str {
    if name.ends_with("_bytes") {
        "Cumulative bytes transferred"
    } else if name.ends_with("_time") {
        "Cumulative I/O time in nanoseconds"
    } else if name.contains("exceeded") {
        "Cumulative microseconds the device was throttled"
    } else {
        "Cumulative completed operations"
    }
}

fn register_gauge(registry: &Registry, name: &str, help: &str) -> Result<Gauge, NvmeError> {
    let gauge = Gauge::with_opts(Opts::new(name, help))
        .map_err(|error| NvmeError::Internal(format!("failed to create {}: {}", name, error)))?;
    registry
        .register(Box::new(gauge.clone()))
        .map_err(|error| NvmeError::Internal(format!("failed to register {}: {}", name, error)))?;
    Ok(gauge)
}

fn register_int_gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, NvmeError> {
    let gauge = IntGauge::with_opts(Opts::new(name, help))
        .map_err(|error| NvmeError::Internal(format!("failed to create {}: {}", name, error)))?;
    registry
        .register(Box::new(gauge.clone()))
        .map_err(|error| NvmeError::Internal(format!("failed to register {}: {}", name, error)))?;
    Ok(gauge)
}

fn register_int_counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
) -> Result<IntCounterVec, NvmeError> {
    let metric = IntCounterVec::new(Opts::new(name, help), &RESOURCE_LABELS)
        .map_err(|error| NvmeError::Internal(format!("failed to create {}: {}", name, error)))?;
    registry
        .register(Box::new(metric.clone()))
        .map_err(|error| NvmeError::Internal(format!("failed to register {}: {}", name, error)))?;
    Ok(metric)
}

fn register_int_gauge_vec(
    registry: &Registry,
    name: &str,
    help: &str,
) -> Result<IntGaugeVec, NvmeError> {
    register_int_gauge_vec_with_labels(registry, name, help, &RESOURCE_LABELS)
}

fn register_int_gauge_vec_with_labels(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntGaugeVec, NvmeError> {
    let metric = IntGaugeVec::new(Opts::new(name, help), labels)
        .map_err(|error| NvmeError::Internal(format!("failed to create {}: {}", name, error)))?;
    registry
        .register(Box::new(metric.clone()))
        .map_err(|error| NvmeError::Internal(format!("failed to register {}: {}", name, error)))?;
    Ok(metric)
}
