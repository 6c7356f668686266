use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::Config;
use crate::instance::fallback_instance_id;
use crate::instance::DmiInstanceIdProvider;
use crate::instance::InstanceIdProvider;
use crate::metrics::encode_report;
use crate::metrics::GroupMetrics;
use crate::metrics::ScrapeReport;
use crate::nvme::buffer::BufferPool;
use crate::nvme::cache::TypeCache;
use crate::nvme::cache::SWEEP_INTERVAL_CYCLES;
use crate::nvme::detect::backoff_sleep;
use crate::nvme::detect::detect_device_type;
use crate::nvme::detect::fallback_identifier;
use crate::nvme::detect::identifier_from_serial;
use crate::nvme::detect::SerialProvider;
use crate::nvme::detect::SysfsSerialProvider;
use crate::nvme::device::DeviceHandle;
use crate::nvme::discovery::group_by_controller;
use crate::nvme::discovery::ControllerGroup;
use crate::nvme::discovery::DeviceFilter;
use crate::nvme::discovery::DeviceSource;
use crate::nvme::discovery::DevfsSource;
use crate::nvme::error::ErrorClass;
use crate::nvme::error::NvmeError;
use crate::nvme::reader::DeviceLogPageReader;
use crate::nvme::reader::LogPageReader;
use crate::nvme::types::DeviceFamily;
use crate::nvme::types::DeviceType;
use crate::nvme::types::EbsMetrics;
use crate::nvme::types::InstanceStoreMetrics;
use crate::nvme::validate::validate;

pub const METRIC_READ_ATTEMPTS: u32 = 2;
pub const METRIC_READ_BASE_DELAY: Duration = Duration::from_millis(50);

/// Informational budget for a full cycle over a ten-device fleet.
pub const CYCLE_LATENCY_BUDGET: Duration = Duration::from_millis(50);

/// Cooperative cancellation for an in-flight cycle, honored at the metadata
/// fetch and at backoff sleep points. An ioctl already in flight runs to
/// completion and its result is discarded with the rest of the cycle.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

enum GroupOutcome {
    Emitted(GroupMetrics),
    Skipped,
    Failed(NvmeError),
}

/// Per-cycle driver: enumerate, filter, group, detect, read, parse, validate,
/// emit. Owns the type cache and the buffer pool for its lifetime.
pub struct NvmeScraper {
    config: Config,
    source: Box<dyn DeviceSource>,
    reader: Box<dyn LogPageReader>,
    serials: Box<dyn SerialProvider>,
    instance_ids: Box<dyn InstanceIdProvider>,
    cache: TypeCache,
    pool: BufferPool,
    cycles: AtomicU64,
}

impl NvmeScraper {
    pub fn new(config: Config) -> Self {
        let timeout_ms = u32::try_from(config.ioctl_timeout.as_millis()).unwrap_or(5_000);
        Self::with_providers(
            config,
            Box::new(DevfsSource),
            Box::new(DeviceLogPageReader::new(timeout_ms)),
            Box::new(SysfsSerialProvider),
            Box::new(DmiInstanceIdProvider),
        )
    }

    pub fn with_providers(
        config: Config,
        source: Box<dyn DeviceSource>,
        reader: Box<dyn LogPageReader>,
        serials: Box<dyn SerialProvider>,
        instance_ids: Box<dyn InstanceIdProvider>,
    ) -> Self {
        Self {
            config,
            source,
            reader,
            serials,
            instance_ids,
            cache: TypeCache::new(),
            pool: BufferPool::new(),
            cycles: AtomicU64::new(0),
        }
    }

    pub fn platform_supported(&self) -> bool {
        self.source.platform_supported()
    }

    /// Runs one cycle and encodes the resulting report.
    pub fn scrape(&self, cancel: &CancelFlag) -> Result<String, NvmeError> {
        let report = self.collect(cancel)?;
        encode_report(&report, &self.config.metric_flags)
    }

    /// Runs one scrape cycle. Per-device and per-group failures are absorbed
    /// and tallied; an error comes back only when discovery itself failed and
    /// no group could be formed.
    pub fn collect(&self, cancel: &CancelFlag) -> Result<ScrapeReport, NvmeError> {
        let started_at = Instant::now();

        if !self.source.platform_supported() {
            debug!("platform does not support nvme log pages, emitting nothing");
            return Ok(ScrapeReport::empty("unknown"));
        }

        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        if cycle % SWEEP_INTERVAL_CYCLES == 0 {
            self.cache.sweep();
        }

        let devices = match self.source.devices() {
            Ok(devices) => devices,
            Err(error) => {
                if error.class() == ErrorClass::PlatformUnsupported {
                    return Ok(ScrapeReport::empty("unknown"));
                }
                return Err(error);
            }
        };

        let filter = DeviceFilter::new(&self.config.devices);
        let admitted: Vec<DeviceHandle> = devices
            .into_iter()
            .filter(|device| filter.admits(device.name()))
            .collect();
        let groups = group_by_controller(admitted);
        if groups.is_empty() {
            let mut report = ScrapeReport::empty("unknown");
            report.duration_seconds = started_at.elapsed().as_secs_f64();
            return Ok(report);
        }

        let instance_id = if cancel.is_cancelled() {
            fallback_instance_id()
        } else {
            match self.instance_ids.instance_id() {
                Ok(value) => value,
                Err(error) => {
                    warn!(error = %error, "instance id lookup failed, using fallback");
                    fallback_instance_id()
                }
            }
        };

        let timestamp = SystemTime::now();
        let mut emitted: Vec<GroupMetrics> = Vec::with_capacity(groups.len());
        let mut errors: BTreeMap<ErrorClass, u64> = BTreeMap::new();
        let mut skipped_groups = 0_usize;

        for group in &groups {
            match self.collect_group(group, cancel) {
                GroupOutcome::Emitted(metrics) => emitted.push(metrics),
                GroupOutcome::Skipped => skipped_groups += 1,
                GroupOutcome::Failed(error) => {
                    warn!(
                        controller = group.controller,
                        error = %error,
                        "controller group failed"
                    );
                    *errors.entry(error.class()).or_insert(0) += 1;
                }
            }
        }

        let admitted_groups = groups.len() - skipped_groups;
        let duration = started_at.elapsed();

        if !errors.is_empty() {
            info!(errors = ?errors, "scrape cycle completed with errors");
        }
        if emitted.is_empty() && !errors.is_empty() {
            warn!("every controller group failed this cycle");
        }
        if duration > CYCLE_LATENCY_BUDGET {
            warn!(
                elapsed_ms = duration.as_millis() as u64,
                budget_ms = CYCLE_LATENCY_BUDGET.as_millis() as u64,
                "scrape cycle exceeded latency budget"
            );
        }

        Ok(ScrapeReport {
            duration_seconds: duration.as_secs_f64(),
            timestamp,
            instance_id,
            admitted_groups,
            skipped_groups,
            groups: emitted,
            errors,
        })
    }

    fn collect_group(&self, group: &ControllerGroup, cancel: &CancelFlag) -> GroupOutcome {
        let primary = group.primary();
        let device_type = match detect_device_type(
            self.reader.as_ref(),
            &self.cache,
            &self.pool,
            primary,
            cancel,
        ) {
            Ok(device_type) => device_type,
            Err(error) => return GroupOutcome::Failed(error),
        };

        let family_enabled = match device_type {
            DeviceType::Ebs => self.config.metric_flags.any_ebs_enabled(),
            DeviceType::InstanceStore => self.config.metric_flags.any_instance_store_enabled(),
            DeviceType::Unknown => false,
        };
        if !family_enabled {
            debug!(
                controller = group.controller,
                device_type = %device_type,
                "family metrics disabled, skipping group"
            );
            return GroupOutcome::Skipped;
        }

        let identifier = match self.serials.serial(group.controller) {
            Ok(serial) => identifier_from_serial(device_type, &serial),
            Err(error) => {
                warn!(
                    controller = group.controller,
                    error = %error,
                    "serial retrieval failed, using fallback identifier"
                );
                fallback_identifier(device_type, group.controller)
            }
        };

        let mut last_error: Option<NvmeError> = None;
        for device in &group.devices {
            match self.read_family(device, device_type, cancel) {
                Ok(family) => match validate(device.name(), &family) {
                    Ok(warnings) => {
                        for warning in warnings {
                            warn!(
                                device = %device.name(),
                                warning = %warning,
                                "metrics validation warning"
                            );
                        }
                        return GroupOutcome::Emitted(GroupMetrics {
                            device: device.dev_path().display().to_string(),
                            serial_number: identifier.clone(),
                            family,
                        });
                    }
                    Err(error) => {
                        warn!(
                            device = %device.name(),
                            error = %error,
                            "validation rejected device metrics"
                        );
                        last_error = Some(error);
                    }
                },
                Err(error) => {
                    debug!(
                        device = %device.name(),
                        error = %error,
                        "device read failed, trying next device in group"
                    );
                    last_error = Some(error);
                }
            }
        }

        GroupOutcome::Failed(last_error.unwrap_or_else(|| {
            NvmeError::Internal(format!(
                "controller {} group had no devices",
                group.controller
            ))
        }))
    }

    fn read_family(
        &self,
        device: &DeviceHandle,
        device_type: DeviceType,
        cancel: &CancelFlag,
    ) -> Result<DeviceFamily, NvmeError> {
        let mut attempt = 1_u32;
        loop {
            match self.read_once(device, device_type) {
                Ok(family) => return Ok(family),
                Err(error) => {
                    if !error.is_recoverable()
                        || attempt >= METRIC_READ_ATTEMPTS
                        || !backoff_sleep(attempt, METRIC_READ_BASE_DELAY, cancel)
                    {
                        return Err(error);
                    }
                    attempt += 1;
                }
            }
        }
    }

    fn read_once(
        &self,
        device: &DeviceHandle,
        device_type: DeviceType,
    ) -> Result<DeviceFamily, NvmeError> {
        let mut buffer = self.pool.acquire();
        self.reader.read_log_page(device, &mut buffer)?;

        match device_type {
            DeviceType::Ebs => EbsMetrics::parse(device.name(), &buffer).map(DeviceFamily::Ebs),
            DeviceType::InstanceStore => {
                InstanceStoreMetrics::parse(device.name(), &buffer).map(DeviceFamily::InstanceStore)
            }
            DeviceType::Unknown => Err(NvmeError::Internal(
                "unknown device type reached the read path".to_string(),
            )),
        }
    }
}
