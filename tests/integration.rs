use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use ec2_nvme_exporter::config::Config;
use ec2_nvme_exporter::config::LogFormat;
use ec2_nvme_exporter::instance::InstanceIdProvider;
use ec2_nvme_exporter::metrics::encode_report;
use ec2_nvme_exporter::metrics::MetricFlags;
use ec2_nvme_exporter::metrics::EBS_METRIC_NAMES;
use ec2_nvme_exporter::nvme::detect::SerialProvider;
use ec2_nvme_exporter::nvme::device::DeviceHandle;
use ec2_nvme_exporter::nvme::discovery::DeviceSource;
use ec2_nvme_exporter::nvme::error::ErrorClass;
use ec2_nvme_exporter::nvme::error::NvmeError;
use ec2_nvme_exporter::nvme::reader::LogPageReader;
use ec2_nvme_exporter::nvme::types::DeviceFamily;
use ec2_nvme_exporter::nvme::types::DeviceType;
use ec2_nvme_exporter::nvme::types::EBS_MAGIC;
use ec2_nvme_exporter::nvme::types::INSTANCE_STORE_MAGIC;
use ec2_nvme_exporter::nvme::types::LOG_PAGE_BYTES;
use ec2_nvme_exporter::scraper::CancelFlag;
use ec2_nvme_exporter::scraper::NvmeScraper;

struct FixedSource {
    supported: bool,
    names: Vec<&'static str>,
    error: Option<&'static str>,
}

impl FixedSource {
    fn with_devices(names: Vec<&'static str>) -> Self {
        Self {
            supported: true,
            names,
            error: None,
        }
    }

    fn unsupported() -> Self {
        Self {
            supported: false,
            names: Vec::new(),
            error: None,
        }
    }

    fn failing(message: &'static str) -> Self {
        Self {
            supported: true,
            names: Vec::new(),
            error: Some(message),
        }
    }
}

impl DeviceSource for FixedSource {
    fn platform_supported(&self) -> bool {
        self.supported
    }

    fn devices(&self) -> Result<Vec<DeviceHandle>, NvmeError> {
        if !self.supported {
            return Err(NvmeError::PlatformUnsupported);
        }
        if let Some(message) = self.error {
            return Err(NvmeError::Internal(message.to_string()));
        }
        self.names.iter().map(|name| DeviceHandle::parse(name)).collect()
    }
}

/// Canned per-device responses. Call `n` past the end of a script repeats the
/// final entry, so steady-state scrapes can reuse one page.
enum Canned {
    Page(Vec<u8>),
    PermissionDenied,
    Busy,
}

struct ScriptedReader {
    scripts: HashMap<&'static str, Vec<Canned>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedReader {
    fn new(scripts: Vec<(&'static str, Vec<Canned>)>) -> Self {
        Self {
            scripts: scripts.into_iter().collect(),
            calls: Mutex::new(HashMap::new()),
        }
    }

    fn calls_for(&self, name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

impl LogPageReader for ScriptedReader {
    fn read_log_page(&self, device: &DeviceHandle, buffer: &mut [u8]) -> Result<(), NvmeError> {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(device.name().to_string()).or_insert(0);
            let index = *count;
            *count += 1;
            index
        };

        let script = self.scripts.get(device.name()).ok_or_else(|| {
            NvmeError::DeviceNotFound {
                device: device.name().to_string(),
            }
        })?;
        let canned = script.get(index.min(script.len().saturating_sub(1))).ok_or_else(|| {
            NvmeError::DeviceNotFound {
                device: device.name().to_string(),
            }
        })?;

        match canned {
            Canned::Page(page) => {
                buffer[..page.len()].copy_from_slice(page);
                Ok(())
            }
            Canned::PermissionDenied => Err(NvmeError::PermissionDenied {
                device: device.name().to_string(),
            }),
            Canned::Busy => Err(NvmeError::DeviceBusy {
                device: device.name().to_string(),
            }),
        }
    }
}

struct FixedSerials {
    serials: HashMap<u32, &'static str>,
    calls: Mutex<usize>,
}

impl FixedSerials {
    fn new(serials: Vec<(u32, &'static str)>) -> Self {
        Self {
            serials: serials.into_iter().collect(),
            calls: Mutex::new(0),
        }
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl SerialProvider for FixedSerials {
    fn serial(&self, controller: u32) -> Result<String, NvmeError> {
        *self.calls.lock().unwrap() += 1;
        self.serials
            .get(&controller)
            .map(|serial| serial.to_string())
            .ok_or_else(|| NvmeError::Parse(format!("no serial for controller {}", controller)))
    }
}

struct FixedInstanceId {
    value: Option<&'static str>,
    calls: Mutex<usize>,
}

impl FixedInstanceId {
    fn new(value: &'static str) -> Self {
        Self {
            value: Some(value),
            calls: Mutex::new(0),
        }
    }

    fn failing() -> Self {
        Self {
            value: None,
            calls: Mutex::new(0),
        }
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl InstanceIdProvider for FixedInstanceId {
    fn instance_id(&self) -> Result<String, NvmeError> {
        *self.calls.lock().unwrap() += 1;
        match self.value {
            Some(value) => Ok(value.to_string()),
            None => Err(NvmeError::Metadata("instance id unavailable".to_string())),
        }
    }
}

fn put_u64(page: &mut [u8], offset: usize, value: u64) {
    page[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn ebs_page(counters: [u64; 11]) -> Vec<u8> {
    let mut page = vec![0_u8; LOG_PAGE_BYTES];
    put_u64(&mut page, 0, EBS_MAGIC);
    for (index, value) in counters.iter().enumerate() {
        put_u64(&mut page, 8 + index * 8, *value);
    }
    page
}

fn instance_store_page(fields: [u64; 11]) -> Vec<u8> {
    let mut page = vec![0_u8; LOG_PAGE_BYTES];
    page[0..4].copy_from_slice(&INSTANCE_STORE_MAGIC.to_le_bytes());
    for (index, value) in fields.iter().enumerate() {
        put_u64(&mut page, 4 + index * 8, *value);
    }
    page
}

fn bad_magic_page() -> Vec<u8> {
    let mut page = vec![0_u8; LOG_PAGE_BYTES];
    put_u64(&mut page, 0, 0xBAD0_BAD0_BAD0_BAD0);
    page
}

const SAMPLE_EBS_COUNTERS: [u64; 11] = [100, 200, 1024, 2048, 500, 600, 1, 2, 3, 4, 5];

fn test_config(devices: Vec<&str>) -> Config {
    Config {
        listen_address: "127.0.0.1:0".parse().expect("test socket address"),
        devices: devices.into_iter().map(String::from).collect(),
        metric_flags: MetricFlags::all_enabled(),
        log_level: "info".to_string(),
        log_format: LogFormat::Text,
        ioctl_timeout: Duration::from_millis(100),
    }
}

/// Keeps a handle on a mock moved into the scraper so call counts stay
/// observable. Leaking is fine in tests.
struct SharedReader(&'static ScriptedReader);

impl LogPageReader for SharedReader {
    fn read_log_page(&self, device: &DeviceHandle, buffer: &mut [u8]) -> Result<(), NvmeError> {
        self.0.read_log_page(device, buffer)
    }
}

struct SharedSerials(&'static FixedSerials);

impl SerialProvider for SharedSerials {
    fn serial(&self, controller: u32) -> Result<String, NvmeError> {
        self.0.serial(controller)
    }
}

struct SharedInstanceIds(&'static FixedInstanceId);

impl InstanceIdProvider for SharedInstanceIds {
    fn instance_id(&self) -> Result<String, NvmeError> {
        self.0.instance_id()
    }
}

fn leak_reader(reader: ScriptedReader) -> &'static ScriptedReader {
    Box::leak(Box::new(reader))
}

fn leak_serials(serials: FixedSerials) -> &'static FixedSerials {
    Box::leak(Box::new(serials))
}

#[test]
fn single_ebs_device_emits_one_resource() {
    let reader = ScriptedReader::new(vec![(
        "nvme0n1",
        vec![Canned::Page(ebs_page(SAMPLE_EBS_COUNTERS))],
    )]);
    let scraper = NvmeScraper::with_providers(
        test_config(vec!["*"]),
        Box::new(FixedSource::with_devices(vec!["nvme0n1"])),
        Box::new(reader),
        Box::new(FixedSerials::new(vec![(0, "vol0abc")])),
        Box::new(FixedInstanceId::new("i-0123456789abcdef0")),
    );

    let report = scraper.collect(&CancelFlag::new()).expect("cycle succeeds");
    assert_eq!(report.admitted_groups, 1);
    assert_eq!(report.groups.len(), 1);
    assert!(report.errors.is_empty());

    let group = &report.groups[0];
    assert_eq!(group.device, "/dev/nvme0n1");
    assert_eq!(group.serial_number, "vol-0abc");
    assert_eq!(group.device_type(), DeviceType::Ebs);
    match &group.family {
        DeviceFamily::Ebs(metrics) => {
            assert_eq!(metrics.read_ops, 100);
            assert_eq!(metrics.write_ops, 200);
            assert_eq!(metrics.read_bytes, 1024);
            assert_eq!(metrics.write_bytes, 2048);
            assert_eq!(metrics.total_read_time, 500);
            assert_eq!(metrics.total_write_time, 600);
            assert_eq!(metrics.ebs_iops_exceeded, 1);
            assert_eq!(metrics.ebs_throughput_exceeded, 2);
            assert_eq!(metrics.ec2_iops_exceeded, 3);
            assert_eq!(metrics.ec2_throughput_exceeded, 4);
            assert_eq!(metrics.queue_length, 5);
        }
        other => panic!("expected EBS family, got {:?}", other),
    }

    let output =
        encode_report(&report, &MetricFlags::all_enabled()).expect("report should encode");
    let labels = "device=\"/dev/nvme0n1\",device_type=\"ebs\",\
                  instance_id=\"i-0123456789abcdef0\",serial_number=\"vol-0abc\"";
    let expected = [
        ("diskio_ebs_total_read_ops", 100_u64),
        ("diskio_ebs_total_write_ops", 200),
        ("diskio_ebs_total_read_bytes", 1024),
        ("diskio_ebs_total_write_bytes", 2048),
        ("diskio_ebs_total_read_time", 500),
        ("diskio_ebs_total_write_time", 600),
        ("diskio_ebs_volume_performance_exceeded_iops", 1),
        ("diskio_ebs_volume_performance_exceeded_tp", 2),
        ("diskio_ebs_ec2_instance_performance_exceeded_iops", 3),
        ("diskio_ebs_ec2_instance_performance_exceeded_tp", 4),
        ("diskio_ebs_volume_queue_length", 5),
    ];
    for (name, value) in expected {
        let line = format!("{}{{{}}} {}", name, labels, value);
        assert!(output.contains(&line), "missing '{}' in:\n{}", line, output);
    }
}

#[test]
fn shared_controller_detects_and_reads_serial_once() {
    let reader = leak_reader(ScriptedReader::new(vec![(
        "nvme0n1",
        vec![Canned::Page(ebs_page(SAMPLE_EBS_COUNTERS))],
    )]));
    let serials = leak_serials(FixedSerials::new(vec![(0, "vol0abc")]));

    let scraper = NvmeScraper::with_providers(
        test_config(vec!["*"]),
        Box::new(FixedSource::with_devices(vec![
            "nvme0n1",
            "nvme0n1p1",
            "nvme0n1p2",
        ])),
        Box::new(SharedReader(reader)),
        Box::new(SharedSerials(serials)),
        Box::new(FixedInstanceId::new("i-0123456789abcdef0")),
    );

    let report = scraper.collect(&CancelFlag::new()).expect("cycle succeeds");
    assert_eq!(report.admitted_groups, 1);
    assert_eq!(report.groups.len(), 1);
    assert_eq!(report.groups[0].device, "/dev/nvme0n1");

    assert_eq!(serials.calls(), 1, "one serial retrieval per group");
    assert_eq!(
        reader.calls_for("nvme0n1"),
        2,
        "one detection probe plus one metrics read on the primary"
    );
    assert_eq!(reader.calls_for("nvme0n1p1"), 0);
    assert_eq!(reader.calls_for("nvme0n1p2"), 0);
}

#[test]
fn mixed_fleet_absorbs_a_hard_failure() {
    let reader = ScriptedReader::new(vec![
        (
            "nvme0n1",
            vec![Canned::Page(ebs_page(SAMPLE_EBS_COUNTERS))],
        ),
        (
            "nvme1n1",
            vec![
                Canned::Page(ebs_page(SAMPLE_EBS_COUNTERS)),
                Canned::Page(bad_magic_page()),
            ],
        ),
        (
            "nvme2n1",
            vec![Canned::Page(instance_store_page([
                10, 20, 30, 40, 50, 60, 7, 8, 9, 1, 64,
            ]))],
        ),
    ]);
    let instance_ids: &'static FixedInstanceId =
        Box::leak(Box::new(FixedInstanceId::new("i-0123456789abcdef0")));

    let scraper = NvmeScraper::with_providers(
        test_config(vec!["*"]),
        Box::new(FixedSource::with_devices(vec![
            "nvme0n1", "nvme1n1", "nvme2n1",
        ])),
        Box::new(reader),
        Box::new(FixedSerials::new(vec![
            (0, "vol0abc"),
            (1, "vol0def"),
            (2, "AWS16AAAC6C7BC3DB123"),
        ])),
        Box::new(SharedInstanceIds(instance_ids)),
    );

    let report = scraper.collect(&CancelFlag::new()).expect("cycle succeeds");
    assert_eq!(instance_ids.calls(), 1, "one metadata fetch per cycle");

    assert_eq!(report.admitted_groups, 3);
    assert_eq!(report.groups.len(), 2);
    assert_eq!(report.errors.get(&ErrorClass::InvalidMagicNumber), Some(&1));
    assert_eq!(
        report.groups.len() as u64 + report.failed_groups(),
        report.admitted_groups as u64
    );

    let types: Vec<DeviceType> = report.groups.iter().map(|group| group.device_type()).collect();
    assert_eq!(types, vec![DeviceType::Ebs, DeviceType::InstanceStore]);
    assert_eq!(report.groups[1].serial_number, "AWS16AAAC6C7BC3DB123");
}

#[test]
fn permission_denied_retries_then_caches_the_type() {
    let reader = ScriptedReader::new(vec![(
        "nvme0n1",
        vec![
            Canned::PermissionDenied,
            Canned::Page(ebs_page(SAMPLE_EBS_COUNTERS)),
        ],
    )]);
    let scraper = NvmeScraper::with_providers(
        test_config(vec!["*"]),
        Box::new(FixedSource::with_devices(vec!["nvme0n1"])),
        Box::new(reader),
        Box::new(FixedSerials::new(vec![(0, "vol0abc")])),
        Box::new(FixedInstanceId::new("i-0123456789abcdef0")),
    );

    let report = scraper.collect(&CancelFlag::new()).expect("cycle succeeds");
    assert_eq!(report.groups.len(), 1);
    assert!(report.errors.is_empty());

    let report = scraper.collect(&CancelFlag::new()).expect("second cycle succeeds");
    assert_eq!(report.groups.len(), 1);
}

#[test]
fn second_cycle_skips_type_detection_entirely() {
    let counter_handle = leak_reader(ScriptedReader::new(vec![(
        "nvme0n1",
        vec![Canned::Page(ebs_page(SAMPLE_EBS_COUNTERS))],
    )]));

    let scraper = NvmeScraper::with_providers(
        test_config(vec!["*"]),
        Box::new(FixedSource::with_devices(vec!["nvme0n1"])),
        Box::new(SharedReader(counter_handle)),
        Box::new(FixedSerials::new(vec![(0, "vol0abc")])),
        Box::new(FixedInstanceId::new("i-0123456789abcdef0")),
    );

    let cancel = CancelFlag::new();
    scraper.collect(&cancel).expect("first cycle succeeds");
    let after_first = counter_handle.calls_for("nvme0n1");
    assert_eq!(after_first, 2, "detection probe plus metrics read");

    scraper.collect(&cancel).expect("second cycle succeeds");
    let after_second = counter_handle.calls_for("nvme0n1");
    assert_eq!(
        after_second - after_first,
        1,
        "cached type leaves only the metrics read"
    );
}

#[test]
fn platform_unsupported_is_an_empty_success() {
    let counter_handle = leak_reader(ScriptedReader::new(Vec::new()));

    let scraper = NvmeScraper::with_providers(
        test_config(vec!["*"]),
        Box::new(FixedSource::unsupported()),
        Box::new(SharedReader(counter_handle)),
        Box::new(FixedSerials::new(Vec::new())),
        Box::new(FixedInstanceId::failing()),
    );

    let report = scraper.collect(&CancelFlag::new()).expect("no-op success");
    assert!(report.groups.is_empty());
    assert!(report.errors.is_empty());
    assert_eq!(counter_handle.total_calls(), 0);

    let output = scraper.scrape(&CancelFlag::new()).expect("encodes");
    assert!(output.contains("ec2_nvme_scrape_success 1"));
    assert!(output.contains("ec2_nvme_device_count 0"));
}

#[test]
fn overflowing_counter_is_skipped_but_resource_still_emits() {
    let mut counters = SAMPLE_EBS_COUNTERS;
    counters[0] = u64::MAX;
    let scraper = NvmeScraper::with_providers(
        test_config(vec!["*"]),
        Box::new(FixedSource::with_devices(vec!["nvme0n1"])),
        Box::new(ScriptedReader::new(vec![(
            "nvme0n1",
            vec![Canned::Page(ebs_page(counters))],
        )])),
        Box::new(FixedSerials::new(vec![(0, "vol0abc")])),
        Box::new(FixedInstanceId::new("i-0123456789abcdef0")),
    );

    let output = scraper.scrape(&CancelFlag::new()).expect("cycle succeeds");
    assert!(!output.contains("diskio_ebs_total_read_ops{"));
    assert!(output.contains("diskio_ebs_total_write_ops{"));
    assert!(output.contains("diskio_ebs_volume_queue_length{"));
}

#[test]
fn empty_device_list_is_a_noop_success() {
    let scraper = NvmeScraper::with_providers(
        test_config(Vec::new()),
        Box::new(FixedSource::with_devices(vec!["nvme0n1"])),
        Box::new(ScriptedReader::new(Vec::new())),
        Box::new(FixedSerials::new(Vec::new())),
        Box::new(FixedInstanceId::new("i-0123456789abcdef0")),
    );

    let report = scraper.collect(&CancelFlag::new()).expect("no-op success");
    assert!(report.groups.is_empty());
    assert_eq!(report.admitted_groups, 0);
}

#[test]
fn wildcard_over_an_empty_fleet_is_a_noop_success() {
    let scraper = NvmeScraper::with_providers(
        test_config(vec!["*"]),
        Box::new(FixedSource::with_devices(Vec::new())),
        Box::new(ScriptedReader::new(Vec::new())),
        Box::new(FixedSerials::new(Vec::new())),
        Box::new(FixedInstanceId::new("i-0123456789abcdef0")),
    );

    let report = scraper.collect(&CancelFlag::new()).expect("no-op success");
    assert!(report.groups.is_empty());
}

#[test]
fn discovery_failure_with_no_devices_surfaces() {
    let scraper = NvmeScraper::with_providers(
        test_config(vec!["*"]),
        Box::new(FixedSource::failing("device listing exploded")),
        Box::new(ScriptedReader::new(Vec::new())),
        Box::new(FixedSerials::new(Vec::new())),
        Box::new(FixedInstanceId::new("i-0123456789abcdef0")),
    );

    let error = scraper
        .collect(&CancelFlag::new())
        .expect_err("discovery error should surface");
    assert_eq!(error.class(), ErrorClass::Unknown);
}

#[test]
fn failed_instance_id_lookup_degrades_to_fallback() {
    let scraper = NvmeScraper::with_providers(
        test_config(vec!["*"]),
        Box::new(FixedSource::with_devices(vec!["nvme0n1"])),
        Box::new(ScriptedReader::new(vec![(
            "nvme0n1",
            vec![Canned::Page(ebs_page(SAMPLE_EBS_COUNTERS))],
        )])),
        Box::new(FixedSerials::new(vec![(0, "vol0abc")])),
        Box::new(FixedInstanceId::failing()),
    );

    let report = scraper.collect(&CancelFlag::new()).expect("cycle succeeds");
    assert_eq!(report.groups.len(), 1);
    assert!(report.instance_id.starts_with("unknown"));
}

#[test]
fn missing_serial_degrades_to_fallback_identifier() {
    let scraper = NvmeScraper::with_providers(
        test_config(vec!["*"]),
        Box::new(FixedSource::with_devices(vec!["nvme0n1"])),
        Box::new(ScriptedReader::new(vec![(
            "nvme0n1",
            vec![Canned::Page(ebs_page(SAMPLE_EBS_COUNTERS))],
        )])),
        Box::new(FixedSerials::new(Vec::new())),
        Box::new(FixedInstanceId::new("i-0123456789abcdef0")),
    );

    let report = scraper.collect(&CancelFlag::new()).expect("cycle succeeds");
    assert_eq!(report.groups.len(), 1);
    assert_eq!(report.groups[0].serial_number, "unknown-ebs-controller-0");
}

#[test]
fn fully_disabled_family_skips_its_devices() {
    let mut config = test_config(vec!["*"]);
    config.metric_flags = MetricFlags::with_disabled(EBS_METRIC_NAMES.map(String::from));

    let scraper = NvmeScraper::with_providers(
        config,
        Box::new(FixedSource::with_devices(vec!["nvme0n1", "nvme1n1"])),
        Box::new(ScriptedReader::new(vec![
            (
                "nvme0n1",
                vec![Canned::Page(ebs_page(SAMPLE_EBS_COUNTERS))],
            ),
            (
                "nvme1n1",
                vec![Canned::Page(instance_store_page([
                    10, 20, 30, 40, 50, 60, 7, 8, 9, 1, 64,
                ]))],
            ),
        ])),
        Box::new(FixedSerials::new(vec![
            (0, "vol0abc"),
            (1, "AWS16AAAC6C7BC3DB123"),
        ])),
        Box::new(FixedInstanceId::new("i-0123456789abcdef0")),
    );

    let report = scraper.collect(&CancelFlag::new()).expect("cycle succeeds");
    assert_eq!(report.skipped_groups, 1);
    assert_eq!(report.admitted_groups, 1);
    assert_eq!(report.groups.len(), 1);
    assert_eq!(report.groups[0].device_type(), DeviceType::InstanceStore);
}

#[test]
fn busy_device_falls_back_to_the_next_group_member() {
    let scraper = NvmeScraper::with_providers(
        test_config(vec!["*"]),
        Box::new(FixedSource::with_devices(vec!["nvme0n1", "nvme0n2"])),
        Box::new(ScriptedReader::new(vec![
            (
                "nvme0n1",
                vec![
                    Canned::Page(ebs_page(SAMPLE_EBS_COUNTERS)),
                    Canned::Busy,
                ],
            ),
            (
                "nvme0n2",
                vec![Canned::Page(ebs_page(SAMPLE_EBS_COUNTERS))],
            ),
        ])),
        Box::new(FixedSerials::new(vec![(0, "vol0abc")])),
        Box::new(FixedInstanceId::new("i-0123456789abcdef0")),
    );

    let report = scraper.collect(&CancelFlag::new()).expect("cycle succeeds");
    assert_eq!(report.groups.len(), 1);
    assert_eq!(report.groups[0].device, "/dev/nvme0n2");
    assert!(report.errors.is_empty());
}
