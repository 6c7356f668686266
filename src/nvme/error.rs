use std::fmt;
use std::path::Path;

pub const PLATFORM_UNSUPPORTED_MESSAGE: &str = "nvme operations are only supported on linux";

#[derive(Debug)]
pub enum NvmeError {
    Io {
        context: String,
        source: std::io::Error,
    },
    Ioctl {
        device: String,
        source: std::io::Error,
    },
    PermissionDenied {
        device: String,
    },
    DeviceNotFound {
        device: String,
    },
    DeviceBusy {
        device: String,
    },
    PlatformUnsupported,
    UnexpectedSize {
        expected: usize,
        actual: usize,
    },
    InvalidMagic {
        device: String,
        found: u64,
    },
    DetectionFailed {
        device: String,
        detail: String,
    },
    Metadata(String),
    Parse(String),
    Internal(String),
}

impl NvmeError {
    pub fn io_context(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn io_path(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context: path.display().to_string(),
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        ErrorClass::classify(&self.to_string())
    }

    pub fn is_recoverable(&self) -> bool {
        self.class().is_recoverable()
    }
}

impl fmt::Display for NvmeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NvmeError::Io { context, source } => write!(f, "io error ({}): {}", context, source),
            NvmeError::Ioctl { device, source } => {
                write!(f, "ioctl failed on {}: {}", device, source)
            }
            NvmeError::PermissionDenied { device } => {
                write!(
                    f,
                    "permission denied: {} (need CAP_SYS_ADMIN or root)",
                    device
                )
            }
            NvmeError::DeviceNotFound { device } => write!(f, "device not found: {}", device),
            NvmeError::DeviceBusy { device } => write!(f, "device busy: {}", device),
            NvmeError::PlatformUnsupported => write!(f, "{}", PLATFORM_UNSUPPORTED_MESSAGE),
            NvmeError::UnexpectedSize { expected, actual } => {
                write!(
                    f,
                    "unexpected data size: expected {}, got {}",
                    expected, actual
                )
            }
            NvmeError::InvalidMagic { device, found } => {
                write!(f, "invalid magic number {:#010x} on {}", found, device)
            }
            NvmeError::DetectionFailed { device, detail } => {
                write!(f, "device type detection failed on {}: {}", device, detail)
            }
            NvmeError::Metadata(message) => write!(f, "metadata service error: {}", message),
            NvmeError::Parse(message) => write!(f, "parse error: {}", message),
            NvmeError::Internal(message) => write!(f, "internal error: {}", message),
        }
    }
}

impl std::error::Error for NvmeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NvmeError::Io { source, .. } => Some(source),
            NvmeError::Ioctl { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorClass {
    PlatformUnsupported,
    PermissionDenied,
    DeviceNotFound,
    DeviceBusy,
    IoctlFailed,
    InvalidMagicNumber,
    DataParsingError,
    DeviceTypeDetectionFailed,
    MetadataServiceError,
    IoError,
    NetworkError,
    OverflowError,
    Unknown,
}

impl ErrorClass {
    /// Maps a raw error message into the closed taxonomy. First-hit matching
    /// over lowercased substrings, with the specific patterns ahead of the
    /// generic ioctl/io buckets.
    pub fn classify(message: &str) -> Self {
        let message = message.to_ascii_lowercase();

        if message.contains("only supported on linux") {
            return Self::PlatformUnsupported;
        }
        if message.contains("permission denied") || message.contains("operation not permitted") {
            return Self::PermissionDenied;
        }
        if message.contains("metadata") {
            return Self::MetadataServiceError;
        }
        if message.contains("not found") || message.contains("no such file") {
            return Self::DeviceNotFound;
        }
        if message.contains("busy") {
            return Self::DeviceBusy;
        }
        if message.contains("invalid magic number") {
            return Self::InvalidMagicNumber;
        }
        if message.contains("detection failed") {
            return Self::DeviceTypeDetectionFailed;
        }
        if message.contains("overflow") {
            return Self::OverflowError;
        }
        if message.contains("network")
            || message.contains("connection")
            || message.contains("timed out")
        {
            return Self::NetworkError;
        }
        if message.contains("parse") || message.contains("unexpected data size") {
            return Self::DataParsingError;
        }
        if message.contains("ioctl") {
            return Self::IoctlFailed;
        }
        if message.contains("io error") || message.contains("i/o error") {
            return Self::IoError;
        }

        Self::Unknown
    }

    /// Recoverable classes are retried within a cycle and cached under the
    /// short failure TTL; everything else fails fast.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::PermissionDenied
                | Self::DeviceBusy
                | Self::IoError
                | Self::NetworkError
                | Self::MetadataServiceError
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PlatformUnsupported => "platform_unsupported",
            Self::PermissionDenied => "permission_denied",
            Self::DeviceNotFound => "device_not_found",
            Self::DeviceBusy => "device_busy",
            Self::IoctlFailed => "ioctl_failed",
            Self::InvalidMagicNumber => "invalid_magic_number",
            Self::DataParsingError => "data_parsing_error",
            Self::DeviceTypeDetectionFailed => "device_type_detection_failed",
            Self::MetadataServiceError => "metadata_service_error",
            Self::IoError => "io_error",
            Self::NetworkError => "network_error",
            Self::OverflowError => "overflow_error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
