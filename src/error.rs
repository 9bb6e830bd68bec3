//! Error and status vocabulary.
//!
//! Every fallible public operation returns [`SlamError`], which maps onto the
//! closed set of [`ResultCode`]s exposed to hosts. Component errors
//! ([`PoseError`], [`MapError`], [`CodecError`], [`ConfigError`],
//! [`VocabularyError`]) stay local to their modules and convert into
//! `SlamError` at the system boundary.

use thiserror::Error;

use crate::codec::CodecError;
use crate::geometry::pnp::PoseError;
use crate::map::MapError;
use crate::vocabulary::VocabularyError;

/// Result codes with stable integer values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ResultCode {
    Success = 0,
    InvalidParameter = -1,
    InitializationFailed = -2,
    SystemNotReady = -3,
    ProcessingFailed = -4,
    MapLoadFailed = -5,
    InsufficientFeatures = -6,
    TrackingLost = -7,
    OutOfMemory = -8,
    UnsupportedFormat = -9,
    FileNotFound = -10,
}

impl ResultCode {
    pub const ALL: [ResultCode; 11] = [
        ResultCode::Success,
        ResultCode::InvalidParameter,
        ResultCode::InitializationFailed,
        ResultCode::SystemNotReady,
        ResultCode::ProcessingFailed,
        ResultCode::MapLoadFailed,
        ResultCode::InsufficientFeatures,
        ResultCode::TrackingLost,
        ResultCode::OutOfMemory,
        ResultCode::UnsupportedFormat,
        ResultCode::FileNotFound,
    ];

    /// Human-readable description.
    pub fn description(self) -> &'static str {
        match self {
            ResultCode::Success => "Success",
            ResultCode::InvalidParameter => "Invalid parameter",
            ResultCode::InitializationFailed => "Initialization failed",
            ResultCode::SystemNotReady => "System not ready",
            ResultCode::ProcessingFailed => "Processing failed",
            ResultCode::MapLoadFailed => "Map load failed",
            ResultCode::InsufficientFeatures => "Insufficient features",
            ResultCode::TrackingLost => "Tracking lost",
            ResultCode::OutOfMemory => "Out of memory",
            ResultCode::UnsupportedFormat => "Unsupported format",
            ResultCode::FileNotFound => "File not found",
        }
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_i32() == value)
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

/// Error returned by the system facade.
#[derive(Debug, Error)]
pub enum SlamError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    #[error("system not ready: {0}")]
    SystemNotReady(String),

    #[error("processing failed: {0}")]
    ProcessingFailed(String),

    #[error("map load failed: {0}")]
    MapLoadFailed(String),

    #[error("insufficient features: {found} found, {required} required")]
    InsufficientFeatures { found: usize, required: usize },

    #[error("tracking lost: {0}")]
    TrackingLost(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("file not found: {0}")]
    FileNotFound(String),
}

impl SlamError {
    pub fn code(&self) -> ResultCode {
        match self {
            SlamError::InvalidParameter(_) => ResultCode::InvalidParameter,
            SlamError::InitializationFailed(_) => ResultCode::InitializationFailed,
            SlamError::SystemNotReady(_) => ResultCode::SystemNotReady,
            SlamError::ProcessingFailed(_) => ResultCode::ProcessingFailed,
            SlamError::MapLoadFailed(_) => ResultCode::MapLoadFailed,
            SlamError::InsufficientFeatures { .. } => ResultCode::InsufficientFeatures,
            SlamError::TrackingLost(_) => ResultCode::TrackingLost,
            SlamError::OutOfMemory(_) => ResultCode::OutOfMemory,
            SlamError::UnsupportedFormat(_) => ResultCode::UnsupportedFormat,
            SlamError::FileNotFound(_) => ResultCode::FileNotFound,
        }
    }
}

pub type Result<T> = std::result::Result<T, SlamError>;

/// Invalid or unreadable configuration / calibration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Invalid(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ConfigError> for SlamError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                SlamError::FileNotFound(e.to_string())
            }
            other => SlamError::InvalidParameter(other.to_string()),
        }
    }
}

impl From<PoseError> for SlamError {
    fn from(err: PoseError) -> Self {
        match err {
            PoseError::InsufficientCorrespondences { required, actual } => {
                SlamError::InsufficientFeatures {
                    found: actual,
                    required,
                }
            }
            other => SlamError::TrackingLost(other.to_string()),
        }
    }
}

impl From<MapError> for SlamError {
    fn from(err: MapError) -> Self {
        match err {
            MapError::CapacityExceeded { .. } => SlamError::OutOfMemory(err.to_string()),
            other => SlamError::ProcessingFailed(other.to_string()),
        }
    }
}

impl From<CodecError> for SlamError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                SlamError::FileNotFound(e.to_string())
            }
            CodecError::BufferTooSmall { .. } => SlamError::InvalidParameter(err.to_string()),
            other => SlamError::MapLoadFailed(other.to_string()),
        }
    }
}

impl From<VocabularyError> for SlamError {
    fn from(err: VocabularyError) -> Self {
        match err {
            VocabularyError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                SlamError::FileNotFound(e.to_string())
            }
            other => SlamError::InitializationFailed(other.to_string()),
        }
    }
}
