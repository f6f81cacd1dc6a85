//! Error types shared by every GPU-facing component.
//!
//! Nothing in this crate retries. A failure either aborts startup (contract
//! violations, missing shaders, allocation failures during setup) or marks the
//! engine as errored so the tick loop stops (device removal, submission
//! failure, wait timeout).

use ash::vk;
use thiserror::Error;

/// GPU-side errors
#[derive(Error, Debug)]
pub enum GpuError {
    /// The device stopped responding or was removed. The context is unusable.
    #[error("Device removed: {0}")]
    DeviceRemoved(String),

    /// Command list execution or fence signal could not be enqueued
    #[error("Submission failed: {0}")]
    SubmissionFailed(String),

    /// A fence wait did not complete in time
    #[error("Timed out after {timeout_ms} ms waiting for fence value {value}")]
    WaitTimeout {
        /// Fence value that was waited on
        value: u64,
        /// Configured timeout
        timeout_ms: u64,
    },

    /// Memory or object allocation failed
    #[error("Allocation of {requested} bytes failed: {reason}")]
    AllocationFailed {
        /// Number of bytes that were requested
        requested: u64,
        /// Backend-reported cause
        reason: String,
    },

    /// Caller broke an initialization-time contract (alignment, size, ordering)
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// A handle does not name a live resource
    #[error("Resource not found: {id}")]
    UnknownResource {
        /// Raw handle value
        id: u64,
    },

    /// A shader program could not be compiled or loaded
    #[error("Missing shader '{0}'")]
    MissingShader(String),

    /// Identifier lookup against a pipeline failed
    #[error("Pipeline has no export named '{0}'")]
    UnknownExport(String),

    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Backend initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// No suitable memory type found for allocation
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,
}

/// Broad classes of failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The GPU context is unusable; stop the engine
    Fatal,
    /// Startup was configured or sequenced incorrectly; abort startup
    Contract,
}

impl GpuError {
    /// Classify the error
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ContractViolation(_)
            | Self::MissingShader(_)
            | Self::UnknownExport(_)
            | Self::UnknownResource { .. } => ErrorKind::Contract,
            Self::DeviceRemoved(_)
            | Self::SubmissionFailed(_)
            | Self::WaitTimeout { .. }
            | Self::AllocationFailed { .. }
            | Self::Api(_)
            | Self::InitializationFailed(_)
            | Self::NoSuitableMemoryType => ErrorKind::Fatal,
        }
    }

    /// Whether the device must be considered lost
    pub const fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Fatal)
    }

    pub(crate) fn contract(reason: impl Into<String>) -> Self {
        Self::ContractViolation(reason.into())
    }
}

impl From<vk::Result> for GpuError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceRemoved(format!("{result:?}")),
            other => Self::Api(other),
        }
    }
}

/// Result type for GPU operations
pub type GpuResult<T> = Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(GpuError::DeviceRemoved("hung".into()).is_fatal());
        assert!(GpuError::WaitTimeout { value: 3, timeout_ms: 10 }.is_fatal());
        assert_eq!(GpuError::contract("misaligned").kind(), ErrorKind::Contract);
        assert_eq!(GpuError::MissingShader("RayGen".into()).kind(), ErrorKind::Contract);
    }

    #[test]
    fn test_device_lost_maps_to_removed() {
        let err = GpuError::from(vk::Result::ERROR_DEVICE_LOST);
        assert!(matches!(err, GpuError::DeviceRemoved(_)));
        let err = GpuError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert!(matches!(err, GpuError::Api(_)));
    }
}
