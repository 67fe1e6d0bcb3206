//! # Error Handling
//!
//! This module defines all error conditions raised by the resource manager.
//! Leaks are deliberately absent from the taxonomy: a leak is reported
//! through logs and [`crate::tracker::LeakReport`], never raised as an error.

use thiserror::Error;
use std::fmt;

/// Result type alias for resource manager operations
///
/// Convenience alias using our custom ResourceError as the error type.
/// Most functions in this crate return this type.
pub type Result<T> = std::result::Result<T, ResourceError>;

/// Error types for resource lifecycle operations
///
/// Each variant carries enough context to diagnose the failure without
/// consulting the caller. Variants map one-to-one onto the failure modes
/// of the handle state machine, the pool, the composite and the driver
/// boundary.
#[derive(Error, Debug, Clone)]
pub enum ResourceError {
    /// Operation attempted on a handle or component outside its accepting state
    #[error("Invalid state for '{id}': {operation} requires {expected}, found {actual}")]
    InvalidState {
        id: String,
        operation: String,
        expected: String,
        actual: String,
    },

    /// Caller supplied an argument the operation cannot work with
    #[error("Invalid argument '{parameter}': {reason}")]
    InvalidArgument { parameter: String, reason: String },

    /// A native, pooled or pinned allocation was rejected
    #[error("Allocation failed: {cause}")]
    AllocFailed { cause: String },

    /// The native allocator could not satisfy the request
    #[error("Out of memory: failed to allocate {requested} bytes")]
    OutOfMemory { requested: usize },

    /// Subtype cleanup failed; the handle has transitioned to Leaked
    #[error("Cleanup failed for '{id}': {cause}")]
    CleanupFailed { id: String, cause: String },

    /// Pinned-pool operation without a configured GPU context
    #[error("GPU context not configured")]
    GpuNotConfigured,

    /// The GPU driver returned a non-zero status code
    #[error("GPU driver error during {operation}: code {code}")]
    Gpu { operation: String, code: i32 },

    /// One or more member handles failed to close during composite teardown
    #[error("Close failed with {} error(s): {}", causes.len(), causes.join("; "))]
    CloseFailed { causes: Vec<String> },

    /// Invalid configuration parameter
    #[error("Invalid configuration parameter '{parameter}': {reason}")]
    InvalidConfiguration { parameter: String, reason: String },

    /// The global manager has already been initialized
    #[error("Resource manager has already been initialized")]
    AlreadyInitialized,

    /// The global manager has not been initialized
    #[error("Resource manager has not been initialized")]
    NotInitialized,
}

impl ResourceError {
    /// Create a new invalid-state error
    pub fn invalid_state<I, O>(id: I, operation: O, expected: &str, actual: &str) -> Self
    where
        I: Into<String>,
        O: Into<String>,
    {
        Self::InvalidState {
            id: id.into(),
            operation: operation.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Create a new invalid-argument error
    pub fn invalid_argument<P, R>(parameter: P, reason: R) -> Self
    where
        P: Into<String>,
        R: Into<String>,
    {
        Self::InvalidArgument {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// Create a new allocation-failed error
    pub fn alloc_failed<C: Into<String>>(cause: C) -> Self {
        Self::AllocFailed {
            cause: cause.into(),
        }
    }

    /// Create a new cleanup-failed error
    pub fn cleanup_failed<I, C>(id: I, cause: C) -> Self
    where
        I: Into<String>,
        C: Into<String>,
    {
        Self::CleanupFailed {
            id: id.into(),
            cause: cause.into(),
        }
    }

    /// Create a new configuration error
    pub fn config_error<P, R>(parameter: P, reason: R) -> Self
    where
        P: Into<String>,
        R: Into<String>,
    {
        Self::InvalidConfiguration {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors indicate conditions the caller can retry or route
    /// around; the rest require intervention.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::OutOfMemory { .. } => true,
            Self::AllocFailed { .. } => true,
            Self::Gpu { .. } => true,

            Self::InvalidState { .. } => false,
            Self::InvalidArgument { .. } => false,
            Self::CleanupFailed { .. } => false,
            Self::GpuNotConfigured => false,
            Self::CloseFailed { .. } => false,
            Self::InvalidConfiguration { .. } => false,
            Self::AlreadyInitialized => false,
            Self::NotInitialized => false,
        }
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidState { .. } => ErrorCategory::Lifecycle,
            Self::CleanupFailed { .. } | Self::CloseFailed { .. } => ErrorCategory::Cleanup,
            Self::AllocFailed { .. } | Self::OutOfMemory { .. } => ErrorCategory::Allocation,
            Self::GpuNotConfigured | Self::Gpu { .. } => ErrorCategory::Gpu,
            Self::InvalidArgument { .. } => ErrorCategory::Argument,
            Self::InvalidConfiguration { .. } => ErrorCategory::Configuration,
            Self::AlreadyInitialized | Self::NotInitialized => ErrorCategory::Initialization,
        }
    }
}

/// Error categories for easier error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Lifecycle,
    Cleanup,
    Allocation,
    Gpu,
    Argument,
    Configuration,
    Initialization,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lifecycle => write!(f, "Lifecycle"),
            Self::Cleanup => write!(f, "Cleanup"),
            Self::Allocation => write!(f, "Allocation"),
            Self::Gpu => write!(f, "Gpu"),
            Self::Argument => write!(f, "Argument"),
            Self::Configuration => write!(f, "Configuration"),
            Self::Initialization => write!(f, "Initialization"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ResourceError::invalid_state("buf-01", "get", "Allocated", "Closed");
        assert!(err.to_string().contains("buf-01"));
        assert!(err.to_string().contains("Allocated"));

        let err = ResourceError::OutOfMemory { requested: 4096 };
        assert!(err.to_string().contains("4096"));

        let err = ResourceError::CloseFailed {
            causes: vec!["first".to_string(), "second".to_string()],
        };
        assert!(err.to_string().contains("2 error(s)"));
        assert!(err.to_string().contains("first; second"));
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(
            ResourceError::GpuNotConfigured.category(),
            ErrorCategory::Gpu
        );
        assert_eq!(
            ResourceError::cleanup_failed("id", "boom").category(),
            ErrorCategory::Cleanup
        );
        assert_eq!(
            ResourceError::config_error("alignment", "must be a power of two").category(),
            ErrorCategory::Configuration
        );
    }

    #[test]
    fn test_recoverability() {
        assert!(ResourceError::OutOfMemory { requested: 1 }.is_recoverable());
        assert!(!ResourceError::GpuNotConfigured.is_recoverable());
        assert!(!ResourceError::AlreadyInitialized.is_recoverable());
    }
}
