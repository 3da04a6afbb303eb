//! Error types for shuairan.
//!
//! Messages are lowercase and read `"<operation> failed: <reason>"` or
//! `"<entity> not found: <identifier>"`, carrying the vCPU index, device
//! index or field path needed to diagnose a failure without re-running.

use std::time::Duration;
use thiserror::Error;

use crate::device::DeviceError;
use shuairan_desc::ParseError;

/// Result type alias using shuairan's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in shuairan operations.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Description Errors
    // ========================================================================
    /// The VM description is malformed or invalid.
    #[error(transparent)]
    Description(#[from] ParseError),

    // ========================================================================
    // Device Errors
    // ========================================================================
    /// Device realization or dispatch failed.
    #[error(transparent)]
    Device(#[from] DeviceError),

    // ========================================================================
    // vCPU Errors
    // ========================================================================
    /// Guest execution produced an unhandled trap.
    #[error("vcpu {index} fault: {reason}")]
    VcpuFault {
        /// Faulting vCPU.
        index: u32,
        /// What the guest did.
        reason: String,
    },

    /// A vCPU did not acknowledge a control command within the grace period.
    #[error("vcpu {index} control timeout: no {command} acknowledgement after {}", humantime::format_duration(*waited))]
    ControlTimeout {
        /// Unresponsive vCPU.
        index: u32,
        /// Command that was not acknowledged.
        command: &'static str,
        /// How long the control thread waited.
        waited: Duration,
    },

    /// The execution backend could not create a vCPU.
    #[error("vcpu creation failed: vcpu {index}: {reason}")]
    VcpuCreation {
        /// vCPU being created.
        index: u32,
        /// Backend message.
        reason: String,
    },

    /// The OS refused to start a vCPU thread.
    #[error("vcpu thread spawn failed: vcpu {index}: {reason}")]
    ThreadSpawn {
        /// vCPU whose thread failed to start.
        index: u32,
        /// OS error message.
        reason: String,
    },

    /// A control channel endpoint went away.
    #[error("control channel closed: {0}")]
    ChannelClosed(String),

    // ========================================================================
    // VM Lifecycle Errors
    // ========================================================================
    /// Guest memory allocation or image loading failed.
    #[error("vm boot failed: {0}")]
    BootFailed(String),

    /// Guest memory access outside the configured region.
    #[error("guest memory access failed: {len} bytes at {addr:#x} exceed region of {size:#x} bytes")]
    GuestMemory {
        /// Guest physical address.
        addr: u64,
        /// Access length.
        len: usize,
        /// Region size.
        size: u64,
    },

    /// VM or hypervisor is in an invalid state for the requested operation.
    #[error("invalid vm state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state.
        expected: String,
        /// Actual state.
        actual: String,
    },

    /// The VM crashed earlier; the original error was already reported.
    #[error("vm crashed: {reason}")]
    VmCrashed {
        /// Message of the error that crashed the VM.
        reason: String,
    },

    /// VM not found by id.
    #[error("vm not found: {id}")]
    VmNotFound {
        /// Id that was looked up.
        id: u32,
    },

    /// The hypervisor cannot host another VM.
    #[error("vm capacity exceeded: {0}")]
    Capacity(String),

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Hypervisor settings or logging setup failed.
    #[error("config operation failed: {operation}: {reason}")]
    Config {
        /// The operation that failed (e.g., "load", "parse").
        operation: String,
        /// The reason for the failure.
        reason: String,
    },

    // ========================================================================
    // IO Errors
    // ========================================================================
    /// IO error wrapper.
    #[error("io operation failed: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a vCPU fault error.
    pub fn vcpu_fault(index: u32, reason: impl Into<String>) -> Self {
        Self::VcpuFault {
            index,
            reason: reason.into(),
        }
    }

    /// Create a vCPU creation error.
    pub fn vcpu_creation(index: u32, reason: impl Into<String>) -> Self {
        Self::VcpuCreation {
            index,
            reason: reason.into(),
        }
    }

    /// Create a boot failure error.
    pub fn boot_failed(reason: impl Into<String>) -> Self {
        Self::BootFailed(reason.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state(expected: impl Into<String>, actual: impl ToString) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            actual: actual.to_string(),
        }
    }

    /// Create a config operation error.
    pub fn config(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error was detected before any VM resource was allocated.
    pub fn is_description_error(&self) -> bool {
        matches!(self, Error::Description(_))
    }

    /// Whether a running VM that hits this error must be crashed. Caller
    /// mistakes (bad description, wrong state, unknown id) leave it untouched.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::Description(_)
                | Error::InvalidState { .. }
                | Error::VmNotFound { .. }
                | Error::Capacity(_)
                | Error::Config { .. }
        )
    }

    /// vCPU that triggered this error, if any.
    pub fn vcpu_index(&self) -> Option<u32> {
        match self {
            Error::VcpuFault { index, .. }
            | Error::ControlTimeout { index, .. }
            | Error::VcpuCreation { index, .. }
            | Error::ThreadSpawn { index, .. } => Some(*index),
            _ => None,
        }
    }
}
