//! SPDX-License-Identifier: GPL-3.0-or-later
//!
//! Unified error type for the update subsystem (spec §7). Every public fallible
//! operation returns `Result<T, UpdateError>` (or a subsystem error that converts
//! into it). Each error carries a component name, an operation tag, a message, an
//! optional cause, and the fatal/retryable flags the executor relies on to decide
//! whether to roll back or to retry.

use std::fmt;

/// Broad classification of an error, matching the dispositions spec.md §7 assigns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Checksum or signature mismatch. Fatal, never retried.
    IntegrityFailure,
    /// Rejected by the downgrade-protection policy.
    PolicyDenial,
    /// Retryable network condition (timeout, connection reset, 5xx).
    NetworkTransient,
    /// Non-retryable network condition (malformed response, unsupported host).
    NetworkPermanent,
    /// Missing dependency, version mismatch, unsupported platform.
    Incompatibility,
    /// Filesystem operation failed (permission, space, cross-device rename).
    FilesystemFailure,
    /// Post-update validation did not match the expected version.
    ValidationFailure,
}

impl ErrorKind {
    /// Whether this kind is fatal to the operation in progress (never silently
    /// swallowed; the caller must decide how to unwind).
    pub fn is_fatal(self) -> bool {
        !matches!(self, ErrorKind::NetworkTransient)
    }

    /// Whether the secure client's retry policy should consider this kind.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::NetworkTransient)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::IntegrityFailure => "integrity-failure",
            ErrorKind::PolicyDenial => "policy-denial",
            ErrorKind::NetworkTransient => "network-transient",
            ErrorKind::NetworkPermanent => "network-permanent",
            ErrorKind::Incompatibility => "incompatibility",
            ErrorKind::FilesystemFailure => "filesystem-failure",
            ErrorKind::ValidationFailure => "validation-failure",
        };
        f.write_str(s)
    }
}

/// Top-level error type threaded through every subsystem.
#[derive(Debug, thiserror::Error)]
#[error("[{component}:{operation}] {message}{}", .cause.as_ref().map(|c| format!(" (caused by: {c})")).unwrap_or_default())]
pub struct UpdateError {
    pub kind: ErrorKind,
    pub component: String,
    pub operation: String,
    pub message: String,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    pub fatal: bool,
    pub retryable: bool,
}

impl UpdateError {
    pub fn new(
        kind: ErrorKind,
        component: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let fatal = kind.is_fatal();
        let retryable = kind.is_retryable();
        UpdateError {
            kind,
            component: component.into(),
            operation: operation.into(),
            message: message.into(),
            cause: None,
            fatal,
            retryable,
        }
    }

    pub fn with_cause(
        mut self,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn integrity(component: impl Into<String>, operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IntegrityFailure, component, operation, message)
    }

    pub fn policy_denial(component: impl Into<String>, operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PolicyDenial, component, operation, message)
    }

    pub fn network_transient(component: impl Into<String>, operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NetworkTransient, component, operation, message)
    }

    pub fn network_permanent(component: impl Into<String>, operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NetworkPermanent, component, operation, message)
    }

    pub fn incompatibility(component: impl Into<String>, operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Incompatibility, component, operation, message)
    }

    pub fn filesystem(component: impl Into<String>, operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FilesystemFailure, component, operation, message)
    }

    pub fn validation(component: impl Into<String>, operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationFailure, component, operation, message)
    }
}

pub type Result<T> = std::result::Result<T, UpdateError>;

/// Helper for attaching component/operation context to a std::io::Error.
pub(crate) trait IoContext<T> {
    fn fs_ctx(self, component: &str, operation: &str) -> Result<T>;
}

impl<T> IoContext<T> for std::result::Result<T, std::io::Error> {
    fn fs_ctx(self, component: &str, operation: &str) -> Result<T> {
        self.map_err(|e| {
            UpdateError::filesystem(component, operation, e.to_string()).with_cause(e)
        })
    }
}
