//! Reconciliation error types
//!
//! Stages return a classified [`ReconcileError`]; the control loop alone
//! turns it into a requeue or a terminal failure.

use stackflow_cloud::{CloudError, ErrorClass};
use stackflow_core::TransitionStep;
use std::time::Duration;
use thiserror::Error;

/// Short backoff for a machine left stopped mid-transition
pub const REQUEUE_PARTIAL_TRANSITION: Duration = Duration::from_secs(5);

/// Backoff for transient provider failures and not-yet-existing resources
pub const REQUEUE_TRANSIENT: Duration = Duration::from_secs(30);

/// Backoff while waiting for a public address to become available
pub const REQUEUE_ADDRESS: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    #[error("expected 1 {kind} matching {key}, but got {count}")]
    AmbiguousMatch {
        kind: &'static str,
        key: String,
        count: usize,
    },

    #[error("all Public IP Address(es) found were already allocated")]
    AllAllocated,

    #[error("no public addresses found in network: \"{network}\"")]
    NoAddressesFound { network: String },

    #[error("{0}")]
    Fatal(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("instance {instance_id} left at step {step} during affinity change: {source}")]
    PartialTransition {
        instance_id: String,
        step: TransitionStep,
        #[source]
        source: CloudError,
    },

    #[error("{operation} failed: {source}")]
    Cloud {
        operation: &'static str,
        #[source]
        source: CloudError,
    },

    #[error("invalid cluster spec: {0}")]
    InvalidSpec(String),
}

impl ReconcileError {
    /// Map a provider error for the given API operation
    pub fn cloud(operation: &'static str) -> impl Fn(CloudError) -> ReconcileError {
        move |source| ReconcileError::Cloud { operation, source }
    }

    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        ReconcileError::NotFound {
            kind,
            key: key.into(),
        }
    }

    /// Check a list response for exactly one match
    pub fn expect_one<T>(kind: &'static str, key: &str, mut items: Vec<T>) -> Result<T> {
        match items.len() {
            0 => Err(Self::not_found(kind, key)),
            1 => Ok(items.remove(0)),
            count => Err(ReconcileError::AmbiguousMatch {
                kind,
                key: key.to_string(),
                count,
            }),
        }
    }

    /// Provider class of the underlying error, if any
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            ReconcileError::Cloud { source, .. } | ReconcileError::PartialTransition { source, .. } => {
                Some(source.class())
            }
            _ => None,
        }
    }

    /// Zero matches, either counted by the engine or reported by the provider
    pub fn is_not_found(&self) -> bool {
        matches!(self, ReconcileError::NotFound { .. }) || self.class() == Some(ErrorClass::NotFound)
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::NotFound { .. }
            | ReconcileError::AllAllocated
            | ReconcileError::NoAddressesFound { .. }
            | ReconcileError::Transient(_)
            | ReconcileError::PartialTransition { .. } => true,
            ReconcileError::Cloud { source, .. } => {
                matches!(source.class(), ErrorClass::Transient | ErrorClass::NotFound)
            }
            ReconcileError::AmbiguousMatch { .. }
            | ReconcileError::Fatal(_)
            | ReconcileError::InvalidSpec(_) => false,
        }
    }

    /// Backoff before the next attempt; `None` for terminal errors
    pub fn requeue_after(&self) -> Option<Duration> {
        if !self.is_retryable() {
            return None;
        }
        Some(match self {
            ReconcileError::PartialTransition { .. } => REQUEUE_PARTIAL_TRANSITION,
            ReconcileError::AllAllocated | ReconcileError::NoAddressesFound { .. } => REQUEUE_ADDRESS,
            _ => REQUEUE_TRANSIENT,
        })
    }

    /// Machine-readable reason recorded in status
    pub fn reason(&self) -> &'static str {
        match self {
            ReconcileError::NotFound { .. } => "NotFound",
            ReconcileError::AmbiguousMatch { .. } => "AmbiguousMatch",
            ReconcileError::AllAllocated => "AllAllocated",
            ReconcileError::NoAddressesFound { .. } => "NoAddressesFound",
            ReconcileError::Fatal(_) => "Fatal",
            ReconcileError::Transient(_) => "Transient",
            ReconcileError::PartialTransition { .. } => "PartialTransition",
            ReconcileError::Cloud { source, .. } => match source.class() {
                ErrorClass::NotFound => "NotFound",
                ErrorClass::AlreadyExists => "AlreadyExists",
                ErrorClass::Ambiguous => "AmbiguousMatch",
                ErrorClass::Transient => "Transient",
                ErrorClass::Other => "ProviderError",
            },
            ReconcileError::InvalidSpec(_) => "InvalidSpec",
        }
    }
}

impl From<stackflow_core::FlowError> for ReconcileError {
    fn from(err: stackflow_core::FlowError) -> Self {
        ReconcileError::InvalidSpec(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
