//! Error types for the WebApp Operator
//!
//! Store calls are classified once, at the store boundary, into [`StoreError`].
//! Everything above that layer matches on the classification instead of
//! re-parsing API responses.

use std::fmt::Display;
use std::time::Duration;

use thiserror::Error;

/// Result type alias using the operator's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Classified failure of a single resource store call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The object does not exist
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: String },

    /// A create raced with another writer that created the object first
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: String },

    /// The concurrency token no longer matches the stored object
    #[error("{kind} {key} was modified concurrently: {message}")]
    Conflict {
        kind: String,
        key: String,
        message: String,
    },

    /// Network or availability failure of the resource store
    #[error("resource store unavailable: {0}")]
    Transient(String),
}

impl StoreError {
    pub fn not_found(kind: impl Into<String>, key: impl Display) -> Self {
        StoreError::NotFound {
            kind: kind.into(),
            key: key.to_string(),
        }
    }

    pub fn already_exists(kind: impl Into<String>, key: impl Display) -> Self {
        StoreError::AlreadyExists {
            kind: kind.into(),
            key: key.to_string(),
        }
    }

    pub fn conflict(kind: impl Into<String>, key: impl Display, message: impl Into<String>) -> Self {
        StoreError::Conflict {
            kind: kind.into(),
            key: key.to_string(),
            message: message.into(),
        }
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        StoreError::Transient(msg.into())
    }

    /// Classify a kube client error for an object of `kind` at `key`
    pub fn from_kube(kind: &str, key: impl Display, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => Self::not_found(kind, key),
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                Self::already_exists(kind, key)
            }
            kube::Error::Api(resp) if resp.code == 409 => Self::conflict(kind, key, resp.message),
            other => Self::transient(other.to_string()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// How the reconcile engine treats a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Expected race or absence; not a failure in itself
    Benign,
    /// Optimistic concurrency collision; retry immediately
    Conflict,
    /// Retry with backoff
    Transient,
    /// Surface to the operator; do not retry until the resource changes
    Fatal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Benign => "benign",
            ErrorClass::Conflict => "conflict",
            ErrorClass::Transient => "transient",
            ErrorClass::Fatal => "fatal",
        }
    }
}

/// Operator error types
#[derive(Error, Debug)]
pub enum Error {
    /// Resource store call failed
    #[error("Resource store error: {0}")]
    Store(#[from] StoreError),

    /// Kubernetes API error outside the store, such as the CRD check
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The desired state cannot be built from the parent spec
    #[error("Validation error: {0}")]
    Validation(String),

    /// A reconcile pass exceeded its deadline
    #[error("Reconcile of {key} exceeded its deadline of {timeout:?}")]
    Timeout { key: String, timeout: Duration },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Store(StoreError::NotFound { .. } | StoreError::AlreadyExists { .. }) => {
                ErrorClass::Benign
            }
            Error::Store(StoreError::Conflict { .. }) => ErrorClass::Conflict,
            Error::Store(StoreError::Transient(_)) | Error::Kube(_) | Error::Timeout { .. } => {
                ErrorClass::Transient
            }
            Error::Validation(_) | Error::Config(_) => ErrorClass::Fatal,
        }
    }
}
