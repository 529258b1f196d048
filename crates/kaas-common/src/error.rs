//! Error types for conformance checks
//!
//! Errors are structured with fields to aid debugging from a plugin log.
//! Each variant names the node, path or context it belongs to so a failure
//! can be traced back to the cluster object that caused it.

use std::fmt;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Stage at which reading a persisted kubelet configuration failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStage {
    /// The file could not be opened (usually missing)
    Open,
    /// The file was opened but reading it failed
    Read,
    /// The content is not a valid configz document
    Parse,
}

impl fmt::Display for ReadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadStage::Open => write!(f, "open"),
            ReadStage::Read => write!(f, "read"),
            ReadStage::Parse => write!(f, "parse"),
        }
    }
}

/// Main error type for conformance operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error (listing, proxying)
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Building the cluster client failed
    #[error("client error: {message}")]
    Client {
        /// Description of what failed
        message: String,
    },

    /// Fetching a node endpoint through the API server proxy failed
    #[error("harvest error for node {node} endpoint {endpoint}: {message}")]
    Harvest {
        /// Node the request was proxied to
        node: String,
        /// Non-resource endpoint name (e.g. "configz")
        endpoint: String,
        /// Description of what failed
        message: String,
    },

    /// A persisted kubelet configuration could not be read or parsed
    #[error("failed to read/parse kubelet configuration {path} ({stage}): {message}")]
    KubeletConfig {
        /// File that was being read
        path: String,
        /// Stage that failed
        stage: ReadStage,
        /// Underlying cause
        message: String,
    },

    /// Local filesystem error outside of configuration reading
    #[error("io error at {path}: {message}")]
    Io {
        /// Path being written or created
        path: String,
        /// Underlying cause
        message: String,
    },

    /// Invalid input (configuration, node names, check selection)
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The offending field or flag, if known
        field: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "fan_out", "suite")
        context: String,
    },
}

impl Error {
    /// Create a client construction error
    pub fn client(msg: impl Into<String>) -> Self {
        Self::Client {
            message: msg.into(),
        }
    }

    /// Create a harvest error for a node endpoint
    pub fn harvest_for(
        node: impl Into<String>,
        endpoint: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Harvest {
            node: node.into(),
            endpoint: endpoint.into(),
            message: msg.into(),
        }
    }

    /// Create a kubelet configuration error at the given stage
    pub fn kubelet_config(path: impl Into<String>, stage: ReadStage, msg: impl Into<String>) -> Self {
        Self::KubeletConfig {
            path: path.into(),
            stage,
            message: msg.into(),
        }
    }

    /// Create an io error for a path
    pub fn io(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Io {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error naming the offending field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether this error aborts the whole check
    ///
    /// Harvest and kubelet configuration errors belong to a single node and
    /// the caller may continue with the next node. Everything else means the
    /// check cannot proceed.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Kube { .. } => true,
            Error::Client { .. } => true,
            Error::Harvest { .. } => false,
            Error::KubeletConfig { .. } => false,
            Error::Io { .. } => true,
            Error::Validation { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Get the node name if this error is associated with a specific node
    pub fn node(&self) -> Option<&str> {
        match self {
            Error::Harvest { node, .. } => Some(node),
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}
