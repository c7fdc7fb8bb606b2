// Copyright 2025 Vigil Maintainers
// SPDX-License-Identifier: Apache-2.0

//! Desired-state synthesis for monitoring workloads.
//!
//! The crate selects the monitor resources that apply to a target, compresses
//! the rendered configuration and compiles the target into the stateful
//! workloads, services and secrets that run it.

/// Errors that abort synthesis for one target
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Kubernetes internal error
    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    /// `serde` errors
    #[error("Serialization Error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// A label selector of the target cannot be parsed
    #[error("Invalid {field} selector: {source}")]
    InvalidSelector {
        /// Spec field holding the selector
        field: String,
        /// Parser error
        #[source]
        source: ParseExpressionError,
    },

    /// The version field is not a semantic version
    #[error("Invalid version {version:?}: {source}")]
    InvalidVersion {
        /// The raw version string
        version: String,
        /// Parser error
        #[source]
        source: semver::Error,
    },

    /// The major version has no known argument dialect
    #[error("Unsupported {component} major version {version}")]
    UnsupportedVersion {
        /// Software the version belongs to
        component: &'static str,
        /// The parsed version
        version: semver::Version,
    },

    /// Any other malformed input on the target
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A user supplied container cannot be merged into a generated one
    #[error("Merge conflict in container {container:?}: {reason}")]
    MergeConflict {
        /// Name of the container
        container: String,
        /// What could not be reconciled
        reason: String,
    },

    /// Compressing the configuration failed
    #[error("Compression Error: {0}")]
    CompressionError(#[from] std::io::Error),

    /// Generic string error messages
    #[error("{0}")]
    Message(String),
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Message(msg)
    }
}

impl Error {
    /// Input errors are terminal for the current attempt and need a spec change
    #[must_use]
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidSelector { .. }
                | Error::InvalidVersion { .. }
                | Error::UnsupportedVersion { .. }
                | Error::InvalidInput(_)
                | Error::MergeConflict { .. }
        )
    }
}

/// Generic result type used across the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

pub mod artifact;
pub mod config;
mod diagnostics;
pub mod hash;
pub mod merge;
pub mod selector;
pub mod synth;
pub mod telemetry;
pub mod version;

use kube::core::ParseExpressionError;

pub use crate::config::OperatorConfig;
pub use crate::diagnostics::*;
