//! Structured error types shared across distexp crates.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured payload attached to every [`DxError`] variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable machine readable error code.
    pub code: String,
    /// Human readable diagnostic message.
    pub message: String,
    /// Contextual key value pairs (experiment, binding, attempt, target, etc.).
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Optional hint that may help the caller resolve the issue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorInfo {
    /// Creates a new error payload with the provided code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            context: BTreeMap::new(),
            hint: None,
        }
    }

    /// Adds a context entry to the payload.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Sets a human readable hint for remediation.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// Canonical error type for the distexp engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "family", content = "detail")]
pub enum DxError {
    /// Invalid parameter specs, duplicate registrations, malformed plans.
    #[error("config error: {0}")]
    Config(ErrorInfo),
    /// Fatal run conditions: aborts, exhausted retries, failed experiment bodies.
    #[error("dispatch error: {0}")]
    Dispatch(ErrorInfo),
    /// Transport failures surfaced to a caller that asked for them.
    #[error("remote error: {0}")]
    Remote(ErrorInfo),
    /// Serialization, schema and file IO errors.
    #[error("serde error: {0}")]
    Serde(ErrorInfo),
}

impl Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code: {})", self.message, self.code)?;
        if !self.context.is_empty() {
            write!(f, " | context: [")?;
            for (idx, (key, value)) in self.context.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{key}={value}")?;
            }
            write!(f, "]")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, " | hint: {hint}")?;
        }
        Ok(())
    }
}

impl DxError {
    /// Returns a reference to the payload describing the error.
    pub fn info(&self) -> &ErrorInfo {
        match self {
            DxError::Config(info)
            | DxError::Dispatch(info)
            | DxError::Remote(info)
            | DxError::Serde(info) => info,
        }
    }

    /// Returns the same error with an extra context entry attached.
    pub fn with_context(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        match self {
            DxError::Config(info) => DxError::Config(info.with_context(key, value)),
            DxError::Dispatch(info) => DxError::Dispatch(info.with_context(key, value)),
            DxError::Remote(info) => DxError::Remote(info.with_context(key, value)),
            DxError::Serde(info) => DxError::Serde(info.with_context(key, value)),
        }
    }

    /// Shorthand for a configuration error.
    pub fn config(code: impl Into<String>, message: impl Into<String>) -> Self {
        DxError::Config(ErrorInfo::new(code, message))
    }

    /// Shorthand for a dispatch error.
    pub fn dispatch(code: impl Into<String>, message: impl Into<String>) -> Self {
        DxError::Dispatch(ErrorInfo::new(code, message))
    }

    /// Returns true for errors raised before any command was launched.
    pub fn is_config(&self) -> bool {
        matches!(self, DxError::Config(_))
    }
}
