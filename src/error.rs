//! Crate-wide error kinds and the public-API error envelope.
//!
//! Each module (store, cache, ann, indexer, search) owns its own
//! `thiserror`-derived error enum for the detail a maintainer needs at the
//! call site. This module defines the small, stable vocabulary those errors
//! collapse into at the public boundary: the kind a *caller* needs, not the
//! kind a debugger needs.

use serde::Serialize;
use std::fmt;

/// The taxonomy of failures the core can report, independent of which
/// module raised them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    StoreCorrupt,
    VersionMismatch,
    DimensionMismatch,
    ModelMismatch,
    SaveInProgress,
    EmbedderError,
    AnnFault,
    TransientIO,
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::StoreCorrupt => "store_corrupt",
            ErrorKind::VersionMismatch => "version_mismatch",
            ErrorKind::DimensionMismatch => "dimension_mismatch",
            ErrorKind::ModelMismatch => "model_mismatch",
            ErrorKind::SaveInProgress => "save_in_progress",
            ErrorKind::EmbedderError => "embedder_error",
            ErrorKind::AnnFault => "ann_fault",
            ErrorKind::TransientIO => "transient_io",
            ErrorKind::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// An error that has crossed a module boundary and is ready to be shown to
/// a caller of the public API (the `Service`, the JSON-RPC adapter, or the
/// CLI's `--json` mode). Carries enough to build `{ ok: false, error, kind }`
/// without the caller needing to downcast anything.
#[derive(Debug)]
pub struct CoreError {
    kind: ErrorKind,
    message: String,
    #[allow(dead_code)]
    source: Option<anyhow::Error>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn wrap(kind: ErrorKind, message: impl Into<String>, source: anyhow::Error) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// The wire shape for a failed operation: user-visible failures are
/// structured `{ ok: false, error, kind }` objects; nothing crosses the
/// public API as an unstructured panic or raw error string.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub ok: bool,
    pub error: String,
    pub kind: ErrorKind,
}

impl From<&CoreError> for ErrorEnvelope {
    fn from(e: &CoreError) -> Self {
        ErrorEnvelope {
            ok: false,
            error: e.message().to_string(),
            kind: e.kind(),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_displays_as_snake_case() {
        assert_eq!(ErrorKind::StoreCorrupt.to_string(), "store_corrupt");
        assert_eq!(ErrorKind::SaveInProgress.to_string(), "save_in_progress");
    }

    #[test]
    fn envelope_serializes_with_ok_false() {
        let err = CoreError::new(ErrorKind::DimensionMismatch, "expected 384, got 128");
        let env = ErrorEnvelope::from(&err);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["kind"], "dimension_mismatch");
        assert_eq!(json["error"], "expected 384, got 128");
    }
}
