use serde_json::{json, Value};
use thiserror::Error;

use crate::pipeline::{AssetId, PipelineStage};

/// Failures surfaced by the engine. Nothing in the engine retries on its own; every
/// variant is reported to the caller, which decides whether the user may try again.
#[derive(Error, Debug)]
pub enum Error {
    /// A write to or read from the blob store did not complete.
    #[error("storage error: {0}")]
    Storage(String),

    /// The generation provider call failed or returned a fault payload.
    #[error("generation failed ({provider}): {message}")]
    Generation { provider: String, message: String },

    /// The provider answered with a result shape the client cannot interpret.
    #[error("unrecognized provider output: {0}")]
    UnrecognizedProviderOutput(String),

    /// The provider's result URL could not be fetched for persisting.
    #[error("failed to fetch result ({url}): {message}")]
    ResultFetch { url: String, message: String },

    #[error("{operation} is not permitted while {stage}")]
    InvalidStage {
        operation: &'static str,
        stage: PipelineStage,
    },

    #[error("a restyle is already in flight for this session")]
    RestyleInFlight,

    /// The asset is not part of the session's active set (never submitted, failed, or reset).
    #[error("unknown asset {0}")]
    UnknownAsset(AssetId),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Storage(_) => "storage_error",
            Error::Generation { .. } => "generation_error",
            Error::UnrecognizedProviderOutput(_) => "unrecognized_provider_output",
            Error::ResultFetch { .. } => "result_fetch_error",
            Error::InvalidStage { .. } => "invalid_stage",
            Error::RestyleInFlight => "restyle_in_flight",
            Error::UnknownAsset(_) => "unknown_asset",
            Error::Config(_) => "config_error",
            Error::Io(_) => "io_error",
        }
    }

    pub(crate) fn storage(context: &str, err: impl std::fmt::Display) -> Self {
        Error::Storage(format!("{context}: {err}"))
    }

    pub(crate) fn event_fields(&self) -> Value {
        json!({
            "error_kind": self.kind(),
            "error": self.to_string(),
        })
    }
}

/// Clonable record of the last failure, kept on the session for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub kind: &'static str,
    pub message: String,
    pub stage: PipelineStage,
}

impl FailureReport {
    pub(crate) fn new(err: &Error, stage: PipelineStage) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            stage,
        }
    }
}
