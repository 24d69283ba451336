//! Error taxonomy surfaced across the controller/worker boundary.
//!
//! Variants map 1:1 onto the "surfaced kind" taxonomy, not onto internal
//! type names: callers match on the variant, never on a wrapped string.

use thiserror::Error;

/// Errors produced by any component in this crate.
///
/// `AlreadyLoading` is handled internally by the loader (callers awaiting the
/// same load observe success or another variant, never this one) but stays
/// in the enum because the state machine needs to name it.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    #[error("worker not available")]
    WorkerUnavailable,

    #[error("worker crashed")]
    WorkerCrashed,

    #[error("request timed out")]
    Timeout,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("Model memory is full. Try a smaller context size or fewer GPU layers.")]
    OutOfMemory,

    #[error("model not found: {0}")]
    NotFound(String),

    #[error("model not loaded: {0}")]
    NotLoaded(String),

    #[error("model already loading: {0}")]
    AlreadyLoading(String),

    #[error("no user message in conversation")]
    NoUserMessage,

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("AbortError: generation aborted")]
    Abort,

    #[error("backend error: {0}")]
    BackendError(String),
}

impl CoreError {
    /// Reconstruct a best-effort `CoreError` from the stable error strings
    /// the wire protocol carries (spec §6): an `"AbortError: ..."` prefix
    /// always means [`CoreError::Abort`], and a `"KV slot"` substring always
    /// means [`CoreError::OutOfMemory`], independent of surrounding text.
    pub fn from_wire(message: &str) -> Self {
        if message.starts_with("AbortError:") {
            CoreError::Abort
        } else if message.contains("KV slot") {
            CoreError::OutOfMemory
        } else {
            CoreError::BackendError(message.to_string())
        }
    }

    /// Render the stable wire string for this error, preserving the
    /// `"AbortError: ..."` prefix / `"KV slot"` substring contract.
    pub fn to_wire(&self) -> String {
        match self {
            CoreError::Abort => self.to_string(),
            _ => self.to_string(),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
