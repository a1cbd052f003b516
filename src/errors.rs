//! Error handling for the sentiment control loop
//!
//! Every failure inside the loop is expressed as a `LoopError`. The monitoring
//! and retraining paths convert these into terminal snapshot or job states;
//! only the HTTP and CLI edges surface them directly.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoopError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Store operation failed: {operation} - {source}")]
    Store {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Feedback store unavailable: {message}")]
    StoreUnavailable { message: String },

    #[error("Serialization failed: {context}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O failed during {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Insufficient data: {sample_count} feedback samples, {required} required")]
    InsufficientData { sample_count: usize, required: usize },

    #[error("Training failed at {stage}: {message}")]
    Training { stage: String, message: String },

    #[error("Training cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("Candidate {version} rejected: {reason}")]
    ValidationRejected { version: String, reason: String },

    #[error("Registry corruption for {version}: {message}")]
    RegistryCorruption { version: String, message: String },

    #[error("Invalid transition for {version}: {from} -> {to}")]
    InvalidTransition {
        version: String,
        from: String,
        to: String,
    },

    #[error("Feedback already recorded for prediction {prediction_id}")]
    FeedbackAlreadyRecorded { prediction_id: u64 },

    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Lock poisoned: {resource}")]
    MutexPoisoned { resource: String },

    #[error("{resource} not found: {id}")]
    NotFound { resource: String, id: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type LoopResult<T> = Result<T, LoopError>;

impl LoopError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Wrap a backend failure that is not a plain outage
    pub fn store(
        operation: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Store {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    pub fn serialization(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            context: context.into(),
            source,
        }
    }

    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn training(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Training {
            stage: stage.into(),
            message: message.into(),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    pub fn validation_rejected(version: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ValidationRejected {
            version: version.into(),
            reason: reason.into(),
        }
    }

    pub fn registry_corruption(version: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RegistryCorruption {
            version: version.into(),
            message: message.into(),
        }
    }

    pub fn invalid_transition(
        version: impl Into<String>,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidTransition {
            version: version.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for failures the monitoring cycle should retry with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, LoopError::StoreUnavailable { .. })
    }
}

impl IntoResponse for LoopError {
    fn into_response(self) -> Response {
        let status = match self {
            LoopError::Config { .. }
            | LoopError::Serialization { .. }
            | LoopError::Validation { .. } => StatusCode::BAD_REQUEST,
            LoopError::NotFound { .. } => StatusCode::NOT_FOUND,
            LoopError::FeedbackAlreadyRecorded { .. }
            | LoopError::InvalidTransition { .. } => StatusCode::CONFLICT,
            LoopError::InsufficientData { .. } | LoopError::ValidationRejected { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            LoopError::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            LoopError::Store { .. }
            | LoopError::Io { .. }
            | LoopError::Training { .. }
            | LoopError::Cancelled { .. }
            | LoopError::RegistryCorruption { .. }
            | LoopError::MutexPoisoned { .. }
            | LoopError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Lock poisoning becomes a `LoopError` instead of a panic.
pub trait SafeLock<T: ?Sized> {
    fn safe_lock(&self) -> LoopResult<std::sync::MutexGuard<'_, T>>;
}

impl<T: ?Sized> SafeLock<T> for std::sync::Mutex<T> {
    fn safe_lock(&self) -> LoopResult<std::sync::MutexGuard<'_, T>> {
        self.lock().map_err(|_| LoopError::MutexPoisoned {
            resource: "mutex".to_string(),
        })
    }
}

pub trait SafeReadLock<T: ?Sized> {
    fn safe_read(&self) -> LoopResult<std::sync::RwLockReadGuard<'_, T>>;
}

impl<T: ?Sized> SafeReadLock<T> for std::sync::RwLock<T> {
    fn safe_read(&self) -> LoopResult<std::sync::RwLockReadGuard<'_, T>> {
        self.read().map_err(|_| LoopError::MutexPoisoned {
            resource: "rwlock (read)".to_string(),
        })
    }
}

pub trait SafeWriteLock<T: ?Sized> {
    fn safe_write(&self) -> LoopResult<std::sync::RwLockWriteGuard<'_, T>>;
}

impl<T: ?Sized> SafeWriteLock<T> for std::sync::RwLock<T> {
    fn safe_write(&self) -> LoopResult<std::sync::RwLockWriteGuard<'_, T>> {
        self.write().map_err(|_| LoopError::MutexPoisoned {
            resource: "rwlock (write)".to_string(),
        })
    }
}

impl From<sled::Error> for LoopError {
    fn from(err: sled::Error) -> Self {
        match err {
            sled::Error::Io(source) => LoopError::store_unavailable(source.to_string()),
            other => LoopError::store("sled_operation", other),
        }
    }
}

impl From<serde_json::Error> for LoopError {
    fn from(err: serde_json::Error) -> Self {
        LoopError::serialization("json_operation", err)
    }
}

impl From<std::io::Error> for LoopError {
    fn from(err: std::io::Error) -> Self {
        LoopError::io("io_operation", err)
    }
}

impl From<figment::Error> for LoopError {
    fn from(err: figment::Error) -> Self {
        LoopError::config(err.to_string())
    }
}
