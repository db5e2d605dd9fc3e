//! Typed error hierarchy for the fleet hub.
//!
//! Two top-level enums cover the two subsystems:
//! - `RealtimeError`: connection admission, cross-plugin calls, inbound frames
//! - `SchedulerError`: execution plan scheduling and completion

use thiserror::Error;

/// Errors from the plugin framework and the namespace plugins.
#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("Connection {connection} rejected by namespace '{namespace}'")]
    AuthenticationFailure {
        namespace: &'static str,
        connection: String,
    },

    #[error("Device {device_id} is not connected")]
    DeviceUnreachable { device_id: String },

    #[error("Plugin '{name}' is not running")]
    PluginStopped { name: &'static str },

    #[error("Plugin '{name}' is not connected to this plugin")]
    MissingSibling { name: &'static str },

    #[error("Malformed '{event}' payload: {source}")]
    MalformedPayload {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unknown event '{event}'")]
    UnknownEvent { event: String },

    #[error("Invalid '{event}' request: {reason}")]
    InvalidRequest { event: &'static str, reason: String },
}

/// Raised by storage when a template id is already taken.
#[derive(Debug, Error)]
#[error("Update template {id} already exists")]
pub struct TemplateExists {
    pub id: String,
}

/// Errors from the execution plan scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Update template {id} not found")]
    TemplateNotFound { id: String },

    #[error("Storage error: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("Failed to persist {failed} of {attempted} execution plans: {first_error}")]
    PartialStorageFailure {
        failed: usize,
        attempted: usize,
        first_error: String,
    },

    #[error(transparent)]
    Realtime(#[from] RealtimeError),
}
