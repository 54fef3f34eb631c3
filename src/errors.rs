//! Typed error hierarchy for scanfleet.
//!
//! One enum per subsystem:
//! - `ConfigError`: fatal configuration problems, surfaced at startup
//! - `StoreError` / `QueueError`: infrastructure, classified transient or not
//! - `PluginError`: a plugin invocation that could not even produce a result
//! - `EngineError`: worker lifecycle failures
//! - `DispatchError` / `ProviderError`: upstream HTTP collaborators

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Missing required setting: {0}")]
    Missing(String),

    #[error("Invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
}

/// Errors from the shared datastore.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connectivity-class failure: locked, busy, unopenable. Worth retrying.
    #[error("Datastore unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),

    #[error("Datastore lock poisoned")]
    LockPoisoned,

    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Classify an error chain coming out of the store.
    pub fn classify(err: anyhow::Error) -> Self {
        if let Some(sqlite) = err.downcast_ref::<rusqlite::Error>()
            && is_connectivity_error(sqlite)
        {
            return Self::Unavailable(err);
        }
        if err.downcast_ref::<StoreError>().is_some() {
            return match err.downcast::<StoreError>() {
                Ok(inner) => inner,
                Err(err) => Self::Other(err),
            };
        }
        Self::Other(err)
    }
}

fn is_connectivity_error(err: &rusqlite::Error) -> bool {
    use rusqlite::ErrorCode;
    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.code,
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::NotADatabase
        ),
        _ => false,
    }
}

/// Errors from a queue transport.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue {queue} unavailable: {source}")]
    Unavailable {
        queue: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Batch of {len} entries exceeds the transport maximum of {max}")]
    BatchTooLarge { len: usize, max: usize },

    #[error("Failed to encode queue message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A plugin invocation that failed before a result envelope could be built.
///
/// Bad plugin output is *not* an error: the runner turns it into a failed
/// `PluginResult`. These variants cover the runner itself breaking.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Failed to read settings for plugin {plugin}: {source}")]
    Settings {
        plugin: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Container runtime failed for plugin {plugin}: {source}")]
    Container {
        plugin: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to prepare invocation for plugin {plugin}: {message}")]
    Invocation { plugin: String, message: String },
}

impl PluginError {
    pub fn plugin(&self) -> &str {
        match self {
            Self::Settings { plugin, .. }
            | Self::Container { plugin, .. }
            | Self::Invocation { plugin, .. } => plugin,
        }
    }
}

/// Errors from the engine worker lifecycle.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Datastore still unavailable after {attempts} attempts")]
    DatastoreExhausted { attempts: u32 },

    #[error("Workspace error at {path}: {message}")]
    Workspace { path: PathBuf, message: String },

    #[error("Malformed task message: {0}")]
    MalformedTask(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the admission API client.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Admission API timed out")]
    Timeout,

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Admission API transport error: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("Admission API returned an unreadable body: {0}")]
    Decode(String),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Errors from a discovery provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider throttled us; the request should be retried unchanged.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Provider timed out: {0}")]
    Timeout(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Provider transport error: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("Unexpected provider response: {0}")]
    Decode(String),

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Unsupported request: {0}")]
    Unsupported(String),
}

impl ProviderError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }
}
