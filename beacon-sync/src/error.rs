use std::{io, path::PathBuf};

use beacon_core::{Collection, CoreError};
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl TransportError {
    /// Only transport-level failures are worth retrying; anything the
    /// server answered with is final for this cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout
                | TransportError::ConnectionRefused(_)
                | TransportError::Network(_)
        )
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::ConnectionRefused(err.to_string())
        } else if err.is_decode() {
            TransportError::Decode(err.to_string())
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read store {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse store {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to serialize store: {0}")]
    Serialize(serde_json::Error),
    #[error("failed to write store {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("realtime channel is not connected")]
    NotConnected,
    #[error("realtime channel gave up reconnecting")]
    Closed,
    #[error("envelope serialization failed: {0}")]
    Serialization(#[from] CoreError),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("device is offline")]
    Offline,
    #[error("no {collection} record with id {id}")]
    MissingEntity { collection: Collection, id: String },
    #[error("invalid document: {0}")]
    InvalidDocument(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SyncError {
    pub fn missing(collection: Collection, id: impl Into<String>) -> Self {
        SyncError::MissingEntity {
            collection,
            id: id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_failures_are_transient() {
        assert!(TransportError::Timeout.is_transient());
        assert!(TransportError::ConnectionRefused("refused".to_owned()).is_transient());
        assert!(TransportError::Network("reset".to_owned()).is_transient());
        assert!(
            !TransportError::Status {
                status: 404,
                body: "{\"error\":\"not found\"}".to_owned()
            }
            .is_transient()
        );
        assert!(!TransportError::Decode("eof".to_owned()).is_transient());
    }
}
