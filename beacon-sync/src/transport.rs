use std::time::Duration;

use async_trait::async_trait;
use beacon_core::{PullRequest, PullResponse, PushRequest};
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;
use url::Url;

use crate::{
    config::ConfigError,
    error::{SyncError, TransportError},
};

pub const PUSH_PATH: &str = "replicate/push";
pub const PULL_PATH: &str = "replicate/pull";

/// The replication server as seen by the push and pull engines.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn push(&self, request: &PushRequest) -> Result<(), TransportError>;

    async fn pull(&self, request: &PullRequest) -> Result<PullResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
    token: String,
}

impl HttpTransport {
    pub fn new(server_url: &str, token: &str, timeout: Duration) -> Result<Self, SyncError> {
        let mut base_url = Url::parse(server_url).map_err(|err| ConfigError::Invalid {
            errors: vec![format!("invalid server url {server_url}: {err}")],
        })?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(TransportError::from)?;
        Ok(Self {
            client,
            base_url,
            token: token.to_owned(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(path)
            .map_err(|err| TransportError::Network(format!("invalid endpoint {path}: {err}")))
    }

    async fn post<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, TransportError> {
        let url = self.endpoint(path)?;
        debug!(%url, "posting replication request");
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, TransportError> {
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|err| TransportError::Decode(err.to_string()))
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn push(&self, request: &PushRequest) -> Result<(), TransportError> {
        self.post(PUSH_PATH, request).await.map(|_| ())
    }

    async fn pull(&self, request: &PullRequest) -> Result<PullResponse, TransportError> {
        let response = self.post(PULL_PATH, request).await?;
        Self::decode(response).await
    }
}
