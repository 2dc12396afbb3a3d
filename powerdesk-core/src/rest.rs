//! REST fetch collaborator
//!
//! Thin JSON-over-HTTP client whose requests plug into [`CacheAccessor`]s as
//! fetchers.
//!
//! [`CacheAccessor`]: crate::cache::CacheAccessor

use anyhow::{Context, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::cache::Fetcher;
use crate::connection::CredentialSource;

#[derive(Clone)]
pub struct RestClient {
    client: Client,
    base_url: Url,
    credentials: Arc<dyn CredentialSource>,
}

impl RestClient {
    pub fn new(base_url: &str, credentials: Arc<dyn CredentialSource>) -> Result<Self> {
        Self::with_client(Client::new(), base_url, credentials)
    }

    /// Same as [`RestClient::new`] with a per-request timeout
    pub fn with_timeout(
        base_url: &str,
        credentials: Arc<dyn CredentialSource>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;
        Self::with_client(client, base_url, credentials)
    }

    pub fn with_client(
        client: Client,
        base_url: &str,
        credentials: Arc<dyn CredentialSource>,
    ) -> Result<Self> {
        let mut base_url =
            Url::parse(base_url).with_context(|| format!("invalid API base URL {}", base_url))?;
        // Keep the last path segment when joining relative paths
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            client,
            base_url,
            credentials,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .with_context(|| format!("invalid API path {}", path))
    }

    /// Authenticated GET decoded as JSON. Non-2xx statuses are errors.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path)?;
        debug!("GET {}", url.path());

        let mut request = self.client.get(url.clone());
        if let Some(token) = self.credentials.credential() {
            request = request.bearer_auth(token);
        }

        let value = request
            .send()
            .await
            .with_context(|| format!("GET {}", url.path()))?
            .error_for_status()?
            .json::<T>()
            .await
            .with_context(|| format!("decoding response of {}", url.path()))?;
        Ok(value)
    }

    /// Fetcher issuing `GET path` on every call
    pub fn fetcher<T>(&self, path: impl Into<String>) -> impl Fetcher<T> + 'static
    where
        T: DeserializeOwned + Send + 'static,
    {
        let client = self.clone();
        let path = path.into();
        move || {
            let client = client.clone();
            let path = path.clone();
            async move { client.get::<T>(&path).await }
        }
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}
