//! Remote endpoints over HTTP.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Client, StatusCode};
use std::time::Duration;
use url::Url;

use super::HttpClient;
use crate::error::FetchError;

const USER_AGENT: &str = concat!("datasync/", env!("CARGO_PKG_VERSION"));

/// [`HttpClient`] backed by reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
  client: Client,
}

impl ReqwestClient {
  pub fn new(timeout: Duration) -> Result<Self, FetchError> {
    let client = Client::builder()
      .timeout(timeout)
      .user_agent(USER_AGENT)
      .build()
      .map_err(|e| FetchError::Network(format!("failed to build HTTP client: {}", e)))?;
    Ok(Self { client })
  }
}

#[async_trait]
impl HttpClient for ReqwestClient {
  async fn get(&self, url: &Url) -> Result<Bytes, FetchError> {
    tracing::debug!("Fetching dataset from `{}`", url);

    let response = self
      .client
      .get(url.clone())
      .header(header::ACCEPT, "application/json")
      .send()
      .await
      .map_err(|e| FetchError::Network(e.to_string()))?;

    let status = response.status();
    if status == StatusCode::NOT_FOUND {
      return Err(FetchError::NotFound(url.to_string()));
    }
    if !status.is_success() {
      return Err(FetchError::Network(format!("{} returned {}", url, status)));
    }

    response
      .bytes()
      .await
      .map_err(|e| FetchError::Network(e.to_string()))
  }
}
