//! Data source boundary: the `Fetcher` trait and its HTTP implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::config::Config;

/// A retrieved KPI bundle. The payload is opaque to the refresh core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
  pub key: String,
  pub retrieved_at: DateTime<Utc>,
  pub payload: Value,
}

/// Parameters passed along with each fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchParams {
  pub period: String,
}

/// Something that can produce a fresh [`Dataset`].
///
/// Implementations must not retry or cache on their own; the controller owns
/// both. Every failure is reported through the error and shown as text.
pub trait Fetcher: Send + Sync {
  fn fetch<'a>(&'a self, key: &'a str, params: &'a FetchParams) -> BoxFuture<'a, Result<Dataset>>;
}

/// Response wrapper returned by the KPI API
#[derive(Debug, Deserialize)]
struct Envelope {
  success: bool,
  data: Option<Value>,
  error: Option<String>,
}

impl Envelope {
  fn into_dataset(self, key: &str) -> Result<Dataset> {
    if !self.success {
      return Err(eyre!(
        "{}",
        self.error.unwrap_or_else(|| "Unknown error".to_string())
      ));
    }

    let payload = self
      .data
      .ok_or_else(|| eyre!("Response contained no data"))?;

    Ok(Dataset {
      key: key.to_string(),
      retrieved_at: Utc::now(),
      payload,
    })
  }
}

/// Fetches datasets from `GET {base}/{key}?period={period}`.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
  base_url: Url,
}

impl HttpFetcher {
  pub fn new(config: &Config) -> Result<Self> {
    let base_url = base_url(&config.api.url)?;

    let mut headers = HeaderMap::new();
    match Config::get_api_token() {
      Ok(token) => {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
          .map_err(|e| eyre!("API token is not a valid header value: {}", e))?;
        headers.insert(AUTHORIZATION, value);
      }
      Err(e) => tracing::warn!(error = %e, "sending requests without authorization"),
    }

    let client = reqwest::Client::builder()
      .default_headers(headers)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, base_url })
  }

  async fn get(&self, key: &str, params: &FetchParams) -> Result<Dataset> {
    let url = endpoint(&self.base_url, key, params)?;
    tracing::debug!(%url, "requesting dataset");

    let response = self
      .client
      .get(url)
      .send()
      .await
      .map_err(|e| eyre!("Request failed: {}", e))?;

    let status = response.status();
    let body = response
      .text()
      .await
      .map_err(|e| eyre!("Failed to read response: {}", e))?;

    if !status.is_success() {
      let detail = serde_json::from_str::<Envelope>(&body)
        .ok()
        .and_then(|envelope| envelope.error);
      return Err(match detail {
        Some(detail) => eyre!("HTTP {}: {}", status, detail),
        None => eyre!("HTTP {}", status),
      });
    }

    let envelope: Envelope =
      serde_json::from_str(&body).map_err(|e| eyre!("Failed to parse response: {}", e))?;

    envelope.into_dataset(key)
  }
}

/// Parse the configured API url so that dataset keys join below it.
fn base_url(raw: &str) -> Result<Url> {
  let mut url = Url::parse(raw).map_err(|e| eyre!("Invalid API url {}: {}", raw, e))?;

  // Url::join replaces the last segment unless the base ends with '/'
  if !url.path().ends_with('/') {
    let path = format!("{}/", url.path());
    url.set_path(&path);
  }

  Ok(url)
}

fn endpoint(base: &Url, key: &str, params: &FetchParams) -> Result<Url> {
  let mut url = base
    .join(key)
    .map_err(|e| eyre!("Invalid dataset key {}: {}", key, e))?;
  url.query_pairs_mut().append_pair("period", &params.period);
  Ok(url)
}

impl Fetcher for HttpFetcher {
  fn fetch<'a>(&'a self, key: &'a str, params: &'a FetchParams) -> BoxFuture<'a, Result<Dataset>> {
    Box::pin(self.get(key, params))
  }
}
