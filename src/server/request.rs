//! Authenticated GET requests against the Apphive server.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};

use super::errors::ServerError;

/// Header carrying the user's id token.
pub const AUTH_HEADER: &str = "apphive-auth";

/// Ordered query-string parameters. `None` and empty values are skipped.
pub type SearchParams = Vec<(String, Option<String>)>;

/// Source of the id token attached to every request.
#[async_trait]
pub trait TokenProvider: Send + Sync {
  /// `Ok(None)` means the request goes out unauthenticated.
  async fn id_token(&self) -> Result<Option<String>>;
}

/// A fixed token, or none.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

#[async_trait]
impl TokenProvider for StaticToken {
  async fn id_token(&self) -> Result<Option<String>> {
    Ok(self.0.clone())
  }
}

/// Reads the token from an environment variable on every request so a
/// refreshed token is picked up without rebuilding the client.
#[derive(Debug, Clone)]
pub struct EnvToken {
  var: String,
}

impl EnvToken {
  pub fn new(var: impl Into<String>) -> Self {
    Self { var: var.into() }
  }
}

#[async_trait]
impl TokenProvider for EnvToken {
  async fn id_token(&self) -> Result<Option<String>> {
    match std::env::var(&self.var) {
      Ok(token) if !token.is_empty() => Ok(Some(token)),
      Ok(_) | Err(std::env::VarError::NotPresent) => Ok(None),
      Err(e) => Err(Error::Token(format!("{}: {}", self.var, e))),
    }
  }
}

#[derive(Debug, Deserialize)]
struct ResultEnvelope {
  #[serde(default)]
  result: Value,
}

/// HTTP client for the Apphive server API.
#[derive(Clone)]
pub struct ServerClient {
  http: reqwest::Client,
  server_host: String,
  tokens: Arc<dyn TokenProvider>,
  extra_headers: HeaderMap,
}

impl ServerClient {
  pub fn new(server_host: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Self {
    Self {
      http: reqwest::Client::new(),
      server_host: server_host.into().trim_end_matches('/').to_string(),
      tokens,
      extra_headers: HeaderMap::new(),
    }
  }

  /// Headers attached to every request, in addition to the auth header.
  pub fn with_extra_headers(mut self, headers: &BTreeMap<String, String>) -> Result<Self> {
    for (name, value) in headers {
      let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| Error::Config(format!("invalid header name '{}': {}", name, e)))?;
      let value = HeaderValue::from_str(value)
        .map_err(|e| Error::Config(format!("invalid value for header '{}': {}", name, e)))?;
      self.extra_headers.insert(name, value);
    }
    Ok(self)
  }

  pub fn server_host(&self) -> &str {
    &self.server_host
  }

  pub fn tokens(&self) -> Arc<dyn TokenProvider> {
    Arc::clone(&self.tokens)
  }

  /// Build `{server_host}/v2{path}` with the non-empty search params.
  pub fn url_for(&self, path: &str, search_params: Option<&SearchParams>) -> Result<Url> {
    if !path.starts_with('/') {
      return Err(Error::InvalidPath(path.to_string()));
    }

    let mut url = Url::parse(&format!("{}/v2{}", self.server_host, path))?;

    if let Some(params) = search_params {
      let present: Vec<(&str, &str)> = params
        .iter()
        .filter_map(|(name, value)| match value.as_deref() {
          Some(value) if !value.is_empty() => Some((name.as_str(), value)),
          _ => None,
        })
        .collect();

      if !present.is_empty() {
        url.query_pairs_mut().extend_pairs(present);
      }
    }

    Ok(url)
  }

  /// GET `path` and return the `result` field of the response, `null` when
  /// absent.
  pub async fn get_value(&self, path: &str, search_params: Option<&SearchParams>) -> Result<Value> {
    let url = self.url_for(path, search_params)?;

    let mut request = self.http.get(url.clone()).headers(self.extra_headers.clone());
    if let Some(token) = self.tokens.id_token().await? {
      request = request.header(AUTH_HEADER, token);
    }

    debug!(%url, "GET");
    let response = request.send().await?;
    let status = response.status();

    if !status.is_success() {
      // Non-JSON bodies are kept as a string
      let text = response.text().await.unwrap_or_default();
      let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
      return Err(classify_error(status.as_u16(), body));
    }

    let envelope: ResultEnvelope = response.json().await?;
    Ok(envelope.result)
  }

  /// GET `path` and deserialize its result. Use `Option<_>` for endpoints
  /// that may answer with a null result.
  pub async fn get<T: DeserializeOwned>(
    &self,
    path: &str,
    search_params: Option<&SearchParams>,
  ) -> Result<T> {
    let value = self.get_value(path, search_params).await?;
    Ok(serde_json::from_value(value)?)
  }
}

/// Turn a failed response body into a typed error.
pub fn classify_error(status: u16, body: Value) -> Error {
  match ServerError::from_sendable(&body) {
    Some(error) => Error::Server(error),
    None => Error::UnrecognizedServerError { status, body },
  }
}
