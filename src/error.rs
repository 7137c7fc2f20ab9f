//! Library-wide error type.

use serde_json::Value;

use crate::server::ServerError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced while fetching, caching or listening.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The server answered with a recognized error payload.
  #[error(transparent)]
  Server(#[from] ServerError),

  /// The server answered with a non-success status and a payload that is not
  /// one of the known error shapes.
  #[error("Unrecognized server error (status {status}): {body}")]
  UnrecognizedServerError { status: u16, body: Value },

  #[error("HTTP request failed: {0}")]
  Http(#[from] reqwest::Error),

  #[error("Failed to decode response: {0}")]
  Decode(#[from] serde_json::Error),

  #[error("Invalid URL: {0}")]
  Url(#[from] url::ParseError),

  #[error("Invalid API path '{0}': paths must start with '/'")]
  InvalidPath(String),

  #[error("Failed to obtain id token: {0}")]
  Token(String),

  #[error("Cache entry for {0} was removed while it was being fetched")]
  CacheEntryMissing(String),

  #[error("Realtime channel error: {0}")]
  Realtime(String),

  #[error("Configuration error: {0}")]
  Config(String),
}

impl Error {
  /// The classified server error, if this is one.
  pub fn server_error(&self) -> Option<&ServerError> {
    match self {
      Error::Server(e) => Some(e),
      _ => None,
    }
  }

  /// Client-showable errors are user-facing validation failures and retrying
  /// them cannot change the outcome.
  pub fn is_retryable(&self) -> bool {
    !matches!(self, Error::Server(e) if e.is_client_showable())
  }
}
