//! Server error variants and their wire format.
//!
//! Every variant serializes to a flat JSON object carrying the shared
//! [`ERRORS_ID`] constant, a `name` discriminant and the variant's own
//! fields. Parsing is strict: the field count must match exactly and every
//! field must have the expected type, otherwise the next candidate variant is
//! tried.

use serde_json::{json, Map, Value};

/// Marker shared by every error payload the server sends.
pub const ERRORS_ID: &str = "1RzR1mIpbI";

const GENERIC_NAME: &str = "ApphiveServerError";
const AUTH_SESSION_EXPIRED_NAME: &str = "ApphiveServerAuthSessionExpiredError";
const CLIENT_SHOWABLE_NAME: &str = "ApphiveServerClientShowableError";
const MODEL_NOT_FOUND_NAME: &str = "ApphiveServerModelNotFoundError";

/// Older servers tag the generic error with this name.
const LEGACY_GENERIC_NAME: &str = "ApphiveServerUnknownError";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServerError {
  #[error("Apphive server error")]
  Generic,

  /// The user must authenticate again.
  #[error("Apphive auth session expired")]
  AuthSessionExpired,

  /// A user-facing error with an English and a Spanish message.
  #[error("{en_message}")]
  ClientShowable {
    en_message: String,
    es_message: String,
  },

  #[error("Model not found: {model_name}")]
  ModelNotFound { model_name: String },
}

impl ServerError {
  pub fn client_showable(en_message: impl Into<String>, es_message: impl Into<String>) -> Self {
    ServerError::ClientShowable {
      en_message: en_message.into(),
      es_message: es_message.into(),
    }
  }

  pub fn model_not_found(model_name: impl Into<String>) -> Self {
    ServerError::ModelNotFound {
      model_name: model_name.into(),
    }
  }

  /// Discriminant written to the `name` field.
  pub fn name(&self) -> &'static str {
    match self {
      ServerError::Generic => GENERIC_NAME,
      ServerError::AuthSessionExpired => AUTH_SESSION_EXPIRED_NAME,
      ServerError::ClientShowable { .. } => CLIENT_SHOWABLE_NAME,
      ServerError::ModelNotFound { .. } => MODEL_NOT_FOUND_NAME,
    }
  }

  pub fn is_client_showable(&self) -> bool {
    matches!(self, ServerError::ClientShowable { .. })
  }

  /// The English message for client-showable errors.
  pub fn message(&self) -> Option<&str> {
    match self {
      ServerError::ClientShowable { en_message, .. } => Some(en_message),
      _ => None,
    }
  }

  /// True when this is a client-showable error whose message, in either
  /// language, equals `message`.
  pub fn is_by_message_content(&self, message: &str) -> bool {
    match self {
      ServerError::ClientShowable {
        en_message,
        es_message,
      } => en_message == message || es_message == message,
      _ => false,
    }
  }

  /// Serialize to the flat payload the server exchanges.
  pub fn to_sendable(&self) -> Value {
    match self {
      ServerError::Generic | ServerError::AuthSessionExpired => json!({
        "id": ERRORS_ID,
        "name": self.name(),
      }),
      ServerError::ClientShowable {
        en_message,
        es_message,
      } => json!({
        "id": ERRORS_ID,
        "name": self.name(),
        "enMessage": en_message,
        "esMessage": es_message,
      }),
      ServerError::ModelNotFound { model_name } => json!({
        "id": ERRORS_ID,
        "name": self.name(),
        "modelName": model_name,
      }),
    }
  }

  /// Classify a payload. Specific variants are tried first and the generic
  /// shape last; `None` means the payload is not a recognized error.
  pub fn from_sendable(payload: &Value) -> Option<ServerError> {
    let object = payload.as_object()?;

    parse_auth_session_expired(object)
      .or_else(|| parse_client_showable(object))
      .or_else(|| parse_model_not_found(object))
      .or_else(|| parse_generic(object))
  }
}

// ============================================================================
// Per-variant parsers
// ============================================================================

/// Checks the field count, the shared id and the discriminant.
fn has_header(object: &Map<String, Value>, field_count: usize, names: &[&str]) -> bool {
  object.len() == field_count
    && object.get("id").and_then(Value::as_str) == Some(ERRORS_ID)
    && object
      .get("name")
      .and_then(Value::as_str)
      .is_some_and(|name| names.contains(&name))
}

fn string_field(object: &Map<String, Value>, field: &str) -> Option<String> {
  object.get(field).and_then(Value::as_str).map(String::from)
}

fn parse_auth_session_expired(object: &Map<String, Value>) -> Option<ServerError> {
  has_header(object, 2, &[AUTH_SESSION_EXPIRED_NAME]).then_some(ServerError::AuthSessionExpired)
}

fn parse_client_showable(object: &Map<String, Value>) -> Option<ServerError> {
  if !has_header(object, 4, &[CLIENT_SHOWABLE_NAME]) {
    return None;
  }

  Some(ServerError::ClientShowable {
    en_message: string_field(object, "enMessage")?,
    es_message: string_field(object, "esMessage")?,
  })
}

fn parse_model_not_found(object: &Map<String, Value>) -> Option<ServerError> {
  if !has_header(object, 3, &[MODEL_NOT_FOUND_NAME]) {
    return None;
  }

  Some(ServerError::ModelNotFound {
    model_name: string_field(object, "modelName")?,
  })
}

fn parse_generic(object: &Map<String, Value>) -> Option<ServerError> {
  has_header(object, 2, &[GENERIC_NAME, LEGACY_GENERIC_NAME]).then_some(ServerError::Generic)
}
