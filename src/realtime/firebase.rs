//! Firebase Realtime Database adapter over the REST streaming API.
//!
//! Each subscription holds one `text/event-stream` request open against
//! `{database_url}/{path}.json`. The server first sends the node's current
//! value as a `put` at `/`, then `put`/`patch` events relative to the node.
//! The adapter keeps its own copy of the node and hands the whole value to
//! the listener after every change.

use futures::StreamExt;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::server::TokenProvider;

use super::{NotificationChannel, Subscription, ValueListener};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct FirebaseChannel {
  http: reqwest::Client,
  database_url: String,
  tokens: Arc<dyn TokenProvider>,
}

impl FirebaseChannel {
  pub fn new(database_url: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Self {
    Self {
      http: reqwest::Client::new(),
      database_url: database_url.into().trim_end_matches('/').to_string(),
      tokens,
    }
  }

  fn url_for(&self, path: &str) -> Result<Url> {
    Ok(Url::parse(&format!(
      "{}/{}.json",
      self.database_url,
      path.trim_matches('/')
    ))?)
  }

  /// Stream one connection until it ends or fails. `delivered` counts the
  /// values handed to the listener.
  async fn stream_once(
    &self,
    url: &Url,
    listener: &ValueListener,
    delivered: &mut u64,
  ) -> Result<()> {
    let mut request = self
      .http
      .get(url.clone())
      .header(ACCEPT, "text/event-stream");
    if let Some(token) = self.tokens.id_token().await? {
      request = request.query(&[("auth", token)]);
    }

    let response = request.send().await?.error_for_status()?;
    let mut body = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut node = Value::Null;

    while let Some(chunk) = body.next().await {
      buffer.extend_from_slice(&chunk?);

      while let Some(raw) = take_event(&mut buffer) {
        let event = SseEvent::parse(&String::from_utf8_lossy(&raw));

        match event.name.as_str() {
          "put" | "patch" => {
            let update: EventData = serde_json::from_str(&event.data)?;
            if event.name == "put" {
              set_at(&mut node, &update.path, update.data);
            } else {
              merge_at(&mut node, &update.path, update.data);
            }
            *delivered += 1;
            listener(node.clone());
          }
          "keep-alive" => {}
          "cancel" => return Err(Error::Realtime(format!("stream cancelled: {}", event.data))),
          "auth_revoked" => return Err(Error::Realtime("auth revoked".to_string())),
          other => debug!(event = other, "Ignoring unknown stream event"),
        }
      }
    }

    Ok(())
  }

  /// Reconnects forever; the task is aborted when the subscription drops.
  /// Every reconnect waits for the backoff, which only resets once a stream
  /// has delivered a value.
  async fn run(self, path: String, listener: ValueListener) {
    let url = match self.url_for(&path) {
      Ok(url) => url,
      Err(e) => {
        warn!(path, error = %e, "Cannot subscribe");
        return;
      }
    };

    let mut backoff = INITIAL_BACKOFF;
    loop {
      let mut delivered = 0;
      let result = self.stream_once(&url, &listener, &mut delivered).await;
      if delivered > 0 {
        backoff = INITIAL_BACKOFF;
      }

      match result {
        Ok(()) => debug!(path, delivered, ?backoff, "Stream closed by server, reconnecting"),
        Err(e) => warn!(path, error = %e, ?backoff, "Stream failed, reconnecting"),
      }
      tokio::time::sleep(backoff).await;
      backoff = (backoff * 2).min(MAX_BACKOFF);
    }
  }
}

impl NotificationChannel for FirebaseChannel {
  fn subscribe(&self, path: &str, listener: ValueListener) -> Subscription {
    debug!(path, "Opening realtime stream");
    let task = tokio::spawn(self.clone().run(path.to_string(), listener));
    Subscription::new(path, move || task.abort())
  }
}

// ============================================================================
// Server-sent events
// ============================================================================

#[derive(Debug, Default, PartialEq)]
struct SseEvent {
  name: String,
  data: String,
}

impl SseEvent {
  fn parse(raw: &str) -> Self {
    let mut event = SseEvent::default();
    let mut data_lines = Vec::new();

    for line in raw.lines() {
      if let Some(name) = line.strip_prefix("event:") {
        event.name = name.trim().to_string();
      } else if let Some(data) = line.strip_prefix("data:") {
        data_lines.push(data.strip_prefix(' ').unwrap_or(data));
      }
    }

    event.data = data_lines.join("\n");
    event
  }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
  haystack
    .windows(needle.len())
    .position(|window| window == needle)
}

/// Remove the first complete event from the buffer. Events end with a blank
/// line; a multi-byte character split across chunks stays in the buffer
/// until its event is complete.
fn take_event(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
  let (end, separator) = [(find(buffer, b"\n\n"), 2), (find(buffer, b"\r\n\r\n"), 4)]
    .into_iter()
    .filter_map(|(end, len)| end.map(|end| (end, len)))
    .min_by_key(|(end, _)| *end)?;

  let raw = buffer[..end].to_vec();
  buffer.drain(..end + separator);
  Some(raw)
}

#[derive(Debug, Deserialize)]
struct EventData {
  path: String,
  #[serde(default)]
  data: Value,
}

fn segments(path: &str) -> Vec<&str> {
  path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Replace the value at `path`, relative to `node`. Writing null deletes.
fn set_at(node: &mut Value, path: &str, value: Value) {
  let segments = segments(path);
  let Some((last, parents)) = segments.split_last() else {
    *node = value;
    return;
  };

  let mut current = node;
  for segment in parents {
    if !current.is_object() {
      *current = Value::Object(Map::new());
    }
    let Some(object) = current.as_object_mut() else {
      return;
    };
    current = object
      .entry(segment.to_string())
      .or_insert(Value::Object(Map::new()));
  }

  if !current.is_object() {
    *current = Value::Object(Map::new());
  }
  if let Some(object) = current.as_object_mut() {
    if value.is_null() {
      object.remove(*last);
    } else {
      object.insert(last.to_string(), value);
    }
  }
}

/// Apply each child of `patch` under `path`.
fn merge_at(node: &mut Value, path: &str, patch: Value) {
  let base = path.trim_end_matches('/');
  match patch {
    Value::Object(children) => {
      for (key, value) in children {
        set_at(node, &format!("{}/{}", base, key), value);
      }
    }
    other => set_at(node, path, other),
  }
}
