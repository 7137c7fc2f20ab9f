//! Model property references and the name-to-id directory.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::context::ServerContext;
use crate::error::{Error, Result};
use crate::server::NamedId;

pub const MODEL_NAMES_PATH: &str = "/models/names";
pub const PROPERTY_NAMES_PATH: &str = "/models/propertyNames";

/// Record identifier inside a model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Identifier {
  Number(i64),
  Text(String),
}

impl fmt::Display for Identifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Identifier::Number(n) => write!(f, "{}", n),
      Identifier::Text(s) => f.write_str(s),
    }
  }
}

impl From<i64> for Identifier {
  fn from(n: i64) -> Self {
    Identifier::Number(n)
  }
}

impl From<&str> for Identifier {
  fn from(s: &str) -> Self {
    Identifier::Text(s.to_string())
  }
}

impl From<String> for Identifier {
  fn from(s: String) -> Self {
    Identifier::Text(s)
  }
}

/// Request to be notified when `prop` of the `name` record `identifier`
/// changes on the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelPropRef {
  pub name: String,
  pub prop: String,
  pub identifier: Identifier,
}

impl ModelPropRef {
  pub fn new(
    name: impl Into<String>,
    prop: impl Into<String>,
    identifier: impl Into<Identifier>,
  ) -> Self {
    Self {
      name: name.into(),
      prop: prop.into(),
      identifier: identifier.into(),
    }
  }
}

/// Parses `Model:prop:identifier`; numeric identifiers become
/// [`Identifier::Number`].
impl FromStr for ModelPropRef {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    let mut parts = s.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
      (Some(name), Some(prop), Some(identifier))
        if !name.is_empty() && !prop.is_empty() && !identifier.is_empty() =>
      {
        let identifier = identifier
          .parse::<i64>()
          .map(Identifier::Number)
          .unwrap_or_else(|_| Identifier::Text(identifier.to_string()));
        Ok(ModelPropRef::new(name, prop, identifier))
      }
      _ => Err(Error::Config(format!(
        "expected Model:prop:identifier, got '{}'",
        s
      ))),
    }
  }
}

/// Channel path for a resolved reference.
pub fn notification_path(model_id: i64, prop_id: i64, identifier: &Identifier) -> String {
  format!("updates/models/{}/{}/{}", model_id, prop_id, identifier)
}

/// Outcome of resolving a [`ModelPropRef`] against the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
  Path(String),
  /// The model or property name is not known to the server. No channel
  /// path exists for it.
  Unresolved {
    unknown_model: Option<String>,
    unknown_prop: Option<String>,
  },
}

/// Name-to-id tables for models and model properties.
#[derive(Debug, Clone, Default)]
pub struct NameDirectory {
  model_names: Vec<NamedId>,
  property_names: Vec<NamedId>,
}

impl NameDirectory {
  pub fn new(model_names: Vec<NamedId>, property_names: Vec<NamedId>) -> Self {
    Self {
      model_names,
      property_names,
    }
  }

  /// Read both tables through the context's cache. They never go stale, so
  /// each user's tables are fetched once and shared by every listener.
  pub async fn load(ctx: &ServerContext) -> Result<Self> {
    let names_key = ctx.query_key(MODEL_NAMES_PATH, None);
    let props_key = ctx.query_key(PROPERTY_NAMES_PATH, None);
    let retry = ctx.retry();

    let (names, props) = futures::try_join!(
      ctx.fetch_cached(&names_key, None, retry),
      ctx.fetch_cached(&props_key, None, retry)
    )?;

    let model_names: Option<Vec<NamedId>> = serde_json::from_value(names.entry.value)?;
    let property_names: Option<Vec<NamedId>> = serde_json::from_value(props.entry.value)?;

    Ok(Self::new(
      model_names.unwrap_or_default(),
      property_names.unwrap_or_default(),
    ))
  }

  fn find(table: &[NamedId], name: &str) -> Option<i64> {
    table.iter().find(|entry| entry.name == name).map(|entry| entry.id)
  }

  pub fn model_id(&self, name: &str) -> Option<i64> {
    Self::find(&self.model_names, name)
  }

  pub fn property_id(&self, name: &str) -> Option<i64> {
    Self::find(&self.property_names, name)
  }

  pub fn resolve(&self, reference: &ModelPropRef) -> Resolution {
    match (
      self.model_id(&reference.name),
      self.property_id(&reference.prop),
    ) {
      (Some(model_id), Some(prop_id)) => Resolution::Path(notification_path(
        model_id,
        prop_id,
        &reference.identifier,
      )),
      (model_id, prop_id) => Resolution::Unresolved {
        unknown_model: model_id.is_none().then(|| reference.name.clone()),
        unknown_prop: prop_id.is_none().then(|| reference.prop.clone()),
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::server::{ServerClient, StaticToken};
  use serde_json::json;
  use std::sync::Arc;
  use std::time::Duration;
  use wiremock::matchers::{method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn directory() -> NameDirectory {
    NameDirectory::new(
      vec![
        NamedId {
          id: 1,
          name: "User".into(),
        },
        NamedId {
          id: 2,
          name: "Invoice".into(),
        },
      ],
      vec![NamedId {
        id: 7,
        name: "email".into(),
      }],
    )
  }

  #[test]
  fn test_resolve_builds_path() {
    let reference = ModelPropRef::new("User", "email", 42);
    assert_eq!(
      directory().resolve(&reference),
      Resolution::Path("updates/models/1/7/42".into())
    );

    let reference = ModelPropRef::new("Invoice", "email", "inv-9");
    assert_eq!(
      directory().resolve(&reference),
      Resolution::Path("updates/models/2/7/inv-9".into())
    );
  }

  #[test]
  fn test_unknown_names_are_unresolved() {
    let reference = ModelPropRef::new("Ghost", "email", 1);
    assert_eq!(
      directory().resolve(&reference),
      Resolution::Unresolved {
        unknown_model: Some("Ghost".into()),
        unknown_prop: None,
      }
    );

    let reference = ModelPropRef::new("Ghost", "phone", 1);
    assert!(matches!(
      directory().resolve(&reference),
      Resolution::Unresolved {
        unknown_model: Some(_),
        unknown_prop: Some(_),
      }
    ));
  }

  #[test]
  fn test_parse_reference() {
    let reference: ModelPropRef = "User:email:42".parse().unwrap();
    assert_eq!(reference, ModelPropRef::new("User", "email", 42));

    let reference: ModelPropRef = "User:email:abc:def".parse().unwrap();
    assert_eq!(reference.identifier, Identifier::Text("abc:def".into()));

    assert!("User:email".parse::<ModelPropRef>().is_err());
    assert!("User::1".parse::<ModelPropRef>().is_err());
  }

  #[test]
  fn test_identifier_accepts_numbers_and_strings() {
    let refs: Vec<ModelPropRef> = serde_json::from_str(
      r#"[{"name":"User","prop":"email","identifier":42},
          {"name":"User","prop":"email","identifier":"abc"}]"#,
    )
    .unwrap();
    assert_eq!(refs[0].identifier, Identifier::Number(42));
    assert_eq!(refs[1].identifier, Identifier::Text("abc".into()));
  }

  async fn mount_table(server: &MockServer, table: &str, body: serde_json::Value) {
    Mock::given(method("GET"))
      .and(path(format!("/v2{}", table)))
      .respond_with(
        ResponseTemplate::new(200)
          .set_body_json(json!({ "result": body }))
          .set_delay(Duration::from_millis(50)),
      )
      .expect(1)
      .mount(server)
      .await;
  }

  #[tokio::test]
  async fn test_concurrent_loads_fetch_each_table_once() {
    let server = MockServer::start().await;
    mount_table(&server, MODEL_NAMES_PATH, json!([{ "id": 1, "name": "User" }])).await;
    mount_table(&server, PROPERTY_NAMES_PATH, json!([{ "id": 7, "name": "email" }])).await;

    let client = ServerClient::new(server.uri(), Arc::new(StaticToken(None)));
    let ctx = ServerContext::builder(client).build();

    let (first, second) = tokio::join!(NameDirectory::load(&ctx), NameDirectory::load(&ctx));
    let reference = ModelPropRef::new("User", "email", 42);
    for directory in [first.unwrap(), second.unwrap()] {
      assert_eq!(
        directory.resolve(&reference),
        Resolution::Path("updates/models/1/7/42".into())
      );
    }

    let requests = server.received_requests().await.map_or(0, |r| r.len());
    assert_eq!(requests, 2);
  }
}
