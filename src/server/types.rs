//! Payload types returned by the Apphive server.

use serde::{Deserialize, Serialize};

/// Entry of the `/models/names` and `/models/propertyNames` lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedId {
  pub id: i64,
  pub name: String,
}
