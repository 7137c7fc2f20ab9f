//! Composite cache keys.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::server::SearchParams;

/// Operation tag of every key produced by GET queries.
pub const GET_TAG: &str = "get";

/// Identity of a cached query: caller namespace, operation tag, path, search
/// params and the signed-in user. Including the user means switching
/// accounts never reuses another user's data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct QueryKey {
  pub base: Vec<String>,
  pub tag: &'static str,
  pub path: String,
  pub search_params: Option<SearchParams>,
  pub user_uid: Option<String>,
}

impl QueryKey {
  pub fn get(
    base: &[String],
    path: impl Into<String>,
    search_params: Option<SearchParams>,
    user_uid: Option<String>,
  ) -> Self {
    Self {
      base: base.to_vec(),
      tag: GET_TAG,
      path: path.into(),
      search_params,
      user_uid,
    }
  }

  /// Stable, fixed-length storage key.
  pub fn cache_hash(&self) -> String {
    // Serializing the ordered tuple keeps element boundaries unambiguous
    let input = serde_json::json!([
      self.base,
      self.tag,
      self.path,
      self.search_params,
      self.user_uid,
    ])
    .to_string();

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }

  pub fn description(&self) -> String {
    let user = self.user_uid.as_deref().unwrap_or("anonymous");
    match &self.search_params {
      Some(params) if !params.is_empty() => {
        let params: Vec<String> = params
          .iter()
          .map(|(name, value)| format!("{}={}", name, value.as_deref().unwrap_or("")))
          .collect();
        format!("{} {}?{} ({})", self.tag, self.path, params.join("&"), user)
      }
      _ => format!("{} {} ({})", self.tag, self.path, user),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn base() -> Vec<String> {
    vec!["apphive".to_string()]
  }

  #[test]
  fn test_user_is_part_of_the_key() {
    let alice = QueryKey::get(&base(), "/apps", None, Some("alice".into()));
    let bob = QueryKey::get(&base(), "/apps", None, Some("bob".into()));
    let anonymous = QueryKey::get(&base(), "/apps", None, None);

    assert_ne!(alice.cache_hash(), bob.cache_hash());
    assert_ne!(alice.cache_hash(), anonymous.cache_hash());
  }

  #[test]
  fn test_search_params_are_part_of_the_key() {
    let page1 = QueryKey::get(
      &base(),
      "/apps",
      Some(vec![("page".into(), Some("1".into()))]),
      None,
    );
    let page2 = QueryKey::get(
      &base(),
      "/apps",
      Some(vec![("page".into(), Some("2".into()))]),
      None,
    );
    assert_ne!(page1.cache_hash(), page2.cache_hash());
  }

  #[test]
  fn test_element_boundaries_are_not_ambiguous() {
    let a = QueryKey::get(&["a".to_string(), "b".to_string()], "/x", None, None);
    let b = QueryKey::get(&["a,b".to_string()], "/x", None, None);
    assert_ne!(a.cache_hash(), b.cache_hash());
  }

  #[test]
  fn test_hash_is_stable() {
    let key = QueryKey::get(&base(), "/apps", None, Some("alice".into()));
    assert_eq!(key.cache_hash(), key.clone().cache_hash());
    assert_eq!(key.cache_hash().len(), 64);
  }

  #[test]
  fn test_description() {
    let key = QueryKey::get(
      &base(),
      "/apps",
      Some(vec![("page".into(), Some("1".into())), ("q".into(), None)]),
      Some("alice".into()),
    );
    assert_eq!(key.description(), "get /apps?page=1&q= (alice)");
  }
}
