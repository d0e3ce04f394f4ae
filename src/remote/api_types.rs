//! Serde-deserializable types matching GitHub API responses.
//!
//! Kept apart from `Item` so the wire shape can drift without touching the
//! cache schema.

use serde::Deserialize;

use crate::model::{Item, Visibility};

#[derive(Debug, Deserialize)]
pub struct ApiOwner {
  pub id: i64,
  pub login: String,
  #[serde(default)]
  pub avatar_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiVisibility {
  Public,
  Private,
  Internal,
}

#[derive(Debug, Deserialize)]
pub struct ApiRepository {
  pub id: i64,
  pub name: String,
  pub full_name: String,
  pub description: Option<String>,
  pub owner: ApiOwner,
  #[serde(default)]
  pub private: bool,
  // Older API versions omit it
  pub visibility: Option<ApiVisibility>,
  pub html_url: String,
}

impl From<ApiRepository> for Item {
  fn from(repo: ApiRepository) -> Self {
    let visibility = match repo.visibility {
      Some(ApiVisibility::Public) => Visibility::Public,
      Some(ApiVisibility::Private) => Visibility::Private,
      Some(ApiVisibility::Internal) => Visibility::Internal,
      None if repo.private => Visibility::Private,
      None => Visibility::Public,
    };

    Item {
      id: repo.id,
      name: repo.name,
      full_name: repo.full_name,
      description: repo.description,
      owner_id: repo.owner.id,
      owner_login: repo.owner.login,
      owner_avatar_url: repo.owner.avatar_url,
      is_private: repo.private,
      visibility,
      url: repo.html_url,
    }
  }
}

/// Decode a `GET /users/{owner}/repos` body.
pub fn parse_repositories(body: &str) -> serde_json::Result<Vec<Item>> {
  let repos: Vec<ApiRepository> = serde_json::from_str(body)?;
  Ok(repos.into_iter().map(Item::from).collect())
}
