//! GitHub REST client for listing a user's repositories.
//!
//! HTTP failures are mapped onto the cache's error taxonomy.

use reqwest::{
  header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT},
  Client, Response, StatusCode,
};
use tracing::debug;
use url::Url;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::Item;

use super::api_types::parse_repositories;
use super::RemoteSource;

const GITHUB_API_VERSION: &str = "2022-11-28";

/// Fetches pages of `GET /users/{owner}/repos`.
#[derive(Clone)]
pub struct GitHubClient {
  client: Client,
  base: Url,
  /// Only needed once something is fetched
  owner: Option<String>,
}

impl GitHubClient {
  /// Create a client against `api_url`. Without a token requests are
  /// anonymous and get GitHub's lower rate limit.
  pub fn new(api_url: &str, owner: Option<&str>, token: Option<&str>) -> Result<Self> {
    let mut headers = HeaderMap::new();

    if let Some(token) = token {
      headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", token))
          .map_err(|e| Error::Config(format!("Invalid token: {}", e)))?,
      );
    }
    headers.insert(
      ACCEPT,
      HeaderValue::from_static("application/vnd.github+json"),
    );
    headers.insert(
      "X-GitHub-Api-Version",
      HeaderValue::from_static(GITHUB_API_VERSION),
    );
    headers.insert(USER_AGENT, HeaderValue::from_static("repocat"));

    let client = Client::builder()
      .default_headers(headers)
      .build()
      .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

    // `Url::join` replaces the last segment unless the base ends in '/'
    let base = if api_url.ends_with('/') {
      api_url.to_string()
    } else {
      format!("{}/", api_url)
    };
    let base =
      Url::parse(&base).map_err(|e| Error::Config(format!("Invalid API url {}: {}", api_url, e)))?;

    Ok(Self {
      client,
      base,
      owner: owner.map(String::from),
    })
  }

  /// Create a client from configuration and the token environment variables.
  pub fn from_config(config: &Config) -> Result<Self> {
    let token = Config::github_token();
    Self::new(
      &config.github.api_url,
      config.github.owner.as_deref(),
      token.as_deref(),
    )
  }

  fn repos_url(&self) -> Result<Url> {
    let owner = self.owner.as_deref().ok_or_else(|| {
      Error::Config("No GitHub owner configured. Set github.owner or pass --owner.".into())
    })?;
    self
      .base
      .join(&format!("users/{}/repos", owner))
      .map_err(|e| Error::Config(format!("Invalid owner {}: {}", owner, e)))
  }

  /// Check response status and convert errors.
  async fn check_response(response: Response) -> Result<Response> {
    let status = response.status();
    if status == StatusCode::OK {
      return Ok(response);
    }
    let headers = response.headers().clone();
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, &headers, body))
  }
}

/// Classify a non-200 response. Server-side and unexpected statuses are
/// transient; other client errors will fail the same way on retry.
fn status_error(status: StatusCode, headers: &HeaderMap, body: String) -> Error {
  let rate_limited = status == StatusCode::TOO_MANY_REQUESTS
    || (status == StatusCode::FORBIDDEN && header_u64(headers, "x-ratelimit-remaining") == Some(0));

  if status == StatusCode::UNAUTHORIZED {
    Error::Unauthorized
  } else if rate_limited {
    let reset_at = header_u64(headers, "x-ratelimit-reset")
      .and_then(|reset| chrono::DateTime::from_timestamp(reset as i64, 0))
      .map(|dt| dt.format("%H:%M:%S").to_string())
      .unwrap_or_else(|| "unknown".to_string());
    Error::RateLimited { reset_at }
  } else if status.is_client_error() {
    Error::Rejected {
      status: status.as_u16(),
      message: body,
    }
  } else {
    Error::Network(format!("HTTP {}: {}", status, body))
  }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
  headers
    .get(name)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.parse().ok())
}

impl RemoteSource for GitHubClient {
  async fn fetch_page(&self, page: u32, page_size: u32) -> Result<Vec<Item>> {
    let url = self.repos_url()?;
    debug!(%url, page, page_size, "fetching repositories");

    let response = self
      .client
      .get(url)
      .query(&[("page", page), ("per_page", page_size)])
      .send()
      .await?;
    let response = Self::check_response(response).await?;

    let body = response.text().await?;
    Ok(parse_repositories(&body)?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_repos_url_keeps_base_path() {
    let client = GitHubClient::new("https://ghe.example.com/api/v3", Some("octocat"), None).unwrap();
    assert_eq!(
      client.repos_url().unwrap().as_str(),
      "https://ghe.example.com/api/v3/users/octocat/repos"
    );

    let client = GitHubClient::new("https://api.github.com/", Some("octocat"), Some("t0ken")).unwrap();
    assert_eq!(
      client.repos_url().unwrap().as_str(),
      "https://api.github.com/users/octocat/repos"
    );
  }

  #[test]
  fn test_invalid_api_url_is_config_error() {
    assert!(matches!(
      GitHubClient::new("not a url", Some("octocat"), None),
      Err(Error::Config(_))
    ));
  }

  #[tokio::test]
  async fn test_fetch_without_owner_fails_before_any_request() {
    let client = GitHubClient::new("https://api.github.com", None, None).unwrap();
    assert!(matches!(
      client.fetch_page(1, 10).await,
      Err(Error::Config(_))
    ));
  }

  #[test]
  fn test_status_classification() {
    let none = HeaderMap::new();
    assert_eq!(
      status_error(StatusCode::UNAUTHORIZED, &none, String::new()),
      Error::Unauthorized
    );

    let not_found = status_error(StatusCode::NOT_FOUND, &none, "Not Found".into());
    assert_eq!(
      not_found,
      Error::Rejected {
        status: 404,
        message: "Not Found".into()
      }
    );
    assert!(!not_found.is_retryable());

    // A plain 403 is a permissions problem, not a rate limit
    assert!(matches!(
      status_error(StatusCode::FORBIDDEN, &none, String::new()),
      Error::Rejected { status: 403, .. }
    ));

    let mut exhausted = HeaderMap::new();
    exhausted.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
    exhausted.insert("x-ratelimit-reset", HeaderValue::from_static("0"));
    assert_eq!(
      status_error(StatusCode::FORBIDDEN, &exhausted, String::new()),
      Error::RateLimited {
        reset_at: "00:00:00".into()
      }
    );

    let server = status_error(StatusCode::BAD_GATEWAY, &none, String::new());
    assert!(matches!(server, Error::Network(_)));
    assert!(server.is_retryable());
  }
}
