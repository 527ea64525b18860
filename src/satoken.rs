//! On-demand bearer token issuance for a `ServiceAccount` via the token
//! subresource, memoized with expiry-driven refresh (spec.md §4.3).

use crate::prelude::*;
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec, TokenRequestStatus};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Clock skew subtracted from a cached token's expiry before it's
/// considered stale, so callers never hand out a token that's about to
/// expire mid-flight.
const SKEW: chrono::Duration = chrono::Duration::seconds(60);

/// Default requested lifetime for a freshly issued token.
const DEFAULT_EXPIRATION_SECONDS: i64 = 600;

#[derive(Debug, Clone)]
struct CachedToken {
  token: String,
  expires_at: DateTime<Utc>,
}

/// Keyed by `{namespace, name}`. A `tokio::sync::Mutex` per entry, held
/// across the issuance `.await`, serializes access so two concurrent
/// callers for the same ServiceAccount coalesce onto a single in-flight
/// `TokenRequest` instead of issuing twice.
#[derive(Debug, Default)]
pub struct TokenManager {
  cache: Mutex<HashMap<(String, String), CachedToken>>,
}

impl TokenManager {
  pub fn new() -> Self {
    TokenManager::default()
  }

  /// Returns a bearer token for `namespace/name`, issuing a new one if the
  /// cached entry is absent or within `SKEW` of expiring. Issuance errors
  /// propagate without caching a negative result.
  pub async fn get_token(&self, client: &Client, namespace: &str, name: &str) -> Result<String, ControllerError> {
    let key = (namespace.to_string(), name.to_string());
    let mut cache = self.cache.lock().await;

    if let Some(cached) = cache.get(&key) {
      if Utc::now() + SKEW < cached.expires_at {
        return Ok(cached.token.clone());
      }
    }

    let issued = request_token(client, namespace, name).await?;
    cache.insert(key, issued.clone());
    Ok(issued.token)
  }
}

async fn request_token(client: &Client, namespace: &str, name: &str) -> Result<CachedToken, ControllerError> {
  let api: Api<ServiceAccount> = Api::namespaced(client.clone(), namespace);

  let request = TokenRequest {
    spec: TokenRequestSpec {
      expiration_seconds: Some(DEFAULT_EXPIRATION_SECONDS),
      ..Default::default()
    },
    status: None,
    ..Default::default()
  };

  let body = serde_json::to_vec(&request).map_err(|e| ControllerError::TokenRequestFailed {
    namespace: namespace.to_string(),
    name: name.to_string(),
    source: kube::Error::SerdeError(e),
  })?;

  let response: TokenRequest = api
    .create_subresource("token", name, &PostParams::default(), body)
    .await
    .map_err(|source| ControllerError::TokenRequestFailed {
      namespace: namespace.to_string(),
      name: name.to_string(),
      source,
    })?;

  let TokenRequestStatus { token, expiration_timestamp, .. } = response.status.ok_or_else(|| {
    ControllerError::InternalError(format!(
      "token subresource for serviceaccount {namespace}/{name} returned no status"
    ))
  })?;

  Ok(CachedToken {
    token,
    expires_at: expiration_timestamp.0,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cached_token_within_skew_counts_as_fresh() {
    let cached = CachedToken {
      token: "abc".into(),
      expires_at: Utc::now() + chrono::Duration::seconds(120),
    };
    assert!(Utc::now() + SKEW < cached.expires_at);
  }

  #[test]
  fn cached_token_within_skew_of_expiry_counts_as_stale() {
    let cached = CachedToken {
      token: "abc".into(),
      expires_at: Utc::now() + chrono::Duration::seconds(30),
    };
    assert!(!(Utc::now() + SKEW < cached.expires_at));
  }
}
