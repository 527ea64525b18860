//! Cross-namespace input authorization (spec.md §4.8).

use crate::error::ControllerError;

pub const ALLOW_NAMESPACES_ANNOTATION: &str = "templatedsecret.starstreak.dev/allow-namespaces";

#[derive(Debug, Clone)]
pub struct CrossNamespaceConfig {
  pub enabled: bool,
  pub warn_on_unwatched: bool,
  /// Empty set means cluster-wide (every namespace is watched).
  pub watched_namespaces: std::collections::HashSet<String>,
}

impl Default for CrossNamespaceConfig {
  fn default() -> Self {
    CrossNamespaceConfig {
      enabled: false,
      warn_on_unwatched: true,
      watched_namespaces: Default::default(),
    }
  }
}

impl CrossNamespaceConfig {
  pub fn is_watched(&self, namespace: &str) -> bool {
    self.watched_namespaces.is_empty() || self.watched_namespaces.contains(namespace)
  }
}

/// `namespaceAuthorized(value, consumerNs)`: empty value is never
/// authorized; tokens are comma-separated and trimmed; `*` authorizes any
/// namespace; otherwise an exact match is required.
pub fn namespace_authorized(value: &str, consumer_ns: &str) -> bool {
  if value.trim().is_empty() {
    return false;
  }

  value.split(',').map(str::trim).any(|token| token == "*" || token == consumer_ns)
}

/// Checks whether `input_name`'s reference into `source_namespace` is
/// permitted for a template living in `consumer_ns`, given the source
/// object's `allow-namespaces` annotation value (`None` if absent).
pub fn check(
  config: &CrossNamespaceConfig,
  input_name: &str,
  consumer_ns: &str,
  source_namespace: &str,
  source_allow_namespaces: Option<&str>,
) -> Result<(), ControllerError> {
  if !config.enabled {
    return Err(ControllerError::CrossNamespaceDisabled {
      name: input_name.to_string(),
      namespace: source_namespace.to_string(),
    });
  }

  let authorized = source_allow_namespaces.map(|v| namespace_authorized(v, consumer_ns)).unwrap_or(false);

  if !authorized {
    return Err(ControllerError::CrossNamespaceUnauthorized {
      name: input_name.to_string(),
      source_namespace: source_namespace.to_string(),
      consumer_namespace: consumer_ns.to_string(),
    });
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_value_is_unauthorized() {
    assert!(!namespace_authorized("", "a"));
  }

  #[test]
  fn exact_match_is_authorized() {
    assert!(namespace_authorized("team-a", "team-a"));
  }

  #[test]
  fn non_member_is_unauthorized() {
    assert!(!namespace_authorized("team-a,team-b", "team-c"));
  }

  #[test]
  fn tokens_are_trimmed() {
    assert!(namespace_authorized(" team-a , team-b ", "team-b"));
  }

  #[test]
  fn wildcard_authorizes_anything() {
    assert!(namespace_authorized("*", "x"));
  }

  #[test]
  fn wildcard_among_other_tokens() {
    assert!(namespace_authorized("team-a,*", "other"));
  }

  #[test]
  fn monotone_under_adding_tokens() {
    // If v authorizes n, v + ",<anything>" must still authorize n.
    let cases: [(&str, &str); 3] = [("team-a", "team-a"), ("*", "anywhere"), ("a,b", "b")];
    for (v, ns) in cases {
      assert!(namespace_authorized(v, ns));
      let extended = format!("{v},extra-token");
      assert!(namespace_authorized(&extended, ns));
    }
  }

  #[test]
  fn disabled_flag_rejects_regardless_of_annotation() {
    let config = CrossNamespaceConfig {
      enabled: false,
      ..Default::default()
    };
    let err = check(&config, "src", "app", "other", Some("app,*")).unwrap_err();
    assert!(matches!(err, ControllerError::CrossNamespaceDisabled { .. }));
  }

  #[test]
  fn enabled_without_annotation_is_unauthorized() {
    let config = CrossNamespaceConfig {
      enabled: true,
      ..Default::default()
    };
    let err = check(&config, "src", "app", "other", None).unwrap_err();
    assert!(matches!(err, ControllerError::CrossNamespaceUnauthorized { .. }));
  }

  #[test]
  fn enabled_with_authorizing_annotation_succeeds() {
    let config = CrossNamespaceConfig {
      enabled: true,
      ..Default::default()
    };
    check(&config, "src", "app", "other", Some("app,*")).unwrap();
  }

  #[test]
  fn watched_namespaces_empty_means_cluster_wide() {
    let config = CrossNamespaceConfig::default();
    assert!(config.is_watched("anything"));
  }
}
