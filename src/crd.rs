use crate::prelude::*;

/// `SecretTemplate.templatedsecret.starstreak.dev/v1alpha1` — a declarative
/// record describing how to derive an output `Secret` from named input
/// resources via JSONPath expressions.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
  group = "templatedsecret.starstreak.dev",
  version = "v1alpha1",
  kind = "SecretTemplate",
  shortname = "st",
  namespaced,
  status = "SecretTemplateStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct SecretTemplateSpec {
  /// Ordered; `name` is a template-local identifier, unique within the
  /// template. Order matters: later expressions may reference earlier
  /// inputs only indirectly, through the final values map.
  #[serde(default)]
  pub input_resources: Vec<InputResource>,

  pub json_path_template: JsonPathTemplate,

  /// When set, input resolution reads happen under this ServiceAccount's
  /// capabilities rather than the controller's own.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub service_account_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct InputResource {
  pub name: String,
  pub api_version: String,
  pub kind: String,
  pub resource_name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JsonPathTemplate {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub r#type: Option<String>,

  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub string_data: BTreeMap<String, String>,

  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub data: BTreeMap<String, String>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub metadata: Option<TemplateMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct TemplateMetadata {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub labels: Option<BTreeMap<String, String>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub annotations: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretTemplateStatus {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub observed_generation: Option<i64>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub observed_secret_resource_version: Option<String>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub friendly_description: Option<String>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub secret: Option<SecretRef>,

  #[serde(default)]
  pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct SecretRef {
  pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct Condition {
  pub r#type: ConditionType,
  pub status: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub reason: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_transition_time: Option<String>,
}

/// Exactly one of these is `status: true` at any time (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ConditionType {
  Reconciling,
  ReconcileFailed,
  ReconcileSucceeded,
  Invalid,
}

impl SecretTemplateStatus {
  /// Set `r#type` true and every other known condition type false,
  /// preserving `last_transition_time` for types whose status doesn't
  /// change (the Open Question in spec.md §9 — see DESIGN.md).
  pub fn set_condition(&mut self, active: ConditionType, reason: Option<String>, message: Option<String>, now: &str) {
    let all = [
      ConditionType::Reconciling,
      ConditionType::ReconcileFailed,
      ConditionType::ReconcileSucceeded,
      ConditionType::Invalid,
    ];

    for ty in all {
      let want_status = ty == active;
      let existing = self.conditions.iter().find(|c| c.r#type == ty);
      let transitioned = existing.map(|c| c.status != want_status).unwrap_or(true);
      let last_transition_time = if transitioned {
        Some(now.to_string())
      } else {
        existing.and_then(|c| c.last_transition_time.clone())
      };

      let (reason, message) = if ty == active {
        (reason.clone(), message.clone())
      } else {
        (None, None)
      };

      let updated = Condition {
        r#type: ty,
        status: want_status,
        reason,
        message,
        last_transition_time,
      };

      match self.conditions.iter_mut().find(|c| c.r#type == ty) {
        Some(slot) => *slot = updated,
        None => self.conditions.push(updated),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn set_condition_preserves_transition_time_when_unchanged() {
    let mut status = SecretTemplateStatus::default();
    status.set_condition(ConditionType::ReconcileSucceeded, None, None, "t0");
    let succeeded = status
      .conditions
      .iter()
      .find(|c| c.r#type == ConditionType::ReconcileSucceeded)
      .unwrap();
    assert_eq!(succeeded.last_transition_time.as_deref(), Some("t0"));

    // Reconciling a second time with the same winning condition must not
    // bump the transition time.
    status.set_condition(ConditionType::ReconcileSucceeded, None, None, "t1");
    let succeeded = status
      .conditions
      .iter()
      .find(|c| c.r#type == ConditionType::ReconcileSucceeded)
      .unwrap();
    assert_eq!(succeeded.last_transition_time.as_deref(), Some("t0"));
  }

  #[test]
  fn set_condition_bumps_transition_time_on_flip() {
    let mut status = SecretTemplateStatus::default();
    status.set_condition(ConditionType::ReconcileSucceeded, None, None, "t0");
    status.set_condition(
      ConditionType::ReconcileFailed,
      Some("InputNotFound".into()),
      Some("boom".into()),
      "t1",
    );

    let succeeded = status
      .conditions
      .iter()
      .find(|c| c.r#type == ConditionType::ReconcileSucceeded)
      .unwrap();
    assert!(!succeeded.status);
    assert_eq!(succeeded.last_transition_time.as_deref(), Some("t1"));

    let failed = status
      .conditions
      .iter()
      .find(|c| c.r#type == ConditionType::ReconcileFailed)
      .unwrap();
    assert!(failed.status);
    assert_eq!(failed.reason.as_deref(), Some("InputNotFound"));
    assert_eq!(failed.last_transition_time.as_deref(), Some("t1"));
  }

  #[test]
  fn exactly_one_condition_is_true() {
    let mut status = SecretTemplateStatus::default();
    status.set_condition(ConditionType::Invalid, None, None, "t0");
    assert_eq!(status.conditions.iter().filter(|c| c.status).count(), 1);
  }
}
