//! Input resolution pipeline (spec.md §4.5): materializes each declared
//! input resource into the values map consumed by the renderer, updating
//! the tracker as a side effect regardless of outcome.

use crate::crd::{InputResource, SecretTemplate};
use crate::crossns::{self, CrossNamespaceConfig, ALLOW_NAMESPACES_ANNOTATION};
use crate::error::ControllerError;
use crate::satoken::TokenManager;
use crate::tracker::{ObjectKey, Tracker};
use base64::{engine::general_purpose::STANDARD, Engine};
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use kube::api::DynamicObject;
use kube::core::{ApiResource, GroupVersionKind};
use kube::discovery;
use kube::{Api, Client, ResourceExt};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Resolves every `input_resources` entry in declaration order into a
/// `localName -> value` map. Always updates the tracker with the full
/// attempted tracked set at the end, even on failure, so the template is
/// re-awakened on a change to any referenced input. Returns the partial
/// values map alongside the first error encountered, if any.
pub async fn resolve_inputs(
  client: &Client,
  config: &kube::Config,
  token_manager: &TokenManager,
  tracker: &Tracker,
  cross_ns: &CrossNamespaceConfig,
  template: &SecretTemplate,
) -> (Value, Result<(), ControllerError>) {
  let template_ns = template.namespace().unwrap_or_default();
  let template_key = ObjectKey::new("templatedsecret.starstreak.dev", "SecretTemplate", &template_ns, template.name_any());

  let mut values = Map::new();
  let mut pending: HashSet<ObjectKey> = HashSet::new();
  let mut first_error: Option<ControllerError> = None;

  for input in &template.spec.input_resources {
    let source_ns = input.namespace.clone().unwrap_or_else(|| template_ns.clone());
    pending.insert(ObjectKey::new(group_of(input), &input.kind, &source_ns, &input.resource_name));

    if first_error.is_some() {
      // Still record the tracked key above, but skip further fetches —
      // the reconcile already failed; values past the failure point are
      // unreachable at render time anyway.
      continue;
    }

    let outcome = resolve_one(
      client,
      config,
      token_manager,
      cross_ns,
      &template_ns,
      &source_ns,
      template.spec.service_account_name.as_deref(),
      input,
    )
    .await;

    match outcome {
      Ok(value) => {
        values.insert(input.name.clone(), value);
      }
      Err(e) => first_error = Some(e),
    }
  }

  tracker.track(template_key, pending);

  (Value::Object(values), first_error.map(Err).unwrap_or(Ok(())))
}

fn group_of(input: &InputResource) -> String {
  input.api_version.split('/').next().unwrap_or("").to_string()
}

#[allow(clippy::too_many_arguments)]
async fn resolve_one(
  client: &Client,
  config: &kube::Config,
  token_manager: &TokenManager,
  cross_ns: &CrossNamespaceConfig,
  template_ns: &str,
  source_ns: &str,
  service_account_name: Option<&str>,
  input: &InputResource,
) -> Result<Value, ControllerError> {
  if source_ns != template_ns {
    let annotation = fetch_allow_namespaces_annotation(client, source_ns, input).await?;
    crossns::check(cross_ns, &input.name, template_ns, source_ns, annotation.as_deref())?;

    if !cross_ns.is_watched(source_ns) && cross_ns.warn_on_unwatched {
      tracing::warn!(
        input = %input.name,
        namespace = %source_ns,
        "cross-namespace input references a namespace outside the watch set; change events may not arrive"
      );
    }
  }

  if input.kind == "ServiceAccount" {
    let token = token_manager.get_token(client, source_ns, &input.resource_name).await?;
    let mut obj = Map::new();
    obj.insert("token".to_string(), Value::String(token));
    return Ok(Value::Object(obj));
  }

  let scoped = client_for(client, config, token_manager, template_ns, service_account_name).await?;

  if input.kind == "Secret" {
    let api: Api<Secret> = Api::namespaced(scoped, source_ns);
    let secret = api.get(&input.resource_name).await.map_err(|e| map_get_error(&input.name, e))?;
    return Ok(secret_to_value(&secret));
  }

  let gvk = GroupVersionKind::try_from(ApiVersionKind {
    api_version: input.api_version.clone(),
    kind: input.kind.clone(),
  })
  .map_err(|e| ControllerError::InputMalformed {
    name: input.name.clone(),
    reason: format!("bad apiVersion/kind: {e}"),
  })?;

  let (ar, _caps) = discovery::pinned_kind(&scoped, &gvk).await.map_err(|e| ControllerError::InputResolutionFailed {
    name: input.name.clone(),
    reason: format!("discovery failed: {e}"),
  })?;

  let api: Api<DynamicObject> = Api::namespaced_with(scoped, source_ns, &ar);
  let obj = api.get(&input.resource_name).await.map_err(|e| map_get_error(&input.name, e))?;

  serde_json::to_value(&obj.data).map_err(|e| ControllerError::InputMalformed {
    name: input.name.clone(),
    reason: format!("could not decode object: {e}"),
  })
}

/// If the template declares `serviceAccountName`, builds a client that
/// authenticates as that ServiceAccount's own bearer token rather than the
/// controller's own credentials, so reads are capability-scoped to what
/// that ServiceAccount can see. Without one, reuses the controller's
/// client unchanged.
async fn client_for(
  client: &Client,
  config: &kube::Config,
  token_manager: &TokenManager,
  template_ns: &str,
  service_account_name: Option<&str>,
) -> Result<Client, ControllerError> {
  let Some(sa_name) = service_account_name else {
    return Ok(client.clone());
  };

  let token = token_manager.get_token(client, template_ns, sa_name).await?;
  let mut scoped_config = config.clone();
  scoped_config.auth_info.token = Some(token.into());
  scoped_config.auth_info.token_file = None;
  scoped_config.auth_info.username = None;
  scoped_config.auth_info.password = None;
  scoped_config.auth_info.exec = None;

  Client::try_from(scoped_config).map_err(|e| ControllerError::InternalError(format!("failed to build scoped client for {sa_name}: {e}")))
}

struct ApiVersionKind {
  api_version: String,
  kind: String,
}

impl TryFrom<ApiVersionKind> for GroupVersionKind {
  type Error = String;

  fn try_from(value: ApiVersionKind) -> Result<Self, Self::Error> {
    match value.api_version.split_once('/') {
      Some((group, version)) => Ok(GroupVersionKind::gvk(group, version, &value.kind)),
      None if !value.api_version.is_empty() => Ok(GroupVersionKind::gvk("", &value.api_version, &value.kind)),
      None => Err("empty apiVersion".to_string()),
    }
  }
}

/// Reads the `allow-namespaces` annotation off the real source object,
/// whatever kind it is (spec.md §4.5/§4.8 scope the cross-namespace policy
/// to any ref kind, not just `Secret`). `Secret` and `ServiceAccount` go
/// through their statically-typed APIs; anything else falls back to the
/// same dynamic-discovery path `resolve_one` uses for generic kinds.
async fn fetch_allow_namespaces_annotation(client: &Client, source_ns: &str, input: &InputResource) -> Result<Option<String>, ControllerError> {
  if input.kind == "Secret" {
    let api: Api<Secret> = Api::namespaced(client.clone(), source_ns);
    return match api.get_opt(&input.resource_name).await {
      Ok(Some(secret)) => Ok(secret.annotations().get(ALLOW_NAMESPACES_ANNOTATION).cloned()),
      Ok(None) => Ok(None),
      Err(e) => Err(map_get_error(&input.name, e)),
    };
  }

  if input.kind == "ServiceAccount" {
    let api: Api<ServiceAccount> = Api::namespaced(client.clone(), source_ns);
    return match api.get_opt(&input.resource_name).await {
      Ok(Some(sa)) => Ok(sa.annotations().get(ALLOW_NAMESPACES_ANNOTATION).cloned()),
      Ok(None) => Ok(None),
      Err(e) => Err(map_get_error(&input.name, e)),
    };
  }

  let gvk = GroupVersionKind::try_from(ApiVersionKind {
    api_version: input.api_version.clone(),
    kind: input.kind.clone(),
  })
  .map_err(|e| ControllerError::InputMalformed {
    name: input.name.clone(),
    reason: format!("bad apiVersion/kind: {e}"),
  })?;

  let (ar, _caps) = discovery::pinned_kind(client, &gvk).await.map_err(|e| ControllerError::InputResolutionFailed {
    name: input.name.clone(),
    reason: format!("discovery failed: {e}"),
  })?;

  let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), source_ns, &ar);
  match api.get_opt(&input.resource_name).await {
    Ok(Some(obj)) => Ok(obj.annotations().get(ALLOW_NAMESPACES_ANNOTATION).cloned()),
    Ok(None) => Ok(None),
    Err(e) => Err(map_get_error(&input.name, e)),
  }
}

fn map_get_error(name: &str, e: kube::Error) -> ControllerError {
  match &e {
    kube::Error::Api(resp) if resp.code == 404 => ControllerError::InputNotFound {
      name: name.to_string(),
      reason: resp.message.clone(),
    },
    kube::Error::Api(resp) if resp.code == 403 => ControllerError::InputForbidden {
      name: name.to_string(),
      reason: resp.message.clone(),
    },
    _ => ControllerError::InputResolutionFailed {
      name: name.to_string(),
      reason: e.to_string(),
    },
  }
}

/// Decodes a Secret's base64 `data` map into a value tree with UTF-8
/// (lossy) string leaves, and exposes `stringData` unchanged if present.
fn secret_to_value(secret: &Secret) -> Value {
  let mut data_map = Map::new();
  if let Some(data) = &secret.data {
    for (k, v) in data {
      let decoded = STANDARD.decode(&v.0).unwrap_or_else(|_| v.0.clone());
      data_map.insert(k.clone(), Value::String(String::from_utf8_lossy(&decoded).into_owned()));
    }
  }

  let mut root = Map::new();
  root.insert("data".to_string(), Value::Object(data_map));

  if let Some(string_data) = &secret.string_data {
    let mut sd = Map::new();
    for (k, v) in string_data {
      sd.insert(k.clone(), Value::String(v.clone()));
    }
    root.insert("stringData".to_string(), Value::Object(sd));
  }

  if let Some(ty) = &secret.type_ {
    root.insert("type".to_string(), Value::String(ty.clone()));
  }

  Value::Object(root)
}

#[cfg(test)]
mod tests {
  use super::*;
  use k8s_openapi::ByteString;
  use std::collections::BTreeMap;

  #[test]
  fn secret_to_value_decodes_base64_data() {
    let mut data = BTreeMap::new();
    data.insert("username".to_string(), ByteString(b"alice".to_vec()));
    let secret = Secret {
      data: Some(data),
      ..Default::default()
    };

    let value = secret_to_value(&secret);
    assert_eq!(value["data"]["username"], Value::String("alice".to_string()));
  }

  #[test]
  fn gvk_parse_splits_group_and_version() {
    let gvk = GroupVersionKind::try_from(ApiVersionKind {
      api_version: "apps/v1".to_string(),
      kind: "Deployment".to_string(),
    })
    .unwrap();
    assert_eq!(gvk.group, "apps");
    assert_eq!(gvk.version, "v1");
    assert_eq!(gvk.kind, "Deployment");
  }

  #[test]
  fn gvk_parse_core_group_has_no_slash() {
    let gvk = GroupVersionKind::try_from(ApiVersionKind {
      api_version: "v1".to_string(),
      kind: "ConfigMap".to_string(),
    })
    .unwrap();
    assert_eq!(gvk.group, "");
    assert_eq!(gvk.version, "v1");
  }
}
