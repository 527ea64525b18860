//! Template expansion: resolved input values -> desired output `Secret`
//! (spec.md §4.6).

use crate::crd::JsonPathTemplate;
use crate::error::ControllerError;
use crate::expansion;
use crate::jsonpath;
use base64::{engine::general_purpose::STANDARD, Engine};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::core::ObjectMeta;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Evaluation first, literal substitution second: each template string is
/// checked as a whole-string `$(...)` JSONPath form and evaluated directly
/// if so; otherwise JSONPath runs per embedded `$(...)` token and any
/// leftover `$(NAME)` placeholders fall through to plain expansion.
fn render_one(template_string: &str, values: &Value) -> Result<String, ControllerError> {
  if let Some(expr) = jsonpath::is_whole_string_jsonpath(template_string) {
    return jsonpath::evaluate(&jsonpath::to_k8s_jsonpath(&format!("$({expr})")), values);
  }

  let canonical = jsonpath::to_k8s_jsonpath(template_string);
  if canonical == template_string {
    // No `$(...)` tokens at all: a plain literal (still passed through
    // expansion to preserve the public idempotence law).
    return Ok(expansion::expand(template_string, &HashMap::new()));
  }

  // Mixed string: evaluate every `{...}` span in the canonical form against
  // `values`, substituting back into the original layout.
  let mut out = String::with_capacity(canonical.len());
  let mut chars = canonical.chars().peekable();

  while let Some(c) = chars.next() {
    if c == '{' {
      let mut expr = String::new();
      let mut depth = 1usize;
      for c2 in chars.by_ref() {
        if c2 == '{' {
          depth += 1;
        } else if c2 == '}' {
          depth -= 1;
          if depth == 0 {
            break;
          }
        }
        expr.push(c2);
      }
      let rendered = jsonpath::evaluate(&format!("{{{expr}}}"), values)?;
      out.push_str(&rendered);
    } else {
      out.push(c);
    }
  }

  Ok(out)
}

/// Builds the desired `Secret`'s `type`, `data`, and merged
/// labels/annotations from a rendering template and resolved input values.
/// `data` wins over `stringData` on key collision. Metadata starts from
/// `owner`'s own labels/annotations, overlaid by the expanded template
/// metadata.
pub fn render(values: &Value, template: &JsonPathTemplate, owner: &ObjectMeta, owner_name: &str) -> Result<Secret, ControllerError> {
  let r#type = match &template.r#type {
    Some(expr) if !expr.is_empty() => {
      let rendered = render_one(expr, values)?;
      if rendered.is_empty() {
        None
      } else {
        Some(rendered)
      }
    }
    _ => None,
  };

  let mut data: BTreeMap<String, ByteString> = BTreeMap::new();

  for (key, expr) in &template.string_data {
    let rendered = render_one(expr, values)?;
    data.insert(key.clone(), ByteString(rendered.into_bytes()));
  }

  // `data` wins over `stringData` on key collision (spec.md §4.6).
  for (key, expr) in &template.data {
    let rendered = render_one(expr, values)?;
    let decoded = STANDARD.decode(rendered.as_bytes()).map_err(|e| ControllerError::InvalidTemplate {
      expression: expr.clone(),
      reason: format!("data.{key} did not expand to valid base64: {e}"),
    })?;
    data.insert(key.clone(), ByteString(decoded));
  }

  let mut labels = owner.labels.clone().unwrap_or_default();
  let mut annotations = owner.annotations.clone().unwrap_or_default();

  if let Some(meta) = &template.metadata {
    if let Some(extra_labels) = &meta.labels {
      for (k, v) in extra_labels {
        labels.insert(k.clone(), render_one(v, values)?);
      }
    }
    if let Some(extra_annotations) = &meta.annotations {
      for (k, v) in extra_annotations {
        annotations.insert(k.clone(), render_one(v, values)?);
      }
    }
  }

  labels.insert("templatedsecret.starstreak.dev/secrettemplate".to_string(), owner_name.to_string());

  Ok(Secret {
    metadata: ObjectMeta {
      labels: Some(labels),
      annotations: Some(annotations),
      ..Default::default()
    },
    type_: r#type,
    data: Some(data),
    ..Default::default()
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn meta() -> ObjectMeta {
    ObjectMeta::default()
  }

  #[test]
  fn simple_projection() {
    let values = json!({"src": {"data": {"username": "alice"}}});
    let mut template = JsonPathTemplate::default();
    template.string_data.insert("user".to_string(), "$(.src.data.username)".to_string());

    let secret = render(&values, &template, &meta(), "t1").unwrap();
    let data = secret.data.unwrap();
    assert_eq!(data.get("user").unwrap().0, b"alice".to_vec());
  }

  #[test]
  fn token_projection() {
    let values = json!({"sa": {"token": "bearer-abc"}});
    let mut template = JsonPathTemplate::default();
    template.string_data.insert("token".to_string(), "$(.sa.token)".to_string());

    let secret = render(&values, &template, &meta(), "t1").unwrap();
    let data = secret.data.unwrap();
    assert_eq!(data.get("token").unwrap().0, b"bearer-abc".to_vec());
  }

  #[test]
  fn data_wins_over_string_data_on_collision() {
    let values = json!({"src": {"data": {"a": "from-string-data"}}});
    let mut template = JsonPathTemplate::default();
    template.string_data.insert("key".to_string(), "literal".to_string());
    template.data.insert("key".to_string(), STANDARD.encode("from-data"));

    let secret = render(&values, &template, &meta(), "t1").unwrap();
    let data = secret.data.unwrap();
    assert_eq!(data.get("key").unwrap().0, b"from-data".to_vec());
  }

  #[test]
  fn invalid_base64_in_data_fails() {
    let values = json!({});
    let mut template = JsonPathTemplate::default();
    template.data.insert("key".to_string(), "not valid base64!!".to_string());

    let err = render(&values, &template, &meta(), "t1").unwrap_err();
    assert!(matches!(err, ControllerError::InvalidTemplate { .. }));
  }

  #[test]
  fn output_secret_always_carries_the_secrettemplate_label() {
    let values = json!({});
    let template = JsonPathTemplate::default();
    let secret = render(&values, &template, &meta(), "t1").unwrap();
    let labels = secret.metadata.labels.unwrap();
    assert_eq!(labels.get("templatedsecret.starstreak.dev/secrettemplate"), Some(&"t1".to_string()));
  }

  #[test]
  fn mixed_literal_and_jsonpath_string() {
    let values = json!({"src": {"data": {"username": "alice"}}});
    let mut template = JsonPathTemplate::default();
    template.string_data.insert("greeting".to_string(), "hello, $(.src.data.username)!".to_string());

    let secret = render(&values, &template, &meta(), "t1").unwrap();
    let data = secret.data.unwrap();
    assert_eq!(data.get("greeting").unwrap().0, b"hello, alice!".to_vec());
  }
}
