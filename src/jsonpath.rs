//! Surface `$(expr)` syntax <-> canonical K8s JSONPath `{expr}`, and
//! evaluation of the canonical form against a decoded value tree.
//!
//! The value tree is `serde_json::Value` directly — it already is the
//! `Null | Bool | Number | String | Array | Object` shape spec.md's design
//! notes call for, and it's what `jsonpath_rust` evaluates against, so there
//! is no separate hand-rolled tree type here.

use jsonpath_rust::JsonPath;
use serde_json::Value;
use std::str::FromStr;

use crate::error::ControllerError;

/// Converts surface syntax (`$(expr)` tokens interleaved with literal text)
/// into canonical K8s JSONPath (`{expr}`). Scans left to right; `$(` opens a
/// token closed by the matching `)`, tracked with a paren-depth counter that
/// ignores parens inside single-quoted segments (so `$(.foo[?(@.x=='a)')])`
/// closes correctly). Orphan `$(`, stray `)`, and a bare `$` pass through
/// unchanged.
pub fn to_k8s_jsonpath(s: &str) -> String {
  let chars: Vec<char> = s.chars().collect();
  let mut out = String::with_capacity(s.len());
  let mut i = 0;

  while i < chars.len() {
    if chars[i] == '$' && chars.get(i + 1) == Some(&'(') {
      match matching_close(&chars, i + 1) {
        Some(close) => {
          out.push('{');
          out.push_str(&to_k8s_jsonpath(&chars[i + 2..close].iter().collect::<String>()));
          out.push('}');
          i = close + 1;
        }
        None => {
          out.push('$');
          i += 1;
        }
      }
    } else {
      out.push(chars[i]);
      i += 1;
    }
  }

  out
}

/// `open` indexes the `(` of a `$(`. Returns the index of its matching `)`,
/// or `None` if unbalanced. Parens inside a `'...'` segment don't count.
fn matching_close(chars: &[char], open: usize) -> Option<usize> {
  let mut depth = 0usize;
  let mut in_quote = false;
  let mut i = open;

  while i < chars.len() {
    match chars[i] {
      '\'' => in_quote = !in_quote,
      '(' if !in_quote => depth += 1,
      ')' if !in_quote => {
        depth -= 1;
        if depth == 0 {
          return Some(i);
        }
      }
      _ => {}
    }
    i += 1;
  }

  None
}

/// Evaluates a canonical K8s JSONPath expression (e.g. `{.data.foo}`)
/// against `values`, rendering matches the way standard K8s JSONPath output
/// does: a single scalar renders as its bare string form, multiple matches
/// are whitespace-joined.
pub fn evaluate(expression: &str, values: &Value) -> Result<String, ControllerError> {
  let inner = expression.strip_prefix('{').and_then(|s| s.strip_suffix('}')).unwrap_or(expression);

  // jsonpath_rust expects a leading `$`.
  let query = format!("${inner}");

  let path = JsonPath::from_str(&query).map_err(|e| ControllerError::InvalidTemplate {
    expression: expression.to_string(),
    reason: format!("invalid jsonpath: {e}"),
  })?;

  let found = path.find(values);

  let matches: Vec<&Value> = match &found {
    Value::Array(items) => items.iter().collect(),
    Value::Null => Vec::new(),
    other => vec![other],
  };

  if matches.is_empty() {
    return Err(ControllerError::InvalidTemplate {
      expression: expression.to_string(),
      reason: "no match".to_string(),
    });
  }

  Ok(
    matches
      .iter()
      .map(|v| render_scalar(v))
      .collect::<Vec<_>>()
      .join(" "),
  )
}

fn render_scalar(v: &Value) -> String {
  match v {
    Value::String(s) => s.clone(),
    Value::Null => String::new(),
    other => other.to_string(),
  }
}

/// True when the whole string is a single `$(...)` token with nothing else
/// around it — the case the renderer evaluates directly rather than
/// round-tripping through expansion.
pub fn is_whole_string_jsonpath(s: &str) -> Option<&str> {
  let s = s.trim();
  if s.starts_with("$(") && s.ends_with(')') && matching_close(&s.chars().collect::<Vec<_>>(), 1) == Some(s.chars().count() - 1) {
    Some(&s[2..s.len() - 1])
  } else {
    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn passthrough_static_value() {
    assert_eq!(to_k8s_jsonpath("static-value"), "static-value");
  }

  #[test]
  fn translates_simple_path() {
    assert_eq!(to_k8s_jsonpath("$(.value)"), "{.value}");
  }

  #[test]
  fn translates_with_surrounding_text() {
    assert_eq!(to_k8s_jsonpath("prefix-$(.value)-suffix"), "prefix-{.value}-suffix");
  }

  #[test]
  fn translates_filter_expression_with_quoted_parens() {
    assert_eq!(
      to_k8s_jsonpath("$(.spec.ports[?(@.protocol=='TCP')])"),
      "{.spec.ports[?(@.protocol=='TCP')]}"
    );
  }

  #[test]
  fn bare_dollar_passes_through() {
    assert_eq!(to_k8s_jsonpath("$foo"), "$foo");
  }

  #[test]
  fn orphan_open_paren_passes_through() {
    assert_eq!(to_k8s_jsonpath("foo$("), "foo$(");
  }

  #[test]
  fn orphan_close_paren_passes_through() {
    assert_eq!(to_k8s_jsonpath("foo)"), "foo)");
  }

  #[test]
  fn nested_tokens() {
    assert_eq!(to_k8s_jsonpath("$($(foo))"), "{{foo}}");
  }

  #[test]
  fn two_tokens_in_one_string() {
    assert_eq!(
      to_k8s_jsonpath("$(.data.value)-middle-$(.data.value2)"),
      "{.data.value}-middle-{.data.value2}"
    );
  }

  #[test]
  fn long_chained_filter_path() {
    assert_eq!(
      to_k8s_jsonpath("$(.pod.spec.containers[?(@.name=='first-filter')].env[?(@.name=='second-filter')].valueFrom.secretKeyRef.name)"),
      "{.pod.spec.containers[?(@.name=='first-filter')].env[?(@.name=='second-filter')].valueFrom.secretKeyRef.name}"
    );
  }

  #[test]
  fn trailing_literal_close_paren() {
    assert_eq!(to_k8s_jsonpath("$(.data.foo)-)"), "{.data.foo}-)");
  }

  #[test]
  fn trailing_call_like_suffix() {
    assert_eq!(to_k8s_jsonpath("$(.data.foo?())()-)"), "{.data.foo?()}()-)");
  }

  #[test]
  fn already_canonical_is_unchanged() {
    assert_eq!(to_k8s_jsonpath("{.data.foo}"), "{.data.foo}");
  }

  #[test]
  fn idempotent() {
    let once = to_k8s_jsonpath("$(.spec.ports[?(@.protocol=='TCP')])");
    let twice = to_k8s_jsonpath(&once);
    assert_eq!(once, twice);
  }

  #[test]
  fn evaluates_scalar() {
    let values = json!({"key": "value"});
    assert_eq!(evaluate("{.key}", &values).unwrap(), "value");
  }

  #[test]
  fn evaluate_fails_on_no_match() {
    let values = json!({"key": "value"});
    assert!(evaluate("{.missing}", &values).is_err());
  }

  #[test]
  fn whole_string_jsonpath_detection() {
    assert_eq!(is_whole_string_jsonpath("$(.src.data.username)"), Some(".src.data.username"));
    assert_eq!(is_whole_string_jsonpath("prefix $(.x) suffix"), None);
  }
}
