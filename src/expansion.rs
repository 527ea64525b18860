//! `$(NAME)` string expansion over a flat `name -> value` map.
//!
//! A single left-to-right scan, no nested expansion: a substituted value is
//! never rescanned for further `$(...)` tokens.

use std::collections::HashMap;

/// Replaces every `$(NAME)` in `s` with `values[NAME]`. `$$` is a literal
/// `$`. An unresolved `NAME` is left as the literal substring `$(NAME)`.
/// `NAME` matches `[A-Za-z_][A-Za-z0-9_]*`. Total: never fails.
pub fn expand(s: &str, values: &HashMap<String, String>) -> String {
  let bytes = s.as_bytes();
  let mut out = String::with_capacity(s.len());
  let mut i = 0;

  while i < bytes.len() {
    match bytes[i] {
      b'$' if bytes.get(i + 1) == Some(&b'$') => {
        out.push('$');
        i += 2;
      }
      b'$' if bytes.get(i + 1) == Some(&b'(') => {
        if let Some((name, consumed)) = parse_var(&s[i + 2..]) {
          match values.get(name) {
            Some(value) => out.push_str(value),
            None => {
              out.push_str("$(");
              out.push_str(name);
              out.push(')');
            }
          }
          i += 2 + consumed;
        } else {
          out.push(bytes[i] as char);
          i += 1;
        }
      }
      b => {
        // s is valid UTF-8; push whole chars, not raw bytes, to stay correct
        // for multi-byte sequences.
        let ch_len = utf8_len(b);
        out.push_str(&s[i..i + ch_len]);
        i += ch_len;
      }
    }
  }

  out
}

fn utf8_len(first_byte: u8) -> usize {
  if first_byte & 0x80 == 0 {
    1
  } else if first_byte & 0xE0 == 0xC0 {
    2
  } else if first_byte & 0xF0 == 0xE0 {
    3
  } else {
    4
  }
}

/// Parses a `NAME)` prefix (the closing paren required). Returns the name
/// and the number of bytes consumed including the closing paren, or `None`
/// if `rest` doesn't start with a valid name immediately followed by `)`.
fn parse_var(rest: &str) -> Option<(&str, usize)> {
  let bytes = rest.as_bytes();
  if bytes.is_empty() || !is_name_start(bytes[0]) {
    return None;
  }

  let mut end = 1;
  while end < bytes.len() && is_name_continue(bytes[end]) {
    end += 1;
  }

  if bytes.get(end) == Some(&b')') {
    Some((&rest[..end], end + 1))
  } else {
    None
  }
}

fn is_name_start(b: u8) -> bool {
  b.is_ascii_alphabetic() || b == b'_'
}

fn is_name_continue(b: u8) -> bool {
  b.is_ascii_alphanumeric() || b == b'_'
}

#[cfg(test)]
mod tests {
  use super::*;

  fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
  }

  #[test]
  fn substitutes_known_name() {
    let v = vars(&[("user", "alice")]);
    assert_eq!(expand("hello $(user)!", &v), "hello alice!");
  }

  #[test]
  fn leaves_unresolved_name_literal() {
    let v = vars(&[]);
    assert_eq!(expand("hello $(user)!", &v), "hello $(user)!");
  }

  #[test]
  fn dollar_dollar_is_literal_dollar() {
    let v = vars(&[("user", "alice")]);
    assert_eq!(expand("price: $$5 for $(user)", &v), "price: $5 for alice");
  }

  #[test]
  fn no_nested_expansion() {
    // value itself contains a $(...)-shaped token; it must not be rescanned.
    let v = vars(&[("a", "$(b)"), ("b", "unexpected")]);
    assert_eq!(expand("$(a)", &v), "$(b)");
  }

  #[test]
  fn bare_dollar_passes_through() {
    let v = vars(&[]);
    assert_eq!(expand("$foo", &v), "$foo");
  }

  #[test]
  fn idempotent_when_values_have_no_dollar() {
    let v = vars(&[("user", "alice"), ("host", "example.com")]);
    let once = expand("$(user)@$(host)", &v);
    let twice = expand(&once, &v);
    assert_eq!(once, twice);
  }

  #[test]
  fn multiple_tokens_left_to_right() {
    let v = vars(&[("a", "1"), ("b", "2")]);
    assert_eq!(expand("$(a)-$(b)-$(a)", &v), "1-2-1");
  }
}
