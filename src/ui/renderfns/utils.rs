use serde_json::Value;

/// Truncate a string to a maximum number of characters, adding "..." if truncated
pub fn truncate(s: &str, max_len: usize) -> String {
  if s.chars().count() <= max_len {
    s.to_string()
  } else {
    let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
    format!("{}...", kept)
  }
}

/// Render an opaque payload as display lines.
///
/// Objects become one `key: value` line per top-level field; anything else is
/// pretty-printed as JSON.
pub fn payload_lines(payload: &Value, max_len: usize) -> Vec<String> {
  match payload {
    Value::Object(fields) => fields
      .iter()
      .map(|(key, value)| truncate(&format!("{}: {}", key, scalar(value)), max_len))
      .collect(),
    other => serde_json::to_string_pretty(other)
      .unwrap_or_default()
      .lines()
      .map(|line| truncate(line, max_len))
      .collect(),
  }
}

fn scalar(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}
