// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! JSON-schema driven helpers for instance configs: secret redaction,
//! secret-preserving merges and required-field checks.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

pub(crate) const MISSING_REQUIRED_CONFIG: &str = "missing_required_config";
pub(crate) const INVALID_PLUGIN_CONFIG: &str = "invalid_plugin_config";

/// Paths of fields marked `format: "password"` or `x-secret: true`.
pub fn secret_paths(schema: &Value) -> Vec<Vec<String>> {
    let mut out = Vec::new();
    collect_secret_paths(schema, &mut Vec::new(), &mut out);
    out
}

fn collect_secret_paths(node: &Value, prefix: &mut Vec<String>, out: &mut Vec<Vec<String>>) {
    let Some(obj) = node.as_object() else {
        return;
    };
    let is_password = obj
        .get("format")
        .and_then(Value::as_str)
        .is_some_and(|f| f.trim().eq_ignore_ascii_case("password"));
    let is_secret = obj.get("x-secret").and_then(Value::as_bool) == Some(true);
    if (is_password || is_secret) && !prefix.is_empty() {
        out.push(prefix.clone());
        return;
    }
    let Some(props) = obj.get("properties").and_then(Value::as_object) else {
        return;
    };
    for (name, child) in props {
        if name.trim().is_empty() {
            continue;
        }
        prefix.push(name.clone());
        collect_secret_paths(child, prefix, out);
        prefix.pop();
    }
}

fn get_path<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(value, |cur, key| cur.as_object()?.get(key))
}

fn set_path(value: &mut Value, path: &[String], new: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut cur = value;
    for key in parents {
        if !cur.is_object() {
            *cur = Value::Object(Map::new());
        }
        let Some(obj) = cur.as_object_mut() else {
            return;
        };
        cur = obj
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !cur.is_object() {
        *cur = Value::Object(Map::new());
    }
    if let Some(obj) = cur.as_object_mut() {
        obj.insert(last.clone(), new);
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Blank every secret present in `config`.
pub fn redact(config: &mut Value, paths: &[Vec<String>]) {
    for path in paths {
        if get_path(config, path).is_some() {
            set_path(config, path, Value::String(String::new()));
        }
    }
}

/// Keep the stored secret wherever the new config leaves it empty or null.
pub fn merge_secrets(new: &mut Value, old: &Value, paths: &[Vec<String>]) {
    for path in paths {
        let (Some(old_value), Some(new_value)) = (get_path(old, path), get_path(new, path)) else {
            continue;
        };
        if is_blank(new_value) {
            let kept = old_value.clone();
            set_path(new, path, kept);
        }
    }
}

/// Dotted names of required fields that are absent, null or blank. Nested
/// objects are checked when present.
pub fn missing_required(schema: &Value, config: &Value) -> Vec<String> {
    let mut out = BTreeSet::new();
    collect_missing(schema, config, &mut Vec::new(), &mut out);
    out.into_iter().collect()
}

fn collect_missing(
    schema: &Value,
    config: &Value,
    prefix: &mut Vec<String>,
    out: &mut BTreeSet<String>,
) {
    let Some(schema) = schema.as_object() else {
        return;
    };
    let empty = Map::new();
    let props = schema
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let cfg = config.as_object().unwrap_or(&empty);
    let required: BTreeSet<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).map(str::trim).collect())
        .unwrap_or_default();

    for name in required.iter().filter(|n| !n.is_empty()) {
        prefix.push(name.to_string());
        match cfg.get(*name) {
            Some(v) if !is_blank(v) => {
                if let Some(child) = props.get(*name) {
                    collect_missing(child, v, prefix, out);
                }
            }
            _ => {
                out.insert(prefix.join("."));
            }
        }
        prefix.pop();
    }
    for (name, child) in props {
        if required.contains(name.as_str()) {
            continue;
        }
        if let Some(v) = cfg.get(name).filter(|v| !v.is_null()) {
            prefix.push(name.clone());
            collect_missing(child, v, prefix, out);
            prefix.pop();
        }
    }
}

/// Field names from a plugin message such as `app_id, secret required`.
pub fn fields_from_message(message: &str) -> Vec<String> {
    let lower = message.to_ascii_lowercase();
    let Some(idx) = lower.find("required").filter(|i| *i > 0) else {
        return Vec::new();
    };
    let head = message[..idx].trim().trim_matches(':');
    let fields: BTreeSet<String> = head
        .replace(" and ", ",")
        .split([',', ';', '|', '/'])
        .map(str::trim)
        .filter(|t| {
            !t.is_empty()
                && t.chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
        })
        .map(str::to_string)
        .collect();
    fields.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["app_id", "private_key", "gateway"],
            "properties": {
                "app_id": {"type": "string"},
                "private_key": {"type": "string", "format": "password"},
                "gateway": {
                    "type": "object",
                    "required": ["url"],
                    "properties": {
                        "url": {"type": "string"},
                        "token": {"type": "string", "x-secret": true}
                    }
                }
            }
        })
    }

    #[test]
    fn test_secret_paths_walk_properties() {
        let mut paths = secret_paths(&schema());
        paths.sort();
        assert_eq!(
            paths,
            vec![
                vec!["gateway".to_string(), "token".to_string()],
                vec!["private_key".to_string()],
            ]
        );
    }

    #[test]
    fn test_redact_and_merge() {
        let paths = secret_paths(&schema());
        let stored = json!({"app_id": "a1", "private_key": "pk", "gateway": {"url": "u", "token": "t"}});

        let mut shown = stored.clone();
        redact(&mut shown, &paths);
        assert_eq!(shown["private_key"], "");
        assert_eq!(shown["gateway"]["token"], "");
        assert_eq!(shown["app_id"], "a1");

        let mut update = json!({"app_id": "a2", "private_key": "", "gateway": {"url": "u2", "token": null}});
        merge_secrets(&mut update, &stored, &paths);
        assert_eq!(update["private_key"], "pk");
        assert_eq!(update["gateway"]["token"], "t");
        assert_eq!(update["app_id"], "a2");

        let mut rotated = json!({"private_key": "new"});
        merge_secrets(&mut rotated, &stored, &paths);
        assert_eq!(rotated["private_key"], "new");
    }

    #[test]
    fn test_missing_required_is_sorted_and_nested() {
        let missing = missing_required(&schema(), &json!({"app_id": " ", "gateway": {}}));
        assert_eq!(missing, vec!["app_id", "gateway.url", "private_key"]);
        let none = missing_required(
            &schema(),
            &json!({"app_id": "a", "private_key": "k", "gateway": {"url": "u"}}),
        );
        assert!(none.is_empty());
    }

    #[test]
    fn test_fields_from_message() {
        assert_eq!(
            fields_from_message("app_id, secret required"),
            vec!["app_id", "secret"]
        );
        assert!(fields_from_message("connection refused").is_empty());
    }
}
