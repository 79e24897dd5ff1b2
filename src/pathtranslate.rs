//! Path translator & platform adapter: rewrites path-like fields in
//! `tools/call` arguments and responses across the host/container boundary.
//!
//! Two host conventions coexist: native host paths and a POSIX-mounted view
//! of them (`/mnt/<drive>/...`). A bidirectional map of explicit prefixes is
//! consulted first; a generic `X:\...` <-> `/mnt/x/...` rule with separator
//! flipping is the fallback.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

/// Argument keys that are rewritten outbound regardless of tool name.
const ARG_PATH_KEYS: &[&str] = &["path", "file_path", "directory", "source", "destination", "paths"];

static DRIVE_LETTER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^([A-Za-z]):\\(.*)$").unwrap());
static MOUNT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^/mnt/([a-z])(/.*)?$").unwrap());
static PATH_LIKE_TOOL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)read|write|create|delete|list|move|copy").unwrap());
static RESPONSE_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)path|file|directory|folder").unwrap());

#[derive(Debug, Clone, Default)]
pub struct PathTranslator {
    /// Explicit host-visible <-> container-visible prefix pairs, checked
    /// before the generic drive-letter rule.
    mappings: Vec<(String, String)>,
}

impl PathTranslator {
    #[must_use]
    pub fn new(mappings: Vec<(String, String)>) -> Self {
        Self { mappings }
    }

    /// Host-native path -> container-visible path.
    #[must_use]
    pub fn to_container(&self, path: &str) -> String {
        for (host_prefix, container_prefix) in &self.mappings {
            if let Some(rest) = path.strip_prefix(host_prefix.as_str()) {
                return format!("{container_prefix}{rest}");
            }
        }
        if let Some(caps) = DRIVE_LETTER_RE.captures(path) {
            let drive = caps[1].to_lowercase();
            let rest = caps[2].replace('\\', "/");
            return format!("/mnt/{drive}/{rest}");
        }
        path.to_string()
    }

    /// Container-visible path -> host-native path.
    #[must_use]
    pub fn to_host(&self, path: &str) -> String {
        for (host_prefix, container_prefix) in &self.mappings {
            if let Some(rest) = path.strip_prefix(container_prefix.as_str()) {
                return format!("{host_prefix}{rest}");
            }
        }
        if let Some(caps) = MOUNT_RE.captures(path) {
            let drive = caps[1].to_uppercase();
            let rest = caps.get(2).map_or("", |m| m.as_str()).replace('/', "\\");
            return format!("{drive}:{rest}");
        }
        path.to_string()
    }

    /// Rewrite outbound `tools/call` arguments: fields whose key matches the
    /// conservative list, or any field when the tool name suggests a
    /// filesystem-y operation, get their string values translated to the
    /// container-visible form.
    #[must_use]
    pub fn rewrite_arguments(&self, tool_name: &str, args: &Value) -> Value {
        let rewrite_all = PATH_LIKE_TOOL_RE.is_match(tool_name);
        self.rewrite_object(args, rewrite_all, |key| ARG_PATH_KEYS.contains(&key), |t| self.to_container(t))
    }

    /// Rewrite inbound responses: any string under a key whose lowercased
    /// name contains `path|file|directory|folder`, recursively.
    #[must_use]
    pub fn rewrite_response(&self, response: &Value) -> Value {
        self.rewrite_object(response, false, |key| RESPONSE_KEY_RE.is_match(key), |t| self.to_host(t))
    }

    fn rewrite_object(
        &self,
        value: &Value,
        rewrite_all_string_values: bool,
        key_matches: impl Fn(&str) -> bool + Copy,
        translate: impl Fn(&str) -> String + Copy,
    ) -> Value {
        match value {
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, val) in map {
                    let should_rewrite = rewrite_all_string_values || key_matches(&key.to_lowercase());
                    let rewritten = match val {
                        Value::String(s) if should_rewrite => Value::String(translate(s)),
                        Value::Object(_) | Value::Array(_) => {
                            self.rewrite_object(val, rewrite_all_string_values, key_matches, translate)
                        }
                        other => other.clone(),
                    };
                    out.insert(key.clone(), rewritten);
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.rewrite_object(item, rewrite_all_string_values, key_matches, translate))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drive_letter_round_trip_is_identity_for_host_native_form() {
        let translator = PathTranslator::default();
        let host = r"C:\Users\alice\file.txt";
        let container = translator.to_container(host);
        assert_eq!(container, "/mnt/c/Users/alice/file.txt");
        let back = translator.to_host(&container);
        assert_eq!(back, host);
    }

    #[test]
    fn explicit_mapping_takes_priority_over_generic_rule() {
        let translator = PathTranslator::new(vec![("/home/alice".to_string(), "/workspace".to_string())]);
        assert_eq!(translator.to_container("/home/alice/notes.txt"), "/workspace/notes.txt");
        assert_eq!(translator.to_host("/workspace/notes.txt"), "/home/alice/notes.txt");
    }

    #[test]
    fn rewrite_arguments_targets_conservative_key_list() {
        let translator = PathTranslator::default();
        let args = serde_json::json!({"path": r"C:\tmp\x", "other": r"C:\tmp\y"});
        let rewritten = translator.rewrite_arguments("read_file", &args);
        assert_eq!(rewritten["path"], "/mnt/c/tmp/x");
        // read_file tool name matches the filesystem-op pattern, so even
        // "other" gets rewritten.
        assert_eq!(rewritten["other"], "/mnt/c/tmp/y");
    }

    #[test]
    fn rewrite_arguments_for_non_path_tool_only_touches_listed_keys() {
        let translator = PathTranslator::default();
        let args = serde_json::json!({"path": r"C:\tmp\x", "query": r"C:\tmp\y"});
        let rewritten = translator.rewrite_arguments("search", &args);
        assert_eq!(rewritten["path"], "/mnt/c/tmp/x");
        assert_eq!(rewritten["query"], r"C:\tmp\y");
    }

    #[test]
    fn rewrite_response_matches_path_like_keys_recursively() {
        let translator = PathTranslator::default();
        let response = serde_json::json!({"result": {"file_path": "/mnt/c/tmp/x", "unrelated": "/mnt/c/tmp/y"}});
        let rewritten = translator.rewrite_response(&response);
        assert_eq!(rewritten["result"]["file_path"], r"C:\tmp\x");
        assert_eq!(rewritten["result"]["unrelated"], "/mnt/c/tmp/y");
    }
}
