//! Argument schemas: declared parameter types and constraints per action kind.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use crate::types::Action;

/// Declared type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    /// Absolute filesystem path confined to allowed roots.
    Path,
}

/// Constraints on a single parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_len: Option<usize>,
    /// Permitted values for string parameters. Empty means unrestricted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<String>,
    /// Roots for path parameters. Empty falls back to the rule set's roots.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_roots: Vec<String>,
}

/// Parameter specs of one action kind, keyed by argument name.
pub type KindSchema = BTreeMap<String, ParamSpec>;

/// A failed constraint: the offending parameter and what was wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    pub param: String,
    pub detail: String,
}

/// Check an action's arguments against its kind schema.
///
/// Arguments without a spec are not checked.
pub fn validate_arguments(
    action: &Action,
    schema: &KindSchema,
    default_roots: &[String],
) -> Result<(), SchemaViolation> {
    for (param, spec) in schema {
        let violation = |detail: String| SchemaViolation {
            param: param.clone(),
            detail,
        };

        let value = match action.arguments.get(param) {
            Some(Value::Null) | None => {
                if spec.required {
                    return Err(violation("required parameter is missing".to_string()));
                }
                continue;
            }
            Some(v) => v,
        };

        check_value(value, spec, default_roots).map_err(violation)?;
    }
    Ok(())
}

fn check_value(value: &Value, spec: &ParamSpec, default_roots: &[String]) -> Result<(), String> {
    match spec.param_type {
        ParamType::String => {
            let s = value
                .as_str()
                .ok_or_else(|| format!("expected string, got {}", value))?;
            if let Some(max_len) = spec.max_len {
                if s.chars().count() > max_len {
                    return Err(format!("longer than {} characters", max_len));
                }
            }
            if !spec.allowed.is_empty() && !spec.allowed.iter().any(|a| a == s) {
                return Err(format!(
                    "'{}' is not one of: {}",
                    s,
                    spec.allowed.join(", ")
                ));
            }
            Ok(())
        }
        ParamType::Integer => {
            let n = value
                .as_i64()
                .ok_or_else(|| format!("expected integer, got {}", value))?;
            check_range(n as f64, spec)
        }
        ParamType::Number => {
            let n = value
                .as_f64()
                .ok_or_else(|| format!("expected number, got {}", value))?;
            check_range(n, spec)
        }
        ParamType::Boolean => value
            .is_boolean()
            .then_some(())
            .ok_or_else(|| format!("expected boolean, got {}", value)),
        ParamType::Path => {
            let raw = value
                .as_str()
                .ok_or_else(|| format!("expected path string, got {}", value))?;
            let roots = if spec.allowed_roots.is_empty() {
                default_roots
            } else {
                &spec.allowed_roots
            };
            check_path(raw, roots)
        }
    }
}

fn check_range(n: f64, spec: &ParamSpec) -> Result<(), String> {
    if let Some(min) = spec.min {
        if n < min {
            return Err(format!("{} is below the minimum {}", n, min));
        }
    }
    if let Some(max) = spec.max {
        if n > max {
            return Err(format!("{} is above the maximum {}", n, max));
        }
    }
    Ok(())
}

fn check_path(raw: &str, roots: &[String]) -> Result<(), String> {
    let path = normalize_path(raw)
        .ok_or_else(|| format!("'{}' is not an absolute path inside the filesystem root", raw))?;
    if path_within_roots(&path, roots) {
        Ok(())
    } else if roots.is_empty() {
        Err("no allowed roots configured".to_string())
    } else {
        Err(format!("'{}' is outside the allowed roots", path.display()))
    }
}

/// Lexically normalize an absolute path.
///
/// Returns `None` for relative paths and for `..` that would climb above `/`.
pub fn normalize_path(raw: &str) -> Option<PathBuf> {
    let path = Path::new(raw);
    if !path.is_absolute() {
        return None;
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Some(out)
}

/// Whether a normalized path lies under any of the given roots.
pub fn path_within_roots(path: &Path, roots: &[String]) -> bool {
    roots
        .iter()
        .filter_map(|root| normalize_path(root))
        .any(|root| path.starts_with(&root))
}
