//! Parsing of raw reasoning-engine output into plan steps.
//!
//! Accepted shapes, optionally wrapped in markdown fences or prose:
//! `{"intent": "...", "actions": [...]}` or a bare `[...]` of actions.
//! Each action names its kind through `kind`, `tool` or `type`.

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::PlanError;
use crate::plan::{PlanStep, PlanningIssue};
use crate::types::{Action, ActionKind, Arguments};

/// Labels that name a device operation rather than a generic IoT call.
const IOT_OPERATION_LABELS: [&str; 3] = ["toggle_light", "set_temperature", "unlock_door"];

/// Steps and summary recovered from a reasoning response.
#[derive(Debug, Clone)]
pub struct ParsedPlan {
    pub intent_summary: Option<String>,
    pub steps: Vec<PlanStep>,
}

/// Parse a raw plan text.
///
/// Shape errors fail the whole plan with `MalformedPlan`. Unknown kinds and
/// missing arguments only mark the offending step; if no step is usable the
/// result is `EmptyPlan`.
pub fn parse_plan_text(raw: &str) -> Result<ParsedPlan, PlanError> {
    let body = extract_json(raw);
    if body.is_empty() {
        return Err(PlanError::MalformedPlan("response contains no JSON".to_string()));
    }

    let value: Value = serde_json::from_str(body)
        .map_err(|e| PlanError::MalformedPlan(format!("invalid JSON: {}", e)))?;

    let (intent_summary, entries) = match value {
        Value::Object(mut obj) => {
            let intent = obj
                .get("intent")
                .and_then(Value::as_str)
                .map(str::to_string);
            let entries = match obj.remove("actions") {
                Some(Value::Array(items)) => items,
                Some(Value::Null) | None => Vec::new(),
                Some(_) => {
                    return Err(PlanError::MalformedPlan(
                        "'actions' must be an array".to_string(),
                    ))
                }
            };
            (intent, entries)
        }
        Value::Array(items) => (None, items),
        _ => {
            return Err(PlanError::MalformedPlan(
                "expected an object or an array of actions".to_string(),
            ))
        }
    };

    let steps = entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| parse_step(index, entry))
        .collect::<Result<Vec<_>, _>>()?;

    if steps.iter().all(|s| s.planning_issue.is_some()) {
        let reasons = if steps.is_empty() {
            vec!["plan contains no actions".to_string()]
        } else {
            steps
                .iter()
                .filter_map(|s| {
                    s.planning_issue
                        .as_ref()
                        .map(|issue| format!("step {}: {}", s.index, issue))
                })
                .collect()
        };
        return Err(PlanError::EmptyPlan { reasons });
    }

    debug!(
        steps = steps.len(),
        flagged = steps.iter().filter(|s| s.planning_issue.is_some()).count(),
        "Parsed plan"
    );

    Ok(ParsedPlan {
        intent_summary,
        steps,
    })
}

fn parse_step(index: usize, entry: Value) -> Result<PlanStep, PlanError> {
    let Value::Object(obj) = entry else {
        return Err(PlanError::MalformedPlan(format!(
            "action {} is not an object",
            index
        )));
    };

    let label = ["kind", "tool", "type"]
        .iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str))
        .map(str::to_string)
        .ok_or_else(|| PlanError::MalformedPlan(format!("action {} names no kind", index)))?;

    let mut arguments: Arguments = match obj.get("arguments") {
        None | Some(Value::Null) => Arguments::new(),
        Some(Value::Object(map)) => map.clone().into_iter().collect(),
        Some(_) => {
            return Err(PlanError::MalformedPlan(format!(
                "arguments of action {} must be an object",
                index
            )))
        }
    };

    let depends_on = parse_dependencies(index, &obj)?;
    let description = obj
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let Some(kind) = ActionKind::from_label(&label) else {
        debug!(index, label = %label, "Unknown action kind");
        return Ok(PlanStep {
            index,
            planning_issue: Some(PlanningIssue::UnknownKind {
                label: label.clone(),
            }),
            label,
            action: None,
            depends_on,
            verdict: None,
        });
    };

    let normalized_label = label.trim().to_lowercase().replace(['-', ' '], "_");
    if IOT_OPERATION_LABELS.contains(&normalized_label.as_str()) {
        arguments
            .entry("command".to_string())
            .or_insert(Value::String(normalized_label));
    }

    let action = Action::new(kind, arguments).with_description(description);
    let missing = action.missing_arguments();
    let planning_issue = (!missing.is_empty()).then(|| PlanningIssue::MissingArgument {
        names: missing.iter().map(|s| s.to_string()).collect(),
    });

    Ok(PlanStep {
        index,
        label,
        action: Some(action),
        depends_on,
        planning_issue,
        verdict: None,
    })
}

/// Explicit `depends_on`, else the previous step unless marked independent.
fn parse_dependencies(index: usize, obj: &Map<String, Value>) -> Result<Vec<usize>, PlanError> {
    match obj.get("depends_on") {
        None | Some(Value::Null) => {
            let independent = obj
                .get("independent")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            Ok(if independent || index == 0 {
                Vec::new()
            } else {
                vec![index - 1]
            })
        }
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item.as_u64() {
                Some(dep) if (dep as usize) < index => Ok(dep as usize),
                _ => Err(PlanError::MalformedPlan(format!(
                    "action {} has invalid dependency {}; dependencies must name earlier steps",
                    index, item
                ))),
            })
            .collect(),
        Some(other) => Err(PlanError::MalformedPlan(format!(
            "depends_on of action {} must be an array, got {}",
            index, other
        ))),
    }
}

/// Locate the JSON payload inside fenced or prose-wrapped text.
fn extract_json(raw: &str) -> &str {
    let fenced = if let Some(start) = raw.find("```json") {
        Some(&raw[start + 7..])
    } else {
        raw.find("```").map(|start| &raw[start + 3..])
    };

    let text = match fenced {
        Some(rest) => match rest.find("```") {
            Some(end) => &rest[..end],
            None => rest,
        },
        None => raw,
    }
    .trim();

    if text.starts_with('{') || text.starts_with('[') {
        return text;
    }

    let Some(start) = text.find(['{', '[']) else {
        return "";
    };
    let close = if text[start..].starts_with('{') {
        '}'
    } else {
        ']'
    };
    match text.rfind(close) {
        Some(end) if end > start => &text[start..=end],
        _ => "",
    }
}
