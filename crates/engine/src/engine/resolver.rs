//! Scoped reference resolution.
//!
//! Conditions, Compute scripts and RestAPI templates address values through
//! `$Process.<name>` and `$Activity['<id>'].<name>` references. Resolution is
//! strictly read-only against the instance, and the three failure modes are
//! kept distinct so callers can tell "bad expression" from "not yet available".

use regex::Regex;
use serde_json::Value as JsonValue;
use std::sync::OnceLock;
use thiserror::Error;

use crate::engine::instance::ProcessInstance;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    #[error("unknown reference scope '{0}'")]
    UnknownScope(String),
    #[error("unknown activity '{0}' in reference")]
    UnknownActivity(String),
    #[error("unknown variable '{name}' in {scope} scope")]
    UnknownVariable { scope: String, name: String },
    #[error("malformed reference '{0}'")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Process { name: String },
    Activity { id: String, name: String },
}

/// Parse a `$`-reference expression into its scope and variable name.
///
/// Accepted forms: `$Process.name`, `$Activity['id'].name`,
/// `$Activity["id"].name` and the compact `$Activity.id.name`.
pub fn parse(expr: &str) -> Result<Reference, ReferenceError> {
    let expr = expr.trim();
    let body = expr
        .strip_prefix('$')
        .ok_or_else(|| ReferenceError::Malformed(expr.to_string()))?;

    if let Some(rest) = body.strip_prefix("Process.") {
        if rest.is_empty() {
            return Err(ReferenceError::Malformed(expr.to_string()));
        }
        return Ok(Reference::Process {
            name: rest.to_string(),
        });
    }

    if let Some(rest) = body.strip_prefix("Activity") {
        // Bracketed form: ['id'].name
        if let Some(rest) = rest.strip_prefix('[') {
            let close = rest
                .find(']')
                .ok_or_else(|| ReferenceError::Malformed(expr.to_string()))?;
            let id = rest[..close].trim_matches(|c| c == '\'' || c == '"');
            let tail = &rest[close + 1..];
            let name = tail
                .strip_prefix('.')
                .ok_or_else(|| ReferenceError::Malformed(expr.to_string()))?;
            if id.is_empty() || name.is_empty() {
                return Err(ReferenceError::Malformed(expr.to_string()));
            }
            return Ok(Reference::Activity {
                id: id.to_string(),
                name: name.to_string(),
            });
        }
        // Compact form: .id.name
        if let Some(rest) = rest.strip_prefix('.') {
            let (id, name) = rest
                .split_once('.')
                .ok_or_else(|| ReferenceError::Malformed(expr.to_string()))?;
            if id.is_empty() || name.is_empty() {
                return Err(ReferenceError::Malformed(expr.to_string()));
            }
            return Ok(Reference::Activity {
                id: id.to_string(),
                name: name.to_string(),
            });
        }
        return Err(ReferenceError::Malformed(expr.to_string()));
    }

    // `$Something.x` with an unrecognized namespace
    let scope = body.split('.').next().unwrap_or(body);
    Err(ReferenceError::UnknownScope(scope.to_string()))
}

/// Resolve a reference expression against the instance. Never mutates.
pub fn resolve(expr: &str, instance: &ProcessInstance) -> Result<JsonValue, ReferenceError> {
    match parse(expr)? {
        Reference::Process { name } => instance
            .variables
            .get(&name)
            .cloned()
            .ok_or(ReferenceError::UnknownVariable {
                scope: "process".to_string(),
                name,
            }),
        Reference::Activity { id, name } => {
            let state = instance
                .run_state(&id)
                .ok_or_else(|| ReferenceError::UnknownActivity(id.clone()))?;
            // passFail and status are addressable alongside the scoped variables
            match name.as_str() {
                "passFail" => {
                    return Ok(serde_json::to_value(state.pass_fail).unwrap_or(JsonValue::Null))
                }
                "status" => {
                    return Ok(serde_json::to_value(state.status).unwrap_or(JsonValue::Null))
                }
                _ => {}
            }
            state
                .variables
                .get(&name)
                .cloned()
                .ok_or(ReferenceError::UnknownVariable {
                    scope: format!("activity '{}'", id),
                    name,
                })
        }
    }
}

/// Substitute every `{{ <reference> }}` occurrence in a template string.
/// An unresolved reference fails the whole render.
pub fn render(template: &str, instance: &ProcessInstance) -> Result<String, ReferenceError> {
    static TEMPLATE_RE: OnceLock<Regex> = OnceLock::new();
    let re = TEMPLATE_RE
        .get_or_init(|| Regex::new(r"\{\{([^}]+)\}\}").expect("template pattern is valid"));

    let mut rendered = String::with_capacity(template.len());
    let mut last = 0;
    for cap in re.captures_iter(template) {
        let whole = cap.get(0).expect("capture 0 always present");
        let expr = cap[1].trim();
        let value = resolve(expr, instance)?;
        let text = match value {
            JsonValue::String(s) => s,
            other => other.to_string(),
        };
        rendered.push_str(&template[last..whole.start()]);
        rendered.push_str(&text);
        last = whole.end();
    }
    rendered.push_str(&template[last..]);
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ProcessDefinition;
    use serde_json::json;
    use std::collections::HashMap;

    fn instance() -> ProcessInstance {
        let definition = ProcessDefinition {
            id: "def".into(),
            version: "1".into(),
            name: "Def".into(),
            description: None,
            start: "a1".into(),
            activities: HashMap::new(),
        };
        let mut instance = ProcessInstance::new(&definition);
        instance.variables.insert("customer".into(), json!("acme"));
        instance.variables.insert("limit".into(), json!(5));
        let state = instance.run_state_mut("a1");
        state.variables.insert("score".into(), json!(42));
        state.variables.insert("passFail".into(), json!("pass"));
        state.complete();
        instance
    }

    #[test]
    fn test_process_scope_lookup() {
        let instance = instance();
        assert_eq!(resolve("$Process.customer", &instance).unwrap(), json!("acme"));
        assert_eq!(resolve("$Process.limit", &instance).unwrap(), json!(5));
    }

    #[test]
    fn test_activity_scope_lookup() {
        let instance = instance();
        assert_eq!(
            resolve("$Activity['a1'].score", &instance).unwrap(),
            json!(42)
        );
        assert_eq!(
            resolve("$Activity.a1.score", &instance).unwrap(),
            json!(42)
        );
        assert_eq!(
            resolve("$Activity['a1'].passFail", &instance).unwrap(),
            json!("pass")
        );
    }

    #[test]
    fn test_distinct_failure_modes() {
        let instance = instance();
        assert!(matches!(
            resolve("$Global.x", &instance),
            Err(ReferenceError::UnknownScope(scope)) if scope == "Global"
        ));
        assert!(matches!(
            resolve("$Activity['nope'].score", &instance),
            Err(ReferenceError::UnknownActivity(id)) if id == "nope"
        ));
        assert!(matches!(
            resolve("$Process.missing", &instance),
            Err(ReferenceError::UnknownVariable { name, .. }) if name == "missing"
        ));
        assert!(matches!(
            resolve("customer", &instance),
            Err(ReferenceError::Malformed(_))
        ));
    }

    #[test]
    fn test_render_template() {
        let instance = instance();
        let rendered = render(
            "https://api.example.com/{{ $Process.customer }}/score/{{ $Activity['a1'].score }}",
            &instance,
        )
        .unwrap();
        assert_eq!(rendered, "https://api.example.com/acme/score/42");
    }

    #[test]
    fn test_render_fails_on_unresolved() {
        let instance = instance();
        assert!(render("{{ $Process.nope }}", &instance).is_err());
    }
}
