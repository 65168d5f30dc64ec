//! JPEL process definition documents.
//!
//! A definition is an immutable template: a start reference plus a map of
//! activity nodes that nest through child references. Definitions are loaded
//! once and shared read-only across every instance executing them.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: String,

    #[serde(default = "default_version")]
    pub version: String,

    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Activity id execution begins at
    pub start: String,

    pub activities: HashMap<String, ActivityNode>,
}

fn default_version() -> String {
    "1".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityNode {
    /// Activity kind: Sequence, Flow, If, Case, While, HumanTask, Compute, RestAPI, Terminate
    #[serde(rename = "type")]
    pub kind: ActivityKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Ordered child references (Sequence) or concurrent set (Flow)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activities: Option<Vec<String>>,

    /// Condition expression (If, While)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// Branch taken when the condition is truthy (If)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub then: Option<String>,

    /// Branch taken when the condition is falsy (If)
    #[serde(rename = "else", skip_serializing_if = "Option::is_none")]
    pub otherwise: Option<String>,

    /// Condition arms evaluated in declared order (Case)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cases: Option<Vec<CaseArm>>,

    /// Loop body reference (While)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,

    /// Input field specifications (HumanTask)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<FieldSpec>>,

    /// Script body (Compute)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,

    /// HTTP method (RestAPI)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Templated request URL (RestAPI)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Templated request headers (RestAPI)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,

    /// Templated request body (RestAPI)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<JsonValue>,

    /// Deadline in seconds: outbound call timeout (RestAPI) or how long a
    /// waiting task may stay open before expiring (HumanTask)
    #[serde(rename = "timeoutSeconds", skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    /// Termination reason (Terminate)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Declared output variable names
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityKind {
    Sequence,
    Flow,
    If,
    Case,
    While,
    HumanTask,
    Compute,
    #[serde(rename = "RestAPI")]
    RestApi,
    Terminate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseArm {
    pub condition: String,
    pub activity: String,
}

/// Human-task field specification exchanged with the presentation layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,

    #[serde(rename = "type")]
    pub field_type: FieldType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,

    #[serde(default)]
    pub required: bool,

    /// Regex the submitted text must match
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    #[serde(rename = "patternDescription", skip_serializing_if = "Option::is_none")]
    pub pattern_description: Option<String>,

    /// Minimum length (text) or minimum value (number)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,

    /// Maximum length (text) or maximum value (number)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<FieldOption>>,

    /// Previously submitted value, merged in when the task is presented
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<JsonValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Number,
    Boolean,
    Select,
    Date,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldOption {
    pub value: JsonValue,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl ActivityNode {
    pub fn is_compound(&self) -> bool {
        matches!(
            self.kind,
            ActivityKind::Sequence
                | ActivityKind::Flow
                | ActivityKind::If
                | ActivityKind::Case
                | ActivityKind::While
        )
    }

    /// Child references in canonical (declared) order.
    pub fn children(&self) -> Vec<&str> {
        match self.kind {
            ActivityKind::Sequence | ActivityKind::Flow => self
                .activities
                .iter()
                .flatten()
                .map(String::as_str)
                .collect(),
            ActivityKind::If => self
                .then
                .iter()
                .chain(self.otherwise.iter())
                .map(String::as_str)
                .collect(),
            ActivityKind::Case => self
                .cases
                .iter()
                .flatten()
                .map(|arm| arm.activity.as_str())
                .collect(),
            ActivityKind::While => self.activity.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitMark {
    Visiting,
    Done,
}

impl ProcessDefinition {
    pub fn node(&self, id: &str) -> Option<&ActivityNode> {
        self.activities.get(id)
    }

    fn detect_cycles<'a>(
        &'a self,
        id: &'a str,
        marks: &mut HashMap<&'a str, VisitMark>,
        errors: &mut Vec<String>,
    ) {
        match marks.get(id) {
            Some(VisitMark::Done) => return,
            Some(VisitMark::Visiting) => {
                errors.push(format!("activity '{}' is part of a reference cycle", id));
                return;
            }
            None => {}
        }
        marks.insert(id, VisitMark::Visiting);
        if let Some(node) = self.activities.get(id) {
            for child in node.children() {
                self.detect_cycles(child, marks, errors);
            }
        }
        marks.insert(id, VisitMark::Done);
    }

    /// Structural validation performed at ingestion: the start reference and
    /// every child reference must name a declared activity, and each node must
    /// carry the fields its kind requires.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.activities.contains_key(&self.start) {
            errors.push(format!("start activity '{}' is not declared", self.start));
        }

        for (id, node) in &self.activities {
            for child in node.children() {
                if !self.activities.contains_key(child) {
                    errors.push(format!(
                        "activity '{}' references undeclared activity '{}'",
                        id, child
                    ));
                }
            }

            match node.kind {
                ActivityKind::Sequence | ActivityKind::Flow => {
                    if node.activities.as_ref().map_or(true, |a| a.is_empty()) {
                        errors.push(format!("activity '{}' must declare child activities", id));
                    }
                }
                ActivityKind::If => {
                    if node.condition.is_none() {
                        errors.push(format!("activity '{}' must declare a condition", id));
                    }
                    if node.then.is_none() {
                        errors.push(format!("activity '{}' must declare a then branch", id));
                    }
                }
                ActivityKind::Case => {
                    if node.cases.as_ref().map_or(true, |c| c.is_empty()) {
                        errors.push(format!("activity '{}' must declare cases", id));
                    }
                }
                ActivityKind::While => {
                    if node.condition.is_none() {
                        errors.push(format!("activity '{}' must declare a condition", id));
                    }
                    if node.activity.is_none() {
                        errors.push(format!("activity '{}' must declare a loop body", id));
                    }
                }
                ActivityKind::HumanTask => {
                    if node.fields.as_ref().map_or(true, |f| f.is_empty()) {
                        errors.push(format!("activity '{}' must declare input fields", id));
                    }
                }
                ActivityKind::Compute => {
                    if node.script.is_none() {
                        errors.push(format!("activity '{}' must declare a script", id));
                    }
                }
                ActivityKind::RestApi => {
                    if node.url.is_none() {
                        errors.push(format!("activity '{}' must declare a url", id));
                    }
                }
                ActivityKind::Terminate => {}
            }
        }

        // Nesting must form a tree: a reference cycle would make traversal
        // unbounded, so it is rejected at ingestion.
        let mut marks: HashMap<&str, VisitMark> = HashMap::new();
        for id in self.activities.keys() {
            self.detect_cycles(id, &mut marks, &mut errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_definition_document() {
        let doc = json!({
            "id": "onboarding",
            "version": "2",
            "name": "Onboarding",
            "start": "a1",
            "activities": {
                "a1": { "type": "Sequence", "activities": ["a2", "a3"] },
                "a2": { "type": "Compute", "script": "x = 1" },
                "a3": {
                    "type": "HumanTask",
                    "fields": [
                        { "name": "email", "type": "text", "required": true }
                    ]
                }
            }
        });

        let definition: ProcessDefinition = serde_json::from_value(doc).unwrap();
        assert_eq!(definition.version, "2");
        assert_eq!(definition.activities.len(), 3);
        assert_eq!(definition.node("a1").unwrap().kind, ActivityKind::Sequence);
        assert_eq!(definition.node("a1").unwrap().children(), vec!["a2", "a3"]);
        assert!(definition.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_references() {
        let doc = json!({
            "id": "broken",
            "name": "Broken",
            "start": "missing",
            "activities": {
                "a1": { "type": "Sequence", "activities": ["ghost"] }
            }
        });

        let definition: ProcessDefinition = serde_json::from_value(doc).unwrap();
        let errors = definition.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("start activity 'missing'")));
        assert!(errors.iter().any(|e| e.contains("'ghost'")));
    }

    #[test]
    fn test_validate_rejects_reference_cycles() {
        let doc = json!({
            "id": "cyclic", "name": "Cyclic", "start": "root",
            "activities": {
                "root": { "type": "Sequence", "activities": ["root"] }
            }
        });
        let definition: ProcessDefinition = serde_json::from_value(doc).unwrap();
        let errors = definition.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("cycle")));

        let doc = json!({
            "id": "cyclic2", "name": "Cyclic2", "start": "root",
            "activities": {
                "root": { "type": "Sequence", "activities": ["mid"] },
                "mid": { "type": "While", "condition": "true", "activity": "root" }
            }
        });
        let definition: ProcessDefinition = serde_json::from_value(doc).unwrap();
        let errors = definition.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("cycle")));
    }

    #[test]
    fn test_validate_requires_kind_fields() {
        let doc = json!({
            "id": "incomplete",
            "name": "Incomplete",
            "start": "a1",
            "activities": {
                "a1": { "type": "If", "then": "a2" },
                "a2": { "type": "Compute", "script": "x = 1" }
            }
        });

        let definition: ProcessDefinition = serde_json::from_value(doc).unwrap();
        let errors = definition.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("must declare a condition")));
    }
}
