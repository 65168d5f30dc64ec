//! Condition and Compute-script evaluation.
//!
//! JPEL conditions and Compute bodies share one small expression language:
//! literals, `$`-references, bare identifiers (process scope), arithmetic,
//! comparisons and boolean connectives. A Compute body is a sequence of
//! `name = expression` assignments separated by newlines or semicolons.
//!
//! Values are `serde_json::Value` throughout, so whatever a script computes
//! can be stored directly in instance state.

use serde_json::Value as JsonValue;
use std::collections::HashMap;
use thiserror::Error;

use crate::engine::instance::ProcessInstance;
use crate::engine::resolver::{self, ReferenceError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScriptError {
    #[error("{0}")]
    Reference(#[from] ReferenceError),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("type error: {0}")]
    Type(String),
}

/// Evaluate a condition expression to a truth value.
pub fn eval_condition(expr: &str, instance: &ProcessInstance) -> Result<bool, ScriptError> {
    let value = eval_expr(expr, instance, &HashMap::new())?;
    Ok(is_truthy(&value))
}

/// Run a script body and return the variables it assigned, in their final
/// values. Statements see earlier assignments from the same run.
pub fn run_script(
    script: &str,
    instance: &ProcessInstance,
) -> Result<HashMap<String, JsonValue>, ScriptError> {
    let mut locals: HashMap<String, JsonValue> = HashMap::new();

    for statement in script
        .split(['\n', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.starts_with("//"))
    {
        let (name, expr) = split_assignment(statement)
            .ok_or_else(|| ScriptError::Parse(format!("expected assignment: '{}'", statement)))?;
        let value = eval_expr(expr, instance, &locals)?;
        locals.insert(name.to_string(), value);
    }

    Ok(locals)
}

/// Split `name = expr`, refusing to split on `==`, `!=`, `<=`, `>=`.
fn split_assignment(statement: &str) -> Option<(&str, &str)> {
    let bytes = statement.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b != b'=' {
            continue;
        }
        let prev = i.checked_sub(1).map(|p| bytes[p]);
        let next = bytes.get(i + 1);
        if next == Some(&b'=') || matches!(prev, Some(b'=') | Some(b'!') | Some(b'<') | Some(b'>')) {
            continue;
        }
        let name = statement[..i].trim();
        let expr = statement[i + 1..].trim();
        if name.is_empty() || expr.is_empty() || !is_identifier(name) {
            return None;
        }
        return Some((name, expr));
    }
    None
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn eval_expr(
    expr: &str,
    instance: &ProcessInstance,
    locals: &HashMap<String, JsonValue>,
) -> Result<JsonValue, ScriptError> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        instance,
        locals,
    };
    let value = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(ScriptError::Parse(format!(
            "unexpected trailing input in '{}'",
            expr
        )));
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Ref(String),
    Op(&'static str),
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ScriptError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    s.push(chars[i]);
                    i += 1;
                }
                if i == chars.len() {
                    return Err(ScriptError::Parse("unterminated string literal".into()));
                }
                i += 1;
                tokens.push(Token::Str(s));
            }
            '$' => {
                let start = i;
                i += 1;
                while i < chars.len() {
                    let c = chars[i];
                    if c.is_ascii_alphanumeric() || c == '_' {
                        i += 1;
                    } else if c == '.'
                        && chars
                            .get(i + 1)
                            .map_or(false, |n| n.is_ascii_alphanumeric() || *n == '_')
                    {
                        i += 1;
                    } else if c == '[' {
                        while i < chars.len() && chars[i] != ']' {
                            i += 1;
                        }
                        if i == chars.len() {
                            return Err(ScriptError::Parse("unterminated reference".into()));
                        }
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ref(chars[start..i].iter().collect()));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse::<f64>()
                    .map_err(|_| ScriptError::Parse(format!("invalid number '{}'", text)))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => {
                let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let op = match two.as_str() {
                    "==" | "!=" | "<=" | ">=" | "&&" | "||" => {
                        i += 2;
                        match two.as_str() {
                            "==" => "==",
                            "!=" => "!=",
                            "<=" => "<=",
                            ">=" => ">=",
                            "&&" => "&&",
                            _ => "||",
                        }
                    }
                    _ => {
                        i += 1;
                        match c {
                            '+' => "+",
                            '-' => "-",
                            '*' => "*",
                            '/' => "/",
                            '<' => "<",
                            '>' => ">",
                            '!' => "!",
                            other => {
                                return Err(ScriptError::Parse(format!(
                                    "unexpected character '{}'",
                                    other
                                )))
                            }
                        }
                    }
                };
                tokens.push(Token::Op(op));
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    instance: &'a ProcessInstance,
    locals: &'a HashMap<String, JsonValue>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat_op(&mut self, ops: &[&str]) -> Option<&'static str> {
        if let Some(Token::Op(op)) = self.peek() {
            if ops.contains(op) {
                let op = *op;
                self.pos += 1;
                return Some(op);
            }
        }
        None
    }

    fn parse_or(&mut self) -> Result<JsonValue, ScriptError> {
        let mut left = self.parse_and()?;
        while self.eat_op(&["||"]).is_some() {
            let right = self.parse_and()?;
            left = JsonValue::Bool(is_truthy(&left) || is_truthy(&right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<JsonValue, ScriptError> {
        let mut left = self.parse_comparison()?;
        while self.eat_op(&["&&"]).is_some() {
            let right = self.parse_comparison()?;
            left = JsonValue::Bool(is_truthy(&left) && is_truthy(&right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<JsonValue, ScriptError> {
        let left = self.parse_additive()?;
        if let Some(op) = self.eat_op(&["==", "!=", "<=", ">=", "<", ">"]) {
            let right = self.parse_additive()?;
            return compare(op, &left, &right).map(JsonValue::Bool);
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<JsonValue, ScriptError> {
        let mut left = self.parse_multiplicative()?;
        while let Some(op) = self.eat_op(&["+", "-"]) {
            let right = self.parse_multiplicative()?;
            left = arithmetic(op, &left, &right)?;
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<JsonValue, ScriptError> {
        let mut left = self.parse_unary()?;
        while let Some(op) = self.eat_op(&["*", "/"]) {
            let right = self.parse_unary()?;
            left = arithmetic(op, &left, &right)?;
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<JsonValue, ScriptError> {
        if self.eat_op(&["!"]).is_some() {
            let value = self.parse_unary()?;
            return Ok(JsonValue::Bool(!is_truthy(&value)));
        }
        if self.eat_op(&["-"]).is_some() {
            let value = self.parse_unary()?;
            let num = as_number(&value)?;
            return Ok(number(-num));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<JsonValue, ScriptError> {
        let token = self
            .peek()
            .cloned()
            .ok_or_else(|| ScriptError::Parse("unexpected end of expression".into()))?;
        self.pos += 1;

        match token {
            Token::Num(n) => Ok(number(n)),
            Token::Str(s) => Ok(JsonValue::String(s)),
            Token::Ref(expr) => Ok(resolver::resolve(&expr, self.instance)?),
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(JsonValue::Bool(true)),
                "false" => Ok(JsonValue::Bool(false)),
                "null" => Ok(JsonValue::Null),
                _ => {
                    if let Some(value) = self.locals.get(&name) {
                        return Ok(value.clone());
                    }
                    self.instance.variables.get(&name).cloned().ok_or_else(|| {
                        ScriptError::Reference(ReferenceError::UnknownVariable {
                            scope: "process".to_string(),
                            name,
                        })
                    })
                }
            },
            Token::LParen => {
                let value = self.parse_or()?;
                match self.peek() {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(value)
                    }
                    _ => Err(ScriptError::Parse("expected ')'".into())),
                }
            }
            other => Err(ScriptError::Parse(format!("unexpected token {:?}", other))),
        }
    }
}

fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(_) | JsonValue::Object(_) => true,
    }
}

fn as_number(value: &JsonValue) -> Result<f64, ScriptError> {
    match value {
        JsonValue::Number(n) => n
            .as_f64()
            .ok_or_else(|| ScriptError::Type("number out of range".into())),
        other => Err(ScriptError::Type(format!("expected a number, got {}", other))),
    }
}

/// Keep whole results as JSON integers so variables round-trip cleanly.
fn number(f: f64) -> JsonValue {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 {
        JsonValue::Number((f as i64).into())
    } else {
        serde_json::Number::from_f64(f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)
    }
}

fn arithmetic(op: &str, left: &JsonValue, right: &JsonValue) -> Result<JsonValue, ScriptError> {
    // `+` on strings concatenates
    if op == "+" && (left.is_string() || right.is_string()) {
        let stringify = |v: &JsonValue| match v {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Ok(JsonValue::String(stringify(left) + &stringify(right)));
    }

    let (l, r) = (as_number(left)?, as_number(right)?);
    let result = match op {
        "+" => l + r,
        "-" => l - r,
        "*" => l * r,
        "/" => {
            if r == 0.0 {
                return Err(ScriptError::Type("division by zero".into()));
            }
            l / r
        }
        _ => unreachable!("unknown arithmetic operator"),
    };
    Ok(number(result))
}

fn compare(op: &str, left: &JsonValue, right: &JsonValue) -> Result<bool, ScriptError> {
    match op {
        "==" | "!=" => {
            let equal = match (left.as_f64(), right.as_f64()) {
                (Some(l), Some(r)) => l == r,
                _ => left == right,
            };
            Ok(if op == "==" { equal } else { !equal })
        }
        _ => {
            let ordering = match (left, right) {
                (JsonValue::String(l), JsonValue::String(r)) => l.cmp(r),
                _ => {
                    let (l, r) = (as_number(left)?, as_number(right)?);
                    l.partial_cmp(&r)
                        .ok_or_else(|| ScriptError::Type("incomparable numbers".into()))?
                }
            };
            Ok(match op {
                "<" => ordering.is_lt(),
                "<=" => ordering.is_le(),
                ">" => ordering.is_gt(),
                ">=" => ordering.is_ge(),
                _ => unreachable!("unknown comparison operator"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ProcessDefinition;
    use serde_json::json;

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
        instance.variables.insert("x".into(), json!(4));
        instance.variables.insert("label".into(), json!("ok"));
        instance
    }

    #[test]
    fn test_arithmetic_and_precedence() {
        let instance = instance();
        assert_eq!(
            eval_expr("1 + 2 * 3", &instance, &HashMap::new()).unwrap(),
            json!(7)
        );
        assert_eq!(
            eval_expr("(1 + 2) * 3", &instance, &HashMap::new()).unwrap(),
            json!(9)
        );
        assert_eq!(
            eval_expr("x / 2", &instance, &HashMap::new()).unwrap(),
            json!(2)
        );
    }

    #[test]
    fn test_conditions() {
        let instance = instance();
        assert!(eval_condition("x >= 4 && label == 'ok'", &instance).unwrap());
        assert!(eval_condition("$Process.x < 10", &instance).unwrap());
        assert!(!eval_condition("x != 4 || label == 'nope'", &instance).unwrap());
        assert!(eval_condition("!false", &instance).unwrap());
    }

    #[test]
    fn test_unknown_variable_is_a_reference_error() {
        let instance = instance();
        let err = eval_condition("missing > 1", &instance).unwrap_err();
        assert!(matches!(
            err,
            ScriptError::Reference(ReferenceError::UnknownVariable { .. })
        ));
    }

    #[test]
    fn test_script_assignments_see_earlier_statements() {
        let instance = instance();
        let vars = run_script("a = 1\nb = a + 1; c = b * 2", &instance).unwrap();
        assert_eq!(vars.get("a"), Some(&json!(1)));
        assert_eq!(vars.get("b"), Some(&json!(2)));
        assert_eq!(vars.get("c"), Some(&json!(4)));
    }

    #[test]
    fn test_script_reads_process_scope() {
        let instance = instance();
        let vars = run_script("y = x + 1", &instance).unwrap();
        assert_eq!(vars.get("y"), Some(&json!(5)));
    }

    #[test]
    fn test_string_concat() {
        let instance = instance();
        let vars = run_script("msg = 'status: ' + label", &instance).unwrap();
        assert_eq!(vars.get("msg"), Some(&json!("status: ok")));
    }

    #[test]
    fn test_division_by_zero_fails() {
        let instance = instance();
        assert!(matches!(
            run_script("y = x / 0", &instance),
            Err(ScriptError::Type(_))
        ));
    }

    #[test]
    fn test_malformed_statement_fails() {
        let instance = instance();
        assert!(matches!(
            run_script("1 + 2", &instance),
            Err(ScriptError::Parse(_))
        ));
    }
}
