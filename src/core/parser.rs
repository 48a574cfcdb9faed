//! KS-002: Recipe loading and variable resolution.
//!
//! Parses recipe YAML into a [`Recipe`] and resolves declared variables against
//! caller-provided values:
//! - Defaults fill in missing values
//! - Missing required variables are reported
//! - Values are type-checked (string inputs are coerced for number/boolean)
//! - `validation` constraints (pattern, min, max, choices) are enforced
//!
//! Every problem is collected; nothing short-circuits on the first error.

use super::types::*;
use regex::Regex;
use serde_json::{Map, Value};
use std::path::Path;

/// Load a recipe from a YAML file. `source_dir` is set to the file's directory.
pub fn load_recipe(path: &Path) -> Result<Recipe, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read recipe {}: {}", path.display(), e))?;
    let mut recipe = parse_recipe(&content)?;
    recipe.source_dir = path.parent().map(Path::to_path_buf);
    Ok(recipe)
}

/// Parse a recipe from a YAML string.
pub fn parse_recipe(yaml: &str) -> Result<Recipe, String> {
    serde_yaml_ng::from_str(yaml).map_err(|e| format!("recipe parse error: {}", e))
}

/// Validate the variable declarations themselves (independent of values).
pub fn validate_declarations(recipe: &Recipe) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    for (name, decl) in &recipe.variables {
        if let Some(ref v) = decl.validation {
            if let Some(ref pattern) = v.pattern {
                if let Err(e) = Regex::new(pattern) {
                    issues.push(invalid(name, format!("has invalid pattern: {}", e)));
                }
            }
            if let (Some(min), Some(max)) = (v.min, v.max) {
                if min > max {
                    issues.push(invalid(name, format!("has min {} > max {}", min, max)));
                }
            }
        }
        if decl.var_type == VariableType::Enum && choices(decl).is_empty() {
            issues.push(invalid(name, "is an enum without choices".to_string()));
        }
        if let Some(ref default) = decl.default {
            if let Err(e) = check_value(name, decl, default) {
                issues.push(invalid(name, format!("has an invalid default: {}", e)));
            }
        }
    }
    issues
}

/// Resolve the variable context for a run.
///
/// Undeclared provided values pass through untouched.
pub fn resolve_variables(
    recipe: &Recipe,
    provided: &Map<String, Value>,
) -> Result<Map<String, Value>, Vec<ValidationIssue>> {
    let mut resolved = provided.clone();
    let mut issues = Vec::new();

    for (name, decl) in &recipe.variables {
        let value = match provided.get(name).or(decl.default.as_ref()) {
            Some(v) => v,
            None => {
                if decl.required {
                    issues.push(ValidationIssue::new(
                        IssueCode::MissingVariable,
                        None,
                        format!(
                            "recipe '{}' requires variable '{}' (type: {})",
                            recipe.name, name, decl.var_type
                        ),
                    ));
                }
                continue;
            }
        };
        match check_value(name, decl, value) {
            Ok(v) => {
                resolved.insert(name.clone(), v);
            }
            Err(e) => issues.push(invalid(name, e)),
        }
    }

    if issues.is_empty() {
        Ok(resolved)
    } else {
        Err(issues)
    }
}

fn invalid(name: &str, message: String) -> ValidationIssue {
    ValidationIssue::new(
        IssueCode::InvalidVariable,
        None,
        format!("variable '{}' {}", name, message),
    )
}

fn choices(decl: &VariableDecl) -> &[Value] {
    decl.validation
        .as_ref()
        .map(|v| v.choices.as_slice())
        .unwrap_or(&[])
}

/// Type-check and coerce a single value against its declaration.
fn check_value(name: &str, decl: &VariableDecl, value: &Value) -> Result<Value, String> {
    let value = coerce(decl.var_type, value)
        .ok_or_else(|| format!("'{}' must be of type {}", name, decl.var_type))?;

    let Some(ref rules) = decl.validation else {
        return Ok(value);
    };

    if !rules.choices.is_empty() && !rules.choices.contains(&value) {
        let allowed: Vec<String> = rules.choices.iter().map(value_to_string).collect();
        return Err(format!("'{}' must be one of: {}", name, allowed.join(", ")));
    }

    if let Some(ref pattern) = rules.pattern {
        if let Value::String(ref s) = value {
            let re = Regex::new(pattern).map_err(|e| format!("invalid pattern: {}", e))?;
            if !re.is_match(s) {
                return Err(format!("'{}' does not match pattern {}", name, pattern));
            }
        }
    }

    let measure = match value {
        Value::Number(ref n) => n.as_f64(),
        Value::String(ref s) => Some(s.chars().count() as f64),
        Value::Array(ref a) => Some(a.len() as f64),
        _ => None,
    };
    if let Some(m) = measure {
        if let Some(min) = rules.min {
            if m < min {
                return Err(format!("'{}' must be >= {}", name, min));
            }
        }
        if let Some(max) = rules.max {
            if m > max {
                return Err(format!("'{}' must be <= {}", name, max));
            }
        }
    }

    Ok(value)
}

/// Coerce a value to a declared type. Strings coming from the command line
/// are accepted for numbers and booleans.
fn coerce(var_type: VariableType, value: &Value) -> Option<Value> {
    match (var_type, value) {
        (VariableType::String | VariableType::Enum, Value::String(_)) => Some(value.clone()),
        (VariableType::String, Value::Number(n)) => Some(Value::String(n.to_string())),
        (VariableType::Enum, Value::Number(_) | Value::Bool(_)) => Some(value.clone()),
        (VariableType::Number, Value::Number(_)) => Some(value.clone()),
        (VariableType::Number, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(|f| {
                if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                    Some(Value::from(f as i64))
                } else {
                    serde_json::Number::from_f64(f).map(Value::Number)
                }
            }),
        (VariableType::Boolean, Value::Bool(_)) => Some(value.clone()),
        (VariableType::Boolean, Value::String(s)) => match s.as_str() {
            "true" | "yes" | "1" => Some(Value::Bool(true)),
            "false" | "no" | "0" => Some(Value::Bool(false)),
            _ => None,
        },
        (VariableType::Array, Value::Array(_)) => Some(value.clone()),
        (VariableType::Array, Value::String(s)) => Some(Value::Array(
            s.split(',')
                .map(|p| Value::String(p.trim().to_string()))
                .filter(|v| v.as_str() != Some(""))
                .collect(),
        )),
        (VariableType::Object, Value::Object(_)) => Some(value.clone()),
        _ => None,
    }
}

/// Render a JSON value the way it should appear inside generated text.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Parse a `key=value` command-line assignment. Values that parse as JSON
/// (numbers, booleans, arrays, objects) keep their type; anything else is a string.
pub fn parse_assignment(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty variable name in '{}'", raw));
    }
    let value = match serde_json::from_str::<Value>(value) {
        Ok(v @ (Value::Number(_) | Value::Bool(_) | Value::Array(_) | Value::Object(_))) => v,
        _ => Value::String(value.to_string()),
    };
    Ok((key.to_string(), value))
}

/// Check that required recipe dependencies can be found relative to `base_dir`.
pub fn check_dependencies(recipe: &Recipe, base_dir: &Path) -> Vec<ValidationIssue> {
    recipe
        .dependencies
        .iter()
        .filter(|d| !d.optional)
        .filter_map(|d| d.recipe.as_deref())
        .filter(|r| !base_dir.join(r).exists())
        .map(|r| {
            ValidationIssue::new(
                IssueCode::MissingRecipeDependency,
                None,
                format!("recipe '{}' requires recipe '{}' which was not found", recipe.name, r),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const RECIPE_YAML: &str = r#"
name: crud-module
version: "1.2"
description: "Generates a CRUD module"
variables:
  name:
    type: string
    required: true
    validation:
      pattern: "^[a-z][a-z0-9_]*$"
  port:
    type: number
    default: 3000
    validation:
      min: 1024
      max: 65535
  style:
    type: enum
    default: rest
    validation:
      choices: [rest, graphql]
  tests:
    type: boolean
    default: true
steps:
  - name: scaffold
    tool: ensure-dirs
    paths: ["src/{{ name }}"]
"#;

    fn recipe() -> Recipe {
        parse_recipe(RECIPE_YAML).unwrap()
    }

    #[test]
    fn test_ks002_parse_recipe() {
        let r = recipe();
        assert_eq!(r.name, "crud-module");
        assert_eq!(r.version.as_deref(), Some("1.2"));
        assert_eq!(r.variables.len(), 4);
        assert_eq!(r.steps.len(), 1);
        assert!(validate_declarations(&r).is_empty());
    }

    #[test]
    fn test_ks002_resolve_defaults() {
        let mut provided = Map::new();
        provided.insert("name".into(), json!("users"));
        let vars = resolve_variables(&recipe(), &provided).unwrap();
        assert_eq!(vars["name"], json!("users"));
        assert_eq!(vars["port"], json!(3000));
        assert_eq!(vars["style"], json!("rest"));
        assert_eq!(vars["tests"], json!(true));
    }

    #[test]
    fn test_ks002_missing_required() {
        let issues = resolve_variables(&recipe(), &Map::new()).unwrap_err();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, IssueCode::MissingVariable);
        assert!(issues[0].message.contains("'name'"));
    }

    #[test]
    fn test_ks002_collects_all_variable_errors() {
        let mut provided = Map::new();
        provided.insert("name".into(), json!("Bad-Name"));
        provided.insert("port".into(), json!(80));
        provided.insert("style".into(), json!("soap"));
        let issues = resolve_variables(&recipe(), &provided).unwrap_err();
        assert_eq!(issues.len(), 3);
        assert!(issues.iter().all(|i| i.code == IssueCode::InvalidVariable));
    }

    #[test]
    fn test_ks002_coerces_cli_strings() {
        let mut provided = Map::new();
        provided.insert("name".into(), json!("orders"));
        provided.insert("port".into(), json!("8080"));
        provided.insert("tests".into(), json!("no"));
        let vars = resolve_variables(&recipe(), &provided).unwrap();
        assert_eq!(vars["port"], json!(8080));
        assert_eq!(vars["tests"], json!(false));
    }

    #[test]
    fn test_ks002_undeclared_pass_through() {
        let mut provided = Map::new();
        provided.insert("name".into(), json!("a"));
        provided.insert("extra".into(), json!({"k": 1}));
        let vars = resolve_variables(&recipe(), &provided).unwrap();
        assert_eq!(vars["extra"], json!({"k": 1}));
    }

    #[test]
    fn test_ks002_invalid_declarations() {
        let yaml = r#"
name: broken
variables:
  a:
    type: enum
  b:
    validation:
      pattern: "(unclosed"
  c:
    type: number
    default: "not a number"
"#;
        let issues = validate_declarations(&parse_recipe(yaml).unwrap());
        assert_eq!(issues.len(), 3);
    }

    #[test]
    fn test_ks002_parse_assignment() {
        assert_eq!(parse_assignment("name=users").unwrap(), ("name".into(), json!("users")));
        assert_eq!(parse_assignment("port=8080").unwrap(), ("port".into(), json!(8080)));
        assert_eq!(parse_assignment("flag=true").unwrap(), ("flag".into(), json!(true)));
        assert_eq!(parse_assignment("s=a=b").unwrap(), ("s".into(), json!("a=b")));
        assert!(parse_assignment("novalue").is_err());
        assert!(parse_assignment("=x").is_err());
    }

    #[test]
    fn test_ks002_check_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("base.yml"), "name: base\n").unwrap();
        let yaml = r#"
name: app
dependencies:
  - recipe: base.yml
  - recipe: missing.yml
  - recipe: optional.yml
    optional: true
  - package: left-pad
"#;
        let issues = check_dependencies(&parse_recipe(yaml).unwrap(), dir.path());
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.contains("missing.yml"));
    }

    #[test]
    fn test_ks002_load_sets_source_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recipe.yml");
        std::fs::write(&path, "name: x\nsteps: []\n").unwrap();
        let r = load_recipe(&path).unwrap();
        assert_eq!(r.source_dir.as_deref(), Some(dir.path()));
    }
}
