//! KS-009: Variable interpolation and the built-in template renderer.
//!
//! `{{ expr }}` placeholders are evaluated with the condition grammar
//! (so `{{ name }}`, `{{ model.fields[0] }}` and `{{ title || name }}` all work)
//! and may be followed by case filters: `{{ name | pascal }}`.
//!
//! The built-in [`BasicRenderer`] adds two things on top of interpolation:
//! an optional YAML front-matter block (`to:` names the output path) and inline
//! AI directives, `{{ ai key="fields" prompt="..." output="..." }}`, which are
//! routed through the run's [`AiSession`].

use super::condition;
use super::parser::value_to_string;
use crate::ai::{AiSession, CollectionEntry};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

/// Resolve every `{{ ... }}` placeholder in a string.
pub fn interpolate(template: &str, vars: &Value) -> Result<String, String> {
    let mut result = template.to_string();
    let mut start = 0;

    while let Some(open) = result[start..].find("{{") {
        let open = start + open;
        let close = result[open..]
            .find("}}")
            .ok_or_else(|| format!("unclosed template at position {}", open))?;
        let close = open + close + 2;
        let inner = result[open + 2..close - 2].trim().to_string();

        let value = render_expression(&inner, vars)?;
        result.replace_range(open..close, &value);
        start = open + value.len();
    }

    Ok(result)
}

/// Recursively interpolate every string inside a JSON value, object keys
/// included.
pub fn interpolate_value(value: &Value, vars: &Value) -> Result<Value, String> {
    Ok(match value {
        Value::String(s) => Value::String(interpolate(s, vars)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| interpolate_value(v, vars))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(interpolate(k, vars)?, interpolate_value(v, vars)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

fn render_expression(inner: &str, vars: &Value) -> Result<String, String> {
    let mut parts = split_filters(inner).into_iter();
    let expr = parts.next().unwrap_or_default();
    let value = condition::evaluate_value(expr.trim(), vars)
        .map_err(|e| format!("in '{{{{ {} }}}}': {}", inner, e))?;
    if value.is_null() {
        return Err(format!("unknown variable: {}", expr.trim()));
    }
    let mut text = value_to_string(&value);
    for filter in parts {
        text = apply_filter(filter.trim(), &text)?;
    }
    Ok(text)
}

/// Split on single `|` (outside quotes), leaving `||` to the expression.
fn split_filters(inner: &str) -> Vec<&str> {
    let bytes = inner.as_bytes();
    let mut parts = Vec::new();
    let mut quote: Option<u8> = None;
    let mut last = 0;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    i += 2;
                    continue;
                }
                parts.push(&inner[last..i]);
                last = i + 1;
            }
            None => {}
        }
        i += 1;
    }
    parts.push(&inner[last..]);
    parts
}

fn words(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in s.chars() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            out.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn capitalize(w: &str) -> String {
    let mut chars = w.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn apply_filter(filter: &str, text: &str) -> Result<String, String> {
    Ok(match filter {
        "upper" => text.to_uppercase(),
        "lower" => text.to_lowercase(),
        "trim" => text.trim().to_string(),
        "capitalize" => capitalize(text),
        "pascal" => words(text).iter().map(|w| capitalize(w)).collect(),
        "camel" => {
            let w = words(text);
            w.iter()
                .enumerate()
                .map(|(i, w)| if i == 0 { w.clone() } else { capitalize(w) })
                .collect()
        }
        "snake" => words(text).join("_"),
        "kebab" => words(text).join("-"),
        "constant" => words(text).join("_").to_uppercase(),
        other => return Err(format!("unknown filter: {}", other)),
    })
}

// ============================================================================
// Renderer
// ============================================================================

/// Output of rendering one template.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rendered {
    pub body: String,
    /// Output path from front-matter `to:`
    pub to: Option<String>,
    /// Remaining front-matter attributes
    pub attributes: Map<String, Value>,
}

/// Template rendering capability used by the `template` tool.
pub trait Renderer: Send + Sync {
    /// Render template source text against variables. AI-bearing constructs
    /// go through `ai` (collect: placeholder, apply: answer) and are attributed
    /// to `origin`.
    fn render(
        &self,
        source: &str,
        vars: &Value,
        ai: &AiSession,
        origin: &str,
    ) -> Result<Rendered, String>;
}

/// Front-matter + interpolation + inline AI directives.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicRenderer;

static AI_DIRECTIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*ai\s+((?:[A-Za-z_]+\s*=\s*(?:'[^']*'|\x22[^\x22]*\x22)\s*)+)\}\}")
        .expect("static regex")
});

static DIRECTIVE_ARGS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([A-Za-z_]+)\s*=\s*(?:'([^']*)'|\x22([^\x22]*)\x22)").expect("static regex")
});

/// Split `---\n<yaml>\n---\n<body>` into (front-matter, body).
fn split_front_matter(source: &str) -> (Option<&str>, &str) {
    let Some(rest) = source
        .strip_prefix("---\n")
        .or_else(|| source.strip_prefix("---\r\n"))
    else {
        return (None, source);
    };
    match rest.find("\n---") {
        Some(end) => {
            let after = &rest[end + 4..];
            let body = after
                .strip_prefix("\r\n")
                .or_else(|| after.strip_prefix('\n'))
                .unwrap_or(after);
            (Some(&rest[..end + 1]), body)
        }
        None => (None, source),
    }
}

fn sentinel(index: usize) -> String {
    format!("\u{0}ai{}\u{0}", index)
}

impl BasicRenderer {
    /// Swap each AI directive for a sentinel so resolved text is never
    /// interpolated. Returns the body and the text for each sentinel.
    fn resolve_ai(
        &self,
        source: &str,
        vars: &Value,
        ai: &AiSession,
        origin: &str,
    ) -> Result<(String, Vec<String>), String> {
        let mut resolved = Vec::new();
        let mut out = String::with_capacity(source.len());
        let mut last = 0;
        for caps in AI_DIRECTIVE.captures_iter(source) {
            let whole = caps.get(0).ok_or("regex match without span")?;
            let mut args: Map<String, Value> = Map::new();
            for arg in DIRECTIVE_ARGS.captures_iter(&caps[1]) {
                let raw = arg.get(2).or_else(|| arg.get(3)).map_or("", |m| m.as_str());
                args.insert(arg[1].to_string(), Value::String(interpolate(raw, vars)?));
            }
            let text = |k: &str| args.get(k).and_then(Value::as_str).map(str::to_string);
            let key = text("key").ok_or("ai directive requires key=\"...\"")?;
            let prompt = text("prompt").ok_or("ai directive requires prompt=\"...\"")?;
            let entry = CollectionEntry {
                key,
                prompt,
                output_description: text("output"),
                contexts: text("context").into_iter().collect(),
                examples: text("example").into_iter().collect(),
                sources: vec![origin.to_string()],
            };
            out.push_str(&source[last..whole.start()]);
            out.push_str(&sentinel(resolved.len()));
            resolved.push(ai.request(entry).map_err(|e| e.to_string())?);
            last = whole.end();
        }
        out.push_str(&source[last..]);
        Ok((out, resolved))
    }
}

impl Renderer for BasicRenderer {
    fn render(
        &self,
        source: &str,
        vars: &Value,
        ai: &AiSession,
        origin: &str,
    ) -> Result<Rendered, String> {
        let (front, body) = split_front_matter(source);

        let mut attributes = Map::new();
        if let Some(front) = front {
            let raw: Value = serde_yaml_ng::from_str(front)
                .map_err(|e| format!("front-matter parse error: {}", e))?;
            if let Value::Object(map) = interpolate_value(&raw, vars)? {
                attributes = map;
            }
        }
        let to = attributes
            .remove("to")
            .and_then(|v| v.as_str().map(str::to_string));

        let (body, resolved) = self.resolve_ai(body, vars, ai, origin)?;
        let mut body = interpolate(&body, vars)?;
        for (i, text) in resolved.iter().enumerate() {
            body = body.replace(&sentinel(i), text);
        }
        Ok(Rendered {
            body,
            to,
            attributes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::Answers;
    use serde_json::json;

    fn vars() -> Value {
        json!({"name": "userProfile", "count": 2, "model": {"fields": ["id", "email"]}})
    }

    #[test]
    fn test_ks009_interpolate_simple() {
        assert_eq!(interpolate("hello {{ name }}", &vars()).unwrap(), "hello userProfile");
        assert_eq!(interpolate("{{count}} items", &vars()).unwrap(), "2 items");
        assert_eq!(interpolate("{{ model.fields[1] }}", &vars()).unwrap(), "email");
    }

    #[test]
    fn test_ks009_interpolate_unknown_and_unclosed() {
        let err = interpolate("{{ missing }}", &vars()).unwrap_err();
        assert!(err.contains("unknown variable"));
        assert!(interpolate("{{ name", &vars()).unwrap_err().contains("unclosed"));
    }

    #[test]
    fn test_ks009_default_with_or() {
        assert_eq!(interpolate("{{ missing || 'fallback' }}", &vars()).unwrap(), "fallback");
    }

    #[test]
    fn test_ks009_filters() {
        let v = vars();
        assert_eq!(interpolate("{{ name | pascal }}", &v).unwrap(), "UserProfile");
        assert_eq!(interpolate("{{ name | snake }}", &v).unwrap(), "user_profile");
        assert_eq!(interpolate("{{ name | kebab }}", &v).unwrap(), "user-profile");
        assert_eq!(interpolate("{{ name | constant }}", &v).unwrap(), "USER_PROFILE");
        assert_eq!(interpolate("{{ 'some-thing' | camel }}", &v).unwrap(), "someThing");
        assert!(interpolate("{{ name | shout }}", &v).is_err());
    }

    #[test]
    fn test_ks009_interpolate_value_recursive() {
        let input = json!({"path": "src/{{ name }}.ts", "list": ["{{ count }}"], "n": 1});
        let out = interpolate_value(&input, &vars()).unwrap();
        assert_eq!(out, json!({"path": "src/userProfile.ts", "list": ["2"], "n": 1}));
    }

    #[test]
    fn test_ks009_interpolate_value_keys() {
        let input = json!({"scripts": {"gen:{{ name }}": "run {{ name }}"}});
        let out = interpolate_value(&input, &vars()).unwrap();
        assert_eq!(out, json!({"scripts": {"gen:userProfile": "run userProfile"}}));
    }

    #[test]
    fn test_ks009_render_front_matter() {
        let src = "---\nto: src/{{ name | kebab }}.ts\nforce: true\n---\nexport const {{ name }} = 1;\n";
        let out = BasicRenderer
            .render(src, &vars(), &AiSession::collecting(), "t")
            .unwrap();
        assert_eq!(out.to.as_deref(), Some("src/user-profile.ts"));
        assert_eq!(out.attributes["force"], json!(true));
        assert_eq!(out.body, "export const userProfile = 1;\n");
    }

    #[test]
    fn test_ks009_render_without_front_matter() {
        let out = BasicRenderer
            .render("plain {{ count }}", &vars(), &AiSession::collecting(), "t")
            .unwrap();
        assert_eq!(out.to, None);
        assert_eq!(out.body, "plain 2");
    }

    #[test]
    fn test_ks009_render_ai_collect_then_apply() {
        let src = "interface {{ name | pascal }} {\n{{ ai key=\"fields\" prompt=\"List fields of {{ name }}\" output=\"TS members\" }}\n}\n";
        let session = AiSession::collecting();
        let pass1 = BasicRenderer
            .render(src, &vars(), &session, "model.ts")
            .unwrap();
        assert!(pass1.body.contains("__KITSMITH_AI_fields__"));
        let entries = session.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].prompt, "List fields of userProfile");
        assert_eq!(entries[0].output_description.as_deref(), Some("TS members"));
        assert_eq!(entries[0].sources, vec!["model.ts"]);

        let mut answers = Answers::new();
        answers.insert("fields".into(), "  id: string;".into());
        let pass2 = BasicRenderer
            .render(src, &vars(), &AiSession::applying(answers), "model.ts")
            .unwrap();
        assert_eq!(pass2.body, "interface UserProfile {\n  id: string;\n}\n");
    }

    #[test]
    fn test_ks009_answer_text_not_interpolated() {
        let mut answers = Answers::new();
        answers.insert("body".into(), "{{ not_a_var }}".into());
        let out = BasicRenderer
            .render(
                "{{ ai key='body' prompt='p' }}",
                &vars(),
                &AiSession::applying(answers),
                "t",
            )
            .unwrap();
        assert_eq!(out.body, "{{ not_a_var }}");
    }
}
