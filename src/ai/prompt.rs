//! KS-042: Consolidated prompt assembly.
//!
//! All pending requests become one document, grouped by key, followed by the
//! JSON shape the answer must take.

use super::CollectionEntry;
use crate::core::template;
use crate::error::AiError;
use serde_json::json;
use std::fmt::Write;
use std::path::Path;

/// System instructions sent ahead of the consolidated request.
pub const SYSTEM_INSTRUCTIONS: &str = "You generate source code fragments for a code generator. \
Answer every request. Reply with a single JSON object whose keys are exactly the request keys \
and whose values are strings containing only the requested output, with no commentary.";

/// Render the request section: one block per key.
pub fn render_requests(entries: &[CollectionEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        let _ = writeln!(out, "## Request: {}", entry.key);
        if !entry.sources.is_empty() {
            let _ = writeln!(out, "Requested by: {}", entry.sources.join(", "));
        }
        out.push('\n');

        if !entry.contexts.is_empty() {
            out.push_str("### Context\n\n");
            for ctx in &entry.contexts {
                let _ = writeln!(out, "{}\n", ctx.trim_end());
            }
        }

        out.push_str("### Instructions\n\n");
        let _ = writeln!(out, "{}\n", entry.prompt.trim());

        if let Some(ref shape) = entry.output_description {
            out.push_str("### Expected output\n\n");
            let _ = writeln!(out, "{}\n", shape.trim());
        }

        if !entry.examples.is_empty() {
            out.push_str("### Examples\n\n");
            for example in &entry.examples {
                let _ = writeln!(out, "```\n{}\n```\n", example.trim_end());
            }
        }
    }
    out
}

/// Describe the JSON response: one string per key.
pub fn response_shape(keys: &[String]) -> String {
    let shape: serde_json::Map<String, serde_json::Value> = keys
        .iter()
        .map(|k| (k.clone(), json!("<string>")))
        .collect();
    serde_json::to_string_pretty(&shape).unwrap_or_default()
}

/// The full consolidated prompt with the default layout.
pub fn assemble(entries: &[CollectionEntry]) -> String {
    let keys: Vec<String> = entries.iter().map(|e| e.key.clone()).collect();
    let mut out = String::new();
    let _ = writeln!(
        out,
        "# AI requests ({})\n\n{}\n",
        entries.len(),
        SYSTEM_INSTRUCTIONS
    );
    out.push_str(&render_requests(entries));
    out.push_str("## Response format\n\nRespond with JSON only:\n\n");
    out.push_str(&response_shape(&keys));
    out.push('\n');
    out
}

/// Render a custom prompt template. Available placeholders:
/// `{{ requests }}`, `{{ response_shape }}`, `{{ keys }}`, `{{ count }}`,
/// `{{ instructions }}`.
pub fn assemble_with_template(
    path: &Path,
    entries: &[CollectionEntry],
) -> Result<String, AiError> {
    if !path.is_file() {
        return Err(AiError::PromptTemplateNotFound(path.to_path_buf()));
    }
    let source = std::fs::read_to_string(path).map_err(|e| AiError::Read {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let keys: Vec<String> = entries.iter().map(|e| e.key.clone()).collect();
    let vars = json!({
        "requests": render_requests(entries),
        "response_shape": response_shape(&keys),
        "keys": keys.join(", "),
        "count": entries.len(),
        "instructions": SYSTEM_INSTRUCTIONS,
    });
    template::interpolate(&source, &vars).map_err(|message| AiError::Read {
        path: path.to_path_buf(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<CollectionEntry> {
        vec![
            CollectionEntry {
                key: "fields".into(),
                prompt: "List the fields of User".into(),
                output_description: Some("TypeScript interface members".into()),
                contexts: vec!["// src/models/post.ts\nexport interface Post {}".into()],
                examples: vec!["id: string;".into()],
                sources: vec!["model".into()],
            },
            CollectionEntry {
                key: "relations".into(),
                prompt: "List relations".into(),
                ..Default::default()
            },
        ]
    }

    #[test]
    fn test_ks042_assemble_groups_by_key() {
        let p = assemble(&entries());
        let fields = p.find("## Request: fields").unwrap();
        let relations = p.find("## Request: relations").unwrap();
        assert!(fields < relations);
        assert!(p.contains("Requested by: model"));
        assert!(p.contains("### Expected output\n\nTypeScript interface members"));
        assert!(p.contains("export interface Post"));
        assert!(p.contains("```\nid: string;\n```"));
    }

    #[test]
    fn test_ks042_response_shape_lists_keys() {
        let p = assemble(&entries());
        let tail = &p[p.find("## Response format").unwrap()..];
        assert!(tail.contains("\"fields\": \"<string>\""));
        assert!(tail.contains("\"relations\": \"<string>\""));
    }

    #[test]
    fn test_ks042_custom_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompt.md");
        std::fs::write(&path, "Keys: {{ keys }}\n{{ requests }}\n{{ response_shape }}").unwrap();
        let p = assemble_with_template(&path, &entries()).unwrap();
        assert!(p.starts_with("Keys: fields, relations\n## Request: fields"));
    }

    #[test]
    fn test_ks042_custom_template_missing() {
        let err = assemble_with_template(Path::new("/nonexistent/prompt.md"), &entries())
            .unwrap_err();
        assert!(matches!(err, AiError::PromptTemplateNotFound(_)));
        assert!(err.to_string().contains("/nonexistent/prompt.md"));
    }
}
