//! KS-040: AI session for the two-pass protocol.
//!
//! One [`AiSession`] is constructed per run and carried in the tool context.
//! In collect mode every AI-bearing construct registers a [`CollectionEntry`]
//! and gets a deterministic placeholder back. In apply mode the same
//! constructs resolve by exact key lookup in the supplied answers.
//!
//! The entry map is the only state shared by concurrently running steps, so
//! inserts go through a mutex.

pub mod answers;
pub mod prompt;
pub mod transport;

pub use answers::Answers;

use crate::error::AiError;
use indexmap::IndexMap;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};

const PLACEHOLDER_PREFIX: &str = "__KITSMITH_AI_";
const PLACEHOLDER_SUFFIX: &str = "__";

/// Placeholder text emitted for `key` during collection.
pub fn placeholder(key: &str) -> String {
    format!("{}{}{}", PLACEHOLDER_PREFIX, key, PLACEHOLDER_SUFFIX)
}

/// One pending "ask the AI" request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CollectionEntry {
    /// Stable key, unique within a collection pass
    pub key: String,
    pub prompt: String,
    /// Shape the answer should take
    pub output_description: Option<String>,
    /// Context snippets sent with the request
    pub contexts: Vec<String>,
    pub examples: Vec<String>,
    /// Steps or files that asked
    pub sources: Vec<String>,
}

/// Collect (pass 1) or apply (pass 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiMode {
    Collect,
    Apply,
}

/// Run-scoped AI coordinator.
#[derive(Debug)]
pub struct AiSession {
    mode: AiMode,
    entries: Mutex<IndexMap<String, CollectionEntry>>,
    answers: Answers,
}

impl AiSession {
    /// Pass 1: register requests, hand out placeholders.
    pub fn collecting() -> Self {
        Self {
            mode: AiMode::Collect,
            entries: Mutex::new(IndexMap::new()),
            answers: Answers::new(),
        }
    }

    /// Pass 2: resolve requests from `answers`.
    pub fn applying(answers: Answers) -> Self {
        Self {
            mode: AiMode::Apply,
            entries: Mutex::new(IndexMap::new()),
            answers,
        }
    }

    pub fn mode(&self) -> AiMode {
        self.mode
    }

    pub fn is_collecting(&self) -> bool {
        self.mode == AiMode::Collect
    }

    pub fn answers(&self) -> &Answers {
        &self.answers
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<String, CollectionEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register or resolve one request.
    ///
    /// Collect mode returns the placeholder. A key asked twice keeps its first
    /// prompt and accumulates provenance and context. Apply mode returns the
    /// answer or fails with [`AiError::Unanswered`].
    pub fn request(&self, entry: CollectionEntry) -> Result<String, AiError> {
        match self.mode {
            AiMode::Collect => {
                let text = placeholder(&entry.key);
                let mut entries = self.lock();
                match entries.get_mut(&entry.key) {
                    Some(existing) => {
                        if existing.prompt != entry.prompt {
                            tracing::warn!(
                                key = %entry.key,
                                "AI key requested with a different prompt; keeping the first"
                            );
                        }
                        for source in entry.sources {
                            if !existing.sources.contains(&source) {
                                existing.sources.push(source);
                            }
                        }
                        for ctx in entry.contexts {
                            if !existing.contexts.contains(&ctx) {
                                existing.contexts.push(ctx);
                            }
                        }
                    }
                    None => {
                        tracing::debug!(key = %entry.key, "collected AI request");
                        entries.insert(entry.key.clone(), entry);
                    }
                }
                Ok(text)
            }
            AiMode::Apply => {
                self.lock()
                    .entry(entry.key.clone())
                    .or_insert_with(|| entry.clone());
                self.answers
                    .get(&entry.key)
                    .cloned()
                    .ok_or(AiError::Unanswered(entry.key))
            }
        }
    }

    /// Entries in registration order.
    pub fn entries(&self) -> Vec<CollectionEntry> {
        self.lock().values().cloned().collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every registered entry.
    pub fn reset(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entry(key: &str, prompt: &str, source: &str) -> CollectionEntry {
        CollectionEntry {
            key: key.into(),
            prompt: prompt.into(),
            sources: vec![source.into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_ks040_collect_returns_placeholder() {
        let s = AiSession::collecting();
        let text = s.request(entry("fields", "List fields", "model")).unwrap();
        assert_eq!(text, "__KITSMITH_AI_fields__");
        assert_eq!(s.keys(), vec!["fields"]);
    }

    #[test]
    fn test_ks040_duplicate_key_merges_sources() {
        let s = AiSession::collecting();
        s.request(entry("fields", "List fields", "model")).unwrap();
        s.request(entry("fields", "Other", "dto")).unwrap();
        let entries = s.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].prompt, "List fields");
        assert_eq!(entries[0].sources, vec!["model", "dto"]);
    }

    #[test]
    fn test_ks040_apply_resolves_by_key() {
        let mut answers = Answers::new();
        answers.insert("fields".into(), "id: number".into());
        let s = AiSession::applying(answers);
        assert_eq!(s.request(entry("fields", "p", "m")).unwrap(), "id: number");
        let err = s.request(entry("relations", "p", "m")).unwrap_err();
        assert!(matches!(err, AiError::Unanswered(ref k) if k == "relations"));
    }

    #[test]
    fn test_ks040_sessions_are_independent() {
        let a = AiSession::collecting();
        a.request(entry("x", "p", "s")).unwrap();
        let b = AiSession::collecting();
        assert!(b.is_empty());
        a.reset();
        assert!(a.is_empty());
    }

    #[test]
    fn test_ks040_concurrent_inserts() {
        let s = Arc::new(AiSession::collecting());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let s = Arc::clone(&s);
                std::thread::spawn(move || {
                    for j in 0..25 {
                        s.request(entry(&format!("k{}_{}", i, j), "p", "t")).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(s.len(), 200);
    }
}
