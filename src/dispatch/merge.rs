//! Quarantine check and merge of structured worker output.
//!
//! Worker text is untrusted. A track whose text carries prompt-injection
//! markers, or whose structured block has the wrong shape, is quarantined and
//! contributes nothing to the merged result.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const MERGED_KEYS: [&str; 3] = ["findings", "evidence", "next_steps"];

static INJECTION_PATTERN: OnceLock<Regex> = OnceLock::new();
static FENCED_JSON: OnceLock<Regex> = OnceLock::new();

fn injection_pattern() -> &'static Regex {
    INJECTION_PATTERN.get_or_init(|| {
        Regex::new(
            r"(?ix)
            ignore\s+(all\s+)?(the\s+)?(previous|prior|above|earlier)\s+instructions
            | disregard\s+(all\s+)?(the\s+)?(previous|prior|above|system)\s+(instructions|prompt)
            | you\s+are\s+now\s+(a|an|the)\s
            | </?\s*system\s*>
            | begin\s+system\s+prompt
            | new\s+instructions\s*:
            | override\s+(your|the)\s+(rules|instructions)",
        )
        .unwrap()
    })
}

fn fenced_json() -> &'static Regex {
    FENCED_JSON.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap())
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Parsed structured block.
    Structured(Value),
    /// Plain text with no structured block; kept raw, nothing merged.
    Unstructured,
    Quarantined { reason: String },
}

impl Verdict {
    pub fn is_quarantined(&self) -> bool {
        matches!(self, Self::Quarantined { .. })
    }
}

pub fn inspect(text: &str) -> Verdict {
    if let Some(m) = injection_pattern().find(text) {
        return Verdict::Quarantined {
            reason: format!("injection marker: {}", m.as_str().trim()),
        };
    }

    let Some(block) = extract_structured(text) else {
        return Verdict::Unstructured;
    };
    for key in MERGED_KEYS {
        if let Some(value) = block.get(key)
            && !value.is_array()
        {
            return Verdict::Quarantined {
                reason: format!("'{}' is not an array", key),
            };
        }
    }
    Verdict::Structured(block)
}

/// Last fenced JSON object, or the outermost `{...}` span, that carries at
/// least one mergeable key.
fn extract_structured(text: &str) -> Option<Value> {
    let fenced = fenced_json()
        .captures_iter(text)
        .filter_map(|caps| serde_json::from_str::<Value>(&caps[1]).ok())
        .filter(has_merge_keys)
        .last();
    if fenced.is_some() {
        return fenced;
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&text[start..=end])
        .ok()
        .filter(has_merge_keys)
}

fn has_merge_keys(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|obj| MERGED_KEYS.iter().any(|k| obj.contains_key(*k)))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergedResult {
    pub findings: Vec<Value>,
    pub evidence: Vec<Value>,
    pub next_steps: Vec<Value>,
}

impl MergedResult {
    pub fn is_empty(&self) -> bool {
        self.findings.is_empty() && self.evidence.is_empty() && self.next_steps.is_empty()
    }

    /// Append a structured block's arrays, skipping exact duplicates.
    pub fn absorb(&mut self, block: &Value) {
        for (key, target) in [
            ("findings", &mut self.findings),
            ("evidence", &mut self.evidence),
            ("next_steps", &mut self.next_steps),
        ] {
            if let Some(items) = block.get(key).and_then(Value::as_array) {
                for item in items {
                    if !target.contains(item) {
                        target.push(item.clone());
                    }
                }
            }
        }
    }
}
