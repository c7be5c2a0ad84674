//! Loads playbook documents into an immutable, ordered rule registry.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::context::{CONTEXT_FIELDS, NUMERIC_FIELDS};
use super::types::{
    PlaybookRule, RawDocument, RawRule, SUPPORTED_VERSION, TriggerClause,
};
use crate::config::PlaybookConfig;
use crate::error::{PilotError, Result};

const BUILTIN_PLAYBOOK: &str = include_str!("../../playbooks/default.yaml");
const BUILTIN_PATH: &str = "<builtin>/default.yaml";

#[derive(Debug, Clone, Default)]
pub struct PlaybookRegistry {
    base: Vec<PlaybookRule>,
    conditional: Vec<PlaybookRule>,
}

impl PlaybookRegistry {
    pub fn builtin() -> Result<Self> {
        Self::from_documents(&[(PathBuf::from(BUILTIN_PATH), BUILTIN_PLAYBOOK.to_string())])
    }

    /// Read and merge the given documents. No sources means the bundled
    /// playbook.
    pub async fn load(sources: &[PathBuf]) -> Result<Self> {
        if sources.is_empty() {
            return Self::builtin();
        }

        let mut documents = Vec::with_capacity(sources.len());
        for path in sources {
            let content = fs::read_to_string(path).await.map_err(|e| {
                PilotError::playbook(path, None, format!("cannot read file: {}", e))
            })?;
            documents.push((path.clone(), content));
        }
        Self::from_documents(&documents)
    }

    /// Parse and validate `(path, content)` pairs. Any violation fails the
    /// whole load.
    pub fn from_documents(documents: &[(PathBuf, String)]) -> Result<Self> {
        let mut registry = Self::default();
        let mut seen = HashSet::new();

        for (path, content) in documents {
            let doc = parse_document(path, content)?;
            if doc.version != SUPPORTED_VERSION {
                return Err(PilotError::playbook(
                    path,
                    None,
                    format!(
                        "unsupported version {} (expected {})",
                        doc.version, SUPPORTED_VERSION
                    ),
                ));
            }
            for raw in doc.rules {
                registry.base.push(validate_rule(path, raw, &mut seen)?);
            }
            for raw in doc.conditional_rules {
                registry.conditional.push(validate_rule(path, raw, &mut seen)?);
            }
            debug!(path = %path.display(), "Loaded playbook document");
        }

        registry.base.sort_by(|a, b| (a.order, &a.id).cmp(&(b.order, &b.id)));
        registry
            .conditional
            .sort_by(|a, b| (a.order, &a.id).cmp(&(b.order, &b.id)));

        info!(
            base = registry.base.len(),
            conditional = registry.conditional.len(),
            "Playbook registry loaded"
        );
        Ok(registry)
    }

    pub fn base_rules(&self) -> &[PlaybookRule] {
        &self.base
    }

    pub fn conditional_rules(&self) -> &[PlaybookRule] {
        &self.conditional
    }

    /// Evaluation order: conditional rules, then base rules.
    pub fn rules_in_precedence(&self) -> impl Iterator<Item = &PlaybookRule> {
        self.conditional.iter().chain(self.base.iter())
    }

    pub fn get(&self, id: &str) -> Option<&PlaybookRule> {
        self.rules_in_precedence().find(|rule| rule.id == id)
    }

    pub fn len(&self) -> usize {
        self.base.len() + self.conditional.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Loads the registry once and hands out shared references afterwards.
pub struct PlaybookCache {
    sources: Vec<PathBuf>,
    cell: OnceCell<Arc<PlaybookRegistry>>,
}

impl PlaybookCache {
    pub fn new(config: &PlaybookConfig) -> Self {
        Self {
            sources: config.sources.clone(),
            cell: OnceCell::new(),
        }
    }

    pub async fn get(&self) -> Result<Arc<PlaybookRegistry>> {
        self.cell
            .get_or_try_init(|| async { PlaybookRegistry::load(&self.sources).await.map(Arc::new) })
            .await
            .map(Arc::clone)
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }
}

/// YAML first, then JSON with comments stripped.
fn parse_document(path: &Path, content: &str) -> Result<RawDocument> {
    let yaml_err = match serde_yaml_bw::from_str::<RawDocument>(content) {
        Ok(doc) => return Ok(doc),
        Err(e) => e,
    };
    match serde_json::from_str::<RawDocument>(&strip_json_comments(content)) {
        Ok(doc) => Ok(doc),
        Err(json_err) => Err(PilotError::playbook(
            path,
            None,
            format!("not a valid playbook (yaml: {}; json: {})", yaml_err, json_err),
        )),
    }
}

fn validate_rule(path: &Path, raw: RawRule, seen: &mut HashSet<String>) -> Result<PlaybookRule> {
    let id = raw.id.trim().to_string();
    if id.is_empty() {
        return Err(PilotError::playbook(path, None, "rule is missing an id"));
    }
    let fail = |msg: String| PilotError::playbook(path, Some(&id), msg);

    if !seen.insert(id.clone()) {
        return Err(fail("duplicate rule id".to_string()));
    }

    let description: Vec<String> = raw
        .description
        .into_vec()
        .into_iter()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect();
    if description.is_empty() {
        return Err(fail("description must have at least one line".to_string()));
    }

    if raw.mandatory_next_action.is_empty() {
        return Err(fail(
            "mandatory_next_action needs a tool or a route".to_string(),
        ));
    }

    let mut trigger = Vec::new();
    if let Some(pattern) = raw.trigger.pattern {
        trigger.push(TriggerClause::Pattern {
            modes: pattern.modes,
            targets: pattern.targets,
        });
    }
    for clause in raw.trigger.equals {
        if !CONTEXT_FIELDS.contains(&clause.field.as_str()) {
            return Err(fail(format!("unknown field '{}' in equals", clause.field)));
        }
        trigger.push(TriggerClause::Equals {
            field: clause.field,
            value: clause.value,
        });
    }
    for clause in raw.trigger.counters {
        if !NUMERIC_FIELDS.contains(&clause.field.as_str()) {
            return Err(fail(format!(
                "unknown counter field '{}'",
                clause.field
            )));
        }
        let bounds = clause.bounds();
        if bounds.is_empty() {
            return Err(fail(format!(
                "threshold on '{}' has no comparator",
                clause.field
            )));
        }
        trigger.push(TriggerClause::Threshold {
            field: clause.field,
            bounds,
        });
    }

    Ok(PlaybookRule {
        id,
        order: raw.order,
        description,
        trigger,
        state_hint: raw.state_hint,
        action: raw.mandatory_next_action,
        source: path.to_path_buf(),
    })
}

/// Drop `//` and `/* */` comments outside string literals.
fn strip_json_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                }
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match (c, chars.peek()) {
            ('"', _) => {
                in_string = true;
                out.push(c);
            }
            ('/', Some('/')) => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            _ => out.push(c),
        }
    }
    out
}
