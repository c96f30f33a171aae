use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{DumpError, Result};

/// Per-collection masking rules loaded from the `--maskings` file.
///
/// The file is a JSON object mapping collection names to rules; the special
/// name `"*"` provides a default for collections without an explicit entry:
///
/// ```json
/// {
///   "users": { "structure": true, "data": true, "mask": ["email", "ssn"] },
///   "audit": { "data": false },
///   "*":     {}
/// }
/// ```
#[derive(Debug, Default)]
pub struct Maskings {
    rules: HashMap<String, CollectionRule>,
    default_rule: Option<CollectionRule>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectionRule {
    #[serde(default = "default_true")]
    structure: bool,
    #[serde(default = "default_true")]
    data: bool,
    /// Top-level attributes whose values are replaced in every document.
    #[serde(default)]
    mask: Vec<String>,
}

fn default_true() -> bool {
    true
}

const MASKED_VALUE: &str = "xxx";

impl Maskings {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            DumpError::Config(format!(
                "cannot read maskings file '{}': {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_str(&raw)
    }

    fn from_str(raw: &str) -> Result<Self> {
        let mut rules: HashMap<String, CollectionRule> =
            serde_json::from_str(raw).map_err(|e| {
                DumpError::Config(format!("invalid maskings definition: {e}"))
            })?;
        let default_rule = rules.remove("*");
        Ok(Maskings {
            rules,
            default_rule,
        })
    }

    fn rule(&self, collection: &str) -> Option<&CollectionRule> {
        self.rules.get(collection).or(self.default_rule.as_ref())
    }

    pub fn should_dump_structure(&self, collection: &str) -> bool {
        self.rule(collection).is_none_or(|r| r.structure)
    }

    pub fn should_dump_data(&self, collection: &str) -> bool {
        self.rule(collection).is_none_or(|r| r.data)
    }

    /// Apply the collection's masking rules to one document in place.
    pub fn mask(&self, collection: &str, doc: &mut Value) {
        let Some(rule) = self.rule(collection) else {
            return;
        };
        let Some(object) = doc.as_object_mut() else {
            return;
        };
        for attribute in &rule.mask {
            if let Some(slot) = object.get_mut(attribute) {
                *slot = Value::String(MASKED_VALUE.to_string());
            }
        }
    }
}
