use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fields the extractor refuses to leave weak after pass 1. These drive the
/// decision to issue the second refinement pass.
pub const CRITICAL_FIELDS: [&str; 20] = [
    "dress_identity",
    "dress_reproduction_checklist",
    "embroidery",
    "beadwork",
    "embellishments",
    "special_design_features",
    "micro_details",
    "design_dna",
    "border_design",
    "neckline",
    "sleeves",
    "bodice",
    "pattern",
    "pattern_details",
    "structural_details",
    "buttons",
    "closures",
    "jewelry_pieces",
    "jewelry_reproduction_checklist",
    "reproduction_notes",
];

/// Structured description of a reference image, as returned by the analysis
/// service. The accepted shape is deliberately permissive: a fixed set of
/// recognized field names plus any extra fields the service decides to emit.
///
/// Field order is preserved so serialized output matches what the service
/// produced. Created once per source image; read-mostly afterwards.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DescriptionDocument {
    fields: Map<String, Value>,
}

impl DescriptionDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Parses service output as a JSON object, tolerating surrounding
    /// Markdown code fences. Anything that is not a JSON object is an error.
    pub fn parse(raw: &str) -> Result<Self> {
        let stripped = strip_code_fences(raw);
        let value: Value =
            serde_json::from_str(stripped).context("description is not valid JSON")?;
        let Value::Object(fields) = value else {
            bail!("description must be a JSON object");
        };
        Ok(Self { fields })
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The field as a string, or `None` when absent, weak, or not a string.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        match self.fields.get(name) {
            Some(value @ Value::String(text)) if !is_weak_value(value) => Some(text.as_str()),
            _ => None,
        }
    }

    pub fn field_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.field_str(name).unwrap_or(default)
    }

    pub fn is_field_weak(&self, name: &str) -> bool {
        self.fields.get(name).map_or(true, is_weak_value)
    }

    /// Critical fields that are absent or weak, in declaration order.
    pub fn weak_critical_fields(&self) -> Vec<&'static str> {
        CRITICAL_FIELDS
            .iter()
            .copied()
            .filter(|field| self.is_field_weak(field))
            .collect()
    }

    /// Merges a second-pass document into this one. A pass-2 value is
    /// adopted only if it is non-weak and either the existing value is
    /// absent/weak, or both values are strings and the pass-2 string is
    /// strictly longer. Everything else is discarded, so a populated field
    /// can never regress to a weak value. Returns the adopted field names.
    pub fn merge_from(&mut self, incoming: &DescriptionDocument) -> Vec<String> {
        let mut adopted = Vec::new();
        for (key, value) in incoming.fields() {
            if is_weak_value(value) {
                continue;
            }
            let adopt = match self.fields.get(key) {
                None => true,
                Some(existing) if is_weak_value(existing) => true,
                Some(Value::String(existing)) => match value {
                    Value::String(candidate) => {
                        candidate.chars().count() > existing.chars().count()
                    }
                    _ => false,
                },
                Some(_) => false,
            };
            if adopt {
                self.fields.insert(key.clone(), value.clone());
                adopted.push(key.clone());
            }
        }
        adopted
    }

    pub fn to_string_pretty(&self) -> String {
        serde_json::to_string_pretty(&self.fields).unwrap_or_else(|_| "{}".to_string())
    }
}

/// A value is weak when it carries no usable information: `null`, a string
/// that case-normalizes to one of `"", "null", "none", "n/a"`, or an empty
/// array/object. Numbers and booleans are never weak, and neither are the
/// strings `"0"` and `"false"`.
pub fn is_weak_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => {
            matches!(text.to_ascii_lowercase().as_str(), "" | "null" | "none" | "n/a")
        }
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Strips a surrounding Markdown code fence (with an optional language tag)
/// from service output before JSON parsing.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    match rest.trim_end().strip_suffix("```") {
        Some(inner) => inner.trim(),
        None => rest.trim(),
    }
}
