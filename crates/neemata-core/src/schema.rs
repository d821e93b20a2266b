// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime schema descriptors for procedure input and output.
//!
//! Procedure I/O is dynamically typed (`serde_json::Value`); schemas are
//! carried at runtime and drive validation in the dispatcher.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single validation issue, addressed by a dotted field path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldIssue {
    /// Dotted path to the offending field (empty for the root value).
    pub path: String,
    /// What was wrong with it.
    pub message: String,
}

/// Runtime type descriptor for a JSON value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Schema {
    /// Accepts anything, including absent payloads.
    Any,
    Null,
    Boolean,
    Integer,
    Number,
    String,
    Array {
        items: Box<Schema>,
    },
    Object {
        #[serde(default)]
        properties: BTreeMap<String, Schema>,
        #[serde(default)]
        required: Vec<String>,
    },
}

impl Schema {
    /// Shorthand for an object schema.
    pub fn object<const N: usize>(properties: [(&str, Schema); N], required: &[&str]) -> Self {
        Schema::Object {
            properties: properties
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            required: required.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Shorthand for an array schema.
    pub fn array(items: Schema) -> Self {
        Schema::Array {
            items: Box::new(items),
        }
    }

    /// Validate a value against this schema.
    pub fn validate(&self, value: &Value) -> Result<(), Vec<FieldIssue>> {
        let mut issues = Vec::new();
        self.check("", value, &mut issues);
        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }

    fn check(&self, path: &str, value: &Value, issues: &mut Vec<FieldIssue>) {
        let mismatch = |expected: &str, issues: &mut Vec<FieldIssue>| {
            issues.push(FieldIssue {
                path: path.to_string(),
                message: format!("expected {}, got {}", expected, type_name(value)),
            });
        };

        match self {
            Schema::Any => {}
            Schema::Null => {
                if !value.is_null() {
                    mismatch("null", issues);
                }
            }
            Schema::Boolean => {
                if !value.is_boolean() {
                    mismatch("boolean", issues);
                }
            }
            Schema::Integer => {
                if !value.is_i64() && !value.is_u64() {
                    mismatch("integer", issues);
                }
            }
            Schema::Number => {
                if !value.is_number() {
                    mismatch("number", issues);
                }
            }
            Schema::String => {
                if !value.is_string() {
                    mismatch("string", issues);
                }
            }
            Schema::Array { items } => match value.as_array() {
                Some(elements) => {
                    for (index, element) in elements.iter().enumerate() {
                        items.check(&join(path, &index.to_string()), element, issues);
                    }
                }
                None => mismatch("array", issues),
            },
            Schema::Object {
                properties,
                required,
            } => match value.as_object() {
                Some(map) => {
                    for name in required {
                        if !map.contains_key(name) {
                            issues.push(FieldIssue {
                                path: join(path, name),
                                message: "required field is missing".to_string(),
                            });
                        }
                    }
                    for (name, schema) in properties {
                        if let Some(field) = map.get(name) {
                            schema.check(&join(path, name), field, issues);
                        }
                    }
                }
                None => mismatch("object", issues),
            },
        }
    }
}

fn join(path: &str, segment: &str) -> String {
    if path.is_empty() {
        segment.to_string()
    } else {
        format!("{}.{}", path, segment)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
