//! Per-kind parameter schemas.
//!
//! A schema validates submitted parameters and rewrites them into a normal
//! form: defaults are filled in, seed lists are normalized and sorted, and
//! numbers are coerced to their declared type. Two submissions that differ
//! only in those respects therefore produce the same fingerprint.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Reasons a submission is rejected before any job is created.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("unknown job kind: {0}")]
    UnknownKind(String),

    #[error("parameters must be a JSON object")]
    NotAnObject,

    #[error("unknown parameter: {0}")]
    UnknownField(String),

    #[error("missing required parameter: {0}")]
    MissingField(String),

    #[error("parameter {field} must be {expected}")]
    WrongType {
        field: String,
        expected: &'static str,
    },

    #[error("parameter {field} is out of range: {reason}")]
    OutOfRange { field: String, reason: String },

    #[error("parameter {field} must be one of {allowed:?}, got {value:?}")]
    NotAllowed {
        field: String,
        value: String,
        allowed: Vec<String>,
    },

    #[error("no seeds submitted in {0}")]
    EmptySeeds(String),
}

/// Value type of a single parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldType {
    /// Gene or protein identifiers. Normalized by [`normalize_seeds`]; the
    /// detected seed type is written to `type_field` when one is set.
    Seeds {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        type_field: Option<String>,
    },
    Integer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<i64>,
    },
    Float {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    Bool,
    /// String restricted to a fixed set of values.
    Choice { values: Vec<String> },
    Text,
    StringList,
    /// Strings from a fixed set; sorted and de-duplicated.
    ChoiceList { values: Vec<String> },
    /// Any JSON array, kept in the given order.
    Array,
}

/// One named parameter of a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(flatten)]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    /// Used when the parameter is omitted or null.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType, default: Value) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            default: Some(default),
        }
    }

    fn normalize(&self, value: &Value, out: &mut Map<String, Value>) -> Result<(), ValidationError> {
        let field = || self.name.clone();
        let normalized = match &self.field_type {
            FieldType::Seeds { type_field } => {
                let seeds = string_list(value).ok_or(ValidationError::WrongType {
                    field: field(),
                    expected: "a list of strings",
                })?;
                if seeds.is_empty() {
                    return Err(ValidationError::EmptySeeds(field()));
                }
                let (seeds, seed_type) = normalize_seeds(&seeds);
                if let Some(type_field) = type_field {
                    out.insert(type_field.clone(), Value::from(seed_type));
                }
                Value::from(seeds)
            }
            FieldType::Integer { min, max } => {
                let n = as_integer(value).ok_or(ValidationError::WrongType {
                    field: field(),
                    expected: "an integer",
                })?;
                check_range(&self.name, n, *min, *max)?;
                Value::from(n)
            }
            FieldType::Float { min, max } => {
                let n = value.as_f64().ok_or(ValidationError::WrongType {
                    field: field(),
                    expected: "a number",
                })?;
                check_range(&self.name, n, *min, *max)?;
                Value::from(n)
            }
            FieldType::Bool => Value::from(value.as_bool().ok_or(ValidationError::WrongType {
                field: field(),
                expected: "a boolean",
            })?),
            FieldType::Choice { values } => {
                let s = value.as_str().ok_or(ValidationError::WrongType {
                    field: field(),
                    expected: "a string",
                })?;
                if !values.iter().any(|v| v == s) {
                    return Err(ValidationError::NotAllowed {
                        field: field(),
                        value: s.to_string(),
                        allowed: values.clone(),
                    });
                }
                Value::from(s)
            }
            FieldType::Text => Value::from(value.as_str().ok_or(ValidationError::WrongType {
                field: field(),
                expected: "a string",
            })?),
            FieldType::StringList => Value::from(string_list(value).ok_or(
                ValidationError::WrongType {
                    field: field(),
                    expected: "a list of strings",
                },
            )?),
            FieldType::ChoiceList { values } => {
                let mut items = string_list(value).ok_or(ValidationError::WrongType {
                    field: field(),
                    expected: "a list of strings",
                })?;
                if let Some(bad) = items.iter().find(|item| !values.contains(item)) {
                    return Err(ValidationError::NotAllowed {
                        field: field(),
                        value: bad.clone(),
                        allowed: values.clone(),
                    });
                }
                items.sort();
                items.dedup();
                Value::from(items)
            }
            FieldType::Array => {
                if !value.is_array() {
                    return Err(ValidationError::WrongType {
                        field: field(),
                        expected: "a list",
                    });
                }
                value.clone()
            }
        };
        out.insert(self.name.clone(), normalized);
        Ok(())
    }
}

/// Parameter schema for one job kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamSchema {
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    /// Pass through parameters the schema does not name.
    #[serde(default)]
    pub allow_unknown: bool,
}

impl ParamSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self {
            fields,
            allow_unknown: false,
        }
    }

    /// Validate `params` and return their normal form.
    pub fn validate(&self, params: &Value) -> Result<Value, ValidationError> {
        let empty = Map::new();
        let input = match params {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => return Err(ValidationError::NotAnObject),
        };

        let mut out = Map::new();
        for (key, value) in input {
            if !self.fields.iter().any(|f| &f.name == key) {
                if !self.allow_unknown {
                    return Err(ValidationError::UnknownField(key.clone()));
                }
                out.insert(key.clone(), value.clone());
            }
        }

        for spec in &self.fields {
            match input.get(&spec.name).filter(|v| !v.is_null()) {
                Some(value) => spec.normalize(value, &mut out)?,
                None => match &spec.default {
                    Some(default) => spec.normalize(default, &mut out)?,
                    None if spec.required => {
                        return Err(ValidationError::MissingField(spec.name.clone()));
                    }
                    None => {}
                },
            }
        }

        Ok(Value::Object(out))
    }
}

/// Upper-case seeds, strip `ENTREZ.` / `UNIPROT.` namespaces, then sort and
/// de-duplicate. Returns the seeds and the detected type, `gene` when every
/// seed is an Entrez identifier and `protein` otherwise.
pub fn normalize_seeds(seeds: &[String]) -> (Vec<String>, &'static str) {
    let upper: Vec<String> = seeds.iter().map(|s| s.trim().to_uppercase()).collect();

    let (mut normalized, seed_type) = if upper.iter().all(|s| s.starts_with("ENTREZ.")) {
        (strip_all(&upper, "ENTREZ."), "gene")
    } else if upper
        .iter()
        .all(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
    {
        (upper, "gene")
    } else if upper.iter().all(|s| s.starts_with("UNIPROT.")) {
        (strip_all(&upper, "UNIPROT."), "protein")
    } else {
        (upper, "protein")
    };

    normalized.sort();
    normalized.dedup();
    (normalized, seed_type)
}

fn strip_all(seeds: &[String], prefix: &str) -> Vec<String> {
    seeds
        .iter()
        .map(|s| s.strip_prefix(prefix).unwrap_or(s).to_string())
        .collect()
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}

fn as_integer(value: &Value) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    let f = value.as_f64()?;
    (f.fract() == 0.0 && f.abs() < 9.0e15).then_some(f as i64)
}

fn check_range<T>(field: &str, n: T, min: Option<T>, max: Option<T>) -> Result<(), ValidationError>
where
    T: PartialOrd + std::fmt::Display + Copy,
{
    if let Some(min) = min.filter(|min| n < *min) {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            reason: format!("{n} is below the minimum {min}"),
        });
    }
    if let Some(max) = max.filter(|max| n > *max) {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            reason: format!("{n} is above the maximum {max}"),
        });
    }
    Ok(())
}
