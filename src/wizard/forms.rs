// Declarative step form schemas
// Field sets with validation rules, validated against raw submitted input

use crate::error::ValidationErrors;
use serde::Serialize;
use std::collections::BTreeMap;

/// Raw submitted input, field name to value
pub type FormData = BTreeMap<String, String>;

/// Validation behavior of a single field
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FieldKind {
    /// Free text, trimmed, bounded length
    Text { max_len: usize },
    /// One of a fixed set of options
    Choice { options: Vec<String> },
    /// Numeric one-time token with a digit-count range
    Token { min_digits: usize, max_digits: usize },
    /// Phone number in international notation
    PhoneNumber,
    /// Opaque secret, passed through untrimmed
    Password,
}

/// A single field in a step's form
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub required: bool,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn text(name: &str, max_len: usize) -> Self {
        Self {
            name: name.to_string(),
            required: true,
            kind: FieldKind::Text { max_len },
        }
    }

    pub fn choice(name: &str, options: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            required: true,
            kind: FieldKind::Choice {
                options: options.iter().map(|o| o.to_string()).collect(),
            },
        }
    }

    pub fn token(name: &str, min_digits: usize, max_digits: usize) -> Self {
        Self {
            name: name.to_string(),
            required: true,
            kind: FieldKind::Token {
                min_digits,
                max_digits,
            },
        }
    }

    pub fn phone_number(name: &str) -> Self {
        Self {
            name: name.to_string(),
            required: true,
            kind: FieldKind::PhoneNumber,
        }
    }

    pub fn password(name: &str) -> Self {
        Self {
            name: name.to_string(),
            required: true,
            kind: FieldKind::Password,
        }
    }
}

/// The field set of one wizard step
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FormSchema {
    pub fields: Vec<FieldSpec>,
}

impl FormSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    /// A step without input, like the enrollment welcome page
    pub fn empty() -> Self {
        Self { fields: Vec::new() }
    }

    /// Validate raw input against the schema.
    /// Returns the cleaned values, or field-level messages suitable for
    /// re-rendering the step. Fields not in the schema are dropped.
    pub fn validate(&self, input: &FormData) -> Result<BTreeMap<String, String>, ValidationErrors> {
        let mut cleaned = BTreeMap::new();
        let mut errors = ValidationErrors::new();

        for field in &self.fields {
            let raw = input.get(&field.name).map(|s| s.as_str()).unwrap_or("");

            let value = match &field.kind {
                FieldKind::Password => raw.to_string(),
                _ => raw.trim().to_string(),
            };

            if value.is_empty() {
                if field.required {
                    errors.add_field(&field.name, "This field is required.");
                }
                continue;
            }

            match &field.kind {
                FieldKind::Text { max_len } => {
                    if value.chars().count() > *max_len {
                        errors.add_field(
                            &field.name,
                            format!("Ensure this value has at most {} characters.", max_len),
                        );
                        continue;
                    }
                    cleaned.insert(field.name.clone(), value);
                }
                FieldKind::Choice { options } => {
                    if !options.contains(&value) {
                        errors.add_field(&field.name, "Select a valid choice.");
                        continue;
                    }
                    cleaned.insert(field.name.clone(), value);
                }
                FieldKind::Token {
                    min_digits,
                    max_digits,
                } => {
                    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
                    if !compact.chars().all(|c| c.is_ascii_digit())
                        || compact.len() < *min_digits
                        || compact.len() > *max_digits
                    {
                        errors.add_field(&field.name, "Enter a valid token.");
                        continue;
                    }
                    cleaned.insert(field.name.clone(), compact);
                }
                FieldKind::PhoneNumber => match normalize_phone_number(&value) {
                    Some(number) => {
                        cleaned.insert(field.name.clone(), number);
                    }
                    None => {
                        errors.add_field(&field.name, "Enter a valid phone number.");
                        continue;
                    }
                },
                FieldKind::Password => {
                    cleaned.insert(field.name.clone(), value);
                }
            }
        }

        if errors.is_empty() {
            Ok(cleaned)
        } else {
            Err(errors)
        }
    }
}

/// Strip separators and keep international notation.
/// Requires at least 8 digits.
fn normalize_phone_number(raw: &str) -> Option<String> {
    let mut normalized = String::new();
    for (i, c) in raw.chars().enumerate() {
        match c {
            '+' if i == 0 => normalized.push('+'),
            '0'..='9' => normalized.push(c),
            ' ' | '-' | '(' | ')' | '.' => {}
            _ => return None,
        }
    }

    let digits = normalized.chars().filter(|c| c.is_ascii_digit()).count();
    if digits < 8 { None } else { Some(normalized) }
}
