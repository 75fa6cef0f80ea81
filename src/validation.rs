//! Schema validation of declared properties.
//!
//! Properties are checked before any reference is resolved, so only the
//! literal parts of each [`Expr`] can be judged. A reference may resolve to
//! anything and is accepted wherever a value is expected; an interpolated
//! string is a string.
//!
//! # Example
//!
//! ```
//! use hemmer_engine::expr::Expr;
//! use hemmer_engine::schema::{Attribute, AttributeType, ResourceSchema};
//! use hemmer_engine::validation::validate;
//! use serde_json::json;
//!
//! let schema = ResourceSchema::v0()
//!     .with_attribute("name", Attribute::required_string())
//!     .with_attribute("count", Attribute::optional(AttributeType::Int64));
//!
//! let properties = vec![
//!     ("name".to_string(), Expr::reference("Bucket")),
//!     ("count".to_string(), Expr::literal(json!("three"))),
//! ];
//! let violations = validate(&schema, &properties);
//! assert_eq!(violations.len(), 1);
//! assert_eq!(violations[0].attribute, "count");
//! ```

use std::collections::HashMap;

use crate::expr::{join_path, Expr};
use crate::schema::{Attribute, AttributeType, ResourceSchema};

/// One schema violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Dotted path of the offending attribute.
    pub attribute: String,
    /// What is wrong with it.
    pub detail: String,
}

impl Violation {
    fn new(attribute: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            detail: detail.into(),
        }
    }
}

/// Validate declared properties against a schema.
///
/// # Validation Rules
///
/// - Required attributes must be present and non-null
/// - Computed-only attributes must not be set in configuration
/// - Literal values must match the attribute type
/// - Properties the schema does not name are left to the driver
///
/// Violations come back sorted by attribute path.
pub fn validate(schema: &ResourceSchema, properties: &[(String, Expr)]) -> Vec<Violation> {
    let mut violations = Vec::new();

    for (name, attr) in &schema.attributes {
        let value = properties
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, expr)| expr);
        validate_attribute(attr, value, name, &mut violations);
    }

    violations.sort_by(|a, b| a.attribute.cmp(&b.attribute));
    violations
}

/// Check if declared properties are valid against a schema.
pub fn is_valid(schema: &ResourceSchema, properties: &[(String, Expr)]) -> bool {
    validate(schema, properties).is_empty()
}

fn validate_attribute(
    attr: &Attribute,
    value: Option<&Expr>,
    path: &str,
    violations: &mut Vec<Violation>,
) {
    let computed_only = attr.flags.computed && !attr.flags.optional && !attr.flags.required;

    match value {
        None | Some(Expr::Null) => {
            if attr.flags.required {
                violations.push(Violation::new(path, "missing required attribute"));
            }
        },
        Some(_) if computed_only => {
            violations.push(Violation::new(
                path,
                "attribute is computed by the provider and cannot be set",
            ));
        },
        Some(expr) => validate_type(&attr.attr_type, expr, path, violations),
    }
}

fn validate_type(attr_type: &AttributeType, expr: &Expr, path: &str, violations: &mut Vec<Violation>) {
    if matches!(expr, Expr::Ref(_)) {
        return;
    }

    match attr_type {
        AttributeType::String => {
            if !matches!(expr, Expr::String(_) | Expr::Interpolate(_)) {
                violations.push(type_error(path, "string", expr));
            }
        },
        AttributeType::Int64 => {
            if !is_int64(expr) {
                violations.push(type_error(path, "int64", expr));
            }
        },
        AttributeType::Float64 => {
            if !matches!(expr, Expr::Number(_)) {
                violations.push(type_error(path, "float64", expr));
            }
        },
        AttributeType::Bool => {
            if !matches!(expr, Expr::Bool(_)) {
                violations.push(type_error(path, "bool", expr));
            }
        },
        AttributeType::List(element_type) | AttributeType::Set(element_type) => match expr {
            Expr::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    validate_type(element_type, item, &join_path(path, &i.to_string()), violations);
                }
            },
            _ => {
                let expected = if matches!(attr_type, AttributeType::Set(_)) {
                    "set"
                } else {
                    "list"
                };
                violations.push(type_error(path, expected, expr));
            },
        },
        AttributeType::Map(value_type) => match expr {
            Expr::Map(entries) => {
                for (key, value) in entries {
                    validate_type(value_type, value, &join_path(path, key), violations);
                }
            },
            _ => violations.push(type_error(path, "map", expr)),
        },
        AttributeType::Object(attrs) => match expr {
            Expr::Map(entries) => validate_object(attrs, entries, path, violations),
            _ => violations.push(type_error(path, "object", expr)),
        },
        AttributeType::Dynamic => {},
    }
}

fn validate_object(
    attrs: &HashMap<String, AttributeType>,
    entries: &[(String, Expr)],
    path: &str,
    violations: &mut Vec<Violation>,
) {
    // Object members carry no flags, so presence is not enforced.
    for (key, value) in entries {
        if let Some(attr_type) = attrs.get(key) {
            validate_type(attr_type, value, &join_path(path, key), violations);
        }
    }
}

fn kind_name(expr: &Expr) -> &'static str {
    match expr {
        Expr::Null => "null",
        Expr::Bool(_) => "bool",
        Expr::Number(_) => "number",
        Expr::String(_) | Expr::Interpolate(_) => "string",
        Expr::List(_) => "list",
        Expr::Map(_) => "mapping",
        Expr::Ref(_) => "reference",
    }
}

fn is_int64(expr: &Expr) -> bool {
    match expr {
        Expr::Number(n) => {
            n.is_i64()
                || n.as_f64()
                    .map(|f| f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64)
                    .unwrap_or(false)
        },
        _ => false,
    }
}

fn type_error(path: &str, expected: &str, got: &Expr) -> Violation {
    Violation::new(path, format!("expected {}, got {}", expected, kind_name(got)))
}
