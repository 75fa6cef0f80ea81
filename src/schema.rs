//! Resource schemas.
//!
//! A driver may describe the properties its resource type accepts. The graph
//! builder uses the schema to reject bad literal values before any provider
//! call, and the plan compiler uses it to normalize values so that set-typed
//! attributes compare without regard to order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// The type of an attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    /// A string value.
    String,
    /// A 64-bit integer.
    Int64,
    /// A 64-bit floating point number.
    Float64,
    /// A boolean value.
    Bool,
    /// A list of values of a single type. Order is significant.
    List(Box<AttributeType>),
    /// A set of unique values of a single type. Order is not significant.
    Set(Box<AttributeType>),
    /// A map from string keys to values of a single type.
    Map(Box<AttributeType>),
    /// An object with a fixed set of attributes.
    Object(HashMap<String, AttributeType>),
    /// A dynamic type that can hold any value.
    Dynamic,
}

impl AttributeType {
    /// Create a list type.
    pub fn list(element_type: AttributeType) -> Self {
        Self::List(Box::new(element_type))
    }

    /// Create a set type.
    pub fn set(element_type: AttributeType) -> Self {
        Self::Set(Box::new(element_type))
    }

    /// Create a map type.
    pub fn map(element_type: AttributeType) -> Self {
        Self::Map(Box::new(element_type))
    }

    /// Create an object type.
    pub fn object(attributes: HashMap<String, AttributeType>) -> Self {
        Self::Object(attributes)
    }

    /// Bring a value into canonical form for comparison.
    ///
    /// Set elements are sorted by their JSON text and deduplicated; every
    /// other shape is normalized element-wise.
    pub fn normalize(&self, value: &mut Value) {
        match (self, value) {
            (Self::Set(element), Value::Array(items)) => {
                items.iter_mut().for_each(|item| element.normalize(item));
                items.sort_by_cached_key(|item| item.to_string());
                items.dedup();
            },
            (Self::List(element), Value::Array(items)) => {
                items.iter_mut().for_each(|item| element.normalize(item));
            },
            (Self::Map(element), Value::Object(map)) => {
                map.values_mut().for_each(|item| element.normalize(item));
            },
            (Self::Object(attrs), Value::Object(map)) => {
                for (name, attr_type) in attrs {
                    if let Some(item) = map.get_mut(name) {
                        attr_type.normalize(item);
                    }
                }
            },
            _ => {},
        }
    }
}

/// Describes how an attribute can be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AttributeFlags {
    /// The attribute is required in configuration.
    pub required: bool,
    /// The attribute is optional in configuration.
    pub optional: bool,
    /// The attribute is computed by the provider (read-only).
    pub computed: bool,
}

impl AttributeFlags {
    /// Create flags for a required attribute.
    pub fn required() -> Self {
        Self {
            required: true,
            ..Default::default()
        }
    }

    /// Create flags for an optional attribute.
    pub fn optional() -> Self {
        Self {
            optional: true,
            ..Default::default()
        }
    }

    /// Create flags for a computed attribute (read-only, set by provider).
    pub fn computed() -> Self {
        Self {
            computed: true,
            ..Default::default()
        }
    }
}

/// Describes a single attribute in a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    /// The type of the attribute.
    #[serde(rename = "type")]
    pub attr_type: AttributeType,
    /// Flags describing how the attribute can be used.
    #[serde(flatten)]
    pub flags: AttributeFlags,
    /// Human-readable description of the attribute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Attribute {
    /// Create a new attribute with the given type and flags.
    pub fn new(attr_type: AttributeType, flags: AttributeFlags) -> Self {
        Self {
            attr_type,
            flags,
            description: None,
        }
    }

    /// Create a required attribute of any type.
    pub fn required(attr_type: AttributeType) -> Self {
        Self::new(attr_type, AttributeFlags::required())
    }

    /// Create an optional attribute of any type.
    pub fn optional(attr_type: AttributeType) -> Self {
        Self::new(attr_type, AttributeFlags::optional())
    }

    /// Create a computed attribute of any type.
    pub fn computed(attr_type: AttributeType) -> Self {
        Self::new(attr_type, AttributeFlags::computed())
    }

    /// Create a required string attribute.
    pub fn required_string() -> Self {
        Self::required(AttributeType::String)
    }

    /// Create an optional string attribute.
    pub fn optional_string() -> Self {
        Self::optional(AttributeType::String)
    }

    /// Create a computed string attribute.
    pub fn computed_string() -> Self {
        Self::computed(AttributeType::String)
    }

    /// Set the description for this attribute.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Schema for one resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceSchema {
    /// The version of this schema.
    #[serde(default)]
    pub version: u64,
    /// Attributes by property name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, Attribute>,
}

impl ResourceSchema {
    /// Create a schema at version 0.
    pub fn v0() -> Self {
        Self::default()
    }

    /// Add an attribute to the schema.
    pub fn with_attribute(mut self, name: impl Into<String>, attr: Attribute) -> Self {
        self.attributes.insert(name.into(), attr);
        self
    }

    /// Normalize a resolved property object in place.
    pub fn normalize(&self, properties: &mut Value) {
        if let Value::Object(map) = properties {
            for (name, attr) in &self.attributes {
                if let Some(value) = map.get_mut(name) {
                    attr.attr_type.normalize(value);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_attribute_type_constructors() {
        let list = AttributeType::list(AttributeType::String);
        assert!(matches!(list, AttributeType::List(_)));

        let set = AttributeType::set(AttributeType::Int64);
        assert!(matches!(set, AttributeType::Set(_)));
    }

    #[test]
    fn test_attribute_flags() {
        let required = AttributeFlags::required();
        assert!(required.required);
        assert!(!required.optional);
        assert!(!required.computed);

        let computed = AttributeFlags::computed();
        assert!(!computed.required);
        assert!(computed.computed);
    }

    #[test]
    fn test_normalize_set_ignores_order() {
        let schema = ResourceSchema::v0()
            .with_attribute(
                "aliases",
                Attribute::optional(AttributeType::set(AttributeType::String)),
            )
            .with_attribute(
                "origins",
                Attribute::optional(AttributeType::list(AttributeType::String)),
            );

        let mut a = json!({"aliases": ["b.example", "a.example"], "origins": ["x", "y"]});
        let mut b = json!({"aliases": ["a.example", "b.example", "a.example"], "origins": ["x", "y"]});
        schema.normalize(&mut a);
        schema.normalize(&mut b);
        assert_eq!(a, b);

        // Lists keep their order.
        let mut c = json!({"aliases": [], "origins": ["y", "x"]});
        schema.normalize(&mut c);
        assert_eq!(c["origins"], json!(["y", "x"]));
    }

    #[test]
    fn test_normalize_nested_sets() {
        let mut inner = HashMap::new();
        inner.insert(
            "methods".to_string(),
            AttributeType::set(AttributeType::String),
        );
        let behavior = AttributeType::object(inner);

        let mut value = json!({"methods": ["HEAD", "GET"], "ttl": 60});
        behavior.normalize(&mut value);
        assert_eq!(value, json!({"methods": ["GET", "HEAD"], "ttl": 60}));
    }
}
