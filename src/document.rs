//! The normalized input document.
//!
//! A [`Document`] is the in-memory form a template front end hands to the
//! engine: document variables plus resource declarations, both in declaration
//! order. It can be assembled with the builder methods or loaded from JSON:
//!
//! ```json
//! {
//!   "variables": { "stage": "prod" },
//!   "resources": {
//!     "SiteBucket": { "type": "aws_s3_bucket", "properties": { "name": "site-${stage}" } },
//!     "Cdn": {
//!       "type": "aws_cloudfront_distribution",
//!       "properties": { "origin": "${SiteBucket.DomainName}" },
//!       "depends_on": ["SiteBucket"]
//!     }
//!   }
//! }
//! ```
//!
//! The loader keeps duplicate resource identifiers and duplicate property keys
//! instead of silently keeping the last one; the graph builder rejects them.

use std::fmt;
use std::marker::PhantomData;

use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
use serde_json::Value;

use crate::error::ValidationError;
use crate::expr::Expr;

/// A single resource declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDecl {
    /// Identifier, unique within the document.
    pub id: String,
    /// Type tag used to pick a driver.
    pub resource_type: String,
    /// Properties in declaration order.
    pub properties: Vec<(String, Expr)>,
    /// Explicit dependencies.
    pub depends_on: Vec<String>,
}

impl ResourceDecl {
    /// Declare a resource with no properties.
    pub fn new(id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            properties: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    /// Add a property.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Expr>) -> Self {
        self.properties.push((name.into(), value.into()));
        self
    }

    /// Add an explicit dependency.
    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }
}

/// A declarative resource document.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    /// Variables available to `${name}` substitution.
    pub variables: Vec<(String, Value)>,
    /// Resource declarations in declaration order.
    pub resources: Vec<ResourceDecl>,
}

impl Document {
    /// Create an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a variable.
    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.push((name.into(), value));
        self
    }

    /// Add a resource declaration.
    pub fn with_resource(mut self, resource: ResourceDecl) -> Self {
        self.resources.push(resource);
        self
    }

    /// Parse a document from JSON text.
    pub fn from_json_str(input: &str) -> Result<Self, ValidationError> {
        let raw: RawDocument =
            serde_json::from_str(input).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        raw.into_document()
    }

    /// Parse a document from an already-decoded JSON value.
    ///
    /// `serde_json::Value` has already collapsed duplicate keys, so prefer
    /// [`Document::from_json_str`] for untrusted input.
    pub fn from_json_value(value: Value) -> Result<Self, ValidationError> {
        let raw = RawDocument::deserialize(value)
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;
        raw.into_document()
    }
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDocument {
    #[serde(default, alias = "Variables")]
    variables: Ordered<Value>,
    #[serde(default, alias = "Resources")]
    resources: Ordered<RawResource>,
}

#[derive(serde::Deserialize)]
struct RawResource {
    #[serde(rename = "type", alias = "Type")]
    resource_type: String,
    #[serde(default, alias = "Properties")]
    properties: Option<Expr>,
    #[serde(default, alias = "DependsOn")]
    depends_on: DependsOn,
}

/// `depends_on` may be a single identifier or a list.
#[derive(serde::Deserialize, Default)]
#[serde(untagged)]
enum DependsOn {
    #[default]
    None,
    One(String),
    Many(Vec<String>),
}

impl RawDocument {
    fn into_document(self) -> Result<Document, ValidationError> {
        let mut resources = Vec::with_capacity(self.resources.0.len());
        for (id, raw) in self.resources.0 {
            let properties = match raw.properties {
                None | Some(Expr::Null) => Vec::new(),
                Some(Expr::Map(entries)) => entries,
                Some(_) => {
                    return Err(ValidationError::Malformed(format!(
                        "properties of '{}' must be a mapping",
                        id
                    )))
                },
            };
            let depends_on = match raw.depends_on {
                DependsOn::None => Vec::new(),
                DependsOn::One(dep) => vec![dep],
                DependsOn::Many(deps) => deps,
            };
            resources.push(ResourceDecl {
                id,
                resource_type: raw.resource_type,
                properties,
                depends_on,
            });
        }
        Ok(Document {
            variables: self.variables.0,
            resources,
        })
    }
}

/// A JSON object read as an ordered list of entries, duplicates included.
struct Ordered<T>(Vec<(String, T)>);

impl<T> Default for Ordered<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Ordered<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for OrderedVisitor<T> {
            type Value = Ordered<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Ordered<T>, A::Error> {
                let mut entries = Vec::new();
                while let Some(entry) = access.next_entry::<String, T>()? {
                    entries.push(entry);
                }
                Ok(Ordered(entries))
            }
        }

        deserializer.deserialize_map(OrderedVisitor(PhantomData))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Reference;
    use serde_json::json;

    #[test]
    fn test_builder() {
        let doc = Document::new()
            .with_variable("stage", json!("prod"))
            .with_resource(ResourceDecl::new("Bucket", "aws_s3_bucket").with_property("name", "site"))
            .with_resource(
                ResourceDecl::new("Cdn", "aws_cloudfront_distribution")
                    .with_property("origin", Expr::get_attr("Bucket", "DomainName"))
                    .with_dependency("Bucket"),
            );

        assert_eq!(doc.variables.len(), 1);
        assert_eq!(doc.resources.len(), 2);
        assert_eq!(doc.resources[1].depends_on, vec!["Bucket".to_string()]);
    }

    #[test]
    fn test_from_json_preserves_declaration_order() {
        let doc = Document::from_json_str(
            r#"{
                "resources": {
                    "Zeta": {"type": "t"},
                    "Alpha": {"type": "t", "depends_on": "Zeta"},
                    "Mid": {"type": "t", "depends_on": ["Alpha", "Zeta"]}
                }
            }"#,
        )
        .unwrap();

        let ids: Vec<_> = doc.resources.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["Zeta", "Alpha", "Mid"]);
        assert_eq!(doc.resources[1].depends_on, vec!["Zeta".to_string()]);
        assert_eq!(doc.resources[2].depends_on.len(), 2);
    }

    #[test]
    fn test_from_json_keeps_duplicates() {
        let doc = Document::from_json_str(
            r#"{
                "resources": {
                    "Bucket": {"type": "t"},
                    "Bucket": {"type": "t"}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(doc.resources.len(), 2);
    }

    #[test]
    fn test_cloudformation_spelling() {
        let doc = Document::from_json_str(
            r#"{
                "Resources": {
                    "Role": {"Type": "aws_iam_role", "Properties": {"name": "exec"}},
                    "Fn": {
                        "Type": "aws_lambda_function",
                        "Properties": {"role": {"Fn::GetAtt": ["Role", "Arn"]}},
                        "DependsOn": "Role"
                    }
                }
            }"#,
        )
        .unwrap();

        let function = &doc.resources[1];
        assert_eq!(function.resource_type, "aws_lambda_function");
        assert_eq!(
            function.properties[0].1.references(),
            vec![&Reference::attribute("Role", "Arn")]
        );
    }

    #[test]
    fn test_malformed() {
        let err = Document::from_json_str(r#"{"resources": {"A": {"properties": {}}}}"#)
            .unwrap_err();
        assert!(matches!(err, ValidationError::Malformed(_)));

        let err = Document::from_json_str(r#"{"resources": {"A": {"type": "t", "properties": [1]}}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("must be a mapping"));

        let err = Document::from_json_str(r#"{"outputs": {}}"#).unwrap_err();
        assert!(matches!(err, ValidationError::Malformed(_)));
    }
}
