//! Resource graph construction.
//!
//! [`build`] turns a [`Document`] into a [`ResourceGraph`]: an arena of
//! nodes in declaration order plus, per node, the indices it depends on and
//! the indices that depend on it. Edges come from explicit `depends_on`
//! entries and from every reference found in a property value. References to
//! document variables are substituted here and leave no edge behind.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::document::Document;
use crate::driver::DriverRegistry;
use crate::error::ValidationError;
use crate::expr::{Expr, Reference};
use crate::schema::ResourceSchema;
use crate::validation::validate;

/// A validated resource declaration.
#[derive(Debug, Clone)]
pub struct ResourceNode {
    /// Identifier, unique within the graph.
    pub id: String,
    /// Type tag; a driver is registered for it.
    pub resource_type: String,
    /// Properties in declaration order, variables substituted.
    pub properties: Vec<(String, Expr)>,
    /// Explicit dependencies as declared.
    pub depends_on: Vec<String>,
    /// Schema published by the driver, if any.
    pub schema: Option<Arc<ResourceSchema>>,
}

impl ResourceNode {
    /// Every cross-resource reference in the properties.
    pub fn references(&self) -> Vec<&Reference> {
        self.properties
            .iter()
            .flat_map(|(_, expr)| expr.references())
            .collect()
    }
}

/// An immutable dependency graph over resource declarations.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: Vec<ResourceNode>,
    index: HashMap<String, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
}

impl ResourceGraph {
    /// Nodes in declaration order.
    pub fn nodes(&self) -> &[ResourceNode] {
        &self.nodes
    }

    /// Node at `index`.
    pub fn node(&self, index: usize) -> &ResourceNode {
        &self.nodes[index]
    }

    /// Arena index of `id`.
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Node named `id`.
    pub fn get(&self, id: &str) -> Option<&ResourceNode> {
        self.index_of(id).map(|i| &self.nodes[i])
    }

    /// Indices node `index` depends on, ascending.
    pub fn dependencies(&self, index: usize) -> &[usize] {
        &self.dependencies[index]
    }

    /// Indices that depend on node `index`, ascending.
    pub fn dependents(&self, index: usize) -> &[usize] {
        &self.dependents[index]
    }

    /// Every edge as `(dependency, dependent)`: the first must be applied
    /// before the second.
    pub fn edges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.dependencies
            .iter()
            .enumerate()
            .flat_map(|(dependent, deps)| deps.iter().map(move |&dep| (dep, dependent)))
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Whether `id` can be used as a resource identifier (and state key).
///
/// Identifiers are case-sensitive, but [`FileStateStore`](crate::FileStateStore)
/// names files after them, so [`build`] also rejects resource ids that differ
/// only by case.
pub fn is_valid_identifier(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Build a resource graph from a document.
///
/// Checks run in this order, and the first failure is returned:
/// identifiers (well-formed and unique across resources and variables),
/// then per resource in declaration order: registered type, repeated keys,
/// reference and dependency targets, schema.
pub fn build(document: &Document, registry: &DriverRegistry) -> Result<ResourceGraph, ValidationError> {
    let mut seen = HashSet::new();
    let mut variables = HashMap::new();
    for (name, value) in &document.variables {
        if !is_valid_identifier(name) {
            return Err(ValidationError::InvalidIdentifier(name.clone()));
        }
        if !seen.insert(name.as_str()) {
            return Err(ValidationError::DuplicateIdentifier(name.clone()));
        }
        variables.insert(name.as_str(), value);
    }

    let mut index = HashMap::with_capacity(document.resources.len());
    let mut folded = HashSet::with_capacity(document.resources.len());
    for (i, decl) in document.resources.iter().enumerate() {
        if !is_valid_identifier(&decl.id) {
            return Err(ValidationError::InvalidIdentifier(decl.id.clone()));
        }
        if !seen.insert(decl.id.as_str()) || !folded.insert(decl.id.to_ascii_lowercase()) {
            return Err(ValidationError::DuplicateIdentifier(decl.id.clone()));
        }
        index.insert(decl.id.clone(), i);
    }

    let mut nodes = Vec::with_capacity(document.resources.len());
    let mut dependencies = Vec::with_capacity(document.resources.len());

    for decl in &document.resources {
        let driver = registry
            .resolve(&decl.resource_type)
            .map_err(|_| ValidationError::UnknownType {
                id: decl.id.clone(),
                resource_type: decl.resource_type.clone(),
            })?;

        let mut names = HashSet::new();
        for (name, expr) in &decl.properties {
            if !names.insert(name.as_str()) {
                return Err(ValidationError::DuplicateKey {
                    id: decl.id.clone(),
                    path: name.clone(),
                });
            }
            if let Some(path) = expr.find_duplicate_key(name) {
                return Err(ValidationError::DuplicateKey {
                    id: decl.id.clone(),
                    path,
                });
            }
        }

        let mut deps = Vec::new();
        let mut substitute = |reference: Reference| -> Result<Expr, ValidationError> {
            if let Some(&target) = index.get(&reference.target) {
                deps.push(target);
                return Ok(Expr::Ref(reference));
            }
            match variables.get(reference.target.as_str()) {
                Some(value) => variable_value(value, &reference)
                    .map(Expr::literal)
                    .ok_or_else(|| ValidationError::UnknownReference {
                        id: decl.id.clone(),
                        target: reference.to_string(),
                    }),
                None => Err(ValidationError::UnknownReference {
                    id: decl.id.clone(),
                    target: reference.target,
                }),
            }
        };

        let mut properties = Vec::with_capacity(decl.properties.len());
        for (name, expr) in &decl.properties {
            properties.push((name.clone(), expr.clone().map_references(&mut substitute)?));
        }

        for dep in &decl.depends_on {
            match index.get(dep) {
                Some(&target) => deps.push(target),
                None => {
                    return Err(ValidationError::UnknownReference {
                        id: decl.id.clone(),
                        target: dep.clone(),
                    })
                },
            }
        }
        deps.sort_unstable();
        deps.dedup();

        let schema = driver.schema().map(Arc::new);
        if let Some(schema) = &schema {
            if let Some(violation) = validate(schema, &properties).into_iter().next() {
                return Err(ValidationError::InvalidProperty {
                    id: decl.id.clone(),
                    attribute: violation.attribute,
                    detail: violation.detail,
                });
            }
        }

        nodes.push(ResourceNode {
            id: decl.id.clone(),
            resource_type: decl.resource_type.clone(),
            properties,
            depends_on: decl.depends_on.clone(),
            schema,
        });
        dependencies.push(deps);
    }

    let mut dependents = vec![Vec::new(); nodes.len()];
    for (dependent, deps) in dependencies.iter().enumerate() {
        for &dep in deps {
            dependents[dep].push(dependent);
        }
    }

    let graph = ResourceGraph {
        nodes,
        index,
        dependencies,
        dependents,
    };
    debug!(
        resources = graph.len(),
        edges = graph.edges().count(),
        variables = document.variables.len(),
        "Built resource graph"
    );
    Ok(graph)
}

fn variable_value(value: &Value, reference: &Reference) -> Option<Value> {
    match &reference.attribute {
        None => Some(value.clone()),
        Some(key) => value.get(key).cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ResourceDecl;
    use crate::schema::{Attribute, AttributeType};
    use crate::testing::MockDriver;
    use serde_json::json;

    fn registry() -> DriverRegistry {
        DriverRegistry::new().with_driver("mock", Arc::new(MockDriver::new()))
    }

    #[test]
    fn test_build_edges_from_references_and_depends_on() {
        let doc = Document::from_json_str(
            r#"{
                "resources": {
                    "Bucket": {"type": "mock", "properties": {"name": "site"}},
                    "Role": {"type": "mock"},
                    "Cdn": {
                        "type": "mock",
                        "properties": {"origin": "${Bucket.DomainName}", "policy": {"Ref": "Bucket"}},
                        "depends_on": ["Role"]
                    }
                }
            }"#,
        )
        .unwrap();

        let graph = build(&doc, &registry()).unwrap();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.index_of("Cdn"), Some(2));
        assert_eq!(graph.dependencies(2), &[0, 1]);
        assert_eq!(graph.dependents(0), &[2]);
        assert_eq!(graph.dependents(1), &[2]);
        assert!(graph.dependencies(0).is_empty());

        let edges: Vec<_> = graph.edges().collect();
        assert_eq!(edges, vec![(0, 2), (1, 2)]);
        assert_eq!(graph.get("Cdn").unwrap().references().len(), 2);
    }

    #[test]
    fn test_variables_are_substituted() {
        let doc = Document::new()
            .with_variable("stage", json!("prod"))
            .with_variable("net", json!({"cidr": "10.0.0.0/16"}))
            .with_resource(
                ResourceDecl::new("Vpc", "mock")
                    .with_property("name", Expr::from_json(json!("vpc-${stage}")).unwrap())
                    .with_property("cidr", Expr::get_attr("net", "cidr")),
            );

        let graph = build(&doc, &registry()).unwrap();
        let node = graph.get("Vpc").unwrap();
        assert!(node.references().is_empty());
        assert_eq!(node.properties[0].1, Expr::String("vpc-prod".into()));
        assert_eq!(node.properties[1].1, Expr::String("10.0.0.0/16".into()));
        assert!(graph.dependencies(0).is_empty());

        let doc = Document::new()
            .with_variable("net", json!({"cidr": "10.0.0.0/16"}))
            .with_resource(ResourceDecl::new("Vpc", "mock").with_property("x", Expr::get_attr("net", "nope")));
        let err = build(&doc, &registry()).unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownReference {
                id: "Vpc".into(),
                target: "net.nope".into()
            }
        );
    }

    #[test]
    fn test_duplicate_identifier() {
        let doc = Document::new()
            .with_resource(ResourceDecl::new("A", "mock"))
            .with_resource(ResourceDecl::new("A", "mock"));
        assert_eq!(
            build(&doc, &registry()).unwrap_err(),
            ValidationError::DuplicateIdentifier("A".into())
        );

        let doc = Document::new()
            .with_variable("A", json!(1))
            .with_resource(ResourceDecl::new("A", "mock"));
        assert_eq!(
            build(&doc, &registry()).unwrap_err(),
            ValidationError::DuplicateIdentifier("A".into())
        );
    }

    #[test]
    fn test_resource_ids_differing_only_by_case_rejected() {
        let doc = Document::new()
            .with_resource(ResourceDecl::new("Bucket", "mock"))
            .with_resource(ResourceDecl::new("bucket", "mock"));
        assert_eq!(
            build(&doc, &registry()).unwrap_err(),
            ValidationError::DuplicateIdentifier("bucket".into())
        );

        // Variables are never stored, so they only clash exactly.
        let doc = Document::new()
            .with_variable("stage", json!("prod"))
            .with_resource(ResourceDecl::new("Stage", "mock"));
        assert!(build(&doc, &registry()).is_ok());
    }

    #[test]
    fn test_invalid_identifier() {
        for id in ["", "../etc", "a/b", ".hidden", "has space"] {
            let doc = Document::new().with_resource(ResourceDecl::new(id, "mock"));
            assert_eq!(
                build(&doc, &registry()).unwrap_err(),
                ValidationError::InvalidIdentifier(id.into()),
                "id {:?}",
                id
            );
        }
        assert!(is_valid_identifier("Site_Bucket-1.v2"));
    }

    #[test]
    fn test_unknown_reference_and_type() {
        let doc = Document::new()
            .with_resource(ResourceDecl::new("A", "mock").with_property("x", Expr::reference("Ghost")));
        assert_eq!(
            build(&doc, &registry()).unwrap_err(),
            ValidationError::UnknownReference {
                id: "A".into(),
                target: "Ghost".into()
            }
        );

        let doc = Document::new().with_resource(ResourceDecl::new("A", "mock").with_dependency("Ghost"));
        assert!(matches!(
            build(&doc, &registry()).unwrap_err(),
            ValidationError::UnknownReference { .. }
        ));

        let doc = Document::new().with_resource(ResourceDecl::new("A", "aws_nope"));
        assert_eq!(
            build(&doc, &registry()).unwrap_err(),
            ValidationError::UnknownType {
                id: "A".into(),
                resource_type: "aws_nope".into()
            }
        );
    }

    #[test]
    fn test_duplicate_keys_rejected_at_any_depth() {
        let doc = Document::from_json_str(
            r#"{
                "resources": {
                    "Cdn": {
                        "type": "mock",
                        "properties": {
                            "DistributionConfig": {
                                "DefaultCacheBehavior": {"ttl": 1},
                                "DefaultCacheBehavior": {"ttl": 2}
                            }
                        }
                    }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(
            build(&doc, &registry()).unwrap_err(),
            ValidationError::DuplicateKey {
                id: "Cdn".into(),
                path: "DistributionConfig.DefaultCacheBehavior".into()
            }
        );

        let doc = Document::new().with_resource(
            ResourceDecl::new("A", "mock")
                .with_property("name", "a")
                .with_property("name", "b"),
        );
        assert!(matches!(
            build(&doc, &registry()).unwrap_err(),
            ValidationError::DuplicateKey { ref path, .. } if path == "name"
        ));
    }

    #[test]
    fn test_schema_violation() {
        let schema = ResourceSchema::v0()
            .with_attribute("name", Attribute::required_string())
            .with_attribute("port", Attribute::optional(AttributeType::Int64));
        let registry = DriverRegistry::new()
            .with_driver("typed", Arc::new(MockDriver::new().with_schema(schema)));

        let doc = Document::new()
            .with_variable("port", json!("eighty"))
            .with_resource(
                ResourceDecl::new("Listener", "typed")
                    .with_property("name", "web")
                    .with_property("port", Expr::reference("port")),
            );
        assert_eq!(
            build(&doc, &registry).unwrap_err(),
            ValidationError::InvalidProperty {
                id: "Listener".into(),
                attribute: "port".into(),
                detail: "expected int64, got string".into()
            }
        );

        let doc = Document::new().with_resource(ResourceDecl::new("Listener", "typed"));
        assert!(matches!(
            build(&doc, &registry).unwrap_err(),
            ValidationError::InvalidProperty { ref attribute, .. } if attribute == "name"
        ));
    }

    #[test]
    fn test_self_reference_kept_for_cycle_detection() {
        let doc = Document::new()
            .with_resource(ResourceDecl::new("A", "mock").with_property("me", Expr::reference("A")));
        let graph = build(&doc, &registry()).unwrap();
        assert_eq!(graph.dependencies(0), &[0]);
    }
}
