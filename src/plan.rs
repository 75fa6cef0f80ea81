//! Plan compilation.
//!
//! [`compile`] orders a [`ResourceGraph`] topologically and diffs every node
//! against the prior [`StateSnapshot`]:
//!
//! - no record: **create**
//! - record whose last apply failed: **update**
//! - a property references a resource that is about to be created (its
//!   value is unknown until apply): **update**
//! - otherwise the normalized resolved properties are compared with the
//!   recorded ones: **no-op** if equal, **update** with attribute-level
//!   changes if not
//!
//! Resources that are recorded but no longer declared become **delete**
//! steps. They are placed after every other step, dependents first.
//!
//! Ties in the topological order are broken by declaration order, so the
//! same inputs always produce the same plan.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::PlanError;
use crate::expr::{Expr, Reference};
use crate::graph::ResourceGraph;
use crate::schema::ResourceSchema;
use crate::state::{ApplyStatus, StateRecord, StateSnapshot};
use crate::types::{diff, AttributeChange};

/// Type of action to perform on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Create a new resource
    Create,
    /// Update an existing resource in place
    Update,
    /// Delete a resource that is no longer declared
    Delete,
    /// Nothing to do
    #[serde(rename = "no-op")]
    NoOp,
}

impl Action {
    /// Plan marker: `+`, `~`, `-` or blank.
    pub fn symbol(&self) -> &'static str {
        match self {
            Action::Create => "+",
            Action::Update => "~",
            Action::Delete => "-",
            Action::NoOp => " ",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Create => write!(f, "create"),
            Action::Update => write!(f, "update"),
            Action::Delete => write!(f, "delete"),
            Action::NoOp => write!(f, "no-op"),
        }
    }
}

/// Lifecycle of a step during apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not started
    Pending,
    /// Driver call in flight
    InProgress,
    /// Applied and recorded
    Succeeded,
    /// Driver or state error
    Failed,
    /// Not attempted because a dependency failed or the run was cancelled
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::InProgress => write!(f, "in-progress"),
            StepStatus::Succeeded => write!(f, "succeeded"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// One unit of work in a plan.
#[derive(Debug, Clone)]
pub struct PlanStep {
    /// Resource identifier.
    pub id: String,
    /// Type tag.
    pub resource_type: String,
    /// What will be done.
    pub action: Action,
    /// Declared properties; empty for deletes.
    pub properties: Vec<(String, Expr)>,
    /// Schema used to normalize values.
    pub schema: Option<Arc<ResourceSchema>>,
    /// Resolved property values, filled in by the executor.
    pub resolved: Option<Value>,
    /// Recorded state before this run.
    pub prior: Option<StateRecord>,
    /// Attribute-level changes known at plan time.
    pub changes: Vec<AttributeChange>,
    /// Indices of steps that must succeed first.
    pub depends_on: Vec<usize>,
    /// Apply status.
    pub status: StepStatus,
}

/// An ordered list of steps.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Steps in execution order.
    pub steps: Vec<PlanStep>,
}

impl Plan {
    /// Index of the step for `id`.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    /// Step for `id`.
    pub fn get(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Steps with the given action.
    pub fn steps_with(&self, action: Action) -> impl Iterator<Item = &PlanStep> {
        self.steps.iter().filter(move |s| s.action == action)
    }

    /// Whether anything other than no-ops is planned.
    pub fn has_changes(&self) -> bool {
        self.steps.iter().any(|s| s.action != Action::NoOp)
    }

    /// Counts by action.
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            create: self.steps_with(Action::Create).count(),
            update: self.steps_with(Action::Update).count(),
            delete: self.steps_with(Action::Delete).count(),
            no_change: self.steps_with(Action::NoOp).count(),
        }
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the plan has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Planned actions:")?;
        writeln!(f)?;

        for step in &self.steps {
            match step.action {
                Action::NoOp => {
                    writeln!(f, "    {} ({}) (no changes)", step.id, step.resource_type)?;
                },
                action => {
                    writeln!(f, "  {} {} ({})", action.symbol(), step.id, step.resource_type)?;
                },
            }
            for change in &step.changes {
                let declared = step
                    .properties
                    .iter()
                    .any(|(name, _)| change.path.split('.').next() == Some(name.as_str()));
                let before = change
                    .before
                    .as_ref()
                    .map(Value::to_string)
                    .unwrap_or_else(|| "(none)".to_string());
                let after = match &change.after {
                    Some(value) => value.to_string(),
                    None if declared => "(known after apply)".to_string(),
                    None => "(none)".to_string(),
                };
                writeln!(f, "      {}: {} -> {}", change.path, before, after)?;
            }
        }

        writeln!(f)?;
        write!(f, "Plan: {}.", self.summary())
    }
}

/// Summary of planned actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PlanSummary {
    /// Steps that create a resource.
    pub create: usize,
    /// Steps that update a resource.
    pub update: usize,
    /// Steps that delete a resource.
    pub delete: usize,
    /// Steps with nothing to do.
    pub no_change: usize,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to delete, {} unchanged",
            self.create, self.update, self.delete, self.no_change
        )
    }
}

/// Compile a plan from a graph and the prior state.
///
/// Fails with [`PlanError::CycleDetected`] if the graph has a cycle and with
/// [`PlanError::TypeChanged`] if a declared resource is recorded under a
/// different type.
pub fn compile(graph: &ResourceGraph, prior: &StateSnapshot) -> Result<Plan, PlanError> {
    let order = topological_order(graph)?;

    for node in graph.nodes() {
        if let Some(record) = prior.get(&node.id) {
            if record.resource_type != node.resource_type {
                return Err(PlanError::TypeChanged {
                    id: node.id.clone(),
                    from: record.resource_type.clone(),
                    to: node.resource_type.clone(),
                });
            }
        }
    }

    let mut step_of = vec![0; graph.len()];
    let mut actions: HashMap<&str, Action> = HashMap::new();
    let mut steps = Vec::with_capacity(graph.len());

    for &index in &order {
        let node = graph.node(index);
        let record = prior.get(&node.id);

        let mut lookup = |reference: &Reference| -> Result<Value, Unknown> {
            if actions.get(reference.target.as_str()) == Some(&Action::Create) {
                return Err(Unknown);
            }
            prior
                .get(&reference.target)
                .and_then(|record| recorded_output(record, reference))
                .ok_or(Unknown)
        };

        let mut desired = Map::new();
        let mut unknown = Vec::new();
        for (name, expr) in &node.properties {
            match expr.resolve(&mut lookup) {
                Ok(value) => {
                    desired.insert(name.clone(), value);
                },
                Err(Unknown) => unknown.push(name.clone()),
            }
        }
        let mut desired = Value::Object(desired);
        if let Some(schema) = &node.schema {
            schema.normalize(&mut desired);
        }

        let (action, changes) = match record {
            None => {
                let mut changes = diff(&Value::Object(Map::new()), &desired);
                changes.extend(unknown.iter().map(|name| AttributeChange::new(name, None, None)));
                changes.sort_by(|a, b| a.path.cmp(&b.path));
                (Action::Create, changes)
            },
            Some(record) => {
                let mut recorded = record.properties.clone();
                if let Some(schema) = &node.schema {
                    schema.normalize(&mut recorded);
                }
                let mut pending = Vec::new();
                if let Value::Object(map) = &mut recorded {
                    for name in &unknown {
                        pending.push(AttributeChange::new(name, map.remove(name), None));
                    }
                }
                let mut changes = diff(&recorded, &desired);
                changes.extend(pending);
                changes.sort_by(|a, b| a.path.cmp(&b.path));

                let action = if record.status == ApplyStatus::Failed || !changes.is_empty() {
                    Action::Update
                } else {
                    Action::NoOp
                };
                (action, changes)
            },
        };

        debug!(id = %node.id, %action, changes = changes.len(), "Planned resource");
        actions.insert(node.id.as_str(), action);
        step_of[index] = steps.len();
        steps.push(PlanStep {
            id: node.id.clone(),
            resource_type: node.resource_type.clone(),
            action,
            properties: node.properties.clone(),
            schema: node.schema.clone(),
            resolved: None,
            prior: record.cloned(),
            changes,
            depends_on: Vec::new(),
            status: StepStatus::Pending,
        });
    }

    for &index in &order {
        let mut depends_on: Vec<usize> = graph
            .dependencies(index)
            .iter()
            .map(|&dep| step_of[dep])
            .collect();
        depends_on.sort_unstable();
        steps[step_of[index]].depends_on = depends_on;
    }

    plan_deletes(graph, prior, &mut steps);

    let plan = Plan { steps };
    debug!(summary = %plan.summary(), "Compiled plan");
    Ok(plan)
}

/// Marker for a value that is only known after apply.
struct Unknown;

/// Value of `reference` taken from a recorded resource.
fn recorded_output(record: &StateRecord, reference: &Reference) -> Option<Value> {
    output_value(&record.external_id, &record.attributes, reference)
}

/// Value of `reference` from a resource's external id and outputs. A bare
/// reference yields the external id, as does `.id` when no output by that
/// name exists.
pub(crate) fn output_value(
    external_id: &str,
    attributes: &Map<String, Value>,
    reference: &Reference,
) -> Option<Value> {
    match reference.attribute.as_deref() {
        None => Some(Value::String(external_id.to_string())),
        Some(attribute) => attributes
            .get(attribute)
            .cloned()
            .or_else(|| (attribute == "id").then(|| Value::String(external_id.to_string()))),
    }
}

/// Append delete steps for recorded resources that are no longer declared.
fn plan_deletes(graph: &ResourceGraph, prior: &StateSnapshot, steps: &mut Vec<PlanStep>) {
    let removed: BTreeMap<&str, &StateRecord> = prior
        .iter()
        .filter(|(id, _)| graph.index_of(id).is_none())
        .map(|(id, record)| (id.as_str(), record))
        .collect();
    if removed.is_empty() {
        return;
    }

    // A removed resource can only go once every removed resource that
    // depended on it is gone.
    let mut blockers: BTreeMap<&str, usize> = removed.keys().map(|&id| (id, 0)).collect();
    let mut dependents_of: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (&id, record) in &removed {
        for dep in &record.dependencies {
            if let Some(count) = blockers.get_mut(dep.as_str()) {
                if dep != id {
                    *count += 1;
                    dependents_of.entry(dep.as_str()).or_default().push(id);
                }
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<&str>> = blockers
        .iter()
        .filter(|(_, &count)| count == 0)
        .map(|(&id, _)| Reverse(id))
        .collect();
    let mut order = Vec::with_capacity(removed.len());
    while let Some(Reverse(id)) = ready.pop() {
        order.push(id);
        if let Some(deps) = removed.get(id).map(|r| &r.dependencies) {
            for dep in deps {
                if let Some(count) = blockers.get_mut(dep.as_str()) {
                    if dep != id && *count > 0 {
                        *count -= 1;
                        if *count == 0 {
                            ready.push(Reverse(dep.as_str()));
                        }
                    }
                }
            }
        }
    }
    // Recorded dependencies should never form a cycle; if they do, delete
    // the rest alphabetically.
    for &id in removed.keys() {
        if !order.contains(&id) {
            order.push(id);
        }
    }

    let base = steps.len();
    let delete_index: HashMap<&str, usize> = order
        .iter()
        .enumerate()
        .map(|(i, &id)| (id, base + i))
        .collect();

    for &id in &order {
        let record = removed[id];
        let mut depends_on: Vec<usize> = dependents_of
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|dependent| delete_index.get(dependent).copied())
            .collect();
        for (index, step) in steps.iter().enumerate().take(base) {
            let depended = step
                .prior
                .as_ref()
                .map(|p| p.dependencies.iter().any(|d| d == id))
                .unwrap_or(false);
            if depended {
                depends_on.push(index);
            }
        }
        depends_on.sort_unstable();
        depends_on.dedup();

        debug!(id, "Planned delete");
        steps.push(PlanStep {
            id: id.to_string(),
            resource_type: record.resource_type.clone(),
            action: Action::Delete,
            properties: Vec::new(),
            schema: None,
            resolved: None,
            prior: Some(record.clone()),
            changes: Vec::new(),
            depends_on,
            status: StepStatus::Pending,
        });
    }
}

/// Kahn's algorithm over arena indices; the smallest ready index goes first.
fn topological_order(graph: &ResourceGraph) -> Result<Vec<usize>, PlanError> {
    let mut in_degree: Vec<usize> = (0..graph.len())
        .map(|i| graph.dependencies(i).len())
        .collect();
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &degree)| degree == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(graph.len());
    while let Some(Reverse(index)) = ready.pop() {
        order.push(index);
        for &dependent in graph.dependents(index) {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }

    if order.len() == graph.len() {
        return Ok(order);
    }

    let members = cycle_members(graph);
    Err(PlanError::CycleDetected(
        members.into_iter().map(|i| graph.node(i).id.clone()).collect(),
    ))
}

/// Every node on a cycle, ascending. Uses Tarjan's strongly connected
/// components; a component is a cycle if it has more than one member or a
/// self-loop.
fn cycle_members(graph: &ResourceGraph) -> Vec<usize> {
    struct Tarjan<'a> {
        graph: &'a ResourceGraph,
        next: usize,
        index: Vec<Option<usize>>,
        low: Vec<usize>,
        on_stack: Vec<bool>,
        stack: Vec<usize>,
        members: Vec<usize>,
    }

    impl Tarjan<'_> {
        fn visit(&mut self, v: usize) {
            self.index[v] = Some(self.next);
            self.low[v] = self.next;
            self.next += 1;
            self.stack.push(v);
            self.on_stack[v] = true;

            for &w in self.graph.dependencies(v) {
                match self.index[w] {
                    None => {
                        self.visit(w);
                        self.low[v] = self.low[v].min(self.low[w]);
                    },
                    Some(w_index) if self.on_stack[w] => {
                        self.low[v] = self.low[v].min(w_index);
                    },
                    Some(_) => {},
                }
            }

            if Some(self.low[v]) == self.index[v] {
                let mut component = Vec::new();
                while let Some(w) = self.stack.pop() {
                    self.on_stack[w] = false;
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                if component.len() > 1 || self.graph.dependencies(v).contains(&v) {
                    self.members.extend(component);
                }
            }
        }
    }

    let n = graph.len();
    let mut tarjan = Tarjan {
        graph,
        next: 0,
        index: vec![None; n],
        low: vec![0; n],
        on_stack: vec![false; n],
        stack: Vec::new(),
        members: Vec::new(),
    };
    for v in 0..n {
        if tarjan.index[v].is_none() {
            tarjan.visit(v);
        }
    }

    let mut members = tarjan.members;
    members.sort_unstable();
    members
}
