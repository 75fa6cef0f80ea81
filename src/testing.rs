//! Testing utilities for engine users and driver authors.
//!
//! [`MockDriver`] is an in-memory [`Driver`] with fault injection, call
//! recording and concurrency tracking. The `assert_*` helpers check plans
//! and apply results with readable failure messages.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use hemmer_engine::testing::{assert_status, MockDriver};
//! use hemmer_engine::{Document, DriverRegistry, Engine, MemoryStateStore, ResourceDecl, StepStatus};
//!
//! # tokio_test::block_on(async {
//! let registry = DriverRegistry::new().with_driver("mock", Arc::new(MockDriver::new()));
//! let engine = Engine::new(registry, Arc::new(MemoryStateStore::new()));
//!
//! let doc = Document::new().with_resource(ResourceDecl::new("Bucket", "mock"));
//! let result = engine.apply(&doc).await.unwrap();
//! assert_status(&result, "Bucket", StepStatus::Succeeded);
//! # });
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::driver::{CurrentResource, Driver, DriverOutput};
use crate::error::DriverError;
use crate::executor::ApplyResult;
use crate::graph::ResourceGraph;
use crate::plan::{Action, Plan, StepStatus};
use crate::schema::ResourceSchema;

/// A failure injected into every mutating call for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail with [`DriverError::Unavailable`] for the first `failures`
    /// calls, then succeed.
    Transient {
        /// Calls that fail before one succeeds.
        failures: u32,
    },
    /// Always fail with [`DriverError::Validation`].
    Permanent,
    /// Panic inside the call.
    Panic,
}

/// Kind of driver call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    /// `create`
    Create,
    /// `read`
    Read,
    /// `update`
    Update,
    /// `delete`
    Delete,
}

/// A recorded driver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    /// What was called.
    pub op: MockOp,
    /// Resource identifier.
    pub id: String,
}

#[derive(Default)]
struct MockState {
    resources: BTreeMap<String, DriverOutput>,
    faults: HashMap<String, Fault>,
    failures: HashMap<String, u32>,
    calls: Vec<MockCall>,
}

/// In-memory driver.
///
/// Created resources get the external id `mock-<id>` and echo their
/// properties back as output attributes, plus an `arn` of `mock:<id>`.
#[derive(Default)]
pub struct MockDriver {
    schema: Option<ResourceSchema>,
    delay: Option<Duration>,
    state: Mutex<MockState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl std::fmt::Debug for MockDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDriver")
            .field("schema", &self.schema)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl MockDriver {
    /// Create a driver with no schema, no delay and no faults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a schema.
    pub fn with_schema(mut self, schema: ResourceSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Sleep this long inside every mutating call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Inject a fault for `id`.
    pub fn with_fault(self, id: impl Into<String>, fault: Fault) -> Self {
        self.set_fault(id, fault);
        self
    }

    /// Inject a fault for `id`, replacing any existing one.
    pub fn set_fault(&self, id: impl Into<String>, fault: Fault) {
        let id = id.into();
        let mut state = self.lock();
        state.failures.remove(&id);
        state.faults.insert(id, fault);
    }

    /// Remove the fault for `id`.
    pub fn clear_fault(&self, id: &str) {
        let mut state = self.lock();
        state.faults.remove(id);
        state.failures.remove(id);
    }

    /// Drop a resource behind the engine's back.
    pub fn forget(&self, id: &str) {
        self.lock().resources.remove(id);
    }

    /// The live resource for `id`.
    pub fn resource(&self, id: &str) -> Option<DriverOutput> {
        self.lock().resources.get(id).cloned()
    }

    /// Identifiers of all live resources, sorted.
    pub fn resource_ids(&self) -> Vec<String> {
        self.lock().resources.keys().cloned().collect()
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    /// Mutating calls made for `id`.
    pub fn calls_for(&self, id: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.id == id && c.op != MockOp::Read)
            .count()
    }

    /// Ids of the mutating calls of kind `op`, in call order.
    pub fn ids_for(&self, op: MockOp) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .map(|c| c.id.clone())
            .collect()
    }

    /// Highest number of mutating calls observed in flight at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, op: MockOp, id: &str) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.calls.push(MockCall {
            op,
            id: id.to_string(),
        });
        if op == MockOp::Read {
            return Ok(());
        }

        let fault = state.faults.get(id).copied();
        match fault {
            None => Ok(()),
            Some(Fault::Permanent) => {
                Err(DriverError::Validation("injected permanent fault".to_string()))
            },
            Some(Fault::Panic) => {
                drop(state);
                panic!("injected panic for '{}'", id);
            },
            Some(Fault::Transient { failures }) => {
                let seen = state.failures.entry(id.to_string()).or_insert(0);
                if *seen < failures {
                    *seen += 1;
                    Err(DriverError::Unavailable("injected transient fault".to_string()))
                } else {
                    Ok(())
                }
            },
        }
    }

    async fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        guard
    }

    fn output(id: &str, properties: &Value) -> DriverOutput {
        let mut output = DriverOutput::new(format!("mock-{}", id));
        if let Value::Object(map) = properties {
            output.attributes = map.clone();
        }
        output.with_attribute("arn", json!(format!("mock:{}", id)))
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn schema(&self) -> Option<ResourceSchema> {
        self.schema.clone()
    }

    async fn create(&self, id: &str, properties: &Value) -> Result<DriverOutput, DriverError> {
        let _guard = self.enter().await;
        self.record(MockOp::Create, id)?;

        let mut state = self.lock();
        if state.resources.contains_key(id) {
            return Err(DriverError::AlreadyExists(id.to_string()));
        }
        let output = Self::output(id, properties);
        state.resources.insert(id.to_string(), output.clone());
        Ok(output)
    }

    async fn read(
        &self,
        id: &str,
        _current: &CurrentResource,
    ) -> Result<Option<DriverOutput>, DriverError> {
        self.record(MockOp::Read, id)?;
        Ok(self.resource(id))
    }

    async fn update(
        &self,
        id: &str,
        _current: &CurrentResource,
        properties: &Value,
    ) -> Result<DriverOutput, DriverError> {
        let _guard = self.enter().await;
        self.record(MockOp::Update, id)?;

        let mut state = self.lock();
        if !state.resources.contains_key(id) {
            return Err(DriverError::NotFound(id.to_string()));
        }
        let output = Self::output(id, properties);
        state.resources.insert(id.to_string(), output.clone());
        Ok(output)
    }

    async fn delete(&self, id: &str, _current: &CurrentResource) -> Result<(), DriverError> {
        let _guard = self.enter().await;
        self.record(MockOp::Delete, id)?;

        match self.lock().resources.remove(id) {
            Some(_) => Ok(()),
            None => Err(DriverError::NotFound(id.to_string())),
        }
    }
}

// =========================================================================
// Assertion Helpers
// =========================================================================

/// Assert that the plan has a step for `id` with the given action.
///
/// # Panics
///
/// Panics if the step is missing or has a different action.
pub fn assert_action(plan: &Plan, id: &str, action: Action) {
    let step = plan
        .get(id)
        .unwrap_or_else(|| panic!("Expected a plan step for '{}', but there is none", id));
    assert_eq!(
        step.action, action,
        "Expected '{}' to be planned as {}, but got {}",
        id, action, step.action
    );
}

/// Assert that every resource comes after the resources it depends on.
///
/// # Panics
///
/// Panics if a dependency is missing from the plan or ordered after its
/// dependent.
pub fn assert_dependencies_first(graph: &ResourceGraph, plan: &Plan) {
    for (dependency, dependent) in graph.edges() {
        let dependency = &graph.node(dependency).id;
        let dependent = &graph.node(dependent).id;
        let before = plan.position(dependency);
        let after = plan.position(dependent);
        assert!(
            matches!((before, after), (Some(b), Some(a)) if b < a),
            "Expected '{}' to be planned before '{}', got positions {:?} and {:?}",
            dependency,
            dependent,
            before,
            after
        );
    }
}

/// Assert the final status of one step.
///
/// # Panics
///
/// Panics if the step is missing or ended differently.
pub fn assert_status(result: &ApplyResult, id: &str, status: StepStatus) {
    let outcome = result
        .outcome(id)
        .unwrap_or_else(|| panic!("Expected an outcome for '{}', but there is none", id));
    assert_eq!(
        outcome.status, status,
        "Expected '{}' to be {}, but it was {} (error: {:?})",
        id, status, outcome.status, outcome.error
    );
}

/// Assert that every step succeeded.
///
/// # Panics
///
/// Panics listing every step that did not succeed.
pub fn assert_all_succeeded(result: &ApplyResult) {
    let failed: Vec<_> = result
        .steps
        .iter()
        .filter(|s| s.status != StepStatus::Succeeded)
        .map(|s| format!("{} ({}): {}", s.id, s.status, s.error.as_deref().unwrap_or("")))
        .collect();
    assert!(
        failed.is_empty(),
        "Expected every step to succeed, but {} did not: {:?}",
        failed.len(),
        failed
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_lifecycle() {
        let driver = MockDriver::new();
        let output = driver.create("Bucket", &json!({"name": "site"})).await.unwrap();
        assert_eq!(output.external_id, "mock-Bucket");
        assert_eq!(output.attributes["name"], json!("site"));
        assert_eq!(output.attributes["arn"], json!("mock:Bucket"));

        let err = driver.create("Bucket", &json!({})).await.unwrap_err();
        assert!(matches!(err, DriverError::AlreadyExists(_)));

        let current = CurrentResource::default();
        let output = driver
            .update("Bucket", &current, &json!({"name": "site-v2"}))
            .await
            .unwrap();
        assert_eq!(output.attributes["name"], json!("site-v2"));
        assert!(driver.read("Bucket", &current).await.unwrap().is_some());

        driver.delete("Bucket", &current).await.unwrap();
        assert!(driver.read("Bucket", &current).await.unwrap().is_none());
        let err = driver.delete("Bucket", &current).await.unwrap_err();
        assert!(matches!(err, DriverError::NotFound(_)));

        assert_eq!(driver.calls_for("Bucket"), 4);
        assert_eq!(driver.ids_for(MockOp::Delete), vec!["Bucket", "Bucket"]);
    }

    #[tokio::test]
    async fn test_transient_fault_clears() {
        let driver = MockDriver::new().with_fault("Bucket", Fault::Transient { failures: 2 });
        for _ in 0..2 {
            let err = driver.create("Bucket", &json!({})).await.unwrap_err();
            assert!(err.is_transient());
        }
        assert!(driver.create("Bucket", &json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn test_permanent_fault() {
        let driver = MockDriver::new().with_fault("Bucket", Fault::Permanent);
        let err = driver.create("Bucket", &json!({})).await.unwrap_err();
        assert!(!err.is_transient());

        driver.clear_fault("Bucket");
        assert!(driver.create("Bucket", &json!({})).await.is_ok());
    }

    #[test]
    #[should_panic(expected = "Expected 'Bucket' to be planned as update")]
    fn test_assert_action_fails() {
        let mut plan = Plan::default();
        plan.steps.push(crate::plan::PlanStep {
            id: "Bucket".to_string(),
            resource_type: "mock".to_string(),
            action: Action::Create,
            properties: Vec::new(),
            schema: None,
            resolved: None,
            prior: None,
            changes: Vec::new(),
            depends_on: Vec::new(),
            status: StepStatus::Pending,
        });
        assert_action(&plan, "Bucket", Action::Update);
    }
}
