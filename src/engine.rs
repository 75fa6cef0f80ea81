//! One-call provisioning runs.
//!
//! [`Engine`] wires the pieces together for a single run: it snapshots the
//! state store, builds the graph, compiles the plan and hands it to an
//! [`Executor`]. Graph and plan errors are returned before any driver is
//! called.
//!
//! The engine does not lock the store. Callers sharing a
//! [`FileStateStore`](crate::FileStateStore) between processes should hold
//! its [`StateLock`](crate::StateLock) for the duration of the run.

use std::sync::Arc;

use tracing::info;

use crate::cancel::CancelToken;
use crate::document::Document;
use crate::driver::DriverRegistry;
use crate::error::EngineError;
use crate::executor::{ApplyResult, Executor};
use crate::graph::{build, ResourceGraph};
use crate::options::ApplyOptions;
use crate::plan::{compile, Plan};
use crate::state::StateStore;

/// A driver registry and a state store, ready to plan and apply documents.
#[derive(Clone)]
pub struct Engine {
    executor: Executor,
    registry: Arc<DriverRegistry>,
    store: Arc<dyn StateStore>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.registry)
            .field("options", self.executor.options())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine with default apply options.
    pub fn new(registry: DriverRegistry, store: Arc<dyn StateStore>) -> Self {
        let registry = Arc::new(registry);
        Self {
            executor: Executor::new(registry.clone(), store.clone()),
            registry,
            store,
        }
    }

    /// Set the apply options.
    pub fn with_options(mut self, options: ApplyOptions) -> Self {
        self.executor = self.executor.with_options(options);
        self
    }

    /// The driver registry.
    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    /// The state store.
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Validate `document` and build its graph.
    pub fn build(&self, document: &Document) -> Result<ResourceGraph, EngineError> {
        Ok(build(document, &self.registry)?)
    }

    /// Compute what applying `document` would do.
    pub async fn plan(&self, document: &Document) -> Result<Plan, EngineError> {
        let graph = self.build(document)?;
        let snapshot = self.store.snapshot().await?;
        Ok(compile(&graph, &snapshot)?)
    }

    /// Plan the removal of every recorded resource.
    pub async fn plan_destroy(&self) -> Result<Plan, EngineError> {
        let snapshot = self.store.snapshot().await?;
        Ok(compile(&ResourceGraph::default(), &snapshot)?)
    }

    /// Plan and apply `document`.
    pub async fn apply(&self, document: &Document) -> Result<ApplyResult, EngineError> {
        self.apply_with_cancel(document, CancelToken::never()).await
    }

    /// Plan and apply `document`, stopping early if `cancel` fires.
    pub async fn apply_with_cancel(
        &self,
        document: &Document,
        cancel: CancelToken,
    ) -> Result<ApplyResult, EngineError> {
        let plan = self.plan(document).await?;
        info!(summary = %plan.summary(), "Plan ready");
        Ok(self.apply_plan(plan, cancel).await)
    }

    /// Apply a plan computed earlier.
    ///
    /// The plan reflects state at the time it was compiled; applying it after
    /// the store changed may act on stale records.
    pub async fn apply_plan(&self, plan: Plan, cancel: CancelToken) -> ApplyResult {
        self.executor.apply_with_cancel(plan, cancel).await
    }

    /// Delete every recorded resource, dependents first.
    pub async fn destroy(&self, cancel: CancelToken) -> Result<ApplyResult, EngineError> {
        let plan = self.plan_destroy().await?;
        info!(summary = %plan.summary(), "Destroy plan ready");
        Ok(self.apply_plan(plan, cancel).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ResourceDecl;
    use crate::error::PlanError;
    use crate::executor::RunStatus;
    use crate::expr::Expr;
    use crate::plan::{Action, StepStatus};
    use crate::retry::RetryConfig;
    use crate::state::{FileStateStore, MemoryStateStore};
    use crate::testing::{
        assert_action, assert_all_succeeded, assert_status, Fault, MockDriver, MockOp,
    };
    use serde_json::json;
    use std::time::Duration;

    fn engine(driver: Arc<MockDriver>, store: Arc<dyn StateStore>) -> Engine {
        Engine::new(DriverRegistry::new().with_driver("mock", driver), store).with_options(
            ApplyOptions::new().with_retry(
                RetryConfig::default()
                    .with_max_attempts(3)
                    .with_initial_delay(Duration::from_millis(1))
                    .with_max_delay(Duration::from_millis(5)),
            ),
        )
    }

    fn stack(bucket_name: &str) -> Document {
        Document::new()
            .with_variable("env", json!("prod"))
            .with_resource(
                ResourceDecl::new("Bucket", "mock").with_property("name", bucket_name),
            )
            .with_resource(
                ResourceDecl::new("Distribution", "mock")
                    .with_property("origin", Expr::get_attr("Bucket", "arn"))
                    .with_property("stage", Expr::reference("env")),
            )
            .with_resource(
                ResourceDecl::new("Record", "mock")
                    .with_property("target", Expr::reference("Distribution")),
            )
            .with_resource(ResourceDecl::new("Table", "mock").with_property("name", "sessions"))
    }

    #[tokio::test]
    async fn test_second_run_is_all_no_op() {
        let driver = Arc::new(MockDriver::new());
        let engine = engine(driver.clone(), Arc::new(MemoryStateStore::new()));

        let plan = engine.plan(&stack("site")).await.unwrap();
        assert!(plan.steps.iter().all(|s| s.action == Action::Create));
        let result = engine.apply_plan(plan, CancelToken::never()).await;
        assert_all_succeeded(&result);

        let plan = engine.plan(&stack("site")).await.unwrap();
        assert!(!plan.has_changes());
        assert!(plan.steps.iter().all(|s| s.action == Action::NoOp));

        let result = engine.apply_plan(plan, CancelToken::never()).await;
        assert_all_succeeded(&result);
        assert_eq!(driver.ids_for(MockOp::Create).len(), 4);
        assert!(driver.ids_for(MockOp::Update).is_empty());
    }

    #[tokio::test]
    async fn test_one_property_change_is_one_update() {
        let driver = Arc::new(MockDriver::new());
        let engine = engine(driver.clone(), Arc::new(MemoryStateStore::new()));
        engine.apply(&stack("site")).await.unwrap();

        let plan = engine.plan(&stack("site-v2")).await.unwrap();
        assert_eq!(plan.steps_with(Action::Update).count(), 1);
        assert_action(&plan, "Bucket", Action::Update);
        assert_eq!(plan.summary().no_change, 3);

        let bucket = plan.get("Bucket").unwrap();
        assert_eq!(bucket.changes.len(), 1);
        assert_eq!(bucket.changes[0].path, "name");

        let result = engine.apply_plan(plan, CancelToken::never()).await;
        assert_all_succeeded(&result);
        assert_eq!(driver.ids_for(MockOp::Update), vec!["Bucket"]);
    }

    #[tokio::test]
    async fn test_removed_resources_deleted_dependents_first() {
        let driver = Arc::new(MockDriver::new());
        let engine = engine(driver.clone(), Arc::new(MemoryStateStore::new()));
        engine.apply(&stack("site")).await.unwrap();

        let doc = Document::new()
            .with_resource(ResourceDecl::new("Table", "mock").with_property("name", "sessions"));
        let plan = engine.plan(&doc).await.unwrap();
        assert_action(&plan, "Table", Action::NoOp);
        let deletes: Vec<_> = plan
            .steps_with(Action::Delete)
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(deletes, vec!["Record", "Distribution", "Bucket"]);

        let result = engine.apply_plan(plan, CancelToken::never()).await;
        assert_all_succeeded(&result);
        assert_eq!(
            driver.ids_for(MockOp::Delete),
            vec!["Record", "Distribution", "Bucket"]
        );
        assert_eq!(driver.resource_ids(), vec!["Table"]);
        let state = engine.store().snapshot().await.unwrap();
        assert_eq!(state.keys().collect::<Vec<_>>(), vec!["Table"]);
    }

    #[tokio::test]
    async fn test_failed_dependency_skips_dependents() {
        let driver = Arc::new(MockDriver::new().with_fault("Bucket", Fault::Permanent));
        let engine = engine(driver.clone(), Arc::new(MemoryStateStore::new()));

        let result = engine.apply(&stack("site")).await.unwrap();
        assert_eq!(result.status, RunStatus::PartialFailure);
        assert_status(&result, "Bucket", StepStatus::Failed);
        assert_status(&result, "Distribution", StepStatus::Skipped);
        assert_status(&result, "Record", StepStatus::Skipped);
        assert_status(&result, "Table", StepStatus::Succeeded);
        assert_eq!(result.outcome("Bucket").unwrap().attempts, 1);
        assert_eq!(driver.calls_for("Bucket"), 1);
        assert_eq!(driver.calls_for("Distribution"), 0);
        assert_eq!(driver.calls_for("Record"), 0);

        // The failed and skipped resources are created on the next run.
        driver.clear_fault("Bucket");
        let plan = engine.plan(&stack("site")).await.unwrap();
        assert_action(&plan, "Bucket", Action::Create);
        assert_action(&plan, "Record", Action::Create);
        assert_action(&plan, "Table", Action::NoOp);
    }

    #[tokio::test]
    async fn test_transient_fault_within_budget_succeeds() {
        let driver = Arc::new(
            MockDriver::new().with_fault("Distribution", Fault::Transient { failures: 2 }),
        );
        let engine = engine(driver.clone(), Arc::new(MemoryStateStore::new()));

        let result = engine.apply(&stack("site")).await.unwrap();
        assert_all_succeeded(&result);
        assert_eq!(result.outcome("Distribution").unwrap().attempts, 3);
        assert_eq!(driver.calls_for("Distribution"), 3);
    }

    #[tokio::test]
    async fn test_cycle_aborts_before_any_call() {
        let driver = Arc::new(MockDriver::new());
        let engine = engine(driver.clone(), Arc::new(MemoryStateStore::new()));
        let doc = Document::new()
            .with_resource(ResourceDecl::new("A", "mock").with_property("peer", Expr::reference("B")))
            .with_resource(ResourceDecl::new("B", "mock").with_property("peer", Expr::reference("A")));

        let err = engine.apply(&doc).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Plan(PlanError::CycleDetected(ref ids)) if ids == &["A", "B"]
        ));
        assert!(driver.calls().is_empty());
    }

    #[tokio::test]
    async fn test_added_depends_on_orders_later_deletes() {
        let driver = Arc::new(MockDriver::new());
        let engine = engine(driver.clone(), Arc::new(MemoryStateStore::new()));
        let doc = |z: ResourceDecl| {
            Document::new()
                .with_resource(ResourceDecl::new("B", "mock").with_property("name", "b"))
                .with_resource(z)
        };
        let z = || ResourceDecl::new("Z", "mock").with_property("name", "z");

        assert_all_succeeded(&engine.apply(&doc(z())).await.unwrap());

        let plan = engine.plan(&doc(z().with_dependency("B"))).await.unwrap();
        assert_action(&plan, "B", Action::NoOp);
        assert_action(&plan, "Z", Action::NoOp);
        assert_all_succeeded(&engine.apply_plan(plan, CancelToken::never()).await);
        assert!(driver.ids_for(MockOp::Update).is_empty());
        assert_eq!(
            engine.store().get("Z").await.unwrap().unwrap().dependencies,
            vec!["B".to_string()]
        );

        let plan = engine.plan_destroy().await.unwrap();
        let index = |id: &str| plan.steps.iter().position(|s| s.id == id).unwrap();
        assert_eq!(plan.get("B").unwrap().depends_on, vec![index("Z")]);
        assert!(plan.get("Z").unwrap().depends_on.is_empty());

        assert_all_succeeded(&engine.apply_plan(plan, CancelToken::never()).await);
        assert_eq!(driver.ids_for(MockOp::Delete), vec!["Z", "B"]);
    }

    #[tokio::test]
    async fn test_destroy_with_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStateStore::new(dir.path()));
        let lock = store.acquire_lock().await.unwrap();

        let driver = Arc::new(MockDriver::new());
        let engine = engine(driver.clone(), store.clone());
        let result = engine.apply(&stack("site")).await.unwrap();
        assert_all_succeeded(&result);
        assert_eq!(
            result.outcome("Distribution").unwrap().outputs["origin"],
            json!("mock:Bucket")
        );

        let result = engine.destroy(CancelToken::never()).await.unwrap();
        assert_all_succeeded(&result);
        assert!(driver.resource_ids().is_empty());
        assert!(engine.store().snapshot().await.unwrap().is_empty());

        let deleted = driver.ids_for(MockOp::Delete);
        let position = |id: &str| deleted.iter().position(|d| d == id).unwrap();
        assert!(position("Record") < position("Distribution"));
        assert!(position("Distribution") < position("Bucket"));

        lock.release().await.unwrap();
    }
}
