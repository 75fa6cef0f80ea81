//! Plan execution.
//!
//! The [`Executor`] walks a [`Plan`] concurrently. A step starts once every
//! step it depends on has succeeded; at most
//! [`ApplyOptions::concurrency`] steps are in flight at once. A failed step
//! skips everything downstream of it, while independent branches keep
//! going. State is written for each step before it counts as succeeded, so a
//! step that fails to record state fails too.
//!
//! Nothing is rolled back. If the process dies between a driver call and the
//! state write, the resource exists but is unrecorded; the next run plans a
//! create for it.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::driver::{CurrentResource, Driver, DriverOutput, DriverRegistry};
use crate::error::{error_chain, DriverError, StepError};
use crate::expr::{resolve_properties, Expr, Reference};
use crate::options::ApplyOptions;
use crate::plan::{output_value, Action, Plan, StepStatus};
use crate::retry::{with_retry, RetryConfig, RetryError};
use crate::schema::ResourceSchema;
use crate::state::{ApplyStatus, StateRecord, StateStore};

/// Overall outcome of an apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every step succeeded.
    Succeeded,
    /// Some steps succeeded and some failed.
    PartialFailure,
    /// Steps failed and none succeeded.
    Failed,
    /// The run was cancelled before it finished.
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::PartialFailure => write!(f, "partial failure"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What happened to one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutcome {
    /// Resource identifier.
    pub id: String,
    /// Type tag.
    pub resource_type: String,
    /// Action chosen by the plan.
    pub planned_action: Action,
    /// Action actually performed. Differs from the plan when a no-op is
    /// promoted to an update, or an update finds the resource gone and
    /// recreates it.
    pub action: Action,
    /// Final status.
    pub status: StepStatus,
    /// Driver calls made for the main operation.
    pub attempts: u32,
    /// Provider-assigned id after the step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// Output attributes after the step.
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub outputs: Map<String, Value>,
    /// Error with its cause chain, or why the step was skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of an apply.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyResult {
    /// Overall status.
    pub status: RunStatus,
    /// One outcome per plan step, in plan order.
    pub steps: Vec<StepOutcome>,
    /// Wall-clock duration.
    pub duration: Duration,
}

impl ApplyResult {
    /// Outcome for `id`.
    pub fn outcome(&self, id: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Whether the whole run succeeded.
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Counts by final status.
    pub fn summary(&self) -> ApplySummary {
        let count = |status| self.steps.iter().filter(|s| s.status == status).count();
        ApplySummary {
            succeeded: count(StepStatus::Succeeded),
            failed: count(StepStatus::Failed),
            skipped: count(StepStatus::Skipped),
        }
    }
}

/// Step counts by final status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ApplySummary {
    /// Steps that succeeded.
    pub succeeded: usize,
    /// Steps that failed.
    pub failed: usize,
    /// Steps that never ran.
    pub skipped: usize,
}

impl fmt::Display for ApplySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed, {} skipped",
            self.succeeded, self.failed, self.skipped
        )
    }
}

/// Applies plans through registered drivers and records state.
#[derive(Clone)]
pub struct Executor {
    registry: Arc<DriverRegistry>,
    store: Arc<dyn StateStore>,
    options: ApplyOptions,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("registry", &self.registry)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Create an executor with default options.
    pub fn new(registry: Arc<DriverRegistry>, store: Arc<dyn StateStore>) -> Self {
        Self {
            registry,
            store,
            options: ApplyOptions::default(),
        }
    }

    /// Set the apply options.
    pub fn with_options(mut self, options: ApplyOptions) -> Self {
        self.options = options;
        self
    }

    /// The apply options.
    pub fn options(&self) -> &ApplyOptions {
        &self.options
    }

    /// Apply a plan to completion.
    pub async fn apply(&self, plan: Plan) -> ApplyResult {
        self.apply_with_cancel(plan, CancelToken::never()).await
    }

    /// Apply a plan, stopping early if `cancel` fires.
    ///
    /// After cancellation no new step starts. Steps already in flight run
    /// to completion (or time out), and every step that never started is
    /// reported as skipped.
    pub async fn apply_with_cancel(&self, mut plan: Plan, cancel: CancelToken) -> ApplyResult {
        let started = Instant::now();
        let count = plan.steps.len();
        let concurrency = self.options.concurrency.max(1);
        info!(steps = count, concurrency, "Applying plan");

        let mut waiting: Vec<usize> = plan.steps.iter().map(|s| s.depends_on.len()).collect();
        let mut dependents = vec![Vec::new(); count];
        for (index, step) in plan.steps.iter().enumerate() {
            for &dep in &step.depends_on {
                dependents[dep].push(index);
            }
        }
        let mut ready: BTreeSet<usize> = (0..count).filter(|&i| waiting[i] == 0).collect();

        let mut outputs: HashMap<usize, DriverOutput> = HashMap::new();
        let mut outcomes: Vec<StepOutcome> = plan
            .steps
            .iter()
            .map(|step| StepOutcome {
                id: step.id.clone(),
                resource_type: step.resource_type.clone(),
                planned_action: step.action,
                action: step.action,
                status: StepStatus::Pending,
                attempts: 0,
                external_id: None,
                outputs: Map::new(),
                error: None,
            })
            .collect();

        let mut in_flight: JoinSet<(usize, Result<StepReport, JoinError>)> = JoinSet::new();
        let mut cancelled = false;

        loop {
            if !cancelled && cancel.is_cancelled() {
                cancelled = true;
                info!("Apply cancelled, no new steps will start");
            }

            while !cancelled && in_flight.len() < concurrency {
                let Some(index) = ready.pop_first() else {
                    break;
                };
                if plan.steps[index].status != StepStatus::Pending {
                    continue;
                }
                plan.steps[index].status = StepStatus::InProgress;
                let job = self.job(&plan, index, &outputs, &cancel);
                in_flight.spawn(async move {
                    let handle = tokio::spawn(run_step(job));
                    (index, handle.await)
                });
            }

            if in_flight.is_empty() {
                break;
            }

            let joined = tokio::select! {
                _ = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    info!("Apply cancelled, waiting for in-flight steps");
                    continue;
                }
                joined = in_flight.join_next() => joined,
            };

            let (index, report) = match joined {
                Some(Ok((index, Ok(report)))) => (index, report),
                Some(Ok((index, Err(join_error)))) => {
                    error!(id = %plan.steps[index].id, error = %join_error, "Step task panicked");
                    (index, StepReport::failed(plan.steps[index].action, StepError::Panicked))
                },
                Some(Err(join_error)) => {
                    error!(error = %join_error, "Step supervisor task failed");
                    continue;
                },
                None => break,
            };

            let outcome = &mut outcomes[index];
            outcome.action = report.action;
            outcome.attempts = report.attempts;
            plan.steps[index].resolved = report.resolved;

            match report.result {
                Ok(output) => {
                    plan.steps[index].status = StepStatus::Succeeded;
                    outcome.status = StepStatus::Succeeded;
                    if outcome.action != Action::Delete {
                        outcome.external_id = Some(output.external_id.clone());
                        outcome.outputs = output.attributes.clone();
                    }
                    outputs.insert(index, output);

                    for &dependent in &dependents[index] {
                        waiting[dependent] -= 1;
                        if waiting[dependent] == 0
                            && plan.steps[dependent].status == StepStatus::Pending
                        {
                            ready.insert(dependent);
                        }
                    }
                },
                Err(err) => {
                    let chain = error_chain(&err);
                    error!(id = %outcome.id, action = %outcome.action, error = %chain, "Step failed");
                    plan.steps[index].status = StepStatus::Failed;
                    outcome.status = StepStatus::Failed;
                    outcome.error = Some(chain);
                    if let Some(prior) = &plan.steps[index].prior {
                        outcome.external_id = Some(prior.external_id.clone());
                    }

                    let reason = format!("dependency '{}' failed", plan.steps[index].id);
                    let mut stack = dependents[index].clone();
                    while let Some(dependent) = stack.pop() {
                        if plan.steps[dependent].status != StepStatus::Pending {
                            continue;
                        }
                        debug!(id = %plan.steps[dependent].id, %reason, "Skipping step");
                        plan.steps[dependent].status = StepStatus::Skipped;
                        outcomes[dependent].status = StepStatus::Skipped;
                        outcomes[dependent].error = Some(reason.clone());
                        stack.extend(dependents[dependent].iter().copied());
                    }
                },
            }
        }

        for (step, outcome) in plan.steps.iter_mut().zip(outcomes.iter_mut()) {
            match step.status {
                StepStatus::Pending => {
                    step.status = StepStatus::Skipped;
                    outcome.status = StepStatus::Skipped;
                    outcome.error = Some("cancelled".to_string());
                },
                StepStatus::InProgress => {
                    step.status = StepStatus::Failed;
                    outcome.status = StepStatus::Failed;
                    outcome.error = Some(StepError::Panicked.to_string());
                },
                _ => {},
            }
        }

        let failed = outcomes.iter().any(|o| o.status == StepStatus::Failed);
        let succeeded = outcomes.iter().any(|o| o.status == StepStatus::Succeeded);
        let status = if cancelled {
            RunStatus::Cancelled
        } else if !failed {
            RunStatus::Succeeded
        } else if succeeded {
            RunStatus::PartialFailure
        } else {
            RunStatus::Failed
        };

        let result = ApplyResult {
            status,
            steps: outcomes,
            duration: started.elapsed(),
        };
        info!(%status, summary = %result.summary(), duration = ?result.duration, "Apply finished");
        result
    }

    fn job(
        &self,
        plan: &Plan,
        index: usize,
        outputs: &HashMap<usize, DriverOutput>,
        cancel: &CancelToken,
    ) -> StepJob {
        let step = &plan.steps[index];
        let mut inputs = HashMap::new();
        let mut dependency_ids = Vec::new();
        for &dep in &step.depends_on {
            let dep_id = plan.steps[dep].id.clone();
            if let Some(output) = outputs.get(&dep) {
                inputs.insert(dep_id.clone(), output.clone());
            }
            dependency_ids.push(dep_id);
        }

        StepJob {
            id: step.id.clone(),
            resource_type: step.resource_type.clone(),
            action: step.action,
            properties: step.properties.clone(),
            schema: step.schema.clone(),
            prior: step.prior.clone(),
            dependency_ids,
            inputs,
            registry: self.registry.clone(),
            store: self.store.clone(),
            retry: self.options.retry.clone(),
            timeout: self.options.operation_timeout,
            refresh: self.options.refresh,
            cancel: cancel.clone(),
        }
    }
}

/// Everything a step needs, owned so it can run on its own task.
struct StepJob {
    id: String,
    resource_type: String,
    action: Action,
    properties: Vec<(String, Expr)>,
    schema: Option<Arc<ResourceSchema>>,
    prior: Option<StateRecord>,
    dependency_ids: Vec<String>,
    inputs: HashMap<String, DriverOutput>,
    registry: Arc<DriverRegistry>,
    store: Arc<dyn StateStore>,
    retry: RetryConfig,
    timeout: Option<Duration>,
    refresh: bool,
    cancel: CancelToken,
}

struct StepReport {
    action: Action,
    attempts: u32,
    resolved: Option<Value>,
    result: Result<DriverOutput, StepError>,
}

impl StepReport {
    fn failed(action: Action, error: StepError) -> Self {
        Self {
            action,
            attempts: 0,
            resolved: None,
            result: Err(error),
        }
    }
}

#[instrument(skip_all, fields(id = %job.id, action = %job.action))]
async fn run_step(job: StepJob) -> StepReport {
    let driver = match job.registry.resolve(&job.resource_type) {
        Ok(driver) => driver,
        Err(_) => {
            return StepReport::failed(job.action, StepError::UnknownType(job.resource_type.clone()))
        },
    };

    if job.action == Action::Delete {
        return delete_step(&job, driver.as_ref()).await;
    }

    let mut lookup = |reference: &Reference| -> Result<Value, StepError> {
        let output = job.inputs.get(&reference.target).ok_or_else(|| {
            StepError::Resolution(format!("'{}' has not been applied", reference.target))
        })?;
        output_value(&output.external_id, &output.attributes, reference).ok_or_else(|| {
            StepError::Resolution(format!("'{}' has no output attribute", reference))
        })
    };
    let resolved = match resolve_properties(&job.properties, &mut lookup) {
        Ok(resolved) => resolved,
        Err(e) => return StepReport::failed(job.action, e),
    };

    let mut action = job.action;
    if action == Action::NoOp {
        match &job.prior {
            Some(prior) if prior.status == ApplyStatus::Succeeded && unchanged(&job, prior, &resolved) => {
                debug!("No changes");
                let mut result = Ok(DriverOutput {
                    external_id: prior.external_id.clone(),
                    attributes: prior.attributes.clone(),
                });
                // Recorded dependencies drive delete ordering.
                if prior.dependencies != job.dependency_ids {
                    let refreshed = prior.clone().with_dependencies(job.dependency_ids.clone());
                    match job.store.put(&job.id, &refreshed).await {
                        Ok(()) => debug!("Updated recorded dependencies"),
                        Err(e) => result = Err(StepError::State(e)),
                    }
                }
                return StepReport {
                    action,
                    attempts: 0,
                    resolved: Some(resolved),
                    result,
                };
            },
            _ => {
                info!("Upstream outputs changed, promoting to update");
                action = Action::Update;
            },
        }
    }

    let mut current = job.prior.as_ref().map(StateRecord::current);
    if action == Action::Update && job.refresh {
        if let Some(recorded) = current.take() {
            current = match call(&job, || driver.read(&job.id, &recorded)).await {
                Ok((Some(live), _)) => Some(CurrentResource {
                    external_id: live.external_id,
                    properties: recorded.properties,
                    attributes: live.attributes,
                }),
                Ok((None, _)) => {
                    warn!("Resource no longer exists, recreating");
                    action = Action::Create;
                    None
                },
                Err(StepError::Driver {
                    source: DriverError::Unimplemented(_),
                    ..
                }) => {
                    debug!("Driver does not support read, skipping refresh");
                    Some(recorded)
                },
                Err(e) => return StepReport::failed(action, e),
            };
        }
    }

    info!(%action, "Applying resource");
    let result = match (&current, action) {
        (Some(current), Action::Update) => {
            call(&job, || driver.update(&job.id, current, &resolved)).await
        },
        _ => {
            action = Action::Create;
            call(&job, || driver.create(&job.id, &resolved)).await
        },
    };

    let (output, attempts) = match result {
        Ok(done) => done,
        Err(e) => {
            if let Some(prior) = &job.prior {
                let failed = prior.clone().with_status(ApplyStatus::Failed);
                if let Err(state_error) = job.store.put(&job.id, &failed).await {
                    error!(error = %error_chain(&state_error), "Failed to record failed apply");
                }
            }
            let attempts = match &e {
                StepError::Driver { attempts, .. } => *attempts,
                _ => 0,
            };
            return StepReport {
                action,
                attempts,
                resolved: Some(resolved),
                result: Err(e),
            };
        },
    };

    let record = StateRecord::new(&job.resource_type, &output.external_id)
        .with_properties(resolved.clone())
        .with_attributes(output.attributes.clone())
        .with_dependencies(job.dependency_ids.clone());
    let result = match job.store.put(&job.id, &record).await {
        Ok(()) => {
            info!(external_id = %output.external_id, attempts, "Resource applied");
            Ok(output)
        },
        Err(e) => Err(StepError::State(e)),
    };

    StepReport {
        action,
        attempts,
        resolved: Some(resolved),
        result,
    }
}

async fn delete_step(job: &StepJob, driver: &dyn Driver) -> StepReport {
    let Some(prior) = &job.prior else {
        return StepReport::failed(
            Action::Delete,
            StepError::Resolution("nothing recorded to delete".to_string()),
        );
    };
    let current = prior.current();

    info!(external_id = %prior.external_id, "Deleting resource");
    let attempts = match call(job, || driver.delete(&job.id, &current)).await {
        Ok(((), attempts)) => attempts,
        Err(StepError::Driver {
            attempts,
            source: DriverError::NotFound(_),
        }) => {
            debug!("Resource already gone");
            attempts
        },
        Err(e) => {
            let attempts = match &e {
                StepError::Driver { attempts, .. } => *attempts,
                _ => 0,
            };
            return StepReport {
                action: Action::Delete,
                attempts,
                resolved: None,
                result: Err(e),
            };
        },
    };

    let result = match job.store.delete(&job.id).await {
        Ok(()) => {
            info!(attempts, "Resource deleted");
            Ok(DriverOutput::new(prior.external_id.clone()))
        },
        Err(e) => Err(StepError::State(e)),
    };
    StepReport {
        action: Action::Delete,
        attempts,
        resolved: None,
        result,
    }
}

/// One driver operation under the job's retry policy.
async fn call<T, F, Fut>(job: &StepJob, operation: F) -> Result<(T, u32), StepError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, DriverError>>,
{
    with_retry(&job.retry, job.timeout, &job.cancel, operation)
        .await
        .map_err(|e| match e {
            RetryError::Exhausted { attempts, error } => StepError::Driver {
                attempts,
                source: error,
            },
            RetryError::Cancelled { .. } => StepError::Cancelled,
        })
}

/// Whether freshly resolved properties match the record.
fn unchanged(job: &StepJob, prior: &StateRecord, resolved: &Value) -> bool {
    let mut recorded = prior.properties.clone();
    let mut desired = resolved.clone();
    if let Some(schema) = &job.schema {
        schema.normalize(&mut recorded);
        schema.normalize(&mut desired);
    }
    recorded == desired
}
