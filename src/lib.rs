//! Hemmer Engine
//!
//! A provisioning engine for declarative infrastructure documents. It turns a
//! document of resource declarations into a dependency graph, diffs that graph
//! against recorded state to compile a plan, and applies the plan through
//! pluggable per-type drivers, recording state as it goes.
//!
//! # Overview
//!
//! - **Documents**: [`Document`] and [`ResourceDecl`], loadable from JSON,
//!   with cross-resource references ([`Expr`], [`Reference`]) and variables
//! - **Graph**: [`graph::build`] validates a document into a [`ResourceGraph`]
//! - **Plans**: [`plan::compile`] orders the graph and diffs it against a
//!   [`StateSnapshot`] into a [`Plan`] of create, update, delete and no-op
//!   steps
//! - **Drivers**: the [`Driver`] trait and a [`DriverRegistry`] keyed by type
//!   tag
//! - **State**: the [`StateStore`] trait with [`MemoryStateStore`] and
//!   [`FileStateStore`]
//! - **Execution**: an [`Executor`] that applies plans concurrently with
//!   retries and cancellation, and the [`Engine`] facade that runs the whole
//!   pipeline
//! - **Logging**: Integration with `tracing` for structured logging
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use hemmer_engine::{
//!     async_trait, CurrentResource, Document, Driver, DriverError, DriverOutput,
//!     DriverRegistry, Engine, Expr, MemoryStateStore, ResourceDecl,
//! };
//! use serde_json::Value;
//!
//! struct Buckets;
//!
//! #[async_trait]
//! impl Driver for Buckets {
//!     async fn create(&self, id: &str, properties: &Value) -> Result<DriverOutput, DriverError> {
//!         Ok(DriverOutput::new(format!("bkt-{}", id))
//!             .with_attribute("domain", format!("{}.example.com", properties["name"].as_str().unwrap_or(id)).into()))
//!     }
//!
//!     async fn update(
//!         &self,
//!         _id: &str,
//!         current: &CurrentResource,
//!         _properties: &Value,
//!     ) -> Result<DriverOutput, DriverError> {
//!         Ok(DriverOutput::new(current.external_id.clone()))
//!     }
//!
//!     async fn delete(&self, _id: &str, _current: &CurrentResource) -> Result<(), DriverError> {
//!         Ok(())
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let registry = DriverRegistry::new().with_driver("bucket", Arc::new(Buckets));
//! let engine = Engine::new(registry, Arc::new(MemoryStateStore::new()));
//!
//! let doc = Document::new()
//!     .with_resource(ResourceDecl::new("Site", "bucket").with_property("name", "site"))
//!     .with_resource(
//!         ResourceDecl::new("Logs", "bucket")
//!             .with_property("name", "logs")
//!             .with_property("source", Expr::get_attr("Site", "domain")),
//!     );
//!
//! println!("{}", engine.plan(&doc).await?);
//! let result = engine.apply(&doc).await?;
//! assert!(result.is_success());
//! # Ok::<(), hemmer_engine::EngineError>(())
//! # }).unwrap();
//! ```
//!
//! # Execution Model
//!
//! Steps run as soon as every step they depend on has succeeded, up to
//! [`ApplyOptions::concurrency`] at a time. Transient driver errors are
//! retried with exponential backoff; permanent ones fail the step at once.
//! A failed step skips its dependents while unrelated steps continue. State
//! is written per resource as each step finishes, so a partially failed run
//! resumes where it stopped on the next apply.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod document;
pub mod driver;
pub mod engine;
pub mod error;
pub mod executor;
pub mod expr;
pub mod graph;
pub mod logging;
pub mod options;
pub mod plan;
pub mod retry;
pub mod schema;
pub mod state;
pub mod testing;
pub mod types;
pub mod validation;

// Re-export main types at crate root
pub use cancel::{cancel_on_shutdown_signal, cancel_pair, CancelHandle, CancelToken};
pub use document::{Document, ResourceDecl};
pub use driver::{CurrentResource, Driver, DriverOutput, DriverRegistry};
pub use engine::Engine;
pub use error::{
    error_chain, DriverError, EngineError, ErrorClass, PlanError, StateStoreError, StepError,
    ValidationError,
};
pub use executor::{ApplyResult, ApplySummary, Executor, RunStatus, StepOutcome};
pub use expr::{Expr, Reference};
pub use graph::{ResourceGraph, ResourceNode};
pub use logging::{init_logging, init_logging_with_default, try_init_logging};
pub use options::ApplyOptions;
pub use plan::{Action, Plan, PlanStep, PlanSummary, StepStatus};
pub use retry::RetryConfig;
pub use schema::{Attribute, AttributeType, ResourceSchema};
pub use state::{
    ApplyStatus, FileStateStore, MemoryStateStore, StateLock, StateRecord, StateSnapshot,
    StateStore,
};
pub use types::AttributeChange;
pub use validation::{is_valid, validate};

// Re-export async_trait for convenience
pub use async_trait::async_trait;

// Re-export commonly used external types
pub use serde_json;
pub use tonic;
pub use tracing;
