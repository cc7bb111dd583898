//! # Declarative
//!
//! A declarative resource reconciliation engine.
//!
//! Given a desired graph of resources, the engine resolves the order in
//! which they must be touched, diffs each one against the last-applied
//! snapshot in a state store, and converges remote systems to match by
//! calling providers on a bounded worker pool.
//!
//! ## Core Concepts
//!
//! - **ResourceGraph**: Desired resources; edges come from references between attributes
//! - **StateStore**: Last-applied attributes per resource, flushed after every action
//! - **Plan**: One action per resource (create, update, replace, delete, no-op)
//! - **Provider**: CRUD calls for one family of resource kinds
//! - **Engine**: Refresh, plan and apply wired together
//!
//! ## Example
//!
//! ```ignore
//! use declarative::{
//!     CancellationToken, Engine, KindRegistry, MemoryProvider, MemoryStateStore,
//!     NoProgress, PlanOptions, ProviderRegistry, Reference, ResourceGraph,
//!     ResourceId, ResourceNode,
//! };
//! use std::sync::Arc;
//!
//! let network = ResourceId::new("network", "main");
//! let graph = ResourceGraph::new(vec![
//!     ResourceNode::new(network.clone()).with("cidr", "10.0.0.0/16"),
//!     ResourceNode::new(ResourceId::new("subnet", "a"))
//!         .with("network", Reference::new(network, "id"))
//!         .with("cidr", "10.0.1.0/24"),
//! ])?;
//!
//! let providers = ProviderRegistry::single(Arc::new(MemoryProvider::new()));
//! let engine = Engine::new(providers, KindRegistry::new());
//! let mut store = MemoryStateStore::new();
//!
//! let report = engine.converge(
//!     &graph,
//!     &mut store,
//!     &PlanOptions::default(),
//!     &mut NoProgress,
//!     &CancellationToken::new(),
//! )?;
//! assert_eq!(report.summary.created, 2);
//! ```
//!
//! ## Extension Points
//!
//! - [`Provider`]: Talks to the remote API for one or more kinds
//! - [`StateStore`]: Persists records (memory and JSON file stores included)
//! - [`ProgressCallback`]: Receives progress updates from the coordinator
//!
//! The engine has no hard dependency on any UI, storage backend or API client.

pub mod context;
pub mod diff;
pub mod engine;
pub mod error;
pub mod graph;
pub mod kinds;
pub mod planner;
pub mod provider;
pub mod refresh;
pub mod resolver;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod types;

// Re-export main types at crate root
pub use context::{CancellationToken, GraphContext, NoProgress, ProgressCallback};
pub use diff::{Action, ActionKind, AttributeDiff, Change};
pub use engine::{Engine, Planned};
pub use error::{
    ConflictError, Error, ErrorCategory, ProviderError, Result, StateError, ValidationError,
};
pub use graph::{Edge, ResourceGraph, ResourceNode};
pub use kinds::{KindRegistry, KindSpec};
pub use planner::{Plan, PlanSummary, Step, StepOp};
pub use provider::{
    Created, MemoryProvider, Provider, ProviderRegistry, ProviderResult, RemoteObject,
};
pub use refresh::RefreshReport;
pub use scheduler::RunReport;
pub use state::{
    FileStateStore, MemoryStateStore, RecordStatus, StateRecord, StateSnapshot, StateStore,
};
pub use types::{
    Attributes, ExecuteOptions, ExecuteSummary, NodeOutcome, PlanOptions, Reference, ResourceId,
    RetryConfig, Value,
};
