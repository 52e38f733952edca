//! StackFlow provisioning core
//!
//! Declarative provisioning of interdependent infrastructure resources:
//! declarations are turned into a dependency graph, reconciled against the
//! last applied state into a leveled plan, and applied in parallel level by
//! level.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  Stack (ResourceNode + OutputDeclaration)     │
//! └──────────────────────┬────────────────────────┘
//!                        │
//! ┌──────────────────────▼────────────────────────┐
//! │  GraphBuilder ─► resolver ─► plan             │
//! │                                 ▲             │
//! │                      StateStore │             │
//! └──────────────────────┬──────────┴─────────────┘
//!                        │ Plan
//! ┌──────────────────────▼────────────────────────┐
//! │  ApplyExecutor                                │
//! │  trait ResourceProvider { create, update, ..} │
//! └───────────────────────────────────────────────┘
//! ```

pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod graph;
pub mod model;
pub mod plan;
pub mod provider;
pub mod resolver;
pub mod retry;
pub mod state;

// Re-exports
pub use context::StackContext;
pub use engine::Engine;
pub use error::{ErrorClass, ProviderError, Result, Retryable, StackError};
pub use executor::{
    ApplyExecutor, ApplyOptions, ApplyReport, Cancellation, ExportedOutput, NodeResult,
};
pub use graph::{DependencyEdge, EdgeKind, GraphBuilder, ResourceGraph};
pub use model::{AttributeReference, NodeStatus, OutputDeclaration, ResourceNode, Stack, Value};
pub use plan::{Plan, PlanAction, PlanStep, PlanSummary, UNKNOWN};
pub use provider::{ChangeKind, Outputs, ProviderResult, ResolvedNode, ResourceProvider};
pub use resolver::ExecutionOrder;
pub use retry::{RetryConfig, with_retry};
pub use state::{
    FileStateStore, LockInfo, MemoryStateStore, StackState, StateLock, StateRecord, StateStore,
};
