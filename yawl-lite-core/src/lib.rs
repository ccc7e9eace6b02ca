//! yawl-lite core
//!
//! Case execution for Petri-net workflows: conditions are places, tasks are
//! transitions, a case is a marking plus the work items handed to the
//! outside world.
//!
//! ```text
//! Specification ──► FiringEngine ──► Transaction ──► CaseController ──► Engine
//!   (read-only)      (enablement,      (one command     (actor per       (registries,
//!                     deltas)           on a copy)       case)            event stream)
//! ```
//!
//! Joins and splits support AND, XOR and OR (with a precomputed OR-join
//! scope). Tasks may cancel a region on exit, run as multiple instances, or
//! be automatic routing steps.

pub mod case;
pub mod config;
mod controller;
pub mod engine;
pub mod error;
pub mod events;
pub mod firing;
pub mod guard;
pub mod marking;
pub mod multi_instance;
pub mod specification;
pub mod store;
pub mod store_memory;
mod transaction;
pub mod types;
pub mod work_item;

pub use case::{CaseSnapshot, CaseState};
pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, EngineResult};
pub use events::{ChangeReason, EngineEvent};
pub use guard::{DataGuardEvaluator, GuardEvaluator};
pub use marking::{Marking, MarkingDelta, TokenCount};
pub use specification::{
    Flow, MultiInstanceParams, Specification, SpecificationBuilder, SpecificationDto,
    SpecificationLoader, Task,
};
pub use store::CaseStore;
pub use store_memory::MemoryCaseStore;
pub use types::{
    CaseData, CaseId, CaseStatus, ConditionKind, CreationMode, ElementId, InstanceId, JoinType,
    RemainingInstancePolicy, SpecificationId, SplitType, Token, WorkItemId,
};
pub use work_item::{WorkItem, WorkItemEvent, WorkItemState};
