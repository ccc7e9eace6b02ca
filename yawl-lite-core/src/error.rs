//! Engine error taxonomy.
//!
//! Every failure the engine surfaces maps to exactly one `EngineError`
//! variant. The variants fall into five groups:
//!
//! ```text
//! structural      → InvalidSpecification | UnknownElement | InvalidMultiInstanceParams
//! races           → InsufficientTokens (internal, retried) | FiringConflict
//! illegal request → IllegalTransition | UnknownWorkItem | UnknownCase | UnknownSpecification
//!                   | AlreadyEnabled | TaskNotEnabled | CaseSuspended | CaseNotRunning
//!                   | CaseAlreadyLoaded | DynamicCreationDisabled | NotMultiInstance
//! routing         → NoOutgoingFlowSatisfied | InstanceLimitExceeded | AutoStepLimitExceeded
//! ambient         → Store | Serialization | EngineShutdown
//! ```
//!
//! ## Rules
//!
//! - `thiserror` for enum derivation, no manual `Display` impls.
//! - Illegal requests leave the case untouched.
//! - `InsufficientTokens` never leaves the case controller; retry exhaustion
//!   becomes `FiringConflict`.

use crate::types::{CaseId, CaseStatus, ElementId, InstanceId, SpecificationId, WorkItemId};
use crate::work_item::{WorkItemEvent, WorkItemState};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ── Structural ──
    #[error("Invalid specification: {reason}")]
    InvalidSpecification { reason: String },

    #[error("Unknown element: {id}")]
    UnknownElement { id: ElementId },

    #[error("Invalid multi-instance parameters on task {task}: {reason}")]
    InvalidMultiInstanceParams { task: ElementId, reason: String },

    // ── Races ──
    #[error("Insufficient tokens on {place}: needed {needed}, present {present}")]
    InsufficientTokens {
        place: String,
        needed: usize,
        present: usize,
    },

    #[error("Firing on case {case_id} still conflicting after {attempts} attempts")]
    FiringConflict { case_id: CaseId, attempts: u32 },

    // ── Illegal requests ──
    #[error("Illegal transition {event:?} for work item {id} in state {from:?}")]
    IllegalTransition {
        id: WorkItemId,
        from: WorkItemState,
        event: WorkItemEvent,
    },

    #[error("Unknown work item: {id}")]
    UnknownWorkItem { id: WorkItemId },

    #[error("Unknown case: {id}")]
    UnknownCase { id: CaseId },

    #[error("Unknown specification: {id}")]
    UnknownSpecification { id: SpecificationId },

    #[error("Task {task} already has a live work item for instance {instance:?}")]
    AlreadyEnabled {
        task: ElementId,
        instance: Option<InstanceId>,
    },

    #[error("Task {task} is not enabled")]
    TaskNotEnabled { task: ElementId },

    #[error("Case {id} is suspended")]
    CaseSuspended { id: CaseId },

    #[error("Case {id} is not running ({status:?})")]
    CaseNotRunning { id: CaseId, status: CaseStatus },

    #[error("Case {id} is already loaded")]
    CaseAlreadyLoaded { id: CaseId },

    #[error("Task {task} creates its instances statically")]
    DynamicCreationDisabled { task: ElementId },

    #[error("Task {task} is not a multi-instance task")]
    NotMultiInstance { task: ElementId },

    // ── Routing exhaustion ──
    #[error("No outgoing flow of task {task} is satisfied")]
    NoOutgoingFlowSatisfied { task: ElementId },

    #[error("Task {task} requested {requested} instances, limit is {max}")]
    InstanceLimitExceeded {
        task: ElementId,
        requested: usize,
        max: u32,
    },

    #[error("Automatic task cascade exceeded {limit} steps")]
    AutoStepLimitExceeded { limit: u32 },

    // ── Ambient ──
    #[error("Case store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Engine is shut down")]
    EngineShutdown,
}

impl EngineError {
    /// Errors that halt progress of a case until its data is corrected.
    pub fn is_routing_exhaustion(&self) -> bool {
        matches!(
            self,
            EngineError::NoOutgoingFlowSatisfied { .. }
                | EngineError::InstanceLimitExceeded { .. }
                | EngineError::AutoStepLimitExceeded { .. }
        )
    }

    /// Errors caused by a malformed or out-of-order external request.
    pub fn is_illegal_request(&self) -> bool {
        matches!(
            self,
            EngineError::IllegalTransition { .. }
                | EngineError::UnknownWorkItem { .. }
                | EngineError::UnknownCase { .. }
                | EngineError::UnknownSpecification { .. }
                | EngineError::AlreadyEnabled { .. }
                | EngineError::TaskNotEnabled { .. }
                | EngineError::CaseSuspended { .. }
                | EngineError::CaseNotRunning { .. }
                | EngineError::CaseAlreadyLoaded { .. }
                | EngineError::DynamicCreationDisabled { .. }
                | EngineError::NotMultiInstance { .. }
        )
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        EngineError::InvalidSpecification {
            reason: reason.into(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
