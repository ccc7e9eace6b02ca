use crate::types::{CaseId, ElementId, InstanceId, SpecificationId, WorkItemId};
use crate::work_item::WorkItemState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Why a work item changed state, when the change was not requested for
/// that item directly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeReason {
    /// Requested through the engine API.
    Requested,
    /// Fast-forwarded by a completion or start request.
    FastForward,
    /// The task lost its enablement (deferred choice, cancellation).
    Withdrawn,
    /// Removed by a cancellation set.
    CancellationRegion,
    /// Multi-instance threshold reached, instance force-completed.
    ThresholdReached,
    /// Multi-instance parent cancelled.
    ParentCancelled,
    CaseCancelled,
    /// Fired and completed by the engine (automatic task or MI parent).
    Engine,
}

/// Engine events: the audit trail of every case, broadcast to subscribers
/// and appended to the case store when one is configured.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    CaseStarted {
        case_id: CaseId,
        specification_id: SpecificationId,
    },
    WorkItemEnabled {
        case_id: CaseId,
        work_item_id: WorkItemId,
        task_id: ElementId,
    },
    WorkItemStateChanged {
        case_id: CaseId,
        work_item_id: WorkItemId,
        task_id: ElementId,
        from: WorkItemState,
        to: WorkItemState,
        reason: ChangeReason,
    },
    TaskFired {
        case_id: CaseId,
        task_id: ElementId,
        instances: Vec<InstanceId>,
    },
    TaskExited {
        case_id: CaseId,
        task_id: ElementId,
        routed_to: Vec<ElementId>,
        cancelled: usize,
    },
    CaseCompleted {
        case_id: CaseId,
    },
    CaseCancelled {
        case_id: CaseId,
    },
    CaseDeadlocked {
        case_id: CaseId,
        marked_places: BTreeSet<ElementId>,
    },
    CaseSuspended {
        case_id: CaseId,
    },
    CaseResumed {
        case_id: CaseId,
    },
}

impl EngineEvent {
    pub fn case_id(&self) -> CaseId {
        match self {
            EngineEvent::CaseStarted { case_id, .. }
            | EngineEvent::WorkItemEnabled { case_id, .. }
            | EngineEvent::WorkItemStateChanged { case_id, .. }
            | EngineEvent::TaskFired { case_id, .. }
            | EngineEvent::TaskExited { case_id, .. }
            | EngineEvent::CaseCompleted { case_id }
            | EngineEvent::CaseCancelled { case_id }
            | EngineEvent::CaseDeadlocked { case_id, .. }
            | EngineEvent::CaseSuspended { case_id }
            | EngineEvent::CaseResumed { case_id } => *case_id,
        }
    }

    /// Events after which the case accepts no further work.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineEvent::CaseCompleted { .. } | EngineEvent::CaseCancelled { .. }
        )
    }
}
