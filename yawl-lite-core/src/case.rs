//! Case state (everything a case controller owns) and the read-only
//! snapshot handed out by the engine.

use crate::error::{EngineError, EngineResult};
use crate::marking::{Marking, TokenCount};
use crate::multi_instance::MultiInstanceManager;
use crate::types::{now_ms, CaseData, CaseId, CaseStatus, SpecificationId, Timestamp};
use crate::work_item::{WorkItem, WorkItemLifecycle, WorkItemState};
use serde::{Deserialize, Serialize};

const FORMAT_VERSION: u32 = 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaseState {
    pub id: CaseId,
    pub specification_id: SpecificationId,
    pub status: CaseStatus,
    pub suspended: bool,
    pub data: CaseData,
    pub marking: Marking,
    pub work_items: WorkItemLifecycle,
    pub multi_instance: MultiInstanceManager,
    /// Last routing failure, cleared by the next successful command.
    pub stall: Option<String>,
    /// Hex digest of the marking last reported as deadlocked.
    pub deadlock_digest: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Serialize, Deserialize)]
struct PersistedCase {
    format: u32,
    state: CaseState,
}

impl CaseState {
    pub fn new(id: CaseId, specification_id: SpecificationId, data: CaseData) -> Self {
        let now = now_ms();
        Self {
            id,
            specification_id,
            status: CaseStatus::Running,
            suspended: false,
            data,
            marking: Marking::new(),
            work_items: WorkItemLifecycle::new(id),
            multi_instance: MultiInstanceManager::new(),
            stall: None,
            deadlock_digest: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == CaseStatus::Running
    }

    pub fn to_bytes(&self) -> EngineResult<Vec<u8>> {
        Ok(serde_json::to_vec(&PersistedCase {
            format: FORMAT_VERSION,
            state: self.clone(),
        })?)
    }

    pub fn from_bytes(bytes: &[u8]) -> EngineResult<Self> {
        let persisted: PersistedCase = serde_json::from_slice(bytes)?;
        if persisted.format != FORMAT_VERSION {
            return Err(EngineError::Serialization(serde::de::Error::custom(
                format!("unsupported case format {}", persisted.format),
            )));
        }
        Ok(persisted.state)
    }

    pub fn snapshot(&self) -> CaseSnapshot {
        CaseSnapshot {
            case_id: self.id,
            specification_id: self.specification_id.clone(),
            status: self.status.clone(),
            suspended: self.suspended,
            live_work_items: self.work_items.live().cloned().collect(),
            marking_digest: hex::encode(self.marking.digest()),
            tokens: self.marking.export_tokens(),
            data: self.data.clone(),
            stall: self.stall.clone(),
        }
    }
}

/// Point-in-time view of a case.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaseSnapshot {
    pub case_id: CaseId,
    pub specification_id: SpecificationId,
    pub status: CaseStatus,
    pub suspended: bool,
    pub live_work_items: Vec<WorkItem>,
    /// Hex SHA-256 of the marking.
    pub marking_digest: String,
    pub tokens: Vec<TokenCount>,
    pub data: CaseData,
    pub stall: Option<String>,
}

impl CaseSnapshot {
    pub fn items_for(&self, task: &str) -> Vec<&WorkItem> {
        self.live_work_items
            .iter()
            .filter(|w| w.task_id == task)
            .collect()
    }

    pub fn items_in(&self, state: WorkItemState) -> Vec<&WorkItem> {
        self.live_work_items
            .iter()
            .filter(|w| w.state == state)
            .collect()
    }

    pub fn tokens_at(&self, place: &str) -> usize {
        self.tokens
            .iter()
            .filter(|t| t.token.place == place)
            .map(|t| t.count)
            .sum()
    }

    pub fn total_tokens(&self) -> usize {
        self.tokens.iter().map(|t| t.count).sum()
    }
}
