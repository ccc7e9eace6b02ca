use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Identifier of a task or condition inside a specification.
pub type ElementId = String;

/// Identifier under which a specification is registered with the engine.
pub type SpecificationId = String;

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Case variables. Opaque to the engine apart from guard evaluation and
/// multi-instance input counting.
pub type CaseData = serde_json::Map<String, serde_json::Value>;

// ─── Identifiers ──────────────────────────────────────────────

/// A running case (one instance of a process specification).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseId(pub Uuid);

impl CaseId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for CaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One dynamic occurrence of a task (the identity carried by a token on a
/// task place).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Work item key. Embeds the owning case so a completion can be routed to
/// the right case controller without a global index.
///
/// Rendered as `"{case_id}:{item}"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkItemId {
    pub case_id: CaseId,
    pub item: Uuid,
}

impl WorkItemId {
    pub fn new(case_id: CaseId) -> Self {
        Self {
            case_id,
            item: Uuid::now_v7(),
        }
    }
}

impl fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.case_id, self.item)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed work item id: {0}")]
pub struct ParseWorkItemIdError(String);

impl FromStr for WorkItemId {
    type Err = ParseWorkItemIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (case, item) = s
            .split_once(':')
            .ok_or_else(|| ParseWorkItemIdError(s.to_string()))?;
        let case_id = Uuid::parse_str(case).map_err(|_| ParseWorkItemIdError(s.to_string()))?;
        let item = Uuid::parse_str(item).map_err(|_| ParseWorkItemIdError(s.to_string()))?;
        Ok(Self {
            case_id: CaseId(case_id),
            item,
        })
    }
}

impl TryFrom<String> for WorkItemId {
    type Error = ParseWorkItemIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WorkItemId> for String {
    fn from(id: WorkItemId) -> Self {
        id.to_string()
    }
}

// ─── Split / join semantics ───────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JoinType {
    And,
    #[default]
    Xor,
    Or,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SplitType {
    #[default]
    And,
    Xor,
    Or,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionKind {
    Input,
    Output,
    #[default]
    Intermediate,
    /// Inserted at load time for a direct task → task flow.
    Implicit,
}

// ─── Multi-instance parameters ────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreationMode {
    /// All instances are created when the task fires.
    #[default]
    Static,
    /// Instances may be added while the task is running, up to `max`.
    Dynamic,
}

/// What happens to instances still running when the completion threshold of
/// a multi-instance task is reached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemainingInstancePolicy {
    /// Running instances are moved to `Completed` together with the exit.
    #[default]
    ForceComplete,
    /// Running instances stay live and may still be completed, but no longer
    /// affect control flow.
    Abandon,
}

// ─── Tokens ───────────────────────────────────────────────────

/// A token on a place. Tokens on conditions carry no instance; tokens on a
/// task place carry the instance they stand for.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Token {
    pub place: ElementId,
    pub instance: Option<InstanceId>,
}

impl Token {
    pub fn condition(place: impl Into<ElementId>) -> Self {
        Self {
            place: place.into(),
            instance: None,
        }
    }

    pub fn instance(place: impl Into<ElementId>, instance: InstanceId) -> Self {
        Self {
            place: place.into(),
            instance: Some(instance),
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.instance {
            Some(instance) => write!(f, "{}#{}", self.place, instance),
            None => f.write_str(&self.place),
        }
    }
}

// ─── Case status ──────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaseStatus {
    Running,
    Completed { at: Timestamp },
    Cancelled { at: Timestamp },
}

impl CaseStatus {
    /// Returns true if no further progress is possible.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CaseStatus::Running)
    }
}

pub(crate) fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
