use crate::events::EngineEvent;
use crate::types::CaseId;
use anyhow::Result;
use async_trait::async_trait;

/// Persistence collaborator for case state.
///
/// The engine keeps every case in memory and writes through this trait after
/// each successful command: the events the command produced and a full
/// snapshot (serde_json bytes of the case state), in one `commit`. Backends
/// are pluggable; `MemoryCaseStore` ships for tests and embedding.
#[async_trait]
pub trait CaseStore: Send + Sync {
    // ── Snapshots ──

    async fn save_snapshot(&self, case_id: CaseId, bytes: &[u8]) -> Result<()>;
    async fn load_snapshot(&self, case_id: CaseId) -> Result<Option<Vec<u8>>>;
    async fn delete_snapshot(&self, case_id: CaseId) -> Result<()>;
    async fn list_cases(&self) -> Result<Vec<CaseId>>;

    // ── Commits ──

    /// Persist one command: append `events` to the case's log (sequence
    /// numbers start at 0) and, when given, replace the snapshot. Both are
    /// applied or neither is.
    async fn commit(
        &self,
        case_id: CaseId,
        events: &[EngineEvent],
        snapshot: Option<&[u8]>,
    ) -> Result<()>;

    // ── Event log ──

    /// Events with sequence number `>= from_seq`, in order.
    async fn read_events(&self, case_id: CaseId, from_seq: u64) -> Result<Vec<(u64, EngineEvent)>>;
}
