use crate::events::EngineEvent;
use crate::store::CaseStore;
use crate::types::CaseId;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

/// In-memory CaseStore for tests and embedding.
pub struct MemoryCaseStore {
    snapshots: RwLock<HashMap<CaseId, Vec<u8>>>,
    events: RwLock<HashMap<CaseId, Vec<EngineEvent>>>,
}

impl MemoryCaseStore {
    pub fn new() -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryCaseStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaseStore for MemoryCaseStore {
    async fn save_snapshot(&self, case_id: CaseId, bytes: &[u8]) -> Result<()> {
        let mut store = self.snapshots.write().map_err(|e| anyhow!("Lock: {}", e))?;
        store.insert(case_id, bytes.to_vec());
        Ok(())
    }

    async fn load_snapshot(&self, case_id: CaseId) -> Result<Option<Vec<u8>>> {
        let store = self.snapshots.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(store.get(&case_id).cloned())
    }

    async fn delete_snapshot(&self, case_id: CaseId) -> Result<()> {
        let mut store = self.snapshots.write().map_err(|e| anyhow!("Lock: {}", e))?;
        store.remove(&case_id);
        Ok(())
    }

    async fn list_cases(&self) -> Result<Vec<CaseId>> {
        let store = self.snapshots.read().map_err(|e| anyhow!("Lock: {}", e))?;
        let mut ids: Vec<CaseId> = store.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    async fn commit(
        &self,
        case_id: CaseId,
        events: &[EngineEvent],
        snapshot: Option<&[u8]>,
    ) -> Result<()> {
        // Both locks first: nothing is written unless both are held.
        let mut logs = self.events.write().map_err(|e| anyhow!("Lock: {}", e))?;
        let mut snapshots = self.snapshots.write().map_err(|e| anyhow!("Lock: {}", e))?;
        logs.entry(case_id).or_default().extend(events.iter().cloned());
        if let Some(bytes) = snapshot {
            snapshots.insert(case_id, bytes.to_vec());
        }
        Ok(())
    }

    async fn read_events(&self, case_id: CaseId, from_seq: u64) -> Result<Vec<(u64, EngineEvent)>> {
        let store = self.events.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(store
            .get(&case_id)
            .map(|log| {
                log.iter()
                    .enumerate()
                    .skip(from_seq as usize)
                    .map(|(seq, event)| (seq as u64, event.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}
