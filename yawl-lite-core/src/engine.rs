//! Engine facade.
//!
//! ```text
//! specifications: RwLock<HashMap<SpecificationId, Arc<Specification>>>
//! cases:          RwLock<HashMap<CaseId, CaseHandle>>   (mailboxes only)
//! finished:       RwLock<FinishedCases>                 (final states, bounded)
//! events:         broadcast::Sender<EngineEvent>        (shared by all cases)
//! ```
//!
//! Every request for a running case is forwarded to the case's controller
//! task and answered over a oneshot channel. A case that completes or is
//! cancelled releases its controller; its final state moves to `finished`
//! and answers from there until it is evicted.

use crate::case::{CaseSnapshot, CaseState};
use crate::config::EngineConfig;
use crate::controller::{answer_finished, CaseCommand, CaseController, ControllerContext};
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::guard::{DataGuardEvaluator, GuardEvaluator};
use crate::specification::{Specification, SpecificationLoader};
use crate::store::CaseStore;
use crate::types::{CaseData, CaseId, SpecificationId, WorkItemId};
use crate::work_item::WorkItem;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

#[derive(Clone)]
struct CaseHandle {
    specification_id: SpecificationId,
    mailbox: mpsc::Sender<CaseCommand>,
}

/// Final states of released cases, oldest first.
#[derive(Default)]
struct FinishedCases {
    order: VecDeque<CaseId>,
    states: HashMap<CaseId, Arc<CaseState>>,
}

impl FinishedCases {
    fn insert(&mut self, state: CaseState, capacity: usize) {
        let id = state.id;
        if self.states.insert(id, Arc::new(state)).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.states.remove(&evicted);
                debug!(case_id = %evicted, "Finished case forgotten");
            }
        }
    }
}

enum Route {
    Running(mpsc::Sender<CaseCommand>),
    Finished(Arc<CaseState>),
}

struct EngineInner {
    ctx: ControllerContext,
    specifications: RwLock<HashMap<SpecificationId, Arc<Specification>>>,
    cases: RwLock<HashMap<CaseId, CaseHandle>>,
    finished: RwLock<FinishedCases>,
}

impl EngineInner {
    /// Drop the case's mailbox and keep its final state. Both maps change
    /// under the `cases` lock, so a lookup always finds one of them.
    async fn retire(&self, state: CaseState) {
        let mut cases = self.cases.write().await;
        let case_id = state.id;
        self.finished
            .write()
            .await
            .insert(state, self.ctx.config.finished_case_capacity);
        cases.remove(&case_id);
        info!(case_id = %case_id, "Case released");
    }
}

/// Workflow engine handle. Cheap to clone; clones share registries and the
/// event stream.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn CaseStore>>,
    guards: Option<Arc<dyn GuardEvaluator>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn CaseStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the built-in [`DataGuardEvaluator`].
    pub fn guard_evaluator(mut self, guards: Arc<dyn GuardEvaluator>) -> Self {
        self.guards = Some(guards);
        self
    }

    pub fn build(self) -> Engine {
        let (events, _) = broadcast::channel(self.config.event_buffer.max(1));
        let ctx = ControllerContext {
            guards: self.guards.unwrap_or_else(|| Arc::new(DataGuardEvaluator)),
            config: Arc::new(self.config),
            store: self.store,
            events,
        };
        Engine {
            inner: Arc::new(EngineInner {
                ctx,
                specifications: RwLock::new(HashMap::new()),
                cases: RwLock::new(HashMap::new()),
                finished: RwLock::new(FinishedCases::default()),
            }),
        }
    }
}

impl Engine {
    /// In-memory engine with the built-in guard evaluator and no store.
    pub fn new(config: EngineConfig) -> Self {
        EngineBuilder::default().config(config).build()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.ctx.config
    }

    /// Events of every case, in commit order per case.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.ctx.events.subscribe()
    }

    // ── Specifications ──

    /// Register a validated specification. Re-registering an id replaces it
    /// for new cases; running cases keep the version they started with.
    pub async fn register_specification(&self, spec: Specification) -> SpecificationId {
        let id = spec.id().to_string();
        let mut specs = self.inner.specifications.write().await;
        if specs.insert(id.clone(), Arc::new(spec)).is_some() {
            warn!(specification = %id, "Specification replaced");
        } else {
            info!(specification = %id, "Specification registered");
        }
        id
    }

    pub async fn load_specification(
        &self,
        loader: &dyn SpecificationLoader,
        bytes: &[u8],
    ) -> EngineResult<SpecificationId> {
        let spec = loader.load(bytes)?;
        Ok(self.register_specification(spec).await)
    }

    pub async fn specification(&self, id: &str) -> EngineResult<Arc<Specification>> {
        self.inner
            .specifications
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownSpecification { id: id.to_string() })
    }

    // ── Case lifecycle ──

    /// Create a case, place the initial token and enable the first tasks.
    /// A routing failure while settling the start does not fail the call:
    /// the case is running and reports the failure as its stall.
    pub async fn start_case(&self, specification_id: &str, data: CaseData) -> EngineResult<CaseId> {
        let spec = self.specification(specification_id).await?;
        let state = CaseState::new(CaseId::new(), spec.id().to_string(), data);
        let case_id = state.id;
        let mut controller = CaseController::new(spec, state, self.inner.ctx.clone());
        controller.bootstrap().await?;
        self.spawn(case_id, specification_id.to_string(), controller)
            .await;
        Ok(case_id)
    }

    /// Cancel every live work item and close the case. A no-op on a case that
    /// already finished.
    pub async fn cancel_case(&self, case_id: CaseId) -> EngineResult<()> {
        self.request(case_id, |reply| CaseCommand::Cancel { reply })
            .await?
    }

    pub async fn suspend_case(&self, case_id: CaseId) -> EngineResult<()> {
        self.request(case_id, |reply| CaseCommand::Suspend { reply })
            .await?
    }

    pub async fn resume_case(&self, case_id: CaseId) -> EngineResult<()> {
        self.request(case_id, |reply| CaseCommand::Resume { reply })
            .await?
    }

    /// Merge `patch` into the case data and re-evaluate the net. Returns the
    /// work items this enabled.
    pub async fn update_case_data(
        &self,
        case_id: CaseId,
        patch: CaseData,
    ) -> EngineResult<Vec<WorkItem>> {
        self.request(case_id, |reply| CaseCommand::UpdateData { patch, reply })
            .await?
    }

    pub async fn get_case_state(&self, case_id: CaseId) -> EngineResult<CaseSnapshot> {
        self.request(case_id, |reply| CaseCommand::Snapshot { reply })
            .await
    }

    /// Running cases. Finished cases are released and not listed.
    pub async fn case_ids(&self) -> Vec<CaseId> {
        let mut ids: Vec<CaseId> = self.inner.cases.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn cases_of(&self, specification_id: &str) -> Vec<CaseId> {
        let mut ids: Vec<CaseId> = self
            .inner
            .cases
            .read()
            .await
            .iter()
            .filter(|(_, h)| h.specification_id == specification_id)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    // ── Work items ──

    pub async fn start_work_item(&self, id: WorkItemId) -> EngineResult<Vec<WorkItem>> {
        self.item_request(id, |reply| CaseCommand::StartWorkItem { id, reply })
            .await
    }

    /// Complete a work item, merging `output` into the case data. Returns the
    /// work items enabled as a consequence.
    pub async fn complete_work_item(
        &self,
        id: WorkItemId,
        output: CaseData,
    ) -> EngineResult<Vec<WorkItem>> {
        self.item_request(id, |reply| CaseCommand::CompleteWorkItem { id, output, reply })
            .await
    }

    pub async fn fail_work_item(
        &self,
        id: WorkItemId,
        reason: impl Into<String>,
    ) -> EngineResult<WorkItem> {
        let reason = reason.into();
        self.item_request(id, |reply| CaseCommand::FailWorkItem { id, reason, reply })
            .await
    }

    pub async fn cancel_work_item(&self, id: WorkItemId) -> EngineResult<Vec<WorkItem>> {
        self.item_request(id, |reply| CaseCommand::CancelWorkItem { id, reply })
            .await
    }

    /// Add one instance to a running dynamic multi-instance task.
    pub async fn add_instance(&self, parent: WorkItemId) -> EngineResult<WorkItem> {
        self.item_request(parent, |reply| CaseCommand::AddInstance { parent, reply })
            .await
    }

    // ── Persistence ──

    /// Serialize the whole case state.
    pub async fn snapshot_case(&self, case_id: CaseId) -> EngineResult<Vec<u8>> {
        self.request(case_id, |reply| CaseCommand::Export { reply })
            .await?
    }

    /// Load a case from `snapshot_case` bytes and resume driving it. The
    /// case's specification must be registered.
    pub async fn restore_case(&self, bytes: &[u8]) -> EngineResult<CaseId> {
        let state = CaseState::from_bytes(bytes)?;
        let case_id = state.id;
        if self.is_loaded(case_id).await {
            return Err(EngineError::CaseAlreadyLoaded { id: case_id });
        }
        let spec = self.specification(&state.specification_id).await?;
        let specification_id = state.specification_id.clone();
        let controller = CaseController::new(spec, state, self.inner.ctx.clone());
        controller.persist_current().await?;
        if !self.spawn(case_id, specification_id, controller).await {
            return Err(EngineError::CaseAlreadyLoaded { id: case_id });
        }
        info!(case_id = %case_id, "Case restored");
        Ok(case_id)
    }

    /// Restore every running case the store holds that is not loaded yet.
    /// Finished cases stay in the store only. Cases whose snapshot cannot be
    /// restored are skipped with a warning.
    pub async fn recover_cases(&self) -> EngineResult<Vec<CaseId>> {
        let store = self.store()?;
        let mut recovered = Vec::new();
        for case_id in store.list_cases().await.map_err(EngineError::Store)? {
            if self.is_loaded(case_id).await {
                continue;
            }
            let Some(bytes) = store
                .load_snapshot(case_id)
                .await
                .map_err(EngineError::Store)?
            else {
                continue;
            };
            match CaseState::from_bytes(&bytes) {
                Ok(state) if state.status.is_terminal() => {
                    debug!(case_id = %case_id, "Finished case not recovered");
                    continue;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(case_id = %case_id, error = %err, "Case not recovered");
                    continue;
                }
            }
            match self.restore_case(&bytes).await {
                Ok(id) => recovered.push(id),
                Err(err) => warn!(case_id = %case_id, error = %err, "Case not recovered"),
            }
        }
        Ok(recovered)
    }

    /// The case's persisted event log, from sequence number `from_seq`.
    pub async fn read_events(
        &self,
        case_id: CaseId,
        from_seq: u64,
    ) -> EngineResult<Vec<(u64, EngineEvent)>> {
        self.store()?
            .read_events(case_id, from_seq)
            .await
            .map_err(EngineError::Store)
    }

    // ── Internals ──

    fn store(&self) -> EngineResult<&Arc<dyn CaseStore>> {
        self.inner
            .ctx
            .store
            .as_ref()
            .ok_or_else(|| EngineError::Store(anyhow::anyhow!("No case store configured")))
    }

    async fn is_loaded(&self, case_id: CaseId) -> bool {
        if self.inner.cases.read().await.contains_key(&case_id) {
            return true;
        }
        self.inner.finished.read().await.states.contains_key(&case_id)
    }

    /// Start the controller task, or file the case as finished right away.
    /// Returns `false` (and drops the controller) if the case id is taken.
    async fn spawn(
        &self,
        case_id: CaseId,
        specification_id: SpecificationId,
        controller: CaseController,
    ) -> bool {
        if controller.is_finished() {
            if self.is_loaded(case_id).await {
                return false;
            }
            self.inner.retire(controller.into_state()).await;
            return true;
        }

        let mut cases = self.inner.cases.write().await;
        if cases.contains_key(&case_id) {
            return false;
        }
        let (mailbox, mut rx) = mpsc::channel(self.inner.ctx.config.mailbox_capacity.max(1));
        let registry: Weak<EngineInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let release = |state: CaseState| async move {
                if let Some(inner) = registry.upgrade() {
                    inner.retire(state).await;
                }
            };
            let Some(state) = controller.run(&mut rx, release).await else {
                return;
            };
            // Requests that raced the release are still answered.
            rx.close();
            while let Some(cmd) = rx.recv().await {
                answer_finished(&state, cmd);
            }
        });
        cases.insert(
            case_id,
            CaseHandle {
                specification_id,
                mailbox,
            },
        );
        debug!(case_id = %case_id, "Case controller spawned");
        true
    }

    async fn route(&self, case_id: CaseId) -> EngineResult<Route> {
        if let Some(handle) = self.inner.cases.read().await.get(&case_id) {
            return Ok(Route::Running(handle.mailbox.clone()));
        }
        self.inner
            .finished
            .read()
            .await
            .states
            .get(&case_id)
            .map(|state| Route::Finished(state.clone()))
            .ok_or(EngineError::UnknownCase { id: case_id })
    }

    async fn request<T>(
        &self,
        case_id: CaseId,
        command: impl FnOnce(oneshot::Sender<T>) -> CaseCommand,
    ) -> EngineResult<T> {
        let (reply, rx) = oneshot::channel();
        let mut cmd = command(reply);
        // A closed mailbox means the case was released meanwhile: look again.
        for _ in 0..2 {
            match self.route(case_id).await? {
                Route::Running(mailbox) => match mailbox.send(cmd).await {
                    Ok(()) => return rx.await.map_err(|_| EngineError::EngineShutdown),
                    Err(mpsc::error::SendError(returned)) => cmd = returned,
                },
                Route::Finished(state) => {
                    answer_finished(&state, cmd);
                    return rx.await.map_err(|_| EngineError::EngineShutdown);
                }
            }
        }
        Err(EngineError::EngineShutdown)
    }

    /// Like `request`, but an unknown case means the work item is unknown.
    async fn item_request<T>(
        &self,
        id: WorkItemId,
        command: impl FnOnce(oneshot::Sender<EngineResult<T>>) -> CaseCommand,
    ) -> EngineResult<T> {
        match self.request(id.case_id, command).await {
            Ok(result) => result,
            Err(EngineError::UnknownCase { .. }) => Err(EngineError::UnknownWorkItem { id }),
            Err(err) => Err(err),
        }
    }
}
