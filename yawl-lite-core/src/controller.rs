//! Case controller: one actor per case.
//!
//! ```text
//! Engine ──► mpsc::Sender<CaseCommand> ──► CaseController (tokio task)
//!                                               │ execute(): Transaction on a copy
//!                                               │ commit():  store, swap, broadcast
//!                                               ▼
//!                                        oneshot reply
//! ```
//!
//! Commands of one case are applied strictly in arrival order; different
//! cases run on different tasks and never share mutable state. A firing
//! transaction is synchronous, the only awaits happen in `commit()` after
//! the new state is fully computed.
//!
//! Once a case completes or is cancelled its controller stops. The engine
//! keeps the final state and answers later requests with `answer_finished`.

use crate::case::{CaseSnapshot, CaseState};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::guard::GuardEvaluator;
use crate::specification::Specification;
use crate::store::CaseStore;
use crate::transaction::{Committed, Transaction};
use crate::types::{now_ms, CaseData, WorkItemId};
use crate::work_item::{WorkItem, WorkItemEvent};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

type Reply<T> = oneshot::Sender<EngineResult<T>>;

/// A computed reply waiting to be sent.
type Answer = Box<dyn FnOnce() + Send>;

fn answer<T: Send + 'static>(reply: oneshot::Sender<T>, value: T) -> Answer {
    Box::new(move || {
        // The caller may have given up waiting.
        let _ = reply.send(value);
    })
}

/// Requests handled by a case controller.
#[derive(Debug)]
pub(crate) enum CaseCommand {
    StartWorkItem {
        id: WorkItemId,
        reply: Reply<Vec<WorkItem>>,
    },
    CompleteWorkItem {
        id: WorkItemId,
        output: CaseData,
        reply: Reply<Vec<WorkItem>>,
    },
    FailWorkItem {
        id: WorkItemId,
        reason: String,
        reply: Reply<WorkItem>,
    },
    CancelWorkItem {
        id: WorkItemId,
        reply: Reply<Vec<WorkItem>>,
    },
    AddInstance {
        parent: WorkItemId,
        reply: Reply<WorkItem>,
    },
    UpdateData {
        patch: CaseData,
        reply: Reply<Vec<WorkItem>>,
    },
    Suspend {
        reply: Reply<()>,
    },
    Resume {
        reply: Reply<()>,
    },
    Cancel {
        reply: Reply<()>,
    },
    Snapshot {
        reply: oneshot::Sender<CaseSnapshot>,
    },
    Export {
        reply: Reply<Vec<u8>>,
    },
}

/// Shared collaborators every controller needs.
#[derive(Clone)]
pub(crate) struct ControllerContext {
    pub guards: Arc<dyn GuardEvaluator>,
    pub config: Arc<EngineConfig>,
    pub store: Option<Arc<dyn CaseStore>>,
    pub events: broadcast::Sender<EngineEvent>,
}

pub(crate) struct CaseController {
    spec: Arc<Specification>,
    state: CaseState,
    ctx: ControllerContext,
}

impl CaseController {
    pub fn new(spec: Arc<Specification>, state: CaseState, ctx: ControllerContext) -> Self {
        Self { spec, state, ctx }
    }

    /// Place the initial token, then settle the net. Runs before the actor
    /// is spawned so start-up failures reach the caller. The start is
    /// committed on its own: a routing failure while settling leaves the
    /// case running with a stall instead of losing it.
    pub async fn bootstrap(&mut self) -> EngineResult<()> {
        let mut tx = Transaction::begin(
            &self.spec,
            self.ctx.guards.as_ref(),
            &self.ctx.config,
            self.state.clone(),
        );
        tx.start_case()?;
        self.commit(tx.finish(())).await?;

        match self.execute(|_| Ok(())) {
            Ok(settled) => self.commit(settled).await.map(|_| ()),
            Err(err) if err.is_routing_exhaustion() => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.status.is_terminal()
    }

    pub fn into_state(self) -> CaseState {
        self.state
    }

    /// Persist a restored state before the actor takes over.
    pub async fn persist_current(&self) -> EngineResult<()> {
        if let (Some(store), true) = (&self.ctx.store, self.ctx.config.persist_snapshots) {
            let bytes = self.state.to_bytes()?;
            store
                .save_snapshot(self.state.id, &bytes)
                .await
                .map_err(EngineError::Store)?;
        }
        Ok(())
    }

    /// Serve commands until the case finishes or the mailbox closes.
    /// `release` runs before the finishing command is answered, so callers
    /// never observe a finished case that is still registered as running.
    /// Returns the final state of a finished case.
    pub async fn run<F, Fut>(
        mut self,
        rx: &mut mpsc::Receiver<CaseCommand>,
        release: F,
    ) -> Option<CaseState>
    where
        F: FnOnce(CaseState) -> Fut,
        Fut: Future<Output = ()>,
    {
        info!(case_id = %self.state.id, "Case controller started");
        while let Some(cmd) = rx.recv().await {
            let answer = self.apply_command(cmd).await;
            if self.is_finished() {
                debug!(case_id = %self.state.id, "Case finished, controller released");
                release(self.state.clone()).await;
                answer();
                return Some(self.state);
            }
            answer();
        }
        debug!(case_id = %self.state.id, "Case controller stopped");
        None
    }

    /// Apply one command. The reply is returned unsent.
    async fn apply_command(&mut self, cmd: CaseCommand) -> Answer {
        match cmd {
            CaseCommand::StartWorkItem { id, reply } => {
                let result = self
                    .run_tx(|tx| tx.start_work_item(id))
                    .await
                    .map(|(started, _)| started);
                answer(reply, result)
            }
            CaseCommand::CompleteWorkItem { id, output, reply } => {
                let result = self
                    .run_tx(|tx| tx.complete_work_item(id, output.clone()))
                    .await
                    .map(|(_, enabled)| enabled);
                answer(reply, result)
            }
            CaseCommand::FailWorkItem { id, reason, reply } => {
                let result = self
                    .run_tx(|tx| tx.fail_work_item(id, reason.clone()))
                    .await
                    .map(|(failed, _)| failed);
                answer(reply, result)
            }
            CaseCommand::CancelWorkItem { id, reply } => {
                let result = self
                    .run_tx(|tx| tx.cancel_work_item(id))
                    .await
                    .map(|(_, enabled)| enabled);
                answer(reply, result)
            }
            CaseCommand::AddInstance { parent, reply } => {
                let result = self
                    .run_tx(|tx| tx.add_instance(parent))
                    .await
                    .map(|(child, _)| child);
                answer(reply, result)
            }
            CaseCommand::UpdateData { patch, reply } => {
                let result = self
                    .run_tx(|tx| tx.update_case_data(patch.clone()))
                    .await
                    .map(|(_, enabled)| enabled);
                answer(reply, result)
            }
            CaseCommand::Suspend { reply } => {
                let result = self.run_tx(|tx| tx.suspend()).await.map(|_| ());
                answer(reply, result)
            }
            CaseCommand::Resume { reply } => {
                let result = self.run_tx(|tx| tx.resume()).await.map(|_| ());
                answer(reply, result)
            }
            CaseCommand::Cancel { reply } => {
                let result = self.run_tx(|tx| tx.cancel_case()).await.map(|_| ());
                answer(reply, result)
            }
            CaseCommand::Snapshot { reply } => answer(reply, self.state.snapshot()),
            CaseCommand::Export { reply } => answer(reply, self.state.to_bytes()),
        }
    }

    async fn run_tx<T>(
        &mut self,
        op: impl FnMut(&mut Transaction<'_>) -> EngineResult<T>,
    ) -> EngineResult<(T, Vec<WorkItem>)> {
        let committed = self.execute(op)?;
        self.commit(committed).await
    }

    /// Run `op` plus settling on a copy of the state. A token conflict
    /// re-runs the whole decision against the committed marking; routing
    /// failures are recorded as the case's stall.
    pub(crate) fn execute<T>(
        &mut self,
        mut op: impl FnMut(&mut Transaction<'_>) -> EngineResult<T>,
    ) -> EngineResult<Committed<T>> {
        let attempts = self.ctx.config.max_fire_retries.max(1);
        for attempt in 1..=attempts {
            let mut tx = Transaction::begin(
                &self.spec,
                self.ctx.guards.as_ref(),
                &self.ctx.config,
                self.state.clone(),
            );
            let outcome = op(&mut tx).and_then(|value| {
                tx.settle()?;
                Ok(value)
            });
            match outcome {
                Ok(value) => return Ok(tx.finish(value)),
                Err(EngineError::InsufficientTokens { place, .. }) => {
                    debug!(
                        case_id = %self.state.id,
                        attempt,
                        place = %place,
                        "Firing conflict, retrying"
                    );
                }
                Err(err) => {
                    if err.is_routing_exhaustion() {
                        warn!(case_id = %self.state.id, error = %err, "Case stalled");
                        self.state.stall = Some(err.to_string());
                    }
                    return Err(err);
                }
            }
        }
        Err(EngineError::FiringConflict {
            case_id: self.state.id,
            attempts,
        })
    }

    /// Persist, swap in the new state, then broadcast. Returns the command's
    /// value and the work items it newly enabled.
    async fn commit<T>(&mut self, committed: Committed<T>) -> EngineResult<(T, Vec<WorkItem>)> {
        let Committed {
            mut state,
            events,
            enabled,
            value,
        } = committed;
        state.work_items.retire_terminal();
        state.updated_at = now_ms();

        if let Some(store) = &self.ctx.store {
            let snapshot = if self.ctx.config.persist_snapshots {
                Some(state.to_bytes()?)
            } else {
                None
            };
            store
                .commit(state.id, &events, snapshot.as_deref())
                .await
                .map_err(EngineError::Store)?;
        }

        self.state = state;
        for event in events {
            // No subscribers is fine.
            let _ = self.ctx.events.send(event);
        }
        Ok((value, enabled))
    }
}

/// Answer a request addressed to a finished case from its final state.
/// Nothing is persisted or broadcast.
pub(crate) fn answer_finished(state: &CaseState, cmd: CaseCommand) {
    let not_running = || EngineError::CaseNotRunning {
        id: state.id,
        status: state.status.clone(),
    };
    match cmd {
        CaseCommand::StartWorkItem { id, reply } => {
            let _ = reply.send(Err(finished_item_error(state, id, WorkItemEvent::Start)));
        }
        CaseCommand::CompleteWorkItem { id, reply, .. } => {
            let _ = reply.send(Err(finished_item_error(state, id, WorkItemEvent::Complete)));
        }
        CaseCommand::FailWorkItem { id, reply, .. } => {
            let _ = reply.send(Err(finished_item_error(state, id, WorkItemEvent::Fail)));
        }
        CaseCommand::CancelWorkItem { id, reply } => {
            let _ = reply.send(Err(finished_item_error(state, id, WorkItemEvent::Cancel)));
        }
        CaseCommand::AddInstance { parent, reply } => {
            let _ = reply.send(Err(finished_item_error(state, parent, WorkItemEvent::Start)));
        }
        CaseCommand::UpdateData { reply, .. } => {
            let _ = reply.send(Err(not_running()));
        }
        CaseCommand::Suspend { reply } | CaseCommand::Resume { reply } => {
            let _ = reply.send(Err(not_running()));
        }
        CaseCommand::Cancel { reply } => {
            let _ = reply.send(Ok(()));
        }
        CaseCommand::Snapshot { reply } => {
            let _ = reply.send(state.snapshot());
        }
        CaseCommand::Export { reply } => {
            let _ = reply.send(state.to_bytes());
        }
    }
}

// Every item of a finished case is terminal.
fn finished_item_error(state: &CaseState, id: WorkItemId, event: WorkItemEvent) -> EngineError {
    match state.work_items.state_of(id) {
        Ok(from) => EngineError::IllegalTransition { id, from, event },
        Err(err) => err,
    }
}
