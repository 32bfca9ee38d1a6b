//! Decision engine for TCC global transactions.
//!
//! The coordinator keeps a small state machine per global transaction,
//! `OPEN -> DECIDING -> CONFIRMING | CANCELLING -> DONE`, fed by the signals the
//! ingestion service emits after each successful commit. Once a transaction is
//! decided, every participant leg is driven by its own task: the command is
//! sent through the callback registry, the task waits a bounded time for the
//! leg's COORDINATED acknowledgment and retries with exponential backoff until
//! the attempt budget is spent, at which point the leg is marked stuck for an
//! operator. A failing leg never holds back the others.
//!
//! The outcome is journaled as a DECIDED record before the first command goes
//! out, and a COMPLETED record closes the transaction. A coordinator that
//! picks a transaction up again, after a restart or an eviction, follows the
//! journaled outcome instead of deriving a new one.

use super::registry::{CallbackRegistry, ParticipantKey};
use super::unit_of_work::UnitOfWork;
use crate::config::CoordinatorConfig;
use crate::domain::batch::WriteMode;
use crate::domain::command::{CoordinateCommand, Outcome};
use crate::domain::event::{DecisionEvent, EventRecord, ParticipatedEvent, TccTxType, TransactionStatus};
use crate::domain::ports::{EventStoreRef, TxEventListener, TxSignal};
use crate::error::{PersistenceError, Result, TxError};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPhase {
    Open,
    Deciding,
    Confirming,
    Cancelling,
    Done,
}

impl fmt::Display for TxPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxPhase::Open => "OPEN",
            TxPhase::Deciding => "DECIDING",
            TxPhase::Confirming => "CONFIRMING",
            TxPhase::Cancelling => "CANCELLING",
            TxPhase::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// Dispatch progress of one participant leg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegState {
    Pending,
    Dispatching { attempts: u32 },
    Acknowledged,
    /// Needs an operator: retries ran out or the participant could not apply
    /// the command.
    Stuck { reason: String },
}

impl LegState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LegState::Acknowledged | LegState::Stuck { .. })
    }

    fn settled(status: TransactionStatus, command: &str) -> Self {
        match status {
            TransactionStatus::Succeed => LegState::Acknowledged,
            TransactionStatus::Failed => LegState::Stuck {
                reason: format!("participant failed to apply {command}"),
            },
        }
    }
}

impl fmt::Display for LegState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegState::Pending => f.write_str("PENDING"),
            LegState::Dispatching { attempts } => write!(f, "DISPATCHING({attempts})"),
            LegState::Acknowledged => f.write_str("ACKNOWLEDGED"),
            LegState::Stuck { .. } => f.write_str("STUCK"),
        }
    }
}

/// What the operator view reports for a global transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxHealth {
    InFlight,
    Stuck,
    Done,
}

impl fmt::Display for TxHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxHealth::InFlight => f.write_str("in_flight"),
            TxHealth::Stuck => f.write_str("stuck"),
            TxHealth::Done => f.write_str("done"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegReport {
    pub local_tx_id: String,
    pub service_name: String,
    pub state: LegState,
}

/// Snapshot of one global transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalTxReport {
    pub global_tx_id: String,
    pub phase: TxPhase,
    pub outcome: Option<Outcome>,
    pub legs: Vec<LegReport>,
}

impl GlobalTxReport {
    pub fn health(&self) -> TxHealth {
        if self.phase != TxPhase::Done {
            TxHealth::InFlight
        } else if self.stuck_legs().next().is_some() {
            TxHealth::Stuck
        } else {
            TxHealth::Done
        }
    }

    pub fn stuck_legs(&self) -> impl Iterator<Item = &LegReport> {
        self.legs
            .iter()
            .filter(|leg| matches!(leg.state, LegState::Stuck { .. }))
    }

    pub fn leg(&self, local_tx_id: &str) -> Option<&LegReport> {
        self.legs.iter().find(|leg| leg.local_tx_id == local_tx_id)
    }
}

struct Leg {
    service_name: String,
    state: LegState,
    /// Latest COORDINATED status reported for the leg. The dispatch task
    /// waits on it, so an acknowledgment is seen even while backing off.
    ack: watch::Sender<Option<TransactionStatus>>,
    driving: bool,
}

impl Leg {
    fn new(service_name: &str) -> Self {
        let (ack, _) = watch::channel(None);
        Self {
            service_name: service_name.to_string(),
            state: LegState::Pending,
            ack,
            driving: false,
        }
    }
}

struct GlobalTxState {
    phase: TxPhase,
    outcome: Option<Outcome>,
    opened_at: DateTime<Utc>,
    ended: Option<TransactionStatus>,
    participant_failed: bool,
    /// A decision task is reading the store. Cleared when it finishes, so a
    /// transaction left in DECIDING by a storage failure is retried by the
    /// sweep.
    deciding: bool,
    /// Legs that joined while a decision was being read.
    late_joins: Vec<String>,
    legs: BTreeMap<String, Leg>,
    completed_at: Option<Instant>,
}

impl GlobalTxState {
    fn open(opened_at: DateTime<Utc>) -> Self {
        Self {
            phase: TxPhase::Open,
            outcome: None,
            opened_at,
            ended: None,
            participant_failed: false,
            deciding: false,
            late_joins: Vec::new(),
            legs: BTreeMap::new(),
            completed_at: None,
        }
    }

    /// Moves to DECIDING and claims the decision. False when another decision
    /// is running or the transaction is already decided.
    fn claim_decision(&mut self) -> bool {
        match self.phase {
            TxPhase::Open => {
                self.phase = TxPhase::Deciding;
                self.deciding = true;
                true
            }
            TxPhase::Deciding if !self.deciding => {
                self.deciding = true;
                true
            }
            _ => false,
        }
    }

    /// Decided, and every leg acknowledged or stuck.
    fn is_complete(&self) -> bool {
        matches!(self.phase, TxPhase::Confirming | TxPhase::Cancelling)
            && self.legs.values().all(|leg| leg.state.is_terminal())
    }

    fn report(&self, global_tx_id: &str) -> GlobalTxReport {
        GlobalTxReport {
            global_tx_id: global_tx_id.to_string(),
            phase: self.phase,
            outcome: self.outcome,
            legs: self
                .legs
                .iter()
                .map(|(local_tx_id, leg)| LegReport {
                    local_tx_id: local_tx_id.clone(),
                    service_name: leg.service_name.clone(),
                    state: leg.state.clone(),
                })
                .collect(),
        }
    }
}

/// Confirm-all only when the initiator ended with Succeed and no participant
/// reported a failure.
fn decide_outcome(
    ended: Option<TransactionStatus>,
    participant_failed: bool,
    participations: &[ParticipatedEvent],
) -> Outcome {
    let all_succeeded = participations.iter().all(|p| p.status.is_success());
    if ended == Some(TransactionStatus::Succeed) && !participant_failed && all_succeeded {
        Outcome::Confirm
    } else {
        Outcome::Cancel
    }
}

/// Outcome of the DECIDED record, if one was journaled.
fn journaled_outcome(decisions: &[DecisionEvent]) -> Option<Outcome> {
    decisions
        .iter()
        .find(|decision| decision.tx_type == TccTxType::Decided)
        .map(|decision| decision.outcome)
}

/// What the store knows about a transaction being decided.
struct DecisionInputs {
    participations: Vec<ParticipatedEvent>,
    decided: Option<Outcome>,
    /// Stored acknowledgments with the command each one answers.
    coordinations: HashMap<String, (TransactionStatus, Option<Outcome>)>,
}

/// A leg that needs a dispatch task.
struct Dispatch {
    outcome: Outcome,
    participation: ParticipatedEvent,
    ack: watch::Receiver<Option<TransactionStatus>>,
}

/// Drives decided transactions to completion.
///
/// Cloning shares the same state. Register a clone as the ingestion service's
/// listener so it sees every committed event.
#[derive(Clone)]
pub struct Coordinator {
    store: EventStoreRef,
    registry: CallbackRegistry,
    config: Arc<CoordinatorConfig>,
    transactions: Arc<RwLock<HashMap<String, GlobalTxState>>>,
    changes: Arc<watch::Sender<u64>>,
}

impl Coordinator {
    pub fn new(store: EventStoreRef, registry: CallbackRegistry, config: CoordinatorConfig) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            store,
            registry,
            config: Arc::new(config),
            transactions: Arc::new(RwLock::new(HashMap::new())),
            changes: Arc::new(changes),
        }
    }

    pub fn registry(&self) -> &CallbackRegistry {
        &self.registry
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub async fn report(&self, global_tx_id: &str) -> Option<GlobalTxReport> {
        let transactions = self.transactions.read().await;
        transactions
            .get(global_tx_id)
            .map(|state| state.report(global_tx_id))
    }

    /// Reports of every known transaction, ordered by globalTxId.
    pub async fn reports(&self) -> Vec<GlobalTxReport> {
        let transactions = self.transactions.read().await;
        let mut reports: Vec<_> = transactions
            .iter()
            .map(|(global_tx_id, state)| state.report(global_tx_id))
            .collect();
        reports.sort_by(|a, b| a.global_tx_id.cmp(&b.global_tx_id));
        reports
    }

    /// Waits until the report of `global_tx_id` satisfies `predicate`.
    pub async fn wait_for<F>(
        &self,
        global_tx_id: &str,
        predicate: F,
        limit: Duration,
    ) -> Option<GlobalTxReport>
    where
        F: Fn(&GlobalTxReport) -> bool,
    {
        let deadline = Instant::now() + limit;
        let mut changes = self.changes.subscribe();
        loop {
            if let Some(report) = self.report(global_tx_id).await
                && predicate(&report)
            {
                return Some(report);
            }
            match timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                _ => return None,
            }
        }
    }

    /// Waits until no transaction is being decided or dispatched. Open
    /// transactions still waiting for their participants do not count.
    pub async fn wait_settled(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        let mut changes = self.changes.subscribe();
        loop {
            if self.is_settled().await {
                return true;
            }
            if !matches!(timeout_at(deadline, changes.changed()).await, Ok(Ok(()))) {
                return self.is_settled().await;
            }
        }
    }

    async fn is_settled(&self) -> bool {
        let transactions = self.transactions.read().await;
        transactions
            .values()
            .all(|state| matches!(state.phase, TxPhase::Open | TxPhase::Done))
    }

    fn bump(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }

    fn cutoff(&self) -> Option<DateTime<Utc>> {
        let age = TimeDelta::from_std(self.config.tx_timeout).ok()?;
        Utc::now().checked_sub_signed(age)
    }

    /// Forces every known transaction older than the timeout that is still
    /// OPEN, or stranded in DECIDING, into a decision. Returns how many were
    /// forced.
    pub async fn sweep(&self) -> usize {
        let Some(cutoff) = self.cutoff() else {
            return 0;
        };
        let expired: Vec<String> = {
            let transactions = self.transactions.read().await;
            transactions
                .iter()
                .filter(|(_, state)| state.opened_at < cutoff)
                .filter(|(_, state)| {
                    state.phase == TxPhase::Open
                        || (state.phase == TxPhase::Deciding && !state.deciding)
                })
                .map(|(global_tx_id, _)| global_tx_id.clone())
                .collect()
        };

        let mut forced = 0;
        for global_tx_id in expired {
            warn!(global_tx_id = %global_tx_id, "Global transaction timed out, forcing a decision");
            if self.begin_decision(&global_tx_id).await {
                forced += 1;
            }
        }
        forced
    }

    /// Rehydrates unfinished transactions the store knows about but this
    /// coordinator does not, typically after a restart, and decides them.
    /// Legs that already acknowledged the journaled outcome are not
    /// dispatched again.
    pub async fn recover(&self) -> Result<usize> {
        let Some(cutoff) = self.cutoff() else {
            return Ok(0);
        };
        let candidates = self.store.unfinished_global_tx_ids(cutoff).await?;

        let mut recovered = 0;
        for global_tx_id in candidates {
            if self.transactions.read().await.contains_key(&global_tx_id) {
                continue;
            }
            let globals = self
                .store
                .find_global_events(&global_tx_id)
                .await?
                .unwrap_or_default();
            let participations = self
                .store
                .find_participations(&global_tx_id)
                .await?
                .unwrap_or_default();

            let mut state = GlobalTxState::open(Utc::now());
            for event in &globals {
                match event.tx_type {
                    TccTxType::Started => state.opened_at = event.creation_time,
                    TccTxType::Ended => state.ended = Some(event.status),
                    _ => {}
                }
            }
            state.participant_failed = participations.iter().any(|p| !p.status.is_success());

            {
                let mut transactions = self.transactions.write().await;
                if transactions.contains_key(&global_tx_id) {
                    continue;
                }
                transactions.insert(global_tx_id.clone(), state);
            }
            info!(global_tx_id = %global_tx_id, "Recovering unfinished global transaction");
            if self.begin_decision(&global_tx_id).await {
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Runs [`Coordinator::recover`] and [`Coordinator::sweep`] every
    /// `sweep_interval` until the handle is aborted.
    pub fn spawn_recovery_sweep(&self) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let period = coordinator.config.sweep_interval.max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = coordinator.recover().await {
                    warn!(error = %e, "Recovery pass failed");
                }
                coordinator.sweep().await;
                coordinator.evict_done().await;
            }
        })
    }

    /// Forgets DONE transactions older than `done_retention`. Their COMPLETED
    /// record keeps them out of later recovery passes.
    pub async fn evict_done(&self) -> usize {
        let retention = self.config.done_retention;
        let evicted = {
            let mut transactions = self.transactions.write().await;
            let before = transactions.len();
            transactions.retain(|_, state| {
                !(state.phase == TxPhase::Done
                    && state.completed_at.is_some_and(|at| at.elapsed() >= retention))
            });
            before - transactions.len()
        };
        if evicted > 0 {
            debug!(evicted, "Evicted finished global transactions");
            self.bump();
        }
        evicted
    }

    /// Claims and runs the decision for `global_tx_id`. False when the
    /// transaction is unknown, already decided or being decided.
    async fn begin_decision(&self, global_tx_id: &str) -> bool {
        let claimed = {
            let mut transactions = self.transactions.write().await;
            transactions
                .get_mut(global_tx_id)
                .is_some_and(GlobalTxState::claim_decision)
        };
        if claimed {
            self.bump();
            self.decide(global_tx_id).await;
        }
        claimed
    }

    async fn load_decision_inputs(&self, global_tx_id: &str) -> Result<DecisionInputs> {
        let participations = self
            .store
            .find_participations(global_tx_id)
            .await?
            .unwrap_or_default();
        let decided = self
            .store
            .find_decisions(global_tx_id)
            .await?
            .and_then(|decisions| journaled_outcome(&decisions));
        let coordinations = self
            .store
            .find_tcc_events(global_tx_id)
            .await?
            .unwrap_or_default()
            .into_iter()
            .filter(|event| event.is_coordination())
            .map(|event| (event.tx.local_tx_id, (event.status, event.outcome)))
            .collect();
        Ok(DecisionInputs {
            participations,
            decided,
            coordinations,
        })
    }

    /// Journals the DECIDED record. When another coordinator got there first
    /// its outcome wins.
    async fn journal_decision(&self, global_tx_id: &str, outcome: Outcome) -> Result<Outcome> {
        let mut uow = UnitOfWork::begin(self.store.as_ref(), global_tx_id);
        uow.stage(
            EventRecord::Decision(DecisionEvent::decided(global_tx_id, outcome)),
            WriteMode::InsertIfAbsent,
        )?;
        match uow.commit().await {
            Ok(()) => Ok(outcome),
            Err(TxError::Persistence(PersistenceError::DuplicateKey { .. })) => self
                .store
                .find_decisions(global_tx_id)
                .await?
                .and_then(|decisions| journaled_outcome(&decisions))
                .ok_or_else(|| {
                    TxError::StorageUnavailable(format!("decision of {global_tx_id} conflicts but cannot be read"))
                }),
            Err(e) => Err(e),
        }
    }

    /// Leaves the transaction in DECIDING for the sweep to retry.
    async fn defer_decision(&self, global_tx_id: &str, e: &TxError) {
        warn!(
            global_tx_id = %global_tx_id,
            error = %e,
            "Decision failed, deferred to the recovery sweep"
        );
        let mut transactions = self.transactions.write().await;
        if let Some(state) = transactions.get_mut(global_tx_id) {
            state.deciding = false;
        }
    }

    async fn decide(&self, global_tx_id: &str) {
        let inputs = match self.load_decision_inputs(global_tx_id).await {
            Ok(inputs) => inputs,
            Err(e) => return self.defer_decision(global_tx_id, &e).await,
        };
        let DecisionInputs {
            participations,
            decided,
            coordinations,
        } = inputs;

        let outcome = match decided {
            Some(outcome) => outcome,
            None => {
                let proposed = {
                    let transactions = self.transactions.read().await;
                    match transactions.get(global_tx_id) {
                        Some(state) if state.phase == TxPhase::Deciding => {
                            decide_outcome(state.ended, state.participant_failed, &participations)
                        }
                        _ => return,
                    }
                };
                match self.journal_decision(global_tx_id, proposed).await {
                    Ok(outcome) => outcome,
                    Err(e) => return self.defer_decision(global_tx_id, &e).await,
                }
            }
        };

        let mut dispatches = Vec::new();
        let (outcome, late_joins) = {
            let mut transactions = self.transactions.write().await;
            let Some(state) = transactions.get_mut(global_tx_id) else {
                return;
            };
            state.deciding = false;
            if state.phase != TxPhase::Deciding {
                return;
            }

            state.outcome = Some(outcome);
            state.phase = match outcome {
                Outcome::Confirm => TxPhase::Confirming,
                Outcome::Cancel => TxPhase::Cancelling,
            };
            info!(
                global_tx_id = %global_tx_id,
                outcome = %outcome,
                participants = participations.len(),
                "Global transaction decided"
            );

            for participation in participations {
                let local_tx_id = participation.tx.local_tx_id.clone();
                if state.legs.contains_key(&local_tx_id) {
                    continue;
                }
                let mut leg = Leg::new(&participation.tx.service_name);
                let command = outcome.command_for(&participation);
                let answered = coordinations
                    .get(&local_tx_id)
                    .filter(|(_, answers)| *answers == Some(outcome));
                if let Some((status, _)) = answered {
                    leg.state = LegState::settled(*status, command.method.method_name());
                } else {
                    leg.driving = true;
                    dispatches.push(Dispatch {
                        outcome,
                        participation,
                        ack: leg.ack.subscribe(),
                    });
                }
                state.legs.insert(local_tx_id, leg);
            }

            (outcome, std::mem::take(&mut state.late_joins))
        };

        for dispatch in dispatches {
            self.spawn_leg(dispatch);
        }
        self.complete_if_terminal(global_tx_id).await;
        self.bump();

        for local_tx_id in late_joins {
            self.join_late(global_tx_id, &local_tx_id, outcome).await;
        }
    }

    /// Adds a leg that reported its participation after the decision and
    /// sends it the command already decided.
    async fn join_late(&self, global_tx_id: &str, local_tx_id: &str, outcome: Outcome) {
        let participation = match self.store.find_participation(global_tx_id, local_tx_id).await {
            Ok(Some(participation)) => participation,
            Ok(None) => return,
            Err(e) => {
                warn!(
                    global_tx_id = %global_tx_id,
                    local_tx_id = %local_tx_id,
                    error = %e,
                    "Failed to load late participation"
                );
                return;
            }
        };

        let dispatch = {
            let mut transactions = self.transactions.write().await;
            let Some(state) = transactions.get_mut(global_tx_id) else {
                return;
            };
            if state.legs.contains_key(local_tx_id)
                || !matches!(state.phase, TxPhase::Confirming | TxPhase::Cancelling)
            {
                return;
            }

            let mut leg = Leg::new(&participation.tx.service_name);
            let dispatch = if outcome == Outcome::Confirm && !participation.status.is_success() {
                error!(
                    global_tx_id = %global_tx_id,
                    local_tx_id = %local_tx_id,
                    "Failed participant joined after the confirm decision"
                );
                leg.state = LegState::Stuck {
                    reason: "failed participant joined after confirm decision".to_string(),
                };
                None
            } else {
                info!(
                    global_tx_id = %global_tx_id,
                    local_tx_id = %local_tx_id,
                    outcome = %outcome,
                    "Late participant joins decided transaction"
                );
                leg.driving = true;
                Some(Dispatch {
                    outcome,
                    participation,
                    ack: leg.ack.subscribe(),
                })
            };
            state.legs.insert(local_tx_id.to_string(), leg);
            dispatch
        };

        match dispatch {
            Some(dispatch) => self.spawn_leg(dispatch),
            None => self.complete_if_terminal(global_tx_id).await,
        }
        self.bump();
    }

    fn spawn_leg(&self, dispatch: Dispatch) {
        tokio::spawn(self.clone().drive_leg(dispatch));
    }

    async fn drive_leg(self, dispatch: Dispatch) {
        let Dispatch {
            outcome,
            participation,
            mut ack,
        } = dispatch;
        let command = outcome.command_for(&participation);
        let global_tx_id = command.global_tx_id.clone();
        let local_tx_id = command.local_tx_id.clone();
        let method = command.method.method_name().to_string();

        let mut attempt = 0;
        let final_state = loop {
            let acknowledged = *ack.borrow_and_update();
            if let Some(status) = acknowledged {
                break LegState::settled(status, &method);
            }

            attempt += 1;
            self.set_leg_state(&global_tx_id, &local_tx_id, LegState::Dispatching { attempts: attempt })
                .await;

            match self.dispatch_once(&participation, &command, &mut ack).await {
                Ok(status) => break LegState::settled(status, &method),
                Err(e) if attempt >= self.config.max_attempts => {
                    error!(
                        global_tx_id = %global_tx_id,
                        local_tx_id = %local_tx_id,
                        method = %method,
                        attempt,
                        error = %e,
                        "Retries exhausted, leg needs an operator"
                    );
                    break LegState::Stuck {
                        reason: format!("{method} not acknowledged after {attempt} attempts: {e}"),
                    };
                }
                Err(e) => {
                    let delay = self.config.backoff(attempt);
                    warn!(
                        global_tx_id = %global_tx_id,
                        local_tx_id = %local_tx_id,
                        method = %method,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Dispatch failed, backing off"
                    );
                    let _ = timeout(delay, async {
                        ack.wait_for(Option::is_some).await.map(|_| ())
                    })
                    .await;
                }
            }
        };

        self.complete_leg(&global_tx_id, &local_tx_id, final_state).await;
    }

    /// One send plus a wait for the acknowledgment, each bounded by
    /// `ack_timeout`.
    async fn dispatch_once(
        &self,
        participation: &ParticipatedEvent,
        command: &CoordinateCommand,
        ack: &mut watch::Receiver<Option<TransactionStatus>>,
    ) -> Result<TransactionStatus> {
        let callback = self
            .registry
            .lookup_participant(participation)
            .await
            .ok_or_else(|| {
                TxError::Transport(format!(
                    "no channel registered for {}@{}",
                    participation.tx.service_name, participation.tx.instance_id
                ))
            })?;
        timeout(self.config.ack_timeout, callback.send(command.clone()))
            .await
            .map_err(|_| self.dispatch_timeout(command))??;
        debug!(
            global_tx_id = %command.global_tx_id,
            local_tx_id = %command.local_tx_id,
            method = %command.method.method_name(),
            "Command dispatched"
        );

        match timeout(self.config.ack_timeout, ack.wait_for(Option::is_some)).await {
            Ok(Ok(acknowledged)) => match *acknowledged {
                Some(status) => Ok(status),
                None => Err(TxError::Transport("empty acknowledgment".to_string())),
            },
            Ok(Err(_)) => Err(TxError::Transport(
                "leg dropped while waiting for acknowledgment".to_string(),
            )),
            Err(_) => Err(self.dispatch_timeout(command)),
        }
    }

    fn dispatch_timeout(&self, command: &CoordinateCommand) -> TxError {
        TxError::DispatchTimeout {
            global_tx_id: command.global_tx_id.clone(),
            local_tx_id: command.local_tx_id.clone(),
            timeout_ms: self.config.ack_timeout.as_millis(),
        }
    }

    async fn set_leg_state(&self, global_tx_id: &str, local_tx_id: &str, leg_state: LegState) {
        {
            let mut transactions = self.transactions.write().await;
            if let Some(leg) = transactions
                .get_mut(global_tx_id)
                .and_then(|state| state.legs.get_mut(local_tx_id))
            {
                leg.state = leg_state;
            }
        }
        self.bump();
    }

    async fn complete_leg(&self, global_tx_id: &str, local_tx_id: &str, leg_state: LegState) {
        {
            let mut transactions = self.transactions.write().await;
            if let Some(leg) = transactions
                .get_mut(global_tx_id)
                .and_then(|state| state.legs.get_mut(local_tx_id))
            {
                debug!(
                    global_tx_id = %global_tx_id,
                    local_tx_id = %local_tx_id,
                    state = %leg_state,
                    "Leg settled"
                );
                leg.state = leg_state;
                leg.driving = false;
            }
        }
        self.complete_if_terminal(global_tx_id).await;
        self.bump();
    }

    /// Moves a complete transaction to DONE. Its leg keys are released from
    /// the registry and the COMPLETED record is journaled before DONE becomes
    /// visible.
    async fn complete_if_terminal(&self, global_tx_id: &str) {
        let (local_tx_ids, outcome): (Vec<String>, Outcome) = {
            let transactions = self.transactions.read().await;
            match transactions.get(global_tx_id) {
                Some(state) if state.is_complete() => match state.outcome {
                    Some(outcome) => (state.legs.keys().cloned().collect(), outcome),
                    None => return,
                },
                _ => return,
            }
        };
        for local_tx_id in &local_tx_ids {
            self.registry
                .deregister(&ParticipantKey::leg(global_tx_id, local_tx_id))
                .await;
        }

        let mut uow = UnitOfWork::begin(self.store.as_ref(), global_tx_id);
        let journaled = match uow.stage(
            EventRecord::Decision(DecisionEvent::completed(global_tx_id, outcome)),
            WriteMode::InsertIfAbsent,
        ) {
            Ok(()) => uow.commit().await,
            Err(e) => Err(e),
        };
        if let Err(e) = journaled {
            warn!(
                global_tx_id = %global_tx_id,
                error = %e,
                "Failed to journal completion, the transaction stays in the recovery index"
            );
        }

        let stuck = {
            let mut transactions = self.transactions.write().await;
            let Some(state) = transactions.get_mut(global_tx_id) else {
                return;
            };
            if !state.is_complete() {
                return;
            }
            state.phase = TxPhase::Done;
            state.completed_at.get_or_insert_with(Instant::now);
            state
                .legs
                .values()
                .filter(|leg| matches!(leg.state, LegState::Stuck { .. }))
                .count()
        };
        if stuck > 0 {
            error!(global_tx_id = %global_tx_id, stuck, "Global transaction finished with stuck legs");
        } else {
            info!(global_tx_id = %global_tx_id, legs = local_tx_ids.len(), "Global transaction done");
        }
    }

    async fn on_started(&self, global_tx_id: String, creation_time: DateTime<Utc>) {
        let mut transactions = self.transactions.write().await;
        transactions
            .entry(global_tx_id)
            .and_modify(|state| {
                if state.phase == TxPhase::Open {
                    state.opened_at = state.opened_at.min(creation_time);
                }
            })
            .or_insert_with(|| GlobalTxState::open(creation_time));
    }

    async fn on_participated(&self, global_tx_id: String, local_tx_id: String, status: TransactionStatus) {
        let (decide_now, late_outcome) = {
            let mut transactions = self.transactions.write().await;
            let state = transactions
                .entry(global_tx_id.clone())
                .or_insert_with(|| GlobalTxState::open(Utc::now()));
            if !status.is_success() {
                state.participant_failed = true;
            }
            match state.phase {
                TxPhase::Open => (!status.is_success(), None),
                TxPhase::Deciding => {
                    state.late_joins.push(local_tx_id.clone());
                    (false, None)
                }
                TxPhase::Confirming | TxPhase::Cancelling => (false, state.outcome),
                TxPhase::Done => {
                    if !state.legs.contains_key(&local_tx_id) {
                        warn!(
                            global_tx_id = %global_tx_id,
                            local_tx_id = %local_tx_id,
                            status = %status,
                            "Participation arrived after the transaction completed"
                        );
                    }
                    (false, None)
                }
            }
        };

        if decide_now {
            info!(
                global_tx_id = %global_tx_id,
                local_tx_id = %local_tx_id,
                "Participant failed, deciding early"
            );
            self.begin_decision(&global_tx_id).await;
        } else if let Some(outcome) = late_outcome {
            self.join_late(&global_tx_id, &local_tx_id, outcome).await;
        }
    }

    async fn on_ended(&self, global_tx_id: String, status: TransactionStatus, creation_time: DateTime<Utc>) {
        {
            let mut transactions = self.transactions.write().await;
            let state = transactions
                .entry(global_tx_id.clone())
                .or_insert_with(|| GlobalTxState::open(creation_time));
            state.ended = Some(status);
        }
        self.begin_decision(&global_tx_id).await;
    }

    async fn on_coordinated(
        &self,
        global_tx_id: String,
        local_tx_id: String,
        status: TransactionStatus,
        answered: Option<Outcome>,
    ) {
        let settle = {
            let mut transactions = self.transactions.write().await;
            let state = transactions.get_mut(&global_tx_id);
            if let Some(state) = &state
                && let (Some(answered), Some(decided)) = (answered, state.outcome)
                && answered != decided
            {
                warn!(
                    global_tx_id = %global_tx_id,
                    local_tx_id = %local_tx_id,
                    answered = %answered,
                    decided = %decided,
                    "Acknowledgment answers a command that was not decided, ignored"
                );
                return;
            }
            let leg = state.and_then(|state| state.legs.get_mut(&local_tx_id));
            match leg {
                Some(leg) => {
                    leg.ack.send_replace(Some(status));
                    !leg.driving && !leg.state.is_terminal()
                }
                None => {
                    debug!(
                        global_tx_id = %global_tx_id,
                        local_tx_id = %local_tx_id,
                        "Acknowledgment for a leg not yet dispatched"
                    );
                    false
                }
            }
        };
        if settle {
            self.complete_leg(&global_tx_id, &local_tx_id, LegState::settled(status, "command"))
                .await;
        }
    }
}

#[async_trait]
impl TxEventListener for Coordinator {
    async fn on_signal(&self, signal: TxSignal) {
        match signal {
            TxSignal::Started {
                global_tx_id,
                creation_time,
            } => self.on_started(global_tx_id, creation_time).await,
            TxSignal::Participated {
                global_tx_id,
                local_tx_id,
                status,
            } => self.on_participated(global_tx_id, local_tx_id, status).await,
            TxSignal::Ended {
                global_tx_id,
                status,
                creation_time,
            } => self.on_ended(global_tx_id, status, creation_time).await,
            TxSignal::Coordinated {
                global_tx_id,
                local_tx_id,
                status,
                outcome,
            } => {
                self.on_coordinated(global_tx_id, local_tx_id, status, outcome)
                    .await
            }
        }
        self.bump();
    }
}
