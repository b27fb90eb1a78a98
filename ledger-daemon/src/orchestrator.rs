//! Sync orchestrator: per-entity state, serialized regeneration runs and the
//! consumer-facing API.
//!
//! Every entity owns a slot. A trigger that finds no run in flight starts a
//! driver task; triggers arriving while it runs collapse into one pending
//! follow-up whose reason is the latest one seen. Pull checks that arrive
//! while the entity's files are being written are deferred to the driver
//! instead of reading half-updated state.

use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, oneshot, OwnedMutexGuard};

use ledger_core::{EntityId, EntityRef, Loaded};
use ledger_sync::{
    CacheRow, Enricher, EntityState, Observation, ReconcileReport, RegenerationReason,
    RegenerationReport, SyncEngine, SyncError,
};

use crate::error::DaemonError;

const EVENT_CAPACITY: usize = 256;

/// Broadcast to subscribers whenever an entity's state changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub entity: EntityId,
    pub state: EntityState,
    pub at: DateTime<Utc>,
}

type Waiter = oneshot::Sender<Result<RegenerationReport, String>>;

#[derive(Default)]
struct Slot {
    /// Held while the entity's files are read for a check or written.
    run_lock: Arc<tokio::sync::Mutex<()>>,
    driving: bool,
    pending: Option<RegenerationReason>,
    waiters: Vec<Waiter>,
    recheck: bool,
}

enum Step {
    Run(RegenerationReason, Vec<Waiter>),
    Recheck,
    Done,
}

struct Inner {
    engine: SyncEngine,
    enricher: Arc<dyn Enricher>,
    slots: Mutex<HashMap<EntityId, Slot>>,
    states: Mutex<HashMap<EntityId, EntityState>>,
    events: broadcast::Sender<StateChange>,
}

/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(engine: SyncEngine, enricher: Arc<dyn Enricher>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                engine,
                enricher,
                slots: Mutex::new(HashMap::new()),
                states: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.inner.engine
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.inner.events.subscribe()
    }

    /// Last known state. Entities never observed are `Clean`.
    pub fn get_state(&self, id: &EntityId) -> EntityState {
        self.inner.state(id)
    }

    /// Every entity with a recorded state.
    pub fn states(&self) -> BTreeMap<EntityId, EntityState> {
        self.inner
            .states()
            .iter()
            .map(|(id, state)| (id.clone(), *state))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Triggers
    // -----------------------------------------------------------------------

    /// Push path used by the watcher: check the entity and schedule any
    /// needed regeneration without waiting for it.
    pub async fn on_entity_changed(&self, entity: &EntityRef) -> Result<EntityState, DaemonError> {
        if let Some(reason) = self.verify(entity).await? {
            self.schedule(entity, reason);
        }
        Ok(self.get_state(&entity.id))
    }

    /// Pull verification independent of the watcher. Waits for any
    /// regeneration the check calls for.
    pub async fn reconcile_now(&self, entity: &EntityRef) -> Result<EntityState, DaemonError> {
        if let Some(reason) = self.verify(entity).await? {
            self.trigger_regeneration(entity, reason).await?;
        }
        Ok(self.get_state(&entity.id))
    }

    /// Request a regeneration and wait for the run that covers it.
    ///
    /// With a run already in flight the request joins the single pending
    /// follow-up run; its reason replaces any earlier pending reason.
    pub async fn trigger_regeneration(
        &self,
        entity: &EntityRef,
        reason: RegenerationReason,
    ) -> Result<RegenerationReport, DaemonError> {
        let (tx, rx) = oneshot::channel();
        let start = {
            let mut slots = self.inner.slots();
            let slot = slots.entry(entity.id.clone()).or_default();
            if slot.driving {
                slot.pending = Some(reason);
                slot.waiters.push(tx);
                None
            } else {
                slot.driving = true;
                Some(tx)
            }
        };
        if let Some(tx) = start {
            tokio::spawn(drive(self.inner.clone(), entity.clone(), reason, vec![tx]));
        }

        rx.await
            .map_err(|_| DaemonError::ChannelClosed("regeneration result"))?
            .map_err(|message| DaemonError::Regeneration {
                entity: entity.id.clone(),
                message,
            })
    }

    /// Fold outside artifact edits back into the canonical narrative.
    ///
    /// On failure nothing canonical is written and the entity is re-checked,
    /// which leaves it `ArtifactExternallyModified` while the edit remains.
    pub async fn request_reconciliation(
        &self,
        entity: &EntityRef,
    ) -> Result<ReconcileReport, DaemonError> {
        let run_lock = self.inner.run_lock(&entity.id);
        let result = {
            let _guard = run_lock.lock().await;
            self.inner.set_state(&entity.id, EntityState::Reconciling);
            self.inner
                .engine
                .reconcile(entity, self.inner.enricher.as_ref())
                .await
        };

        match result {
            Ok(report) => {
                self.inner.set_state(&entity.id, EntityState::Clean);
                tracing::info!(
                    entity = %entity.id,
                    applied = ?report.applied,
                    revision = %report.revision.short(),
                    "reconciliation succeeded",
                );
                if self.inner.take_recheck(&entity.id) {
                    if let Err(err) = self.reconcile_now(entity).await {
                        tracing::warn!(entity = %entity.id, error = %err, "re-check after reconciliation failed");
                    }
                }
                Ok(report)
            }
            Err(err) => {
                tracing::warn!(entity = %entity.id, error = %err, "reconciliation failed");
                self.inner
                    .set_state(&entity.id, EntityState::ArtifactExternallyModified);
                self.inner.take_recheck(&entity.id);
                if let Err(check_err) = self.reconcile_now(entity).await {
                    tracing::warn!(entity = %entity.id, error = %check_err, "re-check after failed reconciliation failed");
                }
                Err(err.into())
            }
        }
    }

    /// Pull-check every entity in the workspace. Returns how many were checked.
    pub async fn sweep(&self) -> Result<usize, DaemonError> {
        let entities = self.inner.engine.entities().await?;
        for entity in &entities {
            if let Err(err) = self.reconcile_now(entity).await {
                tracing::warn!(entity = %entity.id, error = %err, "sweep check failed");
            }
        }
        Ok(entities.len())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------
    //
    // Reads verify the entity first but never wait for a regeneration: one
    // that is needed is scheduled and the current data returned.

    pub async fn record(&self, entity: &EntityRef) -> Result<Loaded, DaemonError> {
        self.verify_on_read(entity).await;
        Ok(self.inner.engine.record(entity).await?)
    }

    pub async fn cache_row(&self, id: &EntityId) -> Result<Option<CacheRow>, DaemonError> {
        match self.inner.engine.entity(id).await {
            Ok(entity) => self.verify_on_read(&entity).await,
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
        Ok(self.inner.engine.cache_row(id).await?)
    }

    pub async fn cache_rows(&self) -> Result<Vec<CacheRow>, DaemonError> {
        for entity in self.inner.engine.entities().await? {
            self.verify_on_read(&entity).await;
        }
        Ok(self.inner.engine.cache_rows().await?)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Run a pull check unless the entity is busy, in which case the check is
    /// deferred to whoever holds it.
    async fn verify(&self, entity: &EntityRef) -> Result<Option<RegenerationReason>, DaemonError> {
        let Some(_guard) = self.inner.claim_for_check(&entity.id) else {
            tracing::debug!(entity = %entity.id, "entity busy; check deferred");
            return Ok(None);
        };
        self.inner.observe(entity).await
    }

    async fn verify_on_read(&self, entity: &EntityRef) {
        match self.verify(entity).await {
            Ok(Some(reason)) => self.schedule(entity, reason),
            Ok(None) => {}
            Err(err) => tracing::warn!(entity = %entity.id, error = %err, "read-through check failed"),
        }
    }

    fn schedule(&self, entity: &EntityRef, reason: RegenerationReason) {
        let this = self.clone();
        let entity = entity.clone();
        tokio::spawn(async move {
            if let Err(err) = this.trigger_regeneration(&entity, reason).await {
                tracing::warn!(entity = %entity.id, error = %err, "scheduled regeneration failed");
            }
        });
    }
}

impl Inner {
    fn slots(&self) -> MutexGuard<'_, HashMap<EntityId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn states(&self) -> MutexGuard<'_, HashMap<EntityId, EntityState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self, id: &EntityId) -> EntityState {
        self.states().get(id).copied().unwrap_or(EntityState::Clean)
    }

    fn set_state(&self, id: &EntityId, state: EntityState) {
        let previous = self.states().insert(id.clone(), state);
        if previous.unwrap_or(EntityState::Clean) == state {
            return;
        }
        tracing::debug!(entity = %id, %state, "state changed");
        let _ = self.events.send(StateChange {
            entity: id.clone(),
            state,
            at: Utc::now(),
        });
    }

    fn run_lock(&self, id: &EntityId) -> Arc<tokio::sync::Mutex<()>> {
        self.slots().entry(id.clone()).or_default().run_lock.clone()
    }

    fn claim_for_check(&self, id: &EntityId) -> Option<OwnedMutexGuard<()>> {
        let mut slots = self.slots();
        let slot = slots.entry(id.clone()).or_default();
        if slot.driving {
            slot.recheck = true;
            return None;
        }
        match slot.run_lock.clone().try_lock_owned() {
            Ok(guard) => Some(guard),
            Err(_) => {
                slot.recheck = true;
                None
            }
        }
    }

    fn take_recheck(&self, id: &EntityId) -> bool {
        self.slots()
            .get_mut(id)
            .map(|slot| mem::take(&mut slot.recheck))
            .unwrap_or(false)
    }

    fn next_step(&self, id: &EntityId) -> Step {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(id) else {
            return Step::Done;
        };
        if let Some(reason) = slot.pending.take() {
            return Step::Run(reason, mem::take(&mut slot.waiters));
        }
        if mem::take(&mut slot.recheck) {
            return Step::Recheck;
        }
        slot.driving = false;
        Step::Done
    }

    /// Compare the entity's files with the engine's records and update the
    /// state. Returns the regeneration the observation calls for, if any.
    async fn observe(&self, entity: &EntityRef) -> Result<Option<RegenerationReason>, DaemonError> {
        let observation = self.engine.check(entity).await?;
        Ok(match observation {
            Observation::Clean => {
                self.set_state(&entity.id, EntityState::Clean);
                None
            }
            Observation::CanonicalChanged {
                revision,
                artifact_edited,
            } => {
                if self.engine.sync_state(entity).await?.never_synced() {
                    tracing::info!(entity = %entity.id, "first sync");
                    return Ok(Some(RegenerationReason::Initial));
                }
                self.set_state(&entity.id, EntityState::CanonicalExternallyModified);
                tracing::info!(
                    entity = %entity.id,
                    revision = %revision.short(),
                    "accepting external canonical change",
                );
                if artifact_edited {
                    tracing::warn!(
                        entity = %entity.id,
                        "artifact was edited too; the canonical change wins",
                    );
                }
                Some(RegenerationReason::CanonicalChanged)
            }
            Observation::ArtifactMissing => Some(RegenerationReason::ArtifactMissing),
            Observation::ArtifactEdited => {
                self.set_state(&entity.id, EntityState::ArtifactExternallyModified);
                None
            }
            Observation::CanonicalMissing => {
                tracing::warn!(entity = %entity.id, "canonical record is missing");
                None
            }
        })
    }

    async fn regenerate(
        &self,
        entity: &EntityRef,
        reason: RegenerationReason,
    ) -> Result<RegenerationReport, SyncError> {
        match self.engine.regenerate(entity, reason).await {
            Ok(report) => {
                self.set_state(&entity.id, EntityState::Clean);
                tracing::info!(
                    entity = %entity.id,
                    %reason,
                    written = report.write.was_written(),
                    degraded = report.status.is_degraded(),
                    "regenerated",
                );
                Ok(report)
            }
            Err(err) => {
                tracing::error!(entity = %entity.id, %reason, error = %err, "regeneration failed");
                Err(err)
            }
        }
    }
}

/// Run regenerations for one entity until its slot has nothing pending.
async fn drive(
    inner: Arc<Inner>,
    entity: EntityRef,
    reason: RegenerationReason,
    waiters: Vec<Waiter>,
) {
    let mut job = Some((reason, waiters));
    loop {
        if let Some((reason, waiters)) = job.take() {
            let run_lock = inner.run_lock(&entity.id);
            let result = {
                let _guard = run_lock.lock().await;
                inner.regenerate(&entity, reason).await
            };
            let shared = result.map_err(|err| err.to_string());
            for waiter in waiters {
                let _ = waiter.send(shared.clone());
            }
        }

        match inner.next_step(&entity.id) {
            Step::Run(reason, waiters) => job = Some((reason, waiters)),
            Step::Recheck => {
                let run_lock = inner.run_lock(&entity.id);
                let _guard = run_lock.lock().await;
                match inner.observe(&entity).await {
                    Ok(Some(reason)) => job = Some((reason, Vec::new())),
                    Ok(None) => {}
                    Err(err) => tracing::warn!(entity = %entity.id, error = %err, "deferred check failed"),
                }
            }
            Step::Done => break,
        }
    }
}
