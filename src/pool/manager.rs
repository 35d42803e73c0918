//! Shard pool worker
//!
//! One worker task owns one shard's instances and wait queue. Every
//! mutation — acquire, release, launch completion, sweep, shutdown — flows
//! through the worker's mailbox and executes one at a time, so the shard
//! invariants hold by construction and no lock is ever taken around pool
//! state. Render work itself happens outside the worker, on the caller's
//! task, once a lease has been handed out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::engine::{EngineError, EngineLauncher, RenderEngine, RenderOptions, RenderOutput};
use crate::error::{RenderError, RenderResult};

use super::instance::{InstanceId, InstanceRecord, InstanceStatus};
use super::queue::WaitQueue;
use super::recycle::{RecycleDecision, RecyclePolicy};

// =============================================================================
// Commands & replies
// =============================================================================

/// How a lease was given back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Render completed; the engine process is healthy
    Success,
    /// The engine process died while loaned out
    Crashed,
}

/// Mailbox messages for one shard worker
enum PoolCommand {
    Acquire {
        call_id: String,
        deadline: Instant,
        reply: oneshot::Sender<RenderResult<EngineLease>>,
    },
    Release {
        id: InstanceId,
        outcome: ReleaseOutcome,
        engine: Option<Box<dyn RenderEngine>>,
    },
    LaunchDone {
        id: InstanceId,
        result: Result<Box<dyn RenderEngine>, EngineError>,
    },
    Sweep,
    Stats {
        reply: oneshot::Sender<ShardStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Point-in-time counters for one shard
#[derive(Debug, Clone, Default)]
pub struct ShardStats {
    pub shard: usize,
    pub total_instances: usize,
    pub idle_instances: usize,
    pub busy_instances: usize,
    pub starting_instances: usize,
    pub queued_waiters: usize,
    pub total_rendered: u64,
}

// =============================================================================
// Lease
// =============================================================================

/// Exclusive loan of one engine instance
///
/// Dropping the lease returns the engine to its shard on every exit path;
/// a crash observed during [`render`](Self::render) is reported in the same
/// release message, so the worker can evict instead of reusing the corpse.
pub struct EngineLease {
    instance_id: InstanceId,
    shard: usize,
    engine: Option<Box<dyn RenderEngine>>,
    outcome: ReleaseOutcome,
    tx: mpsc::UnboundedSender<PoolCommand>,
}

impl std::fmt::Debug for EngineLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineLease")
            .field("instance_id", &self.instance_id)
            .field("shard", &self.shard)
            .field("engine", &self.engine.as_ref().map(|_| "<engine>"))
            .field("outcome", &self.outcome)
            .finish()
    }
}

impl EngineLease {
    fn new(
        instance_id: InstanceId,
        shard: usize,
        engine: Box<dyn RenderEngine>,
        tx: mpsc::UnboundedSender<PoolCommand>,
    ) -> Self {
        Self {
            instance_id,
            shard,
            engine: Some(engine),
            outcome: ReleaseOutcome::Success,
            tx,
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Render on the leased engine
    ///
    /// A crash-classified failure flips the lease outcome so the drop-time
    /// release evicts the instance.
    pub async fn render(
        &mut self,
        document: &str,
        options: &RenderOptions,
    ) -> Result<RenderOutput, EngineError> {
        let Some(engine) = self.engine.as_ref() else {
            return Err(EngineError::Crashed("engine already released".to_string()));
        };
        match engine.render(document, options).await {
            Err(e) if e.is_crash() => {
                self.outcome = ReleaseOutcome::Crashed;
                Err(e)
            }
            other => other,
        }
    }

    /// Take the engine back without notifying the shard
    ///
    /// Used by the worker itself when a handout loses the race with a
    /// vanishing caller; the drop impl then has nothing to send.
    fn defuse(mut self) -> (InstanceId, Option<Box<dyn RenderEngine>>) {
        (self.instance_id, self.engine.take())
    }
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            let sent = self.tx.send(PoolCommand::Release {
                id: self.instance_id,
                outcome: self.outcome,
                engine: Some(engine),
            });
            if sent.is_err() {
                // Worker is gone; the engine's own drop kills the process.
                debug!(
                    instance = %self.instance_id,
                    "shard worker gone at release, dropping engine"
                );
            }
        }
    }
}

// =============================================================================
// Worker state
// =============================================================================

struct PooledInstance {
    record: InstanceRecord,
    /// Present while idle; `None` while loaned out or still launching
    engine: Option<Box<dyn RenderEngine>>,
}

struct ShardWorker {
    shard: usize,
    config: PoolConfig,
    policy: RecyclePolicy,
    launcher: Arc<dyn EngineLauncher>,
    instances: HashMap<InstanceId, PooledInstance>,
    queue: WaitQueue<RenderResult<EngineLease>>,
    total_rendered: u64,
    draining: bool,
    tx: mpsc::UnboundedSender<PoolCommand>,
}

fn spawn_close(mut engine: Box<dyn RenderEngine>) {
    tokio::spawn(async move {
        engine.close().await;
    });
}

impl ShardWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PoolCommand>) {
        debug!(shard = self.shard, "pool worker started");
        while let Some(cmd) = rx.recv().await {
            match cmd {
                PoolCommand::Acquire {
                    call_id,
                    deadline,
                    reply,
                } => self.handle_acquire(call_id, deadline, reply).await,
                PoolCommand::Release {
                    id,
                    outcome,
                    engine,
                } => self.handle_release(id, outcome, engine).await,
                PoolCommand::LaunchDone { id, result } => {
                    self.handle_launch_done(id, result).await;
                }
                PoolCommand::Sweep => self.handle_sweep().await,
                PoolCommand::Stats { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                PoolCommand::Shutdown { reply } => {
                    self.handle_shutdown();
                    let _ = reply.send(());
                }
            }
        }
        for (_, slot) in self.instances.drain() {
            if let Some(engine) = slot.engine {
                spawn_close(engine);
            }
        }
        debug!(shard = self.shard, "pool worker exited");
    }

    // -------------------------------------------------------------------------
    // Acquire
    // -------------------------------------------------------------------------

    async fn handle_acquire(
        &mut self,
        call_id: String,
        deadline: Instant,
        reply: oneshot::Sender<RenderResult<EngineLease>>,
    ) {
        let now = Instant::now();
        self.queue.purge_dead(now);

        if self.draining {
            let _ = reply.send(Err(RenderError::PoolUnavailable(
                "shard is shutting down".to_string(),
            )));
            return;
        }

        // A new acquire may not overtake queued waiters (strict FIFO).
        if self.queue.is_empty()
            && let Some((id, engine)) = self.checkout_idle().await
        {
            debug!(shard = self.shard, instance = %id, call = %call_id, "acquired idle instance");
            self.hand_out(id, engine, reply);
            return;
        }

        match self.queue.push(call_id.clone(), deadline, reply) {
            Ok(ticket) => {
                debug!(
                    shard = self.shard,
                    call = %call_id,
                    ticket,
                    queued = self.queue.len(),
                    "acquisition queued"
                );
                self.maybe_launch(now);
            }
            Err(reply) => {
                warn!(
                    shard = self.shard,
                    call = %call_id,
                    limit = self.config.wait_queue_limit(),
                    "wait queue full, rejecting acquisition"
                );
                let _ = reply.send(Err(RenderError::CapacityExceeded {
                    retry_after: self.config.retry_after_hint(),
                }));
            }
        }
    }

    /// Send a lease to a caller, reclaiming the engine if the caller is gone
    fn hand_out(
        &mut self,
        id: InstanceId,
        engine: Box<dyn RenderEngine>,
        reply: oneshot::Sender<RenderResult<EngineLease>>,
    ) {
        let lease = EngineLease::new(id, self.shard, engine, self.tx.clone());
        if let Err(Ok(lease)) = reply.send(Ok(lease)) {
            let (id, engine) = lease.defuse();
            self.restore_idle(id, engine);
        }
    }

    /// Check out the least recently used idle instance, evicting any that
    /// fail the liveness probe on the way.
    async fn checkout_idle(&mut self) -> Option<(InstanceId, Box<dyn RenderEngine>)> {
        loop {
            let candidate = self
                .instances
                .iter()
                .filter(|(_, slot)| {
                    slot.record.status == InstanceStatus::Idle && slot.engine.is_some()
                })
                .min_by_key(|(_, slot)| slot.record.last_used)
                .map(|(id, _)| *id)?;

            let engine = self
                .instances
                .get_mut(&candidate)
                .and_then(|slot| slot.engine.take())?;

            if engine.is_alive().await {
                if let Some(slot) = self.instances.get_mut(&candidate) {
                    slot.record.transition(InstanceStatus::Busy);
                    slot.record.touch();
                }
                return Some((candidate, engine));
            }

            warn!(
                shard = self.shard,
                instance = %candidate,
                "idle instance failed liveness probe, evicting"
            );
            self.retire_slot(candidate, Some(engine));
        }
    }

    // -------------------------------------------------------------------------
    // Release
    // -------------------------------------------------------------------------

    async fn handle_release(
        &mut self,
        id: InstanceId,
        outcome: ReleaseOutcome,
        engine: Option<Box<dyn RenderEngine>>,
    ) {
        let now = Instant::now();
        self.queue.purge_dead(now);

        if !self.instances.contains_key(&id) || self.draining {
            // Released after eviction or into a draining shard: just close.
            self.instances.remove(&id);
            if let Some(engine) = engine {
                spawn_close(engine);
            }
            return;
        }

        match outcome {
            ReleaseOutcome::Crashed => {
                warn!(shard = self.shard, instance = %id, "engine crashed during render, evicting");
                if let Some(mut slot) = self.instances.remove(&id) {
                    slot.record.transition(InstanceStatus::Crashed);
                    slot.record.transition(InstanceStatus::Closed);
                }
                if let Some(engine) = engine {
                    spawn_close(engine);
                }
                // Queued demand gets a fresh replacement immediately.
                self.maybe_launch(now);
            }
            ReleaseOutcome::Success => {
                let decision = match self.instances.get_mut(&id) {
                    Some(slot) => {
                        slot.record.note_render();
                        self.total_rendered += 1;
                        self.policy.evaluate(&slot.record, now)
                    }
                    None => return,
                };
                match decision {
                    RecycleDecision::Retire(reason) => {
                        if let Some(slot) = self.instances.get(&id) {
                            info!(
                                shard = self.shard,
                                instance = %id,
                                reason = reason.as_str(),
                                renders = slot.record.render_count,
                                "retiring instance"
                            );
                        }
                        self.retire_slot(id, engine);
                        self.maybe_launch(now);
                    }
                    RecycleDecision::Keep => {
                        match engine {
                            Some(engine) => {
                                if let Some(slot) = self.instances.get_mut(&id) {
                                    slot.record.transition(InstanceStatus::Idle);
                                    slot.engine = Some(engine);
                                }
                                self.satisfy_waiters(now).await;
                            }
                            None => {
                                // A release without its engine cannot be reused.
                                error!(
                                    shard = self.shard,
                                    instance = %id,
                                    "successful release arrived without engine, evicting"
                                );
                                self.retire_slot(id, None);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Remove a slot from the shard and close its engine
    fn retire_slot(&mut self, id: InstanceId, engine: Option<Box<dyn RenderEngine>>) {
        if let Some(mut slot) = self.instances.remove(&id) {
            match slot.record.status {
                InstanceStatus::Idle | InstanceStatus::Busy => {
                    slot.record.transition(InstanceStatus::Retiring);
                    slot.record.transition(InstanceStatus::Closed);
                }
                InstanceStatus::Starting => slot.record.transition(InstanceStatus::Closed),
                _ => {}
            }
            if let Some(engine) = slot.engine.take() {
                spawn_close(engine);
            }
        }
        if let Some(engine) = engine {
            spawn_close(engine);
        }
    }

    // -------------------------------------------------------------------------
    // Launching
    // -------------------------------------------------------------------------

    /// Start replacement launches to cover queued demand, within capacity
    fn maybe_launch(&mut self, now: Instant) {
        if self.draining {
            return;
        }
        self.queue.purge_dead(now);
        let waiting = self.queue.len();
        let covered = self
            .instances
            .values()
            .filter(|slot| {
                matches!(
                    slot.record.status,
                    InstanceStatus::Idle | InstanceStatus::Starting
                )
            })
            .count();
        let deficit = waiting.saturating_sub(covered);
        let headroom = self
            .config
            .max_instances()
            .saturating_sub(self.instances.len());
        for _ in 0..deficit.min(headroom) {
            self.spawn_launch();
        }
    }

    fn spawn_launch(&mut self) {
        let record = InstanceRecord::new();
        let id = record.id;
        info!(shard = self.shard, instance = %id, "launching engine instance");
        self.instances.insert(
            id,
            PooledInstance {
                record,
                engine: None,
            },
        );
        let launcher = Arc::clone(&self.launcher);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = launcher.launch().await;
            if let Err(mpsc::error::SendError(PoolCommand::LaunchDone {
                result: Ok(engine),
                ..
            })) = tx.send(PoolCommand::LaunchDone { id, result })
            {
                // Worker is gone; close the freshly launched process.
                spawn_close(engine);
            }
        });
    }

    async fn handle_launch_done(
        &mut self,
        id: InstanceId,
        result: Result<Box<dyn RenderEngine>, EngineError>,
    ) {
        let now = Instant::now();
        match result {
            Ok(engine) => {
                if self.draining || !self.instances.contains_key(&id) {
                    spawn_close(engine);
                    self.instances.remove(&id);
                    return;
                }
                if let Some(slot) = self.instances.get_mut(&id) {
                    slot.record.transition(InstanceStatus::Idle);
                    slot.record.touch();
                    slot.engine = Some(engine);
                    info!(shard = self.shard, instance = %id, "engine instance ready");
                }
                self.satisfy_waiters(now).await;
            }
            Err(e) => {
                warn!(shard = self.shard, instance = %id, error = %e, "engine launch failed");
                if let Some(mut slot) = self.instances.remove(&id) {
                    slot.record.transition(InstanceStatus::Closed);
                }
                // The launch was started on behalf of queued demand; the
                // failure is reported, never silently retried here.
                if let Some(waiter) = self.queue.pop_live(now) {
                    let _ = waiter
                        .reply
                        .send(Err(RenderError::CreationFailure(e.to_string())));
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Queue satisfaction
    // -------------------------------------------------------------------------

    /// Serve queued waiters while idle instances remain, in FIFO order
    async fn satisfy_waiters(&mut self, now: Instant) {
        loop {
            if self.queue.is_empty() {
                return;
            }
            let Some((id, engine)) = self.checkout_idle().await else {
                return;
            };
            match self.queue.pop_live(now) {
                Some(waiter) => {
                    debug!(
                        shard = self.shard,
                        instance = %id,
                        call = %waiter.call_id,
                        waited_ms = waiter.enqueued_at.elapsed().as_millis() as u64,
                        "serving queued acquisition"
                    );
                    self.hand_out(id, engine, waiter.reply);
                }
                None => {
                    self.restore_idle(id, Some(engine));
                    return;
                }
            }
        }
    }

    fn restore_idle(&mut self, id: InstanceId, engine: Option<Box<dyn RenderEngine>>) {
        match self.instances.get_mut(&id) {
            Some(slot) => {
                slot.record.transition(InstanceStatus::Idle);
                slot.engine = engine;
            }
            None => {
                if let Some(engine) = engine {
                    spawn_close(engine);
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Sweep, stats, shutdown
    // -------------------------------------------------------------------------

    /// Periodic maintenance: retire idle-expired and aged-out instances,
    /// probe the rest, purge dead waiters.
    async fn handle_sweep(&mut self) {
        let now = Instant::now();
        let purged = self.queue.purge_dead(now);
        if purged > 0 {
            debug!(shard = self.shard, purged, "purged dead waiters");
        }

        let expired: Vec<InstanceId> = self
            .instances
            .iter()
            .filter(|(_, slot)| {
                slot.record.status == InstanceStatus::Idle
                    && (self.policy.idle_expired(&slot.record, now)
                        || matches!(
                            self.policy.evaluate(&slot.record, now),
                            RecycleDecision::Retire(_)
                        ))
            })
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(slot) = self.instances.get(&id) {
                info!(
                    shard = self.shard,
                    instance = %id,
                    idle_ms = slot.record.idle_for(now).as_millis() as u64,
                    "retiring idle instance"
                );
            }
            self.retire_slot(id, None);
        }

        // Keepalive: probe remaining idle instances, evict the dead.
        let idle_ids: Vec<InstanceId> = self
            .instances
            .iter()
            .filter(|(_, slot)| slot.record.status == InstanceStatus::Idle && slot.engine.is_some())
            .map(|(id, _)| *id)
            .collect();
        for id in idle_ids {
            let Some(engine) = self
                .instances
                .get_mut(&id)
                .and_then(|slot| slot.engine.take())
            else {
                continue;
            };
            if engine.is_alive().await {
                if let Some(slot) = self.instances.get_mut(&id) {
                    slot.engine = Some(engine);
                }
            } else {
                warn!(shard = self.shard, instance = %id, "idle instance dead at sweep, evicting");
                self.retire_slot(id, Some(engine));
            }
        }

        self.maybe_launch(now);
    }

    fn snapshot(&self) -> ShardStats {
        let mut stats = ShardStats {
            shard: self.shard,
            total_instances: self.instances.len(),
            queued_waiters: self.queue.len(),
            total_rendered: self.total_rendered,
            ..Default::default()
        };
        for slot in self.instances.values() {
            match slot.record.status {
                InstanceStatus::Idle => stats.idle_instances += 1,
                InstanceStatus::Busy => stats.busy_instances += 1,
                InstanceStatus::Starting => stats.starting_instances += 1,
                _ => {}
            }
        }
        stats
    }

    fn handle_shutdown(&mut self) {
        info!(shard = self.shard, "shard shutting down");
        self.draining = true;
        self.queue
            .drain_with(|| Err(RenderError::PoolUnavailable("shard shutting down".to_string())));
        let idle: Vec<InstanceId> = self
            .instances
            .iter()
            .filter(|(_, slot)| slot.engine.is_some())
            .map(|(id, _)| *id)
            .collect();
        for id in idle {
            self.retire_slot(id, None);
        }
        // Busy and starting instances drain through their release/launch
        // messages, which observe `draining` and close immediately.
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable handle to one shard's pool worker
#[derive(Clone)]
pub struct PoolHandle {
    shard: usize,
    config: PoolConfig,
    tx: mpsc::UnboundedSender<PoolCommand>,
}

impl PoolHandle {
    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Whether the shard worker is still accepting commands
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Acquire an engine lease, waiting up to `deadline`
    ///
    /// `None` uses the configured default deadline. Expiry yields
    /// [`RenderError::CapacityExceeded`] with the configured retry hint;
    /// the abandoned queue entry is skipped and purged by the worker.
    pub async fn acquire(
        &self,
        call_id: impl Into<String>,
        deadline: Option<Duration>,
    ) -> RenderResult<EngineLease> {
        let deadline = deadline.unwrap_or_else(|| self.config.acquire_deadline());
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolCommand::Acquire {
                call_id: call_id.into(),
                deadline: Instant::now() + deadline,
                reply,
            })
            .map_err(|_| RenderError::PoolUnavailable("shard mailbox closed".to_string()))?;
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RenderError::PoolUnavailable(
                "shard worker exited".to_string(),
            )),
            Err(_) => Err(RenderError::CapacityExceeded {
                retry_after: self.config.retry_after_hint(),
            }),
        }
    }

    /// Snapshot the shard's counters
    pub async fn stats(&self) -> RenderResult<ShardStats> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolCommand::Stats { reply })
            .map_err(|_| RenderError::PoolUnavailable("shard mailbox closed".to_string()))?;
        rx.await
            .map_err(|_| RenderError::PoolUnavailable("shard worker exited".to_string()))
    }

    /// Drain the shard: close idle engines, refuse new acquisitions
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(PoolCommand::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Start one shard: worker task, sweep ticker, optional pre-warmed instances
pub fn spawn_shard(
    shard: usize,
    config: PoolConfig,
    launcher: Arc<dyn EngineLauncher>,
) -> PoolHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut worker = ShardWorker {
        shard,
        policy: RecyclePolicy::from_config(&config),
        launcher,
        instances: HashMap::new(),
        queue: WaitQueue::new(config.wait_queue_limit()),
        total_rendered: 0,
        draining: false,
        tx: tx.clone(),
        config: config.clone(),
    };
    for _ in 0..config.warm_instances() {
        worker.spawn_launch();
    }
    tokio::spawn(worker.run(rx));

    let sweep_tx = tx.clone();
    let sweep_interval = config.sweep_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if sweep_tx.send(PoolCommand::Sweep).is_err() {
                break;
            }
        }
    });

    PoolHandle { shard, config, tx }
}
