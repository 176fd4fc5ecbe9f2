//! The multi-slot autofire engine.
//!
//! The engine owns the installed slot set, arms one trigger watcher per
//! enabled slot, and starts or stops that slot's [`AutofireLoop`] as its
//! trigger goes down and up. Watcher callbacks and loops never touch engine
//! state directly: they post [`EngineEvent`]s to a coordinator task, which
//! handles them one at a time under the same lock the public operations
//! take. Edges are therefore applied strictly in arrival order, and the
//! coordinator is the only writer of the status line.
//!
//! Every arming gets a fresh epoch and each watcher callback stamps its
//! edges with the epoch it was registered under. Edges still queued from an
//! earlier arming are dropped, so a reused slot id never inherits them.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::autofire_loop::{AutofireLoop, Binding};
use crate::backend::{Backend, EdgeCallback, KeySender, TriggerWatch, WatchHandle};
use crate::config::{validate_slots, SendMethod, Slot, SlotId};
use crate::error::{AutofireError, Result};
use crate::keys::Chord;

/// Status text while disarmed.
pub const STATUS_STOPPED: &str = "Stopped";

/// Default press duration of each emitted key.
pub const DEFAULT_DOWN_HOLD: Duration = Duration::from_millis(20);

const MIN_STOP_TIMEOUT: Duration = Duration::from_millis(50);
const NOTICE_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// How long each emitted key stays down. Capped at half the slot's
    /// interval so short intervals keep their rate.
    pub down_hold: Duration,
    /// Chord that triggers [`AutofireEngine::emergency_stop`] while armed.
    pub emergency_chord: Chord,
    /// Fixed stop timeout. When unset, twice the longest interval being
    /// stopped plus `down_hold`.
    pub stop_timeout: Option<Duration>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            down_hold: DEFAULT_DOWN_HOLD,
            emergency_chord: Chord::default(),
            stop_timeout: None,
        }
    }
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub armed: bool,
    /// Enabled slots installed (bound while armed).
    pub bound_count: usize,
    /// Canonical trigger names of active slots, in activation order,
    /// without duplicates.
    pub active_trigger_keys: Vec<String>,
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.armed {
            return f.write_str(STATUS_STOPPED);
        }
        if self.active_trigger_keys.is_empty() {
            return write!(f, "Running ({} slots)", self.bound_count);
        }
        let keys: Vec<String> = self
            .active_trigger_keys
            .iter()
            .map(|k| k.to_uppercase())
            .collect();
        write!(f, "Active: {}", keys.join(", "))
    }
}

/// Out-of-band messages for the UI alongside the status line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// A slot stopped itself after its emission retry failed.
    SlotFailed { slot: SlotId, reason: String },
    /// An operation was refused; the engine state is unchanged.
    Rejected { reason: String },
    EmergencyStop,
    /// These slots were aborted after missing the stop timeout.
    StopTimedOut { slots: Vec<SlotId> },
}

pub(crate) enum EngineEvent {
    TriggerDown { slot: SlotId, epoch: u64 },
    TriggerUp { slot: SlotId, epoch: u64 },
    Emergency { epoch: u64 },
    /// The loop ended itself; its error is collected when it is reaped.
    LoopFailed { slot: SlotId, generation: u64 },
    Shutdown,
}

struct Armed {
    watch: Box<dyn TriggerWatch>,
    handles: Vec<WatchHandle>,
    bindings: Vec<Arc<Binding>>,
}

impl Armed {
    fn binding(&self, slot: SlotId) -> Option<Arc<Binding>> {
        self.bindings.iter().find(|b| b.slot.id == slot).cloned()
    }

    fn unwatch_all(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(e) = self.watch.unwatch(handle) {
                warn!(handle = handle.0, error = %e, "failed to unwatch");
            }
        }
    }
}

#[derive(Default)]
struct EngineState {
    slots: Vec<Arc<Slot>>,
    armed: Option<Armed>,
    active: Vec<AutofireLoop>,
    held: HashSet<SlotId>,
    generation: u64,
    epoch: u64,
}

impl EngineState {
    fn snapshot(&self) -> EngineStatus {
        let mut keys: Vec<String> = Vec::new();
        for lp in &self.active {
            let name = lp.trigger().name();
            if !keys.iter().any(|k| k == name) {
                keys.push(name.to_string());
            }
        }
        EngineStatus {
            armed: self.armed.is_some(),
            bound_count: self.slots.iter().filter(|s| s.enabled).count(),
            active_trigger_keys: keys,
        }
    }
}

struct Shared {
    backend: Arc<dyn Backend>,
    options: EngineOptions,
    state: Mutex<EngineState>,
    events: mpsc::UnboundedSender<EngineEvent>,
    status: watch::Sender<String>,
    notices: broadcast::Sender<Notice>,
}

impl Shared {
    fn publish(&self, state: &EngineState) {
        let text = state.snapshot().to_string();
        trace!(status = %text, "status");
        self.status.send_replace(text);
    }

    fn notify(&self, notice: Notice) {
        // No subscribers is fine.
        let _ = self.notices.send(notice);
    }

    fn reject(&self, err: &AutofireError) {
        warn!(error = %err, "operation rejected");
        self.notify(Notice::Rejected {
            reason: err.to_string(),
        });
    }

    fn stop_timeout<'a>(&self, loops: impl IntoIterator<Item = &'a AutofireLoop>) -> Duration {
        if let Some(timeout) = self.options.stop_timeout {
            return timeout;
        }
        let longest = loops
            .into_iter()
            .map(|lp| lp.interval())
            .max()
            .unwrap_or_default();
        (longest * 2 + self.options.down_hold).max(MIN_STOP_TIMEOUT)
    }

    /// Tell subscribers a slot stopped on its own.
    fn slot_failed(&self, slot: SlotId, err: &AutofireError) {
        self.notify(Notice::SlotFailed {
            slot,
            reason: err.to_string(),
        });
    }

    /// Stop one loop and report how it ended.
    async fn reap(&self, lp: AutofireLoop) {
        let slot = lp.slot_id();
        let timeout = self.stop_timeout([&lp]);
        match lp.stop(timeout).await {
            Ok(()) => {}
            Err(AutofireError::Shutdown { slots }) => self.notify(Notice::StopTimedOut { slots }),
            Err(e) => self.slot_failed(slot, &e),
        }
    }

    fn arm(&self, slots: &[Arc<Slot>], epoch: u64) -> Result<Armed> {
        let enabled: Vec<Arc<Slot>> = slots.iter().filter(|s| s.enabled).cloned().collect();
        if enabled.is_empty() {
            return Err(AutofireError::engine("no enabled slots to bind"));
        }

        let mut senders: HashMap<SendMethod, Arc<dyn KeySender>> = HashMap::new();
        let mut bindings = Vec::with_capacity(enabled.len());
        for slot in enabled {
            let sender = match senders.get(&slot.method) {
                Some(sender) => sender.clone(),
                None => {
                    let sender = self.backend.key_sender(slot.method).map_err(|e| {
                        AutofireError::engine(format!("{} sender unavailable: {e}", slot.method))
                    })?;
                    senders.insert(slot.method, sender.clone());
                    sender
                }
            };
            bindings.push(Arc::new(Binding::new(slot, sender)?));
        }

        let watch = self
            .backend
            .trigger_watch()
            .map_err(|e| AutofireError::engine(format!("cannot open trigger watch: {e}")))?;
        let mut armed = Armed {
            watch,
            handles: Vec::new(),
            bindings,
        };
        if let Err(e) = self.register(&mut armed, epoch) {
            armed.unwatch_all();
            return Err(AutofireError::engine(format!("failed to bind keys: {e}")));
        }
        Ok(armed)
    }

    fn register(&self, armed: &mut Armed, epoch: u64) -> Result<()> {
        for binding in &armed.bindings {
            let slot = binding.slot.id;
            let down_tx = self.events.clone();
            let up_tx = self.events.clone();
            let on_down: EdgeCallback = Arc::new(move || {
                let _ = down_tx.send(EngineEvent::TriggerDown { slot, epoch });
            });
            let on_up: EdgeCallback = Arc::new(move || {
                let _ = up_tx.send(EngineEvent::TriggerUp { slot, epoch });
            });
            let handle = armed.watch.watch(&binding.trigger, on_down, on_up)?;
            armed.handles.push(handle);
            if !binding.slot.pass_through {
                armed.watch.set_consuming(handle, true)?;
            }
            debug!(slot, trigger = %binding.trigger, epoch, "trigger watched");
        }

        let tx = self.events.clone();
        let on_fire: EdgeCallback = Arc::new(move || {
            let _ = tx.send(EngineEvent::Emergency { epoch });
        });
        let handle = armed
            .watch
            .watch_chord(&self.options.emergency_chord, on_fire)?;
        armed.handles.push(handle);
        Ok(())
    }

    /// Stop every active loop, then drop all watchers. Slots that missed
    /// the timeout are reported after the rest have been cleaned up.
    async fn disarm(&self, state: &mut EngineState) -> Result<()> {
        let loops: Vec<AutofireLoop> = state.active.drain(..).collect();
        let timeout = self.stop_timeout(&loops);
        let mut failed = Vec::new();
        for lp in loops {
            let slot = lp.slot_id();
            match lp.stop(timeout).await {
                Ok(()) => {}
                Err(AutofireError::Shutdown { slots }) => failed.extend(slots),
                Err(e) => self.slot_failed(slot, &e),
            }
        }
        state.held.clear();
        state.epoch += 1;

        if let Some(mut armed) = state.armed.take() {
            armed.unwatch_all();
            info!("autofire disarmed");
        }

        if failed.is_empty() {
            Ok(())
        } else {
            self.notify(Notice::StopTimedOut {
                slots: failed.clone(),
            });
            Err(AutofireError::shutdown(failed))
        }
    }

    fn on_trigger_down(&self, state: &mut EngineState, slot: SlotId) {
        let Some(armed) = state.armed.as_ref() else {
            return;
        };
        if !state.held.insert(slot) {
            trace!(slot, "repeat down edge ignored");
            return;
        }
        if state.active.iter().any(|lp| lp.slot_id() == slot) {
            return;
        }
        let Some(binding) = armed.binding(slot) else {
            return;
        };

        state.generation += 1;
        let suppress = !binding.slot.pass_through;
        let lp = AutofireLoop::spawn(
            binding,
            state.generation,
            self.options.down_hold,
            suppress,
            self.events.clone(),
        );
        state.active.push(lp);
        debug!(slot, "slot activated");
        self.publish(state);
    }

    async fn on_trigger_up(&self, state: &mut EngineState, slot: SlotId) {
        state.held.remove(&slot);
        let Some(pos) = state.active.iter().position(|lp| lp.slot_id() == slot) else {
            return;
        };
        let lp = state.active.remove(pos);
        self.reap(lp).await;
        debug!(slot, "slot deactivated");
        self.publish(state);
    }

    /// Reap a loop that ended itself. If a trigger-up got there first the
    /// loop is already gone and its failure was reported then.
    async fn on_loop_failed(&self, state: &mut EngineState, slot: SlotId, generation: u64) {
        let Some(pos) = state
            .active
            .iter()
            .position(|lp| lp.slot_id() == slot && lp.generation() == generation)
        else {
            trace!(slot, generation, "failed loop already reaped");
            return;
        };
        let lp = state.active.remove(pos);
        self.reap(lp).await;
        self.publish(state);
    }

    async fn stop(&self, state: &mut EngineState) -> Result<()> {
        if state.armed.is_none() && state.active.is_empty() {
            return Ok(());
        }
        let result = self.disarm(state).await;
        self.publish(state);
        result
    }

    async fn emergency_stop(&self, state: &mut EngineState) -> Result<()> {
        warn!(active = state.active.len(), "emergency stop");
        self.notify(Notice::EmergencyStop);
        self.stop(state).await
    }
}

async fn coordinate(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<EngineEvent>) {
    while let Some(event) = events.recv().await {
        let mut state = shared.state.lock().await;
        match event {
            EngineEvent::TriggerDown { slot, epoch } if epoch == state.epoch => {
                trace!(slot, "trigger down");
                shared.on_trigger_down(&mut state, slot);
            }
            EngineEvent::TriggerUp { slot, epoch } if epoch == state.epoch => {
                trace!(slot, "trigger up");
                shared.on_trigger_up(&mut state, slot).await;
            }
            EngineEvent::Emergency { epoch } if epoch == state.epoch => {
                if let Err(e) = shared.emergency_stop(&mut state).await {
                    error!(error = %e, "emergency stop incomplete");
                }
            }
            EngineEvent::TriggerDown { epoch, .. }
            | EngineEvent::TriggerUp { epoch, .. }
            | EngineEvent::Emergency { epoch } => {
                trace!(epoch, current = state.epoch, "stale edge dropped");
            }
            EngineEvent::LoopFailed { slot, generation } => {
                shared.on_loop_failed(&mut state, slot, generation).await;
            }
            EngineEvent::Shutdown => break,
        }
    }
    debug!("engine coordinator exited");
}

/// Multi-slot autofire engine.
///
/// Must be created inside a tokio runtime; the coordinator task is spawned
/// on construction.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use autofire::{AutofireEngine, EngineOptions, Slot, SystemBackend};
///
/// # async fn demo() -> autofire::Result<()> {
/// let engine = AutofireEngine::new(Arc::new(SystemBackend::default()), EngineOptions::default());
/// engine.apply(vec![Slot::new(1, "e", "r").with_interval(50)]).await?;
/// engine.start().await?;
/// println!("{}", engine.status().await);
/// engine.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct AutofireEngine {
    shared: Arc<Shared>,
    coordinator: JoinHandle<()>,
}

impl AutofireEngine {
    pub fn new(backend: Arc<dyn Backend>, options: EngineOptions) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(STATUS_STOPPED.to_string());
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let shared = Arc::new(Shared {
            backend,
            options,
            state: Mutex::new(EngineState::default()),
            events,
            status,
            notices,
        });
        let coordinator = tokio::spawn(coordinate(shared.clone(), events_rx));
        Self {
            shared,
            coordinator,
        }
    }

    /// Replace the slot set. Every enabled slot is validated first; on
    /// failure nothing changes. On success the engine is disarmed and the
    /// new set installed, ready for [`AutofireEngine::start`].
    pub async fn apply(&self, slots: Vec<Slot>) -> Result<()> {
        if let Err(e) = validate_slots(&slots) {
            self.shared.reject(&e);
            return Err(e);
        }

        let mut state = self.shared.state.lock().await;
        let result = self.shared.disarm(&mut state).await;
        state.slots = slots.into_iter().map(Arc::new).collect();
        info!(
            slots = state.slots.len(),
            enabled = state.slots.iter().filter(|s| s.enabled).count(),
            "slots applied"
        );
        self.shared.publish(&state);
        result
    }

    /// Arm watchers for every enabled slot. No loop runs until a trigger
    /// goes down.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        if state.armed.is_some() {
            return Ok(());
        }
        state.epoch += 1;
        match self.shared.arm(&state.slots, state.epoch) {
            Ok(armed) => {
                info!(bound = armed.bindings.len(), "autofire armed");
                state.armed = Some(armed);
                self.shared.publish(&state);
                Ok(())
            }
            Err(e) => {
                self.shared.reject(&e);
                Err(e)
            }
        }
    }

    /// Deactivate every loop and unregister all watchers. A no-op when
    /// already stopped.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        self.shared.stop(&mut state).await
    }

    /// Same as [`AutofireEngine::stop`], announced as an emergency. The
    /// emergency chord reaches this path without going through the caller.
    pub async fn emergency_stop(&self) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        self.shared.emergency_stop(&mut state).await
    }

    /// Stop and end the coordinator. Edges arriving afterwards are dropped.
    pub async fn shutdown(&self) -> Result<()> {
        let result = self.stop().await;
        let _ = self.shared.events.send(EngineEvent::Shutdown);
        result
    }

    /// Broadcast a refusal that happened outside the engine, such as a
    /// config edit that failed to parse.
    pub fn report_rejected(&self, err: &AutofireError) {
        self.shared.reject(err);
    }

    pub async fn status(&self) -> EngineStatus {
        self.shared.state.lock().await.snapshot()
    }

    /// Installed slots in insertion order.
    pub async fn slots(&self) -> Vec<Slot> {
        let state = self.shared.state.lock().await;
        state.slots.iter().map(|s| s.as_ref().clone()).collect()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<String> {
        self.shared.status.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.shared.notices.subscribe()
    }
}

impl Drop for AutofireEngine {
    fn drop(&mut self) {
        self.coordinator.abort();
    }
}
