//! Per-slot repeat loop.
//!
//! A loop is spawned when its slot's trigger goes down and discarded once it
//! has stopped. Each cycle resolves the target, presses the output key,
//! holds it briefly, releases it, and waits for the next tick. Ticks come
//! from a `tokio::time::interval`, so spacing is measured cycle start to
//! cycle start and does not drift with emission time.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::{self, JoinHandle};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::backend::{KeySender, Target};
use crate::config::{Slot, SlotId, MAX_INTERVAL_MS, MIN_INTERVAL_MS};
use crate::engine::EngineEvent;
use crate::error::{AutofireError, Result};
use crate::keys::Key;

/// Lifecycle of one loop. A loop goes `Running → Stopping → Idle` and is
/// then dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
}

impl LoopState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LoopState::Running,
            2 => LoopState::Stopping,
            _ => LoopState::Idle,
        }
    }
}

/// A validated slot with its keys resolved and its sender chosen.
pub struct Binding {
    pub slot: Arc<Slot>,
    pub trigger: Key,
    pub output: Key,
    pub sender: Arc<dyn KeySender>,
}

impl Binding {
    pub fn new(slot: Arc<Slot>, sender: Arc<dyn KeySender>) -> Result<Self> {
        let trigger = slot.trigger()?;
        let output = slot.output()?;
        Ok(Self {
            slot,
            trigger,
            output,
            sender,
        })
    }

    pub fn interval(&self) -> Duration {
        let ms = self.slot.interval_ms.clamp(MIN_INTERVAL_MS, MAX_INTERVAL_MS);
        Duration::from_millis(ms as u64)
    }

    async fn resolve_target(&self) -> Result<Target> {
        let Some(title) = self.slot.window_title.clone() else {
            return Ok(Target::Global);
        };
        let lookup = title.clone();
        let found = blocking(&self.sender, self.output, move |sender| {
            sender.find_window(&lookup)
        })
        .await?;
        found.map(Target::Window).ok_or_else(|| {
            AutofireError::emission(self.output.name(), format!("window '{title}' not found"))
        })
    }
}

/// Run one sender call on the blocking pool. Senders may spawn processes or
/// wait on the OS, which must not stall the runtime's worker threads.
async fn blocking<T, F>(sender: &Arc<dyn KeySender>, key: Key, call: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn KeySender) -> Result<T> + Send + 'static,
{
    let sender = sender.clone();
    task::spawn_blocking(move || call(sender.as_ref()))
        .await
        .map_err(|e| AutofireError::emission(key.name(), format!("sender task failed: {e}")))?
}

/// Keeps the physical trigger suppressed while alive. Release it with
/// [`Suppression::release`]; dropping it unreleased (an aborted loop) still
/// releases the key, synchronously.
pub struct Suppression {
    sender: Arc<dyn KeySender>,
    key: Key,
    released: bool,
}

impl Suppression {
    pub async fn acquire(sender: Arc<dyn KeySender>, key: Key) -> Result<Self> {
        blocking(&sender, key, move |s| s.suppress(&key)).await?;
        debug!(key = %key, "trigger suppressed");
        Ok(Self {
            sender,
            key,
            released: false,
        })
    }

    pub async fn release(mut self) {
        self.released = true;
        let key = self.key;
        match blocking(&self.sender, key, move |s| s.release(&key)).await {
            Ok(()) => debug!(key = %key, "trigger released"),
            Err(e) => warn!(key = %key, error = %e, "failed to release trigger"),
        }
    }
}

impl Drop for Suppression {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match self.sender.release(&self.key) {
            Ok(()) => debug!(key = %self.key, "trigger released on abort"),
            Err(e) => warn!(key = %self.key, error = %e, "failed to release trigger"),
        }
    }
}

/// An output key that has been pressed and not yet released. Dropping it
/// without [`HeldKey::release`] still sends the key-up.
struct HeldKey<'a> {
    binding: &'a Binding,
    target: Target,
    released: bool,
}

impl HeldKey<'_> {
    async fn release(mut self) -> Result<()> {
        self.released = true;
        let key = self.binding.output;
        let target = self.target;
        blocking(&self.binding.sender, key, move |sender| {
            if let Err(first) = sender.send_key_up(&key, target) {
                sender.send_key_up(&key, target).map_err(|_| first)?;
            }
            Ok(())
        })
        .await
    }
}

impl Drop for HeldKey<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let key = &self.binding.output;
        if let Err(e) = self.binding.sender.send_key_up(key, self.target) {
            warn!(
                slot = self.binding.slot.id,
                key = %key,
                error = %e,
                "output key may be left down"
            );
        }
    }
}

pub struct AutofireLoop {
    binding: Arc<Binding>,
    generation: u64,
    state: Arc<AtomicU8>,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<Result<()>>,
}

impl AutofireLoop {
    /// Start the repeat task. The loop is `Running` when this returns. With
    /// `suppress` set the task suppresses the trigger before its first
    /// emission and releases it after its last.
    pub(crate) fn spawn(
        binding: Arc<Binding>,
        generation: u64,
        hold: Duration,
        suppress: bool,
        reports: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        let state = Arc::new(AtomicU8::new(LoopState::Running as u8));
        let (stop_tx, stop_rx) = watch::channel(false);
        let hold = hold.min(binding.interval() / 2);

        let task = LoopTask {
            binding: binding.clone(),
            generation,
            hold,
            state: state.clone(),
            stop_rx,
            suppress,
            reports,
        };
        let handle = tokio::spawn(task.run());

        Self {
            binding,
            generation,
            state,
            stop_tx,
            handle,
        }
    }

    pub fn slot_id(&self) -> SlotId {
        self.binding.slot.id
    }

    pub fn trigger(&self) -> Key {
        self.binding.trigger
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn interval(&self) -> Duration {
        self.binding.interval()
    }

    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Signal the loop and wait up to `timeout` for it to reach `Idle`.
    ///
    /// Returns the emission error if the loop ended itself after a failed
    /// retry. A loop that misses the deadline is aborted and reported as a
    /// shutdown error.
    pub async fn stop(mut self, timeout: Duration) -> Result<()> {
        let _ = self.state.compare_exchange(
            LoopState::Running as u8,
            LoopState::Stopping as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let _ = self.stop_tx.send(true);

        match time::timeout(timeout, &mut self.handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(slot = self.slot_id(), error = %e, "loop task ended abnormally");
                self.state.store(LoopState::Idle as u8, Ordering::Release);
                Ok(())
            }
            Err(_) => {
                self.handle.abort();
                warn!(
                    slot = self.slot_id(),
                    timeout_ms = timeout.as_millis() as u64,
                    "loop did not stop in time, aborted"
                );
                Err(AutofireError::shutdown(vec![self.slot_id()]))
            }
        }
    }
}

struct LoopTask {
    binding: Arc<Binding>,
    generation: u64,
    hold: Duration,
    state: Arc<AtomicU8>,
    stop_rx: watch::Receiver<bool>,
    suppress: bool,
    reports: mpsc::UnboundedSender<EngineEvent>,
}

impl LoopTask {
    async fn run(mut self) -> Result<()> {
        let slot = self.binding.slot.id;
        debug!(
            slot,
            output = %self.binding.output,
            interval_ms = self.binding.interval().as_millis() as u64,
            "loop running"
        );

        let suppression = if self.suppress {
            match Suppression::acquire(self.binding.sender.clone(), self.binding.trigger).await {
                Ok(guard) => Some(guard),
                Err(e) => {
                    warn!(slot, error = %e, "could not suppress trigger, passing it through");
                    None
                }
            }
        } else {
            None
        };

        let mut ticker = time::interval(self.binding.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut failure = None;
        loop {
            tokio::select! {
                biased;
                _ = self.stop_rx.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.emit_with_retry().await {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }

        self.state
            .store(LoopState::Stopping as u8, Ordering::Release);
        if let Some(guard) = suppression {
            guard.release().await;
        }
        self.state.store(LoopState::Idle as u8, Ordering::Release);

        match failure {
            None => {
                debug!(slot, "loop stopped");
                Ok(())
            }
            Some(error) => {
                warn!(slot, error = %error, "slot deactivated after repeated emission failure");
                // Wake the coordinator so it reaps this loop without waiting
                // for the trigger to come up.
                let _ = self.reports.send(EngineEvent::LoopFailed {
                    slot,
                    generation: self.generation,
                });
                Err(error)
            }
        }
    }

    async fn emit_with_retry(&self) -> Result<()> {
        match self.emit_once().await {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(slot = self.binding.slot.id, error = %first, "emission failed, retrying");
                self.emit_once().await
            }
        }
    }

    async fn emit_once(&self) -> Result<()> {
        let binding = self.binding.as_ref();
        let target = binding.resolve_target().await?;
        let key = binding.output;
        blocking(&binding.sender, key, move |sender| {
            sender.send_key_down(&key, target)
        })
        .await?;
        let held = HeldKey {
            binding,
            target,
            released: false,
        };
        time::sleep(self.hold).await;
        held.release().await?;
        trace!(slot = binding.slot.id, key = %binding.output, "emitted");
        Ok(())
    }
}
