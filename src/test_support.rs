//! In-memory backend for driving the engine without a keyboard.
//!
//! [`MockBackend`] hands out a shared [`RecordingSender`] for every send
//! method and [`TriggerWatch`]es whose edges are fired by calling
//! [`MockBackend::press`] and [`MockBackend::release`]. Timestamps come from
//! `tokio::time::Instant`, so they follow paused test time.
//!
//! Available to unit tests and, through the `test-support` feature, to the
//! integration tests under `tests/`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::backend::{Backend, EdgeCallback, KeySender, Target, TriggerWatch, WatchHandle, WindowHandle};
use crate::config::SendMethod;
use crate::error::{AutofireError, Result};
use crate::keys::{self, Chord, Key};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn canonical_name(key: &str) -> String {
    keys::lookup(key)
        .map(|k| k.name().to_string())
        .unwrap_or_else(|_| key.to_lowercase())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Down,
    Up,
}

/// One key event delivered through a [`RecordingSender`].
#[derive(Debug, Clone)]
pub struct SentKey {
    pub key: &'static str,
    pub edge: Edge,
    pub target: Target,
    pub at: Instant,
}

#[derive(Default)]
struct Record {
    sent: Vec<SentKey>,
    suppressed: Vec<&'static str>,
    released: Vec<&'static str>,
    lookups: Vec<String>,
}

/// [`KeySender`] that records every call.
#[derive(Default)]
pub struct RecordingSender {
    record: Mutex<Record>,
    windows: Mutex<HashMap<String, WindowHandle>>,
    failing: AtomicBool,
    key_up_delay: Mutex<Option<Duration>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `title` resolvable by [`KeySender::find_window`].
    pub fn add_window(&self, title: &str, handle: u64) {
        lock(&self.windows).insert(title.to_string(), WindowHandle(handle));
    }

    /// Close a window: lookups stop finding it and sends to it fail.
    pub fn remove_window(&self, title: &str) {
        lock(&self.windows).remove(title);
    }

    /// While set, every key-down and key-up fails with an emission error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Block the calling thread this long on every key-up.
    pub fn set_key_up_delay(&self, delay: Duration) {
        *lock(&self.key_up_delay) = Some(delay);
    }

    pub fn sent(&self) -> Vec<SentKey> {
        lock(&self.record).sent.clone()
    }

    fn count(&self, key: &str, edge: Edge) -> usize {
        let key = canonical_name(key);
        lock(&self.record)
            .sent
            .iter()
            .filter(|s| s.key == key && s.edge == edge)
            .count()
    }

    /// Completed presses of `key`, counted by key-down.
    pub fn emissions(&self, key: &str) -> usize {
        self.downs(key)
    }

    pub fn downs(&self, key: &str) -> usize {
        self.count(key, Edge::Down)
    }

    pub fn ups(&self, key: &str) -> usize {
        self.count(key, Edge::Up)
    }

    /// Instants of every key-down of `key`.
    pub fn emission_times(&self, key: &str) -> Vec<Instant> {
        let key = canonical_name(key);
        lock(&self.record)
            .sent
            .iter()
            .filter(|s| s.key == key && s.edge == Edge::Down)
            .map(|s| s.at)
            .collect()
    }

    /// Targets of every key-down of `key`.
    pub fn targets(&self, key: &str) -> Vec<Target> {
        let key = canonical_name(key);
        lock(&self.record)
            .sent
            .iter()
            .filter(|s| s.key == key && s.edge == Edge::Down)
            .map(|s| s.target)
            .collect()
    }

    pub fn suppress_count(&self, key: &str) -> usize {
        let key = canonical_name(key);
        lock(&self.record)
            .suppressed
            .iter()
            .filter(|k| **k == key)
            .count()
    }

    pub fn release_count(&self, key: &str) -> usize {
        let key = canonical_name(key);
        lock(&self.record)
            .released
            .iter()
            .filter(|k| **k == key)
            .count()
    }

    pub fn window_lookups(&self, title: &str) -> usize {
        lock(&self.record)
            .lookups
            .iter()
            .filter(|t| *t == title)
            .count()
    }

    /// Sends into a window that has since been removed fail, like posting
    /// to a destroyed window.
    fn check_target(&self, key: &Key, target: Target) -> Result<()> {
        if let Target::Window(handle) = target {
            if !lock(&self.windows).values().any(|h| *h == handle) {
                return Err(AutofireError::emission(key.name(), "target window closed"));
            }
        }
        Ok(())
    }

    fn push(&self, key: &Key, edge: Edge, target: Target) {
        lock(&self.record).sent.push(SentKey {
            key: key.name(),
            edge,
            target,
            at: Instant::now(),
        });
    }
}

impl KeySender for RecordingSender {
    fn send_key_down(&self, key: &Key, target: Target) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AutofireError::emission(key.name(), "injected failure"));
        }
        self.check_target(key, target)?;
        self.push(key, Edge::Down, target);
        Ok(())
    }

    fn send_key_up(&self, key: &Key, target: Target) -> Result<()> {
        let delay = *lock(&self.key_up_delay);
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(AutofireError::emission(key.name(), "injected failure"));
        }
        self.check_target(key, target)?;
        self.push(key, Edge::Up, target);
        Ok(())
    }

    fn find_window(&self, title: &str) -> Result<Option<WindowHandle>> {
        lock(&self.record).lookups.push(title.to_string());
        Ok(lock(&self.windows).get(title).copied())
    }

    fn suppress(&self, key: &Key) -> Result<()> {
        lock(&self.record).suppressed.push(key.name());
        Ok(())
    }

    fn release(&self, key: &Key) -> Result<()> {
        lock(&self.record).released.push(key.name());
        Ok(())
    }
}

struct KeyRoute {
    key: &'static str,
    consuming: bool,
    on_down: EdgeCallback,
    on_up: EdgeCallback,
}

#[derive(Default)]
struct Hub {
    next_handle: u64,
    keys: HashMap<u64, KeyRoute>,
    chords: HashMap<u64, (String, EdgeCallback)>,
    open: usize,
}

/// [`TriggerWatch`] whose edges are fired by hand. Dropping it removes
/// everything it registered.
pub struct ManualWatch {
    hub: Arc<Mutex<Hub>>,
    owned: Vec<u64>,
}

impl TriggerWatch for ManualWatch {
    fn watch(
        &mut self,
        key: &Key,
        on_down: EdgeCallback,
        on_up: EdgeCallback,
    ) -> Result<WatchHandle> {
        let mut hub = lock(&self.hub);
        hub.next_handle += 1;
        let id = hub.next_handle;
        hub.keys.insert(
            id,
            KeyRoute {
                key: key.name(),
                consuming: false,
                on_down,
                on_up,
            },
        );
        self.owned.push(id);
        Ok(WatchHandle(id))
    }

    fn watch_chord(&mut self, chord: &Chord, on_fire: EdgeCallback) -> Result<WatchHandle> {
        let mut hub = lock(&self.hub);
        hub.next_handle += 1;
        let id = hub.next_handle;
        hub.chords.insert(id, (chord.to_string(), on_fire));
        self.owned.push(id);
        Ok(WatchHandle(id))
    }

    fn set_consuming(&mut self, handle: WatchHandle, consuming: bool) -> Result<()> {
        let mut hub = lock(&self.hub);
        let route = hub.keys.get_mut(&handle.0).ok_or_else(|| {
            AutofireError::hotkey(format!("unknown watch handle {}", handle.0))
        })?;
        route.consuming = consuming;
        Ok(())
    }

    fn unwatch(&mut self, handle: WatchHandle) -> Result<()> {
        let mut hub = lock(&self.hub);
        let removed = hub.keys.remove(&handle.0).is_some() || hub.chords.remove(&handle.0).is_some();
        if !removed {
            return Err(AutofireError::hotkey(format!(
                "unknown watch handle {}",
                handle.0
            )));
        }
        self.owned.retain(|id| *id != handle.0);
        Ok(())
    }
}

impl Drop for ManualWatch {
    fn drop(&mut self) {
        let mut hub = lock(&self.hub);
        for id in self.owned.drain(..) {
            hub.keys.remove(&id);
            hub.chords.remove(&id);
        }
        hub.open -= 1;
    }
}

/// [`Backend`] for tests.
#[derive(Default)]
pub struct MockBackend {
    sender: Arc<RecordingSender>,
    overrides: Mutex<HashMap<SendMethod, Arc<dyn KeySender>>>,
    hub: Arc<Mutex<Hub>>,
    unavailable: Mutex<HashSet<SendMethod>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The sender returned for every available method.
    pub fn sender(&self) -> Arc<RecordingSender> {
        self.sender.clone()
    }

    /// Hand out `sender` for `method` instead of the recording sender.
    pub fn set_sender(&self, method: SendMethod, sender: Arc<dyn KeySender>) {
        lock(&self.overrides).insert(method, sender);
    }

    /// Make [`Backend::key_sender`] fail for `method`.
    pub fn set_unavailable(&self, method: SendMethod) {
        lock(&self.unavailable).insert(method);
    }

    /// Fire a down edge on every watch of `key`.
    pub fn press(&self, key: &str) {
        let key = canonical_name(key);
        let callbacks: Vec<EdgeCallback> = lock(&self.hub)
            .keys
            .values()
            .filter(|r| r.key == key)
            .map(|r| r.on_down.clone())
            .collect();
        for callback in callbacks {
            callback();
        }
    }

    /// Fire an up edge on every watch of `key`.
    pub fn release(&self, key: &str) {
        let key = canonical_name(key);
        let callbacks: Vec<EdgeCallback> = lock(&self.hub)
            .keys
            .values()
            .filter(|r| r.key == key)
            .map(|r| r.on_up.clone())
            .collect();
        for callback in callbacks {
            callback();
        }
    }

    /// Fire every registered chord.
    pub fn fire_emergency(&self) {
        let callbacks: Vec<EdgeCallback> = lock(&self.hub)
            .chords
            .values()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback();
        }
    }

    /// Watched trigger names, one entry per registration, sorted.
    pub fn watched_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.hub)
            .keys
            .values()
            .map(|r| r.key.to_string())
            .collect();
        keys.sort();
        keys
    }

    /// Watched trigger names whose presses are withheld from other
    /// applications, one entry per registration, sorted.
    pub fn consumed_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.hub)
            .keys
            .values()
            .filter(|r| r.consuming)
            .map(|r| r.key.to_string())
            .collect();
        keys.sort();
        keys
    }

    pub fn watched_chords(&self) -> Vec<String> {
        lock(&self.hub)
            .chords
            .values()
            .map(|(chord, _)| chord.clone())
            .collect()
    }

    /// Watchers handed out and not yet dropped.
    pub fn open_watches(&self) -> usize {
        lock(&self.hub).open
    }
}

impl Backend for MockBackend {
    fn key_sender(&self, method: SendMethod) -> Result<Arc<dyn KeySender>> {
        if lock(&self.unavailable).contains(&method) {
            return Err(AutofireError::unsupported_platform(format!(
                "{method} is unavailable"
            )));
        }
        if let Some(sender) = lock(&self.overrides).get(&method) {
            return Ok(sender.clone());
        }
        Ok(self.sender.clone())
    }

    fn trigger_watch(&self) -> Result<Box<dyn TriggerWatch>> {
        lock(&self.hub).open += 1;
        Ok(Box::new(ManualWatch {
            hub: self.hub.clone(),
            owned: Vec::new(),
        }))
    }
}
