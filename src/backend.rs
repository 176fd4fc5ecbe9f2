//! Collaborator interfaces consumed by the engine.
//!
//! The engine never talks to the operating system directly. It asks a
//! [`Backend`] for one [`KeySender`] per send method and opens a fresh
//! [`TriggerWatch`] each time it is armed.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::SendMethod;
use crate::error::{AutofireError, Result};
#[cfg(not(windows))]
use crate::global_hotkey::GlobalHotkeyWatch;
#[cfg(windows)]
use crate::keyboard_hook::KeyboardHookWatch;
use crate::key_sender::{HardwareSender, MessageSender, ScriptSender};
use crate::keys::{Chord, Key};

/// Opaque platform window handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowHandle(pub u64);

/// Where an emission is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Whatever currently has keyboard focus.
    Global,
    Window(WindowHandle),
}

/// Performs key emissions for one send strategy.
///
/// Loop tasks call these on tokio's blocking pool, so an implementation may
/// block (spawn a process, wait on the OS) without stalling other slots.
pub trait KeySender: Send + Sync {
    fn send_key_down(&self, key: &Key, target: Target) -> Result<()>;

    fn send_key_up(&self, key: &Key, target: Target) -> Result<()>;

    /// Look up a window by title. `Ok(None)` means no such window.
    fn find_window(&self, title: &str) -> Result<Option<WindowHandle>>;

    /// Stop delivering the physical `key` to its normal destination.
    fn suppress(&self, key: &Key) -> Result<()>;

    /// Undo a previous [`KeySender::suppress`].
    fn release(&self, key: &Key) -> Result<()>;
}

/// Callback invoked on a key edge. Runs on the watcher's own thread.
pub type EdgeCallback = Arc<dyn Fn() + Send + Sync>;

/// Identifies one registration made through [`TriggerWatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchHandle(pub u64);

/// Reports physical key edges for watched keys.
///
/// Several handles may watch the same key; each gets its own callbacks.
pub trait TriggerWatch: Send {
    fn watch(
        &mut self,
        key: &Key,
        on_down: EdgeCallback,
        on_up: EdgeCallback,
    ) -> Result<WatchHandle>;

    fn watch_chord(&mut self, chord: &Chord, on_fire: EdgeCallback) -> Result<WatchHandle>;

    /// Withhold presses of the watched key from other applications while
    /// `consuming` is set. Watchers that cannot filter input ignore this.
    fn set_consuming(&mut self, handle: WatchHandle, consuming: bool) -> Result<()> {
        let _ = (handle, consuming);
        Ok(())
    }

    fn unwatch(&mut self, handle: WatchHandle) -> Result<()>;
}

/// Supplies collaborators to the engine.
pub trait Backend: Send + Sync {
    /// Fails when the strategy cannot be used here, e.g. a missing helper.
    fn key_sender(&self, method: SendMethod) -> Result<Arc<dyn KeySender>>;

    fn trigger_watch(&self) -> Result<Box<dyn TriggerWatch>>;
}

/// Backend driving the real keyboard.
#[derive(Debug, Clone, Default)]
pub struct SystemBackend {
    helper_script: Option<PathBuf>,
}

impl SystemBackend {
    pub fn new(helper_script: Option<PathBuf>) -> Self {
        Self { helper_script }
    }
}

impl Backend for SystemBackend {
    fn key_sender(&self, method: SendMethod) -> Result<Arc<dyn KeySender>> {
        match method {
            SendMethod::Hardware => Ok(Arc::new(HardwareSender::new()?)),
            SendMethod::MessageQueue => Ok(Arc::new(MessageSender::new()?)),
            SendMethod::Script => {
                let helper = self.helper_script.clone().ok_or_else(|| {
                    AutofireError::engine("script method selected but no helper_script configured")
                })?;
                Ok(Arc::new(ScriptSender::new(helper)?))
            }
        }
    }

    /// A low-level keyboard hook on Windows, which sees key-up edges and
    /// can pass presses through. Registered hotkeys elsewhere.
    fn trigger_watch(&self) -> Result<Box<dyn TriggerWatch>> {
        #[cfg(windows)]
        {
            Ok(Box::new(KeyboardHookWatch::new()?))
        }
        #[cfg(not(windows))]
        {
            Ok(Box::new(GlobalHotkeyWatch::new()?))
        }
    }
}
