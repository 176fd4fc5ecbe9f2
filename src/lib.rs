//! # AutoFire
//!
//! Hold-to-repeat keyboard autofire with independent bindings.
//!
//! Each [`Slot`] binds a trigger key to an output key: while the trigger is
//! held, the output key is pressed and released every `interval_ms`
//! milliseconds, globally or into one window. Any number of slots can run
//! at once without affecting each other's timing.
//!
//! ## Features
//!
//! - Independent per-slot repeat loops on tokio tasks
//! - Optional trigger pass-through (a low-level keyboard hook on Windows)
//!   and per-slot window targeting
//! - Hardware (`SendInput`), message-queue and helper-script send methods
//! - Emergency stop chord, `ctrl+alt+escape` by default
//! - JSON configuration with legacy single-slot upgrade and hot reload
//!   driven by file-system notifications
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use autofire::{AutofireConfig, AutofireEngine, EngineOptions, SystemBackend};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = AutofireConfig::from_file("autofire.json")?;
//! let backend = Arc::new(SystemBackend::new(config.helper_script.clone()));
//! let options = EngineOptions {
//!     emergency_chord: config.emergency_chord()?,
//!     ..EngineOptions::default()
//! };
//!
//! let engine = AutofireEngine::new(backend, options);
//! engine.apply(config.slots).await?;
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! ```json
//! {
//!   "slots": [
//!     { "id": 1, "trigger_key": "e", "output_key": "r", "interval_ms": 50 },
//!     { "id": 2, "trigger_key": "q", "output_key": "space", "interval_ms": 100,
//!       "window_title": "Game", "method": "message_queue" }
//!   ],
//!   "emergency_hotkey": "ctrl+alt+escape"
//! }
//! ```

pub mod autofire_loop;
pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
#[cfg(not(windows))]
pub mod global_hotkey;
pub mod key_sender;
pub mod keyboard_hook;
pub mod keys;
pub mod reload;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod window_finder;

pub use autofire_loop::{AutofireLoop, LoopState};
pub use backend::{Backend, KeySender, SystemBackend, Target, TriggerWatch, WindowHandle};
pub use config::{AutofireConfig, SendMethod, Slot, SlotId};
pub use engine::{AutofireEngine, EngineOptions, EngineStatus, Notice};
pub use error::{AutofireError, Result};
pub use keys::{Chord, Key};
pub use reload::ConfigWatcher;
pub use window_finder::WindowFinder;
