//! [`TriggerWatch`] backed by the `global-hotkey` crate.
//!
//! Each trigger key is registered once as an unmodified global hotkey no
//! matter how many slots watch it; the emergency chord is registered with
//! its modifiers. A listener thread turns `Pressed`/`Released` events into
//! the registered edge callbacks.
//!
//! Used off Windows only. Registered hotkeys are always consumed, so
//! `set_consuming` keeps its no-op default here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use global_hotkey::hotkey::{Code, HotKey, Modifiers};
use global_hotkey::{GlobalHotKeyEvent, GlobalHotKeyManager, HotKeyState};
use tracing::{debug, info, warn};

use crate::backend::{EdgeCallback, TriggerWatch, WatchHandle};
use crate::error::{AutofireError, Result};
use crate::keys::{Chord, Key, Modifier};

/// How long the listener blocks on the event channel before rechecking
/// whether it should exit.
const LISTENER_POLL: Duration = Duration::from_millis(5);

struct Route {
    handle: WatchHandle,
    on_down: Option<EdgeCallback>,
    on_up: Option<EdgeCallback>,
}

type RouteTable = Arc<Mutex<HashMap<u32, Vec<Route>>>>;

pub struct GlobalHotkeyWatch {
    manager: GlobalHotKeyManager,
    routes: RouteTable,
    registered: HashMap<WatchHandle, HotKey>,
    next_handle: u64,
    running: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
}

impl GlobalHotkeyWatch {
    pub fn new() -> Result<Self> {
        let manager = GlobalHotKeyManager::new()
            .map_err(|e| AutofireError::hotkey(format!("failed to create hotkey manager: {e}")))?;

        let routes: RouteTable = Arc::new(Mutex::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));
        let listener = spawn_listener(routes.clone(), running.clone())?;

        Ok(Self {
            manager,
            routes,
            registered: HashMap::new(),
            next_handle: 1,
            running,
            listener: Some(listener),
        })
    }

    fn add_route(
        &mut self,
        hotkey: HotKey,
        on_down: Option<EdgeCallback>,
        on_up: Option<EdgeCallback>,
    ) -> Result<WatchHandle> {
        let handle = WatchHandle(self.next_handle);
        self.next_handle += 1;

        let mut routes = self
            .routes
            .lock()
            .map_err(|_| AutofireError::hotkey("route table poisoned"))?;
        if routes.get(&hotkey.id()).is_none_or(|entry| entry.is_empty()) {
            self.manager
                .register(hotkey)
                .map_err(|e| AutofireError::hotkey(format!("failed to register hotkey: {e}")))?;
            debug!(id = hotkey.id(), "hotkey registered");
        }
        routes.entry(hotkey.id()).or_default().push(Route {
            handle,
            on_down,
            on_up,
        });
        self.registered.insert(handle, hotkey);
        Ok(handle)
    }
}

impl TriggerWatch for GlobalHotkeyWatch {
    fn watch(
        &mut self,
        key: &Key,
        on_down: EdgeCallback,
        on_up: EdgeCallback,
    ) -> Result<WatchHandle> {
        let hotkey = HotKey::new(None, key_code(key)?);
        self.add_route(hotkey, Some(on_down), Some(on_up))
    }

    fn watch_chord(&mut self, chord: &Chord, on_fire: EdgeCallback) -> Result<WatchHandle> {
        let hotkey = HotKey::new(Some(modifiers(chord)), key_code(&chord.key)?);
        let handle = self.add_route(hotkey, Some(on_fire), None)?;
        info!(chord = %chord, "emergency hotkey registered");
        Ok(handle)
    }

    fn unwatch(&mut self, handle: WatchHandle) -> Result<()> {
        let hotkey = self
            .registered
            .remove(&handle)
            .ok_or_else(|| AutofireError::hotkey(format!("unknown watch handle {}", handle.0)))?;

        let mut routes = self
            .routes
            .lock()
            .map_err(|_| AutofireError::hotkey("route table poisoned"))?;
        let now_empty = match routes.get_mut(&hotkey.id()) {
            Some(entry) => {
                entry.retain(|r| r.handle != handle);
                entry.is_empty()
            }
            None => false,
        };
        if now_empty {
            routes.remove(&hotkey.id());
            self.manager
                .unregister(hotkey)
                .map_err(|e| AutofireError::hotkey(format!("failed to unregister hotkey: {e}")))?;
            debug!(id = hotkey.id(), "hotkey unregistered");
        }
        Ok(())
    }
}

impl Drop for GlobalHotkeyWatch {
    fn drop(&mut self) {
        let handles: Vec<WatchHandle> = self.registered.keys().copied().collect();
        for handle in handles {
            if let Err(e) = self.unwatch(handle) {
                warn!(error = %e, "failed to unregister hotkey on teardown");
            }
        }
        self.running.store(false, Ordering::Relaxed);
        if let Some(listener) = self.listener.take() {
            let _ = listener.join();
        }
    }
}

fn spawn_listener(routes: RouteTable, running: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("autofire-hotkeys".into())
        .spawn(move || {
            let receiver = GlobalHotKeyEvent::receiver();
            while running.load(Ordering::Relaxed) {
                let Ok(event) = receiver.recv_timeout(LISTENER_POLL) else {
                    continue;
                };
                let callbacks: Vec<EdgeCallback> = match routes.lock() {
                    Ok(table) => table
                        .get(&event.id)
                        .into_iter()
                        .flatten()
                        .filter_map(|route| match event.state {
                            HotKeyState::Pressed => route.on_down.clone(),
                            HotKeyState::Released => route.on_up.clone(),
                        })
                        .collect(),
                    Err(_) => {
                        warn!("route table poisoned, hotkey listener exiting");
                        return;
                    }
                };
                for callback in callbacks {
                    callback();
                }
            }
        })
        .map_err(AutofireError::from)
}

fn modifiers(chord: &Chord) -> Modifiers {
    let mut mods = Modifiers::empty();
    for m in &chord.modifiers {
        mods |= match m {
            Modifier::Ctrl => Modifiers::CONTROL,
            Modifier::Alt => Modifiers::ALT,
            Modifier::Shift => Modifiers::SHIFT,
            Modifier::Meta => Modifiers::SUPER,
        };
    }
    mods
}

fn key_code(key: &Key) -> Result<Code> {
    let code = match key.name() {
        // Letters
        "a" => Code::KeyA,
        "b" => Code::KeyB,
        "c" => Code::KeyC,
        "d" => Code::KeyD,
        "e" => Code::KeyE,
        "f" => Code::KeyF,
        "g" => Code::KeyG,
        "h" => Code::KeyH,
        "i" => Code::KeyI,
        "j" => Code::KeyJ,
        "k" => Code::KeyK,
        "l" => Code::KeyL,
        "m" => Code::KeyM,
        "n" => Code::KeyN,
        "o" => Code::KeyO,
        "p" => Code::KeyP,
        "q" => Code::KeyQ,
        "r" => Code::KeyR,
        "s" => Code::KeyS,
        "t" => Code::KeyT,
        "u" => Code::KeyU,
        "v" => Code::KeyV,
        "w" => Code::KeyW,
        "x" => Code::KeyX,
        "y" => Code::KeyY,
        "z" => Code::KeyZ,

        // Digits
        "0" => Code::Digit0,
        "1" => Code::Digit1,
        "2" => Code::Digit2,
        "3" => Code::Digit3,
        "4" => Code::Digit4,
        "5" => Code::Digit5,
        "6" => Code::Digit6,
        "7" => Code::Digit7,
        "8" => Code::Digit8,
        "9" => Code::Digit9,

        // Function keys
        "f1" => Code::F1,
        "f2" => Code::F2,
        "f3" => Code::F3,
        "f4" => Code::F4,
        "f5" => Code::F5,
        "f6" => Code::F6,
        "f7" => Code::F7,
        "f8" => Code::F8,
        "f9" => Code::F9,
        "f10" => Code::F10,
        "f11" => Code::F11,
        "f12" => Code::F12,

        // Special keys
        "space" => Code::Space,
        "enter" => Code::Enter,
        "tab" => Code::Tab,
        "escape" => Code::Escape,
        "backspace" => Code::Backspace,
        "delete" => Code::Delete,
        "insert" => Code::Insert,
        "home" => Code::Home,
        "end" => Code::End,
        "pageup" => Code::PageUp,
        "pagedown" => Code::PageDown,
        "capslock" => Code::CapsLock,

        // Arrow keys
        "up" => Code::ArrowUp,
        "down" => Code::ArrowDown,
        "left" => Code::ArrowLeft,
        "right" => Code::ArrowRight,

        // Numpad
        "numpad0" => Code::Numpad0,
        "numpad1" => Code::Numpad1,
        "numpad2" => Code::Numpad2,
        "numpad3" => Code::Numpad3,
        "numpad4" => Code::Numpad4,
        "numpad5" => Code::Numpad5,
        "numpad6" => Code::Numpad6,
        "numpad7" => Code::Numpad7,
        "numpad8" => Code::Numpad8,
        "numpad9" => Code::Numpad9,

        // Punctuation
        "minus" => Code::Minus,
        "equal" => Code::Equal,
        "comma" => Code::Comma,
        "period" => Code::Period,
        "slash" => Code::Slash,
        "semicolon" => Code::Semicolon,
        "quote" => Code::Quote,
        "backquote" => Code::Backquote,
        "bracketleft" => Code::BracketLeft,
        "backslash" => Code::Backslash,
        "bracketright" => Code::BracketRight,

        other => {
            return Err(AutofireError::hotkey(format!(
                "key '{other}' cannot be registered as a global hotkey"
            )))
        }
    };

    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys;

    #[test]
    fn test_every_non_modifier_key_maps_to_a_code() {
        for name in keys::supported_keys() {
            let key = keys::lookup(name).unwrap();
            if key.is_modifier() {
                assert!(key_code(&key).is_err(), "{name} should not map");
            } else {
                assert!(key_code(&key).is_ok(), "{name} should map");
            }
        }
    }

    #[test]
    fn test_chord_modifiers() {
        let chord: Chord = "ctrl+alt+escape".parse().unwrap();
        assert_eq!(modifiers(&chord), Modifiers::CONTROL | Modifiers::ALT);
        assert_eq!(key_code(&chord.key).unwrap(), Code::Escape);
    }
}
