//! [`TriggerWatch`] backed by a low-level keyboard hook.
//!
//! On Windows a `WH_KEYBOARD_LL` hook sees every physical key edge before
//! any application does. That gives real key-up edges for plain keys, and
//! lets each press either continue to the focused window or be swallowed.
//! The hook runs on its own thread with a message loop, as the system
//! requires.
//!
//! The routing decisions live in [`HookRouter`], which has no OS dependency:
//! the hook callback only reads the event, asks the router, and runs the
//! returned callbacks.

use std::collections::HashMap;

use crate::backend::{EdgeCallback, WatchHandle};
use crate::error::{AutofireError, Result};
use crate::keys::{Chord, Key, Modifier};

/// Marker placed in `dwExtraInfo` of every event this process injects, so
/// the hook lets its own output through untouched.
pub const INJECTED_EXTRA_INFO: usize = 0xFFC3_C3C3;

/// What happens to a physical key event after the hook has seen it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    /// Deliver it as usual.
    Pass,
    /// Swallow it.
    Block,
}

impl KeyAction {
    fn from_blocked(blocked: bool) -> Self {
        if blocked {
            KeyAction::Block
        } else {
            KeyAction::Pass
        }
    }
}

/// Outcome of routing one key event.
pub struct Dispatch {
    pub action: KeyAction,
    /// Edge callbacks to run, outside any lock.
    pub callbacks: Vec<EdgeCallback>,
}

struct KeyRoute {
    handle: WatchHandle,
    consuming: bool,
    on_down: EdgeCallback,
    on_up: EdgeCallback,
}

struct ChordRoute {
    handle: WatchHandle,
    chord: Chord,
    on_fire: EdgeCallback,
}

/// Registrations made through one hook watcher, keyed by virtual-key code.
#[derive(Default)]
pub struct HookRouter {
    keys: HashMap<u16, Vec<KeyRoute>>,
    chords: Vec<ChordRoute>,
    /// Keys physically down, with whether their press was blocked. A key-up
    /// gets the same fate as the press it ends.
    pressed: HashMap<u16, bool>,
    next_handle: u64,
}

impl HookRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self) -> WatchHandle {
        self.next_handle += 1;
        WatchHandle(self.next_handle)
    }

    pub fn add_key(&mut self, key: &Key, on_down: EdgeCallback, on_up: EdgeCallback) -> WatchHandle {
        let handle = self.allocate();
        self.keys.entry(key.code()).or_default().push(KeyRoute {
            handle,
            consuming: false,
            on_down,
            on_up,
        });
        handle
    }

    pub fn add_chord(&mut self, chord: &Chord, on_fire: EdgeCallback) -> WatchHandle {
        let handle = self.allocate();
        self.chords.push(ChordRoute {
            handle,
            chord: chord.clone(),
            on_fire,
        });
        handle
    }

    pub fn set_consuming(&mut self, handle: WatchHandle, consuming: bool) -> Result<()> {
        let route = self
            .keys
            .values_mut()
            .flatten()
            .find(|r| r.handle == handle)
            .ok_or_else(|| unknown(handle))?;
        route.consuming = consuming;
        Ok(())
    }

    pub fn remove(&mut self, handle: WatchHandle) -> Result<()> {
        if let Some(pos) = self.chords.iter().position(|c| c.handle == handle) {
            self.chords.remove(pos);
            return Ok(());
        }
        let code = self
            .keys
            .iter()
            .find(|(_, routes)| routes.iter().any(|r| r.handle == handle))
            .map(|(code, _)| *code)
            .ok_or_else(|| unknown(handle))?;
        if let Some(routes) = self.keys.get_mut(&code) {
            routes.retain(|r| r.handle != handle);
            if routes.is_empty() {
                self.keys.remove(&code);
            }
        }
        Ok(())
    }

    /// Route one physical edge of `vk`. `held` lists the modifiers down at
    /// the time and `suppressed` says whether a sender currently suppresses
    /// the key.
    ///
    /// A fresh press is blocked when a consuming watch covers the key, when
    /// it completes a watched chord, or when it is suppressed. Auto-repeat
    /// presses and the final release share the fate of the first press.
    pub fn key_event(&mut self, vk: u16, down: bool, held: &[Modifier], suppressed: bool) -> Dispatch {
        let routes = self.keys.get(&vk);
        if !down {
            let blocked = self.pressed.remove(&vk).unwrap_or(false);
            return Dispatch {
                action: KeyAction::from_blocked(blocked),
                callbacks: routes
                    .map(|r| r.iter().map(|r| r.on_up.clone()).collect())
                    .unwrap_or_default(),
            };
        }

        let downs = routes
            .map(|r| r.iter().map(|r| r.on_down.clone()).collect())
            .unwrap_or_default();
        if let Some(&blocked) = self.pressed.get(&vk) {
            return Dispatch {
                action: KeyAction::from_blocked(blocked),
                callbacks: downs,
            };
        }

        let mut callbacks: Vec<EdgeCallback> = downs;
        let mut blocked = suppressed || routes.is_some_and(|r| r.iter().any(|r| r.consuming));
        for route in &self.chords {
            let chord = &route.chord;
            if chord.key.code() == vk && chord.modifiers.iter().all(|m| held.contains(m)) {
                callbacks.push(route.on_fire.clone());
                blocked = true;
            }
        }
        self.pressed.insert(vk, blocked);
        Dispatch {
            action: KeyAction::from_blocked(blocked),
            callbacks,
        }
    }
}

fn unknown(handle: WatchHandle) -> AutofireError {
    AutofireError::hotkey(format!("unknown watch handle {}", handle.0))
}

#[cfg(windows)]
pub use self::hook::KeyboardHookWatch;

#[cfg(windows)]
mod hook {
    use std::mem;
    use std::ptr;
    use std::sync::{mpsc, Arc, Mutex, MutexGuard};
    use std::thread::{self, JoinHandle};

    use tracing::{debug, info, warn};
    use winapi::ctypes::c_int;
    use winapi::shared::minwindef::{DWORD, LPARAM, LRESULT, UINT, WPARAM};
    use winapi::um::libloaderapi::GetModuleHandleW;
    use winapi::um::processthreadsapi::GetCurrentThreadId;
    use winapi::um::winuser::{
        CallNextHookEx, DispatchMessageW, GetAsyncKeyState, GetMessageW, PeekMessageW,
        PostThreadMessageW, SetWindowsHookExW, TranslateMessage, UnhookWindowsHookEx, HC_ACTION,
        KBDLLHOOKSTRUCT, MSG, PM_NOREMOVE, VK_CONTROL, VK_LWIN, VK_MENU, VK_RWIN, VK_SHIFT,
        WH_KEYBOARD_LL, WM_KEYDOWN, WM_QUIT, WM_SYSKEYDOWN,
    };

    use super::{HookRouter, KeyAction, INJECTED_EXTRA_INFO};
    use crate::backend::{EdgeCallback, TriggerWatch, WatchHandle};
    use crate::error::{AutofireError, Result};
    use crate::key_sender::is_suppressed;
    use crate::keys::{Chord, Key, Modifier};

    /// Router of the installed hook. The hook procedure has no user data
    /// pointer, so only one hook watcher exists at a time.
    static ACTIVE: Mutex<Option<Arc<Mutex<HookRouter>>>> = Mutex::new(None);

    fn active() -> Result<MutexGuard<'static, Option<Arc<Mutex<HookRouter>>>>> {
        ACTIVE
            .lock()
            .map_err(|_| AutofireError::hotkey("hook registry poisoned"))
    }

    pub struct KeyboardHookWatch {
        router: Arc<Mutex<HookRouter>>,
        thread_id: DWORD,
        thread: Option<JoinHandle<()>>,
    }

    impl KeyboardHookWatch {
        pub fn new() -> Result<Self> {
            let router = Arc::new(Mutex::new(HookRouter::new()));
            {
                let mut slot = active()?;
                if slot.is_some() {
                    return Err(AutofireError::hotkey("a keyboard hook is already installed"));
                }
                *slot = Some(router.clone());
            }

            let (ready_tx, ready_rx) = mpsc::channel();
            let thread = thread::Builder::new()
                .name("autofire-keyboard-hook".into())
                .spawn(move || run_hook(ready_tx));
            let thread = match thread {
                Ok(thread) => thread,
                Err(e) => {
                    clear(&router);
                    return Err(AutofireError::hotkey(format!("failed to spawn hook thread: {e}")));
                }
            };

            let thread_id = match ready_rx.recv() {
                Ok(Ok(id)) => id,
                Ok(Err(e)) => {
                    clear(&router);
                    let _ = thread.join();
                    return Err(e);
                }
                Err(_) => {
                    clear(&router);
                    let _ = thread.join();
                    return Err(AutofireError::hotkey("hook thread exited during setup"));
                }
            };
            info!("keyboard hook installed");
            Ok(Self {
                router,
                thread_id,
                thread: Some(thread),
            })
        }

        fn router(&self) -> Result<MutexGuard<'_, HookRouter>> {
            self.router
                .lock()
                .map_err(|_| AutofireError::hotkey("hook router poisoned"))
        }
    }

    impl TriggerWatch for KeyboardHookWatch {
        fn watch(&mut self, key: &Key, on_down: EdgeCallback, on_up: EdgeCallback) -> Result<WatchHandle> {
            let handle = self.router()?.add_key(key, on_down, on_up);
            debug!(key = %key, handle = handle.0, "key hooked");
            Ok(handle)
        }

        fn watch_chord(&mut self, chord: &Chord, on_fire: EdgeCallback) -> Result<WatchHandle> {
            Ok(self.router()?.add_chord(chord, on_fire))
        }

        fn set_consuming(&mut self, handle: WatchHandle, consuming: bool) -> Result<()> {
            self.router()?.set_consuming(handle, consuming)
        }

        fn unwatch(&mut self, handle: WatchHandle) -> Result<()> {
            self.router()?.remove(handle)
        }
    }

    impl Drop for KeyboardHookWatch {
        fn drop(&mut self) {
            clear(&self.router);
            unsafe {
                PostThreadMessageW(self.thread_id, WM_QUIT, 0, 0);
            }
            if let Some(thread) = self.thread.take() {
                if thread.join().is_err() {
                    warn!("keyboard hook thread panicked");
                }
            }
            info!("keyboard hook removed");
        }
    }

    fn clear(router: &Arc<Mutex<HookRouter>>) {
        if let Ok(mut slot) = ACTIVE.lock() {
            if slot.as_ref().is_some_and(|r| Arc::ptr_eq(r, router)) {
                *slot = None;
            }
        }
    }

    fn run_hook(ready: mpsc::Sender<Result<DWORD>>) {
        unsafe {
            let thread_id = GetCurrentThreadId();
            let hook = SetWindowsHookExW(
                WH_KEYBOARD_LL,
                Some(hook_proc),
                GetModuleHandleW(ptr::null()),
                0,
            );
            if hook.is_null() {
                let err = std::io::Error::last_os_error();
                let _ = ready.send(Err(AutofireError::hotkey(format!(
                    "SetWindowsHookExW failed: {err}"
                ))));
                return;
            }

            // Create the message queue before the owner can post WM_QUIT.
            let mut msg: MSG = mem::zeroed();
            PeekMessageW(&mut msg, ptr::null_mut(), 0, 0, PM_NOREMOVE);
            let _ = ready.send(Ok(thread_id));

            while GetMessageW(&mut msg, ptr::null_mut(), 0, 0) > 0 {
                TranslateMessage(&msg);
                DispatchMessageW(&msg);
            }
            UnhookWindowsHookEx(hook);
        }
        debug!("hook thread exited");
    }

    unsafe extern "system" fn hook_proc(code: c_int, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
        if code == HC_ACTION {
            let event = &*(lparam as *const KBDLLHOOKSTRUCT);
            if event.dwExtraInfo != INJECTED_EXTRA_INFO {
                let down = matches!(wparam as UINT, WM_KEYDOWN | WM_SYSKEYDOWN);
                if route(event.vkCode as u16, down) == KeyAction::Block {
                    return 1;
                }
            }
        }
        CallNextHookEx(ptr::null_mut(), code, wparam, lparam)
    }

    fn route(vk: u16, down: bool) -> KeyAction {
        let router = match ACTIVE.lock() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        let Some(router) = router else {
            return KeyAction::Pass;
        };
        let dispatch = match router.lock() {
            Ok(mut router) => router.key_event(vk, down, &held_modifiers(), is_suppressed(vk)),
            Err(_) => return KeyAction::Pass,
        };
        for callback in dispatch.callbacks {
            callback();
        }
        dispatch.action
    }

    fn held_modifiers() -> Vec<Modifier> {
        let down = |vk: c_int| unsafe { GetAsyncKeyState(vk) } as u16 & 0x8000 != 0;
        let mut held = Vec::with_capacity(4);
        if down(VK_CONTROL) {
            held.push(Modifier::Ctrl);
        }
        if down(VK_MENU) {
            held.push(Modifier::Alt);
        }
        if down(VK_SHIFT) {
            held.push(Modifier::Shift);
        }
        if down(VK_LWIN) || down(VK_RWIN) {
            held.push(Modifier::Meta);
        }
        held
    }
}
