//! System [`KeySender`] strategies.
//!
//! - [`HardwareSender`] injects events with `SendInput`, which reaches games
//!   that read raw input.
//! - [`MessageSender`] posts `WM_KEYDOWN`/`WM_KEYUP` to a window's queue, so
//!   it can target a background window.
//! - [`ScriptSender`] hands every call to an external helper executable.
//!
//! The first two are Windows-only; elsewhere constructing them fails with
//! [`AutofireError::UnsupportedPlatform`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::{LazyLock, Mutex};

use tracing::{debug, trace, warn};

use crate::backend::{KeySender, Target, WindowHandle};
use crate::error::{AutofireError, Result};
use crate::keys::Key;
use crate::window_finder::WindowFinder;

/// Process-wide suppression counts by virtual-key code. Slots sharing a
/// trigger each hold one count; the key stays suppressed until all are
/// released. On Windows the keyboard hook reads this table when deciding
/// whether a fresh press reaches other applications.
static SUPPRESSED: LazyLock<Mutex<HashMap<u16, usize>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn is_suppressed(code: u16) -> bool {
    SUPPRESSED
        .lock()
        .map(|table| table.contains_key(&code))
        .unwrap_or(false)
}

fn suppress_key(key: &Key) -> Result<()> {
    let mut table = SUPPRESSED
        .lock()
        .map_err(|_| AutofireError::emission(key.name(), "suppression table poisoned"))?;
    let count = table.entry(key.code()).or_default();
    *count += 1;
    debug!(key = %key, holders = *count, "key suppressed");
    Ok(())
}

fn release_key(key: &Key) -> Result<()> {
    let mut table = SUPPRESSED
        .lock()
        .map_err(|_| AutofireError::emission(key.name(), "suppression table poisoned"))?;
    match table.get_mut(&key.code()) {
        Some(count) if *count > 1 => *count -= 1,
        Some(_) => {
            table.remove(&key.code());
        }
        None => warn!(key = %key, "release without matching suppress"),
    }
    Ok(())
}

fn find_window_with(finder: &Mutex<WindowFinder>, title: &str) -> Result<Option<WindowHandle>> {
    let mut finder = finder
        .lock()
        .map_err(|_| AutofireError::emission(title, "window finder poisoned"))?;
    finder.find_window(title)
}

/// Sends keys through `SendInput`.
pub struct HardwareSender {
    finder: Mutex<WindowFinder>,
}

impl HardwareSender {
    pub fn new() -> Result<Self> {
        if cfg!(not(windows)) {
            return Err(AutofireError::unsupported_platform(
                "hardware input simulation requires Windows",
            ));
        }
        Ok(Self {
            finder: Mutex::new(WindowFinder::new()),
        })
    }
}

impl KeySender for HardwareSender {
    // SendInput always goes to the focused window; a window target only
    // gates emission on the window existing.
    fn send_key_down(&self, key: &Key, _target: Target) -> Result<()> {
        trace!(key = %key, "SendInput down");
        platform::send_input(key, false)
    }

    fn send_key_up(&self, key: &Key, _target: Target) -> Result<()> {
        trace!(key = %key, "SendInput up");
        platform::send_input(key, true)
    }

    fn find_window(&self, title: &str) -> Result<Option<WindowHandle>> {
        find_window_with(&self.finder, title)
    }

    fn suppress(&self, key: &Key) -> Result<()> {
        suppress_key(key)
    }

    fn release(&self, key: &Key) -> Result<()> {
        release_key(key)
    }
}

/// Sends keys by posting window messages.
pub struct MessageSender {
    finder: Mutex<WindowFinder>,
}

impl MessageSender {
    pub fn new() -> Result<Self> {
        if cfg!(not(windows)) {
            return Err(AutofireError::unsupported_platform(
                "message-queue simulation requires Windows",
            ));
        }
        Ok(Self {
            finder: Mutex::new(WindowFinder::new()),
        })
    }
}

impl KeySender for MessageSender {
    fn send_key_down(&self, key: &Key, target: Target) -> Result<()> {
        trace!(key = %key, ?target, "PostMessage down");
        platform::post_message(key, target, false)
    }

    fn send_key_up(&self, key: &Key, target: Target) -> Result<()> {
        trace!(key = %key, ?target, "PostMessage up");
        platform::post_message(key, target, true)
    }

    fn find_window(&self, title: &str) -> Result<Option<WindowHandle>> {
        find_window_with(&self.finder, title)
    }

    fn suppress(&self, key: &Key) -> Result<()> {
        suppress_key(key)
    }

    fn release(&self, key: &Key) -> Result<()> {
        release_key(key)
    }
}

/// Delegates to an external helper: `<helper> <action> <key> [<window>]`,
/// where action is one of `down`, `up`, `suppress`, `release`.
pub struct ScriptSender {
    helper: PathBuf,
    finder: Mutex<WindowFinder>,
}

impl ScriptSender {
    pub fn new(helper: PathBuf) -> Result<Self> {
        if !helper.is_file() {
            return Err(AutofireError::engine(format!(
                "helper script '{}' not found",
                helper.display()
            )));
        }
        Ok(Self {
            helper,
            finder: Mutex::new(WindowFinder::new()),
        })
    }

    fn run(&self, action: &str, key: &Key, target: Option<Target>) -> Result<()> {
        let mut command = Command::new(&self.helper);
        command.arg(action).arg(key.name());
        if let Some(Target::Window(handle)) = target {
            command.arg(handle.0.to_string());
        }
        let status = command
            .status()
            .map_err(|e| AutofireError::emission(key.name(), format!("helper failed: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(AutofireError::emission(
                key.name(),
                format!("helper exited with {status}"),
            ))
        }
    }
}

impl KeySender for ScriptSender {
    fn send_key_down(&self, key: &Key, target: Target) -> Result<()> {
        self.run("down", key, Some(target))
    }

    fn send_key_up(&self, key: &Key, target: Target) -> Result<()> {
        self.run("up", key, Some(target))
    }

    fn find_window(&self, title: &str) -> Result<Option<WindowHandle>> {
        find_window_with(&self.finder, title)
    }

    fn suppress(&self, key: &Key) -> Result<()> {
        self.run("suppress", key, None)
    }

    fn release(&self, key: &Key) -> Result<()> {
        self.run("release", key, None)
    }
}

#[cfg(windows)]
mod platform {
    use std::mem;

    use winapi::shared::minwindef::{LPARAM, WPARAM};
    use winapi::shared::windef::HWND;
    use winapi::um::winuser::{
        GetForegroundWindow, MapVirtualKeyW, PostMessageW, SendInput, INPUT, INPUT_KEYBOARD,
        KEYBDINPUT, KEYEVENTF_KEYUP, MAPVK_VK_TO_VSC, WM_KEYDOWN, WM_KEYUP,
    };

    use crate::backend::Target;
    use crate::error::{AutofireError, Result};
    use crate::keyboard_hook::INJECTED_EXTRA_INFO;
    use crate::keys::Key;

    pub fn send_input(key: &Key, key_up: bool) -> Result<()> {
        let scan = unsafe { MapVirtualKeyW(key.code() as u32, MAPVK_VK_TO_VSC) } as u16;
        let mut input: INPUT = unsafe { mem::zeroed() };
        input.type_ = INPUT_KEYBOARD;
        unsafe {
            *input.u.ki_mut() = KEYBDINPUT {
                wVk: key.code(),
                wScan: scan,
                dwFlags: if key_up { KEYEVENTF_KEYUP } else { 0 },
                time: 0,
                dwExtraInfo: INJECTED_EXTRA_INFO,
            };
        }
        let sent = unsafe { SendInput(1, &mut input, mem::size_of::<INPUT>() as i32) };
        if sent == 1 {
            Ok(())
        } else {
            Err(AutofireError::emission(key.name(), "SendInput rejected the event"))
        }
    }

    pub fn post_message(key: &Key, target: Target, key_up: bool) -> Result<()> {
        let hwnd: HWND = match target {
            Target::Window(handle) => handle.0 as usize as HWND,
            Target::Global => unsafe { GetForegroundWindow() },
        };
        if hwnd.is_null() {
            return Err(AutofireError::emission(key.name(), "no target window"));
        }

        let scan = unsafe { MapVirtualKeyW(key.code() as u32, MAPVK_VK_TO_VSC) } as isize;
        // lParam: repeat count 1, scan code in bits 16..24, and for key-up
        // the previous-state and transition bits.
        let mut lparam: isize = 1 | (scan << 16);
        if key_up {
            lparam |= (1 << 30) | (1 << 31);
        }
        let (msg, what) = if key_up {
            (WM_KEYUP, "WM_KEYUP")
        } else {
            (WM_KEYDOWN, "WM_KEYDOWN")
        };
        let ok = unsafe { PostMessageW(hwnd, msg, key.code() as WPARAM, lparam as LPARAM) };
        if ok != 0 {
            Ok(())
        } else {
            Err(AutofireError::emission(
                key.name(),
                format!("PostMessage {what} failed"),
            ))
        }
    }
}

#[cfg(not(windows))]
mod platform {
    use crate::backend::Target;
    use crate::error::{AutofireError, Result};
    use crate::keys::Key;

    pub fn send_input(key: &Key, _key_up: bool) -> Result<()> {
        Err(AutofireError::emission(
            key.name(),
            "SendInput is only available on Windows",
        ))
    }

    pub fn post_message(key: &Key, _target: Target, _key_up: bool) -> Result<()> {
        Err(AutofireError::emission(
            key.name(),
            "PostMessage is only available on Windows",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys;

    #[test]
    fn test_script_sender_requires_helper() {
        let err = ScriptSender::new(PathBuf::from("/nonexistent/autofire-helper")).err();
        assert!(matches!(err, Some(AutofireError::Engine(_))));
    }

    #[test]
    #[cfg(not(windows))]
    fn test_windows_senders_unsupported_elsewhere() {
        assert!(matches!(
            HardwareSender::new(),
            Err(AutofireError::UnsupportedPlatform(_))
        ));
        assert!(matches!(
            MessageSender::new(),
            Err(AutofireError::UnsupportedPlatform(_))
        ));
    }

    #[test]
    fn test_suppression_is_counted_per_holder() {
        // f9 is not used by any other test in this binary
        let key = keys::lookup("f9").unwrap();
        suppress_key(&key).unwrap();
        suppress_key(&key).unwrap();
        assert!(is_suppressed(key.code()));

        release_key(&key).unwrap();
        assert!(is_suppressed(key.code()));
        release_key(&key).unwrap();
        assert!(!is_suppressed(key.code()));

        // unmatched release is tolerated
        release_key(&key).unwrap();
        assert!(!is_suppressed(key.code()));
    }

    #[test]
    #[cfg(unix)]
    fn test_script_sender_runs_helper() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let helper = dir.path().join("helper.sh");
        std::fs::write(
            &helper,
            format!("#!/bin/sh\necho \"$@\" >> {}\n", log.display()),
        )
        .unwrap();
        std::fs::set_permissions(&helper, std::fs::Permissions::from_mode(0o755)).unwrap();

        let sender = ScriptSender::new(helper).unwrap();
        let key = keys::lookup("r").unwrap();
        sender.send_key_down(&key, Target::Global).unwrap();
        sender
            .send_key_up(&key, Target::Window(WindowHandle(42)))
            .unwrap();

        let calls = std::fs::read_to_string(log).unwrap();
        assert_eq!(calls, "down r\nup r 42\n");
    }
}
