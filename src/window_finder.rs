//! Window lookup for slots that target a specific window.
//!
//! On Windows a slot's `window_title` is matched exactly against top-level
//! window titles. Elsewhere there is no portable title lookup, so the title
//! is matched against running process names and the pid stands in for the
//! window handle.

#[cfg(not(windows))]
use sysinfo::ProcessesToUpdate;
use sysinfo::System;

use crate::backend::WindowHandle;
use crate::error::Result;

/// Finds target windows by title.
///
/// # Example
///
/// ```no_run
/// use autofire::WindowFinder;
///
/// let mut finder = WindowFinder::new();
/// match finder.find_window("Notepad") {
///     Ok(Some(handle)) => println!("Found window {:?}", handle),
///     Ok(None) => println!("Window not found"),
///     Err(e) => eprintln!("Error: {}", e),
/// }
/// ```
pub struct WindowFinder {
    #[cfg_attr(windows, allow(dead_code))]
    system: System,
}

impl Clone for WindowFinder {
    fn clone(&self) -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for WindowFinder {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowFinder {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    #[cfg(windows)]
    pub fn find_window(&mut self, title: &str) -> Result<Option<WindowHandle>> {
        use std::ptr;
        use winapi::um::winuser::FindWindowW;

        let wide: Vec<u16> = title.encode_utf16().chain(std::iter::once(0)).collect();
        let hwnd = unsafe { FindWindowW(ptr::null(), wide.as_ptr()) };
        if hwnd.is_null() {
            Ok(None)
        } else {
            Ok(Some(WindowHandle(hwnd as usize as u64)))
        }
    }

    #[cfg(not(windows))]
    pub fn find_window(&mut self, title: &str) -> Result<Option<WindowHandle>> {
        self.system.refresh_processes(ProcessesToUpdate::All, true);

        let wanted = title.to_lowercase();
        for (pid, process) in self.system.processes() {
            // process.name() is an OsStr
            let name = process.name().to_string_lossy().to_lowercase();
            if name.contains(&wanted) {
                return Ok(Some(WindowHandle(pid.as_u32() as u64)));
            }
        }

        Ok(None)
    }
}
