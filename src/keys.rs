//! Key-name lookup and chord parsing.
//!
//! Every key the engine knows about lives in one fixed table mapping a
//! canonical lowercase name to its Windows virtual-key code. Names are
//! matched case-insensitively and a handful of aliases (`esc`, `return`,
//! `arrowup`, ...) fold onto their canonical entry. Unknown names are
//! configuration errors, never runtime failures.

use std::fmt;
use std::str::FromStr;

use crate::error::{AutofireError, Result};

/// Default emergency-stop chord.
pub const DEFAULT_EMERGENCY_CHORD: &str = "ctrl+alt+escape";

/// A resolved key: canonical name plus platform virtual-key code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    name: &'static str,
    code: u16,
}

impl Key {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Windows virtual-key code.
    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn is_modifier(&self) -> bool {
        matches!(self.name, "shift" | "ctrl" | "alt" | "meta")
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl FromStr for Key {
    type Err = AutofireError;

    fn from_str(s: &str) -> Result<Self> {
        lookup(s)
    }
}

const KEY_TABLE: &[(&str, u16)] = &[
    // Letters
    ("a", 0x41),
    ("b", 0x42),
    ("c", 0x43),
    ("d", 0x44),
    ("e", 0x45),
    ("f", 0x46),
    ("g", 0x47),
    ("h", 0x48),
    ("i", 0x49),
    ("j", 0x4A),
    ("k", 0x4B),
    ("l", 0x4C),
    ("m", 0x4D),
    ("n", 0x4E),
    ("o", 0x4F),
    ("p", 0x50),
    ("q", 0x51),
    ("r", 0x52),
    ("s", 0x53),
    ("t", 0x54),
    ("u", 0x55),
    ("v", 0x56),
    ("w", 0x57),
    ("x", 0x58),
    ("y", 0x59),
    ("z", 0x5A),
    // Digits
    ("0", 0x30),
    ("1", 0x31),
    ("2", 0x32),
    ("3", 0x33),
    ("4", 0x34),
    ("5", 0x35),
    ("6", 0x36),
    ("7", 0x37),
    ("8", 0x38),
    ("9", 0x39),
    // Function keys
    ("f1", 0x70),
    ("f2", 0x71),
    ("f3", 0x72),
    ("f4", 0x73),
    ("f5", 0x74),
    ("f6", 0x75),
    ("f7", 0x76),
    ("f8", 0x77),
    ("f9", 0x78),
    ("f10", 0x79),
    ("f11", 0x7A),
    ("f12", 0x7B),
    // Editing and navigation
    ("space", 0x20),
    ("enter", 0x0D),
    ("tab", 0x09),
    ("escape", 0x1B),
    ("backspace", 0x08),
    ("delete", 0x2E),
    ("insert", 0x2D),
    ("home", 0x24),
    ("end", 0x23),
    ("pageup", 0x21),
    ("pagedown", 0x22),
    ("up", 0x26),
    ("down", 0x28),
    ("left", 0x25),
    ("right", 0x27),
    ("capslock", 0x14),
    // Modifiers
    ("shift", 0x10),
    ("ctrl", 0x11),
    ("alt", 0x12),
    ("meta", 0x5B),
    // Numpad
    ("numpad0", 0x60),
    ("numpad1", 0x61),
    ("numpad2", 0x62),
    ("numpad3", 0x63),
    ("numpad4", 0x64),
    ("numpad5", 0x65),
    ("numpad6", 0x66),
    ("numpad7", 0x67),
    ("numpad8", 0x68),
    ("numpad9", 0x69),
    // Punctuation (US layout)
    ("minus", 0xBD),
    ("equal", 0xBB),
    ("comma", 0xBC),
    ("period", 0xBE),
    ("slash", 0xBF),
    ("semicolon", 0xBA),
    ("quote", 0xDE),
    ("backquote", 0xC0),
    ("bracketleft", 0xDB),
    ("backslash", 0xDC),
    ("bracketright", 0xDD),
];

fn canonical(name: &str) -> &str {
    match name {
        "esc" => "escape",
        "return" => "enter",
        "del" => "delete",
        "ins" => "insert",
        "pgup" => "pageup",
        "pgdn" => "pagedown",
        "arrowup" => "up",
        "arrowdown" => "down",
        "arrowleft" => "left",
        "arrowright" => "right",
        "control" => "ctrl",
        "cmd" | "super" | "win" => "meta",
        "-" => "minus",
        "=" => "equal",
        "," => "comma",
        "." => "period",
        "/" => "slash",
        ";" => "semicolon",
        "'" => "quote",
        "`" => "backquote",
        "[" => "bracketleft",
        "\\" => "backslash",
        "]" => "bracketright",
        other => other,
    }
}

/// Resolve a key name (case-insensitive, aliases allowed).
pub fn lookup(name: &str) -> Result<Key> {
    let lowered = name.trim().to_lowercase();
    if lowered.is_empty() {
        return Err(AutofireError::invalid_key(name, "key name cannot be empty"));
    }
    let wanted = canonical(&lowered);
    KEY_TABLE
        .iter()
        .find(|(n, _)| *n == wanted)
        .map(|&(name, code)| Key { name, code })
        .ok_or_else(|| AutofireError::invalid_key(name, "unknown key"))
}

/// Canonical names of every supported key, in table order.
pub fn supported_keys() -> impl Iterator<Item = &'static str> {
    KEY_TABLE.iter().map(|(name, _)| *name)
}

/// Modifier held as part of a chord.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Modifier {
    Ctrl,
    Alt,
    Shift,
    Meta,
}

/// A key pressed together with zero or more modifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chord {
    pub modifiers: Vec<Modifier>,
    pub key: Key,
}

impl Chord {
    pub fn has(&self, modifier: Modifier) -> bool {
        self.modifiers.contains(&modifier)
    }
}

impl Default for Chord {
    fn default() -> Self {
        // The default literal is covered by tests.
        DEFAULT_EMERGENCY_CHORD
            .parse()
            .unwrap_or_else(|_| Chord {
                modifiers: vec![Modifier::Ctrl, Modifier::Alt],
                key: Key {
                    name: "escape",
                    code: 0x1B,
                },
            })
    }
}

impl FromStr for Chord {
    type Err = AutofireError;

    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.to_lowercase();
        let parts: Vec<&str> = lowered.split('+').map(|p| p.trim()).collect();
        if parts.iter().all(|p| p.is_empty()) {
            return Err(AutofireError::invalid_key_combination(s, "empty hotkey"));
        }

        let mut modifiers = Vec::new();
        let mut key = None;
        for part in &parts {
            let modifier = match canonical(part) {
                "ctrl" => Some(Modifier::Ctrl),
                "alt" => Some(Modifier::Alt),
                "shift" => Some(Modifier::Shift),
                "meta" => Some(Modifier::Meta),
                _ => None,
            };
            match modifier {
                Some(m) if !modifiers.contains(&m) => modifiers.push(m),
                Some(_) => {
                    return Err(AutofireError::invalid_key_combination(
                        s,
                        format!("modifier '{part}' repeated"),
                    ))
                }
                None => {
                    if key.is_some() {
                        return Err(AutofireError::invalid_key_combination(
                            s,
                            "multiple keys specified",
                        ));
                    }
                    key = Some(lookup(part).map_err(|e| {
                        AutofireError::invalid_key_combination(s, e.to_string())
                    })?);
                }
            }
        }

        let key =
            key.ok_or_else(|| AutofireError::invalid_key_combination(s, "no key specified"))?;
        modifiers.sort();
        Ok(Chord { modifiers, key })
    }
}

impl fmt::Display for Chord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for m in &self.modifiers {
            let name = match m {
                Modifier::Ctrl => "ctrl",
                Modifier::Alt => "alt",
                Modifier::Shift => "shift",
                Modifier::Meta => "meta",
            };
            write!(f, "{name}+")?;
        }
        f.write_str(self.key.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert_eq!(lookup("E").unwrap(), lookup("e").unwrap());
        assert_eq!(lookup(" Space ").unwrap().name(), "space");
        assert_eq!(lookup("F12").unwrap().code(), 0x7B);
    }

    #[test]
    fn test_lookup_aliases() {
        assert_eq!(lookup("esc").unwrap().name(), "escape");
        assert_eq!(lookup("Return").unwrap().name(), "enter");
        assert_eq!(lookup("arrowLeft").unwrap().name(), "left");
    }

    #[test]
    fn test_lookup_rejects_unknown_and_empty() {
        assert!(matches!(
            lookup("hyper"),
            Err(AutofireError::InvalidKey { .. })
        ));
        assert!(lookup("").is_err());
        assert!(lookup("   ").is_err());
    }

    #[test]
    fn test_every_table_entry_resolves() {
        for name in supported_keys() {
            assert_eq!(lookup(name).unwrap().name(), name);
        }
    }

    #[test]
    fn test_chord_parse() {
        let chord: Chord = "Ctrl+Alt+Esc".parse().unwrap();
        assert_eq!(chord.key.name(), "escape");
        assert!(chord.has(Modifier::Ctrl));
        assert!(chord.has(Modifier::Alt));
        assert!(!chord.has(Modifier::Shift));
        assert_eq!(chord.to_string(), "ctrl+alt+escape");
    }

    #[test]
    fn test_chord_rejects_bad_input() {
        assert!("".parse::<Chord>().is_err());
        assert!("ctrl+alt".parse::<Chord>().is_err());
        assert!("ctrl+a+b".parse::<Chord>().is_err());
        assert!("ctrl+ctrl+a".parse::<Chord>().is_err());
        assert!("ctrl+nope".parse::<Chord>().is_err());
    }

    #[test]
    fn test_default_chord() {
        assert_eq!(Chord::default().to_string(), DEFAULT_EMERGENCY_CHORD);
    }
}
