//! Slot configuration and the persisted JSON document.
//!
//! A document is either the current list shape (`{"slots": [...]}`) or the
//! legacy flat shape written by single-binding versions (`{"trigger_key":
//! ..., "output_key": ...}`). Both are normalized into [`AutofireConfig`]
//! before anything validates them.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AutofireError, Result};
use crate::keys::{self, Chord, Key, DEFAULT_EMERGENCY_CHORD};

/// Stable slot identifier, unique within a configuration.
pub type SlotId = u32;

pub const MIN_INTERVAL_MS: u32 = 1;
pub const MAX_INTERVAL_MS: u32 = 1000;
pub const DEFAULT_INTERVAL_MS: u32 = 50;

/// Which key-send strategy a slot uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendMethod {
    /// Hardware-level input simulation (`SendInput`).
    #[default]
    #[serde(alias = "sendinput")]
    Hardware,
    /// Posting key messages to the target window's queue.
    #[serde(alias = "postmessage")]
    MessageQueue,
    /// Delegating each emission to an external helper script.
    Script,
}

impl fmt::Display for SendMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SendMethod::Hardware => "hardware",
            SendMethod::MessageQueue => "message_queue",
            SendMethod::Script => "script",
        })
    }
}

/// One trigger→output binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    #[serde(default)]
    pub id: SlotId,
    pub trigger_key: String,
    pub output_key: String,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u32,
    #[serde(default)]
    pub pass_through: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_title: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub method: SendMethod,
}

fn default_interval_ms() -> u32 {
    DEFAULT_INTERVAL_MS
}

fn default_true() -> bool {
    true
}

fn default_emergency_hotkey() -> String {
    DEFAULT_EMERGENCY_CHORD.to_string()
}

fn default_trigger_key() -> String {
    "e".to_string()
}

fn default_output_key() -> String {
    "r".to_string()
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            id: 1,
            trigger_key: default_trigger_key(),
            output_key: default_output_key(),
            interval_ms: DEFAULT_INTERVAL_MS,
            pass_through: false,
            window_title: None,
            enabled: true,
            method: SendMethod::default(),
        }
    }
}

impl Slot {
    pub fn new(id: SlotId, trigger_key: impl Into<String>, output_key: impl Into<String>) -> Self {
        Self {
            id,
            trigger_key: trigger_key.into(),
            output_key: output_key.into(),
            ..Self::default()
        }
    }

    pub fn with_interval(mut self, interval_ms: u32) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    pub fn with_pass_through(mut self, pass_through: bool) -> Self {
        self.pass_through = pass_through;
        self
    }

    pub fn with_window(mut self, title: impl Into<String>) -> Self {
        self.window_title = Some(title.into());
        self
    }

    pub fn with_method(mut self, method: SendMethod) -> Self {
        self.method = method;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn trigger(&self) -> Result<Key> {
        keys::lookup(&self.trigger_key)
            .map_err(|e| AutofireError::config(self.id, "trigger_key", e.to_string()))
    }

    pub fn output(&self) -> Result<Key> {
        keys::lookup(&self.output_key)
            .map_err(|e| AutofireError::config(self.id, "output_key", e.to_string()))
    }

    /// Check every field, reporting the first offending one.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&self.interval_ms) {
            return Err(AutofireError::config(
                self.id,
                "interval_ms",
                format!(
                    "{} is outside {MIN_INTERVAL_MS}..={MAX_INTERVAL_MS}",
                    self.interval_ms
                ),
            ));
        }
        if self.trigger()?.is_modifier() {
            return Err(AutofireError::config(
                self.id,
                "trigger_key",
                "modifier keys cannot be triggers",
            ));
        }
        self.output()?;
        if let Some(title) = &self.window_title {
            if title.trim().is_empty() {
                return Err(AutofireError::config(
                    self.id,
                    "window_title",
                    "must not be empty when set",
                ));
            }
        }
        Ok(())
    }

    /// One-line description, e.g. `E->R @50ms (global) [hardware]`.
    pub fn summary(&self) -> String {
        let target = match &self.window_title {
            Some(title) => format!("-> '{title}'"),
            None => "(global)".to_string(),
        };
        format!(
            "{}->{} @{}ms {} [{}]",
            self.trigger_key.to_uppercase(),
            self.output_key.to_uppercase(),
            self.interval_ms,
            target,
            self.method
        )
    }
}

/// Validate a slot set the way the engine accepts it: every enabled slot
/// must be valid and ids must be unique across the whole set.
pub fn validate_slots(slots: &[Slot]) -> Result<()> {
    let mut seen = HashSet::new();
    for slot in slots {
        if !seen.insert(slot.id) {
            return Err(AutofireError::config(slot.id, "id", "duplicate slot id"));
        }
        if slot.enabled {
            slot.validate()?;
        }
    }
    Ok(())
}

/// The persisted configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutofireConfig {
    pub slots: Vec<Slot>,
    #[serde(default = "default_emergency_hotkey")]
    pub emergency_hotkey: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helper_script: Option<PathBuf>,
}

impl Default for AutofireConfig {
    fn default() -> Self {
        Self {
            slots: vec![Slot::default()],
            emergency_hotkey: default_emergency_hotkey(),
            helper_script: None,
        }
    }
}

/// Flat single-binding document from older releases.
#[derive(Debug, Deserialize)]
struct LegacyDocument {
    #[serde(alias = "triggerKey")]
    trigger_key: String,
    #[serde(default = "default_output_key", alias = "outputKey")]
    output_key: String,
    #[serde(default = "default_interval_ms", alias = "intervalMs")]
    interval_ms: u32,
    #[serde(default, alias = "passThrough")]
    pass_through: bool,
    #[serde(default)]
    window_title: Option<String>,
    #[serde(default)]
    use_sendinput: Option<bool>,
    #[serde(default)]
    method: Option<SendMethod>,
}

impl From<LegacyDocument> for AutofireConfig {
    fn from(legacy: LegacyDocument) -> Self {
        let method = legacy.method.unwrap_or(match legacy.use_sendinput {
            Some(false) => SendMethod::MessageQueue,
            _ => SendMethod::Hardware,
        });
        let slot = Slot {
            id: 1,
            trigger_key: legacy.trigger_key,
            output_key: legacy.output_key,
            interval_ms: legacy.interval_ms,
            pass_through: legacy.pass_through,
            window_title: legacy.window_title,
            enabled: true,
            method,
        };
        Self {
            slots: vec![slot],
            ..Self::default()
        }
    }
}

impl AutofireConfig {
    /// Parse either document shape and normalize it. The list shape is
    /// recognized by its `slots` field; anything else must be a legacy
    /// flat document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let document: serde_json::Value = serde_json::from_str(json)?;
        let mut config = if document.get("slots").is_some() {
            serde_json::from_value::<AutofireConfig>(document)?
        } else {
            let legacy: LegacyDocument = serde_json::from_value(document)?;
            tracing::info!("upgrading legacy single-slot config");
            legacy.into()
        };
        config.normalize();
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| AutofireError::config_load(path.display().to_string(), e.to_string()))?;
        Self::from_json_str(&contents)
            .map_err(|e| AutofireError::config_load(path.display().to_string(), e.to_string()))
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        fs::write(path, json)
            .map_err(|e| AutofireError::config_save(path.display().to_string(), e.to_string()))
    }

    /// Fill unassigned ids, drop blank window titles, and substitute the
    /// default slot for an empty list.
    pub fn normalize(&mut self) {
        if self.slots.is_empty() {
            self.slots.push(Slot::default());
        }
        let mut next = self.slots.iter().map(|s| s.id).max().unwrap_or(0);
        for slot in &mut self.slots {
            if slot.id == 0 {
                next += 1;
                slot.id = next;
            }
            if slot
                .window_title
                .as_deref()
                .is_some_and(|t| t.trim().is_empty())
            {
                slot.window_title = None;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_slots(&self.slots)?;
        self.emergency_chord()?;
        Ok(())
    }

    pub fn emergency_chord(&self) -> Result<Chord> {
        self.emergency_hotkey.parse()
    }

    pub fn enabled_count(&self) -> usize {
        self.slots.iter().filter(|s| s.enabled).count()
    }

    /// e.g. `AutoFire: 1/2 slots enabled`.
    pub fn summary(&self) -> String {
        format!(
            "AutoFire: {}/{} slots enabled",
            self.enabled_count(),
            self.slots.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_validation_fields() {
        assert!(Slot::default().validate().is_ok());

        let err = Slot::default().with_interval(0).validate().unwrap_err();
        assert!(matches!(
            err,
            AutofireError::Config {
                field: "interval_ms",
                ..
            }
        ));

        let err = Slot::default().with_interval(1001).validate().unwrap_err();
        assert!(matches!(
            err,
            AutofireError::Config {
                field: "interval_ms",
                ..
            }
        ));

        let err = Slot::new(4, "nope", "r").validate().unwrap_err();
        assert!(matches!(
            err,
            AutofireError::Config {
                slot: 4,
                field: "trigger_key",
                ..
            }
        ));

        let err = Slot::new(1, "e", "").validate().unwrap_err();
        assert!(matches!(
            err,
            AutofireError::Config {
                field: "output_key",
                ..
            }
        ));

        let err = Slot::default().with_window(" ").validate().unwrap_err();
        assert!(matches!(
            err,
            AutofireError::Config {
                field: "window_title",
                ..
            }
        ));
    }

    #[test]
    fn test_modifier_trigger_is_rejected() {
        for trigger in ["shift", "Ctrl", "control", "alt", "meta"] {
            let err = Slot::new(3, trigger, "r").validate().unwrap_err();
            assert!(
                matches!(
                    err,
                    AutofireError::Config {
                        slot: 3,
                        field: "trigger_key",
                        ..
                    }
                ),
                "{trigger}: {err}"
            );
        }
        // Modifiers are still fine as output
        assert!(Slot::new(1, "e", "shift").validate().is_ok());
    }

    #[test]
    fn test_interval_bounds_are_inclusive() {
        assert!(Slot::default().with_interval(1).validate().is_ok());
        assert!(Slot::default().with_interval(1000).validate().is_ok());
    }

    #[test]
    fn test_validate_slots_ignores_disabled_drafts() {
        let slots = vec![
            Slot::new(1, "e", "r"),
            Slot::new(2, "bogus", "r").disabled(),
        ];
        assert!(validate_slots(&slots).is_ok());
    }

    #[test]
    fn test_validate_slots_rejects_duplicate_ids() {
        let slots = vec![Slot::new(1, "e", "r"), Slot::new(1, "q", "w")];
        assert!(matches!(
            validate_slots(&slots),
            Err(AutofireError::Config { field: "id", .. })
        ));
    }

    #[test]
    fn test_normalize_assigns_ids_and_clears_blank_titles() {
        let mut config = AutofireConfig {
            slots: vec![
                Slot::new(0, "e", "r").with_window(""),
                Slot::new(5, "q", "w"),
                Slot::new(0, "a", "s"),
            ],
            ..AutofireConfig::default()
        };
        config.normalize();
        let ids: Vec<_> = config.slots.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![6, 5, 7]);
        assert_eq!(config.slots[0].window_title, None);
    }

    #[test]
    fn test_summaries() {
        let slot = Slot::new(1, "e", "r").with_window("Game").with_method(SendMethod::MessageQueue);
        assert_eq!(slot.summary(), "E->R @50ms -> 'Game' [message_queue]");
        assert_eq!(Slot::default().summary(), "E->R @50ms (global) [hardware]");

        let config = AutofireConfig {
            slots: vec![Slot::new(1, "e", "r"), Slot::new(2, "q", "w").disabled()],
            ..AutofireConfig::default()
        };
        assert_eq!(config.summary(), "AutoFire: 1/2 slots enabled");
    }
}
