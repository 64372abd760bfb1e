//! Boot command parsing.
//!
//! A boot command is typed into the VM console right after power on. It is
//! plain text with special keys in angle brackets:
//!
//! - `<enter>`, `<tab>`, `<esc>`, `<bs>`, `<del>`, arrows, `<f1>` to `<f12>`
//! - `<leftCtrlOn>` / `<leftCtrlOff>` (and the other modifiers) hold a
//!   modifier across the following keys
//! - `<wait>` (one second), `<wait5>` (seconds) or `<wait1m30s>`
//!
//! Templates `{{ .HTTPIP }}`, `{{ .HTTPPort }}` and `{{ .Name }}` are
//! expanded by [`render`] before parsing. A `<` that does not start a known
//! key is typed literally.

mod keymap;

pub use keymap::{char_usage, special_usage};

use crate::driver::{KeyModifiers, UsbScanCode};
use crate::utils::parse_duration;
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Keys sent in one remote call at most.
pub const MAX_KEYS_PER_BATCH: usize = 32;

/// A boot command that cannot be typed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BootCommandError {
    /// A character with no key on the US layout.
    #[error("character {0:?} cannot be typed")]
    UnsupportedCharacter(char),
    /// A `<wait...>` with an unreadable duration.
    #[error("invalid wait '{0}'")]
    InvalidWait(String),
    /// A modifier released without being held.
    #[error("<{0}Off> without a matching <{0}On>")]
    UnbalancedModifier(String),
    /// A template variable that does not exist.
    #[error("unknown template variable '.{0}'")]
    UnknownVariable(String),
    /// A template variable with no value for this build.
    #[error("template variable '.{0}' has no value")]
    MissingValue(String),
}

/// One thing to do while typing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootAction {
    /// Press and release a key.
    Press(UsbScanCode),
    /// Pause.
    Wait(Duration),
}

/// Values for boot command templates.
#[derive(Debug, Clone, Default)]
pub struct BootVars {
    /// Address of the boot-time HTTP server.
    pub http_ip: Option<String>,
    /// Port of the boot-time HTTP server.
    pub http_port: Option<u16>,
    /// VM name.
    pub name: String,
}

#[allow(clippy::unwrap_used)]
fn template_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*\.(\w+)\s*\}\}").unwrap())
}

/// Expands template variables.
pub fn render(template: &str, vars: &BootVars) -> Result<String, BootCommandError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in template_regex().captures_iter(template) {
        let (Some(whole), Some(var)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&template[last..whole.start()]);
        let value = match var.as_str() {
            "HTTPIP" => vars
                .http_ip
                .clone()
                .ok_or_else(|| BootCommandError::MissingValue("HTTPIP".into()))?,
            "HTTPPort" => vars
                .http_port
                .map(|p| p.to_string())
                .ok_or_else(|| BootCommandError::MissingValue("HTTPPort".into()))?,
            "Name" => vars.name.clone(),
            other => return Err(BootCommandError::UnknownVariable(other.to_string())),
        };
        out.push_str(&value);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Parses a rendered boot command into key presses and waits.
pub fn parse(command: &str) -> Result<Vec<BootAction>, BootCommandError> {
    let mut actions = Vec::with_capacity(command.len());
    let mut held = KeyModifiers::default();
    let mut rest = command;

    while let Some(c) = rest.chars().next() {
        if c == '<' {
            if let Some(end) = rest.find('>') {
                let token = &rest[1..end];
                if let Some(action) = special(token, &mut held)? {
                    if let Some(action) = action {
                        actions.push(action);
                    }
                    rest = &rest[end + 1..];
                    continue;
                }
            }
        }

        let (usage, shift) = char_usage(c).ok_or(BootCommandError::UnsupportedCharacter(c))?;
        let mut modifiers = held;
        modifiers.left_shift |= shift;
        actions.push(BootAction::Press(UsbScanCode { usage, modifiers }));
        rest = &rest[c.len_utf8()..];
    }

    Ok(actions)
}

/// Interprets an angle-bracket token.
///
/// Returns `Ok(None)` when the token is not special, `Ok(Some(None))` for a
/// modifier toggle and `Ok(Some(Some(action)))` otherwise.
fn special(
    token: &str,
    held: &mut KeyModifiers,
) -> Result<Option<Option<BootAction>>, BootCommandError> {
    if let Some(spec) = token.strip_prefix("wait") {
        let duration = if spec.is_empty() {
            Duration::from_secs(1)
        } else if let Ok(secs) = spec.parse::<u64>() {
            Duration::from_secs(secs)
        } else {
            parse_duration(spec).map_err(|_| BootCommandError::InvalidWait(token.to_string()))?
        };
        return Ok(Some(Some(BootAction::Wait(duration))));
    }

    for (suffix, on) in [("On", true), ("Off", false)] {
        if let Some(name) = token.strip_suffix(suffix) {
            if let Some(flag) = modifier_flag(held, name) {
                if !on && !*flag {
                    return Err(BootCommandError::UnbalancedModifier(name.to_string()));
                }
                *flag = on;
                return Ok(Some(None));
            }
        }
    }

    Ok(special_usage(token).map(|usage| {
        Some(BootAction::Press(UsbScanCode {
            usage,
            modifiers: *held,
        }))
    }))
}

fn modifier_flag<'a>(held: &'a mut KeyModifiers, name: &str) -> Option<&'a mut bool> {
    let flag = match name.to_ascii_lowercase().as_str() {
        "leftctrl" => &mut held.left_control,
        "leftshift" => &mut held.left_shift,
        "leftalt" => &mut held.left_alt,
        "leftsuper" => &mut held.left_gui,
        "rightctrl" => &mut held.right_control,
        "rightshift" => &mut held.right_shift,
        "rightalt" => &mut held.right_alt,
        "rightsuper" => &mut held.right_gui,
        _ => return None,
    };
    Some(flag)
}

/// A unit of work for the boot command step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootBatch {
    /// Keys sent in one call.
    Keys(Vec<UsbScanCode>),
    /// Pause.
    Wait(Duration),
}

/// Groups consecutive key presses into batches of at most `max_keys`.
#[must_use]
pub fn batches(actions: &[BootAction], max_keys: usize) -> Vec<BootBatch> {
    let max_keys = max_keys.max(1);
    let mut out = Vec::new();
    let mut keys = Vec::new();
    for action in actions {
        match action {
            BootAction::Press(code) => {
                keys.push(*code);
                if keys.len() == max_keys {
                    out.push(BootBatch::Keys(std::mem::take(&mut keys)));
                }
            }
            BootAction::Wait(duration) => {
                if !keys.is_empty() {
                    out.push(BootBatch::Keys(std::mem::take(&mut keys)));
                }
                out.push(BootBatch::Wait(*duration));
            }
        }
    }
    if !keys.is_empty() {
        out.push(BootBatch::Keys(keys));
    }
    out
}
