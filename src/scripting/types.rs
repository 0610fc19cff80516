/// `scripting/types.rs` — script entity and scope
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScriptError};

// ── Scope ─────────────────────────────────────────────────────────────────────

/// Which collection a script lives in. Each scope has its own enabled flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptType {
    Global,
    Character,
}

impl ScriptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptType::Global => "global",
            ScriptType::Character => "character",
        }
    }

    /// The scope a script lands in when moved.
    pub fn other(self) -> Self {
        match self {
            ScriptType::Global => ScriptType::Character,
            ScriptType::Character => ScriptType::Global,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "global" => Some(ScriptType::Global),
            "character" => Some(ScriptType::Character),
            _ => None,
        }
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Script record ─────────────────────────────────────────────────────────────

/// UI affordance attached to a running script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptButton {
    pub name: String,
    #[serde(default = "default_true")]
    pub visible: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    #[serde(default = "new_script_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub content: String,
    /// Free-form author notes shown next to the script.
    #[serde(default)]
    pub info: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub buttons: Vec<ScriptButton>,
}

impl Script {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: new_script_id(),
            name: name.into(),
            content: content.into(),
            info: String::new(),
            enabled: false,
            buttons: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_button(mut self, name: impl Into<String>) -> Self {
        self.buttons.push(ScriptButton { name: name.into(), visible: true });
        self
    }

    pub fn has_buttons(&self) -> bool {
        !self.buttons.is_empty()
    }

    /// Parse an exported script file. `name` and `content` must be non-empty;
    /// the result is always disabled and gets a fresh id when none is given.
    pub fn from_import(text: &str) -> Result<Self> {
        let mut script: Script = serde_json::from_str(text)
            .map_err(|e| ScriptError::validation(format!("not a script file: {e}")))?;
        if script.name.trim().is_empty() {
            return Err(ScriptError::validation("missing script name"));
        }
        if script.content.trim().is_empty() {
            return Err(ScriptError::validation("missing script content"));
        }
        if script.id.trim().is_empty() {
            script.id = new_script_id();
        }
        script.enabled = false;
        Ok(script)
    }
}

/// Mint a fresh opaque script id.
pub fn new_script_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_true() -> bool {
    true
}
