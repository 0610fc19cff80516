/// `config.rs` — extension-wide settings
///
/// Persisted as a single JSON document (see `db::local::load_settings`).
/// `SharedSettings` is the read side handed to the script manager.
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::scripting::sandbox::TrustLevel;

pub const ENABLED_EXTENSION: &str = "enabled_extension";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionSettings {
    /// Master switch. When off no script may run.
    pub enabled_extension: bool,
    /// Libraries granted to newly created sandboxes.
    pub trust_level: TrustLevel,
    /// Number of toasts kept for the UI.
    pub notification_history: usize,
    /// Scope flags used until the store has persisted ones.
    pub global_scripts_enabled: bool,
    pub character_scripts_enabled: bool,
}

impl Default for ExtensionSettings {
    fn default() -> Self {
        Self {
            enabled_extension: true,
            trust_level: TrustLevel::Basic,
            notification_history: 200,
            global_scripts_enabled: true,
            character_scripts_enabled: false,
        }
    }
}

/// Read access to the extension settings by key.
pub trait SettingsSource: Send + Sync {
    fn setting_value(&self, key: &str) -> Option<serde_json::Value>;

    fn is_extension_enabled(&self) -> bool {
        self.setting_value(ENABLED_EXTENSION)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Shared handle held by `AppState`.
#[derive(Clone, Default)]
pub struct SharedSettings {
    inner: Arc<RwLock<ExtensionSettings>>,
}

impl SharedSettings {
    pub fn new(settings: ExtensionSettings) -> Self {
        Self { inner: Arc::new(RwLock::new(settings)) }
    }

    pub fn get(&self) -> ExtensionSettings {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut ExtensionSettings)) -> ExtensionSettings {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
        guard.clone()
    }

    pub fn set_extension_enabled(&self, enabled: bool) -> ExtensionSettings {
        self.update(|s| s.enabled_extension = enabled)
    }
}

impl SettingsSource for SharedSettings {
    fn setting_value(&self, key: &str) -> Option<serde_json::Value> {
        let settings = self.get();
        match serde_json::to_value(settings) {
            Ok(serde_json::Value::Object(mut map)) => map.remove(key),
            _ => None,
        }
    }
}

/// Return the platform-specific application data directory.
pub fn compute_app_data_dir() -> String {
    const IDENTIFIER: &str = "com.desizone.scriptrepository";

    #[cfg(target_os = "macos")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        format!("{home}/Library/Application Support/{IDENTIFIER}")
    }

    #[cfg(target_os = "windows")]
    {
        let appdata = std::env::var("APPDATA").unwrap_or_else(|_| ".".into());
        format!("{appdata}\\{IDENTIFIER}")
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        format!("{home}/.config/{IDENTIFIER}")
    }
}
