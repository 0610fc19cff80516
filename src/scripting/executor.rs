/// `scripting/executor.rs` — start and stop individual sandbox instances
///
/// Keeps the "at most one live instance per script id" rule: any existing
/// instance is destroyed, and its teardown awaited, before a new one is
/// created. Run and stop for the same id are serialised.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use super::{
    notify::Notifier,
    sandbox::{SandboxHost, SandboxPayload},
    types::{Script, ScriptType},
};
use crate::error::SandboxError;

pub struct ScriptExecutor {
    host: Arc<dyn SandboxHost>,
    notifier: Arc<dyn Notifier>,
    /// Per-script-id gates, created on first use
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ScriptExecutor {
    pub fn new(host: Arc<dyn SandboxHost>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            host,
            notifier,
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_running(&self, script_id: &str) -> bool {
        self.host.find_by_key(script_id).is_some()
    }

    /// (Re)create the instance for `script`.
    pub async fn run_script(&self, script: &Script, scope: ScriptType) -> Result<(), SandboxError> {
        let gate = self.gate(&script.id);
        let _guard = gate.lock().await;

        let result = async {
            if let Some(existing) = self.host.find_by_key(&script.id) {
                self.host.destroy(existing).await?;
            }
            self.host.create(&script.id, render_payload(script)).await
        }
        .await;

        match result {
            Ok(_) => {
                log::info!("[script] {} script [\"{}\"] activated", scope, script.name);
                Ok(())
            }
            Err(e) => {
                log::error!("[script] {} script [\"{}\"] failed to activate: {}", scope, script.name, e);
                self.notifier
                    .error(&format!("Failed to activate {} script \"{}\"", scope, script.name));
                Err(e)
            }
        }
    }

    /// Destroy the instance for `script` if there is one.
    /// Returns whether an instance was found.
    pub async fn stop_script(&self, script: &Script, scope: ScriptType) -> Result<bool, SandboxError> {
        let gate = self.gate(&script.id);
        let _guard = gate.lock().await;

        let Some(handle) = self.host.find_by_key(&script.id) else {
            return Ok(false);
        };
        match self.host.destroy(handle).await {
            Ok(()) => {
                log::info!("[script] {} script [\"{}\"] deactivated", scope, script.name);
                Ok(true)
            }
            Err(e) => {
                log::error!("[script] {} script [\"{}\"] failed to stop: {}", scope, script.name, e);
                self.notifier
                    .error(&format!("Failed to stop {} script \"{}\"", scope, script.name));
                Err(e)
            }
        }
    }

    /// Destroy every live instance. Keeps going past failures and returns
    /// how many instances were torn down cleanly.
    pub async fn clear_all(&self) -> usize {
        let mut cleared = 0;
        for handle in self.host.handles() {
            let key = handle.key.clone();
            let gate = self.gate(&key);
            let _guard = gate.lock().await;
            match self.host.destroy(handle).await {
                Ok(()) => cleared += 1,
                Err(e) => log::warn!("[script] teardown of '{}' failed: {}", key, e),
            }
        }
        self.prune_gates();
        cleared
    }

    /// Drop host-side state for a script that no longer exists.
    pub fn forget(&self, script_id: &str) {
        self.host.forget(script_id);
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        if gates.get(script_id).is_some_and(|g| Arc::strong_count(g) == 1) {
            gates.remove(script_id);
        }
    }

    /// Remove gates nobody is holding or waiting on.
    fn prune_gates(&self) {
        self.gates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, gate| Arc::strong_count(gate) > 1);
    }

    fn gate(&self, script_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(gates.entry(script_id.to_string()).or_default())
    }
}

/// Build what the sandbox boots for `script`.
pub fn render_payload(script: &Script) -> SandboxPayload {
    SandboxPayload {
        script_id: script.id.clone(),
        script_name: script.name.clone(),
        chunk_name: format!("script:{}", script.name),
        buttons: script
            .buttons
            .iter()
            .filter(|b| b.visible)
            .map(|b| b.name.clone())
            .collect(),
        source: script.content.clone(),
    }
}
