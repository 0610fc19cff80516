use std::sync::{Arc, Mutex};

use sqlx::SqlitePool;
use tokio::sync::mpsc;

use crate::{
    config::{ExtensionSettings, SharedSettings},
    db,
    error::{Result, StoreError},
    scripting::{
        conflict::{ChannelPrompt, PromptRequest, PromptResolver},
        events::EventBus,
        manager::ScriptManager,
        notify::Notifications,
        sandbox::{LuaSandboxHost, TrustLevel},
        store::ScriptData,
    },
};

/// Conflict questions that may queue up before the UI drains them.
const PROMPT_BUFFER: usize = 8;

/// Application state, constructed once at startup and handed to whoever
/// drives the UI. Nothing here is global.
pub struct AppState {
    pub local_db: Option<SqlitePool>,
    pub settings: SharedSettings,
    pub bus: EventBus,
    pub store: Arc<ScriptData>,
    pub sandbox: Arc<LuaSandboxHost>,
    pub notifications: Arc<Notifications>,
    pub manager: Arc<ScriptManager>,
    /// Receiving end of the conflict prompt, taken once by the UI.
    prompt_requests: Mutex<Option<mpsc::Receiver<PromptRequest>>>,
}

impl AppState {
    pub fn new(settings: ExtensionSettings, store: ScriptData) -> Self {
        let bus = EventBus::new();
        let store = Arc::new(store);
        let sandbox = Arc::new(LuaSandboxHost::new(settings.trust_level));
        let notifications = Arc::new(Notifications::new(settings.notification_history));
        let settings = SharedSettings::new(settings);
        let (prompt, prompt_requests) = ChannelPrompt::new(PROMPT_BUFFER);

        let manager = Arc::new(ScriptManager::new(
            store.clone(),
            sandbox.clone(),
            Arc::new(settings.clone()),
            Arc::new(PromptResolver::new(prompt)),
            notifications.clone(),
            bus.clone(),
        ));
        manager.attach();

        Self {
            local_db: None,
            settings,
            bus,
            store,
            sandbox,
            notifications,
            manager,
            prompt_requests: Mutex::new(Some(prompt_requests)),
        }
    }

    /// Settings changes are written to `pool` from now on.
    pub fn with_local_db(mut self, pool: SqlitePool) -> Self {
        self.local_db = Some(pool);
        self
    }

    /// Hand out the conflict prompt queue. Only the first caller gets it.
    pub fn take_prompt_requests(&self) -> Option<mpsc::Receiver<PromptRequest>> {
        self.prompt_requests.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Flip the master switch, then start every enabled scope or tear all
    /// sandboxes down.
    pub async fn set_extension_enabled(&self, enable: bool) -> Result<()> {
        let settings = self.settings.set_extension_enabled(enable);
        self.persist_settings(&settings).await?;

        if enable {
            log::info!("[script_manager] extension enabled");
            self.manager.activate_on_load().await;
        } else {
            let cleared = self.manager.cleanup().await;
            log::info!("[script_manager] extension disabled, {} sandbox(es) destroyed", cleared);
        }
        Ok(())
    }

    /// Applies to scripts started after the call.
    pub async fn set_trust_level(&self, trust: TrustLevel) -> Result<()> {
        let settings = self.settings.update(|s| s.trust_level = trust);
        self.persist_settings(&settings).await?;
        self.sandbox.set_trust_level(trust);
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
        if let Some(pool) = &self.local_db {
            pool.close().await;
        }
    }

    async fn persist_settings(&self, settings: &ExtensionSettings) -> Result<()> {
        let Some(pool) = &self.local_db else {
            return Ok(());
        };
        let json = serde_json::to_string(settings).map_err(StoreError::from)?;
        db::local::save_settings(pool, &json).await.map_err(StoreError::from)?;
        Ok(())
    }
}
