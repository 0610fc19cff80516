/// `scripting/manager.rs` — script lifecycle orchestration
///
/// `ScriptManager` is the single entry point for starting, stopping,
/// importing, moving and deleting scripts. It is constructed once at
/// startup, attached to the event bus, and shut down explicitly.
/// A script runs only while `script.enabled && scope enabled && extension enabled`.
use std::{
    collections::HashSet,
    future::Future,
    sync::{Arc, Mutex},
};

use super::{
    conflict::{ConflictAction, ConflictKind, ConflictRequest, ConflictResolver},
    events::{EventBus, EventKind, ImportSource, RepositoryEvent, SubscriptionId, UiRefresh},
    executor::ScriptExecutor,
    notify::Notifier,
    sandbox::SandboxHost,
    store::ScriptStore,
    types::{new_script_id, Script, ScriptType},
};
use crate::{
    config::SettingsSource,
    error::{Result, ScriptError},
};

/// Outcome of a batch start/stop. Failed items do not stop the batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    /// Ids started or stopped, in order.
    pub processed: Vec<String>,
    /// (id, error) for each item that failed.
    pub failed: Vec<(String, String)>,
    /// Set when a gate was closed and nothing was attempted.
    pub skipped: bool,
}

impl BatchReport {
    fn skipped() -> Self {
        Self { skipped: true, ..Self::default() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImportOutcome {
    Imported(Script),
    Cancelled,
    /// The file was not a valid script; the user has been told why.
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MoveOutcome {
    Moved(Script),
    Cancelled,
}

pub struct ScriptManager {
    store: Arc<dyn ScriptStore>,
    executor: ScriptExecutor,
    settings: Arc<dyn SettingsSource>,
    resolver: Arc<dyn ConflictResolver>,
    notifier: Arc<dyn Notifier>,
    bus: EventBus,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl ScriptManager {
    pub fn new(
        store: Arc<dyn ScriptStore>,
        host: Arc<dyn SandboxHost>,
        settings: Arc<dyn SettingsSource>,
        resolver: Arc<dyn ConflictResolver>,
        notifier: Arc<dyn Notifier>,
        bus: EventBus,
    ) -> Self {
        Self {
            store,
            executor: ScriptExecutor::new(host, Arc::clone(&notifier)),
            settings,
            resolver,
            notifier,
            bus,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // ── Event wiring ──────────────────────────────────────────────────────

    /// Subscribe to the intent events. Listeners hold a weak reference, so
    /// dropping the last `Arc` silences them. Calling twice is a no-op.
    pub fn attach(self: &Arc<Self>) {
        if !self.lock_subscriptions().is_empty() {
            return;
        }
        let ids = vec![
            self.listen(EventKind::ScriptToggle, |manager, event| async move {
                if let RepositoryEvent::ScriptToggle { script, scope, enable, user_input } = event {
                    let _ = manager.toggle_script(script, scope, enable, user_input).await;
                }
            }),
            self.listen(EventKind::TypeToggle, |manager, event| async move {
                if let RepositoryEvent::TypeToggle { scope, enable, user_input } = event {
                    let _ = manager.toggle_script_type(scope, enable, user_input).await;
                }
            }),
            self.listen(EventKind::ScriptImport, |manager, event| async move {
                if let RepositoryEvent::ScriptImport { file, scope } = event {
                    let _ = manager.import_script(file, scope).await;
                }
            }),
            self.listen(EventKind::ScriptDelete, |manager, event| async move {
                if let RepositoryEvent::ScriptDelete { script_id, scope } = event {
                    if let Err(e) = manager.delete_script(&script_id, scope).await {
                        manager.surface("delete script", e);
                    }
                }
            }),
            self.listen(EventKind::ScriptSave, |manager, event| async move {
                if let RepositoryEvent::ScriptSave { script, scope } = event {
                    if let Err(e) = manager.save_script(script, scope).await {
                        manager.surface("save script", e);
                    }
                }
            }),
            self.listen(EventKind::ScriptMove, |manager, event| async move {
                if let RepositoryEvent::ScriptMove { script, from } = event {
                    let _ = manager.move_script(script, from).await;
                }
            }),
            self.listen(EventKind::CharacterChanged, |manager, event| async move {
                if let RepositoryEvent::CharacterChanged { character } = event {
                    let _ = manager.switch_character(character).await;
                }
            }),
            self.listen(EventKind::UiLoaded, |manager, _| async move {
                manager.activate_on_load().await;
            }),
        ];
        self.lock_subscriptions().extend(ids);
    }

    /// Detach from the bus and tear every sandbox down.
    pub async fn shutdown(&self) {
        let ids: Vec<SubscriptionId> = self.lock_subscriptions().drain(..).collect();
        for id in ids {
            self.bus.unsubscribe(id);
        }
        let cleared = self.cleanup().await;
        log::info!("[script_manager] shut down, {} sandbox(es) destroyed", cleared);
    }

    fn listen<F, Fut>(self: &Arc<Self>, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(Arc<ScriptManager>, RepositoryEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let weak = Arc::downgrade(self);
        self.bus.subscribe(kind, move |event| {
            let pending = weak.upgrade().map(|manager| handler(manager, event));
            async move {
                if let Some(pending) = pending {
                    pending.await;
                }
            }
        })
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, Vec<SubscriptionId>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Startup activation: run the enabled scripts of every enabled scope.
    /// Scopes are independent; a disabled one does not block the other.
    pub async fn activate_on_load(&self) {
        if !self.settings.is_extension_enabled() {
            log::info!("[script_manager] extension disabled, skipping script activation");
            return;
        }

        for scope in [ScriptType::Global, ScriptType::Character] {
            if self.store.is_scope_enabled(scope) {
                let scripts = self.store.scripts(scope);
                self.run_scripts_by_type(&scripts, scope).await;
            } else {
                log::info!("[script_manager] {} scripts disabled, skipping their activation", scope);
            }
        }
    }

    // ── Single script ─────────────────────────────────────────────────────

    /// Start `script` if the extension and `scope` are enabled; otherwise a
    /// logged no-op. The script's own flag is the caller's concern.
    pub async fn run_script(&self, script: &Script, scope: ScriptType) -> Result<()> {
        if !self.settings.is_extension_enabled() {
            log::info!("[script_manager] extension disabled, not starting [\"{}\"]", script.name);
            return Ok(());
        }
        if !self.store.is_scope_enabled(scope) {
            log::info!("[script_manager] {} scripts disabled, not starting [\"{}\"]", scope, script.name);
            return Ok(());
        }

        self.executor.run_script(script, scope).await?;

        if script.has_buttons() {
            self.bus.publish(RepositoryEvent::ButtonAdd { script: script.clone() });
        }
        Ok(())
    }

    /// Destroy any instance for `script`, regardless of flags.
    pub async fn stop_script(&self, script: &Script, scope: ScriptType) -> Result<()> {
        self.executor.stop_script(script, scope).await?;

        if script.has_buttons() {
            self.bus.publish(RepositoryEvent::ButtonRemove { script_id: script.id.clone() });
        }
        Ok(())
    }

    /// Start or stop one script. Sandbox failures are reported to the user
    /// and swallowed; only a failed save of the new flag is returned.
    pub async fn toggle_script(
        &self,
        mut script: Script,
        scope: ScriptType,
        enable: bool,
        user_input: bool,
    ) -> Result<()> {
        if user_input {
            script.enabled = enable;
            if let Err(e) = self.store.save_script(&script, scope).await {
                return Err(self.surface("save script state", e.into()));
            }
        }

        let result = if enable {
            self.run_script(&script, scope).await
        } else {
            self.stop_script(&script, scope).await
        };
        if let Err(e) = result {
            log::error!("[script_manager] failed to toggle [\"{}\"]: {}", script.name, e);
            self.notifier.error(&format!("Failed to toggle script \"{}\"", script.name));
        }

        self.bus.publish(RepositoryEvent::UiRefresh(UiRefresh::ScriptToggled { script, scope, enable }));
        Ok(())
    }

    // ── Whole scope ───────────────────────────────────────────────────────

    /// Flip a scope's flag and start or stop its enabled scripts in order.
    pub async fn toggle_script_type(
        &self,
        scope: ScriptType,
        enable: bool,
        user_input: bool,
    ) -> Result<BatchReport> {
        if user_input {
            if let Err(e) = self.store.update_script_type_enable_state(scope, enable).await {
                return Err(self.surface("save scope state", e.into()));
            }
        }

        let scripts = self.store.scripts(scope);
        let report = if enable {
            self.run_scripts_by_type(&scripts, scope).await
        } else {
            self.stop_scripts_by_type(&scripts, scope).await
        };

        self.bus.publish(RepositoryEvent::UiRefresh(UiRefresh::TypeToggled { scope, enable }));
        Ok(report)
    }

    /// Start every enabled script in `scripts`, one at a time. The gates are
    /// checked once, up front.
    pub async fn run_scripts_by_type(&self, scripts: &[Script], scope: ScriptType) -> BatchReport {
        if !self.settings.is_extension_enabled() {
            log::info!("[script_manager] extension disabled, not starting {} scripts", scope);
            return BatchReport::skipped();
        }
        if !self.store.is_scope_enabled(scope) {
            log::info!("[script_manager] {} scripts disabled, not starting them", scope);
            return BatchReport::skipped();
        }

        let mut report = BatchReport::default();
        for script in scripts.iter().filter(|s| s.enabled) {
            match self.executor.run_script(script, scope).await {
                Ok(()) => {
                    report.processed.push(script.id.clone());
                    if script.has_buttons() {
                        self.bus.publish(RepositoryEvent::ButtonAdd { script: script.clone() });
                    }
                }
                Err(e) => report.failed.push((script.id.clone(), e.to_string())),
            }
        }
        report
    }

    /// Stop every enabled script in `scripts`, one at a time.
    pub async fn stop_scripts_by_type(&self, scripts: &[Script], scope: ScriptType) -> BatchReport {
        let mut report = BatchReport::default();
        for script in scripts.iter().filter(|s| s.enabled) {
            match self.executor.stop_script(script, scope).await {
                Ok(_) => {
                    report.processed.push(script.id.clone());
                    if script.has_buttons() {
                        self.bus.publish(RepositoryEvent::ButtonRemove { script_id: script.id.clone() });
                    }
                }
                Err(e) => report.failed.push((script.id.clone(), e.to_string())),
            }
        }
        report
    }

    // ── Import ────────────────────────────────────────────────────────────

    /// Import an exported script into `scope`. A bad file is reported and
    /// yields `Rejected`; an id already used in either scope goes through
    /// conflict resolution.
    pub async fn import_script(&self, file: ImportSource, scope: ScriptType) -> Result<ImportOutcome> {
        let mut incoming = match Script::from_import(&file.contents) {
            Ok(script) => script,
            Err(e) => {
                log::error!("[script_manager] import of '{}' failed: {}", file.file_name, e);
                self.notifier.error(&format!("'{}' is not a valid script file", file.file_name));
                return Ok(ImportOutcome::Rejected(e.to_string()));
            }
        };

        match self.try_import(&mut incoming, scope).await {
            Ok(true) => {}
            Ok(false) => return Ok(ImportOutcome::Cancelled),
            Err(e) => return Err(self.surface("import script", e)),
        }

        self.bus.publish(RepositoryEvent::UiRefresh(UiRefresh::ScriptImported {
            script: incoming.clone(),
            scope,
        }));
        self.notifier.success(&format!("Imported script '{}'", incoming.name));
        Ok(ImportOutcome::Imported(incoming))
    }

    /// Returns false when the user cancelled.
    async fn try_import(&self, incoming: &mut Script, scope: ScriptType) -> Result<bool> {
        let conflict = [ScriptType::Global, ScriptType::Character]
            .into_iter()
            .find_map(|owner| {
                self.store
                    .scripts(owner)
                    .into_iter()
                    .find(|s| s.id == incoming.id)
                    .map(|existing| (existing, owner))
            });

        if let Some((existing, owner)) = conflict {
            let action = self
                .resolver
                .resolve(ConflictRequest {
                    kind: ConflictKind::Import,
                    incoming: &*incoming,
                    existing: &existing,
                    existing_scope: owner,
                    target_scope: scope,
                })
                .await;

            match action {
                ConflictAction::New => incoming.id = self.fresh_id(),
                ConflictAction::Override => {
                    self.delete_script(&existing.id, owner).await?;
                    // The replacement keeps running if the old script was
                    incoming.enabled = existing.enabled;
                }
                ConflictAction::Cancel => {
                    log::info!("[script_manager] import of [\"{}\"] cancelled", incoming.name);
                    return Ok(false);
                }
            }
        }

        self.save_script(incoming.clone(), scope).await?;

        if incoming.enabled {
            if let Err(e) = self.run_script(incoming, scope).await {
                log::warn!("[script_manager] imported [\"{}\"] did not start: {}", incoming.name, e);
            }
        }
        Ok(true)
    }

    /// An id not used in either scope.
    fn fresh_id(&self) -> String {
        loop {
            let id = new_script_id();
            if self.store.script_by_id(&id).is_none() {
                return id;
            }
        }
    }

    // ── CRUD ──────────────────────────────────────────────────────────────

    /// Stop and remove the script `id` stored in `scope`.
    pub async fn delete_script(&self, id: &str, scope: ScriptType) -> Result<()> {
        let script = self
            .store
            .scripts(scope)
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| ScriptError::not_found(id, scope))?;

        self.stop_script(&script, scope).await?;
        self.store.delete_script(id, scope).await?;
        if self.store.script_by_id(id).is_none() {
            self.executor.forget(id);
        }

        self.bus.publish(RepositoryEvent::UiRefresh(UiRefresh::ScriptDeleted {
            script_id: id.to_string(),
            scope,
        }));
        Ok(())
    }

    /// Persist `script`. Does not start or stop it.
    pub async fn save_script(&self, script: Script, scope: ScriptType) -> Result<()> {
        self.store.save_script(&script, scope).await?;
        self.bus.publish(RepositoryEvent::UiRefresh(UiRefresh::ScriptSaved { script, scope }));
        Ok(())
    }

    /// Persist a reordered collection and reload the store's cache.
    pub async fn save_scripts_order(&self, scripts: Vec<Script>, scope: ScriptType) -> Result<()> {
        let mut seen = HashSet::new();
        if let Some(dup) = scripts.iter().find(|s| !seen.insert(s.id.as_str())) {
            return Err(ScriptError::validation(format!("script id '{}' listed twice", dup.id)));
        }
        match scope {
            ScriptType::Global => self.store.save_global_scripts(scripts).await?,
            ScriptType::Character => self.store.save_character_scripts(scripts).await?,
        }
        self.store.load_scripts().await?;
        Ok(())
    }

    // ── Move ──────────────────────────────────────────────────────────────

    /// Move `script` to the other scope. Only an id already present in the
    /// destination counts as a conflict. On cancel the script is restarted
    /// in `from` if it was running.
    pub async fn move_script(&self, script: Script, from: ScriptType) -> Result<MoveOutcome> {
        match self.try_move(script, from).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => Err(self.surface("move script", e)),
        }
    }

    async fn try_move(&self, script: Script, from: ScriptType) -> Result<MoveOutcome> {
        let was_running = self.executor.is_running(&script.id);
        self.stop_script(&script, from).await?;

        let to = from.other();
        let mut moving = script.clone();
        let existing_in_target = self.store.scripts(to).into_iter().find(|s| s.id == script.id);

        if let Some(existing) = existing_in_target {
            let action = self
                .resolver
                .resolve(ConflictRequest {
                    kind: ConflictKind::Move,
                    incoming: &script,
                    existing: &existing,
                    existing_scope: to,
                    target_scope: to,
                })
                .await;

            match action {
                ConflictAction::New => moving.id = self.fresh_id(),
                ConflictAction::Override => self.delete_script(&existing.id, to).await?,
                ConflictAction::Cancel => {
                    log::info!("[script_manager] move of [\"{}\"] cancelled", script.name);
                    if was_running {
                        if let Err(e) = self.run_script(&script, from).await {
                            log::warn!("[script_manager] [\"{}\"] did not restart after cancelled move: {}", script.name, e);
                        }
                    }
                    return Ok(MoveOutcome::Cancelled);
                }
            }
        }

        if moving.id == script.id {
            self.store.move_script_to_other_type(&moving, from).await?;
        } else {
            self.store.delete_script(&script.id, from).await?;
            self.store.save_script(&moving, to).await?;
        }

        self.bus.publish(RepositoryEvent::UiRefresh(UiRefresh::ScriptMoved {
            script: moving.clone(),
            from,
            to,
        }));

        // The move is committed; a failed start is reported by the executor
        if moving.enabled && self.store.is_scope_enabled(to) {
            if let Err(e) = self.run_script(&moving, to).await {
                log::warn!("[script_manager] moved [\"{}\"] did not start in {}: {}", moving.name, to, e);
            }
        }
        Ok(MoveOutcome::Moved(moving))
    }

    // ── Character switch ──────────────────────────────────────────────────

    /// Swap the CHARACTER collection for `character`'s, stopping the old
    /// scripts and starting the new ones.
    pub async fn switch_character(&self, character: String) -> Result<()> {
        let outgoing = self.store.character_scripts();
        self.stop_scripts_by_type(&outgoing, ScriptType::Character).await;

        if let Err(e) = self.store.switch_character(character.clone()).await {
            return Err(self.surface("switch character", e.into()));
        }

        let incoming = self.store.character_scripts();
        self.run_scripts_by_type(&incoming, ScriptType::Character).await;

        self.bus.publish(RepositoryEvent::UiRefresh(UiRefresh::CharacterSwitched { character }));
        Ok(())
    }

    // ── Teardown ──────────────────────────────────────────────────────────

    /// Destroy every live sandbox. Returns how many went down cleanly.
    pub async fn cleanup(&self) -> usize {
        self.executor.clear_all().await
    }

    // ── Reads ─────────────────────────────────────────────────────────────

    pub fn global_scripts(&self) -> Vec<Script> {
        self.store.global_scripts()
    }

    pub fn character_scripts(&self) -> Vec<Script> {
        self.store.character_scripts()
    }

    pub fn script_by_id(&self, id: &str) -> Option<Script> {
        self.store.script_by_id(id)
    }

    pub fn is_global_script_enabled(&self) -> bool {
        self.store.is_global_script_enabled()
    }

    pub fn is_character_script_enabled(&self) -> bool {
        self.store.is_character_script_enabled()
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.executor.is_running(id)
    }

    pub async fn refresh_character_script_enabled_state(&self) -> Result<()> {
        self.store.refresh_character_script_enabled_state().await?;
        Ok(())
    }

    /// Log and toast a failed operation, handing the error back.
    fn surface(&self, context: &str, err: ScriptError) -> ScriptError {
        log::error!("[script_manager] {} failed: {}", context, err);
        self.notifier.error(&format!("Failed to {context}: {err}"));
        err
    }
}
