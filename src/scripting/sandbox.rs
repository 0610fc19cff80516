/// `scripting/sandbox.rs` — isolated execution contexts for running scripts
///
/// `SandboxHost` is the capability the lifecycle code talks to: create an
/// instance tagged by script id, find it again by that tag, destroy it.
/// `LuaSandboxHost` backs every instance with its own restricted Lua VM.
/// Dangerous libraries (os, io, debug, package) are omitted by default.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use futures_util::future::BoxFuture;
use mlua::{Function, Lua, LuaOptions, Result as LuaResult, StdLib};
use serde::{Deserialize, Serialize};

use super::api::{register_all, ScriptKv, ScriptLog, ScriptLogEntry};
use crate::error::SandboxError;

/// Controls which Lua standard libraries are available to a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Default: string, table, math, coroutine — no I/O or OS
    #[default]
    Basic,
    /// Standard + io (for reading files in a scoped path)
    FileRead,
    /// Full standard library — only for trusted scripts
    Elevated,
}

/// Creates a new Lua VM with sandbox restrictions applied.
pub fn create_sandboxed_vm(trust: TrustLevel) -> LuaResult<Lua> {
    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::COROUTINE,
        LuaOptions::default(),
    )?;

    if trust == TrustLevel::FileRead || trust == TrustLevel::Elevated {
        lua.load_std_libs(StdLib::IO)?;
    }

    if trust == TrustLevel::Elevated {
        lua.load_std_libs(StdLib::OS | StdLib::PACKAGE)?;
    }

    Ok(lua)
}

// ── Host capability ───────────────────────────────────────────────────────────

/// Everything a sandbox needs to boot one script.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxPayload {
    pub script_id: String,
    pub script_name: String,
    /// Name reported in Lua error messages.
    pub chunk_name: String,
    pub buttons: Vec<String>,
    pub source: String,
}

/// Tag of a live instance. `instance` distinguishes successive instances
/// created for the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxHandle {
    pub key: String,
    pub instance: u64,
}

pub trait SandboxHost: Send + Sync {
    /// Boot a new instance tagged `key`.
    fn create<'a>(
        &'a self,
        key: &'a str,
        payload: SandboxPayload,
    ) -> BoxFuture<'a, Result<SandboxHandle, SandboxError>>;

    fn find_by_key(&self, key: &str) -> Option<SandboxHandle>;

    /// Tear an instance down. Resolves once teardown has finished.
    fn destroy(&self, handle: SandboxHandle) -> BoxFuture<'_, Result<(), SandboxError>>;

    /// Every live instance.
    fn handles(&self) -> Vec<SandboxHandle>;

    /// Drop whatever the host keeps for `key` between instances.
    fn forget(&self, _key: &str) {}
}

// ── Lua implementation ────────────────────────────────────────────────────────

struct LuaInstance {
    handle: SandboxHandle,
    lua: Lua,
}

pub struct LuaSandboxHost {
    instances: Mutex<HashMap<String, LuaInstance>>,
    /// Per-script log buffers (last 200 entries per script), kept across restarts
    logs: Mutex<HashMap<String, ScriptLog>>,
    /// Per-script key/value stores, kept across restarts
    stores: Mutex<HashMap<String, ScriptKv>>,
    trust: Mutex<TrustLevel>,
    next_instance: AtomicU64,
}

impl LuaSandboxHost {
    pub fn new(trust: TrustLevel) -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            logs: Mutex::new(HashMap::new()),
            stores: Mutex::new(HashMap::new()),
            trust: Mutex::new(trust),
            next_instance: AtomicU64::new(1),
        }
    }

    /// Applies to instances created after the call.
    pub fn set_trust_level(&self, trust: TrustLevel) {
        *self.trust.lock().unwrap_or_else(|e| e.into_inner()) = trust;
    }

    pub fn trust_level(&self) -> TrustLevel {
        *self.trust.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.lock_instances().contains_key(key)
    }

    pub fn script_log(&self, key: &str, limit: usize) -> Vec<ScriptLogEntry> {
        let sink = self.logs.lock().unwrap_or_else(|e| e.into_inner()).get(key).cloned();
        let Some(sink) = sink else {
            return Vec::new();
        };
        let entries = sink.lock().unwrap_or_else(|e| e.into_inner());
        let skip = entries.len().saturating_sub(limit);
        entries[skip..].to_vec()
    }

    /// Snapshot of a script's key/value store.
    pub fn script_store(&self, key: &str) -> HashMap<String, serde_json::Value> {
        self.stores
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|kv| kv.lock().unwrap_or_else(|e| e.into_inner()).clone())
            .unwrap_or_default()
    }

    fn log_sink(&self, key: &str) -> ScriptLog {
        let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(logs.entry(key.to_string()).or_default())
    }

    fn kv_store(&self, key: &str) -> ScriptKv {
        let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(stores.entry(key.to_string()).or_default())
    }

    fn lock_instances(&self) -> std::sync::MutexGuard<'_, HashMap<String, LuaInstance>> {
        self.instances.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for LuaSandboxHost {
    fn default() -> Self {
        Self::new(TrustLevel::Basic)
    }
}

impl SandboxHost for LuaSandboxHost {
    fn create<'a>(
        &'a self,
        key: &'a str,
        payload: SandboxPayload,
    ) -> BoxFuture<'a, Result<SandboxHandle, SandboxError>> {
        Box::pin(async move {
            if self.is_running(key) {
                return Err(SandboxError::AlreadyRunning(key.to_string()));
            }

            let trust = self.trust_level();
            let log_sink = self.log_sink(key);
            let kv = self.kv_store(key);

            // Lua is sync; boot on the blocking pool
            let script_id = key.to_string();
            let lua = tokio::task::spawn_blocking(move || boot_instance(trust, &payload, log_sink, kv))
                .await
                .map_err(|e| SandboxError::Task { script_id, message: e.to_string() })??;

            let handle = SandboxHandle {
                key: key.to_string(),
                instance: self.next_instance.fetch_add(1, Ordering::Relaxed),
            };
            let mut instances = self.lock_instances();
            if instances.contains_key(key) {
                return Err(SandboxError::AlreadyRunning(key.to_string()));
            }
            instances.insert(key.to_string(), LuaInstance { handle: handle.clone(), lua });
            Ok(handle)
        })
    }

    fn find_by_key(&self, key: &str) -> Option<SandboxHandle> {
        self.lock_instances().get(key).map(|i| i.handle.clone())
    }

    fn destroy(&self, handle: SandboxHandle) -> BoxFuture<'_, Result<(), SandboxError>> {
        Box::pin(async move {
            let instance = {
                let mut instances = self.lock_instances();
                let current = instances.get(&handle.key).is_some_and(|live| live.handle == handle);
                if current {
                    instances.remove(&handle.key)
                } else {
                    None
                }
            };
            let Some(instance) = instance else {
                log::debug!("[sandbox] stale handle for '{}', nothing to destroy", handle.key);
                return Ok(());
            };

            // The instance is already gone; a failing hook must not undo that
            let key = handle.key.clone();
            match tokio::task::spawn_blocking(move || run_unload_hook(&instance.lua, &handle.key)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("[sandbox] '{}' unloaded with error: {}", key, e),
                Err(e) => log::warn!("[sandbox] unload task for '{}' aborted: {}", key, e),
            }
            Ok(())
        })
    }

    fn handles(&self) -> Vec<SandboxHandle> {
        self.lock_instances().values().map(|i| i.handle.clone()).collect()
    }

    fn forget(&self, key: &str) {
        self.logs.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
        self.stores.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn boot_instance(
    trust: TrustLevel,
    payload: &SandboxPayload,
    log_sink: ScriptLog,
    kv: ScriptKv,
) -> Result<Lua, SandboxError> {
    let lua = create_sandboxed_vm(trust).map_err(|e| SandboxError::Vm(e.to_string()))?;

    register_all(&lua, payload, log_sink, kv).map_err(|e| SandboxError::Api {
        script_id: payload.script_id.clone(),
        message: e.to_string(),
    })?;

    lua.load(payload.source.as_str())
        .set_name(payload.chunk_name.as_str())
        .exec()
        .map_err(|e| SandboxError::Script {
            script_id: payload.script_id.clone(),
            message: e.to_string(),
        })?;
    Ok(lua)
}

/// Call the script's global `on_unload()` if it defined one.
fn run_unload_hook(lua: &Lua, script_id: &str) -> Result<(), SandboxError> {
    let hook: Option<Function> = lua.globals().get("on_unload").map_err(|e| SandboxError::Script {
        script_id: script_id.to_string(),
        message: e.to_string(),
    })?;
    if let Some(hook) = hook {
        hook.call::<()>(()).map_err(|e| SandboxError::Script {
            script_id: script_id.to_string(),
            message: format!("on_unload: {e}"),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(id: &str, source: &str) -> SandboxPayload {
        SandboxPayload {
            script_id: id.to_string(),
            script_name: format!("{id}-name"),
            chunk_name: format!("script:{id}"),
            buttons: vec!["Go".to_string()],
            source: source.to_string(),
        }
    }

    #[tokio::test]
    async fn create_find_destroy() {
        let host = LuaSandboxHost::default();
        let handle = host.create("a", payload("a", "log.info('hello ' .. script.name)")).await.unwrap();
        assert_eq!(host.find_by_key("a"), Some(handle.clone()));
        assert_eq!(host.handles().len(), 1);

        host.destroy(handle).await.unwrap();
        assert!(host.find_by_key("a").is_none());
        let log = host.script_log("a", 10);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].message, "hello a-name");
    }

    #[tokio::test]
    async fn second_live_instance_is_refused() {
        let host = LuaSandboxHost::default();
        host.create("a", payload("a", "x = 1")).await.unwrap();
        let err = host.create("a", payload("a", "x = 2")).await.unwrap_err();
        assert!(matches!(err, SandboxError::AlreadyRunning(_)));
    }

    #[tokio::test]
    async fn basic_trust_has_no_os_library() {
        let host = LuaSandboxHost::default();
        let err = host.create("a", payload("a", "os.exit(1)")).await.unwrap_err();
        assert!(matches!(err, SandboxError::Script { .. }));
        assert!(host.find_by_key("a").is_none());
    }

    #[tokio::test]
    async fn unload_hook_runs_on_destroy() {
        let host = LuaSandboxHost::default();
        let handle = host
            .create("a", payload("a", "function on_unload() store.set('unloaded', true) end"))
            .await
            .unwrap();
        host.destroy(handle).await.unwrap();
        assert_eq!(host.script_store("a").get("unloaded"), Some(&serde_json::json!(true)));
    }

    #[tokio::test]
    async fn throwing_unload_hook_still_tears_down() {
        let host = LuaSandboxHost::default();
        let handle = host
            .create("u", payload("u", "function on_unload() error('bye') end"))
            .await
            .unwrap();
        host.destroy(handle).await.unwrap();
        assert!(host.find_by_key("u").is_none());
        host.create("u", payload("u", "function on_unload() error('bye') end")).await.unwrap();
        assert!(host.is_running("u"));
    }

    #[tokio::test]
    async fn cyclic_store_value_fails_the_script_only() {
        let host = LuaSandboxHost::default();
        let err = host
            .create("c", payload("c", "local t = {} t.me = t store.set('k', t)"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Script { .. }));
        assert!(host.find_by_key("c").is_none());
        assert!(host.script_store("c").is_empty());
    }

    #[tokio::test]
    async fn forget_drops_log_and_store() {
        let host = LuaSandboxHost::default();
        let handle = host
            .create("f", payload("f", "store.set('n', 1) print('hi')"))
            .await
            .unwrap();
        host.destroy(handle).await.unwrap();
        assert_eq!(host.script_log("f", 10).len(), 1);

        host.forget("f");
        assert!(host.script_log("f", 10).is_empty());
        assert!(host.script_store("f").is_empty());
    }

    #[tokio::test]
    async fn stale_handle_does_not_destroy_newer_instance() {
        let host = LuaSandboxHost::default();
        let first = host.create("a", payload("a", "x = 1")).await.unwrap();
        host.destroy(first.clone()).await.unwrap();
        let second = host.create("a", payload("a", "x = 2")).await.unwrap();
        host.destroy(first).await.unwrap();
        assert_eq!(host.find_by_key("a"), Some(second));
    }

    #[test]
    fn elevated_vm_loads_os() {
        let lua = create_sandboxed_vm(TrustLevel::Elevated).unwrap();
        let has_os: bool = lua.load("return os ~= nil").eval().unwrap();
        assert!(has_os);
        let basic = create_sandboxed_vm(TrustLevel::Basic).unwrap();
        let has_io: bool = basic.load("return io ~= nil").eval().unwrap();
        assert!(!has_io);
    }
}
