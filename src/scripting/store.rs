/// `scripting/store.rs` — the two script collections and their scope flags
///
/// Reads come from an in-memory cache and never block. Writes build the new
/// collection on a copy, rewrite it in the database when a SQLite pool is
/// attached, and only then replace the cached one.
use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard},
};

use futures_util::future::BoxFuture;
use sqlx::SqlitePool;

use super::types::{Script, ScriptType};
use crate::{db::local, error::StoreError};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Owner key of the GLOBAL collection.
const GLOBAL_OWNER: &str = "";

pub trait ScriptStore: Send + Sync {
    fn global_scripts(&self) -> Vec<Script>;
    fn character_scripts(&self) -> Vec<Script>;

    fn scripts(&self, scope: ScriptType) -> Vec<Script> {
        match scope {
            ScriptType::Global => self.global_scripts(),
            ScriptType::Character => self.character_scripts(),
        }
    }

    /// Searches GLOBAL first, then CHARACTER.
    fn script_by_id(&self, id: &str) -> Option<Script> {
        self.global_scripts()
            .into_iter()
            .chain(self.character_scripts())
            .find(|s| s.id == id)
    }

    /// Scope currently holding a script with this id.
    fn script_type(&self, script: &Script) -> Option<ScriptType> {
        if self.global_scripts().iter().any(|s| s.id == script.id) {
            Some(ScriptType::Global)
        } else if self.character_scripts().iter().any(|s| s.id == script.id) {
            Some(ScriptType::Character)
        } else {
            None
        }
    }

    fn is_global_script_enabled(&self) -> bool;
    fn is_character_script_enabled(&self) -> bool;

    fn is_scope_enabled(&self, scope: ScriptType) -> bool {
        match scope {
            ScriptType::Global => self.is_global_script_enabled(),
            ScriptType::Character => self.is_character_script_enabled(),
        }
    }

    /// Insert or update by id, keeping the existing position on update.
    fn save_script<'a>(&'a self, script: &'a Script, scope: ScriptType) -> BoxFuture<'a, StoreResult<()>>;

    /// Replace a whole collection, e.g. after a reorder.
    fn save_scripts(&self, scope: ScriptType, scripts: Vec<Script>) -> BoxFuture<'_, StoreResult<()>>;

    fn save_global_scripts(&self, scripts: Vec<Script>) -> BoxFuture<'_, StoreResult<()>> {
        self.save_scripts(ScriptType::Global, scripts)
    }

    fn save_character_scripts(&self, scripts: Vec<Script>) -> BoxFuture<'_, StoreResult<()>> {
        self.save_scripts(ScriptType::Character, scripts)
    }

    /// Removing an id the scope does not hold is a no-op.
    fn delete_script<'a>(&'a self, id: &'a str, scope: ScriptType) -> BoxFuture<'a, StoreResult<()>>;

    /// Take the entry with `script.id` out of `from` and append `script`
    /// to the other collection.
    fn move_script_to_other_type<'a>(
        &'a self,
        script: &'a Script,
        from: ScriptType,
    ) -> BoxFuture<'a, StoreResult<()>>;

    fn update_script_type_enable_state(&self, scope: ScriptType, enabled: bool) -> BoxFuture<'_, StoreResult<()>>;

    /// Reload the cache from the backing store.
    fn load_scripts(&self) -> BoxFuture<'_, StoreResult<()>>;

    fn refresh_character_script_enabled_state(&self) -> BoxFuture<'_, StoreResult<()>>;

    /// Make `character` the owner of the CHARACTER collection.
    fn switch_character(&self, character: String) -> BoxFuture<'_, StoreResult<()>>;

    fn active_character(&self) -> String;
}

// ── ScriptData ────────────────────────────────────────────────────────────────

struct Collection {
    scripts: Vec<Script>,
    enabled: bool,
}

struct Cache {
    global: Collection,
    character_key: String,
    character: Collection,
    /// Collections of inactive characters when no database is attached.
    parked: HashMap<String, Collection>,
}

impl Cache {
    fn collection(&mut self, scope: ScriptType) -> &mut Collection {
        match scope {
            ScriptType::Global => &mut self.global,
            ScriptType::Character => &mut self.character,
        }
    }

    fn owner(&self, scope: ScriptType) -> String {
        match scope {
            ScriptType::Global => GLOBAL_OWNER.to_string(),
            ScriptType::Character => self.character_key.clone(),
        }
    }
}

/// Default `ScriptStore`: cache plus optional SQLite. A write reaches the
/// cache only after the database accepted it.
pub struct ScriptData {
    cache: Mutex<Cache>,
    /// Held across a whole read-modify-persist-swap cycle.
    writes: tokio::sync::Mutex<()>,
    local_db: Option<SqlitePool>,
    default_global_enabled: bool,
    default_character_enabled: bool,
}

impl ScriptData {
    /// Cache-only store.
    pub fn in_memory(global_enabled: bool, character_enabled: bool) -> Self {
        Self {
            cache: Mutex::new(Cache {
                global: Collection { scripts: Vec::new(), enabled: global_enabled },
                character_key: String::new(),
                character: Collection { scripts: Vec::new(), enabled: character_enabled },
                parked: HashMap::new(),
            }),
            writes: tokio::sync::Mutex::new(()),
            local_db: None,
            default_global_enabled: global_enabled,
            default_character_enabled: character_enabled,
        }
    }

    /// Store backed by `pool`; the cache is filled from it.
    pub async fn with_local_db(
        pool: SqlitePool,
        default_global_enabled: bool,
        default_character_enabled: bool,
    ) -> StoreResult<Self> {
        let mut data = Self::in_memory(default_global_enabled, default_character_enabled);
        data.local_db = Some(pool);
        data.load_scripts().await?;
        Ok(data)
    }

    fn lock(&self) -> MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self, scope: ScriptType) -> Vec<Script> {
        self.lock().collection(scope).scripts.clone()
    }

    async fn load_collection(
        &self,
        pool: &SqlitePool,
        scope: ScriptType,
        owner: &str,
    ) -> StoreResult<Collection> {
        let rows = local::load_script_rows(pool, scope, owner).await?;
        let scripts = rows
            .iter()
            .map(|row| serde_json::from_str::<Script>(row))
            .collect::<Result<Vec<_>, _>>()?;
        let default = match scope {
            ScriptType::Global => self.default_global_enabled,
            ScriptType::Character => self.default_character_enabled,
        };
        let enabled = local::load_scope_enabled(pool, scope, owner).await?.unwrap_or(default);
        Ok(Collection { scripts, enabled })
    }

    /// Persist the new collections, then swap them into the cache.
    /// Callers hold `writes`.
    async fn commit(&self, changes: Vec<(ScriptType, Vec<Script>)>) -> StoreResult<()> {
        for (_, scripts) in &changes {
            ensure_unique(scripts)?;
        }

        if let Some(pool) = &self.local_db {
            let character_key = self.lock().character_key.clone();
            let mut collections = Vec::with_capacity(changes.len());
            for (scope, scripts) in &changes {
                let owner = match scope {
                    ScriptType::Global => GLOBAL_OWNER.to_string(),
                    ScriptType::Character => character_key.clone(),
                };
                collections.push((*scope, owner, local::encode_scripts(scripts)?));
            }
            local::replace_collections(pool, &collections).await?;
        }

        let mut cache = self.lock();
        for (scope, scripts) in changes {
            cache.collection(scope).scripts = scripts;
        }
        Ok(())
    }
}

fn ensure_unique(scripts: &[Script]) -> StoreResult<()> {
    let mut seen = HashSet::new();
    match scripts.iter().find(|s| !seen.insert(s.id.as_str())) {
        Some(dup) => Err(StoreError::DuplicateId(dup.id.clone())),
        None => Ok(()),
    }
}

impl ScriptStore for ScriptData {
    fn global_scripts(&self) -> Vec<Script> {
        self.lock().global.scripts.clone()
    }

    fn character_scripts(&self) -> Vec<Script> {
        self.lock().character.scripts.clone()
    }

    fn is_global_script_enabled(&self) -> bool {
        self.lock().global.enabled
    }

    fn is_character_script_enabled(&self) -> bool {
        self.lock().character.enabled
    }

    fn save_script<'a>(&'a self, script: &'a Script, scope: ScriptType) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            let _writes = self.writes.lock().await;
            let mut scripts = self.snapshot(scope);
            match scripts.iter_mut().find(|s| s.id == script.id) {
                Some(existing) => *existing = script.clone(),
                None => scripts.push(script.clone()),
            }
            self.commit(vec![(scope, scripts)]).await
        })
    }

    fn save_scripts(&self, scope: ScriptType, scripts: Vec<Script>) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            let _writes = self.writes.lock().await;
            self.commit(vec![(scope, scripts)]).await
        })
    }

    fn delete_script<'a>(&'a self, id: &'a str, scope: ScriptType) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            let _writes = self.writes.lock().await;
            let mut scripts = self.snapshot(scope);
            let before = scripts.len();
            scripts.retain(|s| s.id != id);
            if scripts.len() == before {
                return Ok(());
            }
            self.commit(vec![(scope, scripts)]).await
        })
    }

    fn move_script_to_other_type<'a>(
        &'a self,
        script: &'a Script,
        from: ScriptType,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            let _writes = self.writes.lock().await;
            let to = from.other();
            let mut source = self.snapshot(from);
            source.retain(|s| s.id != script.id);
            let mut target = self.snapshot(to);
            target.retain(|s| s.id != script.id);
            target.push(script.clone());
            self.commit(vec![(from, source), (to, target)]).await
        })
    }

    fn update_script_type_enable_state(&self, scope: ScriptType, enabled: bool) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            let _writes = self.writes.lock().await;
            if let Some(pool) = &self.local_db {
                let owner = self.lock().owner(scope);
                local::save_scope_enabled(pool, scope, &owner, enabled).await?;
            }
            self.lock().collection(scope).enabled = enabled;
            log::info!("[script_store] {} scripts {}", scope, if enabled { "enabled" } else { "disabled" });
            Ok(())
        })
    }

    fn load_scripts(&self) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            let Some(pool) = &self.local_db else {
                return Ok(());
            };
            let _writes = self.writes.lock().await;
            let character_key = self.lock().character_key.clone();
            let global = self.load_collection(pool, ScriptType::Global, GLOBAL_OWNER).await?;
            let character = self.load_collection(pool, ScriptType::Character, &character_key).await?;
            let mut cache = self.lock();
            cache.global = global;
            cache.character = character;
            Ok(())
        })
    }

    fn refresh_character_script_enabled_state(&self) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            let Some(pool) = &self.local_db else {
                return Ok(());
            };
            let _writes = self.writes.lock().await;
            let key = self.lock().character_key.clone();
            let enabled = local::load_scope_enabled(pool, ScriptType::Character, &key)
                .await?
                .unwrap_or(self.default_character_enabled);
            self.lock().character.enabled = enabled;
            Ok(())
        })
    }

    fn switch_character(&self, character: String) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            let _writes = self.writes.lock().await;
            if let Some(pool) = &self.local_db {
                let loaded = self.load_collection(pool, ScriptType::Character, &character).await?;
                let mut cache = self.lock();
                cache.character_key = character;
                cache.character = loaded;
                return Ok(());
            }

            let mut cache = self.lock();
            if cache.character_key == character {
                return Ok(());
            }
            let incoming = cache.parked.remove(&character).unwrap_or(Collection {
                scripts: Vec::new(),
                enabled: self.default_character_enabled,
            });
            let outgoing = std::mem::replace(&mut cache.character, incoming);
            let old_key = std::mem::replace(&mut cache.character_key, character);
            cache.parked.insert(old_key, outgoing);
            Ok(())
        })
    }

    fn active_character(&self) -> String {
        self.lock().character_key.clone()
    }
}
