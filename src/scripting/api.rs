/// `scripting/api.rs` — registers the host globals in each script VM
///
/// Provides the API surface every sandboxed script sees:
///   log, print, store, script

use mlua::{Lua, Result as LuaResult, Value, Variadic};
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use super::sandbox::SandboxPayload;

pub const LOG_BUFFER_LIMIT: usize = 200;

/// Per-script log output (log.info / log.warn / log.error / print calls).
#[derive(Debug, Clone)]
pub struct ScriptLogEntry {
    pub level: String,
    pub message: String,
    pub timestamp: i64,
}

pub type ScriptLog = Arc<Mutex<Vec<ScriptLogEntry>>>;

/// Per-script key/value store, survives restarts of the script.
pub type ScriptKv = Arc<Mutex<std::collections::HashMap<String, serde_json::Value>>>;

/// Register all host globals on `lua`.
///
/// `log_sink` — entries written by log.* and print land here.
/// `store`    — key/value store for the script.
pub fn register_all(
    lua: &Lua,
    payload: &SandboxPayload,
    log_sink: ScriptLog,
    store: ScriptKv,
) -> LuaResult<()> {
    register_log(lua, &payload.script_name, Arc::clone(&log_sink))?;
    register_print(lua, &payload.script_name, log_sink)?;
    register_store(lua, store)?;
    register_script_info(lua, payload)?;
    Ok(())
}

fn push_entry(sink: &ScriptLog, level: &str, message: String) {
    let mut entries = sink.lock().unwrap_or_else(|e| e.into_inner());
    entries.push(ScriptLogEntry {
        level: level.to_string(),
        message,
        timestamp: chrono::Utc::now().timestamp(),
    });
    // Keep only the last LOG_BUFFER_LIMIT
    if entries.len() > LOG_BUFFER_LIMIT {
        let skip = entries.len() - LOG_BUFFER_LIMIT;
        entries.drain(..skip);
    }
}

// ── log ───────────────────────────────────────────────────────────────────────

fn register_log(lua: &Lua, script_name: &str, sink: ScriptLog) -> LuaResult<()> {
    let log_tbl = lua.create_table()?;

    macro_rules! log_fn {
        ($level:literal, $macro:ident) => {{
            let sink = Arc::clone(&sink);
            let name = script_name.to_string();
            lua.create_function(move |_, msg: String| {
                log::$macro!("[script][{}] {}", name, msg);
                push_entry(&sink, $level, msg);
                Ok(())
            })?
        }};
    }

    log_tbl.set("info", log_fn!("info", info))?;
    log_tbl.set("warn", log_fn!("warn", warn))?;
    log_tbl.set("error", log_fn!("error", error))?;
    lua.globals().set("log", log_tbl)?;
    Ok(())
}

// ── print ─────────────────────────────────────────────────────────────────────

fn register_print(lua: &Lua, script_name: &str, sink: ScriptLog) -> LuaResult<()> {
    let name = script_name.to_string();
    let print = lua.create_function(move |_, args: Variadic<Value>| {
        let line = args.iter().map(display_value).collect::<Vec<_>>().join("\t");
        log::info!("[script][{}] {}", name, line);
        push_entry(&sink, "info", line);
        Ok(())
    })?;
    lua.globals().set("print", print)?;
    Ok(())
}

// ── store ─────────────────────────────────────────────────────────────────────

fn register_store(lua: &Lua, store: ScriptKv) -> LuaResult<()> {
    let tbl = lua.create_table()?;

    let store_set = {
        let store = Arc::clone(&store);
        lua.create_function(move |_, (key, val): (String, Value)| {
            let json = lua_value_to_json(val)?;
            store.lock().unwrap_or_else(|e| e.into_inner()).insert(key, json);
            Ok(())
        })?
    };

    let store_get = {
        let store = Arc::clone(&store);
        lua.create_function(move |lua_ctx, key: String| {
            let map = store.lock().unwrap_or_else(|e| e.into_inner());
            match map.get(&key) {
                Some(v) => json_to_lua_value(lua_ctx, v),
                None => Ok(Value::Nil),
            }
        })?
    };

    let store_del = {
        let store = Arc::clone(&store);
        lua.create_function(move |_, key: String| {
            store.lock().unwrap_or_else(|e| e.into_inner()).remove(&key);
            Ok(())
        })?
    };

    tbl.set("set", store_set)?;
    tbl.set("get", store_get)?;
    tbl.set("delete", store_del)?;
    lua.globals().set("store", tbl)?;
    Ok(())
}

// ── script ────────────────────────────────────────────────────────────────────

/// Read-only facts about the running script.
fn register_script_info(lua: &Lua, payload: &SandboxPayload) -> LuaResult<()> {
    let tbl = lua.create_table()?;
    tbl.set("id", payload.script_id.as_str())?;
    tbl.set("name", payload.script_name.as_str())?;

    let buttons = lua.create_table()?;
    for (i, name) in payload.buttons.iter().enumerate() {
        buttons.set(i + 1, name.as_str())?;
    }
    tbl.set("buttons", buttons)?;

    lua.globals().set("script", tbl)?;
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn display_value(val: &Value) -> String {
    match val {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.to_string_lossy(),
        other => format!("<{}>", other.type_name()),
    }
}

/// Deepest table nesting `store.set` accepts.
const MAX_STORE_DEPTH: usize = 32;

fn lua_value_to_json(val: Value) -> LuaResult<serde_json::Value> {
    to_json(val, &mut HashSet::new(), 0)
}

/// `path` holds the tables currently being converted, so a table may
/// appear twice in a value but never inside itself.
fn to_json(val: Value, path: &mut HashSet<usize>, depth: usize) -> LuaResult<serde_json::Value> {
    let json = match val {
        Value::Nil => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(b),
        Value::Integer(i) => serde_json::json!(i),
        Value::Number(n) => serde_json::json!(n),
        Value::String(s) => serde_json::Value::String(s.to_string_lossy()),
        Value::Table(t) => {
            if depth >= MAX_STORE_DEPTH {
                return Err(mlua::Error::runtime(format!(
                    "store: tables nested deeper than {MAX_STORE_DEPTH} levels"
                )));
            }
            let ptr = t.to_pointer() as usize;
            if !path.insert(ptr) {
                return Err(mlua::Error::runtime("store: table contains itself"));
            }

            // Array heuristic: check if keys are sequential integers
            let pairs: Vec<_> = t.clone().pairs::<Value, Value>().filter_map(|p| p.ok()).collect();
            let is_array = !pairs.is_empty()
                && pairs.iter().enumerate().all(|(i, (k, _))| {
                    matches!(k, Value::Integer(n) if *n == (i as i64 + 1))
                });
            let json = if is_array {
                let mut items = Vec::with_capacity(pairs.len());
                for (_, v) in pairs {
                    items.push(to_json(v, path, depth + 1)?);
                }
                serde_json::Value::Array(items)
            } else {
                let mut map = serde_json::Map::new();
                for (k, v) in pairs {
                    if let Value::String(ks) = k {
                        map.insert(ks.to_string_lossy(), to_json(v, path, depth + 1)?);
                    }
                }
                serde_json::Value::Object(map)
            };
            path.remove(&ptr);
            json
        }
        _ => serde_json::Value::Null,
    };
    Ok(json)
}

fn json_to_lua_value(lua: &Lua, val: &serde_json::Value) -> LuaResult<Value> {
    match val {
        serde_json::Value::Null => Ok(Value::Nil),
        serde_json::Value::Bool(b) => Ok(Value::Boolean(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Integer(i))
            } else {
                Ok(Value::Number(n.as_f64().unwrap_or(0.0)))
            }
        }
        serde_json::Value::String(s) => Ok(Value::String(lua.create_string(s.as_str())?)),
        serde_json::Value::Array(arr) => {
            let t = lua.create_table()?;
            for (i, v) in arr.iter().enumerate() {
                t.set(i + 1, json_to_lua_value(lua, v)?)?;
            }
            Ok(Value::Table(t))
        }
        serde_json::Value::Object(obj) => {
            let t = lua.create_table()?;
            for (k, v) in obj {
                t.set(k.as_str(), json_to_lua_value(lua, v)?)?;
            }
            Ok(Value::Table(t))
        }
    }
}
