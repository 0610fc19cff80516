/// `scripting/` — user script repository and lifecycle
///
/// Scripts live in two scopes (global and per-character). Each running
/// script gets its own isolated Lua VM (mlua), keyed by script id.
/// `ScriptManager` drives everything; the UI talks to it through the
/// `EventBus`. Script errors are caught and logged, never propagated
/// into the host.
pub mod api;
pub mod conflict;
pub mod events;
pub mod executor;
pub mod manager;
pub mod notify;
pub mod sandbox;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;
