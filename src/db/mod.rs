/// `db/` — local SQLite persistence for scripts, scope flags and settings
pub mod local;
