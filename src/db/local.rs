use sqlx::{
    sqlite::{SqlitePool, SqlitePoolOptions},
    Row,
};

use crate::scripting::types::{Script, ScriptType};

/// Initialise (or migrate) the local SQLite database at `db_path`.
/// Creates all tables if they don't exist.
pub async fn init_db(db_path: &str) -> Result<SqlitePool, sqlx::Error> {
    let url = format!("sqlite:{db_path}?mode=rwc");
    let pool = SqlitePool::connect(&url).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Private in-memory database. A single connection, since every new
/// connection to `:memory:` would see an empty database.
pub async fn init_memory_db() -> Result<SqlitePool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scripts (
            scope       TEXT    NOT NULL,
            owner       TEXT    NOT NULL DEFAULT '',
            position    INTEGER NOT NULL,
            id          TEXT    NOT NULL,
            script_json TEXT    NOT NULL,
            updated_at  INTEGER NOT NULL DEFAULT (strftime('%s','now')),
            PRIMARY KEY (scope, owner, id)
        );

        CREATE TABLE IF NOT EXISTS script_scope_state (
            scope   TEXT    NOT NULL,
            owner   TEXT    NOT NULL DEFAULT '',
            enabled INTEGER NOT NULL,
            PRIMARY KEY (scope, owner)
        );

        CREATE TABLE IF NOT EXISTS extension_settings (
            id          INTEGER PRIMARY KEY DEFAULT 1,
            config_json TEXT    NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

// ── Scripts ──────────────────────────────────────────────────────────────────

/// Raw rows for one collection, in display order.
pub async fn load_script_rows(
    pool: &SqlitePool,
    scope: ScriptType,
    owner: &str,
) -> Result<Vec<String>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT script_json FROM scripts WHERE scope = ? AND owner = ? ORDER BY position ASC",
    )
    .bind(scope.as_str())
    .bind(owner)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(|r| r.get::<String, _>("script_json")).collect())
}

/// Serialise a collection into `(id, script_json)` rows, in list order.
pub fn encode_scripts(scripts: &[Script]) -> Result<Vec<(String, String)>, serde_json::Error> {
    scripts
        .iter()
        .map(|s| Ok((s.id.clone(), serde_json::to_string(s)?)))
        .collect()
}

/// One collection to write: scope, owner key, and `(id, script_json)` rows.
pub type CollectionRows = (ScriptType, String, Vec<(String, String)>);

/// Replace each collection wholesale in a single transaction, keeping row
/// order in `position`.
pub async fn replace_collections(pool: &SqlitePool, collections: &[CollectionRows]) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for (scope, owner, rows) in collections {
        sqlx::query("DELETE FROM scripts WHERE scope = ? AND owner = ?")
            .bind(scope.as_str())
            .bind(owner)
            .execute(&mut *tx)
            .await?;

        for (position, (id, json)) in rows.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO scripts (scope, owner, position, id, script_json)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(scope.as_str())
            .bind(owner)
            .bind(position as i64)
            .bind(id)
            .bind(json)
            .execute(&mut *tx)
            .await?;
        }
    }
    tx.commit().await?;
    Ok(())
}

// ── Scope flags ──────────────────────────────────────────────────────────────

pub async fn load_scope_enabled(
    pool: &SqlitePool,
    scope: ScriptType,
    owner: &str,
) -> Result<Option<bool>, sqlx::Error> {
    let row = sqlx::query("SELECT enabled FROM script_scope_state WHERE scope = ? AND owner = ?")
        .bind(scope.as_str())
        .bind(owner)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.get::<i64, _>("enabled") != 0))
}

pub async fn save_scope_enabled(
    pool: &SqlitePool,
    scope: ScriptType,
    owner: &str,
    enabled: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO script_scope_state (scope, owner, enabled) VALUES (?, ?, ?)
        ON CONFLICT(scope, owner) DO UPDATE SET enabled = excluded.enabled
        "#,
    )
    .bind(scope.as_str())
    .bind(owner)
    .bind(enabled as i64)
    .execute(pool)
    .await?;
    Ok(())
}

// ── Extension settings ───────────────────────────────────────────────────────

pub async fn load_settings(pool: &SqlitePool) -> Result<Option<String>, sqlx::Error> {
    let row = sqlx::query("SELECT config_json FROM extension_settings WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.get::<String, _>("config_json")))
}

pub async fn save_settings(pool: &SqlitePool, json: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO extension_settings (id, config_json) VALUES (1, ?)
        ON CONFLICT(id) DO UPDATE SET config_json = excluded.config_json
        "#,
    )
    .bind(json)
    .execute(pool)
    .await?;
    Ok(())
}
