pub mod config;
pub mod db;
pub mod error;
pub mod scripting;
pub mod state;

use config::ExtensionSettings;
use error::{Result, StoreError};
use scripting::store::ScriptData;
use state::AppState;

/// Route `log` output to stderr. `RUST_LOG` overrides the `info` default.
/// Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();
}

/// Open (or create) the database under `app_data_dir`, load settings and
/// scripts, and assemble an attached `AppState`. Scripts are not started
/// until the UI publishes `ui-loaded`.
pub async fn start(app_data_dir: &str) -> Result<AppState> {
    tokio::fs::create_dir_all(app_data_dir).await.map_err(StoreError::from)?;
    let db_path = format!("{app_data_dir}/scripts.db");

    let pool = db::local::init_db(&db_path).await.map_err(StoreError::from)?;
    log::info!("[startup] local database ready at {}", db_path);

    let settings = match db::local::load_settings(&pool).await {
        Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
            log::warn!("[startup] stored settings unreadable, using defaults: {}", e);
            ExtensionSettings::default()
        }),
        Ok(None) => ExtensionSettings::default(),
        Err(e) => {
            // Non-fatal; the app works with defaults
            log::warn!("[startup] failed to load settings (continuing): {}", e);
            ExtensionSettings::default()
        }
    };

    let store = ScriptData::with_local_db(
        pool.clone(),
        settings.global_scripts_enabled,
        settings.character_scripts_enabled,
    )
    .await?;
    log::info!(
        "[startup] {} global script(s) loaded, extension {}",
        scripting::store::ScriptStore::global_scripts(&store).len(),
        if settings.enabled_extension { "enabled" } else { "disabled" }
    );

    Ok(AppState::new(settings, store).with_local_db(pool))
}

/// `start` in the platform's application data directory.
pub async fn start_default() -> Result<AppState> {
    start(&config::compute_app_data_dir()).await
}
