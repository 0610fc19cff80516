/// `scripting/events.rs` — in-process event bus for the script repository
///
/// UI, importers and slash commands publish intents here instead of calling
/// the manager directly. Handlers are invoked in registration order; each
/// handler's future is spawned and never awaited by the bus.
/// Every published event is also copied onto a broadcast tap for observers.
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::types::{Script, ScriptType};

/// An exported script file handed to the importer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSource {
    pub file_name: String,
    pub contents: String,
}

impl ImportSource {
    pub fn new(file_name: impl Into<String>, contents: impl Into<String>) -> Self {
        Self { file_name: file_name.into(), contents: contents.into() }
    }

    pub async fn from_path(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path).await?;
        Ok(Self {
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            contents,
        })
    }
}

/// Payload of `ui-refresh`. Serialises with an `action` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum UiRefresh {
    ScriptToggled { script: Script, scope: ScriptType, enable: bool },
    TypeToggled { scope: ScriptType, enable: bool },
    ScriptImported { script: Script, scope: ScriptType },
    ScriptSaved { script: Script, scope: ScriptType },
    ScriptDeleted { script_id: String, scope: ScriptType },
    ScriptMoved { script: Script, from: ScriptType, to: ScriptType },
    CharacterSwitched { character: String },
}

impl UiRefresh {
    pub fn action(&self) -> &'static str {
        match self {
            UiRefresh::ScriptToggled { .. } => "script_toggled",
            UiRefresh::TypeToggled { .. } => "type_toggled",
            UiRefresh::ScriptImported { .. } => "script_imported",
            UiRefresh::ScriptSaved { .. } => "script_saved",
            UiRefresh::ScriptDeleted { .. } => "script_deleted",
            UiRefresh::ScriptMoved { .. } => "script_moved",
            UiRefresh::CharacterSwitched { .. } => "character_switched",
        }
    }
}

/// Everything that travels over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RepositoryEvent {
    ScriptToggle {
        script: Script,
        scope: ScriptType,
        enable: bool,
        #[serde(default = "user_input_default")]
        user_input: bool,
    },
    TypeToggle {
        scope: ScriptType,
        enable: bool,
        #[serde(default = "user_input_default")]
        user_input: bool,
    },
    ScriptImport { file: ImportSource, scope: ScriptType },
    ScriptDelete { script_id: String, scope: ScriptType },
    ScriptSave { script: Script, scope: ScriptType },
    ScriptMove { script: Script, from: ScriptType },
    CharacterChanged { character: String },
    UiLoaded,
    UiRefresh(UiRefresh),
    ButtonAdd { script: Script },
    ButtonRemove { script_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ScriptToggle,
    TypeToggle,
    ScriptImport,
    ScriptDelete,
    ScriptSave,
    ScriptMove,
    CharacterChanged,
    UiLoaded,
    UiRefresh,
    ButtonAdd,
    ButtonRemove,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ScriptToggle => "script-toggle",
            EventKind::TypeToggle => "scope-toggle",
            EventKind::ScriptImport => "script-import",
            EventKind::ScriptDelete => "script-delete",
            EventKind::ScriptSave => "script-save",
            EventKind::ScriptMove => "script-move",
            EventKind::CharacterChanged => "character-changed",
            EventKind::UiLoaded => "ui-loaded",
            EventKind::UiRefresh => "ui-refresh",
            EventKind::ButtonAdd => "button-add",
            EventKind::ButtonRemove => "button-remove",
        }
    }
}

impl RepositoryEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RepositoryEvent::ScriptToggle { .. } => EventKind::ScriptToggle,
            RepositoryEvent::TypeToggle { .. } => EventKind::TypeToggle,
            RepositoryEvent::ScriptImport { .. } => EventKind::ScriptImport,
            RepositoryEvent::ScriptDelete { .. } => EventKind::ScriptDelete,
            RepositoryEvent::ScriptSave { .. } => EventKind::ScriptSave,
            RepositoryEvent::ScriptMove { .. } => EventKind::ScriptMove,
            RepositoryEvent::CharacterChanged { .. } => EventKind::CharacterChanged,
            RepositoryEvent::UiLoaded => EventKind::UiLoaded,
            RepositoryEvent::UiRefresh(_) => EventKind::UiRefresh,
            RepositoryEvent::ButtonAdd { .. } => EventKind::ButtonAdd,
            RepositoryEvent::ButtonRemove { .. } => EventKind::ButtonRemove,
        }
    }
}

fn user_input_default() -> bool {
    true
}

// ── EventBus ──────────────────────────────────────────────────────────────────

pub type SubscriptionId = u64;

type EventHandler = Arc<dyn Fn(RepositoryEvent) -> BoxFuture<'static, ()> + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    kind: EventKind,
    handler: EventHandler,
}

struct BusInner {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
    tap_tx: broadcast::Sender<RepositoryEvent>,
}

/// Shared handle, cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tap_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(BusInner {
                subscriptions: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                tap_tx,
            }),
        }
    }

    /// Register `handler` for every event of `kind`.
    pub fn subscribe<F, Fut>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(RepositoryEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: EventHandler = Arc::new(move |event| Box::pin(handler(event)));
        self.lock_subscriptions().push(Subscription { id, kind, handler });
        id
    }

    /// Returns false when the subscription was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.lock_subscriptions();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.lock_subscriptions().iter().filter(|s| s.kind == kind).count()
    }

    /// Dispatch `event` to every handler of its kind. Must be called from
    /// inside a tokio runtime; otherwise handlers are skipped with a warning.
    pub fn publish(&self, event: RepositoryEvent) {
        let kind = event.kind();
        let _ = self.inner.tap_tx.send(event.clone());

        let handlers: Vec<EventHandler> = self
            .lock_subscriptions()
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| Arc::clone(&s.handler))
            .collect();
        if handlers.is_empty() {
            return;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(h) => h,
            Err(_) => {
                log::warn!("[events] no async runtime, dropping '{}' for {} handler(s)", kind.as_str(), handlers.len());
                return;
            }
        };
        for handler in handlers {
            runtime.spawn(handler(event.clone()));
        }
    }

    /// Observe every published event, in publish order.
    pub fn tap(&self) -> broadcast::Receiver<RepositoryEvent> {
        self.inner.tap_tx.subscribe()
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, Vec<Subscription>> {
        self.inner.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
