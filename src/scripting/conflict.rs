/// `scripting/conflict.rs` — id collision resolution
///
/// Importing or moving a script whose id is already taken asks the user
/// what to do: mint a new id, override the existing script, or cancel.
/// The question travels to the UI over a channel so the lifecycle code
/// never depends on a concrete popup.
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use super::types::{Script, ScriptType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictAction {
    /// Give the incoming script a fresh id; the existing one is untouched.
    New,
    /// Delete the existing script from its own scope, then store the incoming one.
    Override,
    /// Abort without changing anything.
    Cancel,
}

impl ConflictAction {
    /// Popup button index: 0 = cancel, 1 = ok (override), 2 = custom (new).
    pub fn from_choice(choice: Option<usize>) -> Self {
        match choice {
            Some(1) => ConflictAction::Override,
            Some(2) => ConflictAction::New,
            _ => ConflictAction::Cancel,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    Import,
    Move,
}

/// Everything the resolver may show the user.
#[derive(Debug, Clone)]
pub struct ConflictRequest<'a> {
    pub kind: ConflictKind,
    pub incoming: &'a Script,
    pub existing: &'a Script,
    /// Scope the existing script actually lives in.
    pub existing_scope: ScriptType,
    /// Scope the incoming script is headed for.
    pub target_scope: ScriptType,
}

impl ConflictRequest<'_> {
    pub fn message(&self) -> String {
        let verb = match self.kind {
            ConflictKind::Import => "Imported",
            ConflictKind::Move => "Moved",
        };
        format!(
            "{verb} script '{}' has the same id as '{}' in the {} script library. Continue?",
            self.incoming.name, self.existing.name, self.existing_scope,
        )
    }
}

pub trait ConflictResolver: Send + Sync {
    fn resolve<'a>(&'a self, request: ConflictRequest<'a>) -> BoxFuture<'a, ConflictAction>;
}

// ── Prompt-backed resolver ────────────────────────────────────────────────────

pub const CONFLICT_OPTIONS: [&str; 3] = ["Cancel", "Override existing script", "Create as new script"];

/// Interactive three-way choice. `None` means the prompt was dismissed.
pub trait Prompt: Send + Sync {
    fn choose<'a>(&'a self, message: String, options: &'a [&'static str]) -> BoxFuture<'a, Option<usize>>;
}

pub struct PromptResolver<P> {
    prompt: P,
}

impl<P: Prompt> PromptResolver<P> {
    pub fn new(prompt: P) -> Self {
        Self { prompt }
    }
}

impl<P: Prompt> ConflictResolver for PromptResolver<P> {
    fn resolve<'a>(&'a self, request: ConflictRequest<'a>) -> BoxFuture<'a, ConflictAction> {
        Box::pin(async move {
            let choice = self.prompt.choose(request.message(), &CONFLICT_OPTIONS).await;
            let action = ConflictAction::from_choice(choice);
            log::info!(
                "[script_manager] id conflict on '{}' ({} -> {}): {:?}",
                request.incoming.id,
                request.existing_scope,
                request.target_scope,
                action
            );
            action
        })
    }
}

/// A question waiting for the UI.
#[derive(Debug)]
pub struct PromptRequest {
    pub message: String,
    pub options: Vec<String>,
    pub reply: oneshot::Sender<usize>,
}

/// Sends each question to whoever holds the receiving end and waits for
/// the answer. A dropped receiver or reply counts as a dismissal.
#[derive(Clone)]
pub struct ChannelPrompt {
    tx: mpsc::Sender<PromptRequest>,
}

impl ChannelPrompt {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PromptRequest>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

impl Prompt for ChannelPrompt {
    fn choose<'a>(&'a self, message: String, options: &'a [&'static str]) -> BoxFuture<'a, Option<usize>> {
        Box::pin(async move {
            let (reply, answer) = oneshot::channel();
            let request = PromptRequest {
                message,
                options: options.iter().map(|o| o.to_string()).collect(),
                reply,
            };
            if self.tx.send(request).await.is_err() {
                log::warn!("[script_manager] no prompt listener, treating conflict as cancelled");
                return None;
            }
            answer.await.ok()
        })
    }
}

/// Always answers the same way.
#[derive(Debug, Clone, Copy)]
pub struct FixedResolver(pub ConflictAction);

impl ConflictResolver for FixedResolver {
    fn resolve<'a>(&'a self, _request: ConflictRequest<'a>) -> BoxFuture<'a, ConflictAction> {
        Box::pin(async move { self.0 })
    }
}
