/// `scripting/testing.rs` — test doubles shared by the scripting unit tests
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use futures_util::future::BoxFuture;

use super::{
    conflict::{ConflictAction, ConflictResolver, ConflictRequest},
    sandbox::{SandboxHandle, SandboxHost, SandboxPayload},
};
use crate::error::SandboxError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxOp {
    Created(String),
    Destroyed(String),
}

/// In-memory host that records every operation. Unlike the Lua host it
/// accepts duplicate live instances, so overlap shows up in `max_live_for`.
#[derive(Default)]
pub struct RecordingSandbox {
    live: Mutex<HashMap<String, Vec<SandboxHandle>>>,
    max_live: Mutex<HashMap<String, usize>>,
    ops: Mutex<Vec<SandboxOp>>,
    payloads: Mutex<HashMap<String, SandboxPayload>>,
    failing_create: Mutex<HashSet<String>>,
    failing_destroy: Mutex<HashSet<String>>,
    forgotten: Mutex<Vec<String>>,
    next: AtomicU64,
}

impl RecordingSandbox {
    pub fn fail_create(&self, key: &str) {
        self.failing_create.lock().unwrap().insert(key.to_string());
    }

    pub fn fail_destroy(&self, key: &str) {
        self.failing_destroy.lock().unwrap().insert(key.to_string());
    }

    pub fn live_count(&self, key: &str) -> usize {
        self.live.lock().unwrap().get(key).map_or(0, Vec::len)
    }

    pub fn max_live_for(&self, key: &str) -> usize {
        self.max_live.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub fn ops(&self) -> Vec<SandboxOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn created(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                SandboxOp::Created(k) => Some(k),
                SandboxOp::Destroyed(_) => None,
            })
            .collect()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                SandboxOp::Destroyed(k) => Some(k),
                SandboxOp::Created(_) => None,
            })
            .collect()
    }

    pub fn live_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .live
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn last_payload(&self, key: &str) -> Option<SandboxPayload> {
        self.payloads.lock().unwrap().get(key).cloned()
    }

    pub fn forgotten(&self) -> Vec<String> {
        self.forgotten.lock().unwrap().clone()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().unwrap().clear();
    }
}

impl SandboxHost for RecordingSandbox {
    fn create<'a>(
        &'a self,
        key: &'a str,
        payload: SandboxPayload,
    ) -> BoxFuture<'a, Result<SandboxHandle, SandboxError>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            if self.failing_create.lock().unwrap().contains(key) {
                return Err(SandboxError::Script {
                    script_id: key.to_string(),
                    message: "boom".to_string(),
                });
            }
            let handle = SandboxHandle {
                key: key.to_string(),
                instance: self.next.fetch_add(1, Ordering::Relaxed),
            };
            let count = {
                let mut live = self.live.lock().unwrap();
                let entry = live.entry(key.to_string()).or_default();
                entry.push(handle.clone());
                entry.len()
            };
            let mut max = self.max_live.lock().unwrap();
            let slot = max.entry(key.to_string()).or_default();
            *slot = (*slot).max(count);
            drop(max);
            self.payloads.lock().unwrap().insert(key.to_string(), payload);
            self.ops.lock().unwrap().push(SandboxOp::Created(key.to_string()));
            Ok(handle)
        })
    }

    fn find_by_key(&self, key: &str) -> Option<SandboxHandle> {
        self.live.lock().unwrap().get(key).and_then(|v| v.last().cloned())
    }

    fn destroy(&self, handle: SandboxHandle) -> BoxFuture<'_, Result<(), SandboxError>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            if let Some(v) = self.live.lock().unwrap().get_mut(&handle.key) {
                v.retain(|h| h != &handle);
            }
            self.ops.lock().unwrap().push(SandboxOp::Destroyed(handle.key.clone()));
            if self.failing_destroy.lock().unwrap().contains(&handle.key) {
                return Err(SandboxError::Script {
                    script_id: handle.key,
                    message: "teardown failed".to_string(),
                });
            }
            Ok(())
        })
    }

    fn handles(&self) -> Vec<SandboxHandle> {
        self.live.lock().unwrap().values().flatten().cloned().collect()
    }

    fn forget(&self, key: &str) {
        self.forgotten.lock().unwrap().push(key.to_string());
    }
}

/// Answers from a queue, then falls back to a default; counts calls.
pub struct ScriptedResolver {
    answers: Mutex<Vec<ConflictAction>>,
    fallback: ConflictAction,
    pub calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl ScriptedResolver {
    pub fn always(action: ConflictAction) -> Self {
        Self {
            answers: Mutex::new(Vec::new()),
            fallback: action,
            calls: Arc::default(),
        }
    }

    pub fn sequence(answers: Vec<ConflictAction>, fallback: ConflictAction) -> Self {
        Self {
            answers: Mutex::new(answers),
            fallback,
            calls: Arc::default(),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl ConflictResolver for ScriptedResolver {
    fn resolve<'a>(&'a self, request: ConflictRequest<'a>) -> BoxFuture<'a, ConflictAction> {
        Box::pin(async move {
            self.calls.lock().unwrap().push((
                request.existing_scope.to_string(),
                request.target_scope.to_string(),
            ));
            let mut answers = self.answers.lock().unwrap();
            if answers.is_empty() {
                self.fallback
            } else {
                answers.remove(0)
            }
        })
    }
}
