//! Task-to-sandbox registry.
//!
//! Maps task ids to live sandbox handles for the lifetime of the process.
//! The registry is an explicit value handed to whoever needs it; nothing is
//! global. It is not the source of truth for container existence: the
//! runtime is, and [`SandboxRegistry::get_or_reconnect`] consults it when a
//! task is unknown here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};
use crate::sandbox::{ContainerProvider, ContainerSandbox, SandboxStatus};

#[derive(Clone)]
struct Entry {
    sandbox: Arc<ContainerSandbox>,
    keep_alive: bool,
}

/// What [`SandboxRegistry::end_session`] did with a task's sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The sandbox was stopped and unregistered.
    Stopped,
    /// The task asked to keep its sandbox; it is still running and registered.
    KeptAlive,
    /// No sandbox was registered for the task.
    NotRegistered,
}

/// Process-wide map from task id to sandbox.
pub struct SandboxRegistry {
    provider: ContainerProvider,
    entries: Mutex<HashMap<String, Entry>>,
}

impl SandboxRegistry {
    /// Creates an empty registry that reconnects through `provider`.
    pub fn new(provider: ContainerProvider) -> Self {
        Self {
            provider,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records `sandbox` for `task_id`, replacing any previous entry.
    ///
    /// Without `keep_alive`, [`end_session`](Self::end_session) stops the
    /// sandbox; with it, the sandbox outlives the session.
    pub fn register(&self, task_id: &str, sandbox: Arc<ContainerSandbox>, keep_alive: bool) {
        tracing::debug!(
            task_id = %task_id,
            sandbox_id = %sandbox.id(),
            keep_alive,
            "registering sandbox"
        );
        self.entries()
            .insert(task_id.to_string(), Entry { sandbox, keep_alive });
    }

    /// Returns the sandbox registered for `task_id`.
    ///
    /// A registered sandbox that has since stopped (its timeout fired, or it
    /// was stopped directly) is dropped from the registry and not returned.
    pub fn get(&self, task_id: &str) -> Option<Arc<ContainerSandbox>> {
        let mut entries = self.entries();
        let sandbox = entries.get(task_id)?.sandbox.clone();
        if sandbox.status() == SandboxStatus::Stopped {
            tracing::debug!(
                task_id = %task_id,
                sandbox_id = %sandbox.id(),
                "dropping stopped sandbox"
            );
            entries.remove(task_id);
            return None;
        }
        Some(sandbox)
    }

    /// Returns the registered sandbox, or rebuilds it from the runtime.
    ///
    /// `Ok(None)` means the runtime has no such container (the sandbox
    /// expired). Other runtime failures are errors.
    pub async fn get_or_reconnect(
        &self,
        task_id: &str,
        sandbox_id: &str,
    ) -> Result<Option<Arc<ContainerSandbox>>> {
        if let Some(sandbox) = self.get(task_id) {
            return Ok(Some(sandbox));
        }

        match self.provider.get(sandbox_id).await {
            Ok(sandbox) => {
                // A reconnected task keeps its sandbox until told otherwise.
                self.register(task_id, sandbox.clone(), true);
                Ok(Some(sandbox))
            }
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Removes the mapping without stopping the sandbox.
    pub fn unregister(&self, task_id: &str) -> Option<Arc<ContainerSandbox>> {
        self.entries().remove(task_id).map(|e| e.sandbox)
    }

    /// Applies the keep-alive policy when a task's session ends.
    pub async fn end_session(&self, task_id: &str) -> Result<SessionEnd> {
        let entry = match self.entries().get(task_id).cloned() {
            Some(entry) => entry,
            None => return Ok(SessionEnd::NotRegistered),
        };

        if entry.keep_alive {
            tracing::info!(
                task_id = %task_id,
                sandbox_id = %entry.sandbox.id(),
                "keeping sandbox alive after session"
            );
            return Ok(SessionEnd::KeptAlive);
        }

        entry.sandbox.stop().await?;
        self.unregister(task_id);
        Ok(SessionEnd::Stopped)
    }

    /// Stops and unregisters the task's sandbox regardless of keep-alive.
    pub async fn stop(&self, task_id: &str) -> Result<bool> {
        let sandbox = match self.get(task_id) {
            Some(sandbox) => sandbox,
            None => return Ok(false),
        };
        sandbox.stop().await?;
        self.unregister(task_id);
        Ok(true)
    }

    /// Returns the ids of all registered tasks.
    pub fn task_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Returns the provider used for reconnection.
    pub fn provider(&self) -> &ContainerProvider {
        &self.provider
    }
}
