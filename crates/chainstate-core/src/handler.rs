//! Write hooks, the hook registry, and the entity-kind registry.
//!
//! Hooks are plain trait objects called synchronously by the indexer after a
//! transaction commits, so they never observe writes that were rolled back.
//! The entity-kind registry is built once at startup and shared read-only.

use std::collections::HashMap;
use std::sync::Arc;

use crate::entity::VersionedEntity;
use crate::error::IndexerError;
use crate::reorg::ReorgEvent;

/// Emitted for every entity version written through `apply_mutation`.
#[derive(Debug, Clone)]
pub struct WriteEvent {
    pub version: VersionedEntity,
    /// `true` if the version is now the entity's latest.
    pub became_latest: bool,
}

/// Observer of committed writes (e.g. the query-serving layer).
pub trait WriteHook: Send + Sync {
    /// Called once per committed entity version.
    fn on_write(&self, event: &WriteEvent);

    /// Called after a reorg has been resolved and committed.
    fn on_reorg(&self, _event: &ReorgEvent) {}
}

/// Registry of write hooks.
#[derive(Default, Clone)]
pub struct HookRegistry {
    hooks: Vec<Arc<dyn WriteHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook.
    pub fn register(&mut self, hook: Arc<dyn WriteHook>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Dispatch committed writes to every hook.
    pub fn dispatch_writes(&self, events: &[WriteEvent]) {
        for event in events {
            for hook in &self.hooks {
                hook.on_write(event);
            }
        }
    }

    /// Dispatch a resolved reorg to every hook.
    pub fn dispatch_reorg(&self, event: &ReorgEvent) {
        for hook in &self.hooks {
            hook.on_reorg(event);
        }
    }
}

// ─── EntityKindRegistry ───────────────────────────────────────────────────────

/// How the store projects a kind's versions into the latest view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatestProjection {
    /// Maintain a latest pointer per entity id.
    Tracked,
    /// Keep versions only (append-only kinds such as event logs).
    VersionsOnly,
}

/// Known entity kinds and their latest-view projection.
#[derive(Debug, Clone, Default)]
pub struct EntityKindRegistry {
    kinds: HashMap<String, LatestProjection>,
}

impl EntityKindRegistry {
    pub fn builder() -> EntityKindRegistryBuilder {
        EntityKindRegistryBuilder::default()
    }

    pub fn projection(&self, kind: &str) -> Option<LatestProjection> {
        self.kinds.get(kind).copied()
    }

    /// Returns whether `kind` keeps a latest pointer; errors for unregistered kinds.
    pub fn tracks_latest(&self, kind: &str) -> Result<bool, IndexerError> {
        match self.projection(kind) {
            Some(p) => Ok(p == LatestProjection::Tracked),
            None => Err(IndexerError::UnknownEntityKind(kind.to_string())),
        }
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }
}

/// Builder for [`EntityKindRegistry`].
#[derive(Debug, Default)]
pub struct EntityKindRegistryBuilder {
    kinds: HashMap<String, LatestProjection>,
}

impl EntityKindRegistryBuilder {
    /// Register a kind with a tracked latest view.
    pub fn kind(mut self, name: impl Into<String>) -> Self {
        self.kinds.insert(name.into(), LatestProjection::Tracked);
        self
    }

    /// Register an append-only kind.
    pub fn versions_only(mut self, name: impl Into<String>) -> Self {
        self.kinds.insert(name.into(), LatestProjection::VersionsOnly);
        self
    }

    pub fn build(self) -> EntityKindRegistry {
        EntityKindRegistry { kinds: self.kinds }
    }
}
