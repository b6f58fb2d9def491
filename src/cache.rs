use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::capabilities::kv::{KeyNamespace, KeyValueStore, KvKey};
use crate::error::CoreError;
use crate::model::{Project, Workspace, WorkspaceId};

/// Parent identifier under which a cached collection is keyed. Workspaces
/// live under the root scope; projects under their workspace.
pub type Scope = Option<WorkspaceId>;

fn scope_label(scope: Scope) -> String {
    match scope {
        Some(id) => format!("ws{id}"),
        None => "root".to_string(),
    }
}

/// Anything the reconciler can cache: identified by numeric id, belonging
/// to zero-or-one parent scope.
pub trait CacheEntity:
    Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Cache key segment, e.g. `projects`.
    const KIND: &'static str;

    fn entity_id(&self) -> u64;
    fn parent_scope(&self) -> Scope;
}

impl CacheEntity for Workspace {
    const KIND: &'static str = "workspaces";

    fn entity_id(&self) -> u64 {
        self.id.0
    }

    fn parent_scope(&self) -> Scope {
        None
    }
}

impl CacheEntity for Project {
    const KIND: &'static str = "projects";

    fn entity_id(&self) -> u64 {
        self.id.0
    }

    fn parent_scope(&self) -> Scope {
        self.workspace_id
    }
}

/// Handle for one initiated fetch. Results apply in initiation order:
/// a completion is discarded if a later-initiated fetch for the same scope
/// has already been applied.
#[derive(Debug, Clone, Copy)]
pub struct FetchTicket {
    scope: Scope,
    seq: u64,
}

impl FetchTicket {
    #[must_use]
    pub fn scope(&self) -> Scope {
        self.scope
    }
}

/// A single create/update/delete routed through the reconciler.
#[derive(Debug, Clone)]
pub enum EntityChange<T: CacheEntity> {
    Upserted(T),
    Deleted { scope: Scope, id: u64 },
}

struct CacheInner<T> {
    by_scope: HashMap<String, Vec<T>>,
    next_seq: HashMap<String, u64>,
    applied_seq: HashMap<String, u64>,
}

impl<T> Default for CacheInner<T> {
    fn default() -> Self {
        Self {
            by_scope: HashMap::new(),
            next_seq: HashMap::new(),
            applied_seq: HashMap::new(),
        }
    }
}

/// Scope-keyed entity cache. Server data is authoritative (last-write-wins);
/// the cache never resolves conflicts, it only guarantees that
///
/// 1. reconciling one scope leaves every other scope untouched, and
/// 2. a single-entity change lands in all three places — the in-memory
///    list, the scope-keyed persisted entry, and the aggregate persisted
///    entry — or, if persistence fails, in none of them.
pub struct EntityCache<T: CacheEntity> {
    kv: Arc<dyn KeyValueStore>,
    inner: RwLock<CacheInner<T>>,
}

impl<T: CacheEntity> EntityCache<T> {
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            inner: RwLock::new(CacheInner::default()),
        }
    }

    fn scoped_key(scope: Scope) -> Result<KvKey, CoreError> {
        Ok(KvKey::new(
            KeyNamespace::Cache,
            format!("{}:{}", T::KIND, scope_label(scope)),
        )?)
    }

    fn aggregate_key() -> Result<KvKey, CoreError> {
        Ok(KvKey::new(KeyNamespace::Cache, format!("{}:all", T::KIND))?)
    }

    async fn read_persisted(&self, key: &KvKey) -> Vec<T> {
        match self.kv.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(entities) => entities,
                Err(err) => {
                    warn!(key = %key.raw(), error = %err, "corrupt cache entry, treating as empty");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!(key = %key.raw(), error = %err, "cache read failed, treating as empty");
                Vec::new()
            }
        }
    }

    async fn write_persisted(&self, key: &KvKey, entities: &[T]) -> Result<(), CoreError> {
        let raw = serde_json::to_string(entities)?;
        self.kv.set(key, raw).await?;
        Ok(())
    }

    /// Replace the aggregate's view of one scope, leaving entries from
    /// other scopes alone.
    async fn write_aggregate_for_scope(
        &self,
        scope: Scope,
        entities: &[T],
    ) -> Result<(), CoreError> {
        let key = Self::aggregate_key()?;
        let mut aggregate = self.read_persisted(&key).await;
        aggregate.retain(|e| e.parent_scope() != scope);
        aggregate.extend_from_slice(entities);
        self.write_persisted(&key, &aggregate).await
    }

    /// Whatever is cached for the scope, without touching the network:
    /// memory first, then the persisted entry, then empty. Never blocks the
    /// UI on a fetch; live results arrive later through `complete_fetch`.
    pub async fn load(&self, scope: Scope) -> Vec<T> {
        let label = scope_label(scope);
        {
            let inner = self.inner.read().await;
            if let Some(entities) = inner.by_scope.get(&label) {
                return entities.clone();
            }
        }

        let persisted = match Self::scoped_key(scope) {
            Ok(key) => self.read_persisted(&key).await,
            Err(_) => Vec::new(),
        };

        let mut inner = self.inner.write().await;
        inner
            .by_scope
            .entry(label)
            .or_insert_with(|| persisted.clone());
        persisted
    }

    /// Record the initiation of a live fetch for the scope.
    pub async fn begin_fetch(&self, scope: Scope) -> FetchTicket {
        let mut inner = self.inner.write().await;
        let seq = inner
            .next_seq
            .entry(scope_label(scope))
            .and_modify(|s| *s += 1)
            .or_insert(1);
        FetchTicket { scope, seq: *seq }
    }

    /// Apply a completed fetch, unless a later-initiated fetch for the same
    /// scope already landed. Returns whether the result was applied.
    pub async fn complete_fetch(
        &self,
        ticket: FetchTicket,
        fresh: Vec<T>,
    ) -> Result<bool, CoreError> {
        let label = scope_label(ticket.scope);
        let mut inner = self.inner.write().await;

        let applied = inner.applied_seq.get(&label).copied().unwrap_or(0);
        if ticket.seq <= applied {
            debug!(
                kind = T::KIND,
                scope = %label,
                seq = ticket.seq,
                applied,
                "stale fetch completion discarded"
            );
            return Ok(false);
        }

        self.reconcile_locked(&mut inner, ticket.scope, fresh).await?;
        inner.applied_seq.insert(label, ticket.seq);
        Ok(true)
    }

    /// Replace the cached set for exactly this scope. Entities cached under
    /// other scopes are untouched.
    pub async fn reconcile(&self, scope: Scope, fresh: Vec<T>) -> Result<(), CoreError> {
        let label = scope_label(scope);
        let mut inner = self.inner.write().await;

        // A direct reconcile carries fresh server data: it supersedes any
        // fetch initiated earlier that has not completed yet.
        let seq = inner
            .next_seq
            .entry(label.clone())
            .and_modify(|s| *s += 1)
            .or_insert(1);
        let seq = *seq;

        self.reconcile_locked(&mut inner, scope, fresh).await?;
        inner.applied_seq.insert(label, seq);
        Ok(())
    }

    async fn reconcile_locked(
        &self,
        inner: &mut CacheInner<T>,
        scope: Scope,
        fresh: Vec<T>,
    ) -> Result<(), CoreError> {
        let label = scope_label(scope);
        let previous = inner.by_scope.insert(label.clone(), fresh.clone());

        let result = async {
            self.write_persisted(&Self::scoped_key(scope)?, &fresh).await?;
            self.write_aggregate_for_scope(scope, &fresh).await
        }
        .await;

        if let Err(err) = result {
            // Memory must not run ahead of the persisted caches.
            match previous {
                Some(prev) => inner.by_scope.insert(label, prev),
                None => inner.by_scope.remove(&label),
            };
            return Err(err);
        }

        debug!(kind = T::KIND, scope = %scope_label(scope), count = fresh.len(), "scope reconciled");
        Ok(())
    }

    /// Patch one entity through all three caches. Applied to memory first
    /// and rolled back if persistence fails.
    pub async fn apply_change(&self, change: EntityChange<T>) -> Result<(), CoreError> {
        let (scope, id) = match &change {
            EntityChange::Upserted(entity) => (entity.parent_scope(), entity.entity_id()),
            EntityChange::Deleted { scope, id } => (*scope, *id),
        };
        let label = scope_label(scope);
        let mut inner = self.inner.write().await;

        let mut list = match inner.by_scope.get(&label) {
            Some(list) => list.clone(),
            // Scope not in memory yet: start from the persisted entry so
            // the patch does not erase siblings.
            None => {
                let key = Self::scoped_key(scope)?;
                self.read_persisted(&key).await
            }
        };
        list.retain(|e| e.entity_id() != id);
        if let EntityChange::Upserted(entity) = &change {
            list.push(entity.clone());
        }

        let previous = inner.by_scope.insert(label.clone(), list.clone());

        let result = async {
            self.write_persisted(&Self::scoped_key(scope)?, &list).await?;

            let key = Self::aggregate_key()?;
            let mut aggregate = self.read_persisted(&key).await;
            aggregate.retain(|e| e.entity_id() != id);
            if let EntityChange::Upserted(entity) = &change {
                aggregate.push(entity.clone());
            }
            self.write_persisted(&key, &aggregate).await
        }
        .await;

        if let Err(err) = result {
            match previous {
                Some(prev) => inner.by_scope.insert(label, prev),
                None => inner.by_scope.remove(&label),
            };
            return Err(err);
        }

        Ok(())
    }

    /// Drop everything this cache knows about, memory and persisted. Scopes
    /// never loaded this run are discovered through the aggregate entry so
    /// their persisted keys do not outlive the session.
    pub async fn clear(&self) -> Result<(), CoreError> {
        let mut inner = self.inner.write().await;

        let mut labels: HashSet<String> = inner.by_scope.keys().cloned().collect();
        for entity in self.read_persisted(&Self::aggregate_key()?).await {
            labels.insert(scope_label(entity.parent_scope()));
        }
        for label in &labels {
            let key = KvKey::new(KeyNamespace::Cache, format!("{}:{label}", T::KIND))?;
            self.kv.remove(&key).await?;
        }
        self.kv.remove(&Self::aggregate_key()?).await?;

        inner.by_scope.clear();
        inner.next_seq.clear();
        inner.applied_seq.clear();
        Ok(())
    }

    /// The persisted aggregate ("all entities") entry.
    pub async fn aggregate(&self) -> Vec<T> {
        match Self::aggregate_key() {
            Ok(key) => self.read_persisted(&key).await,
            Err(_) => Vec::new(),
        }
    }
}
