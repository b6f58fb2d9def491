//! Session lifecycle: login, startup restoration, connectivity-driven state
//! transitions, offline-aware mutations, and logout.
//!
//! The controller is the only writer of session state. The shell consumes it
//! through a `watch` channel carrying [`SessionView`] values; it never calls
//! the remote API or the store directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::cache::{EntityCache, EntityChange, Scope};
use crate::capabilities::api::{endpoints, ApiError, Credentials, HttpMethod, RemoteApi};
use crate::capabilities::kv::{KeyNamespace, KeyValueStore, KvKey};
use crate::config::CoreConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::CoreError;
use crate::model::{
    Project, ProjectId, SessionSnapshot, StoredCredentials, UnixTimeMs, UserProfile, Workspace,
    WorkspaceId,
};
use crate::offline::{OfflineManager, OfflinePhase};
use crate::outbox::{self, Operation};

fn credentials_key() -> KvKey {
    KvKey::well_known(KeyNamespace::Credentials, "tokens")
}

fn snapshot_key() -> KvKey {
    KvKey::well_known(KeyNamespace::Session, "snapshot")
}

/// Why there is no authenticated session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnauthReason {
    /// Never logged in, or nothing restorable was found.
    NoSession,
    /// The user logged out.
    LoggedOut,
    /// Tokens were rejected and could not be refreshed, or the offline
    /// grace period ran out.
    SessionExpired,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SessionState {
    Unauthenticated(UnauthReason),
    Authenticated(UserProfile),
}

impl SessionState {
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_))
    }
}

/// One-shot messages the shell surfaces as banners or toasts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    WorkingOffline { days_remaining: u32 },
    BackOnline { replayed: usize, requeued: usize },
    QueuedForSync { pending: usize },
    GraceExpired,
}

/// Everything the shell needs to render the session indicator. Published on
/// every state change; `notice` is set only on the transition that caused it.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionView {
    pub state: SessionState,
    pub offline: bool,
    pub days_remaining: u32,
    pub pending_operations: usize,
    pub last_sync: Option<UnixTimeMs>,
    pub notice: Option<Notice>,
}

impl SessionView {
    fn initial(grace_period_ms: u64) -> Self {
        Self {
            state: SessionState::Unauthenticated(UnauthReason::NoSession),
            offline: false,
            days_remaining: u32::try_from(grace_period_ms.div_ceil(crate::MS_PER_DAY))
                .unwrap_or(u32::MAX),
            pending_operations: 0,
            last_sync: None,
            notice: None,
        }
    }
}

/// Result of a mutation: applied against the live backend now, or queued for
/// replay once connectivity returns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MutationOutcome<T> {
    Applied(T),
    Queued { pending: usize },
}

impl<T> MutationOutcome<T> {
    #[must_use]
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }
}

pub struct SessionController {
    config: CoreConfig,
    kv: Arc<dyn KeyValueStore>,
    api: Arc<dyn RemoteApi>,
    offline: OfflineManager,
    workspaces: EntityCache<Workspace>,
    projects: EntityCache<Project>,
    monitor: ConnectivityMonitor,
    /// Bumped on logout so probes and replays started under the previous
    /// session cannot apply their results to the next one.
    epoch: AtomicU64,
    state: RwLock<SessionState>,
    view_tx: watch::Sender<SessionView>,
}

impl SessionController {
    pub async fn new(
        kv: Arc<dyn KeyValueStore>,
        api: Arc<dyn RemoteApi>,
        config: CoreConfig,
    ) -> Result<Self, CoreError> {
        config.validate()?;

        let offline = OfflineManager::load(Arc::clone(&kv), config.clone()).await;
        let monitor = ConnectivityMonitor::new(Arc::clone(&api), config.probe_timeout());
        let (view_tx, _) = watch::channel(SessionView::initial(config.grace_period_ms));

        Ok(Self {
            workspaces: EntityCache::new(Arc::clone(&kv)),
            projects: EntityCache::new(Arc::clone(&kv)),
            config,
            kv,
            api,
            offline,
            monitor,
            epoch: AtomicU64::new(0),
            state: RwLock::new(SessionState::Unauthenticated(UnauthReason::NoSession)),
            view_tx,
        })
    }

    /// Channel of rendered session views. Subscribers always observe the
    /// latest value.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view_tx.subscribe()
    }

    pub async fn state(&self) -> SessionState {
        self.state.read().await.clone()
    }

    pub async fn offline_phase(&self) -> OfflinePhase {
        self.offline.phase(UnixTimeMs::now()).await
    }

    // --- persisted identity helpers ---

    async fn read_credentials(&self) -> Option<StoredCredentials> {
        match self.kv.get(&credentials_key()).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(creds) => Some(creds),
                Err(err) => {
                    warn!(error = %err, "corrupt stored credentials, discarding");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, "failed to read stored credentials");
                None
            }
        }
    }

    async fn write_credentials(&self, creds: &StoredCredentials) -> Result<(), CoreError> {
        let raw = serde_json::to_string(creds)?;
        self.kv.set(&credentials_key(), raw).await?;
        Ok(())
    }

    async fn read_snapshot(&self) -> Option<SessionSnapshot> {
        match self.kv.get(&snapshot_key()).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            _ => None,
        }
    }

    async fn write_snapshot(&self, snapshot: &SessionSnapshot) -> Result<(), CoreError> {
        let raw = serde_json::to_string(snapshot)?;
        self.kv.set(&snapshot_key(), raw).await?;
        Ok(())
    }

    /// Drop every trace of the session: tokens, snapshot, offline episode
    /// (including pending operations), and both entity caches. Advances the
    /// session epoch first so any fetch still in flight is invalidated and
    /// cannot repopulate the caches after the reset.
    async fn purge_session(&self, reason: UnauthReason) -> Result<(), CoreError> {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.api.set_token(None);
        self.kv.remove(&credentials_key()).await?;
        self.kv.remove(&snapshot_key()).await?;
        self.offline.clear_state().await?;
        self.workspaces.clear().await?;
        self.projects.clear().await?;
        *self.state.write().await = SessionState::Unauthenticated(reason);
        Ok(())
    }

    async fn publish_at(&self, now: UnixTimeMs, notice: Option<Notice>) {
        let state = self.state.read().await.clone();
        let snapshot = self.offline.snapshot().await;
        let view = SessionView {
            state,
            offline: snapshot.is_offline,
            days_remaining: snapshot.days_remaining(now, self.config.grace_period_ms),
            pending_operations: snapshot.pending_operations.len(),
            last_sync: snapshot.last_sync,
            notice,
        };
        self.view_tx.send_replace(view);
    }

    async fn publish(&self, notice: Option<Notice>) {
        self.publish_at(UnixTimeMs::now(), notice).await;
    }

    // --- login / startup / logout ---

    /// Interactive login. Requires reachability; there is no offline login
    /// for an account this client has never seen.
    #[instrument(skip(self, credentials), fields(email = %credentials.email))]
    pub async fn login(&self, credentials: &Credentials) -> Result<UserProfile, CoreError> {
        let (tokens, profile) = self.api.login(credentials).await?;
        let now = UnixTimeMs::now();

        self.write_credentials(&tokens).await?;
        self.api.set_token(Some(tokens.access_token.into()));
        self.write_snapshot(&SessionSnapshot {
            user: profile.clone(),
            cached_at: now,
        })
        .await?;

        self.offline.mark_as_online(now).await?;
        *self.state.write().await = SessionState::Authenticated(profile.clone());
        info!(user = %profile.user_id, "logged in");
        self.publish_at(now, None).await;
        Ok(profile)
    }

    /// Restore a session at process start. Never blocks on the full entity
    /// fetch; the caches serve whatever they have and live data arrives
    /// through the refresh calls.
    pub async fn start(&self) -> Result<SessionState, CoreError> {
        self.start_at(UnixTimeMs::now()).await
    }

    /// Clock-injected variant of [`start`](Self::start).
    pub async fn start_at(&self, now: UnixTimeMs) -> Result<SessionState, CoreError> {
        let Some(tokens) = self.read_credentials().await else {
            *self.state.write().await = SessionState::Unauthenticated(UnauthReason::NoSession);
            self.publish_at(now, None).await;
            return Ok(self.state().await);
        };

        self.api.set_token(Some(tokens.access_token.clone().into()));

        match self.api.get_profile().await {
            Ok(profile) => self.startup_online(now, profile).await?,
            Err(ApiError::Unauthorized) => match self.refresh_tokens(&tokens).await {
                Ok(true) => match self.api.get_profile().await {
                    Ok(profile) => self.startup_online(now, profile).await?,
                    Err(err) if err.is_transport() => self.startup_unreachable(now).await?,
                    Err(_) => {
                        self.purge_session(UnauthReason::SessionExpired).await?;
                        self.publish_at(now, None).await;
                    }
                },
                Ok(false) => {
                    self.purge_session(UnauthReason::SessionExpired).await?;
                    self.publish_at(now, None).await;
                }
                Err(err) if err.is_transport() => self.startup_unreachable(now).await?,
                Err(err) => return Err(err),
            },
            Err(err) if err.is_transport() => self.startup_unreachable(now).await?,
            Err(err) => return Err(err.into()),
        }

        Ok(self.state().await)
    }

    async fn startup_online(&self, now: UnixTimeMs, profile: UserProfile) -> Result<(), CoreError> {
        self.write_snapshot(&SessionSnapshot {
            user: profile.clone(),
            cached_at: now,
        })
        .await?;

        let was_offline = self.offline.mark_as_online(now).await?;
        *self.state.write().await = SessionState::Authenticated(profile);

        let report = outbox::drain(&self.offline, self.api.as_ref()).await?;
        let notice = if was_offline || report.total() > 0 {
            Some(Notice::BackOnline {
                replayed: report.applied,
                requeued: report.requeued,
            })
        } else {
            None
        };
        self.publish_at(now, notice).await;
        Ok(())
    }

    /// Backend unreachable at startup. A previously authenticated user keeps
    /// cached access for the remainder of the grace window; past the
    /// deadline the session is purged and a fresh login is required.
    async fn startup_unreachable(&self, now: UnixTimeMs) -> Result<(), CoreError> {
        self.offline.handle_network_error(now).await?;

        if !self.offline.is_within_grace_period(now).await {
            info!("offline grace period expired at startup");
            self.purge_session(UnauthReason::SessionExpired).await?;
            self.publish_at(now, Some(Notice::GraceExpired)).await;
            return Ok(());
        }

        match self.read_snapshot().await {
            Some(snapshot) => {
                let days = self.offline.days_remaining(now).await;
                info!(days_remaining = days, "starting offline from cached identity");
                *self.state.write().await = SessionState::Authenticated(snapshot.user);
                self.publish_at(now, Some(Notice::WorkingOffline { days_remaining: days }))
                    .await;
            }
            None => {
                // Tokens but no cached identity: nothing to show offline.
                // The credentials are kept so a later start can recover.
                *self.state.write().await =
                    SessionState::Unauthenticated(UnauthReason::NoSession);
                self.publish_at(now, None).await;
            }
        }
        Ok(())
    }

    /// Exchange the refresh token once. `Ok(false)` means the backend
    /// rejected it; transport failures propagate so callers can fall into
    /// the offline path instead of discarding a possibly valid session.
    async fn refresh_tokens(&self, current: &StoredCredentials) -> Result<bool, CoreError> {
        match self.api.refresh(&current.refresh_token).await {
            Ok(tokens) => {
                self.write_credentials(&tokens).await?;
                self.api.set_token(Some(tokens.access_token.into()));
                debug!("token pair refreshed");
                Ok(true)
            }
            Err(err) if err.is_transport() => Err(err.into()),
            Err(err) => {
                debug!(error = %err, "token refresh rejected");
                Ok(false)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn logout(&self) -> Result<(), CoreError> {
        // Best effort: a dead network must not block local logout.
        if let Err(err) = self.api.logout().await {
            debug!(error = %err, "remote logout failed, continuing locally");
        }

        self.purge_session(UnauthReason::LoggedOut).await?;
        info!("logged out");
        self.publish(None).await;
        Ok(())
    }

    // --- connectivity ---

    /// Run one reachability probe and apply the result, unless the session
    /// changed while the probe was in flight.
    pub async fn evaluate_connectivity(&self) -> Result<(), CoreError> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let Some(healthy) = self.monitor.check().await else {
            return Ok(());
        };
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!("session changed mid-probe, dropping result");
            return Ok(());
        }
        self.apply_probe(healthy, UnixTimeMs::now()).await
    }

    /// Apply one confirmed probe result to the offline state machine. Also
    /// the entry point for OS network-up/network-down signals forwarded by
    /// the shell.
    pub async fn apply_probe(&self, healthy: bool, now: UnixTimeMs) -> Result<(), CoreError> {
        if !self.state.read().await.is_authenticated() {
            return Ok(());
        }

        if healthy {
            let was_offline = self.offline.mark_as_online(now).await?;
            let pending = self.offline.pending_len().await;
            if was_offline || pending > 0 {
                let report = outbox::drain(&self.offline, self.api.as_ref()).await?;
                self.publish_at(
                    now,
                    Some(Notice::BackOnline {
                        replayed: report.applied,
                        requeued: report.requeued,
                    }),
                )
                .await;
            } else {
                self.publish_at(now, None).await;
            }
            return Ok(());
        }

        let entered = self.offline.handle_network_error(now).await?;

        if !self.offline.is_within_grace_period(now).await {
            info!("offline grace period expired");
            self.purge_session(UnauthReason::SessionExpired).await?;
            self.publish_at(now, Some(Notice::GraceExpired)).await;
            return Ok(());
        }

        if entered {
            let days = self.offline.days_remaining(now).await;
            self.publish_at(now, Some(Notice::WorkingOffline { days_remaining: days }))
                .await;
        }
        Ok(())
    }

    /// Periodic connectivity loop: one eager check after the settle delay,
    /// then one per interval. Runs until the controller is dropped.
    pub fn spawn_periodic_checks(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(this.config.startup_settle()).await;
            let mut ticker = tokio::time::interval(this.config.check_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = this.evaluate_connectivity().await {
                    warn!(error = %err, "scheduled connectivity check failed");
                }
            }
        })
    }

    // --- mutations ---

    /// Route one mutation through the offline policy: apply it live while
    /// online, queue it for replay while in grace, reject it past the
    /// deadline. A transport failure on a live attempt flips the session
    /// into the grace period and queues the operation instead of losing it.
    pub async fn mutate(
        &self,
        kind: &str,
        method: HttpMethod,
        endpoint: String,
        payload: Option<Value>,
    ) -> Result<MutationOutcome<Value>, CoreError> {
        self.mutate_at(UnixTimeMs::now(), kind, method, endpoint, payload)
            .await
    }

    /// Clock-injected variant of [`mutate`](Self::mutate).
    pub async fn mutate_at(
        &self,
        now: UnixTimeMs,
        kind: &str,
        method: HttpMethod,
        endpoint: String,
        payload: Option<Value>,
    ) -> Result<MutationOutcome<Value>, CoreError> {
        if !self.state.read().await.is_authenticated() {
            return Err(CoreError::Unauthorized);
        }

        match self.offline.phase(now).await {
            // An expired read forces logout wherever it is observed, not
            // only on the scheduled check.
            OfflinePhase::Expired => {
                self.purge_session(UnauthReason::SessionExpired).await?;
                self.publish_at(now, Some(Notice::GraceExpired)).await;
                Err(CoreError::GraceExpired)
            }
            OfflinePhase::Grace { .. } => self.queue_mutation(now, kind, method, endpoint, payload).await,
            OfflinePhase::Online => {
                match self.execute_authorized(method, &endpoint, payload.as_ref()).await {
                    Ok(value) => Ok(MutationOutcome::Applied(value)),
                    Err(err) if err.is_transport() => {
                        self.offline.handle_network_error(now).await?;
                        self.queue_mutation(now, kind, method, endpoint, payload).await
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    async fn queue_mutation(
        &self,
        now: UnixTimeMs,
        kind: &str,
        method: HttpMethod,
        endpoint: String,
        payload: Option<Value>,
    ) -> Result<MutationOutcome<Value>, CoreError> {
        let op = Operation::new(kind, method, endpoint, payload, now);
        let pending = self.offline.queue_operation(op).await?;
        self.publish_at(now, Some(Notice::QueuedForSync { pending }))
            .await;
        Ok(MutationOutcome::Queued { pending })
    }

    /// One authenticated call with a single token-refresh retry on 401.
    async fn execute_authorized(
        &self,
        method: HttpMethod,
        endpoint: &str,
        payload: Option<&Value>,
    ) -> Result<Value, CoreError> {
        match self.api.execute(method, endpoint, payload).await {
            Err(ApiError::Unauthorized) => {
                let Some(tokens) = self.read_credentials().await else {
                    return Err(CoreError::Unauthorized);
                };
                if self.refresh_tokens(&tokens).await? {
                    Ok(self.api.execute(method, endpoint, payload).await?)
                } else {
                    self.purge_session(UnauthReason::SessionExpired).await?;
                    self.publish(None).await;
                    Err(CoreError::Unauthorized)
                }
            }
            other => Ok(other?),
        }
    }

    // --- typed entity operations ---

    pub async fn create_workspace(
        &self,
        payload: Value,
    ) -> Result<MutationOutcome<Workspace>, CoreError> {
        match self
            .mutate("workspace.create", HttpMethod::Post, endpoints::workspaces(), Some(payload))
            .await?
        {
            MutationOutcome::Applied(value) => {
                let workspace: Workspace = serde_json::from_value(value)?;
                self.workspaces
                    .apply_change(EntityChange::Upserted(workspace.clone()))
                    .await?;
                Ok(MutationOutcome::Applied(workspace))
            }
            MutationOutcome::Queued { pending } => Ok(MutationOutcome::Queued { pending }),
        }
    }

    pub async fn update_workspace(
        &self,
        id: WorkspaceId,
        payload: Value,
    ) -> Result<MutationOutcome<Workspace>, CoreError> {
        match self
            .mutate("workspace.update", HttpMethod::Patch, endpoints::workspace(id), Some(payload))
            .await?
        {
            MutationOutcome::Applied(value) => {
                let workspace: Workspace = serde_json::from_value(value)?;
                self.workspaces
                    .apply_change(EntityChange::Upserted(workspace.clone()))
                    .await?;
                Ok(MutationOutcome::Applied(workspace))
            }
            MutationOutcome::Queued { pending } => Ok(MutationOutcome::Queued { pending }),
        }
    }

    pub async fn delete_workspace(
        &self,
        id: WorkspaceId,
    ) -> Result<MutationOutcome<()>, CoreError> {
        match self
            .mutate("workspace.delete", HttpMethod::Delete, endpoints::workspace(id), None)
            .await?
        {
            MutationOutcome::Applied(_) => {
                self.workspaces
                    .apply_change(EntityChange::Deleted { scope: None, id: id.0 })
                    .await?;
                // The workspace's project list goes with it.
                self.projects.reconcile(Some(id), Vec::new()).await?;
                Ok(MutationOutcome::Applied(()))
            }
            MutationOutcome::Queued { pending } => Ok(MutationOutcome::Queued { pending }),
        }
    }

    pub async fn create_project(
        &self,
        scope: Scope,
        payload: Value,
    ) -> Result<MutationOutcome<Project>, CoreError> {
        match self
            .mutate("project.create", HttpMethod::Post, endpoints::projects(scope), Some(payload))
            .await?
        {
            MutationOutcome::Applied(value) => {
                let project: Project = serde_json::from_value(value)?;
                self.projects
                    .apply_change(EntityChange::Upserted(project.clone()))
                    .await?;
                Ok(MutationOutcome::Applied(project))
            }
            MutationOutcome::Queued { pending } => Ok(MutationOutcome::Queued { pending }),
        }
    }

    pub async fn update_project(
        &self,
        id: ProjectId,
        payload: Value,
    ) -> Result<MutationOutcome<Project>, CoreError> {
        match self
            .mutate("project.update", HttpMethod::Patch, endpoints::project(id), Some(payload))
            .await?
        {
            MutationOutcome::Applied(value) => {
                let project: Project = serde_json::from_value(value)?;
                self.projects
                    .apply_change(EntityChange::Upserted(project.clone()))
                    .await?;
                Ok(MutationOutcome::Applied(project))
            }
            MutationOutcome::Queued { pending } => Ok(MutationOutcome::Queued { pending }),
        }
    }

    pub async fn delete_project(
        &self,
        id: ProjectId,
        scope: Scope,
    ) -> Result<MutationOutcome<()>, CoreError> {
        match self
            .mutate("project.delete", HttpMethod::Delete, endpoints::project(id), None)
            .await?
        {
            MutationOutcome::Applied(_) => {
                self.projects
                    .apply_change(EntityChange::Deleted { scope, id: id.0 })
                    .await?;
                Ok(MutationOutcome::Applied(()))
            }
            MutationOutcome::Queued { pending } => Ok(MutationOutcome::Queued { pending }),
        }
    }

    pub async fn invite_member(
        &self,
        id: WorkspaceId,
        payload: Value,
    ) -> Result<MutationOutcome<Value>, CoreError> {
        self.mutate("workspace.invite", HttpMethod::Post, endpoints::invitations(id), Some(payload))
            .await
    }

    // --- reads ---

    /// Cached workspaces, no network.
    pub async fn load_workspaces(&self) -> Vec<Workspace> {
        self.workspaces.load(None).await
    }

    /// Cached projects for the scope, no network.
    pub async fn load_projects(&self, scope: Scope) -> Vec<Project> {
        self.projects.load(scope).await
    }

    /// Fetch the live workspace list and reconcile the cache. Falls back to
    /// the cache when the backend is unreachable; fetches that complete out
    /// of order are discarded in favour of later-initiated ones.
    pub async fn refresh_workspaces(&self) -> Result<Vec<Workspace>, CoreError> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let ticket = self.workspaces.begin_fetch(None).await;
        match self.api.list_workspaces().await {
            Ok(fresh) => {
                if self.epoch.load(Ordering::SeqCst) != epoch {
                    debug!("session changed mid-fetch, dropping workspace list");
                    return Ok(Vec::new());
                }
                self.workspaces.complete_fetch(ticket, fresh).await?;
                self.note_reachable().await?;
                Ok(self.workspaces.load(None).await)
            }
            Err(err) if err.is_transport() => {
                self.note_unreachable().await?;
                Ok(self.workspaces.load(None).await)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Fetch the live project list for one scope and reconcile the cache.
    pub async fn refresh_projects(&self, scope: Scope) -> Result<Vec<Project>, CoreError> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let ticket = self.projects.begin_fetch(scope).await;
        match self.api.list_projects(scope).await {
            Ok(fresh) => {
                if self.epoch.load(Ordering::SeqCst) != epoch {
                    debug!("session changed mid-fetch, dropping project list");
                    return Ok(Vec::new());
                }
                self.projects.complete_fetch(ticket, fresh).await?;
                self.note_reachable().await?;
                Ok(self.projects.load(scope).await)
            }
            Err(err) if err.is_transport() => {
                self.note_unreachable().await?;
                Ok(self.projects.load(scope).await)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// A data call succeeded: equivalent evidence to a healthy probe.
    async fn note_reachable(&self) -> Result<(), CoreError> {
        self.apply_probe(true, UnixTimeMs::now()).await
    }

    /// A data call hit a transport failure: equivalent to a failed probe.
    async fn note_unreachable(&self) -> Result<(), CoreError> {
        self.apply_probe(false, UnixTimeMs::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use async_trait::async_trait;
    use secrecy::SecretString;
    use serde_json::json;
    use tokio::sync::Mutex;

    use crate::capabilities::kv::MemoryStore;
    use crate::model::{Invitation, InvitationStatus, MemberRole, UserId};
    use crate::{GRACE_PERIOD_MS, MS_PER_DAY};

    fn profile_json() -> Value {
        json!({"user_id": "u1", "email": "ada@labhub.io", "username": "ada"})
    }

    /// Configurable fake backend: a reachability switch, an authorization
    /// switch, canned responses per (method, endpoint), and a call log.
    struct StubApi {
        reachable: AtomicBool,
        authorized: AtomicBool,
        delay_ms: AtomicU64,
        responses: Mutex<HashMap<(HttpMethod, String), Value>>,
        calls: Mutex<Vec<(HttpMethod, String)>>,
    }

    impl StubApi {
        fn new() -> Self {
            let mut responses = HashMap::new();
            responses.insert(
                (HttpMethod::Get, endpoints::profile()),
                profile_json(),
            );
            responses.insert(
                (HttpMethod::Post, endpoints::login()),
                json!({
                    "access_token": "acc-1",
                    "refresh_token": "ref-1",
                    "user": profile_json(),
                }),
            );
            responses.insert(
                (HttpMethod::Post, endpoints::refresh()),
                json!({"access_token": "acc-2", "refresh_token": "ref-2"}),
            );
            responses.insert((HttpMethod::Get, endpoints::workspaces()), json!([]));
            Self {
                reachable: AtomicBool::new(true),
                authorized: AtomicBool::new(true),
                delay_ms: AtomicU64::new(0),
                responses: Mutex::new(responses),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn set_reachable(&self, reachable: bool) {
            self.reachable.store(reachable, Ordering::SeqCst);
        }

        fn set_delay_ms(&self, ms: u64) {
            self.delay_ms.store(ms, Ordering::SeqCst);
        }

        fn set_authorized(&self, authorized: bool) {
            self.authorized.store(authorized, Ordering::SeqCst);
        }

        async fn respond_with(&self, method: HttpMethod, endpoint: String, value: Value) {
            self.responses.lock().await.insert((method, endpoint), value);
        }

        async fn calls(&self) -> Vec<(HttpMethod, String)> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl RemoteApi for StubApi {
        fn set_token(&self, _token: Option<SecretString>) {}

        async fn ping(&self) -> Result<(), ApiError> {
            if self.reachable.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ApiError::Transport("unreachable".into()))
            }
        }

        async fn execute(
            &self,
            method: HttpMethod,
            endpoint: &str,
            _payload: Option<&Value>,
        ) -> Result<Value, ApiError> {
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if !self.reachable.load(Ordering::SeqCst) {
                return Err(ApiError::Transport("unreachable".into()));
            }
            // Refresh and login are reachable even with a stale access token.
            let is_auth_endpoint =
                endpoint == endpoints::login() || endpoint == endpoints::refresh();
            if !self.authorized.load(Ordering::SeqCst) && !is_auth_endpoint {
                return Err(ApiError::Unauthorized);
            }
            self.calls.lock().await.push((method, endpoint.to_string()));
            let canned = self.responses.lock().await.get(&(method, endpoint.to_string())).cloned();
            Ok(canned.unwrap_or(Value::Null))
        }
    }

    async fn controller() -> (Arc<StubApi>, Arc<MemoryStore>, SessionController) {
        let api = Arc::new(StubApi::new());
        let kv = Arc::new(MemoryStore::new());
        let controller = SessionController::new(
            Arc::clone(&kv) as Arc<dyn KeyValueStore>,
            Arc::clone(&api) as Arc<dyn RemoteApi>,
            CoreConfig::default(),
        )
        .await
        .unwrap();
        (api, kv, controller)
    }

    async fn logged_in_controller() -> (Arc<StubApi>, Arc<MemoryStore>, SessionController) {
        let (api, kv, controller) = controller().await;
        controller
            .login(&Credentials::new("ada@labhub.io", "pw"))
            .await
            .unwrap();
        (api, kv, controller)
    }

    #[tokio::test]
    async fn start_without_credentials_is_unauthenticated() {
        let (_api, _kv, controller) = controller().await;

        let state = controller.start().await.unwrap();

        assert_eq!(
            state,
            SessionState::Unauthenticated(UnauthReason::NoSession)
        );
    }

    #[tokio::test]
    async fn login_persists_identity_and_publishes_view() {
        let (_api, _kv, controller) = controller().await;
        let mut views = controller.subscribe();

        let profile = controller
            .login(&Credentials::new("ada@labhub.io", "pw"))
            .await
            .unwrap();

        assert_eq!(profile.user_id, UserId("u1".into()));
        views.changed().await.unwrap();
        let view = views.borrow().clone();
        assert!(view.state.is_authenticated());
        assert!(!view.offline);
        assert!(view.last_sync.is_some());
    }

    #[tokio::test]
    async fn start_restores_session_when_reachable() {
        let (_api, kv, controller) = logged_in_controller().await;

        // Fresh controller over the same store, as after a process restart.
        let api2 = Arc::new(StubApi::new());
        let restarted = SessionController::new(
            Arc::clone(&kv) as Arc<dyn KeyValueStore>,
            Arc::clone(&api2) as Arc<dyn RemoteApi>,
            CoreConfig::default(),
        )
        .await
        .unwrap();
        drop(controller);

        let state = restarted.start().await.unwrap();

        assert!(state.is_authenticated());
    }

    #[tokio::test]
    async fn start_unreachable_within_grace_uses_cached_identity() {
        let (_api, kv, controller) = logged_in_controller().await;
        drop(controller);

        let api2 = Arc::new(StubApi::new());
        api2.set_reachable(false);
        let restarted = SessionController::new(
            Arc::clone(&kv) as Arc<dyn KeyValueStore>,
            Arc::clone(&api2) as Arc<dyn RemoteApi>,
            CoreConfig::default(),
        )
        .await
        .unwrap();

        let state = restarted.start().await.unwrap();

        assert!(state.is_authenticated());
        let view = restarted.subscribe().borrow().clone();
        assert!(view.offline);
        assert_eq!(
            view.notice,
            Some(Notice::WorkingOffline { days_remaining: 7 })
        );
    }

    #[tokio::test]
    async fn start_past_grace_deadline_purges_session() {
        let (_api, kv, controller) = logged_in_controller().await;
        let t0 = UnixTimeMs(1_000);
        controller.apply_probe(false, t0).await.unwrap();
        drop(controller);

        let api2 = Arc::new(StubApi::new());
        api2.set_reachable(false);
        let restarted = SessionController::new(
            Arc::clone(&kv) as Arc<dyn KeyValueStore>,
            Arc::clone(&api2) as Arc<dyn RemoteApi>,
            CoreConfig::default(),
        )
        .await
        .unwrap();

        let eight_days_later = t0.saturating_add_ms(8 * MS_PER_DAY);
        let state = restarted.start_at(eight_days_later).await.unwrap();

        assert_eq!(
            state,
            SessionState::Unauthenticated(UnauthReason::SessionExpired)
        );
        // Tokens are gone; a subsequent start finds nothing to restore.
        let again = restarted.start_at(eight_days_later).await.unwrap();
        assert_eq!(
            again,
            SessionState::Unauthenticated(UnauthReason::NoSession)
        );
    }

    #[tokio::test]
    async fn startup_refreshes_rejected_token_once() {
        let (_api, kv, controller) = logged_in_controller().await;
        drop(controller);

        let api2 = Arc::new(StubApi::new());
        api2.set_authorized(false);
        // The refresh endpoint stays reachable and hands out a valid pair.
        let restarted = SessionController::new(
            Arc::clone(&kv) as Arc<dyn KeyValueStore>,
            Arc::clone(&api2) as Arc<dyn RemoteApi>,
            CoreConfig::default(),
        )
        .await
        .unwrap();

        // Refresh succeeds but the profile call still 401s, so the retry
        // also fails and the session is purged rather than looping.
        let state = restarted.start().await.unwrap();
        assert_eq!(
            state,
            SessionState::Unauthenticated(UnauthReason::SessionExpired)
        );
    }

    #[tokio::test]
    async fn mutation_while_online_applies_and_caches() {
        let (api, _kv, controller) = logged_in_controller().await;
        api.respond_with(
            HttpMethod::Post,
            endpoints::projects(Some(WorkspaceId(1))),
            json!({"id": 42, "workspace_id": 1, "name": "genome", "creator_id": "u1"}),
        )
        .await;

        let outcome = controller
            .create_project(Some(WorkspaceId(1)), json!({"name": "genome"}))
            .await
            .unwrap();

        let MutationOutcome::Applied(project) = outcome else {
            panic!("expected live application");
        };
        assert_eq!(project.id, ProjectId(42));
        assert_eq!(
            controller.load_projects(Some(WorkspaceId(1))).await[0].id,
            ProjectId(42)
        );
    }

    #[tokio::test]
    async fn mutation_while_offline_queues_without_touching_cache() {
        let (api, _kv, controller) = logged_in_controller().await;
        api.set_reachable(false);
        controller
            .apply_probe(false, UnixTimeMs::now())
            .await
            .unwrap();

        let outcome = controller
            .create_project(None, json!({"name": "scratch"}))
            .await
            .unwrap();

        assert_eq!(outcome, MutationOutcome::Queued { pending: 1 });
        assert!(controller.load_projects(None).await.is_empty());
        let view = controller.subscribe().borrow().clone();
        assert_eq!(view.pending_operations, 1);
    }

    #[tokio::test]
    async fn transport_failure_on_live_mutation_enters_grace_and_queues() {
        let (api, _kv, controller) = logged_in_controller().await;
        // Still believed online; the request itself hits a dead network.
        api.set_reachable(false);

        let outcome = controller
            .create_workspace(json!({"name": "lab"}))
            .await
            .unwrap();

        assert!(outcome.is_queued());
        assert!(matches!(
            controller.offline_phase().await,
            OfflinePhase::Grace { .. }
        ));
    }

    #[tokio::test]
    async fn mutation_past_grace_deadline_is_rejected() {
        let (api, _kv, controller) = logged_in_controller().await;
        api.set_reachable(false);
        let t0 = UnixTimeMs(1_000);
        controller.apply_probe(false, t0).await.unwrap();

        let result = controller
            .mutate_at(
                t0.saturating_add_ms(8 * MS_PER_DAY),
                "project.create",
                HttpMethod::Post,
                endpoints::projects(None),
                Some(json!({"name": "late"})),
            )
            .await;

        assert!(matches!(result, Err(CoreError::GraceExpired)));
        // Observing expiry forces logout on the spot.
        assert_eq!(
            controller.state().await,
            SessionState::Unauthenticated(UnauthReason::SessionExpired)
        );
    }

    #[tokio::test]
    async fn healthy_probe_after_offline_replays_queue() {
        let (api, _kv, controller) = logged_in_controller().await;
        api.set_reachable(false);
        let t0 = UnixTimeMs::now();
        controller.apply_probe(false, t0).await.unwrap();
        controller
            .create_project(None, json!({"name": "queued"}))
            .await
            .unwrap();

        api.set_reachable(true);
        controller
            .apply_probe(true, t0.saturating_add_ms(60_000))
            .await
            .unwrap();

        let view = controller.subscribe().borrow().clone();
        assert!(!view.offline);
        assert_eq!(view.pending_operations, 0);
        assert_eq!(
            view.notice,
            Some(Notice::BackOnline { replayed: 1, requeued: 0 })
        );
        let replayed: Vec<_> = api
            .calls()
            .await
            .into_iter()
            .filter(|(m, e)| *m == HttpMethod::Post && e == &endpoints::projects(None))
            .collect();
        assert_eq!(replayed.len(), 1);
    }

    #[tokio::test]
    async fn repeated_failed_probes_do_not_extend_grace() {
        let (_api, _kv, controller) = logged_in_controller().await;
        let t0 = UnixTimeMs::now();
        controller.apply_probe(false, t0).await.unwrap();
        let deadline = match controller.offline_phase().await {
            OfflinePhase::Grace { expires_at } => expires_at,
            other => panic!("expected grace, got {other:?}"),
        };

        for minutes in 1..4 {
            controller
                .apply_probe(false, t0.saturating_add_ms(minutes * 60_000))
                .await
                .unwrap();
        }

        let snapshot = controller.offline.snapshot().await;
        assert_eq!(snapshot.grace_expiry, Some(deadline));
        assert_eq!(deadline, t0.saturating_add_ms(GRACE_PERIOD_MS));
    }

    #[tokio::test]
    async fn probe_results_are_ignored_when_signed_out() {
        let (_api, _kv, controller) = controller().await;

        controller.apply_probe(false, UnixTimeMs(1_000)).await.unwrap();

        assert_eq!(controller.offline_phase().await, OfflinePhase::Online);
    }

    #[tokio::test]
    async fn logout_clears_identity_caches_and_queue() {
        let (api, kv, controller) = logged_in_controller().await;
        api.respond_with(
            HttpMethod::Get,
            endpoints::workspaces(),
            json!([{"id": 1, "name": "lab", "owner_id": "u1"}]),
        )
        .await;
        controller.refresh_workspaces().await.unwrap();
        api.set_reachable(false);
        controller
            .apply_probe(false, UnixTimeMs::now())
            .await
            .unwrap();
        controller
            .create_project(None, json!({"name": "doomed"}))
            .await
            .unwrap();

        controller.logout().await.unwrap();

        assert_eq!(
            controller.state().await,
            SessionState::Unauthenticated(UnauthReason::LoggedOut)
        );
        assert!(controller.load_workspaces().await.is_empty());
        assert_eq!(controller.offline.pending_len().await, 0);

        // Nothing restorable remains in the store.
        let restarted = SessionController::new(
            Arc::clone(&kv) as Arc<dyn KeyValueStore>,
            Arc::clone(&api) as Arc<dyn RemoteApi>,
            CoreConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(
            restarted.start().await.unwrap(),
            SessionState::Unauthenticated(UnauthReason::NoSession)
        );
    }

    #[tokio::test]
    async fn refresh_workspaces_falls_back_to_cache_when_unreachable() {
        let (api, _kv, controller) = logged_in_controller().await;
        api.respond_with(
            HttpMethod::Get,
            endpoints::workspaces(),
            json!([{"id": 1, "name": "lab", "owner_id": "u1"}]),
        )
        .await;
        controller.refresh_workspaces().await.unwrap();

        api.set_reachable(false);
        let cached = controller.refresh_workspaces().await.unwrap();

        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].id, WorkspaceId(1));
        assert!(matches!(
            controller.offline_phase().await,
            OfflinePhase::Grace { .. }
        ));
    }

    #[tokio::test]
    async fn expired_unauthorized_refresh_purges_session_on_live_call() {
        let (api, _kv, controller) = logged_in_controller().await;
        api.set_authorized(false);
        api.respond_with(HttpMethod::Post, endpoints::refresh(), json!(null))
            .await;

        let result = controller
            .create_workspace(json!({"name": "lab"}))
            .await;

        assert!(matches!(result, Err(CoreError::Unauthorized)));
        assert_eq!(
            controller.state().await,
            SessionState::Unauthenticated(UnauthReason::SessionExpired)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_purge_drops_in_flight_fetch_results() {
        let (api, _kv, controller) = logged_in_controller().await;
        let controller = Arc::new(controller);
        api.respond_with(
            HttpMethod::Get,
            endpoints::projects(None),
            json!([{"id": 7, "name": "stale", "creator_id": "u1"}]),
        )
        .await;
        api.set_delay_ms(300);

        let fetch = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.refresh_projects(None).await })
        };
        // Let the fetch reach the network before the deadline passes.
        tokio::time::sleep(Duration::from_millis(1)).await;

        let t0 = UnixTimeMs::now();
        controller.apply_probe(false, t0).await.unwrap();
        controller
            .apply_probe(false, t0.saturating_add_ms(8 * MS_PER_DAY))
            .await
            .unwrap();
        assert_eq!(
            controller.state().await,
            SessionState::Unauthenticated(UnauthReason::SessionExpired)
        );

        // The fetch was initiated under the old session; its result must
        // not repopulate the purged caches.
        let fetched = fetch.await.unwrap().unwrap();
        assert!(fetched.is_empty());
        assert!(controller.load_projects(None).await.is_empty());
    }

    #[tokio::test]
    async fn invite_member_while_online_posts_invitation() {
        let (api, _kv, controller) = logged_in_controller().await;
        api.respond_with(
            HttpMethod::Post,
            endpoints::invitations(WorkspaceId(1)),
            json!({
                "id": 11,
                "invitee_email": "grace@labhub.io",
                "role": "member",
                "status": "pending",
                "invited_at": 1_000,
            }),
        )
        .await;

        let outcome = controller
            .invite_member(
                WorkspaceId(1),
                json!({"email": "grace@labhub.io", "role": "member"}),
            )
            .await
            .unwrap();

        let MutationOutcome::Applied(value) = outcome else {
            panic!("expected live application");
        };
        let invitation: Invitation = serde_json::from_value(value).unwrap();
        assert_eq!(invitation.role, MemberRole::Member);
        assert_eq!(invitation.status, InvitationStatus::Pending);
        assert!(api
            .calls()
            .await
            .contains(&(HttpMethod::Post, endpoints::invitations(WorkspaceId(1)))));
    }

    #[tokio::test]
    async fn invite_member_while_offline_queues_and_replays() {
        let (api, _kv, controller) = logged_in_controller().await;
        api.set_reachable(false);
        let t0 = UnixTimeMs::now();
        controller.apply_probe(false, t0).await.unwrap();

        let outcome = controller
            .invite_member(
                WorkspaceId(1),
                json!({"email": "grace@labhub.io", "role": "viewer"}),
            )
            .await
            .unwrap();
        assert_eq!(outcome, MutationOutcome::Queued { pending: 1 });

        api.set_reachable(true);
        controller
            .apply_probe(true, t0.saturating_add_ms(60_000))
            .await
            .unwrap();

        let sent: Vec<_> = api
            .calls()
            .await
            .into_iter()
            .filter(|(m, e)| {
                *m == HttpMethod::Post && e == &endpoints::invitations(WorkspaceId(1))
            })
            .collect();
        assert_eq!(sent.len(), 1);
        assert_eq!(controller.offline.pending_len().await, 0);
    }
}
