use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::capabilities::kv::{KeyNamespace, KeyValueStore, KvKey};
use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::model::UnixTimeMs;
use crate::outbox::Operation;
use crate::MS_PER_DAY;

fn state_key() -> KvKey {
    KvKey::well_known(KeyNamespace::Sync, "offline_state")
}

/// Lifecycle phase, derived lazily from the persisted state on every read.
/// There is no background expiry timer; a suspended process that wakes past
/// the deadline observes `Expired` on its first read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OfflinePhase {
    Online,
    Grace { expires_at: UnixTimeMs },
    Expired,
}

/// Persisted offline-state singleton.
///
/// Invariant: `is_offline == false` implies `grace_expiry == None`. The
/// pending queue is append-only while offline and drained only during a
/// successful sync pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OfflineState {
    pub is_offline: bool,
    pub grace_expiry: Option<UnixTimeMs>,
    pub last_sync: Option<UnixTimeMs>,
    #[serde(default)]
    pub pending_operations: VecDeque<Operation>,
}

impl Default for OfflineState {
    fn default() -> Self {
        Self {
            is_offline: false,
            grace_expiry: None,
            last_sync: None,
            pending_operations: VecDeque::new(),
        }
    }
}

impl OfflineState {
    /// Restore the invariant after deserializing state of unknown origin.
    fn normalize(mut self) -> Self {
        if !self.is_offline && self.grace_expiry.is_some() {
            warn!("persisted offline state violated invariant, clearing grace deadline");
            self.grace_expiry = None;
        }
        if self.is_offline && self.grace_expiry.is_none() {
            warn!("offline flag without grace deadline, resetting to online");
            self.is_offline = false;
        }
        self
    }

    #[must_use]
    pub fn phase(&self, now: UnixTimeMs) -> OfflinePhase {
        match (self.is_offline, self.grace_expiry) {
            (true, Some(expires_at)) if now >= expires_at => OfflinePhase::Expired,
            (true, Some(expires_at)) => OfflinePhase::Grace { expires_at },
            _ => OfflinePhase::Online,
        }
    }

    /// Confirmed unreachability. Starts one grace episode; repeated calls
    /// while already offline must not move the deadline.
    /// Returns true when this call entered the grace period.
    pub fn handle_network_error(&mut self, now: UnixTimeMs, grace_period_ms: u64) -> bool {
        if self.is_offline {
            return false;
        }
        self.is_offline = true;
        self.grace_expiry = Some(now.saturating_add_ms(grace_period_ms));
        true
    }

    /// Confirmed reachability. Returns true when this call left an offline
    /// episode.
    pub fn mark_as_online(&mut self, now: UnixTimeMs) -> bool {
        let was_offline = self.is_offline;
        self.is_offline = false;
        self.grace_expiry = None;
        self.last_sync = Some(now);
        was_offline
    }

    #[must_use]
    pub fn is_within_grace_period(&self, now: UnixTimeMs) -> bool {
        !matches!(self.phase(now), OfflinePhase::Expired)
    }

    /// Days until cached access expires: ceiling of the remaining time,
    /// floored at zero, and the full grace window while online.
    #[must_use]
    pub fn days_remaining(&self, now: UnixTimeMs, grace_period_ms: u64) -> u32 {
        let days = match (self.is_offline, self.grace_expiry) {
            (true, Some(expires_at)) => now.days_until_ceil(expires_at),
            _ => grace_period_ms.div_ceil(MS_PER_DAY),
        };
        u32::try_from(days).unwrap_or(u32::MAX)
    }

    /// Append one operation, evicting oldest-first when at capacity.
    /// Returns the evicted operation, if any.
    pub fn push_operation(&mut self, op: Operation, cap: usize) -> Option<Operation> {
        let evicted = if self.pending_operations.len() >= cap {
            self.pending_operations.pop_front()
        } else {
            None
        };
        self.pending_operations.push_back(op);
        evicted
    }
}

/// Process-wide owner of the persisted offline state. All mutation goes
/// through its methods so the in-memory copy and the stored copy never
/// diverge: every transition is applied to a scratch copy, persisted, and
/// only then committed to memory.
pub struct OfflineManager {
    config: CoreConfig,
    kv: Arc<dyn KeyValueStore>,
    state: RwLock<OfflineState>,
}

impl OfflineManager {
    /// Load persisted state, treating anything malformed as "no offline
    /// episode in progress".
    pub async fn load(kv: Arc<dyn KeyValueStore>, config: CoreConfig) -> Self {
        let state = match kv.get(&state_key()).await {
            Ok(Some(raw)) => match serde_json::from_str::<OfflineState>(&raw) {
                Ok(state) => state.normalize(),
                Err(err) => {
                    warn!(error = %err, "corrupt offline state, starting fresh");
                    OfflineState::default()
                }
            },
            Ok(None) => OfflineState::default(),
            Err(err) => {
                warn!(error = %err, "failed to read offline state, starting fresh");
                OfflineState::default()
            }
        };

        debug!(
            is_offline = state.is_offline,
            pending = state.pending_operations.len(),
            "offline state loaded"
        );

        Self {
            config,
            kv,
            state: RwLock::new(state),
        }
    }

    async fn persist(&self, state: &OfflineState) -> Result<(), CoreError> {
        let raw = serde_json::to_string(state)?;
        self.kv.set(&state_key(), raw).await?;
        Ok(())
    }

    pub async fn phase(&self, now: UnixTimeMs) -> OfflinePhase {
        self.state.read().await.phase(now)
    }

    pub async fn is_within_grace_period(&self, now: UnixTimeMs) -> bool {
        self.state.read().await.is_within_grace_period(now)
    }

    pub async fn days_remaining(&self, now: UnixTimeMs) -> u32 {
        self.state
            .read()
            .await
            .days_remaining(now, self.config.grace_period_ms)
    }

    pub async fn last_sync(&self) -> Option<UnixTimeMs> {
        self.state.read().await.last_sync
    }

    pub async fn pending_len(&self) -> usize {
        self.state.read().await.pending_operations.len()
    }

    /// Idempotent entry into the grace period. Returns true when this call
    /// started a new offline episode.
    pub async fn handle_network_error(&self, now: UnixTimeMs) -> Result<bool, CoreError> {
        let mut guard = self.state.write().await;
        let mut next = guard.clone();
        let entered = next.handle_network_error(now, self.config.grace_period_ms);
        if entered {
            self.persist(&next).await?;
            info!(
                expires_at = ?next.grace_expiry,
                "entered offline grace period"
            );
            *guard = next;
        }
        Ok(entered)
    }

    /// Idempotent return to online. Returns true when this call left an
    /// offline episode. The caller is responsible for draining the queue.
    pub async fn mark_as_online(&self, now: UnixTimeMs) -> Result<bool, CoreError> {
        let mut guard = self.state.write().await;
        let mut next = guard.clone();
        let was_offline = next.mark_as_online(now);
        self.persist(&next).await?;
        if was_offline {
            info!(pending = next.pending_operations.len(), "back online");
        }
        *guard = next;
        Ok(was_offline)
    }

    /// Record a mutation attempted while offline. Returns the new queue
    /// length.
    pub async fn queue_operation(&self, op: Operation) -> Result<usize, CoreError> {
        let mut guard = self.state.write().await;
        let mut next = guard.clone();
        let evicted = next.push_operation(op, self.config.max_pending_operations);
        self.persist(&next).await?;
        if let Some(evicted) = evicted {
            warn!(
                op_id = %evicted.id,
                kind = %evicted.kind,
                "pending queue at capacity, evicted oldest operation"
            );
        }
        let len = next.pending_operations.len();
        debug!(pending = len, "operation queued for replay");
        *guard = next;
        Ok(len)
    }

    /// Take the queue captured at drain start. Operations queued after this
    /// call belong to the next sweep.
    pub async fn take_sweep(&self) -> Result<Vec<Operation>, CoreError> {
        let mut guard = self.state.write().await;
        let mut next = guard.clone();
        let sweep: Vec<Operation> = next.pending_operations.drain(..).collect();
        if sweep.is_empty() {
            return Ok(sweep);
        }
        self.persist(&next).await?;
        *guard = next;
        Ok(sweep)
    }

    /// Put a failed operation back at the end of the queue.
    pub async fn requeue(&self, op: Operation) -> Result<(), CoreError> {
        let mut guard = self.state.write().await;
        let mut next = guard.clone();
        next.pending_operations.push_back(op);
        self.persist(&next).await?;
        *guard = next;
        Ok(())
    }

    /// Full reset, used on logout and on grace expiry. Discards any pending
    /// operations.
    pub async fn clear_state(&self) -> Result<(), CoreError> {
        let mut guard = self.state.write().await;
        let next = OfflineState::default();
        self.persist(&next).await?;
        let discarded = guard.pending_operations.len();
        if discarded > 0 {
            info!(discarded, "discarded pending operations on state clear");
        }
        *guard = next;
        Ok(())
    }

    /// Copy of the current state, for inspection.
    pub async fn snapshot(&self) -> OfflineState {
        self.state.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::api::HttpMethod;
    use crate::capabilities::kv::MemoryStore;
    use proptest::prelude::*;

    const GRACE: u64 = 7 * MS_PER_DAY;

    fn op(label: &str) -> Operation {
        Operation::new(
            label,
            HttpMethod::Post,
            "/api/projects/",
            Some(serde_json::json!({"name": label})),
            UnixTimeMs(0),
        )
    }

    #[test]
    fn grace_starts_on_first_confirmed_failure() {
        let mut state = OfflineState::default();
        let entered = state.handle_network_error(UnixTimeMs(1_000), GRACE);

        assert!(entered);
        assert!(state.is_offline);
        assert_eq!(state.grace_expiry, Some(UnixTimeMs(1_000 + GRACE)));
    }

    #[test]
    fn repeated_failures_do_not_renew_grace() {
        let mut state = OfflineState::default();
        state.handle_network_error(UnixTimeMs(1_000), GRACE);
        let expiry = state.grace_expiry;

        let entered = state.handle_network_error(UnixTimeMs(500_000), GRACE);

        assert!(!entered);
        assert_eq!(state.grace_expiry, expiry);
    }

    #[test]
    fn handle_network_error_is_idempotent() {
        let mut once = OfflineState::default();
        once.handle_network_error(UnixTimeMs(1_000), GRACE);

        let mut twice = OfflineState::default();
        twice.handle_network_error(UnixTimeMs(1_000), GRACE);
        twice.handle_network_error(UnixTimeMs(1_000), GRACE);

        assert_eq!(once, twice);
    }

    #[test]
    fn mark_as_online_clears_episode_and_records_sync() {
        let mut state = OfflineState::default();
        state.handle_network_error(UnixTimeMs(1_000), GRACE);

        let was_offline = state.mark_as_online(UnixTimeMs(2_000));

        assert!(was_offline);
        assert!(!state.is_offline);
        assert_eq!(state.grace_expiry, None);
        assert_eq!(state.last_sync, Some(UnixTimeMs(2_000)));
        assert_eq!(state.phase(UnixTimeMs(2_000)), OfflinePhase::Online);
    }

    #[test]
    fn expiry_is_evaluated_lazily() {
        let mut state = OfflineState::default();
        state.handle_network_error(UnixTimeMs(0), GRACE);

        let just_before = UnixTimeMs(GRACE - 1);
        let at_deadline = UnixTimeMs(GRACE);

        assert!(matches!(
            state.phase(just_before),
            OfflinePhase::Grace { .. }
        ));
        assert!(state.is_within_grace_period(just_before));
        assert_eq!(state.phase(at_deadline), OfflinePhase::Expired);
        assert!(!state.is_within_grace_period(at_deadline));
    }

    #[test]
    fn eight_days_offline_is_expired() {
        let mut state = OfflineState::default();
        state.handle_network_error(UnixTimeMs(0), GRACE);

        let eight_days = UnixTimeMs(8 * MS_PER_DAY);
        assert!(!state.is_within_grace_period(eight_days));
        assert_eq!(state.days_remaining(eight_days, GRACE), 0);
    }

    #[test]
    fn days_remaining_defaults_to_full_window_while_online() {
        let state = OfflineState::default();
        assert_eq!(state.days_remaining(UnixTimeMs(0), GRACE), 7);
    }

    #[test]
    fn days_remaining_is_a_ceiling() {
        let mut state = OfflineState::default();
        state.handle_network_error(UnixTimeMs(0), GRACE);

        // One millisecond into the episode still rounds up to 7 days.
        assert_eq!(state.days_remaining(UnixTimeMs(1), GRACE), 7);
        // Half a day left rounds up to one.
        let half_day_left = UnixTimeMs(GRACE - MS_PER_DAY / 2);
        assert_eq!(state.days_remaining(half_day_left, GRACE), 1);
    }

    #[test]
    fn days_remaining_monotonically_non_increasing_while_offline() {
        let mut state = OfflineState::default();
        state.handle_network_error(UnixTimeMs(0), GRACE);

        let mut previous = u32::MAX;
        for hour in 0..(9 * 24) {
            let now = UnixTimeMs(hour * 60 * 60 * 1000);
            let days = state.days_remaining(now, GRACE);
            assert!(days <= previous, "days remaining increased at hour {hour}");
            previous = days;
        }

        state.mark_as_online(UnixTimeMs(9 * MS_PER_DAY));
        assert_eq!(state.days_remaining(UnixTimeMs(9 * MS_PER_DAY), GRACE), 7);
    }

    #[test]
    fn queue_cap_evicts_oldest_first() {
        let mut state = OfflineState::default();
        for i in 0..3 {
            assert!(state.push_operation(op(&format!("op{i}")), 3).is_none());
        }

        let evicted = state.push_operation(op("op3"), 3).unwrap();

        assert_eq!(evicted.kind, "op0");
        assert_eq!(state.pending_operations.len(), 3);
        assert_eq!(state.pending_operations.front().unwrap().kind, "op1");
    }

    proptest! {
        /// For any sequence of connectivity results, the grace deadline is
        /// set exactly once per offline episode: only on a failure that
        /// follows a success (or the initial state), and never moved by
        /// further failures inside the same episode.
        #[test]
        fn grace_expiry_set_once_per_episode(results in proptest::collection::vec(any::<bool>(), 1..64)) {
            let mut state = OfflineState::default();
            let mut expected_episodes = 0u32;
            let mut observed_entries = 0u32;
            let mut was_online = true;
            let mut current_expiry: Option<UnixTimeMs> = None;

            for (i, reachable) in results.iter().copied().enumerate() {
                let now = UnixTimeMs((i as u64 + 1) * 1_000);
                if reachable {
                    state.mark_as_online(now);
                    prop_assert!(!state.is_offline);
                    prop_assert_eq!(state.grace_expiry, None);
                    was_online = true;
                    current_expiry = None;
                } else {
                    let entered = state.handle_network_error(now, GRACE);
                    prop_assert!(state.is_offline);
                    if was_online {
                        expected_episodes += 1;
                        prop_assert!(entered);
                        current_expiry = state.grace_expiry;
                    } else {
                        prop_assert!(!entered);
                        // Deadline untouched inside an episode.
                        prop_assert_eq!(state.grace_expiry, current_expiry);
                    }
                    if entered {
                        observed_entries += 1;
                    }
                    was_online = false;
                }
            }

            prop_assert_eq!(observed_entries, expected_episodes);
        }
    }

    #[tokio::test]
    async fn manager_recovers_from_corrupt_state() {
        let kv = Arc::new(MemoryStore::new());
        kv.set(&state_key(), "{not json at all".into())
            .await
            .unwrap();

        let manager = OfflineManager::load(kv, CoreConfig::default()).await;

        let now = UnixTimeMs::now();
        assert_eq!(manager.phase(now).await, OfflinePhase::Online);
        assert_eq!(manager.pending_len().await, 0);
    }

    #[tokio::test]
    async fn manager_repairs_invariant_violations() {
        let kv = Arc::new(MemoryStore::new());
        let bad = r#"{"is_offline": false, "grace_expiry": 12345, "last_sync": null}"#;
        kv.set(&state_key(), bad.into()).await.unwrap();

        let manager = OfflineManager::load(kv, CoreConfig::default()).await;

        let snapshot = manager.snapshot().await;
        assert!(!snapshot.is_offline);
        assert_eq!(snapshot.grace_expiry, None);
    }

    #[tokio::test]
    async fn state_survives_manager_reload() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let manager = OfflineManager::load(Arc::clone(&kv), CoreConfig::default()).await;

        manager
            .handle_network_error(UnixTimeMs(10_000))
            .await
            .unwrap();
        manager.queue_operation(op("create")).await.unwrap();

        let reloaded = OfflineManager::load(kv, CoreConfig::default()).await;
        let snapshot = reloaded.snapshot().await;

        assert!(snapshot.is_offline);
        assert_eq!(snapshot.pending_operations.len(), 1);
        assert_eq!(snapshot.grace_expiry, Some(UnixTimeMs(10_000 + GRACE)));
    }

    #[tokio::test]
    async fn take_sweep_leaves_queue_empty_for_next_sweep() {
        let kv = Arc::new(MemoryStore::new());
        let manager = OfflineManager::load(kv, CoreConfig::default()).await;

        manager.queue_operation(op("a")).await.unwrap();
        manager.queue_operation(op("b")).await.unwrap();

        let sweep = manager.take_sweep().await.unwrap();
        assert_eq!(sweep.len(), 2);
        assert_eq!(sweep[0].kind, "a");
        assert_eq!(manager.pending_len().await, 0);

        // Mid-drain arrivals belong to the next sweep.
        manager.queue_operation(op("c")).await.unwrap();
        let next = manager.take_sweep().await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].kind, "c");
    }

    #[tokio::test]
    async fn clear_state_discards_pending_operations() {
        let kv = Arc::new(MemoryStore::new());
        let manager = OfflineManager::load(kv, CoreConfig::default()).await;

        manager
            .handle_network_error(UnixTimeMs(1_000))
            .await
            .unwrap();
        manager.queue_operation(op("x")).await.unwrap();

        manager.clear_state().await.unwrap();

        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot, OfflineState::default());
    }
}
