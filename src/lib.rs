// labcore - offline-first session and sync core for the LabHub desktop client.
//
// The rendering shell (forms, tables, theming) lives elsewhere; this crate
// owns the connectivity state machine, the offline grace-period policy, the
// scoped entity cache, and the pending-operation replay protocol. External
// collaborators (persistent key-value store, remote API) are traits under
// `capabilities`.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod cache;
pub mod capabilities;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod model;
pub mod offline;
pub mod outbox;
pub mod session;

pub use cache::{EntityCache, EntityChange, FetchTicket, Scope};
pub use capabilities::api::{ApiError, Credentials, HttpMethod, RemoteApi};
pub use capabilities::kv::{KeyNamespace, KeyValueStore, KvError, KvKey, MemoryStore};
pub use config::CoreConfig;
pub use connectivity::ConnectivityMonitor;
pub use error::CoreError;
pub use model::{
    Project, ProjectId, SessionSnapshot, UnixTimeMs, UserProfile, Workspace, WorkspaceId,
};
pub use offline::{OfflineManager, OfflinePhase, OfflineState};
pub use outbox::{DrainReport, Operation};
pub use session::{
    MutationOutcome, Notice, SessionController, SessionState, SessionView, UnauthReason,
};

pub const MS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

/// How long a previously authenticated user may keep working from cached
/// data while the coordination service is unreachable.
pub const GRACE_PERIOD_MS: u64 = 7 * MS_PER_DAY;

/// Deadline for the cheap reachability probe.
pub const PROBE_TIMEOUT_MS: u64 = 3_000;

/// Cadence of scheduled reachability checks while a session is active.
pub const CHECK_INTERVAL_MS: u64 = 20_000;

/// Delay before the eager startup check, so the OS network stack settles.
pub const STARTUP_SETTLE_MS: u64 = 2_000;

/// Pending-operation queue cap. Overflow evicts oldest-first.
pub const MAX_PENDING_OPERATIONS: usize = 10_000;
