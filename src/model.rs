use serde::{Deserialize, Serialize};
use std::fmt;

use crate::MS_PER_DAY;

/// Unix timestamp in milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    #[must_use]
    pub fn saturating_add_ms(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    /// Milliseconds from `self` until `later`, zero if `later` is earlier.
    #[must_use]
    pub fn millis_until(self, later: Self) -> u64 {
        later.0.saturating_sub(self.0)
    }

    /// Whole days until `later`, rounded up.
    #[must_use]
    pub fn days_until_ceil(self, later: Self) -> u64 {
        self.millis_until(later).div_ceil(MS_PER_DAY)
    }
}

// --- Typed ids ---

macro_rules! numeric_id {
    ($name:ident) => {
        #[derive(
            Serialize,
            Deserialize,
            Clone,
            Copy,
            Debug,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

numeric_id!(WorkspaceId);
numeric_id!(ProjectId);

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// --- Collaborative entities ---

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Owner,
    Admin,
    Member,
    Viewer,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub user_id: UserId,
    pub role: MemberRole,
    #[serde(default)]
    pub can_create_projects: bool,
    #[serde(default)]
    pub can_invite_members: bool,
    #[serde(default)]
    pub joined_at: Option<UnixTimeMs>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Declined,
    Expired,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Invitation {
    pub id: u64,
    pub invitee_email: String,
    pub role: MemberRole,
    pub status: InvitationStatus,
    pub invited_at: UnixTimeMs,
    #[serde(default)]
    pub expires_at: Option<UnixTimeMs>,
}

/// Top-level collaborative scope. Has no parent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub owner_id: UserId,
    #[serde(default)]
    pub members: Vec<Membership>,
    #[serde(default)]
    pub invitations: Vec<Invitation>,
    /// Server timestamp, display-only. The server is authoritative; the
    /// cache is last-write-wins and never resolves conflicts from this.
    #[serde(default)]
    pub updated_at: Option<UnixTimeMs>,
}

/// Belongs to at most one workspace; personal projects have none.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    #[serde(default)]
    pub workspace_id: Option<WorkspaceId>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub creator_id: UserId,
    #[serde(default)]
    pub members: Vec<Membership>,
    #[serde(default)]
    pub updated_at: Option<UnixTimeMs>,
}

// --- Identity ---

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub email: String,
    pub username: String,
    #[serde(default)]
    pub account_state: Option<String>,
}

/// Last known-good authenticated identity, persisted separately from entity
/// caches so identity survives even when the caches are empty.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub user: UserProfile,
    pub cached_at: UnixTimeMs,
}

/// Persisted token pair. Debug is redacted, the values never reach logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredentials {
    pub access_token: String,
    pub refresh_token: String,
}

impl fmt::Debug for StoredCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredCredentials")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .finish()
    }
}
