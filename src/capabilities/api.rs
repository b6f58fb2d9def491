use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::model::{Project, StoredCredentials, UserProfile, Workspace, WorkspaceId};

pub const MAX_URL_LENGTH: usize = 2048;

/// Remote call failure. `Transport` and `Timeout` are the distinguished
/// "network/offline" kinds that feed the offline state machine; everything
/// else is an application error and propagates to the caller.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("network unreachable: {0}")]
    Transport(String),

    #[error("request timed out after {0} ms")]
    Timeout(u64),

    #[error("unauthorized")]
    Unauthorized,

    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    /// True when the failure means the service is unreachable, as opposed
    /// to the service answering with an application error.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Patch,
    Delete,
}

impl HttpMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

/// Validated coordination-service base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseUrl {
    url: String,
    host: String,
}

impl BaseUrl {
    pub fn new(url: impl Into<String>) -> Result<Self, ApiError> {
        let url = url.into();
        if url.len() > MAX_URL_LENGTH {
            return Err(ApiError::InvalidRequest(format!(
                "base URL exceeds {MAX_URL_LENGTH} bytes"
            )));
        }

        let parsed =
            Url::parse(&url).map_err(|e| ApiError::InvalidRequest(format!("bad URL: {e}")))?;

        let scheme = parsed.scheme().to_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(ApiError::InvalidRequest(format!(
                "invalid scheme '{scheme}', only http and https are allowed"
            )));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| ApiError::InvalidRequest("base URL must have a host".into()))?
            .to_lowercase();

        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(ApiError::InvalidRequest(
                "credentials in URL are not allowed".into(),
            ));
        }

        Ok(Self {
            url: parsed.to_string().trim_end_matches('/').to_string(),
            host,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn join(&self, endpoint: &str) -> String {
        format!("{}{endpoint}", self.url)
    }
}

/// Login input. The password is redacted in Debug output and only exposed
/// at the point the request body is built.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub email: String,
    pub password: SecretString,
}

impl Credentials {
    #[must_use]
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: SecretString::new(password.into()),
        }
    }
}

#[derive(Deserialize)]
struct LoginResponse {
    access_token: String,
    refresh_token: String,
    user: UserProfile,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Endpoint paths owned by the coordination service.
pub mod endpoints {
    use crate::model::{ProjectId, WorkspaceId};

    #[must_use]
    pub fn health() -> String {
        "/api/health/".to_string()
    }

    #[must_use]
    pub fn login() -> String {
        "/api/auth/login/".to_string()
    }

    #[must_use]
    pub fn refresh() -> String {
        "/api/auth/refresh/".to_string()
    }

    #[must_use]
    pub fn logout() -> String {
        "/api/auth/logout/".to_string()
    }

    #[must_use]
    pub fn profile() -> String {
        "/api/auth/profile/".to_string()
    }

    #[must_use]
    pub fn workspaces() -> String {
        "/api/workspaces/".to_string()
    }

    #[must_use]
    pub fn workspace(id: WorkspaceId) -> String {
        format!("/api/workspaces/{id}/")
    }

    #[must_use]
    pub fn projects(scope: Option<WorkspaceId>) -> String {
        match scope {
            Some(id) => format!("/api/workspaces/{id}/projects/"),
            None => "/api/projects/".to_string(),
        }
    }

    #[must_use]
    pub fn project(id: ProjectId) -> String {
        format!("/api/projects/{id}/")
    }

    #[must_use]
    pub fn invitations(id: WorkspaceId) -> String {
        format!("/api/workspaces/{id}/invitations/")
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|e| ApiError::Decode(e.to_string()))
}

/// Authenticated request/response collaborator for the coordination
/// service. Implementations provide `set_token`, `ping` and `execute`; the
/// typed auth and list calls are routed through `execute`. Entity mutations
/// have no typed wrappers here: the session layer issues them as raw
/// `execute` calls so that queued offline operations replay through exactly
/// the same path as live ones.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Install or clear the bearer token used for subsequent calls.
    fn set_token(&self, token: Option<SecretString>);

    /// Cheap reachability probe. Must not allocate a session or touch
    /// entity state; the caller enforces the timeout.
    async fn ping(&self) -> Result<(), ApiError>;

    /// Perform one authenticated call and return the decoded JSON body
    /// (`Value::Null` for empty responses).
    async fn execute(
        &self,
        method: HttpMethod,
        endpoint: &str,
        payload: Option<&Value>,
    ) -> Result<Value, ApiError>;

    async fn login(
        &self,
        credentials: &Credentials,
    ) -> Result<(StoredCredentials, UserProfile), ApiError> {
        let body = serde_json::json!({
            "email": credentials.email,
            "password": credentials.password.expose_secret(),
        });
        let value = self
            .execute(HttpMethod::Post, &endpoints::login(), Some(&body))
            .await?;
        let response: LoginResponse = decode(value)?;
        Ok((
            StoredCredentials {
                access_token: response.access_token,
                refresh_token: response.refresh_token,
            },
            response.user,
        ))
    }

    /// Exchange the refresh token for a fresh pair. Servers that do not
    /// rotate refresh tokens omit the field and the old one is kept.
    async fn refresh(&self, refresh_token: &str) -> Result<StoredCredentials, ApiError> {
        let body = serde_json::json!({ "refresh_token": refresh_token });
        let value = self
            .execute(HttpMethod::Post, &endpoints::refresh(), Some(&body))
            .await?;
        let response: RefreshResponse = decode(value)?;
        Ok(StoredCredentials {
            access_token: response.access_token,
            refresh_token: response
                .refresh_token
                .unwrap_or_else(|| refresh_token.to_string()),
        })
    }

    async fn logout(&self) -> Result<(), ApiError> {
        self.execute(HttpMethod::Post, &endpoints::logout(), None)
            .await?;
        Ok(())
    }

    async fn get_profile(&self) -> Result<UserProfile, ApiError> {
        let value = self
            .execute(HttpMethod::Get, &endpoints::profile(), None)
            .await?;
        decode(value)
    }

    async fn list_workspaces(&self) -> Result<Vec<Workspace>, ApiError> {
        let value = self
            .execute(HttpMethod::Get, &endpoints::workspaces(), None)
            .await?;
        decode(value)
    }

    async fn list_projects(&self, scope: Option<WorkspaceId>) -> Result<Vec<Project>, ApiError> {
        let value = self
            .execute(HttpMethod::Get, &endpoints::projects(scope), None)
            .await?;
        decode(value)
    }
}
