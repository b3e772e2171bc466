//! Authenticated API access with transparent access-token refresh

use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::protocol::{
    ApiRequest, ApiResponse, LoginRequest, LoginResponse, Method, RefreshRequest,
    RefreshResponse, endpoints,
};
use crate::state::SharedSession;
use crate::types::{Credentials, Identity};

/// Issues a single HTTP call. Non-2xx statuses are returned, not raised;
/// only transport failures are errors.
#[async_trait]
pub trait ApiTransport: Send + Sync {
    async fn send(&self, request: &ApiRequest, bearer: Option<&str>) -> Result<ApiResponse>;
}

/// Replaces the live connection after the access token rotates.
#[async_trait]
pub trait Reconnect: Send + Sync {
    async fn reconnect(&self, token: &str) -> Result<()>;
}

/// reqwest-backed transport rooted at the API base URL
#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
    base_url: String,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl ApiTransport for HttpTransport {
    async fn send(&self, request: &ApiRequest, bearer: Option<&str>) -> Result<ApiResponse> {
        let url = self.url(&request.path);
        debug!("{:?} {}", request.method, url);

        let mut req = match request.method {
            Method::Get => self.http.get(&url),
            Method::Post => self.http.post(&url),
        };
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        Ok(ApiResponse::new(status, body))
    }
}

/// Bearer-authenticated requests with one refresh-and-retry on rejection.
pub struct AuthGateway {
    transport: Arc<dyn ApiTransport>,
    session: SharedSession,
    connection: Arc<dyn Reconnect>,
}

impl AuthGateway {
    pub fn new(
        transport: Arc<dyn ApiTransport>,
        session: SharedSession,
        connection: Arc<dyn Reconnect>,
    ) -> Self {
        Self {
            transport,
            session,
            connection,
        }
    }

    /// Exchange username/password for an identity and a token pair. The
    /// credentials are stored; the chat state is left to the caller.
    pub async fn login(&self, username: &str, password: &str) -> Result<(Identity, Credentials)> {
        let body = serde_json::to_value(LoginRequest { username, password })?;
        let resp = self
            .transport
            .send(&ApiRequest::post(endpoints::LOGIN, body), None)
            .await?;

        if !resp.is_success() {
            warn!("Login for '{}' rejected: HTTP {}", username, resp.status);
            return Err(SessionError::Status {
                status: resp.status,
                body: resp.body,
            });
        }

        let login: LoginResponse = resp.json()?;
        let credentials = Credentials::new(login.token, login.refresh_token);
        self.session.store().store_credentials(&credentials)?;
        info!("Logged in as '{}'", login.user.username);
        Ok((login.user, credentials))
    }

    /// Send `request` with the current access token.
    ///
    /// On rejection, refreshes once. A failed refresh clears the whole session
    /// and returns [`SessionError::ReauthRequired`]. A successful refresh
    /// replaces the live connection and retries the request exactly once; the
    /// retry's response is returned whatever its status.
    pub async fn authorized_request(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let credentials = self
            .session
            .store()
            .credentials()
            .ok_or(SessionError::NotLoggedIn)?;

        let resp = self
            .transport
            .send(request, Some(&credentials.access_token))
            .await?;
        if resp.is_success() {
            return Ok(resp);
        }

        info!(
            "{} rejected with HTTP {}, refreshing access token",
            request.path, resp.status
        );
        let access_token = self.refresh(&credentials).await?;

        if let Err(e) = self.connection.reconnect(&access_token).await {
            warn!("Reconnect after token refresh failed: {}", e);
        }

        self.transport.send(request, Some(&access_token)).await
    }

    /// Mint a new access token, store it, and return it.
    async fn refresh(&self, credentials: &Credentials) -> Result<String> {
        let body = serde_json::to_value(RefreshRequest {
            refresh_token: &credentials.refresh_token,
        })?;
        let resp = self
            .transport
            .send(
                &ApiRequest::post(endpoints::REFRESH, body),
                Some(&credentials.refresh_token),
            )
            .await?;

        if !resp.is_success() {
            warn!("Refresh rejected with HTTP {}, clearing session", resp.status);
            self.session.reset().await?;
            return Err(SessionError::ReauthRequired);
        }

        let refreshed: RefreshResponse = resp.json()?;
        let rotated = Credentials {
            access_token: refreshed.access_token,
            refresh_token: refreshed
                .refresh_token
                .unwrap_or_else(|| credentials.refresh_token.clone()),
        };
        self.session.store().store_credentials(&rotated)?;
        debug!("Access token refreshed");
        Ok(rotated.access_token)
    }
}
