//! OAuth2 authorization-code flow against Google.
//!
//! The broker owns the token lifecycle: it builds the consent URL, exchanges
//! the pasted authorization code, refreshes expired access tokens and keeps
//! the persisted [`TokenSet`] usable. Scope discipline: only per-file Drive
//! access plus the account email, never Drive-wide access.

use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{SyncStateStore, TokenSet};
use crate::error::{errors, SyncResult};

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_REVOKE_URL: &str = "https://oauth2.googleapis.com/revoke";
const GOOGLE_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

const SCOPES: [&str; 2] = [
    "https://www.googleapis.com/auth/drive.file",
    "https://www.googleapis.com/auth/userinfo.email",
];

/// Refresh slightly before the recorded expiry so an in-flight request
/// never races the cutoff.
const EXPIRY_SKEW_MS: i64 = 60_000;

/// OAuth application credentials, read from the environment once at
/// startup. Their absence disables sync entirely rather than failing at
/// call time.
#[derive(Debug, Clone)]
pub struct SyncCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub api_key: Option<String>,
}

impl SyncCredentials {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
            api_key: None,
        }
    }

    /// Read credentials from `PUFFIN_SYNC_CLIENT_ID`,
    /// `PUFFIN_SYNC_CLIENT_SECRET` and `PUFFIN_SYNC_REDIRECT_URI`.
    /// Returns `None` when any required variable is missing or empty.
    pub fn from_env() -> Option<Self> {
        let client_id = std::env::var("PUFFIN_SYNC_CLIENT_ID").ok()?;
        let client_secret = std::env::var("PUFFIN_SYNC_CLIENT_SECRET").ok()?;
        let redirect_uri = std::env::var("PUFFIN_SYNC_REDIRECT_URI").ok()?;

        if client_id.is_empty() || client_secret.is_empty() || redirect_uri.is_empty() {
            return None;
        }

        Some(Self {
            client_id,
            client_secret,
            redirect_uri,
            api_key: std::env::var("PUFFIN_SYNC_API_KEY").ok().filter(|v| !v.is_empty()),
        })
    }
}

/// Endpoint set, swappable so tests can point the broker at a mock server.
#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub auth_url: String,
    pub token_url: String,
    pub revoke_url: String,
    pub userinfo_url: String,
}

impl Default for OAuthEndpoints {
    fn default() -> Self {
        Self {
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            revoke_url: GOOGLE_REVOKE_URL.to_string(),
            userinfo_url: GOOGLE_USERINFO_URL.to_string(),
        }
    }
}

/// A client holding a currently valid access token.
#[derive(Debug, Clone)]
pub struct AuthorizedClient {
    access_token: String,
}

impl AuthorizedClient {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
    token_type: Option<String>,
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserInfoResponse {
    email: Option<String>,
}

/// Manages the authorization-code flow and keeps tokens usable.
pub struct OAuthBroker {
    credentials: SyncCredentials,
    store: Arc<dyn SyncStateStore>,
    http: reqwest::Client,
    endpoints: OAuthEndpoints,
}

impl OAuthBroker {
    pub fn new(credentials: SyncCredentials, store: Arc<dyn SyncStateStore>) -> Self {
        Self {
            credentials,
            store,
            http: reqwest::Client::new(),
            endpoints: OAuthEndpoints::default(),
        }
    }

    /// Broker with custom endpoints (used by tests).
    pub fn with_endpoints(
        credentials: SyncCredentials,
        store: Arc<dyn SyncStateStore>,
        endpoints: OAuthEndpoints,
    ) -> Self {
        Self {
            credentials,
            store,
            http: reqwest::Client::new(),
            endpoints,
        }
    }

    /// Build the consent URL. Requests offline access so a refresh token is
    /// issued, and forces the consent prompt so re-authorization reliably
    /// reissues one.
    pub fn build_auth_url(&self, state: Option<&str>) -> SyncResult<String> {
        let mut url = Url::parse(&self.endpoints.auth_url)
            .map_err(|err| errors::config_with_source("Invalid authorization endpoint", err))?;

        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("client_id", &self.credentials.client_id)
                .append_pair("redirect_uri", &self.credentials.redirect_uri)
                .append_pair("response_type", "code")
                .append_pair("scope", &SCOPES.join(" "))
                .append_pair("access_type", "offline")
                .append_pair("prompt", "consent");
            if let Some(state) = state {
                pairs.append_pair("state", state);
            }
        }

        Ok(url.into())
    }

    /// Exchange an authorization code for tokens. Fails unless the provider
    /// returns both an access and a refresh token.
    pub async fn exchange_code(&self, code: &str) -> SyncResult<TokenSet> {
        info!("exchanging authorization code for tokens");

        let params = [
            ("code", code),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("redirect_uri", self.credentials.redirect_uri.as_str()),
            ("grant_type", "authorization_code"),
        ];

        let response = self
            .http
            .post(&self.endpoints.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|err| errors::network("Failed to reach the token endpoint", err))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(errors::auth(format!(
                "Authorization code exchange failed: {body}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|err| errors::network("Failed to parse the token response", err))?;

        let refresh_token = token.refresh_token.ok_or_else(|| {
            errors::auth(
                "The provider did not return a refresh token. Revoke the app's access in \
                 your Google account and authorize again.",
            )
        })?;

        Ok(TokenSet {
            access_token: token.access_token,
            refresh_token,
            expiry_date: Utc::now().timestamp_millis() + token.expires_in * 1000,
            token_type: token.token_type.unwrap_or_else(|| "Bearer".to_string()),
            scope: token.scope,
        })
    }

    /// Load the persisted tokens and return an authorized client, refreshing
    /// first if the access token has expired. Returns `None` when no tokens
    /// are stored or the refresh fails; refresh failure generally signals
    /// revoked consent, not a transient fault, so it is not retried.
    pub async fn get_client(&self) -> SyncResult<Option<AuthorizedClient>> {
        let Some(tokens) = self.store.tokens()? else {
            debug!("no stored tokens; authorization required");
            return Ok(None);
        };

        if tokens.expiry_date > Utc::now().timestamp_millis() + EXPIRY_SKEW_MS {
            return Ok(Some(AuthorizedClient::new(tokens.access_token)));
        }

        debug!("access token expired; refreshing");
        match self.refresh_tokens(&tokens).await {
            Ok(fresh) => {
                let client = AuthorizedClient::new(fresh.access_token.clone());
                self.store.save_tokens(fresh)?;
                Ok(Some(client))
            }
            Err(err) => {
                warn!("token refresh failed: {}", err.user_message());
                Ok(None)
            }
        }
    }

    /// Refresh the access token, substituting the previous refresh token if
    /// the provider omits a new one.
    async fn refresh_tokens(&self, current: &TokenSet) -> SyncResult<TokenSet> {
        let params = [
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("refresh_token", current.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];

        let response = self
            .http
            .post(&self.endpoints.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|err| errors::network("Failed to reach the token endpoint", err))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(errors::auth(format!("Token refresh failed: {body}")));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|err| errors::network("Failed to parse the refresh response", err))?;

        Ok(TokenSet {
            access_token: token.access_token,
            refresh_token: token
                .refresh_token
                .unwrap_or_else(|| current.refresh_token.clone()),
            expiry_date: Utc::now().timestamp_millis() + token.expires_in * 1000,
            token_type: token.token_type.unwrap_or_else(|| current.token_type.clone()),
            scope: token.scope.or_else(|| current.scope.clone()),
        })
    }

    /// Fetch the authenticated account's email address.
    pub async fn fetch_user_email(&self, client: &AuthorizedClient) -> SyncResult<Option<String>> {
        let response = self
            .http
            .get(&self.endpoints.userinfo_url)
            .bearer_auth(client.access_token())
            .send()
            .await
            .map_err(|err| errors::network("Failed to reach the userinfo endpoint", err))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(errors::remote(status, format!("Userinfo lookup failed: {body}")));
        }

        let info: UserInfoResponse = response
            .json()
            .await
            .map_err(|err| errors::network("Failed to parse the userinfo response", err))?;

        Ok(info.email)
    }

    /// Best-effort token revocation. Failures are swallowed: revocation is
    /// advisory cleanup, not required for a local disconnect.
    pub async fn revoke(&self) {
        let Ok(Some(tokens)) = self.store.tokens() else {
            return;
        };

        let result = self
            .http
            .post(&self.endpoints.revoke_url)
            .form(&[("token", tokens.refresh_token.as_str())])
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                info!("revoked Google Drive tokens");
            }
            Ok(response) => {
                debug!(status = response.status().as_u16(), "token revocation rejected");
            }
            Err(err) => {
                debug!("token revocation failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryStateStore;

    fn test_credentials() -> SyncCredentials {
        SyncCredentials::new("client-id", "client-secret", "http://127.0.0.1:4321")
    }

    fn stored_tokens(expiry_date: i64) -> TokenSet {
        TokenSet {
            access_token: "old-access".to_string(),
            refresh_token: "original-refresh".to_string(),
            expiry_date,
            token_type: "Bearer".to_string(),
            scope: None,
        }
    }

    fn broker_with(
        store: Arc<dyn SyncStateStore>,
        token_url: String,
        userinfo_url: String,
    ) -> OAuthBroker {
        OAuthBroker::with_endpoints(
            test_credentials(),
            store,
            OAuthEndpoints {
                token_url,
                userinfo_url,
                ..OAuthEndpoints::default()
            },
        )
    }

    #[test]
    fn auth_url_requests_offline_access_and_consent() {
        let store = Arc::new(MemoryStateStore::new());
        let broker = OAuthBroker::new(test_credentials(), store);

        let url = broker.build_auth_url(Some("state-token")).unwrap();
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("prompt=consent"));
        assert!(url.contains("state=state-token"));
        assert!(url.contains("drive.file"));
        assert!(!url.contains("auth%2Fdrive&"), "must not request Drive-wide scope");
    }

    #[tokio::test]
    async fn get_client_without_tokens_is_none() {
        let store = Arc::new(MemoryStateStore::new());
        let broker = OAuthBroker::new(test_credentials(), store);
        assert!(broker.get_client().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fresh_tokens_are_used_without_refresh() {
        let store = Arc::new(MemoryStateStore::new());
        store
            .save_tokens(stored_tokens(Utc::now().timestamp_millis() + 3_600_000))
            .unwrap();
        let broker = OAuthBroker::new(test_credentials(), store);

        let client = broker.get_client().await.unwrap().unwrap();
        assert_eq!(client.access_token(), "old-access");
    }

    #[tokio::test]
    async fn refresh_preserves_prior_refresh_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"new-access","expires_in":3600,"token_type":"Bearer"}"#)
            .create_async()
            .await;

        let store: Arc<dyn SyncStateStore> = Arc::new(MemoryStateStore::new());
        store.save_tokens(stored_tokens(0)).unwrap();

        let broker = broker_with(
            store.clone(),
            format!("{}/token", server.url()),
            format!("{}/userinfo", server.url()),
        );

        let client = broker.get_client().await.unwrap().unwrap();
        assert_eq!(client.access_token(), "new-access");

        let persisted = store.tokens().unwrap().unwrap();
        assert_eq!(persisted.access_token, "new-access");
        assert_eq!(persisted.refresh_token, "original-refresh");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn failed_refresh_returns_none_without_retry() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .expect(1)
            .create_async()
            .await;

        let store: Arc<dyn SyncStateStore> = Arc::new(MemoryStateStore::new());
        store.save_tokens(stored_tokens(0)).unwrap();

        let broker = broker_with(
            store.clone(),
            format!("{}/token", server.url()),
            format!("{}/userinfo", server.url()),
        );

        assert!(broker.get_client().await.unwrap().is_none());
        // The stale tokens stay in place; the caller redirects to auth.
        assert!(store.tokens().unwrap().is_some());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn exchange_requires_a_refresh_token() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"at","expires_in":3600,"token_type":"Bearer"}"#)
            .create_async()
            .await;

        let store = Arc::new(MemoryStateStore::new());
        let broker = broker_with(
            store,
            format!("{}/token", server.url()),
            format!("{}/userinfo", server.url()),
        );

        let err = broker.exchange_code("code123").await.unwrap_err();
        assert!(err.user_message().contains("refresh token"));
    }

    #[tokio::test]
    async fn exchange_returns_full_token_set() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"access_token":"at","refresh_token":"rt","expires_in":3600,
                    "token_type":"Bearer","scope":"drive.file email"}"#,
            )
            .create_async()
            .await;

        let store = Arc::new(MemoryStateStore::new());
        let broker = broker_with(
            store,
            format!("{}/token", server.url()),
            format!("{}/userinfo", server.url()),
        );

        let before = Utc::now().timestamp_millis();
        let tokens = broker.exchange_code("code123").await.unwrap();
        assert_eq!(tokens.access_token, "at");
        assert_eq!(tokens.refresh_token, "rt");
        assert!(tokens.expiry_date >= before + 3_600_000);
    }

    #[tokio::test]
    async fn userinfo_returns_account_email() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/userinfo")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"email":"user@example.com","verified_email":true}"#)
            .create_async()
            .await;

        let store = Arc::new(MemoryStateStore::new());
        let broker = broker_with(
            store,
            format!("{}/token", server.url()),
            format!("{}/userinfo", server.url()),
        );

        let email = broker
            .fetch_user_email(&AuthorizedClient::new("at"))
            .await
            .unwrap();
        assert_eq!(email.as_deref(), Some("user@example.com"));
    }
}
