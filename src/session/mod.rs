//! Session lifecycles: MQTT connection and cloud authentication
//!
//! Cloud sessions are kept per login in an immutable map published through
//! an atomic pointer swap. Readers never block; a refresh replaces the whole
//! map. Refreshes are single-flight: a forced re-auth for a session that
//! was already replaced returns the replacement.

pub mod mqtt;

use crate::cloud::types::AuthResponse;
use crate::cloud::{AuthError, CloudClient};
use crate::config::CloudConfig;
use crate::credentials::CloudCredentials;
use arc_swap::ArcSwap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{error, info, warn};

type SessionMap = HashMap<String, Arc<AuthSession>>;

/// Authenticated cloud session; replaced wholesale, never mutated
#[derive(Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub login: String,
    pub client: String,
    pub branch: String,
    pub token: String,
    pub issued_at_ms: i64,
    pub expires_at_ms: i64,
}

impl std::fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSession")
            .field("login", &self.login)
            .field("client", &self.client)
            .field("branch", &self.branch)
            .field("token", &"<redacted>")
            .field("issued_at_ms", &self.issued_at_ms)
            .field("expires_at_ms", &self.expires_at_ms)
            .finish()
    }
}

impl AuthSession {
    /// Expiry comes from the response when present, else `lifetime_secs`
    pub fn from_response(
        resp: AuthResponse,
        login: &str,
        issued_at_ms: i64,
        lifetime_secs: u64,
    ) -> Self {
        let expires_at_ms = resp
            .expiration
            .unwrap_or(issued_at_ms + (lifetime_secs as i64) * 1_000);
        Self {
            login: login.to_string(),
            client: resp.client,
            branch: resp.branch,
            token: resp.token,
            issued_at_ms,
            expires_at_ms,
        }
    }

    pub fn is_expired(&self, now_ms: i64, margin_ms: i64) -> bool {
        now_ms >= self.expires_at_ms - margin_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    /// Credentials refused; relay stays halted until a retry is requested
    Rejected,
}

pub struct SessionManager {
    cloud: Arc<CloudClient>,
    credentials: CloudCredentials,
    lifetime_secs: u64,
    margin_ms: i64,
    sessions: ArcSwap<SessionMap>,
    state: Mutex<AuthState>,
    last_rejection: Mutex<Option<AuthError>>,
    refresh: tokio::sync::Mutex<()>,
    retry: Notify,
}

impl SessionManager {
    pub fn new(cloud: Arc<CloudClient>, credentials: CloudCredentials, config: &CloudConfig) -> Self {
        Self {
            cloud,
            credentials,
            lifetime_secs: config.token_lifetime_secs,
            margin_ms: (config.token_refresh_margin_secs as i64) * 1_000,
            sessions: ArcSwap::from_pointee(SessionMap::new()),
            state: Mutex::new(AuthState::Unauthenticated),
            last_rejection: Mutex::new(None),
            refresh: tokio::sync::Mutex::new(()),
            retry: Notify::new(),
        }
    }

    pub fn credentials(&self) -> &CloudCredentials {
        &self.credentials
    }

    pub fn state(&self) -> AuthState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_halted(&self) -> bool {
        self.state() == AuthState::Rejected
    }

    /// Number of logins holding a session
    pub fn active_sessions(&self) -> usize {
        self.sessions.load().len()
    }

    /// A valid session for `login`, authenticating first if there is none
    /// or it expired
    pub async fn session(&self, login: &str) -> Result<Arc<AuthSession>, AuthError> {
        if let Some(err) = self.rejection() {
            return Err(err);
        }
        if let Some(session) = self.fresh(login) {
            return Ok(session);
        }
        self.refresh(login, None).await
    }

    /// Replace `stale` after the server refused it
    pub async fn force_reauth(&self, stale: &Arc<AuthSession>) -> Result<Arc<AuthSession>, AuthError> {
        if let Some(err) = self.rejection() {
            return Err(err);
        }
        self.refresh(&stale.login, Some(stale)).await
    }

    async fn refresh(
        &self,
        login: &str,
        stale: Option<&Arc<AuthSession>>,
    ) -> Result<Arc<AuthSession>, AuthError> {
        let _guard = self.refresh.lock().await;

        // another caller may have refreshed while we waited
        if let Some(current) = self.fresh(login) {
            if !stale.is_some_and(|s| Arc::ptr_eq(s, &current)) {
                return Ok(current);
            }
        }
        if let Some(err) = self.rejection() {
            return Err(err);
        }
        self.authenticate(login).await
    }

    /// Log in unconditionally and publish the new session
    pub async fn authenticate(&self, login: &str) -> Result<Arc<AuthSession>, AuthError> {
        self.set_state(AuthState::Authenticating);
        let issued_at_ms = chrono::Utc::now().timestamp_millis();

        match self.cloud.authenticate(&self.credentials, login).await {
            Ok(resp) => {
                let session = Arc::new(AuthSession::from_response(
                    resp,
                    login,
                    issued_at_ms,
                    self.lifetime_secs,
                ));
                let margin_ms = self.margin_ms;
                self.sessions.rcu(|map| {
                    // expired sessions of devices that went quiet are dropped here
                    let mut map: SessionMap = map
                        .iter()
                        .filter(|(_, s)| !s.is_expired(issued_at_ms, margin_ms))
                        .map(|(k, s)| (k.clone(), s.clone()))
                        .collect();
                    map.insert(login.to_string(), session.clone());
                    map
                });
                self.set_state(AuthState::Authenticated);
                info!(
                    branch = %session.branch,
                    expires_at_ms = session.expires_at_ms,
                    "Authenticated with {} as {}",
                    self.cloud.base_url(),
                    login
                );
                Ok(session)
            }
            Err(e @ AuthError::Rejected { .. }) => {
                self.sessions.rcu(|map| {
                    let mut map = SessionMap::clone(map);
                    map.remove(login);
                    map
                });
                *self.last_rejection.lock().unwrap_or_else(|p| p.into_inner()) = Some(e.clone());
                self.set_state(AuthState::Rejected);
                error!("Cloud rejected credentials for {}: {}", login, e);
                Err(e)
            }
            Err(e) => {
                self.set_state(if self.active_sessions() > 0 {
                    AuthState::Authenticated
                } else {
                    AuthState::Unauthenticated
                });
                warn!("Authentication as {} failed: {}", login, e);
                Err(e)
            }
        }
    }

    /// Clear a rejection halt; returns false when relay was not halted
    pub fn request_retry(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *state != AuthState::Rejected {
            return false;
        }
        *state = AuthState::Unauthenticated;
        drop(state);

        *self.last_rejection.lock().unwrap_or_else(|p| p.into_inner()) = None;
        info!("Authentication retry requested");
        self.retry.notify_one();
        true
    }

    /// Resolves after [`SessionManager::request_retry`] cleared a halt
    pub async fn wait_for_retry(&self) {
        self.retry.notified().await
    }

    fn fresh(&self, login: &str) -> Option<Arc<AuthSession>> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        self.sessions
            .load()
            .get(login)
            .filter(|s| !s.is_expired(now_ms, self.margin_ms))
            .cloned()
    }

    fn rejection(&self) -> Option<AuthError> {
        if !self.is_halted() {
            return None;
        }
        self.last_rejection
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn set_state(&self, state: AuthState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    const AUTH_PATH: &str = "/authorization/authenticate";

    fn manager(url: &str) -> SessionManager {
        let config = CloudConfig {
            base_url: url.to_string(),
            ..CloudConfig::default()
        };
        let credentials = CloudCredentials {
            client_name: "Plant".to_string(),
            login: "relay".to_string(),
            password: "secret".to_string(),
            api_key: "key".to_string(),
            login_mode: crate::config::LoginMode::Shared,
            device_logins: Default::default(),
        };
        let cloud = Arc::new(CloudClient::new(&config, &credentials).unwrap());
        SessionManager::new(cloud, credentials, &config)
    }

    fn auth_body(expiration: i64) -> String {
        format!(
            r#"{{"Client":"c","Branch":"b","Token":"t","Expiration":{}}}"#,
            expiration
        )
    }

    fn in_one_hour() -> i64 {
        chrono::Utc::now().timestamp_millis() + 3_600_000
    }

    #[test]
    fn test_expiry_defaults_to_lifetime() {
        let resp = AuthResponse {
            client: "c".to_string(),
            branch: "b".to_string(),
            token: "t".to_string(),
            expiration: None,
        };
        let session = AuthSession::from_response(resp, "relay", 1_000, 3_600);
        assert_eq!(session.expires_at_ms, 3_601_000);
        assert!(!session.is_expired(3_540_999, 60_000));
        assert!(session.is_expired(3_541_000, 60_000));
    }

    #[test]
    fn test_debug_redacts_token() {
        let session = AuthSession {
            login: "relay".to_string(),
            client: "c".to_string(),
            branch: "b".to_string(),
            token: "super-secret-token".to_string(),
            issued_at_ms: 0,
            expires_at_ms: 1,
        };
        assert!(!format!("{:?}", session).contains("super-secret-token"));
    }

    #[tokio::test]
    async fn test_session_is_cached() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("POST", AUTH_PATH)
            .with_status(200)
            .with_body(auth_body(in_one_hour()))
            .expect(1)
            .create_async()
            .await;

        let sessions = manager(&server.url());
        assert_eq!(sessions.state(), AuthState::Unauthenticated);
        let first = sessions.session("relay").await.unwrap();
        let second = sessions.session("relay").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(sessions.state(), AuthState::Authenticated);
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_expired_session_is_refreshed() {
        let mut server = mockito::Server::new_async().await;
        // expires inside the refresh margin
        let soon = chrono::Utc::now().timestamp_millis() + 30_000;
        let m = server
            .mock("POST", AUTH_PATH)
            .with_status(200)
            .with_body(auth_body(soon))
            .expect(2)
            .create_async()
            .await;

        let sessions = manager(&server.url());
        sessions.session("relay").await.unwrap();
        sessions.session("relay").await.unwrap();
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_force_reauth_is_coalesced() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("POST", AUTH_PATH)
            .with_status(200)
            .with_body(auth_body(in_one_hour()))
            .expect(2)
            .create_async()
            .await;

        let sessions = manager(&server.url());
        let stale = sessions.session("relay").await.unwrap();
        let fresh = sessions.force_reauth(&stale).await.unwrap();
        assert!(!Arc::ptr_eq(&stale, &fresh));

        // a second caller holding the same stale session gets the replacement
        let again = sessions.force_reauth(&stale).await.unwrap();
        assert!(Arc::ptr_eq(&fresh, &again));
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejection_halts_until_retry() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("POST", AUTH_PATH)
            .with_status(401)
            .with_body("invalid login")
            .expect(1)
            .create_async()
            .await;

        let sessions = manager(&server.url());
        let err = sessions.session("relay").await.unwrap_err();
        assert!(matches!(err, AuthError::Rejected { status: 401, .. }));
        assert!(sessions.is_halted());

        // halted: no further login attempts
        assert!(sessions.session("relay").await.is_err());
        m.assert_async().await;

        assert!(sessions.request_retry());
        assert_eq!(sessions.state(), AuthState::Unauthenticated);
        assert!(!sessions.request_retry());
        tokio::time::timeout(std::time::Duration::from_secs(1), sessions.wait_for_retry())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_is_not_a_halt() {
        let sessions = manager("http://127.0.0.1:1");
        let err = sessions.session("relay").await.unwrap_err();
        assert!(matches!(err, AuthError::Unreachable(_)));
        assert!(!sessions.is_halted());
        assert_eq!(sessions.state(), AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_each_login_gets_its_own_session() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("POST", AUTH_PATH)
            .match_body(Matcher::PartialJson(serde_json::json!({ "login": "tugger-01" })))
            .with_status(200)
            .with_body(auth_body(in_one_hour()))
            .expect(1)
            .create_async()
            .await;
        let second = server
            .mock("POST", AUTH_PATH)
            .match_body(Matcher::PartialJson(serde_json::json!({ "login": "tugger-02" })))
            .with_status(200)
            .with_body(auth_body(in_one_hour()))
            .expect(1)
            .create_async()
            .await;

        let sessions = manager(&server.url());
        let a = sessions.session("tugger-01").await.unwrap();
        let b = sessions.session("tugger-02").await.unwrap();
        assert_eq!(a.login, "tugger-01");
        assert_eq!(b.login, "tugger-02");
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(sessions.active_sessions(), 2);

        // both stay cached
        assert!(Arc::ptr_eq(&a, &sessions.session("tugger-01").await.unwrap()));
        assert!(Arc::ptr_eq(&b, &sessions.session("tugger-02").await.unwrap()));
        first.assert_async().await;
        second.assert_async().await;
    }
}
