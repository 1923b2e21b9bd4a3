//! Twinzo v3 HTTP client
//!
//! Two calls are needed by the relay:
//! 1. `POST /authorization/authenticate` with `{client, login, password}`
//!    returns the client/branch GUIDs and a token
//! 2. `POST /localization` with an array of localization entries, sent with
//!    the session headers of the configured [`AuthScheme`]
//!
//! Retry policy lives in the relay and the session manager, not here.

pub mod types;

use crate::config::{AuthScheme, CloudConfig};
use crate::credentials::CloudCredentials;
use crate::session::AuthSession;
use reqwest::{Client, RequestBuilder};
use std::time::Duration;
use tracing::{debug, info};
use types::{AuthRequest, AuthResponse, LocalizationEntry};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("authentication rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("authentication endpoint unreachable: {0}")]
    Unreachable(String),
}

/// Status and body of a localization POST that reached the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostOutcome {
    pub status: u16,
    pub body: String,
}

impl PostOutcome {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub struct CloudClient {
    http: Client,
    base_url: String,
    scheme: AuthScheme,
    api_key: String,
}

impl CloudClient {
    pub fn new(config: &CloudConfig, credentials: &CloudCredentials) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;

        info!(
            "Cloud client created for {} ({:?} headers)",
            config.base_url, config.auth_scheme
        );

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            scheme: config.auth_scheme,
            api_key: credentials.api_key.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Log in as `login` and return the raw session fields
    pub async fn authenticate(
        &self,
        credentials: &CloudCredentials,
        login: &str,
    ) -> Result<AuthResponse, AuthError> {
        let url = format!("{}/authorization/authenticate", self.base_url);
        debug!("Authenticating as {} at {}", login, url);

        let resp = self
            .http
            .post(&url)
            .json(&AuthRequest {
                client: &credentials.client_name,
                login,
                password: &credentials.password,
            })
            .send()
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        resp.json::<AuthResponse>()
            .await
            .map_err(|e| AuthError::Unreachable(format!("invalid authenticate response: {}", e)))
    }

    /// POST one batch of localization entries
    ///
    /// Any HTTP status is returned as a [`PostOutcome`]; only transport
    /// failures (connect, timeout) surface as errors.
    pub async fn post_localization(
        &self,
        session: &AuthSession,
        entries: &[LocalizationEntry],
    ) -> Result<PostOutcome, reqwest::Error> {
        let url = format!("{}/localization", self.base_url);
        let resp = self
            .with_session_headers(self.http.post(&url), session)
            .json(entries)
            .send()
            .await?;

        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Ok(PostOutcome { status, body })
    }

    fn with_session_headers(&self, req: RequestBuilder, session: &AuthSession) -> RequestBuilder {
        let req = req
            .header("Client", &session.client)
            .header("Branch", &session.branch);
        match self.scheme {
            AuthScheme::ApiKey => req
                .header("Token", &session.token)
                .header("Api-Key", &self.api_key),
            AuthScheme::Bearer => req.bearer_auth(&session.token),
        }
    }
}
