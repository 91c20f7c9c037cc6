//! OAuth2 bearer tokens for the remote API.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use url::Url;

use crate::error::{Error, Result};

pub const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";
pub const REDIRECT_URI: &str = "http://localhost:1";

/// Tokens are refreshed this long before they expire.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// OAuth2 client registration, persisted as `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Serialised OAuth2 token, persisted as `token.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    pub refresh_token: String,
    pub expiry: DateTime<Utc>,
    pub token_type: String,
}

impl Token {
    fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.expiry - Duration::seconds(EXPIRY_MARGIN_SECS) <= now
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
    #[serde(default = "default_token_type")]
    token_type: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenResponse {
    fn into_token(self, previous_refresh: Option<&str>) -> Result<Token> {
        let refresh_token = self
            .refresh_token
            .or_else(|| previous_refresh.map(str::to_string))
            .ok_or_else(|| Error::Auth("token response carried no refresh token".to_string()))?;
        Ok(Token {
            access_token: self.access_token,
            refresh_token,
            expiry: Utc::now() + Duration::seconds(self.expires_in),
            token_type: self.token_type,
        })
    }
}

/// Source of bearer tokens for authenticated requests.
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    /// A currently valid access token.
    async fn access_token(&self) -> Result<String>;
}

/// Token source that refreshes the stored token shortly before expiry and
/// writes the refreshed token back to disk.
pub struct RefreshingTokenSource {
    http: reqwest::Client,
    credentials: ClientCredentials,
    token_url: Url,
    token: Mutex<Token>,
    token_path: Option<PathBuf>,
}

impl RefreshingTokenSource {
    pub fn new(
        http: reqwest::Client,
        credentials: ClientCredentials,
        token: Token,
        token_path: Option<PathBuf>,
    ) -> Result<Self> {
        Ok(Self {
            http,
            credentials,
            token_url: Url::parse(TOKEN_URL).map_err(|e| Error::InvalidConfig(e.to_string()))?,
            token: Mutex::new(token),
            token_path,
        })
    }

    /// Point refreshes at a different token endpoint.
    pub fn with_token_url(mut self, token_url: Url) -> Self {
        self.token_url = token_url;
        self
    }

    async fn refresh(&self, current: &Token) -> Result<Token> {
        tracing::debug!("refreshing access token");
        let params = [
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("refresh_token", current.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];
        let response = self
            .http
            .post(self.token_url.clone())
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::Auth(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Auth(format!("token refresh returned {}: {}", status, body)));
        }

        let response: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Auth(e.to_string()))?;
        let token = response.into_token(Some(&current.refresh_token))?;

        if let Some(path) = &self.token_path {
            if let Err(e) = save_token(path, &token).await {
                tracing::warn!(path = %path.display(), "failed to persist refreshed token: {}", e);
            }
        }
        Ok(token)
    }
}

#[async_trait::async_trait]
impl TokenSource for RefreshingTokenSource {
    async fn access_token(&self) -> Result<String> {
        let mut token = self.token.lock().await;
        if token.needs_refresh(Utc::now()) {
            *token = self.refresh(&token).await?;
        }
        Ok(token.access_token.clone())
    }
}

/// Fixed bearer token, for tests and pre-issued credentials.
#[derive(Debug, Clone)]
pub struct StaticTokenSource(pub String);

#[async_trait::async_trait]
impl TokenSource for StaticTokenSource {
    async fn access_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Consent URL for the installed-application authorization-code flow.
pub fn authorization_url(credentials: &ClientCredentials) -> Result<Url> {
    Url::parse_with_params(
        AUTH_URL,
        &[
            ("client_id", credentials.client_id.as_str()),
            ("redirect_uri", REDIRECT_URI),
            ("response_type", "code"),
            ("scope", DRIVE_SCOPE),
            ("access_type", "offline"),
            ("prompt", "consent"),
        ],
    )
    .map_err(|e| Error::InvalidConfig(e.to_string()))
}

/// Exchange an authorization code for a token.
pub async fn exchange_code(
    http: &reqwest::Client,
    credentials: &ClientCredentials,
    code: &str,
) -> Result<Token> {
    let params = [
        ("client_id", credentials.client_id.as_str()),
        ("client_secret", credentials.client_secret.as_str()),
        ("code", code),
        ("redirect_uri", REDIRECT_URI),
        ("grant_type", "authorization_code"),
    ];
    let response = http
        .post(TOKEN_URL)
        .form(&params)
        .send()
        .await
        .map_err(|e| Error::Auth(e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Auth(format!("code exchange returned {}: {}", status, body)));
    }

    let response: TokenResponse = response
        .json()
        .await
        .map_err(|e| Error::Auth(e.to_string()))?;
    response.into_token(None)
}

pub async fn load_token(path: &std::path::Path) -> Result<Token> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|e| Error::Auth(format!("could not read {}: {}", path.display(), e)))?;
    serde_json::from_slice(&raw).map_err(|e| Error::Auth(format!("malformed token: {}", e)))
}

pub async fn save_token(path: &std::path::Path, token: &Token) -> Result<()> {
    let raw = serde_json::to_vec_pretty(token)?;
    tokio::fs::write(path, raw).await?;
    Ok(())
}
