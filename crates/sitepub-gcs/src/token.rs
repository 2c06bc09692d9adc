//! OAuth access token for the GCS JSON API, with automatic refresh.

use std::path::Path;

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use sitepub_core::{PublishError, PublishTarget, Result};
use tokio::sync::RwLock;
use tracing::{debug, info};

pub const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Scope requested for service accounts; uploads set object ACLs.
pub const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.full_control";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Lifetime of a signed assertion, the maximum Google accepts.
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// The fields of a service-account JSON key file used for the JWT grant.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key_id", &self.private_key_id)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

impl ServiceAccountKey {
    /// Read and validate a key file downloaded from the Cloud console.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(PublishError::InvalidTarget(format!(
                "credentials file does not exist: {}",
                path.display()
            )));
        }
        let raw = std::fs::read_to_string(path)?;
        let key: Self = serde_json::from_str(&raw).map_err(|e| {
            PublishError::InvalidTarget(format!(
                "invalid service account key {}: {}",
                path.display(),
                e
            ))
        })?;
        key.encoding_key()?;
        Ok(key)
    }

    fn encoding_key(&self) -> Result<EncodingKey> {
        EncodingKey::from_rsa_pem(self.private_key.as_bytes()).map_err(|e| {
            PublishError::InvalidTarget(format!(
                "invalid private key for {}: {}",
                self.client_email, e
            ))
        })
    }

    /// RS256 assertion for the JWT-bearer grant against `audience`.
    fn sign_assertion(&self, audience: &str) -> Result<String> {
        #[derive(Serialize)]
        struct Claims<'a> {
            iss: &'a str,
            scope: &'a str,
            aud: &'a str,
            iat: i64,
            exp: i64,
        }

        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            iss: &self.client_email,
            scope: STORAGE_SCOPE,
            aud: audience,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.private_key_id.clone();

        encode(&header, &claims, &self.encoding_key()?).map_err(|e| {
            PublishError::Authentication(format!("failed to sign token assertion: {}", e))
        })
    }
}

/// Cached token with expiration.
#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl CachedToken {
    fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(exp) => chrono::Utc::now() >= exp - chrono::Duration::minutes(5),
            None => false,
        }
    }
}

/// Where access tokens come from.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// A pre-issued bearer token, used as is.
    AccessToken(String),
    /// Service-account key signing JWT-bearer grants.
    ServiceAccount(ServiceAccountKey),
    /// OAuth2 `refresh_token` grant.
    RefreshToken {
        client_id: String,
        client_secret: String,
        refresh_token: String,
    },
}

impl Credentials {
    /// `ACCESS_TOKEN`, else the `JSON_CREDENTIALS` key file, else
    /// `CLIENT_ID` + `CLIENT_SECRET` + `REFRESH_TOKEN`.
    pub fn from_target(target: &PublishTarget) -> Result<Self> {
        if let Some(token) = target.get("ACCESS_TOKEN") {
            return Ok(Self::AccessToken(token.to_string()));
        }
        if let Some(path) = target.get("JSON_CREDENTIALS") {
            return Ok(Self::ServiceAccount(ServiceAccountKey::from_file(
                Path::new(path),
            )?));
        }
        if target.get("CLIENT_ID").is_none() && target.get("REFRESH_TOKEN").is_none() {
            return Err(PublishError::missing_option("JSON_CREDENTIALS"));
        }
        Ok(Self::RefreshToken {
            client_id: target.require("CLIENT_ID")?.to_string(),
            client_secret: target.require("CLIENT_SECRET")?.to_string(),
            refresh_token: target.require("REFRESH_TOKEN")?.to_string(),
        })
    }

    /// Identity the tokens are issued to, when known.
    pub fn client_id(&self) -> Option<&str> {
        match self {
            Self::AccessToken(_) => None,
            Self::ServiceAccount(key) => Some(&key.client_email),
            Self::RefreshToken { client_id, .. } => Some(client_id),
        }
    }
}

/// Hands out a valid access token, refreshing it when close to expiry.
pub struct TokenManager {
    http: reqwest::Client,
    token_url: String,
    credentials: Credentials,
    cache: RwLock<Option<CachedToken>>,
}

impl TokenManager {
    pub fn new(http: reqwest::Client, token_url: String, credentials: Credentials) -> Self {
        let cache = match &credentials {
            Credentials::AccessToken(token) => Some(CachedToken {
                access_token: token.clone(),
                expires_at: None,
            }),
            Credentials::ServiceAccount(_) | Credentials::RefreshToken { .. } => None,
        };
        Self {
            http,
            token_url,
            credentials,
            cache: RwLock::new(cache),
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Get a valid access token, refreshing if necessary.
    pub async fn get_valid_token(&self) -> Result<String> {
        if let Some(cached) = self.cache.read().await.as_ref() {
            if !cached.is_expired() {
                return Ok(cached.access_token.clone());
            }
            debug!("GCS access token expired, refreshing");
        }

        let mut cache = self.cache.write().await;
        // Another task may have refreshed while we waited for the lock
        if let Some(cached) = cache.as_ref() {
            if !cached.is_expired() {
                return Ok(cached.access_token.clone());
            }
        }

        let fresh = self.refresh_token().await?;
        let access_token = fresh.access_token.clone();
        *cache = Some(fresh);
        Ok(access_token)
    }

    /// Obtain a fresh token with the grant matching the credentials.
    async fn refresh_token(&self) -> Result<CachedToken> {
        match &self.credentials {
            Credentials::AccessToken(_) => Err(PublishError::Authentication(
                "static GCS access token has expired".to_string(),
            )),
            Credentials::ServiceAccount(key) => {
                let token_url = key.token_uri.as_deref().unwrap_or(&self.token_url);
                let assertion = key.sign_assertion(token_url)?;
                debug!("Requesting GCS access token for {}", key.client_email);
                self.request_token(
                    token_url,
                    &[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())],
                )
                .await
            }
            Credentials::RefreshToken {
                client_id,
                client_secret,
                refresh_token,
            } => {
                self.request_token(
                    &self.token_url,
                    &[
                        ("client_id", client_id.as_str()),
                        ("client_secret", client_secret.as_str()),
                        ("refresh_token", refresh_token.as_str()),
                        ("grant_type", "refresh_token"),
                    ],
                )
                .await
            }
        }
    }

    async fn request_token(&self, token_url: &str, form: &[(&str, &str)]) -> Result<CachedToken> {
        let resp = self
            .http
            .post(token_url)
            .form(form)
            .send()
            .await
            .map_err(|e| PublishError::Authentication(format!("OAuth token request failed: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(PublishError::Authentication(format!(
                "OAuth token refresh failed: {} {}",
                status, body
            )));
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: u64,
        }

        let token_resp: TokenResponse = resp.json().await.map_err(|e| {
            PublishError::Authentication(format!("invalid OAuth token response: {}", e))
        })?;

        let expires_at =
            chrono::Utc::now() + chrono::Duration::seconds(token_resp.expires_in as i64);
        info!("Refreshed GCS access token, expires at {}", expires_at.to_rfc3339());

        Ok(CachedToken {
            access_token: token_resp.access_token,
            expires_at: Some(expires_at),
        })
    }
}
