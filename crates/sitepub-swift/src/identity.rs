//! Rackspace identity (Keystone v2) API-key authentication.

use serde::Deserialize;
use serde_json::json;
use sitepub_core::{PublishError, Result};
use tracing::debug;
use url::Url;

pub const DEFAULT_IDENTITY_URL: &str = "https://identity.api.rackspacecloud.com/v2.0/";

/// Catalog name of the object storage service.
const OBJECT_STORE_SERVICE: &str = "cloudFiles";

/// An authenticated session against one region's object store.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub token: String,
    pub storage_url: Url,
}

#[derive(Debug, Deserialize)]
struct TokensResponse {
    access: Access,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Access {
    token: Token,
    #[serde(default)]
    service_catalog: Vec<Service>,
}

#[derive(Debug, Deserialize)]
struct Token {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Service {
    name: String,
    #[serde(default)]
    endpoints: Vec<Endpoint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Endpoint {
    #[serde(default)]
    region: Option<String>,
    #[serde(rename = "publicURL")]
    public_url: String,
}

/// Exchange a username and API key for a token and the storage URL of `region`.
pub async fn authenticate(
    http: &reqwest::Client,
    identity_url: &Url,
    username: &str,
    api_key: &str,
    region: &str,
) -> Result<Session> {
    let tokens_url = identity_url
        .join("tokens")
        .map_err(|e| PublishError::InvalidTarget(format!("invalid IDENTITY_URL: {}", e)))?;

    let resp = http
        .post(tokens_url)
        .json(&json!({
            "auth": {
                "RAX-KSKEY:apiKeyCredentials": {
                    "username": username,
                    "apiKey": api_key,
                }
            }
        }))
        .send()
        .await
        .map_err(|e| PublishError::Authentication(format!("identity request failed: {}", e)))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(PublishError::Authentication(format!(
            "identity service rejected {}: {} {}",
            username, status, body
        )));
    }

    let tokens: TokensResponse = resp.json().await.map_err(|e| {
        PublishError::Authentication(format!("invalid identity response: {}", e))
    })?;

    let storage_url = storage_endpoint(&tokens.access.service_catalog, region)?;
    debug!("Object store endpoint for {}: {}", region, storage_url);

    Ok(Session {
        token: tokens.access.token.id,
        storage_url,
    })
}

fn storage_endpoint(catalog: &[Service], region: &str) -> Result<Url> {
    let endpoint = catalog
        .iter()
        .filter(|s| s.name == OBJECT_STORE_SERVICE)
        .flat_map(|s| s.endpoints.iter())
        .find(|e| {
            e.region
                .as_deref()
                .is_some_and(|r| r.eq_ignore_ascii_case(region))
        })
        .ok_or_else(|| {
            PublishError::Authentication(format!(
                "no {} endpoint for region {}",
                OBJECT_STORE_SERVICE, region
            ))
        })?;

    Url::parse(&endpoint.public_url).map_err(|e| {
        PublishError::Authentication(format!(
            "invalid storage URL {}: {}",
            endpoint.public_url, e
        ))
    })
}
