//! Storage account connection strings.

use sitepub_core::{PublishError, Result};
use url::Url;

use crate::shared_key::SharedKey;

/// How requests to the account are authorised.
#[derive(Debug, Clone, PartialEq)]
pub enum Credential {
    /// Query string appended to every request URL.
    SharedAccessSignature(String),
    /// Requests signed with the account key.
    SharedKey(SharedKey),
}

/// The parts of a connection string a blob client needs.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionString {
    pub blob_endpoint: Url,
    pub credential: Credential,
    pub account_name: Option<String>,
}

impl ConnectionString {
    /// Parse `Key=Value;Key=Value` pairs.
    ///
    /// The blob endpoint is taken from `BlobEndpoint`, or assembled from
    /// `AccountName`, `EndpointSuffix` and `DefaultEndpointsProtocol`. A
    /// `SharedAccessSignature` is used when present, else `AccountName`
    /// with `AccountKey`.
    pub fn parse(value: &str) -> Result<Self> {
        let mut blob_endpoint = None;
        let mut sas = None;
        let mut account_key = None;
        let mut account_name = None;
        let mut endpoint_suffix = None;
        let mut protocol = None;

        for part in value.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            // The segment itself is not echoed, it may hold a secret
            let (key, val) = part.split_once('=').ok_or_else(|| {
                PublishError::InvalidTarget("malformed CONNECTION_STRING segment".to_string())
            })?;
            match key {
                "BlobEndpoint" => blob_endpoint = Some(val.to_string()),
                "SharedAccessSignature" => sas = Some(val.trim_start_matches('?').to_string()),
                "AccountName" => account_name = Some(val.to_string()),
                "AccountKey" => account_key = Some(val.to_string()),
                "EndpointSuffix" => endpoint_suffix = Some(val.to_string()),
                "DefaultEndpointsProtocol" => protocol = Some(val.to_string()),
                _ => {}
            }
        }

        let blob_endpoint = match (blob_endpoint, &account_name, endpoint_suffix) {
            (Some(endpoint), _, _) => endpoint,
            (None, Some(account), suffix) => format!(
                "{}://{}.blob.{}/",
                protocol.as_deref().unwrap_or("https"),
                account,
                suffix.as_deref().unwrap_or("core.windows.net")
            ),
            (None, None, _) => {
                return Err(PublishError::InvalidTarget(
                    "CONNECTION_STRING has neither BlobEndpoint nor AccountName".to_string(),
                ))
            }
        };
        let blob_endpoint = Url::parse(&blob_endpoint).map_err(|e| {
            PublishError::InvalidTarget(format!("invalid blob endpoint {}: {}", blob_endpoint, e))
        })?;

        let credential = match (sas.filter(|s| !s.is_empty()), &account_name, account_key) {
            (Some(sas), _, _) => Credential::SharedAccessSignature(sas),
            (None, Some(account), Some(key)) => Credential::SharedKey(SharedKey::new(account, &key)?),
            _ => {
                return Err(PublishError::InvalidTarget(
                    "CONNECTION_STRING needs a SharedAccessSignature, or AccountName and AccountKey"
                        .to_string(),
                ))
            }
        };

        Ok(Self {
            blob_endpoint,
            credential,
            account_name,
        })
    }
}
