//! Shared Key authorisation for the Blob service.
//!
//! Each request is signed with HMAC-SHA256 over its canonical form, keyed
//! with the decoded storage account key.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Request;
use sha2::Sha256;
use sitepub_core::{PublishError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Standard headers covered by the signature, in signing order.
const SIGNED_HEADERS: &[&str] = &[
    "content-encoding",
    "content-language",
    "content-length",
    "content-md5",
    "content-type",
    "date",
    "if-modified-since",
    "if-match",
    "if-none-match",
    "if-unmodified-since",
    "range",
];

/// Account name plus decoded account key.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey {
    account_name: String,
    key: Vec<u8>,
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedKey")
            .field("account_name", &self.account_name)
            .finish_non_exhaustive()
    }
}

impl SharedKey {
    /// `account_key` is the base64 key shown in the portal.
    pub fn new(account_name: &str, account_key: &str) -> Result<Self> {
        let key = STANDARD.decode(account_key.trim()).map_err(|_| {
            PublishError::InvalidTarget("AccountKey is not valid base64".to_string())
        })?;
        if key.is_empty() {
            return Err(PublishError::InvalidTarget("AccountKey is empty".to_string()));
        }
        Ok(Self {
            account_name: account_name.to_string(),
            key,
        })
    }

    pub fn account_name(&self) -> &str {
        &self.account_name
    }

    /// Add `x-ms-date` and the `Authorization: SharedKey` header.
    pub fn sign(&self, request: &mut Request) -> Result<()> {
        let date = chrono::Utc::now()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        request.headers_mut().insert("x-ms-date", header_value(&date)?);

        let signature = self.signature(&string_to_sign(request, &self.account_name))?;
        let authorization = format!("SharedKey {}:{}", self.account_name, signature);
        request
            .headers_mut()
            .insert(AUTHORIZATION, header_value(&authorization)?);
        Ok(())
    }

    fn signature(&self, string_to_sign: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| PublishError::InvalidTarget(format!("unusable AccountKey: {}", e)))?;
        mac.update(string_to_sign.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| PublishError::Backend(format!("invalid header value: {}", e)))
}

/// Canonical request text for the 2009-09-19+ Shared Key scheme.
pub fn string_to_sign(request: &Request, account_name: &str) -> String {
    let headers = request.headers();
    let body_len = request
        .body()
        .and_then(|b| b.as_bytes())
        .map(<[u8]>::len)
        .unwrap_or(0);

    let mut out = String::new();
    out.push_str(request.method().as_str());
    out.push('\n');
    for name in SIGNED_HEADERS {
        let value = match *name {
            // Zero length is signed as empty
            "content-length" if body_len > 0 => body_len.to_string(),
            "content-length" => String::new(),
            _ => header_str(headers, name),
        };
        out.push_str(&value);
        out.push('\n');
    }
    out.push_str(&canonical_headers(headers));
    out.push_str(&canonical_resource(request, account_name));
    out
}

fn header_str(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn canonical_headers(headers: &HeaderMap) -> String {
    let ms_headers: BTreeMap<String, String> = headers
        .iter()
        .filter(|(name, _)| name.as_str().starts_with("x-ms-"))
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().trim().to_string(),
            )
        })
        .collect();

    ms_headers
        .into_iter()
        .map(|(name, value)| format!("{}:{}\n", name, value))
        .collect()
}

fn canonical_resource(request: &Request, account_name: &str) -> String {
    let url = request.url();
    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in url.query_pairs() {
        params
            .entry(name.to_lowercase())
            .or_default()
            .push(value.into_owned());
    }

    let mut out = format!("/{}{}", account_name, url.path());
    for (name, mut values) in params {
        values.sort();
        out.push_str(&format!("\n{}:{}", name, values.join(",")));
    }
    out
}
