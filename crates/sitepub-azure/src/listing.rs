//! List Blobs response parsing.

use quick_xml::de::from_str;
use serde::Deserialize;
use sitepub_core::{base64_md5_to_hex, PublishError, Result};

/// One page of a List Blobs enumeration.
#[derive(Debug, Default, PartialEq)]
pub struct BlobPage {
    /// `(name, hex MD5)` per blob.
    pub blobs: Vec<(String, Option<String>)>,
    pub next_marker: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EnumerationResults {
    #[serde(default)]
    blobs: Blobs,
    #[serde(default)]
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Blobs {
    #[serde(rename = "Blob", default)]
    blob: Vec<Blob>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Blob {
    name: String,
    #[serde(default)]
    properties: Option<BlobProperties>,
}

#[derive(Debug, Deserialize)]
struct BlobProperties {
    #[serde(rename = "Content-MD5", default)]
    content_md5: Option<String>,
}

impl BlobPage {
    pub fn parse(xml: &str) -> Result<Self> {
        let results: EnumerationResults = from_str(xml)
            .map_err(|e| PublishError::Backend(format!("invalid List Blobs response: {}", e)))?;

        let blobs = results
            .blobs
            .blob
            .into_iter()
            .map(|blob| {
                let digest = blob
                    .properties
                    .and_then(|p| p.content_md5)
                    .filter(|md5| !md5.trim().is_empty())
                    .and_then(|md5| base64_md5_to_hex(&md5));
                (blob.name, digest)
            })
            .collect();

        Ok(Self {
            blobs,
            next_marker: results.next_marker.filter(|m| !m.trim().is_empty()),
        })
    }
}
