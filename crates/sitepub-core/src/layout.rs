use std::path::{Component, Path, PathBuf};

use url::Url;

use crate::error::{PublishError, Result};
use crate::hash::ContentHasher;

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Maps local files under a site root into a backend's key and URL space.
#[derive(Debug, Clone)]
pub struct SiteLayout {
    root: PathBuf,
    public_url: Option<Url>,
    hasher: ContentHasher,
}

impl SiteLayout {
    pub fn new(root: impl Into<PathBuf>, public_url: Option<Url>) -> Self {
        Self {
            root: root.into(),
            public_url: public_url.map(with_trailing_slash),
            hasher: ContentHasher::new(),
        }
    }

    /// Parse the public base URL from a target option value.
    pub fn parse_public_url(value: &str) -> Result<Url> {
        Url::parse(value).map_err(|e| {
            PublishError::InvalidTarget(format!("invalid PUBLIC_URL {}: {}", value, e))
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn public_url(&self) -> Option<&Url> {
        self.public_url.as_ref()
    }

    pub fn hasher(&self) -> &ContentHasher {
        &self.hasher
    }

    /// Root-relative key using only forward slashes.
    pub fn remote_path(&self, local: &Path) -> Result<String> {
        let relative = local
            .strip_prefix(&self.root)
            .map_err(|_| PublishError::LocalFileMissing {
                path: local.to_path_buf(),
            })?;

        let segments: Vec<String> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().replace('\\', "/")),
                _ => None,
            })
            .collect();

        if segments.is_empty() {
            return Err(PublishError::LocalFileMissing {
                path: local.to_path_buf(),
            });
        }
        Ok(segments.join("/"))
    }

    /// Public URL of a local file: base URL plus its percent-encoded key.
    pub fn remote_url(&self, local: &Path) -> Result<Url> {
        let base = self
            .public_url
            .as_ref()
            .ok_or_else(|| PublishError::missing_option("PUBLIC_URL"))?;
        let remote_path = self.remote_path(local)?;
        join_key(base, &remote_path)
    }

    /// MIME type guessed from the file extension.
    pub fn mime_type(local: &Path) -> String {
        mime_guess::from_path(local)
            .first_raw()
            .unwrap_or(DEFAULT_MIME_TYPE)
            .to_string()
    }
}

/// Append a slash-separated key to a base URL, encoding each segment.
pub fn join_key(base: &Url, key: &str) -> Result<Url> {
    let mut url = with_trailing_slash(base.clone());
    url.path_segments_mut()
        .map_err(|_| {
            PublishError::InvalidTarget(format!("PUBLIC_URL cannot be a base URL: {}", base))
        })?
        .pop_if_empty()
        .extend(key.split('/'));
    Ok(url)
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(public_url: Option<&str>) -> SiteLayout {
        SiteLayout::new(
            "/srv/site",
            public_url.map(|u| SiteLayout::parse_public_url(u).unwrap()),
        )
    }

    #[test]
    fn test_remote_path_strips_root() {
        let layout = layout(None);
        assert_eq!(
            layout.remote_path(Path::new("/srv/site/blog/post/index.html")).unwrap(),
            "blog/post/index.html"
        );
        assert_eq!(
            layout.remote_path(Path::new("/srv/site/index.html")).unwrap(),
            "index.html"
        );
    }

    #[test]
    fn test_remote_path_uses_forward_slashes() {
        let layout = layout(None);
        let path = layout
            .remote_path(Path::new("/srv/site/static\\css\\site.css"))
            .unwrap();
        assert_eq!(path, "static/css/site.css");
        assert!(!path.contains('\\'));
    }

    #[test]
    fn test_remote_path_outside_root() {
        let layout = layout(None);
        assert!(layout.remote_path(Path::new("/etc/passwd")).is_err());
        assert!(layout.remote_path(Path::new("/srv/site")).is_err());
    }

    #[test]
    fn test_remote_url() {
        let layout = layout(Some("https://cdn.example.com/site"));
        let url = layout
            .remote_url(Path::new("/srv/site/blog/my post/index.html"))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://cdn.example.com/site/blog/my%20post/index.html"
        );
    }

    #[test]
    fn test_remote_url_requires_public_url() {
        let layout = layout(None);
        let err = layout.remote_url(Path::new("/srv/site/a.txt")).unwrap_err();
        assert!(matches!(err, PublishError::Configuration { ref key } if key == "PUBLIC_URL"));
    }

    #[test]
    fn test_mime_type() {
        assert_eq!(SiteLayout::mime_type(Path::new("a/index.html")), "text/html");
        assert_eq!(SiteLayout::mime_type(Path::new("a/site.css")), "text/css");
        assert_eq!(
            SiteLayout::mime_type(Path::new("a/blob.unknownext")),
            DEFAULT_MIME_TYPE
        );
    }
}
