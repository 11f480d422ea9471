//! The asset manifest: the fixed, ordered list of paths pre-cached into
//! the static partition.

use std::collections::HashSet;

use thiserror::Error;
use url::Url;

use crate::router::request::InterceptedRequest;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    #[error("Manifest entry is not an absolute path: {0:?}")]
    NotAbsolute(String),

    #[error("Duplicate manifest entry: {0}")]
    Duplicate(String),

    #[error("Manifest entry {path:?} cannot be resolved against {origin}")]
    Unresolvable { path: String, origin: String },
}

/// Validated asset list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetManifest {
    paths: Vec<String>,
}

impl AssetManifest {
    /// Every entry must start with `/` and appear once.
    pub fn new(paths: Vec<String>) -> Result<Self, ManifestError> {
        let mut seen = HashSet::new();
        for path in &paths {
            if !path.starts_with('/') || path.starts_with("//") {
                return Err(ManifestError::NotAbsolute(path.clone()));
            }
            if !seen.insert(path.as_str()) {
                return Err(ManifestError::Duplicate(path.clone()));
            }
        }
        Ok(Self { paths })
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.iter().any(|p| p == path)
    }

    /// GET requests for every entry on `origin`, in manifest order.
    pub fn requests(&self, origin: &Url) -> Result<Vec<InterceptedRequest>, ManifestError> {
        self.paths
            .iter()
            .map(|path| {
                origin
                    .join(path)
                    .map(InterceptedRequest::get)
                    .map_err(|_| ManifestError::Unresolvable {
                        path: path.clone(),
                        origin: origin.to_string(),
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_manifest;

    #[test]
    fn test_default_manifest_is_valid() {
        let manifest = AssetManifest::new(default_manifest()).unwrap();
        assert_eq!(manifest.len(), 9);
        assert!(manifest.contains("/style.css"));
    }

    #[test]
    fn test_relative_and_protocol_relative_rejected() {
        assert_eq!(
            AssetManifest::new(vec!["style.css".into()]),
            Err(ManifestError::NotAbsolute("style.css".into()))
        );
        assert!(AssetManifest::new(vec!["//cdn.example/x.js".into()]).is_err());
    }

    #[test]
    fn test_duplicates_rejected() {
        let err = AssetManifest::new(vec!["/".into(), "/a".into(), "/a".into()]).unwrap_err();
        assert_eq!(err, ManifestError::Duplicate("/a".into()));
    }

    #[test]
    fn test_requests_resolve_on_origin() {
        let manifest = AssetManifest::new(vec!["/".into(), "/case.html".into()]).unwrap();
        let origin = Url::parse("https://civicpol.example/app/").unwrap();
        let urls: Vec<String> = manifest
            .requests(&origin)
            .unwrap()
            .into_iter()
            .map(|r| r.url.to_string())
            .collect();
        assert_eq!(urls, vec!["https://civicpol.example/", "https://civicpol.example/case.html"]);
    }
}
