//! Which artifact versions can still be deployed.

use std::collections::BTreeSet;
use std::sync::RwLock;

/// Answers whether a version's artifact is still available.
pub trait ArtifactCatalog: Send + Sync {
    fn is_deployable(&self, version: &str) -> bool;
}

/// Treats every version as deployable.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenCatalog;

impl ArtifactCatalog for OpenCatalog {
    fn is_deployable(&self, _version: &str) -> bool {
        true
    }
}

/// Only versions explicitly retained are deployable.
#[derive(Debug, Default)]
pub struct RetainedCatalog {
    versions: RwLock<BTreeSet<String>>,
}

impl RetainedCatalog {
    pub fn new<I, S>(versions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            versions: RwLock::new(versions.into_iter().map(Into::into).collect()),
        }
    }

    pub fn retain(&self, version: &str) {
        self.versions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(version.to_string());
    }

    /// Drop a version, e.g. after its artifact was garbage-collected.
    pub fn retire(&self, version: &str) {
        self.versions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(version);
    }
}

impl ArtifactCatalog for RetainedCatalog {
    fn is_deployable(&self, version: &str) -> bool {
        self.versions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retained_catalog_tracks_versions() {
        let catalog = RetainedCatalog::new(["v1", "v2"]);
        assert!(catalog.is_deployable("v1"));
        assert!(!catalog.is_deployable("v3"));

        catalog.retire("v1");
        catalog.retain("v3");
        assert!(!catalog.is_deployable("v1"));
        assert!(catalog.is_deployable("v3"));
        assert!(OpenCatalog.is_deployable("anything"));
    }
}
