//! Locations of the artifacts a bucket needs on a worker: app bundles, test bundles, simulator
//! settings files and the like.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// What a resource is used for. Only informs diagnostics; resolution depends solely on the
/// [ResourceLocation].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    AdditionalAppBundle,
    AppBundle,
    Fbsimctl,
    Fbxctest,
    Plugin,
    RunnerApp,
    SimulatorLocalization,
    PreBootGlobalPreference,
    TestBundle,
    WatchdogSettings,
}

impl ResourceKind {
    pub fn name(&self) -> &'static str {
        match self {
            ResourceKind::AdditionalAppBundle => "additional app bundle",
            ResourceKind::AppBundle => "app bundle",
            ResourceKind::Fbsimctl => "fbsimctl",
            ResourceKind::Fbxctest => "fbxctest",
            ResourceKind::Plugin => "plugin",
            ResourceKind::RunnerApp => "xct runner app",
            ResourceKind::SimulatorLocalization => "simulator localization settings",
            ResourceKind::PreBootGlobalPreference => "pre boot .GlobalPreferences.plist",
            ResourceKind::TestBundle => "xctest bundle",
            ResourceKind::WatchdogSettings => "watchdog settings",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ResourceLocation {
    LocalFilePath(PathBuf),
    RemoteUrl(String),
}

/// A [ResourceLocation] together with what it locates.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypedResourceLocation {
    pub kind: ResourceKind,
    pub location: ResourceLocation,
}

impl TypedResourceLocation {
    pub fn local(kind: ResourceKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            location: ResourceLocation::LocalFilePath(path.into()),
        }
    }

    pub fn remote(kind: ResourceKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            location: ResourceLocation::RemoteUrl(url.into()),
        }
    }
}

impl fmt::Display for TypedResourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            ResourceLocation::LocalFilePath(path) => {
                write!(f, "{} at {}", self.kind.name(), path.display())
            }
            ResourceLocation::RemoteUrl(url) => write!(f, "{} at {}", self.kind.name(), url),
        }
    }
}

/// Where a resource can be read from on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedLocation {
    /// The resource is already on the local filesystem.
    Local(PathBuf),
    /// The resource must be fetched from `url` into `cache_path`. Whether it is already there is
    /// up to the fetcher.
    Fetch { url: String, cache_path: PathBuf },
}

impl ResolvedLocation {
    pub fn path(&self) -> &Path {
        match self {
            ResolvedLocation::Local(path) => path,
            ResolvedLocation::Fetch { cache_path, .. } => cache_path,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("{kind} does not exist at {path}")]
    MissingLocalResource { kind: &'static str, path: PathBuf },
    #[error("{kind} has an empty URL")]
    EmptyUrl { kind: &'static str },
}

/// Resolves a resource to a place on this host. Remote resources are keyed in `cache_dir` by a
/// digest of their URL, so the same URL always lands at the same cache path.
pub fn resolve(
    resource: &TypedResourceLocation,
    cache_dir: &Path,
) -> Result<ResolvedLocation, ResolveError> {
    let kind = resource.kind.name();
    match &resource.location {
        ResourceLocation::LocalFilePath(path) => {
            if !path.exists() {
                return Err(ResolveError::MissingLocalResource {
                    kind,
                    path: path.clone(),
                });
            }
            Ok(ResolvedLocation::Local(path.clone()))
        }
        ResourceLocation::RemoteUrl(url) => {
            if url.trim().is_empty() {
                return Err(ResolveError::EmptyUrl { kind });
            }
            let digest = blake3::hash(url.as_bytes());
            Ok(ResolvedLocation::Fetch {
                url: url.clone(),
                cache_path: cache_dir.join(digest.to_hex().as_str()),
            })
        }
    }
}
