//! Package registry descriptors and spawner selection.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{McpError, Result};
use crate::inputs::{ArgumentSpec, KeyValueSpec};
use crate::spawner::PackageSpawner;

/// Supported package registries. Adding a kind extends this enum and the
/// exhaustive match in [`PackageResolver::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    Npm,
    Pypi,
}

impl RegistryKind {
    /// Launcher command for this registry
    pub fn launcher(&self) -> &'static str {
        match self {
            RegistryKind::Npm => "npx",
            RegistryKind::Pypi => "uvx",
        }
    }

    /// Version-pin separator in `identifier<sep>version`
    pub fn version_separator(&self) -> &'static str {
        match self {
            RegistryKind::Npm => "@",
            RegistryKind::Pypi => "==",
        }
    }
}

impl std::fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryKind::Npm => write!(f, "npm"),
            RegistryKind::Pypi => write!(f, "pypi"),
        }
    }
}

impl FromStr for RegistryKind {
    type Err = McpError;

    fn from_str(s: &str) -> std::result::Result<Self, McpError> {
        match s {
            "npm" => Ok(RegistryKind::Npm),
            "pypi" => Ok(RegistryKind::Pypi),
            other => Err(McpError::UnsupportedRegistryKind(other.to_string())),
        }
    }
}

fn default_transport_kind() -> String {
    "stdio".to_string()
}

/// A declared package flattened together with user-supplied input values.
/// Immutable once handed to a spawner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedPackage {
    pub identifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub registry_kind: String,
    #[serde(default = "default_transport_kind")]
    pub transport_kind: String,
    /// Content-hash pin from the registry; launchers cannot verify it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_sha256: Option<String>,
    #[serde(default)]
    pub runtime_arguments: Vec<ArgumentSpec>,
    #[serde(default)]
    pub package_arguments: Vec<ArgumentSpec>,
    #[serde(default)]
    pub environment_variables: Vec<KeyValueSpec>,
}

/// Selects and constructs the spawner matching a package's registry kind
pub struct PackageResolver;

impl PackageResolver {
    /// Fails fast with [`McpError::UnsupportedRegistryKind`] before any
    /// spawner state is built.
    pub fn resolve(package: ResolvedPackage) -> Result<PackageSpawner> {
        let kind = RegistryKind::from_str(&package.registry_kind)?;
        Ok(match kind {
            RegistryKind::Npm => PackageSpawner::new(RegistryKind::Npm, package),
            RegistryKind::Pypi => PackageSpawner::new(RegistryKind::Pypi, package),
        })
    }
}
