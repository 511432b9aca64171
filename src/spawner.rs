//! Launching registry packages as local MCP server processes.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::StdioConfig;
use crate::error::{McpError, Result};
use crate::inputs::{build_argument_list, build_value_map};
use crate::protocol::McpTransport;
use crate::registry::{RegistryKind, ResolvedPackage};
use crate::transports::StdioTransport;

/// A resource released during spawner disposal
#[async_trait]
pub trait Disposable: Send + Sync {
    async fn dispose(&self) -> Result<()>;
}

/// Spawns a package as a subprocess speaking MCP over its standard streams.
///
/// The registry kind decides the launcher command and version-pin syntax;
/// everything else is identical across kinds.
pub struct PackageSpawner {
    kind: RegistryKind,
    package: ResolvedPackage,
    argument_overrides: HashMap<usize, String>,
    env_overrides: HashMap<String, String>,
    disposers: Mutex<Vec<Arc<dyn Disposable>>>,
}

impl PackageSpawner {
    pub fn new(kind: RegistryKind, package: ResolvedPackage) -> Self {
        Self {
            kind,
            package,
            argument_overrides: HashMap::new(),
            env_overrides: HashMap::new(),
            disposers: Mutex::new(Vec::new()),
        }
    }

    /// Externally supplied package-argument values keyed by position index
    pub fn with_argument_overrides(mut self, overrides: HashMap<usize, String>) -> Self {
        self.argument_overrides = overrides;
        self
    }

    /// Externally supplied environment values keyed by name
    pub fn with_env_overrides(mut self, overrides: HashMap<String, String>) -> Self {
        self.env_overrides = overrides;
        self
    }

    pub fn kind(&self) -> RegistryKind {
        self.kind
    }

    fn pinned_identifier(&self) -> String {
        match &self.package.version {
            Some(version) => format!(
                "{}{}{}",
                self.package.identifier,
                self.kind.version_separator(),
                version
            ),
            None => self.package.identifier.clone(),
        }
    }

    /// Assemble `<launcher> [runtime args] <pinned identifier> [package args]`
    /// plus the environment map.
    pub fn build_command(&self) -> Result<(String, Vec<String>, HashMap<String, String>)> {
        if self.package.identifier.trim().is_empty() {
            return Err(McpError::MissingIdentifier);
        }

        let mut args = build_argument_list(&self.package.runtime_arguments, &HashMap::new())?;
        args.push(self.pinned_identifier());
        args.extend(build_argument_list(
            &self.package.package_arguments,
            &self.argument_overrides,
        )?);

        let env = build_value_map(&self.package.environment_variables, &self.env_overrides)?;

        Ok((self.kind.launcher().to_string(), args, env))
    }

    /// Launch the package and return a running stdio transport.
    ///
    /// The spawner keeps a shutdown handle for the child so [`dispose`]
    /// can terminate it even after the transport has been handed away.
    pub async fn spawn(&self) -> Result<Box<dyn McpTransport>> {
        if self.package.file_sha256.is_some() {
            warn!(
                "Package '{}' declares a content hash pin, which '{}' cannot verify; ignoring",
                self.package.identifier,
                self.kind.launcher()
            );
        }
        if self.package.transport_kind != "stdio" {
            warn!(
                "Package '{}' declares transport '{}'; treating as stdio",
                self.package.identifier, self.package.transport_kind
            );
        }

        let (command, args, env) = self.build_command()?;
        info!(
            "Spawning {} package '{}' via {}",
            self.kind, self.package.identifier, command
        );

        let mut transport = StdioTransport::new(StdioConfig {
            command,
            args,
            cwd: None,
            env,
        });
        transport.connect().await?;

        self.disposers
            .lock()
            .push(Arc::new(transport.shutdown_handle()));

        Ok(Box::new(transport))
    }

    /// Terminate everything this spawner launched.
    ///
    /// Settle-all semantics: every disposer runs, failures are logged and do
    /// not stop the rest. Idempotent and safe before `spawn`.
    pub async fn dispose(&self) {
        let disposers: Vec<Arc<dyn Disposable>> = {
            let mut guard = self.disposers.lock();
            guard.drain(..).collect()
        };

        let results = join_all(disposers.iter().map(|d| d.dispose())).await;
        for result in results {
            if let Err(e) = result {
                warn!("Spawner disposal failed: {}", e);
            }
        }
    }
}
