//! Top-level registry of active MCP sessions: creation, tool aggregation,
//! exchange access, and disposal.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::{join_all, try_join_all};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use crate::config::ClientConfig;
use crate::error::{McpError, Result};
use crate::notify::{NotificationSink, MCP_MANAGER_UPDATE};
use crate::protocol::{McpProtocolClient, McpTransport};
use crate::recorder::ExchangeRecorder;
use crate::registry::{PackageResolver, ResolvedPackage};
use crate::spawner::PackageSpawner;
use crate::types::{
    McpCallResult, SessionInfos, SessionKey, SessionRecord, SetupKind, ToolExchange, ToolSet,
};

/// Handle to a connected MCP server, as the manager consumes it
#[async_trait]
pub trait SessionClient: Send + Sync {
    async fn tools(&self) -> Result<ToolSet>;
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<McpCallResult>;
    async fn close(&self) -> Result<()>;
}

/// Yields a ready client from a transport (connect + handshake)
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(&self, transport: Box<dyn McpTransport>) -> Result<Box<dyn SessionClient>>;
}

/// Default factory over [`McpProtocolClient`]
pub struct ProtocolClientFactory {
    config: ClientConfig,
}

impl ProtocolClientFactory {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ClientFactory for ProtocolClientFactory {
    async fn connect(&self, transport: Box<dyn McpTransport>) -> Result<Box<dyn SessionClient>> {
        let mut client = McpProtocolClient::new(transport, self.config.clone());
        client.connect().await?;
        let init = client.initialize().await?;
        info!(
            "MCP session initialized: {} v{}",
            init.server_info.name, init.server_info.version
        );
        Ok(Box::new(ManagedClient {
            inner: AsyncMutex::new(client),
        }))
    }
}

/// Serializes protocol access per session; the lock also lets `close` run
/// through `&self`.
struct ManagedClient {
    inner: AsyncMutex<McpProtocolClient>,
}

#[async_trait]
impl SessionClient for ManagedClient {
    async fn tools(&self) -> Result<ToolSet> {
        let client = self.inner.lock().await;
        let tools = client.list_tools().await?;
        Ok(tools.into_iter().map(|t| (t.name.clone(), t)).collect())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<McpCallResult> {
        let client = self.inner.lock().await;
        client.call_tool(name, arguments).await
    }

    async fn close(&self) -> Result<()> {
        let mut client = self.inner.lock().await;
        client.disconnect().await
    }
}

/// Caller-facing identity and display fields for a new session
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub internal_provider_id: String,
    pub server_id: String,
    pub index: u32,
    pub name: String,
    pub description: Option<String>,
}

struct SessionEntry {
    record: SessionRecord,
    client: Box<dyn SessionClient>,
    spawner: Option<PackageSpawner>,
}

/// Registry of active sessions keyed by the rendered composite key.
pub struct ConnectionManager {
    sessions: DashMap<String, Arc<SessionEntry>>,
    /// Keys reserved by in-flight registrations; checked together with
    /// `sessions` under one lock so a key never has two owners
    pending: Mutex<HashSet<String>>,
    /// Registration order, drives deterministic tool-set merging
    order: Mutex<Vec<String>>,
    recorder: Arc<ExchangeRecorder>,
    sink: Arc<dyn NotificationSink>,
    factory: Arc<dyn ClientFactory>,
}

impl ConnectionManager {
    pub fn new(sink: Arc<dyn NotificationSink>, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            sessions: DashMap::new(),
            pending: Mutex::new(HashSet::new()),
            order: Mutex::new(Vec::new()),
            recorder: Arc::new(ExchangeRecorder::new(sink.clone())),
            sink,
            factory,
        }
    }

    /// Manager wired to the standard protocol client
    pub fn with_default_factory(sink: Arc<dyn NotificationSink>) -> Self {
        let factory = Arc::new(ProtocolClientFactory::new(ClientConfig::default()));
        Self::new(sink, factory)
    }

    /// Register a session over a caller-supplied remote transport
    pub async fn register_remote_session(
        &self,
        params: SessionParams,
        transport: Box<dyn McpTransport>,
        url: Option<String>,
    ) -> Result<String> {
        self.register(params, SetupKind::Remote, transport, url, None)
            .await
    }

    /// Resolve, spawn, and register a package-backed local session
    pub async fn register_package_session(
        &self,
        params: SessionParams,
        package: ResolvedPackage,
    ) -> Result<String> {
        let spawner = PackageResolver::resolve(package)?;
        let transport = spawner.spawn().await?;
        self.register(params, SetupKind::Package, transport, None, Some(spawner))
            .await
    }

    /// Common registration path. Atomic from the caller's view: either the
    /// session becomes active or no trace remains.
    async fn register(
        &self,
        params: SessionParams,
        setup: SetupKind,
        transport: Box<dyn McpTransport>,
        url: Option<String>,
        spawner: Option<PackageSpawner>,
    ) -> Result<String> {
        let key = SessionKey {
            internal_provider_id: params.internal_provider_id.clone(),
            server_id: params.server_id.clone(),
            setup,
            index: params.index,
        }
        .to_string();

        // Reserve the key before awaiting anything so a concurrent
        // registration of the same key fails here, not after both connected
        let reserved = {
            let mut pending = self.pending.lock();
            !self.sessions.contains_key(&key) && pending.insert(key.clone())
        };
        if !reserved {
            if let Some(spawner) = &spawner {
                spawner.dispose().await;
            }
            return Err(McpError::SessionExists(key));
        }

        info!("Registering MCP session '{}'", key);

        let wrapped = self.recorder.clone().instrument(&key, transport);
        let client = match self.factory.connect(wrapped).await {
            Ok(client) => client,
            Err(e) => {
                error!(
                    "Failed to register MCP session '{}' for provider '{}': {}",
                    key, params.internal_provider_id, e
                );
                self.recorder.clear(&key);
                if let Some(spawner) = &spawner {
                    spawner.dispose().await;
                }
                self.pending.lock().remove(&key);
                return Err(McpError::ClientConstruction(e.to_string()));
            }
        };

        let record = SessionRecord {
            id: key.clone(),
            infos: SessionInfos {
                internal_provider_id: params.internal_provider_id,
                server_id: params.server_id,
                remote_index: params.index,
            },
            name: params.name,
            url,
            description: params.description,
            created_at: Utc::now(),
        };

        self.sessions.insert(
            key.clone(),
            Arc::new(SessionEntry {
                record,
                client,
                spawner,
            }),
        );
        self.order.lock().push(key.clone());
        self.pending.lock().remove(&key);

        self.sink
            .send(MCP_MANAGER_UPDATE, serde_json::json!({ "registered": key }));

        Ok(key)
    }

    /// Aggregate tool declarations across sessions into one map.
    ///
    /// With `selected`, keys without a live client are silently skipped.
    /// All tool listings are issued concurrently and the whole batch fails
    /// on the first failure. Name collisions resolve last-write-wins in
    /// registration order.
    pub async fn tool_set(&self, selected: Option<&[String]>) -> Result<ToolSet> {
        let entries: Vec<Arc<SessionEntry>> = match selected {
            Some(keys) => keys
                .iter()
                .filter_map(|key| self.sessions.get(key).map(|e| e.value().clone()))
                .collect(),
            None => {
                let order = self.order.lock().clone();
                order
                    .iter()
                    .filter_map(|key| self.sessions.get(key).map(|e| e.value().clone()))
                    .collect()
            }
        };

        let maps = try_join_all(entries.iter().map(|entry| entry.client.tools())).await?;

        let mut set = ToolSet::new();
        for map in maps {
            set.extend(map);
        }
        Ok(set)
    }

    /// Invoke a tool on one session. The exchange is recorded transparently
    /// at the instrumented transport.
    pub async fn call_tool(
        &self,
        key: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<McpCallResult> {
        let entry = self
            .sessions
            .get(key)
            .map(|e| e.value().clone())
            .ok_or_else(|| McpError::SessionNotFound(key.to_string()))?;

        entry.client.call_tool(tool_name, arguments).await
    }

    /// Close and forget one session. Unknown keys are a hard error so stale
    /// references are distinguishable from "nothing to do".
    pub async fn remove_session(&self, key: &str) -> Result<()> {
        let (_, entry) = self
            .sessions
            .remove(key)
            .ok_or_else(|| McpError::SessionNotFound(key.to_string()))?;
        self.order.lock().retain(|k| k != key);

        info!("Removing MCP session '{}'", key);

        if let Err(e) = entry.client.close().await {
            warn!("Error closing MCP session '{}': {}", key, e);
        }
        if let Some(spawner) = &entry.spawner {
            spawner.dispose().await;
        }

        self.recorder.clear(key);

        self.sink
            .send(MCP_MANAGER_UPDATE, serde_json::json!({ "removed": key }));

        Ok(())
    }

    /// Snapshot of all session records in registration order
    pub fn list_sessions(&self) -> Vec<SessionRecord> {
        let order = self.order.lock().clone();
        order
            .iter()
            .filter_map(|key| self.sessions.get(key).map(|e| e.record.clone()))
            .collect()
    }

    /// Recorded exchanges for one session key
    pub fn exchanges(&self, key: &str) -> Vec<ToolExchange> {
        self.recorder.exchanges(key)
    }

    /// Close every session, settle-all: one failing close never prevents
    /// the others. Intended for host shutdown.
    pub async fn dispose_all(&self) {
        let keys: Vec<String> = {
            let mut order = self.order.lock();
            order.drain(..).collect()
        };

        let mut entries = Vec::new();
        for key in &keys {
            if let Some((_, entry)) = self.sessions.remove(key) {
                entries.push(entry);
            }
        }

        join_all(entries.iter().map(|entry| async move {
            if let Err(e) = entry.client.close().await {
                warn!("Error closing MCP session '{}': {}", entry.record.id, e);
            }
            if let Some(spawner) = &entry.spawner {
                spawner.dispose().await;
            }
        }))
        .await;

        for key in &keys {
            self.recorder.clear(key);
        }

        self.sink
            .send(MCP_MANAGER_UPDATE, serde_json::json!({ "disposed": keys }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::McpTool;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct RecordingSink {
        events: Mutex<Vec<(String, Value)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.events.lock().len()
        }
    }

    impl NotificationSink for RecordingSink {
        fn send(&self, event: &str, payload: Value) {
            self.events.lock().push((event.to_string(), payload));
        }
    }

    struct FakeClient {
        tools: ToolSet,
        fail_tools: bool,
        fail_close: bool,
        closed: Arc<AtomicBool>,
    }

    impl FakeClient {
        fn with_tool(name: &str, description: &str) -> Box<Self> {
            let mut tools = ToolSet::new();
            tools.insert(
                name.to_string(),
                McpTool {
                    name: name.to_string(),
                    description: description.to_string(),
                    parameters: serde_json::json!({}),
                },
            );
            Box::new(Self {
                tools,
                fail_tools: false,
                fail_close: false,
                closed: Arc::new(AtomicBool::new(false)),
            })
        }
    }

    #[async_trait]
    impl SessionClient for FakeClient {
        async fn tools(&self) -> Result<ToolSet> {
            if self.fail_tools {
                return Err(McpError::Disconnected);
            }
            Ok(self.tools.clone())
        }

        async fn call_tool(&self, _name: &str, _arguments: Value) -> Result<McpCallResult> {
            Ok(McpCallResult {
                content: Vec::new(),
                is_error: false,
            })
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            if self.fail_close {
                return Err(McpError::Disconnected);
            }
            Ok(())
        }
    }

    /// Factory that hands out pre-built clients in order; keeps the wrapped
    /// transports so tests can drive traffic through the recorder.
    struct FakeFactory {
        clients: Mutex<VecDeque<Result<Box<dyn SessionClient>>>>,
        transports: Mutex<Vec<Box<dyn McpTransport>>>,
    }

    impl FakeFactory {
        fn new(clients: Vec<Result<Box<dyn SessionClient>>>) -> Arc<Self> {
            Arc::new(Self {
                clients: Mutex::new(clients.into_iter().collect()),
                transports: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ClientFactory for FakeFactory {
        async fn connect(
            &self,
            transport: Box<dyn McpTransport>,
        ) -> Result<Box<dyn SessionClient>> {
            let client = self
                .clients
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(FakeClient::with_tool("noop", "placeholder")));
            self.transports.lock().push(transport);
            client
        }
    }

    struct NullTransport;

    #[async_trait]
    impl McpTransport for NullTransport {
        async fn connect(&mut self) -> Result<()> {
            Ok(())
        }
        async fn disconnect(&mut self) -> Result<()> {
            Ok(())
        }
        async fn send(&self, _message: String) -> Result<()> {
            Ok(())
        }
        async fn receive(&self) -> Result<Option<String>> {
            Ok(None)
        }
        fn is_connected(&self) -> bool {
            true
        }
    }

    fn params(server_id: &str, index: u32) -> SessionParams {
        SessionParams {
            internal_provider_id: "provider-1".to_string(),
            server_id: server_id.to_string(),
            index,
            name: format!("{} server", server_id),
            description: None,
        }
    }

    fn manager_with(
        clients: Vec<Result<Box<dyn SessionClient>>>,
    ) -> (ConnectionManager, Arc<RecordingSink>, Arc<FakeFactory>) {
        let sink = RecordingSink::new();
        let factory = FakeFactory::new(clients);
        (
            ConnectionManager::new(sink.clone(), factory.clone()),
            sink,
            factory,
        )
    }

    #[tokio::test]
    async fn test_register_and_list() {
        let (manager, sink, _) =
            manager_with(vec![Ok(FakeClient::with_tool("search", "searches"))]);

        let key = manager
            .register_remote_session(
                params("github", 0),
                Box::new(NullTransport),
                Some("https://mcp.example.com/sse".to_string()),
            )
            .await
            .unwrap();

        assert_eq!(key, "provider-1:github:remote:0");
        let sessions = manager.list_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, key);
        assert_eq!(sessions[0].infos.server_id, "github");
        assert_eq!(sessions[0].url.as_deref(), Some("https://mcp.example.com/sse"));
        assert_eq!(sink.count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected() {
        let (manager, _, _) = manager_with(vec![
            Ok(FakeClient::with_tool("a", "")),
            Ok(FakeClient::with_tool("b", "")),
        ]);

        manager
            .register_remote_session(params("github", 0), Box::new(NullTransport), None)
            .await
            .unwrap();

        match manager
            .register_remote_session(params("github", 0), Box::new(NullTransport), None)
            .await
        {
            Err(McpError::SessionExists(key)) => {
                assert_eq!(key, "provider-1:github:remote:0");
            }
            other => panic!("expected SessionExists, got {:?}", other),
        }
    }

    /// Factory that reports when connect is entered and then holds the
    /// connect mid-flight until the test releases it
    struct GatedFactory {
        entered: tokio::sync::mpsc::Sender<()>,
        release: Arc<tokio::sync::Barrier>,
    }

    #[async_trait]
    impl ClientFactory for GatedFactory {
        async fn connect(
            &self,
            _transport: Box<dyn McpTransport>,
        ) -> Result<Box<dyn SessionClient>> {
            let _ = self.entered.send(()).await;
            self.release.wait().await;
            Ok(FakeClient::with_tool("noop", ""))
        }
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_registration_rejected() {
        let sink = RecordingSink::new();
        let (entered_tx, mut entered_rx) = tokio::sync::mpsc::channel(1);
        let release = Arc::new(tokio::sync::Barrier::new(2));
        let factory = Arc::new(GatedFactory {
            entered: entered_tx,
            release: release.clone(),
        });
        let manager = Arc::new(ConnectionManager::new(sink.clone(), factory));

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .register_remote_session(params("github", 0), Box::new(NullTransport), None)
                    .await
            })
        };
        // First registration is now inside connect, key reserved
        entered_rx.recv().await.unwrap();

        match manager
            .register_remote_session(params("github", 0), Box::new(NullTransport), None)
            .await
        {
            Err(McpError::SessionExists(key)) => {
                assert_eq!(key, "provider-1:github:remote:0");
            }
            other => panic!("expected SessionExists, got {:?}", other),
        }

        release.wait().await;
        first.await.unwrap().unwrap();

        let sessions = manager.list_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sink.count(), 1);
    }

    #[tokio::test]
    async fn test_failed_registration_leaves_no_trace() {
        let (manager, sink, _) =
            manager_with(vec![Err(McpError::Connection("refused".to_string()))]);

        match manager
            .register_remote_session(params("github", 0), Box::new(NullTransport), None)
            .await
        {
            Err(McpError::ClientConstruction(detail)) => {
                assert!(detail.contains("refused"));
            }
            other => panic!("expected ClientConstruction, got {:?}", other),
        }

        assert!(manager.list_sessions().is_empty());
        assert!(manager.tool_set(None).await.unwrap().is_empty());
        assert_eq!(sink.count(), 0);
    }

    #[tokio::test]
    async fn test_tool_set_last_write_wins() {
        let (manager, _, _) = manager_with(vec![
            Ok(FakeClient::with_tool("search", "from first")),
            Ok(FakeClient::with_tool("search", "from second")),
        ]);

        manager
            .register_remote_session(params("one", 0), Box::new(NullTransport), None)
            .await
            .unwrap();
        manager
            .register_remote_session(params("two", 0), Box::new(NullTransport), None)
            .await
            .unwrap();

        let tools = manager.tool_set(None).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools.get("search").unwrap().description, "from second");
    }

    #[tokio::test]
    async fn test_tool_set_selected_skips_dead_keys() {
        let (manager, _, _) = manager_with(vec![Ok(FakeClient::with_tool("search", ""))]);

        let key = manager
            .register_remote_session(params("one", 0), Box::new(NullTransport), None)
            .await
            .unwrap();

        let selected = vec![key, "provider-1:gone:remote:9".to_string()];
        let tools = manager.tool_set(Some(&selected)).await.unwrap();
        assert_eq!(tools.len(), 1);
    }

    #[tokio::test]
    async fn test_tool_set_fails_whole_batch() {
        let failing = Box::new(FakeClient {
            tools: ToolSet::new(),
            fail_tools: true,
            fail_close: false,
            closed: Arc::new(AtomicBool::new(false)),
        });
        let (manager, _, _) = manager_with(vec![
            Ok(FakeClient::with_tool("search", "")),
            Ok(failing),
        ]);

        manager
            .register_remote_session(params("one", 0), Box::new(NullTransport), None)
            .await
            .unwrap();
        manager
            .register_remote_session(params("two", 0), Box::new(NullTransport), None)
            .await
            .unwrap();

        assert!(manager.tool_set(None).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_unknown_session() {
        let (manager, _, _) = manager_with(vec![]);
        match manager.remove_session("nonexistent:key").await {
            Err(McpError::SessionNotFound(key)) => assert_eq!(key, "nonexistent:key"),
            other => panic!("expected SessionNotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remove_closes_and_clears() {
        let client = FakeClient::with_tool("search", "");
        let closed = client.closed.clone();
        let (manager, sink, factory) = manager_with(vec![Ok(client)]);

        let key = manager
            .register_remote_session(params("one", 0), Box::new(NullTransport), None)
            .await
            .unwrap();

        // Drive one tool call through the instrumented transport so the
        // exchange log has content to clear
        let call = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {"name": "search"},
        })
        .to_string();
        let transport = factory.transports.lock().remove(0);
        transport.send(call).await.unwrap();
        assert_eq!(manager.exchanges(&key).len(), 1);

        manager.remove_session(&key).await.unwrap();

        assert!(closed.load(Ordering::SeqCst));
        assert!(manager.list_sessions().is_empty());
        assert!(manager.exchanges(&key).is_empty());
        // One notification for registration, one for removal
        assert_eq!(sink.count(), 2);

        // Second removal is the hard error and must not notify again
        assert!(matches!(
            manager.remove_session(&key).await,
            Err(McpError::SessionNotFound(_))
        ));
        assert_eq!(sink.count(), 2);
    }

    #[tokio::test]
    async fn test_dispose_all_settles_failures() {
        let failing = Box::new(FakeClient {
            tools: ToolSet::new(),
            fail_tools: false,
            fail_close: true,
            closed: Arc::new(AtomicBool::new(false)),
        });
        let failing_closed = failing.closed.clone();
        let healthy = FakeClient::with_tool("search", "");
        let healthy_closed = healthy.closed.clone();

        let (manager, sink, _) = manager_with(vec![Ok(failing), Ok(healthy)]);

        manager
            .register_remote_session(params("one", 0), Box::new(NullTransport), None)
            .await
            .unwrap();
        manager
            .register_remote_session(params("two", 0), Box::new(NullTransport), None)
            .await
            .unwrap();

        manager.dispose_all().await;

        assert!(failing_closed.load(Ordering::SeqCst));
        assert!(healthy_closed.load(Ordering::SeqCst));
        assert!(manager.list_sessions().is_empty());
        // Two registrations plus the final disposal broadcast
        assert_eq!(sink.count(), 3);
    }

    #[tokio::test]
    async fn test_package_session_with_unsupported_kind() {
        let (manager, _, _) = manager_with(vec![]);
        let package = ResolvedPackage {
            identifier: "whatever".to_string(),
            version: None,
            registry_kind: "cargo".to_string(),
            transport_kind: "stdio".to_string(),
            file_sha256: None,
            runtime_arguments: Vec::new(),
            package_arguments: Vec::new(),
            environment_variables: Vec::new(),
        };

        match manager
            .register_package_session(params("crates", 0), package)
            .await
        {
            Err(McpError::UnsupportedRegistryKind(kind)) => assert_eq!(kind, "cargo"),
            other => panic!("expected UnsupportedRegistryKind, got {:?}", other),
        }
        assert!(manager.list_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_call_tool_unknown_session() {
        let (manager, _, _) = manager_with(vec![]);
        match manager
            .call_tool("missing:key", "search", Value::Null)
            .await
        {
            Err(McpError::SessionNotFound(_)) => {}
            other => panic!("expected SessionNotFound, got {:?}", other),
        }
    }
}
