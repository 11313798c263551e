//! Gateway server
//!
//! Owns the shared component stack, accepts TCP connections, and runs the
//! long-lived background tasks (MVCC GC, session GC, statistics refresh),
//! each cancellable through the shutdown channel.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpListener;

use crate::auth::{AccessControl, Authenticator};
use crate::cache::QueryCache;
use crate::config::GatewayConfig;
use crate::dispatch::ConnectionHandler;
use crate::error::Result;
use crate::fts::FtsRegistry;
use crate::metrics::Metrics;
use crate::optimizer::cost::CostModel;
use crate::optimizer::stats::{StatisticsCache, TableStats};
use crate::optimizer::Optimizer;
use crate::plugin::PluginRegistry;
use crate::session::SessionManager;
use crate::storage::engine::{Isolation, ScanRequest, StorageEngine};
use crate::storage::kv::KvEngine;
use crate::storage::memory::MemoryEngine;
use crate::storage::router::{Router, TableConfigManager};
use crate::storage::schema::{Catalog, DEFAULT_DATABASE};

/// Statistics entries older than this are re-analyzed by the refresh task.
const STATS_STALE_AFTER: Duration = Duration::from_secs(600);
const STATS_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Shared component stack handed to every connection.
pub struct GatewayContext {
    pub config: GatewayConfig,
    pub catalog: Arc<Catalog>,
    pub router: Arc<Router>,
    pub fts: Arc<FtsRegistry>,
    pub optimizer: Arc<Optimizer>,
    pub cache: Arc<QueryCache>,
    pub metrics: Arc<Metrics>,
    pub sessions: Arc<SessionManager>,
    pub auth: Arc<Authenticator>,
    pub acl: Arc<AccessControl>,
    pub plugins: Arc<PluginRegistry>,
}

impl GatewayContext {
    /// Build the stack. `data_dir` enables the persistent KV backend; the
    /// catalog is recovered from it before the server accepts connections.
    pub async fn new(config: GatewayConfig, data_dir: Option<&Path>) -> Result<Arc<Self>> {
        let metrics = Arc::new(Metrics::new());
        let catalog = Arc::new(Catalog::new());
        let memory = Arc::new(MemoryEngine::new(
            config.mvcc.max_active_txns,
            config.mvcc.xid_wrap_threshold,
        ));
        let persistent = match data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                Some(Arc::new(KvEngine::open(&dir.join("sqlexec.db"))?))
            }
            None => None,
        };
        let table_config = Arc::new(TableConfigManager::new());
        let router = Arc::new(Router::new(
            Arc::clone(&memory),
            persistent.clone(),
            Arc::clone(&table_config),
        ));
        let stats = Arc::new(StatisticsCache::new());
        let cost = Arc::new(CostModel::new());
        let optimizer = Arc::new(Optimizer::new(
            Arc::clone(&cost),
            Arc::clone(&stats),
            Arc::clone(&catalog),
        ));
        let cache = Arc::new(QueryCache::new(
            config.cache.query_cache.max_size,
            config.cache.query_cache.ttl,
            Arc::clone(&metrics),
        ));
        let sessions = Arc::new(SessionManager::new(Arc::clone(&metrics)));
        let fts = Arc::new(FtsRegistry::new());

        let ctx = Arc::new(Self {
            config,
            catalog,
            router,
            fts,
            optimizer,
            cache,
            metrics,
            sessions,
            auth: Arc::new(Authenticator::new()),
            acl: Arc::new(AccessControl::new()),
            plugins: Arc::new(PluginRegistry::new()),
        });

        ctx.plugins
            .register(
                crate::plugin::Plugin::Function(Arc::new(
                    crate::plugin::functions::BuiltinFunctionPlugin::new(),
                )),
                &std::collections::HashMap::new(),
            )
            .await?;

        if let Some(kv) = persistent {
            ctx.recover_from_kv(&kv).await?;
        }
        Ok(ctx)
    }

    /// Register a remote HTTP table: fetch its schema, add it to the
    /// catalog and route its operations to the source. The source is also
    /// placed in the plugin registry under its configured name.
    pub async fn register_http_table(
        &self,
        source: Arc<crate::datasource::HttpTableSource>,
        table: &str,
    ) -> Result<()> {
        let desc = source.schema(table).await?;
        self.catalog.register_table(DEFAULT_DATABASE, desc)?;
        self.router
            .register_external(table, Arc::clone(&source) as Arc<dyn StorageEngine>);
        if self.plugins.get(source.source_name()).is_none() {
            self.plugins
                .register(
                    crate::plugin::Plugin::DataSource(source),
                    &std::collections::HashMap::new(),
                )
                .await?;
        }
        Ok(())
    }

    /// Recover persisted tables into the catalog and rebuild their
    /// full-text indexes; memory tables have no persisted state.
    async fn recover_from_kv(&self, kv: &KvEngine) -> Result<()> {
        for desc in kv.stored_tables()? {
            tracing::info!(table = %desc.name, "Recovered persistent table");
            self.router
                .config
                .set_policy(&desc.name, desc.persistence);
            self.catalog
                .register_table(DEFAULT_DATABASE, desc.clone())?;
            if !desc.fulltext.is_empty() {
                self.fts
                    .create(&desc.name, desc.fulltext.clone(), "standard");
                let pk = match desc.primary_key.first() {
                    Some(pk) => pk.clone(),
                    None => continue,
                };
                let txn = self.router.memory.begin(Isolation::Snapshot)?;
                let rows = self
                    .router
                    .scan(&txn, &desc.name, &ScanRequest::default())
                    .await;
                self.router.memory.rollback(&txn);
                for row in rows? {
                    self.fts.index_row(&desc.name, &row, &pk)?;
                }
            }
        }
        Ok(())
    }
}

/// TCP front end.
pub struct SqlServer {
    ctx: Arc<GatewayContext>,
}

impl SqlServer {
    pub fn new(ctx: Arc<GatewayContext>) -> Self {
        Self { ctx }
    }

    /// Bind and serve until the shutdown channel fires.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
        let addr = format!(
            "{}:{}",
            self.ctx.config.server.host, self.ctx.config.server.port
        );
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(%addr, version = %self.ctx.config.server.version, "SQL gateway listening");

        self.spawn_background_tasks(shutdown.clone());

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer) = accepted?;
                    if self.ctx.sessions.active_count() >= self.ctx.config.database.max_connections {
                        tracing::warn!(%peer, "Connection limit reached, refusing client");
                        drop(socket);
                        continue;
                    }
                    tracing::debug!(%peer, "Accepted client connection");
                    let ctx = Arc::clone(&self.ctx);
                    let session = ctx.sessions.create();
                    tokio::spawn(async move {
                        let handler = ConnectionHandler::new(socket, ctx, session);
                        // Panics stop at the session boundary and are logged
                        // as internal errors; the server keeps serving.
                        use futures::FutureExt;
                        match std::panic::AssertUnwindSafe(handler.run()).catch_unwind().await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => tracing::error!(%e, "Connection handler error"),
                            Err(panic) => {
                                let message = panic
                                    .downcast_ref::<&str>()
                                    .map(|s| s.to_string())
                                    .or_else(|| panic.downcast_ref::<String>().cloned())
                                    .unwrap_or_else(|| "unknown panic".to_string());
                                tracing::error!(%message, "Connection handler panicked");
                            }
                        }
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("Shutdown requested, closing listener");
                        break;
                    }
                }
            }
        }

        self.ctx.plugins.stop_all().await;
        Ok(())
    }

    fn spawn_background_tasks(&self, shutdown: tokio::sync::watch::Receiver<bool>) {
        tokio::spawn(crate::storage::memory::gc::run_gc(
            Arc::clone(&self.ctx.router.memory),
            self.ctx.config.mvcc.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(Arc::clone(&self.ctx.sessions).run_gc(
            self.ctx.config.session.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(run_stats_refresh(Arc::clone(&self.ctx), shutdown));
    }
}

/// Background statistics refresh: entries past the staleness threshold are
/// re-analyzed without blocking planners reading other tables.
async fn run_stats_refresh(
    ctx: Arc<GatewayContext>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(STATS_REFRESH_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for table in ctx.optimizer.stats.tables_with_stats() {
                    let stale = ctx
                        .optimizer
                        .stats
                        .get(&table)
                        .map(|entry| {
                            let refreshed = entry.read().unwrap().refreshed_at;
                            Utc::now() - refreshed
                                > chrono::Duration::from_std(STATS_STALE_AFTER)
                                    .expect("constant fits")
                        })
                        .unwrap_or(false);
                    if !stale {
                        continue;
                    }
                    let txn = match ctx.router.memory.begin(Isolation::Snapshot) {
                        Ok(t) => t,
                        Err(_) => continue,
                    };
                    let rows = ctx
                        .router
                        .scan(&txn, &table, &ScanRequest::default())
                        .await;
                    ctx.router.memory.rollback(&txn);
                    if let Ok(rows) = rows {
                        tracing::debug!(table = %table, rows = rows.len(), "Refreshed statistics");
                        ctx.optimizer.stats.put(TableStats::analyze(&table, &rows));
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::debug!("Statistics refresh task shutting down");
                    return;
                }
            }
        }
    }
}
