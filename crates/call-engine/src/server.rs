//! # Call Engine Server
//!
//! Runs a [`CallRouter`] together with its background work:
//!
//! - **queue drain**: every `queues.drain_interval_ms`, waiting callers are
//!   handed to members that became free, or timed out. The resulting
//!   directives are published to [`CallEngineServer::subscribe_directives`]
//!   for the signaling layer.
//! - **health monitor**: every `monitoring.health_check_interval_secs`,
//!   queue overflow, unstaffed queues and long waits are alerted, and the
//!   system health report is built.
//! - **maintenance**: every `monitoring.maintenance_interval_secs`, old
//!   queue entries are purged and queue positions renumbered.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            CallEngineServer             │
//! ├──────────────┬───────────────┬──────────┤
//! │ queue drain  │ health monitor│ upkeep   │
//! ├──────────────┴───────────────┴──────────┤
//! │               CallRouter                │
//! ├─────────────────────────────────────────┤
//! │  Directory │ Queues │ Notifications     │
//! ├─────────────────────────────────────────┤
//! │            SQLite (sqlx)                │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use crm_call_engine::server::CallEngineServerBuilder;
//! use crm_call_engine::CallEngineConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = CallEngineServerBuilder::new()
//!     .with_config(CallEngineConfig::default())
//!     .with_in_memory_database()
//!     .build()
//!     .await?;
//!
//! let mut directives = server.subscribe_directives();
//! server.start().await?;
//!
//! tokio::spawn(async move {
//!     while let Ok(directive) = directives.recv().await {
//!         println!("{}", serde_json::to_string(&directive).unwrap_or_default());
//!     }
//! });
//!
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::CallEngineConfig;
use crate::database::DatabaseManager;
use crate::error::{CallEngineError, Result};
use crate::monitoring::{BroadcastNotifier, CompositeNotifier, LogNotifier, Notification, Notifier, StoreNotifier};
use crate::orchestrator::{CallRouter, RoutingDirective};

/// The call engine with its background loops
pub struct CallEngineServer {
    router: Arc<CallRouter>,
    config: CallEngineConfig,

    /// Directives produced by queue drains.
    directives: broadcast::Sender<RoutingDirective>,

    notifications: Option<Arc<BroadcastNotifier>>,

    drain_handle: Option<JoinHandle<()>>,
    health_handle: Option<JoinHandle<()>>,
    maintenance_handle: Option<JoinHandle<()>>,
}

impl CallEngineServer {
    /// Open the database named in `config` and assemble the notifier chain
    /// it asks for.
    pub async fn new(config: CallEngineConfig) -> Result<Self> {
        CallEngineServerBuilder::new().with_config(config).build().await
    }

    /// Same as [`new`](Self::new) on a private in-memory database.
    pub async fn new_in_memory(config: CallEngineConfig) -> Result<Self> {
        CallEngineServerBuilder::new()
            .with_config(config)
            .with_in_memory_database()
            .build()
            .await
    }

    /// Spawn the background loops. Calling `start` twice is an error.
    pub async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(CallEngineError::internal("call engine server already started"));
        }
        info!("🚀 Starting call engine server '{}'", self.config.general.instance_name);

        let router = self.router.clone();
        let directives = self.directives.clone();
        let period = self.config.queues.drain_interval();
        self.drain_handle = Some(tokio::spawn(async move {
            Self::drain_loop(router, directives, period).await;
        }));
        info!("✅ Started queue drain every {:?}", period);

        let router = self.router.clone();
        let period = Duration::from_secs(self.config.monitoring.health_check_interval_secs.max(1));
        self.health_handle = Some(tokio::spawn(async move {
            Self::health_loop(router, period).await;
        }));
        info!("✅ Started health monitor every {:?}", period);

        let router = self.router.clone();
        let period = Duration::from_secs(self.config.monitoring.maintenance_interval_secs.max(1));
        self.maintenance_handle = Some(tokio::spawn(async move {
            Self::maintenance_loop(router, period).await;
        }));

        Ok(())
    }

    /// Abort the background loops. The router stays usable.
    pub async fn stop(&mut self) -> Result<()> {
        info!("🛑 Stopping call engine server...");
        for handle in [
            self.drain_handle.take(),
            self.health_handle.take(),
            self.maintenance_handle.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
            let _ = handle.await;
        }
        info!("✅ Call engine server stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.drain_handle.is_some()
    }

    pub fn router(&self) -> &Arc<CallRouter> {
        &self.router
    }

    pub fn config(&self) -> &CallEngineConfig {
        &self.config
    }

    /// Directives for callers leaving a queue, as produced by the drain loop.
    pub fn subscribe_directives(&self) -> broadcast::Receiver<RoutingDirective> {
        self.directives.subscribe()
    }

    /// Live notification feed; `None` when notifications are disabled.
    pub fn subscribe_notifications(&self) -> Option<broadcast::Receiver<Notification>> {
        self.notifications.as_ref().map(|n| n.subscribe())
    }

    async fn drain_loop(router: Arc<CallRouter>, directives: broadcast::Sender<RoutingDirective>, period: Duration) {
        info!("🔄 Queue drain loop running");
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match router.drain_all().await {
                Ok(drained) => {
                    for directive in drained {
                        debug!("Drained {} -> {}", directive.session_id, directive.action.name());
                        // No subscriber just means nobody is listening yet.
                        let _ = directives.send(directive);
                    }
                }
                Err(e) => error!("Error draining queues: {}", e),
            }
        }
    }

    async fn health_loop(router: Arc<CallRouter>, period: Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            match router.trigger().check_queue_health(Utc::now()).await {
                Ok(sent) if !sent.is_empty() => info!("📣 {} queue alert(s) sent", sent.len()),
                Ok(_) => {}
                Err(e) => error!("Queue health check failed: {}", e),
            }

            match router.health_report().await {
                Ok(report) if report.is_healthy() => debug!("System healthy"),
                Ok(report) => warn!(
                    "⚠️ System health {}: {} issue(s)",
                    report.severity.as_str(),
                    report.issues.len()
                ),
                Err(e) => error!("System health check failed: {}", e),
            }
        }
    }

    async fn maintenance_loop(router: Arc<CallRouter>, period: Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            match router.run_maintenance().await {
                Ok(purged) if purged > 0 => info!("🧹 Purged {} old queue entries", purged),
                Ok(_) => {}
                Err(e) => error!("Maintenance failed: {}", e),
            }
        }
    }
}

impl Drop for CallEngineServer {
    fn drop(&mut self) {
        for handle in [&self.drain_handle, &self.health_handle, &self.maintenance_handle]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

/// Builder for [`CallEngineServer`]
///
/// ```
/// use crm_call_engine::server::CallEngineServerBuilder;
///
/// # tokio_test::block_on(async {
/// let server = CallEngineServerBuilder::new()
///     .with_in_memory_database()
///     .build()
///     .await
///     .unwrap();
/// assert!(!server.is_running());
/// assert!(server.subscribe_notifications().is_some());
/// # });
/// ```
pub struct CallEngineServerBuilder {
    config: CallEngineConfig,
    database_url: Option<String>,
    database: Option<DatabaseManager>,
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl CallEngineServerBuilder {
    pub fn new() -> Self {
        Self {
            config: CallEngineConfig::default(),
            database_url: None,
            database: None,
            notifiers: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: CallEngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Override `database.url` from the configuration.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_in_memory_database(self) -> Self {
        self.with_database_url("sqlite::memory:")
    }

    /// Use an already opened database.
    pub fn with_database(mut self, db: DatabaseManager) -> Self {
        self.database = Some(db);
        self
    }

    /// Deliver notifications to `notifier` as well as the configured sinks.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    pub async fn build(self) -> Result<CallEngineServer> {
        let mut config = self.config;
        if let Some(url) = self.database_url {
            config.database.url = url;
        }
        config.validate().map_err(CallEngineError::Configuration)?;

        let db = match self.database {
            Some(db) => db,
            None => DatabaseManager::with_config(&config.database).await?,
        };

        let notifications = Arc::new(BroadcastNotifier::new(config.notifications.channel_capacity.max(1)));
        let mut sinks = CompositeNotifier::new().with(notifications.clone());
        if config.notifications.log_notifications {
            sinks = sinks.with(Arc::new(LogNotifier));
        }
        if config.notifications.persist {
            sinks = sinks.with(Arc::new(StoreNotifier::new(db.clone())));
        }
        for notifier in self.notifiers {
            sinks = sinks.with(notifier);
        }
        debug!("Notification fan-out to {} sink(s)", sinks.len());

        let (directives, _) = broadcast::channel(config.notifications.channel_capacity.max(1));
        let router = Arc::new(CallRouter::new(db, config.clone(), Arc::new(sinks)));

        Ok(CallEngineServer {
            router,
            notifications: config.notifications.enabled.then_some(notifications),
            config,
            directives,
            drain_handle: None,
            health_handle: None,
            maintenance_handle: None,
        })
    }
}

impl Default for CallEngineServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
