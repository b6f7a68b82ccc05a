use super::fastcgi::start_fastcgi;
use super::http_server::{start_http, ServerHandle};
use super::request_job::RequestDispatcher;
use super::router::Router;
use crate::config::{ServerConfig, ServerType};
use crate::error::PoolError;
use crate::worker_pool::{PoolConfig, WorkerPool};
use anyhow::{Context, Result};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{error, info};

/// A named server owning one worker pool and one listener.
///
/// The pool is created with the server and started by [`start`](Self::start).
/// Every accepted request becomes one job on that pool; the connection waits
/// for the job before answering.
pub struct Server {
    name: String,
    config: ServerConfig,
    pool: WorkerPool,
    router: Arc<dyn Router>,
    started_at: OnceLock<Instant>,
}

impl Server {
    /// # Errors
    ///
    /// [`PoolError::InvalidConfig`] if the effective pool sizing is unusable.
    pub fn new<R: Router>(config: ServerConfig, router: R) -> Result<Self, PoolError> {
        Self::with_router(config, Arc::new(router))
    }

    /// Same as [`new`](Self::new) for an already shared router.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidConfig`] if the effective pool sizing is unusable.
    pub fn with_router(config: ServerConfig, router: Arc<dyn Router>) -> Result<Self, PoolError> {
        let name = config.name().to_string();
        let pool = WorkerPool::new(name.clone(), PoolConfig::from(&config))?;
        Ok(Self {
            name,
            config,
            pool,
            router,
            started_at: OnceLock::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// When `start` succeeded, if it has
    pub fn started_at(&self) -> Option<Instant> {
        self.started_at.get().copied()
    }

    /// Time since `start`, zero before it
    pub fn uptime(&self) -> Duration {
        self.started_at()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    /// Start the pool, bind the listener and serve in the background.
    ///
    /// Binding happens before this returns, so address problems surface here.
    ///
    /// # Errors
    ///
    /// Pool start failures and listener bind failures. The pool is stopped
    /// again if the listener cannot be bound.
    pub fn start(&self) -> Result<ServerHandle> {
        let addr = self.config.addr();
        let server_type = self.config.server_type();

        self.pool
            .start()
            .with_context(|| format!("[Server:{}] cannot start worker pool", self.name))?;

        let dispatcher = RequestDispatcher::new(
            self.pool.clone(),
            Arc::clone(&self.router),
            self.config.request_timeout(),
        );
        let bound = match server_type {
            ServerType::Http => start_http(dispatcher, &addr),
            ServerType::Fcgi => start_fastcgi(dispatcher, &addr),
        };
        let (local, handle) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                error!(server = %self.name, addr = %addr, error = %e, "Listener failed to start");
                self.pool.stop();
                return Err(e).with_context(|| {
                    format!("[Server:{}] cannot listen on {addr}", self.name)
                });
            }
        };

        // A second start fails on the pool above, so this is the first set
        self.started_at.get_or_init(Instant::now);
        info!(
            server = %self.name,
            addr = %local,
            transport = %server_type,
            workers = self.pool.config().workers,
            queue_depth = self.pool.config().queue_depth,
            "Server listening"
        );
        Ok(ServerHandle::new(local, handle, self.pool.clone()))
    }

    /// Start and block serving until the listener exits.
    ///
    /// # Errors
    ///
    /// Startup failures, or a panicked listener.
    pub fn run(&self) -> Result<()> {
        let handle = self.start()?;
        handle
            .join()
            .map_err(|_| anyhow::anyhow!("[Server:{}] listener terminated abnormally", self.name))
    }

    /// Stop the worker pool without waiting. Requests that still arrive are
    /// answered `503`. Use [`ServerHandle::stop`] to also close the listener
    /// and wait for the drain.
    pub fn stop(&self) {
        self.close();
    }

    /// Stop the worker pool. Fire-and-forget.
    pub fn close(&self) {
        info!(server = %self.name, uptime_s = self.uptime().as_secs_f64(), "Server stopping");
        self.pool.stop();
    }
}
