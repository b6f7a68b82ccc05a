//! # webqueue
//!
//! A bounded-concurrency request dispatcher: a fixed pool of worker coroutines
//! sits between the network accept path and the code that handles each
//! request, so that a burst of connections never turns into unbounded
//! concurrent work.
//!
//! ## Architecture
//!
//! ```text
//!   connection ──▶ RequestJob ──dispatch──▶ backlog (M) ──┐
//!      ▲                                                   ├─ dispatch loop ─▶ worker intake
//!      └──────────── wait() ◀── Completion ◀── worker ◀────┘   availability (N)
//! ```
//!
//! - **[`job`]** - `Job`, its one-shot `Completion`, and the `Work` payload trait
//! - **[`worker`]** - long-lived worker coroutines running one job at a time
//! - **[`worker_pool`]** - availability + backlog queues and the dispatch loop
//! - **[`queue`]** - the bounded, closable FIFO queue under all of the above
//! - **[`server`]** - HTTP (`may_minihttp`) and FastCGI transports feeding the pool
//! - **[`config`]** / **[`runtime_config`]** / **[`logging`]** - ambient setup
//!
//! ## Example
//!
//! ```no_run
//! use webqueue::config::ServerConfig;
//! use webqueue::server::{Request, Response, Server};
//!
//! let server = Server::new(ServerConfig::default(), |req: &Request, res: &mut Response| -> anyhow::Result<()> {
//!     res.set_text(format!("hello from {}", req.path));
//!     Ok(())
//! })?;
//! let handle = server.start()?;
//! handle.wait_ready()?;
//! handle.stop();
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! ## Guarantees
//!
//! - At most N jobs execute at once; at most M wait in the backlog
//! - A full backlog blocks the submitter instead of dropping work
//! - Shutdown finishes in-flight jobs and rejects queued ones explicitly

pub mod config;
pub mod echo;
pub mod error;
pub mod ids;
pub mod job;
pub mod logging;
pub mod queue;
pub mod runtime_config;
pub mod server;
pub mod worker;
pub mod worker_pool;

pub use error::PoolError;
pub use ids::RequestId;
pub use job::{Completion, CompletionState, Job, JobHandle, Work};
pub use worker::WorkerInfo;
pub use worker_pool::{PoolConfig, PoolStats, WorkerPool};
