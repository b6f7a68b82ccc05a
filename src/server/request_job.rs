//! One inbound request as a pool job.
//!
//! The connection coroutine builds a [`RequestJob`], dispatches it, and blocks
//! on the job's completion. The worker runs the router and parks the finished
//! [`Response`] in a shared [`Reply`] slot that the connection then takes.
//!
//! | Outcome | Status |
//! |---|---|
//! | router returned `Ok` | whatever the router set |
//! | router returned `Err` | 500 |
//! | router panicked | 500 |
//! | pool shutting down / job rejected | 503 |
//! | `request_timeout` elapsed | 504, late result discarded |

use super::request::Request;
use super::response::Response;
use super::router::Router;
use crate::error::PoolError;
use crate::ids::RequestId;
use crate::job::{Job, Work};
use crate::worker::WorkerInfo;
use crate::worker_pool::WorkerPool;
use http::Method;
use may::sync::Mutex;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct ReplyState {
    response: Option<Response>,
    abandoned: bool,
}

/// Hand-off slot for a finished response.
///
/// Written once by the worker, taken once by the waiting connection. If the
/// waiter gave up first the late response is dropped here.
#[derive(Default)]
pub struct Reply {
    state: Mutex<ReplyState>,
}

impl Reply {
    fn lock(&self) -> may::sync::MutexGuard<'_, ReplyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store the response. Returns `false` when the waiter already left.
    pub fn put(&self, response: Response) -> bool {
        let mut state = self.lock();
        if state.abandoned {
            return false;
        }
        state.response = Some(response);
        true
    }

    pub fn take(&self) -> Option<Response> {
        self.lock().response.take()
    }

    /// Mark the waiter as gone, dropping anything already stored.
    pub fn abandon(&self) -> Option<Response> {
        let mut state = self.lock();
        state.abandoned = true;
        state.response.take()
    }
}

/// Identity of a request, kept outside the request itself for log lines
/// written after the request has been consumed.
#[derive(Debug, Clone)]
struct RequestMeta {
    request_id: RequestId,
    method: Method,
    path: String,
    remote_addr: String,
}

/// The [`Work`] that runs one request through the router.
pub struct RequestJob {
    request: Option<Request>,
    meta: RequestMeta,
    router: Arc<dyn Router>,
    reply: Arc<Reply>,
    started: Instant,
}

impl RequestJob {
    /// Wrap `request`; the returned slot receives the response.
    pub fn new(request: Request, router: Arc<dyn Router>) -> (Self, Arc<Reply>) {
        let reply = Arc::new(Reply::default());
        let meta = RequestMeta {
            request_id: request.request_id,
            method: request.method.clone(),
            path: request.path.clone(),
            remote_addr: request.remote_addr.clone(),
        };
        let job = Self {
            request: Some(request),
            meta,
            router,
            reply: Arc::clone(&reply),
            started: Instant::now(),
        };
        (job, reply)
    }

    fn finish(&self, worker: &WorkerInfo, response: Response) {
        info!(
            request_id = %self.meta.request_id,
            worker = %worker,
            remote_addr = %self.meta.remote_addr,
            method = %self.meta.method,
            path = %self.meta.path,
            status = response.status(),
            elapsed_s = self.started.elapsed().as_secs_f64(),
            "Request served"
        );
        self.store(response);
    }

    fn store(&self, response: Response) {
        if !self.reply.put(response) {
            debug!(
                request_id = %self.meta.request_id,
                "Discarding late result, waiter timed out"
            );
        }
    }
}

impl Work for RequestJob {
    fn execute(&mut self, worker: &WorkerInfo) {
        let Some(request) = self.request.take() else {
            return;
        };
        let mut response = Response::default();
        let response = match self.router.handle(&request, &mut response) {
            Ok(()) => response,
            Err(e) => {
                error!(
                    request_id = %self.meta.request_id,
                    worker = %worker,
                    method = %self.meta.method,
                    path = %self.meta.path,
                    error = %e,
                    "Router failed"
                );
                Response::internal_error()
            }
        };
        self.finish(worker, response);
    }

    fn fault(&mut self, worker: &WorkerInfo, message: &str) {
        error!(
            request_id = %self.meta.request_id,
            worker = %worker,
            method = %self.meta.method,
            path = %self.meta.path,
            panic_message = %message,
            "Router panicked"
        );
        self.finish(worker, Response::internal_error());
    }

    fn rejected(&mut self) {
        debug!(
            request_id = %self.meta.request_id,
            method = %self.meta.method,
            path = %self.meta.path,
            "Request discarded by pool shutdown"
        );
        self.store(Response::service_unavailable());
    }
}

/// Request-to-response path shared by the HTTP and FastCGI transports.
#[derive(Clone)]
pub struct RequestDispatcher {
    pool: WorkerPool,
    router: Arc<dyn Router>,
    timeout: Option<Duration>,
}

impl RequestDispatcher {
    pub fn new(pool: WorkerPool, router: Arc<dyn Router>, timeout: Option<Duration>) -> Self {
        Self {
            pool,
            router,
            timeout,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Dispatch `request` to the pool and block until its response is ready.
    ///
    /// May block in `dispatch` while the backlog is full.
    pub fn serve(&self, request: Request) -> Response {
        let request_id = request.request_id;
        let (work, reply) = RequestJob::new(request, Arc::clone(&self.router));
        let job = Job::new(work);
        let handle = job.handle();

        if let Err(e) = self.pool.dispatch(job) {
            warn!(
                request_id = %request_id,
                pool = %self.pool.name(),
                error = %e,
                "Request refused by worker pool"
            );
            return Response::service_unavailable();
        }

        let waited = match self.timeout {
            Some(limit) => handle.wait_deadline(limit),
            None => handle.wait(),
        };

        match waited {
            Ok(()) => reply.take().unwrap_or_else(|| {
                error!(request_id = %request_id, "Job completed without a response");
                Response::internal_error()
            }),
            Err(PoolError::Timeout(limit)) => {
                warn!(
                    request_id = %request_id,
                    timeout_ms = limit.as_millis() as u64,
                    "Request timed out waiting for a worker result"
                );
                if reply.abandon().is_some() {
                    debug!(request_id = %request_id, "Discarding late result, waiter timed out");
                }
                Response::gateway_timeout()
            }
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "Request rejected by worker pool");
                reply.take().unwrap_or_else(Response::service_unavailable)
            }
        }
    }
}
