use super::request::Request;
use super::request_job::RequestDispatcher;
use super::response::Response;
use crate::worker_pool::WorkerPool;
use may::coroutine::JoinHandle;
use may_minihttp::{HttpServer, HttpService};
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// `may_minihttp` service that turns every request into a pool job.
///
/// Each connection coroutine blocks in `call` until its job completes, so the
/// number of requests executing at once is bounded by the pool size.
#[derive(Clone)]
pub struct QueueService {
    dispatcher: RequestDispatcher,
}

impl QueueService {
    pub fn new(dispatcher: RequestDispatcher) -> Self {
        Self { dispatcher }
    }
}

impl HttpService for QueueService {
    fn call(&mut self, req: may_minihttp::Request, res: &mut may_minihttp::Response) -> io::Result<()> {
        let response = match Request::from_http(req) {
            Ok(request) => self.dispatcher.serve(request),
            Err(e) => {
                warn!(error = %e, "Malformed HTTP request");
                Response::error(400, "Bad Request")
            }
        };
        response.write_http(res);
        Ok(())
    }
}

/// Bind `addr` and serve HTTP on a background coroutine.
///
/// Returns the address actually bound. `may_minihttp` binds its own listener,
/// so port 0 is resolved first by binding and releasing an ephemeral port; a
/// process that grabs the port in between makes the start fail.
///
/// # Errors
///
/// An invalid address or a bind failure.
pub fn start_http(
    dispatcher: RequestDispatcher,
    addr: &str,
) -> io::Result<(SocketAddr, JoinHandle<()>)> {
    let mut addr = resolve(addr)?;
    if addr.port() == 0 {
        addr = std::net::TcpListener::bind(addr)?.local_addr()?;
    }
    let handle = HttpServer(QueueService::new(dispatcher)).start(addr)?;
    debug!(addr = %addr, "HTTP listener started");
    Ok((addr, handle))
}

pub(crate) fn resolve(addr: &str) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid address"))
}

/// Handle to a running listener and the pool behind it.
pub struct ServerHandle {
    addr: SocketAddr,
    handle: JoinHandle<()>,
    pool: WorkerPool,
}

impl ServerHandle {
    pub(crate) fn new(addr: SocketAddr, handle: JoinHandle<()>, pool: WorkerPool) -> Self {
        Self { addr, handle, pool }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Wait for the listener to accept connections
    ///
    /// Polls the address with TCP connects, up to ~250ms (50 attempts × 5ms).
    ///
    /// # Errors
    ///
    /// `TimedOut` if the listener never answers.
    pub fn wait_ready(&self) -> io::Result<()> {
        let probe = match self.addr.ip() {
            ip if ip.is_unspecified() => SocketAddr::from(([127, 0, 0, 1], self.addr.port())),
            _ => self.addr,
        };
        for _ in 0..50 {
            if TcpStream::connect(probe).is_ok() {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(5));
        }
        Err(io::Error::new(io::ErrorKind::TimedOut, "server not ready"))
    }

    /// Stop accepting, shut the pool down and wait for in-flight jobs.
    #[allow(unsafe_code)]
    pub fn stop(self) {
        self.pool.stop();
        // SAFETY: `cancel` is unsafe in may because it unwinds the target at its
        // next yield. The accept loop only holds its listener socket and clones
        // of the dispatcher, both of which are fine to drop mid-accept.
        unsafe {
            self.handle.coroutine().cancel();
        }
        if self.handle.join().is_err() {
            debug!(addr = %self.addr, "Listener coroutine cancelled");
        }
        self.pool.wait_stopped();
    }

    /// Block until the listener coroutine exits.
    ///
    /// # Errors
    ///
    /// The panic payload if the listener coroutine panicked.
    pub fn join(self) -> std::thread::Result<()> {
        self.handle.join()
    }
}
